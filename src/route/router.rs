//! Route tree registration and the per-request dispatch walk.
//!
//! Routes are registered on a [`RouterBuilder`] before the server starts;
//! the built [`Router`] is immutable and shared read-only by every
//! connection. Dispatch walks the tree depth-first, trying children in
//! registration order: the first structural match at each level wins, which
//! makes registration order semantically significant.

use crate::{
    errors::Error,
    http::{
        request::{Request, Submatch},
        response::Response,
    },
    route::{pattern::Pattern, MAX_ROUTE_DEPTH},
    server::server_impl::Handler,
    Methods, StatusCode,
};
use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU32, Ordering},
};

/// Boxed future returned by [`RouteHandler::handle`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a route handler invocation.
///
/// Drives the dispatcher and, through it, the connection engine:
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    /// This route declined the request; dispatch keeps walking the tree.
    NotProcessed,
    /// The request was handled; dispatch stops.
    Processed,
    /// The request was handled and the connection must be terminated after
    /// the response is flushed. The only application-level mechanism for
    /// abrupt connection termination.
    ConnectionClose,
    /// Short-circuit with `403 Forbidden`.
    Forbidden,
    /// Short-circuit with `400 Bad Request`.
    BadRequest,
    /// Short-circuit with `500 Internal Server Error`.
    InternalError,
    /// Short-circuit with `501 Not Implemented`.
    NotImplemented,
}

impl RouteResult {
    /// The response status a short-circuit result maps to.
    #[inline(always)]
    pub(crate) const fn status(self) -> Option<StatusCode> {
        match self {
            RouteResult::Forbidden => Some(StatusCode::Forbidden),
            RouteResult::BadRequest => Some(StatusCode::BadRequest),
            RouteResult::InternalError => Some(StatusCode::InternalServerError),
            RouteResult::NotImplemented => Some(StatusCode::NotImplemented),
            _ => None,
        }
    }
}

/// A handler bound to one route.
///
/// Implemented directly for stateful handlers, or produced from a closure
/// with [`route_fn`]. Handlers are trait objects so one tree can mix
/// implementations freely.
pub trait RouteHandler: Send + Sync + 'static {
    /// Processes a request that structurally matched this route.
    fn handle<'a>(
        &'a self,
        request: &'a mut Request<'_>,
        response: &'a mut Response,
    ) -> BoxFuture<'a, RouteResult>;
}

/// Wraps a synchronous closure as a [`RouteHandler`].
///
/// # Examples
/// ```
/// use weft::{route_fn, Route, RouteResult, StatusCode};
///
/// let route = Route::new("/ping").handler(route_fn(|_req, resp| {
///     resp.status(StatusCode::Ok).body("pong");
///     RouteResult::Processed
/// }));
/// ```
pub fn route_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Request<'_>, &mut Response) -> RouteResult + Send + Sync + 'static,
{
    FnHandler(f)
}

/// A [`RouteHandler`] backed by a plain closure. See [`route_fn`].
pub struct FnHandler<F>(F);

impl<F> RouteHandler for FnHandler<F>
where
    F: Fn(&mut Request<'_>, &mut Response) -> RouteResult + Send + Sync + 'static,
{
    fn handle<'a>(
        &'a self,
        request: &'a mut Request<'_>,
        response: &'a mut Response,
    ) -> BoxFuture<'a, RouteResult> {
        let result = (self.0)(request, response);
        Box::pin(std::future::ready(result))
    }
}

/// Identifier of a registered route.
///
/// Carries the id of the builder that issued it, so a route can never be
/// attached under a parent from a different router context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId {
    pub(crate) ctx: u32,
    pub(crate) index: u32,
}

/// Specification of a route prior to registration.
///
/// # Examples
/// ```
/// use weft::{route_fn, Methods, Route, RouteResult, StatusCode};
///
/// let route = Route::new("/user/([0-9]+)")
///     .methods(Methods::GET | Methods::HEAD)
///     .tag("user-by-id")
///     .handler(route_fn(|req, resp| {
///         let id = req.submatch(0).unwrap_or("?").to_string();
///         resp.status(StatusCode::Ok).body(id);
///         RouteResult::Processed
///     }));
/// ```
pub struct Route {
    pattern: String,
    methods: Methods,
    prefix: bool,
    handler: Option<Box<dyn RouteHandler>>,
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
    tag: Option<String>,
}

impl Route {
    /// Starts a route spec for the given pattern. Routes default to exact
    /// matching and all methods.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            methods: Methods::ALL,
            prefix: false,
            handler: None,
            dispose: None,
            tag: None,
        }
    }

    /// Restricts the route to the given method mask.
    pub fn methods(mut self, methods: impl Into<Methods>) -> Self {
        self.methods = methods.into();
        self
    }

    /// Makes this a prefix route: its pattern consumes only the leading
    /// portion of the path and the remainder is passed on to its children.
    pub fn prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    /// Attaches the handler invoked when this route matches. A route
    /// without a handler is a pure grouping node.
    pub fn handler(mut self, handler: impl RouteHandler) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Registers a hook run when the router is dropped. Useful for tearing
    /// down per-route resources.
    pub fn on_dispose(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.dispose = Some(Box::new(hook));
        self
    }

    /// Attaches a diagnostic tag shown in logs.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

struct Node {
    pattern: Option<Pattern>,
    methods: Methods,
    prefix: bool,
    handler: Option<Box<dyn RouteHandler>>,
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
    tag: Option<String>,
    depth: usize,
    children: Vec<u32>,
}

static NEXT_CTX: AtomicU32 = AtomicU32::new(1);

/// Builder for a [`Router`]. Owns the whole tree top-down; parent linkage
/// is by [`RouteId`] index, never by back-pointer.
pub struct RouterBuilder {
    ctx: u32,
    nodes: Vec<Node>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            ctx: NEXT_CTX.fetch_add(1, Ordering::Relaxed),
            nodes: vec![Node {
                pattern: None,
                methods: Methods::ALL,
                prefix: true,
                handler: None,
                dispose: None,
                tag: None,
                depth: 0,
                children: Vec::new(),
            }],
        }
    }

    /// The implicit root; consumes nothing and matches every request.
    #[inline(always)]
    pub fn root(&self) -> RouteId {
        RouteId {
            ctx: self.ctx,
            index: 0,
        }
    }

    /// Registers a route under the root.
    pub fn route(&mut self, spec: Route) -> Result<RouteId, Error> {
        self.mount(self.root(), spec)
    }

    /// Registers a route under `parent`.
    ///
    /// Fails fast, before the server ever accepts traffic: pattern syntax
    /// errors, foreign parents, bad method masks and over-deep nesting are
    /// all rejected here.
    pub fn mount(&mut self, parent: RouteId, spec: Route) -> Result<RouteId, Error> {
        if parent.ctx != self.ctx || parent.index as usize >= self.nodes.len() {
            return Err(Error::ForeignParentRoute);
        }
        if spec.methods.is_empty() || spec.methods.has_unknown_bits() {
            return Err(Error::UnsupportedHttpMethod);
        }

        let depth = self.nodes[parent.index as usize].depth + 1;
        if depth > MAX_ROUTE_DEPTH {
            return Err(Error::MaxNestedRoutes);
        }

        let pattern = Pattern::compile(&spec.pattern)?;
        tracing::debug!(
            pattern = %pattern.source(),
            prefix = spec.prefix,
            tag = spec.tag.as_deref().unwrap_or(""),
            "route registered"
        );

        let index = self.nodes.len() as u32;
        self.nodes.push(Node {
            pattern: Some(pattern),
            methods: spec.methods,
            prefix: spec.prefix,
            handler: spec.handler,
            dispose: spec.dispose,
            tag: spec.tag,
            depth,
            children: Vec::new(),
        });
        self.nodes[parent.index as usize].children.push(index);

        Ok(RouteId {
            ctx: self.ctx,
            index,
        })
    }

    /// Finalizes the tree. The router is immutable from here on and can be
    /// shared by any number of connections.
    pub fn build(self) -> Router {
        Router {
            ctx: self.ctx,
            nodes: self.nodes,
        }
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The immutable route tree and its dispatcher.
pub struct Router {
    ctx: u32,
    nodes: Vec<Node>,
}

impl Router {
    /// Starts a new [`RouterBuilder`].
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Returns the diagnostic tag of a route.
    pub fn tag(&self, route: RouteId) -> Option<&str> {
        if route.ctx != self.ctx {
            return None;
        }
        self.nodes.get(route.index as usize)?.tag.as_deref()
    }

    /// Walks the tree for one request.
    ///
    /// Returns [`RouteResult::NotProcessed`] when no route claimed the
    /// request; the connection engine turns that into `404 Not Found`.
    pub async fn dispatch(&self, request: &mut Request<'_>, response: &mut Response) -> RouteResult {
        let base = request.unmatched;
        self.dispatch_children(0, base, request, response).await
    }

    fn dispatch_children<'a>(
        &'a self,
        node: u32,
        base: usize,
        request: &'a mut Request<'_>,
        response: &'a mut Response,
    ) -> BoxFuture<'a, RouteResult> {
        Box::pin(async move {
            for &child_index in &self.nodes[node as usize].children {
                let child = &self.nodes[child_index as usize];
                if !child.methods.contains(request.method()) {
                    continue;
                }

                // Only the root lacks a pattern, and it is never a child
                let Some(pattern) = child.pattern.as_ref() else {
                    continue;
                };
                let suffix = &request.path()[base..];
                let Some(found) = pattern.match_suffix(suffix, child.prefix) else {
                    continue;
                };

                let mark = request.submatches.len();
                for &(start, end) in &found.captures {
                    request.submatches.push(Submatch {
                        start: base + start,
                        end: base + end,
                        route: RouteId {
                            ctx: self.ctx,
                            index: child_index,
                        },
                    });
                }
                let consumed_to = base + found.consumed;
                request.unmatched = consumed_to;

                let mut result = RouteResult::NotProcessed;
                if let Some(handler) = &child.handler {
                    tracing::trace!(
                        tag = child.tag.as_deref().unwrap_or(""),
                        suffix,
                        "route matched"
                    );
                    result = handler.handle(request, response).await;
                }
                if result == RouteResult::NotProcessed && child.prefix {
                    result = self
                        .dispatch_children(child_index, consumed_to, request, response)
                        .await;
                }

                if result != RouteResult::NotProcessed {
                    return result;
                }

                // Declined: this child's captures and consumption are
                // rolled back before the next sibling is tried
                request.submatches.truncate(mark);
                request.unmatched = base;
            }

            RouteResult::NotProcessed
        })
    }
}

impl Handler for Router {
    async fn handle(&self, request: &mut Request<'_>, response: &mut Response) -> RouteResult {
        self.dispatch(request, response).await
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        for node in &mut self.nodes {
            if let Some(hook) = node.dispose.take() {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod registration_tests {
    use super::*;

    #[test]
    fn foreign_parent_rejected() {
        let mut first = RouterBuilder::new();
        let mut second = RouterBuilder::new();

        let parent = first.route(Route::new("/api").prefix()).unwrap();
        let err = second.mount(parent, Route::new("/ping")).unwrap_err();
        assert!(matches!(err, Error::ForeignParentRoute));
    }

    #[test]
    fn method_mask_validated() {
        let mut builder = RouterBuilder::new();
        assert!(matches!(
            builder.route(Route::new("/x").methods(Methods(0))),
            Err(Error::UnsupportedHttpMethod)
        ));
        assert!(matches!(
            builder.route(Route::new("/x").methods(Methods(0x9000))),
            Err(Error::UnsupportedHttpMethod)
        ));
    }

    #[test]
    fn pattern_errors_surface_at_registration() {
        let mut builder = RouterBuilder::new();
        assert!(matches!(
            builder.route(Route::new("/user/([0-9]+")),
            Err(Error::RegexpSubexp)
        ));
    }

    #[test]
    fn depth_capped() {
        let mut builder = RouterBuilder::new();
        let mut parent = builder.root();

        for _ in 0..MAX_ROUTE_DEPTH {
            parent = builder
                .mount(parent, Route::new("/n").prefix())
                .unwrap();
        }

        assert!(matches!(
            builder.mount(parent, Route::new("/too-deep")),
            Err(Error::MaxNestedRoutes)
        ));
    }

    #[test]
    fn tags_resolve() {
        let mut builder = RouterBuilder::new();
        let id = builder
            .route(Route::new("/health").tag("health-check"))
            .unwrap();
        let router = builder.build();

        assert_eq!(router.tag(id), Some("health-check"));
        assert_eq!(router.tag(router_root(&router)), None);
    }

    fn router_root(router: &Router) -> RouteId {
        RouteId {
            ctx: router.ctx,
            index: 0,
        }
    }

    #[test]
    fn dispose_hooks_run_on_drop() {
        use std::sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        };

        let disposed = Arc::new(AtomicUsize::new(0));
        let mut builder = RouterBuilder::new();
        for _ in 0..3 {
            let counter = disposed.clone();
            builder
                .route(Route::new("/r").on_dispose(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        let router = builder.build();
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
        drop(router);
        assert_eq!(disposed.load(Ordering::SeqCst), 3);
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use crate::http::request::Head;
    use crate::limits::RespLimits;
    use crate::Method;
    use std::sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc, Mutex,
    };

    fn respond(
        status: StatusCode,
        result: RouteResult,
    ) -> FnHandler<impl Fn(&mut Request<'_>, &mut Response) -> RouteResult + Send + Sync + 'static>
    {
        route_fn(move |_req, resp| {
            if result == RouteResult::Processed || result == RouteResult::ConnectionClose {
                resp.status(status).body("");
            }
            result
        })
    }

    async fn run(
        router: &Router,
        method: Method,
        target: &str,
    ) -> (RouteResult, Vec<String>, String) {
        let head = Head::for_test(method, target);
        let mut request = Request::for_test(&head);
        let mut response = Response::new(&RespLimits::default());

        let result = router.dispatch(&mut request, &mut response).await;
        let submatches = (0..request.submatch_count())
            .map(|i| request.submatch(i).unwrap().to_string())
            .collect();
        (result, submatches, request.path_unmatched().to_string())
    }

    #[tokio::test]
    async fn user_id_scenario() {
        let mut builder = RouterBuilder::new();
        builder
            .route(
                Route::new("/user/([0-9]+)")
                    .methods(Methods::GET)
                    .handler(respond(StatusCode::Ok, RouteResult::Processed)),
            )
            .unwrap();
        let router = builder.build();

        let (result, submatches, _) = run(&router, Method::Get, "/user/42").await;
        assert_eq!(result, RouteResult::Processed);
        assert_eq!(submatches, vec!["42"]);

        // Falls through to not-found
        let (result, submatches, _) = run(&router, Method::Get, "/user/abc").await;
        assert_eq!(result, RouteResult::NotProcessed);
        assert!(submatches.is_empty());
    }

    #[tokio::test]
    async fn nested_prefix_scenario() {
        let mut builder = RouterBuilder::new();
        let api = builder.route(Route::new("/api").prefix()).unwrap();
        builder
            .mount(
                api,
                Route::new("/ping").handler(respond(StatusCode::Ok, RouteResult::Processed)),
            )
            .unwrap();
        let router = builder.build();

        let (result, _, unmatched) = run(&router, Method::Get, "/api/ping").await;
        assert_eq!(result, RouteResult::Processed);
        assert_eq!(unmatched, "");

        // No matching child, no terminal handler on /api
        let (result, ..) = run(&router, Method::Get, "/api/other").await;
        assert_eq!(result, RouteResult::NotProcessed);
    }

    #[tokio::test]
    async fn parent_and_child_submatches_in_order() {
        let mut builder = RouterBuilder::new();
        let version = builder
            .route(Route::new("/v([0-9]+)").prefix())
            .unwrap();
        builder
            .mount(
                version,
                Route::new("/item/([a-z]+)")
                    .handler(respond(StatusCode::Ok, RouteResult::Processed)),
            )
            .unwrap();
        let router = builder.build();

        let (result, submatches, _) = run(&router, Method::Get, "/v2/item/shoe").await;
        assert_eq!(result, RouteResult::Processed);
        // Parent capture first, child capture second
        assert_eq!(submatches, vec!["2", "shoe"]);
    }

    #[tokio::test]
    async fn registration_order_is_significant() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let tracer = |name: &'static str, log: Arc<Mutex<Vec<&'static str>>>, result| {
            route_fn(move |_req: &mut Request<'_>, resp: &mut Response| {
                log.lock().unwrap().push(name);
                if result == RouteResult::Processed {
                    resp.status(StatusCode::Ok).body("");
                }
                result
            })
        };

        let mut builder = RouterBuilder::new();
        builder
            .route(
                Route::new("/x/([a-z]+)")
                    .handler(tracer("first", order.clone(), RouteResult::NotProcessed)),
            )
            .unwrap();
        builder
            .route(
                Route::new("/x/([a-z]+)")
                    .handler(tracer("second", order.clone(), RouteResult::Processed)),
            )
            .unwrap();
        builder
            .route(
                Route::new("/x/([a-z]+)")
                    .handler(tracer("third", order.clone(), RouteResult::Processed)),
            )
            .unwrap();
        let router = builder.build();

        let head = Head::for_test(Method::Get, "/x/abc");
        let mut request = Request::for_test(&head);
        let mut response = Response::new(&RespLimits::default());
        let result = router.dispatch(&mut request, &mut response).await;

        assert_eq!(result, RouteResult::Processed);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

        // The declined first route's capture was rolled back
        assert_eq!(request.submatch_count(), 1);
        assert_eq!(request.submatch_info(0).unwrap().route().index, 2);
    }

    #[tokio::test]
    async fn method_filtering() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let mut builder = RouterBuilder::new();
        builder
            .route(
                Route::new("/only-post")
                    .methods(Methods::POST)
                    .handler(route_fn(move |_req, resp| {
                        counter.fetch_add(1, AtomicOrdering::SeqCst);
                        resp.status(StatusCode::Ok).body("");
                        RouteResult::Processed
                    })),
            )
            .unwrap();
        let router = builder.build();

        let (result, ..) = run(&router, Method::Get, "/only-post").await;
        assert_eq!(result, RouteResult::NotProcessed);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 0);

        let (result, ..) = run(&router, Method::Post, "/only-post").await;
        assert_eq!(result, RouteResult::Processed);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forbidden_short_circuits_siblings() {
        let reached = Arc::new(AtomicUsize::new(0));
        let counter = reached.clone();

        let mut builder = RouterBuilder::new();
        builder
            .route(Route::new("/locked").handler(route_fn(|_req, _resp| {
                RouteResult::Forbidden
            })))
            .unwrap();
        builder
            .route(Route::new("/locked").handler(route_fn(move |_req, resp| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                resp.status(StatusCode::Ok).body("");
                RouteResult::Processed
            })))
            .unwrap();
        let router = builder.build();

        let (result, ..) = run(&router, Method::Get, "/locked").await;
        assert_eq!(result, RouteResult::Forbidden);
        assert_eq!(result.status(), Some(StatusCode::Forbidden));
        assert_eq!(reached.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_suffix_shrinks_during_descent() {
        let seen = Arc::new(Mutex::new(String::new()));
        let log = seen.clone();

        let mut builder = RouterBuilder::new();
        let api = builder.route(Route::new("/api").prefix()).unwrap();
        builder
            .mount(
                api,
                Route::new("/users").prefix().handler(route_fn(
                    move |req: &mut Request<'_>, _resp: &mut Response| {
                        *log.lock().unwrap() = req.path_unmatched().to_string();
                        RouteResult::NotProcessed
                    },
                )),
            )
            .unwrap();
        let router = builder.build();

        let (result, ..) = run(&router, Method::Get, "/api/users/7").await;
        assert_eq!(result, RouteResult::NotProcessed);
        // Inside the handler the prefix consumed by /api and /users is gone
        assert_eq!(*seen.lock().unwrap(), "/7");
    }

    #[tokio::test]
    async fn dispatch_terminates_on_deep_tree() {
        // A full-depth chain of prefix routes that all match zero-width
        let mut builder = RouterBuilder::new();
        let mut parent = builder.root();
        for _ in 0..MAX_ROUTE_DEPTH {
            parent = builder.mount(parent, Route::new("").prefix()).unwrap();
        }
        let router = builder.build();

        let (result, ..) = run(&router, Method::Get, "/anything").await;
        assert_eq!(result, RouteResult::NotProcessed);
    }
}
