//! weft - Embeddable, non-blocking HTTP(S) server with a declarative
//! regex-routing engine
//!
//! A host program registers a tree of routes (path patterns with regular
//! expression submatches, HTTP-method filters, nesting) and serves them
//! over plain or TLS-wrapped TCP. The connection engine is an incremental
//! state machine driven by the tokio reactor: it never blocks a thread on
//! network I/O, resumes parsing wherever a partial read left off, and
//! supports buffered and streamed (chunked) request bodies with
//! backpressure.
//!
//! # Features
//!
//! - **Declarative routing** - nested prefix/exact routes, registration
//!   order preserved, submatch capture via a restricted regex dialect
//!   compiled at registration time (fail fast, linear-time matching)
//! - **Streamed bodies** - chunked uploads pulled one chunk at a time by
//!   the handler; memory stays bounded regardless of body size
//! - **TLS termination** - rustls-based, certificates from files or
//!   in-memory buffers
//! - **Cookie sessions** - pluggable synchronous key-value store behind a
//!   32-character `sessionid` cookie
//! - **Security-first limits** - header count, token length, body sizes,
//!   distinct idle/active timeouts; every violation answered with a
//!   specific status before the connection is closed
//!
//! # Examples
//!
//! ```no_run
//! use weft::{route_fn, Methods, Route, RouteResult, Router, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut routes = Router::builder();
//!
//!     routes
//!         .route(
//!             Route::new("/user/([0-9]+)")
//!                 .methods(Methods::GET)
//!                 .handler(route_fn(|req, resp| {
//!                     let id = req.submatch(0).unwrap_or("?").to_string();
//!                     resp.status(StatusCode::Ok).body(id);
//!                     RouteResult::Processed
//!                 })),
//!         )
//!         .unwrap();
//!
//!     let api = routes.route(Route::new("/api").prefix()).unwrap();
//!     routes
//!         .mount(
//!             api,
//!             Route::new("/ping").handler(route_fn(|_req, resp| {
//!                 resp.status(StatusCode::Ok).body("pong");
//!                 RouteResult::Processed
//!             })),
//!         )
//!         .unwrap();
//!
//!     Server::builder()
//!         .listen([127, 0, 0, 1], 8080)
//!         .handler(routes.build())
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! Sessions and cookies:
//!
//! ```no_run
//! use weft::{route_fn, CookieOpts, Route, RouteResult, StatusCode};
//!
//! let login = Route::new("/login").handler(route_fn(|req, resp| {
//!     if req.session_put("user", "alice").is_err() {
//!         return RouteResult::InternalError;
//!     }
//!     resp.status(StatusCode::Ok)
//!         .cookie("theme", "dark", &CookieOpts::new().path("/").validity_sec(86400))
//!         .body("welcome");
//!     RouteResult::Processed
//! }));
//! ```

pub(crate) mod http {
    pub(crate) mod body;
    pub mod multipart;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
    pub(crate) mod tls;
}
pub(crate) mod errors;
pub mod limits;
pub(crate) mod route;
pub(crate) mod session;

pub use crate::{
    errors::Error,
    http::{
        body::{Body, BodyReader},
        multipart::FormPart,
        query,
        request::{FormKind, Request, Submatch},
        response::{BodyWriter, Response, WriteBuffer},
        types::{Header, Method, Methods, StatusCode, Version},
    },
    route::{
        router::{
            route_fn, BoxFuture, FnHandler, Route, RouteHandler, RouteId, RouteResult, Router,
            RouterBuilder,
        },
        MAX_ROUTE_DEPTH,
    },
    server::{
        server_impl::{Handler, Server, ServerBuilder},
        tls::TlsMaterial,
    },
    session::{
        CookieOpts, MemorySessionStore, SessionStore, SESSION_COOKIE_NAME, SESSION_ID_LEN,
    },
};
