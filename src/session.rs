//! Cookie-based sessions over a pluggable key-value store.
//!
//! The connection engine carries a session identifier in the
//! [`SESSION_COOKIE_NAME`] cookie. All storage is delegated to a
//! [`SessionStore`] implementation supplied at server construction; the
//! in-memory [`MemorySessionStore`] is the default and serves as the
//! reference implementation. Store calls are synchronous and must not touch
//! network state; a store that needs I/O should do its own buffering.

use crate::errors::Error;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Length of generated session identifiers.
pub const SESSION_ID_LEN: usize = 32;

/// Name of the cookie carrying the session identifier.
pub const SESSION_COOKIE_NAME: &str = "sessionid";

/// Pluggable session storage.
///
/// Implementations are shared across connections; any locking or per-key
/// atomicity discipline is the store's own responsibility. The engine
/// imposes no ordering on operations issued from different connections.
pub trait SessionStore: Send + Sync + 'static {
    /// Returns an owned copy of the value stored under `key`.
    fn get(&self, sid: &str, key: &str) -> Option<String>;

    /// Stores `value` under `key`.
    fn put(&self, sid: &str, key: &str, value: &str) -> Result<(), Error>;

    /// Removes `key` from the session.
    fn del(&self, sid: &str, key: &str);

    /// Removes the entire session.
    fn clear(&self, sid: &str);
}

/// Process-local session store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, sid: &str, key: &str) -> Option<String> {
        self.sessions
            .lock()
            .ok()?
            .get(sid)
            .and_then(|session| session.get(key).cloned())
    }

    fn put(&self, sid: &str, key: &str, value: &str) -> Result<(), Error> {
        self.sessions
            .lock()
            .map_err(|_| Error::SessionStore("poisoned lock".into()))?
            .entry(sid.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn del(&self, sid: &str, key: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some(session) = sessions.get_mut(sid) {
                session.remove(key);
            }
        }
    }

    fn clear(&self, sid: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(sid);
        }
    }
}

/// Per-request session accessor held by the request context.
pub(crate) struct SessionCtx {
    store: Arc<dyn SessionStore>,
    sid: Option<String>,
    fresh: bool,
}

impl SessionCtx {
    #[inline(always)]
    pub(crate) fn new(store: Arc<dyn SessionStore>, sid: Option<String>) -> Self {
        // A cookie of the wrong shape is ignored rather than rejected
        let sid = sid.filter(|sid| {
            sid.len() == SESSION_ID_LEN && sid.bytes().all(|b| b.is_ascii_alphanumeric())
        });

        Self {
            store,
            sid,
            fresh: false,
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.store.get(self.sid.as_deref()?, key)
    }

    pub(crate) fn put(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let sid = match &self.sid {
            Some(sid) => sid.clone(),
            None => {
                let sid = new_session_id();
                self.sid = Some(sid.clone());
                self.fresh = true;
                sid
            }
        };

        self.store.put(&sid, key, value)
    }

    pub(crate) fn del(&self, key: &str) {
        if let Some(sid) = &self.sid {
            self.store.del(sid, key);
        }
    }

    pub(crate) fn clear(&mut self) {
        if let Some(sid) = self.sid.take() {
            self.store.clear(&sid);
            self.fresh = false;
        }
    }

    /// Returns the session id if a new session was created during this
    /// request and its cookie still has to be sent.
    #[inline(always)]
    pub(crate) fn fresh_sid(&self) -> Option<&str> {
        match self.fresh {
            true => self.sid.as_deref(),
            false => None,
        }
    }
}

/// Generates a new random session identifier.
pub(crate) fn new_session_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    (0..SESSION_ID_LEN)
        .map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char)
        .collect()
}

// COOKIES

/// Attributes for a `Set-Cookie` header.
///
/// # Examples
/// ```
/// use weft::CookieOpts;
///
/// let opts = CookieOpts::new()
///     .path("/")
///     .validity_sec(3600)
///     .http_only(true)
///     .secure(true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CookieOpts {
    pub(crate) path: Option<String>,
    pub(crate) domain: Option<String>,
    /// Cookie lifetime in seconds, rendered as `Max-Age`. `0` leaves the
    /// cookie scoped to the browser session.
    pub(crate) validity_sec: u64,
    pub(crate) http_only: bool,
    pub(crate) secure: bool,
}

impl CookieOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn validity_sec(mut self, seconds: u64) -> Self {
        self.validity_sec = seconds;
        self
    }

    pub fn http_only(mut self, flag: bool) -> Self {
        self.http_only = flag;
        self
    }

    pub fn secure(mut self, flag: bool) -> Self {
        self.secure = flag;
        self
    }
}

/// Renders a complete `Set-Cookie` header value.
///
/// Cookie values are escaped per
/// [RFC 6265](https://datatracker.ietf.org/doc/html/rfc6265#section-4.1.1):
/// bytes outside the `cookie-octet` set are percent-encoded.
pub(crate) fn render_cookie(name: &str, value: &str, opts: &CookieOpts) -> String {
    let mut out = String::with_capacity(name.len() + value.len() + 32);
    out.push_str(name);
    out.push('=');
    escape_cookie_value(value, &mut out);

    if let Some(path) = &opts.path {
        out.push_str("; Path=");
        out.push_str(path);
    }
    if let Some(domain) = &opts.domain {
        out.push_str("; Domain=");
        out.push_str(domain);
    }
    if opts.validity_sec > 0 {
        out.push_str("; Max-Age=");
        out.push_str(&opts.validity_sec.to_string());
    }
    if opts.http_only {
        out.push_str("; HttpOnly");
    }
    if opts.secure {
        out.push_str("; Secure");
    }

    out
}

fn escape_cookie_value(value: &str, out: &mut String) {
    const HEX: &[u8] = b"0123456789ABCDEF";

    for byte in value.bytes() {
        let allowed = matches!(byte,
            0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E
        ) && byte != b'%';

        if allowed {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0F) as usize] as char);
        }
    }
}


#[cfg(test)]
mod cookie_tests {
    use super::*;

    #[test]
    fn plain_cookie() {
        let rendered = render_cookie("token", "abc123", &CookieOpts::new());
        assert_eq!(rendered, "token=abc123");
    }

    #[test]
    fn all_attributes() {
        let opts = CookieOpts::new()
            .path("/app")
            .domain("example.com")
            .validity_sec(86400)
            .http_only(true)
            .secure(true);

        assert_eq!(
            render_cookie("sessionid", "Xyz", &opts),
            "sessionid=Xyz; Path=/app; Domain=example.com; Max-Age=86400; HttpOnly; Secure"
        );
    }

    #[test]
    fn zero_validity_omits_max_age() {
        let rendered = render_cookie("k", "v", &CookieOpts::new().http_only(true));
        assert_eq!(rendered, "k=v; HttpOnly");
    }

    #[test]
    fn value_escaping() {
        let rendered = render_cookie("k", "a b;c\"d,e%f", &CookieOpts::new());
        assert_eq!(rendered, "k=a%20b%3Bc%22d%2Ce%25f");
    }
}
