//! Session-cookie reuse for one logical server connection.
//!
//! The server hands out a session token via `Set-Cookie`; replaying it lets
//! the server skip re-establishing session context. Basic auth is sent on
//! every request anyway, so dropping a cookie is always safe.

use std::time::{Duration, Instant};

/// Cookie name the server's session mechanism uses.
pub const DEFAULT_SESSION_TOKEN: &str = "JSESSIONIDSSO";

/// Idle time after which a stored cookie is no longer replayed.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    last_cookie: Option<String>,
    last_activity: Option<Instant>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cookie(&self) -> Option<&str> {
        self.last_cookie.as_deref()
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Decide what to send on the next call. A cookie idle for longer than
    /// `idle_window` is discarded first.
    pub fn cookie_for_request(&mut self, now: Instant, idle_window: Duration) -> Option<String> {
        if self.last_cookie.is_some() {
            let stale = self
                .last_activity
                .map_or(true, |last| now.saturating_duration_since(last) > idle_window);
            if stale {
                tracing::debug!("session cookie idle past {idle_window:?}, dropping it");
                self.last_cookie = None;
            }
        }
        self.last_cookie.clone()
    }

    /// Record a successful exchange. The cookie is replaced only when one of
    /// the `Set-Cookie` values carries `token_name`.
    pub fn record_success<'a>(
        &mut self,
        now: Instant,
        token_name: &str,
        set_cookies: impl IntoIterator<Item = &'a str>,
    ) {
        self.last_activity = Some(now);
        if let Some(cookie) = set_cookies
            .into_iter()
            .find_map(|header| session_cookie(header, token_name))
        {
            self.last_cookie = Some(cookie);
        }
    }

    pub fn clear(&mut self) {
        self.last_cookie = None;
        self.last_activity = None;
    }
}

/// `name=value` pair for `token_name` out of one `Set-Cookie` header value,
/// without attributes such as `Path` or `Secure`.
pub fn session_cookie(set_cookie: &str, token_name: &str) -> Option<String> {
    set_cookie
        .split([';', ','])
        .map(str::trim)
        .find(|part| {
            part.split_once('=')
                .is_some_and(|(name, value)| name.trim() == token_name && !value.trim().is_empty())
        })
        .map(str::to_string)
}
