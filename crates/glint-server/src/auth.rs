//! User-identity lookup seam.
//!
//! The actual account store (password file, SSO, ...) lives outside the
//! server core; the hub only needs to know whether the connection belongs
//! to an authenticated user and under which name.

use axum::http::HeaderMap;

pub trait UserSource: Send + Sync {
    /// The authenticated username for this request, if any.
    fn current_user(&self, headers: &HeaderMap) -> Option<String>;
}

/// Everyone is anonymous. The default when no account store is wired up.
pub struct NoAuth;

impl UserSource for NoAuth {
    fn current_user(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }
}
