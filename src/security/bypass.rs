//! Role-based throttle bypass.

use crate::auth::{Claims, Principal, Role};

/// Returns `true` when the request belongs to an administrator and should not
/// be counted against any rate limit.
///
/// An attached principal is authoritative when it is an admin. Otherwise
/// verified bearer-token claims carrying `role: admin` grant the bypass as
/// well, so admin tooling that talks to the gate directly is not throttled
/// before the authentication stage has run. Pass `None` for a token that is
/// missing or failed to verify.
pub fn should_skip(principal: Option<&Principal>, claims: Option<&Claims>) -> bool {
    principal.is_some_and(Principal::is_admin)
        || claims.is_some_and(|claims| claims.role == Some(Role::Admin))
}
