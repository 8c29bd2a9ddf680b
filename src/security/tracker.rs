//! Tracker resolution: decide which counter a request is charged against.
//!
//! Authenticated callers are tracked per account so that one user cannot dodge
//! a limit by rotating addresses; everyone else is tracked per client IP.

use std::fmt;

use crate::Request;
use crate::auth::{Claims, Principal};

/// The identity a request's rate-limit counters are keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerIdentity {
    /// A principal attached by an upstream authentication stage.
    User(String),
    /// A caller identified only by a verifiable bearer token.
    JwtUser(String),
    /// An unauthenticated caller identified by client address.
    Ip(String),
    /// No identifying information at all.
    Unknown,
}

impl CallerIdentity {
    /// The string used as the tracker portion of a counter key.
    ///
    /// Users and token holders share the `user:` namespace, so a caller keeps
    /// the same counter whether or not the authentication stage ran first.
    pub fn tracker_key(&self) -> String {
        self.to_string()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, CallerIdentity::User(_) | CallerIdentity::JwtUser(_))
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerIdentity::User(id) | CallerIdentity::JwtUser(id) => write!(f, "user:{id}"),
            CallerIdentity::Ip(addr) => write!(f, "ip:{addr}"),
            CallerIdentity::Unknown => f.write_str("ip:unknown"),
        }
    }
}

/// Resolves the identity a request is tracked under. First match wins:
///
/// 1. the attached principal's `id`, `stellarAddress` or `sub`;
/// 2. the subject of verified bearer-token claims;
/// 3. the first `X-Forwarded-For` entry;
/// 4. the first entry of the resolved client-IP list;
/// 5. the connection's peer address;
/// 6. [`CallerIdentity::Unknown`].
///
/// Never fails: without claims the request simply falls through to the
/// address rules.
pub fn resolve_tracker(
    principal: Option<&Principal>,
    request: &Request,
    claims: Option<&Claims>,
) -> CallerIdentity {
    if let Some(id) = principal.and_then(Principal::identifier) {
        return CallerIdentity::User(id.to_owned());
    }

    if let Some(subject) = claims.and_then(Claims::subject) {
        return CallerIdentity::JwtUser(subject.to_owned());
    }

    if let Some(addr) = forwarded_for(request) {
        return CallerIdentity::Ip(addr.to_owned());
    }

    if let Some(ip) = request.client_ips().first() {
        return CallerIdentity::Ip(ip.to_string());
    }

    match request.peer_addr() {
        Some(peer) => CallerIdentity::Ip(peer.ip().to_string()),
        None => CallerIdentity::Unknown,
    }
}

/// The originating client from `X-Forwarded-For`.
///
/// Several header lines mean several proxies each appended one; the first line
/// is the client. A single line may itself be a comma list.
fn forwarded_for(request: &Request) -> Option<&str> {
    let first = request.headers().get_all("x-forwarded-for").next()?;
    let addr = first.split(',').next().unwrap_or(first).trim();
    (!addr.is_empty()).then_some(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Role, testing};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn request(extra_headers: &str) -> Request {
        let raw = format!("GET /quests HTTP/1.1\r\nHost: localhost\r\n{extra_headers}\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn resolve(principal: Option<&Principal>, req: &Request) -> String {
        resolve_tracker(principal, req, None).tracker_key()
    }

    #[test]
    fn bare_request_is_unknown() {
        assert_eq!(resolve(None, &request("")), "ip:unknown");
    }

    #[test]
    fn principal_id_wins_over_everything() {
        let claims = testing::claims(Some("token-sub"), None);
        let req = request("X-Forwarded-For: 9.9.9.9\r\n");
        let principal = Principal::new("u-1");
        let identity = resolve_tracker(Some(&principal), &req, Some(&claims));
        assert_eq!(identity.tracker_key(), "user:u-1");
    }

    #[test]
    fn principal_falls_back_to_stellar_address() {
        let principal = Principal {
            id: None,
            stellar_address: Some("GSTELLAR".into()),
            subject: Some("sub-1".into()),
            role: Role::User,
        };
        assert_eq!(resolve(Some(&principal), &request("")), "user:GSTELLAR");
    }

    #[test]
    fn principal_without_identifier_is_ignored() {
        let principal = Principal {
            id: Some(String::new()),
            stellar_address: None,
            subject: None,
            role: Role::User,
        };
        let req = request("X-Forwarded-For: 1.1.1.1\r\n");
        assert_eq!(resolve(Some(&principal), &req), "ip:1.1.1.1");
    }

    #[test]
    fn verified_token_subject_is_used() {
        let req = request("X-Forwarded-For: 4.4.4.4\r\n");
        let claims = testing::claims(Some("jwt-user"), None);
        let identity = resolve_tracker(None, &req, Some(&claims));
        assert_eq!(identity, CallerIdentity::JwtUser("jwt-user".into()));
        assert!(identity.is_authenticated());

        let claims = Claims {
            stellar_address: Some("GADDR".into()),
            ..testing::claims(None, None)
        };
        assert_eq!(resolve_tracker(None, &req, Some(&claims)).tracker_key(), "user:GADDR");
    }

    #[test]
    fn claims_without_subject_fall_through_to_address() {
        let req = request("X-Forwarded-For: 4.4.4.4\r\n");
        let claims = testing::claims(None, Some(Role::User));
        let identity = resolve_tracker(None, &req, Some(&claims));
        assert_eq!(identity.tracker_key(), "ip:4.4.4.4");
        assert_eq!(resolve(None, &req), "ip:4.4.4.4");
    }

    #[test]
    fn forwarded_for_takes_first_entry() {
        let req = request("X-Forwarded-For: 1.2.3.4, 5.6.6.7\r\n");
        assert_eq!(resolve(None, &req), "ip:1.2.3.4");
    }

    #[test]
    fn repeated_forwarded_for_uses_first_line() {
        let req = request("X-Forwarded-For: 7.7.7.7\r\nX-Forwarded-For: 8.8.8.8\r\n");
        assert_eq!(resolve(None, &req), "ip:7.7.7.7");
    }

    #[test]
    fn empty_forwarded_for_is_skipped() {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 51234);
        let req = request("X-Forwarded-For: \r\n").with_peer_addr(peer);
        assert_eq!(resolve(None, &req), "ip:10.0.0.5");
    }

    #[test]
    fn client_ip_list_beats_peer_address() {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let req = request("")
            .with_peer_addr(peer)
            .with_client_ips(vec![
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            ]);
        assert_eq!(resolve(None, &req), "ip:203.0.113.9");
    }
}
