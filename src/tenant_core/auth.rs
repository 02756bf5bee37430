use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::Deserialize;
use tracing::warn;

use crate::tenant_core::common::{Error, Result};

/// Claims already extracted from a signed token by the HTTP authentication protocol
/// handlers (out of scope here) — `AuthState::check_jwt` only applies the
/// sub-allowlist/jti-revocation policy on top of them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub jti: Option<String>,
}

/// The transport a session is authenticating over. Only the two kinds the tenant core
/// itself ever brokers connections for are modeled; the HTTP auth surface is the caller's
/// concern, not this resolver's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Trust,
    Scram,
    Jwt,
}

/// Either every username (`*`) or an explicit set.
#[derive(Debug, Clone)]
pub enum UserMatch {
    Any,
    Named(HashSet<String>),
}

impl UserMatch {
    fn matches(&self, user: &str) -> bool {
        match self {
            UserMatch::Any => true,
            UserMatch::Named(set) => set.contains(user),
        }
    }
}

/// One entry of `sys_auth`: a username match paired with the method to use, optionally
/// restricted to a subset of transports. An empty transport restriction permits any
/// transport.
#[derive(Debug, Clone)]
pub struct AuthRule {
    pub priority: i32,
    pub user: UserMatch,
    pub method: AuthMethod,
    pub transports: HashSet<Transport>,
}

impl AuthRule {
    fn permits(&self, user: &str, transport: Transport) -> bool {
        self.user.matches(user) && (self.transports.is_empty() || self.transports.contains(&transport))
    }
}

/// Per-subject allow/revocation lists for signed tokens, and the ordered `sys_auth` rule
/// table used to pick an auth method for an incoming connection. Lists are reloaded from
/// disk on demand (`load_jwcrypto`) rather than watched continuously — callers that want
/// live updates re-call it on their own schedule (e.g. from a sysevent).
pub struct AuthState {
    sub_allowlist_file: Option<PathBuf>,
    revocation_list_file: Option<PathBuf>,
    sub_allowlist: RwLock<Option<HashSet<String>>>,
    revocation_list: RwLock<Option<HashSet<String>>>,
    sys_auth: RwLock<Vec<AuthRule>>,
}

impl AuthState {
    pub fn new(sub_allowlist_file: Option<PathBuf>, revocation_list_file: Option<PathBuf>) -> Self {
        AuthState {
            sub_allowlist_file,
            revocation_list_file,
            sub_allowlist: RwLock::new(None),
            revocation_list: RwLock::new(None),
            sys_auth: RwLock::new(Vec::new()),
        }
    }

    /// Reads the configured allowlist/revocation-list files into memory. Each is a
    /// newline-delimited list of raw claim values; blank lines and `#`-prefixed comments
    /// are skipped. Failure of either read is fatal — `Error::startup`.
    pub fn load_jwcrypto(&self) -> Result<()> {
        if let Some(path) = &self.sub_allowlist_file {
            let set = read_list_file(path).map_err(|e| Error::startup(format!("loading JWT sub allowlist: {}", e)))?;
            *self.sub_allowlist.write().unwrap() = Some(set);
        }
        if let Some(path) = &self.revocation_list_file {
            let set = read_list_file(path).map_err(|e| Error::startup(format!("loading JWT revocation list: {}", e)))?;
            *self.revocation_list.write().unwrap() = Some(set);
        }
        Ok(())
    }

    /// Installs the `sys_auth` rule table, sorted ascending by priority so
    /// `get_auth_method` can scan it in order.
    pub fn set_sys_auth(&self, mut rules: Vec<AuthRule>) {
        rules.sort_by_key(|r| r.priority);
        *self.sys_auth.write().unwrap() = rules;
    }

    /// Applies the sub-allowlist/jti-revocation policy to already-validated `claims`.
    /// Signature verification and expiry are the HTTP authentication protocol's concern
    /// (out of scope here); by the time claims reach here they've already passed that
    /// check.
    pub fn check_jwt(&self, claims: &Claims) -> Result<()> {
        if let Some(allowlist) = &*self.sub_allowlist.read().unwrap() {
            let sub = claims.sub.as_deref().unwrap_or("");
            if sub.is_empty() || !allowlist.contains(sub) {
                return Err(Error::authentication("unauthorized subject"));
            }
        }

        if let Some(revoked) = &*self.revocation_list.read().unwrap() {
            match &claims.jti {
                Some(jti) if !jti.is_empty() => {
                    if revoked.contains(jti) {
                        warn!(jti, "rejected revoked token");
                        return Err(Error::authentication("revoked key"));
                    }
                }
                _ => return Err(Error::authentication("token is missing a valid key id")),
            }
        }

        Ok(())
    }

    /// Picks the auth method for `user` connecting over `transport`: the first `sys_auth`
    /// rule (in priority order) whose user-set matches `user` (or is the `*` wildcard) and
    /// whose transport restriction permits `transport` wins; absent any match, `default`
    /// (the server's configured default for this transport) is used.
    pub fn get_auth_method(&self, user: &str, transport: Transport, default: AuthMethod) -> AuthMethod {
        self.sys_auth
            .read()
            .unwrap()
            .iter()
            .find(|rule| rule.permits(user, transport))
            .map(|rule| rule.method)
            .unwrap_or(default)
    }
}

fn read_list_file(path: &PathBuf) -> Result<HashSet<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: Option<&str>, jti: Option<&str>) -> Claims {
        Claims {
            sub: sub.map(str::to_string),
            jti: jti.map(str::to_string),
        }
    }

    fn auth_with_lists() -> AuthState {
        let auth = AuthState::new(None, None);
        *auth.sub_allowlist.write().unwrap() = Some(["alice".to_string()].into_iter().collect());
        *auth.revocation_list.write().unwrap() = Some(["jti-5".to_string()].into_iter().collect());
        auth
    }

    #[test]
    fn jwt_revocation_scenario() {
        let auth = auth_with_lists();

        auth.check_jwt(&claims(Some("alice"), Some("jti-1"))).expect("allowed subject, unrevoked key");

        let err = auth.check_jwt(&claims(Some("bob"), Some("jti-1"))).unwrap_err();
        assert_eq!(err.to_string(), "unauthorized subject");

        let err = auth.check_jwt(&claims(Some("alice"), Some("jti-5"))).unwrap_err();
        assert_eq!(err.to_string(), "revoked key");

        let err = auth.check_jwt(&claims(Some("alice"), None)).unwrap_err();
        assert_eq!(err.to_string(), "token is missing a valid key id");
    }

    #[test]
    fn no_lists_configured_means_no_restriction() {
        let auth = AuthState::new(None, None);
        auth.check_jwt(&claims(None, None)).expect("no allowlist or revocation list configured");
    }

    #[test]
    fn get_auth_method_falls_back_to_default_with_no_rules() {
        let auth = AuthState::new(None, None);
        assert_eq!(auth.get_auth_method("edgedb", Transport::Tcp, AuthMethod::Trust), AuthMethod::Trust);
    }

    #[test]
    fn get_auth_method_honors_priority_and_transport_restriction() {
        let auth = AuthState::new(None, None);
        auth.set_sys_auth(vec![
            AuthRule {
                priority: 10,
                user: UserMatch::Named(["admin".to_string()].into_iter().collect()),
                method: AuthMethod::Trust,
                transports: [Transport::Unix].into_iter().collect(),
            },
            AuthRule {
                priority: 20,
                user: UserMatch::Any,
                method: AuthMethod::Scram,
                transports: HashSet::new(),
            },
        ]);

        // admin over unix matches the first rule.
        assert_eq!(auth.get_auth_method("admin", Transport::Unix, AuthMethod::Jwt), AuthMethod::Trust);
        // admin over tcp doesn't match the transport-restricted rule, falls through to the wildcard.
        assert_eq!(auth.get_auth_method("admin", Transport::Tcp, AuthMethod::Jwt), AuthMethod::Scram);
        // any other user matches only the wildcard rule.
        assert_eq!(auth.get_auth_method("app_user", Transport::Tcp, AuthMethod::Jwt), AuthMethod::Scram);
    }
}
