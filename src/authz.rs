//! Scope-based authorization.
//!
//! # Roles
//!
//! Roles resolve to a static scope set exactly once, when a token is issued.
//! The scopes embedded in a token are authoritative for its whole lifetime:
//! changing the table below does not alter tokens already in circulation.
//! De-privileging a live session means revoking its tokens.
//!
//! | Role         | Scopes                                                        |
//! |--------------|---------------------------------------------------------------|
//! | `user`       | `user`, `read:profile`, `read:vault`, `write:vault`           |
//! | `admin`      | `user`, `admin`, `read:*`, `write:*`                          |
//! | `superadmin` | `user`, `admin`, `superadmin`, `read:*`, `write:*`, `admin:keys` |
//!
//! # Wildcards
//!
//! A granted scope `prefix:*` satisfies any required scope `prefix:<anything>`.
//! Wildcards are only honoured on the granted side.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::{AppError, AppResult};
use crate::token::Claims;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::User, Role::Admin, Role::SuperAdmin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::SuperAdmin => "superadmin",
        }
    }

    pub fn scopes(&self) -> &'static [&'static str] {
        match self {
            Role::User => &["user", "read:profile", "read:vault", "write:vault"],
            Role::Admin => &["user", "admin", "read:*", "write:*"],
            Role::SuperAdmin => &[
                "user",
                "admin",
                "superadmin",
                "read:*",
                "write:*",
                "admin:keys",
            ],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AppError::BadRequest(format!("Unknown role: {s}")))
    }
}

/// Union of the scope sets of `roles`.
pub fn scopes_for_roles(roles: &[Role]) -> BTreeSet<String> {
    roles
        .iter()
        .flat_map(|role| role.scopes().iter().map(|s| (*s).to_string()))
        .collect()
}

/// The authenticated caller for one request.
///
/// Derived from a verified access token and injected into request
/// extensions by the security pipeline. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub scopes: BTreeSet<String>,
    /// JTI of the access token this principal was derived from.
    pub token_id: String,
    /// Expiry (Unix seconds) of that token.
    pub expires_at: i64,
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.sub,
            scopes: claims.scopes,
            token_id: claims.jti,
            expires_at: claims.exp,
        }
    }
}

impl Principal {
    pub fn has_scope(&self, required: &str) -> bool {
        self.scopes
            .iter()
            .any(|granted| scope_satisfies(granted, required))
    }

    pub fn has_scopes<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|r| self.has_scope(r.as_ref()))
    }
}

/// Whether a single granted scope covers a single required scope.
pub fn scope_satisfies(granted: &str, required: &str) -> bool {
    if granted == required {
        return true;
    }
    match granted.strip_suffix('*') {
        Some(prefix) if prefix.ends_with(':') => {
            required.len() > prefix.len() && required.starts_with(prefix)
        }
        _ => false,
    }
}

/// Fail with `InsufficientScope` unless `required` is a subset of the
/// principal's granted scopes.
pub fn require_scopes<S: AsRef<str>>(principal: &Principal, required: &[S]) -> AppResult<()> {
    if principal.has_scopes(required) {
        return Ok(());
    }

    Err(AppError::InsufficientScope {
        required: required.iter().map(|s| s.as_ref().to_string()).collect(),
    })
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| AppError::MissingCredentials("Authentication required".to_string()))
    }
}

/// Required scopes per route prefix.
///
/// The longest matching prefix wins. Prefixes match on path segment
/// boundaries, so `/vault` covers `/vault/encrypt` but not `/vaults`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteScopes {
    entries: Vec<(String, Vec<String>)>,
}

impl RouteScopes {
    pub fn new(entries: Vec<(String, Vec<String>)>) -> Self {
        let mut entries = entries;
        // Longest first so the first match is the most specific
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries }
    }

    /// Parse `"<prefix>=<scope> <scope>;<prefix>=<scope>"`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut entries = Vec::new();
        for rule in spec.split(';').map(str::trim).filter(|r| !r.is_empty()) {
            let (prefix, scopes) = rule
                .split_once('=')
                .ok_or_else(|| format!("route scope rule '{rule}' is missing '='"))?;
            let prefix = prefix.trim();
            if !prefix.starts_with('/') {
                return Err(format!("route scope prefix '{prefix}' must start with '/'"));
            }
            let scopes: Vec<String> = scopes.split_whitespace().map(str::to_string).collect();
            if scopes.is_empty() {
                return Err(format!("route scope rule '{rule}' lists no scopes"));
            }
            entries.push((prefix.to_string(), scopes));
        }
        Ok(Self::new(entries))
    }

    /// Scopes required for `path`, or an empty slice if no rule matches.
    pub fn required_for(&self, path: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(prefix, _)| path_has_prefix(path, prefix))
            .map(|(_, scopes)| scopes.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Segment-aware prefix match.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
