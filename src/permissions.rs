use crate::errors::ApiError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scopes an API key may be granted. Anything else is refused at creation.
pub const KNOWN_PERMISSIONS: [&str; 8] = [
    "api:read",
    "api:write",
    "api:*",
    "admin:read",
    "admin:write",
    "admin:*",
    "internal:*",
    "*",
];

/// Scope required for admin-only routes when the caller uses an API key.
pub const ADMIN_SCOPE: &str = "admin:*";

/// A granted capability.
///
/// `Exact("admin:read")` grants exactly that scope, `Prefix("admin")` grants
/// every scope in the `admin:` namespace and `Global` grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    Exact(String),
    Prefix(String),
    Global,
}

impl Permission {
    /// Parses a scope and checks it against [`KNOWN_PERMISSIONS`].
    pub fn parse_known(scope: &str) -> Result<Self, ApiError> {
        if !KNOWN_PERMISSIONS.contains(&scope) {
            return Err(ApiError::InvalidRequest(format!(
                "unknown permission '{}'",
                scope
            )));
        }
        scope.parse()
    }

    pub fn grants(&self, required: &str) -> bool {
        match self {
            Permission::Global => true,
            Permission::Exact(scope) => scope == required,
            Permission::Prefix(namespace) => required
                .strip_prefix(namespace.as_str())
                .is_some_and(|rest| rest.starts_with(':')),
        }
    }
}

impl FromStr for Permission {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ApiError::InvalidRequest("empty permission".to_string()));
        }
        if s == "*" {
            return Ok(Permission::Global);
        }
        match s.strip_suffix(":*") {
            Some(namespace) if !namespace.is_empty() && !namespace.contains('*') => {
                Ok(Permission::Prefix(namespace.to_string()))
            }
            Some(_) => Err(ApiError::InvalidRequest(format!(
                "malformed wildcard permission '{}'",
                s
            ))),
            None if s.contains('*') => Err(ApiError::InvalidRequest(format!(
                "malformed wildcard permission '{}'",
                s
            ))),
            None => Ok(Permission::Exact(s.to_string())),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Exact(scope) => f.write_str(scope),
            Permission::Prefix(namespace) => write!(f, "{}:*", namespace),
            Permission::Global => f.write_str("*"),
        }
    }
}

impl TryFrom<String> for Permission {
    type Error = ApiError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(permission: Permission) -> Self {
        permission.to_string()
    }
}

/// True when any of `granted` satisfies `required`.
pub fn has_permission(granted: &[Permission], required: &str) -> bool {
    granted.iter().any(|p| p.grants(required))
}
