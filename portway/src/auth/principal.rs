//! Authenticated principal

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a principal was authenticated
pub const AUTH_TYPE_JWT: &str = "jwt";
pub const AUTH_TYPE_API_KEY: &str = "api_key";

/// An authenticated identity with its claims
///
/// Produced by credential validation, consumed read-only by the rest of the
/// pipeline (rate-limit client id, route scope predicate, outcome events).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Subject id (user id or service name)
    pub subject: String,

    /// Display name, when the credential carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tenant id, when the credential carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Credential kind (`jwt` or `api_key`)
    pub auth_type: String,

    /// Roles
    #[serde(default)]
    pub roles: Vec<String>,

    /// OAuth-style scopes
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Direct `resource:action` permissions
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Remaining claims, verbatim
    #[serde(default)]
    pub claims: HashMap<String, serde_json::Value>,
}

impl Principal {
    /// Create a bare principal with just a subject
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            name: None,
            tenant_id: None,
            auth_type: AUTH_TYPE_JWT.to_string(),
            roles: Vec::new(),
            scopes: Vec::new(),
            permissions: Vec::new(),
            claims: HashMap::new(),
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// The `client_id` claim, when present
    pub fn client_id(&self) -> Option<&str> {
        self.claims.get("client_id").and_then(|v| v.as_str())
    }
}
