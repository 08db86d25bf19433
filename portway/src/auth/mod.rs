//! Credential validation
//!
//! Two credential paths feed the pipeline: signed bearer tokens (signature,
//! standard claims, revocation lookup) and opaque API keys (hash lookup in
//! the distributed store). Both produce a [`Principal`]; failures carry one
//! of the machine-readable codes in [`codes`].

mod principal;

pub use principal::{Principal, AUTH_TYPE_API_KEY, AUTH_TYPE_JWT};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CounterStore;
use crate::config::JwtConfig;
use crate::error::{Error, Result};

/// Machine-readable credential failure codes
pub mod codes {
    pub const INVALID_TOKEN_FORMAT: &str = "INVALID_TOKEN_FORMAT";
    pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
    pub const TOKEN_REVOKED: &str = "TOKEN_REVOKED";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const INVALID_API_KEY: &str = "INVALID_API_KEY";
    pub const INACTIVE_API_KEY: &str = "INACTIVE_API_KEY";
    pub const EXPIRED_API_KEY: &str = "EXPIRED_API_KEY";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
}

/// A credential failure: code plus human-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub code: &'static str,
    pub message: String,
}

impl AuthFailure {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<AuthFailure> for Error {
    fn from(failure: AuthFailure) -> Self {
        Error::Auth {
            code: failure.code,
            message: failure.message,
        }
    }
}

/// Success carries the principal; failure the typed code
pub type AuthResult = std::result::Result<Principal, AuthFailure>;

/// Token claims recognized by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject
    pub sub: String,

    /// Expiration (Unix timestamp); enforced by the decoder
    pub exp: i64,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tenant id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Token id, consulted against the revocation blacklist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Audience (string or array)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,

    /// Space-separated scopes, OAuth style
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Roles
    #[serde(default)]
    pub roles: Vec<String>,

    /// Direct permissions
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Everything else, preserved on the principal
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// API key record as stored at `apikey:{hash}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    /// Owning service name; becomes the principal subject
    pub service_name: String,

    /// Whether the key is currently enabled
    #[serde(default = "default_active")]
    pub active: bool,

    /// Expiry instant (None = never)
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Scopes granted to the key
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_active() -> bool {
    true
}

/// Pluggable role → permission resolution
///
/// The shape of the role store is deliberately unspecified; the default
/// implementation grants nothing.
#[async_trait]
pub trait RolePermissions: Send + Sync {
    async fn permissions_for_role(&self, role: &str) -> Vec<String>;
}

/// Default role resolver: no role-derived permissions
pub struct NoRolePermissions;

#[async_trait]
impl RolePermissions for NoRolePermissions {
    async fn permissions_for_role(&self, _role: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Credential validator over the configured key and the distributed store
pub struct CredentialValidator {
    decoding_key: DecodingKey,
    validation: Validation,
    store: Arc<dyn CounterStore>,
    role_permissions: Arc<dyn RolePermissions>,
}

impl CredentialValidator {
    /// Build a validator from JWT configuration
    pub fn new(config: &JwtConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let algorithm = match config.algorithm.to_uppercase().as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            alg => {
                return Err(Error::Internal(format!(
                    "Unsupported JWT algorithm: {}",
                    alg
                )))
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway_secs;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            store,
            role_permissions: Arc::new(NoRolePermissions),
        })
    }

    /// Swap in a role → permission resolver
    pub fn with_role_permissions<R: RolePermissions + 'static>(mut self, resolver: R) -> Self {
        self.role_permissions = Arc::new(resolver);
        self
    }

    /// Validate a signed bearer token
    pub async fn validate_token(&self, token: &str) -> AuthResult {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => {
                    AuthFailure::new(codes::TOKEN_EXPIRED, "Token has expired")
                }
                ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                    AuthFailure::new(codes::INVALID_TOKEN_FORMAT, "Token is malformed")
                }
                _ => AuthFailure::new(codes::INVALID_TOKEN, format!("Token rejected: {}", e)),
            }
        })?;

        let claims = data.claims;

        if let Some(jti) = &claims.jti {
            let key = blacklist_key(jti);
            match self.store.get(&key).await {
                Ok(Some(value)) if !value.is_empty() => {
                    return Err(AuthFailure::new(
                        codes::TOKEN_REVOKED,
                        "Token has been revoked",
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(AuthFailure::new(
                        codes::VALIDATION_ERROR,
                        format!("Revocation lookup failed: {}", e),
                    ));
                }
            }
        }

        Ok(principal_from_claims(claims))
    }

    /// Validate an opaque API key
    pub async fn validate_key(&self, key: &str) -> AuthResult {
        let hash = hash_key(key);
        let record = match self.store.get(&api_key_key(&hash)).await {
            Ok(Some(json)) => json,
            Ok(None) => {
                return Err(AuthFailure::new(codes::INVALID_API_KEY, "Unknown API key"))
            }
            Err(e) => {
                return Err(AuthFailure::new(
                    codes::VALIDATION_ERROR,
                    format!("API key lookup failed: {}", e),
                ));
            }
        };

        let record: ApiKeyRecord = serde_json::from_str(&record).map_err(|e| {
            AuthFailure::new(
                codes::VALIDATION_ERROR,
                format!("Stored API key record is malformed: {}", e),
            )
        })?;

        if !record.active {
            return Err(AuthFailure::new(
                codes::INACTIVE_API_KEY,
                "API key is inactive",
            ));
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at < Utc::now() {
                return Err(AuthFailure::new(
                    codes::EXPIRED_API_KEY,
                    "API key has expired",
                ));
            }
        }

        let mut principal = Principal::new(record.service_name);
        principal.auth_type = AUTH_TYPE_API_KEY.to_string();
        principal.scopes = record.scopes;
        Ok(principal)
    }

    /// Check whether a principal satisfies `(resource, action)`
    ///
    /// Direct permissions are matched first (`resource:action`,
    /// `resource:*`, `*:*`), then permissions derived from each role.
    pub async fn has_permission(&self, principal: &Principal, resource: &str, action: &str) -> bool {
        if permission_set_allows(&principal.permissions, resource, action) {
            return true;
        }
        for role in &principal.roles {
            let derived = self.role_permissions.permissions_for_role(role).await;
            if permission_set_allows(&derived, resource, action) {
                return true;
            }
        }
        false
    }

    /// Blacklist a token's `jti` until its expiry
    pub async fn revoke_refresh(&self, token: &str) -> Result<()> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(Error::from)?;

        let Some(jti) = data.claims.jti else {
            return Err(Error::Internal(
                "Token carries no jti claim; nothing to revoke".to_string(),
            ));
        };

        let ttl = (data.claims.exp - Utc::now().timestamp()).max(1) as u64;
        self.store
            .set(&blacklist_key(&jti), "revoked", Some(Duration::from_secs(ttl)))
            .await
    }

    /// A caller-facing summary of a principal
    pub fn user_info(&self, principal: &Principal) -> serde_json::Value {
        serde_json::json!({
            "subject": principal.subject,
            "name": principal.name,
            "tenantId": principal.tenant_id,
            "authType": principal.auth_type,
            "roles": principal.roles,
            "scopes": principal.scopes,
        })
    }
}

fn principal_from_claims(claims: Claims) -> Principal {
    let mut principal = Principal::new(claims.sub);
    principal.auth_type = AUTH_TYPE_JWT.to_string();
    principal.name = claims.name;
    principal.tenant_id = claims.tenant_id;
    principal.roles = claims.roles;
    principal.permissions = claims.permissions;
    principal.scopes = claims
        .scope
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    principal.claims = claims.extra;
    principal
}

fn permission_set_allows(permissions: &[String], resource: &str, action: &str) -> bool {
    let exact = format!("{}:{}", resource, action);
    let resource_any = format!("{}:*", resource);
    permissions
        .iter()
        .any(|p| p == &exact || p == &resource_any || p == "*:*")
}

/// SHA-256 of the key, base64-encoded
fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

fn api_key_key(hash: &str) -> String {
    format!("apikey:{}", hash)
}

fn blacklist_key(jti: &str) -> String {
    format!("token:blacklist:{}", jti)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterStore;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-secret";

    fn validator() -> CredentialValidator {
        validator_with_store(Arc::new(MemoryCounterStore::new()))
    }

    fn validator_with_store(store: Arc<dyn CounterStore>) -> CredentialValidator {
        let config = JwtConfig {
            secret: SECRET.to_string(),
            algorithm: "HS256".to_string(),
            issuer: Some("https://issuer.example".to_string()),
            audience: None,
            leeway_secs: 60,
        };
        CredentialValidator::new(&config, store).unwrap()
    }

    fn token(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn valid_claims() -> serde_json::Value {
        serde_json::json!({
            "sub": "user-1",
            "exp": Utc::now().timestamp() + 600,
            "iss": "https://issuer.example",
            "scope": "erp:read crm:write",
            "roles": ["operator"],
            "client_id": "portal",
        })
    }

    #[tokio::test]
    async fn test_valid_token_produces_principal() {
        let validator = validator();
        let principal = validator.validate_token(&token(&valid_claims())).await.unwrap();

        assert_eq!(principal.subject, "user-1");
        assert_eq!(principal.auth_type, AUTH_TYPE_JWT);
        assert!(principal.has_scope("erp:read"));
        assert!(principal.has_scope("crm:write"));
        assert!(principal.has_role("operator"));
        assert_eq!(principal.client_id(), Some("portal"));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let validator = validator();
        let mut claims = valid_claims();
        // Past the 60s leeway
        claims["exp"] = serde_json::json!(Utc::now().timestamp() - 3600);

        let failure = validator.validate_token(&token(&claims)).await.unwrap_err();
        assert_eq!(failure.code, codes::TOKEN_EXPIRED);
    }

    #[tokio::test]
    async fn test_wrong_issuer() {
        let validator = validator();
        let mut claims = valid_claims();
        claims["iss"] = serde_json::json!("https://evil.example");

        let failure = validator.validate_token(&token(&claims)).await.unwrap_err();
        assert_eq!(failure.code, codes::INVALID_TOKEN);
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let validator = validator();
        let failure = validator.validate_token("not-a-jwt").await.unwrap_err();
        assert!(
            failure.code == codes::INVALID_TOKEN_FORMAT || failure.code == codes::INVALID_TOKEN
        );
    }

    #[tokio::test]
    async fn test_blacklisted_jti_is_revoked() {
        let store = Arc::new(MemoryCounterStore::new());
        store
            .set("token:blacklist:jti-1", "revoked", None)
            .await
            .unwrap();
        let validator = validator_with_store(store);

        let mut claims = valid_claims();
        claims["jti"] = serde_json::json!("jti-1");

        let failure = validator.validate_token(&token(&claims)).await.unwrap_err();
        assert_eq!(failure.code, codes::TOKEN_REVOKED);
    }

    #[tokio::test]
    async fn test_revoke_refresh_blacklists() {
        let store = Arc::new(MemoryCounterStore::new());
        let validator = validator_with_store(store.clone());

        let mut claims = valid_claims();
        claims["jti"] = serde_json::json!("jti-2");
        let token = token(&claims);

        validator.validate_token(&token).await.unwrap();
        validator.revoke_refresh(&token).await.unwrap();

        let failure = validator.validate_token(&token).await.unwrap_err();
        assert_eq!(failure.code, codes::TOKEN_REVOKED);
    }

    #[tokio::test]
    async fn test_api_key_paths() {
        let store = Arc::new(MemoryCounterStore::new());
        let validator = validator_with_store(store.clone());

        // Unknown key
        let failure = validator.validate_key("sk-unknown").await.unwrap_err();
        assert_eq!(failure.code, codes::INVALID_API_KEY);

        // Valid key
        let record = serde_json::json!({
            "serviceName": "billing",
            "active": true,
            "scopes": ["billing:read"],
        });
        store
            .set(
                &api_key_key(&hash_key("sk-valid")),
                &record.to_string(),
                None,
            )
            .await
            .unwrap();
        let principal = validator.validate_key("sk-valid").await.unwrap();
        assert_eq!(principal.subject, "billing");
        assert_eq!(principal.auth_type, AUTH_TYPE_API_KEY);
        assert!(principal.has_scope("billing:read"));

        // Inactive key
        let record = serde_json::json!({ "serviceName": "billing", "active": false });
        store
            .set(
                &api_key_key(&hash_key("sk-inactive")),
                &record.to_string(),
                None,
            )
            .await
            .unwrap();
        let failure = validator.validate_key("sk-inactive").await.unwrap_err();
        assert_eq!(failure.code, codes::INACTIVE_API_KEY);

        // Expired key
        let record = serde_json::json!({
            "serviceName": "billing",
            "expiresAt": (Utc::now() - chrono::Duration::hours(1)).to_rfc3339(),
        });
        store
            .set(
                &api_key_key(&hash_key("sk-expired")),
                &record.to_string(),
                None,
            )
            .await
            .unwrap();
        let failure = validator.validate_key("sk-expired").await.unwrap_err();
        assert_eq!(failure.code, codes::EXPIRED_API_KEY);
    }

    #[tokio::test]
    async fn test_permission_matching() {
        let validator = validator();
        let mut principal = Principal::new("svc");
        principal.permissions = vec!["orders:read".to_string(), "inventory:*".to_string()];

        assert!(validator.has_permission(&principal, "orders", "read").await);
        assert!(!validator.has_permission(&principal, "orders", "write").await);
        assert!(validator.has_permission(&principal, "inventory", "delete").await);

        principal.permissions = vec!["*:*".to_string()];
        assert!(validator.has_permission(&principal, "anything", "at-all").await);
    }

    #[tokio::test]
    async fn test_role_derived_permissions() {
        struct StaticRoles;

        #[async_trait]
        impl RolePermissions for StaticRoles {
            async fn permissions_for_role(&self, role: &str) -> Vec<String> {
                if role == "auditor" {
                    vec!["audit:read".to_string()]
                } else {
                    Vec::new()
                }
            }
        }

        let validator = validator().with_role_permissions(StaticRoles);
        let mut principal = Principal::new("user-2");
        principal.roles = vec!["auditor".to_string()];

        assert!(validator.has_permission(&principal, "audit", "read").await);
        assert!(!validator.has_permission(&principal, "audit", "write").await);
    }

    #[test]
    fn test_user_info_summary() {
        let validator = validator();
        let mut principal = Principal::new("user-7");
        principal.name = Some("Dana".to_string());
        principal.roles = vec!["operator".to_string()];
        principal.scopes = vec!["erp:read".to_string()];

        let info = validator.user_info(&principal);
        assert_eq!(info["subject"], "user-7");
        assert_eq!(info["name"], "Dana");
        assert_eq!(info["authType"], "jwt");
        assert_eq!(info["roles"], serde_json::json!(["operator"]));
        assert_eq!(info["scopes"], serde_json::json!(["erp:read"]));
    }

    #[test]
    fn test_hash_key_is_stable_base64() {
        let h1 = hash_key("sk-abc");
        let h2 = hash_key("sk-abc");
        assert_eq!(h1, h2);
        assert_ne!(h1, hash_key("sk-abd"));
        assert!(base64::engine::general_purpose::STANDARD.decode(&h1).is_ok());
    }
}
