//! Token authentication.
//!
//! Tokens are HMAC-SHA256 signed: `hex(payload_json) . hex(tag)`. Node tokens
//! are signed with the device's registration secret; operator and user tokens
//! with the scheduler's global secret. Verification picks the secret from the
//! request context — a request carrying a device id is checked against that
//! device's registration secret, everything else against the global secret —
//! so a node can never mint tokens for another device.

use crate::error::CoreError;
use crate::store::PersistentStore;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Access level carried by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Query operations.
    Read,
    /// Node callbacks and result submission.
    Write,
    /// Signing download instructions on behalf of users.
    Sign,
    /// Operator surface.
    Admin,
}

impl Permission {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Sign => "sign",
            Permission::Admin => "admin",
        }
    }

    /// Parses a permission name; used by the CLI `--perm` flag.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "sign" => Some(Permission::Sign),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenPayload {
    allow: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    nonce: String,
    issued_at: i64,
}

/// Issues and verifies scheduler tokens.
pub struct AuthKeeper {
    global_secret: Vec<u8>,
    persistent: Arc<dyn PersistentStore>,
}

impl AuthKeeper {
    #[must_use]
    pub fn new(global_secret: Vec<u8>, persistent: Arc<dyn PersistentStore>) -> Self {
        Self { global_secret, persistent }
    }

    /// Issues a token signed with the scheduler's global secret.
    pub fn global_token(&self, perms: &[Permission]) -> Result<String, CoreError> {
        sign_token(
            &self.global_secret,
            &TokenPayload {
                allow: perms.to_vec(),
                device_id: None,
                nonce: new_nonce(),
                issued_at: chrono::Utc::now().timestamp(),
            },
        )
    }

    /// Issues a node token, signed with the device's registration secret.
    ///
    /// The presented secret must match the registration row.
    pub async fn node_token_new(
        &self,
        perms: &[Permission],
        device_id: &str,
        device_secret: &str,
    ) -> Result<String, CoreError> {
        let registration = self.persistent.registration(device_id).await.map_err(|e| {
            if e.is_not_found() {
                CoreError::UnknownDevice(device_id.to_string())
            } else {
                CoreError::Store(e)
            }
        })?;
        if registration.secret != device_secret {
            return Err(CoreError::PolicyDenied(format!("secret mismatch for {device_id}")));
        }
        sign_token(
            registration.secret.as_bytes(),
            &TokenPayload {
                allow: perms.to_vec(),
                device_id: Some(device_id.to_string()),
                nonce: new_nonce(),
                issued_at: chrono::Utc::now().timestamp(),
            },
        )
    }

    /// Verifies a token and returns its permissions.
    ///
    /// With a device id on the request context, the device's registration
    /// secret is authoritative; otherwise the global secret is used.
    pub async fn verify(
        &self,
        token: &str,
        device_ctx: Option<&str>,
    ) -> Result<Vec<Permission>, CoreError> {
        let secret = match device_ctx {
            Some(device_id) => {
                let registration =
                    self.persistent.registration(device_id).await.map_err(|e| {
                        if e.is_not_found() {
                            CoreError::PolicyDenied(format!("unregistered device {device_id}"))
                        } else {
                            CoreError::Store(e)
                        }
                    })?;
                registration.secret.into_bytes()
            }
            None => self.global_secret.clone(),
        };
        let payload = verify_token(&secret, token)?;
        Ok(payload.allow)
    }
}

fn sign_token(secret: &[u8], payload: &TokenPayload) -> Result<String, CoreError> {
    let body = serde_json::to_vec(payload)
        .map_err(|e| CoreError::InvalidRequest(format!("unencodable payload: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| CoreError::PolicyDenied("unusable secret".into()))?;
    mac.update(&body);
    let tag = mac.finalize().into_bytes();
    Ok(format!("{}.{}", hex::encode(body), hex::encode(tag)))
}

fn verify_token(secret: &[u8], token: &str) -> Result<TokenPayload, CoreError> {
    let (body_hex, tag_hex) = token
        .split_once('.')
        .ok_or_else(|| CoreError::PolicyDenied("malformed token".into()))?;
    let body = hex::decode(body_hex)
        .map_err(|_| CoreError::PolicyDenied("malformed token body".into()))?;
    let tag = hex::decode(tag_hex)
        .map_err(|_| CoreError::PolicyDenied("malformed token tag".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| CoreError::PolicyDenied("unusable secret".into()))?;
    mac.update(&body);
    // Constant-time comparison.
    mac.verify_slice(&tag).map_err(|_| CoreError::PolicyDenied("invalid token".into()))?;

    serde_json::from_slice(&body)
        .map_err(|_| CoreError::PolicyDenied("undecodable token payload".into()))
}

fn new_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generates a fresh registration secret.
#[must_use]
pub fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Scheduler repo directory: `$STRATUS_SCHEDULER_PATH`, falling back to
/// `~/.stratusscheduler`.
#[must_use]
pub fn default_repo_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("STRATUS_SCHEDULER_PATH") {
        return std::path::PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    std::path::Path::new(&home).join(".stratusscheduler")
}

/// Loads the scheduler's global secret from the repo dir, creating it on
/// first use.
///
/// # Errors
///
/// Propagates filesystem errors; fatal at startup.
pub fn load_or_create_secret(repo_dir: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let path = repo_dir.join("secret");
    if path.exists() {
        let secret = std::fs::read_to_string(&path)?;
        return Ok(secret.trim().as_bytes().to_vec());
    }
    std::fs::create_dir_all(repo_dir)?;
    let secret = generate_secret();
    std::fs::write(&path, &secret)?;
    Ok(secret.into_bytes())
}
