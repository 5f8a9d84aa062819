use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use sha2::{Digest, Sha256};

use jobrelay_core::{BasicAuthConfig, EngineConfig, RunController};

mod http;

pub use http::{app_router, serve};

/// Precomputed basic-auth check. Only a digest of the expected credentials,
/// keyed with the process secret, is kept.
#[derive(Clone)]
pub struct BasicAuthGate {
    key: String,
    digest: [u8; 32],
    realm: String,
}

impl BasicAuthGate {
    pub fn new(config: &BasicAuthConfig, secret_key: &str) -> Self {
        Self {
            key: secret_key.to_string(),
            digest: credential_digest(secret_key, &config.username, &config.password),
            realm: config.realm.clone(),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Checks an `Authorization` header value.
    pub fn accepts(&self, header: &str) -> bool {
        let Some(encoded) = header
            .strip_prefix("Basic ")
            .or_else(|| header.strip_prefix("basic "))
        else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return false;
        };
        credential_digest(&self.key, username, password) == self.digest
    }
}

fn credential_digest(key: &str, username: &str, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(username.as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

#[derive(Clone)]
pub struct AppState {
    pub controller: RunController,
    pub auth: Option<Arc<BasicAuthGate>>,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn new(controller: RunController) -> Self {
        let config = controller.config();
        let auth = config
            .basic_auth
            .as_ref()
            .map(|cfg| Arc::new(BasicAuthGate::new(cfg, &config.secret_key)));
        Self {
            controller,
            auth,
            started_at_ms: now_ms(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.controller.config()
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn build_id() -> String {
    if let Some(explicit) = option_env!("JOBRELAY_BUILD_ID") {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    env!("CARGO_PKG_VERSION").to_string()
}
