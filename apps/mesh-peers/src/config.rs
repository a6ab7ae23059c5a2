use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{MeshError, MeshResult};

pub const DEFAULT_SIGNALLER_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_HEARTBEAT_TEXT: &str = "Hello world!";
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_SPAWN_INTERVAL: Duration = Duration::from_millis(150);

const SESSION_ID_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub signaller_url: String,
    pub session_id: String,
    /// STUN/TURN urls handed to every peer connection. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    pub publish_interval: Duration,
    pub heartbeat_text: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaller_url: DEFAULT_SIGNALLER_URL.to_string(),
            session_id: generate_session_id(),
            ice_servers: vec![DEFAULT_STUN_URL.to_string()],
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            heartbeat_text: DEFAULT_HEARTBEAT_TEXT.to_string(),
        }
    }
}

impl MeshConfig {
    /// Rejects settings the session cannot run with.
    pub fn validate(&self) -> MeshResult<()> {
        if self.session_id.trim().is_empty() {
            return Err(MeshError::Setup("session id must not be empty".into()));
        }
        if self.publish_interval.is_zero() {
            return Err(MeshError::Setup("publish interval must be non-zero".into()));
        }
        Ok(())
    }
}

pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}
