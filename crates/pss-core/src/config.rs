//! Configuration for the messaging core and handshake controller
//!
//! Both structs are plain serde types with defaults, so a node can be
//! configured from code or from a JSON file:
//!
//! ```json
//! {
//!   "allow_raw": false,
//!   "asymmetric_fallback": true,
//!   "handshake": { "send_limit": 3, "request_timeout_ms": 2000 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PssError, PssResult};

/// Max wait for a handshake response.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 8_000;

/// Messages a symmetric key is valid for.
pub const DEFAULT_SEND_LIMIT: u16 = 256;

/// Max symmetric keys kept per session.
pub const DEFAULT_KEY_CAPACITY: usize = 4;

/// Handshake controller parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeParams {
    /// Max wait for a handshake response, in milliseconds
    pub request_timeout_ms: u64,
    /// Age after which an established key is evicted, in milliseconds
    pub key_expiry_ms: Option<u64>,
    /// Uses per key (encrypts plus decrypts)
    pub send_limit: u16,
    /// Keys kept per (peer, topic); the oldest is evicted first
    pub key_capacity: usize,
    /// Remaining-use low-water mark that triggers a background renegotiation
    pub renegotiate_below: u16,
    /// Extra handshake attempts made by the protocol client
    pub handshake_retries: u32,
}

impl Default for HandshakeParams {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            key_expiry_ms: None,
            send_limit: DEFAULT_SEND_LIMIT,
            key_capacity: DEFAULT_KEY_CAPACITY,
            renegotiate_below: 0,
            handshake_retries: 1,
        }
    }
}

impl HandshakeParams {
    pub fn with_send_limit(mut self, limit: u16) -> Self {
        self.send_limit = limit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_key_expiry(mut self, expiry: Option<Duration>) -> Self {
        self.key_expiry_ms = expiry.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_key_capacity(mut self, capacity: usize) -> Self {
        self.key_capacity = capacity;
        self
    }

    pub fn with_renegotiate_below(mut self, remaining: u16) -> Self {
        self.renegotiate_below = remaining;
        self
    }

    pub fn with_handshake_retries(mut self, retries: u32) -> Self {
        self.handshake_retries = retries;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn key_expiry(&self) -> Option<Duration> {
        self.key_expiry_ms.map(Duration::from_millis)
    }

    /// Reject parameter sets the controller cannot operate with.
    pub fn validate(&self) -> PssResult<()> {
        if self.send_limit == 0 {
            return Err(PssError::Config("send_limit must be at least 1".to_string()));
        }
        if self.key_capacity == 0 {
            return Err(PssError::Config("key_capacity must be at least 1".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(PssError::Config(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Messaging core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PssConfig {
    /// Accept and send unencrypted raw envelopes
    pub allow_raw: bool,
    /// Let `send` fall back to asymmetric encryption when no session key exists
    pub asymmetric_fallback: bool,
    /// Handshake controller parameters
    pub handshake: HandshakeParams,
}

impl Default for PssConfig {
    fn default() -> Self {
        Self {
            allow_raw: false,
            asymmetric_fallback: true,
            handshake: HandshakeParams::default(),
        }
    }
}

impl PssConfig {
    pub fn with_handshake(mut self, params: HandshakeParams) -> Self {
        self.handshake = params;
        self
    }

    pub fn with_allow_raw(mut self, allow: bool) -> Self {
        self.allow_raw = allow;
        self
    }

    pub fn with_asymmetric_fallback(mut self, enabled: bool) -> Self {
        self.asymmetric_fallback = enabled;
        self
    }

    pub fn validate(&self) -> PssResult<()> {
        self.handshake.validate()
    }

    /// Load and validate a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> PssResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: PssConfig = serde_json::from_str(&data)
            .map_err(|e| PssError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}
