//! Gateway Port - Blocking Exchange Session Interface
//!
//! Defines the seam between the supervisor and the vendor market data
//! API. Sessions are blocking and single-use: a reconnect always goes
//! through the factory for a fresh handle, never reuses a session.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;

/// Raw, unvalidated tick payload as produced by the vendor session.
///
/// Translation into a validated `DomainTick` happens downstream; the
/// session thread never parses or validates.
#[derive(Debug, Clone)]
pub struct RawTick {
    /// Symbol as reported by the gateway.
    pub symbol: String,
    /// Exchange code as reported by the gateway (e.g. "SHFE").
    pub exchange: String,
    /// Last trade price.
    pub price: f64,
    /// Trade volume.
    pub volume: f64,
    /// Best bid, when present.
    pub bid: Option<f64>,
    /// Best ask, when present.
    pub ask: Option<f64>,
    /// Raw timestamp string (RFC 3339 when the vendor provides one).
    pub timestamp: Option<String>,
}

/// Events a gateway session can emit.
///
/// Closed union with exhaustive handling at the bridge boundary; no
/// attribute-sniffing dispatch.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A market data tick arrived.
    Tick(RawTick),
    /// The session completed login and is streaming.
    Connected,
    /// The session lost its transport (transient; supervisor retries).
    Disconnected { reason: String },
    /// Non-retryable failure (bad credentials, auth rejection).
    Fatal { reason: String },
    /// Informational message from the vendor API.
    Log { message: String },
}

/// Session failure classification.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Transport-level fault; the supervisor retries with backoff.
    #[error("transient gateway fault: {0}")]
    Transient(String),
    /// Authentication rejection; surfaced as terminal, never retried.
    #[error("fatal gateway fault: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Connection settings for one session attempt.
///
/// Built from the active credential profile; addresses are normalized
/// to carry a `tcp://` scheme.
#[derive(Clone)]
pub struct SessionConfig {
    pub broker_id: String,
    pub user_id: String,
    pub password: String,
    pub md_address: String,
    pub td_address: String,
    pub app_id: String,
    pub auth_code: String,
}

impl SessionConfig {
    /// Normalize an endpoint address to include a scheme.
    pub fn normalize_address(addr: &str) -> String {
        if addr.starts_with("tcp://") || addr.starts_with("ssl://") {
            addr.to_string()
        } else {
            format!("tcp://{addr}")
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("broker_id", &self.broker_id)
            .field("user_id", &crate::config::mask_secret(&self.user_id))
            .field("password", &"***")
            .field("md_address", &self.md_address)
            .field("td_address", &self.td_address)
            .field("app_id", &self.app_id)
            .field("auth_code", &"***")
            .finish()
    }
}

/// Sink the session pushes events into.
///
/// Implementations must never block the calling thread: a stalled
/// producer risks the exchange terminating the session for missed
/// heartbeats.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

/// One blocking gateway session.
///
/// `run` consumes the session and occupies the calling thread for the
/// whole session lifetime. It must poll `shutdown` frequently and
/// return `Ok(())` on a cooperative stop.
pub trait GatewaySession: Send {
    fn run(
        self: Box<Self>,
        sink: Arc<dyn EventSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), GatewayError>;
}

/// Produces a fresh session per connection attempt.
///
/// The vendor API does not tolerate session reuse across reconnects,
/// so the factory is the only way to obtain a session handle.
pub trait SessionFactory: Send + Sync {
    fn create(&self, config: &SessionConfig) -> Box<dyn GatewaySession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        assert_eq!(
            SessionConfig::normalize_address("180.168.146.187:10211"),
            "tcp://180.168.146.187:10211"
        );
        assert_eq!(
            SessionConfig::normalize_address("tcp://1.2.3.4:10211"),
            "tcp://1.2.3.4:10211"
        );
        assert_eq!(
            SessionConfig::normalize_address("ssl://1.2.3.4:10211"),
            "ssl://1.2.3.4:10211"
        );
    }

    #[test]
    fn test_session_config_debug_masks_secrets() {
        let config = SessionConfig {
            broker_id: "9999".to_string(),
            user_id: "123456789".to_string(),
            password: "hunter2!".to_string(),
            md_address: "tcp://1.2.3.4:10211".to_string(),
            td_address: "tcp://1.2.3.4:10201".to_string(),
            app_id: "bridge_app".to_string(),
            auth_code: "AUTHCODE".to_string(),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2!"));
        assert!(!rendered.contains("AUTHCODE"));
        assert!(!rendered.contains("123456789"));
    }

    #[test]
    fn test_fault_classification() {
        assert!(GatewayError::Fatal("bad credentials".into()).is_fatal());
        assert!(!GatewayError::Transient("socket closed".into()).is_fatal());
    }
}
