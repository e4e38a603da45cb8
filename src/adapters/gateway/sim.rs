//! Simulated Gateway Connector - In-Tree Session Implementation
//!
//! Deterministic replacement for the vendor market data API, used by
//! mock mode, failover drills, and tests. Emits a login event followed
//! by a steady tick cadence for a configured symbol set, cooperating
//! with the shutdown flag like a real blocking session loop would.
//!
//! A production vendor binding plugs in through the same
//! `SessionFactory` port; nothing upstream can tell the difference.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::tick::now_exchange;
use crate::ports::gateway::{
    EventSink, GatewayError, GatewayEvent, GatewaySession, RawTick, SessionConfig,
    SessionFactory,
};

/// Behaviour script for the simulated connector.
#[derive(Debug, Clone)]
pub struct SimGatewayConfig {
    /// vt symbols to tick (`rb2401.SHFE`).
    pub symbols: Vec<String>,
    /// Milliseconds between tick rounds.
    pub tick_interval_ms: u64,
    /// Fail this many attempts with a transient fault before connecting.
    pub fail_first_attempts: u32,
    /// Reject every attempt with a fatal (auth) fault.
    pub reject_auth: bool,
}

impl Default for SimGatewayConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["rb2401.SHFE".to_string()],
            tick_interval_ms: 100,
            fail_first_attempts: 0,
            reject_auth: false,
        }
    }
}

/// Session factory for the simulated connector.
pub struct SimSessionFactory {
    config: SimGatewayConfig,
    attempts: AtomicU32,
}

impl SimSessionFactory {
    pub fn new(config: SimGatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            attempts: AtomicU32::new(0),
        })
    }

    /// Session attempts made so far (test observability).
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl SessionFactory for SimSessionFactory {
    fn create(&self, _config: &SessionConfig) -> Box<dyn GatewaySession> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Box::new(SimSession {
            config: self.config.clone(),
            attempt,
        })
    }
}

struct SimSession {
    config: SimGatewayConfig,
    attempt: u32,
}

impl SimSession {
    fn split_vt(vt_symbol: &str) -> (String, String) {
        match vt_symbol.split_once('.') {
            Some((symbol, exchange)) => (symbol.to_string(), exchange.to_string()),
            None => (vt_symbol.to_string(), "SHFE".to_string()),
        }
    }
}

impl GatewaySession for SimSession {
    fn run(
        self: Box<Self>,
        sink: Arc<dyn EventSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), GatewayError> {
        if self.config.reject_auth {
            return Err(GatewayError::Fatal("CTP login rejected: bad credentials".to_string()));
        }
        if self.attempt <= self.config.fail_first_attempts {
            return Err(GatewayError::Transient("market data front unreachable".to_string()));
        }

        sink.emit(GatewayEvent::Log {
            message: format!("sim session {} logged in", self.attempt),
        });
        sink.emit(GatewayEvent::Connected);

        let mut round: u64 = 0;
        while !shutdown.load(Ordering::Relaxed) {
            round += 1;
            for vt_symbol in &self.config.symbols {
                let (symbol, exchange) = Self::split_vt(vt_symbol);
                // Price drifts deterministically so consumers see variety.
                let price = 3_800.0 + (round % 50) as f64;
                sink.emit(GatewayEvent::Tick(RawTick {
                    symbol,
                    exchange,
                    price,
                    volume: (round % 7) as f64,
                    bid: Some(price - 1.0),
                    ask: Some(price + 1.0),
                    timestamp: Some(now_exchange().to_rfc3339()),
                }));
            }
            std::thread::sleep(Duration::from_millis(self.config.tick_interval_ms));
        }

        sink.emit(GatewayEvent::Disconnected {
            reason: "shutdown requested".to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectSink {
        events: Mutex<Vec<GatewayEvent>>,
    }

    impl EventSink for CollectSink {
        fn emit(&self, event: GatewayEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            broker_id: "9999".to_string(),
            user_id: "100001".to_string(),
            password: "pw".to_string(),
            md_address: "tcp://1.2.3.4:10211".to_string(),
            td_address: "tcp://1.2.3.4:10201".to_string(),
            app_id: "bridge".to_string(),
            auth_code: "0000".to_string(),
        }
    }

    #[test]
    fn test_sim_session_emits_connected_then_ticks() {
        let factory = SimSessionFactory::new(SimGatewayConfig {
            symbols: vec!["rb2401.SHFE".to_string(), "IF2312.CFFEX".to_string()],
            tick_interval_ms: 1,
            ..SimGatewayConfig::default()
        });
        let sink = Arc::new(CollectSink { events: Mutex::new(Vec::new()) });
        let shutdown = Arc::new(AtomicBool::new(false));

        let session = factory.create(&session_config());
        let sink_for_session: Arc<dyn EventSink> = Arc::clone(&sink) as Arc<dyn EventSink>;
        let stop = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || session.run(sink_for_session, stop));

        std::thread::sleep(Duration::from_millis(30));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();

        let events = sink.events.lock().unwrap();
        assert!(matches!(events[1], GatewayEvent::Connected));
        let ticks = events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::Tick(_)))
            .count();
        assert!(ticks >= 2, "expected ticks, got {ticks}");
        assert!(matches!(events.last(), Some(GatewayEvent::Disconnected { .. })));
    }

    #[test]
    fn test_sim_factory_scripts_transient_failures() {
        let factory = SimSessionFactory::new(SimGatewayConfig {
            fail_first_attempts: 2,
            tick_interval_ms: 1,
            ..SimGatewayConfig::default()
        });
        let sink: Arc<dyn EventSink> =
            Arc::new(CollectSink { events: Mutex::new(Vec::new()) });
        let shutdown = Arc::new(AtomicBool::new(true));

        for expect_err in [true, true, false] {
            let session = factory.create(&session_config());
            let result = session.run(Arc::clone(&sink), Arc::clone(&shutdown));
            assert_eq!(result.is_err(), expect_err);
        }
        assert_eq!(factory.attempts(), 3);
    }

    #[test]
    fn test_sim_auth_rejection_is_fatal() {
        let factory = SimSessionFactory::new(SimGatewayConfig {
            reject_auth: true,
            ..SimGatewayConfig::default()
        });
        let sink: Arc<dyn EventSink> =
            Arc::new(CollectSink { events: Mutex::new(Vec::new()) });
        let session = factory.create(&session_config());
        let err = session
            .run(sink, Arc::new(AtomicBool::new(false)))
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
