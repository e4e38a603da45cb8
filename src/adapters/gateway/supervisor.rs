//! Gateway Supervisor - Session Lifecycle and Reconnect Policy
//!
//! Owns connect/monitor/disconnect of the blocking vendor session.
//! Every attempt runs a *fresh* session (via the factory) on a newly
//! spawned, named OS thread; the vendor API does not tolerate reusing
//! a session object across reconnects. Transient faults retry forever
//! with capped exponential backoff + jitter; a fatal fault (bad
//! credentials) stops retrying immediately and parks the supervisor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::config::{GatewayConfig, RetryConfig};
use crate::ports::gateway::{
    EventSink, GatewayError, GatewayEvent, SessionConfig, SessionFactory,
};
use crate::domain::runbook::ProfileName;

/// Connection lifecycle states, observable via a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Session lost mid-stream; a reconnect is pending.
    Degraded,
    Reconnecting,
    /// Non-retryable failure; operator intervention required.
    Fatal,
}

/// Exponential backoff with jitter, capped at a maximum interval.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub jitter_fraction: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            multiplier: config.multiplier,
            cap: Duration::from_millis(config.cap_ms),
            jitter_fraction: config.jitter_fraction,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay before retry `attempt` (1-based):
    /// `min(base * multiplier^(attempt-1), cap)`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.base.as_millis() as f64 * factor)
            .min(self.cap.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay with uniform jitter in `[0, jitter_fraction * delay]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let span = base.as_millis() as f64 * self.jitter_fraction;
        let jitter = rand::thread_rng().gen_range(0.0..=span.max(f64::MIN_POSITIVE));
        base + Duration::from_millis(jitter as u64)
    }
}

/// Supervises the blocking gateway session.
pub struct GatewaySupervisor {
    factory: Arc<dyn SessionFactory>,
    sink: Arc<dyn EventSink>,
    policy: RetryPolicy,
    gateway_config: GatewayConfig,
    active_profile: Mutex<ProfileName>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Global stop signal for the supervisor loop.
    shutdown: AtomicBool,
    /// Stop signal for the *current* session only (profile switch).
    session_flag: Mutex<Option<Arc<AtomicBool>>>,
    session_counter: AtomicU64,
    reconnects: AtomicU64,
    running: AtomicBool,
}

impl GatewaySupervisor {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn EventSink>,
        gateway_config: GatewayConfig,
        retry: &RetryConfig,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let route = gateway_config.route;
        Arc::new(Self {
            factory,
            sink,
            policy: RetryPolicy::from(retry),
            gateway_config,
            active_profile: Mutex::new(route),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown: AtomicBool::new(false),
            session_flag: Mutex::new(None),
            session_counter: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// Observe connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Currently active credential profile.
    pub fn active_profile(&self) -> ProfileName {
        *lock_unpoisoned(&self.active_profile)
    }

    /// Total session restarts since startup.
    pub fn reconnects_total(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Switch to another credential profile and recycle the running
    /// session. Returns without waiting for the new session; readiness
    /// is observable through the state watch.
    pub fn switch_profile(&self, profile: ProfileName) {
        {
            let mut active = lock_unpoisoned(&self.active_profile);
            if *active == profile {
                return;
            }
            *active = profile;
        }
        info!(profile = %profile, "Gateway profile switched, recycling session");
        // Drop out of Connected right away: readiness gates must see
        // the NEW profile's session come up, not the dying one.
        self.set_state(ConnectionState::Degraded);
        self.recycle_session();
    }

    /// Ask the current session to end; the supervisor loop rebuilds a
    /// fresh one with the active profile.
    pub fn recycle_session(&self) {
        if let Some(flag) = lock_unpoisoned(&self.session_flag).as_ref() {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Start supervising. Returns immediately; readiness is reported
    /// asynchronously via lifecycle events and the state watch. A
    /// supervisor that is already running is left alone (`None`).
    pub fn connect(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.shutdown.store(false, Ordering::Relaxed);
        let supervisor = Arc::clone(self);
        Some(tokio::spawn(async move { supervisor.supervise().await }))
    }

    /// Whether the supervise loop is currently alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Guarantee a supervise loop is up.
    ///
    /// A loop that is still draining a previous shutdown is waited out
    /// and then replaced; an alive, non-stopping loop is left alone.
    pub async fn ensure_connected(self: &Arc<Self>) {
        loop {
            if self.connect().is_some() {
                return;
            }
            if !self.shutdown.load(Ordering::Relaxed) {
                // Already supervising and not shutting down.
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Signal shutdown; the session thread observes it on its next poll.
    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.recycle_session();
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        while !self.shutdown.load(Ordering::Relaxed) {
            let profile_name = self.active_profile();
            let session_config = match self.build_session_config(profile_name) {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %e, profile = %profile_name, "Cannot build session config");
                    self.set_state(ConnectionState::Fatal);
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            self.set_state(ConnectionState::Connecting);
            let result = self.run_session(session_config).await;

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match result {
                Ok(()) => {
                    // The vendor loop returned without error and without a
                    // global shutdown: deliberate recycle or quiet vendor
                    // disconnect. Reconnect promptly, backoff restarts.
                    attempt = 1;
                    self.set_state(ConnectionState::Degraded);
                    info!("Gateway session ended, rebuilding with fresh session");
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal gateway fault, retries stopped");
                    self.set_state(ConnectionState::Fatal);
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    self.set_state(ConnectionState::Degraded);
                    warn!(attempt, error = %e, "Gateway session failed, reconnecting");
                }
            }

            self.reconnects.fetch_add(1, Ordering::Relaxed);
            let delay = self.policy.delay_for(attempt);
            self.set_state(ConnectionState::Reconnecting);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
            tokio::time::sleep(delay).await;
        }

        self.set_state(ConnectionState::Disconnected);
        self.running.store(false, Ordering::SeqCst);
        info!("Gateway supervisor stopped");
    }

    /// Run one session attempt on a fresh named OS thread and wait for
    /// it to finish.
    async fn run_session(&self, config: SessionConfig) -> Result<(), GatewayError> {
        let session = self.factory.create(&config);
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;

        let flag = Arc::new(AtomicBool::new(false));
        *lock_unpoisoned(&self.session_flag) = Some(Arc::clone(&flag));
        // A shutdown that raced the flag swap must still reach the
        // session we are about to start.
        if self.shutdown.load(Ordering::Relaxed) {
            flag.store(true, Ordering::Relaxed);
        }

        // Lifecycle events pass through here so the state watch tracks
        // what the session actually reports.
        let sink: Arc<dyn EventSink> = Arc::new(SupervisorSink {
            inner: Arc::clone(&self.sink),
            state_tx: Arc::clone(&self.state_tx),
        });
        let (done_tx, done_rx) = oneshot::channel();

        let spawn = std::thread::Builder::new()
            .name(format!("md-session-{session_id}"))
            .spawn(move || {
                let result = session.run(sink, flag);
                let _ = done_tx.send(result);
            });

        if let Err(e) = spawn {
            return Err(GatewayError::Transient(format!("session thread spawn failed: {e}")));
        }

        let result = done_rx
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::Transient("session thread panicked".to_string()))
            });

        *lock_unpoisoned(&self.session_flag) = None;
        result
    }

    fn build_session_config(&self, profile_name: ProfileName) -> anyhow::Result<SessionConfig> {
        let profile = self.gateway_config.profile(profile_name)?;
        Ok(SessionConfig {
            broker_id: profile.broker_id.clone(),
            user_id: profile.user_id.clone(),
            password: profile.password.clone(),
            md_address: SessionConfig::normalize_address(&profile.md_address),
            td_address: SessionConfig::normalize_address(&profile.td_address),
            app_id: profile.app_id.clone(),
            auth_code: profile.auth_code.clone(),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

/// Forwards session events to the bridge while mirroring connection
/// lifecycle into the supervisor's state watch.
struct SupervisorSink {
    inner: Arc<dyn EventSink>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl EventSink for SupervisorSink {
    fn emit(&self, event: GatewayEvent) {
        match &event {
            GatewayEvent::Connected => {
                let _ = self.state_tx.send(ConnectionState::Connected);
            }
            GatewayEvent::Disconnected { .. } => {
                let _ = self.state_tx.send(ConnectionState::Degraded);
            }
            _ => {}
        }
        self.inner.emit(event);
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayProfile, RetryConfig};
    use crate::ports::gateway::{GatewayEvent, GatewaySession};

    fn retry_config() -> RetryConfig {
        RetryConfig {
            base_ms: 500,
            multiplier: 2.0,
            cap_ms: 2_000,
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn test_backoff_formula() {
        let policy = RetryPolicy::from(&retry_config());
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(2_000));
        // Capped from attempt 3 onwards.
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(2_000));
        assert_eq!(policy.base_delay_for(10), Duration::from_millis(2_000));
    }

    #[test]
    fn test_jitter_within_bound() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1_000),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter_fraction: 0.2,
        };
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_200));
        }
    }

    // -- Scripted factory: fails N times, then runs until shutdown --

    struct ScriptedSession {
        outcome: Option<GatewayError>,
    }

    impl GatewaySession for ScriptedSession {
        fn run(
            self: Box<Self>,
            sink: Arc<dyn EventSink>,
            shutdown: Arc<AtomicBool>,
        ) -> Result<(), GatewayError> {
            match self.outcome {
                Some(err) => Err(err),
                None => {
                    sink.emit(GatewayEvent::Connected);
                    while !shutdown.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                }
            }
        }
    }

    struct ScriptedFactory {
        failures: u32,
        fatal: bool,
        created: AtomicU64,
    }

    impl SessionFactory for ScriptedFactory {
        fn create(&self, _config: &SessionConfig) -> Box<dyn GatewaySession> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = if n <= self.failures as u64 {
                if self.fatal {
                    Some(GatewayError::Fatal("auth rejected".to_string()))
                } else {
                    Some(GatewayError::Transient("socket closed".to_string()))
                }
            } else {
                None
            };
            Box::new(ScriptedSession { outcome })
        }
    }

    struct NullSink;
    impl EventSink for NullSink {
        fn emit(&self, _event: GatewayEvent) {}
    }

    fn profile() -> GatewayProfile {
        GatewayProfile {
            broker_id: "9999".to_string(),
            user_id: "100001".to_string(),
            password: "pw".to_string(),
            md_address: "1.2.3.4:10211".to_string(),
            td_address: "1.2.3.4:10201".to_string(),
            app_id: "bridge".to_string(),
            auth_code: "0000".to_string(),
        }
    }

    fn gateway_config() -> GatewayConfig {
        GatewayConfig {
            route: ProfileName::Primary,
            primary: profile(),
            backup: Some(profile()),
            symbols: vec![],
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            base_ms: 1,
            multiplier: 2.0,
            cap_ms: 5,
            jitter_fraction: 0.0,
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<ConnectionState>,
        want: ConnectionState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow() == want {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
    }

    #[tokio::test]
    async fn test_fresh_session_created_per_attempt() {
        let factory = Arc::new(ScriptedFactory {
            failures: 3,
            fatal: false,
            created: AtomicU64::new(0),
        });
        let supervisor = GatewaySupervisor::new(
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
            Arc::new(NullSink),
            gateway_config(),
            &fast_retry(),
        );

        let mut state = supervisor.state();
        let handle = supervisor.connect().unwrap();

        wait_for_state(&mut state, ConnectionState::Connecting).await;
        // Three failed attempts then a session that stays up.
        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.created.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
        assert_eq!(supervisor.reconnects_total(), 3);

        supervisor.disconnect();
        let _ = handle.await;
        assert_eq!(*supervisor.state().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_fatal_fault_stops_retries() {
        let factory = Arc::new(ScriptedFactory {
            failures: 10,
            fatal: true,
            created: AtomicU64::new(0),
        });
        let supervisor = GatewaySupervisor::new(
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
            Arc::new(NullSink),
            gateway_config(),
            &fast_retry(),
        );

        let mut state = supervisor.state();
        let handle = supervisor.connect().unwrap();
        wait_for_state(&mut state, ConnectionState::Fatal).await;
        let _ = handle.await;

        // Exactly one session was attempted; fatal faults never retry.
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_profile_switch_recycles_session() {
        let factory = Arc::new(ScriptedFactory {
            failures: 0,
            fatal: false,
            created: AtomicU64::new(0),
        });
        let supervisor = GatewaySupervisor::new(
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
            Arc::new(NullSink),
            gateway_config(),
            &fast_retry(),
        );

        let mut state = supervisor.state();
        let handle = supervisor.connect().unwrap();
        // The session has emitted Connected, so its recycle flag is in
        // place before we ask for the switch.
        wait_for_state(&mut state, ConnectionState::Connected).await;

        supervisor.switch_profile(ProfileName::Backup);
        assert_eq!(supervisor.active_profile(), ProfileName::Backup);

        // A second, fresh session comes up on the backup profile.
        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.created.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        supervisor.disconnect();
        let _ = handle.await;
    }
}
