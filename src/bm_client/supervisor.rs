//! Session supervision.
//!
//! The supervisor owns the single active session and the single pending
//! connection attempt. Both live in one mutex-guarded state struct that is
//! never held across I/O. Concurrent `ensure_connected` callers all await the
//! same shared attempt and observe the same outcome.
//!
//! State machine: `Disconnected → Connecting → Connected → Disconnected`
//! (transport death or `stop`) `→ Connecting` (next `ensure_connected`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;

use super::errors::BmError;
use super::lifecycle::{ExitHook, SessionConnector, ToolSession};
use super::retry::RetryPolicy;
use super::tools;

type ConnectOutcome = Result<Arc<dyn ToolSession>, BmError>;
type PendingConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub session_id: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub tool_count: usize,
    pub connect_attempts: u64,
    pub should_run: bool,
}

struct ActiveSession {
    session: Arc<dyn ToolSession>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct SupervisorState {
    active: Option<ActiveSession>,
    pending: Option<PendingConnect>,
    should_run: bool,
    /// Bumped by `stop`; attempts started under an older epoch are abandoned.
    epoch: u64,
}

struct SupervisorInner {
    connector: Arc<dyn SessionConnector>,
    policy: RetryPolicy,
    state: Mutex<SupervisorState>,
    connect_attempts: AtomicU64,
}

/// Keeps at most one bm session alive and reconnects on demand.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl SessionSupervisor {
    pub fn new(connector: Arc<dyn SessionConnector>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                connector,
                policy,
                state: Mutex::new(SupervisorState::default()),
                connect_attempts: AtomicU64::new(0),
            }),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Mark the supervisor as running and connect eagerly, so total
    /// unavailability is reported here rather than on first use.
    pub async fn start(&self) -> Result<(), BmError> {
        self.inner.state.lock().await.should_run = true;
        tracing::info!("starting bm supervisor");
        self.ensure_connected().await.map(|_| ())
    }

    /// Mark the supervisor as stopped and tear down the current session.
    ///
    /// Any attempt in flight is abandoned; if it later succeeds, the session it
    /// produced is closed and its waiters get [`BmError::Stopped`].
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.inner.state.lock().await;
            state.should_run = false;
            state.epoch += 1;
            state.pending = None;
            state.active.take()
        };
        if let Some(active) = previous {
            tracing::info!(session_id = %active.session.id(), "stopping bm session");
            active.session.close().await;
        }
    }

    // ─── Connection ──────────────────────────────────────────────────────

    /// Return the live session, connecting (or joining the in-flight
    /// connection attempt) when there is none.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn ToolSession>, BmError> {
        let (pending, stale) = {
            let mut state = self.inner.state.lock().await;

            if let Some(active) = &state.active {
                if active.session.is_alive() {
                    return Ok(active.session.clone());
                }
            }
            let stale = state.active.take().map(|a| a.session);

            let pending = match &state.pending {
                Some(pending) => pending.clone(),
                None => {
                    let pending = spawn_connect(&self.inner, state.epoch);
                    state.pending = Some(pending.clone());
                    pending
                }
            };
            (pending, stale)
        };

        if let Some(session) = stale {
            tracing::debug!(session_id = %session.id(), "discarding dead bm session");
            session.close().await;
        }

        pending.await
    }

    /// Discard `session_id` if it is still the active session.
    ///
    /// Stale ids (a session already replaced) are ignored.
    pub async fn invalidate(&self, session_id: &str, reason: &str) {
        if let Some(session) = self.inner.detach(session_id).await {
            tracing::warn!(session_id = %session_id, reason, "invalidating bm session");
            session.close().await;
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.inner.state.lock().await;
        let (state_kind, session_id, connected_at, tool_count) = match &state.active {
            Some(active) if active.session.is_alive() => (
                ConnectionState::Connected,
                Some(active.session.id().to_string()),
                Some(active.connected_at),
                active.session.tool_names().len(),
            ),
            _ if state.pending.is_some() => (ConnectionState::Connecting, None, None, 0),
            _ => (ConnectionState::Disconnected, None, None, 0),
        };
        SessionStatus {
            state: state_kind,
            session_id,
            connected_at,
            tool_count,
            connect_attempts: self.inner.connect_attempts.load(Ordering::Relaxed),
            should_run: state.should_run,
        }
    }
}

impl SupervisorInner {
    /// Remove the active session if it has the given id.
    async fn detach(&self, session_id: &str) -> Option<Arc<dyn ToolSession>> {
        let mut state = self.state.lock().await;
        let is_current = state
            .active
            .as_ref()
            .is_some_and(|a| a.session.id() == session_id);
        if is_current {
            state.active.take().map(|a| a.session)
        } else {
            None
        }
    }

    /// One spawn attempt plus the required-tools check.
    ///
    /// A session missing required tools is closed and reported as a failed
    /// connection so it goes through the same backoff.
    async fn try_connect(self: &Arc<Self>) -> ConnectOutcome {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(attempt, "opening bm session");

        let session = self.connector.open(exit_hook(Arc::downgrade(self))).await?;

        let missing = tools::missing_required_tools(session.tool_names());
        if !missing.is_empty() {
            session.close().await;
            return Err(BmError::MissingTools { missing });
        }
        Ok(session)
    }
}

/// Run a retry campaign on its own task so it completes even when every
/// waiter goes away. The task only holds a weak handle to the supervisor.
fn spawn_connect(inner: &Arc<SupervisorInner>, epoch: u64) -> PendingConnect {
    let task = tokio::spawn(connect_with_retry(Arc::downgrade(inner), epoch));
    task.map(|joined| {
        joined.unwrap_or_else(|e| Err(BmError::transport(format!("connect task failed: {e}"))))
    })
    .boxed()
    .shared()
}

/// Retry campaign for one pending attempt. Publishes the outcome into the
/// supervisor state unless `stop` ran or the supervisor was dropped.
async fn connect_with_retry(weak: Weak<SupervisorInner>, epoch: u64) -> ConnectOutcome {
    let mut delays = match weak.upgrade() {
        Some(inner) => inner.policy.delays().collect::<Vec<_>>().into_iter(),
        None => return Err(BmError::Stopped),
    };
    let mut attempts: u32 = 0;

    let outcome = loop {
        attempts += 1;
        let Some(inner) = weak.upgrade() else {
            return Err(BmError::Stopped);
        };
        if inner.state.lock().await.epoch != epoch {
            return Err(BmError::Stopped);
        }
        let err = match inner.try_connect().await {
            Ok(session) => break Ok(session),
            Err(e) => e,
        };
        drop(inner);

        match delays.next() {
            Some(delay) => {
                tracing::warn!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "bm connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                tracing::error!(attempts, error = %err, "bm connection retries exhausted");
                break Err(BmError::ServiceUnavailable {
                    attempts,
                    reason: err.to_string(),
                });
            }
        }
    };

    let Some(inner) = weak.upgrade() else {
        if let Ok(session) = outcome {
            session.close().await;
        }
        return Err(BmError::Stopped);
    };
    let mut state = inner.state.lock().await;
    if state.epoch != epoch {
        drop(state);
        if let Ok(session) = outcome {
            tracing::debug!(session_id = %session.id(), "closing session opened after stop");
            session.close().await;
        }
        return Err(BmError::Stopped);
    }

    state.pending = None;
    if let Ok(session) = &outcome {
        state.active = Some(ActiveSession {
            session: session.clone(),
            connected_at: Utc::now(),
        });
    }
    outcome
}

/// Exit hook handed to each new session: forget it once its channel dies.
fn exit_hook(inner: Weak<SupervisorInner>) -> ExitHook {
    Arc::new(move |session_id: &str| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Some(session) = inner.detach(&session_id).await {
                let should_run = inner.state.lock().await.should_run;
                if should_run {
                    tracing::warn!(session_id = %session_id, "bm process exited unexpectedly");
                } else {
                    tracing::debug!(session_id = %session_id, "bm process exited");
                }
                session.close().await;
            }
        });
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bm_client::types::CallToolResult;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::Instant;

    pub(crate) type CallHandler =
        Arc<dyn Fn(&str, &serde_json::Value) -> Result<CallToolResult, BmError> + Send + Sync>;

    /// In-memory session that answers calls through a handler.
    pub(crate) struct FakeSession {
        id: String,
        tools: Vec<String>,
        alive: AtomicBool,
        handler: CallHandler,
        pub(crate) calls: Arc<StdMutex<Vec<(String, serde_json::Value)>>>,
        hook: ExitHook,
    }

    impl FakeSession {
        /// Simulate the process dying: mark dead and fire the exit hook.
        pub(crate) fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
            (self.hook)(&self.id);
        }
    }

    impl ToolSession for FakeSession {
        fn id(&self) -> &str {
            &self.id
        }
        fn tool_names(&self) -> &[String] {
            &self.tools
        }
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn call_tool<'a>(
            &'a self,
            name: &'a str,
            arguments: serde_json::Value,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<CallToolResult, BmError>> {
            async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push((name.to_string(), arguments.clone()));
                (self.handler)(name, &arguments)
            }
            .boxed()
        }
        fn close(&self) -> BoxFuture<'_, ()> {
            self.alive.store(false, Ordering::SeqCst);
            async {}.boxed()
        }
    }

    /// Connector that counts spawns and follows a scripted plan.
    pub(crate) struct FakeConnector {
        pub(crate) spawns: AtomicUsize,
        /// Per-attempt results; `false` fails the attempt. Empty = succeed.
        plan: StdMutex<VecDeque<bool>>,
        tools: Vec<String>,
        open_delay: Duration,
        handler: CallHandler,
        pub(crate) calls: Arc<StdMutex<Vec<(String, serde_json::Value)>>>,
        pub(crate) sessions: StdMutex<Vec<Arc<FakeSession>>>,
    }

    impl FakeConnector {
        pub(crate) fn new(handler: CallHandler) -> Self {
            Self {
                spawns: AtomicUsize::new(0),
                plan: StdMutex::new(VecDeque::new()),
                tools: tools::REQUIRED_TOOLS.iter().map(|s| s.to_string()).collect(),
                open_delay: Duration::from_millis(10),
                handler,
                calls: Arc::new(StdMutex::new(Vec::new())),
                sessions: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn ok() -> Self {
            Self::new(Arc::new(|_: &str, _: &serde_json::Value| {
                Ok(CallToolResult {
                    structured_content: Some(serde_json::json!({})),
                    ..Default::default()
                })
            }))
        }

        pub(crate) fn with_plan(self, plan: &[bool]) -> Self {
            *self.plan.lock().unwrap() = plan.iter().copied().collect();
            self
        }

        pub(crate) fn without_tool(mut self, name: &str) -> Self {
            self.tools.retain(|t| t != name);
            self
        }

        pub(crate) fn spawn_count(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub(crate) fn last_session(&self) -> Option<Arc<FakeSession>> {
            self.sessions.lock().unwrap().last().cloned()
        }
    }

    impl SessionConnector for FakeConnector {
        fn open(&self, on_exit: ExitHook) -> BoxFuture<'_, Result<Arc<dyn ToolSession>, BmError>> {
            async move {
                let n = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.open_delay).await;
                let succeed = self.plan.lock().unwrap().pop_front().unwrap_or(true);
                if !succeed {
                    return Err(BmError::SpawnFailed {
                        command: "bm".into(),
                        reason: format!("scripted failure #{n}"),
                    });
                }
                let session = Arc::new(FakeSession {
                    id: format!("fake-{n}"),
                    tools: self.tools.clone(),
                    alive: AtomicBool::new(true),
                    handler: self.handler.clone(),
                    calls: self.calls.clone(),
                    hook: on_exit,
                });
                self.sessions.lock().unwrap().push(session.clone());
                Ok(session as Arc<dyn ToolSession>)
            }
            .boxed()
        }
    }

    fn supervisor(connector: &Arc<FakeConnector>, delays_ms: &[u64]) -> SessionSupervisor {
        SessionSupervisor::new(connector.clone(), RetryPolicy::from_millis(delays_ms))
    }

    #[tokio::test]
    async fn test_concurrent_ensure_connected_spawns_once() {
        let connector = Arc::new(FakeConnector::ok());
        let sup = supervisor(&connector, &[10]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sup = sup.clone();
                tokio::spawn(async move { sup.ensure_connected().await })
            })
            .collect();

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().id().to_string());
        }
        assert_eq!(connector.spawn_count(), 1);
        assert!(ids.iter().all(|id| id == &ids[0]));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_failure() {
        let connector = Arc::new(FakeConnector::ok().with_plan(&[false, false]));
        let sup = supervisor(&connector, &[5]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sup = sup.clone();
                tokio::spawn(async move { sup.ensure_connected().await })
            })
            .collect();

        for h in handles {
            let err = h.await.unwrap().err().unwrap();
            assert!(matches!(err, BmError::ServiceUnavailable { attempts: 2, .. }));
            assert!(err.to_string().contains("scripted failure #2"));
        }
        assert_eq!(connector.spawn_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_success_on_fourth_attempt() {
        let connector = Arc::new(FakeConnector::ok().with_plan(&[false, false, false, true]));
        let sup = supervisor(&connector, &[500, 1000, 2000]);

        let started = Instant::now();
        let session = sup.ensure_connected().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(3500));
        assert_eq!(connector.spawn_count(), 4);
        assert_eq!(session.id(), "fake-4");
        assert_eq!(sup.status().await.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_live_session_reused_without_io() {
        let connector = Arc::new(FakeConnector::ok());
        let sup = supervisor(&connector, &[]);

        let first = sup.ensure_connected().await.unwrap();
        let second = sup.ensure_connected().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(connector.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_start_like_handshake() {
        let connector = Arc::new(FakeConnector::ok().without_tool(tools::SCHEMA_DIFF));
        let sup = supervisor(&connector, &[1, 1]);

        let err = sup.start().await.unwrap_err();
        match &err {
            BmError::ServiceUnavailable { attempts, reason } => {
                assert_eq!(*attempts, 3);
                assert!(reason.contains("schema_diff"));
            }
            other => panic!("expected ServiceUnavailable, got {other:?}"),
        }
        assert_eq!(connector.spawn_count(), 3);

        let status = sup.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.session_id.is_none());
        assert!(connector
            .sessions
            .lock()
            .unwrap()
            .iter()
            .all(|s| !s.is_alive()));
    }

    #[tokio::test]
    async fn test_exit_hook_forces_reconnect() {
        let connector = Arc::new(FakeConnector::ok());
        let sup = supervisor(&connector, &[]);

        sup.start().await.unwrap();
        connector.last_session().unwrap().kill();
        // Let the hook's task run.
        tokio::task::yield_now().await;

        let session = sup.ensure_connected().await.unwrap();
        assert_eq!(session.id(), "fake-2");
        assert_eq!(connector.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_dead_session_replaced_even_without_hook() {
        let connector = Arc::new(FakeConnector::ok());
        let sup = supervisor(&connector, &[]);

        let first = sup.ensure_connected().await.unwrap();
        first.close().await;

        let second = sup.ensure_connected().await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_stop_tears_down_and_next_call_reconnects() {
        let connector = Arc::new(FakeConnector::ok());
        let sup = supervisor(&connector, &[]);

        sup.start().await.unwrap();
        assert!(sup.status().await.should_run);
        sup.stop().await;

        let status = sup.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.should_run);
        assert!(!connector.last_session().unwrap().is_alive());

        sup.ensure_connected().await.unwrap();
        assert_eq!(connector.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_attempt_finishing_after_stop_is_discarded() {
        let connector = Arc::new(FakeConnector::ok());
        let sup = supervisor(&connector, &[]);

        let waiter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure_connected().await })
        };
        while connector.spawn_count() == 0 {
            tokio::task::yield_now().await;
        }
        sup.stop().await;

        let err = waiter.await.unwrap().err().unwrap();
        assert!(matches!(err, BmError::Stopped));
        assert!(!connector.last_session().unwrap().is_alive());
        assert_eq!(sup.status().await.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_attempt_completes_after_only_waiter_is_cancelled() {
        let connector = Arc::new(FakeConnector::ok());
        let sup = supervisor(&connector, &[]);

        let waiter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure_connected().await })
        };
        while connector.spawn_count() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = sup.status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.session_id.as_deref(), Some("fake-1"));

        // The published session is reused, not re-spawned.
        sup.ensure_connected().await.unwrap();
        assert_eq!(connector.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_supervisor_mid_attempt_frees_it() {
        let connector = Arc::new(FakeConnector::ok().with_plan(&[false, true]));
        let sup = supervisor(&connector, &[50]);
        let weak = Arc::downgrade(&sup.inner);

        let waiter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure_connected().await })
        };
        while connector.spawn_count() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        drop(sup);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(weak.upgrade().is_none());
        // The campaign gave up during its backoff instead of spawning again.
        assert_eq!(connector.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_ignores_stale_id() {
        let connector = Arc::new(FakeConnector::ok());
        let sup = supervisor(&connector, &[]);

        let session = sup.ensure_connected().await.unwrap();
        sup.invalidate("fake-999", "test").await;
        assert!(session.is_alive());

        sup.invalidate(session.id(), "test").await;
        assert!(!session.is_alive());
        assert_eq!(sup.status().await.state, ConnectionState::Disconnected);
    }
}
