//! Ownership of the single control-plane connection to the hotspot controller.
//!
//! [`DeviceManager`] is the only component that opens, closes or writes the connection.
//! It is a small state machine:
//!
//! ```text
//!                 ensure_ready()            connect ok
//!  Disconnected ────────────────► Connecting ─────────► Ready
//!       ▲                             │                   │
//!       │          connect failed     │                   │ transport error event
//!       ├─────────────────────────────┘                   ▼
//!       └──────────────── close connection ─────────── Error
//!                         (+ one delayed reconnect)
//! ```
//!
//! Requests drive reconnection through [`DeviceManager::ensure_ready`]. The connection
//! itself reports asynchronous failures on a [`DeviceEvents`] channel handed to it at
//! construction; the manager reacts by closing it and scheduling exactly one reconnect
//! after [`DEFAULT_RECONNECT_DELAY`]. Both paths go through the same guarded transition,
//! so at most one connection attempt is ever in flight.

pub mod routeros;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One `!re` reply of a command, as attribute name → value.
pub type Row = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The connection is not ready and could not be (re-)established.
    #[error("Device unavailable: {0}")]
    Unavailable(String),
    /// The device answered the command with an error.
    #[error("Device rejected command: {0}")]
    Command(String),
    /// The connection broke while a command was in flight.
    #[error("Device transport error: {0}")]
    Transport(String),
    #[error("Device did not answer within {0:?}")]
    Timeout(Duration),
    /// The device sent something that does not follow the API protocol.
    #[error("Device protocol error: {0}")]
    Protocol(String),
}

/// Connection-initiated notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    TransportError { generation: u64, error: String },
}

/// Sending half of the manager's event channel, bound to one connection generation so
/// that late errors from an already replaced connection are ignored.
#[derive(Debug, Clone)]
pub struct DeviceEvents {
    generation: u64,
    sender: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceEvents {
    pub fn transport_error(&self, error: impl Display) {
        let event = DeviceEvent::TransportError {
            generation: self.generation,
            error: error.to_string(),
        };
        // The manager is gone when the receiver is closed; nobody is left to heal.
        let _ = self.sender.send(event);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Opens authenticated control-plane connections.
#[async_trait]
pub trait DeviceConnector: Send + Sync + 'static {
    /// Connects and authenticates, honoring the transport's own timeout.
    ///
    /// The returned connection must report asynchronous failures on `events`.
    async fn connect(&self, events: DeviceEvents) -> Result<Arc<dyn DeviceConnection>, DeviceError>;
}

/// An established control-plane connection.
#[async_trait]
pub trait DeviceConnection: Send + Sync + 'static {
    /// Runs a single command, e.g. `/ip/hotspot/user/add` with `name`, `password`, `profile`.
    async fn write(&self, path: &str, args: &[(&str, &str)]) -> Result<Vec<Row>, DeviceError>;

    /// Closes the connection. Must be idempotent.
    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Error,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

type ConnectOutcome = Option<Result<Arc<dyn DeviceConnection>, DeviceError>>;

enum Link {
    Disconnected,
    /// The in-flight attempt; every caller waits on the same outcome.
    Connecting(watch::Receiver<ConnectOutcome>),
    Ready {
        connection: Arc<dyn DeviceConnection>,
        generation: u64,
    },
    Error,
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting(_) => ConnectionState::Connecting,
            Link::Ready { .. } => ConnectionState::Ready,
            Link::Error => ConnectionState::Error,
        }
    }
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct DeviceManager {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Box<dyn DeviceConnector>,
    link: Mutex<Link>,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<DeviceEvent>,
    reconnect_scheduled: AtomicBool,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

impl DeviceManager {
    /// Creates a manager in the `Disconnected` state and starts its event listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<C: DeviceConnector>(connector: C) -> Self {
        Self::with_options(connector, DEFAULT_RECONNECT_DELAY, CancellationToken::new())
    }

    /// Like [`DeviceManager::new`], with a custom reconnect delay and a token that stops
    /// the listener and any pending reconnect.
    pub fn with_options<C: DeviceConnector>(
        connector: C,
        reconnect_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, mut receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connector: Box::new(connector),
            link: Mutex::new(Link::Disconnected),
            next_generation: AtomicU64::new(0),
            events,
            reconnect_scheduled: AtomicBool::new(false),
            reconnect_delay,
            shutdown: shutdown.clone(),
        });
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => event,
                };
                let (Some(event), Some(shared)) = (event, weak.upgrade()) else {
                    break;
                };
                shared.handle_event(event).await;
            }
        });
        Self { shared }
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.link.lock().await.state()
    }

    /// Returns once the connection is `Ready`, connecting if needed.
    ///
    /// Callers arriving while an attempt is in flight wait for that attempt's outcome
    /// instead of starting their own. A failed attempt surfaces as
    /// [`DeviceError::Unavailable`] and leaves the manager `Disconnected`.
    pub async fn ensure_ready(&self) -> Result<(), DeviceError> {
        Arc::clone(&self.shared).ensure_ready().await.map(|_| ())
    }

    /// Runs a command on the `Ready` connection. Never connects and never retries.
    pub async fn write_command(
        &self,
        path: &str,
        args: &[(&str, &str)],
    ) -> Result<Vec<Row>, DeviceError> {
        let connection = {
            let link = self.shared.link.lock().await;
            match &*link {
                Link::Ready { connection, .. } => Arc::clone(connection),
                other => {
                    return Err(DeviceError::Unavailable(format!(
                        "connection is {}",
                        other.state()
                    )));
                }
            }
        };
        connection.write(path, args).await
    }

    /// Drops the current connection and returns to `Disconnected`.
    ///
    /// An attempt already in flight is left alone; its fresh connection is kept.
    pub async fn force_disconnect(&self) {
        let previous = {
            let mut link = self.shared.link.lock().await;
            match &*link {
                Link::Connecting(_) => return,
                _ => std::mem::replace(&mut *link, Link::Disconnected),
            }
        };
        if let Link::Ready { connection, generation } = previous {
            tracing::info!(generation, "Forcing device disconnect");
            connection.close().await;
        }
    }
}

impl Shared {
    async fn ensure_ready(self: Arc<Self>) -> Result<Arc<dyn DeviceConnection>, DeviceError> {
        let mut outcome = {
            let mut link = self.link.lock().await;
            match &*link {
                Link::Ready { connection, .. } => return Ok(Arc::clone(connection)),
                Link::Connecting(outcome) => outcome.clone(),
                Link::Disconnected | Link::Error => {
                    let (sender, outcome) = watch::channel(None);
                    *link = Link::Connecting(outcome.clone());
                    // Detached so that a caller giving up cannot strand the manager in
                    // `Connecting`.
                    tokio::spawn(Arc::clone(&self).connect(sender));
                    outcome
                }
            }
        };
        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DeviceError::Unavailable("connection attempt was dropped".to_string()))?
            .clone();
        result.unwrap_or_else(|| {
            Err(DeviceError::Unavailable(
                "connection attempt ended without outcome".to_string(),
            ))
        })
    }

    async fn connect(self: Arc<Self>, outcome: watch::Sender<ConnectOutcome>) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = DeviceEvents {
            generation,
            sender: self.events.clone(),
        };
        tracing::info!(generation, "Connecting to device");
        let result = self.connector.connect(events).await;
        let result = {
            let mut link = self.link.lock().await;
            match result {
                Ok(connection) => {
                    tracing::info!(generation, "Device connection ready");
                    *link = Link::Ready {
                        connection: Arc::clone(&connection),
                        generation,
                    };
                    Ok(connection)
                }
                Err(error) => {
                    tracing::warn!(generation, %error, "Device connection failed");
                    *link = Link::Disconnected;
                    Err(DeviceError::Unavailable(error.to_string()))
                }
            }
        };
        outcome.send_replace(Some(result));
    }

    async fn handle_event(self: Arc<Self>, event: DeviceEvent) {
        match event {
            DeviceEvent::TransportError { generation, error } => {
                self.on_transport_error(generation, &error).await
            }
        }
    }

    async fn on_transport_error(self: Arc<Self>, generation: u64, error: &str) {
        let connection = {
            let mut link = self.link.lock().await;
            match &*link {
                Link::Ready { generation: current, .. } if *current == generation => {}
                _ => {
                    tracing::debug!(generation, error, "Ignoring error from stale connection");
                    return;
                }
            }
            match std::mem::replace(&mut *link, Link::Error) {
                Link::Ready { connection, .. } => connection,
                _ => return,
            }
        };
        tracing::warn!(generation, error, "Device transport error, closing connection");
        connection.close().await;
        {
            let mut link = self.link.lock().await;
            if matches!(*link, Link::Error) {
                *link = Link::Disconnected;
            }
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: Arc<Self>) {
        if self.reconnect_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = self.reconnect_delay;
        tracing::info!(?delay, "Scheduling device reconnect");
        tokio::spawn(async move {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            self.reconnect_scheduled.store(false, Ordering::SeqCst);
            if let Err(error) = Arc::clone(&self).ensure_ready().await {
                tracing::warn!(%error, "Scheduled device reconnect failed");
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory device used by the manager, issuer and engine tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// What the next `connect` or `write` call does.
    #[derive(Debug, Clone)]
    pub enum Step {
        Ok,
        Fail(DeviceError),
    }

    #[derive(Default)]
    pub struct Script {
        pub connects: std::sync::Mutex<VecDeque<Step>>,
        pub writes: std::sync::Mutex<VecDeque<Step>>,
        pub connect_calls: AtomicUsize,
        pub write_calls: std::sync::Mutex<Vec<(String, Vec<(String, String)>)>>,
        pub closed: AtomicUsize,
        pub connect_delay: std::sync::Mutex<Option<Duration>>,
        pub last_events: std::sync::Mutex<Option<DeviceEvents>>,
    }

    impl Script {
        pub fn connects(&self, steps: impl IntoIterator<Item = Step>) {
            self.connects.lock().unwrap().extend(steps);
        }

        pub fn writes(&self, steps: impl IntoIterator<Item = Step>) {
            self.writes.lock().unwrap().extend(steps);
        }

        pub fn connect_calls(&self) -> usize {
            self.connect_calls.load(Ordering::SeqCst)
        }

        pub fn write_calls(&self) -> Vec<(String, Vec<(String, String)>)> {
            self.write_calls.lock().unwrap().clone()
        }

        /// Simulates the live connection failing between requests.
        pub fn break_connection(&self) {
            if let Some(events) = self.last_events.lock().unwrap().as_ref() {
                events.transport_error("connection reset by peer");
            }
        }
    }

    /// Unscripted calls succeed.
    #[derive(Clone, Default)]
    pub struct ScriptedConnector(pub Arc<Script>);

    struct ScriptedConnection(Arc<Script>);

    #[async_trait]
    impl DeviceConnector for ScriptedConnector {
        async fn connect(
            &self,
            events: DeviceEvents,
        ) -> Result<Arc<dyn DeviceConnection>, DeviceError> {
            self.0.connect_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.0.connect_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let step = self.0.connects.lock().unwrap().pop_front().unwrap_or(Step::Ok);
            match step {
                Step::Ok => {
                    *self.0.last_events.lock().unwrap() = Some(events);
                    Ok(Arc::new(ScriptedConnection(Arc::clone(&self.0))))
                }
                Step::Fail(error) => Err(error),
            }
        }
    }

    #[async_trait]
    impl DeviceConnection for ScriptedConnection {
        async fn write(&self, path: &str, args: &[(&str, &str)]) -> Result<Vec<Row>, DeviceError> {
            let args = args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.0.write_calls.lock().unwrap().push((path.to_string(), args));
            let step = self.0.writes.lock().unwrap().pop_front().unwrap_or(Step::Ok);
            match step {
                Step::Ok => Ok(vec![]),
                Step::Fail(error) => Err(error),
            }
        }

        async fn close(&self) {
            self.0.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn refused() -> DeviceError {
        DeviceError::Transport("connection refused".to_string())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_starts_disconnected_and_connects_on_demand() {
        let connector = ScriptedConnector::default();
        let manager = DeviceManager::new(connector.clone());
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        manager.ensure_ready().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Ready);
        manager.ensure_ready().await.unwrap();
        assert_eq!(connector.0.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_is_unavailable_and_disconnected() {
        let connector = ScriptedConnector::default();
        connector.0.connects([Step::Fail(refused())]);
        let manager = DeviceManager::new(connector.clone());

        let error = manager.ensure_ready().await.unwrap_err();
        assert!(matches!(error, DeviceError::Unavailable(_)));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        manager.ensure_ready().await.unwrap();
        assert_eq!(connector.0.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_attempt() {
        let connector = ScriptedConnector::default();
        *connector.0.connect_delay.lock().unwrap() = Some(Duration::from_secs(1));
        connector.0.connects([Step::Fail(refused())]);
        let manager = DeviceManager::new(connector.clone());

        let results = futures_util::future::join_all(
            (0..8).map(|_| {
                let manager = manager.clone();
                async move { manager.ensure_ready().await }
            }),
        )
        .await;
        assert_eq!(connector.0.connect_calls(), 1);
        assert!(results.iter().all(|r| matches!(r, Err(DeviceError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn test_write_requires_ready() {
        let connector = ScriptedConnector::default();
        let manager = DeviceManager::new(connector.clone());
        let error = manager.write_command("/system/identity/print", &[]).await.unwrap_err();
        assert!(matches!(error, DeviceError::Unavailable(_)));
        assert_eq!(connector.0.connect_calls(), 0);

        manager.ensure_ready().await.unwrap();
        manager.write_command("/system/identity/print", &[]).await.unwrap();
        assert_eq!(connector.0.write_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_not_retried() {
        let connector = ScriptedConnector::default();
        connector.0.writes([Step::Fail(DeviceError::Command("failure: already have user".into()))]);
        let manager = DeviceManager::new(connector.clone());
        manager.ensure_ready().await.unwrap();
        let error = manager.write_command("/ip/hotspot/user/add", &[("name", "x")]).await;
        assert!(matches!(error, Err(DeviceError::Command(_))));
        assert_eq!(connector.0.write_calls().len(), 1);
        assert_eq!(manager.state().await, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_force_disconnect_closes_connection() {
        let connector = ScriptedConnector::default();
        let manager = DeviceManager::new(connector.clone());
        manager.ensure_ready().await.unwrap();
        manager.force_disconnect().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(connector.0.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_schedules_single_delayed_reconnect() {
        let connector = ScriptedConnector::default();
        let manager = DeviceManager::new(connector.clone());
        manager.ensure_ready().await.unwrap();

        connector.0.break_connection();
        connector.0.break_connection();
        settle().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(connector.0.closed.load(Ordering::SeqCst), 1);

        tokio::time::sleep(DEFAULT_RECONNECT_DELAY - Duration::from_millis(100)).await;
        assert_eq!(connector.0.connect_calls(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(connector.0.connect_calls(), 2);
        assert_eq!(manager.state().await, ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_from_replaced_connection_are_ignored() {
        let connector = ScriptedConnector::default();
        let manager = DeviceManager::new(connector.clone());
        manager.ensure_ready().await.unwrap();
        let stale = connector.0.last_events.lock().unwrap().clone().unwrap();

        manager.force_disconnect().await;
        manager.ensure_ready().await.unwrap();
        stale.transport_error("late failure");
        settle().await;

        assert_eq!(manager.state().await, ConnectionState::Ready);
        tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 2).await;
        assert_eq!(connector.0.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let connector = ScriptedConnector::default();
        let shutdown = CancellationToken::new();
        let manager =
            DeviceManager::with_options(connector.clone(), DEFAULT_RECONNECT_DELAY, shutdown.clone());
        manager.ensure_ready().await.unwrap();
        connector.0.break_connection();
        settle().await;
        shutdown.cancel();
        tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 2).await;
        assert_eq!(connector.0.connect_calls(), 1);
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }
}
