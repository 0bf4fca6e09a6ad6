// Stream Connection - Streaming lifecycle state machine
// connect -> login/subscribe -> read loop -> backoff/reconnect -> close

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::core::config::PipelineConfig;
use crate::core::events::{Event, EventBus, EventKind};
use crate::core::types::ConnectionState;
use crate::layer1::backoff::Backoff;
use crate::layer1::frame::{decode_frame, ControlMessage, Decoded, FrameKind, RawFrame};
use crate::layer1::websocket::{login_message, subscribe_message};

const SOURCE: &str = "stream";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    // Transient: backoff + reconnect
    #[error("read timed out")]
    ReadTimeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
    #[error("{0} consecutive corrupt frames")]
    CorruptBurst(u32),
    #[error("handshake timed out")]
    HandshakeTimeout,

    // Fatal: never retried
    #[error("authentication rejected: {0}")]
    FatalAuth(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("initial connect failed after {attempts} attempts: {last_error}")]
    InitialConnectExhausted { attempts: u32, last_error: String },

    #[error("connection closed by shutdown")]
    Closed,
}

impl StreamError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::FatalAuth(_)
                | StreamError::InvalidEndpoint(_)
                | StreamError::InitialConnectExhausted { .. }
        )
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// Text-frame transport underneath `StreamConnection`.
///
/// `recv` returns `Ok(None)` when the peer ended the stream. Implementations
/// classify their own failures into `StreamError` (auth vs. endpoint vs. transient).
#[async_trait]
pub trait FrameTransport: Send {
    async fn connect(&mut self, endpoint: &str) -> Result<(), StreamError>;
    async fn send(&mut self, text: String) -> Result<(), StreamError>;
    async fn recv(&mut self) -> Result<Option<String>, StreamError>;
    async fn close(&mut self);
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub symbol: String,
    /// Channel to subscribe to. `None` for endpoints that push on connect.
    pub channel: Option<String>,
    pub credentials: Option<Credentials>,
    /// Wait for a `subscribe` ack before reporting Subscribed
    pub await_ack: bool,
}

impl Subscription {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let credentials = config.has_credentials().then(|| Credentials {
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            passphrase: config.passphrase.clone(),
        });
        Self {
            symbol: config.symbol.clone(),
            channel: config.channel.clone(),
            credentials,
            await_ack: config.await_subscribe_ack,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub backoff_jitter: f64,
    pub read_timeout: Duration,
    pub max_initial_attempts: Option<u32>,
    pub corrupt_burst_threshold: u32,
}

impl ConnectionConfig {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            backoff_jitter: config.backoff_jitter,
            read_timeout: config.read_timeout(),
            max_initial_attempts: config.max_initial_attempts,
            corrupt_burst_threshold: config.corrupt_burst_threshold,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

// ============================================================================
// Observation
// ============================================================================

#[derive(Debug, Default)]
struct ConnectionCounters {
    session: AtomicU64,
    frames_emitted: AtomicU64,
    corrupt_dropped: AtomicU64,
    control_messages: AtomicU64,
    reconnects: AtomicU64,
    sequence_gaps: AtomicU64,
}

/// Read-only view of a connection owned by another task or thread
#[derive(Debug, Clone)]
pub struct ConnectionStateHandle {
    state: Arc<RwLock<ConnectionState>>,
    counters: Arc<ConnectionCounters>,
}

impl ConnectionStateHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            session: self.counters.session.load(Ordering::Relaxed),
            frames_emitted: self.counters.frames_emitted.load(Ordering::Relaxed),
            corrupt_dropped: self.counters.corrupt_dropped.load(Ordering::Relaxed),
            control_messages: self.counters.control_messages.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            sequence_gaps: self.counters.sequence_gaps.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub session: u64,
    pub frames_emitted: u64,
    pub corrupt_dropped: u64,
    pub control_messages: u64,
    pub reconnects: u64,
    pub sequence_gaps: u64,
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionStats(state={}, session={}, frames={}, corrupt={}, reconnects={}, gaps={})",
            self.state,
            self.session,
            self.frames_emitted,
            self.corrupt_dropped,
            self.reconnects,
            self.sequence_gaps
        )
    }
}

// ============================================================================
// Stream Connection
// ============================================================================

/// One streaming-connection lifecycle over a `FrameTransport`.
///
/// Only this type writes `ConnectionState`. Frames are emitted only while
/// Subscribed; every (re)connect resubscribes and bumps the session counter.
pub struct StreamConnection<T: FrameTransport> {
    transport: T,
    endpoint: String,
    subscription: Subscription,
    config: ConnectionConfig,
    events: Arc<EventBus>,
    state: Arc<RwLock<ConnectionState>>,
    counters: Arc<ConnectionCounters>,
    backoff: Backoff,
    session: u64,
    /// Gap-detection baseline, cleared on every resubscribe
    last_seq: Option<u64>,
    /// Highest id handed out so far; never reset
    last_emitted: Option<u64>,
    consecutive_corrupt: u32,
    /// Why the last Subscribed period ended
    interruption: Option<StreamError>,
    /// Book frames that arrived before the handshake completed
    pending: VecDeque<String>,
}

impl<T: FrameTransport> StreamConnection<T> {
    pub fn new(
        transport: T,
        endpoint: &str,
        subscription: Subscription,
        config: ConnectionConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_cap, config.backoff_jitter);
        Self {
            transport,
            endpoint: endpoint.to_string(),
            subscription,
            config,
            events,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            counters: Arc::new(ConnectionCounters::default()),
            backoff,
            session: 0,
            last_seq: None,
            last_emitted: None,
            consecutive_corrupt: 0,
            interruption: None,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn state_handle(&self) -> ConnectionStateHandle {
        ConnectionStateHandle {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn stats(&self) -> ConnectionStats {
        self.state_handle().stats()
    }

    /// Initial open. Transient failures are retried with backoff, capped by
    /// `max_initial_attempts` when set.
    pub async fn open(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), StreamError> {
        info!(endpoint = %self.endpoint, symbol = %self.subscription.symbol, "Opening stream connection");
        let mut failures: u32 = 0;

        loop {
            match self.establish(shutdown).await {
                Ok(()) => return Ok(()),
                Err(StreamError::Closed) => {
                    self.close().await;
                    return Err(StreamError::Closed);
                }
                Err(e) if e.is_fatal() => {
                    self.fail(&e).await;
                    return Err(e);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if let Some(max) = self.config.max_initial_attempts {
                        if failures >= max {
                            let err = StreamError::InitialConnectExhausted {
                                attempts: failures,
                                last_error: e.to_string(),
                            };
                            self.fail(&err).await;
                            return Err(err);
                        }
                    }
                    warn!(error = %e, attempt = failures, "Initial connect failed");
                    if !self.backoff_sleep(&e, shutdown).await {
                        self.close().await;
                        return Err(StreamError::Closed);
                    }
                }
            }
        }
    }

    /// Next book frame. Transient failures reconnect internally; only fatal
    /// errors and `Closed` are returned.
    pub async fn read_next(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<RawFrame, StreamError> {
        loop {
            if *shutdown.borrow() {
                self.close().await;
                return Err(StreamError::Closed);
            }

            match self.state() {
                ConnectionState::Subscribed => {}
                ConnectionState::Closing | ConnectionState::Closed => return Err(StreamError::Closed),
                _ => self.reconnect(shutdown).await?,
            }

            if let Some(text) = self.pending.pop_front() {
                match self.handle_text(&text) {
                    Ok(Some(frame)) => return Ok(frame),
                    Ok(None) => continue,
                    Err(e) => {
                        self.enter_backoff(&e).await;
                        continue;
                    }
                }
            }

            let read_timeout = self.config.read_timeout;
            let received = until_shutdown(shutdown, timeout(read_timeout, self.transport.recv())).await;

            let outcome = match received {
                None => {
                    self.close().await;
                    return Err(StreamError::Closed);
                }
                Some(Err(_elapsed)) => Err(StreamError::ReadTimeout),
                Some(Ok(Ok(None))) => Err(StreamError::ConnectionClosed),
                Some(Ok(Err(e))) => Err(e),
                Some(Ok(Ok(Some(text)))) => self.handle_text(&text),
            };

            match outcome {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    self.fail(&e).await;
                    return Err(e);
                }
                Err(e) => self.enter_backoff(&e).await,
            }
        }
    }

    /// Closing -> Closed. Idempotent.
    pub async fn close(&mut self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.transport.close().await;
        self.pending.clear();
        self.set_state(ConnectionState::Closed);
        info!(endpoint = %self.endpoint, session = self.session, "Stream connection closed");
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    /// Connect, authenticate, subscribe. Leaves the transport closed on failure.
    async fn establish(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), StreamError> {
        self.set_state(ConnectionState::Connecting);
        self.pending.clear();
        self.consecutive_corrupt = 0;

        if let Err(e) = self.handshake(shutdown).await {
            self.transport.close().await;
            return Err(e);
        }

        self.backoff.reset();
        self.session += 1;
        self.last_seq = None;
        self.counters.session.store(self.session, Ordering::Relaxed);
        self.set_state(ConnectionState::Subscribed);

        info!(
            endpoint = %self.endpoint,
            symbol = %self.subscription.symbol,
            session = self.session,
            "Stream subscribed"
        );
        self.events.publish(
            Event::new(EventKind::Subscribed, SOURCE)
                .with("session", self.session)
                .with("symbol", self.subscription.symbol.clone()),
        );
        Ok(())
    }

    async fn handshake(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), StreamError> {
        let deadline = self.config.read_timeout;
        let endpoint = self.endpoint.clone();

        match until_shutdown(shutdown, timeout(deadline, self.transport.connect(&endpoint))).await {
            None => return Err(StreamError::Closed),
            Some(Err(_elapsed)) => return Err(StreamError::HandshakeTimeout),
            Some(Ok(result)) => result?,
        }
        debug!(endpoint = %endpoint, "Transport connected");

        if let Some(credentials) = self.subscription.credentials.clone() {
            let login = login_message(&credentials, Utc::now().timestamp())?;
            self.transport.send(login).await?;
            self.await_ack(AckKind::Login, shutdown).await?;
            debug!("Login acknowledged");
        }

        if let Some(channel) = self.subscription.channel.clone() {
            let subscribe = subscribe_message(&channel, &self.subscription.symbol);
            self.transport.send(subscribe).await?;
            if self.subscription.await_ack {
                self.await_ack(AckKind::Subscribe, shutdown).await?;
                debug!(channel = %channel, "Subscribe acknowledged");
            }
        }

        Ok(())
    }

    /// Read until the expected ack. Book frames seen meanwhile are kept for
    /// the read loop.
    async fn await_ack(&mut self, kind: AckKind, shutdown: &mut watch::Receiver<bool>) -> Result<(), StreamError> {
        let deadline = tokio::time::Instant::now() + self.config.read_timeout;

        loop {
            let received = until_shutdown(
                shutdown,
                tokio::time::timeout_at(deadline, self.transport.recv()),
            )
            .await;

            let text = match received {
                None => return Err(StreamError::Closed),
                Some(Err(_elapsed)) => return Err(StreamError::HandshakeTimeout),
                Some(Ok(Ok(None))) => return Err(StreamError::ConnectionClosed),
                Some(Ok(Err(e))) => return Err(e),
                Some(Ok(Ok(Some(text)))) => text,
            };

            match decode_frame(&text) {
                Decoded::Control(ControlMessage::Login { success, code }) if kind == AckKind::Login => {
                    if success {
                        return Ok(());
                    }
                    return Err(StreamError::FatalAuth(format!("login rejected with code {}", code)));
                }
                Decoded::Control(ControlMessage::Subscribe) if kind == AckKind::Subscribe => return Ok(()),
                Decoded::Control(ControlMessage::Error { code, message }) => {
                    return Err(StreamError::FatalAuth(format!("{} ({})", message, code)));
                }
                Decoded::Control(_) => {
                    self.counters.control_messages.fetch_add(1, Ordering::Relaxed);
                }
                Decoded::Book(_) => self.pending.push_back(text),
                Decoded::Corrupt(reason) => {
                    debug!(reason = %reason, "Ignoring corrupt frame during handshake");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Frame handling
    // ------------------------------------------------------------------------

    /// `Ok(None)` for frames that are consumed silently; `Err` for conditions
    /// that force a reconnect.
    fn handle_text(&mut self, text: &str) -> Result<Option<RawFrame>, StreamError> {
        let received_at = Instant::now();
        let received_wall = Utc::now();

        let book = match decode_frame(text) {
            Decoded::Book(book) => book,
            Decoded::Control(ControlMessage::Error { code, message }) => {
                return Err(StreamError::FatalAuth(format!("{} ({})", message, code)));
            }
            Decoded::Control(control) => {
                self.counters.control_messages.fetch_add(1, Ordering::Relaxed);
                debug!(message = ?control, "Control message");
                return Ok(None);
            }
            Decoded::Corrupt(reason) => {
                self.consecutive_corrupt += 1;
                self.counters.corrupt_dropped.fetch_add(1, Ordering::Relaxed);
                self.events.publish(
                    Event::new(EventKind::FrameDropped, SOURCE)
                        .with("reason", reason)
                        .with("consecutive", self.consecutive_corrupt),
                );
                if self.consecutive_corrupt > self.config.corrupt_burst_threshold {
                    return Err(StreamError::CorruptBurst(self.consecutive_corrupt));
                }
                return Ok(None);
            }
        };
        self.consecutive_corrupt = 0;

        if book.kind == FrameKind::Delta {
            if let (Some(last), Some(seq)) = (self.last_seq, book.sequence_id) {
                let gap = match book.prev_sequence_id {
                    Some(prev) if prev != last => Some((last, prev)),
                    Some(_) => None,
                    None if seq != last.saturating_add(1) => Some((last.saturating_add(1), seq)),
                    None => None,
                };
                if let Some((expected, got)) = gap {
                    self.counters.sequence_gaps.fetch_add(1, Ordering::Relaxed);
                    self.events.publish(
                        Event::new(EventKind::SequenceGap, SOURCE)
                            .with("expected", expected)
                            .with("got", got)
                            .with("session", self.session),
                    );
                    return Err(StreamError::SequenceGap { expected, got });
                }
            }
        }

        let sequence_id = book
            .sequence_id
            .unwrap_or_else(|| self.last_emitted.map_or(1, |last| last.saturating_add(1)));
        self.last_seq = Some(sequence_id);
        self.last_emitted = Some(self.last_emitted.map_or(sequence_id, |last| last.max(sequence_id)));
        self.counters.frames_emitted.fetch_add(1, Ordering::Relaxed);

        Ok(Some(book.into_raw(
            sequence_id,
            &self.subscription.symbol,
            received_at,
            received_wall,
            self.session,
        )))
    }

    // ------------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------------

    async fn enter_backoff(&mut self, cause: &StreamError) {
        warn!(error = %cause, session = self.session, "Stream interrupted, reconnecting");
        self.set_state(ConnectionState::Backoff);
        self.transport.close().await;
        self.pending.clear();
        self.interruption = Some(cause.clone());
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Unbounded retries until Subscribed, a fatal error, or shutdown
    async fn reconnect(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), StreamError> {
        let mut cause = self.interruption.take().unwrap_or(StreamError::ConnectionClosed);
        loop {
            if !self.backoff_sleep(&cause, shutdown).await {
                self.close().await;
                return Err(StreamError::Closed);
            }
            match self.establish(shutdown).await {
                Ok(()) => return Ok(()),
                Err(StreamError::Closed) => {
                    self.close().await;
                    return Err(StreamError::Closed);
                }
                Err(e) if e.is_fatal() => {
                    self.fail(&e).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, attempt = self.backoff.attempt(), "Reconnect failed");
                    cause = e;
                }
            }
        }
    }

    /// Sleep the next backoff delay. False if shutdown arrived first.
    async fn backoff_sleep(&mut self, cause: &StreamError, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.set_state(ConnectionState::Backoff);
        let delay = self.backoff.next_delay();
        self.events.publish(
            Event::new(EventKind::Reconnecting, SOURCE)
                .with("reason", cause.to_string())
                .with("attempt", self.backoff.attempt())
                .with("delay_ms", delay.as_millis() as u64),
        );
        until_shutdown(shutdown, tokio::time::sleep(delay)).await.is_some()
    }

    async fn fail(&mut self, err: &StreamError) {
        error!(error = %err, endpoint = %self.endpoint, "Unrecoverable stream error");
        self.events.publish(
            Event::new(EventKind::FatalError, SOURCE)
                .with("error", err.to_string())
                .with("endpoint", self.endpoint.clone()),
        );
        self.close().await;
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        let previous = *current;
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state change");
            *current = state;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Login,
    Subscribe,
}

/// Drive `fut` unless shutdown is signalled first. A dropped sender counts as shutdown.
pub(crate) async fn until_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    if *shutdown.borrow() {
        return None;
    }
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// One scripted step of a transport session
    #[derive(Debug, Clone)]
    pub enum Step {
        Frame(String),
        Error(StreamError),
        End,
    }

    /// In-memory transport: each `connect` starts the next scripted session.
    /// A session with no steps left blocks on `recv` forever.
    pub struct MockTransport {
        connects: Arc<Mutex<VecDeque<Result<(), StreamError>>>>,
        sessions: VecDeque<VecDeque<Step>>,
        current: Option<VecDeque<Step>>,
        pub sent: Arc<Mutex<Vec<String>>>,
        pub connect_calls: Arc<AtomicU64>,
    }

    impl MockTransport {
        pub fn new(sessions: Vec<Vec<Step>>) -> Self {
            Self {
                connects: Arc::new(Mutex::new(VecDeque::new())),
                sessions: sessions.into_iter().map(VecDeque::from).collect(),
                current: None,
                sent: Arc::new(Mutex::new(Vec::new())),
                connect_calls: Arc::new(AtomicU64::new(0)),
            }
        }

        /// Results returned by successive `connect` calls before sessions are used
        pub fn with_connect_results(self, results: Vec<Result<(), StreamError>>) -> Self {
            *self.connects.lock() = results.into();
            self
        }
    }

    #[async_trait]
    impl FrameTransport for MockTransport {
        async fn connect(&mut self, _endpoint: &str) -> Result<(), StreamError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.connects.lock().pop_front();
            if let Some(Err(e)) = scripted {
                return Err(e);
            }
            self.current = Some(self.sessions.pop_front().unwrap_or_default());
            Ok(())
        }

        async fn send(&mut self, text: String) -> Result<(), StreamError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>, StreamError> {
            let step = match self.current.as_mut() {
                Some(session) => session.pop_front(),
                None => return Err(StreamError::ConnectionClosed),
            };
            match step {
                Some(Step::Frame(text)) => Ok(Some(text)),
                Some(Step::Error(e)) => Err(e),
                Some(Step::End) => Ok(None),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.current = None;
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            backoff_jitter: 0.1,
            read_timeout: Duration::from_millis(200),
            max_initial_attempts: Some(3),
            corrupt_burst_threshold: 5,
        }
    }

    fn subscription() -> Subscription {
        Subscription {
            symbol: "BTC-USDT-SWAP".to_string(),
            channel: None,
            credentials: None,
            await_ack: false,
        }
    }

    fn snapshot(seq: u64) -> Step {
        Step::Frame(format!(
            r#"{{"type":"snapshot","seq":{},"bids":[["100","2"]],"asks":[["101","3"]]}}"#,
            seq
        ))
    }

    fn delta(seq: u64, prev: u64) -> Step {
        Step::Frame(format!(
            r#"{{"type":"update","seq":{},"prev_seq":{},"bids":[["100","1"]],"asks":[]}}"#,
            seq, prev
        ))
    }

    fn connection(transport: MockTransport) -> (StreamConnection<MockTransport>, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let conn = StreamConnection::new(
            transport,
            "wss://example.invalid/ws",
            subscription(),
            fast_config(),
            Arc::clone(&events),
        );
        (conn, events)
    }

    #[test]
    fn test_error_classification() {
        assert!(StreamError::FatalAuth("x".into()).is_fatal());
        assert!(StreamError::InvalidEndpoint("x".into()).is_fatal());
        assert!(!StreamError::ReadTimeout.is_fatal());
        assert!(!StreamError::SequenceGap { expected: 2, got: 4 }.is_fatal());
        assert!(!StreamError::Closed.is_fatal());
    }

    #[tokio::test]
    async fn test_open_reaches_subscribed() {
        let (_tx, mut rx) = watch::channel(false);
        let (mut conn, events) = connection(MockTransport::new(vec![vec![snapshot(1)]]));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.open(&mut rx).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Subscribed);
        assert_eq!(conn.session(), 1);
        assert_eq!(events.count(EventKind::Subscribed), 1);

        let frame = conn.read_next(&mut rx).await.unwrap();
        assert_eq!(frame.sequence_id, 1);
        assert_eq!(frame.session, 1);
        assert_eq!(frame.symbol, "BTC-USDT-SWAP");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_subscribed() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![vec![
            snapshot(1),
            Step::Frame("{garbage".to_string()),
            Step::Frame(r#"{"bids":[]}"#.to_string()),
            snapshot(2),
        ]]);
        let (mut conn, events) = connection(transport);
        conn.open(&mut rx).await.unwrap();

        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 1);
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 2);
        assert_eq!(conn.state(), ConnectionState::Subscribed);
        assert_eq!(conn.session(), 1);
        assert_eq!(conn.stats().corrupt_dropped, 2);
        assert_eq!(events.count(EventKind::FrameDropped), 2);
    }

    #[tokio::test]
    async fn test_corrupt_burst_forces_reconnect() {
        let (_tx, mut rx) = watch::channel(false);
        let mut first = vec![snapshot(1)];
        first.extend((0..6).map(|_| Step::Frame("nope".to_string())));
        let transport = MockTransport::new(vec![first, vec![snapshot(10)]]);
        let (mut conn, _events) = connection(transport);
        conn.open(&mut rx).await.unwrap();

        conn.read_next(&mut rx).await.unwrap();
        let frame = conn.read_next(&mut rx).await.unwrap();
        assert_eq!(frame.sequence_id, 10);
        assert_eq!(frame.session, 2);
        assert_eq!(conn.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_sequence_gap_triggers_resubscribe() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![
            vec![snapshot(1), delta(2, 1), delta(5, 4)],
            vec![snapshot(20)],
        ]);
        let connect_calls = Arc::clone(&transport.connect_calls);
        let (mut conn, events) = connection(transport);
        conn.open(&mut rx).await.unwrap();

        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 1);
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 2);

        let resync = conn.read_next(&mut rx).await.unwrap();
        assert_eq!(resync.sequence_id, 20);
        assert_eq!(resync.kind, FrameKind::Snapshot);
        assert_eq!(resync.session, 2);
        assert_eq!(connect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(conn.stats().sequence_gaps, 1);
        assert_eq!(events.count(EventKind::SequenceGap), 1);
        assert_eq!(events.count(EventKind::Subscribed), 2);
    }

    #[tokio::test]
    async fn test_gap_detected_without_prev_seq() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![
            vec![
                snapshot(1),
                Step::Frame(r#"{"type":"update","seq":3,"bids":[],"asks":[]}"#.to_string()),
            ],
            vec![snapshot(7)],
        ]);
        let (mut conn, _events) = connection(transport);
        conn.open(&mut rx).await.unwrap();
        conn.read_next(&mut rx).await.unwrap();
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 7);
        assert_eq!(conn.stats().sequence_gaps, 1);
    }

    #[tokio::test]
    async fn test_missing_sequence_ids_are_assigned_locally() {
        let (_tx, mut rx) = watch::channel(false);
        let plain = r#"{"bids":[["100","1"]],"asks":[["101","1"]]}"#.to_string();
        let transport = MockTransport::new(vec![vec![Step::Frame(plain.clone()), Step::Frame(plain)]]);
        let (mut conn, _events) = connection(transport);
        conn.open(&mut rx).await.unwrap();
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 1);
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 2);
    }

    #[tokio::test]
    async fn test_local_sequence_ids_survive_reconnect() {
        let (_tx, mut rx) = watch::channel(false);
        let plain = || Step::Frame(r#"{"bids":[["100","1"]],"asks":[["101","1"]]}"#.to_string());
        let transport = MockTransport::new(vec![vec![plain(), plain()], vec![plain()]]);
        let (mut conn, _events) = connection(transport);
        conn.open(&mut rx).await.unwrap();
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 1);
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 2);

        // Session 1 goes quiet until the read timeout forces a reconnect
        let frame = conn.read_next(&mut rx).await.unwrap();
        assert_eq!(frame.session, 2);
        assert_eq!(frame.sequence_id, 3);
    }

    #[tokio::test]
    async fn test_backoff_grows_then_resets_after_subscribe() {
        let (_tx, mut rx) = watch::channel(false);
        let reset = || Err(StreamError::Transport("refused".into()));
        let transport = MockTransport::new(vec![
            vec![snapshot(1), Step::Error(StreamError::Transport("reset".into()))],
            vec![snapshot(2), Step::Error(StreamError::Transport("reset".into()))],
            vec![snapshot(3)],
        ])
        .with_connect_results(vec![Ok(()), reset(), reset(), Ok(()), reset(), Ok(())]);

        let events = Arc::new(EventBus::new());
        let config = ConnectionConfig {
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            backoff_jitter: 0.2,
            ..fast_config()
        };
        let mut conn = StreamConnection::new(
            transport,
            "wss://example.invalid/ws",
            subscription(),
            config,
            Arc::clone(&events),
        );
        conn.open(&mut rx).await.unwrap();
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 1);
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 2);
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 3);

        let delays: Vec<u64> = events
            .get_recent_events(Some(EventKind::Reconnecting), 10)
            .iter()
            .rev()
            .map(|e| e.context["delay_ms"].as_u64().unwrap())
            .collect();
        assert_eq!(delays.len(), 5);

        // Three failures in a row: strictly longer each time, never past the cap
        assert!(delays[0] < delays[1] && delays[1] < delays[2], "{:?}", delays);
        assert!(delays[..3].iter().all(|&d| d <= 40), "{:?}", delays);

        // Subscribing again starts over from base
        assert!(delays[3] <= 10, "{:?}", delays);
        assert!(delays[3] < delays[4], "{:?}", delays);
    }

    #[tokio::test]
    async fn test_transient_errors_reconnect() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![
            vec![snapshot(1), Step::Error(StreamError::Transport("reset".into()))],
            vec![Step::End],
            vec![snapshot(3)],
        ]);
        let (mut conn, events) = connection(transport);
        conn.open(&mut rx).await.unwrap();
        conn.read_next(&mut rx).await.unwrap();

        let frame = conn.read_next(&mut rx).await.unwrap();
        assert_eq!(frame.sequence_id, 3);
        assert_eq!(conn.session(), 3);
        assert_eq!(conn.stats().reconnects, 2);
        assert!(events.count(EventKind::Reconnecting) >= 2);
    }

    #[tokio::test]
    async fn test_fatal_auth_closes_connection() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![])
            .with_connect_results(vec![Err(StreamError::FatalAuth("HTTP 401".into()))]);
        let (mut conn, events) = connection(transport);

        let err = conn.open(&mut rx).await.unwrap_err();
        assert_eq!(err, StreamError::FatalAuth("HTTP 401".into()));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(events.count(EventKind::FatalError), 1);
    }

    #[tokio::test]
    async fn test_rejected_login_is_fatal() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![vec![Step::Frame(
            r#"{"event":"error","code":"60009","msg":"Login failed."}"#.to_string(),
        )]]);
        let sent = Arc::clone(&transport.sent);
        let events = Arc::new(EventBus::new());
        let mut sub = subscription();
        sub.credentials = Some(Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            passphrase: "pass".into(),
        });
        let mut conn = StreamConnection::new(transport, "wss://example.invalid/ws", sub, fast_config(), events);

        let err = conn.open(&mut rx).await.unwrap_err();
        assert!(matches!(err, StreamError::FatalAuth(_)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(sent.lock()[0].contains("\"op\":\"login\""));
    }

    #[tokio::test]
    async fn test_login_and_subscribe_handshake() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![vec![
            Step::Frame(r#"{"event":"login","code":"0","msg":""}"#.to_string()),
            snapshot(4),
            Step::Frame(r#"{"event":"subscribe","arg":{"channel":"books"}}"#.to_string()),
        ]]);
        let sent = Arc::clone(&transport.sent);
        let sub = Subscription {
            symbol: "BTC-USDT-SWAP".to_string(),
            channel: Some("books".to_string()),
            credentials: Some(Credentials {
                api_key: "key".into(),
                api_secret: "secret".into(),
                passphrase: "pass".into(),
            }),
            await_ack: true,
        };
        let mut conn = StreamConnection::new(
            transport,
            "wss://example.invalid/ws",
            sub,
            fast_config(),
            Arc::new(EventBus::new()),
        );

        conn.open(&mut rx).await.unwrap();
        assert_eq!(sent.lock().len(), 2);
        assert!(sent.lock()[1].contains("\"op\":\"subscribe\""));

        // Frame received before the subscribe ack is not lost
        assert_eq!(conn.read_next(&mut rx).await.unwrap().sequence_id, 4);
    }

    #[tokio::test]
    async fn test_initial_attempt_cap() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![]).with_connect_results(vec![
            Err(StreamError::Transport("refused".into())),
            Err(StreamError::Transport("refused".into())),
            Err(StreamError::Transport("refused".into())),
            Ok(()),
        ]);
        let connect_calls = Arc::clone(&transport.connect_calls);
        let (mut conn, _events) = connection(transport);

        match conn.open(&mut rx).await {
            Err(StreamError::InitialConnectExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_read() {
        let (tx, mut rx) = watch::channel(false);
        let mut config = fast_config();
        config.read_timeout = Duration::from_secs(5);
        let mut conn = StreamConnection::new(
            MockTransport::new(vec![vec![]]),
            "wss://example.invalid/ws",
            subscription(),
            config,
            Arc::new(EventBus::new()),
        );
        conn.open(&mut rx).await.unwrap();

        let started = Instant::now();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
            tx
        });
        let result = conn.read_next(&mut rx).await;
        let _tx = stopper.await.unwrap();

        assert_eq!(result.unwrap_err(), StreamError::Closed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_read_timeout_is_transient() {
        let (_tx, mut rx) = watch::channel(false);
        let transport = MockTransport::new(vec![vec![snapshot(1)], vec![snapshot(2)]]);
        let (mut conn, _events) = connection(transport);
        conn.open(&mut rx).await.unwrap();
        conn.read_next(&mut rx).await.unwrap();

        // First session goes quiet; the 200ms read timeout reconnects
        let frame = conn.read_next(&mut rx).await.unwrap();
        assert_eq!(frame.sequence_id, 2);
        assert_eq!(frame.session, 2);
    }
}
