//! Realtime channel manager.
//!
//! [`RealtimeManager`] owns one logical channel, hides the websocket/SSE
//! difference behind [`Connector`], and fans inbound events out through an
//! [`EventBus`]. Transport failures never surface as errors to callers: they
//! are dispatched as [`EventType::Error`] events and the channel reconnects
//! with capped exponential backoff until [`RealtimeManager::close`] is called.
//!
//! All methods spawn onto the current tokio runtime and must be called from
//! within one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::realtime::bus::{EventBus, HandlerId, Subscription};
use crate::realtime::event::{decode_inbound, encode_outbound, Event, EventType, Inbound};
use crate::realtime::transport::{
    Connector, DefaultConnector, Protocol, TransportError, TransportEvent, TransportHandle,
};
use crate::retry::ReconnectPolicy;

/// Query parameter carrying the auth token on every connection attempt.
pub const TOKEN_QUERY_PARAM: &str = "token";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    pub const BACKOFF_BASE: Duration = Duration::from_millis(500);
    pub const BACKOFF_MAX: Duration = Duration::from_millis(8000);
    pub const BACKOFF_JITTER: Duration = Duration::from_millis(250);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Lifecycle state of the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives timing and lifecycle notifications from a manager.
///
/// Every method defaults to a no-op. Calls are made outside the manager's
/// internal lock.
pub trait ConnectionObserver: Send + Sync {
    fn on_state_change(&self, _from: ConnectionState, _to: ConnectionState) {}

    fn on_reconnect_scheduled(&self, _attempt: u32, _delay: Duration) {}

    /// Called for each routable inbound event before it is dispatched.
    fn on_message(&self, _event_type: EventType, _received_at_ms: u64) {}
}

/// Options accepted by [`RealtimeManager::new`].
#[derive(Clone)]
pub struct RealtimeOptions {
    pub protocol: Protocol,
    pub token: Option<SecretString>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: Duration,
    /// Stop reconnecting after this many consecutive failed attempts.
    ///
    /// `None` (the default) reconnects until the manager is closed.
    pub max_attempts: Option<u32>,
    pub connect_timeout: Duration,
    pub observer: Option<Arc<dyn ConnectionObserver>>,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            token: None,
            backoff_base: RealtimeDefaults::BACKOFF_BASE,
            backoff_max: RealtimeDefaults::BACKOFF_MAX,
            backoff_jitter: RealtimeDefaults::BACKOFF_JITTER,
            max_attempts: None,
            connect_timeout: RealtimeDefaults::CONNECT_TIMEOUT,
            observer: None,
        }
    }
}

impl fmt::Debug for RealtimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeOptions")
            .field("protocol", &self.protocol)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("backoff_jitter", &self.backoff_jitter)
            .field("max_attempts", &self.max_attempts)
            .field("connect_timeout", &self.connect_timeout)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RealtimeOptions {
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Sets the backoff base delay and cap.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
            jitter: self.backoff_jitter,
            max_attempts: self.max_attempts,
        }
    }
}

/// Manager for one realtime channel.
pub struct RealtimeManager {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    protocol: Protocol,
    policy: ReconnectPolicy,
    observer: Option<Arc<dyn ConnectionObserver>>,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    core: Mutex<Core>,
}

struct Core {
    state: ConnectionState,
    attempts: u32,
    user_closed: bool,
    generation: u64,
    token: Option<SecretString>,
    active: Option<ActiveTransport>,
    reconnect_timer: Option<AbortHandle>,
    /// Notices in the order their changes were applied.
    outbox: VecDeque<Notice>,
    /// Set while one caller is draining `outbox`.
    delivering: bool,
}

struct ActiveTransport {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    io_task: Option<AbortHandle>,
    pump: AbortHandle,
}

impl ActiveTransport {
    fn shutdown(self) {
        self.pump.abort();
        match (self.outbound, self.io_task) {
            // Dropping the sender lets the websocket task send a close frame.
            (Some(outbound), _) => drop(outbound),
            (None, Some(io_task)) => io_task.abort(),
            (None, None) => {}
        }
    }
}

/// Side effects queued under the lock, in the order the changes happen.
///
/// Only one caller drains the queue at a time, outside the lock, so the
/// observer and subscribers see changes in the order they were applied no
/// matter which task applied them.
enum Notice {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        attempt: u32,
        delay: Option<Duration>,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// A routable inbound event; reported to the observer, then dispatched.
    Received(Event),
    Dispatch(Event),
}

impl fmt::Debug for RealtimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("url", &self.shared.url)
            .field("protocol", &self.shared.protocol)
            .field("state", &self.state())
            .field("bus", &self.shared.bus)
            .finish()
    }
}

impl RealtimeManager {
    /// Creates an idle manager using the websocket/SSE connector.
    pub fn new(url: impl Into<String>, options: RealtimeOptions) -> Self {
        let connector = Arc::new(DefaultConnector::new(options.connect_timeout));
        Self::with_connector(url, options, connector)
    }

    /// Creates an idle manager that opens transports through `connector`.
    pub fn with_connector(
        url: impl Into<String>,
        options: RealtimeOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let policy = options.reconnect_policy();
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                protocol: options.protocol,
                policy,
                observer: options.observer,
                connector,
                bus: EventBus::new(),
                core: Mutex::new(Core {
                    state: ConnectionState::Idle,
                    attempts: 0,
                    user_closed: false,
                    generation: 0,
                    token: options.token,
                    active: None,
                    reconnect_timer: None,
                    outbox: VecDeque::new(),
                    delivering: false,
                }),
            }),
        }
    }

    /// Starts the channel.
    ///
    /// No-op while already connecting or open. Otherwise resets the attempt
    /// counter, cancels any pending reconnect, and opens a fresh transport.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Closes the channel and stops reconnecting. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Registers `handler` for `event_type`.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(event_type, handler)
    }

    /// Removes a registration; unknown pairs are ignored.
    pub fn unsubscribe(&self, event_type: EventType, id: HandlerId) {
        self.shared.bus.unsubscribe(event_type, id);
    }

    /// Sends `{"type", "payload"}` on the live transport.
    ///
    /// Returns `true` only if the channel is open on a writable transport and
    /// the message was handed to it. Messages are never queued.
    pub fn send(&self, event_type: EventType, payload: Value) -> bool {
        self.shared.send(event_type, &payload)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Consecutive failures since the channel was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().attempts
    }

    /// Replaces the token used from the next connection attempt on.
    pub fn set_token(&self, token: Option<SecretString>) {
        self.shared.lock().token = token;
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.protocol
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connect(self: &Arc<Self>) {
        let released = {
            let mut core = self.lock();
            if matches!(
                core.state,
                ConnectionState::Connecting | ConnectionState::Open
            ) && core.active.is_some()
            {
                return;
            }

            core.user_closed = false;
            core.attempts = 0;
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
            self.open_transport(&mut core)
        };

        if let Some(active) = released {
            active.shutdown();
        }
        self.flush();
    }

    fn close(&self) {
        let released = {
            let mut core = self.lock();
            if core.user_closed || core.state == ConnectionState::Idle {
                return;
            }

            core.user_closed = true;
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
            let released = core.active.take();
            transition(&mut core, ConnectionState::Closed, None);
            released
        };

        debug!(event = "realtime_closed", url = %self.url);
        if let Some(active) = released {
            active.shutdown();
        }
        self.flush();
    }

    fn send(&self, event_type: EventType, payload: &Value) -> bool {
        let core = self.lock();
        if core.state != ConnectionState::Open {
            return false;
        }
        let Some(outbound) = core
            .active
            .as_ref()
            .and_then(|active| active.outbound.as_ref())
        else {
            return false;
        };

        match encode_outbound(event_type, payload) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(err) => {
                warn!(event = "realtime_encode_failed", event_type = %event_type, error = %err);
                false
            }
        }
    }

    /// Opens a new transport generation. Returns the transport it replaced.
    fn open_transport(self: &Arc<Self>, core: &mut Core) -> Option<ActiveTransport> {
        let released = core.active.take();
        core.generation += 1;
        let generation = core.generation;
        transition(core, ConnectionState::Connecting, None);

        let url = match channel_url(&self.url, core.token.as_ref()) {
            Ok(url) => url,
            Err(err) => {
                warn!(event = "realtime_url_invalid", error = %err);
                core.outbox
                    .push_back(Notice::Dispatch(Event::transport_error(&err)));
                self.schedule_reconnect(core);
                return released;
            }
        };

        debug!(
            event = "realtime_connecting",
            protocol = %self.protocol,
            generation,
            attempt = core.attempts
        );
        let TransportHandle {
            events,
            outbound,
            task,
        } = self.connector.open(&url, self.protocol);
        let pump = tokio::spawn(pump(Arc::downgrade(self), generation, events));

        core.active = Some(ActiveTransport {
            generation,
            outbound,
            io_task: task,
            pump: pump.abort_handle(),
        });
        released
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core) {
        core.attempts = core.attempts.saturating_add(1);
        let attempt = core.attempts;

        if self.policy.is_exhausted(attempt) {
            warn!(event = "realtime_reconnect_exhausted", attempts = attempt - 1);
            core.user_closed = true;
            core.outbox.push_back(Notice::Dispatch(Event::new(
                EventType::Error,
                json!({
                    "kind": "gave_up",
                    "attempts": attempt - 1,
                }),
            )));
            transition(core, ConnectionState::Closed, None);
            return;
        }

        let delay = self.policy.delay_for_attempt(attempt);
        transition(core, ConnectionState::Reconnecting, Some(delay));
        core.outbox
            .push_back(Notice::ReconnectScheduled { attempt, delay });
        debug!(
            event = "realtime_reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64
        );

        let weak = Arc::downgrade(self);
        let generation = core.generation;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.reconnect_due(generation);
            }
        });
        core.reconnect_timer = Some(timer.abort_handle());
    }

    fn reconnect_due(self: &Arc<Self>, generation: u64) {
        let released = {
            let mut core = self.lock();
            if core.user_closed
                || core.generation != generation
                || core.state != ConnectionState::Reconnecting
            {
                debug!(event = "realtime_reconnect_skipped", generation);
                return;
            }
            core.reconnect_timer = None;
            self.open_transport(&mut core)
        };

        if let Some(active) = released {
            active.shutdown();
        }
        self.flush();
    }

    /// Applies one transport notification. Returns `false` once the
    /// transport generation is no longer current.
    fn on_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) -> bool {
        let inbound = match &event {
            TransportEvent::Message(text) => inbound_notice(text),
            _ => None,
        };

        let (current, released) = {
            let mut core = self.lock();
            if !is_current(&core, generation) {
                return false;
            }
            match &event {
                TransportEvent::Opened => {
                    core.attempts = 0;
                    if let Some(timer) = core.reconnect_timer.take() {
                        timer.abort();
                    }
                    transition(&mut core, ConnectionState::Open, None);
                    (true, None)
                }
                TransportEvent::Message(_) => {
                    core.outbox.extend(inbound);
                    (true, None)
                }
                TransportEvent::Error(_) | TransportEvent::Closed => {
                    if core.user_closed {
                        return false;
                    }
                    if let TransportEvent::Error(message) = &event {
                        core.outbox
                            .push_back(Notice::Dispatch(Event::transport_error(message)));
                    }
                    let released = core.active.take();
                    self.schedule_reconnect(&mut core);
                    (false, released)
                }
            }
        };

        if let Some(active) = released {
            active.shutdown();
        }
        self.flush();
        current
    }

    /// Drains the outbox in order. A caller that finds another drain in
    /// progress returns at once; the active drainer delivers its notices.
    fn flush(&self) {
        {
            let mut core = self.lock();
            if core.delivering || core.outbox.is_empty() {
                return;
            }
            core.delivering = true;
        }

        let _reset = DrainReset(self);
        loop {
            let next = {
                let mut core = self.lock();
                let next = core.outbox.pop_front();
                if next.is_none() {
                    core.delivering = false;
                }
                next
            };
            match next {
                Some(notice) => self.deliver(notice),
                None => return,
            }
        }
    }

    fn deliver(&self, notice: Notice) {
        match notice {
            Notice::StateChanged {
                from,
                to,
                attempt,
                delay,
            } => {
                if let Some(observer) = self.observer.as_ref() {
                    observer.on_state_change(from, to);
                }
                let mut payload = json!({
                    "state": to.as_str(),
                    "previous": from.as_str(),
                    "attempt": attempt,
                });
                if let Some(delay) = delay {
                    payload["delay_ms"] = json!(delay.as_millis() as u64);
                }
                self.bus
                    .dispatch(&Event::new(EventType::ConnectionState, payload));
            }
            Notice::ReconnectScheduled { attempt, delay } => {
                if let Some(observer) = self.observer.as_ref() {
                    observer.on_reconnect_scheduled(attempt, delay);
                }
            }
            Notice::Received(event) => {
                if let Some(observer) = self.observer.as_ref() {
                    observer.on_message(event.event_type, event.timestamp);
                }
                self.bus.dispatch(&event);
            }
            Notice::Dispatch(event) => {
                self.bus.dispatch(&event);
            }
        }
    }
}

/// Releases the drain flag if a handler panics mid-drain.
struct DrainReset<'a>(&'a Shared);

impl Drop for DrainReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().delivering = false;
        }
    }
}

fn inbound_notice(text: &str) -> Option<Notice> {
    match decode_inbound(text) {
        Inbound::Event(event) => Some(Notice::Received(event)),
        Inbound::Malformed(event) => {
            debug!(event = "realtime_malformed_message", len = text.len());
            Some(Notice::Dispatch(event))
        }
        Inbound::Unroutable(tag) => {
            debug!(event = "realtime_routing_miss", tag = tag.as_deref().unwrap_or(""));
            None
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let core = self
            .core
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(timer) = core.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(active) = core.active.take() {
            active.shutdown();
        }
    }
}

async fn pump(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        if !strong.on_transport_event(generation, event) {
            return;
        }
    }

    // The transport went away without a terminal event.
    if let Some(strong) = shared.upgrade() {
        strong.on_transport_event(generation, TransportEvent::Closed);
    }
}

fn is_current(core: &Core, generation: u64) -> bool {
    core.active
        .as_ref()
        .is_some_and(|active| active.generation == generation)
}

fn transition(core: &mut Core, to: ConnectionState, delay: Option<Duration>) {
    let from = core.state;
    if from == to {
        return;
    }
    core.state = to;
    debug!(
        event = "realtime_state_change",
        from = %from,
        to = %to,
        attempt = core.attempts
    );
    let attempt = core.attempts;
    core.outbox.push_back(Notice::StateChanged {
        from,
        to,
        attempt,
        delay,
    });
}

/// Builds the connection URL, appending the token as a query parameter.
pub fn channel_url(base: &str, token: Option<&SecretString>) -> Result<String, TransportError> {
    let mut url = reqwest::Url::parse(base).map_err(|err| TransportError::Url(err.to_string()))?;
    if let Some(token) = token {
        url.query_pairs_mut()
            .append_pair(TOKEN_QUERY_PARAM, token.expose_secret());
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{
        channel_url, ConnectionObserver, ConnectionState, RealtimeManager, RealtimeOptions,
    };
    use crate::realtime::event::{Event, EventType};
    use crate::realtime::transport::{Connector, Protocol, TransportEvent, TransportHandle};

    const URL: &str = "ws://localhost:9/live";

    struct FakeTransport {
        url: String,
        events: mpsc::UnboundedSender<TransportEvent>,
        outbound: Option<mpsc::UnboundedReceiver<String>>,
    }

    struct FakeConnector {
        opened: mpsc::UnboundedSender<FakeTransport>,
    }

    impl Connector for FakeConnector {
        fn open(&self, url: &str, protocol: Protocol) -> TransportHandle {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = if protocol.is_writable() {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            let _ = self.opened.send(FakeTransport {
                url: url.to_string(),
                events: events_tx,
                outbound: outbound_rx,
            });
            TransportHandle {
                events: events_rx,
                outbound: outbound_tx,
                task: None,
            }
        }
    }

    struct RecordingObserver {
        states: mpsc::UnboundedSender<ConnectionState>,
        scheduled: mpsc::UnboundedSender<(u32, Duration)>,
    }

    impl ConnectionObserver for RecordingObserver {
        fn on_state_change(&self, _from: ConnectionState, to: ConnectionState) {
            let _ = self.states.send(to);
        }

        fn on_reconnect_scheduled(&self, attempt: u32, delay: Duration) {
            let _ = self.scheduled.send((attempt, delay));
        }
    }

    struct Harness {
        manager: RealtimeManager,
        opened: mpsc::UnboundedReceiver<FakeTransport>,
        states: mpsc::UnboundedReceiver<ConnectionState>,
        scheduled: mpsc::UnboundedReceiver<(u32, Duration)>,
    }

    impl Harness {
        fn new(options: RealtimeOptions) -> Self {
            Self::with_url(URL, options)
        }

        fn with_url(url: &str, options: RealtimeOptions) -> Self {
            let (opened_tx, opened) = mpsc::unbounded_channel();
            let (states_tx, states) = mpsc::unbounded_channel();
            let (scheduled_tx, scheduled) = mpsc::unbounded_channel();
            let observer = Arc::new(RecordingObserver {
                states: states_tx,
                scheduled: scheduled_tx,
            });
            let manager = RealtimeManager::with_connector(
                url,
                options.with_observer(observer),
                Arc::new(FakeConnector { opened: opened_tx }),
            );
            Self {
                manager,
                opened,
                states,
                scheduled,
            }
        }

        async fn next_transport(&mut self) -> FakeTransport {
            self.opened.recv().await.expect("transport opened")
        }

        async fn next_scheduled(&mut self) -> (u32, Duration) {
            self.scheduled.recv().await.expect("reconnect scheduled")
        }

        async fn wait_for(&mut self, target: ConnectionState) {
            loop {
                let state = self.states.recv().await.expect("observer alive");
                if state == target {
                    return;
                }
            }
        }

        async fn open(&mut self) -> FakeTransport {
            let transport = self.next_transport().await;
            transport
                .events
                .send(TransportEvent::Opened)
                .expect("pump alive");
            self.wait_for(ConnectionState::Open).await;
            transport
        }
    }

    fn listen(manager: &RealtimeManager, event_type: EventType) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.subscribe(event_type, move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    fn message(event_type: &str, payload: Value) -> TransportEvent {
        TransportEvent::Message(json!({ "type": event_type, "payload": payload }).to_string())
    }

    fn expected_base(attempt: u32) -> Duration {
        Duration::from_millis((500u64 << (attempt - 1)).min(8000))
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_exponentially_with_bounded_jitter() {
        let mut harness = Harness::new(RealtimeOptions::default());
        harness.manager.connect();

        let mut transport = harness.next_transport().await;
        for attempt in 1..=5 {
            transport
                .events
                .send(TransportEvent::Error("connection refused".to_string()))
                .expect("pump alive");

            let (scheduled_attempt, delay) = harness.next_scheduled().await;
            let scheduled_at = Instant::now();
            let base = expected_base(attempt);
            assert_eq!(scheduled_attempt, attempt);
            assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
            assert!(delay <= base + Duration::from_millis(250));
            assert_eq!(harness.manager.state(), ConnectionState::Reconnecting);

            if attempt < 5 {
                transport = harness.next_transport().await;
                assert!(scheduled_at.elapsed() >= delay);
            }
        }
        assert_eq!(harness.manager.reconnect_attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn open_resets_attempt_counter() {
        let mut harness = Harness::new(RealtimeOptions::default());
        harness.manager.connect();

        for _ in 0..2 {
            let transport = harness.next_transport().await;
            transport
                .events
                .send(TransportEvent::Error("refused".to_string()))
                .expect("pump alive");
            harness.next_scheduled().await;
        }

        let transport = harness.open().await;
        assert_eq!(harness.manager.reconnect_attempts(), 0);

        transport
            .events
            .send(TransportEvent::Closed)
            .expect("pump alive");
        let (attempt, delay) = harness.next_scheduled().await;
        assert_eq!(attempt, 1);
        assert!(delay <= Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let mut harness = Harness::new(RealtimeOptions::default());
        harness.manager.connect();

        let transport = harness.next_transport().await;
        transport
            .events
            .send(TransportEvent::Error("refused".to_string()))
            .expect("pump alive");
        harness.next_scheduled().await;

        harness.manager.close();
        assert_eq!(harness.manager.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(harness.opened.try_recv().is_err());
        assert_eq!(harness.manager.state(), ConnectionState::Closed);

        // Closing again changes nothing.
        harness.manager.close();
        assert_eq!(harness.manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_on_idle_manager_is_noop() {
        let harness = Harness::new(RealtimeOptions::default());
        harness.manager.close();
        assert_eq!(harness.manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_connecting_or_open() {
        let mut harness = Harness::new(RealtimeOptions::default());
        harness.manager.connect();
        harness.manager.connect();
        let transport = harness.next_transport().await;
        assert!(harness.opened.try_recv().is_err());

        transport
            .events
            .send(TransportEvent::Opened)
            .expect("pump alive");
        harness.wait_for(ConnectionState::Open).await;
        harness.manager.connect();
        assert!(harness.opened.try_recv().is_err());
        assert_eq!(harness.manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_events_reach_matching_subscribers_only() {
        let mut harness = Harness::new(RealtimeOptions::default());
        let mut deltas = listen(&harness.manager, EventType::ChatDelta);
        let mut tasks = listen(&harness.manager, EventType::TaskUpdate);
        let mut marker = listen(&harness.manager, EventType::MetricsUpdate);
        harness.manager.connect();
        let transport = harness.open().await;

        transport
            .events
            .send(message("chat.delta", json!({ "text": "hel" })))
            .expect("pump alive");
        transport
            .events
            .send(message("metrics.update", json!({})))
            .expect("pump alive");
        marker.recv().await.expect("marker delivered");

        let delta = deltas.try_recv().expect("delta delivered");
        assert_eq!(delta.event_type, EventType::ChatDelta);
        assert_eq!(delta.payload, json!({ "text": "hel" }));
        assert!(delta.timestamp > 0);
        assert!(deltas.try_recv().is_err());
        assert!(tasks.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_yields_single_error_event() {
        let mut harness = Harness::new(RealtimeOptions::default());
        let mut errors = listen(&harness.manager, EventType::Error);
        let mut deltas = listen(&harness.manager, EventType::ChatDelta);
        let mut marker = listen(&harness.manager, EventType::MetricsUpdate);
        harness.manager.connect();
        let transport = harness.open().await;

        for inbound in [
            TransportEvent::Message("{not json".to_string()),
            TransportEvent::Message(r#"{"type":"mystery","payload":1}"#.to_string()),
            TransportEvent::Message(r#"{"payload":1}"#.to_string()),
            message("metrics.update", json!(null)),
        ] {
            transport.events.send(inbound).expect("pump alive");
        }
        marker.recv().await.expect("marker delivered");

        let error = errors.try_recv().expect("protocol error delivered");
        assert_eq!(error.payload["kind"], "protocol");
        assert_eq!(error.payload["raw"], "{not json");
        assert!(errors.try_recv().is_err());
        assert!(deltas.try_recv().is_err());
        assert_eq!(harness.manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_handler_stops_receiving() {
        let mut harness = Harness::new(RealtimeOptions::default());
        let (tx, mut removed) = mpsc::unbounded_channel();
        let subscription = harness.manager.subscribe(EventType::ChatComplete, move |event| {
            let _ = tx.send(event.clone());
        });
        let mut kept = listen(&harness.manager, EventType::ChatComplete);
        harness.manager.connect();
        let transport = harness.open().await;

        harness
            .manager
            .unsubscribe(EventType::ChatComplete, subscription.id());
        transport
            .events
            .send(message("chat.complete", json!({ "id": 7 })))
            .expect("pump alive");

        kept.recv().await.expect("kept handler delivered");
        assert!(removed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn send_only_succeeds_on_open_websocket() {
        let mut harness = Harness::new(RealtimeOptions::default());
        assert!(!harness.manager.send(EventType::ChatDelta, json!("early")));

        harness.manager.connect();
        assert!(!harness.manager.send(EventType::ChatDelta, json!("connecting")));

        let mut transport = harness.open().await;
        assert!(harness
            .manager
            .send(EventType::TaskUpdate, json!({ "id": 3, "status": "done" })));

        let outbound = transport
            .outbound
            .as_mut()
            .expect("websocket is writable")
            .recv()
            .await
            .expect("outbound message");
        let sent: Value = serde_json::from_str(&outbound).expect("outbound json");
        assert_eq!(
            sent,
            json!({ "type": "task.update", "payload": { "id": 3, "status": "done" } })
        );

        harness.manager.close();
        assert!(!harness.manager.send(EventType::ChatDelta, json!("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn send_is_refused_on_sse() {
        let mut harness = Harness::new(RealtimeOptions::default().with_protocol(Protocol::Sse));
        harness.manager.connect();
        let transport = harness.open().await;

        assert!(transport.outbound.is_none());
        assert!(!harness.manager.send(EventType::ChatDelta, json!("nope")));
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_sent_on_every_attempt() {
        let mut harness = Harness::new(
            RealtimeOptions::default().with_token(SecretString::new("abc".to_string())),
        );
        harness.manager.connect();

        let first = harness.next_transport().await;
        assert_eq!(first.url, "ws://localhost:9/live?token=abc");

        harness
            .manager
            .set_token(Some(SecretString::new("rotated".to_string())));
        first
            .events
            .send(TransportEvent::Error("unauthorized".to_string()))
            .expect("pump alive");

        let second = harness.next_transport().await;
        assert_eq!(second.url, "ws://localhost:9/live?token=rotated");
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_are_published_on_the_bus() {
        let mut harness = Harness::new(RealtimeOptions::default());
        let mut states = listen(&harness.manager, EventType::ConnectionState);
        harness.manager.connect();
        let transport = harness.open().await;
        transport
            .events
            .send(TransportEvent::Error("reset".to_string()))
            .expect("pump alive");
        harness.next_scheduled().await;

        let observed: Vec<Value> = std::iter::from_fn(|| states.try_recv().ok())
            .map(|event| event.payload)
            .collect();
        assert_eq!(observed.len(), 3);
        assert_eq!(observed[0]["state"], "connecting");
        assert_eq!(observed[0]["previous"], "idle");
        assert_eq!(observed[1]["state"], "open");
        assert_eq!(observed[2]["state"], "reconnecting");
        assert_eq!(observed[2]["attempt"], 1);
        assert!(observed[2]["delay_ms"].as_u64().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let mut harness = Harness::new(RealtimeOptions::default().with_max_attempts(2));
        let mut errors = listen(&harness.manager, EventType::Error);
        harness.manager.connect();

        for _ in 0..3 {
            let transport = harness.next_transport().await;
            transport
                .events
                .send(TransportEvent::Error("refused".to_string()))
                .expect("pump alive");
        }
        harness.wait_for(ConnectionState::Closed).await;

        let gave_up = loop {
            let event = errors.recv().await.expect("error event");
            if event.payload["kind"] == "gave_up" {
                break event;
            }
            assert_eq!(event.payload["kind"], "transport");
        };
        assert_eq!(gave_up.payload["attempts"], 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(harness.opened.try_recv().is_err());

        // An explicit connect starts over.
        harness.manager.connect();
        harness.next_transport().await;
        assert_eq!(harness.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_reconnecting_opens_immediately() {
        let mut harness = Harness::new(RealtimeOptions::default());
        harness.manager.connect();

        for _ in 0..2 {
            let transport = harness.next_transport().await;
            transport
                .events
                .send(TransportEvent::Error("refused".to_string()))
                .expect("pump alive");
            harness.next_scheduled().await;
        }
        assert_eq!(harness.manager.state(), ConnectionState::Reconnecting);
        assert_eq!(harness.manager.reconnect_attempts(), 2);

        harness.manager.connect();
        assert!(harness.opened.try_recv().is_ok());
        assert_eq!(harness.manager.state(), ConnectionState::Connecting);
        assert_eq!(harness.manager.reconnect_attempts(), 0);

        // The cancelled timer must not open a second transport.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(harness.opened.try_recv().is_err());
        assert_eq!(harness.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_url_reports_error_and_keeps_retrying() {
        let mut harness = Harness::with_url("not a url", RealtimeOptions::default());
        let mut errors = listen(&harness.manager, EventType::Error);
        harness.manager.connect();

        let error = errors.try_recv().expect("error dispatched on connect");
        assert_eq!(error.payload["kind"], "transport");
        assert!(errors.try_recv().is_err());
        assert_eq!(harness.manager.state(), ConnectionState::Reconnecting);

        let (attempt, _) = harness.next_scheduled().await;
        assert_eq!(attempt, 1);
        let (attempt, _) = harness.next_scheduled().await;
        assert_eq!(attempt, 2);
        assert_eq!(
            errors.recv().await.expect("second error").payload["kind"],
            "transport"
        );
        assert!(harness.opened.try_recv().is_err());
    }

    /// Connector whose transports report `Opened` before `open` returns.
    struct InstantConnector {
        live: std::sync::Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl Connector for InstantConnector {
        fn open(&self, _url: &str, _protocol: Protocol) -> TransportHandle {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let _ = events_tx.send(TransportEvent::Opened);
            self.live.lock().expect("live transports").push(events_tx);
            TransportHandle {
                events: events_rx,
                outbound: None,
                task: None,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn state_notices_keep_order_across_tasks() {
        for round in 0..300 {
            let (states_tx, mut states) = mpsc::unbounded_channel();
            let (scheduled_tx, _scheduled) = mpsc::unbounded_channel();
            let observer = Arc::new(RecordingObserver {
                states: states_tx,
                scheduled: scheduled_tx,
            });
            let manager = RealtimeManager::with_connector(
                URL,
                RealtimeOptions::default().with_observer(observer),
                Arc::new(InstantConnector {
                    live: std::sync::Mutex::default(),
                }),
            );
            let mut bus_states = listen(&manager, EventType::ConnectionState);
            manager.connect();

            let mut observed = Vec::new();
            while observed.last() != Some(&ConnectionState::Open) {
                let state = tokio::time::timeout(Duration::from_secs(5), states.recv())
                    .await
                    .expect("state change in time")
                    .expect("observer alive");
                observed.push(state);
            }
            assert_eq!(
                observed,
                vec![ConnectionState::Connecting, ConnectionState::Open],
                "round {round}"
            );

            let first = bus_states.recv().await.expect("connecting event");
            let second = bus_states.recv().await.expect("open event");
            assert_eq!(first.payload["state"], "connecting", "round {round}");
            assert_eq!(second.payload["state"], "open", "round {round}");
        }
    }

    #[test]
    fn channel_url_appends_encoded_token() {
        let token = SecretString::new("a b&c".to_string());
        assert_eq!(
            channel_url("wss://example.com/rt?room=1", Some(&token)).expect("url"),
            "wss://example.com/rt?room=1&token=a+b%26c"
        );
        assert_eq!(
            channel_url("http://example.com/events", None).expect("url"),
            "http://example.com/events"
        );
        assert!(channel_url("not a url", None).is_err());
    }
}
