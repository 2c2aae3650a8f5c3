//! Realtime change-notification channel
//!
//! One socket, many subscriptions. A single driver task owns the socket:
//! it connects, joins every registered topic, sends heartbeats, forwards
//! join/leave commands, and dispatches inbound change records. When the
//! socket closes it waits `reconnect_delay` and starts over; the
//! subscription map survives every reconnect.
//!
//! Wire format (JSON text frames):
//! - join: `{"topic":"realtime:public:<table>:<filter>","event":"phx_join","payload":{},"ref":"1"}`
//! - leave: same topic, `"event":"phx_leave"`
//! - heartbeat: `{"topic":"phoenix","event":"heartbeat","payload":{},"ref":"2"}`
//! - inbound: `{"event":"postgres_changes","payload":{"table":..,"eventType":..,"new":..,"old":..}}`

use crate::error::RealtimeError;
use crate::services::realtime_transport::{RealtimeConnector, RealtimeTransport};
use chrono::Utc;
use irp_common::config::RealtimeSettings;
use irp_common::events::{ClientEvent, ConnectionState, EventBus};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Floor for the heartbeat period; a zero interval would panic the timer
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// Matches every kind
    All,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::All => "*",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "INSERT" => Some(EventKind::Insert),
            "UPDATE" => Some(EventKind::Update),
            "DELETE" => Some(EventKind::Delete),
            "*" | "ALL" => Some(EventKind::All),
            _ => None,
        }
    }

    /// A subscription for `self` receives a change of kind `kind`
    pub fn accepts(&self, kind: EventKind) -> bool {
        *self == EventKind::All || *self == kind
    }
}

/// Row filter in `field=eq.value` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub field: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn parse(filter: &str) -> Result<Self, RealtimeError> {
        let (field, rest) = filter
            .split_once('=')
            .ok_or_else(|| RealtimeError::Config(format!("invalid filter: {}", filter)))?;
        let value = rest
            .strip_prefix("eq.")
            .ok_or_else(|| RealtimeError::Config(format!("only eq filters are supported: {}", filter)))?;
        if field.trim().is_empty() {
            return Err(RealtimeError::Config(format!("invalid filter: {}", filter)));
        }
        Ok(Self::eq(field.trim(), value))
    }

    /// Record's `field` equals `value` (non-string values by their JSON text)
    pub fn matches(&self, record: &Value) -> bool {
        match record.get(&self.field) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.field, self.value)
    }
}

/// One inbound row change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub table: String,
    pub event_kind: EventKind,
    /// New row, or the old row for deletes
    pub record: Value,
    pub old_record: Option<Value>,
}

impl ChangeRecord {
    /// Parse an inbound frame; `None` for anything but a row change
    pub fn from_frame(frame: &Value) -> Option<Self> {
        if frame.get("event").and_then(Value::as_str) != Some("postgres_changes") {
            return None;
        }
        let payload = frame.get("payload")?;
        // Newer servers nest the change under `data`
        let body = payload.get("data").filter(|d| d.is_object()).unwrap_or(payload);

        let table = body.get("table")?.as_str()?.to_string();
        let kind = body
            .get("eventType")
            .or_else(|| body.get("type"))
            .and_then(Value::as_str)
            .and_then(EventKind::parse)?;

        let new = body
            .get("new")
            .or_else(|| body.get("record"))
            .filter(|v| !is_empty_row(v))
            .cloned();
        let old = body
            .get("old")
            .or_else(|| body.get("old_record"))
            .filter(|v| !is_empty_row(v))
            .cloned();

        let record = new.or_else(|| old.clone())?;
        Some(Self {
            table,
            event_kind: kind,
            record,
            old_record: old,
        })
    }
}

fn is_empty_row(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Subscription callback; errors and panics are logged, never propagated
pub type ChangeCallback = Arc<dyn Fn(&ChangeRecord) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    table: String,
    filter: Option<RowFilter>,
    event_kind: EventKind,
    callback: ChangeCallback,
}

impl Subscription {
    fn topic(&self) -> String {
        topic_for(&self.table, self.filter.as_ref())
    }

    fn matches(&self, change: &ChangeRecord) -> bool {
        self.table == change.table
            && self.event_kind.accepts(change.event_kind)
            && self
                .filter
                .as_ref()
                .map(|f| f.matches(&change.record))
                .unwrap_or(true)
    }
}

fn topic_for(table: &str, filter: Option<&RowFilter>) -> String {
    match filter {
        Some(filter) => format!("realtime:public:{}:{}", table, filter),
        None => format!("realtime:public:{}", table),
    }
}

/// Reconnect and heartbeat timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTiming {
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ChannelTiming {
    fn default() -> Self {
        Self::from(&RealtimeSettings::default())
    }
}

impl From<&RealtimeSettings> for ChannelTiming {
    fn from(settings: &RealtimeSettings) -> Self {
        Self {
            reconnect_delay: settings.reconnect_delay(),
            heartbeat_interval: settings.heartbeat_interval(),
        }
    }
}

enum Command {
    Join(String),
    Leave(String),
}

/// Running driver task
struct Driver {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn RealtimeConnector>,
    timing: ChannelTiming,
    events: Option<EventBus>,
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    next_ref: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    driver: Mutex<Option<Driver>>,
}

/// Realtime channel handle
///
/// Clones share the socket and the subscription map. Call `disconnect` to
/// stop the driver task.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<Inner>,
}

impl RealtimeChannel {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        timing: ChannelTiming,
        events: Option<EventBus>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                timing,
                events,
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_ref: AtomicU64::new(1),
                state_tx,
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock_subscriptions().len()
    }

    /// Start the driver task; no-op while it is already running
    pub fn connect(&self) {
        let mut driver = self.inner.lock_driver();
        if let Some(existing) = driver.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Realtime channel already running");
                return;
            }
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let handle = tokio::spawn(run_driver(inner, command_rx, cancel.clone()));

        *driver = Some(Driver {
            commands,
            cancel,
            handle,
        });
    }

    /// Close the socket, stop reconnecting and drop every subscription
    pub async fn disconnect(&self) {
        let driver = self.inner.lock_driver().take();
        self.inner.lock_subscriptions().clear();

        if let Some(driver) = driver {
            driver.cancel.cancel();
            if let Err(e) = driver.handle.await {
                warn!("Realtime driver ended abnormally: {}", e);
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!("Realtime channel disconnected");
    }

    /// Register a subscription
    ///
    /// Sent immediately when connected, otherwise on the next connect.
    pub fn subscribe<F>(
        &self,
        table: &str,
        filter: Option<&str>,
        event_kind: EventKind,
        callback: F,
    ) -> Result<SubscriptionId, RealtimeError>
    where
        F: Fn(&ChangeRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let filter = filter.map(RowFilter::parse).transpose()?;
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            table: table.to_string(),
            filter,
            event_kind,
            callback: Arc::new(callback),
        };
        let topic = subscription.topic();

        self.inner.lock_subscriptions().insert(id, subscription);
        debug!(subscription_id = %id, topic = %topic, "Subscribed");
        self.inner.send_command(Command::Join(topic));
        Ok(id)
    }

    /// Remove a subscription; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (removed, topic_still_used) = {
            let mut subscriptions = self.inner.lock_subscriptions();
            match subscriptions.remove(&id) {
                Some(sub) => {
                    let topic = sub.topic();
                    let used = subscriptions.values().any(|s| s.topic() == topic);
                    (Some(topic), used)
                }
                None => (None, false),
            }
        };

        match removed {
            Some(topic) => {
                debug!(subscription_id = %id, topic = %topic, "Unsubscribed");
                if !topic_still_used {
                    self.inner.send_command(Command::Leave(topic));
                }
                true
            }
            None => false,
        }
    }

    /// New messages of one conversation session
    pub fn subscribe_to_conversation<F>(
        &self,
        session_id: &str,
        callback: F,
    ) -> Result<SubscriptionId, RealtimeError>
    where
        F: Fn(&ChangeRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(
            "conversation_messages",
            Some(&RowFilter::eq("session_id", session_id).to_string()),
            EventKind::Insert,
            callback,
        )
    }

    /// New analysis results of one project
    pub fn subscribe_to_analysis_results<F>(
        &self,
        project_id: &str,
        callback: F,
    ) -> Result<SubscriptionId, RealtimeError>
    where
        F: Fn(&ChangeRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(
            "analysis_results",
            Some(&RowFilter::eq("project_id", project_id).to_string()),
            EventKind::Insert,
            callback,
        )
    }
}

impl Inner {
    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_driver(&self) -> std::sync::MutexGuard<'_, Option<Driver>> {
        self.driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_command(&self, command: Command) {
        if let Some(driver) = self.lock_driver().as_ref() {
            let _ = driver.commands.send(command);
        }
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = *self.state_tx.borrow();
        if old_state == new_state {
            return;
        }
        self.state_tx.send_replace(new_state);
        debug!(?old_state, ?new_state, "Realtime state changed");
        if let Some(events) = &self.events {
            events.emit_lossy(ClientEvent::RealtimeStateChanged {
                old_state,
                new_state,
                timestamp: Utc::now(),
            });
        }
    }

    fn topics(&self) -> Vec<String> {
        let subscriptions = self.lock_subscriptions();
        let mut ids: Vec<&SubscriptionId> = subscriptions.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| subscriptions.get(id).map(|s| s.topic()))
            .collect()
    }

    fn has_topic(&self, topic: &str) -> bool {
        self.lock_subscriptions().values().any(|s| s.topic() == topic)
    }

    fn frame(&self, topic: &str, event: &str) -> String {
        let reference = self.next_ref.fetch_add(1, Ordering::Relaxed);
        json!({
            "topic": topic,
            "event": event,
            "payload": {},
            "ref": reference.to_string(),
        })
        .to_string()
    }

    fn dispatch(&self, change: &ChangeRecord) {
        let mut targets: Vec<(SubscriptionId, ChangeCallback)> = self
            .lock_subscriptions()
            .iter()
            .filter(|(_, sub)| sub.matches(change))
            .map(|(id, sub)| (*id, sub.callback.clone()))
            .collect();
        targets.sort_by_key(|(id, _)| *id);

        trace!(table = %change.table, targets = targets.len(), "Dispatching change");
        for (id, callback) in targets {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(subscription_id = %id, "Subscription callback failed: {:#}", e),
                Err(_) => error!(subscription_id = %id, "Subscription callback panicked"),
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring malformed realtime frame: {}", e);
                return;
            }
        };
        match ChangeRecord::from_frame(&frame) {
            Some(change) => self.dispatch(&change),
            None => trace!(
                event = frame.get("event").and_then(|v| v.as_str()).unwrap_or(""),
                "Ignoring non-change frame"
            ),
        }
    }

    /// Run one connection until it closes or the channel shuts down
    async fn serve(
        &self,
        transport: &mut dyn RealtimeTransport,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> ServeEnd {
        let mut joined: HashSet<String> = HashSet::new();
        for topic in self.topics() {
            if joined.insert(topic.clone()) {
                if let Err(e) = transport.send(self.frame(&topic, "phx_join")).await {
                    return ServeEnd::Closed(e.to_string());
                }
            }
        }
        debug!(topics = joined.len(), "Realtime subscriptions joined");

        let period = self.timing.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ServeEnd::Shutdown,
                _ = heartbeat.tick() => {
                    if let Err(e) = transport.send(self.frame("phoenix", "heartbeat")).await {
                        return ServeEnd::Closed(e.to_string());
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Join(topic)) => {
                        if !joined.contains(&topic) && self.has_topic(&topic) {
                            if let Err(e) = transport.send(self.frame(&topic, "phx_join")).await {
                                return ServeEnd::Closed(e.to_string());
                            }
                            joined.insert(topic);
                        }
                    }
                    Some(Command::Leave(topic)) => {
                        if joined.contains(&topic) && !self.has_topic(&topic) {
                            joined.remove(&topic);
                            if let Err(e) = transport.send(self.frame(&topic, "phx_leave")).await {
                                return ServeEnd::Closed(e.to_string());
                            }
                        }
                    }
                    None => return ServeEnd::Shutdown,
                },
                frame = transport.recv() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => return ServeEnd::Closed(e.to_string()),
                    None => return ServeEnd::Closed("closed by peer".to_string()),
                },
            }
        }
    }
}

enum ServeEnd {
    Shutdown,
    Closed(String),
}

async fn run_driver(
    inner: Arc<Inner>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    loop {
        inner.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = inner.connector.connect() => result,
        };

        match connected {
            Ok(mut transport) => {
                inner.set_state(ConnectionState::Connected);
                info!("Realtime channel connected");
                let end = inner.serve(transport.as_mut(), &mut commands, &cancel).await;
                transport.close().await;
                match end {
                    ServeEnd::Shutdown => break,
                    ServeEnd::Closed(reason) => warn!("Realtime connection closed: {}", reason),
                }
            }
            Err(e) => warn!("Realtime connect failed: {}", e),
        }

        inner.set_state(ConnectionState::Disconnected);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.timing.reconnect_delay) => {}
        }
        debug!("Reconnecting realtime channel");
    }

    inner.set_state(ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parse_and_display() {
        let filter = RowFilter::parse("session_id=eq.abc-1").unwrap();
        assert_eq!(filter, RowFilter::eq("session_id", "abc-1"));
        assert_eq!(filter.to_string(), "session_id=eq.abc-1");
        assert!(RowFilter::parse("session_id").is_err());
        assert!(RowFilter::parse("session_id=gt.5").is_err());
    }

    #[test]
    fn test_filter_matches_numbers_by_text() {
        let filter = RowFilter::eq("project_id", "42");
        assert!(filter.matches(&json!({"project_id": 42})));
        assert!(filter.matches(&json!({"project_id": "42"})));
        assert!(!filter.matches(&json!({"project_id": 7})));
        assert!(!filter.matches(&json!({"other": 42})));
    }

    #[test]
    fn test_change_record_uses_new_then_old() {
        let insert = ChangeRecord::from_frame(&json!({
            "event": "postgres_changes",
            "payload": {"table": "t", "eventType": "INSERT", "new": {"id": 1}, "old": {}}
        }))
        .unwrap();
        assert_eq!(insert.event_kind, EventKind::Insert);
        assert_eq!(insert.record, json!({"id": 1}));
        assert!(insert.old_record.is_none());

        let delete = ChangeRecord::from_frame(&json!({
            "event": "postgres_changes",
            "payload": {"table": "t", "eventType": "DELETE", "new": {}, "old": {"id": 2}}
        }))
        .unwrap();
        assert_eq!(delete.record, json!({"id": 2}));
    }

    #[test]
    fn test_change_record_nested_data_layout() {
        let change = ChangeRecord::from_frame(&json!({
            "event": "postgres_changes",
            "payload": {"data": {"table": "t", "type": "UPDATE", "record": {"id": 3}}}
        }))
        .unwrap();
        assert_eq!(change.event_kind, EventKind::Update);
        assert_eq!(change.record, json!({"id": 3}));
    }

    #[test]
    fn test_non_change_frames_are_ignored() {
        assert!(ChangeRecord::from_frame(&json!({"event": "phx_reply", "payload": {}})).is_none());
    }

    #[test]
    fn test_topic_format() {
        assert_eq!(
            topic_for("conversation_messages", Some(&RowFilter::eq("session_id", "s1"))),
            "realtime:public:conversation_messages:session_id=eq.s1"
        );
        assert_eq!(topic_for("t", None), "realtime:public:t");
    }

    #[test]
    fn test_event_kind_accepts() {
        assert!(EventKind::All.accepts(EventKind::Delete));
        assert!(EventKind::Insert.accepts(EventKind::Insert));
        assert!(!EventKind::Insert.accepts(EventKind::Update));
    }
}
