// Event System for the Trade-Cost Pipeline
// Operational events (reconnects, drops, fallbacks) fanned out to registered callbacks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use parking_lot::RwLock;
use uuid::Uuid;

// ============================================================================
// Event Kind / Priority
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Subscribed,
    Reconnecting,
    FrameDropped,
    SequenceGap,
    ValidationFailed,
    StaleFrameDropped,
    ComputationFallback,
    RetrainFailed,
    ModelRefit,
    FatalError,
    PipelineStarted,
    PipelineStopped,
}

impl EventKind {
    pub fn priority(&self) -> EventPriority {
        match self {
            EventKind::FatalError => EventPriority::Critical,
            EventKind::SequenceGap | EventKind::Reconnecting => EventPriority::High,
            EventKind::ValidationFailed
            | EventKind::ComputationFallback
            | EventKind::RetrainFailed => EventPriority::Medium,
            EventKind::FrameDropped | EventKind::StaleFrameDropped => EventPriority::Low,
            EventKind::Subscribed
            | EventKind::ModelRefit
            | EventKind::PipelineStarted
            | EventKind::PipelineStopped => EventPriority::Info,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventPriority {
    Critical = 1,  // Pipeline cannot continue
    High = 2,      // Connection disruption
    Medium = 3,    // Degraded output
    Low = 4,       // Dropped input
    Info = 5,      // Lifecycle
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Event
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub context: HashMap<String, serde_json::Value>,
    pub source: String,
    pub priority: EventPriority,
    pub event_id: String,
}

impl Event {
    pub fn new(kind: EventKind, source: &str) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            context: HashMap::new(),
            source: source.to_string(),
            priority: kind.priority(),
            event_id: Uuid::new_v4().to_string(),
        }
    }

    /// Attach a context field
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event(kind={}, source={}, priority={}, id={})",
            self.kind,
            self.source,
            self.priority,
            &self.event_id[..8]
        )
    }
}

// ============================================================================
// Event Bus
// ============================================================================

type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Shared by the connection, engine and pipeline. Every publish is also
/// logged through tracing at a level derived from the event priority.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<EventCallback>>>,
    wildcard_subscribers: RwLock<Vec<EventCallback>>,
    event_history: RwLock<VecDeque<Event>>,
    max_history: usize,
    stats: RwLock<EventBusStats>,
}

#[derive(Debug, Clone, Default)]
struct EventBusStats {
    total_published: u64,
    total_delivered: u64,
    published_by_kind: HashMap<EventKind, u64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            wildcard_subscribers: RwLock::new(Vec::new()),
            event_history: RwLock::new(VecDeque::with_capacity(max_history)),
            max_history,
            stats: RwLock::new(EventBusStats::default()),
        }
    }

    /// Subscribe to a single kind of event.
    ///
    /// Callbacks run inline on the publishing thread, which for stream and
    /// engine events is the ingestion thread. A slow callback delays the next
    /// read, so hand heavy work off to another thread.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Subscribe to every event. Same inline delivery as `subscribe`.
    pub fn subscribe_all<F>(&self, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.wildcard_subscribers.write().push(Arc::new(callback));
    }

    pub fn publish(&self, event: Event) {
        log_event(&event);

        {
            let mut stats = self.stats.write();
            stats.total_published += 1;
            *stats.published_by_kind.entry(event.kind).or_insert(0) += 1;
        }

        {
            let mut history = self.event_history.write();
            if history.len() >= self.max_history {
                history.pop_front();
            }
            if self.max_history > 0 {
                history.push_back(event.clone());
            }
        }

        // Clone callbacks out so a callback may publish without deadlocking
        let mut callbacks: Vec<EventCallback> = self
            .subscribers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        callbacks.extend(self.wildcard_subscribers.read().iter().cloned());

        for callback in &callbacks {
            callback(&event);
        }
        self.stats.write().total_delivered += callbacks.len() as u64;
    }

    /// Most recent events first
    pub fn get_recent_events(&self, kind: Option<EventKind>, limit: usize) -> Vec<Event> {
        self.event_history
            .read()
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.stats.read().published_by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn get_stats(&self) -> EventBusStatsSnapshot {
        let stats = self.stats.read();
        EventBusStatsSnapshot {
            total_published: stats.total_published,
            total_delivered: stats.total_delivered,
            subscriber_count: self.subscribers.read().values().map(Vec::len).sum::<usize>()
                + self.wildcard_subscribers.read().len(),
            history_size: self.event_history.read().len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn log_event(event: &Event) {
    let context = serde_json::to_string(&event.context).unwrap_or_default();
    match event.priority {
        EventPriority::Critical => {
            tracing::error!(kind = %event.kind, source = %event.source, context = %context, "Pipeline event")
        }
        EventPriority::High | EventPriority::Medium => {
            tracing::warn!(kind = %event.kind, source = %event.source, context = %context, "Pipeline event")
        }
        EventPriority::Low => {
            tracing::debug!(kind = %event.kind, source = %event.source, context = %context, "Pipeline event")
        }
        EventPriority::Info => {
            tracing::info!(kind = %event.kind, source = %event.source, context = %context, "Pipeline event")
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBusStatsSnapshot {
    pub total_published: u64,
    pub total_delivered: u64,
    pub subscriber_count: usize,
    pub history_size: usize,
}

impl fmt::Display for EventBusStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventBusStats(published={}, delivered={}, subscribers={}, history={})",
            self.total_published, self.total_delivered, self.subscriber_count, self.history_size
        )
    }
}
