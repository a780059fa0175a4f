//! Event fan-out to handler sinks.
//!
//! Dispatch is asynchronous: each sink is invoked on its own task, so a
//! slow sink cannot back-pressure the producer. Sinks may be wrapped by
//! filters; wrappers answer `is_wrapping` so unregister-by-identity
//! works through them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use trellis_domain::{Error, Result};

use crate::policy::ServiceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitEventType {
    Created,
    Updated,
    Deleted,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitEvent {
    pub event_type: CircuitEventType,
    pub circuit_id: String,
    pub client_token: String,
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminator_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Routers on the path at event time.
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkEventType {
    Connected,
    Faulted,
    Duplicate,
    Removed,
    FromRouterNew,
    FromRouterKnown,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkEvent {
    pub event_type: LinkEventType,
    pub link_id: String,
    pub src_router_id: String,
    pub dst_router_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterEventType {
    Connected,
    Disconnected,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterEvent {
    pub event_type: RouterEventType,
    pub router_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Versioned usage envelopes. V2 is one counter per event; V3 batches
/// counters per (source, interval).
#[derive(Debug, Clone, Serialize)]
pub struct UsageEventV2 {
    pub source_id: String,
    pub usage_type: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEventV3 {
    pub source_id: String,
    pub usage: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEventType {
    LeadershipGained,
    LeadershipLost,
    MembersChanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterEvent {
    pub event_type: ClusterEventType,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsMessage {
    pub source_id: String,
    pub values: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiSessionEventType {
    Created,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiSessionEvent {
    pub event_type: ApiSessionEventType,
    pub id: String,
    pub identity_id: String,
}

/// The closed sum of everything the dispatcher fans out.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "namespace", rename_all = "snake_case")]
pub enum Event {
    Circuit(CircuitEvent),
    Link(LinkEvent),
    Router(RouterEvent),
    Service(ServiceEvent),
    UsageV2(UsageEventV2),
    UsageV3(UsageEventV3),
    Cluster(ClusterEvent),
    Metrics(MetricsMessage),
    ApiSession(ApiSessionEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Circuit,
    Link,
    Router,
    Service,
    UsageV2,
    UsageV3,
    Cluster,
    Metrics,
    ApiSession,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Circuit(_) => EventKind::Circuit,
            Event::Link(_) => EventKind::Link,
            Event::Router(_) => EventKind::Router,
            Event::Service(_) => EventKind::Service,
            Event::UsageV2(_) => EventKind::UsageV2,
            Event::UsageV3(_) => EventKind::UsageV3,
            Event::Cluster(_) => EventKind::Cluster,
            Event::Metrics(_) => EventKind::Metrics,
            Event::ApiSession(_) => EventKind::ApiSession,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait EventSink: Send + Sync {
    fn accept(&self, event: Event);

    /// Wrappers return whether they (transitively) wrap `other`.
    fn is_wrapping(&self, _other: &Arc<dyn EventSink>) -> bool {
        false
    }
}

#[derive(Default)]
pub struct EventDispatcher {
    sinks: RwLock<HashMap<EventKind, Vec<Arc<dyn EventSink>>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, kind: EventKind, sink: Arc<dyn EventSink>) {
        self.sinks.write().entry(kind).or_default().push(sink);
    }

    /// Remove a handler by identity, piercing wrappers.
    pub fn remove_handler(&self, kind: EventKind, target: &Arc<dyn EventSink>) {
        let mut sinks = self.sinks.write();
        if let Some(list) = sinks.get_mut(&kind) {
            list.retain(|sink| !Arc::ptr_eq(sink, target) && !sink.is_wrapping(target));
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.sinks.read().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Fan an event out; each sink runs on its own task when a runtime
    /// is available, so a slow sink never blocks the producer.
    pub fn dispatch(&self, event: Event) {
        let snapshot: Vec<Arc<dyn EventSink>> = self
            .sinks
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for sink in snapshot {
            let event = event.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { sink.accept(event) });
                }
                Err(_) => sink.accept(event),
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage v3 filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Restricts v3 usage events to an allowlist of usage-type keys.
pub struct FilteredUsageV3Sink {
    inner: Arc<dyn EventSink>,
    include: HashSet<String>,
}

impl FilteredUsageV3Sink {
    /// An empty include list is a configuration error: drop the filter
    /// stanza instead of filtering everything out.
    pub fn new(inner: Arc<dyn EventSink>, include: Vec<String>) -> Result<Self> {
        if include.is_empty() {
            return Err(Error::Config(
                "no values provided in include list for usage events".into(),
            ));
        }
        Ok(Self {
            inner,
            include: include.into_iter().collect(),
        })
    }
}

impl EventSink for FilteredUsageV3Sink {
    fn accept(&self, event: Event) {
        if let Event::UsageV3(mut usage) = event {
            usage.usage.retain(|key, _| self.include.contains(key));
            if !usage.usage.is_empty() {
                self.inner.accept(Event::UsageV3(usage));
            }
        }
    }

    fn is_wrapping(&self, other: &Arc<dyn EventSink>) -> bool {
        Arc::ptr_eq(&self.inner, other) || self.inner.is_wrapping(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector {
        events: Mutex<Vec<Event>>,
    }

    impl EventSink for Collector {
        fn accept(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    fn usage_v3(pairs: &[(&str, u64)]) -> Event {
        Event::UsageV3(UsageEventV3 {
            source_id: "r1".into(),
            usage: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        })
    }

    #[test]
    fn dispatch_reaches_kind_handlers_only() {
        let dispatcher = EventDispatcher::new();
        let circuits = Arc::new(Collector::default());
        let links = Arc::new(Collector::default());
        dispatcher.add_handler(EventKind::Circuit, circuits.clone());
        dispatcher.add_handler(EventKind::Link, links.clone());

        dispatcher.dispatch(Event::Circuit(CircuitEvent {
            event_type: CircuitEventType::Created,
            circuit_id: "c1".into(),
            client_token: "tok".into(),
            service_id: "svc1".into(),
            terminator_id: None,
            instance_id: None,
            path: vec![],
            creation_millis: None,
            failure_cause: None,
        }));

        assert_eq!(circuits.events.lock().len(), 1);
        assert!(links.events.lock().is_empty());
    }

    #[test]
    fn v3_filter_restricts_to_allowlist() {
        let inner = Arc::new(Collector::default());
        let filter =
            FilteredUsageV3Sink::new(inner.clone(), vec!["ingress.rx".into()]).unwrap();

        filter.accept(usage_v3(&[("ingress.rx", 10), ("egress.tx", 5)]));
        let events = inner.events.lock();
        match &events[0] {
            Event::UsageV3(usage) => {
                assert_eq!(usage.usage.len(), 1);
                assert!(usage.usage.contains_key("ingress.rx"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn v3_filter_drops_fully_excluded_events() {
        let inner = Arc::new(Collector::default());
        let filter = FilteredUsageV3Sink::new(inner.clone(), vec!["x".into()]).unwrap();
        filter.accept(usage_v3(&[("y", 1)]));
        assert!(inner.events.lock().is_empty());
    }

    #[test]
    fn empty_include_list_is_rejected() {
        let inner = Arc::new(Collector::default());
        assert!(FilteredUsageV3Sink::new(inner, vec![]).is_err());
    }

    #[test]
    fn unregister_pierces_wrappers() {
        let dispatcher = EventDispatcher::new();
        let inner: Arc<dyn EventSink> = Arc::new(Collector::default());
        let wrapped = Arc::new(
            FilteredUsageV3Sink::new(inner.clone(), vec!["ingress.rx".into()]).unwrap(),
        );
        dispatcher.add_handler(EventKind::UsageV3, wrapped);
        assert_eq!(dispatcher.handler_count(EventKind::UsageV3), 1);

        // Removing by the *inner* handler unregisters the wrapper.
        dispatcher.remove_handler(EventKind::UsageV3, &inner);
        assert_eq!(dispatcher.handler_count(EventKind::UsageV3), 0);
    }
}
