//! Runtime router state: the connected-router registry and each
//! router's live link view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use trellis_domain::model::Router;
use trellis_domain::{Error, Result};

use crate::channel::ControlChannel;

use super::link::Link;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RouterLinks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A router's current links. One mutex guards the pair
/// `(all_links, links_by_other_router)`; writers swap whole `Arc`'d
/// collections so readers never observe a partially-updated list.
#[derive(Debug, Default)]
pub struct RouterLinks {
    state: Mutex<RouterLinksState>,
}

#[derive(Debug, Default)]
struct RouterLinksState {
    all: Arc<Vec<Arc<Link>>>,
    by_other_router: Arc<HashMap<String, Vec<Arc<Link>>>>,
}

impl RouterLinks {
    pub fn all(&self) -> Arc<Vec<Arc<Link>>> {
        self.state.lock().all.clone()
    }

    pub fn by_other_router(&self) -> Arc<HashMap<String, Vec<Arc<Link>>>> {
        self.state.lock().by_other_router.clone()
    }

    pub fn add(&self, link: Arc<Link>, other_router_id: &str) {
        let mut state = self.state.lock();
        if state.all.iter().any(|l| l.id == link.id) {
            return;
        }
        let mut all = state.all.as_ref().clone();
        all.push(link.clone());
        let mut by_other = state.by_other_router.as_ref().clone();
        by_other
            .entry(other_router_id.to_string())
            .or_default()
            .push(link);
        state.all = Arc::new(all);
        state.by_other_router = Arc::new(by_other);
    }

    pub fn remove(&self, link_id: &str, other_router_id: &str) {
        let mut state = self.state.lock();
        let mut all = state.all.as_ref().clone();
        all.retain(|l| l.id != link_id);
        let mut by_other = state.by_other_router.as_ref().clone();
        if let Some(list) = by_other.get_mut(other_router_id) {
            list.retain(|l| l.id != link_id);
            if list.is_empty() {
                by_other.remove(other_router_id);
            }
        }
        state.all = Arc::new(all);
        state.by_other_router = Arc::new(by_other);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.all = Arc::new(Vec::new());
        state.by_other_router = Arc::new(HashMap::new());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RouterState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime state for one router: its persistent definition plus the
/// live control channel, version, and link view.
#[derive(Debug)]
pub struct RouterState {
    def: RwLock<Router>,
    connected: AtomicBool,
    channel: RwLock<Option<Arc<dyn ControlChannel>>>,
    version: RwLock<Option<String>>,
    capabilities: RwLock<Vec<String>>,
    connect_time: RwLock<Option<DateTime<Utc>>>,
    pub links: RouterLinks,
}

impl RouterState {
    pub fn new(def: Router) -> Self {
        Self {
            def: RwLock::new(def),
            connected: AtomicBool::new(false),
            channel: RwLock::new(None),
            version: RwLock::new(None),
            capabilities: RwLock::new(Vec::new()),
            connect_time: RwLock::new(None),
            links: RouterLinks::default(),
        }
    }

    pub fn id(&self) -> String {
        self.def.read().id.clone()
    }

    pub fn def(&self) -> Router {
        self.def.read().clone()
    }

    pub fn update_def(&self, def: Router) {
        *self.def.write() = def;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn channel(&self) -> Option<Arc<dyn ControlChannel>> {
        self.channel.read().clone()
    }

    pub fn version(&self) -> Option<String> {
        self.version.read().clone()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.capabilities.read().clone()
    }

    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        *self.connect_time.read()
    }

    pub fn no_traversal(&self) -> bool {
        self.def.read().no_traversal
    }

    pub fn cost(&self) -> u16 {
        self.def.read().cost
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RouterRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All known routers keyed by id. Definitions are seeded from storage;
/// connection state is runtime-only.
#[derive(Default)]
pub struct RouterRegistry {
    routers: DashMap<String, Arc<RouterState>>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a router definition.
    pub fn put(&self, def: Router) -> Arc<RouterState> {
        match self.routers.entry(def.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                existing.get().update_def(def);
                existing.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let state = Arc::new(RouterState::new(def));
                slot.insert(state.clone());
                state
            }
        }
    }

    pub fn remove(&self, router_id: &str) -> Option<Arc<RouterState>> {
        self.routers.remove(router_id).map(|(_, state)| state)
    }

    pub fn get(&self, router_id: &str) -> Option<Arc<RouterState>> {
        self.routers.get(router_id).map(|e| e.value().clone())
    }

    pub fn require(&self, router_id: &str) -> Result<Arc<RouterState>> {
        self.get(router_id)
            .ok_or_else(|| Error::not_found("router", router_id))
    }

    pub fn get_connected(&self, router_id: &str) -> Option<Arc<RouterState>> {
        self.get(router_id).filter(|r| r.is_connected())
    }

    pub fn is_connected(&self, router_id: &str) -> bool {
        self.get_connected(router_id).is_some()
    }

    pub fn all(&self) -> Vec<Arc<RouterState>> {
        self.routers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn all_connected(&self) -> Vec<Arc<RouterState>> {
        self.routers
            .iter()
            .filter(|e| e.value().is_connected())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Mark a router connected and attach its control channel.
    ///
    /// Verifies the certificate fingerprint against the enrolled value
    /// when one is recorded.
    pub fn mark_connected(
        &self,
        router_id: &str,
        channel: Arc<dyn ControlChannel>,
        version: String,
        capabilities: Vec<String>,
        fingerprint: Option<&str>,
    ) -> Result<Arc<RouterState>> {
        let state = self.require(router_id)?;
        if let Some(expected) = state.def.read().fingerprint.as_deref() {
            if fingerprint != Some(expected) {
                return Err(Error::Channel(format!(
                    "could not verify fingerprint for router {router_id}"
                )));
            }
        }
        if state.def.read().disabled {
            return Err(Error::Channel(format!("router {router_id} is disabled")));
        }
        *state.channel.write() = Some(channel);
        *state.version.write() = Some(version);
        *state.capabilities.write() = capabilities;
        *state.connect_time.write() = Some(Utc::now());
        state.connected.store(true, Ordering::Release);
        tracing::info!(router_id = %router_id, "router connected");
        Ok(state)
    }

    pub fn mark_disconnected(&self, router_id: &str) {
        if let Some(state) = self.get(router_id) {
            state.connected.store(false, Ordering::Release);
            *state.channel.write() = None;
            state.links.clear();
            tracing::info!(router_id = %router_id, "router disconnected");
        }
    }
}
