//! Worker lifecycle: Installing → Waiting → Active → Superseded.
//!
//! A [`Worker`] is one deployed version of the proxy. The [`Registration`]
//! holds the active and waiting workers and the open clients, and performs
//! the hand-over between versions.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheGeneration, PrecacheSummary, VersionedCacheStore};
use crate::config::Config;
use crate::network::{OutboundRequest, Transport};
use crate::router::{RequestRouter, Routed};
use crate::status::OnlineStatusTracker;
use crate::strategy::StrategyEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Precaching the manifest; not serving traffic yet
  Installing,
  /// Installed, waiting for the previous version to hand over
  Waiting,
  Active,
  /// A newer version became active
  Superseded,
  /// Install failed or a newer install replaced this one while waiting
  Redundant,
}

/// One deployed version of the proxy.
pub struct Worker {
  config: Arc<Config>,
  generation: CacheGeneration,
  store: VersionedCacheStore,
  transport: Arc<dyn Transport>,
  router: RequestRouter,
  state: Mutex<LifecycleState>,
}

impl Worker {
  pub fn new(
    config: Arc<Config>,
    store: VersionedCacheStore,
    transport: Arc<dyn Transport>,
    status: Arc<OnlineStatusTracker>,
  ) -> Result<Self> {
    let generation = CacheGeneration::for_version(&config.cache_version);
    let engine = StrategyEngine::new(
      Arc::clone(&transport),
      Arc::clone(&status),
      store.open(&generation),
    );
    let router = RequestRouter::new(
      config.origin.clone(),
      config.session_tag(),
      config.privileged_paths.clone(),
      engine,
      status,
      Arc::clone(&transport),
      config.health_url()?,
    );

    Ok(Self {
      config,
      generation,
      store,
      transport,
      router,
      state: Mutex::new(LifecycleState::Installing),
    })
  }

  pub fn version(&self) -> &str {
    &self.generation.version
  }

  pub fn generation(&self) -> &CacheGeneration {
    &self.generation
  }

  pub fn store(&self) -> &VersionedCacheStore {
    &self.store
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if *current != state {
      info!(version = %self.version(), from = ?*current, to = ?state, "Lifecycle transition");
      *current = state;
    }
  }

  /// Tagged requests for every manifest entry. Entries that do not resolve
  /// against the origin are logged and skipped.
  fn manifest_requests(&self) -> Vec<OutboundRequest> {
    let session = self.config.session_tag();
    self
      .config
      .precache_manifest
      .iter()
      .filter_map(|path| match self.config.resolve(path) {
        Ok(url) => Some(OutboundRequest::get(url)),
        Err(e) => {
          warn!(path = %path, error = %e, "Skipping manifest entry");
          None
        }
      })
      .map(|request| session.apply(request))
      .collect()
  }

  /// Fetch and store the manifest into this worker's generation.
  pub async fn precache(&self) -> PrecacheSummary {
    self
      .store
      .precache(
        &self.generation,
        self.transport.as_ref(),
        self.manifest_requests(),
      )
      .await
  }

  /// Installing → Waiting.
  pub async fn install(&self) -> Result<PrecacheSummary> {
    if self.state() != LifecycleState::Installing {
      return Err(eyre!(
        "Worker {} cannot install from state {:?}",
        self.version(),
        self.state()
      ));
    }
    let summary = self.precache().await;
    self.set_state(LifecycleState::Waiting);
    Ok(summary)
  }

  /// Evict every other generation, then re-populate this one.
  async fn activate(&self) -> Result<Vec<String>> {
    let evicted = self.store.evict_stale(&self.generation)?;
    self.precache().await;
    Ok(evicted)
  }

  /// Delete every generation, re-precache, and drop auxiliary stores.
  pub async fn clear_cache(&self) -> Result<()> {
    self.store.delete_all()?;
    self.precache().await;
    self.store.clear_aux_stores()?;
    info!(version = %self.version(), "Cache cleared");
    Ok(())
  }

  pub async fn fetch(&self, request: OutboundRequest) -> Routed {
    self.router.route(request).await
  }
}

pub type ClientId = u64;

#[derive(Default)]
struct Slots {
  active: Option<Arc<Worker>>,
  waiting: Option<Arc<Worker>>,
  /// Open clients and the version currently serving each
  clients: BTreeMap<ClientId, Option<String>>,
  next_client: ClientId,
}

/// Holds the active and waiting workers for one origin.
///
/// `slots` is only held for bookkeeping. Eviction and precache on activation
/// run after it is released, serialized by `activation`.
pub struct Registration {
  slots: AsyncMutex<Slots>,
  activation: AsyncMutex<()>,
  auto_activate: bool,
}

impl Registration {
  pub fn new(auto_activate: bool) -> Self {
    Self {
      slots: AsyncMutex::new(Slots::default()),
      activation: AsyncMutex::new(()),
      auto_activate,
    }
  }

  /// Install a worker. Without an active worker it activates immediately;
  /// otherwise it waits unless auto-activation is enabled.
  pub async fn register(&self, worker: Arc<Worker>) -> Result<LifecycleState> {
    if let Err(e) = worker.install().await {
      worker.set_state(LifecycleState::Redundant);
      return Err(e);
    }

    let promoted = {
      let mut slots = self.slots.lock().await;
      if slots.active.is_none() {
        Self::promote(&mut slots, worker.clone());
        Some(worker.clone())
      } else {
        if let Some(replaced) = slots.waiting.replace(worker.clone()) {
          replaced.set_state(LifecycleState::Redundant);
        }
        info!(version = %worker.version(), "New version installed and waiting");
        if self.auto_activate {
          Self::promote_waiting(&mut slots)
        } else {
          None
        }
      }
    };

    if let Some(promoted) = promoted {
      self.finish_activation(&promoted).await?;
    }
    Ok(worker.state())
  }

  /// Reuse an already-populated generation without precaching again,
  /// falling back to a full `register` when it is missing or empty.
  pub async fn resume(&self, worker: Arc<Worker>) -> Result<LifecycleState> {
    if worker.store().open(worker.generation()).entry_count() == 0 {
      return self.register(worker).await;
    }

    let mut slots = self.slots.lock().await;
    if slots.active.is_some() {
      drop(slots);
      return self.register(worker).await;
    }
    worker.set_state(LifecycleState::Active);
    Self::claim_clients(&mut slots, &worker);
    slots.active = Some(worker.clone());
    Ok(worker.state())
  }

  /// Promote the waiting worker without waiting for clients to release.
  /// Returns false when nothing was waiting.
  pub async fn skip_waiting(&self) -> Result<bool> {
    let promoted = Self::promote_waiting(&mut *self.slots.lock().await);
    match promoted {
      Some(worker) => {
        self.finish_activation(&worker).await?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  fn promote_waiting(slots: &mut Slots) -> Option<Arc<Worker>> {
    let worker = slots.waiting.take()?;
    Self::promote(slots, worker.clone());
    Some(worker)
  }

  /// Swap the active worker and hand it the open clients.
  fn promote(slots: &mut Slots, worker: Arc<Worker>) {
    if let Some(previous) = slots.active.replace(worker.clone()) {
      previous.set_state(LifecycleState::Superseded);
    }
    worker.set_state(LifecycleState::Active);
    Self::claim_clients(slots, &worker);
  }

  /// Evict stale generations and re-precache, without holding `slots`.
  async fn finish_activation(&self, worker: &Worker) -> Result<()> {
    let _serial = self.activation.lock().await;
    if worker.state() != LifecycleState::Active {
      debug!(version = %worker.version(), "Superseded before activation finished");
      return Ok(());
    }
    let evicted = worker.activate().await?;
    info!(
      version = %worker.version(),
      evicted = evicted.len(),
      "Worker activated"
    );
    Ok(())
  }

  fn claim_clients(slots: &mut Slots, worker: &Worker) {
    for controller in slots.clients.values_mut() {
      *controller = Some(worker.version().to_string());
    }
  }

  pub async fn active(&self) -> Option<Arc<Worker>> {
    self.slots.lock().await.active.clone()
  }

  pub async fn waiting(&self) -> Option<Arc<Worker>> {
    self.slots.lock().await.waiting.clone()
  }

  /// Open a client; it is served by the active worker, if any.
  pub async fn open_client(&self) -> ClientId {
    let mut slots = self.slots.lock().await;
    let id = slots.next_client;
    slots.next_client += 1;
    let controller = slots.active.as_ref().map(|w| w.version().to_string());
    slots.clients.insert(id, controller);
    id
  }

  pub async fn close_client(&self, id: ClientId) {
    self.slots.lock().await.clients.remove(&id);
  }

  pub async fn controller_of(&self, id: ClientId) -> Option<String> {
    self.slots.lock().await.clients.get(&id).cloned().flatten()
  }

  /// Route a request through the active worker. Without one, nothing is
  /// intercepted.
  pub async fn fetch(&self, request: OutboundRequest) -> Routed {
    // Do not hold the registration lock across the fetch.
    let active = self.active().await;
    match active {
      Some(worker) => worker.fetch(request).await,
      None => Routed::Bypass(request),
    }
  }
}
