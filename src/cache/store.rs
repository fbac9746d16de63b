//! Versioned cache store: one generation per deployed version.
//!
//! Everything here is best-effort from the caller's point of view. Storage
//! failures are logged and turned into misses or skipped writes, except for
//! the eviction operations whose callers need to report success.

use color_eyre::Result;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::key::RequestKey;
use super::storage::CacheStorage;
use super::types::{vary_values, CacheGeneration, CachedEntry, MatchOptions};
use crate::network::{OutboundRequest, Response, Transport};

/// Outcome of a precache run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrecacheSummary {
  pub stored: usize,
  pub failed: usize,
}

/// Handle to a single generation.
#[derive(Clone)]
pub struct GenerationCache {
  storage: Arc<dyn CacheStorage>,
  generation: CacheGeneration,
}

impl GenerationCache {
  /// Store a response for `request`. Returns whether it was stored.
  ///
  /// Writes into a generation that has since been evicted are dropped, so a
  /// superseded worker finishing a fetch late cannot bring it back.
  pub fn put(&self, request: &OutboundRequest, response: &Response) -> bool {
    if !response.is_success() {
      debug!(
        url = %request.url,
        status = response.status,
        "Not caching non-success response"
      );
      return false;
    }

    let key = RequestKey::from_request(request);
    let vary = vary_values(request, response);
    match self
      .storage
      .put_entry(&self.generation, &key, &vary, response)
    {
      Ok(true) => true,
      Ok(false) => {
        debug!(
          url = %request.url,
          generation = %self.generation.name,
          "Generation evicted, not caching"
        );
        false
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache write failed");
        false
      }
    }
  }

  /// Look up a stored response. A miss (or an unreadable store) is `None`.
  pub fn lookup(&self, request: &OutboundRequest, options: MatchOptions) -> Option<CachedEntry> {
    let key = RequestKey::from_request(request);
    let candidates = match self
      .storage
      .find_entries(&self.generation.name, &key, options.ignore_query)
    {
      Ok(candidates) => candidates,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache read failed");
        return None;
      }
    };

    candidates
      .into_iter()
      .find(|entry| options.ignore_vary || entry.vary_matches(request))
  }

  pub fn entry_count(&self) -> usize {
    self
      .storage
      .entry_count(&self.generation.name)
      .unwrap_or_else(|e| {
        warn!(generation = %self.generation.name, error = %e, "Failed to count entries");
        0
      })
  }
}

/// The set of generations sharing one storage backend.
#[derive(Clone)]
pub struct VersionedCacheStore {
  storage: Arc<dyn CacheStorage>,
}

impl VersionedCacheStore {
  pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
    Self { storage }
  }

  /// Open a generation, creating it if absent. Idempotent.
  pub fn open(&self, generation: &CacheGeneration) -> GenerationCache {
    if let Err(e) = self.storage.ensure_generation(generation) {
      warn!(generation = %generation.name, error = %e, "Failed to open generation");
    }
    GenerationCache {
      storage: Arc::clone(&self.storage),
      generation: generation.clone(),
    }
  }

  pub fn list_generations(&self) -> Result<Vec<String>> {
    self.storage.generations()
  }

  pub fn delete(&self, name: &str) -> Result<bool> {
    self.storage.delete_generation(name)
  }

  /// Delete every generation.
  pub fn delete_all(&self) -> Result<()> {
    for name in self.list_generations()? {
      self.delete(&name)?;
    }
    Ok(())
  }

  /// Delete every generation other than `current`. Returns the evicted names.
  pub fn evict_stale(&self, current: &CacheGeneration) -> Result<Vec<String>> {
    let mut evicted = Vec::new();
    for name in self.list_generations()? {
      if name != current.name && self.delete(&name)? {
        info!(generation = %name, "Evicted stale cache generation");
        evicted.push(name);
      }
    }
    Ok(evicted)
  }

  /// Fetch and store each manifest request independently.
  ///
  /// A resource that cannot be fetched or stored is logged and skipped; it
  /// never prevents the others from being cached.
  pub async fn precache(
    &self,
    generation: &CacheGeneration,
    transport: &dyn Transport,
    requests: Vec<OutboundRequest>,
  ) -> PrecacheSummary {
    let cache = self.open(generation);

    let results = join_all(requests.iter().map(|request| {
      let cache = &cache;
      async move {
        match transport.send(request).await {
          Ok(response) if response.is_success() => cache.put(request, &response),
          Ok(response) => {
            debug!(
              url = %request.url,
              status = response.status,
              "Precache resource not available"
            );
            false
          }
          Err(e) => {
            debug!(url = %request.url, error = %e, "Precache fetch failed");
            false
          }
        }
      }
    }))
    .await;

    let stored = results.iter().filter(|ok| **ok).count();
    let summary = PrecacheSummary {
      stored,
      failed: results.len() - stored,
    };
    info!(
      generation = %generation.name,
      stored = summary.stored,
      failed = summary.failed,
      "Pre-cached resources"
    );
    summary
  }

  /// Drop every auxiliary key-value store. Each store is cleared
  /// independently; the first failure is returned after trying all of them.
  pub fn clear_aux_stores(&self) -> Result<()> {
    let mut first_error = None;
    for store in self.storage.aux_stores()? {
      match self.storage.drop_aux_store(&store) {
        Ok(()) => info!(store = %store, "Auxiliary store deleted"),
        Err(e) => {
          warn!(store = %store, error = %e, "Auxiliary store delete failed");
          first_error.get_or_insert(e);
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }
}
