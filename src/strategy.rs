//! Fetch strategies and the pure selection rule that picks one.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{GenerationCache, MatchOptions};
use crate::network::{OutboundRequest, Response, Transport};
use crate::status::OnlineStatusTracker;
use reqwest::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Always hit the network; never read or write the cache
  NetworkOnly,
  /// Network first, store the result, fall back to the cache when unreachable
  NetworkFirstRevalidate,
  /// Serve from the cache; on a miss behave like `NetworkFirstRevalidate`
  CacheFirst,
}

/// Derived classification of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestClass {
  pub is_mutating: bool,
  pub is_privileged: bool,
}

impl RequestClass {
  /// Non-GET methods are mutating; a referrer under any privileged path
  /// marks the request privileged.
  pub fn classify(request: &OutboundRequest, privileged_paths: &[String]) -> Self {
    let is_privileged = request
      .referrer
      .as_deref()
      .map(|referrer| privileged_paths.iter().any(|p| referrer.contains(p.as_str())))
      .unwrap_or(false);

    Self {
      is_mutating: request.method != Method::GET,
      is_privileged,
    }
  }
}

/// Choose a strategy before any I/O. Never re-evaluated mid-flight.
pub fn select(class: RequestClass, is_online: bool) -> Strategy {
  if class.is_mutating || class.is_privileged {
    Strategy::NetworkOnly
  } else if is_online {
    Strategy::NetworkFirstRevalidate
  } else {
    Strategy::CacheFirst
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Nothing usable was available
  Unavailable,
}

/// Result of executing a strategy.
#[derive(Debug, Clone)]
pub struct Fetched {
  pub response: Option<Response>,
  pub source: ResponseSource,
}

impl Fetched {
  fn network(response: Response) -> Self {
    Self {
      response: Some(response),
      source: ResponseSource::Network,
    }
  }

  fn cache(response: Response) -> Self {
    Self {
      response: Some(response),
      source: ResponseSource::Cache,
    }
  }

  fn unavailable() -> Self {
    Self {
      response: None,
      source: ResponseSource::Unavailable,
    }
  }
}

/// Executes strategies against the network and the current generation.
#[derive(Clone)]
pub struct StrategyEngine {
  transport: Arc<dyn Transport>,
  status: Arc<OnlineStatusTracker>,
  cache: GenerationCache,
}

impl StrategyEngine {
  pub fn new(
    transport: Arc<dyn Transport>,
    status: Arc<OnlineStatusTracker>,
    cache: GenerationCache,
  ) -> Self {
    Self {
      transport,
      status,
      cache,
    }
  }

  pub async fn execute(&self, strategy: Strategy, request: &OutboundRequest) -> Fetched {
    match strategy {
      Strategy::NetworkOnly => self.network_only(request).await,
      Strategy::NetworkFirstRevalidate => self.network_first(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
    }
  }

  async fn network_only(&self, request: &OutboundRequest) -> Fetched {
    match self.transport.send(request).await {
      Ok(response) => {
        self.status.mark_online();
        Fetched::network(response)
      }
      Err(e) => {
        if e.is_connectivity() {
          self.status.mark_offline();
        }
        debug!(url = %request.url, error = %e, "Network-only fetch failed");
        Fetched::unavailable()
      }
    }
  }

  async fn network_first(&self, request: &OutboundRequest) -> Fetched {
    match self.transport.send(request).await {
      Ok(response) => {
        self.cache.put(request, &response);
        self.status.mark_online();
        Fetched::network(response)
      }
      Err(e) if e.is_connectivity() => {
        self.status.mark_offline();
        debug!(url = %request.url, error = %e, "Network unreachable, falling back to cache");
        self.from_cache(request).unwrap_or_else(Fetched::unavailable)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Fetch failed");
        Fetched::unavailable()
      }
    }
  }

  async fn cache_first(&self, request: &OutboundRequest) -> Fetched {
    if let Some(hit) = self.from_cache(request) {
      return hit;
    }
    self.network_first(request).await
  }

  fn from_cache(&self, request: &OutboundRequest) -> Option<Fetched> {
    self
      .cache
      .lookup(request, MatchOptions::lenient())
      .map(|entry| {
        debug!(url = %entry.url, cached_at = %entry.cached_at, "Serving from cache");
        Fetched::cache(entry.response)
      })
  }
}
