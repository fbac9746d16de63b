//! Intercepts outbound requests and dispatches them to a fetch strategy.

use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::network::{OutboundRequest, Transport};
use crate::status::OnlineStatusTracker;
use crate::strategy::{self, Fetched, RequestClass, Strategy, StrategyEngine};

/// Session header carried on every intercepted request.
#[derive(Debug, Clone)]
pub struct SessionTag {
  pub name: String,
  pub value: String,
}

impl SessionTag {
  pub fn apply(&self, request: OutboundRequest) -> OutboundRequest {
    request.with_header(&self.name, &self.value)
  }
}

/// What the router did with a request.
#[derive(Debug)]
pub enum Routed {
  /// Different origin: not intercepted, returned untouched
  Bypass(OutboundRequest),
  Handled { strategy: Strategy, fetched: Fetched },
}

#[derive(Clone)]
pub struct RequestRouter {
  origin: Url,
  session: SessionTag,
  privileged_paths: Vec<String>,
  engine: StrategyEngine,
  status: Arc<OnlineStatusTracker>,
  transport: Arc<dyn Transport>,
  health_url: Url,
}

impl RequestRouter {
  pub fn new(
    origin: Url,
    session: SessionTag,
    privileged_paths: Vec<String>,
    engine: StrategyEngine,
    status: Arc<OnlineStatusTracker>,
    transport: Arc<dyn Transport>,
    health_url: Url,
  ) -> Self {
    Self {
      origin,
      session,
      privileged_paths,
      engine,
      status,
      transport,
      health_url,
    }
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// The tagged, bodiless request used for reachability checks.
  pub fn health_probe(&self) -> OutboundRequest {
    self.session.apply(OutboundRequest::get(self.health_url.clone()))
  }

  /// classify → tag → select → execute
  pub async fn route(&self, request: OutboundRequest) -> Routed {
    if !self.is_same_origin(&request.url) {
      debug!(url = %request.url, "Cross-origin request, not intercepting");
      return Routed::Bypass(request);
    }

    let class = RequestClass::classify(&request, &self.privileged_paths);
    let request = self.session.apply(request);

    let is_online = self.status.is_online();
    let strategy = strategy::select(class, is_online);
    if strategy == Strategy::CacheFirst {
      // Let the status heal in the background; the response does not wait on it.
      self
        .status
        .spawn_refresh(Arc::clone(&self.transport), self.health_probe());
    }

    debug!(
      method = %request.method,
      url = %request.url,
      ?strategy,
      "Routing request"
    );
    let fetched = self.engine.execute(strategy, &request).await;
    Routed::Handled { strategy, fetched }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheGeneration, GenerationCache, MatchOptions, SqliteStorage, VersionedCacheStore};
  use crate::network::testing::ScriptedTransport;
  use crate::network::Response;
  use crate::strategy::ResponseSource;
  use reqwest::Method;
  use std::time::Duration;

  const SESSION: &str = "8c4e1c1a-5d2e-4bb8-9a57-6a3b1f3f0d11";

  struct Fixture {
    transport: Arc<ScriptedTransport>,
    status: Arc<OnlineStatusTracker>,
    cache: GenerationCache,
    router: RequestRouter,
  }

  fn fixture() -> Fixture {
    let origin = Url::parse("https://app.example.com").unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let status = Arc::new(OnlineStatusTracker::new(Duration::from_secs(10)));
    let store = VersionedCacheStore::new(Arc::new(SqliteStorage::open_in_memory().unwrap()));
    let cache = store.open(&CacheGeneration::for_version("1.0.0"));
    let engine = StrategyEngine::new(transport.clone(), status.clone(), cache.clone());
    let router = RequestRouter::new(
      origin.clone(),
      SessionTag {
        name: "session".to_string(),
        value: SESSION.to_string(),
      },
      vec!["/administrator/".to_string(), "/editor/".to_string()],
      engine,
      status.clone(),
      transport.clone(),
      origin.join("/api/health").unwrap(),
    );
    Fixture {
      transport,
      status,
      cache,
      router,
    }
  }

  fn request(method: Method, url: &str) -> OutboundRequest {
    OutboundRequest::new(method, Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_cross_origin_bypassed_untouched() {
    let f = fixture();
    let routed = f
      .router
      .route(request(Method::GET, "https://cdn.example.org/lib.js"))
      .await;

    match routed {
      Routed::Bypass(req) => assert!(req.header("session").is_none()),
      other => panic!("expected bypass, got {other:?}"),
    }
    assert_eq!(f.transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_session_header_injected() {
    let f = fixture();
    f.status.mark_online();
    f.transport.respond("/api/content", 200, "ok");

    f.router
      .route(request(Method::GET, "https://app.example.com/api/content"))
      .await;

    let calls = f.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].header("session"), Some(SESSION));
  }

  #[tokio::test]
  async fn test_post_while_offline_is_network_only() {
    let f = fixture();
    f.transport.respond("/api/content", 201, "created");
    let req = request(Method::POST, "https://app.example.com/api/content").with_body("{}");

    let routed = f.router.route(req).await;
    let Routed::Handled { strategy, fetched } = routed else {
      panic!("expected handled");
    };
    assert_eq!(strategy, Strategy::NetworkOnly);
    assert_eq!(fetched.source, ResponseSource::Network);
    assert_eq!(f.cache.entry_count(), 0);
    // No health probe is spawned for network-only requests
    assert_eq!(f.transport.calls_to("/api/health"), 0);
  }

  #[tokio::test]
  async fn test_privileged_referrer_is_network_only() {
    let f = fixture();
    f.transport.respond("/api/users", 200, "[]");
    let req = request(Method::GET, "https://app.example.com/api/users")
      .with_referrer("https://app.example.com/editor/page/1");

    let Routed::Handled { strategy, .. } = f.router.route(req).await else {
      panic!("expected handled");
    };
    assert_eq!(strategy, Strategy::NetworkOnly);
    assert_eq!(f.cache.entry_count(), 0);
  }

  #[tokio::test]
  async fn test_online_get_is_network_first() {
    let f = fixture();
    f.status.mark_online();
    f.transport.respond("/api/content", 200, "fresh");
    let req = request(Method::GET, "https://app.example.com/api/content");

    let Routed::Handled { strategy, fetched } = f.router.route(req.clone()).await else {
      panic!("expected handled");
    };
    assert_eq!(strategy, Strategy::NetworkFirstRevalidate);
    assert_eq!(fetched.response.unwrap().body, b"fresh");
    assert!(f.cache.lookup(&req, MatchOptions::default()).is_some());
  }

  #[tokio::test]
  async fn test_offline_hit_served_from_cache_and_probe_spawned() {
    let f = fixture();
    let req = request(Method::GET, "https://app.example.com/index.html");
    f.cache.put(&req, &Response::new(200, "<html>"));
    f.transport.respond("/api/health", 200, "ok");

    let Routed::Handled { strategy, fetched } = f.router.route(req).await else {
      panic!("expected handled");
    };
    assert_eq!(strategy, Strategy::CacheFirst);
    assert_eq!(fetched.source, ResponseSource::Cache);
    assert_eq!(f.transport.calls_to("/index.html"), 0);

    // The background probe heals the status for later requests
    for _ in 0..50 {
      if f.status.is_online() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(f.status.is_online());
    assert_eq!(f.transport.calls_to("/api/health"), 1);
    let probe = &f.transport.calls()[0];
    assert_eq!(probe.header("session"), Some(SESSION));
  }

  #[tokio::test]
  async fn test_offline_miss_falls_through_to_network() {
    let f = fixture();
    f.transport.respond("/api/content", 200, "fresh");

    let Routed::Handled { strategy, fetched } = f
      .router
      .route(request(Method::GET, "https://app.example.com/api/content"))
      .await
    else {
      panic!("expected handled");
    };
    assert_eq!(strategy, Strategy::CacheFirst);
    assert_eq!(fetched.source, ResponseSource::Network);
    assert_eq!(f.transport.calls_to("/api/content"), 1);
  }
}
