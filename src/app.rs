use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::{CacheGeneration, SqliteStorage, VersionedCacheStore};
use crate::config::Config;
use crate::control::{self, ControlHandle};
use crate::lifecycle::{LifecycleState, Registration, Worker};
use crate::network::{HttpTransport, OutboundRequest, Transport};
use crate::router::Routed;
use crate::status::{OnlineStatusTracker, ProbeOutcome};
use crate::strategy::ResponseSource;

/// A request as given on the command line
#[derive(Debug, Clone)]
pub struct FetchArgs {
  pub url: String,
  pub method: String,
  pub referrer: Option<String>,
  pub headers: Vec<String>,
  pub data: Option<String>,
}

/// Wires the proxy together for one process run.
pub struct App {
  config: Arc<Config>,
  store: VersionedCacheStore,
  transport: Arc<dyn Transport>,
  status: Arc<OnlineStatusTracker>,
  registration: Arc<Registration>,
  control: ControlHandle,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let storage = SqliteStorage::open(&config.database_path()?)?;
    let store = VersionedCacheStore::new(Arc::new(storage));
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.connect_timeout())?);
    let status = Arc::new(OnlineStatusTracker::new(config.online_timeout()));
    let registration = Arc::new(Registration::new(config.auto_activate));
    let control = control::spawn(Arc::clone(&registration));

    Ok(Self {
      config: Arc::new(config),
      store,
      transport,
      status,
      registration,
      control,
    })
  }

  fn worker(&self) -> Result<Arc<Worker>> {
    Ok(Arc::new(Worker::new(
      Arc::clone(&self.config),
      self.store.clone(),
      Arc::clone(&self.transport),
      Arc::clone(&self.status),
    )?))
  }

  /// Install the configured version and activate it if nothing else is active.
  pub async fn install(&self) -> Result<()> {
    let state = self.registration.register(self.worker()?).await?;
    println!("{} {:?}", self.config.cache_version, state);
    self.print_generations()
  }

  /// Bring the configured version up, installing only when its generation is missing.
  async fn resume(&self) -> Result<()> {
    let state = self.registration.resume(self.worker()?).await?;
    if state != LifecycleState::Active {
      return Err(eyre!("Version {} is not active ({:?})", self.config.cache_version, state));
    }
    Ok(())
  }

  pub async fn fetch(&self, args: FetchArgs) -> Result<()> {
    self.resume().await?;
    let request = self.build_request(args)?;

    let client = self.registration.open_client().await;
    let controller = self.registration.controller_of(client).await;
    debug!(client, ?controller, "Client opened");

    let routed = self.registration.fetch(request).await;
    self.registration.close_client(client).await;

    let (label, response) = match routed {
      Routed::Bypass(request) => {
        let response = self
          .transport
          .send(&request)
          .await
          .map_err(|e| eyre!("Request failed: {}", e))?;
        ("bypass".to_string(), Some(response))
      }
      Routed::Handled { strategy, fetched } => {
        let source = match fetched.source {
          ResponseSource::Network => "network",
          ResponseSource::Cache => "cache",
          ResponseSource::Unavailable => "unavailable",
        };
        (format!("{:?} ({})", strategy, source), fetched.response)
      }
    };

    let response =
      response.ok_or_else(|| eyre!("No response available from network or cache ({})", label))?;
    println!("{} {}", response.status, label);
    for (name, value) in &response.headers {
      println!("{}: {}", name, value);
    }
    println!();
    println!("{}", String::from_utf8_lossy(&response.body));
    Ok(())
  }

  fn build_request(&self, args: FetchArgs) -> Result<OutboundRequest> {
    let url = if args.url.starts_with('/') {
      self.config.resolve(&args.url)?
    } else {
      Url::parse(&args.url).map_err(|e| eyre!("Invalid URL '{}': {}", args.url, e))?
    };
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", args.method, e))?;

    let mut request = OutboundRequest::new(method, url);
    for header in &args.headers {
      let (name, value) = header
        .split_once(':')
        .ok_or_else(|| eyre!("Header must look like 'Name: value', got '{}'", header))?;
      request = request.with_header(name.trim(), value.trim());
    }
    if let Some(referrer) = args.referrer {
      request = request.with_referrer(referrer);
    }
    if let Some(data) = args.data {
      request = request.with_body(data);
    }
    Ok(request)
  }

  pub async fn control(&self, raw: &str) -> Result<()> {
    self.resume().await?;
    let reply = self.control.dispatch_json(raw).await;
    println!(
      "{}",
      serde_json::to_string(&reply).map_err(|e| eyre!("Failed to encode reply: {}", e))?
    );
    Ok(())
  }

  pub async fn version(&self) -> Result<()> {
    self.resume().await?;
    println!("{}", self.control.query_version().await?);
    Ok(())
  }

  pub async fn clear_cache(&self) -> Result<()> {
    self.resume().await?;
    if !self.control.clear_cache().await? {
      return Err(eyre!("Clearing the cache failed"));
    }
    println!("Cache cleared");
    self.print_generations()
  }

  pub async fn activate(&self) -> Result<()> {
    self.resume().await?;
    if self.control.activate().await? {
      println!("Waiting version activated");
    } else {
      println!("No version waiting");
    }
    Ok(())
  }

  pub fn generations(&self) -> Result<()> {
    self.print_generations()
  }

  fn print_generations(&self) -> Result<()> {
    let current = CacheGeneration::for_version(&self.config.cache_version);
    for name in self.store.list_generations()? {
      let marker = if name == current.name { "*" } else { " " };
      let count = self.store.storage().entry_count(&name)?;
      println!("{} {} ({} entries)", marker, name, count);
    }
    Ok(())
  }

  /// Probe the health endpoint once and print the resulting status.
  pub async fn status(&self) -> Result<()> {
    let probe = self
      .config
      .session_tag()
      .apply(OutboundRequest::get(self.config.health_url()?));
    let outcome = self
      .status
      .refresh_if_stale(self.transport.as_ref(), &probe)
      .await;
    let label = match outcome {
      ProbeOutcome::Online => "online",
      ProbeOutcome::Offline => "offline",
      ProbeOutcome::Inconclusive => "unknown (probe failed)",
      ProbeOutcome::Skipped if self.status.is_online() => "online",
      ProbeOutcome::Skipped => "offline",
    };

    let snapshot = self.status.snapshot();
    match snapshot.last_checked_at() {
      Some(at) if snapshot.last_checked_ms > 0 => {
        let freshness = if self.status.is_stale() { "stale" } else { "fresh" };
        println!("{} (checked {}, {})", label, at.to_rfc3339(), freshness);
      }
      _ => println!("{}", label),
    }
    Ok(())
  }
}
