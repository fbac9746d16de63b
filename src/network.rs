//! Outbound HTTP: request/response snapshots and the transport seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::REFERER;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Why a fetch produced no response.
///
/// Only `Connectivity` is a reachability signal; an HTTP error status is a
/// response, not a failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Connectivity(String),
  #[error("transport error: {0}")]
  Transport(String),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl FetchError {
  pub fn is_connectivity(&self) -> bool {
    matches!(self, FetchError::Connectivity(_))
  }
}

/// A request issued by the hosting application.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  /// Page the request originated from, if any
  pub referrer: Option<String>,
  pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      referrer: None,
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
    self.referrer = Some(referrer.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Set a header, replacing any existing value under the same name.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

/// Snapshot of an HTTP response, as returned to callers and stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// 2xx responses are the only ones worth caching.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Sends requests to the network.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &OutboundRequest) -> Result<Response, FetchError>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(connect_timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = connect_timeout {
      builder = builder.connect_timeout(timeout);
    }
    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &OutboundRequest) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(referrer) = &request.referrer {
      builder = builder.header(REFERER, referrer.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(classify)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| match v.to_str() {
        Ok(v) => Some((k.as_str().to_string(), v.to_string())),
        Err(_) => {
          debug!(url = %request.url, header = %k, "Dropping response header with non-ASCII value");
          None
        }
      })
      .collect();
    let body = response.bytes().await.map_err(classify)?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

fn classify(err: reqwest::Error) -> FetchError {
  if err.is_connect() || err.is_timeout() {
    FetchError::Connectivity(err.to_string())
  } else if err.is_builder() {
    FetchError::InvalidRequest(err.to_string())
  } else {
    FetchError::Transport(err.to_string())
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted in-memory transport for exercising fetch strategies.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  #[derive(Default)]
  pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Result<Response, FetchError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    offline: AtomicBool,
    calls: Mutex<Vec<OutboundRequest>>,
  }

  impl ScriptedTransport {
    pub fn new() -> Self {
      Self::default()
    }

    /// Answer requests for `path` with the given status and body.
    pub fn respond(&self, path: &str, status: u16, body: &str) {
      self.respond_with(path, Response::new(status, body));
    }

    pub fn respond_with(&self, path: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(path.to_string(), Ok(response));
    }

    pub fn fail(&self, path: &str, err: FetchError) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(path.to_string(), Err(err));
    }

    /// Hold answers for `path` back by `delay`.
    pub fn delay(&self, path: &str, delay: Duration) {
      self
        .delays
        .lock()
        .unwrap()
        .insert(path.to_string(), delay);
    }

    /// While offline every request fails with a connectivity error.
    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<OutboundRequest> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
      self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == path)
        .count()
    }
  }

  #[async_trait]
  impl Transport for ScriptedTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<Response, FetchError> {
      self.calls.lock().unwrap().push(request.clone());
      let delay = self.delays.lock().unwrap().get(request.url.path()).copied();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      if self.offline.load(Ordering::SeqCst) {
        return Err(FetchError::Connectivity("scripted offline".to_string()));
      }
      self
        .routes
        .lock()
        .unwrap()
        .get(request.url.path())
        .cloned()
        .unwrap_or_else(|| Ok(Response::new(404, "")))
    }
  }
}
