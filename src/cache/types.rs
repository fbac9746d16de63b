//! Core types for the versioned cache.

use chrono::{DateTime, Utc};

use crate::network::{OutboundRequest, Response};

const GENERATION_PREFIX: &str = "mtc-cache-";

/// The cache store scoped to one deployed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  pub version: String,
  pub name: String,
}

impl CacheGeneration {
  pub fn for_version(version: &str) -> Self {
    Self {
      version: version.to_string(),
      name: format!("{}{}", GENERATION_PREFIX, version),
    }
  }
}

/// Lookup options mirroring the Cache API's `ignoreSearch` / `ignoreVary`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
  pub ignore_query: bool,
  pub ignore_vary: bool,
}

impl MatchOptions {
  /// How the fetch strategies look things up
  pub fn lenient() -> Self {
    Self {
      ignore_query: true,
      ignore_vary: true,
    }
  }
}

/// A stored response together with the request-header values it varies on.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub url: String,
  pub response: Response,
  /// Lowercased header names from the response's `Vary`, with the request values
  pub vary: Vec<(String, Option<String>)>,
  pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
  /// Check the stored vary values against a new request.
  pub fn vary_matches(&self, request: &OutboundRequest) -> bool {
    self.vary.iter().all(|(name, stored)| {
      if name == "*" {
        return false;
      }
      request.header(name) == stored.as_deref()
    })
  }
}

/// Capture the request-header values named by a response's `Vary` header.
pub fn vary_values(
  request: &OutboundRequest,
  response: &Response,
) -> Vec<(String, Option<String>)> {
  let Some(vary) = response.header("vary") else {
    return Vec::new();
  };

  vary
    .split(',')
    .map(|name| name.trim().to_ascii_lowercase())
    .filter(|name| !name.is_empty())
    .map(|name| {
      let value = request.header(&name).map(String::from);
      (name, value)
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request() -> OutboundRequest {
    OutboundRequest::get(Url::parse("https://app.example.com/api/content").unwrap())
  }

  #[test]
  fn test_generation_name_derived_from_version() {
    let generation = CacheGeneration::for_version("1.0.0");
    assert_eq!(generation.name, "mtc-cache-1.0.0");
    assert_eq!(generation.version, "1.0.0");
  }

  #[test]
  fn test_vary_values_captures_named_headers() {
    let req = request().with_header("Accept-Language", "uk");
    let resp = Response::new(200, "").with_header("Vary", "Accept-Language, Accept");

    let vary = vary_values(&req, &resp);
    assert_eq!(
      vary,
      vec![
        ("accept-language".to_string(), Some("uk".to_string())),
        ("accept".to_string(), None),
      ]
    );
  }

  #[test]
  fn test_vary_match() {
    let stored = CachedEntry {
      url: "https://app.example.com/api/content".to_string(),
      response: Response::new(200, ""),
      vary: vec![("accept-language".to_string(), Some("uk".to_string()))],
      cached_at: Utc::now(),
    };

    assert!(stored.vary_matches(&request().with_header("accept-language", "uk")));
    assert!(!stored.vary_matches(&request().with_header("accept-language", "en")));
    assert!(!stored.vary_matches(&request()));
  }

  #[test]
  fn test_vary_star_never_matches() {
    let stored = CachedEntry {
      url: String::new(),
      response: Response::new(200, ""),
      vary: vec![("*".to_string(), None)],
      cached_at: Utc::now(),
    };
    assert!(!stored.vary_matches(&request()));
  }
}
