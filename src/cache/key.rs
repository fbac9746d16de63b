//! Normalized request identity used as the cache key.

use sha2::{Digest, Sha256};

use crate::network::OutboundRequest;

/// Method + URL, with the fragment dropped. `base_url` additionally drops the
/// query string so lookups can ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
  pub base_url: String,
}

impl RequestKey {
  pub fn from_request(request: &OutboundRequest) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    let mut base = url.clone();
    base.set_query(None);

    Self {
      method: request.method.as_str().to_ascii_uppercase(),
      url: url.to_string(),
      base_url: base.to_string(),
    }
  }

  pub fn hash(&self) -> String {
    digest(&self.method, &self.url)
  }

  pub fn base_hash(&self) -> String {
    digest(&self.method, &self.base_url)
  }
}

// SHA256 for stable, fixed-length keys
fn digest(method: &str, url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}
