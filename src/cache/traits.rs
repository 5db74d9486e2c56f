//! Core traits and types for the read-through cache.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use url::Url;

/// Identity of an intercepted read: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
  pub method: Method,
  pub url: Url,
}

impl CacheRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Storage key: hex sha256 of `METHOD url`.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response as the cache stores and serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// The network side of the cache.
///
/// `Err` means no response arrived at all; an HTTP error status is still a
/// response.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &CacheRequest) -> impl Future<Output = Result<CachedResponse>> + Send;
}

/// `Fetcher` over a shared reqwest client.
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(CachedResponse {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network unavailable, serving the last cached copy.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn placeholder(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Placeholder,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the network
  Network,
  /// Cache-first hit
  Cache,
  /// Network failed, serving cached data
  Offline,
  /// Network failed and nothing cached
  Placeholder,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Offline => "offline",
      CacheSource::Placeholder => "placeholder",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_depends_on_method_and_url() {
    let url = Url::parse("https://market.example/api/products?page=2").unwrap();
    let get = CacheRequest::get(url.clone());
    let head = CacheRequest::new(Method::HEAD, url);
    let other = CacheRequest::get(Url::parse("https://market.example/api/products").unwrap());

    assert_eq!(get.cache_key().len(), 64);
    assert_eq!(get.cache_key(), get.clone().cache_key());
    assert_ne!(get.cache_key(), head.cache_key());
    assert_ne!(get.cache_key(), other.cache_key());
  }

  #[test]
  fn test_header_lookup_ignores_case() {
    let response = CachedResponse {
      status: 200,
      headers: vec![("content-type".into(), "text/css".into())],
      body: vec![],
    };
    assert_eq!(response.header("Content-Type"), Some("text/css"));
    assert_eq!(response.header("etag"), None);
    assert!(response.is_success());
  }
}
