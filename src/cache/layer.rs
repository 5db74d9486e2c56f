//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::routes::{RequestClass, RoutePolicy};
use super::storage::{CacheStorage, CachedEntry};
use super::traits::{CacheRequest, CacheResult, CachedResponse, Fetcher};

/// Concurrent fetches during precache
const PRECACHE_CONCURRENCY: usize = 4;

/// The pair of cache names belonging to one deployed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  version: String,
}

impl CacheGeneration {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn static_name(&self) -> String {
    format!("static-{}", self.version)
  }

  pub fn dynamic_name(&self) -> String {
    format!("dynamic-{}", self.version)
  }

  fn owns(&self, cache_name: &str) -> bool {
    cache_name == self.static_name() || cache_name == self.dynamic_name()
  }
}

/// Read-through cache: decides per request whether to answer from storage
/// or the network, and keeps storage current.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  routes: Arc<RoutePolicy>,
  generation: CacheGeneration,
  placeholder: Arc<CachedResponse>,
}

impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  pub fn new(storage: S, fetcher: F, routes: RoutePolicy, version: &str) -> Self {
    Self {
      storage: Arc::new(storage),
      fetcher: Arc::new(fetcher),
      routes: Arc::new(routes),
      generation: CacheGeneration::new(version),
      placeholder: Arc::new(offline_placeholder("offline")),
    }
  }

  /// Body of the 503 answered when nothing else is available.
  pub fn with_placeholder(mut self, body: &str) -> Self {
    self.placeholder = Arc::new(offline_placeholder(body));
    self
  }

  pub fn generation(&self) -> &CacheGeneration {
    &self.generation
  }

  pub async fn handle(&self, request: &CacheRequest) -> Result<CacheResult<CachedResponse>> {
    match self.routes.classify(request) {
      RequestClass::StaticAsset => self.cache_first(request).await,
      RequestClass::DynamicRead => self.network_first(request).await,
      RequestClass::Other => self.network_or_placeholder(request).await,
    }
  }

  /// Serve the stored copy if present, else fetch and store.
  async fn cache_first(&self, request: &CacheRequest) -> Result<CacheResult<CachedResponse>> {
    let name = self.generation.static_name();
    if let Some(entry) = self.lookup(&name, request) {
      return Ok(CacheResult::from_cache(entry.response, entry.fetched_at));
    }

    let response = self.fetcher.fetch(request).await?;
    self.store(&name, request, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Try the network, refreshing storage on success, and fall back to the
  /// last stored copy. A total miss is an error.
  async fn network_first(&self, request: &CacheRequest) -> Result<CacheResult<CachedResponse>> {
    let name = self.generation.dynamic_name();
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(&name, request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(&name, request) {
        Some(entry) => {
          debug!(url = %request.url, error = %e, "network failed, serving cached copy");
          Ok(CacheResult::offline(entry.response, entry.fetched_at))
        }
        None => Err(e.wrap_err(format!("No cached copy of {}", request.url))),
      },
    }
  }

  async fn network_or_placeholder(
    &self,
    request: &CacheRequest,
  ) -> Result<CacheResult<CachedResponse>> {
    if !request.is_get() {
      return match self.fetcher.fetch(request).await {
        Ok(response) => Ok(CacheResult::from_network(response)),
        Err(e) => {
          debug!(url = %request.url, method = %request.method, error = %e, "network failed");
          Ok(CacheResult::placeholder(self.placeholder.as_ref().clone()))
        }
      };
    }

    match self.network_first(request).await {
      Ok(result) => Ok(result),
      Err(e) => {
        debug!(url = %request.url, error = %e, "serving offline placeholder");
        Ok(CacheResult::placeholder(self.placeholder.as_ref().clone()))
      }
    }
  }

  /// Switch to `version` and purge every other generation.
  /// Returns the names of the purged caches.
  pub fn activate(&mut self, version: &str) -> Result<Vec<String>> {
    self.generation = CacheGeneration::new(version);

    let mut purged = Vec::new();
    for name in self.storage.cache_names()? {
      if self.generation.owns(&name) {
        continue;
      }
      let removed = self.storage.delete_cache(&name)?;
      info!(cache = %name, entries = removed, "purged superseded cache");
      purged.push(name);
    }
    Ok(purged)
  }

  /// Fetch `requests` into the static generation. Returns how many were
  /// stored; failures are logged and skipped.
  pub async fn precache(&self, requests: Vec<CacheRequest>) -> usize {
    let name = self.generation.static_name();
    let fetched: Vec<_> = stream::iter(requests)
      .map(|request| async move {
        let result = self.fetcher.fetch(&request).await;
        (request, result)
      })
      .buffer_unordered(PRECACHE_CONCURRENCY)
      .collect()
      .await;

    let mut stored = 0;
    for (request, result) in fetched {
      match result {
        Ok(response) if response.is_success() => {
          if self.store(&name, &request, &response) {
            stored += 1;
          }
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "precache skipped non-success response")
        }
        Err(e) => warn!(url = %request.url, error = %e, "precache fetch failed"),
      }
    }
    stored
  }

  /// Storage trouble degrades to a miss.
  fn lookup(&self, cache_name: &str, request: &CacheRequest) -> Option<CachedEntry> {
    match self.storage.get(cache_name, request) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(cache = cache_name, url = %request.url, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Store 2xx GET responses only. Returns whether anything was written.
  fn store(&self, cache_name: &str, request: &CacheRequest, response: &CachedResponse) -> bool {
    if !request.is_get() || !response.is_success() {
      return false;
    }
    match self.storage.put(cache_name, request, response) {
      Ok(()) => true,
      Err(e) => {
        warn!(cache = cache_name, url = %request.url, error = %e, "cache write failed");
        false
      }
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      routes: Arc::clone(&self.routes),
      generation: self.generation.clone(),
      placeholder: Arc::clone(&self.placeholder),
    }
  }
}

fn offline_placeholder(body: &str) -> CachedResponse {
  CachedResponse {
    status: 503,
    headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
    body: body.as_bytes().to_vec(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::testing::{ok, url, MockFetcher};
  use crate::cache::traits::CacheSource;
  use reqwest::Method;

  /// Layer plus a second handle on its fetcher and storage.
  struct Harness {
    _dir: tempfile::TempDir,
    layer: CacheLayer<SqliteStorage, MockFetcher>,
  }

  impl Harness {
    fn new() -> Self {
      let dir = tempfile::tempdir().unwrap();
      let storage = SqliteStorage::open(&dir.path().join("cache.db")).unwrap();
      let layer = CacheLayer::new(storage, MockFetcher::default(), RoutePolicy::default(), "v1")
        .with_placeholder("You are offline");
      Self { _dir: dir, layer }
    }

    fn network(&self) -> &MockFetcher {
      &self.layer.fetcher
    }

    fn storage(&self) -> &SqliteStorage {
      &self.layer.storage
    }
  }

  #[tokio::test]
  async fn test_cache_first_serves_static_bytes_offline_without_network() {
    let h = Harness::new();
    h.network().serve("/static/app.js", ok("console.log(1)"));

    let first = h.layer.handle(&CacheRequest::get(url("/static/app.js"))).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(h.network().calls(), 1);

    h.network().set_offline(true);
    let second = h.layer.handle(&CacheRequest::get(url("/static/app.js"))).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.body, b"console.log(1)");
    assert!(second.cached_at.is_some());
    // Zero network attempts for the cached asset
    assert_eq!(h.network().calls(), 1);
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cached_payload() {
    let h = Harness::new();
    h.network().serve("/api/products", ok(r#"[{"id":"P1"}]"#));
    let request = CacheRequest::get(url("/api/products"));

    let online = h.layer.handle(&request).await.unwrap();
    assert_eq!(online.source, CacheSource::Network);

    // A newer payload replaces the stored copy
    h.network().serve("/api/products", ok(r#"[{"id":"P1"},{"id":"P2"}]"#));
    h.layer.handle(&request).await.unwrap();

    h.network().set_offline(true);
    let offline = h.layer.handle(&request).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.body, br#"[{"id":"P1"},{"id":"P2"}]"#);
  }

  #[tokio::test]
  async fn test_dynamic_read_total_miss_is_an_error() {
    let h = Harness::new();
    h.network().set_offline(true);
    assert!(h.layer.handle(&CacheRequest::get(url("/api/farmers/F1"))).await.is_err());
  }

  #[tokio::test]
  async fn test_other_requests_get_placeholder_on_total_miss() {
    let h = Harness::new();
    h.network().set_offline(true);

    let page = h.layer.handle(&CacheRequest::get(url("/dashboard"))).await.unwrap();
    assert_eq!(page.source, CacheSource::Placeholder);
    assert_eq!(page.data.status, 503);
    assert_eq!(page.data.body, b"You are offline");

    let post = CacheRequest::new(Method::POST, url("/api/products"));
    let result = h.layer.handle(&post).await.unwrap();
    assert_eq!(result.source, CacheSource::Placeholder);
  }

  #[tokio::test]
  async fn test_other_get_falls_back_to_cache_before_placeholder() {
    let h = Harness::new();
    h.network().serve("/dashboard", ok("<html>"));
    h.layer.handle(&CacheRequest::get(url("/dashboard"))).await.unwrap();

    h.network().set_offline(true);
    let result = h.layer.handle(&CacheRequest::get(url("/dashboard"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"<html>");
  }

  #[tokio::test]
  async fn test_non_success_responses_are_returned_but_not_cached() {
    let h = Harness::new();
    let request = CacheRequest::get(url("/api/products/missing"));

    let result = h.layer.handle(&request).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 404);
    assert!(h.storage().get("dynamic-v1", &request).unwrap().is_none());

    // Static 404s are not pinned either
    h.layer.handle(&CacheRequest::get(url("/static/gone.css"))).await.unwrap();
    assert!(h.storage().cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_non_get_is_never_cached() {
    let h = Harness::new();
    h.network().serve("/api/products", ok("created"));
    let post = CacheRequest::new(Method::POST, url("/api/products"));

    let result = h.layer.handle(&post).await.unwrap();
    assert_eq!(result.data.body, b"created");
    assert!(h.storage().cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_purges_superseded_generations() {
    let mut h = Harness::new();
    h.network().serve("/static/app.js", ok("v1"));
    h.network().serve("/api/products", ok("[]"));
    h.layer.handle(&CacheRequest::get(url("/static/app.js"))).await.unwrap();
    h.layer.handle(&CacheRequest::get(url("/api/products"))).await.unwrap();

    let purged = h.layer.activate("v2").unwrap();
    assert_eq!(purged, vec!["dynamic-v1", "static-v1"]);
    assert!(h.storage().cache_names().unwrap().is_empty());
    assert_eq!(h.layer.generation().static_name(), "static-v2");

    // The new generation starts cold
    h.network().set_offline(true);
    let page = h.layer.handle(&CacheRequest::get(url("/static/app.js"))).await;
    assert!(page.is_err());
  }

  #[tokio::test]
  async fn test_activate_keeps_current_generation() {
    let mut h = Harness::new();
    h.network().serve("/static/app.js", ok("v1"));
    h.layer.handle(&CacheRequest::get(url("/static/app.js"))).await.unwrap();

    assert!(h.layer.activate("v1").unwrap().is_empty());
    assert_eq!(h.storage().cache_names().unwrap(), vec!["static-v1"]);
  }

  #[tokio::test]
  async fn test_precache_stores_successful_fetches_only() {
    let h = Harness::new();
    h.network().serve("/static/app.js", ok("js"));
    h.network().serve("/static/app.css", ok("css"));

    let stored = h
      .layer
      .precache(vec![
        CacheRequest::get(url("/static/app.js")),
        CacheRequest::get(url("/static/app.css")),
        CacheRequest::get(url("/static/missing.png")),
      ])
      .await;

    assert_eq!(stored, 2);
    h.network().set_offline(true);
    let css = h.layer.handle(&CacheRequest::get(url("/static/app.css"))).await.unwrap();
    assert_eq!(css.source, CacheSource::Cache);
  }
}
