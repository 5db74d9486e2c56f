//! Scriptable fetcher shared by the cache tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

use super::traits::{CacheRequest, CachedResponse, Fetcher};

pub const ORIGIN: &str = "https://market.example";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn ok(body: &str) -> CachedResponse {
  CachedResponse {
    status: 200,
    headers: vec![("content-type".into(), "text/plain".into())],
    body: body.as_bytes().to_vec(),
  }
}

/// Serves responses by URL path; unknown paths get 404. `set_offline`
/// makes every fetch fail the way a dropped connection does.
#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, CachedResponse>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl MockFetcher {
  pub fn serve(&self, path: &str, response: CachedResponse) {
    self.routes.lock().unwrap().insert(path.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: connection refused", request.url));
    }

    let routes = self.routes.lock().unwrap();
    Ok(routes.get(request.url.path()).cloned().unwrap_or(CachedResponse {
      status: 404,
      headers: Vec::new(),
      body: b"not found".to_vec(),
    }))
  }
}
