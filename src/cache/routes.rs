use serde::{Deserialize, Serialize};

use super::traits::CacheRequest;

/// How the cache resolves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Cache-first
  StaticAsset,
  /// Network-first, cached copy on failure, else error
  DynamicRead,
  /// Network-first, then cache (GET only), then the offline placeholder
  Other,
}

/// Path rules deciding the request class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutePolicy {
  pub static_prefixes: Vec<String>,
  /// Without the leading dot
  pub static_extensions: Vec<String>,
  pub dynamic_prefixes: Vec<String>,
}

impl Default for RoutePolicy {
  fn default() -> Self {
    Self {
      static_prefixes: vec!["/static/".into(), "/assets/".into(), "/icons/".into()],
      static_extensions: ["js", "css", "png", "jpg", "jpeg", "svg", "ico", "woff2", "webmanifest"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      dynamic_prefixes: vec![
        "/api/products".into(),
        "/api/farmers".into(),
        "/api/categories".into(),
      ],
    }
  }
}

impl RoutePolicy {
  pub fn classify(&self, request: &CacheRequest) -> RequestClass {
    if !request.is_get() {
      return RequestClass::Other;
    }

    let path = request.url.path();
    if self.is_static(path) {
      RequestClass::StaticAsset
    } else if self.dynamic_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      RequestClass::DynamicRead
    } else {
      RequestClass::Other
    }
  }

  fn is_static(&self, path: &str) -> bool {
    if self.static_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return true;
    }

    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => self
        .static_extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext)),
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  fn req(method: Method, path: &str) -> CacheRequest {
    let url = Url::parse("https://market.example").unwrap().join(path).unwrap();
    CacheRequest::new(method, url)
  }

  #[test]
  fn test_classify_by_prefix_and_extension() {
    let routes = RoutePolicy::default();

    assert_eq!(routes.classify(&req(Method::GET, "/static/logo")), RequestClass::StaticAsset);
    assert_eq!(routes.classify(&req(Method::GET, "/app.JS")), RequestClass::StaticAsset);
    assert_eq!(
      routes.classify(&req(Method::GET, "/api/products?page=2")),
      RequestClass::DynamicRead
    );
    assert_eq!(routes.classify(&req(Method::GET, "/dashboard")), RequestClass::Other);
    // A dotfile is not an extension
    assert_eq!(routes.classify(&req(Method::GET, "/.css")), RequestClass::Other);
  }

  #[test]
  fn test_non_get_is_never_cacheable() {
    let routes = RoutePolicy::default();
    assert_eq!(routes.classify(&req(Method::POST, "/api/products")), RequestClass::Other);
    assert_eq!(routes.classify(&req(Method::PUT, "/static/app.js")), RequestClass::Other);
  }
}
