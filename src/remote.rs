use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::config::{Config, RemoteConfig};
use crate::queue::{Method, MutationSender, Operation};

/// HTTP client for the remote store.
///
/// Replays queued writes and serves as a fetcher for the request cache.
#[derive(Clone)]
pub struct RemoteClient {
  http: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl RemoteClient {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let mut base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote URL '{}': {}", config.url, e))?;
    // Without a trailing slash, join() would replace the last path segment
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      token: Config::get_api_token(),
    })
  }

  /// Resolve `path` against the base URL.
  pub fn url(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  /// GET `path` and decode the JSON body.
  pub async fn fetch_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let url = self.url(path)?;
    let response = self
      .authorize(self.http.get(url.clone()))
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Fetching {} returned {}", url, status));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }

  /// Apply a queued write. Any non-2xx response is a failure.
  pub async fn send_operation(&self, operation: &Operation) -> Result<()> {
    let url = self.url(&operation.path)?;
    let request = match operation.method {
      Method::Post => self.http.post(url.clone()),
      Method::Put => self.http.put(url.clone()),
      Method::Patch => self.http.patch(url.clone()),
      Method::Delete => self.http.delete(url.clone()),
    };
    let request = if operation.payload.is_null() {
      request
    } else {
      request.json(&operation.payload)
    };

    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| eyre!("Failed to {} {}: {}", operation.method, url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("{} {} returned {}", operation.method, url, status));
    }
    Ok(())
  }
}

impl MutationSender for RemoteClient {
  fn send<'a>(&'a self, operation: &'a Operation) -> BoxFuture<'a, Result<()>> {
    self.send_operation(operation).boxed()
  }
}

impl std::fmt::Debug for RemoteClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RemoteClient")
      .field("base", &self.base.as_str())
      .field("authenticated", &self.token.is_some())
      .finish()
  }
}
