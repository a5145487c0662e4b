use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result as EyreResult};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::api_types::{ApiErrorBody, ApiSyncStatusResponse, SyncRequest};
use crate::cache::QueryKey;
use crate::config::ApiConfig;
use crate::error::{Result, SyncError};
use crate::keys::ResourceKey;

const USER_SYNC_PATH: [&str; 3] = ["api", "admin", "user-sync"];

/// Server side of the sync engine.
///
/// Implemented over HTTP by [`HttpClient`]; tests substitute an in-memory
/// endpoint.
#[async_trait]
pub trait ResourceEndpoint: Send + Sync {
  /// Send a mutation envelope. Returns the server's JSON result.
  async fn submit(&self, request: SyncRequest) -> Result<Value>;

  /// Number of operations the server still has queued.
  async fn queue_size(&self) -> Result<u64>;
}

/// Read side of the dashboards: GET a resource, return its JSON.
#[async_trait]
pub trait ResourceReader: Send + Sync {
  async fn read(&self, key: &ResourceKey) -> Result<Value>;
}

/// HTTP client for the dashboard's read endpoints and the user-sync endpoint
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpClient {
  pub fn new(config: &ApiConfig, token: Option<String>) -> EyreResult<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.request_timeout_ms))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }


  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    let request = request.header(ACCEPT, "application/json");
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  /// GET a read endpoint and decode its JSON body.
  pub async fn get_json<T: DeserializeOwned>(&self, key: &ResourceKey) -> Result<T> {
    let request = self.authorize(self.client.get(key.url(&self.base_url)?));
    let value = send(request).await?;
    Ok(serde_json::from_value(value)?)
  }
}

#[async_trait]
impl ResourceReader for HttpClient {
  async fn read(&self, key: &ResourceKey) -> Result<Value> {
    debug!(key = %key.cache_key(), "reading");
    self.get_json(key).await
  }
}

#[async_trait]
impl ResourceEndpoint for HttpClient {
  async fn submit(&self, request: SyncRequest) -> Result<Value> {
    debug!(action = request.action.as_str(), users = request.user_ids.len(), "submitting");
    let body = serde_json::to_vec(&request)?;
    let builder = self
      .authorize(self.client.post(endpoint_url(&self.base_url, &USER_SYNC_PATH)?))
      .header(CONTENT_TYPE, "application/json")
      .body(body);
    send(builder).await
  }

  async fn queue_size(&self) -> Result<u64> {
    let request = self.authorize(self.client.get(endpoint_url(&self.base_url, &USER_SYNC_PATH)?));
    let response: ApiSyncStatusResponse = serde_json::from_value(send(request).await?)?;
    Ok(response.sync_status.queue_size)
  }
}

/// Append `segments` to the base URL's path, one encoded segment each.
///
/// Any path prefix on the base (`https://host/internlink/`) is kept.
pub(crate) fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url> {
  let mut url = base.clone();
  url.set_query(None);
  url.set_fragment(None);
  url
    .path_segments_mut()
    .map_err(|_| SyncError::Network(format!("API base URL {} cannot carry a path", base)))?
    .pop_if_empty()
    .extend(segments);
  Ok(url)
}

/// Send a request and read its JSON body.
///
/// Non-2xx responses become [`SyncError::Rejected`] carrying the server's
/// `error` message, or the status reason when the body has none.
async fn send(request: RequestBuilder) -> Result<Value> {
  let response = request.send().await?;
  let status = response.status();
  let bytes = response.bytes().await?;

  if !status.is_success() {
    return Err(SyncError::rejected(status.as_u16(), error_message(status, &bytes)));
  }

  if bytes.is_empty() {
    return Ok(Value::Null);
  }
  Ok(serde_json::from_slice(&bytes)?)
}

fn error_message(status: StatusCode, body: &[u8]) -> String {
  serde_json::from_slice::<ApiErrorBody>(body)
    .map(|b| b.error)
    .unwrap_or_else(|_| {
      status
        .canonical_reason()
        .unwrap_or("Request failed")
        .to_string()
    })
}
