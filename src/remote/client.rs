use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{ApiEnvelope, ApiImportResponse, ImportBody, ImportResult, ReplaceAllBody};
use super::RemoteStore;
use crate::error::{SyncError, SyncResult};
use crate::record::{Record, RecordPatch};

/// REST client for the remote collection API.
#[derive(Debug, Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
}

impl HttpRemote {
  /// Create a client rooted at `base_url`. Every request is bounded by `timeout`.
  pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
    let base = parse_base_url(base_url)?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(SyncError::from)?;

    Ok(Self { client, base })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  fn endpoint(&self, path: &str) -> SyncResult<Url> {
    self
      .base
      .join(path)
      .map_err(|e| SyncError::InvalidInput(format!("Bad endpoint path '{}': {}", path, e)))
  }
}

/// Parse and normalise a base URL so relative joins append to its path.
pub fn parse_base_url(raw: &str) -> SyncResult<Url> {
  let mut url = Url::parse(raw.trim())
    .map_err(|e| SyncError::InvalidInput(format!("Invalid URL '{}': {}", raw, e)))?;

  if !matches!(url.scheme(), "http" | "https") {
    return Err(SyncError::InvalidInput(format!(
      "Unsupported URL scheme '{}'",
      url.scheme()
    )));
  }

  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

/// Decode an envelope, mapping HTTP failures onto the error taxonomy.
///
/// `id` turns a 404 into `NotFound` for id-scoped calls.
async fn read_envelope<T: DeserializeOwned>(
  response: Response,
  id: Option<u64>,
) -> SyncResult<(u16, T)> {
  let status = response.status();

  if status == StatusCode::NOT_FOUND {
    if let Some(id) = id {
      return Err(SyncError::NotFound { id });
    }
  }

  let body = response.bytes().await?;

  if !status.is_success() {
    let detail = serde_json::from_slice::<ApiEnvelope<serde_json::Value>>(&body)
      .ok()
      .and_then(|env| env.message)
      .unwrap_or_else(|| String::from_utf8_lossy(&body).chars().take(200).collect());
    return Err(SyncError::Transport {
      status: Some(status.as_u16()),
      message: format!("HTTP {}: {}", status, detail),
    });
  }

  let decoded = serde_json::from_slice::<T>(&body)
    .map_err(|e| SyncError::MalformedResponse(format!("Failed to parse response: {}", e)))?;
  Ok((status.as_u16(), decoded))
}

#[async_trait]
impl RemoteStore for HttpRemote {
  async fn create(&self, record: &Record) -> SyncResult<Record> {
    debug!(id = record.id, "POST collection");
    let response = self
      .client
      .post(self.endpoint("collection")?)
      .json(record)
      .send()
      .await?;

    let (status, env): (u16, ApiEnvelope<Vec<Record>>) = read_envelope(response, None).await?;
    env.into_single(status)
  }

  async fn fetch_one(&self, id: u64) -> SyncResult<Record> {
    let response = self
      .client
      .get(self.endpoint(&format!("collection/{}", id))?)
      .send()
      .await?;

    let (status, env): (u16, ApiEnvelope<Vec<Record>>) = read_envelope(response, Some(id)).await?;
    env.into_single(status)
  }

  async fn update(&self, id: u64, patch: &RecordPatch) -> SyncResult<Record> {
    debug!(id, "PUT collection");
    let response = self
      .client
      .put(self.endpoint(&format!("collection/{}", id))?)
      .json(patch)
      .send()
      .await?;

    let (status, env): (u16, ApiEnvelope<Vec<Record>>) = read_envelope(response, Some(id)).await?;
    env.into_single(status)
  }

  async fn delete(&self, id: u64) -> SyncResult<()> {
    debug!(id, "DELETE collection");
    let response = self
      .client
      .delete(self.endpoint(&format!("collection/{}", id))?)
      .send()
      .await?;

    let (status, env): (u16, ApiEnvelope<serde_json::Value>) =
      read_envelope(response, Some(id)).await?;
    if !env.success {
      return Err(SyncError::Transport {
        status: Some(status),
        message: env
          .message
          .unwrap_or_else(|| "remote rejected the delete".to_string()),
      });
    }
    Ok(())
  }

  async fn fetch_all(&self) -> SyncResult<Vec<Record>> {
    let response = self.client.get(self.endpoint("collection")?).send().await?;

    let (status, env): (u16, ApiEnvelope<Vec<Record>>) = read_envelope(response, None).await?;
    env.into_data(status)
  }

  async fn replace_all(&self, records: &[Record]) -> SyncResult<Vec<Record>> {
    debug!(count = records.len(), "POST collection/sync");
    let response = self
      .client
      .post(self.endpoint("collection/sync")?)
      .json(&ReplaceAllBody { records })
      .send()
      .await?;

    let (status, env): (u16, ApiEnvelope<Vec<Record>>) = read_envelope(response, None).await?;
    env.into_data(status)
  }

  async fn import_from_source(&self, url: &str) -> SyncResult<ImportResult> {
    let response = self
      .client
      .post(self.endpoint("import")?)
      .json(&ImportBody { url })
      .send()
      .await?;

    let (status, body): (u16, ApiImportResponse) = read_envelope(response, None).await?;
    if !body.success {
      return Err(SyncError::Transport {
        status: Some(status),
        message: body
          .message
          .clone()
          .unwrap_or_else(|| "import rejected".to_string()),
      });
    }
    Ok(body.into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::Status;
  use serde_json::json;
  use wiremock::matchers::{body_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn record_json(id: u64, title: &str) -> serde_json::Value {
    json!({
      "id": id,
      "title": title,
      "description": "",
      "status": "not-started",
      "notes": "",
      "createdAt": "2024-01-01T00:00:00Z",
      "updatedAt": "2024-01-01T00:00:00Z"
    })
  }

  fn client_for(server: &MockServer) -> HttpRemote {
    HttpRemote::new(&format!("{}/api", server.uri()), Duration::from_secs(5)).unwrap()
  }

  #[test]
  fn test_parse_base_url_appends_slash() {
    let url = parse_base_url("http://localhost:3000/api").unwrap();
    assert_eq!(url.join("collection").unwrap().path(), "/api/collection");
    assert!(parse_base_url("ftp://host").is_err());
    assert!(parse_base_url("not a url").is_err());
  }

  #[tokio::test]
  async fn test_fetch_all() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/collection"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "data": [record_json(1, "Go"), record_json(2, "Rust")]
      })))
      .mount(&server)
      .await;

    let records = client_for(&server).fetch_all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].title, "Rust");
  }

  #[tokio::test]
  async fn test_fetch_one_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/collection/9"))
      .respond_with(
        ResponseTemplate::new(404).set_body_json(json!({"success": false, "message": "missing"})),
      )
      .mount(&server)
      .await;

    let err = client_for(&server).fetch_one(9).await.unwrap_err();
    assert_eq!(err, SyncError::NotFound { id: 9 });
  }

  #[tokio::test]
  async fn test_update_sends_only_patch_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .and(path("/api/collection/1"))
      .and(body_json(json!({"status": "completed"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "data": [record_json(1, "Go")]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let record = client_for(&server)
      .update(1, &RecordPatch::status(Status::Completed))
      .await
      .unwrap();
    assert_eq!(record.id, 1);
  }

  #[tokio::test]
  async fn test_create_returns_server_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/collection"))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({
        "success": true,
        "data": [record_json(1001, "Go")]
      })))
      .mount(&server)
      .await;

    let local = Record::new(1, crate::record::NewRecord::titled("Go"), chrono::Utc::now());
    let stored = client_for(&server).create(&local).await.unwrap();
    assert_eq!(stored.id, 1001);
  }

  #[tokio::test]
  async fn test_delete_ok_and_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/api/collection/1"))
      .respond_with(
        ResponseTemplate::new(200).set_body_json(json!({"success": true, "message": "deleted"})),
      )
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/api/collection/2"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&server)
      .await;

    let client = client_for(&server);
    client.delete(1).await.unwrap();
    assert_eq!(client.delete(2).await.unwrap_err(), SyncError::NotFound { id: 2 });
  }

  #[tokio::test]
  async fn test_server_error_is_transport() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/collection"))
      .respond_with(
        ResponseTemplate::new(503).set_body_json(json!({"success": false, "message": "down"})),
      )
      .mount(&server)
      .await;

    match client_for(&server).fetch_all().await.unwrap_err() {
      SyncError::Transport { status, message } => {
        assert_eq!(status, Some(503));
        assert!(message.contains("down"));
      }
      other => panic!("expected transport error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_garbage_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/collection"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
      .mount(&server)
      .await;

    let err = client_for(&server).fetch_all().await.unwrap_err();
    assert!(matches!(err, SyncError::MalformedResponse(_)));
  }

  #[tokio::test]
  async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/collection"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_delay(Duration::from_millis(500))
          .set_body_json(json!({"success": true, "data": []})),
      )
      .mount(&server)
      .await;

    let client =
      HttpRemote::new(&format!("{}/api", server.uri()), Duration::from_millis(50)).unwrap();
    let err = client.fetch_all().await.unwrap_err();
    assert!(err.is_transient());
  }

  #[tokio::test]
  async fn test_replace_all_and_import() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/collection/sync"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "data": [record_json(1, "Go")]
      })))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/api/import"))
      .and(body_json(json!({"url": "https://example.com/roadmap"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "data": [record_json(10, "Kotlin"), record_json(11, "Swift")],
        "sourceTitle": "Mobile roadmap",
        "totalCount": 2
      })))
      .mount(&server)
      .await;

    let client = client_for(&server);
    let local = vec![Record::new(
      1,
      crate::record::NewRecord::titled("Go"),
      chrono::Utc::now(),
    )];
    assert_eq!(client.replace_all(&local).await.unwrap().len(), 1);

    let imported = client
      .import_from_source("https://example.com/roadmap")
      .await
      .unwrap();
    assert_eq!(imported.source_title, "Mobile roadmap");
    assert_eq!(imported.total_count, 2);
    assert_eq!(imported.records[0].id, 10);
  }
}
