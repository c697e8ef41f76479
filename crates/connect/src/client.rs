//! Sync API client for communicating with the Mintling cloud service.

use std::time::Duration;

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use async_trait::async_trait;
use mintling_core::sync::{
    EntityKey, PushOutcome, RemoteError, RemoteLatest, RemoteStore, Snapshot, VersionToken,
};

use crate::error::{ConnectError, Result};
use crate::types::*;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Outcome of a snapshot push at the wire level.
#[derive(Debug, Clone)]
pub enum PushResult {
    Accepted(PushSnapshotResponse),
    Conflicted(ConflictResponse),
}

/// Client for the Mintling cloud sync API.
///
/// Owns the session credentials; one instance per signed-in user.
#[derive(Debug, Clone)]
pub struct ConnectClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    device_id: String,
}

impl ConnectClient {
    /// Create a new sync client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the cloud API (e.g., "https://api.mintling.app")
    pub fn new(base_url: &str, access_token: &str, device_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            device_id: device_id.to_string(),
        })
    }

    /// Create headers for an API request.
    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.access_token))
            .map_err(|_| ConnectError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let device_value = HeaderValue::from_str(&self.device_id)
            .map_err(|_| ConnectError::invalid_request("Invalid device ID format"))?;
        headers.insert("x-ml-device-id", device_value);

        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[Connect] API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[Connect] API response error ({}): {}", status, preview);
    }

    fn api_error(status: reqwest::StatusCode, body: &str) -> ConnectError {
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
            return ConnectError::api(
                status.as_u16(),
                format!("{}: {}", error.code, error.message),
            );
        }
        ConnectError::api(status.as_u16(), format!("Request failed: {}", body))
    }

    /// Parse a JSON response body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "[Connect] Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            ConnectError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    /// Push a full snapshot.
    ///
    /// A stale `base_version` yields a 409 whose body carries both sides of
    /// every diverged entity; that is a [`PushResult::Conflicted`], not an
    /// error.
    ///
    /// POST /api/v1/sync/snapshots/push
    pub async fn push_user_snapshot(&self, request: PushSnapshotRequest) -> Result<PushResult> {
        let url = format!("{}/api/v1/sync/snapshots/push", self.base_url);
        debug!(
            "[Connect] Pushing snapshot for {} (baseVersion: {:?}, force: {})",
            request.user_id, request.base_version, request.force
        );

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 409 {
            let body = response.text().await?;
            Self::log_response(status, &body);
            let conflicts: ConflictResponse = serde_json::from_str(&body)?;
            return Ok(PushResult::Conflicted(conflicts));
        }

        Ok(PushResult::Accepted(Self::parse_response(response).await?))
    }

    /// Latest snapshot and version for a user; `None` when the server has
    /// never seen this user.
    ///
    /// GET /api/v1/sync/snapshots/latest?userId={userId}
    pub async fn latest_user_snapshot(
        &self,
        user_id: &str,
    ) -> Result<Option<LatestSnapshotResponse>> {
        let url = format!(
            "{}/api/v1/sync/snapshots/latest?userId={}",
            self.base_url,
            urlencoding::encode(user_id)
        );

        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }

        Ok(Some(Self::parse_response(response).await?))
    }

    /// Upsert one entity record.
    ///
    /// POST /api/v1/sync/entities/upsert
    pub async fn upsert_entity(&self, request: UpsertEntityRequest) -> Result<SuccessResponse> {
        let url = format!("{}/api/v1/sync/entities/upsert", self.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch one collection for a user.
    ///
    /// GET /api/v1/sync/entities/{collection}?userId={userId}
    pub async fn list_entities(
        &self,
        user_id: &str,
        collection: &str,
    ) -> Result<EntityListResponse> {
        let url = format!(
            "{}/api/v1/sync/entities/{}?userId={}",
            self.base_url,
            collection,
            urlencoding::encode(user_id)
        );

        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

#[async_trait]
impl RemoteStore for ConnectClient {
    async fn upsert(
        &self,
        user_id: &str,
        key: &EntityKey,
        payload: &serde_json::Value,
    ) -> std::result::Result<(), RemoteError> {
        self.upsert_entity(UpsertEntityRequest {
            user_id: user_id.to_string(),
            collection: key.kind.as_str().to_string(),
            entity_id: key.id.clone(),
            payload: payload.clone(),
        })
        .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        user_id: &str,
        collection: &str,
    ) -> std::result::Result<Vec<serde_json::Value>, RemoteError> {
        Ok(self.list_entities(user_id, collection).await?.items)
    }

    async fn push_snapshot(
        &self,
        user_id: &str,
        snapshot: &Snapshot,
        version: Option<&VersionToken>,
        force: bool,
    ) -> std::result::Result<PushOutcome, RemoteError> {
        let result = self
            .push_user_snapshot(PushSnapshotRequest {
                user_id: user_id.to_string(),
                snapshot: snapshot.clone(),
                base_version: version.map(|v| v.0.clone()),
                force,
            })
            .await?;
        Ok(match result {
            PushResult::Accepted(accepted) => {
                PushOutcome::Accepted(VersionToken(accepted.version))
            }
            PushResult::Conflicted(conflicted) => {
                PushOutcome::Conflicted(conflicted.conflicts)
            }
        })
    }

    async fn fetch_latest(
        &self,
        user_id: &str,
    ) -> std::result::Result<Option<RemoteLatest>, RemoteError> {
        Ok(self
            .latest_user_snapshot(user_id)
            .await?
            .map(|latest| RemoteLatest {
                snapshot: latest.snapshot,
                version: VersionToken(latest.version),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mintling_core::sync::RetryClass;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        request_line: String,
        authorization: Option<String>,
        device_id: Option<String>,
        body: String,
    }

    #[derive(Debug, Clone)]
    struct MockResponse {
        status: u16,
        body: String,
    }

    fn api_error_body(code: &str, message: &str) -> String {
        format!(
            r#"{{"error":"error","code":"{}","message":"{}"}}"#,
            code, message
        )
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next()?.to_string();

        let mut authorization = None;
        let mut device_id = None;
        let mut content_length = 0_usize;
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                match name.trim().to_ascii_lowercase().as_str() {
                    "authorization" => authorization = Some(value.trim().to_string()),
                    "x-ml-device-id" => device_id = Some(value.trim().to_string()),
                    "content-length" => content_length = value.trim().parse().unwrap_or(0),
                    _ => {}
                }
            }
        }

        while buffer.len() < header_end + 4 + content_length {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
        let body_end = (header_end + 4 + content_length).min(buffer.len());
        let body = String::from_utf8_lossy(&buffer[header_end + 4..body_end]).to_string();

        Some(CapturedRequest {
            request_line,
            authorization,
            device_id,
            body,
        })
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            404 => "Not Found",
            409 => "Conflict",
            500 => "Internal Server Error",
            _ => "Error",
        }
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        status: u16,
        body: &str,
    ) -> std::io::Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            status_text(status),
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    }

    async fn start_mock_server(
        responses: Vec<MockResponse>,
    ) -> (
        String,
        Arc<TokioMutex<Vec<CapturedRequest>>>,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let captured = Arc::new(TokioMutex::new(Vec::new()));
        let scripted = Arc::new(TokioMutex::new(VecDeque::from(responses)));
        let captured_clone = Arc::clone(&captured);
        let scripted_clone = Arc::clone(&scripted);

        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(value) => value,
                    Err(_) => break,
                };
                let captured_inner = Arc::clone(&captured_clone);
                let scripted_inner = Arc::clone(&scripted_clone);
                tokio::spawn(async move {
                    let Some(request) = read_http_request(&mut stream).await else {
                        return;
                    };
                    captured_inner.lock().await.push(request);
                    let response =
                        scripted_inner.lock().await.pop_front().unwrap_or(MockResponse {
                            status: 500,
                            body: api_error_body("INTERNAL", "unexpected request"),
                        });
                    let _ = write_http_response(&mut stream, response.status, &response.body).await;
                });
            }
        });

        (format!("http://{}", addr), captured, handle)
    }

    fn client(base_url: &str) -> ConnectClient {
        ConnectClient::new(base_url, "token-1", "device-1").expect("build client")
    }

    #[tokio::test]
    async fn accepted_push_carries_credentials_and_base_version() {
        let (base_url, captured, server) = start_mock_server(vec![MockResponse {
            status: 200,
            body: r#"{"version":"5"}"#.to_string(),
        }])
        .await;

        let mut snapshot = Snapshot::empty();
        snapshot
            .collections
            .insert("pet".to_string(), vec![json!({"id": "p1", "hunger": 30})]);

        let outcome = client(&base_url)
            .push_snapshot("user-1", &snapshot, Some(&VersionToken("4".into())), false)
            .await
            .expect("push");
        assert_eq!(outcome, PushOutcome::Accepted(VersionToken("5".into())));

        let requests = captured.lock().await.clone();
        assert_eq!(requests.len(), 1);
        assert!(requests[0]
            .request_line
            .starts_with("POST /api/v1/sync/snapshots/push"));
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer token-1"));
        assert_eq!(requests[0].device_id.as_deref(), Some("device-1"));
        let body: serde_json::Value =
            serde_json::from_str(&requests[0].body).expect("request body");
        assert_eq!(body["userId"], "user-1");
        assert_eq!(body["baseVersion"], "4");
        assert_eq!(body["snapshot"]["collections"]["pet"][0]["hunger"], 30);

        server.abort();
    }

    #[tokio::test]
    async fn stale_push_parses_conflicts_from_409() {
        let conflict_body = r#"{
            "conflicts": [{
                "kind": "pet",
                "entityId": "p1",
                "localValue": {"hunger": 30},
                "remoteValue": {"hunger": 80}
            }]
        }"#;
        let (base_url, _captured, server) = start_mock_server(vec![MockResponse {
            status: 409,
            body: conflict_body.to_string(),
        }])
        .await;

        let outcome = client(&base_url)
            .push_snapshot(
                "user-1",
                &Snapshot::empty(),
                Some(&VersionToken("4".into())),
                false,
            )
            .await
            .expect("push");

        let PushOutcome::Conflicted(conflicts) = outcome else {
            panic!("expected conflicted outcome, got {:?}", outcome);
        };
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity_id, "p1");
        assert_eq!(conflicts[0].local_value, json!({"hunger": 30}));
        assert_eq!(conflicts[0].remote_value, json!({"hunger": 80}));

        server.abort();
    }

    #[tokio::test]
    async fn missing_latest_snapshot_means_new_user() {
        let (base_url, captured, server) = start_mock_server(vec![MockResponse {
            status: 404,
            body: api_error_body("NOT_FOUND", "no snapshot for user"),
        }])
        .await;

        let latest = client(&base_url)
            .fetch_latest("user-1")
            .await
            .expect("fetch latest");
        assert!(latest.is_none());

        let requests = captured.lock().await.clone();
        assert!(requests[0]
            .request_line
            .starts_with("GET /api/v1/sync/snapshots/latest?userId=user-1"));

        server.abort();
    }

    #[tokio::test]
    async fn entity_upsert_targets_the_collection_endpoint() {
        let (base_url, captured, server) = start_mock_server(vec![MockResponse {
            status: 200,
            body: r#"{"success":true}"#.to_string(),
        }])
        .await;

        client(&base_url)
            .upsert(
                "user-1",
                &EntityKey::new(mintling_core::sync::EntityKind::Pet, "p1"),
                &json!({"hunger": 55}),
            )
            .await
            .expect("upsert");

        let requests = captured.lock().await.clone();
        assert!(requests[0]
            .request_line
            .starts_with("POST /api/v1/sync/entities/upsert"));
        let body: serde_json::Value =
            serde_json::from_str(&requests[0].body).expect("request body");
        assert_eq!(body["collection"], "pet");
        assert_eq!(body["entityId"], "p1");
        assert_eq!(body["payload"], json!({"hunger": 55}));

        server.abort();
    }

    #[tokio::test]
    async fn server_errors_surface_with_their_status() {
        let (base_url, _captured, server) = start_mock_server(vec![MockResponse {
            status: 500,
            body: api_error_body("INTERNAL", "boom"),
        }])
        .await;

        let err = client(&base_url)
            .fetch("user-1", "pet")
            .await
            .expect_err("server error");
        assert_eq!(err.retry_class(), RetryClass::Retryable);
        let RemoteError::Api { status, .. } = err else {
            panic!("expected API error, got {:?}", err);
        };
        assert_eq!(status, 500);

        server.abort();
    }
}
