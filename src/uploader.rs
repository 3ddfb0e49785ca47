//! Artifact upload with retry
//!
//! Delivers manifests and segments to the backend with exponential backoff.
//! Both calls share one retry shape ([`RetryPolicy::UPLOAD`]): any transport
//! error or non-2xx status is a retryable failure, and by default attempts
//! continue until the shutdown token fires, so the caller's cancellation
//! decides when to give up rather than a hard-coded retry budget.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{AgentError, Result};
use crate::retry::{wait_interruptible, RetryPolicy};

/// Content type of the rolling HLS manifest.
pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const BRIDGE_ID_HEADER: &str = "X-Bridge-Id";
const BRIDGE_KEY_HEADER: &str = "X-Bridge-Key";
const SEGMENT_NAME_HEADER: &str = "X-Segment-Name";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Destination for output artifacts.
///
/// The synchronizer only sees this trait; tests substitute a recording fake
/// for the HTTP implementation.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Upload the current manifest bytes.
    async fn upload_manifest(&self, data: &[u8]) -> Result<()>;

    /// Upload one immutable segment under its file name.
    async fn upload_segment(&self, name: &str, data: &[u8]) -> Result<()>;
}

/// HTTP uploader pushing artifacts to the backend's bridge-upload endpoints.
pub struct HttpUploader {
    client: reqwest::Client,
    manifest_url: String,
    segment_url: String,
    bridge_id: String,
    api_key: String,
    policy: RetryPolicy,
    token: CancellationToken,
}

impl HttpUploader {
    /// Create an uploader from resolved settings.
    pub fn new(settings: &Settings, token: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let base = settings.upload_base_url.trim_end_matches('/');
        Ok(Self {
            client,
            manifest_url: format!("{base}/api/bridge-upload/manifest"),
            segment_url: format!("{base}/api/bridge-upload/segment"),
            bridge_id: settings.bridge_id.clone(),
            api_key: settings.api_key.clone(),
            policy: RetryPolicy::UPLOAD,
            token,
        })
    }

    /// Override the retry policy, used by tests to shrink delays.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Send a request built by `build`, retrying under the uploader policy.
    ///
    /// The request is rebuilt for every attempt; multipart bodies cannot be
    /// replayed. Response bodies are consumed on every path so the
    /// connection can be reused.
    async fn send_with_retry<F>(&self, artifact: &str, build: F) -> Result<()>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut backoff = self.policy.backoff();

        loop {
            if self.token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let outcome = tokio::select! {
                _ = self.token.cancelled() => return Err(AgentError::Cancelled),
                res = build().send() => res,
            };

            let failure = match outcome {
                Ok(response) => {
                    let status = response.status();
                    let _ = response.bytes().await;
                    if status.is_success() {
                        return Ok(());
                    }
                    format!("HTTP status {status}")
                }
                Err(e) => e.to_string(),
            };

            let Some(delay) = backoff.next_delay() else {
                return Err(AgentError::UploadExhausted {
                    attempts: backoff.attempts(),
                    last_error: failure,
                });
            };

            tracing::warn!(
                artifact = %artifact,
                error = %failure,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "upload attempt failed, retrying"
            );
            wait_interruptible(&self.token, delay).await?;
        }
    }
}

#[async_trait]
impl ArtifactSink for HttpUploader {
    async fn upload_manifest(&self, data: &[u8]) -> Result<()> {
        let body = data.to_vec();
        self.send_with_retry("manifest", || {
            self.client
                .post(&self.manifest_url)
                .header(CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
                .header(BRIDGE_ID_HEADER, &self.bridge_id)
                .header(BRIDGE_KEY_HEADER, &self.api_key)
                .body(body.clone())
        })
        .await
    }

    async fn upload_segment(&self, name: &str, data: &[u8]) -> Result<()> {
        let body = data.to_vec();
        let file_name = name.to_string();
        self.send_with_retry(name, || {
            let part = multipart::Part::bytes(body.clone()).file_name(file_name.clone());
            let form = multipart::Form::new().part("file", part);
            self.client
                .post(&self.segment_url)
                .header(BRIDGE_ID_HEADER, &self.bridge_id)
                .header(BRIDGE_KEY_HEADER, &self.api_key)
                .header(SEGMENT_NAME_HEADER, file_name.clone())
                .multipart(form)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;

    fn test_settings(base: &str) -> Settings {
        let json = format!(
            r#"{{
                "bridgeId": "bridge-1",
                "apiKey": "key-1",
                "rtspUrl": "rtsp://cam/stream",
                "backendUrl": "{base}"
            }}"#
        );
        let settings: Settings = serde_json::from_str(&json).unwrap();
        settings.normalized().unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: None,
        }
    }

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[derive(Default)]
    struct Seen {
        hits: AtomicU32,
        headers: Mutex<Vec<HeaderMap>>,
    }

    #[tokio::test]
    async fn test_manifest_upload_sends_identity_headers() {
        let seen = Arc::new(Seen::default());
        let router = Router::new()
            .route(
                "/api/bridge-upload/manifest",
                post(
                    |State(seen): State<Arc<Seen>>, headers: HeaderMap, body: String| async move {
                        seen.hits.fetch_add(1, Ordering::SeqCst);
                        seen.headers.lock().unwrap().push(headers);
                        assert!(body.contains("#EXTM3U"));
                        StatusCode::OK
                    },
                ),
            )
            .with_state(seen.clone());
        let base = spawn_server(router).await;

        let uploader = HttpUploader::new(&test_settings(&base), CancellationToken::new())
            .unwrap()
            .with_policy(fast_policy());
        uploader.upload_manifest(b"#EXTM3U\n#EXT-X-VERSION:3\n").await.unwrap();

        assert_eq!(seen.hits.load(Ordering::SeqCst), 1);
        let headers = seen.headers.lock().unwrap();
        assert_eq!(headers[0].get("x-bridge-id").unwrap(), "bridge-1");
        assert_eq!(headers[0].get("x-bridge-key").unwrap(), "key-1");
        assert_eq!(
            headers[0].get("content-type").unwrap(),
            MANIFEST_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_segment_upload_retries_until_success() {
        let seen = Arc::new(Seen::default());
        let router = Router::new()
            .route(
                "/api/bridge-upload/segment",
                post(|State(seen): State<Arc<Seen>>, headers: HeaderMap| async move {
                    let hit = seen.hits.fetch_add(1, Ordering::SeqCst);
                    seen.headers.lock().unwrap().push(headers);
                    if hit < 3 {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }),
            )
            .with_state(seen.clone());
        let base = spawn_server(router).await;

        let uploader = HttpUploader::new(&test_settings(&base), CancellationToken::new())
            .unwrap()
            .with_policy(fast_policy());
        uploader.upload_segment("seg001.ts", b"segment-bytes").await.unwrap();

        // Three 500s, then one success
        assert_eq!(seen.hits.load(Ordering::SeqCst), 4);
        let headers = seen.headers.lock().unwrap();
        assert_eq!(headers[3].get("x-segment-name").unwrap(), "seg001.ts");
        assert!(headers[3]
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("multipart/form-data"));
    }

    #[tokio::test]
    async fn test_attempt_ceiling_surfaces_last_error() {
        let router = Router::new().route(
            "/api/bridge-upload/manifest",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let base = spawn_server(router).await;

        let uploader = HttpUploader::new(&test_settings(&base), CancellationToken::new())
            .unwrap()
            .with_policy(RetryPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                max_attempts: Some(2),
            });

        let err = uploader.upload_manifest(b"#EXTM3U\n").await.unwrap_err();
        match err {
            AgentError::UploadExhausted { attempts, last_error } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("503"));
            }
            other => panic!("expected UploadExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retry_wait() {
        let router = Router::new().route(
            "/api/bridge-upload/segment",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = spawn_server(router).await;

        let token = CancellationToken::new();
        let uploader = HttpUploader::new(&test_settings(&base), token.clone())
            .unwrap()
            .with_policy(RetryPolicy {
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
                max_attempts: None,
            });

        let task = tokio::spawn(async move {
            uploader.upload_segment("seg001.ts", b"data").await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }
}
