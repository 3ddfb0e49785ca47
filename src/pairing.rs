//! Pairing exchange
//!
//! Trades a one-time pairing code shown in the dashboard for a full settings
//! record. A 400-class response means the code itself was rejected and the
//! operator should be re-prompted; that is kept distinct from transport
//! errors, which are worth a short blind retry.

use std::time::Duration;

use serde::Serialize;

use crate::config::Settings;
use crate::error::{AgentError, Result};

const PAIR_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest<'a> {
    pair_code: &'a str,
    agent_version: &'a str,
    machine_id: &'a str,
}

/// Client for the backend's pairing endpoint.
pub struct PairingClient {
    base_url: String,
    client: reqwest::Client,
}

impl PairingClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PAIR_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Exchange a pairing code for resolved settings.
    pub async fn pair(
        &self,
        pair_code: &str,
        agent_version: &str,
        machine_id: &str,
    ) -> Result<Settings> {
        let endpoint = format!("{}/api/bridge/pair", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&PairRequest {
                pair_code,
                agent_version,
                machine_id,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let _ = response.bytes().await;
            return Err(AgentError::InvalidPairCode);
        }
        if !status.is_success() {
            let _ = response.bytes().await;
            return Err(AgentError::Pairing(format!(
                "pair request failed with status {status}"
            )));
        }

        let settings: Settings = response.json().await?;
        settings.normalized()
    }
}

/// Identifier for this machine, sent with the pairing request.
pub fn machine_id() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Ok(name) = name.into_string() {
                return name;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Ok(name) = std::env::var("COMPUTERNAME") {
            return name;
        }
    }

    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn pair_router() -> Router {
        Router::new().route(
            "/api/bridge/pair",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["agentVersion"], "1.2.3");
                assert!(body["machineId"].is_string());

                match body["pairCode"].as_str() {
                    Some("good-code") => (
                        StatusCode::OK,
                        Json(serde_json::json!({
                            "bridgeId": "bridge-7",
                            "apiKey": "paired-key",
                            "rtspUrl": "rtsp://cam.local/stream",
                            "backendUrl": "https://backend.example.com"
                        })),
                    ),
                    Some("flaky") => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({})),
                    ),
                    _ => (StatusCode::BAD_REQUEST, Json(serde_json::json!({}))),
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_pair_returns_normalized_settings() {
        let base = spawn_server(pair_router()).await;
        let client = PairingClient::new(&base).unwrap();

        let settings = client.pair("good-code", "1.2.3", "host-a").await.unwrap();
        assert_eq!(settings.bridge_id, "bridge-7");
        // Defaults applied on the wire record
        assert_eq!(settings.upload_base_url, "https://backend.example.com");
    }

    #[tokio::test]
    async fn test_rejected_code_is_distinguished() {
        let base = spawn_server(pair_router()).await;
        let client = PairingClient::new(&base).unwrap();

        let err = client.pair("wrong-code", "1.2.3", "host-a").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidPairCode));
    }

    #[tokio::test]
    async fn test_server_error_is_a_transport_failure() {
        let base = spawn_server(pair_router()).await;
        let client = PairingClient::new(&base).unwrap();

        let err = client.pair("flaky", "1.2.3", "host-a").await.unwrap_err();
        match err {
            AgentError::Pairing(msg) => assert!(msg.contains("500")),
            other => panic!("expected Pairing error, got {other:?}"),
        }
    }

    #[test]
    fn test_machine_id_is_nonempty() {
        assert!(!machine_id().is_empty());
    }
}
