use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use remind_core::error::DispatchError;
use remind_core::transport::MessagingTransport;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Messaging transport backed by the gateway's HTTP surface.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct GatewayStatus {
    connected: bool,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(45)) // longer than the gateway's default send confirmation wait
            .build()
            .context("build http client")?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    async fn status(&self) -> Result<GatewayStatus> {
        let resp = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await
            .context("gateway /status")?
            .error_for_status()?;
        Ok(resp.json::<GatewayStatus>().await?)
    }
}

#[async_trait]
impl MessagingTransport for HttpGateway {
    async fn is_connected(&self) -> bool {
        match self.status().await {
            Ok(s) => {
                if !s.connected {
                    warn!("gateway reachable but not paired; scan the code at {}/qr", self.base_url);
                }
                s.connected
            }
            Err(e) => {
                warn!("gateway status check failed: {:#}", e);
                false
            }
        }
    }

    async fn send(&self, phone: &str, text: &str) -> Result<(), DispatchError> {
        let resp = self
            .client
            .post(format!("{}/enviar-mensaje", self.base_url))
            .json(&json!({ "numero": phone, "mensaje": text }))
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Transport(format!("{} - {}", status.as_u16(), body)));
        }
        debug!("gateway accepted message to {}", phone);
        Ok(())
    }
}

#[cfg(all(test, feature = "web-api"))]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::{get, post}, Json, Router};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn posts_numero_and_mensaje() {
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = seen.clone();
        let app = Router::new()
            .route("/status", get(|| async { Json(json!({ "connected": true, "hasQR": false })) }))
            .route(
                "/enviar-mensaje",
                post(move |Json(body): Json<Value>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(body);
                        Json(json!({ "success": true }))
                    }
                }),
            );
        let gw = HttpGateway::new(&serve(app).await).unwrap();
        assert!(gw.is_connected().await);
        gw.send("59170123456", "hola").await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["numero"], "59170123456");
        assert_eq!(seen[0]["mensaje"], "hola");
    }

    #[tokio::test]
    async fn gateway_errors_become_transport_errors() {
        let app = Router::new()
            .route("/status", get(|| async { Json(json!({ "connected": false })) }))
            .route(
                "/enviar-mensaje",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "WhatsApp no está conectado") }),
            );
        let gw = HttpGateway::new(&serve(app).await).unwrap();
        assert!(!gw.is_connected().await);
        let err = gw.send("59170123456", "hola").await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(ref m) if m.starts_with("500")));
    }

    #[tokio::test]
    async fn unreachable_gateway_reads_as_disconnected() {
        let gw = HttpGateway::new("http://127.0.0.1:9").unwrap();
        assert!(!gw.is_connected().await);
    }
}
