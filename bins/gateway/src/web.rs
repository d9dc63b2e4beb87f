use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use qrcode::render::svg;
use qrcode::QrCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::supervisor::{Command, Supervisor};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub commands: mpsc::Sender<Command>,
}

#[derive(Deserialize)]
struct QrQuery {
    #[serde(default)]
    format: Option<String>,
}

#[derive(Deserialize)]
struct SendBody {
    #[serde(default)]
    numero: Option<String>,
    #[serde(default)]
    mensaje: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/qr", get(qr))
        .route("/status", get(status))
        .route("/enviar-mensaje", post(send_message))
        .route("/reset", post(reset))
        .route("/limpiar", post(cleanup))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Json<serde_json::Value> {
    let st = state.supervisor.status();
    Json(json!({
        "service": "recordatorio gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "connected": st.connected,
        "connecting": st.connecting,
        "sessionSize": st.session_size,
        "endpoints": {
            "qr": "GET /qr - pairing QR page (?format=json for the raw code)",
            "status": "GET /status - detailed state",
            "enviarMensaje": "POST /enviar-mensaje - send a message",
            "reset": "POST /reset - wipe the session and pair again",
            "limpiar": "POST /limpiar - remove temporary files",
        }
    }))
}

async fn qr(State(state): State<AppState>, Query(q): Query<QrQuery>) -> Response {
    let connected = state.supervisor.is_connected();
    let code = state.supervisor.pairing_code();
    let message = match (&code, connected) {
        (_, true) => "WhatsApp conectado",
        (Some(_), false) => "Escanea el código con WhatsApp > Dispositivos vinculados",
        (None, false) => "Generando código QR...",
    };
    if q.format.as_deref() == Some("json") {
        return Json(json!({ "connected": connected, "qr": code, "message": message })).into_response();
    }
    let body = match (&code, connected) {
        (Some(code), false) => match qr_svg(code) {
            Ok(image) => format!(
                "<h1>📱 Escanear Código QR</h1>{image}<ol><li>Abre WhatsApp en tu teléfono</li>\
                 <li>Menú &gt; Dispositivos vinculados</li><li>Vincular un dispositivo y escanea este código</li></ol>"
            ),
            Err(e) => {
                warn!("could not render pairing code: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Error generando QR").into_response();
            }
        },
        _ => format!("<h1>{}</h1>", if connected { "✅" } else { "⏳" }),
    };
    let refresh = if connected { "" } else { r#"<meta http-equiv="refresh" content="3">"# };
    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">{refresh}<title>WhatsApp</title></head>\
         <body style=\"font-family: Arial, sans-serif; text-align: center; padding: 40px\">{body}<p>{}</p></body></html>",
        message.replace('>', "&gt;")
    ))
    .into_response()
}

/// Pairing code as an inline SVG.
fn qr_svg(code: &str) -> Result<String, qrcode::types::QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    Ok(qr
        .render::<svg::Color>()
        .min_dimensions(300, 300)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

async fn status(State(state): State<AppState>) -> Response {
    Json(state.supervisor.status()).into_response()
}

async fn send_message(State(state): State<AppState>, Json(body): Json<SendBody>) -> Response {
    let numero = body.numero.filter(|s| !s.trim().is_empty());
    let mensaje = body.mensaje.filter(|s| !s.is_empty());
    let (Some(numero), Some(mensaje)) = (numero, mensaje) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Se requiere número y mensaje" })),
        )
            .into_response();
    };
    match state.supervisor.send_text(&numero, &mensaje).await {
        Ok(delivery) => Json(json!({
            "success": true,
            "data": {
                "success": true,
                "messageId": delivery.message_id,
                "numeroDestino": numero,
                "chat": delivery.chat,
                "mensaje": "Mensaje enviado correctamente",
            },
        }))
        .into_response(),
        Err(e) => {
            warn!("send to {} failed: {:#}", numero, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string(), "connected": state.supervisor.is_connected() })),
            )
                .into_response()
        }
    }
}

async fn reset(State(state): State<AppState>) -> Response {
    info!("manual reset requested");
    if state.commands.send(Command::Reset).await.is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": "supervisor not running" })),
        )
            .into_response();
    }
    Json(json!({ "success": true, "message": "Sesión reseteada. Nuevo QR generándose en /qr" })).into_response()
}

async fn cleanup(State(state): State<AppState>) -> Response {
    info!("manual cleanup requested");
    let sup = state.supervisor.clone();
    match tokio::task::spawn_blocking(move || sup.cleanup()).await {
        Ok(report) => Json(json!({
            "success": true,
            "message": "Limpieza completada",
            "sessionSize": report.session_size,
            "removed": report.removed,
            "sessionWiped": report.session_wiped,
        }))
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, BridgeEvent};
    use anyhow::Result;
    use async_trait::async_trait;
    use remind_core::cfg::GatewayCfg;
    use remind_core::reconnect::ReconnectPolicy;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::sync::watch;

    /// Bridge that reports `on_connect` as soon as a session opens.
    struct ScriptedBridge {
        on_connect: BridgeEvent,
    }

    #[async_trait]
    impl Bridge for ScriptedBridge {
        async fn connect(&self, events: UnboundedSender<BridgeEvent>) -> Result<()> {
            let _ = events.send(self.on_connect.clone());
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn send(&self, _jid: &str, _text: &str) -> Result<Option<String>> {
            Ok(Some("3EB0ABC".into()))
        }
    }

    async fn spawn_gateway(on_connect: BridgeEvent) -> (String, tempfile::TempDir, watch::Sender<bool>) {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(ScriptedBridge { on_connect });
        let sup = Arc::new(Supervisor::new(bridge, ReconnectPolicy::default(), &GatewayCfg::default(), dir.path(), "591"));
        let (commands, rx) = mpsc::channel(4);
        let (sd_tx, sd_rx) = watch::channel(false);
        tokio::spawn(sup.clone().run(rx, sd_rx));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(AppState { supervisor: sup.clone(), commands });
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        for _ in 0..100 {
            if sup.pairing_code().is_some() || sup.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (format!("http://{addr}"), dir, sd_tx)
    }

    #[tokio::test]
    async fn qr_page_renders_the_pairing_code() {
        let (base, _dir, _sd) = spawn_gateway(BridgeEvent::PairingCode("2@pairing-code".into())).await;
        let http = reqwest::Client::new();

        let page = http.get(format!("{base}/qr")).send().await.unwrap();
        assert_eq!(page.status(), 200);
        assert!(page.headers()["content-type"].to_str().unwrap().starts_with("text/html"));
        let html = page.text().await.unwrap();
        assert!(html.contains("<svg"));
        assert!(html.contains(r#"http-equiv="refresh""#));

        let raw: Value = http.get(format!("{base}/qr?format=json")).send().await.unwrap().json().await.unwrap();
        assert_eq!(raw["qr"], "2@pairing-code");
        assert_eq!(raw["connected"], false);

        let refused = http
            .post(format!("{base}/enviar-mensaje"))
            .json(&json!({ "numero": "70123456", "mensaje": "hola" }))
            .send()
            .await
            .unwrap();
        assert_eq!(refused.status(), 500);
        let body: Value = refused.json().await.unwrap();
        assert_eq!(body["connected"], false);
    }

    #[tokio::test]
    async fn confirmed_send_reports_the_message_id() {
        let (base, _dir, _sd) = spawn_gateway(BridgeEvent::Open { phone: Some("59170000000".into()) }).await;
        let http = reqwest::Client::new();

        let missing = http.post(format!("{base}/enviar-mensaje")).json(&json!({ "numero": "70123456" })).send().await.unwrap();
        assert_eq!(missing.status(), 400);

        let sent: Value = http
            .post(format!("{base}/enviar-mensaje"))
            .json(&json!({ "numero": "70123456", "mensaje": "hola" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sent["success"], true);
        assert_eq!(sent["data"]["messageId"], "3EB0ABC");
        assert_eq!(sent["data"]["chat"], "59170123456@s.whatsapp.net");

        let page = http.get(format!("{base}/qr")).send().await.unwrap().text().await.unwrap();
        assert!(!page.contains("<svg"));
        assert!(page.contains("WhatsApp conectado"));
    }
}
