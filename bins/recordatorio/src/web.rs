#![cfg(feature = "web-api")]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::info;

use remind_core::dispatch::{DispatchReport, SendStatus};
use remind_core::members::{Member, MemberRegistry};
use remind_core::persist::{history, ConfigStore, KvConfigStore};
use remind_core::reports;
use remind_core::schedule::{Feature, ScheduleConfig};
use remind_core::scheduler::{MonitorState, Scheduler};
use remind_core::store::DefaultKv;
use remind_core::transport::{MessagingTransport, TransportBulkSender};
use crate::module::{Module, ModuleCtx};

pub type Senders = Arc<HashMap<Feature, Arc<TransportBulkSender>>>;

/// One lock per feature, held from save to apply so the running timers
/// always match the last stored config.
type ApplyLocks = Arc<HashMap<Feature, TokioMutex<()>>>;

#[derive(Clone)]
struct AppState {
    kv: DefaultKv,
    configs: KvConfigStore,
    scheduler: Arc<Scheduler>,
    senders: Senders,
    transport: Arc<dyn MessagingTransport>,
    apply_locks: ApplyLocks,
    started: Instant,
}

impl AppState {
    fn new(
        kv: DefaultKv,
        configs: KvConfigStore,
        scheduler: Arc<Scheduler>,
        senders: Senders,
        transport: Arc<dyn MessagingTransport>,
    ) -> Self {
        let apply_locks = Feature::ALL.into_iter().map(|f| (f, TokioMutex::new(()))).collect();
        Self {
            kv,
            configs,
            scheduler,
            senders,
            transport,
            apply_locks: Arc::new(apply_locks),
            started: Instant::now(),
        }
    }

    fn lead_days(&self, feature: Feature) -> u32 {
        self.scheduler
            .config(feature)
            .or_else(|| self.configs.load_config(feature).ok())
            .map(|c| c.lead_days)
            .unwrap_or_else(|| ScheduleConfig::default_for(feature).lead_days)
    }
}

#[derive(Deserialize)]
struct ActiveUpdate {
    active: bool,
}

#[derive(Deserialize)]
struct Range {
    from: NaiveDate,
    to: NaiveDate,
    #[serde(default)]
    status: Option<SendStatus>,
}

#[derive(Serialize)]
struct ScheduleView {
    feature: Feature,
    state: MonitorState,
    config: ScheduleConfig,
    countdown: Option<String>,
}

#[derive(Deserialize)]
struct ScheduleUpdate {
    target_hour: u32,
    target_minute: u32,
    enabled: bool,
    #[serde(default)]
    lead_days: Option<u32>,
    #[serde(default)]
    modified_by: Option<String>,
}

pub struct WebServer {
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub tls_cert_pem: Option<String>,
    pub tls_key_pem: Option<String>,
    pub senders: Senders,
    pub transport: Arc<dyn MessagingTransport>,
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let state = AppState::new(
                ctx.kv.clone(),
                ctx.configs.clone(),
                ctx.scheduler.clone(),
                self.senders.clone(),
                self.transport.clone(),
            );
            let app = router(state);

            let mut servers = Vec::<tokio::task::JoinHandle<anyhow::Result<()>>>::new();

            if let Some(addr) = self.http_addr {
                info!("control plane listening on http://{}", addr);
                let app_clone = app.clone();
                let mut sd = ctx.shutdown.clone();
                servers.push(tokio::spawn(async move {
                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    axum::serve(listener, app_clone)
                        .with_graceful_shutdown(async move {
                            let _ = sd.changed().await;
                        })
                        .await?;
                    Ok(())
                }));
            }

            if let (Some(addr), Some(cert), Some(key)) = (self.https_addr, self.tls_cert_pem.clone(), self.tls_key_pem.clone()) {
                info!("control plane listening on https://{}", addr);
                let app_clone = app.clone();
                let mut sd = ctx.shutdown.clone();
                servers.push(tokio::spawn(async move {
                    let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
                    let serve_fut = axum_server::bind_rustls(addr, config).serve(app_clone.into_make_service());
                    tokio::select! {
                        r = serve_fut => { r?; }
                        _ = sd.changed() => {}
                    }
                    Ok(())
                }));
            }

            for s in servers { s.await??; }
            Ok(())
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/schedules", get(schedules_list))
        .route("/schedules/:feature", get(schedule_get).put(schedule_put))
        .route("/schedules/:feature/run", post(schedule_run))
        .route("/schedules/:feature/countdown", get(schedule_countdown))
        .route("/schedules/:feature/upcoming", get(schedule_upcoming))
        .route("/history/:feature", get(history_list))
        .route("/members", get(members_list).post(members_upsert))
        .route("/members/:id", delete(members_delete))
        .route("/members/:id/active", patch(members_set_active))
        .route("/members/:id/history", get(members_history))
        .route("/members/:id/send/:feature", post(members_send))
        .route("/reports/sends", get(reports_sends))
        .route("/reports/daily", get(reports_daily))
        .route("/reports/summary", get(reports_summary))
        .with_state(state)
}

fn feature_or_404(raw: &str) -> Result<Feature, Response> {
    raw.parse::<Feature>().map_err(|e| (StatusCode::NOT_FOUND, e).into_response())
}

fn internal(e: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn view(state: &AppState, feature: Feature) -> anyhow::Result<ScheduleView> {
    let config = match state.scheduler.config(feature) {
        Some(c) => c,
        None => state.configs.load_config(feature)?,
    };
    Ok(ScheduleView {
        feature,
        state: state.scheduler.state(feature),
        config,
        countdown: state.scheduler.countdown(feature).map(|c| c.to_string()),
    })
}

async fn status(State(state): State<AppState>) -> Response {
    let connected = state.transport.is_connected().await;
    let schedules: Vec<ScheduleView> = Feature::ALL.iter().filter_map(|f| view(&state, *f).ok()).collect();
    Json(json!({
        "uptime_ms": state.started.elapsed().as_millis() as u64,
        "gateway_connected": connected,
        "active_timers": state.scheduler.active_timer_count(),
        "schedules": schedules,
    }))
    .into_response()
}

async fn schedules_list(State(state): State<AppState>) -> Response {
    let mut out = Vec::new();
    for f in Feature::ALL {
        match view(&state, f) {
            Ok(v) => out.push(v),
            Err(e) => return internal(format!("{e:#}")),
        }
    }
    Json(out).into_response()
}

async fn schedule_get(Path(feature): Path<String>, State(state): State<AppState>) -> Response {
    let feature = match feature_or_404(&feature) { Ok(f) => f, Err(r) => return r };
    match view(&state, feature) {
        Ok(v) => Json(v).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn schedule_put(
    Path(feature): Path<String>,
    State(state): State<AppState>,
    Json(update): Json<ScheduleUpdate>,
) -> Response {
    let feature = match feature_or_404(&feature) { Ok(f) => f, Err(r) => return r };
    let _serial = match state.apply_locks.get(&feature) {
        Some(m) => m.lock().await,
        None => return internal(format!("no lock for {feature}")),
    };
    let current = match state.configs.load_config(feature) {
        Ok(c) => c,
        Err(e) => return internal(format!("{e:#}")),
    };
    let cfg = ScheduleConfig {
        target_hour: update.target_hour,
        target_minute: update.target_minute,
        enabled: update.enabled,
        lead_days: update.lead_days.unwrap_or(current.lead_days),
        ..current
    };
    if let Err(e) = cfg.validate() {
        return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response();
    }
    let by = update.modified_by.as_deref().unwrap_or("api");
    let saved = match state.configs.save_config(feature, cfg, by) {
        Ok(c) => c,
        Err(e) => return internal(format!("{e:#}")),
    };
    match state.scheduler.apply(feature, saved.clone()) {
        Ok(st) => Json(json!({ "config": saved, "state": st })).into_response(),
        Err(e) => internal(e),
    }
}

async fn schedule_run(Path(feature): Path<String>, State(state): State<AppState>) -> Response {
    let feature = match feature_or_404(&feature) { Ok(f) => f, Err(r) => return r };
    match state.scheduler.run_now(feature).await {
        Ok(report) => {
            let code = match &report {
                DispatchReport::Completed { .. } => StatusCode::OK,
                DispatchReport::Failed { .. } => StatusCode::BAD_GATEWAY,
                DispatchReport::Skipped => StatusCode::CONFLICT,
            };
            (code, Json(report)).into_response()
        }
        Err(e) => internal(e),
    }
}

async fn schedule_countdown(Path(feature): Path<String>, State(state): State<AppState>) -> Response {
    let feature = match feature_or_404(&feature) { Ok(f) => f, Err(r) => return r };
    let countdown = state.scheduler.countdown(feature);
    Json(json!({
        "feature": feature,
        "countdown": countdown,
        "display": countdown.map(|c| c.to_string()),
    }))
    .into_response()
}

async fn history_list(Path(feature): Path<String>, State(state): State<AppState>) -> Response {
    let feature = match feature_or_404(&feature) { Ok(f) => f, Err(r) => return r };
    match history(&state.kv, feature) {
        Ok(h) => Json(h).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn members_list(State(state): State<AppState>) -> Response {
    match MemberRegistry::new(state.kv.clone()).list() {
        Ok(m) => Json(m).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn members_upsert(State(state): State<AppState>, Json(member): Json<Member>) -> Response {
    match MemberRegistry::new(state.kv.clone()).upsert(&member) {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "ok": true, "id": member.id }))).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn members_delete(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match MemberRegistry::new(state.kv.clone()).remove(&id) {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn members_send(Path((id, feature)): Path<(String, String)>, State(state): State<AppState>) -> Response {
    let feature = match feature_or_404(&feature) { Ok(f) => f, Err(r) => return r };
    let Some(sender) = state.senders.get(&feature) else {
        return (StatusCode::NOT_FOUND, "no sender for feature").into_response();
    };
    let result = sender.send_one(&id, state.lead_days(feature)).await;
    let code = if result.success { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
    (code, Json(result)).into_response()
}

async fn schedule_upcoming(Path(feature): Path<String>, State(state): State<AppState>) -> Response {
    let feature = match feature_or_404(&feature) { Ok(f) => f, Err(r) => return r };
    let Some(sender) = state.senders.get(&feature) else {
        return (StatusCode::NOT_FOUND, "no sender for feature").into_response();
    };
    let lead_days = state.lead_days(feature);
    match sender.upcoming(lead_days) {
        Ok(members) => Json(json!({
            "feature": feature,
            "lead_days": lead_days,
            "count": members.len(),
            "members": members,
        }))
        .into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn members_set_active(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(update): Json<ActiveUpdate>,
) -> Response {
    match MemberRegistry::new(state.kv.clone()).set_active(&id, update.active) {
        Ok(Some(m)) => {
            info!("member {} active={}", id, m.active);
            Json(m).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, format!("member {id} not found")).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn members_history(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match MemberRegistry::new(state.kv.clone()).get(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, format!("member {id} not found")).into_response(),
        Err(e) => return internal(format!("{e:#}")),
    }
    match reports::member_sends(&state.kv, &id) {
        Ok(h) => Json(h).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

fn check_range(r: &Range) -> Result<(), Response> {
    if r.from > r.to {
        return Err((StatusCode::BAD_REQUEST, "`from` is after `to`").into_response());
    }
    Ok(())
}

async fn reports_sends(State(state): State<AppState>, Query(range): Query<Range>) -> Response {
    if let Err(r) = check_range(&range) { return r; }
    match reports::sends_between(&state.kv, range.from, range.to, range.status) {
        Ok(list) => Json(list).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn reports_daily(State(state): State<AppState>, Query(range): Query<Range>) -> Response {
    if let Err(r) = check_range(&range) { return r; }
    match reports::daily_stats(&state.kv, range.from, range.to) {
        Ok(days) => Json(days).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn reports_summary(State(state): State<AppState>) -> Response {
    match reports::summary(&state.kv) {
        Ok(s) => Json(s).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}
