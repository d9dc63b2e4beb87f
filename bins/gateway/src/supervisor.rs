//! Connection supervisor for the messaging gateway.
//!
//! Owns the pairing session folder and the single bridge connection. Bridge
//! events are fed to [`ReconnectState`]; the returned plan decides whether
//! the session folder is wiped and when the next attempt runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use remind_core::cfg::GatewayCfg;
use remind_core::members::normalize_phone;
use remind_core::reconnect::{ConnectionPhase, DisconnectReason, ReconnectPlan, ReconnectPolicy, ReconnectState};
use serde::Serialize;
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeEvent};

pub const NOT_CONNECTED: &str =
    "WhatsApp no está conectado. Por favor escanea el código QR en /qr";

/// Operator commands handled on the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Wipe the session and pair again.
    Reset,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub connected: bool,
    pub connecting: bool,
    #[serde(rename = "hasQR")]
    pub has_qr: bool,
    pub session_size: String,
    pub reconnect_attempts: u32,
    pub phone: Option<String>,
    pub message: String,
}

/// A send the bridge confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub chat: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub session_wiped: bool,
    pub session_size: String,
}

struct Shared {
    reconnect: ReconnectState,
    pairing_code: Option<String>,
    phone: Option<String>,
}

pub struct Supervisor {
    bridge: Arc<dyn Bridge>,
    shared: Mutex<Shared>,
    session_dir: PathBuf,
    temp_dirs: Vec<PathBuf>,
    size_limit: u64,
    cleanup_every: Duration,
    country_prefix: String,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    /// Session and temp folders are resolved under `root`.
    pub fn new(
        bridge: Arc<dyn Bridge>,
        policy: ReconnectPolicy,
        cfg: &GatewayCfg,
        root: &Path,
        country_prefix: &str,
    ) -> Self {
        Self {
            bridge,
            shared: Mutex::new(Shared { reconnect: ReconnectState::new(policy), pairing_code: None, phone: None }),
            session_dir: root.join(&cfg.session_dir),
            temp_dirs: cfg.temp_dirs.iter().map(|d| root.join(d)).collect(),
            size_limit: cfg.session_size_limit_bytes,
            cleanup_every: Duration::from_secs(cfg.cleanup_every_secs.max(1)),
            country_prefix: country_prefix.to_string(),
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).reconnect.phase() == ConnectionPhase::Connected
    }

    pub fn pairing_code(&self) -> Option<String> {
        lock(&self.shared).pairing_code.clone()
    }

    pub fn status(&self) -> StatusView {
        let (phase, has_qr, attempts, phone) = {
            let s = lock(&self.shared);
            (s.reconnect.phase(), s.pairing_code.is_some(), s.reconnect.retry_count(), s.phone.clone())
        };
        let connected = phase == ConnectionPhase::Connected;
        let connecting = matches!(phase, ConnectionPhase::Connecting | ConnectionPhase::AwaitingScan);
        StatusView {
            connected,
            connecting,
            has_qr,
            session_size: human_size(dir_size(&self.session_dir)),
            reconnect_attempts: attempts,
            phone: if connected { phone } else { None },
            message: if connected {
                "WhatsApp conectado"
            } else if connecting {
                "Conectando..."
            } else {
                "No conectado"
            }
            .to_string(),
        }
    }

    /// Send one text and wait for the bridge to confirm it. Fails fast when
    /// the session is not open.
    pub async fn send_text(&self, numero: &str, mensaje: &str) -> Result<Delivery> {
        if !self.is_connected() {
            bail!(NOT_CONNECTED);
        }
        let digits = normalize_phone(numero, &self.country_prefix)
            .ok_or_else(|| anyhow!("número inválido: {numero}"))?;
        let jid = format!("{digits}@s.whatsapp.net");
        let message_id = self.bridge.send(&jid, mensaje).await?;
        info!("message sent to {} id={}", numero, message_id.as_deref().unwrap_or("-"));
        Ok(Delivery { chat: jid, message_id })
    }

    /// Remove the session folder. Returns whether anything was removed.
    pub fn wipe_session(&self) -> bool {
        if !self.session_dir.exists() {
            return false;
        }
        match fs::remove_dir_all(&self.session_dir) {
            Ok(()) => {
                info!("session folder {} removed", self.session_dir.display());
                true
            }
            Err(e) => {
                warn!("could not remove session folder {}: {}", self.session_dir.display(), e);
                false
            }
        }
    }

    /// Remove temp folders, and the session folder too when it outgrew the
    /// limit while disconnected.
    pub fn cleanup(&self) -> CleanupReport {
        let mut removed = Vec::new();
        for dir in &self.temp_dirs {
            if !dir.exists() {
                continue;
            }
            let size = dir_size(dir);
            match fs::remove_dir_all(dir) {
                Ok(()) => {
                    info!("removed {} ({})", dir.display(), human_size(size));
                    removed.push(dir.display().to_string());
                }
                Err(e) => warn!("could not remove {}: {}", dir.display(), e),
            }
        }

        let size = dir_size(&self.session_dir);
        debug!("session size {}", human_size(size));
        let mut session_wiped = false;
        if size > self.size_limit && !self.is_connected() {
            warn!("session folder is {} (limit {}), wiping", human_size(size), human_size(self.size_limit));
            session_wiped = self.wipe_session();
        }
        CleanupReport { removed, session_wiped, session_size: human_size(dir_size(&self.session_dir)) }
    }

    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (events_tx, mut events) = unbounded_channel();
        let mut next: Option<Instant> = Some(Instant::now());
        let mut cleanup = interval_at(Instant::now() + self.cleanup_every, self.cleanup_every);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let due = next;
            tokio::select! {
                _ = async move {
                    match due {
                        Some(t) => sleep_until(t).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    next = self.attempt(&events_tx).await.map(|plan| Instant::now() + plan.delay);
                }
                Some(ev) = events.recv() => {
                    if let Some(plan) = self.on_event(ev) {
                        next = Some(Instant::now() + plan.delay);
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Reset) => {
                        let plan = self.reset().await;
                        next = Some(Instant::now() + plan.delay);
                    }
                    None => break,
                },
                _ = cleanup.tick() => {
                    self.cleanup();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("gateway supervisor stopping");
                        break;
                    }
                }
            }
        }
        self.bridge.disconnect().await;
        Ok(())
    }

    async fn attempt(&self, events: &UnboundedSender<BridgeEvent>) -> Option<ReconnectPlan> {
        let claimed = lock(&self.shared).reconnect.begin_connect();
        if let Err(e) = claimed {
            debug!("{}", e);
            return None;
        }
        info!("connecting to bridge");
        match self.bridge.connect(events.clone()).await {
            Ok(()) => None,
            Err(e) => {
                warn!("bridge unreachable: {:#}", e);
                Some(self.on_disconnect(DisconnectReason::TimedOut))
            }
        }
    }

    fn on_event(&self, ev: BridgeEvent) -> Option<ReconnectPlan> {
        match ev {
            BridgeEvent::PairingCode(code) => {
                let mut s = lock(&self.shared);
                s.reconnect.on_pairing_code();
                s.pairing_code = Some(code);
                info!("pairing code ready, scan it from /qr");
                None
            }
            BridgeEvent::Open { phone } => {
                let mut s = lock(&self.shared);
                s.reconnect.on_connected();
                s.pairing_code = None;
                info!("WhatsApp connected phone={}", phone.as_deref().unwrap_or("-"));
                s.phone = phone;
                None
            }
            BridgeEvent::Closed { status } => Some(self.on_disconnect(DisconnectReason::from_status_code(status))),
        }
    }

    fn on_disconnect(&self, reason: DisconnectReason) -> ReconnectPlan {
        let plan = {
            let mut s = lock(&self.shared);
            s.pairing_code = None;
            s.phone = None;
            s.reconnect.on_disconnect(reason)
        };
        if plan.wipe_session {
            self.wipe_session();
        }
        plan
    }

    async fn reset(&self) -> ReconnectPlan {
        self.bridge.disconnect().await;
        let plan = {
            let mut s = lock(&self.shared);
            s.pairing_code = None;
            s.phone = None;
            s.reconnect.force_reset()
        };
        self.wipe_session();
        info!("manual reset, new pairing in {:?}", plan.delay);
        plan
    }
}

/// Total size of the files under `path`; 0 when it does not exist.
pub fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else { return 0 };
    entries
        .flatten()
        .map(|e| match e.metadata() {
            Ok(m) if m.is_dir() => dir_size(&e.path()),
            Ok(m) => m.len(),
            Err(_) => 0,
        })
        .sum()
}

/// `1536` -> `"1.5 KB"`, base 1024, two decimals at most.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut i = 0;
    while i + 1 < UNITS.len() && bytes >= 1024u64.pow(i as u32 + 1) {
        i += 1;
    }
    let value = (bytes as f64 / 1024f64.powi(i as i32) * 100.0).round() / 100.0;
    format!("{} {}", value, UNITS[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBridge {
        unreachable: AtomicBool,
        connects: AtomicUsize,
        events: Mutex<Option<UnboundedSender<BridgeEvent>>>,
        sent: Mutex<Vec<(String, String)>>,
        refuse: AtomicBool,
    }

    impl FakeBridge {
        fn push(&self, ev: BridgeEvent) {
            lock(&self.events).as_ref().unwrap().send(ev).unwrap();
        }
    }

    #[async_trait]
    impl Bridge for FakeBridge {
        async fn connect(&self, events: UnboundedSender<BridgeEvent>) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            *lock(&self.events) = Some(events);
            Ok(())
        }
        async fn disconnect(&self) {
            lock(&self.events).take();
        }
        async fn send(&self, jid: &str, text: &str) -> Result<Option<String>> {
            if self.refuse.load(Ordering::SeqCst) {
                bail!("no confirmation from bridge after 30s");
            }
            let mut sent = lock(&self.sent);
            sent.push((jid.to_string(), text.to_string()));
            Ok(Some(format!("MSG{}", sent.len())))
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        bridge: Arc<FakeBridge>,
        sup: Arc<Supervisor>,
        commands: mpsc::Sender<Command>,
        _shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn session(&self) -> PathBuf {
            self.dir.path().join("auth_info_baileys")
        }
    }

    fn start(bridge: FakeBridge, cfg: GatewayCfg) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("auth_info_baileys")).unwrap();
        fs::write(dir.path().join("auth_info_baileys/creds.json"), vec![b'x'; 2048]).unwrap();
        let bridge = Arc::new(bridge);
        let sup = Arc::new(Supervisor::new(bridge.clone(), ReconnectPolicy::default(), &cfg, dir.path(), "591"));
        let (commands, rx) = mpsc::channel(4);
        let (tx, shutdown) = watch::channel(false);
        tokio::spawn(sup.clone().run(rx, shutdown));
        Harness { dir, bridge, sup, commands, _shutdown: tx }
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_wipes_session_and_pairs_again() {
        let h = start(FakeBridge::default(), GatewayCfg::default());
        settle(10).await;
        assert_eq!(h.bridge.connects.load(Ordering::SeqCst), 1);

        h.bridge.push(BridgeEvent::PairingCode("2@abc".into()));
        settle(10).await;
        let st = h.sup.status();
        assert!(st.has_qr && st.connecting && !st.connected);
        assert_eq!(h.sup.pairing_code().as_deref(), Some("2@abc"));

        h.bridge.push(BridgeEvent::Open { phone: Some("59170000000".into()) });
        settle(10).await;
        let st = h.sup.status();
        assert!(st.connected && !st.has_qr);
        assert_eq!(st.message, "WhatsApp conectado");
        assert_eq!(st.session_size, "2 KB");

        h.bridge.push(BridgeEvent::Closed { status: 401 });
        settle(10).await;
        assert!(!h.session().exists());
        assert!(!h.sup.status().connected);

        settle(2_100).await;
        assert_eq!(h.bridge.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_bridge_backs_off_then_forces_pairing() {
        let bridge = FakeBridge::default();
        bridge.unreachable.store(true, Ordering::SeqCst);
        let h = start(bridge, GatewayCfg::default());

        settle(10).await;
        assert_eq!(h.sup.status().reconnect_attempts, 1);
        assert!(h.session().exists());

        settle(3_000).await;
        assert_eq!(h.bridge.connects.load(Ordering::SeqCst), 2);
        assert_eq!(h.sup.status().reconnect_attempts, 2);

        settle(6_000).await;
        assert_eq!(h.bridge.connects.load(Ordering::SeqCst), 3);
        assert_eq!(h.sup.status().reconnect_attempts, 0);
        assert!(!h.session().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn send_fails_fast_until_connected() {
        let h = start(FakeBridge::default(), GatewayCfg::default());
        settle(10).await;

        let err = h.sup.send_text("7012-3456", "hola").await.unwrap_err();
        assert!(err.to_string().contains("no está conectado"));
        assert!(lock(&h.bridge.sent).is_empty());

        h.bridge.push(BridgeEvent::Open { phone: None });
        settle(10).await;
        let delivery = h.sup.send_text("7012-3456", "hola").await.unwrap();
        assert_eq!(delivery.chat, "59170123456@s.whatsapp.net");
        assert_eq!(delivery.message_id.as_deref(), Some("MSG1"));
        assert_eq!(lock(&h.bridge.sent).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_send_is_an_error() {
        let h = start(FakeBridge::default(), GatewayCfg::default());
        settle(10).await;
        h.bridge.push(BridgeEvent::Open { phone: None });
        settle(10).await;

        h.bridge.refuse.store(true, Ordering::SeqCst);
        let err = h.sup.send_text("70123456", "hola").await.unwrap_err();
        assert!(err.to_string().contains("no confirmation"));
        assert!(lock(&h.bridge.sent).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_wipes_and_reconnects_after_delay() {
        let h = start(FakeBridge::default(), GatewayCfg::default());
        settle(10).await;
        h.bridge.push(BridgeEvent::Open { phone: None });
        settle(10).await;

        h.commands.send(Command::Reset).await.unwrap();
        settle(10).await;
        assert!(!h.session().exists());
        assert!(!h.sup.is_connected());
        assert_eq!(h.bridge.connects.load(Ordering::SeqCst), 1);

        settle(1_000).await;
        assert_eq!(h.bridge.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_temp_dirs_and_oversized_session() {
        let cfg = GatewayCfg { session_size_limit_bytes: 1024, ..GatewayCfg::default() };
        let bridge = FakeBridge::default();
        bridge.unreachable.store(true, Ordering::SeqCst);
        let h = start(bridge, cfg);
        fs::create_dir_all(h.dir.path().join("temp/nested")).unwrap();
        fs::write(h.dir.path().join("temp/nested/a.bin"), b"abc").unwrap();

        let report = h.sup.cleanup();
        assert_eq!(report.removed.len(), 1);
        assert!(report.session_wiped);
        assert_eq!(report.session_size, "0 Bytes");
        assert!(!h.dir.path().join("temp").exists());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(0), "0 Bytes");
        assert_eq!(human_size(512), "512 Bytes");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(50 * 1024 * 1024), "50 MB");
    }
}
