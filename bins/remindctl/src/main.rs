use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use remind_core::cfg::{self, AppId};
use remind_core::logx;
use remind_core::members::{Member, MemberRegistry};
use remind_core::persist::{history, ConfigStore, KvConfigStore};
use remind_core::reconnect::{DisconnectReason, ReconnectPolicy, ReconnectState};
use remind_core::schedule::{next_occurrence, Countdown, Feature, ScheduleConfig, TimeOfDay};
use remind_core::store::open_default;
use tracing::{debug, info};

const APP: AppId = AppId {
    qualifier: "bo",
    organization: "sanmartin",
    application: "recordatorio",
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Operator tool for the reminder daemon")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Time left until HH:MM.
    Countdown {
        #[arg(long)]
        hour: u32,
        #[arg(long)]
        minute: u32,
        /// Reference time, `YYYY-MM-DDTHH:MM:SS` (defaults to now).
        #[arg(long)]
        from: Option<NaiveDateTime>,
    },
    #[command(subcommand)]
    Config(ConfigCmd),
    #[command(subcommand)]
    Members(MembersCmd),
    /// Last dispatch outcomes of a feature area.
    History { feature: Feature },
    /// Reconnect plan for consecutive transient failures.
    Backoff {
        #[arg(long, default_value_t = 3)]
        failures: u32,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    Show { feature: Feature },
    Set {
        feature: Feature,
        #[arg(long)]
        hour: Option<u32>,
        #[arg(long)]
        minute: Option<u32>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        lead_days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum MembersCmd {
    List,
    /// Import a JSON array of members (replaces entries with the same id).
    Import { file: PathBuf },
}

fn print_config(feature: Feature, c: &ScheduleConfig) {
    println!(
        "{} {} enabled={} lead_days={} modified_by={}",
        feature,
        c.formatted_time(),
        c.enabled,
        c.lead_days,
        c.modified_by.as_deref().unwrap_or("-")
    );
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match cli.config.as_deref() {
        Some(p) => cfg::load_or_init_at(p)?,
        None => cfg::load_or_init(&APP)?,
    };
    logx::init_stderr(logx::level_for(cli.verbose, &cfg.log_level));

    match cli.cmd {
        Command::Countdown { hour, minute, from } => {
            let tod = TimeOfDay::new(hour, minute)?;
            let now = from.unwrap_or_else(|| Local::now().naive_local());
            println!("next={} in {}", next_occurrence(now, tod), Countdown::until(now, tod));
        }
        Command::Backoff { failures } => {
            let mut state = ReconnectState::new(ReconnectPolicy::from(&cfg.reconnect));
            for n in 1..=failures {
                state.begin_connect()?;
                let plan = state.on_disconnect(DisconnectReason::ConnectionLost);
                if plan.wipe_session {
                    println!("failure {n}: wipe session, new pairing in {:?}", plan.delay);
                } else {
                    println!("failure {n}: retry {} in {:?}", plan.attempt, plan.delay);
                }
            }
        }
        cmd => {
            let data = cfg::data_dir(&APP, &cfg, cli.data_dir.as_deref())?;
            debug!("data dir {}", data.display());
            let kv = open_default(&data).with_context(|| format!("open kv at {}", data.display()))?;
            match cmd {
                Command::Config(ConfigCmd::Show { feature }) => {
                    let c = KvConfigStore::new(kv).load_config(feature)?;
                    print_config(feature, &c);
                }
                Command::Config(ConfigCmd::Set { feature, hour, minute, enabled, lead_days }) => {
                    let store = KvConfigStore::new(kv);
                    let current = store.load_config(feature)?;
                    let next = ScheduleConfig {
                        target_hour: hour.unwrap_or(current.target_hour),
                        target_minute: minute.unwrap_or(current.target_minute),
                        enabled: enabled.unwrap_or(current.enabled),
                        lead_days: lead_days.unwrap_or(current.lead_days),
                        ..current
                    };
                    next.validate()?;
                    let saved = store.save_config(feature, next, "remindctl")?;
                    info!("{} schedule updated", feature);
                    print_config(feature, &saved);
                    println!("restart the daemon or PUT /schedules/{feature} to apply");
                }
                Command::Members(MembersCmd::List) => {
                    for m in MemberRegistry::new(kv).list()? {
                        println!(
                            "{}\t{}\t{}\t{}\tdue={}\tbirthday={}\tpending={}.{:02}{}",
                            m.id,
                            m.member_no,
                            m.full_name,
                            m.phone,
                            m.due_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                            m.birthday.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                            m.pending_cents / 100,
                            m.pending_cents % 100,
                            if m.active { "" } else { "\tinactive" }
                        );
                    }
                }
                Command::Members(MembersCmd::Import { file }) => {
                    let txt = fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?;
                    let members: Vec<Member> =
                        serde_json::from_str(&txt).with_context(|| format!("parse {}", file.display()))?;
                    let reg = MemberRegistry::new(kv);
                    for m in &members {
                        reg.upsert(m)?;
                    }
                    println!("imported {} members", members.len());
                }
                Command::History { feature } => {
                    let entries = history(&kv, feature)?;
                    if entries.is_empty() {
                        println!("no dispatches recorded for {feature}");
                    }
                    for o in entries {
                        println!(
                            "{} attempted={} ok={} failed={} skipped={}",
                            o.timestamp_ms, o.attempted_count, o.succeeded_count, o.failed_count, o.skipped_count
                        );
                    }
                }
                Command::Countdown { .. } | Command::Backoff { .. } => {}
            }
        }
    }
    Ok(())
}
