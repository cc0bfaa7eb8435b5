// quietwatch/src/main.rs
//
// quietwatch: scheduled click-fraud detection for ad accounts
//
// Four operational modes:
//   detect   : one orchestrator run over every active account, then exit
//   baseline : one baseline calculation run (or just the --account ids), then exit
//   score    : compute (or serve cached) Quiet Index for accounts, then exit
//   daemon   : tail the click log and run detection, baselines, cooldown
//              purge and checkpointing on their own intervals
//
// Usage:
//   quietwatch --mode detect   --accounts accounts.json --events clicks.jsonl
//   quietwatch --mode score    --accounts accounts.json --events clicks.jsonl --account acme
//   quietwatch --mode daemon   --accounts accounts.json --events /var/log/clicks.jsonl

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod events;
mod rules;
mod state;
#[cfg(test)]
mod testutil;

use config::{AppConfig, MAX_WINDOW_HOURS};
use engine::baseline::{BaselineCalculator, BaselineOutcome};
use engine::cooldown::CooldownTracker;
use engine::dispatcher::Dispatcher;
use engine::metrics::DetectionMetrics;
use engine::orchestrator::{Orchestrator, RunSummary};
use engine::quiet_index::{QuietIndexReport, QuietIndexScorer};
use engine::Stores;
use events::{ClickEvent, QuietBand};
use state::checkpoint::Checkpoint;
use state::fixtures;
use state::memory::MemoryStore;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "quietwatch",
    about   = "Scheduled click-fraud detection and Quiet Index scoring",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "detect")]
    mode: Mode,

    #[arg(long, help = "JSON array of accounts (with optional detection profiles)")]
    accounts: PathBuf,

    #[arg(long, help = "Click events JSONL (loaded up front; tailed in daemon mode)")]
    events: Option<PathBuf>,

    #[arg(long, help = "JSON config file; defaults apply when omitted")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "/tmp/quietwatch_output",
          help = "Output directory (detections, alerts, job log, checkpoint)")]
    output: PathBuf,

    #[arg(long, help = "Account to score or rebuild a baseline for (repeatable; all accounts when omitted)")]
    account: Vec<String>,

    #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_WINDOW_HOURS),
          help = "Quiet Index window in hours (score mode)")]
    window_hours: Option<i64>,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Detect,   // one detection run
    Baseline, // one baseline run
    Score,    // Quiet Index
    Daemon,   // tail + scheduled jobs
}

// ── Runtime ───────────────────────────────────────────────────────────────────

struct Runtime {
    store:        Arc<MemoryStore>,
    config:       Arc<AppConfig>,
    dispatcher:   Arc<Dispatcher>,
    cooldowns:    Arc<CooldownTracker>,
    orchestrator: Arc<Orchestrator>,
    baselines:    BaselineCalculator,
    scorer:       QuietIndexScorer,
    checkpoint:   Arc<Checkpoint>,
}

impl Runtime {
    fn new(store: Arc<MemoryStore>, config: AppConfig, output: PathBuf) -> Result<Self> {
        let config     = Arc::new(config);
        let stores     = Stores::memory(&store);
        let dispatcher = Arc::new(Dispatcher::new(output)?);
        let cooldowns  = Arc::new(CooldownTracker::new(stores.cooldowns.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            stores.clone(),
            cooldowns.clone(),
            dispatcher.clone(),
            dispatcher.clone(),
            DetectionMetrics::new(),
            config.clone(),
        ));
        let checkpoint = Arc::new(Checkpoint::new(
            dispatcher.dir(),
            store.clone(),
            config.checkpoint_interval_secs,
        ));
        Ok(Self {
            baselines: BaselineCalculator::new(stores.clone(), dispatcher.clone()),
            scorer: QuietIndexScorer::new(stores, config.clone()),
            store,
            config,
            dispatcher,
            cooldowns,
            orchestrator,
            checkpoint,
        })
    }

    /// Detection run followed by a Quiet Index refresh and metrics write.
    async fn detect_once(&self) -> Result<RunSummary> {
        let summary = self.orchestrator.run(Utc::now()).await?;
        print_summary(&summary);

        match self.scorer.refresh_all(Utc::now()).await {
            Ok(reports) => {
                if let Err(e) = self.dispatcher.write_quiet_index(&reports).await {
                    warn!("Quiet Index output failed: {}", e);
                }
            }
            Err(e) => warn!("Quiet Index refresh failed: {}", e),
        }
        let metrics = self.orchestrator.metrics();
        debug!(totals = %metrics.snapshot(), "Metrics");
        if let Err(e) = self.dispatcher.write_metrics(metrics).await {
            warn!("Metrics output failed: {}", e);
        }
        Ok(summary)
    }

    /// Baselines for the named accounts only.
    async fn baseline_for(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            match self.baselines.compute_by_id(id, Utc::now()).await {
                Ok(BaselineOutcome::Computed { version, exited_learning }) => {
                    info!(account = %id, version, exited_learning, "Baseline computed");
                }
                Ok(BaselineOutcome::Skipped(reason)) => {
                    info!(account = %id, ?reason, "Baseline skipped");
                }
                Err(e) => error!(account = %id, "Baseline failed: {}", e),
            }
        }
        Ok(())
    }

    async fn baseline_once(&self) -> Result<()> {
        let s = self.baselines.run(Utc::now()).await?;
        info!(
            "Baselines: computed={} skipped={} failed={} exited_learning={}",
            s.computed, s.skipped, s.failed, s.exited_learning
        );
        Ok(())
    }

    async fn score(&self, ids: &[String], window_hours: i64) -> Result<()> {
        let ids: Vec<String> = if ids.is_empty() {
            self.store.account_ids()
        } else {
            ids.to_vec()
        };

        let mut reports = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.scorer.score(id, window_hours, Utc::now()).await {
                Ok(r) => {
                    print_report(&r);
                    reports.push(r);
                }
                Err(e) => error!(account = %id, "Quiet Index failed: {}", e),
            }
        }
        self.dispatcher.write_quiet_index(&reports).await?;

        if ids.len() > 1 {
            println!("\n\x1b[1m── ranking (worst first) ──\x1b[0m");
            for r in self.scorer.compare(&ids).await? {
                println!("  {:>3}  {}", r.score, r.account_id);
            }
        }
        Ok(())
    }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_summary(s: &RunSummary) {
    let color = if s.accounts_failed > 0 { "\x1b[93;1m" } else { "\x1b[92m" };
    println!(
        "{}── run  accounts={}/{}  failed={}  detections={}  suppressed={}  rule_failures={}  {}ms ──\x1b[0m",
        color,
        s.accounts_processed,
        s.accounts_total,
        s.accounts_failed,
        s.detections_created,
        s.suppressed,
        s.rule_failures,
        s.duration_ms,
    );
}

fn print_report(r: &QuietIndexReport) {
    let color = match r.band {
        QuietBand::Excellent => "\x1b[92m",
        QuietBand::Good      => "\x1b[96m",
        QuietBand::Warning   => "\x1b[93m",
        QuietBand::Poor      => "\x1b[91m",
        QuietBand::Critical  => "\x1b[91;1m",
    };
    let reset = "\x1b[0m";
    let trend = r.trend.map(|t| format!(" ({})", t)).unwrap_or_default();
    let cached = if r.cached { " \x1b[90m[cached]\x1b[0m" } else { "" };

    println!("\n{}{} {}{}{}{}", color, r.record.account_id, r.record.score, trend, reset, cached);
    println!("  Band    : {}{}{}", color, r.band, reset);
    println!("  Clicks  : {} total, {} clean, {} fraud", r.record.total_clicks, r.record.clean_clicks, r.record.fraud_clicks);
    println!("  Message : {}", r.message);
}

async fn print_stats_loop(store: Arc<MemoryStore>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let events  = store.total_events.load(std::sync::atomic::Ordering::Relaxed);
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  events={}  accounts={}  detections={} ──\x1b[0m",
            elapsed, events, store.n_accounts(), store.n_detections()
        );
    }
}

// ── Event source ──────────────────────────────────────────────────────────────

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<ClickEvent>, seek_end: bool) -> Result<()> {
    let file   = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {}  // already loaded
    }

    info!("Tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                if let Some(ev) = fixtures::parse_event_line(&line) {
                    if tx.send(ev).await.is_err() { break; }
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(200)).await,
        }
    }
    Ok(())
}

// ── Scheduled jobs ────────────────────────────────────────────────────────────

async fn detection_loop(rt: Arc<Runtime>) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(rt.config.detection_interval_secs.max(1)));
    loop {
        tick.tick().await;
        if let Err(e) = rt.detect_once().await {
            error!("Detection run failed: {:#}", e);
        }
    }
}

async fn baseline_loop(rt: Arc<Runtime>) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(rt.config.baseline_interval_secs.max(1)));
    loop {
        tick.tick().await;
        if let Err(e) = rt.baseline_once().await {
            error!("Baseline run failed: {:#}", e);
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("quietwatch=info".parse()?))
        .compact().init();

    let cli    = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    let store  = Arc::new(MemoryStore::new());

    let (n_accounts, n_events) =
        fixtures::load_into(&store, &cli.accounts, cli.events.as_deref()).await?;
    info!("Loaded {} accounts, {} events", n_accounts, n_events);

    let rt = Arc::new(Runtime::new(store, config, cli.output.clone())?);
    if let Some(saved_at) = rt.checkpoint.restore().await? {
        info!("Restored state checkpointed at {}", saved_at);
    }

    match cli.mode {
        Mode::Detect => {
            rt.detect_once().await?;
        }
        Mode::Baseline if cli.account.is_empty() => {
            rt.baseline_once().await?;
        }
        Mode::Baseline => {
            rt.baseline_for(&cli.account).await?;
        }
        Mode::Score => {
            let hours = cli.window_hours.unwrap_or(rt.config.quiet_index_window_hours);
            rt.score(&cli.account, hours).await?;
        }
        Mode::Daemon => {
            println!("  Mode: \x1b[96mDAEMON\x1b[0m  |  detect every {}s, baselines every {}s",
                rt.config.detection_interval_secs, rt.config.baseline_interval_secs);
            println!("  Output: \x1b[90m{}\x1b[0m", cli.output.display());
            println!("  Press Ctrl+C to stop.\n");
            run_daemon(rt.clone(), cli.events.clone()).await?;
        }
    }

    rt.checkpoint.save().await?;
    info!("Checkpoint written to {}", rt.checkpoint.path().display());
    Ok(())
}

async fn run_daemon(rt: Arc<Runtime>, events: Option<PathBuf>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<ClickEvent>(16384);

    if let Some(path) = events {
        tokio::spawn(async move {
            if let Err(e) = tail_jsonl(path, tx, true).await {
                error!("Tail stopped: {:#}", e);
            }
        });
    } else {
        drop(tx);
    }

    let store = Arc::clone(&rt.store);
    let ingest = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            store.ingest(event);
        }
    });

    tokio::spawn(print_stats_loop(Arc::clone(&rt.store), Instant::now()));
    tokio::spawn(Arc::clone(&rt.cooldowns)
        .housekeeping_loop(std::time::Duration::from_secs(rt.config.purge_interval_secs.max(1))));
    tokio::spawn(Arc::clone(&rt.checkpoint).checkpoint_loop());
    tokio::spawn(detection_loop(Arc::clone(&rt)));
    tokio::spawn(baseline_loop(Arc::clone(&rt)));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    ingest.abort();
    Ok(())
}
