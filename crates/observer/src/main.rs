mod stages;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use clap::Parser;
use logutil::LogFormat;
use seda_core::event::StageEvent;
use seda_core::registry::StageRegistry;
use seda_core::seda_config::{cleanup_seda, init_seda, with_seda_config};
use seda_core::settings::SedaSettings;
use seda_error::{Result, ResultExt, SedaError};
use stages::{SESSION_STAGE, SqlRequest, SqlResponse};
use tracing::info;

#[derive(Parser)]
#[clap(name = "observer")]
#[clap(about = "Drive simulated client sessions through a staged request pipeline")]
struct Arguments {
    /// Pipeline configuration file.
    #[clap(short, long, default_value = "conf/observer.toml")]
    config: PathBuf,

    /// Number of requests to submit.
    #[clap(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Number of client sessions the requests are spread over.
    #[clap(short, long, default_value_t = 4)]
    sessions: u64,

    /// How long to wait for all replies, in seconds.
    #[clap(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log output format, `human` or `json`.
    #[clap(long, default_value = "human")]
    log_format: LogFormat,
}

fn main() {
    let args = Arguments::parse();
    logutil::configure_global_logger(tracing::Level::INFO, args.log_format, io::stderr);

    let result = std::panic::catch_unwind(move || run(args));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            println!("ERROR: {err}");
            std::process::exit(1);
        }
        Err(err) => {
            println!("PANIC: {err:?}");
            std::process::exit(2);
        }
    }
}

fn run(args: Arguments) -> Result<()> {
    let settings = SedaSettings::from_file(&args.config)?;

    let mut registry = StageRegistry::with_builtins();
    stages::register_stages(&mut registry);
    init_seda(settings, &registry)?;

    // Always stop the pipeline, even if the run failed.
    let summary = submit_requests(&args);
    cleanup_seda();

    summary?.print();
    Ok(())
}

fn submit_requests(args: &Arguments) -> Result<Summary> {
    let sessions = args.sessions.max(1);
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();

    for seq in 0..args.requests {
        let session_id = seq as u64 % sessions;
        let sql = format!("SELECT * FROM t{session_id} WHERE id = {seq}");
        let event = StageEvent::new(SqlRequest::new(session_id, seq, sql, tx.clone()));

        match with_seda_config(|config| config.submit(SESSION_STAGE, event)) {
            Some(Ok(())) => {}
            Some(Err(rejected)) => {
                return Err(SedaError::new("Request rejected")
                    .with_field("stage", rejected.stage())
                    .with_field("seq", seq));
            }
            None => return Err(SedaError::new("Pipeline not running")),
        }
    }
    drop(tx);
    info!(requests = args.requests, sessions, "submitted requests");

    let deadline = start + Duration::from_secs(args.timeout_secs);
    let mut summary = Summary::default();
    while summary.replies < args.requests {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = rx
            .recv_timeout(remaining)
            .context("Failed waiting for replies")?;
        summary.record(response);
    }
    summary.elapsed = start.elapsed();

    Ok(summary)
}

#[derive(Debug, Default)]
struct Summary {
    replies: usize,
    elapsed: Duration,
    total_latency: Duration,
    max_latency: Duration,
    /// Last sequence number replied to per session.
    last_seq: HashMap<u64, usize>,
    out_of_order: usize,
    trace: Vec<String>,
}

impl Summary {
    fn record(&mut self, response: SqlResponse) {
        self.replies += 1;
        self.total_latency += response.latency;
        self.max_latency = self.max_latency.max(response.latency);

        if let Some(prev) = self.last_seq.insert(response.session_id, response.seq) {
            if prev > response.seq {
                self.out_of_order += 1;
            }
        }
        if self.trace.is_empty() {
            self.trace = response.trace;
        }
    }

    fn print(&self) {
        let avg = match self.replies {
            0 => Duration::ZERO,
            n => self.total_latency / n as u32,
        };
        println!("replies:      {}", self.replies);
        println!("sessions:     {}", self.last_seq.len());
        println!("elapsed:      {:?}", self.elapsed);
        println!("avg latency:  {avg:?}");
        println!("max latency:  {:?}", self.max_latency);
        println!("out of order: {}", self.out_of_order);
        println!("path:         {}", self.trace.join(" -> "));
    }
}
