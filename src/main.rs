use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use msgstream::config::Config;
use msgstream::demo::{self, LoopbackReport};
use msgstream::telemetry::EndpointStatsSnapshot;

#[derive(Parser, Debug)]
#[command(name = "msgstream", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one request/response exchange over an in-process bus
    Loopback {
        /// Coalescing delay in ms (<0 immediate, 0 on close, >0 batch window)
        #[arg(long = "nagle-ms", allow_negative_numbers = true)]
        nagle_ms: Option<i64>,
        /// Frame encoding on the bus (json or msgpack)
        #[arg(long)]
        encoding: Option<String>,
        /// Request path
        #[arg(long, default_value = "/")]
        path: String,
        /// Request body
        #[arg(long, default_value = "")]
        body: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut cfg = Config::default();
            cfg.apply_env_overrides()?;
            cfg
        }
    };

    match cli.command {
        Commands::Loopback {
            nagle_ms,
            encoding,
            path,
            body,
        } => {
            if let Some(nagle_ms) = nagle_ms {
                cfg.nagle_ms = nagle_ms;
            }
            if encoding.is_some() {
                cfg.encoding = encoding;
            }
            cfg.normalize();
            cfg.validate()?;
            if let Some(log_file) = &cfg.log_file {
                msgstream::logging::init_log_file(log_file)?;
            }
            let report = demo::run_loopback(&cfg, &path, &body)?;
            print_report(&cfg, &report);
        }
    }

    Ok(())
}

fn print_report(cfg: &Config, report: &LoopbackReport) {
    println!("session:  {}", report.session_id);
    println!("encoding: {}", report.encoding.as_str());
    println!("nagle_ms: {}", cfg.nagle_ms);
    println!();
    println!("{}", report.response);
    println!();
    print_stats("client", &report.client);
    print_stats("server", &report.server);
}

fn print_stats(label: &str, stats: &EndpointStatsSnapshot) {
    println!(
        "{label}: sent={} ({} bytes) recv={} ({} bytes) opened={} accepted={} dropped={} protocol_errors={}",
        stats.envelopes_sent,
        stats.bytes_sent,
        stats.envelopes_recv,
        stats.bytes_recv,
        stats.sessions_opened,
        stats.sessions_accepted,
        stats.dropped,
        stats.protocol_errors
    );
    if !stats.last_error.is_empty() {
        println!("{label}: last_error={}", stats.last_error);
    }
}
