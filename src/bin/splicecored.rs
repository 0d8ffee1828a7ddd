//! Command-line entry point.
//!
//! Two modes, matching the reference implementation's single-source and
//! dual-source TCP splicers: `files` replays a fixed sequence of on-disk
//! captures, `live` arbitrates between two TCP ingresses with failover.
//! Output always goes to stdout, binary, so it composes with a pipe the way
//! the original did (`... > output.ts`).

use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use splicecore::config::Config;
use splicecore::orchestrator::Orchestrator;
use splicecore::sink::Sink;

#[derive(Parser)]
#[command(name = "splicecored", about = "MPEG-TS stream splicer")]
struct Cli {
    /// Path to a TOML configuration file; defaults are used if absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output program number carried in the synthesized PAT/PMT.
    #[arg(long, global = true, default_value_t = 1)]
    program_number: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replays a fixed sequence of files, splicing at each boundary.
    Files {
        /// Capture files to play in order.
        paths: Vec<PathBuf>,
        /// Number of times to repeat the whole sequence.
        #[arg(long, default_value_t = 1)]
        loop_count: u32,
    },
    /// Arbitrates between two TCP ingresses, failing over on silence.
    Live {
        /// `host:port` of the primary source.
        primary: String,
        /// `host:port` of the fallback source.
        fallback: String,
        /// Caps the whole run; omit to run until interrupted.
        #[arg(long)]
        duration: Option<u64>,
        /// Caps the number of source-switch segments; omit to run unbounded.
        #[arg(long = "loop")]
        loop_count: Option<u32>,
    },
}

fn main() {
    // Best-effort: picks up a local `.env` during manual testing so
    // SPLICECORE_* overrides don't have to live in the shell environment.
    // Absent in normal deployment, so failures here are silently ignored.
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("failed to load config: {e}");
        std::process::exit(1);
    });
    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();
    config.install();

    let stdout = std::io::stdout();
    let sink = Sink::new(stdout.lock());
    let mut orchestrator = Orchestrator::new(cli.program_number, sink).with_monitor();

    let result = match cli.command {
        Command::Files { paths, loop_count } => {
            if paths.is_empty() {
                eprintln!("files mode requires at least one path");
                std::process::exit(1);
            }
            orchestrator.run_file_sequence(&paths, loop_count)
        }
        Command::Live {
            primary,
            fallback,
            duration,
            loop_count,
        } => {
            let primary_addr = primary.clone();
            let fallback_addr = fallback.clone();
            orchestrator.run_dual_live(
                move || TcpStream::connect(&primary_addr),
                move || TcpStream::connect(&fallback_addr),
                duration.map(Duration::from_secs),
                loop_count,
            )
        }
    };

    if let Err(e) = result {
        log::error!("splicing run ended with error: {e}");
        std::process::exit(1);
    }
}
