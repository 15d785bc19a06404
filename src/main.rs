//! Fuzzmill CLI entrypoint.

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _};

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use fuzzmill::{filter_covered_seeds, load_seeds, RunMode, Session, DEBUG_LOG};

#[derive(Debug, Parser)]
#[command(name = "fuzzmill")]
#[command(about = "mutation fuzzing orchestrator for external interpreters")]
struct Cli {
    /// Config file to use. Required when starting a new session, ignored
    /// when resuming.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory that stores this session. If it already exists the session
    /// found there is resumed, which only makes sense when the run mode
    /// covers all seed cases once.
    #[arg(long)]
    dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let (mut session, seeds) = if cli.dir.exists() {
        let session = Session::resume(&cli.dir).with_context(|| {
            format!(
                "failed to load session from directory {}",
                cli.dir.display()
            )
        })?;

        if session.config.run_mode()? != RunMode::CoverAllOnce {
            anyhow::bail!(
                "the session directory {} already exists, but the run mode is not \
                 cover_all_once; resuming only makes sense when covering all seed files once, \
                 otherwise start a new session with a different seed",
                cli.dir.display()
            );
        }

        init_tracing(&session).context("failed to initialise logging")?;
        let seeds = load_seeds(&session.config).context("error loading seed tests")?;
        let seeds = filter_covered_seeds(&session, seeds);
        (session, seeds)
    } else {
        let config_path = cli
            .config
            .as_deref()
            .context("a config file must be specified to start a new session")?;
        let session = Session::create(&cli.dir, config_path)
            .with_context(|| format!("failed to initialise session at {}", cli.dir.display()))?;

        init_tracing(&session).context("failed to initialise logging")?;
        let seeds = load_seeds(&session.config).context("error loading seed tests")?;
        (session, seeds)
    };

    tracing::info!("{} seed tests found", seeds.len());

    fuzzmill::run(&mut session, seeds)?;
    Ok(())
}

fn init_tracing(session: &Session) -> anyhow::Result<()> {
    if session.config.general.enable_debug_log {
        let debug_file = std::fs::File::create(session.session_dir.join(DEBUG_LOG))?;
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_filter(LevelFilter::INFO),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(debug_file))
                    .with_filter(LevelFilter::DEBUG),
            )
            .init();
    } else {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    Ok(())
}
