use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use flagdemo::app::{App, AppContext, AppError};
use flagdemo::config::AppConfig;
use flagdemo::logger;
use flagdemo::storage::{FileStore, MemoryStore};
use tokio::io::BufReader;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "flagdemo", about = "Feature-flag driven logger demo")]
struct Cli {
    /// Load environment variables from this file instead of `./.env`.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Override `FLAGDEMO_DATA_DIR`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Serve flags in-process even if `LD_BASE_URL` is set.
    #[arg(long, env = "FLAGDEMO_OFFLINE")]
    offline: bool,

    /// Read commands from a file instead of stdin.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Most verbose application diagnostics written to stderr. Console and
    /// flag client output are gated by their level flags instead.
    #[arg(long, default_value = "info")]
    max_level: tracing::Level,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(logger::subscriber_filter(cli.max_level))
        .init();

    match &cli.env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                tracing::error!(path = %path.display(), error = %e, "failed to load env file");
                return ExitCode::FAILURE;
            }
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "flagdemo failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if config.is_development() {
        tracing::debug!(?config, "loaded configuration");
    }

    let local = Arc::new(FileStore::in_dir(&config.data_dir)?);
    tracing::info!(path = %local.path().display(), "local storage opened");
    let ctx = AppContext::new(config, local, Arc::new(MemoryStore::new()), cli.offline);
    let app = App::new(ctx, std::io::stdout());

    match cli.script {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            app.run(BufReader::new(file)).await?;
        }
        None => {
            app.run(BufReader::new(tokio::io::stdin())).await?;
        }
    }
    Ok(())
}
