use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vigil_daemon::command::SystemRunner;
use vigil_daemon::config::Config;
use vigil_daemon::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "vigild", version, about = "High-availability controller daemon")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/vigil/config.yaml", env = "VIGIL_CONFIG")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn init_tracing(config: &Config) {
    // VIGIL_DEBUG forces at least debug; RUST_LOG still wins when set.
    let default_level = if std::env::var_os("VIGIL_DEBUG").is_some() {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.check {
        println!("configuration ok");
        return Ok(());
    }
    init_tracing(&config);

    let runner = Arc::new(SystemRunner);
    let mut supervisor = Supervisor::build(config, args.config.clone(), runner)
        .await
        .context("starting daemon")?;
    supervisor.run().await
}
