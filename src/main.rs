use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use sockrelay::{start, Config, QuitCode};

#[derive(Parser, Debug)]
#[command(name = "sockrelay")]
#[command(author, version, about = "TCP fan-out relay with inline SBRP control")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "relay.json")]
    config: PathBuf,

    /// Override the host listening port from the configuration file.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(&args.config);
    if let Some(port) = args.port {
        config.host_port = port;
    }

    let (mut handle, addr) = match start(config).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(e.quit_code().exit_code());
        }
    };
    info!(%addr, "relay started");

    let code = tokio::select! {
        code = handle.wait() => Some(code),
        _ = tokio::signal::ctrl_c() => None,
    };
    let code = match code {
        Some(code) => code,
        None => {
            info!("shutdown signal received");
            handle.stop().await
        }
    };

    if code != QuitCode::Ok {
        error!(code = code.wire_name(), "relay exited abnormally");
    }
    std::process::exit(code.exit_code());
}
