use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crossroads::config::Config;
use crossroads::proxy::{self, ProxyConfig};

#[derive(Parser)]
#[command(name = "crossroads")]
#[command(about = "Split-horizon DNS forwarder", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "crossroads.toml")]
    config: PathBuf,

    /// Override the bind address from the configuration
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log every answered query
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let proxy_config = ProxyConfig {
        bind_addr: args.bind.unwrap_or(config.bind),
        config_path: args.config,
        config,
        verbose: args.verbose,
    };

    match rt.block_on(proxy::run(proxy_config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "forwarder stopped");
            ExitCode::FAILURE
        }
    }
}
