//! Server binary
//!
//! Usage: relay-rs [CONFIG_PATH]
//!
//! Loads the YAML config (defaults apply when the default file is absent),
//! starts the relay and runs until interrupted.
//!
//! Exit codes: 0 on normal shutdown, 1 on a configuration error, 2 on a
//! fatal runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use relay_rs::path::source::NullDialer;
use relay_rs::webrtc::stub::StubConnector;
use relay_rs::{Conf, Relay, RelayError};

const DEFAULT_CONFIG: &str = "relay.yml";

fn print_usage() {
    eprintln!("Usage: relay-rs [CONFIG_PATH]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  CONFIG_PATH    YAML configuration file (default: {})", DEFAULT_CONFIG);
}

fn load_conf(args: &[String]) -> Result<Conf, RelayError> {
    match args.get(1) {
        Some(path) => Conf::load(&PathBuf::from(path)),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Conf::load(&default)
            } else {
                Ok(Conf::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let conf = match load_conf(&args) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(conf.log_level.clone())),
        )
        .init();

    let relay = match Relay::new(
        conf,
        Arc::new(NullDialer),
        Arc::new(StubConnector::new()),
    )
    .await
    {
        Ok(relay) => relay,
        Err(e @ RelayError::Validation(_)) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
        Err(e) => {
            eprintln!("startup error: {}", e);
            return ExitCode::from(2);
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match relay.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {}", e);
            ExitCode::from(2)
        }
    }
}
