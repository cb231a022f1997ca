use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lager::cli::{self, Cli};
use lager::{HttpAdapter, HttpConfig, Schema, Store};

#[tokio::main]
async fn main() {
    // Initialize tracing. Logs go to stderr, records to stdout.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = match HttpConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Required: LAGER_API_HOST=<http(s)://host[:port]>");
            eprintln!("Optional: LAGER_API_NAMESPACE, LAGER_TIMEOUT_SECS (default: 30), LAGER_KEY_STYLE (verbatim|dasherized)");
            std::process::exit(1);
        }
    };

    tracing::info!("API: {}", config.base_url());

    let adapter = match HttpAdapter::new(&config) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("HTTP client error: {}", e);
            std::process::exit(1);
        }
    };
    let store = Store::new(adapter, Schema::new());

    let result = cli::run(&store, &cli.command).await;
    if let Err(e) = store.destroy() {
        tracing::warn!("Teardown: {}", e);
    }

    match result {
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
