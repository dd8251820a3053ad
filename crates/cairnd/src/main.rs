//! cairnd — vault supervisor daemon.

use cairn_core::config::CairnConfig;
use cairnd::connection::Event;
use cairnd::VaultManager;

#[tokio::main]
async fn main() {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug cairnd
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = match CairnConfig::load() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "failed to load configuration");
            std::process::exit(1);
        }
    };
    apply_cli_overrides(&mut config);

    let manager = match VaultManager::start(config).await {
        Ok(manager) => manager,
        Err(error) => {
            tracing::error!(%error, "vault manager failed to start");
            std::process::exit(1);
        }
    };
    tracing::info!(port = manager.listener_port(), "cairnd running");

    // Ctrl-C turns into a shutdown event; run() tears down and returns.
    let shutdown = manager.event_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown.send(Event::Shutdown);
        }
    });

    manager.run().await;
}

/// Flags: --root <dir>, --port <port>, --vault-exe <path>.
fn apply_cli_overrides(config: &mut CairnConfig) {
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--root" => {
                if let Some(value) = args.next() {
                    config.supervisor.root_dir = value.into();
                }
            }
            "--port" => {
                if let Some(value) = args.next().and_then(|v| v.parse().ok()) {
                    config.supervisor.listener_port = value;
                }
            }
            "--vault-exe" => {
                if let Some(value) = args.next() {
                    config.supervisor.vault_executable = value.into();
                }
            }
            other => {
                eprintln!("unknown flag: {other}");
                std::process::exit(1);
            }
        }
    }
}
