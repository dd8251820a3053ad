//! cairn-vault — a vault process hosting the chunk storage pipeline.
//!
//! Spawned by cairnd with `--vm-port <port> --vault-label <label>`. The
//! controller handshakes with the supervisor, receives credentials and the
//! chunkstore location, and the process then hosts a storage pipeline
//! until the supervisor asks it to stop. Exit code 0 on clean shutdown.

use std::sync::Arc;
use std::time::Duration;

use cairn_store::ChunkStore;
use cairn_vault::VaultController;
use tokio::sync::Notify;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some((vm_port, label)) = parse_args() else {
        eprintln!("usage: cairn-vault --vm-port <port> --vault-label <label>");
        std::process::exit(1);
    };
    tracing::info!(vm_port, %label, pid = std::process::id(), "vault starting");

    let stopped = Arc::new(Notify::new());
    let stop_signal = stopped.clone();
    let controller = match VaultController::start(
        vm_port,
        &label,
        Box::new(move || stop_signal.notify_waiters()),
    )
    .await
    {
        Ok(controller) => controller,
        Err(error) => {
            tracing::error!(%error, "failed to reach vault manager");
            std::process::exit(1);
        }
    };

    let Some(credentials) = controller.identity().await else {
        tracing::error!("no credentials from vault manager");
        std::process::exit(1);
    };
    tracing::info!(
        pmid = hex::encode(&credentials.pmid.public[..8]),
        chunkstore = %credentials.chunkstore_path.display(),
        max_disk_usage = credentials.max_disk_usage,
        contacts = credentials.bootstrap_contacts.len(),
        "credentials received"
    );

    // Bring up the storage pipeline under the assigned chunkstore.
    let store_root = credentials.chunkstore_path.clone();
    let pipeline = tokio::task::spawn_blocking(move || {
        cairn_store::create_local_chunk_store(
            store_root.join("buffer"),
            store_root.join("network"),
            store_root.join("locks"),
            Duration::ZERO,
        )
    })
    .await
    .ok()
    .flatten();

    match &pipeline {
        Some(pipeline) => {
            if credentials.max_disk_usage != 0 {
                pipeline.local_store().set_capacity(credentials.max_disk_usage);
            }
            tracing::info!("storage pipeline ready");
            controller.notify_joined_network();
        }
        None => {
            tracing::error!("storage pipeline failed to start");
            controller.send_log_message("storage pipeline failed to start".into());
        }
    }

    tokio::select! {
        _ = controller.wait_for_shutdown() => {}
        _ = stopped.notified() => {}
    }

    if let Some(pipeline) = pipeline {
        // Flush in-flight ops before exiting cleanly.
        let _ = tokio::task::spawn_blocking(move || pipeline.wait_for_completion()).await;
    }
    tracing::info!("vault exiting");
}

fn parse_args() -> Option<(u16, String)> {
    let mut vm_port = None;
    let mut label = None;
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--vm-port" => vm_port = args.next().and_then(|v| v.parse().ok()),
            "--vault-label" => label = args.next(),
            _ => return None,
        }
    }
    Some((vm_port?, label?))
}
