use log::error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);

    for kind in [SignalKind::interrupt(), SignalKind::terminate(), SignalKind::hangup()] {
        let mut stream = signal(kind)?;
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if stream.recv().await.is_some() {
                if let Err(e) = shutdown_tx.send(()) {
                    error!("Failed to send shutdown signal: {}", e);
                }
            }
        });
    }

    let app_handle = tokio::spawn(sunny_jim::app(shutdown_tx.subscribe()));

    if let Err(e) = app_handle.await? {
        error!("Application error: {}", e);
        std::process::exit(255);
    }

    Ok(())
}
