use image_compress_worker::{
    AppConfig, BrokerConnection, Compressor, HttpBlobTransfer, ImageWorker, JobProcessor,
    PgJobStore, WorkerError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("Worker exited with error: {}", e);
        std::process::exit(1);
    }
    log::info!("Worker has shut down.");
}

async fn run() -> Result<(), WorkerError> {
    let config = AppConfig::from_env()?;
    log::info!(
        "Using RabbitMQ at {}, blobs at {}",
        config.rabbitmq_url,
        config.blob_base_url
    );

    let store = Arc::new(PgJobStore::connect(&config.database_url, config.database_max_connections).await?);
    store.ensure_schema().await?;
    let transfer = Arc::new(
        HttpBlobTransfer::new(&config.blob_base_url).map_err(|e| WorkerError::from(e.to_string()))?,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl+C received. Shutting down.");
            let _ = stop_tx.send(true);
        }
    });

    let result = loop {
        if *stop_rx.borrow() {
            break Ok(());
        }

        let broker = match BrokerConnection::open(&config.rabbitmq_url, config.topology.clone()).await {
            Ok(broker) => broker,
            Err(e) if e.is_fatal() => break Err(e),
            Err(e) => {
                log::error!("Failed to connect: {}. Reconnecting in {:?}...", e, RECONNECT_DELAY);
                wait_or_stop(stop_rx.clone(), RECONNECT_DELAY).await;
                continue;
            }
        };

        let processor = JobProcessor::new(store.clone(), transfer.clone())
            .with_compressor(Compressor::new(config.jpeg_quality))
            .with_retry_limit(config.retry_limit);
        let worker = ImageWorker::new(&broker, processor, &config);

        let outcome = worker.run_until(stopped(stop_rx.clone())).await;
        drop(worker);

        // Consumer is stopped by now, so closing cannot cut a delivery short.
        if let Err(e) = broker.close().await {
            log::warn!("Error while closing RabbitMQ connection: {}", e);
        }

        match outcome {
            Ok(()) if *stop_rx.borrow() => break Ok(()),
            Ok(()) => log::warn!("Worker finished unexpectedly. Reconnecting in {:?}...", RECONNECT_DELAY),
            Err(e) => log::error!("Worker failed: {}. Reconnecting in {:?}...", e, RECONNECT_DELAY),
        }
        wait_or_stop(stop_rx.clone(), RECONNECT_DELAY).await;
    };

    store.close().await;
    result
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn wait_or_stop(stop: watch::Receiver<bool>, delay: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = stopped(stop) => {}
    }
}
