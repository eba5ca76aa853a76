use std::env;
use std::error::Error;

use ackflow_core::ack::TokenState;
use ackflow_core::event::EventData;
use ackflow_core::{SourceHandle, TopologyBuilder, TopologyConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

/// Loads the topology from the file given as the first argument, or from `ACKFLOW_TOPOLOGY`.
async fn load_config() -> Result<TopologyConfig, Box<dyn Error>> {
    match env::args().nth(1) {
        Some(path) => {
            info!(%path, "Loading topology from file");
            let raw = tokio::fs::read_to_string(&path).await?;
            Ok(TopologyConfig::from_json(&raw)?)
        }
        None => Ok(TopologyConfig::from_env()?),
    }
}

/// Every line read on stdin becomes one event, sent to every source of the topology. Runs until
/// stdin is closed or the process is asked to stop.
async fn run() -> Result<(), Box<dyn Error>> {
    let config = load_config().await?;
    let mut topology = TopologyBuilder::from_config(&config).build()?;

    let mut drains = JoinSet::new();
    for sink in &config.sinks {
        if let Some(mut reader) = topology.take_buffer(&sink.name) {
            let name = sink.name.clone();
            drains.spawn(async move {
                let mut read = 0usize;
                while let Some(event) = reader.recv().await {
                    read += 1;
                    info!(buffer = %name, read, payload = ?event.payload, "Read from buffer");
                }
            });
        }
    }

    let mut sources: Vec<SourceHandle> = config
        .sources
        .iter()
        .filter_map(|source| topology.take_source(&source.name))
        .collect();

    let mut acks = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => {
                // nothing is retried past this point, pending deliveries fail
                topology.cancel();
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        for source in sources.iter_mut() {
            let rx = source.send(EventData::new(line.clone())).await?;
            let key = source.key().clone();
            acks.spawn(async move { (key, rx.recv().await) });
        }
    }

    drop(sources);
    let result = topology.shutdown().await;

    let (mut resolved, mut failed) = (0usize, 0usize);
    while let Some(ack) = acks.join_next().await {
        match ack {
            Ok((_, TokenState::Resolved)) => resolved += 1,
            Ok((source, state)) => {
                warn!(%source, ?state, "Event was not delivered");
                failed += 1;
            }
            Err(e) => error!(?e, "Acknowledgement task failed"),
        }
    }
    info!(resolved, failed, "Acknowledgements received");

    // readers stop once their sink is gone
    while drains.join_next().await.is_some() {}

    match ackflow_core::encode_metrics() {
        Ok(metrics) => info!(%metrics, "Final metrics"),
        Err(e) => warn!(?e, "Failed to encode metrics"),
    }

    result?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
