//! # Purpose
//! Attach a receiver to one broker entity and log every event it delivers.
//!
//! # Usage
//! ```text
//! CONDUIT_BROKER_ADDR=127.0.0.1:5671 CONDUIT_ENTITY=orders/partitions/0 \
//!     cargo run -p conduit-receive-demo
//! ```
//!
//! Client options come from the usual `CONDUIT_*` variables or the YAML file
//! named by `CONDUIT_CLIENT_CONFIG`. Setting `CONDUIT_TOKEN` authorizes the
//! entity with a static token before attaching. Only TCP is supported here;
//! QUIC needs a TLS client config the demo does not build.
use anyhow::{Context, Result, bail};
use conduit_client::{
    ClientOptions, ConduitClient, EventPosition, StaticTokenCredential, TokenCredential,
    TransportType, connector_for,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TOKEN_VALIDITY: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = ClientOptions::from_env_or_yaml(None)?;
    if options.transport != TransportType::Tcp {
        bail!("the receive demo only supports the tcp transport");
    }
    let addr: SocketAddr = std::env::var("CONDUIT_BROKER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:5671".to_string())
        .parse()
        .context("parse CONDUIT_BROKER_ADDR")?;
    let hostname = std::env::var("CONDUIT_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let entity = std::env::var("CONDUIT_ENTITY").unwrap_or_else(|_| "events/partitions/0".into());
    let credential = std::env::var("CONDUIT_TOKEN").ok().map(|token| {
        Arc::new(StaticTokenCredential::new(token, TOKEN_VALIDITY)) as Arc<dyn TokenCredential>
    });

    let batch = options.receive_batch as usize;
    let wait = options.operation_timeout;
    let connector = connector_for(&options, addr, &hostname, None)?;
    let client = ConduitClient::new(options, connector, credential)?;
    let mut receiver = client.receiver(&entity, EventPosition::earliest())?;
    tracing::info!(%addr, entity = %entity, "receiving");

    let mut received = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            result = receiver.receive(batch.max(1), wait) => {
                let messages = match result {
                    Ok(messages) => messages,
                    Err(err) => {
                        tracing::error!(error = %err, "receiver failed");
                        break;
                    }
                };
                if messages.is_empty() && receiver.is_done() {
                    tracing::info!("receiver completed");
                    break;
                }
                for message in messages {
                    received += 1;
                    tracing::info!(
                        sequence = ?message.annotation_i64("x-opt-sequence-number"),
                        bytes = message.body.len(),
                        body = %String::from_utf8_lossy(&message.body),
                        "event"
                    );
                }
            }
        }
    }

    receiver.close();
    client.close();
    tracing::info!(received, "done");
    Ok(())
}
