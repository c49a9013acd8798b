// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flux_broker::broker::{Broker, ClientEvent};
use flux_broker::config::{BrokerConfig, ConfigSource, TomlConfigSource};
use flux_broker::message::Message;
use flux_broker::registry::StandaloneUpstream;
use flux_broker::transport::local::{UnixClientConn, UnixSocketTransport};

#[tokio::main]
async fn main() {
    let config = BrokerConfig::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e:#}");
        std::process::exit(2);
    }
    flux_broker::config::init_tracing(&config);

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

/// Bind the local client socket and drive accepted connections through
/// a single `Broker` until the process receives `SIGINT`/`SIGTERM`.
async fn run(config: BrokerConfig) -> anyhow::Result<()> {
    let conf_source: Option<Box<dyn ConfigSource>> = config
        .conf_path
        .as_ref()
        .map(|p| Box::new(TomlConfigSource::new(p.clone())) as Box<dyn ConfigSource>);
    let initial_conf = match &conf_source {
        Some(source) => source.load()?,
        None => serde_json::json!({}),
    };

    let shutdown = CancellationToken::new();
    let (broker, client_tx) = Broker::new(
        config.rank,
        config.size,
        config.size as usize,
        std::time::Duration::from_secs_f64(config.hello_timeout),
        StandaloneUpstream,
        initial_conf,
        conf_source,
        shutdown.clone(),
    );

    let transport = UnixSocketTransport::bind(&config.socket)?;
    info!(socket = %config.socket.display(), rank = config.rank, size = config.size, "listening");

    let broker_task = tokio::task::spawn(broker.run());

    let accept_shutdown = shutdown.clone();
    let accept_client_tx = client_tx.clone();
    let accept_task = tokio::task::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_shutdown.cancelled() => break,
                accepted = transport.accept() => {
                    match accepted {
                        Ok((uuid, conn)) => spawn_connection(uuid, conn, accept_client_tx.clone()),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    shutdown.cancel();
    accept_task.abort();
    let _ = broker_task.await;
    Ok(())
}

/// Split an accepted connection into independent reader/writer halves:
/// a writer task drains a channel fed by the Connection `send` closure
/// the broker calls synchronously, and a reader task forwards framed
/// messages (and the eventual disconnect) onto the broker's client
/// channel.
fn spawn_connection(uuid: String, conn: UnixClientConn, client_tx: mpsc::UnboundedSender<ClientEvent>) {
    let (mut reader, mut writer) = conn.into_split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();

    tokio::task::spawn(async move {
        while let Some(msg) = write_rx.recv().await {
            if writer.send(&msg).await.is_err() {
                break;
            }
        }
    });

    let send: Box<dyn Fn(Message) + Send + Sync> = Box::new(move |msg| {
        let _ = write_tx.send(msg);
    });
    let _ = client_tx.send(ClientEvent::Connected { uuid: uuid.clone(), send });

    let recv_client_tx = client_tx;
    tokio::task::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(msg)) => {
                    let _ = recv_client_tx.send(ClientEvent::Message { uuid: uuid.clone(), msg });
                }
                Ok(None) | Err(_) => {
                    let _ = recv_client_tx.send(ClientEvent::Disconnected { uuid });
                    break;
                }
            }
        }
    });
}
