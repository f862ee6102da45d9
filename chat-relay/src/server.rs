use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    hub::{Hub, HubConfig, Outbox},
    message::{JsonLines, Message, write_message},
};

pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub hub: HubConfig,
    /// Messages buffered per connection before broadcasts start waiting on it.
    pub outbox_capacity: usize,
    /// A client whose socket accepts no data for this long is dropped.
    pub write_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// TCP front end for a [`Hub`]: one JSON-lines session per accepted socket.
pub struct Relay {
    listener: TcpListener,
    hub: Hub,
    limits: ConnectionLimits,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    outbox_capacity: usize,
    write_timeout: Duration,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            hub: Hub::new(config.hub),
            limits: ConnectionLimits {
                outbox_capacity: config.outbox_capacity,
                write_timeout: config.write_timeout,
            },
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Hub {
        self.hub.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            hub,
            limits,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(connections = hub.connection_count(), "relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub, limits);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &Hub,
    limits: ConnectionLimits,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, hub, limits),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, hub: &Hub, limits: ConnectionLimits) {
    let hub = hub.clone();
    tokio::spawn(async move {
        info!(%peer, "connection accepted");
        match handle_connection(stream, hub, limits).await {
            Ok(()) => info!(%peer, "connection closed"),
            Err(err) => warn!(%peer, error = ?err, "connection closed with error"),
        }
    });
}

async fn handle_connection(stream: TcpStream, hub: Hub, limits: ConnectionLimits) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let source = JsonLines::new(BufReader::new(reader));
    let (outbox, inbox) = Outbox::channel(limits.outbox_capacity);

    let writer_task = tokio::spawn(drain_outbox(inbox, writer, limits.write_timeout));
    let outcome = hub.handle_session(source, outbox).await;

    // The writer stops once every outbox clone is gone (ours went into the
    // registry, in-flight broadcasts release theirs when they finish) or
    // once a single write stalls past the write timeout.
    if let Err(err) = writer_task.await {
        warn!(error = ?err, "outbox writer task failed");
    }

    outcome?;
    Ok(())
}

async fn drain_outbox<W>(
    mut inbox: mpsc::Receiver<Message>,
    mut writer: W,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = inbox.recv().await {
        match timeout(write_timeout, write_message(&mut writer, &message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(?err, "failed to deliver message to client");
                return;
            }
            Err(_) => {
                warn!(?write_timeout, "client stopped reading; dropping its writer");
                return;
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(?err, "failed to shut down connection writer");
    }
}
