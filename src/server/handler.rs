use async_trait::async_trait;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, TcpListener, TcpStream},
};
use tracing::{debug, error, info, instrument, trace};

use crate::{
    server::{
        client::{Client, Outbound},
        engine::EngineRef,
    },
    utils::EngineError,
};

/// Error packet sent to connections refused because the server is full.
pub const SERVER_FULL_PACKET: &[u8] = b"%xt%e%-1%211%\x00";

const READ_BUFFER_SIZE: usize = 4096;

/// Per-connection protocol layer attached to admitted clients.
///
/// Framing and packet semantics live entirely behind this trait.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Called once before the first read.
    async fn on_connect(&self, _client: &Arc<Client>) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called with every chunk read while the client accepts input.
    async fn on_data(&self, client: &Arc<Client>, data: &[u8]) -> Result<(), EngineError>;

    /// Called once the read loop has ended, before the client is removed.
    async fn on_disconnect(&self, _client: &Arc<Client>) {}
}

/// Protocol handler that ignores everything it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardProtocol;

#[async_trait]
impl ProtocolHandler for DiscardProtocol {
    async fn on_data(&self, client: &Arc<Client>, data: &[u8]) -> Result<(), EngineError> {
        trace!(client = %client.id(), "Discarding {} bytes", data.len());
        Ok(())
    }
}

/// Accepts connections until the engine behind `engine_ref` is dropped.
///
/// Every accepted connection goes through admission exactly once. Admitted
/// clients are served on their own task; refused ones get the server-full
/// packet and are closed.
pub async fn accept_connections(listener: TcpListener, engine_ref: EngineRef) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let Ok(engine) = engine_ref.upgrade() else {
            debug!("Engine dropped, closing listener");
            break;
        };

        match engine.build_protocol(addr) {
            Some(client) => {
                tokio::spawn(serve_client(stream, client, engine.reference(), engine.handler()));
            }
            None => {
                tokio::spawn(reject(stream, addr));
            }
        }
    }
}

/// Tells a refused connection the server is full, then closes it.
pub async fn reject(mut stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.write_all(SERVER_FULL_PACKET).await {
        debug!(%addr, "Failed to send server-full packet: {}", e);
    }
    let _ = stream.shutdown().await;
    debug!(%addr, "Refused connection closed");
}

/// Runs an admitted client's connection to completion.
///
/// When the read loop ends (EOF, I/O error, handler error or a disconnect
/// request) the client is removed from the engine, queued output is
/// flushed, and the teardown-completion signal fires.
#[instrument(skip_all, fields(client = %client.id(), addr = %client.addr()))]
pub async fn serve_client(
    stream: TcpStream,
    client: Arc<Client>,
    engine: EngineRef,
    handler: Arc<dyn ProtocolHandler>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let writer_task = client.take_outbound().map(|mut outbound| {
        tokio::spawn(async move {
            while let Some(item) = outbound.recv().await {
                match item {
                    Outbound::Data(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            debug!("Write failed: {}", e);
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            let _ = writer.shutdown().await;
        })
    });

    let result = match handler.on_connect(&client).await {
        Ok(()) => read_loop(&mut reader, &client, handler.as_ref()).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        debug!("Connection error: {}", e);
    }

    handler.on_disconnect(&client).await;

    if let Ok(engine) = engine.upgrade() {
        engine.disconnect(&client);
    }

    let _ = client.close();
    if let Some(task) = writer_task {
        let _ = task.await;
    }
    client.mark_closed();
    info!("Connection closed: {}", client.addr());
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    client: &Arc<Client>,
    handler: &dyn ProtocolHandler,
) -> Result<(), EngineError> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = client.disconnect_signal() => return Ok(()),
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                client.touch();
                if !client.accepts_input() {
                    trace!("Input disabled, dropping {} bytes", n);
                    continue;
                }
                handler.on_data(client, &buf[..n]).await?;
            }
        }
    }
}
