use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;
use crate::directory::{ChannelHandle, ConnectionPurpose, SharedDirectory};
use crate::envelope::{NodeId, WireMessage};
use crate::error::{FlotillaError, Result};

/// Upper bound on a single wire frame; management traffic is tiny.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Outbound queue depth per connection before sends are dropped.
const CHANNEL_CAPACITY: usize = 64;

/// Encode a message as a length-prefixed JSON frame.
pub fn encode_frame(message: &WireMessage) -> Result<Bytes> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FlotillaError::OversizedFrame(body.len()));
    }
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Read one frame; `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<WireMessage>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FlotillaError::OversizedFrame(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Opens outbound management connections.
///
/// Implementations must be cheap to call repeatedly and must fail rather
/// than block past their configured timeout.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<ChannelHandle>> + Send;
}

/// TCP connector with a bounded connect timeout and TCP_NODELAY.
///
/// A successful connect yields a channel backed by a writer task; when the
/// peer goes away the task exits and the channel reports itself closed,
/// which doubles as the connection-lost signal.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<ChannelHandle>> + Send {
        let addr = format!("{host}:{port}");
        let connect_timeout = self.connect_timeout;
        async move {
            let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(FlotillaError::ConnectTimeout {
                        addr,
                        timeout: connect_timeout,
                    })
                }
            };
            stream.set_nodelay(true)?;

            let (handle, mut rx) = ChannelHandle::new(CHANNEL_CAPACITY);
            tokio::spawn(async move {
                let mut stream = stream;
                while let Some(message) = rx.recv().await {
                    let frame = match encode_frame(&message) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping unencodable frame");
                            continue;
                        }
                    };
                    if let Err(e) = stream.write_all(&frame).await {
                        tracing::debug!(addr = %addr, error = %e, "peer write failed, closing channel");
                        break;
                    }
                }
            });
            Ok(handle)
        }
    }
}

/// Accept management connections until the token is cancelled.
///
/// Each connection gets a reader feeding the coordinator and a writer task
/// registered in the directory once the peer identifies itself, so leader
/// responses have a reverse path.
pub async fn serve(
    listen_addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    directory: Arc<SharedDirectory>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "management listener started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("management listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let coordinator = coordinator.clone();
                        let directory = directory.clone();
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_peer(stream, coordinator, directory, token).await {
                                tracing::debug!(peer = %peer, error = %e, "peer connection ended");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn handle_peer(
    stream: TcpStream,
    coordinator: Arc<Coordinator>,
    directory: Arc<SharedDirectory>,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (handle, mut rx) = ChannelHandle::new(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match encode_frame(&message) {
                Ok(frame) => {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping unencodable frame"),
            }
        }
    });

    let mut registered: Option<NodeId> = None;
    let register = |node: NodeId, registered: &mut Option<NodeId>| {
        if *registered != Some(node) {
            directory.register(node, ConnectionPurpose::Management, handle.clone());
            *registered = Some(node);
        }
    };

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            frame = read_frame(&mut read_half) => {
                match frame {
                    Ok(None) => break Ok(()),
                    Ok(Some(WireMessage::Management(envelope))) => {
                        register(envelope.header.originator, &mut registered);
                        coordinator.handle_envelope(&envelope);
                    }
                    Ok(Some(WireMessage::Join(join))) => {
                        tracing::info!(
                            from_cluster = join.from_cluster,
                            from_node = join.from_node,
                            to_cluster = join.to_cluster,
                            "cluster join received"
                        );
                        register(join.from_node, &mut registered);
                    }
                    Err(e) => break Err(e),
                }
            }
        }
    };

    if let Some(node) = registered {
        directory.remove(node, ConnectionPurpose::Management);
    }
    result
}
