use edge_viewer_common::config::StreamConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::{ConnectionKind, ConnectionRegistry};
use crate::state::SharedFrameState;
use crate::ServerError;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// HTTP multipart ("MJPEG") server.
///
/// Every accepted connection gets the stream, whatever it asked for. Each
/// viewer runs on its own task and polls the shared frame on a fixed
/// cadence, so a slow viewer only slows itself down.
pub struct StreamingServer {
    listener: TcpListener,
    viewer: Arc<ViewerContext>,
}

struct ViewerContext {
    state: Arc<SharedFrameState>,
    registry: Arc<ConnectionRegistry>,
    boundary: String,
    interval: Duration,
}

impl StreamingServer {
    pub async fn bind(
        addr: SocketAddr,
        config: &StreamConfig,
        state: Arc<SharedFrameState>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(addr.to_string(), e))?;
        Ok(Self {
            listener,
            viewer: Arc::new(ViewerContext {
                state,
                registry,
                boundary: config.boundary.clone(),
                interval: Duration::from_millis(config.frame_interval_ms.max(1)),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Io)
    }

    /// Accept viewers until `shutdown` flips. A failed accept is logged and
    /// retried; it never ends the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let addr = self.listener.local_addr().ok();
        info!(?addr, boundary = self.viewer.boundary, "MJPEG streaming server listening");

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        tokio::spawn(serve_viewer(
                            socket,
                            peer,
                            Arc::clone(&self.viewer),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed on streaming port");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("MJPEG streaming server stopped");
    }
}

/// Response head sent once per viewer.
pub fn response_head(boundary: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={boundary}\r\n\
         Cache-Control: no-cache, no-store, must-revalidate\r\n\
         Pragma: no-cache\r\n\
         Connection: close\r\n\
         \r\n"
    )
}

/// One multipart part carrying `jpeg`.
pub fn encode_part(boundary: &str, jpeg: &[u8]) -> Vec<u8> {
    let head = format!(
        "--{boundary}\r\n\
         Content-Type: image/jpeg\r\n\
         Content-Length: {len}\r\n\
         \r\n",
        len = jpeg.len()
    );
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

async fn serve_viewer(
    mut socket: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ViewerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _guard = ctx.registry.register(ConnectionKind::Viewer, peer);
    info!(%peer, viewers = ctx.registry.count(ConnectionKind::Viewer), "viewer connected");
    if let Err(e) = socket.set_nodelay(true) {
        debug!(%peer, error = %e, "could not set TCP_NODELAY");
    }

    let mut parts: u64 = 0;
    let outcome = {
        let (mut reader, mut writer) = socket.split();
        tokio::select! {
            r = write_stream(&mut writer, &ctx, &mut parts) => r,
            r = wait_for_close(&mut reader) => r,
            _ = shutdown.changed() => Ok(()),
        }
    };

    match outcome {
        Ok(()) => info!(%peer, parts, "viewer disconnected"),
        Err(e) => info!(%peer, parts, error = %e, "viewer connection closed on I/O error"),
    }
    let _ = socket.shutdown().await;
}

async fn write_stream(
    writer: &mut WriteHalf<'_>,
    ctx: &ViewerContext,
    parts: &mut u64,
) -> std::io::Result<()> {
    writer.write_all(response_head(&ctx.boundary).as_bytes()).await?;
    writer.flush().await?;

    let mut ticker: Interval = tokio::time::interval(ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Some(jpeg) = ctx.state.frame() {
            writer.write_all(&encode_part(&ctx.boundary, &jpeg)).await?;
            writer.flush().await?;
            *parts += 1;
        }
    }
}

/// Drain whatever the viewer sends (its request). EOF only means the viewer
/// half-closed; the stream keeps going until a write fails.
async fn wait_for_close(reader: &mut ReadHalf<'_>) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        if reader.read(&mut buf).await? == 0 {
            return std::future::pending().await;
        }
    }
}
