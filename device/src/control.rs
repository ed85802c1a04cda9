use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::Router;
use chrono::Utc;
use edge_viewer_common::config::ControlConfig;
use edge_viewer_common::frame::ProcessingParameters;
use edge_viewer_common::keys::{fmt_ts, snapshot_filename};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::notify::UiNotifier;
use crate::registry::{ConnectionKind, ConnectionRegistry};
use crate::snapshot::SnapshotSink;
use crate::state::SharedFrameState;
use crate::ServerError;

/// Commands accepted on the control channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlCommand {
    Threshold { low: i32, high: i32 },
    Snapshot,
}

/// Events pushed to every connected controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlEvent {
    Fps { value: u32 },
}

/// Result of applying one control message. Nothing is sent back to the
/// controller; this exists for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Thresholds(ProcessingParameters),
    SnapshotStored(String),
    Ignored,
}

/// Applies control messages to the shared state and the snapshot sink.
pub struct CommandHandler {
    state: Arc<SharedFrameState>,
    sink: Arc<dyn SnapshotSink>,
    validate: bool,
}

impl CommandHandler {
    pub fn new(state: Arc<SharedFrameState>, sink: Arc<dyn SnapshotSink>, validate: bool) -> Self {
        Self {
            state,
            sink,
            validate,
        }
    }

    /// Apply one text frame. Malformed or unknown messages are logged and
    /// ignored.
    pub async fn apply(&self, text: &str) -> Outcome {
        debug!(message = text, "control message received");
        let command = match serde_json::from_str::<ControlCommand>(text) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, message = text, "ignoring malformed control message");
                return Outcome::Ignored;
            }
        };

        match command {
            ControlCommand::Threshold { low, high } => {
                let params = ProcessingParameters::new(low, high);
                if self.validate {
                    if let Err(e) = params.validate() {
                        warn!(error = %e, "ignoring threshold command");
                        return Outcome::Ignored;
                    }
                }
                self.state.set_parameters(params);
                info!(low, high, "thresholds updated");
                Outcome::Thresholds(params)
            }
            ControlCommand::Snapshot => self.snapshot().await,
        }
    }

    async fn snapshot(&self) -> Outcome {
        let Some(jpeg) = self.state.frame() else {
            warn!("snapshot requested before any frame was published");
            return Outcome::Ignored;
        };
        let captured_at_ms = Utc::now().timestamp_millis();
        let filename = snapshot_filename(captured_at_ms);
        let sink = Arc::clone(&self.sink);
        let name = filename.clone();

        match tokio::task::spawn_blocking(move || sink.store(&name, &jpeg)).await {
            Ok(Ok(())) => {
                info!(filename, at = fmt_ts(captured_at_ms), "snapshot stored");
                Outcome::SnapshotStored(filename)
            }
            Ok(Err(e)) => {
                error!(error = %e, filename, "snapshot failed");
                Outcome::Ignored
            }
            Err(e) => {
                error!(error = %e, "spawn_blocking failed");
                Outcome::Ignored
            }
        }
    }
}

/// Publishes [`ControlEvent`]s to connected controllers. Doubles as a
/// [`UiNotifier`] so the render loop can report its rate here.
#[derive(Clone)]
pub struct ControlEvents {
    tx: broadcast::Sender<ControlEvent>,
}

impl ControlEvents {
    pub fn publish(&self, event: ControlEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl UiNotifier for ControlEvents {
    fn on_fps(&self, fps: u32) {
        self.publish(ControlEvent::Fps { value: fps });
    }

    fn on_notice(&self, _notice: &str) {}
}

#[derive(Clone)]
struct ConnectionContext {
    commands: Arc<CommandHandler>,
    registry: Arc<ConnectionRegistry>,
    events: broadcast::Sender<ControlEvent>,
    shutdown: watch::Receiver<bool>,
}

/// WebSocket control server.
///
/// The handshake is accepted on any path. Each controller has its own task;
/// its messages are applied in the order they arrive.
pub struct ControlServer {
    listener: TcpListener,
    commands: Arc<CommandHandler>,
    registry: Arc<ConnectionRegistry>,
    events: broadcast::Sender<ControlEvent>,
}

impl ControlServer {
    pub async fn bind(
        addr: SocketAddr,
        config: &ControlConfig,
        state: Arc<SharedFrameState>,
        registry: Arc<ConnectionRegistry>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(addr.to_string(), e))?;
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            listener,
            commands: Arc::new(CommandHandler::new(state, sink, config.validate_thresholds)),
            registry,
            events,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Io)
    }

    pub fn events(&self) -> ControlEvents {
        ControlEvents {
            tx: self.events.clone(),
        }
    }

    /// Serve controllers until `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let addr = self.listener.local_addr().ok();
        let ctx = ConnectionContext {
            commands: self.commands,
            registry: self.registry,
            events: self.events,
            shutdown: shutdown.clone(),
        };
        let app = Router::new()
            .fallback(upgrade)
            .with_state(ctx)
            .layer(TraceLayer::new_for_http());

        info!(?addr, "control WebSocket server started");
        let mut signal = shutdown;
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                let stopping = *signal.borrow_and_update();
                if stopping || signal.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(ServerError::Io)?;
        info!("control WebSocket server stopped");
        Ok(())
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(ctx): State<ConnectionContext>,
) -> Response {
    ws.on_upgrade(move |socket| handle_controller(socket, peer, ctx))
}

async fn handle_controller(socket: WebSocket, peer: SocketAddr, ctx: ConnectionContext) {
    // Subscribe before registering so a registered controller never misses an event.
    let mut events = ctx.events.subscribe();
    let _guard = ctx.registry.register(ConnectionKind::Controller, peer);
    info!(%peer, "controller connected");

    let (mut sink, mut stream) = socket.split();
    let mut shutdown = ctx.shutdown.clone();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    ctx.commands.apply(&text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "control connection error");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize control event");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(%peer, error = %e, "failed to push event to controller");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(%peer, skipped, "controller lagging behind events");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    info!(%peer, "controller disconnected");
}
