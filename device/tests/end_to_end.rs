//! Drives the real servers over localhost.

use bytes::Bytes;
use edge_viewer_common::config::{CaptureConfig, ControlConfig, StreamConfig};
use edge_viewer_common::frame::ProcessingParameters;
use edge_viewer_device::capture::mjpeg::MultipartSplitter;
use edge_viewer_device::capture::{synthetic, CaptureBridge};
use edge_viewer_device::control::{ControlEvent, ControlServer};
use edge_viewer_device::processor::edge::EdgeProcessor;
use edge_viewer_device::processor::ProcessorHandle;
use edge_viewer_device::registry::{ConnectionKind, ConnectionRegistry};
use edge_viewer_device::snapshot::{SnapshotError, SnapshotSink};
use edge_viewer_device::state::SharedFrameState;
use edge_viewer_device::stream::StreamingServer;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct MemorySink(Mutex<Vec<(String, Vec<u8>)>>);

impl SnapshotSink for MemorySink {
    fn store(&self, filename: &str, jpeg: &[u8]) -> Result<(), SnapshotError> {
        self.0.lock().unwrap().push((filename.to_string(), jpeg.to_vec()));
        Ok(())
    }
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Control {
    addr: SocketAddr,
    events: edge_viewer_device::control::ControlEvents,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<Result<(), edge_viewer_device::ServerError>>,
}

async fn start_control(
    state: Arc<SharedFrameState>,
    registry: Arc<ConnectionRegistry>,
    sink: Arc<MemorySink>,
) -> Control {
    let server = ControlServer::bind(localhost(), &ControlConfig::default(), state, registry, sink)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let events = server.events();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(rx));
    Control {
        addr,
        events,
        shutdown,
        handle,
    }
}

#[tokio::test]
async fn viewer_receives_processed_jpeg_from_live_pipeline() {
    let state = Arc::new(SharedFrameState::default());
    let registry = ConnectionRegistry::new();
    let processor = ProcessorHandle::new(EdgeProcessor::new(80, true));
    let bridge = Arc::new(CaptureBridge::start(processor, Arc::clone(&state)).unwrap());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let capture = CaptureConfig {
        width: 64,
        height: 48,
        fps: 50.0,
        ..CaptureConfig::default()
    };
    let source = tokio::spawn(synthetic::run_synthetic_source(
        capture,
        Arc::clone(&bridge),
        shutdown_rx.clone(),
    ));

    let stream_config = StreamConfig {
        frame_interval_ms: 10,
        ..StreamConfig::default()
    };
    let server = StreamingServer::bind(
        localhost(),
        &stream_config,
        Arc::clone(&state),
        Arc::clone(&registry),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let server = tokio::spawn(server.run(shutdown_rx));

    let mut viewer = TcpStream::connect(addr).await.unwrap();
    let mut raw = Vec::new();
    let mut splitter = MultipartSplitter::new(&stream_config.boundary);
    let mut buf = [0u8; 8192];
    let part = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let n = viewer.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed early");
            raw.extend_from_slice(&buf[..n]);
            if let Some(part) = splitter.push(&buf[..n]).into_iter().next() {
                return part;
            }
        }
    })
    .await
    .expect("no frame within 2s");

    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Type: multipart/x-mixed-replace; boundary=mjpegstream"));
    assert!(text.contains("Content-Type: image/jpeg"));
    assert_eq!(&part[..2], &[0xFF, 0xD8], "part is not a JPEG");

    // Rotated for the stream: 64x48 in, 48x64 out.
    let decoded = image::load_from_memory(&part).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (48, 64));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), source).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    tokio::task::spawn_blocking(move || bridge.shutdown()).await.unwrap();
    assert!(state.frames_published() > 0);
}

#[tokio::test]
async fn controller_updates_thresholds_and_survives_garbage() {
    let state = Arc::new(SharedFrameState::default());
    let registry = ConnectionRegistry::new();
    let control = start_control(
        Arc::clone(&state),
        Arc::clone(&registry),
        Arc::new(MemorySink::default()),
    )
    .await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", control.addr))
        .await
        .unwrap();

    ws.send(Message::Text("{not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"zoom","level":3}"#.into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"threshold","low":20,"high":80}"#.into()))
        .await
        .unwrap();
    eventually("first threshold", || {
        state.parameters() == ProcessingParameters::new(20, 80)
    })
    .await;

    // Same connection keeps working; last write wins.
    ws.send(Message::Text(r#"{"type":"threshold","low":50,"high":150}"#.into()))
        .await
        .unwrap();
    eventually("second threshold", || {
        state.parameters() == ProcessingParameters::new(50, 150)
    })
    .await;

    ws.close(None).await.unwrap();
    eventually("controller deregistered", || {
        registry.count(ConnectionKind::Controller) == 0
    })
    .await;

    control.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), control.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn snapshot_stores_latest_frame_and_fps_reaches_controller() {
    let state = Arc::new(SharedFrameState::default());
    let registry = ConnectionRegistry::new();
    let sink = Arc::new(MemorySink::default());
    let control = start_control(Arc::clone(&state), Arc::clone(&registry), Arc::clone(&sink)).await;

    state.publish_frame(Bytes::from_static(b"\xFF\xD8older"));
    state.publish_frame(Bytes::from_static(b"\xFF\xD8latest\xFF\xD9"));

    // Any path is accepted.
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/control", control.addr))
        .await
        .unwrap();
    eventually("controller registered", || {
        registry.count(ConnectionKind::Controller) == 1
    })
    .await;

    ws.send(Message::Text(r#"{"type":"snapshot"}"#.into())).await.unwrap();
    eventually("snapshot stored", || !sink.0.lock().unwrap().is_empty()).await;
    {
        let stored = sink.0.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].0.starts_with("EdgeViewer_"));
        assert!(stored[0].0.ends_with(".jpg"));
        assert_eq!(stored[0].1, b"\xFF\xD8latest\xFF\xD9");
    }

    assert_eq!(control.events.publish(ControlEvent::Fps { value: 42 }), 1);
    let pushed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("control stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no fps event");
    assert_eq!(pushed, r#"{"type":"fps","value":42}"#);

    // Shutdown closes the controller's socket.
    control.shutdown.send(true).unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "controller was not closed on shutdown");
}
