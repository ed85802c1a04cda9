use edge_viewer_common::config::Config;
use edge_viewer_common::frame::ProcessingParameters;
use edge_viewer_device::capture::{mjpeg, synthetic, CaptureBridge};
use edge_viewer_device::control::ControlServer;
use edge_viewer_device::notify::{Fanout, TracingNotifier, UiNotifier};
use edge_viewer_device::processor::edge::EdgeProcessor;
use edge_viewer_device::processor::ProcessorHandle;
use edge_viewer_device::registry::{ConnectionKind, ConnectionRegistry};
use edge_viewer_device::render::RenderLoop;
use edge_viewer_device::snapshot::DirectorySink;
use edge_viewer_device::state::SharedFrameState;
use edge_viewer_device::stream::StreamingServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        stream_port = config.stream.port,
        control_port = config.control.port,
        source = config.capture.source,
        low = config.processor.low,
        high = config.processor.high,
        "starting edge-viewer"
    );

    let state = Arc::new(SharedFrameState::new(ProcessingParameters::new(
        config.processor.low,
        config.processor.high,
    )));
    let registry = ConnectionRegistry::new();
    let processor = ProcessorHandle::new(EdgeProcessor::new(
        config.processor.jpeg_quality,
        config.processor.rotate,
    ));
    let sink = Arc::new(DirectorySink::new(&config.snapshot.dir));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bridge = match CaptureBridge::start(processor.clone(), Arc::clone(&state)) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            error!(error = %e, "failed to start capture bridge");
            std::process::exit(1);
        }
    };

    let stream_addr = SocketAddr::from(([0, 0, 0, 0], config.stream.port));
    let streaming = match StreamingServer::bind(
        stream_addr,
        &config.stream,
        Arc::clone(&state),
        Arc::clone(&registry),
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start streaming server");
            std::process::exit(1);
        }
    };

    let control_addr = SocketAddr::from(([0, 0, 0, 0], config.control.port));
    let control = match ControlServer::bind(
        control_addr,
        &config.control,
        Arc::clone(&state),
        Arc::clone(&registry),
        sink,
    )
    .await
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to start control server");
            std::process::exit(1);
        }
    };

    let notifier: Arc<dyn UiNotifier> = Arc::new(Fanout(vec![
        Arc::new(TracingNotifier) as Arc<dyn UiNotifier>,
        Arc::new(control.events()) as Arc<dyn UiNotifier>,
    ]));
    notifier.on_notice(&format!(
        "Control available at ws://{}:{}",
        local_hostname(),
        config.control.port
    ));

    let stream_task = tokio::spawn(streaming.run(shutdown_rx.clone()));
    let control_task = tokio::spawn(control.run(shutdown_rx.clone()));

    let render = match RenderLoop::spawn(
        processor,
        Arc::clone(&notifier),
        Duration::from_millis(config.render.interval_ms),
        (config.render.surface_width, config.render.surface_height),
    ) {
        Ok(r) => Some(r),
        Err(e) => {
            error!(error = %e, "failed to start render loop; streaming continues without it");
            None
        }
    };

    let capture_task = match config.capture.source.as_str() {
        "synthetic" => tokio::spawn(synthetic::run_synthetic_source(
            config.capture.clone(),
            Arc::clone(&bridge),
            shutdown_rx.clone(),
        )),
        _ => tokio::spawn(mjpeg::run_mjpeg_source(
            config.capture.url.clone(),
            Arc::clone(&bridge),
            shutdown_rx.clone(),
        )),
    };

    let status_task = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = bridge.stats();
                let params = state.parameters();
                info!(
                    delivered = stats.delivered,
                    processed = stats.processed,
                    dropped = stats.dropped,
                    failed = stats.failed,
                    published = state.frames_published(),
                    viewers = registry.count(ConnectionKind::Viewer),
                    controllers = registry.count(ConnectionKind::Controller),
                    low = params.low,
                    high = params.high,
                    "status"
                );
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    status_task.abort();

    if tokio::time::timeout(SHUTDOWN_GRACE, capture_task).await.is_err() {
        warn!("capture source did not stop in time");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, stream_task).await.is_err() {
        warn!("streaming server did not stop in time");
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, control_task).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "control server exited with error"),
        Err(_) => warn!("control server did not stop in time"),
        _ => {}
    }

    let joined = tokio::task::spawn_blocking(move || {
        if let Some(render) = render {
            render.stop();
        }
        bridge.shutdown();
    })
    .await;
    if let Err(e) = joined {
        error!(error = %e, "spawn_blocking failed");
    }
    info!("edge-viewer stopped");
}

/// Best-effort host name for the control address notice.
fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "0.0.0.0".to_string())
}
