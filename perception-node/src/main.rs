use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use gatewatch_common::CameraConfig;
use gatewatch_perception::camera::ffmpeg::FfmpegSourceFactory;
use gatewatch_perception::camera::multi_camera::MultiCameraManager;
use gatewatch_perception::camera::registry::{CameraRegistry, HttpCameraRegistry, StaticCameraRegistry};
use gatewatch_perception::camera::worker::Backoff;
use gatewatch_perception::config::{IngestionMode, PerceptionConfig};
use gatewatch_perception::error::{PerceptionError, Result};
use gatewatch_perception::inference::{FaceEmbedder, HttpInferenceClient};
use gatewatch_perception::messaging::{create_publisher, EventPublisher};
use gatewatch_perception::processing::batch_assembler::{BatchAssembler, BatchProcessor};
use gatewatch_perception::processing::frame_queue::FrameQueue;
use gatewatch_perception::processing::pipeline::{PipelineServices, PipelineSettings};
use gatewatch_perception::recognition::loader::reload_loop;
use gatewatch_perception::recognition::{HttpIdentitySource, IdentityMatcher, IdentitySnapshot, IdentitySource};
use gatewatch_perception::utils::health_check::HealthMonitor;
use gatewatch_perception::utils::metrics::Metrics;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/perception.yaml")]
    config: String,

    /// Log level, overrides `logging.level` from the config file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PerceptionConfig::load(&args.config)?;
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, config.logging.json)?;

    info!("Starting gatewatch perception node {}", config.node_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app_state = AppState::new(config, shutdown_rx.clone()).await?;
    let queue = app_state.start();

    let health_monitor = HealthMonitor::new(
        app_state.config.node_id.clone(),
        app_state.camera_manager.list_cameras(),
        app_state.camera_manager.states(),
        queue.clone(),
        app_state.matcher.clone(),
    );
    tokio::spawn(health_monitor.start(
        Duration::from_secs(app_state.config.monitoring.health_check_interval_sec.max(1)),
        shutdown_rx.clone(),
    ));

    tokio::spawn(app_state.metrics().clone().report_loop(
        Duration::from_secs(app_state.config.monitoring.report_interval_secs.max(1)),
        queue,
        shutdown_rx.clone(),
    ));

    if let Some(source) = app_state.identity_source.clone() {
        let interval = app_state.config.recognition.reload_interval_secs;
        if interval > 0 {
            tokio::spawn(reload_loop(
                source,
                app_state.matcher.clone(),
                Duration::from_secs(interval),
                shutdown_rx.clone(),
            ));
        }
    }

    wait_for_shutdown().await;

    info!("Shutting down gatewatch perception node");
    let _ = shutdown_tx.send(true);
    app_state.camera_manager.stop_all(SHUTDOWN_GRACE).await;
    Ok(())
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder().with_max_level(log_level);
    let result = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.map_err(|e| PerceptionError::ConfigError(e.to_string()))
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

struct AppState {
    config: PerceptionConfig,
    cameras: Vec<CameraConfig>,
    camera_manager: Arc<MultiCameraManager>,
    matcher: Arc<IdentityMatcher>,
    identity_source: Option<Arc<dyn IdentitySource>>,
    services: PipelineServices,
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    async fn new(config: PerceptionConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);

        let cameras = fetch_cameras(&config).await?;
        if cameras.is_empty() {
            return Err(PerceptionError::ConfigError("no enabled cameras to run".to_string()));
        }

        let identity_source = identity_source(&config)?;
        let snapshot = match &identity_source {
            Some(source) => source.load().await.unwrap_or_else(|e| {
                warn!("Initial identity load failed, starting with an empty registry: {}", e);
                IdentitySnapshot::empty()
            }),
            None => IdentitySnapshot::empty(),
        };
        let matcher = Arc::new(IdentityMatcher::new(snapshot));

        let publisher: Arc<dyn EventPublisher> = create_publisher(&config.messaging)?;
        let inference = Arc::new(HttpInferenceClient::new(&config.inference)?);
        let embedder: Option<Arc<dyn FaceEmbedder>> = if config.recognition.enabled {
            Some(inference.clone())
        } else {
            None
        };

        let services = PipelineServices {
            detector: inference,
            embedder,
            matcher: matcher.clone(),
            publisher,
            metrics: metrics.clone(),
        };

        let camera_manager = Arc::new(MultiCameraManager::new(
            cameras.clone(),
            Arc::new(FfmpegSourceFactory::new(&config.capture)),
            Backoff::new(config.capture.backoff_floor(), config.capture.backoff_cap()),
            metrics,
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            cameras,
            camera_manager,
            matcher,
            identity_source,
            services,
            shutdown,
        })
    }

    /// Spawn workers for the configured ingestion shape. Returns the shared
    /// queue when running batched.
    fn start(&self) -> Option<Arc<FrameQueue>> {
        let settings = PipelineSettings::from(&self.config);
        match self.config.processing.ingestion {
            IngestionMode::Inline => {
                self.camera_manager.start_inline(&settings, &self.services);
                None
            }
            IngestionMode::Batched => {
                let queue = Arc::new(FrameQueue::new(self.config.processing.max_queue_size));
                let assembler = BatchAssembler::new(
                    queue.clone(),
                    self.config.processing.batch_size,
                    self.config.processing.batch_timeout(),
                );
                let processor = BatchProcessor::new(assembler, &self.cameras, settings, self.services.clone());
                tokio::spawn(processor.run(self.shutdown.clone()));
                self.camera_manager.start_queued(queue.clone());
                Some(queue)
            }
        }
    }

    fn metrics(&self) -> &Arc<Metrics> {
        &self.services.metrics
    }
}

async fn fetch_cameras(config: &PerceptionConfig) -> Result<Vec<CameraConfig>> {
    let registry: Box<dyn CameraRegistry> = match &config.registry.url {
        Some(url) => Box::new(HttpCameraRegistry::new(
            url.clone(),
            Duration::from_secs(config.registry.timeout_secs),
        )?),
        None => Box::new(StaticCameraRegistry::new(config.cameras.clone())),
    };
    registry.fetch().await
}

fn identity_source(config: &PerceptionConfig) -> Result<Option<Arc<dyn IdentitySource>>> {
    if !config.recognition.enabled {
        return Ok(None);
    }
    let Some(url) = &config.recognition.embeddings_url else {
        warn!("Recognition enabled without recognition.embeddings_url; no identities will match");
        return Ok(None);
    };
    let source = HttpIdentitySource::new(
        url.clone(),
        config.recognition.api_token.clone(),
        Duration::from_secs(config.registry.timeout_secs),
    )?;
    Ok(Some(Arc::new(source)))
}
