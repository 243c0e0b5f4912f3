mod ros;

use camera_upload_common::config::{Config, ConfigError};
use camera_upload_node::gate::RateGate;
use camera_upload_node::pipeline::{CaptureNode, Uploader};
use camera_upload_node::storage::{BlobStore, S3BlobStore, StorageError};
use futures_util::{Stream, StreamExt};
use r2r::sensor_msgs::msg::Image;
use r2r::QosProfile;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("ros: {0}")]
    Ros(#[from] r2r::Error),
}

/// Arguments before `--ros-args` belong to us; the first one is the config path.
fn config_path_arg() -> Option<PathBuf> {
    std::env::args()
        .skip(1)
        .take_while(|a| a != "--ros-args")
        .next()
        .map(PathBuf::from)
}

fn load_config() -> Result<Config, ConfigError> {
    match config_path_arg() {
        Some(path) => Config::load(&path),
        None => {
            let path = PathBuf::from("config.toml");
            if path.exists() {
                Config::load(&path)
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    if let Err(e) = run(config).await {
        error!(error = %e, "camera uploader failed");
        std::process::exit(1);
    }
}

async fn run(mut config: Config) -> Result<(), NodeError> {
    let started_at = Instant::now();
    let ctx = r2r::Context::create()?;
    let mut node = r2r::Node::create(ctx, ros::NODE_NAME, "")?;

    ros::apply_parameters(&node, &mut config);
    ros::declare_parameters(&node, &config);
    config.validate()?;

    let (param_handler, mut param_events) = node.make_parameter_handler()?;
    tokio::spawn(param_handler);
    tokio::spawn(async move {
        while let Some((name, value)) = param_events.next().await {
            warn!(parameter = name, value = ?value, "parameter changed; restart the node to apply it");
        }
    });

    let interval = config.capture.interval()?;

    info!(
        topic = config.capture.topic,
        container = config.store.container_name,
        interval_secs = interval.as_secs_f64(),
        jpeg_quality = config.capture.jpeg_quality,
        "starting camera uploader"
    );

    let store = S3BlobStore::new(&config.store).await?;
    let capture = CaptureNode::new(
        RateGate::new(interval, started_at),
        Uploader::new(store, config.store.prefix.clone(), config.capture.jpeg_quality),
    );
    capture.setup().await;

    let qos = QosProfile::default().keep_last(config.capture.queue_depth);
    let frames = node.subscribe::<Image>(&config.capture.topic, qos)?;
    info!(topic = config.capture.topic, "subscribed to image topic");

    let running = Arc::new(AtomicBool::new(true));
    let spinner = {
        let running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::Relaxed) {
                node.spin_once(Duration::from_millis(100));
            }
        })
    };

    tokio::select! {
        _ = consume_frames(frames, &capture) => {
            info!("image subscription closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down camera uploader");
        }
    }

    running.store(false, Ordering::Relaxed);
    if let Err(e) = spinner.await {
        error!(error = %e, "node spin thread panicked");
    }

    let stats = capture.stats();
    info!(
        received = stats.received,
        rate_limited = stats.rate_limited,
        uploaded = stats.uploaded,
        failed = stats.failed,
        container = capture.uploader().store().container(),
        "camera uploader stopped"
    );
    Ok(())
}

/// Frames are handled strictly one after another; the next message is not
/// taken until the current upload has finished.
async fn consume_frames<S: BlobStore>(
    mut frames: impl Stream<Item = Image> + Unpin,
    capture: &CaptureNode<S>,
) {
    let mut total: u64 = 0;
    while let Some(msg) = frames.next().await {
        let frame = ros::frame_from_msg(msg, Instant::now());
        capture.handle_frame(&frame).await;

        total += 1;
        if total % 100 == 0 {
            debug!(total, "frames processed");
        }
    }
}
