use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mediaqueue::config::Config;
use mediaqueue::probe::{ImageProbe, LocalProbe};
use mediaqueue::transcode::TranscodePolicy;
use mediaqueue::{
    FfmpegProbe, FfmpegTranscoder, HttpUploader, ItemState, MediaFile, MediaQueue, QueueEvent,
    QueueItem, Resource, UploadCallback,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mediaqueue", version, about = "Transcode and upload media files")]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Debug logging (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue files and wait until every one is uploaded or cancelled
    Upload {
        /// Upload files as they are
        #[arg(long)]
        no_transcode: bool,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Check the config file and exit
    Validate,
}

struct LogCallback;

impl UploadCallback for LogCallback {
    fn on_upload_start(&self, item: &QueueItem) {
        tracing::info!("Uploading {} ({} bytes)", item.file.name, item.file.size);
    }

    fn on_upload_progress(&self, item: &QueueItem) {
        tracing::info!("Transcoded to {} ({} bytes)", item.file.name, item.file.size);
    }

    fn on_upload_error(&self, item: &QueueItem, error: &str) {
        tracing::error!("Failed {}: {}", item.file.name, error);
    }

    fn on_upload_success(&self, item: &QueueItem) {
        tracing::info!("Uploaded {} to {}", item.file.name, item.resource.src);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "mediaqueue=debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::load_config(&cli.config)?;

    match cli.command {
        Commands::Validate => {
            println!("{} is valid", cli.config.display());
            Ok(())
        }
        Commands::Upload { no_transcode, files } => upload_files(config, no_transcode, files).await,
    }
}

async fn upload_files(config: Config, no_transcode: bool, files: Vec<PathBuf>) -> Result<()> {
    let uploader = HttpUploader::new(&config.upload)?;
    tracing::info!("Uploading {} file(s) to {}", files.len(), uploader.endpoint());

    let mut builder = MediaQueue::builder()
        .config(config.queue.clone())
        .uploader(Arc::new(uploader));

    let transcode = config.transcode.enabled && !no_transcode;
    let probe: Arc<dyn LocalProbe> = match FfmpegProbe::new(config.transcode.ffmpeg_path.as_str()) {
        Ok(probe) if transcode => Arc::new(probe),
        _ => Arc::new(ImageProbe),
    };
    builder = builder.probe(probe);

    if transcode {
        let transcoder = FfmpegTranscoder::new(config.transcode.ffmpeg_path.as_str())?;
        builder = builder
            .transcoder(Arc::new(transcoder))
            .policy(TranscodePolicy::from_config(&config.transcode));
    }

    let handle = builder.build()?;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let event_logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let QueueEvent::StateChanged { id, from, to } = event {
                tracing::debug!("{}: {} -> {}", id, from, to);
            }
        }
    });

    let callback: Arc<dyn UploadCallback> = Arc::new(LogCallback);
    for path in &files {
        let file = MediaFile::from_path(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let src = queue.blob_cache().register(file.data.clone());
        let resource = Resource::placeholder(&file, src);
        queue.add_item(file, resource, Some(callback.clone()), None).await?;
    }

    queue.wait_until_settled().await?;

    let items = queue.get_all_items().await?;
    let mut failed = 0;
    for item in &items {
        match item.state {
            ItemState::Uploaded => println!("{}\t{}", item.file.name, item.resource.src),
            state => {
                failed += 1;
                let error = item.error.as_deref().unwrap_or_default();
                println!("{}\t{}\t{}", item.file.name, state, error);
            }
        }
    }

    drop(queue);
    handle.shutdown().await?;
    event_logger.abort();

    if failed > 0 {
        bail!("{} of {} file(s) failed", failed, items.len());
    }

    Ok(())
}
