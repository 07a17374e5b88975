use std::fs;
use std::path::Path;
use anyhow::{bail, Context};
use serde::Deserialize;
use url::Url;

/// 2 GiB
pub const DEFAULT_MAX_TRANSCODE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

pub const DEFAULT_TRANSCODABLE_MIME_TYPES: &[&str] = &[
    "video/3gpp",
    "video/3gpp2",
    "video/mp2t",
    "video/mp4",
    "video/mpeg",
    "video/ogg",
    "video/quicktime",
    "video/webm",
    "video/x-flv",
    "video/x-h261",
    "video/x-h263",
    "video/x-m4v",
    "video/x-matroska",
    "video/x-mjpeg",
    "video/x-ms-asf",
    "video/x-ms-wmv",
    "video/x-msvideo",
    "video/x-nut",
    "image/gif",
];

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub upload: UploadConfig,
    pub transcode: TranscodeConfig,
    pub queue: QueueConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UploadConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: None,
            timeout_secs: 300,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TranscodeConfig {
    pub enabled: bool,
    pub max_file_size: u64,
    pub ffmpeg_path: String,
    pub allowed_mime_types: Vec<String>,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_size: DEFAULT_MAX_TRANSCODE_SIZE,
            ffmpeg_path: "ffmpeg".to_string(),
            allowed_mime_types: DEFAULT_TRANSCODABLE_MIME_TYPES
                .iter()
                .map(|mime| mime.to_string())
                .collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent_transcodes: usize,
    pub max_concurrent_uploads: usize,
    /// Broadcast buffer; slow subscribers past this lag and miss events
    pub event_capacity: usize,
    pub command_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transcodes: 2,
            max_concurrent_uploads: 4,
            event_capacity: 256,
            command_capacity: 100,
        }
    }
}

impl Config {
    pub fn load_config(path: &Path) -> anyhow::Result<Config> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&config_str)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(config_str: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upload.endpoint.is_empty() {
            bail!("upload.endpoint is required");
        }

        let endpoint = Url::parse(&self.upload.endpoint)
            .with_context(|| format!("upload.endpoint '{}' is not a URL", self.upload.endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            bail!("upload.endpoint must be http or https, got {}", endpoint.scheme());
        }

        if self.queue.max_concurrent_transcodes == 0 || self.queue.max_concurrent_uploads == 0 {
            bail!("queue concurrency limits must be at least 1");
        }

        Ok(())
    }
}
