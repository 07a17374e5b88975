use std::io::Cursor;
use std::sync::Arc;
use async_trait::async_trait;
use image::AnimationDecoder;
use image::codecs::gif::GifDecoder;
use tracing::{debug, info};
use crate::config::TranscodeConfig;
use crate::errors::{MediaQueueError, Result};
use crate::queue::QueueOp;
use crate::scheduler::{report_failure, Committer};
use crate::types::{mime_from_extension, AdditionalData, ItemId, MediaFile, Stage, MEDIA_SOURCE_KEY};

/// Transformation applied to a file before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeKind {
    VideoOptimization,
    GifConversion,
}

impl TranscodeKind {
    /// Value stamped under [`MEDIA_SOURCE_KEY`] on the transcoded item.
    pub fn tag(self) -> &'static str {
        match self {
            TranscodeKind::VideoOptimization => "video-optimization",
            TranscodeKind::GifConversion => "gif-conversion",
        }
    }
}

/// External transcoding engine
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, file: &MediaFile) -> Result<MediaFile>;

    async fn convert_animated_image_to_video(&self, file: &MediaFile) -> Result<MediaFile>;
}

/// Decides whether a file goes through the transcoder at all.
#[derive(Debug, Clone)]
pub struct TranscodePolicy {
    pub enabled: bool,
    pub max_file_size: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for TranscodePolicy {
    fn default() -> Self {
        Self::from_config(&TranscodeConfig::default())
    }
}

impl TranscodePolicy {
    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_file_size: config.max_file_size,
            allowed_mime_types: config.allowed_mime_types.clone(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// MIME type allow-list check, falling back to the extension.
    pub fn can_transcode(&self, file: &MediaFile) -> bool {
        let allowed = |mime: &str| {
            self.allowed_mime_types
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(mime))
        };

        if allowed(&file.mime_type) {
            return true;
        }

        file.extension()
            .and_then(|ext| mime_from_extension(&ext))
            .is_some_and(allowed)
    }

    pub fn is_too_large(&self, file: &MediaFile) -> bool {
        file.size > self.max_file_size
    }

    /// `Ok` with the transformation to run, or a validation error saying why the
    /// file goes to upload untouched.
    pub fn check(&self, file: &MediaFile) -> Result<TranscodeKind> {
        if !self.enabled {
            return Err(MediaQueueError::validation("transcoding is disabled"));
        }

        if !self.can_transcode(file) {
            return Err(MediaQueueError::validation(format!(
                "{} ({}) is not a transcodable type",
                file.name, file.mime_type
            )));
        }

        if self.is_too_large(file) {
            return Err(MediaQueueError::validation(format!(
                "{} is {} bytes, over the {} byte limit",
                file.name, file.size, self.max_file_size
            )));
        }

        if file.is_gif() || file.extension().as_deref() == Some("gif") {
            return if is_animated_gif(&file.data) {
                Ok(TranscodeKind::GifConversion)
            } else {
                Err(MediaQueueError::validation(format!("{} is not animated", file.name)))
            };
        }

        Ok(TranscodeKind::VideoOptimization)
    }

    /// [`check`](Self::check) on the blocking pool, since GIF detection decodes frames.
    pub async fn check_async(&self, file: &MediaFile) -> Result<TranscodeKind> {
        let policy = self.clone();
        let file = file.clone();

        tokio::task::spawn_blocking(move || policy.check(&file))
            .await
            .map_err(|err| {
                MediaQueueError::internal_error(format!("Eligibility check panicked: {}", err))
            })?
    }

    pub fn is_eligible(&self, file: &MediaFile) -> bool {
        self.check(file).is_ok()
    }
}

/// A GIF with more than one decodable frame.
pub fn is_animated_gif(data: &[u8]) -> bool {
    let Ok(decoder) = GifDecoder::new(Cursor::new(data)) else {
        return false;
    };

    decoder
        .into_frames()
        .take(2)
        .take_while(|frame| frame.is_ok())
        .count()
        > 1
}

pub struct TranscodeWorker {
    transcoder: Arc<dyn Transcoder>,
}

impl TranscodeWorker {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder }
    }

    /// Runs one transcode for the item. Failures cancel the item and are not retried.
    pub(crate) async fn run(
        &self,
        id: ItemId,
        kind: TranscodeKind,
        committer: &Committer,
    ) -> Result<()> {
        let item = committer.commit(id, QueueOp::StartTranscoding).await?.item;
        debug!(item_id = %id, file = %item.file.name, kind = kind.tag(), "transcoding started");

        let result = match kind {
            TranscodeKind::GifConversion => {
                self.transcoder.convert_animated_image_to_video(&item.file).await
            }
            TranscodeKind::VideoOptimization => self.transcoder.transcode(&item.file).await,
        };

        match result {
            Ok(file) => {
                info!(
                    item_id = %id,
                    from = %item.file.name,
                    to = %file.name,
                    size = file.size,
                    "transcoding finished"
                );

                let mut additional_data = AdditionalData::new();
                additional_data.insert(MEDIA_SOURCE_KEY.to_string(), kind.tag().to_string());

                committer
                    .commit(id, QueueOp::FinishTranscoding { file, additional_data })
                    .await?;
                Ok(())
            }
            Err(err) => {
                let err = err.for_stage(Stage::Transcode);
                report_failure(Stage::Transcode, &item, &err);
                committer
                    .commit(id, QueueOp::CancelUploading {
                        stage: Stage::Transcode,
                        error: err.to_string(),
                    })
                    .await?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Frame, RgbaImage};

    pub(crate) fn gif_bytes(frames: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buf);
            let frames = (0..frames).map(|i| {
                let mut image = RgbaImage::new(4, 4);
                image.put_pixel(0, 0, image::Rgba([i as u8 * 40, 0, 0, 255]));
                Frame::new(image)
            });
            encoder.encode_frames(frames).unwrap();
        }
        buf
    }

    fn policy() -> TranscodePolicy {
        TranscodePolicy {
            enabled: true,
            max_file_size: 1024,
            allowed_mime_types: vec![
                "video/quicktime".to_string(),
                "video/mp4".to_string(),
                "image/gif".to_string(),
            ],
        }
    }

    #[test]
    fn test_video_is_eligible() {
        let file = MediaFile::new("clip.mov", "", vec![0u8; 64]);
        assert_eq!(policy().check(&file).unwrap(), TranscodeKind::VideoOptimization);
    }

    #[test]
    fn test_png_is_not_transcodable() {
        let file = MediaFile::new("photo.png", "image/png", vec![0u8; 64]);
        assert!(!policy().can_transcode(&file));
        assert!(matches!(policy().check(&file), Err(MediaQueueError::Validation(_))));
    }

    #[test]
    fn test_extension_fallback() {
        let file = MediaFile::new("clip.mov", "application/x-unknown", vec![0u8; 8]);
        assert!(policy().can_transcode(&file));
    }

    #[test]
    fn test_oversized_file_skips_transcoding() {
        let file = MediaFile::new("clip.mp4", "video/mp4", vec![0u8; 2048]);
        assert!(policy().is_too_large(&file));
        assert!(!policy().is_eligible(&file));
    }

    #[test]
    fn test_disabled_policy() {
        let file = MediaFile::new("clip.mp4", "video/mp4", vec![0u8; 8]);
        assert!(!TranscodePolicy::disabled().is_eligible(&file));
    }

    #[test]
    fn test_animated_gif_detection() {
        assert!(is_animated_gif(&gif_bytes(3)));
        assert!(!is_animated_gif(&gif_bytes(1)));
        assert!(!is_animated_gif(b"GIF89a-not-really"));
    }

    #[test]
    fn test_gif_conversion_only_when_animated() {
        let animated = MediaFile::new("loop.gif", "", gif_bytes(2));
        assert_eq!(policy().check(&animated).unwrap(), TranscodeKind::GifConversion);

        let still = MediaFile::new("still.gif", "", gif_bytes(1));
        assert!(policy().check(&still).is_err());
    }

    #[tokio::test]
    async fn test_check_async_matches_check() {
        let animated = MediaFile::new("loop.gif", "", gif_bytes(2));
        assert_eq!(policy().check_async(&animated).await.unwrap(), TranscodeKind::GifConversion);

        let png = MediaFile::new("photo.png", "image/png", vec![0u8; 8]);
        assert!(matches!(policy().check_async(&png).await, Err(MediaQueueError::Validation(_))));
    }

    #[test]
    fn test_tags() {
        assert_eq!(TranscodeKind::VideoOptimization.tag(), "video-optimization");
        assert_eq!(TranscodeKind::GifConversion.tag(), "gif-conversion");
    }
}
