//! ffmpeg-backed transcoder and video probe.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;
use crate::errors::{MediaQueueError, Result};
use crate::probe::{ImageProbe, LocalProbe, ProbeInfo};
use crate::transcode::Transcoder;
use crate::types::MediaFile;

const OUTPUT_MIME_TYPE: &str = "video/mp4";

fn validate_ffmpeg_path(ffmpeg_path: &str) -> Result<()> {
    let dangerous_chars = [';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r'];
    if ffmpeg_path.is_empty() || ffmpeg_path.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(MediaQueueError::ConfigError(format!("Invalid ffmpeg_path: {:?}", ffmpeg_path)));
    }
    Ok(())
}

/// Writes `file` into `dir` under its own extension so ffmpeg can sniff the container.
async fn write_input(dir: &TempDir, file: &MediaFile) -> Result<PathBuf> {
    let name = match file.extension() {
        Some(ext) => format!("input.{}", ext),
        None => "input".to_string(),
    };
    let path = dir.path().join(name);
    tokio::fs::write(&path, &file.data).await?;
    Ok(path)
}

async fn run_ffmpeg(ffmpeg_path: &str, input: &Path, args: &[&str], output: &Path) -> Result<()> {
    debug!(ffmpeg = ffmpeg_path, input = %input.display(), ?args, "running ffmpeg");

    let result = Command::new(ffmpeg_path)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(args)
        .arg(output)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| MediaQueueError::transcoding(format!("Failed to execute ffmpeg: {}", err)))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let tail = stderr.lines().rev().take(5).collect::<Vec<_>>();
        let message = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
        return Err(MediaQueueError::transcoding(format!(
            "ffmpeg exited with {}: {}",
            result.status, message
        )));
    }

    Ok(())
}

pub struct FfmpegTranscoder {
    ffmpeg_path: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Result<Self> {
        let ffmpeg_path = ffmpeg_path.into();
        validate_ffmpeg_path(&ffmpeg_path)?;
        Ok(Self { ffmpeg_path })
    }

    async fn to_mp4(&self, file: &MediaFile, args: &[&str]) -> Result<MediaFile> {
        let dir = tempfile::tempdir()?;
        let input = write_input(&dir, file).await?;
        let output = dir.path().join("output.mp4");

        run_ffmpeg(&self.ffmpeg_path, &input, args, &output).await?;

        let data = tokio::fs::read(&output).await?;
        if data.is_empty() {
            return Err(MediaQueueError::transcoding("ffmpeg produced an empty file"));
        }

        Ok(MediaFile::new(format!("{}.mp4", file.stem()), OUTPUT_MIME_TYPE, data))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    /// H.264/AAC MP4 with the index up front for progressive playback.
    async fn transcode(&self, file: &MediaFile) -> Result<MediaFile> {
        self.to_mp4(
            file,
            &[
                "-c:v", "libx264",
                "-preset", "medium",
                "-crf", "23",
                "-pix_fmt", "yuv420p",
                "-c:a", "aac",
                "-b:a", "128k",
                "-movflags", "+faststart",
            ],
        )
        .await
    }

    async fn convert_animated_image_to_video(&self, file: &MediaFile) -> Result<MediaFile> {
        // libx264 with yuv420p needs even dimensions
        self.to_mp4(
            file,
            &[
                "-vf", "scale=trunc(iw/2)*2:trunc(ih/2)*2",
                "-c:v", "libx264",
                "-pix_fmt", "yuv420p",
                "-movflags", "+faststart",
                "-an",
            ],
        )
        .await
    }
}

/// Probe that extracts the first video frame with ffmpeg. Everything else goes
/// to [`ImageProbe`].
pub struct FfmpegProbe {
    ffmpeg_path: String,
}

impl FfmpegProbe {
    pub fn new(ffmpeg_path: impl Into<String>) -> Result<Self> {
        let ffmpeg_path = ffmpeg_path.into();
        validate_ffmpeg_path(&ffmpeg_path)?;
        Ok(Self { ffmpeg_path })
    }
}

#[async_trait]
impl LocalProbe for FfmpegProbe {
    async fn probe(&self, file: &MediaFile) -> Result<ProbeInfo> {
        if !file.is_video() {
            return ImageProbe.probe(file).await;
        }

        let dir = tempfile::tempdir()?;
        let input = write_input(&dir, file).await?;
        let output = dir.path().join("poster.png");

        run_ffmpeg(&self.ffmpeg_path, &input, &["-frames:v", "1", "-f", "image2"], &output)
            .await
            .map_err(|err| MediaQueueError::probe(err.to_string()))?;

        let poster = Bytes::from(tokio::fs::read(&output).await?);
        let (width, height) = image::ImageReader::new(std::io::Cursor::new(&poster))
            .with_guessed_format()?
            .into_dimensions()?;

        Ok(ProbeInfo {
            width,
            height,
            poster: Some(poster),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_dangerous_ffmpeg_path() {
        assert!(FfmpegTranscoder::new("ffmpeg; rm -rf /").is_err());
        assert!(FfmpegTranscoder::new("$(whoami)").is_err());
        assert!(FfmpegProbe::new("").is_err());
    }

    #[test]
    fn test_accepts_plain_paths() {
        assert!(FfmpegTranscoder::new("ffmpeg").is_ok());
        assert!(FfmpegProbe::new("/usr/local/bin/ffmpeg").is_ok());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_transcoding_error() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary").unwrap();
        let file = MediaFile::new("clip.mov", "", vec![0u8; 16]);

        let result = transcoder.transcode(&file).await;
        assert!(matches!(result, Err(MediaQueueError::Transcoding(_))));
    }

    #[tokio::test]
    async fn test_probe_delegates_images() {
        let probe = FfmpegProbe::new("/nonexistent/ffmpeg-binary").unwrap();
        let file = MediaFile::new("photo.png", "image/png", vec![1u8, 2, 3]);

        // Garbage bytes, but the error comes from image decoding, not ffmpeg
        let result = probe.probe(&file).await;
        assert!(matches!(result, Err(MediaQueueError::ImageError(_))));
    }
}
