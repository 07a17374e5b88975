//! Local resource probing: best-effort preview metadata derived from the
//! file bytes alone, before anything reaches the server.

use std::io::Cursor;
use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageReader};
use crate::errors::{MediaQueueError, Result};
use crate::types::{MediaFile, Resource, ResourceKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    /// Encoded poster frame (PNG)
    pub poster: Option<Bytes>,
}

#[async_trait]
pub trait LocalProbe: Send + Sync {
    async fn probe(&self, file: &MediaFile) -> Result<ProbeInfo>;
}

/// Probes still images and GIFs with the `image` crate. GIFs also get their
/// first frame as a poster.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageProbe;

#[async_trait]
impl LocalProbe for ImageProbe {
    async fn probe(&self, file: &MediaFile) -> Result<ProbeInfo> {
        if file.is_video() {
            return Err(MediaQueueError::probe(format!(
                "cannot decode frames of {}",
                file.mime_type
            )));
        }

        let data = file.data.clone();
        let with_poster = file.is_gif();

        tokio::task::spawn_blocking(move || probe_image(&data, with_poster))
            .await
            .map_err(|err| {
                MediaQueueError::internal_error(format!("Probe task panicked: {}", err))
            })?
    }
}

fn probe_image(data: &[u8], with_poster: bool) -> Result<ProbeInfo> {
    let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;

    if !with_poster {
        let (width, height) = reader.into_dimensions()?;
        return Ok(ProbeInfo { width, height, poster: None });
    }

    let frame = reader.decode()?;
    Ok(ProbeInfo {
        width: frame.width(),
        height: frame.height(),
        poster: Some(encode_png(&frame)?),
    })
}

pub(crate) fn encode_png(image: &DynamicImage) -> Result<Bytes> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(Bytes::from(buf))
}

/// Resource rebuilt from a probe of `file`. A missing poster keeps the current one.
pub fn local_resource(
    current: &Resource,
    file: &MediaFile,
    info: &ProbeInfo,
    src: String,
    poster: Option<String>,
) -> Resource {
    Resource {
        kind: ResourceKind::from_mime_type(&file.mime_type),
        mime_type: file.mime_type.clone(),
        src,
        poster: poster.or_else(|| current.poster.clone()),
        width: info.width,
        height: info.height,
        is_placeholder: false,
        ..current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        encode_png(&image).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_probe_png_dimensions() {
        let file = MediaFile::new("photo.png", "image/png", png_bytes(4, 3));
        let info = ImageProbe.probe(&file).await.unwrap();

        assert_eq!((info.width, info.height), (4, 3));
        assert!(info.poster.is_none());
    }

    #[tokio::test]
    async fn test_probe_rejects_video() {
        let file = MediaFile::new("clip.mov", "", vec![0u8; 32]);
        assert!(matches!(ImageProbe.probe(&file).await, Err(MediaQueueError::Probe(_))));
    }

    #[tokio::test]
    async fn test_probe_garbage_fails() {
        let file = MediaFile::new("photo.png", "image/png", vec![1u8, 2, 3]);
        assert!(ImageProbe.probe(&file).await.is_err());
    }

    #[test]
    fn test_local_resource_keeps_identity() {
        let file = MediaFile::new("clip.mp4", "video/mp4", Vec::new());
        let gif = MediaFile::new("clip.gif", "", Vec::new());
        let mut current = Resource::placeholder(&gif, "blob:old");
        current.poster = Some("blob:poster".to_string());

        let info = ProbeInfo { width: 8, height: 6, poster: None };
        let resource = local_resource(&current, &file, &info, "blob:new".to_string(), None);

        assert_eq!(resource.src, "blob:new");
        assert_eq!(resource.poster.as_deref(), Some("blob:poster"));
        assert_eq!(resource.kind, ResourceKind::Video);
        assert_eq!((resource.width, resource.height), (8, 6));
        assert_eq!(resource.alt, current.alt);
        assert!(!resource.is_placeholder);
    }
}
