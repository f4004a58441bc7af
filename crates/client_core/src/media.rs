//! Turns local image references into transmittable payloads.

use std::{
    collections::BTreeMap,
    io::Cursor,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::join_all;
use image::{codecs::jpeg::JpegEncoder, DynamicImage, GenericImageView};
use shared::{
    domain::{ImageRef, ProtocolId, SlotId},
    protocol::ImagePayload,
};
use tracing::debug;
use url::Url;

use crate::error::{MediaError, NormalizationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_dimension: 1024,
            jpeg_quality: 80,
        }
    }
}

/// Where the bytes of a reference live once it has been qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    Inline(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct ImagePipeline {
    options: PipelineOptions,
}

impl ImagePipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// Encodes every slot concurrently. The output follows slot id order and
    /// any single failure fails the whole batch.
    pub async fn normalize(
        &self,
        protocol: ProtocolId,
        slots: &BTreeMap<SlotId, ImageRef>,
    ) -> Result<Vec<ImagePayload>, NormalizationError> {
        let options = self.options;
        let jobs = slots.iter().map(|(slot, reference)| {
            let slot = slot.clone();
            let label = protocol.slot_label(&slot);
            let reference = reference.clone();
            async move {
                let encoded = tokio::task::spawn_blocking(move || {
                    let source = resolve_reference(&reference)?;
                    let bytes = load_source(source)?;
                    encode_for_transport(&bytes, options)
                })
                .await
                .map_err(|err| MediaError::Worker(err.to_string()))
                .and_then(|inner| inner);
                (slot, label, encoded)
            }
        });

        let mut payloads = Vec::with_capacity(slots.len());
        let mut failures = Vec::new();
        for (slot, label, encoded) in join_all(jobs).await {
            match encoded {
                Ok(encoded_bytes) => payloads.push(ImagePayload {
                    id: slot,
                    label,
                    encoded_bytes,
                }),
                Err(err) => failures.push((slot, err)),
            }
        }

        if !failures.is_empty() {
            return Err(NormalizationError { failures });
        }

        payloads.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(
            protocol = %protocol,
            images = payloads.len(),
            "normalized submission images"
        );
        Ok(payloads)
    }
}

/// Qualifies a reference: inline `data:` URIs are decoded in memory, `file://`
/// URLs and bare paths resolve to an absolute path.
pub fn resolve_reference(reference: &ImageRef) -> Result<ResolvedSource, MediaError> {
    let raw = reference.as_str().trim();
    if raw.is_empty() {
        return Err(MediaError::InvalidReference {
            reference: raw.to_string(),
            reason: "empty reference".to_string(),
        });
    }

    if let Some(rest) = raw.strip_prefix("data:") {
        return decode_data_uri(raw, rest).map(ResolvedSource::Inline);
    }

    let url = match Url::parse(raw) {
        // single letter schemes are Windows drive prefixes, not URLs
        Ok(url) if url.scheme().len() > 1 => url,
        _ => qualify_path(Path::new(raw))?,
    };

    if url.scheme() != "file" {
        return Err(MediaError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
        });
    }

    url.to_file_path()
        .map(ResolvedSource::File)
        .map_err(|()| MediaError::InvalidReference {
            reference: raw.to_string(),
            reason: "file URL has no local path".to_string(),
        })
}

pub fn qualify_path(path: &Path) -> Result<Url, MediaError> {
    let absolute = std::path::absolute(path).map_err(|err| MediaError::InvalidReference {
        reference: path.display().to_string(),
        reason: err.to_string(),
    })?;
    Url::from_file_path(&absolute).map_err(|()| MediaError::InvalidReference {
        reference: path.display().to_string(),
        reason: "path cannot be expressed as a file URL".to_string(),
    })
}

fn decode_data_uri(raw: &str, rest: &str) -> Result<Vec<u8>, MediaError> {
    let Some((header, body)) = rest.split_once(',') else {
        return Err(MediaError::InvalidReference {
            reference: truncate(raw),
            reason: "data URI has no payload".to_string(),
        });
    };
    if !header.split(';').any(|part| part == "base64") {
        return Err(MediaError::InvalidReference {
            reference: truncate(raw),
            reason: "only base64 data URIs are supported".to_string(),
        });
    }
    Ok(STANDARD.decode(body.trim())?)
}

fn truncate(raw: &str) -> String {
    raw.chars().take(48).collect()
}

fn load_source(source: ResolvedSource) -> Result<Vec<u8>, MediaError> {
    match source {
        ResolvedSource::Inline(bytes) => Ok(bytes),
        ResolvedSource::File(path) => std::fs::read(&path).map_err(|source| MediaError::Read {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Downscales to fit `max_dimension`, re-encodes as JPEG and base64 encodes.
pub fn encode_for_transport(bytes: &[u8], options: PipelineOptions) -> Result<String, MediaError> {
    let decoded = image::load_from_memory(bytes)?;
    let bounded = downscale(decoded, options.max_dimension);
    let rgb = bounded.to_rgb8();

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, options.jpeg_quality).encode_image(&rgb)?;
    Ok(STANDARD.encode(out.into_inner()))
}

fn downscale(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max_dimension && height <= max_dimension {
        image
    } else {
        image.thumbnail(max_dimension, max_dimension)
    }
}

#[cfg(test)]
#[path = "tests/media_tests.rs"]
mod tests;
