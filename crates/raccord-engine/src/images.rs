use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, GenericImageView, ImageFormat};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;

use crate::error::GenerationError;
use crate::truncate_text;

/// A base64 image ready to be sent inline to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    pub fn from_bytes(bytes: &[u8], mime_type: Option<&str>) -> Self {
        let mime_type = mime_type
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| value.starts_with("image/"))
            .or_else(|| sniff_mime(bytes).map(str::to_string))
            .unwrap_or_else(|| "image/png".to_string());
        Self {
            mime_type,
            data: BASE64.encode(bytes),
        }
    }

    /// Parses `data:<mime>;base64,<payload>`.
    pub fn parse_data_url(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix("data:")?;
        let (header, data) = rest.split_once(',')?;
        let mime_type = header.strip_suffix(";base64")?;
        if data.is_empty() {
            return None;
        }
        Some(Self {
            mime_type: if mime_type.is_empty() {
                "image/png".to_string()
            } else {
                mime_type.to_string()
            },
            data: data.to_string(),
        })
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.data.as_bytes())
            .context("inline image base64 decode failed")
    }

    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }
}

/// Where a stored image string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef<'a> {
    Inline(InlineImage),
    Remote(&'a str),
    File(&'a Path),
}

impl<'a> ImageRef<'a> {
    pub fn parse(raw: &'a str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with("data:") {
            return InlineImage::parse_data_url(trimmed).map(Self::Inline);
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Some(Self::Remote(trimmed));
        }
        Some(Self::File(Path::new(trimmed)))
    }
}

/// Turns a stored image reference into inline bytes.
pub trait ReferenceLoader: Send + Sync {
    fn load(&self, source: &str) -> Result<InlineImage>;
}

/// Resolves data URLs in place, downloads http(s) URLs and reads local files.
pub struct HttpReferenceLoader {
    http: HttpClient,
    timeout: Duration,
}

impl HttpReferenceLoader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(),
            timeout,
        }
    }

    fn download(&self, url: &str) -> Result<InlineImage> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .with_context(|| format!("failed downloading reference ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("download failed ({code}): {}", truncate_text(&body, 256));
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading reference bytes")?;
        Ok(InlineImage::from_bytes(&bytes, mime_type.as_deref()))
    }
}

impl Default for HttpReferenceLoader {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ReferenceLoader for HttpReferenceLoader {
    fn load(&self, source: &str) -> Result<InlineImage> {
        let reference = describe_reference(source);
        let loaded = match ImageRef::parse(source) {
            None => Err(anyhow::anyhow!("empty or malformed image reference")),
            Some(ImageRef::Inline(image)) => Ok(image),
            Some(ImageRef::Remote(url)) => self.download(url),
            Some(ImageRef::File(path)) => std::fs::read(path)
                .with_context(|| format!("failed reading {}", path.display()))
                .map(|bytes| InlineImage::from_bytes(&bytes, mime_for_path(path))),
        };
        loaded.map_err(|err| {
            GenerationError::ReferenceLoad {
                reference,
                reason: format!("{err:#}"),
            }
            .into()
        })
    }
}

/// Short label for logs; never echoes inline payloads.
pub fn describe_reference(source: &str) -> String {
    let trimmed = source.trim();
    if trimmed.starts_with("data:") {
        let mime = trimmed
            .strip_prefix("data:")
            .and_then(|rest| rest.split(';').next())
            .unwrap_or("image");
        return format!("<inline {mime}>");
    }
    truncate_text(trimmed, 160)
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type())
        .filter(|mime| mime.starts_with("image/"))
}

/// Splits a 2x2 montage into its four frames, row-major.
pub fn split_grid(grid: &InlineImage) -> Result<Vec<InlineImage>> {
    let bytes = grid.decode()?;
    let image = image::load_from_memory(&bytes).context("failed decoding grid image")?;
    let (width, height) = image.dimensions();
    if width < 2 || height < 2 {
        anyhow::bail!("grid image too small to split ({width}x{height})");
    }
    let cell_w = width / 2;
    let cell_h = height / 2;
    let mut frames = Vec::with_capacity(4);
    for row in 0..2 {
        for col in 0..2 {
            let cell = image.crop_imm(col * cell_w, row * cell_h, cell_w, cell_h);
            frames.push(encode_png(&cell)?);
        }
    }
    Ok(frames)
}

pub fn encode_png(image: &DynamicImage) -> Result<InlineImage> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .context("failed encoding png")?;
    Ok(InlineImage {
        mime_type: "image/png".to_string(),
        data: BASE64.encode(buffer.into_inner()),
    })
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn quadrant_grid() -> Result<InlineImage> {
        let mut canvas = RgbImage::new(8, 6);
        for (x, y, pixel) in canvas.enumerate_pixels_mut() {
            let quadrant = (y / 3) * 2 + (x / 4);
            *pixel = Rgb([quadrant as u8 * 60, 10, 20]);
        }
        encode_png(&DynamicImage::ImageRgb8(canvas))
    }

    #[test]
    fn data_url_round_trips_through_parse() {
        let image = InlineImage::from_bytes(b"not really png", Some("image/jpeg; charset=x"));
        assert_eq!(image.mime_type, "image/jpeg");
        let parsed = InlineImage::parse_data_url(&image.to_data_url()).expect("parse");
        assert_eq!(parsed, image);
        assert!(InlineImage::parse_data_url("data:image/png,raw").is_none());
    }

    #[test]
    fn split_grid_returns_quadrants_in_row_major_order() -> Result<()> {
        let frames = split_grid(&quadrant_grid()?)?;
        assert_eq!(frames.len(), 4);
        for (idx, frame) in frames.iter().enumerate() {
            let decoded = image::load_from_memory(&frame.decode()?)?.to_rgb8();
            assert_eq!(decoded.dimensions(), (4, 3));
            assert_eq!(decoded.get_pixel(0, 0)[0], idx as u8 * 60);
        }
        Ok(())
    }

    #[test]
    fn loader_reads_files_and_reports_missing_ones() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("face.png");
        let grid = quadrant_grid()?;
        std::fs::write(&path, grid.decode()?)?;

        let loader = HttpReferenceLoader::default();
        let loaded = loader.load(path.to_string_lossy().as_ref())?;
        assert_eq!(loaded.mime_type, "image/png");
        assert_eq!(loaded.data, grid.data);

        let err = loader
            .load(temp.path().join("missing.png").to_string_lossy().as_ref())
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("could not be loaded"));
        Ok(())
    }

    #[test]
    fn inline_references_are_described_without_payload() {
        assert_eq!(
            describe_reference("data:image/webp;base64,AAAA"),
            "<inline image/webp>"
        );
        assert!(matches!(
            ImageRef::parse("https://cdn.example/a.png"),
            Some(ImageRef::Remote(_))
        ));
        assert!(ImageRef::parse("  ").is_none());
    }
}
