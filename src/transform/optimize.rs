use std::sync::LazyLock;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, ImageFormat};
use regex::Regex;

use crate::pipeline::{Asset, Transform};

static RE_SVG_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<\?xml.*?\?>|<!DOCTYPE[^>]*>|<!--.*?-->|<metadata\b.*?</metadata>|<title>.*?</title>")
        .unwrap()
});

static RE_SVG_GAPS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s+<").unwrap());

/// Losslessly recompresses PNGs, re-encodes JPEGs at the configured quality
/// and strips editor noise from SVGs.
///
/// The smaller of the original and the optimized file is kept, so running
/// this twice never grows a file. Other formats, GIF included, pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeImage {
    pub jpeg_quality: u8,
}

impl Default for OptimizeImage {
    fn default() -> Self {
        Self { jpeg_quality: 85 }
    }
}

impl OptimizeImage {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }
}

impl Transform for OptimizeImage {
    fn name(&self) -> &'static str {
        "optimize-image"
    }

    fn params(&self) -> String {
        format!("png-best;jpeg-q{};svg", self.jpeg_quality)
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let extension = asset
            .path
            .extension()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let optimized = match extension.as_str() {
            "png" => encode_png(&asset.data)?,
            "jpg" | "jpeg" => encode_jpeg(&asset.data, self.jpeg_quality)?,
            "svg" => minify_svg(asset.text()?).into_bytes(),
            _ => return Ok(asset),
        };

        if optimized.len() < asset.data.len() {
            tracing::debug!(
                file = %asset.path,
                "optimized {} -> {} bytes",
                asset.data.len(),
                optimized.len()
            );
            Ok(asset.with_data(optimized))
        } else {
            Ok(asset)
        }
    }
}

fn encode_png(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let img = image::load_from_memory_with_format(data, ImageFormat::Png)?;
    let mut out = Vec::new();

    PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive).write_image(
        img.as_bytes(),
        img.width(),
        img.height(),
        img.color().into(),
    )?;

    Ok(out)
}

fn encode_jpeg(data: &[u8], quality: u8) -> anyhow::Result<Vec<u8>> {
    let img = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?;
    let rgb = img.to_rgb8();
    let mut out = Vec::new();

    JpegEncoder::new_with_quality(&mut out, quality).write_image(
        &rgb,
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;

    Ok(out)
}

pub(crate) fn minify_svg(svg: &str) -> String {
    let svg = RE_SVG_NOISE.replace_all(svg, "");
    let svg = RE_SVG_GAPS.replace_all(&svg, "><");
    svg.trim().to_string()
}
