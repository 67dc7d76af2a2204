//! Deterministic SVG placeholders. Always succeeds, so it terminates every
//! fallback chain.

use async_trait::async_trait;
use base64::Engine as _;

use cardstream_types::{ImageAsset, ImageMetadata};

use crate::provider::{ImageProvider, ImageRequest};

const PALETTE: [&str; 5] = ["#3b82f6", "#1e40af", "#60a5fa", "#f8fafc", "#1e293b"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaceholderKind {
    Geometric,
    Pattern,
    Solid,
}

impl PlaceholderKind {
    fn as_str(&self) -> &'static str {
        match self {
            PlaceholderKind::Geometric => "geometric",
            PlaceholderKind::Pattern => "pattern",
            PlaceholderKind::Solid => "solid",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PlaceholderProvider;

impl PlaceholderProvider {
    pub const NAME: &'static str = "placeholder";

    pub fn new() -> Self {
        Self
    }

    /// Render the SVG for a prompt. Same prompt and ratio, same bytes.
    pub fn render(&self, prompt: &str, aspect_ratio: &str) -> (String, &'static str) {
        let hash = prompt_hash(prompt);
        let (width, height) = dimensions(aspect_ratio);
        let kind = match hash % 3 {
            0 => PlaceholderKind::Geometric,
            1 => PlaceholderKind::Pattern,
            _ => PlaceholderKind::Solid,
        };
        let body = match kind {
            PlaceholderKind::Geometric => circles(width, height, hash),
            PlaceholderKind::Pattern => dots(width, height, hash),
            PlaceholderKind::Solid => String::new(),
        };
        let svg = format!(
            "<svg width=\"{width}\" height=\"{height}\" viewBox=\"0 0 {width} {height}\" \
             xmlns=\"http://www.w3.org/2000/svg\">\
             <defs><linearGradient id=\"bg\" x1=\"0%\" y1=\"0%\" x2=\"100%\" y2=\"100%\">\
             <stop offset=\"0%\" stop-color=\"{}\" stop-opacity=\"0.8\"/>\
             <stop offset=\"100%\" stop-color=\"{}\" stop-opacity=\"0.6\"/>\
             </linearGradient></defs>\
             <rect width=\"{width}\" height=\"{height}\" fill=\"url(#bg)\"/>{body}</svg>",
            PALETTE[0], PALETTE[1]
        );
        (svg, kind.as_str())
    }
}

#[async_trait]
impl ImageProvider for PlaceholderProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn generate(&self, request: &ImageRequest) -> cardstream_types::Result<ImageAsset> {
        let (svg, kind) = self.render(&request.prompt, &request.aspect_ratio);
        let encoded = base64::engine::general_purpose::STANDARD.encode(svg.as_bytes());
        Ok(ImageAsset {
            url: format!("data:image/svg+xml;base64,{encoded}"),
            metadata: ImageMetadata {
                provider: Self::NAME.to_string(),
                aspect_ratio: Some(request.aspect_ratio.clone()),
                placeholder_type: Some(kind.to_string()),
                generated_at: Some(chrono::Utc::now()),
            },
        })
    }
}

/// 31-multiplier string hash over UTF-16 units, folded to i32 then made
/// non-negative.
fn prompt_hash(prompt: &str) -> u32 {
    let hash = prompt
        .encode_utf16()
        .fold(0i32, |h, c| h.wrapping_shl(5).wrapping_sub(h).wrapping_add(c as i32));
    hash.unsigned_abs()
}

fn dimensions(aspect_ratio: &str) -> (u32, u32) {
    let parsed = aspect_ratio
        .split_once(':')
        .and_then(|(w, h)| Some((w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?)))
        .filter(|(w, h)| *w > 0 && *h > 0);
    match parsed {
        Some((w, h)) => (1200, 1200 * h / w),
        None => (1200, 675),
    }
}

fn circles(width: u32, height: u32, hash: u32) -> String {
    let count = 10 + hash % 10;
    (0..count)
        .map(|i| {
            let seed = hash.wrapping_add(i);
            format!(
                "<circle cx=\"{}\" cy=\"{}\" r=\"{}\" fill=\"{}\" opacity=\"0.{:02}\"/>",
                seed.wrapping_mul(67) % width,
                seed.wrapping_mul(139) % height,
                30 + seed % 120,
                PALETTE[(seed % 3) as usize],
                8 + seed % 30
            )
        })
        .collect()
}

fn dots(width: u32, height: u32, hash: u32) -> String {
    let spacing = 40 + hash % 40;
    let mut out = String::new();
    for y in (spacing / 2..height).step_by(spacing as usize) {
        for x in (spacing / 2..width).step_by(spacing as usize) {
            out.push_str(&format!(
                "<circle cx=\"{x}\" cy=\"{y}\" r=\"4\" fill=\"{}\" opacity=\"0.3\"/>",
                PALETTE[2]
            ));
        }
    }
    out
}
