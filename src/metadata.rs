//! Image metadata for the detail view: file stats, pixel dimensions and the
//! Automatic1111 generation parameters stored in a PNG `tEXt` chunk.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{AppError, Result};

const PARAMETERS_KEYWORD: &str = "parameters";
const NEGATIVE_PROMPT_PREFIX: &str = "Negative prompt:";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PngMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub filename: String,
    pub full_path: PathBuf,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub is_png: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub png_metadata: Option<PngMetadata>,
}

/// Collect stats, dimensions and (for PNGs) generation parameters of `path`.
pub fn read_image_metadata(path: &Path) -> Result<ImageMetadata> {
    let stats = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::not_found("File not found"),
        _ => AppError::Io(e),
    })?;
    if !stats.is_file() {
        return Err(AppError::not_found("File not found"));
    }

    let created = stats.created().or_else(|_| stats.modified())?;
    let is_png = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("png"))
        .unwrap_or(false);

    let (width, height) = match image::image_dimensions(path) {
        Ok(dimensions) => dimensions,
        Err(e) => {
            warn!("Error getting image dimensions of {}: {}", path.display(), e);
            (0, 0)
        }
    };

    let png_metadata = if is_png {
        match png_text_chunks(BufReader::new(File::open(path)?)) {
            Ok(chunks) => chunks
                .into_iter()
                .find(|(keyword, _)| keyword == PARAMETERS_KEYWORD)
                .map(|(_, text)| parse_a1111_parameters(&text)),
            Err(e) => {
                warn!("Error reading PNG text chunks of {}: {}", path.display(), e);
                None
            }
        }
    } else {
        None
    };

    Ok(ImageMetadata {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        full_path: path.to_path_buf(),
        file_size: stats.len(),
        created_at: DateTime::<Utc>::from(created),
        width,
        height,
        is_png,
        png_metadata,
    })
}

/// `(keyword, text)` pairs of the `tEXt` chunks ahead of the image data.
/// Chunk CRCs are verified by the decoder.
pub fn png_text_chunks<R: Read>(
    reader: R,
) -> std::result::Result<Vec<(String, String)>, png::DecodingError> {
    let reader = png::Decoder::new(reader).read_info()?;
    Ok(reader
        .info()
        .uncompressed_latin1_text
        .iter()
        .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
        .collect())
}

/// Parse the `parameters` text written by Automatic1111:
///
/// ```text
/// positive prompt, possibly over several lines
/// Negative prompt: negative prompt text
/// Steps: 20, Sampler: Euler a, CFG scale: 7, Seed: 123456789, Size: 512x512, Model: name
/// ```
pub fn parse_a1111_parameters(text: &str) -> PngMetadata {
    let mut metadata = PngMetadata::default();
    let lines: Vec<&str> = text.split('\n').collect();

    let prompt_end = lines
        .iter()
        .position(|line| line.starts_with(NEGATIVE_PROMPT_PREFIX))
        .unwrap_or(lines.len());
    let mut cursor = prompt_end;

    // Without a negative prompt the last line may already be the settings line.
    let mut prompt_lines = &lines[..prompt_end];
    if cursor == lines.len() && prompt_lines.len() > 1 {
        if let Some(last) = prompt_lines.last() {
            if last.starts_with("Steps:") {
                cursor = prompt_lines.len() - 1;
                prompt_lines = &prompt_lines[..cursor];
            }
        }
    }
    metadata.prompt = Some(prompt_lines.join("\n").trim().to_string());

    if let Some(line) = lines.get(cursor) {
        if let Some(negative) = line.strip_prefix(NEGATIVE_PROMPT_PREFIX) {
            metadata.negative_prompt = Some(negative.trim().to_string());
            cursor += 1;
        }
    }

    if let Some(settings) = lines.get(cursor) {
        for param in settings.split(',') {
            let Some((key, value)) = param.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Steps" => metadata.steps = value.parse().ok(),
                "Sampler" => metadata.sampler = Some(value.to_string()),
                "CFG scale" => metadata.cfg_scale = value.parse().ok(),
                "Seed" => metadata.seed = value.parse().ok(),
                "Size" => metadata.size = Some(value.to_string()),
                "Model" => metadata.model = Some(value.to_string()),
                _ => {}
            }
        }
    }

    metadata
}
