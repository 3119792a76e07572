//! Artwork decoding, export, and disk-pruning helpers.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageFormat};
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

use crate::snapshot::ArtworkHandle;

const PIPELINE_VERSION: &str = "art-v1";

pub fn mb_to_bytes(value_mb: u32) -> u64 {
    u64::from(value_mb.max(1)) * 1024u64 * 1024u64
}

/// Directory holding PNG exports handed to file-URL surfaces.
pub fn artwork_export_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|path| path.join("nowplaying_sync").join("artwork"))
}

fn ensure_dir(dir: &Path) -> Option<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).ok()?;
    }
    Some(())
}

fn hash_string(value: &str) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xff && bytes[1] == 0xd8
}

fn decode_jpeg_non_strict(bytes: &[u8]) -> Option<DynamicImage> {
    if !looks_like_jpeg(bytes) {
        return None;
    }

    let options = DecoderOptions::new_cmd()
        .set_strict_mode(false)
        .jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(bytes, options);
    let pixels = decoder.decode().ok()?;
    let (width, height) = decoder.dimensions()?;
    let image = image::RgbaImage::from_raw(width as u32, height as u32, pixels)?;
    Some(DynamicImage::ImageRgba8(image))
}

/// Decodes artwork bytes, retrying malformed JPEGs with a lenient decoder.
pub fn decode_image_from_memory_with_fallback(bytes: &[u8]) -> Option<DynamicImage> {
    // Station artwork servers regularly append junk after the JPEG EOI marker.
    image::load_from_memory(bytes)
        .ok()
        .or_else(|| decode_jpeg_non_strict(bytes))
}

fn fit_to_max_edge(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }
    let clamped = max_edge.max(1);
    if width.max(height) <= clamped {
        return (width, height);
    }
    if width >= height {
        let scaled_height =
            ((u64::from(height) * u64::from(clamped)) + (u64::from(width) / 2)) / u64::from(width);
        (clamped, scaled_height.max(1) as u32)
    } else {
        let scaled_width =
            ((u64::from(width) * u64::from(clamped)) + (u64::from(height) / 2)) / u64::from(height);
        (scaled_width.max(1) as u32, clamped)
    }
}

fn save_png_atomic(image: &DynamicImage, temp_path: &Path, target_path: &Path) -> Option<()> {
    if temp_path.exists() {
        let _ = fs::remove_file(temp_path);
    }
    image.save_with_format(temp_path, ImageFormat::Png).ok()?;
    fs::rename(temp_path, target_path).ok()?;
    Some(())
}

/// Writes `artwork` as a PNG under `dir`, keyed by its source URL.
///
/// Existing exports for the same URL and size are reused and marked as
/// recently used so pruning keeps them.
pub fn export_artwork_png_in(
    dir: &Path,
    artwork: &ArtworkHandle,
    max_edge_px: u32,
) -> Option<PathBuf> {
    ensure_dir(dir)?;
    let stem = hash_string(&format!(
        "{PIPELINE_VERSION}|{}|{max_edge_px}",
        artwork.source_url()
    ));
    let target_path = dir.join(format!("{stem}.png"));
    if target_path.exists() {
        touch(&target_path);
        return Some(target_path);
    }

    let (width, height) = artwork.image().dimensions();
    let (target_width, target_height) = fit_to_max_edge(width, height, max_edge_px);
    let temp_path = target_path.with_extension("png.tmp");
    if (target_width, target_height) == (width, height) {
        save_png_atomic(artwork.image(), &temp_path, &target_path)?;
    } else {
        let resized = artwork
            .image()
            .resize(target_width, target_height, FilterType::Triangle);
        save_png_atomic(&resized, &temp_path, &target_path)?;
    }
    Some(target_path)
}

fn touch(path: &Path) {
    let _ = fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
}

pub fn file_url_for_path(path: &Path) -> String {
    format!("file://{}", path.to_string_lossy())
}

fn list_files(dir: &Path) -> Vec<(PathBuf, u64, u128)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .ok()
            .and_then(|value| value.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        files.push((path, metadata.len(), modified));
    }
    files
}

/// Deletes the oldest exports until the directory fits `max_size_bytes`.
///
/// `keep` is never removed, even when it alone exceeds the budget.
pub fn prune_export_dir(dir: &Path, max_size_bytes: u64, keep: &Path) -> Vec<PathBuf> {
    let mut files = list_files(dir);
    let mut total_bytes = files.iter().map(|(_, size, _)| *size).sum::<u64>();
    if total_bytes <= max_size_bytes {
        return Vec::new();
    }

    files.sort_by_key(|(_, _, modified)| *modified);
    let mut removed = Vec::new();
    for (path, size, _) in files {
        if total_bytes <= max_size_bytes {
            break;
        }
        if path == keep {
            continue;
        }
        if fs::remove_file(&path).is_ok() {
            total_bytes = total_bytes.saturating_sub(size);
            removed.push(path);
        }
    }
    removed
}
