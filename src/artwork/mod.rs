//! Artwork download, decoding, and export.

pub mod fetcher;
pub mod image_pipeline;
