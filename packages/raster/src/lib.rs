#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Raster side of tile generation.
//!
//! A [`Palette`] maps each [`PointState`](cleanup_map_geo_models::PointState)
//! to one exact RGBA colour and back. The [`RasterMergeEngine`] decodes a
//! previously published tile through the palette, paints the changed points
//! on top and re-encodes a lossless PNG.

pub mod merge;
pub mod palette;

pub use merge::{MergeStats, MergedRaster, RasterError, RasterMergeEngine, decode_states};
pub use palette::{Palette, PaletteError, Rgba};
