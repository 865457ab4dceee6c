#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geodetic math and change-set resolution for the cleanup map.
//!
//! - [`projection`] converts between lat/lon, Web Mercator pixels and tile
//!   addresses.
//! - [`resolver`] groups a change set by the tile each point lands in.
//! - [`registry`] holds the built-in area definitions.

pub mod projection;
pub mod registry;
pub mod resolver;
