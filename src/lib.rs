#![forbid(unsafe_code)]

//! Shared building blocks for the mixdeck backend: configuration, the
//! response cache, the channel catalog and the conversion gateway.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod conversion;
pub mod models;
pub mod rooms;
pub mod upstream;
pub mod waveform;
