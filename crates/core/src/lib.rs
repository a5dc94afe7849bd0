//! Core crate for tilestitch: patch tiling, batched transform dispatch,
//! stitching, and pooled post-processing of large images.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod grid;
pub mod halo;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod merge;
pub mod onnx;
pub mod pipeline;
pub mod pool;
pub mod postproc;
pub mod report;
pub mod runtime;
pub mod sink;
pub mod stitch;
pub mod tma;
pub mod types;
