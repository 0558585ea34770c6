pub mod boundary;
pub mod classify;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod pipeline;
pub mod points;
pub mod raster;
pub mod rasterize;
pub mod tiles;

pub use config::PipelineConfig;
pub use error::TileError;
pub use pipeline::{LidarPipeline, PipelineSummary};
