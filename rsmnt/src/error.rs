use thiserror::Error;

use crate::tiles::TileId;

/// A recoverable, tile-scoped failure. The orchestrator logs these and
/// carries on with the remaining tiles; they never abort the run.
///
/// An empty tile is not an error: stages report it as an absent result.
#[derive(Debug, Error)]
pub enum TileError {
    /// Too few (or too degenerate) points for the requested operation,
    /// e.g. a triangulation without a single inner face.
    #[error("tile {tile}: degenerate geometry in {stage} ({points} usable points)")]
    DegenerateGeometry {
        tile: TileId,
        stage: &'static str,
        points: usize,
    },

    /// A tile-scoped read or write failed. I/O on shared stores (output
    /// directory, merged rasters) is fatal instead and reported as `anyhow`.
    #[error("tile {tile}: {source}")]
    Io {
        tile: TileId,
        #[source]
        source: anyhow::Error,
    },
}

impl TileError {
    pub fn tile(&self) -> TileId {
        match self {
            TileError::DegenerateGeometry { tile, .. } => *tile,
            TileError::Io { tile, .. } => *tile,
        }
    }
}
