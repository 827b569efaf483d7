//! Tile styling and label placement for vector maps.
//!
//! Tiles are built on a pool of worker threads, which match features against
//! a style's layer rules and place text labels. Text measurement and
//! rasterization happen on the main thread, reached through the [`broker`].

pub mod broker;
pub mod config;
pub mod geometry;
pub mod labels;
pub mod style;
pub mod text;
pub mod tile;
pub mod worker;

/// Crate-level error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Configory(#[from] configory::Error),
    #[error("{0}")]
    Broker(#[from] broker::BrokerError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file {0:?}: {1}")]
    InvalidFile(String, #[source] serde_json::Error),
    #[error("No worker available")]
    NoWorkers,
}
