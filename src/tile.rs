//! Map tile handling.

use std::cell::Cell;
use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::{Point, meters_per_pixel};

/// Width and height of a single tile in pixels.
pub const TILE_SIZE: i32 = 256;

/// Width and height of a single tile in local tile units.
///
/// Tile-local coordinates grow to the right on the X axis and downwards into
/// negative values on the Y axis, so a tile covers `[0, scale] x [-scale, 0]`.
pub const TILE_SCALE: f64 = 4096.;

/// Maximum zoom level addressable by style filters.
pub const MAX_STYLE_ZOOM: u8 = 25;

/// Index uniquely identifying a map tile.
#[derive(Serialize, Deserialize, Default, Hash, PartialEq, Eq, Copy, Clone, Debug)]
pub struct TileIndex {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileIndex {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }
}

impl Display for TileIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.x, self.y, self.z)
    }
}

/// Identifier of one build of a tile.
///
/// A tile rebuilt after a style reload receives a new ID, while its
/// [`TileIndex`] stays the same.
pub type TileId = u64;

/// Tile build request sent from the main thread to a worker.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TileRequest {
    #[serde(default)]
    pub id: TileId,
    pub index: TileIndex,
    /// Style zoom the tile is rendered at, defaults to the tile's own zoom.
    #[serde(default)]
    pub style_zoom: Option<f64>,
    /// Features grouped by source layer name.
    pub layers: IndexMap<String, Vec<Feature>>,
    /// `$`-prefixed filter context values, overriding the style's globals.
    #[serde(default)]
    pub globals: Map<String, Value>,
}

/// A tile in the process of being built on a worker.
#[derive(Debug)]
pub struct Tile {
    pub id: TileId,
    pub index: TileIndex,
    pub style_zoom: f64,
    /// Width and height of the tile in local tile units.
    pub scale: f64,
    canceled: Cell<bool>,
}

impl Tile {
    pub fn new(id: TileId, index: TileIndex, style_zoom: Option<f64>) -> Self {
        let style_zoom = style_zoom.unwrap_or(index.z as f64);
        Self { id, index, style_zoom, scale: TILE_SCALE, canceled: Default::default() }
    }

    /// Use a custom tile unit scale.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Key identifying the tile's position in the tile pyramid.
    pub fn key(&self) -> String {
        self.index.to_string()
    }

    /// Mark the build as superseded.
    pub fn cancel(&self) {
        self.canceled.set(true);
    }

    pub fn canceled(&self) -> bool {
        self.canceled.get()
    }

    /// Local tile units covered by a single screen pixel.
    pub fn units_per_pixel(&self) -> f64 {
        let overzoom = (self.style_zoom - self.index.z as f64).max(0.);
        self.scale / TILE_SIZE as f64 / 2f64.powf(overzoom)
    }

    /// Squared meters covered by a single screen pixel.
    pub fn meters_per_pixel_sq(&self) -> f64 {
        meters_per_pixel(self.style_zoom).powi(2)
    }
}

/// A single map feature.
#[derive(Serialize, Deserialize, PartialEq, Clone, Default, Debug)]
pub struct Feature {
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub geometry: Geometry,
}

/// Feature geometry in local tile units.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Point),
    LineString(Vec<Point>),
    Polygon(Vec<Vec<Point>>),
}

impl Default for Geometry {
    fn default() -> Self {
        Self::Point(Point::default())
    }
}

impl Geometry {
    /// Geometry type name exposed to style filters as `$geometry`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Point(_) => "point",
            Self::LineString(_) => "line",
            Self::Polygon(_) => "polygon",
        }
    }
}
