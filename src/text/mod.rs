//! Text label pipeline.
//!
//! Workers collect the texts of a tile, have them measured on the main
//! thread, collide the resulting labels and finally request an atlas of the
//! placed texts.

use std::borrow::{Borrow, BorrowMut};
use std::cell::RefCell;
use std::f64::consts::{FRAC_PI_2, PI};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, trace, warn};

use crate::broker::{Broker, BrokerError, Role};
use crate::config::{self, Font};
use crate::geometry::{Point, Size};
use crate::labels::{Align, Label, LabelIds, LabelSummary, LabelType, Layout, TileCollisions};
use crate::style::MergedDraw;
use crate::text::settings::TextSettings;
use crate::tile::{Feature, Geometry, TILE_SIZE, Tile};

pub mod canvas;
pub mod settings;
#[cfg(feature = "skia")]
pub mod skia;

/// Feature property used as label text by default.
const DEFAULT_TEXT_SOURCE: &str = "name";

/// Text measurement and rasterization errors.
#[derive(Error, Debug)]
pub enum TextError {
    #[error("No font matching family {0:?}")]
    Font(String),
    #[error("Failed to create {0}x{1} text surface")]
    Surface(u32, u32),
    #[error("Failed to read text surface pixels")]
    ReadPixels,
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Broker(#[from] BrokerError),
}

/// Unique texts of a tile, by settings key and text.
pub type TileTexts = IndexMap<String, IndexMap<String, TextInfo>>;

/// State of one unique text in a tile.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct TextInfo {
    pub text_settings: TextSettings,
    /// Number of placed labels using this text.
    #[serde(rename = "ref", default)]
    pub references: usize,
    /// Text size in pixels, once measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    /// Alignments the text is rendered with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub align: Vec<Align>,
    /// Location in the tile's texture atlases, once rasterized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atlas: Option<AtlasRect>,
}

impl TextInfo {
    pub fn new(text_settings: TextSettings) -> Self {
        Self {
            text_settings,
            references: Default::default(),
            align: Default::default(),
            atlas: Default::default(),
            size: Default::default(),
        }
    }
}

/// Pixel rectangle within a texture atlas.
#[derive(Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug)]
pub struct AtlasRect {
    /// Index into the atlas texture names.
    pub texture: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Rasterization result returned to workers.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RasterizedTexts {
    pub texts: TileTexts,
    /// Names of the atlas textures retained on the main thread.
    pub textures: Vec<String>,
}

/// Label text of a feature.
#[derive(PartialEq, Clone, Debug)]
pub enum LabelText {
    Single(String),
    /// Texts on either side of a boundary line, by side name.
    Boundary(IndexMap<String, String>),
}

impl LabelText {
    /// Resolve a feature's label text.
    ///
    /// The `text_source` draw property names the feature property holding
    /// the text. Lists are tried in order until a property is found, objects
    /// define texts for both sides of a boundary.
    pub fn parse(properties: &Map<String, Value>, draw: &Map<String, Value>) -> Option<Self> {
        match draw.get("text_source") {
            Some(Value::Object(sources)) => {
                let texts: IndexMap<_, _> = sources
                    .iter()
                    .filter_map(|(side, source)| {
                        Some((side.clone(), source_text(properties, source)?))
                    })
                    .collect();
                (!texts.is_empty()).then_some(Self::Boundary(texts))
            },
            Some(source) => source_text(properties, source).map(Self::Single),
            None => property_text(properties.get(DEFAULT_TEXT_SOURCE)?).map(Self::Single),
        }
    }
}

/// Resolve a single text source.
fn source_text(properties: &Map<String, Value>, source: &Value) -> Option<String> {
    match source {
        Value::String(key) => property_text(properties.get(key)?),
        Value::Array(keys) => keys
            .iter()
            .filter_map(Value::as_str)
            .find_map(|key| properties.get(key).and_then(property_text)),
        _ => None,
    }
}

/// Convert a property value to label text.
fn property_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Compute the text layout of a label.
///
/// `prefix` and `side` are only set for boundary labels.
pub fn compute_text_layout(
    draw: &MergedDraw,
    tile: &Tile,
    geometry: &Geometry,
    text: &str,
    settings: &TextSettings,
    prefix: Option<&str>,
    side: Option<&str>,
) -> Layout {
    let units_per_pixel = tile.units_per_pixel();

    // Points are never culled as repeats by default, everything else once per tile.
    let repeat_distance = match draw.get("repeat_distance").map(|distance| distance.as_f64()) {
        Some(Some(distance)) => distance.max(0.) * units_per_pixel,
        Some(None) => {
            warn!("Ignoring invalid repeat_distance in draw group {}", draw.key);
            default_repeat_distance(geometry, units_per_pixel)
        },
        None => default_repeat_distance(geometry, units_per_pixel),
    };

    let repeat_group = (repeat_distance > 0.).then(|| {
        let mut group = match draw.get("repeat_group").and_then(Value::as_str) {
            Some(group) => group.to_owned(),
            None => draw.key.clone(),
        };
        if let Some(prefix) = prefix {
            group.push('/');
            group.push_str(prefix);
        }
        group.push('/');
        group.push_str(text);
        group
    });

    let orientation = match side {
        Some("right") => 1,
        Some("left") => -1,
        _ => 0,
    };

    Layout {
        repeat_distance,
        repeat_group,
        units_per_pixel,
        orientation,
        priority: draw.get("priority").and_then(Value::as_f64).unwrap_or(f64::MAX),
        collide: draw.get("collide").and_then(Value::as_bool).unwrap_or(true),
        buffer: draw.get("buffer").and_then(pixel_pair).unwrap_or_default().map(|b| b.max(0.)),
        offset: draw.get("offset").and_then(pixel_pair).unwrap_or_default(),
        anchor: draw_enum(draw, "anchor").unwrap_or_default(),
        align: draw_enum(draw, "align"),
        italic: settings.italic(),
    }
}

fn default_repeat_distance(geometry: &Geometry, units_per_pixel: f64) -> f64 {
    match geometry {
        Geometry::Point(_) => 0.,
        _ => TILE_SIZE as f64 * units_per_pixel,
    }
}

/// Parse a number or a pair of numbers.
fn pixel_pair(value: &Value) -> Option<[f64; 2]> {
    match value {
        Value::Number(number) => number.as_f64().map(|number| [number, number]),
        Value::Array(values) => match values.as_slice() {
            [x, y] => Some([x.as_f64()?, y.as_f64()?]),
            _ => None,
        },
        _ => None,
    }
}

/// Parse an enum draw property, warning about invalid values.
fn draw_enum<T: DeserializeOwned>(draw: &MergedDraw, key: &str) -> Option<T> {
    let value = draw.get(key)?;
    serde_json::from_value(value.clone())
        .inspect_err(|err| warn!("Ignoring invalid {key} in draw group {}: {err}", draw.key))
        .ok()
}

/// Position of a label on its feature's geometry.
#[derive(PartialEq, Copy, Clone, Debug)]
pub enum LabelAnchor {
    Point(Point),
    /// Center of a line segment, with its upright angle and length.
    Line { position: Point, angle: f64, length: f64 },
}

impl LabelAnchor {
    /// Find the label position for a geometry.
    ///
    /// Lines are labeled at the center of their longest segment, polygons at
    /// the centroid of their outer ring.
    pub fn for_geometry(geometry: &Geometry) -> Option<Self> {
        match geometry {
            Geometry::Point(point) => Some(Self::Point(*point)),
            Geometry::LineString(line) => {
                let (start, end) = line
                    .windows(2)
                    .map(|segment| (segment[0], segment[1]))
                    .max_by(|a, b| (a.1 - a.0).length().total_cmp(&(b.1 - b.0).length()))?;

                let delta = end - start;
                let length = delta.length();
                if length == 0. {
                    return None;
                }

                // Keep text upright.
                let mut angle = delta.y.atan2(delta.x);
                if angle > FRAC_PI_2 {
                    angle -= PI;
                } else if angle < -FRAC_PI_2 {
                    angle += PI;
                }

                let position = Point::new((start.x + end.x) / 2., (start.y + end.y) / 2.);
                Some(Self::Line { position, angle, length })
            },
            Geometry::Polygon(rings) => {
                rings.first().and_then(|ring| centroid(ring)).map(Self::Point)
            },
        }
    }
}

/// Area centroid of a polygon ring.
///
/// Falls back to the average vertex for rings without area.
fn centroid(ring: &[Point]) -> Option<Point> {
    if ring.is_empty() {
        return None;
    }

    let mut area = 0.;
    let mut center = Point::default();
    for (i, &a) in ring.iter().enumerate() {
        let b = ring[(i + 1) % ring.len()];
        let cross = a.x * b.y - b.x * a.y;
        area += cross;
        center += Point::new((a.x + b.x) * cross, (a.y + b.y) * cross);
    }

    if area.abs() < f64::EPSILON {
        let sum = ring.iter().fold(Point::default(), |sum, &point| sum + point);
        let count = ring.len() as f64;
        return Some(Point::new(sum.x / count, sum.y / count));
    }

    Some(Point::new(center.x / (3. * area), center.y / (3. * area)))
}

/// Text label with its text lookup keys.
#[derive(Clone, Debug)]
pub struct TextLabel {
    pub label: Label,
    pub text: String,
    pub text_settings_key: String,
}

impl Borrow<Label> for TextLabel {
    fn borrow(&self) -> &Label {
        &self.label
    }
}

impl BorrowMut<Label> for TextLabel {
    fn borrow_mut(&mut self) -> &mut Label {
        &mut self.label
    }
}

/// Label waiting for its text to be measured.
#[derive(Clone, Debug)]
struct Candidate {
    text: String,
    text_settings_key: String,
    layout: Layout,
    anchor: LabelAnchor,
}

/// Placed text label sent to the main thread.
#[derive(Serialize, Clone, Debug)]
pub struct PlacedText {
    #[serde(flatten)]
    pub label: LabelSummary,
    pub text: String,
    pub text_settings_key: String,
    pub align: Align,
}

impl From<TextLabel> for PlacedText {
    fn from(text: TextLabel) -> Self {
        Self {
            label: text.label.summary(),
            align: text.label.align,
            text: text.text,
            text_settings_key: text.text_settings_key,
        }
    }
}

/// Text labels of one style in a finished tile.
#[derive(Serialize, Default, Debug)]
pub struct TextOutput {
    pub labels: Vec<PlacedText>,
    pub texts: TileTexts,
    /// Names of the atlas textures on the main thread.
    pub textures: Vec<String>,
}

impl TextOutput {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Corners of all placed labels as native-endian `f32` pairs.
    pub fn quad_buffer(&self) -> Vec<u8> {
        self.labels
            .iter()
            .flat_map(|text| text.label.obb.quad)
            .flat_map(|corner| [corner.x as f32, corner.y as f32])
            .flat_map(f32::to_ne_bytes)
            .collect()
    }
}

/// Text label collection of one style for a single tile build.
#[derive(Debug)]
pub struct TileTextBuilder {
    style: String,
    texts: TileTexts,
    candidates: Vec<Candidate>,
}

impl TileTextBuilder {
    pub fn new(style: &str) -> Self {
        Self { style: style.into(), texts: Default::default(), candidates: Default::default() }
    }

    /// Number of label candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Unique texts collected so far.
    pub fn texts(&self) -> &TileTexts {
        &self.texts
    }

    /// Add the labels of a feature.
    ///
    /// Returns the number of added label candidates.
    pub fn add_feature(
        &mut self,
        feature: &Feature,
        draw: &MergedDraw,
        tile: &Tile,
        font: &Font,
    ) -> usize {
        let Some(text) = LabelText::parse(&feature.properties, &draw.draw) else {
            return 0;
        };

        let Some(anchor) = LabelAnchor::for_geometry(&feature.geometry) else {
            trace!("Skipping label {text:?} without anchor point in tile {}", tile.key());
            return 0;
        };

        let settings = TextSettings::compute(&draw.draw, font);
        let text_settings_key = settings.key();

        let texts = match text {
            LabelText::Single(text) => vec![(None, text)],
            LabelText::Boundary(texts) => {
                texts.into_iter().map(|(side, text)| (Some(side), text)).collect()
            },
        };

        // Boundary labels share their repeat group across both sides.
        let prefix = (texts.len() > 1).then(|| {
            let find = |name: &str| texts.iter().find(|(side, _)| side.as_deref() == Some(name));
            let text = |name| find(name).map_or("", |(_, text)| text.as_str());
            format!("{}-{}", text("left"), text("right"))
        });

        let mut added = 0;
        for (side, text) in &texts {
            let layout = compute_text_layout(
                draw,
                tile,
                &feature.geometry,
                text,
                &settings,
                prefix.as_deref(),
                side.as_deref(),
            );

            let infos = self.texts.entry(text_settings_key.clone()).or_default();
            if !infos.contains_key(text) {
                infos.insert(text.clone(), TextInfo::new(settings.clone()));
            }

            self.candidates.push(Candidate {
                text_settings_key: text_settings_key.clone(),
                text: text.clone(),
                layout,
                anchor,
            });
            added += 1;
        }

        added
    }

    /// Measure, collide and rasterize all collected labels.
    ///
    /// Canceled tiles and failures produce no labels.
    pub async fn build(
        self,
        broker: &Broker,
        tile: &Tile,
        ids: &RefCell<LabelIds>,
        collisions: &mut TileCollisions,
        config: &config::Labels,
    ) -> TextOutput {
        let style = self.style.clone();
        match self.try_build(broker, tile, ids, collisions, config).await {
            Ok(Some(output)) => output,
            Ok(None) => TextOutput::default(),
            Err(err) => {
                error!("Failed to build {style} labels of tile {}: {err}", tile.key());
                TextOutput::default()
            },
        }
    }

    async fn try_build(
        self,
        broker: &Broker,
        tile: &Tile,
        ids: &RefCell<LabelIds>,
        collisions: &mut TileCollisions,
        config: &config::Labels,
    ) -> Result<Option<TextOutput>, TextError> {
        let Self { style, texts, candidates } = self;
        if candidates.is_empty() {
            return Ok(None);
        }

        let target = format!("text_labels_{style}");

        let args = serde_json::to_value((tile.id, &texts))?;
        let reply = broker.call(Role::Main, &format!("{target}.calc_text_sizes"), args).await?;
        if tile.canceled() {
            trace!("Stopping {style} labels of canceled tile {} after measuring", tile.key());
            return Ok(None);
        }
        let mut texts: TileTexts = reply.decode()?;

        let labels = create_labels(candidates, &texts, ids, tile.scale, config.collision_epsilon);
        let placed = collisions.collide(&style, labels);
        if placed.is_empty() {
            return Ok(None);
        }

        cull_texts(&mut texts, &placed);

        for label in &placed {
            let infos = texts.get_mut(&label.text_settings_key);
            let info = infos.and_then(|infos| infos.get_mut(&label.text));
            if let Some(info) = info.filter(|info| !info.align.contains(&label.label.align)) {
                info.align.push(label.label.align);
            }
        }

        let args = serde_json::to_value((tile.id, tile.key(), &texts))?;
        let reply = broker.call(Role::Main, &format!("{target}.rasterize_texts"), args).await?;
        let rasterized: RasterizedTexts = reply.decode()?;
        if tile.canceled() {
            trace!("Stopping {style} labels of canceled tile {} after rasterizing", tile.key());
            release_textures(broker, &style, &rasterized.textures).await;
            return Ok(None);
        }

        Ok(Some(TextOutput {
            labels: placed.into_iter().map(PlacedText::from).collect(),
            texts: rasterized.texts,
            textures: rasterized.textures,
        }))
    }
}

/// Free label textures retained by the main thread.
pub async fn release_textures(broker: &Broker, style: &str, textures: &[String]) {
    if textures.is_empty() {
        return;
    }

    let method = format!("text_labels_{style}.release_textures");
    let args = match serde_json::to_value((textures,)) {
        Ok(args) => args,
        Err(err) => {
            error!("Failed to release {style} label textures: {err}");
            return;
        },
    };

    if let Err(err) = broker.call(Role::Main, &method, args).await {
        error!("Failed to release {style} label textures: {err}");
    }
}

/// Create labels for all measured candidates.
fn create_labels(
    candidates: Vec<Candidate>,
    texts: &TileTexts,
    ids: &RefCell<LabelIds>,
    tile_scale: f64,
    epsilon: f64,
) -> Vec<TextLabel> {
    let mut labels = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let Candidate { text_settings_key, text, layout, anchor } = candidate;

        let infos = texts.get(&text_settings_key);
        let Some(size) = infos.and_then(|infos| infos.get(&text)?.size) else {
            continue;
        };

        let (label_type, position, angle) = match anchor {
            LabelAnchor::Point(position) => (LabelType::Point, position, 0.),
            LabelAnchor::Line { position, angle, length } => {
                // Text must fit on its segment.
                if size.width * layout.units_per_pixel > length {
                    trace!("Skipping label {text:?} longer than its line");
                    continue;
                }
                (LabelType::Line, position, angle)
            },
        };

        let id = ids.borrow_mut().next_id();
        let label = Label::new(id, label_type, position, angle, size, layout, tile_scale)
            .with_epsilon(epsilon, tile_scale);

        labels.push(TextLabel { label, text, text_settings_key });
    }
    labels
}

/// Remove all texts without any placed label.
fn cull_texts(texts: &mut TileTexts, placed: &[TextLabel]) {
    for infos in texts.values_mut() {
        for info in infos.values_mut() {
            info.references = 0;
        }
    }

    for label in placed {
        let infos = texts.get_mut(&label.text_settings_key);
        if let Some(info) = infos.and_then(|infos| infos.get_mut(&label.text)) {
            info.references += 1;
        }
    }

    for infos in texts.values_mut() {
        infos.retain(|_, info| info.references > 0);
    }
    texts.retain(|_, infos| !infos.is_empty());
}
