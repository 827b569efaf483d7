//! Text styling settings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::{Color, Font};

/// Font size in pixels per `em`.
const EM_SIZE: f32 = 16.;

/// Font styling of a text label.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct TextSettings {
    pub family: String,
    /// Font size in pixels.
    pub size: f32,
    /// Font style, like `normal` or `italic`.
    pub style: String,
    /// Font weight, like `normal`, `bold` or `700`.
    pub weight: String,
    pub fill: Color,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<Stroke>,
}

/// Text outline.
#[derive(Serialize, Deserialize, PartialEq, Copy, Clone, Debug)]
pub struct Stroke {
    pub color: Color,
    /// Outline width in pixels.
    pub width: f32,
}

impl TextSettings {
    /// Compute the settings of a text draw group.
    ///
    /// Missing or invalid font properties fall back to the configured font.
    pub fn compute(draw: &Map<String, Value>, defaults: &Font) -> Self {
        let font = draw.get("font").and_then(Value::as_object);
        let get = |key: &str| font.and_then(|font| font.get(key));

        let family = get("family").and_then(Value::as_str);
        let size = get("size").and_then(|size| {
            let px = font_pixel_size(size);
            if px.is_none() {
                warn!("Ignoring invalid font size {size}");
            }
            px
        });

        let weight = match get("weight") {
            Some(Value::String(weight)) => weight.clone(),
            Some(Value::Number(weight)) => weight.to_string(),
            _ => String::from("normal"),
        };

        let stroke = get("stroke").and_then(|stroke| {
            let color = stroke.get("color").and_then(parse_color)?;
            let width = stroke.get("width").and_then(Value::as_f64).unwrap_or(1.) as f32;
            (width > 0.).then_some(Stroke { color, width })
        });

        Self {
            weight,
            stroke,
            family: family.map_or_else(|| defaults.family.to_string(), String::from),
            size: size.unwrap_or(defaults.size),
            style: get("style").and_then(Value::as_str).unwrap_or("normal").into(),
            fill: get("fill").and_then(parse_color).unwrap_or(defaults.fill),
        }
    }

    /// Key uniquely identifying these settings.
    pub fn key(&self) -> String {
        let mut key =
            format!("{}/{}/{}/{}/{}", self.family, self.size, self.style, self.weight, self.fill);
        if let Some(stroke) = &self.stroke {
            key.push_str(&format!("/{}/{}", stroke.color, stroke.width));
        }
        key
    }

    /// Whether the text is slanted.
    pub fn italic(&self) -> bool {
        self.style != "normal"
    }

    /// Whether the font weight is at least semi-bold.
    pub fn bold(&self) -> bool {
        match self.weight.as_str() {
            "bold" | "bolder" => true,
            weight => weight.parse::<u16>().is_ok_and(|weight| weight >= 600),
        }
    }
}

/// Convert a CSS-like font size to pixels.
///
/// Supports plain numbers and `px`, `pt`, `em` and `%` units.
pub fn font_pixel_size(size: &Value) -> Option<f32> {
    let text = match size {
        Value::Number(size) => return size.as_f64().map(|size| size as f32).filter(valid_size),
        Value::String(text) => text.trim(),
        _ => return None,
    };

    let split = text.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f32 = number.parse().ok()?;

    let px = match unit.trim() {
        "" | "px" => number,
        "pt" => number * 4. / 3.,
        "em" => number * EM_SIZE,
        "%" => number / 100. * EM_SIZE,
        _ => return None,
    };

    Some(px).filter(valid_size)
}

/// Check if a font size is drawable.
fn valid_size(px: &f32) -> bool {
    px.is_finite() && *px > 0.
}

/// Parse a hex color property.
fn parse_color(value: &Value) -> Option<Color> {
    let text = value.as_str()?;
    Color::from_hex(text).inspect_err(|err| warn!("Ignoring invalid text color: {err}")).ok()
}
