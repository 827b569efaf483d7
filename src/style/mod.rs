//! Style documents and rule matching.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::style::filter::{FilterError, FilterFunction, FilterFunctions, MatchContext};
pub use crate::style::layer::{LayerId, LayerKind, LayerNode, StyleLayers};
pub use crate::style::merge::{DrawGroupCache, DrawGroups, MergedDraw};

pub mod filter;
mod layer;
mod merge;

/// Name of the built-in text style.
pub const TEXT_STYLE: &str = "text";

/// Declarative scene style.
#[derive(Serialize, Deserialize, PartialEq, Clone, Default, Debug)]
pub struct StyleDocument {
    /// Layer rules by root layer name.
    #[serde(default)]
    pub layers: IndexMap<String, Value>,
    /// Custom style definitions by style name.
    #[serde(default)]
    pub styles: IndexMap<String, Value>,
    /// Scene-wide values, referenced by filters through `$`-prefixed keys.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub global: Map<String, Value>,
}

impl StyleDocument {
    /// Compile the document's layers.
    pub fn build(&self, functions: FilterFunctions) -> StyleLayers {
        StyleLayers::build(&self.layers, &self.styles, functions)
    }

    /// Name of the style a draw group renders with.
    ///
    /// Draw groups pick a style explicitly with their `style` property,
    /// otherwise the group name is used.
    pub fn style_name<'a>(&self, draw: &'a MergedDraw) -> &'a str {
        draw.get("style").and_then(Value::as_str).unwrap_or(&draw.group)
    }

    /// Name of the built-in style a draw group renders with.
    ///
    /// Custom styles name their built-in style through `base`.
    pub fn base_style<'a>(&'a self, draw: &'a MergedDraw) -> &'a str {
        let style = self.style_name(draw);

        match self.styles.get(style).and_then(|style| style.get("base")).and_then(Value::as_str) {
            Some(base) => base,
            None => style,
        }
    }

    /// Names of all styles rendering text labels.
    pub fn text_styles(&self) -> Vec<&str> {
        let custom = self.styles.iter().filter_map(|(name, style)| {
            (style.get("base").and_then(Value::as_str) == Some(TEXT_STYLE)).then_some(name.as_str())
        });
        std::iter::once(TEXT_STYLE).chain(custom).collect()
    }
}
