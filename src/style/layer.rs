//! Style layer tree.

use std::cell::OnceCell;
use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::style::filter::{CompiledFilter, FilterFunctions, MatchContext};
use crate::style::merge::{self, DrawGroupCache, DrawGroups, MergedDraw};

/// Index of a layer in its [`StyleLayers`] arena.
pub type LayerId = usize;

/// Keys with special meaning inside a layer definition.
///
/// All other keys define child layers.
const RESERVED: [&str; 7] =
    ["filter", "draw", "visible", "enabled", "data", "exclusive", "priority"];

/// Structural variant of a layer.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum LayerKind {
    Leaf,
    Tree { children: Vec<LayerId> },
}

/// Single named rule of a style document.
#[derive(Debug)]
pub struct LayerNode {
    pub id: LayerId,
    pub name: String,
    /// Colon-separated names of all ancestors and this layer.
    pub full_name: String,
    pub parent: Option<LayerId>,
    pub kind: LayerKind,
    /// Draw groups defined directly on this layer.
    pub draw: IndexMap<String, Map<String, Value>>,
    /// Free-form layer data.
    pub data: Option<Value>,
    pub exclusive: bool,
    pub priority: Option<f64>,
    filter: Value,
    compiled: OnceCell<Option<CompiledFilter>>,
}

impl LayerNode {
    pub fn children(&self) -> &[LayerId] {
        match &self.kind {
            LayerKind::Tree { children } => children,
            LayerKind::Leaf => &[],
        }
    }

    /// Source layers whose features are matched against this layer.
    ///
    /// Uses `data.layer`, falling back to the layer's own name.
    pub fn source_layers(&self) -> Vec<String> {
        match self.data.as_ref().and_then(|data| data.get("layer")) {
            Some(Value::String(layer)) => vec![layer.clone()],
            Some(Value::Array(layers)) => {
                layers.iter().filter_map(|layer| layer.as_str()).map(String::from).collect()
            },
            _ => vec![self.name.clone()],
        }
    }

    /// Compiled filter, built on first use.
    ///
    /// Returns `None` for invalid filters.
    fn compiled_filter(&self, functions: &FilterFunctions) -> Option<&CompiledFilter> {
        self.compiled
            .get_or_init(|| match CompiledFilter::compile(&self.filter, functions) {
                Ok(filter) => Some(filter),
                Err(err) => {
                    warn!("Ignoring layer {}, invalid filter: {err}", self.full_name);
                    None
                },
            })
            .as_ref()
    }

    /// Check if this layer's own filter accepts a feature.
    fn matches(&self, context: &MatchContext<'_>, functions: &FilterFunctions) -> bool {
        let filter = match self.compiled_filter(functions) {
            Some(filter) => filter,
            None => return false,
        };

        filter.matches(context).unwrap_or_else(|err| {
            error!("Filter of layer {} failed: {err}", self.full_name);
            false
        })
    }
}

/// Order siblings for matching.
///
/// Lower priority values rank higher, layers without priority rank lowest.
///
/// Exclusive layers come first, with the highest rank first since only one of
/// them can match. All other layers follow with the lowest rank first, so the
/// highest ranked draw groups are merged last. Ties sort exclusive layers by
/// descending name and all other layers by ascending name.
fn sibling_order(a: &LayerNode, b: &LayerNode) -> Ordering {
    let priority = |layer: &LayerNode| layer.priority.unwrap_or(f64::INFINITY);

    match (a.exclusive, b.exclusive) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => priority(a)
            .total_cmp(&priority(b))
            .then_with(|| b.full_name.cmp(&a.full_name)),
        (false, false) => priority(b)
            .total_cmp(&priority(a))
            .then_with(|| a.full_name.cmp(&b.full_name)),
    }
}

/// Compiled layer tree of a style document.
#[derive(Debug)]
pub struct StyleLayers {
    nodes: Vec<LayerNode>,
    roots: IndexMap<String, LayerId>,
    functions: FilterFunctions,
    cache: DrawGroupCache,
}

impl StyleLayers {
    /// Build the layer tree.
    ///
    /// Malformed layers and draw groups are skipped with a warning. The
    /// `styles` are only used to improve diagnostics.
    pub fn build(
        layers: &IndexMap<String, Value>,
        styles: &IndexMap<String, Value>,
        functions: FilterFunctions,
    ) -> Self {
        let mut builder = Builder { styles, nodes: Vec::new() };

        let mut roots = IndexMap::new();
        for (name, layer) in layers {
            if let Some(id) = builder.layer(name, layer, None) {
                roots.insert(name.clone(), id);
            }
        }

        Self { roots, functions, nodes: builder.nodes, cache: Default::default() }
    }

    /// Get a root layer by name.
    pub fn root(&self, name: &str) -> Option<LayerId> {
        self.roots.get(name).copied()
    }

    /// All root layers in document order.
    pub fn roots(&self) -> impl Iterator<Item = &LayerNode> {
        self.roots.values().map(|&id| &self.nodes[id])
    }

    pub fn get(&self, id: LayerId) -> Option<&LayerNode> {
        self.nodes.get(id)
    }

    /// Draw group cache of this layer tree.
    pub fn cache(&self) -> &DrawGroupCache {
        &self.cache
    }

    /// Find all layers below `root` matching a feature.
    pub fn match_feature(&self, root: LayerId, context: &MatchContext<'_>) -> Vec<LayerId> {
        let mut matched = Vec::new();
        if root < self.nodes.len() {
            self.match_layer(root, context, &mut matched);
        }
        matched
    }

    /// Recursively match a layer and its children.
    ///
    /// A tree whose own filter matches is considered matched even if none of
    /// its children match, in which case the tree itself is added.
    fn match_layer(
        &self,
        id: LayerId,
        context: &MatchContext<'_>,
        matched: &mut Vec<LayerId>,
    ) -> bool {
        let layer = &self.nodes[id];
        if !layer.matches(context, &self.functions) {
            return false;
        }

        match &layer.kind {
            LayerKind::Leaf => matched.push(id),
            LayerKind::Tree { children } => {
                let matched_before = matched.len();
                for &child in children {
                    if self.match_layer(child, context, matched) && self.nodes[child].exclusive {
                        break;
                    }
                }

                if matched.len() == matched_before {
                    matched.push(id);
                }
            },
        }

        true
    }

    /// Get the merged draw groups for a sequence of matched layers.
    ///
    /// Returns `None` if the layers produce nothing to draw.
    pub fn draw_groups(&self, matched: &[LayerId]) -> Option<Rc<DrawGroups>> {
        if matched.is_empty() {
            return None;
        }

        self.cache.get_or_merge(matched, || self.merge(matched))
    }

    /// Merge all draw groups of the matched layers and their ancestors.
    fn merge(&self, matched: &[LayerId]) -> DrawGroups {
        let stacks: Vec<Vec<_>> = matched
            .iter()
            .map(|&id| {
                let mut stack = Vec::new();
                let mut next = Some(id);
                while let Some(id) = next {
                    let layer = &self.nodes[id];
                    stack.push((id, &layer.draw));
                    next = layer.parent;
                }
                stack.reverse();
                stack
            })
            .collect();

        let group_names: IndexSet<&String> =
            stacks.iter().flatten().flat_map(|(_, draw)| draw.keys()).collect();

        let key = merge::key_string(matched);
        let layers: Vec<_> = matched.iter().map(|&id| self.nodes[id].full_name.clone()).collect();

        let mut groups = DrawGroups::new();
        for group in group_names {
            if let Some(draw) = merge::merge_group(&stacks, group) {
                let merged = MergedDraw {
                    key: format!("{key}/{group}"),
                    group: group.clone(),
                    layers: layers.clone(),
                    draw,
                };
                groups.insert(group.clone(), Rc::new(merged));
            }
        }

        groups
    }
}

/// Layer tree construction state.
struct Builder<'a> {
    styles: &'a IndexMap<String, Value>,
    nodes: Vec<LayerNode>,
}

impl Builder<'_> {
    /// Add a layer and all its children.
    ///
    /// Returns `None` if the layer is disabled.
    fn layer(&mut self, name: &str, value: &Value, parent: Option<LayerId>) -> Option<LayerId> {
        let empty = Map::new();
        let definition = match value {
            Value::Object(definition) => definition,
            Value::Null => &empty,
            _ => {
                self.invalid_child(name, value, parent);
                return None;
            },
        };

        let full_name = match parent {
            Some(parent) => format!("{}:{name}", self.nodes[parent].full_name),
            None => name.to_owned(),
        };

        // `visible` is an older name of `enabled`.
        let enabled = definition.get("enabled").or_else(|| definition.get("visible"));
        if !bool_property(&full_name, "enabled", enabled, true) {
            return None;
        }

        let exclusive = bool_property(&full_name, "exclusive", definition.get("exclusive"), false);
        let priority = match definition.get("priority") {
            Some(Value::Null) | None => None,
            Some(Value::Number(priority)) => priority.as_f64(),
            Some(priority) => {
                warn!("Ignoring priority of layer {full_name}, expected number: {priority}");
                None
            },
        };

        let id = self.nodes.len();
        self.nodes.push(LayerNode {
            draw: draw_groups(&full_name, definition.get("draw")),
            filter: definition.get("filter").cloned().unwrap_or_default(),
            data: definition.get("data").cloned(),
            name: name.to_owned(),
            kind: LayerKind::Leaf,
            compiled: OnceCell::new(),
            full_name,
            exclusive,
            priority,
            parent,
            id,
        });

        let mut children = Vec::new();
        for (key, child) in definition {
            if RESERVED.contains(&key.as_str()) {
                continue;
            }

            if let Some(child) = self.layer(key, child, Some(id)) {
                children.push(child);
            }
        }

        // Roots are always trees, even without children.
        if parent.is_none() || !children.is_empty() {
            children.sort_by(|&a, &b| sibling_order(&self.nodes[a], &self.nodes[b]));
            self.nodes[id].kind = LayerKind::Tree { children };
        }

        Some(id)
    }

    /// Report a child layer which is not an object.
    fn invalid_child(&self, name: &str, value: &Value, parent: Option<LayerId>) {
        let parent = match parent {
            Some(parent) => &self.nodes[parent],
            None => {
                warn!("Ignoring layer {name}, expected object: {value}");
                return;
            },
        };

        if self.styles.contains_key(&parent.name) {
            warn!(
                "Ignoring layer {name} under {}, expected object: {value}; {} is also the name of \
                 a style, did you mean to create a draw group?",
                parent.full_name, parent.name
            );
        } else {
            warn!("Ignoring layer {name} under {}, expected object: {value}", parent.full_name);
        }
    }
}

/// Parse an optional boolean layer property.
fn bool_property(layer: &str, name: &str, value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(value)) => *value,
        Some(Value::Null) | None => default,
        Some(value) => {
            warn!("Ignoring {name} of layer {layer}, expected boolean: {value}");
            default
        },
    }
}

/// Parse the draw groups of a layer.
fn draw_groups(layer: &str, draw: Option<&Value>) -> IndexMap<String, Map<String, Value>> {
    let groups = match draw {
        Some(Value::Object(groups)) => groups,
        Some(Value::Null) | None => return IndexMap::new(),
        Some(draw) => {
            warn!("Ignoring draw of layer {layer}, expected object: {draw}");
            return IndexMap::new();
        },
    };

    let mut parsed = IndexMap::new();
    for (group, value) in groups {
        match value {
            Value::Object(value) => {
                parsed.insert(group.clone(), value.clone());
            },
            Value::Null => {
                parsed.insert(group.clone(), Map::new());
            },
            value => {
                warn!("Ignoring draw group {group} of layer {layer}, expected object: {value}")
            },
        }
    }
    parsed
}
