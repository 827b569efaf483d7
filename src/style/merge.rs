//! Draw group merging and memoization.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use smallvec::SmallVec;

use crate::style::layer::LayerId;

/// Cache key identifying a sequence of matched layers.
pub type CacheKey = SmallVec<[LayerId; 8]>;

/// Merged draw groups by group name.
pub type DrawGroups = IndexMap<String, Rc<MergedDraw>>;

/// Final draw instructions of one draw group.
#[derive(Serialize, PartialEq, Clone, Debug)]
pub struct MergedDraw {
    /// Unique key of the layer sequence and draw group.
    pub key: String,
    pub group: String,
    /// Full names of the matched layers.
    pub layers: Vec<String>,
    pub draw: Map<String, Value>,
}

impl MergedDraw {
    /// Get a draw property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.draw.get(key)
    }
}

/// Memoized draw groups by matched layer sequence.
///
/// Sequences without any visible draw group are stored as `None`, so they
/// don't get merged again.
#[derive(Default, Debug)]
pub struct DrawGroupCache {
    entries: RefCell<HashMap<CacheKey, Option<Rc<DrawGroups>>>>,
    merges: Cell<usize>,
}

impl DrawGroupCache {
    /// Get the cached draw groups for `key`, merging them on a cache miss.
    pub fn get_or_merge<F>(&self, key: &[LayerId], merge: F) -> Option<Rc<DrawGroups>>
    where
        F: FnOnce() -> DrawGroups,
    {
        if let Some(groups) = self.entries.borrow().get(key) {
            return groups.clone();
        }

        self.merges.set(self.merges.get() + 1);
        let groups = merge();
        let groups = (!groups.is_empty()).then(|| Rc::new(groups));

        self.entries.borrow_mut().insert(CacheKey::from_slice(key), groups.clone());

        groups
    }

    /// Number of layer sequences merged so far.
    pub fn merges(&self) -> usize {
        self.merges.get()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// Format a cache key as `id/id/id`.
pub fn key_string(key: &[LayerId]) -> String {
    let ids: Vec<_> = key.iter().map(LayerId::to_string).collect();
    ids.join("/")
}

/// Merge one draw group across layer stacks.
///
/// Each stack lists the draw groups of a matched layer's ancestors, root
/// first. Stacks are walked in parallel from the shallowest to the deepest
/// level, merging every distinct layer of a level on top of the previous
/// ones. Returns `None` if no layer defines the group or it is invisible.
pub fn merge_group<'a>(
    stacks: &[Vec<(LayerId, &'a IndexMap<String, Map<String, Value>>)>],
    group: &str,
) -> Option<Map<String, Value>> {
    let depth = stacks.iter().map(Vec::len).max()?;

    let mut draw = Map::new();
    draw.insert("visible".into(), Value::Bool(true));

    let mut found = false;
    let mut merged_ids: SmallVec<[LayerId; 8]> = SmallVec::new();
    for level in 0..depth {
        merged_ids.clear();

        for stack in stacks {
            let (id, groups) = match stack.get(level) {
                Some(entry) => *entry,
                None => continue,
            };

            // Layers shared between stacks are merged only once per level.
            if merged_ids.contains(&id) {
                continue;
            }
            merged_ids.push(id);

            if let Some(source) = groups.get(group) {
                deep_merge(&mut draw, source);
                found = true;
            }
        }
    }

    (found && draw.get("visible") != Some(&Value::Bool(false))).then_some(draw)
}

/// Recursively merge `source` into `target`.
///
/// Nested objects are merged, all other values replace the existing value.
pub fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(target)), Value::Object(source)) => deep_merge(target, source),
            _ => {
                target.insert(key.clone(), value.clone());
            },
        }
    }
}
