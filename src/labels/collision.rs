//! Per-tile label collision.

use std::borrow::BorrowMut;
use std::collections::HashMap;

use tracing::trace;

use crate::geometry::{Aabb, Obb, Point};
use crate::labels::{Label, LabelId};

/// Boxes of all labels placed in a collision group.
#[derive(Default, Debug)]
pub struct BoxSet {
    entries: Vec<(LabelId, Aabb, Obb)>,
}

impl BoxSet {
    /// Add a label's boxes.
    pub fn push(&mut self, label: &Label) {
        self.entries.push((label.id, label.aabb, label.obb));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(LabelId, Aabb, Obb)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Label collision state of a single tile.
#[derive(Debug)]
pub struct TileCollisions {
    tile_scale: f64,
    groups: HashMap<String, BoxSet>,
    repeats: HashMap<String, Vec<Point>>,
}

impl TileCollisions {
    pub fn new(tile_scale: f64) -> Self {
        Self { tile_scale, groups: Default::default(), repeats: Default::default() }
    }

    /// Place labels of a collision group.
    ///
    /// Labels are placed in order of their priority, falling back to their
    /// ID for equal priorities. A label is discarded if it was thrown away,
    /// overlaps a label placed before it in the same group, or is too close
    /// to a placed label of its repeat group. Labels which don't collide are
    /// always placed without blocking others.
    ///
    /// Returns the placed labels.
    pub fn collide<T: BorrowMut<Label>>(&mut self, group: &str, mut labels: Vec<T>) -> Vec<T> {
        labels.sort_by(|a, b| {
            let (a, b): (&Label, &Label) = (a.borrow(), b.borrow());
            a.layout.priority.total_cmp(&b.layout.priority).then(a.id.cmp(&b.id))
        });

        let boxes = self.groups.entry(group.into()).or_default();

        let mut placed = Vec::with_capacity(labels.len());
        for mut item in labels {
            let label: &mut Label = item.borrow_mut();

            let keep = if label.throw_away {
                false
            } else if !label.layout.collide {
                true
            } else {
                !label.discard(boxes, None) && !repeats_nearby(&self.repeats, label)
            };

            label.placed = Some(keep);
            if !keep {
                trace!("Discarding label {} in collision group {group}", label.id);
                continue;
            }

            if label.layout.collide {
                boxes.push(label);
            }

            if let Some(repeat_group) = label.layout.repeat_group.as_ref() {
                self.repeats.entry(repeat_group.clone()).or_default().push(label.position);
            }

            label.may_repeat_across_tiles = label.may_repeat_across_tiles(self.tile_scale);

            placed.push(item);
        }

        placed
    }

    /// Boxes placed in a collision group.
    pub fn boxes(&self, group: &str) -> Option<&BoxSet> {
        self.groups.get(group)
    }
}

/// Check if a label is within its repeat distance of a placed label.
fn repeats_nearby(repeats: &HashMap<String, Vec<Point>>, label: &Label) -> bool {
    let distance = label.layout.repeat_distance;
    if distance <= 0. {
        return false;
    }

    let positions = match label.layout.repeat_group.as_ref().and_then(|group| repeats.get(group)) {
        Some(positions) => positions,
        None => return false,
    };

    positions.iter().any(|&position| (position - label.position).length() < distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;
    use crate::labels::tests::boxed_label;
    use crate::labels::{LabelType, Layout};

    fn ids(labels: &[Label]) -> Vec<LabelId> {
        labels.iter().map(|label| label.id).collect()
    }

    #[test]
    fn priority_order() {
        let mut collisions = TileCollisions::new(4096.);

        let mut low = boxed_label(1, [0., -20., 20., 0.], 0.);
        low.layout.priority = 5.;
        let mut high = boxed_label(2, [10., -20., 30., 0.], 0.);
        high.layout.priority = 1.;
        let tie_a = boxed_label(4, [100., -20., 120., 0.], 0.);
        let tie_b = boxed_label(3, [110., -20., 130., 0.], 0.);

        let placed = collisions.collide("text", vec![low, high, tie_a, tie_b]);
        assert_eq!(ids(&placed), [2, 3]);
        assert!(placed.iter().all(|label| label.placed == Some(true)));
        assert_eq!(collisions.boxes("text").map(BoxSet::len), Some(2));
    }

    #[test]
    fn groups_are_independent() {
        let mut collisions = TileCollisions::new(4096.);

        let text = boxed_label(1, [0., -20., 20., 0.], 0.);
        let icon = boxed_label(2, [0., -20., 20., 0.], 0.);

        assert_eq!(ids(&collisions.collide("text", vec![text])), [1]);
        assert_eq!(ids(&collisions.collide("points", vec![icon])), [2]);

        // Later batches collide with earlier ones of the same group.
        let late = boxed_label(3, [5., -20., 25., 0.], 0.);
        assert!(collisions.collide("text", vec![late]).is_empty());
    }

    #[test]
    fn non_colliding_labels() {
        let mut collisions = TileCollisions::new(4096.);

        let mut ghost = boxed_label(1, [0., -20., 20., 0.], 0.);
        ghost.layout.collide = false;
        ghost.layout.priority = 0.;
        let solid = boxed_label(2, [0., -20., 20., 0.], 0.);

        let placed = collisions.collide("text", vec![solid, ghost]);
        assert_eq!(ids(&placed), [1, 2]);
        assert_eq!(collisions.boxes("text").map(BoxSet::len), Some(1));
    }

    #[test]
    fn thrown_away_labels() {
        let mut collisions = TileCollisions::new(4096.);

        let mut label = boxed_label(1, [0., -20., 20., 0.], 0.);
        label.throw_away = true;
        label.layout.collide = false;

        assert!(collisions.collide("text", vec![label]).is_empty());
    }

    #[test]
    fn repeat_group_culling() {
        let mut collisions = TileCollisions::new(4096.);

        let layout = Layout {
            repeat_distance: 500.,
            repeat_group: Some(String::from("roads/Main Street")),
            ..Default::default()
        };
        let label = |id, x| {
            let size = Size::new(40., 10.);
            Label::new(id, LabelType::Line, Point::new(x, -2048.), 0., size, layout.clone(), 4096.)
        };

        let labels = vec![label(1, 1000.), label(2, 1300.), label(3, 1600.)];
        let placed = collisions.collide("text", labels);
        assert_eq!(ids(&placed), [1, 3]);

        // Repeat flags are set on placement.
        assert!(placed.iter().all(|label| label.may_repeat_across_tiles));
    }
}
