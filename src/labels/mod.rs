//! Label model.

use serde::{Deserialize, Serialize};

use crate::broker::WorkerId;
use crate::geometry::{Aabb, Obb, Point, Size};

pub use crate::labels::collision::{BoxSet, TileCollisions};

mod collision;

/// Tolerance applied to collision boxes.
///
/// Keeps perfectly adjacent labels from colliding.
pub const COLLISION_EPSILON: f64 = 0.9999;

/// Extra width per pixel of unit scale for slanted text.
const ITALIC_WIDTH: f64 = 5.;

/// Label identifier, unique across all workers.
pub type LabelId = u64;

/// Generator for label IDs.
///
/// Every worker produces the sequence `prefix + n * stride`, so workers with
/// distinct prefixes below a shared stride never produce the same ID.
#[derive(Copy, Clone, Debug)]
pub struct LabelIds {
    prefix: u64,
    stride: u64,
    counter: u64,
}

impl LabelIds {
    pub fn new(prefix: u64, stride: u64) -> Self {
        Self { prefix, stride: stride.max(1), counter: 0 }
    }

    /// Label IDs for one worker of a pool.
    pub fn for_worker(id: WorkerId, count: usize) -> Self {
        Self::new(id.0 as u64, count as u64)
    }

    /// Claim the next label ID.
    pub fn next_id(&mut self) -> LabelId {
        let id = self.prefix + self.counter * self.stride;
        self.counter += 1;
        id
    }
}

impl Iterator for LabelIds {
    type Item = LabelId;

    fn next(&mut self) -> Option<LabelId> {
        Some(self.next_id())
    }
}

/// Position of a label relative to its anchor point.
#[derive(Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Default, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum Anchor {
    #[default]
    Center,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Anchor {
    /// Direction the label is moved in, in multiples of its half size.
    fn direction(self) -> Point {
        match self {
            Self::Center => Point::new(0., 0.),
            Self::Top => Point::new(0., 1.),
            Self::Bottom => Point::new(0., -1.),
            Self::Left => Point::new(-1., 0.),
            Self::Right => Point::new(1., 0.),
            Self::TopLeft => Point::new(-1., 1.),
            Self::TopRight => Point::new(1., 1.),
            Self::BottomLeft => Point::new(-1., -1.),
            Self::BottomRight => Point::new(1., -1.),
        }
    }
}

/// Horizontal text alignment.
#[derive(Serialize, Deserialize, Hash, PartialEq, Eq, Copy, Clone, Default, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    #[default]
    Center,
    Right,
}

impl Align {
    /// Alignment keeping text flush towards its anchor point.
    pub fn for_anchor(anchor: Anchor) -> Self {
        match anchor {
            Anchor::Left | Anchor::TopLeft | Anchor::BottomLeft => Self::Right,
            Anchor::Right | Anchor::TopRight | Anchor::BottomRight => Self::Left,
            _ => Self::Center,
        }
    }
}

/// Label geometry type.
#[derive(Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LabelType {
    Point,
    Line,
}

/// Placement settings of a label.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct Layout {
    /// Placement priority, lower values are placed first.
    pub priority: f64,
    /// Whether the label takes part in collision tests.
    pub collide: bool,
    /// Minimum distance between labels of the same repeat group.
    pub repeat_distance: f64,
    pub repeat_group: Option<String>,
    /// Extra space around the label in pixels.
    pub buffer: [f64; 2],
    /// Offset from the anchor point in pixels.
    pub offset: [f64; 2],
    pub anchor: Anchor,
    pub align: Option<Align>,
    pub italic: bool,
    /// Local tile units per pixel.
    pub units_per_pixel: f64,
    /// Side of a boundary line the label belongs to, `1` right and `-1` left.
    pub orientation: i8,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            priority: f64::MAX,
            collide: true,
            units_per_pixel: 1.,
            repeat_distance: Default::default(),
            repeat_group: Default::default(),
            orientation: Default::default(),
            buffer: Default::default(),
            offset: Default::default(),
            anchor: Default::default(),
            italic: Default::default(),
            align: Default::default(),
        }
    }
}

/// Placeable label.
#[derive(Clone, Debug)]
pub struct Label {
    pub id: LabelId,
    pub label_type: LabelType,
    /// Label size in pixels.
    pub size: Size,
    pub layout: Layout,
    /// Anchor point in local tile units.
    pub position: Point,
    /// Rotation in radians.
    pub angle: f64,
    pub align: Align,
    pub aabb: Aabb,
    pub obb: Obb,
    /// Placement result, `None` before collision.
    pub placed: Option<bool>,
    /// Label can never be placed.
    pub throw_away: bool,
    /// Label needs another repeat check against neighboring tiles.
    pub may_repeat_across_tiles: bool,
}

impl Label {
    /// Create a label and compute its collision boxes.
    ///
    /// Labels outside of the tile or without any size are thrown away.
    pub fn new(
        id: LabelId,
        label_type: LabelType,
        position: Point,
        angle: f64,
        size: Size,
        layout: Layout,
        tile_scale: f64,
    ) -> Self {
        let (aabb, obb) = compute_boxes(position, size, angle, &layout, COLLISION_EPSILON);
        let align = layout.align.unwrap_or_else(|| Align::for_anchor(layout.anchor));

        let mut label = Self {
            label_type,
            position,
            layout,
            angle,
            align,
            size,
            aabb,
            obb,
            id,
            may_repeat_across_tiles: false,
            throw_away: false,
            placed: None,
        };
        label.update_throw_away(tile_scale);

        label
    }

    /// Recompute the label's boxes with a different collision tolerance.
    pub fn with_epsilon(mut self, epsilon: f64, tile_scale: f64) -> Self {
        (self.aabb, self.obb) =
            compute_boxes(self.position, self.size, self.angle, &self.layout, epsilon);
        self.update_throw_away(tile_scale);
        self
    }

    fn update_throw_away(&mut self, tile_scale: f64) {
        let empty = self.size.width <= 0. || self.size.height <= 0.;
        self.throw_away = empty || !self.in_tile_bounds(tile_scale);
    }

    /// Check if the label overlaps any box in `boxes`.
    ///
    /// The box of the label `exclude` is ignored.
    pub fn occluded(&self, boxes: &BoxSet, exclude: Option<LabelId>) -> bool {
        boxes.iter().any(|(id, aabb, obb)| {
            // Broad phase.
            if Some(*id) == exclude || !self.aabb.intersects(aabb) {
                return false;
            }

            // Overlapping axis-aligned boxes collide without rotation.
            if self.obb.angle == 0. && obb.angle == 0. {
                return true;
            }

            self.obb.intersects(obb)
        })
    }

    /// Check if the label is anchored within the tile.
    ///
    /// Either the top-left or the bottom-right corner of the label's box
    /// must be inside of the tile.
    pub fn in_tile_bounds(&self, tile_scale: f64) -> bool {
        let inside = |corner: Point| {
            corner.x >= 0. && corner.y > -tile_scale && corner.x < tile_scale && corner.y <= 0.
        };
        inside(self.aabb.min()) || inside(self.aabb.max())
    }

    /// Check if the label needs repeat culling against neighboring tiles.
    ///
    /// Colliding labels always do, since they're collided across tiles
    /// anyway. Others only if they're within their repeat distance of any
    /// tile edge.
    pub fn may_repeat_across_tiles(&self, tile_scale: f64) -> bool {
        if self.layout.collide {
            return true;
        }

        let distance = self.layout.repeat_distance;
        if distance == 0. {
            return false;
        }

        let Point { x, y } = self.position;
        x.abs() < distance
            || (x - tile_scale).abs() < distance
            || y.abs() < distance
            || (y + tile_scale).abs() < distance
    }

    /// Check if the label must not be placed.
    pub fn discard(&self, boxes: &BoxSet, exclude: Option<LabelId>) -> bool {
        self.throw_away || self.occluded(boxes, exclude)
    }

    /// Minimal label representation sent to the main thread.
    pub fn summary(&self) -> LabelSummary {
        LabelSummary {
            id: self.id,
            label_type: self.label_type,
            obb: self.obb,
            position: self.position,
            angle: self.angle,
            size: self.size,
            offset: self.layout.offset,
            may_repeat_across_tiles: self.may_repeat_across_tiles,
            layout: LayoutSummary {
                priority: self.layout.priority,
                collide: self.layout.collide,
                repeat_distance: self.layout.repeat_distance,
                repeat_group: self.layout.repeat_group.clone(),
                buffer: self.layout.buffer,
                italic: self.layout.italic,
            },
        }
    }
}

/// Compute the axis-aligned and oriented boxes of a label.
///
/// The pixel `size` is padded by the layout's buffer, converted to tile
/// units, shrunk by `epsilon` and moved by the layout's anchor and offset.
pub fn compute_boxes(
    position: Point,
    size: Size,
    angle: f64,
    layout: &Layout,
    epsilon: f64,
) -> (Aabb, Obb) {
    let units = layout.units_per_pixel;
    let [buffer_x, buffer_y] = layout.buffer;

    let mut width = (size.width + 2. * buffer_x) * units * epsilon;
    let height = (size.height + 2. * buffer_y) * units * epsilon;
    if layout.italic {
        width += ITALIC_WIDTH * units;
    }
    let box_size = Size::new(width, height);

    // Pixel offsets grow downwards, while tile units grow upwards.
    let [offset_x, offset_y] = layout.offset;
    let direction = layout.anchor.direction();
    let shift = Point::new(
        offset_x * units + direction.x * width / 2.,
        -offset_y * units + direction.y * height / 2.,
    );

    // Rotate the shift with the label.
    let (sin, cos) = angle.sin_cos();
    let rotated = Point::new(shift.x * cos - shift.y * sin, shift.x * sin + shift.y * cos);

    let obb = Obb::new(position + rotated, angle, box_size);
    (obb.extent(), obb)
}

/// Serializable label summary.
#[derive(Serialize, Clone, Debug)]
pub struct LabelSummary {
    pub id: LabelId,
    #[serde(rename = "type")]
    pub label_type: LabelType,
    pub obb: Obb,
    pub position: Point,
    pub angle: f64,
    pub size: Size,
    pub offset: [f64; 2],
    pub may_repeat_across_tiles: bool,
    pub layout: LayoutSummary,
}

/// Layout settings relevant for collisions across tiles.
#[derive(Serialize, Clone, Debug)]
pub struct LayoutSummary {
    pub priority: f64,
    pub collide: bool,
    pub repeat_distance: f64,
    pub repeat_group: Option<String>,
    pub buffer: [f64; 2],
    pub italic: bool,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use super::*;

    /// Unit-scale label with a box matching `aabb` exactly.
    pub(crate) fn boxed_label(id: LabelId, aabb: [f64; 4], angle: f64) -> Label {
        let [min_x, min_y, max_x, max_y] = aabb;
        let position = Point::new((min_x + max_x) / 2., (min_y + max_y) / 2.);
        let size = Size::new(max_x - min_x, max_y - min_y);
        let layout = Layout::default();
        let mut label = Label::new(id, LabelType::Point, position, angle, size, layout, 4096.);

        // Drop the collision tolerance for exact boxes.
        let (aabb, obb) = compute_boxes(position, size, angle, &label.layout, 1.);
        label.aabb = aabb;
        label.obb = obb;
        label
    }

    #[test]
    fn disjoint_worker_ids() {
        let a: HashSet<_> = LabelIds::new(1000, 2).take(5).collect();
        let b: HashSet<_> = LabelIds::new(1001, 2).take(5).collect();

        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 5);
        assert!(a.is_disjoint(&b));

        let ids: Vec<_> = LabelIds::for_worker(WorkerId(1), 3).take(3).collect();
        assert_eq!(ids, [1, 4, 7]);
    }

    #[test]
    fn box_size() {
        let layout = Layout { buffer: [2., 1.], units_per_pixel: 2., ..Default::default() };
        let position = Point::new(100., -100.);
        let (aabb, obb) = compute_boxes(position, Size::new(20., 10.), 0., &layout, 1.);

        assert_eq!(obb.size(), Size::new(48., 24.));
        assert_eq!(aabb, Aabb::new(76., -112., 124., -88.));

        let italic = Layout { italic: true, ..layout };
        let (_, obb) = compute_boxes(Point::new(100., -100.), Size::new(20., 10.), 0., &italic, 1.);
        assert_eq!(obb.size(), Size::new(58., 24.));
    }

    #[test]
    fn anchor_and_offset() {
        let layout = Layout { anchor: Anchor::Top, offset: [4., 2.], ..Default::default() };
        let position = Point::new(100., -100.);
        let (aabb, _) = compute_boxes(position, Size::new(20., 10.), 0., &layout, 1.);
        assert_eq!(aabb, Aabb::new(94., -102., 114., -92.));

        assert_eq!(Align::for_anchor(Anchor::Left), Align::Right);
        assert_eq!(Align::for_anchor(Anchor::BottomRight), Align::Left);
        assert_eq!(Align::for_anchor(Anchor::Top), Align::Center);
    }

    #[test]
    fn unrotated_overlap_in_any_order() {
        let cases = [
            ([0., -20., 20., 0.], [10., -30., 30., -10.], true),
            ([0., -20., 20., 0.], [25., -20., 45., 0.], false),
            ([0., -20., 20., 0.], [5., -15., 10., -10.], true),
            ([0., -20., 20., 0.], [0., -50., 20., -30.], false),
        ];

        for (a, b, overlap) in cases {
            let a = boxed_label(1, a, 0.);
            let b = boxed_label(2, b, 0.);
            let other = boxed_label(3, [1000., -1000., 1010., -990.], 0.);

            let mut boxes = BoxSet::default();
            boxes.push(&other);
            boxes.push(&b);
            assert_eq!(a.occluded(&boxes, None), overlap);

            let mut boxes = BoxSet::default();
            boxes.push(&b);
            boxes.push(&other);
            assert_eq!(a.occluded(&boxes, None), overlap);

            let mut boxes = BoxSet::default();
            boxes.push(&a);
            assert_eq!(b.occluded(&boxes, None), overlap);
        }
    }

    #[test]
    fn adjacent_labels_do_not_collide() {
        let a = Label::new(
            1,
            LabelType::Point,
            Point::new(10., -10.),
            0.,
            Size::new(20., 20.),
            Layout::default(),
            4096.,
        );
        let b = Label::new(
            2,
            LabelType::Point,
            Point::new(30., -10.),
            0.,
            Size::new(20., 20.),
            Layout::default(),
            4096.,
        );

        let mut boxes = BoxSet::default();
        boxes.push(&a);
        assert!(!b.occluded(&boxes, None));
    }

    #[test]
    fn rotated_narrow_phase() {
        let angle = std::f64::consts::FRAC_PI_4;
        let a = Label::new(
            1,
            LabelType::Line,
            Point::new(100., -100.),
            angle,
            Size::new(40., 4.),
            Layout::default(),
            4096.,
        );
        let b = Label::new(
            2,
            LabelType::Line,
            Point::new(116., -116.),
            angle,
            Size::new(40., 4.),
            Layout::default(),
            4096.,
        );
        assert!(a.aabb.intersects(&b.aabb));

        let mut boxes = BoxSet::default();
        boxes.push(&a);
        assert!(!b.occluded(&boxes, None));
    }

    #[test]
    fn excluded_label() {
        let a = boxed_label(1, [0., -20., 20., 0.], 0.);
        let b = boxed_label(2, [10., -20., 30., 0.], 0.);

        let mut boxes = BoxSet::default();
        boxes.push(&a);
        assert!(b.occluded(&boxes, None));
        assert!(!b.occluded(&boxes, Some(1)));
        assert!(b.occluded(&boxes, Some(7)));
    }

    #[test]
    fn outside_tile_is_discarded() {
        let label = boxed_label(1, [300., -10., 320., -5.], 0.);
        assert!(!label.in_tile_bounds(256.));

        let mut label = label;
        label.throw_away = !label.in_tile_bounds(256.);
        assert!(label.discard(&BoxSet::default(), None));

        // Straddling the right edge with the top-left corner inside.
        let label = boxed_label(2, [250., -10., 270., -5.], 0.);
        assert!(label.in_tile_bounds(256.));
        assert!(!label.discard(&BoxSet::default(), None));
    }

    #[test]
    fn custom_epsilon() {
        let (position, size) = (Point::new(10., -10.), Size::new(20., 20.));
        let label = Label::new(1, LabelType::Point, position, 0., size, Layout::default(), 4096.);
        assert!(label.obb.size().width < 20.);

        let exact = label.with_epsilon(1., 4096.);
        assert_eq!(exact.obb.size(), Size::new(20., 20.));
        assert_eq!(exact.aabb, Aabb::new(0., -20., 20., 0.));

        let outside = exact.with_epsilon(1., 8.);
        assert!(outside.throw_away);
    }

    #[test]
    fn zero_size_is_thrown_away() {
        let label = Label::new(
            1,
            LabelType::Point,
            Point::new(10., -10.),
            0.,
            Size::new(0., 12.),
            Layout::default(),
            4096.,
        );
        assert!(label.throw_away);
    }

    #[test]
    fn repeat_across_tiles() {
        let layout = Layout { collide: false, repeat_distance: 100., ..Default::default() };
        let label = |x, y| {
            let size = Size::new(10., 10.);
            Label::new(1, LabelType::Point, Point::new(x, y), 0., size, layout.clone(), 4096.)
        };

        assert!(!label(2048., -2048.).may_repeat_across_tiles(4096.));
        assert!(label(50., -2048.).may_repeat_across_tiles(4096.));
        assert!(label(4000., -2048.).may_repeat_across_tiles(4096.));
        assert!(label(2048., -50.).may_repeat_across_tiles(4096.));
        assert!(label(2048., -4050.).may_repeat_across_tiles(4096.));

        let mut colliding = label(2048., -2048.);
        colliding.layout.collide = true;
        assert!(colliding.may_repeat_across_tiles(4096.));

        let mut unlimited = label(50., -50.);
        unlimited.layout.repeat_distance = 0.;
        assert!(!unlimited.may_repeat_across_tiles(4096.));
    }
}
