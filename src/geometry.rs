//! Shared geometry types.

use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

use serde::{Deserialize, Serialize};
#[cfg(feature = "skia")]
use skia_safe::{ISize, Point as SkiaPoint};

use crate::tile::TILE_SIZE;

/// Earth's circumference at the equator in meters.
const EARTH_EQUATOR: f64 = 40_075_016.686;

/// Width and height of a single pixel in meters at zoom level 0.
const ZERO_PIXEL_SIZE: f64 = EARTH_EQUATOR / TILE_SIZE as f64;

/// 2D object position.
#[derive(Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Default, Debug)]
pub struct Point<T = f64> {
    pub x: T,
    pub y: T,
}

impl<T> Point<T> {
    pub const fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

impl Point {
    /// Dot product of two vectors.
    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// Euclidean length of the vector.
    pub fn length(self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Scale the vector to unit length.
    ///
    /// Zero-length vectors are returned unchanged.
    pub fn normalize(self) -> Self {
        let length = self.length();
        if length == 0. { self } else { Self::new(self.x / length, self.y / length) }
    }
}

impl<T> From<(T, T)> for Point<T> {
    fn from((x, y): (T, T)) -> Self {
        Self { x, y }
    }
}

impl From<Point<f32>> for Point {
    fn from(point: Point<f32>) -> Self {
        Self::new(point.x as f64, point.y as f64)
    }
}

#[cfg(feature = "skia")]
impl From<Point<f32>> for SkiaPoint {
    fn from(point: Point<f32>) -> Self {
        Self::new(point.x, point.y)
    }
}

impl<T: Add<Output = T>> Add<Point<T>> for Point<T> {
    type Output = Self;

    fn add(mut self, other: Point<T>) -> Self {
        self.x = self.x + other.x;
        self.y = self.y + other.y;
        self
    }
}

impl<T: AddAssign> AddAssign<Point<T>> for Point<T> {
    fn add_assign(&mut self, other: Point<T>) {
        self.x += other.x;
        self.y += other.y;
    }
}

impl<T: Sub<Output = T>> Sub<Point<T>> for Point<T> {
    type Output = Self;

    fn sub(mut self, other: Point<T>) -> Self {
        self.x = self.x - other.x;
        self.y = self.y - other.y;
        self
    }
}

impl<T: SubAssign> SubAssign<Point<T>> for Point<T> {
    fn sub_assign(&mut self, other: Point<T>) {
        self.x -= other.x;
        self.y -= other.y;
    }
}

impl Mul<f64> for Point {
    type Output = Point;

    fn mul(mut self, scale: f64) -> Self {
        self.x *= scale;
        self.y *= scale;
        self
    }
}

/// 2D object size.
#[derive(Serialize, Deserialize, PartialEq, Copy, Clone, Default, Debug)]
pub struct Size<T = f64> {
    pub width: T,
    pub height: T,
}

impl<T> Size<T> {
    pub const fn new(width: T, height: T) -> Self {
        Self { width, height }
    }
}

impl<T> From<(T, T)> for Size<T> {
    fn from((width, height): (T, T)) -> Self {
        Self { width, height }
    }
}

impl From<Size<f32>> for Size {
    fn from(size: Size<f32>) -> Self {
        Self::new(size.width as f64, size.height as f64)
    }
}

impl From<Size<f32>> for Size<u32> {
    fn from(size: Size<f32>) -> Self {
        Self { width: size.width.ceil() as u32, height: size.height.ceil() as u32 }
    }
}

#[cfg(feature = "skia")]
impl From<Size<u32>> for ISize {
    fn from(size: Size<u32>) -> Self {
        ISize::new(size.width as i32, size.height as i32)
    }
}

impl Mul<f64> for Size {
    type Output = Self;

    fn mul(mut self, scale: f64) -> Self {
        self.width *= scale;
        self.height *= scale;
        self
    }
}

/// Axis-aligned bounding box as `[min_x, min_y, max_x, max_y]`.
#[derive(Serialize, Deserialize, PartialEq, Copy, Clone, Default, Debug)]
pub struct Aabb(pub [f64; 4]);

impl Aabb {
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self([min_x, min_y, max_x, max_y])
    }

    /// Check if two boxes overlap.
    ///
    /// Boxes sharing an edge are considered intersecting.
    pub fn intersects(&self, other: &Self) -> bool {
        let [a_min_x, a_min_y, a_max_x, a_max_y] = self.0;
        let [b_min_x, b_min_y, b_max_x, b_max_y] = other.0;
        !(a_min_x > b_max_x || a_max_x < b_min_x || a_min_y > b_max_y || a_max_y < b_min_y)
    }

    pub fn min(&self) -> Point {
        Point::new(self.0[0], self.0[1])
    }

    pub fn max(&self) -> Point {
        Point::new(self.0[2], self.0[3])
    }
}

/// Oriented bounding box.
#[derive(Serialize, PartialEq, Copy, Clone, Debug)]
pub struct Obb {
    pub centroid: Point,
    pub angle: f64,
    pub quad: [Point; 4],
    #[serde(skip)]
    half_size: Size,
    #[serde(skip)]
    axes: [Point; 2],
}

impl Obb {
    pub fn new(centroid: Point, angle: f64, size: Size) -> Self {
        let half_size = size * 0.5;

        let (sin, cos) = angle.sin_cos();
        let along = Point::new(cos, sin) * half_size.width;
        let across = Point::new(-sin, cos) * half_size.height;

        let quad = [
            centroid - along - across,
            centroid + along - across,
            centroid + along + across,
            centroid - along + across,
        ];
        let axes = [(quad[1] - quad[0]).normalize(), (quad[3] - quad[0]).normalize()];

        Self { centroid, angle, half_size, quad, axes }
    }

    /// Axis-aligned extent of the box.
    pub fn extent(&self) -> Aabb {
        let (min, max) = (f64::INFINITY, f64::NEG_INFINITY);
        let mut aabb = Aabb::new(min, min, max, max);
        for corner in &self.quad {
            aabb.0[0] = aabb.0[0].min(corner.x);
            aabb.0[1] = aabb.0[1].min(corner.y);
            aabb.0[2] = aabb.0[2].max(corner.x);
            aabb.0[3] = aabb.0[3].max(corner.y);
        }
        aabb
    }

    /// Width and height of the box before rotation.
    pub fn size(&self) -> Size {
        self.half_size * 2.
    }

    /// Separating axis test between two oriented boxes.
    pub fn intersects(&self, other: &Self) -> bool {
        self.overlaps_on(other, &self.axes) && self.overlaps_on(other, &other.axes)
    }

    /// Check if both boxes overlap when projected onto every axis.
    fn overlaps_on(&self, other: &Self, axes: &[Point; 2]) -> bool {
        axes.iter().all(|&axis| {
            let (a_min, a_max) = self.project(axis);
            let (b_min, b_max) = other.project(axis);
            b_min <= a_max && b_max >= a_min
        })
    }

    /// Project all corners onto an axis.
    fn project(&self, axis: Point) -> (f64, f64) {
        self.quad.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), corner| {
            let projection = corner.dot(axis);
            (min.min(projection), max.max(projection))
        })
    }
}

/// Get pixel size in meters at the equator for a certain zoom level.
pub fn meters_per_pixel(zoom: f64) -> f64 {
    ZERO_PIXEL_SIZE / 2f64.powf(zoom)
}
