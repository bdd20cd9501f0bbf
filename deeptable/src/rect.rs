use serde::{Deserialize, Serialize};

use crate::TileKey;

/// An axis-aligned rectangle in data coordinates, serialized as `{"x":[min,max],"y":[min,max]}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: [f64; 2],
    pub y: [f64; 2],
}

impl Rectangle {
    pub fn new(x: [f64; 2], y: [f64; 2]) -> Self {
        Self { x, y }
    }

    pub fn width(&self) -> f64 {
        (self.x[1] - self.x[0]).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y[1] - self.y[0]).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Whether the rectangles share any point, edges included.
    pub fn intersects(&self, other: &Rectangle) -> bool {
        self.x[0] <= other.x[1]
            && other.x[0] <= self.x[1]
            && self.y[0] <= other.y[1]
            && other.y[0] <= self.y[1]
    }

    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        self.intersects(other).then(|| Rectangle {
            x: [self.x[0].max(other.x[0]), self.x[1].min(other.x[1])],
            y: [self.y[0].max(other.y[0]), self.y[1].min(other.y[1])],
        })
    }

    pub fn contains(&self, other: &Rectangle) -> bool {
        self.x[0] <= other.x[0]
            && other.x[1] <= self.x[1]
            && self.y[0] <= other.y[0]
            && other.y[1] <= self.y[1]
    }

    /// The quadrant of this rectangle covered by the child tile `key`.
    ///
    /// Even `x` takes the lower half of the x range and even `y` the lower half of the y range.
    pub fn quadrant_for(&self, key: &TileKey) -> Rectangle {
        let (x_hi, y_hi) = key.quadrant();
        let x_mid = (self.x[0] + self.x[1]) / 2.0;
        let y_mid = (self.y[0] + self.y[1]) / 2.0;
        Rectangle {
            x: if x_hi {
                [x_mid, self.x[1]]
            } else {
                [self.x[0], x_mid]
            },
            y: if y_hi {
                [y_mid, self.y[1]]
            } else {
                [self.y[0], y_mid]
            },
        }
    }
}

/// The fraction of `tile`'s area that lies inside `bbox`: 1.0 when fully contained, 0.0 when
/// disjoint.
///
/// A degenerate tile (zero area) scores 1.0 if it touches the box at all.
pub fn check_overlap(tile: &Rectangle, bbox: &Rectangle) -> f64 {
    let Some(overlap) = tile.intersection(bbox) else {
        return 0.0;
    };
    let area = tile.area();
    if area <= 0.0 {
        return 1.0;
    }
    (overlap.area() / area).clamp(0.0, 1.0)
}
