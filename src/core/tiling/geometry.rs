//! Polygon geometry for annotation regions and masks.

use serde::{Deserialize, Serialize};

/// Axis-aligned floating-point bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        (self.max_x - self.min_x).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.max_y - self.min_y).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Overlap of two bounds; zero-sized when they do not meet
    pub fn intersection(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        }
    }

    /// Smallest bounds enclosing both
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// A simple polygon given by its exterior ring, in image pixel coordinates.
///
/// The ring is implicitly closed. Point containment uses the even-odd rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub points: Vec<[f64; 2]>,
}

impl Polygon {
    pub fn new(points: Vec<[f64; 2]>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle
    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(vec![
            [x, y],
            [x + width, y],
            [x + width, y + height],
            [x, y + height],
        ])
    }

    /// Enclosed area (shoelace formula)
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let mut twice_area = 0.0;
        for i in 0..n {
            let [x0, y0] = self.points[i];
            let [x1, y1] = self.points[(i + 1) % n];
            twice_area += x0 * y1 - x1 * y0;
        }
        (twice_area / 2.0).abs()
    }

    /// Bounds of the ring, or `None` for an empty polygon
    pub fn bounds(&self) -> Option<Bounds> {
        let first = self.points.first()?;
        let mut bounds = Bounds {
            min_x: first[0],
            min_y: first[1],
            max_x: first[0],
            max_y: first[1],
        };
        for &[x, y] in &self.points[1..] {
            bounds.min_x = bounds.min_x.min(x);
            bounds.min_y = bounds.min_y.min(y);
            bounds.max_x = bounds.max_x.max(x);
            bounds.max_y = bounds.max_y.max(y);
        }
        Some(bounds)
    }

    /// Even-odd point-in-polygon test
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Copy shifted by `(dx, dy)`
    pub fn translate(&self, dx: f64, dy: f64) -> Polygon {
        Polygon::new(self.points.iter().map(|&[x, y]| [x + dx, y + dy]).collect())
    }
}

/// A union of polygons used as a mask.
#[derive(Debug, Clone, Default)]
pub struct MaskGeometry {
    polygons: Vec<Polygon>,
    // Per-polygon bounds, kept alongside for a cheap rejection test.
    bounds: Vec<Bounds>,
}

impl MaskGeometry {
    pub fn from_polygons(polygons: Vec<Polygon>) -> Self {
        let mut geometry = Self::default();
        for polygon in polygons {
            geometry.add(polygon);
        }
        geometry
    }

    /// Add a polygon to the union; degenerate polygons are dropped
    pub fn add(&mut self, polygon: Polygon) {
        if polygon.area() <= 0.0 {
            return;
        }
        if let Some(bounds) = polygon.bounds() {
            self.bounds.push(bounds);
            self.polygons.push(polygon);
        }
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    /// True when the union covers no area
    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    /// Bounds of the whole union
    pub fn bounds(&self) -> Option<Bounds> {
        let mut iter = self.bounds.iter();
        let first = *iter.next()?;
        Some(iter.fold(first, |acc, b| acc.union(b)))
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.polygons
            .iter()
            .zip(&self.bounds)
            .any(|(polygon, bounds)| bounds.contains(x, y) && polygon.contains(x, y))
    }
}
