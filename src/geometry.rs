// src/geometry.rs
//
// Point-vs-rectangle and point-vs-line primitives shared by the zone and
// line trackers. Coordinates are detector pixel space: x grows right,
// y grows down.

use crate::types::{DetectionShape, Point, PositionMethod};

/// Inside test against a rectangle shrunk inward by `padding` on each side.
/// The shrink keeps people hovering on the boundary from flickering the
/// classifier. If the padding collapses the rectangle, the unpadded
/// rectangle is used instead.
pub fn in_padded_rect(p: Point, top_left: [i32; 2], bottom_right: [i32; 2], padding: i32) -> bool {
    let (x1, y1) = (top_left[0] as f32, top_left[1] as f32);
    let (x2, y2) = (bottom_right[0] as f32, bottom_right[1] as f32);
    let pad = padding as f32;

    let (px1, py1, px2, py2) = (x1 + pad, y1 + pad, x2 - pad, y2 - pad);
    if px1 >= px2 || py1 >= py2 {
        return x1 <= p.x && p.x <= x2 && y1 <= p.y && p.y <= y2;
    }
    px1 <= p.x && p.x <= px2 && py1 <= p.y && p.y <= py2
}

/// Which side of the infinite extension of `start → end` the point is on.
/// Sign of the z component of cross(line_vector, point_vector):
/// `1` and `-1` are the two half planes, `0` is exactly collinear.
pub fn side_of_line(p: Point, start: Point, end: Point) -> i32 {
    let line = (end.x - start.x, end.y - start.y);
    let to_point = (p.x - start.x, p.y - start.y);
    let cross = line.0 * to_point.1 - line.1 * to_point.0;
    if cross > 0.0 {
        1
    } else if cross < 0.0 {
        -1
    } else {
        0
    }
}

/// Proximity gate for the finite segment: the segment's axis-aligned
/// bounding box expanded by `padding` on all sides. Keeps far-away traffic
/// from ever interacting with the infinite-line side test.
pub fn near_segment(p: Point, start: Point, end: Point, padding: f32) -> bool {
    let min_x = start.x.min(end.x) - padding;
    let max_x = start.x.max(end.x) + padding;
    let min_y = start.y.min(end.y) - padding;
    let max_y = start.y.max(end.y) + padding;
    min_x <= p.x && p.x <= max_x && min_y <= p.y && p.y <= max_y
}

pub fn segment_length(start: [i32; 2], end: [i32; 2]) -> f64 {
    let dx = (end[0] - start[0]) as f64;
    let dy = (end[1] - start[1]) as f64;
    (dx * dx + dy * dy).sqrt()
}

pub fn distance(a: Point, b: Point) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Reduce a detection to the single point the trackers classify.
pub fn person_position(shape: &DetectionShape, method: PositionMethod) -> Point {
    match shape {
        DetectionShape::Point([x, y]) => Point::new(*x, *y),
        DetectionShape::Bbox([x1, y1, x2, y2]) => match method {
            PositionMethod::Center => Point::new((x1 + x2) / 2.0, (y1 + y2) / 2.0),
            PositionMethod::BottomCenter => Point::new((x1 + x2) / 2.0, *y2),
        },
    }
}
