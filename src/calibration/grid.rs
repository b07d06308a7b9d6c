//! Measurement grid and travel directions.

use cablebot_shared::config::Orientation;
use cablebot_shared::AxisId;
use serde::Serialize;

/// Serpentine sweep over the frame, inset by `offset` on every side.
///
/// Points are center-relative. The sweep starts in the left column at the top and
/// alternates direction column by column, so consecutive points are always neighbours.
pub fn generate_grid(width: f64, height: f64, offset: f64, columns: usize, rows: usize) -> Vec<[f64; 2]> {
    let half_x = (width / 2.0 - offset).max(0.0);
    let half_y = (height / 2.0 - offset).max(0.0);
    let columns = columns.max(1);
    let rows = rows.max(1);
    let step = |half: f64, count: usize| if count > 1 { 2.0 * half / (count - 1) as f64 } else { 0.0 };
    let dx = step(half_x, columns);
    let dy = step(half_y, rows);

    let mut points = Vec::with_capacity(columns * rows);
    for column in 0..columns {
        let x = if columns > 1 { -half_x + column as f64 * dx } else { 0.0 };
        for row in 0..rows {
            let row = if column % 2 == 0 { rows - 1 - row } else { row };
            let y = if rows > 1 { -half_y + row as f64 * dy } else { 0.0 };
            points.push([x, y]);
        }
    }
    points
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// The axis along which the sled mostly moves. Vertical sheets always travel Up.
pub fn travel_direction(from: [f64; 2], to: [f64; 2], orientation: Orientation) -> Direction {
    if orientation == Orientation::Vertical {
        return Direction::Up;
    }
    let dx = to[0] - from[0];
    let dy = to[1] - from[1];
    if dx.abs() >= dy.abs() && dx != 0.0 {
        if dx > 0.0 { Direction::Right } else { Direction::Left }
    } else if dy < 0.0 {
        Direction::Down
    } else {
        Direction::Up
    }
}

impl Direction {
    /// Axes that pull the sled along this direction and stay under position control while
    /// measuring.
    pub fn leading_axes(self) -> [AxisId; 2] {
        match self {
            Direction::Up => [AxisId::TopLeft, AxisId::TopRight],
            Direction::Down => [AxisId::BottomLeft, AxisId::BottomRight],
            Direction::Left => [AxisId::TopLeft, AxisId::BottomLeft],
            Direction::Right => [AxisId::TopRight, AxisId::BottomRight],
        }
    }

    pub fn trailing_axes(self) -> [AxisId; 2] {
        match self {
            Direction::Up => [AxisId::BottomLeft, AxisId::BottomRight],
            Direction::Down => [AxisId::TopLeft, AxisId::TopRight],
            Direction::Left => [AxisId::TopRight, AxisId::BottomRight],
            Direction::Right => [AxisId::TopLeft, AxisId::BottomLeft],
        }
    }

    /// Order in which the trailing belts are pulled taut at `at`: the belt whose anchor
    /// is nearer goes first.
    pub fn pull_order(self, at: [f64; 2]) -> [AxisId; 2] {
        let [x, y] = at;
        match self {
            Direction::Up if x < 0.0 => [AxisId::BottomLeft, AxisId::BottomRight],
            Direction::Up => [AxisId::BottomRight, AxisId::BottomLeft],
            Direction::Down if x < 0.0 => [AxisId::TopLeft, AxisId::TopRight],
            Direction::Down => [AxisId::TopRight, AxisId::TopLeft],
            Direction::Left if y < 0.0 => [AxisId::BottomRight, AxisId::TopRight],
            Direction::Left => [AxisId::TopRight, AxisId::BottomRight],
            Direction::Right if y < 0.0 => [AxisId::BottomLeft, AxisId::TopLeft],
            Direction::Right => [AxisId::TopLeft, AxisId::BottomLeft],
        }
    }
}
