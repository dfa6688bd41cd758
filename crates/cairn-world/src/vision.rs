//! Line-of-sight field of view over a terrain grid.

use std::collections::HashSet;

use crate::entity::Position;
use crate::terrain::TerrainGrid;

/// How far the avatar sees on a lit segment.
pub const VISION_RADIUS: i16 = 6;

/// Every tile within `radius` of `origin` that has an unobstructed line to
/// it. Opaque tiles are themselves visible; what lies behind them is not.
pub fn field_of_view(terrain: &TerrainGrid, origin: Position, radius: i16) -> HashSet<Position> {
    let mut seen = HashSet::new();
    if !terrain.in_bounds(origin) {
        return seen;
    }
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let target = origin.offset(dx, dy);
            if terrain.in_bounds(target) && line_is_clear(terrain, origin, target) {
                seen.insert(target);
            }
        }
    }
    seen
}

/// Bresenham walk from `from` to `to`; only intermediate tiles can block.
fn line_is_clear(terrain: &TerrainGrid, from: Position, to: Position) -> bool {
    let (mut x, mut y) = (i32::from(from.x), i32::from(from.y));
    let (tx, ty) = (i32::from(to.x), i32::from(to.y));
    let dx = (tx - x).abs();
    let dy = -(ty - y).abs();
    let sx = if x < tx { 1 } else { -1 };
    let sy = if y < ty { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        if x == tx && y == ty {
            return true;
        }
        if (x, y) != (i32::from(from.x), i32::from(from.y)) {
            let here = Position::new(x as i16, y as i16);
            if terrain.get(here).map_or(true, |t| t.blocks_sight()) {
                return false;
            }
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}
