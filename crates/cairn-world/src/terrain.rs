//! Terrain tiles and the per-segment grid.

use serde::{Deserialize, Serialize};

use crate::entity::Position;

// ---------------------------------------------------------------------------
// Tile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tile {
    Rock,
    Floor,
    Wall,
    Door { open: bool },
    StairsUp,
    StairsDown,
    Water,
}

impl Tile {
    /// One-byte storage code.
    pub fn to_code(self) -> u8 {
        match self {
            Tile::Rock => 0,
            Tile::Floor => 1,
            Tile::Wall => 2,
            Tile::Door { open: false } => 3,
            Tile::Door { open: true } => 4,
            Tile::StairsUp => 5,
            Tile::StairsDown => 6,
            Tile::Water => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Tile::Rock,
            1 => Tile::Floor,
            2 => Tile::Wall,
            3 => Tile::Door { open: false },
            4 => Tile::Door { open: true },
            5 => Tile::StairsUp,
            6 => Tile::StairsDown,
            7 => Tile::Water,
            _ => return None,
        })
    }

    pub fn blocks_sight(self) -> bool {
        matches!(self, Tile::Rock | Tile::Wall | Tile::Door { open: false })
    }

    pub fn is_walkable(self) -> bool {
        matches!(
            self,
            Tile::Floor | Tile::Door { open: true } | Tile::StairsUp | Tile::StairsDown
        )
    }

    /// Tiles worth mentioning to an observer.
    pub fn is_feature(self) -> bool {
        matches!(
            self,
            Tile::Door { .. } | Tile::StairsUp | Tile::StairsDown | Tile::Water
        )
    }
}

// ---------------------------------------------------------------------------
// TerrainGrid
// ---------------------------------------------------------------------------

/// A `width x height` grid of tiles stored row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerrainGrid {
    width: u16,
    height: u16,
    tiles: Vec<Tile>,
}

impl TerrainGrid {
    /// A grid filled with `fill`.
    pub fn filled(width: u16, height: u16, fill: Tile) -> Self {
        Self {
            width,
            height,
            tiles: vec![fill; width as usize * height as usize],
        }
    }

    /// Build from row-major tiles. Returns `None` if the length does not
    /// match the dimensions.
    pub fn from_tiles(width: u16, height: u16, tiles: Vec<Tile>) -> Option<Self> {
        (tiles.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            tiles,
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as u16) < self.width && (pos.y as u16) < self.height
    }

    fn index(&self, pos: Position) -> Option<usize> {
        self.in_bounds(pos)
            .then(|| pos.y as usize * self.width as usize + pos.x as usize)
    }

    /// The tile at `pos`, or `None` off the grid.
    pub fn get(&self, pos: Position) -> Option<Tile> {
        self.index(pos).map(|i| self.tiles[i])
    }

    /// Overwrite the tile at `pos`. Returns `false` off the grid.
    pub fn set(&mut self, pos: Position, tile: Tile) -> bool {
        match self.index(pos) {
            Some(i) => {
                self.tiles[i] = tile;
                true
            }
            None => false,
        }
    }

    /// Row-major tiles.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Row-major `(position, tile)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Position, Tile)> + '_ {
        let width = self.width as usize;
        self.tiles.iter().enumerate().map(move |(i, tile)| {
            (
                Position::new((i % width) as i16, (i / width) as i16),
                *tile,
            )
        })
    }

    /// First position (row-major) holding `tile`.
    pub fn find(&self, tile: Tile) -> Option<Position> {
        self.iter().find(|(_, t)| *t == tile).map(|(pos, _)| pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_codes_roundtrip() {
        for code in 0..=7u8 {
            let tile = Tile::from_code(code).unwrap();
            assert_eq!(tile.to_code(), code);
        }
        assert_eq!(Tile::from_code(8), None);
    }

    #[test]
    fn grid_bounds_and_lookup() {
        let mut grid = TerrainGrid::filled(4, 3, Tile::Floor);
        assert!(grid.set(Position::new(3, 2), Tile::StairsDown));
        assert!(!grid.set(Position::new(4, 0), Tile::Wall));
        assert_eq!(grid.get(Position::new(3, 2)), Some(Tile::StairsDown));
        assert_eq!(grid.get(Position::new(-1, 0)), None);
        assert_eq!(grid.find(Tile::StairsDown), Some(Position::new(3, 2)));
    }

    #[test]
    fn iteration_is_row_major() {
        let grid = TerrainGrid::filled(3, 2, Tile::Rock);
        let order: Vec<Position> = grid.iter().map(|(p, _)| p).collect();
        assert_eq!(order[0], Position::new(0, 0));
        assert_eq!(order[2], Position::new(2, 0));
        assert_eq!(order[3], Position::new(0, 1));
    }

    #[test]
    fn from_tiles_checks_length() {
        assert!(TerrainGrid::from_tiles(2, 2, vec![Tile::Floor; 3]).is_none());
        assert!(TerrainGrid::from_tiles(2, 2, vec![Tile::Floor; 4]).is_some());
    }
}
