//! Deterministic segment generation.
//!
//! Segments that have never been visited do not exist anywhere; they are
//! generated on first arrival. Every segment draws from its own PCG stream
//! derived from `(world seed, segment number)`, so the same world seed always
//! produces the same dungeon regardless of the order segments are visited in.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

use crate::entity::{Actor, Item, Position};
use crate::identity::IdentityRegistry;
use crate::segment::{Segment, SegmentNumber};
use crate::terrain::{TerrainGrid, Tile};
use crate::WorldError;

const NAMES: [&str; 6] = ["rat", "jackal", "newt", "kobold", "bat", "gnome"];

/// Smallest grid the generator accepts.
pub const MIN_DIMENSION: u16 = 5;

/// Free floor tiles needed to place two stairs, four actors and three items.
const FREE_TILES_NEEDED: usize = 9;

#[derive(Debug, Clone)]
pub struct SegmentGenerator {
    seed: u64,
    width: u16,
    height: u16,
}

impl SegmentGenerator {
    /// # Panics
    ///
    /// Panics if either dimension is below [`MIN_DIMENSION`].
    pub fn new(seed: u64, width: u16, height: u16) -> Self {
        assert!(
            width >= MIN_DIMENSION && height >= MIN_DIMENSION,
            "segment dimensions must be at least {MIN_DIMENSION}x{MIN_DIMENSION}, got {width}x{height}"
        );
        Self {
            seed,
            width,
            height,
        }
    }

    fn rng_for(&self, number: SegmentNumber) -> Pcg64Mcg {
        let derived = self.seed ^ u64::from(number.0).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Pcg64Mcg::seed_from_u64(derived)
    }

    /// Generate segment `number`, allocating and registering identities for
    /// everything on it. The segment is registered as resident.
    pub fn generate(
        &self,
        number: SegmentNumber,
        registry: &mut IdentityRegistry,
    ) -> Result<Segment, WorldError> {
        let mut rng = self.rng_for(number);
        let mut terrain = TerrainGrid::filled(self.width, self.height, Tile::Wall);
        for y in 1..self.height as i16 - 1 {
            for x in 1..self.width as i16 - 1 {
                let tile = match rng.gen_range(0..100) {
                    0..=5 => Tile::Wall,
                    6..=8 => Tile::Water,
                    _ => Tile::Floor,
                };
                terrain.set(Position::new(x, y), tile);
            }
        }

        let mut free: Vec<Position> = terrain
            .iter()
            .filter(|(_, t)| *t == Tile::Floor)
            .map(|(p, _)| p)
            .collect();
        if free.len() < FREE_TILES_NEEDED {
            // Degenerate roll; carve the interior open.
            for y in 1..self.height as i16 - 1 {
                for x in 1..self.width as i16 - 1 {
                    terrain.set(Position::new(x, y), Tile::Floor);
                }
            }
            free = terrain
                .iter()
                .filter(|(_, t)| *t == Tile::Floor)
                .map(|(p, _)| p)
                .collect();
        }
        let mut take_free = |rng: &mut Pcg64Mcg| free.swap_remove(rng.gen_range(0..free.len()));

        if number.shallower().is_some() {
            terrain.set(take_free(&mut rng), Tile::StairsUp);
        }
        terrain.set(take_free(&mut rng), Tile::StairsDown);

        let mut segment = Segment::new(number, terrain);

        let actor_count = rng.gen_range(2..=4usize);
        for _ in 0..actor_count {
            let id = registry.allocate();
            let name = NAMES[rng.gen_range(0..NAMES.len())];
            let mut actor = Actor::new(id, rng.gen_range(1..40), name, take_free(&mut rng));
            if rng.gen_bool(0.5) {
                actor
                    .inventory
                    .push(Item::new(registry.allocate(), rng.gen_range(1..200), 1));
            }
            segment.add_actor(actor)?;
        }

        let item_count = rng.gen_range(1..=3usize);
        for _ in 0..item_count {
            let pos = take_free(&mut rng);
            let mut item = Item::new(registry.allocate(), rng.gen_range(1..200), rng.gen_range(1..5));
            if rng.gen_bool(0.3) {
                item.contents
                    .push(Item::new(registry.allocate(), rng.gen_range(1..200), 1));
            }
            segment.drop_item(pos, item)?;
        }

        segment.register_entities(registry, true)?;
        tracing::debug!(
            segment = %number,
            actors = segment.actors.len(),
            entities = segment.entity_count(),
            "generated segment"
        );
        Ok(segment)
    }
}
