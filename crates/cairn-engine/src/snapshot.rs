//! Lock-free live snapshots for observers on other threads.
//!
//! The simulation thread calls [`SnapshotPublisher::publish`] once per turn.
//! It flattens the parts of the world an observer may see into a
//! [`LiveSnapshot`], writes it into the slot readers are *not* pointed at and
//! then flips the `current` index. Any thread may call
//! [`SnapshotPublisher::read`] at any time; it never blocks and never returns
//! a value mixed from two publishes.
//!
//! Each slot is a handful of `AtomicU64` words behind a sequence counter
//! (a seqlock). The counter is odd while the slot is being written. A reader
//! copies the words and retries only when the counter moved under it, which
//! can happen only if the writer lapped it by publishing twice during one
//! read.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use cairn_engine::snapshot::{LiveSnapshot, SnapshotPublisher};
//!
//! let publisher = Arc::new(SnapshotPublisher::new());
//! let reader = Arc::clone(&publisher);
//! let seen = std::thread::spawn(move || reader.read()).join().unwrap();
//! assert_eq!(seen, LiveSnapshot::EMPTY);
//! ```

use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};

use cairn_world::entity::Position;
use cairn_world::state::WorldState;
use cairn_world::terrain::Tile;
use serde::Serialize;

/// How many nearby features a snapshot carries.
pub const FEATURE_SLOTS: usize = 4;

/// Neighbour offsets, clockwise from north. Bit `i` of
/// [`LiveSnapshot::walkable`] refers to `NEIGHBOURS[i]`.
pub const NEIGHBOURS: [(i16, i16); 8] = [
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
];

// ---------------------------------------------------------------------------
// LiveSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[repr(u8)]
pub enum FeatureKind {
    #[default]
    None = 0,
    StairsUp = 1,
    StairsDown = 2,
    DoorClosed = 3,
    DoorOpen = 4,
    Water = 5,
    Items = 6,
}

impl FeatureKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FeatureKind::StairsUp,
            2 => FeatureKind::StairsDown,
            3 => FeatureKind::DoorClosed,
            4 => FeatureKind::DoorOpen,
            5 => FeatureKind::Water,
            6 => FeatureKind::Items,
            _ => FeatureKind::None,
        }
    }

    fn of_tile(tile: Tile) -> Self {
        match tile {
            Tile::StairsUp => FeatureKind::StairsUp,
            Tile::StairsDown => FeatureKind::StairsDown,
            Tile::Door { open: false } => FeatureKind::DoorClosed,
            Tile::Door { open: true } => FeatureKind::DoorOpen,
            Tile::Water => FeatureKind::Water,
            _ => FeatureKind::None,
        }
    }
}

/// Something worth pointing out near the avatar, relative to its tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Feature {
    pub kind: FeatureKind,
    pub dx: i8,
    pub dy: i8,
}

impl Feature {
    fn pack(self) -> u64 {
        u64::from(self.kind as u8) | u64::from(self.dx as u8) << 8 | u64::from(self.dy as u8) << 16
    }

    fn unpack(bits: u64) -> Self {
        Self {
            kind: FeatureKind::from_u8(bits as u8),
            dx: (bits >> 8) as u8 as i8,
            dy: (bits >> 16) as u8 as i8,
        }
    }
}

/// The flattened, pointer-free view of the world an observer may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LiveSnapshot {
    pub turn: u64,
    pub segment: u16,
    pub x: i16,
    pub y: i16,
    pub hp: i32,
    pub hp_max: i32,
    /// Closest visible features, nearest first; unused slots are
    /// [`FeatureKind::None`].
    pub features: [Feature; FEATURE_SLOTS],
    /// Bit `i` set when the tile at `NEIGHBOURS[i]` can be walked on.
    pub walkable: u8,
    /// Actors standing on any of the eight neighbouring tiles.
    pub adjacent_actors: u8,
}

/// `AtomicU64` words per slot.
const WORDS: usize = 5;

impl LiveSnapshot {
    /// What [`SnapshotPublisher::read`] returns before the first publish.
    pub const EMPTY: LiveSnapshot = LiveSnapshot {
        turn: 0,
        segment: 0,
        x: 0,
        y: 0,
        hp: 0,
        hp_max: 0,
        features: [Feature {
            kind: FeatureKind::None,
            dx: 0,
            dy: 0,
        }; FEATURE_SLOTS],
        walkable: 0,
        adjacent_actors: 0,
    };

    /// Flatten `state`. `None` until the avatar stands on the active segment.
    pub fn capture(state: &WorldState) -> Option<Self> {
        let origin = state.avatar_position()?;
        let segment = &state.active;

        let mut nearby: Vec<(u16, Position, FeatureKind)> = state
            .visible()
            .iter()
            .filter(|pos| **pos != origin)
            .filter_map(|pos| {
                let kind = match segment.terrain.get(*pos) {
                    Some(tile) if tile.is_feature() => FeatureKind::of_tile(tile),
                    Some(_) if segment.floor.contains_key(pos) => FeatureKind::Items,
                    _ => FeatureKind::None,
                };
                (kind != FeatureKind::None).then_some((origin.distance(*pos), *pos, kind))
            })
            .collect();
        // Row-major tiebreak keeps the pick independent of set iteration order.
        nearby.sort_by_key(|(distance, pos, _)| (*distance, *pos));

        let mut features = [Feature::default(); FEATURE_SLOTS];
        for (slot, (_, pos, kind)) in features.iter_mut().zip(nearby) {
            *slot = Feature {
                kind,
                dx: (pos.x - origin.x).clamp(-128, 127) as i8,
                dy: (pos.y - origin.y).clamp(-128, 127) as i8,
            };
        }

        let mut walkable = 0u8;
        let mut adjacent_actors = 0u8;
        for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
            let pos = origin.offset(*dx, *dy);
            if segment.terrain.get(pos).is_some_and(Tile::is_walkable) {
                walkable |= 1 << bit;
            }
            if segment.occupant(pos).is_some() {
                adjacent_actors += 1;
            }
        }

        Some(Self {
            turn: state.turn,
            segment: segment.number.0,
            x: origin.x,
            y: origin.y,
            hp: state.avatar.vitals.hp,
            hp_max: state.avatar.vitals.hp_max,
            features,
            walkable,
            adjacent_actors,
        })
    }

    fn to_words(self) -> [u64; WORDS] {
        [
            self.turn,
            u64::from(self.segment)
                | u64::from(self.x as u16) << 16
                | u64::from(self.y as u16) << 32
                | u64::from(self.walkable) << 48
                | u64::from(self.adjacent_actors) << 56,
            u64::from(self.hp as u32) | u64::from(self.hp_max as u32) << 32,
            self.features[0].pack() | self.features[1].pack() << 24,
            self.features[2].pack() | self.features[3].pack() << 24,
        ]
    }

    fn from_words(words: [u64; WORDS]) -> Self {
        Self {
            turn: words[0],
            segment: words[1] as u16,
            x: (words[1] >> 16) as u16 as i16,
            y: (words[1] >> 32) as u16 as i16,
            walkable: (words[1] >> 48) as u8,
            adjacent_actors: (words[1] >> 56) as u8,
            hp: words[2] as u32 as i32,
            hp_max: (words[2] >> 32) as u32 as i32,
            features: [
                Feature::unpack(words[3]),
                Feature::unpack(words[3] >> 24),
                Feature::unpack(words[4]),
                Feature::unpack(words[4] >> 24),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// SnapshotPublisher
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    /// Odd while a write is in progress.
    seq: AtomicU64,
    words: [AtomicU64; WORDS],
}

impl Slot {
    /// Single writer only.
    fn store(&self, words: [u64; WORDS]) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (cell, word) in self.words.iter().zip(words) {
            cell.store(word, Ordering::Relaxed);
        }
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// A consistent copy, or `None` if a write overlapped.
    fn load(&self) -> Option<[u64; WORDS]> {
        let before = self.seq.load(Ordering::Acquire);
        if before % 2 == 1 {
            return None;
        }
        let mut words = [0u64; WORDS];
        for (word, cell) in words.iter_mut().zip(&self.words) {
            *word = cell.load(Ordering::Relaxed);
        }
        fence(Ordering::Acquire);
        (self.seq.load(Ordering::Relaxed) == before).then_some(words)
    }
}

/// Double-buffered publisher. Share it with readers through an `Arc`.
#[derive(Debug)]
pub struct SnapshotPublisher {
    slots: [Slot; 2],
    /// Index of the slot readers should use.
    current: AtomicUsize,
    /// Turn of the last publish; meaningful once `published` is set.
    last_turn: AtomicU64,
    published: AtomicBool,
    suspended: AtomicBool,
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let publisher = Self {
            slots: [Slot::default(), Slot::default()],
            current: AtomicUsize::new(0),
            last_turn: AtomicU64::new(0),
            published: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
        };
        publisher.slots[0].store(LiveSnapshot::EMPTY.to_words());
        publisher
    }

    /// Publish `state` if it has not been published for this turn yet.
    ///
    /// Simulation thread only. Returns whether a new snapshot went out; a
    /// repeat for the same turn, an unplaced avatar or a suspended publisher
    /// are all silent no-ops.
    pub fn publish(&self, state: &WorldState) -> bool {
        if self.suspended.load(Ordering::Relaxed) {
            return false;
        }
        if self.published.load(Ordering::Relaxed)
            && self.last_turn.load(Ordering::Relaxed) == state.turn
        {
            return false;
        }
        let Some(snapshot) = LiveSnapshot::capture(state) else {
            return false;
        };
        let inactive = 1 - self.current.load(Ordering::Relaxed);
        self.slots[inactive].store(snapshot.to_words());
        self.current.store(inactive, Ordering::Release);
        self.last_turn.store(state.turn, Ordering::Relaxed);
        self.published.store(true, Ordering::Relaxed);
        tracing::trace!(turn = state.turn, slot = inactive, "published snapshot");
        true
    }

    /// The latest complete snapshot. Any thread, never blocks.
    pub fn read(&self) -> LiveSnapshot {
        loop {
            let index = self.current.load(Ordering::Acquire);
            if let Some(words) = self.slots[index].load() {
                return LiveSnapshot::from_words(words);
            }
            std::hint::spin_loop();
        }
    }

    /// Stop publishing until [`resume`](Self::resume). Readers keep seeing
    /// the last snapshot.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Relaxed);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    /// Go back to [`LiveSnapshot::EMPTY`], as after a reset.
    pub fn clear(&self) {
        let inactive = 1 - self.current.load(Ordering::Relaxed);
        self.slots[inactive].store(LiveSnapshot::EMPTY.to_words());
        self.current.store(inactive, Ordering::Release);
        self.published.store(false, Ordering::Relaxed);
        self.suspended.store(false, Ordering::Relaxed);
    }
}
