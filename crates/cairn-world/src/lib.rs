//! Cairn World -- the in-memory model of a segmented roguelike world.
//!
//! The world is partitioned into numbered [`Segment`](segment::Segment)s
//! (dungeon levels). Exactly one is active and fully resident in the
//! [`WorldState`](state::WorldState); the others are at rest in storage owned
//! by `cairn-persist`, or have not been generated yet. Every entity carries a
//! stable [`Identity`](identity::Identity) and every cross-reference goes
//! through one, so segments can be unloaded and reloaded without leaving
//! dangling references behind.
//!
//! # Quick Start
//!
//! ```
//! use cairn_world::prelude::*;
//!
//! let mut registry = IdentityRegistry::new();
//! let generator = SegmentGenerator::new(7, 20, 12);
//! let first = generator.generate(SegmentNumber::FIRST, &mut registry).unwrap();
//!
//! let avatar = Avatar::new(registry.allocate(), "wanderer");
//! let mut world = WorldState::new(7, avatar, first);
//! world.register_avatar(&mut registry).unwrap();
//!
//! let sword = world.give_avatar(&mut registry, 12, 1).unwrap();
//! world
//!     .schedule(&registry, TimerScope::Global, 10, sword, 1, Vec::new())
//!     .unwrap();
//! assert_eq!(world.timers.len(), 1);
//! ```

#![deny(unsafe_code)]

pub mod command;
pub mod entity;
pub mod generate;
pub mod identity;
pub mod segment;
pub mod state;
pub mod terrain;
pub mod timer;
pub mod vision;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by world-model operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// An identity was registered twice with different kind or residence.
    #[error("identity {identity} already registered as {existing:?}, refusing {incoming:?}")]
    IdentityConflict {
        identity: identity::Identity,
        existing: identity::EntityRecord,
        incoming: identity::EntityRecord,
    },

    /// No identity can be allocated above this one.
    #[error("identity {identity} leaves no room for allocation")]
    IdentityExhausted { identity: identity::Identity },

    /// The identity is not in the registry.
    #[error("identity {identity} is not registered")]
    UnknownIdentity { identity: identity::Identity },

    /// The avatar does not carry the item.
    #[error("avatar is not carrying {identity}")]
    NotCarried { identity: identity::Identity },

    /// Stored timer events are out of order or reuse a sequence number.
    #[error("timer events are not ordered by (fire turn, sequence)")]
    TimerOrder,

    /// A timer payload exceeded [`timer::MAX_TIMER_PAYLOAD`].
    #[error("timer payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// A position lies outside the segment's terrain grid.
    #[error("position {position:?} is outside the segment")]
    OutOfBounds { position: entity::Position },

    /// Another actor already stands on the tile.
    #[error("tile {position:?} is already occupied by {occupant}")]
    Occupied {
        position: entity::Position,
        occupant: identity::Identity,
    },

    /// A local timer targeted something that does not live on the active
    /// segment.
    #[error("{identity} does not live on the active segment")]
    NotOnActiveSegment { identity: identity::Identity },

    /// The avatar cannot be destroyed.
    #[error("the avatar cannot be destroyed")]
    AvatarIsPermanent,

    /// The entity is not in memory (not carried, not on the active segment).
    #[error("{identity} is not resident")]
    NotResident { identity: identity::Identity },

    /// The operation needs the avatar to stand on the active segment.
    #[error("the avatar has not been placed on the active segment")]
    AvatarNotPlaced,

    /// The command queue is at capacity.
    #[error("command queue is full")]
    QueueFull,

    /// The simulation side of the command queue is gone.
    #[error("command queue is closed")]
    QueueClosed,
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::command::{CommandQueue, CommandSender, CommandToken};
    pub use crate::entity::{walk_items, Actor, Avatar, EquipSlot, Item, Position, Vitals};
    pub use crate::generate::SegmentGenerator;
    pub use crate::identity::{EntityKind, EntityRecord, Identity, IdentityRegistry, Link, Residence};
    pub use crate::segment::{Segment, SegmentNumber, Stairway};
    pub use crate::state::{Projectile, TransientStash, WorldState};
    pub use crate::terrain::{TerrainGrid, Tile};
    pub use crate::timer::{TimerEvent, TimerQueue, TimerScope, MAX_TIMER_PAYLOAD};
    pub use crate::WorldError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
