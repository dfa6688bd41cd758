//! Actors, items and the avatar.
//!
//! Ownership is strictly tree-shaped: a segment owns its actors and floor
//! items, an actor owns its inventory, a container item owns its contents.
//! Anything that points *across* that tree (an actor's owner, a worn-item
//! slot, a timer target) holds an [`Identity`] or a [`Link`], never a
//! reference.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::{Identity, Link};
use crate::WorldError;

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A tile coordinate. Ordering is row-major: `y` first, then `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i16,
    pub y: i16,
}

impl Position {
    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }

    /// The position shifted by `(dx, dy)`, saturating at the `i16` range.
    pub fn offset(self, dx: i16, dy: i16) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
        }
    }

    /// Chebyshev (king-move) distance.
    pub fn distance(self, other: Position) -> u16 {
        let dx = (i32::from(self.x) - i32::from(other.x)).unsigned_abs();
        let dy = (i32::from(self.y) - i32::from(other.y)).unsigned_abs();
        dx.max(dy) as u16
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.y, self.x).cmp(&(other.y, other.x))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Vitals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vitals {
    pub hp: i32,
    pub hp_max: i32,
}

impl Vitals {
    pub const fn full(hp_max: i32) -> Self {
        Self { hp: hp_max, hp_max }
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// An object. Containers hold their contents directly, nested arbitrarily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Identity,
    /// Object type code. Meaning belongs to the game rules.
    pub kind: u16,
    pub quantity: u32,
    pub contents: Vec<Item>,
}

impl Item {
    pub fn new(id: Identity, kind: u16, quantity: u32) -> Self {
        Self {
            id,
            kind,
            quantity,
            contents: Vec::new(),
        }
    }

    /// Builder-style helper for containers.
    pub fn with_contents(mut self, contents: Vec<Item>) -> Self {
        self.contents = contents;
        self
    }

    /// Visit this item and everything nested inside it, depth-first,
    /// parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Item)) {
        visit(self);
        for inner in &self.contents {
            inner.walk(visit);
        }
    }

    /// Number of items in this subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.contents.iter().map(Item::count).sum::<usize>()
    }
}

/// Visit every item in a list of item trees, in list order.
pub fn walk_items<'a>(items: &'a [Item], visit: &mut impl FnMut(&'a Item)) {
    for item in items {
        item.walk(visit);
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// A non-avatar creature living on a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Identity,
    /// Species code. Meaning belongs to the game rules.
    pub species: u16,
    pub name: String,
    pub position: Position,
    pub vitals: Vitals,
    pub inventory: Vec<Item>,
    /// Who this actor answers to (a pet's master, a summoner). May live on a
    /// different segment, or may have been destroyed.
    pub owner: Option<Link>,
}

impl Actor {
    pub fn new(id: Identity, species: u16, name: impl Into<String>, position: Position) -> Self {
        Self {
            id,
            species,
            name: name.into(),
            position,
            vitals: Vitals::full(10),
            inventory: Vec::new(),
            owner: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Avatar
// ---------------------------------------------------------------------------

/// Equipment slots on the avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EquipSlot {
    Weapon,
    Body,
    Head,
    Hands,
    Feet,
    Ring,
}

impl EquipSlot {
    pub const ALL: [EquipSlot; 6] = [
        EquipSlot::Weapon,
        EquipSlot::Body,
        EquipSlot::Head,
        EquipSlot::Hands,
        EquipSlot::Feet,
        EquipSlot::Ring,
    ];

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

/// The player-controlled entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avatar {
    pub id: Identity,
    pub name: String,
    /// `None` until the simulation has placed the avatar on the active
    /// segment.
    pub position: Option<Position>,
    pub vitals: Vitals,
    pub inventory: Vec<Item>,
    /// Worn-item backlinks. Every value names a top-level inventory item.
    pub equipment: BTreeMap<EquipSlot, Identity>,
}

impl Avatar {
    pub fn new(id: Identity, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            position: None,
            vitals: Vitals::full(16),
            inventory: Vec::new(),
            equipment: BTreeMap::new(),
        }
    }

    /// Put an inventory item into `slot`.
    pub fn wear(&mut self, slot: EquipSlot, item: Identity) -> Result<(), WorldError> {
        if !self.inventory.iter().any(|i| i.id == item) {
            return Err(WorldError::NotCarried { identity: item });
        }
        self.equipment.insert(slot, item);
        Ok(())
    }

    /// Remove an item from the top level of the inventory, clearing any slot
    /// it was worn in.
    pub fn take_item(&mut self, item: Identity) -> Option<Item> {
        let index = self.inventory.iter().position(|i| i.id == item)?;
        self.equipment.retain(|_, worn| *worn != item);
        Some(self.inventory.remove(index))
    }

    /// Every identity carried by the avatar, the avatar included, in
    /// traversal order.
    pub fn identities(&self) -> Vec<Identity> {
        let mut ids = vec![self.id];
        walk_items(&self.inventory, &mut |item| ids.push(item.id));
        ids
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
