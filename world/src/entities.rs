//! Entity records and the store that owns them.

use std::collections::HashMap;

use atlas_core::{EntityId, EntityKind, MapId, TileCoord, TriggerSpan};

/// Placeable object tracked by the world.
///
/// Game logic builds the entity with its intended position and registers it
/// through [`crate::World::spawn`]. Once registered the world owns the record
/// until the entity is released through the deferred release arena.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    id: EntityId,
    kind: EntityKind,
    map: MapId,
    tile: TileCoord,
    trigger: Option<TriggerSpan>,
    pub(crate) link: Option<ChainLink>,
}

impl Entity {
    /// Creates an unlinked entity positioned at the provided tile.
    #[must_use]
    pub const fn new(id: EntityId, kind: EntityKind, map: MapId, tile: TileCoord) -> Self {
        Self {
            id,
            kind,
            map,
            tile,
            trigger: None,
            link: None,
        }
    }

    /// Attaches an NPC trigger area that marks surrounding tiles while the
    /// entity is placed. Ignored for every kind except [`EntityKind::Npc`].
    #[must_use]
    pub fn with_trigger(mut self, span: TriggerSpan) -> Self {
        if self.kind == EntityKind::Npc {
            self.trigger = Some(span);
        }
        self
    }

    /// Identifier of the entity.
    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.id
    }

    /// Category of the entity.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Map the entity is, or was last, positioned on.
    #[must_use]
    pub const fn map(&self) -> MapId {
        self.map
    }

    /// Tile the entity is, or was last, positioned on.
    #[must_use]
    pub const fn tile(&self) -> TileCoord {
        self.tile
    }

    /// Trigger area of an NPC.
    #[must_use]
    pub const fn trigger(&self) -> Option<TriggerSpan> {
        self.trigger
    }

    /// Reports whether the entity is linked into a bucket chain.
    #[must_use]
    pub const fn is_placed(&self) -> bool {
        self.link.is_some()
    }

    pub(crate) fn set_position(&mut self, map: MapId, tile: TileCoord) {
        self.map = map;
        self.tile = tile;
    }

    pub(crate) fn set_tile(&mut self, tile: TileCoord) {
        self.tile = tile;
    }
}

/// Predecessor of an entity inside its bucket chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChainPrev {
    /// The entity is the head of its bucket chain.
    Head,
    /// The entity follows another entity.
    Entity(EntityId),
}

/// Position of an entity inside its bucket chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChainLink {
    pub(crate) prev: ChainPrev,
    pub(crate) next: Option<EntityId>,
}

/// Registry of every entity the world currently holds.
#[derive(Debug, Default)]
pub(crate) struct EntityStore {
    entries: HashMap<EntityId, Entity>,
}

impl EntityStore {
    pub(crate) fn insert(&mut self, entity: Entity) -> bool {
        if self.entries.contains_key(&entity.id) {
            return false;
        }
        let _ = self.entries.insert(entity.id, entity);
        true
    }

    pub(crate) fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn take(&mut self, id: EntityId) -> Option<Entity> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn set_next(&mut self, id: EntityId, next: Option<EntityId>) {
        if let Some(link) = self.get_mut(id).and_then(|entity| entity.link.as_mut()) {
            link.next = next;
        }
    }

    pub(crate) fn set_prev(&mut self, id: EntityId, prev: ChainPrev) {
        if let Some(link) = self.get_mut(id).and_then(|entity| entity.link.as_mut()) {
            link.prev = prev;
        }
    }
}
