#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Authoritative world state for the Atlas map server.
//!
//! The world owns every loaded map (tile table plus bucket grid), every
//! registered entity and the deferred release arena. Game logic mutates it
//! through the methods on [`World`] and discovers entities through the
//! operators in [`query`].

mod arena;
mod cells;
mod entities;
mod grid;
mod instances;
pub mod query;
mod walls;

use std::collections::HashMap;

use atlas_core::{
    CellFlag, EntityId, EntityKind, FreeOutcome, KindMask, MapFlag, MapFlags, MapGeometry, MapId,
    SavePoint, TileCoord, TriggerSpan, WorldConfig, WorldError,
};

pub use arena::DeferredRelease;
pub use entities::Entity;

use cells::CellTable;
use entities::EntityStore;
use grid::{BlockGrid, TileRect};
use instances::InstanceRecord;
use query::CandidateBuffer;
use walls::WallRegistry;

/// Represents the authoritative world state.
#[derive(Debug)]
pub struct World {
    config: WorldConfig,
    maps: Vec<MapSlot>,
    names: HashMap<String, MapId>,
    entities: EntityStore,
    arena: DeferredRelease<EntityId>,
    candidates: CandidateBuffer,
    walls: WallRegistry,
    leaked: Vec<EntityId>,
}

#[derive(Debug)]
enum MapSlot {
    Loaded(Box<MapData>),
    Released,
}

/// Everything the world tracks for one map.
#[derive(Debug)]
pub(crate) struct MapData {
    pub(crate) name: String,
    pub(crate) cells: CellTable,
    pub(crate) grid: BlockGrid,
    pub(crate) flags: MapFlags,
    pub(crate) save_point: Option<SavePoint>,
    pub(crate) users: u32,
    pub(crate) instance: Option<InstanceRecord>,
}

impl MapData {
    fn from_geometry(geometry: MapGeometry) -> Self {
        let (name, width, height, cells) = geometry.into_parts();
        Self {
            name,
            cells: CellTable::new(width, height, cells),
            grid: BlockGrid::new(width, height),
            flags: MapFlags::default(),
            save_point: None,
            users: 0,
            instance: None,
        }
    }

    fn contains(&self, tile: TileCoord) -> bool {
        self.cells.contains(i32::from(tile.x()), i32::from(tile.y()))
    }

    fn note_arrival(&mut self, entity: &Entity, stack_tracking: bool) {
        if stack_tracking && entity.kind().is_character() {
            if let Some(cell) = self.cells.tile_mut(entity.tile()) {
                cell.enter();
            }
        }
        if entity.kind() == EntityKind::Player {
            self.users = self.users.saturating_add(1);
        }
        if let Some(span) = entity.trigger() {
            self.stamp_trigger(entity.tile(), span, true);
        }
    }

    fn stamp_trigger(&mut self, center: TileCoord, span: TriggerSpan, value: bool) {
        let rect = TileRect::spanning(
            i32::from(center.x()) - i32::from(span.half_width()),
            i32::from(center.y()) - i32::from(span.half_height()),
            i32::from(center.x()) + i32::from(span.half_width()),
            i32::from(center.y()) + i32::from(span.half_height()),
        );
        let Some(rect) = rect.clamped(self.cells.width(), self.cells.height()) else {
            return;
        };
        for y in rect.y0..=rect.y1 {
            for x in rect.x0..=rect.x1 {
                if let Some(cell) = self.cells.get_mut(x, y) {
                    cell.set(CellFlag::Npc, value);
                }
            }
        }
    }

    /// Clears the trigger area of `id` and re-stamps every other NPC whose
    /// area could overlap it.
    fn clear_trigger(
        &mut self,
        entities: &EntityStore,
        id: EntityId,
        center: TileCoord,
        span: TriggerSpan,
    ) {
        self.stamp_trigger(center, span, false);

        let reach = 2 * i32::from(TriggerSpan::MAX_HALF_EXTENT);
        let mut neighbours = Vec::new();
        let _ = self.grid.walk(
            entities,
            TileRect::around(center, reach),
            KindMask::NPC,
            |entity| {
                if entity.id() != id {
                    if let Some(other) = entity.trigger() {
                        neighbours.push((entity.tile(), other));
                    }
                }
                true
            },
        );
        for (tile, other) in neighbours {
            self.stamp_trigger(tile, other, true);
        }
    }
}

/// Outcome of loading a batch of maps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    loaded: Vec<MapId>,
    dropped: Vec<String>,
}

impl LoadReport {
    /// Maps that were installed, in request order.
    #[must_use]
    pub fn loaded(&self) -> &[MapId] {
        &self.loaded
    }

    /// Names of maps that were missing, corrupt or rejected.
    #[must_use]
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }
}

/// Outcome of a periodic maintenance sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Maintenance {
    /// A deferred release lock that was never released has been reset.
    pub recovered_lock: bool,
    /// Entities whose release overflowed the deferred queue and were
    /// released by this sweep.
    pub reclaimed: usize,
}

impl World {
    /// Creates an empty world with the provided configuration.
    #[must_use]
    pub fn new(config: WorldConfig) -> Self {
        Self {
            maps: Vec::new(),
            names: HashMap::new(),
            entities: EntityStore::default(),
            arena: DeferredRelease::new(config.deferred_capacity),
            candidates: CandidateBuffer::new(config.candidate_capacity),
            walls: WallRegistry::default(),
            leaked: Vec::new(),
            config,
        }
    }

    fn stack_tracking(&self) -> bool {
        self.config.stack_limit.is_some()
    }

    /// Installs a map built from cached geometry.
    pub fn add_map(&mut self, geometry: MapGeometry) -> Result<MapId, WorldError> {
        if self.names.contains_key(geometry.name()) {
            return Err(WorldError::DuplicateMap(geometry.name().to_owned()));
        }
        let tiles = geometry.cells().len();
        if tiles > self.config.max_map_tiles {
            return Err(WorldError::OversizedMap {
                name: geometry.name().to_owned(),
                tiles,
            });
        }

        let id = self.allocate_slot()?;
        let data = MapData::from_geometry(geometry);
        log::debug!(
            "installed map '{}' ({}x{}) in slot {}",
            data.name,
            data.cells.width(),
            data.cells.height(),
            id.get()
        );
        self.install(id, data);
        Ok(id)
    }

    /// Loads every named map from `source`, which is expected to search the
    /// configured world caches in order.
    ///
    /// Missing or rejected maps are logged and reported as dropped; loading
    /// continues with the next name.
    pub fn load_maps<S, F>(&mut self, names: &[S], mut source: F) -> LoadReport
    where
        S: AsRef<str>,
        F: FnMut(&str) -> Option<MapGeometry>,
    {
        let mut report = LoadReport::default();
        for name in names {
            let name = name.as_ref();
            let Some(geometry) = source(name) else {
                log::warn!(
                    "map '{name}' was not found in any world cache, removing it from the map list"
                );
                report.dropped.push(name.to_owned());
                continue;
            };
            match self.add_map(geometry) {
                Ok(id) => report.loaded.push(id),
                Err(error) => {
                    log::warn!("map '{name}' was rejected: {error}");
                    report.dropped.push(name.to_owned());
                }
            }
        }
        log::info!(
            "loaded {} maps, dropped {}",
            report.loaded.len(),
            report.dropped.len()
        );
        report
    }

    fn allocate_slot(&mut self) -> Result<MapId, WorldError> {
        let index = match self
            .maps
            .iter()
            .position(|slot| matches!(slot, MapSlot::Released))
        {
            Some(index) => index,
            None if self.maps.len() < self.config.max_map_slots => self.maps.len(),
            None => {
                log::warn!("all {} map slots are in use", self.config.max_map_slots);
                return Err(WorldError::SlotsExhausted {
                    capacity: self.config.max_map_slots,
                });
            }
        };
        u16::try_from(index)
            .map(MapId::new)
            .map_err(|_| WorldError::SlotsExhausted {
                capacity: self.config.max_map_slots,
            })
    }

    fn install(&mut self, id: MapId, data: MapData) {
        let _ = self.names.insert(data.name.clone(), id);
        let slot = MapSlot::Loaded(Box::new(data));
        if id.index() == self.maps.len() {
            self.maps.push(slot);
        } else if let Some(existing) = self.maps.get_mut(id.index()) {
            *existing = slot;
        }
    }

    /// Registers an entity with the world without placing it.
    pub fn spawn(&mut self, entity: Entity) -> Result<(), WorldError> {
        let id = entity.id();
        if !self.entities.insert(entity) {
            return Err(WorldError::DuplicateEntity(id));
        }
        Ok(())
    }

    /// Links a registered entity into the grid of `map` at `tile`.
    ///
    /// Nothing is mutated when the entity is already placed, the map is not
    /// loaded or the tile lies outside it.
    pub fn place(&mut self, id: EntityId, map: MapId, tile: TileCoord) -> Result<(), WorldError> {
        let entity = self
            .entities
            .get(id)
            .ok_or(WorldError::UnknownEntity(id))?;
        if entity.is_placed() {
            log::warn!("{id:?} is already placed on map {:?}", entity.map());
            return Err(WorldError::AlreadyPlaced(id));
        }
        let data = loaded(&self.maps, map)?;
        if !data.contains(tile) {
            log::warn!(
                "refusing to place {id:?} at ({}, {}) outside map '{}'",
                tile.x(),
                tile.y(),
                data.name
            );
            return Err(WorldError::OutOfBounds {
                map,
                x: i32::from(tile.x()),
                y: i32::from(tile.y()),
            });
        }

        if let Some(entity) = self.entities.get_mut(id) {
            entity.set_position(map, tile);
        }
        let tracking = self.stack_tracking();
        if attach(&mut self.maps, &mut self.entities, tracking, id) {
            Ok(())
        } else {
            Err(WorldError::UnknownEntity(id))
        }
    }

    /// Unlinks an entity from its grid.
    ///
    /// Returns `Ok(false)` without touching anything when the entity is not
    /// placed, so redundant calls are harmless.
    pub fn remove(&mut self, id: EntityId) -> Result<bool, WorldError> {
        let entity = self
            .entities
            .get(id)
            .ok_or(WorldError::UnknownEntity(id))?;
        if !entity.is_placed() {
            log::debug!("{id:?} is not placed, ignoring removal");
            return Ok(false);
        }
        let tracking = self.stack_tracking();
        Ok(detach(&mut self.maps, &mut self.entities, tracking, id))
    }

    /// Moves an entity to another tile of its current map.
    ///
    /// Moves inside one bucket only rewrite the coordinates. An entity that
    /// is not placed simply records the new tile.
    pub fn move_entity(&mut self, id: EntityId, tile: TileCoord) -> Result<(), WorldError> {
        let entity = self
            .entities
            .get(id)
            .ok_or(WorldError::UnknownEntity(id))?;
        if !entity.is_placed() {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.set_tile(tile);
            }
            return Ok(());
        }

        let (map, from, kind, trigger) = (
            entity.map(),
            entity.tile(),
            entity.kind(),
            entity.trigger(),
        );
        let tracking = self.stack_tracking() && kind.is_character();
        let data = loaded_mut(&mut self.maps, map)?;
        if !data.contains(tile) {
            return Err(WorldError::OutOfBounds {
                map,
                x: i32::from(tile.x()),
                y: i32::from(tile.y()),
            });
        }
        if from == tile {
            return Ok(());
        }

        if let Some(span) = trigger {
            data.clear_trigger(&self.entities, id, from, span);
        }
        if tracking {
            if let Some(cell) = data.cells.tile_mut(from) {
                cell.leave();
            }
        }

        if from.shares_block(tile) {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.set_tile(tile);
            }
        } else {
            let _ = data.grid.unlink(&mut self.entities, id);
            if let Some(entity) = self.entities.get_mut(id) {
                entity.set_tile(tile);
            }
            let _ = data.grid.link(&mut self.entities, id);
        }

        if tracking {
            if let Some(cell) = data.cells.tile_mut(tile) {
                cell.enter();
            }
        }
        if let Some(span) = trigger {
            data.stamp_trigger(tile, span, true);
        }
        Ok(())
    }

    /// Requests the release of an entity, unlinking it first if needed.
    ///
    /// Inside a query the release is deferred until the outermost query
    /// finishes. When the deferred queue is full the entity stays registered
    /// and is released by the next [`World::maintain`] sweep.
    pub fn request_free(&mut self, id: EntityId) -> Result<FreeOutcome, WorldError> {
        if self.entities.get(id).is_none() {
            return Err(WorldError::UnknownEntity(id));
        }
        let tracking = self.stack_tracking();
        let _ = detach(&mut self.maps, &mut self.entities, tracking, id);

        let maps = &mut self.maps;
        let entities = &mut self.entities;
        let outcome = self
            .arena
            .request_free(id, |id| release(maps, entities, tracking, id));
        if outcome == FreeOutcome::Leaked
            && !self.arena.is_pending(&id)
            && !self.leaked.contains(&id)
        {
            self.leaked.push(id);
        }
        Ok(outcome)
    }

    /// Enters a region in which releases are deferred. Returns the new depth.
    pub fn lock_releases(&mut self) -> usize {
        self.arena.lock()
    }

    /// Leaves a deferred region, releasing queued entities when the
    /// outermost region ends. Returns the new depth.
    pub fn unlock_releases(&mut self) -> usize {
        let tracking = self.stack_tracking();
        let maps = &mut self.maps;
        let entities = &mut self.entities;
        self.arena.unlock(|id| release(maps, entities, tracking, id))
    }

    /// Periodic sweep run between ticks: resets a leaked release lock and
    /// releases entities whose deferred release overflowed.
    pub fn maintain(&mut self) -> Maintenance {
        let tracking = self.stack_tracking();
        let maps = &mut self.maps;
        let entities = &mut self.entities;
        let recovered_lock = self
            .arena
            .recover_stale_lock(|id| release(maps, entities, tracking, id));

        let mut reclaimed = 0;
        for id in std::mem::take(&mut self.leaked) {
            if self.entities.get(id).is_some() {
                release(&mut self.maps, &mut self.entities, tracking, id);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            log::info!("released {reclaimed} entities that overflowed the deferred queue");
        }
        Maintenance {
            recovered_lock,
            reclaimed,
        }
    }

    /// Sets or clears a tile flag. Occupancy is never affected.
    pub fn set_cell(
        &mut self,
        map: MapId,
        tile: TileCoord,
        flag: CellFlag,
        value: bool,
    ) -> Result<(), WorldError> {
        let data = loaded_mut(&mut self.maps, map)?;
        let cell = data
            .cells
            .tile_mut(tile)
            .ok_or(WorldError::OutOfBounds {
                map,
                x: i32::from(tile.x()),
                y: i32::from(tile.y()),
            })?;
        cell.set(flag, value);
        Ok(())
    }

    /// Replaces the geometry of a tile with a terrain preset, keeping zone
    /// flags and occupancy. Returns `Ok(false)` for unknown terrain types.
    pub fn set_cell_terrain(
        &mut self,
        map: MapId,
        tile: TileCoord,
        terrain: u8,
    ) -> Result<bool, WorldError> {
        let data = loaded_mut(&mut self.maps, map)?;
        let cell = data
            .cells
            .tile_mut(tile)
            .ok_or(WorldError::OutOfBounds {
                map,
                x: i32::from(tile.x()),
                y: i32::from(tile.y()),
            })?;
        Ok(cell.apply_terrain(terrain))
    }

    /// Activates or deactivates a zone flag on a map.
    pub fn set_map_flag(
        &mut self,
        map: MapId,
        flag: MapFlag,
        active: bool,
    ) -> Result<(), WorldError> {
        loaded_mut(&mut self.maps, map)?.flags.set(flag, active);
        Ok(())
    }

    /// Replaces the save point of a map.
    pub fn set_save_point(
        &mut self,
        map: MapId,
        save_point: Option<SavePoint>,
    ) -> Result<(), WorldError> {
        loaded_mut(&mut self.maps, map)?.save_point = save_point;
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new(WorldConfig::default())
    }
}

fn loaded(maps: &[MapSlot], map: MapId) -> Result<&MapData, WorldError> {
    match maps.get(map.index()) {
        Some(MapSlot::Loaded(data)) => Ok(&**data),
        Some(MapSlot::Released) => Err(WorldError::MapReleased(map)),
        None => Err(WorldError::UnknownMap(map)),
    }
}

fn loaded_mut(maps: &mut [MapSlot], map: MapId) -> Result<&mut MapData, WorldError> {
    match maps.get_mut(map.index()) {
        Some(MapSlot::Loaded(data)) => Ok(&mut **data),
        Some(MapSlot::Released) => Err(WorldError::MapReleased(map)),
        None => Err(WorldError::UnknownMap(map)),
    }
}

/// Links an entity whose position was already validated and updates the
/// tile bookkeeping of its map.
fn attach(
    maps: &mut [MapSlot],
    entities: &mut EntityStore,
    stack_tracking: bool,
    id: EntityId,
) -> bool {
    let Some(map) = entities.get(id).map(Entity::map) else {
        return false;
    };
    let Ok(data) = loaded_mut(maps, map) else {
        return false;
    };
    if !data.grid.link(entities, id) {
        return false;
    }
    if let Some(entity) = entities.get(id) {
        data.note_arrival(entity, stack_tracking);
    }
    true
}

/// Unlinks an entity and reverts the tile bookkeeping of its map.
fn detach(
    maps: &mut [MapSlot],
    entities: &mut EntityStore,
    stack_tracking: bool,
    id: EntityId,
) -> bool {
    let Some(entity) = entities.get(id).filter(|entity| entity.is_placed()) else {
        return false;
    };
    let (map, tile, kind, trigger) = (entity.map(), entity.tile(), entity.kind(), entity.trigger());
    let Ok(data) = loaded_mut(maps, map) else {
        log::error!("{id:?} is linked into map {map:?} which is no longer loaded");
        return false;
    };
    if !data.grid.unlink(entities, id) {
        return false;
    }

    if stack_tracking && kind.is_character() {
        if let Some(cell) = data.cells.tile_mut(tile) {
            cell.leave();
        }
    }
    if kind == EntityKind::Player {
        data.users = data.users.saturating_sub(1);
    }
    if let Some(span) = trigger {
        data.clear_trigger(entities, id, tile, span);
    }
    true
}

/// Drops an entity record for good.
fn release(maps: &mut [MapSlot], entities: &mut EntityStore, stack_tracking: bool, id: EntityId) {
    if entities.get(id).is_some_and(Entity::is_placed) {
        log::warn!("{id:?} was placed again after its release was requested");
        let _ = detach(maps, entities, stack_tracking, id);
    }
    if entities.take(id).is_none() {
        log::debug!("{id:?} was already released");
    }
}
