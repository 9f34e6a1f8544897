//! Private duplicates of loaded maps.
//!
//! An instance owns a value copy of its source's tile table and a fresh,
//! empty bucket grid, so tile changes made inside it never reach the source
//! or sibling instances. Destroying an instance evicts every entity on it
//! and returns its slot to the pool used by [`World::add_map`] and
//! [`World::create_instance`].

use std::time::Duration;

use atlas_core::{
    EntityId, EntityKind, InstanceMode, InstanceView, KindMask, LeaseOwner, MapFlags, MapId,
    WorldError,
};

use crate::{grid::BlockGrid, loaded, MapData, MapSlot, World};

/// Synthetic names cycle through this many sequence numbers.
const NAME_SEQUENCE: u32 = 1_000;

/// Lease bookkeeping attached to an instance map.
#[derive(Clone, Debug)]
pub(crate) struct InstanceRecord {
    pub(crate) source: MapId,
    owner: LeaseOwner,
    mode: InstanceMode,
    created_at: Duration,
    idle_since: Option<Duration>,
}

impl World {
    /// Clones `source` into a new instance map leased to `owner`.
    ///
    /// The instance is named `NNN#source` where `NNN` is derived from the
    /// owner id; taken names are skipped. Zone flags and the save point are
    /// copied only when the mode asks for it.
    pub fn create_instance(
        &mut self,
        source: MapId,
        owner: LeaseOwner,
        mode: InstanceMode,
        now: Duration,
    ) -> Result<MapId, WorldError> {
        let origin = loaded(&self.maps, source)?;
        let name = (0..NAME_SEQUENCE)
            .map(|step| {
                let sequence = (owner.id() % NAME_SEQUENCE + step) % NAME_SEQUENCE;
                format!("{sequence:03}#{}", origin.name)
            })
            .find(|candidate| !self.names.contains_key(candidate))
            .ok_or_else(|| WorldError::InstanceNameExhausted(origin.name.clone()))?;

        let (flags, save_point) = if mode.copy_map_flags {
            (origin.flags.clone(), origin.save_point.clone())
        } else {
            (MapFlags::default(), None)
        };
        let data = MapData {
            name,
            cells: origin.cells.vacated(),
            grid: BlockGrid::new(origin.cells.width(), origin.cells.height()),
            flags,
            save_point,
            users: 0,
            instance: Some(InstanceRecord {
                source,
                owner,
                mode,
                created_at: now,
                idle_since: Some(now),
            }),
        };
        let source_name = origin.name.clone();

        let id = self.allocate_slot()?;
        log::info!(
            "created instance '{}' in slot {} from '{source_name}' for {:?} {}",
            data.name,
            id.get(),
            owner.kind(),
            owner.id()
        );
        self.install(id, data);
        Ok(id)
    }

    /// Tears an instance down.
    ///
    /// Every player on the map is handed to `relocate`, which is expected to
    /// send them to their save point; players still on the map afterwards
    /// are unlinked. Every other entity is removed and released. Walls
    /// raised inside the instance are forgotten and the slot is recycled.
    pub fn destroy_instance<F>(&mut self, map: MapId, mut relocate: F) -> Result<(), WorldError>
    where
        F: FnMut(&mut World, EntityId),
    {
        let data = loaded(&self.maps, map)?;
        if data.instance.is_none() {
            return Err(WorldError::NotAnInstance(map));
        }
        let name = data.name.clone();

        let _ = self.lock_releases();
        for id in self.residents(map, KindMask::PLAYER) {
            if self.is_resident(id, map) {
                relocate(self, id);
            }
        }

        // Relocation callbacks may place new entities here, so drain until
        // the grid is empty.
        let mut evicted = 0;
        loop {
            let residents = self.residents(map, KindMask::ALL);
            if residents.is_empty() {
                break;
            }
            for id in residents {
                let player = self
                    .entities
                    .get(id)
                    .is_some_and(|entity| entity.kind() == EntityKind::Player);
                let outcome = if player {
                    log::warn!("{id:?} was not relocated out of instance '{name}', unlinking it");
                    self.remove(id).map(|_| ())
                } else {
                    self.request_free(id).map(|_| ())
                };
                if let Err(error) = outcome {
                    log::error!("failed to evict {id:?} from instance '{name}': {error}");
                }
                evicted += 1;
            }
        }
        let _ = self.unlock_releases();

        let walls = self.walls.drop_map(map);
        let _ = self.names.remove(&name);
        if let Some(slot) = self.maps.get_mut(map.index()) {
            *slot = MapSlot::Released;
        }
        log::info!(
            "destroyed instance '{name}' ({evicted} entities evicted, {walls} walls dropped)"
        );
        Ok(())
    }

    /// Every entity linked into the grid of `map`, collected without going
    /// through the shared candidate buffer.
    fn residents(&self, map: MapId, mask: KindMask) -> Vec<EntityId> {
        let mut ids = Vec::new();
        let Ok(data) = loaded(&self.maps, map) else {
            return ids;
        };
        let _ = data
            .grid
            .walk(&self.entities, data.grid.whole_map(), mask, |entity| {
                ids.push(entity.id());
                true
            });
        ids
    }

    fn is_resident(&self, id: EntityId, map: MapId) -> bool {
        self.entities
            .get(id)
            .is_some_and(|entity| entity.is_placed() && entity.map() == map)
    }

    /// Snapshots the lease state of every live instance.
    ///
    /// The idle clock of an instance starts the first time a snapshot sees it
    /// empty and stops as soon as a player is inside.
    pub fn instance_views(&mut self, now: Duration) -> Vec<InstanceView> {
        let mut views = Vec::new();
        for (index, slot) in self.maps.iter_mut().enumerate() {
            let MapSlot::Loaded(data) = slot else {
                continue;
            };
            let users = data.users;
            let Some(record) = data.instance.as_mut() else {
                continue;
            };
            if users > 0 {
                record.idle_since = None;
            } else if record.idle_since.is_none() {
                record.idle_since = Some(now);
            }
            let Ok(map) = u16::try_from(index).map(MapId::new) else {
                continue;
            };
            views.push(InstanceView {
                map,
                source: record.source,
                owner: record.owner,
                created_at: record.created_at,
                idle_since: record.idle_since,
                users,
                keep_limit: record.mode.keep_limit,
                idle_limit: record.mode.idle_limit,
            });
        }
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query, Entity};
    use atlas_core::{
        CellCheck, CellFlag, MapFlag, MapGeometry, OwnerKind, SavePoint, TileCoord, WorldConfig,
    };

    fn world_with_source() -> (World, MapId) {
        let mut world = World::new(WorldConfig {
            stack_limit: Some(1),
            ..WorldConfig::default()
        });
        let map = world
            .add_map(MapGeometry::filled("guild_vs1", 20, 20, 0).expect("valid geometry"))
            .expect("map installs");
        (world, map)
    }

    fn party(id: u32) -> LeaseOwner {
        LeaseOwner::new(OwnerKind::Party, id)
    }

    #[test]
    fn instances_are_named_after_owner_and_source() {
        let (mut world, source) = world_with_source();
        let first = world
            .create_instance(source, party(7), InstanceMode::default(), Duration::ZERO)
            .expect("slot available");
        let second = world
            .create_instance(source, party(7), InstanceMode::default(), Duration::ZERO)
            .expect("slot available");

        assert_eq!(query::map_name(&world, first), Ok("007#guild_vs1"));
        assert_eq!(query::map_name(&world, second), Ok("008#guild_vs1"));
        assert_eq!(query::map_id(&world, "007#guild_vs1"), Some(first));
        assert_eq!(query::instance_source(&world, first), Ok(Some(source)));
        assert_eq!(query::instance_source(&world, source), Ok(None));
    }

    #[test]
    fn instance_cells_start_vacant() {
        let (mut world, source) = world_with_source();
        let player = EntityId::new(1);
        world
            .spawn(Entity::new(player, EntityKind::Player, source, TileCoord::new(2, 2)))
            .expect("fresh id");
        world.place(player, source, TileCoord::new(2, 2)).expect("inside map");

        let instance = world
            .create_instance(source, party(1), InstanceMode::default(), Duration::ZERO)
            .expect("slot available");
        let tile = TileCoord::new(2, 2);
        assert_eq!(query::cell_occupancy(&world, source, tile), Ok(1));
        assert_eq!(query::cell_occupancy(&world, instance, tile), Ok(0));
        assert_eq!(query::cell_check(&world, instance, tile, CellCheck::Stacked), Ok(false));
    }

    #[test]
    fn map_flags_are_copied_only_on_request() {
        let (mut world, source) = world_with_source();
        world.set_map_flag(source, MapFlag::NoTeleport, true).expect("loaded");
        world
            .set_save_point(source, Some(SavePoint::new("prontera", None)))
            .expect("loaded");

        let copied = world
            .create_instance(
                source,
                party(1),
                InstanceMode {
                    copy_map_flags: true,
                    ..InstanceMode::default()
                },
                Duration::ZERO,
            )
            .expect("slot available");
        let pristine = world
            .create_instance(source, party(2), InstanceMode::default(), Duration::ZERO)
            .expect("slot available");

        assert!(query::map_flags(&world, copied).expect("loaded").contains(MapFlag::NoTeleport));
        assert!(query::save_point(&world, copied).expect("loaded").is_some());
        assert!(!query::map_flags(&world, pristine).expect("loaded").contains(MapFlag::NoTeleport));
        assert!(query::save_point(&world, pristine).expect("loaded").is_none());
    }

    #[test]
    fn destroyed_slots_are_recycled() {
        let (mut world, source) = world_with_source();
        let instance = world
            .create_instance(source, party(3), InstanceMode::default(), Duration::ZERO)
            .expect("slot available");
        world.destroy_instance(instance, |_, _| {}).expect("is an instance");

        assert_eq!(query::map_name(&world, instance), Err(WorldError::MapReleased(instance)));
        assert_eq!(query::map_id(&world, "003#guild_vs1"), None);
        assert_eq!(
            world.destroy_instance(instance, |_, _| {}),
            Err(WorldError::MapReleased(instance))
        );

        let reused = world
            .create_instance(source, party(3), InstanceMode::default(), Duration::ZERO)
            .expect("slot available");
        assert_eq!(reused, instance);
    }

    #[test]
    fn regular_maps_cannot_be_destroyed() {
        let (mut world, source) = world_with_source();
        assert_eq!(
            world.destroy_instance(source, |_, _| {}),
            Err(WorldError::NotAnInstance(source))
        );
    }

    #[test]
    fn idle_clock_follows_player_presence() {
        let (mut world, source) = world_with_source();
        let instance = world
            .create_instance(source, party(1), InstanceMode::default(), Duration::from_secs(10))
            .expect("slot available");
        let player = EntityId::new(9);
        world
            .spawn(Entity::new(player, EntityKind::Player, instance, TileCoord::new(1, 1)))
            .expect("fresh id");
        world.place(player, instance, TileCoord::new(1, 1)).expect("inside map");

        let views = world.instance_views(Duration::from_secs(20));
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].users, 1);
        assert_eq!(views[0].idle_since, None);

        assert_eq!(world.remove(player), Ok(true));
        let views = world.instance_views(Duration::from_secs(30));
        assert_eq!(views[0].idle_since, Some(Duration::from_secs(30)));
        let views = world.instance_views(Duration::from_secs(40));
        assert_eq!(views[0].idle_since, Some(Duration::from_secs(30)));
    }

    #[test]
    fn tile_changes_stay_inside_the_instance() {
        let (mut world, source) = world_with_source();
        let instance = world
            .create_instance(source, party(1), InstanceMode::default(), Duration::ZERO)
            .expect("slot available");
        let tile = TileCoord::new(4, 4);
        world.set_cell(instance, tile, CellFlag::NoChat, true).expect("inside map");
        assert_eq!(query::cell_check(&world, instance, tile, CellCheck::NoChat), Ok(true));
        assert_eq!(query::cell_check(&world, source, tile, CellCheck::NoChat), Ok(false));
    }
}
