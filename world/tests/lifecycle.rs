use std::{collections::HashMap, ops::ControlFlow, time::Duration};

use atlas_core::{
    CellCheck, CellFlag, EntityId, EntityKind, FreeOutcome, InstanceMode, KindMask, LeaseOwner,
    MapGeometry, MapId, OwnerKind, TileCoord, WorldConfig, WorldError,
};
use atlas_world::{query, Entity, Maintenance, World};

fn field(config: WorldConfig, width: i16, height: i16) -> (World, MapId) {
    let mut world = World::new(config);
    let map = world
        .add_map(MapGeometry::filled("field01", width, height, 0).expect("valid geometry"))
        .expect("map installs");
    (world, map)
}

fn put(world: &mut World, id: u32, kind: EntityKind, map: MapId, x: i16, y: i16) -> EntityId {
    let id = EntityId::new(id);
    let tile = TileCoord::new(x, y);
    world
        .spawn(Entity::new(id, kind, map, tile))
        .expect("fresh identifier");
    world.place(id, map, tile).expect("tile inside map");
    id
}

fn in_cell(world: &mut World, map: MapId, tile: TileCoord) -> Vec<EntityId> {
    let mut seen = Vec::new();
    let _ = query::in_cell(world, map, tile, KindMask::ALL, |_, id| {
        seen.push(id);
        ControlFlow::Continue(())
    })
    .expect("map loaded");
    seen
}

/// Small deterministic generator for interleaving operations.
struct Sequence(u64);

impl Sequence {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0 % bound
    }
}

#[test]
fn occupancy_matches_placed_characters() {
    let config = WorldConfig {
        stack_limit: Some(2),
        ..WorldConfig::default()
    };
    let (mut world, map) = field(config, 10, 10);
    let kinds = [
        EntityKind::Player,
        EntityKind::Monster,
        EntityKind::Monster,
        EntityKind::Homunculus,
        EntityKind::Item,
        EntityKind::Npc,
    ];
    let mut ids = Vec::new();
    for (index, kind) in kinds.into_iter().enumerate() {
        let id = EntityId::new(u32::try_from(index).expect("small") + 1);
        world
            .spawn(Entity::new(id, kind, map, TileCoord::new(0, 0)))
            .expect("fresh identifier");
        ids.push((id, kind));
    }

    let mut positions: HashMap<EntityId, TileCoord> = HashMap::new();
    let mut sequence = Sequence(0x9e37_79b9_7f4a_7c15);
    for _ in 0..400 {
        let (id, _) = ids[usize::try_from(sequence.next(ids.len() as u64)).expect("small")];
        let tile = TileCoord::new(
            i16::try_from(sequence.next(10)).expect("small"),
            i16::try_from(sequence.next(10)).expect("small"),
        );
        match sequence.next(3) {
            0 => {
                if world.place(id, map, tile).is_ok() {
                    let _ = positions.insert(id, tile);
                }
            }
            1 => {
                world.move_entity(id, tile).expect("tile inside map");
                if let Some(position) = positions.get_mut(&id) {
                    *position = tile;
                }
            }
            _ => {
                let removed = world.remove(id).expect("registered");
                assert_eq!(removed, positions.remove(&id).is_some());
            }
        }

        for y in 0..10 {
            for x in 0..10 {
                let tile = TileCoord::new(x, y);
                let expected = ids
                    .iter()
                    .filter(|(id, kind)| kind.is_character() && positions.get(id) == Some(&tile))
                    .count();
                assert_eq!(
                    query::cell_occupancy(&world, map, tile),
                    Ok(u16::try_from(expected).expect("small")),
                    "occupancy of ({x}, {y})"
                );
                assert_eq!(
                    query::cell_check(&world, map, tile, CellCheck::Stacked),
                    Ok(expected >= 2)
                );
            }
        }
    }

    for (id, _) in &ids {
        let entity = query::entity(&world, *id).expect("registered");
        match positions.get(id) {
            Some(tile) => {
                assert!(entity.is_placed());
                assert_eq!(entity.tile(), *tile);
                assert!(in_cell(&mut world, map, *tile).contains(id));
            }
            None => assert!(!entity.is_placed()),
        }
    }
}

#[test]
fn entity_is_found_only_at_its_last_position() {
    let (mut world, map) = field(WorldConfig::default(), 32, 32);
    let id = put(&mut world, 1, EntityKind::Monster, map, 1, 1);

    world.move_entity(id, TileCoord::new(2, 1)).expect("same bucket");
    world.move_entity(id, TileCoord::new(20, 17)).expect("other bucket");
    assert!(in_cell(&mut world, map, TileCoord::new(1, 1)).is_empty());
    assert!(in_cell(&mut world, map, TileCoord::new(2, 1)).is_empty());
    assert_eq!(in_cell(&mut world, map, TileCoord::new(20, 17)), vec![id]);

    assert_eq!(
        world.move_entity(id, TileCoord::new(32, 0)),
        Err(WorldError::OutOfBounds { map, x: 32, y: 0 })
    );
    assert_eq!(in_cell(&mut world, map, TileCoord::new(20, 17)), vec![id]);

    assert_eq!(world.remove(id), Ok(true));
    assert!(in_cell(&mut world, map, TileCoord::new(20, 17)).is_empty());
}

#[test]
fn second_removal_is_a_no_op() {
    let config = WorldConfig {
        stack_limit: Some(1),
        ..WorldConfig::default()
    };
    let (mut world, map) = field(config, 8, 8);
    let id = put(&mut world, 1, EntityKind::Player, map, 3, 3);
    let tile = TileCoord::new(3, 3);

    assert_eq!(world.remove(id), Ok(true));
    let after_first = (
        query::users(&world, map),
        query::cell_occupancy(&world, map, tile),
        query::entity(&world, id).cloned(),
    );
    assert_eq!(world.remove(id), Ok(false));
    let after_second = (
        query::users(&world, map),
        query::cell_occupancy(&world, map, tile),
        query::entity(&world, id).cloned(),
    );
    assert_eq!(after_first, after_second);
    assert_eq!(after_second.0, Ok(0));
}

#[test]
fn visitor_may_free_the_entity_it_is_visiting() {
    let (mut world, map) = field(WorldConfig::default(), 16, 16);
    let centre = put(&mut world, 1, EntityKind::Player, map, 8, 8);
    let mut victims = Vec::new();
    for (offset, id) in (2..=6).enumerate() {
        let x = 6 + i16::try_from(offset).expect("small");
        victims.push(put(&mut world, id, EntityKind::Monster, map, x, 9));
    }

    let mut visited = Vec::new();
    let count = query::in_all_range(&mut world, centre, 3, KindMask::MONSTER, |world, id| {
        assert_eq!(world.remove(id), Ok(true));
        assert_eq!(world.request_free(id), Ok(FreeOutcome::Deferred));
        assert!(query::entity(world, id).is_some(), "release waits for the query");
        visited.push(id);
        ControlFlow::Continue(())
    })
    .expect("centre is placed");

    assert_eq!(count, victims.len());
    visited.sort_by_key(|id| id.get());
    assert_eq!(visited, victims);
    assert_eq!(query::entity_count(&world), 1);
    assert_eq!(query::pending_releases(&world), 0);
    assert!(victims.iter().all(|id| query::entity(&world, *id).is_none()));
}

#[test]
fn entities_removed_mid_pass_are_skipped() {
    let (mut world, map) = field(WorldConfig::default(), 8, 8);
    let tile = TileCoord::new(2, 2);
    let ids: Vec<_> = (1..=3)
        .map(|id| put(&mut world, id, EntityKind::Item, map, 2, 2))
        .collect();

    let visited = query::in_cell(&mut world, map, tile, KindMask::ALL, |world, current| {
        for id in &ids {
            if *id != current {
                let _ = world.request_free(*id);
            }
        }
        ControlFlow::Continue(())
    });
    assert_eq!(visited, Ok(1));
    assert_eq!(query::entity_count(&world), 1);
}

#[test]
fn overflowing_releases_are_reclaimed_by_maintenance() {
    let config = WorldConfig {
        deferred_capacity: 3,
        ..WorldConfig::default()
    };
    let (mut world, map) = field(config, 8, 8);
    let ids: Vec<_> = (1..=4)
        .map(|id| put(&mut world, id, EntityKind::Monster, map, 1, 1))
        .collect();

    assert_eq!(world.lock_releases(), 1);
    for id in &ids[..3] {
        assert_eq!(world.request_free(*id), Ok(FreeOutcome::Deferred));
    }
    assert_eq!(world.request_free(ids[3]), Ok(FreeOutcome::Leaked));
    assert_eq!(world.request_free(ids[0]), Ok(FreeOutcome::Leaked));
    assert_eq!(world.unlock_releases(), 0);

    assert_eq!(query::release_overflows(&world), 1);
    assert!(ids[..3].iter().all(|id| query::entity(&world, *id).is_none()));
    let leaked = query::entity(&world, ids[3]).expect("still registered");
    assert!(!leaked.is_placed(), "leaked entities are already unlinked");

    assert_eq!(
        world.maintain(),
        Maintenance {
            recovered_lock: false,
            reclaimed: 1
        }
    );
    assert_eq!(query::entity_count(&world), 0);
    assert_eq!(world.maintain(), Maintenance::default());
}

#[test]
fn duplicate_requests_release_once() {
    let (mut world, map) = field(WorldConfig::default(), 8, 8);
    let id = put(&mut world, 1, EntityKind::Skill, map, 1, 1);
    let _ = world.lock_releases();
    assert_eq!(world.request_free(id), Ok(FreeOutcome::Deferred));
    assert_eq!(world.request_free(id), Ok(FreeOutcome::Deferred));
    assert_eq!(query::pending_releases(&world), 2);
    assert_eq!(world.unlock_releases(), 0);
    assert_eq!(query::entity_count(&world), 0);
    assert_eq!(world.request_free(id), Err(WorldError::UnknownEntity(id)));
}

#[test]
fn maintenance_recovers_a_leaked_lock() {
    let (mut world, map) = field(WorldConfig::default(), 8, 8);
    let id = put(&mut world, 1, EntityKind::Item, map, 1, 1);
    let _ = world.lock_releases();
    assert_eq!(world.request_free(id), Ok(FreeOutcome::Deferred));

    let sweep = world.maintain();
    assert!(sweep.recovered_lock);
    assert_eq!(query::release_depth(&world), 0);
    assert!(query::entity(&world, id).is_none());
    assert_eq!(world.unlock_releases(), 0, "unbalanced unlock stays at zero");
}

#[test]
fn instance_tiles_are_isolated_from_source_and_siblings() {
    let (mut world, source) = field(WorldConfig::default(), 20, 20);
    let owner = LeaseOwner::new(OwnerKind::Guild, 42);
    let first = world
        .create_instance(source, owner, InstanceMode::default(), Duration::ZERO)
        .expect("slot available");
    let sibling = world
        .create_instance(source, owner, InstanceMode::default(), Duration::ZERO)
        .expect("slot available");

    let tile = TileCoord::new(3, 3);
    world
        .set_cell(first, tile, CellFlag::NoVending, true)
        .expect("inside map");
    assert_eq!(query::cell_check(&world, first, tile, CellCheck::NoVending), Ok(true));
    assert_eq!(query::cell_check(&world, source, tile, CellCheck::NoVending), Ok(false));
    assert_eq!(query::cell_check(&world, sibling, tile, CellCheck::NoVending), Ok(false));

    assert!(world
        .set_wall(first, TileCoord::new(5, 5), 3, atlas_core::Direction::North, false, "iw")
        .expect("map loaded"));
    assert_eq!(
        query::cell_check(&world, source, TileCoord::new(5, 6), CellCheck::Walkable),
        Ok(true)
    );
}

#[test]
fn destroying_an_instance_evicts_everything() {
    let (mut world, source) = field(WorldConfig::default(), 20, 20);
    let instance = world
        .create_instance(
            source,
            LeaseOwner::new(OwnerKind::Party, 5),
            InstanceMode::default(),
            Duration::ZERO,
        )
        .expect("slot available");
    let player = put(&mut world, 1, EntityKind::Player, instance, 2, 2);
    let monster = put(&mut world, 2, EntityKind::Monster, instance, 3, 3);
    let item = put(&mut world, 3, EntityKind::Item, instance, 4, 4);
    let stranded = put(&mut world, 4, EntityKind::Player, instance, 5, 5);
    assert!(world
        .set_wall(instance, TileCoord::new(8, 8), 2, atlas_core::Direction::East, false, "gate")
        .expect("map loaded"));
    assert_eq!(query::users(&world, instance), Ok(2));

    let save = TileCoord::new(10, 10);
    world
        .destroy_instance(instance, |world, id| {
            if id == player {
                assert_eq!(world.remove(id), Ok(true));
                world.place(id, source, save).expect("save point inside map");
            }
        })
        .expect("is an instance");

    let relocated = query::entity(&world, player).expect("players survive");
    assert_eq!((relocated.map(), relocated.tile()), (source, save));
    assert_eq!(query::users(&world, source), Ok(1));
    assert!(!query::entity(&world, stranded).expect("players survive").is_placed());
    assert!(query::entity(&world, monster).is_none());
    assert!(query::entity(&world, item).is_none());
    assert!(!query::wall_exists(&world, "gate"));
    assert_eq!(query::map_count(&world), 1);

    assert_eq!(
        world.place(stranded, instance, TileCoord::new(1, 1)),
        Err(WorldError::MapReleased(instance))
    );
    assert_eq!(
        query::cell_check(&world, instance, save, CellCheck::Walkable),
        Err(WorldError::MapReleased(instance))
    );
}

#[test]
fn teardown_evicts_more_entities_than_the_candidate_buffer_holds() {
    let config = WorldConfig {
        candidate_capacity: 2,
        ..WorldConfig::default()
    };
    let (mut world, source) = field(config, 20, 20);
    let owner = LeaseOwner::new(OwnerKind::Guild, 3);
    let instance = world
        .create_instance(source, owner, InstanceMode::default(), Duration::ZERO)
        .expect("slot available");
    let items: Vec<_> = (1..=3)
        .map(|id| put(&mut world, id, EntityKind::Item, instance, 2, 2))
        .collect();
    let players: Vec<_> = (4..=6)
        .map(|id| put(&mut world, id, EntityKind::Player, instance, 3, 3))
        .collect();

    let mut relocated = Vec::new();
    world
        .destroy_instance(instance, |_, id| relocated.push(id))
        .expect("is an instance");
    assert_eq!(relocated.len(), players.len(), "every player is offered relocation");
    for &id in &items {
        assert!(query::entity(&world, id).is_none(), "{id:?} is released");
    }
    for &id in &players {
        assert!(!query::entity(&world, id).expect("players survive").is_placed());
    }

    let reused = world
        .create_instance(source, owner, InstanceMode::default(), Duration::ZERO)
        .expect("slot available");
    assert_eq!(reused, instance);
    let fresh = put(&mut world, 10, EntityKind::Item, reused, 2, 2);
    assert_eq!(world.remove(players[0]), Ok(false));
    assert_eq!(in_cell(&mut world, reused, TileCoord::new(2, 2)), vec![fresh]);
}
