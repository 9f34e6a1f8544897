use std::time::Duration;

use atlas_core::{
    EntityId, EntityKind, InstanceMode, LeaseOwner, MapGeometry, OwnerKind, TileCoord, WorldConfig,
};
use atlas_system_instance_expiry::{Expiry, ExpiryReason, InstanceExpiry};
use atlas_world::{query, Entity, World};

fn seconds(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn expire(world: &mut World, expiry: &InstanceExpiry, now: Duration, out: &mut Vec<Expiry>) {
    let views = world.instance_views(now);
    expiry.handle(now, &views, out);
    for expired in out.iter() {
        world
            .destroy_instance(expired.map, |world, id| {
                let _ = world.remove(id);
            })
            .expect("views only list live instances");
    }
}

#[test]
fn empty_instance_is_torn_down_after_its_idle_limit() {
    let mut world = World::new(WorldConfig::default());
    let source = world
        .add_map(MapGeometry::filled("1@tower", 16, 16, 0).expect("geometry"))
        .expect("map installs");
    let instance = world
        .create_instance(
            source,
            LeaseOwner::new(OwnerKind::Party, 12),
            InstanceMode {
                copy_map_flags: false,
                keep_limit: Some(seconds(600)),
                idle_limit: Some(seconds(60)),
            },
            seconds(0),
        )
        .expect("slot available");

    let player = EntityId::new(1);
    world
        .spawn(Entity::new(player, EntityKind::Player, instance, TileCoord::new(3, 3)))
        .expect("fresh identifier");
    world
        .place(player, instance, TileCoord::new(3, 3))
        .expect("inside map");

    let expiry = InstanceExpiry::new();
    let mut out = Vec::new();
    expire(&mut world, &expiry, seconds(100), &mut out);
    assert!(out.is_empty(), "occupied instances stay");

    assert_eq!(world.remove(player), Ok(true));
    expire(&mut world, &expiry, seconds(120), &mut out);
    assert!(out.is_empty(), "idle clock just started");

    expire(&mut world, &expiry, seconds(180), &mut out);
    assert_eq!(
        out,
        vec![Expiry {
            map: instance,
            reason: ExpiryReason::IdleLimit
        }]
    );
    assert_eq!(query::map_id(&world, "012#1@tower"), None);
    assert_eq!(query::map_count(&world), 1);
    assert!(world.instance_views(seconds(200)).is_empty());
}

#[test]
fn occupied_instance_is_torn_down_at_its_keep_limit() {
    let mut world = World::new(WorldConfig::default());
    let source = world
        .add_map(MapGeometry::filled("guild_vs2", 16, 16, 0).expect("geometry"))
        .expect("map installs");
    let instance = world
        .create_instance(
            source,
            LeaseOwner::new(OwnerKind::Guild, 7),
            InstanceMode {
                copy_map_flags: true,
                keep_limit: Some(seconds(600)),
                idle_limit: None,
            },
            seconds(0),
        )
        .expect("slot available");

    let player = EntityId::new(1);
    world
        .spawn(Entity::new(player, EntityKind::Player, instance, TileCoord::new(3, 3)))
        .expect("fresh identifier");
    world
        .place(player, instance, TileCoord::new(3, 3))
        .expect("inside map");

    let expiry = InstanceExpiry::new();
    let mut out = Vec::new();
    expire(&mut world, &expiry, seconds(599), &mut out);
    assert!(out.is_empty());

    expire(&mut world, &expiry, seconds(600), &mut out);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].reason, ExpiryReason::KeepLimit);
    assert!(!query::entity(&world, player)
        .expect("players are never released")
        .is_placed());
}
