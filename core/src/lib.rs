#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Core contracts shared across the Atlas map server.
//!
//! This crate defines the vocabulary that connects the authoritative world,
//! the pure systems and the adapters: identifiers, tile coordinates, entity
//! kinds and kind masks, eight-way facings, per-tile flags and terrain
//! presets, instance lease descriptions and the error surface. Game logic
//! places entities into the world, asks it spatial questions and receives
//! plain values back; nothing in here owns state.

mod cell;
mod config;

use std::{collections::BTreeSet, ops::BitOr, time::Duration};

use serde::{Deserialize, Serialize};

pub use cell::{Cell, CellCheck, CellFlag, MapGeometry, TERRAIN_PRESETS, TERRAIN_TYPE_COUNT};
pub use config::WorldConfig;

/// Side length, in tiles, of one spatial index bucket.
pub const BLOCK_SIZE: i32 = 8;

/// Maximum number of bytes a map name occupies inside a world cache file.
pub const MAP_NAME_LENGTH: usize = 12;

/// Index of a map slot inside the world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapId(u16);

impl MapId {
    /// Creates a new map identifier with the provided slot index.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Retrieves the numeric representation of the identifier.
    #[must_use]
    pub const fn get(&self) -> u16 {
        self.0
    }

    /// Slot index usable for table lookups.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Unique identifier assigned to a placeable entity.
///
/// Identifiers are never reused while the entity they name is still held by
/// the world, including while its release is deferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u32);

impl EntityId {
    /// Creates a new entity identifier with the provided numeric value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Retrieves the numeric representation of the identifier.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

/// Location of a single tile expressed as column and row coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    x: i16,
    y: i16,
}

impl TileCoord {
    /// Creates a new tile coordinate.
    #[must_use]
    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }

    /// Zero-based column of the tile.
    #[must_use]
    pub const fn x(&self) -> i16 {
        self.x
    }

    /// Zero-based row of the tile.
    #[must_use]
    pub const fn y(&self) -> i16 {
        self.y
    }

    /// Index of the spatial bucket column containing the tile.
    #[must_use]
    pub const fn block_x(&self) -> i32 {
        self.x as i32 / BLOCK_SIZE
    }

    /// Index of the spatial bucket row containing the tile.
    #[must_use]
    pub const fn block_y(&self) -> i32 {
        self.y as i32 / BLOCK_SIZE
    }

    /// Reports whether both tiles fall into the same spatial bucket.
    #[must_use]
    pub const fn shares_block(&self, other: TileCoord) -> bool {
        self.block_x() == other.block_x() && self.block_y() == other.block_y()
    }

    /// Returns the tile displaced by the provided signed offsets, if it stays
    /// representable.
    #[must_use]
    pub fn offset(self, dx: i32, dy: i32) -> Option<TileCoord> {
        let x = i16::try_from(i32::from(self.x) + dx).ok()?;
        let y = i16::try_from(i32::from(self.y) + dy).ok()?;
        Some(TileCoord::new(x, y))
    }
}

/// Category of a placeable entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Connected player character.
    Player,
    /// Spawned monster. Monsters live in their own bucket chain.
    Monster,
    /// Scripted non-player character.
    Npc,
    /// Item lying on the ground.
    Item,
    /// Ground effect left by a skill.
    Skill,
    /// Chat room marker.
    Chat,
    /// Player-owned pet.
    Pet,
    /// Player-owned homunculus.
    Homunculus,
    /// Hired mercenary.
    Mercenary,
    /// Summoned elemental.
    Elemental,
}

impl EntityKind {
    /// Every entity kind in declaration order.
    pub const ALL: [EntityKind; 10] = [
        EntityKind::Player,
        EntityKind::Monster,
        EntityKind::Npc,
        EntityKind::Item,
        EntityKind::Skill,
        EntityKind::Chat,
        EntityKind::Pet,
        EntityKind::Homunculus,
        EntityKind::Mercenary,
        EntityKind::Elemental,
    ];

    /// Single-kind mask selecting only this kind.
    #[must_use]
    pub const fn mask(self) -> KindMask {
        KindMask(1 << self as u32)
    }

    /// Reports whether the kind belongs to the character class that occupies
    /// tiles and is counted by the no-stacking rule.
    #[must_use]
    pub const fn is_character(self) -> bool {
        KindMask::CHARACTER.contains(self)
    }
}

/// Set of entity kinds used to filter spatial queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindMask(u32);

impl KindMask {
    /// Mask that selects nothing.
    pub const NONE: KindMask = KindMask(0);
    /// Mask that selects every kind.
    pub const ALL: KindMask = KindMask((1 << EntityKind::ALL.len()) - 1);
    /// Player characters only.
    pub const PLAYER: KindMask = EntityKind::Player.mask();
    /// Monsters only.
    pub const MONSTER: KindMask = EntityKind::Monster.mask();
    /// Scripted characters only.
    pub const NPC: KindMask = EntityKind::Npc.mask();
    /// Ground items only.
    pub const ITEM: KindMask = EntityKind::Item.mask();
    /// Skill ground effects only.
    pub const SKILL: KindMask = EntityKind::Skill.mask();
    /// Entities that stand on a tile and take part in combat.
    pub const CHARACTER: KindMask = KindMask(
        EntityKind::Player.mask().0
            | EntityKind::Monster.mask().0
            | EntityKind::Homunculus.mask().0
            | EntityKind::Mercenary.mask().0
            | EntityKind::Elemental.mask().0,
    );

    /// Reports whether the mask selects the provided kind.
    #[must_use]
    pub const fn contains(self, kind: EntityKind) -> bool {
        self.0 & kind.mask().0 != 0
    }

    /// Reports whether the mask selects any kind stored outside the monster
    /// chain.
    #[must_use]
    pub const fn selects_general(self) -> bool {
        self.0 & !KindMask::MONSTER.0 != 0
    }

    /// Reports whether the mask selects monsters.
    #[must_use]
    pub const fn selects_monsters(self) -> bool {
        self.contains(EntityKind::Monster)
    }

    /// Mask without the kinds selected by `other`.
    #[must_use]
    pub const fn without(self, other: KindMask) -> KindMask {
        KindMask(self.0 & !other.0)
    }

    /// Reports whether the mask selects nothing.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for KindMask {
    type Output = KindMask;

    fn bitor(self, rhs: KindMask) -> KindMask {
        KindMask(self.0 | rhs.0)
    }
}

impl From<EntityKind> for KindMask {
    fn from(kind: EntityKind) -> Self {
        kind.mask()
    }
}

/// Eight-way facing. Positive `y` points north.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Towards increasing rows.
    North,
    /// Towards decreasing columns and increasing rows.
    NorthWest,
    /// Towards decreasing columns.
    West,
    /// Towards decreasing columns and rows.
    SouthWest,
    /// Towards decreasing rows.
    South,
    /// Towards increasing columns and decreasing rows.
    SouthEast,
    /// Towards increasing columns.
    East,
    /// Towards increasing columns and rows.
    NorthEast,
}

const DIRECTION_DX: [i32; 8] = [0, -1, -1, -1, 0, 1, 1, 1];
const DIRECTION_DY: [i32; 8] = [1, 1, 0, -1, -1, -1, 0, 1];

impl Direction {
    /// Every facing in counter-clockwise order starting at north.
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthWest,
        Direction::West,
        Direction::SouthWest,
        Direction::South,
        Direction::SouthEast,
        Direction::East,
        Direction::NorthEast,
    ];

    /// Column delta of a single step in this direction.
    #[must_use]
    pub const fn dx(self) -> i32 {
        DIRECTION_DX[self as usize]
    }

    /// Row delta of a single step in this direction.
    #[must_use]
    pub const fn dy(self) -> i32 {
        DIRECTION_DY[self as usize]
    }

    /// Reports whether the facing is diagonal.
    #[must_use]
    pub const fn is_diagonal(self) -> bool {
        self as usize % 2 == 1
    }

    /// Facing rotated counter-clockwise by `steps` eighth turns.
    #[must_use]
    pub const fn rotated(self, steps: usize) -> Direction {
        Direction::ALL[(self as usize + steps) % 8]
    }

    /// Derives the facing from `from` towards `to`.
    ///
    /// Targets within a 1:3 slope of an axis snap to that axis. When both
    /// tiles coincide the `fallback` facing is returned.
    #[must_use]
    pub fn between(from: TileCoord, to: TileCoord, fallback: Direction) -> Direction {
        let dx = i32::from(to.x()) - i32::from(from.x());
        let dy = i32::from(to.y()) - i32::from(from.y());

        if dx == 0 && dy == 0 {
            fallback
        } else if dx >= 0 && dy >= 0 {
            if dx >= dy * 3 {
                Direction::East
            } else if dx * 3 < dy {
                Direction::North
            } else {
                Direction::NorthEast
            }
        } else if dx >= 0 && dy <= 0 {
            if dx >= -dy * 3 {
                Direction::East
            } else if dx * 3 < -dy {
                Direction::South
            } else {
                Direction::SouthEast
            }
        } else if dx <= 0 && dy <= 0 {
            if dx * 3 >= dy {
                Direction::South
            } else if dx < dy * 3 {
                Direction::West
            } else {
                Direction::SouthWest
            }
        } else if -dx * 3 <= dy {
            Direction::North
        } else if -dx > dy * 3 {
            Direction::West
        } else {
            Direction::NorthWest
        }
    }

    /// Reports whether `other` points the same general way, meaning it is
    /// equal or one eighth turn away.
    #[must_use]
    pub const fn is_facing(self, other: Direction) -> bool {
        let delta = (self as usize + 8 - other as usize) % 8;
        delta == 0 || delta == 1 || delta == 7
    }
}

/// Half-extents of the trigger area an NPC stamps onto the cell table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TriggerSpan {
    half_width: u8,
    half_height: u8,
}

impl TriggerSpan {
    /// Largest half-extent accepted for a trigger area.
    pub const MAX_HALF_EXTENT: u8 = 14;

    /// Creates a trigger span, clamping each half-extent to
    /// [`TriggerSpan::MAX_HALF_EXTENT`].
    #[must_use]
    pub fn new(half_width: u8, half_height: u8) -> Self {
        Self {
            half_width: half_width.min(Self::MAX_HALF_EXTENT),
            half_height: half_height.min(Self::MAX_HALF_EXTENT),
        }
    }

    /// Horizontal half-extent in tiles.
    #[must_use]
    pub const fn half_width(&self) -> u8 {
        self.half_width
    }

    /// Vertical half-extent in tiles.
    #[must_use]
    pub const fn half_height(&self) -> u8 {
        self.half_height
    }
}

/// Zone-wide rules attached to a map rather than to individual tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MapFlag {
    /// Players may attack each other freely.
    Pvp,
    /// Guild versus guild combat rules apply.
    Gvg,
    /// The map counts as a town.
    Town,
    /// Teleport skills and items are disabled.
    NoTeleport,
    /// Return-to-save-point effects are disabled.
    NoReturn,
    /// Warping into or out of the map is disabled.
    NoWarp,
    /// The map cannot be memorised as a warp destination.
    NoMemo,
    /// Players cannot set their save point here.
    NoSave,
    /// Branch items cannot summon monsters.
    NoBranch,
    /// Trading between players is disabled.
    NoTrade,
    /// Skills cannot be used.
    NoSkill,
}

/// Set of zone flags active on a map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapFlags {
    flags: BTreeSet<MapFlag>,
}

impl MapFlags {
    /// Reports whether the flag is active.
    #[must_use]
    pub fn contains(&self, flag: MapFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Activates or deactivates a flag.
    pub fn set(&mut self, flag: MapFlag, active: bool) {
        if active {
            let _ = self.flags.insert(flag);
        } else {
            let _ = self.flags.remove(&flag);
        }
    }

    /// Iterator over the active flags in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = MapFlag> + '_ {
        self.flags.iter().copied()
    }

    /// Removes every flag.
    pub fn clear(&mut self) {
        self.flags.clear();
    }
}

/// Location players are sent back to when they leave a map involuntarily.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavePoint {
    map_name: String,
    tile: Option<TileCoord>,
}

impl SavePoint {
    /// Creates a save point. A missing tile lets game logic pick a random
    /// free tile on arrival.
    #[must_use]
    pub fn new(map_name: impl Into<String>, tile: Option<TileCoord>) -> Self {
        Self {
            map_name: map_name.into(),
            tile,
        }
    }

    /// Name of the destination map.
    #[must_use]
    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    /// Destination tile, if fixed.
    #[must_use]
    pub const fn tile(&self) -> Option<TileCoord> {
        self.tile
    }
}

/// Kind of party that owns an instance lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerKind {
    /// Owned by a single character.
    Character,
    /// Owned by a party.
    Party,
    /// Owned by a guild.
    Guild,
    /// Owned by a clan.
    Clan,
}

/// Owner of an instance lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseOwner {
    kind: OwnerKind,
    id: u32,
}

impl LeaseOwner {
    /// Creates a new lease owner.
    #[must_use]
    pub const fn new(kind: OwnerKind, id: u32) -> Self {
        Self { kind, id }
    }

    /// Kind of owner.
    #[must_use]
    pub const fn kind(&self) -> OwnerKind {
        self.kind
    }

    /// Numeric identifier of the owner.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }
}

/// Creation options and expiry policy of an instance map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstanceMode {
    /// Copy zone flags and the save point from the source map.
    pub copy_map_flags: bool,
    /// Hard lifetime of the instance, measured from creation.
    pub keep_limit: Option<Duration>,
    /// Time the instance may stay empty before it is torn down.
    pub idle_limit: Option<Duration>,
}

/// Immutable representation of a live instance used by expiry checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceView {
    /// Map slot occupied by the instance.
    pub map: MapId,
    /// Map the instance was cloned from.
    pub source: MapId,
    /// Owner of the lease.
    pub owner: LeaseOwner,
    /// Clock reading at creation.
    pub created_at: Duration,
    /// Clock reading when the instance last became empty, if it is empty.
    pub idle_since: Option<Duration>,
    /// Number of players currently inside.
    pub users: u32,
    /// Hard lifetime of the instance.
    pub keep_limit: Option<Duration>,
    /// Permitted idle time.
    pub idle_limit: Option<Duration>,
}

/// Result of a deferred release request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FreeOutcome {
    /// No query was in flight, the entity was released immediately.
    Released,
    /// A query is in flight, release happens when the outermost one finishes.
    Deferred,
    /// The deferred buffer was full; the entity stays allocated this tick.
    Leaked,
}

/// Errors reported by world operations.
///
/// These signal misuse or exhausted capacity; they are never used to encode
/// "the tile is blocked" or "nothing matched".
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    /// No map is loaded in the referenced slot.
    #[error("map {0:?} does not exist")]
    UnknownMap(MapId),
    /// The referenced map was an instance that has since been destroyed.
    #[error("map {0:?} has been released")]
    MapReleased(MapId),
    /// No map with the provided name is loaded.
    #[error("map '{0}' does not exist")]
    UnknownMapName(String),
    /// A map with the same name is already loaded.
    #[error("map '{0}' is already loaded")]
    DuplicateMap(String),
    /// The entity is not registered with the world.
    #[error("entity {0:?} does not exist")]
    UnknownEntity(EntityId),
    /// An entity with the same identifier is already registered.
    #[error("entity {0:?} is already registered")]
    DuplicateEntity(EntityId),
    /// The entity is already linked into a bucket chain.
    #[error("entity {0:?} is already placed")]
    AlreadyPlaced(EntityId),
    /// The coordinates lie outside the map.
    #[error("tile ({x}, {y}) lies outside map {map:?}")]
    OutOfBounds {
        /// Map the coordinates were checked against.
        map: MapId,
        /// Requested column.
        x: i32,
        /// Requested row.
        y: i32,
    },
    /// The map has more tiles than the configured maximum.
    #[error("map '{name}' has {tiles} tiles, more than the configured maximum")]
    OversizedMap {
        /// Name of the rejected map.
        name: String,
        /// Tile count of the rejected map.
        tiles: usize,
    },
    /// Every map slot is in use.
    #[error("all {capacity} map slots are in use")]
    SlotsExhausted {
        /// Configured number of map slots.
        capacity: usize,
    },
    /// No free synthetic name remained for a new instance.
    #[error("no free instance name for source map '{0}'")]
    InstanceNameExhausted(String),
    /// The referenced map is not an instance.
    #[error("map {0:?} is not an instance")]
    NotAnInstance(MapId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_between_snaps_to_axes() {
        let origin = TileCoord::new(10, 10);
        assert_eq!(
            Direction::between(origin, TileCoord::new(20, 11), Direction::South),
            Direction::East
        );
        assert_eq!(
            Direction::between(origin, TileCoord::new(11, 20), Direction::South),
            Direction::North
        );
        assert_eq!(
            Direction::between(origin, TileCoord::new(15, 15), Direction::South),
            Direction::NorthEast
        );
        assert_eq!(
            Direction::between(origin, TileCoord::new(5, 5), Direction::South),
            Direction::SouthWest
        );
        assert_eq!(
            Direction::between(origin, TileCoord::new(0, 10), Direction::South),
            Direction::West
        );
        assert_eq!(
            Direction::between(origin, TileCoord::new(10, 0), Direction::North),
            Direction::South
        );
        assert_eq!(
            Direction::between(origin, TileCoord::new(6, 14), Direction::South),
            Direction::NorthWest
        );
        assert_eq!(
            Direction::between(origin, TileCoord::new(14, 6), Direction::South),
            Direction::SouthEast
        );
    }

    #[test]
    fn direction_between_same_tile_uses_fallback() {
        let tile = TileCoord::new(3, 3);
        assert_eq!(
            Direction::between(tile, tile, Direction::SouthWest),
            Direction::SouthWest
        );
    }

    #[test]
    fn perpendicular_rotation_of_diagonals_stays_diagonal() {
        assert_eq!(Direction::NorthWest.rotated(2), Direction::SouthWest);
        assert_eq!(Direction::East.rotated(2), Direction::NorthEast.rotated(1));
        assert!(Direction::SouthEast.is_diagonal());
        assert!(!Direction::West.is_diagonal());
    }

    #[test]
    fn facing_tolerates_one_eighth_turn() {
        assert!(Direction::North.is_facing(Direction::North));
        assert!(Direction::North.is_facing(Direction::NorthEast));
        assert!(Direction::North.is_facing(Direction::NorthWest));
        assert!(!Direction::North.is_facing(Direction::West));
        assert!(!Direction::North.is_facing(Direction::South));
    }

    #[test]
    fn kind_masks_split_monster_chain_from_general_chain() {
        assert!(KindMask::MONSTER.selects_monsters());
        assert!(!KindMask::MONSTER.selects_general());
        assert!(KindMask::PLAYER.selects_general());
        assert!(KindMask::ALL.selects_general() && KindMask::ALL.selects_monsters());
        assert!(KindMask::NONE.is_empty());
        assert!(!KindMask::ALL.without(KindMask::PLAYER).contains(EntityKind::Player));
    }

    #[test]
    fn character_class_excludes_npcs_and_items() {
        assert!(EntityKind::Player.is_character());
        assert!(EntityKind::Monster.is_character());
        assert!(EntityKind::Elemental.is_character());
        assert!(!EntityKind::Npc.is_character());
        assert!(!EntityKind::Item.is_character());
        assert!(!EntityKind::Pet.is_character());
    }

    #[test]
    fn tiles_share_blocks_only_inside_the_same_bucket() {
        assert!(TileCoord::new(0, 0).shares_block(TileCoord::new(7, 7)));
        assert!(!TileCoord::new(7, 7).shares_block(TileCoord::new(8, 7)));
        assert_eq!(TileCoord::new(17, 9).block_x(), 2);
        assert_eq!(TileCoord::new(17, 9).block_y(), 1);
    }

    #[test]
    fn trigger_span_is_clamped() {
        let span = TriggerSpan::new(40, 2);
        assert_eq!(span.half_width(), TriggerSpan::MAX_HALF_EXTENT);
        assert_eq!(span.half_height(), 2);
    }

    #[test]
    fn map_flags_toggle() {
        let mut flags = MapFlags::default();
        flags.set(MapFlag::NoTeleport, true);
        flags.set(MapFlag::Pvp, true);
        flags.set(MapFlag::Pvp, false);
        assert!(flags.contains(MapFlag::NoTeleport));
        assert!(!flags.contains(MapFlag::Pvp));
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![MapFlag::NoTeleport]);
    }
}
