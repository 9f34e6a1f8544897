//! Query functions over the world state.
//!
//! Read-only accessors take `&World`. The spatial operators take `&mut World`
//! because they hand every matching entity to a visitor that may itself
//! mutate the world, free the entity it is looking at or run another query.
//!
//! Every spatial operator follows the same two phases. Candidates are first
//! collected into the shared candidate buffer by walking the buckets that
//! overlap the shape and applying the operator's acceptance test. The
//! collected snapshot is then visited with releases deferred; entities placed
//! by a visitor are not visited in the same pass and entities unplaced by a
//! visitor are skipped. Nested queries append behind the outer snapshot and
//! truncate back to it when they finish.

use std::ops::ControlFlow;

use atlas_core::{
    CellCheck, Direction, EntityId, KindMask, MapFlags, MapId, SavePoint, TileCoord, WorldConfig,
    WorldError,
};

use crate::{cells::CellTable, grid::TileRect, loaded, Entity, World};

/// Reach past any map extent. Larger ranges, lengths and offsets are clamped
/// to it so shape arithmetic cannot overflow.
const MAX_REACH: i32 = 1 << 20;

fn reach(value: i32) -> i32 {
    value.min(MAX_REACH)
}

/// Bounded scratch list shared by every spatial operator.
#[derive(Debug)]
pub(crate) struct CandidateBuffer {
    ids: Vec<EntityId>,
    capacity: usize,
}

impl CandidateBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            ids: Vec::new(),
            capacity,
        }
    }

    fn mark(&self) -> usize {
        self.ids.len()
    }

    fn push(&mut self, id: EntityId) -> bool {
        if self.ids.len() >= self.capacity {
            return false;
        }
        self.ids.push(id);
        true
    }

    fn get(&self, index: usize) -> Option<EntityId> {
        self.ids.get(index).copied()
    }

    fn truncate(&mut self, mark: usize) {
        self.ids.truncate(mark);
    }
}

/// Configuration the world was created with.
#[must_use]
pub fn config(world: &World) -> &WorldConfig {
    &world.config
}

/// Looks up a registered entity.
#[must_use]
pub fn entity(world: &World, id: EntityId) -> Option<&Entity> {
    world.entities.get(id)
}

/// Number of entities the world holds, including those awaiting release.
#[must_use]
pub fn entity_count(world: &World) -> usize {
    world.entities.len()
}

/// Resolves a map name to its slot.
#[must_use]
pub fn map_id(world: &World, name: &str) -> Option<MapId> {
    world.names.get(name).copied()
}

/// Number of maps currently loaded, instances included.
#[must_use]
pub fn map_count(world: &World) -> usize {
    world.names.len()
}

/// Name of a loaded map.
pub fn map_name(world: &World, map: MapId) -> Result<&str, WorldError> {
    Ok(&loaded(&world.maps, map)?.name)
}

/// Width and height of a loaded map in tiles.
pub fn map_size(world: &World, map: MapId) -> Result<(i16, i16), WorldError> {
    let data = loaded(&world.maps, map)?;
    Ok((data.cells.width(), data.cells.height()))
}

/// Number of players currently placed on a map.
pub fn users(world: &World, map: MapId) -> Result<u32, WorldError> {
    Ok(loaded(&world.maps, map)?.users)
}

/// Zone flags active on a map.
pub fn map_flags(world: &World, map: MapId) -> Result<&MapFlags, WorldError> {
    Ok(&loaded(&world.maps, map)?.flags)
}

/// Save point of a map, if one is configured.
pub fn save_point(world: &World, map: MapId) -> Result<Option<&SavePoint>, WorldError> {
    Ok(loaded(&world.maps, map)?.save_point.as_ref())
}

/// Current deferred release depth.
#[must_use]
pub fn release_depth(world: &World) -> usize {
    world.arena.depth()
}

/// Number of releases waiting for the outermost query to finish.
#[must_use]
pub fn pending_releases(world: &World) -> usize {
    world.arena.pending()
}

/// Number of locked regions in which the deferred release queue overflowed.
#[must_use]
pub fn release_overflows(world: &World) -> usize {
    world.arena.overflow_warnings()
}

/// Answers a tile question. Tiles outside the map answer as solid ground:
/// only the blocked family (`NoPass`, `NoReach`, `Wall`) reports `true`.
pub fn cell_check(
    world: &World,
    map: MapId,
    tile: TileCoord,
    check: CellCheck,
) -> Result<bool, WorldError> {
    let data = loaded(&world.maps, map)?;
    Ok(data.cells.check(
        i32::from(tile.x()),
        i32::from(tile.y()),
        check,
        world.config.stack_limit,
    ))
}

/// Canonical terrain type of a tile.
pub fn cell_terrain(world: &World, map: MapId, tile: TileCoord) -> Result<u8, WorldError> {
    let data = loaded(&world.maps, map)?;
    data.cells
        .get(i32::from(tile.x()), i32::from(tile.y()))
        .map(|cell| cell.terrain())
        .ok_or_else(|| out_of_bounds(map, tile))
}

/// Number of character-class entities standing on a tile. Always zero when
/// no stack limit is configured.
pub fn cell_occupancy(world: &World, map: MapId, tile: TileCoord) -> Result<u16, WorldError> {
    let data = loaded(&world.maps, map)?;
    data.cells
        .get(i32::from(tile.x()), i32::from(tile.y()))
        .map(|cell| cell.occupancy())
        .ok_or_else(|| out_of_bounds(map, tile))
}

/// Reports whether an invisible wall with the given name exists.
#[must_use]
pub fn wall_exists(world: &World, name: &str) -> bool {
    world.walls.contains(name)
}

/// Map an instance was cloned from, or `None` for regular maps.
pub fn instance_source(world: &World, map: MapId) -> Result<Option<MapId>, WorldError> {
    Ok(loaded(&world.maps, map)?
        .instance
        .as_ref()
        .map(|record| record.source))
}

/// Counts the entities selected by `mask` standing on a tile.
pub fn count_in_cell(
    world: &World,
    map: MapId,
    tile: TileCoord,
    mask: KindMask,
) -> Result<usize, WorldError> {
    let data = loaded(&world.maps, map)?;
    if !data.contains(tile) {
        return Ok(0);
    }
    let rect = TileRect::around(tile, 0);
    let mut count = 0;
    let _ = data.grid.walk(&world.entities, rect, mask, |_| {
        count += 1;
        true
    });
    Ok(count)
}

fn out_of_bounds(map: MapId, tile: TileCoord) -> WorldError {
    WorldError::OutOfBounds {
        map,
        x: i32::from(tile.x()),
        y: i32::from(tile.y()),
    }
}

/// Line segment with a half-width, traced by [`in_path`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathShape {
    /// Start of the segment.
    pub from: TileCoord,
    /// End of the segment.
    pub to: TileCoord,
    /// Largest perpendicular distance, in tiles, still considered a hit.
    pub half_width: i32,
    /// Travel distance along the segment direction. Zero keeps the segment
    /// as given; a longer value extends it past `to`.
    pub length: i32,
}

/// Eight-way strip anchored on a tile, traced by [`in_direction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectionShape {
    /// Anchor of the strip.
    pub from: TileCoord,
    /// Tile the facing is derived from.
    pub toward: TileCoord,
    /// Strip width on each side of the centre line.
    pub half_width: i32,
    /// Number of tiles the strip extends along the facing.
    pub length: i32,
    /// Distance between the anchor and the near edge of the strip.
    /// Diagonal strips count it in half tiles.
    pub offset: i32,
}

/// Visits entities within `range` tiles of `center`, the centre itself
/// excluded. Line of sight is required when the world is configured with
/// `skill_wall_check`.
pub fn in_range<F>(
    world: &mut World,
    center: EntityId,
    range: i32,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let wall_check = world.config.skill_wall_check;
    range_query(world, center, range, mask, wall_check, "in_range", visitor)
}

/// Same as [`in_range`] without any line of sight check.
pub fn in_all_range<F>(
    world: &mut World,
    center: EntityId,
    range: i32,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    range_query(world, center, range, mask, false, "in_all_range", visitor)
}

/// Same as [`in_range`] but line of sight from the centre is always
/// required.
pub fn in_shoot_range<F>(
    world: &mut World,
    center: EntityId,
    range: i32,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    range_query(world, center, range, mask, true, "in_shoot_range", visitor)
}

fn range_query<F>(
    world: &mut World,
    center: EntityId,
    range: i32,
    mask: KindMask,
    wall_check: bool,
    operator: &str,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let origin = world
        .entities
        .get(center)
        .ok_or(WorldError::UnknownEntity(center))?;
    let (map, tile) = (origin.map(), origin.tile());
    let _ = loaded(&world.maps, map)?;
    if range < 0 {
        return Ok(0);
    }
    let range = reach(range);

    let circular = world.config.circular_area;
    let mark = gather(
        world,
        map,
        TileRect::around(tile, range),
        mask,
        operator,
        |entity, cells| {
            let dx = i32::from(entity.tile().x()) - i32::from(tile.x());
            let dy = i32::from(entity.tile().y()) - i32::from(tile.y());
            entity.id() != center
                && (!circular || within_circle(dx, dy, range))
                && (!wall_check || cells.line_of_sight(tile, entity.tile()))
        },
    )?;
    Ok(visit(world, mark, visitor))
}

/// Visits entities inside the rectangle spanned by two corners. Line of
/// sight from the rectangle centre is required when the world is configured
/// with `skill_wall_check`.
pub fn in_area<F>(
    world: &mut World,
    map: MapId,
    from: TileCoord,
    to: TileCoord,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let wall_check = world.config.skill_wall_check;
    area_query(world, map, from, to, mask, wall_check, "in_area", visitor)
}

/// Same as [`in_area`] without any line of sight check.
pub fn in_all_area<F>(
    world: &mut World,
    map: MapId,
    from: TileCoord,
    to: TileCoord,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    area_query(world, map, from, to, mask, false, "in_all_area", visitor)
}

/// Same as [`in_area`] but line of sight from the rectangle centre is always
/// required.
pub fn in_shoot_area<F>(
    world: &mut World,
    map: MapId,
    from: TileCoord,
    to: TileCoord,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    area_query(world, map, from, to, mask, true, "in_shoot_area", visitor)
}

#[allow(clippy::too_many_arguments)]
fn area_query<F>(
    world: &mut World,
    map: MapId,
    from: TileCoord,
    to: TileCoord,
    mask: KindMask,
    wall_check: bool,
    operator: &str,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let data = loaded(&world.maps, map)?;
    let rect = TileRect::spanning(
        i32::from(from.x()),
        i32::from(from.y()),
        i32::from(to.x()),
        i32::from(to.y()),
    );
    let Some(clamped) = rect.clamped(data.cells.width(), data.cells.height()) else {
        return Ok(0);
    };
    let centre = centroid(clamped);

    let mark = gather(world, map, clamped, mask, operator, |entity, cells| {
        !wall_check || centre.map_or(false, |centre| cells.line_of_sight(centre, entity.tile()))
    })?;
    Ok(visit(world, mark, visitor))
}

fn centroid(rect: TileRect) -> Option<TileCoord> {
    let x = i16::try_from(rect.x0 + (rect.x1 - rect.x0) / 2).ok()?;
    let y = i16::try_from(rect.y0 + (rect.y1 - rect.y0) / 2).ok()?;
    Some(TileCoord::new(x, y))
}

/// Visits entities standing exactly on `tile`.
pub fn in_cell<F>(
    world: &mut World,
    map: MapId,
    tile: TileCoord,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    if !loaded(&world.maps, map)?.contains(tile) {
        return Ok(0);
    }
    let mark = gather(world, map, TileRect::around(tile, 0), mask, "in_cell", |_, _| true)?;
    Ok(visit(world, mark, visitor))
}

/// Visits every entity on a map.
pub fn in_map<F>(
    world: &mut World,
    map: MapId,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let rect = loaded(&world.maps, map)?.grid.whole_map();
    let mark = gather(world, map, rect, mask, "in_map", |_, _| true)?;
    Ok(visit(world, mark, visitor))
}

/// Visits entities whose perpendicular distance to a segment is at most
/// `half_width` and whose projection falls between the start and the
/// (optionally extended) end. Both endpoints are included. Entities beyond
/// the original end of the segment additionally need line of sight.
pub fn in_path<F>(
    world: &mut World,
    map: MapId,
    shape: PathShape,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let data = loaded(&world.maps, map)?;
    let (x0, y0) = (i64::from(shape.from.x()), i64::from(shape.from.y()));
    let (x1, y1) = (i64::from(shape.to.x()), i64::from(shape.to.y()));
    let range = i64::from(reach(shape.half_width));

    let magnitude2 = magnitude2_of(x0, y0, x1, y1);
    if magnitude2 < 1 || range < 0 {
        return Ok(0);
    }

    let (mut mx1, mut my1) = (x1, y1);
    let mut len_limit = magnitude2;
    if shape.length > 0 {
        // Integer length of the segment; the only square root taken.
        let k = (magnitude2 as f64).sqrt() as i64;
        let length = i64::from(reach(shape.length));
        mx1 = x0 + (x1 - x0) * length / k;
        my1 = y0 + (y1 - y0) * length / k;
        len_limit = magnitude2_of(x0, y0, mx1, my1);
    }

    let rect = TileRect::spanning(
        clamp_i32(x0.min(mx1) - range),
        clamp_i32(y0.min(my1) - range),
        clamp_i32(x0.max(mx1) + range),
        clamp_i32(y0.max(my1) + range),
    );
    let Some(rect) = rect.clamped(data.cells.width(), data.cells.height()) else {
        return Ok(0);
    };

    // Distances are compared in sixteenths of a tile, so squared values
    // carry a factor of 256.
    let range2 = range * (range << 8);
    let from = shape.from;

    let mark = gather(world, map, rect, mask, "in_path", |entity, cells| {
        let (xi, yi) = (i64::from(entity.tile().x()), i64::from(entity.tile().y()));
        let k = (xi - x0) * (x1 - x0) + (yi - y0) * (y1 - y0);
        if k < 0 || k > len_limit {
            return false;
        }
        if k > magnitude2 && !cells.line_of_sight(from, entity.tile()) {
            return false;
        }
        let k = (k << 4) / magnitude2;
        let xu = (x0 << 4) + k * (x1 - x0);
        let yu = (y0 << 4) + k * (y1 - y0);
        magnitude2_of(xi << 4, yi << 4, xu, yu) <= range2
    })?;
    Ok(visit(world, mark, visitor))
}

fn magnitude2_of(x0: i64, y0: i64, x1: i64, y1: i64) -> i64 {
    (x1 - x0) * (x1 - x0) + (y1 - y0) * (y1 - y0)
}

fn clamp_i32(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}

/// Visits entities inside an eight-way strip starting at `shape.from` and
/// facing `shape.toward`. Every hit needs line of sight from the anchor.
pub fn in_direction<F>(
    world: &mut World,
    map: MapId,
    shape: DirectionShape,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let data = loaded(&world.maps, map)?;
    let DirectionShape {
        from,
        toward,
        half_width: range,
        length,
        offset,
    } = shape;
    if range < 0 || length < 1 || offset < 0 {
        return Ok(0);
    }
    let (range, mut length, mut offset) = (reach(range), reach(length), reach(offset));

    let facing = Direction::between(from, toward, Direction::East);
    let diagonal = facing.is_diagonal();
    if offset > 0 && diagonal {
        // Half-tile units so diagonal strips can attach to each other.
        offset = 2 * offset - 1;
        length += 1;
    }

    let (x0, y0) = (i32::from(from.x()), i32::from(from.y()));
    let (dx, dy) = (facing.dx(), facing.dy());
    let start = offset / if diagonal { 2 } else { 1 };
    let end = start + length - 1;
    let strip = TileRect::spanning(
        x0 + dx * start,
        y0 + dy * start,
        x0 + dx * end,
        y0 + dy * end,
    );

    let side = facing.rotated(2);
    let widened = TileRect {
        x0: strip.x0 - (range * side.dx()).abs(),
        y0: strip.y0 - (range * side.dy()).abs(),
        x1: strip.x1 + (range * side.dx()).abs(),
        y1: strip.y1 + (range * side.dy()).abs(),
    };
    let Some(rect) = widened.clamped(data.cells.width(), data.cells.height()) else {
        return Ok(0);
    };

    let same_cell = world.config.eightpath_same_cell;
    let mark = gather(world, map, rect, mask, "in_direction", |entity, cells| {
        let rx = i32::from(entity.tile().x()) - x0;
        let ry = i32::from(entity.tile().y()) - y0;
        if !same_cell && rx == 0 && ry == 0 {
            return false;
        }
        let (rx, ry) = (rx * dx, ry * dy);
        if diagonal {
            if rx + ry < offset || rx + ry > 2 * (length + offset / 2 - 1) {
                return false;
            }
            if (rx - ry).abs() > 2 * range {
                return false;
            }
        }
        cells.line_of_sight(from, entity.tile())
    })?;
    Ok(visit(world, mark, visitor))
}

/// Visits entities that enter or leave the `range` square around `center`
/// when it steps by (`dx`, `dy`).
///
/// Axis-aligned steps narrow the square to the strip being crossed; diagonal
/// steps keep the square and accept tiles inside either strip.
pub fn in_move_area<F>(
    world: &mut World,
    center: EntityId,
    range: i32,
    dx: i32,
    dy: i32,
    mask: KindMask,
    visitor: F,
) -> Result<usize, WorldError>
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let origin = world
        .entities
        .get(center)
        .ok_or(WorldError::UnknownEntity(center))?;
    let (map, tile) = (origin.map(), origin.tile());
    let data = loaded(&world.maps, map)?;
    if range == 0 || (dx == 0 && dy == 0) {
        return Ok(0);
    }
    let range = range.clamp(-MAX_REACH, MAX_REACH);
    let (dx, dy) = (
        dx.clamp(-MAX_REACH, MAX_REACH),
        dy.clamp(-MAX_REACH, MAX_REACH),
    );

    let square = TileRect::around(tile, range);
    let (width, height) = (data.cells.width(), data.cells.height());

    let mark = if dx == 0 || dy == 0 {
        let mut strip = square;
        if dx == 0 {
            if dy < 0 {
                strip.y0 = strip.y1 + dy + 1;
            } else {
                strip.y1 = strip.y0 + dy - 1;
            }
        } else if dx < 0 {
            strip.x0 = strip.x1 + dx + 1;
        } else {
            strip.x1 = strip.x0 + dx - 1;
        }
        let Some(rect) = strip.clamped(width, height) else {
            return Ok(0);
        };
        gather(world, map, rect, mask, "in_move_area", |_, _| true)?
    } else {
        let Some(rect) = square.clamped(width, height) else {
            return Ok(0);
        };
        gather(world, map, rect, mask, "in_move_area", |entity, _| {
            let (x, y) = (i32::from(entity.tile().x()), i32::from(entity.tile().y()));
            (dx > 0 && x < rect.x0 + dx)
                || (dx < 0 && x > rect.x1 + dx)
                || (dy > 0 && y < rect.y0 + dy)
                || (dy < 0 && y > rect.y1 + dy)
        })?
    };
    Ok(visit(world, mark, visitor))
}

/// Circular distance test with one tile of grace on diagonals.
fn within_circle(dx: i32, dy: i32, range: i32) -> bool {
    let (dx, dy, range) = (i64::from(dx), i64::from(dy), i64::from(range));
    dx * dx + dy * dy <= range * range + i64::from(dx != 0 && dy != 0)
}

/// Collects accepted candidates behind the current buffer mark and returns
/// the mark.
fn gather<A>(
    world: &mut World,
    map: MapId,
    rect: TileRect,
    mask: KindMask,
    operator: &str,
    mut accept: A,
) -> Result<usize, WorldError>
where
    A: FnMut(&Entity, &CellTable) -> bool,
{
    let data = loaded(&world.maps, map)?;
    let candidates = &mut world.candidates;
    let mark = candidates.mark();
    let complete = data.grid.walk(&world.entities, rect, mask, |entity| {
        !accept(entity, &data.cells) || candidates.push(entity.id())
    });
    if !complete {
        log::warn!(
            "{operator}: candidate buffer is full ({} entries), visiting a partial result",
            candidates.capacity
        );
    }
    Ok(mark)
}

/// Visits the snapshot collected behind `mark` with releases deferred.
fn visit<F>(world: &mut World, mark: usize, mut visitor: F) -> usize
where
    F: FnMut(&mut World, EntityId) -> ControlFlow<()>,
{
    let end = world.candidates.mark();
    let _ = world.lock_releases();

    let mut visited = 0;
    for index in mark..end {
        let Some(id) = world.candidates.get(index) else {
            break;
        };
        if !world.entities.get(id).is_some_and(Entity::is_placed) {
            continue;
        }
        visited += 1;
        if visitor(world, id).is_break() {
            break;
        }
    }

    world.candidates.truncate(mark);
    let _ = world.unlock_releases();
    visited
}
