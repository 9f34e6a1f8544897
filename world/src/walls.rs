//! Named invisible walls laid over map geometry at runtime.

use std::collections::BTreeMap;

use atlas_core::{CellCheck, CellFlag, Direction, MapId, TileCoord, WorldError};

use crate::{loaded, loaded_mut, World};

/// Snapshot of a wall stored inside the world.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct WallState {
    /// Map the wall was raised on.
    pub(crate) map: MapId,
    /// Tiles the wall covers, starting at its origin.
    pub(crate) tiles: Vec<TileCoord>,
}

/// Registry of walls keyed by their unique name.
#[derive(Debug, Default)]
pub(crate) struct WallRegistry {
    entries: BTreeMap<String, WallState>,
}

impl WallRegistry {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn insert(&mut self, name: &str, state: WallState) {
        let _ = self.entries.insert(name.to_owned(), state);
    }

    fn take(&mut self, name: &str) -> Option<WallState> {
        self.entries.remove(name)
    }

    /// Forgets every wall raised on `map` and returns how many were dropped.
    pub(crate) fn drop_map(&mut self, map: MapId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, wall| wall.map != map);
        before - self.entries.len()
    }
}

impl World {
    /// Raises a named wall of up to `size` tiles starting at `origin` and
    /// running along `direction`.
    ///
    /// Covered tiles become non-walkable and keep sight open only when
    /// `shootable` is set. The wall stops short at the first tile that is
    /// already unreachable. Returns `Ok(false)` without changing anything
    /// when the name is taken, `size` is below one or the origin itself is
    /// unreachable.
    pub fn set_wall(
        &mut self,
        map: MapId,
        origin: TileCoord,
        size: i32,
        direction: Direction,
        shootable: bool,
        name: &str,
    ) -> Result<bool, WorldError> {
        let data = loaded(&self.maps, map)?;
        if size < 1 || self.walls.contains(name) {
            return Ok(false);
        }
        let blocked = |tile: TileCoord| {
            data.cells.check(
                i32::from(tile.x()),
                i32::from(tile.y()),
                CellCheck::NoReach,
                None,
            )
        };
        if blocked(origin) {
            log::debug!("wall '{name}' origin ({}, {}) is not walkable", origin.x(), origin.y());
            return Ok(false);
        }

        let tiles: Vec<TileCoord> = (0..size)
            .map_while(|step| origin.offset(direction.dx() * step, direction.dy() * step))
            .take_while(|&tile| !blocked(tile))
            .collect();

        let data = loaded_mut(&mut self.maps, map)?;
        for &tile in &tiles {
            if let Some(cell) = data.cells.tile_mut(tile) {
                cell.set(CellFlag::Walkable, false);
                cell.set(CellFlag::Shootable, shootable);
            }
        }
        log::debug!(
            "raised wall '{name}' on '{}' covering {} of {size} tiles",
            data.name,
            tiles.len()
        );
        self.walls.insert(name, WallState { map, tiles });
        Ok(true)
    }

    /// Tears down a named wall, making its tiles walkable and shootable
    /// again. Returns `false` if no wall carries that name.
    pub fn remove_wall(&mut self, name: &str) -> bool {
        let Some(wall) = self.walls.take(name) else {
            return false;
        };
        match loaded_mut(&mut self.maps, wall.map) {
            Ok(data) => {
                for tile in wall.tiles {
                    if let Some(cell) = data.cells.tile_mut(tile) {
                        cell.set(CellFlag::Walkable, true);
                        cell.set(CellFlag::Shootable, true);
                    }
                }
            }
            Err(error) => log::warn!("wall '{name}' outlived its map: {error}"),
        }
        true
    }
}
