//! Block-partitioned entity chains.

use atlas_core::{EntityId, EntityKind, KindMask, TileCoord, BLOCK_SIZE};

use crate::entities::{ChainLink, ChainPrev, Entity, EntityStore};

/// Inclusive rectangle of tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TileRect {
    pub(crate) x0: i32,
    pub(crate) y0: i32,
    pub(crate) x1: i32,
    pub(crate) y1: i32,
}

impl TileRect {
    /// Builds a rectangle from two corners given in any order.
    pub(crate) fn spanning(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    /// Square of side `2 * radius + 1` around a tile.
    pub(crate) fn around(tile: TileCoord, radius: i32) -> Self {
        let (x, y) = (i32::from(tile.x()), i32::from(tile.y()));
        Self::spanning(x - radius, y - radius, x + radius, y + radius)
    }

    /// Intersection with a `width` by `height` map, if any tile remains.
    pub(crate) fn clamped(self, width: i16, height: i16) -> Option<Self> {
        let clamped = Self {
            x0: self.x0.max(0),
            y0: self.y0.max(0),
            x1: self.x1.min(i32::from(width) - 1),
            y1: self.y1.min(i32::from(height) - 1),
        };
        (clamped.x0 <= clamped.x1 && clamped.y0 <= clamped.y1).then_some(clamped)
    }

    pub(crate) fn contains(&self, tile: TileCoord) -> bool {
        let (x, y) = (i32::from(tile.x()), i32::from(tile.y()));
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }
}

/// Per-map bucket table holding one chain for monsters and one for every
/// other kind.
#[derive(Clone, Debug)]
pub(crate) struct BlockGrid {
    columns: i32,
    rows: i32,
    general: Vec<Option<EntityId>>,
    monsters: Vec<Option<EntityId>>,
}

impl BlockGrid {
    /// Creates an empty grid covering a `width` by `height` map.
    pub(crate) fn new(width: i16, height: i16) -> Self {
        let columns = (i32::from(width) + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let rows = (i32::from(height) + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let count = usize::try_from(columns * rows).unwrap_or(0);
        Self {
            columns,
            rows,
            general: vec![None; count],
            monsters: vec![None; count],
        }
    }

    fn bucket(&self, tile: TileCoord) -> Option<usize> {
        let (bx, by) = (tile.block_x(), tile.block_y());
        if bx < 0 || by < 0 || bx >= self.columns || by >= self.rows {
            return None;
        }
        usize::try_from(bx + by * self.columns).ok()
    }

    fn heads_mut(&mut self, kind: EntityKind) -> &mut [Option<EntityId>] {
        if kind == EntityKind::Monster {
            &mut self.monsters
        } else {
            &mut self.general
        }
    }

    /// Prepends the entity to the chain of the bucket containing its tile.
    ///
    /// Callers validate the tile first; an entity outside the grid or already
    /// linked is left untouched and `false` is returned.
    pub(crate) fn link(&mut self, store: &mut EntityStore, id: EntityId) -> bool {
        let Some(entity) = store.get(id) else {
            return false;
        };
        if entity.is_placed() {
            return false;
        }
        let kind = entity.kind();
        let Some(bucket) = self.bucket(entity.tile()) else {
            return false;
        };

        let heads = self.heads_mut(kind);
        let next = heads[bucket];
        heads[bucket] = Some(id);

        if let Some(next) = next {
            store.set_prev(next, ChainPrev::Entity(id));
        }
        if let Some(entity) = store.get_mut(id) {
            entity.link = Some(ChainLink {
                prev: ChainPrev::Head,
                next,
            });
        }
        true
    }

    /// Detaches the entity from its chain. Returns `false` if it was not
    /// linked.
    pub(crate) fn unlink(&mut self, store: &mut EntityStore, id: EntityId) -> bool {
        let Some(entity) = store.get_mut(id) else {
            return false;
        };
        let Some(link) = entity.link.take() else {
            return false;
        };
        let kind = entity.kind();
        let tile = entity.tile();

        if let Some(next) = link.next {
            store.set_prev(next, link.prev);
        }
        match link.prev {
            ChainPrev::Entity(prev) => store.set_next(prev, link.next),
            ChainPrev::Head => {
                if let Some(bucket) = self.bucket(tile) {
                    self.heads_mut(kind)[bucket] = link.next;
                }
            }
        }
        true
    }

    /// Hands every linked entity inside `rect` selected by `mask` to `sink`.
    ///
    /// The general chains are walked before the monster chains. The walk
    /// stops as soon as `sink` returns `false`, in which case `false` is
    /// returned.
    pub(crate) fn walk<F>(
        &self,
        store: &EntityStore,
        rect: TileRect,
        mask: KindMask,
        mut sink: F,
    ) -> bool
    where
        F: FnMut(&Entity) -> bool,
    {
        let chains: [(&[Option<EntityId>], bool); 2] = [
            (self.general.as_slice(), mask.selects_general()),
            (self.monsters.as_slice(), mask.selects_monsters()),
        ];

        for (heads, selected) in chains {
            if !selected {
                continue;
            }
            for by in rect.y0.div_euclid(BLOCK_SIZE)..=rect.y1.div_euclid(BLOCK_SIZE) {
                for bx in rect.x0.div_euclid(BLOCK_SIZE)..=rect.x1.div_euclid(BLOCK_SIZE) {
                    if bx < 0 || by < 0 || bx >= self.columns || by >= self.rows {
                        continue;
                    }
                    let Ok(bucket) = usize::try_from(bx + by * self.columns) else {
                        continue;
                    };
                    let mut cursor = heads.get(bucket).copied().flatten();
                    while let Some(id) = cursor {
                        let Some(entity) = store.get(id) else {
                            break;
                        };
                        cursor = entity.link.and_then(|link| link.next);
                        if !mask.contains(entity.kind()) || !rect.contains(entity.tile()) {
                            continue;
                        }
                        if !sink(entity) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Rectangle covering every bucket of the grid.
    pub(crate) fn whole_map(&self) -> TileRect {
        TileRect {
            x0: 0,
            y0: 0,
            x1: self.columns * BLOCK_SIZE - 1,
            y1: self.rows * BLOCK_SIZE - 1,
        }
    }
}
