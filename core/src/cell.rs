use serde::{Deserialize, Serialize};

/// Number of terrain types a world cache may contain.
pub const TERRAIN_TYPE_COUNT: usize = 7;

/// Individual flag stored on a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellFlag {
    /// Characters may stand on the tile.
    Walkable,
    /// Projectiles and sight pass over the tile.
    Shootable,
    /// The tile is water.
    Water,
    /// The tile lies inside an NPC trigger area.
    Npc,
    /// The tile lies inside a basilica zone.
    Basilica,
    /// The tile lies inside a land protector zone.
    LandProtector,
    /// Vending shops cannot be opened on the tile.
    NoVending,
    /// Buying stores cannot be opened on the tile.
    NoBuyingStore,
    /// Chat rooms cannot be opened on the tile.
    NoChat,
    /// The tile lies inside a maelstrom zone.
    Maelstrom,
    /// The tile is covered by an ice wall.
    IceWall,
}

impl CellFlag {
    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// Question that can be asked about a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellCheck {
    /// The tile is walkable.
    Walkable,
    /// The tile is shootable.
    Shootable,
    /// The tile is water.
    Water,
    /// The tile is inside an NPC trigger area.
    Npc,
    /// The tile is inside a basilica zone.
    Basilica,
    /// The tile is inside a land protector zone.
    LandProtector,
    /// The tile forbids vending.
    NoVending,
    /// The tile forbids buying stores.
    NoBuyingStore,
    /// The tile forbids chat rooms.
    NoChat,
    /// The tile is inside a maelstrom zone.
    Maelstrom,
    /// The tile is covered by an ice wall.
    IceWall,
    /// Neither walkable nor shootable.
    Wall,
    /// Not walkable but shootable.
    Cliff,
    /// Walkable, authoritative for path finding.
    Reachable,
    /// Not walkable.
    NoReach,
    /// Walkable and, when a stack limit is configured, below that limit.
    Passable,
    /// Inverse of [`CellCheck::Passable`].
    NoPass,
    /// Occupancy reached the configured stack limit.
    Stacked,
}

impl CellCheck {
    /// Answer given for tiles outside the map, which count as solid.
    #[must_use]
    pub const fn outside_answer(self) -> bool {
        matches!(self, CellCheck::NoPass | CellCheck::NoReach | CellCheck::Wall)
    }
}

/// State of a single tile: flag bits and the character occupancy counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Cell {
    flags: u16,
    occupancy: u16,
}

const fn preset(walkable: bool, shootable: bool, water: bool) -> Cell {
    let mut flags = 0;
    if walkable {
        flags |= CellFlag::Walkable.bit();
    }
    if shootable {
        flags |= CellFlag::Shootable.bit();
    }
    if water {
        flags |= CellFlag::Water.bit();
    }
    Cell {
        flags,
        occupancy: 0,
    }
}

/// Geometry preset for every terrain type found in world caches.
///
/// Type 1 is solid wall, 3 walkable water and 5 a cliff that can be shot
/// over. Types 2, 4 and 6 are legacy aliases of open ground.
pub const TERRAIN_PRESETS: [Cell; TERRAIN_TYPE_COUNT] = [
    preset(true, true, false),
    preset(false, false, false),
    preset(true, true, false),
    preset(true, true, true),
    preset(true, true, false),
    preset(false, true, false),
    preset(true, true, false),
];

const GEOMETRY_MASK: u16 =
    CellFlag::Walkable.bit() | CellFlag::Shootable.bit() | CellFlag::Water.bit();

impl Cell {
    /// Solid tile with no flags set.
    pub const SOLID: Cell = Cell {
        flags: 0,
        occupancy: 0,
    };

    /// Builds the tile for a terrain type, if the type is known.
    #[must_use]
    pub fn from_terrain(terrain: u8) -> Option<Cell> {
        TERRAIN_PRESETS.get(usize::from(terrain)).copied()
    }

    /// Canonical terrain type describing the tile geometry.
    ///
    /// Combinations without a preset report solid wall.
    #[must_use]
    pub const fn terrain(&self) -> u8 {
        let walkable = self.is(CellFlag::Walkable);
        let shootable = self.is(CellFlag::Shootable);
        let water = self.is(CellFlag::Water);
        match (walkable, shootable, water) {
            (true, true, false) => 0,
            (false, false, false) => 1,
            (true, true, true) => 3,
            (false, true, false) => 5,
            _ => 1,
        }
    }

    /// Replaces the geometry flags with the preset for `terrain`, keeping
    /// zone flags and occupancy. Returns `false` for unknown types.
    pub fn apply_terrain(&mut self, terrain: u8) -> bool {
        match Cell::from_terrain(terrain) {
            Some(preset) => {
                self.flags = (self.flags & !GEOMETRY_MASK) | preset.flags;
                true
            }
            None => false,
        }
    }

    /// Reports whether the flag is set.
    #[must_use]
    pub const fn is(&self, flag: CellFlag) -> bool {
        self.flags & flag.bit() != 0
    }

    /// Sets or clears a flag. Occupancy is never touched.
    pub fn set(&mut self, flag: CellFlag, value: bool) {
        if value {
            self.flags |= flag.bit();
        } else {
            self.flags &= !flag.bit();
        }
    }

    /// Number of character-class entities standing on the tile.
    #[must_use]
    pub const fn occupancy(&self) -> u16 {
        self.occupancy
    }

    /// Records one more character on the tile.
    pub fn enter(&mut self) {
        self.occupancy = self.occupancy.saturating_add(1);
    }

    /// Records one character leaving the tile.
    pub fn leave(&mut self) {
        self.occupancy = self.occupancy.saturating_sub(1);
    }

    /// Tile with the same flags and an empty occupancy counter.
    #[must_use]
    pub const fn vacated(&self) -> Cell {
        Cell {
            flags: self.flags,
            occupancy: 0,
        }
    }

    /// Answers a tile question. `stack_limit` enables the no-stacking rule.
    #[must_use]
    pub fn check(&self, check: CellCheck, stack_limit: Option<u16>) -> bool {
        let stacked = stack_limit.is_some_and(|limit| self.occupancy >= limit);
        let walkable = self.is(CellFlag::Walkable);
        let shootable = self.is(CellFlag::Shootable);
        match check {
            CellCheck::Walkable | CellCheck::Reachable => walkable,
            CellCheck::Shootable => shootable,
            CellCheck::Water => self.is(CellFlag::Water),
            CellCheck::Npc => self.is(CellFlag::Npc),
            CellCheck::Basilica => self.is(CellFlag::Basilica),
            CellCheck::LandProtector => self.is(CellFlag::LandProtector),
            CellCheck::NoVending => self.is(CellFlag::NoVending),
            CellCheck::NoBuyingStore => self.is(CellFlag::NoBuyingStore),
            CellCheck::NoChat => self.is(CellFlag::NoChat),
            CellCheck::Maelstrom => self.is(CellFlag::Maelstrom),
            CellCheck::IceWall => self.is(CellFlag::IceWall),
            CellCheck::Wall => !walkable && !shootable,
            CellCheck::Cliff => !walkable && shootable,
            CellCheck::NoReach => !walkable,
            CellCheck::Passable => walkable && !stacked,
            CellCheck::NoPass => !walkable || stacked,
            CellCheck::Stacked => stacked,
        }
    }
}

/// Static geometry of a map as stored in a world cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapGeometry {
    name: String,
    width: i16,
    height: i16,
    cells: Vec<Cell>,
}

impl MapGeometry {
    /// Creates map geometry from a row-major tile vector.
    ///
    /// Returns `None` when the dimensions are not positive or do not match
    /// the number of tiles provided.
    #[must_use]
    pub fn new(name: impl Into<String>, width: i16, height: i16, cells: Vec<Cell>) -> Option<Self> {
        if width <= 0 || height <= 0 {
            return None;
        }
        if cells.len() != usize::from(width.unsigned_abs()) * usize::from(height.unsigned_abs()) {
            return None;
        }
        Some(Self {
            name: name.into(),
            width,
            height,
            cells,
        })
    }

    /// Creates geometry where every tile uses the same terrain type.
    #[must_use]
    pub fn filled(name: impl Into<String>, width: i16, height: i16, terrain: u8) -> Option<Self> {
        let cell = Cell::from_terrain(terrain)?;
        let count = usize::try_from(i32::from(width) * i32::from(height)).ok()?;
        Self::new(name, width, height, vec![cell; count])
    }

    /// Name of the map.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width of the map in tiles.
    #[must_use]
    pub const fn width(&self) -> i16 {
        self.width
    }

    /// Height of the map in tiles.
    #[must_use]
    pub const fn height(&self) -> i16 {
        self.height
    }

    /// Row-major tiles of the map.
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Consumes the geometry and returns its parts.
    #[must_use]
    pub fn into_parts(self) -> (String, i16, i16, Vec<Cell>) {
        (self.name, self.width, self.height, self.cells)
    }
}
