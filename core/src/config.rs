use serde::Deserialize;

/// Tunables consumed by the world. Loaded by the surrounding code and
/// passed in already validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorldConfig {
    /// Maximum number of characters allowed on one tile before it counts as
    /// stacked. `None` disables occupancy tracking.
    pub stack_limit: Option<u16>,
    /// Filter range queries by circular distance instead of the bounding
    /// square.
    pub circular_area: bool,
    /// Apply the line-of-sight check in configured range and area queries.
    pub skill_wall_check: bool,
    /// Let directional queries hit entities standing on the origin tile.
    pub eightpath_same_cell: bool,
    /// Maximum number of candidates a single query collects.
    pub candidate_capacity: usize,
    /// Maximum number of releases deferred while queries are in flight.
    pub deferred_capacity: usize,
    /// Size of the map slot table shared by loaded maps and instances.
    pub max_map_slots: usize,
    /// Largest tile count a single map may have.
    pub max_map_tiles: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            stack_limit: None,
            circular_area: true,
            skill_wall_check: true,
            eightpath_same_cell: true,
            candidate_capacity: 65_536,
            deferred_capacity: 65_536,
            max_map_slots: 1_500,
            max_map_tiles: 512 * 512,
        }
    }
}
