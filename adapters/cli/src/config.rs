//! TOML configuration read by the command-line adapter.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use atlas_core::{InstanceMode, LeaseOwner, OwnerKind, WorldConfig};
use serde::Deserialize;

/// Complete server configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServerConfig {
    /// World tunables.
    #[serde(default)]
    pub(crate) world: WorldConfig,
    /// Maps to load, in load order.
    pub(crate) maps: Vec<String>,
    /// World cache files searched in order for every map.
    pub(crate) cache_files: Vec<PathBuf>,
    /// Instances created when simulating the lease clock.
    #[serde(default)]
    pub(crate) instances: Vec<InstanceConfig>,
}

/// Instance lease opened by the `simulate` command.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct InstanceConfig {
    /// Name of the map to clone.
    pub(crate) source: String,
    owner: OwnerKind,
    owner_id: u32,
    #[serde(default)]
    copy_map_flags: bool,
    keep_seconds: Option<u64>,
    idle_seconds: Option<u64>,
}

impl InstanceConfig {
    /// Owner of the lease.
    pub(crate) fn owner(&self) -> LeaseOwner {
        LeaseOwner::new(self.owner, self.owner_id)
    }

    /// Creation options and limits of the lease.
    pub(crate) fn mode(&self) -> InstanceMode {
        InstanceMode {
            copy_map_flags: self.copy_map_flags,
            keep_limit: self.keep_seconds.map(Duration::from_secs),
            idle_limit: self.idle_seconds.map(Duration::from_secs),
        }
    }
}

/// Reads and validates the configuration stored at `path`.
///
/// Relative cache paths are resolved against the directory holding the
/// configuration file.
pub(crate) fn load(path: &Path) -> Result<ServerConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration {}", path.display()))?;
    let mut config =
        parse(&text).with_context(|| format!("invalid configuration {}", path.display()))?;
    if let Some(base) = path.parent() {
        for file in &mut config.cache_files {
            if file.is_relative() {
                *file = base.join(&*file);
            }
        }
    }
    Ok(config)
}

fn parse(text: &str) -> Result<ServerConfig> {
    let config: ServerConfig = toml::from_str(text)?;
    if config.cache_files.is_empty() {
        bail!("at least one cache file is required");
    }
    if config.world.candidate_capacity == 0 {
        bail!("world.candidate_capacity must be positive");
    }
    if config.world.max_map_slots == 0 || config.world.max_map_slots > usize::from(u16::MAX) {
        bail!("world.max_map_slots must be between 1 and {}", u16::MAX);
    }
    if config.world.stack_limit == Some(0) {
        bail!("world.stack_limit must be positive when set");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
maps = ["prontera", "izlude"]
cache_files = ["db/map_cache.dat", "db/import/map_cache.dat"]

[world]
stack_limit = 2
circular_area = false

[[instances]]
source = "1@tower"
owner = "Party"
owner_id = 42
keep_seconds = 3600
idle_seconds = 300
"#;

    #[test]
    fn sample_configuration_parses() {
        let config = parse(SAMPLE).expect("valid configuration");
        assert_eq!(config.maps, ["prontera", "izlude"]);
        assert_eq!(config.cache_files.len(), 2);
        assert_eq!(config.world.stack_limit, Some(2));
        assert!(!config.world.circular_area);
        assert!(config.world.skill_wall_check, "omitted keys keep defaults");

        let instance = &config.instances[0];
        assert_eq!(instance.source, "1@tower");
        assert_eq!(instance.owner(), LeaseOwner::new(OwnerKind::Party, 42));
        assert_eq!(
            instance.mode(),
            InstanceMode {
                copy_map_flags: false,
                keep_limit: Some(Duration::from_secs(3_600)),
                idle_limit: Some(Duration::from_secs(300)),
            }
        );
    }

    #[test]
    fn world_section_is_optional() {
        let config = parse("maps = []\ncache_files = [\"a.dat\"]\n").expect("valid configuration");
        assert_eq!(config.world, WorldConfig::default());
        assert!(config.instances.is_empty());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = "maps = []\ncache_files = [\"a.dat\"]\n";
        assert!(parse("maps = []\ncache_files = []\n").is_err());
        assert!(parse(&format!("{base}extra = 1\n")).is_err());
        assert!(parse(&format!("{base}[world]\nmax_map_slots = 0\n")).is_err());
        assert!(parse(&format!("{base}[world]\nstack_limit = 0\n")).is_err());
    }
}
