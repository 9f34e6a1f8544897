#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Command-line adapter that boots an Atlas map server world.

mod config;

use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use atlas_system_instance_expiry::{Expiry, InstanceExpiry};
use atlas_system_map_cache::{encode, search, MapCache};
use atlas_world::{query, LoadReport, World};
use clap::{Parser, Subcommand};

use crate::config::ServerConfig;

/// Boots a map server world from its TOML configuration.
#[derive(Debug, Parser)]
#[command(name = "atlas", version)]
struct Cli {
    /// Path of the server configuration.
    #[arg(short, long, default_value = "atlas.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load every configured map and print one line per map.
    Summary,
    /// Write the configured maps into a single world cache.
    Pack {
        /// Destination of the packed cache.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Open the configured instances and advance the lease clock.
    Simulate {
        /// Number of clock ticks to run.
        #[arg(long, default_value_t = 10)]
        ticks: u32,
        /// Seconds that pass per tick.
        #[arg(long, default_value_t = 60)]
        step: u64,
    },
}

/// Entry point for the Atlas command-line interface.
fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = config::load(&cli.config)?;
    let caches = read_caches(&config)?;

    match cli.command.unwrap_or(Command::Summary) {
        Command::Summary => {
            let (world, report) = boot(&config, &caches);
            summarize(&world, &report)
        }
        Command::Pack { output } => pack(&config, &caches, &output),
        Command::Simulate { ticks, step } => {
            let (mut world, _) = boot(&config, &caches);
            simulate(&mut world, &config, ticks, Duration::from_secs(step))
        }
    }
}

fn read_caches(config: &ServerConfig) -> Result<Vec<MapCache>> {
    let mut caches = Vec::with_capacity(config.cache_files.len());
    for path in &config.cache_files {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(error) => {
                log::warn!("skipping world cache {}: {error}", path.display());
                continue;
            }
        };
        match MapCache::parse(bytes) {
            Ok(cache) => {
                log::debug!("world cache {} holds {} maps", path.display(), cache.len());
                caches.push(cache);
            }
            Err(error) => log::warn!("skipping world cache {}: {error}", path.display()),
        }
    }
    if caches.is_empty() {
        bail!("none of the configured world caches could be read");
    }
    Ok(caches)
}

fn boot(config: &ServerConfig, caches: &[MapCache]) -> (World, LoadReport) {
    let mut world = World::new(config.world);
    let max_tiles = config.world.max_map_tiles;
    let report = world.load_maps(&config.maps, |name| search(caches, name, max_tiles));
    (world, report)
}

fn summarize(world: &World, report: &LoadReport) -> Result<()> {
    for &map in report.loaded() {
        let name = query::map_name(world, map)?;
        let (width, height) = query::map_size(world, map)?;
        println!("{:>4} {name:<12} {width}x{height}", map.get());
    }
    for name in report.dropped() {
        println!("   - {name:<12} dropped");
    }
    println!(
        "{} maps loaded, {} dropped",
        report.loaded().len(),
        report.dropped().len()
    );
    Ok(())
}

fn pack(config: &ServerConfig, caches: &[MapCache], output: &Path) -> Result<()> {
    let max_tiles = config.world.max_map_tiles;
    let maps: Vec<_> = config
        .maps
        .iter()
        .filter_map(|name| {
            let geometry = search(caches, name, max_tiles);
            if geometry.is_none() {
                log::warn!("map '{name}' is not packed, no cache holds a usable copy");
            }
            geometry
        })
        .collect();
    let bytes = encode(&maps).context("failed to encode world cache")?;
    fs::write(output, &bytes)
        .with_context(|| format!("failed to write world cache {}", output.display()))?;
    println!(
        "packed {} maps into {} ({} bytes)",
        maps.len(),
        output.display(),
        bytes.len()
    );
    Ok(())
}

fn simulate(world: &mut World, config: &ServerConfig, ticks: u32, step: Duration) -> Result<()> {
    for instance in &config.instances {
        let Some(source) = query::map_id(world, &instance.source) else {
            log::warn!("instance source '{}' is not loaded", instance.source);
            continue;
        };
        let map = world
            .create_instance(source, instance.owner(), instance.mode(), Duration::ZERO)
            .with_context(|| format!("failed to create an instance of '{}'", instance.source))?;
        println!("opened {}", query::map_name(world, map)?);
    }

    let expiry = InstanceExpiry::new();
    let mut expired: Vec<Expiry> = Vec::new();
    for tick in 1..=ticks {
        let now = step * tick;
        let views = world.instance_views(now);
        expiry.handle(now, &views, &mut expired);
        for entry in &expired {
            let name = query::map_name(world, entry.map)?.to_owned();
            world
                .destroy_instance(entry.map, |world, id| {
                    let _ = world.remove(id);
                })
                .with_context(|| format!("failed to destroy instance '{name}'"))?;
            println!("tick {tick}: closed {name} ({:?})", entry.reason);
        }
        let sweep = world.maintain();
        if sweep.recovered_lock || sweep.reclaimed > 0 {
            log::info!("tick {tick}: maintenance {sweep:?}");
        }
    }
    println!("{} instances still open", world.instance_views(step * ticks).len());
    Ok(())
}
