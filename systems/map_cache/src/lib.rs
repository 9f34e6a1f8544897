#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Reader and writer for world cache files.
//!
//! A world cache starts with an eight byte header: the total file size as a
//! little-endian `u32`, the number of maps as a `u16` and two bytes of
//! padding. Every map follows as a twenty byte record header (a NUL padded
//! twelve byte name, `i16` width, `i16` height and `i32` payload length) and
//! a zlib stream holding one terrain byte per tile in row-major order.

use std::{
    io::{Read, Write},
    ops::Range,
};

use atlas_core::{Cell, MapGeometry, MAP_NAME_LENGTH};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

const HEADER_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = MAP_NAME_LENGTH + 8;

/// Errors reported while reading or writing world caches.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The buffer is too short to hold the structure being read.
    #[error("cache is truncated: needed {needed} bytes at offset {offset}")]
    Truncated {
        /// Offset of the structure that could not be read.
        offset: usize,
        /// Number of bytes the structure needs.
        needed: usize,
    },
    /// The header declares a different file size than was read.
    #[error("cache header declares {declared} bytes but {actual} were read")]
    SizeMismatch {
        /// Size recorded in the header.
        declared: u32,
        /// Size of the buffer.
        actual: usize,
    },
    /// A record declares a negative payload length.
    #[error("map '{0}' declares a negative payload length")]
    NegativePayload(String),
    /// No record carries the requested name.
    #[error("map '{0}' is not in the cache")]
    NotFound(String),
    /// The record dimensions are not positive.
    #[error("map '{name}' has invalid dimensions {width}x{height}")]
    InvalidDimensions {
        /// Name of the map.
        name: String,
        /// Declared width.
        width: i16,
        /// Declared height.
        height: i16,
    },
    /// The record has more tiles than the caller allows.
    #[error("map '{name}' has {tiles} tiles, the limit is {limit}")]
    Oversized {
        /// Name of the map.
        name: String,
        /// Tile count of the map.
        tiles: usize,
        /// Largest accepted tile count.
        limit: usize,
    },
    /// The payload did not inflate to exactly one byte per tile.
    #[error("map '{name}' inflated to {actual} bytes, expected {expected}")]
    PayloadSize {
        /// Name of the map.
        name: String,
        /// Tile count of the map.
        expected: usize,
        /// Number of bytes produced by the payload.
        actual: usize,
    },
    /// The payload is not a valid zlib stream.
    #[error("map '{name}' payload could not be inflated: {source}")]
    Corrupt {
        /// Name of the map.
        name: String,
        /// Error reported by the decoder.
        source: std::io::Error,
    },
    /// A map name does not fit the fixed-size name field.
    #[error("map name '{0}' is longer than {limit} bytes", limit = MAP_NAME_LENGTH - 1)]
    NameTooLong(String),
    /// More maps were supplied than the header can count.
    #[error("{0} maps do not fit in a single cache")]
    TooManyMaps(usize),
    /// The cache would exceed the sizes the format can record.
    #[error("cache exceeds the format limit of {0} bytes")]
    TooLarge(u64),
    /// Compressing a payload failed.
    #[error("failed to compress map '{name}': {source}")]
    Compression {
        /// Name of the map.
        name: String,
        /// Error reported by the encoder.
        source: std::io::Error,
    },
}

#[derive(Clone, Debug)]
struct CacheRecord {
    name: String,
    width: i16,
    height: i16,
    payload: Range<usize>,
}

/// Parsed world cache whose maps are decoded on demand.
#[derive(Clone, Debug)]
pub struct MapCache {
    bytes: Vec<u8>,
    records: Vec<CacheRecord>,
}

impl MapCache {
    /// Validates the header and the framing of every record.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, CacheError> {
        let header = read_array::<HEADER_LEN>(&bytes, 0)?;
        let declared = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if usize::try_from(declared).ok() != Some(bytes.len()) {
            return Err(CacheError::SizeMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        let map_count = u16::from_le_bytes([header[4], header[5]]);

        let mut records = Vec::with_capacity(usize::from(map_count));
        let mut offset = HEADER_LEN;
        for _ in 0..map_count {
            let raw = read_array::<RECORD_HEADER_LEN>(&bytes, offset)?;
            let name_field = &raw[..MAP_NAME_LENGTH];
            let name_end = name_field
                .iter()
                .position(|byte| *byte == 0)
                .unwrap_or(MAP_NAME_LENGTH);
            let name = String::from_utf8_lossy(&name_field[..name_end]).into_owned();
            let fields = &raw[MAP_NAME_LENGTH..];
            let width = i16::from_le_bytes([fields[0], fields[1]]);
            let height = i16::from_le_bytes([fields[2], fields[3]]);
            let length = i32::from_le_bytes([fields[4], fields[5], fields[6], fields[7]]);
            let length =
                usize::try_from(length).map_err(|_| CacheError::NegativePayload(name.clone()))?;

            let start = offset + RECORD_HEADER_LEN;
            let end = start
                .checked_add(length)
                .filter(|end| *end <= bytes.len())
                .ok_or(CacheError::Truncated {
                    offset: start,
                    needed: length,
                })?;
            records.push(CacheRecord {
                name,
                width,
                height,
                payload: start..end,
            });
            offset = end;
        }

        if offset != bytes.len() {
            log::debug!("world cache has {} trailing bytes", bytes.len() - offset);
        }
        Ok(Self { bytes, records })
    }

    /// Number of maps stored in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Reports whether the cache holds no maps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Names of the stored maps in file order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.records.iter().map(|record| record.name.as_str())
    }

    /// Decodes the geometry of the first map named `name`.
    ///
    /// Tile bytes without a terrain preset are left solid; they are counted
    /// and reported once per map.
    pub fn decode(&self, name: &str, max_tiles: usize) -> Result<MapGeometry, CacheError> {
        let record = self
            .records
            .iter()
            .find(|record| record.name == name)
            .ok_or_else(|| CacheError::NotFound(name.to_owned()))?;

        let invalid_dimensions = || CacheError::InvalidDimensions {
            name: name.to_owned(),
            width: record.width,
            height: record.height,
        };
        if record.width <= 0 || record.height <= 0 {
            return Err(invalid_dimensions());
        }
        let tiles =
            usize::from(record.width.unsigned_abs()) * usize::from(record.height.unsigned_abs());
        if tiles > max_tiles {
            return Err(CacheError::Oversized {
                name: name.to_owned(),
                tiles,
                limit: max_tiles,
            });
        }

        let mut terrain = Vec::with_capacity(tiles);
        let _ = ZlibDecoder::new(&self.bytes[record.payload.clone()])
            .take(tiles as u64 + 1)
            .read_to_end(&mut terrain)
            .map_err(|source| CacheError::Corrupt {
                name: name.to_owned(),
                source,
            })?;
        if terrain.len() != tiles {
            return Err(CacheError::PayloadSize {
                name: name.to_owned(),
                expected: tiles,
                actual: terrain.len(),
            });
        }

        let mut unknown = 0_usize;
        let cells = terrain
            .iter()
            .map(|byte| {
                Cell::from_terrain(*byte).unwrap_or_else(|| {
                    unknown += 1;
                    Cell::SOLID
                })
            })
            .collect();
        if unknown > 0 {
            log::warn!("map '{name}' contains {unknown} tiles of unknown terrain, left solid");
        }

        MapGeometry::new(name, record.width, record.height, cells).ok_or_else(invalid_dimensions)
    }
}

/// Searches `caches` in order and decodes the first usable entry for `name`.
///
/// Entries that are present but unusable are logged and the search moves on
/// to the next cache. `None` means no cache could provide the map.
#[must_use]
pub fn search(caches: &[MapCache], name: &str, max_tiles: usize) -> Option<MapGeometry> {
    for cache in caches {
        match cache.decode(name, max_tiles) {
            Ok(geometry) => return Some(geometry),
            Err(CacheError::NotFound(_)) => {}
            Err(error) => log::warn!("skipping cached copy of '{name}': {error}"),
        }
    }
    None
}

/// Serialises maps into a world cache, storing every tile as its canonical
/// terrain type.
pub fn encode(maps: &[MapGeometry]) -> Result<Vec<u8>, CacheError> {
    let map_count = u16::try_from(maps.len()).map_err(|_| CacheError::TooManyMaps(maps.len()))?;

    let mut bytes = vec![0; HEADER_LEN];
    for map in maps {
        let name = map.name().as_bytes();
        if name.len() >= MAP_NAME_LENGTH {
            return Err(CacheError::NameTooLong(map.name().to_owned()));
        }
        let compression_error = |source| CacheError::Compression {
            name: map.name().to_owned(),
            source,
        };

        let terrain: Vec<u8> = map.cells().iter().map(Cell::terrain).collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&terrain).map_err(compression_error)?;
        let payload = encoder.finish().map_err(compression_error)?;
        let length = i32::try_from(payload.len())
            .map_err(|_| CacheError::TooLarge(i32::MAX.unsigned_abs().into()))?;

        let mut name_field = [0_u8; MAP_NAME_LENGTH];
        name_field[..name.len()].copy_from_slice(name);
        bytes.extend_from_slice(&name_field);
        bytes.extend_from_slice(&map.width().to_le_bytes());
        bytes.extend_from_slice(&map.height().to_le_bytes());
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.extend_from_slice(&payload);
    }

    let total = u32::try_from(bytes.len()).map_err(|_| CacheError::TooLarge(u32::MAX.into()))?;
    bytes[..4].copy_from_slice(&total.to_le_bytes());
    bytes[4..6].copy_from_slice(&map_count.to_le_bytes());
    Ok(bytes)
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], CacheError> {
    bytes
        .get(offset..offset + N)
        .and_then(|slice| <[u8; N]>::try_from(slice).ok())
        .ok_or(CacheError::Truncated { offset, needed: N })
}
