//! Persisted streaming formats
//!
//! Compiled sectors and scenes use a small fourCC-tagged container: a
//! four-byte magic, a format version, and a JSON body with island blobs
//! carried as base64. Scene files reference their sector files by name;
//! loading resolves the references through a caller-supplied resolver.
//!
//! `compile_scene` is the bake-time path: it buckets root islands through
//! the streaming grid and emits one sector per non-empty cell.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{EmberError, Result};
use crate::world::grid::StreamingGrid;
use crate::world::island::StreamingIsland;
use crate::world::StreamingBox;

/// fourCC tag of compiled sector containers.
pub const SECTOR_MAGIC: &[u8; 4] = b"EMSC";
/// fourCC tag of compiled scene containers.
pub const SCENE_MAGIC: &[u8; 4] = b"EMCS";
const FORMAT_VERSION: u32 = 1;

// ============================================================================
// Serialized shapes
// ============================================================================

mod b64 {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize)]
struct IslandData {
    always_loaded: bool,
    streaming_box: StreamingBox,
    entity_count: u32,
    #[serde(with = "b64")]
    packed_data: Vec<u8>,
    unpacked_size: u32,
    children: Vec<IslandData>,
}

impl IslandData {
    fn from_island(island: &StreamingIsland) -> Self {
        Self {
            always_loaded: island.always_loaded,
            streaming_box: island.streaming_box,
            entity_count: island.entity_count,
            packed_data: island.packed_data.clone(),
            unpacked_size: island.unpacked_size,
            children: island.children.iter().map(|c| Self::from_island(c)).collect(),
        }
    }

    fn into_island(self) -> Arc<StreamingIsland> {
        Arc::new(StreamingIsland {
            always_loaded: self.always_loaded,
            streaming_box: self.streaming_box,
            entity_count: self.entity_count,
            packed_data: self.packed_data,
            unpacked_size: self.unpacked_size,
            children: self
                .children
                .into_iter()
                .map(IslandData::into_island)
                .collect(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct SectorFile {
    streaming_box: StreamingBox,
    islands: Vec<IslandData>,
}

#[derive(Serialize, Deserialize)]
struct SceneCellData {
    streaming_box: StreamingBox,
    sector_ref: String,
}

#[derive(Serialize, Deserialize)]
struct SceneFile {
    cells: Vec<SceneCellData>,
}

fn write_container(magic: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn read_container<'a>(magic: &[u8; 4], bytes: &'a [u8]) -> Result<&'a [u8]> {
    if bytes.len() < 8 || &bytes[0..4] != magic {
        return Err(EmberError::BadContainerHeader {
            expected: String::from_utf8_lossy(magic).into_owned(),
            found: String::from_utf8_lossy(bytes.get(0..4).unwrap_or_default()).into_owned(),
        });
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().expect("checked length"));
    if version != FORMAT_VERSION {
        return Err(EmberError::BadContainerHeader {
            expected: format!("version {FORMAT_VERSION}"),
            found: format!("version {version}"),
        });
    }
    Ok(&bytes[8..])
}

// ============================================================================
// Runtime types
// ============================================================================

/// One compiled sector: the islands of one grid cell.
pub struct CompiledSector {
    pub streaming_box: StreamingBox,
    pub islands: Vec<Arc<StreamingIsland>>,
}

impl CompiledSector {
    /// Serialize into the fourCC container.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let file = SectorFile {
            streaming_box: self.streaming_box,
            islands: self.islands.iter().map(|i| IslandData::from_island(i)).collect(),
        };
        let body = serde_json::to_vec(&file).expect("sector file always serializes");
        write_container(SECTOR_MAGIC, &body)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let body = read_container(SECTOR_MAGIC, bytes)?;
        let file: SectorFile = serde_json::from_slice(body)?;
        Ok(Self {
            streaming_box: file.streaming_box,
            islands: file
                .islands
                .into_iter()
                .map(IslandData::into_island)
                .collect(),
        })
    }
}

/// One cell of a compiled scene.
pub struct StreamingCell {
    pub streaming_box: StreamingBox,
    pub sector_ref: String,
    pub sector: Arc<CompiledSector>,
}

/// A compiled scene: streaming cells with their sectors resolved.
pub struct CompiledScene {
    pub cells: Vec<StreamingCell>,
}

impl CompiledScene {
    /// Every root island across all sectors, in cell order.
    pub fn root_islands(&self) -> impl Iterator<Item = &Arc<StreamingIsland>> {
        self.cells
            .iter()
            .flat_map(|cell| cell.sector.islands.iter())
    }

    /// Serialize the scene container (cells + sector references only; the
    /// sectors persist in their own files).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let file = SceneFile {
            cells: self
                .cells
                .iter()
                .map(|cell| SceneCellData {
                    streaming_box: cell.streaming_box,
                    sector_ref: cell.sector_ref.clone(),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&file).expect("scene file always serializes");
        write_container(SCENE_MAGIC, &body)
    }

    /// Load a scene container, resolving each sector reference through
    /// `resolve_sector`.
    pub fn from_bytes(
        bytes: &[u8],
        mut resolve_sector: impl FnMut(&str) -> Result<Arc<CompiledSector>>,
    ) -> Result<Self> {
        let body = read_container(SCENE_MAGIC, bytes)?;
        let file: SceneFile = serde_json::from_slice(body)?;
        let mut cells = Vec::with_capacity(file.cells.len());
        for cell in file.cells {
            let sector = resolve_sector(&cell.sector_ref)?;
            cells.push(StreamingCell {
                streaming_box: cell.streaming_box,
                sector_ref: cell.sector_ref,
                sector,
            });
        }
        Ok(Self { cells })
    }
}

// ============================================================================
// Bake
// ============================================================================

/// Compile root islands into a scene: bucket them through the streaming
/// grid and emit one sector per non-empty cell. Hot (small) and cold
/// (large, always-loaded) content separate naturally into different levels.
#[must_use]
pub fn compile_scene(islands: &[Arc<StreamingIsland>], base_cell_size: f32) -> CompiledScene {
    let mut grid = StreamingGrid::new(base_cell_size);
    for (index, island) in islands.iter().enumerate() {
        grid.insert(index as u32, &island.streaming_box);
    }

    let mut cells = Vec::new();
    for (coord, members) in grid.non_empty_cells() {
        let sector_islands: Vec<Arc<StreamingIsland>> = members
            .iter()
            .map(|&index| Arc::clone(&islands[index as usize]))
            .collect();

        let streaming_box = sector_islands
            .iter()
            .map(|island| island.streaming_box)
            .reduce(|a, b| a.union(&b))
            .expect("non-empty cell has islands");

        cells.push(StreamingCell {
            streaming_box,
            sector_ref: format!("sector_{}_{}_{}.emsc", coord.level, coord.x, coord.y),
            sector: Arc::new(CompiledSector {
                streaming_box,
                islands: sector_islands,
            }),
        });
    }

    // Deterministic output regardless of hash-map iteration order.
    cells.sort_by(|a, b| a.sector_ref.cmp(&b.sector_ref));
    CompiledScene { cells }
}
