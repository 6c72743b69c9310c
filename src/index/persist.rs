//! On-disk layout for the vector index.
//!
//! Two files in the index directory, both bincode, both rewritten
//! atomically (write to a temp file in the same directory, then rename):
//! `index.bin` carries the vector data and IVF structure, `mapping.bin`
//! carries the application-id ↔ internal-id map. Startup loads only when
//! both files exist and parse; anything else starts fresh.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::IndexError;

pub const INDEX_FILE: &str = "index.bin";
pub const MAPPING_FILE: &str = "mapping.bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfSnapshot {
    /// `nlist * dim` normalized centroids.
    pub centroids: Vec<f32>,
    /// Row indices per centroid list (rows may appear in several lists).
    pub lists: Vec<Vec<u32>>,
    /// Max angle (radians) between each centroid and its list members;
    /// drives the search-completion bound.
    pub radii: Vec<f32>,
}

/// Complete index state; also the payload of `snapshot()`/`restore()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub dim: usize,
    /// `dim`-strided row storage, tombstoned rows included.
    pub vectors: Vec<f32>,
    pub row_app: Vec<Uuid>,
    pub row_internal: Vec<i64>,
    pub deleted: Vec<bool>,
    pub next_internal: i64,
    pub ivf: Option<IvfSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSnapshot {
    /// application id → internal id, live rows only.
    pub pairs: Vec<(Uuid, i64)>,
    pub next_internal: i64,
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), IndexError> {
    fs::create_dir_all(dir)
        .map_err(|e| IndexError::Persistence(format!("create {}: {e}", dir.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| IndexError::Persistence(format!("temp file in {}: {e}", dir.display())))?;
    tmp.write_all(bytes)
        .map_err(|e| IndexError::Persistence(format!("write {name}: {e}")))?;
    tmp.persist(dir.join(name))
        .map_err(|e| IndexError::Persistence(format!("rename {name}: {e}")))?;
    Ok(())
}

pub fn save(dir: &Path, index: &IndexSnapshot, mapping: &MappingSnapshot) -> Result<(), IndexError> {
    let index_bytes = bincode::serialize(index)
        .map_err(|e| IndexError::Persistence(format!("encode index: {e}")))?;
    let mapping_bytes = bincode::serialize(mapping)
        .map_err(|e| IndexError::Persistence(format!("encode mapping: {e}")))?;
    write_atomic(dir, INDEX_FILE, &index_bytes)?;
    write_atomic(dir, MAPPING_FILE, &mapping_bytes)?;
    Ok(())
}

/// Load both files. `Ok(None)` means a fresh start (files missing);
/// a parse failure is surfaced so the caller can log and start fresh.
pub fn load(dir: &Path) -> Result<Option<(IndexSnapshot, MappingSnapshot)>, IndexError> {
    let index_path: PathBuf = dir.join(INDEX_FILE);
    let mapping_path: PathBuf = dir.join(MAPPING_FILE);
    if !index_path.exists() || !mapping_path.exists() {
        return Ok(None);
    }

    let index_bytes = fs::read(&index_path)
        .map_err(|e| IndexError::Persistence(format!("read {}: {e}", index_path.display())))?;
    let mapping_bytes = fs::read(&mapping_path)
        .map_err(|e| IndexError::Persistence(format!("read {}: {e}", mapping_path.display())))?;

    let index: IndexSnapshot = bincode::deserialize(&index_bytes)
        .map_err(|e| IndexError::Corrupt(format!("index file: {e}")))?;
    let mapping: MappingSnapshot = bincode::deserialize(&mapping_bytes)
        .map_err(|e| IndexError::Corrupt(format!("mapping file: {e}")))?;

    // Cross-check the two files.
    let live = index.deleted.iter().filter(|d| !**d).count();
    if mapping.pairs.len() != live || mapping.next_internal != index.next_internal {
        return Err(IndexError::Corrupt(
            "index and mapping files disagree".to_string(),
        ));
    }
    Ok(Some((index, mapping)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (IndexSnapshot, MappingSnapshot) {
        let app = Uuid::new_v4();
        (
            IndexSnapshot {
                dim: 4,
                vectors: vec![1.0, 0.0, 0.0, 0.0],
                row_app: vec![app],
                row_internal: vec![0],
                deleted: vec![false],
                next_internal: 1,
                ivf: None,
            },
            MappingSnapshot {
                pairs: vec![(app, 0)],
                next_internal: 1,
            },
        )
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mapping) = sample();
        save(dir.path(), &index, &mapping).unwrap();

        let (loaded_index, loaded_mapping) = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded_index.vectors, index.vectors);
        assert_eq!(loaded_mapping.pairs, mapping.pairs);
    }

    #[test]
    fn missing_files_mean_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn one_file_missing_means_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mapping) = sample();
        save(dir.path(), &index, &mapping).unwrap();
        fs::remove_file(dir.path().join(MAPPING_FILE)).unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (index, mapping) = sample();
        save(dir.path(), &index, &mapping).unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"not bincode").unwrap();
        assert!(matches!(load(dir.path()), Err(IndexError::Corrupt(_))));
    }
}
