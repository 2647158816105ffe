//! Flat cosine vector index.
//!
//! Vectors are stored L2-normalised in one contiguous buffer, one slot per
//! insert. Removal only tombstones a slot; space is reclaimed by building a
//! fresh index. Not safe for concurrent use: the owner serializes access.

use crate::embed::normalize_embedding;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Leading bytes of the primary index file
pub const INDEX_MAGIC: [u8; 4] = *b"MMVX";

/// On-disk format version shared by the primary file and its sidecar
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index has no live entries")]
    EmptyIndex,

    #[error("id already live in index: {0}")]
    DuplicateId(String),

    #[error("{ids} ids supplied with {vectors} vectors")]
    CountMismatch { ids: usize, vectors: usize },

    #[error("malformed index file: {0}")]
    Malformed(String),

    #[error("index I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// True when a file simply does not exist yet
    pub fn is_missing(&self) -> bool {
        matches!(self, IndexError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Unreadable file contents become `IndexCorrupt`; anything else stays
    /// an index error.
    pub fn into_load_error(self) -> crate::error::Error {
        match self {
            IndexError::Malformed(msg) => crate::error::Error::IndexCorrupt(msg),
            other => crate::error::Error::Index(other),
        }
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// One slot of the index: the id it was written for and whether it is tombstoned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub id: String,
    pub deleted: bool,
}

/// JSON sidecar describing the primary file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    pub version: u32,
    pub model_key: String,
    pub dimension: usize,
    pub generation: u64,
    /// BLAKE3 hex digest of the primary file
    pub checksum: String,
    /// Slot order gives the id of each vector offset
    pub slots: Vec<SlotRecord>,
}

#[derive(Serialize)]
struct PrimaryRef<'a> {
    magic: [u8; 4],
    version: u32,
    dimension: u32,
    vectors: &'a [f32],
}

#[derive(Deserialize)]
struct PrimaryOwned {
    magic: [u8; 4],
    version: u32,
    dimension: u32,
    vectors: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
    slots: Vec<SlotRecord>,
    by_id: HashMap<String, usize>,
    tombstones: usize,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
            slots: Vec::new(),
            by_id: HashMap::new(),
            tombstones: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Slots in use, tombstones included
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    /// Fraction of slots that are tombstoned; 0.0 for an empty index
    pub fn tombstone_ratio(&self) -> f64 {
        if self.slots.is_empty() {
            0.0
        } else {
            self.tombstones as f64 / self.slots.len() as f64
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Stored (normalised) vector for a live id
    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.by_id.get(id).map(|&slot| self.slot_vector(slot))
    }

    /// Live ids in slot order
    pub fn live_ids(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.id.clone())
            .collect()
    }

    fn slot_vector(&self, slot: usize) -> &[f32] {
        let start = slot * self.dimension;
        &self.data[start..start + self.dimension]
    }

    fn check_dimension(&self, actual: usize) -> IndexResult<()> {
        if actual != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }

    /// Append vectors. The whole batch is validated before anything is written.
    pub fn add(&mut self, ids: &[String], vectors: &[Vec<f32>]) -> IndexResult<()> {
        if ids.len() != vectors.len() {
            return Err(IndexError::CountMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }
        for (i, (id, vector)) in ids.iter().zip(vectors).enumerate() {
            self.check_dimension(vector.len())?;
            if self.by_id.contains_key(id) || ids[..i].contains(id) {
                return Err(IndexError::DuplicateId(id.clone()));
            }
        }

        self.data.reserve(ids.len() * self.dimension);
        for (id, vector) in ids.iter().zip(vectors) {
            let slot = self.slots.len();
            self.data.extend(normalize_embedding(vector));
            self.slots.push(SlotRecord {
                id: id.clone(),
                deleted: false,
            });
            self.by_id.insert(id.clone(), slot);
        }
        Ok(())
    }

    /// Tombstone the live slots of `ids`; returns how many were live
    pub fn remove(&mut self, ids: &[String]) -> usize {
        let mut removed = 0;
        for id in ids {
            if let Some(slot) = self.by_id.remove(id) {
                self.slots[slot].deleted = true;
                self.tombstones += 1;
                removed += 1;
            }
        }
        removed
    }

    /// Exact cosine search over live slots.
    ///
    /// Ranked by score descending; equal scores keep slot order.
    pub fn search(&self, query: &[f32], k: usize) -> IndexResult<Vec<(String, f32)>> {
        self.check_dimension(query.len())?;
        if self.by_id.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = normalize_embedding(query);
        let mut scored: Vec<(usize, f32)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.deleted)
            .map(|(slot, _)| {
                let score = self
                    .slot_vector(slot)
                    .iter()
                    .zip(&query)
                    .map(|(a, b)| a * b)
                    .sum::<f32>();
                (slot, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(slot, score)| (self.slots[slot].id.clone(), score))
            .collect())
    }

    /// Serialize to `(primary bytes, sidecar bytes)`
    pub fn encode(&self, model_key: &str, generation: u64) -> IndexResult<(Vec<u8>, Vec<u8>)> {
        let primary = bincode::serialize(&PrimaryRef {
            magic: INDEX_MAGIC,
            version: FORMAT_VERSION,
            dimension: self.dimension as u32,
            vectors: &self.data,
        })
        .map_err(|e| IndexError::Malformed(e.to_string()))?;

        let sidecar = Sidecar {
            version: FORMAT_VERSION,
            model_key: model_key.to_string(),
            dimension: self.dimension,
            generation,
            checksum: blake3::hash(&primary).to_hex().to_string(),
            slots: self.slots.clone(),
        };
        let sidecar =
            serde_json::to_vec_pretty(&sidecar).map_err(|e| IndexError::Malformed(e.to_string()))?;

        Ok((primary, sidecar))
    }

    /// Rebuild an index from the bytes written by [`encode`](Self::encode)
    pub fn decode(primary: &[u8], sidecar: &[u8]) -> IndexResult<(Self, Sidecar)> {
        let sidecar: Sidecar = serde_json::from_slice(sidecar)
            .map_err(|e| IndexError::Malformed(format!("sidecar: {}", e)))?;
        if sidecar.version != FORMAT_VERSION {
            return Err(IndexError::Malformed(format!(
                "unsupported sidecar version {}",
                sidecar.version
            )));
        }

        let checksum = blake3::hash(primary).to_hex().to_string();
        if checksum != sidecar.checksum {
            return Err(IndexError::Malformed(
                "primary checksum does not match sidecar".to_string(),
            ));
        }

        let file: PrimaryOwned = bincode::deserialize(primary)
            .map_err(|e| IndexError::Malformed(format!("primary: {}", e)))?;
        if file.magic != INDEX_MAGIC {
            return Err(IndexError::Malformed("bad magic".to_string()));
        }
        if file.version != FORMAT_VERSION {
            return Err(IndexError::Malformed(format!(
                "unsupported primary version {}",
                file.version
            )));
        }
        let dimension = file.dimension as usize;
        if dimension == 0 || dimension != sidecar.dimension {
            return Err(IndexError::Malformed(format!(
                "primary dimension {} disagrees with sidecar {}",
                dimension, sidecar.dimension
            )));
        }
        if file.vectors.len() != sidecar.slots.len() * dimension {
            return Err(IndexError::Malformed(format!(
                "{} floats for {} slots of dimension {}",
                file.vectors.len(),
                sidecar.slots.len(),
                dimension
            )));
        }

        let mut by_id = HashMap::new();
        let mut tombstones = 0;
        for (slot, record) in sidecar.slots.iter().enumerate() {
            if record.deleted {
                tombstones += 1;
            } else if by_id.insert(record.id.clone(), slot).is_some() {
                return Err(IndexError::Malformed(format!(
                    "id {} live in more than one slot",
                    record.id
                )));
            }
        }

        let index = Self {
            dimension,
            data: file.vectors,
            slots: sidecar.slots.clone(),
            by_id,
            tombstones,
        };
        Ok((index, sidecar))
    }

    /// Write the primary file and its sidecar, fsyncing both
    pub fn persist(
        &self,
        primary: &Path,
        sidecar: &Path,
        model_key: &str,
        generation: u64,
    ) -> IndexResult<()> {
        let (primary_bytes, sidecar_bytes) = self.encode(model_key, generation)?;
        write_synced(primary, &primary_bytes)?;
        write_synced(sidecar, &sidecar_bytes)?;
        Ok(())
    }

    /// Read a primary/sidecar pair from disk
    pub fn load(primary: &Path, sidecar: &Path) -> IndexResult<(Self, Sidecar)> {
        let sidecar_bytes = std::fs::read(sidecar)?;
        let primary_bytes = std::fs::read(primary)?;
        Self::decode(&primary_bytes, &sidecar_bytes)
    }
}

pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> IndexResult<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
