//! Persistent ANN index over unit-norm embedding vectors.
//!
//! Below the training threshold every search is an exact scan. Once enough
//! vectors accumulate, an inverted-file (IVF) structure is trained with
//! spherical k-means: each stored vector is assigned to its `spill` nearest
//! centroid lists, and a search probes the `nprobe` lists nearest the
//! query, then continues only through lists whose member-radius bound shows
//! they could still improve the top k. Similarity is cosine, clamped to
//! [0, 1]; for unit vectors this equals `1 - d²/2` over L2 distance.
//!
//! Mutations serialize behind a write lock and persist atomically before
//! the lock is released, so concurrent readers always observe the most
//! recent fully-persisted generation. Removal is a logical tombstone;
//! `compact` is the explicit maintenance operation that rewrites storage.

mod kmeans;
pub mod persist;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use kmeans::{dot, l2_norm, nearest_centroids};
pub use persist::{IndexSnapshot, IvfSnapshot, MappingSnapshot};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("application {0} is already indexed")]
    AlreadyIndexed(Uuid),
    #[error("application {0} is not in the index")]
    UnknownApplication(Uuid),
    #[error("vector dimension {got} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("vector is not unit-norm (|v| = {0})")]
    NotUnitNorm(f32),
    #[error("snapshot dimension {got} does not match index dimension {expected}")]
    SnapshotMismatch { expected: usize, got: usize },
    #[error("index persistence failed: {0}")]
    Persistence(String),
    #[error("index files corrupt: {0}")]
    Corrupt(String),
}

impl IndexError {
    /// Failures worth retrying (I/O) versus caller mistakes.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub dim: usize,
    /// IVF cluster count; training happens once `size >= nlist`.
    pub nlist: usize,
    /// Clusters probed per search.
    pub nprobe: usize,
    /// Below this live size searches are exact scans.
    pub training_threshold: usize,
    /// Nearest centroid lists each vector is assigned to.
    pub spill: usize,
    pub kmeans_iters: usize,
    /// Seed for centroid initialization; fixed so training is reproducible.
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dim: crate::config::EMBEDDING_DIM,
            nlist: 100,
            nprobe: 10,
            training_threshold: 100,
            spill: 2,
            kmeans_iters: 10,
            seed: 42,
        }
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub application_id: Uuid,
    /// Cosine similarity in [0, 1].
    pub similarity: f32,
    /// L2 distance between the unit vectors.
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub size: usize,
    pub total_rows: usize,
    pub tombstones: usize,
    pub trained: bool,
    pub dim: usize,
    pub nlist: usize,
    pub nprobe: usize,
}

struct Ivf {
    centroids: Vec<f32>,
    lists: Vec<Vec<u32>>,
    /// Max member angle per list; lets the search prove when probing more
    /// lists cannot improve the result.
    radii: Vec<f32>,
}

impl Ivf {
    fn assign(&mut self, dim: usize, spill: usize, row: u32, vector: &[f32]) {
        for c in nearest_centroids(vector, &self.centroids, dim, spill) {
            let d = dot(vector, &self.centroids[c * dim..(c + 1) * dim]);
            let angle = d.clamp(-1.0, 1.0).acos();
            self.lists[c].push(row);
            if angle > self.radii[c] {
                self.radii[c] = angle;
            }
        }
    }
}

struct IndexInner {
    vectors: Vec<f32>,
    row_app: Vec<Uuid>,
    row_internal: Vec<i64>,
    deleted: Vec<bool>,
    app_to_row: HashMap<Uuid, u32>,
    next_internal: i64,
    ivf: Option<Ivf>,
}

impl IndexInner {
    fn empty() -> Self {
        Self {
            vectors: Vec::new(),
            row_app: Vec::new(),
            row_internal: Vec::new(),
            deleted: Vec::new(),
            app_to_row: HashMap::new(),
            next_internal: 0,
            ivf: None,
        }
    }

    fn rows(&self) -> usize {
        self.row_app.len()
    }

    fn live_size(&self) -> usize {
        self.app_to_row.len()
    }

    fn live_rows(&self) -> Vec<usize> {
        (0..self.rows()).filter(|&r| !self.deleted[r]).collect()
    }

    fn vector_at(&self, row: usize, dim: usize) -> &[f32] {
        &self.vectors[row * dim..(row + 1) * dim]
    }
}

pub struct VectorIndex {
    cfg: IndexConfig,
    dir: Option<PathBuf>,
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    /// In-memory index without persistence.
    pub fn new(cfg: IndexConfig) -> Self {
        Self {
            cfg,
            dir: None,
            inner: RwLock::new(IndexInner::empty()),
        }
    }

    /// Open a persistent index in `dir`: load when both files parse,
    /// otherwise start fresh (a corrupt pair is logged and replaced).
    pub fn open(cfg: IndexConfig, dir: PathBuf) -> Self {
        let inner = match persist::load(&dir) {
            Ok(Some((snapshot, mapping))) => match Self::inner_from_snapshot(&cfg, snapshot, Some(mapping)) {
                Ok(inner) => {
                    tracing::info!(
                        dir = %dir.display(),
                        size = inner.live_size(),
                        trained = inner.ivf.is_some(),
                        "loaded vector index"
                    );
                    inner
                }
                Err(e) => {
                    tracing::error!(error = %e, "vector index load failed, starting fresh");
                    IndexInner::empty()
                }
            },
            Ok(None) => {
                tracing::info!(dir = %dir.display(), "no existing vector index, starting fresh");
                IndexInner::empty()
            }
            Err(e) => {
                tracing::error!(error = %e, "vector index files unreadable, starting fresh");
                IndexInner::empty()
            }
        };
        Self {
            cfg,
            dir: Some(dir),
            inner: RwLock::new(inner),
        }
    }

    fn inner_from_snapshot(
        cfg: &IndexConfig,
        snapshot: IndexSnapshot,
        mapping: Option<MappingSnapshot>,
    ) -> Result<IndexInner, IndexError> {
        if snapshot.dim != cfg.dim {
            return Err(IndexError::SnapshotMismatch {
                expected: cfg.dim,
                got: snapshot.dim,
            });
        }
        let rows = snapshot.row_app.len();
        if snapshot.vectors.len() != rows * cfg.dim
            || snapshot.row_internal.len() != rows
            || snapshot.deleted.len() != rows
        {
            return Err(IndexError::Corrupt("row arrays disagree".to_string()));
        }

        let mut app_to_row = HashMap::new();
        for row in 0..rows {
            if !snapshot.deleted[row] {
                app_to_row.insert(snapshot.row_app[row], row as u32);
            }
        }
        if let Some(mapping) = mapping {
            for (app, internal) in &mapping.pairs {
                let Some(&row) = app_to_row.get(app) else {
                    return Err(IndexError::Corrupt(format!("mapping names unknown {app}")));
                };
                if snapshot.row_internal[row as usize] != *internal {
                    return Err(IndexError::Corrupt(format!("internal id mismatch for {app}")));
                }
            }
        }

        Ok(IndexInner {
            vectors: snapshot.vectors,
            row_app: snapshot.row_app,
            row_internal: snapshot.row_internal,
            deleted: snapshot.deleted,
            app_to_row,
            next_internal: snapshot.next_internal,
            ivf: match snapshot.ivf {
                Some(ivf) => {
                    if ivf.radii.len() != ivf.lists.len() {
                        return Err(IndexError::Corrupt("ivf lists and radii disagree".to_string()));
                    }
                    Some(Ivf {
                        centroids: ivf.centroids,
                        lists: ivf.lists,
                        radii: ivf.radii,
                    })
                }
                None => None,
            },
        })
    }

    fn validate(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.cfg.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.cfg.dim,
                got: vector.len(),
            });
        }
        let norm = l2_norm(vector);
        if !(0.99..=1.01).contains(&norm) {
            return Err(IndexError::NotUnitNorm(norm));
        }
        Ok(())
    }

    /// Insert one vector. Fails if the application is already present.
    pub fn add(&self, application_id: Uuid, vector: &[f32]) -> Result<i64, IndexError> {
        self.validate(vector)?;
        let mut inner = self.inner.write().expect("index lock poisoned");
        if inner.app_to_row.contains_key(&application_id) {
            return Err(IndexError::AlreadyIndexed(application_id));
        }
        let internal = Self::push_row(&self.cfg, &mut inner, application_id, vector);
        Self::maybe_train(&self.cfg, &mut inner);
        self.persist(&inner)?;
        Ok(internal)
    }

    /// Insert many vectors. Already-indexed applications are skipped with a
    /// warning; the returned internal ids preserve the order of successful
    /// inserts.
    pub fn add_batch(&self, items: &[(Uuid, Vec<f32>)]) -> Result<Vec<i64>, IndexError> {
        for (_, vector) in items {
            self.validate(vector)?;
        }
        let mut inner = self.inner.write().expect("index lock poisoned");
        let mut ids = Vec::with_capacity(items.len());
        for (application_id, vector) in items {
            if inner.app_to_row.contains_key(application_id) {
                tracing::warn!(application_id = %application_id, "already indexed, skipping");
                continue;
            }
            ids.push(Self::push_row(&self.cfg, &mut inner, *application_id, vector));
        }
        Self::maybe_train(&self.cfg, &mut inner);
        self.persist(&inner)?;
        Ok(ids)
    }

    fn push_row(cfg: &IndexConfig, inner: &mut IndexInner, application_id: Uuid, vector: &[f32]) -> i64 {
        let row = inner.rows() as u32;
        inner.vectors.extend_from_slice(vector);
        inner.row_app.push(application_id);
        let internal = inner.next_internal;
        inner.row_internal.push(internal);
        inner.deleted.push(false);
        inner.app_to_row.insert(application_id, row);
        inner.next_internal += 1;

        if let Some(ivf) = &mut inner.ivf {
            ivf.assign(cfg.dim, cfg.spill, row, vector);
        }
        internal
    }

    fn maybe_train(cfg: &IndexConfig, inner: &mut IndexInner) {
        if inner.ivf.is_some() || inner.live_size() < cfg.nlist {
            return;
        }
        let rows = inner.live_rows();
        tracing::info!(vectors = rows.len(), nlist = cfg.nlist, "training IVF index");
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let centroids = kmeans::train(
            &inner.vectors,
            cfg.dim,
            &rows,
            cfg.nlist,
            cfg.kmeans_iters,
            &mut rng,
        );
        let nlist = centroids.len() / cfg.dim;
        let mut ivf = Ivf {
            centroids,
            lists: vec![Vec::new(); nlist],
            radii: vec![0.0; nlist],
        };
        for &row in &rows {
            let v = inner.vector_at(row, cfg.dim).to_vec();
            ivf.assign(cfg.dim, cfg.spill, row as u32, &v);
        }
        inner.ivf = Some(ivf);
        tracing::info!("IVF training completed");
    }

    /// Up to `k` nearest stored vectors, descending similarity, optionally
    /// filtered by a similarity floor. An empty index yields an empty list.
    pub fn search(
        &self,
        vector: &[f32],
        k: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.validate(vector)?;
        let inner = self.inner.read().expect("index lock poisoned");
        if inner.live_size() == 0 || k == 0 {
            return Ok(Vec::new());
        }

        let approximate = inner.ivf.is_some() && inner.live_size() >= self.cfg.training_threshold;
        let mut hits: Vec<(u32, f32)> = if approximate {
            self.ivf_candidates(&inner, vector, k)
        } else {
            (0..inner.rows())
                .filter(|&r| !inner.deleted[r])
                .map(|r| (r as u32, dot(vector, inner.vector_at(r, self.cfg.dim))))
                .collect()
        };

        // Deterministic order: similarity desc, insertion order as tie-break.
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let floor = threshold.unwrap_or(f32::NEG_INFINITY);
        Ok(hits
            .into_iter()
            .map(|(row, raw)| {
                let similarity = raw.clamp(0.0, 1.0);
                SearchHit {
                    application_id: inner.row_app[row as usize],
                    similarity,
                    distance: (2.0 - 2.0 * raw).max(0.0).sqrt(),
                }
            })
            .filter(|hit| hit.similarity >= floor)
            .take(k)
            .collect())
    }

    /// IVF probe: scan the `nprobe` nearest lists unconditionally, then
    /// keep probing only lists whose radius bound proves a member could
    /// still enter the current top `k`. On well-clustered data the bound
    /// cuts probing off right after `nprobe`; on adversarial data it keeps
    /// recall from collapsing.
    fn ivf_candidates(&self, inner: &IndexInner, vector: &[f32], k: usize) -> Vec<(u32, f32)> {
        let ivf = inner.ivf.as_ref().expect("ivf presence checked by caller");
        let dim = self.cfg.dim;
        let nlist = ivf.lists.len();

        let mut ranked: Vec<(usize, f32)> = (0..nlist)
            .map(|c| (c, dot(vector, &ivf.centroids[c * dim..(c + 1) * dim])))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let mut seen = vec![false; inner.rows()];
        let mut candidates: Vec<(u32, f32)> = Vec::new();
        // Top-k floor used by the completion bound, kept small and sorted.
        let mut best: Vec<f32> = Vec::with_capacity(k);

        for (rank, (c, centroid_dot)) in ranked.into_iter().enumerate() {
            if rank >= self.cfg.nprobe && best.len() >= k {
                let kth = best[k - 1];
                let theta = centroid_dot.clamp(-1.0, 1.0).acos();
                let bound = (theta - ivf.radii[c]).max(0.0).cos();
                if bound <= kth {
                    continue;
                }
            }
            for &row in &ivf.lists[c] {
                let r = row as usize;
                if seen[r] || inner.deleted[r] {
                    continue;
                }
                seen[r] = true;
                let similarity = dot(vector, inner.vector_at(r, dim));
                candidates.push((row, similarity));
                let pos = best
                    .binary_search_by(|b| {
                        similarity
                            .partial_cmp(b)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or_else(|e| e);
                best.insert(pos, similarity);
                best.truncate(k);
            }
        }
        candidates
    }

    /// Search using a stored application's own vector, excluding itself.
    pub fn search_by_id(
        &self,
        application_id: Uuid,
        k: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let vector = self.reconstruct(application_id)?;
        let mut hits = self.search(&vector, k + 1, threshold)?;
        hits.retain(|hit| hit.application_id != application_id);
        hits.truncate(k);
        Ok(hits)
    }

    /// Return the stored vector for an application.
    pub fn reconstruct(&self, application_id: Uuid) -> Result<Vec<f32>, IndexError> {
        let inner = self.inner.read().expect("index lock poisoned");
        let row = *inner
            .app_to_row
            .get(&application_id)
            .ok_or(IndexError::UnknownApplication(application_id))?;
        Ok(inner.vector_at(row as usize, self.cfg.dim).to_vec())
    }

    pub fn contains(&self, application_id: Uuid) -> bool {
        self.inner
            .read()
            .expect("index lock poisoned")
            .app_to_row
            .contains_key(&application_id)
    }

    /// Logical removal; storage is reclaimed by [`Self::compact`].
    pub fn remove(&self, application_id: Uuid) -> Result<(), IndexError> {
        let mut inner = self.inner.write().expect("index lock poisoned");
        let row = inner
            .app_to_row
            .remove(&application_id)
            .ok_or(IndexError::UnknownApplication(application_id))?;
        inner.deleted[row as usize] = true;
        self.persist(&inner)?;
        Ok(())
    }

    /// Rewrite storage without tombstones and retrain when still eligible.
    /// Maintenance operation; never runs automatically.
    pub fn compact(&self) -> Result<(), IndexError> {
        let mut inner = self.inner.write().expect("index lock poisoned");
        let live = inner.live_rows();
        let mut rebuilt = IndexInner::empty();
        rebuilt.next_internal = inner.next_internal;
        for row in live {
            let new_row = rebuilt.rows() as u32;
            let app = inner.row_app[row];
            rebuilt
                .vectors
                .extend_from_slice(inner.vector_at(row, self.cfg.dim));
            rebuilt.row_app.push(app);
            rebuilt.row_internal.push(inner.row_internal[row]);
            rebuilt.deleted.push(false);
            rebuilt.app_to_row.insert(app, new_row);
        }
        *inner = rebuilt;
        Self::maybe_train(&self.cfg, &mut inner);
        self.persist(&inner)?;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.inner.read().expect("index lock poisoned").live_size()
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read().expect("index lock poisoned");
        IndexStats {
            size: inner.live_size(),
            total_rows: inner.rows(),
            tombstones: inner.rows() - inner.live_size(),
            trained: inner.ivf.is_some(),
            dim: self.cfg.dim,
            nlist: self.cfg.nlist,
            nprobe: self.cfg.nprobe,
        }
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        let inner = self.inner.read().expect("index lock poisoned");
        Self::snapshot_of(&self.cfg, &inner)
    }

    /// Replace the index contents from a snapshot and persist.
    pub fn restore(&self, snapshot: IndexSnapshot) -> Result<(), IndexError> {
        let rebuilt = Self::inner_from_snapshot(&self.cfg, snapshot, None)?;
        let mut inner = self.inner.write().expect("index lock poisoned");
        *inner = rebuilt;
        self.persist(&inner)?;
        Ok(())
    }

    fn snapshot_of(cfg: &IndexConfig, inner: &IndexInner) -> IndexSnapshot {
        IndexSnapshot {
            dim: cfg.dim,
            vectors: inner.vectors.clone(),
            row_app: inner.row_app.clone(),
            row_internal: inner.row_internal.clone(),
            deleted: inner.deleted.clone(),
            next_internal: inner.next_internal,
            ivf: inner.ivf.as_ref().map(|ivf| IvfSnapshot {
                centroids: ivf.centroids.clone(),
                lists: ivf.lists.clone(),
                radii: ivf.radii.clone(),
            }),
        }
    }

    fn persist(&self, inner: &IndexInner) -> Result<(), IndexError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let snapshot = Self::snapshot_of(&self.cfg, inner);
        let mapping = MappingSnapshot {
            pairs: inner
                .app_to_row
                .iter()
                .map(|(app, &row)| (*app, inner.row_internal[row as usize]))
                .collect(),
            next_internal: inner.next_internal,
        };
        persist::save(dir, &snapshot, &mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn small_config(dim: usize) -> IndexConfig {
        IndexConfig {
            dim,
            nlist: 8,
            nprobe: 3,
            training_threshold: 16,
            spill: 2,
            kmeans_iters: 5,
            seed: 42,
        }
    }

    fn unit(dim: usize, rng: &mut impl Rng) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    fn basis(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn add_and_exact_search() {
        let index = VectorIndex::new(small_config(8));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.add(a, &basis(8, 0)).unwrap();
        index.add(b, &basis(8, 1)).unwrap();

        let hits = index.search(&basis(8, 0), 2, None).unwrap();
        assert_eq!(hits[0].application_id, a);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        assert!(hits[0].distance < 1e-3);
        // Orthogonal vector clamps to similarity 0.
        assert_eq!(hits[1].application_id, b);
        assert!(hits[1].similarity.abs() < 1e-5);
    }

    #[test]
    fn empty_index_returns_empty() {
        let index = VectorIndex::new(small_config(8));
        assert!(index.search(&basis(8, 0), 5, None).unwrap().is_empty());
    }

    #[test]
    fn duplicate_add_fails() {
        let index = VectorIndex::new(small_config(8));
        let a = Uuid::new_v4();
        index.add(a, &basis(8, 0)).unwrap();
        assert!(matches!(
            index.add(a, &basis(8, 0)),
            Err(IndexError::AlreadyIndexed(_))
        ));
    }

    #[test]
    fn rejects_bad_vectors() {
        let index = VectorIndex::new(small_config(8));
        assert!(matches!(
            index.add(Uuid::new_v4(), &[1.0; 4]),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            index.add(Uuid::new_v4(), &[0.5; 8]),
            Err(IndexError::NotUnitNorm(_))
        ));
    }

    #[test]
    fn batch_skips_duplicates_preserving_order() {
        let index = VectorIndex::new(small_config(8));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.add(a, &basis(8, 0)).unwrap();

        let ids = index
            .add_batch(&[(a, basis(8, 0)), (b, basis(8, 1))])
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(index.size(), 2);
        assert!(index.contains(b));
    }

    #[test]
    fn threshold_filters_hits() {
        let index = VectorIndex::new(small_config(8));
        index.add(Uuid::new_v4(), &basis(8, 0)).unwrap();
        index.add(Uuid::new_v4(), &basis(8, 1)).unwrap();
        let hits = index.search(&basis(8, 0), 10, Some(0.5)).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn search_by_id_excludes_self() {
        let index = VectorIndex::new(small_config(8));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.add(a, &basis(8, 0)).unwrap();
        index.add(b, &basis(8, 0)).unwrap();

        let hits = index.search_by_id(a, 5, None).unwrap();
        assert!(hits.iter().all(|h| h.application_id != a));
        assert_eq!(hits[0].application_id, b);
    }

    #[test]
    fn remove_tombstones_then_compact() {
        let index = VectorIndex::new(small_config(8));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.add(a, &basis(8, 0)).unwrap();
        index.add(b, &basis(8, 1)).unwrap();

        index.remove(a).unwrap();
        assert_eq!(index.size(), 1);
        assert_eq!(index.stats().tombstones, 1);
        assert!(index
            .search(&basis(8, 0), 5, None)
            .unwrap()
            .iter()
            .all(|h| h.application_id != a));
        assert!(matches!(
            index.reconstruct(a),
            Err(IndexError::UnknownApplication(_))
        ));

        index.compact().unwrap();
        assert_eq!(index.stats().tombstones, 0);
        assert_eq!(index.size(), 1);
        assert!(index.contains(b));
    }

    #[test]
    fn training_kicks_in_and_finds_duplicates() {
        let cfg = small_config(16);
        let index = VectorIndex::new(cfg);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);

        let target = Uuid::new_v4();
        let target_vec = unit(16, &mut rng);
        index.add(target, &target_vec).unwrap();
        for _ in 0..30 {
            index.add(Uuid::new_v4(), &unit(16, &mut rng)).unwrap();
        }
        assert!(index.stats().trained);

        // An exact copy of a stored vector must come back first.
        let hits = index.search(&target_vec, 5, None).unwrap();
        assert_eq!(hits[0].application_id, target);
        assert!(hits[0].similarity > 0.999);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let index = VectorIndex::new(small_config(8));
        let a = Uuid::new_v4();
        index.add(a, &basis(8, 0)).unwrap();

        let snapshot = index.snapshot();
        let replica = VectorIndex::new(small_config(8));
        replica.restore(snapshot).unwrap();

        assert_eq!(replica.size(), 1);
        assert_eq!(replica.reconstruct(a).unwrap(), basis(8, 0));
    }

    #[test]
    fn persists_and_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let a = Uuid::new_v4();
        {
            let index = VectorIndex::open(small_config(8), dir.path().to_path_buf());
            index.add(a, &basis(8, 0)).unwrap();
        }
        let reloaded = VectorIndex::open(small_config(8), dir.path().to_path_buf());
        assert_eq!(reloaded.size(), 1);
        assert_eq!(reloaded.reconstruct(a).unwrap(), basis(8, 0));
    }

    #[test]
    fn search_is_deterministic() {
        let index = VectorIndex::new(small_config(16));
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        for _ in 0..40 {
            index.add(Uuid::new_v4(), &unit(16, &mut rng)).unwrap();
        }
        let query = unit(16, &mut rng);
        let first = index.search(&query, 10, None).unwrap();
        let second = index.search(&query, 10, None).unwrap();
        assert_eq!(first, second);
    }
}
