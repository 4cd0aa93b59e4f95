//! IVF-flat partitioned index
//!
//! Centroids come from spherical k-means (k-means++ seeding) over a sample of
//! the corpus and never change within a generation. Each partition has its own
//! lock, so inserts landing in different partitions do not contend.

use super::approximate::{sort_hits, AnnHit, AnnVector};
use crate::cancel::{self, CancellationToken};
use crate::error::Result;
use crate::similarity::dot;
use crate::types::MoleculeId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::HashMap;

/// IVF build parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfParams {
    /// Number of partitions (clamped to the training set size)
    pub num_partitions: usize,
    /// Partitions probed per query
    pub n_probe: usize,
    /// Lloyd iterations
    pub kmeans_iterations: usize,
    /// Vectors sampled for training
    pub max_training_samples: usize,
    /// RNG seed
    pub seed: u64,
}

#[inline]
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - dot(a, b)
}

fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// k-means++ initialization
fn kmeans_plus_plus_init(vectors: &[&[f32]], k: usize, seed: u64) -> Vec<Vec<f32>> {
    if vectors.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);

    let first_idx = rng.gen_range(0..vectors.len());
    centroids.push(vectors[first_idx].to_vec());

    // Distance to the nearest chosen centroid, updated incrementally
    let mut nearest: Vec<f32> = vectors
        .par_iter()
        .map(|v| cosine_distance(v, &centroids[0]))
        .collect();

    for _ in 1..k {
        let weights: Vec<f32> = nearest.iter().map(|d| d.max(0.0) * d.max(0.0)).collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            break;
        }

        // Roulette wheel selection
        let target = rng.gen_range(0.0..total);
        let mut cumsum = 0.0;
        let mut selected = vectors.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            cumsum += w;
            if cumsum >= target {
                selected = i;
                break;
            }
        }

        let centroid = vectors[selected].to_vec();
        nearest
            .par_iter_mut()
            .zip(vectors.par_iter())
            .for_each(|(d, v)| *d = d.min(cosine_distance(v, &centroid)));
        centroids.push(centroid);
    }

    centroids
}

fn find_nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best_cluster = 0;
    let mut best_dist = f32::MAX;

    for (i, centroid) in centroids.iter().enumerate() {
        let dist = cosine_distance(vector, centroid);
        if dist < best_dist {
            best_dist = dist;
            best_cluster = i;
        }
    }

    best_cluster
}

/// Lloyd iterations; centroids are re-normalized after every update
fn kmeans_cluster(
    vectors: &[&[f32]],
    mut centroids: Vec<Vec<f32>>,
    iterations: usize,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<Vec<f32>>> {
    let n_clusters = centroids.len();
    let dimensions = centroids.first().map(|c| c.len()).unwrap_or(0);

    for _ in 0..iterations {
        cancel::check(cancel, "ivf k-means")?;

        let assignments: Vec<usize> = vectors
            .par_iter()
            .map(|v| find_nearest_centroid(v, &centroids))
            .collect();

        let mut cluster_sums: Vec<Vec<f32>> =
            (0..n_clusters).map(|_| vec![0.0; dimensions]).collect();
        let mut cluster_counts: Vec<usize> = vec![0; n_clusters];

        for (vector, &cluster) in vectors.iter().zip(assignments.iter()) {
            for (sum, &v) in cluster_sums[cluster].iter_mut().zip(vector.iter()) {
                *sum += v;
            }
            cluster_counts[cluster] += 1;
        }

        for (i, centroid) in centroids.iter_mut().enumerate() {
            if cluster_counts[i] > 0 {
                for j in 0..dimensions {
                    centroid[j] = cluster_sums[i][j] / cluster_counts[i] as f32;
                }
                normalize(centroid);
            }
        }
    }

    Ok(centroids)
}

struct Member {
    vector: AnnVector,
    live: bool,
}

#[derive(Default)]
struct Partition {
    members: Vec<Member>,
    slots: HashMap<MoleculeId, usize>,
    dead: usize,
}

impl Partition {
    /// Append a vector, tombstoning an older copy of the same molecule
    fn push(&mut self, vector: AnnVector) {
        self.tombstone(&vector.molecule_id);
        self.slots
            .insert(vector.molecule_id.clone(), self.members.len());
        self.members.push(Member { vector, live: true });
    }

    fn tombstone(&mut self, molecule_id: &str) -> bool {
        match self.slots.remove(molecule_id) {
            Some(slot) => {
                self.members[slot].live = false;
                self.dead += 1;
                true
            }
            None => false,
        }
    }

    fn compact(&mut self) -> usize {
        if self.dead == 0 {
            return 0;
        }
        let removed = self.dead;
        self.members.retain(|m| m.live);
        self.slots = self
            .members
            .iter()
            .enumerate()
            .map(|(slot, m)| (m.vector.molecule_id.clone(), slot))
            .collect();
        self.dead = 0;
        removed
    }

    /// Best `top_k` live members by cosine
    fn scan(&self, query: &[f32], top_k: usize) -> Vec<AnnHit> {
        let mut scored: Vec<(f32, usize)> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.live)
            .map(|(slot, m)| (dot(query, &m.vector.vector), slot))
            .collect();
        scored.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
        // Keep ties at the cut so the id tie-break sees all of them
        let cut = scored
            .get(top_k.saturating_sub(1))
            .map(|&(s, _)| s)
            .unwrap_or(f32::MIN);
        scored
            .into_iter()
            .take_while(|&(s, _)| s >= cut)
            .map(|(cosine, slot)| {
                let v = &self.members[slot].vector;
                AnnHit {
                    molecule_id: v.molecule_id.clone(),
                    cosine,
                    ones: v.ones,
                }
            })
            .collect()
    }
}

/// IVF-flat index over normalized float vectors
pub struct IvfIndex {
    centroids: Vec<Vec<f32>>,
    partitions: Vec<RwLock<Partition>>,
    locations: DashMap<MoleculeId, u32>,
    n_probe: usize,
}

impl IvfIndex {
    /// Train centroids and partition `vectors`
    ///
    /// Cancellation is checked every k-means iteration and every partition.
    pub fn build(
        dimensions: usize,
        vectors: Vec<AnnVector>,
        params: &IvfParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);

        let training: Vec<&[f32]> = if vectors.len() > params.max_training_samples {
            rand::seq::index::sample(&mut rng, vectors.len(), params.max_training_samples)
                .into_iter()
                .map(|i| vectors[i].vector.as_slice())
                .collect()
        } else {
            vectors.iter().map(|v| v.vector.as_slice()).collect()
        };

        let k = params.num_partitions.min(training.len());
        let mut centroids = kmeans_plus_plus_init(&training, k, params.seed);
        for c in centroids.iter_mut() {
            normalize(c);
        }
        centroids = kmeans_cluster(&training, centroids, params.kmeans_iterations, cancel)?;
        if centroids.is_empty() {
            centroids.push(vec![0.0; dimensions]);
        }
        drop(training);

        let assignments: Vec<usize> = vectors
            .par_iter()
            .map(|v| find_nearest_centroid(&v.vector, &centroids))
            .collect();

        let mut buckets: Vec<Vec<AnnVector>> = (0..centroids.len()).map(|_| Vec::new()).collect();
        for (vector, pid) in vectors.into_iter().zip(assignments) {
            buckets[pid].push(vector);
        }

        let locations = DashMap::new();
        let mut partitions = Vec::with_capacity(buckets.len());
        for (pid, bucket) in buckets.into_iter().enumerate() {
            cancel::check(cancel, "ivf partitioning")?;
            let mut partition = Partition::default();
            for vector in bucket {
                locations.insert(vector.molecule_id.clone(), pid as u32);
                partition.push(vector);
            }
            partitions.push(RwLock::new(partition));
        }

        Ok(Self {
            centroids,
            partitions,
            locations,
            n_probe: params.n_probe.max(1),
        })
    }

    /// Number of partitions
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Add or replace a vector; only the target partition is write-locked
    pub fn insert(&self, vector: AnnVector) {
        let target = find_nearest_centroid(&vector.vector, &self.centroids);
        match self.locations.entry(vector.molecule_id.clone()) {
            Entry::Occupied(mut e) => {
                let old = *e.get() as usize;
                if old != target {
                    self.partitions[old].write().tombstone(&vector.molecule_id);
                }
                e.insert(target as u32);
                self.partitions[target].write().push(vector);
            }
            Entry::Vacant(e) => {
                e.insert(target as u32);
                self.partitions[target].write().push(vector);
            }
        }
    }

    /// Tombstone a molecule
    pub fn remove(&self, molecule_id: &str) -> bool {
        match self.locations.remove(molecule_id) {
            Some((_, pid)) => self.partitions[pid as usize].write().tombstone(molecule_id),
            None => false,
        }
    }

    /// Probe the `n_probe` nearest partitions
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<AnnHit> {
        if top_k == 0 {
            return Vec::new();
        }
        let n_probe = self.n_probe.min(self.centroids.len());
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_distance(query, c)))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut hits = Vec::new();
        for &(pid, _) in order.iter().take(n_probe) {
            hits.extend(self.partitions[pid].read().scan(query, top_k));
        }
        sort_hits(&mut hits);
        hits.truncate(top_k);
        hits
    }

    /// Physically drop tombstoned vectors; returns how many were dropped
    pub fn compact(&self) -> usize {
        self.partitions.iter().map(|p| p.write().compact()).sum()
    }

    /// Live vectors
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Whether no live vector remains
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Tombstoned vectors awaiting compaction
    pub fn tombstones(&self) -> usize {
        self.partitions.iter().map(|p| p.read().dead).sum()
    }
}
