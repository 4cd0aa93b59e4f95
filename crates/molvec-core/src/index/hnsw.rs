//! Layered HNSW proximity graph over normalized float vectors
//!
//! The graph is mutated as a whole (neighbor rewiring touches arbitrary nodes),
//! so callers wrap it in a single `RwLock`. Removed nodes stay in the graph as
//! tombstones to keep it navigable; [`HnswGraph::compacted`] rebuilds without them.

use super::approximate::{sort_hits, AnnHit, AnnVector};
use crate::cancel::{self, CancellationToken, CANCEL_CHECK_INTERVAL};
use crate::error::Result;
use crate::similarity::dot;
use crate::types::MoleculeId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// HNSW build parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    /// Neighbors per node on upper layers
    pub m: usize,
    /// Neighbors per node on layer 0
    pub m0: usize,
    /// Candidate list size during construction
    pub ef_construction: usize,
    /// Default candidate list size during search
    pub ef_search: usize,
    /// RNG seed for level assignment
    pub seed: u64,
}

type NeighborList = SmallVec<[u32; 32]>;

struct HnswNode {
    vector: AnnVector,
    neighbors: Vec<NeighborList>,
    deleted: bool,
}

#[derive(Clone, Copy)]
struct EntryPoint {
    node_idx: u32,
    level: usize,
}

/// Distance-ordered candidate; `BinaryHeap<Near>` pops the closest first
#[derive(Clone, Copy)]
struct Near {
    idx: u32,
    dist: f32,
}

impl PartialEq for Near {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}

impl Eq for Near {}

impl PartialOrd for Near {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Near {
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist.total_cmp(&self.dist)
    }
}

/// Distance-ordered candidate; `BinaryHeap<Far>` pops the farthest first
#[derive(Clone, Copy)]
struct Far {
    idx: u32,
    dist: f32,
}

impl PartialEq for Far {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}

impl Eq for Far {}

impl PartialOrd for Far {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Far {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.total_cmp(&other.dist)
    }
}

/// HNSW graph
pub struct HnswGraph {
    params: HnswParams,
    level_mult: f64,
    nodes: Vec<HnswNode>,
    id_to_idx: HashMap<MoleculeId, u32>,
    entry_point: Option<EntryPoint>,
    rng: ChaCha8Rng,
    tombstones: usize,
}

impl HnswGraph {
    /// Empty graph
    pub fn new(params: HnswParams) -> Self {
        Self {
            params,
            level_mult: 1.0 / (params.m.max(2) as f64).ln(),
            nodes: Vec::new(),
            id_to_idx: HashMap::new(),
            entry_point: None,
            rng: ChaCha8Rng::seed_from_u64(params.seed),
            tombstones: 0,
        }
    }

    /// Build from scratch; cancellation is checked every 1024 inserts
    pub fn build(
        params: HnswParams,
        vectors: Vec<AnnVector>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self> {
        let mut graph = Self::new(params);
        graph.nodes.reserve(vectors.len());
        for (i, vector) in vectors.into_iter().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 {
                cancel::check(cancel, "hnsw build")?;
            }
            graph.insert(vector);
        }
        Ok(graph)
    }

    /// Live nodes
    pub fn len(&self) -> usize {
        self.id_to_idx.len()
    }

    /// Whether no live node remains
    pub fn is_empty(&self) -> bool {
        self.id_to_idx.is_empty()
    }

    /// Tombstoned nodes
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Add or replace a vector
    pub fn insert(&mut self, vector: AnnVector) {
        if let Some(old) = self.id_to_idx.get(&vector.molecule_id).copied() {
            self.nodes[old as usize].deleted = true;
            self.tombstones += 1;
        }

        let level = self.random_level();
        let node_idx = self.nodes.len() as u32;
        self.id_to_idx
            .insert(vector.molecule_id.clone(), node_idx);
        let query = vector.vector.clone();
        self.nodes.push(HnswNode {
            vector,
            neighbors: vec![NeighborList::new(); level + 1],
            deleted: false,
        });

        self.connect_node(node_idx, &query, level);

        match self.entry_point {
            Some(entry) if entry.level >= level => {}
            _ => self.entry_point = Some(EntryPoint { node_idx, level }),
        }
    }

    /// Tombstone a molecule
    pub fn remove(&mut self, molecule_id: &str) -> bool {
        match self.id_to_idx.remove(molecule_id) {
            Some(idx) => {
                self.nodes[idx as usize].deleted = true;
                self.tombstones += 1;
                true
            }
            None => false,
        }
    }

    /// Best `top_k` live nodes, searching layer 0 with breadth `ef`
    pub fn search(&self, query: &[f32], top_k: usize, ef: Option<usize>) -> Vec<AnnHit> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if top_k == 0 {
            return Vec::new();
        }

        let mut current = entry.node_idx;
        for level in (1..=entry.level).rev() {
            current = self.greedy_search(query, current, level);
        }

        // Tombstones occupy candidate slots, so widen the beam by as many
        let ef = ef
            .unwrap_or(self.params.ef_search)
            .max(top_k)
            .saturating_add(self.tombstones.min(top_k.max(self.params.ef_search)));
        let candidates = self.search_layer(query, current, 0, ef);

        let mut hits: Vec<AnnHit> = candidates
            .into_iter()
            .filter(|&(idx, _)| !self.nodes[idx as usize].deleted)
            .map(|(idx, dist)| {
                let v = &self.nodes[idx as usize].vector;
                AnnHit {
                    molecule_id: v.molecule_id.clone(),
                    cosine: 1.0 - dist,
                    ones: v.ones,
                }
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        hits
    }

    /// A fresh graph holding only the live nodes
    pub fn compacted(&self) -> HnswGraph {
        let mut live: Vec<u32> = self.id_to_idx.values().copied().collect();
        live.sort_unstable();
        let mut graph = HnswGraph::new(self.params);
        graph.nodes.reserve(live.len());
        for idx in live {
            graph.insert(self.nodes[idx as usize].vector.clone());
        }
        graph
    }

    fn random_level(&mut self) -> usize {
        let r: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        ((-r.ln() * self.level_mult).floor() as usize).min(16)
    }

    #[inline]
    fn distance(&self, query: &[f32], node_idx: u32) -> f32 {
        1.0 - dot(query, &self.nodes[node_idx as usize].vector.vector)
    }

    fn max_connections(&self, level: usize) -> usize {
        if level == 0 {
            self.params.m0
        } else {
            self.params.m
        }
    }

    fn connect_node(&mut self, node_idx: u32, vector: &[f32], level: usize) {
        let Some(entry) = self.entry_point else {
            return;
        };
        let mut current = entry.node_idx;

        for l in (level + 1..=entry.level).rev() {
            current = self.greedy_search(vector, current, l);
        }

        for l in (0..=level.min(entry.level)).rev() {
            let candidates = self.search_layer(vector, current, l, self.params.ef_construction);
            let max_conn = self.max_connections(l);
            let selected = self.select_neighbors(&candidates, max_conn);

            self.nodes[node_idx as usize].neighbors[l] = selected.iter().copied().collect();

            for &neighbor_idx in &selected {
                let neighbor = neighbor_idx as usize;
                if l >= self.nodes[neighbor].neighbors.len() {
                    continue;
                }
                self.nodes[neighbor].neighbors[l].push(node_idx);
                if self.nodes[neighbor].neighbors[l].len() > max_conn {
                    self.prune_neighbors(neighbor_idx, l, max_conn);
                }
            }

            if let Some(&(closest, _)) = candidates.first() {
                current = closest;
            }
        }
    }

    fn greedy_search(&self, query: &[f32], start: u32, level: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.distance(query, current);

        loop {
            let node = &self.nodes[current as usize];
            if level >= node.neighbors.len() {
                break;
            }

            let mut improved = false;
            for &neighbor in &node.neighbors[level] {
                let dist = self.distance(query, neighbor);
                if dist < current_dist {
                    current = neighbor;
                    current_dist = dist;
                    improved = true;
                }
            }

            if !improved {
                break;
            }
        }

        current
    }

    /// Beam search on one layer; returns up to `ef` nodes, closest first
    fn search_layer(&self, query: &[f32], start: u32, level: usize, ef: usize) -> Vec<(u32, f32)> {
        let start_dist = self.distance(query, start);
        let mut candidates = BinaryHeap::new();
        let mut results = BinaryHeap::new();
        let mut visited = HashSet::new();

        candidates.push(Near {
            idx: start,
            dist: start_dist,
        });
        results.push(Far {
            idx: start,
            dist: start_dist,
        });
        visited.insert(start);

        while let Some(current) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if current.dist > worst.dist && results.len() >= ef {
                    break;
                }
            }

            let node = &self.nodes[current.idx as usize];
            if level >= node.neighbors.len() {
                continue;
            }

            for &neighbor in &node.neighbors[level] {
                if !visited.insert(neighbor) {
                    continue;
                }

                let dist = self.distance(query, neighbor);
                let should_add = results.len() < ef
                    || results.peek().map(|w| dist < w.dist).unwrap_or(true);

                if should_add {
                    candidates.push(Near {
                        idx: neighbor,
                        dist,
                    });
                    results.push(Far {
                        idx: neighbor,
                        dist,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = results.into_iter().map(|c| (c.idx, c.dist)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        out
    }

    /// Diversity heuristic: keep a candidate only if it is closer to the new
    /// node than to every neighbor already kept, then top up with the rest
    fn select_neighbors(&self, candidates: &[(u32, f32)], max: usize) -> Vec<u32> {
        let mut selected: Vec<u32> = Vec::with_capacity(max);
        let mut skipped: Vec<u32> = Vec::new();

        for &(idx, dist) in candidates {
            if selected.len() >= max {
                break;
            }
            let candidate_vec = &self.nodes[idx as usize].vector.vector;
            let diverse = selected
                .iter()
                .all(|&s| self.distance(candidate_vec, s) > dist);
            if diverse {
                selected.push(idx);
            } else {
                skipped.push(idx);
            }
        }

        for idx in skipped {
            if selected.len() >= max {
                break;
            }
            selected.push(idx);
        }
        selected
    }

    fn prune_neighbors(&mut self, node_idx: u32, level: usize, max: usize) {
        let node_vec = self.nodes[node_idx as usize].vector.vector.clone();
        let mut with_dist: Vec<(u32, f32)> = self.nodes[node_idx as usize].neighbors[level]
            .iter()
            .map(|&n| (n, self.distance(&node_vec, n)))
            .collect();
        with_dist.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        with_dist.dedup_by_key(|(n, _)| *n);

        let kept = self.select_neighbors(&with_dist, max);
        self.nodes[node_idx as usize].neighbors[level] = kept.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HnswParams {
        HnswParams {
            m: 8,
            m0: 16,
            ef_construction: 64,
            ef_search: 32,
            seed: 3,
        }
    }

    fn random_vector(rng: &mut ChaCha8Rng, id: usize, dims: usize) -> AnnVector {
        let mut on: Vec<usize> = (0..dims).filter(|_| rng.gen_bool(0.1)).collect();
        if on.is_empty() {
            on.push(id % dims);
        }
        let value = 1.0 / (on.len() as f32).sqrt();
        let mut vector = vec![0.0; dims];
        for &i in &on {
            vector[i] = value;
        }
        AnnVector {
            molecule_id: format!("m{}", id),
            vector,
            ones: on.len() as u32,
        }
    }

    #[test]
    fn test_finds_exact_match() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let vectors: Vec<AnnVector> = (0..300).map(|i| random_vector(&mut rng, i, 128)).collect();
        let probe = vectors[42].clone();
        let graph = HnswGraph::build(params(), vectors, None).unwrap();
        assert_eq!(graph.len(), 300);

        let hits = graph.search(&probe.vector, 5, None);
        assert_eq!(hits[0].molecule_id, "m42");
        assert!((hits[0].cosine - 1.0).abs() < 1e-5);
        assert!(hits.windows(2).all(|w| w[0].cosine >= w[1].cosine));
    }

    #[test]
    fn test_neighbor_lists_bounded() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let vectors: Vec<AnnVector> = (0..200).map(|i| random_vector(&mut rng, i, 64)).collect();
        let graph = HnswGraph::build(params(), vectors, None).unwrap();
        for node in &graph.nodes {
            for (level, list) in node.neighbors.iter().enumerate() {
                assert!(list.len() <= graph.max_connections(level));
            }
        }
    }

    #[test]
    fn test_tombstones_hidden_and_compacted() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let vectors: Vec<AnnVector> = (0..100).map(|i| random_vector(&mut rng, i, 64)).collect();
        let probe = vectors[7].clone();
        let mut graph = HnswGraph::build(params(), vectors, None).unwrap();

        assert!(graph.remove("m7"));
        assert!(!graph.remove("m7"));
        let hits = graph.search(&probe.vector, 10, None);
        assert!(hits.iter().all(|h| h.molecule_id != "m7"));
        assert_eq!(graph.tombstones(), 1);

        let compacted = graph.compacted();
        assert_eq!(compacted.len(), 99);
        assert_eq!(compacted.tombstones(), 0);
    }

    #[test]
    fn test_upsert_replaces() {
        let mut graph = HnswGraph::new(params());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let a = random_vector(&mut rng, 1, 32);
        let mut b = random_vector(&mut rng, 2, 32);
        b.molecule_id = a.molecule_id.clone();
        graph.insert(a);
        graph.insert(b.clone());
        assert_eq!(graph.len(), 1);
        let hits = graph.search(&b.vector, 3, None);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].cosine - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_graph() {
        let graph = HnswGraph::new(params());
        assert!(graph.search(&[0.0; 8], 5, None).is_empty());
    }
}
