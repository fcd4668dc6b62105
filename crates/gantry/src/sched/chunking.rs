//! Partitioning of a filtered node list into reusable, fixed-membership
//! chunks. Chunks are computed once per [`ChunkGroupKey`] and cached for the
//! plugin's lifetime, since partitioning (and the inventory acquisition behind
//! it) is expensive.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::sched::config::{ChunkExtra, ChunkingConfig, NodeCount, NodeSelection, ScheduleConfig};
use crate::sched::nodes::{NodeList, NodeListId, NodeName};

/// An immutable set of node names. Membership never changes once the chunk is
/// computed; the same chunk may back many allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    nodes: NodeList,
}

impl Chunk {
    fn new(mut nodes: NodeList) -> Self {
        nodes.sort();
        nodes.dedup();
        Chunk { nodes }
    }

    pub fn nodes(&self) -> &[NodeName] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }
}

/// Identifies one reusable partitioning of one filtered node list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkGroupKey {
    pub node_list_id: NodeListId,
    pub chunk_size: usize,
    pub node_selection: NodeSelection,
    pub extra: ChunkExtra,
    pub include_nodes: Vec<NodeName>,
}

impl ChunkGroupKey {
    pub fn new(node_list_id: NodeListId, config: &ScheduleConfig, list_len: usize) -> Self {
        let mut include_nodes = config.include_nodes.clone();
        include_nodes.sort();
        ChunkGroupKey {
            node_list_id,
            chunk_size: effective_chunk_size(&config.chunking, list_len),
            node_selection: config.chunking.node_selection,
            extra: config.chunking.extra,
            include_nodes,
        }
    }
}

/// The concrete chunk size for a node list: a literal, a rounded-down
/// fraction of the list, or the whole list when unset/zero/oversized.
pub fn effective_chunk_size(chunking: &ChunkingConfig, list_len: usize) -> usize {
    let size = match chunking.size {
        None | Some(NodeCount::Count(0)) | Some(NodeCount::All) => list_len,
        Some(NodeCount::Count(count)) => count as usize,
        Some(NodeCount::Fraction(fraction)) => (fraction * list_len as f64).floor() as usize,
    };
    if size == 0 || size > list_len {
        list_len
    } else {
        size
    }
}

/// Split `node_list` into chunks of `key.chunk_size` members.
///
/// `include_nodes` are pulled out of the working pool first and unioned into
/// every chunk at the end. Leftover nodes either form one extra backfilled
/// chunk (padded with the head of the previous chunk, so those nodes appear
/// twice) or are discarded.
pub fn partition_chunks(
    node_list: &[NodeName],
    key: &ChunkGroupKey,
    rng: &mut impl Rng,
) -> Vec<Chunk> {
    let mut pool: NodeList = node_list
        .iter()
        .filter(|node| !key.include_nodes.contains(node))
        .cloned()
        .collect();

    let chunk_size = key.chunk_size.min(node_list.len()).max(1);

    let mut chunks: Vec<NodeList> = Vec::new();
    while pool.len() >= chunk_size {
        let picked = match key.node_selection {
            NodeSelection::Contiguous => select_contiguous(&pool, chunk_size),
            NodeSelection::Random => select_random(&pool, chunk_size, rng),
            NodeSelection::Distributed => select_distributed(&pool, chunk_size),
            NodeSelection::RandDist => select_rand_dist(&pool, chunk_size, rng),
        };
        pool.retain(|node| !picked.contains(node));
        chunks.push(picked);
    }

    if !pool.is_empty() && key.extra == ChunkExtra::Backfill {
        if let Some(last) = chunks.last() {
            let mut backfill: NodeList = last[..chunk_size - pool.len()].to_vec();
            backfill.append(&mut pool);
            chunks.push(backfill);
        } else {
            // No full chunk was formed at all; the leftovers are the chunk.
            chunks.push(pool);
        }
    }

    // Every node was an include node; the group still gets one chunk.
    if chunks.is_empty() && !key.include_nodes.is_empty() {
        chunks.push(NodeList::new());
    }

    chunks
        .into_iter()
        .map(|mut chunk| {
            chunk.extend(key.include_nodes.iter().cloned());
            Chunk::new(chunk)
        })
        .collect()
}

fn select_contiguous(pool: &[NodeName], chunk_size: usize) -> NodeList {
    pool[..chunk_size].to_vec()
}

fn select_random(pool: &[NodeName], chunk_size: usize, rng: &mut impl Rng) -> NodeList {
    let picked = rand::seq::index::sample(rng, pool.len(), chunk_size);
    picked.iter().map(|i| pool[i].clone()).collect()
}

/// Pick every Nth node, N = pool_len / chunk_size.
fn select_distributed(pool: &[NodeName], chunk_size: usize) -> NodeList {
    let step = pool.len() / chunk_size;
    (0..chunk_size).map(|i| pool[i * step].clone()).collect()
}

/// Divide the pool into `chunk_size` equal-width strides and pick one random
/// node from each.
fn select_rand_dist(pool: &[NodeName], chunk_size: usize, rng: &mut impl Rng) -> NodeList {
    let step = pool.len() / chunk_size;
    (0..chunk_size)
        .map(|i| pool[i * step + rng.random_range(0..step)].clone())
        .collect()
}
