//! The validated scheduling policy consumed by the engine. The raw `schedule:`
//! section of a test config is parsed and type-checked by the config resolver;
//! what arrives here is already structured. Validation below only enforces the
//! cross-field constraints the resolver cannot see.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedConfigError {
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
    #[error("Node fraction for '{key}' must be within (0, 1], got {value}")]
    BadFraction { key: String, value: f64 },
    #[error("Nodes {nodes:?} appear in both include_nodes and exclude_nodes")]
    IncludeExcludeOverlap { nodes: Vec<String> },
}

/// A node count specification. Fractions are resolved against the number of
/// nodes actually available at scheduling time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NodeCount {
    Count(u64),
    Fraction(f64),
    All,
}

impl NodeCount {
    /// Parse a raw node count: an integer, a percentage like `50%`, or `all`.
    pub fn parse(key: &str, raw: &str) -> Result<NodeCount, SchedConfigError> {
        let raw = raw.trim();
        if raw == "all" {
            return Ok(NodeCount::All);
        }
        if let Some(percent) = raw.strip_suffix('%') {
            let value: f64 = percent.parse().map_err(|_| SchedConfigError::InvalidValue {
                key: key.into(),
                message: format!("invalid percentage '{raw}'"),
            })?;
            return Ok(NodeCount::Fraction(value / 100.0));
        }
        raw.parse()
            .map(NodeCount::Count)
            .map_err(|_| SchedConfigError::InvalidValue {
                key: key.into(),
                message: format!("expected an integer, percentage or 'all', got '{raw}'"),
            })
    }

    /// Resolve against an available-node count. Fractions round up and always
    /// yield at least one node.
    pub fn resolve(&self, available: usize) -> u64 {
        match self {
            NodeCount::Count(count) => *count,
            NodeCount::Fraction(fraction) => {
                ((fraction * available as f64).ceil() as u64).max(1)
            }
            NodeCount::All => available as u64,
        }
    }

    fn check(&self, key: &str) -> Result<(), SchedConfigError> {
        match self {
            NodeCount::Fraction(f) if !(*f > 0.0 && *f <= 1.0) => {
                Err(SchedConfigError::BadFraction {
                    key: key.into(),
                    value: *f,
                })
            }
            NodeCount::Count(0) => Err(SchedConfigError::InvalidValue {
                key: key.into(),
                message: "node count must be at least 1".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Which node states a policy considers usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Any node that is up, allocated or not.
    #[default]
    Up,
    /// Only nodes that are up and currently unallocated.
    Available,
}

/// A requested reservation. `Any` accepts nodes regardless of which
/// reservations they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationRequest {
    Named(String),
    Any,
}

/// Whether tests under this policy may execute inside one batch allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShareMode {
    No,
    #[default]
    Yes,
    /// Share, and keep the allocation at the full chunk size even when the
    /// grouped tests need fewer nodes.
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeSelection {
    #[default]
    Contiguous,
    Random,
    Distributed,
    RandDist,
}

/// What to do with nodes left over after chunk partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChunkExtra {
    #[default]
    Backfill,
    Discard,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Chunk size: a literal count or a fraction of the filtered node list.
    /// Unset (or zero) disables chunking, every chunk is the whole list.
    pub size: Option<NodeCount>,
    pub node_selection: NodeSelection,
    pub extra: ChunkExtra,
}

impl ChunkingConfig {
    pub fn enabled(&self) -> bool {
        !matches!(self.size, None | Some(NodeCount::Count(0)))
    }
}

/// Manually configured node information for backends that cannot enumerate
/// nodes themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub node_count: Option<usize>,
    pub cpus: Option<u32>,
    pub mem_bytes: Option<u64>,
}

/// A fully validated scheduling policy for one test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub nodes: Option<NodeCount>,
    pub min_nodes: Option<NodeCount>,
    /// Task count, for allocations sized by tasks rather than nodes.
    pub tasks: Option<u64>,
    pub node_state: NodeState,
    pub partition: Option<String>,
    pub reservation: Option<ReservationRequest>,
    pub qos: Option<String>,
    pub account: Option<String>,
    pub time_limit: Option<Duration>,
    pub share_allocation: ShareMode,
    /// Nodes unioned into every chunk; allocations under this policy can
    /// therefore never run concurrently.
    pub include_nodes: Vec<String>,
    pub exclude_nodes: Vec<String>,
    /// Allow-list: when non-empty, only these nodes pass filtering.
    pub across_nodes: Vec<String>,
    pub chunking: ChunkingConfig,
    pub cluster_info: ClusterInfo,
}

impl ScheduleConfig {
    /// Cross-field validation. Fails before any inventory or chunk work
    /// begins, and is fatal for every test sharing the policy.
    pub fn validate(&self) -> Result<(), SchedConfigError> {
        for (key, value) in [
            ("nodes", &self.nodes),
            ("min_nodes", &self.min_nodes),
            ("chunking.size", &self.chunking.size),
        ] {
            if let Some(count) = value {
                // A literal 0 is only meaningful for the chunk size.
                if key == "chunking.size" && *count == NodeCount::Count(0) {
                    continue;
                }
                count.check(key)?;
            }
        }

        if self.tasks == Some(0) {
            return Err(SchedConfigError::InvalidValue {
                key: "tasks".into(),
                message: "task count must be at least 1".into(),
            });
        }

        let overlap: Vec<String> = self
            .include_nodes
            .iter()
            .filter(|node| self.exclude_nodes.contains(node))
            .cloned()
            .collect();
        if !overlap.is_empty() {
            return Err(SchedConfigError::IncludeExcludeOverlap { nodes: overlap });
        }

        Ok(())
    }

    /// A test is flex-scheduled when chunking is disabled and the policy names
    /// no explicit nodes, so the backend scheduler is free to pick any nodes.
    pub fn flex_scheduled(&self) -> bool {
        !self.chunking.enabled() && self.across_nodes.is_empty() && self.include_nodes.is_empty()
    }
}

/// The concrete node range an allocation request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRange {
    pub min: u64,
    /// `None` only when sizing is driven purely by tasks; the backend then
    /// decides how many nodes the tasks need.
    pub max: Option<u64>,
}

/// Turn a policy's nodes/min_nodes specification plus an available-node count
/// into a concrete range.
pub fn calc_node_range(config: &ScheduleConfig, available: usize) -> NodeRange {
    let mut nodes = config.nodes;
    if nodes.is_none() && config.tasks.is_none() {
        nodes = Some(NodeCount::Count(1));
    }

    let max = nodes.map(|count| count.resolve(available));

    let min = match config.min_nodes {
        None | Some(NodeCount::Count(0)) => max.unwrap_or(1),
        Some(count) => count.resolve(available),
    };

    NodeRange {
        min: min.max(1),
        max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_node_counts() {
        assert_eq!(NodeCount::parse("nodes", "all").unwrap(), NodeCount::All);
        assert_eq!(
            NodeCount::parse("nodes", "50%").unwrap(),
            NodeCount::Fraction(0.5)
        );
        assert_eq!(
            NodeCount::parse("nodes", "12").unwrap(),
            NodeCount::Count(12)
        );
        assert!(NodeCount::parse("nodes", "half").is_err());
    }

    #[test]
    fn fractional_nodes_round_up() {
        let config = ScheduleConfig {
            nodes: Some(NodeCount::Fraction(0.5)),
            ..Default::default()
        };
        assert_eq!(calc_node_range(&config, 10).max, Some(5));
        // Tiny fractions still request at least one node.
        let config = ScheduleConfig {
            nodes: Some(NodeCount::Fraction(0.01)),
            ..Default::default()
        };
        assert_eq!(calc_node_range(&config, 10).max, Some(1));
    }

    #[test]
    fn all_nodes_is_available_count() {
        let config = ScheduleConfig {
            nodes: Some(NodeCount::All),
            ..Default::default()
        };
        assert_eq!(calc_node_range(&config, 37).max, Some(37));
    }

    #[test]
    fn min_defaults_to_max() {
        let config = ScheduleConfig {
            nodes: Some(NodeCount::Count(4)),
            ..Default::default()
        };
        let range = calc_node_range(&config, 10);
        assert_eq!(range.min, 4);
        assert_eq!(range.max, Some(4));
    }

    #[test]
    fn unset_nodes_defaults_to_one() {
        let range = calc_node_range(&ScheduleConfig::default(), 10);
        assert_eq!(range.min, 1);
        assert_eq!(range.max, Some(1));
    }

    #[test]
    fn tasks_only_leaves_max_open() {
        let config = ScheduleConfig {
            tasks: Some(128),
            ..Default::default()
        };
        let range = calc_node_range(&config, 10);
        assert_eq!(range.min, 1);
        assert_eq!(range.max, None);
    }

    #[test]
    fn fractional_min_nodes() {
        let config = ScheduleConfig {
            nodes: Some(NodeCount::All),
            min_nodes: Some(NodeCount::Fraction(0.25)),
            ..Default::default()
        };
        let range = calc_node_range(&config, 10);
        assert_eq!(range.min, 3);
        assert_eq!(range.max, Some(10));
    }

    #[test]
    fn validate_rejects_bad_fractions() {
        let config = ScheduleConfig {
            nodes: Some(NodeCount::Fraction(1.5)),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ScheduleConfig {
            nodes: Some(NodeCount::Count(0)),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_include_exclude_overlap() {
        let config = ScheduleConfig {
            include_nodes: vec!["n3".into()],
            exclude_nodes: vec!["n3".into(), "n4".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedConfigError::IncludeExcludeOverlap { .. })
        ));
    }

    #[test]
    fn chunk_size_zero_means_disabled() {
        let chunking = ChunkingConfig {
            size: Some(NodeCount::Count(0)),
            ..Default::default()
        };
        assert!(!chunking.enabled());
        let config = ScheduleConfig {
            chunking,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.flex_scheduled());
    }

    #[test]
    fn flex_scheduling_requires_no_pinned_nodes() {
        let config = ScheduleConfig {
            across_nodes: vec!["n1".into()],
            ..Default::default()
        };
        assert!(!config.flex_scheduled());
        let config = ScheduleConfig {
            chunking: ChunkingConfig {
                size: Some(NodeCount::Count(4)),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!config.flex_scheduled());
    }
}
