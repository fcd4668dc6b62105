//! The generic node inventory and the per-policy filter pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Map;
use crate::common::strutils::pluralize;
use crate::sched::config::{NodeState, ReservationRequest, ScheduleConfig};

pub type NodeName = String;
pub type NodeList = Vec<NodeName>;

/// Index into the plugin's node-list arena. Stable for the plugin's lifetime.
pub type NodeListId = usize;

/// Scheduler-agnostic view of one cluster node, produced from the backend's
/// native node data. Keys the core does not understand go into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    /// Whether the node is allocatable at all.
    pub up: bool,
    /// Whether the node is allocatable and currently unallocated.
    pub available: bool,
    pub cpus: Option<u32>,
    pub mem_bytes: Option<u64>,
    pub partitions: Vec<String>,
    pub reservations: Vec<String>,
    pub features: Vec<String>,
    pub extra: Map<String, String>,
}

/// Node name -> node data, built once per plugin lifetime and mutated only by
/// an explicit refresh.
pub type NodeInventory = Map<NodeName, Node>;

/// How many example node names are kept per filter reason.
const MAX_REASON_EXAMPLES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasonBucket {
    pub count: usize,
    /// The first few filtered nodes (in name order), for diagnostics.
    pub examples: Vec<NodeName>,
}

/// Human-readable reasons for every node a policy filtered out, bucketed by
/// the first predicate that rejected the node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterReasons {
    buckets: BTreeMap<String, ReasonBucket>,
}

impl FilterReasons {
    fn add(&mut self, reason: &str, node: &str) {
        let bucket = self.buckets.entry(reason.to_string()).or_default();
        bucket.count += 1;
        if bucket.examples.len() < MAX_REASON_EXAMPLES {
            bucket.examples.push(node.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReasonBucket)> {
        self.buckets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, reason: &str) -> Option<&ReasonBucket> {
        self.buckets.get(reason)
    }
}

impl fmt::Display for FilterReasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (reason, bucket) in &self.buckets {
            let elided = if bucket.count > bucket.examples.len() {
                ", ..."
            } else {
                ""
            };
            writeln!(
                f,
                "  {}: {} {} ({}{})",
                reason,
                bucket.count,
                pluralize("node", bucket.count),
                bucket.examples.join(", "),
                elided,
            )?;
        }
        Ok(())
    }
}

/// Filter an inventory down to the nodes one policy can use.
///
/// The predicates are ordered but logically independent; a node is bucketed
/// under the first one that rejects it. Nodes are visited in name order, so
/// the result does not depend on the inventory's iteration order. The caller
/// supplies the backend-specific predicate, which returns a rejection reason
/// or `None` to accept the node.
pub fn filter_nodes(
    inventory: &NodeInventory,
    config: &ScheduleConfig,
    custom_filter: impl Fn(&str, &Node) -> Option<String>,
) -> (NodeList, FilterReasons) {
    let mut names: Vec<&NodeName> = inventory.keys().collect();
    names.sort();

    let mut out = NodeList::new();
    let mut reasons = FilterReasons::default();

    for name in names {
        let node = &inventory[name];
        if let Some(reason) = reject_node(name, node, config, &custom_filter) {
            reasons.add(&reason, name);
        } else {
            out.push(name.clone());
        }
    }

    (out, reasons)
}

fn reject_node(
    name: &str,
    node: &Node,
    config: &ScheduleConfig,
    custom_filter: &impl Fn(&str, &Node) -> Option<String>,
) -> Option<String> {
    if !node.up {
        return Some("not up".into());
    }

    if config.node_state == NodeState::Available && !node.available {
        return Some("not available".into());
    }

    if let Some(partition) = &config.partition {
        if !node.partitions.contains(partition) {
            return Some(format!("not in partition '{partition}'"));
        }
    }

    // Nodes that belong to reservations are only usable when the policy asks
    // for one of those reservations (or explicitly accepts any).
    if !node.reservations.is_empty() {
        match &config.reservation {
            Some(ReservationRequest::Any) => {}
            Some(ReservationRequest::Named(reservation))
                if node.reservations.contains(reservation) => {}
            _ => return Some("reservation mismatch".into()),
        }
    }

    if !config.across_nodes.is_empty() && !config.across_nodes.iter().any(|n| n == name) {
        return Some("not in across_nodes".into());
    }

    if config.exclude_nodes.iter().any(|n| n == name) {
        return Some("excluded".into());
    }

    custom_filter(name, node)
}

/// Arena of filtered node lists, deduplicated by value. Lists are referenced
/// by index thereafter, so identical filtered lists share one id.
#[derive(Debug, Default)]
pub struct NodeListArena {
    lists: Vec<NodeList>,
}

impl NodeListArena {
    pub fn intern(&mut self, list: NodeList) -> NodeListId {
        match self.lists.iter().position(|known| *known == list) {
            Some(id) => id,
            None => {
                self.lists.push(list);
                self.lists.len() - 1
            }
        }
    }

    pub fn get(&self, id: NodeListId) -> Option<&NodeList> {
        self.lists.get(id)
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sched::config::ChunkingConfig;
    use crate::sched::config::NodeCount;

    /// Build a small inventory: `count` nodes named n0..nN, all up/available,
    /// in partition "standard".
    pub(crate) fn make_inventory(count: usize) -> NodeInventory {
        let mut inventory = NodeInventory::default();
        for i in 0..count {
            let name = format!("n{i}");
            inventory.insert(
                name.clone(),
                Node {
                    name,
                    up: true,
                    available: true,
                    cpus: Some(16),
                    mem_bytes: Some(64 << 30),
                    partitions: vec!["standard".into()],
                    ..Default::default()
                },
            );
        }
        inventory
    }

    fn no_custom(_: &str, _: &Node) -> Option<String> {
        None
    }

    #[test]
    fn filter_is_insertion_order_independent() {
        let inventory = make_inventory(20);
        let mut reversed = NodeInventory::default();
        let mut names: Vec<_> = inventory.keys().cloned().collect();
        names.sort();
        names.reverse();
        for name in names {
            reversed.insert(name.clone(), inventory[&name].clone());
        }

        let config = ScheduleConfig::default();
        let (list_a, reasons_a) = filter_nodes(&inventory, &config, no_custom);
        let (list_b, reasons_b) = filter_nodes(&reversed, &config, no_custom);
        assert_eq!(list_a, list_b);
        assert_eq!(reasons_a, reasons_b);
    }

    #[test]
    fn filter_buckets_by_first_reason() {
        let mut inventory = make_inventory(6);
        inventory.get_mut("n0").unwrap().up = false;
        // Down and excluded; only the first predicate should claim it.
        inventory.get_mut("n1").unwrap().up = false;
        let config = ScheduleConfig {
            exclude_nodes: vec!["n1".into(), "n2".into()],
            ..Default::default()
        };

        let (list, reasons) = filter_nodes(&inventory, &config, no_custom);
        assert_eq!(list, vec!["n3", "n4", "n5"]);
        assert_eq!(reasons.get("not up").unwrap().count, 2);
        assert_eq!(reasons.get("excluded").unwrap().examples, vec!["n2"]);
    }

    #[test]
    fn filter_respects_node_state() {
        let mut inventory = make_inventory(4);
        inventory.get_mut("n2").unwrap().available = false;

        let up_config = ScheduleConfig::default();
        let (list, _) = filter_nodes(&inventory, &up_config, no_custom);
        assert_eq!(list.len(), 4);

        let avail_config = ScheduleConfig {
            node_state: NodeState::Available,
            ..Default::default()
        };
        let (list, reasons) = filter_nodes(&inventory, &avail_config, no_custom);
        assert_eq!(list, vec!["n0", "n1", "n3"]);
        assert_eq!(reasons.get("not available").unwrap().count, 1);
    }

    #[test]
    fn filter_reservation_rules() {
        let mut inventory = make_inventory(3);
        inventory.get_mut("n1").unwrap().reservations = vec!["dst".into()];

        // No reservation requested: reserved nodes are excluded.
        let config = ScheduleConfig::default();
        let (list, _) = filter_nodes(&inventory, &config, no_custom);
        assert_eq!(list, vec!["n0", "n2"]);

        // Matching reservation requested: the node is usable.
        let config = ScheduleConfig {
            reservation: Some(ReservationRequest::Named("dst".into())),
            ..Default::default()
        };
        let (list, _) = filter_nodes(&inventory, &config, no_custom);
        assert_eq!(list.len(), 3);

        // Mismatched reservation: excluded again.
        let config = ScheduleConfig {
            reservation: Some(ReservationRequest::Named("other".into())),
            ..Default::default()
        };
        let (list, _) = filter_nodes(&inventory, &config, no_custom);
        assert_eq!(list, vec!["n0", "n2"]);

        // 'any' accepts reserved nodes wholesale.
        let config = ScheduleConfig {
            reservation: Some(ReservationRequest::Any),
            ..Default::default()
        };
        let (list, _) = filter_nodes(&inventory, &config, no_custom);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn filter_partition_and_allow_list() {
        let mut inventory = make_inventory(5);
        inventory.get_mut("n4").unwrap().partitions = vec!["debug".into()];

        let config = ScheduleConfig {
            partition: Some("debug".into()),
            ..Default::default()
        };
        let (list, _) = filter_nodes(&inventory, &config, no_custom);
        assert_eq!(list, vec!["n4"]);

        let config = ScheduleConfig {
            across_nodes: vec!["n1".into(), "n3".into()],
            ..Default::default()
        };
        let (list, reasons) = filter_nodes(&inventory, &config, no_custom);
        assert_eq!(list, vec!["n1", "n3"]);
        assert_eq!(reasons.get("not in across_nodes").unwrap().count, 3);
    }

    #[test]
    fn filter_custom_predicate_reason() {
        let inventory = make_inventory(4);
        let config = ScheduleConfig::default();
        let (list, reasons) = filter_nodes(&inventory, &config, |name, _| {
            (name == "n2").then(|| "slurm: draining".to_string())
        });
        assert_eq!(list, vec!["n0", "n1", "n3"]);
        assert_eq!(reasons.get("slurm: draining").unwrap().examples, vec!["n2"]);
    }

    #[test]
    fn reason_examples_are_capped() {
        let mut inventory = make_inventory(30);
        for node in inventory.values_mut() {
            node.up = false;
        }
        let (list, reasons) = filter_nodes(&inventory, &ScheduleConfig::default(), no_custom);
        assert!(list.is_empty());
        let bucket = reasons.get("not up").unwrap();
        assert_eq!(bucket.count, 30);
        assert_eq!(bucket.examples.len(), 10);
    }

    #[test]
    fn arena_deduplicates_by_value() {
        let mut arena = NodeListArena::default();
        let a = arena.intern(vec!["n0".into(), "n1".into()]);
        let b = arena.intern(vec!["n2".into()]);
        let c = arena.intern(vec!["n0".into(), "n1".into()]);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(b).unwrap(), &vec!["n2".to_string()]);
    }

    #[test]
    fn chunking_config_is_policy_data() {
        // Chunk settings ride along in the policy used for filtering but do
        // not affect the filter result.
        let inventory = make_inventory(6);
        let chunked = ScheduleConfig {
            chunking: ChunkingConfig {
                size: Some(NodeCount::Count(2)),
                ..Default::default()
            },
            ..Default::default()
        };
        let (list_a, _) = filter_nodes(&inventory, &chunked, no_custom);
        let (list_b, _) = filter_nodes(&inventory, &ScheduleConfig::default(), no_custom);
        assert_eq!(list_a, list_b);
    }
}
