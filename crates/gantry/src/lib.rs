//! The scheduler engine of the gantry test harness. Test configuration
//! resolution, builds and result handling live in their own crates; this one
//! takes validated scheduling policies and build-complete test handles,
//! carves the cluster into reusable node chunks, groups tests into batch
//! allocations, dispatches them through a scheduler backend (Slurm, local
//! execution, ...) and tracks the resulting jobs to completion.

pub mod common;
pub mod sched;

pub use common::{Map, Set};
