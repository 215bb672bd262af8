//! Hierarchical data-parallel training.
//!
//! Devices of one node train a sharded replica together for `local_steps`
//! inner steps; then one device per shard position on every node averages the
//! drift from the last synchronized parameters and applies a Nesterov
//! momentum outer step, bringing all nodes back to identical parameters.

pub mod config;
pub mod data;
pub mod distributed;
pub mod launch;
pub mod metrics;
pub mod model;
pub mod offload;
pub mod outer;
pub mod schedule;
pub mod sharding;
pub mod topology;
pub mod trainer;

pub use config::Config;
pub use trainer::DilocoTrainer;
