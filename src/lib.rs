pub mod analysis;
pub mod api;
pub mod client;
pub mod config;
pub mod control;
pub mod harness;
pub mod shard;
pub mod stats;
pub mod wire;
pub mod workload;
