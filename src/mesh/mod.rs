//! Peer mesh networking using Chitchat.
//!
//! Nodes gossip their own writes to each other so that several limiter
//! processes can share bucket state without a central store.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError};

#[cfg(test)]
pub(crate) use cluster::tests::test_config;
