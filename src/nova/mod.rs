//! Linear chain consensus.
//!
//! Layers a topological tree of pending blocks over the sampling
//! primitive: polls vote on blocks, votes propagate transitively
//! towards the last accepted block, and a single chain of accepted
//! blocks emerges with every competing sibling rejected.

mod block;
mod finalizer;
mod tree;

pub use {
  block::{Acceptor, Block, BoxError, ChainState, Decidable, Status},
  finalizer::{Decision, Finalizer},
  tree::{Health, HealthError, Nova, NovaError, NovaEvent, NovaEvents},
};
