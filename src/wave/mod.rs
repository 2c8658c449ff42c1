//! Fast-path certificates for owned-object transactions.
//!
//! Votes ride on ordinary blocks produced by the host DAG: every
//! block may carry references to transactions its author vouches
//! for. Transactions touching only owned objects reach an
//! executable state after a byzantine quorum of such votes, well
//! before the anchor chain orders them. Shared and mixed
//! transactions always take the anchor path.

mod fpc;

pub use fpc::{FpcStatus, WaveFpc};

use crate::{
  primitives::{Id, NodeId, ObjectId, TxRef},
  ringtail::Certificate,
};

/// Splits transactions into owned-only and shared/mixed.
///
/// An empty owned-input set marks the transaction as shared or
/// mixed, which excludes it from the fast path.
pub trait Classifier: Send + Sync {
  fn owned_inputs(&self, tx: &TxRef) -> Vec<ObjectId>;
  fn conflicts(&self, a: &TxRef, b: &TxRef) -> bool;
}

/// Read access into the host DAG.
pub trait DagTap: Send + Sync {
  /// Whether the ancestry of a block contains a transaction.
  fn in_ancestry(&self, block_id: &Id, tx: &TxRef) -> bool;

  /// The block a validator produced in a given round, if any.
  fn get_block_by_author_round(
    &self,
    author: &NodeId,
    round: u64,
  ) -> Option<Id>;
}

/// The post-quantum certificate engine fed by the fast path.
pub trait PqEngine: Send + Sync {
  fn submit(&self, tx: &TxRef, voters: &[NodeId]);
  fn has_pq(&self, tx: &TxRef) -> bool;
  fn get_pq(&self, tx: &TxRef) -> Option<Certificate>;
}

/// The facet of a host block the fast path reads.
pub trait FpcBlock {
  fn id(&self) -> Id;
  fn author(&self) -> NodeId;
  fn round(&self) -> u64;
  fn fpc_votes(&self) -> Vec<TxRef>;
  fn epoch_bit(&self) -> bool;
}
