use {
  crate::primitives::Id,
  chrono::{DateTime, Utc},
  serde::{Deserialize, Serialize},
};

/// Errors raised by collaborator callbacks are propagated through
/// the core verbatim.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle state of a decidable item.
///
/// Transitions are monotonic, an accepted or rejected item never
/// changes state again.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Status {
  /// The item is not known to the consensus instance.
  Unknown,

  /// The item is in the pending tree and still being voted on.
  Processing,

  /// The item was finalized into the canonical chain.
  Accepted,

  /// A conflicting item was accepted instead.
  Rejected,
}

impl Status {
  /// Whether the item reached a terminal state.
  pub fn decided(&self) -> bool {
    matches!(self, Status::Accepted | Status::Rejected)
  }
}

/// An item the consensus can decide on.
///
/// `accept` and `reject` are the only legal status mutators.
/// Implementations must be idempotent when re-called with the same
/// outcome and must refuse the opposite outcome once decided.
pub trait Decidable {
  fn id(&self) -> Id;
  fn status(&self) -> Status;
  fn accept(&mut self) -> Result<(), BoxError>;
  fn reject(&mut self) -> Result<(), BoxError>;
}

/// The block facet the linear chain engine operates on.
///
/// Height must be the parent's height plus one, except for the
/// genesis block which sits at height zero with no parent. No
/// validation beyond ancestry and parent linkage happens here.
pub trait Block: Decidable + Send + Sync {
  fn parent(&self) -> Id;
  fn height(&self) -> u64;
  fn timestamp(&self) -> DateTime<Utc>;
  fn bytes(&self) -> &[u8];
}

/// Downstream sink for accepted blocks.
///
/// Called exactly once per accepted block, before the block's own
/// `accept` runs. The callback must not re-enter the consensus
/// instance.
pub trait Acceptor: Send + Sync {
  fn accept(&self, id: &Id, bytes: &[u8]) -> Result<(), BoxError>;
}

/// Persistence boundary for chain state owned by the outer system.
pub trait ChainState<B: Block>: Send + Sync {
  fn get_block(&self, id: &Id) -> Option<B>;
  fn put_block(&self, block: &B);
  fn get_last_accepted(&self) -> (Id, u64);
  fn set_last_accepted(&self, id: &Id, height: u64);
}
