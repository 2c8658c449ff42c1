use {
  crate::{
    nova::{Acceptor, Block, BoxError, ChainState, Decidable, Status},
    primitives::{Id, NodeId, ObjectId, TxRef},
    validators::{Validator, ValidatorSet},
    wave::{Classifier, DagTap, FpcBlock},
  },
  chrono::{DateTime, Utc},
  std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
  },
};

pub fn id(b: u8) -> Id {
  Id::new([b; 32])
}

pub fn node(b: u8) -> NodeId {
  NodeId::new([b; 32])
}

pub fn txref(b: u8) -> TxRef {
  TxRef::new([b; 32])
}

pub fn object(b: u8) -> ObjectId {
  ObjectId::new([b; 32])
}

/// A committee of equally weighted validators with ids 1..=n.
pub fn committee(n: u8) -> ValidatorSet {
  ValidatorSet::new(
    (1..=n)
      .map(|i| Validator {
        id: node(i),
        weight: 1,
      })
      .collect(),
  )
  .unwrap()
}

struct BlockMeta {
  id: Id,
  parent: Id,
  height: u64,
  timestamp: DateTime<Utc>,
  bytes: Vec<u8>,
}

/// A block whose decision state is observable from outside the
/// tree through cloned handles.
#[derive(Clone)]
pub struct TestBlock {
  meta: Arc<BlockMeta>,
  status: Arc<Mutex<Status>>,
}

impl TestBlock {
  pub fn genesis(byte: u8) -> Self {
    Self {
      meta: Arc::new(BlockMeta {
        id: id(byte),
        parent: Id::default(),
        height: 0,
        timestamp: Utc::now(),
        bytes: vec![],
      }),
      status: Arc::new(Mutex::new(Status::Accepted)),
    }
  }

  pub fn build(parent: &TestBlock, byte: u8) -> Self {
    Self {
      meta: Arc::new(BlockMeta {
        id: id(byte),
        parent: parent.meta.id,
        height: parent.meta.height + 1,
        timestamp: Utc::now(),
        bytes: vec![byte; 8],
      }),
      status: Arc::new(Mutex::new(Status::Processing)),
    }
  }
}

impl Decidable for TestBlock {
  fn id(&self) -> Id {
    self.meta.id
  }

  fn status(&self) -> Status {
    *self.status.lock().unwrap()
  }

  fn accept(&mut self) -> Result<(), BoxError> {
    let mut status = self.status.lock().unwrap();
    match *status {
      Status::Rejected => Err("block is already rejected".into()),
      _ => {
        *status = Status::Accepted;
        Ok(())
      }
    }
  }

  fn reject(&mut self) -> Result<(), BoxError> {
    let mut status = self.status.lock().unwrap();
    match *status {
      Status::Accepted => Err("block is already accepted".into()),
      _ => {
        *status = Status::Rejected;
        Ok(())
      }
    }
  }
}

impl Block for TestBlock {
  fn parent(&self) -> Id {
    self.meta.parent
  }

  fn height(&self) -> u64 {
    self.meta.height
  }

  fn timestamp(&self) -> DateTime<Utc> {
    self.meta.timestamp
  }

  fn bytes(&self) -> &[u8] {
    &self.meta.bytes
  }
}

/// Captures acceptor callbacks in order, optionally failing on a
/// designated block.
#[derive(Default)]
pub struct RecordingAcceptor {
  accepted: Mutex<Vec<(Id, Vec<u8>)>>,
  fail_on: Option<Id>,
}

impl RecordingAcceptor {
  pub fn failing_on(id: Id) -> Self {
    Self {
      accepted: Mutex::new(vec![]),
      fail_on: Some(id),
    }
  }

  pub fn ids(&self) -> Vec<Id> {
    self
      .accepted
      .lock()
      .unwrap()
      .iter()
      .map(|(id, _)| *id)
      .collect()
  }

  pub fn bytes_of(&self, id: &Id) -> Option<Vec<u8>> {
    self
      .accepted
      .lock()
      .unwrap()
      .iter()
      .find(|(accepted, _)| accepted == id)
      .map(|(_, bytes)| bytes.clone())
  }
}

impl Acceptor for RecordingAcceptor {
  fn accept(&self, id: &Id, bytes: &[u8]) -> Result<(), BoxError> {
    if self.fail_on == Some(*id) {
      return Err("acceptor refused the block".into());
    }
    self
      .accepted
      .lock()
      .unwrap()
      .push((*id, bytes.to_vec()));
    Ok(())
  }
}

/// A host DAG block carrying fast-path votes.
pub struct HostBlock {
  pub id: Id,
  pub author: NodeId,
  pub round: u64,
  pub votes: Vec<TxRef>,
  pub epoch_bit: bool,
}

impl HostBlock {
  pub fn new(id: Id, author: NodeId, votes: Vec<TxRef>) -> Self {
    Self {
      id,
      author,
      round: 0,
      votes,
      epoch_bit: false,
    }
  }

  pub fn with_epoch_bit(mut self) -> Self {
    self.epoch_bit = true;
    self
  }
}

impl FpcBlock for HostBlock {
  fn id(&self) -> Id {
    self.id
  }

  fn author(&self) -> NodeId {
    self.author
  }

  fn round(&self) -> u64 {
    self.round
  }

  fn fpc_votes(&self) -> Vec<TxRef> {
    self.votes.clone()
  }

  fn epoch_bit(&self) -> bool {
    self.epoch_bit
  }
}

/// Classifies transactions from a fixed owned-input table.
#[derive(Default)]
pub struct StaticClassifier {
  owned: HashMap<TxRef, Vec<ObjectId>>,
}

impl StaticClassifier {
  pub fn owning(mut self, tx: TxRef, objects: Vec<ObjectId>) -> Self {
    self.owned.insert(tx, objects);
    self
  }
}

impl Classifier for StaticClassifier {
  fn owned_inputs(&self, tx: &TxRef) -> Vec<ObjectId> {
    self.owned.get(tx).cloned().unwrap_or_default()
  }

  fn conflicts(&self, a: &TxRef, b: &TxRef) -> bool {
    let Some(owned_a) = self.owned.get(a) else {
      return false;
    };
    let Some(owned_b) = self.owned.get(b) else {
      return false;
    };
    owned_a.iter().any(|object| owned_b.contains(object))
  }
}

/// A scripted DAG ancestry relation.
#[derive(Default)]
pub struct StaticDag {
  ancestry: Mutex<HashSet<(Id, TxRef)>>,
}

impl StaticDag {
  pub fn link(&self, block: Id, tx: TxRef) {
    self.ancestry.lock().unwrap().insert((block, tx));
  }
}

impl DagTap for StaticDag {
  fn in_ancestry(&self, block_id: &Id, tx: &TxRef) -> bool {
    self.ancestry.lock().unwrap().contains(&(*block_id, *tx))
  }

  fn get_block_by_author_round(
    &self,
    _author: &NodeId,
    _round: u64,
  ) -> Option<Id> {
    None
  }
}

/// Chain state held in memory.
pub struct InMemChainState {
  blocks: Mutex<HashMap<Id, TestBlock>>,
  last_accepted: Mutex<(Id, u64)>,
}

impl InMemChainState {
  pub fn starting_at(id: Id, height: u64) -> Self {
    Self {
      blocks: Mutex::new(HashMap::new()),
      last_accepted: Mutex::new((id, height)),
    }
  }
}

impl ChainState<TestBlock> for InMemChainState {
  fn get_block(&self, id: &Id) -> Option<TestBlock> {
    self.blocks.lock().unwrap().get(id).cloned()
  }

  fn put_block(&self, block: &TestBlock) {
    self
      .blocks
      .lock()
      .unwrap()
      .insert(Decidable::id(block), block.clone());
  }

  fn get_last_accepted(&self) -> (Id, u64) {
    *self.last_accepted.lock().unwrap()
  }

  fn set_last_accepted(&self, id: &Id, height: u64) {
    *self.last_accepted.lock().unwrap() = (*id, height);
  }
}
