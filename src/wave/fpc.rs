use {
  super::{Classifier, DagTap, FpcBlock, PqEngine},
  crate::{
    metrics::{Counter, MetricsRegistry},
    primitives::{Bitset, NodeId, ObjectId, TxRef},
    validators::ValidatorSet,
  },
  dashmap::{DashMap, DashSet},
  std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  tracing::{debug, info},
};

/// Fast-path state of a transaction. Transitions never go
/// backwards: `Pending` moves to `Executable` or `Mixed`, both may
/// end up `Final`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpcStatus {
  /// Known but without a quorum of votes yet.
  Pending,

  /// A byzantine quorum vouched for the transaction, it may run
  /// speculatively against its owned objects.
  Executable,

  /// Covered by an accepted anchor block or by a dual certificate.
  Final,

  /// Touches shared state, only the anchor path may finalize it.
  Mixed,
}

struct TxState {
  status: FpcStatus,
  voters: Bitset,
}

struct FpcMetrics {
  votes_recorded: Counter,
  votes_shared_ignored: Counter,
  equivocations: Counter,
  executable: Counter,
  finalized: Counter,
}

/// Tracks owned-object votes piggybacked on host blocks.
///
/// State lives in sharded maps so that votes for independent
/// transactions land in parallel. A transaction becomes executable
/// once 2f+1 distinct validators vouched for it, and final once an
/// accepted anchor block covers it or once both certificate flavors
/// exist for it.
pub struct WaveFpc {
  committee: ValidatorSet,
  self_id: NodeId,
  classifier: Arc<dyn Classifier>,
  dag: Arc<dyn DagTap>,
  pq: Option<Arc<dyn PqEngine>>,

  txs: DashMap<TxRef, TxState>,
  /// First-vote rule: the transaction each validator first vouched
  /// for on each object. Never rewritten.
  object_votes: DashMap<(NodeId, ObjectId), TxRef>,
  /// Distinct transactions that received any vote per object.
  conflict_sets: DashMap<ObjectId, Vec<TxRef>>,
  /// Validators whose accepted blocks carried the epoch bit.
  epoch_closers: DashSet<NodeId>,
  paused: AtomicBool,

  metrics: FpcMetrics,
}

impl WaveFpc {
  pub fn new(
    committee: ValidatorSet,
    self_id: NodeId,
    classifier: Arc<dyn Classifier>,
    dag: Arc<dyn DagTap>,
    pq: Option<Arc<dyn PqEngine>>,
    registry: &dyn MetricsRegistry,
  ) -> Self {
    Self {
      committee,
      self_id,
      classifier,
      dag,
      pq,
      txs: DashMap::new(),
      object_votes: DashMap::new(),
      conflict_sets: DashMap::new(),
      epoch_closers: DashSet::new(),
      paused: AtomicBool::new(false),
      metrics: FpcMetrics {
        votes_recorded: registry.counter("fpc_votes_recorded"),
        votes_shared_ignored: registry.counter("fpc_votes_shared_ignored"),
        equivocations: registry.counter("fpc_equivocations"),
        executable: registry.counter("fpc_executable"),
        finalized: registry.counter("fpc_finalized"),
      },
    }
  }

  /// Number of distinct validators that constitutes a quorum.
  pub fn quorum(&self) -> usize {
    self.committee.quorum()
  }

  /// Ingests the fast-path votes of a freshly observed block.
  ///
  /// Votes for shared transactions are ignored. A vote whose
  /// author already vouched for a different transaction on any of
  /// the touched objects is discarded whole as an equivocation.
  pub fn on_block_observed(&self, block: &dyn FpcBlock) {
    let author = block.author();
    let Some(author_index) = self.committee.index_of(&author) else {
      debug!("ignoring votes from unknown validator {author}");
      return;
    };

    for tx in block.fpc_votes() {
      let owned = self.classifier.owned_inputs(&tx);
      if owned.is_empty() {
        self.metrics.votes_shared_ignored.inc();
        continue;
      }

      let equivocates = owned.iter().any(|object| {
        self
          .object_votes
          .get(&(author, *object))
          .map(|first| *first != tx)
          .unwrap_or(false)
      });
      if equivocates {
        debug!("discarding equivocating vote of {author} for {tx}");
        self.metrics.equivocations.inc();
        continue;
      }

      for object in &owned {
        self.object_votes.entry((author, *object)).or_insert(tx);
        let mut conflicts =
          self.conflict_sets.entry(*object).or_default();
        if !conflicts.contains(&tx) {
          conflicts.push(tx);
        }
      }

      self.metrics.votes_recorded.inc();
      self.record_voter(&tx, author_index);
    }
  }

  /// Flips the voter bit and promotes the transaction once the
  /// quorum is reached, handing the voter list to the certificate
  /// engine.
  fn record_voter(&self, tx: &TxRef, author_index: usize) {
    let mut promoted_voters = None;
    {
      let mut state = self.txs.entry(*tx).or_insert_with(|| TxState {
        status: FpcStatus::Pending,
        voters: Bitset::new(self.committee.len()),
      });

      if state.voters.set(author_index) != Ok(true) {
        return;
      }
      if state.status == FpcStatus::Pending
        && state.voters.count() >= self.committee.quorum()
      {
        state.status = FpcStatus::Executable;
        promoted_voters = Some(
          state
            .voters
            .ones()
            .filter_map(|i| self.committee.get(i).map(|v| v.id))
            .collect::<Vec<_>>(),
        );
      }
    }

    if let Some(voters) = promoted_voters {
      info!("transaction {tx} is executable with {} votes", voters.len());
      self.metrics.executable.inc();
      if let Some(pq) = &self.pq {
        pq.submit(tx, &voters);
      }
    }
  }

  /// Picks up to `budget` transactions this node can vouch for in
  /// its next block.
  ///
  /// Candidates come from the outer mempool or DAG frontier. Only
  /// owned-only transactions qualify, and never one that collides
  /// with an earlier own vote on any of its objects. Selected
  /// candidates reserve this node's object votes immediately, so
  /// later candidates in the same call respect them.
  pub fn next_votes<I>(&self, candidates: I, budget: usize) -> Vec<TxRef>
  where
    I: IntoIterator<Item = TxRef>,
  {
    if self.paused.load(Ordering::Acquire) {
      return vec![];
    }

    let mut votes = vec![];
    for tx in candidates {
      if votes.len() >= budget {
        break;
      }
      if let Some(state) = self.txs.get(&tx) {
        if state.status == FpcStatus::Mixed {
          continue;
        }
      }

      let owned = self.classifier.owned_inputs(&tx);
      if owned.is_empty() {
        continue;
      }
      let collides = owned.iter().any(|object| {
        self
          .object_votes
          .get(&(self.self_id, *object))
          .map(|first| *first != tx)
          .unwrap_or(false)
      });
      if collides {
        continue;
      }
      if votes
        .iter()
        .any(|picked| self.classifier.conflicts(picked, &tx))
      {
        continue;
      }

      for object in &owned {
        self
          .object_votes
          .entry((self.self_id, *object))
          .or_insert(tx);
      }
      votes.push(tx);
    }
    votes
  }

  /// Reacts to a block being accepted by the anchor chain.
  ///
  /// Executable transactions covered by the block's ancestry
  /// become final. Accepted epoch-bit blocks register their author
  /// towards closing the epoch.
  pub fn on_block_accepted(&self, block: &dyn FpcBlock) {
    let block_id = block.id();
    for tx in block.fpc_votes() {
      let Some(mut state) = self.txs.get_mut(&tx) else {
        continue;
      };
      let anchored = match state.status {
        FpcStatus::Executable => {
          state.voters.count() >= self.committee.quorum()
            && self.dag.in_ancestry(&block_id, &tx)
        }
        // mixed transactions have no voter quorum to show, the
        // anchor ordering alone finalizes them
        FpcStatus::Mixed => self.dag.in_ancestry(&block_id, &tx),
        _ => false,
      };
      if anchored {
        state.status = FpcStatus::Final;
        drop(state);
        info!("transaction {tx} is final, anchored by {block_id}");
        self.metrics.finalized.inc();
      }
    }

    if block.epoch_bit() {
      self.epoch_closers.insert(block.author());
    }
  }

  /// Promotes an executable transaction to final on the strength
  /// of its certificate pair. Requires the post-quantum proof to
  /// exist, the caller attests the BLS aggregate.
  pub fn on_dual_certificate(&self, tx: &TxRef) -> bool {
    let has_pq = self
      .pq
      .as_ref()
      .map(|pq| pq.has_pq(tx))
      .unwrap_or(false);
    if !has_pq {
      return false;
    }

    let Some(mut state) = self.txs.get_mut(tx) else {
      return false;
    };
    if state.status != FpcStatus::Executable {
      return false;
    }
    state.status = FpcStatus::Final;
    drop(state);
    info!("transaction {tx} is final through its certificate pair");
    self.metrics.finalized.inc();
    true
  }

  /// Takes a transaction off the fast path for touching shared
  /// state. Idempotent, and a no-op once the transaction advanced
  /// past pending.
  pub fn mark_mixed(&self, tx: &TxRef) {
    let mut state = self.txs.entry(*tx).or_insert_with(|| TxState {
      status: FpcStatus::Pending,
      voters: Bitset::new(self.committee.len()),
    });
    match state.status {
      FpcStatus::Pending => state.status = FpcStatus::Mixed,
      FpcStatus::Mixed => {}
      status => {
        debug!("not marking {tx} mixed, it is already {status:?}");
      }
    }
  }

  pub fn status(&self, tx: &TxRef) -> FpcStatus {
    self
      .txs
      .get(tx)
      .map(|state| state.status)
      .unwrap_or(FpcStatus::Pending)
  }

  /// Number of distinct validators that vouched for a transaction.
  pub fn voters(&self, tx: &TxRef) -> usize {
    self
      .txs
      .get(tx)
      .map(|state| state.voters.count())
      .unwrap_or(0)
  }

  /// Snapshot of the transactions that received votes on an object.
  pub fn conflict_set(&self, object: &ObjectId) -> Vec<TxRef> {
    self
      .conflict_sets
      .get(object)
      .map(|set| set.value().clone())
      .unwrap_or_default()
  }

  /// Whether a quorum of distinct validators had epoch-bit blocks
  /// accepted.
  pub fn epoch_closable(&self) -> bool {
    self.epoch_closers.len() >= self.committee.quorum()
  }

  /// Latches the epoch fence: no new votes are generated while the
  /// epoch is closing. Observation and anchoring keep working.
  pub fn on_epoch_close_start(&self) {
    self.paused.store(true, Ordering::Release);
    info!("fast path paused for epoch close");
  }

  /// Lifts the fence and discards the per-object vote state of the
  /// closed epoch. Transactions still pending are forgotten with
  /// it, their status reads stay `Pending`.
  pub fn on_epoch_closed(&self) {
    self.object_votes.clear();
    self.conflict_sets.clear();
    self.epoch_closers.clear();
    self.txs.retain(|_, state| state.status != FpcStatus::Pending);
    self.paused.store(false, Ordering::Release);
    info!("fast path resumed in the new epoch");
  }
}
