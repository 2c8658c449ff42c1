//! Two-phase lattice threshold signatures.
//!
//! Once the fast path collects a quorum of votes for a transaction
//! it opens a ringtail round: every participating validator
//! contributes one share per phase, shares aggregate by
//! coordinate-wise addition in the ring, and the two phase
//! aggregates combine into a post-quantum certificate carrying a
//! signer bitmap. Rounds run as background tasks with a hard
//! deadline per phase and never block the submitter.

use {
  crate::{
    metrics::{Counter, MetricsRegistry},
    primitives::{Bitset, NodeId, TxRef},
    validators::ValidatorSet,
  },
  chrono::{DateTime, Utc},
  dashmap::DashMap,
  indexmap::IndexMap,
  multihash::{Sha3_256, StatefulHasher},
  rand::{Rng, SeedableRng},
  rand_chacha::ChaCha20Rng,
  serde::{Deserialize, Serialize},
  std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
  },
  thiserror::Error,
  tokio::sync::Notify,
  tracing::{debug, info, warn},
};

/// Prime modulus of the lattice ring, the Mersenne prime 2^61 - 1.
/// All vector arithmetic happens modulo this value.
pub const MODULUS: u64 = (1 << 61) - 1;

#[derive(Debug, Error)]
pub enum RingtailError {
  #[error("no active round for {0}")]
  NoRound(TxRef),

  #[error("share is for phase {got:?}, the round is in {expected:?}")]
  WrongPhase { expected: Phase, got: Phase },

  #[error("share from {0}, which is not a committee member")]
  UnknownValidator(NodeId),

  #[error("duplicate share from {0}")]
  DuplicateShare(NodeId),

  #[error("share vector has dimension {got}, expected {expected}")]
  WrongDimension { expected: usize, got: usize },

  #[error("share vector coordinate outside the ring")]
  OutOfRing,

  #[error("share proof does not bind to the transaction")]
  InvalidProof,

  #[error("insufficient signers: {got} of {need}")]
  InsufficientSigners { got: usize, need: usize },
}

/// The two collection phases of a round.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum Phase {
  One,
  Two,
}

impl Phase {
  fn tag(self) -> u8 {
    match self {
      Phase::One => 1,
      Phase::Two => 2,
    }
  }
}

/// One validator's contribution to one phase of a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
  pub validator: NodeId,
  pub index: u32,
  pub phase: Phase,
  pub vector: Vec<u64>,
  pub proof: [u8; 32],
}

impl Share {
  /// Draws a fresh random lattice vector and binds it to the
  /// transaction, the phase and the contributing validator.
  pub fn generate(
    tx: &TxRef,
    phase: Phase,
    validator: NodeId,
    index: u32,
    dim: usize,
    rng: &mut impl Rng,
  ) -> Self {
    Self {
      validator,
      index,
      phase,
      vector: (0..dim).map(|_| rng.gen_range(0..MODULUS)).collect(),
      proof: share_proof(tx, phase, &validator),
    }
  }
}

fn share_proof(tx: &TxRef, phase: Phase, validator: &NodeId) -> [u8; 32] {
  let mut sha3 = Sha3_256::default();
  sha3.update(tx);
  sha3.update(&[phase.tag()]);
  sha3.update(validator);
  sha3.finalize().as_ref().try_into().expect("sha3-256 yields 32 bytes")
}

/// The fixed aggregate of one completed phase.
#[derive(Debug, Clone)]
struct PhaseAggregate {
  vector: Vec<u64>,
  proof: [u8; 32],
  signers: Vec<NodeId>,
}

fn aggregate_phase(
  shares: &IndexMap<NodeId, Share>,
  dim: usize,
) -> PhaseAggregate {
  let mut vector = vec![0u64; dim];
  for share in shares.values() {
    for (acc, coord) in vector.iter_mut().zip(&share.vector) {
      *acc = (*acc + *coord) % MODULUS;
    }
  }

  let mut signers: Vec<NodeId> = shares.keys().copied().collect();
  signers.sort_unstable();

  let mut sha3 = Sha3_256::default();
  for signer in &signers {
    sha3.update(signer);
  }
  PhaseAggregate {
    vector,
    proof: sha3.finalize().as_ref().try_into().expect("sha3-256 yields 32 bytes"),
    signers,
  }
}

/// The post-quantum certificate of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
  pub dim: u32,
  pub vector: Vec<u64>,
  pub proof: [u8; 32],
  pub signers: Bitset,
  pub timestamp: DateTime<Utc>,
}

impl Certificate {
  /// Recounts the signer bitmap against the validator set.
  pub fn verify(
    &self,
    validators: &ValidatorSet,
    threshold: usize,
  ) -> bool {
    self.signers.width() == validators.len()
      && self.vector.len() == self.dim as usize
      && self.signers.count() >= threshold
  }

  pub fn encode(&self) -> Vec<u8> {
    bincode::serialize(self).expect("certificates are serializable")
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
    bincode::deserialize(bytes)
  }
}

fn combine(
  first: &PhaseAggregate,
  second: &PhaseAggregate,
  committee: &ValidatorSet,
  dim: usize,
) -> Result<Certificate, RingtailError> {
  let vector = first
    .vector
    .iter()
    .zip(&second.vector)
    .map(|(a, b)| (*a + *b) % MODULUS)
    .collect();

  let mut sha3 = Sha3_256::default();
  sha3.update(&first.proof);
  sha3.update(&second.proof);

  let mut signers = Bitset::new(committee.len());
  for signer in first.signers.iter().chain(&second.signers) {
    if let Some(index) = committee.index_of(signer) {
      let _ = signers.set(index);
    }
  }
  if signers.count() < committee.quorum() {
    return Err(RingtailError::InsufficientSigners {
      got: signers.count(),
      need: committee.quorum(),
    });
  }

  Ok(Certificate {
    dim: dim as u32,
    vector,
    proof: sha3.finalize().as_ref().try_into().expect("sha3-256 yields 32 bytes"),
    signers,
    timestamp: Utc::now(),
  })
}

struct Round {
  phase: Phase,
  participants: HashSet<NodeId>,
  shares1: IndexMap<NodeId, Share>,
  shares2: IndexMap<NodeId, Share>,
  aggregate1: Option<PhaseAggregate>,
}

struct RoundHandle {
  state: Mutex<Round>,
  notify: Notify,
}

#[derive(Debug, Clone)]
pub struct RingtailConfig {
  /// Dimension of the share vectors.
  pub dim: usize,

  /// Budget for a whole round, each phase gets half of it.
  pub timeout: Duration,
}

impl Default for RingtailConfig {
  fn default() -> Self {
    Self {
      dim: 256,
      timeout: Duration::from_secs(2),
    }
  }
}

struct EngineMetrics {
  rounds_started: Counter,
  rounds_completed: Counter,
  rounds_timed_out: Counter,
}

struct EngineInner {
  committee: ValidatorSet,
  self_id: NodeId,
  config: RingtailConfig,
  rounds: DashMap<TxRef, Arc<RoundHandle>>,
  proofs: DashMap<TxRef, Certificate>,
  rng: Mutex<ChaCha20Rng>,
  metrics: EngineMetrics,
}

/// Drives ringtail rounds for this validator.
///
/// `submit` opens a round and returns immediately, a background
/// task collects shares for both phases and publishes the combined
/// certificate. A timed out round disappears without a trace, the
/// next submit for the same transaction starts over.
#[derive(Clone)]
pub struct RingtailEngine {
  inner: Arc<EngineInner>,
}

impl RingtailEngine {
  pub fn new(
    committee: ValidatorSet,
    self_id: NodeId,
    config: RingtailConfig,
    seed: [u8; 32],
    registry: &dyn MetricsRegistry,
  ) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        committee,
        self_id,
        config,
        rounds: DashMap::new(),
        proofs: DashMap::new(),
        rng: Mutex::new(ChaCha20Rng::from_seed(seed)),
        metrics: EngineMetrics {
          rounds_started: registry.counter("ringtail_rounds_started"),
          rounds_completed: registry.counter("ringtail_rounds_completed"),
          rounds_timed_out: registry.counter("ringtail_rounds_timed_out"),
        },
      }),
    }
  }

  /// Opens a round for a transaction with the given participants
  /// and spawns the task driving it. No-op while a round is in
  /// flight or a certificate already exists.
  pub fn submit(&self, tx: &TxRef, voters: &[NodeId]) {
    if self.inner.proofs.contains_key(tx) {
      debug!("certificate for {tx} already exists");
      return;
    }

    {
      match self.inner.rounds.entry(*tx) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
          debug!("round for {tx} already in flight");
          return;
        }
        dashmap::mapref::entry::Entry::Vacant(vacant) => {
          // the local validator always participates in its own round
          vacant.insert(Arc::new(RoundHandle {
            state: Mutex::new(Round {
              phase: Phase::One,
              participants: voters
                .iter()
                .copied()
                .chain([self.inner.self_id])
                .collect(),
              shares1: IndexMap::new(),
              shares2: IndexMap::new(),
              aggregate1: None,
            }),
            notify: Notify::new(),
          }));
        }
      }
    }

    self.inner.metrics.rounds_started.inc();
    if self.inner.committee.contains(&self.inner.self_id) {
      let share = self.local_share(tx, Phase::One);
      if let Err(e) = self.add_share(tx, share) {
        warn!("could not seed own phase 1 share for {tx}: {e}");
      }
    }

    let inner = Arc::clone(&self.inner);
    let tx = *tx;
    tokio::spawn(async move {
      EngineInner::run_round(inner, tx).await;
    });
  }

  /// This validator's contribution for a phase of the round.
  pub fn local_share(&self, tx: &TxRef, phase: Phase) -> Share {
    let index = self
      .inner
      .committee
      .index_of(&self.inner.self_id)
      .unwrap_or(0) as u32;
    let mut rng = self.inner.rng.lock().unwrap();
    Share::generate(
      tx,
      phase,
      self.inner.self_id,
      index,
      self.inner.config.dim,
      &mut *rng,
    )
  }

  /// Folds a remote share into the active round of a transaction.
  pub fn add_share(
    &self,
    tx: &TxRef,
    share: Share,
  ) -> Result<(), RingtailError> {
    if !self.inner.committee.contains(&share.validator) {
      return Err(RingtailError::UnknownValidator(share.validator));
    }
    if share.vector.len() != self.inner.config.dim {
      return Err(RingtailError::WrongDimension {
        expected: self.inner.config.dim,
        got: share.vector.len(),
      });
    }
    if share.vector.iter().any(|coord| *coord >= MODULUS) {
      return Err(RingtailError::OutOfRing);
    }
    if share.proof != share_proof(tx, share.phase, &share.validator) {
      return Err(RingtailError::InvalidProof);
    }

    let handle = self
      .inner
      .rounds
      .get(tx)
      .map(|entry| Arc::clone(&entry))
      .ok_or(RingtailError::NoRound(*tx))?;

    {
      let mut round = handle.state.lock().unwrap();
      if share.phase != round.phase {
        return Err(RingtailError::WrongPhase {
          expected: round.phase,
          got: share.phase,
        });
      }
      if !round.participants.is_empty()
        && !round.participants.contains(&share.validator)
      {
        return Err(RingtailError::UnknownValidator(share.validator));
      }

      let shares = match share.phase {
        Phase::One => &mut round.shares1,
        Phase::Two => &mut round.shares2,
      };
      if shares.contains_key(&share.validator) {
        return Err(RingtailError::DuplicateShare(share.validator));
      }
      shares.insert(share.validator, share);
    }
    handle.notify.notify_one();
    Ok(())
  }

  pub fn round_phase(&self, tx: &TxRef) -> Option<Phase> {
    self
      .inner
      .rounds
      .get(tx)
      .map(|handle| handle.state.lock().unwrap().phase)
  }

  pub fn has_pq(&self, tx: &TxRef) -> bool {
    self.inner.proofs.contains_key(tx)
  }

  pub fn get_pq(&self, tx: &TxRef) -> Option<Certificate> {
    self.inner.proofs.get(tx).map(|cert| cert.value().clone())
  }
}

impl EngineInner {
  async fn run_round(inner: Arc<EngineInner>, tx: TxRef) {
    let Some(handle) =
      inner.rounds.get(&tx).map(|entry| Arc::clone(&entry))
    else {
      return;
    };

    let threshold = inner.committee.quorum();
    let phase_budget = inner.config.timeout / 2;

    // phase 1
    let deadline = tokio::time::Instant::now() + phase_budget;
    if !Self::collect(&handle, Phase::One, threshold, deadline).await {
      Self::abandon(&inner, &tx, Phase::One);
      return;
    }
    let aggregate1 = {
      let mut round = handle.state.lock().unwrap();
      let aggregate = aggregate_phase(&round.shares1, inner.config.dim);
      round.aggregate1 = Some(aggregate.clone());
      round.phase = Phase::Two;
      aggregate
    };
    debug!(
      "phase 1 of {tx} aggregated over {} signers",
      aggregate1.signers.len()
    );

    // the engine contributes a fresh share to phase 2 as well
    if inner.committee.contains(&inner.self_id) {
      let share = {
        let index =
          inner.committee.index_of(&inner.self_id).unwrap_or(0) as u32;
        let mut rng = inner.rng.lock().unwrap();
        Share::generate(
          &tx,
          Phase::Two,
          inner.self_id,
          index,
          inner.config.dim,
          &mut *rng,
        )
      };
      let mut round = handle.state.lock().unwrap();
      round.shares2.insert(share.validator, share);
    }

    // phase 2
    let deadline = tokio::time::Instant::now() + phase_budget;
    if !Self::collect(&handle, Phase::Two, threshold, deadline).await {
      Self::abandon(&inner, &tx, Phase::Two);
      return;
    }
    let certificate = {
      let round = handle.state.lock().unwrap();
      let aggregate2 = aggregate_phase(&round.shares2, inner.config.dim);
      let aggregate1 =
        round.aggregate1.as_ref().expect("phase 1 completed");
      combine(aggregate1, &aggregate2, &inner.committee, inner.config.dim)
    };

    match certificate {
      Ok(certificate) => {
        info!(
          "ringtail certificate for {tx} with {} signers",
          certificate.signers.count()
        );
        inner.proofs.insert(tx, certificate);
        inner.rounds.remove(&tx);
        inner.metrics.rounds_completed.inc();
      }
      Err(e) => {
        warn!("ringtail round for {tx} failed to combine: {e}");
        inner.rounds.remove(&tx);
        inner.metrics.rounds_timed_out.inc();
      }
    }
  }

  /// Waits until a phase holds a threshold of shares or the
  /// deadline passes.
  async fn collect(
    handle: &RoundHandle,
    phase: Phase,
    threshold: usize,
    deadline: tokio::time::Instant,
  ) -> bool {
    loop {
      let notified = handle.notify.notified();
      {
        let round = handle.state.lock().unwrap();
        let shares = match phase {
          Phase::One => &round.shares1,
          Phase::Two => &round.shares2,
        };
        if shares.len() >= threshold {
          return true;
        }
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return false;
      }
    }
  }

  /// A timed out round leaves no trace, the next submit for the
  /// same transaction starts over.
  fn abandon(inner: &Arc<EngineInner>, tx: &TxRef, phase: Phase) {
    warn!("ringtail round for {tx} timed out in phase {phase:?}");
    inner.rounds.remove(tx);
    inner.metrics.rounds_timed_out.inc();
  }
}

impl crate::wave::PqEngine for RingtailEngine {
  fn submit(&self, tx: &TxRef, voters: &[NodeId]) {
    RingtailEngine::submit(self, tx, voters)
  }

  fn has_pq(&self, tx: &TxRef) -> bool {
    RingtailEngine::has_pq(self, tx)
  }

  fn get_pq(&self, tx: &TxRef) -> Option<Certificate> {
    RingtailEngine::get_pq(self, tx)
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{Phase, RingtailConfig, RingtailEngine, Share, MODULUS},
    crate::{
      metrics::NullMetrics,
      test::{committee, node, txref},
    },
    rand::SeedableRng,
    rand_chacha::ChaCha20Rng,
    std::time::Duration,
  };

  fn engine(timeout_ms: u64) -> RingtailEngine {
    RingtailEngine::new(
      committee(4),
      node(1),
      RingtailConfig {
        dim: 8,
        timeout: Duration::from_millis(timeout_ms),
      },
      [9u8; 32],
      &NullMetrics,
    )
  }

  fn remote_share(byte: u8, tx: &crate::primitives::TxRef, phase: Phase) -> Share {
    let mut rng = ChaCha20Rng::from_seed([byte; 32]);
    Share::generate(tx, phase, node(byte), byte as u32 - 1, 8, &mut rng)
  }

  async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
  }

  #[tokio::test]
  async fn round_produces_a_verifiable_certificate() {
    let engine = engine(2_000);
    let tx = txref(1);
    let voters = [node(1), node(2), node(3)];

    engine.submit(&tx, &voters);
    assert_eq!(engine.round_phase(&tx), Some(Phase::One));

    // two remote shares push phase 1 over the threshold
    engine.add_share(&tx, remote_share(2, &tx, Phase::One)).unwrap();
    engine.add_share(&tx, remote_share(3, &tx, Phase::One)).unwrap();
    {
      let engine = engine.clone();
      wait_for(move || engine.round_phase(&tx) == Some(Phase::Two)).await;
    }

    engine.add_share(&tx, remote_share(2, &tx, Phase::Two)).unwrap();
    engine.add_share(&tx, remote_share(3, &tx, Phase::Two)).unwrap();
    {
      let engine = engine.clone();
      wait_for(move || engine.has_pq(&tx)).await;
    }

    let certificate = engine.get_pq(&tx).unwrap();
    assert!(certificate.verify(&committee(4), 3));
    assert!(!certificate.verify(&committee(4), 4));
    assert_eq!(certificate.dim, 8);
    assert!(certificate.vector.iter().all(|coord| *coord < MODULUS));

    let decoded =
      super::Certificate::decode(&certificate.encode()).unwrap();
    assert_eq!(decoded.signers.count(), certificate.signers.count());
    assert_eq!(decoded.vector, certificate.vector);
    assert_eq!(decoded.proof, certificate.proof);
  }

  #[tokio::test]
  async fn round_times_out_and_can_be_reopened() {
    let engine = engine(50);
    let tx = txref(1);

    engine.submit(&tx, &[node(1), node(2), node(3)]);
    {
      let engine = engine.clone();
      wait_for(move || engine.round_phase(&tx).is_none()).await;
    }
    assert!(!engine.has_pq(&tx));

    // a later submit reopens the round from scratch
    engine.submit(&tx, &[node(1), node(2), node(3)]);
    assert_eq!(engine.round_phase(&tx), Some(Phase::One));
  }

  #[tokio::test]
  async fn shares_are_validated() {
    let engine = engine(2_000);
    let tx = txref(1);

    assert!(engine
      .add_share(&tx, remote_share(2, &tx, Phase::One))
      .is_err());

    engine.submit(&tx, &[node(1), node(2), node(3)]);

    // not a committee member
    let mut share = remote_share(2, &tx, Phase::One);
    share.validator = node(9);
    assert!(engine.add_share(&tx, share).is_err());

    // wrong dimension
    let mut share = remote_share(2, &tx, Phase::One);
    share.vector.push(1);
    assert!(engine.add_share(&tx, share).is_err());

    // coordinate outside the ring
    let mut share = remote_share(2, &tx, Phase::One);
    share.vector[0] = MODULUS;
    assert!(engine.add_share(&tx, share).is_err());

    // proof bound to another transaction
    let share = remote_share(2, &txref(2), Phase::One);
    assert!(engine.add_share(&tx, share).is_err());

    // phase 2 share while the round is in phase 1
    let share = remote_share(2, &tx, Phase::Two);
    assert!(engine.add_share(&tx, share).is_err());

    // a valid share, then its duplicate
    engine.add_share(&tx, remote_share(2, &tx, Phase::One)).unwrap();
    assert!(engine
      .add_share(&tx, remote_share(2, &tx, Phase::One))
      .is_err());
  }

  #[tokio::test]
  async fn outsiders_cannot_join_a_round() {
    let engine = engine(2_000);
    let tx = txref(1);

    // the round is restricted to the submitted participants
    engine.submit(&tx, &[node(1), node(2)]);
    assert!(engine
      .add_share(&tx, remote_share(3, &tx, Phase::One))
      .is_err());
    engine.add_share(&tx, remote_share(2, &tx, Phase::One)).unwrap();
  }
}
