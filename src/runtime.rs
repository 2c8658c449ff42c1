use {
  crate::{
    metrics::MetricsRegistry,
    nova::{
      Acceptor,
      Block,
      ChainState,
      Decision,
      Finalizer,
      Health,
      HealthError,
      Nova,
      NovaEvent,
      NovaEvents,
    },
    params::Parameters,
    primitives::{Id, NodeId, TxRef},
    prism::{PollFactory, PollSet},
    ringtail::{Certificate, RingtailConfig, RingtailEngine},
    validators::ValidatorSet,
    wave::{Classifier, DagTap, PqEngine, WaveFpc},
  },
  anyhow::Context,
  futures::{FutureExt, StreamExt},
  std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
    Mutex,
  },
  tracing::info,
};

/// Gates certificate rounds on the lifecycle of the core: rounds
/// only spawn between `start` and `stop`.
struct GatedPq {
  engine: RingtailEngine,
  running: Arc<AtomicBool>,
}

impl PqEngine for GatedPq {
  fn submit(&self, tx: &TxRef, voters: &[NodeId]) {
    if self.running.load(Ordering::Acquire) {
      self.engine.submit(tx, voters);
    }
  }

  fn has_pq(&self, tx: &TxRef) -> bool {
    self.engine.has_pq(tx)
  }

  fn get_pq(&self, tx: &TxRef) -> Option<Certificate> {
    self.engine.get_pq(tx)
  }
}

/// The assembled consensus core of one chain.
///
/// Wires the linear chain engine, the poll set, the fast path and
/// the certificate engine together and exposes the lifecycle the
/// outer runtime drives. Construction validates the configuration
/// and resumes from the last accepted block the chain state
/// remembers, everything else is delegated to the components.
pub struct Core<B: Block> {
  params: Parameters,
  nova: Arc<Nova<B>>,
  polls: Arc<PollSet>,
  wave: Arc<WaveFpc>,
  ringtail: RingtailEngine,
  chain: Arc<dyn ChainState<B>>,
  events: Mutex<NovaEvents>,
  finalizer: Mutex<Finalizer>,
  running: Arc<AtomicBool>,
}

impl<B: Block> Core<B> {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    params: Parameters,
    committee: ValidatorSet,
    self_id: NodeId,
    chain: Arc<dyn ChainState<B>>,
    acceptor: Arc<dyn Acceptor>,
    classifier: Arc<dyn Classifier>,
    dag: Arc<dyn DagTap>,
    seed: [u8; 32],
    registry: &dyn MetricsRegistry,
  ) -> anyhow::Result<Self> {
    params
      .validate()
      .context("invalid consensus parameters")?;

    let running = Arc::new(AtomicBool::new(false));
    let ringtail = RingtailEngine::new(
      committee.clone(),
      self_id,
      RingtailConfig::default(),
      seed,
      registry,
    );
    let wave = Arc::new(WaveFpc::new(
      committee,
      self_id,
      classifier,
      dag,
      Some(Arc::new(GatedPq {
        engine: ringtail.clone(),
        running: Arc::clone(&running),
      })),
      registry,
    ));

    let (last_accepted_id, last_accepted_height) =
      chain.get_last_accepted();
    let nova = Arc::new(Nova::new(
      params.clone(),
      acceptor,
      last_accepted_id,
      last_accepted_height,
      registry,
    ));
    let polls = Arc::new(PollSet::new(
      PollFactory::new(params.alpha_preference, params.alpha_confidence),
      registry,
    ));

    Ok(Self {
      events: Mutex::new(nova.events()),
      params,
      nova,
      polls,
      wave,
      ringtail,
      chain,
      finalizer: Mutex::new(Finalizer::new(0)),
      running,
    })
  }

  pub fn start(&self) {
    self.running.store(true, Ordering::Release);
    info!("consensus core started");
  }

  pub fn stop(&self) {
    self.running.store(false, Ordering::Release);
    info!("consensus core stopped");
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Absorbs the pending engine events: decisions land in the
  /// finalizer and the last accepted block is checkpointed into
  /// the chain state.
  pub fn pump_events(&self) {
    let mut events = self.events.lock().unwrap();
    let mut finalizer = self.finalizer.lock().unwrap();
    while let Some(Some(event)) = events.next().now_or_never() {
      match event {
        NovaEvent::BlockAccepted { id, height } => {
          finalizer.record(id, Decision::Accept);
          self.chain.set_last_accepted(&id, height);
        }
        NovaEvent::BlockRejected { id } => {
          finalizer.record(id, Decision::Reject);
        }
        NovaEvent::BlockAdded { .. } => {}
      }
    }
  }

  /// Whether an item was accepted, and at which depth.
  pub fn finalized(&self, id: &Id) -> (bool, u64) {
    self.finalizer.lock().unwrap().finalized(id)
  }

  /// Resource pressure of the pending tree. Errors here are
  /// advisory, the core keeps operating and the outer system
  /// decides whether to shed load.
  pub fn health(&self) -> Result<Health, HealthError> {
    self.nova.health_check()
  }

  pub fn params(&self) -> &Parameters {
    &self.params
  }

  pub fn nova(&self) -> &Arc<Nova<B>> {
    &self.nova
  }

  pub fn polls(&self) -> &Arc<PollSet> {
    &self.polls
  }

  pub fn wave(&self) -> &Arc<WaveFpc> {
    &self.wave
  }

  pub fn ringtail(&self) -> &RingtailEngine {
    &self.ringtail
  }
}
