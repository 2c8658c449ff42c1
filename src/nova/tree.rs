use {
  super::block::{Acceptor, Block, BoxError, Status},
  crate::{
    metrics::{Counter, Gauge, MetricsRegistry},
    params::Parameters,
    primitives::{Bag, Id},
    prism::Cut,
  },
  chrono::{DateTime, Utc},
  futures::Stream,
  indexmap::IndexSet,
  std::{
    collections::{HashMap, HashSet, VecDeque},
    pin::Pin,
    sync::{Arc, Mutex, RwLock},
    task::{Context, Poll},
    time::{Duration, Instant},
  },
  thiserror::Error,
  tracing::{debug, info, warn},
};

#[derive(Debug, Error)]
pub enum NovaError {
  #[error("block {0} is already in the tree")]
  DuplicateAdd(Id),

  #[error("parent {parent} of block {id} is not in the tree")]
  UnknownParentBlock { id: Id, parent: Id },

  #[error("acceptor failed for block {id}: {source}")]
  AcceptorFailure { id: Id, source: BoxError },

  #[error("block {id} refused to {action}: {source}")]
  DecidableFailure {
    id: Id,
    action: &'static str,
    source: BoxError,
  },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
  #[error("{processing} blocks processing, the limit is {limit}")]
  TooManyProcessingBlocks { processing: u64, limit: u64 },

  #[error("block {id} has been processing for {age:?}")]
  BlockProcessingTooLong { id: Id, age: Duration },
}

/// A healthy snapshot of the pending tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
  pub processing: u64,
  pub oldest_age: Option<Duration>,
}

/// Observability feed of the linear chain engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NovaEvent {
  BlockAdded { id: Id, height: u64 },
  BlockAccepted { id: Id, height: u64 },
  BlockRejected { id: Id },
}

/// Drains events recorded by a [`Nova`] instance.
pub struct NovaEvents {
  queue: Arc<Mutex<VecDeque<NovaEvent>>>,
}

impl Unpin for NovaEvents {}
impl Stream for NovaEvents {
  type Item = NovaEvent;

  fn poll_next(
    self: Pin<&mut Self>,
    _: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    if let Some(event) = self.queue.lock().unwrap().pop_front() {
      return Poll::Ready(Some(event));
    }
    Poll::Pending
  }
}

/// A block still being voted on, together with the vote state
/// deciding among its children.
struct TreeNode<B: Block> {
  /// The block body. The sentinel node standing for the last
  /// accepted block carries none.
  block: Option<B>,
  parent: Option<Id>,
  height: u64,
  children: IndexSet<Id>,
  cut: Cut,
  should_falter: bool,
  added_at: Instant,
}

struct TreeState<B: Block> {
  nodes: HashMap<Id, TreeNode<B>>,
  last_accepted_id: Id,
  last_accepted_height: u64,
  last_accepted_time: DateTime<Utc>,
  preference: Id,
  preferred_ids: HashSet<Id>,
  preferred_heights: HashMap<u64, Id>,
}

struct NovaMetrics {
  processing: Gauge,
  accepted: Counter,
  rejected: Counter,
  polls_successful: Counter,
  polls_failed: Counter,
}

#[derive(Default)]
struct KahnNode {
  in_degree: usize,
  votes: Bag<Id>,
}

/// The linear chain consensus engine.
///
/// Pending blocks form a tree rooted in the last accepted block.
/// Polls push votes transitively from voted blocks towards that
/// root, every block on the way runs its own threshold state
/// machine over its children, and once the machine at the root
/// finalizes, the preferred child is accepted and every competing
/// branch is rejected.
pub struct Nova<B: Block> {
  params: Parameters,
  acceptor: Arc<dyn Acceptor>,
  state: RwLock<TreeState<B>>,
  events: Arc<Mutex<VecDeque<NovaEvent>>>,
  metrics: NovaMetrics,
}

impl<B: Block> Nova<B> {
  pub fn new(
    params: Parameters,
    acceptor: Arc<dyn Acceptor>,
    last_accepted_id: Id,
    last_accepted_height: u64,
    registry: &dyn MetricsRegistry,
  ) -> Self {
    let mut nodes = HashMap::new();
    nodes.insert(
      last_accepted_id,
      TreeNode {
        block: None,
        parent: None,
        height: last_accepted_height,
        children: IndexSet::new(),
        cut: Cut::new(
          params.alpha_preference,
          params.alpha_confidence,
          params.beta,
        ),
        should_falter: false,
        added_at: Instant::now(),
      },
    );

    Self {
      acceptor,
      state: RwLock::new(TreeState {
        nodes,
        last_accepted_id,
        last_accepted_height,
        last_accepted_time: Utc::now(),
        preference: last_accepted_id,
        preferred_ids: HashSet::new(),
        preferred_heights: HashMap::new(),
      }),
      events: Arc::new(Mutex::new(VecDeque::new())),
      metrics: NovaMetrics {
        processing: registry.gauge("nova_processing"),
        accepted: registry.counter("nova_accepted"),
        rejected: registry.counter("nova_rejected"),
        polls_successful: registry.counter("nova_polls_successful"),
        polls_failed: registry.counter("nova_polls_failed"),
      },
      params,
    }
  }

  /// Inserts a pending block under its parent.
  ///
  /// A block extending the current preference becomes the new
  /// preference on the spot.
  pub fn add(&self, block: B) -> Result<(), NovaError> {
    let id = block.id();
    let parent = block.parent();
    let height = block.height();

    let mut state = self.state.write().unwrap();
    if state.nodes.contains_key(&id) {
      return Err(NovaError::DuplicateAdd(id));
    }
    if !state.nodes.contains_key(&parent) {
      return Err(NovaError::UnknownParentBlock { id, parent });
    }

    let parent_node = state.nodes.get_mut(&parent).unwrap();
    parent_node.children.insert(id);
    parent_node.cut.prefer(id);

    let extends_preference = parent == state.preference;
    state.nodes.insert(id, TreeNode {
      block: Some(block),
      parent: Some(parent),
      height,
      children: IndexSet::new(),
      cut: Cut::new(
        self.params.alpha_preference,
        self.params.alpha_confidence,
        self.params.beta,
      ),
      should_falter: false,
      added_at: Instant::now(),
    });

    if extends_preference {
      state.preference = id;
      state.preferred_ids.insert(id);
      state.preferred_heights.insert(height, id);
    }

    debug!("block {id} added at height {height}");
    self.metrics.processing.set(state.nodes.len() as i64 - 1);
    self.emit(NovaEvent::BlockAdded { id, height });
    Ok(())
  }

  /// Applies the outcome of one poll to the pending tree.
  ///
  /// Votes are pushed from the voted blocks towards the last
  /// accepted block in topological order, each block on the way
  /// refracts the votes arriving for its children. When the state
  /// machine at the last accepted block finalizes, its preferred
  /// child is accepted.
  pub fn record_prism(&self, votes: Bag<Id>) -> Result<(), NovaError> {
    let mut state = self.state.write().unwrap();

    // with fewer votes than alpha-preference no branch can cross
    // the threshold, skip the topological sort altogether
    let mut stack = if votes.len() < self.params.alpha_preference {
      vec![]
    } else {
      Self::vote_stack(&state, &votes, self.params.alpha_preference)
    };

    let mut applied = false;
    while let Some((target, branch_votes)) = stack.pop() {
      let next = stack.last().map(|(id, _)| *id);

      // the target may have been pruned by an acceptance earlier
      // in this very sweep
      if !state.nodes.contains_key(&target) {
        continue;
      }

      {
        let node = state.nodes.get_mut(&target).unwrap();
        if node.should_falter {
          debug!("resetting confidence of {target}, a cousin was voted for");
          node.cut.falter();
          node.should_falter = false;
        }
        node.cut.reset();
        node.cut.record_votes(&branch_votes);
        node.cut.refract();
      }
      applied = true;

      // siblings of the voted-for child falter unless they are the
      // branch this sweep continues through
      let protected = next.unwrap_or_else(|| branch_votes.mode().0);
      let children: Vec<Id> =
        state.nodes[&target].children.iter().copied().collect();
      for child in children {
        if child != protected {
          if let Some(node) = state.nodes.get_mut(&child) {
            node.should_falter = true;
          }
        }
      }

      if target == state.last_accepted_id
        && state.nodes[&target].cut.is_finalized()
      {
        self.accept_preferred_child(&mut state)?;
      }
    }

    if applied {
      self.metrics.polls_successful.inc();
    } else {
      self.metrics.polls_failed.inc();
    }

    Self::recompute_preferred(&mut state);
    Ok(())
  }

  /// Builds the ordered vote stack for one poll.
  ///
  /// Kahn's algorithm over the subgraph spanned by the voted
  /// blocks and their ancestors: leaves push their votes to their
  /// parents, and every block whose children gathered at least
  /// alpha-preference votes lands on the stack, deepest first.
  fn vote_stack(
    state: &TreeState<B>,
    votes: &Bag<Id>,
    alpha_preference: u64,
  ) -> Vec<(Id, Bag<Id>)> {
    let mut kahn: HashMap<Id, KahnNode> = HashMap::new();

    for (voted, count) in votes.iter() {
      let Some(node) = state.nodes.get(voted) else {
        debug!("dropping vote for unknown block {voted}");
        continue;
      };
      let Some(parent) = node.parent else {
        debug!("dropping vote for the last accepted block {voted}");
        continue;
      };

      let existed = kahn.contains_key(&parent);
      kahn.entry(parent).or_default().votes.add_count(*voted, count);
      if existed {
        continue;
      }

      // first sighting of this parent, register the in-degree of
      // the whole ancestor path
      let mut cursor = parent;
      while cursor != state.last_accepted_id {
        let up = state.nodes[&cursor]
          .parent
          .expect("only the sentinel has no parent");
        let existed = kahn.contains_key(&up);
        kahn.entry(up).or_default().in_degree += 1;
        if existed {
          break;
        }
        cursor = up;
      }
    }

    let mut leaves: Vec<Id> = kahn
      .iter()
      .filter(|(_, node)| node.in_degree == 0)
      .map(|(id, _)| *id)
      .collect();

    let mut stack = vec![];
    while let Some(leaf) = leaves.pop() {
      let branch_votes =
        std::mem::take(&mut kahn.get_mut(&leaf).unwrap().votes);
      let count = branch_votes.len();
      if count >= alpha_preference {
        stack.push((leaf, branch_votes));
      }
      if leaf == state.last_accepted_id {
        continue;
      }

      let up = state.nodes[&leaf]
        .parent
        .expect("only the sentinel has no parent");
      let parent_kahn =
        kahn.get_mut(&up).expect("ancestors are registered");
      parent_kahn.votes.add_count(leaf, count);
      parent_kahn.in_degree -= 1;
      if parent_kahn.in_degree == 0 {
        leaves.push(up);
      }
    }
    stack
  }

  /// Accepts the preferred child of the last accepted block.
  ///
  /// The external acceptor runs before the block's own accept, and
  /// before any tree mutation, so a failing callback leaves the
  /// tree exactly as it was. Competing branches are rejected
  /// afterwards, parents before descendants.
  fn accept_preferred_child(
    &self,
    state: &mut TreeState<B>,
  ) -> Result<(), NovaError> {
    let sentinel_id = state.last_accepted_id;
    let Some(child_id) = state.nodes[&sentinel_id].cut.preference() else {
      warn!("finalized block {sentinel_id} has no preferred child");
      return Ok(());
    };

    {
      let child = state.nodes[&child_id]
        .block
        .as_ref()
        .expect("processing blocks carry a body");
      self
        .acceptor
        .accept(&child_id, child.bytes())
        .map_err(|source| NovaError::AcceptorFailure {
          id: child_id,
          source,
        })?;
    }
    {
      let child = state
        .nodes
        .get_mut(&child_id)
        .unwrap()
        .block
        .as_mut()
        .unwrap();
      child.accept().map_err(|source| NovaError::DecidableFailure {
        id: child_id,
        action: "accept",
        source,
      })?;
    }

    let height = state.nodes[&child_id].height;
    let timestamp = state.nodes[&child_id]
      .block
      .as_ref()
      .unwrap()
      .timestamp();
    info!("accepted block {child_id} at height {height}");

    state.last_accepted_id = child_id;
    state.last_accepted_height = height;
    state.last_accepted_time = timestamp;
    state.preferred_ids.remove(&child_id);
    state.preferred_heights.remove(&height);

    let siblings: Vec<Id> = state.nodes[&sentinel_id]
      .children
      .iter()
      .filter(|sibling| **sibling != child_id)
      .copied()
      .collect();
    for sibling in siblings {
      self.reject_subtree(state, sibling)?;
    }

    // the old sentinel retires, the accepted child takes its place
    state.nodes.remove(&sentinel_id);
    let node = state.nodes.get_mut(&child_id).unwrap();
    node.block = None;
    node.parent = None;
    node.should_falter = false;

    self.metrics.accepted.inc();
    self.metrics.processing.set(state.nodes.len() as i64 - 1);
    self.emit(NovaEvent::BlockAccepted {
      id: child_id,
      height,
    });
    Ok(())
  }

  /// Rejects a block and transitively all its descendants,
  /// removing them from the tree.
  fn reject_subtree(
    &self,
    state: &mut TreeState<B>,
    root: Id,
  ) -> Result<(), NovaError> {
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
      {
        let Some(node) = state.nodes.get_mut(&id) else {
          continue;
        };
        let block =
          node.block.as_mut().expect("processing blocks carry a body");
        block.reject().map_err(|source| NovaError::DecidableFailure {
          id,
          action: "reject",
          source,
        })?;
      }

      let node = state.nodes.remove(&id).unwrap();
      queue.extend(node.children.iter().copied());
      state.preferred_ids.remove(&id);
      if state.preferred_heights.get(&node.height) == Some(&id) {
        state.preferred_heights.remove(&node.height);
      }

      debug!("rejected block {id}");
      self.metrics.rejected.inc();
      self.emit(NovaEvent::BlockRejected { id });
    }
    Ok(())
  }

  /// Rebuilds the preferred chain by following preferred-child
  /// pointers down from the last accepted block.
  fn recompute_preferred(state: &mut TreeState<B>) {
    state.preferred_ids.clear();
    state.preferred_heights.clear();

    let mut cursor = state.last_accepted_id;
    loop {
      let next = state.nodes[&cursor]
        .cut
        .preference()
        .filter(|child| state.nodes.contains_key(child));
      match next {
        Some(child) => {
          let height = state.nodes[&child].height;
          state.preferred_ids.insert(child);
          state.preferred_heights.insert(height, child);
          cursor = child;
        }
        None => break,
      }
    }
    state.preference = cursor;
  }

  fn emit(&self, event: NovaEvent) {
    self.events.lock().unwrap().push_back(event);
  }

  /// The deepest block on the currently preferred chain. This is
  /// the block new blocks should build on.
  pub fn preference(&self) -> Id {
    self.state.read().unwrap().preference
  }

  pub fn last_accepted(&self) -> (Id, u64, DateTime<Utc>) {
    let state = self.state.read().unwrap();
    (
      state.last_accepted_id,
      state.last_accepted_height,
      state.last_accepted_time,
    )
  }

  pub fn status(&self, id: &Id) -> Status {
    let state = self.state.read().unwrap();
    if state.last_accepted_id == *id {
      Status::Accepted
    } else if state.nodes.contains_key(id) {
      Status::Processing
    } else {
      Status::Unknown
    }
  }

  pub fn is_processing(&self, id: &Id) -> bool {
    self.status(id) == Status::Processing
  }

  pub fn num_processing(&self) -> u64 {
    self.state.read().unwrap().nodes.len() as u64 - 1
  }

  /// Snapshot of the ids on the preferred chain. Detached from the
  /// tree, mutations after the call are not reflected.
  pub fn preferred_ids(&self) -> Vec<Id> {
    let state = self.state.read().unwrap();
    state.preferred_ids.iter().copied().collect()
  }

  /// The preferred block at a given height, when the preferred
  /// chain reaches it.
  pub fn preferred_at_height(&self, height: u64) -> Option<Id> {
    let state = self.state.read().unwrap();
    state.preferred_heights.get(&height).copied()
  }

  /// Reports resource pressure without touching consensus state.
  /// The tree keeps operating past these limits, shedding load is
  /// the outer system's call.
  pub fn health_check(&self) -> Result<Health, HealthError> {
    let state = self.state.read().unwrap();
    let processing = state.nodes.len() as u64 - 1;
    if processing > self.params.max_outstanding_items {
      return Err(HealthError::TooManyProcessingBlocks {
        processing,
        limit: self.params.max_outstanding_items,
      });
    }

    let oldest = state
      .nodes
      .iter()
      .filter(|(_, node)| node.block.is_some())
      .map(|(id, node)| (*id, node.added_at))
      .min_by_key(|(_, added_at)| *added_at);

    if let Some((id, added_at)) = oldest {
      let age = added_at.elapsed();
      if age > self.params.max_item_processing_time {
        return Err(HealthError::BlockProcessingTooLong { id, age });
      }
      return Ok(Health {
        processing,
        oldest_age: Some(age),
      });
    }
    Ok(Health {
      processing,
      oldest_age: None,
    })
  }

  pub fn events(&self) -> NovaEvents {
    NovaEvents {
      queue: Arc::clone(&self.events),
    }
  }
}
