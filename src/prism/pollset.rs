use {
  super::poll::{ParentGetter, Poll, Termination},
  crate::{
    metrics::{Averager, Counter, Gauge, MetricsRegistry},
    primitives::{Bag, Id, NodeId},
  },
  indexmap::IndexMap,
  std::sync::{Arc, Mutex},
  tracing::{debug, warn},
};

/// Stamps out polls with a shared threshold configuration.
///
/// A factory carrying a [`ParentGetter`] produces polls that
/// aggregate votes transitively along dependency edges before
/// testing termination.
#[derive(Clone)]
pub struct PollFactory {
  alpha_preference: u64,
  alpha_confidence: u64,
  parents: Option<Arc<dyn ParentGetter>>,
}

impl PollFactory {
  pub fn new(alpha_preference: u64, alpha_confidence: u64) -> Self {
    Self {
      alpha_preference,
      alpha_confidence,
      parents: None,
    }
  }

  pub fn with_parents(mut self, parents: Arc<dyn ParentGetter>) -> Self {
    self.parents = Some(parents);
    self
  }

  pub fn new_poll(&self, polled: Bag<NodeId>) -> Poll {
    Poll::new(
      self.alpha_preference,
      self.alpha_confidence,
      polled,
      self.parents.clone(),
    )
  }
}

/// The outcome of one finished poll.
#[derive(Debug, Clone)]
pub struct PollResult {
  pub request_id: u32,
  pub votes: Bag<Id>,
  pub result: Option<Id>,
  pub termination: Termination,
}

struct PollSetMetrics {
  exhausted: Counter,
  early_fail: Counter,
  early_preference: Counter,
  early_confidence: Counter,
  outstanding: Gauge,
  duration: Averager,
}

impl PollSetMetrics {
  fn new(registry: &dyn MetricsRegistry) -> Self {
    Self {
      exhausted: registry.counter("polls_exhausted"),
      early_fail: registry.counter("polls_early_fail"),
      early_preference: registry.counter("polls_early_preference"),
      early_confidence: registry.counter("polls_early_confidence"),
      outstanding: registry.gauge("polls_outstanding"),
      duration: registry.averager("polls_duration_ms"),
    }
  }

  fn observe(&self, termination: Termination) {
    match termination {
      Termination::Exhausted => self.exhausted.inc(),
      Termination::EarlyFail => self.early_fail.inc(),
      Termination::EarlyPreference => self.early_preference.inc(),
      Termination::EarlyConfidence => self.early_confidence.inc(),
    }
  }
}

/// All currently outstanding polls, keyed by request id.
///
/// Polls may finish in any order, results are only ever handed out
/// in ascending request id order: a finished poll stays queued
/// until every poll registered before it finished as well, then the
/// whole contiguous prefix is drained in one sweep.
pub struct PollSet {
  factory: PollFactory,
  polls: Mutex<IndexMap<u32, Poll>>,
  metrics: PollSetMetrics,
}

impl PollSet {
  pub fn new(factory: PollFactory, registry: &dyn MetricsRegistry) -> Self {
    Self {
      factory,
      polls: Mutex::new(IndexMap::new()),
      metrics: PollSetMetrics::new(registry),
    }
  }

  /// Registers a poll over a sampled validator bag.
  ///
  /// Returns false when the request id is already in flight.
  /// Request ids must be registered in ascending order, the drain
  /// order of results is the registration order.
  pub fn add(&self, request_id: u32, polled: Bag<NodeId>) -> bool {
    let mut polls = self.polls.lock().unwrap();
    if polls.contains_key(&request_id) {
      warn!("dropping duplicate poll {request_id}");
      return false;
    }
    polls.insert(request_id, self.factory.new_poll(polled));
    self.metrics.outstanding.set(polls.len() as i64);
    true
  }

  /// Routes a vote to its poll and drains every result that became
  /// deliverable.
  pub fn vote(
    &self,
    request_id: u32,
    validator: &NodeId,
    choice: Id,
  ) -> Vec<PollResult> {
    let mut polls = self.polls.lock().unwrap();
    match polls.get_mut(&request_id) {
      Some(poll) => poll.vote(validator, choice),
      None => {
        debug!("dropping vote from {validator} for missing poll {request_id}");
        return vec![];
      }
    }
    self.drain(&mut polls)
  }

  /// Routes a drop to its poll and drains every result that became
  /// deliverable.
  pub fn drop(&self, request_id: u32, validator: &NodeId) -> Vec<PollResult> {
    let mut polls = self.polls.lock().unwrap();
    match polls.get_mut(&request_id) {
      Some(poll) => poll.drop(validator),
      None => {
        debug!("dropping abstain from {validator} for missing poll {request_id}");
        return vec![];
      }
    }
    self.drain(&mut polls)
  }

  pub fn len(&self) -> usize {
    self.polls.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Age of the oldest outstanding poll.
  pub fn oldest_age(&self) -> Option<std::time::Duration> {
    let polls = self.polls.lock().unwrap();
    polls.get_index(0).map(|(_, poll)| poll.age())
  }

  fn drain(&self, polls: &mut IndexMap<u32, Poll>) -> Vec<PollResult> {
    let mut results = vec![];
    while let Some((request_id, poll)) = polls.get_index(0) {
      if !poll.finished() {
        break;
      }
      let request_id = *request_id;
      let termination =
        poll.termination().expect("finished polls carry a termination");
      self.metrics.observe(termination);
      self.metrics.duration.observe(poll.age().as_millis() as u64);
      let (_, poll) = polls.shift_remove_index(0).unwrap();
      results.push(PollResult {
        request_id,
        result: poll.result(),
        termination,
        votes: poll.votes().clone(),
      });
    }
    self.metrics.outstanding.set(polls.len() as i64);
    results
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{PollFactory, PollSet},
    crate::{
      metrics::{InMemMetrics, MetricsRegistry, NullMetrics},
      primitives::{Bag, Id, NodeId},
      prism::Termination,
    },
  };

  fn id(b: u8) -> Id {
    Id::new([b; 32])
  }

  fn node(b: u8) -> NodeId {
    NodeId::new([b; 32])
  }

  fn single(b: u8) -> Bag<NodeId> {
    let mut bag = Bag::new();
    bag.add(node(b));
    bag
  }

  #[test]
  fn results_wait_for_the_oldest_poll() {
    let set = PollSet::new(PollFactory::new(1, 1), &NullMetrics);
    assert!(set.add(1, single(1)));
    assert!(set.add(2, single(2)));
    assert!(set.add(3, single(3)));

    // requests 2 and 3 finish first, nothing may surface until
    // request 1 is done
    assert!(set.vote(2, &node(2), id(7)).is_empty());
    assert!(set.vote(3, &node(3), id(7)).is_empty());

    let results = set.vote(1, &node(1), id(7));
    let order: Vec<u32> = results.iter().map(|r| r.request_id).collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert!(set.is_empty());
  }

  #[test]
  fn duplicate_request_ids_are_rejected() {
    let set = PollSet::new(PollFactory::new(1, 1), &NullMetrics);
    assert!(set.add(7, single(1)));
    assert!(!set.add(7, single(2)));
    assert_eq!(set.len(), 1);
  }

  #[test]
  fn votes_for_missing_polls_are_swallowed() {
    let set = PollSet::new(PollFactory::new(1, 1), &NullMetrics);
    assert!(set.vote(42, &node(1), id(1)).is_empty());
    assert!(set.drop(42, &node(1)).is_empty());
  }

  #[test]
  fn terminations_are_counted_separately() {
    let registry = InMemMetrics::default();
    let set = PollSet::new(PollFactory::new(1, 2), &registry);

    set.add(1, single(1));
    set.vote(1, &node(1), id(1));

    let mut polled = Bag::new();
    polled.add(node(1));
    polled.add(node(2));
    set.add(2, polled);
    set.drop(2, &node(1));
    set.drop(2, &node(2));

    assert_eq!(registry.counter("polls_exhausted").get(), 2);
    assert_eq!(registry.gauge("polls_outstanding").get(), 0);
    assert_eq!(registry.averager("polls_duration_ms").count(), 2);
  }

  #[test]
  fn result_carries_the_votes_bag() {
    let set = PollSet::new(PollFactory::new(1, 1), &NullMetrics);
    let mut polled = Bag::new();
    polled.add_count(node(1), 3);
    set.add(1, polled);

    let results = set.vote(1, &node(1), id(5));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].votes.count(&id(5)), 3);
    assert_eq!(results[0].result, Some(id(5)));
    assert_eq!(results[0].termination, Termination::Exhausted);
  }
}
