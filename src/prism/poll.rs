use {
  crate::primitives::{Bag, Id, NodeId},
  std::{collections::HashMap, sync::Arc, time::Instant},
  tracing::debug,
};

/// Resolves the dependency edge of a decision id, when one exists.
///
/// Polls configured with a parent getter aggregate votes
/// transitively along these edges before testing their termination
/// conditions.
pub trait ParentGetter: Send + Sync {
  fn parent(&self, id: &Id) -> Option<Id>;
}

/// Why a poll stopped collecting votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
  /// Every polled validator voted or dropped out.
  Exhausted,

  /// Not enough validators are left for any choice to gather
  /// an alpha-preference majority.
  EarlyFail,

  /// Some choice reached alpha-preference and no competitor can
  /// reach alpha-confidence anymore.
  EarlyPreference,

  /// Some choice already gathered alpha-confidence votes.
  EarlyConfidence,
}

/// One active voting round over a sampled set of validators.
///
/// Every sampled validator contributes its whole weight exactly
/// once, either to a choice through [`Poll::vote`] or to nothing
/// through [`Poll::drop`]. The poll latches a termination reason
/// the moment its outcome can no longer change.
pub struct Poll {
  alpha_preference: u64,
  alpha_confidence: u64,
  polled: Bag<NodeId>,
  votes: Bag<Id>,
  started: Instant,
  termination: Option<Termination>,
  parents: Option<Arc<dyn ParentGetter>>,
}

impl std::fmt::Debug for Poll {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Poll")
      .field("polled", &self.polled)
      .field("votes", &self.votes)
      .field("termination", &self.termination)
      .finish()
  }
}

impl Poll {
  pub fn new(
    alpha_preference: u64,
    alpha_confidence: u64,
    polled: Bag<NodeId>,
    parents: Option<Arc<dyn ParentGetter>>,
  ) -> Self {
    let mut poll = Self {
      alpha_preference,
      alpha_confidence,
      polled,
      votes: Bag::new(),
      started: Instant::now(),
      termination: None,
      parents,
    };
    // an empty sample finishes on the spot
    poll.evaluate();
    poll
  }

  /// Credits the validator's entire weight to a choice.
  ///
  /// Votes from validators that were never polled, or that already
  /// voted or dropped, are ignored.
  pub fn vote(&mut self, validator: &NodeId, choice: Id) {
    let weight = self.polled.remove_all(validator);
    if weight == 0 {
      debug!("ignoring vote from unpolled validator {validator}");
      return;
    }
    self.votes.add_count(choice, weight);
    self.evaluate();
  }

  /// Removes the validator from the outstanding set without
  /// crediting any choice.
  pub fn drop(&mut self, validator: &NodeId) {
    if self.polled.remove_all(validator) == 0 {
      debug!("ignoring drop from unpolled validator {validator}");
      return;
    }
    self.evaluate();
  }

  pub fn finished(&self) -> bool {
    self.termination.is_some()
  }

  pub fn termination(&self) -> Option<Termination> {
    self.termination
  }

  /// The winning choice, when any vote arrived at all.
  pub fn result(&self) -> Option<Id> {
    if self.votes.is_empty() {
      return None;
    }
    Some(self.votes.mode().0)
  }

  /// Vote count of the winning choice.
  pub fn result_votes(&self) -> u64 {
    self.votes.mode().1
  }

  pub fn votes(&self) -> &Bag<Id> {
    &self.votes
  }

  pub fn age(&self) -> std::time::Duration {
    self.started.elapsed()
  }

  fn evaluate(&mut self) {
    if self.termination.is_some() {
      return;
    }

    let remaining = self.polled.len();
    if remaining == 0 {
      self.termination = Some(Termination::Exhausted);
      return;
    }

    let received = self.votes.len();
    if received + remaining < self.alpha_preference {
      self.termination = Some(Termination::EarlyFail);
      return;
    }

    self.termination = match &self.parents {
      None => self.evaluate_flat(remaining),
      Some(getter) => self.evaluate_transitive(remaining, getter.clone()),
    };
  }

  /// Terminations over the raw vote counts, with every choice
  /// competing against every other.
  fn evaluate_flat(&self, remaining: u64) -> Option<Termination> {
    let (_, freq) = self.votes.mode();
    if freq >= self.alpha_confidence {
      return Some(Termination::EarlyConfidence);
    }
    let second = self.votes.second();
    if freq >= self.alpha_preference
      && remaining + second < self.alpha_confidence
    {
      return Some(Termination::EarlyPreference);
    }
    None
  }

  /// Terminations over the vote graph.
  ///
  /// Each voted id passes its count transitively to its parent when
  /// the parent was voted on as well. The poll may stop only when
  /// every id in the graph is decided under its aggregated count:
  /// it reached alpha-confidence, it reached alpha-preference and
  /// no sibling branch can reach alpha-confidence, or it can no
  /// longer reach alpha-preference at all.
  fn evaluate_transitive(
    &self,
    remaining: u64,
    getter: Arc<dyn ParentGetter>,
  ) -> Option<Termination> {
    let counts: HashMap<Id, u64> =
      self.votes.iter().map(|(id, c)| (*id, c)).collect();

    let mut edges: HashMap<Id, Id> = HashMap::new();
    for id in counts.keys() {
      if let Some(parent) = getter.parent(id) {
        if counts.contains_key(&parent) {
          edges.insert(*id, parent);
        }
      }
    }

    // transitive counts, each id contributes its own votes to the
    // whole ancestor chain present in the graph
    let mut transitive = counts.clone();
    for (id, count) in &counts {
      let mut cursor = *id;
      // the walk is bounded in case a malformed getter loops
      for _ in 0..counts.len() {
        match edges.get(&cursor) {
          Some(parent) => {
            *transitive.get_mut(parent).expect("edge into voted id") +=
              count;
            cursor = *parent;
          }
          None => break,
        }
      }
    }

    // sibling groups share a parent edge, roots compete together
    let mut groups: HashMap<Option<Id>, Vec<Id>> = HashMap::new();
    for id in counts.keys() {
      groups.entry(edges.get(id).copied()).or_default().push(*id);
    }

    let mut best = 0;
    for members in groups.values() {
      for id in members {
        let aggregated = transitive[id];
        best = best.max(aggregated);
        let competitor = members
          .iter()
          .filter(|other| *other != id)
          .map(|other| transitive[other])
          .max()
          .unwrap_or(0);

        let decided = aggregated >= self.alpha_confidence
          || (aggregated >= self.alpha_preference
            && remaining + competitor < self.alpha_confidence)
          || aggregated + remaining < self.alpha_preference;
        if !decided {
          return None;
        }
      }
    }

    if best >= self.alpha_confidence {
      Some(Termination::EarlyConfidence)
    } else if best >= self.alpha_preference {
      Some(Termination::EarlyPreference)
    } else {
      Some(Termination::EarlyFail)
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{ParentGetter, Poll, Termination},
    crate::primitives::{Bag, Id, NodeId},
    std::{collections::HashMap, sync::Arc},
  };

  fn id(b: u8) -> Id {
    Id::new([b; 32])
  }

  fn node(b: u8) -> NodeId {
    NodeId::new([b; 32])
  }

  fn sample(nodes: &[u8]) -> Bag<NodeId> {
    let mut bag = Bag::new();
    for b in nodes {
      bag.add(node(*b));
    }
    bag
  }

  #[test]
  fn early_preference_termination() {
    // three of five vote for the same block, one drops out, and
    // alpha-confidence of five is out of reach for everyone
    let mut poll = Poll::new(3, 5, sample(&[1, 2, 3, 4, 5]), None);
    poll.vote(&node(1), id(9));
    poll.vote(&node(2), id(9));
    assert!(!poll.finished());

    poll.vote(&node(3), id(9));
    poll.drop(&node(4));
    assert!(poll.finished());
    assert_eq!(poll.termination(), Some(Termination::EarlyPreference));
    assert_eq!(poll.result(), Some(id(9)));
    assert_eq!(poll.result_votes(), 3);
  }

  #[test]
  fn early_confidence_termination() {
    let mut poll = Poll::new(2, 3, sample(&[1, 2, 3, 4, 5]), None);
    poll.vote(&node(1), id(9));
    poll.vote(&node(2), id(9));
    poll.vote(&node(3), id(9));
    assert_eq!(poll.termination(), Some(Termination::EarlyConfidence));
  }

  #[test]
  fn early_fail_termination() {
    let mut poll = Poll::new(4, 4, sample(&[1, 2, 3, 4, 5]), None);
    poll.drop(&node(1));
    poll.drop(&node(2));
    assert_eq!(poll.termination(), Some(Termination::EarlyFail));
    assert_eq!(poll.result(), None);
  }

  #[test]
  fn exhaustion_termination() {
    let mut poll = Poll::new(2, 2, sample(&[1, 2]), None);
    poll.vote(&node(1), id(8));
    poll.drop(&node(2));
    assert_eq!(poll.termination(), Some(Termination::Exhausted));
  }

  #[test]
  fn repeated_votes_count_once() {
    let mut poll = Poll::new(2, 3, sample(&[1, 2, 3]), None);
    poll.vote(&node(1), id(9));
    poll.vote(&node(1), id(9));
    poll.vote(&node(1), id(7));
    assert_eq!(poll.votes().count(&id(9)), 1);
    assert_eq!(poll.votes().count(&id(7)), 0);
  }

  #[test]
  fn votes_from_unpolled_validators_are_ignored() {
    let mut poll = Poll::new(2, 3, sample(&[1, 2, 3]), None);
    poll.vote(&node(9), id(9));
    assert_eq!(poll.votes().len(), 0);
  }

  struct Chain(HashMap<Id, Id>);
  impl ParentGetter for Chain {
    fn parent(&self, id: &Id) -> Option<Id> {
      self.0.get(id).copied()
    }
  }

  #[test]
  fn transitive_votes_terminate_a_split_poll() {
    // B2 is a child of B1, votes split between them still add up
    // to an alpha-confidence majority on B1
    let chain = Arc::new(Chain(HashMap::from([(id(2), id(1))])));
    let mut poll =
      Poll::new(3, 4, sample(&[1, 2, 3, 4, 5]), Some(chain));

    poll.vote(&node(1), id(1));
    poll.vote(&node(2), id(2));
    poll.vote(&node(3), id(2));
    poll.vote(&node(4), id(2));
    assert!(poll.finished());
    assert_eq!(poll.termination(), Some(Termination::EarlyConfidence));
  }

  #[test]
  fn split_poll_without_ancestry_keeps_going() {
    let mut poll = Poll::new(3, 4, sample(&[1, 2, 3, 4, 5]), None);
    poll.vote(&node(1), id(1));
    poll.vote(&node(2), id(1));
    poll.vote(&node(3), id(2));
    poll.vote(&node(4), id(2));
    assert!(!poll.finished());
  }
}
