use crate::primitives::{Bag, Id};

/// The alpha/beta vote threshold state machine.
///
/// One `Cut` tracks a single decision: votes accumulate in a bag,
/// and each call to [`Cut::refract`] evaluates them against the
/// configured thresholds. A preference emerges once some choice
/// gathers alpha-preference votes, confidence grows by one for every
/// consecutive evaluation where that same choice gathers
/// alpha-confidence votes, and beta consecutive confident
/// evaluations finalize the decision for good.
#[derive(Debug, Clone)]
pub struct Cut {
  alpha_preference: u64,
  alpha_confidence: u64,
  beta: u64,
  preference: Option<Id>,
  confidence: u64,
  finalized: bool,
  votes: Bag<Id>,
}

impl Cut {
  pub fn new(
    alpha_preference: u64,
    alpha_confidence: u64,
    beta: u64,
  ) -> Self {
    Self {
      alpha_preference,
      alpha_confidence,
      beta,
      preference: None,
      confidence: 0,
      finalized: false,
      votes: Bag::new(),
    }
  }

  /// Seeds the initial preference without touching confidence.
  ///
  /// Only meaningful while no preference exists, later calls are
  /// ignored. The tree uses this to prefer the first child of a
  /// block before any poll has been recorded for it.
  pub fn prefer(&mut self, choice: Id) {
    if self.preference.is_none() {
      self.preference = Some(choice);
    }
  }

  pub fn record_vote(&mut self, choice: Id, weight: u64) {
    self.votes.add_count(choice, weight);
  }

  pub fn record_votes(&mut self, votes: &Bag<Id>) {
    for (choice, count) in votes.iter() {
      self.votes.add_count(*choice, count);
    }
  }

  /// An evaluation round that did not reach any threshold.
  /// Confidence restarts from zero, the preference survives.
  pub fn falter(&mut self) {
    if !self.finalized {
      self.confidence = 0;
    }
  }

  /// Evaluates the accumulated votes against the thresholds.
  ///
  /// Returns whether the preference moved in this call. Once the
  /// decision finalized the state is latched and further calls are
  /// no-ops.
  pub fn refract(&mut self) -> bool {
    if self.finalized {
      return false;
    }

    let (leader, weight) = self.votes.mode();
    let previous = self.preference;

    if weight >= self.alpha_preference {
      self.preference = Some(leader);
    }

    if let Some(preference) = self.preference {
      if preference == leader {
        if weight >= self.alpha_confidence {
          self.confidence += 1;
        } else {
          self.confidence = 0;
        }
      }
    }

    // moving off an established preference forfeits all confidence,
    // including anything gathered in this very evaluation
    let changed = self.preference != previous;
    if changed && previous.is_some() {
      self.confidence = 0;
    }

    if self.confidence >= self.beta {
      self.finalized = true;
    }
    changed
  }

  /// Clears the votes accumulated for the next evaluation round.
  /// Preference, confidence and finalization survive across rounds.
  pub fn reset(&mut self) {
    self.votes.clear();
  }

  pub fn preference(&self) -> Option<Id> {
    self.preference
  }

  pub fn confidence(&self) -> u64 {
    self.confidence
  }

  pub fn is_finalized(&self) -> bool {
    self.finalized
  }

  pub fn votes(&self) -> &Bag<Id> {
    &self.votes
  }
}
