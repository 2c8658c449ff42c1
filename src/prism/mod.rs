//! One round of sampling consensus.
//!
//! A round samples k validators out of the current set, collects
//! their ballots over a dependency graph of pending decisions,
//! refracts those ballots into one weighted choice per decision
//! root and feeds the result into the alpha/beta threshold state
//! machine. Rounds repeat until the machine finalizes.

mod cut;
mod poll;
mod pollset;
mod refractor;

pub use {
  cut::Cut,
  poll::{ParentGetter, Poll, Termination},
  pollset::{PollFactory, PollResult, PollSet},
  refractor::Refractor,
};

use {
  crate::{
    params::Parameters,
    primitives::{Id, NodeId},
    sampler::Splitter,
    validators::ValidatorSet,
  },
  thiserror::Error,
  tracing::debug,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrismError {
  #[error("cannot sample an empty validator set")]
  EmptyValidatorSet,
}

/// A decision refracted out of a dependency walk: the id the walk
/// settled on and the weight backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefractedDecision {
  pub choice: Id,
  pub weight: u64,
}

/// The pending decisions of one round and the ballots known
/// for them.
///
/// Roots are the decisions the round is asked to settle, each of
/// them may depend on further ids forming an acyclic graph. The
/// tally of an id counts the weight of the sampled validators
/// backing it.
pub trait DecisionGraph {
  fn roots(&self) -> Vec<Id>;
  fn dependencies(&self, id: &Id) -> Vec<Id>;
  fn tally(&self, id: &Id, sample: &[NodeId]) -> u64;
}

/// Composes the splitter, the refractor and the cut into a
/// consensus round driver for one decision set.
pub struct Prism {
  params: Parameters,
  splitter: Splitter,
  refractor: Refractor,
  cut: Cut,
}

impl Prism {
  pub fn new(params: Parameters, seed: [u8; 32]) -> Self {
    let cut = Cut::new(
      params.alpha_preference,
      params.alpha_confidence,
      params.beta,
    );
    Self {
      params,
      splitter: Splitter::new(seed),
      refractor: Refractor::default(),
      cut,
    }
  }

  /// Runs one full round and reports whether the cut finalized.
  ///
  /// The votes of previous rounds are cleared, preference and
  /// confidence carry over.
  pub fn refract(
    &mut self,
    validators: &ValidatorSet,
    decisions: &dyn DecisionGraph,
  ) -> Result<bool, PrismError> {
    if validators.is_empty() {
      return Err(PrismError::EmptyValidatorSet);
    }

    let sample = self
      .splitter
      .sample_weighted(validators, self.params.k as usize);

    self.cut.reset();
    for root in decisions.roots() {
      if let Some(decision) = self.traverse(&root, decisions, &sample) {
        self.cut.record_vote(decision.choice, decision.weight);
      }
    }
    self.cut.refract();
    Ok(self.cut.is_finalized())
  }

  /// Walks the dependency chain of one root, carrying the best
  /// backed id seen so far and stopping at the first id whose
  /// tally reaches alpha-confidence.
  fn traverse(
    &self,
    root: &Id,
    decisions: &dyn DecisionGraph,
    sample: &[NodeId],
  ) -> Option<RefractedDecision> {
    let mut best: Option<RefractedDecision> = None;
    let mut frontier = vec![*root];
    let mut visited = vec![];

    while let Some(id) = frontier.pop() {
      if visited.contains(&id) {
        continue;
      }
      visited.push(id);

      let weight = decisions.tally(&id, sample);
      if best.map_or(true, |b| weight > b.weight) {
        best = Some(RefractedDecision { choice: id, weight });
      }
      if self
        .refractor
        .should_terminate(weight, self.params.alpha_confidence)
      {
        debug!("refraction of {root} terminated early at {id}");
        return Some(RefractedDecision { choice: id, weight });
      }
      frontier.extend(decisions.dependencies(&id));
    }
    best.filter(|b| b.weight > 0)
  }

  pub fn preference(&self) -> Option<Id> {
    self.cut.preference()
  }

  pub fn confidence(&self) -> u64 {
    self.cut.confidence()
  }

  pub fn is_finalized(&self) -> bool {
    self.cut.is_finalized()
  }
}
