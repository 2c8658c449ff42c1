use {
  serde::{Deserialize, Serialize},
  std::time::Duration,
  thiserror::Error,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
  #[error("k = {0}, expected k > 0")]
  K(u64),

  #[error("alphaPreference = {alpha}, expected alphaPreference > {k}/2")]
  AlphaPreferenceTooSmall { alpha: u64, k: u64 },

  #[error("alphaPreference = {alpha}, expected alphaPreference <= k = {k}")]
  AlphaPreferenceTooLarge { alpha: u64, k: u64 },

  #[error(
    "alphaConfidence = {conf}, expected alphaConfidence >= \
     alphaPreference = {pref}"
  )]
  AlphaConfidenceTooSmall { conf: u64, pref: u64 },

  #[error("alphaConfidence = {conf}, expected alphaConfidence <= k = {k}")]
  AlphaConfidenceTooLarge { conf: u64, k: u64 },

  #[error("beta = {0}, expected beta > 0")]
  BetaTooSmall(u64),

  #[error("beta = {beta}, expected beta <= k = {k}")]
  BetaTooLarge { beta: u64, k: u64 },

  #[error("concurrentPolls = {0}, expected concurrentPolls > 0")]
  ConcurrentPolls(u64),

  #[error("optimalProcessing = {0}, expected optimalProcessing > 0")]
  OptimalProcessing(u64),

  #[error("maxOutstandingItems = {0}, expected maxOutstandingItems > 0")]
  MaxOutstandingItems(u64),

  #[error("maxItemProcessingTime is zero, expected a positive duration")]
  MaxItemProcessingTime,
}

/// Consensus configuration.
///
/// Validated once at construction time and never re-read. The greek
/// letters of the protocol papers map to `alpha_preference`,
/// `alpha_confidence` and `beta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
  /// Number of validators sampled in every poll.
  pub k: u64,

  /// Minimum vote count required to update the running preference.
  pub alpha_preference: u64,

  /// Minimum vote count required to increment confidence
  /// towards finalization.
  pub alpha_confidence: u64,

  /// Number of consecutive confident polls required to finalize.
  pub beta: u64,

  /// Number of polls that may be outstanding at any moment.
  pub concurrent_polls: u64,

  /// Number of items the engine aims to keep processing at once.
  pub optimal_processing: u64,

  /// Hard ceiling on items processing at once, enforced through
  /// health reporting.
  pub max_outstanding_items: u64,

  /// How long a single item may stay processing before the node
  /// reports itself unhealthy.
  #[serde(with = "humantime_serde")]
  pub max_item_processing_time: Duration,

  /// Maximum number of parents a host DAG block may reference.
  pub max_parents: u64,

  /// Upper bound on tracked conflicting transactions per object.
  pub conflict_set_size: u64,
}

impl Default for Parameters {
  fn default() -> Self {
    Self {
      k: 20,
      alpha_preference: 14,
      alpha_confidence: 18,
      beta: 8,
      concurrent_polls: 4,
      optimal_processing: 10,
      max_outstanding_items: 256,
      max_item_processing_time: Duration::from_secs(30),
      max_parents: 8,
      conflict_set_size: 32,
    }
  }
}

impl Parameters {
  /// Checks every configuration rule in a fixed order and reports
  /// the first one broken. The two lower bounds on `max_parents`
  /// and `conflict_set_size` hold by construction, both fields
  /// are unsigned.
  pub fn validate(&self) -> Result<(), ParamsError> {
    if self.k == 0 {
      return Err(ParamsError::K(self.k));
    }
    if 2 * self.alpha_preference <= self.k {
      return Err(ParamsError::AlphaPreferenceTooSmall {
        alpha: self.alpha_preference,
        k: self.k,
      });
    }
    if self.alpha_preference > self.k {
      return Err(ParamsError::AlphaPreferenceTooLarge {
        alpha: self.alpha_preference,
        k: self.k,
      });
    }
    if self.alpha_confidence < self.alpha_preference {
      return Err(ParamsError::AlphaConfidenceTooSmall {
        conf: self.alpha_confidence,
        pref: self.alpha_preference,
      });
    }
    if self.alpha_confidence > self.k {
      return Err(ParamsError::AlphaConfidenceTooLarge {
        conf: self.alpha_confidence,
        k: self.k,
      });
    }
    if self.beta == 0 {
      return Err(ParamsError::BetaTooSmall(self.beta));
    }
    if self.beta > self.k {
      return Err(ParamsError::BetaTooLarge {
        beta: self.beta,
        k: self.k,
      });
    }
    if self.concurrent_polls == 0 {
      return Err(ParamsError::ConcurrentPolls(self.concurrent_polls));
    }
    if self.optimal_processing == 0 {
      return Err(ParamsError::OptimalProcessing(self.optimal_processing));
    }
    if self.max_outstanding_items == 0 {
      return Err(ParamsError::MaxOutstandingItems(
        self.max_outstanding_items,
      ));
    }
    if self.max_item_processing_time.is_zero() {
      return Err(ParamsError::MaxItemProcessingTime);
    }
    Ok(())
  }
}
