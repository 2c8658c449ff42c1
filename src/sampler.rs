use {
  crate::{primitives::NodeId, validators::ValidatorSet},
  itertools::Itertools,
  rand::{
    distributions::{Distribution, WeightedIndex},
    Rng,
    SeedableRng,
  },
  rand_chacha::ChaCha20Rng,
};

/// Samples k validators out of a set.
///
/// The randomness source is a per-instance ChaCha20 stream seeded
/// explicitly, so that every validator instance (and every test)
/// can reproduce the exact same sample sequence for a given seed.
#[derive(Debug)]
pub struct Splitter {
  rng: ChaCha20Rng,
}

impl Splitter {
  pub fn new(seed: [u8; 32]) -> Self {
    Self {
      rng: ChaCha20Rng::from_seed(seed),
    }
  }

  /// Uniformly samples `min(k, |validators|)` distinct validators.
  ///
  /// The whole set sorted by node id is returned whenever it is not
  /// larger than k. Larger sets go through a partial Fisher-Yates
  /// shuffle of a copy, and the selected prefix is sorted so that
  /// both branches produce output in the same stable order.
  pub fn sample(
    &mut self,
    validators: &ValidatorSet,
    k: usize,
  ) -> Vec<NodeId> {
    if k == 0 || validators.is_empty() {
      return vec![];
    }

    let mut ids: Vec<NodeId> = validators.ids().copied().collect();
    if ids.len() <= k {
      ids.sort_unstable();
      return ids;
    }

    for i in 0..k {
      let j = self.rng.gen_range(i..ids.len());
      ids.swap(i, j);
    }
    ids.truncate(k);
    ids.sort_unstable();
    ids
  }

  /// Samples `min(k, |validators|)` distinct validators, where each
  /// draw picks among the remaining validators with probability
  /// proportional to their weight.
  pub fn sample_weighted(
    &mut self,
    validators: &ValidatorSet,
    k: usize,
  ) -> Vec<NodeId> {
    if k == 0 || validators.is_empty() {
      return vec![];
    }
    if validators.len() <= k {
      return validators.ids().copied().sorted_unstable().collect();
    }

    let mut remaining: Vec<(NodeId, u64)> = validators
      .iter()
      .map(|v| (v.id, v.weight))
      .collect();

    let mut sampled = Vec::with_capacity(k);
    for _ in 0..k {
      // the index cannot be built once only zero-weight
      // validators remain
      let dist =
        match WeightedIndex::new(remaining.iter().map(|(_, w)| *w)) {
          Ok(dist) => dist,
          Err(_) => break,
        };
      let picked = dist.sample(&mut self.rng);
      sampled.push(remaining.swap_remove(picked).0);
    }
    sampled.sort_unstable();
    sampled
  }
}
