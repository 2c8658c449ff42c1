use {
  crate::primitives::{Id, NodeId},
  serde::{Deserialize, Serialize},
  std::collections::HashMap,
  thiserror::Error,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorSetError {
  #[error("validator set has no total weight")]
  NoWeight,

  #[error("validator {0} appears more than once")]
  Duplicate(NodeId),
}

/// A single validator taking part in the consensus, together
/// with its voting weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
  pub id: NodeId,
  pub weight: u64,
}

/// An ordered set of validators for one epoch.
///
/// Membership indices are assigned in construction order and stay
/// stable for the lifetime of the set, voter bitmaps are keyed by
/// those indices.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
  validators: Vec<Validator>,
  index: HashMap<NodeId, usize>,
  total_weight: u64,
}

impl ValidatorSet {
  pub fn new(
    validators: Vec<Validator>,
  ) -> Result<Self, ValidatorSetError> {
    let mut index = HashMap::with_capacity(validators.len());
    let mut total_weight = 0u64;
    for (i, validator) in validators.iter().enumerate() {
      if index.insert(validator.id, i).is_some() {
        return Err(ValidatorSetError::Duplicate(validator.id));
      }
      total_weight += validator.weight;
    }
    if total_weight == 0 {
      return Err(ValidatorSetError::NoWeight);
    }
    Ok(Self {
      validators,
      index,
      total_weight,
    })
  }

  pub fn len(&self) -> usize {
    self.validators.len()
  }

  pub fn is_empty(&self) -> bool {
    self.validators.is_empty()
  }

  pub fn total_weight(&self) -> u64 {
    self.total_weight
  }

  pub fn contains(&self, id: &NodeId) -> bool {
    self.index.contains_key(id)
  }

  /// Stable membership index of a validator within this epoch.
  pub fn index_of(&self, id: &NodeId) -> Option<usize> {
    self.index.get(id).copied()
  }

  pub fn weight_of(&self, id: &NodeId) -> Option<u64> {
    self.index.get(id).map(|i| self.validators[*i].weight)
  }

  pub fn get(&self, index: usize) -> Option<&Validator> {
    self.validators.get(index)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Validator> {
    self.validators.iter()
  }

  pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
    self.validators.iter().map(|v| &v.id)
  }

  /// Number of tolerated byzantine validators.
  pub fn max_faulty(&self) -> usize {
    self.validators.len().saturating_sub(1) / 3
  }

  /// Number of distinct validators that constitutes a byzantine
  /// quorum (2f + 1).
  pub fn quorum(&self) -> usize {
    2 * self.max_faulty() + 1
  }
}

/// Read side of the validator registry maintained by the outer
/// system. The core observes epoch rotation through this interface,
/// it never drives it.
pub trait ValidatorState: Send + Sync {
  /// Height of the chain tip known to the registry.
  fn get_current_height(&self) -> u64;

  /// Lowest height for which a validator set can still be served.
  fn get_minimum_height(&self) -> u64;

  /// Subnet owning a chain.
  fn get_subnet_id(&self, chain_id: &Id) -> Option<Id>;

  /// Validator set of a subnet as of a given height.
  fn get_validator_set(
    &self,
    height: u64,
    subnet_id: &Id,
  ) -> Option<ValidatorSet>;
}

/// Resolves the committee currently in charge of a chain.
pub fn current_committee(
  state: &dyn ValidatorState,
  chain_id: &Id,
) -> Option<ValidatorSet> {
  let height = state.get_current_height();
  let subnet_id = state.get_subnet_id(chain_id)?;
  state.get_validator_set(height, &subnet_id)
}

#[cfg(test)]
mod tests {
  use super::{Validator, ValidatorSet, ValidatorSetError};

  fn node(b: u8) -> crate::primitives::NodeId {
    crate::primitives::NodeId::new([b; 32])
  }

  #[test]
  fn indices_follow_construction_order() {
    let set = ValidatorSet::new(vec![
      Validator { id: node(3), weight: 10 },
      Validator { id: node(1), weight: 20 },
    ])
    .unwrap();

    assert_eq!(set.index_of(&node(3)), Some(0));
    assert_eq!(set.index_of(&node(1)), Some(1));
    assert_eq!(set.total_weight(), 30);
  }

  #[test]
  fn rejects_zero_total_weight() {
    let result = ValidatorSet::new(vec![Validator {
      id: node(1),
      weight: 0,
    }]);
    assert_eq!(result.unwrap_err(), ValidatorSetError::NoWeight);
  }

  #[test]
  fn rejects_duplicates() {
    let result = ValidatorSet::new(vec![
      Validator { id: node(1), weight: 1 },
      Validator { id: node(1), weight: 2 },
    ]);
    assert_eq!(
      result.unwrap_err(),
      ValidatorSetError::Duplicate(node(1))
    );
  }

  struct OneSubnet {
    subnet: crate::primitives::Id,
    set: ValidatorSet,
  }

  impl super::ValidatorState for OneSubnet {
    fn get_current_height(&self) -> u64 {
      7
    }

    fn get_minimum_height(&self) -> u64 {
      0
    }

    fn get_subnet_id(
      &self,
      _chain_id: &crate::primitives::Id,
    ) -> Option<crate::primitives::Id> {
      Some(self.subnet)
    }

    fn get_validator_set(
      &self,
      height: u64,
      subnet_id: &crate::primitives::Id,
    ) -> Option<ValidatorSet> {
      (height == 7 && *subnet_id == self.subnet)
        .then(|| self.set.clone())
    }
  }

  #[test]
  fn committee_resolution_goes_through_the_registry() {
    let set = ValidatorSet::new(vec![Validator {
      id: node(1),
      weight: 5,
    }])
    .unwrap();
    let state = OneSubnet {
      subnet: crate::primitives::Id::new([9u8; 32]),
      set,
    };

    let committee = super::current_committee(
      &state,
      &crate::primitives::Id::new([1u8; 32]),
    )
    .unwrap();
    assert_eq!(committee.total_weight(), 5);
  }

  #[test]
  fn quorum_of_four_is_three() {
    let set = ValidatorSet::new(
      (1..=4)
        .map(|i| Validator { id: node(i), weight: 1 })
        .collect(),
    )
    .unwrap();
    assert_eq!(set.max_faulty(), 1);
    assert_eq!(set.quorum(), 3);
  }
}
