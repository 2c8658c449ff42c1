use {
  super::b58::ToBase58String,
  serde::{
    de::{self, Visitor},
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
  },
  std::{
    fmt::{Debug, Display, Formatter},
    ops::Deref,
    str::FromStr,
  },
};

/// Declares an opaque 32-byte identifier newtype.
///
/// All identifiers in the consensus core are compared by value,
/// hashable and totally ordered by their byte representation. They
/// render as base58 strings in both display and human-readable
/// serde forms, and as raw bytes in binary forms.
macro_rules! define_id {
  ($(#[$doc:meta])* $name:ident) => {
    $(#[$doc])*
    #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct $name([u8; 32]);

    impl $name {
      pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
      }

      pub fn to_bytes(self) -> [u8; 32] {
        self.0
      }
    }

    impl From<[u8; 32]> for $name {
      fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
      }
    }

    impl Deref for $name {
      type Target = [u8];

      fn deref(&self) -> &Self::Target {
        &self.0
      }
    }

    impl Display for $name {
      fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_b58())
      }
    }

    impl Debug for $name {
      fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, concat!(stringify!($name), "({})"), self.0.to_b58())
      }
    }

    impl FromStr for $name {
      type Err = bs58::decode::Error;

      fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        bs58::decode(s).into(&mut bytes)?;
        Ok(Self(bytes))
      }
    }

    impl Serialize for $name {
      fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
          s.serialize_str(&self.0.to_b58())
        } else {
          s.serialize_bytes(&self.0)
        }
      }
    }

    impl<'de> Deserialize<'de> for $name {
      fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct IdVisitor;
        impl<'de> Visitor<'de> for IdVisitor {
          type Value = [u8; 32];

          fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
            write!(f, "32 bytes or a base58 string")
          }

          fn visit_str<E: de::Error>(self, s: &str) -> Result<Self::Value, E> {
            let mut bytes = [0u8; 32];
            bs58::decode(s)
              .into(&mut bytes)
              .map_err(|e| de::Error::custom(e.to_string()))?;
            Ok(bytes)
          }

          fn visit_bytes<E: de::Error>(
            self,
            b: &[u8],
          ) -> Result<Self::Value, E> {
            b.try_into()
              .map_err(|_| de::Error::invalid_length(b.len(), &self))
          }

          fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
          ) -> Result<Self::Value, A::Error> {
            let mut bytes = [0u8; 32];
            for (i, byte) in bytes.iter_mut().enumerate() {
              *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
            }
            Ok(bytes)
          }
        }

        if d.is_human_readable() {
          d.deserialize_str(IdVisitor).map(Self)
        } else {
          d.deserialize_bytes(IdVisitor).map(Self)
        }
      }
    }
  };
}

define_id! {
  /// Identifies a decidable item, most commonly a block.
  Id
}

define_id! {
  /// Identifies a validator taking part in the consensus.
  NodeId
}

define_id! {
  /// Identifies a transaction riding on a host block.
  TxRef
}

define_id! {
  /// Identifies an owned-state object touched by a transaction.
  ObjectId
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrip_b58() {
    let id = Id::new([7u8; 32]);
    let encoded = id.to_string();
    assert_eq!(encoded.parse::<Id>().unwrap(), id);
  }

  #[test]
  fn ordering_by_bytes() {
    let a = Id::new([1u8; 32]);
    let b = Id::new([2u8; 32]);
    assert!(a < b);
  }

  #[test]
  fn serde_human_readable() {
    let id = NodeId::new([3u8; 32]);
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
    assert_eq!(serde_json::from_str::<NodeId>(&json).unwrap(), id);
  }

  #[test]
  fn serde_binary() {
    let id = TxRef::new([9u8; 32]);
    let bytes = bincode::serialize(&id).unwrap();
    assert_eq!(bincode::deserialize::<TxRef>(&bytes).unwrap(), id);
  }
}
