mod b58;
mod bag;
mod bitset;
mod ids;

pub use {
  b58::ToBase58String,
  bag::Bag,
  bitset::{Bitset, BitsetError},
  ids::{Id, NodeId, ObjectId, TxRef},
};
