//! The consensus core of the Lumen multi-chain platform.
//!
//! Three tightly coupled subsystems make up the core: the sampling
//! and voting primitive in [`prism`], the linear chain engine
//! layered on top of it in [`nova`], and the fast-path certificate
//! layer for owned-object transactions in [`wave`] backed by the
//! post-quantum signatures of [`ringtail`]. Transports, mempools,
//! persistence and validator set management live outside, the core
//! talks to them through the collaborator traits each module
//! exports.

pub mod metrics;
pub mod nova;
pub mod params;
pub mod primitives;
pub mod prism;
pub mod ringtail;
pub mod runtime;
pub mod sampler;
pub mod validators;
pub mod wave;

pub use {
  nova::Nova,
  params::Parameters,
  prism::Prism,
  ringtail::RingtailEngine,
  runtime::Core,
  sampler::Splitter,
  wave::WaveFpc,
};

#[cfg(test)]
pub mod test;
