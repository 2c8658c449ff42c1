use {
  dashmap::DashMap,
  std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
  },
};

/// A sink for operational counters, gauges and averagers.
///
/// The core records its metrics through this interface and never
/// assumes a backend exists, every handle is safe to use when no
/// registry is wired up.
pub trait MetricsRegistry: Send + Sync {
  fn counter(&self, name: &'static str) -> Counter;
  fn gauge(&self, name: &'static str) -> Gauge;
  fn averager(&self, name: &'static str) -> Averager;
}

/// A monotonically increasing counter handle.
#[derive(Debug, Clone, Default)]
pub struct Counter(Option<Arc<AtomicU64>>);

impl Counter {
  pub fn inc(&self) {
    self.add(1);
  }

  pub fn add(&self, n: u64) {
    if let Some(cell) = &self.0 {
      cell.fetch_add(n, Ordering::Relaxed);
    }
  }

  pub fn get(&self) -> u64 {
    self.0.as_ref().map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
  }
}

/// A gauge handle for values that go up and down.
#[derive(Debug, Clone, Default)]
pub struct Gauge(Option<Arc<AtomicI64>>);

impl Gauge {
  pub fn set(&self, value: i64) {
    if let Some(cell) = &self.0 {
      cell.store(value, Ordering::Relaxed);
    }
  }

  pub fn add(&self, delta: i64) {
    if let Some(cell) = &self.0 {
      cell.fetch_add(delta, Ordering::Relaxed);
    }
  }

  pub fn get(&self) -> i64 {
    self.0.as_ref().map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
  }
}

#[derive(Debug, Default)]
struct AveragerCell {
  sum: AtomicU64,
  count: AtomicU64,
}

/// A running average over observed samples.
#[derive(Debug, Clone, Default)]
pub struct Averager(Option<Arc<AveragerCell>>);

impl Averager {
  pub fn observe(&self, sample: u64) {
    if let Some(cell) = &self.0 {
      cell.sum.fetch_add(sample, Ordering::Relaxed);
      cell.count.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn count(&self) -> u64 {
    self
      .0
      .as_ref()
      .map(|cell| cell.count.load(Ordering::Relaxed))
      .unwrap_or(0)
  }

  pub fn average(&self) -> f64 {
    let Some(cell) = &self.0 else {
      return 0.0;
    };
    let count = cell.count.load(Ordering::Relaxed);
    if count == 0 {
      return 0.0;
    }
    cell.sum.load(Ordering::Relaxed) as f64 / count as f64
  }
}

/// The default registry: every handle is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsRegistry for NullMetrics {
  fn counter(&self, _name: &'static str) -> Counter {
    Counter(None)
  }

  fn gauge(&self, _name: &'static str) -> Gauge {
    Gauge(None)
  }

  fn averager(&self, _name: &'static str) -> Averager {
    Averager(None)
  }
}

/// An in-process registry backed by atomics. Handles with the same
/// name observe the same cell, which is what tests assert against.
#[derive(Debug, Default)]
pub struct InMemMetrics {
  counters: DashMap<&'static str, Arc<AtomicU64>>,
  gauges: DashMap<&'static str, Arc<AtomicI64>>,
  averagers: DashMap<&'static str, Arc<AveragerCell>>,
}

impl MetricsRegistry for InMemMetrics {
  fn counter(&self, name: &'static str) -> Counter {
    let cell = self
      .counters
      .entry(name)
      .or_insert_with(Default::default)
      .value()
      .clone();
    Counter(Some(cell))
  }

  fn gauge(&self, name: &'static str) -> Gauge {
    let cell = self
      .gauges
      .entry(name)
      .or_insert_with(Default::default)
      .value()
      .clone();
    Gauge(Some(cell))
  }

  fn averager(&self, name: &'static str) -> Averager {
    let cell = self
      .averagers
      .entry(name)
      .or_insert_with(Default::default)
      .value()
      .clone();
    Averager(Some(cell))
  }
}

#[cfg(test)]
mod tests {
  use super::{InMemMetrics, MetricsRegistry, NullMetrics};

  #[test]
  fn null_registry_handles_are_noops() {
    let registry = NullMetrics;
    let counter = registry.counter("polls");
    counter.inc();
    assert_eq!(counter.get(), 0);

    let averager = registry.averager("poll_duration_ms");
    averager.observe(25);
    assert_eq!(averager.count(), 0);
    assert_eq!(averager.average(), 0.0);
  }

  #[test]
  fn in_mem_handles_share_cells_by_name() {
    let registry = InMemMetrics::default();
    let a = registry.counter("accepted");
    let b = registry.counter("accepted");
    a.add(2);
    b.inc();
    assert_eq!(a.get(), 3);

    let gauge = registry.gauge("processing");
    gauge.set(5);
    gauge.add(-2);
    assert_eq!(registry.gauge("processing").get(), 3);
  }

  #[test]
  fn averager_tracks_the_running_mean() {
    let registry = InMemMetrics::default();
    let averager = registry.averager("poll_duration_ms");
    assert_eq!(averager.average(), 0.0);

    averager.observe(10);
    averager.observe(30);
    assert_eq!(registry.averager("poll_duration_ms").count(), 2);
    assert_eq!(registry.averager("poll_duration_ms").average(), 20.0);
  }
}
