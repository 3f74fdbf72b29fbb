//! Reservoir sampling and consolidation functions.
//!
//! [`Reservoir`] is a bounded-memory sample set with uniform replacement,
//! used by the bucket phase of query execution to summarize an unbounded
//! number of raw cells into a fixed-size sample. [`Cf`] wraps a reservoir (or
//! a small running-statistics state, depending on the function) behind the
//! eight consolidation functions the query language exposes.
//!
//! Grounded on bolo's `rsv.c` (reservoir) and `cf.c` (consolidation
//! functions); the numeric test vectors below are taken directly from those
//! files' own test suites.

use rand::Rng;

/// A bounded-capacity sample set with uniform-probability replacement.
///
/// `n` counts every sample ever offered, uncapped; `samples` holds at most
/// `cap` of them. Once full, each new sample replaces a uniformly random
/// existing slot with probability `cap / n`, which is the textbook
/// reservoir-sampling invariant.
#[derive(Debug, Clone)]
pub struct Reservoir {
    cap: usize,
    n: u64,
    samples: Vec<f64>,
}

impl Reservoir {
    /// Creates an empty reservoir with the given capacity.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Reservoir { cap, n: 0, samples: Vec::with_capacity(cap) }
    }

    /// Offers a sample to the reservoir.
    pub fn sample(&mut self, v: f64) {
        if self.samples.len() < self.cap {
            self.samples.push(v);
        } else {
            let j = rand::rng().random_range(0..self.n + 1);
            if (j as usize) < self.cap {
                self.samples[j as usize] = v;
            }
        }
        self.n += 1;
    }

    /// Total number of samples ever offered (not capped by `cap`).
    #[must_use]
    pub fn count(&self) -> u64 {
        self.n
    }

    /// Resets this reservoir to empty, keeping its capacity.
    pub fn reset(&mut self) {
        self.n = 0;
        self.samples.clear();
    }

    /// Smallest stored sample, or `NaN` if empty.
    #[must_use]
    pub fn min(&self) -> f64 {
        self.samples.iter().copied().fold(f64::NAN, |a, b| if a.is_nan() || b < a { b } else { a })
    }

    /// Largest stored sample, or `NaN` if empty.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.samples.iter().copied().fold(f64::NAN, |a, b| if a.is_nan() || b > a { b } else { a })
    }

    /// Sum of stored samples, or `NaN` if empty.
    #[must_use]
    pub fn sum(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.samples.iter().sum()
    }

    /// Arithmetic mean of stored samples, or `NaN` if empty.
    #[must_use]
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.sum() / self.samples.len() as f64
    }

    /// Median of stored samples, or `NaN` if empty.
    #[must_use]
    pub fn median(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 { (sorted[mid - 1] + sorted[mid]) / 2.0 } else { sorted[mid] }
    }
}

/// The eight consolidation functions exposed by the query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CfKind {
    /// Smallest value in the window.
    Min,
    /// Largest value in the window.
    Max,
    /// Sum of values in the window.
    Sum,
    /// Arithmetic mean, computed online via Welford's algorithm.
    Mean,
    /// Sample median (exact reservoir median).
    Median,
    /// Sample standard deviation, computed online via Welford's algorithm.
    Stdev,
    /// Sample variance, computed online via Welford's algorithm.
    Variance,
    /// Last sample minus first sample in the window.
    Delta,
}

/// Running consolidation state for one window (bucket or aggregate).
///
/// For `Min`/`Max`/`Sum` this holds a single running value; for `Delta` it
/// holds the first and last samples seen, plus the carried-over last value
/// of whatever window preceded it; for `Mean`/`Stdev`/`Variance` it holds
/// Welford's `(mean, m2, count)` triple; for `Median` it holds a true
/// reservoir of the configured sample capacity.
#[derive(Debug, Clone)]
pub struct Cf {
    kind: CfKind,
    count: u64,
    mean: f64,
    m2: f64,
    running: f64,
    first: Option<f64>,
    last: f64,
    reservoir: Option<Reservoir>,
    /// Last value seen by the window this instance was `reset()` from.
    carry: f64,
    /// True once this instance has been `reset()` at least once, i.e. it is
    /// not the first window in a running sequence.
    active: bool,
}

impl Cf {
    /// Creates a fresh consolidation function of the given kind. `samples`
    /// is only meaningful for [`CfKind::Median`], which backs onto a
    /// [`Reservoir`] of that capacity.
    #[must_use]
    pub fn new(kind: CfKind, samples: usize) -> Self {
        Cf {
            kind,
            count: 0,
            mean: 0.0,
            m2: 0.0,
            running: match kind {
                CfKind::Min | CfKind::Max => f64::NAN,
                CfKind::Sum => 0.0,
                _ => 0.0,
            },
            first: None,
            last: f64::NAN,
            reservoir: (kind == CfKind::Median).then(|| Reservoir::new(samples.max(1))),
            carry: 0.0,
            active: false,
        }
    }

    /// Offers a sample to this consolidation function.
    pub fn sample(&mut self, v: f64) {
        self.count += 1;
        match self.kind {
            CfKind::Min => {
                self.running = if self.running.is_nan() || v < self.running { v } else { self.running }
            }
            CfKind::Max => {
                self.running = if self.running.is_nan() || v > self.running { v } else { self.running }
            }
            CfKind::Sum => self.running += v,
            CfKind::Delta => {
                if self.first.is_none() {
                    self.first = Some(v);
                }
                self.last = v;
            }
            CfKind::Mean | CfKind::Stdev | CfKind::Variance => {
                // Welford's online algorithm.
                let delta1 = v - self.mean;
                self.mean += delta1 / self.count as f64;
                let delta2 = v - self.mean;
                self.m2 += delta1 * delta2;
            }
            CfKind::Median => {
                self.reservoir.as_mut().expect("median always carries a reservoir").sample(v);
            }
        }
    }

    /// Resets this consolidation function to its initial, empty state for
    /// the next window, carrying this window's last-seen value forward.
    ///
    /// For [`CfKind::Delta`] this is what makes a running delta continuous
    /// across resets: the next window's `first` is seeded from this
    /// window's `last` instead of starting from its own first sample, so a
    /// multi-window DELTA query reports one running total rather than each
    /// window's own last-minus-first.
    pub fn reset(&mut self) {
        let samples = self.reservoir.as_ref().map(|r| r.cap);
        let carry = self.last;
        let kind = self.kind;
        *self = Cf::new(kind, samples.unwrap_or(1));
        self.carry = carry;
        self.active = !carry.is_nan();
        if kind == CfKind::Delta && self.active {
            self.first = Some(carry);
            self.last = carry;
        }
    }

    /// True if this instance carries state from a prior window (i.e. it was
    /// produced by [`Cf::reset`], not [`Cf::new`]).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The last value seen by the window this instance was reset from, or
    /// `0.0` if it has never been reset.
    #[must_use]
    pub fn carry(&self) -> f64 {
        self.carry
    }

    /// Total number of samples offered to this window, uncapped by any
    /// reservoir capacity.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Computes the consolidated value for everything sampled so far.
    ///
    /// Returns `NaN` for empty `Min`/`Max`/`Sum`/`Mean`/`Stdev`/`Variance`/
    /// `Median` windows, and `0.0` for an empty `Delta` window.
    #[must_use]
    pub fn value(&self) -> f64 {
        match self.kind {
            CfKind::Min | CfKind::Max => self.running,
            CfKind::Sum => {
                if self.count == 0 {
                    f64::NAN
                } else {
                    self.running
                }
            }
            CfKind::Delta => match self.first {
                Some(first) => self.last - first,
                None => 0.0,
            },
            CfKind::Mean => {
                if self.count == 0 {
                    f64::NAN
                } else {
                    self.mean
                }
            }
            CfKind::Variance => {
                if self.count > 1 {
                    self.m2 / (self.count - 1) as f64
                } else {
                    f64::NAN
                }
            }
            CfKind::Stdev => {
                if self.count > 1 {
                    (self.m2 / (self.count - 1) as f64).sqrt()
                } else {
                    f64::NAN
                }
            }
            CfKind::Median => self.reservoir.as_ref().expect("median carries a reservoir").median(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_median_under_capacity() {
        let mut r = Reservoir::new(5);
        for v in [0.0, 1.0, 2.0, 3.0, 4.0] {
            r.sample(v);
        }
        assert_eq!(r.median(), 2.0);

        let mut r = Reservoir::new(5);
        for v in [0.0, 1.0, 2.0, 3.0] {
            r.sample(v);
        }
        assert_eq!(r.median(), 1.5);
    }

    #[test]
    fn reservoir_summaries_on_empty() {
        let r = Reservoir::new(5);
        assert!(r.min().is_nan());
        assert!(r.max().is_nan());
        assert!(r.sum().is_nan());
        assert!(r.average().is_nan());
        assert!(r.median().is_nan());
    }

    #[test]
    fn cf_stdev_matches_reference() {
        let mut cf = Cf::new(CfKind::Stdev, 0);
        for v in [10.0, 2.0, 38.0, 23.0, 38.0, 23.0, 21.0] {
            cf.sample(v);
        }
        assert!((cf.value() - 13.2844).abs() < 1e-3);
    }

    #[test]
    fn cf_delta_empty_is_zero() {
        let cf = Cf::new(CfKind::Delta, 0);
        assert_eq!(cf.value(), 0.0);
    }

    #[test]
    fn cf_delta_is_last_minus_first() {
        let mut cf = Cf::new(CfKind::Delta, 0);
        for v in [5.0, 9.0, 1.0, 12.0] {
            cf.sample(v);
        }
        assert_eq!(cf.value(), 12.0 - 5.0);
    }

    #[test]
    fn cf_delta_carries_across_resets() {
        let mut cf = Cf::new(CfKind::Delta, 0);
        assert!(!cf.is_active());
        cf.sample(5.0);
        cf.sample(9.0);
        assert_eq!(cf.value(), 9.0 - 5.0);

        cf.reset();
        assert!(cf.is_active());
        assert_eq!(cf.carry(), 9.0);
        // No samples this window yet: the running delta is against the
        // carried-over last value, not zero.
        assert_eq!(cf.value(), 0.0);

        cf.sample(15.0);
        assert_eq!(cf.value(), 15.0 - 9.0);
    }

    #[test]
    fn cf_delta_reset_of_empty_window_does_not_seed_next() {
        let mut cf = Cf::new(CfKind::Delta, 0);
        cf.reset();
        assert!(!cf.is_active());
        cf.sample(3.0);
        assert_eq!(cf.value(), 0.0);
    }

    #[test]
    fn cf_min_max_sum_empty_are_nan() {
        assert!(Cf::new(CfKind::Min, 0).value().is_nan());
        assert!(Cf::new(CfKind::Max, 0).value().is_nan());
        assert!(Cf::new(CfKind::Sum, 0).value().is_nan());
        assert!(Cf::new(CfKind::Mean, 0).value().is_nan());
    }

    #[test]
    fn cf_variance_needs_two_samples() {
        let mut cf = Cf::new(CfKind::Variance, 0);
        cf.sample(1.0);
        assert!(cf.value().is_nan());
        cf.sample(3.0);
        assert!(cf.value().is_finite());
    }
}
