//! How long a failed job waits before it becomes due again.
//!
//! The scheduler turns a [`Strategy`] into an absolute `next_attempt_at`, so a delay keeps
//! counting while the app is suspended or killed. After the n-th failed attempt it asks for
//! `backoff(n - 1)`: the first failure waits for the first step.
//!
//! Unless configured otherwise the scheduler uses [`DEFAULT_BACKOFF`]:
//!
//! | failed attempts | delay |
//! |-----------------|-------|
//! | 1               | 1s    |
//! | 2               | 5s    |
//! | 3               | 15s   |
//! | 4               | 60s   |
//! | 5 and more      | 300s  |
//!
//! Hosts with different needs can pick a constant or exponential schedule, optionally spread
//! out with [`Jitter`] so that a fleet of devices coming back online does not retry in lockstep.
//!
//! ```
//! # use fieldsync::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::minutes(5))
//!     .with_jitter(Jitter::Relative(0.1));
//!
//! let first = strategy.backoff(0);
//! assert!(first >= TimeDelta::milliseconds(1800) && first <= TimeDelta::milliseconds(2200));
//! assert!(strategy.backoff(20) <= TimeDelta::seconds(330));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Maps the zero based index of a retry to the delay before it.
pub trait Strategy {
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

impl<T: Strategy + ?Sized> Strategy for std::sync::Arc<T> {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        T::backoff(self, attempt)
    }
}

/// The schedule applied by the scheduler unless another strategy is configured.
pub const DEFAULT_BACKOFF: BackoffStrategy<Table> = BackoffStrategy::table(&[
    TimeDelta::seconds(1),
    TimeDelta::seconds(5),
    TimeDelta::seconds(15),
    TimeDelta::seconds(60),
    TimeDelta::seconds(300),
]);

/// Steps through a fixed list of delays, repeating the last one once the list runs out.
///
/// Built with [`BackoffStrategy::table`]. An empty table retries immediately.
///
/// ```
/// # use fieldsync::prelude::*;
/// # use chrono::TimeDelta;
/// const STEPS: &[TimeDelta] = &[TimeDelta::seconds(3), TimeDelta::seconds(30)];
/// let strategy = BackoffStrategy::table(STEPS);
///
/// assert_eq!(strategy.backoff(0), TimeDelta::seconds(3));
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(30));
/// assert_eq!(strategy.backoff(9), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    steps: &'static [TimeDelta],
}

impl Strategy for Table {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let last = self.steps.len().saturating_sub(1);
        self.steps
            .get(usize::from(attempt).min(last))
            .copied()
            .unwrap_or(TimeDelta::zero())
    }
}

/// The same delay before every retry. Built with [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _: u16) -> TimeDelta {
        self.delay
    }
}

/// `base * 2^attempt`, saturating at the optional cap. Built with
/// [`BackoffStrategy::exponential`].
///
/// ```
/// # use fieldsync::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
///
/// let delays: Vec<_> = (0..5).map(|attempt| strategy.backoff(attempt).num_seconds()).collect();
/// assert_eq!(delays, [2, 4, 8, 16, 30]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    cap: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let cap = self.cap.unwrap_or(TimeDelta::MAX);
        1_i32
            .checked_shl(u32::from(attempt))
            .filter(|factor| *factor > 0)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(cap, |delay| delay.min(cap))
    }
}

/// Random spread applied on top of a strategy's delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Uniformly within `delay - spread ..= delay + spread`.
    Absolute(TimeDelta),
    /// Uniformly within `delay * (1 - ratio) ..= delay * (1 + ratio)`.
    Relative(f64),
}

impl Jitter {
    fn spread(self, delay: TimeDelta) -> TimeDelta {
        let spread = match self {
            Self::Absolute(spread) => spread.num_milliseconds(),
            Self::Relative(ratio) => (delay.num_milliseconds() as f64 * ratio) as i64,
        }
        .saturating_abs();
        if spread == 0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        delay
            .checked_add(&TimeDelta::milliseconds(offset))
            .unwrap_or(delay)
    }
}

/// A [`Strategy`] with optional [`Jitter`] and a floor. All builders are `const`, so
/// strategies can live in constants like [`DEFAULT_BACKOFF`].
///
/// ```
/// # use fieldsync::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::constant(TimeDelta::seconds(20))
///     .with_jitter(Jitter::Absolute(TimeDelta::seconds(30)))
///     .with_min(TimeDelta::seconds(5));
///
/// for attempt in 0..10 {
///     let delay = strategy.backoff(attempt);
///     assert!(delay >= TimeDelta::seconds(5) && delay <= TimeDelta::seconds(50));
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    inner: T,
    jitter: Option<Jitter>,
    floor: TimeDelta,
}

impl BackoffStrategy<Table> {
    pub const fn table(steps: &'static [TimeDelta]) -> Self {
        Self::new(Table { steps })
    }
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, cap: None })
    }

    /// Caps the delay before jitter is applied.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.inner.cap = Some(max);
        self
    }
}

impl<T: Strategy> BackoffStrategy<T> {
    /// Wraps a custom [`Strategy`].
    pub const fn new(inner: T) -> Self {
        Self {
            inner,
            jitter: None,
            floor: TimeDelta::zero(),
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// No delay, jittered or not, is shorter than `min`.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.floor = min;
        self
    }
}

impl<T: Strategy> Strategy for BackoffStrategy<T> {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let delay = self.inner.backoff(attempt);
        self.jitter
            .map_or(delay, |jitter| jitter.spread(delay))
            .max(self.floor)
    }
}
