// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

// imports for docs
#[allow(unused)]
use crate::config::PoolOptions;

/// Abstraction over blocking the current thread.
///
/// The pool never calls [`std::thread::sleep()`] directly, so that tests (or applications with
/// special needs) can observe or skip backoff pauses.
/// See [`PoolOptions::with_sleeper()`].
pub trait Sleeper: Debug + Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] that actually blocks the thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    #[inline]
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// Backoff used for dialing sessions while initializing the pool.
///
/// After the `n`-th failed attempt, the pool waits `n * step` before trying again.
/// After [`LinearBackoff::max_attempts()`] failures, the pool gives up on the session.
///
/// Defaults: 3 attempts with a step of 1 second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    step: Duration,
    max_attempts: usize,
}

impl Default for LinearBackoff {
    #[inline]
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

impl LinearBackoff {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_step(self, step: Duration) -> Self {
        Self { step, ..self }
    }

    /// Values below 1 are treated as 1.
    #[inline]
    pub fn with_max_attempts(self, max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    #[inline]
    pub fn step(&self) -> Duration {
        self.step
    }

    #[inline]
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Pause after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        self.step
            .saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX))
    }

    /// Run `work` until it succeeds or the attempts are exhausted.
    ///
    /// `work` receives the 1-based attempt number.
    /// `on_error` is invoked for every failure before pausing.
    /// Returns the last error when giving up.
    pub(crate) fn run<T, E>(
        &self,
        sleeper: &dyn Sleeper,
        mut work: impl FnMut(usize) -> Result<T, E>,
        mut on_error: impl FnMut(usize, &E),
    ) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            match work(attempt) {
                Ok(t) => return Ok(t),
                Err(err) => {
                    on_error(attempt, &err);
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    sleeper.sleep(self.delay(attempt));
                    attempt += 1;
                }
            }
        }
    }
}

/// Backoff used by the reconnect worker.
///
/// Exponential backoff means that the time between attempts increases exponentially.
/// For example:
///  * dial fails → wait 1 second
///  * dial fails → wait 2 seconds
///  * dial fails → wait 4 seconds
///  * ...
///
/// Each pause is capped at [`ExponentialBackoff::with_max_delay()`] and randomized by a jitter
/// factor of `(1 - jitter..=1 + jitter)`.
///
/// Defaults: start with 1 second, factor 2, cap at 30 seconds, jitter 0.2, retry forever.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: Option<usize>,
}

impl Default for ExponentialBackoff {
    #[inline]
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    #[inline]
    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    /// # Panics
    /// If `factor < 1.0`.
    #[inline]
    pub fn with_factor(self, factor: f64) -> Self {
        assert!(factor >= 1.0, "backoff factor must be >= 1.0");
        Self { factor, ..self }
    }

    /// # Panics
    /// If `jitter` is not in `0.0..1.0`.
    #[inline]
    pub fn with_jitter(self, jitter: f64) -> Self {
        assert!((0.0..1.0).contains(&jitter), "jitter must be in [0.0, 1.0)");
        Self { jitter, ..self }
    }

    /// Give up after `max_attempts` failed attempts.
    ///
    /// `None` (the default) retries until the pool is closed.
    #[inline]
    pub fn with_max_attempts(self, max_attempts: Option<usize>) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    #[inline]
    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    #[inline]
    pub fn allows_retry_after(&self, attempt: usize) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Pause after the `attempt`-th failure (1-based), before jitter is applied.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(delay)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    pub(crate) fn delay(&self, attempt: usize, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let jitter_factor = 1.0 + rng.random_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * jitter_factor).unwrap_or(base)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::*;

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) pauses: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn pauses(&self) -> Vec<Duration> {
            self.pauses.lock().clone()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.pauses.lock().push(duration);
        }
    }

    #[rstest]
    fn test_linear_delays() {
        let backoff = LinearBackoff::new().with_step(Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(30));
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(5, 5)]
    fn test_linear_max_attempts(#[case] configured: usize, #[case] effective: usize) {
        assert_eq!(
            LinearBackoff::new()
                .with_max_attempts(configured)
                .max_attempts(),
            effective
        );
    }

    #[rstest]
    fn test_linear_run_gives_up() {
        let sleeper = RecordingSleeper::new();
        let backoff = LinearBackoff::new()
            .with_step(Duration::from_secs(1))
            .with_max_attempts(3);
        let mut seen = Vec::new();
        let res: Result<(), usize> =
            backoff.run(&*sleeper, Err, |attempt, _| seen.push(attempt));
        assert_eq!(res, Err(3));
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(
            sleeper.pauses(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[rstest]
    fn test_linear_run_succeeds_eventually() {
        let sleeper = RecordingSleeper::new();
        let backoff = LinearBackoff::new().with_max_attempts(5);
        let res: Result<usize, ()> = backoff.run(
            &*sleeper,
            |attempt| if attempt == 2 { Ok(attempt) } else { Err(()) },
            |_, _| {},
        );
        assert_eq!(res, Ok(2));
        assert_eq!(sleeper.pauses().len(), 1);
    }

    #[rstest]
    fn test_exponential_base_delays() {
        let backoff = ExponentialBackoff::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));
        let delays: Vec<_> = (1..=5).map(|a| backoff.base_delay(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[rstest]
    fn test_exponential_jitter_bounds() {
        let backoff = ExponentialBackoff::new().with_jitter(0.2);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..10 {
            let base = backoff.base_delay(attempt).as_secs_f64();
            let delay = backoff.delay(attempt, &mut rng).as_secs_f64();
            assert!(delay >= base * 0.8 - 1e-9, "{delay} < {base} * 0.8");
            assert!(delay <= base * 1.2 + 1e-9, "{delay} > {base} * 1.2");
        }
    }

    #[rstest]
    #[case(None, 1_000_000, true)]
    #[case(Some(3), 2, true)]
    #[case(Some(3), 3, false)]
    fn test_exponential_allows_retry(
        #[case] max_attempts: Option<usize>,
        #[case] attempt: usize,
        #[case] expected: bool,
    ) {
        let backoff = ExponentialBackoff::new().with_max_attempts(max_attempts);
        assert_eq!(backoff.allows_retry_after(attempt), expected);
    }
}
