use std::time::Duration;

use rand::Rng;

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq)]
/// The delay applied between two attempts of a conflicting operation.
pub enum Backoff {
    /// Retry straight away.
    None,
    /// Wait the same amount of time before every retry.
    Fixed(Duration),
    /// Double (or scale by `factor`) the delay after every retry up to `max`.
    ///
    /// With `jitter` enabled the actual delay is picked uniformly between half
    /// of the computed delay and the full delay.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::None
    }
}

impl Backoff {
    /// An exponential backoff doubling from `initial` up to `max`, with jitter.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial,
            max,
            factor: 2.0,
            jitter: true,
        }
    }

    /// The delay to wait before the given retry, starting at `1` for the first retry.
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
                jitter,
            } => {
                let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
                let scaled = initial.as_secs_f64() * factor.max(1.0).powi(exponent);
                // Anything which does not fit a Duration is past the cap anyway.
                let capped = Duration::try_from_secs_f64(scaled)
                    .map(|delay| delay.min(*max))
                    .unwrap_or(*max);

                if *jitter && !capped.is_zero() {
                    let high = capped.as_nanos();
                    let picked = rand::thread_rng().gen_range(high / 2..=high);
                    Duration::new(
                        (picked / NANOS_PER_SEC) as u64,
                        (picked % NANOS_PER_SEC) as u32,
                    )
                } else {
                    capped
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What to do after an attempt was aborted by a conflicting write.
pub enum RetryDecision {
    /// Try again after waiting the given delay.
    Retry { delay: Duration },
    /// The attempt budget has been spent.
    Exhausted,
    /// The deadline has passed.
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq)]
/// Governs how long an optimistic operation keeps retrying when it conflicts
/// with concurrent writers.
///
/// The default policy retries forever without any delay.
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    deadline: Option<Duration>,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Retry until the operation commits, with no delay between attempts.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            deadline: None,
            backoff: Backoff::None,
        }
    }

    /// Give up as soon as the first attempt conflicts.
    pub fn no_retry() -> Self {
        Self::unbounded().with_max_attempts(1)
    }

    /// Set the maximum number of attempts, including the first one.
    ///
    /// A value of `0` is treated as `1`.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Set how long the operation may keep retrying for, measured from the
    /// start of the first attempt.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the delay applied between attempts.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[inline]
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    #[inline]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    #[inline]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Decides what happens after `attempts` attempts have all conflicted.
    ///
    /// The delay of a retry never extends past the deadline.
    pub fn after_conflict(&self, attempts: u32, elapsed: Duration) -> RetryDecision {
        if let Some(max) = self.max_attempts {
            if attempts >= max {
                return RetryDecision::Exhausted;
            }
        }

        let mut delay = self.backoff.delay_for(attempts);
        if let Some(deadline) = self.deadline {
            if elapsed >= deadline {
                return RetryDecision::DeadlineExceeded;
            }
            delay = delay.min(deadline - elapsed);
        }

        RetryDecision::Retry { delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: MS * 10,
            max: MS * 100,
            factor: 2.0,
            jitter: false,
        };

        assert_eq!(backoff.delay_for(1), MS * 10);
        assert_eq!(backoff.delay_for(2), MS * 20);
        assert_eq!(backoff.delay_for(3), MS * 40);
        assert_eq!(backoff.delay_for(4), MS * 80);
        assert_eq!(backoff.delay_for(5), MS * 100);
        assert_eq!(backoff.delay_for(u32::MAX), MS * 100);
    }

    #[test]
    fn test_exponential_backoff_without_cap() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::MAX,
            factor: 2.0,
            jitter: false,
        };

        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(11), Duration::from_secs(1024));
        assert_eq!(backoff.delay_for(65), Duration::MAX);
        assert_eq!(backoff.delay_for(u32::MAX), Duration::MAX);

        let jittered = Backoff::exponential(Duration::from_secs(1), Duration::MAX);
        assert!(jittered.delay_for(u32::MAX) >= Duration::MAX / 2);
    }

    #[test]
    fn test_exponential_backoff_jitter_bounds() {
        let backoff = Backoff::exponential(MS * 10, MS * 100);

        for retry in 1..10 {
            let delay = backoff.delay_for(retry);
            let full = (MS * 10 * 2u32.pow(retry - 1)).min(MS * 100);
            assert!(delay <= full, "Delay {delay:?} exceeds {full:?} on retry {retry}.");
            assert!(delay >= full / 2, "Delay {delay:?} below half of {full:?} on retry {retry}.");
        }
    }

    #[test]
    fn test_fixed_and_no_backoff() {
        assert_eq!(Backoff::None.delay_for(5), Duration::ZERO);
        assert_eq!(Backoff::Fixed(MS * 3).delay_for(1), MS * 3);
        assert_eq!(Backoff::Fixed(MS * 3).delay_for(50), MS * 3);
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::unbounded().with_max_attempts(3);

        assert_eq!(
            policy.after_conflict(1, Duration::ZERO),
            RetryDecision::Retry { delay: Duration::ZERO },
        );
        assert_eq!(
            policy.after_conflict(2, Duration::ZERO),
            RetryDecision::Retry { delay: Duration::ZERO },
        );
        assert_eq!(policy.after_conflict(3, Duration::ZERO), RetryDecision::Exhausted);

        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.after_conflict(1, Duration::ZERO), RetryDecision::Exhausted);

        let policy = RetryPolicy::unbounded().with_max_attempts(0);
        assert_eq!(policy.max_attempts(), Some(1));
    }

    #[test]
    fn test_deadline_clamps_delay() {
        let policy = RetryPolicy::unbounded()
            .with_deadline(MS * 50)
            .with_backoff(Backoff::Fixed(MS * 30));

        assert_eq!(
            policy.after_conflict(1, MS * 10),
            RetryDecision::Retry { delay: MS * 30 },
        );
        assert_eq!(
            policy.after_conflict(2, MS * 40),
            RetryDecision::Retry { delay: MS * 10 },
        );
        assert_eq!(policy.after_conflict(3, MS * 50), RetryDecision::DeadlineExceeded);
    }

    #[test]
    fn test_unbounded_never_gives_up() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.after_conflict(u32::MAX, Duration::from_secs(3600)),
            RetryDecision::Retry { delay: Duration::ZERO },
        );
    }
}
