//! Retry timing shared by every fetcher.
//!
//! One [`BackoffPolicy`] type covers all the retry loops in the crate; the presets
//! carry each component's constants. [`Pacing`] covers the delays that are not
//! retries: start-up stagger and the courtesy pause between successful pages.

use std::time::Duration;

use rand::Rng;

/// How the deterministic part of the delay grows with the retry number `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// `base · 2^n`
    Doubling,
    /// `base + step · 2^n`
    Additive { step: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Uniform jitter range, multiplied by the worker id.
    pub jitter: Option<(Duration, Duration)>,
    pub growth: Growth,
}

impl BackoffPolicy {
    /// Rate-limit backoff for offset pager workers.
    pub fn offset_pager() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            max_retries: 5,
            jitter: Some((Duration::from_millis(100), Duration::from_millis(500))),
            growth: Growth::Doubling,
        }
    }

    /// Inner per-page retry of the gated market fetcher. Slept while holding the gate.
    pub fn market_page() -> Self {
        Self {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(30),
            max_retries: 3,
            jitter: None,
            growth: Growth::Additive {
                step: Duration::from_secs(1),
            },
        }
    }

    pub fn pnl_batch() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            max_retries: 5,
            jitter: None,
            growth: Growth::Doubling,
        }
    }

    /// Single-id backfill: flat sleep-and-retry.
    pub fn backfill() -> Self {
        Self::fixed(Duration::from_secs(2), 10)
    }

    pub fn price_history() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_retries: 3,
            jitter: Some((Duration::from_millis(50), Duration::from_millis(250))),
            growth: Growth::Doubling,
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            base: delay,
            cap: delay,
            max_retries,
            jitter: None,
            growth: Growth::Doubling,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = None;
        self
    }

    /// Whether another attempt is allowed after `retries` retries have already happened.
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Deterministic part of the delay, already capped.
    pub fn exponential(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry);
        let raw = match (self.growth, factor) {
            (_, None) => self.cap,
            (Growth::Doubling, Some(f)) => self.base.saturating_mul(f),
            (Growth::Additive { step }, Some(f)) => self.base.saturating_add(step.saturating_mul(f)),
        };
        raw.min(self.cap)
    }

    /// Largest jitter a worker can draw.
    pub fn max_jitter(&self, worker_id: usize) -> Duration {
        match self.jitter {
            Some((_, max)) => max.saturating_mul(worker_scale(worker_id)),
            None => Duration::ZERO,
        }
    }

    /// Full delay before retry number `retry`: `exponential(retry) + jitter · worker_id`.
    pub fn delay(&self, retry: u32, worker_id: usize) -> Duration {
        let jitter = match self.jitter {
            Some((min, max)) => uniform(min, max).saturating_mul(worker_scale(worker_id)),
            None => Duration::ZERO,
        };
        self.exponential(retry).saturating_add(jitter)
    }
}

/// Non-retry delays of an offset pager worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pacing {
    /// Start-up delay range, multiplied by the worker id.
    pub stagger: Option<(Duration, Duration)>,
    pub page_delay: Duration,
    /// Added to `page_delay` once per worker id.
    pub per_worker: Duration,
    /// Symmetric jitter around the courtesy delay.
    pub spread: Duration,
    pub floor: Duration,
}

impl Pacing {
    pub fn offset_pager() -> Self {
        Self {
            stagger: Some((Duration::from_millis(100), Duration::from_millis(500))),
            page_delay: Duration::from_millis(300),
            per_worker: Duration::from_millis(100),
            spread: Duration::from_millis(100),
            floor: Duration::from_millis(100),
        }
    }

    /// No stagger, no courtesy delay.
    pub fn none() -> Self {
        Self {
            stagger: None,
            page_delay: Duration::ZERO,
            per_worker: Duration::ZERO,
            spread: Duration::ZERO,
            floor: Duration::ZERO,
        }
    }

    pub fn initial_stagger(&self, worker_id: usize) -> Duration {
        match self.stagger {
            Some((min, max)) => uniform(min, max).saturating_mul(worker_scale(worker_id)),
            None => Duration::ZERO,
        }
    }

    /// `max(floor, page_delay + per_worker · id ± spread)`
    pub fn between_pages(&self, worker_id: usize) -> Duration {
        let centre = self
            .page_delay
            .saturating_add(self.per_worker.saturating_mul(worker_id as u32))
            .as_secs_f64();
        let spread = self.spread.as_secs_f64();
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((centre + offset).max(0.0)).max(self.floor)
    }
}

/// Sleep unless the duration is zero.
pub async fn pause(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}

fn worker_scale(worker_id: usize) -> u32 {
    worker_id.clamp(1, u32::MAX as usize) as u32
}

fn uniform(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let secs = rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_delays_are_non_decreasing_up_to_cap() {
        let policy = BackoffPolicy::offset_pager().without_jitter();
        let delays: Vec<Duration> = (0..10).map(|r| policy.delay(r, 1)).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[4], Duration::from_secs(32));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= policy.cap));
        assert_eq!(delays[9], policy.cap);
    }

    #[test]
    fn capped_delay_stays_within_jitter_band() {
        let policy = BackoffPolicy::offset_pager();
        for worker in 1..=5 {
            let max_jitter = policy.max_jitter(worker);
            for _ in 0..50 {
                let d = policy.delay(12, worker);
                assert!(d >= policy.cap, "worker {worker}: {d:?} below cap");
                assert!(d <= policy.cap + max_jitter, "worker {worker}: {d:?} above band");
            }
        }
    }

    #[test]
    fn jitter_scales_with_worker_id() {
        let policy = BackoffPolicy::offset_pager();
        assert_eq!(policy.max_jitter(1), Duration::from_millis(500));
        assert_eq!(policy.max_jitter(4), Duration::from_millis(2000));
        // worker id 0 is treated like worker 1
        assert_eq!(policy.max_jitter(0), Duration::from_millis(500));
    }

    #[test]
    fn additive_growth_matches_market_page_schedule() {
        let policy = BackoffPolicy::market_page();
        let secs: Vec<u64> = (0..6).map(|r| policy.exponential(r).as_secs()).collect();
        assert_eq!(secs, vec![11, 12, 14, 18, 26, 30]);
    }

    #[test]
    fn huge_retry_numbers_saturate_to_cap() {
        let policy = BackoffPolicy::pnl_batch();
        assert_eq!(policy.exponential(40), policy.cap);
        assert_eq!(policy.exponential(u32::MAX), policy.cap);
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(20), 2);
        assert_eq!(policy.delay(0, 3), Duration::from_millis(20));
        assert_eq!(policy.delay(7, 3), Duration::from_millis(20));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }

    #[test]
    fn courtesy_delay_respects_floor_and_worker_stagger() {
        let pacing = Pacing::offset_pager();
        for _ in 0..50 {
            let first = pacing.between_pages(1);
            assert!(first >= Duration::from_millis(300) && first <= Duration::from_millis(500));
            let tenth = pacing.between_pages(10);
            assert!(tenth >= Duration::from_millis(1200) && tenth <= Duration::from_millis(1400));
        }
        let tight = Pacing {
            page_delay: Duration::ZERO,
            ..Pacing::offset_pager()
        };
        assert!(tight.between_pages(0) >= tight.floor);
    }

    #[test]
    fn disabled_pacing_never_waits() {
        let pacing = Pacing::none();
        assert_eq!(pacing.initial_stagger(7), Duration::ZERO);
        assert_eq!(pacing.between_pages(7), Duration::ZERO);
    }
}
