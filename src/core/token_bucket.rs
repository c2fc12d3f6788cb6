//! Token bucket used by the rate-limit middleware.
//!
//! A bucket starts full and refills `quantum` tokens every `fill_interval`.
//! Refill is computed lazily: each operation first advances the bucket to the
//! current tick (`(now - start) / fill_interval`), then evaluates the
//! request. `available` may go negative through `take`, which reserves
//! not-yet-existing tokens and tells the caller how long to wait for them.
//!
//! The clock is injectable so tests can drive time manually.
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Allowed deviation between a requested rate and the realized rate (1%).
const RATE_MARGIN: f64 = 0.01;

const NANOS_PER_SEC: f64 = 1e9;

/// Time source for a bucket. `sleep` blocks the calling thread; the request
/// path only ever uses the non-blocking operations.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);
}

/// System clock backed by `Instant::now` / `thread::sleep`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

struct BucketState {
    /// Tokens usable right now; negative while takers wait for refills.
    available_tokens: i64,
    /// Tick the bucket was last advanced to.
    latest_tick: i64,
}

/// Token bucket with lazily computed refills and an injectable clock.
pub struct TokenBucket {
    clock: Arc<dyn Clock>,
    start_time: Instant,
    capacity: i64,
    quantum: i64,
    fill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket refilling one token every `fill_interval`, holding at most
    /// `capacity`. Starts full.
    ///
    /// # Panics
    /// Panics when `fill_interval` is zero or `capacity` is not positive.
    pub fn new(fill_interval: Duration, capacity: i64) -> Self {
        Self::with_quantum_and_clock(fill_interval, capacity, 1, Arc::new(SystemClock))
    }

    /// Like [`TokenBucket::new`] but refilling `quantum` tokens per interval.
    pub fn with_quantum(fill_interval: Duration, capacity: i64, quantum: i64) -> Self {
        Self::with_quantum_and_clock(fill_interval, capacity, quantum, Arc::new(SystemClock))
    }

    /// Bucket refilling at `rate` tokens per second. Clock resolution limits
    /// how exactly an arbitrary rate can be realized; the constructor
    /// searches quantum values until the realized rate is within 1% of the
    /// request.
    ///
    /// # Panics
    /// Panics when `rate` or `capacity` is not positive, or when no suitable
    /// quantum exists.
    pub fn with_rate(rate: f64, capacity: i64) -> Self {
        Self::with_rate_and_clock(rate, capacity, Arc::new(SystemClock))
    }

    pub fn with_rate_and_clock(rate: f64, capacity: i64, clock: Arc<dyn Clock>) -> Self {
        assert!(rate > 0.0, "token bucket rate must be positive");

        let mut bucket = Self::with_quantum_and_clock(Duration::from_nanos(1), capacity, 1, clock);

        let mut quantum: i64 = 1;
        while quantum < 1 << 50 {
            let fill_nanos = NANOS_PER_SEC * quantum as f64 / rate;
            if fill_nanos >= 1.0 {
                bucket.fill_interval = Duration::from_nanos(fill_nanos as u64);
                bucket.quantum = quantum;
                let diff = (bucket.rate() - rate).abs();
                if diff / rate <= RATE_MARGIN {
                    return bucket;
                }
            }
            quantum = next_quantum(quantum);
        }

        panic!("cannot find a suitable quantum for rate {rate}");
    }

    pub fn with_quantum_and_clock(
        fill_interval: Duration,
        capacity: i64,
        quantum: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        assert!(
            !fill_interval.is_zero(),
            "token bucket fill interval must be positive"
        );
        assert!(capacity > 0, "token bucket capacity must be positive");
        assert!(quantum > 0, "token bucket quantum must be positive");

        let start_time = clock.now();
        Self {
            clock,
            start_time,
            capacity,
            quantum,
            fill_interval,
            state: Mutex::new(BucketState {
                available_tokens: capacity,
                latest_tick: 0,
            }),
        }
    }

    /// Non-blocking: consume up to `count` tokens, returning how many were
    /// actually granted (possibly zero).
    pub fn take_available(&self, count: i64) -> i64 {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("token bucket lock");
        self.take_available_at(&mut state, now, count)
    }

    /// Reserve `count` tokens and return how long the caller must wait until
    /// they exist. Never refuses.
    pub fn take(&self, count: i64) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("token bucket lock");
        let (wait, _) = self.take_at(&mut state, now, count, Duration::MAX);
        wait
    }

    /// Reserve `count` tokens unless the required wait would exceed
    /// `max_wait`, in which case nothing is consumed and `ok` is false.
    pub fn take_max_duration(&self, count: i64, max_wait: Duration) -> (Duration, bool) {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("token bucket lock");
        self.take_at(&mut state, now, count, max_wait)
    }

    /// Block the calling thread until `count` tokens have been consumed.
    pub fn wait(&self, count: i64) {
        let wait = self.take(count);
        if !wait.is_zero() {
            self.clock.sleep(wait);
        }
    }

    /// Like [`TokenBucket::wait`] but gives up (consuming nothing) when the
    /// wait would exceed `max_wait`.
    pub fn wait_max_duration(&self, count: i64, max_wait: Duration) -> bool {
        let (wait, ok) = self.take_max_duration(count, max_wait);
        if !wait.is_zero() {
            self.clock.sleep(wait);
        }
        ok
    }

    /// Tokens usable right now (negative while takers wait for refills).
    pub fn available(&self) -> i64 {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("token bucket lock");
        self.adjust_available_tokens(&mut state, self.current_tick(now));
        state.available_tokens
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Realized refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        NANOS_PER_SEC * self.quantum as f64 / self.fill_interval.as_nanos() as f64
    }

    fn current_tick(&self, now: Instant) -> i64 {
        let elapsed = now.saturating_duration_since(self.start_time);
        (elapsed.as_nanos() / self.fill_interval.as_nanos()) as i64
    }

    fn adjust_available_tokens(&self, state: &mut BucketState, tick: i64) {
        let last_tick = state.latest_tick;
        state.latest_tick = tick;

        if state.available_tokens >= self.capacity {
            return;
        }
        state.available_tokens += (tick - last_tick) * self.quantum;
        if state.available_tokens > self.capacity {
            state.available_tokens = self.capacity;
        }
    }

    fn take_at(
        &self,
        state: &mut BucketState,
        now: Instant,
        count: i64,
        max_wait: Duration,
    ) -> (Duration, bool) {
        if count <= 0 {
            return (Duration::ZERO, true);
        }

        let tick = self.current_tick(now);
        self.adjust_available_tokens(state, tick);

        let remaining = state.available_tokens - count;
        if remaining >= 0 {
            state.available_tokens = remaining;
            return (Duration::ZERO, true);
        }

        // Wait until the tick where the deficit has been refilled.
        let end_tick = tick + (-remaining + self.quantum - 1) / self.quantum;
        let end_time = self.start_time
            + self
                .fill_interval
                .saturating_mul(u32::try_from(end_tick).unwrap_or(u32::MAX));
        let wait = end_time.saturating_duration_since(now);
        if wait > max_wait {
            return (Duration::ZERO, false);
        }

        state.available_tokens = remaining;
        (wait, true)
    }

    fn take_available_at(&self, state: &mut BucketState, now: Instant, count: i64) -> i64 {
        if count <= 0 {
            return 0;
        }

        self.adjust_available_tokens(state, self.current_tick(now));
        if state.available_tokens <= 0 {
            return 0;
        }

        let granted = count.min(state.available_tokens);
        state.available_tokens -= granted;
        granted
    }
}

/// Smallest integer strictly greater than `q` along a ~1.1x growth curve, so
/// the rate search terminates quickly without skipping small quanta.
fn next_quantum(q: i64) -> i64 {
    let q1 = q * 11 / 10;
    if q1 == q { q1 + 1 } else { q1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Manually advanced clock for deterministic bucket tests.
    struct MockClock {
        start: Instant,
        offset: Mutex<Duration>,
    }

    impl MockClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, d: Duration) {
            *self.offset.lock().unwrap() += d;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            self.start + *self.offset.lock().unwrap()
        }

        fn sleep(&self, d: Duration) {
            self.advance(d);
        }
    }

    #[test]
    fn starts_full_and_drains() {
        let clock = MockClock::new();
        let bucket =
            TokenBucket::with_quantum_and_clock(Duration::from_millis(10), 5, 1, clock.clone());

        assert_eq!(bucket.available(), 5);
        assert_eq!(bucket.take_available(3), 3);
        assert_eq!(bucket.take_available(3), 2);
        assert_eq!(bucket.take_available(1), 0);
    }

    #[test]
    fn refills_by_quantum_per_interval() {
        let clock = MockClock::new();
        let bucket =
            TokenBucket::with_quantum_and_clock(Duration::from_millis(10), 10, 2, clock.clone());

        assert_eq!(bucket.take_available(10), 10);
        clock.advance(Duration::from_millis(10));
        assert_eq!(bucket.available(), 2);
        clock.advance(Duration::from_millis(35));
        // Three more intervals elapsed, capped well below capacity.
        assert_eq!(bucket.available(), 8);
    }

    #[test]
    fn refill_caps_at_capacity() {
        let clock = MockClock::new();
        let bucket =
            TokenBucket::with_quantum_and_clock(Duration::from_millis(1), 4, 1, clock.clone());

        assert_eq!(bucket.take_available(4), 4);
        clock.advance(Duration::from_secs(60));
        assert_eq!(bucket.available(), 4);
    }

    #[test]
    fn take_reports_wait_for_missing_tokens() {
        let clock = MockClock::new();
        let bucket =
            TokenBucket::with_quantum_and_clock(Duration::from_millis(10), 2, 1, clock.clone());

        assert_eq!(bucket.take(2), Duration::ZERO);
        // Two tokens short: two fill intervals away.
        assert_eq!(bucket.take(2), Duration::from_millis(20));
        // The previous take already reserved future tokens.
        assert_eq!(bucket.take(1), Duration::from_millis(30));
    }

    #[test]
    fn take_max_duration_zero_wait_matches_available() {
        let clock = MockClock::new();
        let bucket =
            TokenBucket::with_quantum_and_clock(Duration::from_millis(10), 3, 1, clock.clone());

        let (wait, ok) = bucket.take_max_duration(3, Duration::ZERO);
        assert!(ok);
        assert_eq!(wait, Duration::ZERO);

        // Nothing left: a zero-wait take must refuse and consume nothing.
        let (_, ok) = bucket.take_max_duration(1, Duration::ZERO);
        assert!(!ok);
        assert_eq!(bucket.available(), 0);

        clock.advance(Duration::from_millis(10));
        let (_, ok) = bucket.take_max_duration(1, Duration::ZERO);
        assert!(ok);
    }

    #[test]
    fn refused_take_leaves_tokens_untouched() {
        let clock = MockClock::new();
        let bucket =
            TokenBucket::with_quantum_and_clock(Duration::from_millis(10), 2, 1, clock.clone());

        assert_eq!(bucket.take_available(2), 2);
        let (_, ok) = bucket.take_max_duration(5, Duration::from_millis(10));
        assert!(!ok);
        clock.advance(Duration::from_millis(10));
        assert_eq!(bucket.available(), 1);
    }

    #[test]
    fn rate_constructor_stays_within_margin() {
        for rate in [1.0, 2.5, 100.0, 1013.0] {
            let clock = MockClock::new();
            let bucket = TokenBucket::with_rate_and_clock(rate, 10, clock);
            let realized = bucket.rate();
            assert!(
                (realized - rate).abs() / rate <= RATE_MARGIN,
                "rate {rate} realized as {realized}"
            );
        }
    }

    #[test]
    fn grant_count_bounded_over_window() {
        // Over any window W, grants never exceed capacity + ceil(W / interval) * quantum.
        let clock = MockClock::new();
        let interval = Duration::from_millis(10);
        let bucket = TokenBucket::with_quantum_and_clock(interval, 4, 1, clock.clone());

        let mut granted = 0;
        let steps = 50u32;
        for _ in 0..steps {
            granted += bucket.take_available(2);
            clock.advance(Duration::from_millis(2));
        }
        let window = Duration::from_millis(2) * steps;
        let max = 4 + window.as_millis().div_ceil(interval.as_millis()) as i64;
        assert!(granted <= max, "granted {granted} > bound {max}");
    }

    #[test]
    #[should_panic(expected = "fill interval must be positive")]
    fn zero_fill_interval_panics() {
        let _ = TokenBucket::new(Duration::ZERO, 1);
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_panics() {
        let _ = TokenBucket::new(Duration::from_millis(1), 0);
    }

    #[test]
    #[should_panic(expected = "quantum must be positive")]
    fn zero_quantum_panics() {
        let _ = TokenBucket::with_quantum(Duration::from_millis(1), 1, 0);
    }
}
