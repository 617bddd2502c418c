use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds for sequence numbers.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

impl<F> Clock for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn now_millis(&self) -> i64 {
        self()
    }
}

/// Timestamp-derived sequence numbers.
///
/// Each value is the current time in milliseconds, bumped past the previous
/// value when the clock has not advanced (or went backwards), so two calls
/// never share a sequence. Values are always >= 1; 0 belongs to ping.
pub struct SequenceGenerator {
    clock: Arc<dyn Clock>,
    last: AtomicI64,
}

impl SequenceGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicI64::new(0),
        }
    }

    pub fn next(&self) -> i64 {
        let now = self.clock.now_millis();
        let bump = |prev: i64| now.max(prev.saturating_add(1));
        match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(bump(prev)))
        {
            Ok(prev) | Err(prev) => bump(prev),
        }
    }
}

impl std::fmt::Debug for SequenceGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceGenerator")
            .field("last", &self.last.load(Ordering::SeqCst))
            .finish()
    }
}
