use std::time::{SystemTime, UNIX_EPOCH};

/// Source of capture timestamps for received datagrams.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Nanoseconds since the Unix epoch, or `None` if the realtime clock is unavailable.
    fn realtime_nanos(&self) -> Option<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn realtime_nanos(&self) -> Option<u64> {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        u64::try_from(since_epoch.as_nanos()).ok()
    }
}
