//! Reconnect backoff.
//!
//! Uses `backon` with a constant delay: the supervisor waits the same
//! interval between every dial attempt and gives up once the builder's
//! iterator is exhausted.

use std::time::Duration;

use backon::ConstantBuilder;

/// Backoff for supervisor dial retries.
///
/// - Delay: `delay` between attempts
/// - Max attempts: `max_reconnects` retries after the first dial, unbounded when 0
/// - No jitter
pub fn reconnect_backoff(delay: Duration, max_reconnects: u32) -> ConstantBuilder {
    let max_times = match max_reconnects {
        0 => usize::MAX,
        n => n as usize,
    };

    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(max_times)
}
