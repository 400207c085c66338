//! Convenience macros for timing runtime operations.

/// Execute a block of code with automatic timing.
///
/// Returns a tuple of `(result, duration_in_microseconds)` and emits a
/// debug-level event carrying the operation name and duration.
///
/// # Example
///
/// ```rust
/// use offload_tracing::timed_block;
///
/// let (sum, duration_us) = timed_block!("sum_calculation", {
///     (1..=100).sum::<i32>()
/// });
/// assert_eq!(sum, 5050);
/// # let _ = duration_us;
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}

/// Emit a lifecycle event for a runtime object at debug level.
///
/// ```text
/// lifecycle_event!("async_context", from = "Active", to = "Draining")
/// ```
#[macro_export]
macro_rules! lifecycle_event {
    ($object:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::debug!(
            object = $object,
            $($field = $value),+
        );
    };
}
