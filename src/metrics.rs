use tracing::trace;

// Lightweight metrics helpers emitted as trace events.
// These intentionally avoid the metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "stocksync.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn sync_elapsed(portal: &'static str, elapsed_ms: u128) {
    trace!(
        target = "stocksync.metrics",
        portal = portal,
        elapsed_ms = elapsed_ms as u64,
        "sync_elapsed"
    );
}
