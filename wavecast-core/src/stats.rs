//! Fire-and-forget statistics publication.

use tracing::debug;

/// Sink for stat updates. Implementations must not block; the serving and
/// auth paths call this with locks held.
#[cfg_attr(test, mockall::automock)]
pub trait StatsSink: Send + Sync {
    /// Set a named value, server-wide (`scope` None) or per handle.
    fn set<'a>(&self, scope: Option<&'a str>, name: &'a str, value: &'a str);

    fn increment<'a>(&self, scope: Option<&'a str>, name: &'a str, delta: i64);

    /// Withdraw one stat, or the whole scope when `name` is None.
    fn remove<'a>(&self, scope: Option<&'a str>, name: Option<&'a str>);
}

/// Default sink: emits stats as debug-level trace events.
#[derive(Debug, Default)]
pub struct TracingStats;

impl StatsSink for TracingStats {
    fn set(&self, scope: Option<&str>, name: &str, value: &str) {
        debug!(scope = scope.unwrap_or("global"), "{name} = {value}");
    }

    fn increment(&self, scope: Option<&str>, name: &str, delta: i64) {
        debug!(scope = scope.unwrap_or("global"), "{name} += {delta}");
    }

    fn remove(&self, scope: Option<&str>, name: Option<&str>) {
        debug!(
            scope = scope.unwrap_or("global"),
            "removed {}",
            name.unwrap_or("*")
        );
    }
}
