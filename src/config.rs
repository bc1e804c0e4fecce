use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`QueryClient`](crate::client::QueryClient) and the
/// observers built on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a computed request fingerprint is memoized per request instance.
    ///
    /// This only saves recomputation within a burst of lookups; it never changes
    /// the fingerprint value.
    #[serde(with = "duration_millis")]
    pub fingerprint_ttl: Duration,

    /// Whether superseded in-flight queries are asked to abort.
    ///
    /// Some store backends handle repeated aborts badly. Turning this off leaves
    /// superseded fetches running; their results are still discarded by the
    /// query state machine.
    pub cancellation_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fingerprint_ttl: Duration::from_secs(2),
            cancellation_enabled: true,
        }
    }
}

impl ClientConfig {
    /// Creates a new client configuration.
    #[must_use]
    pub const fn new(fingerprint_ttl: Duration, cancellation_enabled: bool) -> Self {
        Self {
            fingerprint_ttl,
            cancellation_enabled,
        }
    }

    #[must_use]
    pub const fn with_fingerprint_ttl(mut self, fingerprint_ttl: Duration) -> Self {
        self.fingerprint_ttl = fingerprint_ttl;
        self
    }

    #[must_use]
    pub const fn with_cancellation(mut self, cancellation_enabled: bool) -> Self {
        self.cancellation_enabled = cancellation_enabled;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
