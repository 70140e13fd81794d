use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Effective limits for one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSpec {
    pub window: Duration,
    pub max_requests: u64,
    pub max_units: u64,
}

/// Outcome of a quota check. Exhaustion is a normal value, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub requests_remaining: u64,
    pub units_remaining: u64,
    pub reset_time: DateTime<Utc>,
    /// Set when `allowed` is false.
    #[serde(with = "opt_millis", default)]
    pub retry_after: Option<Duration>,
    /// True when the decision came from the fail policy rather than the backend.
    #[serde(default)]
    pub degraded: bool,
}

impl RateLimitResult {
    /// Decision taken without consulting the backend.
    pub fn from_policy(allowed: bool, spec: &LimitSpec) -> Self {
        Self {
            allowed,
            requests_remaining: if allowed { spec.max_requests } else { 0 },
            units_remaining: if allowed { spec.max_units } else { 0 },
            reset_time: Utc::now() + chrono::Duration::from_std(spec.window).unwrap_or_default(),
            retry_after: if allowed { None } else { Some(Duration::from_secs(1)) },
            degraded: true,
        }
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
