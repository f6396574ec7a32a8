//! # Relist Decision
//!
//! Decides whether a broker's catalog should be fetched again. Triggers are checked
//! in a fixed order and the first one that holds wins:
//!
//! 1. never synced
//! 2. `relistRequests` increased since the last sync
//! 3. the spec changed since the last successful sync
//! 4. `relistBehavior: Always`
//! 5. `relistBehavior: Duration` and `relistDuration` elapsed since the last sync
//!
//! `relistRequests` is a spec field, so bumping it also bumps the generation; it is
//! checked before the generation so the sync is attributed to the request.

use crate::crd::{RelistBehavior, ServiceBroker};
use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelistTrigger {
    Initial,
    SpecChanged,
    Always,
    DurationElapsed,
    ManualRequest,
}

impl RelistTrigger {
    /// Label used in logs and the `catalog_syncs_total` metric
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RelistTrigger::Initial => "initial",
            RelistTrigger::SpecChanged => "spec-change",
            RelistTrigger::Always => "always",
            RelistTrigger::DurationElapsed => "duration",
            RelistTrigger::ManualRequest => "manual",
        }
    }
}

/// Parse a relist duration such as "30s", "15m", "1h" or "1d"
pub fn parse_relist_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let duration_regex = Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    let interval_lower = duration_trimmed.to_lowercase();
    let captures = duration_regex.captures(&interval_lower).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid duration format '{duration_trimmed}'. Expected format: <number><unit> (e.g., '30s', '15m', '1h')"
        )
    })?;

    let number: u64 = captures
        .name("number")
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid duration number in '{duration_trimmed}': {e}"))?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration number must be greater than 0, got '{duration_trimmed}'"
        ));
    }

    let multiplier = match captures.name("unit").map(|m| m.as_str()) {
        Some("s") => 1,
        Some("m") => 60,
        Some("h") => 3600,
        Some("d") => 86400,
        _ => {
            return Err(anyhow::anyhow!(
                "Invalid duration unit in '{duration_trimmed}'"
            ))
        }
    };

    number
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("Duration '{duration_trimmed}' is too large"))
}

/// Configured relist interval, falling back to the default for unparsable values
#[must_use]
pub fn relist_interval(broker: &ServiceBroker) -> Duration {
    match parse_relist_duration(&broker.spec.relist_duration) {
        Ok(duration) => duration,
        Err(e) => {
            warn!(
                broker.name = broker.metadata.name.as_deref().unwrap_or("unknown"),
                "invalid relistDuration, using default: {}", e
            );
            parse_relist_duration(crate::constants::DEFAULT_RELIST_DURATION)
                .unwrap_or(Duration::from_secs(900))
        }
    }
}

fn last_sync(broker: &ServiceBroker) -> Option<DateTime<Utc>> {
    let raw = broker.status.as_ref()?.last_catalog_retrieval_time.as_deref()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// First relist trigger that holds at `now`, if any
#[must_use]
pub fn relist_trigger(broker: &ServiceBroker, now: DateTime<Utc>) -> Option<RelistTrigger> {
    let status = broker.status.as_ref();
    let Some(last) = last_sync(broker) else {
        return Some(RelistTrigger::Initial);
    };

    let observed_requests = status
        .and_then(|s| s.last_observed_relist_requests)
        .unwrap_or(0);
    if broker.spec.relist_requests > observed_requests {
        return Some(RelistTrigger::ManualRequest);
    }

    let observed_generation = status.and_then(|s| s.observed_generation);
    if observed_generation != broker.metadata.generation {
        return Some(RelistTrigger::SpecChanged);
    }

    match broker.spec.relist_behavior {
        RelistBehavior::Always => return Some(RelistTrigger::Always),
        RelistBehavior::Duration => {
            let interval = chrono::Duration::from_std(relist_interval(broker))
                .unwrap_or(chrono::Duration::MAX);
            if now.signed_duration_since(last) >= interval {
                return Some(RelistTrigger::DurationElapsed);
            }
        }
        RelistBehavior::Never => {}
    }
    None
}

/// How long until the next time-based relist, if the broker has one
#[must_use]
pub fn next_relist_delay(
    broker: &ServiceBroker,
    now: DateTime<Utc>,
    resync_interval: Duration,
) -> Option<Duration> {
    match broker.spec.relist_behavior {
        RelistBehavior::Never => None,
        RelistBehavior::Always => Some(resync_interval),
        RelistBehavior::Duration => {
            let interval = relist_interval(broker);
            let elapsed = last_sync(broker)
                .and_then(|last| now.signed_duration_since(last).to_std().ok())
                .unwrap_or_default();
            Some(interval.saturating_sub(elapsed).max(Duration::from_secs(1)))
        }
    }
}
