//! Event-time extraction.
//!
//! Windowing runs on the time a round happened, never on when it reached
//! the pipeline. [`TimestampExtractor`] is the seam that resolves that
//! time from a decoded payload; [`PayloadTimestampExtractor`] reads the
//! embedded `event_time` field and applies a [`TimestampFallback`] when
//! the field is missing or unusable.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use skirmish_types::RoundPayload;

use crate::processor::ProcessError;

/// Fallback applied when a round carries no usable event time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFallback {
    /// Reject the round as a time extraction fault.
    #[default]
    Reject,
    /// Use a fixed, configured time.
    Sentinel,
    /// Use the time the record reached the pipeline.
    ArrivalTime,
}

/// Resolves the authoritative event time of a round.
pub trait TimestampExtractor: Send + Sync {
    /// Event time of `payload`, which arrived at `arrival`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::TimeExtraction`] when no time can be
    /// resolved under the extractor's policy.
    fn extract(
        &self,
        payload: &RoundPayload,
        arrival: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ProcessError>;
}

/// Reads `event_time` from the payload, falling back per policy.
#[derive(Debug, Clone, Copy)]
pub struct PayloadTimestampExtractor {
    fallback: TimestampFallback,
    sentinel: DateTime<Utc>,
}

impl PayloadTimestampExtractor {
    /// Extractor with the given fallback. `sentinel` is only used by
    /// [`TimestampFallback::Sentinel`].
    pub const fn new(fallback: TimestampFallback, sentinel: DateTime<Utc>) -> Self {
        Self { fallback, sentinel }
    }

    /// Extractor that rejects rounds without a usable event time.
    pub fn rejecting() -> Self {
        Self::new(TimestampFallback::Reject, DateTime::<Utc>::default())
    }
}

impl TimestampExtractor for PayloadTimestampExtractor {
    fn extract(
        &self,
        payload: &RoundPayload,
        arrival: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ProcessError> {
        let reason = match payload.event_time.as_ref().map(parse_event_time) {
            Some(Ok(ts)) => return Ok(ts),
            Some(Err(reason)) => reason,
            None => "event_time is missing".to_owned(),
        };
        match self.fallback {
            TimestampFallback::Reject => Err(ProcessError::TimeExtraction { reason }),
            TimestampFallback::Sentinel => Ok(self.sentinel),
            TimestampFallback::ArrivalTime => Ok(arrival),
        }
    }
}

/// Parse an embedded event time: an RFC 3339 string or integral epoch
/// milliseconds.
pub fn parse_event_time(value: &serde_json::Value) -> Result<DateTime<Utc>, String> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| format!("event_time {s:?} is not RFC 3339: {e}")),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| format!("event_time {n} is not a valid epoch millisecond value")),
        other => Err(format!("event_time has unsupported type: {other}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(event_time: Option<serde_json::Value>) -> RoundPayload {
        RoundPayload {
            event_time,
            ..RoundPayload::default()
        }
    }

    fn arrival() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_060_000).unwrap()
    }

    #[test]
    fn embedded_time_wins_over_arrival() {
        let extractor = PayloadTimestampExtractor::new(
            TimestampFallback::ArrivalTime,
            DateTime::<Utc>::default(),
        );
        let ts = extractor
            .extract(&payload(Some(json!(1_700_000_000_000_i64))), arrival())
            .unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn rfc3339_is_accepted() {
        let ts = parse_event_time(&json!("2024-03-01T12:00:00+02:00")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn fractional_millis_rejected() {
        assert!(parse_event_time(&json!(1.5)).is_err());
        assert!(parse_event_time(&json!(true)).is_err());
    }

    #[test]
    fn reject_policy_faults() {
        let extractor = PayloadTimestampExtractor::rejecting();
        let result = extractor.extract(&payload(None), arrival());
        assert!(matches!(result, Err(ProcessError::TimeExtraction { .. })));
        let result = extractor.extract(&payload(Some(json!("yesterday"))), arrival());
        assert!(matches!(result, Err(ProcessError::TimeExtraction { .. })));
    }

    #[test]
    fn sentinel_and_arrival_fallbacks() {
        let sentinel = DateTime::from_timestamp_millis(42).unwrap();
        let extractor = PayloadTimestampExtractor::new(TimestampFallback::Sentinel, sentinel);
        assert_eq!(extractor.extract(&payload(None), arrival()).unwrap(), sentinel);

        let extractor = PayloadTimestampExtractor::new(TimestampFallback::ArrivalTime, sentinel);
        assert_eq!(extractor.extract(&payload(None), arrival()).unwrap(), arrival());
    }
}
