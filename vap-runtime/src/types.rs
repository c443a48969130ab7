use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Envelope wrapping every marketplace response body: `{ "data": ... }`.
#[derive(Debug, Deserialize)]
pub struct ApiData<T> {
    pub data: T,
}

/// Marketplace-side job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Requested,
    Accepted,
    InProgress,
    Delivered,
    Completed,
    Cancelled,
    #[serde(other)]
    #[default]
    Unknown,
}

impl JobStatus {
    /// Query-parameter form, matching the wire serialisation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Requested => "requested",
            JobStatus::Accepted => "accepted",
            JobStatus::InProgress => "in_progress",
            JobStatus::Delivered => "delivered",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Unknown => "unknown",
        }
    }
}

/// A marketplace job as observed through the seller API.
///
/// `job_hash` is the marketplace-supplied canonical hash used in the
/// acceptance message. It is distinct from the locally computed hash
/// embedded in creation attestations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    #[serde(default)]
    pub job_hash: String,
    #[serde(default)]
    pub buyer_verus_id: String,
    #[serde(default)]
    pub amount: Decimal,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: JobStatus,
}

/// Dispatcher-side state of an admitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Starting,
    Ready,
    Retiring,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Starting => "starting",
            JobState::Ready => "ready",
            JobState::Retiring => "retiring",
        }
    }
}

/// Why a job is being retired. Drives the deletion attestation shape and
/// the final buyer-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    Completed,
    Ghost,
    Timeout,
    HealthFailed,
    Shutdown,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireReason::Completed => "completed",
            RetireReason::Ghost => "ghost",
            RetireReason::Timeout => "timeout",
            RetireReason::HealthFailed => "health_failed",
            RetireReason::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_deserializes_camel_case() {
        let job: Job = serde_json::from_str(
            r#"{
                "jobId": "job-1",
                "jobHash": "abc123",
                "buyerVerusId": "buyer@",
                "amount": "12.5",
                "currency": "VRSC",
                "description": "summarise a document",
                "status": "requested"
            }"#,
        )
        .unwrap();

        assert_eq!(job.job_id, "job-1");
        assert_eq!(job.buyer_verus_id, "buyer@");
        assert_eq!(job.amount.to_string(), "12.5");
        assert_eq!(job.status, JobStatus::Requested);
    }

    #[test]
    fn test_job_accepts_numeric_amount_and_unknown_status() {
        let job: Job = serde_json::from_str(
            r#"{"jobId": "job-2", "amount": 3, "status": "weird_future_state"}"#,
        )
        .unwrap();

        assert_eq!(job.amount.to_string(), "3");
        assert_eq!(job.status, JobStatus::Unknown);
    }

    #[test]
    fn test_status_round_trips_as_query_param() {
        for status in [JobStatus::Requested, JobStatus::Accepted, JobStatus::InProgress] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json.trim_matches('"'), status.as_str());
        }
    }
}
