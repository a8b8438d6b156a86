//! Job handler contract.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use taxa_core::{Error, FailureKind, Job, JobType, Result};

/// A claimed job, as handed to its handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    /// Run id for work that polls cancellation; the job id, so cancelling
    /// the row cancels the run.
    pub fn run_id(&self) -> Uuid {
        self.job.id
    }

    /// Decode the payload into the handler's request struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let job_type = self.job.job_type;
        let payload = self
            .job
            .payload
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("{job_type} job has no payload")))?;
        serde_json::from_value(payload)
            .map_err(|e| Error::InvalidInput(format!("invalid {job_type} payload: {e}")))
    }
}

/// What a handler made of its job.
#[derive(Debug)]
pub enum JobResult {
    /// Done; the value is stored as the job result.
    Success(Option<JsonValue>),
    /// Cannot succeed as queued.
    Failed(String),
    /// Worth another attempt.
    Retry(String),
}

impl JobResult {
    /// Split into the stored result or the failure to record.
    pub fn into_outcome(self) -> std::result::Result<Option<JsonValue>, (String, FailureKind)> {
        match self {
            JobResult::Success(value) => Ok(value),
            JobResult::Failed(error) => Err((error, FailureKind::Permanent)),
            JobResult::Retry(error) => Err((error, FailureKind::Transient)),
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(&self, ctx: JobContext) -> JobResult;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use taxa_core::JobStatus;

    pub(crate) fn job(job_type: JobType, payload: Option<JsonValue>) -> Job {
        Job {
            id: Uuid::now_v7(),
            job_type,
            status: JobStatus::Running,
            priority: job_type.default_priority(),
            payload,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            created_at: chrono::Utc::now(),
            started_at: Some(chrono::Utc::now()),
            completed_at: None,
        }
    }

    #[derive(Debug, Deserialize)]
    struct Payload {
        taxon_id: i64,
        #[serde(default)]
        owner: Option<String>,
    }

    #[test]
    fn test_payload_decodes_with_defaults() {
        let ctx = JobContext::new(job(
            JobType::HarvestOccurrences,
            Some(json!({ "taxon_id": 7 })),
        ));
        let payload: Payload = ctx.payload().unwrap();
        assert_eq!(payload.taxon_id, 7);
        assert!(payload.owner.is_none());
        assert_eq!(ctx.run_id(), ctx.job.id);
    }

    #[test]
    fn test_missing_payload_is_invalid_input() {
        let ctx = JobContext::new(job(JobType::ResyncParent, None));
        let err = ctx.payload::<Payload>().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("resync_parent"));
    }

    #[test]
    fn test_malformed_payload_is_invalid_input() {
        let ctx = JobContext::new(job(
            JobType::ResyncParent,
            Some(json!({ "taxon_id": "seven" })),
        ));
        assert!(matches!(ctx.payload::<Payload>(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_results_map_to_failure_kinds() {
        assert_eq!(
            JobResult::Success(Some(json!({ "merged": false }))).into_outcome(),
            Ok(Some(json!({ "merged": false })))
        );
        assert_eq!(
            JobResult::Failed("no such taxon".into()).into_outcome(),
            Err(("no such taxon".to_string(), FailureKind::Permanent))
        );
        assert_eq!(
            JobResult::Retry("registry down".into()).into_outcome(),
            Err(("registry down".to_string(), FailureKind::Transient))
        );
    }
}
