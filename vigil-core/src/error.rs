use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scan::model::ScanStep;

/// Structured failure code persisted on scans, step records and agent runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CapacityTimeout,
    AiRequiredDisabled,
    InconclusiveScan,
    ScanCancelled,
    StageTimeout,
    CloneFailed,
    CompileFailed,
    DeployFailed,
    AnalysisFailed,
    AiAnalysisFailed,
    ProofGenerationFailed,
    SubmissionFailed,
    PersistenceError,
    QueueError,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CapacityTimeout => "CAPACITY_TIMEOUT",
            ErrorCode::AiRequiredDisabled => "AI_REQUIRED_DISABLED",
            ErrorCode::InconclusiveScan => "INCONCLUSIVE_SCAN",
            ErrorCode::ScanCancelled => "SCAN_CANCELLED",
            ErrorCode::StageTimeout => "STAGE_TIMEOUT",
            ErrorCode::CloneFailed => "CLONE_FAILED",
            ErrorCode::CompileFailed => "COMPILE_FAILED",
            ErrorCode::DeployFailed => "DEPLOY_FAILED",
            ErrorCode::AnalysisFailed => "ANALYSIS_FAILED",
            ErrorCode::AiAnalysisFailed => "AI_ANALYSIS_FAILED",
            ErrorCode::ProofGenerationFailed => "PROOF_GENERATION_FAILED",
            ErrorCode::SubmissionFailed => "SUBMISSION_FAILED",
            ErrorCode::PersistenceError => "PERSISTENCE_ERROR",
            ErrorCode::QueueError => "QUEUE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Default failure code for an executor error in the given stage.
    pub const fn for_step(step: ScanStep) -> Self {
        match step {
            ScanStep::Clone => ErrorCode::CloneFailed,
            ScanStep::Compile => ErrorCode::CompileFailed,
            ScanStep::Deploy => ErrorCode::DeployFailed,
            ScanStep::Analyze => ErrorCode::AnalysisFailed,
            ScanStep::AiDeepAnalysis => ErrorCode::AiAnalysisFailed,
            ScanStep::ProofGeneration => ErrorCode::ProofGenerationFailed,
            ScanStep::Submit => ErrorCode::SubmissionFailed,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self> {
        let code = match raw {
            "CAPACITY_TIMEOUT" => ErrorCode::CapacityTimeout,
            "AI_REQUIRED_DISABLED" => ErrorCode::AiRequiredDisabled,
            "INCONCLUSIVE_SCAN" => ErrorCode::InconclusiveScan,
            "SCAN_CANCELLED" => ErrorCode::ScanCancelled,
            "STAGE_TIMEOUT" => ErrorCode::StageTimeout,
            "CLONE_FAILED" => ErrorCode::CloneFailed,
            "COMPILE_FAILED" => ErrorCode::CompileFailed,
            "DEPLOY_FAILED" => ErrorCode::DeployFailed,
            "ANALYSIS_FAILED" => ErrorCode::AnalysisFailed,
            "AI_ANALYSIS_FAILED" => ErrorCode::AiAnalysisFailed,
            "PROOF_GENERATION_FAILED" => ErrorCode::ProofGenerationFailed,
            "SUBMISSION_FAILED" => ErrorCode::SubmissionFailed,
            "PERSISTENCE_ERROR" => ErrorCode::PersistenceError,
            "QUEUE_ERROR" => ErrorCode::QueueError,
            "INTERNAL_ERROR" => ErrorCode::InternalError,
            other => {
                return Err(ScanError::Internal(format!(
                    "unknown error code {other}"
                )));
            }
        };
        Ok(code)
    }
}

/// Every failure the orchestrator can observe. The job consumer decides
/// queue-level retry purely from [`ScanError::retryable`].
#[derive(Error, Debug, Clone)]
pub enum ScanError {
    #[error("no scanning agent became available within {waited:?} of enqueue")]
    CapacityTimeout { waited: Duration },

    #[error("AI analysis is required but disabled by configuration")]
    AiRequiredDisabled,

    #[error("scan inconclusive: no findings after AI deep analysis")]
    Inconclusive,

    #[error("scan cancelled before the pipeline started")]
    Cancelled,

    #[error("{step} failed: {message}")]
    Step {
        step: ScanStep,
        code: ErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("{step} timed out after {timeout:?}")]
    StepTimeout { step: ScanStep, timeout: Duration },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Retryable executor failure for `step` with the stage's default code.
    pub fn step(step: ScanStep, message: impl Into<String>) -> Self {
        ScanError::Step {
            step,
            code: ErrorCode::for_step(step),
            message: message.into(),
            retryable: true,
        }
    }

    /// Executor failure that retrying cannot fix (bad repository, missing contract, ...).
    pub fn step_permanent(step: ScanStep, message: impl Into<String>) -> Self {
        ScanError::Step {
            step,
            code: ErrorCode::for_step(step),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ScanError::CapacityTimeout { .. } => ErrorCode::CapacityTimeout,
            ScanError::AiRequiredDisabled => ErrorCode::AiRequiredDisabled,
            ScanError::Inconclusive => ErrorCode::InconclusiveScan,
            ScanError::Cancelled => ErrorCode::ScanCancelled,
            ScanError::Step { code, .. } => *code,
            ScanError::StepTimeout { .. } => ErrorCode::StageTimeout,
            ScanError::Persistence(_) | ScanError::NotFound(_) => {
                ErrorCode::PersistenceError
            }
            ScanError::Queue(_) => ErrorCode::QueueError,
            ScanError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            ScanError::CapacityTimeout { .. }
            | ScanError::AiRequiredDisabled
            | ScanError::Inconclusive
            | ScanError::Cancelled => false,
            ScanError::Step { retryable, .. } => *retryable,
            ScanError::StepTimeout { .. }
            | ScanError::Persistence(_)
            | ScanError::Queue(_)
            | ScanError::NotFound(_)
            | ScanError::Internal(_) => true,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for ScanError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ScanError::NotFound(err.to_string()),
            other => ScanError::Persistence(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Internal(format!("serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
