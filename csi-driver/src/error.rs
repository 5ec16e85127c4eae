//! Error taxonomy and the single CSI status-mapping boundary (component
//! I). Every engine error funnels through here once, at the RPC
//! boundary, per spec.md §7.

use thiserror::Error;
use tonic::{Code, Status};

use crate::appliance::ApplianceError;
use crate::taxonomy::TaxonomyError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error(transparent)]
    Appliance(#[from] ApplianceError),

    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_managed(dataset: &str) -> Self {
        EngineError::FailedPrecondition(format!("dataset '{dataset}' is not managed by this plugin"))
    }
}

impl From<EngineError> for Status {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidArgument(msg) => Status::new(Code::InvalidArgument, msg),
            EngineError::AlreadyExists(msg) => Status::new(Code::AlreadyExists, msg),
            EngineError::NotFound(msg) => Status::new(Code::NotFound, msg),
            EngineError::FailedPrecondition(msg) => Status::new(Code::FailedPrecondition, msg),
            EngineError::DeadlineExceeded(msg) => Status::new(Code::DeadlineExceeded, msg),
            EngineError::Taxonomy(e) => Status::new(Code::InvalidArgument, e.to_string()),
            EngineError::Appliance(e) => match e {
                ApplianceError::Transport(msg) => Status::new(Code::Unavailable, msg),
                ApplianceError::NotFound(msg) => Status::new(Code::NotFound, msg),
                ApplianceError::Conflict(msg) => Status::new(Code::AlreadyExists, msg),
                ApplianceError::Busy(msg) => Status::new(Code::Unavailable, msg),
                ApplianceError::PermissionDenied(msg) => Status::new(Code::PermissionDenied, msg),
                ApplianceError::Unknown(msg) => Status::new(Code::Internal, msg),
            },
            EngineError::Internal(msg) => Status::new(Code::Internal, msg),
        }
    }
}

/// Delete RPCs treat a missing target as success (spec.md §3 invariants,
/// §7, §8 boundary behaviours). Callers fold a `NotFound` appliance error
/// into `Ok(())` at the point of the delete itself (the typed verbs in
/// `appliance::*` already do this for the common cases); this helper
/// exists for the remaining spots that inspect a raw `EngineError`.
pub fn is_idempotent_delete_target(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::NotFound(_) | EngineError::Appliance(ApplianceError::NotFound(_))
    )
}
