pub mod artifact;
pub mod config;
pub mod failure;
pub mod job;
pub mod page;

pub use artifact::ArtifactRef;
pub use config::{CapabilityEndpoint, PipelineConfig};
pub use failure::{ErrorKind, Failure};
pub use job::{
    derive_title, language_label, validate_new_job, FailurePolicy, Job, JobStatus, JobSummary,
    JobUpdate, NewJob, SourceKind, SourcePayload, StagedFile, UploadFile, AUTO_LANGUAGE,
};
pub use page::{Page, PageStatus, PageUpdate, PageVariant};
