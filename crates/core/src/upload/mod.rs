//! Upload orchestration: one request's event stream in, one outcome out.

mod error;
mod events;
mod orchestrator;
mod policy;

pub use error::{UploadError, ValidationError};
pub use events::UploadEvent;
pub use orchestrator::{MirrorSet, REDIRECT_FIELD, UploadOutcome, UploadService, UploadStatus};
pub use policy::UploadPolicy;
