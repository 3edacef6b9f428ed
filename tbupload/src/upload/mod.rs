pub mod coordinator;
pub mod engine;
pub mod finalize;
pub mod negotiate;
pub mod paths;
pub mod planner;
pub mod retry;
pub mod session;
pub mod skip;
pub mod state;
#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{UploadEngine, UploadError, UploadOptions, UploadOutcome, UploadPhase};
