pub mod membership;
pub mod result_document;
pub mod task;
pub mod unit;

// Re-export core models for easy access
pub use membership::{
    CveFixRequest, CveMembership, CveRollbackRequest, CveScanRequest, Host, HostInfo,
    RepoSetRequest,
};
pub use result_document::{
    ArtifactKind, ArtifactsUpdate, CheckItemResult, CveResult, HostResult, TaskArtifacts,
    TaskResultDocument,
};
pub use task::{Task, TaskType};
pub use unit::{CveHostUnit, RepoHostUnit, ScanHostUnit, TaskCve, UnitKind};
