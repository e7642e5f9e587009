//! Caller-facing task operations.

pub mod task_query_service;
pub mod task_service;

pub use task_query_service::{
    CveProgress, CveTaskInfoQuery, CveTaskRow, CveUnitView, Paginated, Paging, RepoTaskInfoQuery,
    SortOrder, TaskListQuery, TaskQueryService, TaskSortKey, TaskSummary,
};
pub use task_service::TaskService;
