//! migrabase-core: types shared by the filter compiler, the store and the CLI.

pub mod config;
pub mod enums;
pub mod error;
pub mod pagination;
pub mod resource;
pub mod validation;

pub use config::StoreConfig;
pub use enums::{
    AccessGrantStatus, IssueStatus, IssueType, PolicyResourceType, PolicyType, QueryHistoryType,
    State, TaskRunStatus, TaskType, UserType, WebhookEvent, WebhookType,
};
pub use error::{CoreError, Result};
pub use pagination::{Paginated, Pagination};
pub use validation::ValidationError;
