//! One repository per table family, each borrowing the shared pool.

pub mod access_grant;
pub mod issue;
pub mod plan;
pub mod policy;
pub mod project;
pub mod project_webhook;
pub mod query_history;
pub mod sheet;
pub mod task;
pub mod task_run;
pub mod user;

pub use access_grant::{list_access_grant_filter, AccessGrantMessage, AccessGrantRepo};
pub use issue::{list_issue_filter, IssueMessage, IssueRepo};
pub use plan::{list_rollout_filter, PlanMessage, PlanRepo};
pub use policy::{IamPolicy, PolicyMessage, PolicyRepo};
pub use project::{list_project_filter, project_orders, ProjectMessage, ProjectRepo};
pub use project_webhook::{ProjectWebhookMessage, ProjectWebhookRepo};
pub use query_history::{list_query_history_filter, QueryHistoryMessage, QueryHistoryRepo};
pub use sheet::{SheetMessage, SheetRepo};
pub use task::{TaskMessage, TaskRepo};
pub use task_run::{TaskRunMessage, TaskRunRepo};
pub use user::{list_user_filter, UserMessage, UserRepo};
