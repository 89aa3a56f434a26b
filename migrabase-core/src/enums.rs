//! String-backed enums stored in TEXT columns
//!
//! The database holds the SCREAMING_SNAKE_CASE names; filters accept the
//! same spelling.

use crate::validation::ValidationError;

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($field:literal) {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Get string representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ValidationError::InvalidVariant {
                        field: $field,
                        value: s.to_owned(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Soft-delete state shared by most resources
    pub enum State ("state") {
        Active => "ACTIVE",
        Deleted => "DELETED",
    }
}

impl State {
    /// Parse a state, tolerating the `STATE_` prefix API clients send.
    pub fn parse_lenient(s: &str) -> Result<Self, ValidationError> {
        s.strip_prefix("STATE_").unwrap_or(s).parse()
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, State::Deleted)
    }
}

string_enum! {
    pub enum UserType ("user type") {
        User => "USER",
        ServiceAccount => "SERVICE_ACCOUNT",
        SystemBot => "SYSTEM_BOT",
        WorkloadIdentity => "WORKLOAD_IDENTITY",
    }
}

string_enum! {
    pub enum IssueStatus ("issue status") {
        Open => "OPEN",
        Done => "DONE",
        Canceled => "CANCELED",
    }
}

string_enum! {
    pub enum IssueType ("issue type") {
        DatabaseChange => "DATABASE_CHANGE",
        GrantRequest => "GRANT_REQUEST",
        DatabaseExport => "DATABASE_EXPORT",
    }
}

string_enum! {
    pub enum TaskType ("task type") {
        DatabaseCreate => "DATABASE_CREATE",
        DatabaseMigrate => "DATABASE_MIGRATE",
        DatabaseSdl => "DATABASE_SDL",
        DatabaseExport => "DATABASE_EXPORT",
    }
}

string_enum! {
    /// Task run status. `NotStarted` and `Skipped` are derived, never stored.
    pub enum TaskRunStatus ("task run status") {
        Pending => "PENDING",
        Running => "RUNNING",
        Done => "DONE",
        Failed => "FAILED",
        Canceled => "CANCELED",
        NotStarted => "NOT_STARTED",
        Skipped => "SKIPPED",
    }
}

impl TaskRunStatus {
    /// Statuses that block creating another run for the same task.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskRunStatus::Pending | TaskRunStatus::Running)
    }
}

string_enum! {
    pub enum AccessGrantStatus ("access grant status") {
        Pending => "PENDING",
        Active => "ACTIVE",
        Revoked => "REVOKED",
    }
}

string_enum! {
    pub enum QueryHistoryType ("query history type") {
        Query => "QUERY",
        Export => "EXPORT",
    }
}

string_enum! {
    pub enum PolicyResourceType ("policy resource type") {
        Workspace => "WORKSPACE",
        Environment => "ENVIRONMENT",
        Project => "PROJECT",
        Instance => "INSTANCE",
        Database => "DATABASE",
    }
}

string_enum! {
    pub enum PolicyType ("policy type") {
        Iam => "IAM",
        Rollout => "ROLLOUT",
        MaskingRule => "MASKING_RULE",
        MaskingExemption => "MASKING_EXEMPTION",
        QueryData => "QUERY_DATA",
        Tag => "TAG",
    }
}

string_enum! {
    pub enum WebhookType ("webhook type") {
        Slack => "SLACK",
        Discord => "DISCORD",
        Teams => "TEAMS",
        DingTalk => "DINGTALK",
        Feishu => "FEISHU",
        Lark => "LARK",
        Wecom => "WECOM",
    }
}

string_enum! {
    /// Events a project webhook can subscribe to
    pub enum WebhookEvent ("webhook event") {
        IssueCreated => "ISSUE_CREATED",
        IssueStatusUpdate => "ISSUE_STATUS_UPDATE",
        IssueCommentCreated => "ISSUE_COMMENT_CREATED",
        IssueApprovalRequested => "ISSUE_APPROVAL_REQUESTED",
        PipelineFailed => "PIPELINE_FAILED",
        PipelineCompleted => "PIPELINE_COMPLETED",
    }
}
