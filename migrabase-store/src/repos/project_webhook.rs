//! Project webhook repository

use migrabase_core::{WebhookEvent, WebhookType};
use migrabase_filter::{args, qb, Query};
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const WEBHOOK_COLUMNS: &str = "project_webhook.id, project_webhook.project, project_webhook.type, \
     project_webhook.name, project_webhook.url, project_webhook.event_list, project_webhook.direct_message";

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectWebhookMessage {
    pub id: i64,
    pub project_id: String,
    pub webhook_type: WebhookType,
    pub title: String,
    pub url: String,
    pub events: Vec<WebhookEvent>,
    /// Deliver to the individual users involved instead of the channel.
    pub direct_message: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FindProjectWebhookMessage {
    pub id: Option<i64>,
    pub project_id: Option<String>,
    pub project_ids: Option<Vec<String>>,
    pub event: Option<WebhookEvent>,
}

#[derive(Debug, Clone)]
pub struct CreateProjectWebhookMessage {
    pub project_id: String,
    pub webhook_type: WebhookType,
    pub title: String,
    pub url: String,
    pub events: Vec<WebhookEvent>,
    pub direct_message: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateProjectWebhookMessage {
    pub title: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<WebhookEvent>>,
    pub direct_message: Option<bool>,
}

#[derive(FromRow)]
struct ProjectWebhookRow {
    id: i64,
    project: String,
    #[sqlx(rename = "type")]
    webhook_type: String,
    name: String,
    url: String,
    event_list: Vec<String>,
    direct_message: bool,
}

impl TryFrom<ProjectWebhookRow> for ProjectWebhookMessage {
    type Error = StoreError;

    fn try_from(row: ProjectWebhookRow) -> Result<Self> {
        let events = row
            .event_list
            .iter()
            .map(|event| event.parse::<WebhookEvent>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            id: row.id,
            project_id: row.project,
            webhook_type: row.webhook_type.parse()?,
            title: row.name,
            url: row.url,
            events,
            direct_message: row.direct_message,
        })
    }
}

fn event_names(events: &[WebhookEvent]) -> Vec<&'static str> {
    events.iter().map(WebhookEvent::as_str).collect()
}

/// Project webhook repository
pub struct ProjectWebhookRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> ProjectWebhookRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, create: CreateProjectWebhookMessage) -> Result<ProjectWebhookMessage> {
        if create.url.trim().is_empty() {
            return Err(StoreError::invalid_argument("webhook url is required"));
        }
        let query = qb::q(
            format!(
                "INSERT INTO project_webhook (project, type, name, url, event_list, direct_message) \
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
                WEBHOOK_COLUMNS
            ),
            args![
                create.project_id,
                create.webhook_type.as_str(),
                create.title,
                create.url,
                event_names(&create.events),
                create.direct_message
            ],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: ProjectWebhookRow = sqlx::query_as_with(&sql, arguments)
            .fetch_one(self.pool)
            .await?;
        tracing::info!(webhook_id = row.id, project = %row.project, "created project webhook");
        row.try_into()
    }

    pub async fn get(&self, find: &FindProjectWebhookMessage) -> Result<Option<ProjectWebhookMessage>> {
        let webhooks = self.list(find).await?;
        exec::at_most_one(webhooks, "project webhook")
    }

    pub async fn list(&self, find: &FindProjectWebhookMessage) -> Result<Vec<ProjectWebhookMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<ProjectWebhookRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(ProjectWebhookMessage::try_from).collect()
    }

    pub async fn update(
        &self,
        id: i64,
        patch: UpdateProjectWebhookMessage,
    ) -> Result<ProjectWebhookMessage> {
        let mut set = Query::new();
        if let Some(title) = patch.title {
            set.comma("name = ?", args![title]);
        }
        if let Some(url) = patch.url {
            set.comma("url = ?", args![url]);
        }
        if let Some(events) = &patch.events {
            set.comma("event_list = ?", args![event_names(events)]);
        }
        if let Some(direct_message) = patch.direct_message {
            set.comma("direct_message = ?", args![direct_message]);
        }
        if set.is_empty() {
            return Err(StoreError::invalid_argument("no fields to update"));
        }

        let query = qb::q(
            format!(
                "UPDATE project_webhook SET ? WHERE id = ? RETURNING {}",
                WEBHOOK_COLUMNS
            ),
            args![set, id],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: ProjectWebhookRow = sqlx::query_as_with(&sql, arguments)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("project webhook", id))?;
        row.try_into()
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM project_webhook WHERE id = $1")
            .bind(id)
            .execute(self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("project webhook", id));
        }
        Ok(())
    }
}

fn list_query(find: &FindProjectWebhookMessage) -> Query {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(id) = find.id {
        where_q.and("project_webhook.id = ?", args![id]);
    }
    if let Some(project_id) = &find.project_id {
        where_q.and("project_webhook.project = ?", args![project_id]);
    }
    if let Some(project_ids) = &find.project_ids {
        where_q.and("project_webhook.project = ANY(?)", args![project_ids.as_slice()]);
    }
    if let Some(event) = find.event {
        where_q.and("? = ANY(project_webhook.event_list)", args![event.as_str()]);
    }
    let mut query = qb::q(
        format!("SELECT {} FROM project_webhook WHERE ?", WEBHOOK_COLUMNS),
        args![where_q],
    );
    query.space("ORDER BY project_webhook.id", args![]);
    query
}
