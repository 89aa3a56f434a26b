//! Project repository and the project list filter

use std::collections::{BTreeMap, HashMap};

use migrabase_core::resource::{format_project, format_user_email, DEFAULT_PROJECT_ID};
use migrabase_core::{Paginated, Pagination, PolicyResourceType, PolicyType, State};
use migrabase_filter::compile::{self, FilterSchema, FilterValue};
use migrabase_filter::{args, parse_order_by, qb, FilterError, OrderByKey, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;
use crate::repos::policy::{upsert_policy_in, Binding, IamPolicy, UpsertPolicyMessage, PROJECT_OWNER_ROLE};
use crate::repos::project_webhook::{
    FindProjectWebhookMessage, ProjectWebhookMessage, ProjectWebhookRepo,
};

const PROJECT_COLUMNS: &str = "project.resource_id, project.name, \
     project.data_classification_config_id, project.setting, project.deleted";

/// Project settings (`project.setting`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectSetting {
    pub labels: BTreeMap<String, String>,
    pub allow_modify_statement: bool,
    pub auto_resolve_issue: bool,
    pub enforce_issue_title: bool,
    pub auto_enable_backup: bool,
    pub skip_backup_errors: bool,
    pub postgres_database_tenant_mode: bool,
    pub allow_self_approval: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issue_labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectMessage {
    pub resource_id: String,
    pub title: String,
    pub data_classification_config_id: String,
    pub setting: ProjectSetting,
    pub deleted: bool,
    pub webhooks: Vec<ProjectWebhookMessage>,
}

impl ProjectMessage {
    /// `projects/{resource_id}`
    pub fn name(&self) -> String {
        format_project(&self.resource_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindProjectMessage {
    pub resource_id: Option<String>,
    pub show_deleted: bool,
    pub filter_q: Option<Query>,
    /// Keys already mapped to columns, see [`project_orders`].
    pub order_by_keys: Vec<OrderByKey>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateProjectMessage {
    pub resource_id: String,
    pub title: String,
    pub data_classification_config_id: String,
    pub setting: ProjectSetting,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateProjectMessage {
    pub resource_id: String,
    pub title: Option<String>,
    pub data_classification_config_id: Option<String>,
    pub setting: Option<ProjectSetting>,
    pub delete: Option<bool>,
}

#[derive(FromRow)]
struct ProjectRow {
    resource_id: String,
    name: String,
    data_classification_config_id: String,
    setting: Json<ProjectSetting>,
    deleted: bool,
}

impl From<ProjectRow> for ProjectMessage {
    fn from(row: ProjectRow) -> Self {
        Self {
            resource_id: row.resource_id,
            title: row.name,
            data_classification_config_id: row.data_classification_config_id,
            setting: row.setting.0,
            deleted: row.deleted,
            webhooks: Vec::new(),
        }
    }
}

/// Project repository
pub struct ProjectRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> ProjectRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Get one project, deleted or not.
    pub async fn get(&self, find: &FindProjectMessage) -> Result<Option<ProjectMessage>> {
        let find = FindProjectMessage {
            show_deleted: true,
            ..find.clone()
        };
        let projects = self.list(&find).await?;
        exec::at_most_one(projects, "project")
    }

    pub async fn get_by_id(&self, resource_id: &str) -> Result<Option<ProjectMessage>> {
        self.get(&FindProjectMessage {
            resource_id: Some(resource_id.to_owned()),
            ..Default::default()
        })
        .await
    }

    /// List projects with their webhooks attached.
    pub async fn list(&self, find: &FindProjectMessage) -> Result<Vec<ProjectMessage>> {
        let (sql, arguments) = exec::build(&list_query(find)?)?;
        let rows: Vec<ProjectRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        let mut projects: Vec<ProjectMessage> = rows.into_iter().map(ProjectMessage::from).collect();
        if projects.is_empty() {
            return Ok(projects);
        }

        let webhooks = ProjectWebhookRepo::new(self.pool)
            .list(&FindProjectWebhookMessage {
                project_ids: Some(projects.iter().map(|p| p.resource_id.clone()).collect()),
                ..Default::default()
            })
            .await?;
        let mut by_project: HashMap<String, Vec<ProjectWebhookMessage>> = HashMap::new();
        for webhook in webhooks {
            by_project
                .entry(webhook.project_id.clone())
                .or_default()
                .push(webhook);
        }
        for project in &mut projects {
            project.webhooks = by_project.remove(&project.resource_id).unwrap_or_default();
        }
        Ok(projects)
    }

    /// One page of projects; `find.limit`/`find.offset` are replaced by `page`.
    pub async fn list_page(
        &self,
        find: &FindProjectMessage,
        page: Pagination,
    ) -> Result<Paginated<ProjectMessage>> {
        let find = FindProjectMessage {
            limit: Some(page.fetch_limit()),
            offset: Some(page.sql_offset()),
            ..find.clone()
        };
        let projects = self.list(&find).await?;
        Ok(Paginated::from_rows(projects, page))
    }

    /// Create a project and make `creator_email` its owner, atomically.
    pub async fn create(
        &self,
        create: CreateProjectMessage,
        creator_email: &str,
    ) -> Result<ProjectMessage> {
        if create.resource_id.is_empty() {
            return Err(StoreError::invalid_argument("project resource id is required"));
        }
        let query = qb::q(
            format!(
                "INSERT INTO project (resource_id, name, data_classification_config_id, setting) \
                 VALUES (?, ?, ?, ?) RETURNING {}",
                PROJECT_COLUMNS
            ),
            args![
                &create.resource_id,
                &create.title,
                &create.data_classification_config_id,
                serde_json::to_value(&create.setting)?
            ],
        );
        let owner_policy = IamPolicy {
            bindings: vec![Binding {
                role: PROJECT_OWNER_ROLE.to_owned(),
                members: vec![format_user_email(creator_email)],
                condition: None,
            }],
        };

        let mut tx = self.pool.begin().await?;
        let (sql, arguments) = exec::build(&query)?;
        let row: ProjectRow = sqlx::query_as_with(&sql, arguments)
            .fetch_one(&mut *tx)
            .await?;
        upsert_policy_in(
            &mut *tx,
            &UpsertPolicyMessage {
                resource_type: PolicyResourceType::Project,
                resource: format_project(&create.resource_id),
                policy_type: PolicyType::Iam,
                payload: serde_json::to_value(&owner_policy)?,
                inherit_from_parent: false,
                enforce: true,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(project = %create.resource_id, owner = %creator_email, "created project");
        Ok(row.into())
    }

    /// Apply every patch in one transaction, then re-read the projects.
    pub async fn update_projects(
        &self,
        patches: Vec<UpdateProjectMessage>,
    ) -> Result<Vec<ProjectMessage>> {
        if patches.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        for patch in &patches {
            let (sql, arguments) = exec::build(&update_query(patch)?)?;
            let result = sqlx::query_with(&sql, arguments).execute(&mut *tx).await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::not_found("project", &patch.resource_id));
            }
        }
        tx.commit().await?;

        let mut projects = Vec::with_capacity(patches.len());
        for patch in &patches {
            let project = self
                .get_by_id(&patch.resource_id)
                .await?
                .ok_or_else(|| StoreError::not_found("project", &patch.resource_id))?;
            projects.push(project);
        }
        Ok(projects)
    }

    /// Permanently remove a soft-deleted project and everything that belongs to it.
    pub async fn delete(&self, resource_id: &str) -> Result<()> {
        if resource_id == DEFAULT_PROJECT_ID {
            return Err(StoreError::invalid_argument("the default project cannot be purged"));
        }

        let mut tx = self.pool.begin().await?;
        let steps: [(&str, Query); 9] = [
            (
                "query_history",
                qb::q("DELETE FROM query_history WHERE project_id = ?", args![resource_id]),
            ),
            (
                "policy",
                qb::q(
                    "DELETE FROM policy WHERE resource_type = ? AND resource = 'projects/' || ?",
                    args![PolicyResourceType::Project.as_str(), resource_id],
                ),
            ),
            (
                "access_grant",
                qb::q("DELETE FROM access_grant WHERE project = ?", args![resource_id]),
            ),
            (
                "issue",
                qb::q("DELETE FROM issue WHERE project = ?", args![resource_id]),
            ),
            (
                "task_run",
                qb::q(
                    "DELETE FROM task_run WHERE task_id IN (\
                     SELECT task.id FROM task JOIN plan ON task.plan_id = plan.id \
                     WHERE plan.project = ?)",
                    args![resource_id],
                ),
            ),
            (
                "task",
                qb::q(
                    "DELETE FROM task WHERE plan_id IN (SELECT id FROM plan WHERE project = ?)",
                    args![resource_id],
                ),
            ),
            (
                "plan",
                qb::q("DELETE FROM plan WHERE project = ?", args![resource_id]),
            ),
            (
                "sheet",
                qb::q("DELETE FROM sheet WHERE project = ?", args![resource_id]),
            ),
            (
                "project_webhook",
                qb::q("DELETE FROM project_webhook WHERE project = ?", args![resource_id]),
            ),
        ];
        for (table, query) in steps {
            let (sql, arguments) = exec::build(&query)?;
            let result = sqlx::query_with(&sql, arguments).execute(&mut *tx).await?;
            tracing::debug!(table, rows = result.rows_affected(), project = %resource_id, "purged rows");
        }

        let result = sqlx::query("DELETE FROM project WHERE resource_id = $1 AND deleted = TRUE")
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::invalid_argument(format!(
                "project {} not found or not marked as deleted",
                resource_id
            )));
        }
        tx.commit().await?;

        tracing::info!(project = %resource_id, "purged project");
        Ok(())
    }
}

fn update_query(patch: &UpdateProjectMessage) -> Result<Query> {
    let mut set = Query::new();
    if let Some(title) = &patch.title {
        set.comma("name = ?", args![title]);
    }
    if let Some(delete) = patch.delete {
        set.comma("deleted = ?", args![delete]);
    }
    if let Some(id) = &patch.data_classification_config_id {
        set.comma("data_classification_config_id = ?", args![id]);
    }
    if let Some(setting) = &patch.setting {
        set.comma("setting = ?", args![serde_json::to_value(setting)?]);
    }
    if set.is_empty() {
        return Err(StoreError::invalid_argument("no fields to update"));
    }
    Ok(qb::q(
        "UPDATE project SET ? WHERE resource_id = ?",
        args![set, &patch.resource_id],
    ))
}

/// Column for an order key, from the fixed set projects can be sorted by.
fn order_column(key: &str) -> Option<&'static str> {
    match key {
        "name" => Some("project.name"),
        "resource_id" => Some("project.resource_id"),
        _ => None,
    }
}

fn list_query(find: &FindProjectMessage) -> Result<Query> {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(filter) = &find.filter_q {
        where_q.and("?", args![filter]);
    }
    if let Some(resource_id) = &find.resource_id {
        where_q.and("project.resource_id = ?", args![resource_id]);
    }
    if !find.show_deleted {
        where_q.and("project.deleted = ?", args![false]);
    }

    let mut query = qb::q(
        format!("SELECT {} FROM project WHERE ?", PROJECT_COLUMNS),
        args![where_q],
    );
    if find.order_by_keys.is_empty() {
        query.space("ORDER BY project.resource_id", args![]);
    } else {
        let order = find
            .order_by_keys
            .iter()
            .map(|key| {
                order_column(&key.key).map(|column| key.to_sql(column)).ok_or_else(|| {
                    StoreError::invalid_argument(format!(
                        "cannot order projects by {:?}",
                        key.key
                    ))
                })
            })
            .collect::<Result<Vec<String>>>()?;
        query.space(format!("ORDER BY {}", order.join(", ")), args![]);
    }
    if let Some(limit) = find.limit {
        query.space("LIMIT ?", args![limit]);
    }
    if let Some(offset) = find.offset {
        query.space("OFFSET ?", args![offset]);
    }
    Ok(query)
}

/// Variables accepted by [`list_project_filter`].
pub struct ProjectFilter;

impl ProjectFilter {
    fn label(key: &str, value: &FilterValue, variable: &str) -> std::result::Result<Query, FilterError> {
        if key.is_empty() {
            return Err(FilterError::invalid_value(variable, "empty label key"));
        }
        match value {
            FilterValue::List(values) => Self::label_any(key, values, variable),
            value => Ok(qb::q(
                "project.setting->'labels'->>CAST(? AS TEXT) = ?",
                args![key, value.as_str(variable)?],
            )),
        }
    }

    fn label_any(
        key: &str,
        values: &[FilterValue],
        variable: &str,
    ) -> std::result::Result<Query, FilterError> {
        if values.is_empty() {
            return Err(FilterError::invalid_value(variable, "empty label filter"));
        }
        let values = compile::string_list(variable, values)?;
        Ok(qb::q(
            "project.setting->'labels'->>CAST(? AS TEXT) = ANY(?)",
            args![key, values],
        ))
    }
}

impl FilterSchema for ProjectFilter {
    fn equals(&self, variable: &str, value: &FilterValue) -> std::result::Result<Query, FilterError> {
        match variable {
            "name" => Ok(qb::q("project.name = ?", args![value.as_str(variable)?])),
            "resource_id" => Ok(qb::q(
                "project.resource_id = ?",
                args![value.as_str(variable)?],
            )),
            "exclude_default" => {
                if value.as_bool(variable)? {
                    Ok(qb::q("project.resource_id != ?", args![DEFAULT_PROJECT_ID]))
                } else {
                    Ok(qb::q("TRUE", args![]))
                }
            }
            "state" => {
                let state = State::parse_lenient(value.as_str(variable)?)
                    .map_err(|err| FilterError::invalid_value(variable, err.to_string()))?;
                Ok(qb::q("project.deleted = ?", args![state.is_deleted()]))
            }
            _ => match variable.strip_prefix("labels.") {
                Some(key) => Self::label(key, value, variable),
                None => Err(FilterError::UnsupportedVariable(variable.to_owned())),
            },
        }
    }

    fn matches(&self, variable: &str, pattern: &str) -> std::result::Result<Query, FilterError> {
        match variable {
            "name" => Ok(compile::matches_query("project.name", pattern)),
            "resource_id" => Ok(compile::matches_query("project.resource_id", pattern)),
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn in_list(
        &self,
        variable: &str,
        values: &[FilterValue],
    ) -> std::result::Result<Query, FilterError> {
        match variable.strip_prefix("labels.") {
            Some(key) if !key.is_empty() => Self::label_any(key, values, variable),
            _ => Err(FilterError::unsupported_operator("@in", variable)),
        }
    }
}

/// Compile a project list filter, e.g. `name.matches("pay") && labels.env in ["prod"]`.
pub fn list_project_filter(filter: &str) -> std::result::Result<Option<Query>, FilterError> {
    compile::compile_filter(filter, &ProjectFilter)
}

/// Order keys for project lists. Only `title` is orderable; it maps to `name`.
pub fn project_orders(order_by: &str) -> std::result::Result<Vec<OrderByKey>, FilterError> {
    let keys = parse_order_by(order_by)?;
    match keys.as_slice() {
        [] => Ok(Vec::new()),
        [key] if key.key == "title" => Ok(vec![OrderByKey {
            key: "name".to_owned(),
            sort_order: key.sort_order,
        }]),
        _ => Err(FilterError::invalid_expression(r#"only support order by "title""#)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrabase_filter::{SortOrder, Value};

    fn render(filter: &str) -> (String, Vec<Value>) {
        list_project_filter(filter).unwrap().unwrap().to_sql().unwrap()
    }

    #[test]
    fn filter_cases() {
        let cases: &[(&str, &str, Vec<Value>)] = &[
            (
                r#"name == "Payments""#,
                "(project.name = $1)",
                vec![Value::Text("Payments".into())],
            ),
            (
                r#"resource_id.matches("PAY_")"#,
                "(LOWER(project.resource_id) LIKE $1)",
                vec![Value::Text("%pay\\_%".into())],
            ),
            (
                "exclude_default == true",
                "(project.resource_id != $1)",
                vec![Value::Text("default".into())],
            ),
            ("exclude_default == false", "(TRUE)", vec![]),
            (
                r#"state == "STATE_ACTIVE""#,
                "(project.deleted = $1)",
                vec![Value::Bool(false)],
            ),
            (
                r#"labels.env == "prod""#,
                "(project.setting->'labels'->>CAST($1 AS TEXT) = $2)",
                vec![Value::Text("env".into()), Value::Text("prod".into())],
            ),
            (
                r#"labels.env in ["prod", "staging"]"#,
                "(project.setting->'labels'->>CAST($1 AS TEXT) = ANY($2))",
                vec![
                    Value::Text("env".into()),
                    Value::TextArray(vec!["prod".into(), "staging".into()]),
                ],
            ),
            (
                r#"name == "a" || (state == "DELETED" && exclude_default == true)"#,
                "((project.name = $1 OR (project.deleted = $2 AND project.resource_id != $3)))",
                vec![
                    Value::Text("a".into()),
                    Value::Bool(true),
                    Value::Text("default".into()),
                ],
            ),
        ];
        for (filter, sql, values) in cases {
            let (got_sql, got_values) = render(filter);
            assert_eq!(&got_sql, sql, "{filter}");
            assert_eq!(&got_values, values, "{filter}");
        }
    }

    #[test]
    fn filter_errors() {
        for (filter, expected) in [
            (r#"title == "a""#, "unsupport variable"),
            (r#"state == "ARCHIVED""#, "invalid state value"),
            ("exclude_default == 1", "expect bool"),
            (r#"name in ["a"]"#, "unexpected @in operator for name"),
            (r#"labels.env in [1]"#, "expect string"),
            (r#"description.matches("x")"#, "unsupport variable"),
        ] {
            let err = list_project_filter(filter).unwrap_err();
            assert!(err.to_string().contains(expected), "{filter}: {err}");
        }
    }

    #[test]
    fn label_key_is_never_spliced() {
        let (sql, values) = render(r#"labels.env == "x""#);
        assert!(!sql.contains("env"));
        assert_eq!(values[0], Value::Text("env".into()));
    }

    #[test]
    fn orders() {
        assert!(project_orders("").unwrap().is_empty());
        assert_eq!(
            project_orders("title desc").unwrap(),
            vec![OrderByKey {
                key: "name".into(),
                sort_order: SortOrder::Desc
            }]
        );
        for bad in ["name", "title, name"] {
            let err = project_orders(bad).unwrap_err();
            assert!(err.to_string().contains(r#"only support order by "title""#));
        }
    }

    #[test]
    fn list_query_orders_and_pages() {
        let find = FindProjectMessage {
            order_by_keys: project_orders("title desc").unwrap(),
            limit: Some(11),
            offset: Some(10),
            ..Default::default()
        };
        let (sql, values) = list_query(&find).unwrap().to_sql().unwrap();
        assert!(sql.ends_with(
            "WHERE TRUE AND project.deleted = $1 ORDER BY project.name DESC LIMIT $2 OFFSET $3"
        ));
        assert_eq!(values.len(), 3);

        let (sql, _) = list_query(&FindProjectMessage::default())
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.ends_with("ORDER BY project.resource_id"));
    }

    #[test]
    fn list_query_rejects_unknown_order_keys() {
        let find = FindProjectMessage {
            order_by_keys: vec![OrderByKey {
                key: "name; DROP TABLE project".into(),
                sort_order: SortOrder::Asc,
            }],
            ..Default::default()
        };
        let err = list_query(&find).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(err.to_string().contains("cannot order projects by"));

        let find = FindProjectMessage {
            order_by_keys: vec![OrderByKey {
                key: "resource_id".into(),
                sort_order: SortOrder::Asc,
            }],
            ..Default::default()
        };
        let (sql, _) = list_query(&find).unwrap().to_sql().unwrap();
        assert!(sql.ends_with("ORDER BY project.resource_id ASC"));
    }

    #[test]
    fn update_requires_a_field() {
        let err = update_query(&UpdateProjectMessage {
            resource_id: "p1".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: no fields to update");

        let (sql, _) = update_query(&UpdateProjectMessage {
            resource_id: "p1".into(),
            title: Some("New".into()),
            delete: Some(true),
            ..Default::default()
        })
        .unwrap()
        .to_sql()
        .unwrap();
        assert_eq!(
            sql,
            "UPDATE project SET name = $1, deleted = $2 WHERE resource_id = $3"
        );
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn create_soft_delete_and_purge() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::pool::create_pool(&url).await.expect("pool");
        crate::migrations::run(&pool).await.expect("migrations");
        let repo = ProjectRepo::new(&pool);

        let id = format!("purge-{}", chrono::Utc::now().timestamp_millis());
        repo.create(
            CreateProjectMessage {
                resource_id: id.clone(),
                title: "Purge me".into(),
                ..Default::default()
            },
            "owner@example.com",
        )
        .await
        .expect("create");

        let iam = crate::repos::policy::PolicyRepo::new(&pool)
            .get_project_iam_policy(&id)
            .await
            .expect("iam");
        assert_eq!(iam.policy.roles_of("users/owner@example.com"), vec![PROJECT_OWNER_ROLE]);

        assert!(repo.delete(&id).await.is_err(), "active project must not be purged");
        repo.update_projects(vec![UpdateProjectMessage {
            resource_id: id.clone(),
            delete: Some(true),
            ..Default::default()
        }])
        .await
        .expect("soft delete");
        repo.delete(&id).await.expect("purge");
        assert!(repo.get_by_id(&id).await.expect("get").is_none());
    }
}
