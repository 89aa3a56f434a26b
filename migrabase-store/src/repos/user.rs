//! User repository (`principal` table) and the user list filter

use chrono::{DateTime, Utc};
use migrabase_core::validation::validate_email;
use migrabase_core::{State, UserType};
use migrabase_filter::compile::{self, CompareOp, FilterSchema, FilterValue};
use migrabase_filter::{args, qb, FilterError, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const USER_COLUMNS: &str = "principal.id, principal.deleted, principal.created_at, principal.type, \
     principal.name, principal.email, principal.password_hash, principal.phone, principal.profile";

/// Profile payload (`principal.profile`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub last_login_time: Option<DateTime<Utc>>,
    pub last_change_password_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserMessage {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub user_type: UserType,
    pub password_hash: String,
    pub phone: String,
    pub profile: UserProfile,
    pub member_deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct FindUserMessage {
    pub id: Option<i64>,
    pub email: Option<String>,
    pub user_types: Option<Vec<UserType>>,
    pub show_deleted: bool,
    pub filter_q: Option<Query>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreateUserMessage {
    pub email: String,
    pub name: String,
    pub user_type: UserType,
    pub password_hash: String,
    pub phone: String,
    pub profile: UserProfile,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUserMessage {
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
    pub profile: Option<UserProfile>,
    pub delete: Option<bool>,
}

#[derive(FromRow)]
struct UserRow {
    id: i64,
    deleted: bool,
    created_at: DateTime<Utc>,
    #[sqlx(rename = "type")]
    user_type: String,
    name: String,
    email: String,
    password_hash: String,
    phone: String,
    profile: Json<UserProfile>,
}

impl TryFrom<UserRow> for UserMessage {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            email: row.email,
            name: row.name,
            user_type: row.user_type.parse()?,
            password_hash: row.password_hash,
            phone: row.phone,
            profile: row.profile.0,
            member_deleted: row.deleted,
            created_at: row.created_at,
        })
    }
}

/// User repository
pub struct UserRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> UserRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Get one user, deleted or not. `None` when nothing matches.
    pub async fn get(&self, find: &FindUserMessage) -> Result<Option<UserMessage>> {
        let find = FindUserMessage {
            show_deleted: true,
            ..find.clone()
        };
        let users = self.list(&find).await?;
        exec::at_most_one(users, "user")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<UserMessage>> {
        self.get(&FindUserMessage {
            id: Some(id),
            ..Default::default()
        })
        .await
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Option<UserMessage>> {
        self.get(&FindUserMessage {
            email: Some(email.to_lowercase()),
            ..Default::default()
        })
        .await
    }

    pub async fn list(&self, find: &FindUserMessage) -> Result<Vec<UserMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<UserRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(UserMessage::try_from).collect()
    }

    /// Create a user. The email is validated and lowercased.
    pub async fn create(&self, create: CreateUserMessage) -> Result<UserMessage> {
        let email = validate_email(&create.email)?;
        let mut query = qb::q(
            "INSERT INTO principal (type, name, email, password_hash, phone, profile) \
             VALUES (?, ?, ?, ?, ?, ?)",
            args![
                create.user_type.as_str(),
                create.name,
                email,
                create.password_hash,
                create.phone,
                serde_json::to_value(&create.profile)?
            ],
        );
        query.space(format!("RETURNING {}", USER_COLUMNS), args![]);

        let (sql, arguments) = exec::build(&query)?;
        let row: UserRow = sqlx::query_as_with(&sql, arguments)
            .fetch_one(self.pool)
            .await?;
        tracing::info!(user_id = row.id, "created user");
        row.try_into()
    }

    /// Update a user; `delete: Some(true)` soft-deletes, `Some(false)` restores.
    pub async fn update(&self, id: i64, patch: UpdateUserMessage) -> Result<UserMessage> {
        let mut set = Query::new();
        set.comma("updated_at = ?", args![Utc::now()]);
        if let Some(email) = patch.email {
            set.comma("email = ?", args![validate_email(&email)?]);
        }
        if let Some(name) = patch.name {
            set.comma("name = ?", args![name]);
        }
        if let Some(phone) = patch.phone {
            set.comma("phone = ?", args![phone]);
        }
        if let Some(hash) = patch.password_hash {
            set.comma("password_hash = ?", args![hash]);
        }
        if let Some(profile) = patch.profile {
            set.comma("profile = ?", args![serde_json::to_value(&profile)?]);
        }
        if let Some(delete) = patch.delete {
            set.comma("deleted = ?", args![delete]);
        }
        if set.len() == 1 {
            return Err(StoreError::invalid_argument("no fields to update"));
        }

        let query = qb::q(
            format!("UPDATE principal SET ? WHERE id = ? RETURNING {}", USER_COLUMNS),
            args![set, id],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: UserRow = sqlx::query_as_with(&sql, arguments)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("user", id))?;
        row.try_into()
    }

    /// Number of active users per type.
    pub async fn count_active_by_type(&self) -> Result<Vec<(UserType, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT type, COUNT(*)
            FROM principal
            WHERE deleted = FALSE
            GROUP BY type
            ORDER BY type
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_type, count)| Ok::<_, StoreError>((user_type.parse::<UserType>()?, count)))
            .collect()
    }
}

fn list_query(find: &FindUserMessage) -> Query {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(filter) = &find.filter_q {
        where_q.and("?", args![filter]);
    }
    if let Some(id) = find.id {
        where_q.and("principal.id = ?", args![id]);
    }
    if let Some(email) = &find.email {
        where_q.and("principal.email = ?", args![email]);
    }
    if let Some(types) = &find.user_types {
        let types: Vec<&str> = types.iter().map(UserType::as_str).collect();
        where_q.and("principal.type = ANY(?)", args![types]);
    }
    if !find.show_deleted {
        where_q.and("principal.deleted = ?", args![false]);
    }

    let mut query = qb::q(
        format!("SELECT {} FROM principal WHERE ?", USER_COLUMNS),
        args![where_q],
    );
    query.space("ORDER BY principal.type DESC, principal.id ASC", args![]);
    if let Some(limit) = find.limit {
        query.space("LIMIT ?", args![limit]);
    }
    if let Some(offset) = find.offset {
        query.space("OFFSET ?", args![offset]);
    }
    query
}

/// Variables accepted by [`list_user_filter`].
pub struct UserFilter;

impl FilterSchema for UserFilter {
    fn equals(&self, variable: &str, value: &FilterValue) -> std::result::Result<Query, FilterError> {
        match variable {
            "email" => Ok(qb::q(
                "principal.email = ?",
                args![value.as_str(variable)?.to_lowercase()],
            )),
            "name" => Ok(qb::q("principal.name = ?", args![value.as_str(variable)?])),
            "user_type" => {
                let user_type: UserType = compile::parse_enum(variable, value)?;
                Ok(qb::q("principal.type = ?", args![user_type.as_str()]))
            }
            "state" => {
                let state = State::parse_lenient(value.as_str(variable)?)
                    .map_err(|err| FilterError::invalid_value(variable, err.to_string()))?;
                Ok(qb::q("principal.deleted = ?", args![state.is_deleted()]))
            }
            "project" => {
                let project_id = compile::project_id(variable, value)?;
                Ok(qb::q(
                    "EXISTS (\
                     SELECT 1 FROM policy, jsonb_array_elements(policy.payload->'bindings') AS binding \
                     WHERE policy.resource_type = 'PROJECT' AND policy.type = 'IAM' \
                     AND policy.resource = ? \
                     AND binding->'members' ?? ('users/' || principal.email))",
                    args![migrabase_core::resource::format_project(&project_id)],
                ))
            }
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn matches(&self, variable: &str, pattern: &str) -> std::result::Result<Query, FilterError> {
        match variable {
            "email" => Ok(compile::matches_query("principal.email", pattern)),
            "name" => Ok(compile::matches_query("principal.name", pattern)),
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn in_list(
        &self,
        variable: &str,
        values: &[FilterValue],
    ) -> std::result::Result<Query, FilterError> {
        match variable {
            "user_type" => {
                let types = compile::enum_list::<UserType>(variable, values)?;
                Ok(qb::q("principal.type = ANY(?)", args![types]))
            }
            _ => Err(FilterError::unsupported_operator("@in", variable)),
        }
    }

    fn compare(
        &self,
        variable: &str,
        op: CompareOp,
        value: &FilterValue,
    ) -> std::result::Result<Query, FilterError> {
        match variable {
            "create_time" => compile::time_comparison("principal.created_at", variable, op, value),
            _ => Err(FilterError::unsupported_operator(op.function(), variable)),
        }
    }
}

/// Compile a user list filter, e.g. `user_type in ["USER"] && email.matches("@corp")`.
pub fn list_user_filter(filter: &str) -> std::result::Result<Option<Query>, FilterError> {
    compile::compile_filter(filter, &UserFilter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrabase_filter::Value;

    fn render(filter: &str) -> (String, Vec<Value>) {
        list_user_filter(filter).unwrap().unwrap().to_sql().unwrap()
    }

    #[test]
    fn filter_cases() {
        let cases: &[(&str, &str, Vec<Value>)] = &[
            (
                r#"email == "Dev@Example.com""#,
                "(principal.email = $1)",
                vec![Value::Text("dev@example.com".into())],
            ),
            (
                r#"name.matches("ann")"#,
                "(LOWER(principal.name) LIKE $1)",
                vec![Value::Text("%ann%".into())],
            ),
            (
                r#"user_type in ["USER", "SERVICE_ACCOUNT"]"#,
                "(principal.type = ANY($1))",
                vec![Value::TextArray(vec!["USER".into(), "SERVICE_ACCOUNT".into()])],
            ),
            (
                r#"state == "STATE_DELETED""#,
                "(principal.deleted = $1)",
                vec![Value::Bool(true)],
            ),
            (
                r#"user_type == "SYSTEM_BOT" && state == "ACTIVE""#,
                "((principal.type = $1 AND principal.deleted = $2))",
                vec![Value::Text("SYSTEM_BOT".into()), Value::Bool(false)],
            ),
        ];
        for (filter, sql, values) in cases {
            let (got_sql, got_values) = render(filter);
            assert_eq!(&got_sql, sql, "{filter}");
            assert_eq!(&got_values, values, "{filter}");
        }
    }

    #[test]
    fn project_membership_uses_jsonb_operator() {
        let (sql, values) = render(r#"project == "projects/p1""#);
        assert!(sql.contains("binding->'members' ? ('users/' || principal.email)"));
        assert!(sql.contains("policy.resource = $1"));
        assert_eq!(values, vec![Value::Text("projects/p1".into())]);
    }

    #[test]
    fn create_time_comparison() {
        let (sql, values) = render(r#"create_time >= "2024-01-01T00:00:00Z""#);
        assert_eq!(sql, "(principal.created_at >= $1)");
        assert!(matches!(values[0], Value::Timestamp(_)));
    }

    #[test]
    fn filter_errors() {
        for (filter, expected) in [
            (r#"user_type == "ROBOT""#, "invalid user type value"),
            (r#"state == "ARCHIVED""#, "invalid state value"),
            (r#"project == "p1""#, "invalid resource name"),
            (r#"email in ["a@b.c"]"#, "unexpected @in operator for email"),
            (r#"name > "a""#, "unexpected _>_ operator for name"),
            (r#"phone == "1""#, "unsupport variable"),
        ] {
            let err = list_user_filter(filter).unwrap_err();
            assert!(err.to_string().contains(expected), "{filter}: {err}");
        }
    }

    #[test]
    fn list_query_shape() {
        let find = FindUserMessage {
            user_types: Some(vec![UserType::User]),
            filter_q: list_user_filter(r#"name == "a""#).unwrap(),
            limit: Some(20),
            ..Default::default()
        };
        let (sql, values) = list_query(&find).to_sql().unwrap();
        assert!(sql.contains(
            "WHERE TRUE AND (principal.name = $1) AND principal.type = ANY($2) AND principal.deleted = $3"
        ));
        assert!(sql.ends_with("LIMIT $4"));
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn profile_uses_camel_case() {
        let profile = UserProfile {
            source: "LDAP".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["source"], "LDAP");
        assert!(json.get("lastLoginTime").is_some());
        let back: UserProfile = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(back, UserProfile::default());
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn create_update_and_get() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::pool::create_pool(&url).await.expect("pool");
        crate::migrations::run(&pool).await.expect("migrations");
        let repo = UserRepo::new(&pool);

        let email = format!("user-{}@example.com", Utc::now().timestamp_nanos_opt().unwrap());
        let user = repo
            .create(CreateUserMessage {
                email: email.to_uppercase(),
                name: "Test".into(),
                user_type: UserType::User,
                password_hash: String::new(),
                phone: String::new(),
                profile: UserProfile::default(),
            })
            .await
            .expect("create");
        assert_eq!(user.email, email);

        let updated = repo
            .update(
                user.id,
                UpdateUserMessage {
                    delete: Some(true),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert!(updated.member_deleted);

        let found = repo.get_by_email(&email).await.expect("get").expect("exists");
        assert_eq!(found.id, user.id);
    }
}
