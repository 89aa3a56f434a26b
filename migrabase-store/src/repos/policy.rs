//! Policy repository and IAM policy helpers

use chrono::{DateTime, Utc};
use migrabase_core::resource::format_project;
use migrabase_core::{PolicyResourceType, PolicyType};
use migrabase_filter::{args, qb, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const POLICY_COLUMNS: &str = "policy.updated_at, policy.resource_type, policy.resource, \
     policy.inherit_from_parent, policy.type, policy.payload, policy.enforce";

/// Role granted to whoever creates a project.
pub const PROJECT_OWNER_ROLE: &str = "roles/projectOwner";

/// IAM policy payload (`policy.payload` where `type = 'IAM'`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IamPolicy {
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Binding {
    pub role: String,
    pub members: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
    pub expression: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl IamPolicy {
    /// Give `member` exactly `roles`: add it where missing, drop it from every other binding.
    pub fn set_member_roles(&mut self, member: &str, roles: &[String]) {
        let mut pending: Vec<&String> = roles.iter().collect();
        for binding in &mut self.bindings {
            let index = binding.members.iter().position(|m| m == member);
            match (pending.iter().position(|r| **r == binding.role), index) {
                (Some(_), None) => binding.members.push(member.to_owned()),
                (None, Some(index)) => {
                    binding.members.remove(index);
                }
                _ => {}
            }
            pending.retain(|r| **r != binding.role);
        }
        for role in pending {
            self.bindings.push(Binding {
                role: role.clone(),
                members: vec![member.to_owned()],
                condition: None,
            });
        }
    }

    /// Roles bound to `member`.
    pub fn roles_of(&self, member: &str) -> Vec<&str> {
        self.bindings
            .iter()
            .filter(|b| b.members.iter().any(|m| m == member))
            .map(|b| b.role.as_str())
            .collect()
    }
}

/// An IAM policy with the etag callers must echo back when replacing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IamPolicyMessage {
    pub policy: IamPolicy,
    /// Empty when no policy row exists yet.
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyMessage {
    pub resource_type: PolicyResourceType,
    pub resource: String,
    pub policy_type: PolicyType,
    pub payload: serde_json::Value,
    pub inherit_from_parent: bool,
    pub enforce: bool,
    pub updated_at: DateTime<Utc>,
}

impl PolicyMessage {
    pub fn etag(&self) -> String {
        generate_etag(self.updated_at)
    }
}

/// Etag for a policy row: `updated_at` in unix milliseconds.
pub fn generate_etag(updated_at: DateTime<Utc>) -> String {
    updated_at.timestamp_millis().to_string()
}

#[derive(Debug, Clone, Default)]
pub struct FindPolicyMessage {
    pub resource_type: Option<PolicyResourceType>,
    pub resource: Option<String>,
    pub policy_type: Option<PolicyType>,
    /// Include policies with `enforce = false`.
    pub show_all: bool,
}

#[derive(Debug, Clone)]
pub struct UpsertPolicyMessage {
    pub resource_type: PolicyResourceType,
    pub resource: String,
    pub policy_type: PolicyType,
    pub payload: serde_json::Value,
    pub inherit_from_parent: bool,
    pub enforce: bool,
}

#[derive(Debug, Clone)]
pub struct UpdatePolicyMessage {
    pub resource_type: PolicyResourceType,
    pub resource: String,
    pub policy_type: PolicyType,
    pub payload: Option<serde_json::Value>,
    pub inherit_from_parent: Option<bool>,
    pub enforce: Option<bool>,
}

#[derive(FromRow)]
struct PolicyRow {
    updated_at: DateTime<Utc>,
    resource_type: String,
    resource: String,
    inherit_from_parent: bool,
    #[sqlx(rename = "type")]
    policy_type: String,
    payload: Json<serde_json::Value>,
    enforce: bool,
}

impl TryFrom<PolicyRow> for PolicyMessage {
    type Error = StoreError;

    fn try_from(row: PolicyRow) -> Result<Self> {
        Ok(Self {
            resource_type: row.resource_type.parse()?,
            resource: row.resource,
            policy_type: row.policy_type.parse()?,
            payload: row.payload.0,
            inherit_from_parent: row.inherit_from_parent,
            enforce: row.enforce,
            updated_at: row.updated_at,
        })
    }
}

/// Policy repository
pub struct PolicyRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> PolicyRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Get one policy, enforced or not.
    pub async fn get(&self, find: &FindPolicyMessage) -> Result<Option<PolicyMessage>> {
        let find = FindPolicyMessage {
            show_all: true,
            ..find.clone()
        };
        let policies = self.list(&find).await?;
        exec::at_most_one(policies, "policy")
    }

    pub async fn list(&self, find: &FindPolicyMessage) -> Result<Vec<PolicyMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<PolicyRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(PolicyMessage::try_from).collect()
    }

    /// Insert or replace the policy for `(resource_type, resource, type)`.
    pub async fn upsert(&self, upsert: &UpsertPolicyMessage) -> Result<PolicyMessage> {
        let mut tx = self.pool.begin().await?;
        let policy = upsert_policy_in(&mut *tx, upsert).await?;
        tx.commit().await?;
        Ok(policy)
    }

    pub async fn update(&self, patch: UpdatePolicyMessage) -> Result<PolicyMessage> {
        let mut set = Query::new();
        set.comma("updated_at = ?", args![Utc::now()]);
        if let Some(inherit) = patch.inherit_from_parent {
            set.comma("inherit_from_parent = ?", args![inherit]);
        }
        if let Some(payload) = patch.payload {
            set.comma("payload = ?", args![payload]);
        }
        if let Some(enforce) = patch.enforce {
            set.comma("enforce = ?", args![enforce]);
        }

        let query = qb::q(
            format!(
                "UPDATE policy SET ? WHERE resource_type = ? AND resource = ? AND type = ? RETURNING {}",
                POLICY_COLUMNS
            ),
            args![
                set,
                patch.resource_type.as_str(),
                &patch.resource,
                patch.policy_type.as_str()
            ],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: PolicyRow = sqlx::query_as_with(&sql, arguments)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| {
                StoreError::not_found(
                    "policy",
                    format!("{}/{}/{}", patch.resource_type, patch.resource, patch.policy_type),
                )
            })?;
        row.try_into()
    }

    pub async fn delete(
        &self,
        resource_type: PolicyResourceType,
        resource: &str,
        policy_type: PolicyType,
    ) -> Result<()> {
        sqlx::query("DELETE FROM policy WHERE resource_type = $1 AND resource = $2 AND type = $3")
            .bind(resource_type.as_str())
            .bind(resource)
            .bind(policy_type.as_str())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_workspace_iam_policy(&self) -> Result<IamPolicyMessage> {
        self.get_iam_policy(PolicyResourceType::Workspace, "").await
    }

    pub async fn get_project_iam_policy(&self, project_id: &str) -> Result<IamPolicyMessage> {
        self.get_iam_policy(PolicyResourceType::Project, &format_project(project_id))
            .await
    }

    /// The IAM policy on a resource; an empty policy with no etag when none is stored.
    pub async fn get_iam_policy(
        &self,
        resource_type: PolicyResourceType,
        resource: &str,
    ) -> Result<IamPolicyMessage> {
        let policy = self
            .get(&FindPolicyMessage {
                resource_type: Some(resource_type),
                resource: Some(resource.to_owned()),
                policy_type: Some(PolicyType::Iam),
                show_all: true,
            })
            .await?;
        match policy {
            None => Ok(IamPolicyMessage::default()),
            Some(policy) => Ok(IamPolicyMessage {
                etag: policy.etag(),
                policy: serde_json::from_value(policy.payload)?,
            }),
        }
    }

    /// Replace an IAM policy. A non-empty `etag` must match the stored one.
    pub async fn set_iam_policy(
        &self,
        resource_type: PolicyResourceType,
        resource: &str,
        policy: &IamPolicy,
        etag: &str,
    ) -> Result<IamPolicyMessage> {
        let current = self.get_iam_policy(resource_type, resource).await?;
        if !etag.is_empty() && etag != current.etag {
            tracing::warn!(resource, expected = %current.etag, got = %etag, "stale iam policy etag");
            return Err(StoreError::invalid_argument(format!(
                "etag mismatch for iam policy on {:?}",
                resource
            )));
        }

        let stored = self
            .upsert(&UpsertPolicyMessage {
                resource_type,
                resource: resource.to_owned(),
                policy_type: PolicyType::Iam,
                payload: serde_json::to_value(policy)?,
                inherit_from_parent: false,
                enforce: true,
            })
            .await?;
        Ok(IamPolicyMessage {
            etag: stored.etag(),
            policy: policy.clone(),
        })
    }

    /// Set or remove `member` on workspace roles so it holds exactly `roles`.
    pub async fn patch_workspace_iam_policy(
        &self,
        member: &str,
        roles: &[String],
    ) -> Result<IamPolicyMessage> {
        let mut current = self.get_workspace_iam_policy().await?;
        current.policy.set_member_roles(member, roles);
        self.set_iam_policy(PolicyResourceType::Workspace, "", &current.policy, "")
            .await
    }
}

/// Upsert inside a caller's transaction.
pub(crate) async fn upsert_policy_in(
    conn: &mut PgConnection,
    upsert: &UpsertPolicyMessage,
) -> Result<PolicyMessage> {
    let query = qb::q(
        format!(
            "INSERT INTO policy (resource_type, resource, inherit_from_parent, type, payload, enforce, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (resource_type, resource, type) DO UPDATE SET \
             inherit_from_parent = EXCLUDED.inherit_from_parent, \
             payload = EXCLUDED.payload, \
             enforce = EXCLUDED.enforce, \
             updated_at = EXCLUDED.updated_at \
             RETURNING {}",
            POLICY_COLUMNS
        ),
        args![
            upsert.resource_type.as_str(),
            &upsert.resource,
            upsert.inherit_from_parent,
            upsert.policy_type.as_str(),
            upsert.payload.clone(),
            upsert.enforce,
            Utc::now()
        ],
    );
    let (sql, arguments) = exec::build(&query)?;
    let row: PolicyRow = sqlx::query_as_with(&sql, arguments)
        .fetch_one(&mut *conn)
        .await?;
    tracing::debug!(
        resource_type = %upsert.resource_type,
        resource = %upsert.resource,
        policy_type = %upsert.policy_type,
        "upserted policy"
    );
    row.try_into()
}

fn list_query(find: &FindPolicyMessage) -> Query {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(resource_type) = find.resource_type {
        where_q.and("policy.resource_type = ?", args![resource_type.as_str()]);
    }
    if let Some(resource) = &find.resource {
        where_q.and("policy.resource = ?", args![resource]);
    }
    if let Some(policy_type) = find.policy_type {
        where_q.and("policy.type = ?", args![policy_type.as_str()]);
    }
    if !find.show_all {
        where_q.and("policy.enforce = ?", args![true]);
    }
    qb::q(
        format!("SELECT {} FROM policy WHERE ?", POLICY_COLUMNS),
        args![where_q],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use migrabase_filter::Value;

    fn binding(role: &str, members: &[&str]) -> Binding {
        Binding {
            role: role.into(),
            members: members.iter().map(|m| m.to_string()).collect(),
            condition: None,
        }
    }

    #[test]
    fn set_member_roles_adds_and_removes() {
        let mut policy = IamPolicy {
            bindings: vec![
                binding("roles/workspaceAdmin", &["users/a@x.io", "users/b@x.io"]),
                binding("roles/workspaceMember", &["users/b@x.io"]),
            ],
        };
        policy.set_member_roles(
            "users/a@x.io",
            &["roles/workspaceMember".into(), "roles/workspaceDBA".into()],
        );

        assert_eq!(policy.bindings[0].members, vec!["users/b@x.io"]);
        assert_eq!(
            policy.bindings[1].members,
            vec!["users/b@x.io", "users/a@x.io"]
        );
        assert_eq!(policy.bindings[2], binding("roles/workspaceDBA", &["users/a@x.io"]));

        let mut roles = policy.roles_of("users/a@x.io");
        roles.sort_unstable();
        assert_eq!(roles, vec!["roles/workspaceDBA", "roles/workspaceMember"]);
    }

    #[test]
    fn set_member_roles_with_no_roles_removes_member() {
        let mut policy = IamPolicy {
            bindings: vec![binding("roles/workspaceAdmin", &["users/a@x.io"])],
        };
        policy.set_member_roles("users/a@x.io", &[]);
        assert!(policy.bindings[0].members.is_empty());
        assert!(policy.roles_of("users/a@x.io").is_empty());
    }

    #[test]
    fn etag_is_unix_millis() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(generate_etag(t), "1704164645000");
    }

    #[test]
    fn iam_payload_json() {
        let policy = IamPolicy {
            bindings: vec![binding(PROJECT_OWNER_ROLE, &["users/a@x.io"])],
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"bindings": [{"role": "roles/projectOwner", "members": ["users/a@x.io"]}]})
        );
        let empty: IamPolicy = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(empty.bindings.is_empty());
    }

    #[test]
    fn list_query_only_enforced_by_default() {
        let find = FindPolicyMessage {
            resource_type: Some(PolicyResourceType::Project),
            policy_type: Some(PolicyType::Iam),
            ..Default::default()
        };
        let (sql, values) = list_query(&find).to_sql().unwrap();
        assert!(sql.ends_with(
            "WHERE TRUE AND policy.resource_type = $1 AND policy.type = $2 AND policy.enforce = $3"
        ));
        assert_eq!(values[2], Value::Bool(true));
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn iam_policy_etag_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::pool::create_pool(&url).await.expect("pool");
        crate::migrations::run(&pool).await.expect("migrations");
        let repo = PolicyRepo::new(&pool);

        let first = repo
            .patch_workspace_iam_policy("users/etag@x.io", &["roles/workspaceMember".into()])
            .await
            .expect("patch");
        assert!(!first.etag.is_empty());

        let err = repo
            .set_iam_policy(PolicyResourceType::Workspace, "", &first.policy, "1")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        repo.set_iam_policy(PolicyResourceType::Workspace, "", &first.policy, &first.etag)
            .await
            .expect("matching etag");
    }
}
