//! Resource names
//!
//! Public identifiers look like `projects/{id}/issues/{uid}`: alternating
//! collection prefixes and ids. Filters and API callers pass these strings;
//! the store works with the bare ids.

use crate::error::{CoreError, Result};

pub const PROJECT_PREFIX: &str = "projects/";
pub const USER_PREFIX: &str = "users/";
pub const INSTANCE_PREFIX: &str = "instances/";
pub const DATABASE_PREFIX: &str = "databases/";
pub const ENVIRONMENT_PREFIX: &str = "environments/";
pub const ISSUE_PREFIX: &str = "issues/";
pub const PLAN_PREFIX: &str = "plans/";
pub const ROLLOUT_PREFIX: &str = "rollouts/";
pub const WEBHOOK_PREFIX: &str = "webhooks/";
pub const SHEET_PREFIX: &str = "sheets/";
pub const ROLE_PREFIX: &str = "roles/";
pub const ACCESS_GRANT_PREFIX: &str = "accessGrants/";

/// Project that owns databases nobody assigned elsewhere. Never purged.
pub const DEFAULT_PROJECT_ID: &str = "default";

/// Split `name` into the ids that follow each prefix, in order.
///
/// `get_name_parent_tokens("projects/p1/issues/7", &[PROJECT_PREFIX, ISSUE_PREFIX])`
/// yields `["p1", "7"]`.
pub fn get_name_parent_tokens(name: &str, prefixes: &[&str]) -> Result<Vec<String>> {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.len() != 2 * prefixes.len() {
        return Err(CoreError::resource_name(
            name,
            format!("expected {} segments", 2 * prefixes.len()),
        ));
    }

    let mut tokens = Vec::with_capacity(prefixes.len());
    for (i, prefix) in prefixes.iter().enumerate() {
        let collection = prefix.trim_end_matches('/');
        if parts[2 * i] != collection {
            return Err(CoreError::resource_name(
                name,
                format!("expected prefix {:?}", prefix),
            ));
        }
        let id = parts[2 * i + 1];
        if id.is_empty() {
            return Err(CoreError::resource_name(
                name,
                format!("empty id after {:?}", prefix),
            ));
        }
        tokens.push(id.to_owned());
    }
    Ok(tokens)
}

fn single_token(name: &str, prefix: &str) -> Result<String> {
    let mut tokens = get_name_parent_tokens(name, &[prefix])?;
    Ok(tokens.remove(0))
}

fn parse_uid(name: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| CoreError::resource_name(name, format!("{:?} is not a numeric id", raw)))
}

/// `projects/{id}` → `id`
pub fn get_project_id(name: &str) -> Result<String> {
    single_token(name, PROJECT_PREFIX)
}

/// `users/{email}` → `email`
pub fn get_user_email(name: &str) -> Result<String> {
    let email = single_token(name, USER_PREFIX)?;
    if !email.contains('@') {
        return Err(CoreError::resource_name(name, "user id must be an email"));
    }
    Ok(email)
}

/// `instances/{id}` → `id`
pub fn get_instance_id(name: &str) -> Result<String> {
    single_token(name, INSTANCE_PREFIX)
}

/// `environments/{id}` → `id`
pub fn get_environment_id(name: &str) -> Result<String> {
    single_token(name, ENVIRONMENT_PREFIX)
}

/// `instances/{instance}/databases/{database}` → `(instance, database)`
pub fn get_instance_database_id(name: &str) -> Result<(String, String)> {
    let tokens = get_name_parent_tokens(name, &[INSTANCE_PREFIX, DATABASE_PREFIX])?;
    Ok((tokens[0].clone(), tokens[1].clone()))
}

/// `projects/{project}/issues/{uid}` → `(project, uid)`
pub fn get_project_id_issue_uid(name: &str) -> Result<(String, i64)> {
    let tokens = get_name_parent_tokens(name, &[PROJECT_PREFIX, ISSUE_PREFIX])?;
    let uid = parse_uid(name, &tokens[1])?;
    Ok((tokens[0].clone(), uid))
}

/// `projects/{project}/plans/{uid}` → `(project, uid)`
pub fn get_project_id_plan_id(name: &str) -> Result<(String, i64)> {
    let tokens = get_name_parent_tokens(name, &[PROJECT_PREFIX, PLAN_PREFIX])?;
    let uid = parse_uid(name, &tokens[1])?;
    Ok((tokens[0].clone(), uid))
}

/// `projects/{project}/rollouts/{uid}` → `(project, plan uid)`
pub fn get_project_id_rollout_id(name: &str) -> Result<(String, i64)> {
    let tokens = get_name_parent_tokens(name, &[PROJECT_PREFIX, ROLLOUT_PREFIX])?;
    let uid = parse_uid(name, &tokens[1])?;
    Ok((tokens[0].clone(), uid))
}

/// `projects/{project}/webhooks/{uid}` → `(project, uid)`
pub fn get_project_id_webhook_id(name: &str) -> Result<(String, i64)> {
    let tokens = get_name_parent_tokens(name, &[PROJECT_PREFIX, WEBHOOK_PREFIX])?;
    let uid = parse_uid(name, &tokens[1])?;
    Ok((tokens[0].clone(), uid))
}

/// `projects/{project}/sheets/{sha256}` → `(project, sha256)`
pub fn get_project_id_sheet_sha256(name: &str) -> Result<(String, String)> {
    let tokens = get_name_parent_tokens(name, &[PROJECT_PREFIX, SHEET_PREFIX])?;
    let sha = &tokens[1];
    if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::resource_name(name, "sheet id must be a sha256 hex digest"));
    }
    Ok((tokens[0].clone(), sha.to_lowercase()))
}

pub fn format_project(id: &str) -> String {
    format!("{}{}", PROJECT_PREFIX, id)
}

pub fn format_user_email(email: &str) -> String {
    format!("{}{}", USER_PREFIX, email)
}

pub fn format_instance(id: &str) -> String {
    format!("{}{}", INSTANCE_PREFIX, id)
}

pub fn format_database(instance: &str, database: &str) -> String {
    format!("{}{}/{}{}", INSTANCE_PREFIX, instance, DATABASE_PREFIX, database)
}

pub fn format_issue(project: &str, uid: i64) -> String {
    format!("{}{}/{}{}", PROJECT_PREFIX, project, ISSUE_PREFIX, uid)
}

pub fn format_plan(project: &str, uid: i64) -> String {
    format!("{}{}/{}{}", PROJECT_PREFIX, project, PLAN_PREFIX, uid)
}

pub fn format_rollout(project: &str, uid: i64) -> String {
    format!("{}{}/{}{}", PROJECT_PREFIX, project, ROLLOUT_PREFIX, uid)
}

pub fn format_role(id: &str) -> String {
    format!("{}{}", ROLE_PREFIX, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_names() {
        assert_eq!(get_project_id("projects/p1").unwrap(), "p1");
        assert_eq!(
            get_project_id_issue_uid("projects/p1/issues/42").unwrap(),
            ("p1".to_string(), 42)
        );
        assert_eq!(
            get_instance_database_id("instances/prod/databases/app").unwrap(),
            ("prod".to_string(), "app".to_string())
        );
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(get_project_id("projects/").is_err());
        assert!(get_project_id("project/p1").is_err());
        assert!(get_project_id("projects/p1/issues/1").is_err());
        assert!(get_project_id_issue_uid("projects/p1/issues/abc").is_err());
        assert!(get_user_email("users/not-an-email").is_err());
    }

    #[test]
    fn user_email_round_trip() {
        let name = format_user_email("dev@example.com");
        assert_eq!(name, "users/dev@example.com");
        assert_eq!(get_user_email(&name).unwrap(), "dev@example.com");
    }

    #[test]
    fn sheet_sha_is_checked() {
        let sha = "a".repeat(64);
        let name = format!("projects/p1/sheets/{}", sha);
        assert_eq!(get_project_id_sheet_sha256(&name).unwrap().1, sha);
        assert!(get_project_id_sheet_sha256("projects/p1/sheets/xyz").is_err());
    }
}
