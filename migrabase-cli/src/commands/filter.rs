//! `migrabase filter`: compile a list filter and print the SQL it becomes.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use migrabase_filter::{FilterError, Placeholder, Query};
use migrabase_store::{
    list_access_grant_filter, list_issue_filter, list_project_filter, list_query_history_filter,
    list_rollout_filter, list_user_filter, project_orders,
};
use serde_json::json;
use tracing::debug;

#[derive(Parser, Debug)]
pub struct FilterArgs {
    /// Entity whose filter grammar to use
    #[arg(value_enum)]
    pub entity: Entity,

    /// CEL filter expression, e.g. 'state == "ACTIVE" && name.matches("prod")'
    pub expr: String,

    /// Placeholder style for bound arguments
    #[arg(long, value_enum, default_value_t = PlaceholderStyle::Dollar)]
    pub placeholder: PlaceholderStyle,

    /// Order keys, e.g. "title desc" (projects only)
    #[arg(long)]
    pub order_by: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Project,
    AccessGrant,
    QueryHistory,
    Rollout,
    Issue,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// $1, $2, ...
    Dollar,
    /// ? for every argument
    Question,
}

impl From<PlaceholderStyle> for Placeholder {
    fn from(style: PlaceholderStyle) -> Self {
        match style {
            PlaceholderStyle::Dollar => Placeholder::Dollar,
            PlaceholderStyle::Question => Placeholder::Question,
        }
    }
}

fn compile(entity: Entity, expr: &str) -> std::result::Result<Option<Query>, FilterError> {
    match entity {
        Entity::User => list_user_filter(expr),
        Entity::Project => list_project_filter(expr),
        Entity::AccessGrant => list_access_grant_filter(expr),
        Entity::QueryHistory => list_query_history_filter(expr),
        Entity::Rollout => list_rollout_filter(expr),
        Entity::Issue => list_issue_filter(expr),
    }
}

pub fn run_filter(args: FilterArgs) -> Result<()> {
    let query = compile(args.entity, &args.expr)
        .with_context(|| format!("invalid {:?} filter", args.entity))?;

    let order_by = match &args.order_by {
        Some(order_by) => {
            if args.entity != Entity::Project {
                bail!("--order-by is only supported for projects");
            }
            project_orders(order_by).context("invalid --order-by")?
        }
        None => Vec::new(),
    };

    let (sql, values) = match &query {
        Some(query) => query
            .to_sql_with(args.placeholder.into())
            .context("failed to render filter")?,
        None => ("TRUE".to_string(), Vec::new()),
    };
    debug!(args = values.len(), "compiled filter");

    if args.json {
        let output = json!({
            "sql": sql,
            "args": values.iter().map(|v| v.to_json()).collect::<Vec<_>>(),
            "order_by": order_by
                .iter()
                .map(|key| json!({"key": key.key, "order": key.sort_order.as_sql()}))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", sql);
    for (i, value) in values.iter().enumerate() {
        println!("  ${} = {}", i + 1, value.to_json());
    }
    if !order_by.is_empty() {
        let keys: Vec<String> = order_by
            .iter()
            .map(|key| format!("{} {}", key.key, key.sort_order.as_sql()))
            .collect();
        println!("ORDER BY {}", keys.join(", "));
    }
    Ok(())
}
