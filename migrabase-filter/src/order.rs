//! `order_by` parsing: `"title desc, create_time"`

use crate::error::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByKey {
    pub key: String,
    pub sort_order: SortOrder,
}

impl OrderByKey {
    /// `column DIRECTION`, for an ORDER BY list.
    pub fn to_sql(&self, column: &str) -> String {
        format!("{} {}", column, self.sort_order.as_sql())
    }
}

/// Parse a comma-separated `order_by` string. Direction defaults to ascending.
pub fn parse_order_by(order_by: &str) -> Result<Vec<OrderByKey>, FilterError> {
    if order_by.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut keys = Vec::new();
    for item in order_by.split(',') {
        let mut words = item.split_whitespace();
        let Some(key) = words.next() else {
            return Err(FilterError::invalid_expression(format!(
                "invalid order_by {:?}: empty key",
                order_by
            )));
        };
        let sort_order = match words.next() {
            None => SortOrder::Asc,
            Some(dir) if dir.eq_ignore_ascii_case("asc") => SortOrder::Asc,
            Some(dir) if dir.eq_ignore_ascii_case("desc") => SortOrder::Desc,
            Some(dir) => {
                return Err(FilterError::invalid_expression(format!(
                    "invalid order_by {:?}: unknown direction {:?}",
                    order_by, dir
                )))
            }
        };
        if let Some(extra) = words.next() {
            return Err(FilterError::invalid_expression(format!(
                "invalid order_by {:?}: unexpected {:?}",
                order_by, extra
            )));
        }
        keys.push(OrderByKey {
            key: key.to_owned(),
            sort_order,
        });
    }
    Ok(keys)
}
