//! # Pagination and Ordering
//!
//! `get_all` style queries take a [`PageInput`]. Every repository publishes the
//! fields it can be ordered by as a list of [`OrderField`]s; [`Paginator`]
//! validates the request against that list and renders the `ORDER BY`, `OFFSET`
//! and `LIMIT` clauses.

use crate::errors::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use std::fmt;

/// Page size used when the caller does not ask for one
pub const DEFAULT_LIMIT: i64 = 20;

/// Limit value requesting every matching row
pub const TOTAL_LIMIT: i64 = -1;

/// Largest page size; bigger requests are clamped
pub const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Requested ordering: a public field name and a direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub order: OrderDirection,
}

impl OrderBy {
    /// Ascending order on `field`
    pub fn default_for(field: &str) -> Self {
        Self { field: field.to_string(), order: OrderDirection::Asc }
    }

    pub fn desc(field: &str) -> Self {
        Self { field: field.to_string(), order: OrderDirection::Desc }
    }
}

/// Paging parameters accepted by `get_all` queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageInput {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub order_by: Option<OrderBy>,
}

impl PageInput {
    /// Every row, default ordering
    pub fn all() -> Self {
        Self { limit: Some(TOTAL_LIMIT), ..Default::default() }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn ordered_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }
}

/// A field callers may order by and the SQL expression it sorts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderField {
    pub name: &'static str,
    pub column: &'static str,
}

impl OrderField {
    pub const fn new(name: &'static str, column: &'static str) -> Self {
        Self { name, column }
    }
}

/// Validated paging and ordering for one query
#[derive(Debug, Clone)]
pub struct Paginator {
    pub offset: i64,
    pub limit: i64,
    pub order_by: OrderBy,
    column: &'static str,
    tie_breaker: &'static str,
}

impl Paginator {
    /// Validate `page` against the fields an entity can be ordered by.
    ///
    /// `tie_breaker` is the qualified primary key column (`st.id`); it is appended
    /// to every ordering so repeated calls page through rows identically.
    pub fn new(
        page: &PageInput,
        default_order: OrderBy,
        fields: &[OrderField],
        tie_breaker: &'static str,
    ) -> Result<Self> {
        let offset = page.offset.unwrap_or(0);
        if offset < 0 {
            return Err(ForgeError::validation_field(
                format!("offset must not be negative, got {}", offset),
                "offset",
            ));
        }

        let limit = match page.limit {
            None => DEFAULT_LIMIT,
            Some(TOTAL_LIMIT) => TOTAL_LIMIT,
            Some(limit) if limit <= 0 => {
                return Err(ForgeError::validation_field(
                    format!("limit must be positive or {} for all rows, got {}", TOTAL_LIMIT, limit),
                    "limit",
                ));
            }
            Some(limit) => limit.min(MAX_LIMIT),
        };

        let order_by = page.order_by.clone().unwrap_or(default_order);
        let column = fields
            .iter()
            .find(|f| f.name == order_by.field)
            .map(|f| f.column)
            .ok_or_else(|| {
                ForgeError::validation_field(
                    format!(
                        "invalid order by field '{}', expected one of: {}",
                        order_by.field,
                        fields.iter().map(|f| f.name).collect::<Vec<_>>().join(", ")
                    ),
                    "order_by",
                )
            })?;

        Ok(Self { offset, limit, order_by, column, tie_breaker })
    }

    /// The SQL expression rows are sorted on
    pub fn order_column(&self) -> &'static str {
        self.column
    }

    /// Append `ORDER BY`, `OFFSET` and, unless every row was requested, `LIMIT`
    pub fn push_order_and_limit(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" ORDER BY ").push(self.column).push(" ").push(self.order_by.order.as_sql());
        if self.column != self.tie_breaker {
            qb.push(", ").push(self.tie_breaker).push(" ASC");
        }

        qb.push(" OFFSET ").push_bind(self.offset);
        if self.limit != TOTAL_LIMIT {
            qb.push(" LIMIT ").push_bind(self.limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIELDS: &[OrderField] = &[
        OrderField::new("name", "st.name"),
        OrderField::new("created", "st.created"),
        OrderField::new("id", "st.id"),
    ];

    fn render(paginator: &Paginator) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM site st");
        paginator.push_order_and_limit(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn test_defaults() {
        let p = Paginator::new(&PageInput::default(), OrderBy::default_for("created"), FIELDS, "st.id")
            .unwrap();
        assert_eq!(p.offset, 0);
        assert_eq!(p.limit, DEFAULT_LIMIT);
        assert_eq!(p.order_column(), "st.created");
        assert_eq!(
            render(&p),
            "SELECT * FROM site st ORDER BY st.created ASC, st.id ASC OFFSET $1 LIMIT $2"
        );
    }

    #[test]
    fn test_total_limit_omits_limit_clause() {
        let p = Paginator::new(&PageInput::all(), OrderBy::default_for("name"), FIELDS, "st.id")
            .unwrap();
        assert_eq!(p.limit, TOTAL_LIMIT);
        assert_eq!(render(&p), "SELECT * FROM site st ORDER BY st.name ASC, st.id ASC OFFSET $1");
    }

    #[test]
    fn test_ordering_by_id_has_no_tie_breaker() {
        let page = PageInput::default().ordered_by(OrderBy::desc("id"));
        let p = Paginator::new(&page, OrderBy::default_for("created"), FIELDS, "st.id").unwrap();
        assert_eq!(render(&p), "SELECT * FROM site st ORDER BY st.id DESC OFFSET $1 LIMIT $2");
    }

    #[test]
    fn test_limit_is_clamped() {
        let page = PageInput::default().with_limit(MAX_LIMIT * 5).with_offset(40);
        let p = Paginator::new(&page, OrderBy::default_for("created"), FIELDS, "st.id").unwrap();
        assert_eq!(p.limit, MAX_LIMIT);
        assert_eq!(p.offset, 40);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        for page in [
            PageInput::default().with_offset(-1),
            PageInput::default().with_limit(0),
            PageInput::default().with_limit(-2),
        ] {
            let err = Paginator::new(&page, OrderBy::default_for("created"), FIELDS, "st.id")
                .unwrap_err();
            assert!(matches!(err, ForgeError::Validation { .. }), "{:?}", page);
        }
    }

    #[test]
    fn test_unknown_order_field_rejected() {
        let page = PageInput::default().ordered_by(OrderBy::default_for("registration_token"));
        let err =
            Paginator::new(&page, OrderBy::default_for("created"), FIELDS, "st.id").unwrap_err();
        match err {
            ForgeError::Validation { message, field } => {
                assert!(message.contains("registration_token"));
                assert_eq!(field.as_deref(), Some("order_by"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_order_direction_serde() {
        let order: OrderBy = serde_json::from_str(r#"{"field":"name","order":"DESC"}"#).unwrap();
        assert_eq!(order, OrderBy::desc("name"));
        let order: OrderBy = serde_json::from_str(r#"{"field":"name"}"#).unwrap();
        assert_eq!(order.order, OrderDirection::Asc);
    }
}
