//! SELECT assembly for list endpoints. Only `&'static str` fragments reach
//! the SQL text: sort columns are resolved through a per-endpoint allow-list
//! and every caller-supplied value is a bound parameter.

use crate::error::{CalcError, CalcResult};
use rusqlite::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn parse(raw: Option<&str>) -> CalcResult<Self> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("asc") => Ok(SortDir::Asc),
            Some("desc") => Ok(SortDir::Desc),
            Some(other) => Err(CalcError::bad_params(format!(
                "sortDir must be one of: asc, desc (got {})",
                other
            ))),
        }
    }

    fn sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// `(wire name, SQL expression)` pairs an endpoint is willing to sort by.
pub type SortColumns = &'static [(&'static str, &'static str)];

#[derive(Debug, Clone, Copy)]
pub struct OrderBy {
    column: &'static str,
    dir: SortDir,
    tiebreak: &'static str,
}

impl OrderBy {
    pub fn parse(
        sort_by: Option<&str>,
        sort_dir: Option<&str>,
        allowed: SortColumns,
        tiebreak: &'static str,
    ) -> CalcResult<Self> {
        let dir = SortDir::parse(sort_dir)?;
        let column = match sort_by {
            None => allowed
                .first()
                .map(|(_, sql)| *sql)
                .ok_or_else(|| CalcError::bad_params("no sortable columns"))?,
            Some(key) => allowed
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, sql)| *sql)
                .ok_or_else(|| {
                    let names: Vec<&str> = allowed.iter().map(|(n, _)| *n).collect();
                    CalcError::bad_params(format!(
                        "sortBy must be one of: {}",
                        names.join(", ")
                    ))
                })?,
        };
        Ok(Self {
            column,
            dir,
            tiebreak,
        })
    }

    fn sql(&self) -> String {
        format!(
            "ORDER BY {} {}, {} ASC",
            self.column,
            self.dir.sql(),
            self.tiebreak
        )
    }
}

#[derive(Debug, Clone)]
pub struct SelectBuilder {
    base: &'static str,
    clauses: Vec<&'static str>,
    binds: Vec<Value>,
    order: Option<OrderBy>,
    limit: Option<i64>,
}

impl SelectBuilder {
    /// `base` is everything up to (not including) the WHERE clause.
    pub fn new(base: &'static str) -> Self {
        Self {
            base,
            clauses: Vec::new(),
            binds: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Adds `clause` (with exactly one `?`) ANDed into the WHERE clause.
    pub fn filter(mut self, clause: &'static str, value: impl Into<Value>) -> Self {
        self.clauses.push(clause);
        self.binds.push(value.into());
        self
    }

    /// Adds a parameterless condition.
    pub fn condition(mut self, clause: &'static str) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn build(self) -> (String, Vec<Value>) {
        let mut sql = String::from(self.base);
        if !self.clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.clauses.join(" AND "));
        }
        if let Some(order) = self.order {
            sql.push(' ');
            sql.push_str(&order.sql());
        }
        let mut binds = self.binds;
        if let Some(n) = self.limit {
            sql.push_str(" LIMIT ?");
            binds.push(Value::Integer(n));
        }
        (sql, binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: SortColumns = &[("percentage", "cr.percentage"), ("status", "cr.status")];

    #[test]
    fn builds_parameterized_select() {
        let order = OrderBy::parse(Some("status"), Some("DESC"), COLUMNS, "cr.student_id")
            .expect("order");
        let (sql, binds) = SelectBuilder::new("SELECT * FROM course_results cr")
            .filter("cr.course_offering_id = ?", "o1".to_string())
            .condition("cr.is_published = 1")
            .order_by(order)
            .limit(10)
            .build();
        assert_eq!(
            sql,
            "SELECT * FROM course_results cr WHERE cr.course_offering_id = ? AND cr.is_published = 1 ORDER BY cr.status DESC, cr.student_id ASC LIMIT ?"
        );
        assert_eq!(binds, vec![Value::Text("o1".into()), Value::Integer(10)]);
    }

    #[test]
    fn default_sort_is_first_allowed_column() {
        let order = OrderBy::parse(None, None, COLUMNS, "cr.id").expect("order");
        let (sql, _) = SelectBuilder::new("SELECT 1").order_by(order).build();
        assert!(sql.ends_with("ORDER BY cr.percentage ASC, cr.id ASC"));
    }

    #[test]
    fn rejects_unlisted_tokens() {
        let e = OrderBy::parse(Some("percentage; DROP TABLE x"), None, COLUMNS, "cr.id")
            .unwrap_err();
        assert_eq!(e.code(), "bad_params");
        assert!(SortDir::parse(Some("sideways")).is_err());
    }
}
