//! Parameterized partial updates.
//!
//! Updatable columns are enumerated per table by a [`Column`] type, so the
//! set of columns a caller may touch is fixed at compile time. Values are
//! always bound as parameters; only the static column and table names end
//! up in the SQL text.
//!
//! ```rust,ignore
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! enum UserColumn { Email, IsActive }
//!
//! impl Column for UserColumn {
//!     fn name(self) -> &'static str {
//!         match self {
//!             Self::Email => "email",
//!             Self::IsActive => "is_active",
//!         }
//!     }
//! }
//!
//! let stmt = UpdateBuilder::new("users")
//!     .set(UserColumn::Email, "a@example.com".to_string())
//!     .build("id", 7)
//!     .expect("at least one column set");
//! executor.execute_statement(&stmt)?;
//! ```

use std::fmt;

use rusqlite::types::Value;

/// A column that may appear in an UPDATE's SET clause.
pub trait Column: Copy + PartialEq + fmt::Debug {
    /// The column's SQL name.
    fn name(self) -> &'static str;
}

/// A set of optional field changes for one table.
pub trait Patch {
    /// The table's updatable columns.
    type Column: Column;

    /// The `(column, value)` pairs this patch sets, skipping absent fields.
    fn assignments(&self) -> Vec<(Self::Column, Value)>;
}

/// A finished UPDATE with positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    /// SQL text using `?N` placeholders.
    pub sql: String,
    /// Values bound to the placeholders, in order.
    pub params: Vec<Value>,
}

/// Builds an UPDATE from column/value assignments.
#[derive(Debug, Clone)]
pub struct UpdateBuilder<C: Column> {
    table: &'static str,
    assignments: Vec<(C, Value)>,
}

impl<C: Column> UpdateBuilder<C> {
    /// Starts an update for `table`.
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            assignments: Vec::new(),
        }
    }

    /// Starts an update for `table` from a patch's present fields.
    pub fn from_patch<P>(table: &'static str, patch: &P) -> Self
    where
        P: Patch<Column = C>,
    {
        patch
            .assignments()
            .into_iter()
            .fold(Self::new(table), |builder, (column, value)| {
                builder.set(column, value)
            })
    }

    /// Assigns `value` to `column`. Setting a column twice keeps the last value.
    pub fn set(mut self, column: C, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.assignments.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.assignments.push((column, value)),
        }
        self
    }

    /// Whether no column has been assigned.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Finishes the statement, restricted to rows where `key_column = key`.
    ///
    /// Returns `None` when nothing was assigned.
    pub fn build(self, key_column: &'static str, key: impl Into<Value>) -> Option<UpdateStatement> {
        if self.assignments.is_empty() {
            return None;
        }

        let mut params = Vec::with_capacity(self.assignments.len() + 1);
        let mut set_clauses = Vec::with_capacity(self.assignments.len());
        for (idx, (column, value)) in self.assignments.into_iter().enumerate() {
            set_clauses.push(format!("{} = ?{}", column.name(), idx + 1));
            params.push(value);
        }
        params.push(key.into());

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            self.table,
            set_clauses.join(", "),
            key_column,
            params.len()
        );

        Some(UpdateStatement { sql, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum UserColumn {
        Username,
        Email,
        IsActive,
    }

    impl Column for UserColumn {
        fn name(self) -> &'static str {
            match self {
                Self::Username => "username",
                Self::Email => "email",
                Self::IsActive => "is_active",
            }
        }
    }

    #[derive(Default)]
    struct UserPatch {
        username: Option<String>,
        email: Option<String>,
        is_active: Option<bool>,
    }

    impl Patch for UserPatch {
        type Column = UserColumn;

        fn assignments(&self) -> Vec<(UserColumn, Value)> {
            let mut out = Vec::new();
            if let Some(username) = &self.username {
                out.push((UserColumn::Username, Value::from(username.clone())));
            }
            if let Some(email) = &self.email {
                out.push((UserColumn::Email, Value::from(email.clone())));
            }
            if let Some(active) = self.is_active {
                out.push((UserColumn::IsActive, Value::from(active)));
            }
            out
        }
    }

    #[test]
    fn builds_parameterized_set_clause() {
        let patch = UserPatch {
            email: Some("x'; DROP TABLE users; --".to_string()),
            is_active: Some(false),
            ..UserPatch::default()
        };

        let stmt = UpdateBuilder::from_patch("users", &patch)
            .build("id", 42)
            .expect("patch has fields");

        assert_eq!(
            stmt.sql,
            "UPDATE users SET email = ?1, is_active = ?2 WHERE id = ?3"
        );
        assert_eq!(
            stmt.params,
            vec![
                Value::Text("x'; DROP TABLE users; --".to_string()),
                Value::Integer(0),
                Value::Integer(42),
            ]
        );
    }

    #[test]
    fn empty_patch_builds_nothing() {
        let builder = UpdateBuilder::from_patch("users", &UserPatch::default());
        assert!(builder.is_empty());
        assert!(builder.build("id", 1).is_none());
    }

    #[test]
    fn repeated_column_keeps_last_value() {
        let stmt = UpdateBuilder::new("users")
            .set(UserColumn::Username, "first".to_string())
            .set(UserColumn::Email, "e".to_string())
            .set(UserColumn::Username, "second".to_string())
            .build("id", 1)
            .expect("fields set");

        assert_eq!(stmt.sql, "UPDATE users SET username = ?1, email = ?2 WHERE id = ?3");
        assert_eq!(stmt.params[0], Value::Text("second".to_string()));
    }
}
