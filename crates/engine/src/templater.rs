//! Dialect strategies for SQL text.
//!
//! The edit engine and DDL generator never write identifier quotes,
//! placeholders or clause punctuation themselves; they ask a [`Templater`].
//! Each dialect overrides only the handful of primitives that differ and
//! inherits the statement skeletons.

use crate::driver::ObjectRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    pub fn parse(name: &str) -> Option<Dialect> {
        match name.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgsql" => Some(Dialect::Postgres),
            "mysql" | "mariadb" => Some(Dialect::MySql),
            "sqlite" | "sqlite3" => Some(Dialect::Sqlite),
            _ => None,
        }
    }

    pub fn templater(self) -> &'static dyn Templater {
        match self {
            Dialect::Postgres => &PostgresTemplater,
            Dialect::MySql => &MySqlTemplater,
            Dialect::Sqlite => &SqliteTemplater,
        }
    }
}

pub trait Templater: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Quote a single identifier, escaping embedded quote characters.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Placeholder for the `index`-th bound parameter (1-based).
    fn placeholder(&self, index: usize) -> String;

    fn supports_returning(&self) -> bool;

    /// Column suffix that marks a server-assigned identity in DDL.
    fn identity_suffix(&self) -> &'static str {
        ""
    }

    /// Tail of an INSERT that supplies no columns.
    fn default_values_clause(&self) -> &'static str {
        " DEFAULT VALUES"
    }

    fn returning_clause(&self) -> &'static str {
        if self.supports_returning() {
            " RETURNING *"
        } else {
            ""
        }
    }

    fn quote_object(&self, object: &ObjectRef) -> String {
        if object.schema.is_empty() {
            self.quote_identifier(&object.name)
        } else {
            format!(
                "{}.{}",
                self.quote_identifier(&object.schema),
                self.quote_identifier(&object.name)
            )
        }
    }

    /// `SELECT <cols|*> FROM <object> [WHERE <predicate>] [LIMIT n]`
    fn select_template(
        &self,
        object: &ObjectRef,
        columns: &[String],
        predicate: Option<&str>,
        limit: Option<u64>,
    ) -> String {
        let cols = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", cols, self.quote_object(object));
        if let Some(predicate) = predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql
    }

    /// `INSERT INTO <object>(<cols>) VALUES(<placeholders>) [RETURNING *]`
    fn insert_template(&self, object: &ObjectRef, columns: &[String], placeholders: &[String]) -> String {
        let target = self.quote_object(object);
        if columns.is_empty() {
            return format!(
                "INSERT INTO {}{}{}",
                target,
                self.default_values_clause(),
                self.returning_clause()
            );
        }
        let cols = columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {}({}) VALUES({}){}",
            target,
            cols,
            placeholders.join(", "),
            self.returning_clause()
        )
    }

    /// `UPDATE <object> SET <set clauses> WHERE <predicate> [RETURNING *]`
    fn update_template(&self, object: &ObjectRef, set_clauses: &[String], predicate: &str) -> String {
        format!(
            "UPDATE {} SET {} WHERE {}{}",
            self.quote_object(object),
            set_clauses.join(", "),
            predicate,
            self.returning_clause()
        )
    }

    /// `DELETE FROM <object> WHERE <predicate>`
    fn delete_template(&self, object: &ObjectRef, predicate: &str) -> String {
        format!("DELETE FROM {} WHERE {}", self.quote_object(object), predicate)
    }

    fn set_clause_template(&self, column: &str, placeholder: &str) -> String {
        format!("{} = {}", self.quote_identifier(column), placeholder)
    }

    /// One comparison of a WHERE clause; `None` compares against NULL.
    fn predicate_template(&self, column: &str, placeholder: Option<&str>) -> String {
        match placeholder {
            Some(ph) => format!("{} = {}", self.quote_identifier(column), ph),
            None => format!("{} IS NULL", self.quote_identifier(column)),
        }
    }

    fn where_template(&self, predicates: &[String]) -> String {
        predicates.join(" AND ")
    }
}

fn quote_with(ident: &str, quote: char) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push(quote);
    for ch in ident.chars() {
        if ch == quote {
            out.push(quote);
        }
        out.push(ch);
    }
    out.push(quote);
    out
}

pub struct PostgresTemplater;

impl Templater for PostgresTemplater {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_with(ident, '"')
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn supports_returning(&self) -> bool {
        true
    }

    fn identity_suffix(&self) -> &'static str {
        " GENERATED BY DEFAULT AS IDENTITY"
    }
}

pub struct MySqlTemplater;

impl Templater for MySqlTemplater {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_with(ident, '`')
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn supports_returning(&self) -> bool {
        false
    }

    fn identity_suffix(&self) -> &'static str {
        " AUTO_INCREMENT"
    }

    fn default_values_clause(&self) -> &'static str {
        " () VALUES ()"
    }
}

pub struct SqliteTemplater;

impl Templater for SqliteTemplater {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_with(ident, '"')
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn supports_returning(&self) -> bool {
        true
    }
}
