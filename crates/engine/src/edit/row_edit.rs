use std::collections::BTreeMap;

use crate::driver::QueryResult;
use crate::templater::Templater;
use crate::value::DbValue;

use super::{EditError, EditTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Create,
    Update,
    Delete,
}

/// One changed cell of a pending update.
#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub column: usize,
    /// Display text of the value before the first staged change.
    pub old_display: String,
    pub new_value: DbValue,
}

/// A pending change to one row. Maps are keyed by column index.
#[derive(Debug, Clone, PartialEq)]
pub enum RowEdit {
    /// Missing columns take the server default.
    Create {
        row_id: i64,
        values: BTreeMap<usize, DbValue>,
    },
    Update {
        row_id: i64,
        cells: BTreeMap<usize, CellUpdate>,
    },
    Delete {
        row_id: i64,
    },
}

/// Parameterized SQL ready for a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<DbValue>,
}

impl RowEdit {
    pub fn create(row_id: i64) -> Self {
        RowEdit::Create {
            row_id,
            values: BTreeMap::new(),
        }
    }

    pub fn update(row_id: i64, cell: CellUpdate) -> Self {
        let mut cells = BTreeMap::new();
        cells.insert(cell.column, cell);
        RowEdit::Update { row_id, cells }
    }

    pub fn delete(row_id: i64) -> Self {
        RowEdit::Delete { row_id }
    }

    pub fn row_id(&self) -> i64 {
        match self {
            RowEdit::Create { row_id, .. }
            | RowEdit::Update { row_id, .. }
            | RowEdit::Delete { row_id } => *row_id,
        }
    }

    pub fn kind(&self) -> EditKind {
        match self {
            RowEdit::Create { .. } => EditKind::Create,
            RowEdit::Update { .. } => EditKind::Update,
            RowEdit::Delete { .. } => EditKind::Delete,
        }
    }

    /// Render the statement that applies this edit. Update and Delete locate
    /// the row by the key values it had when it was fetched.
    pub fn render(&self, table: &EditTable, templater: &dyn Templater) -> Result<Statement, EditError> {
        let mut params = Vec::new();
        let sql = match self {
            RowEdit::Create { values, .. } => {
                let mut columns = Vec::with_capacity(values.len());
                let mut placeholders = Vec::with_capacity(values.len());
                for (idx, value) in values {
                    columns.push(table.column(*idx)?.name.clone());
                    params.push(value.clone());
                    placeholders.push(templater.placeholder(params.len()));
                }
                templater.insert_template(&table.object, &columns, &placeholders)
            }
            RowEdit::Update { row_id, cells } => {
                let original = table.row(*row_id).ok_or(EditError::RowNotFound(*row_id))?;
                let mut sets = Vec::with_capacity(cells.len());
                for cell in cells.values() {
                    let column = table.column(cell.column)?;
                    params.push(cell.new_value.clone());
                    sets.push(templater.set_clause_template(&column.name, &templater.placeholder(params.len())));
                }
                let predicate = key_predicate(table, &original.values, templater, &mut params);
                templater.update_template(&table.object, &sets, &predicate)
            }
            RowEdit::Delete { row_id } => {
                let original = table.row(*row_id).ok_or(EditError::RowNotFound(*row_id))?;
                let predicate = key_predicate(table, &original.values, templater, &mut params);
                templater.delete_template(&table.object, &predicate)
            }
        };
        Ok(Statement { sql, params })
    }

    /// SELECT that re-reads the row after this edit was applied, for
    /// dialects without RETURNING. `None` when there is nothing to read.
    pub fn readback(
        &self,
        table: &EditTable,
        templater: &dyn Templater,
        outcome: &QueryResult,
    ) -> Result<Option<Statement>, EditError> {
        let mut params = Vec::new();
        let predicate = match self {
            RowEdit::Delete { .. } => return Ok(None),
            RowEdit::Create { values, .. } => {
                match (table.identity_column(), outcome.last_insert_id) {
                    (Some(identity), Some(id)) => {
                        params.push(DbValue::Integer(id));
                        let column = table.column(identity)?;
                        templater.predicate_template(&column.name, Some(&templater.placeholder(1)))
                    }
                    _ if values.is_empty() => return Ok(None),
                    _ => {
                        let mut preds = Vec::with_capacity(values.len());
                        for (idx, value) in values {
                            let column = table.column(*idx)?;
                            preds.push(push_predicate(&column.name, value, templater, &mut params));
                        }
                        templater.where_template(&preds)
                    }
                }
            }
            RowEdit::Update { row_id, cells } => {
                let original = table.row(*row_id).ok_or(EditError::RowNotFound(*row_id))?;
                let mut current = original.values.clone();
                for cell in cells.values() {
                    if let Some(slot) = current.get_mut(cell.column) {
                        *slot = cell.new_value.clone();
                    }
                }
                key_predicate(table, &current, templater, &mut params)
            }
        };
        Ok(Some(Statement {
            sql: templater.select_template(&table.object, &[], Some(&predicate), Some(1)),
            params,
        }))
    }
}

fn push_predicate(column: &str, value: &DbValue, templater: &dyn Templater, params: &mut Vec<DbValue>) -> String {
    if value.is_null() {
        templater.predicate_template(column, None)
    } else {
        params.push(value.clone());
        templater.predicate_template(column, Some(&templater.placeholder(params.len())))
    }
}

fn key_predicate(table: &EditTable, values: &[DbValue], templater: &dyn Templater, params: &mut Vec<DbValue>) -> String {
    let mut preds = Vec::new();
    for idx in table.key_columns() {
        let column = &table.columns[idx].name;
        let pred = match values.get(idx) {
            Some(value) => push_predicate(column, value, templater, params),
            None => templater.predicate_template(column, None),
        };
        preds.push(pred);
    }
    templater.where_template(&preds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ColumnMeta, ObjectRef};
    use crate::templater::Dialect;

    fn users() -> EditTable {
        let mut id = ColumnMeta::named("id", 0);
        id.is_key = true;
        id.is_identity = true;
        EditTable::new(
            ObjectRef::new("", "users"),
            vec![id, ColumnMeta::named("name", 1)],
            vec![vec![DbValue::Integer(7), DbValue::Text("Bob".into())]],
        )
    }

    fn rename(row_id: i64, to: &str) -> RowEdit {
        RowEdit::update(
            row_id,
            CellUpdate {
                column: 1,
                old_display: "Bob".into(),
                new_value: DbValue::Text(to.into()),
            },
        )
    }

    #[test]
    fn test_render_update_postgres() {
        let stmt = rename(0, "Rob").render(&users(), Dialect::Postgres.templater()).unwrap();
        assert_eq!(stmt.sql, "UPDATE \"users\" SET \"name\" = $1 WHERE \"id\" = $2 RETURNING *");
        assert_eq!(stmt.params, vec![DbValue::Text("Rob".into()), DbValue::Integer(7)]);
    }

    #[test]
    fn test_render_create_with_values() {
        let mut values = BTreeMap::new();
        values.insert(1, DbValue::Text("Alice".into()));
        let edit = RowEdit::Create { row_id: 1, values };
        let stmt = edit.render(&users(), Dialect::MySql.templater()).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO `users`(`name`) VALUES(?)");
        assert_eq!(stmt.params, vec![DbValue::Text("Alice".into())]);
    }

    #[test]
    fn test_render_delete_with_null_key() {
        let table = EditTable::new(
            ObjectRef::new("", "t"),
            vec![ColumnMeta::named("a", 0), ColumnMeta::named("b", 1)],
            vec![vec![DbValue::Integer(1), DbValue::Null]],
        );
        let stmt = RowEdit::delete(0).render(&table, Dialect::Postgres.templater()).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM \"t\" WHERE \"a\" = $1 AND \"b\" IS NULL");
        assert_eq!(stmt.params, vec![DbValue::Integer(1)]);
    }

    #[test]
    fn test_render_missing_row() {
        let err = RowEdit::delete(9).render(&users(), Dialect::Sqlite.templater()).unwrap_err();
        assert_eq!(err, EditError::RowNotFound(9));
    }

    #[test]
    fn test_readback_create_uses_identity() {
        let outcome = QueryResult {
            last_insert_id: Some(42),
            rows_affected: 1,
            ..Default::default()
        };
        let stmt = RowEdit::create(1)
            .readback(&users(), Dialect::MySql.templater(), &outcome)
            .unwrap()
            .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM `users` WHERE `id` = ? LIMIT 1");
        assert_eq!(stmt.params, vec![DbValue::Integer(42)]);
    }

    #[test]
    fn test_readback_update_uses_new_key_values() {
        let edit = RowEdit::update(
            0,
            CellUpdate {
                column: 0,
                old_display: "7".into(),
                new_value: DbValue::Integer(8),
            },
        );
        let stmt = edit
            .readback(&users(), Dialect::MySql.templater(), &QueryResult::default())
            .unwrap()
            .unwrap();
        assert_eq!(stmt.params, vec![DbValue::Integer(8)]);
        assert!(RowEdit::delete(0)
            .readback(&users(), Dialect::MySql.templater(), &QueryResult::default())
            .unwrap()
            .is_none());
    }
}
