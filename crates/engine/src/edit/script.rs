use super::{EditError, EditKind, RowEdit};

/// Pending edits in staging order, at most one per row id.
///
/// Merge policy when a row already has a pending edit:
///
/// | pending | staged | result                                   |
/// |---------|--------|------------------------------------------|
/// | Update  | Update | cells merged, later values win, slot kept |
/// | Update  | Delete | Update dropped, Delete appended           |
/// | Create  | Update | values merged into the Create             |
/// | Create  | Delete | Create dropped, nothing recorded          |
/// | Delete  | any    | rejected                                  |
/// | any     | Create | rejected                                  |
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditScript {
    edits: Vec<RowEdit>,
}

impl EditScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RowEdit> {
        self.edits.iter()
    }

    pub fn edits(&self) -> &[RowEdit] {
        &self.edits
    }

    pub fn get(&self, row_id: i64) -> Option<&RowEdit> {
        self.edits.iter().find(|e| e.row_id() == row_id)
    }

    fn position(&self, row_id: i64) -> Option<usize> {
        self.edits.iter().position(|e| e.row_id() == row_id)
    }

    /// Stage `edit`, applying the merge policy. Returns the row's resulting
    /// pending edit, or `None` when the edit cancelled a pending Create.
    pub fn stage(&mut self, edit: RowEdit) -> Result<Option<&RowEdit>, EditError> {
        let row_id = edit.row_id();
        let pos = match self.position(row_id) {
            Some(pos) => pos,
            None => {
                self.edits.push(edit);
                return Ok(self.edits.last());
            }
        };

        match (self.edits[pos].kind(), edit) {
            (EditKind::Delete, _) => Err(EditError::RowDeleted(row_id)),
            (_, RowEdit::Create { .. }) => Err(EditError::PendingEdit(row_id)),
            (EditKind::Update, RowEdit::Update { cells: incoming, .. }) => {
                if let RowEdit::Update { cells, .. } = &mut self.edits[pos] {
                    for (column, cell) in incoming {
                        match cells.get_mut(&column) {
                            Some(existing) => existing.new_value = cell.new_value,
                            None => {
                                cells.insert(column, cell);
                            }
                        }
                    }
                }
                Ok(self.edits.get(pos))
            }
            (EditKind::Update, delete @ RowEdit::Delete { .. }) => {
                self.edits.remove(pos);
                self.edits.push(delete);
                Ok(self.edits.last())
            }
            (EditKind::Create, RowEdit::Update { cells: incoming, .. }) => {
                if let RowEdit::Create { values, .. } = &mut self.edits[pos] {
                    for (column, cell) in incoming {
                        values.insert(column, cell.new_value);
                    }
                }
                Ok(self.edits.get(pos))
            }
            (EditKind::Create, RowEdit::Delete { .. }) => {
                self.edits.remove(pos);
                Ok(None)
            }
        }
    }

    /// Drop the pending edit of a row. No-op when there is none.
    pub fn revert(&mut self, row_id: i64) -> Option<RowEdit> {
        self.position(row_id).map(|pos| self.edits.remove(pos))
    }

    /// Drop one column from a pending Create or Update. An Update left with
    /// no cells is removed. Returns whether anything changed.
    pub fn revert_cell(&mut self, row_id: i64, column: usize) -> bool {
        let Some(pos) = self.position(row_id) else {
            return false;
        };
        let (changed, now_empty) = match &mut self.edits[pos] {
            RowEdit::Update { cells, .. } => (cells.remove(&column).is_some(), cells.is_empty()),
            RowEdit::Create { values, .. } => (values.remove(&column).is_some(), false),
            RowEdit::Delete { .. } => (false, false),
        };
        if now_empty {
            self.edits.remove(pos);
        }
        changed
    }

    /// Remove the first `count` edits, after they were committed.
    pub fn drain_applied(&mut self, count: usize) {
        let count = count.min(self.edits.len());
        self.edits.drain(..count);
    }

    pub fn clear(&mut self) {
        self.edits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::CellUpdate;
    use crate::value::DbValue;

    fn set(row_id: i64, column: usize, value: &str) -> RowEdit {
        RowEdit::update(
            row_id,
            CellUpdate {
                column,
                old_display: format!("old{}", column),
                new_value: DbValue::Text(value.into()),
            },
        )
    }

    #[test]
    fn test_update_merges_different_columns() {
        let mut script = EditScript::new();
        script.stage(set(1, 0, "a")).unwrap();
        let merged = script.stage(set(1, 2, "b")).unwrap().cloned().unwrap();
        match merged {
            RowEdit::Update { cells, .. } => {
                assert_eq!(cells.len(), 2);
                assert_eq!(cells[&0].new_value, DbValue::Text("a".into()));
                assert_eq!(cells[&2].new_value, DbValue::Text("b".into()));
            }
            other => panic!("expected update, got {:?}", other),
        }
        assert_eq!(script.len(), 1);
    }

    #[test]
    fn test_update_same_column_later_wins_keeps_old_display() {
        let mut script = EditScript::new();
        script.stage(set(1, 0, "a")).unwrap();
        script.stage(set(1, 0, "b")).unwrap();
        match script.get(1).unwrap() {
            RowEdit::Update { cells, .. } => {
                assert_eq!(cells[&0].new_value, DbValue::Text("b".into()));
                assert_eq!(cells[&0].old_display, "old0");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_replaces_update_and_moves_to_end() {
        let mut script = EditScript::new();
        script.stage(set(1, 0, "a")).unwrap();
        script.stage(set(2, 0, "b")).unwrap();
        script.stage(RowEdit::delete(1)).unwrap();
        let order: Vec<_> = script.iter().map(|e| (e.row_id(), e.kind())).collect();
        assert_eq!(order, vec![(2, EditKind::Update), (1, EditKind::Delete)]);
    }

    #[test]
    fn test_any_edit_over_delete_rejected() {
        let mut script = EditScript::new();
        script.stage(RowEdit::delete(3)).unwrap();
        let before = script.clone();
        assert_eq!(script.stage(set(3, 0, "x")).unwrap_err(), EditError::RowDeleted(3));
        assert_eq!(script.stage(RowEdit::delete(3)).unwrap_err(), EditError::RowDeleted(3));
        assert_eq!(script, before);
    }

    #[test]
    fn test_update_merges_into_create() {
        let mut script = EditScript::new();
        script.stage(RowEdit::create(9)).unwrap();
        script.stage(set(9, 1, "Alice")).unwrap();
        match script.get(9).unwrap() {
            RowEdit::Create { values, .. } => assert_eq!(values[&1], DbValue::Text("Alice".into())),
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_cancels_create() {
        let mut script = EditScript::new();
        script.stage(RowEdit::create(9)).unwrap();
        assert!(script.stage(RowEdit::delete(9)).unwrap().is_none());
        assert!(script.is_empty());
    }

    #[test]
    fn test_create_over_pending_rejected() {
        let mut script = EditScript::new();
        script.stage(set(1, 0, "a")).unwrap();
        assert_eq!(script.stage(RowEdit::create(1)).unwrap_err(), EditError::PendingEdit(1));
    }

    #[test]
    fn test_revert_and_revert_cell() {
        let mut script = EditScript::new();
        assert!(script.revert(4).is_none());

        script.stage(set(4, 0, "a")).unwrap();
        script.stage(set(4, 1, "b")).unwrap();
        assert!(script.revert_cell(4, 0));
        assert!(!script.revert_cell(4, 0));
        assert_eq!(script.len(), 1);
        assert!(script.revert_cell(4, 1));
        assert!(script.is_empty());

        script.stage(RowEdit::delete(5)).unwrap();
        assert_eq!(script.revert(5), Some(RowEdit::delete(5)));
    }

    #[test]
    fn test_drain_applied_keeps_tail() {
        let mut script = EditScript::new();
        for id in 0..4 {
            script.stage(RowEdit::delete(id)).unwrap();
        }
        script.drain_applied(3);
        assert_eq!(script.iter().map(|e| e.row_id()).collect::<Vec<_>>(), vec![3]);
        script.drain_applied(10);
        assert!(script.is_empty());
    }
}
