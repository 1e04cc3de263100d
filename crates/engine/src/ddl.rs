//! CREATE TABLE scripts for schema-designer models.

use crate::driver::TableInfo;
use crate::templater::Templater;

/// Render one `CREATE TABLE` per table, in the given order, separated by a
/// blank line.
pub fn create_script(tables: &[TableInfo], templater: &dyn Templater) -> String {
    tables
        .iter()
        .map(|t| create_table(t, templater))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn create_table(table: &TableInfo, templater: &dyn Templater) -> String {
    let quote_all = |names: &[String]| {
        names
            .iter()
            .map(|n| templater.quote_identifier(n))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut lines = Vec::new();
    for column in &table.columns {
        let mut line = format!("    {} {}", templater.quote_identifier(&column.name), column.data_type);
        if !column.is_nullable {
            line.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default_value {
            line.push_str(&format!(" DEFAULT {}", default));
        }
        if column.is_identity {
            line.push_str(templater.identity_suffix());
        }
        lines.push(line.trim_end().to_string());
    }

    let keys: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.is_key)
        .map(|c| c.name.clone())
        .collect();
    if !keys.is_empty() {
        lines.push(format!("    PRIMARY KEY ({})", quote_all(&keys)));
    }

    for fk in &table.foreign_keys {
        lines.push(format!(
            "    CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            templater.quote_identifier(&fk.name),
            quote_all(&fk.columns),
            templater.quote_object(&fk.referenced),
            quote_all(&fk.referenced_columns)
        ));
    }

    format!(
        "CREATE TABLE {} (\n{}\n);",
        templater.quote_object(&table.object),
        lines.join(",\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ColumnMeta, ForeignKeyInfo, ObjectKind, ObjectRef};
    use crate::templater::Dialect;

    fn posts() -> TableInfo {
        let mut id = ColumnMeta::named("id", 0);
        id.data_type = "INTEGER".into();
        id.is_key = true;
        id.is_identity = true;
        id.is_nullable = false;
        let mut author = ColumnMeta::named("author", 1);
        author.data_type = "INTEGER".into();
        let mut title = ColumnMeta::named("title", 2);
        title.data_type = "TEXT".into();
        title.is_nullable = false;
        title.default_value = Some("''".into());
        TableInfo {
            object: ObjectRef::new("public", "posts"),
            kind: ObjectKind::Table,
            columns: vec![id, author, title],
            foreign_keys: vec![ForeignKeyInfo {
                name: "fk_author".into(),
                columns: vec!["author".into()],
                referenced: ObjectRef::new("public", "users"),
                referenced_columns: vec!["id".into()],
            }],
        }
    }

    #[test]
    fn test_create_table_postgres() {
        let sql = create_table(&posts(), Dialect::Postgres.templater());
        assert_eq!(
            sql,
            "CREATE TABLE \"public\".\"posts\" (\n\
             \x20   \"id\" INTEGER NOT NULL GENERATED BY DEFAULT AS IDENTITY,\n\
             \x20   \"author\" INTEGER,\n\
             \x20   \"title\" TEXT NOT NULL DEFAULT '',\n\
             \x20   PRIMARY KEY (\"id\"),\n\
             \x20   CONSTRAINT \"fk_author\" FOREIGN KEY (\"author\") REFERENCES \"public\".\"users\" (\"id\")\n\
             );"
        );
    }

    #[test]
    fn test_create_table_mysql_identity() {
        let sql = create_table(&posts(), Dialect::MySql.templater());
        assert!(sql.starts_with("CREATE TABLE `public`.`posts` ("));
        assert!(sql.contains("`id` INTEGER NOT NULL AUTO_INCREMENT"));
    }

    #[test]
    fn test_script_joins_tables() {
        let mut other = posts();
        other.object.name = "drafts".into();
        let script = create_script(&[posts(), other], Dialect::Sqlite.templater());
        assert_eq!(script.matches("CREATE TABLE").count(), 2);
        assert!(script.contains(");\n\nCREATE TABLE \"public\".\"drafts\""));
    }
}
