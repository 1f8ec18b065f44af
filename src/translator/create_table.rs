//! `CREATE TABLE` restructuring.
//!
//! SQLite parses but does not enforce foreign keys unless a pragma is set
//! per connection, so each foreign key gets trigger statements enforcing it.
//! MySQL ignores inline `REFERENCES` clauses, so they are moved into
//! table-level constraints, and tables default to the InnoDB engine.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ddl::{CreateTable, Reference, TableConstraint};
use crate::dialect::Dialect;
use crate::error::UnisqlResult;
use crate::schema::FkAction;
use crate::tokenizer::map_sql_runs;

static AUTOINCREMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*\bAUTOINCREMENT\b").expect("valid regex"));
static PRIMARY_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*\bPRIMARY\s+KEY\b").expect("valid regex"));
static ENGINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bENGINE\s*=").expect("valid regex"));

/// Prefix of every trigger generated for foreign keys.
pub const TRIGGER_PREFIX: &str = "unisql_fk";

/// Names of the triggers a foreign key on `child.column` installs on its
/// parent table.
pub fn parent_trigger_names(child: &str, column: &str) -> [String; 2] {
    [
        format!("{TRIGGER_PREFIX}d_{child}_{column}"),
        format!("{TRIGGER_PREFIX}u_{child}_{column}"),
    ]
}

/// SQLite: put `INTEGER PRIMARY KEY AUTOINCREMENT` in the one order SQLite
/// accepts, and enforce foreign keys with triggers.
pub fn sqlite(sql: &str) -> UnisqlResult<(String, Vec<String>)> {
    let mut table = CreateTable::parse(sql)?;

    let primary = table.primary_key();
    let mut auto_column = None;
    for column in &mut table.columns {
        if !column.auto_increment {
            continue;
        }
        let head = &column.text[..column.type_span.start];
        let rest = map_sql_runs(&column.text[column.type_span.end..], |run| {
            let run = AUTOINCREMENT.replace_all(run, "");
            PRIMARY_KEY.replace_all(&run, "").into_owned()
        });
        column.text = format!("{head}INTEGER PRIMARY KEY AUTOINCREMENT{rest}");
        column.primary_key = true;
        auto_column = Some(column.name.clone());
    }
    let changed = auto_column.is_some();
    if let Some(auto) = auto_column.filter(|_| primary.len() == 1) {
        if primary[0].eq_ignore_ascii_case(&auto) {
            table
                .constraints
                .retain(|c| !matches!(c, TableConstraint::PrimaryKey { .. }));
        }
    }

    let defaults: Vec<(String, Option<String>)> = table
        .columns
        .iter()
        .map(|c| (c.name.clone(), c.default.clone()))
        .collect();
    let mut triggers = Vec::new();
    for (column, reference) in table.foreign_keys() {
        let default = defaults
            .iter()
            .find(|(name, _)| name == &column)
            .and_then(|(_, d)| d.clone());
        triggers.extend(sqlite_fk_triggers(&table.name, &column, &reference, default.as_deref()));
    }

    let translated = if changed { table.to_sql() } else { sql.to_string() };
    Ok((translated, triggers))
}

fn sqlite_fk_triggers(
    child: &str,
    column: &str,
    reference: &Reference,
    default: Option<&str>,
) -> Vec<String> {
    let quote = |name: &str| Dialect::SQLite.quote_identifier(name);
    let parent_name = &reference.table;
    let parent_column_name = reference
        .columns
        .first()
        .map(String::as_str)
        .unwrap_or("rowid");
    let (parent, parent_column) = (quote(parent_name), quote(parent_column_name));
    let (child_table, child_column) = (quote(child), quote(column));

    let missing_parent = format!(
        "NEW.{child_column} IS NOT NULL AND (SELECT {parent_column} FROM {parent} WHERE {parent_column} = NEW.{child_column}) IS NULL"
    );
    let violation = |verb: &str| {
        format!(
            "SELECT RAISE(ABORT, '{verb} on table \"{child}\" violates foreign key constraint on column \"{column}\"')"
        )
    };

    let mut triggers = vec![
        format!(
            "CREATE TRIGGER {} BEFORE INSERT ON {child_table} FOR EACH ROW \
             WHEN {missing_parent} BEGIN {}; END",
            quote(&format!("{TRIGGER_PREFIX}i_{child}_{column}")),
            violation("insert")
        ),
        format!(
            "CREATE TRIGGER {} BEFORE UPDATE OF {child_column} ON {child_table} FOR EACH ROW \
             WHEN {missing_parent} BEGIN {}; END",
            quote(&format!("{TRIGGER_PREFIX}b_{child}_{column}")),
            violation("update")
        ),
    ];

    let [delete_name, update_name] = parent_trigger_names(child, column).map(|name| quote(&name));
    let has_children = format!(
        "(SELECT {child_column} FROM {child_table} WHERE {child_column} = OLD.{parent_column}) IS NOT NULL"
    );
    let set_default = default.unwrap_or("NULL");

    let on_delete = match reference.on_delete {
        FkAction::NoAction | FkAction::Restrict => format!(
            "WHEN {has_children} BEGIN SELECT RAISE(ABORT, 'delete on table \"{parent_name}\" violates foreign key constraint on table \"{child}\"'); END"
        ),
        FkAction::Cascade => format!(
            "BEGIN DELETE FROM {child_table} WHERE {child_column} = OLD.{parent_column}; END"
        ),
        FkAction::SetNull => format!(
            "BEGIN UPDATE {child_table} SET {child_column} = NULL WHERE {child_column} = OLD.{parent_column}; END"
        ),
        FkAction::SetDefault => format!(
            "BEGIN UPDATE {child_table} SET {child_column} = {set_default} WHERE {child_column} = OLD.{parent_column}; END"
        ),
    };
    triggers.push(format!(
        "CREATE TRIGGER {delete_name} BEFORE DELETE ON {parent} FOR EACH ROW {on_delete}"
    ));

    let changed_key = format!("OLD.{parent_column} IS NOT NEW.{parent_column}");
    let on_update = match reference.on_update {
        FkAction::NoAction | FkAction::Restrict => format!(
            "WHEN {changed_key} AND {has_children} BEGIN SELECT RAISE(ABORT, 'update on table \"{parent_name}\" violates foreign key constraint on table \"{child}\"'); END"
        ),
        FkAction::Cascade => format!(
            "WHEN {changed_key} BEGIN UPDATE {child_table} SET {child_column} = NEW.{parent_column} WHERE {child_column} = OLD.{parent_column}; END"
        ),
        FkAction::SetNull => format!(
            "WHEN {changed_key} BEGIN UPDATE {child_table} SET {child_column} = NULL WHERE {child_column} = OLD.{parent_column}; END"
        ),
        FkAction::SetDefault => format!(
            "WHEN {changed_key} BEGIN UPDATE {child_table} SET {child_column} = {set_default} WHERE {child_column} = OLD.{parent_column}; END"
        ),
    };
    triggers.push(format!(
        "CREATE TRIGGER {update_name} AFTER UPDATE OF {parent_column} ON {parent} FOR EACH ROW {on_update}"
    ));

    triggers
}

/// MySQL: hoist inline `REFERENCES` into `FOREIGN KEY` constraints and
/// default the storage engine to InnoDB.
pub fn mysql(sql: &str) -> UnisqlResult<String> {
    let mut table = CreateTable::parse(sql)?;
    let mut hoisted = Vec::new();

    for column in &mut table.columns {
        let (Some(reference), Some(span)) = (column.references.take(), column.references_span.take())
        else {
            continue;
        };
        let mut text = column.text.clone();
        text.replace_range(span, "");
        column.text = text.trim_end().to_string();
        hoisted.push(TableConstraint::ForeignKey {
            columns: vec![column.name.clone()],
            text: format!("FOREIGN KEY ({}) {}", column.name, reference.to_sql()),
            reference,
        });
    }

    let has_engine = ENGINE.is_match(&table.tail);
    if hoisted.is_empty() && has_engine {
        return Ok(sql.to_string());
    }
    table.constraints.extend(hoisted);
    if !has_engine {
        table.tail = format!("{} ENGINE=InnoDB", table.tail.trim_end());
    }
    Ok(table.to_sql())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sqlite_autoincrement_order() {
        let (sql, triggers) =
            sqlite("CREATE TABLE users (id integer AUTOINCREMENT NOT NULL, name text, PRIMARY KEY (id))").unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, name text)"
        );
        assert!(triggers.is_empty());
    }

    #[test]
    fn test_sqlite_already_canonical_is_stable() {
        let (sql, _) = sqlite("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT)").unwrap();
        assert_eq!(sql, "CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT)");
    }

    #[test]
    fn test_sqlite_fk_triggers() {
        let (sql, triggers) = sqlite(
            "CREATE TABLE posts (id integer PRIMARY KEY, user_id integer REFERENCES users(id) ON DELETE CASCADE ON UPDATE SET NULL)",
        )
        .unwrap();
        assert!(sql.contains("REFERENCES users(id) ON DELETE CASCADE"));
        assert_eq!(triggers.len(), 4);
        assert!(triggers[0].starts_with(
            "CREATE TRIGGER \"unisql_fki_posts_user_id\" BEFORE INSERT ON \"posts\""
        ));
        assert!(triggers[1].starts_with(
            "CREATE TRIGGER \"unisql_fkb_posts_user_id\" BEFORE UPDATE OF \"user_id\" ON \"posts\""
        ));
        assert_eq!(
            triggers[2],
            "CREATE TRIGGER \"unisql_fkd_posts_user_id\" BEFORE DELETE ON \"users\" FOR EACH ROW \
             BEGIN DELETE FROM \"posts\" WHERE \"user_id\" = OLD.\"id\"; END"
        );
        assert_eq!(
            triggers[3],
            "CREATE TRIGGER \"unisql_fku_posts_user_id\" AFTER UPDATE OF \"id\" ON \"users\" FOR EACH ROW \
             WHEN OLD.\"id\" IS NOT NEW.\"id\" BEGIN UPDATE \"posts\" SET \"user_id\" = NULL WHERE \"user_id\" = OLD.\"id\"; END"
        );
    }

    #[test]
    fn test_sqlite_triggers_quote_reserved_names() {
        let (_, triggers) = sqlite(
            "CREATE TABLE \"order\" (id integer, \"user_id\" integer REFERENCES \"users\" (\"id\"))",
        )
        .unwrap();
        assert!(triggers[0].starts_with(
            "CREATE TRIGGER \"unisql_fki_order_user_id\" BEFORE INSERT ON \"order\" FOR EACH ROW"
        ));
        assert!(triggers[2].contains("(SELECT \"user_id\" FROM \"order\" WHERE \"user_id\" = OLD.\"id\")"));
        assert!(triggers.iter().all(|t| !t.contains(" order ")));
    }

    #[test]
    fn test_sqlite_restrict_raises() {
        let (_, triggers) =
            sqlite("CREATE TABLE c (p_id integer, FOREIGN KEY (p_id) REFERENCES p (id))").unwrap();
        assert!(triggers[2].contains("RAISE(ABORT, 'delete on table \"p\""));
        assert!(triggers[2].contains("WHEN (SELECT \"p_id\" FROM \"c\" WHERE \"p_id\" = OLD.\"id\") IS NOT NULL"));
    }

    #[test]
    fn test_mysql_hoists_references() {
        let sql = mysql(
            "CREATE TABLE posts (id integer AUTO_INCREMENT PRIMARY KEY, user_id integer NOT NULL REFERENCES users(id) ON DELETE CASCADE)",
        )
        .unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE posts (id integer AUTO_INCREMENT PRIMARY KEY, user_id integer NOT NULL, \
             FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE) ENGINE=InnoDB"
        );
    }

    #[test]
    fn test_mysql_keeps_engine() {
        let sql = "CREATE TABLE t (id int) ENGINE=MyISAM";
        assert_eq!(mysql(sql).unwrap(), sql);
    }
}
