//! `CREATE TABLE` / `CREATE INDEX` parsing.
//!
//! Shared by the translator (which restructures table definitions) and by
//! schema introspection for backends whose metadata is only available as DDL
//! text (`SHOW CREATE TABLE`, `sqlite_master`).

use nom::{
    branch::alt,
    bytes::complete::{is_not, take_while1},
    character::complete::{char, multispace0},
    combinator::map,
    multi::separated_list1,
    sequence::{delimited, preceded},
    IResult,
};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{UnisqlError, UnisqlResult};
use crate::schema::FkAction;
use crate::tokenizer::{
    find_top_level_keyword, mask_quoted, matching_paren, split_top_level, tokenize,
};

static CREATE_TABLE_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+(?:TEMP(?:ORARY)?\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?")
        .expect("valid regex")
});

static CREATE_INDEX_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+(?:IF\s+NOT\s+EXISTS\s+)?")
        .expect("valid regex")
});

const IDENT: &str = r#"(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|[\w$]+)(?:\.(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|[\w$]+))*"#;

static REFERENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is)\bREFERENCES\s+({IDENT})\s*(\([^)]*\))?((?:\s+ON\s+(?:DELETE|UPDATE)\s+(?:CASCADE|RESTRICT|NO\s+ACTION|SET\s+NULL|SET\s+DEFAULT))*)"
    ))
    .expect("valid regex")
});

static FK_ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)ON\s+(DELETE|UPDATE)\s+(CASCADE|RESTRICT|NO\s+ACTION|SET\s+NULL|SET\s+DEFAULT)")
        .expect("valid regex")
});

/// Keywords that end the type portion of a column definition.
const TYPE_TERMINATORS: &[&str] = &[
    "NOT NULL",
    "NULL",
    "PRIMARY KEY",
    "UNIQUE",
    "DEFAULT",
    "REFERENCES",
    "CHECK",
    "AUTOINCREMENT",
    "AUTO_INCREMENT",
    "IDENTITY",
    "COLLATE",
    "CONSTRAINT",
    "GENERATED",
    "COMMENT",
    "CHARACTER SET",
    "ON UPDATE",
];

/// Identifier, optionally quoted with `"`, backticks or brackets.
pub(crate) fn identifier(input: &str) -> IResult<&str, String> {
    alt((
        map(delimited(char('"'), is_not("\""), char('"')), String::from),
        map(delimited(char('`'), is_not("`"), char('`')), String::from),
        map(delimited(char('['), is_not("]"), char(']')), String::from),
        map(
            take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '$'),
            String::from,
        ),
    ))(input)
}

/// Possibly schema-qualified identifier; yields the last part.
pub(crate) fn qualified_identifier(input: &str) -> IResult<&str, String> {
    map(separated_list1(char('.'), identifier), |mut parts| {
        parts.pop().unwrap_or_default()
    })(input)
}

/// Strip identifier quoting from a complete name.
pub fn unquote_identifier(name: &str) -> String {
    match qualified_identifier(name.trim()) {
        Ok(("", ident)) => ident,
        _ => name.trim().to_string(),
    }
}

/// Parse `(a, b DESC, c(10))` into plain column names.
pub fn column_list(text: &str) -> Vec<String> {
    let text = text.trim();
    let inner = text
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(text);
    split_top_level(inner, ',')
        .into_iter()
        .filter_map(|part| {
            preceded(multispace0, identifier)(part)
                .ok()
                .map(|(_, name)| name)
        })
        .collect()
}

/// Target of a `REFERENCES` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub table: String,
    pub columns: Vec<String>,
    pub on_delete: FkAction,
    pub on_update: FkAction,
}

impl Reference {
    fn parse(caps: &regex::Captures<'_>) -> Self {
        let mut on_delete = FkAction::NoAction;
        let mut on_update = FkAction::NoAction;
        if let Some(actions) = caps.get(3) {
            for action in FK_ACTION.captures_iter(actions.as_str()) {
                let parsed = FkAction::parse(&action[2]).unwrap_or_default();
                if action[1].eq_ignore_ascii_case("DELETE") {
                    on_delete = parsed;
                } else {
                    on_update = parsed;
                }
            }
        }
        Reference {
            table: unquote_identifier(&caps[1]),
            columns: caps.get(2).map(|m| column_list(m.as_str())).unwrap_or_default(),
            on_delete,
            on_update,
        }
    }

    /// Render as a `REFERENCES` clause.
    pub fn to_sql(&self) -> String {
        let mut sql = format!("REFERENCES {}", self.table);
        if !self.columns.is_empty() {
            sql.push_str(&format!(" ({})", self.columns.join(", ")));
        }
        if self.on_delete != FkAction::NoAction {
            sql.push_str(&format!(" ON DELETE {}", self.on_delete.as_sql()));
        }
        if self.on_update != FkAction::NoAction {
            sql.push_str(&format!(" ON UPDATE {}", self.on_update.as_sql()));
        }
        sql
    }
}

/// A column definition and the facts extracted from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    /// The whole definition as written, name included.
    pub text: String,
    /// Native type, e.g. `varchar(255)` or `int unsigned`.
    pub type_name: String,
    /// Byte range of `type_name` within `text`.
    pub type_span: std::ops::Range<usize>,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub auto_increment: bool,
    /// Raw default expression, literal quotes kept.
    pub default: Option<String>,
    pub references: Option<Reference>,
    /// Byte range of the `REFERENCES ...` clause within `text`.
    pub references_span: Option<std::ops::Range<usize>>,
    /// Body of an inline `CHECK (...)`.
    pub check: Option<String>,
}

/// A table-level constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum TableConstraint {
    PrimaryKey { columns: Vec<String>, text: String },
    Unique { columns: Vec<String>, text: String },
    ForeignKey { columns: Vec<String>, reference: Reference, text: String },
    Check { expr: String, text: String },
    /// Anything else, such as MySQL `KEY idx (col)`.
    Other(String),
}

impl TableConstraint {
    pub fn text(&self) -> &str {
        match self {
            TableConstraint::PrimaryKey { text, .. }
            | TableConstraint::Unique { text, .. }
            | TableConstraint::ForeignKey { text, .. }
            | TableConstraint::Check { text, .. } => text,
            TableConstraint::Other(text) => text,
        }
    }
}

/// A parsed `CREATE TABLE` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub name: String,
    /// Everything before the opening parenthesis.
    pub head: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<TableConstraint>,
    /// Everything after the closing parenthesis (table options).
    pub tail: String,
}

impl CreateTable {
    /// Parse a `CREATE TABLE` statement.
    pub fn parse(sql: &str) -> UnisqlResult<Self> {
        let head_match = CREATE_TABLE_HEAD
            .find(sql)
            .ok_or_else(|| UnisqlError::parse(sql, "not a CREATE TABLE statement"))?;
        let after_head = &sql[head_match.end()..];
        let (rest, name) = qualified_identifier(after_head)
            .map_err(|_| UnisqlError::parse(sql, "missing table name"))?;

        let masked = mask_quoted(sql);
        let open = sql.len() - rest.len() + (rest.len() - rest.trim_start().len());
        if masked.as_bytes().get(open) != Some(&b'(') {
            return Err(UnisqlError::parse(sql, "expected '(' after table name"));
        }
        let close = matching_paren(&masked, open)
            .ok_or_else(|| UnisqlError::parse(sql, "unbalanced parentheses"))?;

        let mut table = CreateTable {
            name,
            head: sql[..open].to_string(),
            columns: Vec::new(),
            constraints: Vec::new(),
            tail: sql[close + 1..].to_string(),
        };

        for part in split_top_level(&sql[open + 1..close], ',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match parse_constraint(part) {
                Some(constraint) => table.constraints.push(constraint),
                None => table.columns.push(parse_column(part)?),
            }
        }

        Ok(table)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Primary key columns, inline or table-level.
    pub fn primary_key(&self) -> Vec<String> {
        for constraint in &self.constraints {
            if let TableConstraint::PrimaryKey { columns, .. } = constraint {
                return columns.clone();
            }
        }
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Unique column groups, inline or table-level.
    pub fn unique_keys(&self) -> Vec<Vec<String>> {
        let mut keys: Vec<Vec<String>> = self
            .columns
            .iter()
            .filter(|c| c.unique)
            .map(|c| vec![c.name.clone()])
            .collect();
        for constraint in &self.constraints {
            if let TableConstraint::Unique { columns, .. } = constraint {
                keys.push(columns.clone());
            }
        }
        keys
    }

    /// Every foreign key as `(column, reference)`, one entry per column pair.
    pub fn foreign_keys(&self) -> Vec<(String, Reference)> {
        let mut fks = Vec::new();
        for column in &self.columns {
            if let Some(reference) = &column.references {
                fks.push((column.name.clone(), reference.clone()));
            }
        }
        for constraint in &self.constraints {
            if let TableConstraint::ForeignKey { columns, reference, .. } = constraint {
                for (i, column) in columns.iter().enumerate() {
                    let mut single = reference.clone();
                    single.columns = reference.columns.get(i).cloned().into_iter().collect();
                    fks.push((column.clone(), single));
                }
            }
        }
        fks
    }

    /// Render from parts. Formatting of the untouched parts is preserved.
    pub fn to_sql(&self) -> String {
        let parts: Vec<&str> = self
            .columns
            .iter()
            .map(|c| c.text.as_str())
            .chain(self.constraints.iter().map(TableConstraint::text))
            .collect();
        format!("{}({}){}", self.head, parts.join(", "), self.tail)
    }
}

fn starts_with_keyword(masked: &str, keyword: &str) -> bool {
    matches!(find_top_level_keyword(masked, keyword, 0), Some((0, _)))
}

fn parse_constraint(part: &str) -> Option<TableConstraint> {
    let masked = mask_quoted(part);
    let mut body_start = 0;

    if starts_with_keyword(&masked, "CONSTRAINT") {
        let after = part["CONSTRAINT".len()..].trim_start();
        let (rest, _) = identifier(after).ok()?;
        body_start = part.len() - rest.trim_start().len();
    }

    let body = &part[body_start..];
    let body_masked = &masked[body_start..];

    let paren_group = |keyword_end: usize| -> Vec<String> {
        body_masked[keyword_end..]
            .find('(')
            .and_then(|open| {
                let open = keyword_end + open;
                matching_paren(body_masked, open).map(|close| column_list(&body[open..=close]))
            })
            .unwrap_or_default()
    };

    if let Some((0, end)) = find_top_level_keyword(body_masked, "PRIMARY KEY", 0) {
        return Some(TableConstraint::PrimaryKey {
            columns: paren_group(end),
            text: part.to_string(),
        });
    }
    if let Some((0, end)) = find_top_level_keyword(body_masked, "UNIQUE", 0) {
        return Some(TableConstraint::Unique {
            columns: paren_group(end),
            text: part.to_string(),
        });
    }
    if let Some((0, end)) = find_top_level_keyword(body_masked, "FOREIGN KEY", 0) {
        let columns = paren_group(end);
        let caps = REFERENCES.captures(body_masked)?;
        let reference = Reference::parse(&caps);
        return Some(TableConstraint::ForeignKey {
            columns,
            reference,
            text: part.to_string(),
        });
    }
    if let Some((0, end)) = find_top_level_keyword(body_masked, "CHECK", 0) {
        let open = end + body_masked[end..].find('(')?;
        let close = matching_paren(body_masked, open)?;
        return Some(TableConstraint::Check {
            expr: body[open + 1..close].trim().to_string(),
            text: part.to_string(),
        });
    }
    for keyword in ["KEY", "INDEX", "FULLTEXT", "SPATIAL"] {
        if starts_with_keyword(body_masked, keyword) {
            return Some(TableConstraint::Other(part.to_string()));
        }
    }
    None
}

fn parse_column(part: &str) -> UnisqlResult<ColumnDef> {
    let (rest, name) =
        identifier(part).map_err(|_| UnisqlError::parse(part, "missing column name"))?;
    let def_start = part.len() - rest.len();
    let masked = mask_quoted(part);
    let def_masked = &masked[def_start..];
    let def = &part[def_start..];

    let type_end = TYPE_TERMINATORS
        .iter()
        .filter_map(|kw| find_top_level_keyword(def_masked, kw, 0).map(|(s, _)| s))
        .min()
        .unwrap_or(def.len());
    let type_name = def[..type_end].trim().to_string();
    let type_start = def_start + (def.len() - def.trim_start().len());
    let type_span = type_start..type_start + type_name.len();

    let has = |kw: &str| find_top_level_keyword(def_masked, kw, 0).is_some();

    let default = find_top_level_keyword(def_masked, "DEFAULT", 0)
        .map(|(_, end)| default_expression(&def[end..], &def_masked[end..]));

    let (references, references_span) = match REFERENCES.captures(def_masked) {
        Some(caps) => {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            (
                Some(Reference::parse(&caps)),
                Some(def_start + whole.start..def_start + whole.end),
            )
        }
        None => (None, None),
    };

    let check = find_top_level_keyword(def_masked, "CHECK", 0).and_then(|(_, end)| {
        let open = end + def_masked[end..].find('(')?;
        let close = matching_paren(def_masked, open)?;
        Some(def[open + 1..close].trim().to_string())
    });

    let lower_type = type_name.to_ascii_lowercase();
    Ok(ColumnDef {
        name,
        text: part.to_string(),
        not_null: has("NOT NULL") || (has("PRIMARY KEY") && !has("NULL")),
        primary_key: has("PRIMARY KEY"),
        unique: has("UNIQUE"),
        auto_increment: has("AUTOINCREMENT")
            || has("AUTO_INCREMENT")
            || has("IDENTITY")
            || lower_type.starts_with("serial")
            || lower_type.starts_with("bigserial"),
        type_name,
        type_span,
        default,
        references,
        references_span,
        check,
    })
}

/// The expression following `DEFAULT`.
fn default_expression(text: &str, masked: &str) -> String {
    let trimmed = text.trim_start();
    let skip = text.len() - trimmed.len();
    let masked = &masked[skip..];

    if masked.starts_with('(') {
        if let Some(close) = matching_paren(masked, 0) {
            return trimmed[..=close].to_string();
        }
    }
    if trimmed.starts_with('\'') {
        if let Some(token) = tokenize(trimmed).first() {
            return token.text.to_string();
        }
    }
    let end = masked
        .find(|c: char| c.is_whitespace() || c == ',')
        .unwrap_or(masked.len());
    let word_end = match masked[..end].find('(') {
        Some(open) => matching_paren(masked, open).map(|c| c + 1).unwrap_or(end),
        None => end,
    };
    trimmed[..word_end.max(end)].to_string()
}

/// A parsed `CREATE [UNIQUE] INDEX`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndex {
    pub name: String,
    pub table: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

impl CreateIndex {
    pub fn parse(sql: &str) -> Option<Self> {
        let caps = CREATE_INDEX_HEAD.captures(sql)?;
        let unique = caps.get(1).is_some();
        let rest = &sql[caps.get(0)?.end()..];
        let (rest, name) = qualified_identifier(rest).ok()?;
        let rest = rest.trim_start();
        let rest = rest
            .get(..2)
            .filter(|on| on.eq_ignore_ascii_case("ON"))
            .map(|_| rest[2..].trim_start())?;
        let (rest, table) = qualified_identifier(rest).ok()?;
        let masked = mask_quoted(rest);
        let open = masked.find('(')?;
        let close = matching_paren(&masked, open)?;
        Some(CreateIndex {
            name,
            table,
            unique,
            columns: column_list(&rest[open..=close]),
        })
    }
}

static CHECK_IN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?is)^\(*\s*({IDENT})\s+IN\s*\((.*)\)\s*\)*$")).expect("valid regex")
});

static CHECK_EQ: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?is)^\(*\s*({IDENT})\s*=\s*('(?:[^']|'')*')\s*\)*$")).expect("valid regex"));

/// Enumerated values allowed by a `CHECK` over one column.
///
/// Understands `col IN ('a', 'b')` and `col = 'a' OR col = 'b'`.
pub fn check_valid_values(expr: &str, column: &str) -> Option<Vec<String>> {
    let expr = expr.trim();
    if let Some(caps) = CHECK_IN.captures(expr) {
        if !unquote_identifier(&caps[1]).eq_ignore_ascii_case(column) {
            return None;
        }
        return literal_list(&caps[2]);
    }

    let masked = mask_quoted(expr);
    let mut values = Vec::new();
    let mut start = 0;
    let mut bounds: Vec<(usize, usize)> = Vec::new();
    while let Some((s, e)) = find_top_level_keyword(&masked, "OR", start) {
        bounds.push((start, s));
        start = e;
    }
    bounds.push((start, expr.len()));
    if bounds.len() < 2 {
        let stripped = expr.trim_start_matches('(').trim_end_matches(')');
        if stripped.len() + 2 <= expr.len() && stripped != expr {
            return check_valid_values(stripped, column);
        }
        return None;
    }
    for (s, e) in bounds {
        let caps = CHECK_EQ.captures(expr[s..e].trim())?;
        if !unquote_identifier(&caps[1]).eq_ignore_ascii_case(column) {
            return None;
        }
        values.push(crate::tokenizer::unquote(&caps[2]));
    }
    Some(values)
}

/// Parse `'a', 'b', 'c'` into values; `None` if any item is not a literal.
pub fn literal_list(text: &str) -> Option<Vec<String>> {
    split_top_level(text, ',')
        .into_iter()
        .map(|item| {
            let item = item.trim();
            let item = item.split("::").next().unwrap_or(item).trim();
            if item.starts_with('\'') && item.ends_with('\'') && item.len() >= 2 {
                Some(crate::tokenizer::unquote(item))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_create_table() {
        let sql = "CREATE TABLE IF NOT EXISTS \"posts\" (\n  id integer PRIMARY KEY AUTOINCREMENT,\n  author_id integer NOT NULL REFERENCES users(id) ON DELETE CASCADE,\n  title varchar(200) NOT NULL DEFAULT 'untitled, really',\n  status varchar(10) CHECK (status IN ('draft', 'live')),\n  UNIQUE (author_id, title)\n)";
        let table = CreateTable::parse(sql).unwrap();
        assert_eq!(table.name, "posts");
        assert_eq!(table.columns.len(), 4);

        let id = table.column("id").unwrap();
        assert!(id.primary_key && id.auto_increment && id.not_null);
        assert_eq!(id.type_name, "integer");

        let author = table.column("author_id").unwrap();
        let reference = author.references.as_ref().unwrap();
        assert_eq!(reference.table, "users");
        assert_eq!(reference.columns, vec!["id"]);
        assert_eq!(reference.on_delete, FkAction::Cascade);
        assert_eq!(reference.on_update, FkAction::NoAction);

        let title = table.column("title").unwrap();
        assert_eq!(title.type_name, "varchar(200)");
        assert_eq!(title.default.as_deref(), Some("'untitled, really'"));

        let status = table.column("status").unwrap();
        assert_eq!(status.check.as_deref(), Some("status IN ('draft', 'live')"));
        assert_eq!(
            check_valid_values(status.check.as_deref().unwrap(), "status"),
            Some(vec!["draft".to_string(), "live".to_string()])
        );

        assert_eq!(table.primary_key(), vec!["id"]);
        assert_eq!(table.unique_keys(), vec![vec!["author_id".to_string(), "title".to_string()]]);
    }

    #[test]
    fn test_parse_mysql_show_create() {
        let sql = "CREATE TABLE `orders` (\n  `id` int unsigned NOT NULL AUTO_INCREMENT,\n  `kind` enum('a','b') DEFAULT NULL,\n  `user_id` int NOT NULL,\n  PRIMARY KEY (`id`),\n  KEY `user_id` (`user_id`),\n  CONSTRAINT `orders_ibfk_1` FOREIGN KEY (`user_id`) REFERENCES `users` (`id`) ON DELETE SET NULL ON UPDATE CASCADE\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";
        let table = CreateTable::parse(sql).unwrap();
        assert_eq!(table.name, "orders");
        assert_eq!(table.column("id").unwrap().type_name, "int unsigned");
        assert!(table.column("id").unwrap().auto_increment);
        assert_eq!(table.column("kind").unwrap().default.as_deref(), Some("NULL"));
        assert_eq!(table.primary_key(), vec!["id"]);
        assert_eq!(table.tail, " ENGINE=InnoDB DEFAULT CHARSET=utf8mb4");

        let fks = table.foreign_keys();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].0, "user_id");
        assert_eq!(fks[0].1.table, "users");
        assert_eq!(fks[0].1.on_delete, FkAction::SetNull);
        assert_eq!(fks[0].1.on_update, FkAction::Cascade);
        assert!(matches!(table.constraints[1], TableConstraint::Other(_)));
    }

    #[test]
    fn test_parse_create_index() {
        let index = CreateIndex::parse("CREATE UNIQUE INDEX idx_email ON users (email, tenant)").unwrap();
        assert!(index.unique);
        assert_eq!(index.table, "users");
        assert_eq!(index.columns, vec!["email", "tenant"]);
        assert!(CreateIndex::parse("CREATE TABLE x (a int)").is_none());
    }

    #[test]
    fn test_check_or_values() {
        assert_eq!(
            check_valid_values("([kind]='a' OR [kind]='b')", "kind"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(check_valid_values("price > 0", "price"), None);
    }

    #[test]
    fn test_not_create_table() {
        assert!(matches!(
            CreateTable::parse("SELECT 1"),
            Err(UnisqlError::Parse { .. })
        ));
    }

    #[test]
    fn test_default_expressions() {
        let table = CreateTable::parse(
            "CREATE TABLE t (a int DEFAULT -1, b timestamp DEFAULT CURRENT_TIMESTAMP, c int DEFAULT (1 + 2), d text DEFAULT now())",
        )
        .unwrap();
        assert_eq!(table.column("a").unwrap().default.as_deref(), Some("-1"));
        assert_eq!(table.column("b").unwrap().default.as_deref(), Some("CURRENT_TIMESTAMP"));
        assert_eq!(table.column("c").unwrap().default.as_deref(), Some("(1 + 2)"));
        assert_eq!(table.column("d").unwrap().default.as_deref(), Some("now()"));
    }
}
