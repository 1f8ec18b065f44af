//! SELECT clause splitting and FROM clause join resolution.
//!
//! [`parse_select_clauses`] cuts a SELECT into its seven clauses.
//! [`parse_joins`] turns a FROM clause into an ordered map of
//! [`JoinDescriptor`]s keyed by relationship route, so a caller can address
//! one specific join even when several routes connect the same two tables:
//!
//! ```text
//! users u JOIN posts p ON p.author_id = u.id       -> users_posts{author_id}
//!         JOIN posts e ON e.editor_id = u.id       -> users_posts{editor_id}
//!         JOIN posts_tags pt ON pt.post_id = p.id  -> posts_tags{posts_tags}_join
//!         JOIN tags t ON t.id = pt.tag_id          -> posts_tags{posts_tags}
//!         JOIN audit a ON a.at > u.created         -> users_complex_0
//!         CROSS JOIN settings                      -> users_simple_0
//! ```

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use nom::{
    bytes::complete::tag_no_case,
    character::complete::multispace1,
    sequence::{pair, preceded},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::ddl::{column_list, identifier, qualified_identifier, unquote_identifier};
use crate::error::{UnisqlError, UnisqlResult};
use crate::schema::{RelationshipKind, Relationships, SchemaSource};
use crate::tokenizer::{find_top_level_keyword, mask_quoted, matching_paren, split_top_level};

/// The clauses of a SELECT, in the order they must appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
}

impl Clause {
    pub const ALL: [Clause; 7] = [
        Clause::Select,
        Clause::From,
        Clause::Where,
        Clause::GroupBy,
        Clause::Having,
        Clause::OrderBy,
        Clause::Limit,
    ];

    pub fn keyword(&self) -> &'static str {
        match self {
            Clause::Select => "SELECT",
            Clause::From => "FROM",
            Clause::Where => "WHERE",
            Clause::GroupBy => "GROUP BY",
            Clause::Having => "HAVING",
            Clause::OrderBy => "ORDER BY",
            Clause::Limit => "LIMIT",
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Clause bodies of one SELECT, keywords excluded. Absent clauses are empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClauseMap(IndexMap<Clause, String>);

impl ClauseMap {
    pub fn get(&self, clause: Clause) -> &str {
        self.0.get(&clause).map(String::as_str).unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (Clause, &str)> {
        self.0.iter().map(|(c, s)| (*c, s.as_str()))
    }

    /// Reassemble a statement from the non-empty clauses.
    pub fn to_sql(&self) -> String {
        self.iter()
            .filter(|(_, body)| !body.is_empty())
            .map(|(clause, body)| format!("{} {body}", clause.keyword()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Split a SELECT into its clauses.
///
/// Keywords are matched case-insensitively outside quoted literals and
/// parentheses, so subqueries stay inside the clause that contains them.
pub fn parse_select_clauses(sql: &str) -> UnisqlResult<ClauseMap> {
    let sql = sql.trim();
    let sql = sql.strip_suffix(';').unwrap_or(sql).trim_end();
    let masked = mask_quoted(sql);

    if !matches!(find_top_level_keyword(&masked, "SELECT", 0), Some((0, _))) {
        return Err(UnisqlError::parse(sql, "statement does not start with SELECT"));
    }

    let mut found: Vec<(Clause, usize, usize)> = Vec::new();
    let mut from = 0;
    for clause in Clause::ALL {
        if let Some((start, end)) = find_top_level_keyword(&masked, clause.keyword(), from) {
            found.push((clause, start, end));
            from = end;
        }
    }

    let mut clauses: IndexMap<Clause, String> =
        Clause::ALL.iter().map(|c| (*c, String::new())).collect();
    for (i, (clause, _, body_start)) in found.iter().enumerate() {
        let body_end = found.get(i + 1).map(|(_, s, _)| *s).unwrap_or(sql.len());
        clauses.insert(*clause, sql[*body_start..body_end].trim().to_string());
    }
    Ok(ClauseMap(clauses))
}

/// How a joined table is combined with the tables before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    Cross,
    Natural,
}

impl JoinType {
    fn parse(words: &str) -> Self {
        let words = words.to_ascii_uppercase();
        match words.split_whitespace().next() {
            Some("LEFT") => JoinType::LeftOuter,
            Some("RIGHT") => JoinType::RightOuter,
            Some("FULL") => JoinType::FullOuter,
            Some("CROSS") => JoinType::Cross,
            Some("NATURAL") => JoinType::Natural,
            _ => JoinType::Inner,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::LeftOuter => "LEFT JOIN",
            JoinType::RightOuter => "RIGHT JOIN",
            JoinType::FullOuter => "FULL JOIN",
            JoinType::Cross => "CROSS JOIN",
            JoinType::Natural => "NATURAL JOIN",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// The condition of a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OnClause {
    None,
    /// `a.x = b.y`, fields as written.
    Equality { fields: [String; 2] },
    /// `USING (col, ...)`.
    Using { columns: Vec<String> },
    /// Any other condition, kept verbatim.
    Complex { condition: String },
}

/// One joined table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinDescriptor {
    pub join_type: JoinType,
    pub table_name: String,
    pub table_alias: Option<String>,
    pub on_clause: OnClause,
}

impl JoinDescriptor {
    /// The two fields of an equality condition.
    pub fn on_clause_fields(&self) -> Option<[&str; 2]> {
        match &self.on_clause {
            OnClause::Equality { fields } => Some([fields[0].as_str(), fields[1].as_str()]),
            _ => None,
        }
    }

    /// Name other clauses use for this table.
    pub fn reference_name(&self) -> &str {
        self.table_alias.as_deref().unwrap_or(&self.table_name)
    }

    pub fn to_sql(&self) -> String {
        let mut sql = format!("{} {}", self.join_type, self.table_name);
        if let Some(alias) = &self.table_alias {
            sql.push_str(&format!(" AS {alias}"));
        }
        match &self.on_clause {
            OnClause::None => {}
            OnClause::Equality { fields } => sql.push_str(&format!(" ON {} = {}", fields[0], fields[1])),
            OnClause::Using { columns } => sql.push_str(&format!(" USING ({})", columns.join(", "))),
            OnClause::Complex { condition } => sql.push_str(&format!(" ON {condition}")),
        }
        sql
    }
}

/// A resolved FROM clause: the first table and its joins in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FromClause {
    pub table: String,
    pub alias: Option<String>,
    pub joins: IndexMap<String, JoinDescriptor>,
}

impl FromClause {
    pub fn to_sql(&self) -> String {
        let mut sql = self.table.clone();
        if let Some(alias) = &self.alias {
            sql.push_str(&format!(" AS {alias}"));
        }
        for join in self.joins.values() {
            sql.push(' ');
            sql.push_str(&join.to_sql());
        }
        sql
    }
}

const IDENT_PART: &str = r#"(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|[\w$]+)"#;

static EQUALITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^\s*(({IDENT_PART})\.({IDENT_PART}))\s*=\s*(({IDENT_PART})\.({IDENT_PART}))\s*$"
    ))
    .expect("valid regex")
});

static JOIN_MODIFIERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\b(?:INNER|CROSS|NATURAL|LEFT|RIGHT|FULL)(?:\s+OUTER)?\s+)?$")
        .expect("valid regex")
});

const RESERVED: &[&str] = &[
    "ON", "USING", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL", "WHERE",
];

/// `name [AS] [alias]`, returning the unparsed remainder.
fn table_reference<'a>(
    whole: &str,
    text: &'a str,
) -> UnisqlResult<(String, Option<String>, &'a str)> {
    let text = text.trim_start();
    if text.starts_with('(') {
        return Err(UnisqlError::parse(whole, "subqueries in FROM are not supported"));
    }
    let (rest, name) = qualified_identifier(text)
        .map_err(|_| UnisqlError::parse(whole, format!("expected a table name at '{text}'")))?;
    let rest = rest.trim_start();

    let explicit: nom::IResult<&str, String> =
        preceded(pair(tag_no_case("AS"), multispace1), identifier)(rest);
    let (rest, alias) = match explicit {
        Ok((rest, alias)) => (rest, Some(alias)),
        Err(_) => match identifier(rest) {
            Ok((after, word)) if !RESERVED.iter().any(|r| r.eq_ignore_ascii_case(&word)) => {
                (after, Some(word))
            }
            _ => (rest, None),
        },
    };
    Ok((name, alias, rest.trim()))
}

/// Parse the text following a joined table reference.
fn join_condition(whole: &str, text: &str) -> UnisqlResult<OnClause> {
    if text.is_empty() {
        return Ok(OnClause::None);
    }
    let masked = mask_quoted(text);
    if let Some((0, end)) = find_top_level_keyword(&masked, "ON", 0) {
        let mut condition = text[end..].trim();
        // Drop parentheses wrapping the whole condition.
        loop {
            let masked = mask_quoted(condition);
            if masked.starts_with('(') && matching_paren(&masked, 0) == Some(masked.len() - 1) {
                condition = condition[1..condition.len() - 1].trim();
            } else {
                break;
            }
        }
        return Ok(match EQUALITY.captures(condition) {
            Some(caps) => OnClause::Equality {
                fields: [caps[1].to_string(), caps[4].to_string()],
            },
            None => OnClause::Complex {
                condition: condition.to_string(),
            },
        });
    }
    if let Some((0, end)) = find_top_level_keyword(&masked, "USING", 0) {
        return Ok(OnClause::Using {
            columns: column_list(&text[end..]),
        });
    }
    Err(UnisqlError::parse(whole, format!("unexpected text in join: '{text}'")))
}

/// Split one comma-separated FROM item into its leading table reference and
/// `(join words, join body)` segments.
fn join_segments(item: &str) -> (&str, Vec<(&str, &str)>) {
    let masked = mask_quoted(item);
    let mut starts = Vec::new();
    let mut from = 0;
    while let Some((start, end)) = find_top_level_keyword(&masked, "JOIN", from) {
        let modifiers = JOIN_MODIFIERS
            .find(&masked[..start])
            .map(|m| m.start())
            .unwrap_or(start);
        starts.push((modifiers, start, end));
        from = end;
    }

    let head_end = starts.first().map(|(s, _, _)| *s).unwrap_or(item.len());
    let segments = starts
        .iter()
        .enumerate()
        .map(|(i, (words_start, join_at, body_start))| {
            let body_end = starts.get(i + 1).map(|(s, _, _)| *s).unwrap_or(item.len());
            (&item[*words_start..*join_at], &item[*body_start..body_end])
        })
        .collect();
    (&item[..head_end], segments)
}

/// Many-to-many pairing opened by joining a join table.
struct PendingPair {
    base: String,
    related: String,
    join_table: String,
    join_related_column: String,
    related_column: String,
}

struct Resolver<'s, S: SchemaSource + ?Sized> {
    schema: &'s mut S,
    relationships: HashMap<String, Relationships>,
    aliases: HashMap<String, String>,
    pending: HashMap<String, PendingPair>,
}

impl<S: SchemaSource + ?Sized> Resolver<'_, S> {
    fn relationships(&mut self, table: &str) -> UnisqlResult<&Relationships> {
        if !self.relationships.contains_key(table) {
            let rels = self.schema.get_relationships(table)?;
            self.relationships.insert(table.to_string(), rels);
        }
        Ok(&self.relationships[table])
    }

    fn table_for(&self, qualifier: &str) -> Option<&String> {
        self.aliases.get(&unquote_identifier(qualifier).to_ascii_lowercase())
    }

    /// Key an equality join, or `None` when the condition does not connect
    /// the joined table to one already present.
    fn equality_key(
        &mut self,
        caps: &regex::Captures<'_>,
        joined_ref: &str,
        joined_table: &str,
    ) -> UnisqlResult<Option<String>> {
        let left = (caps[2].to_string(), unquote_identifier(&caps[3]));
        let right = (caps[5].to_string(), unquote_identifier(&caps[6]));
        let is_joined = |q: &str| unquote_identifier(q).eq_ignore_ascii_case(joined_ref);

        let ((base_ref, base_column), joined_column) = match (is_joined(&left.0), is_joined(&right.0)) {
            (false, true) => (left, right.1),
            (true, false) => (right, left.1),
            _ => return Ok(None),
        };
        let Some(base_table) = self.table_for(&base_ref).cloned() else {
            return Ok(None);
        };
        let base_key = unquote_identifier(&base_ref).to_ascii_lowercase();

        // Second half of a many-to-many pairing.
        if let Some(pair) = self.pending.get(&base_key) {
            if pair.related == joined_table
                && pair.join_related_column == base_column
                && pair.related_column == joined_column
            {
                return Ok(Some(format!("{}_{}{{{}}}", pair.base, pair.related, pair.join_table)));
            }
        }

        let rels = self.relationships(&base_table)?;

        let opened = rels.many_to_many.iter().find(|rel| {
            rel.join_table.as_deref() == Some(joined_table)
                && rel.column == base_column
                && rel.join_column.as_deref() == Some(joined_column.as_str())
        });
        if let Some(rel) = opened {
            let pair = PendingPair {
                base: base_table.clone(),
                related: rel.related_table.clone(),
                join_table: joined_table.to_string(),
                join_related_column: rel.join_related_column.clone().unwrap_or_default(),
                related_column: rel.related_column.clone(),
            };
            let key = format!("{}_{}{{{}}}_join", pair.base, pair.related, pair.join_table);
            self.pending.insert(joined_ref.to_ascii_lowercase(), pair);
            return Ok(Some(key));
        }

        let route = rels
            .iter()
            .filter(|(kind, _)| *kind != RelationshipKind::ManyToMany)
            .find(|(_, rel)| {
                rel.related_table == joined_table
                    && rel.column == base_column
                    && rel.related_column == joined_column
            })
            .map(|(kind, rel)| Relationships::route(kind, rel).to_string())
            .unwrap_or(base_column);

        Ok(Some(format!("{base_table}_{joined_table}{{{route}}}")))
    }
}

/// Resolve a FROM clause into keyed join descriptors.
///
/// Comma-separated tables become `CROSS JOIN`s. Equality joins are keyed
/// `base_joined{route}` where the route is the column naming the
/// relationship; many-to-many pairs through a join table are keyed
/// `base_related{join_table}_join` and `base_related{join_table}`. Other
/// conditions are keyed `root_complex_N`, joins without a condition
/// `root_simple_N`, where `root` is the first table of the clause.
pub fn parse_joins<S: SchemaSource + ?Sized>(from: &str, schema: &mut S) -> UnisqlResult<FromClause> {
    let whole = from.trim();
    if whole.is_empty() {
        return Err(UnisqlError::parse(from, "empty FROM clause"));
    }

    let mut resolver = Resolver {
        schema,
        relationships: HashMap::new(),
        aliases: HashMap::new(),
        pending: HashMap::new(),
    };
    let mut root: Option<(String, Option<String>)> = None;
    let mut joins: IndexMap<String, JoinDescriptor> = IndexMap::new();
    let mut complex = 0usize;
    let mut simple = 0usize;

    let insert = |joins: &mut IndexMap<String, JoinDescriptor>, key: String, join: JoinDescriptor| {
        if joins.contains_key(&key) {
            return Err(UnisqlError::parse(whole, format!("duplicate join '{key}'")));
        }
        joins.insert(key, join);
        Ok(())
    };

    for item in split_top_level(whole, ',') {
        let (head, segments) = join_segments(item);
        let (table, alias, rest) = table_reference(whole, head)?;
        if !rest.is_empty() {
            return Err(UnisqlError::parse(whole, format!("unexpected text after table: '{rest}'")));
        }
        resolver.aliases.insert(
            alias.as_deref().unwrap_or(&table).to_ascii_lowercase(),
            table.clone(),
        );

        match root.as_ref().map(|(t, _)| t.clone()) {
            None => root = Some((table, alias)),
            Some(root_table) => {
                let key = format!("{root_table}_simple_{simple}");
                simple += 1;
                insert(
                    &mut joins,
                    key,
                    JoinDescriptor {
                        join_type: JoinType::Cross,
                        table_name: table,
                        table_alias: alias,
                        on_clause: OnClause::None,
                    },
                )?;
            }
        }

        for (words, body) in segments {
            let (table, alias, rest) = table_reference(whole, body)?;
            let join = JoinDescriptor {
                join_type: JoinType::parse(words),
                on_clause: join_condition(whole, rest)?,
                table_name: table,
                table_alias: alias,
            };
            let reference = join.reference_name().to_string();
            resolver
                .aliases
                .insert(reference.to_ascii_lowercase(), join.table_name.clone());

            let root_table = root.as_ref().map(|(t, _)| t.clone()).unwrap_or_default();
            let equality_key = match &join.on_clause {
                OnClause::Equality { fields } => {
                    let condition = format!("{} = {}", fields[0], fields[1]);
                    match EQUALITY.captures(&condition) {
                        Some(caps) => resolver.equality_key(&caps, &reference, &join.table_name)?,
                        None => None,
                    }
                }
                _ => None,
            };
            let key = match (&join.on_clause, equality_key) {
                (_, Some(key)) => key,
                (OnClause::None | OnClause::Using { .. }, None) => {
                    simple += 1;
                    format!("{root_table}_simple_{}", simple - 1)
                }
                (_, None) => {
                    complex += 1;
                    format!("{root_table}_complex_{}", complex - 1)
                }
            };
            insert(&mut joins, key, join)?;
        }
    }

    let (table, alias) = root.ok_or_else(|| UnisqlError::parse(whole, "missing table"))?;
    Ok(FromClause { table, alias, joins })
}
