//! End-to-end tests against SQLite.
//!
//! SQLite needs no server, so these run everywhere:
//! `cargo test --test sqlite_integration`

use pretty_assertions::assert_eq;
use unisql::prelude::*;

const SCHEMA: &str = "
    CREATE TABLE users (id integer AUTOINCREMENT, email varchar(120) NOT NULL, active boolean DEFAULT TRUE, PRIMARY KEY (id));
    CREATE TABLE teams (id integer PRIMARY KEY, name text NOT NULL);
    CREATE TABLE posts (id integer PRIMARY KEY, user_id integer REFERENCES users(id) ON DELETE CASCADE, title text);
    CREATE TABLE user_teams (user_id integer REFERENCES users(id), team_id integer REFERENCES teams(id), PRIMARY KEY (user_id, team_id));
    CREATE TABLE profiles (id integer PRIMARY KEY, user_id integer UNIQUE REFERENCES users(id), bio text)
";

fn memory() -> Connection {
    let mut conn = Connection::new(ConnectOptions::sqlite_memory()).expect("valid options");
    conn.connect().expect("in-memory database");
    conn
}

fn seeded() -> Connection {
    let mut conn = memory();
    conn.execute(SCHEMA).expect("schema");
    conn
}

fn single(conn: &mut Connection, sql: &str) -> QueryOutcome {
    conn.execute(sql)
        .and_then(Execution::into_single)
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
}

fn scalar(conn: &mut Connection, sql: &str) -> Value {
    single(conn, sql).into_result().fetch_scalar().unwrap()
}

#[test]
fn test_insert_ids_and_rows() {
    let mut conn = seeded();

    let first = single(&mut conn, "INSERT INTO users (email) VALUES ('a@example.com')");
    assert_eq!(first.auto_increment(), Some(1));
    assert_eq!(first.affected_rows(), 1);
    let second = single(&mut conn, "INSERT INTO users (email) VALUES ('b@example.com')");
    assert_eq!(second.auto_increment(), Some(2));

    let update = single(&mut conn, "UPDATE users SET active = FALSE WHERE id = 2");
    assert_eq!(update.affected_rows(), 1);
    assert_eq!(update.auto_increment(), None);

    let rows = single(&mut conn, "SELECT id, email, active FROM users ORDER BY id")
        .rows()
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["email"], Value::Text("a@example.com".into()));
    assert_eq!(rows[0]["active"], Value::Int(1));
    assert_eq!(rows[1]["active"], Value::Int(0));
    assert_eq!(
        scalar(&mut conn, "SELECT COUNT(*) FROM users WHERE active = TRUE"),
        Value::Int(1)
    );
}

#[test]
fn test_batches() {
    let mut conn = seeded();
    let execution = conn
        .execute("INSERT INTO teams (name) VALUES ('red'); INSERT INTO teams (name) VALUES ('blue');")
        .unwrap();
    let outcomes = execution.into_outcomes();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[1].auto_increment(), Some(2));

    assert!(matches!(
        conn.execute("SELECT 1; SELECT 2").unwrap().into_single(),
        Err(UnisqlError::Programmer(_))
    ));
    assert!(matches!(conn.execute("  ;  "), Err(UnisqlError::Programmer(_))));
}

#[test]
fn test_failed_statement_reports_both_texts() {
    let mut conn = memory();
    match conn.execute("SELECT * FROM missing WHERE flag = TRUE") {
        Err(UnisqlError::Sql { original, translated, message }) => {
            assert_eq!(original, "SELECT * FROM missing WHERE flag = TRUE");
            assert_eq!(translated, "SELECT * FROM missing WHERE flag = 1");
            assert!(message.contains("missing"));
        }
        other => panic!("expected an SQL error, got {:?}", other.err()),
    }
    // The connection stays usable.
    assert_eq!(scalar(&mut conn, "SELECT 1"), Value::Int(1));
}

#[test]
fn test_transactions() {
    let mut conn = seeded();

    single(&mut conn, "BEGIN");
    assert!(conn.in_transaction());
    assert!(matches!(conn.execute("BEGIN"), Err(UnisqlError::Programmer(_))));
    single(&mut conn, "INSERT INTO teams (name) VALUES ('green')");
    single(&mut conn, "ROLLBACK");
    assert!(!conn.in_transaction());
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM teams"), Value::Int(0));

    assert!(matches!(conn.execute("COMMIT"), Err(UnisqlError::Programmer(_))));

    single(&mut conn, "BEGIN");
    single(&mut conn, "INSERT INTO teams (name) VALUES ('green')");
    single(&mut conn, "COMMIT");
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM teams"), Value::Int(1));
}

#[test]
fn test_buffered_navigation() {
    let mut conn = seeded();
    conn.execute(
        "INSERT INTO teams (name) VALUES ('a'); INSERT INTO teams (name) VALUES ('b'); INSERT INTO teams (name) VALUES ('c')",
    )
    .unwrap();

    let mut result = single(&mut conn, "SELECT name FROM teams ORDER BY id").into_result();
    assert!(result.is_buffered());
    assert_eq!(result.row_count().unwrap(), 3);

    result.seek(2).unwrap();
    assert_eq!(result.fetch_scalar().unwrap(), Value::Text("c".into()));
    result.seek(0).unwrap();
    assert_eq!(result.fetch_scalar().unwrap(), Value::Text("a".into()));
    assert!(matches!(result.seek(3), Err(UnisqlError::Programmer(_))));

    let names: Vec<Value> = result
        .by_ref()
        .map(|row| row.unwrap()["name"].clone())
        .collect();
    assert_eq!(names.len(), 3);

    result.rewind().unwrap();
    assert_eq!(result.fetch_all_rows().unwrap().len(), 3);

    let mut empty = single(&mut conn, "SELECT * FROM teams WHERE id < 0").into_result();
    assert!(matches!(empty.ensure_rows(), Err(UnisqlError::NoResults(_))));
    assert!(matches!(empty.current(), Err(UnisqlError::NoRemainingRows(_))));
}

#[test]
fn test_unbuffered_results() {
    let mut conn = seeded();
    let values: Vec<String> = (1..=40).map(|i| format!("('team {i}')")).collect();
    single(
        &mut conn,
        &format!("INSERT INTO teams (name) VALUES {}", values.join(", ")),
    );

    let mut cursor = conn
        .execute_unbuffered("SELECT id, name FROM teams ORDER BY id")
        .unwrap();
    assert!(!cursor.is_buffered());
    assert!(matches!(cursor.row_count(), Err(UnisqlError::Programmer(_))));

    let first = cursor.fetch_row().unwrap();
    assert_eq!(first["id"], Value::Int(1));
    cursor.seek(5).unwrap();
    assert_eq!(cursor.current().unwrap()["id"], Value::Int(6));
    assert!(matches!(cursor.rewind(), Err(UnisqlError::Programmer(_))));
    assert!(matches!(cursor.seek(2), Err(UnisqlError::Programmer(_))));

    // Any other statement on the connection releases the cursor.
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM teams"), Value::Int(40));
    assert!(matches!(
        cursor.next(),
        Some(Err(UnisqlError::NoRemainingRows(_)))
    ));
    assert!(cursor.next().is_none());
}

#[test]
fn test_unbuffered_reads_to_the_end() {
    let mut conn = seeded();
    conn.execute("INSERT INTO teams (name) VALUES ('a'); INSERT INTO teams (name) VALUES ('b')")
        .unwrap();

    let rows = conn
        .execute_unbuffered("SELECT name FROM teams ORDER BY name")
        .unwrap()
        .collect::<UnisqlResult<Vec<Row>>>()
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["name"], Value::Text("b".into()));

    // Non-SELECT statements run buffered.
    let result = conn
        .execute_unbuffered("INSERT INTO teams (name) VALUES ('c')")
        .unwrap();
    assert!(result.is_buffered());
    assert_eq!(result.affected_rows(), 1);
}

#[test]
fn test_foreign_keys_are_enforced() {
    let mut conn = seeded();
    single(&mut conn, "INSERT INTO users (email) VALUES ('a@example.com')");
    single(&mut conn, "INSERT INTO users (email) VALUES ('b@example.com')");
    single(&mut conn, "INSERT INTO posts (user_id, title) VALUES (1, 'hello')");
    single(&mut conn, "INSERT INTO profiles (user_id, bio) VALUES (2, 'hi')");

    match conn.execute("INSERT INTO posts (user_id, title) VALUES (99, 'orphan')") {
        Err(UnisqlError::Sql { message, .. }) => {
            assert!(message.contains("violates foreign key constraint"), "{message}");
        }
        other => panic!("expected an SQL error, got {:?}", other.err()),
    }
    // NULL references nothing.
    single(&mut conn, "INSERT INTO posts (user_id, title) VALUES (NULL, 'anonymous')");

    // ON DELETE CASCADE
    single(&mut conn, "DELETE FROM users WHERE id = 1");
    assert_eq!(
        scalar(&mut conn, "SELECT COUNT(*) FROM posts WHERE user_id IS NOT NULL"),
        Value::Int(0)
    );

    // Default action refuses to orphan the profile.
    assert!(matches!(
        conn.execute("DELETE FROM users WHERE id = 2"),
        Err(UnisqlError::Sql { .. })
    ));
    assert!(matches!(
        conn.execute("UPDATE users SET id = 20 WHERE id = 2"),
        Err(UnisqlError::Sql { .. })
    ));
}

#[test]
fn test_drop_table_removes_parent_triggers() {
    let mut conn = seeded();
    let triggers = "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE '%posts%'";
    assert_eq!(scalar(&mut conn, triggers), Value::Int(4));

    single(&mut conn, "DROP TABLE posts");
    assert_eq!(scalar(&mut conn, triggers), Value::Int(0));

    single(&mut conn, "INSERT INTO users (email) VALUES ('a@example.com')");
    single(&mut conn, "DELETE FROM users WHERE id = 1");
}

#[test]
fn test_foreign_keys_on_reserved_table_names() {
    let mut conn = seeded();
    single(
        &mut conn,
        "CREATE TABLE \"order\" (id integer PRIMARY KEY, \"user_id\" integer REFERENCES \"users\" (\"id\") ON DELETE CASCADE)",
    );
    single(&mut conn, "INSERT INTO users (email) VALUES ('a@example.com')");
    single(&mut conn, "INSERT INTO \"order\" (user_id) VALUES (1)");
    assert!(matches!(
        conn.execute("INSERT INTO \"order\" (user_id) VALUES (99)"),
        Err(UnisqlError::Sql { .. })
    ));

    single(&mut conn, "DELETE FROM users WHERE id = 1");
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM \"order\""), Value::Int(0));

    single(&mut conn, "DROP TABLE \"order\"");
    assert_eq!(
        scalar(&mut conn, "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE '%order%'"),
        Value::Int(0)
    );
}

#[test]
fn test_create_table_as_select() {
    let mut conn = seeded();
    single(&mut conn, "INSERT INTO teams (name) VALUES ('red'), ('blue')");
    single(&mut conn, "CREATE TABLE team_names AS SELECT name FROM teams WHERE id > 1");
    assert_eq!(scalar(&mut conn, "SELECT name FROM team_names"), Value::Text("blue".into()));
    assert!(conn.schema().get_tables().unwrap().contains(&"team_names".to_string()));
}

#[test]
fn test_introspection() {
    let mut conn = seeded();
    let mut schema = conn.schema();

    assert_eq!(
        schema.get_tables().unwrap(),
        vec!["posts", "profiles", "teams", "user_teams", "users"]
    );

    let columns = schema.get_columns("users").unwrap();
    assert_eq!(
        columns.keys().collect::<Vec<_>>(),
        vec!["id", "email", "active"]
    );
    assert_eq!(columns["id"].column_type, ColumnType::Integer);
    assert!(columns["id"].auto_increment);
    assert!(columns["id"].not_null);
    assert_eq!(columns["email"].column_type, ColumnType::Varchar);
    assert_eq!(columns["email"].max_length, Some(120));
    assert!(columns["email"].not_null);
    assert_eq!(columns["active"].column_type, ColumnType::Boolean);
    assert!(!columns["active"].not_null);

    let keys = schema.get_keys("posts").unwrap();
    assert_eq!(keys.primary, vec!["id"]);
    assert_eq!(
        keys.foreign,
        vec![ForeignKey {
            column: "user_id".into(),
            foreign_table: "users".into(),
            foreign_column: "id".into(),
            on_delete: FkAction::Cascade,
            on_update: FkAction::NoAction,
        }]
    );
    assert_eq!(schema.get_keys("profiles").unwrap().unique, vec![vec!["user_id".to_string()]]);

    assert!(matches!(
        schema.get_column("users", "nope"),
        Err(UnisqlError::Programmer(_))
    ));
    assert!(matches!(schema.get_columns("ghost"), Err(UnisqlError::Programmer(_))));
}

#[test]
fn test_relationships() {
    let mut conn = seeded();
    let mut schema = conn.schema();

    let users = schema.get_relationships("users").unwrap();
    assert!(users.many_to_one.is_empty());
    assert_eq!(users.one_to_many.len(), 1);
    assert_eq!(users.one_to_many[0].related_table, "posts");
    assert_eq!(users.one_to_many[0].related_column, "user_id");
    assert_eq!(users.one_to_many[0].on_delete, Some(FkAction::Cascade));
    assert_eq!(users.one_to_one.len(), 1);
    assert_eq!(users.one_to_one[0].related_table, "profiles");
    assert_eq!(users.many_to_many.len(), 1);
    assert_eq!(users.many_to_many[0].related_table, "teams");
    assert_eq!(users.many_to_many[0].join_table.as_deref(), Some("user_teams"));
    assert_eq!(users.many_to_many[0].join_column.as_deref(), Some("user_id"));
    assert_eq!(users.many_to_many[0].join_related_column.as_deref(), Some("team_id"));

    let posts = schema.get_relationships("posts").unwrap();
    assert_eq!(posts.many_to_one.len(), 1);
    assert_eq!(posts.many_to_one[0].related_table, "users");

    let profiles = schema.get_relationships("profiles").unwrap();
    assert_eq!(profiles.one_to_one.len(), 1);
    assert_eq!(profiles.one_to_one[0].related_table, "users");

    assert!(schema.get_relationships("user_teams").unwrap().is_empty());
}

#[test]
fn test_schema_changes_flush_the_cache() {
    let mut conn = seeded();
    assert_eq!(conn.schema().get_tables().unwrap().len(), 5);
    single(&mut conn, "CREATE TABLE extra (id integer)");
    assert!(conn.schema().get_tables().unwrap().contains(&"extra".to_string()));
    single(&mut conn, "DROP TABLE extra");
    assert_eq!(conn.schema().get_tables().unwrap().len(), 5);
}

#[test]
fn test_joins_against_the_live_schema() {
    let mut conn = seeded();
    let clauses =
        parse_select_clauses("SELECT * FROM users JOIN posts ON users.id = posts.user_id WHERE users.active = TRUE")
            .unwrap();
    let mut schema = conn.schema();
    let from = parse_joins(clauses.get(Clause::From), &mut schema).unwrap();
    assert_eq!(from.table, "users");
    assert_eq!(from.joins.len(), 1);
    let join = from.joins.values().next().unwrap();
    assert_eq!(join.table_name, "posts");
    assert_eq!(join.join_type, JoinType::Inner);
}

#[test]
fn test_escaped_values_round_trip() {
    let mut conn = memory();
    single(&mut conn, "CREATE TABLE notes (body text, data blob, at timestamp, day date, done boolean)");

    let body = "O'Brien said \"hi\" \\ bye";
    let data: &[u8] = &[0, 1, 127, 255];
    let sql = format!(
        "INSERT INTO notes (body, data, at, day, done) VALUES ({}, {}, {}, {}, {})",
        conn.escape_string(body),
        conn.escape_blob(data),
        conn.escape_timestamp("2024-02-29T13:45:00").unwrap(),
        conn.escape_date("2024-02-29 23:59:59").unwrap(),
        conn.escape_boolean(true),
    );
    single(&mut conn, &sql);

    let row = single(&mut conn, "SELECT body, data, at, day, done FROM notes")
        .into_result()
        .fetch_row()
        .unwrap();
    assert_eq!(row["body"], Value::Text(body.into()));
    assert_eq!(row["data"], Value::Blob(data.to_vec()));
    assert_eq!(row["at"], Value::Text("2024-02-29 13:45:00".into()));
    assert_eq!(row["day"], Value::Text("2024-02-29".into()));
    assert_eq!(row["done"], Value::Int(1));

    let escaper = conn.escaper();
    assert!(escaper.unescape_boolean(&row["done"].to_string()).unwrap());
    assert_eq!(
        escaper.unescape_timestamp(row["at"].as_str().unwrap()).unwrap(),
        "2024-02-29 13:45:00"
    );
}

#[test]
fn test_backslashes_in_literals() {
    let mut conn = memory();
    assert_eq!(scalar(&mut conn, "SELECT 'it\\'s' AS v"), Value::Text("it's".into()));

    single(&mut conn, "CREATE TABLE paths (a text, b text)");
    let sql = format!(
        "INSERT INTO paths (a, b) VALUES ({}, 'TRUE')",
        conn.escape_string("C:\\")
    );
    single(&mut conn, &sql);
    let row = single(&mut conn, "SELECT a, b FROM paths").into_result().fetch_row().unwrap();
    assert_eq!(row["a"], Value::Text("C:\\".into()));
    assert_eq!(row["b"], Value::Text("TRUE".into()));
}

#[test]
fn test_temporal_functions() {
    let mut conn = memory();
    assert_eq!(
        scalar(
            &mut conn,
            "SELECT diff_seconds('2024-01-01 00:00:00', '2024-01-01 00:01:30')"
        ),
        Value::Int(90)
    );
    assert_eq!(
        scalar(&mut conn, "SELECT add_interval('2024-01-31 10:00:00', '+1 day')"),
        Value::Text("2024-02-01 10:00:00".into())
    );
    assert_eq!(scalar(&mut conn, "SELECT 'a' || 'b'"), Value::Text("ab".into()));
}

#[test]
fn test_connection_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let url = format!("sqlite://{}", path.display());

    {
        let mut conn = Connection::open(&url).unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.driver(), Driver::SqlxSqlite);
        single(&mut conn, "CREATE TABLE kv (k text PRIMARY KEY, v text)");
        single(&mut conn, "INSERT INTO kv (k, v) VALUES ('a', '1')");
        conn.close().unwrap();
        assert!(!conn.is_connected());

        // Statements reconnect on demand.
        assert_eq!(scalar(&mut conn, "SELECT v FROM kv"), Value::Text("1".into()));
        assert!(conn.is_connected());
    }

    let mut conn = Connection::open(&url).unwrap();
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM kv"), Value::Int(1));
    assert!(conn.query_time() > std::time::Duration::ZERO);
}

#[test]
fn test_statements_for_another_dialect_are_rejected() {
    let mut conn = memory();
    let stmt = unisql::translate("SELECT 1", Dialect::MySQL).unwrap();
    assert!(matches!(
        conn.execute_statement(stmt),
        Err(UnisqlError::Programmer(_))
    ));
}
