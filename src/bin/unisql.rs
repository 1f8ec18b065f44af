//! unisql: translate, run and introspect canonical SQL
//!
//! # Usage
//!
//! ```bash
//! # Show what a statement becomes on SQL Server
//! unisql translate "SELECT * FROM users LIMIT 10 OFFSET 20" --dialect mssql
//!
//! # Run it
//! unisql --database-url sqlite://app.db run "SELECT * FROM users"
//!
//! # Introspect
//! unisql --profile reporting relationships orders
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use tracing_subscriber::EnvFilter;
use unisql::config::Config;
use unisql::prelude::*;

#[derive(Parser)]
#[command(name = "unisql")]
#[command(version)]
#[command(about = "One canonical SQL dialect, four backends", long_about = None)]
#[command(after_help = "EXAMPLES:
    unisql translate 'CREATE TABLE t (id integer AUTOINCREMENT, ok boolean)' --dialect mysql
    unisql explain 'SELECT * FROM users JOIN posts ON users.id = posts.author_id' --schema schema.sql
    unisql --database-url sqlite://app.db run 'SELECT * FROM users' --format json")]
struct Cli {
    /// Database connection URL
    #[arg(long, global = true, env = "UNISQL_DATABASE_URL")]
    database_url: Option<String>,

    /// Connection profile from unisql.toml
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate canonical SQL into a dialect
    Translate {
        sql: String,
        #[arg(short, long, default_value = "sqlite")]
        dialect: String,
    },
    /// Show the clauses and resolved joins of a SELECT
    Explain {
        sql: String,
        /// File of CREATE TABLE statements to resolve joins against
        #[arg(long)]
        schema: Option<String>,
    },
    /// Execute SQL
    Run {
        sql: String,
        /// Stream rows instead of buffering them
        #[arg(long)]
        unbuffered: bool,
    },
    /// List tables
    Tables,
    /// Show the columns of a table
    Columns { table: String },
    /// Show the keys of a table
    Keys { table: String },
    /// Show the relationships of a table
    Relationships { table: String },
    /// Show supported dialects and their capabilities
    Dialects,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "unisql=debug" } else { "unisql=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Translate { sql, dialect } => translate(sql, dialect),
        Commands::Explain { sql, schema } => explain(cli, sql, schema.as_deref()),
        Commands::Run { sql, unbuffered } => execute(cli, sql, *unbuffered),
        Commands::Tables => {
            let mut conn = connect(cli)?;
            let tables = conn.schema().get_tables()?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tables)?),
                OutputFormat::Table => {
                    for table in &tables {
                        println!("{}", table.white());
                    }
                    println!();
                    println!("{} table(s)", tables.len().to_string().cyan());
                }
            }
            Ok(())
        }
        Commands::Columns { table } => {
            let mut conn = connect(cli)?;
            let columns = conn.schema().get_columns(table)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&columns)?),
                OutputFormat::Table => show_columns(&columns),
            }
            Ok(())
        }
        Commands::Keys { table } => {
            let mut conn = connect(cli)?;
            let keys = conn.schema().get_keys(table)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
                OutputFormat::Table => show_keys(&keys),
            }
            Ok(())
        }
        Commands::Relationships { table } => {
            let mut conn = connect(cli)?;
            let rels = conn.schema().get_relationships(table)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rels)?),
                OutputFormat::Table => show_relationships(&rels),
            }
            Ok(())
        }
        Commands::Dialects => {
            show_dialects();
            Ok(())
        }
    }
}

fn connect(cli: &Cli) -> Result<Connection> {
    let options = match &cli.database_url {
        Some(url) => ConnectOptions::from_url(url)?,
        None => Config::load()?
            .profile(cli.profile.as_deref())
            .context("no database: use --database-url, --profile, or set UNISQL_DATABASE_URL")?,
    };
    if cli.verbose {
        println!("{} {}", "Connecting to:".dimmed(), options);
    }
    let mut conn = Connection::new(options)?;
    conn.connect()?;
    Ok(conn)
}

fn translate(sql: &str, dialect: &str) -> Result<()> {
    let dialect: Dialect = dialect.parse()?;
    let statements = Translator::new(dialect).translate_all(sql)?;
    if statements.is_empty() {
        bail!("nothing to translate");
    }
    println!("{} {}", "Translated for".green().bold(), dialect.to_string().cyan().bold());
    for stmt in &statements {
        println!("{};", stmt.translated().white());
        for follow_up in stmt.follow_ups() {
            println!("{};", follow_up.dimmed());
        }
    }
    Ok(())
}

fn explain(cli: &Cli, sql: &str, schema_file: Option<&str>) -> Result<()> {
    println!("{}", "Clauses:".green().bold());
    let clauses = parse_select_clauses(sql)?;
    for (clause, text) in clauses.iter() {
        if !text.is_empty() {
            println!("  {:10} {}", clause.to_string().dimmed(), text.white());
        }
    }

    let from = clauses.get(Clause::From);
    if from.is_empty() {
        return Ok(());
    }

    let resolved = match schema_file {
        Some(path) => {
            let ddl = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            let mut schema = StaticSchema::from_ddl(Dialect::SQLite, &ddl)?;
            parse_joins(from, &mut schema)?
        }
        None if cli.database_url.is_some() || cli.profile.is_some() => {
            let mut conn = connect(cli)?;
            let mut schema = conn.schema();
            parse_joins(from, &mut schema)?
        }
        None => {
            println!();
            println!(
                "{}",
                "⚠ Joins need a schema. Use --schema <file> or a database connection.".yellow()
            );
            return Ok(());
        }
    };

    println!();
    println!("{} {}", "Root:".green().bold(), resolved.table.white());
    for (key, join) in &resolved.joins {
        println!("  {} {}", key.cyan(), join.to_sql().white());
    }
    Ok(())
}

fn execute(cli: &Cli, sql: &str, unbuffered: bool) -> Result<()> {
    let mut conn = connect(cli)?;
    if unbuffered {
        let rows = conn
            .execute_unbuffered(sql)?
            .collect::<UnisqlResult<Vec<Row>>>()?;
        format_output(&rows, cli.format)?;
        return Ok(());
    }

    for outcome in conn.execute(sql)?.into_outcomes() {
        if cli.verbose {
            println!("{} {}", "SQL:".dimmed(), outcome.statement().translated().yellow());
        }
        let affected = outcome.affected_rows();
        let insert_id = outcome.auto_increment();
        let kind = outcome.statement().kind();
        if kind == StatementKind::Select {
            let rows = outcome.rows()?;
            format_output(&rows, cli.format)?;
        } else {
            print!("{} {} rows affected", "✓".green(), affected);
            if let Some(id) = insert_id {
                print!(", id {}", id.to_string().cyan());
            }
            println!();
        }
    }
    if cli.verbose {
        println!("{} {:?}", "Query time:".dimmed(), conn.query_time());
    }
    Ok(())
}

fn format_output(rows: &[Row], format: OutputFormat) -> Result<()> {
    if rows.is_empty() {
        println!("{}", "(no results)".dimmed());
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Map<String, serde_json::Value>> = rows
                .iter()
                .map(|row| row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Table => {
            let columns: Vec<&String> = rows[0].keys().collect();

            let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
            for row in rows {
                for (i, col) in columns.iter().enumerate() {
                    let len = row.get(*col).map(|v| v.to_string().chars().count()).unwrap_or(0);
                    widths[i] = widths[i].max(len);
                }
            }

            let header: Vec<String> = columns
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:width$}", c, width = w))
                .collect();
            println!("{}", header.join(" │ ").white().bold());

            let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
            println!("{}", sep.join("─┼─").dimmed());

            for row in rows {
                let cells: Vec<String> = columns
                    .iter()
                    .zip(&widths)
                    .map(|(c, w)| {
                        let val = row.get(*c).map(Value::to_string).unwrap_or_default();
                        format!("{:width$}", val, width = w)
                    })
                    .collect();
                println!("{}", cells.join(" │ "));
            }

            println!();
            println!("{} row(s) returned", rows.len().to_string().cyan());
        }
    }
    Ok(())
}

fn show_columns(columns: &indexmap::IndexMap<String, ColumnInfo>) {
    println!(
        "{:24} {:10} {:8} {:8} {}",
        "Column".white().bold(),
        "Type".white().bold(),
        "Null".white().bold(),
        "Length".white().bold(),
        "Default".white().bold()
    );
    println!("{}", "─".repeat(72).dimmed());
    for (name, info) in columns {
        let mut type_name = info.column_type.to_string();
        if info.auto_increment {
            type_name.push('+');
        }
        println!(
            "{:24} {:10} {:8} {:8} {}",
            name.cyan(),
            type_name.yellow(),
            if info.not_null { "no" } else { "yes" },
            info.max_length.map(|n| n.to_string()).unwrap_or_default(),
            info.default
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_default()
                .dimmed()
        );
        if let Some(values) = &info.valid_values {
            println!("{:24} {} {}", "", "one of".dimmed(), values.join(", ").dimmed());
        }
    }
}

fn show_keys(keys: &KeySet) {
    println!("{} {}", "Primary:".green().bold(), keys.primary.join(", ").white());
    for unique in &keys.unique {
        println!("{} {}", "Unique:".green().bold(), unique.join(", ").white());
    }
    for fk in &keys.foreign {
        println!(
            "{} {} → {}.{} {}",
            "Foreign:".green().bold(),
            fk.column.cyan(),
            fk.foreign_table.white(),
            fk.foreign_column.white(),
            format!(
                "(on delete {}, on update {})",
                fk.on_delete.as_sql().to_lowercase(),
                fk.on_update.as_sql().to_lowercase()
            )
            .dimmed()
        );
    }
}

fn show_relationships(rels: &Relationships) {
    if rels.is_empty() {
        println!("{}", "(no relationships)".dimmed());
        return;
    }
    for (kind, rel) in rels.iter() {
        let kind = format!("{kind:?}");
        match &rel.join_table {
            Some(join) => println!(
                "{:11} {}.{} → {}.{} {}",
                kind.yellow(),
                rel.table.white(),
                rel.column.cyan(),
                rel.related_table.white(),
                rel.related_column.cyan(),
                format!("via {join}").dimmed()
            ),
            None => println!(
                "{:11} {}.{} → {}.{}",
                kind.yellow(),
                rel.table.white(),
                rel.column.cyan(),
                rel.related_table.white(),
                rel.related_column.cyan()
            ),
        }
    }
}

fn show_dialects() {
    println!("{}", "Supported dialects".cyan().bold());
    println!();
    println!(
        "{:10} {:14} {:12} {:10} {}",
        "Dialect".white().bold(),
        "Driver".white().bold(),
        "LIMIT/OFFSET".white().bold(),
        "FK".white().bold(),
        "Booleans".white().bold()
    );
    println!("{}", "─".repeat(64).dimmed());
    let yes_no = |b: bool| if b { "native" } else { "emulated" };
    for dialect in Dialect::ALL {
        let driver = match dialect.resolve_driver() {
            Ok(driver) => driver.to_string().green(),
            Err(_) => "unavailable".red(),
        };
        println!(
            "{:10} {:14} {:12} {:10} {}",
            dialect.to_string().cyan(),
            driver,
            yes_no(dialect.supports_limit_offset()),
            if dialect.enforces_foreign_keys() { "native" } else { "triggers" },
            if dialect.has_boolean_literals() { "TRUE/FALSE" } else { "1/0" }
        );
    }
}
