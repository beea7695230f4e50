//! Traversal scenarios against a real SQLite source.
//!
//! Each test seeds a throwaway database, writes a connector config pointing
//! at it, runs one or more traversal cycles, and inspects what reached the
//! index.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;
use tokio::sync::watch;

use db_index_connector::acl::AclMode;
use db_index_connector::config::{parse_config, Config};
use db_index_connector::db;
use db_index_connector::document::{BLOB_MIME, HTML_MIME};
use db_index_connector::error::RowError;
use db_index_connector::index::{InMemoryIndex, IndexStore, SqliteIndex};
use db_index_connector::models::{DocumentRecord, FieldValue, SqlValue};
use db_index_connector::query::SqliteSource;
use db_index_connector::schedule::{ConnectorHandle, Periods};
use db_index_connector::traversal::{Controller, CycleReport};

struct Env {
    _tmp: TempDir,
    root: PathBuf,
    source_path: PathBuf,
    /// Writer connection used to mutate the source between cycles.
    source: SqlitePool,
}

impl Env {
    async fn new(statements: &[&str]) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let source_path = root.join("source.sqlite");

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", source_path.display()))
            .unwrap()
            .create_if_missing(true);
        let source = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        let env = Self {
            _tmp: tmp,
            root,
            source_path,
            source,
        };
        env.exec(statements).await;
        env
    }

    async fn exec(&self, statements: &[&str]) {
        for stmt in statements {
            sqlx::query(stmt).execute(&self.source).await.unwrap();
        }
    }

    /// Build a config: `db` lines go in the `[db]` table, `rest` holds any
    /// further tables.
    fn config(&self, db: &str, rest: &str) -> Config {
        parse_config(&format!(
            r#"
[connector]
source_id = "mockdb"

[db]
url = "sqlite:{}"
{}

[index]
path = "{}"
max_retries = 1
retry_backoff_ms = 1

{}
"#,
            self.source_path.display(),
            db,
            self.root.join("index.sqlite").display(),
            rest
        ))
        .unwrap()
    }
}

async fn source_for(cfg: &Config) -> Arc<SqliteSource> {
    let pool = db::connect_source(&cfg.db).await.unwrap();
    Arc::new(SqliteSource::new(pool))
}

/// Run one full cycle into a fresh in-memory index.
async fn full_once(cfg: &Config) -> (CycleReport, Arc<InMemoryIndex>) {
    let index = Arc::new(InMemoryIndex::new());
    let (_tx, rx) = watch::channel(false);
    let ctl = Controller::new(cfg, source_for(cfg).await, index.clone(), rx);
    let report = ctl.run_full().await.unwrap();
    (report, index)
}

async fn item(index: &dyn IndexStore, key: &str) -> DocumentRecord {
    let id = format!("datasources/mockdb/items/{}", key);
    index
        .get(&id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("item {} not indexed", id))
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

const PEOPLE: &[&str] = &[
    "CREATE TABLE people (id TEXT PRIMARY KEY, name TEXT, phone TEXT)",
    "INSERT INTO people VALUES ('x1', 'Jones May', '2124567890')",
];

const PEOPLE_DB: &str = r#"
all_records_sql = "select id, name, phone from people"
all_columns = ["id", "name", "phone"]
"#;

#[tokio::test]
async fn happy_flow_single_row() {
    let env = Env::new(PEOPLE).await;
    let cfg = env.config(
        PEOPLE_DB,
        r#"
[url]
columns = ["id", "name"]

[content_template]
title = "name"
"#,
    );

    let (report, index) = full_once(&cfg).await;
    assert_eq!(report.rows, 1);
    assert_eq!(report.indexed, 1);
    assert!(report.errors.is_empty());

    let doc = item(index.as_ref(), "x1").await;
    assert_eq!(doc.id, "datasources/mockdb/items/x1");
    assert_eq!(doc.title.as_deref(), Some("x1"));
    assert_eq!(doc.source_repository_url.as_deref(), Some("x1"));
    assert!(doc.acl.readers.is_empty());
    assert!(!doc.acl.public);

    let content = doc.content.unwrap();
    assert_eq!(content.mime_type, HTML_MIME);
    let html = String::from_utf8(content.data).unwrap();
    assert!(html.contains("<title>Jones May</title>"));
    assert!(html.contains("<small>2124567890</small>"));
}

#[tokio::test]
async fn columns_outside_all_columns_are_not_indexed() {
    let env = Env::new(PEOPLE).await;
    let cfg = env.config(
        r#"
all_records_sql = "select id, name, phone from people"
all_columns = ["name", "id"]
"#,
        "",
    );

    let (report, index) = full_once(&cfg).await;
    assert_eq!(report.indexed, 1);

    let doc = item(index.as_ref(), "x1").await;
    let html = String::from_utf8(doc.content.unwrap().data).unwrap();
    assert!(html.contains("<small>Jones May</small>"));
    assert!(!html.contains("2124567890"));
    assert!(!html.contains("phone"));
    let name_at = html.find("id='name'").unwrap();
    let id_at = html.find("id='id'").unwrap();
    assert!(name_at < id_at);
}

#[tokio::test]
async fn url_format_substitutes_columns() {
    let env = Env::new(PEOPLE).await;
    let cfg = env.config(
        PEOPLE_DB,
        r#"
[url]
columns = ["id"]
format = "http://example.com/employee/{0}"

[item_metadata.title]
field = "name"
"#,
    );

    let (_, index) = full_once(&cfg).await;
    let doc = item(index.as_ref(), "x1").await;
    assert_eq!(doc.title.as_deref(), Some("Jones May"));
    assert_eq!(
        doc.source_repository_url.as_deref(),
        Some("http://example.com/employee/x1")
    );
}

#[tokio::test]
async fn structured_fields_are_typed() {
    let env = Env::new(&[
        "CREATE TABLE employee (id TEXT PRIMARY KEY, textField TEXT, integerField INTEGER, \
         booleanField BOOLEAN, doubleField REAL, dateField DATE, timestampField DATETIME, \
         enumField INTEGER)",
        "INSERT INTO employee VALUES ('x1', 'Jones May', 2000, 1, 2000.0, '2019-01-24', \
         '2019-01-24 14:21:23.400', 2)",
    ])
    .await;
    let cfg = env.config(
        r#"
all_records_sql = "select id, textField, integerField, booleanField, doubleField, dateField, timestampField, enumField from employee"
all_columns = ["id", "textField", "integerField", "booleanField", "doubleField", "dateField", "timestampField", "enumField"]
"#,
        r#"
[structured_data.fields]
textField = "text"
integerField = "integer"
booleanField = "boolean"
doubleField = "double"
dateField = "date"
timestampField = "timestamp"
enumField = "enum"
"#,
    );

    let (report, index) = full_once(&cfg).await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let doc = item(index.as_ref(), "x1").await;
    assert_eq!(doc.field("textField"), Some(&FieldValue::Text("Jones May".into())));
    assert_eq!(doc.field("integerField"), Some(&FieldValue::Integer(2000)));
    assert_eq!(doc.field("booleanField"), Some(&FieldValue::Boolean(true)));
    assert_eq!(doc.field("doubleField"), Some(&FieldValue::Double(2000.0)));
    assert_eq!(
        doc.field("dateField"),
        Some(&FieldValue::Date("2019-01-24".into()))
    );
    assert_eq!(
        doc.field("timestampField"),
        Some(&FieldValue::Timestamp("2019-01-24 14:21:23.400".into()))
    );
    assert_eq!(doc.field("enumField"), Some(&FieldValue::Enum(2)));

    let names: Vec<&str> = doc.structured.iter().map(|(n, _)| n.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[tokio::test]
async fn array_columns_expand_in_order() {
    let env = Env::new(&[
        "CREATE TABLE tagged (id TEXT PRIMARY KEY, tags TEXT, scores TEXT)",
        r#"INSERT INTO tagged VALUES ('x1', '["b", "a", "c"]', '[3, 1, 2]')"#,
    ])
    .await;
    let cfg = env.config(
        r#"
all_records_sql = "select id, tags, scores from tagged"
all_columns = ["id", "tags", "scores"]
"#,
        r#"
[structured_data.fields]
tags = "text[]"
scores = "integer[]"
"#,
    );

    let (_, index) = full_once(&cfg).await;
    let doc = item(index.as_ref(), "x1").await;
    assert_eq!(
        doc.field("tags"),
        Some(&FieldValue::List(vec![
            FieldValue::Text("b".into()),
            FieldValue::Text("a".into()),
            FieldValue::Text("c".into()),
        ]))
    );
    assert_eq!(
        doc.field("scores"),
        Some(&FieldValue::List(vec![
            FieldValue::Integer(3),
            FieldValue::Integer(1),
            FieldValue::Integer(2),
        ]))
    );
}

#[tokio::test]
async fn defaults_fill_null_attributes() {
    let env = Env::new(&[
        "CREATE TABLE people (id TEXT PRIMARY KEY, name TEXT, lang TEXT, link TEXT)",
        "INSERT INTO people VALUES ('x1', NULL, NULL, NULL)",
        "INSERT INTO people VALUES ('x2', 'Named', 'fr-FR', 'http://example.com/x2')",
    ])
    .await;
    let cfg = env.config(
        r#"
all_records_sql = "select id, name, lang, link from people"
all_columns = ["id", "name", "lang", "link"]
"#,
        r#"
[item_metadata.title]
field = "name"
default_value = "Untitled"

[item_metadata.content_language]
field = "lang"
default_value = "en-US"

[item_metadata.source_repository_url]
field = "link"
default_value = "http://example.com/default"
"#,
    );

    let (_, index) = full_once(&cfg).await;
    let x1 = item(index.as_ref(), "x1").await;
    assert_eq!(x1.title.as_deref(), Some("Untitled"));
    assert_eq!(x1.content_language.as_deref(), Some("en-US"));
    assert_eq!(
        x1.source_repository_url.as_deref(),
        Some("http://example.com/default")
    );

    let x2 = item(index.as_ref(), "x2").await;
    assert_eq!(x2.title.as_deref(), Some("Named"));
    assert_eq!(x2.content_language.as_deref(), Some("fr-FR"));
    assert_eq!(
        x2.source_repository_url.as_deref(),
        Some("http://example.com/x2")
    );
}

#[tokio::test]
async fn blob_column_is_indexed_as_raw_content() {
    let env = Env::new(&[
        "CREATE TABLE files (id TEXT PRIMARY KEY, data BLOB)",
        "INSERT INTO files VALUES ('f1', X'0102FF')",
    ])
    .await;
    let cfg = env.config(
        r#"
all_records_sql = "select id, data from files"
all_columns = ["id", "data"]
blob_column = "data"
"#,
        "",
    );

    let (_, index) = full_once(&cfg).await;
    let content = item(index.as_ref(), "f1").await.content.unwrap();
    assert_eq!(content.mime_type, BLOB_MIME);
    assert_eq!(content.data, vec![0x01, 0x02, 0xFF]);
}

#[tokio::test]
async fn opaque_values_fall_back_to_byte_marker_unless_cast() {
    let statements = [
        "CREATE TABLE shapes (id TEXT PRIMARY KEY, testcol BLOB)",
        "INSERT INTO shapes VALUES ('s1', X'414243')",
    ];

    let env = Env::new(&statements).await;
    let raw = env.config(
        r#"
all_records_sql = "select id, testcol from shapes"
all_columns = ["id", "testcol"]
"#,
        r#"
[item_metadata.title]
field = "testcol"
"#,
    );
    let (report, index) = full_once(&raw).await;
    assert!(report.errors.is_empty());
    let title = item(index.as_ref(), "s1").await.title.unwrap();
    assert!(title.starts_with("[B@"), "title was {}", title);

    let cast = env.config(
        r#"
all_records_sql = "select id, CAST(testcol AS TEXT) AS testcol from shapes"
all_columns = ["id", "testcol"]
"#,
        r#"
[item_metadata.title]
field = "testcol"
"#,
    );
    let (_, index) = full_once(&cast).await;
    assert_eq!(item(index.as_ref(), "s1").await.title.as_deref(), Some("ABC"));
}

#[tokio::test]
async fn acl_modes_combine_row_and_default_readers() {
    let env = Env::new(&[
        "CREATE TABLE docs (id TEXT PRIMARY KEY, readers_users TEXT)",
        "INSERT INTO docs VALUES ('with', 'google:u2')",
        "INSERT INTO docs VALUES ('without', NULL)",
    ])
    .await;

    let cases = [
        (AclMode::Fallback, vec!["google:u2"], vec!["google:u1"]),
        (AclMode::Append, vec!["google:u2", "google:u1"], vec!["google:u1"]),
        (AclMode::Override, vec!["google:u1"], vec!["google:u1"]),
        (AclMode::None, vec!["google:u2"], vec![]),
    ];

    for (mode, expected_with, expected_without) in cases {
        let mode_name = format!("{:?}", mode).to_lowercase();
        let cfg = env.config(
            r#"
all_records_sql = "select id, readers_users from docs"
all_columns = ["id", "readers_users"]
"#,
            &format!(
                r#"
[default_acl]
mode = "{}"
readers_users = ["google:u1"]
name = "defaults"
"#,
                mode_name
            ),
        );

        let (_, index) = full_once(&cfg).await;
        let with = item(index.as_ref(), "with").await;
        let without = item(index.as_ref(), "without").await;
        assert_eq!(with.acl.readers, expected_with, "mode {}", mode_name);
        assert_eq!(without.acl.readers, expected_without, "mode {}", mode_name);
    }
}

#[tokio::test]
async fn offset_pagination_reads_every_page() {
    let env = Env::new(&[
        "CREATE TABLE people (id TEXT PRIMARY KEY, name TEXT)",
        "INSERT INTO people VALUES ('p1', 'a'), ('p2', 'b'), ('p3', 'c'), ('p4', 'd'), ('p5', 'e')",
    ])
    .await;
    let cfg = env.config(
        r#"
all_records_sql = "select id, name from people order by id limit 2 offset ?"
all_columns = ["id", "name"]
pagination = "offset"
"#,
        "",
    );

    let (report, index) = full_once(&cfg).await;
    assert_eq!(report.rows, 5);
    assert_eq!(report.indexed, 5);
    assert_eq!(index.len(), 5);
}

#[tokio::test]
async fn row_errors_do_not_stop_the_cycle() {
    let env = Env::new(&[
        "CREATE TABLE people (id TEXT, age TEXT)",
        "INSERT INTO people VALUES ('p1', '41'), (NULL, '12'), ('p3', 'old')",
    ])
    .await;
    let cfg = env.config(
        r#"
all_records_sql = "select id, age from people"
all_columns = ["id", "age"]
"#,
        r#"
[structured_data.fields]
age = "integer"
"#,
    );

    let (report, index) = full_once(&cfg).await;
    assert_eq!(report.rows, 3);
    assert_eq!(report.indexed, 1);
    assert_eq!(report.errors.len(), 2);
    assert!(matches!(report.errors[0], RowError::MissingUniqueKey { .. }));
    assert!(matches!(report.errors[1], RowError::Coercion { .. }));
    assert_eq!(
        item(index.as_ref(), "p1").await.field("age"),
        Some(&FieldValue::Integer(41))
    );
}

#[tokio::test]
async fn full_traversals_pick_up_updates_and_delete_once() {
    let env = Env::new(&[
        "CREATE TABLE people (id TEXT PRIMARY KEY, name TEXT)",
        "INSERT INTO people VALUES ('p1', 'Jones May'), ('p2', 'Joe Smith')",
    ])
    .await;
    let cfg = env.config(
        r#"
all_records_sql = "select id, name from people"
all_columns = ["id", "name"]
"#,
        r#"
[item_metadata.title]
field = "name"
"#,
    );

    let index = Arc::new(InMemoryIndex::new());
    let handle = ConnectorHandle::start_with_periods(
        &cfg,
        source_for(&cfg).await,
        index.clone(),
        Periods {
            full: Duration::from_millis(20),
            incremental: Duration::from_secs(3600),
        },
    );
    let stats = handle.stats();
    wait_until("first full traversal", || stats.full_cycles() >= 1).await;

    env.exec(&[
        "UPDATE people SET name = 'Jones Mayer' WHERE id = 'p1'",
        "DELETE FROM people WHERE id = 'p2'",
    ])
    .await;
    let count = stats.full_cycles();
    wait_until("two more full traversals", || stats.full_cycles() > count + 2).await;
    handle.stop().await;

    assert_eq!(
        item(index.as_ref(), "p1").await.title.as_deref(),
        Some("Jones Mayer")
    );
    let p2 = "datasources/mockdb/items/p2";
    assert!(index.get(p2).await.unwrap().is_none());
    assert_eq!(index.delete_count(p2), 1);
    assert_eq!(stats.snapshot().items_deleted, 1);
}

const MODIFIED: &[&str] = &[
    "CREATE TABLE people (id TEXT PRIMARY KEY, name TEXT, modified INTEGER, readers_users TEXT)",
    "INSERT INTO people VALUES ('p1', 'Jones May', 100, 'google:u1')",
    "INSERT INTO people VALUES ('p2', 'Joe Smith', 200, 'google:u1')",
];

const MODIFIED_DB: &str = r#"
all_records_sql = "select id, name, modified, readers_users from people"
all_columns = ["id", "name", "modified", "readers_users"]
incremental_update_sql = "select id, name, modified, readers_users from people where modified > ?"
watermark_column = "modified"
"#;

const TITLE_FROM_NAME: &str = r#"
[item_metadata.title]
field = "name"
"#;

#[tokio::test]
async fn incremental_traversals_push_changes_without_deleting() {
    let env = Env::new(MODIFIED).await;
    let cfg = env.config(MODIFIED_DB, TITLE_FROM_NAME);

    let index = Arc::new(InMemoryIndex::new());
    let handle = ConnectorHandle::start_with_periods(
        &cfg,
        source_for(&cfg).await,
        index.clone(),
        Periods {
            full: Duration::from_secs(3600),
            incremental: Duration::from_millis(20),
        },
    );
    let stats = handle.stats();
    wait_until("first full traversal", || stats.full_cycles() >= 1).await;

    env.exec(&[
        "UPDATE people SET name = 'Jones Mayer', modified = 300 WHERE id = 'p1'",
        "UPDATE people SET readers_users = 'google:u1, google:u3', modified = 310 WHERE id = 'p2'",
        "INSERT INTO people VALUES ('p3', 'New Hire', 320, 'google:u2')",
    ])
    .await;
    let count = stats.incremental_cycles();
    wait_until("two more incremental traversals", || {
        stats.incremental_cycles() > count + 2
    })
    .await;

    env.exec(&["DELETE FROM people WHERE id = 'p3'"]).await;
    let count = stats.incremental_cycles();
    wait_until("another incremental traversal", || {
        stats.incremental_cycles() > count + 1
    })
    .await;
    let controller = handle.controller();
    handle.stop().await;

    assert_eq!(
        item(index.as_ref(), "p1").await.title.as_deref(),
        Some("Jones Mayer")
    );
    assert_eq!(
        item(index.as_ref(), "p2").await.acl.readers,
        vec!["google:u1", "google:u3"]
    );
    // Incremental traversals never delete.
    assert_eq!(
        item(index.as_ref(), "p3").await.title.as_deref(),
        Some("New Hire")
    );
    assert_eq!(stats.snapshot().items_deleted, 0);
    assert_eq!(controller.current_watermark().await, Some(SqlValue::Int(320)));
    assert_eq!(
        index.load_checkpoint("mockdb:watermark").await.unwrap(),
        Some(SqlValue::Int(320))
    );
}

#[tokio::test]
async fn acl_changes_reach_the_index_incrementally() {
    let env = Env::new(MODIFIED).await;
    let cfg = env.config(
        MODIFIED_DB,
        r#"
[default_acl]
mode = "append"
readers_users = ["google:admins"]
"#,
    );

    let index = Arc::new(InMemoryIndex::new());
    let (_tx, rx) = watch::channel(false);
    let ctl = Controller::new(&cfg, source_for(&cfg).await, index.clone(), rx);
    ctl.run_full().await.unwrap();
    assert_eq!(
        item(index.as_ref(), "p1").await.acl.readers,
        vec!["google:u1", "google:admins"]
    );

    env.exec(&["UPDATE people SET readers_users = 'google:u9', modified = 500 WHERE id = 'p1'"])
        .await;
    let report = ctl.run_incremental().await.unwrap();
    assert_eq!(report.rows, 1);
    assert_eq!(report.indexed, 1);
    assert_eq!(
        item(index.as_ref(), "p1").await.acl.readers,
        vec!["google:u9", "google:admins"]
    );

    env.exec(&["UPDATE people SET readers_users = NULL, modified = 600 WHERE id = 'p1'"])
        .await;
    ctl.run_incremental().await.unwrap();
    assert_eq!(
        item(index.as_ref(), "p1").await.acl.readers,
        vec!["google:admins"]
    );
}

#[tokio::test]
async fn deletions_and_watermark_survive_restart() {
    let env = Env::new(MODIFIED).await;
    let cfg = env.config(MODIFIED_DB, TITLE_FROM_NAME);

    {
        let index = Arc::new(SqliteIndex::open(&cfg.index).await.unwrap());
        let (_tx, rx) = watch::channel(false);
        let ctl = Controller::new(&cfg, source_for(&cfg).await, index.clone(), rx);
        ctl.run_full().await.unwrap();
        index.close().await;
    }

    env.exec(&["DELETE FROM people WHERE id = 'p2'"]).await;

    let index = Arc::new(SqliteIndex::open(&cfg.index).await.unwrap());
    assert_eq!(
        index.load_checkpoint("mockdb:watermark").await.unwrap(),
        Some(SqlValue::Int(200))
    );
    let (_tx, rx) = watch::channel(false);
    let ctl = Controller::new(&cfg, source_for(&cfg).await, index.clone(), rx);
    let report = ctl.run_full().await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.deleted, 1);
    assert!(index
        .get("datasources/mockdb/items/p2")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn run_once_stops_after_first_full_traversal() {
    let env = Env::new(PEOPLE).await;
    let mut cfg = env.config(PEOPLE_DB, "");
    cfg.connector.run_once = true;

    let index = Arc::new(InMemoryIndex::new());
    let handle = ConnectorHandle::start(&cfg, source_for(&cfg).await, index.clone());
    let stats = handle.stats();
    tokio::time::timeout(Duration::from_secs(10), handle.await_terminated())
        .await
        .expect("connector did not stop");

    assert_eq!(stats.full_cycles(), 1);
    assert_eq!(index.len(), 1);
}

#[tokio::test]
async fn unreachable_source_fails_at_startup() {
    let env = Env::new(PEOPLE).await;
    let mut cfg = env.config(PEOPLE_DB, "");
    cfg.db.url = format!("sqlite:{}", env.root.join("missing.sqlite").display());
    assert!(db::connect_source(&cfg.db).await.is_err());
}
