//! # db-index-connector
//!
//! Indexes the rows of a relational database into a search index and keeps
//! the index consistent over time.
//!
//! Every row returned by a configured SQL query becomes one index item with
//! an id derived from its unique-key columns, a title, a URL, timestamps,
//! typed structured fields, an access-control list, and content. Full
//! traversals re-enumerate the source and remove items whose rows vanished;
//! incremental traversals fetch only rows changed since a stored watermark.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌─────────────────┐   ┌────────────┐
//! │ RowSource │──▶│ QueryExecutor│──▶│ DocumentBuilder │──▶│ IndexStore │
//! │  (sqlx)   │   │ snapshot/inc │   │ schema + acl    │   │  (sqlx)    │
//! └───────────┘   └──────────────┘   └─────────────────┘   └────────────┘
//!                         ▲
//!                ┌────────┴────────┐
//!                │   Controller    │  full + incremental loops
//!                └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Rows, field values, documents |
//! | [`schema`] | Field type hints and value coercion |
//! | [`query`] | Row sources and paginated query cursors |
//! | [`acl`] | Default ACL policy resolution |
//! | [`document`] | Row to document mapping |
//! | [`index`] | Index store trait and implementations |
//! | [`traversal`] | Full and incremental cycles |
//! | [`schedule`] | Traversal loops and shutdown |
//! | [`stats`] | Traversal counters and index overview |
//! | [`db`] | Database connections |
//! | [`migrate`] | Index schema |
//! | [`logging`] | tracing subscriber setup |

pub mod acl;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod get;
pub mod index;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod query;
pub mod schedule;
pub mod schema;
pub mod stats;
pub mod traversal;
