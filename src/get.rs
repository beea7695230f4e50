//! Item retrieval by id, for `dbic get`.
//!
//! Accepts either a full item id (`datasources/<source>/items/<key>`) or a
//! bare item key, which is resolved against the configured source.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::index::{IndexStore, SqliteIndex};
use crate::models::DocumentRecord;

/// Expand a bare key into the full item id for this source.
pub fn resolve_id(config: &Config, id: &str) -> String {
    if id.starts_with("datasources/") {
        id.to_string()
    } else {
        format!("datasources/{}/items/{}", config.connector.source_id, id)
    }
}

pub async fn get_item(config: &Config, id: &str) -> Result<DocumentRecord> {
    let index = SqliteIndex::open(&config.index).await?;
    let id = resolve_id(config, id);
    let item = index.get(&id).await;
    index.close().await;

    match item? {
        Some(doc) => Ok(doc),
        None => bail!("item not found: {}", id),
    }
}

/// CLI entry point: fetch the item and print it to stdout.
pub async fn run_get(config: &Config, id: &str, json: bool) -> Result<()> {
    let doc = get_item(config, id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("--- Item ---");
    println!("id:               {}", doc.id);
    println!(
        "title:            {}",
        doc.title.as_deref().unwrap_or("(untitled)")
    );
    if let Some(ref url) = doc.source_repository_url {
        println!("url:              {}", url);
    }
    if let Some(ref lang) = doc.content_language {
        println!("content_language: {}", lang);
    }
    if let Some(ref object_type) = doc.object_type {
        println!("object_type:      {}", object_type);
    }
    println!("item_type:        {}", doc.item_type.as_str());
    if let Some(ref t) = doc.create_time {
        println!("create_time:      {}", t);
    }
    if let Some(ref t) = doc.update_time {
        println!("update_time:      {}", t);
    }
    println!();

    println!("--- ACL ---");
    println!("readers:          {}", doc.acl.readers.join(", "));
    println!("public:           {}", doc.acl.public);
    if let Some(ref name) = doc.acl.inherited_from {
        println!("inherited_from:   {}", name);
    }
    println!();

    if !doc.structured.is_empty() {
        println!("--- Structured data ---");
        for (name, value) in &doc.structured {
            println!("{:<17} {}", format!("{}:", name), value);
        }
        println!();
    }

    if let Some(ref content) = doc.content {
        println!("--- Content ({}, {} bytes) ---", content.mime_type, content.data.len());
        if content.mime_type.starts_with("text/") {
            println!("{}", String::from_utf8_lossy(&content.data));
        }
        println!();
    }

    Ok(())
}
