//! Fingerprint persistence: pretty JSON or a SQLite database.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::corpus::Corpus;
use crate::error::{Error, Result};
use crate::hashing::FingerprintTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    Json,
    Sqlite,
}

impl StoreFormat {
    /// `.json` is text; `.db`, `.sqlite` and `.sqlite3` are SQLite.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(StoreFormat::Json),
            Some("db" | "sqlite" | "sqlite3") => Ok(StoreFormat::Sqlite),
            _ => Err(Error::Config(format!(
                "cannot infer fingerprint store format from {}",
                path.display()
            ))),
        }
    }
}

/// Serialized layout shared by both formats.
#[derive(Serialize, Deserialize)]
struct StoredCorpus {
    fingerprinted_files: Vec<(String, FingerprintTable)>,
    total_fingerprints: usize,
    file_names: Vec<String>,
}

pub fn save(corpus: &Corpus, path: &Path) -> Result<()> {
    match StoreFormat::from_path(path)? {
        StoreFormat::Json => save_json(corpus, path),
        StoreFormat::Sqlite => save_sqlite(corpus, path),
    }?;
    info!(
        path = %path.display(),
        files = corpus.len(),
        fingerprints = corpus.total_fingerprints(),
        "Fingerprints saved"
    );
    Ok(())
}

pub fn load(path: &Path) -> Result<Corpus> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let corpus = match StoreFormat::from_path(path)? {
        StoreFormat::Json => load_json(path),
        StoreFormat::Sqlite => load_sqlite(path),
    }?;
    info!(
        path = %path.display(),
        files = corpus.len(),
        fingerprints = corpus.total_fingerprints(),
        "Fingerprints loaded"
    );
    Ok(corpus)
}

fn save_json(corpus: &Corpus, path: &Path) -> Result<()> {
    let stored = StoredCorpus {
        fingerprinted_files: corpus
            .iter()
            .map(|(name, table)| (name.to_string(), table.clone()))
            .collect(),
        total_fingerprints: corpus.total_fingerprints(),
        file_names: corpus.file_names().to_vec(),
    };
    fs::write(path, serde_json::to_string_pretty(&stored)?)?;
    Ok(())
}

fn load_json(path: &Path) -> Result<Corpus> {
    let stored: StoredCorpus = serde_json::from_str(&fs::read_to_string(path)?)?;
    Ok(Corpus::from_parts(
        stored.fingerprinted_files,
        stored.total_fingerprints,
    ))
}

fn setup_database(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            file_id     INTEGER PRIMARY KEY AUTOINCREMENT,
            file_name   TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS fingerprints (
            hash        TEXT NOT NULL,
            time_offset INTEGER NOT NULL,
            file_id     INTEGER NOT NULL,
            FOREIGN KEY (file_id) REFERENCES files (file_id)
        );
        CREATE INDEX IF NOT EXISTS idx_hash ON fingerprints (hash);
        CREATE TABLE IF NOT EXISTS metadata (
            key         TEXT PRIMARY KEY,
            value       INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

fn save_sqlite(corpus: &Corpus, path: &Path) -> Result<()> {
    let mut conn = Connection::open(path)?;
    setup_database(&conn)?;

    let tx = conn.transaction()?;
    tx.execute_batch("DELETE FROM fingerprints; DELETE FROM files; DELETE FROM metadata;")?;
    {
        let mut insert_file = tx.prepare("INSERT INTO files (file_name) VALUES (?1)")?;
        let mut insert_fingerprint = tx.prepare(
            "INSERT INTO fingerprints (hash, time_offset, file_id) VALUES (?1, ?2, ?3)",
        )?;
        for (name, table) in corpus.iter() {
            insert_file.execute(params![name])?;
            let file_id = tx.last_insert_rowid();
            for (hash, offsets) in table {
                for offset in offsets {
                    insert_fingerprint.execute(params![hash, *offset as i64, file_id])?;
                }
            }
        }
    }
    tx.execute(
        "INSERT INTO metadata (key, value) VALUES ('total_fingerprints', ?1)",
        params![corpus.total_fingerprints() as i64],
    )?;
    tx.commit()?;
    Ok(())
}

fn load_sqlite(path: &Path) -> Result<Corpus> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;

    let mut files: Vec<(i64, String)> = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT file_id, file_name FROM files ORDER BY file_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        for row in rows {
            files.push(row?);
        }
    }

    let mut tables: HashMap<i64, FingerprintTable> = HashMap::new();
    {
        let mut stmt = conn
            .prepare("SELECT file_id, hash, time_offset FROM fingerprints ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<usize, i64>(0)?,
                row.get::<usize, String>(1)?,
                row.get::<usize, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (file_id, hash, offset) = row?;
            tables
                .entry(file_id)
                .or_default()
                .entry(hash)
                .or_default()
                .push(offset.max(0) as usize);
        }
    }

    let total: i64 = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'total_fingerprints'",
            [],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(0),
            other => Err(other),
        })?;

    let fingerprinted_files = files
        .into_iter()
        .map(|(file_id, name)| (name, tables.remove(&file_id).unwrap_or_default()))
        .collect();
    Ok(Corpus::from_parts(fingerprinted_files, total.max(0) as usize))
}
