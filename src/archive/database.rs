//! SQLite archive of run metadata, error traces, noise traces, and test output.
//!
//! Tables:
//! - `metadata`: one row per phase item; columns follow the metadata file
//! - `groupdata`: one row per group used by a phase item
//! - `errordata`: `avgError:` lines from the run log
//! - `noisedata`: `noiseData:` lines from the run log
//! - one table per test name, from `<test>_<trial>*.test` files
//!
//! Every run gets `run_id = max(run_id) + 1`; every phase item gets a fresh
//! `id` shared by its metadata, group, error, and noise rows.

use crate::core::metadata::{parse_metadata, MetadataRecord};
use crate::core::types::DatabaseConfig;
use indexmap::IndexMap;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction};
use std::path::{Path, PathBuf};

const ERROR_TAG: &str = "avgError:";
const NOISE_TAG: &str = "noiseData:";
const TEST_HEADERS: &str = "test_headers";

/// Archive `run_dir` into the configured database.
/// Returns `None` on success and `Some(run_dir)` when anything failed.
pub fn push_run_data(run_dir: &Path, config: &DatabaseConfig) -> Option<PathBuf> {
    match archive_run(run_dir, &config.path) {
        Ok(run_id) => {
            log::info!("archived {} as run_id {}", run_dir.display(), run_id);
            None
        }
        Err(e) => {
            log::warn!("cannot archive {}: {}", run_dir.display(), e);
            Some(run_dir.to_path_buf())
        }
    }
}

/// Ingest every archivable file in `run_dir` in one transaction. Returns the
/// allocated `run_id`.
pub fn archive_run(run_dir: &Path, db_path: &Path) -> Result<i64, String> {
    let mut conn = Connection::open(db_path)
        .map_err(|e| format!("failed to open {}: {e}", db_path.display()))?;
    let records = read_metadata(run_dir)?;

    let tx = conn
        .transaction()
        .map_err(|e| format!("transaction start failed: {e}"))?;
    init_tables(&tx, &records)?;
    let run_id = next_value(&tx, "run_id")?;
    let mut items = ItemIds {
        next: next_value(&tx, "id")?,
        ids: IndexMap::new(),
    };

    push_metadata(&tx, run_id, &mut items, &records)?;
    for log in files(run_dir, "*.log")? {
        push_log(&tx, run_id, &mut items, &log)?;
    }
    push_tests(&tx, run_dir, run_id)?;

    tx.commit()
        .map_err(|e| format!("transaction commit failed: {e}"))?;
    Ok(run_id)
}

fn files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, String> {
    let pattern = Path::new(&glob::Pattern::escape(&dir.to_string_lossy())).join(pattern);
    let pattern = pattern.to_string_lossy();
    let mut paths: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| format!("bad pattern {}: {}", pattern, e))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();
    Ok(paths)
}

fn read_metadata(run_dir: &Path) -> Result<Vec<MetadataRecord>, String> {
    let mut records = Vec::new();
    for path in files(run_dir, "*.metadata")? {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        records.extend(parse_metadata(&content));
    }
    Ok(records)
}

/// Quote an identifier (`group` is a keyword).
fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Integer, then real, then text.
fn infer(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(x) = raw.parse::<f64>() {
        Value::Real(x)
    } else {
        Value::Text(raw.to_string())
    }
}

fn sql_type(v: &Value) -> &'static str {
    match v {
        Value::Integer(_) => "INTEGER",
        Value::Real(_) => "REAL",
        _ => "TEXT",
    }
}

fn init_tables(tx: &Transaction<'_>, records: &[MetadataRecord]) -> Result<(), String> {
    let mut columns: IndexMap<&str, &'static str> = IndexMap::new();
    columns.insert("id", "INTEGER");
    columns.insert("run_id", "INTEGER");
    for rec in records.iter().filter(|r| !r.group) {
        for (k, v) in &rec.fields {
            columns.entry(k.as_str()).or_insert_with(|| sql_type(&infer(v)));
        }
    }
    let defs: Vec<String> = columns.iter().map(|(c, t)| format!("{} {}", quote(c), t)).collect();
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS metadata ({});
        CREATE TABLE IF NOT EXISTS groupdata (
            id INTEGER, run_id INTEGER, \"group\" TEXT, units INTEGER,
            activation_type TEXT, error_computation_type TEXT
        );
        CREATE TABLE IF NOT EXISTS errordata (
            id INTEGER, run_id INTEGER, run_trial INTEGER, trial INTEGER, error REAL
        );
        CREATE TABLE IF NOT EXISTS noisedata (
            id INTEGER, run_id INTEGER, noise_type TEXT, noise_object TEXT, noise_amount REAL
        );",
        defs.join(", ")
    ))
    .map_err(|e| format!("schema init failed: {e}"))?;

    // metadata from older runs may lack columns added since
    let existing = table_columns(tx, "metadata")?;
    for (c, t) in columns.iter().filter(|(c, _)| !existing.iter().any(|e| e == *c)) {
        tx.execute(&format!("ALTER TABLE metadata ADD COLUMN {} {}", quote(c), t), [])
            .map_err(|e| format!("cannot add metadata column {}: {e}", c))?;
    }
    Ok(())
}

fn table_columns(tx: &Transaction<'_>, table: &str) -> Result<Vec<String>, String> {
    let mut stmt = tx
        .prepare(&format!("PRAGMA table_info({})", quote(table)))
        .map_err(|e| format!("prepare failed: {e}"))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| format!("query failed: {e}"))?;
    rows.map(|r| r.map_err(|e| format!("row read failed: {e}")))
        .collect()
}

/// `max(column) + 1` over `metadata`, starting at 1.
fn next_value(tx: &Transaction<'_>, column: &str) -> Result<i64, String> {
    let max: Option<i64> = tx
        .query_row(&format!("SELECT MAX({}) FROM metadata", quote(column)), [], |row| row.get(0))
        .map_err(|e| format!("cannot read max {}: {e}", column))?;
    Ok(max.unwrap_or(0) + 1)
}

/// Phase item name to archive id, allocated on first sight.
struct ItemIds {
    next: i64,
    ids: IndexMap<String, i64>,
}

impl ItemIds {
    fn get(&mut self, item: &str) -> i64 {
        if let Some(id) = self.ids.get(item) {
            return *id;
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(item.to_string(), id);
        id
    }
}

fn insert(tx: &Transaction<'_>, table: &str, columns: &[String], values: Vec<Value>) -> Result<(), String> {
    let names: Vec<String> = columns.iter().map(|c| quote(c)).collect();
    let marks: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
    tx.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(table),
            names.join(", "),
            marks.join(", ")
        ),
        params_from_iter(values),
    )
    .map_err(|e| format!("insert into {} failed: {e}", table))?;
    Ok(())
}

fn push_metadata(
    tx: &Transaction<'_>,
    run_id: i64,
    items: &mut ItemIds,
    records: &[MetadataRecord],
) -> Result<(), String> {
    for rec in records {
        let item = rec.get("phase_item").unwrap_or_default();
        let mut columns = vec!["id".to_string(), "run_id".to_string()];
        let mut values = vec![Value::Integer(items.get(item)), Value::Integer(run_id)];
        for (k, v) in &rec.fields {
            // group rows carry the item only to find its id
            if rec.group && k == "phase_item" {
                continue;
            }
            columns.push(k.clone());
            values.push(infer(v));
        }
        let table = if rec.group { "groupdata" } else { "metadata" };
        insert(tx, table, &columns, values)?;
    }
    Ok(())
}

fn push_log(tx: &Transaction<'_>, run_id: i64, items: &mut ItemIds, path: &Path) -> Result<(), String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let columns = |names: [&str; 5]| -> Vec<String> { names.iter().map(|s| s.to_string()).collect() };
    let error_cols = columns(["id", "run_id", "run_trial", "trial", "error"]);
    let noise_cols = columns(["id", "run_id", "noise_type", "noise_object", "noise_amount"]);

    for line in content.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        let (table, cols) = match fields.first().copied() {
            Some(ERROR_TAG) => ("errordata", &error_cols),
            Some(NOISE_TAG) => ("noisedata", &noise_cols),
            _ => continue,
        };
        if fields.len() < 5 {
            log::debug!("{}: short trace line '{}'", path.display(), line);
            continue;
        }
        let mut values = vec![Value::Integer(items.get(fields[1])), Value::Integer(run_id)];
        values.extend(fields[2..5].iter().map(|f| infer(f)));
        insert(tx, table, cols, values)?;
    }
    Ok(())
}

/// Column names and definitions: `run_id`, `run_trial`, then `test_headers` lines.
fn test_fields(run_dir: &Path) -> Result<Vec<(String, String)>, String> {
    let mut fields = vec![
        ("run_id".to_string(), "run_id INTEGER".to_string()),
        ("run_trial".to_string(), "run_trial INTEGER".to_string()),
    ];
    let headers = run_dir.join(TEST_HEADERS);
    if headers.is_file() {
        let content = std::fs::read_to_string(&headers)
            .map_err(|e| format!("cannot read {}: {}", headers.display(), e))?;
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let ty = parts.next().unwrap_or("TEXT");
            fields.push((name.to_string(), format!("{} {}", quote(name), ty)));
        }
    }
    Ok(fields)
}

fn push_tests(tx: &Transaction<'_>, run_dir: &Path, run_id: i64) -> Result<(), String> {
    let tests = files(run_dir, "*.test")?;
    if tests.is_empty() {
        return Ok(());
    }
    let fields = test_fields(run_dir)?;
    let defs: Vec<&str> = fields.iter().map(|(_, d)| d.as_str()).collect();
    let names: Vec<String> = fields.iter().map(|(n, _)| n.clone()).collect();

    for path in tests {
        let stem = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut parts = stem.trim_end_matches(".test").split('_');
        let test_name = parts.next().unwrap_or_default().to_string();
        let trial = parts.next().unwrap_or("0").to_string();

        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            quote(&test_name),
            defs.join(", ")
        ))
        .map_err(|e| format!("cannot create test table {}: {e}", test_name))?;

        let content = std::fs::read_to_string(&path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let mut values = vec![Value::Integer(run_id), infer(&trial)];
            values.extend(line.trim_end_matches('\t').split('\t').map(infer));
            values.truncate(names.len());
            let columns = &names[..values.len()];
            insert(tx, &test_name, columns, values)?;
        }
    }
    Ok(())
}
