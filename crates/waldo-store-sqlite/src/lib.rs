#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};
use waldo_domain::{
    format_rfc3339, now_utc, parse_rfc3339_utc, CatalogSnapshot, ConnectionDescriptor,
    ContentHash, ContextId, ContextKey, EventRecord, EventRow, EventType, OutlierScore,
    PipelineSnapshot, RunId, SampleId, SampleIdUniqueness, SampleTableConfig, WaldoConfig,
    WaldoError,
};
use waldo_store_core::{unsupported, GatewayTransaction, Row, StorageGateway, Table};

const WALDO_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS catalogs (
  hash TEXT PRIMARY KEY,
  content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipelines (
  hash TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL CHECK (length(run_id) = 36),
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'after_catalog_created',
      'before_node_run',
      'after_node_run',
      'on_node_error',
      'before_pipeline_run',
      'after_pipeline_run',
      'on_pipeline_error',
      'before_dataset_loaded',
      'after_dataset_loaded',
      'before_dataset_saved',
      'after_dataset_saved'
    )
  ),
  target_id TEXT,
  target_name TEXT,
  timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contexts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL CHECK (length(run_id) = 36),
  algorithm TEXT NOT NULL,
  parameters TEXT NOT NULL,
  UNIQUE(run_id, algorithm, parameters)
);

CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, id);

CREATE TRIGGER IF NOT EXISTS trg_events_no_update
BEFORE UPDATE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_events_no_delete
BEFORE DELETE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_catalogs_no_update
BEFORE UPDATE ON catalogs
BEGIN
  SELECT RAISE(FAIL, 'catalogs is immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_catalogs_no_delete
BEFORE DELETE ON catalogs
BEGIN
  SELECT RAISE(FAIL, 'catalogs is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_pipelines_no_update
BEFORE UPDATE ON pipelines
BEGIN
  SELECT RAISE(FAIL, 'pipelines is immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_pipelines_no_delete
BEFORE DELETE ON pipelines
BEGIN
  SELECT RAISE(FAIL, 'pipelines is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_contexts_no_update
BEFORE UPDATE ON contexts
BEGIN
  SELECT RAISE(FAIL, 'contexts is immutable');
END;
";

/// `outlier_score` points at the caller's samples table, so its DDL depends
/// on the configured table and id column.
fn outlier_score_ddl(samples: &SampleTableConfig) -> String {
    let sample_fk = match samples.id_uniqueness {
        SampleIdUniqueness::Enforced => format!(
            ",\n  FOREIGN KEY (sample_id) REFERENCES {}({})",
            quote_ident(&samples.table),
            quote_ident(&samples.id_column)
        ),
        SampleIdUniqueness::Unchecked => String::new(),
    };
    format!(
        "CREATE TABLE IF NOT EXISTS outlier_score (
  context_id INTEGER NOT NULL,
  sample_id INTEGER NOT NULL,
  score REAL NOT NULL,
  prediction INTEGER NOT NULL CHECK (prediction IN (0,1)),
  PRIMARY KEY (context_id, sample_id),
  FOREIGN KEY (context_id) REFERENCES contexts(id){sample_fk}
);

CREATE INDEX IF NOT EXISTS idx_os_score ON outlier_score(score);"
    )
}

pub struct SqliteGateway {
    conn: Connection,
    samples: SampleTableConfig,
}

impl SqliteGateway {
    /// Open or create a `SQLite` database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path, config: &WaldoConfig) -> Result<Self, WaldoError> {
        let conn = Connection::open(path).map_err(|err| {
            storage_error(
                &format!("failed to open sqlite database at {}", path.display()),
                &err,
            )
        })?;
        debug!(path = %path.display(), "opened sqlite gateway");
        Self::configure(conn, config)
    }

    /// # Errors
    /// Returns an error if the in-memory database cannot be configured.
    pub fn open_in_memory(config: &WaldoConfig) -> Result<Self, WaldoError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| storage_error("failed to open in-memory sqlite database", &err))?;
        Self::configure(conn, config)
    }

    /// Opens the database named by `config.con`.
    ///
    /// # Errors
    /// Returns [`WaldoError::Configuration`] for connection URIs of other drivers.
    pub fn from_config(config: &WaldoConfig) -> Result<Self, WaldoError> {
        match config.connection()? {
            ConnectionDescriptor::SqliteMemory => Self::open_in_memory(config),
            ConnectionDescriptor::SqliteFile(path) => Self::open(&path, config),
            ConnectionDescriptor::Other { scheme, .. } => Err(WaldoError::Configuration(format!(
                "unsupported connection scheme `{scheme}`: only sqlite is available"
            ))),
        }
    }

    fn configure(conn: Connection, config: &WaldoConfig) -> Result<Self, WaldoError> {
        config.samples.validate()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|err| storage_error("failed to configure sqlite pragmas", &err))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(|err| storage_error("failed to configure sqlite busy timeout", &err))?;

        Ok(Self {
            conn,
            samples: config.samples.clone(),
        })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn samples(&self) -> &SampleTableConfig {
        &self.samples
    }

    /// # Errors
    /// Returns an error if the count query fails.
    pub fn count_rows(&self, table: Table) -> Result<i64, WaldoError> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table.as_str()), [], |row| {
                row.get(0)
            })
            .map_err(|err| storage_error(&format!("failed to count {}", table.as_str()), &err))
    }

    /// # Errors
    /// Returns an error if the lookup fails or the stored hash is malformed.
    pub fn get_catalog(&self, hash: &ContentHash) -> Result<Option<CatalogSnapshot>, WaldoError> {
        let row = self
            .conn
            .query_row(
                "SELECT hash, content FROM catalogs WHERE hash = ?1",
                params![hash.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|err| storage_error("failed to load catalog snapshot", &err))?;

        row.map(|(hash, content)| {
            Ok(CatalogSnapshot {
                hash: ContentHash::parse(&hash)?,
                content,
            })
        })
        .transpose()
    }

    /// # Errors
    /// Returns an error if the lookup fails or the stored hash is malformed.
    pub fn get_pipeline(&self, hash: &ContentHash) -> Result<Option<PipelineSnapshot>, WaldoError> {
        let row = self
            .conn
            .query_row(
                "SELECT hash, name, content FROM pipelines WHERE hash = ?1",
                params![hash.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| storage_error("failed to load pipeline snapshot", &err))?;

        row.map(|(hash, name, content)| {
            Ok(PipelineSnapshot {
                hash: ContentHash::parse(&hash)?,
                name,
                content,
            })
        })
        .transpose()
    }

    /// Events of one run in insertion order.
    ///
    /// # Errors
    /// Returns an error if the query fails or a stored row is malformed.
    pub fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>, WaldoError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, event_type, target_id, target_name, timestamp
                 FROM events
                 WHERE run_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(|err| storage_error("failed to prepare event listing", &err))?;

        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|err| storage_error("failed to list events", &err))?;

        let mut events = Vec::new();
        for row in rows {
            let (id, run_id, event_type, target_id, target_name, timestamp) =
                row.map_err(|err| storage_error("failed to read event row", &err))?;
            events.push(EventRow {
                id,
                event: EventRecord {
                    run_id: RunId::parse(&run_id)?,
                    event_type: EventType::parse(&event_type)?,
                    target_id,
                    target_name,
                    timestamp: parse_rfc3339_utc(&timestamp)?,
                },
            });
        }
        Ok(events)
    }

    /// # Errors
    /// Returns an error if the lookup fails or the stored run id is malformed.
    pub fn get_context(&self, context_id: ContextId) -> Result<Option<ContextKey>, WaldoError> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, algorithm, parameters FROM contexts WHERE id = ?1",
                params![context_id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| storage_error("failed to load context", &err))?;

        row.map(|(run_id, algorithm, parameters)| {
            Ok(ContextKey {
                run_id: RunId::parse(&run_id)?,
                algorithm,
                parameters,
            })
        })
        .transpose()
    }

    /// # Errors
    /// Returns an error if the lookup fails.
    pub fn get_score(
        &self,
        context_id: ContextId,
        sample_id: SampleId,
    ) -> Result<Option<OutlierScore>, WaldoError> {
        self.conn
            .query_row(
                "SELECT score, prediction FROM outlier_score WHERE context_id = ?1 AND sample_id = ?2",
                params![context_id.0, sample_id.0],
                |row| {
                    Ok(OutlierScore {
                        context_id,
                        sample_id,
                        score: row.get(0)?,
                        prediction: sql_to_bool(row.get(1)?),
                    })
                },
            )
            .optional()
            .map_err(|err| storage_error("failed to load outlier score", &err))
    }

    /// Creates the smallest samples table that satisfies the configured contract.
    ///
    /// # Errors
    /// Returns an error if the table cannot be created.
    pub fn create_minimal_samples_table(&self) -> Result<(), WaldoError> {
        let id_decl = match self.samples.id_uniqueness {
            SampleIdUniqueness::Enforced => "INTEGER PRIMARY KEY",
            SampleIdUniqueness::Unchecked => "INTEGER NOT NULL",
        };
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} ({} {id_decl}, label TEXT);",
                quote_ident(&self.samples.table),
                quote_ident(&self.samples.id_column)
            ))
            .map_err(|err| storage_error("failed to create minimal samples table", &err))
    }

    /// # Errors
    /// Returns an error if the row cannot be inserted.
    pub fn seed_sample(&self, sample_id: SampleId) -> Result<(), WaldoError> {
        self.conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {}({}) VALUES (?1)",
                    quote_ident(&self.samples.table),
                    quote_ident(&self.samples.id_column)
                ),
                params![sample_id.0],
            )
            .map_err(|err| storage_error("failed to seed samples row", &err))?;
        Ok(())
    }
}

impl StorageGateway for SqliteGateway {
    fn migrate(&mut self) -> Result<(), WaldoError> {
        ensure_samples_contract(&self.conn, &self.samples)?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .map_err(|err| storage_error("failed to apply waldo schema", &err))?;
        self.conn
            .execute_batch(&outlier_score_ddl(&self.samples))
            .map_err(|err| storage_error("failed to apply outlier_score schema", &err))?;

        let now = format_rfc3339(now_utc())?;
        let registered = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![WALDO_SCHEMA_VERSION, now],
            )
            .map_err(|err| storage_error("failed to register waldo schema migration", &err))?;

        if registered == 1 {
            info!(version = WALDO_SCHEMA_VERSION, "applied waldo schema");
        } else {
            debug!(version = WALDO_SCHEMA_VERSION, "waldo schema already current");
        }
        Ok(())
    }

    fn with_transaction<T, F>(&mut self, f: F) -> Result<T, WaldoError>
    where
        F: FnOnce(&mut dyn GatewayTransaction) -> Result<T, WaldoError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| storage_error("failed to start write transaction", &err))?;

        let value = {
            let mut scope = SqliteTransaction {
                conn: &tx,
                samples: &self.samples,
            };
            f(&mut scope)?
        };

        tx.commit()
            .map_err(|err| storage_error("failed to commit write transaction", &err))?;
        Ok(value)
    }
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
    samples: &'a SampleTableConfig,
}

impl SqliteTransaction<'_> {
    fn sample_exists(&self, sample_id: SampleId) -> Result<bool, WaldoError> {
        let found = self
            .conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
                    quote_ident(&self.samples.table),
                    quote_ident(&self.samples.id_column)
                ),
                params![sample_id.0],
                |_| Ok(()),
            )
            .optional()
            .map_err(|err| storage_error("failed to look up sample", &err))?
            .is_some();
        Ok(found)
    }

    fn upsert_score(&self, score: &OutlierScore) -> Result<(), WaldoError> {
        if self.samples.id_uniqueness == SampleIdUniqueness::Unchecked
            && !self.sample_exists(score.sample_id)?
        {
            return Err(WaldoError::UnknownSample(score.sample_id));
        }

        let result = self.conn.execute(
            "INSERT INTO outlier_score(context_id, sample_id, score, prediction)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(context_id, sample_id) DO UPDATE SET
               score = excluded.score,
               prediction = excluded.prediction",
            params![
                score.context_id.0,
                score.sample_id.0,
                score.score,
                bool_to_sql(score.prediction)
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_foreign_key_violation(&err) => {
                if self.sample_exists(score.sample_id)? {
                    Err(WaldoError::UnknownContext(score.context_id))
                } else {
                    Err(WaldoError::UnknownSample(score.sample_id))
                }
            }
            Err(err) => Err(storage_error("failed to upsert outlier score", &err)),
        }
    }
}

impl GatewayTransaction for SqliteTransaction<'_> {
    fn insert_if_absent(&mut self, row: Row<'_>) -> Result<bool, WaldoError> {
        let changed = match row {
            Row::Catalog(snapshot) => self
                .conn
                .execute(
                    "INSERT INTO catalogs(hash, content) VALUES (?1, ?2)
                     ON CONFLICT(hash) DO NOTHING",
                    params![snapshot.hash.as_str(), snapshot.content],
                )
                .map_err(|err| storage_error("failed to insert catalog snapshot", &err))?,
            Row::Pipeline(snapshot) => self
                .conn
                .execute(
                    "INSERT INTO pipelines(hash, name, content) VALUES (?1, ?2, ?3)
                     ON CONFLICT(hash) DO NOTHING",
                    params![snapshot.hash.as_str(), snapshot.name, snapshot.content],
                )
                .map_err(|err| storage_error("failed to insert pipeline snapshot", &err))?,
            Row::Context(key) => self
                .conn
                .execute(
                    "INSERT INTO contexts(run_id, algorithm, parameters) VALUES (?1, ?2, ?3)
                     ON CONFLICT(run_id, algorithm, parameters) DO NOTHING",
                    params![key.run_id.to_string(), key.algorithm, key.parameters],
                )
                .map_err(|err| storage_error("failed to insert context", &err))?,
            Row::Event(_) | Row::OutlierScore(_) => {
                return Err(unsupported("insert_if_absent", &row));
            }
        };
        Ok(changed == 1)
    }

    fn insert(&mut self, row: Row<'_>) -> Result<i64, WaldoError> {
        match row {
            Row::Event(event) => {
                self.conn
                    .execute(
                        "INSERT INTO events(run_id, event_type, target_id, target_name, timestamp)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            event.run_id.to_string(),
                            event.event_type.as_str(),
                            event.target_id,
                            event.target_name,
                            format_rfc3339(event.timestamp)?,
                        ],
                    )
                    .map_err(|err| storage_error("failed to append event", &err))?;
            }
            Row::Catalog(_) | Row::Pipeline(_) | Row::Context(_) | Row::OutlierScore(_) => {
                return Err(unsupported("insert", &row));
            }
        }
        Ok(self.conn.last_insert_rowid())
    }

    fn upsert(&mut self, row: Row<'_>) -> Result<(), WaldoError> {
        match row {
            Row::OutlierScore(score) => self.upsert_score(score),
            Row::Catalog(_) | Row::Pipeline(_) | Row::Event(_) | Row::Context(_) => {
                Err(unsupported("upsert", &row))
            }
        }
    }

    fn find_context(&mut self, key: &ContextKey) -> Result<Option<ContextId>, WaldoError> {
        self.conn
            .query_row(
                "SELECT id FROM contexts WHERE run_id = ?1 AND algorithm = ?2 AND parameters = ?3",
                params![key.run_id.to_string(), key.algorithm, key.parameters],
                |row| row.get(0).map(ContextId),
            )
            .optional()
            .map_err(|err| storage_error("failed to look up context", &err))
    }
}

/// Lock contention surfaces as a retryable timeout; everything else is a
/// plain storage failure.
fn storage_error(action: &str, err: &rusqlite::Error) -> WaldoError {
    match err {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            WaldoError::StorageTimeout(format!("{action}: {err}"))
        }
        _ => WaldoError::Storage(format!("{action}: {err}")),
    }
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

fn ensure_samples_contract(conn: &Connection, samples: &SampleTableConfig) -> Result<(), WaldoError> {
    samples.validate()?;
    if !table_exists(conn, &samples.table)? {
        return Err(WaldoError::Configuration(format!(
            "samples table `{}` does not exist; create it before migrating",
            samples.table
        )));
    }

    let columns = table_columns(conn, &samples.table)?;
    let Some(id_column) = columns
        .iter()
        .find(|column| column.name == samples.id_column)
    else {
        return Err(WaldoError::Configuration(format!(
            "samples table `{}` has no column `{}`",
            samples.table, samples.id_column
        )));
    };

    if samples.id_uniqueness == SampleIdUniqueness::Enforced {
        let sole_primary_key =
            id_column.pk_position > 0 && columns.iter().filter(|c| c.pk_position > 0).count() == 1;
        if !sole_primary_key && !has_unique_index_on(conn, &samples.table, &samples.id_column)? {
            return Err(WaldoError::Configuration(format!(
                "samples.{} MUST be unique when id_uniqueness is enforced",
                samples.id_column
            )));
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, WaldoError> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .map_err(|err| storage_error("failed to query sqlite_master", &err))?
        .is_some();

    Ok(exists)
}

struct ColumnInfo {
    name: String,
    pk_position: i64,
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<ColumnInfo>, WaldoError> {
    let context = format!("failed to inspect table_info for {table_name}");
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table_name)))
        .map_err(|err| storage_error(&context, &err))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                pk_position: row.get(5)?,
            })
        })
        .map_err(|err| storage_error(&context, &err))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|err| storage_error(&context, &err))?);
    }
    Ok(columns)
}

fn has_unique_index_on(conn: &Connection, table_name: &str, column: &str) -> Result<bool, WaldoError> {
    let context = format!("failed to inspect index_list for {table_name}");
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({})", quote_ident(table_name)))
        .map_err(|err| storage_error(&context, &err))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)?)))
        .map_err(|err| storage_error(&context, &err))?;

    let mut unique_indexes = Vec::new();
    for row in rows {
        let (index_name, is_unique) = row.map_err(|err| storage_error(&context, &err))?;
        if is_unique == 1 {
            unique_indexes.push(index_name);
        }
    }

    for index_name in unique_indexes {
        if index_columns(conn, &index_name)? == [column] {
            return Ok(true);
        }
    }
    Ok(false)
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>, WaldoError> {
    let context = format!("failed to inspect index_info for {index_name}");
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({})", quote_ident(index_name)))
        .map_err(|err| storage_error(&context, &err))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(2))
        .map_err(|err| storage_error(&context, &err))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|err| storage_error(&context, &err))?);
    }
    Ok(columns)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}
