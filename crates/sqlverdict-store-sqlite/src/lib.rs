#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sqlverdict_core::{
    format_rfc3339, now_utc, Dialect, OracleIdentity, Prediction, Statement, Verdict,
};

const CORPUS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CORPUS_V1: &str = r"
CREATE TABLE IF NOT EXISTS oracles (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS statements (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  text TEXT NOT NULL,
  dialect TEXT NOT NULL CHECK (
    dialect IN (
      'other',
      'pgsql',
      'plpgsql',
      'psql',
      'plperl',
      'pltcl',
      'plpython2',
      'plpython3',
      'sqlite'
    )
  ),
  UNIQUE (text, dialect)
);

CREATE INDEX IF NOT EXISTS idx_statements_dialect
  ON statements(dialect);

CREATE TABLE IF NOT EXISTS predictions (
  statement_id INTEGER NOT NULL REFERENCES statements(id),
  oracle_id INTEGER NOT NULL REFERENCES oracles(id),
  dialect TEXT NOT NULL,
  message TEXT NOT NULL DEFAULT '',
  error TEXT NOT NULL DEFAULT '',
  valid INTEGER CHECK (valid IN (0, 1) OR valid IS NULL),
  created_at TEXT NOT NULL,
  PRIMARY KEY (statement_id, oracle_id, dialect)
);

CREATE INDEX IF NOT EXISTS idx_predictions_oracle_dialect
  ON predictions(oracle_id, dialect);
";

/// Corpus store: the exclusive owner of statement and prediction rows.
///
/// Exactly one task may write predictions at a time; the scheduler upholds
/// this by routing every insert through its single persistence loop.
pub struct SqliteCorpusStore {
    conn: Connection,
}

impl SqliteCorpusStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Read-only access for audits and tests.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CORPUS_V1)
            .context("failed to apply corpus schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CORPUS_MIGRATION_VERSION, now],
            )
            .context("failed to register corpus schema migration")?;

        Ok(())
    }

    /// Records an oracle identity; re-registration of the same id is a no-op.
    pub fn register_oracle(&self, identity: &OracleIdentity) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO oracles(id, name) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                params![identity.id, identity.name],
            )
            .with_context(|| format!("failed to register oracle {}", identity.name))?;
        Ok(())
    }

    /// Ingestion hook: adds a statement, deduplicating on (text, dialect).
    ///
    /// Returns the statement's row id whether it was inserted or already
    /// present.
    pub fn add_statement(&self, text: &str, dialect: Dialect) -> Result<i64> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO statements(text, dialect) VALUES (?1, ?2)",
                params![text, dialect.as_str()],
            )
            .context("failed to insert statement")?;

        if inserted > 0 {
            return Ok(self.conn.last_insert_rowid());
        }

        self.conn
            .query_row(
                "SELECT id FROM statements WHERE text = ?1 AND dialect = ?2",
                params![text, dialect.as_str()],
                |row| row.get(0),
            )
            .context("failed to look up deduplicated statement")
    }

    /// The full corpus slice for one dialect, in id order.
    pub fn statements_by_dialect(&self, dialect: Dialect) -> Result<Vec<Statement>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, text, dialect FROM statements WHERE dialect = ?1 ORDER BY id ASC")?;
        let mut rows = stmt.query(params![dialect.as_str()])?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(statement_from_row(row)?);
        }
        Ok(results)
    }

    /// Statements of the dialect with no prediction from the given oracle.
    ///
    /// This selection is what makes scheduler runs idempotent: a second run
    /// over an unchanged corpus sees an empty pending set.
    pub fn pending_statements(&self, dialect: Dialect, oracle_id: i64) -> Result<Vec<Statement>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.text, s.dialect
               FROM statements s
              WHERE s.dialect = ?1
                AND NOT EXISTS (
                      SELECT 1 FROM predictions p
                       WHERE p.statement_id = s.id
                         AND p.oracle_id = ?2
                         AND p.dialect = ?1
                    )
              ORDER BY s.id ASC",
        )?;
        let mut rows = stmt.query(params![dialect.as_str(), oracle_id])?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(statement_from_row(row)?);
        }
        Ok(results)
    }

    /// Persists one prediction.
    ///
    /// Plain `INSERT`: the composite primary key makes a duplicate triple a
    /// loud constraint error instead of a silent overwrite. At-most-once is
    /// already guaranteed upstream by pending selection.
    pub fn insert_prediction(&self, prediction: &Prediction) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO predictions(
                    statement_id, oracle_id, dialect, message, error, valid, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    prediction.statement_id,
                    prediction.oracle_id,
                    prediction.dialect.as_str(),
                    prediction.message,
                    prediction.error,
                    prediction.verdict.as_sql(),
                    now,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert prediction for statement {} / oracle {}",
                    prediction.statement_id, prediction.oracle_id
                )
            })?;
        Ok(())
    }

    /// Reads back one prediction, if present.
    pub fn prediction_for(
        &self,
        statement_id: i64,
        oracle_id: i64,
        dialect: Dialect,
    ) -> Result<Option<Prediction>> {
        self.conn
            .query_row(
                "SELECT statement_id, oracle_id, dialect, message, error, valid
                   FROM predictions
                  WHERE statement_id = ?1 AND oracle_id = ?2 AND dialect = ?3",
                params![statement_id, oracle_id, dialect.as_str()],
                prediction_from_row,
            )
            .optional()
            .context("failed to read prediction")
    }

    pub fn count_predictions(&self, oracle_id: i64, dialect: Dialect) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM predictions WHERE oracle_id = ?1 AND dialect = ?2",
                params![oracle_id, dialect.as_str()],
                |row| row.get(0),
            )
            .context("failed to count predictions")?;
        usize::try_from(count).context("prediction count out of range")
    }
}

fn parse_dialect_column(raw: &str) -> rusqlite::Result<Dialect> {
    Dialect::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown dialect {raw}").into(),
        )
    })
}

fn statement_from_row(row: &rusqlite::Row<'_>) -> Result<Statement> {
    let raw_dialect: String = row.get(2)?;
    Ok(Statement {
        id: row.get(0)?,
        text: row.get(1)?,
        dialect: parse_dialect_column(&raw_dialect)?,
    })
}

fn prediction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Prediction> {
    let raw_dialect: String = row.get(2)?;
    let valid: Option<bool> = row.get(5)?;
    Ok(Prediction {
        statement_id: row.get(0)?,
        oracle_id: row.get(1)?,
        dialect: parse_dialect_column(&raw_dialect)?,
        message: row.get(3)?,
        error: row.get(4)?,
        verdict: Verdict::from_sql(valid),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_store() -> SqliteCorpusStore {
        let store = must(SqliteCorpusStore::open_in_memory());
        must(store.migrate());
        store
    }

    fn fixture_oracle() -> OracleIdentity {
        OracleIdentity::new("postgres 14 raw driver")
    }

    fn fixture_prediction(statement_id: i64, oracle_id: i64, verdict: Verdict) -> Prediction {
        Prediction {
            statement_id,
            oracle_id,
            dialect: Dialect::Pgsql,
            verdict,
            message: String::new(),
            error: "near \"FROM\": syntax error".to_string(),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        must(store.migrate());

        let versions: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ));
        assert_eq!(versions, 1);
    }

    #[test]
    fn schema_contract_contains_expected_tables() {
        let store = fixture_store();
        for table in ["oracles", "statements", "predictions", "schema_migrations"] {
            let found: i64 = must(store.connection().query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            ));
            assert_eq!(found, 1, "missing table {table}");
        }
    }

    #[test]
    fn oracle_registration_is_idempotent() {
        let store = fixture_store();
        let identity = fixture_oracle();
        must(store.register_oracle(&identity));
        must(store.register_oracle(&identity));

        let count: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM oracles WHERE id = ?1",
            params![identity.id],
            |row| row.get(0),
        ));
        assert_eq!(count, 1);
    }

    #[test]
    fn add_statement_deduplicates_on_text_and_dialect() {
        let store = fixture_store();
        let first = must(store.add_statement("SELECT 1;", Dialect::Pgsql));
        let again = must(store.add_statement("SELECT 1;", Dialect::Pgsql));
        let other_dialect = must(store.add_statement("SELECT 1;", Dialect::Sqlite));

        assert_eq!(first, again);
        assert_ne!(first, other_dialect);
        assert_eq!(must(store.statements_by_dialect(Dialect::Pgsql)).len(), 1);
    }

    #[test]
    fn pending_selection_shrinks_as_predictions_land() {
        let store = fixture_store();
        let identity = fixture_oracle();
        must(store.register_oracle(&identity));

        let first = must(store.add_statement("SELECT 1;", Dialect::Pgsql));
        let second = must(store.add_statement("SELECT 2;", Dialect::Pgsql));
        let _other = must(store.add_statement("\\dt", Dialect::Psql));

        let pending = must(store.pending_statements(Dialect::Pgsql, identity.id));
        assert_eq!(pending.len(), 2);

        must(store.insert_prediction(&fixture_prediction(first, identity.id, Verdict::Valid)));

        let pending = must(store.pending_statements(Dialect::Pgsql, identity.id));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);

        // A different oracle still sees the full pending set.
        let other_oracle = OracleIdentity::new("postgres 13 do-block");
        must(store.register_oracle(&other_oracle));
        let pending = must(store.pending_statements(Dialect::Pgsql, other_oracle.id));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn duplicate_prediction_is_a_constraint_error() {
        let store = fixture_store();
        let identity = fixture_oracle();
        must(store.register_oracle(&identity));
        let statement_id = must(store.add_statement("SELECT 1;", Dialect::Pgsql));

        must(store.insert_prediction(&fixture_prediction(
            statement_id,
            identity.id,
            Verdict::Valid,
        )));
        let err = match store.insert_prediction(&fixture_prediction(
            statement_id,
            identity.id,
            Verdict::Invalid,
        )) {
            Ok(()) => panic!("expected duplicate prediction to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("failed to insert prediction"));

        // The original verdict is untouched.
        let stored = match must(store.prediction_for(statement_id, identity.id, Dialect::Pgsql)) {
            Some(value) => value,
            None => panic!("expected stored prediction"),
        };
        assert_eq!(stored.verdict, Verdict::Valid);
    }

    #[test]
    fn tri_state_verdict_roundtrips_through_nullable_column() {
        let store = fixture_store();
        let identity = fixture_oracle();
        must(store.register_oracle(&identity));

        for (text, verdict) in [
            ("SELECT 1;", Verdict::Valid),
            ("SELECT * FROM;", Verdict::Invalid),
            ("SELECT E'\\x';", Verdict::Indeterminate),
        ] {
            let statement_id = must(store.add_statement(text, Dialect::Pgsql));
            must(store.insert_prediction(&fixture_prediction(statement_id, identity.id, verdict)));
            let stored = match must(store.prediction_for(statement_id, identity.id, Dialect::Pgsql))
            {
                Some(value) => value,
                None => panic!("expected stored prediction for {text}"),
            };
            assert_eq!(stored.verdict, verdict, "verdict mismatch for {text}");
        }

        assert_eq!(must(store.count_predictions(identity.id, Dialect::Pgsql)), 3);
    }

    #[test]
    fn missing_prediction_reads_as_none() {
        let store = fixture_store();
        let identity = fixture_oracle();
        assert!(must(store.prediction_for(42, identity.id, Dialect::Pgsql)).is_none());
    }
}
