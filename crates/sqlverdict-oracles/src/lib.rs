//! The oracle variants.
//!
//! Every oracle implements the same `identity`/`predict` contract from
//! `sqlverdict-core` and differs only in how it obtains evidence:
//!
//! - [`DriverOracle`] executes the statement over a client connection and
//!   classifies the SQLSTATE of whatever diagnostic comes back.
//! - [`DoBlockOracle`] rewrites the statement into an anonymous `DO` block
//!   before handing it to the driver, forcing the procedural-language
//!   parser to look at constructs that are otherwise only checked at call
//!   time (a bare `RETURN`, for instance).
//! - [`PsqlOracle`] drives an interactive psql subprocess and judges exit
//!   status plus stderr prefixes.
//! - [`PgQueryOracle`] parses in process with libpg_query; no engine at all.
//!
//! None of them leave state behind on the target engine: driver-family
//! calls always roll back, psql runs stop on the first error.

use std::io::Write as _;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use postgres::{Client, NoTls};
use serde_json::json;
use tracing::{debug, info, warn};

use sqlverdict_core::{
    classify, Dialect, EngineDiagnostic, Oracle, OracleError, OracleIdentity, OracleKind,
    Prediction, Statement, Verdict,
};

/// Display name of the embedded-parser oracle. Only the grammar major is
/// retained, not the binding's own version.
pub const PG_QUERY_NAME: &str = "libpg_query 17";

/// Per-call deadline enforced inside the driver-family oracles.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(1);

/// The display name an oracle variant registers under for a given engine
/// version. Prediction rows are keyed by the hash of this name, so the
/// formats are frozen.
#[must_use]
pub fn display_name(kind: OracleKind, version: &str) -> String {
    match kind {
        OracleKind::Raw => format!("postgres {version} raw driver"),
        OracleKind::DoBlock => format!("postgres {version} do-block"),
        OracleKind::Psql => format!("psql {version}"),
        OracleKind::PgQuery => PG_QUERY_NAME.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Direct-execution oracle
// ---------------------------------------------------------------------------

/// Executes statements verbatim against a running PostgreSQL instance and
/// classifies the resulting diagnostic.
///
/// The connection is shared across scheduler workers; each call takes the
/// client lock just long enough to run one short-deadline transaction,
/// which is always rolled back.
pub struct DriverOracle {
    identity: OracleIdentity,
    client: Mutex<Client>,
    call_deadline: Duration,
}

impl DriverOracle {
    /// Connects to an already-running engine instance.
    ///
    /// Readiness of the instance is an external collaborator's problem; a
    /// refused connection here is an engine error, not something to retry.
    ///
    /// # Errors
    /// Returns [`OracleError::Engine`] when the endpoint cannot be reached.
    pub fn connect(version: &str, dsn: &str) -> Result<Self, OracleError> {
        let client = Client::connect(dsn, NoTls).map_err(|err| {
            OracleError::Engine(format!("failed to connect to postgres {version}: {err}"))
        })?;
        let identity = OracleIdentity::new(display_name(OracleKind::Raw, version));
        info!(oracle = %identity.name, "connected");
        Ok(Self {
            identity,
            client: Mutex::new(client),
            call_deadline: DEFAULT_CALL_DEADLINE,
        })
    }

    #[must_use]
    pub fn with_call_deadline(mut self, deadline: Duration) -> Self {
        self.call_deadline = deadline;
        self
    }

    /// The session option controlling whether nested procedural bodies are
    /// syntax-checked alongside the outer statement.
    fn session_option(dialect: Dialect) -> Result<&'static str, OracleError> {
        match dialect {
            // Plain SQL: don't drag plpgsql checking into the verdict.
            Dialect::Pgsql => Ok("SET LOCAL check_function_bodies = off"),
            Dialect::Plpgsql => Ok("SET LOCAL check_function_bodies = on"),
            other => Err(OracleError::Configuration(format!(
                "unsupported dialect {other}"
            ))),
        }
    }

    /// Runs one statement in a throwaway transaction and returns the
    /// diagnostic, if any.
    ///
    /// A database-reported failure is evidence for the classifier. Anything
    /// else (lost connection, protocol failure) is an engine error that
    /// aborts the run.
    fn run_in_transaction(
        &self,
        text: &str,
        session_option: &str,
    ) -> Result<Option<EngineDiagnostic>, OracleError> {
        let mut client = self
            .client
            .lock()
            .map_err(|_| OracleError::Engine("connection mutex poisoned".to_string()))?;

        let mut transaction = client
            .transaction()
            .map_err(|err| OracleError::Engine(format!("failed to begin transaction: {err}")))?;

        let deadline_ms = self.call_deadline.as_millis();
        transaction
            .batch_execute(&format!("SET LOCAL statement_timeout = {deadline_ms}"))
            .map_err(|err| OracleError::Engine(format!("failed to set call deadline: {err}")))?;
        transaction
            .batch_execute(session_option)
            .map_err(|err| OracleError::Engine(format!("failed to set session option: {err}")))?;

        let diagnostic = match transaction.batch_execute(text) {
            Ok(()) => None,
            Err(err) => match err.as_db_error() {
                Some(db_error) => Some(EngineDiagnostic::new(
                    db_error.code().code(),
                    db_error.message(),
                )),
                None => {
                    return Err(OracleError::Engine(format!(
                        "statement execution failed without a diagnostic: {err}"
                    )))
                }
            },
        };

        // An errored transaction is already aborted server-side; a rollback
        // failure at that point carries no information.
        if let Err(err) = transaction.rollback() {
            warn!(oracle = %self.identity.name, error = %err, "rollback failed, tolerated");
        }

        Ok(diagnostic)
    }

    fn predict_text(&self, statement: &Statement, text: &str) -> Result<Prediction, OracleError> {
        let session_option = Self::session_option(statement.dialect)?;
        let diagnostic = self.run_in_transaction(text, session_option)?;
        let classification = classify(diagnostic.as_ref());
        debug!(
            oracle = %self.identity.name,
            statement_id = statement.id,
            verdict = %classification.verdict,
            "classified"
        );
        Ok(Prediction {
            statement_id: statement.id,
            oracle_id: self.identity.id,
            dialect: statement.dialect,
            verdict: classification.verdict,
            message: String::new(),
            error: classification.diagnostic,
        })
    }
}

impl Oracle for DriverOracle {
    fn identity(&self) -> &OracleIdentity {
        &self.identity
    }

    fn predict(&self, statement: &Statement) -> Result<Prediction, OracleError> {
        self.predict_text(statement, &statement.text)
    }
}

// ---------------------------------------------------------------------------
// Block-wrapped oracle
// ---------------------------------------------------------------------------

const BLOCK_TAG: &str = "SYNTAX_CHECK";

/// Dollar-quote tag guaranteed not to occur in the statement text.
fn block_tag_for(text: &str) -> String {
    let mut tag = BLOCK_TAG.to_string();
    while text.contains(&tag) {
        tag.push('_');
    }
    tag
}

/// Wraps a statement body in a synthetic anonymous-procedure construct so
/// the procedural-language parser has to validate it.
#[must_use]
pub fn wrap_in_do_block(text: &str) -> String {
    let tag = block_tag_for(text);
    format!("DO ${tag}$BEGIN RETURN; {text} END;${tag}$;")
}

/// Composes with [`DriverOracle`]: same execution and classification, run
/// on the block-wrapped rewrite of the statement.
pub struct DoBlockOracle {
    identity: OracleIdentity,
    driver: DriverOracle,
}

impl DoBlockOracle {
    /// Connects the underlying driver to an already-running instance.
    ///
    /// # Errors
    /// Returns [`OracleError::Engine`] when the endpoint cannot be reached.
    pub fn connect(version: &str, dsn: &str) -> Result<Self, OracleError> {
        let driver = DriverOracle::connect(version, dsn)?;
        Ok(Self {
            identity: OracleIdentity::new(display_name(OracleKind::DoBlock, version)),
            driver,
        })
    }
}

impl Oracle for DoBlockOracle {
    fn identity(&self) -> &OracleIdentity {
        &self.identity
    }

    fn predict(&self, statement: &Statement) -> Result<Prediction, OracleError> {
        match statement.dialect {
            Dialect::Pgsql | Dialect::Plpgsql => {}
            other => {
                return Err(OracleError::Configuration(format!(
                    "unsupported dialect {other}"
                )))
            }
        }

        let wrapped = wrap_in_do_block(&statement.text);
        // The wrapper itself is a procedural body: always check it.
        let diagnostic = self
            .driver
            .run_in_transaction(&wrapped, "SET LOCAL check_function_bodies = on")?;
        let classification = classify(diagnostic.as_ref());
        debug!(
            oracle = %self.identity.name,
            statement_id = statement.id,
            verdict = %classification.verdict,
            "classified"
        );
        Ok(Prediction {
            statement_id: statement.id,
            oracle_id: self.identity.id,
            dialect: statement.dialect,
            verdict: classification.verdict,
            message: String::new(),
            error: classification.diagnostic,
        })
    }
}

// ---------------------------------------------------------------------------
// Interactive-shell oracle
// ---------------------------------------------------------------------------

/// How to launch the interactive client, e.g. `psql` directly or a
/// `docker-compose exec -T psql` line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PsqlCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PsqlCommand {
    /// Splits a launch line on whitespace.
    ///
    /// # Errors
    /// Returns [`OracleError::Configuration`] for an empty line.
    pub fn parse(raw: &str) -> Result<Self, OracleError> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            return Err(OracleError::Configuration(
                "psql command must name a program".to_string(),
            ));
        };
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

const STOP_ON_ERROR_FLAG: &str = "--set=ON_ERROR_STOP=on";

const INVALID_COMMAND_PREFIX: &str = "invalid command";
const UNRECOGNIZED_VALUE_PREFIX: &str = "unrecognized value";
const ERROR_BANNER_PREFIX: &str = "ERROR:";

fn is_invalid_command(line: &str) -> bool {
    line.starts_with(INVALID_COMMAND_PREFIX)
}

fn has_unrecognized_value(line: &str) -> bool {
    line.starts_with(UNRECOGNIZED_VALUE_PREFIX)
}

fn has_sqlish_syntax_error(line: &str) -> bool {
    let Some(rest) = line.strip_prefix(ERROR_BANNER_PREFIX) else {
        return false;
    };
    rest.trim_start_matches([' ', '\t']).starts_with("syntax error")
}

/// Verdict for a nonzero psql exit, judged by stderr prefixes.
///
/// Absence of a matched pattern is not proof of validity: most corpus
/// statements fail on missing database objects, which says nothing about
/// their syntax.
#[must_use]
pub fn classify_psql_failure(stderr: &str) -> Verdict {
    let definitely_invalid = stderr.lines().any(|line| {
        is_invalid_command(line) || has_unrecognized_value(line) || has_sqlish_syntax_error(line)
    });
    if definitely_invalid {
        Verdict::Invalid
    } else {
        Verdict::Indeterminate
    }
}

/// Feeds statements to an interactive psql process, one spawn per call.
///
/// The statement travels on stdin rather than `--command`: forms like
/// `COPY .. FROM STDIN` are not expressible as a command-line argument.
pub struct PsqlOracle {
    identity: OracleIdentity,
    command: PsqlCommand,
}

impl PsqlOracle {
    #[must_use]
    pub fn new(version: &str, command: PsqlCommand) -> Self {
        Self {
            identity: OracleIdentity::new(display_name(OracleKind::Psql, version)),
            command,
        }
    }
}

impl Oracle for PsqlOracle {
    fn identity(&self) -> &OracleIdentity {
        &self.identity
    }

    fn predict(&self, statement: &Statement) -> Result<Prediction, OracleError> {
        if statement.dialect != Dialect::Psql {
            return Err(OracleError::Configuration(format!(
                "unsupported dialect {}",
                statement.dialect
            )));
        }

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg(STOP_ON_ERROR_FLAG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                OracleError::Engine(format!(
                    "failed to launch {}: {err}",
                    self.command.program
                ))
            })?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(statement.text.as_bytes())
                .map_err(|err| OracleError::Engine(format!("failed to write statement: {err}")))?;
        }
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .map_err(|err| OracleError::Engine(format!("psql process failed: {err}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let verdict = if output.status.success() {
            Verdict::Valid
        } else {
            classify_psql_failure(&stderr)
        };
        debug!(
            oracle = %self.identity.name,
            statement_id = statement.id,
            exit = ?output.status.code(),
            verdict = %verdict,
            "classified"
        );

        Ok(Prediction {
            statement_id: statement.id,
            oracle_id: self.identity.id,
            dialect: statement.dialect,
            verdict,
            message: stdout,
            error: stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// Embedded-parser oracle
// ---------------------------------------------------------------------------

/// Parses statements in process with libpg_query. No network, no
/// subprocess; the message retains the token list and tree for audit.
pub struct PgQueryOracle {
    identity: OracleIdentity,
}

impl PgQueryOracle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identity: OracleIdentity::new(PG_QUERY_NAME),
        }
    }

    fn predict_sql(&self, statement: &Statement) -> Prediction {
        let mut prediction = Prediction {
            statement_id: statement.id,
            oracle_id: self.identity.id,
            dialect: statement.dialect,
            verdict: Verdict::Invalid,
            message: String::new(),
            error: String::new(),
        };

        let tokens = match scan_tokens(&statement.text) {
            Ok(tokens) => tokens,
            Err(err) => {
                prediction.message = json!({ "error": err.to_string() }).to_string();
                return prediction;
            }
        };

        match pg_query::parse(&statement.text) {
            Ok(parsed) => {
                prediction.verdict = Verdict::Valid;
                prediction.message = json!({
                    "tokens": tokens,
                    "ast": format!("{:?}", parsed.protobuf),
                })
                .to_string();
            }
            Err(err) => {
                prediction.message = json!({
                    "tokens": tokens,
                    "error": err.to_string(),
                })
                .to_string();
            }
        }
        prediction
    }

    fn predict_plpgsql(&self, statement: &Statement) -> Prediction {
        let mut prediction = Prediction {
            statement_id: statement.id,
            oracle_id: self.identity.id,
            dialect: statement.dialect,
            verdict: Verdict::Invalid,
            message: String::new(),
            error: String::new(),
        };

        // Procedural bodies go through the specialized entry point, not the
        // general SQL parser.
        match pg_query::parse_plpgsql(&statement.text) {
            Ok(tree) => {
                prediction.verdict = Verdict::Valid;
                prediction.message = format!("{{\"ast\":{tree}}}");
            }
            Err(err) => {
                prediction.error = err.to_string();
            }
        }
        prediction
    }
}

impl Default for PgQueryOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_tokens(text: &str) -> Result<Vec<serde_json::Value>, pg_query::Error> {
    let scanned = pg_query::scan(text)?;
    let tokens = scanned
        .tokens
        .iter()
        .map(|token| {
            let start = usize::try_from(token.start).unwrap_or(0);
            let end = usize::try_from(token.end).unwrap_or(0);
            json!({
                "name": format!("{:?}", token.token()),
                "start": token.start,
                "end": token.end,
                "text": text.get(start..end).unwrap_or(""),
            })
        })
        .collect();
    Ok(tokens)
}

impl Oracle for PgQueryOracle {
    fn identity(&self) -> &OracleIdentity {
        &self.identity
    }

    fn predict(&self, statement: &Statement) -> Result<Prediction, OracleError> {
        let prediction = match statement.dialect {
            Dialect::Pgsql => self.predict_sql(statement),
            Dialect::Plpgsql => self.predict_plpgsql(statement),
            other => {
                return Err(OracleError::Configuration(format!(
                    "unsupported dialect {other}"
                )))
            }
        };
        debug!(
            oracle = %self.identity.name,
            statement_id = statement.id,
            verdict = %prediction.verdict,
            "classified"
        );
        Ok(prediction)
    }
}
