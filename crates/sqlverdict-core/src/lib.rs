use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use xxhash_rust::xxh64::xxh64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OracleError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// A named SQL variant or sublanguage a statement is tested against.
///
/// The numeric ids are frozen: they identify dialects in exported corpora
/// and must never be renumbered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Other,
    Pgsql,
    Plpgsql,
    Psql,
    Plperl,
    Pltcl,
    Plpython2,
    Plpython3,
    Sqlite,
}

impl Dialect {
    pub const ALL: &'static [Self] = &[
        Self::Other,
        Self::Pgsql,
        Self::Plpgsql,
        Self::Psql,
        Self::Plperl,
        Self::Pltcl,
        Self::Plpython2,
        Self::Plpython3,
        Self::Sqlite,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Other => "other",
            Self::Pgsql => "pgsql",
            Self::Plpgsql => "plpgsql",
            Self::Psql => "psql",
            Self::Plperl => "plperl",
            Self::Pltcl => "pltcl",
            Self::Plpython2 => "plpython2",
            Self::Plpython3 => "plpython3",
            Self::Sqlite => "sqlite",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "other" => Some(Self::Other),
            "pgsql" => Some(Self::Pgsql),
            "plpgsql" => Some(Self::Plpgsql),
            "psql" => Some(Self::Psql),
            "plperl" => Some(Self::Plperl),
            "pltcl" => Some(Self::Pltcl),
            "plpython2" => Some(Self::Plpython2),
            "plpython3" => Some(Self::Plpython3),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Frozen numeric id, carried over from the corpus export format.
    #[must_use]
    pub fn id(self) -> i64 {
        match self {
            Self::Other => -1,
            Self::Pgsql => 0,
            Self::Plpgsql => 1,
            Self::Psql => 2,
            Self::Plperl => 3,
            Self::Pltcl => 4,
            Self::Plpython2 => 5,
            Self::Plpython3 => 6,
            Self::Sqlite => 7,
        }
    }
}

impl Display for Dialect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A corpus statement. Created once during ingestion, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Statement {
    pub id: i64,
    pub text: String,
    pub dialect: Dialect,
}

/// Tri-state outcome of an oracle's judgment on one statement.
///
/// `Indeterminate` means "no evidence either way". It is a successful
/// classification, not a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    Invalid,
    Indeterminate,
}

impl Verdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Indeterminate => "indeterminate",
        }
    }

    /// Mapping onto the nullable `valid` column: `Indeterminate` is `NULL`.
    #[must_use]
    pub fn as_sql(self) -> Option<bool> {
        match self {
            Self::Valid => Some(true),
            Self::Invalid => Some(false),
            Self::Indeterminate => None,
        }
    }

    #[must_use]
    pub fn from_sql(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::Valid,
            Some(false) => Self::Invalid,
            None => Self::Indeterminate,
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted (statement, oracle, dialect) → verdict record.
///
/// `message` retains whatever the oracle chose to keep for audit (client
/// output, token/tree dumps); `error` retains the raw diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Prediction {
    pub statement_id: i64,
    pub oracle_id: i64,
    pub dialect: Dialect,
    pub verdict: Verdict,
    pub message: String,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Oracle identity
// ---------------------------------------------------------------------------

/// Derives the stable 64-bit oracle id from its display name.
///
/// XXH64 of the UTF-8 name, reinterpreted as `i64` for SQLite storage. The
/// derivation is frozen: existing corpora key prediction rows by it.
#[must_use]
pub fn derive_oracle_id(name: &str) -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    let id = xxh64(name.as_bytes(), 0) as i64;
    id
}

/// Stable identity of an oracle: hash-derived id plus display name.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OracleIdentity {
    pub id: i64,
    pub name: String,
}

impl OracleIdentity {
    /// Computes the id eagerly; identities are immutable after construction.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = derive_oracle_id(&name);
        Self { id, name }
    }
}

impl Display for OracleIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

// ---------------------------------------------------------------------------
// Verdict classifier
// ---------------------------------------------------------------------------

/// A structured diagnostic reported by an engine for a failed statement.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EngineDiagnostic {
    /// SQLSTATE-style code classifying the failure.
    pub code: String,
    /// Raw diagnostic text, preserved verbatim for audit.
    pub message: String,
}

impl EngineDiagnostic {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Result of classifying an execution attempt: the verdict plus the
/// diagnostic text retained for the prediction's `error` field.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Classification {
    pub verdict: Verdict,
    pub diagnostic: String,
}

/// Codes meaning the engine could not judge syntactic correctness from this
/// attempt alone.
const AMBIGUOUS_SQLSTATES: &[&str] = &[
    "03000", // sql_statement_not_yet_complete
    "3D000", // invalid_catalog_name
    "3F000", // invalid_schema_name
    "26000", // invalid_sql_statement_name
    "22019", // invalid_escape_character
    "2200D", // invalid_escape_octet
    "22025", // invalid_escape_sequence
    "22P06", // nonstandard_use_of_escape_character
    "22010", // invalid_indicator_parameter_value
    "22023", // invalid_parameter_value
    "2201B", // invalid_regular_expression
    "22024", // unterminated_c_string
];

/// Codes the engine only reports when it failed to parse the statement.
const SYNTAX_SQLSTATES: &[&str] = &[
    "42601", // syntax_error
    "42P10", // invalid_column_reference
    "42611", // invalid_column_definition
    "42P11", // invalid_cursor_definition
    "42P12", // invalid_database_definition
    "42P13", // invalid_function_definition
    "42P14", // invalid_prepared_statement_definition
    "42P15", // invalid_schema_definition
    "42P16", // invalid_table_definition
    "42P17", // invalid_object_definition
];

/// Classifies an execution attempt into a verdict.
///
/// Policy (fixed, not configurable):
/// - no diagnostic → `Valid`
/// - code in the ambiguous set → `Indeterminate`
/// - code in the syntax set → `Invalid`
/// - any other code → `Valid`: the engine only reports the two families
///   above when parsing failed, so every other diagnostic implies the
///   statement parsed and the problem is semantic (e.g. a missing table),
///   which a syntax oracle does not judge. Downstream analyses depend on
///   this exact boundary.
#[must_use]
pub fn classify(diagnostic: Option<&EngineDiagnostic>) -> Classification {
    let Some(diagnostic) = diagnostic else {
        return Classification {
            verdict: Verdict::Valid,
            diagnostic: String::new(),
        };
    };

    let verdict = if AMBIGUOUS_SQLSTATES.contains(&diagnostic.code.as_str()) {
        Verdict::Indeterminate
    } else if SYNTAX_SQLSTATES.contains(&diagnostic.code.as_str()) {
        Verdict::Invalid
    } else {
        Verdict::Valid
    };

    Classification {
        verdict,
        diagnostic: diagnostic.message.clone(),
    }
}

// ---------------------------------------------------------------------------
// Oracle contract
// ---------------------------------------------------------------------------

/// Something that judges whether a statement is syntactically valid for its
/// dialect.
///
/// `predict` must return a prediction for every supported statement: an
/// `Indeterminate` verdict is a prediction, not an error. Errors are
/// reserved for unsupported dialects (`Configuration`) and infrastructure
/// failures such as connection loss (`Engine`), which abort a bulk run.
pub trait Oracle {
    fn identity(&self) -> &OracleIdentity;

    /// Renders a verdict on one statement.
    ///
    /// # Errors
    /// Returns [`OracleError::Configuration`] when the statement's dialect
    /// is not supported and [`OracleError::Engine`] when the backing engine
    /// or process cannot be driven.
    fn predict(&self, statement: &Statement) -> Result<Prediction, OracleError>;
}

// ---------------------------------------------------------------------------
// Oracle/version registry
// ---------------------------------------------------------------------------

/// The closed set of oracle variants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    /// Direct execution over a client connection.
    Raw,
    /// Direct execution of the statement wrapped in an anonymous DO block.
    DoBlock,
    /// Interactive psql subprocess.
    Psql,
    /// In-process libpg_query parser.
    PgQuery,
}

impl OracleKind {
    pub const ALL: &'static [Self] = &[Self::Raw, Self::DoBlock, Self::Psql, Self::PgQuery];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::DoBlock => "do-block",
            Self::Psql => "psql",
            Self::PgQuery => "pg_query",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "raw" => Some(Self::Raw),
            "do-block" => Some(Self::DoBlock),
            "psql" => Some(Self::Psql),
            "pg_query" => Some(Self::PgQuery),
            _ => None,
        }
    }

    /// Engine versions this variant can be paired with. For the embedded
    /// parser the single entry is the grammar version of the linked
    /// libpg_query, not a server version.
    #[must_use]
    pub fn supported_versions(self) -> &'static [&'static str] {
        match self {
            Self::Raw | Self::DoBlock | Self::Psql => &["10", "11", "12", "13", "14"],
            Self::PgQuery => &["17"],
        }
    }

    #[must_use]
    pub fn supports_version(self, version: &str) -> bool {
        self.supported_versions().contains(&version)
    }

    /// Dialects this variant can judge.
    #[must_use]
    pub fn supported_dialects(self) -> &'static [Dialect] {
        match self {
            Self::Raw | Self::DoBlock | Self::PgQuery => &[Dialect::Pgsql, Dialect::Plpgsql],
            Self::Psql => &[Dialect::Psql],
        }
    }

    #[must_use]
    pub fn supports_dialect(self, dialect: Dialect) -> bool {
        self.supported_dialects().contains(&dialect)
    }
}

impl Display for OracleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a requested (oracle, version, dialect) selection before any
/// engine work starts.
///
/// # Errors
/// Returns [`OracleError::Configuration`] naming the first unsupported
/// pairing; nothing has been executed or written at that point.
pub fn validate_selection(
    kind: OracleKind,
    version: &str,
    dialect: Dialect,
) -> Result<(), OracleError> {
    if !kind.supports_version(version) {
        return Err(OracleError::Configuration(format!(
            "oracle `{kind}` does not support version {version} (supported: {})",
            kind.supported_versions().join(", ")
        )));
    }

    if !kind.supports_dialect(dialect) {
        return Err(OracleError::Configuration(format!(
            "oracle `{kind}` does not support dialect {dialect} (supported: {})",
            kind.supported_dialects()
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`OracleError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, OracleError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| OracleError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(OracleError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`OracleError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, OracleError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| OracleError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn diag(code: &str, message: &str) -> EngineDiagnostic {
        EngineDiagnostic::new(code, message)
    }

    #[test]
    fn no_diagnostic_is_valid() {
        let classification = classify(None);
        assert_eq!(classification.verdict, Verdict::Valid);
        assert!(classification.diagnostic.is_empty());
    }

    #[test]
    fn every_syntax_code_is_invalid() {
        for code in super::SYNTAX_SQLSTATES {
            let classification = classify(Some(&diag(code, "near \"FROM\": syntax error")));
            assert_eq!(
                classification.verdict,
                Verdict::Invalid,
                "code {code} should classify as invalid"
            );
        }
    }

    #[test]
    fn every_ambiguous_code_is_indeterminate_and_retains_text() {
        for code in super::AMBIGUOUS_SQLSTATES {
            let text = format!("diagnostic for {code}");
            let classification = classify(Some(&diag(code, &text)));
            assert_eq!(
                classification.verdict,
                Verdict::Indeterminate,
                "code {code} should classify as indeterminate"
            );
            assert_eq!(classification.diagnostic, text);
        }
    }

    #[test]
    fn semantic_diagnostic_is_valid() {
        // 42P01 = undefined_table: the statement parsed, the object is
        // merely absent. The boundary is intentional and frozen.
        let classification = classify(Some(&diag(
            "42P01",
            "relation \"missing_table\" does not exist",
        )));
        assert_eq!(classification.verdict, Verdict::Valid);
        assert_eq!(
            classification.diagnostic,
            "relation \"missing_table\" does not exist"
        );
    }

    #[test]
    fn escape_sequence_diagnostic_is_indeterminate_verbatim() {
        let text = "invalid escape sequence near \"\\x\"";
        let classification = classify(Some(&diag("22025", text)));
        assert_eq!(classification.verdict, Verdict::Indeterminate);
        assert_eq!(classification.diagnostic, text);
    }

    proptest! {
        #[test]
        fn unknown_codes_always_classify_valid(code in "[0-9A-Z]{5}", message in ".{0,40}") {
            prop_assume!(!super::SYNTAX_SQLSTATES.contains(&code.as_str()));
            prop_assume!(!super::AMBIGUOUS_SQLSTATES.contains(&code.as_str()));
            let classification = classify(Some(&diag(&code, &message)));
            prop_assert_eq!(classification.verdict, Verdict::Valid);
            prop_assert_eq!(classification.diagnostic, message);
        }
    }

    #[test]
    fn oracle_id_is_deterministic_and_name_sensitive() {
        let first = OracleIdentity::new("postgres 14 raw driver");
        let second = OracleIdentity::new("postgres 14 raw driver");
        let other = OracleIdentity::new("postgres 13 raw driver");

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, derive_oracle_id("postgres 14 raw driver"));
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn distinct_registry_names_do_not_collide() {
        let names = [
            "postgres 10 raw driver",
            "postgres 11 raw driver",
            "postgres 12 raw driver",
            "postgres 13 raw driver",
            "postgres 14 raw driver",
            "postgres 10 do-block",
            "postgres 11 do-block",
            "postgres 12 do-block",
            "postgres 13 do-block",
            "postgres 14 do-block",
            "psql 10",
            "psql 11",
            "psql 12",
            "psql 13",
            "psql 14",
            "libpg_query 17",
        ];
        let mut ids: Vec<i64> = names.iter().map(|name| derive_oracle_id(name)).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), names.len());
    }

    #[test]
    fn dialect_string_roundtrip() {
        for dialect in Dialect::ALL {
            assert_eq!(Dialect::parse(dialect.as_str()), Some(*dialect));
        }
        assert_eq!(Dialect::parse("klingon"), None);
    }

    #[test]
    fn dialect_ids_are_frozen() {
        assert_eq!(Dialect::Other.id(), -1);
        assert_eq!(Dialect::Pgsql.id(), 0);
        assert_eq!(Dialect::Plpgsql.id(), 1);
        assert_eq!(Dialect::Psql.id(), 2);
        assert_eq!(Dialect::Sqlite.id(), 7);
    }

    #[test]
    fn verdict_sql_roundtrip() {
        for verdict in [Verdict::Valid, Verdict::Invalid, Verdict::Indeterminate] {
            assert_eq!(Verdict::from_sql(verdict.as_sql()), verdict);
        }
    }

    #[test]
    fn oracle_kind_string_roundtrip() {
        for kind in OracleKind::ALL {
            assert_eq!(OracleKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(OracleKind::parse("tea-leaves"), None);
    }

    #[test]
    fn selection_validation_rejects_unknown_version() {
        let err = match validate_selection(OracleKind::PgQuery, "13", Dialect::Pgsql) {
            Ok(()) => panic!("expected version rejection"),
            Err(err) => err,
        };
        assert!(matches!(err, OracleError::Configuration(_)));
        assert!(err.to_string().contains("version 13"));
    }

    #[test]
    fn selection_validation_rejects_mismatched_dialect() {
        let err = match validate_selection(OracleKind::Raw, "14", Dialect::Psql) {
            Ok(()) => panic!("expected dialect rejection"),
            Err(err) => err,
        };
        assert!(matches!(err, OracleError::Configuration(_)));

        let err = match validate_selection(OracleKind::Psql, "14", Dialect::Pgsql) {
            Ok(()) => panic!("expected dialect rejection"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("dialect pgsql"));
    }

    #[test]
    fn selection_validation_accepts_known_pairings() {
        assert_eq!(
            validate_selection(OracleKind::Raw, "14", Dialect::Plpgsql),
            Ok(())
        );
        assert_eq!(
            validate_selection(OracleKind::Psql, "10", Dialect::Psql),
            Ok(())
        );
        assert_eq!(
            validate_selection(OracleKind::PgQuery, "17", Dialect::Pgsql),
            Ok(())
        );
    }

    #[test]
    fn rfc3339_requires_utc() {
        let parsed = match parse_rfc3339_utc("2026-08-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("expected UTC timestamp to parse: {err}"),
        };
        let formatted = match format_rfc3339(parsed) {
            Ok(value) => value,
            Err(err) => panic!("expected timestamp to format: {err}"),
        };
        assert_eq!(formatted, "2026-08-07T12:00:00Z");

        assert!(parse_rfc3339_utc("2026-08-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not-a-timestamp").is_err());
    }
}
