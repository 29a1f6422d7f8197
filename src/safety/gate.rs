use crate::error::SafetyViolation;
use crate::safety::{Classification, PolicyDecision, PreparedStatement, SafetyPolicy, SqlStatement};
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

const READ_ONLY_PREFIXES: [&str; 3] = ["SELECT", "WITH", "EXPLAIN"];

lazy_static! {
    static ref BANNED_KEYWORD: Regex = Regex::new(r"\b(DROP|TRUNCATE|SHUTDOWN|ATTACH|DETACH)\b").unwrap();
    static ref BLANK_LINE_STATEMENT: Regex = Regex::new(
        r"\n[ \t\r]*\n\s*(INSERT|UPDATE|DELETE|REPLACE|DROP|ALTER|CREATE|PRAGMA|ATTACH|DETACH|VACUUM)\b"
    )
    .unwrap();
    // WITH ... ) DELETE/INSERT/UPDATE: a CTE feeding a data-modifying statement
    static ref CTE_WRITE: Regex = Regex::new(r"\)\s*(INSERT|UPDATE|DELETE|REPLACE)\b").unwrap();
    static ref LIMIT_KEYWORD: Regex = Regex::new(r"\bLIMIT\b").unwrap();
    static ref LINE_COMMENT: Regex = Regex::new(r"--").unwrap();
}

#[derive(Clone, Copy, PartialEq)]
enum MaskState {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Blank out quoted strings, quoted identifiers and comment bodies so keyword
/// scans only see SQL structure. Quote characters and the `--`, `/*`, `*/`
/// markers are kept; length and newlines are preserved.
fn mask_literals(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut state = MaskState::Code;
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            MaskState::Code => match (ch, next) {
                ('-', Some('-')) => {
                    out.push_str("--");
                    state = MaskState::LineComment;
                    i += 1;
                }
                ('/', Some('*')) => {
                    out.push_str("/*");
                    state = MaskState::BlockComment;
                    i += 1;
                }
                ('\'', _) | ('"', _) => {
                    out.push(ch);
                    state = MaskState::Quoted(ch);
                }
                _ => out.push(ch),
            },
            MaskState::Quoted(q) if ch == q => {
                out.push(ch);
                state = MaskState::Code;
            }
            MaskState::LineComment if ch == '\n' => {
                out.push('\n');
                state = MaskState::Code;
            }
            MaskState::BlockComment if ch == '*' && next == Some('/') => {
                out.push_str("*/");
                state = MaskState::Code;
                i += 1;
            }
            _ => out.push(if ch == '\n' { '\n' } else { ' ' }),
        }
        i += 1;
    }
    out
}

/// Whether a LIMIT keyword appears outside any parentheses.
fn has_top_level_limit(masked: &str) -> bool {
    LIMIT_KEYWORD.find_iter(masked).any(|m| {
        let depth = masked[..m.start()].chars().fold(0i32, |depth, c| match c {
            '(' => depth + 1,
            ')' => depth - 1,
            _ => depth,
        });
        depth == 0
    })
}

/// Trim whitespace and at most one trailing statement terminator.
fn strip_terminator(sql: &str) -> &str {
    let trimmed = sql.trim();
    match trimmed.strip_suffix(';') {
        Some(rest) => rest.trim_end(),
        None => trimmed,
    }
}

fn first_keyword(normalized: &str) -> &str {
    normalized
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
}

fn statement_is_limited(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => query.limit.is_some() || query.fetch.is_some(),
        Statement::Explain { statement, .. } => statement_is_limited(statement),
        _ => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct SafetyGate {
    policy: SafetyPolicy,
}

impl SafetyGate {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Classify by leading keyword. Whitespace and case are normalised for this
    /// check only; the statement text itself is never rewritten here.
    pub fn classify(&self, sql: &str) -> Classification {
        let masked = mask_literals(strip_terminator(sql)).to_uppercase();
        let normalized = masked.split_whitespace().collect::<Vec<_>>().join(" ");
        let keyword = first_keyword(&normalized);

        if !READ_ONLY_PREFIXES.contains(&keyword) {
            return Classification::Write;
        }
        if keyword == "WITH" && CTE_WRITE.is_match(&normalized) {
            return Classification::Write;
        }
        Classification::ReadOnly
    }

    /// First banned construct found in the statement, if any.
    pub fn find_banned_token(&self, sql: &str) -> Option<String> {
        let masked = mask_literals(strip_terminator(sql)).to_uppercase();

        if masked.contains(";--") {
            return Some(";--".to_string());
        }
        if masked.contains("/*") {
            return Some("/*".to_string());
        }
        if masked.contains(';') {
            return Some(";".to_string());
        }
        if let Some(m) = BANNED_KEYWORD.captures(&masked).and_then(|c| c.get(1)) {
            return Some(m.as_str().to_string());
        }
        if let Some(m) = BLANK_LINE_STATEMENT.captures(&masked).and_then(|c| c.get(1)) {
            return Some(format!("blank-line {}", m.as_str()));
        }
        match Parser::parse_sql(&SQLiteDialect {}, strip_terminator(sql)) {
            Ok(statements) if statements.len() > 1 => Some(";".to_string()),
            _ => None,
        }
    }

    /// Policy decision for a statement. Approval is carried by `write`; the gate never prompts.
    pub fn decide(&self, statement: &SqlStatement) -> PolicyDecision {
        if strip_terminator(&statement.text).is_empty() {
            return PolicyDecision::Denied(SafetyViolation::EmptyStatement);
        }
        let classification = self.classify(&statement.text);
        if classification == Classification::Write && !statement.write {
            return PolicyDecision::RequiresApproval;
        }
        if let Some(token) = self.find_banned_token(&statement.text) {
            return PolicyDecision::Denied(SafetyViolation::BannedToken { token });
        }
        if classification == Classification::Write && !self.policy.allow_writes {
            return PolicyDecision::Denied(SafetyViolation::WritesDisabled);
        }
        PolicyDecision::Allowed
    }

    /// Vet a statement and, for unbounded reads, append a single LIMIT clause.
    pub fn validate_and_prepare(
        &self,
        sql: &str,
        declared_write: bool,
        row_limit: Option<usize>,
    ) -> std::result::Result<PreparedStatement, SafetyViolation> {
        let statement = SqlStatement::new(sql, declared_write);
        let classification = self.classify(sql);

        match self.decide(&statement) {
            PolicyDecision::Allowed => {}
            PolicyDecision::RequiresApproval => {
                warn!("Refusing {} statement without approval", classification);
                return Err(SafetyViolation::WriteWithoutApproval {
                    classification: classification.to_string(),
                });
            }
            PolicyDecision::Denied(violation) => {
                warn!("Statement denied: {}", violation);
                return Err(violation);
            }
        }

        let row_limit = row_limit.unwrap_or(self.policy.default_row_limit).max(1);
        let body = strip_terminator(sql);

        if classification == Classification::Write {
            return Ok(PreparedStatement {
                sql: body.to_string(),
                classification,
                row_limit,
                limit_injected: false,
            });
        }

        let masked = mask_literals(body).to_uppercase();
        let has_limit = match Parser::parse_sql(&SQLiteDialect {}, body) {
            Ok(statements) => statements.iter().any(statement_is_limited),
            Err(e) => {
                debug!("sqlparser could not parse statement ({}); using keyword scan", e);
                has_top_level_limit(&masked)
            }
        };

        if has_limit {
            return Ok(PreparedStatement {
                sql: body.to_string(),
                classification,
                row_limit,
                limit_injected: false,
            });
        }

        // a trailing line comment would swallow an appended clause
        let separator = if LINE_COMMENT.is_match(&masked) { "\n" } else { " " };
        Ok(PreparedStatement {
            sql: format!("{}{}LIMIT {}", body, separator, row_limit),
            classification,
            row_limit,
            limit_injected: true,
        })
    }
}
