//! Row-level rule grammar.
//!
//! Source specs carry rule expressions such as `quantity > 0`,
//! `side in ('BUY', 'SELL')` or `trade_date <= current_timestamp()`. Rules are
//! parsed once per spec into a small AST by a recursive-descent parser;
//! evaluation is a total function over the row, never a panic. Unrecognised
//! syntax downgrades to a warning and the rule passes, so a typo in a spec
//! cannot quarantine an entire feed.
//!
//! Recognised forms (keywords case-insensitive):
//!
//! ```text
//! field is [not] null
//! field [not] in (v1, v2, ...)
//! field matches 'regex'            -- anchored at the start of the value
//! field <op> literal               -- op in  <= < >= > = !=
//! field <op> current_timestamp()
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;

use vigil_core::spec::{RuleSpec, Severity};
use vigil_core::value::{Row, Value};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Le,
    Lt,
    Ge,
    Gt,
    Eq,
    Ne,
}

impl CmpOp {
    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Le => ord.is_le(),
            CmpOp::Lt => ord.is_lt(),
            CmpOp::Ge => ord.is_ge(),
            CmpOp::Gt => ord.is_gt(),
            CmpOp::Eq => ord.is_eq(),
            CmpOp::Ne => ord.is_ne(),
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CmpOp::Le => "<=",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
        };
        write!(f, "{text}")
    }
}

/// Literal values appearing in rules.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "{s}"),
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Parsed rule AST.
#[derive(Debug, Clone)]
pub enum Rule {
    IsNull { field: String, negated: bool },
    InList { field: String, values: Vec<Literal>, negated: bool },
    Matches { field: String, pattern: Regex },
    Compare { field: String, op: CmpOp, rhs: Literal },
    CompareNow { field: String, op: CmpOp },
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognised rule syntax: {0}")]
pub struct UnrecognisedRule(pub String);

/// Outcome of evaluating one rule against one row.
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub passed: bool,
    pub message: Option<String>,
}

impl RuleOutcome {
    fn pass() -> RuleOutcome {
        RuleOutcome {
            passed: true,
            message: None,
        }
    }

    fn fail(message: String) -> RuleOutcome {
        RuleOutcome {
            passed: false,
            message: Some(message),
        }
    }
}

/// A spec rule compiled for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub text: String,
    pub severity: Severity,
    /// `None` when the syntax was not recognised; such rules always pass.
    pub parsed: Option<Rule>,
}

/// Compile all row-level rules of a spec. Unrecognised rules are reported
/// once here rather than per row.
pub fn compile_rules(specs: &[RuleSpec]) -> Vec<CompiledRule> {
    specs
        .iter()
        .map(|spec| {
            let parsed = match parse_rule(&spec.rule) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(rule = %spec.rule, "{e}");
                    None
                }
            };
            CompiledRule {
                text: spec.rule.clone(),
                severity: spec.severity,
                parsed,
            }
        })
        .collect()
}

/// Parse one rule expression.
pub fn parse_rule(input: &str) -> Result<Rule, UnrecognisedRule> {
    let tokens = lex(input).ok_or_else(|| UnrecognisedRule(input.to_string()))?;
    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
    };
    parser.rule()
}

/// Evaluate a rule against a row. Total: every input yields pass or fail.
pub fn evaluate(rule: &Rule, row: &Row, row_num: usize, now: DateTime<Utc>) -> RuleOutcome {
    match rule {
        Rule::IsNull { field, negated } => {
            let null = is_nullish(row.get(field));
            match (negated, null) {
                (true, false) | (false, true) => RuleOutcome::pass(),
                (true, true) => {
                    RuleOutcome::fail(format!("Field '{field}' is null at row {row_num}"))
                }
                (false, false) => {
                    RuleOutcome::fail(format!("Field '{field}' is not null at row {row_num}"))
                }
            }
        }
        Rule::InList {
            field,
            values,
            negated,
        } => {
            let cell = row.get(field).cloned().unwrap_or(Value::Null);
            let member = values.iter().any(|lit| {
                literal_as_value(lit, &cell)
                    .and_then(|lv| cell.compare(&lv))
                    .is_some_and(|ord| ord.is_eq())
            });
            if member != *negated {
                RuleOutcome::pass()
            } else if *negated {
                RuleOutcome::fail(format!(
                    "Field '{field}' value '{cell}' is disallowed at row {row_num}"
                ))
            } else {
                RuleOutcome::fail(format!(
                    "Field '{field}' value '{cell}' not in allowed list at row {row_num}"
                ))
            }
        }
        Rule::Matches { field, pattern } => {
            let cell = row.get(field);
            if is_nullish(cell) {
                return RuleOutcome::fail(format!(
                    "Field '{field}' value '' doesn't match pattern at row {row_num}"
                ));
            }
            let text = cell.map(Value::to_string).unwrap_or_default();
            if pattern.is_match(&text) {
                RuleOutcome::pass()
            } else {
                RuleOutcome::fail(format!(
                    "Field '{field}' value '{text}' doesn't match pattern at row {row_num}"
                ))
            }
        }
        Rule::Compare { field, op, rhs } => {
            let Some(cell) = row.get(field) else {
                return RuleOutcome::pass();
            };
            // Nulls are the nullable check's concern, not the rule's.
            if cell.is_null() {
                return RuleOutcome::pass();
            }
            let comparable = literal_as_value(rhs, cell).and_then(|lv| cell.compare(&lv));
            match comparable {
                Some(ord) if op.holds(ord) => RuleOutcome::pass(),
                _ => RuleOutcome::fail(format!(
                    "Field '{field}' comparison '{cell} {op} {rhs}' failed at row {row_num}"
                )),
            }
        }
        Rule::CompareNow { field, op } => {
            let Some(cell) = row.get(field) else {
                return RuleOutcome::pass();
            };
            if cell.is_null() {
                return RuleOutcome::pass();
            }
            let ts = match cell {
                Value::Ts(ts) => Some(*ts),
                Value::Str(s) => Value::parse_timestamp(s),
                _ => None,
            };
            match ts {
                Some(ts) if op.holds(ts.cmp(&now)) => RuleOutcome::pass(),
                _ => RuleOutcome::fail(format!(
                    "Field '{field}' timestamp check failed at row {row_num}"
                )),
            }
        }
    }
}

/// Evaluate every compiled rule; returns failures split by severity.
pub fn evaluate_all(
    rules: &[CompiledRule],
    row: &Row,
    row_num: usize,
    now: DateTime<Utc>,
) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for compiled in rules {
        let Some(rule) = &compiled.parsed else {
            continue;
        };
        let outcome = evaluate(rule, row, row_num, now);
        if !outcome.passed {
            let message = outcome
                .message
                .unwrap_or_else(|| format!("rule '{}' failed at row {row_num}", compiled.text));
            match compiled.severity {
                Severity::Error => errors.push(message),
                Severity::Warning => warnings.push(message),
            }
        }
    }
    (errors, warnings)
}

fn is_nullish(cell: Option<&Value>) -> bool {
    match cell {
        None | Some(Value::Null) => true,
        Some(Value::Str(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Coerce a rule literal towards the runtime type of the row cell.
fn literal_as_value(lit: &Literal, cell: &Value) -> Option<Value> {
    match lit {
        Literal::Int(v) => Some(Value::Int(*v)),
        Literal::Float(v) => Some(Value::Float(*v)),
        Literal::Str(s) => match cell {
            Value::Ts(_) => Value::parse_timestamp(s).map(Value::Ts),
            Value::Date(_) => Value::parse_date(s).map(Value::Date),
            Value::Dec(_) => BigDecimal::from_str(s).ok().map(Value::Dec),
            Value::Int(_) => s.parse::<i64>().ok().map(Value::Int),
            Value::Float(_) => s.parse::<f64>().ok().map(Value::Float),
            _ => Some(Value::Str(s.clone())),
        },
    }
}

// ---------------------------------------------------------------------------
// Lexer and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    Op(CmpOp),
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let c = *chars.get(i)?;
                    i += 1;
                    if c == quote {
                        break;
                    }
                    text.push(c);
                }
                tokens.push(Token::Str(text));
            }
            '<' | '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(if c == '<' { CmpOp::Le } else { CmpOp::Ge }));
                    i += 2;
                } else {
                    tokens.push(Token::Op(if c == '<' { CmpOp::Lt } else { CmpOp::Gt }));
                    i += 1;
                }
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    return None;
                }
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Num(chars[start..i].iter().collect()));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn fail(&self) -> UnrecognisedRule {
        UnrecognisedRule(self.input.to_string())
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn keyword(&mut self, word: &str) -> bool {
        if let Some(Token::Ident(text)) = self.tokens.get(self.pos) {
            if text.eq_ignore_ascii_case(word) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn at_end(&self) -> bool {
        self.pos == self.tokens.len()
    }

    fn rule(&mut self) -> Result<Rule, UnrecognisedRule> {
        let field = match self.next() {
            Some(Token::Ident(name)) => name,
            _ => return Err(self.fail()),
        };

        if self.keyword("is") {
            let negated = self.keyword("not");
            if !self.keyword("null") || !self.at_end() {
                return Err(self.fail());
            }
            return Ok(Rule::IsNull { field, negated });
        }

        if self.keyword("not") {
            if !self.keyword("in") {
                return Err(self.fail());
            }
            let values = self.literal_list()?;
            return Ok(Rule::InList {
                field,
                values,
                negated: true,
            });
        }

        if self.keyword("in") {
            let values = self.literal_list()?;
            return Ok(Rule::InList {
                field,
                values,
                negated: false,
            });
        }

        if self.keyword("matches") {
            let pattern = match self.next() {
                Some(Token::Str(p)) => p,
                _ => return Err(self.fail()),
            };
            if !self.at_end() {
                return Err(self.fail());
            }
            let anchored = format!("^(?:{pattern})");
            let compiled = Regex::new(&anchored).map_err(|_| self.fail())?;
            return Ok(Rule::Matches {
                field,
                pattern: compiled,
            });
        }

        if let Some(Token::Op(op)) = self.tokens.get(self.pos).cloned() {
            self.pos += 1;
            if self.keyword("current_timestamp") {
                if self.next() != Some(Token::LParen)
                    || self.next() != Some(Token::RParen)
                    || !self.at_end()
                {
                    return Err(self.fail());
                }
                return Ok(Rule::CompareNow { field, op });
            }
            let rhs = self.literal()?;
            if !self.at_end() {
                return Err(self.fail());
            }
            return Ok(Rule::Compare { field, op, rhs });
        }

        Err(self.fail())
    }

    fn literal(&mut self) -> Result<Literal, UnrecognisedRule> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Num(n)) => parse_number(&n).ok_or_else(|| self.fail()),
            // Bare words compare as strings, matching the spec linter's
            // tolerance for unquoted enumerations.
            Some(Token::Ident(word)) => Ok(Literal::Str(word)),
            _ => Err(self.fail()),
        }
    }

    fn literal_list(&mut self) -> Result<Vec<Literal>, UnrecognisedRule> {
        if self.next() != Some(Token::LParen) {
            return Err(self.fail());
        }
        let mut values = Vec::new();
        loop {
            values.push(self.literal()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(self.fail()),
            }
        }
        if !self.at_end() {
            return Err(self.fail());
        }
        Ok(values)
    }
}

fn parse_number(text: &str) -> Option<Literal> {
    if text.contains('.') {
        text.parse::<f64>().ok().map(Literal::Float)
    } else {
        text.parse::<i64>().ok().map(Literal::Int)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval(rule: &str, r: &Row) -> RuleOutcome {
        let parsed = parse_rule(rule).unwrap();
        evaluate(&parsed, r, 2, Utc::now())
    }

    #[test]
    fn null_checks() {
        let r = row(&[("a", Value::Str("x".into())), ("b", Value::Null)]);
        assert!(eval("a is not null", &r).passed);
        assert!(!eval("b is not null", &r).passed);
        assert!(eval("b is null", &r).passed);
        assert!(eval("missing is null", &r).passed);
        // Empty string counts as null
        let r = row(&[("a", Value::Str(String::new()))]);
        assert!(!eval("a IS NOT NULL", &r).passed);
    }

    #[test]
    fn membership() {
        let r = row(&[("side", Value::Str("BUY".into()))]);
        assert!(eval("side in ('BUY', 'SELL')", &r).passed);
        assert!(!eval("side in ('HOLD')", &r).passed);
        assert!(eval("side not in ('HOLD')", &r).passed);
        assert!(!eval("side not in ('BUY', 'SELL')", &r).passed);

        let r = row(&[("venue_id", Value::Int(7))]);
        assert!(eval("venue_id in (7, 9)", &r).passed);
    }

    #[test]
    fn comparisons_coerce_to_cell_type() {
        let r = row(&[("quantity", Value::Float(10.5))]);
        assert!(eval("quantity > 0", &r).passed);
        assert!(!eval("quantity <= 10", &r).passed);

        let r = row(&[("price", Value::Dec("4.20".parse().unwrap()))]);
        assert!(eval("price >= '4.2'", &r).passed);

        // Null cells pass: nullability is checked elsewhere.
        let r = row(&[("quantity", Value::Null)]);
        assert!(eval("quantity > 0", &r).passed);

        // Incomparable types fail rather than panic.
        let r = row(&[("quantity", Value::Str("lots".into()))]);
        assert!(!eval("quantity > 0", &r).passed);
    }

    #[test]
    fn regex_is_anchored_at_start() {
        let r = row(&[("isin", Value::Str("GB0002634946".into()))]);
        assert!(eval("isin matches '[A-Z]{2}[0-9A-Z]{10}'", &r).passed);
        let r = row(&[("isin", Value::Str("xxGB0002634946".into()))]);
        assert!(!eval("isin matches '[A-Z]{2}[0-9A-Z]{10}'", &r).passed);
    }

    #[test]
    fn current_timestamp_comparison() {
        let past = Utc::now() - chrono::Duration::days(1);
        let future = Utc::now() + chrono::Duration::days(1);
        let r = row(&[("ts", Value::Ts(past))]);
        assert!(eval("ts <= current_timestamp()", &r).passed);
        let r = row(&[("ts", Value::Ts(future))]);
        assert!(!eval("ts <= current_timestamp()", &r).passed);
        // String timestamps are parsed on the fly
        let r = row(&[("ts", Value::Str("2020-01-01T00:00:00Z".into()))]);
        assert!(eval("ts < current_timestamp()", &r).passed);
    }

    #[test]
    fn unrecognised_syntax_is_not_an_error() {
        assert!(parse_rule("quantity between 1 and 5").is_err());
        assert!(parse_rule("").is_err());
        let compiled = compile_rules(&[RuleSpec {
            rule: "quantity between 1 and 5".into(),
            severity: Severity::Error,
        }]);
        let (errors, warnings) = evaluate_all(&compiled, &Row::new(), 2, Utc::now());
        assert!(errors.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn severity_split() {
        let compiled = compile_rules(&[
            RuleSpec {
                rule: "quantity > 0".into(),
                severity: Severity::Error,
            },
            RuleSpec {
                rule: "side in ('BUY', 'SELL')".into(),
                severity: Severity::Warning,
            },
        ]);
        let r = row(&[
            ("quantity", Value::Int(-1)),
            ("side", Value::Str("HOLD".into())),
        ]);
        let (errors, warnings) = evaluate_all(&compiled, &r, 3, Utc::now());
        assert_eq!(errors.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(errors[0].contains("row 3"));
    }
}
