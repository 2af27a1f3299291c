//! Parser for the query DSL.
//!
//! The grammar lives in `dsl.pest`; this module turns its parse tree into a
//! [`Query`]. Nothing here knows about types, so names are left unresolved
//! until the compiler sees them.

use std::fmt;

use pest::Parser;
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::error::{CatalogError, Result};

#[derive(Parser)]
#[grammar = "dsl.pest"]
struct DslParser;

// ------------- Syntax tree -------------
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub steps: Vec<Step>,
    pub select: Vec<SelectItem>,
    pub with_path: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Source(SourceStep),
    Loop(LoopStep),
}

/// A type, trait or attribute name, optionally aliased and filtered.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStep {
    pub name: String,
    pub alias: Option<String>,
    pub filters: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopStep {
    pub body: Vec<Step>,
    pub times: Option<usize>,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// `name`, `alias.name` or `alias.reference.name`.
    Path(Vec<String>),
    Arithmetic {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Comparison {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// `[subject] is Trait`; `isa` is the same test.
    IsTrait {
        subject: Option<Vec<String>>,
        trait_name: String,
    },
    /// `[subject] has attribute`.
    Has {
        subject: Option<Vec<String>>,
        attribute: String,
    },
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Literal::Long(v) => write!(f, "{}", v),
            Literal::Double(v) => write!(f, "{}", v),
            Literal::Boolean(v) => write!(f, "{}", v),
            Literal::Null => write!(f, "null"),
        }
    }
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        })
    }
}

fn subject_prefix(subject: &Option<Vec<String>>) -> String {
    subject.as_ref().map(|s| format!("{} ", s.join("."))).unwrap_or_default()
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(l) => write!(f, "{}", l),
            Expr::Path(segments) => write!(f, "{}", segments.join(".")),
            Expr::Arithmetic { op, left, right } => write!(f, "({} {} {})", left, op, right),
            Expr::Comparison { op, left, right } => write!(f, "{} {} {}", left, op, right),
            Expr::And(l, r) => write!(f, "({} and {})", l, r),
            Expr::Or(l, r) => write!(f, "({} or {})", l, r),
            Expr::Not(e) => write!(f, "not {}", e),
            Expr::IsTrait { subject, trait_name } => write!(f, "{}is {}", subject_prefix(subject), trait_name),
            Expr::Has { subject, attribute } => write!(f, "{}has {}", subject_prefix(subject), attribute),
        }
    }
}

// ------------- Parsing -------------
pub fn parse_query(text: &str) -> Result<Query> {
    let mut pairs = DslParser::parse(Rule::query, text).map_err(parse_error)?;
    let query = pairs.next().ok_or_else(|| malformed("empty parse"))?;
    build_query(query)
}

fn parse_error(e: pest::error::Error<Rule>) -> CatalogError {
    let (line, col) = match e.line_col {
        LineColLocation::Pos((line, col)) => (line, col),
        LineColLocation::Span((line, col), _) => (line, col),
    };
    CatalogError::QueryParse {
        message: format!("{} at line {}, column {}", e.variant.message(), line, col),
        line: Some(line),
        col: Some(col),
    }
}

fn malformed(what: &str) -> CatalogError {
    CatalogError::QueryParse {
        message: format!("malformed query: {}", what),
        line: None,
        col: None,
    }
}

fn next<'i>(pairs: &mut impl Iterator<Item = Pair<'i, Rule>>, what: &str) -> Result<Pair<'i, Rule>> {
    pairs.next().ok_or_else(|| malformed(what))
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_from
            | Rule::kw_where
            | Rule::kw_select
            | Rule::kw_as
            | Rule::kw_has
            | Rule::kw_loop
            | Rule::kw_times
            | Rule::kw_withpath
            | Rule::kw_limit
            | Rule::kw_and
            | Rule::kw_or
            | Rule::kw_not
            | Rule::is_op
    )
}

// children of a pair without the keywords that only shape the grammar
fn significant<'i>(pair: Pair<'i, Rule>) -> impl Iterator<Item = Pair<'i, Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

fn build_query(pair: Pair<Rule>) -> Result<Query> {
    let mut query = Query { steps: Vec::new(), select: Vec::new(), with_path: false, limit: None };
    for inner in significant(pair) {
        match inner.as_rule() {
            Rule::steps => query.steps = build_steps(inner)?,
            Rule::select_clause => {
                query.select = significant(inner).map(build_select_item).collect::<Result<_>>()?;
            }
            Rule::with_path => query.with_path = true,
            Rule::limit_clause => {
                let mut parts = significant(inner);
                query.limit = Some(parse_count(next(&mut parts, "limit")?)?);
            }
            _ => {}
        }
    }
    Ok(query)
}

fn build_steps(pair: Pair<Rule>) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    for step in significant(pair) {
        let mut parts = significant(step);
        let inner = next(&mut parts, "step")?;
        steps.push(match inner.as_rule() {
            Rule::loop_step => Step::Loop(build_loop(inner)?),
            _ => Step::Source(build_source(inner)?),
        });
    }
    Ok(steps)
}

fn build_source(pair: Pair<Rule>) -> Result<SourceStep> {
    let mut step = SourceStep { name: String::new(), alias: None, filters: Vec::new() };
    for inner in significant(pair) {
        match inner.as_rule() {
            Rule::name => step.name = inner.as_str().to_string(),
            Rule::alias => step.alias = Some(build_alias(inner)?),
            Rule::filter => {
                let mut parts = significant(inner);
                step.filters.push(build_filter(next(&mut parts, "filter")?)?);
            }
            _ => {}
        }
    }
    Ok(step)
}

fn build_filter(pair: Pair<Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::expr => build_expr(pair),
        Rule::trait_test => build_trait_test(pair),
        Rule::has_test => build_has_test(pair),
        Rule::bare_filter => {
            let mut parts = significant(pair);
            build_comparison(next(&mut parts, "comparison")?)
        }
        _ => Err(malformed("filter")),
    }
}

fn build_loop(pair: Pair<Rule>) -> Result<LoopStep> {
    let mut step = LoopStep { body: Vec::new(), times: None, alias: None };
    for inner in significant(pair) {
        match inner.as_rule() {
            Rule::steps => step.body = build_steps(inner)?,
            Rule::times => {
                let mut parts = significant(inner);
                step.times = Some(parse_count(next(&mut parts, "times")?)?);
            }
            Rule::alias => step.alias = Some(build_alias(inner)?),
            _ => {}
        }
    }
    Ok(step)
}

fn build_alias(pair: Pair<Rule>) -> Result<String> {
    let mut parts = significant(pair);
    Ok(next(&mut parts, "alias")?.as_str().to_string())
}

fn build_select_item(pair: Pair<Rule>) -> Result<SelectItem> {
    let mut parts = significant(pair);
    let expr = build_arith(next(&mut parts, "select expression")?)?;
    let alias = parts.next().map(build_alias).transpose()?;
    Ok(SelectItem { expr, alias })
}

fn parse_count(pair: Pair<Rule>) -> Result<usize> {
    pair.as_str().parse::<usize>().map_err(|_| {
        let (line, col) = pair.line_col();
        CatalogError::QueryParse {
            message: format!("'{}' is not a valid count", pair.as_str()),
            line: Some(line),
            col: Some(col),
        }
    })
}

// ------------- Expressions -------------
fn build_expr(pair: Pair<Rule>) -> Result<Expr> {
    let mut alternatives = significant(pair).map(build_and);
    let mut expr = alternatives.next().ok_or_else(|| malformed("or"))??;
    for alternative in alternatives {
        expr = Expr::Or(Box::new(expr), Box::new(alternative?));
    }
    Ok(expr)
}

fn build_and(pair: Pair<Rule>) -> Result<Expr> {
    let mut operands = significant(pair).map(build_predicate);
    let mut expr = operands.next().ok_or_else(|| malformed("and"))??;
    for operand in operands {
        expr = Expr::And(Box::new(expr), Box::new(operand?));
    }
    Ok(expr)
}

fn build_predicate(pair: Pair<Rule>) -> Result<Expr> {
    let mut parts = significant(pair);
    let inner = next(&mut parts, "predicate")?;
    match inner.as_rule() {
        Rule::negation => {
            let mut parts = significant(inner);
            Ok(Expr::Not(Box::new(build_predicate(next(&mut parts, "not")?)?)))
        }
        Rule::trait_test => build_trait_test(inner),
        Rule::has_test => build_has_test(inner),
        Rule::comparison => build_comparison(inner),
        Rule::expr => build_expr(inner),
        _ => Err(malformed("predicate")),
    }
}

// (subject, name) of an `is` or `has` test
fn subject_and_name(pair: Pair<Rule>) -> (Option<Vec<String>>, String) {
    let mut subject = None;
    let mut name = String::new();
    for inner in significant(pair) {
        match inner.as_rule() {
            Rule::path => subject = Some(build_path(inner)),
            Rule::name => name = inner.as_str().to_string(),
            _ => {}
        }
    }
    (subject, name)
}

fn build_trait_test(pair: Pair<Rule>) -> Result<Expr> {
    let (subject, trait_name) = subject_and_name(pair);
    Ok(Expr::IsTrait { subject, trait_name })
}

fn build_has_test(pair: Pair<Rule>) -> Result<Expr> {
    let (subject, attribute) = subject_and_name(pair);
    Ok(Expr::Has { subject, attribute })
}

fn build_comparison(pair: Pair<Rule>) -> Result<Expr> {
    let mut parts = significant(pair);
    let left = build_arith(next(&mut parts, "comparison")?)?;
    let Some(op) = parts.next() else {
        return Ok(left);
    };
    let op = match op.as_str() {
        "=" | "==" => CompareOp::Eq,
        "!=" => CompareOp::Ne,
        "<" => CompareOp::Lt,
        "<=" => CompareOp::Le,
        ">" => CompareOp::Gt,
        ">=" => CompareOp::Ge,
        other => return Err(malformed(other)),
    };
    let right = build_arith(next(&mut parts, "comparison operand")?)?;
    Ok(Expr::Comparison { op, left: Box::new(left), right: Box::new(right) })
}

// arith and term share one shape: operand (op operand)*
fn build_arith(pair: Pair<Rule>) -> Result<Expr> {
    let mut parts = significant(pair);
    let mut expr = build_operand(next(&mut parts, "operand")?)?;
    while let Some(op) = parts.next() {
        let op = match op.as_str() {
            "+" => ArithOp::Add,
            "-" => ArithOp::Sub,
            "*" => ArithOp::Mul,
            "/" => ArithOp::Div,
            other => return Err(malformed(other)),
        };
        let right = build_operand(next(&mut parts, "operand")?)?;
        expr = Expr::Arithmetic { op, left: Box::new(expr), right: Box::new(right) };
    }
    Ok(expr)
}

fn build_operand(pair: Pair<Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::term | Rule::arith => build_arith(pair),
        Rule::atom => {
            let mut parts = significant(pair);
            let inner = next(&mut parts, "atom")?;
            match inner.as_rule() {
                Rule::literal => Ok(Expr::Literal(build_literal(inner)?)),
                Rule::path => Ok(Expr::Path(build_path(inner))),
                _ => build_arith(inner),
            }
        }
        _ => Err(malformed("operand")),
    }
}

fn build_path(pair: Pair<Rule>) -> Vec<String> {
    significant(pair).map(|p| p.as_str().to_string()).collect()
}

fn build_literal(pair: Pair<Rule>) -> Result<Literal> {
    let mut parts = significant(pair);
    let inner = next(&mut parts, "literal")?;
    let text = inner.as_str();
    match inner.as_rule() {
        Rule::string => {
            let mut parts = significant(inner);
            Ok(Literal::String(unescape(next(&mut parts, "string")?.as_str())))
        }
        Rule::integer => text
            .parse()
            .map(Literal::Long)
            .map_err(|_| malformed(&format!("integer {} out of range", text))),
        Rule::float => text
            .parse()
            .map(Literal::Double)
            .map_err(|_| malformed(&format!("bad number {}", text))),
        Rule::boolean => Ok(Literal::Boolean(text.eq_ignore_ascii_case("true"))),
        _ => Ok(Literal::Null),
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
