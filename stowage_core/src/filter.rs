//! Row predicates in disjunctive normal form.
//!
//! A [`FiltersList`] holds plain filters, which are AND-ed, and groups. Each
//! group is an AND of its filters; the groups are OR-ed together and that
//! disjunction is AND-ed with the plain filters. The same list can be baked
//! into a polars expression for scans or evaluated against partition
//! directory values.

use crate::error::{Error, Result};
use polars::prelude::{Expr, col, lit};
use std::cmp::{Ordering, Reverse};
use std::fmt;
use std::str::FromStr;

/// A single literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Parse loosely: booleans, integers, floats, optionally quoted strings.
    pub fn parse(text: &str) -> Scalar {
        let t = text.trim();
        if let Some(inner) = strip_quotes(t) {
            return Scalar::Str(inner.to_string());
        }
        match t {
            "true" => return Scalar::Bool(true),
            "false" => return Scalar::Bool(false),
            _ => {}
        }
        if let Ok(i) = t.parse::<i64>() {
            return Scalar::Int(i);
        }
        if let Ok(f) = t.parse::<f64>() {
            return Scalar::Float(f);
        }
        Scalar::Str(t.to_string())
    }

    fn lit(&self) -> Expr {
        match self {
            Scalar::Bool(b) => lit(*b),
            Scalar::Int(i) => lit(*i),
            Scalar::Float(f) => lit(*f),
            Scalar::Str(s) => lit(s.clone()),
        }
    }

    fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            (Scalar::Int(a), Scalar::Float(b)) => (*a as f64).partial_cmp(b),
            (Scalar::Float(a), Scalar::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Scalar::Float(a), Scalar::Float(b)) => a.partial_cmp(b),
            (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

fn strip_quotes(t: &str) -> Option<&str> {
    let quoted = t.len() >= 2
        && ((t.starts_with('\'') && t.ends_with('\'')) || (t.starts_with('"') && t.ends_with('"')));
    quoted.then(|| &t[1..t.len() - 1])
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    In,
    NotIn,
}

impl Op {
    /// Accepts `=`, `==`, `!=`, `<`, `>`, `<=`, `>=`, `in` and `not in`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "=" | "==" => Ok(Op::Eq),
            "!=" => Ok(Op::NotEq),
            "<" => Ok(Op::Lt),
            ">" => Ok(Op::Gt),
            "<=" => Ok(Op::LtEq),
            ">=" => Ok(Op::GtEq),
            "in" => Ok(Op::In),
            "not in" => Ok(Op::NotIn),
            other => Err(Error::invalid_filter(format!("unknown operator {:?}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::NotEq => "!=",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::LtEq => "<=",
            Op::GtEq => ">=",
            Op::In => "in",
            Op::NotIn => "not in",
        }
    }

    fn is_set_op(&self) -> bool {
        matches!(self, Op::In | Op::NotIn)
    }
}

/// Right-hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    One(Scalar),
    Many(Vec<Scalar>),
}

/// An immutable `(column, operator, value)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    column: String,
    op: Op,
    value: FilterValue,
}

impl Filter {
    /// Set operators need a list, every other operator a single value.
    pub fn new(column: impl Into<String>, op: Op, value: FilterValue) -> Result<Self> {
        let column = column.into();
        if column.is_empty() {
            return Err(Error::invalid_filter("empty column name"));
        }
        match (&value, op.is_set_op()) {
            (FilterValue::Many(_), false) => {
                return Err(Error::invalid_filter(format!(
                    "operator {:?} takes a single value",
                    op.as_str()
                )));
            }
            (FilterValue::One(_), true) => {
                return Err(Error::invalid_filter(format!(
                    "operator {:?} takes a list of values",
                    op.as_str()
                )));
            }
            _ => {}
        }
        Ok(Self { column, op, value })
    }

    pub fn with_op(column: impl Into<String>, op: Op, value: impl Into<Scalar>) -> Result<Self> {
        Self::new(column, op, FilterValue::One(value.into()))
    }

    pub fn equal(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self {
            column: column.into(),
            op: Op::Eq,
            value: FilterValue::One(value.into()),
        }
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Scalar>) -> Self {
        Self {
            column: column.into(),
            op: Op::In,
            value: FilterValue::Many(values),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn value(&self) -> &FilterValue {
        &self.value
    }

    /// Polars expression for this filter.
    pub fn to_expr(&self) -> Expr {
        let c = col(self.column.as_str());
        match (&self.value, self.op) {
            (FilterValue::One(v), Op::Eq) => c.eq(v.lit()),
            (FilterValue::One(v), Op::NotEq) => c.neq(v.lit()),
            (FilterValue::One(v), Op::Lt) => c.lt(v.lit()),
            (FilterValue::One(v), Op::Gt) => c.gt(v.lit()),
            (FilterValue::One(v), Op::LtEq) => c.lt_eq(v.lit()),
            (FilterValue::One(v), Op::GtEq) => c.gt_eq(v.lit()),
            (FilterValue::Many(vs), Op::In) => any_of(&c, vs),
            (FilterValue::Many(vs), Op::NotIn) => any_of(&c, vs).not(),
            // Constructors never pair a set operator with a single value.
            (FilterValue::One(v), _) => c.eq(v.lit()),
            (FilterValue::Many(vs), _) => any_of(&c, vs),
        }
    }

    /// Evaluate against a single known value of the column.
    pub fn matches(&self, actual: &Scalar) -> Result<bool> {
        let ord = |expected: &Scalar| {
            actual.compare(expected).ok_or_else(|| {
                Error::invalid_filter(format!(
                    "cannot compare {} with {} for column {:?}",
                    actual, expected, self.column
                ))
            })
        };
        Ok(match (&self.value, self.op) {
            (FilterValue::One(v), Op::Eq) => ord(v)? == Ordering::Equal,
            (FilterValue::One(v), Op::NotEq) => ord(v)? != Ordering::Equal,
            (FilterValue::One(v), Op::Lt) => ord(v)? == Ordering::Less,
            (FilterValue::One(v), Op::Gt) => ord(v)? == Ordering::Greater,
            (FilterValue::One(v), Op::LtEq) => ord(v)? != Ordering::Greater,
            (FilterValue::One(v), Op::GtEq) => ord(v)? != Ordering::Less,
            (FilterValue::Many(vs), Op::NotIn) => {
                for v in vs {
                    if ord(v)? == Ordering::Equal {
                        return Ok(false);
                    }
                }
                true
            }
            (FilterValue::Many(vs), _) => {
                for v in vs {
                    if ord(v)? == Ordering::Equal {
                        return Ok(true);
                    }
                }
                false
            }
            (FilterValue::One(v), _) => ord(v)? == Ordering::Equal,
        })
    }
}

fn any_of(c: &Expr, values: &[Scalar]) -> Expr {
    values
        .iter()
        .map(|v| c.clone().eq(v.lit()))
        .reduce(|a, b| a.or(b))
        .unwrap_or_else(|| lit(false))
}

fn and_all<'a>(filters: impl Iterator<Item = &'a Filter>) -> Option<Expr> {
    filters.map(Filter::to_expr).reduce(|a, b| a.and(b))
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            FilterValue::One(v) => write!(f, "{} {} {}", self.column, self.op.as_str(), v),
            FilterValue::Many(vs) => {
                let items: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                write!(f, "{} {} [{}]", self.column, self.op.as_str(), items.join(", "))
            }
        }
    }
}

const TEXT_OPS: [&str; 9] = [" not in ", " in ", "<=", ">=", "!=", "==", "=", "<", ">"];

/// Leftmost operator in `s`; the longer token wins when two start together.
fn find_op(s: &str) -> Option<(usize, &'static str)> {
    TEXT_OPS
        .iter()
        .filter_map(|token| s.find(token).map(|at| (at, *token)))
        .min_by_key(|(at, token)| (*at, Reverse(token.len())))
}

impl FromStr for Filter {
    type Err = Error;

    /// Parse `col<op>value`, e.g. `a=1`, `b >= 2.5`, `c in [1, 2]`.
    fn from_str(s: &str) -> Result<Self> {
        if let Some((at, token)) = find_op(s) {
            let (lhs, rhs) = (&s[..at], &s[at + token.len()..]);
            let op = Op::parse(token)?;
            let column = lhs.trim();
            let value = if op.is_set_op() {
                let inner = rhs.trim();
                let inner = inner
                    .strip_prefix('[')
                    .and_then(|t| t.strip_suffix(']'))
                    .unwrap_or(inner);
                FilterValue::Many(
                    inner
                        .split(',')
                        .filter(|p| !p.trim().is_empty())
                        .map(Scalar::parse)
                        .collect(),
                )
            } else {
                FilterValue::One(Scalar::parse(rhs))
            };
            return Filter::new(column, op, value);
        }
        Err(Error::invalid_filter(format!("no operator in {:?}", s)))
    }
}

/// One element of a [`FiltersList`].
#[derive(Debug, Clone, PartialEq)]
pub enum FilterItem {
    Filter(Filter),
    Group(Vec<Filter>),
}

impl From<Filter> for FilterItem {
    fn from(f: Filter) -> Self {
        FilterItem::Filter(f)
    }
}

impl From<Vec<Filter>> for FilterItem {
    fn from(group: Vec<Filter>) -> Self {
        FilterItem::Group(group)
    }
}

/// A predicate in disjunctive normal form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FiltersList {
    items: Vec<FilterItem>,
}

impl FiltersList {
    pub fn new(items: Vec<FilterItem>) -> Self {
        Self { items }
    }

    /// A flat AND of the given filters.
    pub fn all(filters: Vec<Filter>) -> Self {
        Self {
            items: filters.into_iter().map(FilterItem::Filter).collect(),
        }
    }

    pub fn push(&mut self, item: impl Into<FilterItem>) {
        self.items.push(item.into());
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[FilterItem] {
        &self.items
    }

    pub fn has_groups(&self) -> bool {
        self.items.iter().any(|i| matches!(i, FilterItem::Group(_)))
    }

    /// Plain (AND-ed) filters, ignoring groups.
    pub fn flat(&self) -> impl Iterator<Item = &Filter> {
        self.items.iter().filter_map(|i| match i {
            FilterItem::Filter(f) => Some(f),
            FilterItem::Group(_) => None,
        })
    }

    fn every_filter(&self) -> impl Iterator<Item = &Filter> {
        self.items.iter().flat_map(|i| match i {
            FilterItem::Filter(f) => std::slice::from_ref(f).iter(),
            FilterItem::Group(g) => g.iter(),
        })
    }

    /// Reject filters on columns outside `allowed`.
    pub fn check_columns(&self, allowed: &[String], context: &str) -> Result<()> {
        for f in self.every_filter() {
            if !allowed.iter().any(|a| a == f.column()) {
                return Err(Error::invalid_filter(format!(
                    "{}: column {:?} cannot be filtered, allowed columns are {:?}",
                    context,
                    f.column(),
                    allowed
                )));
            }
        }
        Ok(())
    }

    /// Bake into one polars expression. `None` for an empty list.
    pub fn to_expr(&self) -> Option<Expr> {
        let flat = and_all(self.flat());
        let groups = self
            .items
            .iter()
            .filter_map(|i| match i {
                FilterItem::Group(g) => Some(and_all(g.iter()).unwrap_or_else(|| lit(true))),
                FilterItem::Filter(_) => None,
            })
            .reduce(|a, b| a.or(b));
        match (flat, groups) {
            (Some(f), Some(g)) => Some(f.and(g)),
            (f, g) => f.or(g),
        }
    }

    /// Evaluate with a lookup for column values.
    pub fn matches(&self, value_of: &dyn Fn(&str) -> Option<Scalar>) -> Result<bool> {
        let eval = |f: &Filter| -> Result<bool> {
            match value_of(f.column()) {
                Some(v) => f.matches(&v),
                None => Err(Error::invalid_filter(format!(
                    "no value for column {:?}",
                    f.column()
                ))),
            }
        };
        for f in self.flat() {
            if !eval(f)? {
                return Ok(false);
            }
        }
        let mut saw_group = false;
        for item in &self.items {
            if let FilterItem::Group(g) = item {
                saw_group = true;
                let mut all = true;
                for f in g {
                    if !eval(f)? {
                        all = false;
                        break;
                    }
                }
                if all {
                    return Ok(true);
                }
            }
        }
        Ok(!saw_group)
    }
}

impl From<Vec<Filter>> for FiltersList {
    fn from(filters: Vec<Filter>) -> Self {
        Self::all(filters)
    }
}
