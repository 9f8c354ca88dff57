//! Serializable description of which store records a load should import.
//!
//! A filter travels inside the load request to every owning node, so it is plain data rather than a closure. It is
//! evaluated against a record's key, its value and the positional parameters of the load's [`StoreArgs`].

use serde::Deserialize;
use serde::Serialize;
use std::cmp::Ordering;

use crate::types::RecordValue;

/// Store-specific arguments of a load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreArgs {
    /// Upper bound on the number of records the store scan yields.
    pub limit:  Option<u64>,
    /// Positional parameters a filter may refer to with [`Operand::Param`].
    pub params: Vec<RecordValue>,
}

impl StoreArgs {
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit:  Some(limit),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, value: RecordValue) -> Self {
        self.params.push(value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Literal(RecordValue),
    /// Index into [`StoreArgs::params`].
    Param(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum RecordFilter {
    #[default]
    All,
    KeyPrefix(String),
    /// Keys in `[start, end)`; a missing bound is open.
    KeyRange {
        start: Option<String>,
        end:   Option<String>,
    },
    /// Compares the value found at a JSON pointer (`""` is the whole value) with an operand. A missing pointer
    /// target never matches.
    Field {
        pointer: String,
        op:      CmpOp,
        operand: Operand,
    },
    Not(Box<RecordFilter>),
    And(Vec<RecordFilter>),
    Or(Vec<RecordFilter>),
}

impl RecordFilter {
    pub fn field<P: Into<String>>(pointer: P, op: CmpOp, operand: Operand) -> Self {
        Self::Field {
            pointer: pointer.into(),
            op,
            operand,
        }
    }

    pub fn matches(&self, key: &str, value: &RecordValue, args: &StoreArgs) -> bool {
        match self {
            Self::All => true,
            Self::KeyPrefix(prefix) => key.starts_with(prefix.as_str()),
            Self::KeyRange { start, end } => {
                start.as_deref().is_none_or(|s| key >= s) && end.as_deref().is_none_or(|e| key < e)
            }
            Self::Field { pointer, op, operand } => {
                let Some(actual) = value.pointer(pointer)
                else {
                    return false;
                };
                let expected = match operand {
                    Operand::Literal(v) => v,
                    Operand::Param(idx) => match args.params.get(*idx) {
                        Some(v) => v,
                        None => return false,
                    },
                };
                compare(actual, *op, expected)
            }
            Self::Not(inner) => !inner.matches(key, value, args),
            Self::And(filters) => filters.iter().all(|f| f.matches(key, value, args)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(key, value, args)),
        }
    }
}

fn compare(actual: &RecordValue, op: CmpOp, expected: &RecordValue) -> bool {
    match op {
        CmpOp::Eq => json_eq(actual, expected),
        CmpOp::Ne => !json_eq(actual, expected),
        _ => {
            let Some(ord) = json_order(actual, expected)
            else {
                return false;
            };
            match op {
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            }
        }
    }
}

// 1 and 1.0 are the same number as far as a filter is concerned.
fn json_eq(a: &RecordValue, b: &RecordValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn json_order(a: &RecordValue, b: &RecordValue) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}
