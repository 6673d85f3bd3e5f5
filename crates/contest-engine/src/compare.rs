//! Parses and evaluates the small comparison language used by count
//! conditions, e.g. `"> 3"` or `"== 0"`.

use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

/// A compiled `<op> <literal>` expression, evaluated against an observed
/// count.
#[derive(Debug, Clone)]
pub struct Comparison {
    op: Op,
    rhs: i64,
}

impl Comparison {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let (op, rest) = if let Some(rest) = expr.strip_prefix(">=") {
            (Op::Gte, rest)
        } else if let Some(rest) = expr.strip_prefix("<=") {
            (Op::Lte, rest)
        } else if let Some(rest) = expr.strip_prefix("==") {
            (Op::Eq, rest)
        } else if let Some(rest) = expr.strip_prefix("!=") {
            (Op::Ne, rest)
        } else if let Some(rest) = expr.strip_prefix('>') {
            (Op::Gt, rest)
        } else if let Some(rest) = expr.strip_prefix('<') {
            (Op::Lt, rest)
        } else {
            return Err(EngineError::InvalidComparison(expr.to_string()));
        };

        let rhs = rest
            .trim()
            .parse::<i64>()
            .map_err(|_| EngineError::InvalidComparison(expr.to_string()))?;

        Ok(Self { op, rhs })
    }

    pub fn evaluate(&self, count: u64) -> bool {
        let count = count as i64;
        match self.op {
            Op::Gt => count > self.rhs,
            Op::Gte => count >= self.rhs,
            Op::Lt => count < self.rhs,
            Op::Lte => count <= self.rhs,
            Op::Eq => count == self.rhs,
            Op::Ne => count != self.rhs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gt_matches_higher_count() {
        let c = Comparison::parse("> 2").unwrap();
        assert!(!c.evaluate(2));
        assert!(c.evaluate(3));
    }

    #[test]
    fn gte_matches_equal() {
        let c = Comparison::parse(">= 3").unwrap();
        assert!(c.evaluate(3));
    }

    #[test]
    fn eq_requires_exact_match() {
        let c = Comparison::parse("== 0").unwrap();
        assert!(c.evaluate(0));
        assert!(!c.evaluate(1));
    }

    #[test]
    fn invalid_expression_rejected() {
        assert!(Comparison::parse("nope").is_err());
    }
}
