//! Relational guards attached to control-transfer edges.

use std::fmt;

use itertools::Itertools;

use crate::il::Value;

/// Relation codes over IL values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelCode {
    /// Unsigned ≤.
    #[strum(serialize = "≤ᵤ")]
    ULeq,
    /// Signed ≤.
    #[strum(serialize = "≤ₛ")]
    SLeq,
    /// Unsigned ≥.
    #[strum(serialize = "≥ᵤ")]
    UGeq,
    /// Signed ≥.
    #[strum(serialize = "≥ₛ")]
    SGeq,
    /// Unsigned <.
    #[strum(serialize = "<ᵤ")]
    ULess,
    /// Signed <.
    #[strum(serialize = "<ₛ")]
    SLess,
    /// Unsigned >.
    #[strum(serialize = ">ᵤ")]
    UGrtr,
    /// Signed >.
    #[strum(serialize = ">ₛ")]
    SGrtr,
    /// Equality.
    #[strum(serialize = "=")]
    Eq,
    /// Inequality.
    #[strum(serialize = "≠")]
    Neq,
}

impl RelCode {
    /// The complementary relation.
    pub fn negation(self) -> RelCode {
        match self {
            RelCode::ULeq => RelCode::UGrtr,
            RelCode::SLeq => RelCode::SGrtr,
            RelCode::UGeq => RelCode::ULess,
            RelCode::SGeq => RelCode::SLess,
            RelCode::ULess => RelCode::UGeq,
            RelCode::SLess => RelCode::SGeq,
            RelCode::UGrtr => RelCode::ULeq,
            RelCode::SGrtr => RelCode::SLeq,
            RelCode::Eq => RelCode::Neq,
            RelCode::Neq => RelCode::Eq,
        }
    }
}

/// One relational predicate `left <rel> right`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Relation {
    /// Left operand.
    pub left: Value,
    /// Relation code.
    pub relcode: RelCode,
    /// Right operand.
    pub right: Value,
}

impl Relation {
    /// Builds `left <rel> right`.
    pub fn new(left: impl Into<Value>, relcode: RelCode, right: impl Into<Value>) -> Relation {
        Relation {
            left: left.into(),
            relcode,
            right: right.into(),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.relcode, self.right)
    }
}

/// A conjunction of relations; the empty conjunction is `true`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Guard {
    /// The conjuncts.
    pub relations: Vec<Relation>,
}

impl Guard {
    /// The always-true guard.
    pub fn always() -> Guard {
        Guard::default()
    }

    /// A single-relation guard.
    pub fn new(left: impl Into<Value>, relcode: RelCode, right: impl Into<Value>) -> Guard {
        Guard {
            relations: vec![Relation::new(left, relcode, right)],
        }
    }

    /// A guard over several conjuncts.
    pub fn all(relations: Vec<Relation>) -> Guard {
        Guard { relations }
    }

    /// Whether this is the empty (always-true) conjunction.
    pub fn is_always(&self) -> bool {
        self.relations.is_empty()
    }

    /// The negated guard, obtained by complementing every relation code.
    pub fn negation(&self) -> Guard {
        Guard {
            relations: self
                .relations
                .iter()
                .map(|r| Relation::new(r.left.clone(), r.relcode.negation(), r.right.clone()))
                .collect(),
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relations.is_empty() {
            f.write_str("true")
        } else {
            f.write_str(&self.relations.iter().map(|r| r.to_string()).join(" ∧ "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::il::Value;

    #[test]
    fn empty_guard_is_true() {
        let g = Guard::always();

        assert!(g.is_always());
        assert_eq!(g.to_string(), "true");
        assert!(g.negation().is_always());
    }

    #[test]
    fn negation_is_an_involution() {
        let g = Guard::all(vec![
            Relation::new(Value::variable("r0", 8), RelCode::ULess, 7u32),
            Relation::new(Value::variable("r1", 8), RelCode::Eq, 0u32),
        ]);

        assert_ne!(g.negation(), g);
        assert_eq!(g.negation().negation(), g);
    }

    #[test]
    fn negation_swaps_relcodes() {
        let g = Guard::new(Value::variable("z", 1), RelCode::Eq, 1u32);

        assert_eq!(g.negation().relations[0].relcode, RelCode::Neq);
        assert_eq!(
            Guard::new(0u32, RelCode::SLeq, 1u32).negation().relations[0].relcode,
            RelCode::SGrtr
        );
    }
}
