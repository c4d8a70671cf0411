//! The intermediate language: names, values and three-address instructions.
//!
//! Machine code is lowered into a small RISC-like IL. Every value carries a
//! bit width; widths are inferred by the code generator while a mnemonic is
//! being built and must be strictly positive once an instruction exists.

use std::fmt;

use itertools::Itertools;

use crate::error::Error;

/// Byte address inside the program image.
pub type Addr = u32;

/// Width of a value in bits.
pub type BitWidth = u16;

/// An SSA-aware identifier: a textual base plus a version subscript.
///
/// A subscript of `-1` marks the name as unsubscripted; SSA construction
/// assigns versions starting at 0. Ordering is lexicographic over
/// `(base, subscript)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Name {
    /// Textual identifier, e.g. a register name or temporary.
    pub base: String,
    /// SSA version; `-1` if not yet assigned.
    pub subscript: i32,
}

impl Name {
    /// An unsubscripted name.
    pub fn new(base: impl Into<String>) -> Self {
        Name {
            base: base.into(),
            subscript: -1,
        }
    }

    /// A name with an explicit SSA version.
    pub fn subscripted(base: impl Into<String>, subscript: i32) -> Self {
        Name {
            base: base.into(),
            subscript,
        }
    }

    /// The same base with the version stripped.
    pub fn unsubscripted(&self) -> Name {
        Name::new(self.base.clone())
    }
}

impl From<&str> for Name {
    fn from(base: &str) -> Self {
        Name::new(base)
    }
}

impl From<String> for Name {
    fn from(base: String) -> Self {
        Name::new(base)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subscript >= 0 {
            write!(f, "{}_{}", self.base, self.subscript)
        } else {
            f.write_str(&self.base)
        }
    }
}

/// A compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Constant {
    /// The literal bits, zero-extended to 32.
    pub value: u32,
    /// Width in bits; 0 while still unresolved.
    pub width: BitWidth,
}

/// A named register or temporary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Variable {
    /// Identifier, including the SSA version once assigned.
    pub name: Name,
    /// Width in bits; 0 while still unresolved.
    pub width: BitWidth,
}

/// An IL value: constant, variable or undefined contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// A literal.
    Constant(Constant),
    /// A register or temporary.
    Variable(Variable),
    /// Unknown contents of a known width.
    Undefined {
        /// Width in bits; 0 while still unresolved.
        width: BitWidth,
    },
}

impl Value {
    /// A constant of the given width.
    pub fn constant(value: u32, width: BitWidth) -> Value {
        Value::Constant(Constant { value, width })
    }

    /// A variable of the given width.
    pub fn variable(name: impl Into<Name>, width: BitWidth) -> Value {
        Value::Variable(Variable {
            name: name.into(),
            width,
        })
    }

    /// Undefined contents of the given width.
    pub fn undefined(width: BitWidth) -> Value {
        Value::Undefined { width }
    }

    /// The width of the value in bits; 0 while unresolved.
    pub fn width(&self) -> BitWidth {
        match self {
            Value::Constant(c) => c.width,
            Value::Variable(v) => v.width,
            Value::Undefined { width } => *width,
        }
    }

    pub(crate) fn set_width(&mut self, width: BitWidth) {
        match self {
            Value::Constant(c) => c.width = width,
            Value::Variable(v) => v.width = width,
            Value::Undefined { width: w } => *w = width,
        }
    }

    /// The contained constant, if any.
    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Value::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// The contained variable, if any.
    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Value::Variable(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Constant> for Value {
    fn from(c: Constant) -> Self {
        Value::Constant(c)
    }
}

impl From<Variable> for Value {
    fn from(v: Variable) -> Self {
        Value::Variable(v)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::constant(value, 0)
    }
}

impl From<&str> for Value {
    fn from(name: &str) -> Self {
        Value::variable(name, 0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Constant(c) => write!(f, "{:#x}", c.value),
            Value::Variable(v) => v.name.fmt(f),
            Value::Undefined { .. } => f.write_str("⊥"),
        }
    }
}

/// The closed set of IL operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Opcode {
    /// Join of definitions at a control-flow confluence.
    #[strum(serialize = "ϕ")]
    Phi,
    /// Bitwise complement.
    #[strum(serialize = "¬")]
    Not,
    /// Bitwise conjunction.
    #[strum(serialize = "∧")]
    And,
    /// Bitwise disjunction.
    #[strum(serialize = "∨")]
    Or,
    /// Bitwise exclusive disjunction.
    #[strum(serialize = "⊕")]
    Xor,
    /// Copy.
    #[strum(serialize = "")]
    Assign,
    /// Unsigned less-or-equal.
    #[strum(serialize = "≤ᵤ")]
    ULeq,
    /// Signed less-or-equal.
    #[strum(serialize = "≤ₛ")]
    SLeq,
    /// Logical right shift.
    #[strum(serialize = "≫")]
    UShr,
    /// Logical left shift.
    #[strum(serialize = "≪")]
    UShl,
    /// Arithmetic right shift.
    #[strum(serialize = "≫ₛ")]
    SShr,
    /// Arithmetic left shift.
    #[strum(serialize = "≪ₛ")]
    SShl,
    /// Zero extension; the first operand is the target width.
    #[strum(serialize = "↤ᵤ")]
    UExt,
    /// Sign extension; the first operand is the target width.
    #[strum(serialize = "↤ₛ")]
    SExt,
    /// Bit slice `(value, from, to)`, both bounds inclusive.
    #[strum(serialize = ":")]
    Slice,
    /// Bit concatenation, low part first.
    #[strum(serialize = "∷")]
    Concat,
    /// Addition.
    #[strum(serialize = "+")]
    Add,
    /// Subtraction.
    #[strum(serialize = "-")]
    Sub,
    /// Multiplication.
    #[strum(serialize = "×")]
    Mul,
    /// Signed division.
    #[strum(serialize = "÷ₛ")]
    SDiv,
    /// Unsigned division.
    #[strum(serialize = "÷ᵤ")]
    UDiv,
    /// Signed modulo reduction.
    #[strum(serialize = "modₛ")]
    SMod,
    /// Unsigned modulo reduction.
    #[strum(serialize = "modᵤ")]
    UMod,
    /// Procedure call; the operand is the callee address or expression.
    #[strum(serialize = "call")]
    Call,
}

impl Opcode {
    /// The number of operands the opcode takes; `None` for the n-ary φ.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Opcode::Phi => None,
            Opcode::Not | Opcode::Assign | Opcode::Call => Some(1),
            Opcode::Slice => Some(3),
            _ => Some(2),
        }
    }
}

/// One three-address IL instruction.
///
/// Instances only come out of [`Instr::new`] (or [`Instr::phi`] for the φ
/// pseudo-operation), which enforces the width discipline: the destination
/// width is strictly positive, all operand widths are positive, `Slice`
/// bounds are constant and ordered, `Concat` sums its operand widths, and
/// every other opcode agrees with the destination width.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instr {
    /// The operation.
    pub opcode: Opcode,
    /// Destination variable.
    pub assignee: Variable,
    /// Ordered operands.
    pub operands: Vec<Value>,
}

impl Instr {
    /// Builds an instruction, checking arity and the width obligations.
    pub fn new(opcode: Opcode, assignee: Variable, operands: Vec<Value>) -> Result<Instr, Error> {
        if assignee.width == 0 {
            return Err(Error::width(format!(
                "destination {} of {:?} has no width",
                assignee.name, opcode
            )));
        }

        if operands.iter().any(|v| v.width() == 0) {
            return Err(Error::width(format!(
                "{:?} has an operand of unresolved width",
                opcode
            )));
        }

        if let Some(arity) = opcode.arity() {
            if operands.len() != arity {
                return Err(Error::width(format!(
                    "{:?} takes {} operands, got {}",
                    opcode,
                    arity,
                    operands.len()
                )));
            }
        }

        match opcode {
            Opcode::Phi => {}
            Opcode::Slice => {
                let value_width = operands[0].width();
                let from = operands[1].as_constant();
                let to = operands[2].as_constant();

                match (from, to) {
                    (Some(f), Some(t))
                        if f.value <= t.value && t.value < u32::from(value_width) =>
                    {
                        let expected = (t.value - f.value + 1) as BitWidth;

                        if assignee.width != expected {
                            return Err(Error::width(format!(
                                "slice of [{}, {}] yields {} bits, destination has {}",
                                f.value, t.value, expected, assignee.width
                            )));
                        }
                    }
                    _ => {
                        return Err(Error::width(
                            "slice bounds must be constants inside the sliced value",
                        ))
                    }
                }
            }
            Opcode::Concat => {
                let sum: u32 = operands.iter().map(|v| u32::from(v.width())).sum();

                if u32::from(assignee.width) != sum {
                    return Err(Error::width(format!(
                        "concatenation of {} bits into a {} bit destination",
                        sum, assignee.width
                    )));
                }
            }
            Opcode::UExt | Opcode::SExt => {
                let hint = operands
                    .first()
                    .and_then(Value::as_constant)
                    .ok_or_else(|| Error::width("extension width hint must be a constant"))?;

                if u32::from(assignee.width) != hint.value {
                    return Err(Error::width(format!(
                        "extension to {} bits into a {} bit destination",
                        hint.value, assignee.width
                    )));
                }
            }
            _ => {
                if let Some(v) = operands.iter().find(|v| v.width() != assignee.width) {
                    return Err(Error::width(format!(
                        "{:?} operand {} is {} bits wide, destination {} has {}",
                        opcode,
                        v,
                        v.width(),
                        assignee.name,
                        assignee.width
                    )));
                }
            }
        }

        Ok(Instr {
            opcode,
            assignee,
            operands,
        })
    }

    /// A φ instruction with no operand slots yet. SSA renaming fills one slot
    /// per predecessor.
    pub fn phi(assignee: Variable) -> Instr {
        Instr {
            opcode: Opcode::Phi,
            assignee,
            operands: Vec::new(),
        }
    }

    /// Variables read by this instruction.
    pub fn variable_operands(&self) -> impl Iterator<Item = &Variable> {
        self.operands.iter().filter_map(Value::as_variable)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Opcode::Assign if self.operands.len() == 1 => {
                write!(f, "{} ≔ {}", self.assignee.name, self.operands[0])
            }
            Opcode::Not if self.operands.len() == 1 => {
                write!(f, "{} ≔ ¬{}", self.assignee.name, self.operands[0])
            }
            Opcode::Phi | Opcode::Call => write!(
                f,
                "{} ≔ {}({})",
                self.assignee.name,
                self.opcode,
                self.operands.iter().map(|v| v.to_string()).join(", ")
            ),
            _ if self.operands.len() == 2 => write!(
                f,
                "{} ≔ {} {} {}",
                self.assignee.name, self.operands[0], self.opcode, self.operands[1]
            ),
            _ => write!(
                f,
                "{} ≔ {}({})",
                self.assignee.name,
                self.opcode,
                self.operands.iter().map(|v| v.to_string()).join(", ")
            ),
        }
    }
}
