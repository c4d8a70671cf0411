//! Decoded machine instructions.

use std::fmt;

use itertools::Itertools;

use crate::area::Area;
use crate::il::{Instr, Value};

/// One decoded machine instruction.
///
/// A mnemonic names the instruction, records the bytes it occupies, keeps the
/// operand values used for printing, and owns the ordered IL instructions
/// that model its effects. The instruction list is never reordered once the
/// mnemonic exists.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mnemonic {
    /// Bytes occupied by the encoded instruction.
    pub area: Area,
    /// Textual opcode, e.g. `"mov"`.
    pub opcode: String,
    /// Operand values, in printing order.
    pub operands: Vec<Value>,
    /// The lowered IL, in execution order.
    pub instructions: Vec<Instr>,
}

impl Mnemonic {
    /// A mnemonic without IL, e.g. for opaque or unknown instructions.
    pub fn new(area: Area, opcode: impl Into<String>, operands: Vec<Value>) -> Mnemonic {
        Mnemonic::with_code(area, opcode, operands, Vec::new())
    }

    /// A mnemonic together with its lowered IL.
    pub fn with_code(
        area: Area,
        opcode: impl Into<String>,
        operands: Vec<Value>,
        instructions: Vec<Instr>,
    ) -> Mnemonic {
        Mnemonic {
            area,
            opcode: opcode.into(),
            operands,
            instructions,
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            f.write_str(&self.opcode)
        } else {
            write!(
                f,
                "{} {}",
                self.opcode,
                self.operands.iter().map(|v| v.to_string()).join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_operands() {
        let m = Mnemonic::new(
            Area::new(0, 2),
            "mov",
            vec![Value::variable("r0", 8), Value::constant(1, 8)],
        );

        assert_eq!(m.to_string(), "mov r0, 0x1");
        assert_eq!(Mnemonic::new(Area::new(2, 4), "ret", vec![]).to_string(), "ret");
    }
}
