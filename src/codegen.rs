//! Typed builder for IL instructions.
//!
//! Every opcode is available in two flavors: a named form where the caller
//! picks the destination, and a `*_tmp` form that writes a fresh temporary
//! obtained from the architecture descriptor. Both return the destination
//! wrapped as a [`Value`] so calls can be chained.

use crate::architecture::Architecture;
use crate::error::Error;
use crate::il::{BitWidth, Instr, Name, Opcode, Value, Variable};

/// Appends IL instructions to a mnemonic under construction, inferring and
/// checking operand widths.
///
/// A width mismatch is fatal for the current mnemonic: the error aborts its
/// construction and nothing half-built leaks into the surrounding block.
pub struct CodeGenerator<'a, A: Architecture> {
    arch: &'a A,
    instructions: &'a mut Vec<Instr>,
}

macro_rules! binary_op {
    ($(#[$doc:meta])* $named:ident, $anon:ident => $opcode:ident) => {
        $(#[$doc])*
        pub fn $named(
            &mut self,
            dest: impl Into<Name>,
            op1: impl Into<Value>,
            op2: impl Into<Value>,
        ) -> Result<Value, Error> {
            self.push(Opcode::$opcode, dest.into(), vec![op1.into(), op2.into()])
        }

        /// Anonymous form writing a fresh temporary.
        pub fn $anon(&mut self, op1: impl Into<Value>, op2: impl Into<Value>) -> Result<Value, Error> {
            let tmp = self.arch.temporary();
            self.push(Opcode::$opcode, tmp, vec![op1.into(), op2.into()])
        }
    };
}

macro_rules! unary_op {
    ($(#[$doc:meta])* $named:ident, $anon:ident => $opcode:ident) => {
        $(#[$doc])*
        pub fn $named(&mut self, dest: impl Into<Name>, op: impl Into<Value>) -> Result<Value, Error> {
            self.push(Opcode::$opcode, dest.into(), vec![op.into()])
        }

        /// Anonymous form writing a fresh temporary.
        pub fn $anon(&mut self, op: impl Into<Value>) -> Result<Value, Error> {
            let tmp = self.arch.temporary();
            self.push(Opcode::$opcode, tmp, vec![op.into()])
        }
    };
}

impl<'a, A: Architecture> CodeGenerator<'a, A> {
    /// A generator appending into `sink`.
    pub fn new(arch: &'a A, sink: &'a mut Vec<Instr>) -> Self {
        CodeGenerator {
            arch,
            instructions: sink,
        }
    }

    binary_op!(
        /// Bitwise conjunction.
        and_b, and_b_tmp => And
    );
    binary_op!(
        /// Bitwise disjunction.
        or_b, or_b_tmp => Or
    );
    binary_op!(
        /// Bitwise exclusive disjunction.
        xor_b, xor_b_tmp => Xor
    );
    binary_op!(
        /// Addition.
        add_i, add_i_tmp => Add
    );
    binary_op!(
        /// Subtraction.
        sub_i, sub_i_tmp => Sub
    );
    binary_op!(
        /// Multiplication.
        mul_i, mul_i_tmp => Mul
    );
    binary_op!(
        /// Signed division.
        div_is, div_is_tmp => SDiv
    );
    binary_op!(
        /// Unsigned division.
        div_iu, div_iu_tmp => UDiv
    );
    binary_op!(
        /// Signed modulo reduction.
        mod_is, mod_is_tmp => SMod
    );
    binary_op!(
        /// Unsigned modulo reduction.
        mod_iu, mod_iu_tmp => UMod
    );
    binary_op!(
        /// Signed less-or-equal.
        leq_is, leq_is_tmp => SLeq
    );
    binary_op!(
        /// Unsigned less-or-equal.
        leq_iu, leq_iu_tmp => ULeq
    );
    binary_op!(
        /// Logical right shift of the second operand by the first.
        shiftr_u, shiftr_u_tmp => UShr
    );
    binary_op!(
        /// Logical left shift of the second operand by the first.
        shiftl_u, shiftl_u_tmp => UShl
    );
    binary_op!(
        /// Arithmetic right shift of the second operand by the first.
        shiftr_s, shiftr_s_tmp => SShr
    );
    binary_op!(
        /// Arithmetic left shift of the second operand by the first.
        shiftl_s, shiftl_s_tmp => SShl
    );
    binary_op!(
        /// Zero extension; the first operand is the target width.
        ext_u, ext_u_tmp => UExt
    );
    binary_op!(
        /// Sign extension; the first operand is the target width.
        ext_s, ext_s_tmp => SExt
    );
    binary_op!(
        /// Bit concatenation, low part first.
        concat, concat_tmp => Concat
    );

    unary_op!(
        /// Bitwise complement.
        not_b, not_b_tmp => Not
    );
    unary_op!(
        /// Copy.
        assign, assign_tmp => Assign
    );
    unary_op!(
        /// Procedure call; the operand is the callee address or expression.
        call, call_tmp => Call
    );

    /// Marks `dest` as holding undefined contents.
    pub fn undef(&mut self, dest: impl Into<Name>) -> Result<Value, Error> {
        self.push(Opcode::Assign, dest.into(), vec![Value::undefined(0)])
    }

    /// Bit slice `op[from ..= to]`, both bounds constant.
    pub fn slice(
        &mut self,
        dest: impl Into<Name>,
        op: impl Into<Value>,
        from: impl Into<Value>,
        to: impl Into<Value>,
    ) -> Result<Value, Error> {
        self.push(
            Opcode::Slice,
            dest.into(),
            vec![op.into(), from.into(), to.into()],
        )
    }

    /// Anonymous form of [`slice`](Self::slice).
    pub fn slice_tmp(
        &mut self,
        op: impl Into<Value>,
        from: impl Into<Value>,
        to: impl Into<Value>,
    ) -> Result<Value, Error> {
        let tmp = self.arch.temporary();
        self.push(Opcode::Slice, tmp, vec![op.into(), from.into(), to.into()])
    }

    /// Infers the instruction width, fills unresolved operand widths and
    /// appends the finished instruction.
    fn push(&mut self, opcode: Opcode, dest: Name, mut operands: Vec<Value>) -> Result<Value, Error> {
        // Architectural variables get their declared width.
        for v in operands.iter_mut() {
            if let Value::Variable(var) = v {
                if var.width == 0 {
                    var.width = self.arch.register_width(&var.name.base).ok_or_else(|| {
                        Error::width(format!("variable {} has no declared width", var.name))
                    })?;
                }
            }
        }

        let width = match opcode {
            Opcode::Slice => {
                if operands.len() != 3 {
                    return Err(Error::width("slice takes a value and two bounds"));
                }

                let value_width = operands[0].width();

                if value_width == 0 {
                    return Err(Error::width("sliced value has no width"));
                }

                for bound in operands[1..].iter_mut() {
                    if bound.width() == 0 {
                        bound.set_width(value_width);
                    }
                }

                let from = operands[1]
                    .as_constant()
                    .ok_or_else(|| Error::width("slice bounds must be constants"))?
                    .value;
                let to = operands[2]
                    .as_constant()
                    .ok_or_else(|| Error::width("slice bounds must be constants"))?
                    .value;

                if from > to || to >= u32::from(value_width) {
                    return Err(Error::width(format!(
                        "slice bounds [{}, {}] exceed a {} bit value",
                        from, to, value_width
                    )));
                }

                (to - from + 1) as BitWidth
            }
            Opcode::Concat => {
                if operands.iter().any(|v| v.width() == 0) {
                    return Err(Error::width("concatenated value has no width"));
                }

                let sum: u32 = operands.iter().map(|v| u32::from(v.width())).sum();

                BitWidth::try_from(sum)
                    .map_err(|_| Error::width(format!("concatenation of {} bits", sum)))?
            }
            Opcode::UExt | Opcode::SExt => {
                let hint = operands
                    .first()
                    .and_then(Value::as_constant)
                    .ok_or_else(|| Error::width("extension width hint must be a constant"))?
                    .value;
                let width = BitWidth::try_from(hint)
                    .ok()
                    .filter(|w| *w > 0)
                    .ok_or_else(|| Error::width(format!("cannot extend to {} bits", hint)))?;

                operands[0].set_width(width);

                if operands.get(1).map_or(0, Value::width) == 0 {
                    return Err(Error::width("extended value has no width"));
                }

                width
            }
            _ => {
                let mut width = operands.iter().map(Value::width).find(|w| *w > 0).unwrap_or(0);

                if width == 0 {
                    width = self.arch.register_width(&dest.base).ok_or_else(|| {
                        Error::width(format!("no width can be inferred for {}", dest))
                    })?;
                }

                if let Some(v) = operands.iter().find(|v| v.width() != 0 && v.width() != width) {
                    return Err(Error::width(format!(
                        "{:?} mixes {} and {} bit operands",
                        opcode,
                        width,
                        v.width()
                    )));
                }

                for v in operands.iter_mut() {
                    if v.width() == 0 {
                        v.set_width(width);
                    }
                }

                width
            }
        };

        // The architecture table is authoritative for declared names.
        if let Some(declared) = self.arch.register_width(&dest.base) {
            if declared != width {
                return Err(Error::width(format!(
                    "{} is declared {} bits wide but receives {}",
                    dest, declared, width
                )));
            }
        }

        let instr = Instr::new(
            opcode,
            Variable {
                name: dest,
                width,
            },
            operands,
        )?;
        let result = Value::Variable(instr.assignee.clone());

        self.instructions.push(instr);
        Ok(result)
    }
}
