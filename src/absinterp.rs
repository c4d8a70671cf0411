//! Abstract interpretation: a generic monotone-framework fixed point and the
//! taint and constant-propagation domains.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::trace;

use crate::basic_block::BlockId;
use crate::error::Error;
use crate::il::{Instr, Name, Opcode, Value};
use crate::procedure::Procedure;

/// A lattice domain for [`approximate`].
///
/// Implementations provide the bottom element, the join (supremum), the
/// per-instruction transfer function, and equality. `transfer` must be
/// monotone for the fixed point to exist.
pub trait Domain {
    /// The lattice carried per basic block.
    type Lattice: Clone + PartialEq;

    /// The least element.
    fn bottom(&self) -> Self::Lattice;

    /// The least upper bound of two elements.
    fn join(&self, a: &Self::Lattice, b: &Self::Lattice) -> Self::Lattice;

    /// Abstract semantics of one instruction.
    fn transfer(&self, lattice: Self::Lattice, instr: &Instr) -> Self::Lattice;

    /// Element equality; defaults to `PartialEq`.
    fn equal(&self, a: &Self::Lattice, b: &Self::Lattice) -> bool {
        a == b
    }
}

/// Runs `domain` to its least fixed point over the procedure's
/// reverse-postorder and returns the out-state of every reachable block.
///
/// Each iteration folds every block's instructions over the join of its
/// predecessors' previous out-states; iteration stops when no out-state
/// changed. Out-states start at bottom.
pub fn approximate<D: Domain>(
    domain: &D,
    proc: &Procedure,
) -> Result<BTreeMap<BlockId, D::Lattice>, Error> {
    let rpo = proc.rev_postorder();
    let mut last: BTreeMap<BlockId, D::Lattice> =
        rpo.iter().map(|b| (*b, domain.bottom())).collect();
    let mut rounds = 0usize;

    loop {
        let mut states: BTreeMap<BlockId, D::Lattice> = BTreeMap::new();

        for &b in &rpo {
            let bb = proc.block(b)?;
            let mut lattice = domain.bottom();

            for p in bb.predecessors() {
                if let Some(prev) = last.get(&p) {
                    lattice = domain.join(&lattice, prev);
                }
            }

            for instr in bb.instructions() {
                lattice = domain.transfer(lattice, instr);
            }

            states.insert(b, lattice);
        }

        rounds += 1;

        let stable = rpo
            .iter()
            .all(|b| domain.equal(&states[b], &last[b]));

        last = states;

        if stable {
            trace!(rounds, "abstract interpretation converged");
            return Ok(last);
        }
    }
}

/// Per-variable taint: the set of names a value transitively depends on.
pub type TaintLattice = BTreeMap<Name, BTreeSet<Name>>;

/// The taint domain. Join is key-wise set union; the transfer of an
/// instruction taints the destination with its variable operands and
/// everything they are tainted by.
#[derive(Debug, Clone, Copy, Default)]
pub struct Taint;

impl Domain for Taint {
    type Lattice = TaintLattice;

    fn bottom(&self) -> TaintLattice {
        TaintLattice::new()
    }

    fn join(&self, a: &TaintLattice, b: &TaintLattice) -> TaintLattice {
        let mut out = a.clone();

        for (name, sources) in b {
            out.entry(name.clone())
                .or_default()
                .extend(sources.iter().cloned());
        }

        out
    }

    fn transfer(&self, mut lattice: TaintLattice, instr: &Instr) -> TaintLattice {
        let mut sources = lattice
            .get(&instr.assignee.name)
            .cloned()
            .unwrap_or_default();

        for v in instr.variable_operands() {
            sources.insert(v.name.clone());

            if let Some(transitive) = lattice.get(&v.name) {
                sources.extend(transitive.iter().cloned());
            }
        }

        lattice.insert(instr.assignee.name.clone(), sources);
        lattice
    }
}

/// One constant-propagation element: ⊥ < `Const(k)` < ⊤.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CpropValue {
    /// No information yet.
    Bottom,
    /// Provably this constant.
    Const(u32),
    /// Provably not a single constant.
    NonConst,
}

impl CpropValue {
    /// The least upper bound; distinct constants join to ⊤.
    pub fn join(self, other: CpropValue) -> CpropValue {
        match (self, other) {
            (CpropValue::Bottom, x) | (x, CpropValue::Bottom) => x,
            (CpropValue::NonConst, _) | (_, CpropValue::NonConst) => CpropValue::NonConst,
            (CpropValue::Const(a), CpropValue::Const(b)) if a == b => self,
            _ => CpropValue::NonConst,
        }
    }
}

impl fmt::Display for CpropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpropValue::Bottom => f.write_str("⊥"),
            CpropValue::Const(k) => write!(f, "{:#x}", k),
            CpropValue::NonConst => f.write_str("⊤"),
        }
    }
}

/// Per-variable constant propagation; a missing key is ⊥.
pub type CpropLattice = BTreeMap<Name, CpropValue>;

/// The constant-propagation domain.
///
/// The transfer interprets an instruction concretely when every operand is a
/// known constant. `Call` is opaque: it defines nothing, so its destination
/// stays ⊥ unless a later assignment gives it a value. Division or modulo by
/// zero goes to ⊤.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cprop;

impl Domain for Cprop {
    type Lattice = CpropLattice;

    fn bottom(&self) -> CpropLattice {
        CpropLattice::new()
    }

    fn join(&self, a: &CpropLattice, b: &CpropLattice) -> CpropLattice {
        let mut out = a.clone();

        for (name, value) in b {
            let merged = out
                .get(name)
                .copied()
                .unwrap_or(CpropValue::Bottom)
                .join(*value);

            out.insert(name.clone(), merged);
        }

        out
    }

    fn transfer(&self, mut lattice: CpropLattice, instr: &Instr) -> CpropLattice {
        if instr.opcode == Opcode::Call {
            return lattice;
        }

        // A destination already at ⊤ cannot recover.
        if lattice.get(&instr.assignee.name) == Some(&CpropValue::NonConst) {
            return lattice;
        }

        let operands: Vec<CpropValue> = instr
            .operands
            .iter()
            .map(|v| match v {
                Value::Constant(c) => CpropValue::Const(c.value),
                Value::Variable(var) => lattice
                    .get(&var.name)
                    .copied()
                    .unwrap_or(CpropValue::Bottom),
                Value::Undefined { .. } => CpropValue::Bottom,
            })
            .collect();

        let result = if operands.iter().any(|o| *o == CpropValue::NonConst) {
            CpropValue::NonConst
        } else if operands.iter().any(|o| *o == CpropValue::Bottom) {
            CpropValue::Bottom
        } else {
            let constants: Vec<u32> = operands
                .iter()
                .map(|o| match o {
                    CpropValue::Const(k) => *k,
                    _ => unreachable!(),
                })
                .collect();

            interpret(instr, &constants)
        };

        lattice.insert(instr.assignee.name.clone(), result);
        lattice
    }
}

fn mask(width: u16) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

/// Sign extension of `value` from `width` bits into an `i64`.
fn sext(value: u32, width: u16) -> i64 {
    if width == 0 || width >= 32 {
        return i64::from(value as i32);
    }

    let sign = 1u32 << (width - 1);

    if value & sign != 0 {
        i64::from(value) - (1i64 << width)
    } else {
        i64::from(value)
    }
}

/// Concrete semantics of one opcode over constant operands.
fn interpret(instr: &Instr, ops: &[u32]) -> CpropValue {
    use CpropValue::{Const, NonConst};

    let width = instr.assignee.width;
    let m = mask(width);
    let wrap = |v: u64| Const((v as u32) & m);
    let wrap_signed = |v: i64| Const((v as u32) & m);

    match instr.opcode {
        Opcode::Phi => {
            // Identical incoming constants survive the join.
            match ops.split_first() {
                Some((first, rest)) if rest.iter().all(|o| o == first) => Const(*first),
                Some(_) => NonConst,
                None => CpropValue::Bottom,
            }
        }
        Opcode::Assign => Const(ops[0] & m),
        Opcode::Not => Const(!ops[0] & m),
        Opcode::And => Const(ops[0] & ops[1] & m),
        Opcode::Or => Const((ops[0] | ops[1]) & m),
        Opcode::Xor => Const((ops[0] ^ ops[1]) & m),
        Opcode::Add => wrap(u64::from(ops[0]) + u64::from(ops[1])),
        Opcode::Sub => wrap(u64::from(ops[0]).wrapping_sub(u64::from(ops[1]))),
        Opcode::Mul => wrap(u64::from(ops[0]) * u64::from(ops[1])),
        Opcode::UDiv => {
            if ops[1] == 0 {
                NonConst
            } else {
                Const((ops[0] / ops[1]) & m)
            }
        }
        Opcode::UMod => {
            if ops[1] == 0 {
                NonConst
            } else {
                Const((ops[0] % ops[1]) & m)
            }
        }
        Opcode::SDiv => {
            let divisor = sext(ops[1], operand_width(instr, 1));

            if divisor == 0 {
                NonConst
            } else {
                wrap_signed(sext(ops[0], operand_width(instr, 0)) / divisor)
            }
        }
        Opcode::SMod => {
            let divisor = sext(ops[1], operand_width(instr, 1));

            if divisor == 0 {
                NonConst
            } else {
                wrap_signed(sext(ops[0], operand_width(instr, 0)) % divisor)
            }
        }
        Opcode::ULeq => Const(u32::from(ops[0] <= ops[1])),
        Opcode::SLeq => Const(u32::from(
            sext(ops[0], operand_width(instr, 0)) <= sext(ops[1], operand_width(instr, 1)),
        )),
        Opcode::UShr => {
            let (count, value) = (ops[0], ops[1]);

            if count >= 32 {
                Const(0)
            } else {
                Const((value >> count) & m)
            }
        }
        Opcode::UShl | Opcode::SShl => {
            let (count, value) = (ops[0], ops[1]);

            if count >= 32 {
                Const(0)
            } else {
                Const((value << count) & m)
            }
        }
        Opcode::SShr => {
            let (count, value) = (ops[0], ops[1]);
            let wide = sext(value, operand_width(instr, 1));

            wrap_signed(wide >> count.min(63))
        }
        Opcode::UExt => Const(ops[1] & m),
        Opcode::SExt => wrap_signed(sext(ops[1], operand_width(instr, 1))),
        Opcode::Slice => {
            let (value, from, to) = (ops[0], ops[1], ops[2]);

            Const((value >> from) & mask((to - from + 1) as u16))
        }
        Opcode::Concat => {
            let low_width = operand_width(instr, 0);

            wrap(u64::from(ops[0]) | (u64::from(ops[1]) << low_width))
        }
        Opcode::Call => unreachable!("call is filtered before interpretation"),
    }
}

fn operand_width(instr: &Instr, index: usize) -> u16 {
    instr.operands.get(index).map(Value::width).unwrap_or(32)
}
