//! Basic blocks and control-transfer edges.

use std::fmt;

use crate::area::Area;
use crate::error::Error;
use crate::guard::Guard;
use crate::il::{Instr, Value};
use crate::mnemonic::Mnemonic;

/// Index of a basic block inside its procedure's arena.
///
/// Blocks reference each other through these indices instead of pointers;
/// indices stay valid across block additions and logical deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    /// Position in the owning procedure's arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Where a control transfer goes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlTarget {
    /// A block of the same procedure.
    Resolved(BlockId),
    /// An IR value that has not been connected to a block yet: a constant
    /// address awaiting disassembly, or a computed jump target.
    Unresolved(Value),
}

impl ControlTarget {
    /// The resolved block, if any.
    pub fn block(&self) -> Option<BlockId> {
        match self {
            ControlTarget::Resolved(id) => Some(*id),
            ControlTarget::Unresolved(_) => None,
        }
    }

    /// The unresolved value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            ControlTarget::Resolved(_) => None,
            ControlTarget::Unresolved(v) => Some(v),
        }
    }

    /// The unresolved constant address, if any.
    pub fn constant(&self) -> Option<u32> {
        self.value().and_then(Value::as_constant).map(|c| c.value)
    }
}

/// A guarded control transfer (ctrans).
///
/// Outgoing lists point at the transfer's target; incoming lists reuse the
/// same shape with `target` naming the predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlTransfer {
    /// Condition under which the transfer is taken; empty means always.
    pub guard: Guard,
    /// The peer of the transfer.
    pub target: ControlTarget,
}

/// A maximal single-entry straight-line run of mnemonics.
///
/// The mnemonic sequence is contiguous and strictly monotone in addresses;
/// the block's area is the union of its mnemonics' areas. φ instructions
/// placed by SSA construction sit in front of the flattened instruction
/// view.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BasicBlock {
    area: Area,
    mnemonics: Vec<Mnemonic>,
    phis: Vec<Instr>,
    incoming: Vec<ControlTransfer>,
    outgoing: Vec<ControlTransfer>,
}

impl BasicBlock {
    /// An empty block.
    pub fn new() -> Self {
        BasicBlock::default()
    }

    /// A block seeded with mnemonics. The sequence must be contiguous.
    pub fn with_mnemonics(mnemonics: Vec<Mnemonic>) -> Result<Self, Error> {
        let mut bb = BasicBlock::new();

        for m in mnemonics {
            bb.append_mnemonic(m)?;
        }

        Ok(bb)
    }

    /// Bytes covered by the block.
    pub fn area(&self) -> Area {
        self.area
    }

    /// The mnemonics in address order.
    pub fn mnemonics(&self) -> &[Mnemonic] {
        &self.mnemonics
    }

    pub(crate) fn mnemonics_mut(&mut self) -> &mut Vec<Mnemonic> {
        &mut self.mnemonics
    }

    /// φ instructions at the head of the block.
    pub fn phis(&self) -> &[Instr] {
        &self.phis
    }

    pub(crate) fn phis_mut(&mut self) -> &mut Vec<Instr> {
        &mut self.phis
    }

    /// The flattened IL view: φs first, then each mnemonic's instructions.
    pub fn instructions(&self) -> impl Iterator<Item = &Instr> {
        self.phis
            .iter()
            .chain(self.mnemonics.iter().flat_map(|m| m.instructions.iter()))
    }

    pub(crate) fn instructions_mut(&mut self) -> impl Iterator<Item = &mut Instr> {
        self.phis
            .iter_mut()
            .chain(self.mnemonics.iter_mut().flat_map(|m| m.instructions.iter_mut()))
    }

    /// Incoming transfers; `target` names the predecessor.
    pub fn incoming(&self) -> &[ControlTransfer] {
        &self.incoming
    }

    /// Outgoing transfers.
    pub fn outgoing(&self) -> &[ControlTransfer] {
        &self.outgoing
    }

    pub(crate) fn incoming_mut(&mut self) -> &mut Vec<ControlTransfer> {
        &mut self.incoming
    }

    pub(crate) fn outgoing_mut(&mut self) -> &mut Vec<ControlTransfer> {
        &mut self.outgoing
    }

    /// Predecessor blocks, in edge order.
    pub fn predecessors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.incoming.iter().filter_map(|ct| ct.target.block())
    }

    /// Successor blocks, in edge order.
    pub fn successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.outgoing.iter().filter_map(|ct| ct.target.block())
    }

    /// Appends a mnemonic. It must start where the block currently ends.
    pub fn append_mnemonic(&mut self, m: Mnemonic) -> Result<(), Error> {
        if let Some(last) = self.mnemonics.last() {
            if last.area.end != m.area.begin {
                return Err(Error::invariant(format!(
                    "mnemonic at {} is not adjacent to block ending at {:#x}",
                    m.area, last.area.end
                )));
            }

            self.area = self.area.hull(&m.area);
        } else {
            self.area = m.area;
        }

        self.mnemonics.push(m);
        Ok(())
    }

    /// Adds an incoming transfer, replacing any existing one with the same
    /// peer.
    pub fn insert_incoming(&mut self, guard: Guard, source: ControlTarget) {
        self.incoming.retain(|ct| ct.target != source);
        self.incoming.push(ControlTransfer {
            guard,
            target: source,
        });
    }

    /// Adds an outgoing transfer, replacing any existing one with the same
    /// target.
    pub fn insert_outgoing(&mut self, guard: Guard, target: ControlTarget) {
        self.outgoing.retain(|ct| ct.target != target);
        self.outgoing.push(ControlTransfer { guard, target });
    }

    pub(crate) fn remove_incoming(&mut self, peer: &ControlTarget) {
        self.incoming.retain(|ct| ct.target != *peer);
    }

    pub(crate) fn remove_outgoing(&mut self, peer: &ControlTarget) {
        self.outgoing.retain(|ct| ct.target != *peer);
    }

    pub(crate) fn replace_incoming(&mut self, from: BlockId, to: BlockId) {
        for ct in self.incoming.iter_mut() {
            if ct.target == ControlTarget::Resolved(from) {
                ct.target = ControlTarget::Resolved(to);
            }
        }
    }

    pub(crate) fn replace_outgoing(&mut self, from: BlockId, to: BlockId) {
        for ct in self.outgoing.iter_mut() {
            if ct.target == ControlTarget::Resolved(from) {
                ct.target = ControlTarget::Resolved(to);
            }
        }
    }

    /// Drops all contents, leaving an empty husk.
    pub fn clear(&mut self) {
        *self = BasicBlock::new();
    }
}
