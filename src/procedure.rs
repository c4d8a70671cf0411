//! Procedures: per-procedure CFG arena and the recursive-descent driver.
//!
//! Blocks live in an indexed arena owned by their procedure and reference
//! each other by [`BlockId`]. Disassembly starts from seed addresses and
//! alternates between the decoder (which produces straight-line mnemonic
//! chunks) and the extension algorithm below, which grafts those chunks onto
//! the CFG, splitting blocks whenever a new transfer lands in their
//! interior.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::architecture::Architecture;
use crate::basic_block::{BasicBlock, BlockId, ControlTarget, ControlTransfer};
use crate::disassembler::{Matcher, SemState};
use crate::error::Error;
use crate::guard::Guard;
use crate::il::{Addr, Value};
use crate::mnemonic::Mnemonic;

/// A control transfer whose target still has to be disassembled or
/// connected: the target address, and the transfer it stems from (last byte
/// of the source mnemonic plus guard), if any.
#[derive(Debug, Clone)]
struct Pending {
    addr: Addr,
    source: Option<(Addr, Guard)>,
}

/// A reconstructed procedure.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Procedure {
    /// Human-readable name, derived from the entry address.
    pub name: String,
    entry: Option<BlockId>,
    blocks: Vec<Option<BasicBlock>>,
}

impl Procedure {
    /// An empty procedure.
    pub fn new(name: impl Into<String>) -> Self {
        Procedure {
            name: name.into(),
            entry: None,
            blocks: Vec::new(),
        }
    }

    /// The entry block, once disassembly has produced one.
    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    /// Seats the entry block, e.g. when assembling a procedure by hand.
    pub fn set_entry(&mut self, entry: Option<BlockId>) {
        self.entry = entry;
    }

    /// Adds a block to the arena.
    pub fn add_block(&mut self, bb: BasicBlock) -> BlockId {
        self.blocks.push(Some(bb));
        BlockId(self.blocks.len() - 1)
    }

    /// Logically deletes a block. Its index is never reused.
    pub fn retire_block(&mut self, id: BlockId) {
        if let Some(slot) = self.blocks.get_mut(id.0) {
            *slot = None;
        }
    }

    /// The block behind `id`, unless it was retired.
    pub fn block(&self, id: BlockId) -> Result<&BasicBlock, Error> {
        self.blocks
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::invariant(format!("{} was retired", id)))
    }

    /// Mutable access to the block behind `id`.
    pub fn block_mut(&mut self, id: BlockId) -> Result<&mut BasicBlock, Error> {
        self.blocks
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::invariant(format!("{} was retired", id)))
    }

    /// All live blocks with their ids, in arena order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (BlockId(i), b)))
    }

    /// The block whose address range contains `addr`.
    pub fn find_block_at(&self, addr: Addr) -> Option<BlockId> {
        self.blocks()
            .find(|(_, bb)| bb.area().contains(addr))
            .map(|(id, _)| id)
    }

    /// Reverse-postorder over the blocks reachable from the entry. Sibling
    /// visits are ordered by block begin address, making the result
    /// deterministic.
    pub fn rev_postorder(&self) -> Vec<BlockId> {
        let entry = match self.entry {
            Some(e) if self.block(e).is_ok() => e,
            _ => return Vec::new(),
        };
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::new();
        let mut stack: Vec<(BlockId, Vec<BlockId>)> = Vec::new();

        let successors = |id: BlockId| -> Vec<BlockId> {
            let mut succ: Vec<BlockId> = self
                .block(id)
                .map(|bb| bb.successors().collect())
                .unwrap_or_default();

            succ.sort_by_key(|s| self.block(*s).map(|b| b.area().begin).unwrap_or(Addr::MAX));
            succ.dedup();
            succ
        };

        visited[entry.0] = true;
        stack.push((entry, successors(entry)));

        loop {
            let child = match stack.last_mut() {
                Some((_, children)) => match children.iter().position(|c| !visited[c.0]) {
                    Some(i) => Some(children.remove(i)),
                    None => None,
                },
                None => break,
            };

            match child {
                Some(c) => {
                    visited[c.0] = true;

                    let grandchildren = successors(c);

                    stack.push((c, grandchildren));
                }
                None => {
                    if let Some((id, _)) = stack.pop() {
                        postorder.push(id);
                    }
                }
            }
        }

        postorder.reverse();
        postorder
    }

    /// Inserts a guarded transfer `from -> target`, replacing a pre-existing
    /// edge to the same target.
    pub fn conditional_jump(
        &mut self,
        from: BlockId,
        target: ControlTarget,
        guard: Guard,
    ) -> Result<(), Error> {
        self.block_mut(from)?
            .insert_outgoing(guard.clone(), target.clone());

        if let ControlTarget::Resolved(to) = target {
            self.block_mut(to)?
                .insert_incoming(guard, ControlTarget::Resolved(from));
        }

        Ok(())
    }

    /// Inserts an unguarded transfer `from -> target`.
    pub fn unconditional_jump(&mut self, from: BlockId, target: ControlTarget) -> Result<(), Error> {
        self.conditional_jump(from, target, Guard::always())
    }

    /// Inserts a transfer to a computed target value.
    pub fn indirect_jump(&mut self, from: BlockId, target: Value, guard: Guard) -> Result<(), Error> {
        self.conditional_jump(from, ControlTarget::Unresolved(target), guard)
    }

    /// Partitions a block at a mnemonic boundary.
    ///
    /// The mnemonic containing `pos` ends up last in `up` when `last` is
    /// true, and first in `down` otherwise. Incoming edges move to `up`,
    /// outgoing edges (including unresolved ones) to `down`, self edges
    /// become `down -> up`, and an unconditional edge connects `up -> down`.
    /// The original block is retired.
    pub fn split(&mut self, id: BlockId, pos: Addr, last: bool) -> Result<(BlockId, BlockId), Error> {
        let original = std::mem::take(self.block_mut(id)?);

        trace!(block = %id, pos, last, "splitting block {}", original.area());

        let mut up = BasicBlock::new();
        let mut down = BasicBlock::new();
        let mut seen = false;

        *up.phis_mut() = original.phis().to_vec();

        for m in original.mnemonics().iter().cloned() {
            if !last {
                seen |= m.area.contains(pos);
            }

            let hit = last && m.area.contains(pos);

            if seen {
                down.append_mnemonic(m)?;
            } else {
                up.append_mnemonic(m)?;
            }

            seen |= hit;
        }

        if !seen || up.mnemonics().is_empty() || down.mnemonics().is_empty() {
            // Undo nothing: the original was consumed, so rebuild it.
            *self.block_mut(id)? = original;
            return Err(Error::invariant(format!(
                "cannot split {} at {:#x}",
                id, pos
            )));
        }

        let up_id = self.add_block(up);
        let down_id = self.add_block(down);

        for ct in original.outgoing() {
            match &ct.target {
                ControlTarget::Resolved(b) if *b == id => {
                    // A self loop turns into a back edge from the lower half.
                    self.block_mut(down_id)?
                        .insert_outgoing(ct.guard.clone(), ControlTarget::Resolved(up_id));
                    self.block_mut(up_id)?
                        .insert_incoming(ct.guard.clone(), ControlTarget::Resolved(down_id));
                }
                ControlTarget::Resolved(b) => {
                    let b = *b;

                    self.block_mut(down_id)?
                        .insert_outgoing(ct.guard.clone(), ControlTarget::Resolved(b));
                    self.block_mut(b)?.remove_incoming(&ControlTarget::Resolved(id));
                    self.block_mut(b)?
                        .insert_incoming(ct.guard.clone(), ControlTarget::Resolved(down_id));
                }
                ControlTarget::Unresolved(v) => {
                    self.block_mut(down_id)?
                        .insert_outgoing(ct.guard.clone(), ControlTarget::Unresolved(v.clone()));
                }
            }
        }

        for ct in original.incoming() {
            match &ct.target {
                ControlTarget::Resolved(b) if *b == id => {}
                ControlTarget::Resolved(b) => {
                    let b = *b;

                    self.block_mut(up_id)?
                        .insert_incoming(ct.guard.clone(), ControlTarget::Resolved(b));
                    self.block_mut(b)?.remove_outgoing(&ControlTarget::Resolved(id));
                    self.block_mut(b)?
                        .insert_outgoing(ct.guard.clone(), ControlTarget::Resolved(up_id));
                }
                ControlTarget::Unresolved(_) => {}
            }
        }

        self.retire_block(id);
        self.unconditional_jump(up_id, ControlTarget::Resolved(down_id))?;

        if self.entry == Some(id) {
            self.entry = Some(up_id);
        }

        Ok((up_id, down_id))
    }

    /// Fuses two adjacent blocks connected by a lone unconditional edge.
    ///
    /// `up` must end where `down` begins, `up`'s only outgoing edge must be
    /// the unguarded transfer to `down`, and `down`'s only incoming edge must
    /// come from `up`. Everything else is an invariant error.
    pub fn merge(&mut self, up: BlockId, down: BlockId) -> Result<BlockId, Error> {
        {
            let upper = self.block(up)?;
            let lower = self.block(down)?;

            let fallthrough = upper.outgoing().len() == 1
                && upper.outgoing()[0].guard.is_always()
                && upper.outgoing()[0].target == ControlTarget::Resolved(down);
            let single_entry = lower.incoming().len() == 1
                && lower.incoming()[0].target == ControlTarget::Resolved(up);

            if upper.area().end != lower.area().begin {
                return Err(Error::invariant(format!(
                    "cannot merge non-adjacent blocks {} and {}",
                    upper.area(),
                    lower.area()
                )));
            }

            if !fallthrough || !single_entry {
                return Err(Error::invariant(format!(
                    "{} -> {} is not a lone unconditional fall-through",
                    up, down
                )));
            }

            if !lower.phis().is_empty() {
                return Err(Error::invariant(format!("{} carries φ instructions", down)));
            }
        }

        let lower = std::mem::take(self.block_mut(down)?);

        self.block_mut(up)?.remove_outgoing(&ControlTarget::Resolved(down));

        for m in lower.mnemonics().iter().cloned() {
            self.block_mut(up)?.append_mnemonic(m)?;
        }

        for ct in lower.outgoing() {
            match &ct.target {
                ControlTarget::Resolved(b) if *b == down => {
                    // A back edge to the lower half becomes a self loop.
                    self.conditional_jump(up, ControlTarget::Resolved(up), ct.guard.clone())?;
                }
                ControlTarget::Resolved(b) => {
                    let b = *b;

                    self.block_mut(b)?.remove_incoming(&ControlTarget::Resolved(down));
                    self.conditional_jump(up, ControlTarget::Resolved(b), ct.guard.clone())?;
                }
                ControlTarget::Unresolved(v) => {
                    self.block_mut(up)?
                        .insert_outgoing(ct.guard.clone(), ControlTarget::Unresolved(v.clone()));
                }
            }
        }

        self.retire_block(down);

        if self.entry == Some(down) {
            self.entry = Some(up);
        }

        Ok(up)
    }

    /// Grafts a freshly decoded mnemonic onto the CFG.
    ///
    /// `source` is the pending transfer leading here: the last byte of the
    /// jump (or fall-through) mnemonic plus its guard. Returns whether the
    /// mnemonic's bytes were already part of the procedure, and the block the
    /// mnemonic now lives in.
    pub fn extend(
        &mut self,
        m: Mnemonic,
        source: Option<(Addr, Guard)>,
    ) -> Result<(bool, BlockId), Error> {
        if let Some(tb) = self.find_block_at(m.area.begin) {
            // Known bytes: connect, splitting the owner when the transfer
            // lands in its interior.
            let target = if self.block(tb)?.area().begin == m.area.begin {
                tb
            } else {
                self.split(tb, m.area.begin, false)?.1
            };

            if let Some((byte, guard)) = source {
                let pb = self.source_block(byte)?;

                self.conditional_jump(pb, ControlTarget::Resolved(target), guard)?;
            }

            return Ok((true, target));
        }

        // Fresh bytes.
        match source {
            Some((byte, guard)) => {
                let pb = self.source_block(byte)?;
                let block = self.block(pb)?;

                if block.outgoing().is_empty() && block.area().end == m.area.begin {
                    trace!(block = %pb, "extending block with {}", m.area);
                    self.block_mut(pb)?.append_mnemonic(m)?;
                    Ok((false, pb))
                } else {
                    let mut bb = BasicBlock::new();

                    bb.append_mnemonic(m)?;

                    let nb = self.add_block(bb);

                    trace!(block = %nb, "new block");
                    self.conditional_jump(pb, ControlTarget::Resolved(nb), guard)?;
                    Ok((false, nb))
                }
            }
            None => {
                let mut bb = BasicBlock::new();

                bb.append_mnemonic(m)?;
                Ok((false, self.add_block(bb)))
            }
        }
    }

    /// The block whose *last* mnemonic contains `byte`, splitting its owner
    /// when the mnemonic sits in the interior.
    fn source_block(&mut self, byte: Addr) -> Result<BlockId, Error> {
        let pb = self
            .find_block_at(byte)
            .ok_or_else(|| Error::invariant(format!("no block owns source byte {:#x}", byte)))?;
        let is_last = self
            .block(pb)?
            .mnemonics()
            .last()
            .map_or(false, |m| m.area.contains(byte));

        if is_last {
            Ok(pb)
        } else {
            Ok(self.split(pb, byte, true)?.0)
        }
    }

    /// Removes the unresolved constant edge to `addr` from the block owning
    /// `byte`, returning it for possible re-attachment.
    fn detach_constant_edge(&mut self, byte: Addr, addr: Addr) -> Option<ControlTransfer> {
        let pb = self.find_block_at(byte)?;
        let outgoing = self.block_mut(pb).ok()?.outgoing_mut();
        let at = outgoing
            .iter()
            .position(|ct| ct.target.constant() == Some(addr))?;

        Some(outgoing.remove(at))
    }

    /// Integrates one decoded chunk: the state's mnemonics in order, then its
    /// jumps. Stops early when the chunk runs into already-decoded bytes.
    fn integrate<A: Architecture>(
        &mut self,
        state: SemState<A>,
        source: Option<(Addr, Guard)>,
        todo: &mut VecDeque<Pending>,
    ) -> Result<(), Error> {
        let mut prev = source;
        let mut last_block = None;

        for m in state.mnemonics {
            let last_byte = m.area.last().ok_or_else(|| {
                Error::invariant(format!("mnemonic at {:#x} covers no bytes", m.area.begin))
            })?;
            let (known, bb) = self.extend(m, prev.take())?;

            if known {
                // The rest of the chunk, including its jumps, was integrated
                // when these bytes were first decoded.
                return Ok(());
            }

            last_block = Some(bb);
            prev = Some((last_byte, Guard::always()));
        }

        let lb = match last_block {
            Some(lb) => lb,
            None => return Ok(()),
        };
        let last_byte = self
            .block(lb)?
            .area()
            .last()
            .ok_or_else(|| Error::invariant(format!("{} covers no bytes", lb)))?;

        for (value, guard) in state.jumps {
            let constant = value.as_constant().map(|c| c.value);

            self.block_mut(lb)?
                .insert_outgoing(guard.clone(), ControlTarget::Unresolved(value));

            if let Some(addr) = constant {
                todo.push_back(Pending {
                    addr,
                    source: Some((last_byte, guard)),
                });
            }
        }

        Ok(())
    }

    /// Recursive-descent disassembly.
    ///
    /// Extends `proc` (or a fresh procedure) by decoding at every seed and
    /// every discovered constant jump target until the worklist drains.
    /// Dangling constant edges of a pre-existing procedure are re-queued
    /// first, so resuming on a grown image upgrades them in place. Returns
    /// `None` when nothing was decoded into an empty procedure.
    pub fn disassemble<A, M>(
        proc: Option<Procedure>,
        matcher: &M,
        arch: &A,
        data: &[u8],
        seeds: &[Addr],
    ) -> Result<Option<Procedure>, Error>
    where
        A: Architecture,
        M: Matcher<A>,
    {
        let mut proc = proc.unwrap_or_default();
        let entry_addr = proc
            .entry
            .and_then(|e| proc.block(e).ok().map(|bb| bb.area().begin))
            .or_else(|| seeds.first().copied());
        let mut todo: VecDeque<Pending> = VecDeque::new();

        for (_, bb) in proc.blocks() {
            let last_byte = bb.area().last();

            for ct in bb.outgoing() {
                if let Some(addr) = ct.target.constant() {
                    todo.push_back(Pending {
                        addr,
                        source: last_byte.map(|b| (b, ct.guard.clone())),
                    });
                }
            }
        }

        for &addr in seeds {
            todo.push_back(Pending { addr, source: None });
        }

        while let Some(Pending { addr, source }) = todo.pop_front() {
            // Take the placeholder edge off its source so the extension
            // algorithm sees the block's true successor count.
            let detached = source
                .as_ref()
                .and_then(|(byte, _)| proc.detach_constant_edge(*byte, addr));

            if let Some(tb) = proc.find_block_at(addr) {
                if let Some((byte, guard)) = source {
                    let target = if proc.block(tb)?.area().begin == addr {
                        tb
                    } else {
                        proc.split(tb, addr, false)?.1
                    };
                    let pb = proc.source_block(byte)?;

                    proc.conditional_jump(pb, ControlTarget::Resolved(target), guard)?;
                }

                continue;
            }

            if addr as usize >= data.len() {
                warn!(addr, "{}", Error::Boundary(addr));
                Self::reattach(&mut proc, detached, &source)?;
                continue;
            }

            let state = SemState::new(addr, arch.clone());

            match matcher.try_match(data, addr, &state) {
                Some((_, state)) if !state.mnemonics.is_empty() => {
                    debug!(addr, mnemonics = state.mnemonics.len(), "decoded chunk");
                    proc.integrate(state, source, &mut todo)?;
                }
                _ => {
                    debug!(addr, "no rule matches");
                    Self::reattach(&mut proc, detached, &source)?;
                }
            }
        }

        if proc.blocks().next().is_none() {
            return Ok(None);
        }

        // The entry block may have been split; re-seat it.
        proc.entry = entry_addr
            .and_then(|a| proc.find_block_at(a))
            .or_else(|| proc.blocks().next().map(|(id, _)| id));

        if let Some(entry) = proc.entry {
            proc.name = format!("proc_{}", proc.block(entry)?.area().begin);
        }

        Ok(Some(proc))
    }

    fn reattach(
        proc: &mut Procedure,
        detached: Option<ControlTransfer>,
        source: &Option<(Addr, Guard)>,
    ) -> Result<(), Error> {
        if let (Some(edge), Some((byte, _))) = (detached, source) {
            if let Some(pb) = proc.find_block_at(*byte) {
                proc.block_mut(pb)?.insert_outgoing(edge.guard, edge.target);
            }
        }

        Ok(())
    }
}
