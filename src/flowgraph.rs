//! The whole-program driver: procedures, their analyses and the call graph.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info};

use crate::absinterp::{approximate, Cprop, CpropLattice, CpropValue, Taint, TaintLattice};
use crate::architecture::Architecture;
use crate::basic_block::{BlockId, ControlTarget};
use crate::dataflow::{dominance_tree, liveness, ssa, Dominance, Liveness};
use crate::disassembler::Matcher;
use crate::error::Error;
use crate::il::{Addr, Opcode, Value};
use crate::procedure::Procedure;

/// A procedure together with the results of the analysis pipeline.
pub struct AnalyzedProcedure {
    /// The reconstructed CFG in SSA form.
    pub procedure: Procedure,
    /// Dominator tree and frontiers.
    pub dominance: Dominance,
    /// UEVar/VarKill/LiveOut triple.
    pub liveness: Liveness,
    /// Taint out-state per block.
    pub taint: BTreeMap<BlockId, TaintLattice>,
    /// Constant-propagation out-state per block.
    pub cprop: BTreeMap<BlockId, CpropLattice>,
    /// Entry addresses of procedures called from here.
    pub callees: BTreeSet<Addr>,
}

impl AnalyzedProcedure {
    /// The procedure's entry address.
    pub fn entry_address(&self) -> Option<Addr> {
        self.procedure
            .entry()
            .and_then(|e| self.procedure.block(e).ok())
            .map(|bb| bb.area().begin)
    }

    /// Whether any block covers `addr`.
    pub fn covers(&self, addr: Addr) -> bool {
        self.procedure.find_block_at(addr).is_some()
    }
}

/// The analyzed program: procedures plus the call graph induced by resolved
/// `Call` targets.
#[derive(Default)]
pub struct FlowGraph {
    /// All reconstructed procedures.
    pub procedures: Vec<AnalyzedProcedure>,
}

impl FlowGraph {
    /// The procedure covering `addr`, if any.
    pub fn find_procedure(&self, addr: Addr) -> Option<&AnalyzedProcedure> {
        self.procedures.iter().find(|p| p.covers(addr))
    }

    /// Whether any procedure covers `addr`.
    pub fn covers(&self, addr: Addr) -> bool {
        self.find_procedure(addr).is_some()
    }

    /// The call graph: entry address → callee entry addresses.
    pub fn call_graph(&self) -> BTreeMap<Addr, BTreeSet<Addr>> {
        self.procedures
            .iter()
            .filter_map(|p| p.entry_address().map(|e| (e, p.callees.clone())))
            .collect()
    }
}

/// Disassembles and analyzes a program image.
///
/// The worklist starts at `entries`; every resolved `Call` to a yet-uncovered
/// address spawns another procedure. A procedure that trips an invariant is
/// abandoned whole and logged; the driver continues with the remaining
/// worklist.
pub fn disassemble<A, M>(arch: &A, matcher: &M, data: &[u8], entries: &[Addr]) -> FlowGraph
where
    A: Architecture,
    M: Matcher<A>,
{
    let mut flow = FlowGraph::default();
    let mut worklist: BTreeSet<Addr> = entries.iter().copied().collect();

    while let Some(&entry) = worklist.iter().next() {
        worklist.remove(&entry);

        if flow.covers(entry) {
            continue;
        }

        match analyze_procedure(arch, matcher, data, entry) {
            Ok(Some(analyzed)) => {
                info!(
                    entry,
                    name = %analyzed.procedure.name,
                    blocks = analyzed.procedure.blocks().count(),
                    "procedure reconstructed"
                );

                for &callee in &analyzed.callees {
                    if !flow.covers(callee) {
                        debug!(callee, "new call target");
                        worklist.insert(callee);
                    }
                }

                flow.procedures.push(analyzed);
            }
            Ok(None) => debug!(entry, "nothing decodable at entry"),
            Err(e) => error!(entry, error = %e, "procedure analysis abandoned"),
        }
    }

    flow
}

/// Runs one procedure to its fixed point: disassemble, analyze, resolve
/// indirect jumps from constant-propagation facts, repeat until no edge
/// changes; then collect taint and call targets.
fn analyze_procedure<A, M>(
    arch: &A,
    matcher: &M,
    data: &[u8],
    entry: Addr,
) -> Result<Option<AnalyzedProcedure>, Error>
where
    A: Architecture,
    M: Matcher<A>,
{
    let mut proc = match Procedure::disassemble(None, matcher, arch, data, &[entry])? {
        Some(proc) => proc,
        None => return Ok(None),
    };

    loop {
        let dominance = dominance_tree(&proc)?;
        let live = liveness(&proc);

        ssa(&mut proc, &dominance, &live)?;

        let cprop = approximate(&Cprop, &proc)?;

        if !resolve_indirect_jumps(&mut proc, &cprop)? {
            let taint = approximate(&Taint, &proc)?;
            let callees = call_targets(&proc);

            return Ok(Some(AnalyzedProcedure {
                procedure: proc,
                dominance,
                liveness: live,
                taint,
                cprop,
                callees,
            }));
        }

        proc = Procedure::disassemble(Some(proc), matcher, arch, data, &[])?
            .ok_or_else(|| Error::invariant("procedure vanished while resolving jumps"))?;
    }
}

/// Rewrites unresolved variable edges whose target the constant-propagation
/// result pins down into constant edges, ready for another disassembly
/// round. Returns whether anything changed.
fn resolve_indirect_jumps(
    proc: &mut Procedure,
    cprop: &BTreeMap<BlockId, CpropLattice>,
) -> Result<bool, Error> {
    let ids: Vec<BlockId> = proc.blocks().map(|(id, _)| id).collect();
    let mut dirty = false;

    for id in ids {
        let facts = match cprop.get(&id) {
            Some(facts) => facts,
            None => continue,
        };
        let mut resolved: Vec<(Value, u32)> = Vec::new();

        for ct in proc.block(id)?.outgoing() {
            if let ControlTarget::Unresolved(value @ Value::Variable(var)) = &ct.target {
                if let Some(CpropValue::Const(k)) = facts.get(&var.name) {
                    resolved.push((value.clone(), *k));
                }
            }
        }

        for (value, k) in resolved {
            debug!(block = %id, target = k, "indirect jump resolved to {:#x}", k);

            let bb = proc.block_mut(id)?;

            for ct in bb.outgoing_mut().iter_mut() {
                if ct.target == ControlTarget::Unresolved(value.clone()) {
                    ct.target =
                        ControlTarget::Unresolved(Value::constant(k, value.width()));
                }
            }

            dirty = true;
        }
    }

    Ok(dirty)
}

/// Entry addresses of every `Call` whose target operand is a constant.
fn call_targets(proc: &Procedure) -> BTreeSet<Addr> {
    let mut callees = BTreeSet::new();

    for &b in &proc.rev_postorder() {
        if let Ok(bb) = proc.block(b) {
            for instr in bb.instructions() {
                if instr.opcode == Opcode::Call {
                    if let Some(c) = instr.operands.first().and_then(Value::as_constant) {
                        callees.insert(c.value);
                    }
                }
            }
        }
    }

    callees
}
