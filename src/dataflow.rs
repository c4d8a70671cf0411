//! Whole-procedure dataflow: dominance, liveness and SSA construction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::basic_block::{BlockId, ControlTarget, ControlTransfer};
use crate::error::Error;
use crate::guard::Guard;
use crate::il::{BitWidth, Instr, Name, Value, Variable};
use crate::procedure::Procedure;

/// Immediate dominators, dominator-tree children and dominance frontiers of
/// one procedure, over the blocks reachable from its entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dominance {
    /// The reverse-postorder the computation ran on.
    pub rpo: Vec<BlockId>,
    idom: BTreeMap<BlockId, BlockId>,
    children: BTreeMap<BlockId, Vec<BlockId>>,
    frontiers: BTreeMap<BlockId, BTreeSet<BlockId>>,
}

impl Dominance {
    /// The immediate dominator of `b`; the entry has none.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.idom.get(&b).copied()
    }

    /// The blocks immediately dominated by `b`, ordered by begin address.
    pub fn children(&self, b: BlockId) -> &[BlockId] {
        self.children.get(&b).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The dominance frontier of `b`.
    pub fn frontier(&self, b: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.frontiers.get(&b).into_iter().flatten().copied()
    }

    /// Whether `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cursor = Some(b);

        while let Some(c) = cursor {
            if c == a {
                return true;
            }

            cursor = self.idom(c);
        }

        false
    }
}

/// Iterative immediate-dominator computation over the reverse-postorder,
/// followed by dominance-frontier construction for the join blocks.
pub fn dominance_tree(proc: &Procedure) -> Result<Dominance, Error> {
    let rpo = proc.rev_postorder();

    if rpo.is_empty() {
        return Ok(Dominance::default());
    }

    let index: HashMap<BlockId, usize> = rpo.iter().enumerate().map(|(i, b)| (*b, i)).collect();
    let entry = rpo[0];
    let mut idom: HashMap<BlockId, BlockId> = HashMap::new();

    idom.insert(entry, entry);

    let intersect = |idom: &HashMap<BlockId, BlockId>, a: BlockId, b: BlockId| -> BlockId {
        let mut f1 = a;
        let mut f2 = b;

        while f1 != f2 {
            while index[&f1] > index[&f2] {
                f1 = idom[&f1];
            }

            while index[&f2] > index[&f1] {
                f2 = idom[&f2];
            }
        }

        f1
    };

    let mut changed = true;

    while changed {
        changed = false;

        for &b in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;

            for p in proc.block(b)?.predecessors() {
                if !index.contains_key(&p) || !idom.contains_key(&p) {
                    continue;
                }

                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, p, cur),
                });
            }

            let new_idom = new_idom
                .ok_or_else(|| Error::invariant(format!("{} has no processed predecessor", b)))?;

            if idom.get(&b) != Some(&new_idom) {
                idom.insert(b, new_idom);
                changed = true;
            }
        }
    }

    // The entry's self-dominance was only seeded for the intersection walk.
    idom.remove(&entry);

    let mut children: BTreeMap<BlockId, Vec<BlockId>> = BTreeMap::new();

    for (&b, &d) in idom.iter() {
        children.entry(d).or_default().push(b);
    }

    for kids in children.values_mut() {
        kids.sort_by_key(|b| proc.block(*b).map(|bb| bb.area().begin).unwrap_or(u32::MAX));
    }

    let mut frontiers: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();

    for &b in &rpo {
        let preds: Vec<BlockId> = proc
            .block(b)?
            .predecessors()
            .filter(|p| index.contains_key(p))
            .collect();

        if preds.len() < 2 {
            continue;
        }

        let stop = idom.get(&b).copied();

        for p in preds {
            let mut runner = Some(p);

            while let Some(r) = runner {
                if Some(r) == stop {
                    break;
                }

                frontiers.entry(r).or_default().insert(b);
                runner = idom.get(&r).copied();
            }
        }
    }

    Ok(Dominance {
        rpo,
        idom: idom.into_iter().collect(),
        children,
        frontiers,
    })
}

/// The liveness triple of one procedure, plus the name universe it was
/// computed over.
///
/// Liveness is a pre-SSA analysis: names are collapsed to their base, so the
/// result is meaningful on renamed procedures too.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Liveness {
    /// Every name used or defined outside φ instructions.
    pub names: BTreeSet<Name>,
    /// Blocks defining each name.
    pub usage: BTreeMap<Name, BTreeSet<BlockId>>,
    /// Names used before any local definition, per block.
    pub uevar: BTreeMap<BlockId, BTreeSet<Name>>,
    /// Names defined per block.
    pub varkill: BTreeMap<BlockId, BTreeSet<Name>>,
    /// Names live on exit, per block.
    pub liveout: BTreeMap<BlockId, BTreeSet<Name>>,
    widths: BTreeMap<Name, BitWidth>,
}

impl Liveness {
    /// The bit width a name was first seen with.
    pub fn width_of(&self, name: &Name) -> Option<BitWidth> {
        self.widths.get(name).copied()
    }
}

/// Computes UEVar and VarKill per block, then iterates the LiveOut equation
/// over the reverse-postorder until it stabilizes.
pub fn liveness(proc: &Procedure) -> Liveness {
    let mut live = Liveness::default();

    for (id, bb) in proc.blocks() {
        let uevar = live.uevar.entry(id).or_default();
        let varkill = live.varkill.entry(id).or_default();

        for m in bb.mnemonics() {
            for instr in &m.instructions {
                for v in instr.variable_operands() {
                    let name = v.name.unsubscripted();

                    live.widths.entry(name.clone()).or_insert(v.width);

                    if !varkill.contains(&name) {
                        uevar.insert(name.clone());
                    }

                    live.names.insert(name);
                }

                let defined = instr.assignee.name.unsubscripted();

                live.widths
                    .entry(defined.clone())
                    .or_insert(instr.assignee.width);
                varkill.insert(defined.clone());
                live.usage.entry(defined.clone()).or_default().insert(id);
                live.names.insert(defined);
            }
        }
    }

    let rpo = proc.rev_postorder();
    let mut changed = true;

    while changed {
        changed = false;

        for &b in &rpo {
            let mut out: BTreeSet<Name> = BTreeSet::new();

            if let Ok(bb) = proc.block(b) {
                for s in bb.successors() {
                    let uevar = live.uevar.get(&s).cloned().unwrap_or_default();
                    let varkill = live.varkill.get(&s).cloned().unwrap_or_default();
                    let liveout = live.liveout.get(&s).cloned().unwrap_or_default();

                    out.extend(uevar);
                    out.extend(
                        liveout
                            .into_iter()
                            .filter(|n| live.names.contains(n) && !varkill.contains(n)),
                    );
                }
            }

            if live.liveout.get(&b) != Some(&out) {
                live.liveout.insert(b, out);
                changed = true;
            }
        }
    }

    live
}

/// Resets a procedure to its pre-SSA shape: φ instructions are removed and
/// every subscript (in instructions, guards and unresolved edge targets)
/// goes back to −1.
pub fn strip_ssa(proc: &mut Procedure) {
    let ids: Vec<BlockId> = proc.blocks().map(|(id, _)| id).collect();

    for id in ids {
        let bb = match proc.block_mut(id) {
            Ok(bb) => bb,
            Err(_) => continue,
        };

        bb.phis_mut().clear();

        for instr in bb.instructions_mut() {
            instr.assignee.name.subscript = -1;

            for op in instr.operands.iter_mut() {
                if let Value::Variable(v) = op {
                    v.name.subscript = -1;
                }
            }
        }

        for ct in bb.outgoing_mut().iter_mut() {
            strip_transfer(ct);
        }

        for ct in bb.incoming_mut().iter_mut() {
            strip_transfer(ct);
        }
    }
}

fn strip_transfer(ct: &mut ControlTransfer) {
    for rel in ct.guard.relations.iter_mut() {
        for side in [&mut rel.left, &mut rel.right] {
            if let Value::Variable(v) = side {
                v.name.subscript = -1;
            }
        }
    }

    if let ControlTarget::Unresolved(Value::Variable(v)) = &mut ct.target {
        v.name.subscript = -1;
    }
}

/// Converts a procedure into semi-pruned SSA form.
///
/// Any previous SSA state is stripped first, which makes the conversion
/// idempotent: running it again reproduces the same φs and subscripts.
/// φ placement walks the dominance frontiers of each global name's defining
/// blocks; renaming walks the dominator tree with one version stack per
/// base name, rewriting instruction operands and destinations, edge guards,
/// unresolved variable edge targets, and the φ operand slots of successor
/// blocks (one slot per predecessor).
pub fn ssa(proc: &mut Procedure, dom: &Dominance, live: &Liveness) -> Result<(), Error> {
    strip_ssa(proc);

    // Semi-pruned placement: only names that are upward-exposed somewhere
    // get φs.
    let globals: BTreeSet<Name> = live.uevar.values().flatten().cloned().collect();
    let reachable: BTreeSet<BlockId> = dom.rpo.iter().copied().collect();

    for name in &globals {
        let mut worklist: BTreeSet<BlockId> = live
            .usage
            .get(name)
            .map(|blocks| blocks.intersection(&reachable).copied().collect())
            .unwrap_or_default();

        while let Some(&b) = worklist.iter().next() {
            worklist.remove(&b);

            let frontier: Vec<BlockId> = dom.frontier(b).collect();

            for df in frontier {
                let bb = proc.block_mut(df)?;
                let present = bb
                    .phis()
                    .iter()
                    .any(|phi| phi.assignee.name.base == name.base);

                if !present {
                    let width = live.width_of(name).unwrap_or(1);

                    bb.phis_mut().push(Instr::phi(Variable {
                        name: name.clone(),
                        width,
                    }));
                    worklist.insert(df);
                }
            }
        }
    }

    // Renaming.
    let mut counters: BTreeMap<String, i32> = BTreeMap::new();
    let mut stacks: BTreeMap<String, Vec<i32>> = BTreeMap::new();

    if let Some(&entry) = dom.rpo.first() {
        rename(proc, dom, entry, &mut counters, &mut stacks)?;
    }

    Ok(())
}

fn top(stacks: &BTreeMap<String, Vec<i32>>, base: &str) -> i32 {
    stacks.get(base).and_then(|s| s.last()).copied().unwrap_or(0)
}

fn fresh(
    counters: &mut BTreeMap<String, i32>,
    stacks: &mut BTreeMap<String, Vec<i32>>,
    base: &str,
) -> i32 {
    let counter = counters.entry(base.to_string()).or_insert(1);
    let version = *counter;

    *counter += 1;
    stacks.entry(base.to_string()).or_default().push(version);
    version
}

fn rename(
    proc: &mut Procedure,
    dom: &Dominance,
    block: BlockId,
    counters: &mut BTreeMap<String, i32>,
    stacks: &mut BTreeMap<String, Vec<i32>>,
) -> Result<(), Error> {
    let mut pushed: Vec<String> = Vec::new();

    {
        let bb = proc.block_mut(block)?;

        // φ destinations define like ordinary instructions; their operands
        // are filled from the predecessors below.
        for phi in bb.phis_mut() {
            let base = phi.assignee.name.base.clone();

            phi.assignee.name.subscript = fresh(counters, stacks, &base);
            pushed.push(base);
        }
    }

    {
        let bb = proc.block_mut(block)?;

        for m in bb.mnemonics_mut() {
            for instr in m.instructions.iter_mut() {
                for op in instr.operands.iter_mut() {
                    if let Value::Variable(v) = op {
                        v.name.subscript = top(stacks, &v.name.base);
                    }
                }

                let base = instr.assignee.name.base.clone();

                instr.assignee.name.subscript = fresh(counters, stacks, &base);
                pushed.push(base);
            }
        }
    }

    // Guards and unresolved targets on outgoing edges read the current
    // versions; the matching incoming entries mirror the same guard.
    let renamed_edges: Vec<(ControlTarget, Guard)> = {
        let bb = proc.block_mut(block)?;
        let mut mirrored = Vec::new();

        for ct in bb.outgoing_mut().iter_mut() {
            for rel in ct.guard.relations.iter_mut() {
                for side in [&mut rel.left, &mut rel.right] {
                    if let Value::Variable(v) = side {
                        v.name.subscript = top(stacks, &v.name.base);
                    }
                }
            }

            if let ControlTarget::Unresolved(Value::Variable(v)) = &mut ct.target {
                if v.name.subscript < 0 {
                    v.name.subscript = top(stacks, &v.name.base);
                }
            }

            mirrored.push((ct.target.clone(), ct.guard.clone()));
        }

        mirrored
    };

    for (target, guard) in &renamed_edges {
        if let ControlTarget::Resolved(t) = target {
            let tb = proc.block_mut(*t)?;

            for ct in tb.incoming_mut().iter_mut() {
                if ct.target == ControlTarget::Resolved(block) {
                    ct.guard = guard.clone();
                }
            }
        }
    }

    // Fill the next free φ operand slot of every successor.
    let successors: Vec<BlockId> = renamed_edges
        .iter()
        .filter_map(|(t, _)| t.block())
        .collect();

    for s in successors {
        let sb = proc.block_mut(s)?;

        for phi in sb.phis_mut() {
            let base = phi.assignee.name.base.clone();
            let width = phi.assignee.width;
            let version = top(stacks, &base);

            phi.operands
                .push(Value::variable(Name::subscripted(base, version), width));
        }
    }

    for &child in dom.children(block) {
        rename(proc, dom, child, counters, stacks)?;
    }

    for base in pushed.into_iter().rev() {
        if let Some(stack) = stacks.get_mut(&base) {
            stack.pop();
        }
    }

    Ok(())
}
