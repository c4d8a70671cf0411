//! The extension algorithm: block creation, in-place growth, splits and
//! merges driven by decoded control flow.

mod common;

use common::{blocks_by_address, check_invariants, image, Mockup, TestArch, WideArch};
use panopticon::prelude::*;

fn disassemble(mockup: &Mockup, data: &[u8], seeds: &[Addr]) -> Procedure {
    Procedure::disassemble(None, mockup, &TestArch::default(), data, seeds)
        .unwrap()
        .unwrap()
}

#[test]
fn a_single_mnemonic_is_a_one_vertex_cfg() {
    let mockup = Mockup::new().with(0, 0, &[(1, "test")], &[]);
    let proc = disassemble(&mockup, &[0], &[0]);

    check_invariants(&proc);
    assert_eq!(proc.rev_postorder().len(), 1);

    let bb = proc.block(proc.entry().unwrap()).unwrap();

    assert_eq!(bb.mnemonics().len(), 1);
    assert_eq!(bb.mnemonics()[0].opcode, "test");
    assert_eq!(bb.mnemonics()[0].area, Area::new(0, 1));
    assert_eq!(bb.area(), Area::new(0, 1));
    assert!(bb.incoming().is_empty());
    assert!(bb.outgoing().is_empty());
    assert!(!proc.name.is_empty());
}

#[test]
fn fall_through_extends_the_block_in_place() {
    let mut mockup = Mockup::new();

    for t in 0u8..6 {
        mockup = mockup.with(t, t as Addr, &[(1, &format!("test{}", t))], &[t as Addr + 1]);
    }

    let proc = disassemble(&mockup, &[0, 1, 2, 3, 4, 5], &[0]);

    check_invariants(&proc);
    assert_eq!(proc.rev_postorder().len(), 1);

    let bb = proc.block(proc.entry().unwrap()).unwrap();

    assert_eq!(bb.mnemonics().len(), 6);

    for (i, m) in bb.mnemonics().iter().enumerate() {
        assert_eq!(m.opcode, format!("test{}", i));
        assert_eq!(m.area, Area::new(i as Addr, i as Addr + 1));
    }

    assert_eq!(bb.area(), Area::new(0, 6));
    assert!(bb.incoming().is_empty());
    // The final fall-through points past the image and stays unresolved.
    assert_eq!(bb.outgoing().len(), 1);
    assert_eq!(bb.outgoing()[0].target.constant(), Some(6));
}

#[test]
fn a_branch_ends_its_block() {
    let mockup = Mockup::new()
        .with(0, 0, &[(1, "test0")], &[1, 2])
        .with(1, 1, &[(1, "test1")], &[3])
        .with(2, 2, &[(1, "test2")], &[1]);
    let proc = disassemble(&mockup, &[0, 1, 2], &[0]);

    check_invariants(&proc);
    assert_eq!(proc.rev_postorder().len(), 3);

    let at = blocks_by_address(&proc);
    let b0 = proc.block(at[&0]).unwrap();
    let b1 = proc.block(at[&1]).unwrap();
    let b2 = proc.block(at[&2]).unwrap();

    assert_eq!(b0.mnemonics().len(), 1);
    assert!(b0.incoming().is_empty());
    assert_eq!(b0.outgoing().len(), 2);

    assert_eq!(b1.mnemonics().len(), 1);
    assert_eq!(b1.incoming().len(), 2);
    assert_eq!(b1.outgoing().len(), 1);
    // Address 3 is past the image.
    assert_eq!(b1.outgoing()[0].target.constant(), Some(3));

    assert_eq!(b2.mnemonics().len(), 1);
    assert_eq!(b2.incoming().len(), 1);
    assert_eq!(b2.outgoing().len(), 1);
    assert_eq!(b2.outgoing()[0].target.block(), Some(at[&1]));
}

#[test]
fn a_self_loop_has_one_block_with_a_back_edge() {
    let mockup = Mockup::new()
        .with(0, 0, &[(1, "test0")], &[1])
        .with(1, 1, &[(1, "test1")], &[2])
        .with(2, 2, &[(1, "test2")], &[0]);
    let proc = disassemble(&mockup, &[0, 1, 2], &[0]);

    check_invariants(&proc);
    assert_eq!(proc.rev_postorder().len(), 1);

    let bb = proc.block(proc.entry().unwrap()).unwrap();

    assert_eq!(bb.mnemonics().len(), 3);
    assert_eq!(bb.incoming().len(), 1);
    assert_eq!(bb.outgoing().len(), 1);
    assert_eq!(bb.outgoing()[0].target.block(), proc.entry());
    assert_eq!(bb.incoming()[0].target.block(), proc.entry());
}

#[test]
fn an_empty_image_yields_no_procedure() {
    let mockup = Mockup::new();

    assert_eq!(
        Procedure::disassemble(None, &mockup, &TestArch::default(), &[], &[0]).unwrap(),
        None
    );
}

#[test]
fn a_jump_into_a_block_splits_it_and_reseats_the_entry() {
    // Pre-existing procedure: one block of two mnemonics, falling through to
    // the not-yet-decoded address 2.
    let mut proc = Procedure::new("");
    let bb = BasicBlock::with_mnemonics(vec![
        Mnemonic::new(Area::new(0, 1), "test0", vec![]),
        Mnemonic::new(Area::new(1, 2), "test1", vec![]),
    ])
    .unwrap();
    let b0 = proc.add_block(bb);

    proc.unconditional_jump(b0, ControlTarget::Unresolved(Value::constant(2, 8)))
        .unwrap();
    proc.set_entry(Some(b0));

    let mockup = Mockup::new()
        .with(0, 0, &[(1, "test0")], &[1])
        .with(1, 1, &[(1, "test1")], &[2])
        .with(2, 2, &[(1, "test2")], &[1]);
    let proc = Procedure::disassemble(Some(proc), &mockup, &TestArch::default(), &[0, 1, 2], &[2])
        .unwrap()
        .unwrap();

    check_invariants(&proc);
    assert_eq!(proc.rev_postorder().len(), 2);

    let at = blocks_by_address(&proc);
    let head = proc.block(at[&0]).unwrap();
    let tail = proc.block(at[&1]).unwrap();

    assert_eq!(proc.entry(), Some(at[&0]));
    assert_eq!(head.mnemonics().len(), 1);
    assert_eq!(head.mnemonics()[0].opcode, "test0");
    assert_eq!(tail.mnemonics().len(), 2);
    assert_eq!(tail.mnemonics()[0].opcode, "test1");
    assert_eq!(tail.mnemonics()[1].opcode, "test2");
    // test2 loops back to the start of the tail block.
    assert!(tail.successors().any(|s| s == at[&1]));
}

#[test]
fn resuming_upgrades_dangling_constant_edges() {
    let mut proc = Procedure::new("");
    let b0 = proc.add_block(
        BasicBlock::with_mnemonics(vec![
            Mnemonic::new(Area::new(0, 1), "test0", vec![]),
            Mnemonic::new(Area::new(1, 2), "test1", vec![]),
        ])
        .unwrap(),
    );
    let b1 = proc.add_block(
        BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(2, 3), "test2", vec![])]).unwrap(),
    );
    let b2 = proc.add_block(
        BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(6, 7), "test6", vec![])]).unwrap(),
    );

    proc.unconditional_jump(b0, ControlTarget::Resolved(b1)).unwrap();
    proc.unconditional_jump(b0, ControlTarget::Resolved(b2)).unwrap();
    proc.unconditional_jump(b2, ControlTarget::Unresolved(Value::constant(40, 8)))
        .unwrap();
    proc.set_entry(Some(b0));

    let mut data = vec![0xee_u8; 43];

    data[0] = 0;
    data[1] = 1;
    data[2] = 2;
    data[6] = 6;
    data[40] = 40;
    data[41] = 41;
    data[42] = 42;

    let mockup = Mockup::new()
        .with(0, 0, &[(1, "test0")], &[1])
        .with(1, 1, &[(1, "test1")], &[2, 6])
        .with(2, 2, &[(1, "test2")], &[])
        .with(6, 6, &[(1, "test6")], &[40])
        .with(40, 40, &[(1, "test40")], &[41])
        .with(41, 41, &[(1, "test41")], &[42])
        .with(42, 42, &[(1, "test42")], &[55, 0]);

    let proc = Procedure::disassemble(Some(proc), &mockup, &TestArch::default(), &data, &[40])
        .unwrap()
        .unwrap();

    check_invariants(&proc);
    assert_eq!(proc.rev_postorder().len(), 4);

    let at = blocks_by_address(&proc);
    let head = proc.block(at[&0]).unwrap();
    let ret = proc.block(at[&2]).unwrap();
    let stub = proc.block(at[&6]).unwrap();
    let tail = proc.block(at[&40]).unwrap();

    assert_eq!(proc.entry(), Some(at[&0]));
    assert_eq!(head.mnemonics().len(), 2);
    assert_eq!(head.incoming().len(), 1);
    assert_eq!(head.incoming()[0].target.block(), Some(at[&40]));
    assert_eq!(head.outgoing().len(), 2);

    assert_eq!(ret.incoming().len(), 1);
    assert!(ret.outgoing().is_empty());

    assert_eq!(stub.outgoing().len(), 1);
    assert_eq!(stub.outgoing()[0].target.block(), Some(at[&40]));

    assert_eq!(tail.mnemonics().len(), 3);
    assert_eq!(tail.incoming().len(), 1);
    assert_eq!(tail.outgoing().len(), 2);
    assert!(tail.successors().any(|s| s == at[&0]));
    assert!(tail
        .outgoing()
        .iter()
        .any(|ct| ct.target.constant() == Some(55)));
}

#[test]
fn splitting_then_merging_restores_the_block() {
    let build = || -> (Procedure, BlockId) {
        let mut proc = Procedure::new("p");
        let pred = proc.add_block(
            BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(10, 11), "pred", vec![])])
                .unwrap(),
        );
        let succ = proc.add_block(
            BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(20, 21), "succ", vec![])])
                .unwrap(),
        );
        let mid = proc.add_block(
            BasicBlock::with_mnemonics(vec![
                Mnemonic::new(Area::new(0, 1), "m0", vec![]),
                Mnemonic::new(Area::new(1, 2), "m1", vec![]),
                Mnemonic::new(Area::new(2, 3), "m2", vec![]),
            ])
            .unwrap(),
        );

        proc.unconditional_jump(pred, ControlTarget::Resolved(mid)).unwrap();
        proc.conditional_jump(
            mid,
            ControlTarget::Resolved(succ),
            Guard::new(Value::variable("z", 1), RelCode::Eq, 1u32),
        )
        .unwrap();
        proc.unconditional_jump(mid, ControlTarget::Unresolved(Value::constant(99, 8)))
            .unwrap();
        proc.set_entry(Some(pred));
        (proc, mid)
    };

    let (reference, _) = build();
    let (mut proc, mid) = build();

    let (up, down) = proc.split(mid, 1, false).unwrap();

    check_invariants(&proc);
    assert_eq!(proc.block(up).unwrap().mnemonics().len(), 1);
    assert_eq!(proc.block(down).unwrap().mnemonics().len(), 2);
    assert!(proc.block(mid).is_err());

    let merged = proc.merge(up, down).unwrap();

    check_invariants(&proc);

    let original = reference
        .blocks()
        .find(|(_, bb)| bb.area().begin == 0)
        .map(|(_, bb)| bb)
        .unwrap();
    let rebuilt = proc.block(merged).unwrap();

    assert_eq!(rebuilt.mnemonics(), original.mnemonics());
    assert_eq!(rebuilt.area(), original.area());

    // Same edge shape: one incoming from the predecessor, one guarded edge
    // to the successor, one dangling constant.
    assert_eq!(rebuilt.incoming().len(), 1);
    assert_eq!(rebuilt.outgoing().len(), 2);
    assert!(rebuilt
        .outgoing()
        .iter()
        .any(|ct| ct.target.constant() == Some(99)));
    assert!(rebuilt
        .outgoing()
        .iter()
        .any(|ct| !ct.guard.is_always() && ct.target.block().is_some()));
}

#[test]
fn splitting_a_self_loop_reroutes_the_back_edge() {
    let mut proc = Procedure::new("p");
    let l = proc.add_block(
        BasicBlock::with_mnemonics(vec![
            Mnemonic::new(Area::new(0, 1), "m0", vec![]),
            Mnemonic::new(Area::new(1, 2), "m1", vec![]),
        ])
        .unwrap(),
    );

    proc.unconditional_jump(l, ControlTarget::Resolved(l)).unwrap();
    proc.set_entry(Some(l));

    let (up, down) = proc.split(l, 1, false).unwrap();

    check_invariants(&proc);
    assert_eq!(proc.entry(), Some(up));
    assert_eq!(proc.block(up).unwrap().mnemonics().len(), 1);
    assert_eq!(proc.block(down).unwrap().mnemonics().len(), 1);

    // The loop now runs up -> down -> up.
    assert!(proc.block(up).unwrap().successors().any(|s| s == down));
    assert!(proc.block(down).unwrap().successors().any(|s| s == up));
    assert_eq!(proc.rev_postorder().len(), 2);
}

#[test]
fn merge_refuses_unsafe_fusions() {
    let mut proc = Procedure::new("p");
    let a = proc.add_block(
        BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(0, 1), "a", vec![])]).unwrap(),
    );
    let b = proc.add_block(
        BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(5, 6), "b", vec![])]).unwrap(),
    );

    proc.unconditional_jump(a, ControlTarget::Resolved(b)).unwrap();

    // Not adjacent.
    assert!(matches!(proc.merge(a, b), Err(Error::Invariant(_))));

    let mut proc = Procedure::new("p");
    let a = proc.add_block(
        BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(0, 1), "a", vec![])]).unwrap(),
    );
    let b = proc.add_block(
        BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(1, 2), "b", vec![])]).unwrap(),
    );
    let c = proc.add_block(
        BasicBlock::with_mnemonics(vec![Mnemonic::new(Area::new(9, 10), "c", vec![])]).unwrap(),
    );

    proc.unconditional_jump(a, ControlTarget::Resolved(b)).unwrap();
    proc.unconditional_jump(c, ControlTarget::Resolved(b)).unwrap();

    // Two predecessors.
    assert!(matches!(proc.merge(a, b), Err(Error::Invariant(_))));
}

#[test]
fn wide_tokens_split_on_the_branch() {
    let mut dec: Disassembler<WideArch> = Disassembler::new();

    dec.rule(0x1122u64, |st: &mut SemState<WideArch>| {
        st.opaque_mnemonic(2, "A", vec![]);
        st.jump(Value::constant(st.address + 2, 16));
        Ok(())
    })
    .unwrap();

    dec.rule(0x3344u64, |st: &mut SemState<WideArch>| {
        st.opaque_mnemonic(2, "B", vec![]);
        st.jump(Value::constant(st.address + 2, 16));
        st.jump(Value::constant(st.address + 4, 16));
        Ok(())
    })
    .unwrap();

    dec.rule(0x5544u64, |st: &mut SemState<WideArch>| {
        st.opaque_mnemonic(2, "C", vec![]);
        Ok(())
    })
    .unwrap();

    let data = image(&[0x1122, 0x3344, 0x5544, 0x5544]);
    let proc = Procedure::disassemble(None, &dec, &WideArch::default(), &data, &[0])
        .unwrap()
        .unwrap();

    check_invariants(&proc);

    let at = blocks_by_address(&proc);

    assert_eq!(proc.blocks().count(), 3);
    assert_eq!(proc.block(at[&0]).unwrap().area(), Area::new(0, 4));
    assert_eq!(proc.block(at[&0]).unwrap().mnemonics().len(), 2);
    assert_eq!(proc.block(at[&4]).unwrap().area(), Area::new(4, 6));
    assert_eq!(proc.block(at[&6]).unwrap().area(), Area::new(6, 8));
    assert_eq!(proc.block(at[&0]).unwrap().outgoing().len(), 2);
}
