//! Test architectures and decoders shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use panopticon::prelude::*;

/// An 8-bit-token architecture with four 8-bit registers.
#[derive(Clone, Default)]
pub struct TestArch {
    temps: Arc<AtomicUsize>,
}

impl Architecture for TestArch {
    type Token = u8;
    type State = ();

    fn is_register(&self, name: &str) -> bool {
        matches!(name, "a" | "b" | "c" | "d")
    }

    fn register_width(&self, name: &str) -> Option<BitWidth> {
        self.is_register(name).then_some(8)
    }

    fn temporary(&self) -> Name {
        Name::new(format!("t{}", self.temps.fetch_add(1, Ordering::Relaxed)))
    }
}

/// A 16-bit-token architecture with eight 16-bit registers.
#[derive(Clone, Default)]
pub struct WideArch {
    temps: Arc<AtomicUsize>,
}

impl Architecture for WideArch {
    type Token = u16;
    type State = ();

    fn is_register(&self, name: &str) -> bool {
        matches!(name, "r0" | "r1" | "r2" | "r3" | "r4" | "r5" | "r6" | "r7")
    }

    fn register_width(&self, name: &str) -> Option<BitWidth> {
        self.is_register(name).then_some(16)
    }

    fn temporary(&self) -> Name {
        Name::new(format!("t{}", self.temps.fetch_add(1, Ordering::Relaxed)))
    }
}

/// Serializes 16-bit tokens into a little-endian byte image.
pub fn image(tokens: &[u16]) -> Vec<u8> {
    tokens.iter().flat_map(|t| t.to_le_bytes()).collect()
}

/// The three-instruction wide decoder: `0x0001` loads 1 into `r0` and falls
/// through, `0xC003` jumps three tokens ahead, `0x9508` returns (its
/// successor is undefined). Anything else decodes as `unk` and falls
/// through.
pub fn wide_decoder() -> Disassembler<WideArch> {
    let mut dec = Disassembler::new();

    dec.rule(0x0001u64, |st: &mut SemState<WideArch>| {
        st.mnemonic(
            2,
            "mov",
            vec![Value::variable("r0", 16), Value::constant(1, 16)],
            |cg| {
                cg.assign("r0", 1u32)?;
                Ok(())
            },
        )?;
        st.jump(Value::constant(st.address + 2, 16));
        Ok(())
    })
    .unwrap();

    dec.rule(0xC003u64, |st: &mut SemState<WideArch>| {
        let target = st.address + 6;

        st.opaque_mnemonic(2, "jmp", vec![Value::constant(target, 16)]);
        st.jump(Value::constant(target, 16));
        Ok(())
    })
    .unwrap();

    dec.rule(0x9508u64, |st: &mut SemState<WideArch>| {
        st.opaque_mnemonic(2, "ret", vec![]);
        st.jump(Value::undefined(16));
        Ok(())
    })
    .unwrap();

    dec.default_rule(|st: &mut SemState<WideArch>| {
        st.opaque_mnemonic(2, "unk", vec![]);
        st.jump(Value::constant(st.address + 2, 16));
        Ok(())
    });

    dec
}

/// A table-driven stand-in for a real decoder: one canned semantic state per
/// token value.
pub struct Mockup {
    states: HashMap<u8, SemState<TestArch>>,
}

impl Mockup {
    pub fn new() -> Self {
        Mockup {
            states: HashMap::new(),
        }
    }

    /// Cans the decode result for token `token` at address `addr`: mnemonics
    /// of the given byte lengths and jumps to the given targets.
    pub fn with(
        mut self,
        token: u8,
        addr: Addr,
        mnemonics: &[(usize, &str)],
        jumps: &[Addr],
    ) -> Self {
        let mut st = SemState::new(addr, TestArch::default());

        for &(len, opcode) in mnemonics {
            st.opaque_mnemonic(len, opcode, vec![]);
        }

        for &target in jumps {
            st.jump(Value::constant(target, 8));
        }

        self.states.insert(token, st);
        self
    }
}

impl Matcher<TestArch> for Mockup {
    fn try_match(
        &self,
        data: &[u8],
        addr: Addr,
        state: &SemState<TestArch>,
    ) -> Option<(Addr, SemState<TestArch>)> {
        let token = *data.get(addr as usize)?;
        let canned = self.states.get(&token)?;
        let mut out = state.clone();

        out.mnemonics = canned.mnemonics.clone();
        out.jumps = canned.jumps.clone();

        let len: usize = out.mnemonics.iter().map(|m| m.area.size()).sum();

        Some((addr + len as Addr, out))
    }
}

/// Checks the structural CFG invariants: pairwise-disjoint block ranges,
/// contiguous mnemonics inside every block, and edge-set consistency
/// between incoming and outgoing lists.
pub fn check_invariants(proc: &Procedure) {
    let blocks: Vec<(BlockId, &BasicBlock)> = proc.blocks().collect();

    for (i, (_, a)) in blocks.iter().enumerate() {
        for (_, b) in blocks.iter().skip(i + 1) {
            assert!(
                !a.area().overlaps(&b.area()),
                "blocks {} and {} overlap",
                a.area(),
                b.area()
            );
        }
    }

    for (id, bb) in &blocks {
        for pair in bb.mnemonics().windows(2) {
            assert_eq!(
                pair[0].area.end, pair[1].area.begin,
                "mnemonics of {} are not contiguous",
                id
            );
        }

        for ct in bb.outgoing() {
            if let Some(t) = ct.target.block() {
                let back = proc.block(t).unwrap();

                assert!(
                    back.predecessors().any(|p| p == *id),
                    "{} -> {} has no incoming counterpart",
                    id,
                    t
                );
            }
        }

        for ct in bb.incoming() {
            if let Some(p) = ct.target.block() {
                let fwd = proc.block(p).unwrap();

                assert!(
                    fwd.successors().any(|s| s == *id),
                    "{} <- {} has no outgoing counterpart",
                    id,
                    p
                );
            }
        }
    }
}

/// The blocks of a procedure keyed by their begin address.
pub fn blocks_by_address(proc: &Procedure) -> HashMap<Addr, BlockId> {
    proc.blocks()
        .map(|(id, bb)| (bb.area().begin, id))
        .collect()
}
