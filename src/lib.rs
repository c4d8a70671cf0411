//! Recursive disassembly and IR-level static analysis.
//!
//! The pipeline turns raw machine-code bytes into an analyzable control-flow
//! graph: a pattern-directed decoder ([`disassembler`]) produces mnemonics
//! and their IL lowering ([`il`], [`codegen`]), the procedure driver
//! ([`procedure`]) grafts them onto a CFG of basic blocks ([`basic_block`]),
//! splitting blocks as new control transfers are discovered, and the
//! dataflow stack ([`dataflow`], [`absinterp`]) computes dominance,
//! liveness, SSA form and lattice-valued facts. The flow-graph driver
//! ([`flowgraph`]) loops decode and analysis until constant propagation
//! stops resolving indirect jumps, then follows `call` targets into new
//! procedures.
//!
//! The core is single-threaded: every pass mutates one procedure in place
//! and runs to completion. Distinct procedures may be analyzed on separate
//! threads as long as insertion into the shared flow graph is serialized.

pub mod absinterp;
pub mod architecture;
pub mod area;
pub mod basic_block;
pub mod codegen;
pub mod dataflow;
pub mod disassembler;
pub mod error;
pub mod flowgraph;
pub mod guard;
pub mod il;
pub mod mnemonic;
pub mod procedure;

pub mod prelude {
    //! Convenience re-exports of the whole pipeline surface.

    pub use crate::absinterp::{
        approximate, Cprop, CpropLattice, CpropValue, Domain, Taint, TaintLattice,
    };
    pub use crate::architecture::{Architecture, Token};
    pub use crate::area::Area;
    pub use crate::basic_block::{BasicBlock, BlockId, ControlTarget, ControlTransfer};
    pub use crate::codegen::CodeGenerator;
    pub use crate::dataflow::{dominance_tree, liveness, ssa, strip_ssa, Dominance, Liveness};
    pub use crate::disassembler::{Disassembler, Matcher, SemState, TokenExpr};
    pub use crate::error::Error;
    pub use crate::flowgraph::{disassemble, AnalyzedProcedure, FlowGraph};
    pub use crate::guard::{Guard, RelCode, Relation};
    pub use crate::il::{Addr, BitWidth, Constant, Instr, Name, Opcode, Value, Variable};
    pub use crate::mnemonic::Mnemonic;
    pub use crate::procedure::Procedure;
}
