/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Region-based ownership and isolation checking over an SSA IR.
//!
//! The checker partitions every non-Sendable value of a function into
//! *regions* (sets of values that may alias or reach each other) and
//! verifies, with a forward fixed-point dataflow analysis, that no
//! region is used from one isolation domain after it has been
//! transferred to another, and that move-only values are consumed at
//! most once. See `checker` for the driver and `partition` for the
//! region tracker.

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

use alloc::string::String;
use alloc::vec::Vec;

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FxHashSet<V> = hashbrown::HashSet<V, rustc_hash::FxBuildHasher>;

macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

#[macro_use]
mod index;
pub use index::{Block, Inst, RegionId, Type, Value};

pub(crate) mod cfg;
pub(crate) mod domtree;
pub(crate) mod liveness;
pub(crate) mod postorder;
pub mod ssa;

pub mod checker;
pub mod classify;
pub mod diagnostics;
pub mod ir;
pub mod isolation;
pub mod partition;
pub mod testing;
pub mod types;

#[cfg(feature = "enable-serde")]
pub mod serialize;

#[cfg(feature = "fuzzing")]
pub mod fuzzing;

pub use checker::{Checker, CheckerOutput};
pub use diagnostics::{Diagnostic, DiagnosticKind, Severity};
pub use ir::{ArgumentConvention, Function, FunctionBuilder, InstKind, Operand, SourceLoc};
pub use isolation::IsolationDomain;
pub use types::{TypeData, TypeKind, TypeOracle, TypeTable};

/// How isolation findings are reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ConcurrencyMode {
    /// Isolation findings are warnings; findings that stem purely from a
    /// preconcurrency type crossing the boundary are squelched.
    #[default]
    Compat,
    /// Isolation findings are errors; preconcurrency findings are
    /// downgraded to warnings.
    Strict,
}

/// Options for checking.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckerOptions {
    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,

    /// Run the SSA validator before checking the function.
    pub validate_ssa: bool,

    /// Language mode that decides diagnostic severities.
    pub mode: ConcurrencyMode,
}

/// An error in the shape of the IR handed to the checker. These
/// indicate a construction bug upstream, never a problem in the checked
/// program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IrError {
    /// An opcode name that the IR does not know.
    UnknownOpcode(String),
    /// Invalid basic block: does not end in a terminator, or contains
    /// a terminator in the middle.
    BB(Block),
    /// Invalid branch: argument count does not match the parameters
    /// of the successor block.
    Branch(Inst),
    /// Invalid SSA for the given value at the given inst: use not
    /// dominated by its definition. `inst` may be `Inst::invalid()` if
    /// this concerns a block argument.
    SSA(Value, Inst),
    /// Wrong number of operands or results for the instruction kind.
    Operand(Inst),
    /// The entry block arguments do not match the function signature.
    EntryArgs,
}

impl core::fmt::Display for IrError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for IrError {}

/// A set of functions sharing one type table.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub types: TypeTable,
    pub functions: Vec<Function>,
}

/// Check a single function.
pub fn run<O: TypeOracle + ?Sized>(
    func: &Function,
    types: &O,
    options: &CheckerOptions,
) -> Result<CheckerOutput, IrError> {
    let checker = Checker::new(func, types, *options)?;
    Ok(checker.run())
}

/// Check every function of a module. Functions are independent, so
/// with the `parallel` feature they are sharded across threads. Results
/// are returned in function order.
pub fn check_module(
    module: &Module,
    options: &CheckerOptions,
) -> Vec<Result<CheckerOutput, IrError>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        module
            .functions
            .par_iter()
            .map(|func| run(func, &module.types, options))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        module
            .functions
            .iter()
            .map(|func| run(func, &module.types, options))
            .collect()
    }
}

pub(crate) trait VecExt<T> {
    /// Fills `self` with `value` up to `len` and return the slice to the
    /// values.
    fn repopulate(&mut self, len: usize, value: T) -> &mut [T]
    where
        T: Clone;
    /// Clears the `self` and returns a mutable reference to it.
    fn cleared(&mut self) -> &mut Self;
}

impl<T> VecExt<T> for Vec<T> {
    fn repopulate(&mut self, len: usize, value: T) -> &mut [T]
    where
        T: Clone,
    {
        self.clear();
        self.resize(len, value);
        self
    }

    fn cleared(&mut self) -> &mut Self {
        self.clear();
        self
    }
}
