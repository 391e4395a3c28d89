/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The IR consumed by the checker.
//!
//! A `Function` owns three arenas (blocks, instructions, values)
//! addressed by stable integer ids. Instructions of a block form a
//! doubly linked list so that they can be erased while a cursor is
//! walking over them. Predecessors are never stored: they are derived
//! on demand by scanning the terminators of all blocks.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use smallvec::SmallVec;

use crate::isolation::IsolationDomain;
use crate::{Block, Inst, IrError, Type, Value};

pub mod builder;
pub mod phi;

pub use builder::FunctionBuilder;
pub use phi::{classify_argument, ArgumentKind, Phi, TerminatorResult};

/// A position in the source program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLoc { line, column }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Ownership {
    Owned,
    Guaranteed,
    Unowned,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ValueCategory {
    /// A loadable value.
    Object,
    /// The address of some storage.
    Address,
}

/// Where a value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ValueDef {
    Result { inst: Inst, index: u32 },
    Argument { block: Block, index: u32 },
}

#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ValueData {
    pub ty: Type,
    pub category: ValueCategory,
    pub ownership: Ownership,
    pub def: ValueDef,
    /// Source-level binding name, for diagnostics.
    pub name: Option<String>,
}

/// A use of `value` as the `index`th operand of `user`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Operand {
    pub user: Inst,
    pub index: u32,
    pub value: Value,
}

/// How one formal parameter or result crosses a call boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ArgumentConvention {
    IndirectIn,
    IndirectInGuaranteed,
    IndirectInout,
    IndirectInoutAliasable,
    IndirectOut,
    DirectOwned,
    DirectUnowned,
    DirectGuaranteed,
    PackInout,
    PackOwned,
    PackGuaranteed,
    PackOut,
}

impl ArgumentConvention {
    /// The callee takes over responsibility for destroying the value.
    pub fn is_consuming(self) -> bool {
        matches!(
            self,
            Self::IndirectIn | Self::DirectOwned | Self::PackOwned
        )
    }

    /// The caller keeps the value alive across the call; the callee may
    /// neither destroy it nor alias it away.
    pub fn is_guaranteed(self) -> bool {
        matches!(
            self,
            Self::IndirectInGuaranteed | Self::DirectGuaranteed | Self::PackGuaranteed
        )
    }

    pub fn is_inout(self) -> bool {
        matches!(
            self,
            Self::IndirectInout | Self::IndirectInoutAliasable | Self::PackInout
        )
    }

    /// The callee initializes previously uninitialized storage.
    pub fn is_out(self) -> bool {
        matches!(self, Self::IndirectOut | Self::PackOut)
    }

    /// Passed by address.
    pub fn is_indirect(self) -> bool {
        !matches!(
            self,
            Self::DirectOwned | Self::DirectUnowned | Self::DirectGuaranteed
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::IndirectIn => "@in",
            Self::IndirectInGuaranteed => "@in_guaranteed",
            Self::IndirectInout => "@inout",
            Self::IndirectInoutAliasable => "@inout_aliasable",
            Self::IndirectOut => "@out",
            Self::DirectOwned => "@owned",
            Self::DirectUnowned => "@unowned",
            Self::DirectGuaranteed => "@guaranteed",
            Self::PackInout => "@pack_inout",
            Self::PackOwned => "@pack_owned",
            Self::PackGuaranteed => "@pack_guaranteed",
            Self::PackOut => "@pack_out",
        }
    }

    /// Ownership of the value an entry block receives for a parameter
    /// with this convention.
    pub(crate) fn entry_ownership(self) -> Ownership {
        match self {
            Self::DirectOwned => Ownership::Owned,
            Self::DirectGuaranteed => Ownership::Guaranteed,
            Self::DirectUnowned => Ownership::Unowned,
            _ => Ownership::None,
        }
    }
}

impl fmt::Display for ArgumentConvention {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArgumentConvention {
    type Err = IrError;

    fn from_str(s: &str) -> Result<Self, IrError> {
        const ALL: [ArgumentConvention; 12] = [
            ArgumentConvention::IndirectIn,
            ArgumentConvention::IndirectInGuaranteed,
            ArgumentConvention::IndirectInout,
            ArgumentConvention::IndirectInoutAliasable,
            ArgumentConvention::IndirectOut,
            ArgumentConvention::DirectOwned,
            ArgumentConvention::DirectUnowned,
            ArgumentConvention::DirectGuaranteed,
            ArgumentConvention::PackInout,
            ArgumentConvention::PackOwned,
            ArgumentConvention::PackGuaranteed,
            ArgumentConvention::PackOut,
        ];
        ALL.iter()
            .copied()
            .find(|c| c.name() == s || &c.name()[1..] == s)
            .ok_or_else(|| IrError::UnknownOpcode(String::from(s)))
    }
}

/// A function type signature: one convention per entry block argument.
#[derive(Clone, Debug, Default)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Signature {
    pub conventions: Vec<ArgumentConvention>,
    pub indirect_result_count: usize,
    /// The last parameter is the implicit receiver.
    pub has_self: bool,
    /// Per-slot `transferring` annotation.
    pub transferring: Vec<bool>,
}

/// Indexed view over the conventions of a signature. Slots
/// `0..first_parameter_index()` are indirect results, the remainder are
/// parameters; the receiver, if any, is always the last slot.
#[derive(Clone, Copy, Debug)]
pub struct ArgumentConventions<'a> {
    sig: &'a Signature,
}

impl<'a> ArgumentConventions<'a> {
    pub fn end_index(&self) -> usize {
        self.sig.conventions.len()
    }

    pub fn first_parameter_index(&self) -> usize {
        self.sig.indirect_result_count
    }

    pub fn self_index(&self) -> Option<usize> {
        if self.sig.has_self {
            Some(self.end_index() - 1)
        } else {
            None
        }
    }

    pub fn is_transferring(&self, index: usize) -> bool {
        assert!(index < self.end_index(), "convention index out of range");
        self.sig.transferring.get(index).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = ArgumentConvention> + 'a {
        self.sig.conventions.iter().copied()
    }
}

impl<'a> core::ops::Index<usize> for ArgumentConventions<'a> {
    type Output = ArgumentConvention;

    fn index(&self, index: usize) -> &ArgumentConvention {
        assert!(index < self.end_index(), "convention index out of range");
        &self.sig.conventions[index]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum LoadKind {
    Copy,
    Take,
    Trivial,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum StoreKind {
    Init,
    Assign,
    Trivial,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum AccessKind {
    Read,
    Modify,
}

/// Static call information for `apply` and `try_apply`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ApplyData {
    pub callee: String,
    /// One convention per argument operand.
    pub conventions: SmallVec<[ArgumentConvention; 4]>,
    /// Per-argument `transferring` annotation.
    pub transferring: SmallVec<[bool; 4]>,
    /// Isolation of the callee if it is statically known to differ from
    /// the caller's; `None` means the callee runs in the caller's domain.
    pub callee_isolation: Option<IsolationDomain>,
    /// The direct result is marked `transferring`.
    pub result_transferring: bool,
}

impl ApplyData {
    pub fn new(callee: &str, conventions: &[ArgumentConvention]) -> Self {
        ApplyData {
            callee: String::from(callee),
            conventions: conventions.iter().copied().collect(),
            transferring: conventions.iter().map(|_| false).collect(),
            callee_isolation: None,
            result_transferring: false,
        }
    }

    pub fn isolated_to(mut self, domain: IsolationDomain) -> Self {
        self.callee_isolation = Some(domain);
        self
    }

    pub fn transferring_arg(mut self, index: usize) -> Self {
        self.transferring[index] = true;
        self
    }

    pub fn transferring_result(mut self) -> Self {
        self.result_transferring = true;
        self
    }

    pub fn is_transferring(&self, index: usize) -> bool {
        self.transferring.get(index).copied().unwrap_or(false)
    }
}

/// Static information for `partial_apply`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ClosureData {
    pub callee: String,
    /// One convention per captured operand.
    pub conventions: SmallVec<[ArgumentConvention; 4]>,
    /// The closure may outlive the current function.
    pub escaping: bool,
}

/// The closed set of instruction kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum InstKind {
    Literal,
    AllocStack,
    AllocRef,
    CopyValue,
    MoveValue,
    BeginBorrow,
    EndBorrow,
    DestroyValue,
    DestroyAddr,
    DeallocStack,
    Load(LoadKind),
    /// Operands: `[src, dest]`.
    Store(StoreKind),
    StructElementAddr { field: u32 },
    RefElementAddr { field: u32 },
    StructExtract { field: u32 },
    Struct,
    Tuple,
    BeginAccess(AccessKind),
    EndAccess,
    /// Operands: one per convention, indirect results first.
    Apply(Box<ApplyData>),
    /// Operands: the captured values.
    PartialApply(Box<ClosureData>),
    /// Explicitly hand the operand's region over to `to`.
    Transfer { to: IsolationDomain },
    Branch { dest: Block },
    /// Operands: `[cond, then_args.., else_args..]`.
    CondBranch {
        then_dest: Block,
        else_dest: Block,
        then_args: u32,
    },
    Return,
    Throw,
    Unreachable,
    /// Operands as for `Apply`; the direct result is the argument of
    /// `normal`, the error the argument of `error`.
    TryApply {
        apply: Box<ApplyData>,
        normal: Block,
        error: Block,
    },
}

impl InstKind {
    pub fn opcode(&self) -> Opcode {
        match self {
            InstKind::Literal => Opcode::Literal,
            InstKind::AllocStack => Opcode::AllocStack,
            InstKind::AllocRef => Opcode::AllocRef,
            InstKind::CopyValue => Opcode::CopyValue,
            InstKind::MoveValue => Opcode::MoveValue,
            InstKind::BeginBorrow => Opcode::BeginBorrow,
            InstKind::EndBorrow => Opcode::EndBorrow,
            InstKind::DestroyValue => Opcode::DestroyValue,
            InstKind::DestroyAddr => Opcode::DestroyAddr,
            InstKind::DeallocStack => Opcode::DeallocStack,
            InstKind::Load(_) => Opcode::Load,
            InstKind::Store(_) => Opcode::Store,
            InstKind::StructElementAddr { .. } => Opcode::StructElementAddr,
            InstKind::RefElementAddr { .. } => Opcode::RefElementAddr,
            InstKind::StructExtract { .. } => Opcode::StructExtract,
            InstKind::Struct => Opcode::Struct,
            InstKind::Tuple => Opcode::Tuple,
            InstKind::BeginAccess(_) => Opcode::BeginAccess,
            InstKind::EndAccess => Opcode::EndAccess,
            InstKind::Apply(_) => Opcode::Apply,
            InstKind::PartialApply(_) => Opcode::PartialApply,
            InstKind::Transfer { .. } => Opcode::Transfer,
            InstKind::Branch { .. } => Opcode::Branch,
            InstKind::CondBranch { .. } => Opcode::CondBranch,
            InstKind::Return => Opcode::Return,
            InstKind::Throw => Opcode::Throw,
            InstKind::Unreachable => Opcode::Unreachable,
            InstKind::TryApply { .. } => Opcode::TryApply,
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode().is_terminator()
    }

    /// Call information for either flavor of apply.
    pub fn apply_data(&self) -> Option<&ApplyData> {
        match self {
            InstKind::Apply(data) => Some(data),
            InstKind::TryApply { apply, .. } => Some(apply),
            _ => None,
        }
    }

    pub(crate) fn successors(&self) -> SmallVec<[Block; 2]> {
        match *self {
            InstKind::Branch { dest } => smallvec::smallvec![dest],
            InstKind::CondBranch {
                then_dest,
                else_dest,
                ..
            } => smallvec::smallvec![then_dest, else_dest],
            InstKind::TryApply { normal, error, .. } => smallvec::smallvec![normal, error],
            _ => SmallVec::new(),
        }
    }
}

macro_rules! opcodes {
    ($($variant:ident => $name:literal,)*) => {
        /// The kind tag of an instruction, without its payload.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }
        }

        impl FromStr for Opcode {
            type Err = IrError;

            fn from_str(s: &str) -> Result<Self, IrError> {
                match s {
                    $($name => Ok(Opcode::$variant),)*
                    _ => Err(IrError::UnknownOpcode(String::from(s))),
                }
            }
        }
    };
}

opcodes! {
    Literal => "literal",
    AllocStack => "alloc_stack",
    AllocRef => "alloc_ref",
    CopyValue => "copy_value",
    MoveValue => "move_value",
    BeginBorrow => "begin_borrow",
    EndBorrow => "end_borrow",
    DestroyValue => "destroy_value",
    DestroyAddr => "destroy_addr",
    DeallocStack => "dealloc_stack",
    Load => "load",
    Store => "store",
    StructElementAddr => "struct_element_addr",
    RefElementAddr => "ref_element_addr",
    StructExtract => "struct_extract",
    Struct => "struct",
    Tuple => "tuple",
    BeginAccess => "begin_access",
    EndAccess => "end_access",
    Apply => "apply",
    PartialApply => "partial_apply",
    Transfer => "transfer",
    Branch => "br",
    CondBranch => "cond_br",
    Return => "return",
    Throw => "throw",
    Unreachable => "unreachable",
    TryApply => "try_apply",
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Branch
                | Opcode::CondBranch
                | Opcode::Return
                | Opcode::Throw
                | Opcode::Unreachable
                | Opcode::TryApply
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct InstData {
    pub kind: InstKind,
    pub operands: SmallVec<[Value; 4]>,
    pub results: SmallVec<[Value; 1]>,
    pub loc: SourceLoc,
    pub block: Block,
    pub(crate) prev: Inst,
    pub(crate) next: Inst,
    pub(crate) deleted: bool,
}

#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BlockData {
    pub args: SmallVec<[Value; 4]>,
    pub(crate) first: Inst,
    pub(crate) last: Inst,
}

impl Default for BlockData {
    fn default() -> Self {
        BlockData {
            args: SmallVec::new(),
            first: Inst::invalid(),
            last: Inst::invalid(),
        }
    }
}

define_arena!(Blocks, Block, BlockData);
define_arena!(Insts, Inst, InstData);
define_arena!(Values, Value, ValueData);

/// A function body: blocks of instructions over SSA values. `Block(0)`
/// is the entry block; its arguments correspond one-to-one to the
/// signature's conventions.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Function {
    pub name: String,
    /// Ambient isolation of the body.
    pub isolation: IsolationDomain,
    pub signature: Signature,
    /// The body is a closure or `defer` that may be invoked more than
    /// once.
    pub may_run_multiple_times: bool,
    pub blocks: Blocks,
    pub insts: Insts,
    pub values: Values,
    /// Embedded `specify_test` strings for the test harness.
    pub test_specs: Vec<String>,
}

impl Function {
    #[inline(always)]
    pub fn entry_block(&self) -> Block {
        Block::new(0)
    }

    #[inline(always)]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline(always)]
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    #[inline(always)]
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    #[inline(always)]
    pub fn block_args(&self, block: Block) -> &[Value] {
        &self.blocks[block].args
    }

    #[inline(always)]
    pub fn inst_operands(&self, inst: Inst) -> &[Value] {
        &self.insts[inst].operands
    }

    #[inline(always)]
    pub fn inst_results(&self, inst: Inst) -> &[Value] {
        &self.insts[inst].results
    }

    #[inline(always)]
    pub fn inst_kind(&self, inst: Inst) -> &InstKind {
        &self.insts[inst].kind
    }

    #[inline(always)]
    pub fn inst_block(&self, inst: Inst) -> Block {
        self.insts[inst].block
    }

    #[inline(always)]
    pub fn is_deleted(&self, inst: Inst) -> bool {
        self.insts[inst].deleted
    }

    #[inline(always)]
    pub fn value_type(&self, value: Value) -> Type {
        self.values[value].ty
    }

    pub fn value_name(&self, value: Value) -> Option<&str> {
        self.values[value].name.as_deref()
    }

    /// The uses made by `inst`.
    pub fn operands(&self, inst: Inst) -> impl Iterator<Item = Operand> + '_ {
        self.insts[inst]
            .operands
            .iter()
            .enumerate()
            .map(move |(i, &value)| Operand {
                user: inst,
                index: i as u32,
                value,
            })
    }

    pub fn operand(&self, inst: Inst, index: usize) -> Operand {
        Operand {
            user: inst,
            index: index as u32,
            value: self.insts[inst].operands[index],
        }
    }

    /// The instruction defining `value`, if it is not a block argument.
    pub fn def_inst(&self, value: Value) -> Option<Inst> {
        match self.values[value].def {
            ValueDef::Result { inst, .. } => Some(inst),
            ValueDef::Argument { .. } => None,
        }
    }

    /// Is `value` an argument of the entry block?
    pub fn is_entry_arg(&self, value: Value) -> bool {
        matches!(
            self.values[value].def,
            ValueDef::Argument { block, .. } if block == self.entry_block()
        )
    }

    pub fn argument_conventions(&self) -> ArgumentConventions<'_> {
        ArgumentConventions {
            sig: &self.signature,
        }
    }

    /// Convention of an entry argument.
    pub fn entry_convention(&self, value: Value) -> Option<ArgumentConvention> {
        match self.values[value].def {
            ValueDef::Argument { block, index } if block == self.entry_block() => {
                self.signature.conventions.get(index as usize).copied()
            }
            _ => None,
        }
    }

    /// Forward traversal that tolerates erasure of the instruction it
    /// last returned.
    pub fn instructions(&self, block: Block) -> Instructions<'_> {
        Instructions {
            func: self,
            cursor: InstCursor::new(block),
        }
    }

    /// Backward traversal with the same tolerance as `instructions`.
    pub fn reverse_instructions(&self, block: Block) -> ReverseInstructions<'_> {
        ReverseInstructions {
            func: self,
            block,
            cur: None,
        }
    }

    pub fn first_inst(&self, block: Block) -> Option<Inst> {
        self.instructions(block).next()
    }

    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.reverse_instructions(block).next()
    }

    /// The terminator of `block`, if it has one.
    pub fn terminator(&self, block: Block) -> Option<Inst> {
        self.last_inst(block)
            .filter(|&inst| self.insts[inst].kind.is_terminator())
    }

    /// Successors of `block`, read off its terminator.
    pub fn successors(&self, block: Block) -> SmallVec<[Block; 2]> {
        match self.terminator(block) {
            Some(term) => self.insts[term].kind.successors(),
            None => SmallVec::new(),
        }
    }

    /// Offset and length of the operands of `block`'s terminator that
    /// are passed to the successor at `succ_idx`.
    pub(crate) fn successor_arg_range(&self, block: Block, succ_idx: usize) -> (usize, usize) {
        let Some(term) = self.terminator(block) else {
            return (0, 0);
        };
        let data = &self.insts[term];
        match data.kind {
            InstKind::Branch { .. } => (0, data.operands.len()),
            InstKind::CondBranch { then_args, .. } => {
                let then_args = then_args as usize;
                if succ_idx == 0 {
                    (1, then_args)
                } else {
                    (1 + then_args, data.operands.len() - 1 - then_args)
                }
            }
            _ => (0, 0),
        }
    }

    /// The values passed by `block`'s terminator to the arguments of its
    /// `succ_idx`th successor. Empty for non-branch terminators.
    pub fn successor_args(&self, block: Block, succ_idx: usize) -> &[Value] {
        let (start, len) = self.successor_arg_range(block, succ_idx);
        match self.terminator(block) {
            Some(term) => &self.insts[term].operands[start..start + len],
            None => &[],
        }
    }

    /// Every edge into `block`, as `(predecessor, successor index)`.
    /// A predecessor branching to `block` twice appears twice.
    pub fn predecessor_edges(&self, block: Block) -> SmallVec<[(Block, usize); 4]> {
        let mut edges = SmallVec::new();
        for pred in self.blocks.keys() {
            for (i, succ) in self.successors(pred).into_iter().enumerate() {
                if succ == block {
                    edges.push((pred, i));
                }
            }
        }
        edges
    }

    /// Predecessors of `block`, one entry per incoming edge.
    pub fn predecessors(&self, block: Block) -> SmallVec<[Block; 4]> {
        self.predecessor_edges(block)
            .into_iter()
            .map(|(pred, _)| pred)
            .collect()
    }

    /// Mark `inst` deleted and unlink it from its block. The erased
    /// instruction keeps its own links so a cursor positioned on it can
    /// still advance.
    pub fn erase_inst(&mut self, inst: Inst) {
        let (block, prev, next) = {
            let data = &mut self.insts[inst];
            if data.deleted {
                return;
            }
            data.deleted = true;
            (data.block, data.prev, data.next)
        };
        if prev.is_valid() {
            self.insts[prev].next = next;
        } else {
            self.blocks[block].first = next;
        }
        if next.is_valid() {
            self.insts[next].prev = prev;
        } else {
            self.blocks[block].last = prev;
        }
        trace!("erased {:?} from {:?}", inst, block);
    }

    /// A printable form of one instruction.
    pub fn display_inst(&self, inst: Inst) -> DisplayInst<'_> {
        DisplayInst { func: self, inst }
    }

    pub(crate) fn fmt_value(&self, f: &mut fmt::Formatter, value: Value) -> fmt::Result {
        match self.value_name(value) {
            Some(name) => write!(f, "{}(\"{}\")", value, name),
            None => write!(f, "{}", value),
        }
    }
}

/// A detached position in a block's instruction list. It reads the
/// `next` link only when advancing, so the caller may erase the
/// instruction most recently returned between two calls.
#[derive(Clone, Copy, Debug)]
pub struct InstCursor {
    block: Block,
    cur: Option<Inst>,
    done: bool,
}

impl InstCursor {
    pub fn new(block: Block) -> Self {
        InstCursor {
            block,
            cur: None,
            done: false,
        }
    }

    pub fn next(&mut self, func: &Function) -> Option<Inst> {
        if self.done {
            return None;
        }
        let mut candidate = match self.cur {
            None => func.blocks[self.block].first,
            Some(cur) => func.insts[cur].next,
        };
        while candidate.is_valid() && func.insts[candidate].deleted {
            candidate = func.insts[candidate].next;
        }
        if candidate.is_invalid() {
            self.done = true;
            return None;
        }
        self.cur = Some(candidate);
        Some(candidate)
    }
}

pub struct Instructions<'a> {
    func: &'a Function,
    cursor: InstCursor,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        self.cursor.next(self.func)
    }
}

pub struct ReverseInstructions<'a> {
    func: &'a Function,
    block: Block,
    cur: Option<Inst>,
}

impl<'a> Iterator for ReverseInstructions<'a> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        let mut candidate = match self.cur {
            None => self.func.blocks[self.block].last,
            Some(cur) if cur.is_invalid() => return None,
            Some(cur) => self.func.insts[cur].prev,
        };
        while candidate.is_valid() && self.func.insts[candidate].deleted {
            candidate = self.func.insts[candidate].prev;
        }
        self.cur = Some(candidate);
        if candidate.is_valid() {
            Some(candidate)
        } else {
            None
        }
    }
}

pub struct DisplayInst<'a> {
    func: &'a Function,
    inst: Inst,
}

impl<'a> fmt::Display for DisplayInst<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let func = self.func;
        let data = &func.insts[self.inst];
        if !data.results.is_empty() {
            for (i, &result) in data.results.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                func.fmt_value(f, result)?;
            }
            write!(f, " = ")?;
        }
        write!(f, "{}", data.kind.opcode())?;
        match &data.kind {
            InstKind::Load(kind) => write!(f, " [{:?}]", kind)?,
            InstKind::Store(kind) => write!(f, " [{:?}]", kind)?,
            InstKind::BeginAccess(kind) => write!(f, " [{:?}]", kind)?,
            InstKind::StructElementAddr { field }
            | InstKind::RefElementAddr { field }
            | InstKind::StructExtract { field } => write!(f, " #{}", field)?,
            InstKind::Apply(data) => write!(f, " @{}", data.callee)?,
            InstKind::TryApply { apply, .. } => write!(f, " @{}", apply.callee)?,
            InstKind::PartialApply(data) => write!(f, " @{}", data.callee)?,
            InstKind::Transfer { to } => write!(f, " to {:?}", to)?,
            _ => {}
        }
        write!(f, " (")?;
        for (i, &op) in data.operands.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", op)?;
        }
        write!(f, ")")?;
        match &data.kind {
            InstKind::Branch { dest } => write!(f, " -> {}", dest)?,
            InstKind::CondBranch {
                then_dest,
                else_dest,
                ..
            } => write!(f, " -> {}, {}", then_dest, else_dest)?,
            InstKind::TryApply { normal, error, .. } => {
                write!(f, " normal {}, error {}", normal, error)?
            }
            _ => {}
        }
        if let Some(apply) = data.kind.apply_data() {
            write!(f, " : [")?;
            for (i, conv) in apply.conventions.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", conv)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "fn {} isolation {:?} {{", self.name, self.isolation)?;
        for block in self.blocks.keys() {
            write!(f, "  {}(", block)?;
            for (i, &arg) in self.block_args(block).iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                self.fmt_value(f, arg)?;
                if let Some(conv) = self.entry_convention(arg) {
                    write!(f, " {}", conv)?;
                }
            }
            writeln!(f, "):")?;
            for inst in self.instructions(block) {
                writeln!(f, "    {}", self.display_inst(inst))?;
            }
        }
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{TypeData, TypeKind, TypeTable};
    use alloc::format;
    use alloc::vec;

    fn diamond() -> (Function, [Block; 4]) {
        let mut types = TypeTable::new();
        let int = types.add(TypeData::new("Int", TypeKind::Builtin));
        let mut b = FunctionBuilder::new("diamond", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let cond = b.add_param(int, ArgumentConvention::DirectGuaranteed);
        let then_bb = b.add_block();
        let else_bb = b.add_block();
        let join = b.add_block();
        let phi = b.add_block_arg(join, int);
        let one = b.add_value_inst(entry, InstKind::Literal, &[], int);
        b.add_inst(
            entry,
            InstKind::CondBranch {
                then_dest: then_bb,
                else_dest: else_bb,
                then_args: 0,
            },
            &[cond],
            &[],
        );
        b.add_inst(then_bb, InstKind::Branch { dest: join }, &[one], &[]);
        b.add_inst(else_bb, InstKind::Branch { dest: join }, &[cond], &[]);
        b.add_inst(join, InstKind::Return, &[phi], &[]);
        (b.finish().unwrap(), [entry, then_bb, else_bb, join])
    }

    #[test]
    fn test_successors_and_predecessors() {
        let (f, [entry, then_bb, else_bb, join]) = diamond();
        assert_eq!(f.successors(entry).as_slice(), &[then_bb, else_bb]);
        assert_eq!(f.successors(then_bb).as_slice(), &[join]);
        assert!(f.successors(join).is_empty());
        assert_eq!(f.predecessors(join).as_slice(), &[then_bb, else_bb]);
        assert_eq!(f.predecessors(entry).len(), 0);
        assert_eq!(f.successor_args(then_bb, 0).len(), 1);
        assert_eq!(f.successor_args(entry, 0).len(), 0);
    }

    #[test]
    fn test_erase_during_iteration() {
        let (mut f, [entry, ..]) = diamond();
        let mut cursor = InstCursor::new(entry);
        let mut seen = vec![];
        while let Some(inst) = cursor.next(&f) {
            seen.push(inst);
            if f.inst_kind(inst).opcode() == Opcode::Literal {
                f.erase_inst(inst);
            }
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(f.instructions(entry).count(), 1);
        assert_eq!(f.reverse_instructions(entry).count(), 1);
        assert!(f.terminator(entry).is_some());
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!("cond_br".parse::<Opcode>(), Ok(Opcode::CondBranch));
        assert_eq!(
            "frobnicate".parse::<Opcode>(),
            Err(IrError::UnknownOpcode("frobnicate".into()))
        );
        assert_eq!(
            "@inout_aliasable".parse::<ArgumentConvention>(),
            Ok(ArgumentConvention::IndirectInoutAliasable)
        );
        assert_eq!(format!("{}", Opcode::TryApply), "try_apply");
    }

    #[test]
    fn test_argument_conventions_view() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let mut b = FunctionBuilder::new("method", IsolationDomain::Nonisolated);
        b.add_indirect_result(klass);
        b.add_param(klass, ArgumentConvention::DirectOwned);
        b.add_self_param(klass, ArgumentConvention::DirectGuaranteed);
        let entry = b.entry_block();
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        let convs = f.argument_conventions();
        assert_eq!(convs.end_index(), 3);
        assert_eq!(convs.first_parameter_index(), 1);
        assert_eq!(convs.self_index(), Some(2));
        assert_eq!(convs[0], ArgumentConvention::IndirectOut);
        assert_eq!(convs[2], ArgumentConvention::DirectGuaranteed);
    }

    #[test]
    #[should_panic]
    fn test_argument_conventions_past_end() {
        let mut b = FunctionBuilder::new("empty", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        b.add_inst(entry, InstKind::Unreachable, &[], &[]);
        let f = b.finish().unwrap();
        let _ = f.argument_conventions()[0];
    }
}
