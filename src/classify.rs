/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Translation of instructions into region operations.
//!
//! The checker never looks at instruction kinds itself. Each
//! instruction, and each control-flow edge that carries block
//! arguments, is lowered once into a short list of `RegionOp`s over the
//! tracked values it touches; the dataflow driver only interprets those.

use alloc::vec::Vec;

use smallvec::{smallvec, SmallVec};

use crate::ir::{
    AccessKind, ApplyData, ArgumentConvention, Function, InstKind, LoadKind, Operand, ValueDef,
};
use crate::isolation::{IsolationCrossing, IsolationDomain};
use crate::types::TypeOracle;
use crate::{Block, Inst, Value};

/// One step of the region dataflow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegionOp {
    /// `dest` starts a new singleton region.
    AssignFresh(Value),
    /// `dest` leaves its region and joins that of `src`.
    Assign { dest: Value, src: Value },
    /// The regions of both values become one.
    Merge(Value, Value),
    /// Non-consuming use: the region must be live.
    Require(Operand),
    /// Consuming use of a move-only value within the current domain.
    Consume(Operand),
    /// The region of the operand is handed over to another domain.
    Transfer { operand: Operand, to: IsolationDomain },
    /// Move a move-only value out of `src` into `dest`. `src` and the
    /// storage `root` it projects from are left in a fresh consumed
    /// region.
    MoveOut {
        dest: Value,
        src: Operand,
        root: Value,
    },
    /// Simultaneous assignment of block arguments from incoming values.
    /// A `None` source gives the argument a fresh region.
    AssignParallel(SmallVec<[(Value, Option<Value>); 2]>),
    /// A `begin_access [modify]` scope starts.
    OpenAccess(Value),
    /// An access scope ends; storage taken from it must have been
    /// reinitialized.
    CloseAccess(Value),
    /// A call crossing into `callee` returns a non-Sendable value.
    NonSendableResult { inst: Inst, callee: IsolationDomain },
    /// An escaping closure captures the address of an `inout` parameter.
    EscapingInoutCapture(Operand),
    /// Function exit: `inout` parameters must be initialized.
    CheckExit(Inst),
}

pub struct Classifier<'a, O: TypeOracle + ?Sized> {
    f: &'a Function,
    oracle: &'a O,
}

impl<'a, O: TypeOracle + ?Sized> Classifier<'a, O> {
    pub fn new(f: &'a Function, oracle: &'a O) -> Self {
        Classifier { f, oracle }
    }

    /// Does the checker track `value` at all? Sendable copyable values
    /// can be shared freely and never belong to a region.
    pub fn is_tracked(&self, value: Value) -> bool {
        let ty = self.f.value_type(value);
        !self.oracle.is_sendable(ty) || self.oracle.is_move_only(ty)
    }

    pub fn is_sendable(&self, value: Value) -> bool {
        self.oracle.is_sendable(self.f.value_type(value))
    }

    pub fn is_move_only(&self, value: Value) -> bool {
        self.oracle.is_move_only(self.f.value_type(value))
    }

    fn def_kind(&self, value: Value) -> Option<(&'a InstKind, Inst)> {
        let inst = self.f.def_inst(value)?;
        Some((self.f.inst_kind(inst), inst))
    }

    /// Strip access scopes off an address.
    fn strip_access(&self, mut addr: Value) -> Value {
        while let Some((InstKind::BeginAccess(_), inst)) = self.def_kind(addr) {
            addr = self.f.inst_operands(inst)[0];
        }
        addr
    }

    /// The innermost storage an address points into: strips access
    /// scopes and struct field projections, stops at class fields.
    pub fn storage_root(&self, mut addr: Value) -> Value {
        loop {
            match self.def_kind(addr) {
                Some((InstKind::BeginAccess(_) | InstKind::StructElementAddr { .. }, inst)) => {
                    addr = self.f.inst_operands(inst)[0];
                }
                _ => return addr,
            }
        }
    }

    /// Does `addr` name a whole local or parameter variable, as opposed
    /// to a field of one?
    fn is_whole_variable(&self, addr: Value) -> bool {
        match self.f.values[addr].def {
            ValueDef::Argument { .. } => self.f.is_entry_arg(addr),
            ValueDef::Result { inst, .. } => {
                matches!(self.f.inst_kind(inst), InstKind::AllocStack)
            }
        }
    }

    /// The `inout` parameter `addr` is rooted at, if any.
    pub fn inout_root(&self, addr: Value) -> Option<Value> {
        let root = self.storage_root(addr);
        match self.f.entry_convention(root) {
            Some(conv) if conv.is_inout() => Some(root),
            _ => None,
        }
    }

    /// The source-level name of `value`, looking through loads, copies,
    /// borrows and access scopes.
    pub fn name_of(&self, mut value: Value) -> Option<&'a str> {
        loop {
            if let Some(name) = self.f.value_name(value) {
                return Some(name);
            }
            match self.def_kind(value)? {
                (
                    InstKind::Load(_)
                    | InstKind::BeginAccess(_)
                    | InstKind::CopyValue
                    | InstKind::MoveValue
                    | InstKind::BeginBorrow,
                    inst,
                ) => value = self.f.inst_operands(inst)[0],
                _ => return None,
            }
        }
    }

    fn tracked_operands(&self, inst: Inst) -> SmallVec<[Operand; 4]> {
        self.f
            .operands(inst)
            .filter(|op| self.is_tracked(op.value))
            .collect()
    }

    /// `result` is derived from the tracked operands: it joins the region
    /// of the first and the others are merged in.
    fn derive(&self, result: Value, sources: &[Operand], out: &mut Vec<RegionOp>) {
        if !self.is_tracked(result) {
            return;
        }
        match sources.split_first() {
            Some((first, rest)) => {
                out.push(RegionOp::Assign {
                    dest: result,
                    src: first.value,
                });
                for op in rest {
                    out.push(RegionOp::Merge(result, op.value));
                }
            }
            None => out.push(RegionOp::AssignFresh(result)),
        }
    }

    /// Region ops of one instruction, appended to `out`.
    pub fn classify_inst(&self, inst: Inst, out: &mut Vec<RegionOp>) {
        let f = self.f;
        let results = f.inst_results(inst);
        match f.inst_kind(inst) {
            InstKind::Literal | InstKind::AllocStack | InstKind::AllocRef => {
                for &r in results {
                    if self.is_tracked(r) {
                        out.push(RegionOp::AssignFresh(r));
                    }
                }
            }

            InstKind::CopyValue
            | InstKind::BeginBorrow
            | InstKind::RefElementAddr { .. }
            | InstKind::StructExtract { .. }
            | InstKind::Struct
            | InstKind::Tuple
            | InstKind::Load(LoadKind::Copy | LoadKind::Trivial) => {
                let sources = self.tracked_operands(inst);
                out.extend(sources.iter().map(|&op| RegionOp::Require(op)));
                self.derive(results[0], &sources, out);
            }

            // Projections into storage the function owns are not uses:
            // the storage may be uninitialized until a store.
            InstKind::StructElementAddr { .. } => {
                let sources = self.tracked_operands(inst);
                self.derive(results[0], &sources, out);
            }

            InstKind::BeginAccess(kind) => {
                let sources = self.tracked_operands(inst);
                self.derive(results[0], &sources, out);
                if *kind == AccessKind::Modify {
                    out.push(RegionOp::OpenAccess(results[0]));
                }
            }

            InstKind::EndAccess => out.push(RegionOp::CloseAccess(f.inst_operands(inst)[0])),

            InstKind::MoveValue | InstKind::Load(LoadKind::Take) => {
                let src = f.operand(inst, 0);
                let dest = results[0];
                if !self.is_tracked(src.value) {
                    self.derive(dest, &[], out);
                } else if self.is_move_only(src.value) && self.is_tracked(dest) {
                    out.push(RegionOp::MoveOut {
                        dest,
                        src,
                        root: self.storage_root(src.value),
                    });
                } else {
                    out.push(RegionOp::Require(src));
                    self.derive(dest, &[src], out);
                }
            }

            InstKind::EndBorrow
            | InstKind::DestroyValue
            | InstKind::DestroyAddr
            | InstKind::DeallocStack
            | InstKind::Unreachable => {}

            InstKind::Store(_) => self.classify_store(inst, out),

            InstKind::Apply(data) => {
                self.classify_call(inst, data, out);
                if let Some(&r) = results.first() {
                    self.assign_call_result(inst, data, r, out);
                }
            }

            InstKind::TryApply { apply, .. } => self.classify_call(inst, apply, out),

            InstKind::PartialApply(data) => {
                let sources = self.tracked_operands(inst);
                for &op in &sources {
                    out.push(RegionOp::Require(op));
                    if data.escaping && self.inout_root(op.value).is_some() {
                        out.push(RegionOp::EscapingInoutCapture(op));
                    }
                }
                self.derive(results[0], &sources, out);
            }

            InstKind::Transfer { to } => {
                let operand = f.operand(inst, 0);
                if self.is_tracked(operand.value) {
                    out.push(RegionOp::Transfer { operand, to: *to });
                }
            }

            InstKind::Branch { .. } => {}

            InstKind::CondBranch { .. } => {
                let cond = f.operand(inst, 0);
                if self.is_tracked(cond.value) {
                    out.push(RegionOp::Require(cond));
                }
            }

            InstKind::Return | InstKind::Throw => {
                for op in self.tracked_operands(inst) {
                    out.push(RegionOp::Require(op));
                }
                out.push(RegionOp::CheckExit(inst));
            }
        }
    }

    fn classify_store(&self, inst: Inst, out: &mut Vec<RegionOp>) {
        let src = self.f.operand(inst, 0);
        let dest = self.f.operand(inst, 1);
        let src_tracked = self.is_tracked(src.value);
        if src_tracked {
            out.push(RegionOp::Require(src));
        }
        if !self.is_tracked(dest.value) {
            return;
        }
        let base = self.strip_access(dest.value);
        if self.is_whole_variable(base) {
            // The old contents are dead: the variable and the access
            // through which it is written now alias only `src`.
            let mut targets: SmallVec<[Value; 2]> = smallvec![base];
            if dest.value != base {
                targets.push(dest.value);
            }
            for target in targets {
                if src_tracked {
                    out.push(RegionOp::Assign {
                        dest: target,
                        src: src.value,
                    });
                } else {
                    out.push(RegionOp::AssignFresh(target));
                }
            }
        } else {
            // A field write: siblings share storage with the aggregate.
            out.push(RegionOp::Require(dest));
            if src_tracked {
                out.push(RegionOp::Merge(dest.value, src.value));
            }
        }
    }

    fn crossing(&self, callee: Option<IsolationDomain>) -> Option<IsolationCrossing> {
        IsolationCrossing::classify(self.f.isolation, callee)
    }

    /// Argument handling shared by `apply` and `try_apply`.
    fn classify_call(&self, inst: Inst, data: &ApplyData, out: &mut Vec<RegionOp>) {
        let crossing = self.crossing(data.callee_isolation);
        let mut group: SmallVec<[Value; 4]> = SmallVec::new();
        let mut outs: SmallVec<[Value; 2]> = SmallVec::new();
        for op in self.tracked_operands(inst) {
            let conv = data
                .conventions
                .get(op.index as usize)
                .copied()
                .unwrap_or(ArgumentConvention::DirectGuaranteed);
            if conv.is_out() {
                outs.push(op.value);
                continue;
            }
            match crossing {
                Some(crossing) if !self.is_sendable(op.value) => {
                    out.push(RegionOp::Transfer {
                        operand: op,
                        to: crossing.callee,
                    });
                }
                _ if data.is_transferring(op.index as usize) => {
                    out.push(RegionOp::Transfer {
                        operand: op,
                        to: data.callee_isolation.unwrap_or(IsolationDomain::Task),
                    });
                }
                _ if conv.is_consuming() && self.is_move_only(op.value) => {
                    out.push(RegionOp::Consume(op));
                }
                Some(_) => out.push(RegionOp::Require(op)),
                None => {
                    out.push(RegionOp::Require(op));
                    group.push(op.value);
                }
            }
        }
        // A same-domain callee may link any of its non-consumed
        // arguments together.
        for pair in group.windows(2) {
            out.push(RegionOp::Merge(pair[0], pair[1]));
        }
        for out_arg in outs {
            let target = self.strip_access(out_arg);
            match group.first() {
                Some(&src) => out.push(RegionOp::Assign { dest: target, src }),
                None => out.push(RegionOp::AssignFresh(target)),
            }
        }
    }

    /// The value a same-domain call's result aliases, if any.
    fn call_group_leader(&self, inst: Inst, data: &ApplyData) -> Option<Value> {
        if self.crossing(data.callee_isolation).is_some() {
            return None;
        }
        self.tracked_operands(inst)
            .into_iter()
            .find(|op| {
                let i = op.index as usize;
                let conv = data.conventions.get(i).copied();
                !conv.map_or(false, |c| c.is_out())
                    && !data.is_transferring(i)
                    && !(conv.map_or(false, |c| c.is_consuming()) && self.is_move_only(op.value))
            })
            .map(|op| op.value)
    }

    fn assign_call_result(
        &self,
        inst: Inst,
        data: &ApplyData,
        result: Value,
        out: &mut Vec<RegionOp>,
    ) {
        if !self.is_tracked(result) {
            return;
        }
        if let Some(crossing) = self.crossing(data.callee_isolation) {
            out.push(RegionOp::AssignFresh(result));
            if !self.is_sendable(result) && !data.result_transferring {
                out.push(RegionOp::NonSendableResult {
                    inst,
                    callee: crossing.callee,
                });
            }
            return;
        }
        match self.call_group_leader(inst, data) {
            Some(src) => out.push(RegionOp::Assign { dest: result, src }),
            None => out.push(RegionOp::AssignFresh(result)),
        }
    }

    /// Region ops for the edge from `block` to its `succ_idx`th
    /// successor, applied after the terminator's own ops.
    pub fn classify_edge(&self, block: Block, succ_idx: usize, out: &mut Vec<RegionOp>) {
        let f = self.f;
        let Some(term) = f.terminator(block) else {
            return;
        };
        let succ = f.successors(block)[succ_idx];
        match f.inst_kind(term) {
            InstKind::Branch { .. } | InstKind::CondBranch { .. } => {
                let pairs: SmallVec<[(Value, Option<Value>); 2]> = f
                    .block_args(succ)
                    .iter()
                    .zip(f.successor_args(block, succ_idx))
                    .filter(|&(&arg, _)| self.is_tracked(arg))
                    .map(|(&arg, &incoming)| {
                        (arg, Some(incoming).filter(|&v| self.is_tracked(v)))
                    })
                    .collect();
                if !pairs.is_empty() {
                    out.push(RegionOp::AssignParallel(pairs));
                }
            }
            InstKind::TryApply { apply, error, .. } => {
                let Some(&arg) = f.block_args(succ).first() else {
                    return;
                };
                if !self.is_tracked(arg) {
                    return;
                }
                if succ == *error && succ_idx == 1 {
                    out.push(RegionOp::AssignFresh(arg));
                } else {
                    self.assign_call_result(term, apply, arg, out);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{FunctionBuilder, StoreKind};
    use crate::types::{TypeData, TypeKind, TypeTable};
    use alloc::boxed::Box;
    use alloc::vec;

    struct Env {
        types: TypeTable,
        klass: crate::Type,
        int: crate::Type,
        main: IsolationDomain,
    }

    fn env() -> Env {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let int = types.add(TypeData::new("Int", TypeKind::Builtin));
        let main_ty = types.add(TypeData::new("MainActor", TypeKind::Actor));
        Env {
            types,
            klass,
            int,
            main: IsolationDomain::GlobalActor(main_ty),
        }
    }

    fn ops_of(f: &Function, types: &TypeTable, inst: Inst) -> Vec<RegionOp> {
        let mut out = vec![];
        Classifier::new(f, types).classify_inst(inst, &mut out);
        out
    }

    #[test]
    fn test_crossing_call_transfers_non_sendable_args() {
        let e = env();
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let x = b.add_value_inst(entry, InstKind::AllocRef, &[], e.klass);
        let n = b.add_value_inst(entry, InstKind::Literal, &[], e.int);
        let data = ApplyData::new(
            "transferToMain",
            &[ArgumentConvention::DirectGuaranteed, ArgumentConvention::DirectGuaranteed],
        )
        .isolated_to(e.main);
        let call = b.add_inst(entry, InstKind::Apply(Box::new(data)), &[x, n], &[e.klass]);
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        let result = f.inst_results(call)[0];
        assert_eq!(
            ops_of(&f, &e.types, call),
            vec![
                RegionOp::Transfer {
                    operand: f.operand(call, 0),
                    to: e.main,
                },
                RegionOp::AssignFresh(result),
                RegionOp::NonSendableResult {
                    inst: call,
                    callee: e.main,
                },
            ]
        );
    }

    #[test]
    fn test_same_domain_call_merges_args() {
        let e = env();
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let x = b.add_value_inst(entry, InstKind::AllocRef, &[], e.klass);
        let y = b.add_value_inst(entry, InstKind::AllocRef, &[], e.klass);
        let data = ApplyData::new(
            "link",
            &[ArgumentConvention::DirectGuaranteed, ArgumentConvention::DirectGuaranteed],
        );
        let call = b.add_inst(entry, InstKind::Apply(Box::new(data)), &[x, y], &[e.klass]);
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        let result = f.inst_results(call)[0];
        assert_eq!(
            ops_of(&f, &e.types, call),
            vec![
                RegionOp::Require(f.operand(call, 0)),
                RegionOp::Require(f.operand(call, 1)),
                RegionOp::Merge(x, y),
                RegionOp::Assign { dest: result, src: x },
            ]
        );
    }

    #[test]
    fn test_store_whole_vs_field() {
        let e = env();
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let slot = b.add_value_inst(entry, InstKind::AllocStack, &[], e.klass);
        let k = b.add_value_inst(entry, InstKind::AllocRef, &[], e.klass);
        let whole = b.add_inst(entry, InstKind::Store(StoreKind::Init), &[k, slot], &[]);
        let field = b.add_value_inst(
            entry,
            InstKind::RefElementAddr { field: 0 },
            &[k],
            e.klass,
        );
        let k2 = b.add_value_inst(entry, InstKind::AllocRef, &[], e.klass);
        let partial = b.add_inst(entry, InstKind::Store(StoreKind::Assign), &[k2, field], &[]);
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        assert_eq!(
            ops_of(&f, &e.types, whole),
            vec![
                RegionOp::Require(f.operand(whole, 0)),
                RegionOp::Assign { dest: slot, src: k },
            ]
        );
        assert_eq!(
            ops_of(&f, &e.types, partial),
            vec![
                RegionOp::Require(f.operand(partial, 0)),
                RegionOp::Require(f.operand(partial, 1)),
                RegionOp::Merge(field, k2),
            ]
        );
    }

    #[test]
    fn test_sendable_values_are_ignored() {
        let e = env();
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let n = b.add_value_inst(entry, InstKind::Literal, &[], e.int);
        let c = b.add_inst(entry, InstKind::CopyValue, &[n], &[e.int]);
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        assert!(ops_of(&f, &e.types, c).is_empty());
    }

    #[test]
    fn test_name_lookthrough() {
        let e = env();
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let slot = b.add_value_inst(entry, InstKind::AllocStack, &[], e.klass);
        b.name_value(slot, "x");
        let loaded = b.add_value_inst(entry, InstKind::Load(LoadKind::Copy), &[slot], e.klass);
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        assert_eq!(Classifier::new(&f, &e.types).name_of(loaded), Some("x"));
    }
}
