/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: verifies that no region of non-Sendable values is used from
//! its original isolation domain after being transferred, and that
//! move-only values are consumed at most once.
//!
//! ## Formal Definition
//!
//! The dataflow state at each program point is a `RegionState`: a
//! partition of the live tracked values into regions, each region
//! carrying its isolation domain, whether it may be transferred, and a
//! status (live, consumed at some instruction, or transferred by some
//! operand), plus the set of open `begin_access [modify]` scopes.
//!
//! The lattice ordering is partition coarsening, with statuses ordered
//! live < consumed < transferred. The meet at a block entry is the
//! finest partition coarser than every incoming one; a joined region's
//! status is the worst of the statuses flowing into it. Every
//! instruction is first lowered to `RegionOp`s (see `classify`), whose
//! transfer functions are:
//!
//!   - `AssignFresh(v)`:       v leaves its region for a new singleton
//!   - `Assign { d, s }`:      d leaves its region and joins that of s
//!   - `Merge(a, b)`:          the regions of a and b are unioned
//!   - `Consume(op)`:          a live region becomes consumed at op
//!   - `Transfer { op, to }`:  a live, transferable region becomes
//!                             transferred by op, now owned by `to`
//!   - `MoveOut { d, s, r }`:  d takes over the region of s; s, its
//!                             storage root r and every other address
//!                             into r are left in a fresh consumed region
//!
//! Along each edge, block arguments are assigned in parallel from the
//! values the branch passes, and the state is restricted to values live
//! into the successor. Since partitions only coarsen and statuses only
//! worsen, the fixpoint is reached after a number of iterations bounded
//! by the number of values.
//!
//! Once the fixpoint is found we step through every reachable block a
//! last time and check each op against the state before it: uses of a
//! transferred region are races, uses of a consumed region are
//! use-after-consume, and so on. All findings of the function are
//! collected; none stops the walk.

use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use smallvec::SmallVec;

use crate::cfg::CFGInfo;
use crate::classify::{Classifier, RegionOp};
use crate::diagnostics::{DiagnosticKind, DiagnosticSink, Location, Note, NoteRole};
use crate::ir::{ArgumentConvention, Function, InstKind, Operand};
use crate::liveness::Liveness;
use crate::partition::{Partition, RegionInfo, RegionStatus};
use crate::types::TypeOracle;
use crate::{ssa, Block, CheckerOptions, FxHashMap, FxHashSet, Inst, IrError, Value};

pub use crate::diagnostics::CheckerOutput;


/// The dataflow state at one program point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionState {
    pub partition: Partition,
    /// Open `begin_access [modify]` scopes, by access value.
    pub open_accesses: BTreeSet<Value>,
}

impl RegionState {
    /// Join `other` into `self`; returns true if `self` changed.
    fn meet_with(&mut self, other: &RegionState) -> bool {
        let partition = self.partition.join(&other.partition);
        let mut open_accesses = self.open_accesses.clone();
        open_accesses.extend(other.open_accesses.iter().copied());
        let changed = partition != self.partition || open_accesses != self.open_accesses;
        self.partition = partition;
        self.open_accesses = open_accesses;
        changed
    }

    fn status(&self, value: Value) -> Option<RegionStatus> {
        self.partition.info_of(value).map(|info| info.status)
    }

    /// Step the state over one op.
    fn update<'a, O: TypeOracle + ?Sized>(&mut self, op: &RegionOp, checker: &Checker<'a, O>) {
        match op {
            RegionOp::AssignFresh(v) => {
                self.partition.assign_fresh(*v, checker.fresh_info(*v));
            }
            RegionOp::Assign { dest, src } => {
                if !self.partition.assign(*dest, *src) {
                    self.partition.assign_fresh(*dest, checker.fresh_info(*dest));
                } else if checker.pinned.contains(dest) {
                    if let Some(info) = self.partition.info_of_mut(*dest) {
                        info.transferable = false;
                    }
                }
            }
            RegionOp::Merge(a, b) => {
                self.partition.merge(*a, *b);
            }
            RegionOp::Consume(operand) => {
                if let Some(info) = self.partition.info_of_mut(operand.value) {
                    if info.status.is_live() {
                        info.status = RegionStatus::Consumed {
                            site: operand.user,
                        };
                    }
                }
            }
            RegionOp::Transfer { operand, to } => {
                if let Some(info) = self.partition.info_of_mut(operand.value) {
                    if info.status.is_live() && info.transferable {
                        info.status = RegionStatus::Transferred {
                            site: *operand,
                            to: *to,
                        };
                        info.domain = *to;
                    }
                }
            }
            RegionOp::MoveOut { dest, src, root } => {
                let Some(region) = self.partition.region_of(src.value) else {
                    self.partition.assign_fresh(*dest, checker.fresh_info(*dest));
                    return;
                };
                let Some(info) = self.partition.info(region).copied() else {
                    return;
                };
                // Every address into the storage, including access scopes
                // and sibling fields, is left behind in the consumed region.
                let mut storage: SmallVec<[Value; 8]> = self
                    .partition
                    .elements_of(region)
                    .filter(|&v| {
                        v != *dest
                            && (v == src.value
                                || v == *root
                                || checker.classifier.storage_root(v) == *root)
                    })
                    .collect();
                if *root != src.value && self.partition.contains(*root) && !storage.contains(root)
                {
                    storage.push(*root);
                }
                self.partition.assign(*dest, src.value);
                let status = match info.status {
                    RegionStatus::Live => RegionStatus::Consumed { site: src.user },
                    other => other,
                };
                self.partition
                    .assign_fresh(src.value, RegionInfo { status, ..info });
                for &v in &storage {
                    if v != src.value {
                        self.partition.assign(v, src.value);
                    }
                }
            }
            RegionOp::AssignParallel(pairs) => {
                self.partition
                    .assign_parallel(pairs, RegionInfo::new(checker.f.isolation));
            }
            RegionOp::OpenAccess(access) => {
                self.open_accesses.insert(*access);
            }
            RegionOp::CloseAccess(access) => {
                self.open_accesses.remove(access);
            }
            RegionOp::Require(_)
            | RegionOp::NonSendableResult { .. }
            | RegionOp::EscapingInoutCapture(_)
            | RegionOp::CheckExit(_) => {}
        }
    }

    /// Check one op against the state before it.
    fn check<'a, O: TypeOracle + ?Sized>(
        &self,
        op: &RegionOp,
        checker: &Checker<'a, O>,
        sink: &mut DiagnosticSink,
    ) {
        match op {
            RegionOp::Require(operand) => {
                self.check_use(*operand, checker, sink);
            }
            RegionOp::Consume(operand) | RegionOp::MoveOut { src: operand, .. } => {
                self.check_consume(*operand, checker, sink);
            }
            RegionOp::Transfer { operand, .. } => {
                // Another argument of the same call already sent this
                // region.
                if let Some(RegionStatus::Transferred { site, .. }) = self.status(operand.value) {
                    if site.user == operand.user && site != *operand {
                        return;
                    }
                }
                if !self.check_use(*operand, checker, sink) {
                    return;
                }
                let Some(info) = self.partition.info_of(operand.value) else {
                    return;
                };
                if !info.transferable {
                    sink.report(
                        DiagnosticKind::TransferOfNonTransferable,
                        checker.location(operand.user),
                        checker.name_of(operand.value),
                        Some(format!(
                            "{}",
                            info.domain.describe(checker.f, checker.oracle)
                        )),
                        vec![],
                        checker.is_preconcurrency(operand.value),
                    );
                }
            }
            RegionOp::CloseAccess(access) => {
                if !self.open_accesses.contains(access) {
                    return;
                }
                if let Some(RegionStatus::Consumed { site }) = self.status(*access) {
                    let mut notes = vec![];
                    if let Some(begin) = checker.f.def_inst(*access) {
                        notes.push(Note {
                            role: NoteRole::AccessScope,
                            location: checker.location(begin),
                        });
                    }
                    sink.report(
                        DiagnosticKind::ConsumedDuringExclusiveAccess,
                        checker.location(site),
                        checker.name_of(*access),
                        None,
                        notes,
                        false,
                    );
                }
            }
            RegionOp::NonSendableResult { inst, callee } => {
                let Some(apply) = checker.f.inst_kind(*inst).apply_data() else {
                    return;
                };
                let preconcurrency = checker
                    .call_result(*inst)
                    .map_or(false, |r| checker.is_preconcurrency(r));
                sink.report(
                    DiagnosticKind::NonSendableResult,
                    checker.location(*inst),
                    apply.callee.clone(),
                    Some(format!("{}", callee.describe(checker.f, checker.oracle))),
                    vec![],
                    preconcurrency,
                );
            }
            RegionOp::EscapingInoutCapture(operand) => {
                let root = checker
                    .classifier
                    .inout_root(operand.value)
                    .unwrap_or(operand.value);
                sink.report(
                    DiagnosticKind::InoutCapturedByEscapingClosure,
                    checker.location(operand.user),
                    checker.name_of(root),
                    None,
                    vec![],
                    false,
                );
            }
            RegionOp::CheckExit(exit) => {
                for &(param, conv) in &checker.exit_params {
                    let Some(RegionStatus::Consumed { site }) = self.status(param) else {
                        continue;
                    };
                    let kind = if checker.f.may_run_multiple_times
                        && conv == ArgumentConvention::IndirectInoutAliasable
                    {
                        DiagnosticKind::ConsumedInClosure
                    } else {
                        DiagnosticKind::ConsumedNotReinitialized
                    };
                    sink.report(
                        kind,
                        checker.location(*exit),
                        checker.name_of(param),
                        None,
                        vec![Note {
                            role: NoteRole::ConsumingUse,
                            location: checker.location(site),
                        }],
                        false,
                    );
                }
            }
            RegionOp::AssignFresh(_)
            | RegionOp::Assign { .. }
            | RegionOp::Merge(..)
            | RegionOp::AssignParallel(_)
            | RegionOp::OpenAccess(_) => {}
        }
    }

    /// A non-consuming use. Returns false if it was reported.
    fn check_use<'a, O: TypeOracle + ?Sized>(
        &self,
        operand: Operand,
        checker: &Checker<'a, O>,
        sink: &mut DiagnosticSink,
    ) -> bool {
        match self.status(operand.value) {
            Some(RegionStatus::Transferred { site, .. }) => {
                sink.report_race(
                    site,
                    checker.location(site.user),
                    checker.name_of(site.value),
                    checker.location(operand.user),
                    checker.is_preconcurrency(site.value),
                );
                false
            }
            Some(RegionStatus::Consumed { site }) => {
                sink.report(
                    DiagnosticKind::UsedAfterConsume,
                    checker.location(operand.user),
                    checker.name_of(operand.value),
                    None,
                    vec![Note {
                        role: NoteRole::ConsumingUse,
                        location: checker.location(site),
                    }],
                    false,
                );
                false
            }
            Some(RegionStatus::Live) | None => true,
        }
    }

    fn check_consume<'a, O: TypeOracle + ?Sized>(
        &self,
        operand: Operand,
        checker: &Checker<'a, O>,
        sink: &mut DiagnosticSink,
    ) {
        match self.status(operand.value) {
            Some(RegionStatus::Consumed { site }) if site == operand.user => {
                // This very use was reached again around a back edge.
                sink.report(
                    DiagnosticKind::ConsumedInLoop,
                    checker.location(operand.user),
                    checker.name_of(operand.value),
                    None,
                    vec![],
                    false,
                );
            }
            Some(RegionStatus::Consumed { site }) => {
                sink.report(
                    DiagnosticKind::ConsumedMoreThanOnce,
                    checker.location(operand.user),
                    checker.name_of(operand.value),
                    None,
                    vec![Note {
                        role: NoteRole::ConsumingUse,
                        location: checker.location(site),
                    }],
                    false,
                );
            }
            _ => {
                self.check_use(operand, checker, sink);
            }
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.partition)?;
        if !self.open_accesses.is_empty() {
            write!(f, " open:")?;
            for access in &self.open_accesses {
                write!(f, " {}", access)?;
            }
        }
        Ok(())
    }
}

/// The region ops of one instruction.
#[derive(Clone, Debug)]
struct CheckerInst {
    inst: Inst,
    ops: Vec<RegionOp>,
}

/// Region and ownership checker for one function.
pub struct Checker<'a, O: TypeOracle + ?Sized> {
    f: &'a Function,
    oracle: &'a O,
    options: CheckerOptions,
    classifier: Classifier<'a, O>,
    cfginfo: CFGInfo,
    liveness: Liveness,
    /// Reachable blocks in reverse postorder.
    rpo: Vec<Block>,
    bb_in: Vec<Option<RegionState>>,
    bb_insts: Vec<Vec<CheckerInst>>,
    edge_ops: FxHashMap<(Block, usize), Vec<RegionOp>>,
    /// Entry arguments whose storage belongs to the caller.
    pinned: FxHashSet<Value>,
    /// Tracked `inout` parameters, checked at every exit.
    exit_params: SmallVec<[(Value, ArgumentConvention); 4]>,
}

impl<'a, O: TypeOracle + ?Sized> Checker<'a, O> {
    /// Create a checker for `f`. Fails if the IR is malformed; with
    /// `options.validate_ssa` this includes SSA dominance.
    pub fn new(f: &'a Function, oracle: &'a O, options: CheckerOptions) -> Result<Self, IrError> {
        let cfginfo = CFGInfo::new(f)?;
        if options.validate_ssa {
            ssa::validate_ssa(f, &cfginfo)?;
        }
        let classifier = Classifier::new(f, oracle);

        let entry = f.entry_block();
        let convs = f.argument_conventions();
        let mut pinned = FxHashSet::default();
        let mut exit_params = SmallVec::new();
        for (i, &arg) in f.block_args(entry).iter().enumerate() {
            let conv = convs[i];
            if !conv.is_out() && !convs.is_transferring(i) {
                pinned.insert(arg);
            }
            if conv.is_inout() && classifier.is_tracked(arg) {
                exit_params.push((arg, conv));
            }
        }
        let always_live: SmallVec<[Value; 4]> = exit_params.iter().map(|&(v, _)| v).collect();
        let liveness = Liveness::compute(f, &cfginfo, &always_live);
        let rpo: Vec<Block> = cfginfo.rpo().collect();

        let mut bb_insts = vec![vec![]; f.num_blocks()];
        let mut edge_ops = FxHashMap::default();
        for &block in &rpo {
            let insts: &mut Vec<CheckerInst> = &mut bb_insts[block.index()];
            for inst in f.instructions(block) {
                let mut ops = vec![];
                classifier.classify_inst(inst, &mut ops);
                trace!("classify {:?}: {} => {:?}", inst, f.display_inst(inst), ops);
                insts.push(CheckerInst { inst, ops });
            }
            for succ_idx in 0..cfginfo.succs[block.index()].len() {
                let mut ops = vec![];
                classifier.classify_edge(block, succ_idx, &mut ops);
                edge_ops.insert((block, succ_idx), ops);
            }
        }

        let mut checker = Checker {
            f,
            oracle,
            options,
            classifier,
            cfginfo,
            liveness,
            rpo,
            bb_in: vec![None; f.num_blocks()],
            bb_insts,
            edge_ops,
            pinned,
            exit_params,
        };
        checker.bb_in[entry.index()] = Some(checker.entry_state());
        Ok(checker)
    }

    /// The state on function entry. Every tracked parameter starts in its
    /// own region, owned by the caller unless it is `transferring`; the
    /// receiver and every non-Sendable reference parameter share one.
    fn entry_state(&self) -> RegionState {
        let f = self.f;
        let domain = f.isolation.parameter_domain();
        let convs = f.argument_conventions();
        let mut state = RegionState::default();
        let args = f.block_args(f.entry_block());
        for (i, &arg) in args.iter().enumerate() {
            if !self.classifier.is_tracked(arg) {
                continue;
            }
            let info = if self.pinned.contains(&arg) {
                RegionInfo::pinned(domain)
            } else {
                RegionInfo::new(f.isolation)
            };
            trace!("entry: {} {} -> {:?}", arg, convs[i], info);
            state.partition.assign_fresh(arg, info);
        }
        if let Some(self_idx) = convs.self_index() {
            let receiver = args[self_idx];
            if state.partition.contains(receiver) {
                for &arg in &args[convs.first_parameter_index()..self_idx] {
                    let ty = f.value_type(arg);
                    if self.pinned.contains(&arg)
                        && self.oracle.is_reference(ty)
                        && !self.oracle.is_sendable(ty)
                    {
                        state.partition.merge(receiver, arg);
                    }
                }
            }
        }
        state.partition.canonicalize();
        state
    }

    fn fresh_info(&self, value: Value) -> RegionInfo {
        if self.pinned.contains(&value) {
            RegionInfo::pinned(self.f.isolation.parameter_domain())
        } else {
            RegionInfo::new(self.f.isolation)
        }
    }

    fn location(&self, inst: Inst) -> Location {
        Location {
            inst,
            loc: self.f.insts[inst].loc,
        }
    }

    fn name_of(&self, value: Value) -> String {
        match self.classifier.name_of(value) {
            Some(name) => String::from(name),
            None => format!("{}", value),
        }
    }

    fn is_preconcurrency(&self, value: Value) -> bool {
        self.oracle.is_preconcurrency(self.f.value_type(value))
    }

    /// The direct result of a call: the instruction result of `apply`,
    /// or the normal block argument of `try_apply`.
    fn call_result(&self, inst: Inst) -> Option<Value> {
        match self.f.inst_kind(inst) {
            InstKind::TryApply { normal, .. } => self.f.block_args(*normal).first().copied(),
            _ => self.f.inst_results(inst).first().copied(),
        }
    }

    /// Restrict `state` to what `succ` can observe: its live-in values
    /// and its arguments.
    fn restrict_to_entry(&self, succ: Block, state: &mut RegionState) {
        let args = self.f.block_args(succ);
        let live = self.liveness.live_in(succ);
        state
            .partition
            .retain(|v| live.contains(&v) || args.contains(&v));
        state.open_accesses.retain(|v| live.contains(v));
        state.partition.canonicalize();
    }

    /// Perform the dataflow analysis to compute the state at each block
    /// entry.
    pub fn analyze(&mut self) {
        // Always pick the earliest block in reverse postorder.
        let mut queue: BTreeSet<u32> = BTreeSet::new();
        queue.insert(0);
        let mut iterations = 0usize;

        while let Some(idx) = queue.pop_first() {
            iterations += 1;
            let block = self.rpo[idx as usize];
            let Some(mut state) = self.bb_in[block.index()].clone() else {
                continue;
            };
            trace!("analyze: block {:?} has state {}", block, state);
            for inst in &self.bb_insts[block.index()] {
                for op in &inst.ops {
                    state.update(op, self);
                }
                trace!("analyze: inst {:?} -> state {}", inst.inst, state);
            }

            for (succ_idx, &succ) in self.cfginfo.succs[block.index()].iter().enumerate() {
                let mut new_state = state.clone();
                if let Some(ops) = self.edge_ops.get(&(block, succ_idx)) {
                    for op in ops {
                        new_state.update(op, self);
                    }
                }
                self.restrict_to_entry(succ, &mut new_state);

                let changed = match &mut self.bb_in[succ.index()] {
                    Some(cur_succ_in) => {
                        trace!(
                            "meeting state {} for block {:?} with state {} for block {:?}",
                            new_state,
                            block,
                            cur_succ_in,
                            succ
                        );
                        cur_succ_in.meet_with(&new_state)
                    }
                    slot @ None => {
                        *slot = Some(new_state);
                        true
                    }
                };
                if let (true, Some(idx)) = (changed, self.cfginfo.rpo_index(succ)) {
                    trace!("analyze: block {:?} state changed; pushing onto queue", succ);
                    queue.insert(idx);
                }
            }
        }
        trace!("analyze: fixpoint after {} block visits", iterations);
    }

    /// The state on entry to `block`, once `analyze` has run. `None` for
    /// unreachable blocks.
    pub fn block_entry_state(&self, block: Block) -> Option<&RegionState> {
        self.bb_in[block.index()].as_ref()
    }

    /// The state right before `inst`, once `analyze` has run.
    pub fn state_before(&self, inst: Inst) -> Option<RegionState> {
        let block = self.f.inst_block(inst);
        let mut state = self.bb_in[block.index()].clone()?;
        for checkinst in &self.bb_insts[block.index()] {
            if checkinst.inst == inst {
                return Some(state);
            }
            for op in &checkinst.ops {
                state.update(op, self);
            }
        }
        None
    }

    /// The region ops `inst` was lowered to.
    pub fn ops_of(&self, inst: Inst) -> &[RegionOp] {
        let block = self.f.inst_block(inst);
        self.bb_insts[block.index()]
            .iter()
            .find(|checkinst| checkinst.inst == inst)
            .map_or(&[], |checkinst| &checkinst.ops[..])
    }

    /// Using the block-entry states computed by `analyze()`, step through
    /// each block and check every op.
    pub fn find_errors(&self) -> CheckerOutput {
        let mut sink = DiagnosticSink::new(self.options.mode);
        for &block in &self.rpo {
            let Some(mut state) = self.bb_in[block.index()].clone() else {
                continue;
            };
            for checkinst in &self.bb_insts[block.index()] {
                for op in &checkinst.ops {
                    state.check(op, self, &mut sink);
                    state.update(op, self);
                }
            }
            for succ_idx in 0..self.cfginfo.succs[block.index()].len() {
                if let Some(ops) = self.edge_ops.get(&(block, succ_idx)) {
                    let mut edge_state = state.clone();
                    for op in ops {
                        edge_state.check(op, self, &mut sink);
                        edge_state.update(op, self);
                    }
                }
            }
        }
        CheckerOutput {
            function: self.f.name.clone(),
            diagnostics: sink.finish(),
        }
    }

    /// Analyze the function and return every finding.
    pub fn run(mut self) -> CheckerOutput {
        self.analyze();
        let output = self.find_errors();

        trace!("=== CHECKER RESULT ({}) ===", self.f.name);
        if self.options.verbose_log && trace_enabled!() {
            for &block in &self.rpo {
                trace!("{:?}:", block);
                let Some(mut state) = self.bb_in[block.index()].clone() else {
                    continue;
                };
                trace!("    {}", state);
                for checkinst in &self.bb_insts[block.index()] {
                    trace!("  {}", self.f.display_inst(checkinst.inst));
                    for op in &checkinst.ops {
                        state.update(op, &self);
                    }
                    trace!("    {}", state);
                }
            }
        }
        for diag in &output.diagnostics {
            trace!("  {}", diag);
        }
        output
    }
}
