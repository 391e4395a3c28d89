/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Block-entry liveness of SSA values.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::cfg::CFGInfo;
use crate::ir::Function;
use crate::{Block, FxHashSet, Value, VecExt};

/// Values live on entry to each block. Block arguments are defined by
/// their block and so are never live into it.
#[derive(Debug, Default)]
pub struct Liveness {
    live_in: Vec<FxHashSet<Value>>,
}

impl Liveness {
    /// Backward dataflow over the reachable blocks. `always_live` values
    /// are added to every reachable block, e.g. parameters that must be
    /// inspected at function exit.
    pub fn compute(f: &Function, cfginfo: &CFGInfo, always_live: &[Value]) -> Self {
        let nb = f.num_blocks();
        let mut gen: Vec<FxHashSet<Value>> = Vec::with_capacity(nb);
        let mut kill: Vec<FxHashSet<Value>> = Vec::with_capacity(nb);
        for block in f.blocks.keys() {
            let mut block_kill: FxHashSet<Value> = f.block_args(block).iter().copied().collect();
            let mut block_gen = FxHashSet::default();
            for inst in f.instructions(block) {
                for &op in f.inst_operands(inst) {
                    if !block_kill.contains(&op) {
                        block_gen.insert(op);
                    }
                }
                block_kill.extend(f.inst_results(inst).iter().copied());
            }
            gen.push(block_gen);
            kill.push(block_kill);
        }

        let mut live_in: Vec<FxHashSet<Value>> = Vec::new();
        live_in.repopulate(nb, FxHashSet::default());
        let mut queued: Vec<bool> = Vec::new();
        queued.repopulate(nb, false);

        // Postorder visits successors first, so most blocks settle on
        // their first visit.
        let mut workqueue: VecDeque<Block> = cfginfo.postorder.iter().copied().collect();
        for &block in &cfginfo.postorder {
            queued[block.index()] = true;
        }

        while let Some(block) = workqueue.pop_front() {
            queued[block.index()] = false;
            let mut live = gen[block.index()].clone();
            for &succ in &cfginfo.succs[block.index()] {
                for &v in &live_in[succ.index()] {
                    if !kill[block.index()].contains(&v) {
                        live.insert(v);
                    }
                }
            }
            if live != live_in[block.index()] {
                trace!("live-in {:?}: {:?}", block, live);
                live_in[block.index()] = live;
                for &pred in &cfginfo.preds[block.index()] {
                    if cfginfo.is_reachable(pred) && !queued[pred.index()] {
                        queued[pred.index()] = true;
                        workqueue.push_back(pred);
                    }
                }
            }
        }

        for block in cfginfo.rpo() {
            live_in[block.index()].extend(always_live.iter().copied());
        }

        Liveness { live_in }
    }

    pub fn live_in(&self, block: Block) -> &FxHashSet<Value> {
        &self.live_in[block.index()]
    }

    pub fn is_live_in(&self, block: Block, value: Value) -> bool {
        self.live_in[block.index()].contains(&value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{ArgumentConvention, FunctionBuilder, InstKind};
    use crate::isolation::IsolationDomain;
    use crate::types::{TypeData, TypeKind, TypeTable};

    #[test]
    fn test_loop_liveness() {
        let mut types = TypeTable::new();
        let int = types.add(TypeData::new("Int", TypeKind::Builtin));
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let c = b.add_param(int, ArgumentConvention::DirectGuaranteed);
        let header = b.add_block();
        let body = b.add_block();
        let exit = b.add_block();
        let x = b.add_value_inst(entry, InstKind::AllocRef, &[], klass);
        let dead = b.add_value_inst(entry, InstKind::AllocRef, &[], klass);
        b.add_inst(entry, InstKind::Branch { dest: header }, &[], &[]);
        b.add_inst(
            header,
            InstKind::CondBranch {
                then_dest: body,
                else_dest: exit,
                then_args: 0,
            },
            &[c],
            &[],
        );
        let y = b.add_value_inst(body, InstKind::CopyValue, &[x], klass);
        b.add_inst(body, InstKind::DestroyValue, &[y], &[]);
        b.add_inst(body, InstKind::Branch { dest: header }, &[], &[]);
        b.add_inst(exit, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();

        let cfg = CFGInfo::new(&f).unwrap();
        let live = Liveness::compute(&f, &cfg, &[]);
        assert!(live.is_live_in(header, x));
        assert!(live.is_live_in(header, c));
        assert!(live.is_live_in(body, x));
        assert!(!live.is_live_in(body, y));
        assert!(!live.is_live_in(header, dead));
        assert!(!live.is_live_in(exit, x));

        let live = Liveness::compute(&f, &cfg, &[dead]);
        assert!(live.is_live_in(exit, dead));
    }
}
