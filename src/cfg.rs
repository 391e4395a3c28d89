/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Lightweight CFG analyses.

use crate::alloc::vec::Vec;

use crate::ir::Function;
use crate::{domtree, postorder, Block, IrError, VecExt};
use smallvec::SmallVec;

#[derive(Debug, Default)]
pub struct CFGInfoCtx {
    visited: Vec<bool>,
}

/// Successor and predecessor lists, traversal orders and dominators of
/// one function. Computed once per analysis; the IR is not mutated
/// while it is alive.
#[derive(Debug, Default)]
pub struct CFGInfo {
    /// Postorder traversal of reachable blocks.
    pub postorder: Vec<Block>,
    /// Position of each block in reverse postorder; `None` if unreachable.
    pub block_to_rpo: Vec<Option<u32>>,
    /// Domtree parents, indexed by block.
    pub domtree: Vec<Block>,
    /// Successors, indexed by block, in terminator order.
    pub succs: Vec<SmallVec<[Block; 2]>>,
    /// Predecessors, indexed by block, one entry per edge.
    pub preds: Vec<SmallVec<[Block; 4]>>,
}

impl CFGInfo {
    pub fn new(f: &Function) -> Result<Self, IrError> {
        let mut ctx = CFGInfoCtx::default();
        let mut this = Self::default();
        this.init(f, &mut ctx)?;
        Ok(this)
    }

    pub fn init(&mut self, f: &Function, ctx: &mut CFGInfoCtx) -> Result<(), IrError> {
        let nb = f.num_blocks();

        self.succs.cleared().extend(f.blocks.keys().map(|b| f.successors(b)));
        self.preds.repopulate(nb, SmallVec::new());
        for block in f.blocks.keys() {
            for &succ in &self.succs[block.index()] {
                self.preds
                    .get_mut(succ.index())
                    .ok_or(IrError::BB(succ))?
                    .push(block);
            }
        }

        let succs = &self.succs;
        postorder::calculate(
            nb,
            f.entry_block(),
            &mut ctx.visited,
            &mut self.postorder,
            |block| &succs[block.index()][..],
        )?;

        let preds = &self.preds;
        domtree::calculate(
            nb,
            |block| &preds[block.index()][..],
            &self.postorder,
            &mut self.block_to_rpo,
            &mut self.domtree,
        );

        trace!("cfg of {}: rpo {:?}", f.name, self.postorder.iter().rev().collect::<Vec<_>>());
        Ok(())
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.block_to_rpo[block.index()].is_some()
    }

    /// Reachable blocks in reverse postorder.
    pub fn rpo(&self) -> impl DoubleEndedIterator<Item = Block> + '_ {
        self.postorder.iter().rev().copied()
    }

    pub fn rpo_index(&self, block: Block) -> Option<u32> {
        self.block_to_rpo[block.index()]
    }

    pub fn dominates(&self, a: Block, b: Block) -> bool {
        domtree::dominates(&self.domtree[..], a, b)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{ArgumentConvention, FunctionBuilder, InstKind};
    use crate::isolation::IsolationDomain;
    use crate::types::{TypeData, TypeKind, TypeTable};

    #[test]
    fn test_loop_cfg() {
        let mut types = TypeTable::new();
        let int = types.add(TypeData::new("Int", TypeKind::Builtin));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let c = b.add_param(int, ArgumentConvention::DirectGuaranteed);
        let header = b.add_block();
        let body = b.add_block();
        let exit = b.add_block();
        let dead = b.add_block();
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
        b.add_inst(body, InstKind::Branch { dest: header }, &[], &[]);
        b.add_inst(exit, InstKind::Return, &[], &[]);
        b.add_inst(dead, InstKind::Branch { dest: exit }, &[], &[]);
        let f = b.finish().unwrap();

        let cfg = CFGInfo::new(&f).unwrap();
        assert_eq!(cfg.rpo().next(), Some(entry));
        assert!(!cfg.is_reachable(dead));
        assert!(cfg.dominates(header, body));
        assert!(cfg.dominates(header, exit));
        assert!(!cfg.dominates(body, exit));
        assert_eq!(cfg.preds[header.index()].as_slice(), &[entry, body]);
        assert_eq!(cfg.preds[exit.index()].as_slice(), &[header, dead]);
    }
}
