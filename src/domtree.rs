/*
 * Derives from the dominator tree implementation in regalloc.rs, which is
 * licensed under the Apache Public License 2.0 with LLVM Exception. See:
 * https://github.com/bytecodealliance/regalloc.rs
 */

// This is an implementation of the algorithm described in
//
//   A Simple, Fast Dominance Algorithm
//   Keith D. Cooper, Timothy J. Harvey, and Ken Kennedy
//   Department of Computer Science, Rice University, Houston, Texas, USA
//   TR-06-33870
//   https://www.cs.rice.edu/~keith/EMBED/dom.pdf
//
// Dominators are kept by RPO number while iterating, so the two-finger
// walk compares plain integers.

use alloc::vec;
use alloc::vec::Vec;

use crate::{Block, VecExt};

const UNDEF: u32 = u32::MAX;

/// Nearest common dominator of two RPO numbers.
fn intersect(doms: &[u32], mut a: u32, mut b: u32) -> u32 {
    while a != b {
        while a > b {
            a = doms[a as usize];
        }
        while b > a {
            b = doms[b as usize];
        }
    }
    a
}

/// Compute RPO numbers into `block_to_rpo` and immediate dominators into
/// `idom`, both indexed by block. The entry (the last block of
/// `postorder`) and unreachable blocks get `Block::invalid()`.
pub fn calculate<'a, PredFn: Fn(Block) -> &'a [Block]>(
    num_blocks: usize,
    preds: PredFn,
    postorder: &[Block],
    block_to_rpo: &mut Vec<Option<u32>>,
    idom: &mut Vec<Block>,
) {
    let rpo: Vec<Block> = postorder.iter().rev().copied().collect();
    block_to_rpo.repopulate(num_blocks, None);
    for (i, block) in rpo.iter().enumerate() {
        block_to_rpo[block.index()] = Some(i as u32);
    }
    idom.repopulate(num_blocks, Block::invalid());
    if rpo.is_empty() {
        return;
    }

    let mut doms = vec![UNDEF; rpo.len()];
    doms[0] = 0;
    let mut changed = true;
    while changed {
        changed = false;
        for (i, &block) in rpo.iter().enumerate().skip(1) {
            let mut new_idom = UNDEF;
            for pred in preds(block) {
                let Some(p) = block_to_rpo[pred.index()] else {
                    continue;
                };
                if doms[p as usize] == UNDEF {
                    continue;
                }
                new_idom = if new_idom == UNDEF {
                    p
                } else {
                    intersect(&doms, p, new_idom)
                };
            }
            if new_idom != doms[i] {
                doms[i] = new_idom;
                changed = true;
            }
        }
    }

    for (i, &block) in rpo.iter().enumerate().skip(1) {
        if doms[i] != UNDEF {
            idom[block.index()] = rpo[doms[i] as usize];
        }
    }
}

/// Does `a` dominate `b`? Every block dominates itself.
pub fn dominates(idom: &[Block], a: Block, mut b: Block) -> bool {
    loop {
        if a == b {
            return true;
        }
        if b.is_invalid() {
            return false;
        }
        b = idom[b.index()];
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_diamond_with_loop() {
        // bb0 -> {bb1, bb2} -> bb3 -> bb1
        let preds: Vec<Vec<Block>> = vec![
            vec![],
            vec![Block::new(0), Block::new(3)],
            vec![Block::new(0)],
            vec![Block::new(1), Block::new(2)],
        ];
        let postorder = vec![Block::new(3), Block::new(1), Block::new(2), Block::new(0)];
        let mut block_to_rpo = vec![];
        let mut idom = vec![];
        calculate(
            4,
            |b| preds[b.index()].as_slice(),
            &postorder,
            &mut block_to_rpo,
            &mut idom,
        );
        assert_eq!(
            idom,
            vec![Block::invalid(), Block::new(0), Block::new(0), Block::new(0)]
        );
        assert!(dominates(&idom, Block::new(0), Block::new(3)));
        assert!(!dominates(&idom, Block::new(1), Block::new(3)));
    }
}
