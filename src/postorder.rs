/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Postorder over the blocks reachable from the entry.

use crate::{Block, IrError, VecExt};
use alloc::vec::Vec;
use smallvec::SmallVec;

/// Compute the postorder of the blocks reachable from `entry` into
/// `out`. Blocks not reachable from `entry` do not appear; successors
/// are visited in order.
pub fn calculate<'a, SuccFn: Fn(Block) -> &'a [Block]>(
    num_blocks: usize,
    entry: Block,
    visited_scratch: &mut Vec<bool>,
    out: &mut Vec<Block>,
    succ_blocks: SuccFn,
) -> Result<(), IrError> {
    let visited = visited_scratch.repopulate(num_blocks, false);
    out.clear();
    if entry.index() >= num_blocks {
        return Err(IrError::BB(entry));
    }

    // Each frame is a block and the index of its next successor.
    let mut stack: SmallVec<[(Block, usize); 64]> = SmallVec::new();
    visited[entry.index()] = true;
    stack.push((entry, 0));
    while let Some((block, next)) = stack.last_mut() {
        let succs = succ_blocks(*block);
        let Some(&succ) = succs.get(*next) else {
            out.push(*block);
            stack.pop();
            continue;
        };
        *next += 1;
        let seen = visited.get_mut(succ.index()).ok_or(IrError::BB(succ))?;
        if !*seen {
            *seen = true;
            stack.push((succ, 0));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_loop_postorder() {
        // bb0 -> bb1 -> {bb2 -> bb1, bb3}; bb4 unreachable.
        let succs: Vec<Vec<Block>> = vec![
            vec![Block::new(1)],
            vec![Block::new(2), Block::new(3)],
            vec![Block::new(1)],
            vec![],
            vec![Block::new(0)],
        ];
        let mut visited = vec![];
        let mut out = vec![];
        calculate(5, Block::new(0), &mut visited, &mut out, |b| succs[b.index()].as_slice()).unwrap();
        assert_eq!(
            out,
            vec![Block::new(2), Block::new(3), Block::new(1), Block::new(0)]
        );
    }
}
