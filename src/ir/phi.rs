/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Views over block arguments, reconstructed from the CFG.

use super::{Function, InstKind, Operand, ValueDef};
use crate::{Block, Inst, Value};

/// A block argument fed by a plain branch from its only predecessor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Phi {
    pub value: Value,
    pub block: Block,
    pub index: usize,
    pub pred: Block,
    pub branch: Inst,
    incoming: Operand,
}

impl Phi {
    /// Interpret `value` as a phi. Returns `None` if it is not a block
    /// argument, if its block does not have exactly one predecessor
    /// edge, or if that edge's terminator is not `br` / `cond_br`.
    pub fn new(f: &Function, value: Value) -> Option<Phi> {
        let ValueDef::Argument { block, index } = f.values[value].def else {
            return None;
        };
        if block == f.entry_block() {
            return None;
        }
        let edges = f.predecessor_edges(block);
        let &[(pred, succ_idx)] = edges.as_slice() else {
            return None;
        };
        let branch = f.terminator(pred)?;
        if !matches!(
            f.inst_kind(branch),
            InstKind::Branch { .. } | InstKind::CondBranch { .. }
        ) {
            return None;
        }
        let (start, _) = f.successor_arg_range(pred, succ_idx);
        let incoming = f.operand(branch, start + index as usize);
        Some(Phi {
            value,
            block,
            index: index as usize,
            pred,
            branch,
            incoming,
        })
    }

    /// The operand of the predecessor's branch that feeds this phi.
    pub fn incoming_operand(&self) -> Operand {
        self.incoming
    }

    pub fn incoming_value(&self) -> Value {
        self.incoming.value
    }
}

/// A block argument produced by a non-branch terminator of its only
/// predecessor, e.g. the normal or error result of `try_apply`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminatorResult {
    pub value: Value,
    pub block: Block,
    pub terminator: Inst,
}

impl TerminatorResult {
    pub fn new(f: &Function, value: Value) -> Option<TerminatorResult> {
        let ValueDef::Argument { block, .. } = f.values[value].def else {
            return None;
        };
        if block == f.entry_block() {
            return None;
        }
        let edges = f.predecessor_edges(block);
        let &[(pred, _)] = edges.as_slice() else {
            return None;
        };
        let terminator = f.terminator(pred)?;
        match f.inst_kind(terminator) {
            InstKind::TryApply { .. } => Some(TerminatorResult {
                value,
                block,
                terminator,
            }),
            _ => None,
        }
    }

    /// Is this the error result rather than the normal result?
    pub fn is_error(&self, f: &Function) -> bool {
        matches!(
            f.inst_kind(self.terminator),
            InstKind::TryApply { error, .. } if *error == self.block
        )
    }
}

/// What a block argument is, structurally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentKind {
    FunctionEntry { index: usize },
    Phi(Phi),
    TerminatorResult(TerminatorResult),
    /// Zero or several incoming edges: only the general join rule over
    /// all predecessors applies.
    Merge,
}

/// Classify a block argument.
///
/// Panics if `value` is an instruction result.
pub fn classify_argument(f: &Function, value: Value) -> ArgumentKind {
    match f.values[value].def {
        ValueDef::Argument { block, index } if block == f.entry_block() => {
            ArgumentKind::FunctionEntry {
                index: index as usize,
            }
        }
        ValueDef::Argument { .. } => {
            if let Some(phi) = Phi::new(f, value) {
                ArgumentKind::Phi(phi)
            } else if let Some(result) = TerminatorResult::new(f, value) {
                ArgumentKind::TerminatorResult(result)
            } else {
                ArgumentKind::Merge
            }
        }
        ValueDef::Result { inst, .. } => {
            panic!("{} is a result of {:?}, not a block argument", value, inst)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{ApplyData, ArgumentConvention, FunctionBuilder};
    use crate::isolation::IsolationDomain;
    use crate::types::{TypeData, TypeKind, TypeTable};

    #[test]
    fn test_phi_and_terminator_result() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let err = types.add(TypeData::new("Error", TypeKind::Class).sendable(true));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let x = b.add_param(klass, ArgumentConvention::DirectGuaranteed);
        let normal = b.add_block();
        let error = b.add_block();
        let join = b.add_block();
        let res = b.add_block_arg(normal, klass);
        let e = b.add_block_arg(error, err);
        let phi = b.add_block_arg(join, klass);
        b.add_inst(
            entry,
            InstKind::TryApply {
                apply: alloc::boxed::Box::new(ApplyData::new(
                    "mayThrow",
                    &[ArgumentConvention::DirectGuaranteed],
                )),
                normal,
                error,
            },
            &[x],
            &[],
        );
        let br = b.add_inst(normal, InstKind::Branch { dest: join }, &[res], &[]);
        b.add_inst(error, InstKind::Throw, &[e], &[]);
        b.add_inst(join, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();

        let p = Phi::new(&f, phi).unwrap();
        assert_eq!(p.pred, normal);
        assert_eq!(p.incoming_value(), res);
        assert_eq!(p.incoming_operand().user, br);
        assert!(Phi::new(&f, res).is_none());

        let r = TerminatorResult::new(&f, e).unwrap();
        assert!(r.is_error(&f));
        assert!(matches!(classify_argument(&f, res), ArgumentKind::TerminatorResult(_)));
        assert_eq!(
            classify_argument(&f, x),
            ArgumentKind::FunctionEntry { index: 0 }
        );
    }

    #[test]
    fn test_two_predecessors_is_merge() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let int = types.add(TypeData::new("Int", TypeKind::Builtin));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let c = b.add_param(int, ArgumentConvention::DirectGuaranteed);
        let x = b.add_param(klass, ArgumentConvention::DirectGuaranteed);
        let join = b.add_block();
        let phi = b.add_block_arg(join, klass);
        b.add_inst(
            entry,
            InstKind::CondBranch {
                then_dest: join,
                else_dest: join,
                then_args: 1,
            },
            &[c, x, x],
            &[],
        );
        b.add_inst(join, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        assert!(Phi::new(&f, phi).is_none());
        assert_eq!(classify_argument(&f, phi), ArgumentKind::Merge);
    }
}
