/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! SSA-related utilities.

use alloc::vec;

use crate::cfg::CFGInfo;
use crate::ir::{Function, ValueDef};
use crate::isolation::IsolationDomain;
use crate::{Block, Inst, IrError};

/// Check that every use in a reachable block is dominated by its
/// definition, that the entry block is not a branch target, and that an
/// actor-instance isolation names an entry argument.
pub fn validate_ssa(f: &Function, cfginfo: &CFGInfo) -> Result<(), IrError> {
    let entry = f.entry_block();
    if !cfginfo.preds[entry.index()].is_empty() {
        return Err(IrError::BB(entry));
    }
    if let IsolationDomain::ActorInstance(actor) = f.isolation {
        if actor.index() >= f.num_values() || !f.is_entry_arg(actor) {
            return Err(IrError::EntryArgs);
        }
    }

    // Position of each live instruction within its block.
    let mut position = vec![u32::MAX; f.num_insts()];
    for block in f.blocks.keys() {
        for (i, inst) in f.instructions(block).enumerate() {
            position[inst.index()] = i as u32;
        }
    }

    for block in cfginfo.rpo() {
        for inst in f.instructions(block) {
            for &value in f.inst_operands(inst) {
                if value.index() >= f.num_values() {
                    return Err(IrError::SSA(value, inst));
                }
                let (def_block, def_pos): (Block, Option<u32>) = match f.values[value].def {
                    ValueDef::Argument { block, .. } => (block, None),
                    ValueDef::Result { inst: def, .. } => {
                        if f.is_deleted(def) {
                            return Err(IrError::SSA(value, inst));
                        }
                        (f.inst_block(def), Some(position[def.index()]))
                    }
                };
                let ok = if def_block == block {
                    def_pos.map_or(true, |pos| pos < position[inst.index()])
                } else {
                    cfginfo.dominates(def_block, block)
                };
                if !ok {
                    return Err(IrError::SSA(value, inst));
                }
            }
        }
    }

    // Every block argument must belong to the block that lists it.
    for block in f.blocks.keys() {
        for (i, &arg) in f.block_args(block).iter().enumerate() {
            match f.values[arg].def {
                ValueDef::Argument { block: b, index } if b == block && index as usize == i => {}
                _ => return Err(IrError::SSA(arg, Inst::invalid())),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{FunctionBuilder, InstKind};
    use crate::types::{TypeData, TypeKind, TypeTable};

    #[test]
    fn test_use_not_dominated() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let int = types.add(TypeData::new("Int", TypeKind::Builtin));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let c = b.add_param(int, crate::ir::ArgumentConvention::DirectGuaranteed);
        let left = b.add_block();
        let right = b.add_block();
        b.add_inst(
            entry,
            InstKind::CondBranch {
                then_dest: left,
                else_dest: right,
                then_args: 0,
            },
            &[c],
            &[],
        );
        let x = b.add_value_inst(left, InstKind::AllocRef, &[], klass);
        b.add_inst(left, InstKind::Return, &[], &[]);
        let bad = b.add_inst(right, InstKind::DestroyValue, &[x], &[]);
        b.add_inst(right, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        let cfg = CFGInfo::new(&f).unwrap();
        assert_eq!(validate_ssa(&f, &cfg), Err(IrError::SSA(x, bad)));
    }

    #[test]
    fn test_use_before_def_in_block() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        // The copy refers to the value the next instruction defines.
        let early = b.add_inst(entry, InstKind::CopyValue, &[crate::Value::new(1)], &[klass]);
        let x = b.add_value_inst(entry, InstKind::AllocRef, &[], klass);
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        let cfg = CFGInfo::new(&f).unwrap();
        assert_eq!(x, crate::Value::new(1));
        assert_eq!(validate_ssa(&f, &cfg), Err(IrError::SSA(x, early)));
    }
}
