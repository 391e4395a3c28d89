/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::ir::{
    ArgumentConvention, Function, FunctionBuilder, InstKind, Signature, SourceLoc, ValueDef,
};
use crate::isolation::IsolationDomain;
use crate::{Block, Inst, IrError, Module, Type, TypeTable, Value};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ValueData {
    ty: Type,
    name: Option<String>,
    /// The block this value is an argument of; `None` for instruction
    /// results.
    arg_of: Option<Block>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct InstData {
    kind: InstKind,
    block: Block,
    operands: Vec<Value>,
    results: Vec<Value>,
    loc: SourceLoc,
    deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FunctionData {
    name: String,
    isolation: IsolationDomain,
    signature: Signature,
    may_run_multiple_times: bool,
    num_blocks: usize,
    values: Vec<ValueData>,
    insts: Vec<InstData>,
    test_specs: Vec<String>,
}

/// A wrapper around a `Module` that can be serialized and deserialized.
///
/// Functions are stored flat and rebuilt through `FunctionBuilder` on the
/// way back in, so a deserialized module passes the same structural
/// checks as one built in memory.
///
/// The serialized form of this structure is not stable: it is intended to be
/// deserialized with the exact same version of regionck as the one that it
/// was created with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializableModule {
    types: TypeTable,
    functions: Vec<FunctionData>,
}

impl SerializableModule {
    pub fn new(module: &Module) -> Self {
        Self {
            types: module.types.clone(),
            functions: module.functions.iter().map(FunctionData::new).collect(),
        }
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.name.as_str())
    }

    /// Rebuild the module. Fails on the first malformed function.
    pub fn into_module(self) -> Result<Module, IrError> {
        let functions = self
            .functions
            .iter()
            .map(FunctionData::rebuild)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Module {
            types: self.types,
            functions,
        })
    }
}

impl FunctionData {
    fn new(f: &Function) -> Self {
        let values = f
            .values
            .iter()
            .map(|data| ValueData {
                ty: data.ty,
                name: data.name.clone(),
                arg_of: match data.def {
                    ValueDef::Argument { block, .. } => Some(block),
                    ValueDef::Result { .. } => None,
                },
            })
            .collect();
        let insts = f
            .insts
            .iter()
            .map(|data| InstData {
                kind: data.kind.clone(),
                block: data.block,
                operands: data.operands.to_vec(),
                results: data.results.to_vec(),
                loc: data.loc,
                deleted: data.deleted,
            })
            .collect();
        FunctionData {
            name: f.name.clone(),
            isolation: f.isolation,
            signature: f.signature.clone(),
            may_run_multiple_times: f.may_run_multiple_times,
            num_blocks: f.num_blocks(),
            values,
            insts,
            test_specs: f.test_specs.clone(),
        }
    }

    /// Create the argument `self.values[index]`.
    fn add_arg(
        &self,
        b: &mut FunctionBuilder,
        index: usize,
        entry_args: &mut usize,
        user: Inst,
    ) -> Result<Value, IrError> {
        let value = Value::new(index);
        let data = &self.values[index];
        let Some(block) = data.arg_of else {
            // A result of an instruction that comes later: `user` needs
            // the value before it is defined.
            return Err(IrError::SSA(value, user));
        };
        if block.index() >= self.num_blocks {
            return Err(IrError::BB(block));
        }
        if block != b.entry_block() {
            return Ok(b.add_block_arg(block, data.ty));
        }
        let sig = &self.signature;
        let i = *entry_args;
        *entry_args += 1;
        let conv: ArgumentConvention = *sig.conventions.get(i).ok_or(IrError::EntryArgs)?;
        Ok(if i < sig.indirect_result_count {
            b.add_indirect_result(data.ty)
        } else if sig.has_self && i + 1 == sig.conventions.len() {
            b.add_self_param(data.ty, conv)
        } else if sig.transferring.get(i).copied().unwrap_or(false) {
            b.add_transferring_param(data.ty, conv)
        } else {
            b.add_param(data.ty, conv)
        })
    }

    /// Replay the construction of the function. Values and instructions
    /// are created in id order, so every id comes back unchanged.
    fn rebuild(&self) -> Result<Function, IrError> {
        let mut b = FunctionBuilder::new(&self.name, self.isolation);
        b.set_may_run_multiple_times(self.may_run_multiple_times);
        for spec in &self.test_specs {
            b.add_test_spec(spec);
        }
        for _ in 1..self.num_blocks {
            b.add_block();
        }

        let mut created = 0;
        let mut entry_args = 0;
        let mut create_args_below = |b: &mut FunctionBuilder,
                                     created: &mut usize,
                                     limit: usize,
                                     user: Inst|
         -> Result<(), IrError> {
            while *created < limit.min(self.values.len()) {
                let value = self.add_arg(b, *created, &mut entry_args, user)?;
                if let Some(name) = &self.values[*created].name {
                    b.name_value(value, name);
                }
                *created += 1;
            }
            Ok(())
        };

        for (i, data) in self.insts.iter().enumerate() {
            let inst = Inst::new(i);
            if data.block.index() >= self.num_blocks {
                return Err(IrError::BB(data.block));
            }
            if data
                .kind
                .successors()
                .iter()
                .any(|succ| succ.index() >= self.num_blocks)
            {
                return Err(IrError::Branch(inst));
            }
            let limit = data
                .operands
                .iter()
                .map(|v| v.index() + 1)
                .chain(data.results.first().map(|r| r.index()))
                .max()
                .unwrap_or(0);
            create_args_below(&mut b, &mut created, limit, inst)?;
            if let Some(&bad) = data.operands.iter().find(|v| v.index() >= created) {
                return Err(IrError::SSA(bad, inst));
            }

            let mut tys: SmallVec<[Type; 1]> = SmallVec::new();
            for (j, &result) in data.results.iter().enumerate() {
                if result.index() != created + j || result.index() >= self.values.len() {
                    return Err(IrError::SSA(result, inst));
                }
                tys.push(self.values[result.index()].ty);
            }

            b.set_loc(data.loc.line, data.loc.column);
            b.add_inst(data.block, data.kind.clone(), &data.operands, &tys);
            for &result in &data.results {
                if let Some(name) = &self.values[result.index()].name {
                    b.name_value(result, name);
                }
            }
            created += data.results.len();
        }
        create_args_below(&mut b, &mut created, self.values.len(), Inst::invalid())?;

        let mut f = b.finish()?;
        for (i, data) in self.insts.iter().enumerate() {
            if data.deleted {
                f.erase_inst(Inst::new(i));
            }
        }
        Ok(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{ApplyData, StoreKind};
    use crate::types::{TypeData, TypeKind};
    use alloc::boxed::Box;
    use alloc::format;
    use alloc::vec;

    #[test]
    fn test_round_trip_preserves_ids() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let main_ty = types.add(TypeData::new("MainActor", TypeKind::Actor));
        let mut b = FunctionBuilder::new("f", IsolationDomain::GlobalActor(main_ty));
        let entry = b.entry_block();
        let out = b.add_indirect_result(klass);
        let next = b.add_block();
        b.set_loc(4, 2);
        let x = b.add_value_inst(entry, InstKind::AllocRef, &[], klass);
        b.name_value(x, "x");
        // Block argument created after an instruction result.
        let arg = b.add_block_arg(next, klass);
        let p = b.add_transferring_param(klass, ArgumentConvention::DirectOwned);
        b.add_inst(entry, InstKind::Branch { dest: next }, &[x], &[]);
        let data = ApplyData::new("use", &[ArgumentConvention::DirectGuaranteed]);
        b.add_inst(next, InstKind::Apply(Box::new(data)), &[p], &[]);
        let dead = b.add_inst(next, InstKind::DestroyValue, &[arg], &[]);
        b.add_inst(next, InstKind::Store(StoreKind::Init), &[arg, out], &[]);
        b.add_inst(next, InstKind::Return, &[], &[]);
        b.add_test_spec("cfg @block[1]");
        let mut f = b.finish().unwrap();
        f.erase_inst(dead);

        let module = Module {
            types,
            functions: vec![f],
        };
        let rebuilt = SerializableModule::new(&module).into_module().unwrap();
        let (a, b) = (&module.functions[0], &rebuilt.functions[0]);
        assert_eq!(format!("{}", a), format!("{}", b));
        assert_eq!(a.num_values(), b.num_values());
        assert_eq!(b.value_name(x), Some("x"));
        assert_eq!(b.block_args(next), &[arg]);
        assert!(b.is_deleted(dead));
        assert!(b.argument_conventions().is_transferring(1));
        assert_eq!(b.insts[Inst::new(0)].loc, SourceLoc::new(4, 2));
        assert_eq!(b.test_specs, a.test_specs);
    }

    #[test]
    fn test_use_before_def_is_rejected() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let x = b.add_value_inst(entry, InstKind::AllocRef, &[], klass);
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        let mut data = FunctionData::new(&f);
        // Make the alloc_ref consume its own result.
        data.insts[0].operands.push(x);
        assert_eq!(data.rebuild().unwrap_err(), IrError::SSA(x, Inst::new(0)));
    }
}
