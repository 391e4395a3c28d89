/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Incremental construction of a `Function`.

use alloc::string::String;
use alloc::vec::Vec;

use super::{
    ArgumentConvention, BlockData, Blocks, Function, InstData, InstKind, Insts, LoadKind,
    Ownership, Signature, SourceLoc, ValueCategory, ValueData, ValueDef, Values,
};
use crate::isolation::IsolationDomain;
use crate::{Block, Inst, IrError, Type, Value};

/// Builds a function block by block. Instructions are appended to the
/// end of the given block; `finish` checks the structural invariants
/// the checker relies on.
pub struct FunctionBuilder {
    func: Function,
    loc: SourceLoc,
    saw_param: bool,
    saw_self: bool,
    misordered: bool,
}

impl FunctionBuilder {
    pub fn new(name: &str, isolation: IsolationDomain) -> Self {
        let mut blocks = Blocks::new();
        blocks.push(BlockData::default());
        FunctionBuilder {
            func: Function {
                name: String::from(name),
                isolation,
                signature: Signature::default(),
                may_run_multiple_times: false,
                blocks,
                insts: Insts::new(),
                values: Values::new(),
                test_specs: Vec::new(),
            },
            loc: SourceLoc::default(),
            saw_param: false,
            saw_self: false,
            misordered: false,
        }
    }

    pub fn entry_block(&self) -> Block {
        self.func.entry_block()
    }

    pub fn set_isolation(&mut self, isolation: IsolationDomain) {
        self.func.isolation = isolation;
    }

    pub fn set_may_run_multiple_times(&mut self, may_run_multiple_times: bool) {
        self.func.may_run_multiple_times = may_run_multiple_times;
    }

    /// Attach a `specify_test` string to the function.
    pub fn add_test_spec(&mut self, spec: &str) {
        self.func.test_specs.push(String::from(spec));
    }

    /// Source location given to instructions added from now on.
    pub fn set_loc(&mut self, line: u32, column: u32) {
        self.loc = SourceLoc::new(line, column);
    }

    fn push_entry_arg(&mut self, ty: Type, conv: ArgumentConvention, transferring: bool) -> Value {
        let entry = self.func.entry_block();
        let index = self.func.blocks[entry].args.len() as u32;
        let value = self.func.values.push(ValueData {
            ty,
            category: if conv.is_indirect() {
                ValueCategory::Address
            } else {
                ValueCategory::Object
            },
            ownership: conv.entry_ownership(),
            def: ValueDef::Argument {
                block: entry,
                index,
            },
            name: None,
        });
        self.func.blocks[entry].args.push(value);
        self.func.signature.conventions.push(conv);
        self.func.signature.transferring.push(transferring);
        value
    }

    /// Add an indirect result slot. These must precede all parameters.
    pub fn add_indirect_result(&mut self, ty: Type) -> Value {
        if self.saw_param || self.saw_self {
            self.misordered = true;
        }
        self.func.signature.indirect_result_count += 1;
        self.push_entry_arg(ty, ArgumentConvention::IndirectOut, false)
    }

    pub fn add_param(&mut self, ty: Type, conv: ArgumentConvention) -> Value {
        if self.saw_self {
            self.misordered = true;
        }
        self.saw_param = true;
        self.push_entry_arg(ty, conv, false)
    }

    /// Add a parameter annotated `transferring`: the callee receives the
    /// whole region and the caller may not touch it again.
    pub fn add_transferring_param(&mut self, ty: Type, conv: ArgumentConvention) -> Value {
        if self.saw_self {
            self.misordered = true;
        }
        self.saw_param = true;
        self.push_entry_arg(ty, conv, true)
    }

    /// Add the implicit receiver. It must be the last parameter.
    pub fn add_self_param(&mut self, ty: Type, conv: ArgumentConvention) -> Value {
        if self.saw_self {
            self.misordered = true;
        }
        self.saw_self = true;
        self.func.signature.has_self = true;
        self.push_entry_arg(ty, conv, false)
    }

    pub fn add_block(&mut self) -> Block {
        self.func.blocks.push(BlockData::default())
    }

    pub fn add_block_arg(&mut self, block: Block, ty: Type) -> Value {
        let index = self.func.blocks[block].args.len() as u32;
        let value = self.func.values.push(ValueData {
            ty,
            category: ValueCategory::Object,
            ownership: Ownership::Owned,
            def: ValueDef::Argument { block, index },
            name: None,
        });
        self.func.blocks[block].args.push(value);
        value
    }

    /// Append an instruction with one result per entry of `result_tys`.
    pub fn add_inst(
        &mut self,
        block: Block,
        kind: InstKind,
        operands: &[Value],
        result_tys: &[Type],
    ) -> Inst {
        let inst = Inst::new(self.func.insts.len());
        let (category, ownership) = result_shape(&kind);
        let results = result_tys
            .iter()
            .enumerate()
            .map(|(i, &ty)| {
                self.func.values.push(ValueData {
                    ty,
                    category,
                    ownership,
                    def: ValueDef::Result {
                        inst,
                        index: i as u32,
                    },
                    name: None,
                })
            })
            .collect();

        let prev = self.func.blocks[block].last;
        self.func.insts.push(InstData {
            kind,
            operands: operands.iter().copied().collect(),
            results,
            loc: self.loc,
            block,
            prev,
            next: Inst::invalid(),
            deleted: false,
        });
        if prev.is_valid() {
            self.func.insts[prev].next = inst;
        } else {
            self.func.blocks[block].first = inst;
        }
        self.func.blocks[block].last = inst;
        inst
    }

    /// Append a single-result instruction and return its result.
    pub fn add_value_inst(
        &mut self,
        block: Block,
        kind: InstKind,
        operands: &[Value],
        ty: Type,
    ) -> Value {
        let inst = self.add_inst(block, kind, operands, &[ty]);
        self.func.insts[inst].results[0]
    }

    /// Give `value` a source-level name used in diagnostics.
    pub fn name_value(&mut self, value: Value, name: &str) {
        self.func.values[value].name = Some(String::from(name));
    }

    /// Check the structural invariants and return the function.
    pub fn finish(self) -> Result<Function, IrError> {
        let f = self.func;
        if self.misordered
            || f.signature.conventions.len() != f.block_args(f.entry_block()).len()
        {
            return Err(IrError::EntryArgs);
        }

        for block in f.blocks.keys() {
            let mut insts = f.instructions(block).peekable();
            if insts.peek().is_none() {
                return Err(IrError::BB(block));
            }
            while let Some(inst) = insts.next() {
                let is_last = insts.peek().is_none();
                if f.insts[inst].kind.is_terminator() != is_last {
                    return Err(IrError::BB(block));
                }
                check_arity(&f, inst)?;
            }
        }

        trace!("built function {}:\n{}", f.name, f);
        Ok(f)
    }
}

/// Category and ownership of the results of an instruction kind.
fn result_shape(kind: &InstKind) -> (ValueCategory, Ownership) {
    match kind {
        InstKind::AllocStack
        | InstKind::StructElementAddr { .. }
        | InstKind::RefElementAddr { .. }
        | InstKind::BeginAccess(_) => (ValueCategory::Address, Ownership::None),
        InstKind::BeginBorrow | InstKind::StructExtract { .. } => {
            (ValueCategory::Object, Ownership::Guaranteed)
        }
        InstKind::Literal | InstKind::Load(LoadKind::Trivial) => {
            (ValueCategory::Object, Ownership::None)
        }
        _ => (ValueCategory::Object, Ownership::Owned),
    }
}

/// Check operand and result counts of one instruction.
fn check_arity(f: &Function, inst: Inst) -> Result<(), IrError> {
    let data = &f.insts[inst];
    let nops = data.operands.len();
    let nres = data.results.len();
    let ok = match &data.kind {
        InstKind::Literal | InstKind::AllocStack | InstKind::AllocRef => nops == 0 && nres == 1,
        InstKind::CopyValue
        | InstKind::MoveValue
        | InstKind::BeginBorrow
        | InstKind::Load(_)
        | InstKind::StructElementAddr { .. }
        | InstKind::RefElementAddr { .. }
        | InstKind::StructExtract { .. }
        | InstKind::BeginAccess(_) => nops == 1 && nres == 1,
        InstKind::EndBorrow
        | InstKind::DestroyValue
        | InstKind::DestroyAddr
        | InstKind::DeallocStack
        | InstKind::EndAccess
        | InstKind::Transfer { .. }
        | InstKind::Throw => nops == 1 && nres == 0,
        InstKind::Store(_) => nops == 2 && nres == 0,
        InstKind::Struct | InstKind::Tuple | InstKind::PartialApply(_) => nres == 1,
        InstKind::Apply(data) => nops == data.conventions.len() && nres <= 1,
        InstKind::Return => nops <= 1 && nres == 0,
        InstKind::Unreachable => nops == 0 && nres == 0,
        InstKind::Branch { dest } => {
            if nops != f.block_args(*dest).len() {
                return Err(IrError::Branch(inst));
            }
            nres == 0
        }
        InstKind::CondBranch {
            then_dest,
            else_dest,
            then_args,
        } => {
            let then_args = *then_args as usize;
            if nops < 1 + then_args
                || then_args != f.block_args(*then_dest).len()
                || nops - 1 - then_args != f.block_args(*else_dest).len()
            {
                return Err(IrError::Branch(inst));
            }
            nres == 0
        }
        InstKind::TryApply {
            apply,
            normal,
            error,
        } => {
            if f.block_args(*normal).len() > 1 || f.block_args(*error).len() != 1 {
                return Err(IrError::Branch(inst));
            }
            nops == apply.conventions.len() && nres == 0
        }
    };
    if let InstKind::PartialApply(data) = &data.kind {
        if data.conventions.len() != nops {
            return Err(IrError::Operand(inst));
        }
    }
    if ok {
        Ok(())
    } else {
        Err(IrError::Operand(inst))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{TypeData, TypeKind, TypeTable};

    #[test]
    fn test_missing_terminator() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        b.add_value_inst(entry, InstKind::AllocRef, &[], klass);
        assert_eq!(b.finish().unwrap_err(), IrError::BB(entry));
    }

    #[test]
    fn test_branch_arity() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let next = b.add_block();
        b.add_block_arg(next, klass);
        let br = b.add_inst(entry, InstKind::Branch { dest: next }, &[], &[]);
        b.add_inst(next, InstKind::Return, &[], &[]);
        assert_eq!(b.finish().unwrap_err(), IrError::Branch(br));
    }

    #[test]
    fn test_self_must_be_last() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        b.add_self_param(klass, ArgumentConvention::DirectGuaranteed);
        b.add_param(klass, ArgumentConvention::DirectGuaranteed);
        let entry = b.entry_block();
        b.add_inst(entry, InstKind::Return, &[], &[]);
        assert_eq!(b.finish().unwrap_err(), IrError::EntryArgs);
    }

    #[test]
    fn test_operand_count() {
        let mut types = TypeTable::new();
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let x = b.add_value_inst(entry, InstKind::AllocRef, &[], klass);
        let bad = b.add_inst(entry, InstKind::Store(super::super::StoreKind::Init), &[x], &[]);
        b.add_inst(entry, InstKind::Return, &[], &[]);
        assert_eq!(b.finish().unwrap_err(), IrError::Operand(bad));
    }
}
