/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Arbitrary well-formed functions for fuzzing the checker.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;

use crate::fuzzing::arbitrary::{Arbitrary, Result, Unstructured};
use crate::ir::{AccessKind, ApplyData, ClosureData, LoadKind, StoreKind};
use crate::{
    ArgumentConvention, Block, Checker, CheckerOptions, ConcurrencyMode, Function,
    FunctionBuilder, InstKind, IsolationDomain, Severity, Type, TypeData, TypeKind, TypeTable,
    Value,
};

#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Generate more than one block.
    pub control_flow: bool,
    /// Allow branches back to earlier blocks.
    pub loops: bool,
    /// Generate move-only storage and consuming calls.
    pub move_only: bool,
    pub max_blocks: usize,
    pub max_insts_per_block: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            control_flow: true,
            loops: true,
            move_only: true,
            max_blocks: 8,
            max_insts_per_block: 12,
        }
    }
}

/// The fixed set of types every generated function draws from.
#[derive(Clone, Copy, Debug)]
struct Types {
    klass: Type,
    int: Type,
    tuple: Type,
    resource: Type,
    legacy: Type,
    closure: Type,
    main: Type,
}

impl Types {
    fn new(table: &mut TypeTable) -> Types {
        Types {
            klass: table.add(TypeData::new("Klass", TypeKind::Class)),
            int: table.add(TypeData::new("Int", TypeKind::Builtin)),
            tuple: table.add(TypeData::new("(Klass, Klass)", TypeKind::Tuple)),
            resource: table.add(TypeData::new("Resource", TypeKind::Struct).move_only()),
            legacy: table.add(TypeData::new("Legacy", TypeKind::Class).preconcurrency()),
            closure: table.add(TypeData::new("() -> ()", TypeKind::Function)),
            main: table.add(TypeData::new("MainActor", TypeKind::Actor)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TestCase {
    pub types: TypeTable,
    pub func: Function,
}

impl<'a> Arbitrary<'a> for TestCase {
    fn arbitrary(u: &mut Unstructured<'a>) -> Result<TestCase> {
        TestCase::arbitrary_with_options(u, &Options::default())
    }
}

/// Values usable at the current point of a block.
#[derive(Clone, Debug, Default)]
struct Scope {
    objects: Vec<(Value, Type)>,
    addrs: Vec<(Value, Type)>,
}

impl Scope {
    fn type_of(&self, value: Value, default: Type) -> Type {
        self.objects
            .iter()
            .find(|&&(v, _)| v == value)
            .map_or(default, |&(_, ty)| ty)
    }
}

struct FuncGen {
    b: FunctionBuilder,
    tys: Types,
    opts: Options,
    line: u32,
    calls: usize,
}

impl FuncGen {
    fn inst(&mut self, block: Block, kind: InstKind, operands: &[Value], results: &[Type]) {
        self.line += 1;
        self.b.set_loc(self.line, 5);
        self.b.add_inst(block, kind, operands, results);
    }

    fn value_inst(&mut self, block: Block, kind: InstKind, operands: &[Value], ty: Type) -> Value {
        self.line += 1;
        self.b.set_loc(self.line, 5);
        self.b.add_value_inst(block, kind, operands, ty)
    }

    fn callee(&mut self) -> alloc::string::String {
        self.calls += 1;
        format!("callee{}", self.calls)
    }

    /// Pick an object of type `ty` (any type if `None`) from `scope`,
    /// creating a fresh one if there is none.
    fn object(
        &mut self,
        u: &mut Unstructured,
        block: Block,
        scope: &mut Scope,
        ty: Option<Type>,
    ) -> Result<Value> {
        let candidates: Vec<Value> = scope
            .objects
            .iter()
            .filter(|(_, t)| ty.map_or(true, |ty| ty == *t))
            .map(|&(v, _)| v)
            .collect();
        if !candidates.is_empty() && bool::arbitrary(u)? {
            return Ok(*u.choose(&candidates)?);
        }
        let ty = ty.unwrap_or(self.tys.klass);
        let kind = if ty == self.tys.int {
            InstKind::Literal
        } else {
            InstKind::AllocRef
        };
        let value = self.value_inst(block, kind, &[], ty);
        scope.objects.push((value, ty));
        Ok(value)
    }

    fn copyable_object(&self, u: &mut Unstructured, scope: &Scope) -> Result<Option<Value>> {
        let candidates: Vec<Value> = scope
            .objects
            .iter()
            .filter(|&&(_, ty)| ty != self.tys.resource)
            .map(|&(v, _)| v)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        Ok(Some(*u.choose(&candidates)?))
    }

    fn call(
        &mut self,
        u: &mut Unstructured,
        block: Block,
        scope: &mut Scope,
        isolated: bool,
    ) -> Result<()> {
        let mut args = Vec::new();
        let mut conventions = Vec::new();
        for _ in 0..u.int_in_range(1..=2)? {
            args.push(self.object(u, block, scope, None)?);
            conventions.push(*u.choose(&[
                ArgumentConvention::DirectGuaranteed,
                ArgumentConvention::DirectOwned,
            ])?);
        }
        let callee = self.callee();
        let mut data = ApplyData::new(&callee, &conventions);
        if isolated {
            data = data.isolated_to(IsolationDomain::GlobalActor(self.tys.main));
            if bool::arbitrary(u)? {
                data = data.transferring_result();
            }
        } else if bool::arbitrary(u)? {
            data = data.transferring_arg(0);
        }
        let kind = InstKind::Apply(Box::new(data));
        if bool::arbitrary(u)? {
            let ty = *u.choose(&[self.tys.klass, self.tys.legacy, self.tys.int])?;
            let result = self.value_inst(block, kind, &args, ty);
            scope.objects.push((result, ty));
        } else {
            self.inst(block, kind, &args, &[]);
        }
        Ok(())
    }

    fn body_inst(&mut self, u: &mut Unstructured, block: Block, scope: &mut Scope) -> Result<()> {
        let klass = self.tys.klass;
        match u.int_in_range(0..=14)? {
            0 => {
                let v = self.value_inst(block, InstKind::AllocRef, &[], klass);
                scope.objects.push((v, klass));
            }
            1 => {
                let v = self.value_inst(block, InstKind::Literal, &[], self.tys.int);
                scope.objects.push((v, self.tys.int));
            }
            2 | 3 => {
                if let Some(src) = self.copyable_object(u, scope)? {
                    let ty = scope.type_of(src, self.tys.klass);
                    let kind = if bool::arbitrary(u)? {
                        InstKind::CopyValue
                    } else {
                        InstKind::MoveValue
                    };
                    let v = self.value_inst(block, kind, &[src], ty);
                    scope.objects.push((v, ty));
                }
            }
            4 => {
                let a = self.object(u, block, scope, Some(klass))?;
                let b = self.object(u, block, scope, Some(klass))?;
                let v = self.value_inst(block, InstKind::Tuple, &[a, b], self.tys.tuple);
                scope.objects.push((v, self.tys.tuple));
            }
            5 => {
                let slot = self.value_inst(block, InstKind::AllocStack, &[], klass);
                let init = self.object(u, block, scope, Some(klass))?;
                self.inst(block, InstKind::Store(StoreKind::Init), &[init, slot], &[]);
                scope.addrs.push((slot, klass));
            }
            6 | 7 | 8 => {
                if scope.addrs.is_empty() {
                    return Ok(());
                }
                let (addr, ty) = *u.choose(&scope.addrs)?;
                match (u.int_in_range(0..=2)?, ty == self.tys.resource) {
                    (0, _) => {
                        let src = self.object(u, block, scope, Some(ty))?;
                        let kind = StoreKind::Assign;
                        self.inst(block, InstKind::Store(kind), &[src, addr], &[]);
                    }
                    (1, false) => {
                        let v = self.value_inst(block, InstKind::Load(LoadKind::Copy), &[addr], ty);
                        scope.objects.push((v, ty));
                    }
                    _ => {
                        let v = self.value_inst(block, InstKind::Load(LoadKind::Take), &[addr], ty);
                        scope.objects.push((v, ty));
                    }
                }
            }
            9 => self.call(u, block, scope, false)?,
            10 => self.call(u, block, scope, true)?,
            11 => {
                let v = self.object(u, block, scope, None)?;
                let to = IsolationDomain::GlobalActor(self.tys.main);
                self.inst(block, InstKind::Transfer { to }, &[v], &[]);
            }
            12 => {
                let v = self.object(u, block, scope, None)?;
                self.inst(block, InstKind::DestroyValue, &[v], &[]);
            }
            13 => {
                if scope.addrs.is_empty() {
                    return Ok(());
                }
                let (addr, ty) = *u.choose(&scope.addrs)?;
                let kind = *u.choose(&[AccessKind::Read, AccessKind::Modify])?;
                let access = self.value_inst(block, InstKind::BeginAccess(kind), &[addr], ty);
                if ty != self.tys.resource {
                    let v = self.value_inst(block, InstKind::Load(LoadKind::Copy), &[access], ty);
                    scope.objects.push((v, ty));
                } else if kind == AccessKind::Modify {
                    let v = self.value_inst(block, InstKind::Load(LoadKind::Take), &[access], ty);
                    scope.objects.push((v, ty));
                    if bool::arbitrary(u)? {
                        self.inst(block, InstKind::Store(StoreKind::Init), &[v, access], &[]);
                    }
                }
                self.inst(block, InstKind::EndAccess, &[access], &[]);
            }
            _ => {
                let captured = self.object(u, block, scope, None)?;
                let data = ClosureData {
                    callee: self.callee(),
                    conventions: [ArgumentConvention::DirectGuaranteed].into_iter().collect(),
                    escaping: bool::arbitrary(u)?,
                };
                let kind = InstKind::PartialApply(Box::new(data));
                let v = self.value_inst(block, kind, &[captured], self.tys.closure);
                scope.objects.push((v, self.tys.closure));
            }
        }
        Ok(())
    }

    /// Arguments for a branch to `dest`, drawn from `scope`.
    fn branch_args(
        &mut self,
        u: &mut Unstructured,
        block: Block,
        scope: &mut Scope,
        block_args: &[Vec<(Value, Type)>],
        dest: Block,
    ) -> Result<Vec<Value>> {
        let mut args = Vec::new();
        for &(_, ty) in &block_args[dest.index()] {
            args.push(self.object(u, block, scope, Some(ty))?);
        }
        Ok(args)
    }
}

impl TestCase {
    pub fn arbitrary_with_options(u: &mut Unstructured, opts: &Options) -> Result<TestCase> {
        let mut types = TypeTable::new();
        let tys = Types::new(&mut types);
        let isolation = *u.choose(&[
            IsolationDomain::Nonisolated,
            IsolationDomain::Task,
            IsolationDomain::GlobalActor(tys.main),
        ])?;
        let mut fg = FuncGen {
            b: FunctionBuilder::new("fuzz", isolation),
            tys,
            opts: *opts,
            line: 0,
            calls: 0,
        };
        fg.b.set_may_run_multiple_times(bool::arbitrary(u)?);

        // Entry arguments dominate every block.
        let mut globals = Scope::default();
        let out = if bool::arbitrary(u)? {
            Some(fg.b.add_indirect_result(tys.klass))
        } else {
            None
        };
        for i in 0..u.int_in_range(0..=3)? {
            let ty = *u.choose(&[tys.klass, tys.int, tys.legacy, tys.tuple])?;
            let conv = *u.choose(&[
                ArgumentConvention::DirectOwned,
                ArgumentConvention::DirectGuaranteed,
            ])?;
            let param = if bool::arbitrary(u)? {
                fg.b.add_transferring_param(ty, conv)
            } else {
                fg.b.add_param(ty, conv)
            };
            fg.b.name_value(param, &format!("p{}", i));
            globals.objects.push((param, ty));
        }
        if bool::arbitrary(u)? {
            let ty = if fg.opts.move_only && bool::arbitrary(u)? {
                tys.resource
            } else {
                tys.klass
            };
            let conv = *u.choose(&[
                ArgumentConvention::IndirectInout,
                ArgumentConvention::IndirectInoutAliasable,
            ])?;
            let param = fg.b.add_param(ty, conv);
            fg.b.name_value(param, "storage");
            globals.addrs.push((param, ty));
        }
        if bool::arbitrary(u)? {
            let this = fg.b.add_self_param(tys.klass, ArgumentConvention::DirectGuaranteed);
            fg.b.name_value(this, "self");
            globals.objects.push((this, tys.klass));
        }

        let num_blocks = if fg.opts.control_flow {
            u.int_in_range(1..=fg.opts.max_blocks.max(1))?
        } else {
            1
        };
        let mut blocks = Vec::with_capacity(num_blocks);
        blocks.push(fg.b.entry_block());
        let mut block_args: Vec<Vec<(Value, Type)>> = Vec::with_capacity(num_blocks);
        block_args.push(Vec::new());
        for _ in 1..num_blocks {
            let block = fg.b.add_block();
            let mut args = Vec::new();
            for _ in 0..u.int_in_range(0..=2)? {
                let ty = *u.choose(&[tys.klass, tys.int])?;
                args.push((fg.b.add_block_arg(block, ty), ty));
            }
            blocks.push(block);
            block_args.push(args);
        }

        for (i, &block) in blocks.iter().enumerate() {
            let mut scope = globals.clone();
            scope.objects.extend_from_slice(&block_args[i]);
            for _ in 0..u.int_in_range(0..=fg.opts.max_insts_per_block)? {
                fg.body_inst(u, block, &mut scope)?;
            }
            if i == 0 {
                // Entry results dominate every other block, as long as
                // nothing branches back to the entry.
                globals = scope.clone();
            }

            // Targets never include the entry block.
            let targets: Vec<Block> = blocks
                .iter()
                .copied()
                .enumerate()
                .filter(|&(j, _)| j > 0 && (fg.opts.loops || j > i))
                .map(|(_, b)| b)
                .collect();
            let choice = if targets.is_empty() {
                0
            } else {
                u.int_in_range(0..=2)?
            };
            match choice {
                0 => {
                    if let Some(out) = out {
                        let v = fg.object(u, block, &mut scope, Some(tys.klass))?;
                        fg.inst(block, InstKind::Store(StoreKind::Init), &[v, out], &[]);
                    }
                    fg.inst(block, InstKind::Return, &[], &[]);
                }
                1 => {
                    let dest = *u.choose(&targets)?;
                    let args = fg.branch_args(u, block, &mut scope, &block_args, dest)?;
                    fg.inst(block, InstKind::Branch { dest }, &args, &[]);
                }
                _ => {
                    let then_dest = *u.choose(&targets)?;
                    let else_dest = *u.choose(&targets)?;
                    let cond = fg.object(u, block, &mut scope, Some(tys.int))?;
                    let then_args = fg.branch_args(u, block, &mut scope, &block_args, then_dest)?;
                    let else_args = fg.branch_args(u, block, &mut scope, &block_args, else_dest)?;
                    let mut operands = Vec::with_capacity(1 + then_args.len() + else_args.len());
                    operands.push(cond);
                    operands.extend_from_slice(&then_args);
                    operands.extend_from_slice(&else_args);
                    let kind = InstKind::CondBranch {
                        then_dest,
                        else_dest,
                        then_args: then_args.len() as u32,
                    };
                    fg.inst(block, kind, &operands, &[]);
                }
            }
        }

        let func = fg
            .b
            .finish()
            .map_err(|_| crate::fuzzing::arbitrary::Error::IncorrectFormat)?;
        Ok(TestCase { types, func })
    }
}

/// Run the checker in both modes and check properties that hold for
/// every well-formed function.
pub fn check(t: TestCase) {
    let f = &t.func;
    let mut outputs = Vec::new();
    for mode in [ConcurrencyMode::Compat, ConcurrencyMode::Strict] {
        let options = CheckerOptions {
            verbose_log: false,
            validate_ssa: true,
            mode,
        };
        let checker = Checker::new(f, &t.types, options).expect("generated function is malformed");
        let output = checker.run();
        for diag in &output.diagnostics {
            assert!(diag.primary.inst.index() < f.num_insts());
            if !diag.kind.is_isolation() {
                assert_eq!(diag.severity, Severity::Error);
            }
        }
        outputs.push(output);
    }

    let ownership = |i: usize| {
        outputs[i]
            .diagnostics
            .iter()
            .filter(|d| !d.kind.is_isolation())
            .count()
    };
    assert_eq!(ownership(0), ownership(1));
    assert!(outputs[1].diagnostics.len() >= outputs[0].diagnostics.len());
    assert!(!outputs[0].has_errors() || ownership(0) > 0);
}
