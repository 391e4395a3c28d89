/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! In-IR test mechanism.
//!
//! A function may carry `specify_test` strings. Each names a routine in a
//! `TestRegistry`, followed by whitespace-separated positional arguments:
//!
//! | syntax                         | argument                          |
//! |--------------------------------|-----------------------------------|
//! | `true`, `false`                | bool                              |
//! | `42`, `-1`                     | int                               |
//! | `@function`                    | the function under test           |
//! | `@block`, `@block[N]`          | the entry block, block N          |
//! | `@block[N].argument[M]`        | argument M of block N             |
//! | `@block[N].instruction[M]`     | the Mth instruction of block N    |
//! | `@instruction[N]`              | instruction N                     |
//! | `@instruction[N].operand[M]`   | operand M of instruction N        |
//! | `@argument[N]`                 | entry block argument N            |
//! | `%N`                           | value N                           |
//! | anything else                  | string                            |
//!
//! The registry is an ordinary value: build one with
//! `TestRegistry::with_default_tests()`, add routines with `register`,
//! and pass it to whoever runs the tests.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::{self, Write};

use crate::classify::Classifier;
use crate::ir::{classify_argument, ArgumentKind, Function, Operand, ValueDef};
use crate::types::TypeOracle;
use crate::{Block, Checker, CheckerOptions, Inst, IrError, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestError {
    /// No routine of this name is registered.
    UnknownTest(String),
    /// An argument could not be parsed, or names something that does
    /// not exist in the function.
    Parse(String),
    /// An argument of the wrong kind was supplied.
    ArgumentMismatch {
        expected: &'static str,
        found: String,
    },
    /// Fewer arguments than the routine takes.
    MissingArgument(&'static str),
    /// Arguments left over after the routine returned.
    ExtraArguments(usize),
    /// The function under test is malformed.
    Ir(IrError),
    /// Writing the test output failed.
    Output,
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TestError {}

impl From<IrError> for TestError {
    fn from(err: IrError) -> Self {
        TestError::Ir(err)
    }
}

impl From<fmt::Error> for TestError {
    fn from(_: fmt::Error) -> Self {
        TestError::Output
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestArgument {
    String(String),
    Bool(bool),
    Int(i64),
    Function,
    Block(Block),
    Inst(Inst),
    Value(Value),
    Operand(Operand),
}

/// Split `@block[3]` into `("block", Some(3))`.
fn parse_segment(segment: &str) -> Result<(&str, Option<usize>), TestError> {
    let Some(open) = segment.find('[') else {
        return Ok((segment, None));
    };
    let index = segment[open + 1..]
        .strip_suffix(']')
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| TestError::Parse(segment.to_string()))?;
    Ok((&segment[..open], Some(index)))
}

impl TestArgument {
    /// Parse one argument token against `f`.
    pub fn parse(f: &Function, token: &str) -> Result<TestArgument, TestError> {
        let bad = || TestError::Parse(token.to_string());
        match token {
            "true" => return Ok(TestArgument::Bool(true)),
            "false" => return Ok(TestArgument::Bool(false)),
            "@function" => return Ok(TestArgument::Function),
            _ => {}
        }
        if let Ok(n) = token.parse::<i64>() {
            return Ok(TestArgument::Int(n));
        }
        if let Some(n) = token.strip_prefix('%') {
            let n: usize = n.parse().map_err(|_| bad())?;
            if n >= f.num_values() {
                return Err(bad());
            }
            return Ok(TestArgument::Value(Value::new(n)));
        }
        if !token.starts_with('@') {
            return Ok(TestArgument::String(token.to_string()));
        }

        let mut segments = token[1..].split('.');
        let (head, index) = parse_segment(segments.next().ok_or_else(bad)?)?;
        let tail = match segments.next() {
            Some(segment) => Some(parse_segment(segment)?),
            None => None,
        };
        if segments.next().is_some() {
            return Err(bad());
        }

        match (head, index, tail) {
            ("block", index, tail) => {
                let block = Block::new(index.unwrap_or(0));
                if block.index() >= f.num_blocks() {
                    return Err(bad());
                }
                match tail {
                    None => Ok(TestArgument::Block(block)),
                    Some(("argument", Some(m))) => f
                        .block_args(block)
                        .get(m)
                        .map(|&v| TestArgument::Value(v))
                        .ok_or_else(bad),
                    Some(("instruction", Some(m))) => f
                        .instructions(block)
                        .nth(m)
                        .map(TestArgument::Inst)
                        .ok_or_else(bad),
                    Some(_) => Err(bad()),
                }
            }
            ("instruction", Some(n), tail) => {
                let inst = Inst::new(n);
                if n >= f.num_insts() || f.is_deleted(inst) {
                    return Err(bad());
                }
                match tail {
                    None => Ok(TestArgument::Inst(inst)),
                    Some(("operand", Some(m))) if m < f.inst_operands(inst).len() => {
                        Ok(TestArgument::Operand(f.operand(inst, m)))
                    }
                    Some(_) => Err(bad()),
                }
            }
            ("argument", Some(n), None) => f
                .block_args(f.entry_block())
                .get(n)
                .map(|&v| TestArgument::Value(v))
                .ok_or_else(bad),
            _ => Err(bad()),
        }
    }
}

/// The positional arguments of one test invocation, consumed in order.
#[derive(Clone, Debug, Default)]
pub struct TestArguments {
    args: Vec<TestArgument>,
    next: usize,
}

macro_rules! take_fns {
    ($($name:ident, $variant:ident, $ty:ty, $expected:literal;)*) => {
        $(
            pub fn $name(&mut self) -> Result<$ty, TestError> {
                match self.take($expected)? {
                    TestArgument::$variant(x) => Ok(x),
                    other => Err(TestError::ArgumentMismatch {
                        expected: $expected,
                        found: format!("{:?}", other),
                    }),
                }
            }
        )*
    };
}

impl TestArguments {
    /// Parse every token of `tokens` against `f`.
    pub fn parse<'t>(
        f: &Function,
        tokens: impl Iterator<Item = &'t str>,
    ) -> Result<TestArguments, TestError> {
        let args = tokens
            .map(|token| TestArgument::parse(f, token))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TestArguments { args, next: 0 })
    }

    pub fn remaining(&self) -> usize {
        self.args.len() - self.next
    }

    fn take(&mut self, expected: &'static str) -> Result<TestArgument, TestError> {
        let arg = self
            .args
            .get(self.next)
            .cloned()
            .ok_or(TestError::MissingArgument(expected))?;
        self.next += 1;
        Ok(arg)
    }

    take_fns! {
        take_string, String, String, "string";
        take_bool, Bool, bool, "bool";
        take_int, Int, i64, "int";
        take_block, Block, Block, "block";
        take_inst, Inst, Inst, "instruction";
        take_value, Value, Value, "value";
        take_operand, Operand, Operand, "operand";
    }

    pub fn take_function(&mut self) -> Result<(), TestError> {
        match self.take("function")? {
            TestArgument::Function => Ok(()),
            other => Err(TestError::ArgumentMismatch {
                expected: "function",
                found: format!("{:?}", other),
            }),
        }
    }
}

/// What a test routine sees: the function under test and somewhere to
/// print.
pub struct TestContext<'a> {
    pub function: &'a Function,
    pub oracle: &'a dyn TypeOracle,
    pub options: CheckerOptions,
    pub out: String,
}

impl<'a> TestContext<'a> {
    pub fn new(function: &'a Function, oracle: &'a dyn TypeOracle, options: CheckerOptions) -> Self {
        TestContext {
            function,
            oracle,
            options,
            out: String::new(),
        }
    }
}

pub type TestFn = fn(&mut TestContext<'_>, &mut TestArguments) -> Result<(), TestError>;

/// Named test routines.
#[derive(Clone, Default)]
pub struct TestRegistry {
    tests: BTreeMap<&'static str, TestFn>,
}

impl TestRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the routines this crate provides.
    pub fn with_default_tests() -> Self {
        let mut registry = Self::new();
        registry.register("dump_partition", dump_partition);
        registry.register("phi", phi);
        registry.register("argument_conventions", argument_conventions);
        registry.register("cfg", cfg);
        registry.register("classify", classify);
        registry.register("check", check);
        registry.register("opcode_count", opcode_count);
        registry
    }

    /// Add a routine, replacing any previous one of the same name.
    pub fn register(&mut self, name: &'static str, test: TestFn) {
        self.tests.insert(name, test);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tests.keys().copied()
    }

    /// Run one `specify_test` string.
    pub fn run(&self, ctx: &mut TestContext<'_>, spec: &str) -> Result<(), TestError> {
        let mut tokens = spec.split_whitespace();
        let name = tokens.next().unwrap_or("");
        let test = self
            .tests
            .get(name)
            .ok_or_else(|| TestError::UnknownTest(name.to_string()))?;
        let mut args = TestArguments::parse(ctx.function, tokens)?;
        trace!("running test '{}' on {}", spec, ctx.function.name);
        test(ctx, &mut args)?;
        match args.remaining() {
            0 => Ok(()),
            n => Err(TestError::ExtraArguments(n)),
        }
    }

    /// Run every test embedded in `function` and return the combined
    /// output.
    pub fn run_all(
        &self,
        function: &Function,
        oracle: &dyn TypeOracle,
        options: CheckerOptions,
    ) -> Result<String, TestError> {
        let mut ctx = TestContext::new(function, oracle, options);
        let count = function.test_specs.len();
        for (i, spec) in function.test_specs.iter().enumerate() {
            writeln!(
                ctx.out,
                "begin running test {} of {} on {}: {}",
                i + 1,
                count,
                function.name,
                spec
            )?;
            self.run(&mut ctx, spec)?;
            writeln!(
                ctx.out,
                "end running test {} of {} on {}: {}",
                i + 1,
                count,
                function.name,
                spec
            )?;
        }
        Ok(ctx.out)
    }
}

/// `dump_partition <instruction>`: the region state right before an
/// instruction.
fn dump_partition(ctx: &mut TestContext<'_>, args: &mut TestArguments) -> Result<(), TestError> {
    let inst = args.take_inst()?;
    let mut checker = Checker::new(ctx.function, ctx.oracle, ctx.options)?;
    checker.analyze();
    match checker.state_before(inst) {
        Some(state) => writeln!(ctx.out, "before {:?}: {}", inst, state)?,
        None => writeln!(ctx.out, "before {:?}: unreachable", inst)?,
    }
    Ok(())
}

/// `phi <value>`: what a block argument is and what flows into it.
fn phi(ctx: &mut TestContext<'_>, args: &mut TestArguments) -> Result<(), TestError> {
    let f = ctx.function;
    let value = args.take_value()?;
    let ValueDef::Argument { block, index } = f.values[value].def else {
        return Err(TestError::ArgumentMismatch {
            expected: "block argument",
            found: format!("{}", value),
        });
    };
    match classify_argument(f, value) {
        ArgumentKind::FunctionEntry { index } => {
            let conv = f.argument_conventions()[index];
            writeln!(ctx.out, "{}: function argument {} {}", value, index, conv)?;
        }
        ArgumentKind::Phi(phi) => {
            writeln!(
                ctx.out,
                "{}: phi of {}, incoming {} from {}",
                value,
                phi.block,
                phi.incoming_value(),
                phi.pred
            )?;
        }
        ArgumentKind::TerminatorResult(result) => {
            let which = if result.is_error(f) { "error" } else { "normal" };
            writeln!(
                ctx.out,
                "{}: {} result of {}",
                value,
                which,
                f.display_inst(result.terminator)
            )?;
        }
        ArgumentKind::Merge => {
            write!(ctx.out, "{}: merge in {}:", value, block)?;
            for (pred, succ_idx) in f.predecessor_edges(block) {
                match f.successor_args(pred, succ_idx).get(index as usize) {
                    Some(incoming) => write!(ctx.out, " {} from {}", incoming, pred)?,
                    None => write!(ctx.out, " ? from {}", pred)?,
                }
            }
            writeln!(ctx.out)?;
        }
    }
    Ok(())
}

/// `argument_conventions @function`
fn argument_conventions(
    ctx: &mut TestContext<'_>,
    args: &mut TestArguments,
) -> Result<(), TestError> {
    args.take_function()?;
    let convs = ctx.function.argument_conventions();
    for (i, conv) in convs.iter().enumerate() {
        write!(ctx.out, "[{}] {}", i, conv)?;
        if convs.self_index() == Some(i) {
            write!(ctx.out, " self")?;
        }
        if convs.is_transferring(i) {
            write!(ctx.out, " transferring")?;
        }
        writeln!(ctx.out)?;
    }
    writeln!(
        ctx.out,
        "first parameter: {}, end: {}",
        convs.first_parameter_index(),
        convs.end_index()
    )?;
    Ok(())
}

fn cfg(ctx: &mut TestContext<'_>, args: &mut TestArguments) -> Result<(), TestError> {
    let f = ctx.function;
    let block = args.take_block()?;
    writeln!(
        ctx.out,
        "{}: succs {:?} preds {:?}",
        block,
        f.successors(block).as_slice(),
        f.predecessors(block).as_slice()
    )?;
    Ok(())
}

/// `classify <instruction>`: the region ops of an instruction.
fn classify(ctx: &mut TestContext<'_>, args: &mut TestArguments) -> Result<(), TestError> {
    let inst = args.take_inst()?;
    let mut ops = Vec::new();
    Classifier::new(ctx.function, ctx.oracle).classify_inst(inst, &mut ops);
    writeln!(ctx.out, "{}", ctx.function.display_inst(inst))?;
    for op in ops {
        writeln!(ctx.out, "  {:?}", op)?;
    }
    Ok(())
}

/// `check`: run the checker and print every diagnostic.
fn check(ctx: &mut TestContext<'_>, _args: &mut TestArguments) -> Result<(), TestError> {
    let output = Checker::new(ctx.function, ctx.oracle, ctx.options)?.run();
    if output.diagnostics.is_empty() {
        writeln!(ctx.out, "no diagnostics")?;
    }
    for diag in &output.diagnostics {
        writeln!(ctx.out, "{}", diag)?;
    }
    Ok(())
}

fn opcode_count(ctx: &mut TestContext<'_>, args: &mut TestArguments) -> Result<(), TestError> {
    args.take_function()?;
    let f = ctx.function;
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for block in f.blocks.keys() {
        for inst in f.instructions(block) {
            *counts.entry(f.inst_kind(inst).opcode().name()).or_default() += 1;
        }
    }
    for (name, count) in counts {
        writeln!(ctx.out, "{}: {}", name, count)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{ApplyData, ArgumentConvention, FunctionBuilder, InstKind};
    use crate::isolation::IsolationDomain;
    use crate::types::{TypeData, TypeKind, TypeTable};
    use alloc::boxed::Box;

    fn diamond(types: &mut TypeTable) -> Function {
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let int = types.add(TypeData::new("Int", TypeKind::Builtin));
        let mut b = FunctionBuilder::new("diamond", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        let p = b.add_param(klass, ArgumentConvention::DirectGuaranteed);
        b.name_value(p, "p");
        let left = b.add_block();
        let right = b.add_block();
        let join = b.add_block();
        let arg = b.add_block_arg(join, klass);
        let c = b.add_value_inst(entry, InstKind::Literal, &[], int);
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
        b.add_inst(left, InstKind::Branch { dest: join }, &[x], &[]);
        b.add_inst(right, InstKind::Branch { dest: join }, &[p], &[]);
        let data = ApplyData::new("use", &[ArgumentConvention::DirectGuaranteed]);
        b.add_inst(join, InstKind::Apply(Box::new(data)), &[arg], &[]);
        b.add_inst(join, InstKind::Return, &[], &[]);
        b.add_test_spec("cfg @block[3]");
        b.add_test_spec("phi @block[3].argument[0]");
        b.finish().unwrap()
    }

    #[test]
    fn test_parse_arguments() {
        let mut types = TypeTable::new();
        let f = diamond(&mut types);
        let parse = |token| TestArgument::parse(&f, token);
        assert_eq!(parse("true"), Ok(TestArgument::Bool(true)));
        assert_eq!(parse("-3"), Ok(TestArgument::Int(-3)));
        assert_eq!(parse("hello"), Ok(TestArgument::String("hello".into())));
        assert_eq!(parse("@function"), Ok(TestArgument::Function));
        assert_eq!(parse("@block"), Ok(TestArgument::Block(Block::new(0))));
        assert_eq!(parse("@block[2]"), Ok(TestArgument::Block(Block::new(2))));
        assert_eq!(
            parse("@block[3].argument[0]"),
            Ok(TestArgument::Value(f.block_args(Block::new(3))[0]))
        );
        assert_eq!(
            parse("@block[1].instruction[1]"),
            Ok(TestArgument::Inst(Inst::new(3)))
        );
        assert_eq!(parse("@argument[0]"), Ok(TestArgument::Value(Value::new(0))));
        assert_eq!(parse("%2"), Ok(TestArgument::Value(Value::new(2))));
        assert_eq!(
            parse("@instruction[5].operand[0]"),
            Ok(TestArgument::Operand(f.operand(Inst::new(5), 0)))
        );
        assert!(matches!(parse("@block[9]"), Err(TestError::Parse(_))));
        assert!(matches!(parse("@block[1"), Err(TestError::Parse(_))));
        assert!(matches!(parse("%99"), Err(TestError::Parse(_))));
        assert!(matches!(parse("@bogus"), Err(TestError::Parse(_))));
    }

    #[test]
    fn test_run_all() {
        let mut types = TypeTable::new();
        let f = diamond(&mut types);
        let registry = TestRegistry::with_default_tests();
        let out = registry
            .run_all(&f, &types, CheckerOptions::default())
            .unwrap();
        let expected = "\
begin running test 1 of 2 on diamond: cfg @block[3]
bb3: succs [] preds [bb1, bb2]
end running test 1 of 2 on diamond: cfg @block[3]
begin running test 2 of 2 on diamond: phi @block[3].argument[0]
%1: merge in bb3: %3 from bb1 %0 from bb2
end running test 2 of 2 on diamond: phi @block[3].argument[0]
";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_run_errors() {
        let mut types = TypeTable::new();
        let f = diamond(&mut types);
        let registry = TestRegistry::with_default_tests();
        let mut ctx = TestContext::new(&f, &types, CheckerOptions::default());
        assert_eq!(
            registry.run(&mut ctx, "no_such_test"),
            Err(TestError::UnknownTest("no_such_test".into()))
        );
        assert_eq!(
            registry.run(&mut ctx, "cfg @function"),
            Err(TestError::ArgumentMismatch {
                expected: "block",
                found: "Function".into(),
            })
        );
        assert_eq!(
            registry.run(&mut ctx, "cfg"),
            Err(TestError::MissingArgument("block"))
        );
        assert_eq!(
            registry.run(&mut ctx, "cfg @block 7"),
            Err(TestError::ExtraArguments(1))
        );
    }

    #[test]
    fn test_custom_routine() {
        fn count_blocks(ctx: &mut TestContext<'_>, _: &mut TestArguments) -> Result<(), TestError> {
            writeln!(ctx.out, "{}", ctx.function.num_blocks())?;
            Ok(())
        }
        let mut types = TypeTable::new();
        let f = diamond(&mut types);
        let mut registry = TestRegistry::new();
        registry.register("count_blocks", count_blocks);
        let mut ctx = TestContext::new(&f, &types, CheckerOptions::default());
        registry.run(&mut ctx, "count_blocks").unwrap();
        registry.run(&mut ctx, "count_blocks").unwrap();
        assert_eq!(ctx.out, "4\n4\n");
    }

    #[test]
    fn test_check_and_dump_partition() {
        let mut types = TypeTable::new();
        let f = diamond(&mut types);
        let registry = TestRegistry::with_default_tests();
        let mut ctx = TestContext::new(&f, &types, CheckerOptions::default());
        registry.run(&mut ctx, "check").unwrap();
        registry.run(&mut ctx, "dump_partition @block[3].instruction[0]").unwrap();
        assert_eq!(ctx.out, "no diagnostics\nbefore inst5: [{%1}(pinned)]\n");
    }
}
