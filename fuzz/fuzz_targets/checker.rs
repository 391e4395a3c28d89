/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use regionck::fuzzing::fuzz_target;
use regionck::fuzzing::func;

fuzz_target!(|test_case: func::TestCase| {
    let _ = env_logger::try_init();
    log::trace!("function:\n{}", test_case.func);
    func::check(test_case);
});
