/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use regionck::fuzzing::fuzz_target;
use regionck::fuzzing::partition;

fuzz_target!(|test_case: partition::TestCase| {
    let _ = env_logger::try_init();
    partition::check(test_case);
});
