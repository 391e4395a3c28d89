/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Internal API exposed for the fuzz targets.

pub use libfuzzer_sys::{arbitrary, fuzz_target};

pub mod func;
pub mod partition;
