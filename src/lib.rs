//! # dexcore
//!
//! The core of a runtime that executes DEX bytecode: loading and verifying
//! dex containers, describing the instruction set, the thread suspension
//! protocol, stack walking, exception delivery and deoptimization, plus a
//! small interpreter to drive it all.
//!
//! ```no_run
//!  use dexcore::dex::{DexContainer, LoadOptions};
//!
//!  let bytes = std::fs::read("classes.dex").unwrap();
//!  let container = DexContainer::open(&bytes, &LoadOptions::default()).unwrap();
//!  for dex in container.files() {
//!      println!("{} classes", dex.num_class_defs());
//!  }
//! ```

#[macro_use]
pub mod dex;

pub mod bytecode;
pub mod exception;
pub mod interpreter;
pub mod runtime;
pub mod stack;

#[cfg(test)]
mod tests;
