pub mod format;
pub mod opcodes;
pub mod instruction;

pub use format::{Format, IndexKind, Opcode, OpcodeFlags};
pub use instruction::{Instruction, InstructionIter};
pub use opcodes::{instruction_descriptor, OPCODES};
