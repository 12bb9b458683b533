//! Exception delivery across interpreter and compiled frames, and the
//! deoptimization that turns compiled frames back into interpreter frames.

pub mod deopt;
pub mod handler;

pub use deopt::{deoptimize_partial_fragment, deoptimize_single_frame, DeoptimizationKind, DeoptimizationStats};
pub use handler::{deliver_exception, find_catch, LongJumpContext};
