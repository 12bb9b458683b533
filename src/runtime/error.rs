use std::fmt;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Failures raised while executing managed code or coordinating threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    StackTooSmall { size: usize, required: usize },
    StackOverflow,
    OutOfMemory { requested: usize },
    SuspendTimeout { thread_id: u32, waited_ms: u64 },
    BarrierMagicMismatch { found: u32 },
    LockLevelViolation { acquiring: &'static str, held: &'static str },
    ThreadNotAttached,
    ThreadDied { thread_id: u32 },
    UnhandledException { thread_id: u32, class: u32 },
    NotDeoptimizable { method: String },
    InvalidBytecode { method: String, dex_pc: u32 },
    /// Internal: a checkpoint slot was occupied, the closure went to the overflow queue.
    CheckpointAlreadyInstalled,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StackTooSmall { size, required } => {
                write!(f, "stack of {size} bytes is too small, need at least {required}")
            }
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::OutOfMemory { requested } => write!(f, "out of memory allocating {requested} bytes"),
            RuntimeError::SuspendTimeout { thread_id, waited_ms } => {
                write!(f, "thread {thread_id} did not suspend within {waited_ms} ms")
            }
            RuntimeError::BarrierMagicMismatch { found } => write!(f, "suspend barrier magic 0x{found:08x} is corrupt"),
            RuntimeError::LockLevelViolation { acquiring, held } => {
                write!(f, "acquiring {acquiring} while holding {held} violates lock ordering")
            }
            RuntimeError::ThreadNotAttached => write!(f, "current thread is not attached to the runtime"),
            RuntimeError::ThreadDied { thread_id } => write!(f, "thread {thread_id} exited"),
            RuntimeError::UnhandledException { thread_id, class } => {
                write!(f, "uncaught exception of class #{class} on thread {thread_id}")
            }
            RuntimeError::NotDeoptimizable { method } => write!(f, "{method} cannot be deoptimized"),
            RuntimeError::InvalidBytecode { method, dex_pc } => write!(f, "invalid instruction in {method} at dex pc {dex_pc}"),
            RuntimeError::CheckpointAlreadyInstalled => write!(f, "checkpoint already installed"),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure()
    {
        let e = RuntimeError::SuspendTimeout { thread_id: 3, waited_ms: 500 };
        assert_eq!(e.to_string(), "thread 3 did not suspend within 500 ms");
        let e = RuntimeError::StackTooSmall { size: 4096, required: 8192 };
        assert!(e.to_string().contains("4096"));
    }
}
