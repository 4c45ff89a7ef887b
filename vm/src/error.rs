use thiserror::Error;

/// Failure conditions surfaced by the execution core.
///
/// Every condition here is detected locally and reported through the error
/// return path of the operation that discovered it. The thread runner is the
/// single point that decides what a surfaced error means for the thread and
/// the process.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("stack underflow in {class}.{method} at pc {pc}: pop on an empty operand stack")]
    StackUnderflow {
        class: String,
        method: String,
        pc: usize,
    },

    #[error("stack overflow in {class}.{method} at pc {pc}: operand stack limit {limit} exceeded")]
    StackOverflow {
        class: String,
        method: String,
        pc: usize,
        limit: usize,
    },

    #[error("division by zero in {class}.{method} at pc {pc}")]
    DivisionByZero {
        class: String,
        method: String,
        pc: usize,
    },

    #[error("invalid bytecode 0x{opcode:02x} at pc {pc} in {class}.{method}")]
    InvalidBytecode {
        class: String,
        method: String,
        pc: usize,
        opcode: u8,
    },

    #[error("expected a {expected} at constant pool index {index}, found a {actual}")]
    ConstantPoolTypeMismatch {
        index: u16,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to acquire monitor for {method} at pc {pc}")]
    MonitorAcquisitionFailure { method: String, pc: usize },

    #[error("method {class}.{name}{descriptor} not found")]
    MethodNotFound {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("field {field} is {actual} but was accessed as {accessed}")]
    FieldAccessMismatch {
        field: String,
        accessed: &'static str,
        actual: &'static str,
    },

    #[error("field {field} holds a {declared} but was accessed with a {provided}")]
    FieldTypeMismatch {
        field: String,
        declared: &'static str,
        provided: &'static str,
    },

    #[error("uncaught exception {class}: {message}")]
    ApplicationException { class: String, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExecError {
    /// True for errors that represent a Java-level exception rather than a
    /// fault in the interpreted program's execution machinery.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::ApplicationException { .. })
    }
}

#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::error::ExecError::Internal(anyhow::anyhow!($($arg)*))
    };
}

/// A Java-level exception about to leave the interpreter.
#[derive(Debug, Clone)]
pub struct RaisedException {
    pub class: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The host exception mechanism took over and repositioned execution.
    Caught,
    /// No handler applies; the exception surfaces to the thread runner.
    Uncaught,
}

/// Exception-raising capability handed to the core at construction time.
///
/// The interpreter offers every raised exception to this boundary before
/// treating it as fatal to the thread.
pub trait ExceptionHandler: Send + Sync {
    fn raise(&self, exception: &RaisedException, stack_trace: &str) -> HandlerOutcome;
}

/// Default handler: no Java-level handler table, every throw surfaces.
pub struct AbortOnThrow;

impl ExceptionHandler for AbortOnThrow {
    fn raise(&self, _exception: &RaisedException, _stack_trace: &str) -> HandlerOutcome {
        HandlerOutcome::Uncaught
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underflow_message() {
        let err = ExecError::StackUnderflow {
            class: "Main".to_string(),
            method: "main".to_string(),
            pc: 7,
        };
        let rendered = format!("{err}");
        assert!(rendered.contains("stack underflow"));
        assert!(rendered.contains("Main.main"));
        assert!(rendered.contains("7"));
    }

    #[test]
    fn test_overflow_names_limit() {
        let err = ExecError::StackOverflow {
            class: "Main".to_string(),
            method: "main".to_string(),
            pc: 0,
            limit: 12,
        };
        assert!(format!("{err}").contains("12"));
    }

    #[test]
    fn test_invalid_bytecode_names_opcode_and_pc() {
        let err = ExecError::InvalidBytecode {
            class: "Main".to_string(),
            method: "main".to_string(),
            pc: 3,
            opcode: 0xcb,
        };
        let rendered = format!("{err}");
        assert!(rendered.contains("0xcb"));
        assert!(rendered.contains("pc 3"));
    }

    #[test]
    fn test_application_predicate() {
        let err = ExecError::ApplicationException {
            class: "java/lang/IllegalStateException".to_string(),
            message: "bad state".to_string(),
        };
        assert!(err.is_application());
        assert!(!internal!("defect").is_application());
    }
}
