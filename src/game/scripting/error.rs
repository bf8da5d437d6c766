use thiserror::Error;

/// A compile failure, with enough context to point at the offending source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("script error in file '{file}' line {line} column {column}\n    {message}\n{excerpt}")]
pub struct CompileError {
    pub message: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
    /// Previous and current source line, with a caret under the column
    pub excerpt: String,
}

/// A runtime failure. Always ends the script instance that raised it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("no player attached for player variable '{0}'")]
    NoPlayerAttached(String),

    #[error("player not attached")]
    PlayerNotAttached,

    #[error("no instance attached for instance variable '{0}'")]
    NoInstanceAttached(String),

    #[error("{0}: not a variable")]
    NotAVariable(&'static str),

    #[error("{0}: not a label")]
    NotALabel(&'static str),

    #[error("cannot modify '{0}'")]
    ReadOnly(String),

    #[error("variable name '{0}' is too long")]
    NameTooLong(String),

    #[error("invalid data for operator {0}")]
    InvalidOperands(&'static str),

    #[error("invalid operator {0} for strings")]
    InvalidStringOperator(&'static str),

    #[error("division by zero detected op={op} i1={lhs}")]
    DivisionByZero { op: &'static str, lhs: i64 },

    #[error("index out of range ({0})")]
    IndexOutOfRange(i64),

    #[error("argument is not a number ({0})")]
    NotANumber(&'static str),

    #[error("function not found! [{0}]")]
    FunctionNotFound(String),

    #[error("no callfunc or callsub!")]
    NotInFunction,

    #[error("run_func: C_ARG not found. please report this!!!")]
    ArgMarkerNotFound,

    #[error("run_func: not a builtin function")]
    NotAFunction,

    #[error("a return frame cannot be copied")]
    RetInfoCopy,

    #[error("stack corrupted: {0}")]
    StackCorrupted(&'static str),

    #[error("unknown command {0}")]
    UnknownCommand(u32),

    #[error("infinity loop")]
    InfiniteLoop,

    #[error("{name}: {message}")]
    Builtin { name: &'static str, message: String },
}

impl RuntimeError {
    pub fn builtin(name: &'static str, message: impl Into<String>) -> Self {
        RuntimeError::Builtin { name, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = CompileError {
            message: "unexpected character".to_string(),
            file: "npc/test.txt".to_string(),
            line: 3,
            column: 5,
            excerpt: "  2: mes \"a\";\n* 3: mes ?\n          ^".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("npc/test.txt"));
        assert!(text.contains("line 3 column 5"));
        assert!(text.contains("unexpected character"));
    }

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::DivisionByZero { op: "C_DIV", lhs: 4 };
        assert_eq!(err.to_string(), "division by zero detected op=C_DIV i1=4");
        let err = RuntimeError::builtin("menu", "illegal number of arguments");
        assert_eq!(err.to_string(), "menu: illegal number of arguments");
    }
}
