//! Runtime error taxonomy.
//!
//! A [`RuntimeError`] carries the triggering message plus a snapshot of the
//! call stack at the moment it was raised, rendered innermost-frame-first as
//! `[line N] in <function or script>: <message>`.

use std::error::Error;
use std::fmt;

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub line: u32,
    pub function_name: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    /// Innermost frame first.
    pub frames: Vec<StackFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, frames: Vec<StackFrame>) -> Self {
        RuntimeError {
            message: message.into(),
            frames,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.frames {
            let where_ = if frame.function_name.is_empty() {
                "script".to_string()
            } else {
                format!("{}()", frame.function_name)
            };
            writeln!(f, "[line {}] in {}", frame.line, where_)?;
        }
        Ok(())
    }
}

impl Error for RuntimeError {}
