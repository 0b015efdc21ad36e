//! Display-only view of the runner's call stack.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A variable as shown to the user. Holds no reference back to runner memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Variable name.
    pub name: String,
    /// Type name as the runner spells it.
    #[serde(rename = "type")]
    pub type_label: String,
    /// Display form. Strings are quoted.
    pub value: String,
}

/// One frame of the runner's stack. Frames are always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Script label.
    pub file: String,
    /// 1-based.
    pub line: u32,
    /// `<module>` for top-level code.
    pub function: String,
    /// Locals of the frame, in definition order.
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Variable {
    /// A variable with the given name, type and display value.
    pub fn new(name: impl Into<String>, type_label: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), type_label: type_label.into(), value: value.into() }
    }
}

impl StackFrame {
    /// Look up a variable by name.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.function, self.file, self.line)
    }
}
