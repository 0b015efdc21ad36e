//! The runner's teaching script language.
//!
//! One statement per line:
//!
//! ```text
//! # comment
//! let count = 3
//! let name = "pico"
//! fn blink
//!   print blinking {name}
//!   sleep 100
//! end
//! call blink
//! fail something went wrong
//! exit 2
//! ```

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// A parse or runtime error, tied to a source line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ScriptError {
    /// 1-based source line.
    pub line: u32,
    /// What went wrong.
    pub message: String,
}

impl ScriptError {
    fn new(line: u32, message: impl Into<String>) -> Self {
        Self { line, message: message.into() }
    }
}

/// A runtime value. Shown to the debugger as a `(type, display)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// Double-quoted string literal.
    Str(String),
}

impl Value {
    /// Type name shown in the variables view.
    pub fn type_label(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
        }
    }

    /// Debugger representation: strings are quoted.
    pub fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("{s:?}"),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Right-hand side of a `let`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(Value),
    /// A variable reference.
    Var(String),
}

/// The statements the language knows.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Text with `{name}` placeholders.
    Print(String),
    /// `let name = value`.
    Let { name: String, value: Expr },
    /// `call name`.
    Call(String),
    /// `sleep ms`.
    Sleep(u64),
    /// `fail message`: raise a runtime error.
    Fail(String),
    /// `exit code`.
    Exit(i32),
}

/// One statement and the line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// 1-based source line.
    pub line: u32,
    /// What the statement does.
    pub kind: StmtKind,
}

/// A `fn name ... end` block.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Function name, as used by `call`.
    pub name: String,
    /// Line of the `fn` header.
    pub line: u32,
    /// Statements between the header and `end`.
    pub body: Vec<Stmt>,
}

/// A parsed script: top-level statements plus function definitions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    /// Top-level statements, in source order.
    pub body: Vec<Stmt>,
    /// Functions by name.
    pub functions: HashMap<String, Function>,
}

impl Script {
    /// Parse a whole script. Fails on the first bad line.
    pub fn parse(source: &str) -> Result<Self, ScriptError> {
        let mut script = Script::default();
        let mut open: Option<Function> = None;

        for (index, raw) in source.lines().enumerate() {
            let line = u32::try_from(index + 1).map_err(|_| ScriptError::new(u32::MAX, "script too long"))?;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let (word, rest) = match text.split_once(char::is_whitespace) {
                Some((word, rest)) => (word, rest.trim()),
                None => (text, ""),
            };

            match word {
                "fn" => {
                    if open.is_some() {
                        return Err(ScriptError::new(line, "nested `fn` is not allowed"));
                    }
                    let name = identifier(rest, line)?;
                    if script.functions.contains_key(name) {
                        return Err(ScriptError::new(line, format!("function `{name}` defined twice")));
                    }
                    open = Some(Function { name: name.to_string(), line, body: Vec::new() });
                }
                "end" => {
                    let function = open.take().ok_or_else(|| ScriptError::new(line, "`end` without `fn`"))?;
                    script.functions.insert(function.name.clone(), function);
                }
                _ => {
                    let stmt = Stmt { line, kind: statement(word, rest, line)? };
                    match open.as_mut() {
                        Some(function) => function.body.push(stmt),
                        None => script.body.push(stmt),
                    }
                }
            }
        }

        if let Some(function) = open {
            return Err(ScriptError::new(function.line, format!("function `{}` has no `end`", function.name)));
        }
        script.check_calls()?;
        Ok(script)
    }

    /// Line of the first statement that would run, if any.
    pub fn first_line(&self) -> Option<u32> {
        self.body.first().map(|s| s.line)
    }

    fn check_calls(&self) -> Result<(), ScriptError> {
        let bodies = std::iter::once(&self.body).chain(self.functions.values().map(|f| &f.body));
        for stmt in bodies.flatten() {
            if let StmtKind::Call(name) = &stmt.kind {
                if !self.functions.contains_key(name) {
                    return Err(ScriptError::new(stmt.line, format!("unknown function `{name}`")));
                }
            }
        }
        Ok(())
    }
}

fn identifier(text: &str, line: u32) -> Result<&str, ScriptError> {
    let valid = text.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(text)
    } else {
        Err(ScriptError::new(line, format!("`{text}` is not a valid name")))
    }
}

fn statement(word: &str, rest: &str, line: u32) -> Result<StmtKind, ScriptError> {
    match word {
        "print" => Ok(StmtKind::Print(rest.to_string())),
        "let" => {
            let (name, value) =
                rest.split_once('=').ok_or_else(|| ScriptError::new(line, "expected `let NAME = VALUE`"))?;
            Ok(StmtKind::Let { name: identifier(name.trim(), line)?.to_string(), value: expr(value.trim(), line)? })
        }
        "call" => Ok(StmtKind::Call(identifier(rest, line)?.to_string())),
        "sleep" => rest
            .parse()
            .map(StmtKind::Sleep)
            .map_err(|_| ScriptError::new(line, format!("`{rest}` is not a millisecond count"))),
        "fail" => Ok(StmtKind::Fail(rest.to_string())),
        "exit" => rest
            .parse()
            .map(StmtKind::Exit)
            .map_err(|_| ScriptError::new(line, format!("`{rest}` is not an exit code"))),
        other => Err(ScriptError::new(line, format!("unknown statement `{other}`"))),
    }
}

fn expr(text: &str, line: u32) -> Result<Expr, ScriptError> {
    if let Some(inner) = text.strip_prefix('"') {
        let body = inner.strip_suffix('"').ok_or_else(|| ScriptError::new(line, "unterminated string"))?;
        return Ok(Expr::Literal(Value::Str(body.to_string())));
    }
    if let Ok(v) = text.parse::<i64>() {
        return Ok(Expr::Literal(Value::Int(v)));
    }
    if let Ok(v) = text.parse::<f64>() {
        if v.is_finite() {
            return Ok(Expr::Literal(Value::Float(v)));
        }
    }
    identifier(text, line).map(|name| Expr::Var(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = "\
# demo
let x = 1
fn bump
  let y = 2.5
  print bumped {y}
end
call bump
print done {x}
";

    #[test]
    fn test_parse_demo() {
        let script = Script::parse(DEMO).unwrap();
        assert_eq!(script.first_line(), Some(2));
        assert_eq!(script.body.len(), 3);
        let bump = &script.functions["bump"];
        assert_eq!(bump.line, 3);
        assert_eq!(bump.body[0], Stmt { line: 4, kind: StmtKind::Let { name: "y".into(), value: Expr::Literal(Value::Float(2.5)) } });
        assert_eq!(script.body[1].kind, StmtKind::Call("bump".into()));
    }

    #[test]
    fn test_expressions() {
        assert_eq!(expr("\"hi there\"", 1).unwrap(), Expr::Literal(Value::Str("hi there".into())));
        assert_eq!(expr("-4", 1).unwrap(), Expr::Literal(Value::Int(-4)));
        assert_eq!(expr("other", 1).unwrap(), Expr::Var("other".into()));
        assert!(expr("\"open", 1).is_err());
        assert!(expr("inf", 1).is_ok()); // a name, not a number
    }

    #[test]
    fn test_parse_errors_carry_lines() {
        assert_eq!(Script::parse("print a\nfrobnicate").unwrap_err().line, 2);
        assert_eq!(Script::parse("fn a\nprint x\n").unwrap_err(), ScriptError::new(1, "function `a` has no `end`"));
        assert_eq!(Script::parse("end").unwrap_err().line, 1);
        assert_eq!(Script::parse("call missing").unwrap_err().message, "unknown function `missing`");
        assert!(Script::parse("sleep soon").is_err());
        assert!(Script::parse("let 9x = 1").is_err());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Str("a".into()).repr(), "\"a\"");
        assert_eq!(Value::Str("a".into()).to_string(), "a");
        assert_eq!(Value::Float(2.5).type_label(), "float");
    }
}
