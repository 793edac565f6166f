//! Purpose: Decide whether a chunk of source text is a syntactically closed unit.
//! Exports: `check`, `CompletenessVerdict`, `CONTINUATION_OPERATORS`.
//! Role: Pure scanner backing `is_complete_request`; no engine round-trip.
//! Invariants: Trailing-operator detection runs first and short-circuits scanning.
//! Invariants: Quotes toggle string state with no escape handling (`\"` still toggles).
//! Invariants: Incomplete indent is four spaces per unclosed bracket, whatever its kind.
use serde::Serialize;

/// Operators an expression cannot end on.
pub const CONTINUATION_OPERATORS: &[&str] = &[
    "+", "-", "/", "*", "^", "=", ">", "<", "/;", "/:", "/.", "&&", "||",
];

const BRACKET_PAIRS: [(char, char); 3] = [('(', ')'), ('[', ']'), ('{', '}')];
const INDENT_PER_LEVEL: usize = 4;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletenessVerdict {
    Complete,
    Incomplete { indent: String },
    Invalid,
}

impl CompletenessVerdict {
    pub fn status(&self) -> &'static str {
        match self {
            CompletenessVerdict::Complete => "complete",
            CompletenessVerdict::Incomplete { .. } => "incomplete",
            CompletenessVerdict::Invalid => "invalid",
        }
    }

    fn incomplete(depth: usize) -> Self {
        CompletenessVerdict::Incomplete {
            indent: " ".repeat(INDENT_PER_LEVEL * depth),
        }
    }
}

pub fn check(code: &str) -> CompletenessVerdict {
    let code = code.trim_end();

    if CONTINUATION_OPERATORS.iter().any(|op| code.ends_with(op)) {
        return CompletenessVerdict::incomplete(0);
    }

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    for ch in code.chars() {
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if BRACKET_PAIRS.iter().any(|(open, _)| *open == ch) {
            stack.push(ch);
        } else if let Some((open, _)) = BRACKET_PAIRS.iter().find(|(_, close)| *close == ch) {
            if stack.pop() != Some(*open) {
                return CompletenessVerdict::Invalid;
            }
        }
    }

    if in_string {
        CompletenessVerdict::incomplete(0)
    } else if !stack.is_empty() {
        CompletenessVerdict::incomplete(stack.len())
    } else {
        CompletenessVerdict::Complete
    }
}
