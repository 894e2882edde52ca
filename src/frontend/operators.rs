//! The operator table.
//!
//! The number is the operator priority and can not be zero; higher binds
//! tighter. The assignment family (priority 2) is right-associative, all
//! other operators are left-associative.

/// Priority of a merging operator, or `None` for unknown operators.
pub fn priority(text: &str) -> Option<u8> {
    let priority = match text {
        "," => 1,
        "=" | ":=" | "+=" | "-=" | "*=" | "/=" | ">>=" | "<<=" => 2,
        "||" => 3,
        "&&" => 4,
        "==" | "!=" | "<=" | ">=" => 5,
        "<" | ">" => 6,
        "+" | "-" => 7,
        "*" | "/" | "%" => 8,
        _ => return None,
    };

    Some(priority)
}

/// The assignment family is the only right-associative priority level.
pub fn is_right_associative(priority: u8) -> bool {
    priority == 2
}

/// Is this an assignment or compound assignment operator?
pub fn is_assignment(text: &str) -> bool {
    matches!(text, "=" | ":=" | "+=" | "-=" | "*=" | "/=" | ">>=" | "<<=")
}

/// Operator texts the lexer matches greedily, longest first, so that
/// `>>=` beats `>>` and `>>` beats `>`.
pub const LEXER_OPERATORS: &[&str] = &[
    ">>=", "<<=",
    ":=", "+=", "-=", "*=", "/=", "==", "!=", "<=", ">=", "&&", "||", ">>", "<<", "->",
    "=", "+", "-", "*", "/", "%", "<", ">", ":",
];
