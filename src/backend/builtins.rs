//! Builtin function registrations: `print`, `store`, and `syscall`.
//!
//! Builtins are never compiled; their records exist so call resolution,
//! suggestions, parameter checks, side-effect propagation and clobber
//! tracking treat them like any other function. `print` and `store` are
//! expanded inline by the statement compiler; `syscall` goes through the
//! regular call sequence with the syscall ABI register list.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::asm::Assembler;
use crate::common::source::Position;
use crate::common::types::Type;

use super::function::{Function, Parameter};
use super::registers::SYSCALL_CLOBBERS;

pub const PRINT: &str = "print";
pub const STORE: &str = "store";
pub const SYSCALL: &str = "syscall";

/// Number of the Linux `write` syscall.
pub const SYS_WRITE: i64 = 1;
/// Number of the Linux `exit` syscall.
pub const SYS_EXIT: i64 = 60;

fn builtin(
    name: &str,
    parameters: Vec<Parameter>,
    no_parameter_check: bool,
    clobbers: BTreeSet<crate::asm::Reg>,
) -> Arc<Function> {
    let mut function = Function::new(
        name,
        parameters,
        Vec::new(),
        Vec::new(),
        String::new(),
        Position::default(),
    );
    function.no_parameter_check = no_parameter_check;
    function.mark_side_effects();
    // Builtins are complete from the start: nothing ever waits on them.
    function.publish_success(Assembler::new(), clobbers);
    Arc::new(function)
}

fn parameter(name: &str, typ: Type) -> Parameter {
    Parameter { name: name.to_string(), typ }
}

/// Build the builtin function table, keyed by mangled name. `syscall` is
/// registered for every arity up to its six argument registers.
pub fn register() -> HashMap<String, Arc<Function>> {
    let mut functions = HashMap::new();
    let syscall_clobbers: BTreeSet<_> = SYSCALL_CLOBBERS.into_iter().collect();

    let print = builtin(
        PRINT,
        vec![parameter("message", Type::Text)],
        false,
        syscall_clobbers.clone(),
    );
    functions.insert(print.name.clone(), print);

    let store = builtin(
        STORE,
        vec![
            parameter("variable", Type::Int64),
            parameter("offset", Type::Int64),
            parameter("byteCount", Type::Int64),
            parameter("value", Type::Int64),
        ],
        false,
        BTreeSet::new(),
    );
    functions.insert(store.name.clone(), store);

    for arity in 1..=7 {
        let parameters = (0..arity).map(|i| parameter(&format!("arg{}", i), Type::Int64)).collect();
        let syscall = builtin(SYSCALL, parameters, true, syscall_clobbers.clone());
        functions.insert(syscall.name.clone(), syscall);
    }

    functions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registrations() {
        let builtins = register();
        assert!(builtins.contains_key("print|1"));
        assert!(builtins.contains_key("store|4"));
        for arity in 1..=7 {
            assert!(builtins.contains_key(&format!("syscall|{}", arity)));
        }
        assert!(!builtins.contains_key("syscall|8"));
    }

    #[test]
    fn syscall_skips_parameter_checks() {
        let builtins = register();
        assert!(builtins["syscall|3"].no_parameter_check);
        assert!(!builtins["print|1"].no_parameter_check);
    }

    #[test]
    fn builtins_have_side_effects_and_never_block() {
        let builtins = register();
        for function in builtins.values() {
            assert!(function.has_side_effects());
            assert!(!function.is_pending());
        }
    }
}
