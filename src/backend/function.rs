//! Function records and their compile completion signalling.
//!
//! A function is registered during the import phase with its signature and
//! body tokens; a compile task later publishes the generated assembler
//! body, the clobbered register set and the side-effect flag. Callers
//! block on `wait` to observe those outputs before emitting a call.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use crate::asm::{Assembler, Reg};
use crate::common::source::Position;
use crate::common::types::Type;
use crate::frontend::token::Token;

/// Body size threshold below which a function qualifies for inlining.
pub const INLINE_MAX_INSTRUCTIONS: usize = 8;

/// Mangle a function name with its arity. Arity-polymorphic functions get
/// distinct table keys; external symbols would use the unmangled name.
pub fn polymorph_name(name: &str, arity: usize) -> String {
    format!("{}|{}", name, arity)
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub typ: Type,
}

/// The published result of a function's compile task.
#[derive(Debug, Clone)]
pub struct CompiledBody {
    pub assembler: Assembler,
    /// Registers the body may write; callers must preserve live values
    /// held in them.
    pub clobbers: BTreeSet<Reg>,
    /// Small label-free bodies are pasted into call sites under `-O`.
    pub can_inline: bool,
}

#[derive(Debug, Default)]
enum CompileState {
    #[default]
    Pending,
    Done(CompiledBody),
    Failed,
}

/// What a caller learns from waiting on a callee.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The final clobber set and body are published.
    Final(CompiledBody),
    /// The wait would close a recursion cycle; only the signature
    /// (published at task start) is available. The clobber set is
    /// optimistically empty and is refined before the final link.
    Preliminary,
    /// The callee's compile failed; the caller aborts without reporting
    /// an error of its own.
    Poisoned,
}

/// A function: signature, body tokens, and post-compile outputs.
#[derive(Debug)]
pub struct Function {
    /// Mangled table key, `name|arity`.
    pub name: String,
    /// The name as written in the source.
    pub raw_name: String,
    pub parameters: Vec<Parameter>,
    /// Zero or one return types.
    pub return_types: Vec<Type>,
    /// Statements between the function's braces.
    pub body: Vec<Token>,
    /// Source file the function was imported from.
    pub file: String,
    pub position: Position,
    /// `syscall` opts out of parameter count and type checking.
    pub no_parameter_check: bool,
    /// Non-zero when the body performs a syscall or transitively calls a
    /// function that does. Monotonic.
    pub side_effects: AtomicU32,
    /// Number of successful call sites. Functions never called are
    /// omitted from the binary.
    pub call_count: AtomicU32,
    state: Mutex<CompileState>,
    completed: Condvar,
}

impl Function {
    pub fn new(
        raw_name: &str,
        parameters: Vec<Parameter>,
        return_types: Vec<Type>,
        body: Vec<Token>,
        file: String,
        position: Position,
    ) -> Self {
        Self {
            name: polymorph_name(raw_name, parameters.len()),
            raw_name: raw_name.to_string(),
            parameters,
            return_types,
            body,
            file,
            position,
            no_parameter_check: false,
            side_effects: AtomicU32::new(0),
            call_count: AtomicU32::new(0),
            state: Mutex::new(CompileState::Pending),
            completed: Condvar::new(),
        }
    }

    pub fn has_return_value(&self) -> bool {
        !self.return_types.is_empty()
    }

    pub fn has_side_effects(&self) -> bool {
        self.side_effects.load(Ordering::SeqCst) > 0
    }

    pub fn mark_side_effects(&self) {
        self.side_effects.fetch_add(1, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn increment_call_count(&self) {
        self.call_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Publish a successfully compiled body and release all waiters.
    pub fn publish_success(&self, assembler: Assembler, clobbers: BTreeSet<Reg>) {
        let can_inline =
            assembler.instruction_count() < INLINE_MAX_INSTRUCTIONS && !assembler.has_labels();
        let mut state = self.state.lock().unwrap();
        *state = CompileState::Done(CompiledBody { assembler, clobbers, can_inline });
        self.completed.notify_all();
    }

    /// Record a failed compile. Waiters abort.
    pub fn publish_failure(&self) {
        let mut state = self.state.lock().unwrap();
        *state = CompileState::Failed;
        self.completed.notify_all();
    }

    /// Block until the compile task publishes its outputs.
    pub fn wait(&self) -> WaitOutcome {
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                CompileState::Done(body) => return WaitOutcome::Final(body.clone()),
                CompileState::Failed => return WaitOutcome::Poisoned,
                CompileState::Pending => {
                    state = self.completed.wait(state).unwrap();
                }
            }
        }
    }

    /// The published outputs, without blocking.
    pub fn compiled(&self) -> Option<CompiledBody> {
        match &*self.state.lock().unwrap() {
            CompileState::Done(body) => Some(body.clone()),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), CompileState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn empty_function(name: &str) -> Function {
        Function::new(name, Vec::new(), Vec::new(), Vec::new(), "test.q".into(), Position::new(1, 1))
    }

    #[test]
    fn name_mangling() {
        assert_eq!(polymorph_name("print", 1), "print|1");
        let f = Function::new(
            "f",
            vec![Parameter { name: "x".into(), typ: Type::Int64 }],
            Vec::new(),
            Vec::new(),
            "test.q".into(),
            Position::new(1, 1),
        );
        assert_eq!(f.name, "f|1");
        assert_eq!(f.raw_name, "f");
    }

    #[test]
    fn wait_observes_published_body() {
        let f = Arc::new(empty_function("f"));
        let waiter = Arc::clone(&f);
        let handle = std::thread::spawn(move || waiter.wait());

        let mut asm = Assembler::new();
        asm.ret();
        f.publish_success(asm, BTreeSet::from([Reg::Rax]));

        match handle.join().unwrap() {
            WaitOutcome::Final(body) => {
                assert_eq!(body.clobbers, BTreeSet::from([Reg::Rax]));
                assert!(body.can_inline);
            }
            other => panic!("expected final outcome, got {:?}", other),
        }
    }

    #[test]
    fn failure_poisons_waiters() {
        let f = Arc::new(empty_function("f"));
        let waiter = Arc::clone(&f);
        let handle = std::thread::spawn(move || waiter.wait());
        f.publish_failure();
        assert!(matches!(handle.join().unwrap(), WaitOutcome::Poisoned));
    }

    #[test]
    fn large_bodies_do_not_inline() {
        let f = empty_function("f");
        let mut asm = Assembler::new();
        for _ in 0..INLINE_MAX_INSTRUCTIONS {
            asm.increase_register(Reg::Rbx);
        }
        f.publish_success(asm, BTreeSet::new());
        assert!(!f.compiled().unwrap().can_inline);
    }

    #[test]
    fn labeled_bodies_do_not_inline() {
        let f = empty_function("f");
        let mut asm = Assembler::new();
        asm.add_label("loop");
        asm.jump("loop");
        f.publish_success(asm, BTreeSet::new());
        assert!(!f.compiled().unwrap().can_inline);
    }

    #[test]
    fn side_effects_are_monotonic() {
        let f = empty_function("f");
        assert!(!f.has_side_effects());
        f.mark_side_effects();
        f.mark_side_effects();
        assert!(f.has_side_effects());
    }
}
