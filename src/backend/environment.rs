//! The environment: the global function table, source registry, and the
//! concurrent per-function compile scheduler.
//!
//! Importing walks the project directory once and registers every function
//! signature before any code generation begins, so call sites can resolve
//! and typecheck against the full table. Compilation then runs one task
//! per function; completed functions flow back over a channel and the
//! first error cancels the build.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use log::debug;

use crate::common::error::{BuildError, CompileError, ErrorKind};
use crate::common::source::{FileSet, SourceFile};
use crate::common::suggest;
use crate::common::types::Type;
use crate::frontend::lexer;
use crate::frontend::token::{Token, TokenKind};

use super::builtins;
use super::function::{polymorph_name, Function, Parameter, WaitOutcome};
use super::state::{State, StateError};

pub struct Environment {
    /// User functions, keyed by mangled name. Write-once during import,
    /// read-only during compilation.
    pub functions: HashMap<String, Arc<Function>>,
    /// Builtin functions, consulted after the user table.
    pub builtins: HashMap<String, Arc<Function>>,
    files: FileSet,
    /// Who is currently blocked waiting on whom; used to resolve mutual
    /// recursion with the preliminary signature instead of deadlocking.
    wait_edges: Mutex<HashMap<String, String>>,
    pub optimize: bool,
}

impl Environment {
    pub fn new(optimize: bool) -> Self {
        Self {
            functions: HashMap::new(),
            builtins: builtins::register(),
            files: FileSet::new(),
            wait_edges: Mutex::new(HashMap::new()),
            optimize,
        }
    }

    /// Tokenize every `.q` file under the directory and register all
    /// top-level functions. Files are visited in name order so the
    /// function table (and everything downstream) is deterministic.
    pub fn import_directory(&mut self, directory: &Path) -> Result<(), BuildError> {
        let entries = std::fs::read_dir(directory)
            .map_err(|e| BuildError::Io(format!("Cannot read '{}': {}", directory.display(), e)))?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "q"))
            .collect();
        paths.sort();

        for path in paths {
            let name = path.display().to_string();
            let content = std::fs::read_to_string(&path)
                .map_err(|e| BuildError::Io(format!("Cannot read '{}': {}", name, e)))?;
            self.import_source(&name, &content)?;
        }

        Ok(())
    }

    /// Register all functions of one source file.
    pub fn import_source(&mut self, name: &str, content: &str) -> Result<(), CompileError> {
        let tokens = lexer::tokenize(content, name)?;

        for function in parse_functions(&tokens, name)? {
            debug!("imported {} from {}", function.name, name);
            self.functions.insert(function.name.clone(), Arc::new(function));
        }

        self.files.add(name.to_string(), content.to_string());
        Ok(())
    }

    /// The source file a given error was raised in, for snippet rendering.
    pub fn source_file(&self, name: &str) -> Option<&SourceFile> {
        self.files.by_name(name)
    }

    /// Look up a function by mangled name, user functions first.
    pub fn find_function(&self, mangled: &str) -> Option<&Arc<Function>> {
        self.functions.get(mangled).or_else(|| self.builtins.get(mangled))
    }

    /// An unknown-function error with the closest known name attached.
    pub fn unknown_function(&self, name: &str) -> ErrorKind {
        let candidates: Vec<&str> = self
            .functions
            .values()
            .map(|f| f.raw_name.as_str())
            .chain([builtins::PRINT, builtins::STORE, builtins::SYSCALL])
            .collect();
        ErrorKind::UnknownFunction {
            name: name.to_string(),
            suggestion: suggest::closest(name, candidates),
        }
    }

    /// Block until the callee publishes its outputs, unless doing so would
    /// close a wait cycle (mutual or self recursion), in which case the
    /// preliminary signature is used and the final clobber set is left to
    /// the link step.
    pub fn wait_for(&self, caller: &str, callee: &Arc<Function>) -> WaitOutcome {
        if callee.name == caller {
            return WaitOutcome::Preliminary;
        }
        if let Some(body) = callee.compiled() {
            return WaitOutcome::Final(body);
        }

        {
            let mut edges = self.wait_edges.lock().unwrap();
            let mut current = callee.name.clone();
            loop {
                if current == caller {
                    return WaitOutcome::Preliminary;
                }
                match edges.get(&current) {
                    Some(next) => current = next.clone(),
                    None => break,
                }
            }
            edges.insert(caller.to_string(), callee.name.clone());
        }

        let outcome = callee.wait();
        self.wait_edges.lock().unwrap().remove(caller);
        outcome
    }

    /// Compile every user function concurrently. Returns the completed
    /// functions sorted by name, or the first error.
    pub fn compile(self: &Arc<Self>) -> Result<Vec<Arc<Function>>, CompileError> {
        let (sender, receiver) = mpsc::channel();

        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        let task_count = names.len();

        for name in names {
            let function = Arc::clone(&self.functions[&name]);
            let environment = Arc::clone(self);
            let sender = sender.clone();

            thread::spawn(move || match State::compile_function(&environment, &function) {
                Ok(output) => {
                    function.side_effects.fetch_add(output.side_effects, Ordering::SeqCst);
                    function.publish_success(output.assembler, output.clobbers);
                    debug!("compiled {}", function.name);
                    let _ = sender.send(Ok(function));
                }
                Err(StateError::Error(error)) => {
                    function.publish_failure();
                    let _ = sender.send(Err(error));
                }
                // A failed callee already reported the error; this task
                // just winds down.
                Err(StateError::Aborted) => {
                    function.publish_failure();
                }
            });
        }
        drop(sender);

        let mut completed = Vec::with_capacity(task_count);
        for _ in 0..task_count {
            match receiver.recv() {
                Ok(Ok(function)) => completed.push(function),
                // First error wins; running tasks are abandoned and their
                // results discarded.
                Ok(Err(error)) => return Err(error),
                Err(_) => break,
            }
        }

        completed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(completed)
    }
}

/// Parse every top-level `fn NAME(PARAM:TYPE, ...) [-> TYPE] { body }`.
fn parse_functions(tokens: &[Token], file: &str) -> Result<Vec<Function>, CompileError> {
    let mut functions = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if tokens[i].kind == TokenKind::Newline {
            i += 1;
            continue;
        }

        if !tokens[i].is_keyword("fn") {
            return Err(CompileError::new(
                ErrorKind::UnknownExpression,
                file,
                tokens[i].position,
            ));
        }
        let fn_position = tokens[i].position;
        i += 1;

        let Some(name) = tokens.get(i).filter(|t| t.kind == TokenKind::Identifier) else {
            return Err(CompileError::new(ErrorKind::MissingFunctionName, file, fn_position));
        };
        i += 1;

        if tokens.get(i).map(|t| t.kind) != Some(TokenKind::GroupStart) {
            return Err(CompileError::new(
                ErrorKind::MissingCharacter('('),
                file,
                name.position,
            ));
        }
        i += 1;

        let (parameters, next) = parse_parameters(tokens, i, file)?;
        i = next;

        if parameters.len() > super::registers::CALL.len() {
            // The user-call ABI has six argument slots.
            return Err(CompileError::new(ErrorKind::ExceededMaxVariables, file, fn_position));
        }

        let mut return_types = Vec::new();
        if tokens.get(i).is_some_and(|t| t.is_operator("->")) {
            i += 1;
            let Some(token) = tokens.get(i).filter(|t| t.kind == TokenKind::Identifier) else {
                return Err(CompileError::new(
                    ErrorKind::UnknownExpression,
                    file,
                    tokens.get(i).map(|t| t.position).unwrap_or(fn_position),
                ));
            };
            let Some(typ) = Type::by_name(&token.text) else {
                return Err(CompileError::new(ErrorKind::UnknownExpression, file, token.position));
            };
            return_types.push(typ);
            i += 1;
        }

        if tokens.get(i).map(|t| t.kind) != Some(TokenKind::BlockStart) {
            return Err(CompileError::new(ErrorKind::MissingCharacter('{'), file, fn_position));
        }
        let block_start = tokens[i].position;
        i += 1;

        // Collect the body up to the matching closing brace.
        let body_start = i;
        let mut depth = 1i32;
        while i < tokens.len() {
            match tokens[i].kind {
                TokenKind::BlockStart => depth += 1,
                TokenKind::BlockEnd => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if depth != 0 {
            return Err(CompileError::new(ErrorKind::MissingCharacter('}'), file, block_start));
        }
        let body = tokens[body_start..i].to_vec();
        i += 1; // closing brace

        functions.push(Function::new(
            &name.text,
            parameters,
            return_types,
            body,
            file.to_string(),
            fn_position,
        ));
    }

    Ok(functions)
}

/// Parse `NAME:TYPE, ...` up to and including the closing bracket. Returns
/// the parameters and the index after `)`.
fn parse_parameters(
    tokens: &[Token],
    mut i: usize,
    file: &str,
) -> Result<(Vec<Parameter>, usize), CompileError> {
    let mut parameters = Vec::new();

    loop {
        match tokens.get(i) {
            Some(t) if t.kind == TokenKind::GroupEnd => return Ok((parameters, i + 1)),
            Some(t) if t.kind == TokenKind::Identifier => {
                let parameter_name = t.text.clone();
                i += 1;

                if !tokens.get(i).is_some_and(|t| t.is_operator(":")) {
                    return Err(CompileError::new(
                        ErrorKind::MissingCharacter(':'),
                        file,
                        t.position,
                    ));
                }
                i += 1;

                let Some(type_token) = tokens.get(i).filter(|t| t.kind == TokenKind::Identifier)
                else {
                    return Err(CompileError::new(
                        ErrorKind::UnknownExpression,
                        file,
                        t.position,
                    ));
                };
                let Some(typ) = Type::by_name(&type_token.text) else {
                    return Err(CompileError::new(
                        ErrorKind::UnknownExpression,
                        file,
                        type_token.position,
                    ));
                };
                i += 1;

                parameters.push(Parameter { name: parameter_name, typ });

                if tokens.get(i).map(|t| t.kind) == Some(TokenKind::Separator) {
                    i += 1;
                }
            }
            Some(t) => {
                return Err(CompileError::new(ErrorKind::MissingCharacter(')'), file, t.position))
            }
            None => {
                return Err(CompileError::new(
                    ErrorKind::MissingCharacter(')'),
                    file,
                    Default::default(),
                ))
            }
        }
    }
}

/// Resolve a call to `name` with the given arity.
pub fn resolve_call<'e>(
    environment: &'e Environment,
    name: &str,
    arity: usize,
) -> Option<&'e Arc<Function>> {
    environment.find_function(&polymorph_name(name, arity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import(source: &str) -> Environment {
        let mut environment = Environment::new(false);
        environment.import_source("test.q", source).unwrap();
        environment
    }

    #[test]
    fn imports_signatures() {
        let environment =
            import("fn main() {\n}\n\nfn add(a:int64, b:int64) -> int64 {\n\treturn a + b\n}\n");
        assert!(environment.functions.contains_key("main|0"));
        let add = &environment.functions["add|2"];
        assert_eq!(add.parameters.len(), 2);
        assert_eq!(add.parameters[0].name, "a");
        assert_eq!(add.parameters[0].typ, Type::Int64);
        assert_eq!(add.return_types, vec![Type::Int64]);
        assert_eq!(add.raw_name, "add");
    }

    #[test]
    fn body_tokens_exclude_braces() {
        let environment = import("fn main() {\n\tf()\n}\n");
        let main = &environment.functions["main|0"];
        assert!(main.body.iter().all(|t| t.kind != TokenKind::BlockEnd || t.text != "}"));
        assert!(main.body.iter().any(|t| t.text == "f"));
    }

    #[test]
    fn nested_blocks_stay_in_the_body() {
        let environment = import("fn main() {\n\tfor i = 0..3 {\n\t\tprint(\"x\")\n\t}\n}\n");
        let main = &environment.functions["main|0"];
        let ends = main.body.iter().filter(|t| t.kind == TokenKind::BlockEnd).count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn seven_parameters_are_rejected() {
        let mut environment = Environment::new(false);
        let error = environment
            .import_source(
                "test.q",
                "fn f(a:int64, b:int64, c:int64, d:int64, e:int64, g:int64, h:int64) {\n}\n",
            )
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::ExceededMaxVariables);
    }

    #[test]
    fn missing_function_name() {
        let mut environment = Environment::new(false);
        let error = environment.import_source("test.q", "fn () {\n}\n").unwrap_err();
        assert_eq!(error.kind, ErrorKind::MissingFunctionName);
    }

    #[test]
    fn unknown_function_suggestion() {
        let environment = import("fn main() {\n}\n");
        assert_eq!(
            environment.unknown_function("prin"),
            ErrorKind::UnknownFunction { name: "prin".into(), suggestion: Some("print".into()) }
        );
        assert_eq!(
            environment.unknown_function("mian"),
            ErrorKind::UnknownFunction { name: "mian".into(), suggestion: Some("main".into()) }
        );
    }

    #[test]
    fn resolution_prefers_user_functions() {
        let environment = import("fn print(x:int64) {\n\tsyscall(60, x)\n}\n");
        let resolved = resolve_call(&environment, "print", 1).unwrap();
        assert_eq!(resolved.file, "test.q");
    }

    fn compile(source: &str) -> Result<Vec<Arc<Function>>, CompileError> {
        Arc::new(import(source)).compile()
    }

    #[test]
    fn compiles_a_print_into_a_write_syscall() {
        use crate::asm::{Item, Mnemonic, Reg};

        let results = compile("fn main() {\n\tprint(\"Hello\")\n}\n").unwrap();
        assert_eq!(results.len(), 1);

        let body = results[0].compiled().unwrap();
        let syscalls = body
            .assembler
            .items
            .iter()
            .filter(|i| matches!(i, Item::Instruction { mnemonic: Mnemonic::Syscall, .. }))
            .count();
        assert_eq!(syscalls, 1);

        // The write sequence clobbers the syscall argument registers.
        for register in [Reg::Rax, Reg::Rdi, Reg::Rsi, Reg::Rdx] {
            assert!(body.clobbers.contains(&register), "missing {}", register);
        }
        assert!(results[0].has_side_effects());
    }

    #[test]
    fn callee_clobbers_flow_into_callers() {
        use crate::asm::Reg;

        let results = compile(
            "fn helper() {\n\tprint(\"x\")\n}\n\nfn main() {\n\thelper()\n}\n",
        )
        .unwrap();

        let main = results.iter().find(|f| f.name == "main|0").unwrap();
        let clobbers = &main.compiled().unwrap().clobbers;
        assert!(clobbers.contains(&Reg::Rax));
        assert!(clobbers.contains(&Reg::Rsi));
        assert!(main.has_side_effects());
    }

    #[test]
    fn side_effect_free_functions_stay_clean() {
        let results =
            compile("fn id(x:int64) -> int64 {\n\treturn x\n}\n\nfn main() {\n\ta := id(1)\n\tsyscall(60, a)\n}\n")
                .unwrap();
        let id = results.iter().find(|f| f.name == "id|1").unwrap();
        assert!(!id.has_side_effects());
        let main = results.iter().find(|f| f.name == "main|0").unwrap();
        assert!(main.has_side_effects());
    }

    #[test]
    fn call_counts_track_call_sites() {
        let results = compile(
            "fn used() {\n\tprint(\"x\")\n}\n\nfn unused() {\n\tprint(\"y\")\n}\n\nfn main() {\n\tused()\n\tused()\n}\n",
        )
        .unwrap();

        let used = results.iter().find(|f| f.name == "used|0").unwrap();
        let unused = results.iter().find(|f| f.name == "unused|0").unwrap();
        assert_eq!(used.call_count(), 2);
        assert_eq!(unused.call_count(), 0);
    }

    #[test]
    fn results_are_sorted_by_name() {
        let results = compile(
            "fn zz() {\n\tprint(\"z\")\n}\n\nfn aa() {\n\tprint(\"a\")\n}\n\nfn main() {\n\tzz()\n\taa()\n}\n",
        )
        .unwrap();
        let names: Vec<&str> = results.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["aa|0", "main|0", "zz|0"]);
    }

    #[test]
    fn first_error_is_reported() {
        let error = compile("fn main() {\n\ta := 1\n}\n").unwrap_err();
        assert_eq!(error.kind, ErrorKind::VariableUnused("a".into()));
        assert_eq!(error.position.line, 2);
    }

    #[test]
    fn caller_of_a_failing_function_aborts_quietly() {
        let error = compile(
            "fn broken() {\n\tx := 1\n}\n\nfn main() {\n\tbroken()\n}\n",
        )
        .unwrap_err();
        // Whichever task loses the race, the reported error is the real one.
        assert_eq!(error.kind, ErrorKind::VariableUnused("x".into()));
    }

    #[test]
    fn mutual_recursion_does_not_deadlock() {
        let results = compile(
            "fn ping(n:int64) {\n\tif n > 0 {\n\t\tpong(n - 1)\n\t}\n}\n\nfn pong(n:int64) {\n\tif n > 0 {\n\t\tping(n - 1)\n\t}\n}\n\nfn main() {\n\tping(2)\n}\n",
        )
        .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn sibling_call_arguments_compile() {
        // Both arguments are calls: their pre-evaluated results must not
        // collide with the argument registers the outer call claims.
        let results = compile(
            "fn one() -> int64 {\n\treturn 1\n}\n\nfn add(a:int64, b:int64) -> int64 {\n\treturn a + b\n}\n\nfn main() {\n\tsyscall(60, add(one(), one()))\n}\n",
        )
        .unwrap();
        assert_eq!(results.len(), 3);
        let one = results.iter().find(|f| f.name == "one|0").unwrap();
        assert_eq!(one.call_count(), 2);
    }

    #[test]
    fn self_recursion_compiles() {
        let results = compile(
            "fn countdown(n:int64) {\n\tif n > 0 {\n\t\tcountdown(n - 1)\n\t}\n}\n\nfn main() {\n\tcountdown(3)\n}\n",
        )
        .unwrap();
        let countdown = results.iter().find(|f| f.name == "countdown|1").unwrap();
        assert!(countdown.call_count() >= 1);
    }
}
