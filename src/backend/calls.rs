//! Function calls: callee-wait, clobber saves, ABI materialization, and
//! the builtin special forms.
//!
//! A call site must not emit `call` before the callee has published its
//! clobbered register set and side-effect flag; `Environment::wait_for`
//! provides that ordering (and breaks recursion cycles with the
//! preliminary signature). Live variables in clobbered registers are saved
//! with push/pop around the call; a live variable in the return value
//! register is rehomed instead so the result cannot be popped over.

use std::collections::BTreeSet;

use crate::asm::Reg;
use crate::common::error::ErrorKind;
use crate::common::source::Position;
use crate::common::types::Type;
use crate::frontend::expression::Expression;
use crate::frontend::token::{Token, TokenKind};

use super::builtins::{PRINT, STORE, SYSCALL, SYS_WRITE};
use super::function::{polymorph_name, WaitOutcome};
use super::registers::{
    RegisterUser, ARGUMENT_REGISTERS, CALL, RETURN, SYSCALL as SYSCALL_ABI, SYSCALL_CLOBBERS,
};
use super::state::{number_literal, State, StateError};

impl<'e> State<'e> {
    /// A statement that is a bare call.
    pub fn call_statement(&mut self, statement: &[Token]) -> Result<(), StateError> {
        if statement[0].kind != TokenKind::Identifier {
            return Err(self.error(ErrorKind::MissingFunctionName, statement[0].position).into());
        }
        if statement.last().map(|t| t.kind) != Some(TokenKind::GroupEnd) {
            let position = statement.last().map(|t| t.position).unwrap_or_default();
            return Err(self.error(ErrorKind::MissingCharacter(')'), position).into());
        }

        let mut expr = self.parse(statement)?;
        if !expr.is_call() {
            return Err(self.error(ErrorKind::UnknownExpression, statement[0].position).into());
        }
        self.call_expression(&mut expr, None)?;
        Ok(())
    }

    /// Emit a call and leave its result in `target`, if one is wanted.
    /// Returns the callee's return type.
    pub fn call_expression(
        &mut self,
        expr: &mut Expression,
        target: Option<Reg>,
    ) -> Result<Option<Type>, StateError> {
        let name = expr.token.text.clone();
        let position = expr.token.position;
        let arity = expr.children.len();
        let mangled = polymorph_name(&name, arity);

        // User functions shadow builtins.
        let is_user = self.environment.functions.contains_key(&mangled);
        let Some(function) = self.environment.find_function(&mangled).cloned() else {
            // A known name called at the wrong arity is a parameter count
            // error, not an unknown function.
            if let Some(required) = self.known_arity(&name) {
                return Err(self
                    .error(
                        ErrorKind::ParameterCount { name: name.clone(), given: arity, required },
                        position,
                    )
                    .into());
            }
            let kind = self.environment.unknown_function(&name);
            return Err(self.error(kind, position).into());
        };

        // Wait for the callee's outputs before anything is emitted.
        let (clobbers, inline_body) =
            match self.environment.wait_for(&self.function.name, &function) {
                WaitOutcome::Final(body) => {
                    let inline = (body.can_inline && self.environment.optimize && is_user)
                        .then(|| body.assembler.clone());
                    (body.clobbers, inline)
                }
                WaitOutcome::Preliminary if function.name == self.function.name => {
                    // Self recursion: consult our own clobbers so far.
                    let mut own = self.assembler.written_registers();
                    own.extend(self.callee_clobbers.iter().copied());
                    (own.into_iter().collect(), None)
                }
                WaitOutcome::Preliminary => (BTreeSet::new(), None),
                WaitOutcome::Poisoned => return Err(StateError::Aborted),
            };

        // Calling a side-effecting function makes this one side-effecting.
        if function.has_side_effects() {
            self.side_effects += 1;
        }

        if !function.no_parameter_check && arity != function.parameters.len() {
            return Err(self
                .error(
                    ErrorKind::ParameterCount {
                        name: function.raw_name.clone(),
                        given: arity,
                        required: function.parameters.len(),
                    },
                    position,
                )
                .into());
        }

        // `print` and `store` expand inline instead of emitting a call.
        if !is_user {
            match name.as_str() {
                PRINT => return self.builtin_print(expr).map(|_| None),
                STORE => return self.builtin_store(expr).map(|_| None),
                _ => {}
            }
        }
        let is_syscall = !is_user && name == SYSCALL;

        // Arguments that contain calls of their own are evaluated into
        // temporaries first, while no ABI register is claimed yet; their
        // inner call sequences would otherwise fight over the argument
        // registers. The temporaries live outside the argument registers
        // of either ABI, so any call nested below can still claim its
        // slots.
        let abi: &[Reg] = if is_syscall { &SYSCALL_ABI } else { &CALL };
        let mut children = std::mem::take(&mut expr.children);
        let mut prevalued: Vec<Option<Reg>> = vec![None; arity];

        for (i, child) in children.iter_mut().enumerate() {
            if !contains_call(child) {
                continue;
            }
            let Some(register) = self.registers.find_free_excluding(&ARGUMENT_REGISTERS) else {
                return Err(self.error(ErrorKind::ExceededMaxVariables, position).into());
            };
            self.registers
                .use_for(register, RegisterUser::Temporary)
                .map_err(|kind| self.error(kind, position))?;
            let typ = self.expression_to_register(child, register)?;
            self.check_parameter_type(&function, i, typ, child.position())?;
            prevalued[i] = Some(register);
        }

        let pushed = self.save_clobbered_registers(&clobbers, target, position)?;

        // Materialize the arguments into the ABI registers in order.
        let mut claimed = Vec::new();

        for (i, child) in children.iter_mut().enumerate() {
            let call_register = abi[i];

            if let Some(source) = prevalued[i] {
                let user = match function.parameters.get(i) {
                    Some(parameter) => RegisterUser::Parameter(parameter.name.clone()),
                    None => RegisterUser::Parameter(format!("arg{}", i)),
                };
                self.claim_register(call_register, user, position)?;
                claimed.push(call_register);
                self.assembler.move_register_register(call_register, source);
                self.registers.free(source);
                continue;
            }

            // If the argument is a variable already sitting in the right
            // register, skip the move entirely.
            if child.is_leaf() && child.token.kind == TokenKind::Identifier {
                let child_name = child.token.text.clone();
                if let Some(variable) = self.scopes.get_mut(&child_name) {
                    if variable.register == call_register {
                        variable.reads += 1;
                        let typ = variable.typ;
                        child.register = Some(call_register);
                        self.check_parameter_type(&function, i, typ, child.position())?;
                        continue;
                    }
                }
            }

            let user = match function.parameters.get(i) {
                Some(parameter) => RegisterUser::Parameter(parameter.name.clone()),
                None => RegisterUser::Parameter(format!("arg{}", i)),
            };
            self.claim_register(call_register, user, position)?;
            claimed.push(call_register);

            let typ = self.expression_to_register(child, call_register)?;
            self.check_parameter_type(&function, i, typ, child.position())?;
        }

        // Emit the call itself.
        if is_syscall {
            self.assembler.syscall();
        } else if let Some(body) = &inline_body {
            self.assembler.inline_body(body);
        } else {
            self.assembler.call(function.name.clone());
            self.callee_clobbers.extend(clobbers.iter().copied());
        }

        // Claim the result out of the return register before anything is
        // popped over it.
        if let Some(destination) = target {
            self.assembler.move_register_register(destination, RETURN[0]);
        }

        // Restore saved registers in reverse push order, release the ABI
        // registers, count the call site.
        for register in pushed.iter().rev() {
            self.assembler.pop_register(*register);
        }
        for register in claimed {
            self.registers.free(register);
        }
        if inline_body.is_none() {
            function.increment_call_count();
        }

        expr.typ = function.return_types.first().copied();
        Ok(expr.typ)
    }

    /// Save whatever lives in the callee's clobber set.
    ///
    /// Variables that are still read at or after this statement are
    /// pushed; a variable in the return value register is rehomed instead
    /// so a pop cannot destroy the call's result. Parameters and
    /// temporaries belong to an enclosing statement in flight (this call
    /// sits inside an argument or a larger expression) and are always
    /// saved. The result register of this very call is exempt: its old
    /// value is dead by definition.
    fn save_clobbered_registers(
        &mut self,
        clobbers: &BTreeSet<Reg>,
        target: Option<Reg>,
        position: Position,
    ) -> Result<Vec<Reg>, StateError> {
        let exclusion: Vec<Reg> = clobbers.iter().copied().collect();
        let mut pushed = Vec::new();

        for &register in clobbers {
            if target == Some(register) {
                continue;
            }

            match self.registers.user(register) {
                None => continue,
                Some(RegisterUser::Variable(name)) => {
                    let name = name.clone();
                    let Some(variable) = self.scopes.get(&name) else {
                        continue;
                    };
                    // Reads before this statement don't keep a variable
                    // alive across the call. Inside a loop the linear
                    // liveness scan misses back-edge reads, so everything
                    // is saved.
                    if self.for_state.stack.is_empty()
                        && variable.alive_until < self.statement_start
                    {
                        continue;
                    }

                    if register == RETURN[0] {
                        let Some(free) = self.registers.find_free_excluding(&exclusion) else {
                            return Err(
                                self.error(ErrorKind::ExceededMaxVariables, position).into()
                            );
                        };
                        self.assembler.move_register_register(free, register);
                        self.registers
                            .transfer(register, free)
                            .map_err(|kind| self.error(kind, position))?;
                        self.scopes.set_register(&name, free);
                    } else {
                        self.assembler.push_register(register);
                        pushed.push(register);
                    }
                }
                Some(RegisterUser::Parameter(_)) | Some(RegisterUser::Temporary) => {
                    self.assembler.push_register(register);
                    pushed.push(register);
                }
            }
        }

        Ok(pushed)
    }

    /// The largest registered arity for a raw function name, if the name
    /// exists at all.
    fn known_arity(&self, name: &str) -> Option<usize> {
        self.environment
            .functions
            .values()
            .chain(self.environment.builtins.values())
            .filter(|f| f.raw_name == name)
            .map(|f| f.parameters.len())
            .max()
    }

    fn check_parameter_type(
        &self,
        function: &super::function::Function,
        index: usize,
        got: Type,
        position: Position,
    ) -> Result<(), StateError> {
        if function.no_parameter_check {
            return Ok(());
        }
        let parameter = &function.parameters[index];
        if got != parameter.typ {
            return Err(self
                .error(
                    ErrorKind::InvalidType {
                        got: got.name().into(),
                        expected: parameter.typ.name().into(),
                        parameter: parameter.name.clone(),
                    },
                    position,
                )
                .into());
        }
        Ok(())
    }

    /// `print(text)`: append a newline, intern the string, and emit a
    /// `write(1, addr, len)` syscall.
    fn builtin_print(&mut self, expr: &mut Expression) -> Result<(), StateError> {
        let argument = &expr.children[0];

        if !(argument.is_leaf() && argument.token.kind == TokenKind::Text) {
            let got = self.describe_argument(argument);
            return Err(self
                .error(
                    ErrorKind::InvalidType {
                        got,
                        expected: Type::Text.name().into(),
                        parameter: "message".into(),
                    },
                    argument.position(),
                )
                .into());
        }

        let mut text = argument.token.text.clone();
        text.push('\n');
        let length = text.len() as i64;
        let id = self.assembler.add_string(&text);

        // The write sequence owns rax/rdi/rsi/rdx and the kernel scratches
        // rcx/r11; anything living there is saved around it.
        let mut occupied: Vec<Reg> =
            vec![SYSCALL_ABI[0], SYSCALL_ABI[1], SYSCALL_ABI[2], SYSCALL_ABI[3]];
        occupied.extend_from_slice(&SYSCALL_CLOBBERS);
        occupied.sort();
        occupied.dedup();
        let saved: Vec<Reg> =
            occupied.into_iter().filter(|r| !self.registers.is_free(*r)).collect();

        for &register in &saved {
            self.assembler.push_register(register);
        }

        self.assembler.move_register_number(SYSCALL_ABI[0], SYS_WRITE);
        self.assembler.move_register_number(SYSCALL_ABI[1], 1);
        self.assembler.move_register_address(SYSCALL_ABI[2], id);
        self.assembler.move_register_number(SYSCALL_ABI[3], length);
        self.assembler.syscall();

        for &register in saved.iter().rev() {
            self.assembler.pop_register(register);
        }

        Ok(())
    }

    /// `store(var, offset, byteCount, value)`: an unsafe bootstrapping
    /// primitive; all parameters after the variable are literals.
    fn builtin_store(&mut self, expr: &mut Expression) -> Result<(), StateError> {
        let variable_arg = &expr.children[0];
        if !(variable_arg.is_leaf() && variable_arg.token.kind == TokenKind::Identifier) {
            return Err(self
                .error(ErrorKind::UnknownExpression, variable_arg.position())
                .into());
        }

        let name = variable_arg.token.text.clone();
        let Some(variable) = self.scopes.get_mut(&name) else {
            let kind = self.scopes.unknown_identifier(&name);
            return Err(self.error(kind, variable_arg.position()).into());
        };
        variable.reads += 1;
        let base = variable.register;

        let offset = self.literal_argument(&expr.children[1])?;
        let byte_count = self.literal_argument(&expr.children[2])?;
        let value = self.literal_argument(&expr.children[3])?;

        let offset = i8::try_from(offset)
            .map_err(|_| self.error(ErrorKind::UnknownExpression, expr.children[1].position()))?;
        let byte_count = match byte_count {
            1 | 2 | 4 | 8 => byte_count as u8,
            _ => {
                return Err(self
                    .error(ErrorKind::UnknownExpression, expr.children[2].position())
                    .into())
            }
        };

        self.assembler.store_number(base, offset, byte_count, value as u64);
        Ok(())
    }

    fn literal_argument(&self, expr: &Expression) -> Result<i64, StateError> {
        number_literal(expr)
            .ok_or_else(|| self.error(ErrorKind::UnknownExpression, expr.position()).into())
    }

    fn describe_argument(&self, expr: &Expression) -> String {
        match expr.token.kind {
            TokenKind::Number => Type::Int64.name().to_string(),
            TokenKind::Identifier => self
                .scopes
                .get(&expr.token.text)
                .map(|v| v.typ.name().to_string())
                .unwrap_or_else(|| expr.token.text.clone()),
            _ => expr.token.text.clone(),
        }
    }
}

/// Does the expression contain a function call anywhere in its tree?
fn contains_call(expr: &Expression) -> bool {
    expr.is_call() || expr.children.iter().any(contains_call)
}
