//! The per-function compiler.
//!
//! A `State` owns the compile of exactly one function: the statement
//! cursor over the body tokens, the scope stack, a fresh register file and
//! an assembler. Statements are dispatched on their first token; the
//! expression walker emits code bottom-up, threading result registers
//! through the tree.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::asm::{Assembler, Reg};
use crate::common::error::{CompileError, ErrorKind, PositionedError};
use crate::common::source::Position;
use crate::common::types::Type;
use crate::frontend::expression::{self, Expression};
use crate::frontend::operators;
use crate::frontend::token::{Token, TokenKind};

use super::environment::Environment;
use super::function::Function;
use super::loops::ForState;
use super::registers::{RegisterFile, RegisterUser, CALL, RETURN};
use super::scope::{ScopeStack, Variable};

/// Everything a compile task publishes when it finishes.
pub struct CompileOutput {
    pub assembler: Assembler,
    pub clobbers: BTreeSet<Reg>,
    pub side_effects: u32,
}

/// How a compile task ends without producing output: with an error of its
/// own, or silently because a callee it waited on already failed.
pub enum StateError {
    Error(CompileError),
    Aborted,
}

impl From<CompileError> for StateError {
    fn from(error: CompileError) -> Self {
        StateError::Error(error)
    }
}

/// Open block kinds, tracked so `}` knows what it closes.
pub enum Block {
    For,
    If { end_label: String },
}

pub struct State<'e> {
    pub environment: &'e Arc<Environment>,
    pub function: &'e Arc<Function>,
    pub assembler: Assembler,
    pub registers: RegisterFile,
    pub scopes: ScopeStack,
    tokens: &'e [Token],
    cursor: usize,
    pub for_state: ForState,
    pub blocks: Vec<Block>,
    label_counter: u32,
    /// Start position of the statement being compiled; variables whose
    /// last read is at or beyond it are live across a call emitted here.
    pub statement_start: Position,
    /// Side effects accumulated from syscalls and side-effecting callees.
    pub side_effects: u32,
    /// Clobber sets of called functions, folded into this function's own.
    pub callee_clobbers: BTreeSet<Reg>,
}

impl<'e> State<'e> {
    pub fn new(environment: &'e Arc<Environment>, function: &'e Arc<Function>) -> Self {
        Self {
            environment,
            function,
            assembler: Assembler::new(),
            registers: RegisterFile::new(),
            scopes: ScopeStack::new(),
            tokens: &function.body,
            cursor: 0,
            for_state: ForState::new(),
            blocks: Vec::new(),
            label_counter: 0,
            statement_start: Position::default(),
            side_effects: 0,
            callee_clobbers: BTreeSet::new(),
        }
    }

    /// Compile one function to its assembler body and clobber set.
    pub fn compile_function(
        environment: &'e Arc<Environment>,
        function: &'e Arc<Function>,
    ) -> Result<CompileOutput, StateError> {
        let mut state = State::new(environment, function);
        state.compile()
    }

    fn compile(&mut self) -> Result<CompileOutput, StateError> {
        self.scopes.push();
        self.bind_parameters()?;

        while let Some(range) = self.next_statement() {
            // Newlines inside brackets continue the statement and carry no
            // meaning beyond that.
            let statement: Vec<Token> = self.tokens[range]
                .iter()
                .filter(|t| t.kind != TokenKind::Newline)
                .cloned()
                .collect();
            self.statement_start = statement[0].position;
            self.release_dead_variables(statement[0].position);
            self.dispatch(&statement)?;
        }

        if !self.blocks.is_empty() {
            return Err(self.error(ErrorKind::MissingCharacter('}'), self.last_position()).into());
        }

        self.pop_scope()?;
        self.assembler.ret();

        let mut clobbers = self.assembler.written_registers();
        clobbers.extend(self.callee_clobbers.iter().copied());

        Ok(CompileOutput {
            assembler: std::mem::take(&mut self.assembler),
            clobbers: clobbers.into_iter().collect(),
            side_effects: self.side_effects,
        })
    }

    /// Parameters arrive in the user-call ABI registers and are bound as
    /// pre-read variables in the root scope.
    fn bind_parameters(&mut self) -> Result<(), StateError> {
        let parameters = self.function.parameters.clone();
        for (i, parameter) in parameters.iter().enumerate() {
            let register = CALL[i];
            self.registers
                .use_for(register, RegisterUser::Variable(parameter.name.clone()))
                .map_err(|kind| self.error(kind, self.function.position))?;

            let mut variable = Variable::new(
                parameter.name.clone(),
                parameter.typ,
                register,
                self.function.position,
            );
            variable.reads = 1;
            variable.alive_until =
                self.last_read_position(&parameter.name, 0, self.function.position);
            self.scopes.insert(variable);
        }
        Ok(())
    }

    // ── Statement scanning ───────────────────────────────────────────────

    /// The token range of the next statement. A statement runs to the
    /// first top-level newline; block headers include their `{`, and a
    /// closing `}` is a statement of its own.
    fn next_statement(&mut self) -> Option<std::ops::Range<usize>> {
        while self.cursor < self.tokens.len()
            && self.tokens[self.cursor].kind == TokenKind::Newline
        {
            self.cursor += 1;
        }
        if self.cursor >= self.tokens.len() {
            return None;
        }

        let start = self.cursor;

        if self.tokens[start].kind == TokenKind::BlockEnd {
            self.cursor += 1;
            return Some(start..self.cursor);
        }

        let mut depth = 0i32;
        while self.cursor < self.tokens.len() {
            match self.tokens[self.cursor].kind {
                TokenKind::GroupStart => depth += 1,
                TokenKind::GroupEnd => depth -= 1,
                TokenKind::Newline if depth == 0 => break,
                TokenKind::BlockStart if depth == 0 => {
                    self.cursor += 1;
                    return Some(start..self.cursor);
                }
                TokenKind::BlockEnd if depth == 0 => break,
                _ => {}
            }
            self.cursor += 1;
        }

        Some(start..self.cursor)
    }

    fn dispatch(&mut self, statement: &[Token]) -> Result<(), StateError> {
        let first = &statement[0];

        if first.kind == TokenKind::BlockEnd {
            return self.block_end(first.position);
        }
        if first.is_keyword("for") {
            return self.for_start(statement);
        }
        if first.is_keyword("if") {
            return self.if_start(statement);
        }
        if first.is_keyword("return") {
            return self.return_statement(statement);
        }

        if first.kind == TokenKind::Identifier {
            if find_assignment_operator(statement).is_some() {
                self.assignment(statement)?;
                return Ok(());
            }
            if statement.get(1).map(|t| t.kind) == Some(TokenKind::GroupStart) {
                return self.call_statement(statement);
            }
        }

        Err(self.error(ErrorKind::UnknownExpression, first.position).into())
    }

    // ── Statements ───────────────────────────────────────────────────────

    /// `a = expr`, `a := expr`, and the compound assignment family.
    /// Returns the assigned variable's name and register; `for` reuses
    /// this for its counter.
    pub fn assignment(&mut self, tokens: &[Token]) -> Result<(String, Reg), StateError> {
        let mut expr = self.parse(tokens)?;
        let position = expr.token.position;

        if expr.children.len() != 2 || !operators::is_assignment(&expr.token.text) {
            return Err(self.error(ErrorKind::UnknownExpression, position).into());
        }

        let target = expr.children[0].clone();
        if !target.is_leaf() || target.token.kind != TokenKind::Identifier {
            return Err(self.error(ErrorKind::UnknownExpression, target.position()).into());
        }
        let name = target.token.text.clone();
        let operator = expr.token.text.clone();
        let mut value = expr.children.remove(1);

        match operator.as_str() {
            "=" | ":=" => self.plain_assignment(&name, &mut value, position),
            _ => self.compound_assignment(&operator, &name, &mut value, position),
        }
    }

    fn plain_assignment(
        &mut self,
        name: &str,
        value: &mut Expression,
        position: Position,
    ) -> Result<(String, Reg), StateError> {
        // Reassignment in the same scope updates the existing binding;
        // assignment over an outer name creates a fresh shadowing one.
        if self.scopes.is_local(name) {
            let variable = self.scopes.get(name).unwrap();
            let register = variable.register;
            let expected = variable.typ;

            let typ = self.expression_to_register(value, register)?;
            if typ != expected {
                return Err(self
                    .error(
                        ErrorKind::InvalidType {
                            got: typ.name().into(),
                            expected: expected.name().into(),
                            parameter: name.into(),
                        },
                        position,
                    )
                    .into());
            }

            let alive_until = self.last_read_position(name, self.cursor, position);
            if let Some(variable) = self.scopes.get_mut(name) {
                variable.alive_until = alive_until;
            }
            return Ok((name.to_string(), register));
        }

        let Some(register) = self.registers.find_free() else {
            return Err(self.error(ErrorKind::ExceededMaxVariables, position).into());
        };
        self.registers
            .use_for(register, RegisterUser::Variable(name.to_string()))
            .map_err(|kind| self.error(kind, position))?;

        let typ = self.expression_to_register(value, register)?;

        let mut variable = Variable::new(name.to_string(), typ, register, position);
        variable.alive_until = self.last_read_position(name, self.cursor, position);
        self.scopes.insert(variable);

        Ok((name.to_string(), register))
    }

    fn compound_assignment(
        &mut self,
        operator: &str,
        name: &str,
        value: &mut Expression,
        position: Position,
    ) -> Result<(String, Reg), StateError> {
        let Some(variable) = self.scopes.get_mut(name) else {
            let kind = self.scopes.unknown_identifier(name);
            return Err(self.error(kind, position).into());
        };
        variable.reads += 1;
        let register = variable.register;

        // Literal operands fold into the immediate instruction forms.
        let literal = number_literal(value);

        match (operator, literal) {
            ("+=", Some(n)) => self.assembler.add_register_number(register, n),
            ("-=", Some(n)) => self.assembler.sub_register_number(register, n),
            ("*=", Some(n)) => self.assembler.mul_register_number(register, n),
            ("<<=", Some(n)) => self.assembler.shift_left_number(register, n),
            (">>=", Some(n)) => self.assembler.shift_right_number(register, n),
            ("/=", _) => {
                let divisor = self.operand_register(value)?;
                self.divide(register, divisor.register, Remainder::No)?;
                self.release_operand(divisor);
            }
            ("<<=" | ">>=", None) => {
                // Shift counts must be literals.
                return Err(self.error(ErrorKind::UnknownExpression, position).into());
            }
            (op, None) => {
                let operand = self.operand_register(value)?;
                match op {
                    "+=" => self.assembler.add_register_register(register, operand.register),
                    "-=" => self.assembler.sub_register_register(register, operand.register),
                    "*=" => self.assembler.mul_register_register(register, operand.register),
                    _ => return Err(self.error(ErrorKind::UnknownExpression, position).into()),
                }
                self.release_operand(operand);
            }
            _ => return Err(self.error(ErrorKind::UnknownExpression, position).into()),
        }

        Ok((name.to_string(), register))
    }

    /// `return [EXPR]`: the value lands in the first return register.
    fn return_statement(&mut self, statement: &[Token]) -> Result<(), StateError> {
        let value = &statement[1..];

        if !value.is_empty() {
            let register = RETURN[0];
            self.claim_register(register, RegisterUser::Temporary, statement[0].position)?;
            let mut expr = self.parse(value)?;
            self.expression_to_register(&mut expr, register)?;
            self.registers.free(register);
        }

        self.assembler.ret();
        Ok(())
    }

    /// `if COND {`: compare and jump past the block when false.
    fn if_start(&mut self, statement: &[Token]) -> Result<(), StateError> {
        let condition = &statement[1..statement.len() - 1];
        if condition.is_empty() {
            return Err(self.error(ErrorKind::UnknownExpression, statement[0].position).into());
        }

        self.scopes.push();
        self.label_counter += 1;
        let end_label = format!("if_{}_end", self.label_counter);

        let mut expr = self.parse(condition)?;
        self.jump_if_false(&mut expr, &end_label)?;

        self.blocks.push(Block::If { end_label });
        Ok(())
    }

    fn block_end(&mut self, position: Position) -> Result<(), StateError> {
        match self.blocks.pop() {
            Some(Block::If { end_label }) => {
                self.pop_scope()?;
                self.assembler.add_label(end_label);
                Ok(())
            }
            Some(Block::For) => self.for_end(),
            None => Err(self.error(ErrorKind::MissingOpeningBracket, position).into()),
        }
    }

    // ── Conditions ───────────────────────────────────────────────────────

    /// Emit a jump to `target` taken when the condition is false.
    pub fn jump_if_false(
        &mut self,
        condition: &mut Expression,
        target: &str,
    ) -> Result<(), StateError> {
        match condition.token.text.as_str() {
            "&&" if !condition.is_leaf() => {
                let mut children = std::mem::take(&mut condition.children);
                self.jump_if_false(&mut children[0], target)?;
                self.jump_if_false(&mut children[1], target)?;
                Ok(())
            }
            "||" if !condition.is_leaf() => {
                self.label_counter += 1;
                let taken = format!("cond_{}", self.label_counter);
                let mut children = std::mem::take(&mut condition.children);
                self.jump_if_true(&mut children[0], &taken)?;
                self.jump_if_false(&mut children[1], target)?;
                self.assembler.add_label(taken);
                Ok(())
            }
            "==" | "!=" | "<" | "<=" | ">" | ">=" if !condition.is_leaf() => {
                let operator = condition.token.text.clone();
                self.compare(condition)?;
                // Jump on the inverse condition.
                match operator.as_str() {
                    "==" => self.assembler.jump_if_not_equal(target),
                    "!=" => self.assembler.jump_if_equal(target),
                    "<" => self.assembler.jump_if_greater_or_equal(target),
                    "<=" => self.assembler.jump_if_greater(target),
                    ">" => self.assembler.jump_if_less_or_equal(target),
                    _ => self.assembler.jump_if_less(target),
                }
                Ok(())
            }
            _ => {
                // Any other expression is tested against zero.
                let operand = self.operand_register(condition)?;
                self.assembler.compare_register_number(operand.register, 0);
                self.release_operand(operand);
                self.assembler.jump_if_equal(target);
                Ok(())
            }
        }
    }

    /// Emit a jump to `target` taken when the condition is true.
    fn jump_if_true(
        &mut self,
        condition: &mut Expression,
        target: &str,
    ) -> Result<(), StateError> {
        match condition.token.text.as_str() {
            "&&" if !condition.is_leaf() => {
                self.label_counter += 1;
                let skipped = format!("cond_{}", self.label_counter);
                let mut children = std::mem::take(&mut condition.children);
                self.jump_if_false(&mut children[0], &skipped)?;
                self.jump_if_true(&mut children[1], target)?;
                self.assembler.add_label(skipped);
                Ok(())
            }
            "||" if !condition.is_leaf() => {
                let mut children = std::mem::take(&mut condition.children);
                self.jump_if_true(&mut children[0], target)?;
                self.jump_if_true(&mut children[1], target)?;
                Ok(())
            }
            "==" | "!=" | "<" | "<=" | ">" | ">=" if !condition.is_leaf() => {
                let operator = condition.token.text.clone();
                self.compare(condition)?;
                match operator.as_str() {
                    "==" => self.assembler.jump_if_equal(target),
                    "!=" => self.assembler.jump_if_not_equal(target),
                    "<" => self.assembler.jump_if_less(target),
                    "<=" => self.assembler.jump_if_less_or_equal(target),
                    ">" => self.assembler.jump_if_greater(target),
                    _ => self.assembler.jump_if_greater_or_equal(target),
                }
                Ok(())
            }
            _ => {
                let operand = self.operand_register(condition)?;
                self.assembler.compare_register_number(operand.register, 0);
                self.release_operand(operand);
                self.assembler.jump_if_not_equal(target);
                Ok(())
            }
        }
    }

    /// Emit the `cmp` for a two-child comparison node.
    fn compare(&mut self, condition: &mut Expression) -> Result<(), StateError> {
        let mut children = std::mem::take(&mut condition.children);
        let (left, right) = children.split_at_mut(1);
        let left = &mut left[0];
        let right = &mut right[0];

        let lhs = self.operand_register(left)?;

        if let Some(number) = number_literal(right) {
            self.assembler.compare_register_number(lhs.register, number);
        } else {
            let rhs = self.operand_register(right)?;
            self.assembler.compare_register_register(lhs.register, rhs.register);
            self.release_operand(rhs);
        }

        self.release_operand(lhs);
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────────────

    /// Evaluate an expression into a specific register, returning its
    /// type. The register must already be claimed by the caller.
    pub fn expression_to_register(
        &mut self,
        expr: &mut Expression,
        target: Reg,
    ) -> Result<Type, StateError> {
        expr.register = Some(target);

        if expr.is_call() {
            // A call with no declared return type still leaves rax; treat
            // the value as a native integer.
            let typ = self.call_expression(expr, Some(target))?.unwrap_or(Type::Int64);
            return Ok(typ);
        }

        if expr.is_leaf() {
            let typ = match expr.token.kind {
                TokenKind::Number => {
                    let value = self.number_value(&expr.token)?;
                    self.assembler.move_register_number(target, value);
                    Type::Int64
                }
                TokenKind::Text => {
                    let id = self.assembler.add_string(&expr.token.text);
                    self.assembler.move_register_address(target, id);
                    Type::Text
                }
                TokenKind::Identifier => {
                    let name = expr.token.text.clone();
                    let Some(variable) = self.scopes.get_mut(&name) else {
                        let kind = self.scopes.unknown_identifier(&name);
                        return Err(self.error(kind, expr.token.position).into());
                    };
                    variable.reads += 1;
                    let (source, typ) = (variable.register, variable.typ);
                    self.assembler.move_register_register(target, source);
                    typ
                }
                _ => {
                    return Err(self
                        .error(ErrorKind::UnknownExpression, expr.token.position)
                        .into())
                }
            };
            expr.typ = Some(typ);
            return Ok(typ);
        }

        // Unary negation
        if expr.token.is_operator("-") && expr.children.len() == 1 {
            let mut child = expr.children.remove(0);
            if let Some(value) = number_literal(&child) {
                self.assembler.move_register_number(target, value.wrapping_neg());
            } else {
                self.expression_to_register(&mut child, target)?;
                self.assembler.negate_register(target);
            }
            expr.typ = Some(Type::Int64);
            return Ok(Type::Int64);
        }

        let operator = expr.token.text.clone();
        let position = expr.token.position;

        if expr.children.len() != 2 {
            return Err(self.error(ErrorKind::UnknownExpression, position).into());
        }
        let mut right = expr.children.remove(1);
        let mut left = expr.children.remove(0);

        let typ = self.expression_to_register(&mut left, target)?;

        match (operator.as_str(), number_literal(&right)) {
            ("+", Some(n)) => self.assembler.add_register_number(target, n),
            ("-", Some(n)) => self.assembler.sub_register_number(target, n),
            ("*", Some(n)) => self.assembler.mul_register_number(target, n),
            ("+" | "-" | "*", None) => {
                let operand = self.operand_register(&mut right)?;
                match operator.as_str() {
                    "+" => self.assembler.add_register_register(target, operand.register),
                    "-" => self.assembler.sub_register_register(target, operand.register),
                    _ => self.assembler.mul_register_register(target, operand.register),
                }
                self.release_operand(operand);
            }
            ("/" | "%", _) => {
                let remainder =
                    if operator == "%" { Remainder::Yes } else { Remainder::No };
                let divisor = self.operand_register(&mut right)?;
                self.divide(target, divisor.register, remainder)?;
                self.release_operand(divisor);
            }
            _ => return Err(self.error(ErrorKind::UnknownExpression, position).into()),
        }

        expr.typ = Some(typ);
        Ok(typ)
    }

    /// Signed division. The dividend is in `target` and the result
    /// (quotient or remainder) lands back in it. rax and rdx are saved
    /// around the sequence unless one of them is the target.
    fn divide(
        &mut self,
        target: Reg,
        divisor: Reg,
        remainder: Remainder,
    ) -> Result<(), StateError> {
        if divisor == Reg::Rax || divisor == Reg::Rdx {
            // The divisor register would be clobbered by cqo/idiv.
            let Some(scratch) = self.registers.find_free_excluding(&[Reg::Rax, Reg::Rdx]) else {
                return Err(self
                    .error(ErrorKind::ExceededMaxVariables, self.statement_start)
                    .into());
            };
            self.assembler.move_register_register(scratch, divisor);
            let result = self.divide_with_scratch(target, scratch, remainder);
            return result;
        }
        self.divide_with_scratch(target, divisor, remainder)
    }

    fn divide_with_scratch(
        &mut self,
        target: Reg,
        divisor: Reg,
        remainder: Remainder,
    ) -> Result<(), StateError> {
        let save_rax = target != Reg::Rax;
        let save_rdx = target != Reg::Rdx;

        if save_rax {
            self.assembler.push_register(Reg::Rax);
        }
        if save_rdx {
            self.assembler.push_register(Reg::Rdx);
        }

        self.assembler.move_register_register(Reg::Rax, target);
        self.assembler.sign_extend_rax();
        self.assembler.divide_register(divisor);

        let result = match remainder {
            Remainder::Yes => Reg::Rdx,
            Remainder::No => Reg::Rax,
        };
        self.assembler.move_register_register(target, result);

        if save_rdx {
            self.assembler.pop_register(Reg::Rdx);
        }
        if save_rax {
            self.assembler.pop_register(Reg::Rax);
        }

        Ok(())
    }

    // ── Operand helpers ──────────────────────────────────────────────────

    /// Materialize an expression for reading: identifiers already bound to
    /// a register are used in place, everything else is evaluated into a
    /// fresh temporary the caller must release.
    pub fn operand_register(&mut self, expr: &mut Expression) -> Result<Operand, StateError> {
        if expr.is_leaf() && expr.token.kind == TokenKind::Identifier {
            let name = expr.token.text.clone();
            let Some(variable) = self.scopes.get_mut(&name) else {
                let kind = self.scopes.unknown_identifier(&name);
                return Err(self.error(kind, expr.token.position).into());
            };
            variable.reads += 1;
            let register = variable.register;
            expr.register = Some(register);
            return Ok(Operand { register, temporary: false });
        }

        let position = expr.token.position;
        let Some(register) = self.registers.find_free() else {
            return Err(self.error(ErrorKind::ExceededMaxVariables, position).into());
        };
        self.registers
            .use_for(register, RegisterUser::Temporary)
            .map_err(|kind| self.error(kind, position))?;
        self.expression_to_register(expr, register)?;
        Ok(Operand { register, temporary: true })
    }

    pub fn release_operand(&mut self, operand: Operand) {
        if operand.temporary {
            self.registers.free(operand.register);
        }
    }

    /// Claim a specific register for a new user. A live variable holding
    /// it is rehomed to a free general register with an emitted `mov`.
    ///
    /// Parameters and temporaries cannot be rehomed: their holders (an
    /// enclosing call or expression in flight) reference the register by
    /// value, so nothing could be told about the move. Such a collision is
    /// register exhaustion, reported as a normal error.
    pub fn claim_register(
        &mut self,
        register: Reg,
        user: RegisterUser,
        position: Position,
    ) -> Result<(), StateError> {
        if self.registers.is_free(register) {
            self.registers.use_for(register, user).map_err(|kind| self.error(kind, position))?;
            return Ok(());
        }

        match self.registers.user(register) {
            Some(RegisterUser::Variable(name)) => {
                let name = name.clone();
                let Some(free) = self.registers.find_free() else {
                    return Err(self.error(ErrorKind::ExceededMaxVariables, position).into());
                };
                self.assembler.move_register_register(free, register);
                self.registers
                    .transfer(register, free)
                    .map_err(|kind| self.error(kind, position))?;
                self.scopes.set_register(&name, free);
                self.registers
                    .use_for(register, user)
                    .map_err(|kind| self.error(kind, position))?;
                Ok(())
            }
            _ => Err(self.error(ErrorKind::ExceededMaxVariables, position).into()),
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────

    /// Free the registers of variables whose liveness expired. Unread
    /// variables are kept so the unused check still fires at scope close.
    ///
    /// Liveness positions come from a linear scan, which says nothing
    /// about reads reached again through a loop back-edge, so nothing is
    /// reaped while a loop is open.
    fn release_dead_variables(&mut self, position: Position) {
        if !self.for_state.stack.is_empty() {
            return;
        }

        let mut freed = Vec::new();
        for register in crate::backend::registers::GENERAL {
            if let Some(RegisterUser::Variable(name)) = self.registers.user(register) {
                if let Some(variable) = self.scopes.get(name) {
                    if variable.reads > 0 && variable.alive_until < position {
                        freed.push(register);
                    }
                }
            }
        }
        for register in freed {
            self.registers.free(register);
        }
    }

    /// Close the innermost scope; report the first variable that was
    /// never read and free the scope's registers.
    pub fn pop_scope(&mut self) -> Result<(), StateError> {
        let variables = self.scopes.pop();

        for variable in &variables {
            self.registers.free(variable.register);
        }

        for variable in &variables {
            if variable.reads == 0 {
                return Err(self
                    .error(ErrorKind::VariableUnused(variable.name.clone()), variable.position)
                    .into());
            }
        }

        Ok(())
    }

    /// Position of the last read of `name` in the remaining body tokens.
    pub fn last_read_position(&self, name: &str, from: usize, default: Position) -> Position {
        self.tokens[from..]
            .iter()
            .rev()
            .find(|t| t.kind == TokenKind::Identifier && t.text == name)
            .map(|t| t.position)
            .unwrap_or(default)
    }

    pub fn fresh_for_labels(&mut self) -> (String, String) {
        self.for_state.counter += 1;
        let n = self.for_state.counter;
        (format!("for_{}", n), format!("for_{}_end", n))
    }

    pub fn parse(&self, tokens: &[Token]) -> Result<Expression, CompileError> {
        expression::parse(tokens).map_err(|e| self.locate(e))
    }

    pub fn number_value(&self, token: &Token) -> Result<i64, CompileError> {
        parse_number(&token.text)
            .ok_or_else(|| self.error(ErrorKind::UnknownExpression, token.position))
    }

    pub fn error(&self, kind: ErrorKind, position: Position) -> CompileError {
        CompileError::new(kind, &self.function.file, position)
    }

    pub fn locate(&self, error: PositionedError) -> CompileError {
        error.in_file(&self.function.file)
    }

    fn last_position(&self) -> Position {
        self.tokens.last().map(|t| t.position).unwrap_or_default()
    }
}

/// Whether a division keeps the quotient or the remainder.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Remainder {
    Yes,
    No,
}

/// An expression operand resolved to a register, tracking whether the
/// register is a temporary that must be released after use.
pub struct Operand {
    pub register: Reg,
    pub temporary: bool,
}

/// The index of the top-level assignment operator in a statement, if any.
pub fn find_assignment_operator(tokens: &[Token]) -> Option<usize> {
    let mut depth = 0i32;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::GroupStart => depth += 1,
            TokenKind::GroupEnd => depth -= 1,
            TokenKind::Operator if depth == 0 && operators::is_assignment(&token.text) => {
                return Some(i)
            }
            _ => {}
        }
    }
    None
}

/// The value of a number literal leaf, if the expression is one.
/// Negated literals fold here as well.
pub fn number_literal(expr: &Expression) -> Option<i64> {
    if expr.is_leaf() && expr.token.kind == TokenKind::Number {
        return parse_number(&expr.token.text);
    }
    if expr.token.is_operator("-") && expr.children.len() == 1 {
        return number_literal(&expr.children[0]).map(i64::wrapping_neg);
    }
    None
}

fn parse_number(text: &str) -> Option<i64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as i64);
    }
    text.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_parsing() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x2A"), Some(42));
        assert_eq!(parse_number("0xFFFFFFFFFFFFFFFF"), Some(-1));
        assert_eq!(parse_number("abc"), None);
    }

    #[test]
    fn assignment_operator_detection() {
        use crate::frontend::lexer::tokenize;
        let tokens = tokenize("a := f(b = 1)", "test.q").unwrap();
        assert_eq!(find_assignment_operator(&tokens), Some(1));
        let tokens = tokenize("f(1, 2)", "test.q").unwrap();
        assert_eq!(find_assignment_operator(&tokens), None);
    }
}
