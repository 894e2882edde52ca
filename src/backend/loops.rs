//! `for` loops: `for [VAR =] START .. LIMIT { ... }`.
//!
//! The counter either binds a variable (when an assignment appears before
//! the range) or lives in an anonymous register from the general pool.
//! The limit is re-evaluated every iteration; both registers are released
//! when the loop closes.

use crate::asm::Reg;
use crate::common::error::ErrorKind;
use crate::frontend::token::{index_of, Token, TokenKind};

use super::registers::RegisterUser;
use super::state::{find_assignment_operator, Block, State, StateError};

/// Per-function loop compilation state: a monotonic counter for label
/// generation and the stack of loops currently open.
#[derive(Debug, Default)]
pub struct ForState {
    pub counter: u32,
    pub stack: Vec<ForLoop>,
}

impl ForState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One active loop.
#[derive(Debug)]
pub struct ForLoop {
    pub label_start: String,
    pub label_end: String,
    pub counter: Reg,
    /// Name of the counter variable, when the loop head bound one. The
    /// close re-resolves the register through the scope in case the
    /// variable was rehomed inside the body.
    pub counter_name: Option<String>,
    /// Register holding the evaluated limit, unless the limit was folded
    /// into an immediate compare.
    pub limit: Option<Reg>,
    /// Anonymous counters are freed by the loop itself; named ones belong
    /// to the loop scope.
    pub anonymous: bool,
}

impl<'e> State<'e> {
    /// Compile the head of a loop. The statement ends with `{`.
    pub fn for_start(&mut self, statement: &[Token]) -> Result<(), StateError> {
        let keyword = &statement[0];
        let expression = &statement[1..statement.len() - 1];

        self.scopes.push();

        let Some(range_position) = index_of(expression, TokenKind::Range) else {
            return Err(self.error(ErrorKind::MissingRange, keyword.position).into());
        };

        let mut counter_name = None;
        let (counter, anonymous) = if find_assignment_operator(&expression[..range_position])
            .is_some()
        {
            let (name, register) = self.assignment(&expression[..range_position])?;
            // The loop compare reads the counter every iteration.
            if let Some(variable) = self.scopes.get_mut(&name) {
                variable.reads += 1;
            }
            counter_name = Some(name);
            (register, false)
        } else {
            let start = &expression[..range_position];
            if start.is_empty() {
                return Err(self.error(ErrorKind::MissingRangeStart, keyword.position).into());
            }

            let Some(register) = self.registers.find_free() else {
                return Err(self.error(ErrorKind::ExceededMaxVariables, keyword.position).into());
            };
            self.registers
                .use_for(register, RegisterUser::Temporary)
                .map_err(|kind| self.error(kind, keyword.position))?;

            let mut start_expr = self.parse(start)?;
            self.expression_to_register(&mut start_expr, register)?;
            (register, true)
        };

        let (label_start, label_end) = self.fresh_for_labels();
        self.assembler.add_label(label_start.clone());

        let limit = &expression[range_position + 1..];
        if limit.is_empty() {
            return Err(self.error(ErrorKind::MissingRangeLimit, keyword.position).into());
        }

        // Literal limits fold into the compare; everything else is
        // re-evaluated into a reserved register each iteration.
        let limit_register = if limit.len() == 1 && limit[0].kind == TokenKind::Number {
            let value = self.number_value(&limit[0])?;
            self.assembler.compare_register_number(counter, value);
            None
        } else {
            let Some(register) = self.registers.find_free() else {
                return Err(self.error(ErrorKind::ExceededMaxVariables, keyword.position).into());
            };
            self.registers
                .use_for(register, RegisterUser::Temporary)
                .map_err(|kind| self.error(kind, keyword.position))?;
            let mut limit_expr = self.parse(limit)?;
            self.expression_to_register(&mut limit_expr, register)?;
            self.assembler.compare_register_register(counter, register);
            Some(register)
        };

        self.assembler.jump_if_equal(label_end.clone());

        self.for_state.stack.push(ForLoop {
            label_start,
            label_end,
            counter,
            counter_name,
            limit: limit_register,
            anonymous,
        });
        self.blocks.push(Block::For);

        Ok(())
    }

    /// Close the innermost loop: advance the counter, jump back, place the
    /// end label, release the loop registers.
    pub fn for_end(&mut self) -> Result<(), StateError> {
        let loop_ = self.for_state.stack.pop().expect("for loop stack is empty");

        // The counter variable may have moved since the loop head.
        let counter = loop_
            .counter_name
            .as_deref()
            .and_then(|name| self.scopes.get(name))
            .map(|variable| variable.register)
            .unwrap_or(loop_.counter);

        self.pop_scope()?;

        self.assembler.increase_register(counter);
        self.assembler.jump(loop_.label_start);
        self.assembler.add_label(loop_.label_end);

        if loop_.anonymous {
            self.registers.free(loop_.counter);
        }
        if let Some(limit) = loop_.limit {
            self.registers.free(limit);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_state_counts_up() {
        let mut state = ForState::new();
        state.counter += 1;
        state.counter += 1;
        assert_eq!(state.counter, 2);
        assert!(state.stack.is_empty());
    }
}
