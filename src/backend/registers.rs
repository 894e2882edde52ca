//! The register file: usage tracking over the x86-64 general purpose
//! registers, partitioned into the allocation pool and the ABI lists.
//!
//! Every register has at most one user at a time. `use_for` and `free` are
//! the only state transitions; exhaustion of the general pool is a normal
//! error value, not a panic.

use std::collections::HashMap;

use crate::asm::Reg;
use crate::common::error::ErrorKind;

/// What currently owns a register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterUser {
    /// A named variable binding.
    Variable(String),
    /// A function parameter materialized for a call in flight.
    Parameter(String),
    /// A transient expression value. The holder is responsible for freeing.
    Temporary,
}

/// Allocation candidates, ordered so that the ABI registers are picked
/// last. rsp and rbp are never allocated.
pub const GENERAL: [Reg; 14] = [
    Reg::Rbx,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::R10,
    Reg::R11,
    Reg::R9,
    Reg::R8,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::Rax,
];

/// Argument order for user function calls (System V).
pub const CALL: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Argument order for syscalls: number first, then up to six arguments.
pub const SYSCALL: [Reg; 7] =
    [Reg::Rax, Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9];

/// Return value registers.
pub const RETURN: [Reg; 1] = [Reg::Rax];

/// Registers the kernel clobbers on `syscall`, beyond the result in rax.
pub const SYSCALL_CLOBBERS: [Reg; 3] = [Reg::Rax, Reg::Rcx, Reg::R11];

/// The union of both argument lists. Scratch values that live across a
/// call sequence (pre-evaluated arguments) are kept out of these so an
/// inner call can always claim its slots.
pub const ARGUMENT_REGISTERS: [Reg; 8] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
];

/// Tracks the user of every register. Each function compile owns a fresh
/// instance.
#[derive(Debug, Default)]
pub struct RegisterFile {
    users: HashMap<Reg, RegisterUser>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_free(&self, register: Reg) -> bool {
        !self.users.contains_key(&register)
    }

    pub fn user(&self, register: Reg) -> Option<&RegisterUser> {
        self.users.get(&register)
    }

    /// Claim a register. The caller must have relocated or freed any
    /// previous user first.
    pub fn use_for(&mut self, register: Reg, user: RegisterUser) -> Result<(), ErrorKind> {
        if self.users.contains_key(&register) {
            return Err(ErrorKind::ExceededMaxVariables);
        }
        self.users.insert(register, user);
        Ok(())
    }

    /// Release a register. Freeing a free register is a no-op.
    pub fn free(&mut self, register: Reg) {
        self.users.remove(&register);
    }

    /// Move a binding between registers without touching emitted code.
    pub fn transfer(&mut self, from: Reg, to: Reg) -> Result<(), ErrorKind> {
        let Some(user) = self.users.remove(&from) else {
            return Err(ErrorKind::ExceededMaxVariables);
        };
        self.use_for(to, user)
    }

    /// Any free register from the general pool.
    pub fn find_free(&self) -> Option<Reg> {
        GENERAL.iter().copied().find(|r| self.is_free(*r))
    }

    /// Any free general register outside the given exclusion list. Used by
    /// the division sequence, which needs scratch space that is neither
    /// rax nor rdx.
    pub fn find_free_excluding(&self, excluded: &[Reg]) -> Option<Reg> {
        GENERAL.iter().copied().find(|r| self.is_free(*r) && !excluded.contains(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_user_invariant() {
        let mut registers = RegisterFile::new();
        assert!(registers.use_for(Reg::Rbx, RegisterUser::Temporary).is_ok());
        assert_eq!(
            registers.use_for(Reg::Rbx, RegisterUser::Variable("a".into())),
            Err(ErrorKind::ExceededMaxVariables)
        );
        registers.free(Reg::Rbx);
        assert!(registers.use_for(Reg::Rbx, RegisterUser::Variable("a".into())).is_ok());
        assert_eq!(registers.user(Reg::Rbx), Some(&RegisterUser::Variable("a".into())));
    }

    #[test]
    fn free_is_idempotent() {
        let mut registers = RegisterFile::new();
        registers.free(Reg::R10);
        registers.free(Reg::R10);
        assert!(registers.is_free(Reg::R10));
    }

    #[test]
    fn find_free_prefers_non_abi_registers() {
        let registers = RegisterFile::new();
        assert_eq!(registers.find_free(), Some(Reg::Rbx));
    }

    #[test]
    fn pool_exhaustion() {
        let mut registers = RegisterFile::new();
        for reg in GENERAL {
            registers.use_for(reg, RegisterUser::Temporary).unwrap();
        }
        assert_eq!(registers.find_free(), None);
    }

    #[test]
    fn exclusion() {
        let mut registers = RegisterFile::new();
        for reg in GENERAL {
            if reg != Reg::Rax && reg != Reg::Rdx {
                registers.use_for(reg, RegisterUser::Temporary).unwrap();
            }
        }
        assert_eq!(registers.find_free_excluding(&[Reg::Rax, Reg::Rdx]), None);
        assert_eq!(registers.find_free(), Some(Reg::Rdx));
    }

    #[test]
    fn transfer_moves_the_binding() {
        let mut registers = RegisterFile::new();
        registers.use_for(Reg::Rdi, RegisterUser::Variable("x".into())).unwrap();
        registers.transfer(Reg::Rdi, Reg::Rbx).unwrap();
        assert!(registers.is_free(Reg::Rdi));
        assert_eq!(registers.user(Reg::Rbx), Some(&RegisterUser::Variable("x".into())));
    }

    #[test]
    fn stack_registers_are_never_allocated() {
        assert!(!GENERAL.contains(&Reg::Rsp));
        assert!(!GENERAL.contains(&Reg::Rbp));
    }

    #[test]
    fn argument_registers_cover_both_abi_lists() {
        for reg in CALL.iter().chain(SYSCALL.iter()) {
            assert!(ARGUMENT_REGISTERS.contains(reg), "missing {}", reg);
        }
        // Enough general registers remain for call-spanning scratch values.
        let scratch = GENERAL.iter().filter(|r| !ARGUMENT_REGISTERS.contains(r)).count();
        assert!(scratch >= 6);
    }
}
