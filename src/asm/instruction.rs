//! Instruction records: the mnemonic-level IR the code generator emits and
//! the encoder turns into machine bytes.

/// A general-purpose x86-64 register, identified by canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// 4-bit register index as used in instruction encoding.
    pub fn index(self) -> u8 {
        match self {
            Reg::Rax => 0,
            Reg::Rcx => 1,
            Reg::Rdx => 2,
            Reg::Rbx => 3,
            Reg::Rsp => 4,
            Reg::Rbp => 5,
            Reg::Rsi => 6,
            Reg::Rdi => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::R13 => 13,
            Reg::R14 => 14,
            Reg::R15 => 15,
        }
    }

    /// The 3-bit field in ModR/M and SIB bytes.
    pub fn low3(self) -> u8 {
        self.index() & 7
    }

    /// Does this register need a REX extension bit (r8-r15)?
    pub fn needs_ext(self) -> bool {
        self.index() >= 8
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Index of an interned text literal in an assembler's string pool. The
/// absolute virtual address only exists once the ELF layout is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId(pub usize);

/// Instruction mnemonics. All integer operations are 64-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Mov,
    Cmp,
    Add,
    Sub,
    Mul,
    Div,
    SignExtend,
    Neg,
    Xor,
    Shl,
    Shr,
    Inc,
    Dec,
    Push,
    Pop,
    Ret,
    Syscall,
    Call,
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    Store,
}

impl Mnemonic {
    pub fn name(self) -> &'static str {
        match self {
            Mnemonic::Mov => "mov",
            Mnemonic::Cmp => "cmp",
            Mnemonic::Add => "add",
            Mnemonic::Sub => "sub",
            Mnemonic::Mul => "imul",
            Mnemonic::Div => "idiv",
            Mnemonic::SignExtend => "cqo",
            Mnemonic::Neg => "neg",
            Mnemonic::Xor => "xor",
            Mnemonic::Shl => "shl",
            Mnemonic::Shr => "shr",
            Mnemonic::Inc => "inc",
            Mnemonic::Dec => "dec",
            Mnemonic::Push => "push",
            Mnemonic::Pop => "pop",
            Mnemonic::Ret => "ret",
            Mnemonic::Syscall => "syscall",
            Mnemonic::Call => "call",
            Mnemonic::Jmp => "jmp",
            Mnemonic::Je => "je",
            Mnemonic::Jne => "jne",
            Mnemonic::Jl => "jl",
            Mnemonic::Jle => "jle",
            Mnemonic::Jg => "jg",
            Mnemonic::Jge => "jge",
            Mnemonic::Store => "store",
        }
    }

    /// Is this a conditional or unconditional jump (subject to short-jump
    /// compaction)?
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Mnemonic::Jmp
                | Mnemonic::Je
                | Mnemonic::Jne
                | Mnemonic::Jl
                | Mnemonic::Jle
                | Mnemonic::Jg
                | Mnemonic::Jge
        )
    }

    /// Does the instruction write its first register operand?
    pub fn writes_first_operand(self) -> bool {
        matches!(
            self,
            Mnemonic::Mov
                | Mnemonic::Add
                | Mnemonic::Sub
                | Mnemonic::Mul
                | Mnemonic::Neg
                | Mnemonic::Xor
                | Mnemonic::Shl
                | Mnemonic::Shr
                | Mnemonic::Inc
                | Mnemonic::Dec
                | Mnemonic::Pop
        )
    }
}

/// Operand descriptor for an instruction record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operands {
    None,
    Reg(Reg),
    RegReg(Reg, Reg),
    RegImm(Reg, i64),
    /// Load the absolute address of an interned string.
    RegAddr(Reg, StringId),
    /// Store `value`, truncated to `size` bytes, at `[base + offset]`.
    MemImm { base: Reg, offset: i8, size: u8, value: u64 },
    /// Jump or call target.
    Label(String),
}

/// One element of an assembler's instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// A label definition.
    Label(String),
    Instruction { mnemonic: Mnemonic, operands: Operands },
}

impl Item {
    /// The register this item writes, if any. `Div` and `SignExtend`
    /// implicitly write rax and rdx, `Syscall` clobbers the kernel's
    /// scratch registers.
    pub fn written_registers(&self) -> Vec<Reg> {
        let Item::Instruction { mnemonic, operands } = self else {
            return Vec::new();
        };

        match mnemonic {
            Mnemonic::Div | Mnemonic::SignExtend => return vec![Reg::Rax, Reg::Rdx],
            Mnemonic::Syscall => return vec![Reg::Rax, Reg::Rcx, Reg::R11],
            _ => {}
        }

        if !mnemonic.writes_first_operand() {
            return Vec::new();
        }

        match operands {
            Operands::Reg(r)
            | Operands::RegReg(r, _)
            | Operands::RegImm(r, _)
            | Operands::RegAddr(r, _) => vec![*r],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_numbering() {
        assert_eq!(Reg::Rax.low3(), 0);
        assert_eq!(Reg::Rdi.low3(), 7);
        assert_eq!(Reg::R8.low3(), 0);
        assert_eq!(Reg::R15.low3(), 7);
        assert!(!Reg::Rdi.needs_ext());
        assert!(Reg::R8.needs_ext());
    }

    #[test]
    fn written_registers() {
        let mov = Item::Instruction {
            mnemonic: Mnemonic::Mov,
            operands: Operands::RegReg(Reg::Rbx, Reg::Rax),
        };
        assert_eq!(mov.written_registers(), vec![Reg::Rbx]);

        let cmp = Item::Instruction {
            mnemonic: Mnemonic::Cmp,
            operands: Operands::RegReg(Reg::Rbx, Reg::Rax),
        };
        assert!(cmp.written_registers().is_empty());

        let div = Item::Instruction { mnemonic: Mnemonic::Div, operands: Operands::Reg(Reg::Rbx) };
        assert_eq!(div.written_registers(), vec![Reg::Rax, Reg::Rdx]);
    }
}
