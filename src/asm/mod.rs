//! The assembler: an ordered list of instruction records with labels and a
//! deduplicating string pool, encoded to machine bytes by `encoder` and
//! wrapped into an executable image by `elf`.

pub mod elf;
pub mod encoder;
pub mod instruction;

pub use instruction::{Item, Mnemonic, Operands, Reg, StringId};

use std::collections::{HashMap, HashSet};

/// Deduplicated text literals, concatenated in intern order. Entry
/// addresses become known once the data segment is placed.
#[derive(Debug, Clone, Default)]
pub struct StringPool {
    data: Vec<u8>,
    offsets: Vec<usize>,
    lookup: HashMap<String, StringId>,
}

impl StringPool {
    pub fn intern(&mut self, text: &str) -> StringId {
        if let Some(&id) = self.lookup.get(text) {
            return id;
        }
        let id = StringId(self.offsets.len());
        self.offsets.push(self.data.len());
        self.data.extend_from_slice(text.as_bytes());
        self.lookup.insert(text.to_string(), id);
        id
    }

    pub fn get(&self, id: StringId) -> &str {
        let start = self.offsets[id.0];
        let end = self.offsets.get(id.0 + 1).copied().unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[start..end]).unwrap_or_default()
    }

    /// Byte offset of an entry within the data segment.
    pub fn offset(&self, id: StringId) -> usize {
        self.offsets[id.0]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Holds the instruction stream of one function, or of the final linked
/// program.
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    pub items: Vec<Item>,
    pub strings: StringPool,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mnemonic: Mnemonic, operands: Operands) {
        self.items.push(Item::Instruction { mnemonic, operands });
    }

    pub fn add_label(&mut self, name: impl Into<String>) {
        self.items.push(Item::Label(name.into()));
    }

    pub fn add_string(&mut self, text: &str) -> StringId {
        self.strings.intern(text)
    }

    /// Emit `ret`, unless the previous instruction already returns.
    pub fn ret(&mut self) {
        if let Some(Item::Instruction { mnemonic: Mnemonic::Ret, .. }) = self.items.last() {
            return;
        }
        self.push(Mnemonic::Ret, Operands::None);
    }

    pub fn syscall(&mut self) {
        self.push(Mnemonic::Syscall, Operands::None);
    }

    pub fn call(&mut self, label: impl Into<String>) {
        self.push(Mnemonic::Call, Operands::Label(label.into()));
    }

    pub fn jump(&mut self, label: impl Into<String>) {
        self.push(Mnemonic::Jmp, Operands::Label(label.into()));
    }

    pub fn jump_if_equal(&mut self, label: impl Into<String>) {
        self.push(Mnemonic::Je, Operands::Label(label.into()));
    }

    pub fn jump_if_not_equal(&mut self, label: impl Into<String>) {
        self.push(Mnemonic::Jne, Operands::Label(label.into()));
    }

    pub fn jump_if_less(&mut self, label: impl Into<String>) {
        self.push(Mnemonic::Jl, Operands::Label(label.into()));
    }

    pub fn jump_if_less_or_equal(&mut self, label: impl Into<String>) {
        self.push(Mnemonic::Jle, Operands::Label(label.into()));
    }

    pub fn jump_if_greater(&mut self, label: impl Into<String>) {
        self.push(Mnemonic::Jg, Operands::Label(label.into()));
    }

    pub fn jump_if_greater_or_equal(&mut self, label: impl Into<String>) {
        self.push(Mnemonic::Jge, Operands::Label(label.into()));
    }

    /// `mov dst, src`, suppressed when both sides are the same register.
    pub fn move_register_register(&mut self, destination: Reg, source: Reg) {
        if destination == source {
            return;
        }
        self.push(Mnemonic::Mov, Operands::RegReg(destination, source));
    }

    /// Load an immediate. Zero is emitted as `xor r, r`.
    pub fn move_register_number(&mut self, destination: Reg, number: i64) {
        if number == 0 {
            self.push(Mnemonic::Xor, Operands::RegReg(destination, destination));
            return;
        }
        self.push(Mnemonic::Mov, Operands::RegImm(destination, number));
    }

    pub fn move_register_address(&mut self, destination: Reg, address: StringId) {
        self.push(Mnemonic::Mov, Operands::RegAddr(destination, address));
    }

    pub fn compare_register_register(&mut self, destination: Reg, source: Reg) {
        self.push(Mnemonic::Cmp, Operands::RegReg(destination, source));
    }

    pub fn compare_register_number(&mut self, destination: Reg, number: i64) {
        self.push(Mnemonic::Cmp, Operands::RegImm(destination, number));
    }

    pub fn add_register_register(&mut self, destination: Reg, source: Reg) {
        self.push(Mnemonic::Add, Operands::RegReg(destination, source));
    }

    pub fn add_register_number(&mut self, destination: Reg, number: i64) {
        self.push(Mnemonic::Add, Operands::RegImm(destination, number));
    }

    pub fn sub_register_register(&mut self, destination: Reg, source: Reg) {
        self.push(Mnemonic::Sub, Operands::RegReg(destination, source));
    }

    pub fn sub_register_number(&mut self, destination: Reg, number: i64) {
        self.push(Mnemonic::Sub, Operands::RegImm(destination, number));
    }

    pub fn mul_register_register(&mut self, destination: Reg, source: Reg) {
        self.push(Mnemonic::Mul, Operands::RegReg(destination, source));
    }

    pub fn mul_register_number(&mut self, destination: Reg, number: i64) {
        self.push(Mnemonic::Mul, Operands::RegImm(destination, number));
    }

    /// `idiv src`: divides rdx:rax, leaving the quotient in rax and the
    /// remainder in rdx.
    pub fn divide_register(&mut self, source: Reg) {
        self.push(Mnemonic::Div, Operands::Reg(source));
    }

    /// `cqo`: sign-extend rax into rdx:rax before a division.
    pub fn sign_extend_rax(&mut self) {
        self.push(Mnemonic::SignExtend, Operands::None);
    }

    pub fn negate_register(&mut self, destination: Reg) {
        self.push(Mnemonic::Neg, Operands::Reg(destination));
    }

    pub fn shift_left_number(&mut self, destination: Reg, number: i64) {
        self.push(Mnemonic::Shl, Operands::RegImm(destination, number));
    }

    pub fn shift_right_number(&mut self, destination: Reg, number: i64) {
        self.push(Mnemonic::Shr, Operands::RegImm(destination, number));
    }

    pub fn increase_register(&mut self, destination: Reg) {
        self.push(Mnemonic::Inc, Operands::Reg(destination));
    }

    pub fn decrease_register(&mut self, destination: Reg) {
        self.push(Mnemonic::Dec, Operands::Reg(destination));
    }

    pub fn push_register(&mut self, source: Reg) {
        self.push(Mnemonic::Push, Operands::Reg(source));
    }

    pub fn pop_register(&mut self, destination: Reg) {
        self.push(Mnemonic::Pop, Operands::Reg(destination));
    }

    /// Store an immediate at `[base + offset]`, truncated to `size` bytes.
    pub fn store_number(&mut self, base: Reg, offset: i8, size: u8, value: u64) {
        self.push(Mnemonic::Store, Operands::MemImm { base, offset, size, value });
    }

    /// Number of instructions, not counting label definitions.
    pub fn instruction_count(&self) -> usize {
        self.items.iter().filter(|i| matches!(i, Item::Instruction { .. })).count()
    }

    pub fn has_labels(&self) -> bool {
        self.items.iter().any(|i| matches!(i, Item::Label(_)))
    }

    /// Registers written anywhere in the stream, including the implicit
    /// targets of division and syscalls.
    pub fn written_registers(&self) -> HashSet<Reg> {
        self.items.iter().flat_map(|i| i.written_registers()).collect()
    }

    fn defined_labels(&self) -> HashSet<&str> {
        self.items
            .iter()
            .filter_map(|i| match i {
                Item::Label(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Append another assembler's stream, relocating its internal labels
    /// into the given namespace. References to labels the other stream does
    /// not define (calls into other functions) are left untouched. String
    /// pool entries are re-interned and operands remapped.
    pub fn merge(&mut self, other: &Assembler, namespace: &str) {
        let local: HashSet<String> = other.defined_labels().iter().map(|s| s.to_string()).collect();

        for item in &other.items {
            match item {
                Item::Label(name) => {
                    self.items.push(Item::Label(format!("{}.{}", namespace, name)));
                }
                Item::Instruction { mnemonic, operands } => {
                    let operands = match operands {
                        Operands::Label(target) if local.contains(target) => {
                            Operands::Label(format!("{}.{}", namespace, target))
                        }
                        Operands::RegAddr(reg, id) => {
                            Operands::RegAddr(*reg, self.strings.intern(other.strings.get(*id)))
                        }
                        other => other.clone(),
                    };
                    self.items.push(Item::Instruction { mnemonic: *mnemonic, operands });
                }
            }
        }
    }

    /// Append a small function body at a call site, dropping its trailing
    /// `ret`. Only bodies without labels qualify for inlining.
    pub fn inline_body(&mut self, other: &Assembler) {
        let mut items: &[Item] = &other.items;
        if let Some(Item::Instruction { mnemonic: Mnemonic::Ret, .. }) = items.last() {
            items = &items[..items.len() - 1];
        }

        for item in items {
            match item {
                Item::Label(_) => {}
                Item::Instruction { mnemonic, operands } => {
                    let operands = match operands {
                        Operands::RegAddr(reg, id) => {
                            Operands::RegAddr(*reg, self.strings.intern(other.strings.get(*id)))
                        }
                        other => other.clone(),
                    };
                    self.items.push(Item::Instruction { mnemonic: *mnemonic, operands });
                }
            }
        }
    }

    /// Check that every referenced label has a definition.
    pub fn verify(&self) -> Result<(), String> {
        let defined = self.defined_labels();

        for item in &self.items {
            if let Item::Instruction { operands: Operands::Label(target), .. } = item {
                if !defined.contains(target.as_str()) {
                    return Err(format!("Undefined label '{}'", target));
                }
            }
        }

        Ok(())
    }

    /// Human-readable listing for verbose output.
    pub fn listing(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for item in &self.items {
            match item {
                Item::Label(name) => {
                    let _ = writeln!(out, "{}:", name);
                }
                Item::Instruction { mnemonic, operands } => {
                    let _ = write!(out, "    {}", mnemonic.name());
                    match operands {
                        Operands::None => {}
                        Operands::Reg(r) => {
                            let _ = write!(out, " {}", r);
                        }
                        Operands::RegReg(a, b) => {
                            let _ = write!(out, " {}, {}", a, b);
                        }
                        Operands::RegImm(r, n) => {
                            let _ = write!(out, " {}, {}", r, n);
                        }
                        Operands::RegAddr(r, id) => {
                            let _ = write!(out, " {}, {:?}", r, self.strings.get(*id));
                        }
                        Operands::MemImm { base, offset, size, value } => {
                            let _ = write!(out, " [{}+{}], {} ({} bytes)", base, offset, value, size);
                        }
                        Operands::Label(target) => {
                            let _ = write!(out, " {}", target);
                        }
                    }
                    let _ = writeln!(out);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_pool_deduplicates() {
        let mut pool = StringPool::default();
        let a = pool.intern("Hello\n");
        let b = pool.intern("World\n");
        let c = pool.intern("Hello\n");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.get(a), "Hello\n");
        assert_eq!(pool.get(b), "World\n");
        assert_eq!(pool.offset(b), 6);
        assert_eq!(pool.len(), 12);
    }

    #[test]
    fn ret_is_not_duplicated() {
        let mut asm = Assembler::new();
        asm.ret();
        asm.ret();
        assert_eq!(asm.instruction_count(), 1);
    }

    #[test]
    fn mov_same_register_is_suppressed() {
        let mut asm = Assembler::new();
        asm.move_register_register(Reg::Rax, Reg::Rax);
        assert_eq!(asm.instruction_count(), 0);
        asm.move_register_register(Reg::Rax, Reg::Rbx);
        assert_eq!(asm.instruction_count(), 1);
    }

    #[test]
    fn zero_load_becomes_xor() {
        let mut asm = Assembler::new();
        asm.move_register_number(Reg::Rdi, 0);
        assert_eq!(
            asm.items[0],
            Item::Instruction {
                mnemonic: Mnemonic::Xor,
                operands: Operands::RegReg(Reg::Rdi, Reg::Rdi)
            }
        );
    }

    #[test]
    fn merge_namespaces_local_labels() {
        let mut body = Assembler::new();
        body.add_label("for_1");
        body.jump("for_1");
        body.call("other|0");
        body.ret();

        let mut main = Assembler::new();
        main.add_label("f|0");
        main.merge(&body, "f|0");

        assert_eq!(main.items[1], Item::Label("f|0.for_1".into()));
        assert_eq!(
            main.items[2],
            Item::Instruction {
                mnemonic: Mnemonic::Jmp,
                operands: Operands::Label("f|0.for_1".into())
            }
        );
        // Cross-function call target is untouched.
        assert_eq!(
            main.items[3],
            Item::Instruction {
                mnemonic: Mnemonic::Call,
                operands: Operands::Label("other|0".into())
            }
        );
    }

    #[test]
    fn merge_remaps_strings() {
        let mut body = Assembler::new();
        let id = body.add_string("xyz\n");
        body.move_register_address(Reg::Rsi, id);

        let mut main = Assembler::new();
        main.add_string("abc\n");
        main.merge(&body, "f|0");

        let Item::Instruction { operands: Operands::RegAddr(_, merged), .. } = &main.items[0]
        else {
            panic!("expected address load");
        };
        assert_eq!(main.strings.get(*merged), "xyz\n");
        assert_eq!(main.strings.offset(*merged), 4);
    }

    #[test]
    fn verify_reports_undefined_labels() {
        let mut asm = Assembler::new();
        asm.call("missing|0");
        assert!(asm.verify().is_err());
        asm.add_label("missing|0");
        assert!(asm.verify().is_ok());
    }

    #[test]
    fn inline_drops_trailing_ret() {
        let mut body = Assembler::new();
        body.move_register_number(Reg::Rax, 7);
        body.ret();

        let mut caller = Assembler::new();
        caller.inline_body(&body);
        assert_eq!(caller.instruction_count(), 1);
    }
}
