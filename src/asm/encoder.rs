//! x86-64 machine code emission.
//!
//! Encoding runs in two passes over the instruction stream: the first
//! assigns provisional offsets assuming 32-bit jump displacements, then
//! jumps whose displacement fits in 8 bits are compacted until the layout
//! is stable; the second pass emits final bytes with resolved label
//! displacements and string pool addresses.
//!
//! All register-register and register-immediate integer operations are
//! encoded with 64-bit operand size. Immediate loads of small positive
//! values use the 32-bit zero-extending form.

use std::collections::HashMap;

use super::instruction::{Item, Mnemonic, Operands, Reg};
use super::Assembler;

/// The encoded program: machine code plus the placed data segment.
pub struct Program {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub data_vaddr: u64,
}

/// Encode an assembler's stream. `text_vaddr` is the virtual address the
/// first instruction will be loaded at; the data segment (string pool) is
/// placed directly after the code, aligned to 8 bytes.
pub fn encode(asm: &Assembler, text_vaddr: u64) -> Result<Program, String> {
    // Compaction fixpoint: shrinking a jump only ever shortens distances,
    // so repeatedly widening the short set terminates.
    let mut short = vec![false; asm.items.len()];

    let mut labels = layout(asm, &short)?;
    loop {
        let mut changed = false;

        let mut offset = 0u64;
        for (index, item) in asm.items.iter().enumerate() {
            let size = instruction_size(item, short[index]);
            if let Item::Instruction { mnemonic, operands: Operands::Label(target) } = item {
                if mnemonic.is_jump() && !short[index] {
                    let target_offset = *labels
                        .get(target.as_str())
                        .ok_or_else(|| format!("Undefined label '{}'", target))?;
                    // Displacement relative to the end of the short form.
                    let short_size = instruction_size(item, true);
                    let disp = target_offset as i64 - (offset + short_size) as i64;
                    if i8::try_from(disp).is_ok() {
                        short[index] = true;
                        changed = true;
                    }
                }
            }
            offset += size;
        }

        if !changed {
            break;
        }
        labels = layout(asm, &short)?;
    }

    let text_size: u64 = asm
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| instruction_size(item, short[i]))
        .sum();
    let data_vaddr = (text_vaddr + text_size + 7) & !7;

    // Final emission with resolved addresses.
    let mut text = Vec::with_capacity(text_size as usize);
    for (index, item) in asm.items.iter().enumerate() {
        let pc = text.len() as u64;
        encode_item(asm, item, short[index], pc, &labels, data_vaddr, &mut text)?;
    }

    Ok(Program { text, data: asm.strings.bytes().to_vec(), data_vaddr })
}

/// Offsets of all label definitions under the given jump widths.
fn layout(asm: &Assembler, short: &[bool]) -> Result<HashMap<String, u64>, String> {
    let mut labels = HashMap::new();
    let mut offset = 0u64;

    for (index, item) in asm.items.iter().enumerate() {
        if let Item::Label(name) = item {
            if labels.insert(name.clone(), offset).is_some() {
                return Err(format!("Duplicate label '{}'", name));
            }
        }
        offset += instruction_size(item, short[index]);
    }

    Ok(labels)
}

/// Size in bytes of one item under the given jump width.
fn instruction_size(item: &Item, short: bool) -> u64 {
    let Item::Instruction { mnemonic, operands } = item else {
        return 0;
    };

    match (mnemonic, operands) {
        (Mnemonic::Jmp, _) if short => 2,
        (Mnemonic::Jmp, _) => 5,
        (m, _) if m.is_jump() && short => 2,
        (m, _) if m.is_jump() => 6,
        (Mnemonic::Call, _) => 5,
        (_, Operands::RegAddr(reg, _)) => {
            if reg.needs_ext() {
                6
            } else {
                5
            }
        }
        _ => {
            // Non-branch sizes don't depend on layout; encode to measure.
            let mut buf = Vec::new();
            encode_fixed(item, &mut buf).unwrap_or_default();
            buf.len() as u64
        }
    }
}

/// Emit one item. Branches resolve their target through `labels`; string
/// addresses resolve against `data_vaddr`.
fn encode_item(
    asm: &Assembler,
    item: &Item,
    short: bool,
    pc: u64,
    labels: &HashMap<String, u64>,
    data_vaddr: u64,
    out: &mut Vec<u8>,
) -> Result<(), String> {
    let Item::Instruction { mnemonic, operands } = item else {
        return Ok(());
    };

    if let Operands::Label(target) = operands {
        let target_offset = *labels
            .get(target.as_str())
            .ok_or_else(|| format!("Undefined label '{}'", target))?;
        return encode_branch(*mnemonic, short, pc, target_offset, out);
    }

    if let Operands::RegAddr(reg, id) = operands {
        let address = data_vaddr + asm.strings.offset(*id) as u64;
        let address = u32::try_from(address)
            .map_err(|_| format!("String address {:#x} exceeds 32 bits", address))?;
        emit_mov_imm32(*reg, address, out);
        return Ok(());
    }

    encode_fixed(item, out)
}

fn encode_branch(
    mnemonic: Mnemonic,
    short: bool,
    pc: u64,
    target: u64,
    out: &mut Vec<u8>,
) -> Result<(), String> {
    let size: u64 = match (mnemonic, short) {
        (Mnemonic::Call, _) => 5,
        (Mnemonic::Jmp, true) => 2,
        (Mnemonic::Jmp, false) => 5,
        (_, true) => 2,
        (_, false) => 6,
    };
    let disp = target as i64 - (pc + size) as i64;

    match (mnemonic, short) {
        (Mnemonic::Call, _) => {
            out.push(0xE8);
            out.extend_from_slice(&i32::try_from(disp).map_err(|_| "call out of range")?.to_le_bytes());
        }
        (Mnemonic::Jmp, true) => {
            out.push(0xEB);
            out.push(i8::try_from(disp).map_err(|_| "short jump out of range")? as u8);
        }
        (Mnemonic::Jmp, false) => {
            out.push(0xE9);
            out.extend_from_slice(&i32::try_from(disp).map_err(|_| "jump out of range")?.to_le_bytes());
        }
        (jcc, true) => {
            out.push(0x70 | condition_code(jcc));
            out.push(i8::try_from(disp).map_err(|_| "short jump out of range")? as u8);
        }
        (jcc, false) => {
            out.push(0x0F);
            out.push(0x80 | condition_code(jcc));
            out.extend_from_slice(&i32::try_from(disp).map_err(|_| "jump out of range")?.to_le_bytes());
        }
    }

    Ok(())
}

/// The 4-bit condition code shared by the 70+cc and 0F 80+cc forms.
fn condition_code(mnemonic: Mnemonic) -> u8 {
    match mnemonic {
        Mnemonic::Je => 0x4,
        Mnemonic::Jne => 0x5,
        Mnemonic::Jl => 0xC,
        Mnemonic::Jge => 0xD,
        Mnemonic::Jle => 0xE,
        Mnemonic::Jg => 0xF,
        _ => unreachable!("not a conditional jump"),
    }
}

/// REX prefix from the W/R/X/B bits; emitted only when needed.
fn emit_rex(w: bool, r: bool, x: bool, b: bool, out: &mut Vec<u8>) {
    if w || r || x || b {
        out.push(0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b));
    }
}

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | (reg << 3) | rm
}

/// `mov r32, imm32` (zero-extends into the full register).
fn emit_mov_imm32(reg: Reg, value: u32, out: &mut Vec<u8>) {
    emit_rex(false, false, false, reg.needs_ext(), out);
    out.push(0xB8 + reg.low3());
    out.extend_from_slice(&value.to_le_bytes());
}

/// `op r/m64, r64` with the given store-form opcode.
fn emit_alu_reg_reg(opcode: u8, rm: Reg, reg: Reg, out: &mut Vec<u8>) {
    emit_rex(true, reg.needs_ext(), false, rm.needs_ext(), out);
    out.push(opcode);
    out.push(modrm(0b11, reg.low3(), rm.low3()));
}

/// Group-1 ALU `op r/m64, imm` using the sign-extended imm8 form when the
/// value fits.
fn emit_alu_imm(ext: u8, rm: Reg, value: i64, out: &mut Vec<u8>) -> Result<(), String> {
    emit_rex(true, false, false, rm.needs_ext(), out);
    if let Ok(imm8) = i8::try_from(value) {
        out.push(0x83);
        out.push(modrm(0b11, ext, rm.low3()));
        out.push(imm8 as u8);
    } else if let Ok(imm32) = i32::try_from(value) {
        out.push(0x81);
        out.push(modrm(0b11, ext, rm.low3()));
        out.extend_from_slice(&imm32.to_le_bytes());
    } else {
        return Err(format!("Immediate {} exceeds 32 bits", value));
    }
    Ok(())
}

/// `F7 /ext` and `FF /ext` unary forms.
fn emit_unary(opcode: u8, ext: u8, rm: Reg, out: &mut Vec<u8>) {
    emit_rex(true, false, false, rm.needs_ext(), out);
    out.push(opcode);
    out.push(modrm(0b11, ext, rm.low3()));
}

/// Everything whose size does not depend on layout.
fn encode_fixed(item: &Item, out: &mut Vec<u8>) -> Result<(), String> {
    let Item::Instruction { mnemonic, operands } = item else {
        return Ok(());
    };

    match (mnemonic, operands) {
        (Mnemonic::Ret, Operands::None) => out.push(0xC3),
        (Mnemonic::Syscall, Operands::None) => out.extend_from_slice(&[0x0F, 0x05]),
        (Mnemonic::SignExtend, Operands::None) => out.extend_from_slice(&[0x48, 0x99]),

        (Mnemonic::Mov, Operands::RegReg(dst, src)) => emit_alu_reg_reg(0x89, *dst, *src, out),
        (Mnemonic::Add, Operands::RegReg(dst, src)) => emit_alu_reg_reg(0x01, *dst, *src, out),
        (Mnemonic::Sub, Operands::RegReg(dst, src)) => emit_alu_reg_reg(0x29, *dst, *src, out),
        (Mnemonic::Cmp, Operands::RegReg(dst, src)) => emit_alu_reg_reg(0x39, *dst, *src, out),
        (Mnemonic::Xor, Operands::RegReg(dst, src)) => emit_alu_reg_reg(0x31, *dst, *src, out),

        (Mnemonic::Mul, Operands::RegReg(dst, src)) => {
            // imul r64, r/m64
            emit_rex(true, dst.needs_ext(), false, src.needs_ext(), out);
            out.extend_from_slice(&[0x0F, 0xAF]);
            out.push(modrm(0b11, dst.low3(), src.low3()));
        }

        (Mnemonic::Mov, Operands::RegImm(dst, value)) => {
            if let Ok(imm32) = u32::try_from(*value) {
                emit_mov_imm32(*dst, imm32, out);
            } else if let Ok(imm32) = i32::try_from(*value) {
                // Negative: sign-extended C7 form
                emit_rex(true, false, false, dst.needs_ext(), out);
                out.push(0xC7);
                out.push(modrm(0b11, 0, dst.low3()));
                out.extend_from_slice(&imm32.to_le_bytes());
            } else {
                emit_rex(true, false, false, dst.needs_ext(), out);
                out.push(0xB8 + dst.low3());
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        (Mnemonic::Add, Operands::RegImm(dst, value)) => emit_alu_imm(0, *dst, *value, out)?,
        (Mnemonic::Sub, Operands::RegImm(dst, value)) => emit_alu_imm(5, *dst, *value, out)?,
        (Mnemonic::Cmp, Operands::RegImm(dst, value)) => emit_alu_imm(7, *dst, *value, out)?,

        (Mnemonic::Mul, Operands::RegImm(dst, value)) => {
            // imul r64, r/m64, imm
            emit_rex(true, dst.needs_ext(), false, dst.needs_ext(), out);
            if let Ok(imm8) = i8::try_from(*value) {
                out.push(0x6B);
                out.push(modrm(0b11, dst.low3(), dst.low3()));
                out.push(imm8 as u8);
            } else if let Ok(imm32) = i32::try_from(*value) {
                out.push(0x69);
                out.push(modrm(0b11, dst.low3(), dst.low3()));
                out.extend_from_slice(&imm32.to_le_bytes());
            } else {
                return Err(format!("Immediate {} exceeds 32 bits", value));
            }
        }

        (Mnemonic::Shl, Operands::RegImm(dst, value)) => {
            emit_rex(true, false, false, dst.needs_ext(), out);
            out.push(0xC1);
            out.push(modrm(0b11, 4, dst.low3()));
            out.push(*value as u8);
        }
        (Mnemonic::Shr, Operands::RegImm(dst, value)) => {
            emit_rex(true, false, false, dst.needs_ext(), out);
            out.push(0xC1);
            out.push(modrm(0b11, 5, dst.low3()));
            out.push(*value as u8);
        }

        (Mnemonic::Div, Operands::Reg(rm)) => emit_unary(0xF7, 7, *rm, out),
        (Mnemonic::Neg, Operands::Reg(rm)) => emit_unary(0xF7, 3, *rm, out),
        (Mnemonic::Inc, Operands::Reg(rm)) => emit_unary(0xFF, 0, *rm, out),
        (Mnemonic::Dec, Operands::Reg(rm)) => emit_unary(0xFF, 1, *rm, out),

        (Mnemonic::Push, Operands::Reg(reg)) => {
            emit_rex(false, false, false, reg.needs_ext(), out);
            out.push(0x50 + reg.low3());
        }
        (Mnemonic::Pop, Operands::Reg(reg)) => {
            emit_rex(false, false, false, reg.needs_ext(), out);
            out.push(0x58 + reg.low3());
        }

        (Mnemonic::Store, Operands::MemImm { base, offset, size, value }) => {
            emit_store(*base, *offset, *size, *value, out)?;
        }

        (mnemonic, operands) => {
            return Err(format!(
                "Cannot encode '{}' with operands {:?}",
                mnemonic.name(),
                operands
            ))
        }
    }

    Ok(())
}

/// `mov [base+offset], imm` truncated to `size` bytes, always using the
/// disp8 addressing mode. rsp/r12 bases need a SIB byte.
fn emit_store(base: Reg, offset: i8, size: u8, value: u64, out: &mut Vec<u8>) -> Result<(), String> {
    if size == 2 {
        out.push(0x66);
    }
    emit_rex(size == 8, false, false, base.needs_ext(), out);
    out.push(if size == 1 { 0xC6 } else { 0xC7 });
    out.push(modrm(0b01, 0, base.low3()));
    if base.low3() == 4 {
        out.push(0x24); // SIB: no index, base as given
    }
    out.push(offset as u8);

    match size {
        1 => out.push(value as u8),
        2 => out.extend_from_slice(&(value as u16).to_le_bytes()),
        4 | 8 => out.extend_from_slice(&(value as u32).to_le_bytes()),
        _ => return Err(format!("Unsupported store size {}", size)),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Assembler;

    fn text_of(asm: &Assembler) -> Vec<u8> {
        encode(asm, 0x400078).unwrap().text
    }

    #[test]
    fn exit_sequence() {
        let mut asm = Assembler::new();
        asm.move_register_number(Reg::Rax, 60);
        asm.move_register_number(Reg::Rdi, 0);
        asm.syscall();
        assert_eq!(
            text_of(&asm),
            vec![
                0xB8, 0x3C, 0x00, 0x00, 0x00, // mov eax, 60
                0x48, 0x31, 0xFF, // xor rdi, rdi
                0x0F, 0x05, // syscall
            ]
        );
    }

    #[test]
    fn register_register_forms() {
        let mut asm = Assembler::new();
        asm.move_register_register(Reg::Rbx, Reg::Rax);
        asm.compare_register_register(Reg::Rbx, Reg::R12);
        asm.add_register_register(Reg::R8, Reg::R9);
        assert_eq!(
            text_of(&asm),
            vec![
                0x48, 0x89, 0xC3, // mov rbx, rax
                0x4C, 0x39, 0xE3, // cmp rbx, r12
                0x4D, 0x01, 0xC8, // add r8, r9
            ]
        );
    }

    #[test]
    fn immediate_forms() {
        let mut asm = Assembler::new();
        asm.add_register_number(Reg::Rbx, 1);
        asm.sub_register_number(Reg::Rsp, 8);
        asm.compare_register_number(Reg::Rbx, 1000);
        asm.move_register_number(Reg::Rbx, -5);
        asm.move_register_number(Reg::Rbx, 0x1_0000_0000);
        assert_eq!(
            text_of(&asm),
            vec![
                0x48, 0x83, 0xC3, 0x01, // add rbx, 1
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
                0x48, 0x81, 0xFB, 0xE8, 0x03, 0x00, 0x00, // cmp rbx, 1000
                0x48, 0xC7, 0xC3, 0xFB, 0xFF, 0xFF, 0xFF, // mov rbx, -5
                0x48, 0xBB, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, // movabs
            ]
        );
    }

    #[test]
    fn division_sequence() {
        let mut asm = Assembler::new();
        asm.sign_extend_rax();
        asm.divide_register(Reg::Rbx);
        assert_eq!(text_of(&asm), vec![0x48, 0x99, 0x48, 0xF7, 0xFB]);
    }

    #[test]
    fn multiply_forms() {
        let mut asm = Assembler::new();
        asm.mul_register_register(Reg::Rbx, Reg::Rcx);
        asm.mul_register_number(Reg::Rbx, 3);
        assert_eq!(
            text_of(&asm),
            vec![
                0x48, 0x0F, 0xAF, 0xD9, // imul rbx, rcx
                0x48, 0x6B, 0xDB, 0x03, // imul rbx, rbx, 3
            ]
        );
    }

    #[test]
    fn stack_and_unary() {
        let mut asm = Assembler::new();
        asm.push_register(Reg::Rbx);
        asm.push_register(Reg::R12);
        asm.pop_register(Reg::R12);
        asm.pop_register(Reg::Rbx);
        asm.increase_register(Reg::Rbx);
        asm.decrease_register(Reg::Rbx);
        asm.negate_register(Reg::Rbx);
        assert_eq!(
            text_of(&asm),
            vec![
                0x53, // push rbx
                0x41, 0x54, // push r12
                0x41, 0x5C, // pop r12
                0x5B, // pop rbx
                0x48, 0xFF, 0xC3, // inc rbx
                0x48, 0xFF, 0xCB, // dec rbx
                0x48, 0xF7, 0xDB, // neg rbx
            ]
        );
    }

    #[test]
    fn shifts() {
        let mut asm = Assembler::new();
        asm.shift_left_number(Reg::Rbx, 3);
        asm.shift_right_number(Reg::Rbx, 2);
        assert_eq!(
            text_of(&asm),
            vec![0x48, 0xC1, 0xE3, 0x03, 0x48, 0xC1, 0xEB, 0x02]
        );
    }

    #[test]
    fn store_sizes() {
        let mut asm = Assembler::new();
        asm.store_number(Reg::Rbx, 4, 1, 7);
        asm.store_number(Reg::R12, 2, 2, 0x1234);
        asm.store_number(Reg::Rbx, 0, 8, 1);
        assert_eq!(
            text_of(&asm),
            vec![
                0xC6, 0x43, 0x04, 0x07, // mov byte [rbx+4], 7
                0x66, 0x41, 0xC7, 0x44, 0x24, 0x02, 0x34, 0x12, // mov word [r12+2], 0x1234
                0x48, 0xC7, 0x43, 0x00, 0x01, 0x00, 0x00, 0x00, // mov qword [rbx], 1
            ]
        );
    }

    #[test]
    fn short_backward_jump() {
        let mut asm = Assembler::new();
        asm.add_label("loop");
        asm.increase_register(Reg::Rbx);
        asm.jump("loop");
        // inc is 3 bytes; jmp compacts to EB FB (-5 from the end of jmp).
        assert_eq!(text_of(&asm), vec![0x48, 0xFF, 0xC3, 0xEB, 0xFB]);
    }

    #[test]
    fn short_forward_conditional_jump() {
        let mut asm = Assembler::new();
        asm.jump_if_equal("end");
        asm.increase_register(Reg::Rbx);
        asm.add_label("end");
        asm.ret();
        // je compacts to 74 03 over the 3-byte inc.
        assert_eq!(text_of(&asm), vec![0x74, 0x03, 0x48, 0xFF, 0xC3, 0xC3]);
    }

    #[test]
    fn long_jump_stays_wide() {
        let mut asm = Assembler::new();
        asm.jump_if_not_equal("far");
        for _ in 0..64 {
            asm.increase_register(Reg::Rbx); // 3 bytes each: 192 > 127
        }
        asm.add_label("far");
        let text = text_of(&asm);
        assert_eq!(&text[..6], &[0x0F, 0x85, 0xC0, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn call_is_relative() {
        let mut asm = Assembler::new();
        asm.call("f");
        asm.ret();
        asm.add_label("f");
        asm.ret();
        assert_eq!(text_of(&asm), vec![0xE8, 0x01, 0x00, 0x00, 0x00, 0xC3, 0xC3]);
    }

    #[test]
    fn string_addresses_follow_text() {
        let mut asm = Assembler::new();
        let hello = asm.add_string("Hi\n");
        let world = asm.add_string("Yo\n");
        asm.move_register_address(Reg::Rsi, hello);
        asm.move_register_address(Reg::Rsi, world);
        asm.ret();

        let program = encode(&asm, 0x400078).unwrap();
        // Two 5-byte loads plus ret = 11 bytes of text, data aligned up to 0x400088.
        assert_eq!(program.data_vaddr, 0x400088);
        let first = u32::from_le_bytes(program.text[1..5].try_into().unwrap());
        let second = u32::from_le_bytes(program.text[6..10].try_into().unwrap());
        assert_eq!(first, 0x400088);
        assert_eq!(second, 0x400088 + 3);
        assert_eq!(program.data, b"Hi\nYo\n");
    }

    #[test]
    fn deterministic_encoding() {
        let mut asm = Assembler::new();
        asm.add_label("f");
        asm.move_register_number(Reg::Rax, 1);
        asm.jump("f");
        asm.ret();
        assert_eq!(text_of(&asm), text_of(&asm.clone()));
    }
}
