//! Minimal ELF64 executable writer.
//!
//! The image is one `PT_LOAD` segment mapping the whole file: ELF header,
//! one program header, the machine code, then the string pool. The virtual
//! base is fixed so the encoder can resolve string addresses before the
//! file exists. No section headers, no dynamic interpreter.

use std::fs;
use std::path::Path;

use super::encoder::Program;

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;
pub const PT_LOAD: u32 = 1;
pub const PF_X: u32 = 1;
pub const PF_R: u32 = 4;

/// Virtual address the segment is mapped at.
pub const BASE_ADDR: u64 = 0x400000;
const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const PAGE_SIZE: u64 = 0x1000;

/// Virtual address of the first instruction: code starts right after the
/// headers. The encoder must be driven with this base so branch and string
/// operands line up with the final file layout.
pub const TEXT_VADDR: u64 = BASE_ADDR + EHDR_SIZE + PHDR_SIZE;

fn w16(out: &mut [u8], offset: usize, value: u16) {
    out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn w32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn w64(out: &mut [u8], offset: usize, value: u64) {
    out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Build the executable image for an encoded program.
pub fn build_image(program: &Program) -> Vec<u8> {
    let text_offset = (EHDR_SIZE + PHDR_SIZE) as usize;
    let data_offset = (program.data_vaddr - BASE_ADDR) as usize;
    let file_size = data_offset + program.data.len();

    let mut out = vec![0u8; file_size];

    // ELF header
    out[0..4].copy_from_slice(&ELF_MAGIC);
    out[4] = ELFCLASS64;
    out[5] = ELFDATA2LSB;
    out[6] = 1; // EV_CURRENT
    w16(&mut out, 16, ET_EXEC);
    w16(&mut out, 18, EM_X86_64);
    w32(&mut out, 20, 1); // e_version
    w64(&mut out, 24, TEXT_VADDR); // e_entry
    w64(&mut out, 32, EHDR_SIZE); // e_phoff
    w64(&mut out, 40, 0); // e_shoff
    w32(&mut out, 48, 0); // e_flags
    w16(&mut out, 52, EHDR_SIZE as u16);
    w16(&mut out, 54, PHDR_SIZE as u16);
    w16(&mut out, 56, 1); // e_phnum
    w16(&mut out, 58, 64); // e_shentsize
    w16(&mut out, 60, 0); // e_shnum
    w16(&mut out, 62, 0); // e_shstrndx

    // Program header: one read-execute load of the whole file
    let ph = EHDR_SIZE as usize;
    w32(&mut out, ph, PT_LOAD);
    w32(&mut out, ph + 4, PF_R | PF_X);
    w64(&mut out, ph + 8, 0); // p_offset
    w64(&mut out, ph + 16, BASE_ADDR); // p_vaddr
    w64(&mut out, ph + 24, BASE_ADDR); // p_paddr
    w64(&mut out, ph + 32, file_size as u64); // p_filesz
    w64(&mut out, ph + 40, file_size as u64); // p_memsz
    w64(&mut out, ph + 48, PAGE_SIZE); // p_align

    out[text_offset..text_offset + program.text.len()].copy_from_slice(&program.text);
    out[data_offset..data_offset + program.data.len()].copy_from_slice(&program.data);

    out
}

/// Write the executable and mark it runnable.
pub fn write_file(program: &Program, path: &Path) -> Result<(), String> {
    let image = build_image(program);
    fs::write(path, &image).map_err(|e| format!("Failed to write '{}': {}", path.display(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| format!("Failed to set permissions on '{}': {}", path.display(), e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::encoder::encode;
    use crate::asm::{Assembler, Reg};

    fn sample_program() -> Program {
        let mut asm = Assembler::new();
        let text = asm.add_string("Hi\n");
        asm.move_register_address(Reg::Rsi, text);
        asm.move_register_number(Reg::Rax, 60);
        asm.move_register_number(Reg::Rdi, 0);
        asm.syscall();
        encode(&asm, TEXT_VADDR).unwrap()
    }

    #[test]
    fn header_fields() {
        let image = build_image(&sample_program());
        assert_eq!(&image[0..4], &ELF_MAGIC);
        assert_eq!(image[4], ELFCLASS64);
        assert_eq!(image[5], ELFDATA2LSB);
        assert_eq!(u16::from_le_bytes([image[16], image[17]]), ET_EXEC);
        assert_eq!(u16::from_le_bytes([image[18], image[19]]), EM_X86_64);
        let entry = u64::from_le_bytes(image[24..32].try_into().unwrap());
        assert_eq!(entry, TEXT_VADDR);
    }

    #[test]
    fn load_segment_covers_file() {
        let image = build_image(&sample_program());
        let ph = 64;
        let p_type = u32::from_le_bytes(image[ph..ph + 4].try_into().unwrap());
        let p_flags = u32::from_le_bytes(image[ph + 4..ph + 8].try_into().unwrap());
        let p_vaddr = u64::from_le_bytes(image[ph + 16..ph + 24].try_into().unwrap());
        let p_filesz = u64::from_le_bytes(image[ph + 32..ph + 40].try_into().unwrap());
        assert_eq!(p_type, PT_LOAD);
        assert_eq!(p_flags, PF_R | PF_X);
        assert_eq!(p_vaddr, BASE_ADDR);
        assert_eq!(p_filesz, image.len() as u64);
    }

    #[test]
    fn data_lands_at_its_virtual_address() {
        let program = sample_program();
        let image = build_image(&program);
        let data_offset = (program.data_vaddr - BASE_ADDR) as usize;
        assert_eq!(&image[data_offset..data_offset + 3], b"Hi\n");
    }

    #[test]
    fn code_starts_after_headers() {
        let program = sample_program();
        let image = build_image(&program);
        assert_eq!(&image[120..120 + program.text.len()], &program.text[..]);
    }
}
