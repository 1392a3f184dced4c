use crate::arch::x86::writer::{Reg, X86Writer};
use crate::types::{HookError, Mode};

// ── Instruction classification ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsnKind {
    Plain,      // Copy verbatim
    PcRelative, // ModRM mod=0 rm=5 in 64-bit mode (RIP+disp32)
    JmpRel8,    // EB rel8
    JmpRel32,   // E9 rel32
    JccRel8,    // 70-7F rel8
    JccRel32,   // 0F 80-8F rel32
    CallRel32,  // E8 rel32
    LoopRel8,   // E0-E3: LOOPcc / JCXZ, no rel32 form exists
    Ret,        // C3 / C2
    Trap,       // INT3 (CC), UD2 (0F 0B), HLT (F4)
}

#[derive(Debug, Clone)]
struct Insn {
    len: usize,
    kind: InsnKind,
    /// For PcRelative: offset of the disp32 within the instruction.
    disp_offset: Option<usize>,
    /// For branches: displacement relative to the end of the instruction.
    branch: i64,
    /// Condition code for Jcc.
    cc: u8,
    /// Unconditional transfer: bytes after it are not part of this function's flow.
    jumps: bool,
}

impl Insn {
    fn new(len: usize, kind: InsnKind) -> Self {
        Self { len, kind, disp_offset: None, branch: 0, cc: 0, jumps: false }
    }

    fn branch(len: usize, kind: InsnKind, branch: i64, cc: u8) -> Self {
        let jumps = matches!(kind, InsnKind::JmpRel8 | InsnKind::JmpRel32);
        Self { len, kind, disp_offset: None, branch, cc, jumps }
    }

    fn ends_flow(&self) -> bool {
        matches!(self.kind, InsnKind::Ret | InsnKind::Trap)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Prefixes {
    opsize: bool, // 66
    addrsize: bool, // 67
    rex_w: bool,
}

impl Prefixes {
    /// Size of an imm16/imm32 operand.
    fn imm_z(&self) -> usize {
        if self.opsize {
            2
        } else {
            4
        }
    }
}

// ── Opcode tables ────────────────────────────────────────────────────

fn one_byte_has_modrm(opcode: u8) -> bool {
    matches!(
        opcode,
        0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x62..=0x63
            | 0x69
            | 0x6B
            | 0x80..=0x8F
            | 0xC0..=0xC1
            | 0xC4..=0xC7
            | 0xD0..=0xD3
            | 0xD8..=0xDF
            | 0xF6..=0xF7
            | 0xFE..=0xFF
    )
}

fn one_byte_imm_size(opcode: u8, p: Prefixes, mode: Mode) -> usize {
    match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => p.imm_z(),
        0x68 | 0x69 | 0x81 | 0xA9 | 0xC7 => p.imm_z(),
        0x6A | 0x6B | 0x80 | 0x82 | 0x83 | 0xA8 | 0xC0 | 0xC1 | 0xC6 => 1,
        // moffs follows the address size, not the operand size.
        0xA0..=0xA3 => match (mode, p.addrsize) {
            (Mode::Bits64, false) => 8,
            (Mode::Bits64, true) | (Mode::Bits32, false) => 4,
            (Mode::Bits32, true) => 2,
        },
        0xB0..=0xB7 => 1,
        0xB8..=0xBF => {
            if p.rex_w {
                8
            } else {
                p.imm_z()
            }
        }
        0xC2 => 2,
        0xC8 => 3,
        0xCD | 0xD4 | 0xD5 | 0xE4..=0xE7 => 1,
        0x9A | 0xEA => 4 + 2, // far call/jmp ptr16:32 (32-bit only)
        _ => 0,
    }
}

fn two_byte_has_modrm(opcode2: u8) -> bool {
    !matches!(
        opcode2,
        0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77 | 0x80..=0x8F | 0xA0..=0xA2 | 0xA8..=0xAA | 0xC8..=0xCF
    )
}

fn two_byte_imm_size(opcode2: u8) -> usize {
    match opcode2 {
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => 1,
        _ => 0,
    }
}

/// F6 /0 and F7 /0 (TEST) carry an immediate, the rest of the group does not.
fn group3_imm_size(opcode: u8, modrm: u8, p: Prefixes) -> usize {
    if (modrm >> 3) & 7 > 1 {
        0
    } else if opcode == 0xF6 {
        1
    } else {
        p.imm_z()
    }
}

// ── Decoder ──────────────────────────────────────────────────────────

struct Cursor {
    input: *const u8,
    pos: usize,
}

impl Cursor {
    unsafe fn peek(&self) -> u8 {
        self.input.add(self.pos).read()
    }

    unsafe fn byte(&mut self) -> u8 {
        let b = self.peek();
        self.pos += 1;
        b
    }

    unsafe fn i8(&mut self) -> i64 {
        self.byte() as i8 as i64
    }

    unsafe fn i32(&mut self) -> i64 {
        let v = (self.input.add(self.pos) as *const i32).read_unaligned();
        self.pos += 4;
        v as i64
    }

    /// Skip a ModRM operand with its SIB and displacement. Returns the ModRM
    /// byte and, for a RIP-relative operand, the offset of its disp32.
    unsafe fn modrm(&mut self, mode: Mode, addrsize: bool) -> (u8, Option<usize>) {
        let modrm = self.byte();
        let md = modrm >> 6;
        let rm = modrm & 7;
        if md == 3 {
            return (modrm, None);
        }
        // 16-bit addressing only arises from a 67 prefix in 32-bit code.
        if mode == Mode::Bits32 && addrsize {
            self.pos += match (md, rm) {
                (0, 6) => 2,
                (1, _) => 1,
                (2, _) => 2,
                _ => 0,
            };
            return (modrm, None);
        }
        if md == 0 && rm == 5 {
            let at = self.pos;
            self.pos += 4;
            // In 32-bit mode this is an absolute disp32 and needs no fixup.
            return (modrm, (mode == Mode::Bits64).then_some(at));
        }
        if rm == 4 {
            let sib = self.byte();
            if md == 0 && sib & 7 == 5 {
                self.pos += 4;
            }
        }
        self.pos += match md {
            1 => 1,
            2 => 4,
            _ => 0,
        };
        (modrm, None)
    }
}

/// Decode one instruction at `input`.
///
/// This is a length decoder tuned for function prologues: it understands
/// legacy prefixes, REX, VEX, the one/two/three byte opcode maps,
/// ModRM/SIB/displacement and immediates, and classifies the control-flow
/// and PC-relative forms that need rewriting when moved.
unsafe fn decode_insn(input: *const u8, mode: Mode) -> Insn {
    let mut c = Cursor { input, pos: 0 };
    let mut p = Prefixes::default();

    loop {
        match c.peek() {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => {}
            0x66 => p.opsize = true,
            0x67 => p.addrsize = true,
            _ => break,
        }
        c.pos += 1;
    }

    // 40-4F are REX only in 64-bit mode; in 32-bit mode they are INC/DEC.
    if mode == Mode::Bits64 && c.peek() & 0xF0 == 0x40 {
        p.rex_w = c.byte() & 0x08 != 0;
    }

    let opcode = c.byte();
    match opcode {
        0xC3 => return Insn::new(c.pos, InsnKind::Ret),
        0xC2 => return Insn::new(c.pos + 2, InsnKind::Ret),
        0xCC | 0xF4 => return Insn::new(c.pos, InsnKind::Trap),
        0xEB => {
            let rel = c.i8();
            return Insn::branch(c.pos, InsnKind::JmpRel8, rel, 0);
        }
        0xE9 => {
            let rel = c.i32();
            return Insn::branch(c.pos, InsnKind::JmpRel32, rel, 0);
        }
        0xE8 => {
            let rel = c.i32();
            return Insn::branch(c.pos, InsnKind::CallRel32, rel, 0);
        }
        0x70..=0x7F => {
            let rel = c.i8();
            return Insn::branch(c.pos, InsnKind::JccRel8, rel, opcode & 0x0F);
        }
        0xE0..=0xE3 => {
            let rel = c.i8();
            return Insn::branch(c.pos, InsnKind::LoopRel8, rel, 0);
        }
        0x0F => return decode_two_byte(c, p, mode),
        // VEX. In 32-bit mode C4/C5 are LES/LDS unless the next byte has mod=11.
        0xC4 | 0xC5 if mode == Mode::Bits64 || c.peek() >= 0xC0 => return decode_vex(c, opcode, mode),
        _ => {}
    }

    let mut disp_offset = None;
    // FF /4 and FF /5 are indirect jumps; EA is the 32-bit far jump.
    let mut jumps = opcode == 0xEA;
    if one_byte_has_modrm(opcode) {
        let (modrm, disp) = c.modrm(mode, p.addrsize);
        disp_offset = disp;
        jumps |= opcode == 0xFF && matches!((modrm >> 3) & 7, 4 | 5);
        c.pos += if opcode == 0xF6 || opcode == 0xF7 {
            group3_imm_size(opcode, modrm, p)
        } else {
            one_byte_imm_size(opcode, p, mode)
        };
    } else {
        c.pos += one_byte_imm_size(opcode, p, mode);
    }

    Insn {
        jumps,
        ..finish(c.pos, disp_offset)
    }
}

unsafe fn decode_two_byte(mut c: Cursor, p: Prefixes, mode: Mode) -> Insn {
    let opcode2 = c.byte();
    match opcode2 {
        0x0B => return Insn::new(c.pos, InsnKind::Trap),
        0x80..=0x8F => {
            let rel = c.i32();
            return Insn::branch(c.pos, InsnKind::JccRel32, rel, opcode2 & 0x0F);
        }
        // Three-byte maps: 0F 38 xx /r and 0F 3A xx /r ib.
        0x38 | 0x3A => {
            c.pos += 1;
            let (_, disp) = c.modrm(mode, p.addrsize);
            if opcode2 == 0x3A {
                c.pos += 1;
            }
            return finish(c.pos, disp);
        }
        _ => {}
    }

    let mut disp_offset = None;
    if two_byte_has_modrm(opcode2) {
        disp_offset = c.modrm(mode, p.addrsize).1;
    }
    c.pos += two_byte_imm_size(opcode2);
    finish(c.pos, disp_offset)
}

unsafe fn decode_vex(mut c: Cursor, lead: u8, mode: Mode) -> Insn {
    let map = if lead == 0xC5 {
        c.pos += 1;
        1
    } else {
        let b1 = c.byte();
        c.pos += 1;
        b1 & 0x1F
    };
    let opcode = c.byte();
    // vzeroupper / vzeroall take no operands.
    if map == 1 && opcode == 0x77 {
        return Insn::new(c.pos, InsnKind::Plain);
    }
    let disp = c.modrm(mode, false).1;
    c.pos += match map {
        3 => 1,
        1 => two_byte_imm_size(opcode),
        _ => 0,
    };
    finish(c.pos, disp)
}

fn finish(len: usize, disp_offset: Option<usize>) -> Insn {
    match disp_offset {
        Some(_) => Insn {
            len,
            kind: InsnKind::PcRelative,
            disp_offset,
            branch: 0,
            cc: 0,
            jumps: false,
        },
        None => Insn::new(len, InsnKind::Plain),
    }
}

// ── CET landing pads ─────────────────────────────────────────────────

/// Returns true if the bytes at `p` are ENDBR64 (F3 0F 1E FA).
///
/// # Safety
/// `p` must point to at least 4 readable bytes.
pub unsafe fn is_endbr64(p: *const u8) -> bool {
    core::slice::from_raw_parts(p, 4) == [0xF3, 0x0F, 0x1E, 0xFA]
}

// ── Public API ───────────────────────────────────────────────────────

/// Number of whole instructions at `input` that cover at least `min_bytes`,
/// stopping early at a return or trap, or right after an unconditional jump.
/// A result below `min_bytes` means the function is too short to patch.
///
/// # Safety
/// `input` must point to readable code.
pub unsafe fn can_relocate(input: *const u8, min_bytes: usize, mode: Mode) -> usize {
    let mut offset = 0usize;
    while offset < min_bytes {
        let insn = decode_insn(input.add(offset), mode);
        if insn.len == 0 || insn.ends_flow() {
            break;
        }
        offset += insn.len;
        if insn.jumps {
            break;
        }
    }
    offset
}

/// Copies whole instructions from one address to another, rewriting the
/// PC-relative ones so they keep their original meaning.
pub struct Relocator {
    input: *const u8,
    input_pc: u64,
    mode: Mode,
}

impl Relocator {
    pub fn new(input: *const u8, input_pc: u64, mode: Mode) -> Self {
        Self { input, input_pc, mode }
    }

    fn target(&self, src_pc: u64, insn: &Insn) -> u64 {
        let t = (src_pc as i64 + insn.len as i64 + insn.branch) as u64;
        match self.mode {
            Mode::Bits32 => t & 0xFFFF_FFFF,
            Mode::Bits64 => t,
        }
    }

    /// Relocate at least `min_bytes` of instructions into `writer` and return
    /// the number of source bytes consumed.
    ///
    /// # Safety
    /// `input` must point to readable code; `writer` must have room for the
    /// rewritten sequence.
    pub unsafe fn relocate_bytes(&mut self, writer: &mut X86Writer, min_bytes: usize) -> Result<usize, HookError> {
        let consumed = can_relocate(self.input, min_bytes, self.mode);
        if consumed < min_bytes {
            return Err(HookError::PatchTooSmall {
                needed: min_bytes,
                available: consumed,
            });
        }
        let start = self.input_pc;
        let end = start + consumed as u64;

        let mut offset = 0usize;
        while offset < consumed {
            let src = self.input.add(offset);
            let src_pc = self.input_pc + offset as u64;
            let insn = decode_insn(src, self.mode);
            let bytes = core::slice::from_raw_parts(src, insn.len);

            match insn.kind {
                InsnKind::Ret | InsnKind::Trap => return Err(HookError::RelocationFailed),
                InsnKind::Plain => writer.put_bytes(bytes),
                InsnKind::PcRelative => {
                    let at = insn.disp_offset.ok_or(HookError::RelocationFailed)?;
                    let old = i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
                    let abs = src_pc as i64 + insn.len as i64 + old as i64;
                    let new = abs - (writer.pc() as i64 + insn.len as i64);
                    let new = i32::try_from(new).map_err(|_| HookError::RelocationFailed)?;
                    let mut patched = bytes.to_vec();
                    patched[at..at + 4].copy_from_slice(&new.to_le_bytes());
                    writer.put_bytes(&patched);
                }
                InsnKind::LoopRel8 => return Err(HookError::RelocationFailed),
                InsnKind::JmpRel8 | InsnKind::JmpRel32 | InsnKind::JccRel8 | InsnKind::JccRel32 => {
                    let target = self.target(src_pc, &insn);
                    // A branch back into the overwritten bytes cannot survive the move.
                    if target >= start && target < end {
                        return Err(HookError::RelocationFailed);
                    }
                    self.emit_branch(writer, &insn, target);
                }
                InsnKind::CallRel32 => {
                    let target = self.target(src_pc, &insn);
                    let return_addr = src_pc + insn.len as u64;
                    self.emit_call(writer, &insn, target, return_addr);
                }
            }
            offset += insn.len;
        }
        Ok(consumed)
    }

    unsafe fn emit_branch(&self, writer: &mut X86Writer, insn: &Insn, target: u64) {
        let conditional = matches!(insn.kind, InsnKind::JccRel8 | InsnKind::JccRel32);
        match (conditional, writer.can_reach_near(target)) {
            (false, _) => writer.put_jmp_address(target),
            (true, true) => writer.put_jcc_near(insn.cc, target),
            (true, false) => {
                // Inverted condition hops over an absolute jump.
                writer.put_jcc_short(insn.cc ^ 1, 16);
                writer.put_jmp_far(target);
            }
        }
    }

    unsafe fn emit_call(&self, writer: &mut X86Writer, insn: &Insn, target: u64, return_addr: u64) {
        if insn.branch == 0 {
            // `call $+0` only materializes its own return address.
            match self.mode {
                Mode::Bits32 => writer.put_push_imm32(return_addr as u32),
                Mode::Bits64 => {
                    writer.put_mov_reg_imm64(Reg::R11, return_addr);
                    writer.put_push_reg(Reg::R11);
                }
            }
        } else if writer.can_reach_near(target) {
            writer.put_call_near(target);
        } else {
            writer.put_mov_reg_imm64(Reg::R11, target);
            writer.put_call_reg(Reg::R11);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(code: &[u8]) -> Insn {
        let mut padded = code.to_vec();
        padded.resize(code.len() + 16, 0x90);
        unsafe { decode_insn(padded.as_ptr(), Mode::Bits64) }
    }

    fn decode32(code: &[u8]) -> Insn {
        let mut padded = code.to_vec();
        padded.resize(code.len() + 16, 0x90);
        unsafe { decode_insn(padded.as_ptr(), Mode::Bits32) }
    }

    fn relocate(mode: Mode, code: &[u8], from: u64, to: u64, min: usize) -> Result<(usize, Vec<u8>), HookError> {
        let mut buf = [0u8; 128];
        unsafe {
            let mut w = X86Writer::with_mode(buf.as_mut_ptr(), buf.len(), to, mode);
            let mut r = Relocator::new(code.as_ptr(), from, mode);
            let consumed = r.relocate_bytes(&mut w, min)?;
            Ok((consumed, buf[..w.offset()].to_vec()))
        }
    }

    #[test]
    fn decode_common_prologue_forms() {
        assert_eq!(decode(&[0x55]).len, 1); // push rbp
        assert_eq!(decode(&[0x48, 0x89, 0xE5]).len, 3); // mov rbp, rsp
        assert_eq!(decode(&[0x48, 0x81, 0xEC, 0x80, 0, 0, 0]).len, 7); // sub rsp, 0x80
        assert_eq!(decode(&[0x48, 0x83, 0xEC, 0x08]).len, 4); // sub rsp, 8
        assert_eq!(decode(&[0x41, 0x57]).len, 2); // push r15
        assert_eq!(decode(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8]).len, 10); // movabs
        assert_eq!(decode(&[0x8D, 0x04, 0x37]).len, 3); // lea eax, [rdi+rsi]
        assert_eq!(decode(&[0xF7, 0xC7, 1, 0, 0, 0]).len, 6); // test edi, 1
        assert_eq!(decode(&[0xF7, 0xDF]).len, 2); // neg edi
    }

    #[test]
    fn decode_flow_terminators() {
        assert_eq!(decode(&[0xC3]).kind, InsnKind::Ret);
        assert_eq!(decode(&[0xC2, 0x08, 0x00]).len, 3);
        assert_eq!(decode(&[0xCC]).kind, InsnKind::Trap);
        assert_eq!(decode(&[0x0F, 0x0B]).kind, InsnKind::Trap);
        assert_eq!(decode(&[0xF4]).kind, InsnKind::Trap);
    }

    #[test]
    fn decode_branches() {
        let jmp = decode(&[0xE9, 0xFB, 0, 0, 0]);
        assert_eq!((jmp.len, jmp.kind, jmp.branch), (5, InsnKind::JmpRel32, 0xFB));
        let jcc = decode(&[0x0F, 0x84, 0xFB, 0x0F, 0, 0]);
        assert_eq!((jcc.len, jcc.kind, jcc.cc, jcc.branch), (6, InsnKind::JccRel32, 4, 0xFFB));
        let short = decode(&[0x74, 0xF0]);
        assert_eq!((short.kind, short.branch), (InsnKind::JccRel8, -16));
        assert_eq!(decode(&[0xE2, 0x10]).kind, InsnKind::LoopRel8);
    }

    #[test]
    fn decode_rip_relative() {
        let mov = decode(&[0x48, 0x8B, 0x05, 0x10, 0, 0, 0]);
        assert_eq!((mov.len, mov.kind, mov.disp_offset), (7, InsnKind::PcRelative, Some(3)));
        // cmp byte [rip+disp], imm8: the immediate follows the displacement.
        let cmp = decode(&[0x80, 0x3D, 0x10, 0, 0, 0, 0x00]);
        assert_eq!((cmp.len, cmp.disp_offset), (7, Some(2)));
    }

    #[test]
    fn decode_endbr64_and_three_byte_maps() {
        assert_eq!(decode(&[0xF3, 0x0F, 0x1E, 0xFA]).len, 4);
        // pshufb xmm0, xmm1
        assert_eq!(decode(&[0x66, 0x0F, 0x38, 0x00, 0xC1]).len, 5);
        // palignr xmm0, xmm1, 4
        assert_eq!(decode(&[0x66, 0x0F, 0x3A, 0x0F, 0xC1, 0x04]).len, 6);
        // vzeroupper
        assert_eq!(decode(&[0xC5, 0xF8, 0x77]).len, 3);
        // vmovdqu ymm0, [rip+0x10]
        let v = decode(&[0xC5, 0xFE, 0x6F, 0x05, 0x10, 0, 0, 0]);
        assert_eq!((v.len, v.kind), (8, InsnKind::PcRelative));
    }

    #[test]
    fn moffs_width_follows_address_size() {
        assert_eq!(decode(&[0xA1, 0, 0, 0, 0, 0, 0, 0, 0]).len, 9);
        assert_eq!(decode32(&[0xA1, 0, 0, 0, 0]).len, 5);
        assert_eq!(decode32(&[0x67, 0xA1, 0, 0]).len, 4);
    }

    #[test]
    fn bits32_treats_40_4f_as_instructions() {
        // inc eax; in 64-bit mode the same byte is a REX prefix.
        assert_eq!(decode32(&[0x40]).len, 1);
        assert_eq!(decode(&[0x40, 0x90]).len, 2);
        // dec ecx; mov ebp, esp
        unsafe {
            assert_eq!(can_relocate([0x49, 0x89, 0xE5, 0xC3].as_ptr(), 3, Mode::Bits32), 3);
        }
    }

    #[test]
    fn bits32_disp32_is_absolute() {
        // mov eax, [0x08049000]
        let insn = decode32(&[0x8B, 0x05, 0x00, 0x90, 0x04, 0x08]);
        assert_eq!((insn.len, insn.kind), (6, InsnKind::Plain));
        // The same bytes relocate verbatim.
        let (_, out) = relocate(Mode::Bits32, &[0x8B, 0x05, 0x00, 0x90, 0x04, 0x08], 0x1000, 0x8000, 6).unwrap();
        assert_eq!(out, &[0x8B, 0x05, 0x00, 0x90, 0x04, 0x08]);
    }

    #[test]
    fn bits32_sixteen_bit_addressing() {
        // 67 8B 46 08 = mov eax, [bp+8]
        assert_eq!(decode32(&[0x67, 0x8B, 0x46, 0x08]).len, 4);
        // 67 A1 / 67 8B 06 34 12 = mov eax, [0x1234]
        assert_eq!(decode32(&[0x67, 0x8B, 0x06, 0x34, 0x12]).len, 5);
    }

    #[test]
    fn can_relocate_stops_at_ret() {
        let code = [0x55u8, 0x48, 0x89, 0xE5, 0x48, 0x81, 0xEC, 0x80, 0, 0, 0, 0xC3];
        unsafe {
            assert_eq!(can_relocate(code.as_ptr(), 5, Mode::Bits64), 11);
            assert_eq!(can_relocate([0x55u8, 0x48, 0x89, 0xE5, 0xC3].as_ptr(), 5, Mode::Bits64), 4);
            assert_eq!(can_relocate([0xC3u8].as_ptr(), 5, Mode::Bits64), 0);
        }
    }

    #[test]
    fn can_relocate_stops_after_unconditional_jump() {
        unsafe {
            // jmp short; mov rax, rdi; ret (a neighbour, not part of the run)
            let stub = [0xEBu8, 0x0E, 0x48, 0x89, 0xF8, 0xC3];
            assert_eq!(can_relocate(stub.as_ptr(), 5, Mode::Bits64), 2);
            // jmp rel32 covers a near redirect by itself
            let tail = [0xE9u8, 0, 0, 0, 0, 0x90, 0x90];
            assert_eq!(can_relocate(tail.as_ptr(), 5, Mode::Bits64), 5);
            // jmp rax
            assert_eq!(can_relocate([0xFFu8, 0xE0, 0x90, 0x90, 0x90].as_ptr(), 5, Mode::Bits64), 2);
            // jmp [rip+0]
            assert_eq!(can_relocate([0xFFu8, 0x25, 0, 0, 0, 0, 0x90].as_ptr(), 16, Mode::Bits64), 6);
            // dec rdi (FF /1) keeps going
            assert_eq!(can_relocate([0x48u8, 0xFF, 0xCF, 0x90, 0x90, 0x90].as_ptr(), 5, Mode::Bits64), 5);
        }
    }

    #[test]
    fn jump_stub_shorter_than_redirect_is_too_small() {
        let err = relocate(Mode::Bits64, &[0xEB, 0x0E, 0x48, 0x89, 0xF8, 0xC3], 0x1000, 0x2000, 5).unwrap_err();
        assert_eq!(err, HookError::PatchTooSmall { needed: 5, available: 2 });
    }

    #[test]
    fn loop_back_to_entry_is_refused() {
        // L: dec rdi; jnz L; mov rax, rdi; ret
        let code = [0x48, 0xFF, 0xCF, 0x75, 0xFB, 0x48, 0x89, 0xF8, 0xC3];
        assert_eq!(relocate(Mode::Bits64, &code, 0x1000, 0x2000, 5).unwrap_err(), HookError::RelocationFailed);
    }

    #[test]
    fn short_function_is_too_small() {
        // mov eax, edi; ret
        let err = relocate(Mode::Bits64, &[0x89, 0xF8, 0xC3], 0x1000, 0x2000, 5).unwrap_err();
        assert_eq!(err, HookError::PatchTooSmall { needed: 5, available: 2 });
    }

    #[test]
    fn relocate_rip_relative_mov() {
        // mov rax, [rip+0x100] at 0x1000 reads 0x1107; from 0x2000 that is -0xF00.
        let (consumed, out) = relocate(Mode::Bits64, &[0x48, 0x8B, 0x05, 0x00, 0x01, 0, 0], 0x1000, 0x2000, 7).unwrap();
        assert_eq!(consumed, 7);
        assert_eq!(i32::from_le_bytes(out[3..7].try_into().unwrap()), -0xF00);
    }

    #[test]
    fn relocate_rip_relative_out_of_range_fails() {
        let code = [0x48u8, 0x8B, 0x05, 0x00, 0x01, 0, 0];
        let err = relocate(Mode::Bits64, &code, 0x1000, 0x7000_0000_0000, 7).unwrap_err();
        assert_eq!(err, HookError::RelocationFailed);
    }

    #[test]
    fn relocate_jmp_rel8_widens_to_near() {
        // jmp +0x10 at 0x1000 → 0x1012
        let (_, out) = relocate(Mode::Bits64, &[0xEB, 0x10, 0x90, 0x90, 0x90], 0x1000, 0x2000, 2).unwrap();
        assert_eq!(out[0], 0xE9);
        let rel = i32::from_le_bytes(out[1..5].try_into().unwrap());
        assert_eq!((0x2005i64 + rel as i64) as u64, 0x1012);
    }

    #[test]
    fn relocate_jcc_near_and_far() {
        // je +0x10 at 0x1000 → 0x1012
        let (_, near) = relocate(Mode::Bits64, &[0x74, 0x10], 0x1000, 0x2000, 2).unwrap();
        assert_eq!(&near[..2], &[0x0F, 0x84]);
        let (_, far) = relocate(Mode::Bits64, &[0x74, 0x10], 0x1000, 0x7000_0000_0000, 2).unwrap();
        assert_eq!(&far[..2], &[0x75, 16]); // jne over the absolute jump
        assert_eq!(far.len(), 2 + 16);
    }

    #[test]
    fn relocate_branch_into_patched_bytes_fails() {
        // jmp +1 lands inside the 5 bytes the redirect overwrites.
        let code = [0xEBu8, 0x01, 0x90, 0x90, 0x90, 0x90];
        assert_eq!(
            relocate(Mode::Bits64, &code, 0x1000, 0x2000, 5).unwrap_err(),
            HookError::RelocationFailed
        );
    }

    #[test]
    fn relocate_call_rel32() {
        // call +0x100 at 0x1000 → 0x1105, reachable from 0x2000.
        let (_, out) = relocate(Mode::Bits64, &[0xE8, 0x00, 0x01, 0, 0], 0x1000, 0x2000, 5).unwrap();
        assert_eq!(out[0], 0xE8);
        let rel = i32::from_le_bytes(out[1..5].try_into().unwrap());
        assert_eq!((0x2005i64 + rel as i64) as u64, 0x1105);

        // Out of range: mov r11, target; call r11
        let (_, far) = relocate(Mode::Bits64, &[0xE8, 0x00, 0x01, 0, 0], 0x1000, 0x7000_0000_0000, 5).unwrap();
        assert_eq!(&far[..2], &[0x49, 0xBB]);
        assert_eq!(u64::from_le_bytes(far[2..10].try_into().unwrap()), 0x1105);
        assert_eq!(&far[10..], &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn bits32_get_pc_thunk_pushes_return_address() {
        // call $+0; pop ebx
        let (consumed, out) = relocate(Mode::Bits32, &[0xE8, 0, 0, 0, 0, 0x5B], 0x0804_8000, 0x1000_0000, 5).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(out, &[0x68, 0x05, 0x80, 0x04, 0x08]);
    }

    #[test]
    fn bits32_jcc_relocates_to_rel32() {
        // push ebp; mov ebp, esp; je +0x20 at 0x08048000 → 0x08048025
        let code = [0x55u8, 0x89, 0xE5, 0x74, 0x20];
        let (consumed, out) = relocate(Mode::Bits32, &code, 0x0804_8000, 0x1000_0000, 5).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(&out[..3], &[0x55, 0x89, 0xE5]);
        assert_eq!(&out[3..5], &[0x0F, 0x84]);
        let rel = i32::from_le_bytes(out[5..9].try_into().unwrap());
        assert_eq!((0x1000_0009u32).wrapping_add(rel as u32), 0x0804_8025);
    }

    #[test]
    fn endbr64_detection() {
        unsafe {
            assert!(is_endbr64([0xF3u8, 0x0F, 0x1E, 0xFA].as_ptr()));
            assert!(!is_endbr64([0xF3u8, 0x0F, 0x1E, 0xFB].as_ptr()));
        }
    }
}
