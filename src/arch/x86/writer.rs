use crate::types::Mode;

/// General-purpose registers. R8–R15 only exist in 64-bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding.
    #[inline]
    fn lo3(self) -> u8 {
        (self as u8) & 7
    }

    /// Whether this register requires the REX.B or REX.R extension bit.
    #[inline]
    fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// Size of `jmp rel32`.
pub const NEAR_JMP_SIZE: usize = 5;

/// Size of the 64-bit absolute jump emitted by [`X86Writer::put_jmp_far`].
pub const FAR_JMP_SIZE: usize = 16;

/// Emits x86 machine code into a raw buffer, tracking the runtime PC of the
/// next byte so that relative branches can be encoded.
#[derive(Debug)]
pub struct X86Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u64,
    size: usize,
    mode: Mode,
}

impl X86Writer {
    /// # Safety
    /// `buffer` must be valid for `size` bytes of writes for the writer's lifetime.
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self::with_mode(buffer, size, pc, Mode::NATIVE)
    }

    /// # Safety
    /// Same as [`X86Writer::new`].
    pub unsafe fn with_mode(buffer: *mut u8, size: usize, pc: u64, mode: Mode) -> Self {
        Self {
            base: buffer,
            code: buffer,
            pc,
            size,
            mode,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    fn can_write(&self, bytes: usize) -> bool {
        self.offset() + bytes <= self.size
    }

    unsafe fn emit(&mut self, byte: u8) {
        debug_assert!(self.can_write(1));
        self.code.write(byte);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(1);
    }

    unsafe fn emit_u32_le(&mut self, val: u32) {
        debug_assert!(self.can_write(4));
        (self.code as *mut u32).write_unaligned(val);
        self.code = self.code.add(4);
        self.pc = self.pc.wrapping_add(4);
    }

    unsafe fn emit_u64_le(&mut self, val: u64) {
        debug_assert!(self.can_write(8));
        (self.code as *mut u64).write_unaligned(val);
        self.code = self.code.add(8);
        self.pc = self.pc.wrapping_add(8);
    }

    /// rel32 from the end of an instruction whose remaining length after the
    /// current PC is `rest` bytes.
    #[inline]
    fn rel32_from(&self, rest: u64, target: u64) -> i64 {
        match self.mode {
            Mode::Bits64 => (target as i64) - (self.pc.wrapping_add(rest) as i64),
            // 32-bit displacements wrap around the 4GiB address space.
            Mode::Bits32 => (target as u32).wrapping_sub((self.pc as u32).wrapping_add(rest as u32)) as i32 as i64,
        }
    }

    /// REX prefix: 0100 W R X B
    #[inline]
    fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
        0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
    }

    /// ModRM byte: mod(2) | reg(3) | rm(3)
    #[inline]
    fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
        ((mod_ & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    /// Whether `jmp rel32` placed at the current PC reaches `target`.
    pub fn can_reach_near(&self, target: u64) -> bool {
        match self.mode {
            Mode::Bits32 => true,
            Mode::Bits64 => {
                let rel = self.rel32_from(NEAR_JMP_SIZE as u64, target);
                rel >= i32::MIN as i64 && rel <= i32::MAX as i64
            }
        }
    }

    // ── Push / Mov ───────────────────────────────────────────────────

    /// `push reg`: [REX.B?] 50+rd
    pub unsafe fn put_push_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0x50 + reg.lo3());
    }

    /// `push imm32`: 68 id. Sign-extended to 64 bits in 64-bit mode.
    pub unsafe fn put_push_imm32(&mut self, imm: u32) {
        self.emit(0x68);
        self.emit_u32_le(imm);
    }

    /// `mov reg, imm64`: REX.W B8+rd io (10 bytes). 64-bit mode only.
    pub unsafe fn put_mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        debug_assert_eq!(self.mode, Mode::Bits64);
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0xB8 + reg.lo3());
        self.emit_u64_le(imm);
    }

    /// `mov dst, src` (64-bit): REX.W 89 ModRM (mod=11)
    pub unsafe fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(Self::rex(true, src.is_extended(), false, dst.is_extended()));
        self.emit(0x89);
        self.emit(Self::modrm(0b11, src.lo3(), dst.lo3()));
    }

    /// `lea dst, [base + disp32]` (64-bit)
    pub unsafe fn put_lea_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32) {
        self.emit(Self::rex(true, dst.is_extended(), false, base.is_extended()));
        self.emit(0x8D);
        if base.lo3() == 4 {
            self.emit(Self::modrm(0b10, dst.lo3(), 0b100));
            self.emit(0x24);
        } else {
            self.emit(Self::modrm(0b10, dst.lo3(), base.lo3()));
        }
        self.emit_u32_le(offset as u32);
    }

    // ── Branches / Calls ─────────────────────────────────────────────

    /// `jmp rel32`: E9 cd (5 bytes). `target` is an absolute address.
    pub unsafe fn put_jmp_near(&mut self, target: u64) {
        self.emit(0xE9);
        let rel = self.rel32_from(4, target);
        self.emit_u32_le(rel as u32);
    }

    /// Far absolute jump via `jmp [rip+2]; ud2; .quad addr` (16 bytes).
    ///
    /// Encoding: FF 25 02 00 00 00  0F 0B  <8-byte address>. The address
    /// literal sits at offset 8 so that an 8-aligned instruction has an
    /// 8-aligned, atomically rewritable slot.
    pub unsafe fn put_jmp_far(&mut self, target: u64) {
        debug_assert_eq!(self.mode, Mode::Bits64);
        self.emit(0xFF);
        self.emit(0x25);
        self.emit_u32_le(0x02);
        self.emit(0x0F);
        self.emit(0x0B);
        self.emit_u64_le(target);
    }

    /// `jmp dword [abs32]`: FF 25 <abs32>. 32-bit mode only; mod=00 rm=101 is
    /// an absolute address there, not RIP-relative.
    pub unsafe fn put_jmp_indirect_abs32(&mut self, slot: u32) {
        debug_assert_eq!(self.mode, Mode::Bits32);
        self.emit(0xFF);
        self.emit(0x25);
        self.emit_u32_le(slot);
    }

    /// Near jump when reachable, otherwise the 16-byte absolute form.
    pub unsafe fn put_jmp_address(&mut self, target: u64) {
        if self.can_reach_near(target) {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    /// `call rel32`: E8 cd (5 bytes). `target` is an absolute address.
    pub unsafe fn put_call_near(&mut self, target: u64) {
        self.emit(0xE8);
        let rel = self.rel32_from(4, target);
        self.emit_u32_le(rel as u32);
    }

    /// `call reg`: [REX.B?] FF /2
    pub unsafe fn put_call_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0xFF);
        self.emit(Self::modrm(0b11, 2, reg.lo3()));
    }

    /// `jcc rel32`: 0F 80+cc cd (6 bytes).
    pub unsafe fn put_jcc_near(&mut self, cc: u8, target: u64) {
        self.emit(0x0F);
        self.emit(0x80 | (cc & 0x0F));
        let rel = self.rel32_from(4, target);
        self.emit_u32_le(rel as u32);
    }

    /// `jcc rel8`: 70+cc cb (2 bytes), displacement given raw.
    pub unsafe fn put_jcc_short(&mut self, cc: u8, rel8: i8) {
        self.emit(0x70 | (cc & 0x0F));
        self.emit(rel8 as u8);
    }

    // ── Misc ─────────────────────────────────────────────────────────

    /// `ret`: C3
    pub unsafe fn put_ret(&mut self) {
        self.emit(0xC3);
    }

    /// `int3`: CC
    pub unsafe fn put_int3(&mut self) {
        self.emit(0xCC);
    }

    /// Multi-byte NOP padding using recommended NOP forms.
    pub unsafe fn put_nop_n(&mut self, n: usize) {
        const FORMS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(FORMS.len());
            self.put_bytes(FORMS[chunk - 1]);
            remaining -= chunk;
        }
    }

    /// Emit raw bytes.
    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.can_write(bytes.len()));
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
        self.code = self.code.add(bytes.len());
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    /// Emit `int3` until the PC is a multiple of `align`.
    pub unsafe fn align_with_int3(&mut self, align: u64) {
        while self.pc % align != 0 {
            self.put_int3();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_at(mode: Mode, pc: u64, f: impl FnOnce(&mut X86Writer)) -> Vec<u8> {
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86Writer::with_mode(buf.as_mut_ptr(), buf.len(), pc, mode);
            f(&mut w);
            buf[..w.offset()].to_vec()
        }
    }

    fn encode(f: impl FnOnce(&mut X86Writer)) -> Vec<u8> {
        encode_at(Mode::Bits64, 0x1000, f)
    }

    #[test]
    fn push_r11_and_imm32() {
        assert_eq!(encode(|w| unsafe { w.put_push_reg(Reg::R11) }), &[0x41, 0x53]);
        assert_eq!(
            encode(|w| unsafe { w.put_push_imm32(0x0804_8000) }),
            &[0x68, 0x00, 0x80, 0x04, 0x08]
        );
    }

    #[test]
    fn mov_r11_imm64() {
        let bytes = encode(|w| unsafe { w.put_mov_reg_imm64(Reg::R11, 0x1234) });
        assert_eq!(bytes.len(), 10);
        // REX.W + REX.B = 0x49, B8+3=BB
        assert_eq!(&bytes[..2], &[0x49, 0xBB]);
        assert_eq!(u64::from_le_bytes(bytes[2..10].try_into().unwrap()), 0x1234);
    }

    #[test]
    fn mov_and_add_reg_reg() {
        assert_eq!(encode(|w| unsafe { w.put_mov_reg_reg(Reg::RAX, Reg::RDI) }), &[0x48, 0x89, 0xF8]);
    }

    #[test]
    fn lea_reg_mem() {
        // lea rax, [rdi+0x20]
        let bytes = encode(|w| unsafe { w.put_lea_reg_mem(Reg::RAX, Reg::RDI, 0x20) });
        assert_eq!(bytes, &[0x48, 0x8D, 0x87, 0x20, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn jmp_near_forward() {
        // rel = 0x1100 - 0x1005 = 0xFB
        let bytes = encode(|w| unsafe { w.put_jmp_near(0x1100) });
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 0xFB);
    }

    #[test]
    fn jmp_far() {
        let bytes = encode(|w| unsafe { w.put_jmp_far(0xDEADBEEFCAFEBABE) });
        assert_eq!(bytes.len(), FAR_JMP_SIZE);
        assert_eq!(&bytes[0..6], &[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[6..8], &[0x0F, 0x0B]); // UD2
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0xDEADBEEFCAFEBABE);
    }

    #[test]
    fn jmp_address_selects_near_or_far() {
        let near = encode_at(Mode::Bits64, 0x7000_0000_0000, |w| unsafe { w.put_jmp_address(0x7000_0000_1000) });
        assert_eq!(near.len(), NEAR_JMP_SIZE);
        let far = encode_at(Mode::Bits64, 0x7000_0000_0000, |w| unsafe { w.put_jmp_address(0x1000) });
        assert_eq!(far.len(), FAR_JMP_SIZE);
    }

    #[test]
    fn bits32_near_jump_wraps_address_space() {
        // From 0xFFFF_FFF0 to 0x10 is a short forward hop once wrapped.
        let bytes = encode_at(Mode::Bits32, 0xFFFF_FFF0, |w| unsafe { w.put_jmp_address(0x10) });
        assert_eq!(bytes.len(), NEAR_JMP_SIZE);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 0x1B);
    }

    #[test]
    fn bits32_indirect_jump_uses_absolute_slot() {
        let bytes = encode_at(Mode::Bits32, 0x4000, |w| unsafe { w.put_jmp_indirect_abs32(0x4008) });
        assert_eq!(bytes, &[0xFF, 0x25, 0x08, 0x40, 0x00, 0x00]);
    }

    #[test]
    fn call_near_and_call_reg() {
        // rel = 0x2000 - 0x1005 = 0xFFB
        let bytes = encode(|w| unsafe { w.put_call_near(0x2000) });
        assert_eq!(bytes[0], 0xE8);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 0xFFB);
        assert_eq!(encode(|w| unsafe { w.put_call_reg(Reg::R11) }), &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn jcc_near_and_short() {
        // je 0x1100 from 0x1000: rel = 0x1100 - 0x1006 = 0xFA
        let bytes = encode(|w| unsafe { w.put_jcc_near(0x4, 0x1100) });
        assert_eq!(&bytes[..2], &[0x0F, 0x84]);
        assert_eq!(i32::from_le_bytes(bytes[2..6].try_into().unwrap()), 0xFA);
        assert_eq!(encode(|w| unsafe { w.put_jcc_short(0x5, 16) }), &[0x75, 0x10]);
    }

    #[test]
    fn nop_n_various() {
        let bytes = encode(|w| unsafe { w.put_nop_n(9) });
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[..4], &[0x66, 0x0F, 0x1F, 0x84]);
        assert_eq!(encode(|w| unsafe { w.put_nop_n(14) }).len(), 14); // 9 + 5
        assert_eq!(encode(|w| unsafe { w.put_nop_n(3) }), &[0x0F, 0x1F, 0x00]);
    }

    #[test]
    fn align_with_int3_pads_to_boundary() {
        let bytes = encode_at(Mode::Bits64, 0x1003, |w| unsafe {
            w.align_with_int3(8);
            assert_eq!(w.pc(), 0x1008);
        });
        assert_eq!(bytes, &[0xCC; 5]);
    }
}
