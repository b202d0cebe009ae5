//! 재배치 엔진
//!
//! 배치된 섹션 메모리(`&mut [u8]` 뷰)에 아키텍처별 재배치를 적용한다.
//! PC 상대 값은 `place`(재배치 위치의 런타임 주소)로 계산한다.
//!
//! - x86_64: NONE, 64, PC32, PLT32, 32, 32S, PC64
//! - AArch64: ABS64/32, PREL64/32, CALL26/JUMP26, ADRP, ADD/LDST LO12
//! - RISC-V: 32, 64, BRANCH, JAL, CALL(_PLT), HI20/LO12, PCREL 쌍
//!
//! 호출 대상이 명령어 도달 범위를 벗어나면 모듈 text 윈도우의 PLT 페이지에
//! 스텁을 만들어 경유한다.

use alloc::vec::Vec;
use core::ptr;

use log::{debug, warn};

use super::elf::{reloc_aarch64::*, reloc_riscv::*, reloc_x86_64::*, ElfMachine};
use crate::mm::PAGE_SIZE;

/// 재배치 에러
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RelocError {
    #[error("unsupported relocation type {rtype} for {machine:?}")]
    Unsupported { machine: ElfMachine, rtype: u32 },
    #[error("relocation type {rtype} overflow (value {value:#x})")]
    Overflow { rtype: u32, value: i64 },
    #[error("relocation at offset {offset:#x} out of bounds")]
    OutOfBounds { offset: usize },
    #[error("PLT page full")]
    PltFull,
    #[error("call target out of range and no PLT page available")]
    PltUnavailable,
    #[error("PCREL_LO12 at {place:#x} has no matching PCREL_HI20")]
    UnpairedLo12 { place: usize },
}

// ============================================================================
// PLT (Procedure Linkage Table) 지원
// ============================================================================

/// PLT 스텁 크기 (바이트)
pub const fn plt_entry_size(machine: ElfMachine) -> usize {
    match machine {
        ElfMachine::X86_64 | ElfMachine::AArch64 => 16,
        // 4개 명령어 + 8바이트 정렬된 타겟 주소
        ElfMachine::RiscV => 24,
    }
}

/// 모듈당 PLT 페이지 (타겟별로 스텁 하나)
pub struct PltTable {
    machine: ElfMachine,
    /// PLT 페이지 시작 주소
    base: usize,
    /// (target_addr, plt_addr)
    entries: Vec<(usize, usize)>,
}

impl PltTable {
    /// # Safety
    /// `base`는 쓰기 가능한 한 페이지 (PAGE_SIZE 정렬)
    pub unsafe fn new(machine: ElfMachine, base: usize) -> Self {
        Self {
            machine,
            base,
            entries: Vec::new(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        PAGE_SIZE / plt_entry_size(self.machine)
    }

    /// PLT 엔트리 할당 또는 기존 엔트리 반환
    pub fn get_or_create(&mut self, target: usize) -> Result<usize, RelocError> {
        if let Some(&(_, plt_addr)) = self.entries.iter().find(|(t, _)| *t == target) {
            return Ok(plt_addr);
        }
        if self.entries.len() >= self.capacity() {
            return Err(RelocError::PltFull);
        }

        let plt_addr = self.base + self.entries.len() * plt_entry_size(self.machine);
        self.write_stub(plt_addr, target);
        self.entries.push((target, plt_addr));
        debug!("[module] PLT stub {:#x} -> {:#x}", plt_addr, target);

        Ok(plt_addr)
    }

    fn write_stub(&self, plt_addr: usize, target: usize) {
        let mut stub = [0u8; 24];
        let size = plt_entry_size(self.machine);
        let target = (target as u64).to_le_bytes();

        match self.machine {
            ElfMachine::X86_64 => {
                // jmp *0(%rip) ; 바로 뒤의 64비트 주소로 간접 점프
                stub[..6].copy_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
                stub[6..14].copy_from_slice(&target);
                // int3 패딩
                stub[14..16].copy_from_slice(&[0xcc, 0xcc]);
            }
            ElfMachine::AArch64 => {
                // ldr x16, [pc, #8]
                stub[0..4].copy_from_slice(&0x5800_0050u32.to_le_bytes());
                // br x16
                stub[4..8].copy_from_slice(&0xd61f_0200u32.to_le_bytes());
                stub[8..16].copy_from_slice(&target);
            }
            ElfMachine::RiscV => {
                // auipc t3, 0
                stub[0..4].copy_from_slice(&0x0000_0e17u32.to_le_bytes());
                // ld t3, 16(t3)
                stub[4..8].copy_from_slice(&0x010e_3e03u32.to_le_bytes());
                // jr t3
                stub[8..12].copy_from_slice(&0x000e_0067u32.to_le_bytes());
                // nop
                stub[12..16].copy_from_slice(&0x0000_0013u32.to_le_bytes());
                stub[16..24].copy_from_slice(&target);
            }
        }

        // 생성자 계약에 따라 plt_addr..plt_addr+size는 PLT 페이지 내부
        unsafe { ptr::copy_nonoverlapping(stub.as_ptr(), plt_addr as *mut u8, size) };
    }
}

/// 한 오브젝트의 재배치 처리 상태
pub struct RelocContext {
    plt: Option<PltTable>,
    /// RISC-V: (auipc 주소, S + A - P), PCREL_LO12가 참조
    pcrel_hi20: Vec<(usize, i64)>,
}

impl RelocContext {
    pub fn new(plt: Option<PltTable>) -> Self {
        Self {
            plt,
            pcrel_hi20: Vec::new(),
        }
    }

    pub fn plt(&self) -> Option<&PltTable> {
        self.plt.as_ref()
    }

    pub fn into_plt(self) -> Option<PltTable> {
        self.plt
    }

    /// 범위 밖 호출을 위한 스텁 주소
    fn plt_stub(&mut self, target: usize) -> Result<usize, RelocError> {
        let plt = self.plt.as_mut().ok_or(RelocError::PltUnavailable)?;
        plt.get_or_create(target).inspect_err(|_| warn!("[module] PLT table full"))
    }
}

/// 재배치 한 건
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    pub rtype: u32,
    /// 섹션 뷰 내 오프셋
    pub offset: usize,
    /// 재배치 위치의 런타임 주소 (P)
    pub place: usize,
    /// 심볼 값 (S)
    pub symbol: usize,
    /// A
    pub addend: i64,
}

/// 재배치 적용
pub fn apply(ctx: &mut RelocContext, machine: ElfMachine, mem: &mut [u8], fixup: &Fixup) -> Result<(), RelocError> {
    match machine {
        ElfMachine::X86_64 => apply_x86_64(ctx, mem, fixup),
        ElfMachine::AArch64 => apply_aarch64(ctx, mem, fixup),
        ElfMachine::RiscV => apply_riscv(ctx, mem, fixup),
    }
}

/// 호출 계열 재배치인지 (PLT 페이지가 필요할 수 있음)
pub fn is_call(machine: ElfMachine, rtype: u32) -> bool {
    match machine {
        ElfMachine::X86_64 => rtype == R_X86_64_PLT32,
        ElfMachine::AArch64 => matches!(rtype, R_AARCH64_CALL26 | R_AARCH64_JUMP26),
        ElfMachine::RiscV => matches!(rtype, R_RISCV_CALL | R_RISCV_CALL_PLT),
    }
}

fn field<const N: usize>(mem: &mut [u8], offset: usize) -> Result<&mut [u8; N], RelocError> {
    offset
        .checked_add(N)
        .and_then(|end| mem.get_mut(offset..end))
        .and_then(|bytes| <&mut [u8; N]>::try_from(bytes).ok())
        .ok_or(RelocError::OutOfBounds { offset })
}

fn write32(mem: &mut [u8], offset: usize, value: u32) -> Result<(), RelocError> {
    *field::<4>(mem, offset)? = value.to_le_bytes();
    Ok(())
}

fn write64(mem: &mut [u8], offset: usize, value: u64) -> Result<(), RelocError> {
    *field::<8>(mem, offset)? = value.to_le_bytes();
    Ok(())
}

/// 명령어 수정: `patch(기존 명령어) -> 새 명령어`
fn patch_insn(mem: &mut [u8], offset: usize, patch: impl FnOnce(u32) -> u32) -> Result<(), RelocError> {
    let bytes = field::<4>(mem, offset)?;
    *bytes = patch(u32::from_le_bytes(*bytes)).to_le_bytes();
    Ok(())
}

fn fits_signed(value: i64, bits: u32) -> bool {
    let half = 1i64 << (bits - 1);
    (-half..half).contains(&value)
}

fn overflow(rtype: u32, value: i64) -> RelocError {
    RelocError::Overflow { rtype, value }
}

fn apply_x86_64(ctx: &mut RelocContext, mem: &mut [u8], fixup: &Fixup) -> Result<(), RelocError> {
    let s = fixup.symbol as i64;
    let a = fixup.addend;
    let p = fixup.place as i64;
    let off = fixup.offset;
    let rtype = fixup.rtype;

    match rtype {
        R_X86_64_NONE => {}

        R_X86_64_64 => write64(mem, off, s.wrapping_add(a) as u64)?,

        R_X86_64_PC32 => {
            let value = s.wrapping_add(a).wrapping_sub(p);
            if !fits_signed(value, 32) {
                return Err(overflow(rtype, value));
            }
            write32(mem, off, value as u32)?;
        }

        R_X86_64_PLT32 => {
            let mut value = s.wrapping_add(a).wrapping_sub(p);
            if !fits_signed(value, 32) {
                // 스텁은 S로 점프, addend는 PC 보정이므로 그대로 유지
                let stub = ctx.plt_stub(fixup.symbol)?;
                value = (stub as i64).wrapping_add(a).wrapping_sub(p);
                if !fits_signed(value, 32) {
                    return Err(overflow(rtype, value));
                }
            }
            write32(mem, off, value as u32)?;
        }

        R_X86_64_32 => {
            let value = s.wrapping_add(a);
            if u32::try_from(value).is_err() {
                return Err(overflow(rtype, value));
            }
            write32(mem, off, value as u32)?;
        }

        R_X86_64_32S => {
            let value = s.wrapping_add(a);
            if !fits_signed(value, 32) {
                return Err(overflow(rtype, value));
            }
            write32(mem, off, value as u32)?;
        }

        R_X86_64_PC64 => write64(mem, off, s.wrapping_add(a).wrapping_sub(p) as u64)?,

        _ => {
            warn!("[module] Unsupported x86_64 relocation type: {}", rtype);
            return Err(RelocError::Unsupported {
                machine: ElfMachine::X86_64,
                rtype,
            });
        }
    }

    Ok(())
}

fn apply_aarch64(ctx: &mut RelocContext, mem: &mut [u8], fixup: &Fixup) -> Result<(), RelocError> {
    let s = fixup.symbol as i64;
    let a = fixup.addend;
    let p = fixup.place as i64;
    let off = fixup.offset;
    let rtype = fixup.rtype;

    match rtype {
        R_AARCH64_NONE => {}

        R_AARCH64_ABS64 => write64(mem, off, s.wrapping_add(a) as u64)?,

        R_AARCH64_ABS32 => {
            // 부호/무부호 32비트 어느 쪽으로든 표현 가능해야 함
            let value = s.wrapping_add(a);
            if !fits_signed(value, 32) && u32::try_from(value).is_err() {
                return Err(overflow(rtype, value));
            }
            write32(mem, off, value as u32)?;
        }

        R_AARCH64_PREL32 => {
            let value = s.wrapping_add(a).wrapping_sub(p);
            if !fits_signed(value, 32) {
                return Err(overflow(rtype, value));
            }
            write32(mem, off, value as u32)?;
        }

        R_AARCH64_PREL64 => write64(mem, off, s.wrapping_add(a).wrapping_sub(p) as u64)?,

        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
            // S + A - P, 26비트 워드 오프셋 (±128MB)
            let target = s.wrapping_add(a);
            let mut offset = target.wrapping_sub(p);
            if !fits_signed(offset, 28) {
                let stub = ctx.plt_stub(target as usize)?;
                offset = (stub as i64).wrapping_sub(p);
                if !fits_signed(offset, 28) {
                    return Err(overflow(rtype, offset));
                }
            }
            let imm26 = ((offset >> 2) as u32) & 0x03ff_ffff;
            patch_insn(mem, off, |insn| (insn & 0xfc00_0000) | imm26)?;
        }

        R_AARCH64_ADR_PREL_PG_HI21 => {
            // Page(S+A) - Page(P), ADRP 명령 (±4GB)
            let page_s = s.wrapping_add(a) & !0xfff;
            let page_p = p & !0xfff;
            let pages = page_s.wrapping_sub(page_p) >> 12;
            if !fits_signed(pages, 21) {
                return Err(overflow(rtype, pages));
            }
            let immlo = ((pages & 0x3) as u32) << 29;
            let immhi = (((pages >> 2) & 0x7ffff) as u32) << 5;
            patch_insn(mem, off, |insn| (insn & 0x9f00_001f) | immlo | immhi)?;
        }

        R_AARCH64_ADD_ABS_LO12_NC => {
            let value = (s.wrapping_add(a) & 0xfff) as u32;
            patch_insn(mem, off, |insn| (insn & 0xffc0_03ff) | (value << 10))?;
        }

        R_AARCH64_LDST8_ABS_LO12_NC
        | R_AARCH64_LDST16_ABS_LO12_NC
        | R_AARCH64_LDST32_ABS_LO12_NC
        | R_AARCH64_LDST64_ABS_LO12_NC => {
            // 접근 크기만큼 스케일된 12비트 오프셋
            let shift = match rtype {
                R_AARCH64_LDST8_ABS_LO12_NC => 0,
                R_AARCH64_LDST16_ABS_LO12_NC => 1,
                R_AARCH64_LDST32_ABS_LO12_NC => 2,
                _ => 3,
            };
            let value = ((s.wrapping_add(a) & 0xfff) >> shift) as u32;
            patch_insn(mem, off, |insn| (insn & 0xffc0_03ff) | (value << 10))?;
        }

        _ => {
            warn!("[module] Unsupported AArch64 relocation type: {}", rtype);
            return Err(RelocError::Unsupported {
                machine: ElfMachine::AArch64,
                rtype,
            });
        }
    }

    Ok(())
}

/// U-type 상위 20비트 (하위 12비트 부호 확장 보정 포함)
fn hi20(value: i64) -> u32 {
    (((value.wrapping_add(0x800)) >> 12) as u32) << 12
}

fn i_type_lo12(insn: u32, value: i64) -> u32 {
    (insn & 0x000f_ffff) | (((value & 0xfff) as u32) << 20)
}

fn s_type_lo12(insn: u32, value: i64) -> u32 {
    let imm11_5 = ((value >> 5) & 0x7f) as u32;
    let imm4_0 = (value & 0x1f) as u32;
    (insn & 0x01ff_f07f) | (imm11_5 << 25) | (imm4_0 << 7)
}

fn apply_riscv(ctx: &mut RelocContext, mem: &mut [u8], fixup: &Fixup) -> Result<(), RelocError> {
    let s = fixup.symbol as i64;
    let a = fixup.addend;
    let p = fixup.place as i64;
    let off = fixup.offset;
    let rtype = fixup.rtype;

    match rtype {
        R_RISCV_NONE | R_RISCV_RELAX | R_RISCV_ALIGN => {}

        R_RISCV_64 => write64(mem, off, s.wrapping_add(a) as u64)?,

        R_RISCV_32 => {
            let value = s.wrapping_add(a);
            if !fits_signed(value, 32) && u32::try_from(value).is_err() {
                return Err(overflow(rtype, value));
            }
            write32(mem, off, value as u32)?;
        }

        R_RISCV_BRANCH => {
            // B-type 명령 (조건 분기, ±4KB)
            let offset = s.wrapping_add(a).wrapping_sub(p);
            if !fits_signed(offset, 13) {
                return Err(overflow(rtype, offset));
            }
            let imm12 = ((offset >> 12) & 0x1) as u32;
            let imm10_5 = ((offset >> 5) & 0x3f) as u32;
            let imm4_1 = ((offset >> 1) & 0xf) as u32;
            let imm11 = ((offset >> 11) & 0x1) as u32;
            patch_insn(mem, off, |insn| {
                (insn & 0x01ff_f07f) | (imm12 << 31) | (imm10_5 << 25) | (imm4_1 << 8) | (imm11 << 7)
            })?;
        }

        R_RISCV_JAL => {
            // J-type 명령 (jal, ±1MB)
            let offset = s.wrapping_add(a).wrapping_sub(p);
            if !fits_signed(offset, 21) {
                return Err(overflow(rtype, offset));
            }
            let imm20 = ((offset >> 20) & 0x1) as u32;
            let imm10_1 = ((offset >> 1) & 0x3ff) as u32;
            let imm11 = ((offset >> 11) & 0x1) as u32;
            let imm19_12 = ((offset >> 12) & 0xff) as u32;
            patch_insn(mem, off, |insn| {
                (insn & 0xfff) | (imm20 << 31) | (imm10_1 << 21) | (imm11 << 20) | (imm19_12 << 12)
            })?;
        }

        R_RISCV_CALL | R_RISCV_CALL_PLT => {
            // auipc + jalr 쌍 (±2GB)
            let target = s.wrapping_add(a);
            let mut offset = target.wrapping_sub(p);
            if !fits_signed(offset.wrapping_add(0x800), 32) {
                let stub = ctx.plt_stub(target as usize)?;
                offset = (stub as i64).wrapping_sub(p);
                if !fits_signed(offset.wrapping_add(0x800), 32) {
                    return Err(overflow(rtype, offset));
                }
            }
            // jalr이 범위 밖이면 auipc도 건드리지 않는다
            field::<8>(mem, off)?;
            patch_insn(mem, off, |auipc| (auipc & 0xfff) | hi20(offset))?;
            patch_insn(mem, off + 4, |jalr| i_type_lo12(jalr, offset))?;
        }

        R_RISCV_HI20 => {
            let value = s.wrapping_add(a);
            if !fits_signed(value.wrapping_add(0x800), 32) {
                return Err(overflow(rtype, value));
            }
            patch_insn(mem, off, |insn| (insn & 0xfff) | hi20(value))?;
        }

        R_RISCV_LO12_I => {
            let value = s.wrapping_add(a);
            patch_insn(mem, off, |insn| i_type_lo12(insn, value))?;
        }

        R_RISCV_LO12_S => {
            let value = s.wrapping_add(a);
            patch_insn(mem, off, |insn| s_type_lo12(insn, value))?;
        }

        R_RISCV_PCREL_HI20 => {
            let offset = s.wrapping_add(a).wrapping_sub(p);
            if !fits_signed(offset.wrapping_add(0x800), 32) {
                return Err(overflow(rtype, offset));
            }
            patch_insn(mem, off, |insn| (insn & 0xfff) | hi20(offset))?;
            ctx.pcrel_hi20.push((fixup.place, offset));
        }

        R_RISCV_PCREL_LO12_I | R_RISCV_PCREL_LO12_S => {
            // 심볼은 짝이 되는 auipc 위치를 가리킨다
            let auipc = fixup.symbol;
            let offset = ctx
                .pcrel_hi20
                .iter()
                .rev()
                .find(|(addr, _)| *addr == auipc)
                .map(|&(_, offset)| offset)
                .ok_or(RelocError::UnpairedLo12 { place: fixup.place })?;
            if rtype == R_RISCV_PCREL_LO12_I {
                patch_insn(mem, off, |insn| i_type_lo12(insn, offset))?;
            } else {
                patch_insn(mem, off, |insn| s_type_lo12(insn, offset))?;
            }
        }

        _ => {
            warn!("[module] Unsupported RISC-V relocation type: {}", rtype);
            return Err(RelocError::Unsupported {
                machine: ElfMachine::RiscV,
                rtype,
            });
        }
    }

    Ok(())
}

/// 명령어 캐시 플러시 (커널 빌드)
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub fn flush_icache(addr: usize, size: usize) {
    const CACHE_LINE: usize = 64;
    let end = addr + size;
    unsafe {
        let mut line = addr & !(CACHE_LINE - 1);
        while line < end {
            // 데이터 캐시 클린
            core::arch::asm!("dc cvau, {}", in(reg) line);
            line += CACHE_LINE;
        }
        core::arch::asm!("dsb ish");

        line = addr & !(CACHE_LINE - 1);
        while line < end {
            // 명령어 캐시 무효화
            core::arch::asm!("ic ivau, {}", in(reg) line);
            line += CACHE_LINE;
        }
        core::arch::asm!("dsb ish");
        core::arch::asm!("isb");
    }
}

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
pub fn flush_icache(_addr: usize, _size: usize) {
    unsafe { core::arch::asm!("fence.i") };
}

/// x86_64는 명령어/데이터 캐시가 일관적이고 호스트 빌드는 실제 코드를 실행하지 않음
#[cfg(not(all(target_os = "none", any(target_arch = "aarch64", target_arch = "riscv64"))))]
pub fn flush_icache(_addr: usize, _size: usize) {}
