//! ELF64 파서
//!
//! ELF64 relocatable 오브젝트(ET_REL) 파싱 및 검증
//! 참조: https://refspecs.linuxfoundation.org/elf/gabi4+/ch4.eheader.html
//!
//! 이미지 버퍼는 정렬을 보장하지 않으므로 모든 필드를 리틀 엔디안으로 직접
//! 디코딩한다. 헤더, 섹션 헤더, 심볼 테이블은 복사해서 소유하고 섹션
//! 내용만 원본 이미지를 빌린다.

use alloc::vec::Vec;

/// ELF 매직 넘버
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_REL: u16 = 1;

const HEADER_SIZE: usize = 64;
const SECTION_HEADER_SIZE: usize = 64;
const SYMBOL_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

/// ELF 머신 타입
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfMachine {
    X86_64 = 62,
    AArch64 = 183, // ARM 64-bit
    RiscV = 243,   // RISC-V
}

impl ElfMachine {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            62 => Some(ElfMachine::X86_64),
            183 => Some(ElfMachine::AArch64),
            243 => Some(ElfMachine::RiscV),
            _ => None,
        }
    }

    /// 커널이 빌드된 아키텍처
    pub const fn native() -> Self {
        if cfg!(target_arch = "aarch64") {
            ElfMachine::AArch64
        } else if cfg!(target_arch = "riscv64") {
            ElfMachine::RiscV
        } else {
            ElfMachine::X86_64
        }
    }
}

/// ELF64 헤더
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF64 섹션 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64SectionHeader {
    /// 섹션 이름 (문자열 테이블 인덱스)
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    /// 파일 내 오프셋
    pub sh_offset: u64,
    pub sh_size: u64,
    /// 연관 섹션 인덱스
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    /// 엔트리 크기 (테이블의 경우)
    pub sh_entsize: u64,
}

impl Elf64SectionHeader {
    pub fn is_alloc(&self) -> bool {
        self.sh_flags & section_flags::SHF_ALLOC != 0
    }

    pub fn is_exec(&self) -> bool {
        self.sh_flags & section_flags::SHF_EXECINSTR != 0
    }

    pub fn is_write(&self) -> bool {
        self.sh_flags & section_flags::SHF_WRITE != 0
    }

    pub fn is_nobits(&self) -> bool {
        self.sh_type == section_type::SHT_NOBITS
    }
}

/// 섹션 타입
pub mod section_type {
    pub const SHT_NULL: u32 = 0;
    pub const SHT_PROGBITS: u32 = 1; // 코드/데이터
    pub const SHT_SYMTAB: u32 = 2; // 심볼 테이블
    pub const SHT_STRTAB: u32 = 3; // 문자열 테이블
    pub const SHT_RELA: u32 = 4; // 재배치 (addend 포함)
    pub const SHT_NOBITS: u32 = 8; // BSS (파일에 없음)
    pub const SHT_REL: u32 = 9; // 재배치 (addend 없음)
}

/// 섹션 플래그
pub mod section_flags {
    pub const SHF_WRITE: u64 = 0x1; // 쓰기 가능
    pub const SHF_ALLOC: u64 = 0x2; // 메모리 할당 필요
    pub const SHF_EXECINSTR: u64 = 0x4; // 실행 가능
}

/// 특수 섹션 인덱스
pub mod section_index {
    pub const SHN_UNDEF: u16 = 0; // 미정의
    pub const SHN_LORESERVE: u16 = 0xff00;
    pub const SHN_ABS: u16 = 0xfff1; // 절대값
    pub const SHN_COMMON: u16 = 0xfff2; // 공통
}

/// 심볼 바인딩
pub mod symbol_binding {
    pub const STB_LOCAL: u8 = 0;
    pub const STB_GLOBAL: u8 = 1;
    pub const STB_WEAK: u8 = 2;
}

/// 심볼 타입
pub mod symbol_type {
    pub const STT_NOTYPE: u8 = 0;
    pub const STT_OBJECT: u8 = 1;
    pub const STT_FUNC: u8 = 2;
    pub const STT_SECTION: u8 = 3;
    pub const STT_FILE: u8 = 4;
}

/// ELF64 심볼 테이블 엔트리
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Symbol {
    pub st_name: u32,
    /// 바인딩(상위 4비트) + 타입(하위 4비트)
    pub st_info: u8,
    pub st_other: u8,
    /// 관련 섹션 인덱스
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl Elf64Symbol {
    /// 심볼 바인딩 (상위 4비트)
    pub fn binding(&self) -> u8 {
        self.st_info >> 4
    }

    /// 심볼 타입 (하위 4비트)
    pub fn sym_type(&self) -> u8 {
        self.st_info & 0xf
    }

    pub fn is_undefined(&self) -> bool {
        self.st_shndx == section_index::SHN_UNDEF
    }

    /// 다른 오브젝트에서 보이는 심볼인지 (GLOBAL/WEAK)
    pub fn is_visible(&self) -> bool {
        matches!(
            self.binding(),
            symbol_binding::STB_GLOBAL | symbol_binding::STB_WEAK
        )
    }
}

/// ELF64 재배치 엔트리 (Rela)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Rela {
    /// 재배치 적용 오프셋 (대상 섹션 기준)
    pub r_offset: u64,
    /// 심볼 + 타입
    pub r_info: u64,
    pub r_addend: i64,
}

impl Elf64Rela {
    /// 심볼 인덱스 (상위 32비트)
    pub fn symbol(&self) -> u32 {
        (self.r_info >> 32) as u32
    }

    /// 재배치 타입 (하위 32비트)
    pub fn rel_type(&self) -> u32 {
        (self.r_info & 0xffff_ffff) as u32
    }
}

/// x86_64 재배치 타입
pub mod reloc_x86_64 {
    pub const R_X86_64_NONE: u32 = 0;
    pub const R_X86_64_64: u32 = 1; // S + A
    pub const R_X86_64_PC32: u32 = 2; // S + A - P
    pub const R_X86_64_PLT32: u32 = 4; // L + A - P
    pub const R_X86_64_32: u32 = 10; // S + A (zero-extend)
    pub const R_X86_64_32S: u32 = 11; // S + A (sign-extend)
    pub const R_X86_64_PC64: u32 = 24; // S + A - P
}

/// AArch64 재배치 타입
pub mod reloc_aarch64 {
    pub const R_AARCH64_NONE: u32 = 0;
    pub const R_AARCH64_ABS64: u32 = 257; // S + A
    pub const R_AARCH64_ABS32: u32 = 258; // S + A
    pub const R_AARCH64_PREL64: u32 = 260; // S + A - P
    pub const R_AARCH64_PREL32: u32 = 261; // S + A - P
    pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275; // Page(S+A) - Page(P)
    pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277; // S + A (하위 12비트)
    pub const R_AARCH64_LDST8_ABS_LO12_NC: u32 = 278;
    pub const R_AARCH64_JUMP26: u32 = 282; // S + A - P (B)
    pub const R_AARCH64_CALL26: u32 = 283; // S + A - P (BL)
    pub const R_AARCH64_LDST16_ABS_LO12_NC: u32 = 284;
    pub const R_AARCH64_LDST32_ABS_LO12_NC: u32 = 285;
    pub const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286; // 8바이트 정렬
}

/// RISC-V 재배치 타입
pub mod reloc_riscv {
    pub const R_RISCV_NONE: u32 = 0;
    pub const R_RISCV_32: u32 = 1; // S + A
    pub const R_RISCV_64: u32 = 2; // S + A
    pub const R_RISCV_BRANCH: u32 = 16; // S + A - P (B-type)
    pub const R_RISCV_JAL: u32 = 17; // S + A - P (J-type)
    pub const R_RISCV_CALL: u32 = 18; // S + A - P (auipc+jalr)
    pub const R_RISCV_CALL_PLT: u32 = 19; // S + A - P (auipc+jalr, PLT)
    pub const R_RISCV_PCREL_HI20: u32 = 23; // S + A - P (상위 20비트)
    pub const R_RISCV_PCREL_LO12_I: u32 = 24; // 짝 auipc의 값 (I-type)
    pub const R_RISCV_PCREL_LO12_S: u32 = 25; // 짝 auipc의 값 (S-type)
    pub const R_RISCV_HI20: u32 = 26; // S + A (상위 20비트)
    pub const R_RISCV_LO12_I: u32 = 27; // S + A (하위 12비트, I-type)
    pub const R_RISCV_LO12_S: u32 = 28; // S + A (하위 12비트, S-type)
    pub const R_RISCV_ALIGN: u32 = 43; // 링커 정렬 힌트
    pub const R_RISCV_RELAX: u32 = 51; // 링커 최적화 힌트
}

/// ELF64 파서 에러
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("image too small")]
    TooSmall,
    #[error("bad ELF magic")]
    InvalidMagic,
    #[error("not a 64-bit object")]
    Not64Bit,
    #[error("not little-endian")]
    UnsupportedEndian,
    #[error("unsupported ELF version")]
    UnsupportedVersion,
    #[error("not a relocatable object (e_type {0})")]
    NotRelocatable(u16),
    #[error("unsupported machine {0}")]
    UnsupportedMachine(u16),
    #[error("bad section header size {0}")]
    BadSectionHeaderSize(u16),
    #[error("section header table out of bounds")]
    SectionTableOutOfBounds,
    #[error("section {index} contents out of bounds")]
    SectionOutOfBounds { index: usize },
    #[error("bad section name string table index")]
    BadStringTableIndex,
    #[error("more than one symbol table")]
    MultipleSymbolTables,
    #[error("malformed symbol table")]
    MalformedSymbolTable,
    #[error("symbol {index} refers to a nonexistent section")]
    BadSymbolSection { index: usize },
    #[error("symbol {index} has an unreadable name")]
    BadSymbolName { index: usize },
    #[error("malformed relocation section {index}")]
    MalformedRelocations { index: usize },
    #[error("REL sections without addends are not supported")]
    RelUnsupported,
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(bytes)
}

impl Elf64Header {
    /// `data`는 최소 HEADER_SIZE 바이트
    fn decode(data: &[u8]) -> Self {
        let mut e_ident = [0; 16];
        e_ident.copy_from_slice(&data[..16]);
        Self {
            e_ident,
            e_type: read_u16(data, 16),
            e_machine: read_u16(data, 18),
            e_version: read_u32(data, 20),
            e_entry: read_u64(data, 24),
            e_phoff: read_u64(data, 32),
            e_shoff: read_u64(data, 40),
            e_flags: read_u32(data, 48),
            e_ehsize: read_u16(data, 52),
            e_phentsize: read_u16(data, 54),
            e_phnum: read_u16(data, 56),
            e_shentsize: read_u16(data, 58),
            e_shnum: read_u16(data, 60),
            e_shstrndx: read_u16(data, 62),
        }
    }
}

impl Elf64SectionHeader {
    fn decode(data: &[u8]) -> Self {
        Self {
            sh_name: read_u32(data, 0),
            sh_type: read_u32(data, 4),
            sh_flags: read_u64(data, 8),
            sh_addr: read_u64(data, 16),
            sh_offset: read_u64(data, 24),
            sh_size: read_u64(data, 32),
            sh_link: read_u32(data, 40),
            sh_info: read_u32(data, 44),
            sh_addralign: read_u64(data, 48),
            sh_entsize: read_u64(data, 56),
        }
    }
}

impl Elf64Symbol {
    fn decode(data: &[u8]) -> Self {
        Self {
            st_name: read_u32(data, 0),
            st_info: data[4],
            st_other: data[5],
            st_shndx: read_u16(data, 6),
            st_value: read_u64(data, 8),
            st_size: read_u64(data, 16),
        }
    }
}

impl Elf64Rela {
    fn decode(data: &[u8]) -> Self {
        Self {
            r_offset: read_u64(data, 0),
            r_info: read_u64(data, 8),
            r_addend: read_u64(data, 16) as i64,
        }
    }
}

/// 파싱된 ELF64 relocatable 오브젝트
pub struct Elf64<'a> {
    /// 원본 이미지
    data: &'a [u8],
    header: Elf64Header,
    machine: ElfMachine,
    sections: Vec<Elf64SectionHeader>,
    symbols: Vec<Elf64Symbol>,
    /// 심볼 이름 문자열 테이블 (심볼 테이블이 없으면 빈 슬라이스)
    strtab: &'a [u8],
    shstrtab: &'a [u8],
}

impl<'a> Elf64<'a> {
    /// ELF64 오브젝트 파싱
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        if data.len() < HEADER_SIZE {
            return Err(ElfError::TooSmall);
        }

        let header = Elf64Header::decode(data);
        if header.e_ident[0..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        if header.e_ident[4] != ELFCLASS64 {
            return Err(ElfError::Not64Bit);
        }
        if header.e_ident[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEndian);
        }
        if header.e_ident[6] != EV_CURRENT || header.e_version != EV_CURRENT as u32 {
            return Err(ElfError::UnsupportedVersion);
        }
        if header.e_type != ET_REL {
            return Err(ElfError::NotRelocatable(header.e_type));
        }
        let machine =
            ElfMachine::from_u16(header.e_machine).ok_or(ElfError::UnsupportedMachine(header.e_machine))?;
        if header.e_shentsize as usize != SECTION_HEADER_SIZE {
            return Err(ElfError::BadSectionHeaderSize(header.e_shentsize));
        }

        // 섹션 헤더 테이블
        let sh_count = header.e_shnum as usize;
        let table = usize::try_from(header.e_shoff)
            .ok()
            .and_then(|start| Some(start..start.checked_add(sh_count * SECTION_HEADER_SIZE)?))
            .and_then(|range| data.get(range))
            .ok_or(ElfError::SectionTableOutOfBounds)?;
        let sections: Vec<Elf64SectionHeader> = table
            .chunks_exact(SECTION_HEADER_SIZE)
            .map(Elf64SectionHeader::decode)
            .collect();

        for (index, sh) in sections.iter().enumerate() {
            if sh.sh_type != section_type::SHT_NULL && !sh.is_nobits() {
                file_range(data, sh).ok_or(ElfError::SectionOutOfBounds { index })?;
            }
        }

        let shstrndx = header.e_shstrndx as usize;
        let shstrtab = match sections.get(shstrndx) {
            Some(sh) if shstrndx != 0 && sh.sh_type == section_type::SHT_STRTAB => section_bytes(data, sh),
            _ => return Err(ElfError::BadStringTableIndex),
        };

        // 심볼 테이블 (최대 1개)
        let mut symtabs = sections
            .iter()
            .enumerate()
            .filter(|(_, sh)| sh.sh_type == section_type::SHT_SYMTAB);
        let symtab = symtabs.next();
        if symtabs.next().is_some() {
            return Err(ElfError::MultipleSymbolTables);
        }

        let (symtab_index, symbols, strtab) = match symtab {
            Some((index, sh)) => {
                if sh.sh_entsize as usize != SYMBOL_SIZE || sh.sh_size as usize % SYMBOL_SIZE != 0 {
                    return Err(ElfError::MalformedSymbolTable);
                }
                let strtab = match sections.get(sh.sh_link as usize) {
                    Some(link) if link.sh_type == section_type::SHT_STRTAB => section_bytes(data, link),
                    _ => return Err(ElfError::MalformedSymbolTable),
                };
                let symbols: Vec<Elf64Symbol> = section_bytes(data, sh)
                    .chunks_exact(SYMBOL_SIZE)
                    .map(Elf64Symbol::decode)
                    .collect();
                (Some(index), symbols, strtab)
            }
            None => (None, Vec::new(), &[][..]),
        };

        for (index, sym) in symbols.iter().enumerate() {
            let shndx = sym.st_shndx;
            let special = matches!(
                shndx,
                section_index::SHN_UNDEF | section_index::SHN_ABS | section_index::SHN_COMMON
            );
            if !special && (shndx >= section_index::SHN_LORESERVE || shndx as usize >= sh_count) {
                return Err(ElfError::BadSymbolSection { index });
            }

            // 0번 이외의 미정의 심볼은 이름으로만 해석되므로 이름이 반드시 있어야 함
            let name = checked_string(strtab, sym.st_name).ok_or(ElfError::BadSymbolName { index })?;
            if index != 0 && shndx == section_index::SHN_UNDEF && name.is_empty() {
                return Err(ElfError::BadSymbolName { index });
            }
        }

        // 재배치 섹션: 대상 섹션과 심볼 테이블이 올바른지 확인
        for (index, sh) in sections.iter().enumerate() {
            if sh.sh_type != section_type::SHT_RELA {
                continue;
            }
            let malformed = ElfError::MalformedRelocations { index };
            if sh.sh_entsize as usize != RELA_SIZE
                || sh.sh_size as usize % RELA_SIZE != 0
                || sh.sh_info == 0
                || sh.sh_info as usize >= sh_count
                || Some(sh.sh_link as usize) != symtab_index
            {
                return Err(malformed);
            }
            let symbol_count = symbols.len();
            let in_range = section_bytes(data, sh)
                .chunks_exact(RELA_SIZE)
                .all(|raw| (Elf64Rela::decode(raw).symbol() as usize) < symbol_count);
            if !in_range {
                return Err(malformed);
            }
        }

        Ok(Self {
            data,
            header,
            machine,
            sections,
            symbols,
            strtab,
            shstrtab,
        })
    }

    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    /// 머신 타입 반환
    pub fn machine(&self) -> ElfMachine {
        self.machine
    }

    /// 섹션 헤더 목록
    pub fn sections(&self) -> &[Elf64SectionHeader] {
        &self.sections
    }

    /// 섹션 이름 조회
    pub fn section_name(&self, sh: &Elf64SectionHeader) -> &'a str {
        string_at(self.shstrtab, sh.sh_name)
    }

    /// 이름으로 섹션 찾기
    pub fn find_section(&self, name: &str) -> Option<&Elf64SectionHeader> {
        self.sections.iter().find(|sh| self.section_name(sh) == name)
    }

    /// 섹션 데이터 반환 (NOBITS는 빈 슬라이스)
    pub fn section_data(&self, sh: &Elf64SectionHeader) -> &'a [u8] {
        if sh.is_nobits() {
            return &[];
        }
        section_bytes(self.data, sh)
    }

    /// 심볼 테이블 (0번 null 심볼 포함)
    pub fn symbols(&self) -> &[Elf64Symbol] {
        &self.symbols
    }

    /// 심볼 이름 문자열 테이블
    pub fn string_table(&self) -> &'a [u8] {
        self.strtab
    }

    /// 심볼 이름 조회
    pub fn symbol_name(&self, sym: &Elf64Symbol) -> &'a str {
        string_at(self.strtab, sym.st_name)
    }

    /// 이름으로 심볼 찾기 (정의된 심볼만)
    pub fn find_symbol(&self, name: &str) -> Option<&Elf64Symbol> {
        self.symbols
            .iter()
            .find(|sym| !sym.is_undefined() && self.symbol_name(sym) == name)
    }

    /// 재배치 섹션들 순회: (대상 섹션 인덱스, RELA 섹션 헤더, 엔트리)
    pub fn relocations(&self) -> impl Iterator<Item = (usize, &Elf64SectionHeader, Vec<Elf64Rela>)> + '_ {
        self.sections
            .iter()
            .filter(|sh| sh.sh_type == section_type::SHT_RELA)
            .map(|sh| {
                let relas = self
                    .section_data(sh)
                    .chunks_exact(RELA_SIZE)
                    .map(Elf64Rela::decode)
                    .collect();
                (sh.sh_info as usize, sh, relas)
            })
    }

    /// addend 없는 REL 섹션이 있는지 (지원하지 않음)
    pub fn has_rel(&self) -> bool {
        self.sections
            .iter()
            .any(|sh| sh.sh_type == section_type::SHT_REL)
    }
}

fn file_range(data: &[u8], sh: &Elf64SectionHeader) -> Option<core::ops::Range<usize>> {
    let start = usize::try_from(sh.sh_offset).ok()?;
    let end = start.checked_add(usize::try_from(sh.sh_size).ok()?)?;
    (end <= data.len()).then_some(start..end)
}

/// 파싱 시 범위를 검증한 섹션의 내용
fn section_bytes<'a>(data: &'a [u8], sh: &Elf64SectionHeader) -> &'a [u8] {
    file_range(data, sh).map_or(&[], |range| &data[range])
}

/// 파싱 시 검증용: 범위 밖, NUL 없음, UTF-8 아님이면 None
fn checked_string(strtab: &[u8], offset: u32) -> Option<&str> {
    if offset == 0 && strtab.is_empty() {
        return Some("");
    }
    let rest = strtab.get(offset as usize..)?;
    let len = rest.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&rest[..len]).ok()
}

/// 문자열 테이블에서 NUL 종료 문자열 조회
pub fn string_at(strtab: &[u8], offset: u32) -> &str {
    let start = offset as usize;
    if start >= strtab.len() {
        return "";
    }

    let end = strtab[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(strtab.len());

    core::str::from_utf8(&strtab[start..end]).unwrap_or("")
}
