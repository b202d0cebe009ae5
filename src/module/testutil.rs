//! 테스트용 ELF64 relocatable 오브젝트 빌더
//!
//! 레이아웃: 헤더, 사용자 섹션 내용, .symtab, .strtab, .rela.*, .shstrtab,
//! 섹션 헤더 테이블. 섹션 인덱스는 0번 null 다음으로 사용자 섹션이
//! 추가 순서대로 온다.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::elf::{section_flags::*, section_index::*, section_type::*, symbol_binding::*, symbol_type::*, ElfMachine};
use crate::mm::PAGE_SIZE;

struct SectionSpec {
    name: String,
    sh_type: u32,
    flags: u64,
    align: u64,
    data: Vec<u8>,
    size: u64,
}

struct SymbolSpec {
    name: String,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

struct RelaSpec {
    target: usize,
    offset: u64,
    symbol: usize,
    rtype: u32,
    addend: i64,
}

/// 페이지 정렬 버퍼 (매핑된 윈도우 대용)
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct Page(pub [u8; PAGE_SIZE]);

pub fn pages(count: usize) -> Vec<Page> {
    vec![Page([0; PAGE_SIZE]); count]
}

pub struct ObjectBuilder {
    machine: ElfMachine,
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
    relas: Vec<RelaSpec>,
}

impl ObjectBuilder {
    pub fn new(machine: ElfMachine) -> Self {
        Self {
            machine,
            sections: Vec::new(),
            symbols: Vec::new(),
            relas: Vec::new(),
        }
    }

    /// 섹션 추가, ELF 섹션 인덱스 반환
    pub fn section(&mut self, name: &str, sh_type: u32, flags: u64, align: u64, data: &[u8]) -> usize {
        self.sections.push(SectionSpec {
            name: name.into(),
            sh_type,
            flags,
            align,
            data: data.to_vec(),
            size: data.len() as u64,
        });
        self.sections.len()
    }

    pub fn nobits(&mut self, name: &str, flags: u64, align: u64, size: u64) -> usize {
        self.sections.push(SectionSpec {
            name: name.into(),
            sh_type: SHT_NOBITS,
            flags: flags | SHF_ALLOC,
            align,
            data: Vec::new(),
            size,
        });
        self.sections.len()
    }

    pub fn text(&mut self, code: &[u8]) -> usize {
        self.section(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, 16, code)
    }

    pub fn data(&mut self, bytes: &[u8]) -> usize {
        self.section(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, 8, bytes)
    }

    pub fn modinfo(&mut self, entries: &[(&str, &str)]) -> usize {
        let mut bytes = Vec::new();
        for (key, value) in entries {
            bytes.extend_from_slice(key.as_bytes());
            bytes.push(b'=');
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
        }
        self.section(".modinfo", SHT_PROGBITS, 0, 1, &bytes)
    }

    /// 심볼 추가, 심볼 인덱스 반환 (0번은 null 심볼)
    pub fn raw_symbol(&mut self, name: &str, bind: u8, stype: u8, shndx: u16, value: u64) -> usize {
        self.symbols.push(SymbolSpec {
            name: name.into(),
            info: (bind << 4) | stype,
            shndx,
            value,
            size: 0,
        });
        self.symbols.len()
    }

    pub fn global_func(&mut self, name: &str, section: usize, value: u64) -> usize {
        self.raw_symbol(name, STB_GLOBAL, STT_FUNC, section as u16, value)
    }

    pub fn global_object(&mut self, name: &str, section: usize, value: u64, size: u64) -> usize {
        let index = self.raw_symbol(name, STB_GLOBAL, STT_OBJECT, section as u16, value);
        self.symbols[index - 1].size = size;
        index
    }

    pub fn undefined(&mut self, name: &str) -> usize {
        self.raw_symbol(name, STB_GLOBAL, STT_NOTYPE, SHN_UNDEF, 0)
    }

    pub fn weak_undefined(&mut self, name: &str) -> usize {
        self.raw_symbol(name, STB_WEAK, STT_NOTYPE, SHN_UNDEF, 0)
    }

    pub fn common(&mut self, name: &str, size: u64) -> usize {
        let index = self.raw_symbol(name, STB_GLOBAL, STT_OBJECT, SHN_COMMON, 8);
        self.symbols[index - 1].size = size;
        index
    }

    pub fn rela(&mut self, target: usize, offset: u64, symbol: usize, rtype: u32, addend: i64) {
        self.relas.push(RelaSpec {
            target,
            offset,
            symbol,
            rtype,
            addend,
        });
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; 64];
        let mut headers: Vec<[u8; 64]> = vec![[0; 64]];
        let mut shstrtab = vec![0u8];

        // 사용자 섹션
        for spec in &self.sections {
            pad_to(&mut out, 16);
            let offset = out.len() as u64;
            out.extend_from_slice(&spec.data);
            let name = name_of(&mut shstrtab, &spec.name);
            headers.push(section_header(name, spec.sh_type, spec.flags, offset, spec.size, 0, 0, spec.align, 0));
        }

        // .strtab (심볼 이름)
        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; 24];
        for sym in &self.symbols {
            let name = if sym.name.is_empty() {
                0
            } else {
                let off = strtab.len() as u32;
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
                off
            };
            symtab.extend_from_slice(&name.to_le_bytes());
            symtab.push(sym.info);
            symtab.push(0);
            symtab.extend_from_slice(&sym.shndx.to_le_bytes());
            symtab.extend_from_slice(&sym.value.to_le_bytes());
            symtab.extend_from_slice(&sym.size.to_le_bytes());
        }

        let symtab_index = headers.len();
        let strtab_index = symtab_index + 1;
        let first_global = self
            .symbols
            .iter()
            .position(|s| s.info >> 4 != STB_LOCAL)
            .map_or(self.symbols.len() + 1, |p| p + 1);

        pad_to(&mut out, 8);
        let offset = out.len() as u64;
        out.extend_from_slice(&symtab);
        let name = name_of(&mut shstrtab, ".symtab");
        headers.push(section_header(
            name,
            SHT_SYMTAB,
            0,
            offset,
            symtab.len() as u64,
            strtab_index as u32,
            first_global as u32,
            8,
            24,
        ));

        let offset = out.len() as u64;
        out.extend_from_slice(&strtab);
        let name = name_of(&mut shstrtab, ".strtab");
        headers.push(section_header(name, SHT_STRTAB, 0, offset, strtab.len() as u64, 0, 0, 1, 0));

        // 대상 섹션별 .rela 섹션
        for (i, spec) in self.sections.iter().enumerate() {
            let target = i + 1;
            let entries: Vec<&RelaSpec> = self.relas.iter().filter(|r| r.target == target).collect();
            if entries.is_empty() {
                continue;
            }
            pad_to(&mut out, 8);
            let offset = out.len() as u64;
            for rela in &entries {
                out.extend_from_slice(&rela.offset.to_le_bytes());
                let info = ((rela.symbol as u64) << 32) | rela.rtype as u64;
                out.extend_from_slice(&info.to_le_bytes());
                out.extend_from_slice(&rela.addend.to_le_bytes());
            }
            let rela_name = alloc::format!(".rela{}", spec.name);
            let name = name_of(&mut shstrtab, &rela_name);
            headers.push(section_header(
                name,
                SHT_RELA,
                0,
                offset,
                (entries.len() * 24) as u64,
                symtab_index as u32,
                target as u32,
                8,
                24,
            ));
        }

        let shstrndx = headers.len();
        let name = name_of(&mut shstrtab, ".shstrtab");
        let offset = out.len() as u64;
        out.extend_from_slice(&shstrtab);
        headers.push(section_header(name, SHT_STRTAB, 0, offset, shstrtab.len() as u64, 0, 0, 1, 0));

        pad_to(&mut out, 8);
        let shoff = out.len() as u64;
        for header in &headers {
            out.extend_from_slice(header);
        }

        // ELF 헤더
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little-endian
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        out[18..20].copy_from_slice(&(self.machine as u16).to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[58..60].copy_from_slice(&64u16.to_le_bytes());
        out[60..62].copy_from_slice(&(headers.len() as u16).to_le_bytes());
        out[62..64].copy_from_slice(&(shstrndx as u16).to_le_bytes());
        out
    }
}

fn name_of(table: &mut Vec<u8>, name: &str) -> u32 {
    let off = table.len() as u32;
    table.extend_from_slice(name.as_bytes());
    table.push(0);
    off
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    while out.len() % align != 0 {
        out.push(0);
    }
}

#[allow(clippy::too_many_arguments)]
fn section_header(
    name: u32,
    sh_type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
) -> [u8; 64] {
    let mut raw = [0u8; 64];
    raw[0..4].copy_from_slice(&name.to_le_bytes());
    raw[4..8].copy_from_slice(&sh_type.to_le_bytes());
    raw[8..16].copy_from_slice(&flags.to_le_bytes());
    raw[24..32].copy_from_slice(&offset.to_le_bytes());
    raw[32..40].copy_from_slice(&size.to_le_bytes());
    raw[40..44].copy_from_slice(&link.to_le_bytes());
    raw[44..48].copy_from_slice(&info.to_le_bytes());
    raw[48..56].copy_from_slice(&align.to_le_bytes());
    raw[56..64].copy_from_slice(&entsize.to_le_bytes());
    raw
}
