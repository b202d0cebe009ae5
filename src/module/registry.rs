//! 모듈 레지스트리
//!
//! 로드된 모듈 레코드를 이름 기준으로 유일하게 보관하는 slot map.
//! `ModuleHandle`은 (슬롯 인덱스, 세대) 쌍이라 슬롯이 재사용되면 이전
//! 핸들은 더 이상 아무것도 가리키지 않는다.

use alloc::string::String;
use alloc::vec::Vec;

use log::warn;

use super::elf::{string_at, Elf64SectionHeader, Elf64Symbol};
use super::loader::ModuleError;

/// 모듈 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// 레지스트리 등록됨, init 진행 중
    Registered,
    /// init 성공, 실행 중
    Live,
    /// init 실패 후 의존 모듈 때문에 남아 있음 (바인딩 불가, 언로드만 가능)
    InitFailed,
    /// 언로드 진행 중 (새 참조 차단)
    Finalizing,
}

/// 섹션이 어디에 배치됐는지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementKind {
    Unplaced,
    Text,
    Data,
    /// 공유 zero 페이지
    ZeroStub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPlacement {
    pub addr: usize,
    pub size: usize,
    pub kind: PlacementKind,
}

impl SectionPlacement {
    pub const UNPLACED: Self = Self {
        addr: 0,
        size: 0,
        kind: PlacementKind::Unplaced,
    };

    /// 아레나 메모리를 차지하는 배치인지
    pub fn owns_arena(&self) -> bool {
        matches!(self.kind, PlacementKind::Text | PlacementKind::Data)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.kind != PlacementKind::Unplaced && addr >= self.addr && addr - self.addr < self.size
    }
}

/// 세대 검사가 붙은 레지스트리 핸들
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    index: u32,
    generation: u32,
}

impl ModuleHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// 로드된 모듈
#[derive(Debug)]
pub struct ModuleRecord {
    pub name: String,
    /// .modinfo `version=`
    pub version: Option<String>,
    /// .modinfo `description=`
    pub description: Option<String>,
    /// 원본 섹션 헤더 테이블
    pub sections: Vec<Elf64SectionHeader>,
    /// 섹션 인덱스별 배치
    pub placements: Vec<SectionPlacement>,
    pub symbols: Vec<Elf64Symbol>,
    pub strtab: Vec<u8>,
    pub init_fn: Option<usize>,
    pub exit_fn: Option<usize>,
    /// 이 모듈을 참조하는 쪽의 수
    pub refcount: usize,
    /// 해석 시 참조를 잡은 제공 모듈 (해석 1건당 1개)
    pub dependencies: Vec<ModuleHandle>,
    /// 다른 모듈이 바인딩할 수 있는 심볼
    pub exports: Vec<(String, usize)>,
    /// PLT 페이지 (text 윈도우)
    pub plt_page: Option<usize>,
    pub state: ModuleState,
}

impl ModuleRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            version: None,
            description: None,
            sections: Vec::new(),
            placements: Vec::new(),
            symbols: Vec::new(),
            strtab: Vec::new(),
            init_fn: None,
            exit_fn: None,
            refcount: 0,
            dependencies: Vec::new(),
            exports: Vec::new(),
            plt_page: None,
            state: ModuleState::Registered,
        }
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn symbol_name(&self, sym: &Elf64Symbol) -> &str {
        string_at(&self.strtab, sym.st_name)
    }

    /// export 심볼 조회
    pub fn lookup_export(&self, name: &str) -> Option<usize> {
        self.exports
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, addr)| addr)
    }

    /// 배치 종류별 총 크기
    pub fn placed_size(&self, kind: PlacementKind) -> usize {
        self.placements
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.size)
            .sum()
    }

    /// 주소가 이 모듈의 배치된 섹션 안에 있으면 그 섹션 인덱스
    pub fn section_containing(&self, addr: usize) -> Option<usize> {
        self.placements
            .iter()
            .position(|p| p.kind != PlacementKind::ZeroStub && p.contains(addr))
    }

    /// 바인딩 가능한 상태인지 (init 실패나 언로드 중이 아닌 등록 모듈)
    pub fn is_bindable(&self) -> bool {
        matches!(self.state, ModuleState::Registered | ModuleState::Live)
    }
}

struct Slot {
    generation: u32,
    record: Option<ModuleRecord>,
}

/// 모듈 레지스트리
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl Registry {
    /// 빈 레지스트리
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// 모듈 등록. 같은 이름이 이미 있으면 실패
    pub fn add(&mut self, record: ModuleRecord) -> Result<ModuleHandle, ModuleError> {
        if self.find(&record.name).is_some() {
            return Err(ModuleError::DuplicateModuleName(record.name));
        }

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].record = Some(record);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.len += 1;

        Ok(ModuleHandle {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    pub fn find(&self, name: &str) -> Option<ModuleHandle> {
        self.iter()
            .find(|(_, record)| record.name == name)
            .map(|(handle, _)| handle)
    }

    pub fn get(&self, handle: ModuleHandle) -> Option<&ModuleRecord> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub fn get_mut(&mut self, handle: ModuleHandle) -> Option<&mut ModuleRecord> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// 모듈 제거. 참조가 남아 있으면 레코드는 그대로 둔다
    pub fn remove(&mut self, handle: ModuleHandle) -> Result<ModuleRecord, ModuleError> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation && slot.record.is_some())
            .ok_or_else(|| ModuleError::NotFound(String::from("<stale handle>")))?;

        if let Some(record) = slot.record.as_ref().filter(|r| r.refcount != 0) {
            return Err(ModuleError::ModuleInUse {
                name: record.name.clone(),
                refcount: record.refcount,
            });
        }

        let record = slot
            .record
            .take()
            .ok_or_else(|| ModuleError::NotFound(String::from("<stale handle>")))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(record)
    }

    /// 참조 획득 (refcount + 1). 언로드 대기 또는 진행 중인 모듈은 거부
    pub fn acquire(&mut self, handle: ModuleHandle) -> Result<usize, ModuleError> {
        let record = self
            .get_mut(handle)
            .ok_or_else(|| ModuleError::NotFound(String::from("<stale handle>")))?;
        if matches!(record.state, ModuleState::InitFailed | ModuleState::Finalizing) {
            return Err(ModuleError::ModuleUnloading(record.name.clone()));
        }
        record.refcount += 1;
        Ok(record.refcount)
    }

    /// 참조 해제 (refcount - 1)
    pub fn release(&mut self, handle: ModuleHandle) -> Result<usize, ModuleError> {
        let record = self
            .get_mut(handle)
            .ok_or_else(|| ModuleError::NotFound(String::from("<stale handle>")))?;
        if record.refcount == 0 {
            warn!("[module] {}: release with zero refcount", record.name);
            return Ok(0);
        }
        record.refcount -= 1;
        Ok(record.refcount)
    }

    /// 심볼을 export하는 첫 번째 바인딩 가능 모듈
    pub fn resolve_export(&self, name: &str) -> Option<(ModuleHandle, usize)> {
        self.iter()
            .filter(|(_, record)| record.is_bindable())
            .find_map(|(handle, record)| record.lookup_export(name).map(|addr| (handle, addr)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleHandle, &ModuleRecord)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (
                    ModuleHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    record,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
