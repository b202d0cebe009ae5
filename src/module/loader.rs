//! 커널 모듈 로더
//!
//! ELF64 relocatable object(.o)를 모듈 아레나에 올리고 링크한다.
//!
//! 로드 순서:
//! 1. 파싱 및 검증 (머신 타입, 이름 중복)
//! 2. 섹션 배치: 실행 섹션은 text 윈도우, 나머지는 data 윈도우
//! 3. 심볼 해석: 커널 export 테이블 → 로드된 모듈 (참조 획득)
//! 4. 재배치 적용 (필요하면 PLT 페이지 사용)
//! 5. 레지스트리 등록 후 `module_init` 호출
//!
//! 레지스트리 락은 한 단계씩만 잡고 재배치나 init/exit 호출 동안에는 놓는다.
//! 그래서 `module_init` 안에서 다른 모듈을 로드할 수 있다.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::mem;
use core::slice;

use log::{debug, info, warn};

use super::elf::{section_index::*, symbol_binding, symbol_type, Elf64, ElfError};
use super::registry::{ModuleHandle, ModuleRecord, ModuleState, PlacementKind, Registry, SectionPlacement};
use super::reloc::{self, Fixup, PltTable, RelocContext, RelocError};
use super::symbol::ExportTable;
use crate::config::KmodConfig;
use crate::mm::arena::{ArenaError, ArenaStats, ModuleArena};
use crate::mm::{align_up, PAGE_SIZE};
use crate::sync::RwLock;

/// 모듈 초기화 함수 심볼
const INIT_SYMBOL: &str = "module_init";
/// 모듈 정리 함수 심볼
const EXIT_SYMBOL: &str = "module_exit";

// ============================================================================
// 모듈 에러
// ============================================================================

/// 모듈 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleError {
    #[error("malformed module image: {0}")]
    MalformedImage(#[from] ElfError),
    #[error("section alignment {0:#x} exceeds page size")]
    UnsupportedAlignment(u64),
    #[error("relocation targets zero-stub section {section}")]
    ZeroStubRelocation { section: usize },
    #[error("unresolved symbol '{0}'")]
    UnresolvedSymbol(String),
    #[error("relocation failed: {0}")]
    Relocation(#[from] RelocError),
    #[error("module memory: {0}")]
    Allocation(#[from] ArenaError),
    #[error("module '{0}' is already loaded")]
    DuplicateModuleName(String),
    #[error("module '{name}' is in use (refcount {refcount})")]
    ModuleInUse { name: String, refcount: usize },
    #[error("module '{0}' not found")]
    NotFound(String),
    #[error("module '{0}' is unloading")]
    ModuleUnloading(String),
    #[error("module_init returned {0}")]
    InitFailed(i32),
}

// ============================================================================
// 엔트리 포인트 호출
// ============================================================================

/// 모듈 init/exit 함수 호출 방식
pub trait EntryInvoker: Send + Sync {
    /// # Safety
    /// `addr`는 배치와 재배치가 끝난 모듈의 `extern "C" fn() -> i32`
    unsafe fn call_init(&self, addr: usize) -> i32;

    /// # Safety
    /// `addr`는 배치와 재배치가 끝난 모듈의 `extern "C" fn()`
    unsafe fn call_exit(&self, addr: usize);
}

/// 모듈 코드를 직접 호출
pub struct NativeInvoker;

impl EntryInvoker for NativeInvoker {
    unsafe fn call_init(&self, addr: usize) -> i32 {
        // module_init() -> i32 (인자 없음, 외부 함수는 PLT/재배치로 연결됨)
        type InitFn = extern "C" fn() -> i32;
        let init: InitFn = unsafe { mem::transmute::<usize, InitFn>(addr) };
        init()
    }

    unsafe fn call_exit(&self, addr: usize) {
        type ExitFn = extern "C" fn();
        let exit: ExitFn = unsafe { mem::transmute::<usize, ExitFn>(addr) };
        exit()
    }
}

// ============================================================================
// Zero stub
// ============================================================================

#[repr(C, align(4096))]
struct ZeroPage([u8; PAGE_SIZE]);

/// 작은 읽기 전용 NOBITS 섹션이 공유하는 zero 페이지
static ZERO_STUB: ZeroPage = ZeroPage([0; PAGE_SIZE]);

fn zero_stub_addr() -> usize {
    &raw const ZERO_STUB as usize
}

// ============================================================================
// 조회용 타입
// ============================================================================

/// 모듈 상세 정보 (조회용)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub state: ModuleState,
    pub refcount: usize,
    /// text 윈도우에 배치된 섹션 크기 합
    pub text_size: usize,
    /// data 윈도우에 배치된 섹션 크기 합
    pub data_size: usize,
    pub plt_page: Option<usize>,
    pub exported_symbol_count: usize,
    /// 이 모듈이 참조하는 모듈 이름 (중복 제거)
    pub dependencies: Vec<String>,
}

/// 주소 역추적 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbolized {
    pub module: String,
    /// 주소를 포함하는 심볼 (없으면 섹션 기준)
    pub symbol: Option<String>,
    /// 심볼 또는 섹션 시작으로부터의 오프셋
    pub offset: usize,
}

/// 모듈 참조 가드 (RAII)
/// Drop 시 자동으로 참조 카운트 감소
pub struct ModuleRef<'a> {
    subsystem: &'a ModuleSubsystem,
    handle: ModuleHandle,
    name: String,
}

impl ModuleRef<'_> {
    /// 모듈 이름 반환
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }
}

impl Drop for ModuleRef<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.subsystem.registry.write().release(self.handle) {
            warn!("[module] releasing reference to '{}': {}", self.name, e);
        }
    }
}

// ============================================================================
// 로드 롤백
// ============================================================================

/// 등록 전 로드 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadStage {
    Parsed,
    Placed,
    Resolved,
    Relocated,
}

/// 등록 전 실패 시 아레나 범위와 획득한 모듈 참조를 되돌린다
struct LoadGuard<'a> {
    subsystem: &'a ModuleSubsystem,
    /// 마지막으로 끝난 단계
    stage: LoadStage,
    /// (주소, 크기)
    ranges: Vec<(usize, usize)>,
    dependencies: Vec<ModuleHandle>,
    armed: bool,
}

impl<'a> LoadGuard<'a> {
    fn new(subsystem: &'a ModuleSubsystem) -> Self {
        Self {
            subsystem,
            stage: LoadStage::Parsed,
            ranges: Vec::new(),
            dependencies: Vec::new(),
            armed: true,
        }
    }

    /// 레코드가 자원을 넘겨받음
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(
            "[module] rolling back after {:?}: {} ranges, {} references",
            self.stage,
            self.ranges.len(),
            self.dependencies.len()
        );
        for &(addr, size) in &self.ranges {
            self.subsystem.free_range(addr, size);
        }
        self.subsystem.release_dependencies(&self.dependencies);
    }
}

// ============================================================================
// 모듈 서브시스템
// ============================================================================

/// 모듈 레지스트리 + 로더
///
/// 아레나와 export 테이블을 값으로 받으므로 둘보다 먼저 만들어질 수 없다.
pub struct ModuleSubsystem {
    config: KmodConfig,
    arena: ModuleArena,
    exports: ExportTable,
    registry: RwLock<Registry>,
    invoker: Box<dyn EntryInvoker>,
}

impl ModuleSubsystem {
    pub fn new(config: KmodConfig, arena: ModuleArena, exports: ExportTable, invoker: Box<dyn EntryInvoker>) -> Self {
        info!(
            "[module] subsystem ready: {:?} objects, {} kernel exports",
            config.machine,
            exports.len()
        );
        Self {
            config,
            arena,
            exports,
            registry: RwLock::new(Registry::new()),
            invoker,
        }
    }

    pub fn config(&self) -> &KmodConfig {
        &self.config
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// Relocatable object (.o) 로드
    pub fn load(&self, name: &str, image: &[u8]) -> Result<ModuleHandle, ModuleError> {
        info!("[module] Loading relocatable object: {} ({} bytes)", name, image.len());

        let elf = Elf64::parse(image).inspect_err(|e| warn!("[module] {}: {}", name, e))?;
        if elf.machine() != self.config.machine {
            warn!(
                "[module] {}: built for {:?}, expected {:?}",
                name,
                elf.machine(),
                self.config.machine
            );
            return Err(ElfError::UnsupportedMachine(elf.machine() as u16).into());
        }
        if elf.has_rel() {
            return Err(ElfError::RelUnsupported.into());
        }
        if self.registry.read().find(name).is_some() {
            return Err(ModuleError::DuplicateModuleName(name.to_string()));
        }

        let mut guard = LoadGuard::new(self);

        let placements = self.place_sections(&elf, &mut guard)?;
        guard.stage = LoadStage::Placed;
        let addresses = self.resolve_symbols(&elf, &placements, &mut guard)?;
        guard.stage = LoadStage::Resolved;
        let plt_page = self.apply_relocations(&elf, &placements, &addresses, &mut guard)?;
        guard.stage = LoadStage::Relocated;

        for placement in placements.iter().filter(|p| p.kind == PlacementKind::Text) {
            reloc::flush_icache(placement.addr, placement.size);
        }
        if let Some(page) = plt_page {
            reloc::flush_icache(page, PAGE_SIZE);
        }

        let record = build_record(name, &elf, placements, &addresses, &guard.dependencies, plt_page);
        let init_fn = record.init_fn;

        // 등록과 동시에 로더가 참조 하나를 잡아 init 도중 언로드를 막는다
        let added = {
            let mut registry = self.registry.write();
            registry.add(record).and_then(|handle| registry.acquire(handle).map(|_| handle))
        };
        let handle = added?;
        guard.disarm();
        drop(guard);

        if let Some(init) = init_fn {
            let code = unsafe { self.invoker.call_init(init) };
            if code != 0 {
                warn!("[module] {}: module_init failed ({})", name, code);
                self.abandon(handle);
                return Err(ModuleError::InitFailed(code));
            }
        }

        {
            let mut registry = self.registry.write();
            if let Some(record) = registry.get_mut(handle) {
                record.state = ModuleState::Live;
            }
            if let Err(e) = registry.release(handle) {
                warn!("[module] {}: {}", name, e);
            }
        }

        info!("[module] Module '{}' loaded", name);
        Ok(handle)
    }

    /// 할당 섹션을 아레나에 배치하고 내용을 복사
    fn place_sections(&self, elf: &Elf64, guard: &mut LoadGuard) -> Result<Vec<SectionPlacement>, ModuleError> {
        let mut placements = vec![SectionPlacement::UNPLACED; elf.sections().len()];

        for (index, sh) in elf.sections().iter().enumerate() {
            if !sh.is_alloc() || sh.sh_size == 0 {
                continue;
            }
            if sh.sh_addralign > PAGE_SIZE as u64 {
                warn!(
                    "[module] section {} requires {:#x} alignment",
                    elf.section_name(sh),
                    sh.sh_addralign
                );
                return Err(ModuleError::UnsupportedAlignment(sh.sh_addralign));
            }

            let size = sh.sh_size as usize;
            if sh.is_nobits() && !sh.is_write() && !sh.is_exec() && size <= PAGE_SIZE {
                placements[index] = SectionPlacement {
                    addr: zero_stub_addr(),
                    size,
                    kind: PlacementKind::ZeroStub,
                };
                continue;
            }

            let is_text = sh.is_exec();
            let addr = self.arena.allocate(size, is_text)?;
            guard.ranges.push((addr, size));

            // 아레나가 할당한 페이지 전체: 내용 복사 후 나머지는 0
            let rounded = align_up(size, PAGE_SIZE).unwrap_or(size);
            let dest = unsafe { slice::from_raw_parts_mut(addr as *mut u8, rounded) };
            let data = elf.section_data(sh);
            dest[..data.len()].copy_from_slice(data);
            dest[data.len()..].fill(0);

            debug!(
                "[module] {} -> {:#x} ({} bytes)",
                elf.section_name(sh),
                addr,
                size
            );
            placements[index] = SectionPlacement {
                addr,
                size,
                kind: if is_text { PlacementKind::Text } else { PlacementKind::Data },
            };
        }

        Ok(placements)
    }

    /// 심볼 인덱스별 런타임 주소
    fn resolve_symbols(
        &self,
        elf: &Elf64,
        placements: &[SectionPlacement],
        guard: &mut LoadGuard,
    ) -> Result<Vec<usize>, ModuleError> {
        let mut addresses = Vec::with_capacity(elf.symbols().len());

        for (index, sym) in elf.symbols().iter().enumerate() {
            let name = elf.symbol_name(sym);
            let addr = match sym.st_shndx {
                // 0번 null 심볼. 나머지 미정의 심볼의 이름은 파싱 때 검증됨
                SHN_UNDEF if index == 0 => 0,
                SHN_UNDEF => self.resolve_external(name, sym.binding() == symbol_binding::STB_WEAK, guard)?,
                SHN_ABS => sym.st_value as usize,
                SHN_COMMON => {
                    warn!("[module] COMMON symbol {} (build with -fno-common)", name);
                    return Err(ModuleError::UnresolvedSymbol(name.to_string()));
                }
                shndx => match placements.get(shndx as usize) {
                    Some(p) if p.kind != PlacementKind::Unplaced => p.addr + sym.st_value as usize,
                    _ => 0,
                },
            };
            addresses.push(addr);
        }

        Ok(addresses)
    }

    /// 외부 심볼: 커널 export 테이블 → 등록된 모듈 → weak이면 0
    fn resolve_external(&self, name: &str, weak: bool, guard: &mut LoadGuard) -> Result<usize, ModuleError> {
        if let Some(addr) = self.exports.lookup(name) {
            return Ok(addr);
        }

        {
            let mut registry = self.registry.write();
            if let Some((provider, addr)) = registry.resolve_export(name) {
                registry.acquire(provider)?;
                guard.dependencies.push(provider);
                debug!("[module] {} -> {:#x} (module slot {})", name, addr, provider.index());
                return Ok(addr);
            }
        }

        if weak {
            debug!("[module] weak symbol {} left undefined", name);
            return Ok(0);
        }

        warn!("[module] Unresolved symbol: {}", name);
        Err(ModuleError::UnresolvedSymbol(name.to_string()))
    }

    /// 배치된 섹션의 재배치 적용. PLT 페이지 주소 반환
    fn apply_relocations(
        &self,
        elf: &Elf64,
        placements: &[SectionPlacement],
        addresses: &[usize],
        guard: &mut LoadGuard,
    ) -> Result<Option<usize>, ModuleError> {
        let machine = elf.machine();
        let symbols = elf.symbols();

        // 외부 심볼 호출이 있을 때만 PLT 페이지 할당
        let needs_plt = elf.relocations().any(|(target, _, relas)| {
            placements.get(target).is_some_and(|p| p.owns_arena())
                && relas.iter().any(|rela| {
                    reloc::is_call(machine, rela.rel_type())
                        && symbols.get(rela.symbol() as usize).is_some_and(|s| s.is_undefined())
                })
        });
        let plt = if needs_plt {
            let page = self.arena.allocate(PAGE_SIZE, true)?;
            guard.ranges.push((page, PAGE_SIZE));
            Some(unsafe { PltTable::new(machine, page) })
        } else {
            None
        };

        let mut ctx = RelocContext::new(plt);
        for (target, _, relas) in elf.relocations() {
            let Some(placement) = placements.get(target) else {
                continue;
            };
            match placement.kind {
                PlacementKind::Unplaced => continue,
                // 공유 zero 페이지는 읽기 전용: 가변 뷰를 만들지 않는다
                PlacementKind::ZeroStub if relas.is_empty() => continue,
                PlacementKind::ZeroStub => {
                    return Err(ModuleError::ZeroStubRelocation { section: target });
                }
                PlacementKind::Text | PlacementKind::Data => {}
            }

            let mem = unsafe { slice::from_raw_parts_mut(placement.addr as *mut u8, placement.size) };
            for rela in &relas {
                let offset = rela.r_offset as usize;
                let fixup = Fixup {
                    rtype: rela.rel_type(),
                    offset,
                    place: placement.addr.wrapping_add(offset),
                    symbol: addresses.get(rela.symbol() as usize).copied().unwrap_or(0),
                    addend: rela.r_addend,
                };
                reloc::apply(&mut ctx, machine, mem, &fixup)?;
            }
        }

        let plt = ctx.into_plt();
        if let Some(plt) = &plt {
            debug!("[module] PLT page {:#x}: {} stubs", plt.base(), plt.len());
        }
        Ok(plt.map(|plt| plt.base()))
    }

    /// init 실패한 모듈 정리
    ///
    /// 그 사이 다른 모듈이 참조했다면 `InitFailed`로 남겨 새 바인딩을 막고,
    /// 의존 모듈이 모두 내려간 뒤 `unload`로 지운다.
    fn abandon(&self, handle: ModuleHandle) {
        let removed = {
            let mut registry = self.registry.write();
            if let Err(e) = registry.release(handle) {
                warn!("[module] {}", e);
            }
            let removed = registry.remove(handle);
            if removed.is_err() {
                if let Some(record) = registry.get_mut(handle) {
                    record.state = ModuleState::InitFailed;
                }
            }
            removed
        };

        match removed {
            Ok(record) => self.release_resources(&record),
            Err(ModuleError::ModuleInUse { name, refcount }) => {
                warn!(
                    "[module] '{}' failed init but has {} dependents; left until unloaded",
                    name, refcount
                );
            }
            Err(e) => warn!("[module] {}", e),
        }
    }

    fn free_range(&self, addr: usize, size: usize) {
        if let Err(e) = self.arena.free(addr, size) {
            warn!("[module] {}", e);
        }
    }

    fn release_dependencies(&self, dependencies: &[ModuleHandle]) {
        if dependencies.is_empty() {
            return;
        }
        let mut registry = self.registry.write();
        for &dep in dependencies {
            if let Err(e) = registry.release(dep) {
                warn!("[module] {}", e);
            }
        }
    }

    /// 레지스트리에서 빠진 레코드의 아레나 범위와 의존 참조 반환
    fn release_resources(&self, record: &ModuleRecord) {
        for placement in record.placements.iter().filter(|p| p.owns_arena()) {
            self.free_range(placement.addr, placement.size);
        }
        if let Some(page) = record.plt_page {
            self.free_range(page, PAGE_SIZE);
        }
        self.release_dependencies(&record.dependencies);
    }

    /// 모듈 언로드
    ///
    /// 1. Finalizing 표시 (새 참조 획득 차단)
    /// 2. exit 함수 호출 (init이 성공한 모듈만)
    /// 3. 레지스트리에서 제거, 메모리와 의존 참조 반환
    ///
    /// 참조가 남아 있으면 기다리지 않고 바로 실패한다.
    pub fn unload(&self, name: &str) -> Result<(), ModuleError> {
        let (handle, exit_fn) = {
            let mut registry = self.registry.write();
            let handle = registry
                .find(name)
                .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;
            let record = registry
                .get_mut(handle)
                .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

            if record.state == ModuleState::Finalizing {
                return Err(ModuleError::ModuleUnloading(name.to_string()));
            }
            if record.refcount != 0 {
                return Err(ModuleError::ModuleInUse {
                    name: name.to_string(),
                    refcount: record.refcount,
                });
            }

            let was_live = record.state == ModuleState::Live;
            record.state = ModuleState::Finalizing;
            (handle, record.exit_fn.filter(|_| was_live))
        };

        if let Some(exit) = exit_fn {
            unsafe { self.invoker.call_exit(exit) };
        }

        let removed = self.registry.write().remove(handle);
        let record = removed?;
        self.release_resources(&record);

        info!("[module] Module '{}' unloaded", name);
        Ok(())
    }

    /// 모듈 참조 획득 (RAII 가드 반환)
    ///
    /// 모듈이 존재하고 언로딩 중이 아니면 참조를 획득한다.
    /// ModuleRef가 drop되면 참조 카운트가 감소한다.
    pub fn acquire(&self, name: &str) -> Result<ModuleRef<'_>, ModuleError> {
        let mut registry = self.registry.write();
        let handle = registry
            .find(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;
        registry.acquire(handle)?;

        Ok(ModuleRef {
            subsystem: self,
            handle,
            name: name.to_string(),
        })
    }

    pub fn find(&self, name: &str) -> Option<ModuleHandle> {
        self.registry.read().find(name)
    }

    /// 로드된 모듈 목록
    pub fn list(&self) -> Vec<String> {
        self.registry
            .read()
            .iter()
            .map(|(_, record)| record.name.clone())
            .collect()
    }

    /// 모듈 상세 정보
    pub fn info(&self, name: &str) -> Option<ModuleInfo> {
        let registry = self.registry.read();
        let handle = registry.find(name)?;
        let record = registry.get(handle)?;

        let mut dependencies: Vec<String> = Vec::new();
        for &dep in &record.dependencies {
            if let Some(provider) = registry.get(dep) {
                if !dependencies.contains(&provider.name) {
                    dependencies.push(provider.name.clone());
                }
            }
        }

        Some(ModuleInfo {
            name: record.name.clone(),
            version: record.version.clone(),
            description: record.description.clone(),
            state: record.state,
            refcount: record.refcount,
            text_size: record.placed_size(PlacementKind::Text),
            data_size: record.placed_size(PlacementKind::Data),
            plt_page: record.plt_page,
            exported_symbol_count: record.exports.len(),
            dependencies,
        })
    }

    /// 특정 모듈에서 심볼 검색
    pub fn lookup_symbol_in(&self, module_name: &str, symbol_name: &str) -> Option<usize> {
        let registry = self.registry.read();
        let handle = registry.find(module_name)?;
        registry.get(handle)?.lookup_export(symbol_name)
    }

    /// 모든 모듈에서 심볼 검색 (커널 심볼 포함, 참조는 잡지 않음)
    /// 검색 순서: 커널 → 로드된 모듈들
    pub fn lookup_symbol_global(&self, name: &str) -> Option<usize> {
        self.exports
            .lookup(name)
            .or_else(|| self.registry.read().resolve_export(name).map(|(_, addr)| addr))
    }

    /// 특정 모듈의 export된 심볼 목록
    pub fn list_module_symbols(&self, module_name: &str) -> Vec<(String, usize)> {
        let registry = self.registry.read();
        registry
            .find(module_name)
            .and_then(|handle| registry.get(handle))
            .map(|record| record.exports.clone())
            .unwrap_or_default()
    }

    /// 주소 → (모듈, 심볼, 오프셋)
    pub fn symbolize(&self, addr: usize) -> Option<Symbolized> {
        let registry = self.registry.read();
        registry.iter().find_map(|(_, record)| {
            let section = record.section_containing(addr)?;
            let base = record.placements[section].addr;

            // 같은 섹션에서 addr 이하로 가장 가까운 이름 있는 심볼
            let nearest = record
                .symbols
                .iter()
                .filter(|sym| {
                    sym.st_shndx as usize == section
                        && !matches!(sym.sym_type(), symbol_type::STT_SECTION | symbol_type::STT_FILE)
                        && !record.symbol_name(sym).is_empty()
                })
                .map(|sym| (sym, base + sym.st_value as usize))
                .filter(|&(_, start)| start <= addr)
                .max_by_key(|&(_, start)| start);

            Some(match nearest {
                Some((sym, start)) => Symbolized {
                    module: record.name.clone(),
                    symbol: Some(record.symbol_name(sym).to_string()),
                    offset: addr - start,
                },
                None => Symbolized {
                    module: record.name.clone(),
                    symbol: None,
                    offset: addr - base,
                },
            })
        })
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// 로드된 모듈 목록 출력
    pub fn dump_modules(&self) {
        let registry = self.registry.read();
        info!("[module] {} modules loaded", registry.len());
        for (_, record) in registry.iter() {
            info!(
                "[module]   {:<16} {:?} refs={} text={} data={}",
                record.name,
                record.state,
                record.refcount,
                record.placed_size(PlacementKind::Text),
                record.placed_size(PlacementKind::Data)
            );
        }
        drop(registry);
        self.arena.dump_stats();
    }
}

/// 배치/해석이 끝난 오브젝트로 레지스트리 레코드 생성
fn build_record(
    name: &str,
    elf: &Elf64,
    placements: Vec<SectionPlacement>,
    addresses: &[usize],
    dependencies: &[ModuleHandle],
    plt_page: Option<usize>,
) -> ModuleRecord {
    let mut record = ModuleRecord::new(name);

    let defined = |wanted: &str| {
        elf.symbols()
            .iter()
            .position(|sym| !sym.is_undefined() && elf.symbol_name(sym) == wanted)
            .and_then(|index| addresses.get(index).copied())
            .filter(|&addr| addr != 0)
    };
    record.init_fn = defined(INIT_SYMBOL);
    record.exit_fn = defined(EXIT_SYMBOL);

    record.exports = elf
        .symbols()
        .iter()
        .zip(addresses)
        .filter(|(sym, _)| sym.is_visible() && !sym.is_undefined() && sym.st_shndx != SHN_COMMON)
        .map(|(sym, &addr)| (elf.symbol_name(sym), addr))
        .filter(|&(sym_name, _)| !sym_name.is_empty() && sym_name != INIT_SYMBOL && sym_name != EXIT_SYMBOL)
        .map(|(sym_name, addr)| (sym_name.to_string(), addr))
        .collect();

    // .modinfo: "key=value\0" 나열
    if let Some(modinfo) = elf.find_section(".modinfo") {
        for entry in elf.section_data(modinfo).split(|&b| b == 0) {
            let Ok(entry) = core::str::from_utf8(entry) else {
                continue;
            };
            match entry.split_once('=') {
                Some(("version", value)) => record.version = Some(value.to_string()),
                Some(("description", value)) => record.description = Some(value.to_string()),
                _ => {}
            }
        }
    }

    record.sections = elf.sections().to_vec();
    record.placements = placements;
    record.symbols = elf.symbols().to_vec();
    record.strtab = elf.string_table().to_vec();
    record.dependencies = dependencies.to_vec();
    record.plt_page = plt_page;
    record
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, OnceLock};

    use super::*;
    use crate::mm::arena::WindowConfig;
    use crate::module::elf::{reloc_x86_64::*, section_flags::*, section_type::*, ElfMachine};
    use crate::module::symbol::KernelSymbol;
    use crate::module::testutil::{pages, Page, ObjectBuilder};

    const WINDOW_PAGES: usize = 32;
    const FAKE_KERNEL_PRINT: usize = 0xFFFF_FFFF_8000_1000;

    static KERNEL_EXPORTS: [KernelSymbol; 2] = [
        KernelSymbol::new("kernel_print", FAKE_KERNEL_PRINT as *const ()),
        KernelSymbol::new("shared_name", 0xFFFF_FFFF_8000_2000usize as *const ()),
    ];

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Init(usize),
        Exit(usize),
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// 모듈 코드를 실행하지 않고 해석하는 invoker
    ///
    /// init 코드가 `mov eax, imm32` (b8 imm32)로 시작하면 imm32를 반환값으로 쓴다.
    #[derive(Default)]
    struct ScriptedInvoker {
        calls: Arc<Mutex<Vec<Call>>>,
        hook: Mutex<Option<Hook>>,
    }

    impl EntryInvoker for ScriptedInvoker {
        unsafe fn call_init(&self, addr: usize) -> i32 {
            self.calls.lock().unwrap().push(Call::Init(addr));
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            let code = unsafe { slice::from_raw_parts(addr as *const u8, 5) };
            if code[0] == 0xb8 {
                i32::from_le_bytes(code[1..5].try_into().unwrap())
            } else {
                0
            }
        }

        unsafe fn call_exit(&self, addr: usize) {
            self.calls.lock().unwrap().push(Call::Exit(addr));
        }
    }

    struct Fixture {
        subsystem: ModuleSubsystem,
        calls: Arc<Mutex<Vec<Call>>>,
        _memory: Vec<Page>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_invoker(ScriptedInvoker::default())
        }

        /// text/data 윈도우를 한 버퍼에 붙여 PC 상대 재배치가 닿도록 함
        fn with_invoker(invoker: ScriptedInvoker) -> Self {
            let mut memory = pages(2 * WINDOW_PAGES);
            let base = memory.as_mut_ptr() as usize;
            let config = KmodConfig {
                text: WindowConfig {
                    base,
                    size: WINDOW_PAGES * PAGE_SIZE,
                },
                data: WindowConfig {
                    base: base + WINDOW_PAGES * PAGE_SIZE,
                    size: WINDOW_PAGES * PAGE_SIZE,
                },
                machine: ElfMachine::X86_64,
                ..KmodConfig::default()
            };
            let arena = unsafe { ModuleArena::new(config.text, config.data).unwrap() };
            let calls = invoker.calls.clone();
            let subsystem = ModuleSubsystem::new(config, arena, ExportTable::new(&KERNEL_EXPORTS), Box::new(invoker));
            Self {
                subsystem,
                calls,
                _memory: memory,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn inits(&self) -> usize {
            self.calls().iter().filter(|c| matches!(c, Call::Init(_))).count()
        }

        fn exits(&self) -> usize {
            self.calls().iter().filter(|c| matches!(c, Call::Exit(_))).count()
        }
    }

    /// mov eax, code ; ret
    fn returns(code: i32) -> Vec<u8> {
        let mut bytes = vec![0xb8];
        bytes.extend_from_slice(&code.to_le_bytes());
        bytes.push(0xc3);
        bytes
    }

    /// init(0) + exit(8) + 내보내는 helper(16)
    fn simple_module(init_code: i32) -> Vec<u8> {
        let mut code = returns(init_code);
        code.resize(16, 0x90);
        code.extend_from_slice(&[0x90, 0x90, 0x90, 0xc3]);
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let text = obj.text(&code);
        obj.global_func("module_init", text, 0);
        obj.global_func("module_exit", text, 8);
        obj.global_func("helper", text, 16);
        obj.build()
    }

    /// 두 심볼을 export하는 provider
    fn provider() -> Vec<u8> {
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let text = obj.text(&[0x90, 0x90, 0x90, 0xc3]);
        let data = obj.data(&42u64.to_le_bytes());
        obj.global_func("a_helper", text, 0);
        obj.global_object("a_counter", data, 0, 8);
        obj.modinfo(&[("version", "1.2.0"), ("description", "test provider")]);
        obj.build()
    }

    /// a_helper 호출 + a_counter 참조
    fn consumer() -> Vec<u8> {
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        // call a_helper ; mov rax, [rip + a_counter] ; ret
        let text = obj.text(&[0xe8, 0, 0, 0, 0, 0x48, 0x8b, 0x05, 0, 0, 0, 0, 0xc3]);
        obj.global_func("b_entry", text, 0);
        let helper = obj.undefined("a_helper");
        let counter = obj.undefined("a_counter");
        obj.rela(text, 1, helper, R_X86_64_PLT32, -4);
        obj.rela(text, 8, counter, R_X86_64_PC32, -4);
        obj.build()
    }

    fn read_i32(addr: usize) -> i32 {
        unsafe { (addr as *const i32).read_unaligned() }
    }

    fn read_u64(addr: usize) -> u64 {
        unsafe { (addr as *const u64).read_unaligned() }
    }

    #[test]
    fn load_registers_and_runs_init_once() {
        let fx = Fixture::new();
        let handle = fx.subsystem.load("simple", &simple_module(0)).unwrap();

        assert_eq!(fx.subsystem.list(), ["simple"]);
        assert_eq!(fx.subsystem.find("simple"), Some(handle));
        assert_eq!(fx.inits(), 1);
        assert_eq!(fx.exits(), 0);

        let info = fx.subsystem.info("simple").unwrap();
        assert_eq!(info.state, ModuleState::Live);
        assert_eq!(info.refcount, 0);
        assert_eq!(info.text_size, 20);
        assert_eq!(info.plt_page, None);
        // 훅은 export하지 않음
        assert_eq!(info.exported_symbol_count, 1);

        let helper = fx.subsystem.lookup_symbol_in("simple", "helper").unwrap();
        assert_eq!(fx.calls()[0], Call::Init(helper - 16));
        assert_eq!(fx.subsystem.lookup_symbol_in("simple", "module_init"), None);
    }

    #[test]
    fn unresolved_symbol_leaves_no_trace() {
        let fx = Fixture::new();
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let text = obj.text(&[0xe8, 0, 0, 0, 0, 0xc3]);
        obj.global_func("module_init", text, 0);
        let missing = obj.undefined("missing_symbol");
        obj.rela(text, 1, missing, R_X86_64_PLT32, -4);

        assert_eq!(
            fx.subsystem.load("broken", &obj.build()),
            Err(ModuleError::UnresolvedSymbol(String::from("missing_symbol")))
        );
        assert!(fx.subsystem.list().is_empty());
        assert!(fx.subsystem.find("broken").is_none());
        assert_eq!(fx.inits(), 0);

        let stats = fx.subsystem.arena_stats();
        assert!(stats.text.used > 0);
        assert_eq!(stats.text.released, stats.text.used);
    }

    #[test]
    fn unload_runs_exit_once_and_forgets_module() {
        let fx = Fixture::new();
        fx.subsystem.load("simple", &simple_module(0)).unwrap();
        let init = match fx.calls()[0] {
            Call::Init(addr) => addr,
            other => panic!("unexpected {:?}", other),
        };

        fx.subsystem.unload("simple").unwrap();
        assert_eq!(fx.calls(), [Call::Init(init), Call::Exit(init + 8)]);
        assert!(fx.subsystem.find("simple").is_none());
        assert!(fx.subsystem.info("simple").is_none());
        assert_eq!(
            fx.subsystem.unload("simple"),
            Err(ModuleError::NotFound(String::from("simple")))
        );

        // 아레나는 되감지 않는다
        let used = fx.subsystem.arena_stats().text.used;
        fx.subsystem.load("simple", &simple_module(0)).unwrap();
        let reloaded = fx.subsystem.lookup_symbol_in("simple", "helper").unwrap();
        assert!(reloaded - 16 >= fx.subsystem.config().text.base + used);
    }

    #[test]
    fn cross_module_references_pin_the_provider() {
        let fx = Fixture::new();
        fx.subsystem.load("a", &provider()).unwrap();
        fx.subsystem.load("b", &consumer()).unwrap();

        let a = fx.subsystem.info("a").unwrap();
        assert_eq!(a.refcount, 2);
        assert_eq!(a.version.as_deref(), Some("1.2.0"));
        assert_eq!(a.description.as_deref(), Some("test provider"));
        assert_eq!(fx.subsystem.info("b").unwrap().dependencies, ["a"]);

        // 재배치 결과 확인
        let helper = fx.subsystem.lookup_symbol_in("a", "a_helper").unwrap();
        let counter = fx.subsystem.lookup_symbol_in("a", "a_counter").unwrap();
        let entry = fx.subsystem.lookup_symbol_in("b", "b_entry").unwrap();
        assert_eq!(read_i32(entry + 1) as i64, helper as i64 - 4 - (entry + 1) as i64);
        assert_eq!(read_i32(entry + 8) as i64, counter as i64 - 4 - (entry + 8) as i64);
        assert_eq!(read_u64(counter), 42);

        assert_eq!(
            fx.subsystem.unload("a"),
            Err(ModuleError::ModuleInUse {
                name: String::from("a"),
                refcount: 2
            })
        );
        assert_eq!(fx.subsystem.info("a").unwrap().state, ModuleState::Live);

        fx.subsystem.unload("b").unwrap();
        assert_eq!(fx.subsystem.info("a").unwrap().refcount, 0);
        fx.subsystem.unload("a").unwrap();
        assert!(fx.subsystem.list().is_empty());
    }

    #[test]
    fn far_kernel_calls_go_through_plt() {
        let fx = Fixture::new();
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let text = obj.text(&[0xe8, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0, 0xc3]);
        obj.global_func("entry", text, 0);
        let print = obj.undefined("kernel_print");
        obj.rela(text, 1, print, R_X86_64_PLT32, -4);
        obj.rela(text, 6, print, R_X86_64_PLT32, -4);
        fx.subsystem.load("printer", &obj.build()).unwrap();

        let plt = fx.subsystem.info("printer").unwrap().plt_page.unwrap();
        assert!(plt >= fx.subsystem.config().text.base);
        assert_eq!(read_u64(plt + 6), FAKE_KERNEL_PRINT as u64);

        let entry = fx.subsystem.lookup_symbol_in("printer", "entry").unwrap();
        assert_eq!(read_i32(entry + 1) as i64, plt as i64 - 4 - (entry + 1) as i64);
        assert_eq!(read_i32(entry + 6) as i64, plt as i64 - 4 - (entry + 6) as i64);

        // 커널 심볼은 모듈 참조를 잡지 않음
        assert!(fx.subsystem.info("printer").unwrap().dependencies.is_empty());
        fx.subsystem.unload("printer").unwrap();
    }

    #[test]
    fn weak_undefined_resolves_to_zero_and_common_is_rejected() {
        let fx = Fixture::new();
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let data = obj.data(&[0xff; 16]);
        obj.global_object("slots", data, 0, 16);
        let optional = obj.weak_undefined("optional_hook");
        let present = obj.weak_undefined("kernel_print");
        obj.rela(data, 0, optional, R_X86_64_64, 0x10);
        obj.rela(data, 8, present, R_X86_64_64, 0);
        fx.subsystem.load("weak", &obj.build()).unwrap();

        let slots = fx.subsystem.lookup_symbol_in("weak", "slots").unwrap();
        assert_eq!(read_u64(slots), 0x10);
        assert_eq!(read_u64(slots + 8), FAKE_KERNEL_PRINT as u64);

        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        obj.text(&[0xc3]);
        obj.common("legacy_buffer", 64);
        assert_eq!(
            fx.subsystem.load("common", &obj.build()),
            Err(ModuleError::UnresolvedSymbol(String::from("legacy_buffer")))
        );
    }

    #[test]
    fn small_readonly_nobits_uses_zero_stub() {
        let fx = Fixture::new();
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        obj.text(&[0xc3]);
        let zeros = obj.nobits(".rodata.zero", 0, 8, 64);
        let bss = obj.nobits(".bss", SHF_WRITE, 8, 128);
        obj.global_object("table", zeros, 0, 64);
        obj.global_object("state", bss, 0, 128);
        fx.subsystem.load("zeros", &obj.build()).unwrap();

        let table = fx.subsystem.lookup_symbol_in("zeros", "table").unwrap();
        assert_eq!(table, zero_stub_addr());
        let state = fx.subsystem.lookup_symbol_in("zeros", "state").unwrap();
        let data = fx.subsystem.config().data;
        assert!(state >= data.base && state < data.base + data.size);
        assert!(unsafe { slice::from_raw_parts(state as *const u8, 128) }.iter().all(|&b| b == 0));

        let info = fx.subsystem.info("zeros").unwrap();
        assert_eq!(info.data_size, 128);

        // zero stub 섹션을 고치려는 재배치는 거부
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let text = obj.text(&[0xc3]);
        let zeros = obj.nobits(".rodata.zero", 0, 8, 64);
        let sym = obj.global_func("entry", text, 0);
        obj.rela(zeros, 0, sym, R_X86_64_64, 0);
        let image = obj.build();
        assert_eq!(
            fx.subsystem.load("patched", &image),
            Err(ModuleError::ZeroStubRelocation { section: zeros })
        );

        // 비어 있는 RELA 섹션은 zero stub을 건드리지 않고 통과
        let elf = Elf64::parse(&image).unwrap();
        let rela = elf.sections().iter().position(|sh| sh.sh_type == SHT_RELA).unwrap();
        let size_field = elf.header().e_shoff as usize + rela * 64 + 32;
        let mut empty = image.clone();
        empty[size_field..size_field + 8].copy_from_slice(&0u64.to_le_bytes());
        fx.subsystem.load("empty_rela", &empty).unwrap();
        assert!(fx.subsystem.lookup_symbol_in("empty_rela", "entry").is_some());
        let zeros_page = unsafe { slice::from_raw_parts(zero_stub_addr() as *const u8, PAGE_SIZE) };
        assert!(zeros_page.iter().all(|&b| b == 0));
    }

    #[test]
    fn init_failure_rolls_back() {
        let fx = Fixture::new();
        fx.subsystem.load("a", &provider()).unwrap();

        // init은 -5 반환, 데이터 슬롯이 a_helper를 가리킴
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let text = obj.text(&returns(-5));
        let data = obj.data(&[0; 8]);
        obj.global_func("module_init", text, 0);
        let helper = obj.undefined("a_helper");
        obj.rela(data, 0, helper, R_X86_64_64, 0);

        assert_eq!(fx.subsystem.load("failing", &obj.build()), Err(ModuleError::InitFailed(-5)));
        assert!(fx.subsystem.find("failing").is_none());
        assert_eq!(fx.subsystem.info("a").unwrap().refcount, 0);
        assert_eq!(fx.inits(), 1);
        assert_eq!(fx.exits(), 0);

        // provider의 text 한 페이지만 남음
        let stats = fx.subsystem.arena_stats();
        assert_eq!(stats.text.released, stats.text.used - PAGE_SIZE);
        assert_eq!(stats.data.released, stats.data.used - PAGE_SIZE);
    }

    #[test]
    fn failed_init_with_dependent_is_kept_but_unbindable() {
        let cell: Arc<OnceLock<&'static ModuleSubsystem>> = Arc::new(OnceLock::new());
        let outcome: Arc<Mutex<Option<Result<ModuleHandle, ModuleError>>>> = Arc::default();

        let invoker = ScriptedInvoker::default();
        {
            let cell = cell.clone();
            let outcome = outcome.clone();
            *invoker.hook.lock().unwrap() = Some(Box::new(move || {
                // init 도중 자신을 참조하는 모듈을 로드
                let subsystem = cell.get().unwrap();
                let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
                let data = obj.data(&[0; 8]);
                let helper = obj.undefined("helper");
                obj.rela(data, 0, helper, R_X86_64_64, 0);
                *outcome.lock().unwrap() = Some(subsystem.load("dependent", &obj.build()));
            }));
        }
        let fx: &'static Fixture = Box::leak(Box::new(Fixture::with_invoker(invoker)));
        cell.set(&fx.subsystem).ok().unwrap();

        assert_eq!(fx.subsystem.load("flaky", &simple_module(-1)), Err(ModuleError::InitFailed(-1)));
        assert!(outcome.lock().unwrap().as_ref().unwrap().is_ok());

        let flaky = fx.subsystem.info("flaky").unwrap();
        assert_eq!(flaky.state, ModuleState::InitFailed);
        assert_eq!(flaky.refcount, 1);

        // 실패한 모듈에는 새로 바인딩하거나 참조를 잡을 수 없음
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let data = obj.data(&[0; 8]);
        let helper = obj.undefined("helper");
        obj.rela(data, 0, helper, R_X86_64_64, 0);
        assert_eq!(
            fx.subsystem.load("late", &obj.build()),
            Err(ModuleError::UnresolvedSymbol(String::from("helper")))
        );
        assert_eq!(fx.subsystem.lookup_symbol_global("helper"), None);
        assert_eq!(
            fx.subsystem.acquire("flaky").err(),
            Some(ModuleError::ModuleUnloading(String::from("flaky")))
        );
        assert_eq!(fx.subsystem.info("flaky").unwrap().refcount, 1);
        assert!(fx.subsystem.find("late").is_none());

        fx.subsystem.unload("dependent").unwrap();
        fx.subsystem.unload("flaky").unwrap();
        // init이 완료되지 않았으므로 exit는 호출하지 않음
        assert_eq!(fx.exits(), 0);
        assert!(fx.subsystem.list().is_empty());
    }

    #[test]
    fn load_time_rejections() {
        let fx = Fixture::new();
        fx.subsystem.load("simple", &simple_module(0)).unwrap();
        let used = fx.subsystem.arena_stats().text.used;

        assert_eq!(
            fx.subsystem.load("simple", &simple_module(0)),
            Err(ModuleError::DuplicateModuleName(String::from("simple")))
        );
        assert_eq!(fx.subsystem.arena_stats().text.used, used);

        let mut obj = ObjectBuilder::new(ElfMachine::AArch64);
        obj.text(&[0; 4]);
        assert_eq!(
            fx.subsystem.load("arm", &obj.build()),
            Err(ModuleError::MalformedImage(ElfError::UnsupportedMachine(183)))
        );

        assert_eq!(
            fx.subsystem.load("junk", b"not an elf"),
            Err(ModuleError::MalformedImage(ElfError::TooSmall))
        );

        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        obj.text(&[0xc3]);
        obj.section(".rel.text", SHT_REL, 0, 8, &[0; 16]);
        assert_eq!(
            fx.subsystem.load("rel", &obj.build()),
            Err(ModuleError::MalformedImage(ElfError::RelUnsupported))
        );

        // 이름을 읽을 수 없는 미정의 심볼은 NULL로 링크하지 않음
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        let data = obj.data(&[0xff; 8]);
        obj.global_object("slot", data, 0, 8);
        let target = obj.undefined("remote_table");
        obj.rela(data, 0, target, R_X86_64_64, 0);
        let mut image = obj.build();
        let name_at = image
            .windows(b"remote_table\0".len())
            .position(|w| w == b"remote_table\0")
            .unwrap();
        image[name_at] = 0xff;
        assert_eq!(
            fx.subsystem.load("garbled", &image),
            Err(ModuleError::MalformedImage(ElfError::BadSymbolName { index: target }))
        );
        assert!(fx.subsystem.find("garbled").is_none());

        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        obj.text(&[0xc3]);
        obj.section(".data.huge_align", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, 8192, &[1; 8]);
        assert_eq!(
            fx.subsystem.load("aligned", &obj.build()),
            Err(ModuleError::UnsupportedAlignment(8192))
        );
        let stats = fx.subsystem.arena_stats();
        assert_eq!(stats.text.released, stats.text.used - used);

        assert_eq!(fx.subsystem.list(), ["simple"]);
    }

    #[test]
    fn window_exhaustion_is_an_allocation_error() {
        let fx = Fixture::new();
        let mut obj = ObjectBuilder::new(ElfMachine::X86_64);
        obj.text(&[0xc3]);
        obj.nobits(".bss", SHF_WRITE, 8, ((WINDOW_PAGES + 1) * PAGE_SIZE) as u64);
        assert!(matches!(
            fx.subsystem.load("big", &obj.build()),
            Err(ModuleError::Allocation(ArenaError::Exhausted { .. }))
        ));
        assert_eq!(fx.subsystem.arena_stats().data.used, 0);
    }

    #[test]
    fn module_ref_pins_until_dropped() {
        let fx = Fixture::new();
        fx.subsystem.load("simple", &simple_module(0)).unwrap();

        let guard = fx.subsystem.acquire("simple").unwrap();
        assert_eq!(guard.name(), "simple");
        assert_eq!(Some(guard.handle()), fx.subsystem.find("simple"));
        assert_eq!(fx.subsystem.info("simple").unwrap().refcount, 1);
        assert!(matches!(
            fx.subsystem.unload("simple"),
            Err(ModuleError::ModuleInUse { refcount: 1, .. })
        ));

        drop(guard);
        assert_eq!(fx.subsystem.info("simple").unwrap().refcount, 0);
        fx.subsystem.unload("simple").unwrap();

        assert_eq!(
            fx.subsystem.acquire("simple").err(),
            Some(ModuleError::NotFound(String::from("simple")))
        );
    }

    #[test]
    fn symbol_lookup_and_symbolization() {
        let fx = Fixture::new();
        fx.subsystem.load("a", &provider()).unwrap();

        // 커널 우선
        assert_eq!(fx.subsystem.lookup_symbol_global("kernel_print"), Some(FAKE_KERNEL_PRINT));
        let helper = fx.subsystem.lookup_symbol_global("a_helper").unwrap();
        assert_eq!(fx.subsystem.lookup_symbol_global("nowhere"), None);
        assert_eq!(fx.subsystem.info("a").unwrap().refcount, 0);

        let mut symbols = fx.subsystem.list_module_symbols("a");
        symbols.sort();
        let names: Vec<&str> = symbols.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a_counter", "a_helper"]);
        assert!(fx.subsystem.list_module_symbols("missing").is_empty());

        assert_eq!(
            fx.subsystem.symbolize(helper + 3),
            Some(Symbolized {
                module: String::from("a"),
                symbol: Some(String::from("a_helper")),
                offset: 3,
            })
        );
        let counter = fx.subsystem.lookup_symbol_in("a", "a_counter").unwrap();
        assert_eq!(
            fx.subsystem.symbolize(counter).and_then(|s| s.symbol),
            Some(String::from("a_counter"))
        );
        assert_eq!(fx.subsystem.symbolize(FAKE_KERNEL_PRINT), None);
        fx.subsystem.dump_modules();
    }
}
