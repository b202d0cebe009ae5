//! Heap Allocator
//!
//! 커널 힙: 고정 크기 클래스(slab) + 페이지 단위 large 경로
//!
//! - 16 ~ 2048 바이트, 정렬 16 이하 요청은 8개 크기 클래스의 free list에서 처리
//! - 그 외 요청은 linked_list_allocator 위의 페이지 단위 할당
//! - 모든 블록 앞에 16바이트 헤더(magic, class, link)를 둔다
//!
//! 해제된 블록은 다른 magic으로 다시 태깅되므로
//! 같은 포인터를 두 번 해제하면 free list를 망가뜨리기 전에 감지된다.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use log::{error, info};

use super::{align_up, PAGE_SIZE};
use crate::sync::IrqSpinlock;

/// 크기 클래스 (바이트)
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// slab 객체 정렬 = 헤더 크기
const SLAB_ALIGN: usize = 16;

/// 클래스 리필 시 최소 객체 수
const SLAB_MIN_OBJECTS: usize = 8;

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// large 블록 payload의 최소 오프셋.
/// 해제 후 linked_list_allocator가 블록 시작에 hole 노드(16바이트)를 쓰므로
/// 헤더는 그 뒤에 위치해야 FREE 태그가 남는다.
const LARGE_MIN_OFFSET: usize = 2 * HEADER_SIZE;

const MAGIC_SLAB_USED: u32 = 0x51AB_0A11;
const MAGIC_SLAB_FREE: u32 = 0x51AB_F4EE;
const MAGIC_LARGE_USED: u32 = 0x1A26_0A11;
const MAGIC_LARGE_FREE: u32 = 0x1A26_F4EE;

/// 모든 할당 앞에 붙는 헤더
///
/// - slab: class = 크기 클래스 인덱스, link = 다음 free 블록
/// - large: class = 할당 시작점에서 payload까지 오프셋, link = 할당 전체 크기
#[repr(C, align(16))]
struct BlockHeader {
    magic: u32,
    class: u32,
    link: usize,
}

/// 헤더 magic이 나타내는 블록 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    SlabInUse,
    SlabFree,
    LargeInUse,
    LargeFree,
    Invalid,
}

impl BlockState {
    fn from_magic(magic: u32) -> Self {
        match magic {
            MAGIC_SLAB_USED => BlockState::SlabInUse,
            MAGIC_SLAB_FREE => BlockState::SlabFree,
            MAGIC_LARGE_USED => BlockState::LargeInUse,
            MAGIC_LARGE_FREE => BlockState::LargeFree,
            _ => BlockState::Invalid,
        }
    }
}

/// 힙 에러
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("heap not initialized")]
    NotInitialized,
    #[error("heap already initialized")]
    AlreadyInitialized,
    #[error("invalid heap region {start:#x} (+{size:#x})")]
    InvalidRegion { start: usize, size: usize },
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },
    #[error("bad block magic {magic:#x} at {addr:#x}")]
    BadMagic { addr: usize, magic: u32 },
    #[error("pointer {addr:#x} was not allocated by this heap")]
    ForeignPointer { addr: usize },
}

impl HeapError {
    /// 메모리 손상을 뜻하는 에러인지 (복구 불가)
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HeapError::DoubleFree { .. } | HeapError::BadMagic { .. } | HeapError::ForeignPointer { .. }
        )
    }
}

#[derive(Clone, Copy)]
struct SlabClass {
    free: *mut BlockHeader,
    total: usize,
    in_use: usize,
}

impl SlabClass {
    const EMPTY: Self = Self {
        free: ptr::null_mut(),
        total: 0,
        in_use: 0,
    };
}

/// 크기 클래스별 통계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub object_size: usize,
    pub total: usize,
    pub in_use: usize,
}

/// 힙 사용량 정보
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub start: usize,
    pub size: usize,
    /// large 경로 기준 사용량 (slab 청크 포함)
    pub used: usize,
    pub free: usize,
    pub large_allocations: usize,
    pub classes: [ClassStats; SIZE_CLASSES.len()],
}

impl HeapStats {
    pub fn dump(&self) {
        info!(
            "[heap] Stats: total={} KB, used={} KB, free={} KB, large={}",
            self.size / 1024,
            self.used / 1024,
            self.free / 1024,
            self.large_allocations
        );
        for class in self.classes.iter().filter(|c| c.total > 0) {
            info!(
                "[heap]   {:>4}B: {}/{} in use",
                class.object_size, class.in_use, class.total
            );
        }
    }
}

/// slab 힙 (락 없음, KernelHeap이 감싼다)
pub struct SlabHeap {
    large: Heap,
    classes: [SlabClass; SIZE_CLASSES.len()],
    start: usize,
    end: usize,
    large_allocations: usize,
    initialized: bool,
}

// free list 포인터는 관리 영역 내부만 가리키며 락 아래에서만 접근
unsafe impl Send for SlabHeap {}

impl SlabHeap {
    pub const fn new() -> Self {
        Self {
            large: Heap::empty(),
            classes: [SlabClass::EMPTY; SIZE_CLASSES.len()],
            start: 0,
            end: 0,
            large_allocations: 0,
            initialized: false,
        }
    }

    /// 힙 초기화
    ///
    /// # Safety
    /// `[start, start + size)`는 매핑된 쓰기 가능 영역이고 이 힙이 독점해야 함
    pub unsafe fn init(&mut self, start: usize, size: usize) -> Result<(), HeapError> {
        if self.initialized {
            return Err(HeapError::AlreadyInitialized);
        }
        if size < PAGE_SIZE || start % SLAB_ALIGN != 0 || start.checked_add(size).is_none() {
            return Err(HeapError::InvalidRegion { start, size });
        }

        unsafe { self.large.init(start as *mut u8, size) };

        self.start = start;
        self.end = start + size;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// 메모리 할당
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if !self.initialized {
            return Err(HeapError::NotInitialized);
        }

        if layout.align() <= SLAB_ALIGN {
            if let Some(idx) = class_index(layout.size()) {
                return self.alloc_slab(idx);
            }
        }
        self.alloc_large(layout)
    }

    /// 메모리 해제
    ///
    /// 헤더 태그가 사용 중 상태가 아니면 손상으로 보고 아무것도 바꾸지 않는다.
    ///
    /// # Safety
    /// 해제 후 `ptr`이 가리키는 메모리를 사용하면 안 됨
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        if !self.initialized {
            return Err(HeapError::NotInitialized);
        }

        let addr = ptr.as_ptr() as usize;
        if addr < self.start + HEADER_SIZE || addr >= self.end || addr % SLAB_ALIGN != 0 {
            return Err(HeapError::ForeignPointer { addr });
        }

        let header = (addr - HEADER_SIZE) as *mut BlockHeader;
        let (magic, class, link) = unsafe { ((*header).magic, (*header).class, (*header).link) };

        match BlockState::from_magic(magic) {
            BlockState::SlabInUse => {
                let idx = class as usize;
                if idx >= SIZE_CLASSES.len() {
                    return Err(HeapError::BadMagic { addr, magic });
                }
                let slab = &mut self.classes[idx];
                unsafe {
                    (*header).magic = MAGIC_SLAB_FREE;
                    (*header).link = slab.free as usize;
                }
                slab.free = header;
                slab.in_use -= 1;
                Ok(())
            }
            BlockState::LargeInUse => {
                let offset = class as usize;
                let total = link;
                let base = addr.wrapping_sub(offset);
                if offset < LARGE_MIN_OFFSET
                    || total % PAGE_SIZE != 0
                    || base < self.start
                    || base.checked_add(total).is_none_or(|end| end > self.end)
                {
                    return Err(HeapError::BadMagic { addr, magic });
                }
                unsafe {
                    (*header).magic = MAGIC_LARGE_FREE;
                    let layout = Layout::from_size_align_unchecked(total, PAGE_SIZE);
                    self.large.deallocate(NonNull::new_unchecked(base as *mut u8), layout);
                }
                self.large_allocations -= 1;
                Ok(())
            }
            BlockState::SlabFree | BlockState::LargeFree => Err(HeapError::DoubleFree { addr }),
            BlockState::Invalid => Err(HeapError::BadMagic { addr, magic }),
        }
    }

    fn alloc_slab(&mut self, idx: usize) -> Result<NonNull<u8>, HeapError> {
        if self.classes[idx].free.is_null() {
            self.refill(idx)?;
        }

        let block = self.classes[idx].free;
        let magic = unsafe { (*block).magic };
        if BlockState::from_magic(magic) != BlockState::SlabFree {
            return Err(HeapError::BadMagic {
                addr: block as usize + HEADER_SIZE,
                magic,
            });
        }

        let slab = &mut self.classes[idx];
        unsafe {
            slab.free = (*block).link as *mut BlockHeader;
            (*block).magic = MAGIC_SLAB_USED;
            (*block).link = 0;
        }
        slab.in_use += 1;

        Ok(unsafe { NonNull::new_unchecked((block as *mut u8).add(HEADER_SIZE)) })
    }

    /// 빈 클래스에 large 경로에서 청크를 받아 블록으로 분할
    fn refill(&mut self, idx: usize) -> Result<(), HeapError> {
        let stride = HEADER_SIZE + SIZE_CLASSES[idx];
        let chunk = align_up(stride * SLAB_MIN_OBJECTS, PAGE_SIZE).ok_or(HeapError::OutOfMemory)?;
        let layout = Layout::from_size_align(chunk, PAGE_SIZE).map_err(|_| HeapError::OutOfMemory)?;
        let base = self
            .large
            .allocate_first_fit(layout)
            .map_err(|_| HeapError::OutOfMemory)?
            .as_ptr() as usize;

        let count = chunk / stride;
        let slab = &mut self.classes[idx];
        // 역순으로 넣어 낮은 주소부터 나가도록
        for i in (0..count).rev() {
            let block = (base + i * stride) as *mut BlockHeader;
            unsafe {
                block.write(BlockHeader {
                    magic: MAGIC_SLAB_FREE,
                    class: idx as u32,
                    link: slab.free as usize,
                });
            }
            slab.free = block;
        }
        slab.total += count;
        Ok(())
    }

    fn alloc_large(&mut self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        let align = layout.align().max(SLAB_ALIGN);
        let offset = align.max(LARGE_MIN_OFFSET);
        if offset > u32::MAX as usize {
            return Err(HeapError::OutOfMemory);
        }
        let total = offset
            .checked_add(layout.size())
            .and_then(|n| align_up(n, PAGE_SIZE))
            .ok_or(HeapError::OutOfMemory)?;
        let backing = Layout::from_size_align(total, align.max(PAGE_SIZE)).map_err(|_| HeapError::OutOfMemory)?;

        let base = self
            .large
            .allocate_first_fit(backing)
            .map_err(|_| HeapError::OutOfMemory)?
            .as_ptr() as usize;

        let payload = base + offset;
        unsafe {
            ((payload - HEADER_SIZE) as *mut BlockHeader).write(BlockHeader {
                magic: MAGIC_LARGE_USED,
                class: offset as u32,
                link: total,
            });
        }
        self.large_allocations += 1;

        Ok(unsafe { NonNull::new_unchecked(payload as *mut u8) })
    }

    pub fn stats(&self) -> HeapStats {
        let mut classes = [ClassStats {
            object_size: 0,
            total: 0,
            in_use: 0,
        }; SIZE_CLASSES.len()];
        for (i, stat) in classes.iter_mut().enumerate() {
            stat.object_size = SIZE_CLASSES[i];
            stat.total = self.classes[i].total;
            stat.in_use = self.classes[i].in_use;
        }

        HeapStats {
            start: self.start,
            size: self.end - self.start,
            used: if self.initialized { self.large.used() } else { 0 },
            free: if self.initialized { self.large.free() } else { 0 },
            large_allocations: self.large_allocations,
            classes,
        }
    }
}

impl Default for SlabHeap {
    fn default() -> Self {
        Self::new()
    }
}

fn class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| size <= class)
}

/// 인터럽트 안전 커널 힙
///
/// 인터럽트 핸들러에서도 할당이 일어날 수 있으므로 IrqSpinlock으로 보호한다.
pub struct KernelHeap {
    inner: IrqSpinlock<SlabHeap>,
}

impl KernelHeap {
    pub const fn empty() -> Self {
        Self {
            inner: IrqSpinlock::new(SlabHeap::new()),
        }
    }

    /// 힙 초기화 (부팅 시 1회, 모듈 로드 이전)
    ///
    /// # Safety
    /// `[start, start + size)`는 매핑된 쓰기 가능 영역이고 이 힙이 독점해야 함
    pub unsafe fn init(&self, start: usize, size: usize) -> Result<(), HeapError> {
        unsafe { self.inner.lock().init(start, size)? };

        info!(
            "[heap] Initialized: {:#x} - {:#x} ({} KB)",
            start,
            start + size,
            size / 1024
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_initialized()
    }

    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        self.inner.lock().allocate(layout)
    }

    /// # Safety
    /// 해제 후 `ptr`이 가리키는 메모리를 사용하면 안 됨
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        unsafe { self.inner.lock().free(ptr) }
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    /// 힙 통계 출력
    pub fn dump_stats(&self) {
        if self.is_initialized() {
            self.stats().dump();
        } else {
            info!("[heap] Not initialized");
        }
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout).map_or(ptr::null_mut(), |p| p.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let result = unsafe { self.free(ptr) };
        if let Err(e) = result {
            // 손상된 힙으로 계속 진행하면 조용한 메모리 오염으로 이어짐
            error!("[heap] Corruption fault: {}", e);
            panic!("heap corruption fault: {}", e);
        }
    }
}

/// 전역 커널 힙 (커널 빌드에서 global allocator)
#[cfg_attr(all(target_os = "none", not(test)), global_allocator)]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::empty();
