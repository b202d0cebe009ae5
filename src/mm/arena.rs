//! Module Arena
//!
//! 모듈 코드/데이터용 고정 가상 주소 윈도우 두 개 위의 bump 할당자
//!
//! - text 윈도우: 실행 가능 섹션 (+ PLT 페이지)
//! - data 윈도우: 그 외 할당 섹션 (.data, .rodata, .bss)
//!
//! 할당은 페이지 단위로 올림되고 커서만 전진한다. 해제는 범위를 검증하고
//! 반환량만 기록하며 공간을 재사용하지 않는다. 언로드된 모듈의 주소가 다시
//! 나타나지 않으므로 stale 포인터가 새 모듈 코드를 가리키는 일이 없다.

use alloc::vec::Vec;
use core::fmt;

use log::{info, warn};

use super::{align_up, PAGE_SIZE};
use crate::sync::Spinlock;

/// 윈도우 위치/크기 (외부 VMM이 미리 매핑해 둔 범위)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub base: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Text,
    Data,
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Text => f.write_str("text"),
            WindowKind::Data => f.write_str("data"),
        }
    }
}

/// 아레나 에러
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("invalid {window} window {base:#x} (+{size:#x})")]
    InvalidWindow {
        window: WindowKind,
        base: usize,
        size: usize,
    },
    #[error("text and data windows overlap")]
    OverlappingWindows,
    #[error("{window} window exhausted: requested {requested:#x}, remaining {remaining:#x}")]
    Exhausted {
        window: WindowKind,
        requested: usize,
        remaining: usize,
    },
    #[error("range {addr:#x} (+{size:#x}) is not owned by the module arena")]
    NotOwned { addr: usize, size: usize },
    #[error("range {addr:#x} (+{size:#x}) was already released")]
    AlreadyReleased { addr: usize, size: usize },
}

/// 윈도우별 사용량
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub base: usize,
    pub size: usize,
    pub used: usize,
    pub released: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub text: WindowStats,
    pub data: WindowStats,
}

struct Window {
    base: usize,
    size: usize,
    /// 0 <= cursor <= size
    cursor: usize,
    released: usize,
    /// 반환된 (시작, 페이지 올림 크기) 범위. 중복 반환 검사용
    released_ranges: Vec<(usize, usize)>,
}

impl Window {
    fn new(config: WindowConfig) -> Self {
        Self {
            base: config.base,
            size: config.size,
            cursor: 0,
            released: 0,
            released_ranges: Vec::new(),
        }
    }

    fn end(&self) -> usize {
        self.base + self.size
    }

    fn is_released(&self, addr: usize, size: usize) -> bool {
        self.released_ranges
            .iter()
            .any(|&(start, len)| addr < start + len && start < addr + size)
    }

    fn stats(&self) -> WindowStats {
        WindowStats {
            base: self.base,
            size: self.size,
            used: self.cursor,
            released: self.released,
            remaining: self.size - self.cursor,
        }
    }
}

/// 모듈 아레나
pub struct ModuleArena {
    text: Spinlock<Window>,
    data: Spinlock<Window>,
}

impl ModuleArena {
    /// 두 윈도우로 아레나 생성
    ///
    /// # Safety
    /// 두 윈도우 모두 매핑된 쓰기 가능 메모리여야 하고 (text는 실행 가능),
    /// 아레나가 살아있는 동안 다른 용도로 쓰이면 안 됨
    pub unsafe fn new(text: WindowConfig, data: WindowConfig) -> Result<Self, ArenaError> {
        validate(WindowKind::Text, text)?;
        validate(WindowKind::Data, data)?;
        if text.base < data.base + data.size && data.base < text.base + text.size {
            return Err(ArenaError::OverlappingWindows);
        }

        info!(
            "[arena] text {:#x} - {:#x}, data {:#x} - {:#x}",
            text.base,
            text.base + text.size,
            data.base,
            data.base + data.size
        );

        Ok(Self {
            text: Spinlock::new(Window::new(text)),
            data: Spinlock::new(Window::new(data)),
        })
    }

    fn window(&self, kind: WindowKind) -> &Spinlock<Window> {
        match kind {
            WindowKind::Text => &self.text,
            WindowKind::Data => &self.data,
        }
    }

    /// `size`를 페이지 단위로 올림해 할당. 반환 주소는 페이지 정렬
    ///
    /// 크기 0 요청도 한 페이지를 받는다.
    pub fn allocate(&self, size: usize, is_text: bool) -> Result<usize, ArenaError> {
        let kind = if is_text { WindowKind::Text } else { WindowKind::Data };
        let mut window = self.window(kind).lock();
        let remaining = window.size - window.cursor;

        let rounded = align_up(size.max(1), PAGE_SIZE).filter(|&n| n <= remaining);
        let Some(rounded) = rounded else {
            warn!(
                "[arena] {} window exhausted: requested {:#x}, remaining {:#x}",
                kind, size, remaining
            );
            return Err(ArenaError::Exhausted {
                window: kind,
                requested: size,
                remaining,
            });
        };

        let addr = window.base + window.cursor;
        window.cursor += rounded;
        Ok(addr)
    }

    /// 이전에 할당한 범위를 반환
    ///
    /// 범위가 이미 나간 영역 안에 있고 아직 반환되지 않았는지 확인한다.
    /// 커서는 그대로 둔다.
    pub fn free(&self, addr: usize, size: usize) -> Result<(), ArenaError> {
        let not_owned = ArenaError::NotOwned { addr, size };
        let kind = self.window_of(addr).ok_or(not_owned)?;
        let rounded = align_up(size.max(1), PAGE_SIZE).ok_or(not_owned)?;

        let mut window = self.window(kind).lock();
        let handed_out_end = window.base + window.cursor;
        if addr % PAGE_SIZE != 0 || addr.checked_add(rounded).is_none_or(|end| end > handed_out_end) {
            return Err(not_owned);
        }
        if window.is_released(addr, rounded) {
            warn!("[arena] {} range {:#x} (+{:#x}) released twice", kind, addr, size);
            return Err(ArenaError::AlreadyReleased { addr, size });
        }
        window.released_ranges.push((addr, rounded));
        window.released += rounded;
        Ok(())
    }

    /// 주소가 어느 윈도우에든 속하는지
    pub fn contains(&self, addr: usize) -> bool {
        self.window_of(addr).is_some()
    }

    pub fn window_of(&self, addr: usize) -> Option<WindowKind> {
        [WindowKind::Text, WindowKind::Data].into_iter().find(|&kind| {
            let window = self.window(kind).lock();
            addr >= window.base && addr < window.end()
        })
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            text: self.text.lock().stats(),
            data: self.data.lock().stats(),
        }
    }

    pub fn dump_stats(&self) {
        let stats = self.stats();
        for (kind, window) in [(WindowKind::Text, stats.text), (WindowKind::Data, stats.data)] {
            info!(
                "[arena] {}: used {} KB, released {} KB, remaining {} KB",
                kind,
                window.used / 1024,
                window.released / 1024,
                window.remaining / 1024
            );
        }
    }
}

fn validate(kind: WindowKind, config: WindowConfig) -> Result<(), ArenaError> {
    let invalid = ArenaError::InvalidWindow {
        window: kind,
        base: config.base,
        size: config.size,
    };
    if config.size == 0 || config.base % PAGE_SIZE != 0 || config.size % PAGE_SIZE != 0 {
        return Err(invalid);
    }
    config.base.checked_add(config.size).ok_or(invalid)?;
    Ok(())
}
