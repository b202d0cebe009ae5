//! 모듈용 커널 서비스
//!
//! 모듈은 extern "C" 함수만 호출 가능하므로 커널 API를 C-compatible
//! 함수로 감싸 export 테이블에 올린다.

use core::alloc::Layout;
use core::ptr::{self, NonNull};

use log::{error, info, warn};

use crate::mm::heap::KERNEL_HEAP;

/// kmalloc 반환 포인터 정렬
const KMALLOC_ALIGN: usize = 16;

/// 모듈 메시지 출력 (info 레벨 로그)
#[unsafe(no_mangle)]
pub extern "C" fn kernel_print(s: *const u8, len: usize) {
    if s.is_null() || len == 0 {
        return;
    }
    let bytes = unsafe { core::slice::from_raw_parts(s, len) };
    match core::str::from_utf8(bytes) {
        Ok(msg) => info!("[kmod] {}", msg.trim_end_matches('\n')),
        Err(_) => warn!("[kmod] kernel_print: {} bytes of invalid UTF-8", len),
    }
}

/// 힙 메모리 할당
/// 반환: 16바이트 정렬 포인터 (힙이 없거나 부족하면 null)
#[unsafe(no_mangle)]
pub extern "C" fn kmalloc(size: usize) -> *mut u8 {
    let Ok(layout) = Layout::from_size_align(size.max(1), KMALLOC_ALIGN) else {
        return ptr::null_mut();
    };
    KERNEL_HEAP
        .allocate(layout)
        .map_or(ptr::null_mut(), |p| p.as_ptr())
}

/// 힙 메모리 해제 (null은 무시)
#[unsafe(no_mangle)]
pub extern "C" fn kfree(ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };
    if let Err(e) = unsafe { KERNEL_HEAP.free(ptr) } {
        error!("[kmod] kfree({:p}): {}", ptr, e);
        panic!("heap corruption fault: {}", e);
    }
}

#[cfg(target_os = "none")]
crate::kexport!(kernel_print);
#[cfg(target_os = "none")]
crate::kexport!(kmalloc);
#[cfg(target_os = "none")]
crate::kexport!(kfree);
