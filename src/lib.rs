//! kmodcore: 커널 로더블 모듈 서브시스템
//!
//! relocatable ELF64 오브젝트를 예약된 두 가상 주소 윈도우에 올리고, 미정의
//! 심볼을 커널 export 테이블과 이미 로드된 모듈에 연결한 뒤
//! init → 실행 → exit → 언로드 순서로 관리한다.
//!
//! 초기화 순서:
//!
//! ```ignore
//! // 1. 힙 (VMM이 매핑한 영역)
//! unsafe { KERNEL_HEAP.init(heap_start, heap_size)? };
//! // 2. 로거
//! static LOGGER: KernelLogger = KernelLogger::new(Some(&SERIAL), Some(timer_us));
//! klog::init(&LOGGER, config.log_level)?;
//! // 3. 아레나 (두 윈도우가 이미 매핑되어 있어야 함)
//! let arena = unsafe { ModuleArena::new(config.text, config.data)? };
//! // 4. export 테이블 → 5. 모듈 서브시스템
//! let modules = ModuleSubsystem::new(config, arena, ExportTable::linked(), Box::new(NativeInvoker));
//! modules.load("hello", initrd_file("hello.o"))?;
//! ```
//!
//! 페이지 테이블, 인터럽트 컨트롤러, 타이머, 콘솔, initrd는 외부 구성요소이며
//! 여기서는 매핑된 주소 범위, 타임스탬프 함수, 콘솔 싱크, 이미지 바이트로만
//! 받는다.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod klog;
pub mod mm;
pub mod module;
pub mod sync;

pub use config::{ConfigError, KmodConfig};
pub use klog::KernelLogger;
pub use mm::arena::{ArenaError, ModuleArena, WindowConfig};
pub use mm::heap::{HeapError, KernelHeap, KERNEL_HEAP};
pub use module::{ExportTable, ModuleError, ModuleSubsystem, NativeInvoker};
