//! 커널 모듈 시스템
//!
//! ELF64 relocatable object 로딩 및 동적 모듈 관리
//! - ELF64 파서
//! - 커널 export 테이블과 모듈용 커널 서비스
//! - 재배치 처리 (x86_64, AArch64, RISC-V)
//! - 모듈 레지스트리와 라이프사이클

pub mod elf;
pub mod exports;
pub mod loader;
pub mod registry;
pub mod reloc;
pub mod symbol;

#[cfg(test)]
mod testutil;

pub use elf::{Elf64, ElfError, ElfMachine};
pub use loader::{EntryInvoker, ModuleError, ModuleInfo, ModuleRef, ModuleSubsystem, NativeInvoker, Symbolized};
pub use registry::{ModuleHandle, ModuleState};
pub use reloc::RelocError;
pub use symbol::{ExportTable, KernelSymbol};
