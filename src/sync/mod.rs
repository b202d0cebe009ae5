//! 동기화 프리미티브 모듈
//!
//! - Spinlock: Busy-waiting 기반 락 (아레나 윈도우 커서)
//! - IrqSpinlock: 인터럽트 비활성화 스핀락 (커널 힙, 로그 링 버퍼)
//! - RwLock: Reader-Writer 락 (모듈 레지스트리)

mod rwlock;
mod spinlock;

pub use rwlock::{ReadGuard, RwLock, WriteGuard};
pub use spinlock::{IrqSpinlock, IrqSpinlockGuard, Spinlock, SpinlockGuard};
