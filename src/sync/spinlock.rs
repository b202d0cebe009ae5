//! Spinlock - Busy-waiting 기반 락
//!
//! 특징:
//! - CPU가 락을 얻을 때까지 루프를 돌며 대기 (busy-waiting)
//! - 짧은 임계 구역에 적합 (할당 1회, 레지스트리 변경 1회 등)
//! - IRQ-safe 버전 포함 (인터럽트 비활성화)

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Spinlock - 기본 스핀락
pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// T가 Send면 Spinlock도 스레드간 공유 가능
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// 새 스핀락 생성
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// 락 획득 (블로킹)
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // 락이 해제될 때까지 스핀
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }

    /// 락 시도 (논블로킹)
    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// 락이 현재 잠겨있는지 확인
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// 스핀락 가드 - RAII 패턴으로 자동 해제
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// IRQ-safe Spinlock - 인터럽트 비활성화 포함
///
/// 인터럽트 핸들러에서도 호출될 수 있는 경로(커널 힙 등)에 사용.
/// 락을 잡은 CPU가 같은 락을 노리는 인터럽트에 선점되어 데드락에 빠지는 것을 막는다.
pub struct IrqSpinlock<T> {
    inner: Spinlock<T>,
}

unsafe impl<T: Send> Send for IrqSpinlock<T> {}
unsafe impl<T: Send> Sync for IrqSpinlock<T> {}

impl<T> IrqSpinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Spinlock::new(data),
        }
    }

    /// 인터럽트 비활성화 후 락 획득
    #[inline]
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let irq_enabled = irq::enabled();
        irq::disable();

        let guard = self.inner.lock();
        IrqSpinlockGuard {
            guard: ManuallyDrop::new(guard),
            irq_was_enabled: irq_enabled,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

pub struct IrqSpinlockGuard<'a, T> {
    guard: ManuallyDrop<SpinlockGuard<'a, T>>,
    irq_was_enabled: bool,
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // 락을 먼저 해제한 뒤 인터럽트 상태 복원
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if self.irq_was_enabled {
            irq::enable();
        }
    }
}

// 아키텍처별 인터럽트 제어 (커널 빌드에서만 실제 명령 사용)
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod irq {
    use x86_64::instructions::interrupts;

    pub fn enabled() -> bool {
        interrupts::are_enabled()
    }

    pub fn disable() {
        interrupts::disable();
    }

    pub fn enable() {
        interrupts::enable();
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
mod irq {
    pub fn enabled() -> bool {
        let daif: u64;
        unsafe {
            core::arch::asm!("mrs {}, DAIF", out(reg) daif);
        }
        (daif & 0x80) == 0 // I bit이 0이면 IRQ 활성화
    }

    pub fn disable() {
        unsafe {
            core::arch::asm!("msr DAIFSet, #2");
        }
    }

    pub fn enable() {
        unsafe {
            core::arch::asm!("msr DAIFClr, #2");
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
mod irq {
    pub fn enabled() -> bool {
        let mstatus: usize;
        unsafe {
            core::arch::asm!("csrr {}, mstatus", out(reg) mstatus);
        }
        (mstatus & 0x8) != 0 // MIE bit
    }

    pub fn disable() {
        unsafe {
            core::arch::asm!("csrc mstatus, {}", in(reg) 0x8usize);
        }
    }

    pub fn enable() {
        unsafe {
            core::arch::asm!("csrs mstatus, {}", in(reg) 0x8usize);
        }
    }
}

// 호스트 빌드 (단위 테스트): 인터럽트 개념 없음
#[cfg(not(target_os = "none"))]
mod irq {
    pub fn enabled() -> bool {
        false
    }

    pub fn disable() {}

    pub fn enable() {}
}
