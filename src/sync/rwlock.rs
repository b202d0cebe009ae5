//! 모듈 레지스트리용 reader-writer 스핀락
//!
//! 조회(심볼 해석, 목록, symbolize)는 여러 CPU가 동시에 읽고, 등록/제거와
//! refcount 변경만 writer가 잡는다. 로더는 단계마다 잠깐씩만 잡으므로
//! 대기는 짧다. 대기 중인 writer가 있으면 새 reader는 들어오지 못한다.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

// state 비트 배치: [reader 수 ... | PENDING | WRITER]
const WRITER: usize = 1;
const PENDING: usize = 1 << 1;
const READER: usize = 1 << 2;

pub struct RwLock<T> {
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// 읽기 락. writer가 보유 중이거나 대기 중이면 스핀
    pub fn read(&self) -> ReadGuard<'_, T> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | PENDING) == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + READER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ReadGuard { lock: self };
            }
            spin_loop();
        }
    }

    /// 쓰기 락
    pub fn write(&self) -> WriteGuard<'_, T> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER == 0 && state < READER {
                // 획득하면서 PENDING도 지움. 다른 대기 writer는 다음 루프에서 다시 세움
                if self
                    .state
                    .compare_exchange_weak(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return WriteGuard { lock: self };
                }
            } else if state & PENDING == 0 {
                self.state.fetch_or(PENDING, Ordering::Relaxed);
            }
            spin_loop();
        }
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(READER, Ordering::Release);
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        // 그 사이 세워진 PENDING은 유지
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn writer_waits_for_readers() {
        let lock = Arc::new(RwLock::new(0u32));
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(lock.state.load(Ordering::Relaxed), 2 * READER);

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let lock = lock.clone();
            let done = done.clone();
            thread::spawn(move || {
                *lock.write() = 7;
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(*r1 + *r2, 0);
        drop(r1);
        drop(r2);

        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(*lock.read(), 7);
        assert_eq!(lock.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn waiting_writer_goes_before_new_readers() {
        let lock = Arc::new(RwLock::new(0u32));
        let held = lock.read();

        let writer = {
            let lock = lock.clone();
            thread::spawn(move || *lock.write() = 7)
        };
        while lock.state.load(Ordering::Relaxed) & PENDING == 0 {
            thread::yield_now();
        }

        // writer 대기 중에 들어온 reader는 writer 뒤에 읽는다
        let reader = {
            let lock = lock.clone();
            thread::spawn(move || *lock.read())
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);

        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), 7);
    }
}
