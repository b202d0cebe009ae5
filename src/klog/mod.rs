//! 커널 로깅 시스템
//!
//! `log` 크레이트 백엔드.
//! - 레벨 필터: ERROR, WARN, INFO, DEBUG, TRACE
//! - 타임스탬프 접두사 (시계는 타이머 드라이버가 제공)
//! - 64KB 링 버퍼 (dmesg)
//! - 재귀 방지

mod buffer;

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::sync::IrqSpinlock;
use buffer::RingBuffer;

pub use buffer::{MAX_MESSAGE_LEN, RING_BUFFER_SIZE};

/// 콘솔 출력 (UART, 프레임버퍼 등 외부 드라이버가 구현)
pub trait ConsoleSink: Sync {
    fn puts(&self, s: &str);
}

/// 부팅 이후 경과 시간 (마이크로초)
pub type Clock = fn() -> u64;

pub struct KernelLogger {
    console: Option<&'static dyn ConsoleSink>,
    clock: Option<Clock>,
    level: AtomicUsize,
    in_progress: AtomicBool,
    /// 인터럽트 핸들러도 로그를 남기므로 잡는 동안 인터럽트를 끈다
    ring: IrqSpinlock<RingBuffer>,
}

impl KernelLogger {
    pub const fn new(console: Option<&'static dyn ConsoleSink>, clock: Option<Clock>) -> Self {
        Self {
            console,
            clock,
            level: AtomicUsize::new(LevelFilter::Info as usize),
            in_progress: AtomicBool::new(false),
            ring: IrqSpinlock::new(RingBuffer::new()),
        }
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    pub fn level(&self) -> LevelFilter {
        match self.level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// 링 버퍼 내용을 오래된 순서로 순회 (타임스탬프는 마이크로초)
    pub fn for_each_entry(&self, f: impl FnMut(Level, u64, &str)) {
        self.ring.lock().for_each(f);
    }

    /// dmesg: 링 버퍼 내용을 콘솔로 출력
    pub fn dump_logs(&self) {
        let Some(console) = self.console else {
            return;
        };

        let ring = self.ring.lock();
        let mut empty = true;
        ring.for_each(|level, ts, msg| {
            empty = false;
            let mut prefix_buf = [0u8; 40];
            let prefix = format_prefix(&mut prefix_buf, ts, level);
            console.puts(prefix);
            console.puts(msg);
            console.puts("\n");
        });
        if empty {
            console.puts("(empty log buffer)\n");
        }
    }

    fn timestamp(&self) -> u64 {
        self.clock.map(|clock| clock()).unwrap_or(0)
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // 로깅 중 다시 로그를 남기는 경로(콘솔 드라이버 등) 차단
        if self.in_progress.swap(true, Ordering::Acquire) {
            return;
        }

        let timestamp_us = self.timestamp();

        let mut prefix_buf = [0u8; 40];
        let prefix = format_prefix(&mut prefix_buf, timestamp_us, record.level());

        let mut msg_buf = [0u8; MAX_MESSAGE_LEN];
        let msg = format_to_buf(&mut msg_buf, *record.args());

        if let Some(console) = self.console {
            console.puts(prefix);
            console.puts(msg);
            console.puts("\n");
        }

        self.ring.lock().append(record.level(), timestamp_us, msg);

        self.in_progress.store(false, Ordering::Release);
    }

    fn flush(&self) {}
}

/// 로거 등록 (부팅 초기 1회)
pub fn init(logger: &'static KernelLogger, level: LevelFilter) -> Result<(), SetLoggerError> {
    logger.set_level(level);
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => " WARN",
        Level::Info => " INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

// 접두사 포매팅: "[  123.456789]  INFO: "
fn format_prefix(buf: &mut [u8], timestamp_us: u64, level: Level) -> &str {
    let seconds = timestamp_us / 1_000_000;
    let micros = timestamp_us % 1_000_000;
    format_to_buf(
        buf,
        format_args!("[{:>6}.{:06}] {}: ", seconds, micros, level_str(level)),
    )
}

// fmt::Arguments를 바이트 버퍼에 포매팅 (넘치면 잘림)
fn format_to_buf<'b>(buf: &'b mut [u8], args: fmt::Arguments) -> &'b str {
    let mut writer = BufWriter { buf, pos: 0 };
    let _ = fmt::write(&mut writer, args);
    let BufWriter { buf, pos } = writer;
    let written = &buf[..pos];
    match core::str::from_utf8(written) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&written[..e.valid_up_to()]).unwrap_or(""),
    }
}

// 스택 버퍼에 쓰는 fmt::Write 구현
struct BufWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl fmt::Write for BufWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buf.len() - self.pos;
        let copy_len = bytes.len().min(remaining);
        self.buf[self.pos..self.pos + copy_len].copy_from_slice(&bytes[..copy_len]);
        self.pos += copy_len;
        Ok(())
    }
}
