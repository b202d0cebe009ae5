//! 커널 로그 링 버퍼 (dmesg)
//!
//! 64KB 고정 배열 기반 순환 버퍼.
//! 엔트리 포맷: [4:length][1:level][8:timestamp_us][N:msg]

use log::Level;

pub const RING_BUFFER_SIZE: usize = 64 * 1024; // 64KB
const ENTRY_HEADER_SIZE: usize = 13; // 4 + 1 + 8

/// 읽기 시 메시지 최대 길이
pub const MAX_MESSAGE_LEN: usize = 512;

pub struct RingBuffer {
    buffer: [u8; RING_BUFFER_SIZE],
    write_pos: usize,
    total_written: usize, // 총 기록 바이트 수 (wrap 감지용)
    /// 가장 오래된 유효 엔트리 시작 위치 (total_written 기준 절대 오프셋)
    oldest: usize,
}

impl RingBuffer {
    pub const fn new() -> Self {
        Self {
            buffer: [0u8; RING_BUFFER_SIZE],
            write_pos: 0,
            total_written: 0,
            oldest: 0,
        }
    }

    pub fn append(&mut self, level: Level, timestamp_us: u64, msg: &str) {
        let msg_bytes = msg.as_bytes();
        let msg_bytes = &msg_bytes[..msg_bytes.len().min(MAX_MESSAGE_LEN)];
        let total_len = ENTRY_HEADER_SIZE + msg_bytes.len();

        // 덮어쓸 구간에 걸친 오래된 엔트리들을 건너뜀
        let end = self.total_written + total_len;
        while end - self.oldest > RING_BUFFER_SIZE {
            let len = self.read_len(self.oldest);
            if len < ENTRY_HEADER_SIZE {
                self.oldest = self.total_written;
                break;
            }
            self.oldest += len;
        }

        self.write_bytes(&(total_len as u32).to_le_bytes());
        self.write_bytes(&[level as u8]);
        self.write_bytes(&timestamp_us.to_le_bytes());
        self.write_bytes(msg_bytes);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.buffer[self.write_pos] = byte;
            self.write_pos += 1;
            if self.write_pos >= RING_BUFFER_SIZE {
                self.write_pos = 0;
            }
        }
        self.total_written += bytes.len();
    }

    fn byte_at(&self, absolute: usize) -> u8 {
        self.buffer[absolute % RING_BUFFER_SIZE]
    }

    fn read_len(&self, absolute: usize) -> usize {
        let mut len_bytes = [0u8; 4];
        for (i, b) in len_bytes.iter_mut().enumerate() {
            *b = self.byte_at(absolute + i);
        }
        u32::from_le_bytes(len_bytes) as usize
    }

    pub fn has_wrapped(&self) -> bool {
        self.total_written > RING_BUFFER_SIZE
    }

    /// 남아있는 엔트리를 오래된 순서로 순회
    pub fn for_each(&self, mut f: impl FnMut(Level, u64, &str)) {
        let mut offset = self.oldest;
        while offset + ENTRY_HEADER_SIZE <= self.total_written {
            let total_len = self.read_len(offset);
            if total_len < ENTRY_HEADER_SIZE || offset + total_len > self.total_written {
                break;
            }

            let level = level_from_u8(self.byte_at(offset + 4));

            let mut ts_bytes = [0u8; 8];
            for (i, b) in ts_bytes.iter_mut().enumerate() {
                *b = self.byte_at(offset + 5 + i);
            }
            let timestamp_us = u64::from_le_bytes(ts_bytes);

            let msg_len = (total_len - ENTRY_HEADER_SIZE).min(MAX_MESSAGE_LEN);
            let mut msg_buf = [0u8; MAX_MESSAGE_LEN];
            for (i, b) in msg_buf[..msg_len].iter_mut().enumerate() {
                *b = self.byte_at(offset + ENTRY_HEADER_SIZE + i);
            }

            // 잘린 멀티바이트 문자는 유효한 앞부분만 사용
            let msg = match core::str::from_utf8(&msg_buf[..msg_len]) {
                Ok(s) => s,
                Err(e) => core::str::from_utf8(&msg_buf[..e.valid_up_to()]).unwrap_or(""),
            };
            f(level, timestamp_us, msg);

            offset += total_len;
        }
    }
}

fn level_from_u8(v: u8) -> Level {
    match v {
        1 => Level::Error,
        2 => Level::Warn,
        3 => Level::Info,
        4 => Level::Debug,
        _ => Level::Trace,
    }
}
