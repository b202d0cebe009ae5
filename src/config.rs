//! 모듈 서브시스템 설정
//!
//! 기본값에 커널 커맨드라인 오버라이드를 덮어쓴다.
//!
//! ```text
//! kmod.text_base=0xffffffffa0000000 kmod.text_size=128M loglevel=debug
//! ```
//!
//! 숫자는 10진수 또는 `0x` 16진수, `_` 구분자와 `K`/`M`/`G` 접미사를 허용한다.
//! 모르는 키는 다른 서브시스템 몫이므로 무시한다.

use alloc::string::{String, ToString};
use core::str::FromStr;

use log::LevelFilter;

use crate::mm::arena::WindowConfig;
use crate::module::elf::ElfMachine;

/// 모듈 text 윈도우 시작 (실행 가능)
pub const MODULE_TEXT_BASE: usize = 0xFFFF_FFFF_A000_0000;
/// 모듈 data 윈도우 시작 (실행 불가)
pub const MODULE_DATA_BASE: usize = 0xFFFF_FFFF_A800_0000;
/// 윈도우 크기: 128MB
pub const MODULE_WINDOW_SIZE: usize = 128 * 1024 * 1024;

/// 설정 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

/// 모듈 서브시스템 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmodConfig {
    pub text: WindowConfig,
    pub data: WindowConfig,
    /// 받아들일 모듈 오브젝트의 머신 타입
    pub machine: ElfMachine,
    pub log_level: LevelFilter,
}

impl Default for KmodConfig {
    fn default() -> Self {
        Self {
            text: WindowConfig {
                base: MODULE_TEXT_BASE,
                size: MODULE_WINDOW_SIZE,
            },
            data: WindowConfig {
                base: MODULE_DATA_BASE,
                size: MODULE_WINDOW_SIZE,
            },
            machine: ElfMachine::native(),
            log_level: LevelFilter::Info,
        }
    }
}

impl KmodConfig {
    /// 기본값 + 커맨드라인
    pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_cmdline(cmdline)?;
        Ok(config)
    }

    /// 커맨드라인의 `key=value` 토큰 적용
    pub fn apply_cmdline(&mut self, cmdline: &str) -> Result<(), ConfigError> {
        for token in cmdline.split_ascii_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "kmod.text_base" => self.text.base = parse_number(key, value)?,
                "kmod.text_size" => self.text.size = parse_number(key, value)?,
                "kmod.data_base" => self.data.base = parse_number(key, value)?,
                "kmod.data_size" => self.data.size = parse_number(key, value)?,
                "loglevel" => {
                    self.log_level = parse_level(value).ok_or_else(|| invalid(key, value))?
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b'K' | b'k') => (&value[..value.len() - 1], 1usize << 10),
        Some(b'M' | b'm') => (&value[..value.len() - 1], 1 << 20),
        Some(b'G' | b'g') => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    let (digits, radix) = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (digits, 10),
    };

    let mut result: usize = 0;
    let mut seen_digit = false;
    for c in digits.chars() {
        if c == '_' {
            continue;
        }
        let digit = c.to_digit(radix).ok_or_else(|| invalid(key, value))?;
        result = result
            .checked_mul(radix as usize)
            .and_then(|n| n.checked_add(digit as usize))
            .ok_or_else(|| invalid(key, value))?;
        seen_digit = true;
    }
    if !seen_digit {
        return Err(invalid(key, value));
    }
    result.checked_mul(multiplier).ok_or_else(|| invalid(key, value))
}

/// `0`~`4` (error ~ trace) 또는 레벨 이름
fn parse_level(value: &str) -> Option<LevelFilter> {
    match value {
        "0" => Some(LevelFilter::Error),
        "1" => Some(LevelFilter::Warn),
        "2" => Some(LevelFilter::Info),
        "3" => Some(LevelFilter::Debug),
        "4" => Some(LevelFilter::Trace),
        name => LevelFilter::from_str(name).ok(),
    }
}
