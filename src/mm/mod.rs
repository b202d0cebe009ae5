//! Memory Management
//!
//! 모듈 서브시스템이 쓰는 메모리 관리
//! - 커널 힙 (slab 크기 클래스 + 페이지 단위 large 경로)
//! - 모듈 아레나 (text/data 고정 윈도우 bump 할당자)
//!
//! 페이지 테이블과 물리 프레임 관리는 외부 VMM이 담당한다.
//! 여기서는 이미 매핑된 주소 범위만 다룬다.

pub mod arena;
pub mod heap;

/// 페이지 크기: 4KB
pub const PAGE_SIZE: usize = 4096;

/// `value`를 `align`(2의 거듭제곱) 배수로 올림. 오버플로 시 None
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_and_detects_overflow() {
        assert_eq!(align_up(0, PAGE_SIZE), Some(0));
        assert_eq!(align_up(1, PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(align_up(17, 16), Some(32));
        assert_eq!(align_up(usize::MAX - 2, PAGE_SIZE), None);
    }
}
