//! 커널 심볼 테이블
//!
//! 모듈이 커널 함수를 호출할 수 있도록 빌드 시점에 내보낸 심볼 테이블
//!
//! `kexport!`가 `kmod_exports` 링크 섹션에 엔트리를 하나씩 넣고, 링커가
//! 만들어 주는 `__start_kmod_exports` / `__stop_kmod_exports` 사이가 전체
//! 테이블이 된다. 런타임에는 읽기 전용이며 모듈이 추가할 수 없다.

use core::mem::size_of;

/// 내보낸 커널 심볼
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelSymbol {
    name: &'static str,
    address: *const (),
}

// 불변 데이터 (이름과 함수/데이터 주소)
unsafe impl Sync for KernelSymbol {}
unsafe impl Send for KernelSymbol {}

impl KernelSymbol {
    pub const fn new(name: &'static str, address: *const ()) -> Self {
        Self { name, address }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn address(&self) -> usize {
        self.address as usize
    }
}

/// 커널 심볼을 export 테이블에 등록
///
/// ```ignore
/// #[unsafe(no_mangle)]
/// pub extern "C" fn kernel_print(s: *const u8, len: usize) { ... }
/// kexport!(kernel_print);
/// ```
#[macro_export]
macro_rules! kexport {
    ($symbol:ident) => {
        const _: () = {
            #[used]
            #[unsafe(link_section = "kmod_exports")]
            static EXPORT: $crate::module::symbol::KernelSymbol =
                $crate::module::symbol::KernelSymbol::new(stringify!($symbol), $symbol as *const ());
        };
    };
}

#[cfg(target_os = "none")]
unsafe extern "C" {
    static __start_kmod_exports: KernelSymbol;
    static __stop_kmod_exports: KernelSymbol;
}

/// export 테이블 뷰
#[derive(Clone, Copy)]
pub struct ExportTable {
    symbols: &'static [KernelSymbol],
}

impl ExportTable {
    pub const fn new(symbols: &'static [KernelSymbol]) -> Self {
        Self { symbols }
    }

    /// 링커 경계 심볼 사이의 테이블
    #[cfg(target_os = "none")]
    pub fn linked() -> Self {
        // 링커가 kmod_exports 섹션의 양 끝을 가리키도록 정의함
        unsafe {
            let start = &raw const __start_kmod_exports;
            let stop = &raw const __stop_kmod_exports;
            let len = (stop as usize - start as usize) / size_of::<KernelSymbol>();
            Self::new(core::slice::from_raw_parts(start, len))
        }
    }

    /// 심볼 조회
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.symbols
            .iter()
            .find(|sym| sym.name == name)
            .map(KernelSymbol::address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static KernelSymbol> + 'static {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// 테이블 크기 (바이트)
    pub fn size_bytes(&self) -> usize {
        self.symbols.len() * size_of::<KernelSymbol>()
    }
}
