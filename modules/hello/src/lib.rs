//! Hello 모듈
//!
//! 커널 서비스 `kernel_print`를 호출하고, 다른 모듈이 쓸 수 있도록
//! `hello_add`를 export한다.
//!
//! `cargo build --release` 후 staticlib에서 오브젝트를 꺼내 `hello.o`로 initrd에 넣는다.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

unsafe extern "C" {
    /// 커널 출력 함수 (PLT를 통해 호출됨)
    fn kernel_print(s: *const u8, len: usize);
}

/// 로더가 읽는 메타데이터 ("key=value\0")
#[used]
#[unsafe(link_section = ".modinfo")]
static MODINFO: [u8; 50] = *b"version=0.2.0\0description=hello from a module\0\0\0\0\0";

fn print(s: &str) {
    unsafe {
        kernel_print(s.as_ptr(), s.len());
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn module_init() -> i32 {
    print("[hello] Module initialized!\n");
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn module_exit() {
    print("[hello] Module unloading, goodbye!\n");
}

/// 다른 모듈에서 호출하는 함수
#[unsafe(no_mangle)]
pub extern "C" fn hello_add(a: i32, b: i32) -> i32 {
    a + b
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {}
}
