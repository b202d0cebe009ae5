//! hello 모듈의 `hello_add`를 쓰는 모듈
//!
//! 로드되는 동안 hello의 참조 카운트를 하나 잡으므로, 이 모듈을 먼저
//! 언로드하기 전에는 hello를 언로드할 수 없다.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

unsafe extern "C" {
    fn kernel_print(s: *const u8, len: usize);
    /// hello 모듈이 export
    fn hello_add(a: i32, b: i32) -> i32;
}

fn print(s: &str) {
    unsafe { kernel_print(s.as_ptr(), s.len()); }
}

#[unsafe(no_mangle)]
pub extern "C" fn module_init() -> i32 {
    if unsafe { hello_add(40, 2) } != 42 {
        print("[hello_user] hello_add returned a wrong value\n");
        return -1;
    }
    print("[hello_user] hello_add(40, 2) = 42\n");
    0
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {}
}
