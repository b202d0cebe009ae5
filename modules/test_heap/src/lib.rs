//! 커널 힙 테스트 모듈
//!
//! 테스트 항목:
//! 1. kmalloc/kfree 왕복
//! 2. 연속 할당 시 주소 겹침 없음
//! 3. slab 한도를 넘는 큰 할당
//!
//! 실패하면 module_init이 음수를 반환해 로드가 롤백된다.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

unsafe extern "C" {
    fn kernel_print(s: *const u8, len: usize);
    fn kmalloc(size: usize) -> *mut u8;
    fn kfree(ptr: *mut u8);
}

fn print(s: &str) {
    unsafe { kernel_print(s.as_ptr(), s.len()); }
}

#[unsafe(no_mangle)]
pub extern "C" fn module_init() -> i32 {
    print("[test_heap] === Kernel Heap Tests ===\n");

    print("[test_heap] test: kmalloc/kfree ... ");
    let ptr = unsafe { kmalloc(1024) };
    if ptr.is_null() {
        print("FAIL (kmalloc returned null)\n");
        return -1;
    }
    unsafe {
        for i in 0..1024 {
            ptr.add(i).write(0xAB);
        }
        if ptr.add(1023).read() != 0xAB {
            print("FAIL (memory read mismatch)\n");
            return -2;
        }
        kfree(ptr);
    }
    print("PASS\n");

    print("[test_heap] test: multiple allocations no overlap ... ");
    let (a, b, c) = unsafe { (kmalloc(48), kmalloc(48), kmalloc(48)) };
    if a.is_null() || b.is_null() || c.is_null() {
        print("FAIL (kmalloc returned null)\n");
        return -3;
    }
    let (a_addr, b_addr, c_addr) = (a as usize, b as usize, c as usize);
    if a_addr.abs_diff(b_addr) < 48 || b_addr.abs_diff(c_addr) < 48 || a_addr.abs_diff(c_addr) < 48 {
        print("FAIL (addresses overlap)\n");
        return -4;
    }
    unsafe {
        kfree(c);
        kfree(b);
        kfree(a);
    }
    print("PASS\n");

    print("[test_heap] test: large allocation ... ");
    let big = unsafe { kmalloc(64 * 1024) };
    if big.is_null() {
        print("FAIL (kmalloc returned null)\n");
        return -5;
    }
    unsafe { kfree(big) };
    print("PASS\n");

    print("[test_heap] All tests passed\n");
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn module_exit() {
    print("[test_heap] Module unloaded\n");
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    print("[test_heap] PANIC!\n");
    loop {}
}
