//! Raw Linux x86_64 system calls, for building without libc.

use core::arch::asm;

//============================================================
// System call numbers
const SYS_WRITE: usize = 1;
const SYS_MMAP: usize = 9;
const SYS_MUNMAP: usize = 11;
const SYS_BRK: usize = 12;
const SYS_EXIT_GROUP: usize = 231;

//============================================================
// Flags for protection

pub const PROT_READ: usize = 0x01; // pages can be read
pub const PROT_WRITE: usize = 0x02; // pages can be written

//============================================================
// Flags contain sharing type and options.

pub const MAP_PRIVATE: usize = 0x02; // changes are private
pub const MAP_ANONYMOUS: usize = 0x20; // not backed by a file

// Out of memory
pub const ENOMEM: i32 = 12;

/// The negated `errno` returned by a failing system call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyscallError(pub i32);

unsafe fn syscall6(
    n: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> isize {
    let ret: isize;
    asm!(
        "syscall",
        inlateout("rax") n as isize => ret,
        in("rdi") a1,
        in("rsi") a2,
        in("rdx") a3,
        in("r10") a4,
        in("r8") a5,
        in("r9") a6,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack),
    );
    ret
}

// Return values in [-4095, -1] are errors.
fn check(ret: isize) -> Result<usize, SyscallError> {
    if (-4095..0).contains(&ret) {
        Err(SyscallError(-ret as i32))
    } else {
        Ok(ret as usize)
    }
}

/// Set the program break. Returns the new break, which is the old one if the
/// request was refused; `brk(null)` reads the current break.
pub unsafe fn brk(addr: *mut u8) -> *mut u8 {
    syscall6(SYS_BRK, addr as usize, 0, 0, 0, 0, 0) as *mut u8
}

/// Map `len` bytes of anonymous, private, read/write memory.
pub unsafe fn mmap(len: usize) -> Result<*mut u8, SyscallError> {
    // The file descriptor is -1: no file backs this mapping.
    let ret = syscall6(
        SYS_MMAP,
        0,
        len,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        usize::MAX,
        0,
    );
    check(ret).map(|addr| addr as *mut u8)
}

pub unsafe fn munmap(addr: *mut u8, len: usize) -> Result<(), SyscallError> {
    check(syscall6(SYS_MUNMAP, addr as usize, len, 0, 0, 0, 0)).map(|_| ())
}

/// Best-effort write of `msg` to standard error.
pub fn write_stderr(msg: &[u8]) {
    unsafe {
        syscall6(SYS_WRITE, 2, msg.as_ptr() as usize, msg.len(), 0, 0, 0);
    }
}

pub fn exit_group(code: i32) -> ! {
    unsafe {
        syscall6(SYS_EXIT_GROUP, code as usize, 0, 0, 0, 0, 0);
    }
    loop {
        core::hint::spin_loop();
    }
}
