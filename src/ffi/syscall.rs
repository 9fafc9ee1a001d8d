use std::fs::File;
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd};

use super::Attr;

pub fn perf_event_open(attr: &Attr, pid: i32, cpu: i32, group_fd: i32, flags: u64) -> Result<File> {
    let num = libc::SYS_perf_event_open;
    let fd = unsafe { libc::syscall(num, attr as *const Attr, pid, cpu, group_fd, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd as _) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ioctl(file: &File, op: u64) -> Result<i32> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::ioctl(fd, op as _) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn fcntl(file: &File, cmd: i32, arg: i32) -> Result<i32> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::fcntl(fd, cmd, arg) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn read_u64(file: &File) -> Result<u64> {
    let mut buf = [0u8; 8];
    let bytes = unsafe { libc::read(file.as_raw_fd(), buf.as_mut_ptr() as _, buf.len()) };
    match bytes {
        8 => Ok(u64::from_ne_bytes(buf)),
        -1 => Err(Error::last_os_error()),
        _ => Err(Error::from(std::io::ErrorKind::UnexpectedEof)),
    }
}

pub fn sigaction(
    sig: i32,
    handler: extern "C" fn(i32, *mut libc::siginfo_t, *mut libc::c_void),
) -> Result<()> {
    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    act.sa_sigaction = handler as usize;
    act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    let result = unsafe {
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaction(sig, &act, std::ptr::null_mut())
    };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}
