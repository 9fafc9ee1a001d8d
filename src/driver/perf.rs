use std::fs::File;
use std::io::{self, Result};
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering as MemOrd,
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use super::{OverflowSink, Pmu, MAX_SLOTS};
use crate::config::Granularity;
use crate::event::HwEvent;
use crate::ffi::syscall::{fcntl, ioctl, perf_event_open, read_u64, sigaction};
use crate::ffi::{bindings as b, Attr};
use crate::overflow::SinkInner;

// State shared with the SIGIO handler, which may only touch atomics.
static TAKEN: AtomicBool = AtomicBool::new(false);
// Borrowed from the `PerfPmu` that registered it, null otherwise.
static SINK: AtomicPtr<SinkInner> = AtomicPtr::new(ptr::null_mut());
// SIGIO handlers currently looking at `SINK`.
static IN_HANDLER: AtomicUsize = AtomicUsize::new(0);
static FDS: [AtomicI32; MAX_SLOTS] = [const { AtomicI32::new(-1) }; MAX_SLOTS];
static PERIODS: [AtomicU64; MAX_SLOTS] = [const { AtomicU64::new(0) }; MAX_SLOTS];
static NEXT: [AtomicU64; MAX_SLOTS] = [const { AtomicU64::new(0) }; MAX_SLOTS];

/// The PMU of the running CPU, driven through `perf_event_open`.
///
/// Each slot is backed by its own perf event. Overflows are signalled with
/// `SIGIO`, so at most one `PerfPmu` exists per process at a time, and its
/// overflow handler can only be registered once.
///
/// The kernel does not report how many hardware counters there are,
/// the caller provides the number of slots.
pub struct PerfPmu {
    files: Mutex<Vec<Option<File>>>,
    sink: Mutex<Option<OverflowSink>>,
}

impl PerfPmu {
    /// Takes the process-wide perf PMU with `counters` slots.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] while another one is alive.
    pub fn new(counters: usize) -> Result<Self> {
        if counters == 0 || counters > MAX_SLOTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} counters, expected 1 to {}", counters, MAX_SLOTS),
            ));
        }
        if TAKEN.swap(true, MemOrd::AcqRel) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        Ok(Self {
            files: Mutex::new((0..counters).map(|_| None).collect()),
            sink: Mutex::new(None),
        })
    }

    fn files(&self) -> MutexGuard<'_, Vec<Option<File>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PerfPmu {
    fn drop(&mut self) {
        for (slot, file) in self.files().iter_mut().enumerate() {
            FDS[slot].store(-1, MemOrd::Release);
            file.take();
        }

        // The sink is freed with `self`, no handler may still hold it.
        SINK.store(ptr::null_mut(), MemOrd::SeqCst);
        while IN_HANDLER.load(MemOrd::SeqCst) != 0 {
            thread::yield_now();
        }
        TAKEN.store(false, MemOrd::Release);
    }
}

fn attr(event: &HwEvent, reset_value: u64, want_interrupt: bool) -> Attr {
    let mut attr = Attr {
        type_: event.term.component,
        size: b::PERF_ATTR_SIZE_VER1,
        config: event.term.config,
        flags: b::ATTR_DISABLED,
        ..Default::default()
    };

    macro_rules! when {
        ($cond:expr, $flag:ident) => {
            if $cond {
                attr.flags |= b::$flag;
            }
        };
    }
    when!(event.exclude.user, ATTR_EXCLUDE_USER);
    when!(event.exclude.kernel, ATTR_EXCLUDE_KERNEL);
    when!(event.exclude.hv, ATTR_EXCLUDE_HV);
    when!(event.granularity == Granularity::Process, ATTR_INHERIT);

    if want_interrupt {
        attr.sample_period = reset_value;
        attr.wakeup_events = 1;
    }
    attr
}

fn target(granularity: Granularity) -> (i32, i32) {
    match granularity {
        Granularity::Thread | Granularity::Process => (0, -1),
        Granularity::System => (-1, unsafe { libc::sched_getcpu() }),
    }
}

fn open(event: &HwEvent, reset_value: u64, want_interrupt: bool) -> Result<File> {
    let attr = attr(event, reset_value, want_interrupt);
    let (pid, cpu) = target(event.granularity);
    let file = perf_event_open(&attr, pid, cpu, -1, b::PERF_FLAG_FD_CLOEXEC)?;

    if want_interrupt {
        // The kernel signals every overflow, the counter never stops.
        fcntl(&file, libc::F_SETFL, libc::O_ASYNC | libc::O_NONBLOCK)?;
        fcntl(&file, b::F_SETSIG, libc::SIGIO)?;
        fcntl(&file, libc::F_SETOWN, unsafe { libc::getpid() })?;
    }
    ioctl(&file, b::PERF_EVENT_IOC_ENABLE)?;
    Ok(file)
}

// Instruction pointer of the interrupted context.
#[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
fn pc(ucontext: *mut libc::c_void) -> Option<usize> {
    let uc = unsafe { ucontext.cast::<libc::ucontext_t>().as_ref()? };
    Some(uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize)
}

#[cfg(not(all(target_arch = "x86_64", target_env = "gnu")))]
fn pc(_: *mut libc::c_void) -> Option<usize> {
    None
}

extern "C" fn on_sigio(_: i32, _: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
    let errno = unsafe { *libc::__errno_location() };

    IN_HANDLER.fetch_add(1, MemOrd::SeqCst);
    if let Some(sink) = unsafe { SINK.load(MemOrd::SeqCst).as_ref() } {
        let mut mask = 0u64;
        for slot in 0..MAX_SLOTS {
            let fd = FDS[slot].load(MemOrd::Acquire);
            let period = PERIODS[slot].load(MemOrd::Relaxed);
            if fd < 0 || period == 0 {
                continue;
            }
            let mut value = 0u64;
            let bytes = unsafe { libc::read(fd, &mut value as *mut u64 as _, 8) };
            if bytes != 8 {
                continue;
            }
            let next = NEXT[slot].load(MemOrd::Relaxed);
            if value >= next {
                let crossed = (value - next) / period + 1;
                NEXT[slot].store(next + crossed * period, MemOrd::Relaxed);
                mask |= 1u64 << slot;
            }
        }
        if mask != 0 {
            sink.raise(mask, pc(ucontext));
        }
    }
    IN_HANDLER.fetch_sub(1, MemOrd::SeqCst);

    unsafe { *libc::__errno_location() = errno };
}

impl Pmu for PerfPmu {
    fn counters(&self) -> usize {
        self.files().len()
    }

    fn interrupts(&self) -> bool {
        true
    }

    fn read(&self, slot: usize) -> Result<u64> {
        let files = self.files();
        match files.get(slot) {
            Some(Some(file)) => read_u64(file),
            _ => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn program(
        &self,
        slot: usize,
        event: &HwEvent,
        reset_value: u64,
        want_interrupt: bool,
    ) -> Result<()> {
        let mut files = self.files();
        let entry = files
            .get_mut(slot)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let file = open(event, reset_value, want_interrupt)?;

        FDS[slot].store(-1, MemOrd::Release);
        PERIODS[slot].store(if want_interrupt { reset_value } else { 0 }, MemOrd::Relaxed);
        NEXT[slot].store(reset_value, MemOrd::Relaxed);
        FDS[slot].store(file.as_raw_fd(), MemOrd::Release);
        *entry = Some(file);
        Ok(())
    }

    fn unprogram(&self, slot: usize) -> Result<()> {
        let mut files = self.files();
        let entry = files
            .get_mut(slot)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        FDS[slot].store(-1, MemOrd::Release);
        if let Some(file) = entry.take() {
            ioctl(&file, b::PERF_EVENT_IOC_DISABLE)?;
        }
        Ok(())
    }

    fn register_overflow_handler(&self, sink: OverflowSink) -> Result<()> {
        let mut registered = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if registered.is_some() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        sigaction(libc::SIGIO, on_sigio)?;
        SINK.store(sink.as_ptr(), MemOrd::SeqCst);
        *registered = Some(sink);
        Ok(())
    }
}
