#![allow(non_camel_case_types)]

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h
//
// Only the first published layout of `perf_event_attr` (PERF_ATTR_SIZE_VER1),
// every kernel since 2.6.32 accepts it.

pub const PERF_ATTR_SIZE_VER1: u32 = 72;

pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// _IO('$', n)
pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;

// Bits of `perf_event_attr::flags`.
pub const ATTR_DISABLED: u64 = 1 << 0;
pub const ATTR_INHERIT: u64 = 1 << 1;
pub const ATTR_EXCLUDE_USER: u64 = 1 << 4;
pub const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_EXCLUDE_HV: u64 = 1 << 6;

// include/uapi/asm-generic/fcntl.h
pub const F_SETSIG: i32 = 10;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    // union { sample_period, sample_freq }
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    // union { wakeup_events, wakeup_watermark }
    pub wakeup_events: u32,
    pub bp_type: u32,
    // union { bp_addr, config1 }
    pub config1: u64,
    // union { bp_len, config2 }
    pub config2: u64,
}

const _: () = assert!(size_of::<perf_event_attr>() == PERF_ATTR_SIZE_VER1 as usize);
