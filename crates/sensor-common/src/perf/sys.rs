//! Thin layer over `perf_event_open(2)`, its ioctls and the mmap ring buffer.

use std::{
    fs, io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr,
    sync::atomic::{AtomicU64, Ordering},
};

use libc::{c_int, c_ulong};

pub(crate) const PERF_TYPE_TRACEPOINT: u32 = 2;

pub(crate) const PERF_SAMPLE_TID: u64 = 1 << 1;
pub(crate) const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub(crate) const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub(crate) const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub(crate) const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;

const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_INHERIT: u64 = 1 << 1;

pub(crate) const PERF_FLAG_PID_CGROUP: c_ulong = 1 << 2;
pub(crate) const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

pub(crate) const PERF_RECORD_LOST: u32 = 2;
pub(crate) const PERF_RECORD_SAMPLE: u32 = 9;

const ONLINE_CPUS: &str = "/sys/devices/system/cpu/online";

/// `struct perf_event_attr`, up to `PERF_ATTR_SIZE_VER5`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved: u16,
}

impl PerfEventAttr {
    /// Attributes sampling every hit of the tracepoint `id`, initially disabled.
    pub(crate) fn tracepoint(id: u64, inherit: bool) -> Self {
        let mut flags = ATTR_DISABLED;
        if inherit {
            flags |= ATTR_INHERIT;
        }
        Self {
            type_: PERF_TYPE_TRACEPOINT,
            size: mem::size_of::<Self>() as u32,
            config: id,
            sample_period: 1,
            sample_type: PERF_SAMPLE_IDENTIFIER
                | PERF_SAMPLE_TID
                | PERF_SAMPLE_TIME
                | PERF_SAMPLE_CPU
                | PERF_SAMPLE_RAW,
            flags,
            wakeup_events: 1,
            ..Default::default()
        }
    }
}

pub(crate) fn perf_event_open(
    attr: &PerfEventAttr,
    pid: c_int,
    cpu: c_int,
    flags: c_ulong,
) -> io::Result<OwnedFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            -1 as c_int,
            flags | PERF_FLAG_FD_CLOEXEC,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

nix::ioctl_none!(perf_ioc_enable, b'$', 0);
nix::ioctl_none!(perf_ioc_disable, b'$', 1);
nix::ioctl_write_int_bad!(perf_ioc_set_output, nix::request_code_none!(b'$', 5));
nix::ioctl_read_bad!(
    perf_ioc_id,
    nix::request_code_read!(b'$', 7, mem::size_of::<*mut u64>()),
    u64
);

pub(crate) fn enable(fd: &OwnedFd) -> nix::Result<()> {
    unsafe { perf_ioc_enable(fd.as_raw_fd()) }.map(drop)
}

pub(crate) fn disable(fd: &OwnedFd) -> nix::Result<()> {
    unsafe { perf_ioc_disable(fd.as_raw_fd()) }.map(drop)
}

/// Send the samples of `fd` to the ring buffer mapped on `output`.
pub(crate) fn set_output(fd: &OwnedFd, output: RawFd) -> nix::Result<()> {
    unsafe { perf_ioc_set_output(fd.as_raw_fd(), output) }.map(drop)
}

/// Identifier the kernel writes in the `PERF_SAMPLE_IDENTIFIER` field.
pub(crate) fn event_id(fd: &OwnedFd) -> nix::Result<u64> {
    let mut id = 0u64;
    unsafe { perf_ioc_id(fd.as_raw_fd(), &mut id) }?;
    Ok(id)
}

// Offsets of data_head and data_tail in `struct perf_event_mmap_page`.
const DATA_HEAD_OFFSET: usize = 1024;
const DATA_TAIL_OFFSET: usize = 1032;
const HEADER_SIZE: usize = 8;

/// Mapped perf ring buffer: one metadata page followed by `pages` data pages.
pub(crate) struct RingBuffer {
    fd: RawFd,
    base: *mut u8,
    len: usize,
    page_size: usize,
    data_size: usize,
    scratch: Vec<u8>,
}

// The mapping is only accessed through &mut self.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Map the ring buffer of `fd`. `pages` must be a power of two.
    /// The caller keeps `fd` open for the lifetime of the buffer.
    pub(crate) fn new(fd: &OwnedFd, pages: usize) -> io::Result<Self> {
        let page_size = page_size();
        let data_size = page_size * pages;
        let len = page_size + data_size;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: fd.as_raw_fd(),
            base: base as *mut u8,
            len,
            page_size,
            data_size,
            scratch: Vec::new(),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    fn head(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(DATA_HEAD_OFFSET) as *const AtomicU64) }
    }

    fn tail(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(DATA_TAIL_OFFSET) as *const AtomicU64) }
    }

    /// Consume every record available, passing its type and body to `f`.
    pub(crate) fn drain(&mut self, mut f: impl FnMut(u32, &[u8])) {
        let head = self.head().load(Ordering::Acquire);
        let mut tail = self.tail().load(Ordering::Relaxed);
        while tail < head {
            let mut header = [0u8; HEADER_SIZE];
            self.copy_out(tail, &mut header);
            let kind = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
            let size = u16::from_ne_bytes([header[6], header[7]]) as usize;
            if size < HEADER_SIZE || tail + size as u64 > head {
                log::warn!("corrupted perf record of size {size}, skipping buffer");
                tail = head;
                break;
            }
            let mut record = mem::take(&mut self.scratch);
            record.resize(size, 0);
            self.copy_out(tail, &mut record);
            f(kind, &record[HEADER_SIZE..]);
            self.scratch = record;
            tail += size as u64;
        }
        self.tail().store(tail, Ordering::Release);
    }

    /// Copy `out.len()` bytes starting at ring position `position`, wrapping around.
    fn copy_out(&self, position: u64, out: &mut [u8]) {
        let start = (position % self.data_size as u64) as usize;
        let first = out.len().min(self.data_size - start);
        unsafe {
            let data = self.base.add(self.page_size);
            ptr::copy_nonoverlapping(data.add(start), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(data, out.as_mut_ptr().add(first), out.len() - first);
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

pub fn online_cpus() -> io::Result<Vec<u32>> {
    let content = fs::read_to_string(ONLINE_CPUS)?;
    parse_cpu_list(&content).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Parse a kernel cpu list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>, String> {
    let mut cpus = Vec::new();
    for range in list.trim().split(',').filter(|range| !range.is_empty()) {
        let parse = |cpu: &str| {
            cpu.trim()
                .parse::<u32>()
                .map_err(|err| format!("invalid cpu {cpu}: {err}"))
        };
        match range.split_once('-') {
            Some((first, last)) => {
                let (first, last) = (parse(first)?, parse(last)?);
                if first > last {
                    return Err(format!("invalid cpu range {range}"));
                }
                cpus.extend(first..=last);
            }
            None => cpus.push(parse(range)?),
        }
    }
    Ok(cpus)
}
