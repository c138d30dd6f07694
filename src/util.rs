/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Misc utilities, shared option types, and the process shutdown flag */
use nix::fcntl;
use nix::sys::signal;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/** Like `format!`, but prepends file and line number.
 *
 * Example: `tag!("Failed to X: {} {}", arg1, arg2)` */
#[macro_export]
macro_rules! tag {
    ($x:tt) => {
        format!(concat!(std::file!(), ":", std::line!(), ": ", $x))
    };
    ($x:tt, $($arg:tt)+) => {
        format!(concat!(std::file!(), ":", std::line!(), ": ", $x), $($arg)+)
    };
}

/* Connection token header layout. The low 16 bits carry flags, the high 16
 * bits the protocol version; endpoints refuse a mismatched version. The
 * fixed bit doubles as a byte-order check, since a byte-swapped header
 * would place it in the top half. */
pub const CONN_FIXED_BIT: u32 = 0x1;
pub const CONN_UPDATE_BIT: u32 = 0x1 << 1;
pub const CONN_RECONNECTABLE_BIT: u32 = 0x1 << 2;
pub const PROTOCOL_VERSION: u32 = 0x1;

/** Maximum length of a Unix socket path, including the NUL terminator */
pub const SUN_PATH_MAX: usize = 108;

pub fn align(x: usize, y: usize) -> usize {
    y * ((x.checked_add(y - 1).unwrap()) / y)
}
pub fn align16(x: usize) -> usize {
    align(x, 16)
}
pub fn cat2x4(x: [u8; 4], y: [u8; 4]) -> [u8; 8] {
    [x[0], x[1], x[2], x[3], y[0], y[1], y[2], y[3]]
}
pub fn cat3x4(x: [u8; 4], y: [u8; 4], z: [u8; 4]) -> [u8; 12] {
    [
        x[0], x[1], x[2], x[3], y[0], y[1], y[2], y[3], z[0], z[1], z[2], z[3],
    ]
}
pub fn cat4x4(x: [u8; 4], y: [u8; 4], z: [u8; 4], a: [u8; 4]) -> [u8; 16] {
    [
        x[0], x[1], x[2], x[3], y[0], y[1], y[2], y[3], z[0], z[1], z[2], z[3], a[0], a[1], a[2],
        a[3],
    ]
}
/** Evenly partition `[lo, hi)`; returns the start of the `index`-th of `nparts` pieces */
pub fn split_interval(lo: u32, hi: u32, nparts: u32, index: u32) -> u32 {
    assert!(nparts < 1 << 15 && hi - lo < 1 << 31);
    lo + index * ((hi - lo) / nparts) + (index * ((hi - lo) % nparts)) / nparts
}
pub fn ceildiv(v: u32, u: u32) -> u32 {
    v.div_ceil(u)
}
/* Split u64 into high (32:63) and low (0:31) parts */
pub fn split_u64(x: u64) -> (u32, u32) {
    ((x >> 32) as u32, x as u32)
}
pub fn join_u64(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | (lo as u64)
}

/* A heap-allocated 64-aligned array */
pub struct AlignedArray {
    data: *mut u8,
    size: usize,
}
unsafe impl Send for AlignedArray {}
unsafe impl Sync for AlignedArray {}

impl AlignedArray {
    pub fn new(size: usize) -> AlignedArray {
        if size == 0 {
            AlignedArray {
                data: std::ptr::null_mut(),
                size: 0,
            }
        } else {
            let layout = std::alloc::Layout::from_size_align(size, 64).unwrap();
            unsafe {
                // SAFETY: layout size was checked to be > 0
                let mem = std::alloc::alloc_zeroed(layout).cast::<u8>();
                assert!(!mem.is_null());
                AlignedArray { data: mem, size }
            }
        }
    }
    /* Returns (ptr, len); ptr is promised to be 64 aligned */
    pub fn get_parts(&self) -> (*mut u8, usize) {
        (self.data, self.size)
    }
    pub fn get_mut(&mut self) -> &mut [u8] {
        if self.size == 0 {
            return &mut [];
        }
        unsafe {
            // SAFETY: self.data is not null since size > 0 was checked;
            // size matches the allocated amount, and the &mut self argument
            // ensures no other slice borrowed from this array is live
            &mut *std::ptr::slice_from_raw_parts_mut(self.data, self.size)
        }
    }
    pub fn get(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }
        unsafe {
            // SAFETY: data is not null and allocated with length self.size
            &*std::ptr::slice_from_raw_parts(self.data, self.size)
        }
    }
}
impl Drop for AlignedArray {
    fn drop(&mut self) {
        if self.size > 0 {
            let layout = std::alloc::Layout::from_size_align(self.size, 64).unwrap();
            unsafe {
                // SAFETY: self.data is not null and was allocated with the same layout
                std::alloc::dealloc(self.data, layout);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4(i8),
    Zstd(i8),
}
impl FromStr for Compression {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const FAILURE: &str = "Compression should have format: 'none', 'lz4[=#]', or 'zstd[=#]'";
        if s == "none" {
            Ok(Compression::None)
        } else if let Some(rest) = s.strip_prefix("lz4") {
            let lvl = if rest.is_empty() {
                0
            } else if let Some(suffix) = rest.strip_prefix('=') {
                suffix.parse::<i8>().map_err(|_| FAILURE)?
            } else {
                return Err(FAILURE);
            };
            Ok(Compression::Lz4(lvl))
        } else if let Some(rest) = s.strip_prefix("zstd") {
            let lvl = if rest.is_empty() {
                0
            } else if let Some(suffix) = rest.strip_prefix('=') {
                suffix.parse::<i8>().map_err(|_| FAILURE)?
            } else {
                return Err(FAILURE);
            };
            Ok(Compression::Zstd(lvl))
        } else {
            Err(FAILURE)
        }
    }
}
impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Lz4(i) => {
                if *i == 0 {
                    write!(f, "lz4")
                } else {
                    write!(f, "lz4={}", i)
                }
            }
            Compression::Zstd(i) => {
                if *i == 0 {
                    write!(f, "zstd")
                } else {
                    write!(f, "zstd={}", i)
                }
            }
        }
    }
}
#[test]
fn compression_setting_roundtrip() {
    assert_eq!(
        Compression::from_str(&Compression::None.to_string()),
        Ok(Compression::None)
    );
    for i in i8::MIN..=i8::MAX {
        assert_eq!(
            Compression::from_str(&Compression::Lz4(i).to_string()),
            Ok(Compression::Lz4(i))
        );
        assert_eq!(
            Compression::from_str(&Compression::Zstd(i).to_string()),
            Ok(Compression::Zstd(i))
        );
    }
}

/** Video encoding setting for DMABUF contents. Encoding itself is performed
 * by an external integration; the setting is recorded here so that it can
 * be forwarded to connection handlers. */
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Video {
    #[default]
    Off,
    Vaapi,
    Sw,
}
impl FromStr for Video {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Video::Off),
            "vaapi" => Ok(Video::Vaapi),
            "sw" => Ok(Video::Sw),
            _ => Err("Video setting should be one of: 'none', 'vaapi', 'sw'"),
        }
    }
}
impl fmt::Display for Video {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Video::Off => write!(f, "none"),
            Video::Vaapi => write!(f, "vaapi"),
            Video::Sw => write!(f, "sw"),
        }
    }
}

/** Options shared between the supervisor and its connection workers */
#[derive(Debug, Clone)]
pub struct Options {
    /** Whether to print debug messages */
    pub debug: bool,
    /** Compression applied to fill and diff payloads */
    pub compression: Compression,
    /** Video encoding setting, forwarded to the codec integration */
    pub video: Video,
    /** Number of worker threads for diff/compress/apply tasks; 0 = hardware threads / 2 */
    pub threads: u32,
    /* If true, reject DMABUF replication entirely */
    pub no_gpu: bool,
    /* Preferred DRM render node, if the default heuristic is wrong */
    pub dmabuf_device: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            debug: false,
            compression: Compression::None,
            video: Video::Off,
            threads: 1,
            no_gpu: false,
            dmabuf_device: None,
        }
    }
}

/** Resolve a thread-count option to a concrete pool size */
pub fn resolve_thread_count(threads: u32) -> usize {
    if threads == 0 {
        std::cmp::max(1, std::thread::available_parallelism().unwrap().get() / 2)
    } else {
        threads as usize
    }
}

/** Set the close-on-exec flag for a file descriptor */
pub fn set_cloexec(fd: &OwnedFd, cloexec: bool) -> Result<(), String> {
    fcntl::fcntl(
        fd.as_raw_fd(),
        fcntl::FcntlArg::F_SETFD(if cloexec {
            fcntl::FdFlag::FD_CLOEXEC
        } else {
            fcntl::FdFlag::empty()
        }),
    )
    .map_err(|x| tag!("Failed to set cloexec flag: {:?}", x))?;
    Ok(())
}

/** Set the O_NONBLOCK flag for the file description */
pub fn set_nonblock(fd: &OwnedFd) -> Result<(), String> {
    fcntl::fcntl(
        fd.as_raw_fd(),
        fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
    )
    .map_err(|x| tag!("Failed to set nonblocking: {:?}", x))?;
    Ok(())
}

/** Write all of `data` to a blocking file descriptor, retrying on EINTR */
pub fn write_all(fd: &OwnedFd, data: &[u8]) -> Result<(), String> {
    let mut nwritten = 0;
    while nwritten < data.len() {
        match nix::unistd::write(fd, &data[nwritten..]) {
            Ok(n) => {
                nwritten += n;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                return Err(tag!("Failed to write {} bytes: {}", data.len(), e));
            }
        }
    }
    Ok(())
}

/* Process-wide shutdown flag, set from the SIGINT/SIGTERM handlers and
 * checked at every poll loop iteration. */
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn shutdown_handler(_signo: i32) {
    SHUTDOWN_FLAG.store(true, Ordering::Release);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_FLAG.load(Ordering::Acquire)
}

/** Install shutdown signal handlers, and return a poll mask in which the
 * shutdown signals are not blocked.
 *
 * The signals stay blocked outside of ppoll; this avoids the race in which
 * a signal arrives after the loop checks the flag but before it sleeps. */
pub fn setup_shutdown_handler() -> Result<signal::SigSet, String> {
    let mut mask = signal::SigSet::empty();
    mask.add(signal::SIGINT);
    mask.add(signal::SIGTERM);
    let mut pollmask = mask
        .thread_swap_mask(signal::SigmaskHow::SIG_BLOCK)
        .map_err(|x| tag!("Failed to set sigmask: {}", x))?;
    pollmask.remove(signal::SIGINT);
    pollmask.remove(signal::SIGTERM);

    let sigaction = signal::SigAction::new(
        signal::SigHandler::Handler(shutdown_handler),
        signal::SaFlags::SA_NOCLDSTOP,
        signal::SigSet::empty(),
    );
    unsafe {
        // SAFETY: shutdown_handler only stores to an atomic and is
        // async-signal-safe; overwriting any prior disposition is intended
        signal::sigaction(signal::Signal::SIGINT, &sigaction)
            .map_err(|x| tag!("Failed to set sigaction: {}", x))?;
        signal::sigaction(signal::Signal::SIGTERM, &sigaction)
            .map_err(|x| tag!("Failed to set sigaction: {}", x))?;
    }

    Ok(pollmask)
}

#[test]
fn test_split_interval() {
    for (lo, hi) in [(0_u32, 13), (64, 128), (1000, 163840)] {
        for nparts in 1..8 {
            let mut prev = lo;
            assert_eq!(split_interval(lo, hi, nparts, 0), lo);
            for i in 1..=nparts {
                let x = split_interval(lo, hi, nparts, i);
                assert!(x >= prev);
                prev = x;
            }
            assert_eq!(prev, hi);
        }
    }
}
