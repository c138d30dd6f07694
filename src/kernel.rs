/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Memory mappings of shared buffers, and diff construction/application */
use crate::tag;
use nix::errno::Errno;
use nix::libc;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU8, Ordering};

/** A memory mapped buffer from a file, which may be externally modified.
 *
 * The application on the other end of the proxied connection writes to the
 * same pages while the diff code reads them, so a plain `&[u8]` view would
 * be unsound; reads must go through atomics, which the compiler cannot
 * assume to return the same value twice. Wayland communication acts as the
 * synchronization point, so Relaxed loads and stores suffice. */
pub struct ExternalMapping {
    addr: *mut libc::c_void,
    size: usize,
}

// SAFETY: only an atomic view of the data is exposed; `.addr` and `.size`
// never change during the object's lifespan, so access from several threads
// and moves between threads are fine.
unsafe impl Send for ExternalMapping {}
unsafe impl Sync for ExternalMapping {}

impl Drop for ExternalMapping {
    fn drop(&mut self) {
        if self.size > 0 {
            let ret = unsafe {
                /* SAFETY: addr[..size] was mmapped and addr is not null */
                libc::munmap(self.addr, self.size)
            };
            assert!(ret != libc::EINVAL);
        }
    }
}

impl ExternalMapping {
    pub fn new(fd: &OwnedFd, size: usize) -> Result<ExternalMapping, String> {
        if size == 0 {
            return Ok(ExternalMapping {
                addr: std::ptr::null_mut(),
                size: 0,
            });
        }
        if size > isize::MAX as usize {
            return Err(tag!("Failed to mmap {} bytes, region too large", size));
        }

        let addr: *mut libc::c_void = unsafe {
            /* SAFETY: external call; no references to existing memory; if
             * successful, allocates at least `size` bytes */
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            Err(tag!("Failed to mmap {} bytes: {}", size, Errno::last_raw()))
        } else {
            assert!(!addr.is_null());
            /* mmap page-aligns, so 64-alignment holds */
            assert!(addr as usize % 64 == 0);
            Ok(ExternalMapping { addr, size })
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn get_u8(&self) -> &[AtomicU8] {
        if self.size == 0 {
            &[]
        } else {
            unsafe {
                /* SAFETY: no alignment requirement; allocation is self.size
                 * bytes, which was checked < isize::MAX; addr is not null;
                 * &AtomicU8 permits external modification at any time, and
                 * no &mut is ever derived from self.addr */
                std::slice::from_raw_parts(self.addr as *const AtomicU8, self.size)
            }
        }
    }
}

/* DMA_BUF_IOCTL_SYNC, to bracket CPU access to a mapped DMABUF */
pub const DMA_BUF_SYNC_READ: u64 = 0x1;
pub const DMA_BUF_SYNC_WRITE: u64 = 0x2;
pub const DMA_BUF_SYNC_START: u64 = 0x0;
pub const DMA_BUF_SYNC_END: u64 = 0x4;
#[cfg(target_os = "linux")]
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x40086200; /* _IOW('b', 0, u64) */

#[cfg(target_os = "linux")]
pub fn dmabuf_sync(fd: &OwnedFd, flags: u64) -> Result<(), String> {
    #[repr(C)]
    struct DmaBufSync {
        flags: u64,
    }
    loop {
        let sync = DmaBufSync { flags };
        let ret = unsafe {
            /* SAFETY: fd is open; the ioctl reads 8 bytes from the given pointer */
            libc::ioctl(fd.as_raw_fd(), DMA_BUF_IOCTL_SYNC, &sync)
        };
        if ret == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EINTR | Errno::EAGAIN => continue,
            /* Not actually a dmabuf (e.g. the memfd stand-in used when
             * replicating on a GPU-less endpoint); CPU access needs no fence */
            Errno::ENOTTY | Errno::EINVAL => return Ok(()),
            e => {
                return Err(tag!("DMABUF sync ioctl (flags {:x}) failed: {}", flags, e));
            }
        }
    }
}
#[cfg(not(target_os = "linux"))]
pub fn dmabuf_sync(_fd: &OwnedFd, _flags: u64) -> Result<(), String> {
    Ok(())
}

pub fn copy_from_mapping(dest: &mut [u8], fd: &ExternalMapping, start: usize) {
    let byte_level = &fd.get_u8();
    for i in 0..dest.len() {
        dest[i] = byte_level[i + start].load(Ordering::Relaxed);
    }
}

pub fn copy_onto_mapping(src: &[u8], fd: &ExternalMapping, start: usize) {
    let byte_level = &fd.get_u8();
    for i in 0..src.len() {
        byte_level[i + start].store(src[i], Ordering::Relaxed);
    }
}

/* Diff scan granularity: buffers are compared in chunks of this many bytes,
 * and consecutive differing chunks coalesce into one segment */
pub const DIFF_BLOCK_SIZE: usize = 64;

/* An unchanged gap shorter than this does not end a segment; segment
 * headers plus padding cost up to 24 bytes, so tiny gaps are not worth it */
const SKIP_GAP_LEN: usize = 256;

/** Upper bound on the space [construct_diff] may need for the given intervals */
pub fn diff_space_bound(intervals: &[(u32, u32)]) -> usize {
    let mut space = 16; /* sentinel */
    for iv in intervals {
        assert!(iv.0 < iv.1);
        space += crate::util::align16(8 + (iv.1 - iv.0) as usize) + 16;
    }
    space
}

/* Load one scan block (possibly short, at the buffer tail) from the mapping */
fn load_block(buf: &mut [u8], map: &[AtomicU8], start: usize) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = map[start + i].load(Ordering::Relaxed);
    }
}

struct SegmentWriter<'a> {
    diff: &'a mut [u8],
    len: usize,
    /* Offset in diff of the open segment's header, if any */
    seg_header: Option<usize>,
    /* Bytes of trailing unchanged blocks currently included in the segment */
    pending_gap: usize,
}

impl SegmentWriter<'_> {
    fn push_block(&mut self, offset: usize, block: &[u8], changed: bool) {
        if self.seg_header.is_none() {
            if !changed {
                return;
            }
            /* Open a segment at this offset */
            self.diff[self.len..self.len + 4].copy_from_slice(&(offset as u32).to_le_bytes());
            self.diff[self.len + 4..self.len + 8].copy_from_slice(&0_u32.to_le_bytes());
            self.seg_header = Some(self.len);
            self.len += 8;
            self.pending_gap = 0;
        }
        self.diff[self.len..self.len + block.len()].copy_from_slice(block);
        self.len += block.len();
        if changed {
            self.pending_gap = 0;
        } else {
            self.pending_gap += block.len();
            if self.pending_gap > SKIP_GAP_LEN {
                self.close_segment();
            }
        }
    }

    fn close_segment(&mut self) {
        let Some(hdr) = self.seg_header.take() else {
            return;
        };
        /* Unchanged trailing blocks do not need to be sent */
        self.len -= self.pending_gap;
        self.pending_gap = 0;
        let seg_len = (self.len - hdr - 8) as u32;
        assert!(seg_len > 0);
        self.diff[hdr + 4..hdr + 8].copy_from_slice(&seg_len.to_le_bytes());
        /* Pad so the next segment header is 16-byte aligned */
        let target = crate::util::align16(self.len);
        self.diff[self.len..target].fill(0);
        self.len = target;
    }

    fn finish(mut self) -> usize {
        self.close_segment();
        if self.len == 0 {
            return 0;
        }
        /* Zero-length sentinel terminates the stream */
        self.diff[self.len..self.len + 16].fill(0);
        self.len + 16
    }
}

/** Construct a diff of the mapped contents against the mirror, within the
 * given intervals, updating the mirror to match as a side effect.
 *
 * Interval starts must be multiples of [DIFF_BLOCK_SIZE]; ends are clipped
 * to the buffer size. `mirror` covers `[mirror_base, mirror_base+len)` of
 * the buffer and must contain every interval.
 *
 * The output is a sequence of `(u32 offset, u32 length, bytes)` segments,
 * each padded to 16 bytes, closed by a zero-length sentinel. Returns the
 * total diff length, or 0 if nothing changed. */
pub fn construct_diff(
    diff: &mut [u8],
    fd: &ExternalMapping,
    intervals: &[(u32, u32)],
    mirror: &mut [u8],
    mirror_base: usize,
) -> usize {
    let map = fd.get_u8();
    let size = map.len();

    let mut w = SegmentWriter {
        diff,
        len: 0,
        seg_header: None,
        pending_gap: 0,
    };

    let mut block = [0_u8; DIFF_BLOCK_SIZE];
    for iv in intervals {
        assert!(iv.0 % (DIFF_BLOCK_SIZE as u32) == 0 && iv.0 < iv.1);
        let lo = iv.0 as usize;
        let hi = std::cmp::min(iv.1 as usize, size);
        assert!(mirror_base <= lo && hi <= mirror_base + mirror.len());

        let mut pos = lo;
        while pos < hi {
            let blen = std::cmp::min(DIFF_BLOCK_SIZE, hi - pos);
            let cur = &mut block[..blen];
            load_block(cur, map, pos);
            let mir = &mut mirror[pos - mirror_base..pos - mirror_base + blen];
            let changed = cur != mir;
            if changed {
                mir.copy_from_slice(cur);
            }
            w.push_block(pos, cur, changed);
            pos += blen;
        }
        /* Segments do not span interval boundaries */
        w.close_segment();
    }

    w.finish()
}

/** Report the byte span `[start, end)` that a diff stream will update */
pub fn compute_diff_span(diff: &[u8], buf_len: usize) -> Result<(usize, usize), String> {
    let mut lo = buf_len;
    let mut hi = 0;
    let mut pos = 0;
    loop {
        if pos + 8 > diff.len() {
            return Err(tag!("Diff stream truncated at {}", pos));
        }
        let offset = u32::from_le_bytes(diff[pos..pos + 4].try_into().unwrap()) as usize;
        let length = u32::from_le_bytes(diff[pos + 4..pos + 8].try_into().unwrap()) as usize;
        if length == 0 {
            break;
        }
        let end = offset
            .checked_add(length)
            .ok_or_else(|| tag!("Diff segment overflows"))?;
        if end > buf_len {
            return Err(tag!(
                "Diff segment [{}, {}) exceeds buffer size {}",
                offset,
                end,
                buf_len
            ));
        }
        lo = std::cmp::min(lo, offset);
        hi = std::cmp::max(hi, end);
        pos += crate::util::align16(8 + length);
    }
    if lo >= hi {
        return Err(tag!("Diff stream without segments"));
    }
    Ok((lo, hi))
}

/** Apply a diff stream onto the mapping and the mirror.
 *
 * `mirror` covers `[mirror_base, mirror_base+len)` of the buffer. Malformed
 * or out-of-bounds segments produce an error and leave a partial update;
 * the caller terminates the session in that case. */
pub fn apply_diff(
    diff: &[u8],
    fd: &ExternalMapping,
    mirror: &mut [u8],
    mirror_base: usize,
) -> Result<(), String> {
    let map = fd.get_u8();
    let mut pos = 0;
    loop {
        if pos + 8 > diff.len() {
            return Err(tag!("Diff stream truncated at {}", pos));
        }
        let offset = u32::from_le_bytes(diff[pos..pos + 4].try_into().unwrap()) as usize;
        let length = u32::from_le_bytes(diff[pos + 4..pos + 8].try_into().unwrap()) as usize;
        if length == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(length)
            .ok_or_else(|| tag!("Diff segment overflows"))?;
        if end > map.len() || offset < mirror_base || end > mirror_base + mirror.len() {
            return Err(tag!(
                "Diff segment [{}, {}) out of bounds (buffer {}, mirror [{}, {}))",
                offset,
                end,
                map.len(),
                mirror_base,
                mirror_base + mirror.len()
            ));
        }
        let data_end = pos + 8 + length;
        if data_end > diff.len() {
            return Err(tag!("Diff segment data truncated at {}", pos));
        }
        let payload = &diff[pos + 8..data_end];
        for (i, b) in payload.iter().enumerate() {
            map[offset + i].store(*b, Ordering::Relaxed);
        }
        mirror[offset - mirror_base..end - mirror_base].copy_from_slice(payload);
        pos += crate::util::align16(8 + length);
    }
}
