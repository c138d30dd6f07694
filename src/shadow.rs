/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! The shadow-fd table: translation, dirty tracking, and update collection/application */
use crate::compress::*;
use crate::damage::*;
use crate::kernel::*;
use crate::mirror::Mirror;
use crate::pool::{ThreadCache, WorkPool};
use crate::tag;
use crate::transfer::*;
use crate::util::*;
use log::debug;
use nix::sys::memfd;
use nix::sys::stat;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/** A unique number identifying a shadow entry within a session.
 *
 * The server side allocates negative RIDs, the client side positive ones,
 * so the two endpoints never collide. RIDs are not reused. */
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Rid(pub i32);
impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum FdKind {
    File,
    Dmabuf,
    /** We read from the fd and ship the stream to the peer */
    PipeRead,
    /** We write bytes received from the peer into the fd */
    PipeWrite,
    /** Bidirectional pipe-like stream (socketpair-backed fds) */
    Socket,
}

/** Metadata describing a DMABUF's layout, carried in its open record */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufMeta {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub modifier: u64,
    pub offsets: [u32; 4],
    pub strides: [u32; 4],
    pub using_planes: [bool; 4],
}

pub const DMABUF_META_LEN: usize = 56;

impl DmabufMeta {
    pub fn to_bytes(&self) -> [u8; DMABUF_META_LEN] {
        let mut out = [0_u8; DMABUF_META_LEN];
        out[0..4].copy_from_slice(&self.width.to_le_bytes());
        out[4..8].copy_from_slice(&self.height.to_le_bytes());
        out[8..12].copy_from_slice(&self.format.to_le_bytes());
        let (hi, lo) = split_u64(self.modifier);
        out[12..16].copy_from_slice(&hi.to_le_bytes());
        out[16..20].copy_from_slice(&lo.to_le_bytes());
        for i in 0..4 {
            out[20 + 4 * i..24 + 4 * i].copy_from_slice(&self.offsets[i].to_le_bytes());
            out[36 + 4 * i..40 + 4 * i].copy_from_slice(&self.strides[i].to_le_bytes());
        }
        let mut planes = 0_u32;
        for (i, used) in self.using_planes.iter().enumerate() {
            if *used {
                planes |= 1 << i;
            }
        }
        out[52..56].copy_from_slice(&planes.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<DmabufMeta, String> {
        if buf.len() < DMABUF_META_LEN {
            return Err(tag!("DMABUF metadata block too short: {}", buf.len()));
        }
        let rd = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
        let planes = rd(52);
        Ok(DmabufMeta {
            width: rd(0),
            height: rd(4),
            format: rd(8),
            modifier: join_u64(rd(12), rd(16)),
            offsets: [rd(20), rd(24), rd(28), rd(32)],
            strides: [rd(36), rd(40), rd(44), rd(48)],
            using_planes: [
                planes & 1 != 0,
                planes & 2 != 0,
                planes & 4 != 0,
                planes & 8 != 0,
            ],
        })
    }
}

/** Buffer state shared with worker-pool tasks */
pub struct ShadowCore {
    pub mapping: ExternalMapping,
    pub mirror: Mirror,
    /* Set for DMABUFs: a dup of the buffer fd, for CPU sync bracketing */
    pub sync_fd: Option<OwnedFd>,
}

/** State for memory-backed shadow entries (files and DMABUFs) */
pub struct BufferState {
    pub fd: OwnedFd,
    pub size: usize,
    /* Size the remote side has been told about */
    remote_size: usize,
    pub damage: Damage,
    pub is_dirty: bool,
    /* Option so the Arc can be replaced on resize; None only transiently */
    core: Option<Arc<ShadowCore>>,
    /* Apply tasks dispatched to the pool but not yet completed */
    pending_apply: Arc<AtomicU64>,
    /* First content transfer (and any transfer after truncation) sends the
     * whole buffer as fill records instead of a diff */
    needs_fill: bool,
    pub meta: Option<DmabufMeta>,
}

impl BufferState {
    pub fn core(&self) -> &Arc<ShadowCore> {
        self.core.as_ref().unwrap()
    }
    pub fn pending_apply_tasks(&self) -> u64 {
        self.pending_apply.load(Ordering::Acquire)
    }
}

/** State for stream-like shadow entries (pipes and sockets) */
pub struct PipeState {
    pub fd: OwnedFd,
    /** On the reconstructing side, the end of the freshly created pipe that
     * is handed out to the local protocol layer */
    pub export_fd: Option<OwnedFd>,
    /* Bytes read from fd, awaiting transfer to the peer */
    inbuf: Vec<u8>,
    /* Bytes received from the peer, awaiting write into fd */
    outbuf: VecDeque<u8>,
    pub program_closed: bool,
    pub channel_closed: bool,
    close_sent: bool,
}

pub enum ShadowVariant {
    Buffer(BufferState),
    Pipe(PipeState),
}

/** Metadata and content for one file descriptor replicated over the channel */
pub struct ShadowFd {
    pub remote_id: Rid,
    pub kind: FdKind,
    /** Number of protocol objects / pending transfers referencing the entry;
     * the entry is destroyed exactly once, when this reaches zero. */
    pub refcount: u32,
    /* True until the open record for this entry has been queued */
    pub only_here: bool,
    pub data: ShadowVariant,
}

impl ShadowFd {
    pub fn buffer(&self) -> Result<&BufferState, String> {
        match &self.data {
            ShadowVariant::Buffer(b) => Ok(b),
            ShadowVariant::Pipe(_) => Err(tag!("Entry RID {} is not a buffer", self.remote_id)),
        }
    }
    pub fn pipe(&self) -> Result<&PipeState, String> {
        match &self.data {
            ShadowVariant::Pipe(p) => Ok(p),
            ShadowVariant::Buffer(_) => Err(tag!("Entry RID {} is not a pipe", self.remote_id)),
        }
    }
    /** Whether the pipe has stream data or a close record to transfer */
    pub fn pipe_needs_collect(&self) -> bool {
        match &self.data {
            ShadowVariant::Pipe(p) => !p.inbuf.is_empty() || (p.program_closed && !p.close_sent),
            ShadowVariant::Buffer(_) => false,
        }
    }
}

/** The shadow-fd translation table.
 *
 * Owned and mutated by a single connection worker; pool tasks only touch the
 * `Arc<ShadowCore>` contents, under damage-interval partitioning. */
pub struct TranslationMap {
    map: BTreeMap<Rid, Rc<RefCell<ShadowFd>>>,
    /* (st_dev, st_ino) of translated files, to catch re-offered fds */
    by_ident: BTreeMap<(u64, u64), Rid>,
    max_local_id: i32,
    pub compression: Compression,
}

/* Per-task shard size for fill and diff work, in bytes */
const DIFF_CHUNKSIZE: usize = 262144;

pub fn make_memfd(size: usize) -> Result<OwnedFd, String> {
    let fd = memfd::memfd_create(
        c"/waybridge-shadow",
        memfd::MemFdCreateFlag::MFD_CLOEXEC | memfd::MemFdCreateFlag::MFD_ALLOW_SEALING,
    )
    .map_err(|x| tag!("Failed to create memfd: {}", x))?;
    nix::unistd::ftruncate(&fd, size as nix::libc::off_t)
        .map_err(|x| tag!("Failed to resize memfd to {}: {}", size, x))?;
    Ok(fd)
}

fn make_core(fd: &OwnedFd, size: usize, is_dmabuf: bool) -> Result<Arc<ShadowCore>, String> {
    let sync_fd = if is_dmabuf {
        Some(
            fd.try_clone()
                .map_err(|x| tag!("Failed to dup buffer fd: {}", x))?,
        )
    } else {
        None
    };
    Ok(Arc::new(ShadowCore {
        mapping: ExternalMapping::new(fd, size)?,
        mirror: Mirror::new(size),
        sync_fd,
    }))
}

/** Split damage intervals into shards of roughly [DIFF_CHUNKSIZE] bytes,
 * cutting only at 64-byte boundaries */
fn shard_intervals(intervals: &[(usize, usize)], max_chunk: usize) -> Vec<Vec<(u32, u32)>> {
    let mut shards = Vec::new();
    let mut current: Vec<(u32, u32)> = Vec::new();
    let mut current_len = 0_usize;
    for iv in intervals {
        let mut lo = iv.0;
        while lo < iv.1 {
            let room = max_chunk.saturating_sub(current_len);
            let take = std::cmp::min(iv.1 - lo, std::cmp::max(64, 64 * (room / 64)));
            current.push((lo as u32, (lo + take) as u32));
            current_len += take;
            lo += take;
            if current_len >= max_chunk {
                shards.push(std::mem::take(&mut current));
                current_len = 0;
            }
        }
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

/* Task definitions. Tasks append finished wire frames to the transfer
 * buffer under its lock, tagged with the message number reserved at
 * enqueue time. */

pub struct DiffTask {
    rid: i32,
    compression: Compression,
    core: Arc<ShadowCore>,
    intervals: Vec<(u32, u32)>,
    msgno: u64,
    queue: Arc<TransferBuffer>,
}

pub struct FillTask {
    rid: i32,
    compression: Compression,
    core: Arc<ShadowCore>,
    start: u32,
    end: u32,
    msgno: u64,
    queue: Arc<TransferBuffer>,
}

pub struct ApplyTask {
    compression: Compression,
    core: Arc<ShadowCore>,
    /* Fill messages target [start, end); diff messages reuse `start` for
     * the uncompressed stream length and leave `end` zero */
    is_diff: bool,
    start: u32,
    end: u32,
    data: Vec<u8>,
    pending: Arc<AtomicU64>,
}

/** A task to be performed by a worker thread */
pub enum Task {
    DiffRegion(DiffTask),
    CompressBlock(FillTask),
    DecompressBlock(ApplyTask),
    ApplyDiff(ApplyTask),
    Stop,
    #[cfg(test)]
    Echo {
        queue: Arc<TransferBuffer>,
        msgno: u64,
        payload: Vec<u8>,
    },
    #[cfg(test)]
    Fail { message: String },
}

fn run_diff_task(task: DiffTask, cache: &mut ThreadCache) -> Result<Option<Task>, String> {
    let size = task.core.mapping.len();
    let first = task.intervals.first().unwrap().0 as usize;
    let last = std::cmp::min(task.intervals.last().unwrap().1 as usize, size);

    let space = diff_space_bound(&task.intervals);
    let region = task
        .core
        .mirror
        .get_mut_range(first..last)
        .ok_or_else(|| tag!("Failed to acquire mirror range {}..{}", first, last))?;

    if let Some(ref sfd) = task.core.sync_fd {
        dmabuf_sync(sfd, DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ)?;
    }
    let scratch = cache.scratch(space);
    let diff_len = construct_diff(
        scratch,
        &task.core.mapping,
        &task.intervals,
        region.data,
        first,
    );
    if let Some(ref sfd) = task.core.sync_fd {
        dmabuf_sync(sfd, DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ)?;
    }
    drop(region);

    if diff_len == 0 {
        /* Contents matched the mirror: null message */
        task.queue.complete(task.msgno, Segment::Data(Vec::new()));
        return Ok(None);
    }

    let mut msg = compress_to_vec(
        task.compression,
        &mut cache.comp,
        &cache.large[..diff_len],
        16,
        0,
    )?;
    let unpadded = msg.len();
    let header = cat4x4(
        build_header(MsgType::BufferDiff, unpadded).to_le_bytes(),
        task.rid.to_le_bytes(),
        (diff_len as u32).to_le_bytes(),
        0_u32.to_le_bytes(),
    );
    msg[..16].copy_from_slice(&header);
    msg.resize(align16(unpadded), 0);
    debug!(
        "{} diff task rid={}: raw {} -> msg {}",
        std::thread::current().name().unwrap_or(""),
        task.rid,
        diff_len,
        unpadded
    );
    task.queue.complete(task.msgno, Segment::Data(msg));
    Ok(None)
}

fn run_fill_task(task: FillTask, cache: &mut ThreadCache) -> Result<Option<Task>, String> {
    let len = (task.end - task.start) as usize;

    if let Some(ref sfd) = task.core.sync_fd {
        dmabuf_sync(sfd, DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ)?;
    }
    let scratch = cache.scratch(len);
    copy_from_mapping(scratch, &task.core.mapping, task.start as usize);
    if let Some(ref sfd) = task.core.sync_fd {
        dmabuf_sync(sfd, DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ)?;
    }

    /* The mirror must afterwards equal what was sent */
    let region = task
        .core
        .mirror
        .get_mut_range(task.start as usize..task.end as usize)
        .ok_or_else(|| tag!("Failed to acquire mirror range for fill"))?;
    region.data.copy_from_slice(&cache.large[..len]);
    drop(region);

    let mut msg = compress_to_vec(
        task.compression,
        &mut cache.comp,
        &cache.large[..len],
        16,
        0,
    )?;
    let unpadded = msg.len();
    let header = cat4x4(
        build_header(MsgType::BufferFill, unpadded).to_le_bytes(),
        task.rid.to_le_bytes(),
        task.start.to_le_bytes(),
        task.end.to_le_bytes(),
    );
    msg[..16].copy_from_slice(&header);
    msg.resize(align16(unpadded), 0);
    task.queue.complete(task.msgno, Segment::Data(msg));
    Ok(None)
}

fn run_decompress_task(task: ApplyTask, cache: &mut ThreadCache) -> Result<Option<Task>, String> {
    let raw_len = if task.is_diff {
        task.start as usize
    } else {
        (task.end - task.start) as usize
    };
    let mut raw = vec![0_u8; raw_len];
    decompress_to_slice(task.compression, &mut cache.decomp, &task.data, &mut raw)?;
    Ok(Some(Task::ApplyDiff(ApplyTask {
        compression: Compression::None,
        data: raw,
        ..task
    })))
}

fn run_apply_task(task: ApplyTask) -> Result<Option<Task>, String> {
    let size = task.core.mapping.len();
    if task.is_diff {
        let span = compute_diff_span(&task.data, size)?;
        let region = task
            .core
            .mirror
            .get_mut_range(span.0..span.1)
            .ok_or_else(|| tag!("Failed to acquire mirror range for apply"))?;
        if let Some(ref sfd) = task.core.sync_fd {
            dmabuf_sync(sfd, DMA_BUF_SYNC_START | DMA_BUF_SYNC_WRITE)?;
        }
        let r = apply_diff(&task.data, &task.core.mapping, region.data, span.0);
        if let Some(ref sfd) = task.core.sync_fd {
            dmabuf_sync(sfd, DMA_BUF_SYNC_END | DMA_BUF_SYNC_WRITE)?;
        }
        r?;
    } else {
        let (start, end) = (task.start as usize, task.end as usize);
        if end > size || task.data.len() != end - start {
            return Err(tag!(
                "Fill range [{}, {}) invalid for buffer of size {} with {} payload bytes",
                start,
                end,
                size,
                task.data.len()
            ));
        }
        let region = task
            .core
            .mirror
            .get_mut_range(start..end)
            .ok_or_else(|| tag!("Failed to acquire mirror range for fill apply"))?;
        if let Some(ref sfd) = task.core.sync_fd {
            dmabuf_sync(sfd, DMA_BUF_SYNC_START | DMA_BUF_SYNC_WRITE)?;
        }
        copy_onto_mapping(&task.data, &task.core.mapping, start);
        if let Some(ref sfd) = task.core.sync_fd {
            dmabuf_sync(sfd, DMA_BUF_SYNC_END | DMA_BUF_SYNC_WRITE)?;
        }
        region.data.copy_from_slice(&task.data);
    }
    task.pending.fetch_sub(1, Ordering::AcqRel);
    Ok(None)
}

/** Execute one task; may return a follow-up task to enqueue */
pub fn run_task(task: Task, cache: &mut ThreadCache) -> Result<Option<Task>, String> {
    match task {
        Task::DiffRegion(t) => run_diff_task(t, cache),
        Task::CompressBlock(t) => run_fill_task(t, cache),
        Task::DecompressBlock(t) => run_decompress_task(t, cache),
        Task::ApplyDiff(t) => run_apply_task(t),
        Task::Stop => unreachable!(),
        #[cfg(test)]
        Task::Echo {
            queue,
            msgno,
            payload,
        } => {
            queue.complete(msgno, Segment::Data(payload));
            Ok(None)
        }
        #[cfg(test)]
        Task::Fail { message } => Err(message),
    }
}

impl TranslationMap {
    pub fn new(on_server_side: bool, compression: Compression) -> TranslationMap {
        TranslationMap {
            map: BTreeMap::new(),
            by_ident: BTreeMap::new(),
            max_local_id: if on_server_side { -1 } else { 1 },
            compression,
        }
    }

    fn allocate_rid(&mut self) -> Rid {
        let v = self.max_local_id;
        self.max_local_id = self
            .max_local_id
            .checked_add(self.max_local_id.signum())
            .unwrap();
        Rid(v)
    }

    pub fn lookup(&self, rid: Rid) -> Result<Rc<RefCell<ShadowFd>>, String> {
        self.map
            .get(&rid)
            .cloned()
            .ok_or_else(|| tag!("Unknown shadow RID {}", rid))
    }

    pub fn entries(&self) -> impl Iterator<Item = &Rc<RefCell<ShadowFd>>> {
        self.map.values()
    }

    /** Classify an fd, allocate a shadow entry for it, and return the entry.
     *
     * If the same underlying file was offered before, the duplicate fd is
     * closed and the existing entry returned. DMABUFs require metadata. */
    pub fn translate(
        &mut self,
        fd: OwnedFd,
        hint: FdKind,
        meta: Option<DmabufMeta>,
    ) -> Result<Rc<RefCell<ShadowFd>>, String> {
        if hint == FdKind::Dmabuf {
            let meta = meta.ok_or_else(|| tag!("DMABUF translation requires metadata"))?;
            /* Nominal size: plane 0 covers the (possibly padded) image */
            let size = (meta.strides[0] as usize) * (meta.height as usize);
            return self.insert_buffer(fd, FdKind::Dmabuf, size, Some(meta));
        }

        let st = stat::fstat(fd.as_raw_fd()).map_err(|x| tag!("Failed to fstat fd: {}", x))?;
        let fmt = stat::SFlag::from_bits_truncate(st.st_mode & stat::SFlag::S_IFMT.bits());

        if fmt.contains(stat::SFlag::S_IFREG) {
            let ident = (st.st_dev as u64, st.st_ino as u64);
            if let Some(rid) = self.by_ident.get(&ident) {
                debug!("fd for inode {:?} offered twice, reusing RID {}", ident, rid);
                /* drop(fd) closes the duplicate */
                return self.lookup(*rid);
            }
            let size = st.st_size as usize;
            let entry = self.insert_buffer(fd, FdKind::File, size, None)?;
            self.by_ident.insert(ident, entry.borrow().remote_id);
            return Ok(entry);
        }
        if fmt.contains(stat::SFlag::S_IFIFO) {
            let kind = match hint {
                FdKind::PipeRead | FdKind::PipeWrite => hint,
                _ => {
                    return Err(tag!("Pipe fd requires a read or write direction hint"));
                }
            };
            return self.insert_pipe(fd, kind, None, None);
        }
        if fmt.contains(stat::SFlag::S_IFSOCK) {
            return self.insert_pipe(fd, FdKind::Socket, None, None);
        }
        Err(tag!(
            "Cannot replicate fd of mode {:o} without a usable kind hint",
            st.st_mode
        ))
    }

    fn insert_buffer(
        &mut self,
        fd: OwnedFd,
        kind: FdKind,
        size: usize,
        meta: Option<DmabufMeta>,
    ) -> Result<Rc<RefCell<ShadowFd>>, String> {
        let core = make_core(&fd, size, kind == FdKind::Dmabuf)?;
        let rid = self.allocate_rid();
        let sfd = Rc::new(RefCell::new(ShadowFd {
            remote_id: rid,
            kind,
            refcount: 1,
            only_here: true,
            data: ShadowVariant::Buffer(BufferState {
                fd,
                size,
                remote_size: 0,
                /* DMABUF damage is the full surface unless the protocol
                 * layer supplies a subregion */
                damage: Damage::Nothing,
                is_dirty: false,
                core: Some(core),
                pending_apply: Arc::new(AtomicU64::new(0)),
                needs_fill: true,
                meta,
            }),
        }));
        self.map.insert(rid, sfd.clone());
        Ok(sfd)
    }

    fn insert_pipe(
        &mut self,
        fd: OwnedFd,
        kind: FdKind,
        export_fd: Option<OwnedFd>,
        fixed_rid: Option<Rid>,
    ) -> Result<Rc<RefCell<ShadowFd>>, String> {
        set_nonblock(&fd)?;
        let rid = match fixed_rid {
            Some(r) => r,
            None => self.allocate_rid(),
        };
        let sfd = Rc::new(RefCell::new(ShadowFd {
            remote_id: rid,
            kind,
            refcount: 1,
            only_here: fixed_rid.is_none(),
            data: ShadowVariant::Pipe(PipeState {
                fd,
                export_fd,
                inbuf: Vec::new(),
                outbuf: VecDeque::new(),
                program_closed: false,
                channel_closed: false,
                close_sent: false,
            }),
        }));
        self.map.insert(rid, sfd.clone());
        Ok(sfd)
    }

    /** Union the byte interval into the entry's damage; `None` means "all" */
    pub fn mark_dirty(&self, rid: Rid, interval: Option<(usize, usize)>) -> Result<(), String> {
        let sfd = self.lookup(rid)?;
        let mut b = sfd.borrow_mut();
        let bref = &mut *b;
        match &mut bref.data {
            ShadowVariant::Buffer(buf) => {
                buf.damage.add(interval);
                buf.is_dirty = !buf.damage.is_empty();
                Ok(())
            }
            ShadowVariant::Pipe(_) => Err(tag!("Entry RID {} is not a buffer", rid)),
        }
    }

    /** Take another reference to the entry */
    pub fn acquire(&self, rid: Rid) -> Result<(), String> {
        let sfd = self.lookup(rid)?;
        sfd.borrow_mut().refcount += 1;
        Ok(())
    }

    /** Drop a reference; at zero the entry is unmapped, closed, and freed.
     * Releasing an already-freed RID is an error. */
    pub fn release(&mut self, rid: Rid) -> Result<(), String> {
        let sfd = self.lookup(rid)?;
        let mut b = sfd.borrow_mut();
        assert!(b.refcount > 0);
        b.refcount -= 1;
        let gone = b.refcount == 0;
        drop(b);
        if gone {
            self.map.remove(&rid);
            self.by_ident.retain(|_, v| *v != rid);
            /* mappings and fds are reclaimed when the last Rc drops */
        }
        Ok(())
    }

    /** The protocol layer reports a new size for a shared file. Growth
     * extends mapping and mirror; truncation forces a full resend. */
    pub fn update_size(
        &self,
        rid: Rid,
        new_size: usize,
        pool: &mut WorkPool,
    ) -> Result<(), String> {
        let sfd = self.lookup(rid)?;
        {
            let b = sfd.borrow();
            if b.buffer()?.size == new_size {
                return Ok(());
            }
        }
        /* Replacing the core needs exclusive access to it */
        pool.wait_idle()?;
        let mut b = sfd.borrow_mut();
        let bref = &mut *b;
        let ShadowVariant::Buffer(buf) = &mut bref.data else {
            return Err(tag!("Entry RID {} is not a buffer", rid));
        };
        let old = buf.core.take().unwrap();
        let mut inner = Arc::into_inner(old)
            .ok_or_else(|| tag!("Resize of RID {} while tasks reference it", rid))?;
        if new_size > buf.size {
            inner.mirror.extend(new_size);
            buf.core = Some(Arc::new(ShadowCore {
                mapping: ExternalMapping::new(&buf.fd, new_size)?,
                mirror: inner.mirror,
                sync_fd: inner.sync_fd,
            }));
        } else {
            /* Truncated: previous mirror contents are useless */
            buf.core = Some(make_core(&buf.fd, new_size, inner.sync_fd.is_some())?);
            buf.needs_fill = true;
            buf.damage = Damage::Everything;
            buf.is_dirty = true;
        }
        buf.size = new_size;
        Ok(())
    }

    /** Queue the tasks that compute this entry's update messages.
     *
     * Open/extend records are pushed immediately; content work is sharded
     * over the pool, appending to `queue` under its lock. Returns once all
     * tasks are enqueued. */
    pub fn collect_update(
        &self,
        sfd: &Rc<RefCell<ShadowFd>>,
        pool: &WorkPool,
        queue: &Arc<TransferBuffer>,
    ) -> Result<(), String> {
        let mut b = sfd.borrow_mut();
        let bref = &mut *b;
        let rid = bref.remote_id;
        let kind = bref.kind;
        if let ShadowVariant::Buffer(buf) = &bref.data {
            if buf.pending_apply.load(Ordering::Acquire) > 0 {
                return Err(tag!(
                    "Collecting update for RID {} while apply tasks are pending",
                    rid
                ));
            }
        }
        let first_visit = std::mem::take(&mut bref.only_here);

        match &mut bref.data {
            ShadowVariant::Buffer(buf) => {
                if first_visit {
                    let msg: Vec<u8> = match kind {
                        FdKind::File => {
                            let mut v: Vec<u8> = cat3x4(
                                build_header(MsgType::OpenFile, 12).to_le_bytes(),
                                rid.0.to_le_bytes(),
                                (buf.size as u32).to_le_bytes(),
                            )
                            .into();
                            v.resize(16, 0);
                            v
                        }
                        FdKind::Dmabuf => {
                            let mut m = Vec::with_capacity(align16(12 + DMABUF_META_LEN));
                            m.extend_from_slice(&cat3x4(
                                build_header(MsgType::OpenDmabuf, 12 + DMABUF_META_LEN)
                                    .to_le_bytes(),
                                rid.0.to_le_bytes(),
                                (buf.size as u32).to_le_bytes(),
                            ));
                            m.extend_from_slice(&buf.meta.unwrap().to_bytes());
                            m.resize(align16(m.len()), 0);
                            m
                        }
                        _ => unreachable!(),
                    };
                    queue.push(Segment::Data(msg));
                    buf.remote_size = buf.size;
                }
                if buf.remote_size < buf.size {
                    let mut v: Vec<u8> = cat3x4(
                        build_header(MsgType::ExtendFile, 12).to_le_bytes(),
                        rid.0.to_le_bytes(),
                        (buf.size as u32).to_le_bytes(),
                    )
                    .into();
                    v.resize(16, 0);
                    queue.push(Segment::Data(v));
                    /* The grown region has never been sent */
                    buf.damage.add(Some((buf.remote_size, buf.size)));
                    buf.is_dirty = true;
                    buf.remote_size = buf.size;
                }

                let intervals = buf.damage.aligned_intervals(buf.size);
                if intervals.is_empty() {
                    return Ok(());
                }

                if buf.needs_fill {
                    /* Initial replication: ship the entire buffer */
                    buf.needs_fill = false;
                    let nblocks = (buf.size / 64) as u32;
                    let nshards = ceildiv(buf.size.max(1) as u32, DIFF_CHUNKSIZE as u32).max(1);
                    for i in 0..nshards {
                        let lo = 64 * split_interval(0, nblocks, nshards, i);
                        let mut hi = 64 * split_interval(0, nblocks, nshards, i + 1);
                        if i == nshards - 1 {
                            hi = buf.size as u32;
                        }
                        if hi <= lo {
                            continue;
                        }
                        let msgno = queue.reserve();
                        pool.enqueue(Task::CompressBlock(FillTask {
                            rid: rid.0,
                            compression: self.compression,
                            core: buf.core().clone(),
                            start: lo,
                            end: hi,
                            msgno,
                            queue: queue.clone(),
                        }));
                    }
                } else {
                    for shard in shard_intervals(&intervals, DIFF_CHUNKSIZE) {
                        let msgno = queue.reserve();
                        pool.enqueue(Task::DiffRegion(DiffTask {
                            rid: rid.0,
                            compression: self.compression,
                            core: buf.core().clone(),
                            intervals: shard,
                            msgno,
                            queue: queue.clone(),
                        }));
                    }
                }
                Ok(())
            }
            ShadowVariant::Pipe(pipe) => {
                if first_visit {
                    let typ = match kind {
                        /* We read locally, so the peer will receive the stream */
                        FdKind::PipeRead => MsgType::OpenPipeRead,
                        FdKind::PipeWrite => MsgType::OpenPipeWrite,
                        FdKind::Socket => MsgType::OpenPipeRw,
                        _ => unreachable!(),
                    };
                    let mut v: Vec<u8> =
                        cat2x4(build_header(typ, 8).to_le_bytes(), rid.0.to_le_bytes()).into();
                    v.resize(16, 0);
                    queue.push(Segment::Data(v));
                }
                if !pipe.inbuf.is_empty() {
                    let data = std::mem::take(&mut pipe.inbuf);
                    let mut msg = Vec::with_capacity(align16(8 + data.len()));
                    msg.extend_from_slice(&cat2x4(
                        build_header(MsgType::PipeData, 8 + data.len()).to_le_bytes(),
                        rid.0.to_le_bytes(),
                    ));
                    msg.extend_from_slice(&data);
                    msg.resize(align16(msg.len()), 0);
                    queue.push(Segment::Data(msg));
                }
                if pipe.program_closed && !pipe.close_sent {
                    pipe.close_sent = true;
                    let mut v: Vec<u8> = cat2x4(
                        build_header(MsgType::PipeClose, 8).to_le_bytes(),
                        rid.0.to_le_bytes(),
                    )
                    .into();
                    v.resize(16, 0);
                    queue.push(Segment::Data(v));
                }
                Ok(())
            }
        }
    }

    /** Called after the channel writer has drained the entry's update
     * blocks: clear damage and the dirty flag. The mirror was brought up to
     * date by the diff/fill tasks themselves. */
    pub fn finish_update(&self, sfd: &Rc<RefCell<ShadowFd>>) -> Result<(), String> {
        let mut b = sfd.borrow_mut();
        if let ShadowVariant::Buffer(buf) = &mut b.data {
            buf.damage = Damage::Nothing;
            buf.is_dirty = false;
        }
        Ok(())
    }

    /** Reconstitute or patch a local mirror fd from a received transfer
     * block. `block` is the unpadded frame, including its 8-byte prefix. */
    pub fn apply_update(
        &mut self,
        pool: &mut WorkPool,
        typ: MsgType,
        xid: Rid,
        block: &[u8],
    ) -> Result<(), String> {
        match typ {
            MsgType::OpenFile | MsgType::OpenDmabuf => {
                if block.len() < 12 {
                    return Err(tag!("Open record too short: {}", block.len()));
                }
                let size = u32::from_le_bytes(block[8..12].try_into().unwrap()) as usize;
                let meta = if typ == MsgType::OpenDmabuf {
                    Some(DmabufMeta::from_bytes(&block[12..])?)
                } else {
                    None
                };
                if let Ok(existing) = self.lookup(xid) {
                    /* Replayed open record: tolerate an exact duplicate */
                    let e = existing.borrow();
                    let buf = e.buffer()?;
                    if buf.size == size && buf.meta == meta {
                        return Ok(());
                    }
                    return Err(tag!("Open record for existing RID {}", xid));
                }
                /* DMABUF import through a GPU API is delegated; a memfd
                 * stand-in carries the replicated contents */
                let fd = make_memfd(size)?;
                let kind = if typ == MsgType::OpenDmabuf {
                    FdKind::Dmabuf
                } else {
                    FdKind::File
                };
                let core = make_core(&fd, size, false)?;
                let sfd = Rc::new(RefCell::new(ShadowFd {
                    remote_id: xid,
                    kind,
                    refcount: 1,
                    only_here: false,
                    data: ShadowVariant::Buffer(BufferState {
                        fd,
                        size,
                        remote_size: size,
                        damage: Damage::Nothing,
                        is_dirty: false,
                        core: Some(core),
                        pending_apply: Arc::new(AtomicU64::new(0)),
                        needs_fill: false,
                        meta,
                    }),
                }));
                self.map.insert(xid, sfd);
                Ok(())
            }
            MsgType::ExtendFile => {
                if block.len() < 12 {
                    return Err(tag!("Extend record too short: {}", block.len()));
                }
                let size = u32::from_le_bytes(block[8..12].try_into().unwrap()) as usize;
                let sfd = self.lookup(xid)?;
                {
                    let b = sfd.borrow();
                    let buf = b.buffer()?;
                    if size < buf.size {
                        return Err(tag!(
                            "Extend record shrinks RID {}: {} < {}",
                            xid,
                            size,
                            buf.size
                        ));
                    }
                    if size == buf.size {
                        return Ok(());
                    }
                }
                pool.wait_idle()?;
                let mut b = sfd.borrow_mut();
                let bref = &mut *b;
                let ShadowVariant::Buffer(buf) = &mut bref.data else {
                    return Err(tag!("Entry RID {} is not a buffer", xid));
                };
                nix::unistd::ftruncate(&buf.fd, size as nix::libc::off_t)
                    .map_err(|x| tag!("Failed to extend memfd to {}: {}", size, x))?;
                let old = buf.core.take().unwrap();
                let mut inner = Arc::into_inner(old)
                    .ok_or_else(|| tag!("Extend of RID {} while tasks reference it", xid))?;
                inner.mirror.extend(size);
                buf.core = Some(Arc::new(ShadowCore {
                    mapping: ExternalMapping::new(&buf.fd, size)?,
                    mirror: inner.mirror,
                    sync_fd: inner.sync_fd,
                }));
                buf.size = size;
                buf.remote_size = size;
                Ok(())
            }
            MsgType::BufferFill | MsgType::BufferDiff => {
                if block.len() < 16 {
                    return Err(tag!("Content record too short: {}", block.len()));
                }
                let a = u32::from_le_bytes(block[8..12].try_into().unwrap());
                let c = u32::from_le_bytes(block[12..16].try_into().unwrap());
                let sfd = self.lookup(xid)?;
                let b = sfd.borrow();
                let buf = b.buffer()?;
                let is_diff = typ == MsgType::BufferDiff;
                let (start, end) = if is_diff {
                    if a == 0 {
                        return Err(tag!("Diff record for RID {} with empty stream", xid));
                    }
                    (a, 0)
                } else {
                    if a >= c || c as usize > buf.size {
                        return Err(tag!(
                            "Fill range [{}, {}) invalid for RID {} of size {}",
                            a,
                            c,
                            xid,
                            buf.size
                        ));
                    }
                    (a, c)
                };
                buf.pending_apply.fetch_add(1, Ordering::AcqRel);
                let task = ApplyTask {
                    compression: self.compression,
                    core: buf.core().clone(),
                    is_diff,
                    start,
                    end,
                    data: block[16..].to_vec(),
                    pending: buf.pending_apply.clone(),
                };
                if self.compression == Compression::None {
                    pool.enqueue(Task::ApplyDiff(task));
                } else {
                    pool.enqueue(Task::DecompressBlock(task));
                }
                Ok(())
            }
            MsgType::OpenPipeRead | MsgType::OpenPipeWrite | MsgType::OpenPipeRw => {
                if self.lookup(xid).is_ok() {
                    return Err(tag!("Open record for existing RID {}", xid));
                }
                /* The peer's read side means data arrives here, so keep the
                 * write end and export the read end, and vice versa.
                 * Socketpairs carry both directions. */
                let (kind, keep, export) = match typ {
                    MsgType::OpenPipeRead => {
                        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
                            .map_err(|x| tag!("Failed to create pipe: {}", x))?;
                        (FdKind::PipeWrite, w, r)
                    }
                    MsgType::OpenPipeWrite => {
                        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
                            .map_err(|x| tag!("Failed to create pipe: {}", x))?;
                        (FdKind::PipeRead, r, w)
                    }
                    _ => {
                        let (s1, s2) = nix::sys::socket::socketpair(
                            nix::sys::socket::AddressFamily::Unix,
                            nix::sys::socket::SockType::Stream,
                            None,
                            nix::sys::socket::SockFlag::SOCK_CLOEXEC,
                        )
                        .map_err(|x| tag!("Failed to create socketpair: {}", x))?;
                        (FdKind::Socket, s1, s2)
                    }
                };
                self.insert_pipe(keep, kind, Some(export), Some(xid))?;
                Ok(())
            }
            MsgType::PipeData => {
                let sfd = self.lookup(xid)?;
                let mut b = sfd.borrow_mut();
                match &mut b.data {
                    ShadowVariant::Pipe(p) => {
                        p.outbuf.extend(&block[8..]);
                        Ok(())
                    }
                    _ => Err(tag!("Pipe data for non-pipe RID {}", xid)),
                }
            }
            MsgType::PipeClose => {
                let sfd = self.lookup(xid)?;
                let mut b = sfd.borrow_mut();
                match &mut b.data {
                    ShadowVariant::Pipe(p) => {
                        p.channel_closed = true;
                        Ok(())
                    }
                    _ => Err(tag!("Pipe close for non-pipe RID {}", xid)),
                }
            }
            MsgType::Protocol | MsgType::Ack | MsgType::Restart | MsgType::Close => Err(tag!(
                "Message type {:?} is not a shadow table operation",
                typ
            )),
        }
    }

    /** Raw fds of pipe-like entries this side reads from, for polling */
    pub fn pipe_read_fds(&self) -> Vec<std::os::fd::RawFd> {
        let mut v = Vec::new();
        for sfd in self.map.values() {
            let b = sfd.borrow();
            if !matches!(b.kind, FdKind::PipeRead | FdKind::Socket) {
                continue;
            }
            if let ShadowVariant::Pipe(p) = &b.data {
                if !p.program_closed {
                    v.push(p.fd.as_raw_fd());
                }
            }
        }
        v
    }

    /** Move pipe bytes between fds and stream buffers. Returns true if any
     * pipe has data waiting to be collected. */
    pub fn service_pipes(&mut self) -> bool {
        let mut any_pending = false;
        let mut dead: Vec<Rid> = Vec::new();
        for (rid, sfd) in self.map.iter() {
            let mut b = sfd.borrow_mut();
            let bref = &mut *b;
            let kind = bref.kind;
            let ShadowVariant::Pipe(p) = &mut bref.data else {
                continue;
            };
            /* Drain received bytes into the local fd */
            while !p.outbuf.is_empty() {
                let (head, _) = p.outbuf.as_slices();
                match nix::unistd::write(&p.fd, head) {
                    Ok(0) => break,
                    Ok(n) => {
                        p.outbuf.drain(..n);
                    }
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(nix::errno::Errno::EAGAIN) => break,
                    Err(_) => {
                        p.program_closed = true;
                        break;
                    }
                }
            }
            /* Read fresh bytes to forward */
            if matches!(kind, FdKind::PipeRead | FdKind::Socket) && !p.program_closed {
                let mut tmp = [0_u8; 4096];
                loop {
                    match nix::unistd::read(p.fd.as_raw_fd(), &mut tmp) {
                        Ok(0) => {
                            p.program_closed = true;
                            break;
                        }
                        Ok(n) => {
                            p.inbuf.extend_from_slice(&tmp[..n]);
                        }
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(nix::errno::Errno::EAGAIN) => break,
                        Err(_) => {
                            p.program_closed = true;
                            break;
                        }
                    }
                }
            }
            if !p.inbuf.is_empty() || (p.program_closed && !p.close_sent) {
                any_pending = true;
            }
            if p.channel_closed && p.outbuf.is_empty() && p.program_closed {
                dead.push(*rid);
            }
        }
        for rid in dead {
            /* Fully shut down in both directions */
            let _ = self.release(rid);
        }
        any_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dmabuf_meta_roundtrip() {
        let meta = DmabufMeta {
            width: 256,
            height: 320,
            format: 0x38385247, /* GR88 fourcc */
            modifier: 0x00ffffffffffffff,
            offsets: [0, 4, 8, 12],
            strides: [512, 0, 0, 0],
            using_planes: [true, false, true, false],
        };
        let b = meta.to_bytes();
        assert_eq!(DmabufMeta::from_bytes(&b).unwrap(), meta);
        assert!(DmabufMeta::from_bytes(&b[..40]).is_err());
    }

    #[test]
    fn test_shard_intervals() {
        let intervals = [(0_usize, 1 << 20)];
        let shards = shard_intervals(&intervals, DIFF_CHUNKSIZE);
        assert_eq!(shards.len(), (1 << 20) / DIFF_CHUNKSIZE);
        let mut pos = 0_u32;
        for s in &shards {
            for iv in s {
                assert_eq!(iv.0, pos);
                assert!(iv.0 % 64 == 0);
                pos = iv.1;
            }
        }
        assert_eq!(pos, 1 << 20);

        /* Small scattered intervals group into one shard */
        let intervals = [(0_usize, 64), (1024, 2048), (4096, 4096 + 64)];
        let shards = shard_intervals(&intervals, DIFF_CHUNKSIZE);
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].len(), 3);
    }

    #[test]
    fn test_rid_allocation_no_reuse() {
        let mut m = TranslationMap::new(true, Compression::None);
        let a = m.allocate_rid();
        let b = m.allocate_rid();
        assert!(a.0 < 0 && b.0 < 0 && a != b);
        let mut m = TranslationMap::new(false, Compression::None);
        let a = m.allocate_rid();
        let b = m.allocate_rid();
        assert!(a.0 > 0 && b.0 > 0 && a != b);
    }

    #[test]
    fn test_translate_dedup_and_release() {
        let mut map = TranslationMap::new(true, Compression::None);
        let fd = make_memfd(4096).unwrap();
        let fd2 = fd.try_clone().unwrap();

        let e1 = map.translate(fd, FdKind::File, None).unwrap();
        let rid = e1.borrow().remote_id;
        /* same underlying file: same id */
        let e2 = map.translate(fd2, FdKind::File, None).unwrap();
        assert_eq!(e2.borrow().remote_id, rid);

        assert!(map.lookup(rid).is_ok());
        assert!(map.lookup(Rid(12345)).is_err());

        map.acquire(rid).unwrap();
        map.release(rid).unwrap();
        assert!(map.lookup(rid).is_ok());
        map.release(rid).unwrap();
        /* second release of a freed entry is an error, not a double free */
        assert!(map.release(rid).is_err());
        assert!(map.lookup(rid).is_err());
    }

    #[test]
    fn test_dirty_damage_invariant() {
        let mut map = TranslationMap::new(true, Compression::None);
        let fd = make_memfd(8192).unwrap();
        let e = map.translate(fd, FdKind::File, None).unwrap();
        let rid = e.borrow().remote_id;

        assert!(!e.borrow().buffer().unwrap().is_dirty);
        assert!(e.borrow().buffer().unwrap().damage.is_empty());

        map.mark_dirty(rid, Some((100, 300))).unwrap();
        assert!(e.borrow().buffer().unwrap().is_dirty);
        assert!(!e.borrow().buffer().unwrap().damage.is_empty());

        map.finish_update(&e).unwrap();
        assert!(!e.borrow().buffer().unwrap().is_dirty);
        assert!(e.borrow().buffer().unwrap().damage.is_empty());
    }
}
