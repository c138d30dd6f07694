/* SPDX-License-Identifier: GPL-3.0-or-later */
#![cfg(test)]
/*! End-to-end tests for the replication engine, the supervisor, and the
 * reconnection machinery */
use crate::conn::main_interface_loop;
use crate::kernel::copy_from_mapping;
use crate::tag;
use crate::pool::WorkPool;
use crate::reconnect::*;
use crate::server::*;
use crate::shadow::*;
use crate::token::{ConnectionToken, TokenMinter};
use crate::transfer::*;
use crate::util::*;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::ffi::OsString;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

struct TestLogger;
impl log::Log for TestLogger {
    fn enabled(&self, meta: &log::Metadata<'_>) -> bool {
        meta.level() <= log::LevelFilter::Error
    }
    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }
    fn flush(&self) {}
}
static TEST_LOGGER: TestLogger = TestLogger;

fn setup() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        log::set_max_level(log::LevelFilter::Error);
        let _ = log::set_logger(&TEST_LOGGER);
    });
}

fn tmp_path(name: &str) -> PathBuf {
    let p = PathBuf::from(format!(
        "/tmp/waybridge-test-{}-{}",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_file(&p);
    p
}

fn bind_listener(path: &Path) -> OwnedFd {
    let s = socket::socket(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        socket::SockFlag::SOCK_CLOEXEC,
        None,
    )
    .unwrap();
    let addr = socket::UnixAddr::new(path).unwrap();
    socket::bind(s.as_raw_fd(), &addr).unwrap();
    socket::listen(&s, socket::Backlog::new(16).unwrap()).unwrap();
    s
}

fn accept_with_timeout(listener: &OwnedFd, ms: u16) -> OwnedFd {
    let mut pfds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
    let n = nix::poll::poll(&mut pfds, PollTimeout::from(ms)).unwrap();
    assert!(n > 0, "no connection within {} ms", ms);
    let fd = socket::accept(listener.as_raw_fd()).unwrap();
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn read_exact_fd(fd: &OwnedFd, n: usize, ms: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let mut pfds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        let r = nix::poll::poll(&mut pfds, PollTimeout::from(ms)).unwrap();
        assert!(r > 0, "timed out reading {} bytes (got {})", n, out.len());
        let mut tmp = [0_u8; 4096];
        let want = std::cmp::min(tmp.len(), n - out.len());
        let amt = nix::unistd::read(fd.as_raw_fd(), &mut tmp[..want]).unwrap();
        assert!(amt > 0, "unexpected EOF after {} bytes", out.len());
        out.extend_from_slice(&tmp[..amt]);
    }
    out
}

/** Incrementally parse wire frames from a socket */
struct FrameReader {
    fd: OwnedFd,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(fd: OwnedFd) -> FrameReader {
        FrameReader {
            fd,
            buf: Vec::new(),
        }
    }
    fn next_frame(&mut self, ms: u16) -> Option<(MsgType, Vec<u8>)> {
        loop {
            if self.buf.len() >= 8 {
                let header = u32::from_le_bytes(self.buf[..4].try_into().unwrap());
                let (len, typ) = parse_header(header).expect("bad frame header");
                let padded = padded_size(len);
                if self.buf.len() >= padded {
                    let block = self.buf[..len].to_vec();
                    self.buf.drain(..padded);
                    return Some((typ, block));
                }
            }
            let mut pfds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match nix::poll::poll(&mut pfds, PollTimeout::from(ms)) {
                Ok(0) => return None,
                Ok(_) => (),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => panic!("poll: {}", e),
            }
            let mut tmp = [0_u8; 16384];
            match nix::unistd::read(self.fd.as_raw_fd(), &mut tmp) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => panic!("read: {}", e),
            }
        }
    }
    /** Next frame that is not an ack */
    fn next_data_frame(&mut self, ms: u16) -> Option<(MsgType, Vec<u8>)> {
        loop {
            let (typ, block) = self.next_frame(ms)?;
            if typ != MsgType::Ack {
                return Some((typ, block));
            }
        }
    }
}

fn make_pattern_memfd(size: usize) -> OwnedFd {
    let fd = make_memfd(size).unwrap();
    let pattern: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
    write_all(&fd, &pattern).unwrap();
    fd
}

fn entry_core(entry: &Rc<RefCell<ShadowFd>>) -> Arc<ShadowCore> {
    let b = entry.borrow();
    b.buffer().unwrap().core().clone()
}

fn read_mapped(entry: &Rc<RefCell<ShadowFd>>) -> Vec<u8> {
    let core = entry_core(entry);
    let mut v = vec![0_u8; core.mapping.len()];
    copy_from_mapping(&mut v, &core.mapping, 0);
    v
}

fn write_mapped(entry: &Rc<RefCell<ShadowFd>>, offset: usize, data: &[u8]) {
    let core = entry_core(entry);
    crate::kernel::copy_onto_mapping(data, &core.mapping, offset);
}

/** Run one source -> destination transfer for the given RID, returning the
 * number of payload bytes moved over the simulated channel */
fn transfer_once(
    src: &mut TranslationMap,
    spool: &mut WorkPool,
    dst: &mut TranslationMap,
    dpool: &mut WorkPool,
    rid: Rid,
) -> Result<usize, String> {
    let queue = Arc::new(TransferBuffer::new());
    let entry = src.lookup(rid)?;
    src.collect_update(&entry, spool, &queue)?;
    spool.wait_idle()?;
    src.finish_update(&entry)?;

    let mut blocks: Vec<u8> = Vec::new();
    for (_msgno, seg) in queue.pop_ready() {
        if let Segment::Data(d) = seg {
            blocks.extend_from_slice(&d);
        }
    }
    assert_eq!(queue.in_flight(), 0);

    let mut pos = 0;
    while pos < blocks.len() {
        let header = u32::from_le_bytes(blocks[pos..pos + 4].try_into().unwrap());
        let (len, typ) =
            parse_header(header).ok_or_else(|| tag!("Corrupt header {:08x}", header))?;
        let xid = i32::from_le_bytes(blocks[pos + 4..pos + 8].try_into().unwrap());
        dst.apply_update(dpool, typ, Rid(xid), &blocks[pos..pos + len])?;
        pos += padded_size(len);
    }
    dpool.wait_idle()?;
    Ok(blocks.len())
}

fn check_match(src: &TranslationMap, dst: &TranslationMap, rid: Rid) -> bool {
    let se = src.lookup(rid).unwrap();
    let de = dst.lookup(rid).unwrap();
    let (ssize, dsize) = (
        se.borrow().buffer().unwrap().size,
        de.borrow().buffer().unwrap().size,
    );
    if ssize != dsize {
        eprintln!("size mismatch: {} != {}", ssize, dsize);
        return false;
    }
    read_mapped(&se) == read_mapped(&de)
}

fn compression_modes() -> Vec<Compression> {
    let mut v = vec![Compression::None];
    #[cfg(feature = "lz4")]
    v.push(Compression::Lz4(1));
    #[cfg(feature = "zstd")]
    v.push(Compression::Zstd(5));
    v
}

/* Mirror a shared file back and forth: 5 rounds, alternating which side is
 * dirty, across the full compression x source-threads x dest-threads matrix */
#[test]
fn test_file_mirror_matrix() {
    setup();
    const TEST_WIDTH: usize = 256;
    const TEST_HEIGHT: usize = 320;
    const TEST_CPP: usize = 2;
    let size = TEST_WIDTH * TEST_HEIGHT * TEST_CPP;

    let mut rng = StdRng::seed_from_u64(0);
    for comp in compression_modes() {
        for src_threads in 1..=5 {
            for dst_threads in 1..=5 {
                let pass = run_mirror_rounds(comp, src_threads, dst_threads, size, &mut rng);
                println!(
                    "  FILE comp={} src_thread={} dst_thread={}, {}",
                    comp,
                    src_threads,
                    dst_threads,
                    if pass { "pass" } else { "FAIL" }
                );
                assert!(pass);
            }
        }
    }
}

fn run_mirror_rounds(
    comp: Compression,
    src_threads: usize,
    dst_threads: usize,
    size: usize,
    rng: &mut StdRng,
) -> bool {
    let mut src = TranslationMap::new(true, comp);
    let mut dst = TranslationMap::new(false, comp);
    let mut spool = WorkPool::new(src_threads).unwrap();
    let mut dpool = WorkPool::new(dst_threads).unwrap();

    let fd = make_pattern_memfd(size);
    let entry = src.translate(fd, FdKind::File, None).unwrap();
    let rid = entry.borrow().remote_id;

    for round in 0..5 {
        let fwd = round == 0 || round % 2 == 1;
        if round > 0 {
            /* Write a pseudo-random byte range, filled with the round
             * index, on whichever side is dirty this round */
            let m = if fwd { &src } else { &dst };
            let e = m.lookup(rid).unwrap();
            let mut a = rng.gen_range(0..size);
            let mut b = rng.gen_range(0..size);
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            write_mapped(&e, a, &vec![round as u8; b - a]);
            m.mark_dirty(rid, None).unwrap();
        } else {
            src.mark_dirty(rid, None).unwrap();
        }

        let r = if fwd {
            transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid)
        } else {
            transfer_once(&mut dst, &mut dpool, &mut src, &mut spool, rid)
        };
        if r.is_err() {
            eprintln!("transfer failed: {:?}", r);
            return false;
        }
        if !check_match(&src, &dst, rid) {
            return false;
        }
    }
    true
}

/* Collecting updates with empty damage must not produce any transfer */
#[test]
fn test_no_op_transmission() {
    setup();
    let mut src = TranslationMap::new(true, Compression::None);
    let mut dst = TranslationMap::new(false, Compression::None);
    let mut spool = WorkPool::new(1).unwrap();
    let mut dpool = WorkPool::new(1).unwrap();
    let fd = make_pattern_memfd(16384);
    let entry = src.translate(fd, FdKind::File, None).unwrap();
    let rid = entry.borrow().remote_id;

    src.mark_dirty(rid, None).unwrap();
    let n = transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();
    assert!(n > 0);

    /* no damage: nothing on the wire */
    let n = transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();
    assert_eq!(n, 0);

    /* fully damaged but unchanged: diffs come out empty */
    src.mark_dirty(rid, None).unwrap();
    let n = transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();
    assert_eq!(n, 0);
}

/* Bytes outside the damage intervals are never transmitted */
#[test]
fn test_damage_minimality() {
    setup();
    let size = 16384;
    let mut src = TranslationMap::new(true, Compression::None);
    let mut dst = TranslationMap::new(false, Compression::None);
    let mut spool = WorkPool::new(2).unwrap();
    let mut dpool = WorkPool::new(2).unwrap();
    let fd = make_pattern_memfd(size);
    let entry = src.translate(fd, FdKind::File, None).unwrap();
    let rid = entry.borrow().remote_id;
    src.mark_dirty(rid, None).unwrap();
    transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();

    /* Change one marked range and one unmarked range */
    write_mapped(&entry, 4096, &[0xaa_u8; 64]);
    write_mapped(&entry, 8192, &[0xbb_u8; 64]);
    src.mark_dirty(rid, Some((4096, 4160))).unwrap();

    /* Inspect the emitted frames, then forward them to the destination */
    let queue = Arc::new(TransferBuffer::new());
    src.collect_update(&entry, &spool, &queue).unwrap();
    spool.wait_idle().unwrap();
    src.finish_update(&entry).unwrap();
    let mut saw_diff = false;
    for (_n, seg) in queue.pop_ready() {
        let Segment::Data(frame) = seg else { continue };
        if frame.is_empty() {
            continue;
        }
        let header = u32::from_le_bytes(frame[..4].try_into().unwrap());
        let (len, typ) = parse_header(header).unwrap();
        assert_eq!(typ, MsgType::BufferDiff);
        saw_diff = true;
        /* Walk the uncompressed diff stream: all segments must stay inside
         * the (64-byte aligned) damage interval */
        let stream = &frame[16..len];
        let mut pos = 0;
        loop {
            let off = u32::from_le_bytes(stream[pos..pos + 4].try_into().unwrap()) as usize;
            let seglen = u32::from_le_bytes(stream[pos + 4..pos + 8].try_into().unwrap()) as usize;
            if seglen == 0 {
                break;
            }
            assert!(
                off >= 4096 && off + seglen <= 4160,
                "segment [{}, {})",
                off,
                off + seglen
            );
            pos += crate::util::align16(8 + seglen);
        }
        let xid = i32::from_le_bytes(frame[4..8].try_into().unwrap());
        dst.apply_update(&mut dpool, typ, Rid(xid), &frame[..len])
            .unwrap();
    }
    assert!(saw_diff);
    dpool.wait_idle().unwrap();

    /* The unmarked change must not have reached the destination */
    let de = dst.lookup(rid).unwrap();
    let dval = read_mapped(&de);
    assert_eq!(&dval[4096..4160], &[0xaa_u8; 64][..]);
    assert_eq!(dval[8192], (8192 % 256) as u8);
}

/* Applying a received block twice leaves the same state as applying once */
#[test]
fn test_idempotent_apply() {
    setup();
    let size = 8192;
    let mut src = TranslationMap::new(true, Compression::None);
    let mut dst = TranslationMap::new(false, Compression::None);
    let mut spool = WorkPool::new(1).unwrap();
    let mut dpool = WorkPool::new(1).unwrap();
    let fd = make_pattern_memfd(size);
    let entry = src.translate(fd, FdKind::File, None).unwrap();
    let rid = entry.borrow().remote_id;
    src.mark_dirty(rid, None).unwrap();

    let queue = Arc::new(TransferBuffer::new());
    src.collect_update(&entry, &spool, &queue).unwrap();
    spool.wait_idle().unwrap();
    src.finish_update(&entry).unwrap();
    let mut blocks = Vec::new();
    for (_n, seg) in queue.pop_ready() {
        if let Segment::Data(d) = seg {
            blocks.extend_from_slice(&d);
        }
    }

    for _pass in 0..2 {
        let mut pos = 0;
        while pos < blocks.len() {
            let header = u32::from_le_bytes(blocks[pos..pos + 4].try_into().unwrap());
            let (len, typ) = parse_header(header).unwrap();
            let xid = i32::from_le_bytes(blocks[pos + 4..pos + 8].try_into().unwrap());
            dst.apply_update(&mut dpool, typ, Rid(xid), &blocks[pos..pos + len])
                .unwrap();
            pos += padded_size(len);
        }
        dpool.wait_idle().unwrap();
    }
    assert!(check_match(&src, &dst, rid));

    /* The second application leaves the destination clean: no further work */
    let de = dst.lookup(rid).unwrap();
    assert!(!de.borrow().buffer().unwrap().is_dirty);
    let n = transfer_once(&mut dst, &mut dpool, &mut src, &mut spool, rid).unwrap();
    assert_eq!(n, 0);
}

/* After finish_update, the mirror equals the current contents over the
 * previously damaged intervals */
#[test]
fn test_mirror_matches_after_update() {
    setup();
    let size = 16384;
    let mut src = TranslationMap::new(true, Compression::None);
    let mut dst = TranslationMap::new(false, Compression::None);
    let mut spool = WorkPool::new(2).unwrap();
    let mut dpool = WorkPool::new(1).unwrap();
    let fd = make_pattern_memfd(size);
    let entry = src.translate(fd, FdKind::File, None).unwrap();
    let rid = entry.borrow().remote_id;
    src.mark_dirty(rid, None).unwrap();
    transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();

    write_mapped(&entry, 1000, &[7_u8; 3000]);
    src.mark_dirty(rid, Some((1000, 4000))).unwrap();
    transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();

    let core = entry_core(&entry);
    let mut current = vec![0_u8; size];
    copy_from_mapping(&mut current, &core.mapping, 0);
    let mirror = core.mirror.get_mut_range(0..size).unwrap();
    assert_eq!(&mirror.data[960..4032], &current[960..4032]);
    /* in fact the whole mirror matches, since nothing else changed */
    assert_eq!(mirror.data, &current[..]);
}

/* Growing a file produces an extend record and consistent replication */
#[test]
fn test_file_extension() {
    setup();
    let mut src = TranslationMap::new(true, Compression::None);
    let mut dst = TranslationMap::new(false, Compression::None);
    let mut spool = WorkPool::new(1).unwrap();
    let mut dpool = WorkPool::new(1).unwrap();
    let fd = make_pattern_memfd(4096);
    let entry = src.translate(fd, FdKind::File, None).unwrap();
    let rid = entry.borrow().remote_id;
    src.mark_dirty(rid, None).unwrap();
    transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();

    /* The application grows the pool */
    {
        let b = entry.borrow();
        nix::unistd::ftruncate(&b.buffer().unwrap().fd, 8192).unwrap();
    }
    src.update_size(rid, 8192, &mut spool).unwrap();
    write_mapped(&entry, 4096, &[3_u8; 4096]);
    src.mark_dirty(rid, Some((4096, 8192))).unwrap();
    transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();

    assert!(check_match(&src, &dst, rid));
    assert_eq!(dst.lookup(rid).unwrap().borrow().buffer().unwrap().size, 8192);
}

/* Pipes replicate as append-only streams with explicit close records */
#[test]
fn test_pipe_replication() {
    setup();
    let mut src = TranslationMap::new(true, Compression::None);
    let mut dst = TranslationMap::new(false, Compression::None);
    let mut spool = WorkPool::new(1).unwrap();
    let mut dpool = WorkPool::new(1).unwrap();

    let (pr, pw) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
    let entry = src.translate(pr, FdKind::PipeRead, None).unwrap();
    let rid = entry.borrow().remote_id;

    write_all(&pw, b"stream data").unwrap();
    src.service_pipes();
    transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();

    let de = dst.lookup(rid).unwrap();
    assert_eq!(de.borrow().kind, FdKind::PipeWrite);
    let export = {
        let mut b = de.borrow_mut();
        let ShadowVariant::Pipe(p) = &mut b.data else {
            panic!()
        };
        p.export_fd.take().unwrap()
    };
    dst.service_pipes();
    assert_eq!(read_exact_fd(&export, 11, 1000), b"stream data");

    /* Closing the write side propagates a close record */
    drop(pw);
    src.service_pipes();
    transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();
    assert!(dst.lookup(rid).unwrap().borrow().pipe().unwrap().channel_closed);
}

/* A corrupt frame header or unknown RID terminates the apply path */
#[test]
fn test_corrupt_transfer_rejected() {
    setup();
    let mut dst = TranslationMap::new(false, Compression::None);
    let mut dpool = WorkPool::new(1).unwrap();

    /* unknown RID */
    let block = cat4x4(
        build_header(MsgType::BufferFill, 16).to_le_bytes(),
        77_i32.to_le_bytes(),
        0_u32.to_le_bytes(),
        64_u32.to_le_bytes(),
    );
    assert!(
        dst.apply_update(&mut dpool, MsgType::BufferFill, Rid(77), &block)
            .is_err()
    );

    /* fill range outside the buffer */
    let fd = make_memfd(128).unwrap();
    let mut src = TranslationMap::new(true, Compression::None);
    let e = src.translate(fd, FdKind::File, None).unwrap();
    let rid = e.borrow().remote_id;
    let mut spool = WorkPool::new(1).unwrap();
    src.mark_dirty(rid, None).unwrap();
    transfer_once(&mut src, &mut spool, &mut dst, &mut dpool, rid).unwrap();
    let bad = cat4x4(
        build_header(MsgType::BufferFill, 16).to_le_bytes(),
        rid.0.to_le_bytes(),
        0_u32.to_le_bytes(),
        100000_u32.to_le_bytes(),
    );
    assert!(
        dst.apply_update(&mut dpool, MsgType::BufferFill, rid, &bad)
            .is_err()
    );

    /* garbage type code never parses */
    assert!(parse_header(0xffff_ffff & 31).is_none());
}

/* Two worker loops proxy raw application bytes in both directions */
#[test]
fn test_worker_relay() {
    setup();
    let mkpair = || {
        socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    };
    let (c1, c2) = mkpair();
    let (a1, a2) = mkpair();
    let (b1, b2) = mkpair();

    let opts_s = Options {
        threads: 1,
        ..Options::default()
    };
    let opts_c = opts_s.clone();
    let hs = std::thread::spawn(move || {
        main_interface_loop(c1, a2, None, &opts_s, false, nix::sys::signal::SigSet::empty())
    });
    let hc = std::thread::spawn(move || {
        main_interface_loop(c2, b2, None, &opts_c, true, nix::sys::signal::SigSet::empty())
    });

    write_all(&a1, b"hello").unwrap();
    assert_eq!(read_exact_fd(&b1, 5, 2000), b"hello");
    write_all(&b1, b"world!").unwrap();
    assert_eq!(read_exact_fd(&a1, 6, 2000), b"world!");

    /* Closing the application ends both workers cleanly */
    drop(a1);
    hs.join().unwrap().unwrap();
    hc.join().unwrap().unwrap();
}

/* A reconnectable worker adopts a replacement channel fd and replays
 * everything the peer has not acknowledged */
#[test]
fn test_worker_reconnect_resume() {
    setup();
    let mkpair = || {
        socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    };
    let (c1, c2) = mkpair();
    let (a1, a2) = mkpair();
    let (link_worker, link_helper) = mkpair();

    let opts = Options {
        threads: 1,
        ..Options::default()
    };
    let h = std::thread::spawn(move || {
        main_interface_loop(
            c1,
            a2,
            Some(link_worker),
            &opts,
            false,
            nix::sys::signal::SigSet::empty(),
        )
    });

    /* First message flows over the original channel */
    write_all(&a1, b"abc").unwrap();
    let mut fr = FrameReader::new(c2);
    let (typ, block) = fr.next_data_frame(2000).unwrap();
    assert_eq!(typ, MsgType::Protocol);
    assert_eq!(&block[8..], b"abc");

    /* Drop the channel; the worker must wait for a replacement */
    drop(fr);
    write_all(&a1, b"def").unwrap();

    let (n1, n2) = mkpair();
    send_one_fd(&link_helper, n1.as_raw_fd()).unwrap();
    drop(n1);

    let mut fr2 = FrameReader::new(n2);
    let (typ, block) = fr2.next_frame(2000).unwrap();
    assert_eq!(typ, MsgType::Restart);
    assert_eq!(
        join_u64(
            u32::from_le_bytes(block[8..12].try_into().unwrap()),
            u32::from_le_bytes(block[12..16].try_into().unwrap())
        ),
        0
    );

    /* We never acknowledged anything: ask for a resume from zero */
    let reply = cat4x4(
        build_header(MsgType::Restart, 16).to_le_bytes(),
        0_u32.to_le_bytes(),
        0_u32.to_le_bytes(),
        0_u32.to_le_bytes(),
    );
    write_all(&fr2.fd, &reply).unwrap();

    /* Both the replayed and the fresh message arrive, in order */
    let (typ, block) = fr2.next_data_frame(2000).unwrap();
    assert_eq!((typ, &block[8..]), (MsgType::Protocol, &b"abc"[..]));
    let (typ, block) = fr2.next_data_frame(2000).unwrap();
    assert_eq!((typ, &block[8..]), (MsgType::Protocol, &b"def"[..]));

    drop(a1);
    let (typ, _block) = fr2.next_data_frame(2000).unwrap();
    assert_eq!(typ, MsgType::Close);
    h.join().unwrap().unwrap();
    drop(link_helper);
}

/* The reconnection helper dials announced paths, writes the update-flagged
 * token, and passes the socket over the link */
#[test]
fn test_reconnect_helper_exchange() {
    setup();
    let fifo = tmp_path("ctrl.fifo");
    let control = open_control_pipe(&fifo).unwrap();
    let (link_helper, link_worker) = socket::socketpair(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        None,
        socket::SockFlag::SOCK_CLOEXEC,
    )
    .unwrap();
    let token = TokenMinter::new().mint(true, false).unwrap();

    let h = std::thread::spawn(move || run_reconnect_helper(control, link_helper, &token));

    let target = tmp_path("reco-target");
    let listener = bind_listener(&target);

    /* An unreachable path is logged and skipped, not fatal */
    let wfd = {
        let raw = nix::fcntl::open(
            &fifo,
            nix::fcntl::OFlag::O_WRONLY,
            nix::sys::stat::Mode::empty(),
        )
        .unwrap();
        unsafe { OwnedFd::from_raw_fd(raw) }
    };
    write_all(&wfd, b"/nonexistent/waybridge-void.sock\n").unwrap();
    /* Let the helper consume the bad path before announcing the real one;
     * a single read would otherwise take the first line and drop the rest */
    std::thread::sleep(std::time::Duration::from_millis(300));
    let mut announce = Vec::from(target.as_os_str().as_encoded_bytes());
    announce.push(b'\n');
    write_all(&wfd, &announce).unwrap();

    let conn = accept_with_timeout(&listener, 5000);
    let raw = read_exact_fd(&conn, 16, 2000);
    let received = ConnectionToken::from_bytes(&raw.try_into().unwrap()).unwrap();
    assert!(received.is_update());
    assert!(received.is_reconnectable());
    assert_eq!(received.key, token.key);

    /* The passed fd is the other end of the accepted connection */
    let passed = receive_one_fd(&link_worker).unwrap().unwrap();
    write_all(&conn, b"ping").unwrap();
    assert_eq!(read_exact_fd(&passed, 4, 2000), b"ping");

    drop(link_worker);
    h.join().unwrap().unwrap();
    let _ = std::fs::remove_file(&fifo);
    let _ = std::fs::remove_file(&target);
}

/* Migration pushes update tokens to every row in recorded order; a failed
 * migration leaves the previous address in effect */
#[test]
fn test_connection_migration() {
    setup();
    let mut minter = TokenMinter::new();
    let mut rows_store: Vec<(ConnectionToken, OwnedFd, OwnedFd)> = Vec::new();
    for _ in 0..3 {
        let (sup, wrk) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        rows_store.push((minter.mint(true, false).unwrap(), sup, wrk));
    }

    let target = tmp_path("mig-target");
    let listener = bind_listener(&target);
    let accept_thread = {
        let listener = listener.try_clone().unwrap();
        std::thread::spawn(move || {
            let mut tokens = Vec::new();
            for _ in 0..3 {
                let conn = accept_with_timeout(&listener, 5000);
                let raw = read_exact_fd(&conn, 16, 2000);
                tokens.push(ConnectionToken::from_bytes(&raw.try_into().unwrap()).unwrap());
            }
            tokens
        })
    };

    let rows: Vec<(ConnectionToken, &OwnedFd)> =
        rows_store.iter().map(|(t, sup, _)| (*t, sup)).collect();
    let mut current = tmp_path("mig-old");
    update_connections(&mut current, &target, &rows, false).unwrap();
    assert_eq!(current, target);

    let received = accept_thread.join().unwrap();
    for (i, (token, _, wrk)) in rows_store.iter().enumerate() {
        /* original token, with only the update bit added, in row order */
        assert_eq!(received[i].header, token.header | CONN_UPDATE_BIT);
        assert_eq!(received[i].key, token.key);
        assert!(receive_one_fd(wrk).unwrap().is_some());
    }

    /* Unreachable new address: migration aborts, address unchanged */
    let bogus = tmp_path("mig-void");
    assert!(update_connections(&mut current, &bogus, &rows, false).is_err());
    assert_eq!(current, target);

    let _ = std::fs::remove_file(&target);
}

/* Oneshot supervisor propagates the application's exit status */
#[test]
fn test_oneshot_exit_status() {
    setup();
    let chan = tmp_path("oneshot-chan");
    let listener = bind_listener(&chan);
    let remote = std::thread::spawn(move || {
        let conn = accept_with_timeout(&listener, 10000);
        let raw = read_exact_fd(&conn, 16, 5000);
        let token = ConnectionToken::from_bytes(&raw.try_into().unwrap()).unwrap();
        assert!(!token.is_update());
        assert!(!token.is_reconnectable());
        /* Drain whatever the worker sends until it closes */
        let mut fr = FrameReader::new(conn);
        while let Some((typ, _)) = fr.next_frame(5000) {
            if typ == MsgType::Close {
                break;
            }
        }
    });

    let cfg = ServerConfig {
        socket_path: chan.clone(),
        wayland_display: OsString::from("wayland-test"),
        control_path: None,
        oneshot: true,
        unlink_at_end: false,
        login_shell: false,
        command: vec![
            OsString::from("/bin/sh"),
            OsString::from("-c"),
            OsString::from("exit 7"),
        ],
    };
    let opts = Options {
        threads: 1,
        ..Options::default()
    };
    let status = run_server(&cfg, &opts).unwrap();
    assert_eq!(status, 7);
    remote.join().unwrap();
    let _ = std::fs::remove_file(&chan);
}
