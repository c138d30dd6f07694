/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! The per-connection worker: relays one application connection over one channel */
use crate::pool::WorkPool;
use crate::reconnect::receive_one_fd;
use crate::shadow::*;
use crate::tag;
use crate::transfer::*;
use crate::util::*;
use log::{debug, error};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::signal;
use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/* Read sizes for the application socket and the channel */
const APP_READ_SIZE: usize = 4096;
const CHAN_READ_SIZE: usize = 16384;

enum ChanEvent {
    None,
    /** A Close record arrived from the peer */
    PeerClosed,
}

struct Worker {
    map: TranslationMap,
    pool: WorkPool,
    queue: Arc<TransferBuffer>,

    /* Bytes pending write to the channel / the application */
    chan_out: VecDeque<u8>,
    app_out: VecDeque<u8>,
    /* Partially received channel frames */
    chan_in: Vec<u8>,

    /* Numbered messages sent / received; acks and restarts carry these */
    nsent: u64,
    nrecvd: u64,
    last_ack_sent: u64,
    /* Sent numbered frames not yet acknowledged, for replay after reconnect */
    replay: VecDeque<(u64, Vec<u8>)>,
    /* After adopting a replacement channel fd, hold data until the peer's
     * restart record tells us where to resume */
    awaiting_restart: bool,

    app_eof: bool,
    close_queued: bool,
    /* The stop sentinel has drained out of the transfer buffer */
    stop_seen: bool,
}

fn make_control_frame(typ: MsgType, count: u64) -> Vec<u8> {
    let (hi, lo) = split_u64(count);
    cat4x4(
        build_header(typ, 16).to_le_bytes(),
        0_u32.to_le_bytes(),
        hi.to_le_bytes(),
        lo.to_le_bytes(),
    )
    .into()
}

fn parse_control_count(block: &[u8]) -> Result<u64, String> {
    if block.len() < 16 {
        return Err(tag!("Control record too short: {}", block.len()));
    }
    Ok(join_u64(
        u32::from_le_bytes(block[8..12].try_into().unwrap()),
        u32::from_le_bytes(block[12..16].try_into().unwrap()),
    ))
}

impl Worker {
    /** Move finished segments from the transfer buffer into the channel
     * write queue, numbering them and retaining them for replay. */
    fn stage_outgoing(&mut self) {
        if self.awaiting_restart {
            return;
        }
        for (_msgno, seg) in self.queue.pop_ready() {
            let Segment::Data(frame) = seg else {
                self.stop_seen = true;
                continue;
            };
            if frame.is_empty() {
                /* Elided null update */
                continue;
            }
            let header = u32::from_le_bytes(frame[..4].try_into().unwrap());
            let (_, typ) = parse_header(header).unwrap();
            if is_numbered(typ) {
                self.replay.push_back((self.nsent, frame.clone()));
                self.nsent += 1;
            }
            self.chan_out.extend(&frame);
        }
    }

    /** Queue an ack if the peer has unacknowledged messages */
    fn stage_ack(&mut self) {
        if self.nrecvd > self.last_ack_sent && !self.awaiting_restart {
            let frame = make_control_frame(MsgType::Ack, self.nrecvd);
            self.chan_out.extend(&frame);
            self.last_ack_sent = self.nrecvd;
        }
    }

    /** Collect updates for every entry that needs one */
    fn collect_dirty(&mut self) -> Result<(), String> {
        let pending: Vec<_> = self
            .map
            .entries()
            .filter(|e| needs_collect(&e.borrow()))
            .cloned()
            .collect();
        for e in pending {
            self.map.collect_update(&e, &self.pool, &self.queue)?;
            /* Un-acked frames stay in the replay queue, so the snapshot is
             * considered transmitted as soon as its tasks are queued */
            self.map.finish_update(&e)?;
        }
        Ok(())
    }

    /** Parse complete frames out of chan_in and dispatch them */
    fn process_incoming(&mut self) -> Result<ChanEvent, String> {
        let mut pos = 0;
        let mut event = ChanEvent::None;
        while self.chan_in.len() - pos >= 8 {
            let header = u32::from_le_bytes(self.chan_in[pos..pos + 4].try_into().unwrap());
            let (len, typ) = parse_header(header)
                .ok_or_else(|| tag!("Corrupt transfer header {:08x}", header))?;
            if len < 8 {
                return Err(tag!("Transfer frame too short: {} bytes", len));
            }
            let padded = padded_size(len);
            if self.chan_in.len() - pos < padded {
                break;
            }
            let block = self.chan_in[pos..pos + len].to_vec();
            pos += padded;

            if is_numbered(typ) {
                self.nrecvd += 1;
            }
            let xid = Rid(i32::from_le_bytes(block[4..8].try_into().unwrap()));
            match typ {
                MsgType::Protocol => {
                    self.app_out.extend(&block[8..]);
                }
                MsgType::Close => {
                    debug!("Peer sent close record");
                    event = ChanEvent::PeerClosed;
                }
                MsgType::Ack => {
                    let count = parse_control_count(&block)?;
                    while matches!(self.replay.front(), Some((no, _)) if *no < count) {
                        self.replay.pop_front();
                    }
                }
                MsgType::Restart => {
                    let count = parse_control_count(&block)?;
                    debug!(
                        "Peer restart at {}, local sent {}, replaying {} frames",
                        count,
                        self.nsent,
                        self.replay.len()
                    );
                    while matches!(self.replay.front(), Some((no, _)) if *no < count) {
                        self.replay.pop_front();
                    }
                    for (_, frame) in &self.replay {
                        self.chan_out.extend(frame);
                    }
                    self.awaiting_restart = false;
                }
                _ => {
                    /* Shadow-table operation. Keep per-entry application in
                     * message order: wait out in-flight tasks first. */
                    if matches!(
                        typ,
                        MsgType::BufferFill | MsgType::BufferDiff | MsgType::ExtendFile
                    ) {
                        let needs_wait = self
                            .map
                            .lookup(xid)
                            .ok()
                            .map(|e| {
                                e.borrow()
                                    .buffer()
                                    .map(|b| b.pending_apply_tasks() > 0)
                                    .unwrap_or(false)
                            })
                            .unwrap_or(false);
                        if needs_wait {
                            self.pool.wait_idle()?;
                        }
                    }
                    self.map.apply_update(&mut self.pool, typ, xid, &block)?;
                }
            }
        }
        self.chan_in.drain(..pos);
        Ok(event)
    }

    /** Write as much of `out` as the socket accepts. Returns true on hangup. */
    fn flush_fd(fd: &OwnedFd, out: &mut VecDeque<u8>) -> Result<bool, String> {
        while !out.is_empty() {
            let (head, _) = out.as_slices();
            match nix::unistd::write(fd, head) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    out.drain(..n);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Ok(true),
                Err(e) => {
                    return Err(tag!("Failed to write to socket: {}", e));
                }
            }
        }
        Ok(false)
    }
}

/** Block until the supervisor passes a replacement channel fd over the link.
 * Returns None if the link closed or shutdown was requested. */
fn await_replacement_fd(link: &OwnedFd) -> Result<Option<OwnedFd>, String> {
    loop {
        if shutdown_requested() {
            return Ok(None);
        }
        let mut pfds = [PollFd::new(link.as_fd(), PollFlags::POLLIN)];
        match nix::poll::poll(&mut pfds, PollTimeout::from(1000_u16)) {
            Ok(0) => continue,
            Ok(_) => (),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(tag!("Poll on link socket failed: {}", e));
            }
        }
        let rev = pfds[0].revents().unwrap_or(PollFlags::empty());
        if rev.contains(PollFlags::POLLIN) {
            return receive_one_fd(link);
        }
        if rev.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            return Ok(None);
        }
    }
}

/** Drive one proxied connection until the application or the channel closes.
 *
 * When `link_fd` is set and the channel drops, the worker blocks reading a
 * replacement channel fd from the link and resumes from the last
 * acknowledged message number. */
pub fn main_interface_loop(
    chanfd: OwnedFd,
    appfd: OwnedFd,
    link_fd: Option<OwnedFd>,
    opts: &Options,
    is_client: bool,
    pollmask: signal::SigSet,
) -> Result<(), String> {
    debug!("Entered main interface loop");
    set_nonblock(&chanfd)?;
    set_nonblock(&appfd)?;

    let mut chanfd = chanfd;
    let mut w = Worker {
        map: TranslationMap::new(!is_client, opts.compression),
        pool: WorkPool::new(resolve_thread_count(opts.threads))?,
        queue: Arc::new(TransferBuffer::new()),
        chan_out: VecDeque::new(),
        app_out: VecDeque::new(),
        chan_in: Vec::new(),
        nsent: 0,
        nrecvd: 0,
        last_ack_sent: 0,
        replay: VecDeque::new(),
        awaiting_restart: false,
        app_eof: false,
        close_queued: false,
        stop_seen: false,
    };

    'outer: loop {
        if shutdown_requested() {
            debug!("Shutdown requested, worker exiting");
            break;
        }
        if let Some(e) = w.pool.take_error() {
            return Err(e);
        }

        w.map.service_pipes();
        w.collect_dirty()?;
        w.stage_outgoing();
        w.stage_ack();

        if w.app_eof && !w.close_queued && w.queue.in_flight() == 0 {
            w.close_queued = true;
            let mut v: Vec<u8> = cat2x4(
                build_header(MsgType::Close, 8).to_le_bytes(),
                0_u32.to_le_bytes(),
            )
            .into();
            v.resize(16, 0);
            w.queue.push(Segment::Data(v));
            w.queue.push(Segment::Stop);
            w.stage_outgoing();
        }

        let mut chan_events = PollFlags::POLLIN;
        if !w.chan_out.is_empty() {
            chan_events |= PollFlags::POLLOUT;
        }
        let mut app_events = PollFlags::empty();
        if !w.app_eof {
            app_events |= PollFlags::POLLIN;
        }
        if !w.app_out.is_empty() {
            app_events |= PollFlags::POLLOUT;
        }
        /* Readable pipe-like fds wake the loop so their streams move */
        let pipe_fds = w.map.pipe_read_fds();
        let mut pfds: Vec<PollFd> = Vec::with_capacity(3 + pipe_fds.len());
        pfds.push(PollFd::new(chanfd.as_fd(), chan_events));
        pfds.push(PollFd::new(appfd.as_fd(), app_events));
        pfds.push(PollFd::new(w.pool.selfpipe_r.as_fd(), PollFlags::POLLIN));
        for fd in &pipe_fds {
            pfds.push(PollFd::new(
                unsafe {
                    /* SAFETY: the entry owning the fd is only released by
                     * service_pipes on this thread, after pfds is gone */
                    BorrowedFd::borrow_raw(*fd)
                },
                PollFlags::POLLIN,
            ));
        }
        match nix::poll::ppoll(&mut pfds, None, Some(pollmask)) {
            Ok(_) => (),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => {
                return Err(tag!("Poll failed: {}", e));
            }
        }
        let chan_rev = pfds[0].revents().unwrap_or(PollFlags::empty());
        let app_rev = pfds[1].revents().unwrap_or(PollFlags::empty());
        let pool_rev = pfds[2].revents().unwrap_or(PollFlags::empty());

        if pool_rev.contains(PollFlags::POLLIN) {
            w.pool.drain_selfpipe();
        }

        let mut chan_dropped = false;

        /* Channel reads */
        if chan_rev.contains(PollFlags::POLLIN) {
            let mut tmp = [0_u8; CHAN_READ_SIZE];
            loop {
                match nix::unistd::read(chanfd.as_raw_fd(), &mut tmp) {
                    Ok(0) => {
                        chan_dropped = true;
                        break;
                    }
                    Ok(n) => {
                        w.chan_in.extend_from_slice(&tmp[..n]);
                        if n < tmp.len() {
                            break;
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::ECONNRESET) => {
                        chan_dropped = true;
                        break;
                    }
                    Err(e) => {
                        return Err(tag!("Failed to read from channel: {}", e));
                    }
                }
            }
            match w.process_incoming()? {
                ChanEvent::PeerClosed => {
                    /* flush what the peer already produced, then stop */
                    let _ = Worker::flush_fd(&appfd, &mut w.app_out)?;
                    break 'outer;
                }
                ChanEvent::None => (),
            }
        } else if chan_rev.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            chan_dropped = true;
        }

        /* Application reads */
        if app_rev.contains(PollFlags::POLLIN) {
            let mut tmp = [0_u8; APP_READ_SIZE];
            loop {
                match nix::unistd::read(appfd.as_raw_fd(), &mut tmp) {
                    Ok(0) => {
                        debug!("Application connection closed");
                        w.app_eof = true;
                        break;
                    }
                    Ok(n) => {
                        let mut frame = Vec::with_capacity(align16(8 + n));
                        frame.extend_from_slice(&cat2x4(
                            build_header(MsgType::Protocol, 8 + n).to_le_bytes(),
                            0_u32.to_le_bytes(),
                        ));
                        frame.extend_from_slice(&tmp[..n]);
                        frame.resize(align16(frame.len()), 0);
                        w.queue.push(Segment::Data(frame));
                        if n < tmp.len() {
                            break;
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::ECONNRESET) => {
                        w.app_eof = true;
                        break;
                    }
                    Err(e) => {
                        return Err(tag!("Failed to read from application: {}", e));
                    }
                }
            }
        } else if app_rev.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            w.app_eof = true;
        }

        /* Writes */
        w.stage_outgoing();
        w.stage_ack();
        if Worker::flush_fd(&appfd, &mut w.app_out)? {
            w.app_eof = true;
            w.app_out.clear();
        }
        if !chan_dropped && Worker::flush_fd(&chanfd, &mut w.chan_out)? {
            chan_dropped = true;
        }

        if chan_dropped {
            let Some(ref link) = link_fd else {
                debug!("Channel closed and session is not reconnectable, exiting");
                break;
            };
            error!("Channel connection lost, waiting for replacement");
            let Some(new_fd) = await_replacement_fd(link)? else {
                debug!("Link closed while waiting for replacement channel");
                break;
            };
            set_nonblock(&new_fd)?;
            chanfd = new_fd;
            /* Partly transmitted frames in either direction are void; the
             * restart exchange determines what gets resent */
            w.chan_in.clear();
            w.chan_out.clear();
            w.last_ack_sent = w.nrecvd;
            w.awaiting_restart = true;
            let frame = make_control_frame(MsgType::Restart, w.nrecvd);
            w.chan_out.extend(&frame);
            debug!("Adopted replacement channel, restart at {}", w.nrecvd);
            continue;
        }

        /* Closing down: the stop sentinel has drained and everything is sent */
        if w.stop_seen && w.chan_out.is_empty() && w.queue.in_flight() == 0 {
            debug!("Application side finished, worker exiting");
            break;
        }
    }

    /* Let in-flight tasks settle so their results are not lost mid-write */
    w.pool.wait_idle()?;
    debug!("Main interface loop done");
    Ok(())
}

/** Whether an entry has anything for [TranslationMap::collect_update] to do */
fn needs_collect(sfd: &ShadowFd) -> bool {
    if sfd.only_here {
        return true;
    }
    match &sfd.data {
        ShadowVariant::Buffer(b) => b.is_dirty && b.pending_apply_tasks() == 0,
        ShadowVariant::Pipe(_) => sfd.pipe_needs_collect(),
    }
}
