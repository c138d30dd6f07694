/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Wire framing for the channel, and the shared transfer buffer */
use crate::util::align16;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum MsgType {
    /** A batch of raw Wayland protocol bytes to deliver to the application
     * socket on the other side. Preceding messages create or update the
     * file descriptors the batch refers to. */
    Protocol = 0,
    /** Create a new shared memory file of the given size.
     * Format: header, xid, u32 size */
    OpenFile = 1,
    /** Provide a new (larger) size for the file buffer.
     * Format: header, xid, u32 size */
    ExtendFile = 2,
    /** Create a new DMABUF stand-in with the given size and metadata block.
     * Format: header, xid, u32 size, dmabuf metadata */
    OpenDmabuf = 3,
    /** Fill a byte range of the buffer with the (possibly compressed) data.
     * Format: header, xid, u32 start, u32 end, payload */
    BufferFill = 4,
    /** Apply a diff stream to the buffer; payload may be compressed.
     * Format: header, xid, u32 uncompressed size, u32 zero, payload */
    BufferDiff = 5,
    /** Create a new pipe; the receiver reads from its end.
     * Format: header, xid */
    OpenPipeRead = 6,
    /** Create a new pipe; the receiver writes to its end. */
    OpenPipeWrite = 7,
    /** Append bytes to the pipe stream. Format: header, xid, bytes */
    PipeData = 8,
    /** The pipe was closed on the sending side. Format: header, xid */
    PipeClose = 9,
    /** Acknowledge receipt of the first `count` numbered messages, so the
     * sender can drop them from its replay queue.
     * Format: header, u32 zero, u64 count. Not itself numbered. */
    Ack = 10,
    /** After reconnecting, announce how many numbered messages this side
     * has received; the peer resends everything after that.
     * Format: header, u32 zero, u64 count. Not itself numbered. */
    Restart = 11,
    /** The sending endpoint is closing. Format: header, xid */
    Close = 12,
    /** Create a bidirectional pipe-like stream (socketpair-backed).
     * Format: header, xid */
    OpenPipeRw = 13,
}

pub fn build_header(typ: MsgType, len: usize) -> u32 {
    u32::try_from(len).unwrap().checked_mul(1 << 5).unwrap() | (typ as u32)
}

/** The size in bytes of the message, excluding trailing padding */
pub fn transfer_size(header: u32) -> usize {
    (header >> 5) as usize
}

/** Parse a frame header into (unpadded length, type) */
pub fn parse_header(header: u32) -> Option<(usize, MsgType)> {
    let t = match header & ((1 << 5) - 1) {
        0 => MsgType::Protocol,
        1 => MsgType::OpenFile,
        2 => MsgType::ExtendFile,
        3 => MsgType::OpenDmabuf,
        4 => MsgType::BufferFill,
        5 => MsgType::BufferDiff,
        6 => MsgType::OpenPipeRead,
        7 => MsgType::OpenPipeWrite,
        8 => MsgType::PipeData,
        9 => MsgType::PipeClose,
        10 => MsgType::Ack,
        11 => MsgType::Restart,
        12 => MsgType::Close,
        13 => MsgType::OpenPipeRw,
        _ => {
            return None;
        }
    };
    Some((transfer_size(header), t))
}

/** Bytes the frame occupies on the wire: payload padded so the next header
 * is 16-byte aligned */
pub fn padded_size(len: usize) -> usize {
    align16(len)
}

/** Is the message counted by the ack/replay scheme? */
pub fn is_numbered(typ: MsgType) -> bool {
    !matches!(typ, MsgType::Ack | MsgType::Restart)
}

/** One finished unit in the transfer buffer */
pub enum Segment {
    /** A complete wire frame (possibly empty, for elided null updates) */
    Data(Vec<u8>),
    /** Ends the stream; the consumer exits after draining */
    Stop,
}

struct TransferState {
    /* Completed segments not yet handed to the consumer, by message number */
    filled: BTreeMap<u64, Segment>,
    /* Message numbers [start, end) are reserved; those present in `filled`
     * are complete, the rest are still being produced */
    start: u64,
    end: u64,
}

/** An ordered queue of outgoing transfer segments.
 *
 * Producers (worker-pool tasks) reserve a message number when the work is
 * scheduled and complete it when the payload is ready, in any order; the
 * consumer (the channel writer) drains strictly in message-number order,
 * waiting for gaps to fill. */
pub struct TransferBuffer {
    state: Mutex<TransferState>,
    filled_cv: Condvar,
}

impl TransferBuffer {
    pub fn new() -> TransferBuffer {
        TransferBuffer {
            state: Mutex::new(TransferState {
                filled: BTreeMap::new(),
                start: 0,
                end: 0,
            }),
            filled_cv: Condvar::new(),
        }
    }

    /** Allocate the next message number; the segment must later be provided
     * via [TransferBuffer::complete]. */
    pub fn reserve(&self) -> u64 {
        let mut guard = self.state.lock().unwrap();
        let n = guard.end;
        guard.end += 1;
        n
    }

    /** Provide the segment for a previously reserved number */
    pub fn complete(&self, msgno: u64, seg: Segment) {
        let mut guard = self.state.lock().unwrap();
        assert!(msgno >= guard.start && msgno < guard.end);
        let prev = guard.filled.insert(msgno, seg);
        assert!(prev.is_none(), "transfer segment {} completed twice", msgno);
        self.filled_cv.notify_all();
    }

    /** Reserve and immediately complete, for in-order producers */
    pub fn push(&self, seg: Segment) -> u64 {
        let mut guard = self.state.lock().unwrap();
        let n = guard.end;
        guard.end += 1;
        guard.filled.insert(n, seg);
        self.filled_cv.notify_all();
        n
    }

    /** Take all segments that are ready in sequence order. Does not block;
     * a reserved-but-incomplete number stops the drain. */
    pub fn pop_ready(&self) -> Vec<(u64, Segment)> {
        let mut guard = self.state.lock().unwrap();
        let mut out = Vec::new();
        loop {
            let start = guard.start;
            let Some(seg) = guard.filled.remove(&start) else {
                break;
            };
            out.push((start, seg));
            guard.start += 1;
        }
        out
    }

    /** Block until the segment with the next sequence number is complete,
     * or the buffer is fully drained. Used by tests and shutdown paths;
     * the main loop prefers [TransferBuffer::pop_ready] with poll wakeups. */
    pub fn pop_blocking(&self) -> Option<(u64, Segment)> {
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.start == guard.end {
                return None;
            }
            let n = guard.start;
            if let Some(seg) = guard.filled.remove(&n) {
                guard.start += 1;
                return Some((n, seg));
            }
            guard = self.filled_cv.wait(guard).unwrap();
        }
    }

    /** Number of reserved-but-undrained segments */
    pub fn in_flight(&self) -> u64 {
        let guard = self.state.lock().unwrap();
        guard.end - guard.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        for (t, len) in [
            (MsgType::Protocol, 0_usize),
            (MsgType::OpenFile, 12),
            (MsgType::BufferDiff, 1 << 20),
            (MsgType::Close, 8),
        ] {
            let h = build_header(t, len);
            assert_eq!(parse_header(h), Some((len, t)));
            assert_eq!(transfer_size(h), len);
        }
        /* unknown type code */
        assert_eq!(parse_header(31), None);
        assert_eq!(padded_size(9), 16);
        assert_eq!(padded_size(16), 16);
    }

    #[test]
    fn test_out_of_order_completion() {
        let tb = TransferBuffer::new();
        let a = tb.reserve();
        let b = tb.reserve();
        let c = tb.reserve();
        assert_eq!((a, b, c), (0, 1, 2));

        tb.complete(c, Segment::Data(vec![3]));
        tb.complete(a, Segment::Data(vec![1]));
        /* b is missing: only a is drained */
        let ready = tb.pop_ready();
        assert_eq!(ready.len(), 1);
        assert!(matches!(&ready[0].1, Segment::Data(v) if v == &vec![1]));

        tb.complete(b, Segment::Data(vec![2]));
        let ready = tb.pop_ready();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].0, 1);
        assert_eq!(ready[1].0, 2);
        assert_eq!(tb.in_flight(), 0);
    }

    #[test]
    fn test_blocking_pop() {
        use std::sync::Arc;
        let tb = Arc::new(TransferBuffer::new());
        let n = tb.reserve();
        let tb2 = tb.clone();
        let j = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            tb2.complete(n, Segment::Data(vec![9]));
        });
        let got = tb.pop_blocking().unwrap();
        assert_eq!(got.0, n);
        j.join().unwrap();
        assert!(tb.pop_blocking().is_none());
    }
}
