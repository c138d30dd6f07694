/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Mirror buffers: an owned copy of the last-transmitted contents of a shared buffer */
use crate::util::AlignedArray;
use std::ops::Range;
use std::sync::Mutex;

struct MirrorState {
    data: AlignedArray,
    /* Byte spans currently loaned out to tasks */
    ranges: Vec<(usize, usize)>,
}

/** A byte vector with range-based access control.
 *
 * Worker-pool tasks operate on disjoint damage shards of the same shadow
 * entry concurrently; each takes out a [MirrorRange] covering its shard, and
 * the overlap check turns an accounting mistake into a visible failure
 * instead of a data race. */
pub struct Mirror {
    state: Mutex<MirrorState>,
}

pub struct MirrorRange<'a> {
    mirror: &'a Mirror,
    span: (usize, usize),
    pub data: &'a mut [u8],
}

fn ranges_overlap(a: &(usize, usize), b: &(usize, usize)) -> bool {
    b.0 < a.1 && a.0 < b.1
}

impl Drop for MirrorRange<'_> {
    fn drop(&mut self) {
        let mut guard = self.mirror.state.lock().unwrap();
        let i = guard.ranges.iter().position(|x| *x == self.span).unwrap();
        guard.ranges.swap_remove(i);
    }
}

impl Mirror {
    /** Create a zero-filled mirror of the given size */
    pub fn new(size: usize) -> Mirror {
        Mirror {
            state: Mutex::new(MirrorState {
                data: AlignedArray::new(size),
                ranges: Vec::new(),
            }),
        }
    }

    /** Get exclusive access to a subrange of the mirror.
     *
     * Returns None if the range is out of bounds, empty, or overlaps a range
     * that is already checked out. */
    pub fn get_mut_range<'a>(&'a self, span: Range<usize>) -> Option<MirrorRange<'a>> {
        if span.end <= span.start {
            return None;
        }
        let x = (span.start, span.end);

        let mut guard = self.state.lock().unwrap();
        if x.1 > guard.data.get_parts().1 {
            return None;
        }
        for sp in &guard.ranges {
            if ranges_overlap(sp, &x) {
                return None;
            }
        }
        guard.ranges.push(x);

        let (base, _len) = guard.data.get_parts();
        let start: isize = x.0.try_into().unwrap();
        unsafe {
            /* SAFETY: 0 <= x.0 < x.1 <= allocation size, so base is not null
             * and base+start..base+start+len is in bounds; no overlapping
             * range is checked out, and this one is only released when the
             * returned MirrorRange drops, so the slice is not aliased. The
             * allocation was zero-initialized. */
            let s: &mut [u8] = std::slice::from_raw_parts_mut(base.offset(start), x.1 - x.0);
            Some(MirrorRange {
                mirror: self,
                span: x,
                data: s,
            })
        }
    }

    /** Increase the size of the mirror, preserving contents; panics if any
     * range is checked out. */
    pub fn extend(&mut self, new_size: usize) {
        let mut guard = self.state.lock().unwrap();
        /* Replacing the backing array invalidates loaned slices; there must be none */
        assert!(guard.ranges.is_empty());
        let old_size = guard.data.get_parts().1;
        assert!(
            old_size <= new_size,
            "mirror shrink: {} > {}",
            old_size,
            new_size
        );
        if new_size == old_size {
            return;
        }
        let mut new = AlignedArray::new(new_size);
        new.get_mut()[..old_size].copy_from_slice(guard.data.get());
        guard.data = new;
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().data.get_parts().1
    }
}
