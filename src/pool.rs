/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Worker thread pool for diff, compression, and apply tasks */
use crate::compress::{CompCtx, DecompCtx};
use crate::shadow::{Task, run_task};
use crate::tag;
use log::{debug, error};
use nix::fcntl;
use nix::unistd;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex};

/** Data specific to a single task-running thread */
pub struct ThreadCache {
    /* Scratch vector for intermediate diff / decompression contents; grown as needed */
    pub large: Vec<u8>,
    pub comp: CompCtx,
    pub decomp: DecompCtx,
}

impl ThreadCache {
    fn new() -> ThreadCache {
        ThreadCache {
            large: Vec::new(),
            comp: CompCtx::new(),
            decomp: DecompCtx::new(),
        }
    }
    /** Borrow a zeroed scratch slice of the given length */
    pub fn scratch(&mut self, len: usize) -> &mut [u8] {
        if self.large.len() < len {
            self.large.resize(len, 0);
        }
        self.large[..len].fill(0);
        &mut self.large[..len]
    }
}

struct TaskQueue {
    tasks: VecDeque<Task>,
    /* Tasks dequeued but not yet completed */
    in_progress: usize,
    /* Cooperative shutdown; in-flight tasks are not interrupted */
    stop: bool,
    /* First fatal task error, read by the enqueuer on next drain */
    error: Option<String>,
}

struct PoolShared {
    queue: Mutex<TaskQueue>,
    cond: Condvar,
    selfpipe_w: OwnedFd,
}

/** A fixed pool of worker threads plus the enqueuing thread.
 *
 * Completion of any task is signalled by a write to the self-pipe, so the
 * enqueuer can include the pool in its poll set instead of busy-waiting. */
pub struct WorkPool {
    shared: Arc<PoolShared>,
    threads: Vec<std::thread::JoinHandle<()>>,
    pub selfpipe_r: OwnedFd,
    /* Cache for tasks the enqueuing thread runs itself while draining */
    own_cache: ThreadCache,
}

/* Wake the pipe's reader; failure to write because the pipe is full is fine,
 * a wakeup is already pending then */
fn wakeup_fd(fd: &OwnedFd) {
    let zero = [0_u8];
    loop {
        match unistd::write(fd, &zero) {
            Ok(_) | Err(nix::errno::Errno::EAGAIN) => return,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                panic!("Self-pipe wakeup failed: {:?}", e);
            }
        }
    }
}

fn record_result(queue: &mut TaskQueue, result: Result<Option<Task>, String>) -> bool {
    match result {
        Ok(Some(next)) => {
            queue.tasks.push_back(next);
            true
        }
        Ok(None) => false,
        Err(e) => {
            error!("Task failed: {}", e);
            if queue.error.is_none() {
                queue.error = Some(e);
            }
            false
        }
    }
}

fn work_thread(shared: Arc<PoolShared>) {
    let mut cache = ThreadCache::new();

    let mut guard = shared.queue.lock().unwrap();
    loop {
        if guard.stop {
            break;
        }
        let runnable = !matches!(guard.tasks.front(), None | Some(Task::Stop));
        if !runnable {
            if matches!(guard.tasks.front(), Some(Task::Stop)) {
                /* Leave the sentinel for the other threads to see */
                break;
            }
            guard = match shared.cond.wait(guard) {
                Ok(g) => g,
                Err(_) => {
                    error!("Task queue mutex poisoned, stopping worker");
                    return;
                }
            };
            continue;
        }
        let task = guard.tasks.pop_front().unwrap();
        guard.in_progress += 1;
        drop(guard);

        let result = run_task(task, &mut cache);

        guard = shared.queue.lock().unwrap();
        guard.in_progress -= 1;
        if record_result(&mut guard, result) {
            shared.cond.notify_one();
        }
        drop(guard);

        /* write->read establishes happens-before, so the enqueuer observes
         * all queue and transfer-buffer updates made by this task */
        wakeup_fd(&shared.selfpipe_w);

        guard = shared.queue.lock().unwrap();
    }
    debug!(
        "Work thread {} complete",
        std::thread::current().name().unwrap_or("unknown")
    );
}

impl WorkPool {
    /** Create a pool with `nthreads` worker threads. Zero is allowed; all
     * tasks then run on the enqueuing thread inside [WorkPool::wait_idle]. */
    pub fn new(nthreads: usize) -> Result<WorkPool, String> {
        let (pipe_r, pipe_w) = unistd::pipe2(fcntl::OFlag::O_CLOEXEC | fcntl::OFlag::O_NONBLOCK)
            .map_err(|x| tag!("Failed to create self-pipe: {}", x))?;

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                in_progress: 0,
                stop: false,
                error: None,
            }),
            cond: Condvar::new(),
            selfpipe_w: pipe_w,
        });

        let mut threads = Vec::new();
        for i in 0..nthreads {
            let shared_clone = shared.clone();
            let t = std::thread::Builder::new()
                .name(format!("worker{}", i))
                .spawn(move || work_thread(shared_clone))
                .map_err(|x| tag!("Failed to spawn worker thread: {:?}", x))?;
            threads.push(t);
        }

        Ok(WorkPool {
            shared,
            threads,
            selfpipe_r: pipe_r,
            own_cache: ThreadCache::new(),
        })
    }

    pub fn enqueue(&self, task: Task) {
        let mut guard = self.shared.queue.lock().unwrap();
        if matches!(task, Task::Stop) {
            guard.stop = true;
            guard.tasks.push_back(task);
            self.shared.cond.notify_all();
        } else {
            guard.tasks.push_back(task);
            self.shared.cond.notify_one();
        }
    }

    /** Drain the self-pipe after a poll wakeup */
    pub fn drain_selfpipe(&self) {
        let mut flush = [0_u8; 64];
        loop {
            match unistd::read(self.selfpipe_r.as_raw_fd(), &mut flush) {
                Ok(n) if n == flush.len() => continue,
                Ok(_) => return,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return,
            }
        }
    }

    /** Take the pool-level error flag, if a task failed */
    pub fn take_error(&self) -> Option<String> {
        self.shared.queue.lock().unwrap().error.take()
    }

    /** True if no task is queued or running */
    pub fn is_idle(&self) -> bool {
        let guard = self.shared.queue.lock().unwrap();
        guard.tasks.is_empty() && guard.in_progress == 0
    }

    /** Wait until every queued task has completed.
     *
     * The caller also executes tasks itself when one is available: with a
     * zero-sized pool this is the only executor, and with busy workers it
     * lets the enqueuer contribute instead of sleeping. */
    pub fn wait_idle(&mut self) -> Result<(), String> {
        loop {
            self.drain_selfpipe();

            let mut guard = self.shared.queue.lock().unwrap();
            if let Some(e) = guard.error.take() {
                return Err(e);
            }
            if guard.tasks.is_empty() && guard.in_progress == 0 {
                return Ok(());
            }
            let runnable = !matches!(guard.tasks.front(), None | Some(Task::Stop));
            if runnable {
                let task = guard.tasks.pop_front().unwrap();
                guard.in_progress += 1;
                drop(guard);

                let result = run_task(task, &mut self.own_cache);

                let mut guard = self.shared.queue.lock().unwrap();
                guard.in_progress -= 1;
                if record_result(&mut guard, result) {
                    self.shared.cond.notify_one();
                }
                /* Check the exit condition again without sleeping */
            } else {
                drop(guard);
                /* Workers hold the remaining tasks; wait a short amount */
                std::thread::sleep(std::time::Duration::from_micros(100));
            }
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.enqueue(Task::Stop);
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{Segment, TransferBuffer};

    fn echo_task(tb: &Arc<TransferBuffer>, payload: Vec<u8>) -> Task {
        let msgno = tb.reserve();
        Task::Echo {
            queue: tb.clone(),
            msgno,
            payload,
        }
    }

    #[test]
    fn test_pool_drain() {
        /* The drain contract must hold for every pool size, including zero */
        for nthreads in [0_usize, 1, 3] {
            let mut pool = WorkPool::new(nthreads).unwrap();
            let tb = Arc::new(TransferBuffer::new());
            for i in 0..17_u8 {
                pool.enqueue(echo_task(&tb, vec![i]));
            }
            pool.wait_idle().unwrap();
            assert!(pool.is_idle());

            let out = tb.pop_ready();
            assert_eq!(out.len(), 17);
            /* Segments drain in message-number order regardless of the
             * order in which tasks finished */
            for (i, (msgno, seg)) in out.iter().enumerate() {
                assert_eq!(*msgno, i as u64);
                let Segment::Data(v) = seg else { panic!() };
                assert_eq!(v, &vec![i as u8]);
            }
        }
    }

    #[test]
    fn test_pool_error_flag() {
        let mut pool = WorkPool::new(2).unwrap();
        let tb = Arc::new(TransferBuffer::new());
        pool.enqueue(echo_task(&tb, vec![0]));
        pool.enqueue(Task::Fail {
            message: "induced failure".into(),
        });
        pool.enqueue(echo_task(&tb, vec![1]));
        let err = pool.wait_idle().unwrap_err();
        assert!(err.contains("induced failure"));
        /* the flag is consumed */
        pool.wait_idle().unwrap();
    }
}
