//! Free-buffer queue shared by native callback threads and the application
//!
//! One lock guards the free list together with the outstanding count, so
//! `available + in_flight == header_count` holds at every observation point.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use super::buffer::{Buffer, Header};
use super::lock;
use super::pool::PoolShared;

pub(crate) struct QueueState {
    pub(crate) free: VecDeque<Box<Header>>,
    pub(crate) outstanding: usize,
    pub(crate) header_count: usize,
    pub(crate) payload_size: u32,
    pub(crate) generation: u64,
    pub(crate) alive: bool,
    pub(crate) acquisitions: u64,
    pub(crate) recycled: u64,
}

/// Thread-safe FIFO of free buffer headers belonging to one pool
pub struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
    home: Weak<PoolShared>,
}

impl Queue {
    pub(crate) fn new(home: Weak<PoolShared>, headers: Vec<Box<Header>>, payload_size: u32) -> Self {
        let header_count = headers.len();
        Self {
            state: Mutex::new(QueueState {
                free: headers.into(),
                outstanding: 0,
                header_count,
                payload_size,
                generation: 0,
                alive: true,
                acquisitions: 0,
                recycled: 0,
            }),
            ready: Condvar::new(),
            home,
        }
    }

    pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    /// Pop a free buffer without blocking
    pub fn get(&self) -> Option<Buffer> {
        let mut state = lock(&self.state);
        self.take(&mut state)
    }

    /// Block up to `timeout` for a free buffer
    pub fn wait(&self, timeout: Duration) -> Option<Buffer> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(buffer) = self.take(&mut state) {
                return Some(buffer);
            }
            if !state.alive {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Put a buffer back on the queue.
    ///
    /// Only the last reference to a header puts it back; an earlier one is
    /// just dropped. A buffer from a different pool is not accepted here; it
    /// goes back to its own pool instead.
    pub fn put(&self, buffer: Buffer) {
        if !buffer.belongs_to(&self.home) {
            warn!("Buffer {} put on a foreign queue; returning it to its own pool", buffer.index());
            drop(buffer);
            return;
        }
        if let Some((header, generation)) = buffer.detach() {
            self.recycle(header, generation);
        }
    }

    /// Number of free buffers
    pub fn len(&self) -> usize {
        lock(&self.state).free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, state: &mut QueueState) -> Option<Buffer> {
        let header = state.free.pop_front()?;
        state.outstanding += 1;
        state.acquisitions += 1;
        Some(Buffer::new(header, self.home.clone(), state.generation))
    }

    pub(crate) fn recycle(&self, mut header: Box<Header>, generation: u64) {
        let mut state = lock(&self.state);
        if generation != state.generation {
            trace!("Freeing buffer {} from a previous pool generation", header.index());
            return;
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.alive {
            header.reset();
            state.free.push_back(header);
            state.recycled += 1;
        } else {
            trace!("Freeing buffer {} released after pool close", header.index());
        }
        drop(state);
        self.ready.notify_all();
    }

    pub(crate) fn accepts(&self, generation: u64) -> bool {
        let state = lock(&self.state);
        state.alive && state.generation == generation
    }

    /// Wait until no buffers are outstanding; returns how many still are
    pub(crate) fn wait_returned(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.outstanding == 0 {
                return 0;
            }
            let now = Instant::now();
            if now >= deadline {
                return state.outstanding;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Wake every waiter, e.g. after the pool is closed
    pub(crate) fn wake_all(&self) {
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Pool;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_fifo_order() {
        let pool = Pool::create(3, 8).unwrap();
        let queue = pool.queue();
        let a = queue.get().unwrap();
        let b = queue.get().unwrap();
        let c = queue.get().unwrap();
        assert!(queue.get().is_none());
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        queue.put(b);
        queue.put(a);
        assert_eq!(queue.get().unwrap().index(), 1);
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let pool = Pool::create(1, 8).unwrap();
        let _held = pool.get().unwrap();
        let start = Instant::now();
        assert!(pool.queue().wait(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_wakes_on_release() {
        let pool = Pool::create(1, 8).unwrap();
        let held = pool.get().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(held);
        });
        let buffer = pool.queue().wait(Duration::from_secs(2));
        assert!(buffer.is_some());
        releaser.join().unwrap();
    }

    #[test]
    fn test_foreign_buffer_goes_home() {
        let first = Pool::create(1, 8).unwrap();
        let second = Pool::create(1, 8).unwrap();
        let buffer = second.get().unwrap();
        first.queue().put(buffer);
        assert_eq!(first.available(), 1);
        assert_eq!(second.available(), 1);
        assert_eq!(second.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_get_put_conserves_headers() {
        let pool = Pool::create(4, 64).unwrap();
        let taken = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let taken = Arc::clone(&taken);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(buffer) = pool.queue().wait(Duration::from_millis(100)) {
                            taken.fetch_add(1, Ordering::Relaxed);
                            let stats = pool.stats();
                            assert_eq!(stats.available + stats.in_flight, stats.header_count);
                            pool.queue().put(buffer);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(taken.load(Ordering::Relaxed), 2000);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.in_flight(), 0);
    }
}
