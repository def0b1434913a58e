//! Fixed-size buffer pools
//!
//! A pool allocates its headers up front and keeps the free ones in a
//! [`Queue`]. Handing a buffer out and taking it back are the only
//! operations on the hot path; resizing and destruction require every
//! buffer to be home first.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::buffer::{Buffer, Header};
use super::errors::{AllocationError, PoolError};
use super::queue::Queue;

pub(crate) struct PoolShared {
    name: String,
    queue: Queue,
}

impl PoolShared {
    pub(crate) fn queue(&self) -> &Queue {
        &self.queue
    }
}

/// Snapshot of pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub header_count: usize,
    pub payload_size: u32,
    /// Buffers currently on the free queue
    pub available: usize,
    /// Buffers handed out and not yet returned
    pub in_flight: usize,
    pub acquisitions: u64,
    pub recycled: u64,
}

/// Handle to a pool of buffer headers (cheap to clone)
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

fn allocate_headers(count: u32, size: u32) -> Result<Vec<Box<Header>>, AllocationError> {
    if count == 0 {
        return Err(AllocationError::EmptyPool);
    }
    if size == 0 {
        return Err(AllocationError::ZeroSize);
    }
    let total = (count as usize)
        .checked_mul(size as usize)
        .filter(|total| *total <= isize::MAX as usize)
        .ok_or(AllocationError::Overflow { count, size })?;
    debug!("Allocating {} headers of {} bytes ({} bytes total)", count, size, total);

    (0..count).map(|index| Header::allocate(index, size)).collect()
}

impl Pool {
    /// Allocate `count` buffers of `size` payload bytes
    pub fn create(count: u32, size: u32) -> Result<Pool, AllocationError> {
        Self::named("pool", count, size)
    }

    /// Like [`Pool::create`] with a name used in logs and errors
    pub fn named(name: impl Into<String>, count: u32, size: u32) -> Result<Pool, AllocationError> {
        let headers = allocate_headers(count, size)?;
        let shared = Arc::new_cyclic(|home| PoolShared {
            name: name.into(),
            queue: Queue::new(home.clone(), headers, size),
        });
        Ok(Pool { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The free-buffer queue
    pub fn queue(&self) -> &Queue {
        &self.shared.queue
    }

    /// Shorthand for `queue().get()`
    pub fn get(&self) -> Option<Buffer> {
        self.shared.queue.get()
    }

    /// Shorthand for `queue().wait(timeout)`
    pub fn wait(&self, timeout: Duration) -> Option<Buffer> {
        self.shared.queue.wait(timeout)
    }

    pub fn header_count(&self) -> usize {
        self.shared.queue.state().header_count
    }

    pub fn payload_size(&self) -> u32 {
        self.shared.queue.state().payload_size
    }

    pub fn available(&self) -> usize {
        self.shared.queue.state().free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.queue.state().outstanding
    }

    pub fn is_alive(&self) -> bool {
        self.shared.queue.state().alive
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.queue.state();
        PoolStats {
            header_count: state.header_count,
            payload_size: state.payload_size,
            available: state.free.len(),
            in_flight: state.outstanding,
            acquisitions: state.acquisitions,
            recycled: state.recycled,
        }
    }

    /// Replace every header with `count` new ones of `size` bytes.
    ///
    /// Only valid while no buffer is in flight; the old headers are kept if
    /// allocation fails.
    pub fn resize(&self, count: u32, size: u32) -> Result<(), PoolError> {
        self.check_idle()?;
        let headers = allocate_headers(count, size)?;

        let mut state = self.shared.queue.state();
        if !state.alive {
            return Err(PoolError::Destroyed(self.shared.name.clone()));
        }
        if state.outstanding > 0 {
            return Err(self.busy(state.outstanding, state.header_count));
        }
        state.free = headers.into();
        state.header_count = count as usize;
        state.payload_size = size;
        state.generation += 1;
        drop(state);

        debug!("Pool '{}' resized to {} x {} bytes", self.shared.name, count, size);
        self.shared.queue.wake_all();
        Ok(())
    }

    /// Wait up to `timeout` for every buffer to come home
    pub fn drain(&self, timeout: Duration) -> Result<(), PoolError> {
        match self.shared.queue.wait_returned(timeout) {
            0 => Ok(()),
            in_flight => Err(self.busy(in_flight, self.header_count())),
        }
    }

    /// Drain, then free every header.
    ///
    /// Fails with [`PoolError::Busy`] and leaves the pool intact if buffers
    /// are still out when `timeout` expires.
    pub fn destroy(&self, timeout: Duration) -> Result<(), PoolError> {
        self.drain(timeout)?;
        self.close();
        Ok(())
    }

    /// Free all queued headers now.
    ///
    /// Buffers still in flight are freed when they are released.
    pub fn close(&self) {
        let mut state = self.shared.queue.state();
        if !state.alive {
            return;
        }
        state.alive = false;
        state.free.clear();
        if state.outstanding > 0 {
            warn!(
                "Pool '{}' closed with {} buffers in flight; they will be freed on release",
                self.shared.name, state.outstanding
            );
        }
        drop(state);
        self.shared.queue.wake_all();
    }

    fn check_idle(&self) -> Result<(), PoolError> {
        let state = self.shared.queue.state();
        if !state.alive {
            return Err(PoolError::Destroyed(self.shared.name.clone()));
        }
        if state.outstanding > 0 {
            return Err(self.busy(state.outstanding, state.header_count));
        }
        Ok(())
    }

    fn busy(&self, in_flight: usize, header_count: usize) -> PoolError {
        PoolError::Busy {
            pool: self.shared.name.clone(),
            in_flight,
            header_count,
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_populates_queue() {
        let pool = Pool::create(4, 1024).unwrap();
        assert_eq!(pool.header_count(), 4);
        assert_eq!(pool.payload_size(), 1024);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.get().unwrap().allocated_size(), 1024);
    }

    #[test]
    fn test_create_rejects_bad_sizes() {
        assert_eq!(Pool::create(0, 16).unwrap_err(), AllocationError::EmptyPool);
        assert_eq!(Pool::create(4, 0).unwrap_err(), AllocationError::ZeroSize);
    }

    #[test]
    fn test_conservation_while_buffers_move() {
        let pool = Pool::create(4, 64).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.available + stats.in_flight, stats.header_count);
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.available, 4);
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.recycled, 2);
    }

    #[test]
    fn test_resize_busy_then_retry() {
        let pool = Pool::create(4, 1024).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();

        let err = pool.resize(8, 2048).unwrap_err();
        assert!(matches!(err, PoolError::Busy { in_flight: 2, header_count: 4, .. }));
        assert_eq!(pool.header_count(), 4);
        assert_eq!(pool.payload_size(), 1024);
        assert_eq!(pool.available(), 2);

        drop(a);
        drop(b);
        pool.resize(8, 2048).unwrap();
        assert_eq!(pool.header_count(), 8);
        assert_eq!(pool.payload_size(), 2048);
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.get().unwrap().allocated_size(), 2048);
    }

    #[test]
    fn test_resize_failure_keeps_old_headers() {
        let pool = Pool::create(2, 16).unwrap();
        assert!(matches!(
            pool.resize(0, 16),
            Err(PoolError::Allocation(AllocationError::EmptyPool))
        ));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_destroy_waits_for_outstanding() {
        let pool = Pool::create(2, 16).unwrap();
        let held = pool.get().unwrap();

        let err = pool.destroy(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, PoolError::Busy { in_flight: 1, .. }));
        assert!(pool.is_alive());

        drop(held);
        pool.destroy(Duration::from_millis(20)).unwrap();
        assert!(!pool.is_alive());
        assert!(pool.get().is_none());
        assert!(matches!(pool.resize(2, 16), Err(PoolError::Destroyed(_))));
    }

    #[test]
    fn test_wait_returns_none_after_close() {
        let pool = Pool::create(1, 16).unwrap();
        let _held = pool.get().unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.wait(Duration::from_secs(5)).is_none())
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.close();
        assert!(waiter.join().unwrap());
    }
}
