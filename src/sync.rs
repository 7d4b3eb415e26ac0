//! Synchronization primitives shared by frames, streams and the registry.
//!
//! Lock failures (poisoning) never panic: they are logged and surfaced as
//! [`Error::InternalFault`].

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::error;

use crate::error::{Error, Result};

/// Lock a mutex, mapping poisoning to [`Error::InternalFault`].
pub fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| {
        error!(lock = what, "could not lock mutex");
        Error::InternalFault(format!("could not lock {what}"))
    })
}

/// Wait on a condition variable with a timeout.
///
/// Returns the reacquired guard and whether the wait timed out.
pub fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    what: &str,
) -> Result<(MutexGuard<'a, T>, bool)> {
    condvar
        .wait_timeout(guard, timeout)
        .map(|(guard, result)| (guard, result.timed_out()))
        .map_err(|_| {
            error!(lock = what, "could not wait on condition");
            Error::InternalFault(format!("could not wait on {what}"))
        })
}

fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>, what: &str) -> Result<MutexGuard<'a, T>> {
    condvar.wait(guard).map_err(|_| {
        error!(lock = what, "could not wait on condition");
        Error::InternalFault(format!("could not wait on {what}"))
    })
}

/// Reader/writer lock with an exclusive "drain" mode.
///
/// Plain reads and writes behave like [`RwLock`]. A drained write
/// ([`ReaderWriterLock::enter_write_exclusive`]) additionally stops new
/// readers from entering while it waits for the active ones to leave, so a
/// steady stream of readers cannot starve it. Upgrading a read guard to a
/// write guard is not supported and will deadlock.
#[derive(Debug, Default)]
pub struct ReaderWriterLock<T> {
    data: RwLock<T>,
    draining: Mutex<bool>,
    drained: Condvar,
    name: &'static str,
}

impl<T> ReaderWriterLock<T> {
    /// Create a lock around `value`; `name` identifies it in logs.
    #[must_use]
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            data: RwLock::new(value),
            draining: Mutex::new(false),
            drained: Condvar::new(),
            name,
        }
    }

    /// Acquire shared access. Waits while a drained write is pending.
    pub fn enter_read(&self) -> Result<RwLockReadGuard<'_, T>> {
        {
            let mut draining = lock(&self.draining, self.name)?;
            while *draining {
                draining = wait(&self.drained, draining, self.name)?;
            }
        }
        self.data.read().map_err(|_| self.fault("read"))
    }

    /// Acquire plain exclusive access.
    pub fn enter_write(&self) -> Result<RwLockWriteGuard<'_, T>> {
        self.data.write().map_err(|_| self.fault("write"))
    }

    /// Acquire exclusive access, blocking new readers until it is released.
    pub fn enter_write_exclusive(&self) -> Result<ExclusiveWriteGuard<'_, T>> {
        {
            let mut draining = lock(&self.draining, self.name)?;
            while *draining {
                draining = wait(&self.drained, draining, self.name)?;
            }
            *draining = true;
        }
        match self.data.write() {
            Ok(guard) => Ok(ExclusiveWriteGuard { guard, owner: self }),
            Err(_) => {
                self.release_drain();
                Err(self.fault("exclusive write"))
            }
        }
    }

    /// Returns `true` while a drained write is pending or held.
    pub fn is_draining(&self) -> bool {
        lock(&self.draining, self.name).is_ok_and(|draining| *draining)
    }

    fn release_drain(&self) {
        if let Ok(mut draining) = lock(&self.draining, self.name) {
            *draining = false;
        }
        self.drained.notify_all();
    }

    fn fault(&self, mode: &str) -> Error {
        error!(lock = self.name, mode, "could not acquire reader/writer lock");
        Error::InternalFault(format!("could not {mode}-lock {}", self.name))
    }
}

/// Write guard returned by [`ReaderWriterLock::enter_write_exclusive`].
///
/// Readers are readmitted when the guard is dropped.
pub struct ExclusiveWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    owner: &'a ReaderWriterLock<T>,
}

impl<T> Deref for ExclusiveWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ExclusiveWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ExclusiveWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.release_drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_and_write() {
        let lock = ReaderWriterLock::new("test", vec![1, 2]);
        {
            let a = lock.enter_read().expect("read should succeed");
            let b = lock.enter_read().expect("second read should succeed");
            assert_eq!(a.len(), b.len());
        }
        lock.enter_write().expect("write should succeed").push(3);
        assert_eq!(lock.enter_read().expect("read should succeed").len(), 3);
    }

    #[test]
    fn test_exclusive_write_blocks_new_readers() {
        let lock = Arc::new(ReaderWriterLock::new("test", 0u32));
        let writer_done = Arc::new(AtomicBool::new(false));

        let reader = lock.enter_read().expect("read should succeed");

        let writer = {
            let lock = Arc::clone(&lock);
            let writer_done = Arc::clone(&writer_done);
            thread::spawn(move || {
                let mut guard = lock
                    .enter_write_exclusive()
                    .expect("exclusive write should succeed");
                *guard = 7;
                thread::sleep(Duration::from_millis(20));
                writer_done.store(true, Ordering::SeqCst);
            })
        };

        while !lock.is_draining() {
            thread::sleep(Duration::from_millis(1));
        }

        let late_reader = {
            let lock = Arc::clone(&lock);
            let writer_done = Arc::clone(&writer_done);
            thread::spawn(move || {
                let value = *lock.enter_read().expect("late read should succeed");
                (value, writer_done.load(Ordering::SeqCst))
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(reader);

        writer.join().expect("writer thread should finish");
        let (value, saw_writer_done) = late_reader.join().expect("reader thread should finish");
        assert_eq!(value, 7);
        assert!(saw_writer_done, "late reader must enter after the drained write");
        assert!(!lock.is_draining());
    }

    #[test]
    fn test_lock_reports_poisoning() {
        let mutex = Arc::new(Mutex::new(0));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock();
            std::panic::panic_any("poison");
        })
        .join();

        let result = lock(&mutex, "poisoned");
        assert!(matches!(result, Err(Error::InternalFault(_))));
    }
}
