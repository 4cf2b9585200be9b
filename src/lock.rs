//! Locking for heap collections.
//!
//! Every collection sits behind one reader/writer lock. Embedders that already
//! serialize all allocator calls can opt out of real locking; the collection then
//! uses [`UncontendedRawRwLock`], which never parks a thread and panics if the
//! promise of external synchronization is ever broken.

use std::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::{
    RwLock, RwLockReadGuard, RwLockWriteGuard,
    lock_api::{self, GuardSend, RawRwLock},
};

const WRITER: usize = usize::MAX;

/// Raw reader/writer lock that expects to never be contended.
///
/// The state is a reader count, or [`WRITER`] while exclusively held. Acquiring
/// a lock that is not free is a caller bug and panics instead of waiting.
pub(crate) struct UncontendedRawRwLock {
    state: AtomicUsize,
}

// SAFETY: `state` admits either any number of readers or one writer, never both.
unsafe impl RawRwLock for UncontendedRawRwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        state: AtomicUsize::new(0),
    };

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        if !self.try_lock_shared() {
            panic!("externally synchronized allocator read while being modified");
        }
    }

    fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state >= WRITER - 1 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    unsafe fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        if !self.try_lock_exclusive() {
            panic!("externally synchronized allocator modified concurrently");
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        self.state.store(0, Ordering::Release);
    }
}

type UncontendedRwLock<T> = lock_api::RwLock<UncontendedRawRwLock, T>;

/// Reader/writer lock around one collection.
pub(crate) enum CollectionLock<T> {
    Internal(RwLock<T>),
    External(UncontendedRwLock<T>),
}

pub(crate) enum ReadGuard<'a, T> {
    Internal(RwLockReadGuard<'a, T>),
    External(lock_api::RwLockReadGuard<'a, UncontendedRawRwLock, T>),
}

pub(crate) enum WriteGuard<'a, T> {
    Internal(RwLockWriteGuard<'a, T>),
    External(lock_api::RwLockWriteGuard<'a, UncontendedRawRwLock, T>),
}

impl<T> CollectionLock<T> {
    pub fn new(value: T, externally_synchronized: bool) -> Self {
        if externally_synchronized {
            Self::External(UncontendedRwLock::new(value))
        } else {
            Self::Internal(RwLock::new(value))
        }
    }

    /// Shared access for queries.
    pub fn read(&self) -> ReadGuard<'_, T> {
        match self {
            Self::Internal(lock) => ReadGuard::Internal(lock.read()),
            Self::External(lock) => ReadGuard::External(lock.read()),
        }
    }

    /// Exclusive access for allocate, free and resize.
    pub fn write(&self) -> WriteGuard<'_, T> {
        match self {
            Self::Internal(lock) => WriteGuard::Internal(lock.write()),
            Self::External(lock) => WriteGuard::External(lock.write()),
        }
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Internal(guard) => guard,
            Self::External(guard) => guard,
        }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Internal(guard) => guard,
            Self::External(guard) => guard,
        }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            Self::Internal(guard) => guard,
            Self::External(guard) => guard,
        }
    }
}
