//! Deferred reclamation for the lockless read paths.
//!
//! Readers pin the current epoch for the duration of a short critical
//! section and traverse published pointers without taking locks. Writers
//! swap a cell's pointer and retire the previous allocation; a retired
//! allocation is freed only once every pinned reader started at a later
//! epoch, so a reader can never observe freed memory.
//!
//! Pins are cheap (two atomic operations) but must not be held across an
//! `.await`: a parked task would stall reclamation for the whole process.

use std::any::Any;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const QUIESCENT: u64 = 0;

struct Participant {
    /// `QUIESCENT`, or the epoch at which this thread is pinned.
    pinned_epoch: AtomicU64,
}

struct Registry {
    epoch: AtomicU64,
    participants: Mutex<Vec<Arc<Participant>>>,
    retired: Mutex<Vec<(u64, Box<dyn Any + Send>)>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        // epoch 0 is reserved as the quiescent marker
        epoch: AtomicU64::new(1),
        participants: Mutex::new(Vec::new()),
        retired: Mutex::new(Vec::new()),
    })
}

thread_local! {
    static PARTICIPANT: Arc<Participant> = {
        let participant = Arc::new(Participant {
            pinned_epoch: AtomicU64::new(QUIESCENT),
        });
        registry()
            .participants
            .lock()
            .unwrap()
            .push(participant.clone());
        participant
    };
}

/// An epoch pin. References read from an [`RcuCell`] stay valid for as long
///  as the guard lives.
pub struct Guard {
    participant: Arc<Participant>,
    /// whether this guard is the outermost pin on its thread
    owner: bool,
    _not_send: PhantomData<*mut ()>,
}

/// Pin the current thread. Nested pins share the outermost guard's epoch.
pub fn pin() -> Guard {
    let participant = PARTICIPANT.with(|p| p.clone());

    let owner = participant.pinned_epoch.load(Ordering::SeqCst) == QUIESCENT;
    if owner {
        let epoch = registry().epoch.load(Ordering::SeqCst);
        participant.pinned_epoch.store(epoch, Ordering::SeqCst);
    }

    Guard {
        participant,
        owner,
        _not_send: PhantomData,
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.owner {
            self.participant
                .pinned_epoch
                .store(QUIESCENT, Ordering::SeqCst);
        }
    }
}

fn retire(garbage: Box<dyn Any + Send>) {
    let registry = registry();
    let retired_at = registry.epoch.fetch_add(1, Ordering::SeqCst);
    registry.retired.lock().unwrap().push((retired_at, garbage));
    flush();
}

/// Free every retired allocation that no pinned reader can still see.
pub fn flush() {
    let registry = registry();

    let min_pinned = {
        let mut participants = registry.participants.lock().unwrap();
        // prune slots of threads that have exited; a pinned slot is always
        // kept alive by its guard as well
        participants.retain(|p| Arc::strong_count(p) > 1);
        participants
            .iter()
            .map(|p| p.pinned_epoch.load(Ordering::SeqCst))
            .filter(|&epoch| epoch != QUIESCENT)
            .min()
    };

    let garbage: Vec<(u64, Box<dyn Any + Send>)> = {
        let mut retired = registry.retired.lock().unwrap();
        match min_pinned {
            Some(min) => {
                let (keep, free) = retired.drain(..).partition(|(epoch, _)| *epoch >= min);
                *retired = keep;
                free
            }
            None => retired.drain(..).collect(),
        }
    };

    // dropping a retired value can itself retire more (a freed registry map
    // may hold the last reference to a port and its cells), so the drop
    // happens outside the lock
    drop(garbage);
}

/// A single publication slot with lockless readers.
///
/// Writers are expected to serialize externally (the port mutex does this for
/// the flow tables); `replace` itself is a plain swap, not a compare and
/// exchange loop.
pub struct RcuCell<T: Send + Sync + 'static> {
    ptr: AtomicPtr<T>,
}

impl<T: Send + Sync + 'static> RcuCell<T> {
    pub fn new(value: Option<Box<T>>) -> RcuCell<T> {
        RcuCell {
            ptr: AtomicPtr::new(into_raw(value)),
        }
    }

    pub fn empty() -> RcuCell<T> {
        Self::new(None)
    }

    /// Read the currently published value. The reference is valid for the
    ///  lifetime of the guard.
    pub fn read<'g>(&self, _guard: &'g Guard) -> Option<&'g T> {
        let raw = self.ptr.load(Ordering::SeqCst);
        unsafe { raw.as_ref() }
    }

    /// Publish a new value. Readers observe either the old or the new value
    ///  in full; the old allocation is retired and freed after all readers
    ///  that could hold it have unpinned.
    pub fn replace(&self, value: Option<Box<T>>) {
        let old = self.ptr.swap(into_raw(value), Ordering::SeqCst);
        if !old.is_null() {
            retire(unsafe { Box::from_raw(old) });
        }
    }
}

fn into_raw<T>(value: Option<Box<T>>) -> *mut T {
    value.map(Box::into_raw).unwrap_or(ptr::null_mut())
}

impl<T: Send + Sync + 'static> Drop for RcuCell<T> {
    fn drop(&mut self) {
        let raw = *self.ptr.get_mut();
        if !raw.is_null() {
            // a reader may still be pinned, so the value goes through the
            // retired list like any other replacement
            retire(unsafe { Box::from_raw(raw) });
        }
    }
}
