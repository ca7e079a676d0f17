//! Java monitors: an open-addressed, power-of-two hash table keyed by
//! object reference. Displaced entries are threaded through `next` links
//! anchored at their home bucket, which lets the post-collection purge
//! rehash survivors in place.

use crate::error::VmError;
use crate::heap::{Heap, HeapRef, JNULL, WORD};
use crate::keys::ThreadId;
use crate::thread::{GlobalLock, ThreadShared, duration_from};
use crate::throw_exception;
use std::sync::{Arc, Condvar, Mutex};

const INITIAL_CAPACITY: usize = 4;

#[derive(Clone, Default)]
struct Bucket {
    /// Object this monitor belongs to; the null reference marks an empty
    /// bucket.
    object: HeapRef,
    owner: Option<ThreadId>,
    count: usize,
    /// Lazily created; waiters sleep on it through the global lock.
    cond: Option<Arc<Condvar>>,
    /// Next bucket index in the chain anchored at this slot's hash.
    next: Option<usize>,
}

struct TableInner {
    buckets: Vec<Bucket>,
    entries: usize,
}

pub struct MonitorTable {
    inner: Mutex<TableInner>,
}

enum WaitDisposition {
    NoMonitor,
    NotEligible,
    Parked(Arc<Condvar>),
}

impl MonitorTable {
    pub fn new() -> Self {
        MonitorTable {
            inner: Mutex::new(TableInner {
                buckets: vec![Bucket::default(); INITIAL_CAPACITY],
                entries: 0,
            }),
        }
    }

    fn hash(object: HeapRef, capacity: usize) -> usize {
        (object >> WORD.trailing_zeros()) & (capacity - 1)
    }

    /// MONITORENTER. Recursive acquisition bumps the count; contention spins
    /// with the global lock released between attempts (Java monitors cannot
    /// deadlock against the global lock).
    pub fn enter(&self, lock: &GlobalLock, shared: &ThreadShared, object: HeapRef) {
        loop {
            lock.lock(shared);
            let acquired = {
                let mut inner = self.inner.lock().unwrap();
                match Self::find(&inner, object) {
                    Some(index) => {
                        let bucket = &mut inner.buckets[index];
                        match bucket.owner {
                            None => {
                                bucket.owner = Some(shared.id);
                                bucket.count = 1;
                                true
                            }
                            Some(owner) if owner == shared.id => {
                                bucket.count += 1;
                                true
                            }
                            Some(_) => false,
                        }
                    }
                    None => {
                        Self::insert(&mut inner, object, shared.id);
                        true
                    }
                }
            };
            lock.unlock(shared);

            if acquired {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// MONITOREXIT. Returns false when the caller does not own the monitor;
    /// the caller's exit path turns that into IllegalMonitorStateException.
    pub fn exit(&self, lock: &GlobalLock, shared: &ThreadShared, object: HeapRef) -> bool {
        lock.lock(shared);
        let released = {
            let mut inner = self.inner.lock().unwrap();
            match Self::find(&inner, object) {
                Some(index) => {
                    let bucket = &mut inner.buckets[index];
                    if bucket.owner == Some(shared.id) {
                        bucket.count -= 1;
                        if bucket.count == 0 {
                            bucket.owner = None;
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        lock.unlock(shared);
        released
    }

    /// Object.wait. Requires ownership with recursion count exactly one;
    /// gives the monitor up, sleeps on its condition (timed when any of the
    /// timeouts is nonzero), re-acquires, and delivers a pending interrupt
    /// as InterruptedException. Returns false if no monitor exists for the
    /// object at all.
    pub fn wait(
        &self,
        lock: &GlobalLock,
        shared: &ThreadShared,
        object: HeapRef,
        millis: i64,
        nanos: i32,
    ) -> Result<bool, VmError> {
        lock.lock(shared);

        let disposition = {
            let mut inner = self.inner.lock().unwrap();
            match Self::find(&inner, object) {
                None => WaitDisposition::NoMonitor,
                Some(index) => {
                    let bucket = &mut inner.buckets[index];
                    if bucket.owner == Some(shared.id)
                        && bucket.count == 1
                        && !shared.is_interrupted()
                    {
                        bucket.owner = None;
                        bucket.count = 0;
                        let cond = bucket
                            .cond
                            .get_or_insert_with(|| Arc::new(Condvar::new()))
                            .clone();
                        WaitDisposition::Parked(cond)
                    } else {
                        // Deliberate: an ineligible caller (wrong owner or
                        // recursion count above one) returns without waiting
                        // and without error; only a missing monitor record
                        // reports failure to the caller's exception path.
                        WaitDisposition::NotEligible
                    }
                }
            }
        };

        let found = match disposition {
            WaitDisposition::Parked(cond) => {
                let timeout = if millis == 0 && nanos == 0 {
                    None
                } else {
                    Some(duration_from(millis as u64, nanos as u32))
                };
                shared.set_sleeping_on(Some(cond.clone()));
                lock.wait_on(shared, &cond, timeout);
                shared.set_sleeping_on(None);
                lock.unlock(shared);
                // Take the monitor back before returning to the caller.
                self.enter(lock, shared, object);
                true
            }
            WaitDisposition::NotEligible => {
                lock.unlock(shared);
                true
            }
            WaitDisposition::NoMonitor => {
                lock.unlock(shared);
                false
            }
        };

        if shared.take_interrupt() {
            throw_exception!(InterruptedException, "wait interrupted")?
        }
        Ok(found)
    }

    /// Object.notify / notifyAll. Returns false when the caller does not
    /// own the monitor.
    pub fn notify(
        &self,
        lock: &GlobalLock,
        shared: &ThreadShared,
        object: HeapRef,
        broadcast: bool,
    ) -> bool {
        lock.lock(shared);
        let result = {
            let inner = self.inner.lock().unwrap();
            match Self::find(&inner, object) {
                Some(index) => {
                    let bucket = &inner.buckets[index];
                    if bucket.owner == Some(shared.id) {
                        if let Some(cond) = &bucket.cond {
                            if broadcast {
                                cond.notify_all();
                            } else {
                                cond.notify_one();
                            }
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        lock.unlock(shared);
        result
    }

    /// Wakes whoever waits on the object's monitor without taking the
    /// monitor. Used by the collector to nudge the finalizer thread; the
    /// sleeper re-checks its queue on every wakeup.
    pub fn gc_signal(&self, object: HeapRef) {
        let inner = self.inner.lock().unwrap();
        if let Some(index) = Self::find(&inner, object) {
            if let Some(cond) = &inner.buckets[index].cond {
                cond.notify_all();
            }
        }
    }

    /// Current owner and recursion count, for diagnostics and tests.
    pub fn held_by(&self, object: HeapRef) -> Option<(ThreadId, usize)> {
        let inner = self.inner.lock().unwrap();
        Self::find(&inner, object).and_then(|index| {
            let bucket = &inner.buckets[index];
            bucket.owner.map(|owner| (owner, bucket.count))
        })
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().buckets.len()
    }

    /// Walks the chain anchored at the object's home bucket.
    fn find(inner: &TableInner, object: HeapRef) -> Option<usize> {
        if object == JNULL {
            return None;
        }
        let capacity = inner.buckets.len();
        let mut index = Some(Self::hash(object, capacity));
        while let Some(i) = index {
            if inner.buckets[i].object == object {
                return Some(i);
            }
            index = inner.buckets[i].next;
        }
        None
    }

    /// Inserts a monitor owned by `owner` with count one, probing linearly
    /// for a free slot and chaining it from its home bucket on a clash.
    fn insert(inner: &mut TableInner, object: HeapRef, owner: ThreadId) {
        let capacity = inner.buckets.len();
        let hash = Self::hash(object, capacity);

        let mut i = hash;
        while inner.buckets[i].object != JNULL {
            i = (i + 1) & (capacity - 1);
        }

        inner.buckets[i] = Bucket {
            object,
            owner: Some(owner),
            count: 1,
            cond: None,
            next: if i == hash {
                None
            } else {
                inner.buckets[hash].next
            },
        };
        if i != hash {
            inner.buckets[hash].next = Some(i);
        }

        inner.entries += 1;
        if inner.entries == capacity {
            Self::rehash(inner, capacity * 2);
        }
    }

    fn rehash(inner: &mut TableInner, capacity: usize) {
        let old = std::mem::replace(&mut inner.buckets, vec![Bucket::default(); capacity]);

        for bucket in old {
            if bucket.object == JNULL {
                continue;
            }
            let hash = Self::hash(bucket.object, capacity);
            let mut i = hash;
            while inner.buckets[i].object != JNULL {
                i = (i + 1) & (capacity - 1);
            }
            inner.buckets[i] = Bucket {
                next: if i == hash {
                    None
                } else {
                    inner.buckets[hash].next
                },
                ..bucket
            };
            if i != hash {
                inner.buckets[hash].next = Some(i);
            }
        }
    }

    /// Drops monitors whose object did not survive marking, then compacts
    /// the survivors toward their home buckets and rebuilds the chains in
    /// place. Runs during stop-the-world, between mark and sweep.
    pub fn purge(&self, heap: &Heap) {
        let mut inner = self.inner.lock().unwrap();
        let capacity = inner.buckets.len();

        // Phase one: clear entries for dead objects.
        let mut entries = 0;
        for bucket in inner.buckets.iter_mut() {
            if bucket.object != JNULL {
                if !heap.header(bucket.object).is_marked() {
                    *bucket = Bucket::default();
                } else {
                    entries += 1;
                }
            }
        }
        inner.entries = entries;

        // Phase two: move survivors into their home bucket when it is free,
        // or swap with a squatter that does not belong there. Chains are
        // cleared and rebuilt afterwards.
        for i in 0..capacity {
            if inner.buckets[i].object == JNULL {
                continue;
            }
            inner.buckets[i].next = None;
            let hash = Self::hash(inner.buckets[i].object, capacity);
            if i != hash {
                if inner.buckets[hash].object == JNULL {
                    inner.buckets[hash] = std::mem::take(&mut inner.buckets[i]);
                } else if Self::hash(inner.buckets[hash].object, capacity) != hash {
                    inner.buckets.swap(i, hash);
                }
            }
        }

        // Phase three: re-chain every displaced entry from its home bucket.
        for i in 0..capacity {
            if inner.buckets[i].object == JNULL {
                continue;
            }
            let hash = Self::hash(inner.buckets[i].object, capacity);
            if i != hash {
                inner.buckets[i].next = inner.buckets[hash].next;
                inner.buckets[hash].next = Some(i);
            }
        }

        // Load-factor maintenance happens here since entries only shrink
        // during a purge.
        if capacity > INITIAL_CAPACITY && inner.entries < capacity / 4 {
            Self::rehash(&mut inner, capacity / 2);
        }
    }
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadManager;

    fn setup() -> (ThreadManager, MonitorTable) {
        (ThreadManager::new(), MonitorTable::new())
    }

    #[test]
    fn enter_exit_restores_the_table() {
        let (tm, monitors) = setup();
        let t = tm.new_thread(16);
        let obj: HeapRef = 0x40;

        monitors.enter(&tm.lock, &t.shared, obj);
        assert_eq!(monitors.held_by(obj), Some((t.id, 1)));
        assert!(monitors.exit(&tm.lock, &t.shared, obj));
        assert_eq!(monitors.held_by(obj), None);
    }

    #[test]
    fn nested_pairs_count_symmetrically() {
        let (tm, monitors) = setup();
        let t = tm.new_thread(16);
        let obj: HeapRef = 0x40;

        monitors.enter(&tm.lock, &t.shared, obj);
        monitors.enter(&tm.lock, &t.shared, obj);
        monitors.enter(&tm.lock, &t.shared, obj);
        assert_eq!(monitors.held_by(obj), Some((t.id, 3)));
        assert!(monitors.exit(&tm.lock, &t.shared, obj));
        assert!(monitors.exit(&tm.lock, &t.shared, obj));
        assert_eq!(monitors.held_by(obj), Some((t.id, 1)));
        assert!(monitors.exit(&tm.lock, &t.shared, obj));
        assert_eq!(monitors.held_by(obj), None);
    }

    #[test]
    fn exit_without_ownership_fails() {
        let (tm, monitors) = setup();
        let t1 = tm.new_thread(16);
        let t2 = tm.new_thread(16);
        let obj: HeapRef = 0x40;

        assert!(!monitors.exit(&tm.lock, &t1.shared, obj));
        monitors.enter(&tm.lock, &t1.shared, obj);
        assert!(!monitors.exit(&tm.lock, &t2.shared, obj));
        assert!(monitors.exit(&tm.lock, &t1.shared, obj));
    }

    #[test]
    fn notify_requires_ownership() {
        let (tm, monitors) = setup();
        let t1 = tm.new_thread(16);
        let t2 = tm.new_thread(16);
        let obj: HeapRef = 0x40;

        assert!(!monitors.notify(&tm.lock, &t1.shared, obj, false));
        monitors.enter(&tm.lock, &t1.shared, obj);
        assert!(monitors.notify(&tm.lock, &t1.shared, obj, true));
        assert!(!monitors.notify(&tm.lock, &t2.shared, obj, true));
        monitors.exit(&tm.lock, &t1.shared, obj);
    }

    #[test]
    fn table_grows_under_load() {
        let (tm, monitors) = setup();
        let t = tm.new_thread(16);

        // Colliding and non-colliding objects alike; the table doubles when
        // entries reach capacity.
        for i in 0..32 {
            monitors.enter(&tm.lock, &t.shared, 0x100 + i * WORD);
        }
        assert_eq!(monitors.entry_count(), 32);
        assert!(monitors.capacity() >= 32);
        for i in 0..32 {
            assert!(monitors.exit(&tm.lock, &t.shared, 0x100 + i * WORD));
        }
    }

    #[test]
    fn chained_lookup_survives_collisions() {
        let (tm, monitors) = setup();
        let t = tm.new_thread(16);

        // With capacity 4, these three all hash to the same bucket.
        let a = 0x100;
        let b = a + 4 * WORD;
        let c = a + 8 * WORD;
        monitors.enter(&tm.lock, &t.shared, a);
        monitors.enter(&tm.lock, &t.shared, b);
        monitors.enter(&tm.lock, &t.shared, c);

        assert_eq!(monitors.held_by(a), Some((t.id, 1)));
        assert_eq!(monitors.held_by(b), Some((t.id, 1)));
        assert_eq!(monitors.held_by(c), Some((t.id, 1)));
    }

    #[test]
    fn timed_wait_expires() {
        let (tm, monitors) = setup();
        let t = tm.new_thread(16);
        let obj: HeapRef = 0x80;

        monitors.enter(&tm.lock, &t.shared, obj);
        let found = monitors.wait(&tm.lock, &t.shared, obj, 10, 0).unwrap();
        assert!(found);
        // Monitor re-acquired after the timeout.
        assert_eq!(monitors.held_by(obj), Some((t.id, 1)));
        monitors.exit(&tm.lock, &t.shared, obj);
    }

    #[test]
    fn wait_without_monitor_reports_failure() {
        let (tm, monitors) = setup();
        let t = tm.new_thread(16);
        assert!(!monitors.wait(&tm.lock, &t.shared, 0x80, 0, 1).unwrap());
    }
}
