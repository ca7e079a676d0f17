//! Thread bookkeeping: the recursive global VM lock, per-thread safe
//! counters, the registry the collector walks during stop-the-world, and the
//! sleep/join/interrupt primitives behind java.lang.Thread.

use crate::error::VmError;
use crate::heap::{HeapRef, JNULL};
use crate::keys::ThreadId;
use crate::throw_exception;
use crate::vm::stack::FrameStack;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Per-thread temporary roots: references native code pins across
/// allocation calls so an intervening collection cannot lose them.
#[derive(Default)]
pub struct TempRoots(SmallVec<[HeapRef; 8]>);

impl TempRoots {
    pub fn push(&mut self, r: HeapRef) {
        self.0.push(r);
    }

    pub fn pop(&mut self) {
        self.0.pop();
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapRef> {
        self.0.iter()
    }
}

/// The part of a thread's identity that outlives its run loop and is shared
/// with the registry, the collector and other threads (join, interrupt).
pub struct ThreadShared {
    pub id: ThreadId,
    /// Safe-zone counter: incremented before blocking on the global lock or
    /// sleeping on a VM condition, decremented on release. A thread with
    /// `safe >= 1` is observable by the collector.
    safe: AtomicU32,
    interrupted: AtomicBool,
    alive: AtomicBool,
    mirror: AtomicUsize,
    /// Condition this thread currently sleeps on, so an interrupt can wake
    /// it immediately.
    sleeping_on: Mutex<Option<Arc<Condvar>>>,
    /// Broadcast when the thread dies; join sleeps here.
    pub term: Arc<Condvar>,
}

impl ThreadShared {
    fn new(id: ThreadId) -> Self {
        ThreadShared {
            id,
            safe: AtomicU32::new(0),
            interrupted: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            mirror: AtomicUsize::new(JNULL),
            sleeping_on: Mutex::new(None),
            term: Arc::new(Condvar::new()),
        }
    }

    pub fn set_mirror(&self, r: HeapRef) {
        self.mirror.store(r, Ordering::SeqCst);
    }

    pub fn mirror(&self) -> HeapRef {
        self.mirror.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn set_interrupted(&self, value: bool) {
        self.interrupted.store(value, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Consumes the interrupt flag, reporting whether it was set.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_sleeping_on(&self, cond: Option<Arc<Condvar>>) {
        *self.sleeping_on.lock().unwrap() = cond;
    }
}

/// The running state of a thread of execution: its frame stack, temporary
/// roots and pending exception. Owned by the executing OS thread; the
/// collector reads it through the registry during stop-the-world only.
pub struct VmThread {
    pub id: ThreadId,
    pub stack: FrameStack,
    pub roots: TempRoots,
    /// In-flight exception between a throw and its handler; a GC root.
    pub exception: Option<HeapRef>,
    pub shared: Arc<ThreadShared>,
}

struct LockInner {
    owner: Option<ThreadId>,
    depth: u32,
}

/// The machine-wide recursive lock. Everything that mutates shared VM state
/// (class table, heap bins, monitor table, intern pool) runs with it held.
/// All monitor and sleep conditions wait on this lock's mutex, so a waiting
/// thread atomically gives up the lock exactly as a blocked one does.
pub struct GlobalLock {
    inner: Mutex<LockInner>,
    available: Condvar,
}

pub enum WaitOutcome {
    Notified,
    TimedOut,
}

impl GlobalLock {
    fn new() -> Self {
        GlobalLock {
            inner: Mutex::new(LockInner {
                owner: None,
                depth: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Acquires the lock, re-entrantly. The safe counter goes up before the
    /// thread can block so the collector counts it as stopped.
    pub fn lock(&self, shared: &ThreadShared) {
        shared.safe.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.owner {
                None => {
                    inner.owner = Some(shared.id);
                    inner.depth = 1;
                    return;
                }
                Some(owner) if owner == shared.id => {
                    inner.depth += 1;
                    return;
                }
                Some(_) => {
                    inner = self.available.wait(inner).unwrap();
                }
            }
        }
    }

    pub fn unlock(&self, shared: &ThreadShared) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.owner, Some(shared.id));
            inner.depth -= 1;
            if inner.depth == 0 {
                inner.owner = None;
                self.available.notify_one();
            }
        }
        let prev = shared.safe.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev != 0);
    }

    /// Atomically releases the lock (whatever its depth) and sleeps on
    /// `cond`, then re-acquires the lock at its previous depth before
    /// returning. The safe counter stays raised for the whole wait.
    pub fn wait_on(
        &self,
        shared: &ThreadShared,
        cond: &Condvar,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.owner, Some(shared.id));
        let depth = inner.depth;
        inner.owner = None;
        inner.depth = 0;
        self.available.notify_one();

        let mut timed_out = false;
        match timeout {
            Some(timeout) => {
                let (guard, result) = cond.wait_timeout(inner, timeout).unwrap();
                inner = guard;
                timed_out = result.timed_out();
            }
            None => {
                inner = cond.wait(inner).unwrap();
            }
        }

        while inner.owner.is_some() {
            inner = self.available.wait(inner).unwrap();
        }
        inner.owner = Some(shared.id);
        inner.depth = depth;

        if timed_out {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Notified
        }
    }

    pub fn is_held_by(&self, id: ThreadId) -> bool {
        self.inner.lock().unwrap().owner == Some(id)
    }
}

struct RegisteredThread {
    shared: Arc<ThreadShared>,
    /// Valid for as long as the thread stays registered; the owning OS
    /// thread keeps the state boxed and pinned for that whole window.
    state: *const VmThread,
}

pub struct ThreadManager {
    pub lock: GlobalLock,
    registry: Mutex<Vec<RegisteredThread>>,
    quiescent: Condvar,
    next_id: AtomicU32,
}

// Safety: the raw state pointers are dereferenced only during
// stop-the-world, when their owning threads are parked at safe points; the
// safe-counter handshake (SeqCst) provides the ordering.
unsafe impl Send for ThreadManager {}
unsafe impl Sync for ThreadManager {}

impl ThreadManager {
    pub fn new() -> Self {
        ThreadManager {
            lock: GlobalLock::new(),
            registry: Mutex::new(Vec::new()),
            quiescent: Condvar::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Creates the state for a new thread of execution. The thread is not
    /// visible to the collector until it is registered.
    pub fn new_thread(&self, frame_stack_limit: usize) -> Box<VmThread> {
        let id = ThreadId::from_usize(self.next_id.fetch_add(1, Ordering::SeqCst) as usize);
        Box::new(VmThread {
            id,
            stack: FrameStack::new(frame_stack_limit),
            roots: TempRoots::default(),
            exception: None,
            shared: Arc::new(ThreadShared::new(id)),
        })
    }

    pub fn register(&self, thread: &VmThread) {
        self.registry.lock().unwrap().push(RegisteredThread {
            shared: thread.shared.clone(),
            state: thread as *const VmThread,
        });
    }

    /// Unregisters a dying thread: broadcasts its termination condition so
    /// joiners wake up, then drops it from the collector's view.
    pub fn unregister(&self, thread: &VmThread) {
        thread.shared.alive.store(false, Ordering::SeqCst);
        thread.shared.term.notify_all();
        let mut registry = self.registry.lock().unwrap();
        registry.retain(|entry| entry.shared.id != thread.id);
        self.quiescent.notify_all();
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    pub fn find_shared(&self, id: ThreadId) -> Option<Arc<ThreadShared>> {
        self.registry
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.shared.id == id)
            .map(|entry| entry.shared.clone())
    }

    /// The live thread owning a java.lang.Thread mirror, if any.
    pub fn find_by_mirror(&self, mirror: HeapRef) -> Option<Arc<ThreadShared>> {
        self.registry
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.shared.mirror() == mirror)
            .map(|entry| entry.shared.clone())
    }

    /// Blocks until every registered thread but the caller has gone. Used
    /// by the VM teardown to let spawned threads finish.
    pub fn wait_until_only(&self, survivors: usize) {
        let mut registry = self.registry.lock().unwrap();
        while registry.len() > survivors {
            registry = self.quiescent.wait(registry).unwrap();
        }
    }

    /// Waits until every other thread sits in a safe zone. Must be called
    /// with the global lock held: any thread that is not yet safe will
    /// become so at its next lock acquisition, and none can leave a safe
    /// zone while the caller owns the lock.
    pub fn stop_the_world(&self, self_id: ThreadId) {
        debug_assert!(self.lock.is_held_by(self_id));
        loop {
            let stopped = {
                let registry = self.registry.lock().unwrap();
                registry.iter().all(|entry| {
                    entry.shared.id == self_id || entry.shared.safe.load(Ordering::SeqCst) >= 1
                })
            };
            if stopped {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Hands the collector each registered thread's mirror and, when the
    /// thread has published its state, its stack and roots.
    ///
    /// Only sound during stop-the-world; see the Send/Sync note above.
    pub fn for_each_gc_root_set(&self, mut f: impl FnMut(HeapRef, Option<&VmThread>)) {
        let registry = self.registry.lock().unwrap();
        for entry in registry.iter() {
            let state = unsafe { entry.state.as_ref() };
            f(entry.shared.mirror(), state);
        }
    }

    // ------------------------------------------------------------------
    // Sleep / join / interrupt
    // ------------------------------------------------------------------

    /// Thread.sleep: parks on a dedicated condition until the timeout or an
    /// interrupt, which is consumed and surfaced as InterruptedException.
    pub fn sleep(&self, thread: &VmThread, millis: i64, nanos: i32) -> Result<(), VmError> {
        let shared = &thread.shared;
        self.lock.lock(shared);

        if !shared.is_interrupted() {
            let cond = Arc::new(Condvar::new());
            shared.set_sleeping_on(Some(cond.clone()));
            let timeout = duration_from(millis as u64, nanos as u32);
            self.lock.wait_on(shared, &cond, Some(timeout));
            shared.set_sleeping_on(None);
        }

        let interrupted = shared.take_interrupt();
        self.lock.unlock(shared);

        if interrupted {
            throw_exception!(InterruptedException, "sleep interrupted")
        } else {
            Ok(())
        }
    }

    /// Thread.join: sleeps on the target's termination condition until it
    /// dies or the caller is interrupted.
    pub fn join(&self, thread: &VmThread, target: &ThreadShared) -> Result<(), VmError> {
        let shared = &thread.shared;
        self.lock.lock(shared);

        while target.is_alive() && !shared.is_interrupted() {
            let term = target.term.clone();
            shared.set_sleeping_on(Some(term.clone()));
            self.lock.wait_on(shared, &term, None);
            shared.set_sleeping_on(None);
        }

        let interrupted = shared.take_interrupt();
        self.lock.unlock(shared);

        if interrupted {
            throw_exception!(InterruptedException, "join interrupted")
        } else {
            Ok(())
        }
    }

    /// Thread.interrupt: records the interrupt and, when the target is
    /// parked on a VM-tracked condition, wakes it so it can observe the
    /// flag.
    pub fn interrupt(&self, self_shared: &ThreadShared, target: &ThreadShared) {
        self.lock.lock(self_shared);
        target.set_interrupted(true);
        if let Some(cond) = target.sleeping_on.lock().unwrap().clone() {
            cond.notify_all();
        }
        self.lock.unlock(self_shared);
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn duration_from(millis: u64, nanos: u32) -> Duration {
    Duration::from_millis(millis) + Duration::from_nanos(nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_lock_is_recursive() {
        let tm = ThreadManager::new();
        let t = tm.new_thread(16);
        tm.lock.lock(&t.shared);
        tm.lock.lock(&t.shared);
        assert!(tm.lock.is_held_by(t.id));
        tm.lock.unlock(&t.shared);
        assert!(tm.lock.is_held_by(t.id));
        tm.lock.unlock(&t.shared);
        assert!(!tm.lock.is_held_by(t.id));
    }

    #[test]
    fn safe_counter_tracks_lock_nesting() {
        let tm = ThreadManager::new();
        let t = tm.new_thread(16);
        assert_eq!(t.shared.safe.load(Ordering::SeqCst), 0);
        tm.lock.lock(&t.shared);
        tm.lock.lock(&t.shared);
        assert_eq!(t.shared.safe.load(Ordering::SeqCst), 2);
        tm.lock.unlock(&t.shared);
        tm.lock.unlock(&t.shared);
        assert_eq!(t.shared.safe.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lock_excludes_across_threads() {
        let tm = Arc::new(ThreadManager::new());
        let t1 = tm.new_thread(16);
        tm.lock.lock(&t1.shared);

        let tm2 = tm.clone();
        let handle = std::thread::spawn(move || {
            let t2 = tm2.new_thread(16);
            tm2.lock.lock(&t2.shared);
            let order = std::time::Instant::now();
            tm2.lock.unlock(&t2.shared);
            order
        });

        std::thread::sleep(Duration::from_millis(50));
        let released = std::time::Instant::now();
        tm.lock.unlock(&t1.shared);
        let acquired = handle.join().unwrap();
        assert!(acquired >= released);
    }

    #[test]
    fn timed_wait_on_condition_returns() {
        let tm = ThreadManager::new();
        let t = tm.new_thread(16);
        tm.lock.lock(&t.shared);
        let cond = Condvar::new();
        match tm.lock.wait_on(&t.shared, &cond, Some(Duration::from_millis(10))) {
            WaitOutcome::TimedOut => {}
            WaitOutcome::Notified => panic!("nobody signalled"),
        }
        assert!(tm.lock.is_held_by(t.id));
        tm.lock.unlock(&t.shared);
    }

    #[test]
    fn interrupt_wakes_a_sleeper() {
        let tm = Arc::new(ThreadManager::new());
        let sleeper = tm.new_thread(16);
        let sleeper_shared = sleeper.shared.clone();
        tm.register(&sleeper);

        let tm2 = tm.clone();
        let handle = std::thread::spawn(move || {
            let waker = tm2.new_thread(16);
            std::thread::sleep(Duration::from_millis(30));
            tm2.interrupt(&waker.shared, &sleeper_shared);
        });

        // A long sleep that the interrupt should cut short.
        let res = tm.sleep(&sleeper, 60_000, 0);
        assert!(res.is_err());
        assert!(!sleeper.shared.is_interrupted()); // flag consumed
        handle.join().unwrap();
        tm.unregister(&sleeper);
    }
}
