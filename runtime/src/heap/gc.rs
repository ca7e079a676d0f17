//! Stop-the-world mark-sweep collection over the bitmap heap.
//!
//! The collector runs with the global VM lock held and only after every
//! other thread has parked at a safe point. It never moves objects, so
//! payload addresses stay valid across collections. Everything the collector
//! needs is registered with the heap at class-link time; it never takes the
//! method area lock.

use crate::debug_log;
use crate::heap::{
    BIN_ENTRIES, ClassShape, HeaderKind, HeaderWord, Heap, HeapRef, HeapState, JNULL, WORD,
    word_ceil,
};
use crate::keys::ThreadId;
use crate::vm::stack::FrameType;
use crate::vm::{Value, VirtualMachine};

/// Runs a collection, or just grows the heap while the collector is still
/// disabled during bootstrap. `requested` is the allocation size that
/// triggered the collection; the sweep uses it to decide whether the heap
/// must grow.
pub fn collect(vm: &VirtualMachine, self_id: ThreadId, requested: usize) {
    debug_log!("garbage collection, triggered by a {} byte request", requested);

    let enabled = vm.heap.lock_state().collect_enabled;
    if !enabled {
        let mut state = vm.heap.lock_state();
        let end = state.end;
        grow(&vm.heap, &mut state, end, requested);
        return;
    }

    vm.threads.stop_the_world(self_id);

    let marker = Marker { heap: &vm.heap };
    marker.mark_roots(vm);
    mark_finalizable(vm);

    vm.heap.purge_string_pool();
    vm.monitors.purge(&vm.heap);
    purge_bins(&vm.heap);
    sweep(&vm.heap, requested);
}

struct Marker<'h> {
    heap: &'h Heap,
}

impl<'h> Marker<'h> {
    fn mark_roots(&self, vm: &VirtualMachine) {
        // Raw chunks (method code buffers) are live for as long as they are
        // registered; mark them so the sweeper keeps them.
        {
            let state = self.heap.lock_state();
            for &chunk in &state.raw_chunks {
                let header = self.heap.header(chunk);
                self.heap.set_header(chunk, header.with_mark());
            }
        }

        let (mirrors, static_cells, literals) = {
            let state = self.heap.lock_state();
            (
                state.mirror_roots.clone(),
                state.static_ref_cells.clone(),
                state.literal_roots.clone(),
            )
        };

        for mirror in mirrors {
            self.mark_reference(mirror);
        }
        for literal in literals {
            self.mark_reference(literal);
        }
        for cell in static_cells {
            self.mark_potential(self.heap.read_word(cell));
        }

        // Thread roots: the Java mirror, the temporary roots, every frame's
        // locals and operand stack, and the pending exception. Safe to read
        // because every other thread sits at a safe point.
        vm.threads.for_each_gc_root_set(|mirror, thread| {
            self.mark_potential(mirror);
            if let Some(thread) = thread {
                for &root in thread.roots.iter() {
                    self.mark_potential(root);
                }
                for frame in thread.stack.frames() {
                    if let FrameType::Java(frame) = frame {
                        for value in frame.gc_values() {
                            if let Value::Ref(r) = value {
                                self.mark_potential(*r);
                            }
                        }
                    }
                }
                if let Some(exception) = thread.exception {
                    self.mark_reference(exception);
                }
            }
        });
    }

    /// Checks whether a word plausibly refers to a Java object before
    /// marking: alignment, heap bounds and the header bitmap all have to
    /// agree, otherwise the candidate is ignored.
    fn mark_potential(&self, candidate: usize) {
        let plausible = {
            let state = self.heap.lock_state();
            self.heap.is_plausible_ref(&state, candidate)
        };
        if plausible {
            self.mark_reference(candidate);
        }
    }

    /// Number of reference slots preceding the header, and the slot the
    /// marker must not traverse (a weak referent).
    fn ref_slots(&self, r: HeapRef) -> (usize, Option<usize>) {
        match self.heap.shape(self.heap.header(r).class_id().expect("marked raw chunk")) {
            Ok(ClassShape::Instance { ref_n, weak_referent, .. }) => {
                (ref_n as usize, weak_referent.map(|s| s as usize))
            }
            Ok(ClassShape::ReferenceArray) => {
                (self.heap.array_length(r).unwrap_or(0) as usize, None)
            }
            Ok(ClassShape::PrimitiveArray(_)) => (0, None),
            Err(_) => (0, None),
        }
    }

    #[cfg(not(feature = "gc-pointer-reversal"))]
    fn mark_reference(&self, r: HeapRef) {
        if r == JNULL {
            return;
        }
        let header = self.heap.header(r);
        if !header.is_object() || header.is_marked() {
            return;
        }
        self.heap.set_header(r, header.with_mark());

        let mut stack = vec![r];
        while let Some(obj) = stack.pop() {
            let (ref_n, weak_slot) = self.ref_slots(obj);
            for slot in 0..ref_n {
                if Some(slot) == weak_slot {
                    continue;
                }
                let candidate = self.heap.read_word(obj - (slot + 1) * WORD);
                let plausible = {
                    let state = self.heap.lock_state();
                    self.heap.is_plausible_ref(&state, candidate)
                };
                if !plausible {
                    continue;
                }
                let child = self.heap.header(candidate);
                if child.is_object() && !child.is_marked() {
                    self.heap.set_header(candidate, child.with_mark());
                    stack.push(candidate);
                }
            }
        }
    }

    /// Pointer-reversal (Deutsch-Schorr-Waite) marking: the parent chain is
    /// threaded through the reference slot currently being visited and the
    /// visit counter lives in the high half of the header word, next to the
    /// class id. No mark stack at all.
    #[cfg(feature = "gc-pointer-reversal")]
    fn mark_reference(&self, r: HeapRef) {
        const _: () = assert!(WORD == 8, "pointer-reversal marking needs 64-bit headers");

        if r == JNULL {
            return;
        }
        let header = self.heap.header(r);
        if !header.is_object() || header.is_marked() {
            return;
        }

        let mut curr = r;
        let mut prev = JNULL;
        self.begin_visit(curr);

        loop {
            let count = self.visit_count(curr);
            let (ref_n, weak_slot) = self.ref_slots(curr);

            if count < ref_n {
                if Some(count) == weak_slot {
                    self.set_visit_count(curr, count + 1);
                    continue;
                }
                let slot_addr = curr - (count + 1) * WORD;
                let candidate = self.heap.read_word(slot_addr);
                let plausible = {
                    let state = self.heap.lock_state();
                    self.heap.is_plausible_ref(&state, candidate)
                };
                if !plausible {
                    self.set_visit_count(curr, count + 1);
                    continue;
                }
                let child = self.heap.header(candidate);
                if !child.is_object() || child.is_marked() {
                    self.set_visit_count(curr, count + 1);
                    continue;
                }
                // Descend: reverse the slot to point at the parent.
                self.heap.write_word(slot_addr, prev);
                prev = curr;
                curr = candidate;
                self.begin_visit(curr);
            } else {
                // Done with this object: pop the parent off the reversed
                // chain and restore the slot.
                let finished = curr;
                curr = prev;
                if curr == JNULL {
                    return;
                }
                let count = self.visit_count(curr);
                let slot_addr = curr - (count + 1) * WORD;
                prev = self.heap.read_word(slot_addr);
                self.heap.write_word(slot_addr, finished);
                self.set_visit_count(curr, count + 1);
            }
        }
    }

    #[cfg(feature = "gc-pointer-reversal")]
    fn begin_visit(&self, r: HeapRef) {
        let header = self.heap.header(r);
        // Mark bit set, count zeroed, class id untouched.
        self.heap
            .set_header(r, HeaderWord::from_raw((header.raw() & 0xFFFF_FFFF) | 1));
    }

    #[cfg(feature = "gc-pointer-reversal")]
    fn visit_count(&self, r: HeapRef) -> usize {
        self.heap.header(r).raw() >> 32
    }

    #[cfg(feature = "gc-pointer-reversal")]
    fn set_visit_count(&self, r: HeapRef, count: usize) {
        let header = self.heap.header(r);
        self.heap
            .set_header(r, HeaderWord::from_raw((header.raw() & 0xFFFF_FFFF) | (count << 32)));
    }
}

/// After marking, splices dead finalizable objects into the pending queue
/// and resurrects them so they survive this collection. The finalizer thread
/// is woken through its monitor's condition without taking ownership; it
/// re-checks the queue on every wakeup.
fn mark_finalizable(vm: &VirtualMachine) {
    let marker = Marker { heap: &vm.heap };
    let mut newly_pending = false;

    {
        let mut state = vm.heap.lock_state();
        let mut still_live = Vec::with_capacity(state.finalizable.len());
        let mut i = 0;
        while i < state.finalizable.len() {
            let r = state.finalizable[i];
            if vm.heap.header(r).is_marked() {
                still_live.push(r);
            } else {
                state.finalizing.push_back(r);
                newly_pending = true;
            }
            i += 1;
        }
        state.finalizable = still_live;
    }

    // Resurrect everything waiting for the finalizer.
    let pending: Vec<HeapRef> = vm.heap.lock_state().finalizing.iter().copied().collect();
    for r in pending {
        marker.mark_reference(r);
    }

    let finalizer = vm.heap.finalizer_mirror();
    if newly_pending && finalizer != JNULL {
        vm.monitors.gc_signal(finalizer);
    }
}

/// Clears weak references after marking: dead weak-reference objects leave
/// the list, live ones whose referent did not survive get their referent
/// slot cleared.
pub(crate) fn purge_weak_refs(heap: &Heap) {
    let mut state = heap.lock_state();
    let weak_refs = std::mem::take(&mut state.weak_refs);
    let mut live = Vec::with_capacity(weak_refs.len());

    for weak in weak_refs {
        if !heap.header(weak).is_marked() {
            continue;
        }
        if let Ok(ClassShape::Instance { weak_referent: Some(slot), .. }) =
            heap.shape(heap.header(weak).class_id().unwrap())
        {
            let slot_addr = weak - (slot as usize + 1) * WORD;
            let referent = heap.read_word(slot_addr);
            if referent != JNULL && !heap.header(referent).is_marked() {
                heap.write_word(slot_addr, JNULL);
            }
        }
        live.push(weak);
    }

    state.weak_refs = live;
}

/// Empties the bins and zeroes the chunks they held, so the sweep sees only
/// blank space where free chunks used to be and can coalesce them into the
/// runs it builds.
fn purge_bins(heap: &Heap) {
    let mut state = heap.lock_state();

    let bins = state.small_bins;
    state.small_bins = [JNULL; BIN_ENTRIES];
    for (id, head) in bins.into_iter().enumerate() {
        let mut chunk = head;
        while chunk != JNULL {
            let next = heap.read_word(chunk);
            unsafe {
                std::ptr::write_bytes(heap.ptr(chunk), 0, (id + 1) * WORD);
            }
            chunk = next;
        }
    }

    let mut chunk = state.large_bin;
    state.large_bin = JNULL;
    while chunk != JNULL {
        let next = heap.read_word(chunk);
        let size = heap.read_word(chunk + WORD);
        unsafe {
            std::ptr::write_bytes(heap.ptr(chunk), 0, size);
        }
        chunk = next;
    }
}

/// Linear scan over the GC area: live objects get their marks cleared (and,
/// with pointer-reversal marking, their headers restored from the class id),
/// dead ones are folded into free runs that go back to the bins. Weak
/// references are purged first since the sweep destroys dead headers.
fn sweep(heap: &Heap, requested: usize) {
    purge_weak_refs(heap);

    let mut state = heap.lock_state();
    let heap_end = state.end;

    let mut scan = WORD;
    let mut run_start = WORD; // start of the current free run
    let mut reclaimed = 0usize;
    let mut in_use = 0usize;
    let mut largest = 0usize;

    while scan < heap_end {
        let word = heap.read_word(scan);
        let header = HeaderWord::from_raw(word);

        if heap.bitmap_get(scan) {
            // A Java object header, live or dead.
            let class_id = header.class_id().expect("bitmap entry without class id");
            let (ref_n, nref) = heap.object_extent(scan).expect("unregistered class in sweep");
            let body = WORD + word_ceil(nref);

            if header.is_marked() {
                let start = scan - ref_n * WORD;
                if start - run_start >= WORD {
                    let run = start - run_start;
                    largest = largest.max(run);
                    reclaimed += run;
                    heap.put_chunk(&mut state, run_start, run);
                }
                // Restores the header from the class id, dropping the mark
                // and any marking-automaton state.
                heap.set_header(scan, HeaderWord::object(class_id));
                in_use += ref_n * WORD + body;
                scan += body;
                run_start = scan;
            } else {
                heap.bitmap_clear(scan);
                scan += body;
            }
        } else if !header.is_object() && word != 0 {
            // A raw chunk header. Registered chunks were marked before the
            // sweep; an unmarked raw header cannot survive the bin purge.
            let words = match header.kind() {
                HeaderKind::RawChunk { words } => words,
                _ => unreachable!(),
            };
            debug_assert!(header.is_marked());
            if scan - run_start >= WORD {
                let run = scan - run_start;
                largest = largest.max(run);
                reclaimed += run;
                heap.put_chunk(&mut state, run_start, run);
            }
            heap.set_header(scan, HeaderWord::raw_chunk(words));
            let body = WORD + words * WORD;
            in_use += body;
            scan += body;
            run_start = scan;
        } else {
            scan += WORD;
        }
    }

    let trailing = heap_end - run_start;
    largest = largest.max(trailing);
    reclaimed += trailing;

    // Keep the trailing run if the collection freed enough, otherwise grow
    // the heap by at least the triggering request.
    if largest > requested && reclaimed > in_use / 2 {
        heap.put_chunk(&mut state, run_start, trailing);
    } else {
        let mut need = requested;
        if reclaimed < in_use / 2 {
            need = need.max(in_use / 2 - reclaimed);
        }
        grow(heap, &mut state, run_start, word_ceil(need));
    }

    debug_log!("collection: {} bytes in use, {} reclaimed", in_use, reclaimed);
}

/// Grows the GC area toward the permanent arena, extending the free run
/// that starts at `run_start` over the new space.
fn grow(heap: &Heap, state: &mut HeapState, run_start: usize, size: usize) {
    if state.end + size > state.perm {
        state.end = state.perm;
    } else {
        state.end += size;
    }
    heap.put_chunk(state, run_start, state.end - run_start);
}
