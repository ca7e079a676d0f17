use crate::error::VmError;
use crate::jtype::AllocationType;
use crate::keys::{ClassId, Symbol};
use crate::rt::field::FieldOffset;
use crate::vm::Value;
use crate::{debug_log, throw_exception};
use dashmap::DashMap;
use lasso::ThreadedRodeo;
use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

pub mod gc;
pub mod method_area;

/// A reference into the unified heap: a word-aligned byte offset from the
/// heap base, pointing at an object header. Zero is the null reference.
pub type HeapRef = usize;

/// The null reference.
pub const JNULL: HeapRef = 0;

pub const WORD: usize = size_of::<usize>();

/// Number of small free lists; one per chunk size from one word up.
pub(crate) const BIN_ENTRIES: usize = 16;
const BIN_MAX_SIZE: usize = BIN_ENTRIES * WORD;

/// The GC area initially occupies this fraction of its maximum size.
const HEAP_INIT_FRACTION: usize = 16;

/// CLDC mandates at least a 32 KiB heap.
const HEAP_MIN_SIZE: usize = 32 * 1024;

/// Object headers are one machine word. The two low bits are reserved: bit 0
/// is the mark bit, bit 1 distinguishes raw chunks from Java objects. For a
/// Java object the remaining bits carry the class id, for a raw chunk the
/// payload size in words.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeaderWord(usize);

const HEADER_MARK_BIT: usize = 1;
const HEADER_RAW_BIT: usize = 2;
const HEADER_RESERVED: u32 = 2;
/// Class ids occupy thirty bits above the reserved pair; the rest of the
/// word is free for the pointer-reversal marker's transient visit counter.
const HEADER_CLASS_MASK: usize = 0x3FFF_FFFF;

pub enum HeaderKind {
    Object { class_id: ClassId },
    RawChunk { words: usize },
}

impl HeaderWord {
    pub fn object(class_id: ClassId) -> Self {
        HeaderWord((class_id.into_inner().get() as usize) << HEADER_RESERVED)
    }

    pub fn raw_chunk(words: usize) -> Self {
        HeaderWord((words << HEADER_RESERVED) | HEADER_RAW_BIT)
    }

    pub fn from_raw(raw: usize) -> Self {
        HeaderWord(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    pub fn is_marked(self) -> bool {
        self.0 & HEADER_MARK_BIT != 0
    }

    pub fn with_mark(self) -> Self {
        HeaderWord(self.0 | HEADER_MARK_BIT)
    }

    pub fn without_mark(self) -> Self {
        HeaderWord(self.0 & !HEADER_MARK_BIT)
    }

    pub fn is_object(self) -> bool {
        self.0 & HEADER_RAW_BIT == 0
    }

    pub fn kind(self) -> HeaderKind {
        if self.is_object() {
            let raw = ((self.0 >> HEADER_RESERVED) & HEADER_CLASS_MASK) as u32;
            let class_id = ClassId::from_raw(raw).expect("object header without class id");
            HeaderKind::Object { class_id }
        } else {
            HeaderKind::RawChunk {
                words: self.0 >> HEADER_RESERVED,
            }
        }
    }

    pub fn class_id(self) -> Option<ClassId> {
        match self.kind() {
            HeaderKind::Object { class_id } => Some(class_id),
            HeaderKind::RawChunk { .. } => None,
        }
    }
}

/// What the collector and the typed accessors need to know about instances
/// of a class, registered by the method area when the class links. Indexed
/// by class id, so the collector never has to consult the method area.
#[derive(Debug, Clone, Copy)]
pub enum ClassShape {
    Instance {
        /// Reference slots preceding the header.
        ref_n: u32,
        /// Bytes of non-reference data following the header (excluding it).
        nref_size: u32,
        /// Class declares or inherits a non-trivial finalize()V.
        has_finalizer: bool,
        /// For java/lang/ref weak reference classes: the reference slot
        /// holding the referent. That slot does not keep its target alive.
        weak_referent: Option<u16>,
    },
    PrimitiveArray(AllocationType),
    ReferenceArray,
}

/// Resolved layout of java/lang/String, installed once the bootstrap
/// classes are linked. String construction needs it.
#[derive(Debug, Clone, Copy)]
pub struct StringLayout {
    pub class_id: ClassId,
    pub char_array_class_id: ClassId,
    pub value: FieldOffset,
    pub offset: FieldOffset,
    pub count: FieldOffset,
}

/// Allocator state, guarded by a mutex taken only on allocation, release
/// and collection paths. Reads and writes of object payloads go straight to
/// memory: the collector never moves objects and only runs once every other
/// thread sits at a safe point.
pub struct HeapState {
    /// Current end of the GC area (byte offset, grows toward `perm`).
    end: usize,
    /// Low end of the permanent arena (byte offset, grows down).
    perm: usize,
    collect_enabled: bool,
    small_bins: [HeapRef; BIN_ENTRIES],
    large_bin: HeapRef,
    /// Live raw chunks (method code buffers); marked as roots of themselves.
    pub(crate) raw_chunks: Vec<HeapRef>,
    /// Class mirror objects, one per loaded class.
    pub(crate) mirror_roots: Vec<HeapRef>,
    /// Byte offsets (within the permanent arena) of reference-typed static
    /// field cells.
    pub(crate) static_ref_cells: Vec<usize>,
    /// Interned literal strings (ldc and ConstantValue); pinned for the VM
    /// lifetime since rewritten opcodes hand them out directly.
    pub(crate) literal_roots: Vec<HeapRef>,
    /// Live weak reference objects.
    pub(crate) weak_refs: Vec<HeapRef>,
    /// Live finalizable objects not yet queued.
    pub(crate) finalizable: Vec<HeapRef>,
    /// Objects waiting for the finalizer thread.
    pub(crate) finalizing: VecDeque<HeapRef>,
    /// The finalizer thread's Thread mirror; notified when work arrives.
    pub(crate) finalizer_mirror: HeapRef,
}

pub struct Heap {
    base: *mut u8,
    reserved: usize,
    bitmap_off: usize,
    pub(crate) state: Mutex<HeapState>,
    shapes: RwLock<Vec<Option<ClassShape>>>,
    string_pool: DashMap<Symbol, HeapRef>,
    string_layout: OnceCell<StringLayout>,
    interner: Arc<ThreadedRodeo>,
}

// Safety: the heap hands out raw offsets into a region that is mapped for
// the lifetime of the VM and never moves. Allocator state is behind a mutex;
// payload accesses follow the Java memory model at the strength the global
// lock provides, and the collector runs only during stop-the-world.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

/// Allocation failure carrying the rounded request size, so the collector
/// knows how much room it must come up with.
#[derive(Debug, Clone, Copy)]
pub struct AllocFailure {
    pub requested: usize,
}

pub(crate) fn word_ceil(bytes: usize) -> usize {
    (bytes + WORD - 1) & !(WORD - 1)
}

impl Heap {
    /// Header word plus the array length word.
    pub const ARRAY_HEADER_BYTES: usize = 2 * WORD;

    pub fn new(max_size: usize, interner: Arc<ThreadedRodeo>) -> Result<Self, VmError> {
        let max_size = max_size.max(HEAP_MIN_SIZE);

        // One bit of bitmap per word of GC area; carve both from one mapping
        // so a single munmap tears everything down.
        let cap = word_ceil(max_size);
        let bitmap_bytes = word_ceil(cap / WORD / 8 + 1);
        let reserved = cap + bitmap_bytes;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserved,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(VmError::Internal("mmap of the heap failed".to_string()));
        }

        let init_size = word_ceil(cap / HEAP_INIT_FRACTION);

        let heap = Heap {
            base: base as *mut u8,
            reserved,
            bitmap_off: cap,
            state: Mutex::new(HeapState {
                end: init_size,
                perm: cap,
                collect_enabled: false,
                small_bins: [JNULL; BIN_ENTRIES],
                large_bin: JNULL,
                raw_chunks: Vec::new(),
                mirror_roots: Vec::new(),
                static_ref_cells: Vec::new(),
                literal_roots: Vec::new(),
                weak_refs: Vec::new(),
                finalizable: Vec::new(),
                finalizing: VecDeque::new(),
                finalizer_mirror: JNULL,
            }),
            shapes: RwLock::new(Vec::new()),
            string_pool: DashMap::new(),
            string_layout: OnceCell::new(),
            interner,
        };

        {
            // The first word is kept out of circulation so no object ever
            // ends up at offset zero, which is the null reference.
            let mut state = heap.state.lock().unwrap();
            heap.put_chunk(&mut state, WORD, init_size - WORD);
        }

        debug_log!(
            "Heap mapped: {} bytes GC area cap, {} bytes bitmap",
            cap,
            bitmap_bytes
        );
        Ok(heap)
    }

    /// Once all the core structures exist the collector may run.
    pub fn enable_collector(&self, enable: bool) {
        self.state.lock().unwrap().collect_enabled = enable;
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap()
    }

    // ------------------------------------------------------------------
    // Raw memory access
    // ------------------------------------------------------------------

    pub(crate) unsafe fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.reserved);
        unsafe { self.base.add(offset) }
    }

    pub(crate) fn read_word(&self, offset: usize) -> usize {
        unsafe { *(self.ptr(offset) as *const usize) }
    }

    pub(crate) fn write_word(&self, offset: usize, value: usize) {
        unsafe { *(self.ptr(offset) as *mut usize) = value }
    }

    pub fn header(&self, r: HeapRef) -> HeaderWord {
        HeaderWord::from_raw(self.read_word(r))
    }

    pub(crate) fn set_header(&self, r: HeapRef, header: HeaderWord) {
        self.write_word(r, header.raw());
    }

    pub fn class_id_of(&self, r: HeapRef) -> Result<ClassId, VmError> {
        self.header(r)
            .class_id()
            .ok_or_else(|| VmError::Internal(format!("no class id in header at {:#x}", r)))
    }

    // ------------------------------------------------------------------
    // Bitmap
    // ------------------------------------------------------------------

    pub(crate) fn bitmap_set(&self, r: HeapRef) {
        let word_index = r / WORD;
        unsafe {
            *self.ptr(self.bitmap_off + (word_index >> 3)) |= 1 << (word_index & 7);
        }
    }

    pub(crate) fn bitmap_clear(&self, r: HeapRef) {
        let word_index = r / WORD;
        unsafe {
            *self.ptr(self.bitmap_off + (word_index >> 3)) &= !(1 << (word_index & 7));
        }
    }

    pub fn bitmap_get(&self, r: HeapRef) -> bool {
        let word_index = r / WORD;
        unsafe { (*self.ptr(self.bitmap_off + (word_index >> 3)) >> (word_index & 7)) & 1 != 0 }
    }

    /// A candidate reference is plausible if it is word-aligned, inside the
    /// live GC area, and its position is recorded as a header in the bitmap.
    pub(crate) fn is_plausible_ref(&self, state: &HeapState, r: HeapRef) -> bool {
        r != JNULL && r % WORD == 0 && r < state.end && self.bitmap_get(r)
    }

    // ------------------------------------------------------------------
    // Segregated bins
    // ------------------------------------------------------------------

    /// Pulls a chunk of at least `size` bytes (word multiple) from the bins.
    fn get_chunk(&self, state: &mut HeapState, size: usize) -> Option<HeapRef> {
        debug_assert!(size % WORD == 0 && size > 0);

        if size <= BIN_MAX_SIZE {
            let mut id = size / WORD - 1;
            while id < BIN_ENTRIES {
                let head = state.small_bins[id];
                if head != JNULL {
                    state.small_bins[id] = self.read_word(head);
                    let chunk_size = (id + 1) * WORD;
                    self.put_chunk(state, head + size, chunk_size - size);
                    return Some(head);
                }
                id += 1;
            }

            // Chop the first large chunk.
            let head = state.large_bin;
            if head != JNULL {
                let chunk_size = self.read_word(head + WORD);
                state.large_bin = self.read_word(head);
                self.put_chunk(state, head + size, chunk_size - size);
                return Some(head);
            }
        } else {
            // First fit over the large list.
            let mut prev = JNULL;
            let mut curr = state.large_bin;
            while curr != JNULL {
                let next = self.read_word(curr);
                let chunk_size = self.read_word(curr + WORD);
                if chunk_size >= size {
                    if prev == JNULL {
                        state.large_bin = next;
                    } else {
                        self.write_word(prev, next);
                    }
                    self.put_chunk(state, curr + size, chunk_size - size);
                    return Some(curr);
                }
                prev = curr;
                curr = next;
            }
        }

        None
    }

    /// Returns a free chunk to the appropriate bin. Zero-sized releases are
    /// no-ops. Free-list links live inside the chunks themselves: small
    /// chunks hold a next offset in their first word, large chunks a next
    /// offset and a byte size.
    pub(crate) fn put_chunk(&self, state: &mut HeapState, chunk: HeapRef, size: usize) {
        debug_assert!(size % WORD == 0);

        if size == 0 {
            return;
        } else if size <= BIN_MAX_SIZE {
            let id = size / WORD - 1;
            self.write_word(chunk, state.small_bins[id]);
            state.small_bins[id] = chunk;
        } else {
            self.write_word(chunk, state.large_bin);
            self.write_word(chunk + WORD, size);
            state.large_bin = chunk;
        }
    }

    /// Carves a zeroed chunk, without collecting. `size` in bytes, word
    /// multiple. The caller handles the failure by collecting and retrying.
    fn alloc_chunk(&self, state: &mut HeapState, size: usize) -> Result<HeapRef, AllocFailure> {
        match self.get_chunk(state, size) {
            Some(chunk) => {
                unsafe {
                    std::ptr::write_bytes(self.ptr(chunk), 0, size);
                }
                Ok(chunk)
            }
            None => Err(AllocFailure { requested: size }),
        }
    }

    /// Total free bytes sitting in the bins (Runtime.freeMemory).
    pub fn free_memory(&self) -> usize {
        let state = self.lock_state();
        let mut total = 0;

        for (id, &head) in state.small_bins.iter().enumerate() {
            let mut chunk = head;
            while chunk != JNULL {
                total += (id + 1) * WORD;
                chunk = self.read_word(chunk);
            }
        }

        let mut chunk = state.large_bin;
        while chunk != JNULL {
            total += self.read_word(chunk + WORD);
            chunk = self.read_word(chunk);
        }

        total
    }

    /// Current size of the GC area (Runtime.totalMemory).
    pub fn total_memory(&self) -> usize {
        self.lock_state().end
    }

    // ------------------------------------------------------------------
    // Class shapes
    // ------------------------------------------------------------------

    /// Registers the shape of a freshly linked class. Must happen before the
    /// first instance of the class is allocated.
    pub fn register_shape(&self, class_id: ClassId, shape: ClassShape) {
        let mut shapes = self.shapes.write().unwrap();
        let index = class_id.to_index();
        if shapes.len() <= index {
            shapes.resize(index + 1, None);
        }
        shapes[index] = Some(shape);
    }

    pub fn shape(&self, class_id: ClassId) -> Result<ClassShape, VmError> {
        self.shapes
            .read()
            .unwrap()
            .get(class_id.to_index())
            .copied()
            .flatten()
            .ok_or_else(|| VmError::Internal(format!("no shape registered for {}", class_id)))
    }

    fn shape_of(&self, r: HeapRef) -> Result<ClassShape, VmError> {
        self.shape(self.class_id_of(r)?)
    }

    pub fn is_array(&self, r: HeapRef) -> Result<bool, VmError> {
        Ok(matches!(
            self.shape_of(r)?,
            ClassShape::PrimitiveArray(_) | ClassShape::ReferenceArray
        ))
    }

    /// (reference slot count, non-reference bytes incl. length word area)
    /// for a live object, array or instance. The object's total footprint is
    /// `ref_n * WORD + WORD + word_ceil(nref)`.
    pub(crate) fn object_extent(&self, r: HeapRef) -> Result<(usize, usize), VmError> {
        match self.shape_of(r)? {
            ClassShape::Instance { ref_n, nref_size, .. } => {
                Ok((ref_n as usize, nref_size as usize))
            }
            ClassShape::PrimitiveArray(elem) => {
                let len = self.array_length(r)? as usize;
                let payload = if elem == AllocationType::Boolean {
                    len.div_ceil(8)
                } else {
                    len * elem.byte_size()
                };
                Ok((0, WORD + payload))
            }
            ClassShape::ReferenceArray => {
                let len = self.array_length(r)? as usize;
                Ok((len, WORD))
            }
        }
    }

    // ------------------------------------------------------------------
    // Object creation
    // ------------------------------------------------------------------

    /// Size in bytes of an instance allocation for a given shape.
    pub(crate) fn instance_alloc_size(ref_n: usize, nref_size: usize) -> usize {
        ref_n * WORD + WORD + word_ceil(nref_size)
    }

    /// Allocates a plain object. The returned reference points at the
    /// header; the reference area sits in the bytes preceding it.
    pub fn try_alloc_instance(&self, class_id: ClassId) -> Result<HeapRef, AllocFailure> {
        let (ref_n, nref_size) = match self.shape(class_id) {
            Ok(ClassShape::Instance { ref_n, nref_size, .. }) => {
                (ref_n as usize, nref_size as usize)
            }
            _ => panic!("alloc_instance of a non-instance class {}", class_id),
        };

        let size = Self::instance_alloc_size(ref_n, nref_size);
        let mut state = self.lock_state();
        let chunk = self.alloc_chunk(&mut state, size)?;
        let r = chunk + ref_n * WORD;
        self.bitmap_set(r);
        self.set_header(r, HeaderWord::object(class_id));
        Ok(r)
    }

    /// Allocates a primitive array. Payload follows the length word;
    /// booleans are packed eight per byte.
    pub fn try_alloc_primitive_array(
        &self,
        class_id: ClassId,
        elem: AllocationType,
        count: i32,
    ) -> Result<HeapRef, AllocFailure> {
        debug_assert!(count >= 0);
        let count = count as usize;
        let payload = if elem == AllocationType::Boolean {
            count.div_ceil(8)
        } else {
            count * elem.byte_size()
        };
        let size = word_ceil(Self::ARRAY_HEADER_BYTES + payload);

        let mut state = self.lock_state();
        let r = self.alloc_chunk(&mut state, size)?;
        self.bitmap_set(r);
        self.set_header(r, HeaderWord::object(class_id));
        self.write_word(r + WORD, count);
        Ok(r)
    }

    /// Allocates a reference array. The element slots sit *before* the
    /// header and are addressed with negative indices from it.
    pub fn try_alloc_reference_array(
        &self,
        class_id: ClassId,
        count: i32,
    ) -> Result<HeapRef, AllocFailure> {
        debug_assert!(count >= 0);
        let slots = count as usize * WORD;
        let size = slots + Self::ARRAY_HEADER_BYTES;

        let mut state = self.lock_state();
        let chunk = self.alloc_chunk(&mut state, size)?;
        let r = chunk + slots;
        self.bitmap_set(r);
        self.set_header(r, HeaderWord::object(class_id));
        self.write_word(r + WORD, count as usize);
        Ok(r)
    }

    /// Allocates a raw (non-Java) chunk on the GC heap. Used for method code
    /// buffers. The chunk is tracked as live until `free_raw`.
    pub fn try_alloc_raw(&self, bytes: usize) -> Result<usize, AllocFailure> {
        let payload = word_ceil(bytes);
        let size = payload + WORD;

        let mut state = self.lock_state();
        let r = self.alloc_chunk(&mut state, size)?;
        self.set_header(r, HeaderWord::raw_chunk(payload / WORD));
        state.raw_chunks.push(r);
        Ok(r + WORD)
    }

    /// Releases a raw chunk back to the bins. Freeing null is a no-op.
    pub fn free_raw(&self, data_off: usize) {
        if data_off == JNULL {
            return;
        }
        let r = data_off - WORD;
        let words = match self.header(r).kind() {
            HeaderKind::RawChunk { words } => words,
            HeaderKind::Object { .. } => panic!("free_raw of a Java object"),
        };
        let mut state = self.lock_state();
        state.raw_chunks.retain(|&c| c != r);
        self.put_chunk(&mut state, r, (words + 1) * WORD);
    }

    pub(crate) fn raw_slice(&self, data_off: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr(data_off), len) }
    }

    pub(crate) fn raw_slice_mut(&self, data_off: usize, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr(data_off), len) }
    }

    /// Carves permanent, never-reclaimed storage from the top of the heap,
    /// growing the arena down toward the GC area. Zero-size requests return
    /// the null offset.
    pub fn palloc(&self, bytes: usize) -> Result<usize, VmError> {
        if bytes == 0 {
            return Ok(JNULL);
        }
        let size = word_ceil(bytes);
        let mut state = self.lock_state();
        if state.perm < state.end + size {
            return Err(VmError::OutOfMemory);
        }
        state.perm -= size;
        let off = state.perm;
        unsafe {
            std::ptr::write_bytes(self.ptr(off), 0, size);
        }
        Ok(off)
    }

    /// Registers a reference-typed static cell (a perm offset) as a GC root.
    pub fn register_static_ref_cell(&self, offset: usize) {
        self.lock_state().static_ref_cells.push(offset);
    }

    /// Registers a class mirror object as a GC root.
    pub fn register_mirror(&self, mirror: HeapRef) {
        self.lock_state().mirror_roots.push(mirror);
    }

    /// Pins a literal string for the VM lifetime.
    pub fn register_literal(&self, r: HeapRef) {
        self.lock_state().literal_roots.push(r);
    }

    /// Registers a freshly created weak reference object.
    pub fn register_weak_ref(&self, r: HeapRef) {
        self.lock_state().weak_refs.push(r);
    }

    /// Registers a freshly created object whose class has a finalizer.
    pub fn register_finalizable(&self, r: HeapRef) {
        self.lock_state().finalizable.push(r);
    }

    pub fn set_finalizer_mirror(&self, r: HeapRef) {
        self.lock_state().finalizer_mirror = r;
    }

    pub fn finalizer_mirror(&self) -> HeapRef {
        self.lock_state().finalizer_mirror
    }

    /// Pops an object queued for finalization, if any.
    pub fn take_finalizing(&self) -> Option<HeapRef> {
        self.lock_state().finalizing.pop_front()
    }

    // ------------------------------------------------------------------
    // Typed field access
    // ------------------------------------------------------------------

    fn field_address(&self, r: HeapRef, offset: FieldOffset) -> usize {
        match offset {
            FieldOffset::Ref(slot) => r - (slot as usize + 1) * WORD,
            FieldOffset::NonRef(bytes) => r + WORD + bytes as usize,
            FieldOffset::Bit(bit) => r + WORD + (bit as usize >> 3),
        }
    }

    pub fn read_field(
        &self,
        r: HeapRef,
        offset: FieldOffset,
        ty: AllocationType,
    ) -> Result<Value, VmError> {
        if let FieldOffset::Bit(bit) = offset {
            let byte = unsafe { *self.ptr(self.field_address(r, offset)) };
            return Ok(Value::Integer(((byte >> (bit & 7)) & 1) as i32));
        }
        let addr = self.field_address(r, offset);
        Ok(self.read_typed(addr, ty))
    }

    pub fn write_field(
        &self,
        r: HeapRef,
        offset: FieldOffset,
        ty: AllocationType,
        value: Value,
    ) -> Result<(), VmError> {
        if let FieldOffset::Bit(bit) = offset {
            let addr = self.field_address(r, offset);
            let mask = 1u8 << (bit & 7);
            unsafe {
                let p = self.ptr(addr);
                if value.as_int()? != 0 {
                    *p |= mask;
                } else {
                    *p &= !mask;
                }
            }
            return Ok(());
        }
        let addr = self.field_address(r, offset);
        self.write_typed(addr, ty, value)
    }

    pub(crate) fn read_typed(&self, addr: usize, ty: AllocationType) -> Value {
        unsafe {
            match ty {
                AllocationType::Boolean => {
                    Value::Integer((*self.ptr(addr) != 0) as i32)
                }
                AllocationType::Byte => Value::Integer(*(self.ptr(addr) as *const i8) as i32),
                AllocationType::Char => Value::Integer(*(self.ptr(addr) as *const u16) as i32),
                AllocationType::Short => Value::Integer(*(self.ptr(addr) as *const i16) as i32),
                AllocationType::Int => Value::Integer(*(self.ptr(addr) as *const i32)),
                AllocationType::Float => Value::Float(*(self.ptr(addr) as *const f32)),
                AllocationType::Long => Value::Long(*(self.ptr(addr) as *const i64)),
                AllocationType::Double => Value::Double(*(self.ptr(addr) as *const f64)),
                AllocationType::Reference => {
                    let r = *(self.ptr(addr) as *const usize);
                    if r == JNULL { Value::Null } else { Value::Ref(r) }
                }
            }
        }
    }

    pub(crate) fn write_typed(
        &self,
        addr: usize,
        ty: AllocationType,
        value: Value,
    ) -> Result<(), VmError> {
        unsafe {
            match ty {
                AllocationType::Boolean => {
                    *self.ptr(addr) = (value.as_int()? != 0) as u8;
                }
                AllocationType::Byte => *(self.ptr(addr) as *mut i8) = value.as_int()? as i8,
                AllocationType::Char => *(self.ptr(addr) as *mut u16) = value.as_int()? as u16,
                AllocationType::Short => *(self.ptr(addr) as *mut i16) = value.as_int()? as i16,
                AllocationType::Int => *(self.ptr(addr) as *mut i32) = value.as_int()?,
                AllocationType::Float => *(self.ptr(addr) as *mut f32) = value.as_float()?,
                AllocationType::Long => *(self.ptr(addr) as *mut i64) = value.as_long()?,
                AllocationType::Double => *(self.ptr(addr) as *mut f64) = value.as_double()?,
                AllocationType::Reference => {
                    *(self.ptr(addr) as *mut usize) = match value {
                        Value::Ref(r) => r,
                        Value::Null => JNULL,
                        other => {
                            return Err(VmError::Internal(format!(
                                "reference store of {:?}",
                                other
                            )));
                        }
                    };
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Array access
    // ------------------------------------------------------------------

    pub fn array_length(&self, r: HeapRef) -> Result<i32, VmError> {
        Ok(self.read_word(r + WORD) as i32)
    }

    fn check_index(&self, r: HeapRef, index: i32) -> Result<usize, VmError> {
        let length = self.array_length(r)?;
        // Signed length reinterpreted as unsigned folds the negative-index
        // test into the upper bound check.
        if (index as u32) >= (length as u32) {
            throw_exception!(
                ArrayIndexOutOfBoundsException,
                "Index {} out of bounds for length {}",
                index,
                length
            )?
        }
        Ok(index as usize)
    }

    pub fn read_element(&self, r: HeapRef, index: i32) -> Result<Value, VmError> {
        let index = self.check_index(r, index)?;
        match self.shape_of(r)? {
            ClassShape::PrimitiveArray(AllocationType::Boolean) => {
                let byte = unsafe { *self.ptr(r + Self::ARRAY_HEADER_BYTES + (index >> 3)) };
                Ok(Value::Integer(((byte >> (index & 7)) & 1) as i32))
            }
            ClassShape::PrimitiveArray(elem) => {
                Ok(self.read_typed(r + Self::ARRAY_HEADER_BYTES + index * elem.byte_size(), elem))
            }
            ClassShape::ReferenceArray => {
                let addr = r - (index + 1) * WORD;
                Ok(self.read_typed(addr, AllocationType::Reference))
            }
            ClassShape::Instance { .. } => {
                Err(VmError::Internal("array access on a non-array".to_string()))
            }
        }
    }

    pub fn write_element(&self, r: HeapRef, index: i32, value: Value) -> Result<(), VmError> {
        let index = self.check_index(r, index)?;
        match self.shape_of(r)? {
            ClassShape::PrimitiveArray(AllocationType::Boolean) => {
                let addr = r + Self::ARRAY_HEADER_BYTES + (index >> 3);
                let mask = 1u8 << (index & 7);
                unsafe {
                    let p = self.ptr(addr);
                    if value.as_int()? != 0 {
                        *p |= mask;
                    } else {
                        *p &= !mask;
                    }
                }
                Ok(())
            }
            ClassShape::PrimitiveArray(elem) => self.write_typed(
                r + Self::ARRAY_HEADER_BYTES + index * elem.byte_size(),
                elem,
                value,
            ),
            ClassShape::ReferenceArray => {
                let addr = r - (index + 1) * WORD;
                self.write_typed(addr, AllocationType::Reference, value)
            }
            ClassShape::Instance { .. } => {
                Err(VmError::Internal("array access on a non-array".to_string()))
            }
        }
    }

    /// Copies `length` elements between primitive arrays of the same
    /// element type. Bounds were checked by the caller; regions may overlap.
    pub fn copy_primitive_elements(
        &self,
        src: HeapRef,
        src_pos: usize,
        dst: HeapRef,
        dst_pos: usize,
        length: usize,
    ) -> Result<(), VmError> {
        let elem = match self.shape_of(src)? {
            ClassShape::PrimitiveArray(elem) => elem,
            _ => return Err(VmError::Internal("primitive copy of non-array".to_string())),
        };
        if elem == AllocationType::Boolean {
            // Bit-granular; copy element-wise.
            for i in 0..length {
                let v = self.read_element(src, (src_pos + i) as i32)?;
                self.write_element(dst, (dst_pos + i) as i32, v)?;
            }
            return Ok(());
        }
        let size = elem.byte_size();
        unsafe {
            std::ptr::copy(
                self.ptr(src + Self::ARRAY_HEADER_BYTES + src_pos * size),
                self.ptr(dst + Self::ARRAY_HEADER_BYTES + dst_pos * size),
                length * size,
            );
        }
        Ok(())
    }

    pub fn copy_reference_elements(
        &self,
        src: HeapRef,
        src_pos: usize,
        dst: HeapRef,
        dst_pos: usize,
        length: usize,
    ) -> Result<(), VmError> {
        // Negative strides; go through the slot addresses directly. Handle
        // overlap by choosing the copy direction.
        if src == dst && dst_pos > src_pos {
            for i in (0..length).rev() {
                let v = self.read_element(src, (src_pos + i) as i32)?;
                self.write_element(dst, (dst_pos + i) as i32, v)?;
            }
        } else {
            for i in 0..length {
                let v = self.read_element(src, (src_pos + i) as i32)?;
                self.write_element(dst, (dst_pos + i) as i32, v)?;
            }
        }
        Ok(())
    }

    /// Shallow copy of an object or array: same class, same bytes in both
    /// the reference area and the non-reference area.
    pub fn try_clone_object(&self, src: HeapRef) -> Result<HeapRef, AllocFailure> {
        let class_id = self.class_id_of(src).expect("clone of a raw chunk");
        let (ref_n, nref) = self.object_extent(src).expect("clone of an unregistered class");
        let size = ref_n * WORD + WORD + word_ceil(nref);

        let mut state = self.lock_state();
        let chunk = self.alloc_chunk(&mut state, size)?;
        drop(state);

        let dst = chunk + ref_n * WORD;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr(src - ref_n * WORD),
                self.ptr(chunk),
                size,
            );
        }
        self.bitmap_set(dst);
        self.set_header(dst, HeaderWord::object(class_id));
        Ok(dst)
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    pub fn install_string_layout(&self, layout: StringLayout) {
        self.string_layout
            .set(layout)
            .expect("string layout installed twice");
    }

    pub fn string_layout(&self) -> Result<StringLayout, VmError> {
        self.string_layout
            .get()
            .copied()
            .ok_or(VmError::Unlinked("string layout not installed"))
    }

    pub(crate) fn string_pool_get(&self, sym: Symbol) -> Option<HeapRef> {
        self.string_pool.get(&sym).map(|e| *e)
    }

    pub(crate) fn string_pool_insert(&self, sym: Symbol, r: HeapRef) {
        self.string_pool.insert(sym, r);
    }

    /// Drops interned entries whose string object did not survive marking.
    /// Runs between mark and sweep.
    pub(crate) fn purge_string_pool(&self) {
        self.string_pool
            .retain(|_, r| self.header(*r).is_marked());
    }

    /// Reads a Java string back into a Rust string.
    pub fn java_string_to_rust(&self, r: HeapRef) -> Result<String, VmError> {
        let layout = self.string_layout()?;
        let value = match self.read_field(r, layout.value, AllocationType::Reference)? {
            Value::Ref(v) => v,
            _ => return Err(VmError::Internal("String.value is null".to_string())),
        };
        let offset = self.read_field(r, layout.offset, AllocationType::Int)?.as_int()?;
        let count = self.read_field(r, layout.count, AllocationType::Int)?.as_int()?;

        let mut units = Vec::with_capacity(count as usize);
        for i in 0..count {
            units.push(self.read_element(value, offset + i)?.as_int()? as u16);
        }
        String::from_utf16(&units)
            .map_err(|_| VmError::Internal("unpaired surrogate in String".to_string()))
    }

    pub fn interner(&self) -> &ThreadedRodeo {
        &self.interner
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.base as *mut libc::c_void, self.reserved) != 0 {
                debug_log!("munmap failed during heap teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> Heap {
        let interner = Arc::new(ThreadedRodeo::default());
        Heap::new(1024 * 1024, interner).unwrap()
    }

    fn instance_shape(ref_n: u32, nref_size: u32) -> ClassShape {
        ClassShape::Instance {
            ref_n,
            nref_size,
            has_finalizer: false,
            weak_referent: None,
        }
    }

    #[test]
    fn instance_allocation_sets_bitmap_and_header() {
        let heap = test_heap();
        let cid = ClassId::from_usize(7);
        heap.register_shape(cid, instance_shape(2, 12));

        let r = heap.try_alloc_instance(cid).unwrap();
        assert!(heap.bitmap_get(r));
        assert_eq!(heap.class_id_of(r).unwrap(), cid);
        assert!(heap.header(r).is_object());
        assert!(!heap.header(r).is_marked());
    }

    #[test]
    fn reference_fields_precede_the_header() {
        let heap = test_heap();
        let cid = ClassId::from_usize(1);
        heap.register_shape(cid, instance_shape(2, 8));
        let r = heap.try_alloc_instance(cid).unwrap();

        let target = heap.try_alloc_instance(cid).unwrap();
        heap.write_field(r, FieldOffset::Ref(1), AllocationType::Reference, Value::Ref(target))
            .unwrap();

        // Slot 1 is two words before the header.
        assert_eq!(heap.read_word(r - 2 * WORD), target);
        assert_eq!(
            heap.read_field(r, FieldOffset::Ref(1), AllocationType::Reference)
                .unwrap(),
            Value::Ref(target)
        );
    }

    #[test]
    fn nonref_fields_follow_the_header() {
        let heap = test_heap();
        let cid = ClassId::from_usize(1);
        heap.register_shape(cid, instance_shape(0, 16));
        let r = heap.try_alloc_instance(cid).unwrap();

        heap.write_field(r, FieldOffset::NonRef(0), AllocationType::Long, Value::Long(-5))
            .unwrap();
        heap.write_field(r, FieldOffset::NonRef(8), AllocationType::Int, Value::Integer(9))
            .unwrap();
        assert_eq!(
            heap.read_field(r, FieldOffset::NonRef(0), AllocationType::Long)
                .unwrap(),
            Value::Long(-5)
        );
        assert_eq!(
            heap.read_field(r, FieldOffset::NonRef(8), AllocationType::Int)
                .unwrap(),
            Value::Integer(9)
        );
    }

    #[test]
    fn boolean_fields_are_single_bits() {
        let heap = test_heap();
        let cid = ClassId::from_usize(1);
        heap.register_shape(cid, instance_shape(0, 8));
        let r = heap.try_alloc_instance(cid).unwrap();

        let a = FieldOffset::Bit(0);
        let b = FieldOffset::Bit(1);
        heap.write_field(r, a, AllocationType::Boolean, Value::Integer(1)).unwrap();
        assert_eq!(
            heap.read_field(r, a, AllocationType::Boolean).unwrap(),
            Value::Integer(1)
        );
        assert_eq!(
            heap.read_field(r, b, AllocationType::Boolean).unwrap(),
            Value::Integer(0)
        );
        heap.write_field(r, a, AllocationType::Boolean, Value::Integer(0)).unwrap();
        assert_eq!(
            heap.read_field(r, a, AllocationType::Boolean).unwrap(),
            Value::Integer(0)
        );
    }

    #[test]
    fn primitive_array_roundtrip() {
        let heap = test_heap();
        let cid = ClassId::from_usize(3);
        heap.register_shape(cid, ClassShape::PrimitiveArray(AllocationType::Int));
        let r = heap.try_alloc_primitive_array(cid, AllocationType::Int, 5).unwrap();

        assert_eq!(heap.array_length(r).unwrap(), 5);
        for i in 0..5 {
            heap.write_element(r, i, Value::Integer(i * 10)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(heap.read_element(r, i).unwrap(), Value::Integer(i * 10));
        }
    }

    #[test]
    fn boolean_array_packs_bits() {
        let heap = test_heap();
        let cid = ClassId::from_usize(3);
        heap.register_shape(cid, ClassShape::PrimitiveArray(AllocationType::Boolean));
        let r = heap
            .try_alloc_primitive_array(cid, AllocationType::Boolean, 19)
            .unwrap();

        for i in (0..19).step_by(3) {
            heap.write_element(r, i, Value::Integer(1)).unwrap();
        }
        for i in 0..19 {
            let expected = if i % 3 == 0 { 1 } else { 0 };
            assert_eq!(heap.read_element(r, i).unwrap(), Value::Integer(expected));
        }
    }

    #[test]
    fn reference_array_payload_precedes_header() {
        let heap = test_heap();
        let acid = ClassId::from_usize(4);
        let icid = ClassId::from_usize(5);
        heap.register_shape(acid, ClassShape::ReferenceArray);
        heap.register_shape(icid, instance_shape(0, 0));

        let arr = heap.try_alloc_reference_array(acid, 3).unwrap();
        let obj = heap.try_alloc_instance(icid).unwrap();
        heap.write_element(arr, 2, Value::Ref(obj)).unwrap();

        assert_eq!(heap.read_word(arr - 3 * WORD), obj);
        assert_eq!(heap.read_element(arr, 2).unwrap(), Value::Ref(obj));
        assert_eq!(heap.read_element(arr, 0).unwrap(), Value::Null);
    }

    #[test]
    fn array_index_checks_fold_negative_indices() {
        let heap = test_heap();
        let cid = ClassId::from_usize(3);
        heap.register_shape(cid, ClassShape::PrimitiveArray(AllocationType::Byte));
        let r = heap.try_alloc_primitive_array(cid, AllocationType::Byte, 4).unwrap();

        assert!(heap.read_element(r, -1).is_err());
        assert!(heap.read_element(r, 4).is_err());
        assert!(heap.read_element(r, 3).is_ok());
    }

    #[test]
    fn small_bins_split_and_reuse() {
        let heap = test_heap();
        let before = heap.free_memory();

        let chunk = heap.try_alloc_raw(3 * WORD).unwrap();
        heap.free_raw(chunk);
        assert_eq!(heap.free_memory(), before);
    }

    #[test]
    fn palloc_grows_down_and_is_zeroed() {
        let heap = test_heap();
        let a = heap.palloc(24).unwrap();
        let b = heap.palloc(8).unwrap();
        assert!(b < a);
        assert_eq!(heap.read_word(a), 0);
    }

    #[test]
    fn zero_sized_palloc_is_null() {
        let heap = test_heap();
        assert_eq!(heap.palloc(0).unwrap(), JNULL);
    }

    #[test]
    fn header_word_kinds() {
        let h = HeaderWord::object(ClassId::from_usize(12));
        assert!(h.is_object());
        assert_eq!(h.class_id(), Some(ClassId::from_usize(12)));
        assert!(h.with_mark().is_object());
        assert!(h.with_mark().is_marked());
        assert_eq!(h.with_mark().without_mark(), h);

        let c = HeaderWord::raw_chunk(5);
        assert!(!c.is_object());
        match c.kind() {
            HeaderKind::RawChunk { words } => assert_eq!(words, 5),
            _ => panic!("expected raw chunk"),
        }
    }
}
