//! Shared memory pooling for one node link.
//!
//! Each node link owns a *primary buffer* established during connection,
//! a small region carved into fixed-purpose slots (a header, link states
//! for the initial portals, and a block allocator for further link states),
//! plus any number of *auxiliary buffers* added on demand when an
//! allocator runs dry. Fragments are addressed as `(buffer id, offset)`
//! pairs so either side can name them on the wire.
//!
//! Block allocators live inside the shared buffers themselves: a versioned
//! free-list head plus an intrusive next-index in every free block, updated
//! with compare-and-swap so both nodes can allocate and free concurrently
//! without a lock.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use weft_core::{BufferId, Mapping, SharedRegion};

use crate::link::state::RouterLinkState;
use crate::node::link::NodeLink;
use crate::node::Node;

/// Size of every primary buffer.
pub const PRIMARY_BUFFER_SIZE: usize = 64 * 1024;

/// Size of auxiliary buffers requested when a link-state allocator runs
/// dry.
pub const AUX_BUFFER_SIZE: usize = 16 * 1024;

/// Fixed slots for the link states of initial portals, bounding how many
/// initial portals a connection may request.
pub const NUM_INITIAL_LINK_STATES: usize = 8;

const PRIMARY_HEADER_SIZE: usize = 64;
const INITIAL_STATES_OFFSET: usize = PRIMARY_HEADER_SIZE;
const LINK_STATE_SIZE: usize = std::mem::size_of::<RouterLinkState>();
const PRIMARY_ALLOCATOR_OFFSET: usize =
    INITIAL_STATES_OFFSET + NUM_INITIAL_LINK_STATES * LINK_STATE_SIZE;
const PRIMARY_MAGIC: u64 = 0x7765_6674_6c6e_6b6d; // "weftlnkm"

/// Names a span of one shared buffer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentDescriptor {
    /// The buffer containing the fragment.
    pub buffer: BufferId,
    /// Byte offset of the fragment within the buffer.
    pub offset: u32,
    /// Fragment length in bytes. Zero means the null fragment.
    pub size: u32,
}

impl FragmentDescriptor {
    /// The null descriptor.
    pub const NULL: FragmentDescriptor = FragmentDescriptor {
        buffer: BufferId(0),
        offset: 0,
        size: 0,
    };

    /// Whether this names no fragment at all.
    pub fn is_null(&self) -> bool {
        self.size == 0
    }
}

/// Values that may live inside managed shared fragments.
///
/// The reference count is stored in the shared value itself so that the
/// last release on *either* node returns the block to its allocator.
pub trait RefCountedFragment {
    /// The shared reference count.
    fn fragment_ref_count(&self) -> &std::sync::atomic::AtomicI32;
}

impl RefCountedFragment for RouterLinkState {
    fn fragment_ref_count(&self) -> &std::sync::atomic::AtomicI32 {
        self.ref_count()
    }
}

/// A counted reference to a typed shared-memory fragment.
///
/// A ref is *addressable* when its buffer is mapped locally, and *pending*
/// when the buffer id is known but the buffer has not arrived yet (aux
/// buffers are announced asynchronously). Pending refs resolve by
/// re-adoption once the buffer lands.
pub struct FragmentRef<T: RefCountedFragment> {
    memory: Arc<NodeLinkMemory>,
    descriptor: FragmentDescriptor,
    addr: Option<NonNull<T>>,
    managed: bool,
}

// The fragment address points into a mapping owned by `memory`, which the
// ref keeps alive; the pointee is Sync by the RefCountedFragment contract.
unsafe impl<T: RefCountedFragment + Sync> Send for FragmentRef<T> {}
unsafe impl<T: RefCountedFragment + Sync> Sync for FragmentRef<T> {}

impl<T: RefCountedFragment> FragmentRef<T> {
    /// The wire descriptor for this fragment.
    pub fn descriptor(&self) -> FragmentDescriptor {
        self.descriptor
    }

    /// Whether the fragment bytes are reachable in this process.
    pub fn is_addressable(&self) -> bool {
        self.addr.is_some()
    }

    /// A reference to the value, when addressable.
    pub fn get(&self) -> Option<&T> {
        // Valid for as long as `memory` (held by self) keeps the buffer
        // mapped.
        self.addr.map(|ptr| unsafe { ptr.as_ref() })
    }

    /// Takes an additional shared reference. Only possible once the
    /// fragment is addressable.
    pub fn clone_ref(&self) -> Option<FragmentRef<T>> {
        let addr = self.addr?;
        if self.managed {
            // The count lives in shared memory; bump before aliasing.
            unsafe { addr.as_ref() }
                .fragment_ref_count()
                .fetch_add(1, Ordering::AcqRel);
        }
        Some(FragmentRef {
            memory: self.memory.clone(),
            descriptor: self.descriptor,
            addr: Some(addr),
            managed: self.managed,
        })
    }

    /// Transfers this reference's count across the wire: the descriptor is
    /// returned and the local count is intentionally not decremented. The
    /// receiver adopts the count with [`NodeLinkMemory::adopt_fragment`].
    pub fn release(self) -> FragmentDescriptor {
        let descriptor = self.descriptor;
        std::mem::forget(self);
        descriptor
    }
}

impl<T: RefCountedFragment> Drop for FragmentRef<T> {
    fn drop(&mut self) {
        if !self.managed {
            return;
        }
        let Some(addr) = self.addr else {
            // A pending managed ref dropped before its buffer arrived leaks
            // the shared count; the block is reclaimed with the buffer.
            return;
        };
        let previous = unsafe { addr.as_ref() }
            .fragment_ref_count()
            .fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.memory.free_fragment(self.descriptor);
        }
    }
}

impl<T: RefCountedFragment> std::fmt::Debug for FragmentRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentRef")
            .field("descriptor", &self.descriptor)
            .field("addressable", &self.addr.is_some())
            .finish()
    }
}

/// A lock-free fixed-size block allocator laid out inside a shared region.
///
/// Region layout: `[head: u64][block_size: u32][num_blocks: u32][blocks…]`.
/// The head packs `index + 1` in its low half (0 means empty) and a
/// version counter in its high half to defeat A-B-A races.
struct BlockAllocator {
    base: NonNull<u8>,
    block_size: u32,
    num_blocks: u32,
}

// Operates on shared memory through atomics only.
unsafe impl Send for BlockAllocator {}
unsafe impl Sync for BlockAllocator {}

const BLOCK_REGION_HEADER: usize = 16;

impl BlockAllocator {
    fn head(&self) -> &AtomicU64 {
        unsafe { &*(self.base.as_ptr() as *const AtomicU64) }
    }

    fn block_next(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.num_blocks);
        unsafe {
            let ptr = self
                .base
                .as_ptr()
                .add(BLOCK_REGION_HEADER + index as usize * self.block_size as usize);
            &*(ptr as *const AtomicU32)
        }
    }

    fn block_offset(&self, index: u32) -> usize {
        BLOCK_REGION_HEADER + index as usize * self.block_size as usize
    }

    /// Lays out a fresh allocator over `len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at `len` writable bytes, 8-aligned, not yet shared.
    unsafe fn initialize(base: NonNull<u8>, len: usize, block_size: u32) -> Option<Self> {
        if len <= BLOCK_REGION_HEADER || block_size < 8 {
            return None;
        }
        let num_blocks = ((len - BLOCK_REGION_HEADER) / block_size as usize) as u32;
        if num_blocks == 0 {
            return None;
        }
        let allocator = Self {
            base,
            block_size,
            num_blocks,
        };
        std::ptr::write_bytes(base.as_ptr(), 0, BLOCK_REGION_HEADER);
        (base.as_ptr().add(8) as *mut u32).write(block_size);
        (base.as_ptr().add(12) as *mut u32).write(num_blocks);
        for index in 0..num_blocks {
            // Free blocks link to their successor; the last links to none.
            let next = if index + 1 < num_blocks { index + 2 } else { 0 };
            allocator.block_next(index).store(next, Ordering::Relaxed);
        }
        allocator.head().store(1, Ordering::Release);
        Some(allocator)
    }

    /// Adopts an allocator previously initialized by the other side.
    ///
    /// # Safety
    ///
    /// `base` must point at `len` bytes of the shared region.
    unsafe fn attach(base: NonNull<u8>, len: usize, expected_block_size: u32) -> Option<Self> {
        if len <= BLOCK_REGION_HEADER {
            return None;
        }
        let block_size = (base.as_ptr().add(8) as *const u32).read();
        let num_blocks = (base.as_ptr().add(12) as *const u32).read();
        if block_size != expected_block_size || block_size < 8 {
            return None;
        }
        let span = (num_blocks as usize).checked_mul(block_size as usize)?;
        if BLOCK_REGION_HEADER + span > len {
            return None;
        }
        Some(Self {
            base,
            block_size,
            num_blocks,
        })
    }

    fn allocate(&self) -> Option<u32> {
        loop {
            let head = self.head().load(Ordering::Acquire);
            let slot = (head & 0xffff_ffff) as u32;
            if slot == 0 {
                return None;
            }
            let index = slot - 1;
            if index >= self.num_blocks {
                // Corrupt or hostile shared state; fail closed.
                tracing::warn!(index, "block allocator free list out of range");
                return None;
            }
            let next = self.block_next(index).load(Ordering::Acquire);
            let version = head >> 32;
            let new_head = ((version + 1) << 32) | next as u64;
            if self
                .head()
                .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
        }
    }

    fn free(&self, index: u32) {
        if index >= self.num_blocks {
            tracing::warn!(index, "ignoring out-of-range block free");
            return;
        }
        loop {
            let head = self.head().load(Ordering::Acquire);
            let slot = (head & 0xffff_ffff) as u32;
            self.block_next(index).store(slot, Ordering::Release);
            let version = head >> 32;
            let new_head = ((version + 1) << 32) | (index + 1) as u64;
            if self
                .head()
                .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

struct AllocatorEntry {
    fragment_size: u32,
    buffer: BufferId,
    buffer_offset: usize,
    allocator: BlockAllocator,
}

type VoidCallback = Box<dyn FnOnce() + Send>;

struct MemoryInner {
    buffers: HashMap<BufferId, Arc<Mapping>>,
    allocators: Vec<AllocatorEntry>,
    buffer_callbacks: HashMap<BufferId, Vec<VoidCallback>>,
    capacity_callbacks: HashMap<u32, Vec<VoidCallback>>,
    node_link: Option<Weak<NodeLink>>,
}

/// The pooled shared memory belonging to one node link.
pub struct NodeLinkMemory {
    node: Arc<Node>,
    primary: Arc<Mapping>,
    inner: Mutex<MemoryInner>,
}

impl NodeLinkMemory {
    /// Lays out a fresh primary buffer inside `region`: header, initial
    /// link states, and the link-state block allocator. Run once by the
    /// region's creator before any peer sees it.
    pub fn initialize_primary_region(region: &SharedRegion) -> bool {
        let Ok(mapping) = region.clone().map() else {
            return false;
        };
        if mapping.len() < PRIMARY_BUFFER_SIZE {
            return false;
        }
        let base = mapping.base();
        unsafe {
            (base.as_ptr() as *mut u64).write(PRIMARY_MAGIC);
            (base.as_ptr().add(8) as *mut AtomicU64).write(AtomicU64::new(1));
            for i in 0..NUM_INITIAL_LINK_STATES {
                let ptr = base.as_ptr().add(INITIAL_STATES_OFFSET + i * LINK_STATE_SIZE);
                RouterLinkState::initialize(ptr as *mut RouterLinkState, 0);
            }
        }
        let Some(allocator_base) = mapping.ptr_at(PRIMARY_ALLOCATOR_OFFSET) else {
            return false;
        };
        unsafe {
            BlockAllocator::initialize(
                allocator_base,
                PRIMARY_BUFFER_SIZE - PRIMARY_ALLOCATOR_OFFSET,
                LINK_STATE_SIZE as u32,
            )
        }
        .is_some()
    }

    /// Adopts the primary buffer allocated by the peer.
    pub fn adopt(node: Arc<Node>, region: SharedRegion) -> Option<Arc<NodeLinkMemory>> {
        let mapping = region.map().ok()?;
        if mapping.len() < PRIMARY_BUFFER_SIZE {
            return None;
        }
        let magic = unsafe { (mapping.base().as_ptr() as *const u64).read() };
        if magic != PRIMARY_MAGIC {
            tracing::warn!("rejecting primary buffer with bad magic");
            return None;
        }
        let allocator_base = mapping.ptr_at(PRIMARY_ALLOCATOR_OFFSET)?;
        let allocator = unsafe {
            BlockAllocator::attach(
                allocator_base,
                PRIMARY_BUFFER_SIZE - PRIMARY_ALLOCATOR_OFFSET,
                LINK_STATE_SIZE as u32,
            )?
        };
        Some(Arc::new(Self::with_primary(node, mapping, allocator)))
    }

    fn with_primary(node: Arc<Node>, mapping: Mapping, allocator: BlockAllocator) -> Self {
        let primary = Arc::new(mapping);
        let mut buffers = HashMap::new();
        buffers.insert(BufferId(0), primary.clone());
        Self {
            node,
            primary,
            inner: Mutex::new(MemoryInner {
                buffers,
                allocators: vec![AllocatorEntry {
                    fragment_size: LINK_STATE_SIZE as u32,
                    buffer: BufferId(0),
                    buffer_offset: PRIMARY_ALLOCATOR_OFFSET,
                    allocator,
                }],
                buffer_callbacks: HashMap::new(),
                capacity_callbacks: HashMap::new(),
                node_link: None,
            }),
        }
    }

    /// Binds the link that owns this pool, enabling buffer announcements.
    pub fn set_node_link(&self, link: &Arc<NodeLink>) {
        self.inner.lock().node_link = Some(Arc::downgrade(link));
    }

    /// Mints a buffer id unique across both sides of the link.
    pub fn allocate_buffer_id(&self) -> BufferId {
        let counter =
            unsafe { &*(self.primary.base().as_ptr().add(8) as *const AtomicU64) };
        BufferId(counter.fetch_add(1, Ordering::Relaxed))
    }

    /// The shared link state reserved for initial portal `i`.
    pub fn initial_router_link_state(
        self: &Arc<Self>,
        i: usize,
    ) -> Option<FragmentRef<RouterLinkState>> {
        if i >= NUM_INITIAL_LINK_STATES {
            return None;
        }
        let offset = INITIAL_STATES_OFFSET + i * LINK_STATE_SIZE;
        let addr = self.primary.ptr_at(offset)?.cast::<RouterLinkState>();
        unsafe {
            // Both sides derive this slot independently; either may be
            // first, so make it stable idempotently.
            addr.as_ref().set_side_stable(weft_core::LinkSide::A);
            addr.as_ref().set_side_stable(weft_core::LinkSide::B);
        }
        Some(FragmentRef {
            memory: self.clone(),
            descriptor: FragmentDescriptor {
                buffer: BufferId(0),
                offset: offset as u32,
                size: LINK_STATE_SIZE as u32,
            },
            addr: Some(addr),
            managed: false,
        })
    }

    /// Allocates and initializes a fresh shared link state, or `None` when
    /// every allocator is exhausted.
    pub fn allocate_router_link_state(self: &Arc<Self>) -> Option<FragmentRef<RouterLinkState>> {
        let descriptor = self.allocate_fragment(LINK_STATE_SIZE as u32)?;
        let addr = self.resolve(descriptor)?.cast::<RouterLinkState>();
        unsafe { RouterLinkState::initialize(addr.as_ptr(), 1) };
        Some(FragmentRef {
            memory: self.clone(),
            descriptor,
            addr: Some(addr),
            managed: true,
        })
    }

    /// Adopts a fragment reference whose count was transferred on the wire.
    /// The result is pending when the named buffer has not arrived yet.
    pub fn adopt_fragment(
        self: &Arc<Self>,
        descriptor: FragmentDescriptor,
    ) -> Option<FragmentRef<RouterLinkState>> {
        if descriptor.is_null() || (descriptor.size as usize) < LINK_STATE_SIZE {
            return None;
        }
        if descriptor.offset as usize % 8 != 0 {
            return None;
        }
        let addr = self.resolve(descriptor).map(NonNull::cast::<RouterLinkState>);
        Some(FragmentRef {
            memory: self.clone(),
            descriptor,
            addr,
            managed: true,
        })
    }

    fn resolve(&self, descriptor: FragmentDescriptor) -> Option<NonNull<u8>> {
        let inner = self.inner.lock();
        let mapping = inner.buffers.get(&descriptor.buffer)?;
        let end = (descriptor.offset as usize).checked_add(descriptor.size as usize)?;
        if end > mapping.len() {
            return None;
        }
        mapping.ptr_at(descriptor.offset as usize)
    }

    fn allocate_fragment(&self, size: u32) -> Option<FragmentDescriptor> {
        let size = size.next_power_of_two().max(LINK_STATE_SIZE as u32);
        let inner = self.inner.lock();
        for entry in &inner.allocators {
            if entry.fragment_size != size {
                continue;
            }
            if let Some(index) = entry.allocator.allocate() {
                let offset = entry.buffer_offset + entry.allocator.block_offset(index);
                return Some(FragmentDescriptor {
                    buffer: entry.buffer,
                    offset: offset as u32,
                    size,
                });
            }
        }
        None
    }

    fn free_fragment(&self, descriptor: FragmentDescriptor) {
        let inner = self.inner.lock();
        for entry in &inner.allocators {
            if entry.buffer != descriptor.buffer {
                continue;
            }
            let offset = descriptor.offset as usize;
            if offset < entry.buffer_offset + BLOCK_REGION_HEADER {
                continue;
            }
            let relative = offset - entry.buffer_offset - BLOCK_REGION_HEADER;
            if relative % entry.fragment_size as usize != 0 {
                continue;
            }
            entry.allocator.free((relative / entry.fragment_size as usize) as u32);
            return;
        }
        tracing::warn!(?descriptor, "freed fragment matched no allocator");
    }

    /// Runs `callback` once the named buffer is mapped locally; inline when
    /// it already is.
    pub fn on_buffer_available(&self, buffer: BufferId, callback: VoidCallback) {
        {
            let mut inner = self.inner.lock();
            if !inner.buffers.contains_key(&buffer) {
                inner.buffer_callbacks.entry(buffer).or_default().push(callback);
                return;
            }
        }
        callback();
    }

    /// Requests more allocator capacity for fragments of `fragment_size`
    /// bytes and runs `callback` once some is available. Requests for the
    /// same size are coalesced.
    pub fn request_capacity(
        self: &Arc<Self>,
        buffer_size: usize,
        fragment_size: u32,
        callback: VoidCallback,
    ) {
        let fragment_size = fragment_size.next_power_of_two().max(LINK_STATE_SIZE as u32);
        {
            let mut inner = self.inner.lock();
            let callbacks = inner.capacity_callbacks.entry(fragment_size).or_default();
            callbacks.push(callback);
            if callbacks.len() > 1 {
                return;
            }
        }

        let this = self.clone();
        self.node.clone().allocate_region_async(
            buffer_size,
            Box::new(move |region| {
                let Some(region) = region else {
                    tracing::warn!("shared memory request failed; allocator stays dry");
                    return;
                };
                let buffer_id = this.allocate_buffer_id();
                let Ok(mapping) = region.clone().map() else {
                    return;
                };
                let callbacks = {
                    let mut inner = this.inner.lock();
                    let Some(base) = mapping.ptr_at(0) else {
                        return;
                    };
                    let Some(allocator) = (unsafe {
                        BlockAllocator::initialize(base, mapping.len(), fragment_size)
                    }) else {
                        return;
                    };
                    inner.buffers.insert(buffer_id, Arc::new(mapping));
                    inner.allocators.push(AllocatorEntry {
                        fragment_size,
                        buffer: buffer_id,
                        buffer_offset: 0,
                        allocator,
                    });
                    inner
                        .capacity_callbacks
                        .remove(&fragment_size)
                        .unwrap_or_default()
                };

                let link = this.inner.lock().node_link.clone();
                if let Some(link) = link.and_then(|weak| weak.upgrade()) {
                    link.announce_allocator_buffer(buffer_id, fragment_size, region);
                }
                for callback in callbacks {
                    callback();
                }
            }),
        );
    }

    /// Registers a buffer announced by the peer. Returns false on a
    /// duplicate id.
    pub fn add_allocator_buffer(
        &self,
        buffer_id: BufferId,
        fragment_size: u32,
        region: SharedRegion,
    ) -> bool {
        let Ok(mapping) = region.map() else {
            return false;
        };
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.buffers.contains_key(&buffer_id) {
                return false;
            }
            let Some(base) = mapping.ptr_at(0) else {
                return false;
            };
            let Some(allocator) =
                (unsafe { BlockAllocator::attach(base, mapping.len(), fragment_size) })
            else {
                return false;
            };
            inner.buffers.insert(buffer_id, Arc::new(mapping));
            inner.allocators.push(AllocatorEntry {
                fragment_size,
                buffer: buffer_id,
                buffer_offset: 0,
                allocator,
            });
            inner.buffer_callbacks.remove(&buffer_id).unwrap_or_default()
        };

        for callback in callbacks {
            callback();
        }
        true
    }
}

impl std::fmt::Debug for NodeLinkMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NodeLinkMemory")
            .field("buffers", &inner.buffers.len())
            .field("allocators", &inner.allocators.len())
            .finish()
    }
}
