//! Fixed-size shared-memory arena with offset-based addressing.
//!
//! The arena is a named OS shared-memory region holding, in order: a
//! `repr(C)` header (magic, version, a cross-process lock, and the bump
//! cursor), the registry table, and the allocation space for suffix trees.
//! Every cross-process link is stored as a byte offset from the region
//! base; each process adds its own base pointer on access, so the region
//! may be mapped at different addresses in different processes.
//!
//! Allocation is a lock-free atomic bump with a per-process free list:
//! readers never allocate, and the owner reuses freed tree blocks first
//! (uploads for the same fingerprint produce similarly sized trees, so
//! best-fit reuse keeps the bump cursor from running away).

use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use shared_memory::{Shmem, ShmemConf};

use crate::config::ArenaConfig;
use crate::error::CacheError;
use crate::registry::{TreeRegistry, REGISTRY_ENTRY_SIZE};

const ARENA_MAGIC: u64 = 0x524f_4c4c_4341_4348; // "ROLLCACH"
const ARENA_VERSION: u32 = 1;

/// All allocations are aligned to this boundary; every arena-resident type
/// must have alignment <= this.
const ALLOC_ALIGN: u64 = 8;

/// Bytes reserved in front of each allocation for its size, so that
/// `deallocate` does not need a size argument.
const SIZE_WORD: u64 = 8;

#[inline]
const fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

/// Cross-process mutex stored inside the arena header.
///
/// A raw atomic spin lock: in-process lock types park waiting threads in
/// per-process queues and are not correct across process boundaries. The
/// guarded critical sections are registry probes and a pointer swap, so
/// contention is short by construction.
#[repr(C)]
pub struct RawShmLock {
    state: AtomicU32,
    _pad: u32,
}

impl RawShmLock {
    const UNLOCKED: u32 = 0;
    const LOCKED: u32 = 1;

    fn lock(&self) -> ShmLockGuard<'_> {
        let mut spins = 0u32;
        while self
            .state
            .compare_exchange_weak(
                Self::UNLOCKED,
                Self::LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            spins = spins.wrapping_add(1);
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        ShmLockGuard { lock: self }
    }

    fn unlock(&self) {
        self.state.store(Self::UNLOCKED, Ordering::Release);
    }
}

/// RAII guard for the arena lock. Registry operations require a live guard
/// as proof that the caller holds the lock.
pub struct ShmLockGuard<'a> {
    lock: &'a RawShmLock,
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[repr(C)]
struct ArenaHeader {
    magic: u64,
    version: u32,
    _reserved: u32,
    lock: RawShmLock,
    /// Total region size in bytes (offsets must stay below this).
    capacity: u64,
    /// Next unallocated offset from the region base.
    bump: AtomicU64,
    registry_off: u64,
    registry_slots: u64,
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    off: u64,
    size: u64,
}

/// A named shared-memory region with a bump allocator and a registry.
///
/// The owner (`create`) initializes the header and registry; readers
/// (`open`) attach to an existing region and validate its layout. Dropping
/// the owning handle unlinks the OS region; dropping a reader only unmaps.
pub struct SharedArena {
    shmem: Shmem,
    free_list: Mutex<Vec<FreeBlock>>,
}

// SAFETY: the raw mapping pointer is stable for the lifetime of `shmem`,
// shared mutable state behind it is reached only through atomics, the
// header lock, or the (internally synchronized) free list.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl SharedArena {
    /// Create a new region (owner side) and initialize its layout.
    pub fn create(config: &ArenaConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let shmem = ShmemConf::new()
            .os_id(&config.name)
            .size(config.size_bytes)
            .create()?;

        let base = shmem.as_ptr();
        let capacity = shmem.len() as u64;
        let registry_off = align_up(size_of::<ArenaHeader>() as u64, ALLOC_ALIGN);
        let registry_bytes = config.registry_slots as u64 * REGISTRY_ENTRY_SIZE as u64;
        let data_start = align_up(registry_off + registry_bytes, ALLOC_ALIGN);

        // Fresh POSIX shared memory is zero-filled, but the registry's
        // emptiness is a correctness invariant, so zero it explicitly.
        unsafe {
            std::ptr::write_bytes(base.add(registry_off as usize), 0, registry_bytes as usize);
            std::ptr::write(
                base as *mut ArenaHeader,
                ArenaHeader {
                    magic: ARENA_MAGIC,
                    version: ARENA_VERSION,
                    _reserved: 0,
                    lock: RawShmLock {
                        state: AtomicU32::new(RawShmLock::UNLOCKED),
                        _pad: 0,
                    },
                    capacity,
                    bump: AtomicU64::new(data_start),
                    registry_off,
                    registry_slots: config.registry_slots as u64,
                },
            );
        }

        tracing::info!(
            name = %config.name,
            capacity_bytes = capacity,
            registry_slots = config.registry_slots,
            "shared-memory arena created"
        );

        Ok(Self {
            shmem,
            free_list: Mutex::new(Vec::new()),
        })
    }

    /// Attach to an existing region (reader side).
    pub fn open(name: &str) -> Result<Self, CacheError> {
        let shmem = ShmemConf::new().os_id(name).open()?;
        let arena = Self {
            shmem,
            free_list: Mutex::new(Vec::new()),
        };
        let header = arena.header();
        if header.magic != ARENA_MAGIC || header.version != ARENA_VERSION {
            return Err(CacheError::LayoutMismatch { name: name.into() });
        }
        Ok(arena)
    }

    /// Tear down the region. Only meaningful on the owning handle: the OS
    /// region is unlinked when the owner drops, which this forces.
    pub fn remove(self) {
        drop(self);
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: the header is written before any handle is returned and
        // never moves.
        unsafe { &*(self.shmem.as_ptr() as *const ArenaHeader) }
    }

    /// Base pointer of the mapping in this process.
    pub(crate) fn base(&self) -> NonNull<u8> {
        // SAFETY: a mapped region is never null.
        unsafe { NonNull::new_unchecked(self.shmem.as_ptr()) }
    }

    /// Resolve an arena-relative offset to a pointer in this process.
    #[inline]
    pub fn address_of(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset < self.header().capacity);
        // SAFETY: offset is within the mapping.
        unsafe { self.shmem.as_ptr().add(offset as usize) }
    }

    /// Convert a pointer inside the mapping back to its offset.
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> u64 {
        let base = self.shmem.as_ptr() as u64;
        let addr = ptr as u64;
        debug_assert!(addr >= base && addr - base < self.header().capacity);
        addr - base
    }

    /// Acquire the arena lock guarding the registry.
    pub fn lock(&self) -> ShmLockGuard<'_> {
        self.header().lock.lock()
    }

    /// View of the registry table. All registry calls require the guard
    /// returned by [`SharedArena::lock`].
    pub fn registry(&self) -> TreeRegistry<'_> {
        let header = self.header();
        TreeRegistry::new(self.base(), header.registry_off, header.registry_slots)
    }

    /// Allocate `bytes` (rounded up to 8-byte multiples, 8-byte aligned)
    /// and return the offset of the block.
    pub fn allocate(&self, bytes: usize) -> Result<u64, CacheError> {
        let want = align_up(bytes.max(1) as u64, ALLOC_ALIGN);

        // Best-fit reuse from the free list before growing the region.
        {
            let mut free = self.free_list.lock();
            let mut best: Option<usize> = None;
            for (i, b) in free.iter().enumerate() {
                if b.size >= want && best.map_or(true, |j| b.size < free[j].size) {
                    best = Some(i);
                }
            }
            if let Some(i) = best {
                let block = free.swap_remove(i);
                return Ok(block.off);
            }
        }

        let header = self.header();
        loop {
            let cur = header.bump.load(Ordering::Acquire);
            let data = align_up(cur + SIZE_WORD, ALLOC_ALIGN);
            let end = data + want;
            if end > header.capacity {
                return Err(CacheError::ArenaCapacityExceeded {
                    requested: bytes,
                    remaining: header.capacity.saturating_sub(cur) as usize,
                });
            }
            if header
                .bump
                .compare_exchange(cur, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: [data - 8, data + want) was just reserved.
                unsafe {
                    std::ptr::write(self.address_of(data - SIZE_WORD) as *mut u64, want);
                }
                return Ok(data);
            }
        }
    }

    /// Return a block to the free list. The block size is recovered from
    /// the size word in front of it.
    pub fn deallocate(&self, offset: u64) {
        // SAFETY: every offset handed out by `allocate` has its size stored
        // in the word before it.
        let size = unsafe { std::ptr::read(self.address_of(offset - SIZE_WORD) as *const u64) };
        self.free_list.lock().push(FreeBlock { off: offset, size });
    }

    /// Allocate and move `value` into the arena, returning its offset.
    pub fn construct<T>(&self, value: T) -> Result<u64, CacheError> {
        debug_assert!(align_of::<T>() as u64 <= ALLOC_ALIGN);
        let off = self.allocate(size_of::<T>())?;
        // SAFETY: the block is sized and aligned for T and owned by us.
        unsafe {
            std::ptr::write(self.address_of(off) as *mut T, value);
        }
        Ok(off)
    }

    /// Drop the `T` at `offset` and free its block.
    pub fn destroy<T>(&self, offset: u64) {
        // SAFETY: offset came from `construct::<T>` and is dropped once.
        unsafe {
            std::ptr::drop_in_place(self.address_of(offset) as *mut T);
        }
        self.deallocate(offset);
    }

    /// Total region size in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.header().capacity
    }

    /// High-water mark of the bump allocator. Freed-and-reused blocks are
    /// not subtracted; this is a monotonic usage indicator.
    pub fn used_bytes(&self) -> u64 {
        self.header().bump.load(Ordering::Acquire)
    }
}
