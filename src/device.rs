//! Logical device resource types

use {
    crate::{
        bo::{BoState, BoTiling, MappedRegion},
        cache::{MmapCache, ReuseCache},
        channel::Channel,
        config::Config,
        error::DriverError,
        ioctl,
    },
    log::{trace, warn},
    nix::sys::mman::{MapFlags, ProtFlags},
    std::{
        collections::HashMap,
        fmt::{Debug, Formatter},
        os::unix::io::RawFd,
        time::{SystemTime, UNIX_EPOCH},
    },
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

/// Opaque handle to a `tegra_drm` device connection.
///
/// Owns the driver file descriptor, the handle and name deduplication
/// tables, and both caches from [`super::cache`]. All mutation of that
/// shared state happens under a single mutex (`table_lock` in the source
/// library); this is a per-`Device` lock, not process-global state.
pub struct Device {
    fd: RawFd,
    owns_fd: bool,
    pub(crate) config: Config,
    inner: Mutex<DeviceInner>,
}

struct DeviceInner {
    handle_table: HashMap<u32, BoState>,
    name_table: HashMap<u32, u32>,
    cache: ReuseCache,
    mmap_cache: MmapCache,
}

impl Device {
    /// Opens a device connection on `fd`, verifying the driver backing it
    /// reports its name as `"tegra"` via the generic version ioctl.
    ///
    /// The returned `Device` does not own `fd`; it will not be closed when
    /// the `Device` is dropped. Use [`Device::wrap`] to take ownership.
    pub fn new(fd: RawFd) -> Result<Self, DriverError> {
        let name = Self::driver_name(fd)?;

        if name != "tegra" {
            warn!("driver is not tegra_drm: {name}");

            return Err(DriverError::NotSupported);
        }

        Ok(Self::wrap(fd, false))
    }

    /// Wraps an already-open driver `fd` without checking its driver name.
    /// `owns` controls whether [`Device::close`] (or `Drop`) closes `fd`.
    pub fn wrap(fd: RawFd, owns: bool) -> Self {
        Self {
            fd,
            owns_fd: owns,
            config: Config::from_env(),
            inner: Mutex::new(DeviceInner {
                handle_table: HashMap::new(),
                name_table: HashMap::new(),
                cache: ReuseCache::new(false),
                mmap_cache: MmapCache::new(),
            }),
        }
    }

    fn driver_name(fd: RawFd) -> Result<String, DriverError> {
        let mut name_buf = vec![0i8; 64];
        let mut version = ioctl::Version {
            name_len: name_buf.len(),
            name: name_buf.as_mut_ptr(),
            ..Default::default()
        };

        unsafe { ioctl::version(fd, &mut version) }.map_err(|_| DriverError::from_errno())?;

        let len = version.name_len.min(name_buf.len());
        let bytes: Vec<u8> = name_buf[..len].iter().map(|&c| c as u8).collect();

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Opens a [`Channel`] for the given client class on this device.
    pub fn open_channel(self: &std::sync::Arc<Self>, class: u32) -> Result<Channel, DriverError> {
        Channel::open(self, class)
    }

    /// Drains the reuse cache (evicting everything regardless of age),
    /// unmaps any mappings left in the mmap cache, destroys both
    /// deduplication tables, and closes the FD iff this `Device` owns it.
    ///
    /// This is also exactly what happens when the last `Arc<Device>` clone
    /// is dropped without an explicit `close()` call — `impl Drop for
    /// Device` runs the same teardown, since most callers only ever reach a
    /// `Device` through an `Arc` (every `Bo`/`Channel`/`Job` constructor
    /// requires one) and reclaiming a bare `Device` to call this by value
    /// would require every other `Arc` clone to have already been dropped.
    /// `close()` exists for callers that want teardown errors or timing
    /// under their own control rather than implicit drop glue.
    ///
    /// Not safe to call concurrently with any other operation on the same
    /// device; callers must ensure exclusive access (matching the source
    /// library, which documents `drm_tegra_close` as non-reentrant).
    pub fn close(self) {
        self.teardown();

        // `teardown` already drained both tables and closed the fd above;
        // skip `Drop::drop`'s matching teardown so an owned fd isn't closed
        // twice (once here, once by drop glue on the way out).
        std::mem::forget(self);
    }

    /// Drains the reuse cache, the mmap cache, and both deduplication
    /// tables, and closes the fd iff owned. Shared by [`Device::close`] and
    /// `impl Drop for Device` so dropping the last `Arc<Device>` tears down
    /// exactly as an explicit `close()` would.
    fn teardown(&self) {
        #[cfg(feature = "parking_lot")]
        let mut inner = self.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = self.inner.lock().unwrap();

        let stale_bos: Vec<u32> = inner.cache.cleanup(0, |_| 0);
        for handle in stale_bos {
            Self::destroy_bo_locked(&mut inner, self.fd, handle);
        }

        let stale_maps = inner.mmap_cache.drain_all();
        for handle in stale_maps {
            if let Some(state) = inner.handle_table.get_mut(&handle) {
                if let Some(region) = state.map_cached.take() {
                    unsafe {
                        let _ = nix::sys::mman::munmap(region.base as *mut _, region.len);
                    }
                }
            }
        }

        let handles: Vec<u32> = inner.handle_table.keys().copied().collect();
        for handle in handles {
            Self::destroy_bo_locked(&mut inner, self.fd, handle);
        }

        drop(inner);

        if self.owns_fd {
            trace!("closing owned fd {}", self.fd);

            unsafe {
                libc::close(self.fd);
            }
        }
    }

    fn now_seconds() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    // -- BO operations, called through `super::bo::Bo` -----------------

    pub(crate) fn bo_alloc(this: &std::sync::Arc<Self>, size: u64, flags: u32) -> Result<u32, DriverError> {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        if !this.config.debug_bo {
            let (handle, bucket_size) = inner.cache.alloc(size, |_| true);

            if let Some(handle) = handle {
                let now = Self::now_seconds();
                Self::reset_bo_locked(&mut inner, handle, flags, now)?;
                return Ok(handle);
            }

            drop(inner);
            return Self::bo_create_real(this, bucket_size, flags);
        }

        drop(inner);
        Self::bo_create_real(this, size, flags)
    }

    fn bo_create_real(this: &std::sync::Arc<Self>, size: u64, flags: u32) -> Result<u32, DriverError> {
        if this.config.debug_bo_front_guard {
            trace!("bo create: front guard page requested for size={size}, not reflected in the allocation itself");
        }

        if this.config.debug_bo_back_guard {
            trace!("bo create: back guard page requested for size={size}, not reflected in the allocation itself");
        }

        let mut args = ioctl::GemCreate {
            size,
            flags,
            handle: 0,
        };

        unsafe { ioctl::tegra_gem_create(this.fd, &mut args) }
            .map_err(|_| DriverError::from_errno())?;

        if this.config.debug_bo {
            trace!("bo create: handle={} size={size} flags={flags:#x}", args.handle);
        }

        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        inner
            .handle_table
            .insert(args.handle, BoState::new(size, flags));

        Ok(args.handle)
    }

    pub(crate) fn bo_wrap_handle(
        this: &std::sync::Arc<Self>,
        handle: u32,
        flags: u32,
        size: u64,
    ) -> Result<(), DriverError> {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        inner
            .handle_table
            .entry(handle)
            .or_insert_with(|| BoState::new(size, flags));

        Ok(())
    }

    pub(crate) fn bo_size(this: &std::sync::Arc<Self>, handle: u32) -> u64 {
        #[cfg(feature = "parking_lot")]
        let inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let inner = this.inner.lock().unwrap();

        inner.handle_table.get(&handle).map(|s| s.size).unwrap_or_default()
    }

    pub(crate) fn bo_ref(this: &std::sync::Arc<Self>, handle: u32) {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        if let Some(state) = inner.handle_table.get_mut(&handle) {
            state.ref_count += 1;
        }
    }

    pub(crate) fn bo_unref(this: &std::sync::Arc<Self>, handle: u32) {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        let (reuse, size) = match inner.handle_table.get_mut(&handle) {
            Some(state) => {
                state.ref_count = state.ref_count.saturating_sub(1);

                if state.ref_count > 0 {
                    return;
                }

                (state.reuse, state.size)
            }
            None => return,
        };

        if reuse {
            let now = Self::now_seconds();

            if let Some(state) = inner.handle_table.get_mut(&handle) {
                state.free_time = Some(now);
            }

            if inner.cache.free(handle, size) {
                let now = Self::now_seconds();
                let free_times: HashMap<u32, u64> = inner
                    .handle_table
                    .iter()
                    .filter_map(|(&h, s)| s.free_time.map(|t| (h, t)))
                    .collect();
                let stale = inner
                    .cache
                    .cleanup(now, |h| free_times.get(&h).copied().unwrap_or(0));

                for stale_handle in stale {
                    Self::destroy_bo_locked(&mut inner, this.fd, stale_handle);
                }

                return;
            }
        }

        Self::destroy_bo_locked(&mut inner, this.fd, handle);
    }

    /// Restores a cache-recycled BO's refcount to 1 and reapplies any
    /// caller-set flags/tiling. If the BO is still mapped (a client read
    /// pixels via `Bo::map` and dropped its last reference without calling
    /// `unmap`), the live mapping is pushed into the mmap cache exactly as
    /// `bo_unmap`'s last-unmap path does — not just detached into
    /// `map_cached`, but registered in `inner.mmap_cache` so a later
    /// `bo_map` of the reused handle finds it via the cache's fast path
    /// instead of re-issuing `GEM_MMAP`.
    fn reset_bo_locked(
        inner: &mut DeviceInner,
        handle: u32,
        flags: u32,
        now: u64,
    ) -> Result<(), DriverError> {
        let state = inner.handle_table.get_mut(&handle).ok_or(DriverError::Invalid)?;

        state.ref_count = 1;

        if let Some(region) = state.map.take() {
            state.map_cached = Some(region);
            state.mmap_ref = 0;
            state.unmap_time = Some(now);
            inner.mmap_cache.push(handle);
        }

        if state.custom_flags {
            state.flags = flags;
            state.custom_flags = false;
        }

        if state.custom_tiling {
            state.tiling = BoTiling::default();
            state.custom_tiling = false;
        }

        Ok(())
    }

    fn destroy_bo_locked(inner: &mut DeviceInner, fd: RawFd, handle: u32) {
        inner.cache.remove(handle);

        if let Some(mut state) = inner.handle_table.remove(&handle) {
            if let Some(name) = state.name {
                inner.name_table.remove(&name);
            }

            if let Some(region) = state.map.take() {
                unsafe {
                    let _ = nix::sys::mman::munmap(region.base as *mut _, region.len);
                }
            }

            if let Some(region) = state.map_cached.take() {
                unsafe {
                    let _ = nix::sys::mman::munmap(region.base as *mut _, region.len);
                }
            }
        }

        let mut args = ioctl::GemClose { handle, pad: 0 };
        let _ = unsafe { ioctl::gem_close(fd, &mut args) };
    }

    pub(crate) fn bo_map(this: &std::sync::Arc<Self>, handle: u32) -> Result<*mut u8, DriverError> {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        if inner.mmap_cache.take(handle) {
            if let Some(state) = inner.handle_table.get_mut(&handle) {
                if let Some(region) = state.map_cached.take() {
                    state.map = Some(region);
                }
            }
        }

        let size = inner
            .handle_table
            .get(&handle)
            .map(|s| s.size)
            .ok_or(DriverError::Invalid)?;

        if let Some(state) = inner.handle_table.get_mut(&handle) {
            if let Some(region) = &state.map {
                state.mmap_ref += 1;
                return Ok(region.ptr);
            }
        }

        let mut args = ioctl::GemMmap { handle, offset: 0 };
        unsafe { ioctl::tegra_gem_mmap(this.fd, &mut args) }
            .map_err(|_| DriverError::from_errno())?;

        let len = (args.offset as u64 + size) as usize;

        let base = unsafe {
            nix::sys::mman::mmap(
                None,
                std::num::NonZeroUsize::new(len).ok_or(DriverError::Invalid)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                this.fd,
                0,
            )
        }
        .map_err(|_| DriverError::from_errno())? as *mut u8;

        let ptr = unsafe { base.add(args.offset as usize) };

        if let Some(state) = inner.handle_table.get_mut(&handle) {
            state.map = Some(MappedRegion { ptr, base, len });
            state.mmap_ref = 1;
        }

        Ok(ptr)
    }

    pub(crate) fn bo_unmap(this: &std::sync::Arc<Self>, handle: u32) {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        let now = Self::now_seconds();

        if let Some(state) = inner.handle_table.get_mut(&handle) {
            if state.mmap_ref == 0 {
                return;
            }

            state.mmap_ref -= 1;

            if state.mmap_ref == 0 {
                if let Some(region) = state.map.take() {
                    state.map_cached = Some(region);
                    state.unmap_time = Some(now);
                    inner.mmap_cache.push(handle);
                }
            }
        }

        let unmap_times: HashMap<u32, u64> = inner
            .handle_table
            .iter()
            .filter_map(|(&h, s)| s.unmap_time.map(|t| (h, t)))
            .collect();
        let evicted = inner
            .mmap_cache
            .cleanup(now, |h| unmap_times.get(&h).copied().unwrap_or(now));

        for stale in evicted {
            if let Some(state) = inner.handle_table.get_mut(&stale) {
                if let Some(region) = state.map_cached.take() {
                    unsafe {
                        let _ = nix::sys::mman::munmap(region.base as *mut _, region.len);
                    }
                }
            }
        }
    }

    pub(crate) fn bo_get_flags(this: &std::sync::Arc<Self>, handle: u32) -> Result<u32, DriverError> {
        #[cfg(feature = "parking_lot")]
        let inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let inner = this.inner.lock().unwrap();

        inner
            .handle_table
            .get(&handle)
            .map(|s| s.flags)
            .ok_or(DriverError::Invalid)
    }

    pub(crate) fn bo_set_flags(
        this: &std::sync::Arc<Self>,
        handle: u32,
        flags: u32,
    ) -> Result<(), DriverError> {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        let state = inner.handle_table.get_mut(&handle).ok_or(DriverError::Invalid)?;
        state.flags = flags;
        state.custom_flags = true;

        Ok(())
    }

    pub(crate) fn bo_get_tiling(
        this: &std::sync::Arc<Self>,
        handle: u32,
    ) -> Result<BoTiling, DriverError> {
        #[cfg(feature = "parking_lot")]
        let inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let inner = this.inner.lock().unwrap();

        inner
            .handle_table
            .get(&handle)
            .map(|s| s.tiling)
            .ok_or(DriverError::Invalid)
    }

    pub(crate) fn bo_set_tiling(
        this: &std::sync::Arc<Self>,
        handle: u32,
        tiling: BoTiling,
    ) -> Result<(), DriverError> {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        let state = inner.handle_table.get_mut(&handle).ok_or(DriverError::Invalid)?;
        state.tiling = tiling;
        state.custom_tiling = true;

        Ok(())
    }

    pub(crate) fn bo_get_name(this: &std::sync::Arc<Self>, handle: u32) -> Result<u32, DriverError> {
        {
            #[cfg(feature = "parking_lot")]
            let inner = this.inner.lock();

            #[cfg(not(feature = "parking_lot"))]
            let inner = this.inner.lock().unwrap();

            if let Some(name) = inner.handle_table.get(&handle).and_then(|s| s.name) {
                return Ok(name);
            }
        }

        let mut args = ioctl::GemFlink { handle, name: 0 };
        unsafe { ioctl::gem_flink(this.fd, &mut args) }.map_err(|_| DriverError::from_errno())?;

        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        if let Some(state) = inner.handle_table.get_mut(&handle) {
            state.name = Some(args.name);
            state.reuse = false;
        }

        inner.name_table.insert(args.name, handle);

        Ok(args.name)
    }

    pub(crate) fn bo_from_name(
        this: &std::sync::Arc<Self>,
        name: u32,
        flags: u32,
    ) -> Result<u32, DriverError> {
        {
            #[cfg(feature = "parking_lot")]
            let mut inner = this.inner.lock();

            #[cfg(not(feature = "parking_lot"))]
            let mut inner = this.inner.lock().unwrap();

            if let Some(&handle) = inner.name_table.get(&name) {
                inner.cache.remove(handle);

                if let Some(state) = inner.handle_table.get_mut(&handle) {
                    state.ref_count += 1;
                }

                return Ok(handle);
            }
        }

        let mut args = ioctl::GemOpen {
            name,
            handle: 0,
            size: 0,
        };

        unsafe { ioctl::gem_open(this.fd, &mut args) }.map_err(|_| DriverError::from_errno())?;

        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        if let Some(state) = inner.handle_table.get_mut(&args.handle) {
            state.ref_count += 1;
        } else {
            let mut state = BoState::new(args.size, flags);
            state.name = Some(name);
            state.reuse = false;
            inner.handle_table.insert(args.handle, state);
        }

        inner.name_table.insert(name, args.handle);

        Ok(args.handle)
    }

    pub(crate) fn bo_forbid_caching(this: &std::sync::Arc<Self>, handle: u32) {
        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        if let Some(state) = inner.handle_table.get_mut(&handle) {
            state.reuse = false;
        }
    }

    /// Exports `handle` as a dma-buf FD and marks it ineligible for the reuse
    /// cache, since its (possibly rounded-up) size becomes visible to
    /// whatever process imports the FD.
    pub(crate) fn bo_to_dmabuf(this: &std::sync::Arc<Self>, handle: u32) -> Result<RawFd, DriverError> {
        Self::bo_forbid_caching(this, handle);

        let mut args = ioctl::PrimeHandleToFd {
            handle,
            flags: ioctl::DRM_CLOEXEC,
            fd: -1,
        };

        unsafe { ioctl::prime_handle_to_fd(this.fd, &mut args) }
            .map_err(|_| DriverError::from_errno())?;

        Ok(args.fd)
    }

    /// Imports a dma-buf `fd`, deduplicating against the handle table by the
    /// handle the kernel hands back (two imports of the same underlying
    /// object return the same kernel handle).
    pub(crate) fn bo_from_dmabuf(
        this: &std::sync::Arc<Self>,
        fd: RawFd,
        flags: u32,
    ) -> Result<u32, DriverError> {
        let mut args = ioctl::PrimeFdToHandle { fd, handle: 0 };
        unsafe { ioctl::prime_fd_to_handle(this.fd, &mut args) }
            .map_err(|_| DriverError::from_errno())?;

        #[cfg(feature = "parking_lot")]
        let mut inner = this.inner.lock();

        #[cfg(not(feature = "parking_lot"))]
        let mut inner = this.inner.lock().unwrap();

        if let Some(state) = inner.handle_table.get_mut(&args.handle) {
            state.ref_count += 1;
        } else {
            use nix::unistd::{lseek, Whence};

            let size = lseek(fd, 0, Whence::SeekEnd).unwrap_or(0).max(0) as u64;
            let mut state = BoState::new(size, flags);
            state.reuse = false;
            inner.handle_table.insert(args.handle, state);
        }

        Ok(args.handle)
    }

    /// The raw driver file descriptor, for channel/job/fence ioctls.
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("fd", &self.fd).finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Reached whenever the last `Arc<Device>` clone goes out of scope
        // without an explicit `close()` call; see `close()`'s doc comment.
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_does_not_require_a_live_fd_to_construct() {
        // Device::wrap never touches `fd` until an operation is issued, so
        // constructing one with a placeholder value is safe for unit tests
        // that only exercise the cache/table bookkeeping paths.
        let device = Device::wrap(-1, false);
        assert!(!device.owns_fd);
        std::mem::forget(device);
    }
}
