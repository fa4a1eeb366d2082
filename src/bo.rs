//! Buffer object resource types
//!
//! A [`Bo`] is a thin handle (device back-reference plus a kernel GEM
//! handle); the actual state lives in [`super::device::Device`]'s handle
//! table, guarded by the device's table lock. This mirrors the source
//! library's own design, where a BO's storage outlives any single client
//! reference to it (the reuse cache keeps it alive after the last `unref`).

use {
    crate::{device::Device, error::DriverError},
    bitflags::bitflags,
    derive_builder::{Builder, UninitializedFieldError},
    log::trace,
    std::{
        fmt::{Debug, Formatter},
        sync::Arc,
    },
};

bitflags! {
    /// Flags accepted by `GEM_CREATE` and passed through `set_flags`.
    #[derive(Default)]
    pub struct BoFlags: u32 {
        /// The buffer should be allocated from tiled memory.
        const TILED = 1 << 0;
        /// The buffer should be allocated from bottom-up memory (rare).
        const BOTTOM_UP = 1 << 1;
    }
}

/// Tiling mode applied to a [`Bo`], passed through verbatim to the kernel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BoTiling {
    pub mode: u32,
    pub value: u32,
}

/// Information used to create a [`Bo`] instance.
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "BoInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct BoInfo {
    /// Size in bytes of the buffer to be created. Must be non-zero.
    pub size: u64,

    /// Creation-time flags; see [`BoFlags`].
    #[builder(default)]
    pub flags: u32,
}

impl BoInfo {
    /// Specifies a buffer with the given `size` and no special flags.
    #[inline(always)]
    pub const fn new(size: u64) -> BoInfo {
        BoInfo { size, flags: 0 }
    }

    /// Converts a `BoInfo` into a `BoInfoBuilder`.
    #[inline(always)]
    pub fn to_builder(self) -> BoInfoBuilder {
        BoInfoBuilder {
            size: Some(self.size),
            flags: Some(self.flags),
        }
    }
}

impl BoInfoBuilder {
    /// Builds a new `BoInfo`.
    ///
    /// # Panics
    ///
    /// Panics if `size` was not set, or was set to zero.
    #[inline(always)]
    pub fn build(self) -> BoInfo {
        let res = match self.fallible_build() {
            Err(BoInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        };

        assert_ne!(res.size, 0, "Size must be non-zero");

        res
    }
}

impl From<BoInfoBuilder> for BoInfo {
    fn from(info: BoInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct BoInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for BoInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

/// Smart handle to a buffer object backed by a kernel GEM handle.
///
/// Cloning a `Bo` bumps the shared refcount held in the owning
/// [`Device`]'s handle table; dropping the last clone releases it, which
/// may return it to the device's reuse cache instead of truly freeing it
/// (see [`super::cache`]).
///
/// ## `Deref`-free by design
///
/// Unlike [`super::device::Device`], `Bo` does not `Deref` to anything: a
/// GEM handle is just a `u32` and exposing it directly would invite
/// accidental bypass of the refcounting above. Use [`Bo::handle`].
pub struct Bo {
    pub(crate) device: Arc<Device>,
    pub(crate) handle: u32,
}

impl Bo {
    /// Creates a new buffer object on the given device.
    ///
    /// Tries the device's reuse cache first (§ [`super::cache`]); on a
    /// cache miss, issues `GEM_CREATE` and inserts a fresh entry into the
    /// handle table.
    pub fn create(device: &Arc<Device>, info: impl Into<BoInfo>) -> Result<Self, DriverError> {
        let info = info.into();

        trace!("create: {:?}", info);

        if info.size == 0 {
            return Err(DriverError::Invalid);
        }

        BoFlags::from_bits(info.flags).ok_or(DriverError::Invalid)?;

        let handle = Device::bo_alloc(device, info.size, info.flags)?;

        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    /// Wraps an existing kernel GEM `handle`, deduplicating against the
    /// device's handle table if an entry for it already exists.
    pub fn wrap_handle(
        device: &Arc<Device>,
        handle: u32,
        flags: u32,
        size: u64,
    ) -> Result<Self, DriverError> {
        Device::bo_wrap_handle(device, handle, flags, size)?;

        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    /// Returns the raw kernel GEM handle. Valid only within this device's FD.
    #[inline(always)]
    pub fn handle(this: &Self) -> u32 {
        this.handle
    }

    /// Returns the buffer's size, in bytes.
    pub fn size(this: &Self) -> u64 {
        Device::bo_size(&this.device, this.handle)
    }

    /// Maps the buffer into this process, returning a pointer valid until
    /// the matching [`Bo::unmap`].
    ///
    /// Multiple calls increment an internal mmap refcount and return the
    /// same pointer; see invariant 2 in the testable-properties list.
    pub fn map(this: &Self) -> Result<*mut u8, DriverError> {
        Device::bo_map(&this.device, this.handle)
    }

    /// Decrements the mmap refcount; on reaching zero the mapping is moved
    /// into the device's timed mmap cache rather than unmapped immediately.
    pub fn unmap(this: &Self) {
        Device::bo_unmap(&this.device, this.handle);
    }

    /// Reads back the buffer's current flags.
    pub fn get_flags(this: &Self) -> Result<u32, DriverError> {
        Device::bo_get_flags(&this.device, this.handle)
    }

    /// Sets the buffer's flags and marks the custom-flags bit so the reuse
    /// path knows to reapply them on the next allocation from cache.
    pub fn set_flags(this: &Self, flags: u32) -> Result<(), DriverError> {
        Device::bo_set_flags(&this.device, this.handle, flags)
    }

    /// Reads back the buffer's current tiling configuration.
    pub fn get_tiling(this: &Self) -> Result<BoTiling, DriverError> {
        Device::bo_get_tiling(&this.device, this.handle)
    }

    /// Sets the buffer's tiling configuration and marks the custom-tiling
    /// bit so the reuse path knows to reset it on the next allocation from
    /// cache.
    pub fn set_tiling(this: &Self, tiling: BoTiling) -> Result<(), DriverError> {
        Device::bo_set_tiling(&this.device, this.handle, tiling)
    }

    /// Returns this buffer's global name, flinking it on first use.
    pub fn get_name(this: &Self) -> Result<u32, DriverError> {
        Device::bo_get_name(&this.device, this.handle)
    }

    /// Looks up (or opens) a buffer object by its global `name`.
    pub fn from_name(device: &Arc<Device>, name: u32, flags: u32) -> Result<Self, DriverError> {
        let handle = Device::bo_from_name(device, name, flags)?;

        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    /// Marks this buffer ineligible for the reuse cache. Used before
    /// exporting via dma-buf or flink, where a rounded-up cached size
    /// would become externally visible.
    pub fn forbid_caching(this: &Self) {
        Device::bo_forbid_caching(&this.device, this.handle);
    }

    /// Exports this buffer as a dma-buf file descriptor. The buffer is
    /// marked ineligible for the reuse cache as a side effect (a shared FD
    /// would make size rounding visible to the importer).
    pub fn to_dmabuf(this: &Self) -> Result<std::os::unix::io::RawFd, DriverError> {
        Device::bo_to_dmabuf(&this.device, this.handle)
    }

    /// Imports a dma-buf file descriptor, deduplicating against an existing
    /// wrapper for the same underlying object via the handle table.
    pub fn from_dmabuf(
        device: &Arc<Device>,
        fd: std::os::unix::io::RawFd,
        flags: u32,
    ) -> Result<Self, DriverError> {
        let handle = Device::bo_from_dmabuf(device, fd, flags)?;

        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }
}

impl Clone for Bo {
    fn clone(&self) -> Self {
        Device::bo_ref(&self.device, self.handle);

        Self {
            device: Arc::clone(&self.device),
            handle: self.handle,
        }
    }
}

impl Debug for Bo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bo").field("handle", &self.handle).finish()
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        Device::bo_unref(&self.device, self.handle);
    }
}

/// Per-BO state owned by the device's handle table. Never exposed directly;
/// callers interact with it exclusively through [`Bo`] and [`Device`]'s
/// `bo_*` associated functions, which take the table lock.
#[derive(Debug)]
pub(crate) struct BoState {
    pub ref_count: u32,
    pub mmap_ref: u32,
    pub size: u64,
    pub flags: u32,
    pub tiling: BoTiling,
    pub name: Option<u32>,
    pub map: Option<MappedRegion>,
    pub reuse: bool,
    pub custom_flags: bool,
    pub custom_tiling: bool,

    /// Set by [`super::cache`] while this BO sits in a reuse bucket, so
    /// `cache_cleanup` can evict it once it has aged past its retention
    /// window.
    pub free_time: Option<u64>,

    /// Set by [`super::cache`] while this BO's mapping sits in the mmap
    /// cache awaiting reuse or eviction.
    pub unmap_time: Option<u64>,

    /// The mapping stashed by `cache_unmap`, distinct from `map` (which is
    /// `None` while a mapping lives here).
    pub map_cached: Option<MappedRegion>,
}

impl BoState {
    pub fn new(size: u64, flags: u32) -> Self {
        Self {
            ref_count: 1,
            mmap_ref: 0,
            size,
            flags,
            tiling: BoTiling::default(),
            name: None,
            map: None,
            reuse: true,
            custom_flags: false,
            custom_tiling: false,
            free_time: None,
            unmap_time: None,
            map_cached: None,
        }
    }
}

/// A live CPU mapping of a [`Bo`]. `ptr` is the address handed back to
/// clients (the mmap base advanced by the kernel's reported offset); `base`
/// and `len` are the arguments `munmap` must be called with — `ptr` itself
/// is not a valid `munmap` address once the offset has been folded in.
#[derive(Debug)]
pub(crate) struct MappedRegion {
    pub ptr: *mut u8,
    pub base: *mut u8,
    pub len: usize,
}

// SAFETY: the region is only ever touched while holding the device's table
// lock (or briefly during the unmap ioctl before the state is dropped).
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bo_info_builder_defaults_flags() {
        let info = BoInfo::new(4096).to_builder().build();
        assert_eq!(info.size, 4096);
        assert_eq!(info.flags, 0);
    }

    #[test]
    #[should_panic]
    fn bo_info_builder_rejects_zero_size() {
        BoInfoBuilder::default().size(0).build();
    }

    #[test]
    fn bo_flags_roundtrip() {
        let flags = BoFlags::TILED | BoFlags::BOTTOM_UP;
        assert!(flags.contains(BoFlags::TILED));
        assert_eq!(flags.bits(), 0b11);
    }

    #[test]
    fn bo_info_builder_does_not_itself_validate_flags() {
        // BoInfo.flags is the raw wire type, not BoFlags itself; it is
        // `Bo::create`, not the builder, that rejects a flags value outside
        // `BoFlags`'s recognized bits.
        let info = BoInfo::new(1).to_builder().flags(0xdead_beef).build();
        assert_eq!(info.flags, 0xdead_beef);
    }

    #[test]
    fn create_rejects_unrecognized_flags() {
        let device = Arc::new(Device::wrap(-1, false));
        let info = BoInfo::new(4096).to_builder().flags(0xdead_beef).build();

        assert!(matches!(Bo::create(&device, info), Err(DriverError::Invalid)));
    }
}
