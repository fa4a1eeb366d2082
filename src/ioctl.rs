//! Wire-level structures and ioctl command numbers for the `tegra_drm` kernel
//! driver. Every struct here is `#[repr(C)]` and must match the kernel ABI
//! bit-for-bit; nothing in this module performs dispatch decisions, it only
//! describes the bytes that cross the `ioctl(2)` boundary.

#![allow(non_camel_case_types)]

use std::os::raw::c_int;

/// Base DRM ioctl type character (`'d'` in the kernel's `<drm/drm.h>`).
const DRM_IOCTL_BASE: u8 = b'd';

/// First command code reserved for driver-specific (non-generic) ioctls.
const DRM_COMMAND_BASE: u8 = 0x40;

pub const DRM_TEGRA_GEM_CREATE: u8 = 0x00;
pub const DRM_TEGRA_GEM_MMAP: u8 = 0x01;
pub const DRM_TEGRA_SYNCPT_READ: u8 = 0x02;
pub const DRM_TEGRA_SYNCPT_INCR: u8 = 0x03;
pub const DRM_TEGRA_SYNCPT_WAIT: u8 = 0x04;
pub const DRM_TEGRA_OPEN_CHANNEL: u8 = 0x05;
pub const DRM_TEGRA_CLOSE_CHANNEL: u8 = 0x06;
pub const DRM_TEGRA_GET_SYNCPT: u8 = 0x07;
pub const DRM_TEGRA_SUBMIT: u8 = 0x08;
pub const DRM_TEGRA_GET_SYNCPT_BASE: u8 = 0x09;

/// Sentinel passed in `tegra_drm_syncpt_wait.timeout` meaning "wait forever".
pub const DRM_TEGRA_NO_TIMEOUT: u32 = 0xffff_ffff;

/// Fixed-point client-class identifiers accepted by `OPEN_CHANNEL`.
pub mod class {
    pub const HOST1X: u32 = 0x01;
    pub const GR2D: u32 = 0x51;
    pub const GR2D_SB: u32 = 0x52;
    pub const GR3D: u32 = 0x60;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemCreate {
    pub size: u64,
    pub flags: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemMmap {
    pub handle: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncptRead {
    pub id: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncptIncr {
    pub id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncptWait {
    pub id: u32,
    pub thresh: u32,
    pub timeout: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenChannel {
    pub client: u32,
    pub pad: u32,
    pub context: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CloseChannel {
    pub context: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GetSyncpt {
    pub context: u64,
    pub index: u32,
    pub id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GetSyncptBase {
    pub context: u64,
    pub index: u32,
    pub base_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncptIncrRecord {
    pub id: u32,
    pub incrs: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Cmdbuf {
    pub handle: u32,
    pub offset: u32,
    pub words: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RelocTarget {
    pub handle: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Reloc {
    pub cmdbuf: RelocTarget,
    pub target: RelocTarget,
    pub shift: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Waitchk {
    pub handle: u32,
    pub offset: u32,
    pub syncpt: u32,
    pub thresh: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Submit {
    pub context: u64,
    pub num_syncpts: u32,
    pub num_cmdbufs: u32,
    pub num_relocs: u32,
    pub num_waitchks: u32,
    pub waitchk_mask: u32,
    pub timeout: u32,
    pub pad: u32,
    pub syncpts: u64,
    pub cmdbufs: u64,
    pub relocs: u64,
    pub waitchks: u64,
    /// Return value: the post-submission syncpoint fence value.
    pub fence: u32,
    pub reserved: [u32; 5],
}

/// Generic (non-driver-specific) GEM ioctls shared across every DRM driver.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemClose {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemFlink {
    pub handle: u32,
    pub name: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GemOpen {
    pub name: u32,
    pub handle: u32,
    pub size: u64,
}

/// `DRM_IOCTL_PRIME_HANDLE_TO_FD`: exports a GEM handle as a dma-buf FD.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PrimeHandleToFd {
    pub handle: u32,
    pub flags: u32,
    pub fd: c_int,
}

/// `DRM_IOCTL_PRIME_FD_TO_HANDLE`: imports a dma-buf FD as a GEM handle.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PrimeFdToHandle {
    pub fd: c_int,
    pub handle: u32,
}

/// `DRM_CLOEXEC`, passed in `PrimeHandleToFd::flags` so exported dma-buf FDs
/// do not leak across `exec`.
pub const DRM_CLOEXEC: u32 = 0x0001_0000;

/// `DRM_IOCTL_VERSION`'s payload; only `name`/`name_len` are consulted by
/// [`crate::device::Device::new`].
#[repr(C)]
#[derive(Debug, Default)]
pub struct Version {
    pub version_major: c_int,
    pub version_minor: c_int,
    pub version_patchlevel: c_int,
    pub name_len: usize,
    pub name: *mut i8,
    pub date_len: usize,
    pub date: *mut i8,
    pub desc_len: usize,
    pub desc: *mut i8,
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    nix::ioctl_readwrite!(version, DRM_IOCTL_BASE, 0x00, Version);
    nix::ioctl_readwrite!(gem_close, DRM_IOCTL_BASE, 0x09, GemClose);
    nix::ioctl_readwrite!(gem_flink, DRM_IOCTL_BASE, 0x0a, GemFlink);
    nix::ioctl_readwrite!(gem_open, DRM_IOCTL_BASE, 0x0b, GemOpen);
    nix::ioctl_readwrite!(prime_handle_to_fd, DRM_IOCTL_BASE, 0x2d, PrimeHandleToFd);
    nix::ioctl_readwrite!(prime_fd_to_handle, DRM_IOCTL_BASE, 0x2e, PrimeFdToHandle);

    nix::ioctl_readwrite!(
        tegra_gem_create,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_GEM_CREATE,
        GemCreate
    );
    nix::ioctl_readwrite!(
        tegra_gem_mmap,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_GEM_MMAP,
        GemMmap
    );
    nix::ioctl_readwrite!(
        tegra_syncpt_read,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_SYNCPT_READ,
        SyncptRead
    );
    nix::ioctl_readwrite!(
        tegra_syncpt_incr,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_SYNCPT_INCR,
        SyncptIncr
    );
    nix::ioctl_readwrite!(
        tegra_syncpt_wait,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_SYNCPT_WAIT,
        SyncptWait
    );
    nix::ioctl_readwrite!(
        tegra_open_channel,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_OPEN_CHANNEL,
        OpenChannel
    );
    nix::ioctl_readwrite!(
        tegra_close_channel,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_CLOSE_CHANNEL,
        CloseChannel
    );
    nix::ioctl_readwrite!(
        tegra_get_syncpt,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_GET_SYNCPT,
        GetSyncpt
    );
    nix::ioctl_readwrite!(
        tegra_submit,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_SUBMIT,
        Submit
    );
    nix::ioctl_readwrite!(
        tegra_get_syncpt_base,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + DRM_TEGRA_GET_SYNCPT_BASE,
        GetSyncptBase
    );
}

#[cfg(target_os = "linux")]
pub use linux::*;
