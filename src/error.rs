use std::{
    error::Error,
    fmt::{Display, Formatter},
};

/// Describes the general category of all driver failure cases.
///
/// In the event of a failure you should follow the errno reported by the kernel
/// back to the responsible `tegra_drm` ioctl; the driver source in the upstream
/// Linux tree documents the conditions under which each code is returned.
#[derive(Debug)]
pub enum DriverError {
    /// The input data, or referenced data, is not valid for the current state.
    ///
    /// Raised for malformed relocation tables, waitchk entries that reference a
    /// command buffer not present in the job, or a pushbuf handed to a channel
    /// it was not created against.
    Invalid,

    /// The kernel reports no more GPU memory is available to satisfy the request.
    OutOfMemory,

    /// The requested feature, or input configuration, is not supported for the
    /// current state (e.g. dma-buf export on a BO created without the
    /// appropriate flags).
    NotSupported,

    /// An ioctl to the `tegra_drm` character device failed; carries the raw
    /// `errno` value returned by the kernel.
    IoctlFailed(i32),

    /// A syncpoint wait exceeded its timeout before the threshold was reached.
    TimedOut,

    /// Data read back from the kernel (a syncpoint value, a relocated word) is
    /// internally inconsistent with what this library expects.
    Corruption,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoctlFailed(errno) => write!(f, "ioctl failed: errno {}", errno),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl Error for DriverError {}

impl DriverError {
    /// Builds a [`DriverError::IoctlFailed`] from the current value of `errno`,
    /// as left behind by a failing `libc`/`nix` call.
    pub(crate) fn from_errno() -> Self {
        Self::IoctlFailed(nix_errno_or_raw())
    }
}

#[cfg(target_os = "linux")]
fn nix_errno_or_raw() -> i32 {
    nix::errno::Errno::last() as i32
}

#[cfg(not(target_os = "linux"))]
fn nix_errno_or_raw() -> i32 {
    unsafe { *libc::__errno_location() }
}
