//! Submission completion handles
//!
//! A [`Fence`] names a syncpoint id and the value it will hold once the
//! submission that produced it has finished executing. Waiting on a fence
//! blocks the calling thread in the kernel via `SYNCPT_WAIT`; it does not
//! poll.

use {crate::{device::Device, error::DriverError, ioctl}, std::sync::Arc};

/// Identifies one point in a syncpoint's monotonic counter sequence,
/// returned by [`crate::job::Job::submit`].
///
/// Waiting on the same `Fence` more than once is safe — `SYNCPT_WAIT`
/// returns immediately once the threshold has already been reached.
pub struct Fence {
    pub(crate) device: Arc<Device>,
    pub(crate) syncpt_id: u32,
    pub(crate) value: u32,
}

impl Fence {
    /// The syncpoint id this fence targets.
    pub fn syncpt_id(&self) -> u32 {
        self.syncpt_id
    }

    /// The threshold value the syncpoint must reach for this fence to be
    /// considered signaled.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Blocks until the syncpoint reaches this fence's value, or until
    /// `timeout_ms` elapses. Pass `-1` to wait indefinitely.
    ///
    /// Maps `ETIMEDOUT`/`EAGAIN` to [`DriverError::TimedOut`]; any other
    /// ioctl failure maps to [`DriverError::IoctlFailed`].
    pub fn wait(&self, timeout_ms: i64) -> Result<(), DriverError> {
        let timeout = if timeout_ms < 0 {
            ioctl::DRM_TEGRA_NO_TIMEOUT
        } else {
            timeout_ms as u32
        };

        let mut args = ioctl::SyncptWait {
            id: self.syncpt_id,
            thresh: self.value,
            timeout,
            value: 0,
        };

        unsafe { ioctl::tegra_syncpt_wait(self.device.fd(), &mut args) }.map_err(|_| {
            match nix::errno::Errno::last() {
                nix::errno::Errno::ETIMEDOUT | nix::errno::Errno::EAGAIN => DriverError::TimedOut,
                _ => DriverError::from_errno(),
            }
        })?;

        Ok(())
    }

    /// Consumes the fence. Equivalent to dropping it; provided for parity
    /// with the source library's explicit `drm_tegra_fence_free`.
    pub fn free(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_timeout_maps_to_wait_forever_sentinel() {
        let timeout_ms: i64 = -1;
        let timeout = if timeout_ms < 0 {
            ioctl::DRM_TEGRA_NO_TIMEOUT
        } else {
            timeout_ms as u32
        };
        assert_eq!(timeout, ioctl::DRM_TEGRA_NO_TIMEOUT);
    }
}
