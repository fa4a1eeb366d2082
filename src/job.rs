//! Job resource types
//!
//! A [`Job`] aggregates the gathers, relocations, and syncpoint-increment
//! count produced by one or more [`crate::pushbuf::Pushbuf`]s into a single
//! `SUBMIT` ioctl. Per the unified model this crate settles on (§9 of the
//! design notes), a job carries exactly one syncpoint — the channel's
//! first — rather than the syncpoint-set/per-pushbuf-relocation shape of
//! the source library's earlier drafts.

use {
    crate::{bo::Bo, channel::Channel, error::DriverError, fence::Fence, ioctl},
    log::trace,
    std::sync::Arc,
};

/// Fixed driver-side submission timeout, matching the source library's
/// policy choice (see design note on submission timeout).
const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Collection of pushbuf gathers, relocations, and syncpoint increments
/// produced against one [`Channel`], ready to hand to the kernel in one
/// `SUBMIT` ioctl.
///
/// `Job` does not itself own the [`crate::pushbuf::Pushbuf`]s built against
/// it — those are owned by the caller and passed back into [`Job`]'s
/// methods by `&mut` reference, avoiding the aliasing a shared back-pointer
/// would require (see the "Backpointers" design note: this is the
/// handle-plus-explicit-arena shape rather than an intrusive one).
pub struct Job {
    pub(crate) device: Arc<crate::device::Device>,
    context: u64,
    syncpt_id: u32,
    increments: u32,
    cmdbufs: Vec<ioctl::Cmdbuf>,
    relocs: Vec<ioctl::Reloc>,
    bo_refs: Vec<Bo>,
    timeout_ms: u32,
}

impl Job {
    /// Captures `channel`'s context id and chosen syncpoint id. The job
    /// itself does not keep `channel` alive beyond this call; the client is
    /// expected to keep its own `Channel` alive for as long as it intends to
    /// build and submit jobs against it.
    pub fn new(channel: &Channel) -> Self {
        Self {
            device: Arc::clone(&channel.device),
            context: channel.context(),
            syncpt_id: channel.syncpt_id(),
            increments: 0,
            cmdbufs: Vec::new(),
            relocs: Vec::new(),
            bo_refs: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Overrides the fixed 1000ms submission timeout policy (see design
    /// note on submission timeout — not required for parity, but a
    /// configurable per-submit timeout is strictly more useful).
    pub fn set_timeout_ms(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    /// The syncpoint id this job increments; exposed so [`crate::pushbuf`]
    /// can encode it into `sync()`'s opcode word.
    pub(crate) fn syncpt_id(&self) -> u32 {
        self.syncpt_id
    }

    /// Appends one gather descriptor (a contiguous cmdbuf range the GPU
    /// will execute, in list order).
    pub(crate) fn add_cmdbuf(&mut self, handle: u32, word_offset: u32, word_count: u32) {
        self.cmdbufs.push(ioctl::Cmdbuf {
            handle,
            offset: word_offset * 4,
            words: word_count,
            pad: 0,
        });
    }

    /// Appends one relocation record, to be patched by the kernel before
    /// execution.
    pub(crate) fn add_reloc(&mut self, reloc: ioctl::Reloc) {
        self.relocs.push(reloc);
    }

    /// Increments this job's total syncpoint-increment count, called by
    /// [`crate::pushbuf::Pushbuf::sync`].
    pub(crate) fn add_increment(&mut self) {
        self.increments += 1;
    }

    /// Keeps `bo` alive for the lifetime of this job — every BO referenced
    /// by a cmdbuf or relocation must outlive the submission.
    pub(crate) fn track_bo(&mut self, bo: Bo) {
        self.bo_refs.push(bo);
    }

    /// Commits the currently-active pushbuf (if any), allocates the
    /// syncpoint-increment descriptor array, builds the `SUBMIT` ioctl
    /// struct, and issues it. On success returns a [`Fence`] identifying the
    /// syncpoint value the submission will reach.
    pub fn submit(mut self, active: Option<&mut crate::pushbuf::Pushbuf>) -> Result<Fence, DriverError> {
        if let Some(pushbuf) = active {
            pushbuf.commit(&mut self);
        }

        trace!(
            "submit: cmdbufs={} relocs={} increments={}",
            self.cmdbufs.len(),
            self.relocs.len(),
            self.increments
        );

        let mut syncpts = [ioctl::SyncptIncrRecord {
            id: self.syncpt_id,
            incrs: self.increments,
        }];

        let mut args = ioctl::Submit {
            context: self.context,
            num_syncpts: 1,
            num_cmdbufs: self.cmdbufs.len() as u32,
            num_relocs: self.relocs.len() as u32,
            num_waitchks: 0,
            waitchk_mask: 0,
            timeout: self.timeout_ms,
            pad: 0,
            syncpts: syncpts.as_mut_ptr() as u64,
            cmdbufs: self.cmdbufs.as_mut_ptr() as u64,
            relocs: self.relocs.as_mut_ptr() as u64,
            waitchks: 0,
            fence: 0,
            reserved: [0; 5],
        };

        unsafe { ioctl::tegra_submit(self.device.fd(), &mut args) }
            .map_err(|_| DriverError::from_errno())?;

        Ok(Fence {
            device: Arc::clone(&self.device),
            syncpt_id: self.syncpt_id,
            value: args.fence,
        })
    }

    /// Drops all BO references held by this job and consumes it. Equivalent
    /// to letting it go out of scope; provided for parity with the source
    /// library's explicit `drm_tegra_job_free`.
    pub fn free(self) {}
}

#[cfg(test)]
impl Job {
    /// Builds a `Job` without going through `Channel::open`'s ioctls, for
    /// tests (in this module or others) that only need to exercise
    /// bookkeeping against a fake device fd.
    pub(crate) fn for_test(device: Arc<crate::device::Device>, syncpt_id: u32) -> Self {
        Self {
            device,
            context: 0,
            syncpt_id,
            increments: 0,
            cmdbufs: Vec::new(),
            relocs: Vec::new(),
            bo_refs: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub(crate) fn cmdbufs(&self) -> &[ioctl::Cmdbuf] {
        &self.cmdbufs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_device() -> Arc<crate::device::Device> {
        Arc::new(crate::device::Device::wrap(-1, false))
    }

    #[test]
    fn add_cmdbuf_converts_word_offset_to_bytes() {
        let mut job = Job {
            device: fake_device(),
            context: 0,
            syncpt_id: 0,
            increments: 0,
            cmdbufs: Vec::new(),
            relocs: Vec::new(),
            bo_refs: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        };

        job.add_cmdbuf(7, 2, 10);
        assert_eq!(job.cmdbufs[0].handle, 7);
        assert_eq!(job.cmdbufs[0].offset, 8);
        assert_eq!(job.cmdbufs[0].words, 10);
    }

    #[test]
    fn add_increment_accumulates() {
        let mut job = Job {
            device: fake_device(),
            context: 0,
            syncpt_id: 0,
            increments: 0,
            cmdbufs: Vec::new(),
            relocs: Vec::new(),
            bo_refs: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        };

        job.add_increment();
        job.add_increment();
        assert_eq!(job.increments, 2);
    }
}
