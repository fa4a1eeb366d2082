//! Command stream writer
//!
//! A [`Pushbuf`] is a word pointer into a mapped buffer object: `push`
//! writes the next command word and advances the cursor, growing into a
//! freshly allocated buffer once the current one fills up. Relocations are
//! recorded against the active word's byte offset and handed off to the
//! owning [`crate::job::Job`], which aggregates them for the `SUBMIT`
//! ioctl — mirroring `drm_tegra_pushbuf_relocate`'s split between the
//! pushbuf (which only knows its own offset) and the job (which owns the
//! aggregate relocation array).

use {
    crate::{bo::Bo, device::Device, error::DriverError, ioctl, job::Job},
    std::sync::Arc,
};

/// `HOST1X_OPCODE_NONINCR(offset, count)`: a non-incrementing class-method
/// write opcode, used by [`Pushbuf::sync`] to encode the syncpoint
/// condition word.
fn host1x_opcode_noincr(offset: u32, count: u32) -> u32 {
    (0x2 << 28) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

/// Default size, in words, of a freshly grown pushbuf segment.
const DEFAULT_PUSHBUF_WORDS: usize = 8192;

/// Condition under which [`Pushbuf::sync`] emits its syncpoint increment.
/// Mirrors `enum drm_tegra_syncpt_cond`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SyncptCond {
    /// Increment immediately, without waiting on any condition.
    Immediate = 0,
    /// Increment once the operation issuing this word has completed.
    OpDone = 1,
    /// Increment once all prior reads have drained.
    RdDone = 2,
    /// Increment once it is safe to write to buffers read by prior ops.
    WrSafe = 3,
}

/// An append-only command-word writer into a dedicated, mapped buffer
/// object.
///
/// Growth allocates a brand-new buffer rather than resizing the existing
/// one (GEM objects cannot be resized in place). `commit` closes out the
/// current segment as a gather descriptor on the job passed to it, recording
/// its word offset relative to the backing BO's mapped base — not
/// necessarily zero, since `commit` may be called more than once against the
/// same still-open buffer (e.g. by a caller that wants to flush a gather
/// mid-stream without triggering growth). It is a no-op when called twice
/// with no intervening `push`/`relocate`.
pub struct Pushbuf {
    bo: Option<Bo>,
    base: *mut u32,
    start: *mut u32,
    current: *mut u32,
    end: *mut u32,
}

// SAFETY: the raw pointers here alias only the pushbuf's own dedicated
// mapped buffer, never shared with another thread while a `&mut Pushbuf`
// is live.
unsafe impl Send for Pushbuf {}

impl Pushbuf {
    /// Creates an empty pushbuf with no backing buffer yet; the first
    /// `push` or `relocate` call allocates one on demand.
    pub fn new() -> Self {
        Self {
            bo: None,
            base: std::ptr::null_mut(),
            start: std::ptr::null_mut(),
            current: std::ptr::null_mut(),
            end: std::ptr::null_mut(),
        }
    }

    fn capacity_remaining(&self) -> usize {
        if self.current.is_null() {
            0
        } else {
            unsafe { self.end.offset_from(self.current) as usize }
        }
    }

    /// Ensures at least `words` of free capacity, committing the current
    /// segment to `job` and allocating a fresh dedicated buffer if needed.
    pub fn prepare(&mut self, device: &Arc<Device>, job: &mut Job, words: usize) -> Result<(), DriverError> {
        if self.capacity_remaining() >= words {
            return Ok(());
        }

        self.commit(job);

        if let Some(bo) = self.bo.take() {
            Bo::unmap(&bo);
        }

        let word_count = words.max(DEFAULT_PUSHBUF_WORDS);
        let size = round_up_page((word_count * 4) as u64);

        let bo = Bo::create(device, crate::bo::BoInfo::new(size))?;
        let ptr = Bo::map(&bo)? as *mut u32;

        self.bo = Some(bo);
        self.base = ptr;
        self.start = ptr;
        self.current = ptr;
        self.end = unsafe { ptr.add((size / 4) as usize) };

        Ok(())
    }

    /// Writes `word` at the cursor and advances it by one, growing into a
    /// fresh buffer first if the current one is full.
    ///
    /// `device` is needed only on the (rare) growth path; callers that know
    /// capacity is available may find it easier to call `prepare` up front
    /// and then write words directly through repeated `push` calls without
    /// re-checking growth each time.
    pub fn push(&mut self, device: &Arc<Device>, job: &mut Job, word: u32) -> Result<(), DriverError> {
        self.prepare(device, job, 1)?;

        unsafe {
            *self.current = word;
            self.current = self.current.add(1);
        }

        Ok(())
    }

    /// Closes out the current segment, appending a gather descriptor to
    /// `job` covering every word written since the last `commit`. The
    /// gather's word offset is computed relative to the backing BO's mapped
    /// base, so calling `commit` more than once against the same
    /// still-open buffer (no growth in between) still records each segment
    /// at its true starting offset rather than always at zero. A no-op if
    /// nothing has been written (including when called twice in a row).
    pub fn commit(&mut self, job: &mut Job) {
        if self.start.is_null() {
            return;
        }

        let words = unsafe { self.current.offset_from(self.start) };

        if words > 0 {
            if let Some(bo) = &self.bo {
                let word_offset = unsafe { self.start.offset_from(self.base) } as u32;
                job.add_cmdbuf(Bo::handle(bo), word_offset, words as u32);
                job.track_bo(bo.clone());
            }
        }

        self.start = self.current;
    }

    /// Records a relocation: the word about to be written at the cursor is
    /// a placeholder (`0xDEADBEEF`) the kernel will patch at submit time to
    /// point at `target`'s `offset_in_target`, shifted right by `shift`
    /// bits. Keeps `target` alive for the lifetime of `job`.
    pub fn relocate(
        &mut self,
        device: &Arc<Device>,
        job: &mut Job,
        target: &Bo,
        offset_in_target: u32,
        shift: u32,
    ) -> Result<(), DriverError> {
        self.prepare(device, job, 1)?;

        let cmdbuf_handle = Bo::handle(self.bo.as_ref().expect("prepare allocates a bo"));
        let cmdbuf_offset = (unsafe { self.current.offset_from(self.start) } as u32) * 4;

        unsafe {
            *self.current = 0xDEADBEEF;
            self.current = self.current.add(1);
        }

        job.add_reloc(ioctl::Reloc {
            cmdbuf: ioctl::RelocTarget {
                handle: cmdbuf_handle,
                offset: cmdbuf_offset,
            },
            target: ioctl::RelocTarget {
                handle: Bo::handle(target),
                offset: offset_in_target,
            },
            shift,
            pad: 0,
        });

        job.track_bo(target.clone());

        Ok(())
    }

    /// Emits a syncpoint-increment opcode pair under `cond`, and records the
    /// increment on `job` so `submit` reports the right post-submission
    /// fence value.
    pub fn sync(&mut self, device: &Arc<Device>, job: &mut Job, cond: SyncptCond) -> Result<(), DriverError> {
        self.push(device, job, host1x_opcode_noincr(0x0, 0x1))?;
        self.push(device, job, (cond as u32) << 8 | job.syncpt_id())?;
        job.add_increment();

        Ok(())
    }

    /// Unmaps the backing buffer and consumes the pushbuf. Equivalent to
    /// dropping it.
    pub fn free(self) {}
}

impl Default for Pushbuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pushbuf {
    fn drop(&mut self) {
        if let Some(bo) = self.bo.take() {
            Bo::unmap(&bo);
        }
    }
}

fn round_up_page(size: u64) -> u64 {
    const PAGE: u64 = 4096;
    (size + PAGE - 1) & !(PAGE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host1x_opcode_noincr_packs_fields() {
        assert_eq!(host1x_opcode_noincr(0, 1), 0x2000_0001);
    }

    #[test]
    fn round_up_page_rounds_to_4096() {
        assert_eq!(round_up_page(1), 4096);
        assert_eq!(round_up_page(4096), 4096);
        assert_eq!(round_up_page(4097), 8192);
    }

    #[test]
    fn syncpt_cond_values_match_wire_encoding() {
        assert_eq!(SyncptCond::Immediate as u32, 0);
        assert_eq!(SyncptCond::WrSafe as u32, 3);
    }

    #[test]
    fn fresh_pushbuf_has_no_capacity() {
        let pushbuf = Pushbuf::new();
        assert_eq!(pushbuf.capacity_remaining(), 0);
    }

    #[test]
    fn commit_twice_without_growth_uses_distinct_word_offsets() {
        let device = Arc::new(Device::wrap(-1, false));
        let bo = Bo::wrap_handle(&device, 7, 0, 4096).unwrap();
        let mut job = Job::for_test(Arc::clone(&device), 0);

        let mut words = [0u32; 16];
        let base = words.as_mut_ptr();

        let mut pushbuf = Pushbuf::new();
        pushbuf.bo = Some(bo);
        pushbuf.base = base;
        pushbuf.start = base;
        pushbuf.current = unsafe { base.add(4) };
        pushbuf.end = unsafe { base.add(words.len()) };

        // First segment: four words starting right at the buffer base.
        pushbuf.commit(&mut job);

        // Write four more words into the same still-open buffer (no
        // `prepare`-triggered growth), then commit again.
        pushbuf.current = unsafe { pushbuf.current.add(4) };
        pushbuf.commit(&mut job);

        let cmdbufs = job.cmdbufs();
        assert_eq!(cmdbufs.len(), 2);
        assert_eq!(cmdbufs[0].offset, 0);
        assert_eq!(cmdbufs[0].words, 4);
        assert_eq!(cmdbufs[1].offset, 4 * 4);
        assert_eq!(cmdbufs[1].words, 4);
    }
}
