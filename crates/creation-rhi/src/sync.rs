//! Synchronization primitives and the frame slot ring.
//!
//! K frame slots rotate: each has an "image acquired" semaphore and a
//! "slot reusable" fence created signaled. Render-finished semaphores are
//! indexed by swapchain image, because presentation of image j must wait on
//! the work that rendered image j, whatever slot recorded it.

use crate::error::{Result, RhiError};
use crate::swapchain::{AcquireOutcome, Swapchain};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    unsafe { device.wait_for_fences(&[fence], true, timeout_ns)? };
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}

/// Where a slot is in its wait, arm, submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No submission outstanding; the fence is signaled.
    Idle,
    /// The fence wait returned; the slot's resources may be touched.
    Waited,
    /// The fence was reset and will be signaled by the next submission.
    Armed,
    /// A submission is outstanding.
    InFlight,
}

/// CPU-side record of every slot's state.
///
/// Tracks the order wait, arm, submit that each slot must follow.
#[derive(Debug, Clone)]
pub struct SlotLedger {
    states: Vec<SlotState>,
}

impl SlotLedger {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            states: vec![SlotState::Idle; frames_in_flight],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// Whether waiting on the slot's fence has to block on the GPU.
    pub fn must_block(&self, slot: usize) -> bool {
        self.states[slot] == SlotState::InFlight
    }

    /// Whether resources owned by the slot may be rewritten.
    pub fn is_reusable(&self, slot: usize) -> bool {
        matches!(self.states[slot], SlotState::Idle | SlotState::Waited)
    }

    /// Number of slots with an outstanding submission.
    pub fn in_flight(&self) -> usize {
        self.states
            .iter()
            .filter(|&&s| s == SlotState::InFlight)
            .count()
    }

    /// Fail unless the slot's fence was waited on and not yet reset.
    ///
    /// Recording into any other slot would overwrite a command buffer the
    /// GPU may still execute. A debug build panics.
    pub fn check_recordable(&self, slot: usize) -> Result<()> {
        let waited = self.states[slot] == SlotState::Waited;
        debug_assert!(waited, "slot {slot} recorded before its fence was waited on");
        if waited {
            Ok(())
        } else {
            Err(RhiError::SlotInUse(slot))
        }
    }

    /// The slot's fence wait returned.
    pub fn waited(&mut self, slot: usize) {
        self.states[slot] = SlotState::Waited;
    }

    /// The slot's fence was reset.
    pub fn armed(&mut self, slot: usize) {
        debug_assert_eq!(
            self.states[slot],
            SlotState::Waited,
            "fence of slot {slot} reset before it was waited on"
        );
        self.states[slot] = SlotState::Armed;
    }

    /// Work signaling the slot's fence was submitted.
    pub fn submitted(&mut self, slot: usize) {
        debug_assert_eq!(
            self.states[slot],
            SlotState::Armed,
            "slot {slot} submitted without an armed fence"
        );
        self.states[slot] = SlotState::InFlight;
    }

    /// Every fence is known to be signaled, e.g. after a device idle-wait.
    pub fn mark_all_idle(&mut self) {
        self.states.fill(SlotState::Idle);
    }
}

/// Per-slot synchronization primitives.
pub struct FrameSlot {
    /// Signaled when the acquired swapchain image is ready.
    pub image_acquired: vk::Semaphore,
    /// Signaled when the slot's last submission completed.
    pub reusable: vk::Fence,
}

impl FrameSlot {
    /// # Safety
    /// The device must be valid.
    unsafe fn new(device: &ash::Device) -> Result<Self> {
        unsafe {
            Ok(Self {
                image_acquired: create_semaphore(device)?,
                reusable: create_fence(device, true)?,
            })
        }
    }

    /// # Safety
    /// The device must be valid and the primitives must not be in use.
    unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_acquired, None);
            device.destroy_fence(self.reusable, None);
        }
    }
}

/// Ring of K frame slots plus one render-finished semaphore per swapchain image.
pub struct FrameSyncRing {
    slots: Vec<FrameSlot>,
    render_finished: Vec<vk::Semaphore>,
    ledger: SlotLedger,
}

impl FrameSyncRing {
    /// Create a ring for `frames_in_flight` slots and `image_count` swapchain images.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        frames_in_flight: usize,
        image_count: usize,
    ) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(RhiError::InvalidState(
                "At least one frame in flight is required".to_string(),
            ));
        }

        let mut ring = Self {
            slots: Vec::with_capacity(frames_in_flight),
            render_finished: Vec::with_capacity(image_count),
            ledger: SlotLedger::new(frames_in_flight),
        };

        let created = (|| -> Result<()> {
            for _ in 0..frames_in_flight {
                ring.slots.push(unsafe { FrameSlot::new(device)? });
            }
            for _ in 0..image_count {
                ring.render_finished.push(unsafe { create_semaphore(device)? });
            }
            Ok(())
        })();

        if let Err(e) = created {
            unsafe { ring.destroy(device) };
            return Err(e);
        }

        tracing::debug!(
            "Frame sync ring: {} slots, {} render-finished semaphores",
            frames_in_flight,
            image_count
        );
        Ok(ring)
    }

    /// Number of frame slots (K).
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Number of render-finished semaphores, one per swapchain image.
    pub fn image_count(&self) -> usize {
        self.render_finished.len()
    }

    pub fn slot(&self, slot: usize) -> &FrameSlot {
        &self.slots[slot]
    }

    pub const fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    /// Block until slot `slot`'s previous submission has completed.
    ///
    /// # Safety
    /// The device must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn wait_for_slot(&mut self, device: &ash::Device, slot: usize) -> Result<()> {
        unsafe { wait_for_fence(device, self.slots[slot].reusable, u64::MAX)? };
        self.ledger.waited(slot);
        Ok(())
    }

    /// Acquire the next swapchain image, signaling the slot's acquire semaphore.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn acquire_next_image(
        &self,
        loader: &ash::khr::swapchain::Device,
        swapchain: &Swapchain,
        slot: usize,
    ) -> Result<AcquireOutcome> {
        unsafe { swapchain.acquire_next_image(loader, self.slots[slot].image_acquired, u64::MAX) }
    }

    /// Reset the slot's fence so the next submission can signal it.
    ///
    /// Only call after a successful acquire: resetting before an out-of-date
    /// acquire would leave a fence that nothing signals.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reset_and_arm_fence(&mut self, device: &ash::Device, slot: usize) -> Result<()> {
        self.ledger.armed(slot);
        unsafe { reset_fence(device, self.slots[slot].reusable) }
    }

    /// Semaphore signaled when rendering to swapchain image `image` completes.
    pub fn render_finished(&self, image: u32) -> vk::Semaphore {
        self.render_finished[image as usize]
    }

    /// Record that the slot's fence will be signaled by submitted work.
    pub fn mark_submitted(&mut self, slot: usize) {
        self.ledger.submitted(slot);
    }

    /// Record that every fence is signaled after a device idle-wait.
    pub fn mark_idle(&mut self) {
        self.ledger.mark_all_idle();
    }

    /// Destroy all primitives.
    ///
    /// # Safety
    /// The device must be valid and nothing may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for slot in self.slots.drain(..) {
                slot.destroy(device);
            }
            for semaphore in self.render_finished.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the ledger the way a frame loop does, with a GPU that never
    /// finishes, and check that no more than K submissions stay unfenced.
    fn simulate(frames_in_flight: usize, frames: usize) {
        let mut ledger = SlotLedger::new(frames_in_flight);
        let mut blocked = 0;

        for frame in 0..frames {
            let slot = frame % frames_in_flight;
            if ledger.must_block(slot) {
                blocked += 1;
                // The fence wait returns once the GPU drains the slot.
            }
            ledger.waited(slot);
            assert!(ledger.is_reusable(slot));
            ledger.armed(slot);
            ledger.submitted(slot);
            assert!(ledger.in_flight() <= frames_in_flight);
        }

        assert_eq!(blocked, frames.saturating_sub(frames_in_flight));
    }

    #[test]
    fn at_most_k_frames_in_flight() {
        for k in 1..=4 {
            simulate(k, 20);
        }
    }

    #[test]
    fn outstanding_slot_must_block() {
        let mut ledger = SlotLedger::new(2);
        assert!(!ledger.must_block(0));

        ledger.waited(0);
        ledger.armed(0);
        assert!(!ledger.is_reusable(0));
        ledger.submitted(0);
        assert!(ledger.must_block(0));
        assert!(!ledger.must_block(1));
    }

    #[test]
    fn idle_wait_clears_every_slot() {
        let mut ledger = SlotLedger::new(3);
        for slot in 0..3 {
            ledger.waited(slot);
            ledger.armed(slot);
            ledger.submitted(slot);
        }
        assert_eq!(ledger.in_flight(), 3);

        ledger.mark_all_idle();
        assert_eq!(ledger.in_flight(), 0);
        assert!((0..3).all(|slot| ledger.state(slot) == SlotState::Idle));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without an armed fence")]
    fn submit_without_arm_is_flagged() {
        let mut ledger = SlotLedger::new(1);
        ledger.waited(0);
        ledger.submitted(0);
    }

    #[test]
    fn waited_slot_is_recordable() {
        let mut ledger = SlotLedger::new(2);
        ledger.waited(1);
        assert!(ledger.check_recordable(1).is_ok());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "before its fence was waited on"))]
    fn record_without_wait_is_flagged() {
        let ledger = SlotLedger::new(2);
        assert!(matches!(ledger.check_recordable(0), Err(RhiError::SlotInUse(0))));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "before its fence was waited on"))]
    fn record_into_in_flight_slot_is_flagged() {
        let mut ledger = SlotLedger::new(1);
        ledger.waited(0);
        ledger.armed(0);
        ledger.submitted(0);
        assert!(matches!(ledger.check_recordable(0), Err(RhiError::SlotInUse(0))));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "before it was waited on")]
    fn arm_without_wait_is_flagged() {
        let mut ledger = SlotLedger::new(1);
        ledger.armed(0);
    }
}
