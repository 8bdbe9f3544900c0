//! Frame driver state machine.
//!
//! One [`FrameDriver::tick`] runs `WaitSlot -> AcquireImage -> Record ->
//! Submit -> Present` for the current slot. An out-of-date image, a failed
//! recording, a suboptimal or out-of-date present, or a window resize takes
//! the `RebuildSwapchain` edge instead. The slot index and frame counter
//! only move after the queue accepted a present.
//!
//! The driver talks to the GPU through [`FrameBackend`] and to the window
//! through [`WindowSource`], so it can be driven by test doubles.

use creation_rhi::{AcquireOutcome, AcquiredImage, PresentOutcome, Result, RhiError};

/// Where the driver is within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    WaitSlot,
    AcquireImage,
    Record,
    Submit,
    Present,
    RebuildSwapchain,
}

/// GPU operations the frame driver sequences.
pub trait FrameBackend {
    /// Handed to the draw callback while the frame records.
    type Scope<'a>;

    /// Number of frame slots (K).
    fn frames_in_flight(&self) -> usize;

    /// Block until slot `slot`'s previous submission has completed.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next presentable image using slot `slot`'s semaphore.
    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Record the frame for `image` into slot `slot`'s command buffer.
    fn record<F>(&mut self, slot: usize, image: AcquiredImage, draw: F) -> Result<()>
    where
        F: for<'s> FnOnce(&Self::Scope<'s>) -> Result<()>;

    /// Reset slot `slot`'s fence so the next submission signals it.
    fn reset_and_arm_fence(&mut self, slot: usize) -> Result<()>;

    /// Submit slot `slot`'s command buffer.
    fn submit(&mut self, slot: usize, image: AcquiredImage) -> Result<()>;

    /// Queue `image` for presentation.
    fn present(&mut self, image: AcquiredImage) -> Result<PresentOutcome>;

    /// Rebuild the swapchain and everything sized by it.
    fn rebuild(&mut self, extent: (u32, u32)) -> Result<()>;
}

/// The window as seen by the frame driver.
pub trait WindowSource {
    /// Current framebuffer size in pixels.
    fn framebuffer_extent(&self) -> (u32, u32);

    /// Whether the window was closed.
    fn is_closed(&self) -> bool;

    /// Whether the window was resized since the last call. Clears the flag.
    fn take_resized(&mut self) -> bool;

    /// Block until the window has something new to report.
    fn wait_events(&mut self);
}

/// Result of one [`FrameDriver::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was presented.
    Presented {
        slot: usize,
        image_index: u32,
        frame_number: u64,
    },
    /// The swapchain was rebuilt at this extent.
    Rebuilt { extent: (u32, u32) },
    /// The window closed.
    Closed,
}

/// Sequences frames over K rotating slots.
#[derive(Debug)]
pub struct FrameDriver {
    slot: usize,
    frames_in_flight: usize,
    frame_number: u64,
    state: FrameState,
}

impl FrameDriver {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slot: 0,
            frames_in_flight: frames_in_flight.max(1),
            frame_number: 0,
            state: FrameState::Idle,
        }
    }

    /// Slot the next tick uses.
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Number of frames presented.
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub const fn state(&self) -> FrameState {
        self.state
    }

    /// Run one frame.
    ///
    /// Errors are returned only when they cannot be handled by a rebuild;
    /// the driver is back in `Idle` either way.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn tick<B, W, F>(&mut self, backend: &mut B, window: &mut W, draw: F) -> Result<TickOutcome>
    where
        B: FrameBackend,
        W: WindowSource,
        F: for<'s> FnOnce(&B::Scope<'s>) -> Result<()>,
    {
        let outcome = self.run(backend, window, draw);
        self.state = FrameState::Idle;
        outcome
    }

    fn run<B, W, F>(&mut self, backend: &mut B, window: &mut W, draw: F) -> Result<TickOutcome>
    where
        B: FrameBackend,
        W: WindowSource,
        F: for<'s> FnOnce(&B::Scope<'s>) -> Result<()>,
    {
        if window.is_closed() {
            return Ok(TickOutcome::Closed);
        }
        let slot = self.slot;

        self.state = FrameState::WaitSlot;
        backend.wait_for_slot(slot)?;

        self.state = FrameState::AcquireImage;
        let image = match backend.acquire_next_image(slot)? {
            AcquireOutcome::Acquired(image) => image,
            AcquireOutcome::OutOfDate => {
                tracing::debug!("Swapchain out of date on acquire");
                return self.rebuild(backend, window);
            }
        };

        self.state = FrameState::Record;
        if let Err(e) = backend.record(slot, image, draw) {
            if !e.is_transient() {
                return Err(e);
            }
            tracing::warn!("Frame {} dropped: {e}", self.frame_number);
            return self.rebuild(backend, window);
        }

        self.state = FrameState::Submit;
        backend.reset_and_arm_fence(slot)?;
        backend.submit(slot, image)?;

        self.state = FrameState::Present;
        let presented = backend.present(image)?;
        if presented != PresentOutcome::OutOfDate {
            self.slot = (self.slot + 1) % self.frames_in_flight;
            self.frame_number += 1;
        }

        let resized = window.take_resized();
        if presented.needs_rebuild() || resized {
            tracing::debug!("Rebuilding after present ({presented:?}, resized: {resized})");
            return self.rebuild(backend, window);
        }

        Ok(TickOutcome::Presented {
            slot,
            image_index: image.index,
            frame_number: self.frame_number,
        })
    }

    /// Wait for a drawable window, then rebuild. The slot index is kept.
    ///
    /// A surface that reports no area while rebuilding sends the driver back
    /// to waiting on the window.
    fn rebuild<B, W>(&mut self, backend: &mut B, window: &mut W) -> Result<TickOutcome>
    where
        B: FrameBackend,
        W: WindowSource,
    {
        self.state = FrameState::RebuildSwapchain;

        let extent = loop {
            if window.is_closed() {
                return Ok(TickOutcome::Closed);
            }
            let (width, height) = window.framebuffer_extent();
            if width > 0 && height > 0 {
                match backend.rebuild((width, height)) {
                    Ok(()) => break (width, height),
                    Err(RhiError::ZeroExtent { .. }) => {
                        tracing::debug!("Surface has no area, waiting for the window");
                    }
                    Err(e) => return Err(e),
                }
            }
            window.wait_events();
        };

        // A resize reported while rebuilding is already covered.
        window.take_resized();

        tracing::info!("Swapchain rebuilt at {}x{}", extent.0, extent.1);
        Ok(TickOutcome::Rebuilt { extent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creation_rhi::SlotLedger;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Record(usize, u32),
        Arm(usize),
        Submit(usize),
        Present(u32),
        Rebuild((u32, u32)),
    }

    /// Backend double with an in-order GPU queue whose work only completes
    /// when the driver waits on a slot's fence.
    struct MockBackend {
        frames: usize,
        calls: Vec<Call>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        rebuild_failures: VecDeque<RhiError>,
        next_image: u32,
        generation: u64,
        ledger: SlotLedger,
        /// Slots of submissions the GPU has not finished, oldest first.
        outstanding: VecDeque<usize>,
        /// `outstanding.len()` each time the driver waited on a slot.
        outstanding_at_wait: Vec<usize>,
    }

    impl MockBackend {
        fn new(frames: usize) -> Self {
            Self {
                frames,
                calls: Vec::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                rebuild_failures: VecDeque::new(),
                next_image: 0,
                generation: 1,
                ledger: SlotLedger::new(frames),
                outstanding: VecDeque::new(),
                outstanding_at_wait: Vec::new(),
            }
        }
    }

    impl FrameBackend for MockBackend {
        type Scope<'a> = usize;

        fn frames_in_flight(&self) -> usize {
            self.frames
        }

        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            self.outstanding_at_wait.push(self.outstanding.len());
            if self.ledger.must_block(slot) {
                // The slot's submission is the oldest one still running.
                assert_eq!(self.outstanding.front(), Some(&slot));
                self.outstanding.pop_front();
            }
            self.ledger.waited(slot);
            Ok(())
        }

        fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % 3;
                AcquireOutcome::Acquired(AcquiredImage {
                    index,
                    generation: self.generation,
                    suboptimal: false,
                })
            }))
        }

        fn record<F>(&mut self, slot: usize, image: AcquiredImage, draw: F) -> Result<()>
        where
            F: for<'s> FnOnce(&Self::Scope<'s>) -> Result<()>,
        {
            self.calls.push(Call::Record(slot, image.index));
            self.ledger.check_recordable(slot)?;
            draw(&slot)
        }

        fn reset_and_arm_fence(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Arm(slot));
            self.ledger.armed(slot);
            Ok(())
        }

        fn submit(&mut self, slot: usize, _image: AcquiredImage) -> Result<()> {
            self.calls.push(Call::Submit(slot));
            self.ledger.submitted(slot);
            self.outstanding.push_back(slot);
            Ok(())
        }

        fn present(&mut self, image: AcquiredImage) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(image.index));
            Ok(self
                .presents
                .pop_front()
                .unwrap_or(PresentOutcome::Presented))
        }

        fn rebuild(&mut self, extent: (u32, u32)) -> Result<()> {
            self.calls.push(Call::Rebuild(extent));
            if let Some(e) = self.rebuild_failures.pop_front() {
                return Err(e);
            }
            // A rebuild waits for the device to go idle.
            self.ledger.mark_all_idle();
            self.outstanding.clear();
            self.generation += 1;
            Ok(())
        }
    }

    struct ScriptedWindow {
        extents: VecDeque<(u32, u32)>,
        current: (u32, u32),
        waits: usize,
        resized: bool,
        closed: bool,
        close_after_waits: Option<usize>,
    }

    impl ScriptedWindow {
        fn new(extent: (u32, u32)) -> Self {
            Self {
                extents: VecDeque::new(),
                current: extent,
                waits: 0,
                resized: false,
                closed: false,
                close_after_waits: None,
            }
        }
    }

    impl WindowSource for ScriptedWindow {
        fn framebuffer_extent(&self) -> (u32, u32) {
            self.current
        }

        fn is_closed(&self) -> bool {
            self.closed || self.close_after_waits.is_some_and(|n| self.waits >= n)
        }

        fn take_resized(&mut self) -> bool {
            std::mem::take(&mut self.resized)
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            if let Some(next) = self.extents.pop_front() {
                self.current = next;
            }
        }
    }

    fn draw_ok(_: &usize) -> Result<()> {
        Ok(())
    }

    #[test]
    fn frame_runs_in_order() {
        let mut backend = MockBackend::new(2);
        let mut window = ScriptedWindow::new((800, 600));
        let mut driver = FrameDriver::new(backend.frames_in_flight());

        let outcome = driver.tick(&mut backend, &mut window, draw_ok).unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Presented {
                slot: 0,
                image_index: 0,
                frame_number: 1
            }
        );
        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Record(0, 0),
                Call::Arm(0),
                Call::Submit(0),
                Call::Present(0),
            ]
        );
        assert_eq!(driver.slot(), 1);
        assert_eq!(driver.state(), FrameState::Idle);
    }

    #[test]
    fn slots_rotate_modulo_k() {
        for k in 1..=4 {
            let mut backend = MockBackend::new(k);
            let mut window = ScriptedWindow::new((800, 600));
            let mut driver = FrameDriver::new(k);

            for frame in 0..10 {
                match driver.tick(&mut backend, &mut window, draw_ok).unwrap() {
                    TickOutcome::Presented { slot, .. } => assert_eq!(slot, frame % k),
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(driver.frame_number(), 10);
        }
    }

    #[test]
    fn wait_sees_at_most_k_outstanding_submissions() {
        const FRAMES: usize = 20;

        for k in 1..=4 {
            let mut backend = MockBackend::new(k);
            let mut window = ScriptedWindow::new((800, 600));
            let mut driver = FrameDriver::new(k);

            for _ in 0..FRAMES {
                driver.tick(&mut backend, &mut window, draw_ok).unwrap();
            }

            // Once the ring is full every wait finds exactly K submissions
            // pending, the oldest of them on the slot being waited for.
            let expected: Vec<usize> = (0..FRAMES).map(|frame| frame.min(k)).collect();
            assert_eq!(backend.outstanding_at_wait, expected);
            assert_eq!(backend.outstanding.len(), k);
            assert_eq!(backend.ledger.in_flight(), k);
        }
    }

    #[test]
    fn surface_shrinking_during_rebuild_waits_for_window() {
        let mut backend = MockBackend::new(2);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);
        backend
            .rebuild_failures
            .push_back(RhiError::ZeroExtent { width: 0, height: 0 });
        let mut window = ScriptedWindow::new((800, 600));
        window.extents = VecDeque::from([(1024, 768)]);
        let mut driver = FrameDriver::new(2);

        let outcome = driver.tick(&mut backend, &mut window, draw_ok).unwrap();

        assert_eq!(outcome, TickOutcome::Rebuilt { extent: (1024, 768) });
        assert_eq!(window.waits, 1);
        let rebuilds: Vec<_> = backend
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Rebuild(_)))
            .collect();
        assert_eq!(
            rebuilds,
            vec![&Call::Rebuild((800, 600)), &Call::Rebuild((1024, 768))]
        );

        let next = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert!(matches!(next, TickOutcome::Presented { slot: 0, .. }));
    }

    #[test]
    fn window_closed_after_surface_shrank() {
        let mut backend = MockBackend::new(2);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);
        backend
            .rebuild_failures
            .push_back(RhiError::ZeroExtent { width: 0, height: 0 });
        let mut window = ScriptedWindow::new((800, 600));
        window.close_after_waits = Some(1);
        let mut driver = FrameDriver::new(2);

        let outcome = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert_eq!(outcome, TickOutcome::Closed);
    }

    #[test]
    fn failed_rebuild_is_escalated() {
        let mut backend = MockBackend::new(2);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);
        backend.rebuild_failures.push_back(RhiError::SurfaceLost);
        let mut window = ScriptedWindow::new((800, 600));
        let mut driver = FrameDriver::new(2);

        let result = driver.tick(&mut backend, &mut window, draw_ok);
        assert!(matches!(result, Err(RhiError::SurfaceLost)));
        assert_eq!(driver.state(), FrameState::Idle);
    }

    #[test]
    fn out_of_date_acquire_rebuilds_without_advancing() {
        let mut backend = MockBackend::new(2);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);
        let mut window = ScriptedWindow::new((1024, 768));
        let mut driver = FrameDriver::new(2);

        let first = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert_eq!(first, TickOutcome::Rebuilt { extent: (1024, 768) });
        assert_eq!(driver.slot(), 0);
        assert_eq!(driver.frame_number(), 0);
        assert_eq!(
            backend.calls,
            vec![Call::Wait(0), Call::Acquire(0), Call::Rebuild((1024, 768))]
        );

        backend.calls.clear();
        let second = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert!(matches!(second, TickOutcome::Presented { slot: 0, .. }));
        assert_eq!(backend.calls[..2], [Call::Wait(0), Call::Acquire(0)]);
    }

    #[test]
    fn minimized_window_blocks_rebuild_until_visible() {
        let mut backend = MockBackend::new(2);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);
        let mut window = ScriptedWindow::new((0, 0));
        window.extents = VecDeque::from([(0, 0), (0, 0), (1920, 1080)]);
        let mut driver = FrameDriver::new(2);

        let outcome = driver.tick(&mut backend, &mut window, draw_ok).unwrap();

        assert_eq!(outcome, TickOutcome::Rebuilt { extent: (1920, 1080) });
        assert_eq!(window.waits, 3);
        let rebuilds: Vec<_> = backend
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Rebuild(_)))
            .collect();
        assert_eq!(rebuilds, vec![&Call::Rebuild((1920, 1080))]);
    }

    #[test]
    fn window_closed_while_minimized() {
        let mut backend = MockBackend::new(2);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);
        let mut window = ScriptedWindow::new((0, 0));
        window.close_after_waits = Some(1);
        let mut driver = FrameDriver::new(2);

        let outcome = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert_eq!(outcome, TickOutcome::Closed);
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Rebuild(_))));
    }

    #[test]
    fn suboptimal_present_advances_then_rebuilds() {
        let mut backend = MockBackend::new(2);
        backend.presents.push_back(PresentOutcome::Suboptimal);
        let mut window = ScriptedWindow::new((640, 480));
        let mut driver = FrameDriver::new(2);

        let outcome = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert_eq!(outcome, TickOutcome::Rebuilt { extent: (640, 480) });
        assert_eq!(driver.slot(), 1);
        assert_eq!(driver.frame_number(), 1);
    }

    #[test]
    fn out_of_date_present_keeps_slot() {
        let mut backend = MockBackend::new(2);
        backend.presents.push_back(PresentOutcome::OutOfDate);
        let mut window = ScriptedWindow::new((640, 480));
        let mut driver = FrameDriver::new(2);

        let outcome = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert_eq!(outcome, TickOutcome::Rebuilt { extent: (640, 480) });
        assert_eq!(driver.slot(), 0);
        assert_eq!(driver.frame_number(), 0);
    }

    #[test]
    fn resize_flag_is_consumed() {
        let mut backend = MockBackend::new(2);
        let mut window = ScriptedWindow::new((640, 480));
        window.resized = true;
        let mut driver = FrameDriver::new(2);

        let first = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert_eq!(first, TickOutcome::Rebuilt { extent: (640, 480) });
        assert!(!window.resized);

        let second = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert!(matches!(second, TickOutcome::Presented { slot: 1, .. }));
    }

    #[test]
    fn recording_failure_skips_submission() {
        let mut backend = MockBackend::new(2);
        let mut window = ScriptedWindow::new((640, 480));
        let mut driver = FrameDriver::new(2);

        let outcome = driver
            .tick(&mut backend, &mut window, |_: &usize| {
                Err(RhiError::Recording("pipeline missing".into()))
            })
            .unwrap();

        assert_eq!(outcome, TickOutcome::Rebuilt { extent: (640, 480) });
        assert!(!backend.calls.contains(&Call::Arm(0)));
        assert!(!backend.calls.contains(&Call::Submit(0)));
        assert_eq!(driver.slot(), 0);
    }

    #[test]
    fn surface_loss_is_escalated() {
        let mut backend = MockBackend::new(2);
        let mut window = ScriptedWindow::new((640, 480));
        let mut driver = FrameDriver::new(2);

        let result = driver.tick(&mut backend, &mut window, |_: &usize| Err(RhiError::SurfaceLost));
        assert!(matches!(result, Err(RhiError::SurfaceLost)));
        assert_eq!(driver.state(), FrameState::Idle);
    }

    #[test]
    fn closed_window_stops_before_waiting() {
        let mut backend = MockBackend::new(2);
        let mut window = ScriptedWindow::new((640, 480));
        window.closed = true;
        let mut driver = FrameDriver::new(2);

        let outcome = driver.tick(&mut backend, &mut window, draw_ok).unwrap();
        assert_eq!(outcome, TickOutcome::Closed);
        assert!(backend.calls.is_empty());
    }
}
