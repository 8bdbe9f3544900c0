//! Deferred retirement of GPU objects.
//!
//! With several frames in flight an object replaced on the CPU side (an old
//! swapchain, a resized buffer) may still be read by the GPU. Retired objects
//! are queued with the frame number at which they were replaced and handed
//! back for destruction once every frame that could reference them has
//! completed.

use std::collections::VecDeque;

struct Retired<T> {
    item: T,
    frame_queued: u64,
}

/// FIFO of objects waiting for the GPU to stop using them.
pub struct RetirementQueue<T> {
    pending: VecDeque<Retired<T>>,
    frames_in_flight: usize,
}

impl<T> RetirementQueue<T> {
    /// Create a queue that holds items for `frames_in_flight` frames.
    pub const fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Retire `item`, replaced during `frame_number`.
    pub fn queue(&mut self, item: T, frame_number: u64) {
        if let Some(back) = self.pending.back() {
            debug_assert!(back.frame_queued <= frame_number);
        }
        self.pending.push_back(Retired {
            item,
            frame_queued: frame_number,
        });
    }

    /// Hand every item old enough to be unused to `destroy`.
    ///
    /// Returns how many items were released.
    pub fn process<F>(&mut self, current_frame_number: u64, mut destroy: F) -> usize
    where
        F: FnMut(T),
    {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);
        let mut released = 0;

        // Frame numbers are non-decreasing, so only the front can mature.
        while let Some(front) = self.pending.front() {
            if front.frame_queued >= cutoff {
                break;
            }
            if let Some(retired) = self.pending.pop_front() {
                destroy(retired.item);
                released += 1;
            }
        }

        if released > 0 {
            tracing::debug!("Released {} retired object(s)", released);
        }
        released
    }

    /// Release everything immediately.
    ///
    /// Only valid after a device idle-wait.
    pub fn flush<F>(&mut self, mut destroy: F)
    where
        F: FnMut(T),
    {
        while let Some(retired) = self.pending.pop_front() {
            destroy(retired.item);
        }
    }

    /// Number of items still waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_survive_frames_in_flight() {
        let mut queue = RetirementQueue::new(2);
        queue.queue(7_u32, 10);

        let mut destroyed = Vec::new();
        assert_eq!(queue.process(11, |item| destroyed.push(item)), 0);
        assert_eq!(queue.process(12, |item| destroyed.push(item)), 0);
        assert_eq!(queue.process(13, |item| destroyed.push(item)), 1);
        assert_eq!(destroyed, vec![7]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn release_is_fifo() {
        let mut queue = RetirementQueue::new(1);
        queue.queue(1_u32, 1);
        queue.queue(2, 2);
        queue.queue(3, 5);

        let mut destroyed = Vec::new();
        queue.process(4, |item| destroyed.push(item));
        assert_eq!(destroyed, vec![1, 2]);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn flush_releases_everything() {
        let mut queue = RetirementQueue::new(3);
        queue.queue(1_u32, 100);
        queue.queue(2, 100);

        let mut count = 0;
        queue.flush(|_| count += 1);
        assert_eq!(count, 2);
        assert_eq!(queue.pending_count(), 0);
    }
}
