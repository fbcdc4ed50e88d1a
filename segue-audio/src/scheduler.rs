//! One-shot continuations on the engine clock
//!
//! The engine clock counts rendered frames. A task fires at the end of the
//! first block whose end reaches its due frame, so timing is quantized to the
//! block size.

use std::collections::BTreeMap;

/// Handle to a scheduled task; used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

/// Work the engine can defer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledTask {
    /// Recording reached its target length
    RecorderAutoStop { session: u64 },
    /// Tail window after a stop request has elapsed
    RecorderTailStop { session: u64 },
}

/// Frame-clock scheduler
#[derive(Debug)]
pub struct Scheduler {
    sample_rate: u32,
    /// Frames rendered so far
    now: u64,
    next_id: u64,
    /// Keyed by (due frame, handle) so same-frame tasks fire in schedule order
    tasks: BTreeMap<(u64, TaskHandle), ScheduledTask>,
}

impl Scheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            now: 0,
            next_id: 0,
            tasks: BTreeMap::new(),
        }
    }

    /// Current clock in frames
    pub fn now_frames(&self) -> u64 {
        self.now
    }

    /// Current clock in seconds
    pub fn now_secs(&self) -> f64 {
        self.now as f64 / self.sample_rate as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Convert seconds to whole frames
    pub fn secs_to_frames(&self, secs: f64) -> u64 {
        (secs.max(0.0) * self.sample_rate as f64).round() as u64
    }

    /// Run `task` once, `delay_secs` from now
    pub fn schedule_after(&mut self, delay_secs: f64, task: ScheduledTask) -> TaskHandle {
        let due = self.now.saturating_add(self.secs_to_frames(delay_secs));
        let handle = TaskHandle(self.next_id);
        self.next_id += 1;
        self.tasks.insert((due, handle), task);
        handle
    }

    /// Frame at which `handle` will fire, if still pending
    pub fn due_frame(&self, handle: TaskHandle) -> Option<u64> {
        self.tasks.keys().find(|(_, h)| *h == handle).map(|(due, _)| *due)
    }

    /// Drop a pending task. Unknown or already-fired handles are ignored.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        let key = self.tasks.keys().find(|(_, h)| *h == handle).copied();
        match key {
            Some(key) => self.tasks.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Advance the clock by `frames`
    pub fn advance(&mut self, frames: u64) {
        self.now += frames;
    }

    /// Remove and return the next task that is due at the current clock
    pub fn pop_due(&mut self) -> Option<(TaskHandle, ScheduledTask)> {
        let (&(due, handle), _) = self.tasks.iter().next()?;
        if due > self.now {
            return None;
        }
        self.tasks
            .remove(&(due, handle))
            .map(|task| (handle, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_fires_when_due() {
        let mut s = Scheduler::new(1000);
        let h = s.schedule_after(0.5, ScheduledTask::RecorderAutoStop { session: 1 });
        assert_eq!(s.due_frame(h), Some(500));

        s.advance(499);
        assert!(s.pop_due().is_none());
        s.advance(1);
        assert_eq!(
            s.pop_due(),
            Some((h, ScheduledTask::RecorderAutoStop { session: 1 }))
        );
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn test_cancelled_task_never_fires() {
        let mut s = Scheduler::new(1000);
        let h = s.schedule_after(0.1, ScheduledTask::RecorderTailStop { session: 7 });
        assert!(s.cancel(h));
        assert!(!s.cancel(h));
        s.advance(1000);
        assert!(s.pop_due().is_none());
    }

    #[test]
    fn test_due_order() {
        let mut s = Scheduler::new(1000);
        let late = s.schedule_after(0.2, ScheduledTask::RecorderAutoStop { session: 1 });
        let early = s.schedule_after(0.1, ScheduledTask::RecorderTailStop { session: 1 });
        s.advance(300);
        assert_eq!(s.pop_due().map(|(h, _)| h), Some(early));
        assert_eq!(s.pop_due().map(|(h, _)| h), Some(late));
    }

    #[test]
    fn test_delay_is_relative_to_now() {
        let mut s = Scheduler::new(48000);
        s.advance(48000 * 3);
        let h = s.schedule_after(4.0, ScheduledTask::RecorderTailStop { session: 2 });
        assert_eq!(s.due_frame(h), Some(48000 * 7));
    }

    #[test]
    fn test_unbounded_delay_saturates() {
        let mut s = Scheduler::new(48000);
        s.advance(10);
        let h = s.schedule_after(f64::INFINITY, ScheduledTask::RecorderTailStop { session: 3 });
        assert_eq!(s.due_frame(h), Some(u64::MAX));
        s.advance(48000);
        assert!(s.pop_due().is_none());
    }
}
