//! Kernel timers
//!
//! A timer sends a fixed message to a queue when its deadline passes, then
//! re-arms itself if it has a period. Deadlines are checked whenever
//! simulated time advances. A message that finds its queue full stays due
//! and is retried on the next tick; timers never block.

use crate::audit::KernelEvent;
use crate::message_queue::PostOutcome;
use crate::SimulatedKernel;
use core_types::{ProcessId, QueueId, TimerId};
use kernel_api::{Duration, Instant, KernelError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// A kernel timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    pub owner: ProcessId,
    pub queue: QueueId,
    pub message: u32,
    /// `None` while stopped
    pub deadline: Option<Instant>,
    /// Zero for a one-shot timer
    pub period: Duration,
}

impl SimulatedKernel {
    fn timer_mut(&mut self, timer: TimerId) -> Result<&mut Timer, KernelError> {
        let process = self.caller_process();
        let entry = self
            .timers
            .get_mut(timer.index())
            .and_then(Option::as_mut)
            .ok_or(KernelError::InvalidArgument("no such timer"))?;
        if entry.owner != process && !process.is_kernel() {
            return Err(KernelError::AccessDenied("timer belongs to another process"));
        }
        Ok(entry)
    }

    pub(crate) fn sys_create_timer(
        &mut self,
        delay_us: u32,
        period_us: u32,
        queue: QueueId,
        message: u32,
    ) -> Result<TimerId, KernelError> {
        self.caller()?;
        let owner = self.caller_process();
        self.check_queue_access(queue, owner)?;
        let slot = self
            .timers
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::Exhausted("timer table"))?;
        self.timers[slot] = Some(Timer {
            owner,
            queue,
            message,
            deadline: Some(self.clock.now() + Duration::from_micros(delay_us as u64)),
            period: Duration::from_micros(period_us as u64),
        });
        let timer = TimerId::from_index(slot);
        debug!("{} armed for {} in {}us", timer, queue, delay_us);
        Ok(timer)
    }

    pub(crate) fn sys_restart_timer(
        &mut self,
        timer: TimerId,
        delay_us: u32,
        period_us: u32,
    ) -> Result<(), KernelError> {
        self.caller()?;
        let now = self.clock.now();
        let entry = self.timer_mut(timer)?;
        entry.deadline = Some(now + Duration::from_micros(delay_us as u64));
        entry.period = Duration::from_micros(period_us as u64);
        Ok(())
    }

    pub(crate) fn sys_stop_timer(&mut self, timer: TimerId) -> Result<(), KernelError> {
        self.caller()?;
        self.timer_mut(timer)?.deadline = None;
        Ok(())
    }

    pub(crate) fn sys_destroy_timer(&mut self, timer: TimerId) -> Result<(), KernelError> {
        self.caller()?;
        self.timer_mut(timer)?;
        self.timers[timer.index()] = None;
        Ok(())
    }

    /// Drops every timer that targets `queue`
    pub(crate) fn remove_timers_for(&mut self, queue: QueueId) {
        for entry in self.timers.iter_mut() {
            if entry.is_some_and(|t| t.queue == queue) {
                *entry = None;
            }
        }
    }

    /// Moves simulated time forward and fires due timers
    pub fn advance_time(&mut self, duration: Duration) {
        self.clock.advance(duration);
        self.fire_due_timers();
        self.preempt_if_needed();
    }

    fn fire_due_timers(&mut self) {
        let now = self.clock.now();
        for index in 0..self.timers.len() {
            let Some(timer) = self.timers[index] else {
                continue;
            };
            let id = TimerId::from_index(index);
            let mut deadline = timer.deadline;
            while let Some(due) = deadline.filter(|d| *d <= now) {
                match self.post_message(timer.queue, timer.message, false) {
                    Ok(PostOutcome::Delivered | PostOutcome::Queued) => {
                        deadline = if timer.period.is_zero() {
                            None
                        } else {
                            Some(due + timer.period)
                        };
                    }
                    Ok(PostOutcome::Full) => {
                        warn!("{} deferred: {} full", id, timer.queue);
                        self.kernel_events.record(KernelEvent::TimerDeferred {
                            timer: id,
                            queue: timer.queue,
                        });
                        break;
                    }
                    Err(_) => {
                        deadline = None;
                    }
                }
            }
            if let Some(entry) = self.timers[index].as_mut() {
                entry.deadline = deadline;
            }
        }
    }

    pub(crate) fn sys_time(&self) -> Instant {
        self.clock.now()
    }

    pub fn timer(&self, timer: TimerId) -> Option<&Timer> {
        self.timers.get(timer.index()).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::KernelEvent;
    use crate::test_utils::TestSystem;
    use core_types::QueueId;
    use kernel_api::{Duration, Instant, KernelApi, EACCES, EINVAL};

    fn queue(sys: &mut TestSystem, capacity: u32) -> QueueId {
        let buffer = sys.alloc_kernel(capacity as usize * 4);
        sys.kernel.create_message_queue(buffer, capacity).unwrap()
    }

    fn drained(sys: &mut TestSystem, queue: QueueId) -> Vec<u32> {
        sys.kernel.queue(queue).unwrap().messages().collect()
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut sys = TestSystem::new();
        let q = queue(&mut sys, 4);
        sys.kernel.create_timer(500, 0, q, 0x77).unwrap();

        sys.kernel.advance_time(Duration::from_micros(499));
        assert!(drained(&mut sys, q).is_empty());
        sys.kernel.advance_time(Duration::from_micros(1));
        assert_eq!(drained(&mut sys, q), vec![0x77]);
        sys.kernel.advance_time(Duration::from_millis(10));
        assert_eq!(drained(&mut sys, q), vec![0x77]);
        assert_eq!(sys.kernel.time(), Instant::from_micros(10_500));
    }

    #[test]
    fn test_periodic_timer_rearms() {
        let mut sys = TestSystem::new();
        let q = queue(&mut sys, 8);
        let timer = sys.kernel.create_timer(100, 100, q, 1).unwrap();

        sys.kernel.advance_time(Duration::from_micros(350));
        assert_eq!(drained(&mut sys, q), vec![1, 1, 1]);
        assert_eq!(
            sys.kernel.timer(timer).unwrap().deadline,
            Some(Instant::from_micros(400))
        );

        sys.kernel.stop_timer(timer).unwrap();
        sys.kernel.advance_time(Duration::from_millis(1));
        assert_eq!(drained(&mut sys, q).len(), 3);

        sys.kernel.restart_timer(timer, 0, 0).unwrap();
        sys.kernel.advance_time(Duration::ZERO);
        assert_eq!(drained(&mut sys, q).len(), 4);
    }

    #[test]
    fn test_full_queue_defers_firing() {
        let mut sys = TestSystem::new();
        let q = queue(&mut sys, 1);
        let out = sys.alloc_kernel(4);
        sys.kernel.send_message(q, 9, 0).unwrap();
        sys.kernel.create_timer(10, 0, q, 2).unwrap();

        sys.kernel.advance_time(Duration::from_micros(10));
        assert!(sys
            .kernel
            .kernel_events()
            .has_event(|e| matches!(e, KernelEvent::TimerDeferred { .. })));

        sys.kernel.receive_message(q, out, 0).unwrap();
        sys.kernel.advance_time(Duration::from_micros(1));
        assert_eq!(drained(&mut sys, q), vec![2]);
    }

    #[test]
    fn test_owner_only() {
        let mut sys = TestSystem::new();
        let a = sys.spawn(1, 50);
        sys.focus(a);
        let buffer = sys.alloc(1, 4);
        let q = sys.kernel.create_message_queue(buffer, 1).unwrap();
        let timer = sys.kernel.create_timer(10, 0, q, 0).unwrap();

        let b = sys.spawn(2, 50);
        sys.focus(b);
        assert_eq!(sys.kernel.stop_timer(timer).unwrap_err().code(), EACCES);
        assert_eq!(sys.kernel.create_timer(10, 0, q, 0).unwrap_err().code(), EACCES);
        assert_eq!(
            sys.kernel
                .destroy_timer(core_types::TimerId::from_index(31))
                .unwrap_err()
                .code(),
            EINVAL
        );
    }

    #[test]
    fn test_destroying_queue_drops_its_timers() {
        let mut sys = TestSystem::new();
        let q = queue(&mut sys, 1);
        let timer = sys.kernel.create_timer(10, 10, q, 0).unwrap();
        sys.kernel.destroy_message_queue(q).unwrap();
        assert!(sys.kernel.timer(timer).is_none());
        sys.kernel.advance_time(Duration::from_millis(1));
    }
}
