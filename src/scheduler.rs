//! Sample acquisition scheduling.
//!
//! The timer's compare event is routed straight to the ADC's sample task and
//! the ADC's end event back to its start task, so once the timer is armed the
//! hardware samples at a fixed rate with no CPU involvement per sample. This
//! module owns the timer side of that loop and the bring-up sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::{
    capture::{AdcDriver, CaptureManager},
    error::{HardwareError, PipelineError},
};

/// A hardware timer that fires a compare event every `interval` and clears
/// itself on compare.
pub trait SampleTimer: Send + Sync {
    fn init(&self, interval: Duration) -> Result<(), HardwareError>;
    fn enable(&self);
    fn disable(&self);
    fn is_enabled(&self) -> bool;
}

/// Peripheral events that can be published on the interconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwEvent {
    TimerCompare,
    AdcEnd,
}

/// Peripheral tasks an interconnect channel can trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwTask {
    AdcSample,
    AdcStart,
}

/// Event-to-task interconnect (PPI/DPPI style)
pub trait EventRouter {
    /// Allocate a channel, wire `event` to `task` and enable it
    fn route(&mut self, event: HwEvent, task: HwTask) -> Result<(), HardwareError>;
}

pub struct Scheduler<T> {
    timer: T,
    interval: Duration,
    configured: AtomicBool,
}

impl<T: SampleTimer> Scheduler<T> {
    pub fn new(timer: T, interval: Duration) -> Self {
        Self {
            timer,
            interval,
            configured: AtomicBool::new(false),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Program the timer period. Does not start it.
    pub fn init_timer(&self) -> Result<(), PipelineError> {
        if let Err(source) = self.timer.init(self.interval) {
            error!(%source, "Timer init error");
            return Err(PipelineError::Init {
                stage: "timer",
                source,
            });
        }
        self.configured.store(true, Ordering::Release);
        debug!(interval_us = self.interval.as_micros() as u64, "Timer configured");
        Ok(())
    }

    /// Close the hardware loop: compare -> sample, end -> start
    pub fn connect<R: EventRouter>(&self, router: &mut R) -> Result<(), PipelineError> {
        for (event, task) in [
            (HwEvent::TimerCompare, HwTask::AdcSample),
            (HwEvent::AdcEnd, HwTask::AdcStart),
        ] {
            if let Err(source) = router.route(event, task) {
                error!(%source, ?event, ?task, "Interconnect setup error");
                return Err(PipelineError::Init {
                    stage: "interconnect",
                    source,
                });
            }
        }
        Ok(())
    }

    /// Arm the timer. Calling this while it is already running does nothing.
    pub fn start(&self) -> Result<(), PipelineError> {
        if !self.configured.load(Ordering::Acquire) {
            return Err(PipelineError::NotConfigured);
        }
        if self.timer.is_enabled() {
            debug!("Timer already armed");
            return Ok(());
        }
        self.timer.enable();
        info!("Sampling timer armed");
        Ok(())
    }

    pub fn stop(&self) {
        if self.timer.is_enabled() {
            self.timer.disable();
            info!("Sampling timer disarmed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_enabled()
    }
}

/// Bring the acquisition hardware up in order: timer, ADC, interconnect.
/// The first failure is logged and returned; later steps are never attempted.
pub fn bring_up<T, A, R>(
    manager: &mut CaptureManager<T>,
    adc: &mut A,
    router: &mut R,
) -> Result<(), PipelineError>
where
    T: SampleTimer,
    A: AdcDriver,
    R: EventRouter,
{
    let scheduler = manager.scheduler().clone();
    scheduler.init_timer()?;
    manager.configure(adc)?;
    scheduler.connect(router)?;
    info!("Acquisition hardware ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimRouter, SimTimer};

    #[test]
    fn start_is_idempotent() {
        let sched = Scheduler::new(SimTimer::new(), Duration::from_micros(333));
        sched.init_timer().unwrap();
        sched.start().unwrap();
        sched.start().unwrap();
        assert!(sched.is_running());
        assert_eq!(sched.timer().enable_count(), 1);
        sched.stop();
        assert!(!sched.is_running());
    }

    #[test]
    fn init_programs_interval() {
        let sched = Scheduler::new(SimTimer::new(), Duration::from_micros(333));
        sched.init_timer().unwrap();
        assert_eq!(sched.timer().interval(), sched.interval());
        assert!(!sched.is_running());
    }

    #[test]
    fn start_requires_init() {
        let sched = Scheduler::new(SimTimer::new(), Duration::from_micros(333));
        assert_eq!(sched.start(), Err(PipelineError::NotConfigured));
        assert!(!sched.is_running());
    }

    #[test]
    fn timer_failure_is_fatal() {
        let sched = Scheduler::new(SimTimer::new(), Duration::ZERO);
        assert!(matches!(
            sched.init_timer(),
            Err(PipelineError::Init { stage: "timer", .. })
        ));
        assert!(sched.start().is_err());
    }

    #[test]
    fn routes_both_channels() {
        let sched = Scheduler::new(SimTimer::new(), Duration::from_micros(333));
        let mut router = SimRouter::new(4);
        sched.connect(&mut router).unwrap();
        assert_eq!(
            router.routes(),
            &[
                (HwEvent::TimerCompare, HwTask::AdcSample),
                (HwEvent::AdcEnd, HwTask::AdcStart)
            ]
        );
    }

    #[test]
    fn routing_stops_at_first_failure() {
        let sched = Scheduler::new(SimTimer::new(), Duration::from_micros(333));
        let mut router = SimRouter::new(1);
        let err = sched.connect(&mut router).unwrap_err();
        assert_eq!(
            err,
            PipelineError::Init {
                stage: "interconnect",
                source: HardwareError::NoChannel
            }
        );
        assert_eq!(router.routes().len(), 1);
    }
}
