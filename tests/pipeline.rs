use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use epg_slurper::{
    capture::{BufferId, CaptureManager},
    command::{CommandDispatcher, Dispatch},
    device::DeviceConfigStore,
    exfil::TelemetryStager,
    monitoring::PipelineMonitor,
    scheduler::{bring_up, Scheduler},
    sim::{
        run_capture, LoggingFrontEnd, RecordingTransport, SignalSource, SimRouter, SimTimer,
        SimulatedAdc,
    },
    staging::{staging_slot, StagingConsumer},
    PipelineError, Sample,
};

struct Rig {
    manager: CaptureManager<SimTimer>,
    adc: SimulatedAdc,
    consumer: StagingConsumer,
    monitor: Arc<PipelineMonitor>,
}

fn rig(capacity: usize, pattern: Vec<Sample>) -> Rig {
    let timer = SimTimer::new();
    let scheduler = Arc::new(Scheduler::new(timer.clone(), Duration::from_micros(333)));
    let (producer, consumer) = staging_slot(capacity);
    let monitor = Arc::new(PipelineMonitor::new());
    let mut manager = CaptureManager::new(capacity, scheduler, producer, monitor.clone());
    let mut adc = SimulatedAdc::new(timer, SignalSource::sequence(pattern));
    bring_up(&mut manager, &mut adc, &mut SimRouter::new(2)).unwrap();
    Rig {
        manager,
        adc,
        consumer,
        monitor,
    }
}

/// Deliver ADC events until `n` blocks have completed
fn run_until(manager: &mut CaptureManager<SimTimer>, adc: &mut SimulatedAdc, n: u64) {
    while manager.completions() < n {
        let event = adc.next_event().expect("ADC stalled");
        manager.on_event(event, adc);
    }
}

impl Rig {
    fn advance(&mut self, n: u64) {
        run_until(&mut self.manager, &mut self.adc, n);
    }

    fn stager(&self, chunk: usize) -> TelemetryStager<RecordingTransport> {
        TelemetryStager::new(RecordingTransport::connected(), chunk, self.monitor.clone())
    }
}

fn unpack(chunks: &[Vec<u8>]) -> Vec<Sample> {
    chunks
        .concat()
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn pattern_block(len: usize) -> Vec<Sample> {
    [-100, 200, 7].iter().copied().cycle().take(len).collect()
}

#[test]
fn full_block_becomes_75_notifications() {
    let mut rig = rig(3000, vec![-100, 200, 7]);
    rig.advance(1);

    let stats = rig.manager.last_stats().unwrap();
    assert_eq!((stats.min, stats.max), (-100, 200));
    // 107000 / 3000 truncated
    assert_eq!(stats.mean, 35);

    let block = rig.consumer.try_recv().unwrap();
    assert_eq!(block.len(), 3000);
    assert_eq!(block.sequence(), 1);

    let mut stager = rig.stager(40);
    let report = stager.transmit(&block);
    assert_eq!(report.sent, 75);
    let chunks = stager.transport().chunks();
    assert!(chunks.iter().all(|c| c.len() == 80));
    assert_eq!(unpack(chunks), pattern_block(3000));
}

#[test]
fn ragged_block_ends_with_short_notification() {
    let mut rig = rig(3010, vec![-100, 200, 7]);
    rig.advance(1);
    let block = rig.consumer.try_recv().unwrap();
    let mut stager = rig.stager(40);
    assert_eq!(stager.transmit(&block).sent, 76);
    let chunks = stager.transport().chunks();
    assert_eq!(chunks[75].len(), 20);
    assert_eq!(unpack(chunks), pattern_block(3010));
}

#[test]
fn slow_stager_only_sees_latest_block() {
    let pattern: Vec<Sample> = (0..16).collect();
    let mut rig = rig(8, pattern);
    rig.advance(2);
    let block = rig.consumer.try_recv().unwrap();
    assert_eq!(block.sequence(), 2);
    assert_eq!(block.samples(), &[8, 9, 10, 11, 12, 13, 14, 15]);
    drop(block);
    assert!(rig.consumer.try_recv().is_none());
    assert_eq!(rig.monitor.snapshot().blocks_overwritten, 1);
}

#[test]
fn held_block_survives_new_captures() {
    let pattern: Vec<Sample> = (0..32).collect();
    let mut rig = rig(8, pattern);
    rig.advance(1);
    let held = rig.consumer.try_recv().unwrap();
    run_until(&mut rig.manager, &mut rig.adc, 3);
    // The block in hand is untouched while later captures land in the slot
    assert_eq!(held.samples(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    drop(held);
    assert_eq!(rig.consumer.try_recv().unwrap().sequence(), 3);
}

#[test]
fn buffers_alternate_through_the_driver() {
    let mut rig = rig(4, vec![1]);
    let mut order = Vec::new();
    while order.len() < 8 {
        let event = rig.adc.next_event().unwrap();
        if let epg_slurper::capture::AdcEvent::Done(ref buf) = event {
            order.push(buf.id());
        }
        rig.manager.on_event(event, &mut rig.adc);
    }
    let expected: Vec<_> = (0..8).map(BufferId::from_index).collect();
    assert_eq!(order, expected);
    assert_eq!(rig.monitor.snapshot().handoff_faults, 0);
}

#[test]
fn commands_do_not_disturb_capture() {
    let mut rig = rig(8, vec![3]);
    let store = Arc::new(DeviceConfigStore::default());
    let mut dispatcher =
        CommandDispatcher::new(store.clone(), LoggingFrontEnd::default(), rig.monitor.clone());

    rig.advance(1);
    assert!(matches!(dispatcher.on_command_received(b"P1:3"), Dispatch::Applied(_)));
    assert!(matches!(dispatcher.on_command_received(b"M:9"), Dispatch::Rejected(_)));
    rig.advance(3);

    assert_eq!(store.snapshot().pga_level(1), Some(3));
    assert_eq!(store.snapshot().mux, 0);
    assert_eq!(rig.consumer.try_recv().unwrap().samples(), &[3; 8]);
    let stats = rig.monitor.snapshot();
    assert_eq!(stats.blocks_captured, 3);
    assert_eq!((stats.commands_applied, stats.commands_rejected), (1, 1));
}

#[test]
fn bring_up_stops_at_first_failure() {
    let timer = SimTimer::new();
    let scheduler = Arc::new(Scheduler::new(timer.clone(), Duration::ZERO));
    let (producer, _consumer) = staging_slot(8);
    let mut manager = CaptureManager::new(8, scheduler, producer, Arc::new(PipelineMonitor::new()));
    let mut adc = SimulatedAdc::new(timer, SignalSource::sequence(vec![0]));
    let mut router = SimRouter::new(2);
    let err = bring_up(&mut manager, &mut adc, &mut router).unwrap_err();
    assert!(matches!(err, PipelineError::Init { stage: "timer", .. }));
    // Neither the ADC nor the interconnect were touched
    assert!(adc.next_event().is_none());
    assert!(router.routes().is_empty());
    assert!(manager.holds(BufferId::Ping) && manager.holds(BufferId::Pong));
}

#[test]
fn threaded_pipeline_streams_whole_blocks() {
    let pattern: Vec<Sample> = (0..80).collect();
    let Rig {
        mut manager,
        mut adc,
        consumer,
        monitor,
    } = rig(80, pattern.clone());
    let streaming = Arc::new(AtomicBool::new(true));

    let capture = {
        let streaming = streaming.clone();
        thread::spawn(move || {
            run_capture(&mut manager, &mut adc, &streaming);
            manager
        })
    };
    let stager = {
        let streaming = streaming.clone();
        let monitor = monitor.clone();
        thread::spawn(move || {
            let mut stager = TelemetryStager::new(RecordingTransport::connected(), 40, monitor);
            stager.run(&consumer, &streaming);
            stager.into_transport()
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while monitor.snapshot().chunks_sent < 20 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    streaming.store(false, Ordering::Release);
    let manager = capture.join().unwrap();
    let transport = stager.join().unwrap();

    assert!(!manager.scheduler().is_running());
    let chunks = transport.chunks();
    assert!(chunks.len() >= 20);
    // Each block leaves as exactly two chunks and is never torn
    assert_eq!(chunks.len() % 2, 0);
    for pair in chunks.chunks_exact(2) {
        assert_eq!(unpack(pair), pattern);
    }
}
