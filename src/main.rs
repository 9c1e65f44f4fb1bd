use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use epg_slurper::{
    args::{convert_filter, Args},
    capture::CaptureManager,
    command::CommandDispatcher,
    control::{control_channel, RX_QUEUE_CAPACITY},
    device::DeviceConfigStore,
    exfil::TelemetryStager,
    monitoring::PipelineMonitor,
    scheduler::{bring_up, Scheduler},
    sim::{
        run_capture, FileTransport, LoggingFrontEnd, PeerState, SignalSource, SimRouter, SimTimer,
        SimulatedAdc,
    },
    staging::staging_slot,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// How often the dispatcher drains the control queue
const CONTROL_POLL: Duration = Duration::from_millis(50);
/// How often the main loop wakes to check for shutdown and log counters
const STATS_PERIOD: Duration = Duration::from_secs(1);
const INTERCONNECT_CHANNELS: usize = 16;
/// Peak-to-peak noise on the simulated input, in ADC counts
const SIM_NOISE: i16 = 8;

/// Block until `cond` holds, checking `running` every `STATS_PERIOD`.
/// Returns false when interrupted.
fn wait_for(running: &AtomicBool, cond: impl Fn(Duration) -> bool) -> bool {
    while running.load(Ordering::Acquire) {
        if cond(STATS_PERIOD) {
            return true;
        }
    }
    false
}

fn recording_path(args: &Args) -> PathBuf {
    args.output.clone().unwrap_or_else(|| {
        PathBuf::from(format!("epg-{}.bin", Utc::now().format("%Y-%m-%dT%H-%M-%S")))
    })
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let cfg = args.stream_config();
    if let Err(e) = cfg.validate() {
        error!(%e, "Bad stream configuration");
        std::process::exit(1);
    }

    let monitor = Arc::new(PipelineMonitor::new());
    let store = Arc::new(DeviceConfigStore::default());
    let running = Arc::new(AtomicBool::new(true));

    {
        let running = running.clone();
        let store = store.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::Release);
            store.notify();
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }

    // Control channel: stdin stands in for the command characteristic
    let (mut rx, mut reader) = control_channel(RX_QUEUE_CAPACITY, monitor.clone());
    if args.auto_start {
        rx.on_rx(b"ON\rSTART\r");
    }
    thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 64];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for b in &mut buf[..n] {
                        if *b == b'\n' {
                            *b = b'\r';
                        }
                    }
                    rx.on_rx(&buf[..n]);
                }
                Err(e) => {
                    warn!(%e, "Control input closed");
                    break;
                }
            }
        }
    });

    let dispatcher = Arc::new(Mutex::new(CommandDispatcher::new(
        store.clone(),
        LoggingFrontEnd::default(),
        monitor.clone(),
    )));
    let control_handle = {
        let dispatcher = dispatcher.clone();
        let running = running.clone();
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                reader.poll(&mut *dispatcher.lock());
                thread::sleep(CONTROL_POLL);
            }
        })
    };

    info!("Waiting for ON");
    if !wait_for(&running, |t| store.wait_for_power_on(t)) {
        return shutdown(&running, control_handle, &monitor);
    }

    // Bring up the acquisition hardware
    let timer = SimTimer::new();
    let scheduler = Arc::new(Scheduler::new(timer.clone(), cfg.sample_interval()));
    let (producer, consumer) = staging_slot(cfg.buffer_capacity);
    let mut manager =
        CaptureManager::new(cfg.buffer_capacity, scheduler, producer, monitor.clone());
    let source = SignalSource::sine(
        args.signal_amplitude,
        args.signal_freq,
        cfg.sample_rate_hz,
        SIM_NOISE,
        args.seed,
    );
    let mut adc = SimulatedAdc::new(timer, source).paced(cfg.block_period());
    let mut router = SimRouter::new(INTERCONNECT_CHANNELS);
    if let Err(e) = bring_up(&mut manager, &mut adc, &mut router) {
        error!(%e, "Acquisition bring-up failed");
        std::process::exit(1);
    }
    dispatcher.lock().restore_defaults();

    info!("Waiting for START");
    if !wait_for(&running, |t| store.wait_for_streaming_armed(t)) {
        return shutdown(&running, control_handle, &monitor);
    }

    let path = recording_path(&args);
    let peer = PeerState::default();
    peer.set_connected(true);
    peer.set_notify_enabled(true);
    let transport = FileTransport::new(BufWriter::new(File::create(&path)?), peer);
    info!(path = %path.display(), "Recording notifications");

    let streaming = Arc::new(AtomicBool::new(true));
    let stager_handle = {
        let streaming = streaming.clone();
        let monitor = monitor.clone();
        let samples_per_chunk = cfg.samples_per_chunk;
        thread::spawn(move || {
            TelemetryStager::new(transport, samples_per_chunk, monitor).run(&consumer, &streaming)
        })
    };
    let capture_handle = {
        let streaming = streaming.clone();
        thread::spawn(move || run_capture(&mut manager, &mut adc, &streaming))
    };
    info!("Streaming");

    // Stream until OFF or ctrl-c
    while running.load(Ordering::Acquire) {
        if store.wait_for_power_off(STATS_PERIOD) {
            info!("Powered off");
            break;
        }
        debug!(stats = ?monitor.snapshot(), "Pipeline counters");
    }

    streaming.store(false, Ordering::Release);
    for (name, handle) in [("capture", capture_handle), ("stager", stager_handle)] {
        if handle.join().is_err() {
            error!(name, "Thread panicked");
        }
    }
    shutdown(&running, control_handle, &monitor)
}

fn shutdown(
    running: &AtomicBool,
    control: thread::JoinHandle<()>,
    monitor: &PipelineMonitor,
) -> std::io::Result<()> {
    running.store(false, Ordering::Release);
    if control.join().is_err() {
        error!("Control thread panicked");
    }
    info!(stats = ?monitor.snapshot(), "Exiting");
    Ok(())
}
