//! Integration tests driving the acquisition loop with scripted capabilities.

use gait_stim_agent::core::{
    AcquisitionLoop, ArbiterEvent, CycleAccumulator, FrameParser, Signal, StopReason, TickError,
    AP_AXIS,
};
use gait_stim_agent::sim::{GaitProfile, SimServer};
use gait_stim_agent::stimulator::{ChannelSet, DryRunStimulator, Stimulator, StimulatorError};
use gait_stim_agent::transport::{FetchError, Payload, RawFrame, TcpTransport, Transport, FORCE_KEY};
use gait_stim_agent::Config;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SAMPLES: usize = 5;

#[derive(Default)]
struct ScriptedTransport {
    responses: VecDeque<Result<Payload, FetchError>>,
    calls: usize,
}

impl ScriptedTransport {
    fn new(responses: Vec<Result<Payload, FetchError>>) -> Self {
        Self {
            responses: responses.into(),
            calls: 0,
        }
    }
}

impl Transport for ScriptedTransport {
    fn fetch(&mut self, _command: &[String]) -> Result<Payload, FetchError> {
        self.calls += 1;
        self.responses.pop_front().unwrap_or(Err(FetchError::Closed))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Start(Vec<u8>),
    Stop,
}

struct RecordingStimulator {
    active: bool,
    fail_start: bool,
    fail_stop: bool,
    panic_on_start: bool,
    calls: Vec<Call>,
}

impl RecordingStimulator {
    fn armed() -> Self {
        Self {
            active: true,
            fail_start: false,
            fail_stop: false,
            panic_on_start: false,
            calls: Vec::new(),
        }
    }

    fn disarmed() -> Self {
        Self {
            active: false,
            ..Self::armed()
        }
    }
}

impl Stimulator for RecordingStimulator {
    fn start(&mut self, channels: &ChannelSet) -> Result<(), StimulatorError> {
        if self.panic_on_start {
            panic!("driver fault");
        }
        if self.fail_start {
            return Err(StimulatorError::Device("start rejected".to_string()));
        }
        self.calls.push(Call::Start(channels.as_slice().to_vec()));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StimulatorError> {
        if self.fail_stop {
            return Err(StimulatorError::Device("stop rejected".to_string()));
        }
        self.calls.push(Call::Stop);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.retry.delay = Duration::ZERO;
    config
}

/// Two-plate frame with constant AP and vertical force per plate.
fn frame(ap: [f64; 2], vertical: [f64; 2]) -> RawFrame {
    let mut channels = vec![vec![0.0; SAMPLES]; 18];
    for plate in 0..2 {
        channels[plate * 9 + AP_AXIS] = vec![ap[plate]; SAMPLES];
        channels[plate * 9 + 2] = vec![vertical[plate]; SAMPLES];
    }
    RawFrame::new(channels)
}

fn ap(plate1: f64) -> Payload {
    Payload::force(frame([plate1, 0.0], [0.0, 0.0]))
}

fn vertical(plate1: f64) -> Payload {
    Payload::force(frame([0.0, 0.0], [plate1, 0.0]))
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

type TestLoop = AcquisitionLoop<ScriptedTransport, RecordingStimulator>;

fn test_loop(stimulator: RecordingStimulator) -> TestLoop {
    AcquisitionLoop::new(&config(), ScriptedTransport::default(), stimulator)
}

/// Drive plate 1 through `[-25, -22]` so group 0 starts at `t0 + 10ms`.
fn start_group_0(lp: &mut TestLoop, t0: Instant) {
    lp.process_payload(&ap(-25.0), t0).unwrap();
    let report = lp.process_payload(&ap(-22.0), t0 + ms(10)).unwrap();
    assert_eq!(report.events.len(), 1);
}

#[test]
fn test_rising_braking_force_starts_group() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let t0 = Instant::now();

    let report = lp.process_payload(&ap(-25.0), t0).unwrap();
    assert!(report.events.is_empty());

    let report = lp.process_payload(&ap(-22.0), t0 + ms(10)).unwrap();
    match &report.events[..] {
        [ArbiterEvent::Started {
            group,
            plate,
            channels,
        }] => {
            assert_eq!(*group, 0);
            assert_eq!(*plate, 1);
            assert_eq!(channels.as_slice(), &[1, 2, 3, 4]);
        }
        other => panic!("unexpected events: {other:?}"),
    }

    assert_eq!(lp.stimulator().calls, vec![Call::Start(vec![1, 2, 3, 4])]);
    assert!(lp.arbiter().is_stimulating(0));
    assert!(!lp.arbiter().is_stimulating(1));
    assert!(lp.status().is_stimulating(0));
}

#[test]
fn test_already_stimulating_group_is_not_restarted() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let t0 = Instant::now();
    start_group_0(&mut lp, t0);

    let report = lp.process_payload(&ap(-21.0), t0 + ms(20)).unwrap();
    assert!(report.events.is_empty());
    assert_eq!(lp.stimulator().calls.len(), 1);
}

#[test]
fn test_timeout_stops_without_new_data() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let t0 = Instant::now();
    start_group_0(&mut lp, t0);

    // Transport script is empty: every fetch fails and the tick is skipped.
    let err = lp.tick_at(t0 + ms(10) + ms(600)).unwrap_err();
    assert!(matches!(err, TickError::FetchExhausted { .. }));

    assert_eq!(
        lp.stimulator().calls,
        vec![Call::Start(vec![1, 2, 3, 4]), Call::Stop]
    );
    assert!(!lp.arbiter().is_stimulating(0));
    assert!(!lp.status().is_stimulating(0));
    assert_eq!(lp.status().stats().stimulations_stopped, 1);
}

#[test]
fn test_timeout_stops_regardless_of_force_trend() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let t0 = Instant::now();
    start_group_0(&mut lp, t0);

    // Still rising and still braking, well past the cap.
    let report = lp.process_payload(&ap(-21.0), t0 + ms(10) + ms(600)).unwrap();
    match &report.events[..] {
        [ArbiterEvent::Stopped { reason, .. }] => assert_eq!(*reason, StopReason::Timeout),
        other => panic!("unexpected events: {other:?}"),
    }
    assert!(!lp.arbiter().is_stimulating(0));
}

#[test]
fn test_no_timeout_before_cap() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let t0 = Instant::now();
    start_group_0(&mut lp, t0);

    assert!(lp.tick_at(t0 + ms(10) + ms(400)).is_err());
    assert!(lp.arbiter().is_stimulating(0));
    assert_eq!(lp.stimulator().calls.len(), 1);
}

#[test]
fn test_inactive_stimulator_never_starts() {
    let mut lp = test_loop(RecordingStimulator::disarmed());
    let t0 = Instant::now();

    for (i, value) in [-30.0, -28.0, -25.0, -22.0, -21.0].into_iter().enumerate() {
        lp.process_payload(&ap(value), t0 + ms(10 * i as u64)).unwrap();
    }

    assert!(lp.stimulator().calls.is_empty());
    assert!(!lp.arbiter().any_stimulating());
}

#[test]
fn test_release_waits_for_minimum_duration() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let t0 = Instant::now();
    start_group_0(&mut lp, t0);
    let started = t0 + ms(10);

    // Propulsive and falling, but only 100 ms in.
    lp.process_payload(&ap(30.0), started + ms(50)).unwrap();
    let report = lp.process_payload(&ap(20.0), started + ms(100)).unwrap();
    assert!(report.events.is_empty());
    assert!(lp.arbiter().is_stimulating(0));

    let report = lp.process_payload(&ap(15.0), started + ms(250)).unwrap();
    match &report.events[..] {
        [ArbiterEvent::Stopped { reason, .. }] => assert_eq!(*reason, StopReason::Released),
        other => panic!("unexpected events: {other:?}"),
    }
    assert_eq!(lp.stimulator().calls.last(), Some(&Call::Stop));
}

#[test]
fn test_one_group_owns_the_stimulator_at_a_time() {
    let mut lp = AcquisitionLoop::new(
        &config(),
        ScriptedTransport::default(),
        DryRunStimulator::new(Vec::new(), true),
    );
    let t0 = Instant::now();
    let force = |ap: [f64; 2]| Payload::force(frame(ap, [0.0, 0.0]));

    // Both plates qualify on the same tick; plate 1 is evaluated first and wins.
    lp.process_payload(&force([-25.0, -25.0]), t0).unwrap();
    let report = lp.process_payload(&force([-22.0, -22.0]), t0 + ms(10)).unwrap();
    assert_eq!(report.events.len(), 1);
    assert_eq!(lp.arbiter().active_group(), Some(0));
    assert_eq!(
        lp.stimulator().running().map(ChannelSet::as_slice),
        Some(&[1, 2, 3, 4][..])
    );
    assert!(!lp.status().is_stimulating(1));

    // Plate 1 releases, then plate 2 (still braking, now rising) takes over.
    lp.process_payload(&force([30.0, -22.0]), t0 + ms(100)).unwrap();
    let report = lp.process_payload(&force([20.0, -21.0]), t0 + ms(300)).unwrap();
    assert!(matches!(
        report.events[..],
        [
            ArbiterEvent::Stopped { group: 0, .. },
            ArbiterEvent::Started { group: 1, .. }
        ]
    ));

    assert_eq!(lp.arbiter().active_group(), Some(1));
    assert_eq!(
        lp.stimulator().running().map(ChannelSet::as_slice),
        Some(&[5, 6, 7, 8][..])
    );
    assert!(!lp.status().is_stimulating(0));
    assert!(lp.status().is_stimulating(1));

    // A timeout stop leaves neither the device nor any group running.
    assert!(lp.tick_at(t0 + ms(300) + ms(600)).is_err());
    assert!(lp.stimulator().running().is_none());
    assert!(!lp.arbiter().any_stimulating());
    assert_eq!(lp.status().stats().stimulating, vec![false, false]);
}

#[test]
fn test_failed_start_keeps_idle_and_retries_next_tick() {
    let mut stimulator = RecordingStimulator::armed();
    stimulator.fail_start = true;
    let mut lp = test_loop(stimulator);
    let t0 = Instant::now();

    lp.process_payload(&ap(-25.0), t0).unwrap();
    let report = lp.process_payload(&ap(-22.0), t0 + ms(10)).unwrap();
    assert!(matches!(report.events[..], [ArbiterEvent::Failed { .. }]));
    assert!(!lp.arbiter().is_stimulating(0));
    assert_eq!(lp.status().stats().capability_failures, 1);

    lp.stimulator_mut().fail_start = false;
    let report = lp.process_payload(&ap(-21.0), t0 + ms(20)).unwrap();
    assert!(matches!(report.events[..], [ArbiterEvent::Started { .. }]));
    assert!(lp.arbiter().is_stimulating(0));
}

#[test]
fn test_failed_stop_keeps_stimulating_until_stop_succeeds() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let t0 = Instant::now();
    start_group_0(&mut lp, t0);

    lp.stimulator_mut().fail_stop = true;
    assert!(lp.tick_at(t0 + ms(700)).is_err());
    assert!(lp.arbiter().is_stimulating(0));
    assert_eq!(lp.status().stats().capability_failures, 1);

    lp.stimulator_mut().fail_stop = false;
    assert!(lp.tick_at(t0 + ms(710)).is_err());
    assert!(!lp.arbiter().is_stimulating(0));
    assert_eq!(lp.stimulator().calls.last(), Some(&Call::Stop));
}

#[test]
fn test_cycle_boundary_on_upward_threshold_crossing() {
    let (tx, rx) = crossbeam_channel::bounded(4);
    let mut lp = test_loop(RecordingStimulator::armed()).with_cycle_sink(tx);
    let t0 = Instant::now();

    let report = lp.process_payload(&vertical(20.0), t0).unwrap();
    assert_eq!(report.cycle, None);
    assert_eq!(lp.accumulator().buffer().sample_count(1), SAMPLES);

    let report = lp.process_payload(&vertical(35.0), t0 + ms(10)).unwrap();
    assert_eq!(report.cycle, Some(1));

    // The completed cycle holds the first tick; the second starts the next one.
    let cycle = rx.try_recv().unwrap();
    assert_eq!(cycle.index, 1);
    assert_eq!(cycle.ticks, 1);
    assert_eq!(cycle.buffer.sample_count(1), SAMPLES);
    assert_eq!(lp.accumulator().buffer().sample_count(1), SAMPLES);
    assert_eq!(lp.accumulator().ticks_in_cycle(), 1);
    assert_eq!(lp.status().stats().cycles_completed, 1);
}

#[test]
fn test_empty_buffer_never_starts_a_cycle() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let report = lp.process_payload(&vertical(100.0), Instant::now()).unwrap();
    assert_eq!(report.cycle, None);
    assert_eq!(lp.accumulator().cycles_completed(), 0);
}

#[test]
fn test_no_boundary_while_above_threshold() {
    let mut lp = test_loop(RecordingStimulator::armed());
    let t0 = Instant::now();
    for (i, value) in [20.0, 35.0, 40.0, 50.0].into_iter().enumerate() {
        lp.process_payload(&vertical(value), t0 + ms(10 * i as u64)).unwrap();
    }
    assert_eq!(lp.accumulator().cycles_completed(), 1);
}

#[test]
fn test_full_cycle_queue_drops_without_blocking() {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let mut lp = test_loop(RecordingStimulator::armed()).with_cycle_sink(tx);
    let t0 = Instant::now();

    for (i, value) in [20.0, 35.0, 10.0, 35.0].into_iter().enumerate() {
        lp.process_payload(&vertical(value), t0 + ms(10 * i as u64)).unwrap();
    }

    assert_eq!(lp.status().stats().cycles_completed, 2);
    assert_eq!(rx.len(), 1);
    assert_eq!(rx.try_recv().unwrap().index, 1);
}

#[test]
fn test_no_data_and_malformed_frames_leave_buffer_untouched() {
    let script = vec![
        Ok(Payload::default()),
        Ok(Payload::force(RawFrame::new(vec![Vec::new(); 18]))),
        Ok(Payload::force(RawFrame::new(vec![vec![1.0]; 12]))),
    ];
    let mut lp = AcquisitionLoop::new(
        &config(),
        ScriptedTransport::new(script),
        RecordingStimulator::armed(),
    );
    let t0 = Instant::now();

    assert!(matches!(lp.tick_at(t0), Err(TickError::NoData)));
    assert!(matches!(lp.tick_at(t0), Err(TickError::NoData)));
    assert!(matches!(lp.tick_at(t0), Err(TickError::Malformed(_))));

    assert!(lp.accumulator().buffer().is_empty());
    let stats = lp.status().stats();
    assert_eq!(stats.skipped_ticks, 3);
    assert_eq!(stats.malformed_frames, 1);
    assert_eq!(stats.processed_ticks, 0);
}

#[test]
fn test_retry_is_bounded() {
    let mut lp = AcquisitionLoop::new(
        &config(),
        ScriptedTransport::new(vec![
            Err(FetchError::Closed),
            Err(FetchError::Closed),
            Ok(ap(-25.0)),
        ]),
        RecordingStimulator::armed(),
    );
    assert!(lp.tick_at(Instant::now()).is_ok());
    assert_eq!(lp.transport_mut().calls, 3);

    let err = lp.tick_at(Instant::now()).unwrap_err();
    assert!(matches!(err, TickError::FetchExhausted { attempts: 3, .. }));
    assert_eq!(lp.transport_mut().calls, 6);
}

#[test]
fn test_shutdown_stops_running_groups() {
    let mut lp = test_loop(RecordingStimulator::armed());
    start_group_0(&mut lp, Instant::now());

    let status = Arc::clone(lp.status());
    let stimulator = lp.shutdown();
    assert_eq!(stimulator.calls.last(), Some(&Call::Stop));
    assert!(!status.is_stimulating(0));
}

#[test]
fn test_append_preserves_order_across_ticks() {
    let parser = FrameParser::new(2);
    let first: Vec<Vec<f64>> = (0..18).map(|c| vec![c as f64, c as f64 + 0.5]).collect();
    let second: Vec<Vec<f64>> = (0..18).map(|c| vec![c as f64 + 0.25]).collect();
    let joined: Vec<Vec<f64>> = first
        .iter()
        .zip(&second)
        .map(|(a, b)| a.iter().chain(b).copied().collect())
        .collect();

    let mut split = CycleAccumulator::new(1);
    split.append(&parser.parse(&RawFrame::new(first)).unwrap());
    split.append(&parser.parse(&RawFrame::new(second)).unwrap());

    let mut whole = CycleAccumulator::new(1);
    whole.append(&parser.parse(&RawFrame::new(joined)).unwrap());

    assert_eq!(split.buffer(), whole.buffer());
    assert_eq!(
        split.buffer().block(2, Signal::Cop).unwrap().row(0),
        &[15.0, 15.5, 15.25]
    );
}

#[test]
fn test_panicking_stimulator_does_not_stop_loop() {
    let mut config = config();
    config.read_frequency_hz = 1000.0;

    let mut stimulator = RecordingStimulator::armed();
    stimulator.panic_on_start = true;
    let script = vec![Ok(ap(-25.0)), Ok(ap(-22.0)), Ok(ap(-21.0))];
    let lp = AcquisitionLoop::new(&config, ScriptedTransport::new(script), stimulator);
    let status = Arc::clone(lp.status());

    let running = Arc::new(AtomicBool::new(true));
    let handle = lp.spawn(Arc::clone(&running)).unwrap();
    thread::sleep(ms(100));
    running.store(false, Ordering::SeqCst);
    let lp = handle.join().unwrap();

    let stats = status.stats();
    assert!(stats.panics >= 1);
    assert!(stats.ticks > stats.panics);
    assert!(!lp.arbiter().is_stimulating(0));
}

#[test]
fn test_tcp_transport_against_simulator() {
    let server = SimServer::bind("127.0.0.1:0", GaitProfile::default()).unwrap();
    let addr = server.local_addr().unwrap();
    let running = Arc::new(AtomicBool::new(true));
    let server_handle = server.spawn(Arc::clone(&running)).unwrap();

    let mut transport = TcpTransport::connect(addr).unwrap();
    let payload = transport.fetch(&[FORCE_KEY.to_string()]).unwrap();
    let frame = payload.frame(FORCE_KEY).unwrap();
    assert_eq!(frame.len(), 18);
    assert!(frame.channels().iter().all(|c| c.len() == 10));

    let payload = transport.fetch(&["Moment".to_string()]).unwrap();
    assert!(payload.frame(FORCE_KEY).is_none());

    let mut config = config();
    config.transport.port = addr.port();
    let mut lp = AcquisitionLoop::new(
        &config,
        transport,
        DryRunStimulator::new(Vec::new(), false),
    );
    for _ in 0..5 {
        lp.tick_at(Instant::now()).unwrap();
    }
    assert_eq!(lp.status().stats().processed_ticks, 5);
    assert_eq!(lp.accumulator().buffer().sample_count(1), 50);
    assert_eq!(lp.stimulator().start_count(), 0);

    drop(lp);
    running.store(false, Ordering::SeqCst);
    server_handle.join().unwrap().unwrap();
}
