//! Synthetic force-plate server.
//!
//! Generates a walking pattern across the configured plates, each plate
//! loaded for the stance part of the stride and offset by half a stride from
//! the previous one, and serves it with the same newline-delimited JSON
//! exchange as the real acquisition server.

use crate::core::frame::{Signal, AP_AXIS, CHANNELS_PER_PLATE, VERTICAL_AXIS};
use crate::transport::{Payload, RawFrame, FORCE_KEY};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Shape of the simulated gait.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GaitProfile {
    pub plate_count: usize,
    /// Samples returned per request
    pub samples_per_tick: usize,
    /// Simulated acquisition rate
    pub sample_rate_hz: f64,
    /// Strides per second
    pub cadence_hz: f64,
    /// Fraction of the stride a plate is loaded
    pub stance_fraction: f64,
    /// Peak vertical force (N)
    pub peak_vertical_n: f64,
    /// Peak braking/propulsive force (N)
    pub peak_ap_n: f64,
}

impl Default for GaitProfile {
    fn default() -> Self {
        Self {
            plate_count: 2,
            samples_per_tick: 10,
            sample_rate_hz: 1000.0,
            cadence_hz: 1.0,
            stance_fraction: 0.6,
            peak_vertical_n: 700.0,
            peak_ap_n: 150.0,
        }
    }
}

/// Deterministic frame generator.
#[derive(Debug, Clone)]
pub struct GaitSimulator {
    profile: GaitProfile,
    sample_index: u64,
}

impl GaitSimulator {
    pub fn new(profile: GaitProfile) -> Self {
        Self {
            profile,
            sample_index: 0,
        }
    }

    pub fn profile(&self) -> &GaitProfile {
        &self.profile
    }

    /// Samples generated so far.
    pub fn samples_generated(&self) -> u64 {
        self.sample_index
    }

    /// Position in the stride, in `[0, 1)`, of `plate` at sample `index`.
    fn stride_phase(&self, plate: usize, index: u64) -> f64 {
        let t = index as f64 / self.profile.sample_rate_hz;
        let offset = 0.5 * (plate - 1) as f64;
        (t * self.profile.cadence_hz + offset).rem_euclid(1.0)
    }

    /// One sample of all nine channels of a plate.
    fn plate_sample(&self, plate: usize, index: u64) -> [f64; CHANNELS_PER_PLATE] {
        let mut channels = [0.0; CHANNELS_PER_PLATE];
        let phase = self.stride_phase(plate, index);
        let stance = self.profile.stance_fraction;
        if phase >= stance {
            return channels;
        }

        let progress = phase / stance;
        let vertical = self.profile.peak_vertical_n * (PI * progress).sin();
        // Braking first, then propulsion.
        let ap = -self.profile.peak_ap_n * (2.0 * PI * progress).sin();

        let force = Signal::Force.offset();
        channels[force + AP_AXIS] = ap;
        channels[force + VERTICAL_AXIS] = vertical;

        let cop = Signal::Cop.offset();
        channels[cop + AP_AXIS] = -0.1 + 0.25 * progress;

        let moment = Signal::Moment.offset();
        channels[moment + 1] = vertical * channels[cop + AP_AXIS];

        channels
    }

    /// Produce the next tick's frame.
    pub fn next_frame(&mut self) -> RawFrame {
        let samples = self.profile.samples_per_tick;
        let mut channels = vec![Vec::with_capacity(samples); self.profile.plate_count * CHANNELS_PER_PLATE];

        for i in 0..samples as u64 {
            let index = self.sample_index + i;
            for plate in 1..=self.profile.plate_count {
                let base = (plate - 1) * CHANNELS_PER_PLATE;
                for (c, value) in self.plate_sample(plate, index).into_iter().enumerate() {
                    channels[base + c].push(value);
                }
            }
        }

        self.sample_index += samples as u64;
        RawFrame::new(channels)
    }
}

#[derive(Deserialize)]
struct Request {
    command: Vec<String>,
}

/// TCP server answering force requests from a shared [`GaitSimulator`].
pub struct SimServer {
    listener: TcpListener,
    simulator: Arc<Mutex<GaitSimulator>>,
}

impl SimServer {
    /// Bind to `addr`; port 0 picks an ephemeral port.
    pub fn bind<A: ToSocketAddrs>(addr: A, profile: GaitProfile) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            simulator: Arc::new(Mutex::new(GaitSimulator::new(profile))),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `running` is cleared.
    pub fn serve(self, running: Arc<AtomicBool>) -> std::io::Result<()> {
        self.listener.set_nonblocking(true)?;
        tracing::info!(addr = %self.listener.local_addr()?, "simulated force-plate server listening");

        while running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "client connected");
                    let simulator = Arc::clone(&self.simulator);
                    thread::Builder::new()
                        .name("sim-client".to_string())
                        .spawn(move || {
                            if let Err(e) = handle_client(stream, &simulator) {
                                tracing::debug!(%peer, error = %e, "client connection ended");
                            }
                            tracing::info!(%peer, "client disconnected");
                        })?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Serve on a background thread.
    pub fn spawn(self, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<std::io::Result<()>>> {
        thread::Builder::new()
            .name("sim-server".to_string())
            .spawn(move || self.serve(running))
    }
}

fn handle_client(stream: TcpStream, simulator: &Mutex<GaitSimulator>) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }

        let payload = match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) if request.command.iter().any(|c| c == FORCE_KEY) => {
                let mut simulator = simulator.lock().unwrap_or_else(|e| e.into_inner());
                Payload::force(simulator.next_frame())
            }
            Ok(_) => Payload::default(),
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                Payload::default()
            }
        };

        let mut response = serde_json::to_vec(&payload)?;
        response.push(b'\n');
        writer.write_all(&response)?;
    }
}
