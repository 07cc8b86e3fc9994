//! Backend facade tying both endpoints to the host mixing engine.
//!
//! [`AudioDriver`] owns the output and input endpoints, the shared sample
//! buffers exchanged with the mixing engine, and the single mutex guarding
//! everything reachable from a platform callback. The real-time callbacks,
//! the topology event watch and every host-thread operation all take that
//! mutex for their whole critical section: reconfiguration can briefly block
//! a callback, but no data race between the host and the platform threads is
//! possible.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::endpoint::StreamEndpoint;
use crate::error::Result;
use crate::ring::CaptureRing;
use crate::subsystem::{AudioSubsystem, DeviceEvent, Direction, StreamFormat};

/// Hooks into the host mixing engine, invoked from the real-time callbacks
/// under the facade mutex. Implementations must not block.
pub trait Mixer: Send {
    /// Produce `frames` interleaved frames of mixed signed 32-bit audio at
    /// the output endpoint's negotiated channel count into `out`.
    fn render(&mut self, frames: usize, out: &mut [i32]);

    /// `frames` captured frames were appended to the capture ring, ending at
    /// its current write cursor.
    fn captured(&mut self, _frames: usize) {}
}

/// Speaker layout derived from the output endpoint's negotiated channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeakerMode {
    Stereo,
    Surround31,
    Surround51,
    Surround71,
}

impl SpeakerMode {
    pub fn from_channels(channels: u16) -> Self {
        match channels {
            4 => SpeakerMode::Surround31,
            6 => SpeakerMode::Surround51,
            8 => SpeakerMode::Surround71,
            _ => SpeakerMode::Stereo,
        }
    }
}

/// Sample buffers exchanged with the mixing engine, sized by negotiation.
pub(crate) struct SharedBuffers {
    /// Intermediate mix buffer the output callback renders into.
    pub mix: Vec<i32>,
    /// Capture ring the input callback appends to.
    pub capture: CaptureRing,
}

/// Everything the facade mutex guards.
pub(crate) struct DriverState {
    subsystem: Arc<dyn AudioSubsystem>,
    pub output: StreamEndpoint,
    pub input: StreamEndpoint,
    pub buffers: SharedBuffers,
    mixer: Box<dyn Mixer>,
}

impl DriverState {
    fn endpoint(&self, direction: Direction) -> &StreamEndpoint {
        match direction {
            Direction::Output => &self.output,
            Direction::Input => &self.input,
        }
    }

    fn endpoint_mut(&mut self, direction: Direction) -> (&mut StreamEndpoint, &mut SharedBuffers) {
        match direction {
            Direction::Output => (&mut self.output, &mut self.buffers),
            Direction::Input => (&mut self.input, &mut self.buffers),
        }
    }

    /// The rate constraint handed to `update_spec`: input adopts output's
    /// negotiated rate, output negotiates freely.
    fn output_rate_for(&self, direction: Direction) -> Result<Option<u32>> {
        match direction {
            Direction::Output => Ok(None),
            Direction::Input => {
                if !self.output.has_negotiated() {
                    return Err(crate::error::BackendError::OutputNotInitialized);
                }
                Ok(Some(self.output.spec().sample_rate))
            }
        }
    }

    fn init_endpoint(&mut self, direction: Direction) -> Result<()> {
        let output_rate = self.output_rate_for(direction)?;
        let (endpoint, buffers) = self.endpoint_mut(direction);
        endpoint.init(buffers, output_rate)
    }

    fn set_endpoint_device(&mut self, direction: Direction, name: &str) -> Result<()> {
        let output_rate = self.output_rate_for(direction)?;
        let (endpoint, buffers) = self.endpoint_mut(direction);
        endpoint.set_device_name(name, buffers, output_rate)
    }

    /// Topology/format notification for one endpoint, delivered by the
    /// platform on its own thread. Runs under the facade mutex.
    pub(crate) fn handle_device_event(&mut self, direction: Direction, event: &DeviceEvent) {
        match *event {
            DeviceEvent::FormatChanged { device } => {
                let endpoint = self.endpoint(direction);
                if !endpoint.is_active() || endpoint.device_id() != device {
                    return;
                }
                info!("Device format changed, renegotiating {:?}", direction);
                let Ok(output_rate) = self.output_rate_for(direction) else {
                    return;
                };
                let (endpoint, buffers) = self.endpoint_mut(direction);
                let id = endpoint.device_id();
                if let Err(e) = endpoint.update_spec(id, buffers, output_rate) {
                    error!("Failed to adopt changed device format: {}", e);
                }
            }
            DeviceEvent::Removed { device } => {
                let endpoint = self.endpoint(direction);
                if !endpoint.is_active() || endpoint.device_id() != device {
                    return;
                }
                info!("{:?} device removed, falling back to default", direction);
                let Ok(output_rate) = self.output_rate_for(direction) else {
                    return;
                };
                let (endpoint, buffers) = self.endpoint_mut(direction);
                endpoint.stop();
                endpoint.reset_to_default();
                if let Err(e) = endpoint
                    .init(buffers, output_rate)
                    .and_then(|_| endpoint.start())
                {
                    error!("Failed to recover on the default device: {}", e);
                }
            }
        }
    }

    /// Output data callback body: the device wants `requested` more samples.
    pub(crate) fn output_wants(&mut self, mut requested: usize) {
        let stream = self.output.stream_id();
        if stream == 0 || self.buffers.mix.is_empty() {
            return;
        }
        let frame_samples = self.output.spec().frame_samples();
        if frame_samples == 0 {
            return;
        }

        while requested > 0 {
            let len = requested.min(self.buffers.mix.len());
            self.mixer.render(len / frame_samples, &mut self.buffers.mix[..len]);
            if let Err(e) = self.subsystem.put_stream_data(stream, &self.buffers.mix[..len]) {
                error!("Failed to push mixed samples: {}", e);
                return;
            }
            requested -= len;
        }
    }

    /// Input data callback body: `available` converted samples are waiting.
    pub(crate) fn input_has(&mut self, available: usize) {
        let stream = self.input.stream_id();
        if stream == 0 {
            return;
        }

        let subsystem = self.subsystem.clone();
        let written = self.buffers.capture.fill_from(|chunk| {
            match subsystem.get_stream_data(stream, chunk) {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to read captured samples: {}", e);
                    0
                }
            }
        });

        if written < available {
            warn!("Capture ring buffer isn't large enough to absorb all the data.");
        }

        let frame_samples = self.input.spec().frame_samples();
        if frame_samples > 0 {
            self.mixer.captured(written / frame_samples);
        }
    }
}

/// The audio backend driver: one instance per audio session.
pub struct AudioDriver {
    subsystem: Arc<dyn AudioSubsystem>,
    shared: Arc<Mutex<DriverState>>,
}

impl AudioDriver {
    /// Build a driver over a platform subsystem and the host's mixer hooks.
    /// Nothing touches the hardware until [`init`](Self::init).
    pub fn new(subsystem: Arc<dyn AudioSubsystem>, mixer: Box<dyn Mixer>) -> Self {
        let shared = Arc::new_cyclic(|weak| {
            Mutex::new(DriverState {
                subsystem: subsystem.clone(),
                output: StreamEndpoint::new(Direction::Output, subsystem.clone(), weak.clone()),
                input: StreamEndpoint::new(Direction::Input, subsystem.clone(), weak.clone()),
                buffers: SharedBuffers {
                    mix: Vec::new(),
                    capture: CaptureRing::default(),
                },
                mixer,
            })
        });
        Self { subsystem, shared }
    }

    /// Backend identifier, e.g. "cpal".
    pub fn name(&self) -> &'static str {
        self.subsystem.name()
    }

    /// Start the platform subsystem and initialize the output endpoint.
    /// Input stays uninitialized until [`input_start`](Self::input_start).
    ///
    /// # Errors
    /// Fails if the subsystem cannot start or output negotiation fails; in
    /// the latter case the subsystem is shut back down.
    pub fn init(&self) -> Result<()> {
        self.subsystem.startup()?;

        let mut state = self.shared.lock();
        if let Err(e) = state.init_endpoint(Direction::Output) {
            drop(state);
            self.subsystem.shutdown();
            return Err(e);
        }
        Ok(())
    }

    /// Begin active output transfer.
    pub fn start(&self) -> Result<()> {
        self.shared.lock().output.start()
    }

    /// The sample rate the mixing engine must produce at.
    pub fn mix_rate(&self) -> u32 {
        self.shared.lock().output.spec().sample_rate
    }

    /// Speaker layout for the negotiated output channel count.
    pub fn speaker_mode(&self) -> SpeakerMode {
        SpeakerMode::from_channels(self.shared.lock().output.spec().channels)
    }

    /// Latency reporting is not supported by this backend.
    pub fn latency(&self) -> f32 {
        0.0
    }

    /// Enter the shared critical section. The mixing engine holds the
    /// returned guard while exchanging buffers with the callbacks.
    pub fn lock(&self) -> DriverLock<'_> {
        DriverLock {
            guard: self.shared.lock(),
        }
    }

    /// Tear down both endpoints, then stop the platform subsystem. Runs
    /// automatically on drop; calling it again is harmless.
    pub fn finish(&self) {
        let mut state = self.shared.lock();
        state.output.finish();
        state.input.finish();
        drop(state);
        self.subsystem.shutdown();
    }

    pub fn output_devices(&self) -> Vec<String> {
        let _state = self.shared.lock();
        StreamEndpoint::device_list(&self.subsystem, Direction::Output)
    }

    pub fn output_device(&self) -> String {
        self.shared.lock().output.device_name().to_string()
    }

    pub fn set_output_device(&self, name: &str) -> Result<()> {
        self.shared.lock().set_endpoint_device(Direction::Output, name)
    }

    /// Lazily initialize and start the input endpoint. Requires output to
    /// have negotiated first (input adopts its sample rate).
    pub fn input_start(&self) -> Result<()> {
        let mut state = self.shared.lock();
        state.init_endpoint(Direction::Input)?;
        state.input.start()
    }

    /// Stop capturing. The input stream is retained for a later restart.
    pub fn input_stop(&self) {
        self.shared.lock().input.stop();
    }

    pub fn input_devices(&self) -> Vec<String> {
        let _state = self.shared.lock();
        StreamEndpoint::device_list(&self.subsystem, Direction::Input)
    }

    pub fn input_device(&self) -> String {
        self.shared.lock().input.device_name().to_string()
    }

    pub fn set_input_device(&self, name: &str) -> Result<()> {
        self.shared.lock().set_endpoint_device(Direction::Input, name)
    }
}

impl Drop for AudioDriver {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Guard over the shared state, handed to the mixing engine for buffer
/// handoff. Dropping it leaves the critical section.
pub struct DriverLock<'a> {
    guard: MutexGuard<'a, DriverState>,
}

impl DriverLock<'_> {
    /// The output endpoint's negotiated format.
    pub fn output_format(&self) -> StreamFormat {
        self.guard.output.spec()
    }

    /// The input endpoint's negotiated format.
    pub fn input_format(&self) -> StreamFormat {
        self.guard.input.spec()
    }

    /// Captured samples, valid up to the ring capacity.
    pub fn capture_ring(&self) -> &[i32] {
        self.guard.buffers.capture.samples()
    }

    /// Current write cursor into the capture ring.
    pub fn capture_position(&self) -> usize {
        self.guard.buffers.capture.position()
    }

    /// Capture ring capacity in samples.
    pub fn capture_capacity(&self) -> usize {
        self.guard.buffers.capture.capacity()
    }
}
