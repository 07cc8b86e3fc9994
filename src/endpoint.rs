//! Per-direction stream endpoint management.
//!
//! One [`StreamEndpoint`] handles one direction of audio flow: it resolves
//! and opens the target device, negotiates the format the engine will see,
//! owns the conversion stream bridging to the hardware format, and reacts to
//! topology and format notifications. Output and input endpoints are
//! independent except that input always adopts output's negotiated sample
//! rate, so output must negotiate first.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::driver::{DriverState, SharedBuffers};
use crate::error::{BackendError, Result};
use crate::handle::{DeviceHandle, StreamHandle};
use crate::subsystem::{
    AudioSubsystem, DEFAULT_DEVICE_NAME, DataCallback, DeviceEvent, DeviceId, Direction,
    EventWatch, SampleFormat, StreamFormat, StreamId, WatchId,
};

pub(crate) struct StreamEndpoint {
    direction: Direction,
    device_name: String,
    spec: StreamFormat,
    device: DeviceHandle,
    stream: StreamHandle,
    watch: Option<WatchId>,
    subsystem: Arc<dyn AudioSubsystem>,
    shared: Weak<Mutex<DriverState>>,
}

impl StreamEndpoint {
    pub fn new(
        direction: Direction,
        subsystem: Arc<dyn AudioSubsystem>,
        shared: Weak<Mutex<DriverState>>,
    ) -> Self {
        Self {
            direction,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            spec: StreamFormat::default(),
            device: DeviceHandle::unopened(subsystem.clone()),
            stream: StreamHandle::absent(subsystem.clone()),
            watch: None,
            subsystem,
            shared,
        }
    }

    pub fn spec(&self) -> StreamFormat {
        self.spec
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn is_active(&self) -> bool {
        self.device.is_opened()
    }

    /// Whether a format was ever negotiated. Survives `stop`, which closes
    /// the device but keeps the spec and stream for restart.
    pub fn has_negotiated(&self) -> bool {
        self.spec.sample_rate != 0
    }

    /// Open the target device and negotiate. On any failure the temporary
    /// device handle rolls back and previously committed state is untouched.
    ///
    /// `output_rate` carries the output endpoint's negotiated rate when this
    /// endpoint is the input side.
    pub fn init(&mut self, buffers: &mut SharedBuffers, output_rate: Option<u32>) -> Result<()> {
        if self.watch.is_none() {
            let watch = self.make_event_watch();
            self.watch = Some(self.subsystem.add_event_watch(watch)?);
        }

        let target = self.resolve_device_id()?;
        let device = DeviceHandle::open(self.subsystem.clone(), target, self.direction)?;
        self.update_spec(device.id(), buffers, output_rate)?;

        // Only commit once negotiation succeeded; this also closes whatever
        // the endpoint held before.
        self.device = device;
        Ok(())
    }

    /// Query the hardware format (single authoritative read), apply the
    /// negotiation policy, create or reformat the conversion stream, and
    /// republish the derived buffer sizes.
    pub fn update_spec(
        &mut self,
        device: DeviceId,
        buffers: &mut SharedBuffers,
        output_rate: Option<u32>,
    ) -> Result<()> {
        let hw = self.subsystem.device_format(device)?;
        let mut spec = hw.format;

        match self.direction {
            Direction::Input => {
                // Duplex symmetry: capture runs at whatever rate output
                // already negotiated, and is always delivered as stereo.
                spec.sample_rate = output_rate.ok_or(BackendError::OutputNotInitialized)?;
                spec.channels = 2;
            }
            Direction::Output => {
                // The engine always mixes an even number of channels.
                if spec.channels % 2 != 0 {
                    spec.channels += 1;
                }
            }
        }

        // The engine's fixed internal representation.
        spec.sample_format = SampleFormat::I32;

        if !self.stream.is_created() {
            self.stream = self.create_stream(&spec)?;
        } else {
            // A live stream is reformatted in place; its device binding and
            // callbacks stay untouched.
            match self.direction {
                Direction::Output => {
                    self.subsystem
                        .set_stream_format(self.stream.id(), Some(&spec), None)?
                }
                Direction::Input => {
                    self.subsystem
                        .set_stream_format(self.stream.id(), None, Some(&spec))?
                }
            }
        }

        // Buffer sizes derive from the hardware-reported frame count.
        let samples = hw.sample_frames * spec.frame_samples();
        match self.direction {
            Direction::Input => buffers.capture.reset(samples),
            Direction::Output => {
                buffers.mix.clear();
                buffers.mix.resize(samples, 0);
            }
        }

        info!(
            "Negotiated {:?} format: {} Hz, {} channels",
            self.direction, spec.sample_rate, spec.channels
        );
        self.spec = spec;
        Ok(())
    }

    fn create_stream(&self, spec: &StreamFormat) -> Result<StreamHandle> {
        // The temporary is destroyed automatically if callback registration
        // fails, leaving no dangling registration behind.
        match self.direction {
            Direction::Output => {
                let stream = StreamHandle::create(self.subsystem.clone(), Some(spec), None)?;
                self.subsystem
                    .set_pull_callback(stream.id(), self.make_pull_callback())?;
                Ok(stream)
            }
            Direction::Input => {
                let stream = StreamHandle::create(self.subsystem.clone(), None, Some(spec))?;
                self.subsystem
                    .set_push_callback(stream.id(), self.make_push_callback())?;
                Ok(stream)
            }
        }
    }

    /// Bind the conversion stream to the device for active transfer.
    pub fn start(&mut self) -> Result<()> {
        if let Err(e) = self.subsystem.bind_stream(self.device.id(), self.stream.id()) {
            self.stop();
            error!("Failed to start {:?} endpoint: {}", self.direction, e);
            return Err(e);
        }
        Ok(())
    }

    /// Close the device; the conversion stream is retained for restart.
    pub fn stop(&mut self) {
        self.device.close();
    }

    /// Terminal teardown: stop, destroy the stream, drop the event watch.
    pub fn finish(&mut self) {
        self.stop();
        self.stream.destroy();
        if let Some(watch) = self.watch.take() {
            self.subsystem.remove_event_watch(watch);
        }
    }

    /// Switch devices: no-op if the name is unchanged, otherwise
    /// stop → store → init → start.
    pub fn set_device_name(
        &mut self,
        name: &str,
        buffers: &mut SharedBuffers,
        output_rate: Option<u32>,
    ) -> Result<()> {
        if self.device_name == name {
            return Ok(());
        }
        self.stop();
        self.device_name = name.to_string();
        self.init(buffers, output_rate)?;
        self.start()
    }

    /// Forget the stored device name in favor of the default sentinel.
    /// Used by device-removed recovery, which must reinitialize even when
    /// the stored name already is the sentinel.
    pub fn reset_to_default(&mut self) {
        self.device_name = DEFAULT_DEVICE_NAME.to_string();
    }

    /// Resolve the stored device name to a native id. A name that no longer
    /// matches any enumerated device self-heals to the default sentinel; the
    /// retry is a bounded loop, never recursion.
    fn resolve_device_id(&mut self) -> Result<DeviceId> {
        for _ in 0..2 {
            if self.device_name == DEFAULT_DEVICE_NAME {
                return Ok(self.subsystem.default_device_id(self.direction));
            }

            let devices = self.subsystem.enumerate_devices(self.direction)?;
            for id in devices {
                match self.subsystem.device_name(id) {
                    Ok(name) if name == self.device_name => return Ok(id),
                    Ok(_) => {}
                    Err(e) => warn!("Skipping device with unreadable name: {}", e),
                }
            }

            self.device_name = DEFAULT_DEVICE_NAME.to_string();
        }
        Ok(self.subsystem.default_device_id(self.direction))
    }

    /// Enumerate device names, the default sentinel first. Devices whose
    /// name cannot be read are skipped; a failed enumeration yields just the
    /// sentinel.
    pub fn device_list(subsystem: &Arc<dyn AudioSubsystem>, direction: Direction) -> Vec<String> {
        let mut list = vec![DEFAULT_DEVICE_NAME.to_string()];

        let devices = match subsystem.enumerate_devices(direction) {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                return list;
            }
        };

        for id in devices {
            match subsystem.device_name(id) {
                Ok(name) => list.push(name),
                Err(e) => warn!("Skipping device with unreadable name: {}", e),
            }
        }
        list
    }

    fn make_event_watch(&self) -> EventWatch {
        let shared = self.shared.clone();
        let direction = self.direction;
        Arc::new(move |event: &DeviceEvent| {
            // The upgrade fails once the facade is gone, so a late
            // notification can never touch destroyed state.
            let Some(state) = shared.upgrade() else { return };
            state.lock().handle_device_event(direction, event);
        })
    }

    fn make_pull_callback(&self) -> DataCallback {
        let shared = self.shared.clone();
        Arc::new(move |requested: usize| {
            let Some(state) = shared.upgrade() else { return };
            state.lock().output_wants(requested);
        })
    }

    fn make_push_callback(&self) -> DataCallback {
        let shared = self.shared.clone();
        Arc::new(move |available: usize| {
            let Some(state) = shared.upgrade() else { return };
            state.lock().input_has(available);
        })
    }
}
