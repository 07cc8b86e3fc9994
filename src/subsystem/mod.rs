//! Platform audio subsystem abstraction.
//!
//! The backend core never talks to a native audio API directly; it consumes
//! the [`AudioSubsystem`] trait, which mirrors the surface every platform
//! audio API provides in some form: device enumeration by direction, opening
//! a device by id or default role, querying its hardware format, creating and
//! reformatting conversion streams, binding a stream to a device for active
//! transfer, pushing/pulling stream data, and watching for device topology
//! changes.
//!
//! The production implementation lives in [`native`] (built on cpal). Tests
//! run against a scriptable in-memory implementation.

pub mod convert;
pub mod native;
pub mod resampler;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of a native audio device. `0` means "no device".
pub type DeviceId = u64;

/// Identifier of a native conversion stream. `0` means "no stream".
pub type StreamId = u64;

/// Identifier of a registered event watch.
pub type WatchId = u64;

/// Sentinel id resolving to the platform's current default playback device.
/// Re-resolved by the subsystem on every open, never cached.
pub const DEFAULT_PLAYBACK_DEVICE: DeviceId = u64::MAX;

/// Sentinel id resolving to the platform's current default recording device.
pub const DEFAULT_RECORDING_DEVICE: DeviceId = u64::MAX - 1;

/// Name under which the default-role device appears in device lists.
pub const DEFAULT_DEVICE_NAME: &str = "Default";

/// One direction of audio flow, independently negotiated and lifecycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Playback: the hardware pulls mixed samples from the host.
    Output,
    /// Recording: the hardware pushes captured samples to the host.
    Input,
}

/// PCM sample encoding of one side of a conversion stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    I16,
    U16,
    /// The host's fixed internal representation.
    I32,
    F32,
}

impl SampleFormat {
    /// Size of one sample in bytes.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::I16 | SampleFormat::U16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
        }
    }
}

/// Sample rate, channel count and encoding of one side of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    /// Samples per interleaved frame.
    pub fn frame_samples(&self) -> usize {
        self.channels as usize
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 0,
            channels: 0,
            sample_format: SampleFormat::I32,
        }
    }
}

/// Hardware format report for an opened device: the native stream format and
/// the device's preferred buffer size in sample frames. Buffer sizes derived
/// from this are the only legal ones; callers must never assume a frame count.
#[derive(Debug, Clone, Copy)]
pub struct DeviceFormat {
    pub format: StreamFormat,
    pub sample_frames: usize,
}

/// Out-of-band device topology/format notification, delivered by the
/// subsystem on its own thread, not the host thread.
#[derive(Debug, Clone, Copy)]
pub enum DeviceEvent {
    /// The hardware format of an opened device changed under the application.
    FormatChanged { device: DeviceId },
    /// An opened device disappeared. Not emitted for default-role devices on
    /// platforms that switch those silently; the backend compensates by
    /// re-resolving the default sentinel on every open.
    Removed { device: DeviceId },
}

/// Real-time data callback: for output streams, invoked with the number of
/// additional samples the device needs; for input streams, with the number of
/// converted samples now available.
pub type DataCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Asynchronous topology/format notification sink.
pub type EventWatch = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// The native platform audio API surface consumed by the backend core.
///
/// All data transfer is in the host's fixed representation: interleaved
/// signed 32-bit samples. Conversion streams bridge to whatever the hardware
/// side actually uses; a `None` format on one side of a stream means "same as
/// the other side until bound/reformatted".
pub trait AudioSubsystem: Send + Sync {
    /// Backend identifier reported to the host (e.g. "cpal").
    fn name(&self) -> &'static str;

    /// Start the platform audio subsystem. Fatal to the backend on failure.
    fn startup(&self) -> Result<()>;

    /// Stop the platform audio subsystem. Idempotent.
    fn shutdown(&self);

    /// Enumerate native devices for one direction.
    fn enumerate_devices(&self, direction: Direction) -> Result<Vec<DeviceId>>;

    /// Query a device's human-readable name. May fail per device; callers
    /// are expected to skip such devices rather than abort enumeration.
    fn device_name(&self, id: DeviceId) -> Result<String>;

    /// The default-role sentinel for one direction.
    fn default_device_id(&self, direction: Direction) -> DeviceId;

    /// Open a device by enumerated id or default-role sentinel. Returns the
    /// opened handle id (distinct from the enumeration id).
    fn open_device(&self, id: DeviceId, direction: Direction) -> Result<DeviceId>;

    /// Close an opened device, unbinding any bound stream. Unknown ids are
    /// ignored.
    fn close_device(&self, id: DeviceId);

    /// Query the current hardware format of an opened device.
    fn device_format(&self, id: DeviceId) -> Result<DeviceFormat>;

    /// Create a conversion stream. Output streams convert from `src` (host
    /// format) to the hardware; input streams convert from the hardware to
    /// `dst` (host format). At least one side is given.
    fn create_stream(
        &self,
        src: Option<&StreamFormat>,
        dst: Option<&StreamFormat>,
    ) -> Result<StreamId>;

    /// Destroy a conversion stream, dropping its callbacks and any staged
    /// data. Unknown ids are ignored.
    fn destroy_stream(&self, id: StreamId);

    /// Reformat an existing stream in place, without disturbing its device
    /// binding or callbacks.
    fn set_stream_format(
        &self,
        id: StreamId,
        src: Option<&StreamFormat>,
        dst: Option<&StreamFormat>,
    ) -> Result<()>;

    /// Register the output-direction data callback on a stream.
    fn set_pull_callback(&self, id: StreamId, callback: DataCallback) -> Result<()>;

    /// Register the input-direction data callback on a stream.
    fn set_push_callback(&self, id: StreamId, callback: DataCallback) -> Result<()>;

    /// Bind a stream to an opened device and begin active transfer.
    fn bind_stream(&self, device: DeviceId, stream: StreamId) -> Result<()>;

    /// Push host samples into an output stream for conversion and delivery.
    fn put_stream_data(&self, id: StreamId, samples: &[i32]) -> Result<()>;

    /// Pull converted samples out of an input stream. Returns the number of
    /// samples written to `out`.
    fn get_stream_data(&self, id: StreamId, out: &mut [i32]) -> Result<usize>;

    /// Register a topology/format event watch. Idempotent per watch id.
    fn add_event_watch(&self, watch: EventWatch) -> Result<WatchId>;

    /// Unregister a previously registered event watch. Unknown ids are
    /// ignored.
    fn remove_event_watch(&self, id: WatchId);
}
