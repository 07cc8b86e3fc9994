//! cpal-backed implementation of the platform subsystem.
//!
//! Conversion streams are implemented in-crate: the host side is always
//! interleaved i32, the device side is whatever cpal reports for the device.
//! Each stream stages already-converted samples in a lock-free ring buffer;
//! the cpal data callback drains (output) or fills (input) that ring and
//! invokes the registered data callback to exchange samples with the backend.
//!
//! cpal has no device-topology notification API, so device removal is
//! detected through the stream error callback (`DeviceNotAvailable`) and
//! surfaced as a [`DeviceEvent::Removed`] to the registered event watches.
//! Format-changed events are never synthesized here.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use super::convert::{f32_to_i32, i32_to_f32, remap_channels};
use super::resampler::{CHUNK_FRAMES, StreamResampler};
use super::{
    AudioSubsystem, DEFAULT_PLAYBACK_DEVICE, DEFAULT_RECORDING_DEVICE, DataCallback, DeviceEvent,
    DeviceFormat, DeviceId, Direction, EventWatch, SampleFormat, StreamFormat, StreamId, WatchId,
};
use crate::error::{BackendError, Result};

/// Maximum host round-trips per output callback before padding with silence.
const MAX_PULL_ROUNDS: usize = 8;

/// Staging ring capacity, in seconds of audio at the staged format.
const STAGING_SECONDS: usize = 1;

/// Platform subsystem built on cpal.
pub struct NativeSubsystem {
    inner: Arc<NativeInner>,
}

struct NativeInner {
    state: Mutex<NativeState>,
}

#[derive(Default)]
struct NativeState {
    next_id: u64,
    /// Enumeration ids handed out so far, keyed back to device names.
    names: HashMap<DeviceId, String>,
    by_name: HashMap<(Direction, String), DeviceId>,
    opened: HashMap<DeviceId, OpenedDevice>,
    streams: HashMap<StreamId, Arc<ConversionStream>>,
    watches: HashMap<WatchId, EventWatch>,
}

struct OpenedDevice {
    device: cpal::Device,
    direction: Direction,
    /// Active cpal stream while a conversion stream is bound.
    binding: Option<(StreamId, cpal::Stream)>,
}

impl NativeState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn id_for_name(&mut self, direction: Direction, name: String) -> DeviceId {
        if let Some(&id) = self.by_name.get(&(direction, name.clone())) {
            return id;
        }
        let id = self.alloc_id();
        self.by_name.insert((direction, name.clone()), id);
        self.names.insert(id, name);
        id
    }
}

impl NativeSubsystem {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NativeInner {
                state: Mutex::new(NativeState::default()),
            }),
        }
    }
}

impl Default for NativeSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeInner {
    fn fire_event(&self, event: &DeviceEvent) {
        // Snapshot the watch list so no registry lock is held across watch code.
        let watches: Vec<EventWatch> = self.state.lock().watches.values().cloned().collect();
        for watch in watches {
            watch(event);
        }
    }
}

fn default_cpal_device(direction: Direction) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match direction {
        Direction::Output => host.default_output_device(),
        Direction::Input => host.default_input_device(),
    }
    .ok_or_else(|| BackendError::DeviceOpen("no default device available".to_string()))
}

fn find_cpal_device(direction: Direction, name: &str) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let devices = match direction {
        Direction::Output => host.output_devices(),
        Direction::Input => host.input_devices(),
    }
    .map_err(|e| BackendError::DeviceOpen(e.to_string()))?;

    for device in devices {
        if let Ok(desc) = device.description()
            && desc.name() == name
        {
            return Ok(device);
        }
    }
    Err(BackendError::DeviceOpen(format!(
        "device \"{name}\" is no longer present"
    )))
}

fn query_device_format(device: &cpal::Device, direction: Direction) -> Result<DeviceFormat> {
    let config = match direction {
        Direction::Output => device.default_output_config(),
        Direction::Input => device.default_input_config(),
    }
    .map_err(|e| BackendError::FormatQuery(e.to_string()))?;

    let sample_format = match config.sample_format() {
        cpal::SampleFormat::I16 => SampleFormat::I16,
        cpal::SampleFormat::U16 => SampleFormat::U16,
        cpal::SampleFormat::I32 => SampleFormat::I32,
        cpal::SampleFormat::F32 => SampleFormat::F32,
        other => {
            return Err(BackendError::FormatQuery(format!(
                "unsupported sample format {other:?}"
            )));
        }
    };

    let sample_frames = match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => 512u32.clamp(*min, *max) as usize,
        cpal::SupportedBufferSize::Unknown => 512,
    };

    Ok(DeviceFormat {
        format: StreamFormat {
            sample_rate: config.sample_rate(),
            channels: config.channels(),
            sample_format,
        },
        sample_frames,
    })
}

impl AudioSubsystem for NativeSubsystem {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn startup(&self) -> Result<()> {
        let host = cpal::default_host();
        info!("Audio subsystem started (host: {})", host.id().name());
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.opened.clear();
        state.streams.clear();
        state.watches.clear();
        debug!("Audio subsystem stopped");
    }

    fn enumerate_devices(&self, direction: Direction) -> Result<Vec<DeviceId>> {
        let host = cpal::default_host();
        let devices = match direction {
            Direction::Output => host.output_devices(),
            Direction::Input => host.input_devices(),
        }
        .map_err(|e| BackendError::Enumeration(e.to_string()))?;

        let mut state = self.inner.state.lock();
        let mut ids = Vec::new();
        for device in devices {
            match device.description() {
                Ok(desc) => ids.push(state.id_for_name(direction, desc.name().to_string())),
                Err(e) => {
                    // Hand out an id with no recorded name; the name query
                    // for it will fail and the caller skips the device.
                    debug!("Device with unreadable description: {}", e);
                    ids.push(state.alloc_id());
                }
            }
        }
        Ok(ids)
    }

    fn device_name(&self, id: DeviceId) -> Result<String> {
        self.inner
            .state
            .lock()
            .names
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::Enumeration(format!("no name for device id {id}")))
    }

    fn default_device_id(&self, direction: Direction) -> DeviceId {
        match direction {
            Direction::Output => DEFAULT_PLAYBACK_DEVICE,
            Direction::Input => DEFAULT_RECORDING_DEVICE,
        }
    }

    fn open_device(&self, id: DeviceId, direction: Direction) -> Result<DeviceId> {
        let device = if id == self.default_device_id(direction) {
            default_cpal_device(direction)?
        } else {
            let name = self
                .inner
                .state
                .lock()
                .names
                .get(&id)
                .cloned()
                .ok_or_else(|| BackendError::DeviceOpen(format!("unknown device id {id}")))?;
            find_cpal_device(direction, &name)?
        };

        if let Ok(desc) = device.description() {
            info!("Opened {:?} device: {}", direction, desc.name());
        }

        let mut state = self.inner.state.lock();
        let opened_id = state.alloc_id();
        state.opened.insert(
            opened_id,
            OpenedDevice {
                device,
                direction,
                binding: None,
            },
        );
        Ok(opened_id)
    }

    fn close_device(&self, id: DeviceId) {
        // Dropping the entry drops any bound cpal stream, stopping transfer.
        self.inner.state.lock().opened.remove(&id);
    }

    fn device_format(&self, id: DeviceId) -> Result<DeviceFormat> {
        let state = self.inner.state.lock();
        let opened = state
            .opened
            .get(&id)
            .ok_or_else(|| BackendError::FormatQuery(format!("device {id} is not open")))?;
        query_device_format(&opened.device, opened.direction)
    }

    fn create_stream(
        &self,
        src: Option<&StreamFormat>,
        dst: Option<&StreamFormat>,
    ) -> Result<StreamId> {
        if src.is_none() && dst.is_none() {
            return Err(BackendError::StreamCreate(
                "a stream needs at least one side's format".to_string(),
            ));
        }
        let mut state = self.inner.state.lock();
        let id = state.alloc_id();
        state
            .streams
            .insert(id, Arc::new(ConversionStream::new(src.copied(), dst.copied())));
        Ok(id)
    }

    fn destroy_stream(&self, id: StreamId) {
        let mut state = self.inner.state.lock();
        if state.streams.remove(&id).is_some() {
            // Unbind from any device still pointing at it.
            for opened in state.opened.values_mut() {
                if matches!(opened.binding, Some((bound, _)) if bound == id) {
                    opened.binding = None;
                }
            }
        }
    }

    fn set_stream_format(
        &self,
        id: StreamId,
        src: Option<&StreamFormat>,
        dst: Option<&StreamFormat>,
    ) -> Result<()> {
        let stream = self.stream(id, BackendError::StreamFormat)?;
        stream.reformat(src.copied(), dst.copied())
    }

    fn set_pull_callback(&self, id: StreamId, callback: DataCallback) -> Result<()> {
        let stream = self.stream(id, BackendError::StreamCreate)?;
        stream.core.lock().pull = Some(callback);
        Ok(())
    }

    fn set_push_callback(&self, id: StreamId, callback: DataCallback) -> Result<()> {
        let stream = self.stream(id, BackendError::StreamCreate)?;
        stream.core.lock().push = Some(callback);
        Ok(())
    }

    fn bind_stream(&self, device: DeviceId, stream: StreamId) -> Result<()> {
        let (cpal_device, direction, conversion) = {
            let state = self.inner.state.lock();
            let opened = state
                .opened
                .get(&device)
                .ok_or_else(|| BackendError::StreamBind(format!("device {device} is not open")))?;
            let conversion = state
                .streams
                .get(&stream)
                .cloned()
                .ok_or_else(|| BackendError::StreamBind(format!("unknown stream {stream}")))?;
            (opened.device.clone(), opened.direction, conversion)
        };

        // The device side of the conversion adopts the live hardware format.
        let hw = query_device_format(&cpal_device, direction)
            .map_err(|e| BackendError::StreamBind(e.to_string()))?;
        match direction {
            Direction::Output => conversion.reformat(None, Some(hw.format))?,
            Direction::Input => conversion.reformat(Some(hw.format), None)?,
        }

        let config = match direction {
            Direction::Output => cpal_device.default_output_config(),
            Direction::Input => cpal_device.default_input_config(),
        }
        .map_err(|e| BackendError::StreamBind(e.to_string()))?
        .config();

        let err_fn = {
            let weak: Weak<NativeInner> = Arc::downgrade(&self.inner);
            move |err: cpal::StreamError| match err {
                cpal::StreamError::DeviceNotAvailable => {
                    let weak = weak.clone();
                    // Recovery tears this stream down; run it off the dying
                    // stream's callback thread.
                    std::thread::spawn(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.fire_event(&DeviceEvent::Removed { device });
                        }
                    });
                }
                other => error!("Audio stream error: {}", other),
            }
        };

        let cpal_stream = match (direction, hw.format.sample_format) {
            (Direction::Output, SampleFormat::F32) => {
                build_output_stream::<f32>(&cpal_device, &config, conversion.clone(), err_fn)
            }
            (Direction::Output, SampleFormat::I16) => {
                build_output_stream::<i16>(&cpal_device, &config, conversion.clone(), err_fn)
            }
            (Direction::Output, SampleFormat::U16) => {
                build_output_stream::<u16>(&cpal_device, &config, conversion.clone(), err_fn)
            }
            (Direction::Output, SampleFormat::I32) => {
                build_output_stream::<i32>(&cpal_device, &config, conversion.clone(), err_fn)
            }
            (Direction::Input, SampleFormat::F32) => {
                build_input_stream::<f32>(&cpal_device, &config, conversion.clone(), err_fn)
            }
            (Direction::Input, SampleFormat::I16) => {
                build_input_stream::<i16>(&cpal_device, &config, conversion.clone(), err_fn)
            }
            (Direction::Input, SampleFormat::U16) => {
                build_input_stream::<u16>(&cpal_device, &config, conversion.clone(), err_fn)
            }
            (Direction::Input, SampleFormat::I32) => {
                build_input_stream::<i32>(&cpal_device, &config, conversion.clone(), err_fn)
            }
        }?;

        cpal_stream
            .play()
            .map_err(|e| BackendError::StreamBind(e.to_string()))?;

        let mut state = self.inner.state.lock();
        if let Some(opened) = state.opened.get_mut(&device) {
            opened.binding = Some((stream, cpal_stream));
        }
        Ok(())
    }

    fn put_stream_data(&self, id: StreamId, samples: &[i32]) -> Result<()> {
        self.stream(id, BackendError::StreamData)?.put(samples)
    }

    fn get_stream_data(&self, id: StreamId, out: &mut [i32]) -> Result<usize> {
        self.stream(id, BackendError::StreamData)?.get(out)
    }

    fn add_event_watch(&self, watch: EventWatch) -> Result<WatchId> {
        let mut state = self.inner.state.lock();
        let id = state.alloc_id();
        state.watches.insert(id, watch);
        Ok(id)
    }

    fn remove_event_watch(&self, id: WatchId) {
        self.inner.state.lock().watches.remove(&id);
    }
}

impl NativeSubsystem {
    fn stream(
        &self,
        id: StreamId,
        wrap: fn(String) -> BackendError,
    ) -> Result<Arc<ConversionStream>> {
        self.inner
            .state
            .lock()
            .streams
            .get(&id)
            .cloned()
            .ok_or_else(|| wrap(format!("unknown stream {id}")))
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    stream: Arc<ConversionStream>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| stream.fill_output(data),
            err_fn,
            None,
        )
        .map_err(|e| BackendError::StreamBind(e.to_string()))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    stream: Arc<ConversionStream>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| stream.ingest_input(data),
            err_fn,
            None,
        )
        .map_err(|e| BackendError::StreamBind(e.to_string()))
}

/// One conversion stream: formats, data callbacks and staged samples.
///
/// Staged data always sits at the destination format: device-rate f32 for
/// output streams, host-rate i32 for input streams.
struct ConversionStream {
    core: Mutex<StreamCore>,
}

struct StreamCore {
    src: Option<StreamFormat>,
    dst: Option<StreamFormat>,
    pull: Option<DataCallback>,
    push: Option<DataCallback>,
    out_ring: Option<(HeapProd<f32>, HeapCons<f32>)>,
    in_ring: Option<(HeapProd<i32>, HeapCons<i32>)>,
    resampler: Option<StreamResampler>,
    scratch_f32: Vec<f32>,
    scratch_i32: Vec<i32>,
}

impl ConversionStream {
    fn new(src: Option<StreamFormat>, dst: Option<StreamFormat>) -> Self {
        Self {
            core: Mutex::new(StreamCore {
                src,
                dst,
                pull: None,
                push: None,
                out_ring: None,
                in_ring: None,
                resampler: None,
                scratch_f32: Vec::new(),
                scratch_i32: Vec::new(),
            }),
        }
    }

    /// Update either side's format and rebuild staging. Staged samples are at
    /// the old format and get dropped.
    fn reformat(&self, src: Option<StreamFormat>, dst: Option<StreamFormat>) -> Result<()> {
        let mut core = self.core.lock();
        if src.is_some() {
            core.src = src;
        }
        if dst.is_some() {
            core.dst = dst;
        }

        let (Some(from), Some(to)) = (core.src, core.dst) else {
            // Only one side known yet; staging waits for the bind.
            return Ok(());
        };

        core.resampler = if from.sample_rate != to.sample_rate {
            Some(StreamResampler::new(
                from.sample_rate,
                to.sample_rate,
                to.channels as usize,
            )?)
        } else {
            None
        };

        let capacity = to.sample_rate as usize * to.frame_samples() * STAGING_SECONDS;
        // Output streams stage f32 at the device format, input streams stage
        // i32 at the host format. Until bound we cannot tell which this is,
        // so keep both rings ready; one of them stays untouched.
        core.out_ring = Some(HeapRb::<f32>::new(capacity).split());
        core.in_ring = Some(HeapRb::<i32>::new(capacity).split());
        Ok(())
    }

    /// Host pushed mixed samples (output direction).
    fn put(&self, samples: &[i32]) -> Result<()> {
        let mut core = self.core.lock();
        let (Some(src), Some(dst)) = (core.src, core.dst) else {
            return Err(BackendError::StreamData(
                "stream is not bound to a device".to_string(),
            ));
        };

        let core = &mut *core;
        i32_to_f32(samples, &mut core.scratch_f32);
        let remapped = remap_channels(
            &core.scratch_f32,
            src.channels as usize,
            dst.channels as usize,
        );
        let staged = match &mut core.resampler {
            Some(rs) => rs.process(&remapped),
            None => remapped,
        };

        let Some((prod, _)) = &mut core.out_ring else {
            return Err(BackendError::StreamData(
                "stream is not bound to a device".to_string(),
            ));
        };
        let written = prod.push_slice(&staged);
        if written < staged.len() {
            warn!(
                "Output staging buffer full, dropped {} samples",
                staged.len() - written
            );
        }
        Ok(())
    }

    /// Host drained converted samples (input direction).
    fn get(&self, out: &mut [i32]) -> Result<usize> {
        let mut core = self.core.lock();
        match &mut core.in_ring {
            Some((_, cons)) => Ok(cons.pop_slice(out)),
            None => Ok(0),
        }
    }

    /// cpal wants `data.len()` device samples. Asks the host to mix more
    /// while the staging ring is short, then drains; pads with silence on
    /// underrun. The pull callback re-enters `put`, so the core lock is
    /// released around every invocation.
    fn fill_output<T>(&self, data: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        let needed = data.len();

        for _ in 0..MAX_PULL_ROUNDS {
            let (queued, deficit, pull) = {
                let core = self.core.lock();
                let queued = match &core.out_ring {
                    Some((_, cons)) => cons.occupied_len(),
                    None => break,
                };
                if queued >= needed {
                    break;
                }
                (queued, core.host_samples_for(needed - queued), core.pull.clone())
            };
            let Some(pull) = pull else { break };
            if deficit == 0 {
                break;
            }

            pull(deficit);

            // Stop if the host made no progress; silence covers the rest.
            let after = match &self.core.lock().out_ring {
                Some((_, cons)) => cons.occupied_len(),
                None => break,
            };
            if after <= queued {
                break;
            }
        }

        let mut core = self.core.lock();
        match &mut core.out_ring {
            Some((_, cons)) => {
                for slot in data.iter_mut() {
                    *slot = T::from_sample(cons.try_pop().unwrap_or(0.0));
                }
            }
            None => {
                for slot in data.iter_mut() {
                    *slot = T::from_sample(0.0);
                }
            }
        }
    }

    /// The device captured `data` (input direction): convert, stage, then
    /// announce availability. The push callback re-enters `get`, so the core
    /// lock is released before invoking it.
    fn ingest_input<T>(&self, data: &[T])
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let (available, push) = {
            let mut core = self.core.lock();
            let (Some(src), Some(dst)) = (core.src, core.dst) else {
                return;
            };

            let core = &mut *core;
            core.scratch_f32.clear();
            core.scratch_f32
                .extend(data.iter().map(|&s| f32::from_sample(s)));
            let remapped = remap_channels(
                &core.scratch_f32,
                src.channels as usize,
                dst.channels as usize,
            );
            let converted = match &mut core.resampler {
                Some(rs) => rs.process(&remapped),
                None => remapped,
            };
            f32_to_i32(&converted, &mut core.scratch_i32);

            let Some((prod, cons)) = &mut core.in_ring else {
                return;
            };
            let written = prod.push_slice(&core.scratch_i32);
            if written < core.scratch_i32.len() {
                warn!(
                    "Input staging buffer full, dropped {} samples",
                    core.scratch_i32.len() - written
                );
            }
            (cons.occupied_len(), core.push.clone())
        };

        if available > 0
            && let Some(push) = push
        {
            push(available);
        }
    }
}

impl StreamCore {
    /// Host samples to request so that roughly `device_samples` more staged
    /// samples come out, accounting for rate and channel differences. Rounded
    /// up to the resampler chunk so short requests still make progress.
    fn host_samples_for(&self, device_samples: usize) -> usize {
        let (Some(src), Some(dst)) = (self.src, self.dst) else {
            return 0;
        };
        if dst.frame_samples() == 0 || src.frame_samples() == 0 {
            return 0;
        }
        let device_frames = device_samples.div_ceil(dst.frame_samples());
        let host_frames = if src.sample_rate == dst.sample_rate {
            device_frames
        } else {
            (device_frames * src.sample_rate as usize)
                .div_ceil(dst.sample_rate as usize)
                .max(CHUNK_FRAMES)
        };
        host_frames * src.frame_samples()
    }
}
