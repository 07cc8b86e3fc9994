//! Scriptable in-memory subsystem used by the unit tests.
//!
//! Keeps a device table the tests populate, records every native call for
//! no-op assertions, accounts live device/stream handles for leak checks, and
//! lets tests drive the real-time data callbacks and topology events the way
//! the platform would. Callbacks and watches are always invoked with the
//! internal lock released, matching how a real subsystem delivers them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    AudioSubsystem, DEFAULT_PLAYBACK_DEVICE, DEFAULT_RECORDING_DEVICE, DataCallback, DeviceEvent,
    DeviceFormat, DeviceId, Direction, EventWatch, SampleFormat, StreamFormat, StreamId, WatchId,
};
use crate::error::{BackendError, Result};

pub(crate) struct MockSubsystem {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    fail_startup: bool,
    fail_enumeration: bool,
    fail_bind: bool,
    devices: Vec<TableDevice>,
    defaults: HashMap<Direction, DeviceId>,
    /// Opened handle id -> backing table device id.
    opened: HashMap<DeviceId, DeviceId>,
    streams: HashMap<StreamId, MockStream>,
    /// Opened handle id -> bound stream id.
    bindings: HashMap<DeviceId, StreamId>,
    watches: HashMap<WatchId, EventWatch>,
    calls: Vec<String>,
    max_open: HashMap<Direction, usize>,
    max_streams: usize,
    output_written: Vec<i32>,
}

struct TableDevice {
    id: DeviceId,
    /// None simulates a device whose name cannot be queried.
    name: Option<String>,
    direction: Direction,
    format: StreamFormat,
    sample_frames: usize,
}

#[derive(Default)]
struct MockStream {
    src: Option<StreamFormat>,
    dst: Option<StreamFormat>,
    pull: Option<DataCallback>,
    push: Option<DataCallback>,
    queue: Vec<i32>,
    reformat_count: usize,
}

impl MockState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        // Keep generated ids clear of the small ids tests hand out.
        self.next_id + 1000
    }

    fn table_device(&self, id: DeviceId) -> Option<&TableDevice> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn opened_direction(&self, opened: DeviceId) -> Option<Direction> {
        let backing = self.opened.get(&opened)?;
        self.table_device(*backing).map(|d| d.direction)
    }

    fn bound_stream_for(&self, direction: Direction) -> Option<StreamId> {
        self.bindings
            .iter()
            .find(|(opened, _)| self.opened_direction(**opened) == Some(direction))
            .map(|(_, stream)| *stream)
    }
}

impl MockSubsystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
        })
    }

    // --- table setup -----------------------------------------------------

    pub fn add_device(
        &self,
        direction: Direction,
        id: DeviceId,
        name: Option<&str>,
        sample_rate: u32,
        channels: u16,
        sample_frames: usize,
    ) {
        let mut state = self.state.lock();
        state.devices.push(TableDevice {
            id,
            name: name.map(str::to_string),
            direction,
            format: StreamFormat {
                sample_rate,
                channels,
                sample_format: SampleFormat::F32,
            },
            sample_frames,
        });
        // First device of a direction becomes its default.
        state.defaults.entry(direction).or_insert(id);
    }

    pub fn set_default(&self, direction: Direction, id: DeviceId) {
        self.state.lock().defaults.insert(direction, id);
    }

    pub fn set_device_format(&self, id: DeviceId, sample_rate: u32, channels: u16) {
        let mut state = self.state.lock();
        if let Some(device) = state.devices.iter_mut().find(|d| d.id == id) {
            device.format.sample_rate = sample_rate;
            device.format.channels = channels;
        }
    }

    pub fn remove_device(&self, id: DeviceId) {
        self.state.lock().devices.retain(|d| d.id != id);
    }

    pub fn fail_startup(&self, fail: bool) {
        self.state.lock().fail_startup = fail;
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state.lock().fail_enumeration = fail;
    }

    pub fn fail_bind(&self, fail: bool) {
        self.state.lock().fail_bind = fail;
    }

    // --- inspection ------------------------------------------------------

    pub fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().calls)
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opened.len()
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }

    pub fn max_open(&self, direction: Direction) -> usize {
        self.state
            .lock()
            .max_open
            .get(&direction)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_streams(&self) -> usize {
        self.state.lock().max_streams
    }

    /// The opened handle id currently backing `direction`, if any.
    pub fn current_opened(&self, direction: Direction) -> Option<DeviceId> {
        let state = self.state.lock();
        state
            .opened
            .keys()
            .copied()
            .find(|&opened| state.opened_direction(opened) == Some(direction))
    }

    /// Table id the current opened handle of `direction` is backed by.
    pub fn current_backing(&self, direction: Direction) -> Option<DeviceId> {
        let state = self.state.lock();
        state
            .opened
            .iter()
            .find(|(opened, _)| state.opened_direction(**opened) == Some(direction))
            .map(|(_, backing)| *backing)
    }

    pub fn bound_stream(&self, direction: Direction) -> Option<StreamId> {
        self.state.lock().bound_stream_for(direction)
    }

    pub fn stream_reformat_count(&self, id: StreamId) -> usize {
        self.state
            .lock()
            .streams
            .get(&id)
            .map(|s| s.reformat_count)
            .unwrap_or(0)
    }

    pub fn output_written(&self) -> Vec<i32> {
        self.state.lock().output_written.clone()
    }

    // --- platform-side drivers -------------------------------------------

    /// The device wants `samples` more output samples.
    pub fn drive_output(&self, samples: usize) {
        let pull = {
            let state = self.state.lock();
            state
                .bound_stream_for(Direction::Output)
                .and_then(|sid| state.streams.get(&sid))
                .and_then(|s| s.pull.clone())
        };
        if let Some(pull) = pull {
            pull(samples);
        }
    }

    /// The device captured `samples`, already converted to the host format.
    pub fn drive_input(&self, samples: &[i32]) {
        let (push, available) = {
            let mut state = self.state.lock();
            let Some(sid) = state.bound_stream_for(Direction::Input) else {
                return;
            };
            let stream = state.streams.get_mut(&sid).expect("bound stream exists");
            stream.queue.extend_from_slice(samples);
            (stream.push.clone(), stream.queue.len())
        };
        if let Some(push) = push {
            push(available);
        }
    }

    pub fn fire(&self, event: DeviceEvent) {
        let watches: Vec<EventWatch> = self.state.lock().watches.values().cloned().collect();
        for watch in watches {
            watch(&event);
        }
    }

    /// Announce a hardware format change on the device bound for `direction`.
    pub fn fire_format_changed(&self, direction: Direction) {
        if let Some(device) = self.current_opened(direction) {
            self.fire(DeviceEvent::FormatChanged { device });
        }
    }

    /// Announce removal of the device bound for `direction`.
    pub fn fire_removed(&self, direction: Direction) {
        if let Some(device) = self.current_opened(direction) {
            self.fire(DeviceEvent::Removed { device });
        }
    }
}

impl AudioSubsystem for MockSubsystem {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn startup(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push("startup".to_string());
        if state.fail_startup {
            return Err(BackendError::SubsystemInit("injected".to_string()));
        }
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.calls.push("shutdown".to_string());
        state.opened.clear();
        state.streams.clear();
        state.bindings.clear();
        state.watches.clear();
    }

    fn enumerate_devices(&self, direction: Direction) -> Result<Vec<DeviceId>> {
        let mut state = self.state.lock();
        state.calls.push(format!("enumerate({direction:?})"));
        if state.fail_enumeration {
            return Err(BackendError::Enumeration("injected".to_string()));
        }
        Ok(state
            .devices
            .iter()
            .filter(|d| d.direction == direction)
            .map(|d| d.id)
            .collect())
    }

    fn device_name(&self, id: DeviceId) -> Result<String> {
        let mut state = self.state.lock();
        state.calls.push(format!("device_name({id})"));
        state
            .table_device(id)
            .ok_or_else(|| BackendError::Enumeration(format!("unknown device {id}")))?
            .name
            .clone()
            .ok_or_else(|| BackendError::Enumeration(format!("name unreadable for device {id}")))
    }

    fn default_device_id(&self, direction: Direction) -> DeviceId {
        match direction {
            Direction::Output => DEFAULT_PLAYBACK_DEVICE,
            Direction::Input => DEFAULT_RECORDING_DEVICE,
        }
    }

    fn open_device(&self, id: DeviceId, direction: Direction) -> Result<DeviceId> {
        let mut state = self.state.lock();
        state.calls.push(format!("open_device({id})"));

        let backing = if id == self.default_device_id(direction) {
            // The default role is re-resolved on every open.
            *state
                .defaults
                .get(&direction)
                .ok_or_else(|| BackendError::DeviceOpen("no default device".to_string()))?
        } else {
            id
        };
        let device = state
            .table_device(backing)
            .ok_or_else(|| BackendError::DeviceOpen(format!("device {backing} not present")))?;
        if device.direction != direction {
            return Err(BackendError::DeviceOpen(format!(
                "device {backing} has the wrong direction"
            )));
        }

        let opened = state.alloc_id();
        state.opened.insert(opened, backing);
        let live = state
            .opened
            .keys()
            .filter(|&&o| state.opened_direction(o) == Some(direction))
            .count();
        let max = state.max_open.entry(direction).or_insert(0);
        *max = (*max).max(live);
        Ok(opened)
    }

    fn close_device(&self, id: DeviceId) {
        let mut state = self.state.lock();
        state.calls.push(format!("close_device({id})"));
        state.opened.remove(&id);
        state.bindings.remove(&id);
    }

    fn device_format(&self, id: DeviceId) -> Result<DeviceFormat> {
        let mut state = self.state.lock();
        state.calls.push(format!("device_format({id})"));
        let backing = *state
            .opened
            .get(&id)
            .ok_or_else(|| BackendError::FormatQuery(format!("device {id} is not open")))?;
        let device = state
            .table_device(backing)
            .ok_or_else(|| BackendError::FormatQuery(format!("device {backing} disappeared")))?;
        Ok(DeviceFormat {
            format: device.format,
            sample_frames: device.sample_frames,
        })
    }

    fn create_stream(
        &self,
        src: Option<&StreamFormat>,
        dst: Option<&StreamFormat>,
    ) -> Result<StreamId> {
        let mut state = self.state.lock();
        state.calls.push("create_stream".to_string());
        let id = state.alloc_id();
        state.streams.insert(
            id,
            MockStream {
                src: src.copied(),
                dst: dst.copied(),
                ..MockStream::default()
            },
        );
        state.max_streams = state.max_streams.max(state.streams.len());
        Ok(id)
    }

    fn destroy_stream(&self, id: StreamId) {
        let mut state = self.state.lock();
        state.calls.push(format!("destroy_stream({id})"));
        state.streams.remove(&id);
        state.bindings.retain(|_, bound| *bound != id);
    }

    fn set_stream_format(
        &self,
        id: StreamId,
        src: Option<&StreamFormat>,
        dst: Option<&StreamFormat>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("set_stream_format({id})"));
        let stream = state
            .streams
            .get_mut(&id)
            .ok_or_else(|| BackendError::StreamFormat(format!("unknown stream {id}")))?;
        if src.is_some() {
            stream.src = src.copied();
        }
        if dst.is_some() {
            stream.dst = dst.copied();
        }
        stream.reformat_count += 1;
        Ok(())
    }

    fn set_pull_callback(&self, id: StreamId, callback: DataCallback) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("set_pull_callback({id})"));
        state
            .streams
            .get_mut(&id)
            .ok_or_else(|| BackendError::StreamCreate(format!("unknown stream {id}")))?
            .pull = Some(callback);
        Ok(())
    }

    fn set_push_callback(&self, id: StreamId, callback: DataCallback) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("set_push_callback({id})"));
        state
            .streams
            .get_mut(&id)
            .ok_or_else(|| BackendError::StreamCreate(format!("unknown stream {id}")))?
            .push = Some(callback);
        Ok(())
    }

    fn bind_stream(&self, device: DeviceId, stream: StreamId) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("bind_stream({device}, {stream})"));
        if state.fail_bind {
            return Err(BackendError::StreamBind("injected".to_string()));
        }
        let backing = *state
            .opened
            .get(&device)
            .ok_or_else(|| BackendError::StreamBind(format!("device {device} is not open")))?;
        let hw = state
            .table_device(backing)
            .map(|d| d.format)
            .ok_or_else(|| BackendError::StreamBind(format!("device {backing} disappeared")))?;
        let direction = state.opened_direction(device).expect("opened device");
        let mock_stream = state
            .streams
            .get_mut(&stream)
            .ok_or_else(|| BackendError::StreamBind(format!("unknown stream {stream}")))?;
        // The bound side adopts the hardware format.
        match direction {
            Direction::Output => mock_stream.dst = Some(hw),
            Direction::Input => mock_stream.src = Some(hw),
        }
        state.bindings.insert(device, stream);
        Ok(())
    }

    fn put_stream_data(&self, id: StreamId, samples: &[i32]) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("put_stream_data({id})"));
        if !state.streams.contains_key(&id) {
            return Err(BackendError::StreamData(format!("unknown stream {id}")));
        }
        state.output_written.extend_from_slice(samples);
        Ok(())
    }

    fn get_stream_data(&self, id: StreamId, out: &mut [i32]) -> Result<usize> {
        let mut state = self.state.lock();
        state.calls.push(format!("get_stream_data({id})"));
        let stream = state
            .streams
            .get_mut(&id)
            .ok_or_else(|| BackendError::StreamData(format!("unknown stream {id}")))?;
        let n = stream.queue.len().min(out.len());
        out[..n].copy_from_slice(&stream.queue[..n]);
        stream.queue.drain(..n);
        Ok(n)
    }

    fn add_event_watch(&self, watch: EventWatch) -> Result<WatchId> {
        let mut state = self.state.lock();
        state.calls.push("add_event_watch".to_string());
        let id = state.alloc_id();
        state.watches.insert(id, watch);
        Ok(id)
    }

    fn remove_event_watch(&self, id: WatchId) {
        let mut state = self.state.lock();
        state.calls.push(format!("remove_event_watch({id})"));
        state.watches.remove(&id);
    }
}
