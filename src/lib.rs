//! Duplex audio I/O backend bridging a host mixing engine to the platform
//! audio subsystem.
//!
//! The backend negotiates device formats, manages independent output and
//! input endpoints whose hardware characteristics can change at runtime,
//! converts between the engine's fixed signed 32-bit interleaved samples and
//! whatever the hardware provides, and exchanges buffers with real-time
//! callbacks under a single short critical section.
//!
//! Hosts construct an [`AudioDriver`] over a platform subsystem (usually
//! [`NativeSubsystem`], built on cpal) and a [`Mixer`] implementation, then
//! drive it with `init`/`start`, the device get/set/list operations, and
//! `input_start`/`input_stop` for capture.

pub mod error;
pub mod subsystem;

mod driver;
mod endpoint;
mod handle;
mod ring;

pub use driver::{AudioDriver, DriverLock, Mixer, SpeakerMode};
pub use error::{BackendError, Result};
pub use subsystem::native::NativeSubsystem;
pub use subsystem::{
    AudioSubsystem, DEFAULT_DEVICE_NAME, DeviceEvent, Direction, SampleFormat, StreamFormat,
};
