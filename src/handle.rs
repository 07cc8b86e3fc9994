//! RAII wrappers around native device and stream handles.
//!
//! Each wrapper owns at most one native handle and always releases it on
//! drop, so failed initialization paths roll back by simply letting the
//! temporary go out of scope. Ownership moves with the value; assigning over
//! a wrapper drops (and thereby closes) whatever it previously owned.

use std::sync::Arc;

use crate::error::Result;
use crate::subsystem::{AudioSubsystem, DeviceId, Direction, StreamFormat, StreamId};

/// Owns one opened native device. Id `0` means unopened.
pub(crate) struct DeviceHandle {
    subsystem: Arc<dyn AudioSubsystem>,
    id: DeviceId,
}

impl DeviceHandle {
    pub fn unopened(subsystem: Arc<dyn AudioSubsystem>) -> Self {
        Self { subsystem, id: 0 }
    }

    /// Open a device by enumerated id or default-role sentinel.
    ///
    /// # Errors
    /// Returns the platform error; no handle is left open on failure.
    pub fn open(
        subsystem: Arc<dyn AudioSubsystem>,
        target: DeviceId,
        direction: Direction,
    ) -> Result<Self> {
        let id = subsystem.open_device(target, direction)?;
        Ok(Self { subsystem, id })
    }

    pub fn is_opened(&self) -> bool {
        self.id != 0
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Close the owned device. Safe to call repeatedly or when unopened.
    pub fn close(&mut self) {
        if self.id == 0 {
            return;
        }
        self.subsystem.close_device(self.id);
        self.id = 0;
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns one native conversion stream. Id `0` means absent.
pub(crate) struct StreamHandle {
    subsystem: Arc<dyn AudioSubsystem>,
    id: StreamId,
}

impl StreamHandle {
    pub fn absent(subsystem: Arc<dyn AudioSubsystem>) -> Self {
        Self { subsystem, id: 0 }
    }

    /// Create a conversion stream between the given formats. A `None` side
    /// passes through unconverted until the stream is bound or reformatted.
    pub fn create(
        subsystem: Arc<dyn AudioSubsystem>,
        src: Option<&StreamFormat>,
        dst: Option<&StreamFormat>,
    ) -> Result<Self> {
        let id = subsystem.create_stream(src, dst)?;
        Ok(Self { subsystem, id })
    }

    pub fn is_created(&self) -> bool {
        self.id != 0
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Destroy the owned stream. Safe to call repeatedly or when absent.
    pub fn destroy(&mut self) {
        if self.id == 0 {
            return;
        }
        self.subsystem.destroy_stream(self.id);
        self.id = 0;
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}
