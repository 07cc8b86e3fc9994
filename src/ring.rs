//! Fixed-capacity capture ring shared between the input callback and the
//! mixing engine.
//!
//! The input callback appends at the write cursor; a read that fills the
//! buffer exactly to the end wraps once and continues from the start. The
//! cursor then reports the wrapped position, which is how the mixing engine
//! locates the freshest samples.

/// Interleaved i32 capture samples with a write cursor.
#[derive(Default)]
pub(crate) struct CaptureRing {
    data: Vec<i32>,
    position: usize,
}

impl CaptureRing {
    /// Resize to `capacity` samples, zeroing contents and the cursor.
    pub fn reset(&mut self, capacity: usize) {
        self.data.clear();
        self.data.resize(capacity, 0);
        self.position = 0;
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn samples(&self) -> &[i32] {
        &self.data
    }

    /// Fill from `read` at the cursor, wrapping once if the first read runs
    /// to the end of the buffer. `read` returns how many samples it wrote
    /// into the slice it was given. Returns the total samples written.
    pub fn fill_from<F>(&mut self, mut read: F) -> usize
    where
        F: FnMut(&mut [i32]) -> usize,
    {
        let capacity = self.data.len();
        if capacity == 0 {
            return 0;
        }

        let position = self.position;
        let first = read(&mut self.data[position..]);
        if position + first < capacity {
            self.position = position + first;
            first
        } else {
            // Filled to the end; write the remainder from the start.
            let wrapped = read(&mut self.data[..position]);
            self.position = wrapped;
            first + wrapped
        }
    }
}
