//! Preallocated hidden-state and FFN-intermediate buffers with ping-pong
//! semantics, so successive layers alternate read/write without pool
//! traffic on the decode hot path.

use std::sync::Arc;

use runner_backend::device::{BufferHandle, BufferUsage, ComputeBackend, SizeClass};

pub struct DecodeBufferManager {
    device: Arc<dyn ComputeBackend>,
    hidden: BufferHandle,
    hidden_alt: BufferHandle,
    intermediate: BufferHandle,
    /// `false`: `hidden` is the input buffer for the next layer. `true`: `hidden_alt` is.
    flipped: bool,
}

impl DecodeBufferManager {
    pub fn new(device: Arc<dyn ComputeBackend>, hidden_size: usize, intermediate_size: usize, activation_bytes: usize) -> Self {
        let hidden = device.alloc(SizeClass::for_bytes(hidden_size * activation_bytes), BufferUsage::Storage);
        let hidden_alt = device.alloc(SizeClass::for_bytes(hidden_size * activation_bytes), BufferUsage::Storage);
        let intermediate = device.alloc(SizeClass::for_bytes(intermediate_size * activation_bytes), BufferUsage::Storage);
        Self { device, hidden, hidden_alt, intermediate, flipped: false }
    }

    pub fn current_hidden(&self) -> BufferHandle {
        if self.flipped { self.hidden_alt } else { self.hidden }
    }

    pub fn output_hidden(&self) -> BufferHandle {
        if self.flipped { self.hidden } else { self.hidden_alt }
    }

    pub fn intermediate(&self) -> BufferHandle { self.intermediate }

    pub fn swap_ping_pong(&mut self) { self.flipped = !self.flipped; }

    /// Restores the initial polarity at the start of each decode step.
    pub fn reset_ping_pong(&mut self) { self.flipped = false; }

    /// Authoritative discriminator: the main loop must never hand a
    /// manager-owned buffer to a recorder's `track_temporary` (design note §9).
    pub fn owns_buffer(&self, handle: BufferHandle) -> bool {
        handle == self.hidden || handle == self.hidden_alt || handle == self.intermediate
    }

    pub fn release(&mut self) {
        self.device.free(self.hidden);
        self.device.free(self.hidden_alt);
        self.device.free(self.intermediate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_backend::device::SimulatedDevice;

    fn manager() -> DecodeBufferManager {
        let dev: Arc<dyn ComputeBackend> = Arc::new(SimulatedDevice::new(8, 16, 2));
        DecodeBufferManager::new(dev, 8, 16, 4)
    }

    #[test]
    fn swap_ping_pong_alternates_input_and_output() {
        let mut mgr = manager();
        let in0 = mgr.current_hidden();
        let out0 = mgr.output_hidden();
        mgr.swap_ping_pong();
        assert_eq!(mgr.current_hidden(), out0);
        assert_eq!(mgr.output_hidden(), in0);
    }

    #[test]
    fn reset_restores_initial_polarity() {
        let mut mgr = manager();
        let in0 = mgr.current_hidden();
        mgr.swap_ping_pong();
        mgr.swap_ping_pong();
        mgr.swap_ping_pong();
        mgr.reset_ping_pong();
        assert_eq!(mgr.current_hidden(), in0);
    }

    #[test]
    fn owns_buffer_recognizes_all_three_buffers() {
        let mgr = manager();
        assert!(mgr.owns_buffer(mgr.current_hidden()));
        assert!(mgr.owns_buffer(mgr.output_hidden()));
        assert!(mgr.owns_buffer(mgr.intermediate()));
    }
}
