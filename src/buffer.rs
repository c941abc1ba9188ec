//! Double-buffered ingress pipeline between the USB control endpoint and
//! the flash writer.
//!
//! Two fixed slots: the USB side fills slot `wr` and commits; the writer
//! consumes slot `rd` and releases. Each side toggles only its own index,
//! `used` counts committed-but-unconsumed slots. Under the cooperative
//! execution model no further synchronization is needed; a port with
//! preemption between the USB and writer contexts must wrap the buffer in
//! its platform's mutex.

/// Size of one buffer slot, which is also the DFU transfer size.
pub const SLOT_SIZE: usize = 4096;

// The USB controller DMAs directly out of these slots; keep them word
// aligned.
#[repr(align(4))]
struct Slots([u8; 2 * SLOT_SIZE]);

/// Two-slot producer/consumer buffer.
pub struct DoubleBuffer {
    slots: Slots,
    used: u8,
    wr: u8,
    rd: u8,
}

impl DoubleBuffer {
    /// Creates an empty buffer with zeroed slots.
    pub fn new() -> Self {
        Self {
            slots: Slots([0; 2 * SLOT_SIZE]),
            used: 0,
            wr: 0,
            rd: 0,
        }
    }

    /// Number of committed slots, `0..=2`.
    pub fn used(&self) -> u8 {
        self.used
    }

    /// No slot committed.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Both slots committed; the producer must wait for the writer.
    pub fn is_full(&self) -> bool {
        self.used == 2
    }

    fn slot_mut(&mut self, idx: u8) -> &mut [u8] {
        let at = idx as usize * SLOT_SIZE;
        &mut self.slots.0[at..at + SLOT_SIZE]
    }

    /// The slot the producer may fill next.
    pub fn write_slot(&mut self) -> &mut [u8] {
        debug_assert!(!self.is_full());
        let wr = self.wr;
        self.slot_mut(wr)
    }

    /// Publishes the write slot to the consumer.
    pub fn commit(&mut self) {
        debug_assert!(self.used < 2);
        self.wr ^= 1;
        self.used += 1;
        self.check();
    }

    /// The slot the consumer is working on. Valid only while `used > 0`.
    pub fn read_slot(&mut self) -> &mut [u8] {
        debug_assert!(self.used > 0);
        let rd = self.rd;
        self.slot_mut(rd)
    }

    /// Returns the consumed slot to the producer.
    pub fn release(&mut self) {
        debug_assert!(self.used > 0);
        self.rd ^= 1;
        self.used -= 1;
        self.check();
    }

    /// Both slots as one contiguous 8 KiB scratch area.
    ///
    /// Handed to the vendor request handler; only safe to use while no
    /// download is in flight.
    pub fn scratch(&mut self) -> &mut [u8] {
        &mut self.slots.0
    }

    fn check(&self) {
        debug_assert!(self.used <= 2);
        if self.used == 1 {
            debug_assert_ne!(self.wr, self.rd);
        } else {
            debug_assert_eq!(self.wr, self.rd);
        }
    }
}

impl Default for DoubleBuffer {
    fn default() -> Self {
        Self::new()
    }
}
