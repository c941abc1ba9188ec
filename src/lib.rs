#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! USB DFU bootloader core for SPI NOR flash, built on `usb-device`.
//!
//! ## About
//!
//! Implements the device side of DFU 1.1 (DFU mode only: interface class
//! `0xFE`, subclass `0x01`, protocol `0x02`) for boards whose firmware
//! lives in external SPI NOR flash, typically an FPGA bitstream plus
//! payload data. Each alternate setting of the DFU interface exposes one
//! *flash zone*, a `(chip, start, end)` region of flash; the host picks a
//! zone with SET_INTERFACE and streams 4 KiB blocks with DNLOAD.
//!
//! Downloads run through a two-slot ingress buffer: the control endpoint
//! fills one slot while the flash writer drains the other, so USB transfer
//! time and flash programming time overlap. The writer is verify-first:
//! every block is read back and classified before anything is touched,
//! sectors are erased only when a `0 -> 1` transition demands it and
//! programmed only when bytes differ. Re-flashing identical content issues
//! no erase and no program commands, and an interrupted session converges
//! when re-run.
//!
//! The crate is split along the hardware seams:
//!
//! * [`SpiBus`] — the only trait a board must implement: chip-select
//!   control plus a full-duplex byte exchange.
//! * [`NorFlash`] — JEDEC command wrappers (read, page program, sector and
//!   block erase, status, wake-up and reset sequencing).
//! * [`DoubleBuffer`] / [`FlashWriter`] — the ingress pipeline and the
//!   cooperative erase/verify/program task.
//! * [`DFUFunction`] — the DFU protocol machine over all of the above,
//!   independent of the USB stack.
//! * [`DFUClass`] — the `usb-device` class: descriptors, request routing,
//!   alternate settings.
//!
//! ## Limitations
//!
//! * All transfers use the control endpoint. The advertised wTransferSize
//!   is 4096 bytes, so the USB stack's control pipe must be able to carry
//!   4 KiB data stages.
//! * DFU run-time mode is not implemented; the device is assumed to boot
//!   straight into the bootloader. DFU_DETACH in DFU mode is honored
//!   non-standardly as "reboot into the user bitstream".
//!
//! ## DFU utilities
//!
//! Any standard DFU host tool can talk to this device, for example
//! [dfu-util](http://dfu-util.sourceforge.net/) or the
//! [dfu](https://crates.io/crates/dfu) crate.
//!
//! ## Example
//!
//! ```
//! use usb_device::bus::{UsbBus, UsbBusAllocator};
//! use usbd_dfu_nor::*;
//!
//! // The board provides raw SPI access...
//! struct BoardSpi;
//!
//! impl SpiBus for BoardSpi {
//!     fn select(&mut self, cs: u8) { /* drive CS low */ }
//!     fn deselect(&mut self, cs: u8) { /* drive CS high */ }
//!     fn exchange(&mut self, mosi: u8) -> u8 {
//!         /* shift one byte out, return the byte shifted in */
//!         0
//!     }
//! }
//!
//! // ...the flash layout, and a way out of the bootloader.
//! struct Board;
//!
//! impl DFUBoard for Board {
//!     const ZONES: &'static [FlashZone] = DEFAULT_ZONES;
//!
//!     fn reboot(&mut self) { /* jump to the user bitstream */ }
//! }
//!
//! fn setup<B: UsbBus>(alloc: &UsbBusAllocator<B>) -> DFUClass<B, BoardSpi, Board> {
//!     let mut dfu = DFUClass::new(alloc, BoardSpi, Board, EraseSize::Sector4k);
//!
//!     // The flash may still be in deep power-down from the previous
//!     // bitstream.
//!     dfu.function_mut().flash_mut().wake_up();
//!     dfu
//! }
//!
//! // In the main loop, next to every poll of the USB device:
//! //
//! //     usb_dev.poll(&mut [&mut dfu]);
//! //     dfu.tick();
//! ```
//!

#[cfg(feature = "defmt")]
macro_rules! dfu_debug {
    ($($arg:tt)*) => { ::defmt::debug!($($arg)*) };
}
#[cfg(not(feature = "defmt"))]
macro_rules! dfu_debug {
    ($($arg:tt)*) => {{}};
}

#[cfg(feature = "defmt")]
macro_rules! dfu_warn {
    ($($arg:tt)*) => { ::defmt::warn!($($arg)*) };
}
#[cfg(not(feature = "defmt"))]
macro_rules! dfu_warn {
    ($($arg:tt)*) => {{}};
}

/// Double-buffered ingress pipeline module.
pub mod buffer;
/// DFU protocol module.
pub mod class;
/// SPI NOR flash driver module.
pub mod flash;
/// SPI transport module.
pub mod spi;
/// Flash writer task module.
pub mod writer;

#[doc(inline)]
pub use crate::buffer::{DoubleBuffer, SLOT_SIZE};
#[doc(inline)]
pub use crate::class::{
    DFUBoard, DFUClass, DFUFunction, DFUState, DFUStatusCode, Response, MAX_ZONES,
};
#[doc(inline)]
pub use crate::flash::{FlashChip, FlashZone, NorFlash, DEFAULT_ZONES};
#[doc(inline)]
pub use crate::spi::{Chunk, SpiBus, VerifyResult};
#[doc(inline)]
pub use crate::writer::{EraseSize, FlashWriter};
