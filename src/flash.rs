//! JEDEC command wrappers for SPI NOR flash.
//!
//! Thin layer over [`SpiBus`]: every operation is one chip-select-framed
//! transaction built from a command/address chunk and an optional payload
//! chunk. Addresses are 24-bit, sent big-endian after the opcode.
//!
//! The wrappers are infallible: the bus is on-board and physical transfer
//! errors are not detectable at this layer. Flash-level failures (worn or
//! protected sectors) show up as verify mismatches and are handled by the
//! writer's retry loop.

use crate::spi::{Chunk, SpiBus, VerifyResult};

const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_READ_SR1: u8 = 0x05;
const CMD_READ_DATA: u8 = 0x03;
const CMD_PAGE_PROGRAM: u8 = 0x02;
const CMD_SECTOR_ERASE_4K: u8 = 0x20;
const CMD_BLOCK_ERASE_32K: u8 = 0x52;
const CMD_BLOCK_ERASE_64K: u8 = 0xd8;
const CMD_WAKE_UP: u8 = 0xab;
const CMD_RESET_ENABLE: u8 = 0x66;
const CMD_RESET_EXECUTE: u8 = 0x99;
const CMD_QPI_EXIT: u8 = 0xff;
const CMD_READ_JEDEC_ID: u8 = 0x9f;

/// Status register 1 bit 0: write or erase in progress.
pub const SR1_BUSY: u8 = 0x01;

/// Size of a NOR flash programming page. Page programs must not cross a
/// page boundary.
pub const PAGE_SIZE: usize = 256;

/// The flash chips reachable from the bootloader, by chip-select line.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashChip {
    /// The on-board configuration flash.
    Internal = 0,
    /// The cartridge flash.
    Cart = 1,
}

impl FlashChip {
    /// Chip-select line index on the SPI bus.
    pub fn cs(self) -> u8 {
        self as u8
    }
}

/// A flash region writable through one DFU alternate setting.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashZone {
    /// Chip the zone lives on.
    pub chip: FlashChip,
    /// First byte address of the zone.
    pub start: u32,
    /// One past the last byte address of the zone.
    pub end: u32,
    /// Interface string shown to the host for this alternate setting.
    pub name: &'static str,
}

/// The zone table shipped with the board, indexed by alternate setting.
pub const DEFAULT_ZONES: &[FlashZone] = &[
    FlashZone {
        chip: FlashChip::Internal,
        start: 0x0020_0000,
        end: 0x0100_0000,
        name: "user bitstream",
    },
    FlashZone {
        chip: FlashChip::Internal,
        start: 0x0034_0000,
        end: 0x0038_0000,
        name: "soc firmware",
    },
    FlashZone {
        chip: FlashChip::Internal,
        start: 0x0038_0000,
        end: 0x0100_0000,
        name: "soc boot",
    },
    FlashZone {
        chip: FlashChip::Internal,
        start: 0x0040_0000,
        end: 0x0100_0000,
        name: "user data",
    },
    FlashZone {
        chip: FlashChip::Internal,
        start: 0x0080_0000,
        end: 0x0100_0000,
        name: "user data (high)",
    },
    FlashZone {
        chip: FlashChip::Internal,
        start: 0x0000_0000,
        end: 0x0020_0000,
        name: "bootloader bitstream",
    },
    FlashZone {
        chip: FlashChip::Cart,
        start: 0x0000_0000,
        end: 0x0000_0100,
        name: "cart rtc",
    },
];

/// SPI NOR flash driver over a byte-serial bus.
///
/// Holds the active chip select; all operations address the chip selected
/// by the last [`chip_select`](NorFlash::chip_select) call.
pub struct NorFlash<S: SpiBus> {
    spi: S,
    cs: u8,
}

impl<S: SpiBus> NorFlash<S> {
    /// Creates a driver with the internal chip selected.
    pub fn new(spi: S) -> Self {
        Self {
            spi,
            cs: FlashChip::Internal.cs(),
        }
    }

    /// Switches the active chip.
    pub fn chip_select(&mut self, chip: FlashChip) {
        self.cs = chip.cs();
    }

    /// Releases the bus driver.
    pub fn release(self) -> S {
        self.spi
    }

    fn command(&mut self, op: u8) {
        let mut cmd = [op];
        self.spi.xfer(
            self.cs,
            &mut [Chunk {
                data: &mut cmd,
                read: false,
                write: true,
            }],
        );
    }

    fn command_addr(op: u8, addr: u32) -> [u8; 4] {
        [op, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
    }

    /// Reads status register 1.
    pub fn read_sr(&mut self) -> u8 {
        let mut cmd = [CMD_READ_SR1];
        let mut sr = [0u8];
        self.spi.xfer(
            self.cs,
            &mut [
                Chunk {
                    data: &mut cmd,
                    read: false,
                    write: true,
                },
                Chunk {
                    data: &mut sr,
                    read: true,
                    write: false,
                },
            ],
        );
        sr[0]
    }

    /// True while a program or erase operation is in progress.
    pub fn busy(&mut self) -> bool {
        self.read_sr() & SR1_BUSY != 0
    }

    /// Sets the write-enable latch. Required before every program or erase.
    pub fn write_enable(&mut self) {
        self.command(CMD_WRITE_ENABLE);
    }

    /// Reads `dst.len()` bytes starting at `addr`.
    pub fn read(&mut self, dst: &mut [u8], addr: u32) {
        let mut cmd = Self::command_addr(CMD_READ_DATA, addr);
        self.spi.xfer(
            self.cs,
            &mut [
                Chunk {
                    data: &mut cmd,
                    read: false,
                    write: true,
                },
                Chunk {
                    data: dst,
                    read: true,
                    write: false,
                },
            ],
        );
    }

    /// Reads `expected.len()` bytes at `addr` and classifies them against
    /// `expected` without modifying it.
    pub fn verify(&mut self, expected: &mut [u8], addr: u32) -> VerifyResult {
        let mut cmd = Self::command_addr(CMD_READ_DATA, addr);
        self.spi.xfer_verify(
            self.cs,
            &mut [
                Chunk {
                    data: &mut cmd,
                    read: false,
                    write: true,
                },
                Chunk {
                    data: expected,
                    read: true,
                    write: false,
                },
            ],
        )
    }

    /// Programs `src` at `addr`.
    ///
    /// The caller must keep `src.len() <= 256` and `addr..addr + src.len()`
    /// within one 256-byte page, and must issue
    /// [`write_enable`](NorFlash::write_enable) first. `src` is not
    /// modified.
    pub fn page_program(&mut self, src: &mut [u8], addr: u32) {
        debug_assert!(src.len() <= PAGE_SIZE);
        debug_assert_eq!(
            addr as usize & !(PAGE_SIZE - 1),
            (addr as usize + src.len().max(1) - 1) & !(PAGE_SIZE - 1)
        );
        let mut cmd = Self::command_addr(CMD_PAGE_PROGRAM, addr);
        self.spi.xfer(
            self.cs,
            &mut [
                Chunk {
                    data: &mut cmd,
                    read: false,
                    write: true,
                },
                Chunk {
                    data: src,
                    read: false,
                    write: true,
                },
            ],
        );
    }

    fn erase(&mut self, op: u8, addr: u32) {
        let mut cmd = Self::command_addr(op, addr);
        self.spi.xfer(
            self.cs,
            &mut [Chunk {
                data: &mut cmd,
                read: false,
                write: true,
            }],
        );
    }

    /// Erases the 4 KiB sector containing `addr`.
    pub fn sector_erase_4k(&mut self, addr: u32) {
        self.erase(CMD_SECTOR_ERASE_4K, addr);
    }

    /// Erases the 32 KiB block containing `addr`.
    pub fn block_erase_32k(&mut self, addr: u32) {
        self.erase(CMD_BLOCK_ERASE_32K, addr);
    }

    /// Erases the 64 KiB block containing `addr`.
    pub fn block_erase_64k(&mut self, addr: u32) {
        self.erase(CMD_BLOCK_ERASE_64K, addr);
    }

    /// Releases the chip from deep power-down. Issued once at boot.
    pub fn wake_up(&mut self) {
        self.command(CMD_WAKE_UP);
    }

    /// Software reset: reset-enable followed by reset-execute.
    pub fn soft_reset(&mut self) {
        self.command(CMD_RESET_ENABLE);
        self.command(CMD_RESET_EXECUTE);
    }

    /// Exit-QPI command byte, for chips a previous bitstream may have left
    /// in QPI mode. Sent single-bit here; controllers with a quad data path
    /// should additionally clock it out in quad mode at boot.
    pub fn qpi_exit(&mut self) {
        self.command(CMD_QPI_EXIT);
    }

    /// Reads the 3-byte JEDEC manufacturer/device ID.
    pub fn read_jedec_id(&mut self) -> [u8; 3] {
        let mut cmd = [CMD_READ_JEDEC_ID];
        let mut id = [0u8; 3];
        self.spi.xfer(
            self.cs,
            &mut [
                Chunk {
                    data: &mut cmd,
                    read: false,
                    write: true,
                },
                Chunk {
                    data: &mut id,
                    read: true,
                    write: false,
                },
            ],
        );
        id
    }
}
