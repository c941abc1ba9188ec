//! Simulated SPI NOR flash chips behind the `SpiBus` seam.
//!
//! Decodes the JEDEC command set at the wire level: write-enable latch,
//! status polling with a configurable busy duration, AND-semantics page
//! programming with intra-page address wrap, aligned sector/block erase to
//! 0xFF, and streaming reads. Every issued opcode is counted, which is how
//! the tests observe the verify-only fast path.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use usbd_dfu_nor::spi::SpiBus;

/// 16 MiB, the full 24-bit address space of the internal chip.
pub const INTERNAL_SIZE: usize = 16 * 1024 * 1024;
/// The tiny cartridge chip.
pub const CART_SIZE: usize = 256;

pub const CMD_WRITE_ENABLE: u8 = 0x06;
pub const CMD_READ_SR1: u8 = 0x05;
pub const CMD_READ_DATA: u8 = 0x03;
pub const CMD_PAGE_PROGRAM: u8 = 0x02;
pub const CMD_SECTOR_ERASE_4K: u8 = 0x20;
pub const CMD_BLOCK_ERASE_32K: u8 = 0x52;
pub const CMD_BLOCK_ERASE_64K: u8 = 0xd8;

const SR1_BUSY: u8 = 0x01;
const SR1_WEL: u8 = 0x02;

const PAGE: usize = 256;

/// One emulated chip.
pub struct SimChip {
    pub mem: Vec<u8>,
    /// Write-enable latch; set by 0x06, consumed by program/erase.
    pub wel: bool,
    /// Remaining status reads that still report busy.
    pub busy: u8,
    /// When set, program and erase commands are silently dropped,
    /// emulating a write-protected or failing chip.
    pub protected: bool,
}

impl SimChip {
    fn new(size: usize) -> Self {
        Self {
            mem: vec![0xff; size],
            wel: false,
            busy: 0,
            protected: false,
        }
    }

    fn mask(&self) -> u32 {
        self.mem.len() as u32 - 1
    }
}

/// The shared flash model: both chips plus per-opcode command counters.
pub struct SimFlash {
    pub chips: [SimChip; 2],
    /// Number of status reads that report busy after a program or erase.
    pub busy_polls: u8,
    cmd: [u32; 256],
}

impl SimFlash {
    /// Fresh (all-0xFF) chips behind a shared handle.
    pub fn new() -> Rc<RefCell<SimFlash>> {
        Rc::new(RefCell::new(SimFlash {
            chips: [SimChip::new(INTERNAL_SIZE), SimChip::new(CART_SIZE)],
            busy_polls: 1,
            cmd: [0; 256],
        }))
    }

    /// How many times `op` was issued.
    pub fn count(&self, op: u8) -> u32 {
        self.cmd[op as usize]
    }

    /// Total erase commands of any granularity.
    pub fn erases(&self) -> u32 {
        self.count(CMD_SECTOR_ERASE_4K) + self.count(CMD_BLOCK_ERASE_32K) + self.count(CMD_BLOCK_ERASE_64K)
    }

    /// Total page program commands.
    pub fn programs(&self) -> u32 {
        self.count(CMD_PAGE_PROGRAM)
    }

    /// Total read commands (verify reads included).
    pub fn reads(&self) -> u32 {
        self.count(CMD_READ_DATA)
    }

    /// Clears all command counters.
    pub fn reset_counts(&mut self) {
        self.cmd = [0; 256];
    }

    /// Directly overwrites memory, bypassing the wire protocol.
    pub fn load(&mut self, chip: usize, addr: u32, data: &[u8]) {
        let at = addr as usize;
        self.chips[chip].mem[at..at + data.len()].copy_from_slice(data);
    }

    /// Memory snapshot of a region.
    pub fn dump(&self, chip: usize, addr: u32, len: usize) -> Vec<u8> {
        let at = addr as usize;
        self.chips[chip].mem[at..at + len].to_vec()
    }
}

enum Dec {
    Opcode,
    Addr { op: u8, left: u8, addr: u32 },
    Read { addr: u32 },
    Program { collected: usize },
    Status,
    Jedec { at: usize },
    Ignore,
}

enum Commit {
    None,
    Program { addr: u32 },
    Erase { op: u8, addr: u32 },
}

/// `SpiBus` implementation over a shared [`SimFlash`].
pub struct SimBus {
    flash: Rc<RefCell<SimFlash>>,
    selected: Option<u8>,
    dec: Dec,
    commit: Commit,
    page: [u8; PAGE],
    page_len: usize,
}

impl SimBus {
    pub fn new(flash: &Rc<RefCell<SimFlash>>) -> Self {
        Self {
            flash: flash.clone(),
            selected: None,
            dec: Dec::Opcode,
            commit: Commit::None,
            page: [0; PAGE],
            page_len: 0,
        }
    }

    fn begin(&mut self, op: u8) -> Dec {
        let mut flash = self.flash.borrow_mut();
        flash.cmd[op as usize] += 1;
        let chip = &mut flash.chips[self.selected.unwrap() as usize];

        // A busy chip only answers status polls.
        if chip.busy > 0 && op != CMD_READ_SR1 {
            return Dec::Ignore;
        }

        match op {
            CMD_READ_SR1 => Dec::Status,
            CMD_WRITE_ENABLE => {
                chip.wel = true;
                Dec::Ignore
            }
            CMD_READ_DATA => Dec::Addr { op, left: 3, addr: 0 },
            CMD_PAGE_PROGRAM => Dec::Addr { op, left: 3, addr: 0 },
            CMD_SECTOR_ERASE_4K | CMD_BLOCK_ERASE_32K | CMD_BLOCK_ERASE_64K => {
                Dec::Addr { op, left: 3, addr: 0 }
            }
            0x9f => Dec::Jedec { at: 0 },
            // wake-up, reset sequencing, QPI exit and anything else: no
            // observable effect on the model
            _ => Dec::Ignore,
        }
    }

    fn finish(&mut self) {
        let cs = self.selected.unwrap() as usize;
        let mut flash = self.flash.borrow_mut();
        let busy_polls = flash.busy_polls;
        let chip = &mut flash.chips[cs];

        match self.commit {
            Commit::None => {}
            Commit::Program { addr } => {
                if chip.wel && !chip.protected {
                    let mask = chip.mask();
                    let base = addr & mask & !(PAGE as u32 - 1);
                    let col = (addr & (PAGE as u32 - 1)) as usize;
                    for (i, b) in self.page[..self.page_len].iter().enumerate() {
                        // programming clears bits, and wraps inside the page
                        let at = base as usize + ((col + i) % PAGE);
                        chip.mem[at] &= b;
                    }
                    chip.busy = busy_polls;
                }
                chip.wel = false;
            }
            Commit::Erase { op, addr } => {
                if chip.wel && !chip.protected {
                    let size = match op {
                        CMD_SECTOR_ERASE_4K => 4096usize,
                        CMD_BLOCK_ERASE_32K => 32768,
                        _ => 65536,
                    };
                    let size = size.min(chip.mem.len());
                    let base = (addr as usize & chip.mask() as usize) & !(size - 1);
                    chip.mem[base..base + size].fill(0xff);
                    chip.busy = busy_polls;
                }
                chip.wel = false;
            }
        }
        self.commit = Commit::None;
        self.page_len = 0;
    }
}

impl SpiBus for SimBus {
    fn select(&mut self, cs: u8) {
        assert!(self.selected.is_none(), "nested chip select");
        assert!((cs as usize) < 2, "unknown chip select line");
        self.selected = Some(cs);
        self.dec = Dec::Opcode;
    }

    fn deselect(&mut self, cs: u8) {
        assert_eq!(self.selected, Some(cs), "deselect without select");
        self.finish();
        self.selected = None;
        self.dec = Dec::Opcode;
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        assert!(self.selected.is_some(), "exchange without chip select");
        let cs = self.selected.unwrap() as usize;

        match self.dec {
            Dec::Opcode => {
                self.dec = self.begin(mosi);
                0
            }
            Dec::Addr { op, left, addr } => {
                let addr = (addr << 8) | mosi as u32;
                if left > 1 {
                    self.dec = Dec::Addr {
                        op,
                        left: left - 1,
                        addr,
                    };
                } else {
                    self.dec = match op {
                        CMD_READ_DATA => Dec::Read { addr },
                        CMD_PAGE_PROGRAM => {
                            self.commit = Commit::Program { addr };
                            Dec::Program { collected: 0 }
                        }
                        _ => {
                            self.commit = Commit::Erase { op, addr };
                            Dec::Ignore
                        }
                    };
                }
                0
            }
            Dec::Read { addr } => {
                let flash = self.flash.borrow();
                let chip = &flash.chips[cs];
                let b = chip.mem[(addr & chip.mask()) as usize];
                drop(flash);
                self.dec = Dec::Read {
                    addr: addr.wrapping_add(1),
                };
                b
            }
            Dec::Program { collected } => {
                if collected < PAGE {
                    self.page[collected] = mosi;
                    self.page_len = collected + 1;
                } else {
                    // page buffer overrun: chips keep only the last page;
                    // the driver never sends more than 256 bytes
                    panic!("page program longer than one page");
                }
                self.dec = Dec::Program {
                    collected: collected + 1,
                };
                0
            }
            Dec::Status => {
                let mut flash = self.flash.borrow_mut();
                let chip = &mut flash.chips[cs];
                let mut sr = 0;
                if chip.busy > 0 {
                    chip.busy -= 1;
                    sr |= SR1_BUSY;
                }
                if chip.wel {
                    sr |= SR1_WEL;
                }
                sr
            }
            Dec::Jedec { at } => {
                const ID: [u8; 3] = [0xef, 0x40, 0x18];
                self.dec = Dec::Jedec { at: at + 1 };
                ID.get(at).copied().unwrap_or(0)
            }
            Dec::Ignore => 0,
        }
    }
}
