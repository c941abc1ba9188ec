//! Cooperative flash writer.
//!
//! Consumes committed buffer slots and makes the flash byte-equal to them,
//! verify-first: every slot is read back and classified before anything is
//! erased or programmed, so re-flashing identical content touches nothing
//! and interrupted sessions converge on restart. One tick performs one
//! step of the erase/verify/program loop and never waits for the chip;
//! while the flash reports busy the tick returns immediately.

use crate::buffer::{DoubleBuffer, SLOT_SIZE};
use crate::class::DFUBoard;
use crate::flash::{FlashChip, FlashZone, NorFlash, PAGE_SIZE};
use crate::spi::{SpiBus, VerifyResult};

/// Erase or program attempts per buffer before the writer gives up.
const RETRY_LIMIT: u8 = 4;

/// Erase granularity, fixed at construction.
///
/// The default for this board is 4 KiB, matching the buffer slot size.
/// The larger block erases are only correct when the active zone is
/// aligned to the erase size and the host streams enough buffers to fill
/// a whole erase block, since each erase wipes the full block containing
/// the write cursor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EraseSize {
    /// 4 KiB sector erase (0x20).
    Sector4k,
    /// 32 KiB block erase (0x52).
    Block32k,
    /// 64 KiB block erase (0xD8).
    Block64k,
}

impl EraseSize {
    /// Bytes returned to the all-ones state by one erase.
    pub const fn bytes(self) -> u32 {
        match self {
            EraseSize::Sector4k => 4096,
            EraseSize::Block32k => 32768,
            EraseSize::Block64k => 65536,
        }
    }

    fn issue<S: SpiBus>(self, flash: &mut NorFlash<S>, addr: u32) {
        match self {
            EraseSize::Sector4k => flash.sector_erase_4k(addr),
            EraseSize::Block32k => flash.block_erase_32k(addr),
            EraseSize::Block64k => flash.block_erase_64k(addr),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Idle,
    Erase,
    Program,
}

/// The flash writer task state.
///
/// Owns the address cursors of the active zone:
///
/// * `addr_recv` — next offset the host may send (download bounds check),
/// * `addr_read` — next offset upload reads from,
/// * `addr_prog` — next offset the writer will program,
/// * `addr_erase` — rolling marker up to which erasure is guaranteed,
/// * `addr_end` — exclusive upper bound of the zone.
pub struct FlashWriter {
    pub(crate) addr_recv: u32,
    pub(crate) addr_read: u32,
    pub(crate) addr_prog: u32,
    pub(crate) addr_erase: u32,
    pub(crate) addr_end: u32,
    pub(crate) selected: FlashChip,
    erase: EraseSize,
    op: Op,
    op_ofs: usize,
    op_len: usize,
    should: VerifyResult,
    retry: u8,
}

impl FlashWriter {
    /// Creates an idle writer with the given erase granularity.
    ///
    /// The cursors are zero until [`start_zone`](FlashWriter::start_zone)
    /// points the writer at a flash zone.
    pub fn new(erase: EraseSize) -> Self {
        Self {
            addr_recv: 0,
            addr_read: 0,
            addr_prog: 0,
            addr_erase: 0,
            addr_end: 0,
            selected: FlashChip::Internal,
            erase,
            op: Op::Idle,
            op_ofs: 0,
            op_len: 0,
            should: VerifyResult::MATCH,
            retry: RETRY_LIMIT,
        }
    }

    /// Resets all cursors to the start of `zone` and records its chip.
    pub fn start_zone(&mut self, zone: &FlashZone) {
        self.addr_recv = zone.start;
        self.addr_read = zone.start;
        self.addr_prog = zone.start;
        self.addr_erase = zone.start;
        self.addr_end = zone.end;
        self.selected = zone.chip;
    }

    /// Next byte offset the writer will program.
    pub fn program_address(&self) -> u32 {
        self.addr_prog
    }

    /// Next byte offset the host is allowed to send.
    pub fn receive_address(&self) -> u32 {
        self.addr_recv
    }

    /// Next byte offset an upload will read from.
    pub fn read_address(&self) -> u32 {
        self.addr_read
    }

    /// No operation in progress and nothing picked up.
    pub fn is_idle(&self) -> bool {
        self.op == Op::Idle
    }

    /// Runs one step of the erase/verify/program loop.
    ///
    /// Intended to be pumped from the main loop at a bounded rate; the
    /// status handler also pumps it synchronously while draining the
    /// manifest phase. The busy bit is tested once per tick, never polled
    /// in a loop.
    pub fn tick<S: SpiBus, H: DFUBoard>(
        &mut self,
        flash: &mut NorFlash<S>,
        buf: &mut DoubleBuffer,
        board: &mut H,
    ) {
        if self.op == Op::Idle {
            if buf.is_empty() {
                return;
            }
            // Pick up the next committed slot.
            self.op = Op::Erase;
            self.op_len = SLOT_SIZE;
            self.op_ofs = 0;
        } else if flash.busy() {
            return;
        }

        flash.chip_select(self.selected);

        if self.retry == 0 {
            // The sector refuses to take data: either write-protected or
            // failing. Drop the buffer without advancing and hand control
            // back to the board; the host sees the device leave the bus.
            dfu_warn!(
                "verify failed after {=u8} attempts @ {=u32:x}",
                RETRY_LIMIT,
                self.addr_prog
            );
            self.op = Op::Idle;
            buf.release();
            board.reboot();
            return;
        }

        if self.op == Op::Erase {
            let should = flash.verify(buf.read_slot(), self.addr_prog);
            self.should = should;
            dfu_debug!(
                "verify @ {=u32:x}: should={=u8} t={=u32}",
                self.addr_prog,
                should.bits(),
                board.tick_now()
            );
            if !should.needs_erase() {
                // Already erased (or never was); account it and move on.
                self.addr_erase = self.addr_prog + self.erase.bytes();
                self.op = Op::Program;
            } else {
                self.retry -= 1;
                self.addr_erase = self.addr_prog;
                dfu_debug!(
                    "erase {=u32} @ {=u32:x}, {=u8} retries left",
                    self.erase.bytes(),
                    self.addr_erase,
                    self.retry
                );
                flash.write_enable();
                self.erase.issue(flash, self.addr_erase);
                self.addr_erase += self.erase.bytes();
            }
        }

        if self.op == Op::Program {
            if !self.should.needs_program() {
                // Verified clean: the slot is on flash.
                self.retry = RETRY_LIMIT;
                self.addr_prog += self.op_len as u32;
                buf.release();
                self.op = Op::Idle;
            } else if self.op_ofs == self.op_len {
                // Programming pass complete; go back and verify it took.
                self.retry -= 1;
                self.op_len = SLOT_SIZE;
                self.op_ofs = 0;
                self.op = Op::Idle;
            } else {
                let addr = self.addr_prog + self.op_ofs as u32;
                // Never cross a 256-byte page.
                let len =
                    (self.op_len - self.op_ofs).min(PAGE_SIZE - (addr as usize & (PAGE_SIZE - 1)));
                dfu_debug!("program {=usize} @ {=u32:x}", len, addr);
                flash.write_enable();
                let ofs = self.op_ofs;
                flash.page_program(&mut buf.read_slot()[ofs..ofs + len], addr);
                self.op_ofs += len;
            }
        }
    }
}
