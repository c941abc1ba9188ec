#![allow(dead_code)]
//! Shared fixtures for driving the DFU function driver from tests.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

use usbd_dfu_nor::class::Response;
use usbd_dfu_nor::{DFUBoard, DFUFunction, EraseSize, FlashZone, DEFAULT_ZONES};

use crate::simflash::{SimBus, SimFlash};

// States
pub const APP_IDLE: u8 = 0;
pub const APP_DETACH: u8 = 1;
pub const DFU_IDLE: u8 = 2;
pub const DFU_DNLOAD_SYNC: u8 = 3;
pub const DFU_DN_BUSY: u8 = 4;
pub const DFU_DNLOAD_IDLE: u8 = 5;
pub const DFU_MANIFEST_SYNC: u8 = 6;
pub const DFU_MANIFEST: u8 = 7;
pub const DFU_MANIFEST_WAIT_RESET: u8 = 8;
pub const DFU_UPLOAD_IDLE: u8 = 9;
pub const DFU_ERROR: u8 = 10;

// Status codes
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_UNKNOWN: u8 = 0x0e;

// Requests
pub const REQ_DETACH: u8 = 0;
pub const REQ_DNLOAD: u8 = 1;
pub const REQ_UPLOAD: u8 = 2;
pub const REQ_GETSTATUS: u8 = 3;
pub const REQ_CLRSTATUS: u8 = 4;
pub const REQ_GETSTATE: u8 = 5;
pub const REQ_ABORT: u8 = 6;

/// bwPollTimeout the device always reports.
pub const POLL_MS: u32 = 5;

/// Deterministic payload data, distinct per seed.
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9e37_79b9) | 1;
    (0..len)
        .map(|_| {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (x >> 24) as u8
        })
        .collect()
}

/// Builds the 6-byte GETSTATUS reply.
pub fn status(status: u8, poll_timeout: u32, state: u8) -> [u8; 6] {
    let t = poll_timeout.to_le_bytes();
    [status, t[0], t[1], t[2], state, 0]
}

/// Class OUT request addressed to interface 0.
pub fn class_out(request: u8, value: u16, length: u16) -> Request {
    Request {
        direction: UsbDirection::Out,
        request_type: RequestType::Class,
        recipient: Recipient::Interface,
        request,
        value,
        index: 0,
        length,
    }
}

/// Class IN request addressed to interface 0.
pub fn class_in(request: u8, value: u16, length: u16) -> Request {
    Request {
        direction: UsbDirection::In,
        request_type: RequestType::Class,
        recipient: Recipient::Interface,
        request,
        value,
        index: 0,
        length,
    }
}

/// Board hooks with an observable reboot counter.
pub struct TestBoard {
    pub reboots: Rc<Cell<u32>>,
    pub ticks: Cell<u32>,
}

impl DFUBoard for TestBoard {
    const ZONES: &'static [FlashZone] = DEFAULT_ZONES;

    fn reboot(&mut self) {
        self.reboots.set(self.reboots.get() + 1);
    }

    fn tick_now(&self) -> u32 {
        self.ticks.get()
    }
}

/// A function driver wired to a simulated flash, plus the shared handles
/// the tests observe.
pub struct Rig {
    pub dfu: DFUFunction<SimBus, TestBoard>,
    pub flash: Rc<RefCell<SimFlash>>,
    pub reboots: Rc<Cell<u32>>,
}

impl Rig {
    /// A rig that has already reached the CONFIGURED state (`DfuIdle`,
    /// zone 0 selected).
    pub fn new() -> Self {
        let mut rig = Self::detached();
        rig.dfu.configured();
        rig
    }

    /// A rig still in `AppDetach`, as right after power-up.
    pub fn detached() -> Self {
        Self::build(EraseSize::Sector4k, false)
    }

    /// A configured rig with a chosen erase granularity.
    pub fn with_erase(erase: EraseSize) -> Self {
        Self::build(erase, true)
    }

    fn build(erase: EraseSize, configured: bool) -> Self {
        let flash = SimFlash::new();
        let reboots = Rc::new(Cell::new(0));
        let board = TestBoard {
            reboots: reboots.clone(),
            ticks: Cell::new(0),
        };
        let mut dfu = DFUFunction::new(SimBus::new(&flash), board, erase);
        if configured {
            dfu.configured();
        }
        Self {
            dfu,
            flash,
            reboots,
        }
    }

    /// DNLOAD with a data phase. `Ok` when the transfer was accepted.
    pub fn download(&mut self, block: u16, data: &[u8]) -> Result<(), ()> {
        let req = class_out(REQ_DNLOAD, block, data.len() as u16);
        match self.dfu.control_out(&req, data) {
            Response::Success(_) => Ok(()),
            Response::Error => Err(()),
            Response::Continue => panic!("DNLOAD not handled"),
        }
    }

    /// Zero-length DNLOAD (end of transfer).
    pub fn download_end(&mut self) -> Result<(), ()> {
        self.download(0, &[])
    }

    /// UPLOAD of `length` bytes.
    pub fn upload(&mut self, block: u16, length: u16) -> Result<Vec<u8>, ()> {
        let req = class_in(REQ_UPLOAD, block, length);
        match self.dfu.control_in(&req) {
            Response::Success(data) => Ok(data.to_vec()),
            Response::Error => Err(()),
            Response::Continue => panic!("UPLOAD not handled"),
        }
    }

    pub fn get_status(&mut self) -> Result<[u8; 6], ()> {
        let req = class_in(REQ_GETSTATUS, 0, 6);
        match self.dfu.control_in(&req) {
            Response::Success(data) => Ok(data.try_into().unwrap()),
            Response::Error => Err(()),
            Response::Continue => panic!("GETSTATUS not handled"),
        }
    }

    pub fn get_state(&mut self) -> Result<u8, ()> {
        let req = class_in(REQ_GETSTATE, 0, 1);
        match self.dfu.control_in(&req) {
            Response::Success(data) => Ok(data[0]),
            Response::Error => Err(()),
            Response::Continue => panic!("GETSTATE not handled"),
        }
    }

    pub fn abort(&mut self) -> Result<(), ()> {
        self.out_no_data(REQ_ABORT)
    }

    pub fn clear_status(&mut self) -> Result<(), ()> {
        self.out_no_data(REQ_CLRSTATUS)
    }

    pub fn detach(&mut self) -> Result<(), ()> {
        self.out_no_data(REQ_DETACH)
    }

    fn out_no_data(&mut self, request: u8) -> Result<(), ()> {
        let req = class_out(request, 0, 0);
        match self.dfu.control_out(&req, &[]) {
            Response::Success(_) => Ok(()),
            Response::Error => Err(()),
            Response::Continue => panic!("request not handled"),
        }
    }

    /// Runs `n` writer ticks.
    pub fn pump(&mut self, n: usize) {
        for _ in 0..n {
            self.dfu.tick();
        }
    }

    /// Pumps until the ingress buffer is drained.
    pub fn drain(&mut self) {
        for _ in 0..10_000 {
            if self.dfu.buffers_used() == 0 {
                return;
            }
            self.dfu.tick();
        }
        panic!("writer did not drain");
    }

    /// Command counter snapshot: (reads, programs, erases).
    pub fn spi_counts(&self) -> (u32, u32, u32) {
        let f = self.flash.borrow();
        (f.reads(), f.programs(), f.erases())
    }

    /// Clears the command counters.
    pub fn reset_counts(&mut self) {
        self.flash.borrow_mut().reset_counts();
    }
}
