//! DFU protocol machine and `usb-device` class glue.

use core::marker::PhantomData;
use usb_device::{class_prelude::*, control::Request};

use crate::buffer::{DoubleBuffer, SLOT_SIZE};
use crate::flash::{FlashZone, NorFlash};
use crate::spi::SpiBus;
use crate::writer::{EraseSize, FlashWriter};

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xfe;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

const DESC_DESCTYPE_DFU: u8 = 0x21;

const DFU_DETACH: u8 = 0x00;
const DFU_DNLOAD: u8 = 0x01;
const DFU_UPLOAD: u8 = 0x02;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;
const DFU_GETSTATE: u8 = 0x05;
const DFU_ABORT: u8 = 0x06;

// bwPollTimeout reported in every GETSTATUS reply, in milliseconds.
const POLL_TIMEOUT_MS: u32 = 5;

/// Upper bound on the number of flash zones a board may declare.
pub const MAX_ZONES: usize = 8;

/// DFU 1.1 device state.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DFUState {
    /// Running the normal application (run-time mode; unused here).
    AppIdle = 0,
    /// Waiting for a USB reset after DFU_DETACH. Also the state the
    /// machine boots in, left when the device reaches CONFIGURED.
    AppDetach = 1,
    /// In DFU mode, waiting for requests.
    DfuIdle = 2,
    /// A block was received; waiting for GETSTATUS.
    DfuDnloadSync = 3,
    /// Busy programming; reported by GETSTATUS while both buffer slots
    /// are committed. The machine itself never rests in this state.
    DfuDnBusy = 4,
    /// Download in progress, expecting more DNLOAD requests.
    DfuDnloadIdle = 5,
    /// Final block received; waiting for GETSTATUS to start the
    /// manifestation phase.
    DfuManifestSync = 6,
    /// Manifestation phase.
    DfuManifest = 7,
    /// Waiting for reset after manifestation (manifestation-intolerant
    /// devices only; unused here).
    DfuManifestWaitReset = 8,
    /// Upload in progress, expecting more UPLOAD requests.
    DfuUploadIdle = 9,
    /// An error occurred; awaiting CLRSTATUS.
    DfuError = 10,
}

/// DFU 1.1 status code, reported in GETSTATUS.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DFUStatusCode {
    /// No error.
    Ok = 0x00,
    /// File is not targeted for this device.
    ErrTarget = 0x01,
    /// File fails a vendor-specific verification test.
    ErrFile = 0x02,
    /// Unable to write memory.
    ErrWrite = 0x03,
    /// Erase failed.
    ErrErase = 0x04,
    /// Erase check failed.
    ErrCheckErased = 0x05,
    /// Program failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Received address out of range.
    ErrAddress = 0x08,
    /// DNLOAD with wLength = 0, but the device expects more data.
    ErrNotdone = 0x09,
    /// Firmware is corrupt.
    ErrFirmware = 0x0a,
    /// Vendor-specific error.
    ErrVendor = 0x0b,
    /// Unexpected USB reset.
    ErrUsbr = 0x0c,
    /// Unexpected power-on reset.
    ErrPOR = 0x0d,
    /// Unknown error.
    ErrUnknown = 0x0e,
    /// Unexpected request was stalled.
    ErrStalledPkt = 0x0f,
}

const fn req_bit(request: u8) -> u8 {
    1 << request
}

// Requests each state accepts. Anything else drops the machine into
// DfuError with ErrUnknown.
const VALID_REQUESTS: [u8; 11] = [
    // appIDLE
    req_bit(DFU_DETACH) | req_bit(DFU_GETSTATUS) | req_bit(DFU_GETSTATE),
    // appDETACH
    req_bit(DFU_GETSTATUS) | req_bit(DFU_GETSTATE),
    // dfuIDLE; DETACH is non-standard here and reboots to the user
    // bitstream
    req_bit(DFU_DETACH)
        | req_bit(DFU_DNLOAD)
        | req_bit(DFU_UPLOAD)
        | req_bit(DFU_GETSTATUS)
        | req_bit(DFU_GETSTATE)
        | req_bit(DFU_ABORT),
    // dfuDNLOAD_SYNC
    req_bit(DFU_DNLOAD) | req_bit(DFU_GETSTATUS) | req_bit(DFU_GETSTATE) | req_bit(DFU_ABORT),
    // dfuDNBUSY
    0,
    // dfuDNLOAD_IDLE
    req_bit(DFU_DNLOAD) | req_bit(DFU_GETSTATUS) | req_bit(DFU_GETSTATE) | req_bit(DFU_ABORT),
    // dfuMANIFEST_SYNC
    req_bit(DFU_GETSTATUS) | req_bit(DFU_GETSTATE) | req_bit(DFU_ABORT),
    // dfuMANIFEST
    0,
    // dfuMANIFEST_WAIT_RESET
    0,
    // dfuUPLOAD_IDLE
    req_bit(DFU_UPLOAD) | req_bit(DFU_GETSTATUS) | req_bit(DFU_GETSTATE) | req_bit(DFU_ABORT),
    // dfuERROR
    req_bit(DFU_GETSTATUS) | req_bit(DFU_CLRSTATUS) | req_bit(DFU_GETSTATE),
];

/// Disposition of a control request offered to the function driver.
pub enum Response<'a> {
    /// Not addressed to this function; offer it to the next handler.
    Continue,
    /// Handled. The slice is the reply for IN requests, empty for OUT
    /// requests.
    Success(&'a [u8]),
    /// Rejected; the control transfer must be stalled.
    Error,
}

/// Board integration for the DFU core.
///
/// Carries the compile-time flash layout and the few hooks the core needs
/// from the surrounding firmware.
pub trait DFUBoard {
    /// Flash zone table, indexed by the DFU interface's alternate setting.
    ///
    /// Must have between 1 and [`MAX_ZONES`] entries.
    /// [`DEFAULT_ZONES`](crate::flash::DEFAULT_ZONES) is the table shipped
    /// with the board.
    const ZONES: &'static [FlashZone];

    /// wDetachTimeOut advertised in the DFU functional descriptor.
    const DETACH_TIMEOUT: u16 = 250;

    /// Leave the bootloader: jump to the user bitstream or reset the
    /// device. Called on DFU_DETACH, on bus reset outside `AppDetach`,
    /// and when the writer exhausts its retries. May not return.
    fn reboot(&mut self);

    /// Monotonic tick, used only for debug output.
    fn tick_now(&self) -> u32 {
        0
    }

    /// Vendor-specific request on the DFU interface.
    ///
    /// `data` holds the OUT data phase (empty for IN requests); `scratch`
    /// is the full 8 KiB double buffer for the handler's use, and IN
    /// replies are returned as a slice of it. The default declines
    /// everything.
    fn vendor_request<'a>(
        &mut self,
        req: &Request,
        data: &[u8],
        scratch: &'a mut [u8],
    ) -> Response<'a> {
        let _ = (req, data, scratch);
        Response::Continue
    }
}

/// The DFU function driver: protocol machine, double buffer, flash writer
/// and flash driver in one owned aggregate.
///
/// This layer is independent of the USB stack; [`DFUClass`] adapts it to
/// `usb-device`. Every method runs to completion between writer ticks,
/// which is what makes the shared buffer occupancy safe without locking.
pub struct DFUFunction<S: SpiBus, H: DFUBoard> {
    state: DFUState,
    status: DFUStatusCode,
    alt: u8,
    reboot_pending: bool,
    buf: DoubleBuffer,
    writer: FlashWriter,
    flash: NorFlash<S>,
    board: H,
    reply: [u8; 6],
}

impl<S: SpiBus, H: DFUBoard> DFUFunction<S, H> {
    /// Creates the function driver over the given bus.
    ///
    /// The machine starts in `AppDetach` with zone 0 selected, and enters
    /// `DfuIdle` when [`configured`](DFUFunction::configured) is called.
    pub fn new(spi: S, board: H, erase: EraseSize) -> Self {
        let zone = &H::ZONES[0];
        let mut writer = FlashWriter::new(erase);
        writer.start_zone(zone);
        let mut flash = NorFlash::new(spi);
        flash.chip_select(zone.chip);
        Self {
            state: DFUState::AppDetach,
            status: DFUStatusCode::Ok,
            alt: 0,
            reboot_pending: false,
            buf: DoubleBuffer::new(),
            writer,
            flash,
            board,
            reply: [0; 6],
        }
    }

    /// Current DFU state.
    pub fn state(&self) -> DFUState {
        self.state
    }

    /// Current DFU status code.
    pub fn status(&self) -> DFUStatusCode {
        self.status
    }

    /// Committed-but-unwritten buffer slots, `0..=2`.
    pub fn buffers_used(&self) -> u8 {
        self.buf.used()
    }

    /// Next byte offset the writer will program.
    pub fn program_address(&self) -> u32 {
        self.writer.program_address()
    }

    /// Next byte offset the host is allowed to send.
    pub fn receive_address(&self) -> u32 {
        self.writer.receive_address()
    }

    /// Next byte offset an upload reads from.
    pub fn read_address(&self) -> u32 {
        self.writer.read_address()
    }

    /// The board hooks.
    pub fn board(&self) -> &H {
        &self.board
    }

    /// Mutable access to the board hooks.
    pub fn board_mut(&mut self) -> &mut H {
        &mut self.board
    }

    /// The flash driver, e.g. for boot-time wake-up and reset sequencing.
    pub fn flash_mut(&mut self) -> &mut NorFlash<S> {
        &mut self.flash
    }

    /// The USB device reached the CONFIGURED state.
    pub fn configured(&mut self) {
        self.state = DFUState::DfuIdle;
    }

    /// USB bus reset. Reboots unless the machine is still in `AppDetach`
    /// (the reset that starts the session).
    pub fn bus_reset(&mut self) {
        if self.state != DFUState::AppDetach {
            self.board.reboot();
        }
    }

    /// Host selected an alternate setting on the DFU interface.
    ///
    /// Resets every address cursor to the zone's start and selects its
    /// chip. Returns `false` for an out-of-table setting.
    pub fn set_interface(&mut self, alt: u8) -> bool {
        let Some(zone) = H::ZONES.get(alt as usize) else {
            return false;
        };
        self.state = DFUState::DfuIdle;
        self.alt = alt;
        self.writer.start_zone(zone);
        self.flash.chip_select(zone.chip);
        true
    }

    /// Currently selected alternate setting.
    pub fn interface(&self) -> u8 {
        self.alt
    }

    /// Runs one cooperative step: a pending detach reboot, or one writer
    /// tick. Pump this from the main loop at a bounded rate.
    pub fn tick(&mut self) {
        if self.reboot_pending {
            self.reboot_pending = false;
            self.board.reboot();
            return;
        }
        self.tick_writer();
    }

    fn tick_writer(&mut self) {
        let Self {
            writer,
            flash,
            buf,
            board,
            ..
        } = self;
        writer.tick(flash, buf, board);
    }

    /// Handles an OUT class request addressed to the DFU interface.
    ///
    /// `data` is the completed data phase (empty for no-data requests).
    pub fn control_out(&mut self, req: &Request, data: &[u8]) -> Response<'_> {
        if !self.request_allowed(req.request) {
            return self.protocol_error();
        }

        match req.request {
            DFU_DETACH => {
                // Non-standard in DFU mode: treated as "reboot to user
                // bitstream", deferred one tick so the status stage
                // reaches the host first.
                self.reboot_pending = true;
                Response::Success(&[])
            }
            DFU_DNLOAD => self.download(req, data),
            DFU_CLRSTATUS => {
                self.state = DFUState::DfuIdle;
                self.status = DFUStatusCode::Ok;
                Response::Success(&[])
            }
            DFU_ABORT => {
                // Cursors keep their values; only SET_INTERFACE rewinds.
                self.state = DFUState::DfuIdle;
                Response::Success(&[])
            }
            _ => self.protocol_error(),
        }
    }

    /// Handles an IN class request addressed to the DFU interface.
    pub fn control_in(&mut self, req: &Request) -> Response<'_> {
        if !self.request_allowed(req.request) {
            return self.protocol_error();
        }

        match req.request {
            DFU_UPLOAD => self.upload(req),
            DFU_GETSTATUS => self.get_status(req),
            DFU_GETSTATE => {
                if req.length < 1 {
                    return self.protocol_error();
                }
                self.reply[0] = self.state as u8;
                Response::Success(&self.reply[..1])
            }
            _ => self.protocol_error(),
        }
    }

    /// Delegates a vendor OUT request with the double buffer as scratch.
    pub fn vendor_out(&mut self, req: &Request, data: &[u8]) -> Response<'_> {
        let Self { board, buf, .. } = self;
        board.vendor_request(req, data, buf.scratch())
    }

    /// Delegates a vendor IN request with the double buffer as scratch.
    pub fn vendor_in(&mut self, req: &Request) -> Response<'_> {
        let Self { board, buf, .. } = self;
        board.vendor_request(req, &[], buf.scratch())
    }

    fn request_allowed(&self, request: u8) -> bool {
        request <= DFU_ABORT && VALID_REQUESTS[self.state as usize] & req_bit(request) != 0
    }

    fn protocol_error(&mut self) -> Response<'static> {
        self.state = DFUState::DfuError;
        self.status = DFUStatusCode::ErrUnknown;
        Response::Error
    }

    fn download(&mut self, req: &Request, data: &[u8]) -> Response<'_> {
        if req.length == 0 {
            // End of transfer.
            self.state = DFUState::DfuManifestSync;
            return Response::Success(&[]);
        }

        if req.length as usize > SLOT_SIZE {
            return self.protocol_error();
        }

        let Some(recv) = self.writer.addr_recv.checked_add(req.length as u32) else {
            return self.protocol_error();
        };
        if recv > self.writer.addr_end {
            // The receive cursor stays advanced past the end; CLRSTATUS
            // restores the state only and does not rewind it.
            self.writer.addr_recv = recv;
            return self.protocol_error();
        }

        if self.buf.is_full() {
            // No free slot. A conforming host polls GETSTATUS until the
            // writer frees one and retries the block; fail this transfer
            // without moving the cursor so the retry lands where this
            // one would have.
            return Response::Error;
        }

        self.writer.addr_recv = recv;
        let slot = self.buf.write_slot();
        let len = data.len().min(SLOT_SIZE);
        slot[..len].copy_from_slice(&data[..len]);
        slot[len..].fill(0xff);
        self.buf.commit();
        self.state = DFUState::DfuDnloadSync;
        Response::Success(&[])
    }

    fn upload(&mut self, req: &Request) -> Response<'_> {
        let remain = self.writer.addr_end.saturating_sub(self.writer.addr_read);
        let len = (req.length as u32).min(remain).min(SLOT_SIZE as u32) as usize;

        // A short (end-of-zone) reply tells the host the upload is done.
        self.state = if (len as u32) < req.length as u32 {
            DFUState::DfuIdle
        } else {
            DFUState::DfuUploadIdle
        };

        let Self {
            writer, flash, buf, ..
        } = self;
        flash.chip_select(writer.selected);
        let data = buf.scratch();
        if len > 0 {
            flash.read(&mut data[..len], writer.addr_read);
            writer.addr_read += len as u32;
        }
        Response::Success(&data[..len])
    }

    fn get_status(&mut self, req: &Request) -> Response<'_> {
        if req.length < 6 {
            return self.protocol_error();
        }

        let reported = match self.state {
            DFUState::DfuDnloadSync => {
                if self.buf.used() < 2 {
                    self.state = DFUState::DfuDnloadIdle;
                    DFUState::DfuDnloadIdle
                } else {
                    // Both slots committed: report busy, stay in sync.
                    DFUState::DfuDnBusy
                }
            }
            DFUState::DfuManifestSync => {
                // dfu-util inserts a 1 s delay unless the device answers
                // idle immediately, so drain the writer here instead of
                // obeying the poll timeout.
                self.state = DFUState::DfuIdle;
                while !self.buf.is_empty() {
                    self.tick_writer();
                }
                DFUState::DfuIdle
            }
            s => s,
        };

        self.reply = [
            self.status as u8,
            POLL_TIMEOUT_MS as u8,
            (POLL_TIMEOUT_MS >> 8) as u8,
            (POLL_TIMEOUT_MS >> 16) as u8,
            reported as u8,
            0,
        ];
        Response::Success(&self.reply)
    }
}

/// DFU class for `usb-device`: descriptor emission, request filtering and
/// alternate-setting plumbing around a [`DFUFunction`].
pub struct DFUClass<B: UsbBus, S: SpiBus, H: DFUBoard> {
    func: DFUFunction<S, H>,
    if_num: InterfaceNumber,
    zone_names: [Option<StringIndex>; MAX_ZONES],
    _bus: PhantomData<B>,
}

impl<B: UsbBus, S: SpiBus, H: DFUBoard> DFUClass<B, S, H> {
    /// Creates the class and allocates its interface and per-zone strings.
    ///
    /// Panics if the board declares no zones or more than [`MAX_ZONES`].
    pub fn new(alloc: &UsbBusAllocator<B>, spi: S, board: H, erase: EraseSize) -> Self {
        assert!(!H::ZONES.is_empty() && H::ZONES.len() <= MAX_ZONES);
        let mut zone_names: [Option<StringIndex>; MAX_ZONES] = Default::default();
        for name in zone_names.iter_mut().take(H::ZONES.len()) {
            *name = Some(alloc.string());
        }
        Self {
            func: DFUFunction::new(spi, board, erase),
            if_num: alloc.interface(),
            zone_names,
            _bus: PhantomData,
        }
    }

    /// The wrapped function driver.
    pub fn function(&self) -> &DFUFunction<S, H> {
        &self.func
    }

    /// Mutable access to the wrapped function driver.
    pub fn function_mut(&mut self) -> &mut DFUFunction<S, H> {
        &mut self.func
    }

    /// Pumps the function driver; call from the main loop at a bounded
    /// rate (200 Hz is plenty).
    pub fn tick(&mut self) {
        self.func.tick();
    }

    fn for_this_interface(&self, req: &Request) -> bool {
        req.index == u8::from(self.if_num) as u16
    }
}

impl<B: UsbBus, S: SpiBus, H: DFUBoard> UsbClass<B> for DFUClass<B, S, H> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        for alt in 0..H::ZONES.len() {
            writer.interface_alt(
                self.if_num,
                alt as u8,
                USB_CLASS_APPLICATION_SPECIFIC,
                USB_SUBCLASS_DFU,
                USB_PROTOCOL_DFU_MODE,
                self.zone_names[alt],
            )?;
        }

        // DFU functional descriptor
        writer.write(
            DESC_DESCTYPE_DFU,
            &[
                // bmAttributes: bitWillDetach, bitManifestationTolerant,
                // bitCanUpload, bitCanDnload
                0x0f,
                // wDetachTimeOut
                (H::DETACH_TIMEOUT & 0xff) as u8,
                (H::DETACH_TIMEOUT >> 8) as u8,
                // wTransferSize
                (SLOT_SIZE & 0xff) as u8,
                (SLOT_SIZE >> 8) as u8,
                // bcdDFUVersion 1.1a
                0x1a,
                0x01,
            ],
        )?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, lang_id: usb_device::descriptor::lang_id::LangID) -> Option<&str> {
        if lang_id == usb_device::descriptor::lang_id::LangID::EN_US
            || lang_id == usb_device::descriptor::lang_id::LangID::from(0u16)
        {
            for (i, zone) in H::ZONES.iter().enumerate() {
                if self.zone_names[i] == Some(index) {
                    return Some(zone.name);
                }
            }
        }
        None
    }

    fn reset(&mut self) {
        self.func.bus_reset();
    }

    fn set_alt_setting(&mut self, interface: InterfaceNumber, alternative: u8) -> bool {
        if u8::from(interface) != u8::from(self.if_num) {
            return false;
        }
        self.func.set_interface(alternative)
    }

    fn get_alt_setting(&mut self, interface: InterfaceNumber) -> Option<u8> {
        if u8::from(interface) != u8::from(self.if_num) {
            return None;
        }
        Some(self.func.interface())
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        // The machine leaves AppDetach when the device is configured;
        // watch SET_CONFIGURATION on its way to the standard handler.
        if req.request_type == control::RequestType::Standard {
            if req.recipient == control::Recipient::Device
                && req.request == Request::SET_CONFIGURATION
                && req.value != 0
            {
                self.func.configured();
            }
            return;
        }

        if !self.for_this_interface(&req) {
            return;
        }

        if req.request_type == control::RequestType::Vendor
            && req.recipient == control::Recipient::Interface
        {
            match self.func.vendor_out(&req, xfer.data()) {
                Response::Continue => {}
                Response::Success(_) => {
                    xfer.accept().ok();
                }
                Response::Error => {
                    xfer.reject().ok();
                }
            }
            return;
        }

        if req.request_type != control::RequestType::Class
            || req.recipient != control::Recipient::Interface
        {
            return;
        }

        match self.func.control_out(&req, xfer.data()) {
            Response::Continue => {}
            Response::Success(_) => {
                xfer.accept().ok();
            }
            Response::Error => {
                xfer.reject().ok();
            }
        }
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if req.request_type == control::RequestType::Standard {
            return;
        }

        if !self.for_this_interface(&req) {
            return;
        }

        if req.request_type == control::RequestType::Vendor
            && req.recipient == control::Recipient::Interface
        {
            match self.func.vendor_in(&req) {
                Response::Continue => {}
                Response::Success(reply) => {
                    xfer.accept_with(reply).ok();
                }
                Response::Error => {
                    xfer.reject().ok();
                }
            }
            return;
        }

        if req.request_type != control::RequestType::Class
            || req.recipient != control::Recipient::Interface
        {
            return;
        }

        match self.func.control_in(&req) {
            Response::Continue => {}
            Response::Success(reply) => {
                xfer.accept_with(reply).ok();
            }
            Response::Error => {
                xfer.reject().ok();
            }
        }
    }
}
