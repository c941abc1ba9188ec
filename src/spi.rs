use core::fmt;

/// One leg of a chip-select-framed SPI transaction.
///
/// A transaction is a sequence of chunks run back to back under a single
/// chip-select assertion. The command phase of a flash operation is a
/// write-only chunk (`write: true, read: false`), the response phase a
/// read-only chunk (`write: false, read: true`).
pub struct Chunk<'a> {
    /// Bytes driven onto the bus when `write` is set; filled with the
    /// captured read-back when `read` is set.
    pub data: &'a mut [u8],
    /// Capture the bus into `data`.
    pub read: bool,
    /// Drive `data` onto the bus (`0x00` is shifted out otherwise).
    pub write: bool,
}

/// Classification of flash contents against a desired image.
///
/// Produced by [`SpiBus::xfer_verify`]. NOR flash programming can only clear
/// bits, so a location that needs any `0 -> 1` transition must be erased
/// first; a location that merely differs can be fixed by programming alone.
///
/// The surfaced codes are `0` (equal), `2` (program only) and `3` (erase
/// then program). The degenerate "erase but nothing to program" case is
/// folded into `3`: erasing floods the sector with `0xFF`, so unless the
/// desired image is all-ones the sector must be re-programmed afterwards.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VerifyResult(u8);

impl VerifyResult {
    /// Contents already match.
    pub const MATCH: VerifyResult = VerifyResult(0);

    /// Some desired `1` bit currently reads `0`; only an erase can fix it.
    pub fn needs_erase(self) -> bool {
        self.0 & 1 != 0
    }

    /// Some byte differs from the desired image.
    pub fn needs_program(self) -> bool {
        self.0 & 2 != 0
    }

    /// Contents byte-equal the desired image.
    pub fn is_match(self) -> bool {
        self.0 == 0
    }

    /// Raw 2-bit code: one of `0`, `2` or `3`.
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let txt = match self.0 {
            0 => "match",
            2 => "program",
            3 => "erase+program",
            _ => "invalid",
        };
        write!(f, "VerifyResult({} [{}])", self.0, txt)
    }
}

/// Byte-serial SPI transport with software-controlled chip selects.
///
/// This is the only piece a board must provide: three primitive operations
/// that map directly onto a full-duplex SPI controller. The chunked
/// transfers and the verify classification are implemented on top and
/// should not be overridden.
///
/// Chip selects are small line indices; see
/// [`FlashChip`](crate::flash::FlashChip) for the assignment used by the
/// flash driver.
pub trait SpiBus {
    /// Assert (drive low) the given chip-select line.
    fn select(&mut self, cs: u8);

    /// Release (drive high) the given chip-select line.
    fn deselect(&mut self, cs: u8);

    /// Shift one byte out while capturing the byte shifted in.
    fn exchange(&mut self, mosi: u8) -> u8;

    /// Run a chip-select-framed transaction.
    ///
    /// Asserts `cs`, runs every chunk in order, releases `cs`. For each
    /// byte the written value is `data[i]` when the chunk has `write` set
    /// and `0x00` otherwise; the read-back is stored into `data[i]` when
    /// the chunk has `read` set and discarded otherwise.
    fn xfer(&mut self, cs: u8, chunks: &mut [Chunk<'_>]) {
        self.select(cs);
        for chunk in chunks.iter_mut() {
            for b in chunk.data.iter_mut() {
                let mosi = if chunk.write { *b } else { 0x00 };
                let miso = self.exchange(mosi);
                if chunk.read {
                    *b = miso;
                }
            }
        }
        self.deselect(cs);
    }

    /// Like [`xfer`](SpiBus::xfer), but read chunks classify the bus
    /// contents against `data` instead of capturing into it.
    ///
    /// For every read-back byte, with `e` the expected byte from `data`
    /// and `a` the actual byte on the bus:
    ///
    /// * erase is needed if `(e & a) != e` — a wanted `1` reads `0`, and
    ///   only an erase can produce a `1`;
    /// * programming is needed if `e != a` — programming can clear any
    ///   remaining `1` down to `0`.
    ///
    /// When erase is needed the result is promoted to erase+program, since
    /// the erased sector reads `0xFF` and must be re-programmed unless the
    /// expected image is all-ones.
    fn xfer_verify(&mut self, cs: u8, chunks: &mut [Chunk<'_>]) -> VerifyResult {
        let mut should_e = 0u8;
        let mut should_w = 0u8;
        let mut should_ew = 0u8;

        self.select(cs);
        for chunk in chunks.iter_mut() {
            for b in chunk.data.iter_mut() {
                let mosi = if chunk.write { *b } else { 0x00 };
                let miso = self.exchange(mosi);
                if chunk.read {
                    let e = *b;
                    should_e |= if e & miso != e { 1 } else { 0 };
                    should_w |= if e != miso { 2 } else { 0 };
                    should_ew |= if e != 0xff { 3 } else { 1 };
                }
            }
        }
        self.deselect(cs);

        // A bare erase-needed code would mean "erase, after which the
        // all-ones sector already matches"; fold it into erase+program so
        // callers only ever see 0, 2 or 3.
        let code = if should_e != 0 { should_ew | 2 } else { should_w };
        VerifyResult(code)
    }
}
