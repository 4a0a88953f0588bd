use crate::error::{Error, Result};

/// A finite byte stream with a known length that can be repositioned, used
/// for the init packet and firmware payloads. Repositioning is what makes
/// resume possible: when the target reports previously stored bytes, the
/// engine re-reads them to recompute the running CRC.
pub trait ImageSource {
    fn size(&self) -> u32;

    fn rewind_to(&mut self, offset: u32) -> Result<()>;

    /// Fill `buf` from the current position. Running out of bytes before
    /// `buf` is full is an error: object sizes are known up front.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Image payload held in memory, as extracted from a DFU package.
pub struct MemImage {
    data: Vec<u8>,
    pos: usize,
}

impl From<Vec<u8>> for MemImage {
    fn from(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ImageSource for MemImage {
    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn rewind_to(&mut self, offset: u32) -> Result<()> {
        if offset as usize > self.data.len() {
            return Err(Error::Source(format!(
                "cannot seek to offset {} in a {} byte image",
                offset,
                self.data.len()
            )));
        }
        self.pos = offset as usize;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.pos + buf.len();
        if end > self.data.len() {
            return Err(Error::Source(format!(
                "image exhausted at offset {} ({} bytes requested, {} available)",
                self.pos,
                buf.len(),
                self.data.len() - self.pos
            )));
        }
        buf.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(())
    }
}
