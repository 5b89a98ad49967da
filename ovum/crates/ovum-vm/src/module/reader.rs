//! Little-endian reader over a buffered module file.
//!
//! All integers are plain-width little-endian. Strings are an `i32`
//! length followed by that many UTF-16 code units (no BOM, no
//! terminator). Collections are framed: a `u32` byte size, an `i32` item
//! count, then the items; [`ModuleReader::verify_frame`] checks that the
//! stream advanced by exactly the declared size.

use crate::error::ModuleLoadError;
use crate::module::token::Token;

pub struct ModuleReader {
    data: Vec<u8>,
    pos: usize,
    path: String,
}

impl ModuleReader {
    pub fn new(data: Vec<u8>, path: impl Into<String>) -> Self {
        Self {
            data,
            pos: 0,
            path: path.into(),
        }
    }

    pub fn open(path: &std::path::Path) -> Result<Self, ModuleLoadError> {
        let display = path.display().to_string();
        let data = std::fs::read(path)
            .map_err(|e| ModuleLoadError::new(display.clone(), e.to_string()))?;
        Ok(Self::new(data, display))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn error(&self, message: impl Into<String>) -> ModuleLoadError {
        ModuleLoadError::new(self.path.clone(), message)
    }

    fn take(&mut self, count: usize) -> Result<&[u8], ModuleLoadError> {
        if self.pos + count > self.data.len() {
            return Err(self.error("Unexpected end of module file."));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn skip(&mut self, count: usize) -> Result<(), ModuleLoadError> {
        self.take(count).map(|_| ())
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, ModuleLoadError> {
        self.take(count).map(|s| s.to_vec())
    }

    pub fn read_u8(&mut self) -> Result<u8, ModuleLoadError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, ModuleLoadError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, ModuleLoadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, ModuleLoadError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32, ModuleLoadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, ModuleLoadError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, ModuleLoadError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i64(&mut self) -> Result<i64, ModuleLoadError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_token(&mut self) -> Result<Token, ModuleLoadError> {
        Ok(Token(self.read_u32()?))
    }

    /// A length-prefixed UTF-16 string. A zero length yields an empty
    /// sequence.
    pub fn read_string_data(&mut self) -> Result<Vec<u16>, ModuleLoadError> {
        let length = self.read_i32()?;
        if length < 0 {
            return Err(self.error("Negative string length."));
        }
        let bytes = self.take(length as usize * 2)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// A length-prefixed byte string naming a native entry point. A zero
    /// length means absent.
    pub fn read_cstring(&mut self) -> Result<Option<String>, ModuleLoadError> {
        let length = self.read_i32()?;
        if length < 0 {
            return Err(self.error("Negative string length."));
        }
        if length == 0 {
            return Ok(None);
        }
        let bytes = self.take(length as usize)?.to_vec();
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| self.error("Native entry point name is not valid UTF-8."))
    }

    /// Reads the `u32` byte-size prefix of a framed collection and
    /// returns the expected end position. Zero size means the collection
    /// is empty and has no further content.
    pub fn begin_frame(&mut self) -> Result<Option<usize>, ModuleLoadError> {
        let size = self.read_u32()?;
        if size == 0 {
            Ok(None)
        } else {
            Ok(Some(self.pos + size as usize))
        }
    }

    /// Verifies that the stream advanced by exactly the declared size.
    pub fn verify_frame(
        &self,
        expected_end: usize,
        table: &str,
    ) -> Result<(), ModuleLoadError> {
        if self.pos != expected_end {
            return Err(self.error(format!(
                "The actual size of the {table} table did not match the expected size."
            )));
        }
        Ok(())
    }

    /// Skips a framed collection entirely.
    pub fn skip_frame(&mut self) -> Result<(), ModuleLoadError> {
        if let Some(end) = self.begin_frame()? {
            if end > self.data.len() {
                return Err(self.error("Unexpected end of module file."));
            }
            self.pos = end;
        }
        Ok(())
    }
}
