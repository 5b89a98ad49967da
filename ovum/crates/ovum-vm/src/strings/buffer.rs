//! A growable UTF-16 string builder.
//!
//! Used wherever the VM composes text at runtime: stack traces, error
//! messages, module file names. The buffer accumulates code units and is
//! turned into a managed string in one allocation at the end.

use super::ManagedString;
use ovum_util::utf8;

pub struct StringBuffer {
    data: Vec<u16>,
}

impl StringBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn append_unit(&mut self, unit: u16) {
        self.data.push(unit);
    }

    pub fn append_char(&mut self, ch: char) {
        let mut buf = [0u16; 2];
        self.data.extend_from_slice(ch.encode_utf16(&mut buf));
    }

    pub fn append_str(&mut self, text: &str) {
        self.data.extend(text.encode_utf16());
    }

    pub fn append_units(&mut self, units: &[u16]) {
        self.data.extend_from_slice(units);
    }

    pub unsafe fn append_string(&mut self, s: *const ManagedString) {
        if !s.is_null() {
            self.data.extend_from_slice((*s).chars());
        }
    }

    /// Appends the decimal representation of `value`.
    pub fn append_int(&mut self, value: i64) {
        self.append_str(&value.to_string());
    }

    pub fn ends_with(&self, unit: u16) -> bool {
        self.data.last() == Some(&unit)
    }

    /// The accumulated code units.
    pub fn units(&self) -> &[u16] {
        &self.data
    }

    /// The accumulated text as a Rust string (lossy).
    pub fn to_rust_string(&self) -> String {
        utf8::utf16_to_string(&self.data)
    }
}

impl Default for StringBuffer {
    fn default() -> Self {
        Self::new()
    }
}
