use crate::{
    error::OfficeError,
    types::{Position, UserId},
};

/// Big-endian writer for the structured payloads carried in `Bytes` commands.
#[derive(Default)]
pub struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(value as u8)
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn position(&mut self, position: &Position) -> &mut Self {
        self.f64(position.x).f64(position.y)
    }

    /// Strings are prefixed with a u16 length; longer strings are truncated at a
    /// char boundary rather than corrupting the frame.
    pub fn str(&mut self, value: &str) -> &mut Self {
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.u16(end as u16);
        self.bytes.extend_from_slice(&value.as_bytes()[..end]);
        self
    }

    pub fn user_id(&mut self, user: &UserId) -> &mut Self {
        self.str(user.as_str())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], OfficeError> {
        if self.pos + len > self.data.len() {
            return Err(OfficeError::Protocol(format!(
                "payload truncated: wanted {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.data.len()
            )));
        }

        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], OfficeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, OfficeError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, OfficeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(OfficeError::Protocol(format!("invalid bool byte {}", other))),
        }
    }

    pub fn u16(&mut self) -> Result<u16, OfficeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, OfficeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, OfficeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, OfficeError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64, OfficeError> {
        Ok(f64::from_be_bytes(self.array()?))
    }

    pub fn position(&mut self) -> Result<Position, OfficeError> {
        let x = self.f64()?;
        let y = self.f64()?;
        Ok(Position::new(x, y))
    }

    pub fn str(&mut self) -> Result<String, OfficeError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|e| OfficeError::Protocol(format!("invalid utf-8 in payload: {}", e)))
    }

    pub fn user_id(&mut self) -> Result<UserId, OfficeError> {
        UserId::parse(&self.str()?)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Fails if a decoder left bytes behind, which means the two ends disagree
    /// on the layout.
    pub fn finish(&self) -> Result<(), OfficeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(OfficeError::Protocol(format!(
                "{} trailing bytes in payload",
                self.data.len() - self.pos
            )))
        }
    }
}
