use std::{error, fmt, ops::Range};

/// Bounds-checked, borrowed view over a byte buffer.
///
/// Every accessor validates the requested range before reading; sub-views
/// borrow the same buffer and never copy.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Octets<'a> {
    data: &'a [u8],
}

impl<'a> Octets<'a> {
    pub fn new(data: &'a [u8]) -> Octets<'a> {
        Octets { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    fn bytes<const N: usize>(&self, offset: usize) -> Result<[u8; N], OutOfBounds> {
        let end = offset.checked_add(N).ok_or(OutOfBounds {})?;
        let src = self.data.get(offset..end).ok_or(OutOfBounds {})?;
        let mut result = [0u8; N];
        result.copy_from_slice(src);
        Ok(result)
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, OutOfBounds> {
        self.data.get(offset).copied().ok_or(OutOfBounds {})
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16, OutOfBounds> {
        Ok(u16::from_be_bytes(self.bytes(offset)?))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, OutOfBounds> {
        Ok(u32::from_be_bytes(self.bytes(offset)?))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, OutOfBounds> {
        Ok(u64::from_be_bytes(self.bytes(offset)?))
    }

    /// Returns a sub-view; the range must be fully contained in this view.
    pub fn slice(&self, range: Range<usize>) -> Result<Octets<'a>, OutOfBounds> {
        if range.start > range.end {
            return Err(OutOfBounds {});
        }
        self.data
            .get(range)
            .map(|data| Octets { data })
            .ok_or(OutOfBounds {})
    }

    /// Returns everything starting at `offset`.
    pub fn skip(&self, offset: usize) -> Result<Octets<'a>, OutOfBounds> {
        self.slice(offset..self.data.len())
    }
}

impl fmt::Debug for Octets<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::logger::fmt_slice_hex(self.data))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct OutOfBounds {}

impl fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Read outside of buffer bounds")
    }
}

impl error::Error for OutOfBounds {}
