/*!
 * Length-Prefixed NAL Unit Container
 *
 * Hardware encoders hand back an access unit as a run of NAL units, each
 * preceded by a 4-byte big-endian length. `LengthPrefixedUnits` walks that
 * run and yields the unit payloads without the prefixes.
 */

/// Size of each NAL unit length prefix
pub const NAL_LENGTH_SIZE: usize = 4;

/// Iterator over the NAL units of one length-prefixed access unit
///
/// Stops once fewer than four bytes remain. A prefix that claims more bytes
/// than the buffer holds ends the walk and sets [`is_truncated`]; nothing past
/// the end of the buffer is ever read.
///
/// [`is_truncated`]: LengthPrefixedUnits::is_truncated
#[derive(Debug, Clone)]
pub struct LengthPrefixedUnits<'a> {
    buf: &'a [u8],
    offset: usize,
    truncated: bool,
}

impl<'a> LengthPrefixedUnits<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            truncated: false,
        }
    }

    /// True if a length prefix pointed past the end of the buffer
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }
}

impl<'a> Iterator for LengthPrefixedUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.truncated || self.remaining() < NAL_LENGTH_SIZE {
            return None;
        }

        let prefix_end = self.offset + NAL_LENGTH_SIZE;
        let mut prefix = [0u8; NAL_LENGTH_SIZE];
        prefix.copy_from_slice(&self.buf[self.offset..prefix_end]);
        let unit_len = u32::from_be_bytes(prefix) as usize;

        if unit_len > self.buf.len() - prefix_end {
            self.truncated = true;
            return None;
        }

        let unit = &self.buf[prefix_end..prefix_end + unit_len];
        self.offset = prefix_end + unit_len;
        Some(unit)
    }
}
