//! Virtual concatenation of buffers without copying.

use crate::bytebuf::ByteBuf;
use crate::error::BufferError;
use crate::readable::Readable;

/// One member of the virtual sequence. `start` is the component's offset in
/// the composite's index space; its contribution is the readable range of
/// `buf` frozen at the time it was added.
struct Component {
    buf: ByteBuf,
    start: usize,
}

impl Component {
    #[inline]
    fn len(&self) -> usize {
        self.buf.readable_bytes()
    }

    #[inline]
    fn end(&self) -> usize {
        self.start + self.len()
    }
}

/// An ordered list of byte buffers exposed as one virtual byte sequence.
///
/// Adding a component transfers ownership of the buffer handle; the
/// component's region lives until the composite (and any retained slices)
/// release it. A composite holds plain [`ByteBuf`]s only, so it can never
/// contain itself.
#[derive(Default)]
pub struct CompositeBuf {
    components: Vec<Component>,
    /// Virtual reader index over the concatenation.
    read_idx: usize,
    /// Virtual writer index: total bytes contributed by all components.
    total: usize,
}

impl CompositeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer's readable bytes to the virtual sequence, taking
    /// ownership. Empty buffers are released immediately.
    pub fn add_component(&mut self, buf: ByteBuf) {
        if buf.readable_bytes() == 0 {
            return;
        }
        let start = self.total;
        self.total += buf.readable_bytes();
        self.components.push(Component { buf, start });
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Release components that lie entirely before the reader index and
    /// rebase the remaining ones. Returns the number of bytes dropped.
    pub fn discard_read_components(&mut self) -> usize {
        let consumed = self.read_idx;
        let keep_from = self
            .components
            .iter()
            .position(|c| c.end() > consumed)
            .unwrap_or(self.components.len());
        if keep_from == 0 {
            return 0;
        }
        let dropped = self.components[keep_from - 1].end();
        self.components.drain(..keep_from);
        for c in &mut self.components {
            c.start -= dropped;
        }
        self.read_idx -= dropped;
        self.total -= dropped;
        dropped
    }

    /// Copy the remaining readable bytes into one contiguous buffer.
    pub fn linearize(&self) -> ByteBuf {
        let mut out = ByteBuf::with_capacity(self.readable_bytes());
        let mut pos = self.read_idx;
        while pos < self.total {
            let comp = self.component_at(pos).expect("index within total");
            let local = comp.buf.reader_index() + (pos - comp.start);
            let take = comp.end() - pos;
            let chunk = comp
                .buf
                .retained_slice(local, take)
                .expect("component range is readable");
            out.put_slice(chunk.readable()).expect("sized to fit");
            pos += take;
        }
        out
    }

    fn component_at(&self, index: usize) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| index >= c.start && index < c.end())
    }
}

impl Readable for CompositeBuf {
    fn readable_bytes(&self) -> usize {
        self.total - self.read_idx
    }

    fn reader_index(&self) -> usize {
        self.read_idx
    }

    fn writer_index(&self) -> usize {
        self.total
    }

    fn set_reader_index(&mut self, index: usize) -> Result<(), BufferError> {
        if index > self.total {
            return Err(BufferError::OutOfBounds {
                index,
                limit: self.total,
            });
        }
        self.read_idx = index;
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.readable_bytes() {
            return Err(BufferError::InsufficientData {
                requested: n,
                available: self.readable_bytes(),
            });
        }
        self.read_idx += n;
        Ok(())
    }

    fn get_u8(&self, index: usize) -> Result<u8, BufferError> {
        let comp = self
            .component_at(index)
            .ok_or(BufferError::OutOfBounds {
                index,
                limit: self.total,
            })?;
        let local = comp.buf.reader_index() + (index - comp.start);
        comp.buf.get_u8(local)
    }

    fn read_retained_slice(&mut self, n: usize) -> Result<ByteBuf, BufferError> {
        if n > self.readable_bytes() {
            return Err(BufferError::InsufficientData {
                requested: n,
                available: self.readable_bytes(),
            });
        }
        if n == 0 {
            return Ok(ByteBuf::with_capacity(0));
        }
        let comp = self.component_at(self.read_idx).expect("non-empty range");
        let local = comp.buf.reader_index() + (self.read_idx - comp.start);
        // Contiguous within one component: share its region.
        if self.read_idx + n <= comp.end() {
            let slice = comp.buf.retained_slice(local, n)?;
            self.read_idx += n;
            return Ok(slice);
        }
        // Spans components: fall back to one copy.
        let mut out = ByteBuf::with_capacity(n);
        let mut pos = self.read_idx;
        let end = self.read_idx + n;
        while pos < end {
            let comp = self.component_at(pos).expect("index within total");
            let local = comp.buf.reader_index() + (pos - comp.start);
            let take = (comp.end() - pos).min(end - pos);
            let chunk = comp.buf.retained_slice(local, take)?;
            out.put_slice(chunk.readable())?;
            pos += take;
        }
        self.read_idx = end;
        Ok(out)
    }

    fn find_byte(&self, from: usize, needle: u8) -> Option<usize> {
        let mut pos = from.max(self.read_idx);
        while pos < self.total {
            let comp = self.component_at(pos)?;
            let local = comp.buf.reader_index() + (pos - comp.start);
            if let Some(found) = comp.buf.find_byte(local, needle) {
                return Some(comp.start + (found - comp.buf.reader_index()));
            }
            pos = comp.end();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composite_of(parts: &[&[u8]]) -> CompositeBuf {
        let mut c = CompositeBuf::new();
        for p in parts {
            c.add_component(ByteBuf::from_slice(p));
        }
        c
    }

    #[test]
    fn test_virtual_concatenation() {
        let c = composite_of(&[b"ab", b"cd", b"ef"]);
        assert_eq!(c.readable_bytes(), 6);
        assert_eq!(c.num_components(), 3);
        assert_eq!(c.get_u8(0).unwrap(), b'a');
        assert_eq!(c.get_u8(3).unwrap(), b'd');
        assert_eq!(c.get_u8(5).unwrap(), b'f');
        assert!(c.get_u8(6).is_err());
    }

    #[test]
    fn test_empty_components_are_dropped() {
        let c = composite_of(&[b"", b"xy", b""]);
        assert_eq!(c.num_components(), 1);
        assert_eq!(c.readable_bytes(), 2);
    }

    #[test]
    fn test_retained_slice_within_component_shares_region() {
        let mut c = composite_of(&[b"hello", b"world"]);
        let slice = c.read_retained_slice(5).unwrap();
        assert_eq!(slice.readable(), b"hello");
        // Shares the first component's region.
        assert_eq!(slice.ref_count(), 2);
        assert_eq!(c.reader_index(), 5);
    }

    #[test]
    fn test_retained_slice_spanning_components_copies() {
        let mut c = composite_of(&[b"hel", b"lo!"]);
        let slice = c.read_retained_slice(5).unwrap();
        assert_eq!(slice.readable(), b"hello");
        assert_eq!(slice.ref_count(), 1);
        assert_eq!(c.readable_bytes(), 1);
    }

    #[test]
    fn test_find_byte_across_components() {
        let c = composite_of(&[b"abc", b"de\nf"]);
        assert_eq!(c.find_byte(0, b'\n'), Some(5));
        assert_eq!(c.find_byte(6, b'\n'), None);
        assert_eq!(c.find_byte(0, b'z'), None);
    }

    #[test]
    fn test_discard_read_components() {
        let mut c = composite_of(&[b"ab", b"cd", b"ef"]);
        c.skip(3).unwrap();

        let dropped = c.discard_read_components();
        assert_eq!(dropped, 2);
        assert_eq!(c.num_components(), 2);
        assert_eq!(c.reader_index(), 1);
        assert_eq!(c.get_u8(1).unwrap(), b'd');
        assert_eq!(c.readable_bytes(), 3);
    }

    #[test]
    fn test_linearize() {
        let mut c = composite_of(&[b"one", b"two", b"three"]);
        c.skip(3).unwrap();
        let flat = c.linearize();
        assert_eq!(flat.readable(), b"twothree");
        // Linearizing does not consume.
        assert_eq!(c.readable_bytes(), 8);
    }

    #[test]
    fn test_skip_bounds() {
        let mut c = composite_of(&[b"ab"]);
        assert!(c.skip(3).is_err());
        c.skip(2).unwrap();
        assert!(!c.is_readable());
    }
}
