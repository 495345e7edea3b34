use crate::{FormatError, Result};

const MIN_CAPACITY: usize = 64;

/// Reference to a byte range appended into a [`ByteArena`].
///
/// References stay valid across arena growth because they are offsets, not
/// pointers. Raw slices returned by [`ByteArena::view`] are only valid until
/// the next append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteRef {
    pub offset: u64,
    pub len: u32,
}

impl ByteRef {
    pub const EMPTY: ByteRef = ByteRef { offset: 0, len: 0 };

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Growable owned byte buffer holding appended variable-length records.
///
/// One arena is exclusively owned by a single decode or capture session.
/// Growth doubles the capacity; allocation failure is reported instead of
/// aborting so the enclosing decode can fail cleanly.
#[derive(Debug, Default)]
pub struct ByteArena {
    buf: Vec<u8>,
}

impl ByteArena {
    pub fn new() -> Self {
        ByteArena { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut arena = ByteArena::new();
        arena.reserve(capacity)?;
        Ok(arena)
    }

    /// Ensure room for `additional` more bytes, doubling capacity as needed.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let needed = self.buf.len() + additional;
        if needed <= self.buf.capacity() {
            return Ok(());
        }
        let mut target = self.buf.capacity().max(MIN_CAPACITY);
        while target < needed {
            target *= 2;
        }
        self.buf
            .try_reserve_exact(target - self.buf.len())
            .map_err(|_| FormatError::Allocation(additional))?;
        Ok(())
    }

    /// Append bytes and return the offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<ByteRef> {
        self.reserve(bytes.len())?;
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        Ok(ByteRef {
            offset,
            len: bytes.len() as u32,
        })
    }

    /// Resolve a reference into a slice.
    ///
    /// The reference must come from an `append` on this arena. The returned
    /// slice is invalidated by any subsequent growth.
    pub fn view(&self, r: ByteRef) -> &[u8] {
        &self.buf[r.offset as usize..r.offset as usize + r.len as usize]
    }

    /// Resolve a reference holding UTF-8 text. Invalid bytes yield "".
    pub fn str_view(&self, r: ByteRef) -> &str {
        std::str::from_utf8(self.view(r)).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Transfer ownership of the contents, leaving this arena empty.
    pub fn take(&mut self) -> ByteArena {
        ByteArena {
            buf: std::mem::take(&mut self.buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_append_returns_sequential_offsets() {
        let mut arena = ByteArena::new();
        let a = arena.append(b"hello").unwrap();
        let b = arena.append(b"world!").unwrap();

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 5);
        assert_eq!(arena.view(a), b"hello");
        assert_eq!(arena.view(b), b"world!");
        assert_eq!(arena.len(), 11);
    }

    #[rstest]
    fn test_refs_survive_growth() {
        let mut arena = ByteArena::new();
        let first = arena.append(b"first").unwrap();

        // Push enough data to force several reallocations, then re-resolve.
        for _ in 0..1000 {
            arena.append(&[0xAB; 64]).unwrap();
        }
        assert_eq!(arena.view(first), b"first");
    }

    #[rstest]
    fn test_take_empties_source() {
        let mut arena = ByteArena::new();
        let r = arena.append(b"payload").unwrap();

        let taken = arena.take();
        assert!(arena.is_empty());
        assert_eq!(taken.view(r), b"payload");
    }

    #[rstest]
    fn test_clear() {
        let mut arena = ByteArena::new();
        arena.append(b"data").unwrap();
        arena.clear();
        assert!(arena.is_empty());
    }

    #[rstest]
    fn test_str_view_invalid_utf8_is_empty() {
        let mut arena = ByteArena::new();
        let r = arena.append(&[0xFF, 0xFE]).unwrap();
        assert_eq!(arena.str_view(r), "");
    }
}
