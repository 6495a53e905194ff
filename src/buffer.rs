use std::fmt;
use std::marker::PhantomData;

/// Non-owning `(data, len)` view over a byte payload.
///
/// The layout is C-compatible so the view can be handed across a language
/// boundary as-is. The view borrows the payload for `'a`; nothing is copied and
/// ownership never moves across the boundary.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ByteView<'a> {
    data: *const u8,
    len: usize,
    _marker: PhantomData<&'a [u8]>,
}

// A `ByteView` is just a shared borrow of a byte slice.
unsafe impl Send for ByteView<'_> {}
unsafe impl Sync for ByteView<'_> {}

impl<'a> ByteView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            data: bytes.as_ptr(),
            len: bytes.len(),
            _marker: PhantomData,
        }
    }

    /// Builds a view from a raw pointer and length received from the other
    /// side of the boundary.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `len` bytes for the whole of `'a`,
    /// or `len` must be zero. A null `data` is accepted only with `len == 0`.
    pub unsafe fn from_raw_parts(data: *const u8, len: usize) -> Self {
        Self {
            data,
            len,
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &'a [u8] {
        if self.len == 0 || self.data.is_null() {
            return &[];
        }

        // SAFETY: constructed either from a live slice or under the contract of
        // `from_raw_parts`.
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl<'a> From<&'a [u8]> for ByteView<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ByteView::new(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for ByteView<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        ByteView::new(bytes.as_slice())
    }
}

impl fmt::Debug for ByteView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
