//! Structural serializer for cache values.
//!
//! Cache values are composite records: a primary struct plus nested arrays,
//! strings and substructures. To store them in a key→blob cache as a single
//! contiguous allocation, every internal reference is encoded as a *slot*: a
//! `(offset, length)` pair measured from the blob base. The layout is:
//!
//! ```text
//! [scalar fields and slots, in declaration order][referenced data ...]
//! ```
//!
//! A [`BlobWriter`] appends scalar fields and reserves slots that are later
//! bound to data appended at the end of the buffer. A [`BlobView`] reads the
//! finished blob with bounds checking; *partial getters* resolve a single
//! slot and read individual elements without materializing the whole value.
//!
//! `(0, 0)` is the NULL slot. The primary struct starts at offset 0, so no
//! real reference can collide with it.
//!
//! All integers are little-endian.

use revfs_error::{Result, RevfsError};

/// A value that can be stored in a blob cache.
pub trait CacheBlob: Sized {
    /// Serialize into a self-contained blob.
    fn serialize(&self) -> Vec<u8>;

    /// Rebuild the value from a blob produced by [`CacheBlob::serialize`].
    fn deserialize(blob: &[u8]) -> Result<Self>;
}

/// Position of a reserved slot within the buffer under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(usize);

/// Byte size of an encoded slot: offset + length, 8 bytes each.
pub const SLOT_SIZE: usize = 16;

/// Serialization context. Appends fields and binds reference slots.
#[derive(Debug)]
pub struct BlobWriter {
    buf: Vec<u8>,
    open_structs: Vec<Slot>,
}

impl BlobWriter {
    /// Create a writer, pre-sizing the buffer to `estimate` bytes.
    #[must_use]
    pub fn with_capacity(estimate: usize) -> Self {
        Self {
            buf: Vec::with_capacity(estimate),
            open_structs: Vec::new(),
        }
    }

    /// Append a `u8` field.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Append a `u32` field.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a `u64` field.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Append an `i64` field.
    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Reserve a reference slot at the current position.
    ///
    /// The slot stays NULL until bound with one of the `bind_*` methods or
    /// [`BlobWriter::begin_struct`].
    pub fn reserve_slot(&mut self) -> Slot {
        let at = self.buf.len();
        self.buf.extend_from_slice(&[0u8; SLOT_SIZE]);
        Slot(at)
    }

    fn patch_slot(&mut self, slot: Slot, offset: u64, len: u64) {
        self.buf[slot.0..slot.0 + 8].copy_from_slice(&offset.to_le_bytes());
        self.buf[slot.0 + 8..slot.0 + SLOT_SIZE].copy_from_slice(&len.to_le_bytes());
    }

    /// Bind `slot` to an array of `u64` appended at the current end.
    /// The slot length is the element count.
    pub fn bind_u64s(&mut self, slot: Slot, values: &[u64]) {
        let offset = self.buf.len() as u64;
        for &v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        self.patch_slot(slot, offset, values.len() as u64);
    }

    /// Bind `slot` to an array of `i64` appended at the current end.
    pub fn bind_i64s(&mut self, slot: Slot, values: &[i64]) {
        let offset = self.buf.len() as u64;
        for &v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        self.patch_slot(slot, offset, values.len() as u64);
    }

    /// Bind `slot` to raw bytes appended at the current end.
    /// The slot length is the byte count.
    pub fn bind_bytes(&mut self, slot: Slot, bytes: &[u8]) {
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        self.patch_slot(slot, offset, bytes.len() as u64);
    }

    /// Bind `slot` to a string appended at the current end.
    pub fn bind_str(&mut self, slot: Slot, value: &str) {
        self.bind_bytes(slot, value.as_bytes());
    }

    /// Bind `slot` to a nested structure whose fields are written by the
    /// following `put_*`/`reserve_slot` calls, until the matching
    /// [`BlobWriter::end_struct`].
    ///
    /// `begin_struct` and `end_struct` must balance.
    pub fn begin_struct(&mut self, slot: Slot) {
        let offset = self.buf.len() as u64;
        self.patch_slot(slot, offset, 0);
        self.open_structs.push(slot);
    }

    /// Close the innermost nested structure, fixing its byte length.
    ///
    /// # Panics
    ///
    /// Panics if no structure is open; that is a bug in the caller, not a
    /// data error.
    pub fn end_struct(&mut self) {
        let slot = self.open_structs.pop().expect("unbalanced end_struct");
        let offset = u64::from_le_bytes(self.buf[slot.0..slot.0 + 8].try_into().unwrap());
        let len = self.buf.len() as u64 - offset;
        self.patch_slot(slot, offset, len);
    }

    /// Finish serialization and return the blob.
    ///
    /// # Panics
    ///
    /// Panics if a nested structure is still open.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        assert!(self.open_structs.is_empty(), "unbalanced begin_struct");
        self.buf
    }
}

/// A resolved reference: byte offset and length (element count for typed
/// arrays, byte count for byte ranges and nested structures).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub offset: usize,
    pub len: usize,
}

/// Bounds-checked reader over a serialized blob.
///
/// Every accessor fails with a corruption error instead of panicking, so a
/// damaged cache entry surfaces as `RevfsError::Corrupt`.
#[derive(Debug, Clone, Copy)]
pub struct BlobView<'a> {
    data: &'a [u8],
}

impl<'a> BlobView<'a> {
    /// Wrap `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Total blob length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the blob is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn range(&self, at: usize, len: usize) -> Result<&'a [u8]> {
        let end = at
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                RevfsError::corrupt(format!(
                    "blob range {at}..+{len} outside buffer of {} bytes",
                    self.data.len()
                ))
            })?;
        Ok(&self.data[at..end])
    }

    /// Read a `u8` at byte position `at`.
    pub fn u8_at(&self, at: usize) -> Result<u8> {
        Ok(self.range(at, 1)?[0])
    }

    /// Read a `u32` at byte position `at`.
    pub fn u32_at(&self, at: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.range(at, 4)?.try_into().unwrap()))
    }

    /// Read a `u64` at byte position `at`.
    pub fn u64_at(&self, at: usize) -> Result<u64> {
        Ok(u64::from_le_bytes(self.range(at, 8)?.try_into().unwrap()))
    }

    /// Read an `i64` at byte position `at`.
    pub fn i64_at(&self, at: usize) -> Result<i64> {
        Ok(i64::from_le_bytes(self.range(at, 8)?.try_into().unwrap()))
    }

    /// Resolve the slot at byte position `at`. Returns `None` for the NULL
    /// slot.
    pub fn slot_at(&self, at: usize) -> Result<Option<SlotRef>> {
        let offset = self.u64_at(at)?;
        let len = self.u64_at(at + 8)?;
        if offset == 0 && len == 0 {
            return Ok(None);
        }
        let offset = usize::try_from(offset)
            .map_err(|_| RevfsError::corrupt("blob slot offset exceeds address space"))?;
        let len = usize::try_from(len)
            .map_err(|_| RevfsError::corrupt("blob slot length exceeds address space"))?;
        Ok(Some(SlotRef { offset, len }))
    }

    /// Resolve the slot at `at`, treating NULL as corruption.
    pub fn required_slot_at(&self, at: usize) -> Result<SlotRef> {
        self.slot_at(at)?
            .ok_or_else(|| RevfsError::corrupt("unexpected NULL reference in blob"))
    }

    /// Read element `index` of the `u64` array referenced by `slot`.
    pub fn u64_index(&self, slot: SlotRef, index: usize) -> Result<u64> {
        if index >= slot.len {
            return Err(RevfsError::corrupt(format!(
                "blob array index {index} out of bounds ({} elements)",
                slot.len
            )));
        }
        self.u64_at(slot.offset + index * 8)
    }

    /// Read element `index` of the `i64` array referenced by `slot`.
    pub fn i64_index(&self, slot: SlotRef, index: usize) -> Result<i64> {
        if index >= slot.len {
            return Err(RevfsError::corrupt(format!(
                "blob array index {index} out of bounds ({} elements)",
                slot.len
            )));
        }
        self.i64_at(slot.offset + index * 8)
    }

    /// Materialize the whole `u64` array referenced by `slot`.
    pub fn u64_vec(&self, slot: SlotRef) -> Result<Vec<u64>> {
        let bytes = self.array_bytes(slot, 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// Materialize the whole `i64` array referenced by `slot`.
    pub fn i64_vec(&self, slot: SlotRef) -> Result<Vec<i64>> {
        let bytes = self.array_bytes(slot, 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// Raw bytes referenced by `slot` (byte-length slots only).
    pub fn bytes(&self, slot: SlotRef) -> Result<&'a [u8]> {
        self.range(slot.offset, slot.len)
    }

    /// A sub-view over the nested structure referenced by `slot`.
    ///
    /// Slots inside a nested structure still measure offsets from the blob
    /// base, so the sub-view spans the full blob and only the caller's field
    /// positions change.
    pub fn struct_base(&self, slot: SlotRef) -> Result<usize> {
        self.range(slot.offset, slot.len)?;
        Ok(slot.offset)
    }

    fn array_bytes(&self, slot: SlotRef, elem_size: usize) -> Result<&'a [u8]> {
        let byte_len = slot.len.checked_mul(elem_size).ok_or_else(|| {
            RevfsError::corrupt("blob array length overflow")
        })?;
        self.range(slot.offset, byte_len)
    }
}
