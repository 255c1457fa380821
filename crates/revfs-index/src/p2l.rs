//! Phys-to-log index: `(revision, file offset) → item description`.
//!
//! The rev (or pack) file is divided into fixed-size clusters; one index
//! page describes the items starting within one cluster. Pages store a
//! first absolute offset followed by delta-encoded entries, so decoding a
//! page recovers every item of the cluster in offset order. An item whose
//! range crosses cluster boundaries stays in the page of its start cluster
//! and simply covers the following clusters too.

use std::path::Path;

use revfs_error::{Result, RevfsError};
use revfs_serial::{BlobView, BlobWriter, CacheBlob, SLOT_SIZE};
use revfs_types::config::{align_down, align_up};
use revfs_types::cx::Cx;
use revfs_types::varint::{unzigzag, write_ivarint, write_uvarint};
use revfs_types::{item_type, P2lEntry, Revision, INVALID_REVISION};
use revfs_vfs::traits::AppendFile;
use revfs_vfs::{OpenFlags, Vfs, VfsFile};
use tracing::{debug, trace};

use crate::layout::temp_sibling;
use crate::proto::read_p2l_proto_entry;
use crate::spill::{SpillBuf, SPILL_THRESHOLD};
use crate::stream::PackedStream;
use crate::{header_key, page_key, ItemIndex};

/// Initial value of the leaking-bucket prefetch counter: roughly "stop once
/// most neighboring pages turn out to be cached already".
const PREFETCH_BUCKET: i32 = 4;

/// Header of one phys-to-log index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct P2lHeader {
    /// First revision covered by the index (and rev file).
    pub first_revision: Revision,
    /// Bytes covered by the rev file, rounded up to a full cluster.
    pub file_size: u64,
    /// Rev file bytes per cluster.
    pub page_size: u64,
    /// Byte offsets of the page bodies within the index file; one extra
    /// element points past the last page.
    pub offsets: Vec<u64>,
}

/// Location facts of the page covering one rev file offset.
#[derive(Debug, Clone, Copy)]
pub(crate) struct P2lPageInfo {
    pub first_revision: Revision,
    /// Page number (equals the cluster number).
    pub page_no: u64,
    /// Index file offset of this page's body.
    pub start_offset: u64,
    /// Index file offset of the following page's body.
    pub next_offset: u64,
    /// First rev file offset covered by the cluster.
    pub page_start: u64,
    /// Total number of pages in the index.
    pub page_count: u64,
    /// Cluster size; 0 for the empty page past the end.
    pub page_size: u64,
}

/// One decoded page: the items of one cluster, in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct P2lPage {
    pub entries: Vec<P2lEntry>,
}

// Header blob layout.
const HDR_FIRST_REVISION_AT: usize = 0;
const HDR_FILE_SIZE_AT: usize = 8;
const HDR_PAGE_SIZE_AT: usize = 16;
const HDR_OFFSETS_AT: usize = 24;

// Page blob layout: one byte-range slot holding packed 48-byte entries.
const PAGE_ENTRIES_AT: usize = 0;
const ENTRY_SIZE: usize = 48;

impl P2lHeader {
    pub fn page_count(&self) -> u64 {
        (self.offsets.len() - 1) as u64
    }

    /// The page info for the cluster containing `offset`. Offsets past the
    /// covered range map to a zero-sized empty page behind the last page.
    ///
    /// A page without bytes describes a cluster wholly covered by an item
    /// spanning several clusters; its description lives in the nearest
    /// preceding non-empty page, so the info points there.
    pub fn page_info(&self, offset: u64) -> P2lPageInfo {
        let page_count = self.page_count();
        let mut page_no = if self.page_size == 0 {
            page_count
        } else {
            (offset / self.page_size).min(page_count)
        };
        while page_no > 0
            && page_no < page_count
            && self.offsets[page_no as usize] == self.offsets[page_no as usize + 1]
        {
            page_no -= 1;
        }
        P2lPageInfo {
            first_revision: self.first_revision,
            page_no,
            start_offset: self.offsets[page_no as usize],
            next_offset: self.offsets[(page_no as usize + 1).min(self.offsets.len() - 1)],
            page_start: self.page_size * page_no,
            page_count,
            page_size: if page_no < page_count { self.page_size } else { 0 },
        }
    }
}

impl CacheBlob for P2lHeader {
    fn serialize(&self) -> Vec<u8> {
        let mut w = BlobWriter::with_capacity(HDR_OFFSETS_AT + SLOT_SIZE + 8 * self.offsets.len());
        w.put_u64(self.first_revision);
        w.put_u64(self.file_size);
        w.put_u64(self.page_size);
        let offsets_slot = w.reserve_slot();
        w.bind_u64s(offsets_slot, &self.offsets);
        w.finish()
    }

    fn deserialize(blob: &[u8]) -> Result<Self> {
        let v = BlobView::new(blob);
        let offsets = v.u64_vec(v.required_slot_at(HDR_OFFSETS_AT)?)?;
        if offsets.is_empty() {
            return Err(RevfsError::corrupt("empty page offsets in header"));
        }
        Ok(Self {
            first_revision: v.u64_at(HDR_FIRST_REVISION_AT)?,
            file_size: v.u64_at(HDR_FILE_SIZE_AT)?,
            page_size: v.u64_at(HDR_PAGE_SIZE_AT)?,
            offsets,
        })
    }
}

/// Partial getter: [`P2lHeader::page_info`] evaluated on the cached blob.
pub(crate) fn page_info_from_blob(v: BlobView<'_>, offset: u64) -> Result<P2lPageInfo> {
    let first_revision = v.u64_at(HDR_FIRST_REVISION_AT)?;
    let page_size = v.u64_at(HDR_PAGE_SIZE_AT)?;
    let offsets_slot = v.required_slot_at(HDR_OFFSETS_AT)?;
    if offsets_slot.len == 0 {
        return Err(RevfsError::corrupt("empty page offsets in header"));
    }
    let page_count = (offsets_slot.len - 1) as u64;

    let mut page_no = if page_size == 0 {
        page_count
    } else {
        (offset / page_size).min(page_count)
    };
    let mut start_offset = v.u64_index(offsets_slot, page_no as usize)?;
    // Zero-byte pages alias the cluster to the nearest preceding non-empty
    // page, which holds the description of the item spanning it.
    while page_no > 0
        && page_no < page_count
        && start_offset == v.u64_index(offsets_slot, page_no as usize + 1)?
    {
        page_no -= 1;
        start_offset = v.u64_index(offsets_slot, page_no as usize)?;
    }

    let next_index = (page_no + 1).min(page_count) as usize;
    Ok(P2lPageInfo {
        first_revision,
        page_no,
        start_offset,
        next_offset: v.u64_index(offsets_slot, next_index)?,
        page_start: page_size * page_no,
        page_count,
        page_size: if page_no < page_count { page_size } else { 0 },
    })
}

/// Partial getter: the header's `file_size` field.
pub(crate) fn file_size_from_blob(v: BlobView<'_>) -> Result<u64> {
    v.u64_at(HDR_FILE_SIZE_AT)
}

fn encode_entry(out: &mut Vec<u8>, entry: &P2lEntry) {
    out.extend_from_slice(&entry.offset.to_le_bytes());
    out.extend_from_slice(&entry.size.to_le_bytes());
    out.extend_from_slice(&u64::from(entry.item_type).to_le_bytes());
    out.extend_from_slice(&entry.revision.to_le_bytes());
    out.extend_from_slice(&entry.number.to_le_bytes());
    out.extend_from_slice(&u64::from(entry.fnv1_checksum).to_le_bytes());
}

fn decode_entry(bytes: &[u8]) -> Result<P2lEntry> {
    let item_type = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    let fnv1 = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
    if item_type > 7 {
        return Err(RevfsError::corrupt("item type out of range in cached page"));
    }
    let fnv1_checksum = u32::try_from(fnv1)
        .map_err(|_| RevfsError::corrupt("checksum out of range in cached page"))?;
    Ok(P2lEntry {
        offset: i64::from_le_bytes(bytes[..8].try_into().unwrap()),
        size: i64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        item_type: item_type as u8,
        revision: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
        number: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
        fnv1_checksum,
    })
}

impl CacheBlob for P2lPage {
    fn serialize(&self) -> Vec<u8> {
        let mut w = BlobWriter::with_capacity(SLOT_SIZE + ENTRY_SIZE * self.entries.len());
        let slot = w.reserve_slot();
        let mut packed = Vec::with_capacity(ENTRY_SIZE * self.entries.len());
        for entry in &self.entries {
            encode_entry(&mut packed, entry);
        }
        w.bind_bytes(slot, &packed);
        w.finish()
    }

    fn deserialize(blob: &[u8]) -> Result<Self> {
        let v = BlobView::new(blob);
        let bytes = v.bytes(v.required_slot_at(PAGE_ENTRIES_AT)?)?;
        if bytes.len() % ENTRY_SIZE != 0 {
            return Err(RevfsError::corrupt("misaligned entries in cached page"));
        }
        let entries = bytes
            .chunks_exact(ENTRY_SIZE)
            .map(decode_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }
}

/// Partial getter: binary-search a cached page for the entry starting at
/// `offset`. Returns `None` when `offset` is not a start offset.
pub(crate) fn entry_from_page_blob(v: BlobView<'_>, offset: i64) -> Result<Option<P2lEntry>> {
    let slot = v.required_slot_at(PAGE_ENTRIES_AT)?;
    let bytes = v.bytes(slot)?;
    if bytes.len() % ENTRY_SIZE != 0 {
        return Err(RevfsError::corrupt("misaligned entries in cached page"));
    }
    let count = bytes.len() / ENTRY_SIZE;

    // Lower bound by start offset.
    let mut lower = 0usize;
    let mut upper = count;
    while lower < upper {
        let middle = (lower + upper) / 2;
        let at = middle * ENTRY_SIZE;
        let entry_offset = i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        if entry_offset < offset {
            lower = middle + 1;
        } else {
            upper = middle;
        }
    }

    if lower < count {
        let entry = decode_entry(&bytes[lower * ENTRY_SIZE..(lower + 1) * ENTRY_SIZE])?;
        if entry.offset == offset {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Read the header from the start of the index stream.
fn read_header<F: VfsFile>(stream: &mut PackedStream<F>, cx: &Cx) -> Result<P2lHeader> {
    stream.seek(0);
    let first_revision = stream.get(cx)?;
    let file_size = stream.get(cx)?;
    let page_size = stream.get(cx)?;
    let page_count = usize::try_from(stream.get(cx)?)
        .map_err(|_| RevfsError::corrupt("page count out of range"))?;
    if page_size == 0 {
        return Err(RevfsError::corrupt("zero phys-to-log page size"));
    }

    let mut offsets = Vec::with_capacity((page_count + 1).min(0x10000));
    offsets.push(0);
    let mut end = 0u64;
    for _ in 0..page_count {
        end += stream.get(cx)?;
        offsets.push(end);
    }

    // Page bodies follow immediately; rebase the offsets onto the file.
    let base = stream.offset();
    for offset in &mut offsets {
        *offset += base;
    }

    Ok(P2lHeader {
        first_revision,
        file_size,
        page_size,
        offsets,
    })
}

/// Append the next entry of a page to `entries`, updating the running
/// decode state.
fn read_entry<F: VfsFile>(
    stream: &mut PackedStream<F>,
    cx: &Cx,
    item_offset: &mut i64,
    last_revision: &mut Revision,
    last_compound: &mut u64,
    entries: &mut Vec<P2lEntry>,
) -> Result<()> {
    let size = stream.get(cx)? as i64;

    *last_compound = last_compound.wrapping_add(unzigzag(stream.get(cx)?) as u64);
    let (number, ty) = P2lEntry::split_compound(*last_compound);

    *last_revision = last_revision.wrapping_add(unzigzag(stream.get(cx)?) as u64);

    let fnv1 = stream.get(cx)?;
    let fnv1_checksum = u32::try_from(fnv1)
        .map_err(|_| RevfsError::corrupt("checksum out of range in index page"))?;

    entries.push(P2lEntry {
        offset: *item_offset,
        size,
        item_type: ty,
        revision: *last_revision,
        number,
        fnv1_checksum,
    });
    *item_offset += size;
    Ok(())
}

impl<V: Vfs> ItemIndex<V> {
    /// All items of the cluster containing `offset` in the file holding
    /// `revision`, in offset order.
    pub fn p2l_index_lookup(
        &self,
        cx: &Cx,
        revision: Revision,
        offset: i64,
    ) -> Result<Vec<P2lEntry>> {
        let mut stream: Option<PackedStream<V::File>> = None;
        let entries = self.p2l_lookup_body(cx, &mut stream, revision, offset)?;
        Ok(entries)
    }

    /// The entry starting at exactly `offset`, or `None` when `offset` is
    /// not an item's start offset.
    pub fn p2l_entry_lookup(
        &self,
        cx: &Cx,
        revision: Revision,
        offset: i64,
    ) -> Result<Option<P2lEntry>> {
        let mut stream: Option<PackedStream<V::File>> = None;
        let (_, key) = self.get_p2l_keys(cx, &mut stream, revision, offset)?;

        if let Some(found) = self
            .p2l_page_cache
            .get_partial(&key, |v| entry_from_page_blob(v, offset))?
        {
            return Ok(found);
        }

        // Standard index lookup; it fills the cache and prefetches for
        // future lookups.
        let entries = self.p2l_lookup_body(cx, &mut stream, revision, offset)?;
        let at = entries.partition_point(|entry| entry.offset < offset);
        Ok(entries
            .get(at)
            .filter(|entry| entry.offset == offset)
            .copied())
    }

    /// The first offset past the indexed file content.
    pub fn p2l_get_max_offset(&self, cx: &Cx, revision: Revision) -> Result<i64> {
        let (base, packed) = self.rev_key(revision);
        if let Some(file_size) = self
            .p2l_header_cache
            .get_partial(&header_key(base, packed), file_size_from_blob)?
        {
            return Ok(file_size as i64);
        }
        let mut stream = None;
        let header = self.read_and_cache_p2l_header(cx, &mut stream, revision)?;
        Ok(header.file_size as i64)
    }

    fn p2l_lookup_body(
        &self,
        cx: &Cx,
        stream: &mut Option<PackedStream<V::File>>,
        revision: Revision,
        offset: i64,
    ) -> Result<Vec<P2lEntry>> {
        let (info, key) = self.get_p2l_keys(cx, stream, revision, offset)?;
        let mut entries = self.page_entries(cx, stream, revision, &info, &key, true)?;

        // When the page's first entry starts past the cluster start, the
        // head of the cluster belongs to an item described in a preceding
        // page (it straddles the boundary). Splice that item in so the
        // returned entries cover the whole cluster.
        if let Some(first) = entries.first().copied() {
            if info.page_start > 0 && first.offset > info.page_start as i64 {
                let probe = info.page_start as i64 - 1;
                let (probe_info, probe_key) =
                    self.get_p2l_keys(cx, stream, revision, probe)?;
                let previous =
                    self.page_entries(cx, stream, revision, &probe_info, &probe_key, false)?;
                let mut completed: Vec<P2lEntry> = previous
                    .into_iter()
                    .filter(|e| e.end() > info.page_start as i64 && e.offset < first.offset)
                    .collect();
                completed.append(&mut entries);
                entries = completed;
            }
        }
        Ok(entries)
    }

    /// The entries of the page described by `info`: from the cache when
    /// possible, otherwise decoded from disk, cached, and (for direct
    /// lookups) surrounded by prefetch of its neighbors.
    fn page_entries(
        &self,
        cx: &Cx,
        stream: &mut Option<PackedStream<V::File>>,
        revision: Revision,
        info: &P2lPageInfo,
        key: &[i64; 3],
        prefetch: bool,
    ) -> Result<Vec<P2lEntry>> {
        if let Some(page) = self.p2l_page_cache.get(key)? {
            return Ok(page.entries);
        }
        trace!(revision, page_no = info.page_no, "phys-to-log page miss");

        let block = self.config.block_size;
        let max_offset = align_up(info.next_offset, block);
        let min_offset = align_down(info.start_offset, block).saturating_sub(block);

        // We read index data in larger blocks, so the stream buffer usually
        // holds more pages than the requested one. Cache the preceding
        // pages, the page itself, then the following pages.
        if prefetch {
            let mut bucket = PREFETCH_BUCKET;
            let mut prefetch_offset = info.page_start;
            while prefetch_offset >= info.page_size && info.page_size > 0 {
                prefetch_offset -= info.page_size;
                let (stop, _) = self.prefetch_p2l_page(
                    cx,
                    stream,
                    revision,
                    prefetch_offset,
                    min_offset,
                    &mut bucket,
                )?;
                if stop {
                    break;
                }
            }
        }

        let opened = self.auto_open_p2l(cx, stream, revision)?;
        let page = read_page(opened, cx, info)?;
        self.p2l_page_cache.set(key, &page);

        if prefetch {
            let mut bucket = PREFETCH_BUCKET;
            let mut forward = *info;
            let mut prefetch_offset = info.page_start;
            while forward.next_offset < max_offset && forward.page_no + 1 < forward.page_count {
                prefetch_offset += info.page_size;
                let (stop, next_info) = self.prefetch_p2l_page(
                    cx,
                    stream,
                    revision,
                    prefetch_offset,
                    min_offset,
                    &mut bucket,
                )?;
                if stop {
                    break;
                }
                forward = next_info;
            }
        }

        Ok(page.entries)
    }

    /// Prefetch the page covering `offset` unless it is already cached or
    /// lies before `min_offset`. Returns (stop, page info).
    fn prefetch_p2l_page(
        &self,
        cx: &Cx,
        stream: &mut Option<PackedStream<V::File>>,
        revision: Revision,
        offset: u64,
        min_offset: u64,
        bucket: &mut i32,
    ) -> Result<(bool, P2lPageInfo)> {
        cx.checkpoint()?;
        let info = self.get_p2l_page_info(cx, stream, revision, offset as i64)?;
        if info.start_offset < min_offset {
            // Page outside the prefetch window.
            return Ok((true, info));
        }

        let (_, packed) = self.rev_key(revision);
        let key = page_key(info.first_revision, packed, info.page_no);
        if self.p2l_page_cache.has_key(&key) {
            // Stop prefetching once most neighbors turn out to be cached.
            *bucket -= 1;
            return Ok((*bucket <= 0, info));
        }
        *bucket += 1;

        let opened = self.auto_open_p2l(cx, stream, revision)?;
        let page = read_page(opened, cx, &info)?;
        self.p2l_page_cache.set(&key, &page);
        trace!(page_no = info.page_no, "prefetched phys-to-log page");
        Ok((false, info))
    }

    /// Page info plus cache key for the page covering `offset`, failing
    /// when the offset lies outside the indexed file.
    fn get_p2l_keys(
        &self,
        cx: &Cx,
        stream: &mut Option<PackedStream<V::File>>,
        revision: Revision,
        offset: i64,
    ) -> Result<(P2lPageInfo, [i64; 3])> {
        if offset < 0 {
            return Err(RevfsError::OffsetOverflow { revision, offset });
        }
        let info = self.get_p2l_page_info(cx, stream, revision, offset)?;
        if info.page_no >= info.page_count {
            return Err(RevfsError::OffsetOverflow { revision, offset });
        }
        let (_, packed) = self.rev_key(revision);
        Ok((info, page_key(info.first_revision, packed, info.page_no)))
    }

    fn get_p2l_page_info(
        &self,
        cx: &Cx,
        stream: &mut Option<PackedStream<V::File>>,
        revision: Revision,
        offset: i64,
    ) -> Result<P2lPageInfo> {
        let (base, packed) = self.rev_key(revision);
        if let Some(info) = self
            .p2l_header_cache
            .get_partial(&header_key(base, packed), |v| {
                page_info_from_blob(v, offset.max(0) as u64)
            })?
        {
            return Ok(info);
        }
        let header = self.read_and_cache_p2l_header(cx, stream, revision)?;
        Ok(header.page_info(offset.max(0) as u64))
    }

    fn read_and_cache_p2l_header(
        &self,
        cx: &Cx,
        stream: &mut Option<PackedStream<V::File>>,
        revision: Revision,
    ) -> Result<P2lHeader> {
        let (base, packed) = self.rev_key(revision);
        let stream = self.auto_open_p2l(cx, stream, revision)?;
        let header = read_header(stream, cx)?;
        self.p2l_header_cache
            .set(&header_key(base, packed), &header);
        Ok(header)
    }

    fn auto_open_p2l<'a>(
        &self,
        cx: &Cx,
        stream: &'a mut Option<PackedStream<V::File>>,
        revision: Revision,
    ) -> Result<&'a mut PackedStream<V::File>> {
        if stream.is_none() {
            let (base, _) = self.rev_key(revision);
            *stream = Some(PackedStream::open(
                &*self.vfs,
                cx,
                &self.layout.p2l_index_path(base),
                self.config.block_size,
            )?);
        }
        Ok(stream.as_mut().expect("stream was just opened"))
    }

    /// Build the final phys-to-log index for `revision` at `index_path`
    /// from the proto index at `proto_path`.
    pub fn create_p2l_index(
        &self,
        cx: &Cx,
        index_path: &Path,
        proto_path: &Path,
        revision: Revision,
    ) -> Result<()> {
        let page_size = self.config.p2l_page_size;
        let mut proto = self.vfs.open(cx, proto_path, OpenFlags::read_only())?;

        let mut table_sizes: Vec<u64> = Vec::new();
        let mut buffer: SpillBuf<V> = SpillBuf::new(SPILL_THRESHOLD);
        let mut buffered_at_page_start = 0u64;
        let mut last_entry_end = 0i64;
        let mut last_page_end = 0u64;
        let mut last_revision = revision;
        let mut last_compound = 0u64;
        let mut new_page = true;
        let mut file_size = 0u64;
        let mut pos = 0u64;
        let mut enc = Vec::new();

        loop {
            cx.checkpoint()?;
            let record = read_p2l_proto_entry(&mut proto, cx, pos)?;
            pos += crate::proto::P2L_PROTO_RECORD_SIZE;
            let eof = record.is_none();

            let entry = match record {
                Some(mut entry) => {
                    // Fix up items created before the txn knew its target
                    // revision.
                    if entry.revision == INVALID_REVISION {
                        entry.revision = revision;
                    }
                    entry
                }
                None => {
                    // Synthetic "unused" section covering the bytes between
                    // the last item and the end of the last cluster, so
                    // entry sizes always sum to the recorded file size.
                    file_size = align_up(last_entry_end as u64, page_size);
                    P2lEntry {
                        offset: last_entry_end,
                        size: file_size as i64 - last_entry_end,
                        item_type: item_type::UNUSED,
                        revision: last_revision,
                        number: 0,
                        fnv1_checksum: 0,
                    }
                }
            };

            // An entry starting a page stores its absolute offset and
            // resets the delta state.
            if new_page {
                enc.clear();
                write_uvarint(&mut enc, entry.offset as u64);
                buffer.write(cx, &self.vfs, &enc)?;
                last_revision = revision;
                last_compound = 0;
                new_page = false;
            }

            enc.clear();
            write_uvarint(&mut enc, entry.size as u64);
            let compound = entry.compound();
            write_ivarint(&mut enc, compound.wrapping_sub(last_compound) as i64);
            last_compound = compound;
            write_ivarint(&mut enc, entry.revision.wrapping_sub(last_revision) as i64);
            last_revision = entry.revision;
            write_uvarint(&mut enc, u64::from(entry.fnv1_checksum));
            buffer.write(cx, &self.vfs, &enc)?;

            last_entry_end = entry.end();

            // Close pages for every cluster boundary the entry reached.
            while (last_entry_end as u64).saturating_sub(last_page_end) >= page_size {
                let buffered = buffer.len();
                table_sizes.push(buffered - buffered_at_page_start);
                buffered_at_page_start = buffered;
                last_page_end += page_size;
                new_page = true;
            }

            if eof {
                break;
            }
        }

        // An unclosed partial page at the end (only possible when the file
        // ends short of a cluster boundary, which the padding prevents, or
        // when the padding itself started a fresh page).
        if buffer.len() > buffered_at_page_start {
            table_sizes.push(buffer.len() - buffered_at_page_start);
        }

        let temp_path = temp_sibling(index_path);
        let out = self.vfs.open(cx, &temp_path, OpenFlags::create_truncate())?;
        let mut out = AppendFile::new(cx, out)?;

        enc.clear();
        write_uvarint(&mut enc, revision);
        write_uvarint(&mut enc, file_size);
        write_uvarint(&mut enc, page_size);
        write_uvarint(&mut enc, table_sizes.len() as u64);
        for &size in &table_sizes {
            write_uvarint(&mut enc, size);
        }
        out.append(cx, &enc)?;
        buffer.copy_into(cx, &mut out)?;
        out.sync(cx)?;
        drop(out);

        self.vfs.rename(cx, &temp_path, index_path)?;
        self.vfs.set_read_only(cx, index_path)?;

        debug!(
            revision,
            file_size,
            pages = table_sizes.len(),
            path = %index_path.display(),
            "created phys-to-log index"
        );
        Ok(())
    }
}

/// Decode the page described by `info` from the stream.
fn read_page<F: VfsFile>(
    stream: &mut PackedStream<F>,
    cx: &Cx,
    info: &P2lPageInfo,
) -> Result<P2lPage> {
    stream.seek(info.start_offset);

    // The first number is the absolute rev file offset of the first entry;
    // all entries store only their sizes.
    let mut item_offset = stream.get(cx)? as i64;
    let mut last_revision = info.first_revision;
    let mut last_compound = 0u64;
    let mut entries = Vec::new();

    loop {
        read_entry(
            stream,
            cx,
            &mut item_offset,
            &mut last_revision,
            &mut last_compound,
            &mut entries,
        )?;
        if stream.offset() >= info.next_offset {
            break;
        }
    }

    // If the entries stop short of the cluster end, the item covering the
    // remainder is described in the next page; pull its first entry in.
    if (item_offset as u64) < info.page_start + info.page_size {
        item_offset = stream.get(cx)? as i64;
        last_revision = info.first_revision;
        last_compound = 0;
        read_entry(
            stream,
            cx,
            &mut item_offset,
            &mut last_revision,
            &mut last_compound,
            &mut entries,
        )?;
    }

    Ok(P2lPage { entries })
}
