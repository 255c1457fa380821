//! Log-to-phys index: `(revision, item index) → file offset`.
//!
//! On disk the index is a three-level structure (see the crate docs for the
//! data flow): a header with per-revision page counts, a page table with
//! per-page byte sizes and entry counts, and delta-encoded page bodies.
//! Page offsets within the index file are not stored; they are
//! reconstructed by prefix-summing page sizes from the end of the page
//! table.

use std::path::Path;

use revfs_error::{Result, RevfsError};
use revfs_serial::{BlobView, BlobWriter, CacheBlob, SLOT_SIZE};
use revfs_types::config::{align_down, align_up};
use revfs_types::cx::Cx;
use revfs_types::varint::{unzigzag, write_ivarint, write_uvarint};
use revfs_types::Revision;
use revfs_vfs::traits::AppendFile;
use revfs_vfs::{OpenFlags, Vfs, VfsFile};
use tracing::{debug, trace};

use crate::layout::temp_sibling;
use crate::proto::{read_l2p_proto_entry, MAX_ITEM_INDEX};
use crate::spill::{SpillBuf, SPILL_THRESHOLD};
use crate::stream::PackedStream;
use crate::{header_key, page_key, ItemIndex};

/// Position and size of one page within the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct L2pPageTableEntry {
    /// Byte offset of the page body within the index file.
    pub offset: u64,
    /// Byte size of the page body.
    pub size: u64,
    /// Number of mapping entries in the page.
    pub entry_count: u64,
}

/// Header plus revision and page tables of one log-to-phys index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct L2pHeader {
    /// First revision covered by this index.
    pub first_revision: Revision,
    /// Maximum number of entries per page.
    pub page_size: u64,
    /// `page_table_index[rel_rev]..page_table_index[rel_rev + 1]` is the
    /// page table range of `first_revision + rel_rev`. One extra element at
    /// the end points past the table.
    pub page_table_index: Vec<u64>,
    /// All pages of the index, in file order.
    pub page_table: Vec<L2pPageTableEntry>,
}

/// Everything needed to locate `(revision, item_index)` within the index
/// file, extracted from the header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct L2pPageInfo {
    pub first_revision: Revision,
    /// Page number within the revision's pages.
    pub page_no: u64,
    /// Entry position within that page.
    pub page_offset: u64,
    pub entry: L2pPageTableEntry,
}

/// One decoded page: file offsets indexed by item index (-1 for unused).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct L2pPage {
    pub offsets: Vec<i64>,
}

// Header blob layout.
const HDR_FIRST_REVISION_AT: usize = 0;
const HDR_PAGE_SIZE_AT: usize = 8;
const HDR_PAGE_TABLE_INDEX_AT: usize = 16;
const HDR_PAGE_TABLE_AT: usize = HDR_PAGE_TABLE_INDEX_AT + SLOT_SIZE;
/// u64 fields per flattened page table entry.
const PT_FIELDS: usize = 3;

// Page blob layout.
const PAGE_OFFSETS_AT: usize = 0;

impl L2pHeader {
    pub fn revision_count(&self) -> u64 {
        (self.page_table_index.len() - 1) as u64
    }

    /// Page range of `revision` within [`L2pHeader::page_table`].
    fn page_range(&self, revision: Revision) -> Result<(usize, usize)> {
        let rel = revision
            .checked_sub(self.first_revision)
            .filter(|&rel| rel < self.revision_count())
            .ok_or(RevfsError::RevisionNotIndexed { revision })?;
        let rel = rel as usize;
        Ok((
            self.page_table_index[rel] as usize,
            self.page_table_index[rel + 1] as usize,
        ))
    }

    /// Locate the page covering `(revision, item_index)`.
    pub fn page_info(&self, revision: Revision, item_index: u64) -> Result<L2pPageInfo> {
        let (first, last) = self.page_range(revision)?;
        if first == last {
            // Revision without items.
            return Err(RevfsError::ItemIndexOverflow {
                revision,
                item_index,
            });
        }

        let mut info = L2pPageInfo {
            first_revision: self.first_revision,
            page_no: item_index / self.page_size,
            page_offset: item_index % self.page_size,
            entry: self.page_table[first],
        };
        if info.page_no > 0 {
            if (last - first) as u64 > info.page_no {
                info.entry = self.page_table[first + info.page_no as usize];
            } else {
                // Limit the page to the valid range; the out-of-range entry
                // position makes the page access report the overflow.
                info.entry = self.page_table[last - 1];
                info.page_offset = self.page_size + 1;
            }
        }
        Ok(info)
    }
}

impl CacheBlob for L2pHeader {
    fn serialize(&self) -> Vec<u8> {
        let mut w = BlobWriter::with_capacity(
            HDR_PAGE_TABLE_AT
                + SLOT_SIZE
                + 8 * (self.page_table_index.len() + PT_FIELDS * self.page_table.len()),
        );
        w.put_u64(self.first_revision);
        w.put_u64(self.page_size);
        let index_slot = w.reserve_slot();
        let table_slot = w.reserve_slot();
        w.bind_u64s(index_slot, &self.page_table_index);

        let mut flat = Vec::with_capacity(PT_FIELDS * self.page_table.len());
        for entry in &self.page_table {
            flat.push(entry.offset);
            flat.push(entry.size);
            flat.push(entry.entry_count);
        }
        w.bind_u64s(table_slot, &flat);
        w.finish()
    }

    fn deserialize(blob: &[u8]) -> Result<Self> {
        let v = BlobView::new(blob);
        let page_table_index = v.u64_vec(v.required_slot_at(HDR_PAGE_TABLE_INDEX_AT)?)?;
        if page_table_index.is_empty() {
            return Err(RevfsError::corrupt("empty page table index in header"));
        }
        let flat = v.u64_vec(v.required_slot_at(HDR_PAGE_TABLE_AT)?)?;
        if flat.len() % PT_FIELDS != 0 {
            return Err(RevfsError::corrupt("misaligned page table in header"));
        }
        let page_table = flat
            .chunks_exact(PT_FIELDS)
            .map(|chunk| L2pPageTableEntry {
                offset: chunk[0],
                size: chunk[1],
                entry_count: chunk[2],
            })
            .collect();
        Ok(Self {
            first_revision: v.u64_at(HDR_FIRST_REVISION_AT)?,
            page_size: v.u64_at(HDR_PAGE_SIZE_AT)?,
            page_table_index,
            page_table,
        })
    }
}

/// Partial getter: the [`L2pHeader::page_info`] logic evaluated directly on
/// a cached header blob, touching only the fields it needs.
pub(crate) fn page_info_from_blob(
    v: BlobView<'_>,
    revision: Revision,
    item_index: u64,
) -> Result<L2pPageInfo> {
    let first_revision = v.u64_at(HDR_FIRST_REVISION_AT)?;
    let page_size = v.u64_at(HDR_PAGE_SIZE_AT)?;
    if page_size == 0 {
        return Err(RevfsError::corrupt("zero page size in cached header"));
    }
    let index_slot = v.required_slot_at(HDR_PAGE_TABLE_INDEX_AT)?;
    if index_slot.len == 0 {
        return Err(RevfsError::corrupt("empty page table index in header"));
    }
    let revision_count = (index_slot.len - 1) as u64;

    let rel = revision
        .checked_sub(first_revision)
        .filter(|&rel| rel < revision_count)
        .ok_or(RevfsError::RevisionNotIndexed { revision })? as usize;
    let first = v.u64_index(index_slot, rel)? as usize;
    let last = v.u64_index(index_slot, rel + 1)? as usize;
    if first == last {
        return Err(RevfsError::ItemIndexOverflow {
            revision,
            item_index,
        });
    }

    let table_slot = v.required_slot_at(HDR_PAGE_TABLE_AT)?;
    let read_entry = |page: usize| -> Result<L2pPageTableEntry> {
        Ok(L2pPageTableEntry {
            offset: v.u64_index(table_slot, PT_FIELDS * page)?,
            size: v.u64_index(table_slot, PT_FIELDS * page + 1)?,
            entry_count: v.u64_index(table_slot, PT_FIELDS * page + 2)?,
        })
    };

    let mut info = L2pPageInfo {
        first_revision,
        page_no: item_index / page_size,
        page_offset: item_index % page_size,
        entry: read_entry(first)?,
    };
    if info.page_no > 0 {
        if (last - first) as u64 > info.page_no {
            info.entry = read_entry(first + info.page_no as usize)?;
        } else {
            info.entry = read_entry(last - 1)?;
            info.page_offset = page_size + 1;
        }
    }
    Ok(info)
}

/// Partial getter: the page table range of `revision`, or an empty vector
/// when the revision lies outside the cached header.
pub(crate) fn page_table_from_blob(
    v: BlobView<'_>,
    revision: Revision,
) -> Result<Vec<L2pPageTableEntry>> {
    let first_revision = v.u64_at(HDR_FIRST_REVISION_AT)?;
    let index_slot = v.required_slot_at(HDR_PAGE_TABLE_INDEX_AT)?;
    if index_slot.len == 0 {
        return Err(RevfsError::corrupt("empty page table index in header"));
    }
    let revision_count = (index_slot.len - 1) as u64;

    let Some(rel) = revision
        .checked_sub(first_revision)
        .filter(|&rel| rel < revision_count)
    else {
        return Ok(Vec::new());
    };
    let rel = rel as usize;
    let first = v.u64_index(index_slot, rel)? as usize;
    let last = v.u64_index(index_slot, rel + 1)? as usize;

    let table_slot = v.required_slot_at(HDR_PAGE_TABLE_AT)?;
    let mut pages = Vec::with_capacity(last.saturating_sub(first));
    for page in first..last {
        pages.push(L2pPageTableEntry {
            offset: v.u64_index(table_slot, PT_FIELDS * page)?,
            size: v.u64_index(table_slot, PT_FIELDS * page + 1)?,
            entry_count: v.u64_index(table_slot, PT_FIELDS * page + 2)?,
        });
    }
    Ok(pages)
}

impl L2pPage {
    /// The file offset stored at `page_offset`.
    pub fn entry(&self, page_offset: u64, revision: Revision, item_index: u64) -> Result<i64> {
        self.offsets
            .get(page_offset as usize)
            .copied()
            .ok_or(RevfsError::ItemIndexOverflow {
                revision,
                item_index,
            })
    }
}

impl CacheBlob for L2pPage {
    fn serialize(&self) -> Vec<u8> {
        let mut w = BlobWriter::with_capacity(SLOT_SIZE + 8 * self.offsets.len());
        let slot = w.reserve_slot();
        w.bind_i64s(slot, &self.offsets);
        w.finish()
    }

    fn deserialize(blob: &[u8]) -> Result<Self> {
        let v = BlobView::new(blob);
        Ok(Self {
            offsets: v.i64_vec(v.required_slot_at(PAGE_OFFSETS_AT)?)?,
        })
    }
}

/// Partial getter: one offset out of a cached page blob.
pub(crate) fn entry_from_page_blob(
    v: BlobView<'_>,
    page_offset: u64,
    revision: Revision,
    item_index: u64,
) -> Result<i64> {
    let slot = v.required_slot_at(PAGE_OFFSETS_AT)?;
    if page_offset >= slot.len as u64 {
        return Err(RevfsError::ItemIndexOverflow {
            revision,
            item_index,
        });
    }
    v.i64_index(slot, page_offset as usize)
}

/// Read header, revision table and page table from the start of the index
/// stream.
fn read_header<F: VfsFile>(stream: &mut PackedStream<F>, cx: &Cx) -> Result<L2pHeader> {
    stream.seek(0);
    let first_revision = stream.get(cx)?;
    let page_size = stream.get(cx)?;
    let revision_count = usize::try_from(stream.get(cx)?)
        .map_err(|_| RevfsError::corrupt("revision count out of range"))?;
    let page_count = usize::try_from(stream.get(cx)?)
        .map_err(|_| RevfsError::corrupt("page count out of range"))?;
    if page_size == 0 {
        return Err(RevfsError::corrupt("zero log-to-phys page size"));
    }

    let mut page_table_index = Vec::with_capacity((revision_count + 1).min(0x10000));
    let mut total_pages = 0u64;
    page_table_index.push(0);
    for _ in 0..revision_count {
        total_pages += stream.get(cx)?;
        page_table_index.push(total_pages);
    }
    if total_pages != page_count as u64 {
        return Err(RevfsError::corrupt(format!(
            "revision table covers {total_pages} pages, header claims {page_count}"
        )));
    }

    let mut page_table = Vec::with_capacity(page_count.min(0x10000));
    for _ in 0..page_count {
        let size = stream.get(cx)?;
        let entry_count = stream.get(cx)?;
        page_table.push(L2pPageTableEntry {
            offset: 0,
            size,
            entry_count,
        });
    }

    // Pages follow the page table back to back; derive their offsets.
    let mut offset = stream.offset();
    for entry in &mut page_table {
        entry.offset = offset;
        offset += entry.size;
    }

    Ok(L2pHeader {
        first_revision,
        page_size,
        page_table_index,
        page_table,
    })
}

/// Decode the page described by `entry` from the stream.
fn read_page<F: VfsFile>(
    stream: &mut PackedStream<F>,
    cx: &Cx,
    entry: &L2pPageTableEntry,
) -> Result<L2pPage> {
    stream.seek(entry.offset);
    let mut offsets = Vec::with_capacity((entry.entry_count as usize).min(0x10000));
    let mut last_value = 0u64;
    for _ in 0..entry.entry_count {
        last_value = last_value.wrapping_add(unzigzag(stream.get(cx)?) as u64);
        // The stored value is offset + 1, with 0 meaning "unused".
        offsets.push(last_value.wrapping_sub(1) as i64);
    }
    Ok(L2pPage { offsets })
}

impl<V: Vfs> ItemIndex<V> {
    /// Find the absolute offset of `item_index` in the file containing
    /// `revision`.
    ///
    /// With `txn_id` given, `revision` is the transaction's base revision
    /// and the not-yet-finalized proto index answers the lookup. Returns -1
    /// when the item is known to be unused.
    pub fn item_offset(
        &self,
        cx: &Cx,
        revision: Revision,
        txn_id: Option<&str>,
        item_index: u64,
    ) -> Result<i64> {
        if let Some(txn_id) = txn_id {
            if self.layout.uses_logical_addressing(revision + 1) {
                // The txn will produce a logically addressed revision, so
                // its (proto) index file answers the lookup.
                self.l2p_proto_lookup(cx, txn_id, item_index)
            } else {
                // For data in txns of physically addressed repositories,
                // the item index *is* the offset.
                Ok(item_index as i64)
            }
        } else if self.layout.uses_logical_addressing(revision) {
            self.l2p_index_lookup(cx, revision, item_index)
        } else if self.layout.is_packed(revision) {
            let base = self.layout.packed_base_offset(revision)?;
            Ok(base + item_index as i64)
        } else {
            Ok(item_index as i64)
        }
    }

    /// Number of items in each of the `count` revisions starting at
    /// `start_revision`.
    pub fn l2p_get_max_ids(
        &self,
        cx: &Cx,
        start_revision: Revision,
        count: usize,
    ) -> Result<Vec<u64>> {
        let mut max_ids = Vec::with_capacity(count);
        let mut header = self.get_l2p_header(cx, start_revision)?;

        for revision in start_revision..start_revision + count as u64 {
            if revision >= header.first_revision + header.revision_count() {
                header = self.get_l2p_header(cx, revision)?;
            }
            if revision < header.first_revision
                || revision >= header.first_revision + header.revision_count()
            {
                return Err(RevfsError::RevisionNotIndexed { revision });
            }
            let rel = (revision - header.first_revision) as usize;
            let first = header.page_table_index[rel] as usize;
            let last = header.page_table_index[rel + 1] as usize;
            if first == last {
                max_ids.push(0);
                continue;
            }

            // All pages of a revision except the last are full.
            let full_pages = (last - first - 1) as u64;
            max_ids.push(full_pages * header.page_size + header.page_table[last - 1].entry_count);
        }
        Ok(max_ids)
    }

    fn l2p_index_lookup(&self, cx: &Cx, revision: Revision, item_index: u64) -> Result<i64> {
        let mut stream: Option<PackedStream<V::File>> = None;
        let info = self.get_l2p_page_info(cx, &mut stream, revision, item_index)?;

        let (_, packed) = self.rev_key(revision);
        let key = page_key(revision, packed, info.page_no);
        if let Some(offset) = self.l2p_page_cache.get_partial(&key, |v| {
            entry_from_page_blob(v, info.page_offset, revision, item_index)
        })? {
            return Ok(offset);
        }

        // Page miss: read it from disk (the data may well sit in the stream
        // buffer already), cache it, then prefetch neighboring pages.
        let stream = self.auto_open_l2p(cx, &mut stream, revision)?;
        let page = read_page(stream, cx, &info.entry)?;
        self.l2p_page_cache.set(&key, &page);
        let offset = page.entry(info.page_offset, revision, item_index)?;
        trace!(revision, item_index, offset, "log-to-phys page miss");

        let block = self.config.block_size;
        let min_offset = align_down(info.entry.offset, block).saturating_sub(block);
        let max_offset = align_up(info.entry.offset + info.entry.size, block);
        let shard_end = info.first_revision
            + if packed {
                self.config.shard_size
            } else {
                1
            };

        // Forward through the rest of the shard, then backwards; stop as
        // soon as a page falls outside the window or its page table is not
        // cached.
        for prefetch_revision in revision..shard_end {
            let excluded = (prefetch_revision == revision).then_some(info.page_no);
            if self.prefetch_l2p_pages(cx, stream, prefetch_revision, excluded, min_offset, max_offset)? {
                break;
            }
        }
        for prefetch_revision in (info.first_revision..revision).rev() {
            if self.prefetch_l2p_pages(cx, stream, prefetch_revision, None, min_offset, max_offset)? {
                break;
            }
        }

        Ok(offset)
    }

    /// Cache the pages of `revision` whose bodies fall inside
    /// `[min_offset, max_offset)` in the index file. Returns true when the
    /// caller should stop prefetching.
    fn prefetch_l2p_pages(
        &self,
        cx: &Cx,
        stream: &mut PackedStream<V::File>,
        revision: Revision,
        excluded_page_no: Option<u64>,
        min_offset: u64,
        max_offset: u64,
    ) -> Result<bool> {
        let (base, packed) = self.rev_key(revision);
        let Some(pages) = self
            .l2p_header_cache
            .get_partial(&header_key(base, packed), |v| {
                page_table_from_blob(v, revision)
            })?
        else {
            // Header not cached; we cannot continue without hitting the
            // disk again.
            return Ok(true);
        };
        if pages.is_empty() {
            return Ok(true);
        }

        for (page_no, entry) in pages.iter().enumerate() {
            cx.checkpoint()?;
            let page_no = page_no as u64;
            if Some(page_no) == excluded_page_no {
                continue;
            }
            if entry.offset < min_offset || entry.offset + entry.size > max_offset {
                return Ok(true);
            }

            let key = page_key(revision, packed, page_no);
            if self.l2p_page_cache.has_key(&key) {
                return Ok(true);
            }
            let page = read_page(stream, cx, entry)?;
            self.l2p_page_cache.set(&key, &page);
            trace!(revision, page_no, "prefetched log-to-phys page");
        }
        Ok(false)
    }

    /// Linear scan of a transaction's proto index; proto logs are small and
    /// this path is rare.
    fn l2p_proto_lookup(&self, cx: &Cx, txn_id: &str, item_index: u64) -> Result<i64> {
        let path = self.layout.l2p_proto_path(txn_id);
        let mut file = self.vfs.open(cx, &path, OpenFlags::read_only())?;

        let mut pos = 0;
        while let Some(entry) = read_l2p_proto_entry(&mut file, cx, pos)? {
            pos += crate::proto::L2P_PROTO_RECORD_SIZE;
            if entry.offset_plus_one == 0 && entry.item_index == 0 {
                // End-of-revision marker.
                continue;
            }
            if entry.item_index == item_index {
                return Ok(entry.offset_plus_one as i64 - 1);
            }
        }
        Ok(-1)
    }

    fn auto_open_l2p<'a>(
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
                &self.layout.l2p_index_path(base),
                self.config.block_size,
            )?);
        }
        Ok(stream.as_mut().expect("stream was just opened"))
    }

    /// Header lookup for `revision`: partial-get the page info out of the
    /// cache, falling back to a disk read that also populates the cache.
    fn get_l2p_page_info(
        &self,
        cx: &Cx,
        stream: &mut Option<PackedStream<V::File>>,
        revision: Revision,
        item_index: u64,
    ) -> Result<L2pPageInfo> {
        let (base, packed) = self.rev_key(revision);
        if let Some(info) = self
            .l2p_header_cache
            .get_partial(&header_key(base, packed), |v| {
                page_info_from_blob(v, revision, item_index)
            })?
        {
            return Ok(info);
        }

        let header = self.read_and_cache_l2p_header(cx, stream, revision)?;
        header.page_info(revision, item_index)
    }

    /// Full header lookup for `revision` (cache, else disk + cache).
    fn get_l2p_header(&self, cx: &Cx, revision: Revision) -> Result<L2pHeader> {
        let (base, packed) = self.rev_key(revision);
        if let Some(header) = self.l2p_header_cache.get(&header_key(base, packed))? {
            return Ok(header);
        }
        let mut stream = None;
        self.read_and_cache_l2p_header(cx, &mut stream, revision)
    }

    fn read_and_cache_l2p_header(
        &self,
        cx: &Cx,
        stream: &mut Option<PackedStream<V::File>>,
        revision: Revision,
    ) -> Result<L2pHeader> {
        let (base, packed) = self.rev_key(revision);
        let stream = self.auto_open_l2p(cx, stream, revision)?;
        let header = read_header(stream, cx)?;
        self.l2p_header_cache
            .set(&header_key(base, packed), &header);
        Ok(header)
    }

    /// Build the final log-to-phys index for `revision` at `index_path`
    /// from the proto index at `proto_path`.
    ///
    /// The output is written to a temporary sibling, renamed into place and
    /// made read-only, so concurrent readers see either the complete index
    /// or none.
    pub fn create_l2p_index(
        &self,
        cx: &Cx,
        index_path: &Path,
        proto_path: &Path,
        revision: Revision,
    ) -> Result<()> {
        let page_size = self.config.l2p_page_size;
        let mut proto = self.vfs.open(cx, proto_path, OpenFlags::read_only())?;

        let mut page_counts: Vec<u64> = Vec::new();
        let mut page_sizes: Vec<u64> = Vec::new();
        let mut entry_counts: Vec<u64> = Vec::new();
        let mut buffer: SpillBuf<V> = SpillBuf::new(SPILL_THRESHOLD);

        // Offsets + 1 of the current revision, indexed by item index.
        let mut entries: Vec<u64> = Vec::new();
        let mut pages_at_rev_start = 0usize;
        let mut record_no = 0u64;
        let mut pos = 0u64;
        let mut enc = Vec::new();

        loop {
            cx.checkpoint()?;
            let record = read_l2p_proto_entry(&mut proto, cx, pos)?;
            pos += crate::proto::L2P_PROTO_RECORD_SIZE;
            let eof = record.is_none();

            let is_rev_end = match record {
                Some(entry)
                    if record_no > 0 && entry.offset_plus_one == 0 && entry.item_index == 0 =>
                {
                    true
                }
                Some(entry) => {
                    if entry.item_index >= MAX_ITEM_INDEX {
                        return Err(RevfsError::corrupt(format!(
                            "item index {} out of range in proto index",
                            entry.item_index
                        )));
                    }
                    let idx = entry.item_index as usize;
                    if idx >= entries.len() {
                        entries.resize(idx + 1, 0);
                    }
                    entries[idx] = entry.offset_plus_one;
                    false
                }
                None => false,
            };
            record_no += 1;

            // A trailing end-of-revision marker leaves nothing pending at
            // EOF; an unterminated revision (or a completely empty proto)
            // still gets flushed.
            let flush = is_rev_end || (eof && (!entries.is_empty() || page_counts.is_empty()));
            if flush {
                let mut at = 0;
                while at < entries.len() {
                    let in_page = (entries.len() - at).min(page_size as usize);
                    enc.clear();
                    let mut last_value = 0u64;
                    for &value in &entries[at..at + in_page] {
                        write_ivarint(&mut enc, value.wrapping_sub(last_value) as i64);
                        last_value = value;
                    }
                    buffer.write(cx, &self.vfs, &enc)?;
                    page_sizes.push(enc.len() as u64);
                    entry_counts.push(in_page as u64);
                    at += in_page;
                }
                entries.clear();

                page_counts.push((page_sizes.len() - pages_at_rev_start) as u64);
                pages_at_rev_start = page_sizes.len();
            }

            if eof {
                break;
            }
        }

        // Emit the final file: header, revision table, page table, bodies.
        let temp_path = temp_sibling(index_path);
        let out = self.vfs.open(cx, &temp_path, OpenFlags::create_truncate())?;
        let mut out = AppendFile::new(cx, out)?;

        enc.clear();
        write_uvarint(&mut enc, revision);
        write_uvarint(&mut enc, page_size);
        write_uvarint(&mut enc, page_counts.len() as u64);
        write_uvarint(&mut enc, page_sizes.len() as u64);
        for &count in &page_counts {
            write_uvarint(&mut enc, count);
        }
        for (&size, &entry_count) in page_sizes.iter().zip(&entry_counts) {
            write_uvarint(&mut enc, size);
            write_uvarint(&mut enc, entry_count);
        }
        out.append(cx, &enc)?;
        buffer.copy_into(cx, &mut out)?;
        out.sync(cx)?;
        drop(out);

        self.vfs.rename(cx, &temp_path, index_path)?;
        self.vfs.set_read_only(cx, index_path)?;

        debug!(
            revision,
            revisions = page_counts.len(),
            pages = page_sizes.len(),
            path = %index_path.display(),
            "created log-to-phys index"
        );
        Ok(())
    }
}
