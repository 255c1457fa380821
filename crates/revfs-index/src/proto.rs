//! Proto indexes: fixed-record append logs kept while a transaction is in
//! flight.
//!
//! The commit code appends one record per item as it writes the proto rev
//! file; at finalization the index builders consume the log exactly once to
//! produce the compact index files, and the log is deleted with the
//! transaction. Records are fixed-size little-endian so the builders can
//! stream them with plain positioned reads.

use std::path::Path;

use revfs_error::{Result, RevfsError};
use revfs_types::cx::Cx;
use revfs_types::P2lEntry;
use revfs_vfs::traits::AppendFile;
use revfs_vfs::{OpenFlags, Vfs, VfsFile};

/// Byte size of one log-to-phys proto record.
pub const L2P_PROTO_RECORD_SIZE: u64 = 16;

/// Byte size of one phys-to-log proto record.
pub const P2L_PROTO_RECORD_SIZE: u64 = 48;

/// Largest item index a transaction may hand to the proto index. The final
/// index builder uses item indexes as dense array positions, so this bound
/// keeps a corrupt or hostile proto log from forcing absurd allocations.
pub const MAX_ITEM_INDEX: u64 = (u32::MAX / 2) as u64;

/// One log-to-phys proto record. Both fields zero marks the end of a
/// revision's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct L2pProtoEntry {
    /// Rev file offset + 1; 0 for end-of-revision markers.
    pub offset_plus_one: u64,
    /// Item index; 0 for end-of-revision markers.
    pub item_index: u64,
}

/// Append handle for a transaction's log-to-phys proto index.
pub struct L2pProtoIndex<F: VfsFile> {
    file: AppendFile<F>,
}

impl<F: VfsFile> L2pProtoIndex<F> {
    /// Open (creating on demand) the proto index at `path`, continuing after
    /// any records already present.
    pub fn open<V: Vfs<File = F>>(vfs: &V, cx: &Cx, path: &Path) -> Result<Self> {
        let file = vfs.open(cx, path, OpenFlags::read_write_create())?;
        Ok(Self {
            file: AppendFile::new(cx, file)?,
        })
    }

    /// Record that the item `item_index` lives at `offset` in the revision
    /// file. `offset` may be -1 for "does not exist".
    pub fn add_entry(&mut self, cx: &Cx, offset: i64, item_index: u64) -> Result<()> {
        if offset < -1 {
            return Err(RevfsError::InvalidOffset { offset });
        }
        if item_index >= MAX_ITEM_INDEX {
            return Err(RevfsError::ItemIndexTooLarge { item_index });
        }

        // Offset -1 maps onto the unsigned "unused" encoding of 0.
        self.write_record(
            cx,
            L2pProtoEntry {
                offset_plus_one: (offset + 1) as u64,
                item_index,
            },
        )
    }

    /// Terminate the current revision's contribution; the next entries
    /// belong to the following revision of the transaction.
    pub fn add_revision(&mut self, cx: &Cx) -> Result<()> {
        self.write_record(
            cx,
            L2pProtoEntry {
                offset_plus_one: 0,
                item_index: 0,
            },
        )
    }

    /// Flush the log to stable storage. Called on transaction commit.
    pub fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.file.sync(cx)
    }

    fn write_record(&mut self, cx: &Cx, entry: L2pProtoEntry) -> Result<()> {
        let mut record = [0u8; L2P_PROTO_RECORD_SIZE as usize];
        record[..8].copy_from_slice(&entry.offset_plus_one.to_le_bytes());
        record[8..].copy_from_slice(&entry.item_index.to_le_bytes());
        self.file.append(cx, &record)
    }
}

/// Read the log-to-phys proto record at byte position `pos`, or `None` at
/// the end of the log.
pub(crate) fn read_l2p_proto_entry<F: VfsFile>(
    file: &mut F,
    cx: &Cx,
    pos: u64,
) -> Result<Option<L2pProtoEntry>> {
    let mut record = [0u8; L2P_PROTO_RECORD_SIZE as usize];
    let n = file.read_at(cx, &mut record, pos)?;
    if n == 0 {
        return Ok(None);
    }
    if n < record.len() {
        return Err(RevfsError::corrupt(format!(
            "truncated proto index record in '{}'",
            file.path().display()
        )));
    }
    Ok(Some(L2pProtoEntry {
        offset_plus_one: u64::from_le_bytes(record[..8].try_into().unwrap()),
        item_index: u64::from_le_bytes(record[8..].try_into().unwrap()),
    }))
}

/// Append handle for a transaction's phys-to-log proto index.
pub struct P2lProtoIndex<F: VfsFile> {
    file: AppendFile<F>,
}

impl<F: VfsFile> P2lProtoIndex<F> {
    /// Open (creating on demand) the proto index at `path`.
    pub fn open<V: Vfs<File = F>>(vfs: &V, cx: &Cx, path: &Path) -> Result<Self> {
        let file = vfs.open(cx, path, OpenFlags::read_write_create())?;
        Ok(Self {
            file: AppendFile::new(cx, file)?,
        })
    }

    /// Record one item description. Entries must be appended in ascending
    /// offset order; an entry whose revision is still unknown carries
    /// `INVALID_REVISION` and is rewritten by the builder.
    pub fn add_entry(&mut self, cx: &Cx, entry: &P2lEntry) -> Result<()> {
        if entry.offset < 0 {
            return Err(RevfsError::InvalidOffset {
                offset: entry.offset,
            });
        }

        let mut record = [0u8; P2L_PROTO_RECORD_SIZE as usize];
        record[..8].copy_from_slice(&entry.offset.to_le_bytes());
        record[8..16].copy_from_slice(&entry.size.to_le_bytes());
        record[16..24].copy_from_slice(&u64::from(entry.item_type).to_le_bytes());
        record[24..32].copy_from_slice(&entry.revision.to_le_bytes());
        record[32..40].copy_from_slice(&entry.number.to_le_bytes());
        record[40..].copy_from_slice(&u64::from(entry.fnv1_checksum).to_le_bytes());
        self.file.append(cx, &record)
    }

    /// Flush the log to stable storage. Called on transaction commit.
    pub fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.file.sync(cx)
    }
}

/// Read the phys-to-log proto record at byte position `pos`, or `None` at
/// the end of the log.
pub(crate) fn read_p2l_proto_entry<F: VfsFile>(
    file: &mut F,
    cx: &Cx,
    pos: u64,
) -> Result<Option<P2lEntry>> {
    let mut record = [0u8; P2L_PROTO_RECORD_SIZE as usize];
    let n = file.read_at(cx, &mut record, pos)?;
    if n == 0 {
        return Ok(None);
    }
    if n < record.len() {
        return Err(RevfsError::corrupt(format!(
            "truncated proto index record in '{}'",
            file.path().display()
        )));
    }

    let item_type = u64::from_le_bytes(record[16..24].try_into().unwrap());
    let fnv1 = u64::from_le_bytes(record[40..].try_into().unwrap());
    if item_type > 7 {
        return Err(RevfsError::corrupt(format!(
            "item type {item_type} out of range in proto index"
        )));
    }
    let fnv1_checksum = u32::try_from(fnv1)
        .map_err(|_| RevfsError::corrupt("checksum out of range in proto index"))?;

    Ok(Some(P2lEntry {
        offset: i64::from_le_bytes(record[..8].try_into().unwrap()),
        size: i64::from_le_bytes(record[8..16].try_into().unwrap()),
        item_type: item_type as u8,
        revision: u64::from_le_bytes(record[24..32].try_into().unwrap()),
        number: u64::from_le_bytes(record[32..40].try_into().unwrap()),
        fnv1_checksum,
    }))
}

#[cfg(test)]
mod tests {
    use revfs_types::{item_type, INVALID_REVISION};
    use revfs_vfs::MemoryVfs;

    use super::*;

    #[test]
    fn l2p_records_round_trip() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("txn.l2p-proto");

        let mut proto = L2pProtoIndex::open(&vfs, &cx, path).unwrap();
        proto.add_entry(&cx, 10, 0).unwrap();
        proto.add_entry(&cx, -1, 1).unwrap();
        proto.add_revision(&cx).unwrap();
        proto.sync(&cx).unwrap();
        drop(proto);

        let mut file = vfs.open(&cx, path, OpenFlags::read_only()).unwrap();
        let first = read_l2p_proto_entry(&mut file, &cx, 0).unwrap().unwrap();
        assert_eq!(first.offset_plus_one, 11);
        assert_eq!(first.item_index, 0);

        let second = read_l2p_proto_entry(&mut file, &cx, 16).unwrap().unwrap();
        assert_eq!(second.offset_plus_one, 0);
        assert_eq!(second.item_index, 1);

        let marker = read_l2p_proto_entry(&mut file, &cx, 32).unwrap().unwrap();
        assert_eq!(marker.offset_plus_one, 0);
        assert_eq!(marker.item_index, 0);

        assert!(read_l2p_proto_entry(&mut file, &cx, 48).unwrap().is_none());
    }

    #[test]
    fn l2p_rejects_out_of_range_input() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut proto = L2pProtoIndex::open(&vfs, &cx, Path::new("p")).unwrap();

        assert!(matches!(
            proto.add_entry(&cx, -2, 0),
            Err(RevfsError::InvalidOffset { .. })
        ));
        assert!(matches!(
            proto.add_entry(&cx, 0, MAX_ITEM_INDEX),
            Err(RevfsError::ItemIndexTooLarge { .. })
        ));
    }

    #[test]
    fn reopening_continues_appending() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("txn.l2p-proto");

        let mut proto = L2pProtoIndex::open(&vfs, &cx, path).unwrap();
        proto.add_entry(&cx, 1, 0).unwrap();
        drop(proto);

        let mut proto = L2pProtoIndex::open(&vfs, &cx, path).unwrap();
        proto.add_entry(&cx, 2, 1).unwrap();
        drop(proto);

        let mut file = vfs.open(&cx, path, OpenFlags::read_only()).unwrap();
        assert_eq!(file.file_size(&cx).unwrap(), 32);
        let second = read_l2p_proto_entry(&mut file, &cx, 16).unwrap().unwrap();
        assert_eq!(second.offset_plus_one, 3);
    }

    #[test]
    fn p2l_records_round_trip() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("txn.p2l-proto");

        let entry = P2lEntry {
            offset: 0,
            size: 20,
            item_type: item_type::NODEREV,
            revision: INVALID_REVISION,
            number: 3,
            fnv1_checksum: 0xAABB_CCDD,
        };

        let mut proto = P2lProtoIndex::open(&vfs, &cx, path).unwrap();
        proto.add_entry(&cx, &entry).unwrap();
        drop(proto);

        let mut file = vfs.open(&cx, path, OpenFlags::read_only()).unwrap();
        let restored = read_p2l_proto_entry(&mut file, &cx, 0).unwrap().unwrap();
        assert_eq!(restored, entry);
        assert!(read_p2l_proto_entry(&mut file, &cx, 48).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("short");
        let mut file = vfs
            .open(&cx, path, OpenFlags::read_write_create())
            .unwrap();
        file.write_at(&cx, &[0u8; 10], 0).unwrap();

        assert!(read_l2p_proto_entry(&mut file, &cx, 0).is_err());
    }
}
