//! End-to-end tests of the item-index engine: proto index → builder →
//! final file → lookups, on small page/cluster sizes so page boundaries
//! are easy to hit.

use std::path::Path;
use std::sync::Arc;

use revfs::{
    item_type, varint, BlobCache, Cx, FsLayout, IndexConfig, ItemIndex, MemoryBlobCache,
    MemoryVfs, OpenFlags, P2lEntry, RevfsError, ShardedLayout, Vfs, VfsFile, INVALID_REVISION,
};

const SMALL: IndexConfig = IndexConfig {
    l2p_page_size: 4,
    p2l_page_size: 64,
    shard_size: 4,
    block_size: 64,
};

struct Fixture {
    cx: Cx,
    vfs: Arc<MemoryVfs>,
    layout: Arc<ShardedLayout>,
    cache: Arc<MemoryBlobCache>,
    engine: ItemIndex<MemoryVfs>,
}

fn fixture_with(config: IndexConfig, layout: ShardedLayout) -> Fixture {
    let vfs = Arc::new(MemoryVfs::new());
    let layout = Arc::new(layout);
    let cache = Arc::new(MemoryBlobCache::new(8 << 20));
    let engine = ItemIndex::new(
        Arc::clone(&vfs),
        Arc::clone(&layout) as Arc<dyn FsLayout>,
        config,
        Arc::clone(&cache) as Arc<dyn BlobCache>,
    )
    .unwrap();
    Fixture {
        cx: Cx::new(),
        vfs,
        layout,
        cache,
        engine,
    }
}

fn fixture() -> Fixture {
    fixture_with(SMALL, ShardedLayout::new("db", 4))
}

impl Fixture {
    /// Append one revision's L2P proto records and build its index.
    fn build_l2p(&self, revision: u64, revs: &[&[(i64, u64)]]) {
        let txn = format!("t{revision}");
        let mut proto = self.engine.open_l2p_proto_index(&self.cx, &txn).unwrap();
        for entries in revs {
            for &(offset, item_index) in *entries {
                proto.add_entry(&self.cx, offset, item_index).unwrap();
            }
            proto.add_revision(&self.cx).unwrap();
        }
        proto.sync(&self.cx).unwrap();
        drop(proto);

        self.engine
            .create_l2p_index(
                &self.cx,
                &self.layout.l2p_index_path(revision),
                &self.layout.l2p_proto_path(&txn),
                revision,
            )
            .unwrap();
    }

    /// Append P2L proto records and build the index for `revision`.
    fn build_p2l(&self, revision: u64, entries: &[P2lEntry]) {
        let txn = format!("t{revision}");
        let mut proto = self.engine.open_p2l_proto_index(&self.cx, &txn).unwrap();
        for entry in entries {
            proto.add_entry(&self.cx, entry).unwrap();
        }
        proto.sync(&self.cx).unwrap();
        drop(proto);

        self.engine
            .create_p2l_index(
                &self.cx,
                &self.layout.p2l_index_path(revision),
                &self.layout.p2l_proto_path(&txn),
                revision,
            )
            .unwrap();
    }

    fn read_file(&self, path: &Path) -> Vec<u8> {
        let mut file = self.vfs.open(&self.cx, path, OpenFlags::read_only()).unwrap();
        let len = file.file_size(&self.cx).unwrap();
        let mut bytes = vec![0u8; len as usize];
        file.read_exact_at(&self.cx, &mut bytes, 0).unwrap();
        bytes
    }
}

fn p2l(offset: i64, size: i64, revision: u64, number: u64, ty: u8, fnv1: u32) -> P2lEntry {
    P2lEntry {
        offset,
        size,
        item_type: ty,
        revision,
        number,
        fnv1_checksum: fnv1,
    }
}

#[test]
fn single_revision_l2p_lookup() {
    let fx = fixture();
    fx.build_l2p(0, &[&[(9, 0), (19, 1)]]);

    assert_eq!(fx.engine.item_offset(&fx.cx, 0, None, 0).unwrap(), 9);
    assert_eq!(fx.engine.item_offset(&fx.cx, 0, None, 1).unwrap(), 19);
    assert!(matches!(
        fx.engine.item_offset(&fx.cx, 0, None, 2),
        Err(RevfsError::ItemIndexOverflow {
            revision: 0,
            item_index: 2
        })
    ));
    assert_eq!(fx.engine.l2p_get_max_ids(&fx.cx, 0, 1).unwrap(), vec![2]);
}

#[test]
fn l2p_index_wire_format() {
    let fx = fixture();
    fx.build_l2p(0, &[&[(9, 0), (19, 1)]]);

    // first-revision, page size, revision count, page count, one page per
    // revision, page table (2 bytes, 2 entries), then the body: the stored
    // values are offset + 1 (10 and 20), delta + zig-zag encoded.
    let bytes = fx.read_file(&fx.layout.l2p_index_path(0));
    assert_eq!(bytes, [0, 4, 1, 1, 1, 2, 2, 0x14, 0x14]);
}

#[test]
fn sparse_item_indexes() {
    let fx = fixture();
    fx.build_l2p(0, &[&[(99, 0), (399, 3)]]);

    assert_eq!(fx.engine.item_offset(&fx.cx, 0, None, 0).unwrap(), 99);
    assert_eq!(fx.engine.item_offset(&fx.cx, 0, None, 1).unwrap(), -1);
    assert_eq!(fx.engine.item_offset(&fx.cx, 0, None, 2).unwrap(), -1);
    assert_eq!(fx.engine.item_offset(&fx.cx, 0, None, 3).unwrap(), 399);
}

#[test]
fn five_items_make_two_pages() {
    let fx = fixture();
    let items: Vec<(i64, u64)> = (0..5).map(|i| (1000 + i as i64, i)).collect();
    fx.build_l2p(0, &[&items]);

    assert_eq!(fx.engine.l2p_get_max_ids(&fx.cx, 0, 1).unwrap(), vec![5]);
    for i in 0..5u64 {
        assert_eq!(
            fx.engine.item_offset(&fx.cx, 0, None, i).unwrap(),
            1000 + i as i64
        );
    }
}

#[test]
fn l2p_revision_range_errors() {
    let fx = fixture_with(SMALL, ShardedLayout::new("db", 4).with_min_unpacked_revision(4));
    // One packed shard covering revisions 0..4.
    fx.build_l2p(
        0,
        &[&[(10, 0)], &[(20, 0), (30, 1)], &[(40, 0)], &[(50, 0)]],
    );

    // Within the shard everything resolves against the same index file.
    assert_eq!(fx.engine.item_offset(&fx.cx, 1, None, 1).unwrap(), 30);
    assert_eq!(
        fx.engine.l2p_get_max_ids(&fx.cx, 0, 4).unwrap(),
        vec![1, 2, 1, 1]
    );

    // Revision 4 is unpacked and has no index file at all.
    assert!(matches!(
        fx.engine.item_offset(&fx.cx, 4, None, 0),
        Err(RevfsError::CannotOpen { .. })
    ));
}

#[test]
fn max_ids_span_multiple_index_files() {
    let fx = fixture();
    fx.build_l2p(0, &[&[(10, 0), (20, 1)]]);
    fx.build_l2p(1, &[&[(30, 0)]]);

    assert_eq!(
        fx.engine.l2p_get_max_ids(&fx.cx, 0, 2).unwrap(),
        vec![2, 1]
    );
}

#[test]
fn txn_proto_lookup_overrides_index() {
    let fx = fixture();
    let mut proto = fx.engine.open_l2p_proto_index(&fx.cx, "t-open").unwrap();
    proto.add_entry(&fx.cx, 512, 7).unwrap();
    proto.add_revision(&fx.cx).unwrap();
    drop(proto);

    assert_eq!(
        fx.engine.item_offset(&fx.cx, 0, Some("t-open"), 7).unwrap(),
        512
    );
    assert_eq!(
        fx.engine.item_offset(&fx.cx, 0, Some("t-open"), 8).unwrap(),
        -1
    );
}

#[test]
fn physical_addressing_paths() {
    let layout = ShardedLayout::new("db", 4)
        .with_physical_addressing()
        .with_min_unpacked_revision(4)
        .with_pack_offset(1, 4096);
    let fx = fixture_with(SMALL, layout);

    // Packed revision: pack base offset + item index.
    assert_eq!(
        fx.engine.item_offset(&fx.cx, 1, None, 10).unwrap(),
        4106
    );
    // Unpacked revision: the item index is the offset.
    assert_eq!(fx.engine.item_offset(&fx.cx, 5, None, 10).unwrap(), 10);
    // Transactions on physically addressed repositories behave the same.
    assert_eq!(
        fx.engine.item_offset(&fx.cx, 5, Some("t"), 10).unwrap(),
        10
    );
}

#[test]
fn p2l_single_cluster_with_padding() {
    let fx = fixture();
    fx.build_p2l(
        0,
        &[
            p2l(0, 20, 0, 1, item_type::FILE_REP, 0xAA),
            p2l(20, 30, 0, 2, item_type::FILE_REP, 0xBB),
        ],
    );

    let entries = fx.engine.p2l_index_lookup(&fx.cx, 0, 0).unwrap();
    assert_eq!(
        entries,
        vec![
            p2l(0, 20, 0, 1, item_type::FILE_REP, 0xAA),
            p2l(20, 30, 0, 2, item_type::FILE_REP, 0xBB),
            p2l(50, 14, 0, 0, item_type::UNUSED, 0),
        ]
    );
    assert_eq!(fx.engine.p2l_get_max_offset(&fx.cx, 0).unwrap(), 64);
}

#[test]
fn p2l_straddling_item_wire_format() {
    let fx = fixture();
    fx.build_p2l(
        0,
        &[
            p2l(0, 60, 0, 1, item_type::FILE_REP, 1),
            p2l(60, 20, 0, 2, item_type::FILE_REP, 2),
        ],
    );

    // Page 0 holds both items (the second reaches into cluster 1); page 1
    // resumes at absolute offset 80 with only the padding entry.
    let bytes = fx.read_file(&fx.layout.p2l_index_path(0));
    let (first_revision, mut at) = varint::read_uvarint(&bytes).unwrap();
    assert_eq!(first_revision, 0);
    let (file_size, n) = varint::read_uvarint(&bytes[at..]).unwrap();
    assert_eq!(file_size, 128);
    at += n;
    let (page_size, n) = varint::read_uvarint(&bytes[at..]).unwrap();
    assert_eq!(page_size, 64);
    at += n;
    let (page_count, n) = varint::read_uvarint(&bytes[at..]).unwrap();
    assert_eq!(page_count, 2);
    at += n;
    let (page0_size, n) = varint::read_uvarint(&bytes[at..]).unwrap();
    at += n;
    let (_page1_size, n) = varint::read_uvarint(&bytes[at..]).unwrap();
    at += n;

    let page1_at = at + page0_size as usize;
    let (page1_first_offset, _) = varint::read_uvarint(&bytes[page1_at..]).unwrap();
    assert_eq!(page1_first_offset, 80);

    // And through the readers: the straddler covers cluster 1's head, then
    // the padding continues at 80.
    let entries = fx.engine.p2l_index_lookup(&fx.cx, 0, 64).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], p2l(60, 20, 0, 2, item_type::FILE_REP, 2));
    assert_eq!(entries[1].offset, 80);
    assert_eq!(entries[1].item_type, item_type::UNUSED);
}

#[test]
fn p2l_item_spanning_three_boundaries_wire_format() {
    // Small clusters so a single 50-byte item at offset 0 crosses the
    // boundaries at 16, 32 and 48: it closes three pages, two of them
    // empty, and the padding opens a fourth.
    let config = IndexConfig {
        p2l_page_size: 16,
        ..SMALL
    };
    let fx = fixture_with(config, ShardedLayout::new("db", 4));
    let item = p2l(0, 50, 0, 1, item_type::FILE_REP, 7);
    fx.build_p2l(0, &[item]);

    // first-revision 0, file size 64, page size 16, page count 4, page
    // sizes [5, 0, 0, 5], then the two page bodies:
    //   page 0: absolute offset 0, size 50, compound delta +9 (number 1,
    //           type 1), revision delta 0, checksum 7
    //   page 3: absolute offset 50, size 14, then zero deltas for the
    //           padding entry (each page starts from a fresh delta state)
    let bytes = fx.read_file(&fx.layout.p2l_index_path(0));
    assert_eq!(
        bytes,
        [
            0x00, 0x40, 0x10, 0x04, 0x05, 0x00, 0x00, 0x05, // header
            0x00, 0x32, 0x12, 0x00, 0x07, // page 0
            0x32, 0x0E, 0x00, 0x00, 0x00, // page 3
        ]
    );

    // Every offset inside the item resolves back to its description, no
    // matter which cluster it falls into.
    for offset in [0, 15, 16, 31, 32, 47, 48, 49] {
        let entries = fx.engine.p2l_index_lookup(&fx.cx, 0, offset).unwrap();
        let covering = entries
            .iter()
            .find(|e| e.offset <= offset && offset < e.end())
            .unwrap_or_else(|| panic!("offset {offset} not covered"));
        assert_eq!(*covering, item, "offset {offset}");
    }
    assert_eq!(fx.engine.p2l_entry_lookup(&fx.cx, 0, 0).unwrap(), Some(item));
    assert_eq!(fx.engine.p2l_entry_lookup(&fx.cx, 0, 16).unwrap(), None);
    assert_eq!(fx.engine.p2l_get_max_offset(&fx.cx, 0).unwrap(), 64);
}

#[test]
fn p2l_round_trip_reconstructs_input() {
    let fx = fixture();
    let input = vec![
        p2l(0, 10, 0, 1, item_type::NODEREV, 11),
        p2l(10, 60, 0, 2, item_type::FILE_REP, 22),
        p2l(70, 30, 0, 3, item_type::DIR_REP, 33),
        p2l(100, 90, 0, 4, item_type::CHANGES, 44),
    ];
    fx.build_p2l(0, &input);

    let max = fx.engine.p2l_get_max_offset(&fx.cx, 0).unwrap();
    assert_eq!(max, 192);

    // Scan [0, file_size) cluster by cluster and splice the coverage back
    // together.
    let mut reconstructed: Vec<P2lEntry> = Vec::new();
    let mut at = 0i64;
    while at < max {
        let entries = fx.engine.p2l_index_lookup(&fx.cx, 0, at).unwrap();
        for entry in entries {
            if reconstructed.last().is_none_or(|last| last.offset < entry.offset) {
                reconstructed.push(entry);
            }
        }
        at = reconstructed.last().unwrap().end();
    }

    // Adjacent entries tile the file exactly.
    for pair in reconstructed.windows(2) {
        assert_eq!(pair[0].end(), pair[1].offset);
    }
    assert_eq!(reconstructed[..input.len()], input[..]);
    let padding = reconstructed.last().unwrap();
    assert_eq!(padding.item_type, item_type::UNUSED);
    assert_eq!(padding.offset, 190);
    assert_eq!(padding.size, 2);
    assert_eq!(
        reconstructed.iter().map(|e| e.size).sum::<i64>(),
        max
    );
}

#[test]
fn p2l_entry_lookup_by_start_offset() {
    let fx = fixture();
    fx.build_p2l(
        0,
        &[
            p2l(0, 20, 0, 1, item_type::FILE_REP, 1),
            p2l(20, 44, 0, 2, item_type::FILE_REP, 2),
        ],
    );

    let hit = fx.engine.p2l_entry_lookup(&fx.cx, 0, 20).unwrap().unwrap();
    assert_eq!(hit.number, 2);
    assert!(fx.engine.p2l_entry_lookup(&fx.cx, 0, 19).unwrap().is_none());

    assert!(matches!(
        fx.engine.p2l_entry_lookup(&fx.cx, 0, 9999),
        Err(RevfsError::OffsetOverflow { .. })
    ));
}

#[test]
fn p2l_packed_shard_carries_revision_deltas() {
    let fx = fixture_with(SMALL, ShardedLayout::new("db", 4).with_min_unpacked_revision(4));
    fx.build_p2l(
        0,
        &[
            p2l(0, 30, 0, 1, item_type::NODEREV, 1),
            p2l(30, 34, 1, 1, item_type::NODEREV, 2),
            p2l(64, 60, 2, 1, item_type::NODEREV, 3),
            p2l(124, 4, 3, 1, item_type::NODEREV, 4),
        ],
    );

    // Lookups through any revision of the shard hit the same index.
    let entries = fx.engine.p2l_index_lookup(&fx.cx, 3, 64).unwrap();
    assert_eq!(entries[0].revision, 2);

    let entries = fx.engine.p2l_index_lookup(&fx.cx, 0, 0).unwrap();
    assert_eq!(entries[0].revision, 0);
    assert_eq!(entries[1].revision, 1);
}

#[test]
fn p2l_invalid_revision_is_finalized() {
    let fx = fixture();
    fx.build_p2l(
        5,
        &[
            p2l(0, 40, INVALID_REVISION, 1, item_type::NODEREV, 1),
            p2l(40, 24, INVALID_REVISION, 2, item_type::CHANGES, 2),
        ],
    );

    let entries = fx.engine.p2l_index_lookup(&fx.cx, 5, 0).unwrap();
    assert!(entries.iter().all(|entry| entry.revision == 5));
}

#[test]
fn l2p_prefetch_covers_neighbors_within_window() {
    let fx = fixture_with(SMALL, ShardedLayout::new("db", 4).with_min_unpacked_revision(4));
    // A packed shard, every revision small enough that all pages fall into
    // one 64 KiB prefetch window.
    fx.build_l2p(
        0,
        &[
            &[(10, 0), (11, 1)],
            &[(20, 0), (21, 1), (22, 2), (23, 3), (24, 4)],
            &[(30, 0)],
            &[(40, 0), (41, 1)],
        ],
    );

    fx.engine.item_offset(&fx.cx, 1, None, 0).unwrap();
    let (_, misses_after_first) = fx.cache.stats();

    // Every other lookup in the shard is served from the caches filled by
    // the first one.
    assert_eq!(fx.engine.item_offset(&fx.cx, 1, None, 4).unwrap(), 24);
    assert_eq!(fx.engine.item_offset(&fx.cx, 0, None, 1).unwrap(), 11);
    assert_eq!(fx.engine.item_offset(&fx.cx, 2, None, 0).unwrap(), 30);
    assert_eq!(fx.engine.item_offset(&fx.cx, 3, None, 1).unwrap(), 41);
    let (_, misses_after_rest) = fx.cache.stats();
    assert_eq!(misses_after_first, misses_after_rest);
}

#[test]
fn l2p_prefetch_stops_at_window_edge() {
    let config = IndexConfig {
        block_size: 0x10000,
        ..SMALL
    };
    let fx = fixture_with(config, ShardedLayout::new("db", 4));
    // Items spaced 2^40 apart force multi-byte deltas, so 60k items produce
    // an index far larger than the 64 KiB prefetch window.
    let items: Vec<(i64, u64)> = (0..60_000u64).map(|i| ((i as i64) << 40, i)).collect();
    fx.build_l2p(0, &[&items]);

    assert_eq!(fx.engine.item_offset(&fx.cx, 0, None, 0).unwrap(), 0);

    // The page next door was prefetched by the first lookup...
    let (_, misses_before) = fx.cache.stats();
    fx.engine.item_offset(&fx.cx, 0, None, 5).unwrap();
    let (_, misses_near) = fx.cache.stats();
    assert_eq!(misses_before, misses_near);

    // ...but pages far outside the window were not.
    fx.engine.item_offset(&fx.cx, 0, None, 59_999).unwrap();
    let (_, misses_far) = fx.cache.stats();
    assert!(misses_far > misses_near);
}

#[test]
fn interrupt_aborts_build() {
    let fx = fixture();
    let mut proto = fx.engine.open_l2p_proto_index(&fx.cx, "t0").unwrap();
    proto.add_entry(&fx.cx, 1, 0).unwrap();
    proto.add_revision(&fx.cx).unwrap();
    drop(proto);

    let cx = Cx::new();
    cx.interrupt();
    assert!(matches!(
        fx.engine.create_l2p_index(
            &cx,
            &fx.layout.l2p_index_path(0),
            &fx.layout.l2p_proto_path("t0"),
            0,
        ),
        Err(RevfsError::Interrupted)
    ));
    // No partial index file is left behind.
    assert!(!fx
        .vfs
        .exists(&fx.cx, &fx.layout.l2p_index_path(0))
        .unwrap());
}

#[test]
fn config_serde_round_trip() {
    let json = serde_json::to_string(&SMALL).unwrap();
    let back: IndexConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, SMALL);

    // Missing fields fall back to the defaults.
    let partial: IndexConfig = serde_json::from_str(r#"{"shard_size": 16}"#).unwrap();
    assert_eq!(partial.shard_size, 16);
    assert_eq!(partial.l2p_page_size, IndexConfig::default().l2p_page_size);
}
