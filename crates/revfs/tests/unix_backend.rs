//! The same commit pipeline against the real filesystem: proto logs,
//! builder output via temp file + rename, read-only finalization.

use std::fs;
use std::sync::Arc;

use revfs::{
    item_type, Cx, FsLayout, IndexConfig, ItemIndex, MemoryBlobCache, P2lEntry, ShardedLayout,
    UnixVfs,
};

#[test]
fn full_pipeline_on_disk() {
    let cx = Cx::new();
    let dir = tempfile::tempdir().unwrap();
    let layout = Arc::new(ShardedLayout::new(dir.path(), 4));
    fs::create_dir_all(dir.path().join("0")).unwrap();
    fs::create_dir_all(dir.path().join("txns")).unwrap();

    let engine = ItemIndex::new(
        Arc::new(UnixVfs::new()),
        Arc::clone(&layout) as Arc<dyn FsLayout>,
        IndexConfig {
            l2p_page_size: 4,
            p2l_page_size: 64,
            shard_size: 4,
            block_size: 64,
        },
        Arc::new(MemoryBlobCache::new(1 << 20)),
    )
    .unwrap();

    // Transaction: two items at offsets 0 and 24.
    let mut l2p = engine.open_l2p_proto_index(&cx, "t0").unwrap();
    l2p.add_entry(&cx, 0, 0).unwrap();
    l2p.add_entry(&cx, 24, 1).unwrap();
    l2p.add_revision(&cx).unwrap();
    l2p.sync(&cx).unwrap();
    drop(l2p);

    let mut p2l = engine.open_p2l_proto_index(&cx, "t0").unwrap();
    p2l.add_entry(
        &cx,
        &P2lEntry {
            offset: 0,
            size: 24,
            item_type: item_type::NODEREV,
            revision: 0,
            number: 1,
            fnv1_checksum: 0x1111,
        },
    )
    .unwrap();
    p2l.add_entry(
        &cx,
        &P2lEntry {
            offset: 24,
            size: 16,
            item_type: item_type::CHANGES,
            revision: 0,
            number: 2,
            fnv1_checksum: 0x2222,
        },
    )
    .unwrap();
    p2l.sync(&cx).unwrap();
    drop(p2l);

    // Finalize revision 0.
    engine
        .create_l2p_index(
            &cx,
            &layout.l2p_index_path(0),
            &layout.l2p_proto_path("t0"),
            0,
        )
        .unwrap();
    engine
        .create_p2l_index(
            &cx,
            &layout.p2l_index_path(0),
            &layout.p2l_proto_path("t0"),
            0,
        )
        .unwrap();

    // The transaction's proto indexes are deleted with the transaction.
    fs::remove_file(layout.l2p_proto_path("t0")).unwrap();
    fs::remove_file(layout.p2l_proto_path("t0")).unwrap();

    // Lookups.
    assert_eq!(engine.item_offset(&cx, 0, None, 0).unwrap(), 0);
    assert_eq!(engine.item_offset(&cx, 0, None, 1).unwrap(), 24);
    assert_eq!(engine.l2p_get_max_ids(&cx, 0, 1).unwrap(), vec![2]);

    let entries = engine.p2l_index_lookup(&cx, 0, 0).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].number, 1);
    assert_eq!(entries[1].number, 2);
    assert_eq!(entries[2].item_type, item_type::UNUSED);
    assert_eq!(engine.p2l_get_max_offset(&cx, 0).unwrap(), 64);

    // The index files are read-only and no temp siblings remain.
    let l2p_path = layout.l2p_index_path(0);
    assert!(fs::metadata(&l2p_path).unwrap().permissions().readonly());
    let mut siblings = fs::read_dir(dir.path().join("0")).unwrap();
    assert!(
        siblings.all(|entry| {
            let name = entry.unwrap().file_name();
            !name.to_string_lossy().ends_with(".tmp")
        })
    );
}
