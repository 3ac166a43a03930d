//! Copy-on-write isolation across stores: a reader attached at version V
//! keeps reading V's bytes while a writer commits V+1 into space no live
//! snapshot can reach.

use lamina::{Mode, Store};

#[test]
fn readers_keep_their_snapshot_across_a_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.lam");

    let mut writer = Store::open(&path, Mode::ReadWrite).unwrap();
    let slot = writer.add_column().unwrap();
    let mut col = writer.column(slot).unwrap();
    for v in 0..100 {
        col.append(writer.alloc_mut(), v).unwrap();
    }
    writer.commit(&[&col]).unwrap();

    // Attach a reader at the committed version.
    let reader = Store::open(&path, Mode::ReadOnly).unwrap();
    let pinned = reader.version();
    let reader_col = reader.column(slot).unwrap();
    assert_eq!(reader_col.size(), 100);

    // The writer learns about the outstanding snapshot, mutates, and
    // commits the next version.
    writer.set_oldest_live_version(Some(pinned));
    let mut col = writer.column(slot).unwrap();
    col.append(writer.alloc_mut(), 42).unwrap();
    for i in 0..50 {
        col.set(writer.alloc_mut(), i, 7_000 + i as i64).unwrap();
    }
    writer.commit(&[&col]).unwrap();

    // The reader still sees version V exactly: old size, old values.
    assert_eq!(reader_col.size(), 100);
    for i in 0..100 {
        assert_eq!(reader_col.get(reader.alloc(), i).unwrap(), i as i64);
    }

    // A fresh attach sees the new version.
    let fresh = Store::open(&path, Mode::ReadOnly).unwrap();
    let fresh_col = fresh.column(slot).unwrap();
    assert_eq!(fresh_col.size(), 101);
    assert_eq!(fresh_col.get(fresh.alloc(), 0).unwrap(), 7_000);
    assert_eq!(fresh_col.get(fresh.alloc(), 100).unwrap(), 42);

    // Release the snapshot; the next commits may merge and reuse the
    // refs freed while it was pinned.
    drop(reader_col);
    drop(reader);
    writer.set_oldest_live_version(None);
    for round in 0..5 {
        let mut col = writer.column(slot).unwrap();
        col.set(writer.alloc_mut(), 0, round).unwrap();
        writer.commit(&[&col]).unwrap();
    }
    let col = writer.column(slot).unwrap();
    assert_eq!(col.get(writer.alloc(), 0).unwrap(), 4);
}

#[test]
fn cancelled_transactions_leave_no_trace_in_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cancelled.lam");

    let mut writer = Store::open(&path, Mode::ReadWrite).unwrap();
    let slot = writer.add_column().unwrap();
    let mut col = writer.column(slot).unwrap();
    for v in 0..10 {
        col.append(writer.alloc_mut(), v).unwrap();
    }
    writer.commit(&[&col]).unwrap();
    let raw_before = std::fs::read(&path).unwrap();

    // Mutations without a commit never touch the file: the slab holds
    // them and rollback drops it.
    let mut col = writer.column(slot).unwrap();
    for v in 0..100 {
        col.append(writer.alloc_mut(), v * 11).unwrap();
    }
    writer.rollback().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), raw_before);

    let col = writer.column(slot).unwrap();
    assert_eq!(col.size(), 10);
}
