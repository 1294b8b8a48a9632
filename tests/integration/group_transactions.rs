#![allow(missing_docs)]

use colstore::storage::{ColumnKind, DbOptions, Group};
use colstore::types::{LogicError, Result, StoreError};

fn seed_people(group: &mut Group) -> Result<usize> {
    let t = group.add_table()?;
    let mut people = group.table_mut(t)?;
    people.add_column(ColumnKind::Int)?;
    people.add_column(ColumnKind::Bool)?;
    for age in [31, 17, 45] {
        let row = people.add_row()?;
        people.set_int(0, row, age)?;
        people.set_bool(1, row, age >= 18)?;
    }
    Ok(t)
}

#[test]
fn pinned_reader_keeps_committed_version() -> Result<()> {
    let mut group = Group::new();
    let t = seed_people(&mut group)?;
    assert_eq!(group.commit()?, 1);
    let reader = group.pin_read();

    {
        let mut people = group.table_mut(t)?;
        people.set_int(0, 0, 99)?;
        people.erase_row(1)?;
        people.add_row()?;
    }
    assert_eq!(group.commit()?, 2);

    assert_eq!(reader.version(), 1);
    let old = reader.table(t)?;
    assert_eq!(old.column_values(0)?, vec![31, 17, 45]);
    assert!(!old.get_bool(1, 1)?);

    let current = group.pin_read().table(t)?;
    assert_eq!(current.column_values(0)?, vec![99, 45, 0]);
    assert!(current.get_bool(1, 1)?);
    Ok(())
}

#[test]
fn rollback_discards_uncommitted_work() -> Result<()> {
    let mut group = Group::new();
    let t = seed_people(&mut group)?;
    group.commit()?;

    let row = group.table_mut(t)?.row(2)?;
    {
        let mut people = group.table_mut(t)?;
        people.insert_rows(0, 2)?;
        people.add_column(ColumnKind::Int)?;
    }
    assert_eq!(row.index()?, 4);
    group.add_table()?;
    group.rollback()?;

    assert_eq!(group.table_count(), 1);
    assert!(!row.is_attached());
    let people = group.table(t)?;
    assert_eq!(people.column_count(), 2);
    assert_eq!(people.column_values(0)?, vec![31, 17, 45]);
    group.check_accessor_consistency()?;
    Ok(())
}

#[test]
fn caller_errors_do_not_poison_the_write() -> Result<()> {
    let mut group = Group::new();
    let t = seed_people(&mut group)?;
    {
        let mut people = group.table_mut(t)?;
        assert!(matches!(
            people.set_int(1, 0, 5),
            Err(StoreError::Logic(LogicError::ColumnKindMismatch))
        ));
        assert!(matches!(
            people.erase_row(7),
            Err(StoreError::Logic(LogicError::IndexOutOfBounds { index: 7, size: 3 }))
        ));
        assert!(matches!(
            people.add_column(ColumnKind::Link { target: 4 }),
            Err(StoreError::Logic(LogicError::TableOutOfBounds))
        ));
    }
    assert!(!group.is_poisoned());
    group.table_mut(t)?.set_int(0, 0, 32)?;
    group.commit()?;
    Ok(())
}

#[test]
fn exhausted_memory_poisons_until_rollback() -> Result<()> {
    let options = DbOptions::default()
        .initial_slab_size(256)
        .memory_limit(Some(4096));
    let mut group = Group::with_options(options);
    let t = group.add_table()?;
    group.table_mut(t)?.add_column(ColumnKind::Int)?;
    group.commit()?;

    let mut failure = None;
    for i in 0..10_000i64 {
        let mut table = group.table_mut(t)?;
        let outcome = table.add_row().and_then(|row| table.set_int(0, row, i << 40));
        if let Err(err) = outcome {
            failure = Some(err);
            break;
        }
    }
    assert!(matches!(failure, Some(StoreError::OutOfMemory { .. })));
    assert!(group.is_poisoned());
    assert!(matches!(group.table_mut(t).map(|_| ()), Err(StoreError::NeedsRollback)));
    assert!(matches!(group.commit(), Err(StoreError::NeedsRollback)));

    group.rollback()?;
    assert!(!group.is_poisoned());
    assert_eq!(group.table(t)?.size(), 0);
    group.table_mut(t)?.add_row()?;
    group.commit()?;
    assert_eq!(group.pin_read().table(t)?.size(), 1);
    Ok(())
}

#[test]
fn poisoned_group_serves_only_committed_reads() -> Result<()> {
    let options = DbOptions::default()
        .max_node_size(4)
        .initial_slab_size(256)
        .memory_limit(Some(4096));
    let mut group = Group::with_options(options);
    let targets = group.add_table()?;
    let owners = group.add_table()?;
    group.table_mut(targets)?.add_column(ColumnKind::Int)?;
    let list = {
        let mut o = group.table_mut(owners)?;
        o.add_column(ColumnKind::LinkList { target: targets })?;
        o.add_row()?;
        o.link_list(0, 0)?
    };
    {
        let mut t = group.table_mut(targets)?;
        for v in 0..6 {
            let row = t.add_row()?;
            t.set_int(0, row, v)?;
        }
    }
    group.list_add(&list, 5)?;
    group.commit()?;
    let reader = group.pin_read();

    // Inserting at the front splits leaves on the way to exhaustion.
    let mut failure = None;
    for i in 0..10_000i64 {
        let mut table = group.table_mut(targets)?;
        if let Err(err) = table.insert_rows(0, 1).and_then(|_| table.set_int(0, 0, i << 32)) {
            failure = Some(err);
            break;
        }
    }
    assert!(matches!(failure, Some(StoreError::OutOfMemory { .. })));
    assert!(group.is_poisoned());

    assert!(matches!(group.table(targets).map(|_| ()), Err(StoreError::NeedsRollback)));
    assert!(matches!(group.list_values(&list), Err(StoreError::NeedsRollback)));
    assert!(matches!(group.write_to_bytes(), Err(StoreError::NeedsRollback)));
    assert!(matches!(group.write_column_slice(targets, 0, 0, 2), Err(StoreError::NeedsRollback)));

    let committed = group.pin_read();
    assert_eq!(committed.version(), 1);
    assert_eq!(committed.table(targets)?.column_values(0)?, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(reader.table(owners)?.link_list(0, 0)?, vec![5]);

    group.rollback()?;
    assert!(!group.is_poisoned());
    assert_eq!(group.table(targets)?.column_values(0)?, vec![0, 1, 2, 3, 4, 5]);
    let list = group.table_mut(owners)?.link_list(0, 0)?;
    assert_eq!(group.list_values(&list)?, vec![5]);
    assert!(group.verify().is_ok());
    group.table_mut(targets)?.insert_rows(0, 1)?;
    assert_eq!(group.list_values(&list)?, vec![6]);
    group.commit()?;
    Ok(())
}

#[test]
fn links_follow_moved_rows_across_commits() -> Result<()> {
    let mut group = Group::new();
    let targets = group.add_table()?;
    let owners = group.add_table()?;
    {
        let mut t = group.table_mut(targets)?;
        t.add_column(ColumnKind::Int)?;
        for v in 0..5 {
            let row = t.add_row()?;
            t.set_int(0, row, v * 10)?;
        }
    }
    let list = {
        let mut o = group.table_mut(owners)?;
        o.add_column(ColumnKind::Link { target: targets })?;
        o.add_column(ColumnKind::LinkList { target: targets })?;
        o.add_row()?;
        o.set_link(0, 0, Some(4))?;
        o.link_list(1, 0)?
    };
    group.list_add(&list, 1)?;
    group.list_add(&list, 4)?;
    group.list_add(&list, 2)?;
    group.commit()?;
    assert!(list.is_marked());

    // The last row takes the place of row 1; links to row 1 disappear.
    group.table_mut(targets)?.move_last_over(1)?;
    assert_eq!(group.table(targets)?.column_values(0)?, vec![0, 40, 20, 30]);
    assert_eq!(group.table(owners)?.get_link(0, 0)?, Some(1));
    assert_eq!(group.list_values(&list)?, vec![1, 2]);

    group.table_mut(targets)?.insert_rows(0, 2)?;
    assert_eq!(group.table(owners)?.get_link(0, 0)?, Some(3));
    assert_eq!(group.list_values(&list)?, vec![3, 4]);

    assert!(matches!(
        group.list_add(&list, 6),
        Err(StoreError::Logic(LogicError::InvalidLinkTarget))
    ));
    group.check_accessor_consistency()?;
    group.commit()?;

    let reader = group.pin_read();
    let owners_view = reader.table(owners)?;
    assert_eq!(owners_view.get_link(0, 0)?, Some(3));
    assert_eq!(owners_view.link_list(1, 0)?, vec![3, 4]);
    Ok(())
}

#[test]
fn table_handles_follow_inserted_and_removed_tables() -> Result<()> {
    let mut group = Group::new();
    let a = group.add_table()?;
    let b = group.add_table()?;
    group.table_mut(b)?.add_column(ColumnKind::Link { target: a })?;
    let handle = group.table_ref(b)?;

    group.insert_table(0)?;
    assert_eq!(handle.index()?, 2);
    assert_eq!(group.table(2)?.column_kind(0)?, ColumnKind::Link { target: 1 });

    assert!(matches!(
        group.remove_table(1),
        Err(StoreError::Logic(LogicError::TableIsLinkTarget))
    ));
    assert!(!group.is_poisoned());

    group.remove_table(0)?;
    assert_eq!(handle.index()?, 1);
    group.table_mut_by_ref(&handle)?.add_row()?;
    assert_eq!(group.table(1)?.size(), 1);
    assert_eq!(group.table(1)?.get_link(0, 0)?, None);
    Ok(())
}

#[test]
fn unique_index_rejects_duplicates_without_poisoning() -> Result<()> {
    let mut group = Group::new();
    let t = group.add_table()?;
    {
        let mut table = group.table_mut(t)?;
        table.add_column(ColumnKind::Int)?;
        for v in [7, 3, 9] {
            let row = table.add_row()?;
            table.set_int(0, row, v)?;
        }
        table.add_search_index(0, true)?;
        assert!(matches!(table.set_int(0, 1, 9), Err(StoreError::DuplicateValue(9))));
        table.add_row()?;
        assert!(matches!(table.add_row(), Err(StoreError::DuplicateValue(0))));
    }
    assert!(!group.is_poisoned());

    let view = group.table(t)?;
    assert_eq!(view.column_values(0)?, vec![7, 3, 9, 0]);
    assert!(view.has_search_index(0)?);
    assert_eq!(view.find_first(0, 9)?, Some(2));
    assert_eq!(view.count(0, 0)?, 1);

    group.commit()?;
    group.table_mut(t)?.remove_search_index(0)?;
    assert!(matches!(
        group.table_mut(t)?.remove_search_index(0),
        Err(StoreError::Logic(LogicError::NoSearchIndex))
    ));
    group.table_mut(t)?.add_row()?;
    assert_eq!(group.table(t)?.count(0, 0)?, 2);
    assert!(group.verify().is_ok());
    Ok(())
}

#[test]
fn standalone_images_reopen() -> Result<()> {
    let mut group = Group::with_options(DbOptions::default().max_node_size(4));
    let t = group.add_table()?;
    {
        let mut table = group.table_mut(t)?;
        table.add_column(ColumnKind::Int)?;
        table.add_column(ColumnKind::Bool)?;
        for v in 0..20 {
            let row = table.add_row()?;
            table.set_int(0, row, v * v)?;
            table.set_bool(1, row, v % 3 == 0)?;
        }
    }

    let copy = Group::from_bytes(group.write_to_bytes()?, DbOptions::default())?;
    let reader = copy.pin_read();
    let expected: Vec<i64> = (0..20).map(|v| v * v).collect();
    assert_eq!(reader.table(t)?.column_values(0)?, expected);
    assert!(reader.table(t)?.get_bool(1, 9)?);

    let slice = Group::from_bytes(group.write_column_slice(t, 0, 5, 6)?, DbOptions::default())?;
    let view = slice.pin_read();
    let sliced = view.table(0)?;
    assert_eq!(sliced.size(), 6);
    assert_eq!(sliced.column_values(0)?, vec![25, 36, 49, 64, 81, 100]);

    assert!(matches!(
        Group::from_bytes(vec![0u8; 12], DbOptions::default()),
        Err(StoreError::InvalidDatabase(_))
    ));
    Ok(())
}
