#![no_main]

use colstore::storage::{ColumnKind, DbOptions, Group};
use libfuzzer_sys::arbitrary::{self, Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone)]
enum Operation {
    Insert { at: u16, value: i64 },
    Set { at: u16, value: i64 },
    Erase { at: u16 },
    MoveLastOver { at: u16 },
    Link { row: u16, target: u16 },
    Commit,
    Rollback,
}

impl<'a> Arbitrary<'a> for Operation {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let op_type: u8 = u.int_in_range(0..=9)?;

        Ok(match op_type {
            0..=2 => Operation::Insert {
                at: u.arbitrary()?,
                value: u.arbitrary()?,
            },
            3 => Operation::Set {
                at: u.arbitrary()?,
                value: u.arbitrary()?,
            },
            4 | 5 => Operation::Erase { at: u.arbitrary()? },
            6 => Operation::MoveLastOver { at: u.arbitrary()? },
            7 => Operation::Link {
                row: u.arbitrary()?,
                target: u.arbitrary()?,
            },
            8 => Operation::Commit,
            _ => Operation::Rollback,
        })
    }
}

fuzz_target!(|ops: Vec<Operation>| {
    let mut group = Group::with_options(DbOptions::default().max_node_size(4));
    let values = group.add_table().unwrap();
    let links = group.add_table().unwrap();
    group.table_mut(values).unwrap().add_column(ColumnKind::Int).unwrap();
    {
        let mut t = group.table_mut(links).unwrap();
        t.add_column(ColumnKind::Link { target: values }).unwrap();
        t.insert_rows(0, 4).unwrap();
    }
    group.commit().unwrap();
    let mut model: Vec<i64> = Vec::new();
    let mut committed = model.clone();

    for op in ops.into_iter().take(512) {
        let len = model.len();
        match op {
            Operation::Insert { at, value } => {
                let at = at as usize % (len + 1);
                let mut t = group.table_mut(values).unwrap();
                t.insert_rows(at, 1).unwrap();
                t.set_int(0, at, value).unwrap();
                model.insert(at, value);
            }
            Operation::Set { at, value } if len > 0 => {
                let at = at as usize % len;
                group.table_mut(values).unwrap().set_int(0, at, value).unwrap();
                model[at] = value;
            }
            Operation::Erase { at } if len > 0 => {
                let at = at as usize % len;
                group.table_mut(values).unwrap().erase_row(at).unwrap();
                model.remove(at);
            }
            Operation::MoveLastOver { at } if len > 0 => {
                let at = at as usize % len;
                group.table_mut(values).unwrap().move_last_over(at).unwrap();
                model.swap_remove(at);
            }
            Operation::Link { row, target } if len > 0 => {
                let target = target as usize % len;
                let mut t = group.table_mut(links).unwrap();
                t.set_link(0, row as usize % 4, Some(target)).unwrap();
            }
            Operation::Commit => {
                group.commit().unwrap();
                committed = model.clone();
            }
            Operation::Rollback => {
                group.rollback().unwrap();
                model = committed.clone();
            }
            _ => {}
        }
        assert_eq!(group.table(values).unwrap().column_values(0).unwrap(), model);
        let links_view = group.table(links).unwrap();
        for row in 0..4 {
            if let Some(target) = links_view.get_link(0, row).unwrap() {
                assert!(target < model.len());
            }
        }
    }
    group.check_accessor_consistency().unwrap();
    assert!(group.verify().is_ok());
});
