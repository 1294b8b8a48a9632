#![allow(missing_docs)]

use colstore::storage::{ColumnKind, DbOptions, Group, LinkList, Row};
use colstore::types::Result;
use proptest::prelude::*;
use rand::prelude::*;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

const SEED: u64 = 0x0c01_5703_e5ee_d001;
const STEPS: usize = 800;
const TARGETS: usize = 0;
const OWNERS: usize = 1;

/// Expected state, tracked by row identity rather than row index.
#[derive(Clone, Debug, Default)]
struct Shadow {
    ids: Vec<i64>,
    link: Option<i64>,
    list: Vec<i64>,
}

impl Shadow {
    fn forget(&mut self, id: i64) {
        if self.link == Some(id) {
            self.link = None;
        }
        self.list.retain(|v| *v != id);
    }
}

fn setup() -> Result<(Group, LinkList)> {
    let mut group = Group::with_options(DbOptions::default().max_node_size(4));
    group.add_table()?;
    group.add_table()?;
    group.table_mut(TARGETS)?.add_column(ColumnKind::Int)?;
    let list = {
        let mut owners = group.table_mut(OWNERS)?;
        owners.add_column(ColumnKind::Link { target: TARGETS })?;
        owners.add_column(ColumnKind::LinkList { target: TARGETS })?;
        owners.add_row()?;
        owners.link_list(1, 0)?
    };
    group.commit()?;
    Ok((group, list))
}

fn check(group: &mut Group, list: &LinkList, shadow: &Shadow, handles: &[(Row, Option<i64>)]) -> Result<()> {
    let ids = group.table(TARGETS)?.column_values(0)?;
    assert_eq!(ids, shadow.ids);
    let link = group.table(OWNERS)?.get_link(0, 0)?.map(|row| ids[row]);
    assert_eq!(link, shadow.link);
    let listed: Vec<i64> = group.list_values(list)?.into_iter().map(|row| ids[row]).collect();
    assert_eq!(listed, shadow.list);
    for (handle, expected) in handles {
        match expected {
            Some(id) => {
                let row = handle.index()?;
                assert_eq!(ids[row], *id, "row handle drifted");
            }
            None => assert!(!handle.is_attached(), "handle to a removed row is still attached"),
        }
    }
    Ok(())
}

#[test]
fn randomized_row_mutations_keep_handles_consistent() -> Result<()> {
    let (mut group, mut list) = setup()?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut shadow = Shadow::default();
    let mut committed = shadow.clone();
    let mut handles: Vec<(Row, Option<i64>)> = Vec::new();
    let mut next_id = 1i64;

    for step in 0..STEPS {
        let len = shadow.ids.len();
        match rng.gen_range(0..100) {
            0..=29 => {
                let at = rng.gen_range(0..=len);
                let n = rng.gen_range(1..=3);
                let mut targets = group.table_mut(TARGETS)?;
                targets.insert_rows(at, n)?;
                for i in 0..n {
                    targets.set_int(0, at + i, next_id)?;
                    shadow.ids.insert(at + i, next_id);
                    next_id += 1;
                }
            }
            30..=41 if len > 0 => {
                let row = rng.gen_range(0..len);
                group.table_mut(TARGETS)?.erase_row(row)?;
                let id = shadow.ids.remove(row);
                shadow.forget(id);
                forget_handles(&mut handles, id);
            }
            42..=53 if len > 0 => {
                let row = rng.gen_range(0..len);
                group.table_mut(TARGETS)?.move_last_over(row)?;
                let id = shadow.ids.swap_remove(row);
                shadow.forget(id);
                forget_handles(&mut handles, id);
            }
            54..=61 if len > 0 => {
                let row = rng.gen_range(0..len);
                group.table_mut(OWNERS)?.set_link(0, 0, Some(row))?;
                shadow.link = Some(shadow.ids[row]);
            }
            62..=71 if len > 0 => {
                let row = rng.gen_range(0..len);
                group.list_add(&list, row)?;
                shadow.list.push(shadow.ids[row]);
            }
            72..=77 if !shadow.list.is_empty() => {
                let pos = rng.gen_range(0..shadow.list.len());
                group.list_remove(&list, pos)?;
                shadow.list.remove(pos);
            }
            78..=85 if len > 0 => {
                let row = rng.gen_range(0..len);
                let handle = group.table_mut(TARGETS)?.row(row)?;
                handles.push((handle, Some(shadow.ids[row])));
            }
            86..=93 => {
                group.commit()?;
                committed = shadow.clone();
            }
            94..=97 => {
                group.rollback()?;
                shadow = committed.clone();
                for (_, expected) in &mut handles {
                    *expected = None;
                }
                assert!(!list.is_attached());
                list = group.table_mut(OWNERS)?.link_list(1, 0)?;
            }
            98 => {
                group.table_mut(TARGETS)?.clear()?;
                shadow.ids.clear();
                shadow.link = None;
                shadow.list.clear();
                for (_, expected) in &mut handles {
                    *expected = None;
                }
            }
            _ => {}
        }
        check(&mut group, &list, &shadow, &handles)?;
        if step % 25 == 0 {
            group.check_accessor_consistency()?;
            let summary = group.verify();
            assert!(summary.is_ok(), "step {step}: {:?}", summary.findings);
        }
        handles.retain(|(h, expected)| expected.is_some() || h.is_attached());
    }
    group.check_accessor_consistency()?;
    Ok(())
}

fn forget_handles(handles: &mut [(Row, Option<i64>)], id: i64) {
    for (_, expected) in handles.iter_mut() {
        if *expected == Some(id) {
            *expected = None;
        }
    }
}

#[test]
fn detach_is_idempotent() -> Result<()> {
    let (mut group, list) = setup()?;
    let row = {
        let mut targets = group.table_mut(TARGETS)?;
        targets.add_row()?;
        targets.row(0)?
    };
    row.detach();
    row.detach();
    assert!(!row.is_attached());
    list.detach();
    list.detach();
    assert!(!list.is_attached());
    assert!(group.list_values(&list).is_err());
    let table = group.table_ref(OWNERS)?;
    table.detach();
    table.detach();
    assert!(table.index().is_err());
    assert!(group.table_mut_by_ref(&table).is_err());
    Ok(())
}

#[derive(Clone, Debug)]
enum ColumnOp {
    Insert { at: usize, value: i64 },
    Set { at: usize, value: i64 },
    Erase { at: usize },
    MoveLastOver { at: usize },
    Commit,
}

fn arb_column_op() -> impl Strategy<Value = ColumnOp> {
    prop_oneof![
        4 => (any::<usize>(), any::<i64>()).prop_map(|(at, value)| ColumnOp::Insert { at, value }),
        2 => (any::<usize>(), -300i64..300).prop_map(|(at, value)| ColumnOp::Set { at, value }),
        2 => any::<usize>().prop_map(|at| ColumnOp::Erase { at }),
        1 => any::<usize>().prop_map(|at| ColumnOp::MoveLastOver { at }),
        1 => Just(ColumnOp::Commit),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_column_matches_vec_model(ops in prop::collection::vec(arb_column_op(), 1..120)) {
        let mut group = Group::with_options(DbOptions::default().max_node_size(4));
        let t = group.add_table().unwrap();
        group.table_mut(t).unwrap().add_column(ColumnKind::Int).unwrap();
        let mut model: Vec<i64> = Vec::new();
        let mut pinned = Vec::new();

        for op in ops {
            match op {
                ColumnOp::Insert { at, value } => {
                    let at = at % (model.len() + 1);
                    let mut table = group.table_mut(t).unwrap();
                    table.insert_rows(at, 1).unwrap();
                    table.set_int(0, at, value).unwrap();
                    model.insert(at, value);
                }
                ColumnOp::Set { at, value } if !model.is_empty() => {
                    let at = at % model.len();
                    group.table_mut(t).unwrap().set_int(0, at, value).unwrap();
                    model[at] = value;
                }
                ColumnOp::Erase { at } if !model.is_empty() => {
                    let at = at % model.len();
                    group.table_mut(t).unwrap().erase_row(at).unwrap();
                    model.remove(at);
                }
                ColumnOp::MoveLastOver { at } if !model.is_empty() => {
                    let at = at % model.len();
                    group.table_mut(t).unwrap().move_last_over(at).unwrap();
                    model.swap_remove(at);
                }
                ColumnOp::Commit => {
                    group.commit().unwrap();
                    pinned.push((group.pin_read(), model.clone()));
                }
                _ => {}
            }
            prop_assert_eq!(group.table(t).unwrap().column_values(0).unwrap(), model.clone());
        }

        prop_assert!(group.verify().is_ok());
        for (view, expected) in pinned {
            prop_assert_eq!(view.table(t).unwrap().column_values(0).unwrap(), expected);
        }
    }
}
