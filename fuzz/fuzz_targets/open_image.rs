#![no_main]

use colstore::storage::{DbOptions, Group};
use libfuzzer_sys::fuzz_target;

// Arbitrary images are either rejected at open or fully readable.
fuzz_target!(|data: &[u8]| {
    let mut bytes = data.to_vec();
    bytes.resize(bytes.len().div_ceil(8) * 8, 0);
    if let Ok(group) = Group::from_bytes(bytes, DbOptions::default()) {
        let view = group.pin_read();
        for ndx in 0..view.table_count() {
            let table = view.table(ndx).unwrap();
            for col in 0..table.view().column_count() {
                let _ = table.column_values(col).unwrap();
            }
        }
    }
});
