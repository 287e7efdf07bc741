//! Property-based test generators using proptest.
//!
//! Strategies produce values the sample registry accepts.

use crate::types::{Dial, Widget};
use entanglement_protocol::DestHash;
use proptest::prelude::*;

/// Strategy for generating node names usable as listener names.
pub fn node_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for generating destination identities.
pub fn dest_hash_strategy() -> impl Strategy<Value = DestHash> {
    prop::array::uniform32(any::<u8>()).prop_map(DestHash::from_bytes)
}

/// Strategy for generating widgets.
pub fn widget_strategy() -> impl Strategy<Value = Widget> {
    (any::<u32>(), "[a-zA-Z ]{0,24}", any::<u32>()).prop_map(|(id, name, size)| Widget { id, name, size })
}

/// Strategy for generating widgets with distinct ids.
pub fn widget_set_strategy(max: usize) -> impl Strategy<Value = Vec<Widget>> {
    prop::collection::btree_map(any::<u32>(), ("[a-z]{1,8}", any::<u32>()), 0..max).prop_map(|widgets| {
        widgets
            .into_iter()
            .map(|(id, (name, size))| Widget { id, name, size })
            .collect()
    })
}

/// Strategy for a run of dial positions, as a user would drag through them.
pub fn dial_path_strategy(id: u32) -> impl Strategy<Value = Vec<Dial>> {
    prop::collection::vec(-100i32..=100, 1..8)
        .prop_map(move |positions| positions.into_iter().map(|position| Dial::at(id, position)).collect())
}
