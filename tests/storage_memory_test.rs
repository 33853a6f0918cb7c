//! Storage contract run against the in-memory backend.

mod common;

use qulab::storage::MemoryStorage;
use qulab::{Storage, Value};

#[test]
fn memory_backend_passes_the_storage_contract() {
    let storage = MemoryStorage::new();
    common::exercise_storage_contract(&storage);
}

#[test]
fn independent_tags_do_not_interfere() {
    let storage = MemoryStorage::new();
    storage
        .save(&Value::Int(1), &common::tag("left/a"))
        .expect("save left");
    storage
        .save(&Value::Int(2), &common::tag("right/a"))
        .expect("save right");

    assert_eq!(
        storage.load(&common::tag("left/a")).expect("left"),
        Value::Int(1)
    );
    assert_eq!(
        storage.load(&common::tag("right/a")).expect("right"),
        Value::Int(2)
    );
    assert_eq!(
        storage.list_subtags(&qulab::Tag::root(), 0).expect("roots"),
        vec!["right", "left"]
    );
}
