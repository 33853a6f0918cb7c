//! Shared helpers for the integration suites.
#![allow(dead_code)]

use qulab::serialization::{Key, NdArray, Value, ValueMap};
use qulab::storage::{datetag_part, Storage, Tag};
use qulab::LabError;

use chrono::{TimeZone, Utc};
use ndarray::arr1;

pub fn tag(path: &str) -> Tag {
    Tag::parse(path).expect("tag")
}

/// A value exercising every corner of the serialisable space.
pub fn mixed_value() -> Value {
    let mut nested = ValueMap::new();
    nested.insert("depth", 2i64);
    let mut map = ValueMap::new();
    map.insert(1i64, "int");
    map.insert("a.b", "dot");
    map.insert("arr", NdArray::Int64(arr1(&[1i64, 2, 3]).into_dyn()));
    map.insert("flag", true);
    map.insert("nested", nested);
    map.insert(
        "seq",
        vec![Value::Int(1), Value::Str("two".into()), Value::Null],
    );
    Value::Map(map)
}

/// Behavioural battery every storage backend must pass.
pub fn exercise_storage_contract(storage: &dyn Storage) {
    // Round trip with integer keys, dotted keys and a numeric array.
    let value = mixed_value();
    storage.save(&value, &tag("root/child")).expect("save");
    assert_eq!(storage.load(&tag("root/child")).expect("load"), value);
    assert!(storage.tag_in_storage(&tag("root/child")).expect("leaf"));
    assert!(storage.tag_in_storage(&tag("root")).expect("node"));
    assert!(storage
        .list_subtags(&tag("root"), 0)
        .expect("list")
        .contains(&"child".to_string()));

    // Leaves replace silently.
    storage.save(&Value::Int(1), &tag("root/other")).expect("save");
    storage.save(&Value::Int(2), &tag("root/other")).expect("replace");
    assert_eq!(
        storage.load(&tag("root/other")).expect("load"),
        Value::Int(2)
    );

    // Node/leaf disjointness.
    assert!(matches!(
        storage.save(&Value::Int(1), &tag("root")),
        Err(LabError::NodeAlreadyExists(_))
    ));
    assert!(matches!(
        storage.save(&Value::Int(1), &tag("root/other/below")),
        Err(LabError::NodeAlreadyExists(_))
    ));
    assert!(matches!(
        storage.load(&tag("root")),
        Err(LabError::NoDataAtKey(_))
    ));
    assert!(matches!(
        storage.load(&tag("absent")),
        Err(LabError::NoDataAtKey(_))
    ));

    // Listing boundaries: leaf tags and unknown tags are empty, not errors.
    assert!(storage
        .list_subtags(&tag("root/child"), 0)
        .expect("leaf listing")
        .is_empty());
    assert!(storage
        .list_subtags(&tag("absent"), 0)
        .expect("unknown listing")
        .is_empty());

    // Descending order and limit.
    for name in ["alpha", "gamma", "beta"] {
        storage
            .save(&Value::Str(name.into()), &tag(&format!("sorted/{}", name)))
            .expect("save");
    }
    assert_eq!(
        storage.list_subtags(&tag("sorted"), 0).expect("list"),
        vec!["gamma", "beta", "alpha"]
    );
    assert_eq!(
        storage.list_subtags(&tag("sorted"), 1).expect("list"),
        vec!["gamma"]
    );

    // Latest subtag follows timestamp order.
    let base = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).single().expect("dt");
    let mut last_part = String::new();
    for i in 0..4 {
        last_part = datetag_part(Some(base + chrono::Duration::milliseconds(1250 * i)));
        storage
            .save(
                &Value::Int(i),
                &tag("times").child(&last_part).expect("child"),
            )
            .expect("save");
    }
    let latest = storage
        .latest_subtag(&tag("times"))
        .expect("latest")
        .expect("some");
    assert_eq!(
        latest.components().last().map(String::as_str),
        Some(last_part.as_str())
    );
    assert!(storage
        .latest_subtag(&tag("absent"))
        .expect("latest of absent")
        .is_none());

    // Field-level access on a mapping leaf.
    let field = Key::Str("power".into());
    let mut config = ValueMap::new();
    config.insert("power", 1.5f64);
    storage
        .save(&Value::Map(config), &tag("config"))
        .expect("save");
    assert_eq!(
        storage.load_field(&tag("config"), &field).expect("field"),
        Value::Float(1.5)
    );
    storage
        .update_field(&Value::Float(2.5), &tag("config"), &field)
        .expect("update");
    storage
        .update_field(&Value::Int(7), &tag("config"), &Key::Str("gain".into()))
        .expect("upsert");
    assert_eq!(
        storage.load_field(&tag("config"), &field).expect("field"),
        Value::Float(2.5)
    );
    assert_eq!(
        storage
            .load_field(&tag("config"), &Key::Str("gain".into()))
            .expect("field"),
        Value::Int(7)
    );
    assert!(matches!(
        storage.update_field(&Value::Int(1), &tag("absent"), &field),
        Err(LabError::NoDataAtKey(_))
    ));
    assert!(matches!(
        storage.update_field(&Value::Int(1), &tag("root"), &field),
        Err(LabError::NodeAlreadyExists(_))
    ));

    // Search stays reserved.
    assert!(matches!(
        storage.search("anything"),
        Err(LabError::UnsupportedOperation("search"))
    ));
}
