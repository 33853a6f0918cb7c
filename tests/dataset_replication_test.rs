//! End-to-end producer/consumer replication over the in-memory channel.

use std::sync::Arc;
use std::time::Duration;

use qulab::data::{DataArray, DataSet, DataValue, MemoryIoFactory, SyncWait};
use qulab::serialization::ValueMap;
use qulab::LabError;

fn channelled_pair() -> (DataSet, DataSet) {
    let (writer, reader) = MemoryIoFactory::create();
    let mut producer = DataSet::new("producer");
    producer.attach_writer(Box::new(writer)).expect("attach");
    let mut consumer = DataSet::new("consumer");
    consumer.bind_reader(Box::new(reader)).expect("bind");
    (producer, consumer)
}

#[test]
fn consumer_mirrors_a_full_sweep() {
    let (mut producer, mut consumer) = channelled_pair();

    // A 2-dimensional sweep: outer axis x, inner axis y, measured z.
    let x = DataArray::builder("x")
        .label("gate voltage")
        .unit("mV")
        .setpoint(true)
        .shape(&[10])
        .build_shared()
        .expect("x");
    producer.add_array(x.clone()).expect("add x");
    let y = DataArray::builder("y")
        .label("bias")
        .unit("uV")
        .setpoint(true)
        .shape(&[10, 5])
        .set_arrays(vec![x.clone()])
        .build_shared()
        .expect("y");
    producer.add_array(y.clone()).expect("add y");
    let z = DataArray::builder("z")
        .label("current")
        .unit("nA")
        .shape(&[10, 5])
        .set_arrays(vec![y, x])
        .build_shared()
        .expect("z");
    producer.add_array(z.clone()).expect("add z");

    for row in 0..10 {
        producer
            .add_scalar(&[row], "x", row as f64)
            .expect("x value");
        for col in 0..5 {
            producer
                .add_data(
                    &[row, col],
                    &[
                        ("y".to_string(), DataValue::Scalar(col as f64 * 0.5)),
                        ("z".to_string(), DataValue::Scalar((row * col) as f64)),
                    ],
                )
                .expect("sweep point");
        }
    }

    consumer.sync_from_storage(SyncWait::Block).expect("sync");

    let mirrored_z = consumer.array("z").expect("z");
    assert!(!Arc::ptr_eq(&z, &mirrored_z));
    {
        let guard = mirrored_z.read();
        assert_eq!(guard.shape(), &[10, 5]);
        assert_eq!(guard.get(&[9, 4]).expect("get"), 36.0);
        assert_eq!(guard.set_arrays().len(), 2);
        assert_eq!(guard.set_arrays()[0].read().name(), "y");
        assert_eq!(guard.set_arrays()[1].read().name(), "x");
    }

    // The consumer's z references the consumer's own x, which carries the
    // replicated setpoint values.
    let mirrored_x = consumer.array("x").expect("x");
    assert_eq!(mirrored_x.read().get(&[9]).expect("get"), 9.0);
    assert!(Arc::ptr_eq(
        &mirrored_x,
        &mirrored_z.read().set_arrays()[1]
    ));
}

#[test]
fn replication_preserves_emission_order_across_syncs() {
    let (mut producer, mut consumer) = channelled_pair();

    producer.set_name("bob").expect("rename");
    consumer.sync_from_storage(SyncWait::Block).expect("sync 1");
    assert_eq!(consumer.name(), "bob");

    let b = DataArray::builder("b")
        .shape(&[3])
        .build_shared()
        .expect("b");
    producer.add_array(b).expect("add b");
    consumer.sync_from_storage(SyncWait::Block).expect("sync 2");
    assert!(consumer.array("b").is_some());

    producer.add_scalar(&[2], "b", 5.5).expect("write");
    consumer.sync_from_storage(SyncWait::Block).expect("sync 3");
    assert_eq!(
        consumer.array("b").expect("b").read().get(&[2]).expect("get"),
        5.5
    );
}

#[test]
fn metadata_fields_replicate() {
    let (mut producer, mut consumer) = channelled_pair();
    let mut user_data = ValueMap::new();
    user_data.insert("operator", "alice");
    user_data.insert(7i64, "lucky channel");

    producer.set_user_data(user_data.clone()).expect("user data");
    producer
        .add_array(
            DataArray::builder("only")
                .shape(&[1])
                .build_shared()
                .expect("only"),
        )
        .expect("add");
    producer
        .set_default_array_name("only")
        .expect("default name");

    consumer.sync_from_storage(SyncWait::Block).expect("sync");
    assert_eq!(consumer.user_data(), &user_data);
    assert_eq!(consumer.default_array_name(), Some("only"));
}

#[test]
fn sync_timeout_discipline_on_the_channel() {
    let (mut producer, mut consumer) = channelled_pair();

    // Non-blocking drain of an empty channel returns cleanly.
    consumer.sync_from_storage(SyncWait::NoWait).expect("no wait");

    // A bounded wait on an empty channel times out.
    let result = consumer.sync_from_storage(SyncWait::Timeout(Duration::from_millis(25)));
    assert!(matches!(result, Err(LabError::SyncTimeout(_))));

    // After events arrive the same bounded wait drains them.
    producer
        .add_array(
            DataArray::builder("a")
                .shape(&[2])
                .build_shared()
                .expect("a"),
        )
        .expect("add");
    consumer
        .sync_from_storage(SyncWait::Timeout(Duration::from_millis(250)))
        .expect("drain");
    assert!(consumer.array("a").is_some());
}

#[test]
fn finalize_stops_the_producer_side() {
    let (mut producer, _consumer) = channelled_pair();
    producer
        .add_array(
            DataArray::builder("a")
                .shape(&[2])
                .build_shared()
                .expect("a"),
        )
        .expect("add");

    producer.finalize().expect("finalize");
    producer.finalize().expect("finalize is idempotent");

    assert!(matches!(
        producer.add_scalar(&[0], "a", 1.0),
        Err(LabError::WriteAfterFinalize)
    ));
    assert!(matches!(
        producer.set_name("late"),
        Err(LabError::WriteAfterFinalize)
    ));
}

#[test]
fn blocking_sync_waits_for_a_concurrent_producer() {
    let (writer, reader) = MemoryIoFactory::create();
    let mut consumer = DataSet::new("consumer");
    consumer.bind_reader(Box::new(reader)).expect("bind");

    let producer_thread = std::thread::spawn(move || {
        let mut producer = DataSet::new("producer");
        producer.attach_writer(Box::new(writer)).expect("attach");
        std::thread::sleep(Duration::from_millis(50));
        producer
            .add_array(
                DataArray::builder("late")
                    .shape(&[1])
                    .build_shared()
                    .expect("late"),
            )
            .expect("add");
    });

    // The blocking drain must wait for the first event instead of returning
    // on the initially empty queue.
    consumer.sync_from_storage(SyncWait::Block).expect("sync");
    assert!(consumer.array("late").is_some());
    producer_thread.join().expect("producer thread");
}
