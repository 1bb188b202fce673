//! Tests for the counter store over the storage backends.

use std::sync::Arc;

use chrono::Utc;
use tally_core::{EventBus, InstanceKey, TallyEvent};
use tally_storage::{
    BackendCounterStore, CounterPatch, CounterState, CounterStore, MemoryBackend, RedbBackend,
    StorageError,
};

fn memory_store() -> BackendCounterStore {
    BackendCounterStore::new(Arc::new(MemoryBackend::default()))
}

#[tokio::test]
async fn test_missing_record_is_fresh() {
    let store = memory_store();
    let key = InstanceKey::new("cycle", "washer.energy");

    assert_eq!(store.get_state(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_partial_update_keeps_other_fields() {
    let store = memory_store();
    let key = InstanceKey::new("cycle", "washer.energy");
    let created = Utc::now();

    let full = CounterPatch::full(&CounterState {
        last_counter: Some(10.0),
        sub_counter: 5.0,
        last_reset_at: created,
    });
    store.set_state(&key, &full).await.unwrap();
    store
        .set_state(&key, &CounterPatch::default().last_counter(12.0))
        .await
        .unwrap();

    let state = store.get_state(&key).await.unwrap().unwrap();
    assert_eq!(state.last_counter, Some(12.0));
    assert_eq!(state.sub_counter, 5.0);
    assert_eq!(state.last_reset_at, created);
}

#[tokio::test]
async fn test_partial_update_on_missing_record_uses_defaults() {
    let store = memory_store();
    let key = InstanceKey::new("cycle", "pump");

    store
        .set_state(&key, &CounterPatch::default().last_counter(4.0))
        .await
        .unwrap();

    let state = store.get_state(&key).await.unwrap().unwrap();
    assert_eq!(state.last_counter, Some(4.0));
    assert_eq!(state.sub_counter, 0.0);
}

#[tokio::test]
async fn test_non_finite_patch_is_rejected_and_record_stays_readable() {
    let store = memory_store();
    let key = InstanceKey::new("cycle", "washer.energy");
    store
        .set_state(&key, &CounterPatch::default().last_counter(1.0).sub_counter(2.0))
        .await
        .unwrap();

    let err = store
        .set_state(&key, &CounterPatch::default().sub_counter(f64::INFINITY))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Serialization(_)));
    assert!(store
        .set_state(&key, &CounterPatch::default().last_counter(f64::NAN))
        .await
        .is_err());

    let state = store.get_state(&key).await.unwrap().unwrap();
    assert_eq!(state.last_counter, Some(1.0));
    assert_eq!(state.sub_counter, 2.0);
}

#[tokio::test]
async fn test_sub_counter_writes_are_mirrored_as_acknowledged() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe();
    let store = memory_store().with_event_bus(bus);
    let key = InstanceKey::new("cycle", "pump");

    store
        .set_state(&key, &CounterPatch::default().last_counter(1.0))
        .await
        .unwrap();
    store
        .set_state(&key, &CounterPatch::default().sub_counter(3.0))
        .await
        .unwrap();

    // Only the write carrying subCounter is mirrored
    let (event, meta) = rx.recv().await.unwrap();
    match event {
        TallyEvent::StateChanged { id, change } => {
            assert_eq!(id, key.mirror_id());
            assert_eq!(change.numeric(), Some(3.0));
            assert!(change.ack);
            assert_eq!(change.from.as_deref(), Some("tally.rules"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(meta.source, "tally.rules");
    assert!(rx.try_recv().is_none());
}

#[tokio::test]
async fn test_list_states_over_redb() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RedbBackend::open(dir.path().join("counters.redb")).unwrap());
    let store = BackendCounterStore::new(backend);

    let a = InstanceKey::new("cycle", "a.energy");
    let b = InstanceKey::new("cycle", "b.energy");
    store
        .set_state(&b, &CounterPatch::default().sub_counter(2.0))
        .await
        .unwrap();
    store
        .set_state(&a, &CounterPatch::default().sub_counter(1.0))
        .await
        .unwrap();

    let states = store.list_states().unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].0, a);
    assert_eq!(states[1].1.sub_counter, 2.0);

    assert!(store.remove_state(&a).unwrap());
    assert_eq!(store.list_states().unwrap().len(), 1);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counters.redb");
    let key = InstanceKey::new("cycle", "dryer.energy");

    {
        let store = BackendCounterStore::new(Arc::new(RedbBackend::open(&path).unwrap()));
        store
            .set_state(&key, &CounterPatch::default().last_counter(10.0).sub_counter(5.0))
            .await
            .unwrap();
    }

    let store = BackendCounterStore::new(Arc::new(RedbBackend::open(&path).unwrap()));
    let state = store.get_state(&key).await.unwrap().unwrap();
    assert_eq!(state.last_counter, Some(10.0));
    assert_eq!(state.sub_counter, 5.0);
}
