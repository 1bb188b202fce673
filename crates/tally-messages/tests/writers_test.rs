//! Tests for the writer registry and the built-in writers.

use std::sync::Arc;

use chrono::Utc;
use tally_core::InstanceKey;
use tally_messages::{
    CauseElimination, ConsoleWriter, MemoryWriter, MessageAction, MessageStore, MessageUpsert,
    MessageWriter, MetricValue, Metrics, MetricsUpdate, Preset, WriterCall, WriterRegistry,
};

fn upsert(sub: f64) -> MessageUpsert {
    let mut metrics = Metrics::new();
    metrics.insert("cycle-subCounter".to_string(), MetricValue::number(sub, "kWh"));
    MessageUpsert {
        metrics,
        actions: vec![MessageAction::close()],
    }
}

#[tokio::test]
async fn test_registry_prefers_exact_key() {
    let registry = WriterRegistry::new();
    registry
        .register("cycle-done", Arc::new(MemoryWriter::new("exact")))
        .await;
    registry
        .register_fallback(Arc::new(MemoryWriter::new("fallback")))
        .await;

    let exact = registry.resolve(Some("cycle-done")).await.unwrap();
    assert_eq!(exact.name(), "exact");

    let other = registry.resolve(Some("unknown")).await.unwrap();
    assert_eq!(other.name(), "fallback");

    let none = registry.resolve(None).await.unwrap();
    assert_eq!(none.name(), "fallback");

    assert_eq!(registry.list_keys().await, vec!["*".to_string(), "cycle-done".to_string()]);
}

#[tokio::test]
async fn test_registry_without_fallback() {
    let registry = WriterRegistry::new();
    registry
        .register("cycle-done", Arc::new(ConsoleWriter::new("console")))
        .await;

    assert!(registry.resolve(Some("other")).await.is_none());
    assert!(registry.resolve(None).await.is_none());

    assert!(registry.unregister("cycle-done").await);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_memory_writer_tracks_open_messages() {
    let writer = MemoryWriter::default();
    let message_ref = InstanceKey::new("cycle", "washer").message_ref();

    assert!(writer.on_upsert(&message_ref, &upsert(10.0)).await.unwrap());
    assert!(writer.is_open(&message_ref).await);

    let mut set = Metrics::new();
    set.insert("cycle-subCounter".to_string(), MetricValue::number(12.0, "kWh"));
    assert!(writer
        .on_metrics(&message_ref, &MetricsUpdate { set })
        .await
        .unwrap());
    let metrics = writer.open_metrics(&message_ref).await.unwrap();
    assert_eq!(metrics["cycle-subCounter"].as_f64(), Some(12.0));

    let elimination = CauseElimination::new("external-reset", Utc::now());
    assert!(writer
        .complete_after_cause_eliminated(&message_ref, &elimination)
        .await
        .unwrap());
    assert!(!writer.is_open(&message_ref).await);
    assert_eq!(writer.eliminations().await, vec![elimination]);
    assert_eq!(writer.count().await, 3);
}

#[tokio::test]
async fn test_memory_writer_rejections_are_recorded() {
    let writer = MemoryWriter::default();
    let message_ref = InstanceKey::new("cycle", "washer").message_ref();

    writer.reject_next(1);
    assert!(!writer.on_upsert(&message_ref, &upsert(10.0)).await.unwrap());
    assert!(!writer.is_open(&message_ref).await);
    assert!(writer.on_upsert(&message_ref, &upsert(10.0)).await.unwrap());

    writer.set_erroring(true);
    assert!(writer.on_close(&message_ref).await.is_err());
    writer.set_erroring(false);
    assert!(writer.on_close(&message_ref).await.unwrap());

    assert_eq!(writer.upserts().await.len(), 2);
    assert_eq!(writer.close_count().await, 2);
    assert!(matches!(writer.calls().await[0], WriterCall::Upsert(_, _)));
}

#[tokio::test]
async fn test_console_writer_accepts_everything() {
    let writer = ConsoleWriter::new("console").with_preset(Preset::new("cycle-done", "Cycle finished"));
    let message_ref = InstanceKey::new("cycle", "dryer").message_ref();

    assert!(writer.on_upsert(&message_ref, &upsert(1.0)).await.unwrap());
    assert!(writer
        .on_metrics(&message_ref, &MetricsUpdate::default())
        .await
        .unwrap());
    assert!(writer.on_close(&message_ref).await.unwrap());
}
