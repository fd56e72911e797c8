//! Property-Based Tests for Execution Context Commits
//!
//! **Property 1: Single write.** Any batch of mutations inside one
//! transaction reaches the table as at most one write, and exactly zero
//! when the batch nets out to the stored state.
//!
//! **Property 2: Serialized increments.** Increments spawned across a
//! multi-threaded runtime from several gateways sharing substrates, with
//! every table call yielding, are never lost.

use proptest::prelude::*;
use rowkeep_core::{Payload, Record, RecordId};
use rowkeep_storage::RecordGateway;
use rowkeep_test_utils::assertions::payload_int;
use rowkeep_test_utils::fixtures::*;
use rowkeep_test_utils::generators::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn multi_thread_runtime() -> Result<Runtime, TestCaseError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn edits_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::vec(("[a-d]", arb_attribute_value()), 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_transaction_writes_at_most_once(
        payload in arb_payload(),
        edits in edits_strategy(),
    ) {
        let rt = test_runtime()?;
        let env = TestEnv::new();
        let seeded = record("u1", "a@x.com", payload.clone());
        env.seed(std::slice::from_ref(&seeded));
        let gateway = env.gateway();

        let mut expected: Payload = payload;
        for (key, value) in &edits {
            expected.set(key.clone(), value.clone());
        }
        let changed = expected != seeded.payload;

        rt.block_on(async {
            gateway
                .with_record_transaction(&RecordId::from("u1"), |ctx| {
                    for (key, value) in &edits {
                        ctx.set_payload_field(key.clone(), value.clone())?;
                    }
                    Ok(())
                })
                .await
        })
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

        prop_assert_eq!(env.table.write_calls(), usize::from(changed));
        let stored: Record = env
            .stored("u1")
            .ok_or_else(|| TestCaseError::fail("record vanished"))?;
        prop_assert_eq!(stored.payload, expected);
        if changed {
            prop_assert!(stored.last_modified > seeded.last_modified);
        } else {
            prop_assert_eq!(stored.last_modified, seeded.last_modified);
        }
    }

    #[test]
    fn prop_concurrent_increments_are_not_lost(
        gateways in 1usize..4,
        increments in 1usize..10,
    ) {
        let rt = multi_thread_runtime()?;
        let env = TestEnv::interleaved();
        env.seed_counter("u1", "a@x.com", 0);
        let pool: Vec<Arc<RecordGateway>> =
            (0..gateways).map(|_| Arc::new(env.gateway())).collect();

        rt.block_on(async {
            let handles: Vec<_> = (0..increments)
                .map(|i| {
                    let gateway = pool[i % gateways].clone();
                    tokio::spawn(async move {
                        gateway
                            .with_record_transaction(&RecordId::from("u1"), |ctx| {
                                let n = ctx
                                    .record()
                                    .payload
                                    .get("n")
                                    .and_then(Value::as_i64)
                                    .unwrap_or(0);
                                ctx.set_payload_field("n", json!(n + 1))?;
                                Ok(())
                            })
                            .await
                    })
                })
                .collect();
            let mut results = Vec::new();
            for handle in handles {
                results.push(match handle.await {
                    Ok(result) => result.map_err(|e| TestCaseError::fail(e.to_string())),
                    Err(e) => Err(TestCaseError::fail(e.to_string())),
                });
            }
            results.into_iter().collect::<Result<Vec<()>, TestCaseError>>()
        })?;

        let stored = env
            .stored("u1")
            .ok_or_else(|| TestCaseError::fail("record vanished"))?;
        prop_assert_eq!(payload_int(&stored, "n"), increments as i64);
        prop_assert_eq!(env.table.write_calls(), increments);
    }
}
