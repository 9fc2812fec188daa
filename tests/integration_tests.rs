//! Value Log Integration Tests
//!
//! End-to-end behaviour of the memcache value log over in-memory transports:
//! - Feature 1: Write placement and pointers
//! - Feature 2: Hinted reads and corruption detection
//! - Feature 3: Sync barrier, retries and dead letters
//! - Feature 4: Lifecycle
//! - Feature 5: Garbage collection and replay

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use cachelog::valuelog::{
    CompressionConfig, Entry, GcState, SyncMode, ValueLogConfig, ValuePointer, WriteRequest,
    BIT_COMPRESSED,
};
use cachelog::{Error, ValueLog};
use common::{in_memory_backend, in_memory_backend_with_index, TrackedIndex};
use tokio_util::sync::CancellationToken;

fn config(connections: usize, threshold: usize) -> ValueLogConfig {
    ValueLogConfig {
        connections,
        value_threshold: threshold,
        compression: CompressionConfig::disabled(),
        retry_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

fn request(entries: Vec<Entry>) -> Vec<WriteRequest> {
    vec![WriteRequest::new(entries)]
}

// =============================================================================
// Feature 1: Write Placement and Pointers
// =============================================================================

mod placement_tests {
    use super::*;

    #[tokio::test]
    async fn test_small_inline_large_external() {
        let backend = in_memory_backend(config(2, 100));
        let vlog = &backend.vlog;

        let mut reqs = request(vec![
            Entry::new("small", vec![b'a'; 10]),
            Entry::new("large", vec![b'b'; 500]),
        ]);
        vlog.write(&mut reqs).await.unwrap();
        vlog.sync().await.unwrap();

        let ptrs = &reqs[0].ptrs;
        assert_eq!(ptrs.len(), 2);
        assert_eq!(ptrs[0], ValuePointer::INLINE);
        assert!(ptrs[1].len > 500);
        assert_ne!(ptrs[1].id, 0);

        for hint in 0..2 {
            let mut scratch = Vec::new();
            let entry = vlog.read(ptrs[1], &mut scratch, hint).await.unwrap();
            assert_eq!(entry.key, b"large");
            assert_eq!(entry.value, &[b'b'; 500][..]);
        }
        vlog.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_threshold_boundaries_under_concurrency() {
        let threshold = 64;
        let backend = in_memory_backend(config(4, threshold));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let vlog = backend.vlog.clone();
                tokio::spawn(async move {
                    let mut reqs = request(vec![
                        Entry::new("below", vec![1u8; threshold - 1]),
                        Entry::new("at", vec![2u8; threshold]),
                        Entry::new("above", vec![3u8; threshold + 1]),
                    ]);
                    vlog.write(&mut reqs).await.unwrap();
                    reqs.remove(0).ptrs
                })
            })
            .collect();

        for task in tasks {
            let ptrs = task.await.unwrap();
            assert!(ptrs[0].is_inline());
            assert!(!ptrs[1].is_inline());
            assert!(!ptrs[2].is_inline());
        }
        backend.vlog.sync().await.unwrap();
        assert_eq!(backend.store.len(), 16);
    }

    #[tokio::test]
    async fn test_sync_writes_externalizes_everything() {
        let backend = in_memory_backend(ValueLogConfig {
            sync_writes: true,
            ..config(1, 100)
        });
        let mut reqs = request(vec![Entry::new("k", Vec::new())]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        let ptr = reqs[0].ptrs[0];
        assert!(!ptr.is_inline());
        let mut scratch = Vec::new();
        let entry = backend.vlog.read(ptr, &mut scratch, 0).await.unwrap();
        assert!(entry.value.is_empty());
    }

    #[tokio::test]
    async fn test_identifiers_unique_across_writers() {
        let backend = in_memory_backend(config(4, 16));

        let tasks: Vec<_> = (0..8)
            .map(|writer| {
                let vlog = backend.vlog.clone();
                tokio::spawn(async move {
                    let mut ptrs = Vec::new();
                    for batch in 0..25 {
                        let entries = (0..4)
                            .map(|i| Entry::new(format!("w{writer}-b{batch}-{i}"), vec![7u8; 32]))
                            .collect();
                        let mut reqs = request(entries);
                        vlog.write(&mut reqs).await.unwrap();
                        ptrs.extend(reqs.remove(0).ptrs);
                    }
                    ptrs
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in tasks {
            for ptr in task.await.unwrap() {
                assert_ne!(ptr.id, 0);
                assert!(ids.insert(ptr.id), "identifier {} issued twice", ptr.id);
            }
        }
        assert_eq!(ids.len(), 8 * 25 * 4);

        backend.vlog.sync().await.unwrap();
        assert_eq!(backend.store.len(), ids.len());
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        let backend = in_memory_backend(ValueLogConfig {
            compression: CompressionConfig::default(),
            ..config(1, 100)
        });
        let value = b"the quick brown fox ".repeat(500);
        let mut reqs = request(vec![Entry::new("fox", value.clone()).with_counters(11, 12)]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        let ptr = reqs[0].ptrs[0];
        assert!((ptr.len as usize) < value.len());

        let mut scratch = Vec::new();
        let entry = backend.vlog.read(ptr, &mut scratch, 0).await.unwrap();
        assert_ne!(entry.meta & BIT_COMPRESSED, 0);
        assert_eq!(entry.key, b"fox");
        assert_eq!(entry.value, &value[..]);
        assert_eq!(entry.cas_counter, 11);
        assert_eq!(entry.cas_counter_check, 12);
    }

    #[tokio::test]
    async fn test_preset_compressed_bit_rejected() {
        let backend = in_memory_backend(config(1, 10));
        let mut reqs = request(vec![
            Entry::new("k", vec![0u8; 64]).with_meta(BIT_COMPRESSED)
        ]);
        assert_matches!(
            backend.vlog.write(&mut reqs).await,
            Err(Error::CompressedBitPreset)
        );
        assert_eq!(backend.vlog.next_id(), 1);
    }

    #[tokio::test]
    async fn test_preset_compressed_bit_rejected_for_inline_values() {
        let backend = in_memory_backend(config(1, 100));
        let mut reqs = request(vec![
            Entry::new("k", vec![0u8; 10]).with_meta(BIT_COMPRESSED)
        ]);
        assert_matches!(
            backend.vlog.write(&mut reqs).await,
            Err(Error::CompressedBitPreset)
        );
        assert!(reqs[0].ptrs.is_empty());
        assert_eq!(backend.vlog.metrics().snapshot().writes_inline, 0);
    }

    #[tokio::test]
    async fn test_rejected_entry_leaves_batch_unwritten() {
        let backend = in_memory_backend(config(1, 100));
        let mut reqs = vec![
            WriteRequest::new(vec![
                Entry::new("good", vec![1u8; 200]),
                Entry::new("small", vec![2u8; 10]),
            ]),
            WriteRequest::new(vec![
                Entry::new("also-good", vec![3u8; 200]),
                Entry::new("bad", vec![4u8; 200]).with_meta(BIT_COMPRESSED),
            ]),
        ];
        assert_matches!(
            backend.vlog.write(&mut reqs).await,
            Err(Error::CompressedBitPreset)
        );
        backend.vlog.sync().await.unwrap();

        assert!(backend.store.is_empty());
        assert_eq!(backend.vlog.next_id(), 1);
        assert!(reqs.iter().all(|req| req.ptrs.is_empty()));

        // The same batch without the offending entry goes through
        reqs[1].entries.pop();
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();
        assert_eq!(backend.store.len(), 2);
        assert_eq!(reqs[0].ptrs[0].id, 1);
        assert!(reqs[0].ptrs[1].is_inline());
        assert_eq!(reqs[1].ptrs[0].id, 2);
    }
}

// =============================================================================
// Feature 2: Hinted Reads and Corruption
// =============================================================================

mod read_tests {
    use super::*;

    #[tokio::test]
    async fn test_read_uses_only_hinted_connection() {
        let backend = in_memory_backend(config(3, 10));
        let mut reqs = request(vec![Entry::new("k", vec![5u8; 100])]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        let mut scratch = Vec::new();
        backend
            .vlog
            .read(reqs[0].ptrs[0], &mut scratch, 2)
            .await
            .unwrap();

        let fetches: Vec<u64> = backend.transports.iter().map(|t| t.fetch_count()).collect();
        assert_eq!(fetches, vec![0, 0, 1]);
    }

    #[tokio::test]
    async fn test_out_of_range_hint() {
        let backend = in_memory_backend(config(2, 10));
        let mut scratch = Vec::new();
        assert_matches!(
            backend.vlog.read(ValuePointer::new(1, 40), &mut scratch, 5).await,
            Err(Error::InvalidHint {
                hint: 5,
                connections: 2
            })
        );
    }

    #[tokio::test]
    async fn test_missing_value_is_not_found() {
        let backend = in_memory_backend(config(1, 10));
        let mut scratch = Vec::new();
        let err = backend
            .vlog
            .read(ValuePointer::new(77, 40), &mut scratch, 0)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_tampered_value_is_corruption() {
        let backend = in_memory_backend(config(1, 10));
        let mut reqs = request(vec![Entry::new("k", vec![5u8; 100])]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();
        let ptr = reqs[0].ptrs[0];

        // Same length, but the header claims a longer key than the frame holds
        let mut forged = backend.store.get(b"1").unwrap().to_vec();
        forged[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        backend.store.insert("1", forged);

        let mut scratch = Vec::new();
        let err = backend.vlog.read(ptr, &mut scratch, 0).await.unwrap_err();
        assert!(err.is_corruption());

        backend.store.insert("1", vec![0u8; 3]);
        let err = backend.vlog.read(ptr, &mut scratch, 0).await.unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(backend.vlog.metrics().snapshot().corrupt_frames, 2);
    }

    #[tokio::test]
    async fn test_scratch_is_reused() {
        let backend = in_memory_backend(config(1, 10));
        let mut reqs = request(vec![
            Entry::new("a", vec![1u8; 4000]),
            Entry::new("b", vec![2u8; 20]),
        ]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        let mut scratch = Vec::new();
        let big = backend.vlog.read(reqs[0].ptrs[0], &mut scratch, 0).await.unwrap();
        assert_eq!(big.value.len(), 4000);
        let small = backend.vlog.read(reqs[0].ptrs[1], &mut scratch, 0).await.unwrap();
        assert_eq!(small.key, b"b");
        assert_eq!(small.value, &[2u8; 20][..]);
    }
}

// =============================================================================
// Feature 3: Sync, Retries and Dead Letters
// =============================================================================

mod durability_tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_is_a_visibility_barrier() {
        let backend = in_memory_backend(config(4, 10));
        let entries = (0..200)
            .map(|i| Entry::new(format!("k{i}"), vec![i as u8; 64]))
            .collect();
        let mut reqs = request(entries);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        for ptr in &reqs[0].ptrs {
            assert!(backend.store.contains(ptr.id.to_string().as_bytes()));
        }
        assert_eq!(backend.vlog.metrics().snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_noop_sync_returns_immediately() {
        let backend = in_memory_backend(ValueLogConfig {
            sync_mode: SyncMode::NoOp,
            ..config(1, 10)
        });
        backend.transports[0].fail_next_stores(100);
        let mut reqs = request(vec![Entry::new("k", vec![1u8; 64])]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_rejections_are_retried() {
        let backend = in_memory_backend(ValueLogConfig {
            max_write_retries: 3,
            ..config(1, 10)
        });
        backend.transports[0].fail_next_stores(2);
        let mut reqs = request(vec![Entry::new("k", vec![1u8; 64])]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        assert_eq!(backend.store.len(), 1);
        assert_eq!(backend.transports[0].store_count(), 3);
        assert_eq!(backend.vlog.metrics().snapshot().write_retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_at_sync() {
        let backend = in_memory_backend(ValueLogConfig {
            max_write_retries: 1,
            ..config(1, 10)
        });
        backend.transports[0].fail_next_stores(10);
        let mut reqs = request(vec![
            Entry::new("a", vec![1u8; 64]),
            Entry::new("b", vec![2u8; 64]),
        ]);
        backend.vlog.write(&mut reqs).await.unwrap();

        assert_matches!(
            backend.vlog.sync().await,
            Err(Error::WritesDropped { count: 2 })
        );
        let dropped: HashSet<u32> = backend.vlog.dead_letters().iter().map(|d| d.id).collect();
        let written: HashSet<u32> = reqs[0].ptrs.iter().map(|p| p.id).collect();
        assert_eq!(dropped, written);
        backend.vlog.sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_transport_fails_backend() {
        let backend = in_memory_backend(config(1, 10));
        backend.transports[0].break_connection();

        let mut reqs = request(vec![Entry::new("k", vec![1u8; 64])]);
        backend.vlog.write(&mut reqs).await.unwrap();
        assert_matches!(backend.vlog.sync().await, Err(Error::BackendFailed(_)));

        let mut more = request(vec![Entry::new("k2", vec![1u8; 64])]);
        assert_matches!(
            backend.vlog.write(&mut more).await,
            Err(Error::BackendFailed(_))
        );
        backend.vlog.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let backend = in_memory_backend(ValueLogConfig {
            queue_capacity: 1,
            flush_batch_size: 1,
            ..config(1, 10)
        });
        let entries = (0..100)
            .map(|i| Entry::new(format!("k{i}"), vec![3u8; 32]))
            .collect();
        let mut reqs = request(entries);
        tokio::time::timeout(Duration::from_secs(5), backend.vlog.write(&mut reqs))
            .await
            .unwrap()
            .unwrap();
        backend.vlog.sync().await.unwrap();
        assert_eq!(backend.store.len(), 100);
    }
}

// =============================================================================
// Feature 4: Lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_close_drains_queue() {
        let backend = in_memory_backend(config(2, 10));
        let entries = (0..300)
            .map(|i| Entry::new(format!("k{i}"), vec![9u8; 48]))
            .collect();
        let mut reqs = request(entries);
        backend.vlog.write(&mut reqs).await.unwrap();

        backend.vlog.close().await.unwrap();
        assert_eq!(backend.store.len(), 300);
        assert!(backend.vlog.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let backend = in_memory_backend(config(1, 10));
        backend.vlog.close().await.unwrap();
        backend.vlog.close().await.unwrap();

        let mut reqs = request(vec![Entry::new("k", vec![1u8; 64])]);
        assert_matches!(backend.vlog.write(&mut reqs).await, Err(Error::Closed));
        let mut scratch = Vec::new();
        assert_matches!(
            backend.vlog.read(ValuePointer::new(1, 90), &mut scratch, 0).await,
            Err(Error::Closed)
        );
        assert!(backend.vlog.sync().await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_close_calls() {
        let backend = in_memory_backend(config(2, 10));
        let closers: Vec<_> = (0..4)
            .map(|_| {
                let vlog = backend.vlog.clone();
                tokio::spawn(async move { vlog.close().await })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap().unwrap();
        }
        assert!(backend.vlog.is_closed());
    }
}

// =============================================================================
// Feature 5: Garbage Collection and Replay
// =============================================================================

mod maintenance_tests {
    use super::*;

    #[tokio::test]
    async fn test_gc_deletes_unreferenced_values() {
        let index = Arc::new(TrackedIndex::default());
        let backend = in_memory_backend_with_index(
            ValueLogConfig {
                gc_threshold: 0.5,
                ..config(2, 10)
            },
            index.clone(),
        );
        let entries = (0..10)
            .map(|i| Entry::new(format!("k{i}"), vec![i as u8; 32]))
            .collect();
        let mut reqs = request(entries);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        let ptrs = reqs[0].ptrs.clone();
        for ptr in ptrs.iter().step_by(2) {
            index.kill(ptr.id);
        }

        let report = backend.vlog.collect_garbage().await.unwrap();
        assert_eq!(report.scanned, 10);
        assert_eq!(report.deleted, 5);
        assert_eq!(backend.store.len(), 5);

        let mut scratch = Vec::new();
        let err = backend.vlog.read(ptrs[0], &mut scratch, 0).await.unwrap_err();
        assert!(err.is_not_found());
        backend.vlog.read(ptrs[1], &mut scratch, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_gc_reclaims_past_long_lived_window() {
        let index = Arc::new(TrackedIndex::default());
        let backend = in_memory_backend_with_index(
            ValueLogConfig {
                gc_threshold: 0.5,
                gc_batch_size: 10,
                ..config(1, 10)
            },
            index.clone(),
        );
        let entries = (0..40)
            .map(|i| Entry::new(format!("k{i}"), vec![i as u8; 32]))
            .collect();
        let mut reqs = request(entries);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        // The first window stays referenced, everything after it is dead
        for ptr in &reqs[0].ptrs[10..] {
            index.kill(ptr.id);
        }

        let report = backend.vlog.collect_garbage().await.unwrap();
        assert_eq!(report.deleted, 30);
        assert_eq!(report.start, reqs[0].ptrs[0].id);
        assert_eq!(backend.store.len(), 10);

        let mut scratch = Vec::new();
        backend.vlog.read(reqs[0].ptrs[3], &mut scratch, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_gc_loop_disabled_returns() {
        let backend = in_memory_backend(ValueLogConfig {
            gc_threshold: 0.0,
            ..config(1, 10)
        });
        tokio::time::timeout(
            Duration::from_secs(1),
            backend.vlog.run_gc_in_loop(CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(backend.vlog.gc_state(), GcState::Terminated);
    }

    #[tokio::test]
    async fn test_gc_loop_runs_until_cancelled() {
        let index = Arc::new(TrackedIndex::default());
        let backend = in_memory_backend_with_index(
            ValueLogConfig {
                gc_threshold: 0.5,
                gc_interval: Duration::from_millis(10),
                ..config(1, 10)
            },
            index.clone(),
        );
        let mut reqs = request(vec![Entry::new("k", vec![1u8; 64])]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();
        index.kill(reqs[0].ptrs[0].id);

        let shutdown = CancellationToken::new();
        let gc = {
            let vlog = backend.vlog.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { vlog.run_gc_in_loop(shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !backend.store.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), gc)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backend.vlog.gc_state(), GcState::Terminated);
    }

    #[tokio::test]
    async fn test_gc_loop_stops_on_close() {
        let backend = in_memory_backend(ValueLogConfig {
            gc_threshold: 0.5,
            gc_interval: Duration::from_millis(10),
            ..config(1, 10)
        });
        let gc = {
            let vlog = backend.vlog.clone();
            tokio::spawn(async move { vlog.run_gc_in_loop(CancellationToken::new()).await })
        };
        backend.vlog.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), gc)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_replay_visits_in_identifier_order() {
        let backend = in_memory_backend(config(2, 10));
        let entries = (0..6)
            .map(|i| Entry::new(format!("k{i}"), vec![i as u8; 40]))
            .collect();
        let mut reqs = request(entries);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();
        let ptrs = reqs[0].ptrs.clone();

        // A value evicted by the cache is skipped
        backend.store.remove(ptrs[2].id.to_string().as_bytes());

        let mut seen = Vec::new();
        backend
            .vlog
            .replay(ValuePointer::INLINE, &mut |entry, ptr| {
                seen.push((String::from_utf8_lossy(entry.key).into_owned(), ptr));
                Ok(true)
            })
            .await
            .unwrap();
        let keys: Vec<&str> = seen.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["k0", "k1", "k3", "k4", "k5"]);
        assert_eq!(seen[0].1, ptrs[0]);

        let mut from_middle = Vec::new();
        backend
            .vlog
            .replay(ptrs[3], &mut |_, ptr| {
                from_middle.push(ptr.id);
                Ok(from_middle.len() < 2)
            })
            .await
            .unwrap();
        assert_eq!(from_middle, vec![ptrs[3].id, ptrs[4].id]);
    }

    #[tokio::test]
    async fn test_replay_visitor_error_propagates() {
        let backend = in_memory_backend(config(1, 10));
        let mut reqs = request(vec![Entry::new("k", vec![1u8; 40])]);
        backend.vlog.write(&mut reqs).await.unwrap();
        backend.vlog.sync().await.unwrap();

        let result = backend
            .vlog
            .replay(ValuePointer::INLINE, &mut |_, _| {
                Err(Error::Corrupt("rejected by visitor".into()))
            })
            .await;
        assert_matches!(result, Err(Error::Corrupt(_)));
    }
}
