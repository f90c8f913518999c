use api_token::auth::{devices_key, record_key, EvictionOutcome, SessionValue, TokenStore};
use api_token::config::TokenConfig;
use api_token::infra::{Batch, MemoryBackend, SessionBackend};
use api_token::TokenError;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn new_store(min: usize, max: usize) -> (MemoryBackend, TokenStore) {
    let backend = MemoryBackend::new();
    let config = TokenConfig {
        max_ttl_days: 90,
        min_devices: min,
        max_devices: max,
    };
    let store = TokenStore::new(Arc::new(backend.clone()), &config).unwrap();
    (backend, store)
}

/// 绕过淘汰直接写入 `n` 个设备，clientId 为 c00..，latestTime 递增
async fn seed_devices(backend: &MemoryBackend, uid: &str, n: usize) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut batch = Batch::new();
    for i in 0..n {
        let client_id = format!("c{:02}", i);
        let token = format!("seed-{}-{}", uid, i);
        let value = SessionValue::new(uid, client_id.clone()).with_latest_time(at(1_000 + i as i64));
        batch
            .hset_multiple(record_key(&token), value.to_fields())
            .expire(record_key(&token), Duration::from_secs(3600))
            .hset(devices_key(uid), client_id, token.clone());
        tokens.push(token);
    }
    backend.execute(batch).await.unwrap();
    tokens
}

async fn remove_record(backend: &MemoryBackend, token: &str) {
    let mut batch = Batch::new();
    batch.del(record_key(token));
    backend.execute(batch).await.unwrap();
}

mod create_and_reuse {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_create_or_reuse_converges() {
        let (backend, store) = new_store(10, 20);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let value = SessionValue::new("u1", "c1").with_session(format!("payload-{}", i));
                store.create_or_reuse(&value).await.unwrap()
            }));
        }

        let mut tokens = HashSet::new();
        for handle in handles {
            tokens.insert(handle.await.unwrap());
        }

        assert_eq!(tokens.len(), 1);
        let token = tokens.into_iter().next().unwrap();
        assert_eq!(store.find_all_for_user("u1").await.unwrap(), vec![token]);
        // 只剩一条记录 + 一个注册表
        assert_eq!(backend.key_count(), 2);
    }

    #[tokio::test]
    async fn create_or_reuse_refreshes_winner() {
        let (_backend, store) = new_store(10, 20);

        let first = store
            .create_or_reuse(&SessionValue::new("u1", "c1").with_latest_time(at(100)))
            .await
            .unwrap();
        let second = store
            .create_or_reuse(
                &SessionValue::new("u1", "c1")
                    .with_session("other")
                    .with_latest_time(at(200)),
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        let value = store.resume(&first).await.unwrap().unwrap();
        assert_eq!(value.latest_time, at(200));
        // 复用时不覆盖胜者的会话数据
        assert_eq!(value.session, "");
    }

    #[tokio::test]
    async fn create_or_reuse_replaces_stale_entry() {
        let (backend, store) = new_store(10, 20);

        let stale = store
            .create_or_reuse(&SessionValue::new("u1", "c1"))
            .await
            .unwrap();
        remove_record(&backend, &stale).await;

        let fresh = store
            .create_or_reuse(&SessionValue::new("u1", "c1"))
            .await
            .unwrap();

        assert_ne!(stale, fresh);
        assert!(store.resume(&fresh).await.unwrap().is_some());
        assert_eq!(
            store.find_by_user_client("u1", "c1").await.unwrap(),
            Some(fresh)
        );
    }

    #[tokio::test]
    async fn create_overrides_previous_token() {
        let (_backend, store) = new_store(10, 20);

        let first = store.create(&SessionValue::new("u1", "c1")).await.unwrap();
        let second = store.create(&SessionValue::new("u1", "c1")).await.unwrap();

        assert_ne!(first, second);
        assert!(store.resume(&first).await.unwrap().is_none());
        assert_eq!(
            store.resume(&second).await.unwrap().unwrap().client_id,
            "c1"
        );
        assert_eq!(store.find_all_for_user("u1").await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn empty_ids_are_rejected() {
        let (_backend, store) = new_store(10, 20);

        for value in [SessionValue::new("", "c1"), SessionValue::new("u1", "")] {
            assert!(matches!(
                store.create(&value).await,
                Err(TokenError::InvalidArgument(_))
            ));
            assert!(matches!(
                store.create_or_reuse(&value).await,
                Err(TokenError::InvalidArgument(_))
            ));
        }
    }
}

mod eviction {
    use super::*;

    #[tokio::test]
    async fn reaching_max_trims_to_most_recent() {
        let (_backend, store) = new_store(10, 20);

        let mut tokens = Vec::new();
        for i in 0..20 {
            let value = SessionValue::new("u1", format!("c{:02}", i)).with_latest_time(at(1_000 + i));
            tokens.push(store.create(&value).await.unwrap());
        }

        let devices = store.find_devices("u1").await.unwrap();
        let clients: Vec<_> = devices.iter().map(|(c, _)| c.as_str()).collect();
        let expected: Vec<String> = (10..20).map(|i| format!("c{:02}", i)).collect();
        assert_eq!(clients, expected);

        for token in &tokens[..10] {
            assert!(store.resume(token).await.unwrap().is_none());
        }
        for token in &tokens[10..] {
            assert!(store.exists(token).await.unwrap());
        }
    }

    #[tokio::test]
    async fn oversized_registry_converges_to_min() {
        let (backend, store) = new_store(10, 20);
        let tokens = seed_devices(&backend, "u1", 25).await;

        // 任意一次查询都会触发淘汰
        let live = store.find_all_for_user("u1").await.unwrap();
        assert_eq!(live.len(), 10);
        let live: HashSet<_> = live.into_iter().collect();
        let expected: HashSet<_> = tokens[15..].iter().cloned().collect();
        assert_eq!(live, expected);
        assert_eq!(backend.hlen(&devices_key("u1")).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn entries_without_record_are_evicted_first() {
        let (backend, store) = new_store(2, 4);
        let tokens = seed_devices(&backend, "u1", 4).await;
        // 最新的设备记录丢失
        remove_record(&backend, &tokens[3]).await;

        assert_eq!(store.evict("u1").await.unwrap(), EvictionOutcome::Evicted(2));
        let live: Vec<_> = store
            .find_devices("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        assert_eq!(live, vec!["c01", "c02"]);
    }

    #[tokio::test]
    async fn single_conflict_is_retried() {
        let (backend, store) = new_store(10, 20);
        seed_devices(&backend, "u1", 20).await;

        backend.inject_watch_conflicts(1);
        assert_eq!(store.evict("u1").await.unwrap(), EvictionOutcome::Evicted(10));
        assert_eq!(backend.hlen(&devices_key("u1")).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn repeated_conflicts_abandon_then_heal() {
        let (backend, store) = new_store(10, 20);
        seed_devices(&backend, "u1", 20).await;

        backend.inject_watch_conflicts(2);
        assert_eq!(store.evict("u1").await.unwrap(), EvictionOutcome::Abandoned);
        assert_eq!(backend.hlen(&devices_key("u1")).await.unwrap(), 20);

        // 下一次触发淘汰的操作继续收敛
        store
            .create(&SessionValue::new("u1", "late").with_latest_time(at(9_999)))
            .await
            .unwrap();
        assert_eq!(backend.hlen(&devices_key("u1")).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn below_max_is_untouched() {
        let (backend, store) = new_store(10, 20);
        seed_devices(&backend, "u1", 19).await;

        assert_eq!(
            store.evict_if_needed("u1").await.unwrap(),
            EvictionOutcome::Skipped
        );
        assert_eq!(store.find_all_for_user("u1").await.unwrap().len(), 19);
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_backend, store) = new_store(10, 20);
        let token = store.create(&SessionValue::new("u1", "c1")).await.unwrap();

        assert!(store.delete(&token).await.unwrap());
        assert!(!store.delete(&token).await.unwrap());
        assert!(!store.delete("").await.unwrap());
        assert!(store.resume(&token).await.unwrap().is_none());
        assert!(store.find_all_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_ttl_is_clamped() {
        let (_backend, store) = new_store(10, 20);
        let token = store.create(&SessionValue::new("u1", "c1")).await.unwrap();
        let max = store.max_ttl();

        assert!(store
            .refresh_ttl(&token, Some(Duration::from_secs(60)))
            .await
            .unwrap());
        let ttl = store.remaining_ttl(&token).await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(60));

        assert!(store.refresh_ttl(&token, Some(max * 3)).await.unwrap());
        let ttl = store.remaining_ttl(&token).await.unwrap().unwrap();
        assert!(ttl <= max);
        assert!(ttl > max - Duration::from_secs(5));

        assert!(!store.refresh_ttl("missing", None).await.unwrap());
        assert_eq!(store.remaining_ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn touch_updates_latest_time_without_resurrecting() {
        let (_backend, store) = new_store(10, 20);
        let token = store
            .create(&SessionValue::new("u1", "c1").with_latest_time(at(100)))
            .await
            .unwrap();

        assert!(store.touch(&token, at(500)).await.unwrap());
        assert_eq!(
            store.resume(&token).await.unwrap().unwrap().latest_time,
            at(500)
        );

        store.delete(&token).await.unwrap();
        assert!(!store.touch(&token, at(600)).await.unwrap());
        assert!(!store.exists(&token).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_records_disappear_and_entries_are_cleaned() {
        let backend = MemoryBackend::new();
        let config = TokenConfig {
            max_ttl_days: 1,
            min_devices: 2,
            max_devices: 4,
        };
        let store = TokenStore::new(Arc::new(backend.clone()), &config).unwrap();
        let token = store.create(&SessionValue::new("u1", "c1")).await.unwrap();

        tokio::time::advance(Duration::from_secs(24 * 3600 + 1)).await;

        assert!(store.resume(&token).await.unwrap().is_none());
        assert_eq!(store.find_by_user_client("u1", "c1").await.unwrap(), None);
        assert_eq!(backend.hlen(&devices_key("u1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_entries_are_dropped_on_lookup() {
        let (backend, store) = new_store(10, 20);
        let t1 = store.create(&SessionValue::new("u1", "c1")).await.unwrap();
        let t2 = store.create(&SessionValue::new("u1", "c2")).await.unwrap();
        remove_record(&backend, &t1).await;

        assert_eq!(store.find_all_for_user("u1").await.unwrap(), vec![t2]);
        assert_eq!(backend.hlen(&devices_key("u1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_client_and_all() {
        let (_backend, store) = new_store(10, 20);
        let t1 = store.create(&SessionValue::new("u1", "c1")).await.unwrap();
        store.create(&SessionValue::new("u1", "c2")).await.unwrap();
        store.create(&SessionValue::new("u1", "c3")).await.unwrap();

        assert!(store.delete_client_for_user("u1", "c1").await.unwrap());
        assert!(!store.delete_client_for_user("u1", "c1").await.unwrap());
        assert!(store.resume(&t1).await.unwrap().is_none());

        assert_eq!(store.delete_all_for_user("u1").await.unwrap(), 2);
        assert_eq!(store.delete_all_for_user("u1").await.unwrap(), 0);
        assert!(store.find_devices("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let (_backend, store) = new_store(10, 20);

        let token = store.create(&SessionValue::new("u1", "c1")).await.unwrap();
        let value = store.resume(&token).await.unwrap().unwrap();
        assert_eq!(value.uid, "u1");

        store.delete_all_for_user("u1").await.unwrap();

        assert!(store.resume(&token).await.unwrap().is_none());
        assert!(store.find_all_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_is_not_not_found() {
        let (backend, store) = new_store(10, 20);
        let token = store.create(&SessionValue::new("u1", "c1")).await.unwrap();

        backend.set_offline(true);
        let err = store.resume(&token).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("resume"));

        let err = store.create(&SessionValue::new("u1", "c2")).await.unwrap_err();
        assert!(matches!(err, TokenError::Backend { .. }));

        backend.set_offline(false);
        assert!(store.resume(&token).await.unwrap().is_some());
    }
}
