//! 需要真实 Redis：`REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`

use api_token::auth::{devices_key, SessionValue, TokenStore};
use api_token::config::{RedisConfig, TokenConfig};
use api_token::infra::{Batch, RedisBackend, SessionBackend};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn backend() -> RedisBackend {
    backend_with_pool(RedisConfig::default().pool_size).await
}

async fn backend_with_pool(pool_size: u32) -> RedisBackend {
    let config = RedisConfig {
        url: redis_url(),
        pool_size,
        ..RedisConfig::default()
    };
    RedisBackend::new(&config).await.unwrap()
}

/// 每次运行使用不同的 uid，避免与残留数据冲突
fn unique_uid(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
#[ignore] // 需要 Redis
async fn test_watch_conflict_aborts_exec() {
    let backend = backend().await;
    let key = format!("devices:{}", unique_uid("watch"));
    backend.hset_nx(&key, "c1", "t1").await.unwrap();

    let mut tx = backend.watch(&[key.clone()]).await.unwrap();
    assert_eq!(tx.hgetall(&key).await.unwrap().len(), 1);

    // 另一条连接修改被监视的 key
    backend.hset_nx(&key, "c2", "t2").await.unwrap();

    let mut batch = Batch::new();
    batch.atomic().hdel(&key, "c1");
    assert!(!tx.commit(batch).await.unwrap());
    assert_eq!(backend.hlen(&key).await.unwrap(), 2);

    let mut cleanup = Batch::new();
    cleanup.del(&key);
    backend.execute(cleanup).await.unwrap();
}

#[tokio::test]
#[ignore] // 需要 Redis
async fn test_dropped_transaction_does_not_poison_pooled_connection() {
    // 单连接池：后续命令一定复用被丢弃事务的那条连接
    let backend = backend_with_pool(1).await;
    let watched = format!("devices:{}", unique_uid("dropped"));
    let record = format!("record:{}", unique_uid("dropped"));
    backend.hset_nx(&watched, "c1", "t1").await.unwrap();

    let mut tx = backend.watch(&[watched.clone()]).await.unwrap();
    assert_eq!(tx.hgetall(&watched).await.unwrap().len(), 1);
    // 模拟请求被取消：既不 commit 也不 discard
    drop(tx);

    // 另一个客户端改动被监视的 key
    let client = redis::Client::open(redis_url()).unwrap();
    let mut other = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("HSET")
        .arg(&watched)
        .arg("c2")
        .arg("t2")
        .query_async::<()>(&mut other)
        .await
        .unwrap();

    let mut batch = Batch::new();
    batch
        .atomic()
        .hset(&record, "uid", "u1")
        .expire(&record, Duration::from_secs(60));
    backend.execute(batch).await.unwrap();
    assert_eq!(
        backend.hget(&record, "uid").await.unwrap().as_deref(),
        Some("u1")
    );

    let mut cleanup = Batch::new();
    cleanup.del(&watched).del(&record);
    backend.execute(cleanup).await.unwrap();
}

#[tokio::test]
#[ignore] // 需要 Redis
async fn test_store_round_trip_on_redis() {
    let backend = Arc::new(backend().await);
    let config = TokenConfig {
        max_ttl_days: 1,
        min_devices: 2,
        max_devices: 4,
    };
    let store = TokenStore::new(backend.clone(), &config).unwrap();
    let uid = unique_uid("store");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let uid = uid.clone();
        handles.push(tokio::spawn(async move {
            store
                .create_or_reuse(&SessionValue::new(uid, "c1"))
                .await
                .unwrap()
        }));
    }
    let mut tokens = HashSet::new();
    for handle in handles {
        tokens.insert(handle.await.unwrap());
    }
    assert_eq!(tokens.len(), 1);
    let token = tokens.into_iter().next().unwrap();

    let ttl = store.remaining_ttl(&token).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(24 * 3600));

    for i in 2..=4 {
        store
            .create(&SessionValue::new(uid.clone(), format!("c{}", i)))
            .await
            .unwrap();
    }
    // 达到上限 4 后淘汰到 2
    assert_eq!(backend.hlen(&devices_key(&uid)).await.unwrap(), 2);

    assert_eq!(store.delete_all_for_user(&uid).await.unwrap(), 2);
    assert!(store.find_all_for_user(&uid).await.unwrap().is_empty());
}
