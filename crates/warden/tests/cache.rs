// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for the cache coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden::{CacheAsideOptions, CacheCoordinator, CacheKey, KeySpace};
use warden_store::{MemoryStore, StoreOp};

#[derive(Debug)]
enum AppError {
    Coordination(warden::Error),
    Upstream(&'static str),
}

impl From<warden::Error> for AppError {
    fn from(error: warden::Error) -> Self {
        Self::Coordination(error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    id: u64,
    owner: String,
    opened_at: jiff::Timestamp,
    limits: BTreeMap<String, u32>,
    aliases: Vec<String>,
    parent: Option<Box<Account>>,
}

fn cache() -> (Arc<MemoryStore>, CacheCoordinator<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let cache = CacheCoordinator::new(Arc::clone(&store), KeySpace::new(Some("app")), Duration::from_secs(3600));
    (store, cache)
}

fn account(id: u64) -> Account {
    Account {
        id,
        owner: format!("owner-{id}"),
        opened_at: "2024-03-01T12:30:00Z".parse().expect("valid timestamp"),
        limits: BTreeMap::from([("daily".to_string(), 500)]),
        aliases: vec!["primary".to_string()],
        parent: Some(Box::new(Account {
            id: 0,
            owner: "root".to_string(),
            opened_at: jiff::Timestamp::UNIX_EPOCH,
            limits: BTreeMap::new(),
            aliases: Vec::new(),
            parent: None,
        })),
    }
}

#[tokio::test]
async fn rich_values_round_trip() {
    let (_, cache) = cache();
    let original = account(7);

    cache.set("account:7", &original, None).await.unwrap();
    let restored: Option<Account> = cache.get("account:7").await.unwrap();

    assert_eq!(restored, Some(original));
}

#[tokio::test]
async fn primitives_round_trip() {
    let (_, cache) = cache();

    cache.set("int", &-17_i64, None).await.unwrap();
    cache.set("float", &2.5_f64, None).await.unwrap();
    cache.set("flag", &true, None).await.unwrap();
    cache.set("list", &vec![1, 2, 3], None).await.unwrap();

    assert_eq!(cache.get::<i64>("int").await.unwrap(), Some(-17));
    assert_eq!(cache.get::<f64>("float").await.unwrap(), Some(2.5));
    assert_eq!(cache.get::<bool>("flag").await.unwrap(), Some(true));
    assert_eq!(cache.get::<Vec<i32>>("list").await.unwrap(), Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn typed_keys_read_what_they_wrote() {
    let (_, cache) = cache();
    let key: CacheKey<Account> = CacheKey::new("account:1");

    cache.set_typed(&key, &account(1), None).await.unwrap();

    assert_eq!(cache.get_typed(&key).await.unwrap().map(|a| a.id), Some(1));
}

#[tokio::test]
async fn keys_are_prefixed_in_the_store() {
    let (store, cache) = cache();

    cache.set("user:1", &1, None).await.unwrap();
    cache.assign_tags(&["user:1"], &["users"]).await.unwrap();

    assert!(store.contains_key("app:user:1"));
    assert!(store.contains_key("app:tag:users"));
    assert!(cache.has_key("user:1").await.unwrap());
    assert!(!cache.has_key("user:2").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_their_ttl() {
    let (_, cache) = cache();
    cache.set("session", &"token", Some(Duration::from_secs(60))).await.unwrap();

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(cache.get::<String>("session").await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cache.get::<String>("session").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn expire_resets_the_ttl() {
    let (_, cache) = cache();
    cache.set("session", &"token", Some(Duration::from_secs(10))).await.unwrap();

    assert!(cache.expire("session", Duration::from_secs(120)).await.unwrap());
    tokio::time::advance(Duration::from_secs(60)).await;

    assert!(cache.has_key("session").await.unwrap());
    assert!(!cache.expire("absent", Duration::from_secs(5)).await.unwrap());
}

#[tokio::test]
async fn delete_counts_existing_entries() {
    let (_, cache) = cache();
    cache.set("a", &1, None).await.unwrap();
    cache.set("b", &2, None).await.unwrap();

    assert_eq!(cache.delete(&["a", "b", "c"]).await.unwrap(), 2);
    assert_eq!(cache.get::<i32>("a").await.unwrap(), None);
}

#[tokio::test]
async fn raw_set_operations() {
    let (_, cache) = cache();
    let members = vec!["x".to_string(), "y".to_string()];

    assert_eq!(cache.set_add("seen", &members).await.unwrap(), 2);
    assert_eq!(cache.set_has("seen", &["x".to_string(), "z".to_string()]).await.unwrap(), [true, false]);
    assert_eq!(cache.set_delete("seen", &["x".to_string()]).await.unwrap(), 1);
    assert_eq!(cache.set_has("seen", &members).await.unwrap(), [false, true]);
}

#[tokio::test]
async fn delete_by_tags_removes_every_tagged_entry() {
    let (store, cache) = cache();
    for id in 0..5 {
        cache.set(&format!("user:{id}"), &id, None).await.unwrap();
    }
    cache.set("order:1", &1, None).await.unwrap();
    cache.assign_tags(&["user:0", "user:1", "user:2"], &["users", "active"]).await.unwrap();
    cache.assign_tags(&["user:3", "user:4"], &["users"]).await.unwrap();

    let deleted = cache.delete_by_tags(&["users"]).await.unwrap();

    assert_eq!(deleted, 5);
    for id in 0..5 {
        assert_eq!(cache.get::<i32>(&format!("user:{id}")).await.unwrap(), None);
    }
    assert_eq!(cache.get::<i32>("order:1").await.unwrap(), Some(1));
    assert!(!store.contains_key("app:tag:users"));
}

#[tokio::test]
async fn delete_by_tags_pages_through_large_tags() {
    let (store, cache) = cache();
    let keys: Vec<String> = (0..250).map(|i| format!("item:{i}")).collect();
    for key in &keys {
        cache.set(key, &0, None).await.unwrap();
    }
    cache.assign_tags(&keys, &["bulk"]).await.unwrap();
    store.clear_operations();

    assert_eq!(cache.delete_by_tags(&["bulk"]).await.unwrap(), 250);

    let scans = store.operations().iter().filter(|op| matches!(op, StoreOp::SScan { .. })).count();
    assert_eq!(scans, 3);
    assert_eq!(store.key_count(), 0);
}

#[tokio::test]
async fn delete_by_tags_tolerates_empty_tags() {
    let (_, cache) = cache();

    assert_eq!(cache.delete_by_tags(&["nobody"]).await.unwrap(), 0);
}

#[tokio::test]
async fn assign_tags_is_one_batch() {
    let (store, cache) = cache();

    cache.assign_tags(&["a", "b"], &["x", "y", "z"]).await.unwrap();

    let operations = store.operations();
    assert_eq!(operations.len(), 1);
    assert!(matches!(&operations[0], StoreOp::Exec(batch) if batch.len() == 3));
}

#[tokio::test]
async fn cache_aside_then_tag_invalidation() {
    let (_, cache) = cache();
    let options = CacheAsideOptions::new().ttl(Duration::from_secs(60)).tag("users");

    let value: Option<String> = cache
        .cache_aside("user:1", || async { Ok::<_, AppError>(Some("ada".to_string())) }, &options)
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("ada"));
    assert_eq!(cache.get::<String>("user:1").await.unwrap().as_deref(), Some("ada"));

    cache.delete_by_tags(&["users"]).await.unwrap();

    assert_eq!(cache.get::<String>("user:1").await.unwrap(), None);
}

#[tokio::test]
async fn cache_aside_skips_resolver_on_hit() {
    let (_, cache) = cache();
    let calls = AtomicU32::new(0);
    let resolve = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, AppError>(Some(42))
    };

    let first: Option<i32> = cache.cache_aside("answer", resolve, &CacheAsideOptions::new()).await.unwrap();
    let second: Option<i32> = cache.cache_aside("answer", resolve, &CacheAsideOptions::new()).await.unwrap();

    assert_eq!((first, second), (Some(42), Some(42)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_aside_does_not_cache_absent_values() {
    let (store, cache) = cache();
    let calls = AtomicU32::new(0);
    let options = CacheAsideOptions::new().tag("answers");

    let first: Option<u32> = cache
        .cache_aside(
            "answer",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(None)
            },
            &options,
        )
        .await
        .unwrap();
    assert_eq!(first, None);
    assert!(!store.contains_key("app:answer"));
    assert!(!store.contains_key("app:tag:answers"));

    let second: Option<u32> = cache
        .cache_aside(
            "answer",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(Some(5))
            },
            &options,
        )
        .await
        .unwrap();

    assert_eq!(second, Some(5));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get::<u32>("answer").await.unwrap(), Some(5));
}

#[tokio::test]
async fn cache_aside_propagates_resolver_errors_without_caching() {
    let (store, cache) = cache();

    let result = cache
        .cache_aside::<i32, _, _, _>("answer", || async { Err(AppError::Upstream("offline")) }, &CacheAsideOptions::new())
        .await;

    assert!(matches!(result, Err(AppError::Upstream("offline"))));
    assert!(!store.contains_key("app:answer"));
}

#[tokio::test]
async fn cache_aside_surfaces_store_failures_as_coordination_errors() {
    let (store, cache) = cache();
    store.fail_when(|op| matches!(op, StoreOp::Get(_)));

    let result = cache
        .cache_aside("answer", || async { Ok::<_, AppError>(Some(1)) }, &CacheAsideOptions::new())
        .await;

    assert!(matches!(result, Err(AppError::Coordination(error)) if error.is_connection()));
}

#[tokio::test]
async fn batch_cache_aside_with_no_params_skips_resolver() {
    let (store, cache) = cache();
    let calls = AtomicU32::new(0);

    let results: Vec<Option<String>> = cache
        .batch_cache_aside(
            Vec::<u32>::new(),
            |id| format!("user:{id}"),
            |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(Vec::new())
            },
            &CacheAsideOptions::new(),
        )
        .await
        .unwrap();

    assert!(results.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(store.operations().is_empty());
}

#[tokio::test]
async fn batch_cache_aside_resolves_only_misses_in_order() {
    let (store, cache) = cache();
    cache.set("user:2", &"cached-2".to_string(), None).await.unwrap();
    cache.set("user:5", &"cached-5".to_string(), None).await.unwrap();
    let seen = std::sync::Mutex::new(Vec::new());
    let seen = &seen;

    let results = cache
        .batch_cache_aside(
            vec![1_u32, 2, 3, 4, 5, 6],
            |id| format!("user:{id}"),
            |misses: Vec<u32>| async move {
                seen.lock().unwrap().extend(misses.iter().copied());
                Ok::<_, AppError>(misses.iter().map(|id| (*id != 4).then(|| format!("resolved-{id}"))).collect())
            },
            &CacheAsideOptions::new().tag("users"),
        )
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), [1, 3, 4, 6]);
    assert_eq!(
        results,
        [
            Some("resolved-1".to_string()),
            Some("cached-2".to_string()),
            Some("resolved-3".to_string()),
            None,
            Some("cached-5".to_string()),
            Some("resolved-6".to_string()),
        ]
    );

    // resolved values are cached and tagged; the unresolved one is not
    assert_eq!(cache.get::<String>("user:3").await.unwrap().as_deref(), Some("resolved-3"));
    assert!(!store.contains_key("app:user:4"));
    assert_eq!(
        cache
            .set_has("tag:users", &["app:user:1".to_string(), "app:user:4".to_string()])
            .await
            .unwrap(),
        [true, false]
    );
}

#[tokio::test]
async fn batch_cache_aside_with_all_hits_skips_resolver() {
    let (_, cache) = cache();
    cache.set("n:1", &10, None).await.unwrap();
    cache.set("n:2", &20, None).await.unwrap();

    let results = cache
        .batch_cache_aside(
            vec![1, 2],
            |id| format!("n:{id}"),
            |_: Vec<i32>| async { Err::<Vec<Option<i32>>, _>(AppError::Upstream("must not run")) },
            &CacheAsideOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(results, [Some(10), Some(20)]);
}

#[tokio::test]
async fn batch_cache_aside_writes_back_in_one_batch() {
    let (store, cache) = cache();

    cache
        .batch_cache_aside(
            vec![1, 2, 3],
            |id| format!("n:{id}"),
            |misses: Vec<i32>| async move { Ok::<_, AppError>(misses.into_iter().map(Some).collect()) },
            &CacheAsideOptions::new().tags(["numbers", "small"]),
        )
        .await
        .unwrap();

    let batches: Vec<_> = store
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            StoreOp::Exec(batch) => Some(batch),
            _ => None,
        })
        .collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 5);
}

#[tokio::test]
async fn batch_cache_aside_propagates_resolver_errors() {
    let (store, cache) = cache();

    let result = cache
        .batch_cache_aside(
            vec![1, 2],
            |id| format!("n:{id}"),
            |_: Vec<i32>| async { Err::<Vec<Option<i32>>, _>(AppError::Upstream("offline")) },
            &CacheAsideOptions::new(),
        )
        .await;

    assert!(matches!(result, Err(AppError::Upstream("offline"))));
    assert_eq!(store.key_count(), 0);
}

#[tokio::test]
async fn batch_cache_aside_tolerates_short_resolver_output() {
    let (_, cache) = cache();

    let results = cache
        .batch_cache_aside(
            vec![1, 2, 3],
            |id| format!("n:{id}"),
            |_: Vec<i32>| async { Ok::<_, AppError>(vec![Some(100)]) },
            &CacheAsideOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(results, [Some(100), None, None]);
}
