//! Cluster Module Tests
//!
//! ## Test Scopes
//! - **Registration**: upsert semantics, index maintenance, heartbeat handling.
//! - **Lookup**: service/tag intersection and ordering.
//! - **Eviction**: lazy timeout eviction, hook idempotence, remote merges.
//! - **Persistence**: the sled-backed store survives a reopen.

#[cfg(test)]
mod tests {
    use crate::cluster::{
        AgentRecord, ClusterState, EvictionReason, HeartbeatOutcome, MemoryStore, SledStore,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn new_state() -> Arc<ClusterState> {
        ClusterState::new(Box::new(MemoryStore::new()), Duration::from_secs(15))
    }

    // ============================================================
    // REGISTRATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_register_returns_previous_record() {
        let state = new_state();

        let first = state
            .register("a", strings(&["/foo/bar"]), vec![], json!(0.5))
            .unwrap();
        assert!(first.is_none());

        let second = state
            .register("a", strings(&["/foo/baz"]), vec![], json!(0.7))
            .unwrap();
        assert_eq!(second.unwrap().status, json!(0.5));
        assert_eq!(state.len(), 1);
    }

    #[tokio::test]
    async fn test_register_replaces_services_in_index() {
        let state = new_state();
        state
            .register("a", strings(&["/foo/bar"]), vec![], json!(0))
            .unwrap();
        state
            .register("a", strings(&["/foo/baz"]), vec![], json!(0))
            .unwrap();

        assert!(state.agents_providing("/foo/bar", &[]).is_empty());
        assert_eq!(state.agents_providing("/foo/baz", &[]).len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_status() {
        let state = new_state();
        state
            .register("a", strings(&["/foo/bar"]), vec![], json!(0.1))
            .unwrap();

        let outcome = state.heartbeat("a", json!(3.5)).unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Refreshed);
        assert_eq!(state.lookup("a").unwrap().status, json!(3.5));
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent() {
        let state = new_state();
        let outcome = state.heartbeat("ghost", json!(0)).unwrap();

        assert_eq!(outcome, HeartbeatOutcome::UnknownAgent);
        assert!(state.lookup("ghost").is_none(), "heartbeat must not auto-register");
    }

    #[tokio::test]
    async fn test_heartbeat_after_eviction_stays_evicted() {
        let state = new_state();
        state
            .register("a", strings(&["/foo/bar"]), vec![], json!(0))
            .unwrap();

        assert!(state.evict("a", EvictionReason::Timeout));
        let outcome = state.heartbeat("a", json!(1)).unwrap();

        assert_eq!(outcome, HeartbeatOutcome::UnknownAgent);
        assert!(state.lookup("a").is_none());
        assert!(state.agents_providing("/foo/bar", &[]).is_empty());
    }

    #[test]
    fn test_concurrent_heartbeats_never_resurrect_an_evicted_agent() {
        let state = new_state();
        state
            .register("a", strings(&["/foo/bar"]), vec![], json!(0))
            .unwrap();

        let beating = state.clone();
        let heartbeats = std::thread::spawn(move || {
            for n in 0..10_000 {
                let _ = beating.heartbeat("a", json!(n));
            }
        });
        let evicting = state.clone();
        let eviction = std::thread::spawn(move || evicting.evict("a", EvictionReason::Timeout));

        heartbeats.join().unwrap();
        assert!(eviction.join().unwrap());

        assert!(state.lookup("a").is_none());
        assert!(state.agents_providing("/foo/bar", &[]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_all_refreshes_stale_records() {
        let state = new_state();
        state
            .register("a", strings(&["/svc/run"]), vec![], json!(0))
            .unwrap();
        state
            .register("b", strings(&["/svc/run"]), vec![], json!(0))
            .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(state.touch_all(Instant::now()).unwrap(), 2);

        let live = state.live_agents_providing("/svc/run", &[], Instant::now());
        assert_eq!(live.len(), 2);
        assert_eq!(state.len(), 2);
    }

    // ============================================================
    // LOOKUP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_agents_providing_filters_by_all_tags() {
        let state = new_state();
        state
            .register("a", strings(&["/svc/run"]), strings(&["gpu", "eu"]), json!(0))
            .unwrap();
        state
            .register("b", strings(&["/svc/run"]), strings(&["gpu"]), json!(0))
            .unwrap();
        state
            .register("c", strings(&["/svc/other"]), strings(&["gpu", "eu"]), json!(0))
            .unwrap();

        let all: Vec<String> = state
            .agents_providing("/svc/run", &[])
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(all, strings(&["a", "b"]));

        let gpu_eu: Vec<String> = state
            .agents_providing("/svc/run", &strings(&["gpu", "eu"]))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(gpu_eu, strings(&["a"]));

        assert!(state.agents_providing("/svc/missing", &[]).is_empty());
    }

    #[test]
    fn test_agent_record_load() {
        let mut record = AgentRecord::new(vec![], vec![], json!(1.25));
        assert_eq!(record.load(), 1.25);

        record.status = json!("0.5");
        assert_eq!(record.load(), 0.5);

        record.status = json!("busy");
        assert!(record.load().is_infinite());
    }

    // ============================================================
    // EVICTION TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_lazy_eviction_is_idempotent() {
        let state = new_state();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        state.on_eviction(Arc::new(move |_, reason| {
            assert_eq!(reason, EvictionReason::Timeout);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        state
            .register("x", strings(&["/svc/run"]), vec![], json!(0))
            .unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;

        let first = state.live_agents_providing("/svc/run", &[], Instant::now());
        assert!(first.is_empty());
        assert!(state.lookup("x").is_none());

        let second = state.live_agents_providing("/svc/run", &[], Instant::now());
        assert!(second.is_empty());
        assert!(!state.evict("x", EvictionReason::Timeout));

        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_agents_survive_selection() {
        let state = new_state();
        state
            .register("x", strings(&["/svc/run"]), vec![], json!(0))
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        state.heartbeat("x", json!(0)).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let live = state.live_agents_providing("/svc/run", &[], Instant::now());
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_clears_indices() {
        let state = new_state();
        state
            .register("a", strings(&["/svc/run"]), strings(&["gpu"]), json!(0))
            .unwrap();

        assert!(state.unregister("a"));
        assert!(!state.unregister("a"));
        assert!(state.agents_providing("/svc/run", &[]).is_empty());
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_merge_deletes_absent_and_upserts_present() {
        let state = new_state();
        state.register("keep", strings(&["/svc/a"]), vec![], json!(0)).unwrap();
        state.register("drop", strings(&["/svc/a"]), vec![], json!(0)).unwrap();

        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = reasons.clone();
        state.on_eviction(Arc::new(move |id, reason| {
            seen.lock().push((id.to_string(), reason));
        }));

        let mut incoming = BTreeMap::new();
        incoming.insert(
            "keep".to_string(),
            AgentRecord::new(strings(&["/svc/b"]), vec![], json!(2)),
        );
        incoming.insert(
            "new".to_string(),
            AgentRecord::new(strings(&["/svc/a"]), vec![], json!(1)),
        );

        let summary = state.merge(incoming).unwrap();

        assert_eq!(summary.upserted, 2);
        assert_eq!(summary.removed, 1);
        assert_eq!(state.identities(), strings(&["keep", "new"]));
        assert_eq!(state.lookup("keep").unwrap().status, json!(2));
        assert_eq!(
            reasons.lock().as_slice(),
            &[("drop".to_string(), EvictionReason::Remote)]
        );
    }

    // ============================================================
    // PERSISTENCE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents");

        {
            let state = ClusterState::new(
                Box::new(SledStore::open(&path).unwrap()),
                Duration::from_secs(15),
            );
            state
                .register("a", strings(&["/svc/run"]), strings(&["gpu"]), json!(0.3))
                .unwrap();
        }

        let reopened = ClusterState::new(
            Box::new(SledStore::open(&path).unwrap()),
            Duration::from_secs(15),
        );

        let record = reopened.lookup("a").unwrap();
        assert_eq!(record.status, json!(0.3));
        assert!(record.last_seen.is_some());
        assert_eq!(reopened.agents_providing("/svc/run", &strings(&["gpu"])).len(), 1);
    }
}
