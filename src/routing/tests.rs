//! Routing Tests
//!
//! ## Test Scopes
//! - **Policies**: round-robin fairness, least-loaded determinism, tags.
//! - **Requests**: explicit targets and the default selector.
//! - **Liveness**: selection evicts timed-out members exactly once.

#[cfg(test)]
mod tests {
    use crate::cluster::{ClusterState, MemoryStore};
    use crate::packet::Request;
    use crate::routing::{DEFAULT_SELECTOR, RoutingPolicy, Selector};
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SERVICE: &str = "/foo/bar";

    fn cluster_with(agents: &[(&str, Value)]) -> Arc<ClusterState> {
        let cluster = ClusterState::new(Box::new(MemoryStore::new()), Duration::from_secs(15));
        for (identity, status) in agents {
            cluster
                .register(identity, vec![SERVICE.to_string()], vec![], status.clone())
                .unwrap();
        }
        cluster
    }

    // ============================================================
    // POLICIES
    // ============================================================

    #[tokio::test]
    async fn test_round_robin_cycles_twice_in_order() {
        let cluster = cluster_with(&[
            ("c1", json!(0)),
            ("c2", json!(0)),
            ("c3", json!(0)),
            ("c4", json!(0)),
        ]);
        let policy = RoutingPolicy::new(cluster);

        let picks: Vec<String> = (0..8)
            .flat_map(|_| policy.round_robin(SERVICE, &[]))
            .collect();

        assert_eq!(picks, vec!["c1", "c2", "c3", "c4", "c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_round_robin_wraps_when_candidates_shrink() {
        let cluster = cluster_with(&[("c1", json!(0)), ("c2", json!(0)), ("c3", json!(0))]);
        let policy = RoutingPolicy::new(cluster.clone());

        policy.round_robin(SERVICE, &[]);
        policy.round_robin(SERVICE, &[]);
        cluster.unregister("c3");
        cluster.unregister("c2");

        assert_eq!(policy.round_robin(SERVICE, &[]), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_round_robin_cursors_are_per_service() {
        let cluster = cluster_with(&[("c1", json!(0)), ("c2", json!(0))]);
        cluster
            .register("c1", vec![SERVICE.to_string(), "/other".to_string()], vec![], json!(0))
            .unwrap();
        let policy = RoutingPolicy::new(cluster);

        assert_eq!(policy.round_robin(SERVICE, &[]), vec!["c1"]);
        assert_eq!(policy.round_robin("/other", &[]), vec!["c1"]);
        assert_eq!(policy.round_robin(SERVICE, &[]), vec!["c2"]);
    }

    #[tokio::test]
    async fn test_least_loaded_picks_minimum() {
        let cluster = cluster_with(&[
            ("a", json!(0.21)),
            ("b", json!(1.99)),
            ("c", json!(0.5)),
            ("d", json!(2.01)),
        ]);
        let policy = RoutingPolicy::new(cluster);

        assert_eq!(policy.least_loaded(SERVICE, &[]), vec!["a"]);
    }

    #[tokio::test]
    async fn test_least_loaded_tie_goes_to_first() {
        let cluster = cluster_with(&[("b", json!(1)), ("a", json!(1)), ("c", json!("busy"))]);
        let policy = RoutingPolicy::new(cluster);

        assert_eq!(policy.least_loaded(SERVICE, &[]), vec!["a"]);
    }

    #[tokio::test]
    async fn test_random_picks_a_provider() {
        let cluster = cluster_with(&[("a", json!(0)), ("b", json!(0))]);
        let policy = RoutingPolicy::new(cluster);

        let seen: HashSet<String> = (0..32)
            .flat_map(|_| policy.random(SERVICE, &[]))
            .collect();

        assert!(!seen.is_empty());
        assert!(seen.iter().all(|id| id == "a" || id == "b"));
    }

    #[tokio::test]
    async fn test_empty_service_selects_nothing() {
        let policy = RoutingPolicy::new(cluster_with(&[]));

        for selector in [
            Selector::All,
            Selector::Random,
            Selector::LeastLoaded,
            Selector::RoundRobin,
        ] {
            assert!(policy.select(selector, SERVICE, &[]).is_empty());
        }
    }

    #[tokio::test]
    async fn test_tags_narrow_candidates() {
        let cluster = cluster_with(&[("plain", json!(0))]);
        cluster
            .register("tagged", vec![SERVICE.to_string()], vec!["gpu".to_string()], json!(5))
            .unwrap();
        let policy = RoutingPolicy::new(cluster);

        let tags = vec!["gpu".to_string()];
        assert_eq!(policy.all(SERVICE, &tags), vec!["tagged"]);
        assert_eq!(policy.least_loaded(SERVICE, &tags), vec!["tagged"]);
        assert_eq!(policy.all(SERVICE, &[]).len(), 2);
    }

    // ============================================================
    // REQUESTS
    // ============================================================

    #[tokio::test]
    async fn test_explicit_target_bypasses_policies() {
        let policy = RoutingPolicy::new(cluster_with(&[("a", json!(0))]));
        let request = Request::new(SERVICE, json!(null), "caller")
            .with_target("not-registered")
            .with_selector(Selector::All);

        assert_eq!(policy.targets_for(&request), vec!["not-registered"]);
    }

    #[tokio::test]
    async fn test_missing_selector_defaults_to_least_loaded() {
        assert_eq!(DEFAULT_SELECTOR, Selector::LeastLoaded);

        let policy = RoutingPolicy::new(cluster_with(&[("busy", json!(3)), ("idle", json!(0.1))]));
        let request = Request::new(SERVICE, json!(null), "caller");

        assert_eq!(policy.targets_for(&request), vec!["idle"]);
    }

    #[test]
    fn test_selector_names() {
        for name in ["least_loaded", "random", "all", "rr"] {
            let selector: Selector = name.parse().unwrap();
            assert_eq!(selector.as_str(), name);
            assert_eq!(serde_json::to_value(selector).unwrap(), json!(name));
        }
        assert!("fastest".parse::<Selector>().is_err());
    }

    // ============================================================
    // LIVENESS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_selection_evicts_timed_out_agent_once() {
        let cluster = cluster_with(&[("x", json!(0))]);
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        cluster.on_eviction(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let policy = RoutingPolicy::new(cluster.clone());

        tokio::time::advance(Duration::from_secs(16)).await;

        assert!(policy.all(SERVICE, &[]).is_empty());
        assert!(!cluster.contains("x"));
        assert!(policy.least_loaded(SERVICE, &[]).is_empty());
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }
}
