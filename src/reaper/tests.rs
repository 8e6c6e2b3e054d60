#[cfg(test)]
mod tests {
    use crate::reaper::{Reaper, TimeoutCallback};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting(counter: Arc<AtomicUsize>, evict: bool) -> TimeoutCallback {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            evict
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_removed() {
        let reaper = Reaper::new(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        reaper.register("a", Duration::from_secs(5), counting(fired.clone(), true));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(reaper.sweep(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reaper.sweep(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!reaper.contains("a"));

        assert_eq!(reaper.sweep(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declining_callback_keeps_entry() {
        let reaper = Reaper::new(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        reaper.register("a", Duration::from_secs(1), counting(fired.clone(), false));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reaper.sweep(), 0);
        assert_eq!(reaper.sweep(), 0);

        assert!(reaper.contains("a"));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_resets_deadline() {
        let reaper = Reaper::new(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        reaper.register("a", Duration::from_secs(5), counting(fired.clone(), true));

        tokio::time::advance(Duration::from_secs(4)).await;
        reaper.update("a", Duration::from_secs(5), counting(fired.clone(), true));
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(reaper.sweep(), 0);
        assert!(reaper.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_registers_unknown_id() {
        let reaper = Reaper::new(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));

        reaper.update("early", Duration::from_secs(3), counting(fired, true));

        assert!(reaper.contains("early"));
        assert_eq!(reaper.ttl("early"), Some(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_prevents_callback() {
        let reaper = Reaper::new(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        reaper.register("a", Duration::from_secs(1), counting(fired.clone(), true));

        assert!(reaper.unregister("a"));
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(reaper.sweep(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_during_callback_wins() {
        let reaper = Reaper::new(Duration::from_secs(2));
        let slot: Arc<Mutex<Option<Arc<Reaper>>>> = Arc::new(Mutex::new(None));
        let refreshed = Arc::new(AtomicBool::new(false));

        let slot_clone = slot.clone();
        let refreshed_clone = refreshed.clone();
        let callback: TimeoutCallback = Arc::new(move |id| {
            // Simulate a heartbeat landing between snapshot and removal.
            if !refreshed_clone.swap(true, Ordering::SeqCst)
                && let Some(reaper) = slot_clone.lock().clone()
            {
                reaper.update(id, Duration::from_secs(10), Arc::new(|_| true));
            }
            true
        });

        reaper.register("a", Duration::from_secs(1), callback);
        *slot.lock() = Some(reaper.clone());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reaper.sweep(), 0);
        assert!(reaper.contains("a"));

        *slot.lock() = None;
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_that_unregisters_counts_as_removed() {
        let reaper = Reaper::new(Duration::from_secs(2));
        let slot: Arc<Mutex<Option<Arc<Reaper>>>> = Arc::new(Mutex::new(None));

        let slot_clone = slot.clone();
        let callback: TimeoutCallback = Arc::new(move |id| {
            if let Some(reaper) = slot_clone.lock().clone() {
                reaper.unregister(id);
            }
            true
        });

        reaper.register("a", Duration::from_secs(1), callback);
        *slot.lock() = Some(reaper.clone());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reaper.sweep(), 1);
        assert!(!reaper.contains("a"));

        *slot.lock() = None;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_runs_periodically() {
        let reaper = Reaper::new(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        reaper.register("a", Duration::from_secs(3), counting(fired.clone(), true));

        let handle = reaper.clone().spawn();
        tokio::time::sleep(Duration::from_secs(7)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(reaper.is_empty());
        handle.abort();
    }
}
