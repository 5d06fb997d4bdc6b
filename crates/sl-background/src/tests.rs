//! Behaviour tests for the background service

#[cfg(test)]
mod service_tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use insta::assert_yaml_snapshot;
    use serde_json::json;
    use sl_core::{
        AnalysisRequest, ChangeNotifier, CleanupTarget, Error, MemoryProbe, MemoryReading,
        QualityLevel, QualityResult, Result, Scorer,
    };
    use sl_scoring::ScoringEngine;
    use sl_store::{MemoryStore, ResultCache};

    use crate::{
        AnalysisRequestQueue, BackgroundService, MemoryMonitor, MemoryMonitorConfig, QueueConfig,
        ServiceComponents, ServiceConfig,
    };

    const MB: u64 = 1024 * 1024;

    /// Scorer that takes a while and counts its invocations
    #[derive(Default)]
    struct SlowScorer {
        started: Mutex<Vec<String>>,
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay_ms: u64,
    }

    impl SlowScorer {
        fn with_delay(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Scorer for SlowScorer {
        fn score(&self, text: &str) -> Result<QualityResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.lock().unwrap().push(text.to_string());
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            self.running.fetch_sub(1, Ordering::SeqCst);

            Ok(QualityResult {
                overall_score: 50,
                quality_level: QualityLevel::Fair,
                summary: format!("Scored {} characters.", text.len()),
                missing_info: vec![],
                recommendations: vec![],
            })
        }
    }

    struct FailingScorer;

    impl Scorer for FailingScorer {
        fn score(&self, _text: &str) -> Result<QualityResult> {
            Err(Error::Scoring("vocabulary unavailable".to_string()))
        }
    }

    struct PanickingScorer;

    impl Scorer for PanickingScorer {
        fn score(&self, _text: &str) -> Result<QualityResult> {
            panic!("scorer blew up")
        }
    }

    /// Probe reporting a fixed usage against a 100 MB limit
    struct FixedProbe {
        used_mb: Mutex<Option<u64>>,
    }

    impl FixedProbe {
        fn at(used_mb: u64) -> Self {
            Self {
                used_mb: Mutex::new(Some(used_mb)),
            }
        }

        fn unavailable() -> Self {
            Self {
                used_mb: Mutex::new(None),
            }
        }
    }

    impl MemoryProbe for FixedProbe {
        fn read(&self) -> Option<MemoryReading> {
            let used_mb = (*self.used_mb.lock().unwrap())?;
            Some(MemoryReading {
                used_bytes: used_mb * MB,
                total_bytes: 90 * MB,
                limit_bytes: 100 * MB,
            })
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Slow,
    }

    struct TestTarget {
        name: &'static str,
        behaviour: Behaviour,
        runs: AtomicUsize,
    }

    impl TestTarget {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                runs: AtomicUsize::new(0),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CleanupTarget for TestTarget {
        fn name(&self) -> &str {
            self.name
        }

        async fn cleanup(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(Error::Cleanup(format!("{} refused", self.name))),
                Behaviour::Panic => panic!("{} panicked", self.name),
                Behaviour::Slow => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }
            }
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        watches: AtomicUsize,
        stops: AtomicUsize,
        watching: AtomicBool,
    }

    #[async_trait]
    impl ChangeNotifier for CountingNotifier {
        async fn watch(&self) -> Result<()> {
            self.watches.fetch_add(1, Ordering::SeqCst);
            self.watching.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_all(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.watching.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue_with(scorer: Arc<dyn Scorer>, config: QueueConfig) -> (AnalysisRequestQueue, ResultCache) {
        let cache = ResultCache::new(Arc::new(MemoryStore::new()));
        (AnalysisRequestQueue::new(scorer, cache.clone(), &config), cache)
    }

    fn request(id: &str, text: &str) -> AnalysisRequest {
        AnalysisRequest::new(id, text, "project", "on_track")
    }

    fn monitor_with(
        probe: Arc<dyn MemoryProbe>,
        targets: Vec<Arc<dyn CleanupTarget>>,
        config: MemoryMonitorConfig,
    ) -> Arc<MemoryMonitor> {
        Arc::new(MemoryMonitor::new(probe, targets, &config))
    }

    fn service_with(probe: Arc<dyn MemoryProbe>, notifier: Arc<CountingNotifier>) -> BackgroundService {
        let components = ServiceComponents {
            store: Arc::new(MemoryStore::new()),
            scorer: Arc::new(ScoringEngine::new()),
            notifier,
            probe,
            cleanup_targets: vec![],
            mirror: None,
        };
        BackgroundService::with_components(ServiceConfig::default(), components)
    }

    // Analysis queue

    #[tokio::test]
    async fn test_identical_requests_share_one_analysis() {
        let scorer = Arc::new(SlowScorer::with_delay(150));
        let (queue, _) = queue_with(scorer.clone(), QueueConfig::default());

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let queue = queue.clone();
                let request = request(&format!("u-{}", i), "Shipped the importer");
                tokio::spawn(async move { queue.submit(request).await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(scorer.calls(), 1);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(queue.in_flight(), 0);

        let stats = queue.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.analyses, 1);
        assert_eq!(stats.cache_hits + stats.coalesced, 4);
    }

    #[tokio::test]
    async fn test_cached_result_skips_scoring() {
        let scorer = Arc::new(SlowScorer::with_delay(0));
        let (queue, cache) = queue_with(scorer.clone(), QueueConfig::default());

        let first = queue.submit(request("u-1", "Rolled out the fix")).await.unwrap();
        let second = queue.submit(request("u-2", "Rolled out the fix")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(scorer.calls(), 1);
        assert_eq!(queue.stats().cache_hits, 1);
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_state_is_part_of_the_fingerprint() {
        let scorer = Arc::new(SlowScorer::with_delay(0));
        let (queue, _) = queue_with(scorer.clone(), QueueConfig::default());

        queue
            .submit(AnalysisRequest::new("u-1", "Same words", "project", "on_track"))
            .await
            .unwrap();
        queue
            .submit(AnalysisRequest::new("u-2", "Same words", "project", "at_risk"))
            .await
            .unwrap();

        assert_eq!(scorer.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let scorer = Arc::new(SlowScorer::with_delay(60));
        let config = QueueConfig {
            max_concurrent: 2,
            ..Default::default()
        };
        let (queue, _) = queue_with(scorer.clone(), config);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let queue = queue.clone();
                let request = request(&format!("u-{}", i), &format!("Distinct update number {}", i));
                tokio::spawn(async move { queue.submit(request).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(scorer.calls(), 6);
        assert!(scorer.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failed_analysis_is_not_cached() {
        let (queue, cache) = queue_with(Arc::new(FailingScorer), QueueConfig::default());

        let err = queue.submit(request("u-1", "Anything")).await.unwrap_err();
        assert!(matches!(err, Error::Scoring(_)));
        assert!(cache.is_empty().await.unwrap());
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_scorer_still_answers() {
        let (queue, _) = queue_with(Arc::new(PanickingScorer), QueueConfig::default());

        let err = queue.submit(request("u-1", "Anything")).await.unwrap_err();
        assert!(err.to_string().contains("scoring task panicked"));
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_slow_analysis_times_out() {
        let config = QueueConfig {
            max_concurrent: 1,
            analysis_timeout: Some(Duration::from_millis(50)),
        };
        let (queue, cache) = queue_with(Arc::new(SlowScorer::with_delay(500)), config);

        let err = queue.submit(request("u-1", "Slow one")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_timed_out_run_keeps_fingerprint_and_slot() {
        let scorer = Arc::new(SlowScorer::with_delay(300));
        let config = QueueConfig {
            max_concurrent: 1,
            analysis_timeout: Some(Duration::from_millis(50)),
        };
        let (queue, cache) = queue_with(scorer.clone(), config);

        let first = queue.submit(request("u-1", "Slow one")).await;
        assert!(matches!(first, Err(Error::Timeout(_))));
        assert_eq!(queue.in_flight(), 1);

        // Joins the scorer that is still running instead of starting another
        let second = queue.submit(request("u-2", "Slow one")).await;
        assert!(second.is_ok());
        assert_eq!(scorer.calls(), 1);
        assert_eq!(cache.len().await.unwrap(), 1);

        let third = queue.submit(request("u-3", "Another slow one")).await;
        assert!(matches!(third, Err(Error::Timeout(_))));
        let fourth = queue.submit(request("u-4", "Yet another slow one")).await;
        assert!(matches!(fourth, Err(Error::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(scorer.calls(), 3);
        assert_eq!(scorer.peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_follows_arrival_order() {
        let scorer = Arc::new(SlowScorer::with_delay(150));
        let config = QueueConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let (queue, _) = queue_with(scorer.clone(), config);

        let mut handles = Vec::new();
        for i in 0..5 {
            let submitter = queue.clone();
            let request = request(&format!("u-{}", i), &format!("Update number {}", i));
            handles.push(tokio::spawn(async move { submitter.submit(request).await }));
            while queue.in_flight() <= i {
                tokio::task::yield_now().await;
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let started = scorer.started.lock().unwrap().clone();
        let expected: Vec<String> = (0..5).map(|i| format!("Update number {}", i)).collect();
        assert_eq!(started, expected);
        assert_eq!(scorer.peak.load(Ordering::SeqCst), 1);
    }

    // Memory monitor

    #[tokio::test]
    async fn test_abandoned_cleanup_releases_guard() {
        let slow = TestTarget::new("slow", Behaviour::Slow);
        let monitor = monitor_with(
            Arc::new(FixedProbe::at(10)),
            vec![slow.clone() as Arc<dyn CleanupTarget>],
            MemoryMonitorConfig::default(),
        );

        let pass = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.cleanup().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pass.abort();
        assert!(pass.await.unwrap_err().is_cancelled());

        let report = monitor.cleanup().await;
        assert!(!report.skipped);
        assert_eq!(slow.runs(), 2);
    }

    #[tokio::test]
    async fn test_usage_above_threshold_cleans_once() {
        let target = TestTarget::new("cache", Behaviour::Succeed);
        let monitor = monitor_with(
            Arc::new(FixedProbe::at(81)),
            vec![target.clone() as Arc<dyn CleanupTarget>],
            MemoryMonitorConfig::default(),
        );
        let alerts = Arc::new(AtomicUsize::new(0));
        let seen = alerts.clone();
        monitor.on_high_memory(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let sample = monitor.check_memory().await.unwrap();

        assert_eq!(sample.percentage, 81.0);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
        assert_eq!(target.runs(), 1);
        assert!(monitor.last_cleanup().is_some());
    }

    #[tokio::test]
    async fn test_usage_below_threshold_does_not_clean() {
        let target = TestTarget::new("cache", Behaviour::Succeed);
        let monitor = monitor_with(
            Arc::new(FixedProbe::at(79)),
            vec![target.clone() as Arc<dyn CleanupTarget>],
            MemoryMonitorConfig::default(),
        );

        monitor.check_memory().await.unwrap();

        assert_eq!(target.runs(), 0);
        assert!(monitor.last_cleanup().is_none());
        assert_eq!(monitor.history().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_targets_do_not_block_the_rest() {
        let failing = TestTarget::new("model", Behaviour::Fail);
        let panicking = TestTarget::new("mirror", Behaviour::Panic);
        let healthy = TestTarget::new("cache", Behaviour::Succeed);
        let monitor = monitor_with(
            Arc::new(FixedProbe::at(10)),
            vec![failing.clone() as Arc<dyn CleanupTarget>, panicking.clone(), healthy.clone()],
            MemoryMonitorConfig::default(),
        );

        let report = monitor.cleanup().await;

        assert_yaml_snapshot!(report, @r###"
        ---
        skipped: false
        cleaned:
          - cache
        failed:
          - model
          - mirror
        "###);
        assert_eq!(healthy.runs(), 1);

        // The guard is released even after a panicking step
        assert!(!monitor.cleanup().await.skipped);
    }

    #[tokio::test]
    async fn test_overlapping_cleanups_run_once() {
        let slow = TestTarget::new("slow", Behaviour::Slow);
        let monitor = monitor_with(
            Arc::new(FixedProbe::at(10)),
            vec![slow.clone() as Arc<dyn CleanupTarget>],
            MemoryMonitorConfig::default(),
        );

        let (first, second) = tokio::join!(monitor.cleanup(), monitor.cleanup());

        assert!(!first.skipped);
        assert!(second.skipped);
        assert_eq!(slow.runs(), 1);
        assert_eq!(monitor.stats().cleanups, 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = MemoryMonitorConfig {
            history_capacity: 3,
            ..Default::default()
        };
        let monitor = monitor_with(Arc::new(FixedProbe::at(10)), vec![], config);

        for _ in 0..5 {
            monitor.check_memory().await;
        }

        assert_eq!(monitor.history().len(), 3);
        assert_eq!(monitor.stats().history_len, 3);
    }

    #[tokio::test]
    async fn test_interval_change_keeps_history() {
        let monitor = monitor_with(Arc::new(FixedProbe::at(10)), vec![], MemoryMonitorConfig::default());
        monitor.start();
        monitor.check_memory().await;
        monitor.check_memory().await;

        monitor.set_interval(Duration::from_secs(60)).unwrap();

        assert!(monitor.is_running());
        assert_eq!(monitor.interval(), Duration::from_secs(60));
        assert_eq!(monitor.history().len(), 2);

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let monitor = monitor_with(Arc::new(FixedProbe::at(10)), vec![], MemoryMonitorConfig::default());

        assert!(monitor.set_threshold(0.0).is_err());
        assert!(monitor.set_interval(Duration::ZERO).is_err());
        assert!(monitor.set_threshold(65.0).is_ok());
        assert_eq!(monitor.threshold(), 65.0);
    }

    #[tokio::test]
    async fn test_unavailable_probe_skips_sampling() {
        let monitor = monitor_with(Arc::new(FixedProbe::unavailable()), vec![], MemoryMonitorConfig::default());

        assert!(monitor.check_memory().await.is_none());
        assert!(monitor.history().is_empty());
    }

    // Message routing

    #[tokio::test]
    async fn test_ping_response() {
        let service = service_with(Arc::new(FixedProbe::at(10)), Arc::default());

        let response = service.handle_message(json!({"type": "PING"})).await;

        assert_yaml_snapshot!(response, {
            ".timestamp" => "[timestamp]",
        }, @r###"
        ---
        success: true
        message: Pong from background script
        timestamp: "[timestamp]"
        "###);
    }

    #[tokio::test]
    async fn test_analyze_terse_update() {
        let service = service_with(Arc::new(FixedProbe::at(10)), Arc::default());

        let response = service
            .handle_message(json!({
                "type": "ANALYZE_UPDATE_QUALITY",
                "updateId": "u-1",
                "updateText": "Updated something.",
                "updateType": "project",
                "state": "on_track"
            }))
            .await;

        assert_yaml_snapshot!(response, @r###"
        ---
        success: true
        result:
          overallScore: 5
          qualityLevel: poor
          summary: This update needs significantly more detail. Could use more explanation.
          missingInfo:
            - Testing information
            - Performance impact
            - Security considerations
            - Documentation updates
            - Rollback/recovery plan
          recommendations:
            - Add more technical detail and concrete metrics
            - "Consider addressing: Testing information, Performance impact, Security considerations, Documentation updates, Rollback/recovery plan"
            - Provide context about the problem being solved and concrete examples
        "###);
    }

    #[tokio::test]
    async fn test_rejected_messages() {
        let service = service_with(Arc::new(FixedProbe::at(10)), Arc::default());

        let unknown = service.handle_message(json!({"type": "SELF_DESTRUCT"})).await;
        assert_eq!(unknown.error.as_deref(), Some("Unknown message type"));

        for text in [json!(null), json!(""), json!("   ")] {
            let response = service
                .handle_message(json!({"type": "ANALYZE_UPDATE_QUALITY", "updateText": text}))
                .await;
            assert!(!response.success);
            assert_eq!(response.error.as_deref(), Some("No update text provided"));
        }

        let invalid = service
            .handle_message(json!({"type": "SET_MONITORING", "enabled": "sometimes"}))
            .await;
        assert!(invalid.error.unwrap().starts_with("Invalid message: "));
    }

    #[tokio::test]
    async fn test_memory_stats_response() {
        let service = service_with(Arc::new(FixedProbe::at(81)), Arc::default());

        let response = service.handle_message(json!({"type": "GET_MEMORY_STATS"})).await;

        assert_yaml_snapshot!(response, {
            ".stats.timestamp" => "[timestamp]",
        }, @r###"
        ---
        success: true
        stats:
          used: 81.0
          total: 90.0
          limit: 100.0
          percentage: 81.0
          timestamp: "[timestamp]"
        lastCleanup: ~
        "###);

        let response = service.handle_message(json!({"type": "FORCE_CLEANUP"})).await;
        assert!(response.success);
        assert!(service.memory().last_cleanup().is_some());
    }

    #[tokio::test]
    async fn test_memory_stats_unavailable() {
        let service = service_with(Arc::new(FixedProbe::unavailable()), Arc::default());

        let response = service.handle_message(json!({"type": "GET_MEMORY_STATS"})).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_force_cleanup_empties_result_cache() {
        let service = service_with(Arc::new(FixedProbe::at(10)), Arc::default());
        let analyze = json!({"type": "ANALYZE_UPDATE_QUALITY", "updateText": "Fixed the login bug"});

        assert!(service.handle_message(analyze.clone()).await.success);
        assert_eq!(service.cache().len().await.unwrap(), 1);

        service.handle_message(json!({"type": "FORCE_CLEANUP"})).await;
        assert!(service.cache().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_quality_cache() {
        let service = service_with(Arc::new(FixedProbe::at(10)), Arc::default());
        let fingerprint = AnalysisRequest::new("u-1", "Fixed the login bug", "", "").fingerprint();

        service
            .handle_message(json!({"type": "ANALYZE_UPDATE_QUALITY", "updateText": "Fixed the login bug"}))
            .await;
        service
            .handle_message(json!({"type": "ANALYZE_UPDATE_QUALITY", "updateText": "Added the export test"}))
            .await;

        let one = service
            .handle_message(json!({"type": "INVALIDATE_QUALITY_CACHE", "fingerprint": fingerprint}))
            .await;
        assert_eq!(one.evicted, Some(1));

        let rest = service.handle_message(json!({"type": "INVALIDATE_QUALITY_CACHE"})).await;
        assert_eq!(rest.evicted, Some(1));
    }

    #[tokio::test]
    async fn test_monitoring_messages() {
        let notifier = Arc::new(CountingNotifier::default());
        let service = service_with(Arc::new(FixedProbe::at(10)), notifier.clone());

        let status = service.handle_message(json!({"type": "GET_MONITORING_STATUS"})).await;
        assert_eq!(status.active, Some(false));

        for _ in 0..2 {
            let response = service
                .handle_message(json!({"type": "SET_MONITORING", "enabled": true}))
                .await;
            assert_eq!(response.active, Some(true));
        }
        assert_eq!(notifier.watches.load(Ordering::SeqCst), 1);

        let response = service
            .handle_message(json!({"type": "SET_MONITORING", "enabled": false}))
            .await;
        assert_eq!(response.active, Some(false));
        assert!(!notifier.watching.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_launch_and_shutdown() {
        let notifier = Arc::new(CountingNotifier::default());
        let service = service_with(Arc::new(FixedProbe::at(10)), notifier.clone());

        service.launch().await;
        assert!(service.monitor().is_active());
        assert!(service.memory().is_running());

        service.shutdown().await;
        assert!(!service.monitor().is_active());
        assert!(!service.memory().is_running());
        assert_eq!(notifier.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configure_memory_monitor() {
        let service = service_with(Arc::new(FixedProbe::at(10)), Arc::default());

        let response = service
            .handle_message(json!({
                "type": "CONFIGURE_MEMORY_MONITOR",
                "thresholdPercent": 70.0,
                "intervalSeconds": 30
            }))
            .await;
        assert!(response.success);
        assert_eq!(service.memory().threshold(), 70.0);
        assert_eq!(service.memory().interval(), Duration::from_secs(30));

        let response = service
            .handle_message(json!({"type": "CONFIGURE_MEMORY_MONITOR", "thresholdPercent": 250.0}))
            .await;
        assert!(!response.success);
    }
}
