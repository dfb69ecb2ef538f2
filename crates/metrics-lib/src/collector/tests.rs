//! Collection pass tests
//!
//! These tests drive the scheduler with fake collaborators so that device
//! failures, resolver failures and reset timing can be exercised without
//! GPUs or a kubelet.

#[cfg(test)]
mod collection_pass_tests {
    use crate::collector::{
        CollectionScheduler, CollectionSchedulerBuilder, ContainerDeviceResolver,
        DeviceStatusProvider,
    };
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::models::{ContainerDeviceMap, ContainerId, DeviceHandle, DeviceStatus};
    use crate::observability::AgentMetrics;
    use crate::registry::{MetricsRegistry, DUTY_CYCLE, MEMORY_TOTAL, MEMORY_USED, REQUEST};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    struct FakeGpu {
        uuid: String,
        model: String,
        memory_used_mib: u64,
        memory_total_mib: u64,
        duty_cycle: u32,
    }

    /// Device provider backed by a fixed table, with per-device failure knobs
    #[derive(Default)]
    struct FakeDevices {
        gpus: HashMap<String, FakeGpu>,
        failing_status: HashSet<String>,
        failing_duty_cycle: HashSet<String>,
        slow: HashSet<String>,
    }

    impl FakeDevices {
        fn with_gpu(mut self, name: &str, model: &str, used: u64, total: u64, duty: u32) -> Self {
            self.gpus.insert(
                name.to_string(),
                FakeGpu {
                    uuid: format!("GPU-{}", name),
                    model: model.to_string(),
                    memory_used_mib: used,
                    memory_total_mib: total,
                    duty_cycle: duty,
                },
            );
            self
        }

        fn failing_status(mut self, name: &str) -> Self {
            self.failing_status.insert(name.to_string());
            self
        }

        fn failing_duty_cycle(mut self, name: &str) -> Self {
            self.failing_duty_cycle.insert(format!("GPU-{}", name));
            self
        }

        fn slow(mut self, name: &str) -> Self {
            self.slow.insert(name.to_string());
            self
        }
    }

    #[async_trait]
    impl DeviceStatusProvider for FakeDevices {
        async fn device(&self, device_id: &str) -> Result<DeviceHandle> {
            if self.slow.contains(device_id) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            let gpu = self
                .gpus
                .get(device_id)
                .ok_or_else(|| anyhow!("device {} not found", device_id))?;
            Ok(DeviceHandle {
                name: device_id.to_string(),
                uuid: gpu.uuid.clone(),
                model: gpu.model.clone(),
            })
        }

        async fn status(&self, device: &DeviceHandle) -> Result<DeviceStatus> {
            if self.failing_status.contains(&device.name) {
                return Err(anyhow!("GPU is lost"));
            }
            let gpu = &self.gpus[&device.name];
            Ok(DeviceStatus {
                memory_total_mib: gpu.memory_total_mib,
                memory_used_mib: gpu.memory_used_mib,
            })
        }

        async fn average_utilization(&self, uuid: &str, window: Duration) -> Result<u32> {
            assert_eq!(window, Duration::from_secs(10));
            if self.failing_duty_cycle.contains(uuid) {
                return Err(anyhow!("no utilization samples"));
            }
            self.gpus
                .values()
                .find(|gpu| gpu.uuid == uuid)
                .map(|gpu| gpu.duty_cycle)
                .ok_or_else(|| anyhow!("unknown uuid {}", uuid))
        }
    }

    /// Resolver whose answer can be swapped between passes; `None` fails
    struct FakeResolver {
        answer: Mutex<Option<ContainerDeviceMap>>,
        calls: AtomicUsize,
    }

    impl FakeResolver {
        fn new(map: ContainerDeviceMap) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(map)),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, map: ContainerDeviceMap) {
            *self.answer.lock().unwrap() = Some(map);
        }

        fn fail(&self) {
            *self.answer.lock().unwrap() = None;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContainerDeviceResolver for FakeResolver {
        async fn devices_for_all_containers(&self) -> Result<ContainerDeviceMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow!("kubelet socket unavailable"))
        }
    }

    fn container_a() -> ContainerId {
        ContainerId::new("default", "pod-a", "cuda")
    }

    fn container_b() -> ContainerId {
        ContainerId::new("ml", "trainer-0", "main")
    }

    fn assignment(entries: Vec<(ContainerId, Vec<&str>)>) -> ContainerDeviceMap {
        entries
            .into_iter()
            .map(|(id, devices)| (id, devices.into_iter().map(String::from).collect()))
            .collect()
    }

    fn device_labels<'a>(
        container: &'a ContainerId,
        uuid: &'a str,
        model: &'a str,
    ) -> Vec<(&'a str, &'a str)> {
        vec![
            ("namespace", container.namespace.as_str()),
            ("pod", container.pod.as_str()),
            ("container", container.container.as_str()),
            ("make", "nvidia"),
            ("accelerator_id", uuid),
            ("model", model),
        ]
    }

    fn request_labels(container: &ContainerId) -> Vec<(&str, &str)> {
        vec![
            ("namespace", container.namespace.as_str()),
            ("pod", container.pod.as_str()),
            ("container", container.container.as_str()),
            ("resource_name", "nvidia.com/gpu"),
        ]
    }

    fn build(
        devices: FakeDevices,
        resolver: Arc<FakeResolver>,
        registry: &MetricsRegistry,
    ) -> CollectionScheduler {
        CollectionSchedulerBuilder::new()
            .devices(Arc::new(devices))
            .resolver(resolver)
            .registry(registry.clone())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_failure_only_skips_failing_device() {
        let registry = MetricsRegistry::new().unwrap();
        let devices = FakeDevices::default()
            .with_gpu("dev1", "X100", 10, 1000, 7)
            .with_gpu("dev2", "X100", 100, 1000, 42)
            .failing_status("dev1");
        let resolver = FakeResolver::new(assignment(vec![(container_a(), vec!["dev1", "dev2"])]));
        let mut scheduler = build(devices, resolver, &registry);

        let results = scheduler.collect_once().await;

        assert_eq!(results.devices_published, 1);
        assert_eq!(results.device_errors, 1);

        let a = container_a();
        assert_eq!(registry.gauge_value(REQUEST, &request_labels(&a)), Some(2.0));

        let dev2 = device_labels(&a, "GPU-dev2", "X100");
        assert_eq!(registry.gauge_value(MEMORY_USED, &dev2), Some(104_857_600.0));
        assert_eq!(registry.gauge_value(MEMORY_TOTAL, &dev2), Some(1_048_576_000.0));
        assert_eq!(registry.gauge_value(DUTY_CYCLE, &dev2), Some(42.0));

        // Nothing at all was published for dev1
        for family in [DUTY_CYCLE, MEMORY_TOTAL, MEMORY_USED] {
            assert_eq!(registry.series_count(family), 1);
        }
        let dev1 = device_labels(&a, "GPU-dev1", "X100");
        assert_eq!(registry.gauge_value(DUTY_CYCLE, &dev1), None);
    }

    #[tokio::test]
    async fn test_request_counts_all_assigned_devices() {
        let registry = MetricsRegistry::new().unwrap();
        let devices = FakeDevices::default()
            .with_gpu("nvidia0", "Tesla T4", 0, 15_360, 0)
            .with_gpu("nvidia1", "Tesla T4", 0, 15_360, 0);
        // nvidia7 is unknown to the provider, it still counts as requested
        let resolver = FakeResolver::new(assignment(vec![
            (container_a(), vec!["nvidia0", "nvidia1", "nvidia7"]),
            (container_b(), vec![]),
        ]));
        let mut scheduler = build(devices, resolver, &registry);

        let results = scheduler.collect_once().await;

        assert_eq!(results.containers, 2);
        assert_eq!(results.devices_published, 2);
        assert_eq!(
            registry.gauge_value(REQUEST, &request_labels(&container_a())),
            Some(3.0)
        );
        assert_eq!(
            registry.gauge_value(REQUEST, &request_labels(&container_b())),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_duty_cycle_failure_skips_memory_gauges_too() {
        let registry = MetricsRegistry::new().unwrap();
        let devices = FakeDevices::default()
            .with_gpu("nvidia0", "A100", 2048, 40_960, 90)
            .with_gpu("nvidia1", "A100", 1024, 40_960, 15)
            .failing_duty_cycle("nvidia0");
        let resolver = FakeResolver::new(assignment(vec![
            (container_a(), vec!["nvidia0"]),
            (container_b(), vec!["nvidia1"]),
        ]));
        let metrics = AgentMetrics::register(&registry).unwrap();
        let mut scheduler = CollectionSchedulerBuilder::new()
            .devices(Arc::new(devices))
            .resolver(resolver)
            .registry(registry.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        let results = scheduler.collect_once().await;

        assert_eq!(results.device_errors, 1);
        assert_eq!(metrics.collection_errors("duty_cycle"), 1);
        assert_eq!(metrics.collection_errors("device_status"), 0);
        let a_id = container_a();
        let a = device_labels(&a_id, "GPU-nvidia0", "A100");
        assert_eq!(registry.gauge_value(MEMORY_USED, &a), None);
        assert_eq!(registry.gauge_value(MEMORY_TOTAL, &a), None);

        let b_id = container_b();
        let b = device_labels(&b_id, "GPU-nvidia1", "A100");
        assert_eq!(registry.gauge_value(DUTY_CYCLE, &b), Some(15.0));
        assert_eq!(
            registry.gauge_value(MEMORY_USED, &b),
            Some(1024.0 * 1_048_576.0)
        );
    }

    #[tokio::test]
    async fn test_stale_series_survive_until_reset() {
        let registry = MetricsRegistry::new().unwrap();
        let devices = FakeDevices::default()
            .with_gpu("nvidia0", "Tesla T4", 0, 15_360, 5)
            .with_gpu("nvidia1", "Tesla T4", 0, 15_360, 6);
        let resolver = FakeResolver::new(assignment(vec![(container_a(), vec!["nvidia0"])]));
        let mut scheduler = build(devices, resolver.clone(), &registry);

        let t0 = Instant::now();
        scheduler.collect_at(t0).await;

        // Container A goes away, B appears
        resolver.set(assignment(vec![(container_b(), vec!["nvidia1"])]));
        let results = scheduler.collect_at(t0 + Duration::from_secs(30)).await;
        assert!(!results.reset);

        let a_id = container_a();
        let b_id = container_b();
        let a = device_labels(&a_id, "GPU-nvidia0", "Tesla T4");
        let b = device_labels(&b_id, "GPU-nvidia1", "Tesla T4");
        assert_eq!(registry.gauge_value(DUTY_CYCLE, &a), Some(5.0));
        assert_eq!(registry.gauge_value(DUTY_CYCLE, &b), Some(6.0));

        // Past the reset interval the stale container is evicted
        let results = scheduler.collect_at(t0 + Duration::from_secs(61)).await;
        assert!(results.reset);
        assert_eq!(registry.gauge_value(DUTY_CYCLE, &a), None);
        assert_eq!(
            registry.gauge_value(REQUEST, &request_labels(&container_a())),
            None
        );
        assert_eq!(registry.gauge_value(DUTY_CYCLE, &b), Some(6.0));
    }

    #[tokio::test]
    async fn test_reset_happens_even_when_assignment_is_unchanged() {
        let registry = MetricsRegistry::new().unwrap();
        let devices = FakeDevices::default().with_gpu("nvidia0", "Tesla T4", 1, 15_360, 5);
        let resolver = FakeResolver::new(assignment(vec![(container_a(), vec!["nvidia0"])]));
        let mut scheduler = build(devices, resolver, &registry);

        let t0 = Instant::now();
        let first = scheduler.collect_at(t0).await;
        let second = scheduler.collect_at(t0 + Duration::from_secs(61)).await;

        assert!(!first.reset);
        assert!(second.reset);
        // Repopulated after the reset
        assert_eq!(registry.series_count(DUTY_CYCLE), 1);
        assert_eq!(registry.series_count(REQUEST), 1);
    }

    #[tokio::test]
    async fn test_resolver_failure_skips_pass_and_keeps_values() {
        let registry = MetricsRegistry::new().unwrap();
        let health = HealthRegistry::new();
        let devices = FakeDevices::default().with_gpu("nvidia0", "Tesla T4", 1, 15_360, 5);
        let resolver = FakeResolver::new(assignment(vec![(container_a(), vec!["nvidia0"])]));
        let mut scheduler = CollectionSchedulerBuilder::new()
            .devices(Arc::new(devices))
            .resolver(resolver.clone())
            .registry(registry.clone())
            .health(health.clone())
            .build()
            .unwrap();

        let t0 = Instant::now();
        scheduler.collect_at(t0).await;
        resolver.fail();
        let results = scheduler.collect_at(t0 + Duration::from_secs(10)).await;

        assert!(results.skipped);
        assert_eq!(results.containers, 0);
        assert_eq!(registry.series_count(DUTY_CYCLE), 1);
        assert_eq!(
            health.status(components::RESOLVER).await,
            Some(ComponentStatus::Degraded)
        );

        // Next successful pass recovers without intervention
        resolver.set(assignment(vec![(container_a(), vec!["nvidia0"])]));
        let results = scheduler.collect_at(t0 + Duration::from_secs(20)).await;
        assert!(!results.skipped);
        assert_eq!(
            health.status(components::RESOLVER).await,
            Some(ComponentStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn test_device_query_timeout_isolates_hanging_device() {
        let registry = MetricsRegistry::new().unwrap();
        let devices = FakeDevices::default()
            .with_gpu("nvidia0", "Tesla T4", 1, 15_360, 5)
            .with_gpu("nvidia1", "Tesla T4", 2, 15_360, 6)
            .slow("nvidia0");
        let resolver = FakeResolver::new(assignment(vec![(container_a(), vec!["nvidia0", "nvidia1"])]));
        let mut scheduler = CollectionSchedulerBuilder::new()
            .devices(Arc::new(devices))
            .resolver(resolver)
            .registry(registry.clone())
            .device_query_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let results = scheduler.collect_once().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.device_errors, 1);
        assert_eq!(results.devices_published, 1);
        let a_id = container_a();
        let nvidia1 = device_labels(&a_id, "GPU-nvidia1", "Tesla T4");
        assert_eq!(registry.gauge_value(DUTY_CYCLE, &nvidia1), Some(6.0));
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let registry = MetricsRegistry::new().unwrap();
        let devices = FakeDevices::default().with_gpu("nvidia0", "Tesla T4", 1, 15_360, 5);
        let resolver = FakeResolver::new(assignment(vec![(container_a(), vec!["nvidia0"])]));
        let scheduler = CollectionSchedulerBuilder::new()
            .devices(Arc::new(devices))
            .resolver(resolver.clone())
            .registry(registry.clone())
            .interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();

        let calls = resolver.calls();
        assert!(calls >= 1);
        assert_eq!(registry.series_count(REQUEST), 1);

        // No further passes once stopped
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resolver.calls(), calls);
    }
}
