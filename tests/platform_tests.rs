//! Registry, controller and archive lifecycle across engines

use async_trait::async_trait;
use bpm_platform::config::{HistoryLevel, PlatformConfig, ProcessEngineConfig};
use bpm_platform::engine::ProcessEngineController;
use bpm_platform::history::HistoryEventType;
use bpm_platform::platform::{ArchiveProperties, PlatformExtension, ProcessArchive, ProcessEngineRegistry};
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::sync::Arc;

fn process_xml(key: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="{key}" isExecutable="true">
    <startEvent id="start" />
    <userTask id="handle" name="Handle {key}" />
    <endEvent id="end" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="handle" />
    <sequenceFlow id="f2" sourceRef="handle" targetRef="end" />
  </process>
</definitions>"#
    )
}

fn engine_config(name: &str, is_default: bool) -> ProcessEngineConfig {
    ProcessEngineConfig::in_memory(name)
        .with_default(is_default)
        .with_job_executor(false)
}

fn archive(name: &str, key: &str) -> ProcessArchive {
    ProcessArchive::new(name).with_resource(format!("{key}.bpmn"), process_xml(key))
}

#[tokio::test]
async fn test_orders_archive_runs_on_default_engine() {
    let registry = ProcessEngineRegistry::new();
    registry
        .start_platform(PlatformConfig {
            engines: vec![engine_config("default", true).with_history(HistoryLevel::Full)],
        })
        .await
        .unwrap();

    let handle = registry.install_archive(&archive("orders", "order-process")).await.unwrap();
    assert_eq!(handle.process_engine_name, "default");
    let deployment_id = handle.deployment_id.clone().unwrap();

    let controller = registry.default_engine().unwrap();
    assert_eq!(controller.archive_by_definition_key("order-process").unwrap().name(), "orders");
    assert_eq!(
        controller.installed_archives_by_definition_key().get("order-process").map(String::as_str),
        Some("orders")
    );
    assert_eq!(registry.installed_archives(Some("default")).unwrap().len(), 1);

    let engine = controller.process_engine().unwrap();
    let instance = engine
        .runtime()
        .start_process_instance_by_key("order-process", Some("A-1"), Map::new())
        .await
        .unwrap();
    let definition = controller.archive_by_definition_id(&instance.definition_id).await.unwrap();
    assert_eq!(definition.deployment_id(), Some(deployment_id.as_str()));

    let task = engine.runtime().tasks_for_process_instance(&instance.id).remove(0);
    engine.runtime().complete_task(task.id(), Map::new()).await.unwrap();

    let events = engine.history().events_for_process_instance(&instance.id).await.unwrap();
    let types: Vec<HistoryEventType> = events.iter().map(|e| e.event_type()).collect();
    assert!(types.contains(&HistoryEventType::ProcessInstanceStart));
    assert!(types.contains(&HistoryEventType::TaskInstanceComplete));
    assert!(types.contains(&HistoryEventType::ProcessInstanceEnd));

    registry.uninstall_archive("orders").await.unwrap();
    assert!(registry.installed_archives(Some("default")).unwrap().is_empty());
    assert!(controller.archive_by_definition_key("order-process").unwrap_err().is_not_found());
    assert!(controller.installed_archives_by_name().is_empty());
    assert!(controller.installed_archives_by_definition_key().is_empty());

    registry.stop_all().await;
    assert!(registry.engine_names().is_empty());
}

#[tokio::test]
async fn test_archive_for_unknown_engine_is_not_found() {
    let registry = ProcessEngineRegistry::new();
    registry.start_engine(engine_config("default", true)).await.unwrap();

    let err = registry
        .install_archive(&archive("stray", "stray").for_engine("ghost"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("ghost"), "{}", err);
    assert!(registry.archive_names().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_installs_of_same_archive_admit_one() {
    let registry = ProcessEngineRegistry::new();
    registry.start_engine(engine_config("default", true)).await.unwrap();

    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.install_archive(&archive("shared", "shared")).await })
        })
        .collect();

    let mut installed = 0;
    let mut conflicts = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => installed += 1,
            Err(e) if e.is_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((installed, conflicts), (1, 3));
    assert_eq!(registry.archive_names().await, vec!["shared".to_string()]);
}

#[tokio::test]
async fn test_archive_names_are_unique_across_engines() {
    let registry = ProcessEngineRegistry::new();
    registry.start_engine(engine_config("default", true)).await.unwrap();
    registry.start_engine(engine_config("reporting", false)).await.unwrap();

    registry.install_archive(&archive("billing", "invoice")).await.unwrap();
    let err = registry
        .install_archive(&archive("billing", "invoice").for_engine("reporting"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().contains("default"), "{}", err);
    assert!(registry.installed_archives(Some("reporting")).unwrap().is_empty());

    // the first registration is untouched by the rejected install
    let installed = registry.installed_archives(Some("default")).unwrap();
    let names: Vec<&str> = installed.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["billing"]);
    let controller = registry.engine("default").unwrap();
    assert_eq!(
        controller.installed_archives_by_definition_key().get("invoice").map(String::as_str),
        Some("billing")
    );
    assert_eq!(registry.archive_names().await, vec!["billing".to_string()]);
}

#[tokio::test]
async fn test_engine_names_and_default_are_unique() {
    let registry = ProcessEngineRegistry::new();
    registry.start_engine(engine_config("default", true)).await.unwrap();

    let duplicate = registry.start_engine(engine_config("default", false)).await.unwrap_err();
    assert!(duplicate.is_conflict());

    let second_default = registry.start_engine(engine_config("other", true)).await.unwrap_err();
    assert!(second_default.is_lifecycle());
    assert_eq!(registry.engine_names(), vec!["default".to_string()]);

    // a rejected name can be used once the reservation is gone
    registry.start_engine(engine_config("other", false)).await.unwrap();
    assert_eq!(registry.engine_names().len(), 2);
    assert_eq!(registry.default_engine().unwrap().name(), "default");
}

#[tokio::test]
async fn test_failed_install_releases_archive_name() {
    let registry = ProcessEngineRegistry::new();
    registry.start_engine(engine_config("default", true)).await.unwrap();

    let broken = ProcessArchive::new("claims").with_resource(
        "claims.bpmn",
        r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="claim" isExecutable="true">
    <startEvent id="start" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="nowhere" />
  </process>
</definitions>"#,
    );
    let err = registry.install_archive(&broken).await.unwrap_err();
    assert!(err.is_deployment(), "{}", err);
    assert!(err.message_chain().contains("nowhere"), "{}", err.message_chain());
    assert!(registry.archive_names().await.is_empty());

    let handle = registry.install_archive(&archive("claims", "claim")).await.unwrap();
    assert!(handle.deployment_id.is_some());
}

#[tokio::test]
async fn test_uninstall_deletes_deployment_only_when_configured() {
    let registry = ProcessEngineRegistry::new();
    registry.start_engine(engine_config("default", true)).await.unwrap();
    let engine = registry.default_engine().unwrap().process_engine().unwrap();

    registry.install_archive(&archive("kept", "kept")).await.unwrap();
    let cascading = archive("support", "ticket").with_properties(ArchiveProperties {
        delete_upon_undeploy: true,
        ..Default::default()
    });
    registry.install_archive(&cascading).await.unwrap();
    assert_eq!(engine.repository().deployment_count().await.unwrap(), 2);

    registry.uninstall_archive("kept").await.unwrap();
    registry.uninstall_archive("support").await.unwrap();
    assert_eq!(engine.repository().deployment_count().await.unwrap(), 1);

    // the deployment of "kept" survives and can still start instances
    engine
        .runtime()
        .start_process_instance_by_key("kept", None, Map::new())
        .await
        .unwrap();
    let err = engine
        .runtime()
        .start_process_instance_by_key("ticket", None, Map::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{}", err);
}

#[derive(Debug, Default)]
struct RecordingExtension {
    name: String,
    calls: Arc<Mutex<Vec<String>>>,
    veto_start: bool,
    veto_uninstall: bool,
}

impl RecordingExtension {
    fn record(&self, hook: &str) {
        self.calls.lock().push(format!("{}:{}", hook, self.name));
    }
}

#[async_trait]
impl PlatformExtension for RecordingExtension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_engine_start(&self, _controller: &ProcessEngineController) -> anyhow::Result<()> {
        self.record("before_start");
        if self.veto_start {
            anyhow::bail!("{} refuses to start", self.name);
        }
        Ok(())
    }

    async fn after_engine_start(&self, _controller: &ProcessEngineController) -> anyhow::Result<()> {
        self.record("after_start");
        Ok(())
    }

    async fn before_engine_stop(&self, _controller: &ProcessEngineController) -> anyhow::Result<()> {
        self.record("before_stop");
        Ok(())
    }

    async fn after_engine_stop(&self, _controller: &ProcessEngineController) -> anyhow::Result<()> {
        self.record("after_stop");
        Ok(())
    }

    async fn before_archive_uninstall(
        &self,
        _controller: &ProcessEngineController,
        archive: &ProcessArchive,
    ) -> anyhow::Result<()> {
        self.record("before_uninstall");
        if self.veto_uninstall {
            anyhow::bail!("archive {} is pinned", archive.name);
        }
        Ok(())
    }
}

fn recorder(name: &str, calls: &Arc<Mutex<Vec<String>>>) -> RecordingExtension {
    RecordingExtension {
        name: name.to_string(),
        calls: Arc::clone(calls),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_hooks_run_in_order_and_stop_hooks_in_reverse() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let registry = ProcessEngineRegistry::new();
    for name in ["H1", "H2", "H3"] {
        registry.register_extension(Arc::new(recorder(name, &calls)));
    }

    registry.start_engine(engine_config("default", true)).await.unwrap();
    registry.stop_engine("default").await.unwrap();

    assert_eq!(
        *calls.lock(),
        vec![
            "before_start:H1",
            "before_start:H2",
            "before_start:H3",
            "after_start:H1",
            "after_start:H2",
            "after_start:H3",
            "before_stop:H3",
            "before_stop:H2",
            "before_stop:H1",
            "after_stop:H3",
            "after_stop:H2",
            "after_stop:H1",
        ]
    );
}

#[tokio::test]
async fn test_before_start_veto_aborts_start() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let registry = ProcessEngineRegistry::new();
    registry.register_extension(Arc::new(recorder("H1", &calls)));
    registry.register_extension(Arc::new(RecordingExtension {
        veto_start: true,
        ..recorder("H2", &calls)
    }));
    registry.register_extension(Arc::new(recorder("H3", &calls)));

    let err = registry.start_engine(engine_config("default", true)).await.unwrap_err();
    assert!(err.is_lifecycle());
    assert!(err.message_chain().contains("H2 refuses to start"), "{}", err.message_chain());
    assert_eq!(*calls.lock(), vec!["before_start:H1", "before_start:H2"]);
    assert!(registry.engine_names().is_empty());
    assert!(registry.runtime_directory().is_empty());

    // the reservation was released: a retry is vetoed again instead of conflicting
    let retry = registry.start_engine(engine_config("default", true)).await.unwrap_err();
    assert!(retry.is_lifecycle());
}

#[tokio::test]
async fn test_uninstall_veto_is_ignored_on_stop() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let registry = ProcessEngineRegistry::new();
    registry.register_extension(Arc::new(RecordingExtension {
        veto_uninstall: true,
        ..recorder("pin", &calls)
    }));
    registry.start_engine(engine_config("default", true)).await.unwrap();
    registry.install_archive(&archive("pinned", "pinned")).await.unwrap();

    let err = registry.uninstall_archive("pinned").await.unwrap_err();
    assert!(err.to_string().contains("pin"), "{}", err);
    assert_eq!(registry.installed_archives(Some("default")).unwrap().len(), 1);

    registry.stop_engine("default").await.unwrap();
    assert!(registry.archive_names().await.is_empty());
}

#[tokio::test]
async fn test_registry_lookup_errors() {
    let registry = ProcessEngineRegistry::new();
    registry.start_engine(engine_config("default", true)).await.unwrap();

    assert!(registry.installed_archives(None).unwrap_err().is_validation());
    assert!(registry.installed_archives(Some("nope")).unwrap_err().is_not_found());
    assert!(registry.uninstall_archive("unknown").await.unwrap_err().is_not_found());
    assert!(registry
        .install_archive(&ProcessArchive::new("  "))
        .await
        .unwrap_err()
        .is_validation());
}

#[tokio::test]
async fn test_stop_deregisters_engine() {
    let registry = ProcessEngineRegistry::new();
    let controller = registry.start_engine(engine_config("default", true)).await.unwrap();
    assert_eq!(registry.runtime_directory().names(), vec!["default".to_string()]);

    registry.stop_engine("default").await.unwrap();
    assert!(!controller.is_active());
    assert!(controller.process_engine().unwrap_err().is_lifecycle());
    assert!(registry.runtime_directory().is_empty());
    assert!(registry.default_engine().unwrap_err().is_not_found());
    assert!(registry.stop_engine("default").await.unwrap_err().is_not_found());

    // stopping the detached controller again is harmless
    controller.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_executor_is_reconfigured_live() {
    let registry = ProcessEngineRegistry::new();
    let controller = registry.start_engine(engine_config("default", true)).await.unwrap();
    let engine = controller.process_engine().unwrap();
    assert!(!engine.job_executor().is_active());

    controller.set_max_jobs_per_acquisition(7);
    controller.set_lock_time(60_000).unwrap();
    controller.set_wait_time(2_000).await.unwrap();
    let settings = engine.job_executor().settings();
    assert_eq!(settings.max_jobs_per_acquisition, 7);
    assert_eq!(settings.lock_time_ms, 60_000);
    assert_eq!(settings.wait_time_ms, 2_000);

    let err = controller.set_lock_time(100_000_000_000_000_000).unwrap_err();
    assert!(err.is_validation(), "{err:?}");
    assert!(engine.job_executor().set_lock_time(u64::MAX).unwrap_err().is_validation());
    assert_eq!(engine.job_executor().settings().lock_time_ms, 60_000);
    engine.job_executor().execute_due_jobs().await.unwrap();

    controller.set_activate_job_executor(true).await.unwrap();
    assert!(engine.job_executor().is_active());
    controller.set_activate_job_executor(false).await.unwrap();
    assert!(!engine.job_executor().is_active());

    registry.stop_all().await;
    assert_eq!(json!(registry.engine_names()), json!([]));
}
