//! End-to-end tests for the manager: configuration, install, activation.
//!
//! ```text
//! dreamland.toml
//!     |
//!     v
//! ManagerContext (probe, framework status, activation store, worker)
//!     |
//!     v
//! InstallationPipeline -> InstallObserver
//!     |
//!     v
//! FrameworkState -> ActivationStore::set_enabled
//! ```

use std::path::Path;
use std::sync::Arc;

use dreamland_core::install::{EventLog, HandleError};
use dreamland_core::{
    ActivationRecord, FailureKind, FrameworkState, InstallObserver, ManagerConfig, ManagerContext,
    ObserverEvent, Phase, RejectReason, StoreError,
};

fn write_config(dir: &Path, script: &str) -> ManagerConfig {
    let text = format!(
        r#"
[selinux]
mount_dir = "{mount}"
platform_api = false

[installer]
command = "sh"
args = ["-c", "{script}"]
diagnostic_tail_lines = 3

[framework]
install_marker = "{marker}"

[state]
activation_file = "{state}"
"#,
        mount = dir.join("selinux").display(),
        marker = dir.join("adb/installed").display(),
        state = dir.join("activation.json").display(),
    );
    let path = dir.join("dreamland.toml");
    std::fs::write(&path, text).unwrap();
    ManagerConfig::from_file(&path).unwrap()
}

#[cfg_attr(miri, ignore)] // Miri can't spawn processes
#[test]
fn install_then_enable_module() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "echo ok");
    let context = ManagerContext::initialize(config).unwrap();
    let store = context.activations();

    store
        .track(ActivationRecord::module("com.example.mod", "Example module", true))
        .unwrap();
    let err = store.set_enabled("com.example.mod", true).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Rejected {
            reason: RejectReason::FrameworkInactive,
            ..
        }
    ));

    let log = Arc::new(EventLog::new());
    let state = context
        .pipeline()
        .start(Arc::clone(&log) as Arc<dyn InstallObserver>)
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(
        state,
        FrameworkState {
            installed: true,
            active: true
        }
    );

    let events = log.events();
    assert_eq!(log.phases(), Phase::ALL.to_vec());
    assert!(events.contains(&ObserverEvent::Line {
        line: "ok".to_string()
    }));
    assert_eq!(events.last(), Some(&ObserverEvent::Done));

    let record = store.set_enabled("com.example.mod", true).unwrap();
    assert!(record.enabled);
    assert_eq!(store.query("com.example.mod").unwrap(), record);
}

#[cfg_attr(miri, ignore)] // Miri can't spawn processes
#[test]
fn failed_install_keeps_activation_locked() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "echo a; echo b; echo c; echo 'permission missing' >&2; exit 3",
    );
    let context = ManagerContext::initialize(config).unwrap();
    let store = context.activations();
    store
        .track(ActivationRecord::app("com.example.app", "Example app"))
        .unwrap();

    let log = Arc::new(EventLog::new());
    let failure = context
        .pipeline()
        .start(Arc::clone(&log) as Arc<dyn InstallObserver>)
        .unwrap()
        .wait()
        .unwrap_err();
    assert!(failure.to_string().contains("installing failed"));
    let HandleError::Failed(failure) = failure else {
        panic!("worker stopped before reporting");
    };
    assert_eq!(failure.error.diagnostic(), Some("permission missing"));

    let events = log.events();
    let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    match terminal[0] {
        ObserverEvent::Error { phase, kind, message } => {
            assert_eq!(*phase, Phase::Installing);
            assert_eq!(*kind, FailureKind::OperationFailed);
            assert!(message.contains("exit code 3"));
        },
        other => panic!("unexpected terminal event {other:?}"),
    }

    assert!(!context.framework().get().installed);
    assert!(!dir.path().join("adb/installed").exists());
    assert!(store.set_enabled("com.example.app", true).is_err());
}

#[cfg_attr(miri, ignore)] // Miri can't spawn processes
#[tokio::test]
async fn restart_detects_framework_and_restores_activation() {
    let dir = tempfile::tempdir().unwrap();

    {
        let config = write_config(dir.path(), "echo ok");
        let context = ManagerContext::initialize(config).unwrap();
        context
            .pipeline()
            .start(Arc::new(EventLog::new()))
            .unwrap()
            .outcome()
            .await
            .unwrap();
        let store = context.activations();
        store
            .track(ActivationRecord::app("com.example.app", "Example app"))
            .unwrap();
        store.set_enabled("com.example.app", true).unwrap();
    }

    assert!(dir.path().join("adb/installed").is_file());
    let config = write_config(dir.path(), "echo ok");
    let context = ManagerContext::initialize(config).unwrap();
    assert!(!context.framework().is_active());

    let state = context.refresh_framework().await;
    assert!(state.active);
    assert!(context.activations().query("com.example.app").unwrap().enabled);
    assert!(context.activations().set_enabled("com.example.app", false).is_ok());
}

#[test]
fn selinux_reported_disabled_without_mount() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "true");
    let context = ManagerContext::initialize(config).unwrap();

    let state = context.probe().snapshot();
    assert!(!state.enabled);
    assert!(!state.enforcing);
    assert_eq!(state.process_context, None);
}
