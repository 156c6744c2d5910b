use simplelog::*;
use tokio::sync::{mpsc, watch};

use crate::config::AppConfig;
use crate::dyn_config::ModeRegistry;
use crate::gadget::GadgetBackend;
use crate::modes::{BuiltinMode, ModeName};

// module name for logging engine
const NAME: &str = "<i><bright-black> worker: </>";

/// What the control core asks the worker to do. Carried in the single-slot
/// watch channel described in §4.4/§5 — a new request always overwrites
/// whatever is pending, it never queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub mode: ModeName,
}

/// Reported back to the main loop once the worker has finished acting on a
/// request, successfully or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub mode: ModeName,
}

fn function_for(mode: &ModeName, registry: &ModeRegistry) -> String {
    if let Some(def) = registry.get(mode) {
        if let Some(module) = &def.module {
            return module.clone();
        }
    }
    mode.as_str().to_string()
}

fn is_charging(mode: &ModeName) -> bool {
    mode.is_builtin(BuiltinMode::ChargingFallback) || mode.is_builtin(BuiltinMode::ChargingOnly)
}

/// Writes the mode definition's main `sysfs` triple first (the only
/// attribute the data model gives a `reset_value` for, §3), then its extra
/// sysfs pairs in order. If an extra-sysfs write fails, the main triple —
/// the single already-touched attribute with a real reset value — is rolled
/// back to it (§4.4 step 5). Extra-sysfs pairs carry no reset value in the
/// data model (mirroring the original `android_extra_sysfs_path[2-4]`
/// catalogue, which never paired them with a reset key), so a failed extra
/// write is not rolled back to a fabricated value; it is simply logged and
/// left in its last-written state.
fn apply_extra_sysfs(registry: &ModeRegistry, mode: &ModeName) -> bool {
    let Some(def) = registry.get(mode) else { return true };

    let mut main_written = false;
    if let Some(sysfs) = &def.sysfs {
        if let Err(e) = std::fs::write(&sysfs.path, &sysfs.value) {
            error!("{} failed to write sysfs {}: {}", NAME, sysfs.path, e);
            return false;
        }
        main_written = true;
    }

    for (path, value) in &def.extra_sysfs {
        if let Err(e) = std::fs::write(path, value) {
            error!("{} failed to write extra sysfs {} (no reset value modeled, leaving as-is): {}", NAME, path, e);
            if main_written {
                if let Some(sysfs) = &def.sysfs {
                    if let Some(reset) = &sysfs.reset_value {
                        if let Err(e) = std::fs::write(&sysfs.path, reset) {
                            error!("{} failed to reset sysfs {} to '{}': {}", NAME, sysfs.path, reset, e);
                        }
                    }
                }
            }
            return false;
        }
    }

    true
}

/// Programs a single mode end to end, returning the mode to report as the
/// outcome (§4.4 step 7): `mode` on success, a safe fallback on failure.
fn program(backend: &mut dyn GadgetBackend, registry: &ModeRegistry, mode: &ModeName) -> ModeName {
    if mode.is_builtin(BuiltinMode::Undefined) {
        let _ = backend.set_udc(false);
        let _ = backend.clear_functions();
        return ModeName::undefined();
    }

    // `ask`/`busy` are pseudo-modes the control core uses to represent
    // "waiting for the UI" and "mid-transition"; neither names a gadget
    // function, so never hand them to a backend (§4.5 invariant 1: external
    // mode is never a raw backend function name). `ask` settles with UDC
    // detached and no function selected, same as `undefined`, but reports
    // back as `ask` so `mode_switched` re-emits the dialog-show signal.
    if mode.is_builtin(BuiltinMode::Ask) || mode.is_builtin(BuiltinMode::Busy) {
        let _ = backend.set_udc(false);
        let _ = backend.clear_functions();
        return mode.clone();
    }

    if is_charging(mode) || mode.is_builtin(BuiltinMode::Charger) {
        return match backend.set_charging_mode() {
            Ok(()) => mode.clone(),
            Err(e) => {
                error!("{} failed to program charging mode: {}", NAME, e);
                ModeName::undefined()
            }
        };
    }

    let function = function_for(mode, registry);
    if let Err(e) = backend.set_function(&function) {
        error!("{} failed to set function '{}' for mode '{}': {}", NAME, function, mode, e);
        return ModeName::undefined();
    }

    if !apply_extra_sysfs(registry, mode) {
        let _ = backend.set_udc(false);
        return ModeName::charging_fallback();
    }

    match backend.set_udc(true) {
        Ok(()) => mode.clone(),
        Err(e) => {
            error!("{} failed to attach UDC for mode '{}': {}", NAME, mode, e);
            ModeName::undefined()
        }
    }
}

/// Runs on its own OS thread (§5: the gadget tree is exclusively owned by
/// the worker). Blocks on `watch::Receiver::changed()` via `block_on`
/// since this thread is not inside the tokio runtime, mirroring the
/// teacher's own blocking `uevent_listener` thread.
pub fn run(
    mut rx: watch::Receiver<Option<WorkerRequest>>,
    tx: mpsc::UnboundedSender<WorkerEvent>,
    registry: ModeRegistry,
    config: AppConfig,
    mut backend: Box<dyn GadgetBackend>,
) {
    backend.probe();
    if let Err(e) = backend.init_defaults(&config) {
        error!("{} init_defaults failed: {}", NAME, e);
    }

    loop {
        if futures::executor::block_on(rx.changed()).is_err() {
            info!("{} request channel closed, exiting", NAME);
            return;
        }

        let Some(request) = rx.borrow_and_update().clone() else {
            continue;
        };

        debug!("{} programming mode '{}'", NAME, request.mode);
        let outcome = program(backend.as_mut(), &registry, &request.mode);
        debug!("{} finished programming, outcome '{}'", NAME, outcome);

        if tx.send(WorkerEvent { mode: outcome }).is_err() {
            info!("{} completion channel closed, exiting", NAME);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingBackend {
        calls: Arc<Mutex<Vec<String>>>,
        fail_function: bool,
    }

    impl GadgetBackend for RecordingBackend {
        fn probe(&mut self) -> bool {
            true
        }
        fn in_use(&self) -> bool {
            true
        }
        fn init_defaults(&mut self, _config: &AppConfig) -> Result<()> {
            Ok(())
        }
        fn set_charging_mode(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("charging".into());
            Ok(())
        }
        fn set_function(&mut self, func: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("function:{func}"));
            if self.fail_function {
                return Err(crate::error::UsbModedError::BackendUnavailable);
            }
            Ok(())
        }
        fn clear_functions(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("clear_functions".into());
            Ok(())
        }
        fn set_udc(&mut self, enable: bool) -> Result<()> {
            self.calls.lock().unwrap().push(format!("udc:{enable}"));
            Ok(())
        }
        fn set_vendor_id(&mut self, _id: &str) -> Result<()> {
            Ok(())
        }
        fn set_product_id(&mut self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn undefined_detaches_udc_and_clears_functions() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RecordingBackend { calls: calls.clone(), fail_function: false };
        let registry = ModeRegistry::empty();
        let outcome = program(&mut backend, &registry, &ModeName::undefined());
        assert_eq!(outcome, ModeName::undefined());
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["udc:false".to_string(), "clear_functions".to_string()]
        );
    }

    #[test]
    fn ask_never_reaches_the_backend_as_a_function() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RecordingBackend { calls: calls.clone(), fail_function: false };
        let registry = ModeRegistry::empty();
        let outcome = program(&mut backend, &registry, &ModeName::ask());
        assert_eq!(outcome, ModeName::ask());
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["udc:false".to_string(), "clear_functions".to_string()]
        );
    }

    #[test]
    fn busy_never_reaches_the_backend_as_a_function() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RecordingBackend { calls: calls.clone(), fail_function: false };
        let registry = ModeRegistry::empty();
        let outcome = program(&mut backend, &registry, &ModeName::busy());
        assert_eq!(outcome, ModeName::busy());
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["udc:false".to_string(), "clear_functions".to_string()]
        );
    }

    #[test]
    fn charger_uses_charging_path() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RecordingBackend { calls: calls.clone(), fail_function: false };
        let registry = ModeRegistry::empty();
        let outcome = program(&mut backend, &registry, &ModeName::charger());
        assert_eq!(outcome, ModeName::charger());
        assert_eq!(*calls.lock().unwrap(), vec!["charging".to_string()]);
    }

    #[test]
    fn mass_storage_sets_function_then_attaches_udc() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RecordingBackend { calls: calls.clone(), fail_function: false };
        let registry = ModeRegistry::empty();
        let mode = ModeName::new("mass_storage");
        let outcome = program(&mut backend, &registry, &mode);
        assert_eq!(outcome, mode);
        assert_eq!(*calls.lock().unwrap(), vec!["function:mass_storage".to_string(), "udc:true".to_string()]);
    }

    #[test]
    fn failed_function_falls_back_to_undefined() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RecordingBackend { calls: calls.clone(), fail_function: true };
        let registry = ModeRegistry::empty();
        let outcome = program(&mut backend, &registry, &ModeName::new("mass_storage"));
        assert_eq!(outcome, ModeName::undefined());
    }

    #[test]
    fn extra_sysfs_failure_resets_main_sysfs_to_reset_value_only() {
        let dir = std::env::temp_dir().join(format!("usb-moded-rs-worker-rollback-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let main_path = dir.join("main_attr");
        std::fs::write(&main_path, "untouched").unwrap();
        // a path under a nonexistent directory always fails to write
        let bad_extra_path = dir.join("missing-subdir").join("extra_attr");

        std::fs::write(
            dir.join("a.ini"),
            format!(
                "[mode]\nname = vendor_rollback\nsysfs_path = {main}\nsysfs_value = 1\nsysfs_reset_value = 0\n[options]\nandroid_extra_sysfs_path = {extra}\nandroid_extra_sysfs_value = 1\n",
                main = main_path.display(),
                extra = bad_extra_path.display(),
            ),
        )
        .unwrap();

        let registry = ModeRegistry::load(&dir).unwrap();
        let mode = ModeName::new("vendor_rollback");

        let ok = apply_extra_sysfs(&registry, &mode);
        assert!(!ok, "extra sysfs write should fail");
        assert_eq!(
            std::fs::read_to_string(&main_path).unwrap(),
            "0",
            "main sysfs attribute (which has a modeled reset_value) must be rolled back"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
