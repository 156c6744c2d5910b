use simplelog::*;
use tokio::sync::{mpsc, watch};

use crate::cable::CableState;
use crate::config::AppConfig;
use crate::dyn_config::ModeRegistry;
use crate::modes::{BuiltinMode, ModeName};
use crate::policy::{self, PolicyInput};
use crate::worker::WorkerRequest;

// module name for logging engine
const NAME: &str = "<i><bright-black> control: </>";

/// Outbound broadcasts the bus adapter turns into D-Bus signals (§4.6).
/// The control core never touches the bus directly; it only enqueues these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSignal {
    CurrentState(ModeName),
    TargetState(ModeName),
    DialogShow,
}

/// A sentinel UID for "no session currently known", mirroring the C
/// daemon's `UID_UNKNOWN`.
const UID_UNKNOWN: Option<u32> = None;

/// The mode control state machine (§4.5). Owned outright by the main-loop
/// task: no interior mutability, no `Arc`/`Mutex`.
pub struct ControlCore {
    internal_mode: ModeName,
    target_mode: ModeName,
    external_mode: ModeName,
    user_for_mode: Option<u32>,
    cable_state: CableState,
    current_user: Option<u32>,

    rescue_mode: bool,
    diag_mode: bool,
    can_export: bool,

    registry: ModeRegistry,
    config: AppConfig,

    worker_tx: watch::Sender<Option<WorkerRequest>>,
    bus_tx: mpsc::UnboundedSender<BusSignal>,
}

impl ControlCore {
    pub fn new(
        registry: ModeRegistry,
        config: AppConfig,
        rescue_mode: bool,
        diag_mode: bool,
        worker_tx: watch::Sender<Option<WorkerRequest>>,
        bus_tx: mpsc::UnboundedSender<BusSignal>,
    ) -> Self {
        ControlCore {
            internal_mode: ModeName::undefined(),
            target_mode: ModeName::undefined(),
            external_mode: ModeName::undefined(),
            user_for_mode: UID_UNKNOWN,
            cable_state: CableState::Unknown,
            current_user: UID_UNKNOWN,
            rescue_mode,
            diag_mode,
            can_export: true,
            registry,
            config,
            worker_tx,
            bus_tx,
        }
    }

    pub fn internal_mode(&self) -> &ModeName {
        &self.internal_mode
    }

    pub fn target_mode(&self) -> &ModeName {
        &self.target_mode
    }

    pub fn external_mode(&self) -> &ModeName {
        &self.external_mode
    }

    pub fn cable_state(&self) -> CableState {
        self.cable_state
    }

    pub fn registry(&self) -> &ModeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    /// Replaces the dynamic mode registry in place, e.g. after an explicit
    /// reload request (§4.2). The worker's own registry snapshot, acquired
    /// once at startup, is refreshed only on daemon restart — see DESIGN.md.
    pub fn reload_registry(&mut self, registry: ModeRegistry) {
        self.registry = registry;
    }

    pub fn set_current_user(&mut self, uid: Option<u32>) {
        self.current_user = uid;
    }

    /// Replaces the device-lock/acting-dead/export gate (§4.5 step 6).
    /// Called whenever the system reports a change relevant to whether
    /// device contents may be exported over USB.
    pub fn set_can_export(&mut self, can_export: bool) {
        self.can_export = can_export;
    }

    fn emit(&self, signal: BusSignal) {
        let _ = self.bus_tx.send(signal);
    }

    /// Whether `mode` is something this daemon actually knows how to
    /// program: a built-in (including the pseudo-modes `busy`/`ask`) or a
    /// name the mode registry loaded.
    fn is_known_mode(&self, mode: &ModeName) -> bool {
        match mode {
            ModeName::Builtin(_) => true,
            ModeName::Dynamic(_) => self.registry.contains(mode),
        }
    }

    /// Forces a specific mode (§4.5 `set_usb_mode`), used by both RPC and
    /// the policy resolver. No-op if already the internal mode. An
    /// unrecognized mode name (not built-in, not in the registry) collapses
    /// to `charging_fallback` with a warning (§7 `UnknownMode`, scenario 6).
    pub fn set_usb_mode(&mut self, mode: ModeName) {
        let mode = if self.is_known_mode(&mode) {
            mode
        } else {
            warn!("{} unknown mode '{}' requested, falling back to charging_fallback", NAME, mode);
            ModeName::charging_fallback()
        };

        if self.internal_mode == mode {
            return;
        }
        debug!("{} internal_mode: {} -> {}", NAME, self.internal_mode, mode);
        self.internal_mode = mode;

        self.set_target_mode(self.internal_mode.clone());
        self.set_external_mode(ModeName::busy());
        self.user_for_mode = UID_UNKNOWN;

        let _ = self.worker_tx.send(Some(WorkerRequest { mode: self.internal_mode.clone() }));
    }

    fn set_target_mode(&mut self, mode: ModeName) {
        if self.target_mode == mode {
            return;
        }
        debug!("{} target_mode: {} -> {}", NAME, self.target_mode, mode);
        self.target_mode = mode.clone();
        self.emit(BusSignal::TargetState(mode));
    }

    fn set_external_mode(&mut self, mode: ModeName) {
        if self.external_mode == mode {
            return;
        }
        debug!("{} external_mode: {} -> {}", NAME, self.external_mode, mode);
        self.external_mode = mode.clone();

        if self.external_mode.is_builtin(BuiltinMode::Ask) {
            self.emit(BusSignal::DialogShow);
        }
        self.emit(BusSignal::CurrentState(mode.clone()));

        // Stable state reached; re-sync target in case the originally
        // scheduled one could not be reached.
        if !self.external_mode.is_builtin(BuiltinMode::Busy) {
            self.set_target_mode(mode);
        }
    }

    /// Runs the policy resolver and applies its result (§4.5
    /// `select_usb_mode`).
    pub fn select_usb_mode(&mut self, user_changed: bool) {
        let input = PolicyInput {
            rescue: self.rescue_mode,
            diag: self.diag_mode,
            uid: self.current_user,
            user_changed,
            can_export: self.can_export,
            registry: &self.registry,
            config: &self.config,
        };
        let mode = policy::resolve(&input);
        self.set_usb_mode(mode);
    }

    /// Called by the detector whenever the debounced cable state changes
    /// (§4.5 cable-driven transitions).
    pub fn set_cable_state(&mut self, state: CableState) {
        if self.cable_state == state {
            return;
        }
        debug!("{} cable_state: {:?} -> {:?}", NAME, self.cable_state, state);
        self.cable_state = state;

        match state {
            CableState::Disconnected | CableState::Unknown => self.set_usb_mode(ModeName::undefined()),
            CableState::ChargerConnected => self.set_usb_mode(ModeName::charger()),
            CableState::PcConnected => self.select_usb_mode(false),
        }
    }

    /// Called by the worker on completion (§4.5 `mode_switched`).
    pub fn mode_switched(&mut self, mode: ModeName) {
        if self.internal_mode != mode {
            debug!("{} internal_mode (from worker): {} -> {}", NAME, self.internal_mode, mode);
            self.internal_mode = mode;
        }
        self.set_external_mode(self.internal_mode.external_name());
        self.user_for_mode = self.current_user;
    }

    /// Called when the foreground session user changes (§4.5
    /// `user_changed`).
    pub fn user_changed(&mut self) {
        if self.cable_state != CableState::PcConnected {
            return;
        }
        let user_changed = self.current_user != self.user_for_mode;
        debug!("{} user_changed: {}", NAME, user_changed);
        if user_changed {
            self.select_usb_mode(user_changed);
        }
    }

    /// Called when device-lock or system state changes (§4.5
    /// `rethink_charging_fallback`).
    pub fn rethink_charging_fallback(&mut self) {
        if self.cable_state != CableState::PcConnected {
            return;
        }
        if !self.internal_mode.is_builtin(BuiltinMode::Undefined)
            && !self.internal_mode.is_builtin(BuiltinMode::ChargingFallback)
        {
            return;
        }
        if !self.can_export {
            debug!("{} exporting data not allowed; staying in {}", NAME, self.internal_mode);
            return;
        }
        debug!("{} attempting to leave {}", NAME, self.internal_mode);
        self.select_usb_mode(false);
    }
}
