use std::path::Path;
use std::pin::Pin;
use std::process;
use std::time::Duration;

use kobject_uevent::UEvent;
use netlink_sys::protocols::NETLINK_KOBJECT_UEVENT;
use simplelog::*;
use tokio::sync::mpsc;
use tokio::time::Sleep;

use crate::wakelock::WakeLock;

// module name for logging engine
const NAME: &str = "<i><bright-black> cable: </>";

const DEFAULT_POWER_SUPPLY_PATH: &str = "/sys/class/power_supply/usb";
const DEBOUNCE: Duration = Duration::from_millis(1500);

/// Three meaningful states plus the initial "we have not heard from the
/// kernel yet" value (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CableState {
    #[default]
    Unknown,
    Disconnected,
    ChargerConnected,
    PcConnected,
}

impl CableState {
    pub fn is_connected(self) -> bool {
        matches!(self, CableState::ChargerConnected | CableState::PcConnected)
    }

    pub fn name(self) -> &'static str {
        match self {
            CableState::Unknown => "unknown",
            CableState::Disconnected => "disconnected",
            CableState::ChargerConnected => "charger_connected",
            CableState::PcConnected => "pc_connected",
        }
    }
}

/// A single `power_supply` uevent, decoded from whatever properties the
/// kernel happened to set. Parsing is kept separate from classification so
/// the latter is unit-testable without a netlink socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerSupplyEvent {
    pub present: Option<bool>,
    pub online: Option<bool>,
    pub kind: Option<String>,
}

/// Classifies a single reported event into a cable state, per the type
/// table in §4.3. Pure function, independent of debounce state.
pub fn classify(event: &PowerSupplyEvent) -> CableState {
    let connected = event.present.or(event.online).unwrap_or(false);
    if !connected {
        return CableState::Disconnected;
    }

    let kind = match &event.kind {
        Some(k) => k.as_str(),
        None => {
            warn!("{} no POWER_SUPPLY_TYPE, assuming PC connection", NAME);
            return CableState::PcConnected;
        }
    };

    match kind {
        "USB" | "USB_CDP" => CableState::PcConnected,
        "USB_DCP" | "USB_HVDCP" | "USB_HVDCP_3" => CableState::ChargerConnected,
        "USB_FLOAT" => {
            warn!("{} USB_FLOAT reported, assuming charger", NAME);
            CableState::ChargerConnected
        }
        "Unknown" => {
            warn!("{} unknown connection type reported, assuming disconnected", NAME);
            CableState::Disconnected
        }
        other => {
            warn!("{} unhandled power supply type: {}", NAME, other);
            CableState::Disconnected
        }
    }
}

/// Score used when no device is explicitly configured and the default
/// `/sys/class/power_supply/usb` path does not exist (§4.3 heuristic).
pub fn score_candidate(sysname: &str, present: bool, online: bool, has_type: bool) -> i32 {
    if sysname.contains("battery") || sysname.contains("BAT") {
        return 0;
    }
    let mut score = 0;
    if sysname.contains("usb") {
        score += 10;
    }
    if sysname.contains("charger") {
        score += 5;
    }
    if present {
        score += 5;
    }
    if online {
        score += 10;
    }
    if has_type {
        score += 10;
    }
    score
}

/// Picks the `power_supply` device to monitor: the configured path if it
/// exists, else the conventional default, else the best-scoring device
/// found by enumerating `/sys/class/power_supply`.
pub fn select_power_supply(configured: Option<&str>, class_dir: &Path) -> Option<String> {
    if let Some(path) = configured {
        if Path::new(path).exists() {
            return Some(sysname_of(path));
        }
    }
    if Path::new(DEFAULT_POWER_SUPPLY_PATH).exists() {
        return Some(sysname_of(DEFAULT_POWER_SUPPLY_PATH));
    }

    let entries = std::fs::read_dir(class_dir).ok()?;
    let mut best_name: Option<String> = None;
    let mut best_score = 0;

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let present = std::fs::read_to_string(entry.path().join("present")).is_ok();
        let online = std::fs::read_to_string(entry.path().join("online")).is_ok();
        let has_type = std::fs::read_to_string(entry.path().join("type")).is_ok();
        let score = score_candidate(&name, present, online, has_type);
        if score > best_score {
            best_score = score;
            best_name = Some(name);
        }
    }

    if best_score > 0 {
        debug!("{} selected power supply '{:?}' by heuristic (score {})", NAME, best_name, best_score);
    }
    best_name
}

fn sysname_of(path: &str) -> String {
    Path::new(path).file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
}

/// Parses uevent property values the kernel writes as `"0"`/`"1"`.
fn parse_bool_prop(value: &str) -> bool {
    value == "1"
}

/// Blocking netlink listener thread (grounded on the teacher's own
/// `uevent_listener`, now pointed at `power_supply` instead of the
/// Android-accessory subsystem). Forwards matching events for `sysname`
/// to the async side over an unbounded channel.
pub fn uevent_listener(sysname: String, tx: mpsc::UnboundedSender<PowerSupplyEvent>) {
    info!("{} starting uevent listener thread for '{}'", NAME, sysname);

    let mut socket = match netlink_sys::Socket::new(NETLINK_KOBJECT_UEVENT) {
        Ok(s) => s,
        Err(e) => {
            error!("{} failed to open netlink socket: {}", NAME, e);
            return;
        }
    };
    let sa = netlink_sys::SocketAddr::new(process::id(), 1);
    if let Err(e) = socket.bind(&sa) {
        error!("{} failed to bind netlink socket: {}", NAME, e);
        return;
    }

    let mut buf = vec![0u8; 1024 * 8];
    loop {
        // Held for the whole classification of one event (§5: acquire at
        // top of handler, release on every exit path, including `continue`).
        let _lock = WakeLock::acquire();

        let n = match socket.recv(&mut buf, 0) {
            Ok(n) => n,
            Err(e) => {
                error!("{} netlink recv failed: {}", NAME, e);
                continue;
            }
        };

        let u = match UEvent::from_netlink_packet(&buf[..n]) {
            Ok(u) => u,
            Err(e) => {
                debug!("{} malformed uevent: {}", NAME, e);
                continue;
            }
        };

        if u.env.get("SUBSYSTEM").map(String::as_str) != Some("power_supply") {
            continue;
        }
        let devname = u.env.get("DEVNAME").or_else(|| u.env.get("DEVPATH"));
        if !devname.is_some_and(|d| d.ends_with(sysname.as_str())) {
            continue;
        }
        if u.env.get("ACTION").map(String::as_str) != Some("change") {
            continue;
        }

        let present = u.env.get("POWER_SUPPLY_PRESENT").map(|v| parse_bool_prop(v));
        let online = u.env.get("POWER_SUPPLY_ONLINE").map(|v| parse_bool_prop(v));
        let kind = u
            .env
            .get("POWER_SUPPLY_REAL_TYPE")
            .or_else(|| u.env.get("POWER_SUPPLY_TYPE"))
            .cloned();

        debug!("{} uevent: present={:?} online={:?} type={:?}", NAME, present, online, kind);

        if tx.send(PowerSupplyEvent { present, online, kind }).is_err() {
            info!("{} receiver gone, stopping listener thread", NAME);
            return;
        }
    }
}

/// Owns the debounced cable state on the async side. `active` is what the
/// rest of the daemon observes; `reported` is the raw latest classification.
pub struct CableDetector {
    rx: mpsc::UnboundedReceiver<PowerSupplyEvent>,
    reported: CableState,
    active: CableState,
    debounce: Option<Pin<Box<Sleep>>>,
}

impl CableDetector {
    pub fn new(rx: mpsc::UnboundedReceiver<PowerSupplyEvent>) -> Self {
        CableDetector {
            rx,
            reported: CableState::Unknown,
            active: CableState::Unknown,
            debounce: None,
        }
    }

    pub fn active(&self) -> CableState {
        self.active
    }

    /// Waits for either the next uevent or a pending debounce timer,
    /// returning `Some(state)` exactly when `active` changes. Returns
    /// `None` if the listener thread has gone away.
    pub async fn next_change(&mut self) -> Option<CableState> {
        loop {
            let changed = tokio::select! {
                event = self.rx.recv() => {
                    let event = event?;
                    self.on_event(classify(&event))
                }
                _ = async { self.debounce.as_mut().unwrap().as_mut().await }, if self.debounce.is_some() => {
                    self.debounce = None;
                    let state = self.reported;
                    debug!("{} debounce timer fired, applying {}", NAME, state.name());
                    self.apply(state)
                }
            };
            if changed {
                return Some(self.active);
            }
        }
    }

    /// Updates `reported`, (re)schedules or cancels the debounce timer, and
    /// applies immediately when debounce does not apply. Returns whether
    /// `active` changed as a direct result.
    fn on_event(&mut self, new: CableState) -> bool {
        let prev = self.reported;
        self.reported = new;
        if prev == new {
            return false;
        }
        debug!("{} reported cable state: {} -> {}", NAME, prev.name(), new.name());

        if new == CableState::PcConnected && prev != CableState::Unknown {
            debug!("{} scheduling delayed transfer to {}", NAME, new.name());
            self.debounce = Some(Box::pin(tokio::time::sleep(DEBOUNCE)));
            false
        } else {
            self.debounce = None;
            self.apply(new)
        }
    }

    fn apply(&mut self, state: CableState) -> bool {
        if self.active == state {
            return false;
        }
        debug!("{} active cable state: {} -> {}", NAME, self.active.name(), state.name());
        self.active = state;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(present: Option<bool>, online: Option<bool>, kind: Option<&str>) -> PowerSupplyEvent {
        PowerSupplyEvent { present, online, kind: kind.map(str::to_string) }
    }

    #[test]
    fn classify_disconnected_when_not_present() {
        assert_eq!(classify(&ev(Some(false), None, None)), CableState::Disconnected);
        assert_eq!(classify(&ev(None, None, None)), CableState::Disconnected);
    }

    #[test]
    fn classify_pc_and_charger_types() {
        assert_eq!(classify(&ev(Some(true), None, Some("USB"))), CableState::PcConnected);
        assert_eq!(classify(&ev(Some(true), None, Some("USB_CDP"))), CableState::PcConnected);
        assert_eq!(classify(&ev(Some(true), None, Some("USB_DCP"))), CableState::ChargerConnected);
        assert_eq!(classify(&ev(Some(true), None, Some("USB_HVDCP_3"))), CableState::ChargerConnected);
        assert_eq!(classify(&ev(Some(true), None, Some("USB_FLOAT"))), CableState::ChargerConnected);
        assert_eq!(classify(&ev(Some(true), None, Some("Unknown"))), CableState::Disconnected);
    }

    #[test]
    fn classify_missing_type_falls_back_to_pc() {
        assert_eq!(classify(&ev(Some(true), None, None)), CableState::PcConnected);
    }

    #[test]
    fn classify_prefers_present_over_online_fallback() {
        assert_eq!(classify(&ev(None, Some(true), Some("USB"))), CableState::PcConnected);
    }

    #[test]
    fn score_rejects_battery_named_devices() {
        assert_eq!(score_candidate("battery", true, true, true), 0);
        assert_eq!(score_candidate("BAT0", true, true, true), 0);
    }

    #[test]
    fn score_prefers_usb_with_full_properties() {
        let usb = score_candidate("usb", true, true, true);
        let generic = score_candidate("ac", true, false, false);
        assert!(usb > generic);
        assert_eq!(usb, 35);
    }

    #[tokio::test]
    async fn pc_connect_is_debounced_then_applied() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut detector = CableDetector::new(rx);

        tx.send(ev(Some(true), None, Some("USB"))).unwrap();
        let changed = detector.next_change().await.unwrap();
        assert_eq!(changed, CableState::PcConnected, "first PcConnected report from Unknown applies immediately");
        assert_eq!(detector.active(), CableState::PcConnected);

        // from a defined prior state the next PC connect is debounced
        tx.send(ev(Some(false), None, None)).unwrap();
        let changed = detector.next_change().await.unwrap();
        assert_eq!(changed, CableState::Disconnected);

        tx.send(ev(Some(true), None, Some("USB"))).unwrap();
        let changed = detector.next_change().await.unwrap();
        assert_eq!(changed, CableState::PcConnected);
    }

    #[tokio::test]
    async fn charger_connect_is_immediate() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut detector = CableDetector::new(rx);

        tx.send(ev(Some(true), None, Some("USB_DCP"))).unwrap();
        let changed = detector.next_change().await.unwrap();
        assert_eq!(changed, CableState::ChargerConnected);
        assert_eq!(detector.active(), CableState::ChargerConnected);
    }
}
