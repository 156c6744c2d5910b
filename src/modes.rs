use std::fmt;

/// Closed catalogue of mode names the daemon understands without consulting
/// the mode registry. Anything else is a [`ModeName::Dynamic`] looked up in
/// the registry at the point of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinMode {
    Undefined,
    Busy,
    Ask,
    ChargingOnly,
    ChargingFallback,
    Charger,
    MassStorage,
    Mtp,
    Developer,
    ConnectionSharing,
    AdbMode,
    PcSuite,
    Host,
    Vendor,
}

impl BuiltinMode {
    pub const ALL: &'static [BuiltinMode] = &[
        BuiltinMode::Undefined,
        BuiltinMode::Busy,
        BuiltinMode::Ask,
        BuiltinMode::ChargingOnly,
        BuiltinMode::ChargingFallback,
        BuiltinMode::Charger,
        BuiltinMode::MassStorage,
        BuiltinMode::Mtp,
        BuiltinMode::Developer,
        BuiltinMode::ConnectionSharing,
        BuiltinMode::AdbMode,
        BuiltinMode::PcSuite,
        BuiltinMode::Host,
        BuiltinMode::Vendor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BuiltinMode::Undefined => "undefined",
            BuiltinMode::Busy => "busy",
            BuiltinMode::Ask => "ask",
            BuiltinMode::ChargingOnly => "charging_only",
            BuiltinMode::ChargingFallback => "charging_fallback",
            BuiltinMode::Charger => "charger",
            BuiltinMode::MassStorage => "mass_storage",
            BuiltinMode::Mtp => "mtp",
            BuiltinMode::Developer => "developer",
            BuiltinMode::ConnectionSharing => "connection_sharing",
            BuiltinMode::AdbMode => "adb_mode",
            BuiltinMode::PcSuite => "pc_suite",
            BuiltinMode::Host => "host",
            BuiltinMode::Vendor => "vendor",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == s)
    }
}

impl fmt::Display for BuiltinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A USB mode name, either one of the reserved [`BuiltinMode`] values or a
/// name introduced by the mode registry. Compared byte-exactly, as the spec
/// requires; the public surface (bus methods, log lines, config keys) is
/// always plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModeName {
    Builtin(BuiltinMode),
    Dynamic(String),
}

impl ModeName {
    pub fn new(s: impl Into<String>) -> Self {
        let s = s.into();
        match BuiltinMode::from_str(&s) {
            Some(b) => ModeName::Builtin(b),
            None => ModeName::Dynamic(s),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ModeName::Builtin(b) => b.as_str(),
            ModeName::Dynamic(s) => s.as_str(),
        }
    }

    pub fn is_builtin(&self, b: BuiltinMode) -> bool {
        matches!(self, ModeName::Builtin(x) if *x == b)
    }

    pub fn undefined() -> Self {
        ModeName::Builtin(BuiltinMode::Undefined)
    }

    pub fn busy() -> Self {
        ModeName::Builtin(BuiltinMode::Busy)
    }

    pub fn ask() -> Self {
        ModeName::Builtin(BuiltinMode::Ask)
    }

    pub fn charger() -> Self {
        ModeName::Builtin(BuiltinMode::Charger)
    }

    pub fn charging_fallback() -> Self {
        ModeName::Builtin(BuiltinMode::ChargingFallback)
    }

    /// Maps an internal mode to the name that should be signaled over the
    /// bus as the "current" mode. `charging_fallback`/`charging_only` both
    /// present externally as the generic `charging` indicator, matching the
    /// daemon's historical bus behavior (no single internal mode named
    /// "charging" exists; it is purely a display-time mapping).
    pub fn external_name(&self) -> ModeName {
        match self {
            ModeName::Builtin(BuiltinMode::ChargingFallback)
            | ModeName::Builtin(BuiltinMode::ChargingOnly) => ModeName::Dynamic("charging".into()),
            other => other.clone(),
        }
    }
}

impl From<&str> for ModeName {
    fn from(s: &str) -> Self {
        ModeName::new(s)
    }
}

impl From<String> for ModeName {
    fn from(s: String) -> Self {
        ModeName::new(s)
    }
}

impl fmt::Display for ModeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for ModeName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_round_trip() {
        for &b in BuiltinMode::ALL {
            assert_eq!(ModeName::new(b.as_str()), ModeName::Builtin(b));
        }
    }

    #[test]
    fn unknown_name_is_dynamic() {
        assert_eq!(
            ModeName::new("some_vendor_mode"),
            ModeName::Dynamic("some_vendor_mode".into())
        );
    }

    #[test]
    fn charging_fallback_displays_as_charging() {
        assert_eq!(ModeName::charging_fallback().external_name().as_str(), "charging");
    }

    #[test]
    fn byte_exact_comparison() {
        assert_ne!(ModeName::new("Developer"), ModeName::new("developer"));
    }
}
