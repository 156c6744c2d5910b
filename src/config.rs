use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use config::{Config as ConfigSource, File, FileFormat};
use serde::Deserialize;
use simplelog::*;

use crate::error::{Result, UsbModedError};
use crate::modes::ModeName;

// module name for logging engine
const NAME: &str = "<i><bright-black> config: </>";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/usb-moded/usb-moded.ini";

fn comma_list(s: &str) -> Vec<ModeName> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ModeName::new)
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AndroidSection {
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Fixed `rndis_bam.rndis/ethaddr` override. When absent, the
    /// ConfigFS backend derives one from the host's own MAC address.
    pub rndis_mac: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct UdevSection {
    pub path: Option<String>,
    pub subsystem: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TriggerSection {
    pub subsystem: Option<String>,
    pub mode: Option<String>,
    pub property: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct MountpointsSection {
    pub mount: Option<String>,
    pub alt_mount: Option<String>,
    pub sync: bool,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkTechConfig {
    pub ip: Option<String>,
    pub interface: Option<String>,
    pub nat: bool,
}

/// Per-user and global mode preferences, the `usbmode` config group.
/// `mode-<uid>` keys do not fit a static struct shape, so they are parsed
/// out of the raw key table separately (see [`AppConfig::load`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbModeSection {
    pub mode: Option<ModeName>,
    pub hide: Vec<ModeName>,
    pub whitelist: Vec<ModeName>,
    pub per_user: HashMap<u32, ModeName>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    pub android: AndroidSection,
    pub udev: UdevSection,
    pub trigger: TriggerSection,
    pub mountpoints: MountpointsSection,
    pub network: HashMap<String, NetworkTechConfig>,
    pub usbmode: UsbModeSection,
}

impl AppConfig {
    /// Loads from `path`, falling back to built-in defaults for any
    /// group/key that is absent (including a wholly missing file).
    pub fn load(path: &Path) -> Result<Self> {
        let source = ConfigSource::builder()
            .add_source(File::new(&path.to_string_lossy(), FileFormat::Ini).required(false))
            .build()
            .map_err(|e| UsbModedError::ConfigMalformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let android: AndroidSection = source.get("android").unwrap_or_default();
        let udev: UdevSection = source.get("udev").unwrap_or_default();
        let trigger: TriggerSection = source.get("trigger").unwrap_or_default();
        let mountpoints: MountpointsSection = source.get("mountpoints").unwrap_or_default();

        let mut network = HashMap::new();
        if let Ok(table) = source.get_table("network") {
            for (tech, _) in table {
                if let Ok(cfg) = source.get::<NetworkTechConfig>(&format!("network.{tech}")) {
                    network.insert(tech, cfg);
                }
            }
        }

        let mut usbmode = UsbModeSection::default();
        if let Ok(table) = source.get_table("usbmode") {
            for (key, value) in table {
                let Ok(value) = value.into_string() else { continue };
                if key == "mode" {
                    usbmode.mode = Some(ModeName::new(value));
                } else if key == "hide" {
                    usbmode.hide = comma_list(&value);
                } else if key == "whitelist" {
                    usbmode.whitelist = comma_list(&value);
                } else if let Some(uid) = key.strip_prefix("mode-").and_then(|s| s.parse::<u32>().ok()) {
                    usbmode.per_user.insert(uid, ModeName::new(value));
                }
            }
        }

        info!("{} loaded configuration from {:?}", NAME, path);

        Ok(AppConfig {
            android,
            udev,
            trigger,
            mountpoints,
            network,
            usbmode,
        })
    }

    /// Preferred mode for `uid`, falling back to the global default, and
    /// finally to `ask` when nothing at all is configured.
    pub fn mode_setting(&self, uid: Option<u32>) -> ModeName {
        if let Some(uid) = uid {
            if let Some(mode) = self.usbmode.per_user.get(&uid) {
                return mode.clone();
            }
        }
        self.usbmode
            .mode
            .clone()
            .unwrap_or_else(ModeName::ask)
    }

    pub fn is_hidden(&self, mode: &ModeName) -> bool {
        self.usbmode.hide.contains(mode)
    }

    pub fn is_whitelisted(&self, mode: &ModeName) -> bool {
        self.usbmode.whitelist.is_empty() || self.usbmode.whitelist.contains(mode)
    }

    /// Applies a bus `set_config(entry, key, value)` request in memory and
    /// persists the whole file back to disk. The on-disk format is
    /// read-mostly key-value groups, so the writer does not attempt to
    /// preserve comments or formatting the way a TOML document editor would.
    pub fn set_config_setting(&mut self, entry: &str, key: &str, value: &str) -> Result<()> {
        match (entry, key) {
            ("usbmode", "mode") => self.usbmode.mode = Some(ModeName::new(value)),
            ("usbmode", "hide") => self.usbmode.hide = comma_list(value),
            ("usbmode", "whitelist") => self.usbmode.whitelist = comma_list(value),
            ("usbmode", k) if k.starts_with("mode-") => {
                if let Some(uid) = k.strip_prefix("mode-").and_then(|s| s.parse::<u32>().ok()) {
                    self.usbmode.per_user.insert(uid, ModeName::new(value));
                }
            }
            ("android", "vendor_id") => self.android.vendor_id = Some(value.to_string()),
            ("android", "product_id") => self.android.product_id = Some(value.to_string()),
            ("android", "manufacturer") => self.android.manufacturer = Some(value.to_string()),
            ("android", "product") => self.android.product = Some(value.to_string()),
            ("android", "rndis_mac") => self.android.rndis_mac = Some(value.to_string()),
            _ => {
                warn!("{} set_config: unknown entry/key {}/{}", NAME, entry, key);
                return Err(UsbModedError::ConfigMalformed {
                    path: PathBuf::from(DEFAULT_CONFIG_PATH),
                    reason: format!("unknown config entry/key {entry}/{key}"),
                });
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::new();

        let _ = writeln!(out, "[android]");
        if let Some(v) = &self.android.vendor_id {
            let _ = writeln!(out, "vendor_id = {v}");
        }
        if let Some(v) = &self.android.product_id {
            let _ = writeln!(out, "product_id = {v}");
        }
        if let Some(v) = &self.android.manufacturer {
            let _ = writeln!(out, "manufacturer = {v}");
        }
        if let Some(v) = &self.android.product {
            let _ = writeln!(out, "product = {v}");
        }
        if let Some(v) = &self.android.rndis_mac {
            let _ = writeln!(out, "rndis_mac = {v}");
        }

        let _ = writeln!(out, "\n[usbmode]");
        if let Some(v) = &self.usbmode.mode {
            let _ = writeln!(out, "mode = {v}");
        }
        if !self.usbmode.hide.is_empty() {
            let joined = self.usbmode.hide.iter().map(ModeName::as_str).collect::<Vec<_>>().join(",");
            let _ = writeln!(out, "hide = {joined}");
        }
        if !self.usbmode.whitelist.is_empty() {
            let joined = self.usbmode.whitelist.iter().map(ModeName::as_str).collect::<Vec<_>>().join(",");
            let _ = writeln!(out, "whitelist = {joined}");
        }
        for (uid, mode) in &self.usbmode.per_user {
            let _ = writeln!(out, "mode-{uid} = {mode}");
        }

        fs::write(path, out).map_err(|e| UsbModedError::transient_io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = AppConfig::load(Path::new("/nonexistent/usb-moded.ini")).unwrap();
        assert_eq!(cfg.mode_setting(None), ModeName::ask());
    }

    #[test]
    fn per_user_mode_overrides_global() {
        let dir = std::env::temp_dir().join(format!("usb-moded-rs-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("usb-moded.ini");
        fs::write(
            &path,
            "[usbmode]\nmode = ask\nmode-1000 = mtp\nhide = host\nwhitelist = mtp,developer\n",
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.mode_setting(Some(1000)), ModeName::new("mtp"));
        assert_eq!(cfg.mode_setting(Some(2000)), ModeName::ask());
        assert!(cfg.is_hidden(&ModeName::new("host")));
        assert!(cfg.is_whitelisted(&ModeName::new("mtp")));
        assert!(!cfg.is_whitelisted(&ModeName::new("host")));

        let _ = fs::remove_dir_all(&dir);
    }
}
