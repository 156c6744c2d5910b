use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use glob::glob;
use indexmap::IndexMap;
use serde::Deserialize;
use simplelog::*;

use crate::error::{Result, UsbModedError};
use crate::modes::ModeName;

// module name for logging engine
const NAME: &str = "<i><bright-black> registry: </>";

pub const MODE_DIR_PATH: &str = "/etc/usb-moded/dyn-modes";
pub const DIAG_DIR_PATH: &str = "/etc/usb-moded/diag";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsTriple {
    pub path: String,
    pub value: String,
    pub reset_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftconnectTriple {
    pub path: String,
    pub connect_value: String,
    pub disconnect_value: Option<String>,
}

/// One dynamic mode definition, as loaded from a `dyn-modes/*.ini` file.
/// Immutable once built; a reload replaces the whole [`ModeRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDefinition {
    pub name: ModeName,
    pub module: Option<String>,
    pub needs_appsync: bool,
    pub needs_network: bool,
    pub is_mass_storage: bool,
    pub network_interface: Option<String>,
    pub sysfs: Option<SysfsTriple>,
    pub softconnect: Option<SoftconnectTriple>,
    pub extra_sysfs: Vec<(String, String)>,
    pub id_product: Option<String>,
    pub id_vendor_override: Option<String>,
    pub nat: bool,
    pub dhcp_server: bool,
    pub tethering: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ModeSection {
    name: String,
    module: Option<String>,
    appsync: bool,
    network: bool,
    mass_storage: bool,
    network_interface: Option<String>,
    sysfs_path: Option<String>,
    sysfs_value: Option<String>,
    sysfs_reset_value: Option<String>,
    #[serde(rename = "idProduct")]
    id_product: Option<String>,
    #[serde(rename = "idVendorOverride")]
    id_vendor_override: Option<String>,
    nat: bool,
    dhcp_server: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct OptionsSection {
    softconnect: Option<String>,
    softconnect_disconnect: Option<String>,
    softconnect_path: Option<String>,
    android_extra_sysfs_path: Option<String>,
    android_extra_sysfs_value: Option<String>,
    android_extra_sysfs_path2: Option<String>,
    android_extra_sysfs_value2: Option<String>,
    android_extra_sysfs_path3: Option<String>,
    android_extra_sysfs_value3: Option<String>,
    android_extra_sysfs_path4: Option<String>,
    android_extra_sysfs_value4: Option<String>,
    connman_tethering: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct DynModeFile {
    mode: ModeSection,
    options: OptionsSection,
}

fn collect_extra_sysfs(opts: &OptionsSection) -> Vec<(String, String)> {
    let pairs = [
        (&opts.android_extra_sysfs_path, &opts.android_extra_sysfs_value),
        (&opts.android_extra_sysfs_path2, &opts.android_extra_sysfs_value2),
        (&opts.android_extra_sysfs_path3, &opts.android_extra_sysfs_value3),
        (&opts.android_extra_sysfs_path4, &opts.android_extra_sysfs_value4),
    ];
    pairs
        .into_iter()
        .filter_map(|(p, v)| match (p, v) {
            (Some(p), Some(v)) => Some((p.clone(), v.clone())),
            _ => None,
        })
        .collect()
}

impl ModeDefinition {
    fn from_file(file: DynModeFile, fallback_name: &str) -> Result<Self> {
        let name = if file.mode.name.is_empty() {
            fallback_name.to_string()
        } else {
            file.mode.name.clone()
        };
        if name.is_empty() {
            return Err(UsbModedError::ConfigMalformed {
                path: PathBuf::from(fallback_name),
                reason: "mode definition has no name".into(),
            });
        }

        let sysfs = file.mode.sysfs_path.clone().map(|path| SysfsTriple {
            path,
            value: file.mode.sysfs_value.clone().unwrap_or_default(),
            reset_value: file.mode.sysfs_reset_value.clone(),
        });

        let softconnect = file.options.softconnect_path.clone().map(|path| SoftconnectTriple {
            path,
            connect_value: file.options.softconnect.clone().unwrap_or_default(),
            disconnect_value: file.options.softconnect_disconnect.clone(),
        });

        Ok(ModeDefinition {
            name: ModeName::new(name),
            module: file.mode.module,
            needs_appsync: file.mode.appsync,
            needs_network: file.mode.network,
            is_mass_storage: file.mode.mass_storage,
            network_interface: file.mode.network_interface,
            sysfs,
            softconnect,
            extra_sysfs: collect_extra_sysfs(&file.options),
            id_product: file.mode.id_product,
            id_vendor_override: file.mode.id_vendor_override,
            nat: file.mode.nat,
            dhcp_server: file.mode.dhcp_server,
            tethering: file.options.connman_tethering,
        })
    }
}

/// Ordered collection of dynamic mode definitions, keyed by name. Iteration
/// order matches the order files were read in (lexical by path), with a
/// later file's definition of the same name superseding the earlier one
/// *and* taking over its position in the order.
#[derive(Debug, Clone, Default)]
pub struct ModeRegistry {
    modes: IndexMap<ModeName, ModeDefinition>,
}

impl ModeRegistry {
    pub fn empty() -> Self {
        ModeRegistry { modes: IndexMap::new() }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let mut modes = IndexMap::new();

        let pattern = dir.join("*.ini");
        let pattern = pattern.to_string_lossy().to_string();

        let mut paths: Vec<PathBuf> = glob(&pattern)
            .map_err(|e| UsbModedError::ConfigMalformed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();

        for path in paths {
            let fallback_name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();

            let parsed: DynModeFile = Config::builder()
                .add_source(File::new(&path.to_string_lossy(), FileFormat::Ini))
                .build()
                .and_then(|c| c.try_deserialize())
                .map_err(|e| UsbModedError::ConfigMalformed {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;

            let def = ModeDefinition::from_file(parsed, &fallback_name)?;
            debug!("{} loaded mode '{}' from {:?}", NAME, def.name, path);

            // A later file's definition supersedes an earlier one with the
            // same name, including taking over its position in the order.
            modes.shift_remove(&def.name);
            modes.insert(def.name.clone(), def);
        }

        info!("{} loaded {} dynamic mode(s) from {:?}", NAME, modes.len(), dir);
        Ok(ModeRegistry { modes })
    }

    pub fn get(&self, name: &ModeName) -> Option<&ModeDefinition> {
        self.modes.get(name)
    }

    pub fn contains(&self, name: &ModeName) -> bool {
        self.modes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &ModeName> {
        self.modes.keys()
    }

    pub fn first_name(&self) -> Option<&ModeName> {
        self.modes.keys().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModeName, &ModeDefinition)> {
        self.modes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn duplicate_name_supersedes_and_keeps_later_position() {
        let dir = std::env::temp_dir().join(format!("usb-moded-rs-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        fs::write(
            dir.join("10-first.ini"),
            "[mode]\nname = vendor_a\nmodule = g_mass_storage\n",
        )
        .unwrap();
        fs::write(
            dir.join("20-second.ini"),
            "[mode]\nname = vendor_b\nmodule = g_ether\n",
        )
        .unwrap();
        fs::write(
            dir.join("30-override.ini"),
            "[mode]\nname = vendor_a\nmodule = g_ncm\n",
        )
        .unwrap();

        let registry = ModeRegistry::load(&dir).unwrap();
        let names: Vec<&str> = registry.names().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["vendor_b", "vendor_a"]);
        assert_eq!(
            registry.get(&ModeName::new("vendor_a")).unwrap().module.as_deref(),
            Some("g_ncm")
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn extra_sysfs_pairs_collected_in_order() {
        let dir = std::env::temp_dir().join(format!("usb-moded-rs-test2-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("a.ini"),
            "[mode]\nname = vendor\n[options]\nandroid_extra_sysfs_path = /sys/a\nandroid_extra_sysfs_value = 1\nandroid_extra_sysfs_path2 = /sys/b\nandroid_extra_sysfs_value2 = 2\n",
        )
        .unwrap();

        let registry = ModeRegistry::load(&dir).unwrap();
        let def = registry.get(&ModeName::new("vendor")).unwrap();
        assert_eq!(
            def.extra_sysfs,
            vec![("/sys/a".to_string(), "1".to_string()), ("/sys/b".to_string(), "2".to_string())]
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
