use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use simplelog::*;

use super::{first_udc_name, normalize_hex_id, write_file, write_if_different, GadgetBackend};
use crate::config::AppConfig;
use crate::error::{Result, UsbModedError};

// module name for logging engine
const NAME: &str = "<i><bright-black> configfs: </>";

const FUNCTION_MASS_STORAGE: &str = "mass_storage.usb0";
const FUNCTION_RNDIS: &str = "rndis_bam.rndis";
const FUNCTION_MTP: &str = "ffs.mtp";

const CHARGING_PRODUCT_ID: &str = "0AFE";

/// Picks the RNDIS `ethaddr` to write: a configured override, else the
/// host's own MAC address (mirroring the teacher's own `mac_address` use
/// for its Wi-Fi AP, repurposed for the gadget-side Ethernet function),
/// else a fixed locally-administered fallback so the attribute write
/// never fails for lack of a host interface.
fn rndis_ethaddr(config: &AppConfig) -> String {
    if let Some(mac) = &config.android.rndis_mac {
        return mac.clone();
    }
    match mac_address::get_mac_address() {
        Ok(Some(mac)) => mac.to_string(),
        _ => "02:00:00:00:00:01".to_string(),
    }
}

/// Normalizes the handful of high-level names usb-moded itself (and
/// existing config files) use into the backend-specific function
/// directory name. Anything else is passed through verbatim (§9: unknown
/// function names succeed iff the kernel accepts the `mkdir`).
fn map_function(func: &str) -> String {
    match func {
        "mass_storage" => FUNCTION_MASS_STORAGE.to_string(),
        "rndis" => FUNCTION_RNDIS.to_string(),
        "mtp" | "ffs" => FUNCTION_MTP.to_string(),
        other => other.to_string(),
    }
}

/// ConfigFS USB gadget backend (§4.1, §6). Root defaults to
/// `/config/usb_gadget/g1`; overridable for tests.
pub struct ConfigFsBackend {
    gadget_root: PathBuf,
    udc_class_dir: PathBuf,
    probed: Option<bool>,
    /// `--udc <name>` override; bypasses [`first_udc_name`] discovery.
    forced_udc: Option<String>,
}

impl ConfigFsBackend {
    pub fn new(gadget_root: PathBuf, udc_class_dir: PathBuf) -> Self {
        ConfigFsBackend {
            gadget_root,
            udc_class_dir,
            probed: None,
            forced_udc: None,
        }
    }

    pub fn production() -> Self {
        Self::new(PathBuf::from("/config/usb_gadget/g1"), PathBuf::from("/sys/class/udc"))
    }

    pub fn with_forced_udc(mut self, udc: Option<String>) -> Self {
        self.forced_udc = udc;
        self
    }

    fn config_dir(&self) -> PathBuf {
        self.gadget_root.join("configs/b.1")
    }

    fn functions_dir(&self) -> PathBuf {
        self.gadget_root.join("functions")
    }

    fn udc_path(&self) -> PathBuf {
        self.gadget_root.join("UDC")
    }

    fn function_path(&self, func: &str) -> PathBuf {
        self.functions_dir().join(func)
    }

    fn config_path(&self, func: &str) -> PathBuf {
        self.config_dir().join(func)
    }

    fn register_function(&self, func: &str) -> Result<PathBuf> {
        let path = self.function_path(func);
        if !path.is_dir() {
            std::fs::create_dir_all(&path).map_err(|e| UsbModedError::transient_io(&path, e))?;
        }
        debug!("{} function {} is registered", NAME, func);
        Ok(path)
    }

    fn enable_function(&self, func: &str) -> Result<()> {
        let fpath = self.register_function(func)?;
        let cpath = self.config_path(func);

        if cpath.exists() || cpath.symlink_metadata().is_ok() {
            std::fs::remove_file(&cpath).map_err(|e| UsbModedError::transient_io(&cpath, e))?;
        }
        unix_fs::symlink(&fpath, &cpath).map_err(|e| UsbModedError::transient_io(&cpath, e))?;
        debug!("{} function {} is enabled", NAME, func);
        Ok(())
    }

    fn disable_all_functions(&self) -> Result<()> {
        let dir = self.config_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(UsbModedError::transient_io(&dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| UsbModedError::transient_io(&dir, e))?;
            if entry.path().symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                std::fs::remove_file(entry.path())
                    .map_err(|e| UsbModedError::transient_io(&entry.path(), e))?;
            }
        }
        debug!("{} all functions are disabled", NAME);
        Ok(())
    }
}

impl GadgetBackend for ConfigFsBackend {
    fn probe(&mut self) -> bool {
        if self.probed.is_none() {
            let present = self.gadget_root.exists();
            warn!("{} CONFIGFS {}detected", NAME, if present { "" } else { "not " });
            self.probed = Some(present);
        }
        self.probed == Some(true)
    }

    fn in_use(&self) -> bool {
        match self.probed {
            None => {
                debug!("{} in_use() called before probe()", NAME);
                false
            }
            Some(p) => p,
        }
    }

    fn init_defaults(&mut self, config: &AppConfig) -> Result<()> {
        if !self.probe() {
            return Ok(());
        }

        self.set_udc(false)?;

        if let Some(v) = &config.android.vendor_id {
            let _ = write_file(&self.gadget_root.join("idVendor"), &normalize_hex_id(v)?);
        }
        if let Some(v) = &config.android.product_id {
            let _ = write_file(&self.gadget_root.join("idProduct"), &normalize_hex_id(v)?);
        }
        if let Some(v) = &config.android.manufacturer {
            let _ = write_file(&self.gadget_root.join("strings/0x409/manufacturer"), v);
        }
        if let Some(v) = &config.android.product {
            let _ = write_file(&self.gadget_root.join("strings/0x409/product"), v);
        }

        self.register_function(FUNCTION_MASS_STORAGE)?;

        self.register_function(FUNCTION_MTP)?;
        if !Path::new("/dev/mtp/ep0").exists() {
            debug!("{} would mount functionfs at /dev/mtp", NAME);
        }

        self.register_function(FUNCTION_RNDIS)?;
        let rndis_dir = self.function_path(FUNCTION_RNDIS);
        write_file(&rndis_dir.join("wceis"), "1")?;
        write_file(&rndis_dir.join("ethaddr"), &rndis_ethaddr(config))?;

        Ok(())
    }

    fn set_charging_mode(&mut self) -> Result<()> {
        self.set_function("mass_storage")?;
        self.set_product_id(CHARGING_PRODUCT_ID)?;
        self.set_udc(true)?;
        Ok(())
    }

    fn set_function(&mut self, func: &str) -> Result<()> {
        if !self.in_use() {
            return Err(UsbModedError::BackendUnavailable);
        }

        let func = map_function(func);

        self.set_udc(false)?;
        self.disable_all_functions()?;
        self.enable_function(&func)?;

        if func == FUNCTION_MTP {
            debug!("{} would start MTP daemon, waiting 1500ms", NAME);
            std::thread::sleep(std::time::Duration::from_millis(1500));
        }

        debug!("{} set_function({}) -> ok", NAME, func);
        Ok(())
    }

    fn clear_functions(&mut self) -> Result<()> {
        self.disable_all_functions()
    }

    fn set_udc(&mut self, enable: bool) -> Result<()> {
        debug!("{} UDC - {}", NAME, if enable { "ENABLE" } else { "DISABLE" });
        let value = if enable {
            match &self.forced_udc {
                Some(name) => name.clone(),
                None => first_udc_name(&self.udc_class_dir)?.unwrap_or_default(),
            }
        } else {
            String::new()
        };
        write_if_different(&self.udc_path(), &value)
    }

    fn set_vendor_id(&mut self, id: &str) -> Result<()> {
        if !self.in_use() {
            return Ok(());
        }
        write_file(&self.gadget_root.join("idVendor"), &normalize_hex_id(id)?)
    }

    fn set_product_id(&mut self, id: &str) -> Result<()> {
        if !self.in_use() {
            return Ok(());
        }
        write_file(&self.gadget_root.join("idProduct"), &normalize_hex_id(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_backend(tag: &str) -> (PathBuf, ConfigFsBackend) {
        let dir = std::env::temp_dir().join(format!("usb-moded-rs-configfs-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let root = dir.join("g1");
        fs::create_dir_all(root.join("configs/b.1")).unwrap();
        fs::create_dir_all(root.join("functions")).unwrap();
        fs::create_dir_all(root.join("strings/0x409")).unwrap();
        fs::write(root.join("UDC"), "").unwrap();
        let udc_class = dir.join("udc_class");
        fs::create_dir_all(&udc_class).unwrap();
        let backend = ConfigFsBackend::new(root, udc_class);
        (dir, backend)
    }

    #[test]
    fn probe_detects_root() {
        let (dir, mut backend) = make_backend("probe");
        assert!(backend.probe());
        assert!(backend.in_use());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn set_function_creates_symlink_and_clears_previous() {
        let (dir, mut backend) = make_backend("setfn");
        backend.probe();
        backend.set_function("mass_storage").unwrap();
        assert!(backend.config_path(FUNCTION_MASS_STORAGE).exists());

        backend.set_function("rndis").unwrap();
        assert!(backend.config_path(FUNCTION_MASS_STORAGE).symlink_metadata().is_err());
        assert!(backend.config_path(FUNCTION_RNDIS).exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_function_name_passes_through() {
        let (dir, mut backend) = make_backend("unknown");
        backend.probe();
        backend.set_function("vendor_special").unwrap();
        assert!(backend.config_path("vendor_special").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn id_normalization_rejects_bad_input() {
        let (dir, mut backend) = make_backend("badid");
        backend.probe();
        assert!(backend.set_product_id("nothex").is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
