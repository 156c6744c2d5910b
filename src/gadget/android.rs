use std::path::PathBuf;

use simplelog::*;

use super::{normalize_hex_id, write_file, GadgetBackend};
use crate::config::AppConfig;
use crate::error::{Result, UsbModedError};

// module name for logging engine
const NAME: &str = "<i><bright-black> android: </>";

const CHARGING_PRODUCT_ID: &str = "0AFE";

/// Legacy `android_usb` sysfs USB gadget backend (§4.1, §6). Root defaults
/// to `/sys/class/android_usb/android0`; overridable for tests.
pub struct AndroidSysfsBackend {
    root: PathBuf,
    probed: Option<bool>,
}

impl AndroidSysfsBackend {
    pub fn new(root: PathBuf) -> Self {
        AndroidSysfsBackend { root, probed: None }
    }

    pub fn production() -> Self {
        Self::new(PathBuf::from("/sys/class/android_usb/android0"))
    }

    fn enable_path(&self) -> PathBuf {
        self.root.join("enable")
    }

    fn functions_path(&self) -> PathBuf {
        self.root.join("functions")
    }
}

impl GadgetBackend for AndroidSysfsBackend {
    fn probe(&mut self) -> bool {
        if self.probed.is_none() {
            let present = self.root.exists();
            warn!("{} android_usb {}detected", NAME, if present { "" } else { "not " });
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

        write_file(&self.enable_path(), "0")?;

        if let Some(v) = &config.android.vendor_id {
            let _ = write_file(&self.root.join("idVendor"), &normalize_hex_id(v)?);
        }
        if let Some(v) = &config.android.product_id {
            let _ = write_file(&self.root.join("idProduct"), &normalize_hex_id(v)?);
        }
        if let Some(v) = &config.android.manufacturer {
            let _ = write_file(&self.root.join("iManufacturer"), v);
        }
        if let Some(v) = &config.android.product {
            let _ = write_file(&self.root.join("iProduct"), v);
        }

        Ok(())
    }

    fn set_charging_mode(&mut self) -> Result<()> {
        if !self.in_use() {
            return Err(UsbModedError::BackendUnavailable);
        }
        write_file(&self.enable_path(), "0")?;
        write_file(&self.functions_path(), "mass_storage")?;
        self.set_product_id(CHARGING_PRODUCT_ID)?;
        write_file(&self.enable_path(), "1")?;
        Ok(())
    }

    fn set_function(&mut self, func: &str) -> Result<()> {
        if !self.in_use() {
            return Err(UsbModedError::BackendUnavailable);
        }
        write_file(&self.enable_path(), "0")?;
        write_file(&self.functions_path(), func)?;
        write_file(&self.enable_path(), "1")?;
        debug!("{} set_function({}) -> ok", NAME, func);
        Ok(())
    }

    /// The android_usb interface has no separate UDC-attach step: `enable`
    /// already performs it. Kept for trait symmetry with the ConfigFS
    /// backend so the worker can treat both uniformly (§4.4 step 6).
    fn set_udc(&mut self, enable: bool) -> Result<()> {
        write_file(&self.enable_path(), if enable { "1" } else { "0" })
    }

    /// android_usb has no per-function symlinks to unlink; clearing means
    /// disabling and blanking the `functions` list so no function stays
    /// selected (mirrors ConfigFS's `disable_all_functions`).
    fn clear_functions(&mut self) -> Result<()> {
        if !self.in_use() {
            return Ok(());
        }
        write_file(&self.enable_path(), "0")?;
        write_file(&self.functions_path(), "")
    }

    fn set_vendor_id(&mut self, id: &str) -> Result<()> {
        if !self.in_use() {
            return Ok(());
        }
        write_file(&self.root.join("idVendor"), &normalize_hex_id(id)?)
    }

    fn set_product_id(&mut self, id: &str) -> Result<()> {
        if !self.in_use() {
            return Ok(());
        }
        write_file(&self.root.join("idProduct"), &normalize_hex_id(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_backend(tag: &str) -> (PathBuf, AndroidSysfsBackend) {
        let root = std::env::temp_dir().join(format!("usb-moded-rs-android-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("enable"), "0").unwrap();
        fs::write(root.join("functions"), "").unwrap();
        (root.clone(), AndroidSysfsBackend::new(root))
    }

    #[test]
    fn probe_and_set_function() {
        let (dir, mut backend) = make_backend("setfn");
        assert!(backend.probe());
        backend.set_function("mtp,adb").unwrap();
        assert_eq!(fs::read_to_string(dir.join("functions")).unwrap(), "mtp,adb");
        assert_eq!(fs::read_to_string(dir.join("enable")).unwrap(), "1");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn not_probed_refuses_to_program() {
        let (dir, mut backend) = make_backend("unprobed");
        assert!(!backend.in_use());
        assert!(backend.set_function("mtp").is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
