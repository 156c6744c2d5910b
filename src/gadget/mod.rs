pub mod android;
pub mod configfs;

use std::fs;
use std::path::Path;

use simplelog::*;

use crate::config::AppConfig;
use crate::error::{Result, UsbModedError};

// module name for logging engine
const NAME: &str = "<i><bright-black> gadget: </>";

/// Backend-agnostic gadget programming surface (§4.1). Both
/// [`android::AndroidSysfsBackend`] and [`configfs::ConfigFsBackend`]
/// implement the same four operations; the worker never knows which one
/// it is driving.
pub trait GadgetBackend: Send {
    /// Detects whether the platform exposes this backend's root path.
    /// Must be called at least once before [`GadgetBackend::in_use`]
    /// returns anything meaningful (probing discipline, §4.1).
    fn probe(&mut self) -> bool;

    /// Whether a prior [`GadgetBackend::probe`] succeeded.
    fn in_use(&self) -> bool;

    fn init_defaults(&mut self, config: &AppConfig) -> Result<()>;

    fn set_charging_mode(&mut self) -> Result<()>;

    fn set_function(&mut self, func: &str) -> Result<()>;

    /// Clears every currently-enabled gadget function without selecting a
    /// replacement (§8 scenario 4: disconnect must detach UDC *and* clear
    /// all function symlinks, not just leave the last mode's functions
    /// dangling under the gadget tree).
    fn clear_functions(&mut self) -> Result<()>;

    fn set_udc(&mut self, enable: bool) -> Result<()>;

    fn set_vendor_id(&mut self, id: &str) -> Result<()>;

    fn set_product_id(&mut self, id: &str) -> Result<()>;
}

fn hex_id_regex() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[0-9A-Fa-f]{1,4}$").unwrap())
}

/// Config files hold ids like `"0A02"`; the kernel wants `"0x0a02"`.
/// Validates the invariant from spec §8 (ids are `[0-9A-Fa-f]{1..4}`) and
/// rewrites to the zero-padded, lowercase, `0x`-prefixed kernel form.
pub fn normalize_hex_id(id: &str) -> Result<String> {
    if !hex_id_regex().is_match(id) {
        return Err(UsbModedError::ConfigMalformed {
            path: std::path::PathBuf::from("<id>"),
            reason: format!("'{id}' is not a valid hex USB id"),
        });
    }
    let num = u32::from_str_radix(id, 16).expect("validated by hex_id_regex above");
    Ok(format!("0x{num:04x}"))
}

pub(crate) fn write_file(path: &Path, text: &str) -> Result<()> {
    debug!("{} WRITE {:?} '{}'", NAME, path, text);
    fs::write(path, text).map_err(|e| UsbModedError::transient_io(path, e))
}

pub(crate) fn read_file(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path).map_err(|e| UsbModedError::transient_io(path, e))?;
    Ok(text.trim().to_string())
}

/// Writes `text` to `path` only if its current contents differ, mirroring
/// `configfs_write_udc`'s read-before-write discipline (a second identical
/// write to e.g. `UDC` is harmless but logs noisily and can momentarily
/// glitch the host-visible gadget).
pub(crate) fn write_if_different(path: &Path, text: &str) -> Result<()> {
    if let Ok(current) = read_file(path) {
        if current == text {
            return Ok(());
        }
    }
    write_file(path, text)
}

/// Finds the first non-dotfile symlink under `udc_class_dir`
/// (`/sys/class/udc` in production), i.e. the kernel's USB Device
/// Controller name.
pub(crate) fn first_udc_name(udc_class_dir: &Path) -> Result<Option<String>> {
    let entries = match fs::read_dir(udc_class_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(UsbModedError::transient_io(udc_class_dir, e)),
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_short_form() {
        assert_eq!(normalize_hex_id("0A02").unwrap(), "0x0a02");
        assert_eq!(normalize_hex_id("afe").unwrap(), "0x0afe");
        assert_eq!(normalize_hex_id("1").unwrap(), "0x0001");
    }

    #[test]
    fn rejects_non_hex() {
        assert!(normalize_hex_id("zzzz").is_err());
        assert!(normalize_hex_id("12345").is_err());
        assert!(normalize_hex_id("").is_err());
    }
}
