use std::path::PathBuf;

use usb_moded_rs::config::AppConfig;

/// Dumps `AppConfig::default()` to `/etc/usb-moded/usb-moded.ini`-formatted
/// output, either to a path given as the sole argument or to stdout.
/// Grounded on the teacher's own `generate_config` binary, which did the
/// same for its own (JSON-schema-backed) config shape.
fn main() {
    let default_config = AppConfig::default();

    match std::env::args().nth(1) {
        Some(path) => {
            let path = PathBuf::from(path);
            default_config
                .save(&path)
                .unwrap_or_else(|e| panic!("failed to write default config to {path:?}: {e}"));
            println!("wrote default configuration to {}", path.display());
        }
        None => {
            let tmp = std::env::temp_dir().join("usb-moded-rs-default.ini");
            default_config.save(&tmp).expect("failed to render default config");
            print!("{}", std::fs::read_to_string(&tmp).expect("failed to read back rendered config"));
            let _ = std::fs::remove_file(&tmp);
        }
    }
}
