use std::fs;
use std::path::Path;

use simplelog::*;

// module name for logging engine
const NAME: &str = "<i><bright-black> wakelock: </>";

const WAKE_LOCK_PATH: &str = "/sys/power/wake_lock";
const WAKE_UNLOCK_PATH: &str = "/sys/power/wake_unlock";
const LOCK_NAME: &str = "usb_moded";

/// RAII wake lock held while a cable event is being read and dispatched
/// (§4.3: the netlink read and the resulting mode switch must not race a
/// suspend). Degrades to a logged no-op on platforms without Android's
/// wake lock sysfs interface, rather than failing the whole detector.
pub struct WakeLock {
    held: bool,
}

impl WakeLock {
    pub fn acquire() -> Self {
        match fs::write(WAKE_LOCK_PATH, LOCK_NAME) {
            Ok(()) => {
                debug!("{} acquired {}", NAME, LOCK_NAME);
                WakeLock { held: true }
            }
            Err(e) => {
                debug!("{} wake lock unavailable ({}), continuing without it", NAME, e);
                WakeLock { held: false }
            }
        }
    }

    fn release(&mut self) {
        if self.held {
            if let Err(e) = fs::write(WAKE_UNLOCK_PATH, LOCK_NAME) {
                warn!("{} failed to release {}: {}", NAME, LOCK_NAME, e);
            } else {
                debug!("{} released {}", NAME, LOCK_NAME);
            }
            self.held = false;
        }
    }
}

impl Drop for WakeLock {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn supported() -> bool {
    Path::new(WAKE_LOCK_PATH).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_on_platform_without_wakelocks_does_not_panic() {
        let lock = WakeLock::acquire();
        drop(lock);
        let _ = supported();
    }
}
