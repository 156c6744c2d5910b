use crate::config::AppConfig;
use crate::dyn_config::ModeRegistry;
use crate::modes::ModeName;

/// Everything [`resolve`] needs, gathered so it can be unit-tested without
/// constructing a [`crate::control::ControlCore`] (§4.5).
pub struct PolicyInput<'a> {
    pub rescue: bool,
    pub diag: bool,
    pub uid: Option<u32>,
    pub user_changed: bool,
    pub can_export: bool,
    pub registry: &'a ModeRegistry,
    pub config: &'a AppConfig,
}

/// Picks the mode `select_usb_mode` should converge the daemon to (§4.5
/// policy resolver). Pure function of its inputs; cable-driven transitions
/// that bypass the resolver entirely (`Disconnected`→`undefined`,
/// `ChargerConnected`→`charger`) live in [`crate::control`], not here.
pub fn resolve(input: &PolicyInput) -> ModeName {
    if input.rescue {
        return ModeName::new("developer");
    }

    if input.diag {
        return match input.registry.first_name() {
            Some(name) => name.clone(),
            None => ModeName::undefined(),
        };
    }

    let mut mode = input.config.mode_setting(input.uid);

    if mode.is_builtin(crate::modes::BuiltinMode::Ask) {
        mode = match input.uid {
            None => ModeName::charging_fallback(),
            Some(uid) => match single_allowed_mode(input.registry, input.config, uid) {
                Some(only) => only,
                None => ModeName::ask(),
            },
        };
    }

    if !input.can_export || input.user_changed {
        return ModeName::charging_fallback();
    }

    mode
}

/// If exactly one registry mode is both whitelisted and not hidden for
/// `uid`, returns it, collapsing `ask` to a single choice (§4.5 step 4).
fn single_allowed_mode(registry: &ModeRegistry, config: &AppConfig, uid: u32) -> Option<ModeName> {
    let _ = uid;
    let mut allowed = registry
        .names()
        .filter(|name| config.is_whitelisted(name) && !config.is_hidden(name));

    let first = allowed.next()?;
    if allowed.next().is_some() {
        None
    } else {
        Some(first.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::dyn_config::ModeRegistry;

    fn base_input<'a>(registry: &'a ModeRegistry, config: &'a AppConfig) -> PolicyInput<'a> {
        PolicyInput {
            rescue: false,
            diag: false,
            uid: Some(1000),
            user_changed: false,
            can_export: true,
            registry,
            config,
        }
    }

    #[test]
    fn rescue_wins_over_everything() {
        let registry = ModeRegistry::empty();
        let config = AppConfig::default();
        let mut input = base_input(&registry, &config);
        input.rescue = true;
        assert_eq!(resolve(&input), ModeName::new("developer"));
    }

    #[test]
    fn diag_uses_first_registry_mode() {
        let dir = std::env::temp_dir().join(format!("usb-moded-rs-policy-diag-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.ini"), "[mode]\nname = diag_test\n").unwrap();
        let registry = ModeRegistry::load(&dir).unwrap();
        let config = AppConfig::default();
        let mut input = base_input(&registry, &config);
        input.diag = true;
        assert_eq!(resolve(&input), ModeName::new("diag_test"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cannot_export_forces_charging_fallback() {
        let registry = ModeRegistry::empty();
        let mut config = AppConfig::default();
        config.usbmode.mode = Some(ModeName::new("mtp"));
        let mut input = base_input(&registry, &config);
        input.can_export = false;
        assert_eq!(resolve(&input), ModeName::charging_fallback());
    }

    #[test]
    fn user_changed_forces_charging_fallback() {
        let registry = ModeRegistry::empty();
        let mut config = AppConfig::default();
        config.usbmode.mode = Some(ModeName::new("mtp"));
        let mut input = base_input(&registry, &config);
        input.user_changed = true;
        assert_eq!(resolve(&input), ModeName::charging_fallback());
    }

    #[test]
    fn ask_with_unknown_uid_falls_back_to_charging() {
        let registry = ModeRegistry::empty();
        let mut config = AppConfig::default();
        config.usbmode.mode = Some(ModeName::ask());
        let mut input = base_input(&registry, &config);
        input.uid = None;
        assert_eq!(resolve(&input), ModeName::charging_fallback());
    }

    #[test]
    fn ask_collapses_to_single_allowed_mode() {
        let dir = std::env::temp_dir().join(format!("usb-moded-rs-policy-ask-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.ini"), "[mode]\nname = mtp\n").unwrap();
        let registry = ModeRegistry::load(&dir).unwrap();
        let mut config = AppConfig::default();
        config.usbmode.mode = Some(ModeName::ask());
        let input = base_input(&registry, &config);
        assert_eq!(resolve(&input), ModeName::new("mtp"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ask_stays_ask_with_multiple_allowed_modes() {
        let dir = std::env::temp_dir().join(format!("usb-moded-rs-policy-ask-multi-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.ini"), "[mode]\nname = mtp\n").unwrap();
        std::fs::write(dir.join("b.ini"), "[mode]\nname = developer\n").unwrap();
        let registry = ModeRegistry::load(&dir).unwrap();
        let mut config = AppConfig::default();
        config.usbmode.mode = Some(ModeName::ask());
        let input = base_input(&registry, &config);
        assert_eq!(resolve(&input), ModeName::ask());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
