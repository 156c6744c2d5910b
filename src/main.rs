use std::path::PathBuf;

use clap::Parser;
use humantime::format_duration;
use simplelog::*;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use usb_moded_rs::cable;
use usb_moded_rs::config;
use usb_moded_rs::control::{BusSignal, ControlCore};
use usb_moded_rs::dbus_service::{self, ControlCommand, OutboundSignal};
use usb_moded_rs::dyn_config::{self, ModeRegistry};
use usb_moded_rs::gadget::android::AndroidSysfsBackend;
use usb_moded_rs::gadget::configfs::ConfigFsBackend;
use usb_moded_rs::gadget::GadgetBackend;
use usb_moded_rs::modes::{BuiltinMode, ModeName};
use usb_moded_rs::worker::{self, WorkerRequest};

// module name for logging engine
const NAME: &str = "<i><bright-black> main: </>";

/// USB gadget mode control daemon
#[derive(Parser, Debug)]
#[clap(version, long_about = None)]
struct Args {
    /// Config file path
    #[clap(short, long, value_parser, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug-level logging
    #[clap(long)]
    debug: bool,

    /// Log file path
    #[clap(long, value_parser, default_value = "/var/log/usb-moded-rs.log")]
    log_file: PathBuf,

    /// Force the rescue-mode policy branch (always resolves to `developer`)
    #[clap(long)]
    rescue: bool,

    /// Load mode definitions from the diagnostic directory and force the
    /// diag-mode policy branch
    #[clap(long)]
    diag: bool,

    /// Force a specific UDC name instead of discovering it under
    /// `/sys/class/udc` (ConfigFS backend only)
    #[clap(long)]
    udc: Option<String>,

    /// Treat the cable as permanently connected to this UID instead of
    /// tracking the foreground session (full session tracking is an
    /// external collaborator this daemon does not implement, see DESIGN.md)
    #[clap(long)]
    uid: Option<u32>,

    /// Read fake power-supply events from stdin instead of opening a real
    /// netlink socket (development/test aid for exercising the cable
    /// detector without hardware): lines of the form
    /// `present=1 online=1 type=USB`
    #[clap(long)]
    fake_udev: bool,
}

fn logging_init(debug: bool, log_path: &PathBuf) {
    let conf = ConfigBuilder::new()
        .set_time_format("%F, %H:%M:%S%.3f".to_string())
        .set_write_log_enable_colors(true)
        .build();

    let mut loggers = vec![];

    let requested_level = if debug { LevelFilter::Debug } else { LevelFilter::Info };

    let console_logger: Box<dyn SharedLogger> = TermLogger::new(
        requested_level,
        conf.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
    loggers.push(console_logger);

    match std::fs::OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(logfile) => loggers.push(WriteLogger::new(requested_level, conf, logfile)),
        Err(e) => {
            eprintln!("{} error opening log file {:?}: {}", NAME, log_path, e);
        }
    }

    CombinedLogger::init(loggers).expect("cannot initialize logging subsystem");
}

/// Picks the gadget backend to run with (§4.1 probing discipline): prefers
/// ConfigFS, falls back to the legacy android_usb sysfs interface. Fatal
/// (exit code 1) if neither is available, per §7 `BackendUnavailable`.
fn select_backend(forced_udc: Option<String>) -> Box<dyn GadgetBackend> {
    let mut configfs = ConfigFsBackend::production().with_forced_udc(forced_udc);
    if configfs.probe() {
        info!("{} using ConfigFS gadget backend", NAME);
        return Box::new(configfs);
    }

    let mut android = AndroidSysfsBackend::production();
    if android.probe() {
        info!("{} using android_usb sysfs gadget backend", NAME);
        return Box::new(android);
    }

    error!("{} no usable USB gadget backend found (neither configfs nor android_usb)", NAME);
    std::process::exit(1);
}

fn registry_dir(diag: bool) -> &'static str {
    if diag {
        dyn_config::DIAG_DIR_PATH
    } else {
        dyn_config::MODE_DIR_PATH
    }
}

/// Comma-joined mode names a bus client can be told about (§6 `get_modes`
/// / `get_available_modes`). `require_whitelisted` additionally filters to
/// the per-mode whitelist, matching the "available" vs. merely "known"
/// distinction the bus surface makes.
fn mode_list(core: &ControlCore, require_whitelisted: bool) -> String {
    let mut names: Vec<String> = Vec::new();

    for &b in BuiltinMode::ALL {
        if matches!(b, BuiltinMode::Undefined | BuiltinMode::Busy | BuiltinMode::Ask) {
            continue;
        }
        let name = ModeName::Builtin(b);
        if core.config().is_hidden(&name) {
            continue;
        }
        if require_whitelisted && !core.config().is_whitelisted(&name) {
            continue;
        }
        names.push(b.as_str().to_string());
    }

    for name in core.registry().names() {
        if core.config().is_hidden(name) {
            continue;
        }
        if require_whitelisted && !core.config().is_whitelisted(name) {
            continue;
        }
        names.push(name.as_str().to_string());
    }

    names.join(",")
}

fn hidden_mode_list(core: &ControlCore) -> String {
    core.config().usbmode.hide.iter().map(ModeName::as_str).collect::<Vec<_>>().join(",")
}

fn handle_command(core: &mut ControlCore, config_path: &std::path::Path, cmd: ControlCommand) {
    match cmd {
        ControlCommand::SetMode(mode) => {
            info!("{} bus request: set_mode({})", NAME, mode);
            core.set_usb_mode(ModeName::new(mode));
        }
        ControlCommand::GetMode(reply) => {
            let _ = reply.send(core.external_mode().to_string());
        }
        ControlCommand::GetTargetMode(reply) => {
            let _ = reply.send(core.target_mode().to_string());
        }
        ControlCommand::GetModes(reply) => {
            let _ = reply.send(mode_list(core, false));
        }
        ControlCommand::GetHiddenModes(reply) => {
            let _ = reply.send(hidden_mode_list(core));
        }
        ControlCommand::GetAvailableModes(reply) => {
            let _ = reply.send(mode_list(core, true));
        }
        ControlCommand::SetConfig(entry, key, value) => {
            info!("{} bus request: set_config({}, {}, {})", NAME, entry, key, value);
            match core.config_mut().set_config_setting(&entry, &key, &value) {
                Ok(()) => {
                    if let Err(e) = core.config().save(config_path) {
                        error!("{} failed to persist config: {}", NAME, e);
                    }
                }
                Err(e) => warn!("{} rejected set_config: {}", NAME, e),
            }
        }
    }
}

/// Parses one `--fake-udev` stdin line of the form
/// `present=1 online=1 type=USB` into a [`cable::PowerSupplyEvent`].
fn parse_fake_event(line: &str) -> cable::PowerSupplyEvent {
    let mut event = cable::PowerSupplyEvent::default();
    for field in line.split_whitespace() {
        if let Some((key, value)) = field.split_once('=') {
            match key {
                "present" => event.present = Some(value == "1"),
                "online" => event.online = Some(value == "1"),
                "type" => event.kind = Some(value.to_string()),
                _ => {}
            }
        }
    }
    event
}

fn spawn_cable_source(args: &Args, config: &config::AppConfig, tx: mpsc::UnboundedSender<cable::PowerSupplyEvent>) {
    if args.fake_udev {
        info!("{} fake-udev mode: reading power-supply events from stdin", NAME);
        tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, BufReader};
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(parse_fake_event(&line)).is_err() {
                    return;
                }
            }
        });
        return;
    }

    let configured = config.udev.path.as_deref();
    let sysname = cable::select_power_supply(configured, std::path::Path::new("/sys/class/power_supply"));
    match sysname {
        Some(sysname) => {
            std::thread::spawn(move || cable::uevent_listener(sysname, tx));
        }
        None => {
            warn!("{} no power_supply device found to monitor; cable state will stay unknown", NAME);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = config::AppConfig::load(&args.config)?;
    info!("{} loaded configuration from {:?}", NAME, args.config);

    let registry = match ModeRegistry::load(std::path::Path::new(registry_dir(args.diag))) {
        Ok(r) => r,
        Err(e) => {
            error!("{} fatal: failed to load mode registry: {}", NAME, e);
            std::process::exit(1);
        }
    };
    info!("{} loaded {} dynamic mode(s)", NAME, registry.len());
    if args.diag && registry.is_empty() {
        error!("{} fatal: --diag requires at least one mode in the diagnostic directory", NAME);
        std::process::exit(1);
    }

    info!("{} running as uid {}", NAME, nix::unistd::getuid());

    let backend = select_backend(args.udc.clone());

    let (worker_tx, worker_rx) = watch::channel::<Option<WorkerRequest>>(None);
    let (worker_event_tx, mut worker_event_rx) = mpsc::unbounded_channel();
    let (bus_tx, mut bus_rx) = mpsc::unbounded_channel::<BusSignal>();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<OutboundSignal>();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ControlCommand>();
    let (cable_tx, cable_rx) = mpsc::unbounded_channel();

    {
        let registry = registry.clone();
        let config = config.clone();
        std::thread::spawn(move || worker::run(worker_rx, worker_event_tx, registry, config, backend));
    }

    tokio::spawn(async move {
        if let Err(e) = dbus_service::run(outbound_rx, cmd_tx).await {
            error!("{} bus adapter terminated: {}", NAME, e);
        }
    });

    spawn_cable_source(&args, &config, cable_tx);
    let mut detector = cable::CableDetector::new(cable_rx);

    let mut core = ControlCore::new(registry, config, args.rescue, args.diag, worker_tx, bus_tx);
    core.set_current_user(args.uid);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    info!("{} started, internal mode '{}'", NAME, core.internal_mode());

    loop {
        tokio::select! {
            Some(event) = worker_event_rx.recv() => {
                debug!("{} worker finished, mode switched to '{}'", NAME, event.mode);
                core.mode_switched(event.mode);
            }
            Some(cmd) = cmd_rx.recv() => {
                handle_command(&mut core, &args.config, cmd);
            }
            Some(state) = detector.next_change() => {
                info!("{} cable state changed: {}", NAME, state.name());
                core.set_cable_state(state);
            }
            Some(signal) = bus_rx.recv() => {
                let outbound = match signal {
                    BusSignal::CurrentState(mode) => OutboundSignal::CurrentState(mode.to_string()),
                    BusSignal::TargetState(mode) => OutboundSignal::TargetState(mode.to_string()),
                    BusSignal::DialogShow => OutboundSignal::DialogShow,
                };
                let _ = outbound_tx.send(outbound);
            }
            _ = sigterm.recv() => {
                info!("{} received SIGTERM, shutting down", NAME);
                break;
            }
            _ = sigint.recv() => {
                info!("{} received SIGINT, shutting down", NAME);
                break;
            }
            _ = sighup.recv() => {
                info!("{} received SIGHUP, reloading mode registry", NAME);
                match ModeRegistry::load(std::path::Path::new(registry_dir(args.diag))) {
                    Ok(reloaded) => core.reload_registry(reloaded),
                    Err(e) => error!("{} reload failed, keeping previous registry: {}", NAME, e),
                }
            }
        }
    }

    Ok(())
}

fn main() {
    let started = Instant::now();

    let args = Args::parse();
    logging_init(args.debug, &args.log_file);

    info!(
        "{} usb-moded-rs is starting, build: {}, git: {}-{}",
        NAME,
        env!("BUILD_DATE"),
        env!("GIT_DATE"),
        env!("GIT_HASH")
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let exit_code = match runtime.block_on(run(args)) {
        Ok(()) => 0,
        Err(e) => {
            error!("{} fatal error: {}", NAME, e);
            1
        }
    };

    info!(
        "{} usb-moded-rs terminated, running time: {}",
        NAME,
        format_duration(started.elapsed()).to_string()
    );
    std::process::exit(exit_code);
}
