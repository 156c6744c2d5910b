use dbus::message::MatchRule;
use dbus::nonblock::SyncConnection;
use dbus::strings::Interface;
use simplelog::*;
use tokio::sync::{mpsc, oneshot};

// module name for logging engine
const NAME: &str = "<i><bright-black> dbus: </>";

pub const BUS_NAME: &str = "com.jolla.usb_moded";
pub const OBJECT_PATH: &str = "/com/jolla/usb_moded";
pub const INTERFACE: &str = "com.jolla.usb_moded";

pub const SIGNAL_CURRENT_STATE: &str = "current_state";
pub const SIGNAL_TARGET_STATE: &str = "target_state";
pub const SIGNAL_MODE_SUPPORTED: &str = "mode_supported";
pub const SIGNAL_HIDDEN_MODES: &str = "hidden_modes";
pub const SIGNAL_EVENT: &str = "event";
pub const EVENT_DIALOG_SHOW: &str = "dialog_show";

/// Inbound RPC, translated from a D-Bus method call and handed to the main
/// loop (§4.6). The control core never sees raw `dbus` types; only the
/// main loop reaches into [`crate::control::ControlCore`].
pub enum ControlCommand {
    SetMode(String),
    GetMode(oneshot::Sender<String>),
    GetTargetMode(oneshot::Sender<String>),
    GetModes(oneshot::Sender<String>),
    GetHiddenModes(oneshot::Sender<String>),
    GetAvailableModes(oneshot::Sender<String>),
    SetConfig(String, String, String),
}

/// Mirrors [`crate::control::BusSignal`] but already stringified, so this
/// module has no dependency on `control`'s internal `ModeName` type.
pub enum OutboundSignal {
    CurrentState(String),
    TargetState(String),
    DialogShow,
}

fn emit_signal(conn: &SyncConnection, signal: OutboundSignal) {
    use dbus::channel::Sender;

    let message = match signal {
        OutboundSignal::CurrentState(mode) => {
            make_signal(SIGNAL_CURRENT_STATE).append1(mode)
        }
        OutboundSignal::TargetState(mode) => make_signal(SIGNAL_TARGET_STATE).append1(mode),
        OutboundSignal::DialogShow => make_signal(SIGNAL_EVENT).append1(EVENT_DIALOG_SHOW.to_string()),
    };

    if conn.send(message).is_err() {
        warn!("{} failed to send signal over the bus", NAME);
    }
}

fn make_signal(member: &str) -> dbus::Message {
    dbus::Message::new_signal(OBJECT_PATH, INTERFACE, member)
        .expect("signal name/path/interface are static and well-formed")
}

/// Parses one incoming method call, dispatching it either as a
/// fire-and-forget command or spawning a task that awaits the main loop's
/// reply over a `oneshot` channel before sending the method return.
fn handle_method_call(msg: dbus::Message, conn: std::sync::Arc<SyncConnection>, cmd_tx: mpsc::UnboundedSender<ControlCommand>) {
    use dbus::channel::Sender;

    let Some(member) = msg.member() else { return };
    let member = member.to_string();

    match member.as_str() {
        "set_mode" => {
            if let Some(mode) = msg.get1::<String>() {
                let _ = cmd_tx.send(ControlCommand::SetMode(mode));
            }
            let _ = conn.send(msg.method_return());
        }
        "set_config" => {
            let (key, value) = msg.get2::<String, String>();
            if let (Some(key), Some(value)) = (key, value) {
                let (entry, key) = split_config_key(&key);
                let _ = cmd_tx.send(ControlCommand::SetConfig(entry, key, value));
            }
            let _ = conn.send(msg.method_return());
        }
        "get_mode" => reply_with_string(msg, conn, cmd_tx, ControlCommand::GetMode),
        "get_target_mode" => reply_with_string(msg, conn, cmd_tx, ControlCommand::GetTargetMode),
        "get_modes" => reply_with_string(msg, conn, cmd_tx, ControlCommand::GetModes),
        "get_hidden_modes" => reply_with_string(msg, conn, cmd_tx, ControlCommand::GetHiddenModes),
        "get_available_modes" => reply_with_string(msg, conn, cmd_tx, ControlCommand::GetAvailableModes),
        other => {
            debug!("{} unhandled method call: {}", NAME, other);
        }
    }
}

/// `set_config`'s key argument is `"entry.key"` (e.g. `"usbmode.mode"`);
/// a bare key with no dot is assumed to belong to the `usbmode` group,
/// matching the shape of the historical config file itself (§6).
fn split_config_key(raw: &str) -> (String, String) {
    match raw.split_once('.') {
        Some((entry, key)) => (entry.to_string(), key.to_string()),
        None => ("usbmode".to_string(), raw.to_string()),
    }
}

fn reply_with_string(
    msg: dbus::Message,
    conn: std::sync::Arc<SyncConnection>,
    cmd_tx: mpsc::UnboundedSender<ControlCommand>,
    make_command: impl FnOnce(oneshot::Sender<String>) -> ControlCommand,
) {
    use dbus::channel::Sender;

    let (reply_tx, reply_rx) = oneshot::channel();
    if cmd_tx.send(make_command(reply_tx)).is_err() {
        return;
    }

    tokio::spawn(async move {
        if let Ok(value) = reply_rx.await {
            let _ = conn.send(msg.method_return().append1(value));
        }
    });
}

/// Owns the D-Bus connection resource and the method-call dispatch loop
/// (§4.6). Runs on the same current-thread runtime as the rest of the main
/// loop; only ever forwards [`ControlCommand`]s and [`OutboundSignal`]s.
pub async fn run(
    mut signal_rx: mpsc::UnboundedReceiver<OutboundSignal>,
    cmd_tx: mpsc::UnboundedSender<ControlCommand>,
) -> anyhow::Result<()> {
    let (resource, conn) = dbus_tokio::connection::new_system_sync()?;

    tokio::spawn(async move {
        let err = resource.await;
        error!("{} lost connection to the system bus: {}", NAME, err);
    });

    conn.request_name(BUS_NAME, false, true, false).await?;
    info!("{} acquired bus name {}", NAME, BUS_NAME);

    let mut rule = MatchRule::new_method_call();
    rule.interface = Some(Interface::new(INTERFACE).expect("interface name is static and well-formed"));
    rule.path = Some(dbus::Path::new(OBJECT_PATH).expect("object path is static and well-formed"));

    let dispatch_conn = conn.clone();
    conn.start_receive(
        rule,
        Box::new(move |msg, _conn| {
            handle_method_call(msg, dispatch_conn.clone(), cmd_tx.clone());
            true
        }),
    );

    loop {
        match signal_rx.recv().await {
            Some(signal) => emit_signal(&conn, signal),
            None => return Ok(()),
        }
    }
}
