pub mod cable;
pub mod config;
pub mod control;
pub mod dbus_service;
pub mod dyn_config;
pub mod error;
pub mod gadget;
pub mod modes;
pub mod policy;
pub mod wakelock;
pub mod worker;
