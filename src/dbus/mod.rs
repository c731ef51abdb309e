//! D-Bus integration with system services.

pub mod modem_manager;
