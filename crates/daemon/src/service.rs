//! Systemd service integration
//!
//! Speaks the sd-notify datagram protocol when `NOTIFY_SOCKET` is set and
//! does nothing otherwise.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;
use tracing::{debug, error, info};

/// Send one sd-notify message; returns whether a socket was there to receive it
fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return Ok(false);
    };
    send_to(&socket_path, message)?;
    Ok(true)
}

fn send_to(socket_path: &str, message: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send {} to systemd", message))?;
    Ok(())
}

/// Notify systemd that the daemon is ready
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Notify systemd that the daemon is stopping
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

pub fn notify_watchdog() -> Result<()> {
    notify("WATCHDOG=1").map(|_| ())
}

/// Watchdog timeout configured by systemd, in microseconds
pub fn get_watchdog_timeout() -> Option<u64> {
    env::var("WATCHDOG_USEC").ok().and_then(|s| s.parse().ok())
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Send `WATCHDOG=1` at half the configured timeout
///
/// Returns `None` when the watchdog is not enabled.
pub fn spawn_watchdog_task() -> Option<tokio::task::JoinHandle<()>> {
    let timeout_usec = get_watchdog_timeout()?;
    let interval = Duration::from_micros(timeout_usec / 2).max(Duration::from_secs(1));
    info!(
        "Systemd watchdog enabled, interval: {}s (timeout: {}s)",
        interval.as_secs(),
        timeout_usec / 1_000_000
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_without_socket() {
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }
        assert!(!is_systemd());
        assert!(notify_ready().is_ok());
        assert!(notify_status("2 displays open").is_ok());
        assert!(notify_stopping().is_ok());
        assert!(notify_watchdog().is_ok());
    }

    #[test]
    fn test_notification_reaches_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        send_to(&path.to_string_lossy(), "READY=1").unwrap();

        let mut buffer = [0u8; 32];
        let count = listener.recv(&mut buffer).unwrap();
        assert_eq!(&buffer[..count], b"READY=1");
    }

    #[test]
    fn test_get_watchdog_timeout() {
        unsafe {
            env::remove_var("WATCHDOG_USEC");
        }
        assert!(get_watchdog_timeout().is_none());

        unsafe {
            env::set_var("WATCHDOG_USEC", "30000000");
        }
        assert_eq!(get_watchdog_timeout(), Some(30_000_000));

        unsafe {
            env::set_var("WATCHDOG_USEC", "invalid");
        }
        assert!(get_watchdog_timeout().is_none());

        unsafe {
            env::remove_var("WATCHDOG_USEC");
        }
    }
}
