//! Listen port selection
//!
//! A port other than the default is taken literally: if it is busy the node
//! refuses to start. The default port is a starting point: the first free
//! port at or above it is used. Each check is a trial bind that is released
//! immediately, so the result is only a hint that the port was free.

use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::{NetworkError, Result};

/// Select a listen port using a real TCP trial bind on all interfaces.
pub fn negotiate_port(desired: u16, default: u16) -> Result<u16> {
    negotiate_port_with(desired, default, port_is_free)
}

/// Select a listen port, asking `is_free` whether a given port can be bound.
pub fn negotiate_port_with<F>(desired: u16, default: u16, mut is_free: F) -> Result<u16>
where
    F: FnMut(u16) -> bool,
{
    if desired == 0 || default == 0 {
        return Err(NetworkError::InvalidPort);
    }

    if desired != default {
        return if is_free(desired) {
            Ok(desired)
        } else {
            Err(NetworkError::PortInUse(desired))
        };
    }

    for port in desired..=u16::MAX {
        if is_free(port) {
            return Ok(port);
        }
        debug!("Port {} busy, trying next", port);
    }

    Err(NetworkError::NoFreePort(desired))
}

/// Trial bind on `0.0.0.0:port`; the listener is dropped before returning.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_any() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_custom_port_free() {
        let port = negotiate_port_with(9100, 8001, |_| true).unwrap();
        assert_eq!(port, 9100);
    }

    #[test]
    fn test_custom_port_busy_is_error() {
        let mut probed = Vec::new();
        let result = negotiate_port_with(9100, 8001, |p| {
            probed.push(p);
            false
        });
        assert!(matches!(result, Err(NetworkError::PortInUse(9100))));
        // Never substitutes another port
        assert_eq!(probed, vec![9100]);
    }

    #[test]
    fn test_default_port_scans_upward() {
        let port = negotiate_port_with(8001, 8001, |p| p >= 8004).unwrap();
        assert_eq!(port, 8004);
    }

    #[test]
    fn test_default_port_free() {
        assert_eq!(negotiate_port_with(8001, 8001, |_| true).unwrap(), 8001);
    }

    #[test]
    fn test_no_free_port() {
        let mut last = 0;
        let result = negotiate_port_with(65530, 65530, |p| {
            last = p;
            false
        });
        assert!(matches!(result, Err(NetworkError::NoFreePort(65530))));
        assert_eq!(last, u16::MAX);
    }

    #[test]
    fn test_zero_port_rejected() {
        assert!(matches!(
            negotiate_port_with(0, 8001, |_| true),
            Err(NetworkError::InvalidPort)
        ));
    }

    #[test]
    fn test_busy_default_moves_to_next_free() {
        let (_listener, port) = bind_any();
        if port == u16::MAX {
            return;
        }
        let chosen = negotiate_port(port, port).unwrap();
        assert!(chosen > port);
    }

    #[test]
    fn test_busy_custom_port_fails() {
        let (_listener, port) = bind_any();
        let default = if port == 8001 { 8002 } else { 8001 };
        assert!(matches!(
            negotiate_port(port, default),
            Err(NetworkError::PortInUse(p)) if p == port
        ));
    }

    #[test]
    fn test_trial_bind_is_released() {
        let (listener, port) = bind_any();
        drop(listener);
        let chosen = negotiate_port(port, if port == 8001 { 8002 } else { 8001 }).unwrap();
        assert_eq!(chosen, port);
        assert!(port_is_free(port));
    }
}
