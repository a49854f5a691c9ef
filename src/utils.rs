use std::net::{IpAddr, UdpSocket};

use tracing::debug;

/// Scale `(width, height)` down so the width does not exceed `max_width`,
/// preserving aspect ratio. Never returns a zero dimension.
pub fn target_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if max_width == 0 || width <= max_width {
        return (width, height);
    }
    let scaled_height = (u64::from(max_width) * u64::from(height) / u64::from(width.max(1))) as u32;
    (max_width, scaled_height.max(1))
}

/// Best-effort address other machines on the LAN can reach us at.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// interface would route to the given address.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    debug!(%ip, "Detected local address");
    (!ip.is_unspecified()).then_some(ip)
}
