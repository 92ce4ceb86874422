// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! UDP discovery of printers on the local network, and the directed
//! `M66666` nudge that tells a discovered printer to dial this engine's
//! broker.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::Error;
use crate::types::{DiscoveryResponse, PrinterDescriptor};

const SATURN_UDP_PORT: u16 = 3000;
const PROBE_PAYLOAD: &[u8] = b"M99999";
const RECV_BUF_LEN: usize = 1024;

/// Broadcasts `M99999` and collects every response received within
/// `probe_timeout`. Malformed datagrams are dropped with a warning, not
/// treated as a probe failure.
///
/// # Errors
///
/// Returns error if the UDP socket cannot be opened or configured.
pub async fn find_printers(
    broadcast_addr: &str,
    probe_timeout: Duration,
) -> Result<Vec<PrinterDescriptor>, Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket.send_to(PROBE_PAYLOAD, broadcast_addr).await?;

    let mut printers = Vec::new();
    let mut buf = [0u8; RECV_BUF_LEN];
    let deadline = tokio::time::Instant::now() + probe_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, peer))) => {
                if let Some(descriptor) = parse_response(&buf[..n], peer) {
                    printers.push(descriptor);
                }
            }
            Ok(Err(err)) => {
                log::warn!("discovery recv_from failed: {err}");
                break;
            }
            Err(_) => break,
        }
    }

    Ok(printers)
}

/// Directed probe: sends `M99999` to a single unicast address and returns
/// the one response it elicits, or `None` on timeout.
///
/// # Errors
///
/// Returns error if the UDP socket cannot be opened or configured.
pub async fn find_printer(
    addr: SocketAddr,
    probe_timeout: Duration,
) -> Result<Option<PrinterDescriptor>, Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(PROBE_PAYLOAD, addr).await?;

    let mut buf = [0u8; RECV_BUF_LEN];
    match timeout(probe_timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((n, peer))) => Ok(parse_response(&buf[..n], peer)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}

/// Re-probes `descriptor.address` and returns a replacement descriptor with
/// a refreshed status snapshot, or `None` if the printer no longer answers
/// within `probe_timeout`. An optional affordance for long-lived callers
/// that want to re-poll a known printer's status between sessions rather
/// than re-running full broadcast discovery; the session state machine
/// itself does not call this.
///
/// # Errors
///
/// Returns error if the UDP socket cannot be opened or configured.
pub async fn refresh_printer(
    descriptor: &PrinterDescriptor,
    probe_timeout: Duration,
) -> Result<Option<PrinterDescriptor>, Error> {
    find_printer(descriptor.address, probe_timeout).await
}

/// Sends `M66666 <port>` to `addr`, the ASCII-decimal broker port the
/// printer should dial. There is no UDP-level acknowledgement; completion
/// is observed via the MQTT CONNECT that later arrives on the broker.
///
/// # Errors
///
/// Returns error if the UDP socket cannot be opened or the datagram cannot
/// be sent.
pub async fn request_connect(addr: SocketAddr, broker_port: u16) -> Result<(), Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let payload = format!("M66666 {broker_port}");
    socket.send_to(payload.as_bytes(), addr).await?;
    Ok(())
}

fn parse_response(bytes: &[u8], peer: SocketAddr) -> Option<PrinterDescriptor> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            log::warn!("discovery response from {peer} is not valid UTF-8: {err}");
            return None;
        }
    };
    let response: DiscoveryResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(err) => {
            log::warn!("discovery response from {peer} is not valid JSON: {err}");
            return None;
        }
    };
    let mut descriptor = PrinterDescriptor::from(response);
    descriptor.address = peer;
    Some(descriptor)
}
