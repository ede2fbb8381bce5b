//! Wire harness: turn a received ethernet frame into the descriptor form
//! the pipeline consumes.
//!
//! The core never parses raw bytes anywhere else; everything downstream of
//! this module works on [`FiveTuple`] + length.

use crate::FiveTuple;
use color_eyre::eyre::{bail, Report, WrapErr};
use std::net::Ipv4Addr;

/// Parse an ethernet frame into its flow tuple, wire length, and payload.
///
/// Only IPv4 is queued; anything else is the caller's problem (a datapath
/// would bypass the shaper for it). Transport ports are zero for protocols
/// without them.
pub fn parse_frame(frame: &[u8]) -> Result<(FiveTuple, u32, Vec<u8>), Report> {
    let hdr = etherparse::PacketHeaders::from_ethernet_slice(frame)
        .wrap_err("could not parse ethernet frame")?;

    let ip = match hdr.net {
        Some(etherparse::NetHeaders::Ipv4(h, _)) => h,
        _ => bail!("not an ipv4 packet"),
    };

    let (src_port, dst_port) = match &hdr.transport {
        Some(etherparse::TransportHeader::Tcp(t)) => (t.source_port, t.destination_port),
        Some(etherparse::TransportHeader::Udp(u)) => (u.source_port, u.destination_port),
        _ => (0, 0),
    };

    let tuple = FiveTuple::new(
        Ipv4Addr::from(ip.source),
        Ipv4Addr::from(ip.destination),
        src_port,
        dst_port,
        ip.protocol.0,
    );
    let payload = hdr.payload.slice().to_vec();
    Ok((tuple, frame.len() as u32, payload))
}
