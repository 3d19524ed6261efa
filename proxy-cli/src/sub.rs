//! `microproxy sub` — minimal standalone subscriber (SPEC_FULL.md §6).
//!
//! Binds `viewer_channel` and prints each published `ViewerContext` as a
//! JSON line to stdout. A full terminal UI (`microproxy/viewer/tui.py` in
//! the original) is out of scope; this is the "external viewer" contract
//! spec.md §1 names, reduced to its simplest consumer.

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

pub async fn run(viewer_channel: &str) -> Result<()> {
    let socket = UdpSocket::bind(viewer_channel)
        .await
        .with_context(|| format!("failed to bind viewer_channel at {viewer_channel}"))?;
    log::info!("subscriber listening on {viewer_channel}");

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, _peer) = socket.recv_from(&mut buf).await.context("recv_from failed")?;
        match serde_json::from_slice::<serde_json::Value>(&buf[..n]) {
            Ok(value) => println!("{value}"),
            Err(e) => log::warn!("discarding malformed ViewerContext datagram: {e}"),
        }
    }
}
