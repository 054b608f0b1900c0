use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::{net::UdpSocket, sync::watch};
use tracing::{debug, error, info, warn};

use super::{
    definition::UdpInputConfig,
    runtime::{stopped, Emitter, InputStatus},
};
use crate::event::model::Meta;

const MAX_DATAGRAM: usize = 65_536;

/// Binds, then emits one event per datagram until stopped. A bind failure is recorded
/// as the input's status; the socket closes when the task returns.
pub async fn run(
    config: UdpInputConfig,
    emitter: Emitter,
    statuses: Arc<DashMap<String, InputStatus>>,
    mut stop: watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind((config.host.as_str(), config.port)).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(
                "UDP input {} failed to bind {}:{}: {}",
                emitter.id(),
                config.host,
                config.port,
                e
            );
            statuses.insert(
                emitter.id().to_string(),
                InputStatus::Error {
                    message: format!("bind {}:{}: {}", config.host, config.port, e),
                },
            );
            return;
        }
    };
    info!(
        "UDP input {} listening on {}:{}",
        emitter.id(),
        config.host,
        config.port
    );

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, remote)) => {
                    let payload = config.codec.decode(&buf[..len]);
                    let mut meta = Meta::new();
                    meta.insert(
                        "remote".to_string(),
                        json!({ "address": remote.ip().to_string(), "port": remote.port() }),
                    );
                    emitter.emit(payload, meta);
                }
                Err(e) => warn!("UDP input {} receive error: {}", emitter.id(), e),
            },
            _ = stopped(&mut stop) => break,
        }
    }
    debug!("UDP input {} closed", emitter.id());
}
