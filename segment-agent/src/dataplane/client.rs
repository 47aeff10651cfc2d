use crate::error::{AgentError, AgentResult};
use segment_core::dataplane::{DataPlaneFullConfig, DataPlaneMessage, MAX_MESSAGE_SIZE};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixDatagram;
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Client-side bind path; the kernel needs an address for the data-plane
/// engine to `sendto` replies back to, since `connect`ed `SOCK_DGRAM`
/// sockets are still addressed, not streamed.
fn bind_path(peer_path: &str) -> PathBuf {
    let mut p = PathBuf::from(peer_path);
    let file_name = format!(
        ".{}.agent.sock",
        p.file_name().and_then(|f| f.to_str()).unwrap_or("dataplane")
    );
    p.set_file_name(file_name);
    p
}

struct Conn {
    socket: UnixDatagram,
}

/// Owns the socket to the packet engine (spec §4.5). Automatically
/// reconnects and replays the full configuration state (spec §6 testable
/// property 10, scenario covering socket recovery) before resuming.
pub struct DataPlaneClient {
    peer_path: String,
    conn: Mutex<Option<Conn>>,
    full_config: Mutex<DataPlaneFullConfig>,
}

impl DataPlaneClient {
    pub fn new(peer_path: String) -> Self {
        Self {
            peer_path,
            conn: Mutex::new(None),
            full_config: Mutex::new(DataPlaneFullConfig::default()),
        }
    }

    /// Connects (binding our own address first) and replays the full
    /// configuration state in MACs -> pairs -> subnets -> policies -> apps
    /// order (spec §4.5).
    async fn connect(&self) -> AgentResult<()> {
        let bind = bind_path(&self.peer_path);
        let _ = std::fs::remove_file(&bind);
        let socket = UnixDatagram::bind(&bind)?;
        socket.connect(&self.peer_path)?;

        let replay = self.full_config.lock().await.as_messages();
        for msg in &replay {
            send_on(&socket, msg).await?;
        }

        *self.conn.lock().await = Some(Conn { socket });
        Ok(())
    }

    /// Returns `Ok(true)` if this call performed a fresh connect (and thus
    /// already replayed `full_config`), `Ok(false)` if a connection was
    /// already live.
    async fn ensure_connected(&self) -> AgentResult<bool> {
        if self.conn.lock().await.is_some() {
            return Ok(false);
        }
        self.connect().await?;
        Ok(true)
    }

    /// Sends one message, reconnecting and replaying full config first if
    /// the socket had dropped (spec §4.5 "Reconnection is automatic").
    pub async fn send(&self, msg: &DataPlaneMessage) -> AgentResult<()> {
        self.ensure_connected().await?;
        self.send_on_current_conn(msg).await
    }

    /// Sends one message that is also part of `full_config`'s replay set.
    /// The caller must have already recorded `msg` into `full_config`
    /// before calling this: if that triggers a fresh connect, `connect`'s
    /// replay already transmits `msg`, so it isn't sent a second time here.
    async fn send_replayable(&self, msg: &DataPlaneMessage) -> AgentResult<()> {
        let freshly_connected = self.ensure_connected().await?;
        if freshly_connected {
            return Ok(());
        }
        self.send_on_current_conn(msg).await
    }

    async fn send_on_current_conn(&self, msg: &DataPlaneMessage) -> AgentResult<()> {
        let result = {
            let guard = self.conn.lock().await;
            match guard.as_ref() {
                Some(conn) => send_on(&conn.socket, msg).await,
                None => return Err(AgentError::Io("data-plane socket not connected".to_string())),
            }
        };
        if result.is_err() {
            *self.conn.lock().await = None;
        }
        result
    }

    /// Receives one message, reconnecting on error. Blocks until a
    /// datagram arrives or the socket is torn down and re-established.
    pub async fn recv(&self) -> AgentResult<DataPlaneMessage> {
        loop {
            self.ensure_connected().await?;
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
            let result = {
                let guard = self.conn.lock().await;
                match guard.as_ref() {
                    Some(conn) => conn.socket.recv(&mut buf).await,
                    None => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                }
            };
            match result {
                Ok(n) => match DataPlaneMessage::decode(&buf[..n]) {
                    Ok(msg) => return Ok(msg),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed data-plane message");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "data-plane socket read failed, reconnecting");
                    *self.conn.lock().await = None;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Registers a MAC configuration in the replay set and sends it now.
    pub async fn push_mac_config(&self, payload: segment_core::dataplane::MacConfigPayload) -> AgentResult<()> {
        self.full_config.lock().await.macs.push(payload.clone());
        self.send_replayable(&DataPlaneMessage::MacConfig(payload)).await
    }

    pub async fn retract_mac_config(&self, ep_mac: &segment_core::domain::intercept::MacAddr) {
        self.full_config.lock().await.macs.retain(|m| &m.ep_mac != ep_mac);
    }

    pub async fn push_port_pair(&self, payload: segment_core::dataplane::PortPairConfigPayload) -> AgentResult<()> {
        self.full_config.lock().await.pairs.push(payload.clone());
        self.send_replayable(&DataPlaneMessage::PortPairConfig(payload)).await
    }

    pub async fn retract_port_pair(&self, pair_id: &str) {
        self.full_config.lock().await.pairs.retain(|p| p.pair_id != pair_id);
    }

    pub async fn push_subnets(&self, payload: segment_core::dataplane::SubnetConfigPayload) -> AgentResult<()> {
        self.full_config.lock().await.subnets = Some(payload.clone());
        self.send_replayable(&DataPlaneMessage::SubnetConfig(payload)).await
    }

    pub async fn push_policy(&self, payload: segment_core::dataplane::PolicyConfigPayload) -> AgentResult<()> {
        let mut config = self.full_config.lock().await;
        config
            .policies
            .retain(|p| p.policy.workload_id != payload.policy.workload_id);
        config.policies.push(payload.clone());
        drop(config);
        self.send_replayable(&DataPlaneMessage::PolicyConfig(payload)).await
    }

    pub async fn retract_policy(&self, workload_id: &str) {
        self.full_config.lock().await.policies.retain(|p| p.policy.workload_id != workload_id);
    }

    /// Registers the group-name -> subnet map in the replay set and sends
    /// it now (spec §4.3 "the policy-address map ... is also diffed and
    /// re-pushed", spec §4.5 `PolicyAddrMap`).
    pub async fn push_policy_addr_map(&self, payload: segment_core::dataplane::PolicyAddrMapPayload) -> AgentResult<()> {
        self.full_config.lock().await.policy_addr_map = Some(payload.clone());
        self.send_replayable(&DataPlaneMessage::PolicyAddrMap(payload)).await
    }

    pub async fn push_apps(&self, payload: segment_core::dataplane::AppConfigPayload) -> AgentResult<()> {
        let mut config = self.full_config.lock().await;
        config.apps.retain(|a| a.ep_mac != payload.ep_mac);
        config.apps.push(payload.clone());
        drop(config);
        self.send_replayable(&DataPlaneMessage::AppConfig(payload)).await
    }

    pub async fn send_keepalive(&self) -> AgentResult<()> {
        self.send(&DataPlaneMessage::KeepAlive).await
    }
}

async fn send_on(socket: &UnixDatagram, msg: &DataPlaneMessage) -> AgentResult<()> {
    let bytes = msg
        .encode()
        .map_err(|e| AgentError::Io(format!("data-plane message encode: {e}")))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(AgentError::DataPlaneMessageTooLarge(bytes.len()));
    }
    socket.send(&bytes).await?;
    Ok(())
}

/// Shared handle for the lifecycle coordinator and the receive loop to
/// hold concurrently.
pub type SharedDataPlaneClient = Arc<DataPlaneClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_path_is_hidden_sibling_of_peer_path() {
        let bound = bind_path("/run/segment/dataplane.sock");
        assert_eq!(bound, PathBuf::from("/run/segment/.dataplane.sock.agent.sock"));
    }
}
