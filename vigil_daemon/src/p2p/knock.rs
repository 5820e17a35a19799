//! UDP knock listener. A datagram carrying the cluster auth key admits
//! the sender's address to the plane for a bounded TTL, which is how a
//! joining node reaches `/add-peer` before it is a member.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::allowlist::AllowList;

/// Minimum gap between processed knocks from one source.
const RATE_LIMIT: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 512;

pub struct KnockListener {
    port: u16,
    task: Option<JoinHandle<()>>,
}

impl KnockListener {
    /// Bind and start answering knocks. A valid knock gets no reply; the
    /// only observable effect is admission.
    pub async fn bind(
        port: u16,
        auth_key: String,
        allowlist: Arc<AllowList>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let port = socket.local_addr()?.port();
        info!(port, "knock listener bound");
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let mut last_seen: HashMap<IpAddr, Instant> = HashMap::new();
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(error) => {
                        warn!(%error, "knock receive failed");
                        continue;
                    }
                };
                let now = Instant::now();
                if let Some(seen) = last_seen.get(&from.ip()) {
                    if now.duration_since(*seen) < RATE_LIMIT {
                        continue;
                    }
                }
                last_seen.insert(from.ip(), now);
                last_seen.retain(|_, seen| now.duration_since(*seen) < RATE_LIMIT * 60);

                let payload = String::from_utf8_lossy(&buf[..len]);
                if !auth_key.is_empty() && payload.trim() == auth_key {
                    allowlist.admit_temporarily(from.ip());
                } else {
                    debug!(from = %from.ip(), "knock with wrong key ignored");
                }
            }
        });
        Ok(Self {
            port,
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for KnockListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for(allowlist: &AllowList, addr: IpAddr) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if allowlist.is_allowed(addr) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn valid_knock_admits_the_sender() {
        let allowlist = Arc::new(AllowList::new());
        let mut listener =
            KnockListener::bind(0, "swordfish".to_string(), Arc::clone(&allowlist))
                .await
                .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"swordfish", ("127.0.0.1", listener.port()))
            .await
            .unwrap();

        assert!(wait_for(&allowlist, "127.0.0.1".parse().unwrap()).await);
        listener.stop();
    }

    #[tokio::test]
    async fn wrong_key_is_ignored() {
        let allowlist = Arc::new(AllowList::new());
        let mut listener = KnockListener::bind(0, "swordfish".to_string(), Arc::clone(&allowlist))
            .await
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"open sesame", ("127.0.0.1", listener.port()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!allowlist.is_allowed("127.0.0.1".parse().unwrap()));
        listener.stop();
    }
}
