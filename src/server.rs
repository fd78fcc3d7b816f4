//! Server runtime (C7): accepts connections on one listener, spawns one
//! task per connection, and drains in-flight sessions within a grace
//! period on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::blacklist::Blacklist;
use crate::protocol::Protocol;
use crate::reply::Reply;
use crate::session::{Session, SessionConfig};

/// How long `listen_and_serve` waits for in-flight sessions to finish on
/// their own after a shutdown is signalled before aborting them.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct Server {
    addr: String,
    session_config: Arc<SessionConfig>,
    blacklist: Arc<dyn Blacklist>,
}

impl Server {
    pub fn new(addr: impl Into<String>, session_config: Arc<SessionConfig>, blacklist: Arc<dyn Blacklist>) -> Self {
        Server { addr: addr.into(), session_config, blacklist }
    }

    /// Accepts connections until `shutdown` reports `true`, then waits up
    /// to [`SHUTDOWN_GRACE_PERIOD`] for in-flight sessions before aborting
    /// whatever remains.
    pub async fn listen_and_serve(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        log::info!("listening on {}", self.addr);

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let remote_ip = peer_addr.ip();
                            if self.blacklist.is_blacklisted(remote_ip) {
                                log::info!("rejecting blacklisted peer {}", remote_ip);
                                tokio::spawn(reject_blacklisted(stream));
                                continue;
                            }

                            let session_config = self.session_config.clone();
                            let session_shutdown = shutdown.clone();
                            tasks.spawn(async move {
                                let protocol = Protocol::new(stream);
                                let session = Session::new(protocol, remote_ip, session_config);
                                session.run(session_shutdown).await;
                            });
                        }
                        Err(e) => log::error!("accept error on {}: {}", self.addr, e),
                    }
                }
            }
        }

        log::info!("{}: draining {} in-flight session(s)", self.addr, tasks.len());
        let drain = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    log::error!("session task failed: {}", e);
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, drain).await.is_err() {
            log::warn!("{}: grace period elapsed, aborting remaining sessions", self.addr);
            tasks.shutdown().await;
        }

        Ok(())
    }
}

async fn reject_blacklisted(mut stream: TcpStream) {
    let _ = stream.write_all(Reply::blacklisted("IP blacklisted").to_wire().as_bytes()).await;
    let _ = stream.shutdown().await;
}
