//! Received (C9): prepends a trace header recording the hop.

use async_trait::async_trait;
use chrono::Utc;

use super::{Handler, HandlerError};
use crate::state::SessionState;

pub struct Received {
    our_hostname: String,
    our_ip: String,
}

impl Received {
    pub fn new(our_hostname: impl Into<String>, our_ip: impl Into<String>) -> Self {
        Received {
            our_hostname: our_hostname.into(),
            our_ip: our_ip.into(),
        }
    }
}

#[async_trait]
impl Handler for Received {
    fn name(&self) -> &str {
        "received"
    }

    async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        let peer_host = state.peer_hostname.as_deref().unwrap_or("unknown");
        let date = Utc::now().to_rfc2822();
        let value = format!(
            "from {} ({}) by {} ({}) with MistralMail; {}",
            peer_host, state.remote_ip, self.our_hostname, self.our_ip, date
        );
        state.envelope.headers.insert(0, ("Received".to_string(), value));
        Ok(())
    }
}
