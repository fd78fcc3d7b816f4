//! Relay (C9, MSA only): forwards the accepted message to a single
//! configured external relay over SMTP with STARTTLS and optional AUTH.

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use super::{Handler, HandlerError};
use crate::reply::Reply;
use crate::state::SessionState;

pub struct RelayConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub insecure_skip_verify: bool,
}

pub struct Relay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Self, String> {
        let tls = if config.insecure_skip_verify {
            Tls::Opportunistic(
                TlsParameters::builder(config.hostname.clone())
                    .dangerous_accept_invalid_certs(true)
                    .build()
                    .map_err(|e| e.to_string())?,
            )
        } else {
            Tls::Wrapper(
                TlsParameters::new(config.hostname.clone()).map_err(|e| e.to_string())?,
            )
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.hostname)
            .port(config.port)
            .tls(tls);

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(config.username, config.password));
        }

        Ok(Relay { transport: builder.build() })
    }
}

#[async_trait]
impl Handler for Relay {
    fn name(&self) -> &str {
        "relay"
    }

    async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        let from = state
            .envelope
            .from
            .as_ref()
            .ok_or_else(|| HandlerError::internal("relay called with no sender"))?;

        let envelope = Envelope::new(
            Some(from.address().parse().map_err(|e| HandlerError::internal(format!("{e}")))?),
            state
                .envelope
                .to
                .iter()
                .map(|addr| addr.address().parse())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| HandlerError::internal(format!("{e}")))?,
        )
        .map_err(|e| HandlerError::internal(e.to_string()))?;

        match self.transport.send_raw(&envelope, &state.envelope.data).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => {
                Err(HandlerError::with_reply(Reply::requested_action_aborted(), e.to_string()))
            }
            Err(e) => Err(HandlerError::with_reply(Reply::mailbox_not_available(), e.to_string())),
        }
    }
}
