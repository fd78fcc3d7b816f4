//! Session state machine (C6): drives one connection's SMTP conversation
//! against a [`Protocol`], dispatching each parsed [`Command`] per the
//! role (MTA or MSA) this listener was configured for.

use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::command::Command;
use crate::handlers::HandlerChain;
use crate::io::data::DataReader;
use crate::login_attempts::LoginAttempts;
use crate::protocol::{Protocol, ProtocolError};
use crate::reply::Reply;
use crate::repository::{check_password, UserRepository};
use crate::state::SessionState;

/// Which listener accepted this connection; gates `AUTH` and the relay
/// handler to MSA, matches `mta.go`/the original's split between the two
/// roles sharing one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Mta,
    Msa,
}

/// Shared, read-only configuration every session of one listener is built
/// with. Cheap to clone (all fields are `Arc`s or small copies).
pub struct SessionConfig {
    pub hostname: String,
    pub our_ip: String,
    pub role: Role,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub handler_chain: Arc<HandlerChain>,
    pub login_attempts: Arc<LoginAttempts>,
    pub user_repository: Arc<dyn UserRepository>,
    pub data_reader: DataReader,
}

pub struct Session {
    protocol: Protocol,
    config: Arc<SessionConfig>,
    state: SessionState,
    /// Set once `STARTTLS` or a post-STARTTLS `EHLO` happens, per the
    /// dispatch table's "require a new EHLO before further MAIL" rule.
    requires_fresh_ehlo: bool,
}

impl Session {
    pub fn new(protocol: Protocol, remote_ip: IpAddr, config: Arc<SessionConfig>) -> Self {
        Session {
            protocol,
            config,
            state: SessionState::new(remote_ip),
            requires_fresh_ehlo: false,
        }
    }

    /// Runs the session to completion: greeting, command loop, close.
    /// `shutdown` is observed between commands; when it fires the session
    /// sends `421` and terminates even mid-conversation (but never mid-DATA,
    /// since DATA's body read has no await point that selects on it).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.protocol.send(&Reply::service_ready(&self.config.hostname)).await {
            log::warn!("session {}: failed to send greeting: {}", self.state.session_id.counter, e);
            return;
        }

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        let _ = self.protocol.send(&Reply::shutting_down()).await;
                        break;
                    }
                }
                cmd = self.protocol.get_cmd() => {
                    match cmd {
                        Ok(cmd) => {
                            if self.dispatch(cmd).await {
                                break;
                            }
                        }
                        Err(ProtocolError::LineTooLong) => {
                            if self.protocol.send(&Reply::line_too_long()).await.is_err() {
                                break;
                            }
                        }
                        Err(ProtocolError::ConnectionClosed) => break,
                        Err(e) => {
                            log::warn!("session {}: protocol error: {}", self.state.session_id.counter, e);
                            break;
                        }
                    }
                }
            }
        }

        let _ = self.protocol.close().await;
    }

    /// Dispatches one command. Returns `true` when the session should end.
    async fn dispatch(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Helo { domain } => {
                self.state.envelope.reset();
                self.state.peer_hostname = Some(domain);
                self.requires_fresh_ehlo = false;
                self.reply(Reply::single(250, self.config.hostname.clone())).await
            }
            Command::Ehlo { domain } => {
                self.state.envelope.reset();
                self.state.peer_hostname = Some(domain);
                self.requires_fresh_ehlo = false;
                self.reply(self.ehlo_reply()).await
            }
            Command::StartTls => self.handle_starttls().await,
            Command::Auth { mechanism, initial } => self.handle_auth(mechanism, initial).await,
            Command::Mail { from, eightbitmime: _ } => self.handle_mail(from).await,
            Command::Rcpt { to } => self.handle_rcpt(to).await,
            Command::Data => self.handle_data().await,
            Command::Rset => {
                self.state.envelope.reset();
                self.reply(Reply::ok()).await
            }
            Command::Noop => self.reply(Reply::ok()).await,
            Command::Quit => {
                let _ = self.protocol.send(&Reply::closing()).await;
                true
            }
            Command::Vrfy { .. } | Command::Expn { .. } | Command::Send | Command::Soml | Command::Saml => {
                self.reply(Reply::not_implemented()).await
            }
            Command::InvalidCmd { info, .. } => self.reply(Reply::invalid_cmd(&info)).await,
            Command::UnknownCmd { .. } => self.reply(Reply::command_not_recognized()).await,
        }
    }

    /// Sends `reply` and maps a write failure to "end the session".
    async fn reply(&mut self, reply: Reply) -> bool {
        self.protocol.send(&reply).await.is_err()
    }

    fn ehlo_reply(&self) -> Reply {
        let mut lines = vec![self.config.hostname.clone(), "PIPELINING".to_string(), "8BITMIME".to_string()];
        if self.config.tls_acceptor.is_some() && !self.protocol.tls_active() {
            lines.push("STARTTLS".to_string());
        }
        if self.config.role == Role::Msa {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        Reply::multi(250, lines)
    }

    async fn handle_starttls(&mut self) -> bool {
        let Some(acceptor) = self.config.tls_acceptor.clone() else {
            return self.reply(Reply::command_not_recognized()).await;
        };
        if self.protocol.tls_active() {
            return self.reply(Reply::command_not_recognized()).await;
        }
        if self.protocol.send(&Reply::ready_to_start_tls()).await.is_err() {
            return true;
        }
        match self.protocol.start_tls(&acceptor).await {
            Ok(()) => {
                self.state.tls_active = true;
                self.state.envelope.reset();
                self.requires_fresh_ehlo = true;
                false
            }
            Err(e) => {
                log::warn!("session {}: STARTTLS handshake failed: {}", self.state.session_id.counter, e);
                true
            }
        }
    }

    async fn handle_auth(&mut self, mechanism: String, initial: Option<String>) -> bool {
        if self.config.role != Role::Msa {
            return self.reply(Reply::command_not_recognized()).await;
        }

        let credentials = match mechanism.as_str() {
            "PLAIN" => self.read_auth_plain(initial).await,
            "LOGIN" => self.read_auth_login().await,
            _ => {
                return self.reply(Reply::unrecognized_auth_mechanism()).await;
            }
        };

        let Some((username, password)) = credentials else {
            return self.reply(Reply::auth_failed()).await;
        };

        if !self.config.login_attempts.can_login(self.state.remote_ip) {
            return self.reply(Reply::too_many_failed_logins()).await;
        }

        let authenticated = match self.config.user_repository.find_user_by_email(&username).await {
            Ok(user) => check_password(&user.password_hash, &password),
            Err(_) => false,
        };

        if authenticated {
            self.state.user = Some(username);
            self.reply(Reply::auth_successful()).await
        } else {
            self.config.login_attempts.add_failed_attempt(self.state.remote_ip);
            self.reply(Reply::auth_failed()).await
        }
    }

    async fn read_auth_plain(&mut self, initial: Option<String>) -> Option<(String, String)> {
        let payload = match initial {
            Some(payload) => payload,
            None => {
                if self.protocol.send(&Reply::auth_continue("")).await.is_err() {
                    return None;
                }
                self.protocol.read_line_raw().await.ok()?
            }
        };
        decode_auth_plain(&payload)
    }

    async fn read_auth_login(&mut self) -> Option<(String, String)> {
        self.protocol.send(&Reply::auth_continue(&STANDARD.encode("Username:"))).await.ok()?;
        let username_b64 = self.protocol.read_line_raw().await.ok()?;
        self.protocol.send(&Reply::auth_continue(&STANDARD.encode("Password:"))).await.ok()?;
        let password_b64 = self.protocol.read_line_raw().await.ok()?;

        let username = decode_base64_utf8(&username_b64)?;
        let password = decode_base64_utf8(&password_b64)?;
        Some((username, password))
    }

    async fn handle_mail(&mut self, from: crate::address::MailAddress) -> bool {
        if self.requires_fresh_ehlo {
            return self.reply(Reply::out_of_sequence("EHLO required after STARTTLS")).await;
        }
        if self.config.role == Role::Msa && self.state.user.is_none() {
            return self.reply(Reply::auth_required()).await;
        }
        match self.state.envelope.can_receive_mail() {
            Ok(()) => {
                self.state.envelope.from = Some(from);
                self.reply(Reply::ok()).await
            }
            Err(reason) => self.reply(Reply::out_of_sequence(reason)).await,
        }
    }

    async fn handle_rcpt(&mut self, to: crate::address::MailAddress) -> bool {
        match self.state.envelope.can_receive_rcpt() {
            Ok(()) => {
                self.state.envelope.to.push(to);
                self.reply(Reply::ok()).await
            }
            Err(reason) => self.reply(Reply::out_of_sequence(reason)).await,
        }
    }

    async fn handle_data(&mut self) -> bool {
        if let Err(reason) = self.state.envelope.can_receive_data() {
            return self.reply(Reply::out_of_sequence(reason)).await;
        }

        if self.protocol.send(&Reply::start_mail_input()).await.is_err() {
            return true;
        }

        let body = match self.config.data_reader.read_all(self.protocol.reader()).await {
            Ok(body) => body,
            Err(e) => {
                log::info!("session {}: DATA read failed: {}", self.state.session_id.counter, e);
                self.state.envelope.reset();
                return self.reply(Reply::could_not_parse_mail_data()).await;
            }
        };
        self.state.envelope.data = body;

        let outcome = self.config.handler_chain.run(&mut self.state).await;
        self.state.envelope.reset();

        match outcome {
            Ok(()) => self.reply(Reply::ok()).await,
            Err(e) => self.reply(e.into_reply()).await,
        }
    }
}

/// Decodes an `AUTH PLAIN` payload: `[authzid] NUL authcid NUL passwd`.
fn decode_auth_plain(payload: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(payload.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let mut parts = text.splitn(3, '\0');
    let _authzid = parts.next()?;
    let username = parts.next()?.to_string();
    let password = parts.next()?.to_string();
    Some((username, password))
}

fn decode_base64_utf8(line: &str) -> Option<String> {
    let decoded = STANDARD.decode(line.trim()).ok()?;
    String::from_utf8(decoded).ok()
}
