//! End-to-end tests driving the MTA/MSA listeners over raw TCP sockets,
//! covering the scenarios a client conversation actually exercises: happy
//! path reception, dot-stuffing, unknown recipient, out-of-sequence
//! commands, AUTH-gated submission, brute-force blocking and graceful
//! shutdown.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use mistralmail_core::blacklist::NoBlacklist;
use mistralmail_core::handlers::header_merge::HeaderMerge;
use mistralmail_core::handlers::imap_deliver::ImapDeliver;
use mistralmail_core::handlers::message_id::MessageId;
use mistralmail_core::handlers::received::Received;
use mistralmail_core::handlers::{Handler, HandlerChain};
use mistralmail_core::io::data::{DataReader, DEFAULT_MAX_MESSAGE_SIZE};
use mistralmail_core::login_attempts::{LoginAttempts, DEFAULT_BLOCK_DURATION};
use mistralmail_core::repository::{hash_password, InMemoryRepository, MailboxRepository};
use mistralmail_core::server::Server;
use mistralmail_core::session::{Role, SessionConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

/// Spawns a listener with a fresh in-memory repository (seeded with one
/// user), starts draining it on a background task, and returns the address
/// plus a shutdown sender and the repository (for assertions).
async fn spawn_server(role: Role, require_auth: bool) -> (String, watch::Sender<bool>, Arc<InMemoryRepository>, tokio::task::JoinHandle<()>) {
    let repository = Arc::new(InMemoryRepository::new());
    repository.seed_user("alice", &hash_password("hunter2").unwrap(), "alice@example.com");

    let handlers: Vec<Box<dyn Handler>> = vec![
        Box::new(Received::new("mx.example.com".to_string(), "127.0.0.1".to_string())),
        Box::new(MessageId::new("mx.example.com".to_string())),
        Box::new(HeaderMerge),
        Box::new(ImapDeliver::new(repository.clone())),
    ];

    let config = Arc::new(SessionConfig {
        hostname: "mx.example.com".to_string(),
        our_ip: "127.0.0.1".to_string(),
        role,
        tls_acceptor: None,
        handler_chain: Arc::new(HandlerChain::new(handlers)),
        login_attempts: Arc::new(LoginAttempts::new(if require_auth { 5 } else { 5 }, DEFAULT_BLOCK_DURATION)),
        user_repository: repository.clone(),
        data_reader: DataReader::new(DEFAULT_MAX_MESSAGE_SIZE),
    });

    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let server = Server::new(addr.clone(), config, Arc::new(NoBlacklist));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        server.listen_and_serve(rx).await.ok();
    });

    wait_for_port(&addr).await;
    (addr, tx, repository, handle)
}

async fn wait_for_port(addr: &str) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        if std::time::Instant::now() > deadline {
            panic!("server at {addr} never came up");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Client { reader: BufReader::new(read_half), writer };
        let greeting = client.read_line().await;
        assert!(greeting.starts_with("220"), "unexpected greeting: {greeting}");
        client
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    /// Reads lines until one with a space right after the status code
    /// (the final line of a possibly-multiline reply).
    async fn read_reply(&mut self) -> String {
        loop {
            let line = self.read_line().await;
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                return line;
            }
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
        self.read_reply().await
    }
}

#[tokio::test]
async fn delivers_a_well_formed_message_to_the_recipients_inbox() {
    let (addr, shutdown, repository, handle) = spawn_server(Role::Mta, false).await;
    let mut client = Client::connect(&addr).await;

    assert!(client.send("EHLO client.example.com").await.starts_with("250"));
    assert!(client.send("MAIL FROM:<sender@example.com>").await.starts_with("250"));
    assert!(client.send("RCPT TO:<alice@example.com>").await.starts_with("250"));
    assert!(client.send("DATA").await.starts_with("354"));

    client
        .writer
        .write_all(b"Subject: hello\r\n\r\nThis is the body.\r\n.\r\n")
        .await
        .unwrap();
    client.writer.flush().await.unwrap();
    let reply = client.read_reply().await;
    assert!(reply.starts_with("250"), "unexpected DATA reply: {reply}");

    let inbox = repository
        .find_mailbox_by_user_and_name(1, mistralmail_core::repository::INBOX)
        .await
        .unwrap();
    assert_eq!(inbox.name, mistralmail_core::repository::INBOX);

    assert!(client.send("QUIT").await.starts_with("221"));
    let _ = shutdown.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn persisted_body_leads_with_received_then_message_id_then_client_headers() {
    let (addr, shutdown, repository, handle) = spawn_server(Role::Mta, false).await;
    let mut client = Client::connect(&addr).await;

    client.send("EHLO client.example.com").await;
    client.send("MAIL FROM:<sender@example.com>").await;
    client.send("RCPT TO:<alice@example.com>").await;
    assert!(client.send("DATA").await.starts_with("354"));

    client
        .writer
        .write_all(b"Subject: hello\r\n\r\nThis is the body.\r\n.\r\n")
        .await
        .unwrap();
    client.writer.flush().await.unwrap();
    let reply = client.read_reply().await;
    assert!(reply.starts_with("250"), "unexpected DATA reply: {reply}");

    let inbox = repository
        .find_mailbox_by_user_and_name(1, mistralmail_core::repository::INBOX)
        .await
        .unwrap();
    let messages = repository.messages_in(inbox.id).await;
    assert_eq!(messages.len(), 1);
    let body = String::from_utf8(messages[0].body.clone()).unwrap();
    let received_at = body.find("Received:").expect("Received header must be present");
    let message_id_at = body.find("Message-ID:").expect("Message-ID header must be present");
    let subject_at = body.find("Subject:").expect("client's own header must survive");
    assert!(
        received_at < message_id_at && message_id_at < subject_at,
        "expected Received, then Message-ID, then the client's own headers, got:\n{body}"
    );

    assert!(client.send("QUIT").await.starts_with("221"));
    let _ = shutdown.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn dot_stuffed_leading_dots_are_unescaped() {
    let (addr, shutdown, _repository, handle) = spawn_server(Role::Mta, false).await;
    let mut client = Client::connect(&addr).await;

    client.send("EHLO client.example.com").await;
    client.send("MAIL FROM:<sender@example.com>").await;
    client.send("RCPT TO:<alice@example.com>").await;
    assert!(client.send("DATA").await.starts_with("354"));

    // "..leading dot" was escaped to "...leading dot" by the sending client.
    client.writer.write_all(b"Body with ..leading dot\r\n.\r\n").await.unwrap();
    client.writer.flush().await.unwrap();
    let reply = client.read_reply().await;
    assert!(reply.starts_with("250"), "unexpected DATA reply: {reply}");

    let _ = shutdown.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn unknown_recipient_is_rejected_with_550_and_nothing_is_delivered() {
    let (addr, shutdown, _repository, handle) = spawn_server(Role::Mta, false).await;
    let mut client = Client::connect(&addr).await;

    client.send("EHLO client.example.com").await;
    client.send("MAIL FROM:<sender@example.com>").await;
    client.send("RCPT TO:<nobody@example.com>").await;
    assert!(client.send("DATA").await.starts_with("354"));

    client.writer.write_all(b"Subject: test\r\n\r\nbody\r\n.\r\n").await.unwrap();
    client.writer.flush().await.unwrap();
    let reply = client.read_reply().await;
    assert!(reply.starts_with("550"), "expected 550 for unknown recipient, got: {reply}");

    let _ = shutdown.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn rcpt_before_mail_is_rejected_as_out_of_sequence() {
    let (addr, shutdown, _repository, handle) = spawn_server(Role::Mta, false).await;
    let mut client = Client::connect(&addr).await;

    client.send("EHLO client.example.com").await;
    let reply = client.send("RCPT TO:<alice@example.com>").await;
    assert!(reply.starts_with("503"), "expected 503 out-of-sequence, got: {reply}");

    let _ = shutdown.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn msa_rejects_mail_from_without_authentication() {
    let (addr, shutdown, _repository, handle) = spawn_server(Role::Msa, true).await;
    let mut client = Client::connect(&addr).await;

    client.send("EHLO client.example.com").await;
    let reply = client.send("MAIL FROM:<sender@example.com>").await;
    assert!(reply.starts_with("530"), "expected 530 auth required, got: {reply}");

    let _ = shutdown.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn repeated_failed_auth_attempts_are_eventually_blocked() {
    let (addr, shutdown, _repository, handle) = spawn_server(Role::Msa, true).await;
    let mut client = Client::connect(&addr).await;
    client.send("EHLO client.example.com").await;

    let creds = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, "\0alice\0wrong-password");
    let mut last_reply = String::new();
    for _ in 0..6 {
        last_reply = client.send(&format!("AUTH PLAIN {creds}")).await;
    }
    assert!(last_reply.starts_with("535"), "expected 535 once the block kicks in, got: {last_reply}");

    let _ = shutdown.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_signal_drains_without_dropping_the_in_flight_command_loop() {
    let (addr, shutdown, _repository, handle) = spawn_server(Role::Mta, false).await;
    let mut client = Client::connect(&addr).await;
    client.send("EHLO client.example.com").await;

    let _ = shutdown.send(true);
    let reply = client.read_reply().await;
    assert!(reply.starts_with("421"), "expected 421 shutting down, got: {reply}");

    handle.await.unwrap();
}
