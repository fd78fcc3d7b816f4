//! SMTP command parser (C4).
//!
//! Reads one line via [`crate::io::line`], splits it into a verb and an
//! argument map, and produces the matching [`Command`] variant. Each
//! argument token is `KEY[:=VALUE]`; the key is upper-cased, the value
//! keeps its original case so a local part's case sensitivity survives.

use std::collections::HashMap;

use crate::address::MailAddress;

/// One `KEY[:=VALUE]` token from a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Argument {
    key: String,
    value: String,
}

/// A parsed SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo { domain: String },
    Ehlo { domain: String },
    Mail { from: MailAddress, eightbitmime: bool },
    Rcpt { to: MailAddress },
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy { param: String },
    Expn { list_name: String },
    Send,
    Soml,
    Saml,
    StartTls,
    Auth { mechanism: String, initial: Option<String> },
    /// Known verb, bad arguments.
    InvalidCmd { verb: String, info: String },
    /// Unrecognized verb.
    UnknownCmd { verb: String },
}

/// Parses one already-read command line (without its trailing CRLF).
pub fn parse(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);

    let (verb, rest) = match line.find(' ') {
        Some(i) => (line[..i].to_uppercase(), line[i + 1..].trim_start()),
        None => (line.to_uppercase(), ""),
    };

    let args = parse_args(rest);

    match verb.as_str() {
        "HELO" => match single_token(rest) {
            Some(domain) => Command::Helo { domain },
            None => Command::InvalidCmd {
                verb,
                info: "HELO requires exactly one valid domain".to_string(),
            },
        },
        "EHLO" => match single_token(rest) {
            Some(domain) => Command::Ehlo { domain },
            None => Command::InvalidCmd {
                verb,
                info: "EHLO requires exactly one valid address".to_string(),
            },
        },
        "MAIL" => match args.get("FROM") {
            Some(arg) => match MailAddress::parse(&arg.value) {
                Ok(from) => Command::Mail {
                    from,
                    eightbitmime: eightbitmime(&args),
                },
                Err(e) => Command::InvalidCmd {
                    verb,
                    info: e.to_string(),
                },
            },
            None => Command::InvalidCmd {
                verb,
                info: "MAIL requires a FROM:<addr> argument".to_string(),
            },
        },
        "RCPT" => match args.get("TO") {
            Some(arg) => match MailAddress::parse(&arg.value) {
                Ok(to) => Command::Rcpt { to },
                Err(e) => Command::InvalidCmd {
                    verb,
                    info: e.to_string(),
                },
            },
            None => Command::InvalidCmd {
                verb,
                info: "RCPT requires a TO:<addr> argument".to_string(),
            },
        },
        "DATA" => Command::Data,
        "RSET" => Command::Rset,
        "NOOP" => Command::Noop,
        "QUIT" => Command::Quit,
        "VRFY" => Command::Vrfy {
            param: single_token(rest).unwrap_or_default(),
        },
        "EXPN" => Command::Expn {
            list_name: single_token(rest).unwrap_or_default(),
        },
        "SEND" => Command::Send,
        "SOML" => Command::Soml,
        "SAML" => Command::Saml,
        "STARTTLS" => Command::StartTls,
        "AUTH" => parse_auth(rest),
        _ => Command::UnknownCmd { verb },
    }
}

fn parse_auth(rest: &str) -> Command {
    let mut parts = rest.splitn(2, ' ');
    let mechanism = parts.next().unwrap_or("").to_uppercase();
    let initial = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    if mechanism.is_empty() {
        Command::InvalidCmd {
            verb: "AUTH".to_string(),
            info: "AUTH requires a mechanism".to_string(),
        }
    } else {
        Command::Auth { mechanism, initial }
    }
}

/// Splits `rest` on whitespace into `KEY[:=VALUE]` tokens. The operator
/// (`:` or `=`) is not retained; both forms are treated identically.
fn parse_args(rest: &str) -> HashMap<String, Argument> {
    let mut map = HashMap::new();
    for token in rest.split_whitespace() {
        let sep = token.find([':', '=']);
        let (key, value) = match sep {
            Some(i) => (token[..i].trim().to_uppercase(), token[i + 1..].trim().to_string()),
            None => (token.trim().to_uppercase(), String::new()),
        };
        if key.is_empty() {
            continue;
        }
        map.insert(key.clone(), Argument { key, value });
    }
    map
}

/// `HELO`/`EHLO`/`VRFY`/`EXPN` take exactly one bare (non-`KEY:VALUE`) token.
fn single_token(rest: &str) -> Option<String> {
    let mut tokens = rest.split_whitespace();
    let first = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    Some(first.to_string())
}

fn eightbitmime(args: &HashMap<String, Argument>) -> bool {
    args.get("BODY")
        .map(|a| a.value.eq_ignore_ascii_case("8BITMIME"))
        .unwrap_or(false)
}
