use crate::client_types::SmtpClientTimeouts;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command unrecognized: {0}")]
    Unknown(String),
    #[error("{0}")]
    Syntax(String),
}

fn syntax<T>(message: impl Into<String>) -> Result<T, CommandError> {
    Err(CommandError::Syntax(message.into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    Path(MailPath),
    NullSender,
}

impl TryFrom<&str> for ReversePath {
    type Error = CommandError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            Ok(Self::NullSender)
        } else {
            Ok(Self::Path(parse_path(s)?))
        }
    }
}

impl std::fmt::Display for ReversePath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Path(p) => p.fmt(fmt),
            Self::NullSender => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    Path(MailPath),
    Postmaster,
}

impl ForwardPath {
    /// The domain this recipient is addressed to.
    /// The bare `postmaster` recipient has no domain.
    pub fn domain(&self) -> Option<&Domain> {
        match self {
            Self::Path(p) => Some(&p.mailbox.domain),
            Self::Postmaster => None,
        }
    }
}

impl TryFrom<&str> for ForwardPath {
    type Error = CommandError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            syntax("Null sender not permitted as a recipient")
        } else if s.eq_ignore_ascii_case("postmaster") {
            Ok(Self::Postmaster)
        } else {
            Ok(Self::Path(parse_path(s)?))
        }
    }
}

impl std::fmt::Display for ForwardPath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Path(p) => p.fmt(fmt),
            Self::Postmaster => fmt.write_str("postmaster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPath {
    pub at_domain_list: Vec<String>,
    pub mailbox: Mailbox,
}

impl std::fmt::Display for MailPath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        // RFC5321 says that source routes MUST be accepted,
        // SHOULD NOT be generated and SHOULD be ignored,
        // so the at_domain_list is never emitted.
        self.mailbox.fmt(fmt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: Domain,
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}@{}", self.local_part, self.domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Name(String),
    V4(String),
    V6(String),
    Tagged { tag: String, literal: String },
}

impl std::fmt::Display for Domain {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Name(name) => fmt.write_str(name),
            Self::V4(addr) => write!(fmt, "[{addr}]"),
            Self::V6(addr) => write!(fmt, "[IPv6:{addr}]"),
            Self::Tagged { tag, literal } => write!(fmt, "[{tag}:{literal}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl std::fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={}", self.name, value),
            None => fmt.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(Domain),
    Helo(Domain),
    MailFrom {
        address: ReversePath,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: ForwardPath,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    DataDot,
    Rset,
    Quit,
    Vrfy(String),
    Help(Option<String>),
    Noop(Option<String>),
    StartTls,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);

        fn prefix_match(line: &str, candidate: &str) -> bool {
            line.len() >= candidate.len()
                && line.as_bytes()[..candidate.len()].eq_ignore_ascii_case(candidate.as_bytes())
        }

        /// Matches a verb that takes an optional argument
        fn verb_arg<'a>(line: &'a str, verb: &str) -> Option<Option<&'a str>> {
            if line.eq_ignore_ascii_case(verb) {
                Some(None)
            } else if prefix_match(line, verb) && line.as_bytes()[verb.len()] == b' ' {
                let arg = line[verb.len() + 1..].trim();
                Some(if arg.is_empty() { None } else { Some(arg) })
            } else {
                None
            }
        }

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("STARTTLS") {
            Self::StartTls
        } else if let Some(arg) = verb_arg(line, "NOOP") {
            Self::Noop(arg.map(|s| s.to_string()))
        } else if let Some(arg) = verb_arg(line, "HELP") {
            Self::Help(arg.map(|s| s.to_string()))
        } else if let Some(arg) = verb_arg(line, "VRFY") {
            match arg {
                Some(arg) => Self::Vrfy(arg.to_string()),
                None => return syntax("VRFY requires an argument"),
            }
        } else if let Some(arg) = verb_arg(line, "EHLO") {
            match arg {
                Some(domain) => Self::Ehlo(parse_domain(domain)?),
                None => return syntax("EHLO requires a domain"),
            }
        } else if let Some(arg) = verb_arg(line, "HELO") {
            match arg {
                Some(domain) => Self::Helo(parse_domain(domain)?),
                None => return syntax("HELO requires a domain"),
            }
        } else if prefix_match(line, "MAIL FROM:") {
            let (address, parameters) = extract_envelope(&line[10..])?;
            Self::MailFrom {
                address: ReversePath::try_from(address)?,
                parameters,
            }
        } else if prefix_match(line, "RCPT TO:") {
            let (address, parameters) = extract_envelope(&line[8..])?;
            Self::RcptTo {
                address: ForwardPath::try_from(address)?,
                parameters,
            }
        } else {
            return Err(CommandError::Unknown(line.to_string()));
        })
    }

    pub fn encode(&self) -> String {
        fn params(parameters: &[EsmtpParameter]) -> String {
            let mut params = String::new();
            for p in parameters {
                params.push(' ');
                params.push_str(&p.to_string());
            }
            params
        }

        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => format!("MAIL FROM:<{address}>{}\r\n", params(parameters)),
            Self::RcptTo {
                address,
                parameters,
            } => format!("RCPT TO:<{address}>{}\r\n", params(parameters)),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Vrfy(param) => format!("VRFY {param}\r\n"),
            Self::Help(Some(param)) => format!("HELP {param}\r\n"),
            Self::Help(None) => "HELP\r\n".to_string(),
            Self::Noop(Some(param)) => format!("NOOP {param}\r\n"),
            Self::Noop(None) => "NOOP\r\n".to_string(),
        }
    }

    /// Timeouts for reading the response
    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) => timeouts.helo_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::Rset
            | Self::Quit
            | Self::Vrfy(_)
            | Self::Help(_)
            | Self::Noop(_)
            | Self::StartTls => timeouts.quit_timeout,
        }
    }

    /// Timeouts for writing the request
    pub fn client_timeout_request(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}

/// Split `<path> PARAM=value ...` into the path and its ESMTP parameters
fn extract_envelope(text: &str) -> Result<(&str, Vec<EsmtpParameter>), CommandError> {
    let text = text.trim_start();

    let (address, remainder) = if let Some(inner) = text.strip_prefix('<') {
        let rangle = match inner.find('>') {
            Some(idx) => idx,
            None => return syntax(format!("expected >: {text:?}")),
        };
        (&inner[..rangle], &inner[rangle + 1..])
    } else {
        let mut fields = text.splitn(2, ' ');
        let address = fields.next().unwrap_or("");
        let remainder = fields.next().unwrap_or("");
        if !remainder.trim().is_empty() {
            return syntax("must enclose address in <> if you want to use ESMTP parameters");
        }
        (address, "")
    };

    if !remainder.is_empty() && !remainder.starts_with(' ') {
        return syntax(format!("unexpected text after address: {remainder:?}"));
    }

    let mut parameters = vec![];
    for param in remainder.split_whitespace() {
        let mut fields = param.splitn(2, '=');
        let name = fields.next().unwrap_or("");
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return syntax(format!("invalid ESMTP parameter {param:?}"));
        }
        parameters.push(EsmtpParameter {
            name: name.to_string(),
            value: fields.next().map(|v| v.to_string()),
        });
    }

    Ok((address, parameters))
}

fn parse_path(text: &str) -> Result<MailPath, CommandError> {
    let (at_domain_list, mailbox) = if text.starts_with('@') {
        let colon = match text.find(':') {
            Some(idx) => idx,
            None => return syntax(format!("invalid source route in {text:?}")),
        };
        let mut at_domain_list = vec![];
        for hop in text[..colon].split(',') {
            match hop.strip_prefix('@') {
                Some(dom) if !dom.is_empty() => at_domain_list.push(dom.to_string()),
                _ => return syntax(format!("invalid source route in {text:?}")),
            }
        }
        (at_domain_list, &text[colon + 1..])
    } else {
        (vec![], text)
    };

    let (local_part, domain) = match mailbox.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => (local, domain),
        _ => return syntax(format!("invalid mailbox {mailbox:?}")),
    };

    Ok(MailPath {
        at_domain_list,
        mailbox: Mailbox {
            local_part: local_part.to_string(),
            domain: parse_domain(domain)?,
        },
    })
}

pub fn parse_domain(text: &str) -> Result<Domain, CommandError> {
    if let Some(literal) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        if let Some(addr) = literal
            .get(..5)
            .filter(|tag| tag.eq_ignore_ascii_case("IPv6:"))
            .and_then(|_| literal.get(5..))
            .filter(|addr| !addr.is_empty())
        {
            return Ok(Domain::V6(addr.to_string()));
        }
        if literal.parse::<Ipv4Addr>().is_ok() {
            return Ok(Domain::V4(literal.to_string()));
        }
        return match literal.split_once(':') {
            Some((tag, literal)) if !tag.is_empty() && !literal.is_empty() => Ok(Domain::Tagged {
                tag: tag.to_string(),
                literal: literal.to_string(),
            }),
            _ => syntax(format!("invalid address literal {text:?}")),
        };
    }

    if is_valid_domain(text) {
        Ok(Domain::Name(text.to_string()))
    } else {
        syntax(format!("invalid domain {text:?}"))
    }
}

pub fn is_valid_domain(text: &str) -> bool {
    !text.is_empty()
        && text.len() <= 255
        && text.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}
