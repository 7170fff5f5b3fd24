use crate::client::ClientError;
use std::time::Duration;

/// Deadlines applied to each step of an outbound transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SmtpClientTimeouts {
    pub connect_timeout: Duration,
    pub banner_timeout: Duration,
    pub helo_timeout: Duration,
    pub mail_from_timeout: Duration,
    pub rcpt_to_timeout: Duration,
    pub data_timeout: Duration,
    pub data_dot_timeout: Duration,
    pub quit_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            banner_timeout: Duration::from_secs(60),
            helo_timeout: Duration::from_secs(300),
            mail_from_timeout: Duration::from_secs(300),
            rcpt_to_timeout: Duration::from_secs(300),
            data_timeout: Duration::from_secs(300),
            data_dot_timeout: Duration::from_secs(300),
            quit_timeout: Duration::from_secs(5),
        }
    }
}

impl SmtpClientTimeouts {
    /// Use the same deadline for every step, reads and writes alike
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            banner_timeout: timeout,
            helo_timeout: timeout,
            mail_from_timeout: timeout,
            rcpt_to_timeout: timeout,
            data_timeout: timeout,
            data_dot_timeout: timeout,
            quit_timeout: timeout,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{enh} "));
        }

        for c in self.content.chars() {
            match c {
                '\r' => {}
                '\n' => line.push(' '),
                c => line.push(c),
            }
        }

        line
    }

    /// The textual portion of the reply, with the enhanced status
    /// code restored, as it would be relayed on to another client.
    pub fn text_with_enhanced_code(&self) -> String {
        match &self.enhanced_code {
            Some(enh) => self
                .content
                .lines()
                .map(|line| format!("{enh} {line}"))
                .collect::<Vec<_>>()
                .join("\n"),
            None => self.content.clone(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        // No other classes are defined
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next()?;

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl ResponseLine<'_> {
    fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

pub(crate) fn parse_response_line(line: &str) -> Result<ResponseLine<'_>, ClientError> {
    if line.len() < 4 {
        // A bare "250" is tolerated as a final line with no text
        if line.len() == 3 {
            if let Ok(code) = line.parse::<u16>() {
                return Ok(ResponseLine {
                    code,
                    is_final: true,
                    content: "",
                });
            }
        }
        return Err(ClientError::MalformedResponseLine(line.to_string()));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(ClientError::MalformedResponseLine(line.to_string())),
        },
        _ => Err(ClientError::MalformedResponseLine(line.to_string())),
    }
}

pub(crate) struct ResponseBuilder {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let code = parsed.code;
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };

        Self {
            code,
            enhanced_code,
            content,
        }
    }

    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.to_original_line());
        }

        self.content.push('\n');

        let mut content = parsed.content;

        if let Some(enh) = &self.enhanced_code {
            let prefix = format!("{enh} ");
            if let Some(remainder) = parsed.content.strip_prefix(&prefix) {
                content = remainder;
            }
        }

        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            content: self.content,
            enhanced_code: self.enhanced_code,
            command,
        }
    }
}
