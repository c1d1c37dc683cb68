use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::Notifier;

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Envelope and header sender.
    pub from: String,
    pub timeout: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            from: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Header and envelope values must not carry line breaks.
fn single_line<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    if value.contains(['\r', '\n']) {
        return Err(anyhow!("SMTP {} contains a line break", field));
    }
    Ok(value)
}

/// Plain SMTP relay client. One connection per message.
pub struct SmtpNotifier {
    config: SmtpConfig,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self> {
        if config.from.trim().is_empty() {
            return Err(anyhow!("SMTP sender address must be set"));
        }
        single_line("sender", &config.from)?;
        Ok(Self { config })
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .with_context(|| format!("resolve SMTP host {}", self.config.host))?
            .next()
            .ok_or_else(|| anyhow!("SMTP host {} has no address", self.config.host))?;
        let stream = TcpStream::connect_timeout(&addr, self.config.timeout)
            .with_context(|| format!("connect to SMTP server {}", addr))?;
        stream.set_read_timeout(Some(self.config.timeout))?;
        stream.set_write_timeout(Some(self.config.timeout))?;
        Ok(stream)
    }
}

impl Notifier for SmtpNotifier {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        let recipient = single_line("recipient", recipient)?;
        let subject = single_line("subject", subject)?;
        let stream = self.connect()?;
        let mut session = Session {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        };

        session.expect(220)?;
        session.command("HELO detectord", 250)?;
        session.command(&format!("MAIL FROM:<{}>", self.config.from), 250)?;
        session.command(&format!("RCPT TO:<{}>", recipient), 250)?;
        session.command("DATA", 354)?;

        let mut message = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
            self.config.from, recipient, subject
        );
        for line in body.lines() {
            if line.starts_with('.') {
                message.push('.');
            }
            message.push_str(line);
            message.push_str("\r\n");
        }
        message.push_str(".\r\n");
        session.writer.write_all(message.as_bytes())?;
        session.expect(250)?;

        session.command("QUIT", 221)?;
        log::debug!("smtp: delivered '{}' to {}", subject, recipient);
        Ok(())
    }
}

struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Session {
    fn command(&mut self, line: &str, expected: u16) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.expect(expected)
            .with_context(|| format!("SMTP command {}", line.split(':').next().unwrap_or(line)))
    }

    /// Read a (possibly multi-line) reply and check its code.
    fn expect(&mut self, expected: u16) -> Result<()> {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Err(anyhow!("SMTP server closed the connection"));
            }
            let code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| anyhow!("malformed SMTP reply: {}", line.trim_end()))?;
            if line.as_bytes().get(3) == Some(&b'-') {
                continue;
            }
            if code != expected {
                return Err(anyhow!(
                    "SMTP server replied {} (expected {})",
                    line.trim_end(),
                    expected
                ));
            }
            return Ok(());
        }
    }
}
