//! Control-port client and the identity rotation protocol
//!
//! The control protocol is line based. Commands end in CRLF; every reply
//! line is `NNN` followed by a separator and text. `-` marks a mid-reply
//! line, `+` starts a data block terminated by a lone `.`, and a space marks
//! the final line. Asynchronous events use status 650 and may arrive
//! between a command and its reply.
//!
//! Rotation: connect, authenticate, subscribe to notices, `SIGNAL NEWNYM`,
//! wait the cooldown, disconnect. Tor announces rate limiting with a notice
//! such as `Rate limiting NEWNYM request: delaying by 7 second(s)`; that
//! delay wins over the configured default. The notice is logged after the
//! `250 OK` for the signal, so it is waited for within [`NOTICE_WINDOW`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, instrument, trace};

use crate::error::{PoolError, Result};

/// Status code of successful replies
pub const OK: u16 = 250;

/// Status code of asynchronous events
pub const ASYNC_EVENT: u16 = 650;

/// How long to wait for a rate-limiting notice after NEWNYM is acknowledged
pub const NOTICE_WINDOW: Duration = Duration::from_millis(500);

/// One line of a control reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub status: u16,
    pub separator: char,
    pub text: String,
}

/// Parse `NNN<sep>text`
pub fn parse_reply_line(line: &str) -> Result<ReplyLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    let malformed = || PoolError::Control(format!("malformed reply line: {line:?}"));

    let status = line
        .get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse().ok())
        .ok_or_else(malformed)?;
    let separator = match line[3..].chars().next() {
        Some(c @ ('-' | '+' | ' ')) => c,
        None => ' ',
        Some(_) => return Err(malformed()),
    };
    let text = line.get(4..).unwrap_or_default().to_string();

    Ok(ReplyLine {
        status,
        separator,
        text,
    })
}

/// A complete reply with the events received while waiting for it
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub lines: Vec<ReplyLine>,
    pub events: Vec<ReplyLine>,
}

impl Reply {
    /// Status of the final line
    pub fn status(&self) -> u16 {
        self.lines.last().map(|l| l.status).unwrap_or_default()
    }

    pub fn is_ok(&self) -> bool {
        self.status() == OK
    }

    /// Text of the final line
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or_default()
    }
}

/// Quote a string the way the control protocol expects
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\r' => quoted.push_str("\\r"),
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Delay announced by a NEWNYM rate-limiting notice, if `text` is one
pub fn parse_newnym_delay(text: &str) -> Option<Duration> {
    const PREFIX: &str = "delaying by ";
    if !text.contains("NEWNYM") {
        return None;
    }
    let start = text.find(PREFIX)? + PREFIX.len();
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().map(Duration::from_secs)
}

/// An open control connection
///
/// The socket closes when the connection is dropped, on every path.
pub struct ControlConnection {
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    notice_window: Duration,
}

impl ControlConnection {
    /// Connect to the control port at `addr`
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(PoolError::ControlConnect { addr, source }),
            Err(_) => {
                return Err(PoolError::ControlConnect {
                    addr,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no connection after {timeout:?}"),
                    ),
                })
            }
        };
        let (read, write) = stream.into_split();
        debug!(%addr, "Control connection open");

        Ok(Self {
            addr,
            reader: BufReader::new(read),
            writer: write,
            timeout,
            notice_window: NOTICE_WINDOW,
        })
    }

    pub fn with_notice_window(mut self, window: Duration) -> Self {
        self.notice_window = window;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one command and read its complete reply
    pub async fn send(&mut self, command: &str) -> Result<Reply> {
        let verb = command.split_whitespace().next().unwrap_or_default();
        trace!(addr = %self.addr, %verb, "Control command");

        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut reply = Reply::default();
        loop {
            let line = parse_reply_line(&self.read_line().await?)?;

            if line.status == ASYNC_EVENT {
                if line.separator == '+' {
                    self.skip_data_block().await?;
                }
                reply.events.push(line);
                continue;
            }

            let separator = line.separator;
            reply.lines.push(line);
            match separator {
                '+' => self.skip_data_block().await?,
                '-' => {}
                _ => return Ok(reply),
            }
        }
    }

    async fn skip_data_block(&mut self) -> Result<()> {
        while self.read_line().await? != "." {}
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = String::new();
        let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut buf))
            .await
            .map_err(|_| PoolError::Timeout(self.timeout))??;
        if read == 0 {
            return Err(PoolError::Control(format!(
                "connection to {} closed mid-reply",
                self.addr
            )));
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Authenticate with the plaintext control password
    pub async fn authenticate(&mut self, password: &str) -> Result<()> {
        let reply = self.send(&format!("AUTHENTICATE {}", quote(password))).await?;
        if reply.is_ok() {
            debug!(addr = %self.addr, "Authenticated");
            Ok(())
        } else {
            Err(PoolError::Authentication(format!(
                "{} {}",
                reply.status(),
                reply.message()
            )))
        }
    }

    /// Ask for a new identity
    ///
    /// Returns the delay the daemon announced, if it announced one.
    pub async fn signal_newnym(&mut self) -> Result<Option<Duration>> {
        self.expect_ok("SETEVENTS NOTICE").await?;
        let reply = self.expect_ok("SIGNAL NEWNYM").await?;

        let announced = reply
            .events
            .iter()
            .filter_map(|event| parse_newnym_delay(&event.text))
            .max();
        if announced.is_some() {
            return Ok(announced);
        }
        self.wait_for_newnym_notice().await
    }

    /// Read events until a rate-limiting notice arrives or the window closes
    async fn wait_for_newnym_notice(&mut self) -> Result<Option<Duration>> {
        let deadline = tokio::time::Instant::now() + self.notice_window;
        loop {
            let mut buf = String::new();
            match tokio::time::timeout_at(deadline, self.reader.read_line(&mut buf)).await {
                Err(_) | Ok(Ok(0)) => return Ok(None),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }

            let line = parse_reply_line(&buf)?;
            if line.status != ASYNC_EVENT {
                trace!(
                    addr = %self.addr,
                    status = line.status,
                    "Unexpected line while waiting for notices"
                );
                continue;
            }
            if let Some(delay) = parse_newnym_delay(&line.text) {
                return Ok(Some(delay));
            }
        }
    }

    async fn expect_ok(&mut self, command: &str) -> Result<Reply> {
        let reply = self.send(command).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(PoolError::Control(format!(
                "{command}: {} {}",
                reply.status(),
                reply.message()
            )))
        }
    }

    /// Say goodbye and close; failures are irrelevant at this point
    pub async fn quit(mut self) {
        if let Err(e) = self.send("QUIT").await {
            trace!(addr = %self.addr, error = %e, "QUIT not acknowledged");
        }
    }
}

/// Rotate the identity of the daemon behind `addr`
///
/// Returns the cooldown that was waited. On error nothing was signalled
/// unless the error came from the NEWNYM reply itself.
#[instrument(skip(password))]
pub async fn rotate_identity(
    addr: SocketAddr,
    password: &str,
    control_timeout: Duration,
    default_cooldown: Duration,
) -> Result<Duration> {
    let mut conn = ControlConnection::connect(addr, control_timeout).await?;
    conn.authenticate(password).await?;

    let reported = conn.signal_newnym().await?;
    let cooldown = reported.unwrap_or(default_cooldown);
    debug!(?reported, ?cooldown, "NEWNYM accepted");

    tokio::time::sleep(cooldown).await;
    conn.quit().await;
    Ok(cooldown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// What the stub saw on its single connection
    #[derive(Debug, Default)]
    struct Transcript {
        commands: Vec<String>,
        closed_by_client: bool,
    }

    /// Where the rate-limiting notice goes relative to the NEWNYM reply
    #[derive(Debug, Clone, Copy)]
    enum Notice {
        None,
        /// What Tor does: the reply, then the notice
        AfterReply(u64),
        BeforeReply(u64),
    }

    /// Serve one control connection and report what happened
    async fn stub_control_port(
        accept_auth: bool,
        notice: Notice,
    ) -> (SocketAddr, oneshot::Receiver<Transcript>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut transcript = Transcript::default();

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    _ => {
                        transcript.closed_by_client = true;
                        break;
                    }
                };
                transcript.commands.push(line.clone());

                let response = if line.starts_with("AUTHENTICATE") {
                    if accept_auth {
                        "250 OK\r\n".to_string()
                    } else {
                        "515 Authentication failed: Password did not match HashedControlPassword value from configuration\r\n".to_string()
                    }
                } else if line == "SIGNAL NEWNYM" {
                    let rate_limit = |secs: u64| {
                        format!("650 NOTICE Rate limiting NEWNYM request: delaying by {secs} second(s)\r\n")
                    };
                    match notice {
                        Notice::None => "250 OK\r\n".to_string(),
                        Notice::AfterReply(secs) => format!("250 OK\r\n{}", rate_limit(secs)),
                        Notice::BeforeReply(secs) => format!("{}250 OK\r\n", rate_limit(secs)),
                    }
                } else if line == "QUIT" {
                    "250 closing connection\r\n".to_string()
                } else {
                    "250 OK\r\n".to_string()
                };

                if write.write_all(response.as_bytes()).await.is_err() {
                    break;
                }
            }

            let _ = tx.send(transcript);
        });

        (addr, rx)
    }

    #[test]
    fn test_parse_reply_line() {
        let line = parse_reply_line("250 OK\r\n").unwrap();
        assert_eq!(line.status, 250);
        assert_eq!(line.separator, ' ');
        assert_eq!(line.text, "OK");

        let line = parse_reply_line("250-version=0.4.8.9").unwrap();
        assert_eq!(line.separator, '-');
        assert_eq!(line.text, "version=0.4.8.9");

        let line = parse_reply_line("250+info=").unwrap();
        assert_eq!(line.separator, '+');

        assert!(parse_reply_line("OK").is_err());
        assert!(parse_reply_line("25").is_err());
        assert!(parse_reply_line("250xOK").is_err());
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn test_parse_newnym_delay() {
        assert_eq!(
            parse_newnym_delay("NOTICE Rate limiting NEWNYM request: delaying by 7 second(s)"),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            parse_newnym_delay("NOTICE Rate limiting NEWNYM request: delaying by 0 second(s)"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_newnym_delay("NOTICE Bootstrapped 100%"), None);
    }

    #[tokio::test]
    async fn test_rotation_uses_reported_delay() {
        let (addr, transcript) = stub_control_port(true, Notice::AfterReply(0)).await;

        let cooldown = rotate_identity(addr, "s3cr\"t", TIMEOUT, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cooldown, Duration::ZERO);

        let transcript = transcript.await.unwrap();
        assert_eq!(
            transcript.commands,
            vec![
                r#"AUTHENTICATE "s3cr\"t""#,
                "SETEVENTS NOTICE",
                "SIGNAL NEWNYM",
                "QUIT"
            ]
        );
        assert!(transcript.closed_by_client);
    }

    #[tokio::test]
    async fn test_newnym_notice_after_reply() {
        let (addr, _transcript) = stub_control_port(true, Notice::AfterReply(7)).await;
        let mut conn = ControlConnection::connect(addr, TIMEOUT).await.unwrap();
        conn.authenticate("pw").await.unwrap();

        let delay = conn.signal_newnym().await.unwrap();
        assert_eq!(delay, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_newnym_notice_before_reply() {
        let (addr, _transcript) = stub_control_port(true, Notice::BeforeReply(3)).await;
        let mut conn = ControlConnection::connect(addr, TIMEOUT)
            .await
            .unwrap()
            .with_notice_window(Duration::ZERO);
        conn.authenticate("pw").await.unwrap();

        let delay = conn.signal_newnym().await.unwrap();
        assert_eq!(delay, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_newnym_without_notice_gives_up_after_window() {
        let (addr, _transcript) = stub_control_port(true, Notice::None).await;
        let mut conn = ControlConnection::connect(addr, TIMEOUT)
            .await
            .unwrap()
            .with_notice_window(Duration::from_millis(50));
        conn.authenticate("pw").await.unwrap();

        let started = tokio::time::Instant::now();
        let delay = conn.signal_newnym().await.unwrap();

        assert_eq!(delay, None);
        assert!(started.elapsed() < TIMEOUT);
    }

    #[tokio::test]
    async fn test_rotation_falls_back_to_default_cooldown() {
        let (addr, _transcript) = stub_control_port(true, Notice::None).await;
        let default = Duration::from_millis(20);

        let started = tokio::time::Instant::now();
        let cooldown = rotate_identity(addr, "pw", TIMEOUT, default).await.unwrap();

        assert_eq!(cooldown, default);
        assert!(started.elapsed() >= default);
    }

    #[tokio::test]
    async fn test_rejected_authentication_never_signals() {
        let (addr, transcript) = stub_control_port(false, Notice::AfterReply(0)).await;

        let err = rotate_identity(addr, "wrong", TIMEOUT, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Authentication(msg) if msg.starts_with("515")));

        let transcript = transcript.await.unwrap();
        assert_eq!(transcript.commands.len(), 1);
        assert!(!transcript.commands.iter().any(|c| c.contains("NEWNYM")));
        assert!(transcript.closed_by_client);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let err = rotate_identity(addr, "pw", TIMEOUT, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ControlConnect { addr: a, .. } if a == addr));
    }
}
