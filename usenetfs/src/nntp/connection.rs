use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadBuf,
};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_native_tls::{TlsConnector, TlsStream};
use tracing::{debug, trace};

use super::error::{NntpError, Result};
use super::response::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    /// 119 for plain text, 563 for TLS.
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub tls_skip_verify: bool,
    #[serde(with = "secs")]
    pub dial_timeout: Duration,
    #[serde(with = "secs")]
    pub keepalive: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 119,
            username: String::new(),
            password: String::new(),
            tls: false,
            tls_skip_verify: false,
            dial_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(5 * 60),
        }
    }
}

impl ConnectionConfig {
    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.username)
    }

    fn normalized(&self) -> Self {
        let mut config = self.clone();
        if config.dial_timeout.is_zero() {
            config.dial_timeout = Duration::from_secs(30);
        }
        if config.keepalive.is_zero() {
            config.keepalive = Duration::from_secs(5 * 60);
        }
        config
    }
}

/// Durations are written as whole seconds in settings files.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

enum StreamType {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

struct NntpStream {
    inner: StreamType,
}

impl AsyncRead for NntpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamType::Plain(s) => Pin::new(s).poll_read(cx, buf),
            StreamType::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NntpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.inner {
            StreamType::Plain(s) => Pin::new(s).poll_write(cx, buf),
            StreamType::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamType::Plain(s) => Pin::new(s).poll_flush(cx),
            StreamType::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamType::Plain(s) => Pin::new(s).poll_shutdown(cx),
            StreamType::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A single NNTP session (RFC 3977, RFC 4643).
///
/// Commands take `&mut self`, so only one command is ever in flight. A
/// multi-line reply that has not been read to its terminator leaves the
/// connection unclean and the next command fails with a protocol error.
pub struct Connection {
    stream: BufReader<NntpStream>,
    connected: bool,
    authenticated: bool,
    current_group: String,
    keepalive: Duration,
    stale_at: Instant,
    pending: bool,
}

impl Connection {
    /// Dials the server, reads the greeting and authenticates when a
    /// username is configured.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let config = config.normalized();
        let stream = dial(&config).await?;

        let mut conn = Connection {
            stream: BufReader::new(stream),
            connected: true,
            authenticated: false,
            current_group: String::new(),
            keepalive: config.keepalive,
            stale_at: Instant::now() + config.keepalive,
            pending: false,
        };

        let greeting = conn.read_status().await?;
        if greeting.code != STATUS_POSTING_ALLOWED && greeting.code != STATUS_POSTING_NOT_ALLOWED {
            let _ = conn.stream.get_mut().shutdown().await;
            return Err(NntpError::protocol(greeting.code, greeting.text));
        }
        debug!("NNTP greeting from {}: {} {}", config.host, greeting.code, greeting.text);

        if !config.username.is_empty() {
            if let Err(e) = conn.authenticate(&config.username, &config.password).await {
                let _ = conn.close().await;
                return Err(e);
            }
        }

        Ok(conn)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn current_group(&self) -> &str {
        &self.current_group
    }

    pub fn is_stale(&self) -> bool {
        !self.connected || Instant::now() >= self.stale_at
    }

    /// True when no reply is left half-read on the wire.
    pub fn is_clean(&self) -> bool {
        self.connected && !self.pending
    }

    /// RFC 4643 Section 2.3
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let line = build_command("AUTHINFO USER", &[username])?;
        self.send(&line).await?;
        let status = self.read_status().await?;
        match status.code {
            STATUS_AUTH_ACCEPTED => {
                self.authenticated = true;
                return Ok(());
            }
            STATUS_PASSWORD_REQUIRED => {}
            code => return Err(NntpError::command(line, code, status.text)),
        }

        let line = build_command("AUTHINFO PASS", &[password])?;
        self.send(&line).await?;
        let status = self.read_status().await?;
        if status.code != STATUS_AUTH_ACCEPTED {
            return Err(NntpError::command(
                "AUTHINFO PASS <password>",
                status.code,
                status.text,
            ));
        }
        self.authenticated = true;
        Ok(())
    }

    /// RFC 3977 Section 5.2
    pub async fn capabilities(&mut self) -> Result<Capabilities> {
        self.command("CAPABILITIES", &[], STATUS_CAPABILITY_LIST)
            .await?;
        let lines = self.read_dot_lines().await?;
        parse_capabilities(&lines)
    }

    /// RFC 3977 Section 7.1
    pub async fn date(&mut self) -> Result<DateTime<Utc>> {
        let status = self.command("DATE", &[], STATUS_SERVER_DATE).await?;
        parse_date(&status.text)
    }

    /// RFC 3977 Section 6.1.1
    pub async fn group(&mut self, name: &str) -> Result<Group> {
        let status = self.command("GROUP", &[name], STATUS_GROUP_SELECTED).await?;
        let group = parse_group(&status.text)?;
        self.current_group = group.name.clone();
        Ok(group)
    }

    /// RFC 3977 Section 6.2.1. `spec` is a message-id, an article number or
    /// empty for the current article.
    pub async fn article(&mut self, spec: &str) -> Result<Article<'_>> {
        let status = self.command("ARTICLE", &[spec], STATUS_ARTICLE).await?;
        let mut id = parse_article_id(status.code, &status.text)?;
        self.pending = true;
        let headers = parse_headers(&self.read_header_block().await?);
        if let Some(message_id) = headers.get("Message-ID") {
            id.message_id = message_id.to_string();
        }
        Ok(Article {
            number: id.number,
            message_id: id.message_id,
            headers,
            body: BodyReader::new(self),
        })
    }

    /// RFC 3977 Section 6.2.2
    pub async fn head(&mut self, spec: &str) -> Result<(ArticleId, Headers)> {
        let status = self.command("HEAD", &[spec], STATUS_ARTICLE_HEADERS).await?;
        let mut id = parse_article_id(status.code, &status.text)?;
        let headers = parse_headers(&self.read_dot_lines().await?);
        if let Some(message_id) = headers.get("Message-ID") {
            id.message_id = message_id.to_string();
        }
        Ok((id, headers))
    }

    /// RFC 3977 Section 6.2.3. The returned reader must be drained (or
    /// closed) before the connection can issue another command.
    pub async fn body(&mut self, spec: &str) -> Result<(ArticleId, BodyReader<'_>)> {
        let status = self.command("BODY", &[spec], STATUS_ARTICLE_BODY).await?;
        let id = parse_article_id(status.code, &status.text)?;
        self.pending = true;
        Ok((id, BodyReader::new(self)))
    }

    /// RFC 3977 Section 6.2.4
    pub async fn stat(&mut self, spec: &str) -> Result<ArticleId> {
        let status = self.command("STAT", &[spec], STATUS_ARTICLE_EXISTS).await?;
        parse_article_id(status.code, &status.text)
    }

    /// RFC 3977 Section 6.1.4
    pub async fn next(&mut self) -> Result<ArticleId> {
        let status = self.command("NEXT", &[], STATUS_ARTICLE_EXISTS).await?;
        parse_article_id(status.code, &status.text)
    }

    /// RFC 3977 Section 6.1.3
    pub async fn last(&mut self) -> Result<ArticleId> {
        let status = self.command("LAST", &[], STATUS_ARTICLE_EXISTS).await?;
        parse_article_id(status.code, &status.text)
    }

    /// RFC 3977 Section 8.3. `range` is a number, `n-`, `n-m` or a
    /// message-id.
    pub async fn over(&mut self, range: &str) -> Result<Vec<ArticleOverview>> {
        self.command("OVER", &[range], STATUS_OVERVIEW).await?;
        Ok(parse_overview(&self.read_dot_lines().await?))
    }

    /// RFC 3977 Section 6.1.2
    pub async fn list_group(&mut self, group: &str, range: &str) -> Result<(Group, Vec<i64>)> {
        let status = self
            .command("LISTGROUP", &[group, range], STATUS_GROUP_SELECTED)
            .await?;
        let info = parse_group(&status.text)?;
        let numbers = parse_article_numbers(&self.read_dot_lines().await?);
        if !group.is_empty() {
            self.current_group = info.name.clone();
        }
        Ok((info, numbers))
    }

    /// RFC 3977 Section 7.6. Returns the raw lines; an empty keyword means
    /// `LIST ACTIVE`.
    pub async fn list(&mut self, keyword: &str, args: &[&str]) -> Result<Vec<String>> {
        let keyword = if keyword.is_empty() { "ACTIVE" } else { keyword };
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(keyword);
        all.extend_from_slice(args);
        self.command("LIST", &all, STATUS_INFORMATION).await?;
        self.read_dot_lines().await
    }

    pub async fn list_active(&mut self, wildmat: &str) -> Result<Vec<ActiveGroup>> {
        Ok(parse_active(&self.list("ACTIVE", &[wildmat]).await?))
    }

    pub async fn list_active_times(&mut self, wildmat: &str) -> Result<Vec<GroupActiveTime>> {
        Ok(parse_active_times(
            &self.list("ACTIVE.TIMES", &[wildmat]).await?,
        ))
    }

    pub async fn list_newsgroups(&mut self, wildmat: &str) -> Result<Vec<NewsGroup>> {
        Ok(parse_newsgroups(&self.list("NEWSGROUPS", &[wildmat]).await?))
    }

    pub async fn list_distrib_pats(&mut self) -> Result<Vec<DistribPat>> {
        Ok(parse_distrib_pats(&self.list("DISTRIB.PATS", &[]).await?))
    }

    /// RFC 3977 Section 5.4. Sends QUIT when the session is still usable and
    /// shuts the socket down either way.
    pub async fn close(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }

        let quit = if self.pending {
            Ok(())
        } else {
            match self.send("QUIT").await {
                Ok(()) => self.read_status().await.and_then(|s| {
                    if s.code == STATUS_CLOSING_CONNECTION {
                        Ok(())
                    } else {
                        Err(NntpError::command("QUIT", s.code, s.text))
                    }
                }),
                Err(e) => Err(e),
            }
        };

        let _ = self.stream.get_mut().shutdown().await;
        self.connected = false;
        self.authenticated = false;
        self.pending = false;
        self.current_group.clear();
        quit
    }

    async fn command(&mut self, cmd: &str, args: &[&str], expect: u16) -> Result<StatusLine> {
        let line = build_command(cmd, args)?;
        self.send(&line).await?;
        let status = self.read_status().await?;
        if status.code != expect {
            return Err(NntpError::command(line, status.code, status.text));
        }
        Ok(status)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        if !self.connected {
            return Err(NntpError::connection(
                "not connected",
                io::ErrorKind::NotConnected.into(),
            ));
        }
        if self.pending {
            return Err(NntpError::protocol(
                0,
                "previous multi-line response was not fully read",
            ));
        }
        trace!(">> {}", redact(line));
        let writer = self.stream.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_raw_line(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        let n = self.stream.read_until(b'\n', buf).await?;
        if n == 0 {
            self.connected = false;
            return Err(NntpError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }

    async fn read_status(&mut self) -> Result<StatusLine> {
        let mut buf = Vec::with_capacity(128);
        self.read_raw_line(&mut buf).await?;
        let line = String::from_utf8_lossy(&buf);
        trace!("<< {}", line.trim_end());
        self.stale_at = Instant::now() + self.keepalive;
        StatusLine::parse(&line)
    }

    /// Reads a dot-terminated block, undoing dot-stuffing.
    async fn read_dot_lines(&mut self) -> Result<Vec<String>> {
        self.pending = true;
        let mut lines = Vec::new();
        let mut buf = Vec::with_capacity(256);
        loop {
            self.read_raw_line(&mut buf).await?;
            let line = trim_crlf(&buf);
            if line == b"." {
                break;
            }
            let line = line.strip_prefix(b".").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
        }
        self.pending = false;
        Ok(lines)
    }

    /// Reads article headers up to the blank separator line. If the
    /// terminator arrives first the article has no body.
    async fn read_header_block(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut buf = Vec::with_capacity(256);
        loop {
            self.read_raw_line(&mut buf).await?;
            let line = trim_crlf(&buf);
            if line.is_empty() {
                break;
            }
            if line == b"." {
                self.pending = false;
                break;
            }
            let line = line.strip_prefix(b".").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
        }
        Ok(lines)
    }
}

/// Connects to the first reachable address of `addr` with TCP keepalive on.
async fn connect_tcp(addr: &str) -> io::Result<TcpStream> {
    let mut last_err = None;
    for sock_addr in lookup_host(addr).await? {
        let socket = if sock_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        match socket.connect(sock_addr).await {
            Ok(tcp) => return Ok(tcp),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {addr}"))
    }))
}

async fn dial(config: &ConnectionConfig) -> Result<NntpStream> {
    let addr = format!("{}:{}", config.host, config.port);
    debug!("Connecting to NNTP server at {}", addr);

    let connect = async {
        let tcp = connect_tcp(&addr)
            .await
            .map_err(|e| NntpError::connection("failed to connect", e))?;

        tcp.set_nodelay(true)
            .map_err(|e| NntpError::connection("failed to set no-delay", e))?;

        if !config.tls {
            return Ok(NntpStream {
                inner: StreamType::Plain(tcp),
            });
        }

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.tls_skip_verify)
            .danger_accept_invalid_hostnames(config.tls_skip_verify)
            .build()
            .map_err(|e| NntpError::connection("failed to connect with TLS", io::Error::other(e)))?;
        let tls = TlsConnector::from(connector)
            .connect(&config.host, tcp)
            .await
            .map_err(|e| NntpError::connection("failed to connect with TLS", io::Error::other(e)))?;
        Ok(NntpStream {
            inner: StreamType::Tls(Box::new(tls)),
        })
    };

    match tokio::time::timeout(config.dial_timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(NntpError::connection(
            "failed to connect",
            io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out")),
        )),
    }
}

/// Joins a command and its non-empty arguments, rejecting CR/LF injection.
pub(crate) fn build_command(cmd: &str, args: &[&str]) -> Result<String> {
    let mut line = String::from(cmd);
    for arg in args {
        if arg.contains(['\r', '\n']) {
            return Err(NntpError::protocol(
                0,
                "invalid input: contains CR/LF characters",
            ));
        }
        if !arg.is_empty() {
            line.push(' ');
            line.push_str(arg);
        }
    }
    Ok(line)
}

/// Wraps a bare message-id in angle brackets.
pub fn format_message_id(id: &str) -> String {
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

fn redact(line: &str) -> &str {
    if line.starts_with("AUTHINFO PASS") {
        "AUTHINFO PASS <password>"
    } else {
        line
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

pub struct Article<'a> {
    pub number: i64,
    pub message_id: String,
    pub headers: Headers,
    pub body: BodyReader<'a>,
}

/// Streams a dot-terminated article body with dot-stuffing removed.
///
/// Line endings are passed through untouched. Dropping the reader before
/// the terminator leaves the connection unclean.
pub struct BodyReader<'a> {
    conn: &'a mut Connection,
    line: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<'a> BodyReader<'a> {
    fn new(conn: &'a mut Connection) -> Self {
        let done = !conn.pending;
        Self {
            conn,
            line: Vec::with_capacity(256),
            pos: 0,
            done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done && self.pos >= self.line.len()
    }

    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Discards the rest of the body so the connection can be reused.
    pub async fn close(&mut self) -> Result<()> {
        loop {
            let n = {
                let buf = self.fill_buf().await?;
                if buf.is_empty() {
                    return Ok(());
                }
                buf.len()
            };
            self.consume(n);
        }
    }
}

impl AsyncBufRead for BodyReader<'_> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.pos < this.line.len() {
            return Poll::Ready(Ok(&this.line[this.pos..]));
        }
        if this.done {
            return Poll::Ready(Ok(&[]));
        }
        if this.pos > 0 {
            this.line.clear();
            this.pos = 0;
        }

        loop {
            let (used, complete) = {
                let available = ready!(Pin::new(&mut this.conn.stream).poll_fill_buf(cx))?;
                if available.is_empty() {
                    this.conn.connected = false;
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                match available.iter().position(|&b| b == b'\n') {
                    Some(i) => {
                        this.line.extend_from_slice(&available[..=i]);
                        (i + 1, true)
                    }
                    None => {
                        this.line.extend_from_slice(available);
                        (available.len(), false)
                    }
                }
            };
            Pin::new(&mut this.conn.stream).consume(used);
            if complete {
                break;
            }
        }

        if trim_crlf(&this.line) == b"." {
            this.done = true;
            this.conn.pending = false;
            this.line.clear();
            return Poll::Ready(Ok(&[]));
        }
        this.pos = usize::from(this.line.starts_with(b".."));
        Poll::Ready(Ok(&this.line[this.pos..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        this.pos = (this.pos + amt).min(this.line.len());
    }
}

impl AsyncRead for BodyReader<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let available = ready!(self.as_mut().poll_fill_buf(cx))?;
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        self.consume(n);
        Poll::Ready(Ok(()))
    }
}
