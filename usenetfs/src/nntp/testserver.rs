//! Scripted NNTP server for tests.
//!
//! Replies are looked up by exact command first, then by the longest
//! `PREFIX *` wildcard. `DATE` and `QUIT` have built-in answers and anything
//! unscripted gets `500 Unknown command`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionConfig;

#[derive(Clone)]
enum Reply {
    Response {
        status: u16,
        text: String,
        body: Option<Vec<u8>>,
    },
    Disconnect,
}

struct State {
    greeting: String,
    replies: HashMap<String, Reply>,
    commands: Vec<String>,
}

pub(crate) struct MockServerBuilder {
    greeting: String,
}

impl MockServerBuilder {
    pub fn greeting(mut self, greeting: &str) -> Self {
        self.greeting = greeting.to_string();
        self
    }

    pub async fn start(self) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State {
            greeting: self.greeting,
            replies: HashMap::new(),
            commands: Vec::new(),
        }));
        let accepted = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let task_state = state.clone();
        let task_accepted = accepted.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    _ = task_shutdown.cancelled() => return,
                    res = listener.accept() => match res {
                        Ok((socket, _)) => socket,
                        Err(_) => return,
                    },
                };
                task_accepted.fetch_add(1, Ordering::SeqCst);
                let state = task_state.clone();
                let shutdown = task_shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = serve(socket, state) => {}
                    }
                });
            }
        });

        MockServer {
            addr,
            state,
            accepted,
            shutdown,
        }
    }
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    accepted: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl MockServer {
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder {
            greeting: "200 NNTP Service Ready".to_string(),
        }
    }

    pub async fn start() -> MockServer {
        Self::builder().start().await
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..Default::default()
        }
    }

    pub fn set_greeting(&self, greeting: &str) {
        self.state.lock().greeting = greeting.to_string();
    }

    /// Scripts a reply. Non-empty `lines` (or a multi-line status) are sent
    /// dot-stuffed and terminated.
    pub fn set_response(&self, command: &str, status: u16, text: &str, lines: &[&str]) {
        let multiline = !lines.is_empty() || matches!(status, 101 | 215 | 220 | 221 | 222 | 224);
        let body = multiline.then(|| {
            let mut body = Vec::new();
            for line in lines {
                body.extend_from_slice(line.as_bytes());
                body.extend_from_slice(b"\r\n");
            }
            body
        });
        self.insert(
            command,
            Reply::Response {
                status,
                text: text.to_string(),
                body,
            },
        );
    }

    /// Scripts a multi-line reply from raw bytes, e.g. a yEnc part.
    pub fn set_body(&self, command: &str, status: u16, text: &str, body: &[u8]) {
        self.insert(
            command,
            Reply::Response {
                status,
                text: text.to_string(),
                body: Some(body.to_vec()),
            },
        );
    }

    /// The server hangs up when it receives `command`.
    pub fn set_disconnect(&self, command: &str) {
        self.insert(command, Reply::Disconnect);
    }

    pub fn clear_response(&self, command: &str) {
        self.state.lock().replies.remove(command);
    }

    fn insert(&self, command: &str, reply: Reply) {
        self.state.lock().replies.insert(command.to_string(), reply);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn has_command(&self, command: &str) -> bool {
        self.state.lock().commands.iter().any(|c| c == command)
    }

    pub fn count_command(&self, command: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| *c == command)
            .count()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(socket: TcpStream, state: Arc<Mutex<State>>) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);

    let greeting = state.lock().greeting.clone();
    if write
        .write_all(format!("{greeting}\r\n").as_bytes())
        .await
        .is_err()
    {
        return;
    }
    if !greeting.starts_with("200") && !greeting.starts_with("201") {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end().to_string();
        let reply = {
            let mut state = state.lock();
            state.commands.push(command.clone());
            lookup(&state.replies, &command)
        };

        let out = match reply {
            Some(Reply::Disconnect) => return,
            Some(Reply::Response { status, text, body }) => render(status, &text, body.as_deref()),
            None if command == "DATE" => b"111 20260101000000\r\n".to_vec(),
            None if command == "QUIT" => {
                let _ = write.write_all(b"205 Connection closing\r\n").await;
                return;
            }
            None => b"500 Unknown command\r\n".to_vec(),
        };
        if write.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn lookup(replies: &HashMap<String, Reply>, command: &str) -> Option<Reply> {
    if let Some(reply) = replies.get(command) {
        return Some(reply.clone());
    }
    replies
        .iter()
        .filter_map(|(key, reply)| {
            let prefix = key.strip_suffix('*')?;
            command.starts_with(prefix).then_some((prefix.len(), reply))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, reply)| reply.clone())
}

fn render(status: u16, text: &str, body: Option<&[u8]>) -> Vec<u8> {
    let mut out = format!("{status} {text}\r\n").into_bytes();
    if let Some(body) = body {
        for line in body.split_inclusive(|&b| b == b'\n') {
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
        }
        if !body.is_empty() && !body.ends_with(b"\n") {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
    }
    out
}
