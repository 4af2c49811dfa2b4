use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{error, info};

// --- Infrared remote control (lircd) ---------------------------------------
//
// lircd speaks a line protocol on a Unix socket:
//
//   > SEND_ONCE <remote> <code>
//   < BEGIN
//   < SEND_ONCE <remote> <code>
//   < SUCCESS            (or ERROR, followed by DATA lines)
//   < END

/// Logical keys of the amplifier's and CD transport's infrared remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteKey {
    Power,
    Cd,
    Aux,
    CdPlay,
    CdStop,
    CdPrev,
    CdNext,
    CdRepeat,
    CdRandom,
}

impl RemoteKey {
    /// Name of the infrared code in the lircd remote definition.
    pub fn code(self) -> &'static str {
        match self {
            RemoteKey::Power => "power",
            RemoteKey::Cd => "cd",
            RemoteKey::Aux => "aux",
            RemoteKey::CdPlay => "play",
            RemoteKey::CdStop => "stop",
            RemoteKey::CdPrev => "prev",
            RemoteKey::CdNext => "next",
            RemoteKey::CdRepeat => "repeat",
            RemoteKey::CdRandom => "random",
        }
    }

    /// CD transport keys a client may press directly.
    pub fn transport_key(code: &str) -> Option<RemoteKey> {
        [
            RemoteKey::CdPlay,
            RemoteKey::CdStop,
            RemoteKey::CdPrev,
            RemoteKey::CdNext,
            RemoteKey::CdRepeat,
            RemoteKey::CdRandom,
        ]
        .into_iter()
        .find(|k| k.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    SendOnce,
    SendStart,
    SendStop,
}

impl RemoteCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteCommand::SendOnce => "SEND_ONCE",
            RemoteCommand::SendStart => "SEND_START",
            RemoteCommand::SendStop => "SEND_STOP",
        }
    }
}

#[async_trait]
pub trait RemoteControl: Send + Sync {
    /// Issues `command` for `key`; true when the transmitter acknowledged it.
    async fn execute(&self, command: RemoteCommand, key: RemoteKey) -> bool;

    async fn send_once(&self, key: RemoteKey) -> bool {
        self.execute(RemoteCommand::SendOnce, key).await
    }

    async fn start_repeating(&self, key: RemoteKey) -> bool {
        self.execute(RemoteCommand::SendStart, key).await
    }

    async fn stop_repeating(&self, key: RemoteKey) -> bool {
        self.execute(RemoteCommand::SendStop, key).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Unknown,
    Success,
    Error,
}

/// Client for a local lircd socket.
///
/// The connection is opened on first use and kept; a failed transaction
/// drops it so the next command reconnects. Failed presses are not retried.
pub struct LircRemote {
    socket: PathBuf,
    remote: String,
    timeout: Duration,
    conn: tokio::sync::Mutex<Option<BufReader<UnixStream>>>,
}

impl LircRemote {
    pub fn new(socket: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            remote: remote.into(),
            timeout: Duration::from_secs(2),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    async fn transact(
        &self,
        conn: &mut BufReader<UnixStream>,
        line: &str,
    ) -> anyhow::Result<(bool, String)> {
        conn.get_mut().write_all(format!("{line}\n").as_bytes()).await?;

        let mut response = String::from("lircd: ");
        let mut reply = Reply::Unknown;
        let mut buf = String::new();
        loop {
            buf.clear();
            if conn.read_line(&mut buf).await? == 0 {
                anyhow::bail!("connection closed by lircd ({response})");
            }
            let l = buf.trim_end_matches(['\r', '\n']);
            match l {
                "SUCCESS" => reply = Reply::Success,
                "ERROR" => reply = Reply::Error,
                _ => {}
            }
            response.push_str(l);
            response.push_str("\\n");
            if l == "END" && reply != Reply::Unknown {
                break;
            }
        }
        Ok((reply == Reply::Success, response))
    }
}

#[async_trait]
impl RemoteControl for LircRemote {
    async fn execute(&self, command: RemoteCommand, key: RemoteKey) -> bool {
        let line = format!("{} {} {}", command.as_str(), self.remote, key.code());

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            match UnixStream::connect(&self.socket).await {
                Ok(s) => *guard = Some(BufReader::new(s)),
                Err(e) => {
                    error!("could not connect to {}: {e}", self.socket.display());
                    return false;
                }
            }
        }
        let Some(conn) = guard.as_mut() else {
            return false;
        };

        match tokio::time::timeout(self.timeout, self.transact(conn, &line)).await {
            Ok(Ok((true, response))) => {
                info!("{response}");
                true
            }
            Ok(Ok((false, response))) => {
                error!("{response}");
                false
            }
            Ok(Err(e)) => {
                error!("lircd: {line}: {e}");
                *guard = None;
                false
            }
            Err(_) => {
                error!("lircd: {line}: no reply");
                *guard = None;
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::net::UnixListener;

    /// Records every command. Each command takes `delay` to complete and is
    /// acknowledged unless `refuse` is set.
    #[derive(Default, Clone)]
    pub(crate) struct RecordingRemote {
        pub(crate) sent: Arc<Mutex<Vec<(RemoteCommand, RemoteKey)>>>,
        pub(crate) delay: Duration,
        pub(crate) refuse: Arc<AtomicBool>,
    }

    impl RecordingRemote {
        pub(crate) fn sent(&self) -> Vec<(RemoteCommand, RemoteKey)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteControl for RecordingRemote {
        async fn execute(&self, command: RemoteCommand, key: RemoteKey) -> bool {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.sent.lock().unwrap().push((command, key));
            !self.refuse.load(Ordering::SeqCst)
        }
    }

    async fn fake_lircd(listener: UnixListener, reply: &'static str) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut received = Vec::new();
        let mut line = String::new();
        while stream.read_line(&mut line).await.unwrap() > 0 {
            let cmd = line.trim_end().to_string();
            let answer = format!("BEGIN\n{cmd}\n{reply}\nEND\n");
            stream.get_mut().write_all(answer.as_bytes()).await.unwrap();
            received.push(cmd);
            line.clear();
        }
        received
    }

    #[tokio::test]
    async fn test_send_once_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lircd");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(fake_lircd(listener, "SUCCESS"));

        let remote = LircRemote::new(&path, "goldstard");
        assert!(remote.send_once(RemoteKey::Cd).await);
        assert!(remote.start_repeating(RemoteKey::Power).await);
        assert!(remote.stop_repeating(RemoteKey::Power).await);
        drop(remote);

        let received = server.await.unwrap();
        assert_eq!(
            received,
            vec![
                "SEND_ONCE goldstard cd",
                "SEND_START goldstard power",
                "SEND_STOP goldstard power",
            ]
        );
    }

    #[tokio::test]
    async fn test_error_reply_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lircd");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_lircd(listener, "ERROR\nDATA\n1\nunknown remote"));

        let remote = LircRemote::new(&path, "goldstard");
        assert!(!remote.send_once(RemoteKey::CdPlay).await);
    }

    #[tokio::test]
    async fn test_missing_socket_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let remote = LircRemote::new(dir.path().join("absent"), "goldstard");
        assert!(!remote.send_once(RemoteKey::Power).await);
    }

    #[test]
    fn test_key_codes() {
        let keys = [RemoteKey::Power, RemoteKey::Cd, RemoteKey::Aux, RemoteKey::CdPlay, RemoteKey::CdRandom];
        let codes: Vec<_> = keys.iter().map(|k| k.code()).collect();
        assert_eq!(codes, vec!["power", "cd", "aux", "play", "random"]);
    }

    #[test]
    fn test_transport_key_lookup() {
        assert_eq!(RemoteKey::transport_key("play"), Some(RemoteKey::CdPlay));
        assert_eq!(RemoteKey::transport_key("random"), Some(RemoteKey::CdRandom));
        assert_eq!(RemoteKey::transport_key("power"), None);
    }
}
