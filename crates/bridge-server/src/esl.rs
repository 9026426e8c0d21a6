//! FreeSWITCH Event Socket (inbound mode) client implementing
//! [`bridge_core::switch::SwitchControl`] (spec §4.J/§6).
//!
//! ESL frames are a block of `Name: value` headers terminated by a blank
//! line, optionally followed by a `Content-Length`-sized body. `api`
//! commands are answered in the order they were sent with a single
//! `api/response` frame, which lets a plain FIFO queue of waiters pair
//! replies to callers without tagging each command.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_core::switch::{AudioStreamAction, BroadcastLeg, OriginateVars, SwitchControl, SwitchError, SwitchResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex};

type Waiters = Arc<Mutex<VecDeque<oneshot::Sender<String>>>>;

pub struct EslClient {
    writer: Mutex<OwnedWriteHalf>,
    waiters: Waiters,
}

impl EslClient {
    pub async fn connect(addr: &str, password: &str) -> SwitchResult<Arc<Self>> {
        let stream = TcpStream::connect(addr).await.map_err(|e| SwitchError::Transport(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // FreeSWITCH greets an inbound connection with `Content-Type:
        // auth/request` before anything else is sent.
        let _greeting = read_frame(&mut reader).await?;

        let waiters: Waiters = Arc::new(Mutex::new(VecDeque::new()));
        let client = Arc::new(Self { writer: Mutex::new(write_half), waiters: waiters.clone() });

        tokio::spawn(reader_loop(reader, waiters));

        let auth_reply = client.execute_api_raw(&format!("auth {password}")).await?;
        if !auth_reply.contains("+OK") {
            return Err(SwitchError::CommandFailed(format!("authentication rejected: {auth_reply}")));
        }

        Ok(client)
    }

    /// Send a raw command line (not wrapped in `api`/`bgapi`) and await the
    /// single reply frame FreeSWITCH sends back for it.
    async fn execute_api_raw(&self, command_line: &str) -> SwitchResult<String> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push_back(tx);

        let mut writer = self.writer.lock().await;
        writer
            .write_all(format!("{command_line}\n\n").as_bytes())
            .await
            .map_err(|e| SwitchError::Transport(e.to_string()))?;
        drop(writer);

        rx.await.map_err(|_| SwitchError::Transport("esl connection closed while awaiting reply".into()))
    }

    fn expect_ok(reply: &str) -> SwitchResult<()> {
        if reply.trim_start().starts_with("-ERR") {
            return Err(SwitchError::CommandFailed(reply.trim().to_string()));
        }
        Ok(())
    }
}

async fn read_frame<R: AsyncBufReadExt + AsyncRead + Unpin>(reader: &mut R) -> SwitchResult<String> {
    let mut headers = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.map_err(|e| SwitchError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(SwitchError::Transport("esl socket closed".into()));
        }
        if line == "\n" || line == "\r\n" {
            break;
        }
        headers.push_str(&line);
    }

    let content_length = headers
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .and_then(|v| v.trim().parse::<usize>().ok());

    let Some(len) = content_length else {
        return Ok(headers);
    };

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| SwitchError::Transport(e.to_string()))?;
    let body = String::from_utf8_lossy(&body).into_owned();
    Ok(format!("{headers}\n{body}"))
}

async fn reader_loop(mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>, waiters: Waiters) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if frame.contains("Content-Type: api/response") || frame.contains("Content-Type: command/reply") {
                    if let Some(tx) = waiters.lock().await.pop_front() {
                        let body = frame.split("\n\n").last().unwrap_or(&frame).to_string();
                        let _ = tx.send(body);
                    }
                }
                // Event frames (`Content-Type: text/event-plain`) are
                // ignored: this client only drives commands, it doesn't
                // subscribe to channel events.
            }
            Err(e) => {
                tracing::warn!(error = %e, "esl reader loop exiting");
                while let Some(tx) = waiters.lock().await.pop_front() {
                    let _ = tx.send(String::new());
                }
                break;
            }
        }
    }
}

#[async_trait]
impl SwitchControl for EslClient {
    async fn execute_api(&self, command: &str) -> SwitchResult<String> {
        let reply = self.execute_api_raw(&format!("api {command}")).await?;
        Self::expect_ok(&reply)?;
        Ok(reply)
    }

    async fn uuid_exists(&self, uuid: &str) -> SwitchResult<bool> {
        let reply = self.execute_api_raw(&format!("api uuid_exists {uuid}")).await?;
        Ok(reply.trim() == "true")
    }

    async fn uuid_audio_stream(&self, uuid: &str, action: AudioStreamAction, ws_url: &str) -> SwitchResult<()> {
        let verb = match action {
            AudioStreamAction::Start => format!("{uuid} start {ws_url} mono 16k"),
            AudioStreamAction::Pause => format!("{uuid} pause"),
            AudioStreamAction::Resume => format!("{uuid} resume"),
            AudioStreamAction::Stop => format!("{uuid} stop"),
        };
        self.execute_api(&format!("uuid_audio_stream {verb}")).await.map(|_| ())
    }

    async fn uuid_transfer(&self, uuid: &str, destination: &str, context: &str) -> SwitchResult<()> {
        self.execute_api(&format!("uuid_transfer {uuid} {destination} XML {context}")).await.map(|_| ())
    }

    async fn uuid_bridge(&self, a_uuid: &str, b_uuid: &str) -> SwitchResult<()> {
        self.execute_api(&format!("uuid_bridge {a_uuid} {b_uuid}")).await.map(|_| ())
    }

    async fn uuid_kill(&self, uuid: &str) -> SwitchResult<()> {
        self.execute_api(&format!("uuid_kill {uuid}")).await.map(|_| ())
    }

    async fn uuid_setvar(&self, uuid: &str, name: &str, value: &str) -> SwitchResult<()> {
        self.execute_api(&format!("uuid_setvar {uuid} {name} {value}")).await.map(|_| ())
    }

    async fn originate(&self, destination: &str, vars: &OriginateVars) -> SwitchResult<String> {
        let mut channel_vars = vec![
            format!("origination_caller_id_number={}", vars.caller_id_number),
            format!("origination_caller_id_name={}", vars.caller_id_name),
            format!("originate_timeout={}", vars.timeout_secs),
            format!("hangup_after_bridge={}", vars.hangup_after_bridge),
        ];
        for (k, v) in &vars.extra {
            channel_vars.push(format!("{k}={v}"));
        }
        let leg = format!("{{{}}}{}", channel_vars.join(","), destination);
        let reply = self.execute_api(&format!("originate {leg} &park()")).await?;
        reply
            .lines()
            .find(|l| l.len() == 36 || l.starts_with("+OK "))
            .map(|l| l.trim_start_matches("+OK ").trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SwitchError::CommandFailed(format!("originate returned no uuid: {reply}")))
    }

    async fn uuid_displace(&self, uuid: &str, file_or_tts: &str) -> SwitchResult<()> {
        self.execute_api(&format!("uuid_displace {uuid} start {file_or_tts} 0 mux")).await.map(|_| ())
    }

    async fn uuid_broadcast(&self, uuid: &str, app: &str, leg: BroadcastLeg) -> SwitchResult<()> {
        let leg_flag = match leg {
            BroadcastLeg::ALeg => "aleg",
            BroadcastLeg::BLeg => "bleg",
            BroadcastLeg::Both => "both",
        };
        self.execute_api(&format!("uuid_broadcast {uuid} {app} {leg_flag}")).await.map(|_| ())
    }
}
