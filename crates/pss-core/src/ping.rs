//! Ping: a minimal protocol for exercising pss end to end
//!
//! Each side can be told to send a ping; every received message is reported
//! on the handle, and a side built with `pong = true` answers each ping with
//! a pong.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::client::{Msg, MsgReadWriter, Protocol};
use crate::error::{PssError, PssResult};
use crate::topic::Topic;

pub const PING_PROTOCOL_NAME: &str = "ping";
pub const PING_PROTOCOL_VERSION: u32 = 1;

/// Message code of [`PingMsg`].
const PING_MSG_CODE: u64 = 0;

/// Topic of the ping protocol.
pub fn ping_topic() -> Topic {
    Topic::from_protocol(PING_PROTOCOL_NAME, PING_PROTOCOL_VERSION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMsg {
    /// Milliseconds since the Unix epoch at send time
    pub created_ms: u64,
    pub pong: bool,
}

impl PingMsg {
    fn now(pong: bool) -> Self {
        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self { created_ms, pong }
    }
}

/// Protocol side of a ping instance. Cheap to clone; all runs of one
/// instance share its channels.
#[derive(Clone)]
pub struct Ping {
    outgoing: Arc<Mutex<mpsc::UnboundedReceiver<bool>>>,
    incoming: mpsc::UnboundedSender<PingMsg>,
    pong: bool,
}

/// Application side of a ping instance.
pub struct PingHandle {
    outgoing: mpsc::UnboundedSender<bool>,
    incoming: mpsc::UnboundedReceiver<PingMsg>,
}

impl Ping {
    pub fn new(pong: bool) -> (Self, PingHandle) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: Arc::new(Mutex::new(out_rx)),
                incoming: in_tx,
                pong,
            },
            PingHandle {
                outgoing: out_tx,
                incoming: in_rx,
            },
        )
    }
}

impl PingHandle {
    /// Ask a running instance to send a ping.
    pub fn ping(&self) -> PssResult<()> {
        self.outgoing.send(false).map_err(|_| PssError::Cancelled)
    }

    /// Next message received by any run of the instance.
    pub async fn recv(&mut self) -> Option<PingMsg> {
        self.incoming.recv().await
    }
}

/// Descriptor running `ping` for every peer.
pub fn ping_protocol(ping: Ping) -> Protocol {
    Protocol::new(PING_PROTOCOL_NAME, PING_PROTOCOL_VERSION, move |ctx, stream| {
        let ping = ping.clone();
        async move { run_ping(ping, &stream, ctx.cancel).await }
    })
}

/// Drive one ping connection over any message transport.
///
/// Returns `Ok(())` on cancellation and the transport error when the
/// connection fails.
pub async fn run_ping<S: MsgReadWriter>(ping: Ping, stream: &S, cancel: CancellationToken) -> PssResult<()> {
    let mut commands_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            command = async { ping.outgoing.lock().await.recv().await }, if commands_open => {
                match command {
                    Some(pong) => stream.write_msg(Msg::new(PING_MSG_CODE, &PingMsg::now(pong))?).await?,
                    None => commands_open = false,
                }
            }
            msg = stream.read_msg() => {
                let msg = msg?;
                if msg.code != PING_MSG_CODE {
                    trace!(code = msg.code, "Ignoring unknown ping message code");
                    continue;
                }
                let ping_msg: PingMsg = msg.decode()?;
                trace!(pong = ping_msg.pong, created_ms = ping_msg.created_ms, "Ping message received");
                let _ = ping.incoming.send(ping_msg);
                if ping.pong && !ping_msg.pong {
                    stream.write_msg(Msg::new(PING_MSG_CODE, &PingMsg::now(true))?).await?;
                }
            }
        }
    }
}
