//! Protocol descriptors and the duplex message interface

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::stream::VirtualStream;
use crate::error::{PssError, PssResult};
use crate::identity::{PeerAddress, PublicKey};
use crate::topic::Topic;

/// Unit of exchange between two protocol instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    /// Protocol-defined message code
    pub code: u64,
    /// postcard-encoded body
    pub payload: Vec<u8>,
}

impl Msg {
    /// Build a message from a serializable body.
    pub fn new<T: Serialize>(code: u64, body: &T) -> PssResult<Self> {
        Ok(Self {
            code,
            payload: postcard::to_allocvec(body)?,
        })
    }

    /// Decode the body.
    pub fn decode<T: DeserializeOwned>(&self) -> PssResult<T> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    pub fn to_bytes(&self) -> PssResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> PssResult<Self> {
        Ok(postcard::from_bytes(data)?)
    }
}

/// Duplex message transport a protocol runs against.
///
/// Implemented by [`VirtualStream`] (over pss) and [`PipeEnd`] (direct,
/// in-process), so the same protocol code runs over either.
pub trait MsgReadWriter: Send + Sync {
    /// Wait for the next message.
    fn read_msg(&self) -> impl Future<Output = PssResult<Msg>> + Send;

    /// Send one message.
    fn write_msg(&self, msg: Msg) -> impl Future<Output = PssResult<()>> + Send;
}

/// One end of an in-process message pipe.
pub struct PipeEnd {
    tx: mpsc::UnboundedSender<Msg>,
    rx: Mutex<mpsc::UnboundedReceiver<Msg>>,
}

/// Two connected pipe ends.
pub fn pipe() -> (PipeEnd, PipeEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        PipeEnd {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        PipeEnd {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}

fn broken_pipe() -> PssError {
    PssError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "pipe closed",
    ))
}

impl MsgReadWriter for PipeEnd {
    async fn read_msg(&self) -> PssResult<Msg> {
        self.rx.lock().await.recv().await.ok_or_else(broken_pipe)
    }

    async fn write_msg(&self, msg: Msg) -> PssResult<()> {
        self.tx.send(msg).map_err(|_| broken_pipe())
    }
}

/// What a protocol run knows about its remote side.
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub peer: PublicKey,
    pub address: PeerAddress,
    pub topic: Topic,
    /// Fires when the protocol stops or the client shuts down
    pub cancel: CancellationToken,
}

type RunFn = Arc<dyn Fn(PeerContext, VirtualStream) -> BoxFuture<'static, PssResult<()>> + Send + Sync>;

/// A higher-level protocol: a name, a version and the function driving one
/// peer connection.
#[derive(Clone)]
pub struct Protocol {
    pub name: String,
    pub version: u32,
    run: RunFn,
}

impl Protocol {
    pub fn new<F, Fut>(name: impl Into<String>, version: u32, run: F) -> Self
    where
        F: Fn(PeerContext, VirtualStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PssResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            version,
            run: Arc::new(move |ctx, stream| Box::pin(run(ctx, stream))),
        }
    }

    /// Topic the protocol's messages travel on.
    pub fn topic(&self) -> Topic {
        Topic::from_protocol(&self.name, self.version)
    }

    pub(crate) fn run(&self, ctx: PeerContext, stream: VirtualStream) -> BoxFuture<'static, PssResult<()>> {
        (self.run)(ctx, stream)
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
