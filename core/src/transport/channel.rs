use super::{Pull, StreamInfo, Transport, TransportError};
use crate::prelude::{Chunk, StreamError, StreamResult};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

enum Message {
    Chunk(Chunk),
    End,
}

/// Producer side of an in-memory transport.
#[derive(Clone)]
pub struct ChunkSender {
    tx: Sender<Message>,
}

impl ChunkSender {
    pub fn send(&self, chunk: Chunk) -> StreamResult<()> {
        self.tx
            .send(Message::Chunk(chunk))
            .map_err(|_| StreamError::Transport("receiver dropped".into()))
    }

    /// Marks a clean end of stream. Dropping every sender without calling
    /// this is seen by the consumer as a transport failure.
    pub fn finish(self) {
        let _ = self.tx.send(Message::End);
    }
}

/// Consumer side of an in-memory transport with fixed stream metadata.
pub struct ChannelTransport {
    info: StreamInfo,
    rx: Receiver<Message>,
}

pub fn channel_transport(info: StreamInfo) -> (ChunkSender, ChannelTransport) {
    let (tx, rx) = unbounded();
    (ChunkSender { tx }, ChannelTransport { info, rx })
}

impl Transport for ChannelTransport {
    fn open(&mut self, _timeout: Duration) -> Result<StreamInfo, TransportError> {
        Ok(self.info.clone())
    }

    fn pull_chunk(&mut self, timeout: Duration) -> Result<Pull, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Message::Chunk(chunk)) => Ok(Pull::Chunk(chunk)),
            Ok(Message::End) => Ok(Pull::EndOfStream),
            Err(RecvTimeoutError::Timeout) => Ok(Pull::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected(format!(
                "all producers of '{}' went away",
                self.info.name
            ))),
        }
    }
}
