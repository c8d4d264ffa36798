//! Terminal I/O layer.
//!
//! * [`telnet`]: strips negotiation from input, escapes IAC on output.
//! * [`input`]: byte-level line editor producing [`InputEvent`]s.
//! * [`output`]: chunk-safe `\xNN` / newline translation.
//!
//! [`Outbound`] ties the output side together for one connection: text is
//! translated, IAC-escaped and queued as [`Frame`]s for the socket writer.

pub mod input;
pub mod output;
pub mod telnet;

use anyhow::Context as _;
use tokio::sync::mpsc;

pub use input::{Edit, InputEvent, LineEditor};
pub use output::OutputTranslator;
pub use telnet::TelnetFilter;

/// A unit of work for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Bytes(Vec<u8>),
    /// Flush and shut the connection down.
    Close,
}

/// Output half of a connection.
#[derive(Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Frame>,
    translator: OutputTranslator,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            tx,
            translator: OutputTranslator::new(),
        }
    }

    /// Queue model or bridge text, translating escapes and newlines.
    pub async fn text(&mut self, text: &str) -> anyhow::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let bytes = self.translator.push(text);
        self.bytes(bytes).await
    }

    /// Release any partially held escape token.
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        let bytes = self.translator.flush();
        self.bytes(bytes).await
    }

    /// Queue bytes that bypass translation (echo, negotiation).
    pub async fn raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Frame::Bytes(bytes.to_vec()))
            .await
            .context("connection writer closed")
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.flush().await?;
        self.tx
            .send(Frame::Close)
            .await
            .context("connection writer closed")
    }

    async fn bytes(&mut self, bytes: Vec<u8>) -> anyhow::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Frame::Bytes(telnet::escape_iac(&bytes)))
            .await
            .context("connection writer closed")
    }
}
