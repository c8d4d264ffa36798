//! One operator connection: socket reader and writer tasks around the
//! session control flow.
//!
//! ```text
//! socket ─▶ reader task (telnet filter, line editor) ─▶ InputEvent channel
//!                     │ echo                                  │
//!                     ▼                                       ▼
//! socket ◀─ writer task ◀──────── Frame channel ◀──── session (drive)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument as _};

use super::Shared;
use crate::session::{LineAction, Session, TurnEnd};
use crate::terminal::telnet::NEGOTIATION;
use crate::terminal::{Frame, InputEvent, LineEditor, Outbound, TelnetFilter};

const FRAME_QUEUE: usize = 64;
const INPUT_QUEUE: usize = 32;

/// Serve one connection until the operator leaves, the socket closes, or
/// the server shuts down.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let session = Session::new(shared.settings.clone());
    let span = tracing::info_span!("session", id = %session.id, %peer);
    serve(stream, session, shared, cancel).instrument(span).await
}

async fn serve(stream: TcpStream, mut session: Session, shared: Arc<Shared>, cancel: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
    let (input_tx, mut input_rx) = mpsc::channel(INPUT_QUEUE);

    let writer = tokio::spawn(write_frames(write_half, frame_rx).in_current_span());
    let reader = tokio::spawn(read_input(read_half, frame_tx.clone(), input_tx).in_current_span());

    let mut out = Outbound::new(frame_tx);
    let result = async {
        if shared.negotiate {
            out.raw(&NEGOTIATION).await?;
        }
        drive(&mut session, &shared, &mut out, &mut input_rx, &cancel).await
    }
    .await;

    match result {
        Ok(()) => info!(turns = session.history().len(), "session closed"),
        Err(e) => debug!(error = %format!("{e:#}"), "session ended by transport"),
    }

    reader.abort();
    drop(out);
    let _ = writer.await;
}

/// The session control flow: greeting, then one operator line at a time.
async fn drive(
    session: &mut Session,
    shared: &Shared,
    out: &mut Outbound,
    input: &mut mpsc::Receiver<InputEvent>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if let Some(request) = session.greeting() {
        match session
            .run_turn(shared.provider.as_ref(), request, out, input, cancel)
            .await?
        {
            TurnEnd::Completed => {}
            TurnEnd::Leave => return leave(session, out).await,
            TurnEnd::Disconnected => return Ok(()),
        }
    } else {
        out.text(&session.prompt()).await?;
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = input.recv() => event,
        };
        match event {
            None => return Ok(()),
            Some(InputEvent::Eof) => return leave(session, out).await,
            Some(InputEvent::Interrupt) => out.text(&session.prompt()).await?,
            Some(InputEvent::Line(line)) => match session.submit(&line) {
                LineAction::Ignored => {}
                LineAction::Local(text) => out.text(&text).await?,
                LineAction::Leave => return leave(session, out).await,
                LineAction::Dispatch(request) => {
                    debug!(line = %line, "dispatching turn");
                    match session
                        .run_turn(shared.provider.as_ref(), request, out, input, cancel)
                        .await?
                    {
                        TurnEnd::Completed => {}
                        TurnEnd::Leave => return leave(session, out).await,
                        TurnEnd::Disconnected => return Ok(()),
                    }
                }
            },
        }
        out.flush().await?;
    }
}

async fn leave(session: &Session, out: &mut Outbound) -> anyhow::Result<()> {
    out.text(&session.farewell()).await?;
    out.close().await
}

async fn write_frames(mut socket: OwnedWriteHalf, mut frames: mpsc::Receiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        match frame {
            Frame::Bytes(bytes) => {
                if let Err(e) = socket.write_all(&bytes).await {
                    debug!(error = %e, "socket write failed");
                    return;
                }
            }
            Frame::Close => break,
        }
    }
    let _ = socket.shutdown().await;
}

async fn read_input(
    mut socket: OwnedReadHalf,
    echo: mpsc::Sender<Frame>,
    events: mpsc::Sender<InputEvent>,
) {
    let mut telnet = TelnetFilter::new();
    let mut editor = LineEditor::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "socket read failed");
                return;
            }
        };
        let data = telnet.feed(&buf[..n]);
        let edit = editor.feed(&data);
        if !edit.echo.is_empty() && echo.send(Frame::Bytes(edit.echo)).await.is_err() {
            return;
        }
        for event in edit.events {
            let eof = event == InputEvent::Eof;
            if events.send(event).await.is_err() || eof {
                return;
            }
        }
    }
}
