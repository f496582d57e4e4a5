//! Driver tasks behind a rudder.
//!
//! Each task owns one half of an endpoint and executes the operations queued
//! by its rudder one at a time, posting the outcome as a letter. Tasks never
//! touch agent state.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::{Letter, LetterSender, ReadOp, WriteOp};
use crate::types::RudderId;

pub(super) async fn read_loop<R>(
    id: RudderId,
    mut reader: R,
    mut ops: mpsc::UnboundedReceiver<ReadOp>,
    letters: LetterSender,
) where
    R: AsyncRead + Unpin,
{
    while let Some(op) = ops.recv().await {
        let ReadOp::Read(capacity) = op else {
            tracing::warn!(rudder = %id, "accept requested on a stream rudder");
            continue;
        };
        let mut buf = BytesMut::with_capacity(capacity);
        let result = reader.read_buf(&mut buf).await.map(|_| buf.freeze());
        let failed = result.is_err();
        if letters.send(Letter::Read { rudder: id, result }).is_err() || failed {
            break;
        }
    }
}

pub(super) async fn write_loop<W>(
    id: RudderId,
    mut writer: W,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    letters: LetterSender,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Write(buf) => {
                let len = buf.len();
                let result = match writer.write_all(&buf).await {
                    Ok(()) => writer.flush().await.map(|_| len),
                    Err(e) => Err(e),
                };
                if letters.send(Letter::Wrote { rudder: id, result }).is_err() {
                    return;
                }
            }
            WriteOp::Close => {
                if let Err(e) = writer.shutdown().await {
                    tracing::trace!(rudder = %id, "shutdown failed: {}", e);
                }
                break;
            }
        }
    }
    let _ = letters.send(Letter::Closed { rudder: id });
}

pub(super) async fn accept_loop(
    id: RudderId,
    listener: TcpListener,
    mut ops: mpsc::UnboundedReceiver<ReadOp>,
    letters: LetterSender,
) {
    while let Some(op) = ops.recv().await {
        if !matches!(op, ReadOp::Accept) {
            continue;
        }
        let result = listener.accept().await;
        if letters.send(Letter::Accepted { rudder: id, result }).is_err() {
            break;
        }
    }
}

pub(super) async fn connect(id: RudderId, addr: String, letters: LetterSender) {
    let result = TcpStream::connect(addr.as_str()).await;
    let _ = letters.send(Letter::Connected { rudder: id, result });
}
