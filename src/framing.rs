//! Socket-facing write path shared by both session sides.
//!
//! Exactly one send loop exists per physical connection, and it is the only
//! code that touches the socket's write half. Producers enqueue encoded
//! envelopes on the connection's [`OutboundQueue`]; the loop drains batches
//! and writes each message as one text frame, so no two writes ever overlap.

use futures::{SinkExt, stream::SplitSink};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use tracing::{debug, error};

use crate::{
    metrics::{self, Direction},
    outbound::OutboundQueue,
};

/// Drain `queue` into `sink` until the queue closes, then announce close to
/// the peer.
///
/// Messages are written in enqueue order, one text frame per logical message.
/// A socket write failure stops the loop; the receive loop observes the same
/// broken socket and tears the session down. Because the queue only reports
/// closed once drained, every message accepted before close reaches the
/// socket on a graceful shutdown.
pub(crate) async fn send_loop<S>(mut sink: SplitSink<WebSocketStream<S>, Message>, queue: OutboundQueue)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(batch) = queue.dequeue_batch().await {
        for message in batch.messages() {
            let text = match String::from_utf8(message.to_vec()) {
                Ok(text) => text,
                Err(e) => {
                    // The codec only produces JSON, so this cannot happen for
                    // envelopes it encoded; skip rather than kill the session.
                    error!(error = %e, "skipping non-UTF-8 outbound message");
                    metrics::inc_errors();
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(error = %e, "socket write failed, send loop stopping");
                return;
            }
            metrics::inc_messages(Direction::Outbound);
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
