//! Framed connection handling over the byte interface.
//!
//! One task per connection reads frames and dispatches them against the
//! service; a paired writer task serializes replies, so a long-running
//! verification never blocks the read loop. A relying party's
//! certificate (or failure) arrives on the same connection that carried
//! its verification request.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use trip_core::breadcrumb::IdentityKey;

use crate::protocol::{ErrorCode, Frame, FrameCodec};
use crate::service::{ServiceError, VerifierService};

fn error_frame(err: &ServiceError) -> Frame {
    Frame::Error {
        code: err.code(),
        detail: err.to_string(),
    }
}

fn encoded(frame: &Frame) -> Option<Bytes> {
    match frame.encode() {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(err) => {
            warn!(%err, "failed to encode reply frame");
            None
        },
    }
}

/// Serves one framed connection until EOF or a transport error.
pub async fn handle_connection<S>(service: Arc<VerifierService>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(stream, FrameCodec::new());
    let (mut sink, mut frames) = framed.split();

    // Replies flow through a channel so spawned completions can write
    // without owning the sink.
    let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(32);
    let writer = tokio::spawn(async move {
        while let Some(bytes) = reply_rx.recv().await {
            if sink.send(bytes).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(peer, %err, "frame error; closing connection");
                break;
            },
        };
        dispatch(&service, &bytes, &peer, &reply_tx).await;
    }

    drop(reply_tx);
    let _ = writer.await;
    debug!(peer, "connection closed");
}

async fn dispatch(
    service: &Arc<VerifierService>,
    bytes: &[u8],
    peer: &str,
    reply_tx: &mpsc::Sender<Bytes>,
) {
    let reply = match Frame::decode(bytes) {
        Err(err) => Frame::Error {
            code: ErrorCode::MalformedEncoding,
            detail: err.to_string(),
        },
        Ok(Frame::SubmitBreadcrumbs(batch)) => {
            match service.submit_breadcrumbs(&batch).await {
                Ok(appended) => Frame::Ack { appended },
                Err(err) => error_frame(&err),
            }
        },
        Ok(Frame::Verify(request)) => {
            match service
                .begin_verification(&request, peer.as_bytes())
                .await
            {
                Ok(challenge) => {
                    spawn_completion(service, request.identity, request.nonce, reply_tx);
                    Frame::Challenge(challenge)
                },
                Err(err) => error_frame(&err),
            }
        },
        Ok(Frame::Respond(response)) => match service.submit_response(response).await {
            Ok(()) => Frame::Ack { appended: 0 },
            Err(err) => error_frame(&err),
        },
        Ok(Frame::Cancel { identity }) => {
            service.cancel(identity);
            Frame::Ack { appended: 0 }
        },
        Ok(Frame::SubmitEpoch(epoch)) => match service.submit_epoch(&epoch).await {
            Ok(number) => Frame::Ack { appended: number },
            Err(err) => error_frame(&err),
        },
        // Response-direction frames are never valid requests.
        Ok(Frame::Ack { .. } | Frame::Challenge(_) | Frame::Certificate(_) | Frame::Error { .. }) => {
            Frame::Error {
                code: ErrorCode::InvalidRequest,
                detail: "response frame sent as request".into(),
            }
        },
    };

    if let Some(bytes) = encoded(&reply) {
        let _ = reply_tx.send(bytes).await;
    }
}

/// Drives an open challenge to completion and delivers the certificate
/// (or failure) back on the requesting connection.
fn spawn_completion(
    service: &Arc<VerifierService>,
    identity: IdentityKey,
    nonce: [u8; 16],
    reply_tx: &mpsc::Sender<Bytes>,
) {
    let service = Arc::clone(service);
    let reply_tx = reply_tx.clone();
    tokio::spawn(async move {
        let frame = match service
            .complete_verification(identity, nonce, VerifierService::now_unix())
            .await
        {
            Ok(cert) => Frame::Certificate(cert),
            Err(err) => error_frame(&err),
        };
        if let Some(bytes) = encoded(&frame) {
            let _ = reply_tx.send(bytes).await;
        }
    });
}
