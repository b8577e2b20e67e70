/// Various helpers to deal with closing connections and cancellation
use super::{receive_peer_message, send_peer_message, PeerMessage, TransferError, CANCEL_MESSAGE};
use crate::{util, Mailbox};
use futures::Future;
use log::*;

/// A select tailored to our cancellation handling.
///
/// At its core, it is an `Abortable` but instead of having an `AbortHandle`,
/// we use a future that resolves as trigger.
pub async fn cancellable<T>(
    future: impl Future<Output = T> + Unpin,
    cancel: impl Future<Output = ()>,
) -> Result<T, Cancelled> {
    use futures::future::Either;
    futures::pin_mut!(cancel);
    match futures::future::select(cancel, future).await {
        Either::Left(((), _)) => Err(Cancelled),
        Either::Right((val, _)) => Ok(val),
    }
}

/// Indicator that the running transfer was cancelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task has been cancelled")
    }
}

/// Maximum duration that we are willing to wait for cleanup tasks to finish
const SHUTDOWN_TIME: std::time::Duration = std::time::Duration::from_secs(5);

/** Handle the post-{transfer, failure, cancellation} logic */
pub(super) async fn handle_run_result<M: Mailbox, T>(
    mailbox: &mut M,
    result: Result<Result<T, TransferError>, Cancelled>,
) -> Result<T, TransferError> {
    match result {
        /* Happy case: everything went okay */
        Ok(Ok(value)) => Ok(value),
        /* The peer already knows, no need to tell it anything */
        Ok(Err(error @ TransferError::PeerError(_))) => Err(error),
        Ok(Err(error @ (TransferError::Rejected | TransferError::Cancelled))) => Err(error),
        /* Got transit error: try to receive peer error for better error message */
        Ok(Err(mut error @ (TransferError::Transit(_) | TransferError::TransitConnect(_)))) => {
            debug!(
                "Transfer encountered an error ({}), doing cleanup logic",
                error
            );
            match util::timeout(SHUTDOWN_TIME / 3, receive_peer_message(mailbox)).await {
                Ok(Ok(PeerMessage::Error(peer_error))) => {
                    error = if peer_error == CANCEL_MESSAGE {
                        TransferError::Cancelled
                    } else {
                        TransferError::PeerError(peer_error)
                    };
                },
                _ => {
                    debug!("Failed to retrieve more specific error message from peer. Maybe it crashed?");
                    notify_peer(mailbox, format!("{}", error)).await;
                },
            }
            Err(error)
        },
        /* Other error: try to notify peer */
        Ok(Err(error)) => {
            debug!(
                "Transfer encountered an error ({}), doing cleanup logic",
                error
            );
            notify_peer(mailbox, format!("{}", error)).await;
            Err(error)
        },
        /* Cancelled: tell the peer */
        Err(_cancelled) => {
            debug!("Transfer got cancelled, doing cleanup logic");
            notify_peer(mailbox, CANCEL_MESSAGE.into()).await;
            Err(TransferError::Cancelled)
        },
    }
}

/// Ignore errors, but at least debug print them
async fn notify_peer<M: Mailbox>(mailbox: &mut M, message: String) {
    match util::timeout(
        SHUTDOWN_TIME,
        send_peer_message(mailbox, &PeerMessage::error_message(message)),
    )
    .await
    {
        Ok(Ok(())) => {},
        Ok(Err(error)) => debug!("Failed to notify peer after transfer: {}", error),
        Err(_timeout) => debug!("Post-transfer notification timed out"),
    }
}
