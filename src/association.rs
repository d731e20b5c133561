//! Primary association lifecycle and the event multiplexer.
//!
//! The batch run talks to the PACS over a single client association that
//! offers one Study Root FIND context and one Study Root MOVE context.
//! During retrieval the same task additionally watches the storage
//! listener and, once accepted, the sub-association the PACS opens
//! towards us; `select_ready` arbitrates between those sources.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use dicom_dictionary_std::uids;
use dicom_ul::{ClientAssociation, ClientAssociationOptions, Pdu};
use snafu::{OptionExt, ResultExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::debug;

use crate::dimse::{
    AcceptSnafu, ListenSnafu, MessageReader, NegotiationSnafu, NoPresentationContextSnafu,
    ReceivePduSnafu, Result,
};
use crate::storescp::SubAssociation;

/// Uncompressed transfer syntaxes, most expressive first.
pub const TRANSFER_SYNTAX_PREFERENCE: [&str; 3] = [
    "1.2.840.10008.1.2.1", // Explicit VR Little Endian
    "1.2.840.10008.1.2.2", // Explicit VR Big Endian
    "1.2.840.10008.1.2",   // Implicit VR Little Endian
];

#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// PACS socket address, `host:port`.
    pub addr: String,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub max_pdu_length: u32,
}

/// The primary (query/retrieve) association with its message reader and
/// message ID counter.
pub struct Primary {
    pub assoc: ClientAssociation<TcpStream>,
    pub reader: MessageReader,
    next_msg_id: u16,
}

impl Primary {
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Accepted presentation context for the given abstract syntax.
    pub fn context_for(&self, abstract_syntax: &str) -> Result<(u8, String)> {
        self.assoc
            .presentation_contexts()
            .iter()
            .find(|pc| pc.abstract_syntax.trim_end_matches('\0') == abstract_syntax)
            .map(|pc| {
                (
                    pc.id,
                    pc.transfer_syntax.trim_end_matches('\0').to_string(),
                )
            })
            .context(NoPresentationContextSnafu { abstract_syntax })
    }
}

/// Open the primary association, offering the Study Root FIND and MOVE
/// information models.
pub async fn connect(config: &ConnectConfig) -> Result<Primary> {
    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(config.calling_ae_title.clone())
        .called_ae_title(config.called_ae_title.clone())
        .max_pdu_length(config.max_pdu_length);

    for abstract_syntax in [
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
    ] {
        options =
            options.with_presentation_context(abstract_syntax, TRANSFER_SYNTAX_PREFERENCE.to_vec());
    }

    let assoc = options
        .establish_with_async(&config.addr)
        .await
        .map_err(Box::from)
        .context(NegotiationSnafu)?;

    if assoc.presentation_contexts().is_empty() {
        return NoPresentationContextSnafu {
            abstract_syntax: "Study Root Query/Retrieve",
        }
        .fail();
    }
    debug!(
        "association established, {} presentation context(s) accepted",
        assoc.presentation_contexts().len()
    );

    Ok(Primary {
        assoc,
        reader: MessageReader::new(),
        next_msg_id: 1,
    })
}

/// How the batch run left the primary association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The run finished; tear the association down.
    Normal,
    /// The peer asked for release; acknowledge it.
    PeerRequestedRelease,
    /// The peer already aborted; nothing left to say.
    PeerAborted,
}

pub async fn close(primary: Primary, outcome: CloseOutcome) {
    let mut assoc = primary.assoc;
    match outcome {
        CloseOutcome::PeerRequestedRelease => {
            let _ = assoc.send(&Pdu::ReleaseRP).await;
        }
        CloseOutcome::PeerAborted => {}
        CloseOutcome::Normal => {
            let _ = assoc.abort().await;
        }
    }
}

/// Bind the storage listener for incoming sub-associations.
pub async fn bind_listener(port: u16) -> Result<TcpListener> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    TcpListener::bind(addr).await.context(ListenSnafu { port })
}

/// An event source that became ready.
pub enum Ready {
    /// Nothing happened within the poll timeout.
    Timeout,
    /// A PDU arrived on the primary association.
    Primary(Pdu),
    /// A PDU arrived on the current sub-association.
    Sub(Pdu),
    /// A new connection appeared on the storage listener.
    Inbound(TcpStream),
}

/// Poll interval while waiting for the sub-association to appear.
pub const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Effectively unbounded wait, used in blocking mode.
const BLOCKING_WAIT: Duration = Duration::from_secs(10_000);

/// Poll timeout policy for the move receive loop: poll briskly while no
/// sub-association exists so new inbound connections are noticed, wait
/// quietly otherwise.
pub fn poll_timeout(has_sub: bool, dimse_timeout: Option<Duration>) -> Duration {
    match (has_sub, dimse_timeout) {
        (false, _) => ACCEPT_POLL,
        (true, None) => BLOCKING_WAIT,
        (true, Some(timeout)) => timeout,
    }
}

/// Wait for the next ready event source.
///
/// The listener is only consulted while no sub-association exists, and is
/// checked without blocking before anything else. When the primary and the
/// sub-association are both ready, the primary wins.
pub async fn select_ready(
    primary: &mut Primary,
    listener: Option<&TcpListener>,
    sub: &mut Option<SubAssociation>,
    timeout: Duration,
) -> Result<Ready> {
    match sub.as_mut() {
        None => {
            if let Some(listener) = listener {
                let pending = tokio::select! {
                    biased;
                    accepted = listener.accept() => Some(accepted),
                    _ = std::future::ready(()) => None,
                };
                if let Some(accepted) = pending {
                    let (stream, peer) = accepted.context(AcceptSnafu)?;
                    debug!("inbound connection from {}", peer);
                    return Ok(Ready::Inbound(stream));
                }
            }
            tokio::select! {
                biased;
                pdu = primary.assoc.receive() => {
                    Ok(Ready::Primary(pdu.map_err(Box::from).context(ReceivePduSnafu)?))
                }
                _ = sleep(timeout) => Ok(Ready::Timeout),
            }
        }
        Some(sub) => {
            tokio::select! {
                biased;
                pdu = primary.assoc.receive() => {
                    Ok(Ready::Primary(pdu.map_err(Box::from).context(ReceivePduSnafu)?))
                }
                pdu = sub.assoc.receive() => {
                    Ok(Ready::Sub(pdu.map_err(Box::from).context(ReceivePduSnafu)?))
                }
                _ = sleep(timeout) => Ok(Ready::Timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_timeout_policy() {
        // without a sub-association, poll fast regardless of mode
        assert_eq!(poll_timeout(false, None), ACCEPT_POLL);
        assert_eq!(poll_timeout(false, Some(Duration::from_secs(30))), ACCEPT_POLL);
        // blocking mode waits as long as it takes
        assert!(poll_timeout(true, None) >= Duration::from_secs(3600));
        // non-blocking mode honors the caller's timeout
        assert_eq!(
            poll_timeout(true, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
    }
}
