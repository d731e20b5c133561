//! Shared DIMSE plumbing: command objects, status words and
//! PDU-level message assembly on top of an established association.
//!
//! Commands always travel in Implicit VR Little Endian; identifier and
//! instance datasets use the transfer syntax negotiated for their
//! presentation context.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{
    association::ServerAssociation,
    pdu::{PDataValue, PDataValueType},
    ClientAssociation, Pdu,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::net::TcpStream;

pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_FIND_RQ: u16 = 0x0020;
pub const C_FIND_RSP: u16 = 0x8020;
pub const C_MOVE_RQ: u16 = 0x0021;
pub const C_MOVE_RSP: u16 = 0x8021;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;
pub const C_CANCEL_RQ: u16 = 0x0FFF;

pub const STATUS_SUCCESS: u16 = 0x0000;
pub const STATUS_PENDING: u16 = 0xFF00;
pub const STATUS_PENDING_WARNING: u16 = 0xFF01;
pub const STATUS_CANCELLED: u16 = 0xFE00;
/// C-MOVE completed with failed sub-operations.
pub const STATUS_SUBOPS_FAILED: u16 = 0xB000;
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;
pub const STATUS_SOP_CLASS_MISMATCH: u16 = 0xA900;
pub const STATUS_CANNOT_UNDERSTAND: u16 = 0xC000;

const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0001;
const PRIORITY_MEDIUM: u16 = 0x0000;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Could not send PDU to peer
    SendPdu {
        source: Box<dicom_ul::association::Error>,
    },

    /// Could not receive PDU from peer
    ReceivePdu {
        source: Box<dicom_ul::association::Error>,
    },

    /// Could not construct DICOM command
    CreateCommand {
        source: Box<dicom_object::WriteError>,
    },

    /// Error writing dataset to buffer
    WriteDataset {
        source: Box<dicom_object::WriteError>,
    },

    /// Error reading incoming dataset
    ReadDataset {
        source: dicom_object::ReadError,
    },

    /// Missing attribute {tag}
    MissingAttribute {
        tag: Tag,
        source: dicom_object::AccessError,
    },

    /// Could not convert attribute {tag}
    ConvertField {
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
    },

    /// Unsupported transfer syntax {uid}
    UnsupportedTransferSyntax {
        uid: String,
    },

    /// No presentation context accepted for {abstract_syntax}
    NoPresentationContext {
        abstract_syntax: String,
    },

    /// Association rejected or not negotiable
    Negotiation {
        source: Box<dicom_ul::association::Error>,
    },

    /// Unexpected command field {field:#06X}
    UnexpectedCommandField {
        field: u16,
    },

    /// Response without a status word
    MissingStatus,

    /// Not a known tag name or hex pair: {input}
    InvalidTag {
        input: String,
    },

    /// Response refers to message {got}, expected {expected}
    MessageIdMismatch {
        got: u16,
        expected: u16,
    },

    /// Unexpected {pdu} PDU from peer
    UnexpectedPdu {
        pdu: String,
    },

    /// Received a data fragment while expecting a command
    UnexpectedDataFragment,

    /// Received a command fragment while expecting a dataset
    UnexpectedCommandFragment,

    #[snafu(display("Could not create {}", path.display()))]
    CreateDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Could not bind listener on port {port}
    Listen {
        port: u16,
        source: std::io::Error,
    },

    /// Could not accept incoming connection
    Accept {
        source: std::io::Error,
    },

    /// Peer requested association release mid-exchange
    PeerRequestedRelease,

    /// Peer aborted the association
    PeerAborted,

    /// No response from peer within the DIMSE timeout
    Timeout,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The fields of a received DIMSE command relevant to this client.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    pub field: u16,
    pub message_id: Option<u16>,
    pub responded_to: Option<u16>,
    pub status: Option<u16>,
    pub has_dataset: bool,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
}

impl CommandSet {
    pub fn read(obj: &InMemDicomObject<StandardDataDictionary>) -> Result<Self> {
        let field = obj
            .element(tags::COMMAND_FIELD)
            .context(MissingAttributeSnafu {
                tag: tags::COMMAND_FIELD,
            })?
            .to_int::<u16>()
            .context(ConvertFieldSnafu {
                tag: tags::COMMAND_FIELD,
            })?;
        let data_set_type = read_u16(obj, tags::COMMAND_DATA_SET_TYPE).unwrap_or(NO_DATA_SET);
        Ok(CommandSet {
            field,
            message_id: read_u16(obj, tags::MESSAGE_ID),
            responded_to: read_u16(obj, tags::MESSAGE_ID_BEING_RESPONDED_TO),
            status: read_u16(obj, tags::STATUS),
            has_dataset: data_set_type != NO_DATA_SET,
            affected_sop_class_uid: read_str(obj, tags::AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: read_str(obj, tags::AFFECTED_SOP_INSTANCE_UID),
        })
    }

    /// The status word, mandatory in responses.
    pub fn status(&self) -> Result<u16> {
        self.status.context(MissingStatusSnafu)
    }
}

fn read_u16(obj: &InMemDicomObject<StandardDataDictionary>, tag: Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

fn read_str(obj: &InMemDicomObject<StandardDataDictionary>, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
}

pub fn is_pending(status: u16) -> bool {
    matches!(status, STATUS_PENDING | STATUS_PENDING_WARNING)
}

pub fn find_rq_command(
    message_id: u16,
    sop_class_uid: &str,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_FIND_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
    ])
}

pub fn move_rq_command(
    message_id: u16,
    sop_class_uid: &str,
    destination: &str,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_MOVE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, destination)),
    ])
}

pub fn cancel_rq_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_CANCEL_RQ])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
    ])
}

pub fn echo_rsp_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [STATUS_SUCCESS])),
    ])
}

pub fn store_rsp_command(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

pub fn encode_command(cmd: &InMemDicomObject<StandardDataDictionary>) -> Result<Vec<u8>> {
    // commands are always in implicit VR LE
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(&mut data, &ts)
        .map_err(Box::from)
        .context(CreateCommandSnafu)?;
    Ok(data)
}

pub fn decode_command(bytes: &[u8]) -> Result<InMemDicomObject<StandardDataDictionary>> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    InMemDicomObject::read_dataset_with_ts(bytes, &ts).context(ReadDatasetSnafu)
}

pub fn encode_dataset(
    obj: &InMemDicomObject<StandardDataDictionary>,
    ts_uid: &str,
) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .context(UnsupportedTransferSyntaxSnafu { uid: ts_uid })?;
    let mut data = Vec::with_capacity(2048);
    obj.write_dataset_with_ts(&mut data, ts)
        .map_err(Box::from)
        .context(WriteDatasetSnafu)?;
    Ok(data)
}

pub fn decode_dataset(
    bytes: &[u8],
    ts_uid: &str,
) -> Result<InMemDicomObject<StandardDataDictionary>> {
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .context(UnsupportedTransferSyntaxSnafu { uid: ts_uid })?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts).context(ReadDatasetSnafu)
}

/// Uniform PDU access over client and server association handles.
#[async_trait]
pub trait PduChannel: Send {
    async fn send_pdu(&mut self, pdu: Pdu) -> Result<()>;
    async fn receive_pdu(&mut self) -> Result<Pdu>;
    /// Transfer syntax negotiated for the given presentation context.
    fn transfer_syntax_for(&self, pc_id: u8) -> Option<String>;
}

#[async_trait]
impl PduChannel for ClientAssociation<TcpStream> {
    async fn send_pdu(&mut self, pdu: Pdu) -> Result<()> {
        self.send(&pdu).await.map_err(Box::from).context(SendPduSnafu)
    }

    async fn receive_pdu(&mut self) -> Result<Pdu> {
        self.receive().await.map_err(Box::from).context(ReceivePduSnafu)
    }

    fn transfer_syntax_for(&self, pc_id: u8) -> Option<String> {
        self.presentation_contexts()
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| pc.transfer_syntax.trim_end_matches('\0').to_string())
    }
}

#[async_trait]
impl PduChannel for ServerAssociation<TcpStream> {
    async fn send_pdu(&mut self, pdu: Pdu) -> Result<()> {
        self.send(&pdu).await.map_err(Box::from).context(SendPduSnafu)
    }

    async fn receive_pdu(&mut self) -> Result<Pdu> {
        self.receive().await.map_err(Box::from).context(ReceivePduSnafu)
    }

    fn transfer_syntax_for(&self, pc_id: u8) -> Option<String> {
        self.presentation_contexts()
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| pc.transfer_syntax.trim_end_matches('\0').to_string())
    }
}

async fn receive_with_timeout<C: PduChannel>(
    chan: &mut C,
    timeout: Option<Duration>,
) -> Result<Pdu> {
    match timeout {
        None => chan.receive_pdu().await,
        Some(t) => tokio::time::timeout(t, chan.receive_pdu())
            .await
            .map_err(|_| TimeoutSnafu.build())?,
    }
}

/// A DIMSE-level event read from an association.
#[derive(Debug)]
pub enum DimseEvent {
    Command { pc_id: u8, cmd: CommandSet },
    ReleaseRequested,
    Aborted,
}

/// Reassembles DIMSE messages from P-DATA fragments.
///
/// A PDU may carry several fragments, possibly belonging to different
/// messages; leftovers are kept queued between calls, so one reader must
/// stay attached to its association for the association's lifetime.
#[derive(Debug, Default)]
pub struct MessageReader {
    queue: VecDeque<PDataValue>,
}

impl MessageReader {
    pub fn new() -> Self {
        MessageReader::default()
    }

    /// Queue the fragments of a PDU that was already received elsewhere,
    /// surfacing release/abort instead.
    pub fn feed(&mut self, pdu: Pdu) -> Result<Option<DimseEvent>> {
        match pdu {
            Pdu::PData { data } => {
                self.queue.extend(data);
                Ok(None)
            }
            Pdu::ReleaseRQ => Ok(Some(DimseEvent::ReleaseRequested)),
            Pdu::AbortRQ { .. } => Ok(Some(DimseEvent::Aborted)),
            pdu => UnexpectedPduSnafu {
                pdu: pdu.short_description().to_string(),
            }
            .fail(),
        }
    }

    /// Read fragments until a complete command set is assembled.
    pub async fn next_command<C: PduChannel>(
        &mut self,
        chan: &mut C,
        timeout: Option<Duration>,
    ) -> Result<DimseEvent> {
        let mut buffer: Vec<u8> = Vec::with_capacity(128);
        let mut pc_id: Option<u8> = None;
        loop {
            let fragment = match self.queue.pop_front() {
                Some(fragment) => fragment,
                None => {
                    let pdu = receive_with_timeout(chan, timeout).await?;
                    match self.feed(pdu)? {
                        Some(event) if buffer.is_empty() => return Ok(event),
                        Some(DimseEvent::Aborted) => return PeerAbortedSnafu.fail(),
                        Some(_) => return PeerRequestedReleaseSnafu.fail(),
                        None => continue,
                    }
                }
            };
            if fragment.value_type != PDataValueType::Command {
                return UnexpectedDataFragmentSnafu.fail();
            }
            pc_id.get_or_insert(fragment.presentation_context_id);
            let is_last = fragment.is_last;
            buffer.extend(fragment.data);
            if is_last {
                let obj = decode_command(&buffer)?;
                let cmd = CommandSet::read(&obj)?;
                return Ok(DimseEvent::Command {
                    pc_id: pc_id.unwrap_or_default(),
                    cmd,
                });
            }
        }
    }

    /// Read fragments until a complete dataset is assembled, returning the
    /// presentation context it arrived on along with the raw bytes.
    pub async fn next_dataset<C: PduChannel>(
        &mut self,
        chan: &mut C,
        timeout: Option<Duration>,
    ) -> Result<(u8, Vec<u8>)> {
        let mut buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
        let mut pc_id: Option<u8> = None;
        loop {
            let fragment = match self.queue.pop_front() {
                Some(fragment) => fragment,
                None => {
                    let pdu = receive_with_timeout(chan, timeout).await?;
                    match self.feed(pdu)? {
                        Some(DimseEvent::Aborted) => return PeerAbortedSnafu.fail(),
                        Some(_) => return PeerRequestedReleaseSnafu.fail(),
                        None => continue,
                    }
                }
            };
            if fragment.value_type != PDataValueType::Data {
                return UnexpectedCommandFragmentSnafu.fail();
            }
            pc_id.get_or_insert(fragment.presentation_context_id);
            let is_last = fragment.is_last;
            buffer.extend(fragment.data);
            if is_last {
                return Ok((pc_id.unwrap_or_default(), buffer));
            }
        }
    }
}

/// Send a command without a dataset in a single PDU.
pub async fn send_command<C: PduChannel>(
    chan: &mut C,
    pc_id: u8,
    cmd: &InMemDicomObject<StandardDataDictionary>,
) -> Result<()> {
    let data = encode_command(cmd)?;
    chan.send_pdu(Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    })
    .await
}

/// Send a command together with its identifier dataset.
pub async fn send_request<C: PduChannel>(
    chan: &mut C,
    pc_id: u8,
    cmd: &InMemDicomObject<StandardDataDictionary>,
    identifier: Vec<u8>,
) -> Result<()> {
    let cmd_data = encode_command(cmd)?;
    chan.send_pdu(Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            },
            PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: identifier,
            },
        ],
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::uids;

    #[test]
    fn command_round_trip() {
        let cmd = find_rq_command(7, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);
        let bytes = encode_command(&cmd).unwrap();
        let obj = decode_command(&bytes).unwrap();
        let parsed = CommandSet::read(&obj).unwrap();
        assert_eq!(parsed.field, C_FIND_RQ);
        assert_eq!(parsed.message_id, Some(7));
        assert!(parsed.has_dataset);
        assert_eq!(
            parsed.affected_sop_class_uid.as_deref(),
            Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        );
    }

    #[test]
    fn cancel_carries_no_dataset() {
        let cmd = cancel_rq_command(42);
        let obj = decode_command(&encode_command(&cmd).unwrap()).unwrap();
        let parsed = CommandSet::read(&obj).unwrap();
        assert_eq!(parsed.field, C_CANCEL_RQ);
        assert_eq!(parsed.responded_to, Some(42));
        assert!(!parsed.has_dataset);
    }

    #[test]
    fn store_response_reports_status() {
        let cmd = store_rsp_command(3, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4", STATUS_SOP_CLASS_MISMATCH);
        let obj = decode_command(&encode_command(&cmd).unwrap()).unwrap();
        let parsed = CommandSet::read(&obj).unwrap();
        assert_eq!(parsed.field, C_STORE_RSP);
        assert_eq!(parsed.status, Some(STATUS_SOP_CLASS_MISMATCH));
        assert_eq!(parsed.affected_sop_instance_uid.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn pending_statuses() {
        assert!(is_pending(STATUS_PENDING));
        assert!(is_pending(STATUS_PENDING_WARNING));
        assert!(!is_pending(STATUS_SUCCESS));
        assert!(!is_pending(STATUS_CANCELLED));
    }
}
