//! C-MOVE SCU and the move receive loop.
//!
//! One move runs per found study. While the move is in flight the loop
//! watches the primary association, the storage listener, and (once the
//! PACS connects back) the sub-association; the sub-association is kept
//! open across studies and is only torn down by the peer or on failure.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids, StandardDataDictionary};
use dicom_object::InMemDicomObject;
use snafu::ResultExt;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::association::{poll_timeout, select_ready, Primary, Ready};
use crate::dimse::{
    cancel_rq_command, encode_dataset, is_pending, move_rq_command, send_command, send_request,
    CreateDirSnafu, DimseEvent, MessageIdMismatchSnafu, PeerAbortedSnafu,
    PeerRequestedReleaseSnafu, Result, TimeoutSnafu, UnexpectedCommandFieldSnafu, C_MOVE_RSP,
    STATUS_CANCELLED, STATUS_SUBOPS_FAILED, STATUS_SUCCESS,
};
use crate::record::PatientRecord;
use crate::storescp::{self, sanitize_filename, SubAssociation, SubOptions};

/// Aggregate severity of the whole retrieval phase. Escalates and never
/// goes back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RunSeverity {
    #[default]
    Clean,
    Warning,
    Error,
}

impl RunSeverity {
    pub fn escalate(&mut self, to: RunSeverity) {
        *self = (*self).max(to);
    }

    pub fn note(&mut self, outcome: StudyOutcome) {
        self.escalate(match outcome {
            StudyOutcome::Completed => RunSeverity::Clean,
            StudyOutcome::Warning => RunSeverity::Warning,
            StudyOutcome::Failed => RunSeverity::Error,
        });
    }
}

/// How a single study move ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyOutcome {
    Completed,
    Warning,
    Failed,
}

pub fn classify_move_status(status: u16) -> StudyOutcome {
    match status {
        // a cancelled move did what was asked of it
        STATUS_SUCCESS | STATUS_CANCELLED => StudyOutcome::Completed,
        STATUS_SUBOPS_FAILED => StudyOutcome::Warning,
        _ => StudyOutcome::Failed,
    }
}

/// Per-study response counter with a one-shot cancel tracker.
#[derive(Debug, Default)]
pub struct MoveProgress {
    pub responses: u32,
    cancel_sent: bool,
}

impl MoveProgress {
    pub fn note_response(&mut self) -> u32 {
        self.responses += 1;
        self.responses
    }

    /// True exactly once, when the response count first reaches the
    /// threshold.
    pub fn should_cancel(&mut self, threshold: Option<u32>) -> bool {
        match threshold {
            Some(limit) if self.responses >= limit && !self.cancel_sent => {
                self.cancel_sent = true;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MoveConfig {
    /// Where the PACS should send the instances; our own AE title when we
    /// receive them ourselves.
    pub destination_aet: String,
    /// Whether the destination is this process (creates study directories
    /// and accepts sub-associations).
    pub self_delivery: bool,
    pub output_root: PathBuf,
    pub sub_options: SubOptions,
    pub cancel_after: Option<u32>,
    /// None means blocking mode: wait for the PACS however long it takes.
    pub dimse_timeout: Option<Duration>,
    /// Drain identifier datasets that pending responses are not supposed
    /// to carry, instead of assuming they are absent.
    pub read_pending_identifiers: bool,
}

/// Every (record, study) pair the retrieval phase will move. Records
/// without any found study contribute nothing.
pub fn studies_to_move<'a>(
    records: &'a [PatientRecord],
) -> impl Iterator<Item = (&'a PatientRecord, &'a str)> + 'a {
    records.iter().flat_map(|record| {
        record
            .study_uids
            .iter()
            .map(move |uid| (record, uid.as_str()))
    })
}

/// Move identifier: the study and the patient it belongs to.
pub fn move_identifier(
    record: &PatientRecord,
    study_uid: &str,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, record.id.as_str())),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study_uid)),
    ])
}

/// Issue one C-MOVE and drive the receive loop until the terminal
/// response. The sub-association slot survives the call.
pub async fn move_study(
    primary: &mut Primary,
    listener: Option<&TcpListener>,
    sub: &mut Option<SubAssociation>,
    record: &PatientRecord,
    study_uid: &str,
    config: &MoveConfig,
) -> Result<StudyOutcome> {
    let (pc_id, ts_uid) =
        primary.context_for(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)?;

    let study_dir = config.output_root.join(sanitize_filename(study_uid));
    if config.self_delivery {
        if study_dir.is_dir() {
            warn!("{} already exists, overwriting", study_dir.display());
        } else {
            std::fs::create_dir_all(&study_dir).context(CreateDirSnafu {
                path: study_dir.clone(),
            })?;
        }
    }

    let msg_id = primary.next_message_id();
    let cmd = move_rq_command(
        msg_id,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        &config.destination_aet,
    );
    let identifier = encode_dataset(&move_identifier(record, study_uid), &ts_uid)?;
    info!(
        "moving study {} of patient {} to {}",
        study_uid, record.id, config.destination_aet
    );
    send_request(&mut primary.assoc, pc_id, &cmd, identifier).await?;

    let mut progress = MoveProgress::default();
    let mut first_poll = true;
    let mut waited = Instant::now();

    loop {
        let timeout = poll_timeout(sub.is_some(), config.dimse_timeout);
        match select_ready(primary, listener, sub, timeout).await? {
            Ready::Timeout => {
                if first_poll {
                    first_poll = false;
                    continue;
                }
                match config.dimse_timeout {
                    None => continue,
                    Some(limit) if waited.elapsed() < limit => continue,
                    Some(_) => return TimeoutSnafu.fail(),
                }
            }
            Ready::Inbound(stream) => {
                waited = Instant::now();
                match storescp::accept(stream, &config.sub_options).await {
                    Ok(new_sub) => *sub = Some(new_sub),
                    Err(e) => warn!("could not accept sub-association: {}", e),
                }
            }
            Ready::Sub(pdu) => {
                waited = Instant::now();
                if let Err(e) = storescp::service(sub, pdu, &study_dir, config.dimse_timeout).await
                {
                    warn!("sub-association failure: {}", e);
                }
            }
            Ready::Primary(pdu) => {
                waited = Instant::now();
                if let Some(event) = primary.reader.feed(pdu)? {
                    return match event {
                        DimseEvent::Aborted => PeerAbortedSnafu.fail(),
                        _ => PeerRequestedReleaseSnafu.fail(),
                    };
                }
                let event = primary
                    .reader
                    .next_command(&mut primary.assoc, config.dimse_timeout)
                    .await?;
                let cmd = match event {
                    DimseEvent::Command { cmd, .. } => cmd,
                    DimseEvent::ReleaseRequested => return PeerRequestedReleaseSnafu.fail(),
                    DimseEvent::Aborted => return PeerAbortedSnafu.fail(),
                };
                if cmd.field != C_MOVE_RSP {
                    return UnexpectedCommandFieldSnafu { field: cmd.field }.fail();
                }
                if cmd.responded_to != Some(msg_id) {
                    return MessageIdMismatchSnafu {
                        got: cmd.responded_to.unwrap_or_default(),
                        expected: msg_id,
                    }
                    .fail();
                }
                let status = cmd.status()?;

                if is_pending(status) {
                    if cmd.has_dataset {
                        if config.read_pending_identifiers {
                            let (_pc, bytes) = primary
                                .reader
                                .next_dataset(&mut primary.assoc, config.dimse_timeout)
                                .await?;
                            warn!(
                                "pending move response carried {} bytes of identifiers, discarding",
                                bytes.len()
                            );
                        } else {
                            warn!("pending move response announces a dataset, assuming none");
                        }
                    }
                    let count = progress.note_response();
                    debug!("move pending after {} response(s)", count);
                    if progress.should_cancel(config.cancel_after) {
                        debug!("sending C-CANCEL after {} responses", count);
                        send_command(&mut primary.assoc, pc_id, &cancel_rq_command(msg_id)).await?;
                    }
                    continue;
                }

                if cmd.has_dataset {
                    let (_pc, bytes) = primary
                        .reader
                        .next_dataset(&mut primary.assoc, config.dimse_timeout)
                        .await?;
                    debug!("terminal move response carried {} bytes of identifiers", bytes.len());
                }
                let outcome = classify_move_status(status);
                match outcome {
                    StudyOutcome::Completed => {
                        info!("study {} moved (status {:#06X})", study_uid, status)
                    }
                    StudyOutcome::Warning => warn!(
                        "study {} moved with failed sub-operations (status {:#06X})",
                        study_uid, status
                    ),
                    StudyOutcome::Failed => warn!(
                        "study {} could not be moved (status {:#06X})",
                        study_uid, status
                    ),
                }
                return Ok(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_monotonic() {
        let mut severity = RunSeverity::default();
        severity.note(StudyOutcome::Completed);
        assert_eq!(severity, RunSeverity::Clean);
        severity.note(StudyOutcome::Warning);
        assert_eq!(severity, RunSeverity::Warning);
        severity.note(StudyOutcome::Completed);
        assert_eq!(severity, RunSeverity::Warning);
        severity.note(StudyOutcome::Failed);
        severity.note(StudyOutcome::Warning);
        assert_eq!(severity, RunSeverity::Error);
    }

    #[test]
    fn warning_plus_success_stays_warning() {
        let mut severity = RunSeverity::default();
        severity.note(StudyOutcome::Warning);
        severity.note(StudyOutcome::Completed);
        assert_eq!(severity, RunSeverity::Warning);
    }

    #[test]
    fn move_status_classification() {
        assert_eq!(classify_move_status(STATUS_SUCCESS), StudyOutcome::Completed);
        assert_eq!(classify_move_status(STATUS_CANCELLED), StudyOutcome::Completed);
        assert_eq!(classify_move_status(STATUS_SUBOPS_FAILED), StudyOutcome::Warning);
        assert_eq!(classify_move_status(0xA702), StudyOutcome::Failed);
        assert_eq!(classify_move_status(0xC001), StudyOutcome::Failed);
    }

    #[test]
    fn records_without_studies_are_not_moved() {
        use crate::record::parse_records;
        let mut records = parse_records(["Jane Doe,1,1.1.2020,CT", "John Roe,2,2.1.2020,CT"]);
        records[0].insert_study_uid("1.2.3");
        records[0].insert_study_uid("1.2.4");
        let pairs: Vec<(String, String)> = studies_to_move(&records)
            .map(|(record, uid)| (record.id.clone(), uid.to_string()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("0000000001".to_string(), "1.2.3".to_string()),
                ("0000000001".to_string(), "1.2.4".to_string()),
            ]
        );
    }

    #[test]
    fn cancel_fires_once_at_threshold() {
        let mut progress = MoveProgress::default();
        progress.note_response();
        assert!(!progress.should_cancel(Some(2)));
        progress.note_response();
        assert!(progress.should_cancel(Some(2)));
        progress.note_response();
        assert!(!progress.should_cancel(Some(2)));
        // disabled threshold never cancels
        let mut progress = MoveProgress::default();
        progress.note_response();
        assert!(!progress.should_cancel(None));
    }
}
