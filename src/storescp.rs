//! Storage/Echo SCP serving the sub-association that the PACS opens
//! towards us while a C-MOVE is in flight.
//!
//! Received instances land in the per-study output directory as
//! `<modality>.<SOPInstanceUID>`.

use std::path::Path;
use std::time::Duration;

use dicom_dictionary_std::{tags, uids, StandardDataDictionary};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_ul::{association::ServerAssociation, Pdu};
use snafu::ResultExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::association::TRANSFER_SYNTAX_PREFERENCE;
use crate::dimse::{
    self, echo_rsp_command, send_command, store_rsp_command, CommandSet, DimseEvent, MessageReader,
    NegotiationSnafu, PduChannel, Result, STATUS_CANNOT_UNDERSTAND, STATUS_OUT_OF_RESOURCES,
    STATUS_SOP_CLASS_MISMATCH, STATUS_SUCCESS,
};

/// Storage SOP classes offered on incoming sub-associations.
pub const STORAGE_ABSTRACT_SYNTAXES: &[&str] = &[
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::BREAST_TOMOSYNTHESIS_IMAGE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::ENHANCED_PET_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::RT_IMAGE_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
    uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
];

#[derive(Debug, Clone)]
pub struct SubOptions {
    /// AE title we present on accepted sub-associations.
    pub ae_title: String,
    pub max_pdu_length: u32,
}

/// An accepted sub-association with its own message reader.
pub struct SubAssociation {
    pub assoc: ServerAssociation<TcpStream>,
    pub reader: MessageReader,
}

/// Negotiate an incoming sub-association, offering Verification and the
/// storage SOP classes.
pub async fn accept(stream: TcpStream, options: &SubOptions) -> Result<SubAssociation> {
    let mut opts = dicom_ul::association::ServerAssociationOptions::new()
        .accept_any()
        .ae_title(options.ae_title.clone())
        .max_pdu_length(options.max_pdu_length)
        .with_abstract_syntax(uids::VERIFICATION);
    for uid in STORAGE_ABSTRACT_SYNTAXES {
        opts = opts.with_abstract_syntax(*uid);
    }
    for ts in TRANSFER_SYNTAX_PREFERENCE {
        opts = opts.with_transfer_syntax(ts);
    }

    let assoc = opts
        .establish_async(stream)
        .await
        .map_err(Box::from)
        .context(NegotiationSnafu)?;
    info!("sub-association accepted from {}", assoc.client_ae_title());

    Ok(SubAssociation {
        assoc,
        reader: MessageReader::new(),
    })
}

async fn teardown(slot: &mut Option<SubAssociation>) {
    if let Some(sub) = slot.take() {
        let _ = sub.assoc.abort().await;
    }
}

/// Service one PDU already received on the sub-association.
///
/// Handles C-ECHO and C-STORE, acknowledges release, and drops the
/// handle silently when the peer aborts. Any failure tears the
/// sub-association down and is reported to the caller; the move loop
/// goes on without it.
pub async fn service(
    slot: &mut Option<SubAssociation>,
    pdu: Pdu,
    study_dir: &Path,
    timeout: Option<Duration>,
) -> Result<()> {
    let sub = match slot.as_mut() {
        Some(sub) => sub,
        None => return Ok(()),
    };

    let fed = match sub.reader.feed(pdu) {
        Ok(fed) => fed,
        Err(e) => {
            teardown(slot).await;
            return Err(e);
        }
    };
    let event = match fed {
        Some(event) => event,
        None => match sub.reader.next_command(&mut sub.assoc, timeout).await {
            Ok(event) => event,
            Err(e) => {
                teardown(slot).await;
                return Err(e);
            }
        },
    };

    match event {
        DimseEvent::ReleaseRequested => {
            if let Some(mut sub) = slot.take() {
                let _ = sub.assoc.send(&Pdu::ReleaseRP).await;
                info!("sub-association released by {}", sub.assoc.client_ae_title());
            }
            Ok(())
        }
        DimseEvent::Aborted => {
            debug!("sub-association aborted by peer");
            *slot = None;
            Ok(())
        }
        DimseEvent::Command { pc_id, cmd } => {
            let result = dispatch(sub, pc_id, &cmd, study_dir, timeout).await;
            if result.is_err() {
                teardown(slot).await;
            }
            result
        }
    }
}

/// Wind down the sub-association after the last move: keep serving the
/// peer until it releases, aborting if it stays silent past the deadline.
pub async fn shutdown(slot: &mut Option<SubAssociation>, study_dir: &Path, linger: Duration) {
    loop {
        let pdu = match slot.as_mut() {
            None => return,
            Some(sub) => match tokio::time::timeout(linger, sub.assoc.receive()).await {
                Err(_) => {
                    debug!("sub-association idle past shutdown deadline, aborting");
                    teardown(slot).await;
                    return;
                }
                Ok(Err(_)) => {
                    *slot = None;
                    return;
                }
                Ok(Ok(pdu)) => pdu,
            },
        };
        if let Err(e) = service(slot, pdu, study_dir, Some(linger)).await {
            warn!("sub-association failure during shutdown: {}", e);
        }
    }
}

async fn dispatch(
    sub: &mut SubAssociation,
    pc_id: u8,
    cmd: &CommandSet,
    study_dir: &Path,
    timeout: Option<Duration>,
) -> Result<()> {
    match cmd.field {
        dimse::C_ECHO_RQ => {
            let rsp = echo_rsp_command(cmd.message_id.unwrap_or_default());
            send_command(&mut sub.assoc, pc_id, &rsp).await
        }
        dimse::C_STORE_RQ => {
            let (data_pc, bytes) = sub.reader.next_dataset(&mut sub.assoc, timeout).await?;
            let status = match sub.assoc.transfer_syntax_for(data_pc) {
                Some(ts_uid) => {
                    let source_aet = sub.assoc.client_ae_title().to_string();
                    store_instance(cmd, &bytes, &ts_uid, study_dir, &source_aet)
                }
                None => {
                    warn!("no negotiated context for incoming dataset");
                    STATUS_CANNOT_UNDERSTAND
                }
            };
            let rsp = store_rsp_command(
                cmd.message_id.unwrap_or_default(),
                cmd.affected_sop_class_uid.as_deref().unwrap_or_default(),
                cmd.affected_sop_instance_uid.as_deref().unwrap_or_default(),
                status,
            );
            send_command(&mut sub.assoc, pc_id, &rsp).await
        }
        field => {
            warn!("unsupported command {:#06X} on sub-association", field);
            dimse::UnexpectedCommandFieldSnafu { field }.fail()
        }
    }
}

/// Decode, verify and persist one received instance, mapping failures to
/// the matching C-STORE response status.
fn store_instance(
    cmd: &CommandSet,
    bytes: &[u8],
    ts_uid: &str,
    study_dir: &Path,
    source_aet: &str,
) -> u16 {
    let obj = match dimse::decode_dataset(bytes, ts_uid) {
        Ok(obj) => obj,
        Err(e) => {
            warn!("could not read incoming instance: {}", e);
            return STATUS_CANNOT_UNDERSTAND;
        }
    };

    let sop_class = match element_str(&obj, tags::SOP_CLASS_UID) {
        Some(uid) => uid,
        None => return STATUS_CANNOT_UNDERSTAND,
    };
    let sop_instance = match element_str(&obj, tags::SOP_INSTANCE_UID) {
        Some(uid) => uid,
        None => return STATUS_CANNOT_UNDERSTAND,
    };
    // the dataset must belong to the SOP class the command announced
    if let Some(expected) = cmd.affected_sop_class_uid.as_deref() {
        if expected != sop_class {
            warn!(
                "dataset SOP class {} does not match request {}",
                sop_class, expected
            );
            return STATUS_SOP_CLASS_MISMATCH;
        }
    }

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(&sop_class)
        .media_storage_sop_instance_uid(&sop_instance)
        .transfer_syntax(ts_uid)
        .source_application_entity_title(source_aet)
        .build();
    let meta = match meta {
        Ok(meta) => meta,
        Err(e) => {
            warn!("could not build file meta information: {}", e);
            return STATUS_CANNOT_UNDERSTAND;
        }
    };

    let filename = sanitize_filename(&format!(
        "{}.{}",
        modality_for_sop_class(&sop_class),
        sop_instance
    ));
    let path = study_dir.join(filename);
    if let Err(e) = std::fs::create_dir_all(study_dir) {
        warn!("could not create {}: {}", study_dir.display(), e);
        return STATUS_OUT_OF_RESOURCES;
    }

    let file_obj = obj.with_exact_meta(meta);
    let mut out = Vec::with_capacity(bytes.len() + 1024);
    if let Err(e) = file_obj.write_all(&mut out) {
        warn!("could not serialize instance {}: {}", sop_instance, e);
        return STATUS_OUT_OF_RESOURCES;
    }
    if let Err(e) = std::fs::write(&path, out) {
        warn!("could not write {}: {}", path.display(), e);
        // remove whatever partial file write left behind
        let _ = std::fs::remove_file(&path);
        return STATUS_OUT_OF_RESOURCES;
    }

    info!("stored {}", path.display());
    STATUS_SUCCESS
}

fn element_str(obj: &InMemDicomObject<StandardDataDictionary>, tag: dicom_core::Tag) -> Option<String> {
    let value = obj
        .element(tag)
        .ok()?
        .to_str()
        .ok()?
        .trim_end_matches('\0')
        .trim()
        .to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Modality prefix for stored file names, derived from the SOP class.
pub fn modality_for_sop_class(uid: &str) -> &'static str {
    match uid {
        uids::CT_IMAGE_STORAGE | uids::ENHANCED_CT_IMAGE_STORAGE => "CT",
        uids::MR_IMAGE_STORAGE | uids::ENHANCED_MR_IMAGE_STORAGE => "MR",
        uids::ULTRASOUND_IMAGE_STORAGE | uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE => "US",
        uids::SECONDARY_CAPTURE_IMAGE_STORAGE
        | uids::MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE
        | uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE
        | uids::MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE => "SC",
        uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE => "CR",
        uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION
        | uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING => "DX",
        uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION
        | uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING
        | uids::BREAST_TOMOSYNTHESIS_IMAGE_STORAGE => "MG",
        uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE | uids::ENHANCED_PET_IMAGE_STORAGE => {
            "PT"
        }
        uids::NUCLEAR_MEDICINE_IMAGE_STORAGE => "NM",
        uids::RT_IMAGE_STORAGE => "RI",
        uids::RT_DOSE_STORAGE => "RD",
        uids::RT_STRUCTURE_SET_STORAGE => "RS",
        uids::RT_PLAN_STORAGE => "RP",
        uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE => "PR",
        uids::BASIC_TEXT_SR_STORAGE | uids::ENHANCED_SR_STORAGE | uids::COMPREHENSIVE_SR_STORAGE => {
            "SR"
        }
        _ => "UNKNOWN",
    }
}

/// Keep file names shell- and filesystem-safe.
pub fn sanitize_filename(name: &str) -> String {
    name.trim_end_matches('\0')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_sanitization() {
        assert_eq!(sanitize_filename("CT.1.2.840.113619.2.55\0"), "CT.1.2.840.113619.2.55");
        assert_eq!(sanitize_filename("SC.1.2/../3*4"), "SC.1.2_.._3_4");
    }

    #[test]
    fn modality_mapping() {
        assert_eq!(modality_for_sop_class(uids::CT_IMAGE_STORAGE), "CT");
        assert_eq!(modality_for_sop_class(uids::RT_DOSE_STORAGE), "RD");
        assert_eq!(modality_for_sop_class("1.2.3.99"), "UNKNOWN");
    }

    #[test]
    fn storage_list_offers_verification_separately() {
        assert!(!STORAGE_ABSTRACT_SYNTAXES.contains(&uids::VERIFICATION));
    }
}
