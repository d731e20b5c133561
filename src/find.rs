//! C-FIND SCU: streams query responses through a handler strategy.
//!
//! Two strategies exist: the UID collector backing the study search per
//! patient record, and the tag dumper backing the optional series-level
//! CSV export.

use std::io::Write;
use std::time::Duration;

use dicom_core::{dicom_value, DataDictionary, DataElement, Tag, VR};
use dicom_dictionary_std::{tags, uids, StandardDataDictionary};
use dicom_object::InMemDicomObject;
use snafu::OptionExt;
use tracing::{debug, warn};

use crate::association::Primary;
use crate::dimse::{
    cancel_rq_command, decode_dataset, encode_dataset, find_rq_command, is_pending, send_command,
    send_request, DimseEvent, MessageIdMismatchSnafu, PduChannel, PeerAbortedSnafu,
    PeerRequestedReleaseSnafu, Result, UnexpectedCommandFieldSnafu, C_FIND_RSP,
};
use crate::record::PatientRecord;

/// What the handler wants done after seeing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Cancel,
}

pub struct FindResponse<'a> {
    /// 1-based count of pending responses seen in this exchange.
    pub response_count: u32,
    pub status: u16,
    pub identifiers: &'a InMemDicomObject<StandardDataDictionary>,
}

pub trait FindHandler {
    fn on_response(&mut self, rsp: &FindResponse<'_>) -> Action;
}

/// Run one C-FIND exchange, streaming every pending response through the
/// handler, and return the terminal status.
///
/// A `Cancel` verdict sends C-CANCEL at most once; the remaining pending
/// responses are still consumed until the SCP terminates the exchange.
pub async fn run_find(
    primary: &mut Primary,
    identifier: &InMemDicomObject<StandardDataDictionary>,
    handler: &mut dyn FindHandler,
    timeout: Option<Duration>,
) -> Result<u16> {
    let (pc_id, ts_uid) =
        primary.context_for(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)?;
    let msg_id = primary.next_message_id();
    let cmd = find_rq_command(msg_id, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);
    let identifier_bytes = encode_dataset(identifier, &ts_uid)?;
    send_request(&mut primary.assoc, pc_id, &cmd, identifier_bytes).await?;

    let mut response_count = 0u32;
    let mut cancel_sent = false;
    loop {
        let event = primary.reader.next_command(&mut primary.assoc, timeout).await?;
        let cmd = match event {
            DimseEvent::Command { cmd, .. } => cmd,
            DimseEvent::ReleaseRequested => return PeerRequestedReleaseSnafu.fail(),
            DimseEvent::Aborted => return PeerAbortedSnafu.fail(),
        };
        if cmd.field != C_FIND_RSP {
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
        if !is_pending(status) {
            debug!("find exchange finished with status {:#06X}", status);
            return Ok(status);
        }

        if !cmd.has_dataset {
            // reading anyway would consume the next response's command
            warn!("pending find response carries no identifiers, skipping");
            continue;
        }
        let (data_pc, bytes) = primary.reader.next_dataset(&mut primary.assoc, timeout).await?;
        let ts = primary
            .assoc
            .transfer_syntax_for(data_pc)
            .unwrap_or_else(|| ts_uid.clone());
        let identifiers = decode_dataset(&bytes, &ts)?;

        response_count += 1;
        let action = handler.on_response(&FindResponse {
            response_count,
            status,
            identifiers: &identifiers,
        });
        if action == Action::Cancel && !cancel_sent {
            debug!("sending C-CANCEL after {} responses", response_count);
            send_command(&mut primary.assoc, pc_id, &cancel_rq_command(msg_id)).await?;
            cancel_sent = true;
        }
    }
}

/// Collects StudyInstanceUIDs into the patient record.
pub struct UidCollector<'a> {
    pub record: &'a mut PatientRecord,
    pub cancel_after: Option<u32>,
}

impl FindHandler for UidCollector<'_> {
    fn on_response(&mut self, rsp: &FindResponse<'_>) -> Action {
        if let Some(uid) = element_str(rsp.identifiers, tags::STUDY_INSTANCE_UID) {
            if self.record.insert_study_uid(&uid) {
                debug!("found study {}", uid);
            }
        }
        match self.cancel_after {
            Some(limit) if rsp.response_count >= limit => Action::Cancel,
            _ => Action::Continue,
        }
    }
}

/// STUDY-level query identifier for one patient record.
pub fn study_identifier(record: &PatientRecord) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, record.id.as_str())),
        DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            dicom_value!(Str, record.study_date.as_str()),
        ),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "")),
        DataElement::new(
            tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
            VR::IS,
            dicom_value!(Str, ""),
        ),
        DataElement::new(
            tags::MODALITIES_IN_STUDY,
            VR::CS,
            dicom_value!(Str, record.modality.as_deref().unwrap_or("")),
        ),
    ])
}

/// Find the studies matching one record; the record's UID set receives
/// every StudyInstanceUID the PACS reports.
pub async fn find_studies(
    primary: &mut Primary,
    record: &mut PatientRecord,
    cancel_after: Option<u32>,
    timeout: Option<Duration>,
) -> Result<u16> {
    let identifier = study_identifier(record);
    let mut handler = UidCollector {
        record,
        cancel_after,
    };
    run_find(primary, &identifier, &mut handler, timeout).await
}

/// SERIES-level identifier asking for description, type and any extra tags.
pub fn series_identifier(
    study_uid: &str,
    extra_tags: &[Tag],
) -> InMemDicomObject<StandardDataDictionary> {
    let mut elements = vec![
        DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "SERIES")),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study_uid)),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, dicom_value!(Str, "")),
        DataElement::new(tags::IMAGE_TYPE, VR::CS, dicom_value!(Str, "")),
    ];
    for &tag in extra_tags {
        if elements.iter().any(|e| e.header().tag == tag) {
            continue;
        }
        let vr = StandardDataDictionary
            .by_tag(tag)
            .map(|entry| entry.vr.relaxed())
            .unwrap_or(VR::LO);
        elements.push(DataElement::new(tag, vr, dicom_value!(Str, "")));
    }
    InMemDicomObject::from_element_iter(elements)
}

/// Series descriptions that never carry diagnostic image data.
const NOISE_DESCRIPTIONS: [&str; 10] = [
    "topog", "scout", "dose", "service", "report", "processed", "vrt", "view", "patient",
    "protocol",
];

/// Derived, secondary and localizer series are skipped in the dump.
pub fn is_noise_series(image_type: &str, description: &str) -> bool {
    let image_type = image_type.to_ascii_uppercase();
    if ["DERIVED", "SECONDARY", "LOCALIZER"]
        .iter()
        .any(|t| image_type.contains(t))
    {
        return true;
    }
    let description = description.to_ascii_lowercase();
    NOISE_DESCRIPTIONS.iter().any(|t| description.contains(t))
}

/// One CSV row for a series response, or `None` when filtered out.
/// Missing values are written as `EMPTY`.
pub fn series_row(
    identifiers: &InMemDicomObject<StandardDataDictionary>,
    patient_id: &str,
    study_uid: &str,
    extra_tags: &[Tag],
) -> Option<String> {
    let description =
        element_str(identifiers, tags::SERIES_DESCRIPTION).unwrap_or_else(|| "EMPTY".into());
    let image_type = element_str(identifiers, tags::IMAGE_TYPE).unwrap_or_default();
    if is_noise_series(&image_type, &description) {
        return None;
    }
    let mut row = format!("{};{};{}", patient_id, study_uid, description);
    for &tag in extra_tags {
        let value = element_str(identifiers, tag).unwrap_or_else(|| "EMPTY".into());
        row.push(';');
        row.push_str(&value);
    }
    Some(row)
}

/// Writes one CSV row per usable series response.
pub struct TagDumper<'a> {
    pub writer: &'a mut dyn Write,
    pub patient_id: &'a str,
    pub study_uid: &'a str,
    pub extra_tags: &'a [Tag],
}

impl FindHandler for TagDumper<'_> {
    fn on_response(&mut self, rsp: &FindResponse<'_>) -> Action {
        if let Some(row) = series_row(rsp.identifiers, self.patient_id, self.study_uid, self.extra_tags)
        {
            if let Err(e) = writeln!(self.writer, "{}", row) {
                warn!("could not write dump row: {}", e);
            }
        }
        Action::Continue
    }
}

/// Parse a tag argument: a dictionary name or a bare `ggggeeee` /
/// `gggg,eeee` hex pair.
pub fn parse_tag(tag_str: &str) -> Result<Tag> {
    if let Some(tag) = StandardDataDictionary.parse_tag(tag_str) {
        return Ok(tag);
    }
    let hex: String = tag_str
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    if hex.len() == 8 && tag_str.chars().all(|c| c.is_ascii_hexdigit() || c == ',') {
        if let (Ok(group), Ok(element)) = (
            u16::from_str_radix(&hex[0..4], 16),
            u16::from_str_radix(&hex[4..8], 16),
        ) {
            return Ok(Tag(group, element));
        }
    }
    None.context(crate::dimse::InvalidTagSnafu { input: tag_str })
}

/// Parse the `--tag` arguments into CSV columns, dropping the tags the
/// dump always carries.
pub fn dump_tag_columns(raw: &[String]) -> Result<(Vec<String>, Vec<Tag>)> {
    let mut columns = Vec::with_capacity(raw.len());
    let mut extra_tags = Vec::with_capacity(raw.len());
    for arg in raw {
        let tag = parse_tag(arg)?;
        if [
            tags::PATIENT_ID,
            tags::STUDY_INSTANCE_UID,
            tags::SERIES_DESCRIPTION,
        ]
        .contains(&tag)
        {
            warn!("tag {} is always part of the dump, ignoring", arg);
            continue;
        }
        columns.push(arg.clone());
        extra_tags.push(tag);
    }
    Ok((columns, extra_tags))
}

fn element_str(obj: &InMemDicomObject<StandardDataDictionary>, tag: Tag) -> Option<String> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_records;

    fn series_obj(description: &str, image_type: &str) -> InMemDicomObject<StandardDataDictionary> {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::SERIES_DESCRIPTION,
                VR::LO,
                dicom_value!(Str, description),
            ),
            DataElement::new(tags::IMAGE_TYPE, VR::CS, dicom_value!(Str, image_type)),
            DataElement::new(tags::BODY_PART_EXAMINED, VR::CS, dicom_value!(Str, "HEAD")),
        ])
    }

    #[test]
    fn uid_collector_cancels_at_threshold() {
        let mut record = parse_records(["A B,1,1.1.2020"]).remove(0);
        let mut collector = UidCollector {
            record: &mut record,
            cancel_after: Some(2),
        };
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3"),
        )]);
        let first = collector.on_response(&FindResponse {
            response_count: 1,
            status: 0xFF00,
            identifiers: &obj,
        });
        let second = collector.on_response(&FindResponse {
            response_count: 2,
            status: 0xFF00,
            identifiers: &obj,
        });
        assert_eq!(first, Action::Continue);
        assert_eq!(second, Action::Cancel);
        assert_eq!(record.study_uids.len(), 1);
    }

    #[test]
    fn noise_series_are_filtered() {
        assert!(is_noise_series("ORIGINAL\\PRIMARY\\LOCALIZER", "axial"));
        assert!(is_noise_series("DERIVED\\SECONDARY", "mpr"));
        assert!(is_noise_series("", "Topogram 0.6 T20s"));
        assert!(is_noise_series("", "Dose Report"));
        assert!(!is_noise_series("ORIGINAL\\PRIMARY", "Thorax nativ"));
    }

    #[test]
    fn series_row_formats_missing_values() {
        let obj = series_obj("Thorax", "ORIGINAL\\PRIMARY");
        let row = series_row(&obj, "0000000001", "1.2.3", &[tags::BODY_PART_EXAMINED, tags::STATION_NAME]);
        assert_eq!(row.as_deref(), Some("0000000001;1.2.3;Thorax;HEAD;EMPTY"));
    }

    #[test]
    fn filtered_series_produce_no_row() {
        let obj = series_obj("Scout", "ORIGINAL\\PRIMARY");
        assert_eq!(series_row(&obj, "1", "1.2.3", &[]), None);
    }

    #[test]
    fn dump_columns_drop_builtin_tags() {
        let raw = vec![
            "Modality".to_string(),
            "PatientID".to_string(),
            "0008,1030".to_string(),
            "StudyInstanceUID".to_string(),
        ];
        let (columns, extra_tags) = dump_tag_columns(&raw).unwrap();
        assert_eq!(columns, ["Modality", "0008,1030"]);
        assert_eq!(extra_tags, [tags::MODALITY, tags::STUDY_DESCRIPTION]);
    }

    #[test]
    fn tag_parsing() {
        assert_eq!(parse_tag("00080060").unwrap(), Tag(0x0008, 0x0060));
        assert_eq!(parse_tag("0008,0060").unwrap(), Tag(0x0008, 0x0060));
        assert!(parse_tag("Modality").is_ok());
        assert!(parse_tag("not a tag").is_err());
    }
}
