//! Batch DICOM Query/Retrieve client.
//!
//! Reads a patient list, queries the PACS for matching studies, reports
//! the patients without any, optionally dumps series-level tags to CSV,
//! and optionally C-MOVEs every found study — receiving the instances
//! itself unless a third-party destination is named.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dicom_core::Tag;
use snafu::Report;
use tokio::net::TcpListener;
use tracing::{error, warn};

use studyqr::association::{self, CloseOutcome, ConnectConfig, Primary};
use studyqr::dimse::{self, Error};
use studyqr::find::{self, TagDumper};
use studyqr::record::{self, PatientRecord};
use studyqr::retrieve::{self, MoveConfig, RunSeverity, StudyOutcome};
use studyqr::storescp::{self, SubAssociation, SubOptions};

const EXIT_EMPTY_LIST: u8 = 10;
const EXIT_NO_MODALITY: u8 = 11;
const EXIT_LIST_UNREADABLE: u8 = 12;
const EXIT_NETWORK_INIT: u8 = 60;
const EXIT_NEGOTIATION: u8 = 61;
const EXIT_NO_PRESENTATION_CONTEXT: u8 = 66;
const EXIT_MOVE_WARNING: u8 = 68;
const EXIT_MOVE_ERROR: u8 = 69;
/// Association died mid-run (abort, release, protocol violation).
const EXIT_PROTOCOL: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "studyqr", version, about)]
struct App {
    /// PACS host name or IP address
    host: String,
    /// PACS TCP port
    port: u16,
    /// patient list, one `Name,PatientID,Date[,Modality]` per line
    #[arg(short = 'f', long = "file", default_value = "patients.txt")]
    patient_list: PathBuf,
    /// calling AE title presented on every association
    #[arg(long = "aet", default_value = "FNOSTUDYQR")]
    calling_ae_title: String,
    /// called AE title of the PACS
    #[arg(long = "aec", default_value = "STORESCP")]
    called_ae_title: String,
    /// AE title of a third-party move destination;
    /// without it the studies are moved to this process
    #[arg(long = "aem")]
    move_destination: Option<String>,
    /// TCP port for receiving instances
    #[arg(long = "retrieve-port", default_value_t = 0)]
    retrieve_port: u16,
    /// retrieve the found studies via C-MOVE
    #[arg(long = "retrieve-files")]
    retrieve_files: bool,
    /// output directory; studies land in per-StudyInstanceUID subdirectories
    #[arg(short = 'o', long = "out-dir", default_value = ".")]
    out_dir: PathBuf,
    /// modality filter for records that do not bring their own
    #[arg(short = 'm', long = "modality")]
    modality: Option<String>,
    /// apply --modality to every record, replacing per-record values
    #[arg(long = "modality-all")]
    modality_all: bool,
    /// widen each study date into a range of +/- this many months
    #[arg(long = "extend-date", value_name = "MONTHS", default_value_t = 0)]
    extend_months: u32,
    /// do not write the missing-studies report
    #[arg(long = "no-missing-file")]
    no_missing_file: bool,
    /// dump series-level tags of all found studies to CSV
    #[arg(long = "retrieve-tags")]
    retrieve_tags: bool,
    /// CSV dump file prefix
    #[arg(long = "dump-path", default_value = "studyqr-tags")]
    dump_path: String,
    /// extra tag for the CSV dump (dictionary name or gggg,eeee), repeatable
    #[arg(short = 't', long = "tag")]
    tags: Vec<String>,
    /// cancel a query or move after this many responses
    #[arg(long = "cancel-after", value_name = "N")]
    cancel_after: Option<u32>,
    /// DIMSE timeout in seconds; 0 waits indefinitely
    #[arg(long = "timeout", default_value_t = 0)]
    timeout_secs: u64,
    /// maximum accepted PDU length
    #[arg(long = "max-pdu", default_value_t = 16384)]
    max_pdu_length: u32,
    /// drain identifier datasets wrongly attached to pending move responses
    #[arg(long = "read-pending-identifiers")]
    read_pending_identifiers: bool,
    /// verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish(),
    );
}

fn exit_for_error(e: &Error) -> u8 {
    match e {
        Error::NoPresentationContext { .. } => EXIT_NO_PRESENTATION_CONTEXT,
        Error::Negotiation { .. } => EXIT_NEGOTIATION,
        _ => EXIT_PROTOCOL,
    }
}

fn close_outcome_for_error(e: &Error) -> CloseOutcome {
    match e {
        Error::PeerAborted => CloseOutcome::PeerAborted,
        Error::PeerRequestedRelease => CloseOutcome::PeerRequestedRelease,
        _ => CloseOutcome::Normal,
    }
}

/// Inject the command line modality into the records and reject a batch
/// that would query without any modality filter.
fn apply_modality(
    records: &mut [PatientRecord],
    cli_modality: Option<&str>,
    all: bool,
) -> Result<(), String> {
    let cli_modality = cli_modality.map(record::normalize_modality);
    for record in records.iter_mut() {
        if all || record.modality.is_none() {
            if let Some(m) = &cli_modality {
                record.modality = Some(m.clone());
            }
        }
    }
    match records.iter().find(|r| r.modality.is_none()) {
        Some(record) => Err(format!(
            "patient {} has no modality and none was given with --modality",
            record.id
        )),
        None => Ok(()),
    }
}

// dicom-ul's association teardown blocks in place, which needs the
// multi-threaded runtime.
#[tokio::main]
async fn main() -> ExitCode {
    let app = App::parse();
    init_logging(app.verbose);
    run(app).await
}

async fn run(app: App) -> ExitCode {
    let mut records = match record::read_patient_records(&app.patient_list) {
        Ok(records) => records,
        Err(e) => {
            error!("{}", Report::from_error(e));
            return ExitCode::from(EXIT_LIST_UNREADABLE);
        }
    };
    if records.is_empty() {
        error!("{} contains no usable records", app.patient_list.display());
        return ExitCode::from(EXIT_EMPTY_LIST);
    }
    if app.extend_months > 0 {
        for record in &mut records {
            record.study_date = record::extend_date_range(&record.study_date, app.extend_months);
        }
    }
    if let Err(message) = apply_modality(&mut records, app.modality.as_deref(), app.modality_all) {
        error!("{}", message);
        return ExitCode::from(EXIT_NO_MODALITY);
    }

    let (tag_columns, extra_tags) = match find::dump_tag_columns(&app.tags) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("{}", Report::from_error(e));
            return ExitCode::from(1);
        }
    };

    let self_delivery = app.retrieve_files && app.move_destination.is_none();
    if self_delivery && app.retrieve_port == 0 {
        error!("--retrieve-files needs either --retrieve-port or --aem");
        return ExitCode::from(1);
    }
    if app.retrieve_files {
        if let Err(e) = std::fs::create_dir_all(&app.out_dir) {
            error!("cannot create output directory {}: {}", app.out_dir.display(), e);
            return ExitCode::from(1);
        }
    }

    let listener: Option<TcpListener> = if self_delivery {
        match association::bind_listener(app.retrieve_port).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!("{}", Report::from_error(e));
                return ExitCode::from(EXIT_NETWORK_INIT);
            }
        }
    } else {
        None
    };

    let connect_config = ConnectConfig {
        addr: format!("{}:{}", app.host, app.port),
        calling_ae_title: app.calling_ae_title.clone(),
        called_ae_title: app.called_ae_title.clone(),
        max_pdu_length: app.max_pdu_length,
    };
    let mut primary = match association::connect(&connect_config).await {
        Ok(primary) => primary,
        Err(e) => {
            let code = exit_for_error(&e);
            error!("{}", Report::from_error(e));
            return ExitCode::from(code);
        }
    };

    let dimse_timeout = if app.timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(app.timeout_secs))
    };
    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();

    let mut fatal: Option<(u8, CloseOutcome)> = None;

    // query phase
    for record in &mut records {
        match find::find_studies(&mut primary, record, app.cancel_after, dimse_timeout).await {
            Ok(status) => {
                if record.study_uids.is_empty() {
                    println!("{}, {} - NOT FOUND", record.id, record.study_date);
                } else {
                    println!(
                        "{}, {} - {} study(ies)",
                        record.id,
                        record.study_date,
                        record.study_uids.len()
                    );
                }
                if !matches!(status, dimse::STATUS_SUCCESS | dimse::STATUS_CANCELLED) {
                    warn!(
                        "query for patient {} ended with status {:#06X}",
                        record.id, status
                    );
                }
            }
            Err(e) => {
                let code = exit_for_error(&e);
                let outcome = close_outcome_for_error(&e);
                error!("{}", Report::from_error(e));
                fatal = Some((code, outcome));
                break;
            }
        }
    }

    if !app.no_missing_file {
        if let Err(e) = write_missing_report(&timestamp, &records) {
            warn!("could not write missing-studies report: {}", e);
        }
    }

    // series tag dump phase
    if app.retrieve_tags && fatal.is_none() {
        if let Err(e) = dump_tags(
            &mut primary,
            &records,
            &app.dump_path,
            &tag_columns,
            &extra_tags,
            &timestamp,
            dimse_timeout,
        )
        .await
        {
            let code = exit_for_error(&e);
            let outcome = close_outcome_for_error(&e);
            error!("{}", Report::from_error(e));
            fatal = Some((code, outcome));
        }
    }

    // retrieval phase
    let mut severity = RunSeverity::default();
    if app.retrieve_files && fatal.is_none() {
        let move_config = MoveConfig {
            destination_aet: app
                .move_destination
                .clone()
                .unwrap_or_else(|| app.calling_ae_title.clone()),
            self_delivery,
            output_root: app.out_dir.clone(),
            sub_options: SubOptions {
                ae_title: app.calling_ae_title.clone(),
                max_pdu_length: app.max_pdu_length,
            },
            cancel_after: app.cancel_after,
            dimse_timeout,
            read_pending_identifiers: app.read_pending_identifiers,
        };
        let mut sub: Option<SubAssociation> = None;

        for (record, study_uid) in retrieve::studies_to_move(&records) {
            match retrieve::move_study(
                &mut primary,
                listener.as_ref(),
                &mut sub,
                record,
                study_uid,
                &move_config,
            )
            .await
            {
                Ok(outcome) => {
                    severity.note(outcome);
                    let verdict = match outcome {
                        StudyOutcome::Completed => "OK",
                        StudyOutcome::Warning => "WARNING",
                        StudyOutcome::Failed => "FAILED",
                    };
                    println!("{}, study {} - {}", record.id, study_uid, verdict);
                }
                Err(e) => {
                    let code = exit_for_error(&e);
                    let outcome = close_outcome_for_error(&e);
                    error!("{}", Report::from_error(e));
                    severity.escalate(RunSeverity::Error);
                    fatal = Some((code, outcome));
                    break;
                }
            }
        }
        // the peer normally releases the sub-association right after its
        // last store
        let linger = dimse_timeout.unwrap_or(Duration::from_secs(10));
        storescp::shutdown(&mut sub, &app.out_dir, linger).await;
    }

    let close_outcome = fatal.map(|(_, o)| o).unwrap_or(CloseOutcome::Normal);
    association::close(primary, close_outcome).await;

    if let Some((code, _)) = fatal {
        return ExitCode::from(code);
    }
    ExitCode::from(match severity {
        RunSeverity::Clean => 0,
        RunSeverity::Warning => EXIT_MOVE_WARNING,
        RunSeverity::Error => EXIT_MOVE_ERROR,
    })
}

/// `missing-studies-<timestamp>.txt`: one row per record without studies.
fn write_missing_report(timestamp: &str, records: &[PatientRecord]) -> std::io::Result<()> {
    let path = format!("missing-studies-{}.txt", timestamp);
    let mut file = std::fs::File::create(&path)?;
    record::write_missing_report(&mut file, timestamp, records)?;
    println!("missing-studies report written to {}", path);
    Ok(())
}

/// Series-level C-FIND per found study, appended as CSV rows.
async fn dump_tags(
    primary: &mut Primary,
    records: &[PatientRecord],
    dump_path: &str,
    columns: &[String],
    extra_tags: &[Tag],
    timestamp: &str,
    dimse_timeout: Option<Duration>,
) -> Result<(), Error> {
    let path = format!("{}-{}.csv", dump_path, timestamp);
    let mut file = match std::fs::File::create(&path) {
        Ok(file) => file,
        Err(e) => {
            warn!("could not create {}: {}", path, e);
            return Ok(());
        }
    };
    let mut header = String::from("PatientID;StudyInstanceUID;SeriesDescription");
    for raw in columns {
        header.push(';');
        header.push_str(raw);
    }
    if let Err(e) = writeln!(file, "{}", header) {
        warn!("could not write {}: {}", path, e);
        return Ok(());
    }

    for record in records {
        for study_uid in &record.study_uids {
            let identifier = find::series_identifier(study_uid, extra_tags);
            let mut handler = TagDumper {
                writer: &mut file,
                patient_id: &record.id,
                study_uid,
                extra_tags,
            };
            let status = find::run_find(primary, &identifier, &mut handler, dimse_timeout).await?;
            if !matches!(status, dimse::STATUS_SUCCESS | dimse::STATUS_CANCELLED) {
                warn!(
                    "series query for study {} ended with status {:#06X}",
                    study_uid, status
                );
            }
        }
    }
    println!("tag dump written to {}", path);
    Ok(())
}
