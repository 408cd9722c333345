use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use w2t_core::{Inspection, MediaKind, MediaRef, Observation, Project, Section, SurveyData};

/// Observation codes that are deselected by default; the user can still
/// re-enable them before the import pass.
const DEFAULT_SKIP_CODES: &[&str] = &["BCD"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d.%m.%Y %H:%M:%S"];

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("survey file {path} does not exist")]
    FileNotFound { path: PathBuf },
    #[error("invalid survey file {path}: {detail}")]
    InvalidSourceFile { path: PathBuf, detail: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadReport {
    pub projects: usize,
    pub sections: usize,
    pub inspections: usize,
    pub observations: usize,
    pub media_files: usize,
    pub sections_without_inspections: usize,
    pub inspections_without_observations: usize,
    pub unresolved_nodes: usize,
    pub meta_store_loaded: bool,
    pub document_found: bool,
}

#[derive(Debug)]
pub struct ReadOutcome {
    pub data: SurveyData,
    pub report: ReadReport,
}

/// Read one legacy survey database into a fully populated entity graph.
///
/// Companion files are located by convention next to the survey file: a
/// `<stem>_meta.<ext>` operator store and a `../Misc/Docu/<stem>.pdf`
/// report document. Both are optional; their absence is logged, never fatal.
/// Soft-deleted rows (non-NULL deletion marker) are filtered everywhere.
pub fn read_survey(file: impl AsRef<Path>) -> Result<ReadOutcome, ReaderError> {
    let file = file.as_ref();
    if !file.exists() {
        return Err(ReaderError::FileNotFound {
            path: file.to_path_buf(),
        });
    }

    let mut report = ReadReport::default();
    let stem = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    let meta_path = meta_path_for(file, &stem);
    let operators = if meta_path.exists() {
        report.meta_store_loaded = true;
        info!(path = %meta_path.display(), "reading operator metadata store");
        read_operators(&meta_path)
    } else {
        warn!(path = %meta_path.display(), "metadata store does not exist");
        BTreeMap::new()
    };

    let data_path = file
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let pdf_path = data_path.join("Misc").join("Docu").join(format!("{stem}.pdf"));
    let pdf_file = if pdf_path.exists() {
        report.document_found = true;
        Some(pdf_path)
    } else {
        warn!(path = %pdf_path.display(), "report document does not exist");
        None
    };

    let conn = Connection::open_with_flags(
        file,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    // One batch pre-load instead of a lookup query per section endpoint.
    let nodes = read_nodes(&conn);

    let mut projects = read_projects(&conn, file)?;
    for project in &mut projects {
        info!(project = %project.name, pk = %project.pk, "processing project");
        read_sections(&conn, project, &nodes, &operators, &mut report)?;
        info!(
            project = %project.name,
            sections = project.sections.len(),
            "finished project"
        );
    }
    report.projects = projects.len();

    Ok(ReadOutcome {
        data: SurveyData {
            file: file.to_path_buf(),
            meta_file: report.meta_store_loaded.then_some(meta_path),
            pdf_file,
            data_path,
            projects,
        },
        report,
    })
}

fn meta_path_for(file: &Path, stem: &str) -> PathBuf {
    let name = match file.extension() {
        Some(ext) => format!("{stem}_meta.{}", ext.to_string_lossy()),
        None => format!("{stem}_meta"),
    };
    file.with_file_name(name)
}

fn read_operators(path: &Path) -> BTreeMap<String, String> {
    let mut operators = BTreeMap::new();
    let result = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .and_then(|conn| {
        let mut stmt = conn.prepare("SELECT OP_PK, OP_Key FROM OPERATOR")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            // OP_Key, not OP_Name1: the name column is unreliably filled.
            if let (Some(pk), Some(key)) = (get_string(row, 0), get_string(row, 1)) {
                operators.insert(pk, key);
            }
        }
        Ok(())
    });
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "could not read operator table");
    }
    operators
}

fn read_nodes(conn: &Connection) -> BTreeMap<String, String> {
    let mut nodes = BTreeMap::new();
    let result = (|| -> Result<(), rusqlite::Error> {
        let mut stmt =
            conn.prepare("SELECT OBJ_PK, OBJ_Key FROM NODE WHERE OBJ_Deleted IS NULL")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            if let (Some(pk), Some(key)) = (get_string(row, 0), get_string(row, 1)) {
                nodes.insert(pk, key);
            }
        }
        Ok(())
    })();
    if let Err(err) = result {
        warn!(error = %err, "could not read node table, labels stay unresolved");
    }
    nodes
}

fn read_projects(conn: &Connection, file: &Path) -> Result<Vec<Project>, ReaderError> {
    let mut stmt = conn
        .prepare("SELECT PRJ_PK, PRJ_Name FROM PROJECT WHERE PRJ_Deleted IS NULL")
        .map_err(|err| ReaderError::InvalidSourceFile {
            path: file.to_path_buf(),
            detail: err.to_string(),
        })?;
    let mut rows = stmt.query([]).map_err(|err| ReaderError::InvalidSourceFile {
        path: file.to_path_buf(),
        detail: err.to_string(),
    })?;

    let mut projects = Vec::new();
    while let Some(row) = rows.next()? {
        let Some(pk) = get_string(row, 0) else {
            continue;
        };
        projects.push(Project {
            pk,
            name: get_string(row, 1).unwrap_or_default(),
            channel: String::new(),
            sections: Vec::new(),
        });
    }
    Ok(projects)
}

fn read_sections(
    conn: &Connection,
    project: &mut Project,
    nodes: &BTreeMap<String, String>,
    operators: &BTreeMap<String, String>,
    report: &mut ReadReport,
) -> Result<(), ReaderError> {
    let mut stmt = conn.prepare(
        "SELECT OBJ_PK, OBJ_Counter, OBJ_FromNode_FK, OBJ_ToNode_FK, OBJ_Size1, OBJ_Size2, \
         OBJ_Material, OBJ_Profile, OBJ_Length, OBJ_Medium, OBJ_Street \
         FROM SECTION WHERE OBJ_Project_FK = ?1 AND OBJ_Deleted IS NULL \
         ORDER BY OBJ_Counter",
    )?;
    let mut rows = stmt.query([&project.pk])?;

    while let Some(row) = rows.next()? {
        let Some(pk) = get_string(row, 0) else {
            continue;
        };
        let from_pk = get_string(row, 2).unwrap_or_default();
        let to_pk = get_string(row, 3).unwrap_or_default();
        let mut section = Section {
            pk,
            counter: get_i64(row, 1).unwrap_or_default(),
            from_node: resolve_node(nodes, from_pk, report),
            to_node: resolve_node(nodes, to_pk, report),
            pipe_dia: get_f64(row, 4),
            pipe_width: get_f64(row, 5),
            pipe_material: get_string(row, 6),
            profile: get_string(row, 7),
            section_length: get_f64(row, 8).unwrap_or_default(),
            section_use: get_string(row, 9),
            address: get_string(row, 10),
            teksi_channel_id_1: None,
            teksi_channel_id_2: None,
            teksi_channel_id_3: None,
            use_previous_section: false,
            import: true,
            inspections: Vec::new(),
        };
        debug!(
            section = section.counter,
            from = %section.from_node,
            to = %section.to_node,
            "found section"
        );

        read_inspections(conn, &mut section, operators, report)?;
        if section.inspections.is_empty() {
            warn!(
                section = section.counter,
                project = %project.name,
                "no inspections found for section"
            );
            report.sections_without_inspections += 1;
        }
        report.sections += 1;
        project.sections.push(section);
    }
    Ok(())
}

fn resolve_node(nodes: &BTreeMap<String, String>, pk: String, report: &mut ReadReport) -> String {
    match nodes.get(&pk) {
        Some(key) => key.clone(),
        None => {
            warn!(node_pk = %pk, "node key not found, keeping raw identifier");
            report.unresolved_nodes += 1;
            pk
        }
    }
}

fn read_inspections(
    conn: &Connection,
    section: &mut Section,
    operators: &BTreeMap<String, String>,
    report: &mut ReadReport,
) -> Result<(), ReaderError> {
    let mut stmt = conn.prepare(
        "SELECT INS_PK, INS_Key, INS_Operator, INS_InspectionDate, INS_Direction \
         FROM SECINSP WHERE INS_Section_FK = ?1 AND INS_Deleted IS NULL",
    )?;
    let mut rows = stmt.query([&section.pk])?;

    while let Some(row) = rows.next()? {
        let Some(pk) = get_string(row, 0) else {
            continue;
        };
        let operator = get_string(row, 2)
            .map(|raw| operators.get(&raw).cloned().unwrap_or(raw));
        let mut inspection = Inspection {
            pk,
            name: get_string(row, 1).unwrap_or_default(),
            operator,
            start_date: get_string(row, 3).as_deref().and_then(parse_timestamp),
            direction: get_i64(row, 4).unwrap_or(1),
            import: true,
            observations: Vec::new(),
        };
        debug!(inspection = %inspection.name, section = section.counter, "found inspection");

        read_observations(conn, &mut inspection, report)?;
        if inspection.observations.is_empty() {
            warn!(
                inspection = %inspection.name,
                section = section.counter,
                "no observations found for inspection"
            );
            report.inspections_without_observations += 1;
        }
        report.inspections += 1;
        section.inspections.push(inspection);
    }
    Ok(())
}

fn read_observations(
    conn: &Connection,
    inspection: &mut Inspection,
    report: &mut ReadReport,
) -> Result<(), ReaderError> {
    let mut stmt = conn.prepare(
        "SELECT OBS_PK, OBS_Distance, OBS_OpCode, OBS_Rate, OBS_Observation, OBS_MPEGPosition \
         FROM SECOBS WHERE OBS_Inspection_FK = ?1 AND OBS_Deleted IS NULL \
         ORDER BY OBS_Distance",
    )?;
    let mut rows = stmt.query([&inspection.pk])?;

    while let Some(row) = rows.next()? {
        let Some(pk) = get_string(row, 0) else {
            continue;
        };
        let code = get_string(row, 2);
        let import = code
            .as_deref()
            .map_or(true, |code| !DEFAULT_SKIP_CODES.contains(&code));
        let mut observation = Observation {
            pk,
            distance: get_f64(row, 1).unwrap_or_default(),
            code,
            rate: get_i64(row, 3),
            text: get_string(row, 4),
            mpeg_position: get_string(row, 5),
            media: Vec::new(),
            import,
            force_import: false,
        };

        read_media(conn, &mut observation, report)?;
        report.observations += 1;
        inspection.observations.push(observation);
    }
    Ok(())
}

fn read_media(
    conn: &Connection,
    observation: &mut Observation,
    report: &mut ReadReport,
) -> Result<(), ReaderError> {
    let mut stmt = conn.prepare(
        "SELECT OMM_Type, OMM_FileName \
         FROM SECOBSMM WHERE OMM_Observation_FK = ?1 AND OMM_Deleted IS NULL",
    )?;
    let mut rows = stmt.query([&observation.pk])?;

    while let Some(row) = rows.next()? {
        let Some(filename) = get_string(row, 1) else {
            continue;
        };
        let kind = match get_string(row, 0).as_deref() {
            Some("PI1") | Some("PI2") => MediaKind::Picture,
            _ => MediaKind::Video,
        };
        observation.media.push(MediaRef { kind, filename });
        report.media_files += 1;
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

// Legacy columns have loose typing; coerce whatever is stored into the
// type the entity expects instead of failing on a single odd cell.

fn get_string(row: &Row, index: usize) -> Option<String> {
    match row.get_ref(index).ok()? {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Text(value) => Some(String::from_utf8_lossy(value).into_owned()),
        ValueRef::Blob(_) => None,
    }
}

fn get_i64(row: &Row, index: usize) -> Option<i64> {
    match row.get_ref(index).ok()? {
        ValueRef::Integer(value) => Some(value),
        ValueRef::Real(value) => Some(value as i64),
        ValueRef::Text(value) => String::from_utf8_lossy(value).trim().parse().ok(),
        _ => None,
    }
}

fn get_f64(row: &Row, index: usize) -> Option<f64> {
    match row.get_ref(index).ok()? {
        ValueRef::Integer(value) => Some(value as f64),
        ValueRef::Real(value) => Some(value),
        ValueRef::Text(value) => String::from_utf8_lossy(value).trim().parse().ok(),
        _ => None,
    }
}
