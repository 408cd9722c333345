use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod codes;
pub mod config;

/// One point-in-time read of a legacy survey file, plus the companion files
/// located next to it. The graph is mutated in place by matching and by user
/// selection, then discarded after one import pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyData {
    pub file: PathBuf,
    pub meta_file: Option<PathBuf>,
    pub pdf_file: Option<PathBuf>,
    /// Root under which the media directories (`Picture/Sec`, `Video/Sec`)
    /// live; the grandparent of the survey file by convention.
    pub data_path: PathBuf,
    pub projects: Vec<Project>,
}

impl SurveyData {
    pub fn project(&self, pk: &str) -> Option<&Project> {
        self.projects.iter().find(|project| project.pk == pk)
    }

    pub fn project_mut(&mut self, pk: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|project| project.pk == pk)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub pk: String,
    pub name: String,
    /// User-supplied channel-name label scoping the channel search.
    pub channel: String,
    /// Sections in discovery order. The order is meaningful: the
    /// use-previous-section offset logic walks backward through it.
    pub sections: Vec<Section>,
}

impl Project {
    pub fn section(&self, pk: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.pk == pk)
    }

    pub fn section_mut(&mut self, pk: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|section| section.pk == pk)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub pk: String,
    pub counter: i64,
    pub from_node: String,
    pub to_node: String,
    pub pipe_dia: Option<f64>,
    pub pipe_material: Option<String>,
    pub profile: Option<String>,
    pub pipe_width: Option<f64>,
    pub section_length: f64,
    pub section_use: Option<String>,
    pub address: Option<String>,
    /// A single legacy section may span up to three reach features in the
    /// target network; ids are filled left to right, no gaps.
    pub teksi_channel_id_1: Option<String>,
    pub teksi_channel_id_2: Option<String>,
    pub teksi_channel_id_3: Option<String>,
    /// This section has no geometry of its own and continues the previous
    /// section's matched channel with an accumulated distance offset.
    pub use_previous_section: bool,
    pub import: bool,
    pub inspections: Vec<Inspection>,
}

impl Section {
    /// Matched channel ids in order, stopping at the first unset slot.
    pub fn matched_channel_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        for id in [
            &self.teksi_channel_id_1,
            &self.teksi_channel_id_2,
            &self.teksi_channel_id_3,
        ] {
            match id {
                Some(id) => ids.push(id.as_str()),
                None => break,
            }
        }
        ids
    }

    pub fn is_matched(&self) -> bool {
        self.teksi_channel_id_1.is_some() || self.use_previous_section
    }

    /// Whether this section would block an import pass: it is ready when it
    /// is matched, or when none of its inspections asks to be imported.
    pub fn is_ready(&self) -> bool {
        self.is_matched() || !self.inspections.iter().any(|inspection| inspection.import)
    }

    pub fn wants_import(&self) -> bool {
        self.import && self.inspections.iter().any(|inspection| inspection.import)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inspection {
    pub pk: String,
    pub name: String,
    /// Operator key, resolved from the companion metadata store when that
    /// store is present; otherwise the raw legacy identifier.
    pub operator: Option<String>,
    pub start_date: Option<NaiveDateTime>,
    /// 1 = downstream (reference point is the reach's from end).
    pub direction: i64,
    pub import: bool,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub pk: String,
    /// Distance along the section, in the section's own coordinate frame.
    pub distance: f64,
    pub code: Option<String>,
    pub rate: Option<i64>,
    pub text: Option<String>,
    pub mpeg_position: Option<String>,
    pub media: Vec<MediaRef>,
    pub import: bool,
    /// Bypass the distance-bounds validation for this observation.
    pub force_import: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Picture,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub filename: String,
}

/// Cooperative cancellation flag, polled at section and group boundaries.
/// Once observed, an in-progress pass unwinds completely.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section() -> Section {
        Section {
            pk: "sec-1".to_string(),
            counter: 1,
            from_node: "MH12".to_string(),
            to_node: "MH13".to_string(),
            pipe_dia: Some(250.0),
            pipe_material: None,
            profile: None,
            pipe_width: None,
            section_length: 42.0,
            section_use: None,
            address: None,
            teksi_channel_id_1: None,
            teksi_channel_id_2: None,
            teksi_channel_id_3: None,
            use_previous_section: false,
            import: true,
            inspections: Vec::new(),
        }
    }

    fn inspection(import: bool) -> Inspection {
        Inspection {
            pk: "ins-1".to_string(),
            name: "I1".to_string(),
            operator: None,
            start_date: None,
            direction: 1,
            import,
            observations: Vec::new(),
        }
    }

    #[test]
    fn matched_channel_ids_stop_at_first_unset_slot() {
        let mut section = section();
        section.teksi_channel_id_1 = Some("ch-a".to_string());
        section.teksi_channel_id_3 = Some("ch-c".to_string());
        assert_eq!(section.matched_channel_ids(), vec!["ch-a"]);

        section.teksi_channel_id_2 = Some("ch-b".to_string());
        assert_eq!(section.matched_channel_ids(), vec!["ch-a", "ch-b", "ch-c"]);
    }

    #[test]
    fn readiness_tracks_matching_and_inspection_selection() {
        let mut section = section();
        assert!(section.is_ready(), "no inspections ask for import");

        section.inspections.push(inspection(true));
        assert!(!section.is_ready(), "unmatched with a selected inspection");

        section.use_previous_section = true;
        assert!(section.is_ready());

        section.use_previous_section = false;
        section.teksi_channel_id_1 = Some("ch-a".to_string());
        assert!(section.is_ready());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
