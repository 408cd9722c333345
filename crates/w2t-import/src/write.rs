use crate::plan::{GroupPlan, ImportBatch};
use crate::ImportError;
use std::collections::BTreeSet;
use tracing::{info, warn};
use w2t_core::codes::{
    CodeTranslator, FILE_CLASS_DAMAGE, FILE_CLASS_MAINTENANCE_EVENT, FILE_KIND_PICTURE,
    FILE_KIND_VIDEO,
};
use w2t_core::config::ImportConfig;
use w2t_core::{CancelToken, MediaKind};
use w2t_network::{fields, Feature, NetworkStore};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub groups_written: usize,
    pub events_written: usize,
    pub damages_written: usize,
    pub files_written: usize,
    pub joins_written: usize,
    pub conditions_updated: usize,
    pub groups_skipped_empty: usize,
}

/// Persists a planned batch inside a single edit scope. Either the whole
/// batch lands or none of it does.
pub struct ImportWriter<'a, S: NetworkStore, T: CodeTranslator> {
    store: &'a mut S,
    translator: &'a T,
    config: &'a ImportConfig,
    cancel: &'a CancelToken,
}

impl<'a, S: NetworkStore, T: CodeTranslator> ImportWriter<'a, S, T> {
    pub fn new(
        store: &'a mut S,
        translator: &'a T,
        config: &'a ImportConfig,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            store,
            translator,
            config,
            cancel,
        }
    }

    pub fn write(&mut self, batch: &ImportBatch) -> Result<ImportReport, ImportError> {
        let mut layers = vec![
            self.config.join_layer.as_str(),
            self.config.file_layer.as_str(),
            self.config.damage_layer.as_str(),
            self.config.maintenance_layer.as_str(),
        ];
        if self.store.has_layer(&self.config.structure_layer)? {
            layers.push(self.config.structure_layer.as_str());
        }
        self.store.begin_edit(&layers)?;

        match self.write_groups(batch) {
            Ok(report) => {
                self.store.commit_edit()?;
                info!(
                    groups = report.groups_written,
                    damages = report.damages_written,
                    "import committed"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback_edit() {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    fn write_groups(&mut self, batch: &ImportBatch) -> Result<ImportReport, ImportError> {
        let mut report = ImportReport::default();
        for group in &batch.groups {
            if self.cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            if group.damages.is_empty() {
                report.groups_skipped_empty += 1;
                continue;
            }
            self.write_group(batch, group, &mut report)?;
            report.groups_written += 1;
        }
        Ok(report)
    }

    fn write_group(
        &mut self,
        batch: &ImportBatch,
        group: &GroupPlan,
        report: &mut ImportReport,
    ) -> Result<(), ImportError> {
        let mut event = group.event.clone();
        let event_id = event.obj_id().unwrap_or_default().to_string();

        // All damages of one structure share the inspection video, so the
        // event carries the (distinct) video names and one file record each.
        let mut videos: BTreeSet<&str> = BTreeSet::new();
        for damage in &group.damages {
            for media in &damage.media {
                if media.kind == MediaKind::Video {
                    videos.insert(media.filename.as_str());
                }
            }
        }
        if !videos.is_empty() {
            let joined = videos.iter().copied().collect::<Vec<_>>().join(", ");
            event.set("videonumber", joined);
        }
        for video in &videos {
            self.write_file_record(
                &event_id,
                FILE_CLASS_MAINTENANCE_EVENT,
                FILE_KIND_VIDEO,
                video,
                &batch.data_path.join("Video").join("Sec"),
            )?;
            report.files_written += 1;
        }
        self.store.add_feature(&self.config.maintenance_layer, &event)?;
        report.events_written += 1;

        for damage in &group.damages {
            let mut feature = damage.feature.clone();
            feature.set(fields::FK_EXAMINATION, event_id.as_str());
            self.store.add_feature(&self.config.damage_layer, &feature)?;
            report.damages_written += 1;

            let damage_id = feature.obj_id().unwrap_or_default().to_string();
            for media in &damage.media {
                let (kind, subdir) = match media.kind {
                    MediaKind::Picture => (FILE_KIND_PICTURE, "Picture"),
                    MediaKind::Video => (FILE_KIND_VIDEO, "Video"),
                };
                self.write_file_record(
                    &damage_id,
                    FILE_CLASS_DAMAGE,
                    kind,
                    &media.filename,
                    &batch.data_path.join(subdir).join("Sec"),
                )?;
                report.files_written += 1;
            }
        }

        let join = Feature::new()
            .with(
                fields::OBJ_ID,
                self.store.generate_object_id(&self.config.join_layer)?,
            )
            .with(fields::FK_WASTEWATER_STRUCTURE, group.structure_id.as_str())
            .with(fields::FK_MAINTENANCE_EVENT, event_id.as_str());
        self.store.add_feature(&self.config.join_layer, &join)?;
        report.joins_written += 1;

        if self.update_condition(group)? {
            report.conditions_updated += 1;
        }
        Ok(())
    }

    fn write_file_record(
        &mut self,
        object_id: &str,
        class: i64,
        kind: i64,
        filename: &str,
        directory: &std::path::Path,
    ) -> Result<(), ImportError> {
        let record = Feature::new()
            .with(
                fields::OBJ_ID,
                self.store.generate_object_id(&self.config.file_layer)?,
            )
            .with("class", class)
            .with("kind", kind)
            .with("object", object_id)
            .with("identifier", filename)
            .with("path_relative", directory.to_string_lossy().into_owned());
        self.store.add_feature(&self.config.file_layer, &record)?;
        Ok(())
    }

    /// Lower the stored structure condition when this inspection found a
    /// strictly worse state. A better state never overwrites a worse one.
    fn update_condition(&mut self, group: &GroupPlan) -> Result<bool, ImportError> {
        if !self.store.has_layer(&self.config.structure_layer)? {
            return Ok(false);
        }
        let Some(structure) = self
            .store
            .feature_by_id(&self.config.structure_layer, &group.structure_id)?
        else {
            warn!(structure = group.structure_id, "structure not found for condition update");
            return Ok(false);
        };

        let old_rate = structure
            .as_i64(fields::STRUCTURE_CONDITION)
            .and_then(|condition| self.translator.rate_from_condition(condition));
        let worse = match old_rate {
            Some(old) => group.condition_rate < old,
            None => true,
        };
        if !worse {
            return Ok(false);
        }
        let Some(condition) = self.translator.condition_from_rate(group.condition_rate) else {
            return Ok(false);
        };

        let patch = Feature::new()
            .with(fields::OBJ_ID, group.structure_id.as_str())
            .with(fields::STRUCTURE_CONDITION, condition);
        self.store
            .update_feature(&self.config.structure_layer, &patch)?;
        Ok(true)
    }
}
