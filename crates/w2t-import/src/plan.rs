use crate::ImportError;
use std::path::PathBuf;
use tracing::{debug, info};
use w2t_core::codes::{
    CodeDecision, CodeDecisionSource, CodeTranslator, InvalidCodeContext, DAMAGE_CLASS_UNKNOWN,
    MAINTENANCE_KIND_INSPECTION, MAINTENANCE_STATUS_ACCOMPLISHED, RATE_OK,
};
use w2t_core::config::ImportConfig;
use w2t_core::{CancelToken, Inspection, MediaRef, Section, SurveyData};
use w2t_network::{fields, Feature, NetworkStore};

/// One damage record waiting to be written, with its media references and
/// the raw severity it contributes to the condition rollup.
#[derive(Debug, Clone)]
pub struct DamagePlan {
    pub feature: Feature,
    pub media: Vec<MediaRef>,
    pub rate: Option<i64>,
}

/// Everything to be written for one matched wastewater structure: one
/// examination event, its damages, and the rolled-up worst condition.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub structure_id: String,
    pub event: Feature,
    pub damages: Vec<DamagePlan>,
    pub condition_rate: i64,
}

#[derive(Debug, Clone)]
pub struct ImportBatch {
    /// Root for the relative media paths (`Picture/Sec`, `Video/Sec`).
    pub data_path: PathBuf,
    pub groups: Vec<GroupPlan>,
}

impl ImportBatch {
    fn replace_group(&mut self, structure_id: String, event: Feature) {
        if let Some(group) = self
            .groups
            .iter_mut()
            .find(|group| group.structure_id == structure_id)
        {
            // A later section matched to the same structure supersedes the
            // pending event for it.
            group.event = event;
            group.damages.clear();
            group.condition_rate = RATE_OK;
        } else {
            self.groups.push(GroupPlan {
                structure_id,
                event,
                damages: Vec::new(),
                condition_rate: RATE_OK,
            });
        }
    }

    fn group_mut(&mut self, structure_id: &str) -> Option<&mut GroupPlan> {
        self.groups
            .iter_mut()
            .find(|group| group.structure_id == structure_id)
    }
}

/// Walks the user-finalized entity graph and builds the batch the writer
/// persists. Any hard-stop condition aborts the whole pass; no partial
/// batch ever reaches the writer.
pub struct ImportPlanner<'a, S: NetworkStore, T: CodeTranslator> {
    store: &'a S,
    translator: &'a T,
    config: &'a ImportConfig,
    cancel: &'a CancelToken,
}

impl<'a, S: NetworkStore, T: CodeTranslator> ImportPlanner<'a, S, T> {
    pub fn new(
        store: &'a S,
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

    pub fn plan(
        &self,
        data: &mut SurveyData,
        decisions: &mut dyn CodeDecisionSource,
    ) -> Result<ImportBatch, ImportError> {
        if !self.store.has_layer(&self.config.channel_layer)? {
            return Err(ImportError::LayerNotFound {
                layer: self.config.channel_layer.clone(),
            });
        }

        let mut batch = ImportBatch {
            data_path: data.data_path.clone(),
            groups: Vec::new(),
        };
        let base_data = data
            .pdf_file
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());
        // Blanket decisions live exactly as long as one planning pass.
        let mut skip_all_invalid = false;

        for project in &mut data.projects {
            self.plan_project(
                project,
                base_data.as_deref(),
                &mut batch,
                &mut skip_all_invalid,
                decisions,
            )?;
        }
        info!(groups = batch.groups.len(), "planned import batch");
        Ok(batch)
    }

    fn plan_project(
        &self,
        project: &mut w2t_core::Project,
        base_data: Option<&str>,
        batch: &mut ImportBatch,
        skip_all_invalid: &mut bool,
        decisions: &mut dyn CodeDecisionSource,
    ) -> Result<(), ImportError> {
        let mut previous_imported = true;
        // Matched reach features carry over from the last geometry-owning
        // section, so a use-previous-section continuation lands on them.
        let mut reaches: Vec<Feature> = Vec::new();

        for s_idx in 0..project.sections.len() {
            if self.cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            if !project.sections[s_idx].import {
                previous_imported = false;
                continue;
            }

            for i_idx in 0..project.sections[s_idx].inspections.len() {
                if !project.sections[s_idx].inspections[i_idx].import {
                    continue;
                }

                let mut distance_offset = 0.0;
                if !project.sections[s_idx].use_previous_section {
                    previous_imported = true;
                    let section = &project.sections[s_idx];
                    reaches = self.resolve_reaches(section)?;
                    let inspection = &section.inspections[i_idx];
                    for reach in &reaches {
                        let structure_id = reach
                            .as_str(fields::WS_OBJ_ID)
                            .unwrap_or_default()
                            .to_string();
                        let event =
                            self.examination_event(section, inspection, reach, base_data)?;
                        batch.replace_group(structure_id, event);
                    }
                } else {
                    if !previous_imported {
                        return Err(section_error(
                            &project.sections[s_idx],
                            ImportErrorKind::PreviousSectionUndefined,
                        ));
                    }
                    distance_offset =
                        backward_offset(&project.sections, s_idx)?;
                    info!(
                        section = project.sections[s_idx].counter,
                        offset = distance_offset,
                        "continuing previous section"
                    );
                }

                self.plan_observations(
                    project,
                    s_idx,
                    i_idx,
                    distance_offset,
                    &reaches,
                    batch,
                    skip_all_invalid,
                    decisions,
                )?;
            }
        }
        Ok(())
    }

    fn resolve_reaches(&self, section: &Section) -> Result<Vec<Feature>, ImportError> {
        let mut reaches = Vec::new();
        for obj_id in section.matched_channel_ids() {
            match self
                .store
                .feature_by_id(&self.config.channel_layer, obj_id)?
            {
                Some(feature) => reaches.push(feature),
                None => {
                    return Err(ImportError::UnknownChannel {
                        section: section.counter,
                        from_node: section.from_node.clone(),
                        to_node: section.to_node.clone(),
                        obj_id: obj_id.to_string(),
                    })
                }
            }
        }
        if reaches.is_empty() {
            return Err(section_error(section, ImportErrorKind::MissingChannel));
        }
        Ok(reaches)
    }

    fn examination_event(
        &self,
        section: &Section,
        inspection: &Inspection,
        reach: &Feature,
        base_data: Option<&str>,
    ) -> Result<Feature, ImportError> {
        let mut event = Feature::new()
            .with(
                fields::OBJ_ID,
                self.store
                    .generate_object_id(&self.config.maintenance_layer)?,
            )
            .with("maintenance_event_type", "examination")
            .with("kind", MAINTENANCE_KIND_INSPECTION)
            .with("remark", "")
            .with("status", MAINTENANCE_STATUS_ACCOMPLISHED)
            .with("inspected_length", section.section_length);
        if let Some(operator) = &inspection.operator {
            event.set("operator", operator.as_str());
        }
        if let Some(start_date) = inspection.start_date {
            event.set(
                "time_point",
                start_date.format("%Y-%m-%d %H:%M:%S").to_string(),
            );
        }
        if let Some(base_data) = base_data {
            event.set("base_data", base_data);
        }
        if let Some(company) = &self.config.operating_company {
            event.set("fk_operating_company", company.as_str());
        }
        // Direction decides which end of the reach anchors the distances.
        let reach_point = if inspection.direction == 1 {
            reach.as_str(fields::RP_FROM_OBJ_ID)
        } else {
            reach.as_str(fields::RP_TO_OBJ_ID)
        };
        if let Some(reach_point) = reach_point {
            event.set("fk_reach_point", reach_point);
        }
        Ok(event)
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_observations(
        &self,
        project: &mut w2t_core::Project,
        s_idx: usize,
        i_idx: usize,
        distance_offset: f64,
        reaches: &[Feature],
        batch: &mut ImportBatch,
        skip_all_invalid: &mut bool,
        decisions: &mut dyn CodeDecisionSource,
    ) -> Result<(), ImportError> {
        let mut reach_index = 0usize;
        // Effective length already consumed by earlier segments; distances
        // are consumed monotonically, never re-wound.
        let mut consumed = 0.0_f64;

        for o_idx in 0..project.sections[s_idx].inspections[i_idx].observations.len() {
            let section = &project.sections[s_idx];
            let observation = &section.inspections[i_idx].observations[o_idx];
            if !observation.import {
                continue;
            }
            if reaches.is_empty() {
                return Err(section_error(section, ImportErrorKind::MissingChannel));
            }

            let mut distance = observation.distance + distance_offset - consumed;
            if !observation.force_import {
                loop {
                    let effective = reaches[reach_index]
                        .as_f64(fields::LENGTH_EFFECTIVE)
                        .unwrap_or_default();
                    if distance <= effective {
                        break;
                    }
                    if reach_index < reaches.len() - 1 {
                        distance -= effective;
                        consumed += effective;
                        reach_index += 1;
                    } else if distance <= effective + self.config.tolerance_channel_length {
                        break;
                    } else {
                        return Err(section_error(
                            section,
                            ImportErrorKind::ObservationOutOfBounds,
                        ));
                    }
                }
            }

            let damage_class = observation
                .rate
                .and_then(|rate| self.translator.damage_class(rate));
            let damage_code = observation
                .code
                .as_deref()
                .and_then(|code| self.translator.damage_code(code));
            let rate_valid = damage_class.is_some();
            let code_valid = damage_code.is_some();
            let mut damage_class = damage_class;

            if !rate_valid || !code_valid {
                if *skip_all_invalid {
                    project.sections[s_idx].inspections[i_idx].observations[o_idx].import = false;
                    continue;
                }
                let context = InvalidCodeContext {
                    section_counter: section.counter,
                    from_node: section.from_node.clone(),
                    to_node: section.to_node.clone(),
                    code: observation.code.clone(),
                    rate: observation.rate,
                    code_valid,
                    rate_valid,
                };
                match decisions.resolve_invalid_code(&context) {
                    CodeDecision::Abort => {
                        return Err(section_error(section, ImportErrorKind::Aborted));
                    }
                    CodeDecision::Skip => {
                        project.sections[s_idx].inspections[i_idx].observations[o_idx].import =
                            false;
                        continue;
                    }
                    CodeDecision::SkipAll => {
                        *skip_all_invalid = true;
                        project.sections[s_idx].inspections[i_idx].observations[o_idx].import =
                            false;
                        continue;
                    }
                    CodeDecision::Accept => {
                        if !rate_valid {
                            damage_class = Some(DAMAGE_CLASS_UNKNOWN);
                        }
                    }
                }
            }

            let section = &project.sections[s_idx];
            let observation = &section.inspections[i_idx].observations[o_idx];
            let mut damage = Feature::new()
                .with(
                    fields::OBJ_ID,
                    self.store.generate_object_id(&self.config.damage_layer)?,
                )
                .with("damage_type", "channel")
                .with("distance", distance);
            if let Some(text) = &observation.text {
                damage.set("comments", text.as_str());
            }
            if let Some(damage_class) = damage_class {
                damage.set("single_damage_class", damage_class);
            }
            if let Some(damage_code) = damage_code {
                damage.set("channel_damage_code", damage_code);
            }
            if let Some(position) = &observation.mpeg_position {
                damage.set("video_counter", position.as_str());
            }

            let structure_id = reaches[reach_index]
                .as_str(fields::WS_OBJ_ID)
                .unwrap_or_default();
            let Some(group) = batch.group_mut(structure_id) else {
                // A continuation landed on a structure whose owning section
                // never produced an event.
                return Err(section_error(
                    section,
                    ImportErrorKind::PreviousSectionUndefined,
                ));
            };
            debug!(
                section = section.counter,
                structure = structure_id,
                distance,
                "planned damage"
            );
            group.damages.push(DamagePlan {
                feature: damage,
                media: observation.media.clone(),
                rate: observation.rate,
            });
            if let Some(rate) = observation.rate {
                group.condition_rate = group.condition_rate.min(rate);
            }
        }
        Ok(())
    }
}

/// Accumulate the negative offset for a continuation section by walking
/// backward over its flagged predecessors until a section owning real
/// geometry is found. A flagged first section or a non-imported link in the
/// chain is a hard stop.
fn backward_offset(sections: &[Section], start: usize) -> Result<f64, ImportError> {
    let mut offset = 0.0;
    let mut index = start;
    while sections[index].use_previous_section {
        if index == 0 {
            return Err(section_error(
                &sections[start],
                ImportErrorKind::PreviousSectionUndefined,
            ));
        }
        offset -= sections[index].section_length;
        index -= 1;
        if !sections[index].import {
            return Err(section_error(
                &sections[start],
                ImportErrorKind::PreviousSectionUndefined,
            ));
        }
    }
    Ok(offset)
}

enum ImportErrorKind {
    MissingChannel,
    PreviousSectionUndefined,
    ObservationOutOfBounds,
    Aborted,
}

fn section_error(section: &Section, kind: ImportErrorKind) -> ImportError {
    let section_counter = section.counter;
    let from_node = section.from_node.clone();
    let to_node = section.to_node.clone();
    match kind {
        ImportErrorKind::MissingChannel => ImportError::MissingChannel {
            section: section_counter,
            from_node,
            to_node,
        },
        ImportErrorKind::PreviousSectionUndefined => ImportError::PreviousSectionUndefined {
            section: section_counter,
            from_node,
            to_node,
        },
        ImportErrorKind::ObservationOutOfBounds => ImportError::ObservationOutOfBounds {
            section: section_counter,
            from_node,
            to_node,
        },
        ImportErrorKind::Aborted => ImportError::Aborted {
            section: section_counter,
            from_node,
            to_node,
        },
    }
}
