use std::collections::BTreeMap;

/// Severity rating meaning "no damage worth grading"; ratings are numeric
/// with lower = worse, so condition rollups take the minimum.
pub const RATE_OK: i64 = 4;

/// vl_damage_single_damage_class: unknown.
pub const DAMAGE_CLASS_UNKNOWN: i64 = 4561;
/// vl_maintenance_event_kind: inspection.
pub const MAINTENANCE_KIND_INSPECTION: i64 = 4564;
/// vl_maintenance_event_status: accomplished.
pub const MAINTENANCE_STATUS_ACCOMPLISHED: i64 = 2550;
/// od_file class: maintenance event.
pub const FILE_CLASS_MAINTENANCE_EVENT: i64 = 3825;
/// od_file class: damage.
pub const FILE_CLASS_DAMAGE: i64 = 3871;
pub const FILE_KIND_PICTURE: i64 = 3772;
pub const FILE_KIND_VIDEO: i64 = 3775;

/// Translation between legacy damage vocabulary and the target
/// classification value lists. Supplied by the host; the engine never
/// fabricates classification values beyond the documented sentinels.
pub trait CodeTranslator {
    /// Legacy damage code to target channel-damage-code value.
    fn damage_code(&self, code: &str) -> Option<i64>;
    /// Legacy severity rating to target single-damage-class value.
    fn damage_class(&self, rate: i64) -> Option<i64>;
    /// Legacy severity rating to target structure-condition value.
    fn condition_from_rate(&self, rate: i64) -> Option<i64>;
    /// Inverse of `condition_from_rate`, used to compare a stored condition
    /// against a freshly rolled-up one.
    fn rate_from_condition(&self, condition: i64) -> Option<i64>;
}

/// Data-driven translator backed by plain lookup tables.
#[derive(Debug, Default, Clone)]
pub struct StaticCodeTable {
    damage_codes: BTreeMap<String, i64>,
    damage_classes: BTreeMap<i64, i64>,
    structure_conditions: BTreeMap<i64, i64>,
}

impl StaticCodeTable {
    pub fn new(
        damage_codes: BTreeMap<String, i64>,
        damage_classes: BTreeMap<i64, i64>,
        structure_conditions: BTreeMap<i64, i64>,
    ) -> Self {
        Self {
            damage_codes,
            damage_classes,
            structure_conditions,
        }
    }
}

impl CodeTranslator for StaticCodeTable {
    fn damage_code(&self, code: &str) -> Option<i64> {
        self.damage_codes.get(code).copied()
    }

    fn damage_class(&self, rate: i64) -> Option<i64> {
        self.damage_classes.get(&rate).copied()
    }

    fn condition_from_rate(&self, rate: i64) -> Option<i64> {
        self.structure_conditions.get(&rate).copied()
    }

    fn rate_from_condition(&self, condition: i64) -> Option<i64> {
        self.structure_conditions
            .iter()
            .find(|(_, mapped)| **mapped == condition)
            .map(|(rate, _)| *rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeDecision {
    /// Insert the damage anyway; an untranslatable severity becomes
    /// `DAMAGE_CLASS_UNKNOWN`, an untranslatable code stays unset.
    Accept,
    /// Mark this observation as not imported and continue.
    Skip,
    /// Like `Skip`, and suppress further prompts for the rest of the run.
    SkipAll,
    /// Abort the whole import pass.
    Abort,
}

#[derive(Debug, Clone)]
pub struct InvalidCodeContext {
    pub section_counter: i64,
    pub from_node: String,
    pub to_node: String,
    pub code: Option<String>,
    pub rate: Option<i64>,
    pub code_valid: bool,
    pub rate_valid: bool,
}

/// User-interaction boundary for untranslatable damage data. Interactive
/// hosts prompt; tests script the answers.
pub trait CodeDecisionSource {
    fn resolve_invalid_code(&mut self, context: &InvalidCodeContext) -> CodeDecision;
}

/// Decision source for non-interactive runs: every invalid observation is
/// skipped without a prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipInvalidCodes;

impl CodeDecisionSource for SkipInvalidCodes {
    fn resolve_invalid_code(&mut self, _context: &InvalidCodeContext) -> CodeDecision {
        CodeDecision::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StaticCodeTable {
        StaticCodeTable::new(
            BTreeMap::from([("BAB".to_string(), 5230), ("BAJ".to_string(), 5238)]),
            BTreeMap::from([(1, 4551), (2, 4552), (3, 4553), (4, 4554)]),
            BTreeMap::from([(1, 4741), (2, 4742), (3, 4743), (4, 4744)]),
        )
    }

    #[test]
    fn translates_known_codes_and_rates() {
        let table = table();
        assert_eq!(table.damage_code("BAB"), Some(5230));
        assert_eq!(table.damage_code("ZZZ"), None);
        assert_eq!(table.damage_class(2), Some(4552));
        assert_eq!(table.damage_class(9), None);
    }

    #[test]
    fn condition_mapping_round_trips() {
        let table = table();
        let condition = table.condition_from_rate(3).expect("known rate");
        assert_eq!(table.rate_from_condition(condition), Some(3));
        assert_eq!(table.rate_from_condition(999), None);
    }
}
