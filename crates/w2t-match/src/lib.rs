use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use w2t_core::config::ImportConfig;
use w2t_core::{CancelToken, Project};
use w2t_network::{fields, Feature, NetworkError, NetworkStore};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("channel layer '{layer}' not found in the target project")]
    ChannelLayerNotFound { layer: String },
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MatchReport {
    pub sections_scanned: usize,
    pub matched: usize,
    pub matched_by_fallback: usize,
    pub unmatched: usize,
    pub cancelled: bool,
}

/// Resolves legacy sections to target-network reach features by endpoint
/// node identity, scoped by the project's channel-name label.
pub struct ChannelMatcher<'a, S: NetworkStore> {
    store: &'a S,
    config: &'a ImportConfig,
}

impl<'a, S: NetworkStore> ChannelMatcher<'a, S> {
    pub fn new(store: &'a S, config: &'a ImportConfig) -> Self {
        Self { store, config }
    }

    /// At most one matching channel feature for a from/to node label pair.
    /// The fallback with trailing non-digits stripped runs only when the
    /// exact pass found nothing and `remove_trailing_chars` is enabled.
    pub fn find_channel(
        &self,
        channel: &str,
        from_node: &str,
        to_node: &str,
    ) -> Result<Option<Feature>, MatchError> {
        Ok(self
            .find_with_origin(channel, from_node, to_node)?
            .map(|(feature, _)| feature))
    }

    /// Like [`Self::find_channel`], also reporting whether the trailing-character
    /// fallback produced the match.
    fn find_with_origin(
        &self,
        channel: &str,
        from_node: &str,
        to_node: &str,
    ) -> Result<Option<(Feature, bool)>, MatchError> {
        let layer = self.config.channel_layer.as_str();
        if !self.store.has_layer(layer)? {
            return Err(MatchError::ChannelLayerNotFound {
                layer: layer.to_string(),
            });
        }

        if let Some(feature) = self.lookup(layer, channel, from_node, to_node)? {
            return Ok(Some((feature, false)));
        }

        if self.config.remove_trailing_chars {
            let from_stripped = strip_trailing_non_digits(from_node);
            let to_stripped = strip_trailing_non_digits(to_node);
            if from_stripped != from_node || to_stripped != to_node {
                debug!(from = from_stripped, to = to_stripped, "retrying without trailing characters");
                if let Some(feature) = self.lookup(layer, channel, from_stripped, to_stripped)? {
                    return Ok(Some((feature, true)));
                }
            }
        }

        Ok(None)
    }

    fn lookup(
        &self,
        layer: &str,
        channel: &str,
        from_node: &str,
        to_node: &str,
    ) -> Result<Option<Feature>, MatchError> {
        let mut filters = vec![
            (fields::FROM_IDENTIFIER, Value::from(from_node)),
            (fields::TO_IDENTIFIER, Value::from(to_node)),
        ];
        if !channel.trim().is_empty() {
            filters.push((fields::IDENTIFIER, Value::from(channel)));
        }
        Ok(self.store.find_feature(layer, &filters)?)
    }

    /// One search pass over a whole project: annotate every section's first
    /// matched channel id. Existing match results should be cleared first
    /// (see [`clear_matches`]); manual multi-segment assignments stay a
    /// user-side operation.
    pub fn match_project(
        &self,
        project: &mut Project,
        cancel: &CancelToken,
    ) -> Result<MatchReport, MatchError> {
        let mut report = MatchReport::default();
        let channel = project.channel.clone();

        for section in &mut project.sections {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.sections_scanned += 1;

            match self.find_with_origin(&channel, &section.from_node, &section.to_node)? {
                Some((feature, by_fallback)) => {
                    section.teksi_channel_id_1 = feature.obj_id().map(ToString::to_string);
                    report.matched += 1;
                    if by_fallback {
                        report.matched_by_fallback += 1;
                    }
                }
                None => report.unmatched += 1,
            }
        }
        Ok(report)
    }
}

/// Wipe the results of a previous search pass before running a new one.
pub fn clear_matches(project: &mut Project) {
    for section in &mut project.sections {
        section.teksi_channel_id_1 = None;
        section.teksi_channel_id_2 = None;
        section.teksi_channel_id_3 = None;
    }
}

/// Legacy node labels sometimes carry an inconsistent trailing letter
/// suffix; stripping everything after the last digit makes both
/// conventions comparable.
fn strip_trailing_non_digits(label: &str) -> &str {
    label.trim_end_matches(|c: char| !c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use w2t_network::SqliteNetworkStore;

    fn store() -> SqliteNetworkStore {
        let store = SqliteNetworkStore::open_in_memory().expect("open store");
        store
            .create_layer(
                "vw_qgep_reach",
                &[
                    fields::IDENTIFIER,
                    fields::FROM_IDENTIFIER,
                    fields::TO_IDENTIFIER,
                    fields::LENGTH_EFFECTIVE,
                    fields::WS_OBJ_ID,
                ],
            )
            .expect("create layer");
        store
    }

    fn add_reach(store: &mut SqliteNetworkStore, obj_id: &str, channel: &str, from: &str, to: &str) {
        store.begin_edit(&["vw_qgep_reach"]).expect("begin edit");
        store
            .add_feature(
                "vw_qgep_reach",
                &Feature::new()
                    .with(fields::OBJ_ID, obj_id)
                    .with(fields::IDENTIFIER, channel)
                    .with(fields::FROM_IDENTIFIER, from)
                    .with(fields::TO_IDENTIFIER, to)
                    .with(fields::LENGTH_EFFECTIVE, 10.0)
                    .with(fields::WS_OBJ_ID, format!("ws-{obj_id}")),
            )
            .expect("add reach");
        store.commit_edit().expect("commit");
    }

    #[test]
    fn exact_endpoint_match_scoped_by_channel_label() {
        let mut store = store();
        add_reach(&mut store, "ch-1", "main", "MH1", "MH2");
        add_reach(&mut store, "ch-2", "side", "MH1", "MH2");
        let config = ImportConfig::default();
        let matcher = ChannelMatcher::new(&store, &config);

        let hit = matcher
            .find_channel("side", "MH1", "MH2")
            .expect("lookup")
            .expect("match exists");
        assert_eq!(hit.obj_id(), Some("ch-2"));

        let miss = matcher.find_channel("other", "MH1", "MH2").expect("lookup");
        assert!(miss.is_none());
    }

    #[test]
    fn fallback_runs_only_when_enabled() {
        let mut store = store();
        add_reach(&mut store, "ch-1", "main", "MH1", "MH2");

        let mut config = ImportConfig::default();
        let matcher = ChannelMatcher::new(&store, &config);
        assert!(matcher
            .find_channel("main", "MH1a", "MH2b")
            .expect("lookup")
            .is_none());

        config.remove_trailing_chars = true;
        let matcher = ChannelMatcher::new(&store, &config);
        let hit = matcher
            .find_channel("main", "MH1a", "MH2b")
            .expect("lookup")
            .expect("fallback match");
        assert_eq!(hit.obj_id(), Some("ch-1"));
    }

    #[test]
    fn fallback_never_shadows_an_exact_match() {
        let mut store = store();
        add_reach(&mut store, "ch-exact", "main", "MH1a", "MH2");
        add_reach(&mut store, "ch-stripped", "main", "MH1", "MH2");

        let mut config = ImportConfig::default();
        config.remove_trailing_chars = true;
        let matcher = ChannelMatcher::new(&store, &config);
        let hit = matcher
            .find_channel("main", "MH1a", "MH2")
            .expect("lookup")
            .expect("match exists");
        assert_eq!(hit.obj_id(), Some("ch-exact"));
    }

    #[test]
    fn missing_channel_layer_is_signalled() {
        let store = SqliteNetworkStore::open_in_memory().expect("open store");
        let config = ImportConfig::default();
        let matcher = ChannelMatcher::new(&store, &config);
        let err = matcher
            .find_channel("main", "MH1", "MH2")
            .expect_err("must fail");
        assert!(matches!(err, MatchError::ChannelLayerNotFound { .. }));
    }

    #[test]
    fn project_pass_annotates_sections_and_counts() {
        let mut store = store();
        add_reach(&mut store, "ch-1", "main", "MH1", "MH2");
        add_reach(&mut store, "ch-2", "main", "MH2", "MH3");

        let mut project = Project {
            pk: "p1".to_string(),
            name: "P".to_string(),
            channel: "main".to_string(),
            sections: vec![
                test_section("s1", "MH1", "MH2"),
                test_section("s2", "MH2", "MH3"),
                test_section("s3", "MH3", "MH4"),
            ],
        };

        let config = ImportConfig::default();
        let matcher = ChannelMatcher::new(&store, &config);
        let report = matcher
            .match_project(&mut project, &CancelToken::new())
            .expect("match project");

        assert_eq!(report.sections_scanned, 3);
        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 1);
        assert_eq!(project.sections[0].teksi_channel_id_1.as_deref(), Some("ch-1"));
        assert_eq!(project.sections[1].teksi_channel_id_1.as_deref(), Some("ch-2"));
        assert!(project.sections[2].teksi_channel_id_1.is_none());

        clear_matches(&mut project);
        assert!(project.sections.iter().all(|s| s.teksi_channel_id_1.is_none()));
    }

    #[test]
    fn cancellation_stops_the_scan() {
        let mut store = store();
        add_reach(&mut store, "ch-1", "main", "MH1", "MH2");
        let mut project = Project {
            pk: "p1".to_string(),
            name: "P".to_string(),
            channel: "main".to_string(),
            sections: vec![test_section("s1", "MH1", "MH2")],
        };

        let cancel = CancelToken::new();
        cancel.cancel();
        let config = ImportConfig::default();
        let matcher = ChannelMatcher::new(&store, &config);
        let report = matcher
            .match_project(&mut project, &cancel)
            .expect("match project");
        assert!(report.cancelled);
        assert_eq!(report.sections_scanned, 0);
        assert!(project.sections[0].teksi_channel_id_1.is_none());
    }

    fn test_section(pk: &str, from: &str, to: &str) -> w2t_core::Section {
        w2t_core::Section {
            pk: pk.to_string(),
            counter: 0,
            from_node: from.to_string(),
            to_node: to.to_string(),
            pipe_dia: None,
            pipe_material: None,
            profile: None,
            pipe_width: None,
            section_length: 10.0,
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
}
