mod plan;
mod write;

pub use plan::{DamagePlan, GroupPlan, ImportBatch, ImportPlanner};
pub use write::{ImportReport, ImportWriter};

use thiserror::Error;
use w2t_core::codes::{CodeDecisionSource, CodeTranslator};
use w2t_core::config::ImportConfig;
use w2t_core::{CancelToken, SurveyData};
use w2t_network::{NetworkError, NetworkStore};

/// Hard-stop conditions; each aborts the whole pass and names the offending
/// section by its display counter and endpoint labels so the user can fix
/// the matching or selection and retry.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("layer '{layer}' not found in the target project")]
    LayerNotFound { layer: String },
    #[error("inspection {section} from manhole {from_node} to {to_node} has no channel assigned")]
    MissingChannel {
        section: i64,
        from_node: String,
        to_node: String,
    },
    #[error(
        "inspection {section} from manhole {from_node} to {to_node} has a non-existent channel assigned ({obj_id})"
    )]
    UnknownChannel {
        section: i64,
        from_node: String,
        to_node: String,
        obj_id: String,
    },
    #[error(
        "inspection {section} from manhole {from_node} to {to_node} uses the previous channel, but it is not defined"
    )]
    PreviousSectionUndefined {
        section: i64,
        from_node: String,
        to_node: String,
    },
    #[error(
        "inspection {section} from manhole {from_node} to {to_node} has observations further than the length of the assigned channels"
    )]
    ObservationOutOfBounds {
        section: i64,
        from_node: String,
        to_node: String,
    },
    #[error(
        "import aborted on invalid damage data in inspection {section} from manhole {from_node} to {to_node}"
    )]
    Aborted {
        section: i64,
        from_node: String,
        to_node: String,
    },
    #[error("import cancelled")]
    Cancelled,
}

/// Plan the selected subset of the entity graph and persist it in one pass.
/// Nothing is written unless the whole batch plans cleanly, and a write
/// failure anywhere rolls the whole pass back.
pub fn run_import<S, T, D>(
    store: &mut S,
    data: &mut SurveyData,
    translator: &T,
    decisions: &mut D,
    config: &ImportConfig,
    cancel: &CancelToken,
) -> Result<ImportReport, ImportError>
where
    S: NetworkStore,
    T: CodeTranslator,
    D: CodeDecisionSource,
{
    let batch = ImportPlanner::new(store, translator, config, cancel).plan(data, decisions)?;
    ImportWriter::new(store, translator, config, cancel).write(&batch)
}
