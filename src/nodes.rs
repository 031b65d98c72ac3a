//! Request builders for the computation graph sent to the backend.
//!
//! A job is a list of nodes; each node type carries fixed identity fields and
//! the name of the result slot later nodes reference.

use crate::model::{
    AlternativeModels, CausalQuestion, ElementDefinition, Estimator, EstimatorGroup,
    EstimatorType, RefutationType,
};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Refuter tests the backend runs against every estimate. The raw
/// `refute_completed` counter counts individual refuter sub-tasks, so
/// progress math divides by this list's length.
pub const REFUTERS: [&str; 5] = [
    "add_unobserved_common_cause",
    "random_common_cause",
    "placebo_treatment_refuter",
    "data_subset_refuter",
    "bootstrap_refuter",
];

/// Opaque job payload: a list of computation nodes. Immutable once submitted.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRequest {
    pub nodes: Vec<Value>,
}

impl NodeRequest {
    /// Chain two requests into one graph, preserving node order.
    pub fn concat(self, other: NodeRequest) -> NodeRequest {
        let mut nodes = self.nodes;
        nodes.extend(other.nodes);
        NodeRequest { nodes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    LoadDataset,
    CreateCausalGraph,
    IdentifyEstimand,
    EstimateEffects,
    SignificanceTest,
}

impl NodeType {
    fn id(self) -> &'static str {
        match self {
            NodeType::LoadDataset => "Load Dataset",
            NodeType::CreateCausalGraph => "Create Causal Graph",
            NodeType::IdentifyEstimand => "Identify Estimand",
            NodeType::EstimateEffects => "Estimate Effects",
            NodeType::SignificanceTest => "Significance Test",
        }
    }

    /// Result slot this node writes, referenced by downstream nodes. The
    /// load node's slot is the dataframe name, supplied per request.
    fn result(self) -> Option<&'static str> {
        match self {
            NodeType::LoadDataset => None,
            NodeType::CreateCausalGraph => Some("primary_maximum_model"),
            NodeType::IdentifyEstimand => Some("primary_estimand"),
            NodeType::EstimateEffects => Some("estimate_results"),
            NodeType::SignificanceTest => Some("significance_test"),
        }
    }

    fn properties(self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("type".into(), json!(self.id()));
        props.insert("id".into(), json!(self.id()));
        props.insert("value".into(), json!(self.id()));
        props.insert("name".into(), json!(self.id()));
        if let Some(result) = self.result() {
            props.insert("result".into(), json!(result));
        }
        props
    }
}

/// Build one node: type-specific identity fields first, caller-supplied
/// properties spread over them.
pub fn build_node(node_type: NodeType, extra: Map<String, Value>) -> Value {
    let mut props = node_type.properties();
    for (key, value) in extra {
        props.insert(key, value);
    }
    Value::Object(props)
}

pub fn build_nodes(nodes: Vec<Value>) -> NodeRequest {
    NodeRequest { nodes }
}

/// Node that loads an uploaded dataset. The dataframe takes the file's stem
/// as its name so later specs can reference it.
pub fn build_load_node(url: &str, file_name: &str) -> NodeRequest {
    let dataframe_name = file_name.split('.').next().unwrap_or(file_name);
    let mut extra = Map::new();
    extra.insert("result".into(), json!(dataframe_name));
    extra.insert("url".into(), json!(url));
    build_nodes(vec![build_node(NodeType::LoadDataset, extra)])
}

/// Node that runs significance tests over the given estimate task ids.
pub fn build_significance_test_node(spec_ids: &[String]) -> NodeRequest {
    let mut extra = Map::new();
    extra.insert("spec_ids".into(), json!(spec_ids));
    build_nodes(vec![build_node(NodeType::SignificanceTest, extra)])
}

/// Population/treatment/outcome specification lists for an estimate node.
pub fn build_specs(
    dataframe_name: &str,
    population: &[ElementDefinition],
    exposure: &[ElementDefinition],
    outcome: &[ElementDefinition],
) -> (Vec<Value>, Vec<Value>, Vec<Value>) {
    let population_specs = population
        .iter()
        .map(|p| {
            json!({
                "type": p.level,
                "label": p.variable,
                "dataframe": dataframe_name,
                "population_id": p.column,
            })
        })
        .collect();
    let treatment_specs = exposure
        .iter()
        .map(|e| {
            json!({
                "type": e.level,
                "label": e.variable,
                "variable": e.column,
            })
        })
        .collect();
    let outcome_specs = outcome
        .iter()
        .map(|o| {
            json!({
                "type": o.level,
                "label": o.variable,
                "variable": o.column,
            })
        })
        .collect();
    (population_specs, treatment_specs, outcome_specs)
}

/// One causal-model level. Levels with neither confounders nor outcome
/// determinants are omitted, except Unadjusted which is always present.
pub fn build_model_level(model_name: &str, model: &AlternativeModels) -> Option<Value> {
    if model.confounders.is_empty()
        && model.outcome_determinants.is_empty()
        && model_name != "Unadjusted"
    {
        return None;
    }
    Some(json!({
        "type": format!("{model_name} Model"),
        "label": format!("{model_name} Model"),
        "confounders": model.confounders,
        "outcome_determinants": model.outcome_determinants,
    }))
}

/// The alternative causal-model levels for an estimate node.
pub fn build_models(
    maximum: &AlternativeModels,
    minimum: &AlternativeModels,
    unadjusted: &AlternativeModels,
) -> Vec<Value> {
    let mut models = Vec::new();
    if let Some(model) = build_model_level("Maximum", maximum) {
        models.push(model);
    }
    if let Some(model) = build_model_level("Minimum", minimum) {
        models.push(model);
    }
    if let Some(model) = build_model_level("Unadjusted", unadjusted) {
        models.push(model);
    }
    models
}

fn model_type_for_group(group: EstimatorGroup) -> &'static str {
    match group {
        EstimatorGroup::Exposure => "Treatment Assignment Model",
        EstimatorGroup::Outcome => "Outcome Model",
    }
}

fn method_name_for_type(estimator_type: EstimatorType) -> &'static str {
    match estimator_type {
        EstimatorType::ForestDoubleMachineLearning => "econml.dml.CausalForestDML",
        EstimatorType::LinearDoubleMachineLearning => "econml.dml.LinearDML",
        EstimatorType::ForestDoublyRobustLearner => "econml.dr.ForestDRLearner",
        EstimatorType::LinearDoublyRobustLearner => "econml.dr.LinearDRLearner",
        EstimatorType::LinearRegression => "linear_regression",
        EstimatorType::PropensityScoreMatching => "propensity_score_matching",
        EstimatorType::PropensityScoreStratification => "propensity_score_stratification",
        EstimatorType::InversePropensityWeighting => "propensity_score_weighting",
    }
}

/// Estimator specifications. Everything except plain linear regression needs
/// a propensity score.
pub fn build_estimators(estimators: &[Estimator]) -> Vec<Value> {
    estimators
        .iter()
        .map(|estimator| {
            json!({
                "type": model_type_for_group(estimator.group),
                "label": estimator.estimator_type,
                "require_propensity_score":
                    estimator.estimator_type != EstimatorType::LinearRegression,
                "method_name": format!("backdoor.{}", method_name_for_type(estimator.estimator_type)),
            })
        })
        .collect()
}

pub fn build_refutation_specs(refutation_type: RefutationType) -> Value {
    json!({ "num_simulations": refutation_type.num_simulations() })
}

/// The estimate-effects node for a full causal question against the named
/// dataframe.
pub fn build_estimate_node(question: &CausalQuestion, dataframe_name: &str) -> NodeRequest {
    let (population_specs, treatment_specs, outcome_specs) = build_specs(
        dataframe_name,
        &question.population,
        &question.exposure,
        &question.outcome,
    );
    let mut extra = Map::new();
    extra.insert("population_specs".into(), json!(population_specs));
    extra.insert("treatment_specs".into(), json!(treatment_specs));
    extra.insert("outcome_specs".into(), json!(outcome_specs));
    extra.insert(
        "model_specs".into(),
        json!(build_models(
            &question.maximum_model,
            &question.minimum_model,
            &question.unadjusted_model,
        )),
    );
    extra.insert(
        "estimator_specs".into(),
        json!(build_estimators(&question.estimators)),
    );
    extra.insert(
        "refuter_specs".into(),
        build_refutation_specs(question.refutation_type),
    );
    extra.insert(
        "confidence_interval".into(),
        json!(question.confidence_interval),
    );
    build_nodes(vec![build_node(NodeType::EstimateEffects, extra)])
}
