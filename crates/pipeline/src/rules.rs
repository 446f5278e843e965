//! Deterministic stage-transition rules applied on top of the model's
//! suggestion. The funnel only moves forward; every blocked regression
//! is logged so operators can audit model drift.

use lf_domain::model::Stage;

/// Resolve the final stage for a turn.
///
/// Priority:
/// 1. a high-confidence analyzer recommendation that moves forward wins
///    over the model's `new_stage`;
/// 2. the model's suggestion is taken when it does not regress;
/// 3. otherwise the current stage is kept and the block is logged.
pub fn apply_stage_override(
    current: Stage,
    llm_stage: Stage,
    analyzer_stage: Option<Stage>,
    confidence: f32,
) -> Stage {
    let analyzer = analyzer_stage.unwrap_or(current);

    if confidence >= 0.7 && analyzer.order() > current.order() {
        if analyzer != llm_stage {
            tracing::info!(
                analyzer = %analyzer,
                llm = %llm_stage,
                confidence,
                "stage override: trusting analyzer recommendation"
            );
        }
        return analyzer;
    }

    if llm_stage.order() < current.order() {
        tracing::warn!(
            current = %current,
            suggested = %llm_stage,
            "stage regression blocked"
        );
        return current;
    }

    llm_stage
}
