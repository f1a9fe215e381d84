//! Per-attempt pipeline phases
//!
//! One schema attempt moves through these phases via [`PipelinePhase::transition`].
//! The single-correction rule lives here: an execution failure after a
//! correction goes straight to `Failed`.

use crate::error::{QueryError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelinePhase {
    SelectingSchema,
    AnalyzingIntent,
    /// Halt: the caller must answer clarification questions.
    AwaitingClarification,
    Generating,
    Validating { sql: String, corrected: bool },
    Executing { sql: String, corrected: bool },
    Correcting { failed_sql: String, error: String },
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEvent {
    /// Fresh question, intent analysis runs first.
    SchemaSelected,
    /// Clarified question, intent analysis is skipped.
    ClarificationResumed,
    IntentClear,
    ClarificationNeeded,
    SqlGenerated(String),
    Validated(String),
    ExecutionSucceeded,
    ExecutionFailed(String),
    /// Any error that ends the attempt: guardrail rejection, schema mismatch,
    /// classifier or connection failure.
    Abort,
}

impl PipelinePhase {
    pub fn name(&self) -> &'static str {
        match self {
            PipelinePhase::SelectingSchema => "selecting_schema",
            PipelinePhase::AnalyzingIntent => "analyzing_intent",
            PipelinePhase::AwaitingClarification => "awaiting_clarification",
            PipelinePhase::Generating => "generating",
            PipelinePhase::Validating { .. } => "validating",
            PipelinePhase::Executing { .. } => "executing",
            PipelinePhase::Correcting { .. } => "correcting",
            PipelinePhase::Done => "done",
            PipelinePhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelinePhase::AwaitingClarification | PipelinePhase::Done | PipelinePhase::Failed
        )
    }

    pub fn transition(self, event: PhaseEvent) -> Result<PipelinePhase> {
        use PhaseEvent as E;
        use PipelinePhase as P;

        let next = match (self, event) {
            (P::SelectingSchema, E::SchemaSelected) => P::AnalyzingIntent,
            (P::SelectingSchema, E::ClarificationResumed) => P::Generating,
            (P::AnalyzingIntent, E::IntentClear) => P::Generating,
            (P::AnalyzingIntent, E::ClarificationNeeded) => P::AwaitingClarification,
            (P::Generating, E::SqlGenerated(sql)) => P::Validating {
                sql,
                corrected: false,
            },
            (P::Correcting { .. }, E::SqlGenerated(sql)) => P::Validating {
                sql,
                corrected: true,
            },
            (P::Validating { corrected, .. }, E::Validated(sql)) => P::Executing { sql, corrected },
            (P::Executing { .. }, E::ExecutionSucceeded) => P::Done,
            (P::Executing { sql, corrected: false }, E::ExecutionFailed(error)) => P::Correcting {
                failed_sql: sql,
                error,
            },
            (P::Executing { corrected: true, .. }, E::ExecutionFailed(_)) => P::Failed,
            (phase, E::Abort) if !phase.is_terminal() => P::Failed,
            (phase, event) => {
                return Err(QueryError::InvalidTransition {
                    from: phase.name(),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

impl PhaseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseEvent::SchemaSelected => "schema_selected",
            PhaseEvent::ClarificationResumed => "clarification_resumed",
            PhaseEvent::IntentClear => "intent_clear",
            PhaseEvent::ClarificationNeeded => "clarification_needed",
            PhaseEvent::SqlGenerated(_) => "sql_generated",
            PhaseEvent::Validated(_) => "validated",
            PhaseEvent::ExecutionSucceeded => "execution_succeeded",
            PhaseEvent::ExecutionFailed(_) => "execution_failed",
            PhaseEvent::Abort => "abort",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: Vec<PhaseEvent>) -> Result<PipelinePhase> {
        events
            .into_iter()
            .try_fold(PipelinePhase::SelectingSchema, |phase, event| phase.transition(event))
    }

    #[test]
    fn test_happy_path() {
        let phase = run(vec![
            PhaseEvent::SchemaSelected,
            PhaseEvent::IntentClear,
            PhaseEvent::SqlGenerated("SELECT 1;".into()),
            PhaseEvent::Validated("SELECT 1 LIMIT 10;".into()),
            PhaseEvent::ExecutionSucceeded,
        ])
        .unwrap();
        assert_eq!(phase, PipelinePhase::Done);
    }

    #[test]
    fn test_clarification_resume_skips_intent() {
        let phase = run(vec![PhaseEvent::ClarificationResumed]).unwrap();
        assert_eq!(phase, PipelinePhase::Generating);
        assert!(PipelinePhase::Generating
            .transition(PhaseEvent::IntentClear)
            .is_err());
    }

    #[test]
    fn test_only_one_correction() {
        let phase = run(vec![
            PhaseEvent::SchemaSelected,
            PhaseEvent::IntentClear,
            PhaseEvent::SqlGenerated("SELECT a;".into()),
            PhaseEvent::Validated("SELECT a LIMIT 5;".into()),
            PhaseEvent::ExecutionFailed("Unknown column 'a'".into()),
        ])
        .unwrap();
        assert_eq!(
            phase,
            PipelinePhase::Correcting {
                failed_sql: "SELECT a LIMIT 5;".into(),
                error: "Unknown column 'a'".into(),
            }
        );

        let phase = phase
            .transition(PhaseEvent::SqlGenerated("SELECT b;".into()))
            .and_then(|p| p.transition(PhaseEvent::Validated("SELECT b LIMIT 5;".into())))
            .unwrap();
        assert_eq!(
            phase,
            PipelinePhase::Executing {
                sql: "SELECT b LIMIT 5;".into(),
                corrected: true
            }
        );
        assert_eq!(
            phase.transition(PhaseEvent::ExecutionFailed("again".into())).unwrap(),
            PipelinePhase::Failed
        );
    }

    #[test]
    fn test_halts_are_terminal() {
        let halted = run(vec![PhaseEvent::SchemaSelected, PhaseEvent::ClarificationNeeded]).unwrap();
        assert!(halted.is_terminal());
        assert!(matches!(
            halted.transition(PhaseEvent::Abort),
            Err(QueryError::InvalidTransition { from: "awaiting_clarification", .. })
        ));
        assert!(PipelinePhase::Done.transition(PhaseEvent::ExecutionSucceeded).is_err());
    }
}
