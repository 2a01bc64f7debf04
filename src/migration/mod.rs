//! Payload upgrades. Each component is versioned on its own and upgraded
//! by a chain of single-version steps over untyped JSON, so the typed
//! importer only ever sees the current shape.

mod steps;

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::archive::records::HISTORY_PAYLOAD_VERSION;
use crate::error::codes;
use crate::store::dictionary::DICTIONARY_VERSION;
use crate::store::settings::SETTINGS_PAYLOAD_VERSION;
use crate::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    History,
    Dictionary,
    Settings,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::History => "history",
            Component::Dictionary => "dictionary",
            Component::Settings => "settings",
        }
    }

    pub fn current_version(self) -> u32 {
        match self {
            Component::History => HISTORY_PAYLOAD_VERSION,
            Component::Dictionary => DICTIONARY_VERSION,
            Component::Settings => SETTINGS_PAYLOAD_VERSION,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Step {
    pub component: Component,
    pub from: u32,
    apply: fn(Value) -> Result<Value, String>,
}

impl Step {
    pub fn to(&self) -> u32 {
        self.from + 1
    }

    pub fn describe(&self) -> String {
        format!("{} v{} -> v{}", self.component, self.from, self.to())
    }
}

static STEPS: &[Step] = &[
    Step {
        component: Component::History,
        from: 1,
        apply: steps::history_v1_to_v2,
    },
    Step {
        component: Component::Dictionary,
        from: 1,
        apply: steps::dictionary_v1_to_v2,
    },
    Step {
        component: Component::Settings,
        from: 1,
        apply: steps::settings_v1_to_v2,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    #[error("no migration from {component} payload v{from} to v{to}")]
    StepMissing {
        component: Component,
        from: u32,
        to: u32,
    },
    #[error("{component} payload could not be upgraded from v{from}: {reason}")]
    StepFailed {
        component: Component,
        from: u32,
        reason: String,
    },
}

impl From<MigrationError> for AppError {
    fn from(err: MigrationError) -> Self {
        match &err {
            MigrationError::StepMissing {
                component,
                from,
                to,
            } => AppError::new(
                codes::MIGRATION_STEP_MISSING,
                "This backup contains data this version of Codictate cannot upgrade.",
            )
            .with_context("component", component.as_str())
            .with_context("from", from.to_string())
            .with_context("to", to.to_string()),
            MigrationError::StepFailed {
                component, from, ..
            } => AppError::new(codes::IMPORT_CORRUPT_PAYLOAD, err.to_string())
                .with_context("component", component.as_str())
                .with_context("from", from.to_string()),
        }
    }
}

/// The ordered steps that take `component` from `from` to the current
/// version. Gaps and versions newer than current are errors, never skips.
#[derive(Clone)]
pub struct Plan {
    component: Component,
    steps: Vec<&'static Step>,
}

impl Plan {
    pub fn for_component(component: Component, from: u32) -> Result<Self, MigrationError> {
        let target = component.current_version();
        if from > target || from == 0 {
            return Err(MigrationError::StepMissing {
                component,
                from,
                to: target,
            });
        }

        let mut steps = Vec::new();
        let mut version = from;
        while version < target {
            let step = STEPS
                .iter()
                .find(|step| step.component == component && step.from == version)
                .ok_or(MigrationError::StepMissing {
                    component,
                    from: version,
                    to: version + 1,
                })?;
            steps.push(step);
            version = step.to();
        }
        Ok(Self { component, steps })
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn describe(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.describe()).collect()
    }

    pub fn run(&self, mut value: Value) -> Result<Value, MigrationError> {
        for step in &self.steps {
            value = (step.apply)(value).map_err(|reason| MigrationError::StepFailed {
                component: step.component,
                from: step.from,
                reason,
            })?;
        }
        Ok(value)
    }
}
