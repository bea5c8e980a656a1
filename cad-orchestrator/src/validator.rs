//! Consistency validator
//!
//! A cheap syntactic gate between parsing and execution. It catches obviously
//! incomplete plan/script pairs before a subprocess is spent on them; it does
//! not prove the script builds what the plan describes.

use crate::plan::{GeometryPlan, PlanError};
use serde_json::Value;
use thiserror::Error;

/// Scripts shorter than this cannot import the library, build and export
pub const MIN_SCRIPT_LEN: usize = 30;

const LIBRARY_MARKERS: &[&str] = &["cadquery", "cq."];

const PRIMITIVE_MARKERS: &[&str] = &["box(", "cylinder(", "sphere(", "workplane("];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("JSON plan is missing")]
    MissingPlan,

    #[error("JSON plan has no objects")]
    NoObjects,

    #[error("JSON plan does not match the plan schema: {0}")]
    MalformedPlan(String),

    #[error("JSON plan is inconsistent: {0}")]
    Plan(#[from] PlanError),

    #[error("script is missing")]
    MissingScript,

    #[error("script is too short ({len} chars, need at least {})", MIN_SCRIPT_LEN)]
    ScriptTooShort { len: usize },

    #[error("script never references the CAD library")]
    NoLibraryReference,

    #[error("script never exports a file")]
    NoExportCall,

    #[error("script constructs no recognizable primitive")]
    NoPrimitive,
}

/// Check a parsed plan/script pair, returning the typed plan on success
pub fn validate(plan: Option<&Value>, code: Option<&str>) -> Result<GeometryPlan, ValidationError> {
    let plan = plan.ok_or(ValidationError::MissingPlan)?;

    let has_objects = plan
        .get("objects")
        .and_then(Value::as_array)
        .is_some_and(|objects| !objects.is_empty());
    if !has_objects {
        return Err(ValidationError::NoObjects);
    }

    let plan: GeometryPlan = serde_json::from_value(plan.clone())
        .map_err(|e| ValidationError::MalformedPlan(e.to_string()))?;
    plan.check()?;

    check_script(code)?;

    Ok(plan)
}

/// Boolean form of [`validate`]
pub fn is_consistent(plan: Option<&Value>, code: Option<&str>) -> bool {
    validate(plan, code).is_ok()
}

fn check_script(code: Option<&str>) -> Result<(), ValidationError> {
    let code = code.ok_or(ValidationError::MissingScript)?.trim();

    let len = code.chars().count();
    if len < MIN_SCRIPT_LEN {
        return Err(ValidationError::ScriptTooShort { len });
    }

    let lowered = code.to_lowercase();

    if !LIBRARY_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Err(ValidationError::NoLibraryReference);
    }

    if !lowered.contains("export") {
        return Err(ValidationError::NoExportCall);
    }

    if !PRIMITIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Err(ValidationError::NoPrimitive);
    }

    Ok(())
}
