//! Versioned prompt manifest and template rendering.
//!
//! The manifest is validated once, up front: every template it references
//! is read into memory before any agent call, so a missing file is a
//! configuration error rather than a failure halfway through a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::domain::atom::Atom;
use crate::domain::digest::sha256_text;
use crate::domain::error::{BacklogError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u64 = 1;

/// Raw output longer than this is truncated inside the repair prompt.
const REPAIR_RAW_MAX_CHARS: usize = 12_000;
/// Parse errors quoted back to the model in a repair prompt.
const REPAIR_MAX_ERRORS: usize = 20;

/// Loaded `manifest.json` plus the text of every referenced template.
#[derive(Debug, Clone)]
pub struct PromptManifest {
    pub dir: PathBuf,
    pub coverage_templates: Vec<String>,
    pub bagging_templates: Vec<String>,
    pub orphan_template: String,
    pub merge_judge_template: String,
    pub labeler_template: String,
    templates: BTreeMap<String, String>,
}

impl PromptManifest {
    /// Build a manifest from in-memory templates (tests, embedding callers).
    pub fn from_parts(
        dir: impl Into<PathBuf>,
        coverage_templates: Vec<String>,
        bagging_templates: Vec<String>,
        orphan_template: impl Into<String>,
        merge_judge_template: impl Into<String>,
        labeler_template: impl Into<String>,
        templates: BTreeMap<String, String>,
    ) -> Result<Self> {
        let manifest = Self {
            dir: dir.into(),
            coverage_templates,
            bagging_templates,
            orphan_template: orphan_template.into(),
            merge_judge_template: merge_judge_template.into(),
            labeler_template: labeler_template.into(),
            templates,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    fn referenced(&self) -> impl Iterator<Item = &String> {
        self.coverage_templates
            .iter()
            .chain(self.bagging_templates.iter())
            .chain([
                &self.orphan_template,
                &self.merge_judge_template,
                &self.labeler_template,
            ])
    }

    fn validate(&self) -> Result<()> {
        if self.coverage_templates.is_empty() {
            return Err(BacklogError::config(
                "prompt manifest miners.coverage_templates must be a non-empty list",
            ));
        }
        if self.bagging_templates.is_empty() {
            return Err(BacklogError::config(
                "prompt manifest miners.bagging_templates must be a non-empty list",
            ));
        }
        for name in self.referenced() {
            if !self.templates.contains_key(name) {
                return Err(BacklogError::config(format!(
                    "missing prompt template: {}",
                    self.dir.join(name).display()
                )));
            }
        }
        Ok(())
    }

    /// Template text by name.
    pub fn template(&self, name: &str) -> Result<&str> {
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| BacklogError::config(format!("unknown prompt template: {name}")))
    }

    /// SHA-256 of a template's text, as recorded in input manifests.
    pub fn template_sha256(&self, name: &str) -> Result<String> {
        Ok(sha256_text(self.template(name)?))
    }

    /// Manifest summary recorded in run metadata and miner manifests.
    ///
    /// Leaves out the directory so relocating prompts keeps caches valid.
    pub fn summary(&self) -> Value {
        json!({
            "manifest_file": MANIFEST_FILE,
            "coverage_templates": self.coverage_templates,
            "bagging_templates": self.bagging_templates,
            "orphan_template": self.orphan_template,
            "merge_judge_template": self.merge_judge_template,
            "labeler_template": self.labeler_template,
        })
    }
}

fn string_list(miners: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    let items = miners.get(key).and_then(Value::as_array).ok_or_else(|| {
        BacklogError::config(format!("prompt manifest miners.{key} must be a non-empty list"))
    })?;
    let names: Vec<String> = items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() || names.len() != items.len() {
        return Err(BacklogError::config(format!(
            "prompt manifest miners.{key} must be a non-empty list of template names"
        )));
    }
    Ok(names)
}

fn required_name(obj: &Map<String, Value>, key: &str, context: &str) -> Result<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BacklogError::config(format!("prompt manifest missing {context}{key}")))
}

/// Load and validate `<dir>/manifest.json` and all templates it names.
pub fn load_prompt_manifest(dir: &Path) -> Result<PromptManifest> {
    if !dir.is_dir() {
        return Err(BacklogError::config(format!(
            "prompts dir not found: {}",
            dir.display()
        )));
    }
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(BacklogError::config(format!(
            "prompt manifest not found: {}",
            manifest_path.display()
        )));
    }
    let text = std::fs::read_to_string(&manifest_path)?;
    let doc: Value = serde_json::from_str(&text).map_err(|e| {
        BacklogError::config(format!(
            "invalid prompt manifest JSON {}: {e}",
            manifest_path.display()
        ))
    })?;
    let doc = doc
        .as_object()
        .ok_or_else(|| BacklogError::config("prompt manifest must be a JSON object"))?;

    let version = doc.get("version").and_then(Value::as_u64);
    if version != Some(MANIFEST_VERSION) {
        return Err(BacklogError::config(format!(
            "unsupported prompt manifest version: {}",
            doc.get("version").cloned().unwrap_or(Value::Null)
        )));
    }

    let miners = doc
        .get("miners")
        .and_then(Value::as_object)
        .ok_or_else(|| BacklogError::config("prompt manifest missing miners"))?;
    let coverage_templates = string_list(miners, "coverage_templates")?;
    let bagging_templates = string_list(miners, "bagging_templates")?;
    let orphan_template = required_name(miners, "orphan_template", "miners.")?;
    let merge_judge_template = required_name(doc, "merge_judge_template", "")?;
    let labeler_template = required_name(doc, "labeler_template", "")?;

    let mut templates = BTreeMap::new();
    let names = coverage_templates
        .iter()
        .chain(bagging_templates.iter())
        .chain([&orphan_template, &merge_judge_template, &labeler_template]);
    for name in names {
        if templates.contains_key(name) {
            continue;
        }
        let path = dir.join(name);
        let body = std::fs::read_to_string(&path).map_err(|_| {
            BacklogError::config(format!("missing prompt template: {}", path.display()))
        })?;
        templates.insert(name.clone(), body);
    }

    PromptManifest::from_parts(
        dir,
        coverage_templates,
        bagging_templates,
        orphan_template,
        merge_judge_template,
        labeler_template,
        templates,
    )
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Literal `{{KEY}}` substitution.
pub fn render_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

pub fn render_miner_prompt(template: &str, atoms: &[Atom], max_tickets: usize) -> Result<String> {
    let payload: Vec<Value> = atoms.iter().map(Atom::prompt_payload).collect();
    let atoms_json = serde_json::to_string_pretty(&json!({ "atoms": payload }))?;
    Ok(render_template(
        template,
        &[
            ("MAX_TICKETS_PER_MINER", max_tickets.to_string()),
            ("ATOMS_JSON", atoms_json),
        ],
    ))
}

/// One-shot repair prompt asking the model to re-emit its answer as JSON.
pub fn render_repair_prompt(raw: &str, errors: &[String], max_tickets: usize) -> String {
    let error_lines: Vec<String> = errors
        .iter()
        .take(REPAIR_MAX_ERRORS)
        .map(|e| format!("- {e}"))
        .collect();
    let trimmed = raw.trim();
    let raw_block = if trimmed.chars().count() > REPAIR_RAW_MAX_CHARS {
        let head: String = trimmed.chars().take(REPAIR_RAW_MAX_CHARS).collect();
        format!("{head}\n...[truncated]")
    } else {
        trimmed.to_string()
    };
    format!(
        "Convert the assistant output below into valid JSON only.\n\
         Return a JSON array of ticket objects, up to {max_tickets}.\n\
         Each ticket must include title, severity, confidence, evidence_atom_ids, \
         investigation_steps or proposed_fix, and success_criteria.\n\
         Do not add explanations.\n\n\
         Parse errors from prior attempt:\n{}\n\n\
         Raw output:\n{raw_block}\n",
        error_lines.join("\n")
    )
}

pub fn render_merge_judge_prompt(
    template: &str,
    left: &Value,
    right: &Value,
    evidence: &[&Atom],
) -> Result<String> {
    Ok(render_template(
        template,
        &[
            ("LEFT_TICKET_JSON", serde_json::to_string_pretty(left)?),
            ("RIGHT_TICKET_JSON", serde_json::to_string_pretty(right)?),
            ("EVIDENCE_JSON", serde_json::to_string_pretty(evidence)?),
        ],
    ))
}

pub fn render_labeler_prompt(
    template: &str,
    variant: &str,
    ticket: &Value,
    evidence: &[&Atom],
) -> Result<String> {
    let evidence: Vec<Value> = evidence.iter().map(|a| a.labeler_payload()).collect();
    Ok(render_template(
        template,
        &[
            ("LABELER_VARIANT", variant.to_string()),
            ("TICKET_JSON", serde_json::to_string_pretty(ticket)?),
            ("EVIDENCE_ATOMS_JSON", serde_json::to_string_pretty(&evidence)?),
        ],
    ))
}
