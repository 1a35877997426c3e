//! Session configuration: defaults → formula → explicit arguments
//!
//! `RunConfig` is the immutable snapshot stored on `Run` at session start
//! (spec §9 "Ambient config / formulas"). Mutations after start (hints,
//! skip_review toggles) live on the run state only, never here.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A named bundle of session config defaults, loaded from
/// `.blockspool/formulas/<name>.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Formula {
    pub name: String,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub min_impact_score: Option<u8>,
    #[serde(default)]
    pub min_confidence: Option<u8>,
    #[serde(default)]
    pub create_prs: Option<bool>,
    #[serde(default)]
    pub draft: Option<bool>,
    #[serde(default)]
    pub direct: Option<bool>,
    #[serde(default)]
    pub parallel: Option<u32>,
    #[serde(default)]
    pub cross_verify: Option<bool>,
    #[serde(default)]
    pub skip_review: Option<bool>,
    #[serde(default)]
    pub learnings_enabled: Option<bool>,
    #[serde(default)]
    pub qa_commands: Option<Vec<String>>,
    #[serde(default)]
    pub step_budget: Option<u32>,
    #[serde(default)]
    pub ticket_step_budget: Option<u32>,
    #[serde(default)]
    pub max_prs: Option<u32>,
}

impl Formula {
    pub fn load(path: &Path) -> Result<Self, crate::error::EngineError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// The session's explicit CLI/tool arguments. All fields optional — `None`
/// means "defer to the formula, or the hard-coded default".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub categories: Option<Vec<String>>,
    pub min_impact_score: Option<u8>,
    pub min_confidence: Option<u8>,
    pub create_prs: Option<bool>,
    pub draft: Option<bool>,
    pub direct: Option<bool>,
    pub parallel: Option<u32>,
    pub cross_verify: Option<bool>,
    pub skip_review: Option<bool>,
    pub learnings_enabled: Option<bool>,
    pub qa_commands: Option<Vec<String>>,
    pub step_budget: Option<u32>,
    pub ticket_step_budget: Option<u32>,
    pub max_prs: Option<u32>,
    pub dry_run: Option<bool>,
}

/// The fully-resolved, immutable config snapshotted onto `Run` at start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub scope: Vec<String>,
    pub categories: Vec<String>,
    /// Retained as an execution hint only, never a filter (spec §4.8 step 3,
    /// Open Question b).
    pub min_confidence: u8,
    pub min_impact_score: u8,
    pub create_prs: bool,
    pub draft: bool,
    pub direct: bool,
    pub parallel: u32,
    pub cross_verify: bool,
    pub skip_review: bool,
    pub dry_run: bool,
    pub learnings_enabled: bool,
    pub qa_commands: Vec<String>,
    pub formula: Option<String>,
    pub step_budget: u32,
    pub ticket_step_budget: u32,
    pub max_prs: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scope: Vec::new(),
            categories: vec![
                "refactor".into(),
                "test".into(),
                "docs".into(),
                "perf".into(),
                "security".into(),
                "fix".into(),
            ],
            min_confidence: 50,
            min_impact_score: 3,
            create_prs: true,
            draft: false,
            direct: false,
            parallel: 1,
            cross_verify: false,
            skip_review: false,
            dry_run: false,
            learnings_enabled: true,
            qa_commands: Vec::new(),
            formula: None,
            step_budget: 200,
            ticket_step_budget: 40,
            max_prs: 10,
        }
    }
}

impl RunConfig {
    /// Compose defaults → formula → explicit overrides, in that priority
    /// order (later wins).
    pub fn compose(formula: Option<&Formula>, overrides: &ConfigOverrides) -> Self {
        let mut cfg = Self::default();

        if let Some(f) = formula {
            cfg.formula = Some(f.name.clone());
            if let Some(v) = &f.categories {
                cfg.categories = v.clone();
            }
            if let Some(v) = f.min_impact_score {
                cfg.min_impact_score = v;
            }
            if let Some(v) = f.min_confidence {
                cfg.min_confidence = v;
            }
            if let Some(v) = f.create_prs {
                cfg.create_prs = v;
            }
            if let Some(v) = f.draft {
                cfg.draft = v;
            }
            if let Some(v) = f.direct {
                cfg.direct = v;
            }
            if let Some(v) = f.parallel {
                cfg.parallel = v;
            }
            if let Some(v) = f.cross_verify {
                cfg.cross_verify = v;
            }
            if let Some(v) = f.skip_review {
                cfg.skip_review = v;
            }
            if let Some(v) = f.learnings_enabled {
                cfg.learnings_enabled = v;
            }
            if let Some(v) = &f.qa_commands {
                cfg.qa_commands = v.clone();
            }
            if let Some(v) = f.step_budget {
                cfg.step_budget = v;
            }
            if let Some(v) = f.ticket_step_budget {
                cfg.ticket_step_budget = v;
            }
            if let Some(v) = f.max_prs {
                cfg.max_prs = v;
            }
        }

        if let Some(v) = &overrides.categories {
            cfg.categories = v.clone();
        }
        if let Some(v) = overrides.min_impact_score {
            cfg.min_impact_score = v;
        }
        if let Some(v) = overrides.min_confidence {
            cfg.min_confidence = v;
        }
        if let Some(v) = overrides.create_prs {
            cfg.create_prs = v;
        }
        if let Some(v) = overrides.draft {
            cfg.draft = v;
        }
        if let Some(v) = overrides.direct {
            cfg.direct = v;
        }
        if let Some(v) = overrides.parallel {
            cfg.parallel = v;
        }
        if let Some(v) = overrides.cross_verify {
            cfg.cross_verify = v;
        }
        if let Some(v) = overrides.skip_review {
            cfg.skip_review = v;
        }
        if let Some(v) = overrides.learnings_enabled {
            cfg.learnings_enabled = v;
        }
        if let Some(v) = &overrides.qa_commands {
            cfg.qa_commands = v.clone();
        }
        if let Some(v) = overrides.step_budget {
            cfg.step_budget = v;
        }
        if let Some(v) = overrides.ticket_step_budget {
            cfg.ticket_step_budget = v;
        }
        if let Some(v) = overrides.max_prs {
            cfg.max_prs = v;
        }
        if let Some(v) = overrides.dry_run {
            cfg.dry_run = v;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_overrides_win_over_formula() {
        let formula = Formula {
            name: "conservative".into(),
            max_prs: Some(2),
            ..Default::default()
        };
        let overrides = ConfigOverrides {
            max_prs: Some(5),
            ..Default::default()
        };
        let cfg = RunConfig::compose(Some(&formula), &overrides);
        assert_eq!(cfg.max_prs, 5);
        assert_eq!(cfg.formula.as_deref(), Some("conservative"));
    }

    #[test]
    fn formula_wins_over_hardcoded_default() {
        let formula = Formula {
            name: "aggressive".into(),
            parallel: Some(4),
            ..Default::default()
        };
        let cfg = RunConfig::compose(Some(&formula), &ConfigOverrides::default());
        assert_eq!(cfg.parallel, 4);
    }

    #[test]
    fn no_formula_no_overrides_yields_defaults() {
        let cfg = RunConfig::compose(None, &ConfigOverrides::default());
        assert_eq!(cfg, RunConfig::default());
    }

    #[test]
    fn formula_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggressive.yaml");
        std::fs::write(
            &path,
            "name: aggressive\nparallel: 3\ncreate_prs: true\n",
        )
        .unwrap();
        let f = Formula::load(&path).unwrap();
        assert_eq!(f.name, "aggressive");
        assert_eq!(f.parallel, Some(3));
    }
}
