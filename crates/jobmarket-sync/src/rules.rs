//! Externally maintained lookup tables: skill vocabulary, city aliases and
//! optional extractor selector overrides.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use jobmarket_adapters::ListingSelectors;
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SkillRule {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SkillRulesFile {
    #[serde(default)]
    pub skills: Vec<SkillRule>,
    #[serde(default)]
    pub title_stopwords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CityRulesFile {
    /// Lower-case alias to canonical city name.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub skills: SkillRulesFile,
    pub cities: CityRulesFile,
    pub selectors: ListingSelectors,
}

impl RuleSet {
    pub fn load(rules_dir: &Path) -> Result<Self> {
        let skills: SkillRulesFile = read_yaml(&rules_dir.join("skills.yaml"))?;
        if skills.skills.is_empty() {
            bail!("{} defines no skills", rules_dir.join("skills.yaml").display());
        }
        let cities: CityRulesFile = read_yaml(&rules_dir.join("cities.yaml"))?;

        let selectors_path = rules_dir.join("selectors.yaml");
        let selectors = if selectors_path.exists() {
            read_yaml(&selectors_path)?
        } else {
            ListingSelectors::default()
        };

        Ok(Self {
            skills,
            cities,
            selectors,
        })
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
