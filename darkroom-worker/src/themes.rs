//! Photobook themes
//!
//! A theme is a named set of prompt templates with the audience it suits.
//! After training, every theme that applies to the subject is rendered into
//! an initial photobook.
//!
//! Templates may use `{GENDER_NOUN}`, `{PRONOUN}` and `{AGE}` placeholders.

use anyhow::{Context, Result};
use darkroom_core::domain::job::{Sex, SubjectProfile};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Who a theme is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ThemeAudience {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "U")]
    Any,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptTemplate {
    pub prompt: String,
    /// Images rendered from this template
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Theme {
    pub gender: ThemeAudience,
    pub age_min: f64,
    pub age_max: f64,
    pub prompts: Vec<PromptTemplate>,
}

impl Theme {
    pub fn applies_to(&self, subject: &SubjectProfile) -> bool {
        let gender_matches = match self.gender {
            ThemeAudience::Any => true,
            ThemeAudience::Male => subject.sex == Sex::Male,
            ThemeAudience::Female => subject.sex == Sex::Female,
        };
        let age = subject.age_in_years();

        gender_matches && age >= self.age_min && age <= self.age_max
    }

    /// Every template repeated `count` times, adapted to the subject
    pub fn expand_prompts(&self, subject: &SubjectProfile) -> Vec<String> {
        self.prompts
            .iter()
            .flat_map(|template| {
                let adapted = adapt_prompt(&template.prompt, subject);
                std::iter::repeat_n(adapted, template.count)
            })
            .collect()
    }
}

/// Fills the subject placeholders of a prompt template
pub fn adapt_prompt(template: &str, subject: &SubjectProfile) -> String {
    let (noun, pronoun) = match subject.sex {
        Sex::Male => ("boy", "he"),
        Sex::Female => ("girl", "she"),
        Sex::Unspecified => ("child", "they"),
    };
    let age = format!("{} y.o.", subject.age_in_years().trunc() as u32);

    template
        .replace("{GENDER_NOUN}", noun)
        .replace("{PRONOUN}", pronoun)
        .replace("{AGE}", &age)
}

/// Themes by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThemeCatalog {
    themes: BTreeMap<String, Theme>,
}

impl ThemeCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a JSON object mapping theme names to themes
    pub fn from_json(json: &str) -> Result<Self> {
        let themes: BTreeMap<String, Theme> =
            serde_json::from_str(json).context("Invalid theme catalog")?;
        Ok(Self { themes })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read theme catalog {}", path.display()))?;
        let catalog = Self::from_json(&json)?;
        info!(path = %path.display(), "Loaded {} theme(s)", catalog.len());
        Ok(catalog)
    }

    /// Themes suited to `subject`, in name order
    pub fn applicable<'a>(
        &'a self,
        subject: &'a SubjectProfile,
    ) -> impl Iterator<Item = (&'a str, &'a Theme)> + 'a {
        self.themes.iter().filter_map(move |(name, theme)| {
            if theme.applies_to(subject) {
                Some((name.as_str(), theme))
            } else {
                debug!(theme = %name, "Theme does not apply to subject");
                None
            }
        })
    }

    pub fn len(&self) -> usize {
        self.themes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.themes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "beach": {
            "gender": "U",
            "age_min": 1,
            "age_max": 10,
            "prompts": [
                { "prompt": "a {AGE} {GENDER_NOUN} building a sandcastle", "count": 2 },
                { "prompt": "{PRONOUN} runs into the waves" }
            ]
        },
        "knight": {
            "gender": "M",
            "age_min": 3,
            "age_max": 8,
            "prompts": [{ "prompt": "a {GENDER_NOUN} in armour", "count": 1 }]
        },
        "fairy": {
            "gender": "F",
            "age_min": 2,
            "age_max": 6,
            "prompts": [{ "prompt": "a {GENDER_NOUN} with wings", "count": 3 }]
        }
    }"#;

    fn subject(sex: Sex, years: u32, months: u32) -> SubjectProfile {
        SubjectProfile {
            sex,
            age_years: Some(years),
            age_months: Some(months),
        }
    }

    fn names<'a>(catalog: &'a ThemeCatalog, subject: &'a SubjectProfile) -> Vec<&'a str> {
        catalog.applicable(subject).map(|(name, _)| name).collect()
    }

    #[test]
    fn test_applicable_filters_by_gender_and_age() {
        let catalog = ThemeCatalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.len(), 3);

        assert_eq!(names(&catalog, &subject(Sex::Male, 4, 0)), vec!["beach", "knight"]);
        assert_eq!(names(&catalog, &subject(Sex::Female, 4, 0)), vec!["beach", "fairy"]);
        assert_eq!(names(&catalog, &subject(Sex::Female, 6, 6)), vec!["beach"]);
        assert_eq!(names(&catalog, &subject(Sex::Unspecified, 4, 0)), vec!["beach"]);
        assert!(names(&catalog, &subject(Sex::Male, 12, 0)).is_empty());
    }

    #[test]
    fn test_expand_prompts_repeats_and_adapts() {
        let catalog = ThemeCatalog::from_json(CATALOG).unwrap();
        let boy = subject(Sex::Male, 5, 11);
        let (_, beach) = catalog.applicable(&boy).next().unwrap();

        assert_eq!(
            beach.expand_prompts(&boy),
            vec![
                "a 5 y.o. boy building a sandcastle",
                "a 5 y.o. boy building a sandcastle",
                "he runs into the waves",
            ]
        );
    }

    #[test]
    fn test_adapt_prompt_for_unspecified_subject() {
        let child = SubjectProfile::default();
        assert_eq!(
            adapt_prompt("{PRONOUN} is a {AGE} {GENDER_NOUN}", &child),
            "they is a 4 y.o. child"
        );
    }

    #[test]
    fn test_invalid_catalog_is_rejected() {
        assert!(ThemeCatalog::from_json(r#"{"x": {"gender": "Q"}}"#).is_err());
        assert!(ThemeCatalog::empty().is_empty());
    }
}
