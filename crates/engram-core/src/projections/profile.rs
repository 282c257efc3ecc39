//! Profile projector.
//!
//! Maintains a per-user projection across a fixed category set. Fields are
//! populated by enrichment observations and can be overwritten by explicit
//! user PUTs. Confidence is a weighted blend of frequency, recency,
//! explicitness and source diversity; an audit table links each field to the
//! memory ids that contributed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngramError, Result};
use crate::stores::relational::ConfidenceComponents;
use crate::stores::RelationalStore;

/// The fixed category set
pub const PROFILE_CATEGORIES: &[&str] = &[
    "basics",
    "preferences",
    "goals",
    "interests",
    "background",
    "health",
    "personality",
    "values",
];

/// Canonical fields per category; the completeness denominator
const FIELD_REGISTRY: &[(&str, &[&str])] = &[
    ("basics", &["name", "age", "location", "occupation", "timezone"]),
    ("preferences", &["communication_style", "food", "music", "schedule"]),
    ("goals", &["short_term", "long_term", "current_focus"]),
    ("interests", &["hobbies", "topics", "sports"]),
    ("background", &["education", "career_history", "hometown"]),
    ("health", &["conditions", "fitness_routine", "sleep_pattern"]),
    ("personality", &["traits", "strengths", "stressors"]),
    ("values", &["core_values", "priorities"]),
];

/// Confidence blend weights
const WEIGHT_FREQUENCY: f64 = 0.30;
const WEIGHT_RECENCY: f64 = 0.25;
const WEIGHT_EXPLICITNESS: f64 = 0.25;
const WEIGHT_DIVERSITY: f64 = 0.20;

/// Recency half-life-ish horizon in days
const RECENCY_DECAY_DAYS: f64 = 30.0;

/// Fields in a category, empty for unknown categories
pub fn category_fields(category: &str) -> &'static [&'static str] {
    FIELD_REGISTRY
        .iter()
        .find(|(name, _)| *name == category)
        .map(|(_, fields)| *fields)
        .unwrap_or(&[])
}

/// Total registry field count across all categories
pub fn total_registry_fields() -> usize {
    FIELD_REGISTRY.iter().map(|(_, fields)| fields.len()).sum()
}

/// One enrichment-derived observation about the user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileObservation {
    pub category: String,
    pub field: String,
    pub value: String,
    /// Stated by the user (true) or inferred (false)
    pub explicit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
}

/// One populated field in the projection view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFieldView {
    pub field: String,
    pub value: String,
    pub confidence: f64,
    pub explicitness: f64,
    pub updated_at: DateTime<Utc>,
    pub sources: Vec<String>,
}

/// Per-user projection view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub user_id: String,
    pub categories: BTreeMap<String, Vec<ProfileFieldView>>,
}

/// Completeness report
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCompleteness {
    pub populated_fields: usize,
    pub total_fields: usize,
    pub percent: f64,
}

/// The profile projector
pub struct ProfileProjector {
    relational: Arc<RelationalStore>,
}

impl ProfileProjector {
    pub fn new(relational: Arc<RelationalStore>) -> Self {
        Self { relational }
    }

    /// Fold one observation into the projection, recomputing the confidence
    /// blend from the full audit trail.
    pub fn apply_observation(
        &self,
        user_id: &str,
        observation: &ProfileObservation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let category = observation.category.to_lowercase();
        if !PROFILE_CATEGORIES.contains(&category.as_str()) {
            return Err(EngramError::Validation(format!(
                "unknown profile category: {}",
                observation.category
            )));
        }
        self.relational.ensure_profile(user_id, now)?;

        if let Some(memory_id) = &observation.memory_id {
            self.relational
                .add_profile_source(user_id, &category, &observation.field, memory_id, now)?;
        }

        let sources = self
            .relational
            .list_profile_sources(user_id, &category, &observation.field)?;
        let components = blend(&sources, observation.explicit, now);

        // An explicit PUT wins over inferred observations; otherwise the last
        // observation's value stands.
        let existing = self
            .relational
            .get_profile_fields(user_id, Some(&category))?
            .into_iter()
            .find(|row| row.field == observation.field);
        if let Some(existing) = &existing {
            if existing.explicitness >= 1.0 && !observation.explicit {
                // keep the user-stated value, still refresh confidence
                self.relational.upsert_confidence_scores(
                    user_id,
                    &category,
                    &observation.field,
                    components,
                    now,
                )?;
                return Ok(());
            }
        }

        self.relational.upsert_profile_field(
            user_id,
            &category,
            &observation.field,
            &observation.value,
            components.blended,
            if observation.explicit { 1.0 } else { 0.5 },
            now,
        )?;
        self.relational.upsert_confidence_scores(
            user_id,
            &category,
            &observation.field,
            components,
            now,
        )?;
        Ok(())
    }

    /// Explicit user PUT: overwrite with full confidence
    pub fn set_field(
        &self,
        user_id: &str,
        category: &str,
        field: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let category = category.to_lowercase();
        if !PROFILE_CATEGORIES.contains(&category.as_str()) {
            return Err(EngramError::Validation(format!(
                "unknown profile category: {category}"
            )));
        }
        if value.trim().is_empty() {
            return Err(EngramError::validation("value is required"));
        }
        self.relational.ensure_profile(user_id, now)?;
        self.relational
            .upsert_profile_field(user_id, &category, field, value, 1.0, 1.0, now)?;
        self.relational.upsert_confidence_scores(
            user_id,
            &category,
            field,
            ConfidenceComponents {
                frequency: 1.0,
                recency: 1.0,
                explicitness: 1.0,
                diversity: 1.0,
                blended: 1.0,
            },
            now,
        )?;
        Ok(())
    }

    /// Projection view, optionally restricted to one category
    pub fn view(&self, user_id: &str, category: Option<&str>) -> Result<ProfileView> {
        if let Some(category) = category {
            if !PROFILE_CATEGORIES.contains(&category.to_lowercase().as_str()) {
                return Err(EngramError::Validation(format!(
                    "unknown profile category: {category}"
                )));
            }
        }
        let rows = self.relational.get_profile_fields(user_id, category)?;
        let mut categories: BTreeMap<String, Vec<ProfileFieldView>> = BTreeMap::new();
        for row in rows {
            let sources = self
                .relational
                .list_profile_sources(user_id, &row.category, &row.field)?
                .into_iter()
                .map(|(memory_id, _)| memory_id)
                .collect();
            categories
                .entry(row.category.clone())
                .or_default()
                .push(ProfileFieldView {
                    field: row.field,
                    value: row.value,
                    confidence: row.confidence,
                    explicitness: row.explicitness,
                    updated_at: row.updated_at,
                    sources,
                });
        }
        Ok(ProfileView {
            user_id: user_id.to_string(),
            categories,
        })
    }

    /// Completeness = populated registry fields / total registry fields
    pub fn completeness(&self, user_id: &str) -> Result<ProfileCompleteness> {
        let rows = self.relational.get_profile_fields(user_id, None)?;
        let populated = rows
            .iter()
            .filter(|row| category_fields(&row.category).contains(&row.field.as_str()))
            .count();
        let total = total_registry_fields();
        Ok(ProfileCompleteness {
            populated_fields: populated,
            total_fields: total,
            percent: if total == 0 {
                0.0
            } else {
                populated as f64 / total as f64 * 100.0
            },
        })
    }
}

/// Confidence blend: frequency 0.30, recency 0.25, explicitness 0.25,
/// source diversity 0.20.
fn blend(
    sources: &[(String, DateTime<Utc>)],
    explicit: bool,
    now: DateTime<Utc>,
) -> ConfidenceComponents {
    let frequency = (sources.len() as f64 / 5.0).min(1.0);
    let recency = sources
        .first()
        .map(|(_, at)| {
            let days = (now - *at).num_seconds().max(0) as f64 / 86_400.0;
            (-days / RECENCY_DECAY_DAYS).exp()
        })
        .unwrap_or(1.0);
    let explicitness = if explicit { 1.0 } else { 0.5 };
    let distinct: std::collections::HashSet<&str> =
        sources.iter().map(|(id, _)| id.as_str()).collect();
    let diversity = (distinct.len() as f64 / 3.0).min(1.0);

    ConfidenceComponents {
        frequency,
        recency,
        explicitness,
        diversity,
        blended: WEIGHT_FREQUENCY * frequency
            + WEIGHT_RECENCY * recency
            + WEIGHT_EXPLICITNESS * explicitness
            + WEIGHT_DIVERSITY * diversity,
    }
}
