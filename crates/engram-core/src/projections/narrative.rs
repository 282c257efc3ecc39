//! Narrative builder.
//!
//! Takes a time-bounded query, clusters the window's memories into chapters
//! by temporal proximity and tag overlap, and hands the chapters to the
//! synthesizer. Gap-filled details are labeled as inferred.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::EngramConfig;
use crate::error::{EngramError, Result};
use crate::memory::{MemoryLayer, MemoryRecord};
use crate::oracle::{with_deadline, GroundingMemory, LanguageOracle, SynthesisRequest};
use crate::retrieval::{RetrievalEngine, RetrievalFilters, RetrievalRequest, SortOrder};

/// Gap that starts a new chapter
const CHAPTER_GAP_HOURS: i64 = 48;

/// Layers a narrative draws from
const NARRATIVE_LAYERS: &[MemoryLayer] = &[
    MemoryLayer::Episodic,
    MemoryLayer::Semantic,
    MemoryLayer::Procedural,
];

/// Request for one narrative
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NarrativeRequest {
    #[serde(alias = "user_id")]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    /// Optional focus topic woven into the prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

/// A clustered chapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub title: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub memory_ids: Vec<String>,
    pub tags: Vec<String>,
}

/// Narrative output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Narrative {
    pub narrative: String,
    pub chapters: Vec<Chapter>,
    pub memory_count: usize,
}

/// The narrative builder
pub struct NarrativeBuilder {
    retrieval: Arc<RetrievalEngine>,
    oracle: Option<Arc<dyn LanguageOracle>>,
    config: EngramConfig,
}

impl NarrativeBuilder {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        oracle: Option<Arc<dyn LanguageOracle>>,
        config: EngramConfig,
    ) -> Self {
        Self {
            retrieval,
            oracle,
            config,
        }
    }

    /// Build a narrative for the window
    pub async fn build(&self, request: NarrativeRequest) -> Result<Narrative> {
        if !self.config.synthesis_enabled {
            return Err(EngramError::Dependency("synthesis is disabled".into()));
        }
        let oracle = self
            .oracle
            .clone()
            .ok_or_else(|| EngramError::Dependency("no language oracle configured".into()))?;

        let memories = self.window_memories(&request).await?;
        if memories.is_empty() {
            return Ok(Narrative {
                narrative: String::new(),
                chapters: vec![],
                memory_count: 0,
            });
        }

        let chapters = cluster_chapters(&memories);

        let grounding: Vec<GroundingMemory> = memories
            .iter()
            .map(|memory| GroundingMemory {
                id: memory.id.clone(),
                content: memory.content.clone(),
            })
            .collect();
        let focus_line = request
            .focus
            .as_deref()
            .map(|focus| format!(" Focus on: {focus}."))
            .unwrap_or_default();
        let chapter_lines: Vec<String> = chapters
            .iter()
            .map(|chapter| {
                format!(
                    "- {} ({} to {}): {} memories",
                    chapter.title,
                    chapter.from.format("%Y-%m-%d"),
                    chapter.to.format("%Y-%m-%d"),
                    chapter.memory_ids.len()
                )
            })
            .collect();
        let prompt = format!(
            "Write a first-person narrative of this period from the memories below, \
             following the chapter structure. Keep chronology. Any detail not \
             grounded in a memory must be labeled (inferred).{focus_line}\n\nChapters:\n{}",
            chapter_lines.join("\n")
        );

        let narrative = with_deadline(self.config.llm_timeout, "narrative synthesis", async {
            oracle
                .synthesize(&SynthesisRequest { prompt, grounding })
                .await
        })
        .await?;

        Ok(Narrative {
            narrative,
            memory_count: memories.len(),
            chapters,
        })
    }

    async fn window_memories(&self, request: &NarrativeRequest) -> Result<Vec<MemoryRecord>> {
        let results = self
            .retrieval
            .retrieve(RetrievalRequest {
                user_id: request.user_id.clone(),
                query: None,
                filters: RetrievalFilters {
                    from: request.from,
                    to: request.to,
                    ..Default::default()
                },
                limit: 100,
                offset: 0,
                options: crate::retrieval::RetrievalOptions {
                    sort: SortOrder::Oldest,
                    ..Default::default()
                },
            })
            .await?;
        Ok(results
            .results
            .into_iter()
            .map(|scored| scored.memory)
            .filter(|memory| NARRATIVE_LAYERS.contains(&memory.layer))
            .collect())
    }
}

/// Cluster memories (assumed oldest-first) into chapters: a temporal gap of
/// more than 48 hours starts a new chapter; adjacent clusters sharing a
/// dominant tag are merged. Chapter titles come from the dominant tag.
pub fn cluster_chapters(memories: &[MemoryRecord]) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut current: Vec<&MemoryRecord> = Vec::new();

    let flush = |group: &[&MemoryRecord], chapters: &mut Vec<Chapter>| {
        if group.is_empty() {
            return;
        }
        let mut tag_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for memory in group {
            for tag in &memory.tags {
                *tag_counts.entry(tag.as_str()).or_default() += 1;
            }
        }
        let dominant = tag_counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(tag, _)| (*tag).to_string());
        let tags: Vec<String> = tag_counts.keys().map(|t| (*t).to_string()).collect();
        let title = dominant.unwrap_or_else(|| {
            group[0]
                .created_at
                .format("Week of %Y-%m-%d")
                .to_string()
        });

        // Merge with the previous chapter when the dominant tag overlaps
        if let Some(last) = chapters.last_mut() {
            if last.title == title && !title.starts_with("Week of ") {
                last.to = group.last().map(|m| m.created_at).unwrap_or(last.to);
                last.memory_ids
                    .extend(group.iter().map(|m| m.id.clone()));
                for tag in tags {
                    if !last.tags.contains(&tag) {
                        last.tags.push(tag);
                    }
                }
                return;
            }
        }

        chapters.push(Chapter {
            title,
            from: group.first().map(|m| m.created_at).unwrap_or_else(Utc::now),
            to: group.last().map(|m| m.created_at).unwrap_or_else(Utc::now),
            memory_ids: group.iter().map(|m| m.id.clone()).collect(),
            tags,
        });
    };

    for memory in memories {
        if let Some(previous) = current.last() {
            let gap = memory.created_at - previous.created_at;
            if gap > Duration::hours(CHAPTER_GAP_HOURS) {
                flush(&current, &mut chapters);
                current.clear();
            }
        }
        current.push(memory);
    }
    flush(&current, &mut chapters);
    chapters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLayer;

    fn memory_at(days_ago: i64, tags: &[&str]) -> MemoryRecord {
        let mut memory = MemoryRecord::new("u1", format!("event {days_ago}"), MemoryLayer::Episodic);
        memory.created_at = Utc::now() - Duration::days(days_ago);
        memory.tags = tags.iter().map(|t| t.to_string()).collect();
        memory
    }

    #[test]
    fn test_gap_starts_new_chapter() {
        let memories = vec![
            memory_at(10, &["trip"]),
            memory_at(9, &["trip"]),
            // five-day gap
            memory_at(4, &["work"]),
            memory_at(3, &["work"]),
        ];
        let chapters = cluster_chapters(&memories);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "trip");
        assert_eq!(chapters[1].title, "work");
        assert_eq!(chapters[0].memory_ids.len(), 2);
    }

    #[test]
    fn test_adjacent_clusters_with_same_tag_merge() {
        let memories = vec![
            memory_at(10, &["marathon"]),
            // four-day gap but the same dominant tag
            memory_at(6, &["marathon"]),
        ];
        let chapters = cluster_chapters(&memories);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].memory_ids.len(), 2);
    }

    #[test]
    fn test_untagged_chapter_gets_week_title() {
        let memories = vec![memory_at(2, &[])];
        let chapters = cluster_chapters(&memories);
        assert_eq!(chapters.len(), 1);
        assert!(chapters[0].title.starts_with("Week of "));
    }
}
