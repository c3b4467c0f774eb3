//! Example memory
//!
//! Past goals and how they were planned. The planner shows the closest ones
//! to the reasoner as hints; they never constrain the plan.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A previously planned goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Example {
    pub query: String,
    /// Short description of the plan that worked, e.g. "list_facilities -> get_facility"
    pub plan_summary: String,
    /// Similarity to the query it was retrieved for, 0-1
    #[serde(default)]
    pub score: f64,
}

#[async_trait]
pub trait ExampleMemory: Send + Sync {
    /// Up to `limit` examples most similar to `query`, best first
    async fn similar(&self, query: &str, limit: usize) -> Result<Vec<Example>, EngineError>;
}

/// Fixed set of examples ranked by keyword overlap
#[derive(Debug, Clone, Default)]
pub struct StaticExampleMemory {
    examples: Vec<Example>,
}

impl StaticExampleMemory {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    pub fn remember(&mut self, query: impl Into<String>, plan_summary: impl Into<String>) {
        self.examples.push(Example {
            query: query.into(),
            plan_summary: plan_summary.into(),
            score: 0.0,
        });
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Lowercased words of three or more characters
pub(crate) fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[async_trait]
impl ExampleMemory for StaticExampleMemory {
    async fn similar(&self, query: &str, limit: usize) -> Result<Vec<Example>, EngineError> {
        let wanted = keywords(query);
        let mut hits: Vec<Example> = self
            .examples
            .iter()
            .map(|e| Example {
                score: jaccard(&wanted, &keywords(&e.query)),
                ..e.clone()
            })
            .filter(|e| e.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}
