use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::types::ConsultantId;

/// A sales consultant as seen by the distribution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consultant {
    pub id: ConsultantId,
    pub name: String,
    /// Leads per dispatch cycle.
    pub weight: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Consultant {
    pub fn new(id: u64, name: impl Into<String>, weight: u32) -> Self {
        Self {
            id: ConsultantId(id),
            name: name.into(),
            weight,
            active: true,
        }
    }

    /// Weight that counts toward the next cycle; inactive consultants get none.
    pub fn effective_weight(&self) -> u32 {
        if self.active {
            self.weight
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// WeightTable
// ---------------------------------------------------------------------------

/// Source of the current `(consultant, weight)` pairs.
///
/// Implementations return entries in their natural retrieval order; that
/// order breaks ties between equal weights when a cycle is built.
pub trait WeightTable: Send + Sync {
    fn list_consultant_weights(&self) -> Result<Vec<(ConsultantId, u32)>>;
}

impl<T: WeightTable + ?Sized> WeightTable for Arc<T> {
    fn list_consultant_weights(&self) -> Result<Vec<(ConsultantId, u32)>> {
        (**self).list_consultant_weights()
    }
}

/// Fixed, in-memory weight table for callers that keep weights elsewhere.
#[derive(Debug, Clone, Default)]
pub struct StaticWeights {
    entries: Vec<(ConsultantId, u32)>,
}

impl StaticWeights {
    pub fn new(entries: impl IntoIterator<Item = (ConsultantId, u32)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

impl FromIterator<Consultant> for StaticWeights {
    fn from_iter<I: IntoIterator<Item = Consultant>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|c| (c.id, c.effective_weight())))
    }
}

impl WeightTable for StaticWeights {
    fn list_consultant_weights(&self) -> Result<Vec<(ConsultantId, u32)>> {
        Ok(self.entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_consultant_has_no_weight() {
        let mut c = Consultant::new(1, "Li", 4);
        assert_eq!(c.effective_weight(), 4);
        c.active = false;
        assert_eq!(c.effective_weight(), 0);
    }

    #[test]
    fn static_weights_keep_retrieval_order() {
        let table: StaticWeights = vec![
            Consultant::new(3, "Zhao", 1),
            Consultant::new(1, "Qian", 2),
        ]
        .into_iter()
        .collect();
        let listed = table.list_consultant_weights().unwrap();
        assert_eq!(listed, vec![(ConsultantId(3), 1), (ConsultantId(1), 2)]);
    }

    #[test]
    fn active_defaults_to_true_when_missing() {
        let c: Consultant = serde_json::from_str(r#"{"id":5,"name":"Sun","weight":2}"#).unwrap();
        assert!(c.active);
    }
}
