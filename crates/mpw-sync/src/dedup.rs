//! In-batch duplicate detection over fuzzy identity fields.
//!
//! Similarity is the average Jaro-Winkler score over the configured field
//! pairs (name, city, case number). Clusters are transitive: if A matches B
//! and B matches C, all three form one cluster even when A and C fall below
//! the threshold. Pairwise comparison is O(n^2) over a pipeline batch, which
//! is bounded by one source's roster.

use strsim::jaro_winkler;

use mpw_core::CaseRecord;

use crate::validate::completeness;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { threshold: 0.85 }
    }
}

#[derive(Debug, Clone)]
pub struct DedupEngine {
    config: DedupConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    pub records: Vec<CaseRecord>,
    pub dropped: usize,
    pub clusters: usize,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

fn norm(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Average similarity over the field pairs where both records carry a
    /// value. No comparable fields means no evidence of a match.
    pub fn similarity(&self, a: &CaseRecord, b: &CaseRecord) -> f64 {
        let pairs = [
            (norm(&a.name), norm(&b.name)),
            (norm(&a.city), norm(&b.city)),
            (
                Some(a.case_number.trim().to_lowercase()).filter(|s| !s.is_empty()),
                Some(b.case_number.trim().to_lowercase()).filter(|s| !s.is_empty()),
            ),
        ];

        let mut total = 0.0;
        let mut compared = 0usize;
        for (left, right) in pairs {
            if let (Some(l), Some(r)) = (left, right) {
                total += jaro_winkler(&l, &r);
                compared += 1;
            }
        }
        if compared == 0 {
            0.0
        } else {
            total / compared as f64
        }
    }

    /// Collapses duplicate records, keeping the most complete member of each
    /// cluster. Losers are dropped, never merged.
    pub fn dedup(&self, records: Vec<CaseRecord>) -> DedupOutcome {
        let n = records.len();
        if n < 2 {
            return DedupOutcome {
                clusters: n,
                dropped: 0,
                records,
            };
        }

        let mut uf = UnionFind::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                if self.similarity(&records[i], &records[j]) >= self.config.threshold {
                    uf.union(i, j);
                }
            }
        }

        // Representative per cluster: highest completeness, first wins ties.
        let mut representative: Vec<Option<usize>> = vec![None; n];
        for i in 0..n {
            let root = uf.find(i);
            match representative[root] {
                None => representative[root] = Some(i),
                Some(best) => {
                    if completeness(&records[i]) > completeness(&records[best]) {
                        representative[root] = Some(i);
                    }
                }
            }
        }

        let keep: Vec<usize> = representative.iter().filter_map(|r| *r).collect();
        let clusters = keep.len();
        let dropped = n - clusters;

        let mut keep_flags = vec![false; n];
        for idx in keep {
            keep_flags[idx] = true;
        }
        let records = records
            .into_iter()
            .zip(keep_flags)
            .filter_map(|(rec, keep)| keep.then_some(rec))
            .collect();

        DedupOutcome {
            records,
            dropped,
            clusters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(case: &str, name: &str, city: &str) -> CaseRecord {
        CaseRecord {
            case_number: case.into(),
            source_id: "namus".into(),
            name: Some(name.into()),
            city: Some(city.into()),
            ..Default::default()
        }
    }

    #[test]
    fn near_identical_names_cluster_and_most_complete_wins() {
        let mut sparse = rec("MP-1001", "John Smith", "Dayton");
        sparse.state = None;
        let mut full = rec("MP-1001", "Jon Smith", "Dayton");
        full.state = Some("OH".into());
        full.age = Some(41);
        full.description = Some("Last seen downtown.".into());

        let engine = DedupEngine::new(DedupConfig::default());
        let outcome = engine.dedup(vec![sparse, full]);
        assert_eq!(outcome.clusters, 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.records[0].name.as_deref(), Some("Jon Smith"));
        assert_eq!(outcome.records[0].age, Some(41));
    }

    #[test]
    fn distinct_cases_survive() {
        let engine = DedupEngine::new(DedupConfig::default());
        let outcome = engine.dedup(vec![
            rec("MP-1001", "John Smith", "Dayton"),
            rec("MP-7319", "Rosa Martinez", "El Paso"),
        ]);
        assert_eq!(outcome.clusters, 2);
        assert_eq!(outcome.dropped, 0);
    }

    #[test]
    fn clustering_is_transitive() {
        // a~b and b~c cluster all three even if a~c is weaker.
        let a = rec("MP-2000", "Katherine Johnson", "Hampton");
        let b = rec("MP-2000", "Katherine Johnsen", "Hampton");
        let c = rec("MP-2000", "Katheryn Johnsen", "Hampton");
        let engine = DedupEngine::new(DedupConfig::default());
        let outcome = engine.dedup(vec![a, b, c]);
        assert_eq!(outcome.clusters, 1);
        assert_eq!(outcome.dropped, 2);
    }

    #[test]
    fn dedup_is_idempotent() {
        let engine = DedupEngine::new(DedupConfig::default());
        let batch = vec![
            rec("MP-1001", "John Smith", "Dayton"),
            rec("MP-1001", "Jon Smith", "Dayton"),
            rec("MP-7319", "Rosa Martinez", "El Paso"),
        ];
        let first = engine.dedup(batch);
        let second = engine.dedup(first.records.clone());
        assert_eq!(second.records, first.records);
        assert_eq!(second.dropped, 0);
    }

    #[test]
    fn no_comparable_fields_means_no_match() {
        let a = CaseRecord {
            case_number: "".into(),
            source_id: "s".into(),
            ..Default::default()
        };
        let b = a.clone();
        let engine = DedupEngine::new(DedupConfig::default());
        assert_eq!(engine.similarity(&a, &b), 0.0);
    }
}
