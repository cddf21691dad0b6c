//! Named classification metrics with a maximise/minimise sign.

use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::models::Model;

/// Metric names understood by [`ScoringMetric`].
pub const METRIC_NAMES: [&str; 7] = [
    "accuracy_score",
    "balanced_accuracy_score",
    "precision_score",
    "recall_score",
    "f1_score",
    "zero_one_loss",
    "hamming_loss",
];

fn default_name() -> String {
    "accuracy_score".to_string()
}

fn default_greater_is_better() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum MetricKind {
    #[serde(alias = "SklearnMetric")]
    ScoringMetric(ScoringMetric),
}

impl Default for MetricKind {
    fn default() -> Self {
        MetricKind::ScoringMetric(ScoringMetric::default())
    }
}

impl MetricKind {
    pub fn metric(&self) -> &ScoringMetric {
        match self {
            MetricKind::ScoringMetric(m) => m,
        }
    }
}

/// A scoring function; the sign makes larger always better for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ScoringMetric {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_greater_is_better")]
    pub greater_is_better: bool,
}

impl Default for ScoringMetric {
    fn default() -> Self {
        Self {
            name: default_name(),
            greater_is_better: default_greater_is_better(),
        }
    }
}

impl ScoringMetric {
    pub fn new(name: impl Into<String>, greater_is_better: bool) -> Self {
        Self {
            name: name.into(),
            greater_is_better,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if METRIC_NAMES.contains(&self.name.as_str()) {
            Ok(())
        } else {
            Err(Error::config(format!(
                "Unknown metric '{}'. Expected one of {:?}",
                self.name, METRIC_NAMES
            )))
        }
    }

    fn sign(&self) -> f64 {
        if self.greater_is_better {
            1.0
        } else {
            -1.0
        }
    }

    /// Signed score of `outputs` against `targets`.
    pub fn score(&self, targets: &[String], outputs: &[String]) -> Result<f64> {
        if targets.len() != outputs.len() {
            return Err(Error::value(format!(
                "Found {} targets but {} outputs",
                targets.len(),
                outputs.len()
            )));
        }
        if targets.is_empty() {
            return Err(Error::value("Cannot score an empty set of predictions"));
        }
        let raw = match self.name.as_str() {
            "accuracy_score" => accuracy(targets, outputs),
            "balanced_accuracy_score" => {
                let stats = per_class(targets, outputs);
                let present: Vec<&ClassStats> = stats.iter().filter(|s| s.support > 0).collect();
                present.iter().map(|s| s.recall()).sum::<f64>() / present.len() as f64
            }
            "precision_score" => macro_average(targets, outputs, ClassStats::precision),
            "recall_score" => macro_average(targets, outputs, ClassStats::recall),
            "f1_score" => macro_average(targets, outputs, ClassStats::f1),
            "zero_one_loss" | "hamming_loss" => 1.0 - accuracy(targets, outputs),
            other => {
                return Err(Error::config(format!("Unknown metric '{}'", other)));
            }
        };
        Ok(raw * self.sign())
    }

    /// Predict with `model` and score against `targets`.
    pub fn scorer(&self, model: &dyn Model, inputs: &Frame, targets: &[String]) -> Result<f64> {
        let outputs = model.predict(inputs)?;
        self.score(targets, &outputs)
    }
}

fn accuracy(targets: &[String], outputs: &[String]) -> f64 {
    let hits = targets.iter().zip(outputs).filter(|(t, o)| t == o).count();
    hits as f64 / targets.len() as f64
}

#[derive(Debug, Default)]
struct ClassStats {
    tp: usize,
    fp: usize,
    support: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl ClassStats {
    fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    fn recall(&self) -> f64 {
        ratio(self.tp, self.support)
    }

    fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

/// Stats for every label seen in either targets or outputs.
fn per_class(targets: &[String], outputs: &[String]) -> Vec<ClassStats> {
    let labels: BTreeSet<&String> = targets.iter().chain(outputs).collect();
    labels
        .into_iter()
        .map(|label| {
            let mut stats = ClassStats::default();
            for (t, o) in targets.iter().zip(outputs) {
                match (t == label, o == label) {
                    (true, true) => {
                        stats.tp += 1;
                        stats.support += 1;
                    }
                    (true, false) => stats.support += 1,
                    (false, true) => stats.fp += 1,
                    (false, false) => {}
                }
            }
            stats
        })
        .collect()
}

fn macro_average(targets: &[String], outputs: &[String], f: fn(&ClassStats) -> f64) -> f64 {
    let stats = per_class(targets, outputs);
    stats.iter().map(f).sum::<f64>() / stats.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn accuracy_and_sign() {
        let t = labels(&["a", "a", "b", "b"]);
        let o = labels(&["a", "b", "b", "b"]);
        assert!((ScoringMetric::default().score(&t, &o).unwrap() - 0.75).abs() < 1e-12);
        let loss = ScoringMetric::new("zero_one_loss", false);
        assert!((loss.score(&t, &o).unwrap() + 0.25).abs() < 1e-12);
    }

    #[test]
    fn macro_f1_averages_classes() {
        let t = labels(&["a", "a", "b", "b"]);
        let o = labels(&["a", "b", "b", "b"]);
        // a: p=1, r=0.5, f1=2/3 ; b: p=2/3, r=1, f1=0.8
        let f1 = ScoringMetric::new("f1_score", true).score(&t, &o).unwrap();
        assert!((f1 - (2.0 / 3.0 + 0.8) / 2.0).abs() < 1e-12);
        let balanced = ScoringMetric::new("balanced_accuracy_score", true).score(&t, &o).unwrap();
        assert!((balanced - 0.75).abs() < 1e-12);
    }

    #[test]
    fn unknown_names_fail_validation() {
        assert!(ScoringMetric::new("r2_score", true).validate().is_err());
        assert!(ScoringMetric::default().validate().is_ok());
    }

    #[test]
    fn rejects_length_mismatch() {
        assert!(ScoringMetric::default()
            .score(&labels(&["a"]), &labels(&["a", "b"]))
            .is_err());
    }
}
