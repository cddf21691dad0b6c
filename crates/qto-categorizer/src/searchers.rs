//! Exhaustive hyperparameter search with cross-validated scoring.

use std::collections::BTreeMap;

use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{Column, DType, Frame, Value};
use crate::metrics::ScoringMetric;
use crate::models::{Model, ModelKind, Params};
use crate::splitters::{Split, Splitter, SplitterKind};

/// Values to sweep for each hyperparameter.
pub type ParamGrid = BTreeMap<String, Vec<serde_json::Value>>;

/// Outcome of a search.
#[derive(Debug, Clone)]
pub struct SearchResults {
    /// One row per candidate, in sweep order.
    pub results: Frame,
    pub best_score: f64,
    pub best_params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum SearcherKind {
    GridCVSearcher(GridCVSearcher),
}

impl Default for SearcherKind {
    fn default() -> Self {
        SearcherKind::GridCVSearcher(GridCVSearcher::default())
    }
}

impl SearcherKind {
    pub fn search(
        &self,
        model: &ModelKind,
        metric: &ScoringMetric,
        inputs: &Frame,
        targets: &[String],
        cv: &SplitterKind,
    ) -> Result<SearchResults> {
        match self {
            SearcherKind::GridCVSearcher(s) => s.search(model, metric, inputs, targets, cv),
        }
    }

    pub fn param_grid(&self) -> &ParamGrid {
        match self {
            SearcherKind::GridCVSearcher(s) => &s.param_grid,
        }
    }
}

fn default_param_grid() -> ParamGrid {
    let mut grid = ParamGrid::new();
    grid.insert(
        "max_depth".to_string(),
        vec![serde_json::json!(3), serde_json::json!(5), serde_json::json!(7)],
    );
    grid
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct GridCVSearcher {
    pub param_grid: ParamGrid,
    /// Candidates evaluated concurrently, `-1` or `0` uses every core.
    pub n_jobs: i32,
}

impl Default for GridCVSearcher {
    fn default() -> Self {
        Self {
            param_grid: default_param_grid(),
            n_jobs: -1,
        }
    }
}

impl GridCVSearcher {
    /// Cartesian product of the grid; keys sorted, last key varies fastest.
    pub fn candidates(&self) -> Vec<Params> {
        let mut out = vec![Params::new()];
        for (key, values) in &self.param_grid {
            out = out
                .into_iter()
                .flat_map(|base| {
                    values.iter().map(move |v| {
                        let mut next = base.clone();
                        next.insert(key.clone(), v.clone());
                        next
                    })
                })
                .collect();
        }
        out
    }

    pub fn search(
        &self,
        model: &ModelKind,
        metric: &ScoringMetric,
        inputs: &Frame,
        targets: &[String],
        cv: &SplitterKind,
    ) -> Result<SearchResults> {
        let splits: Vec<Split> = cv.split(inputs, targets, None)?.collect();
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(Error::config("The parameter grid produced no candidates"));
        }
        log::info!(
            "[GridCVSearcher] fitting {} splits for each of {} candidates, totalling {} fits",
            splits.len(),
            candidates.len(),
            splits.len() * candidates.len()
        );

        let threads = if self.n_jobs > 0 { self.n_jobs as usize } else { 0 };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        // Each task gets its own model clone: `ModelKind` is `Send` but not `Sync`.
        let jobs: Vec<(ModelKind, &Params)> =
            candidates.iter().map(|params| (model.clone(), params)).collect();
        let scores: Vec<Vec<f64>> = pool.install(|| {
            jobs.into_par_iter()
                .map(|(model, params)| evaluate(&model, params, metric, inputs, targets, &splits))
                .collect::<Result<Vec<_>>>()
        })?;

        let means: Vec<f64> = scores.iter().map(|s| mean(s)).collect();
        let mut best = 0;
        for (i, m) in means.iter().enumerate() {
            if *m > means[best] {
                best = i;
            }
        }
        let results = results_frame(&candidates, &scores, &means)?;
        log::info!(
            "[GridCVSearcher] best score {:.4} with {:?}",
            means[best],
            candidates[best]
        );
        Ok(SearchResults {
            results,
            best_score: means[best],
            best_params: candidates[best].clone(),
        })
    }
}

fn evaluate(
    model: &ModelKind,
    params: &Params,
    metric: &ScoringMetric,
    inputs: &Frame,
    targets: &[String],
    splits: &[Split],
) -> Result<Vec<f64>> {
    splits
        .iter()
        .map(|(train, test)| {
            let mut candidate = model.clone();
            candidate.set_params(params)?;
            let train_targets: Vec<String> = train.iter().map(|&i| targets[i].clone()).collect();
            candidate.fit(&inputs.take(train), &train_targets)?;
            let test_targets: Vec<String> = test.iter().map(|&i| targets[i].clone()).collect();
            metric.scorer(&candidate, &inputs.take(test), &test_targets)
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v: &f64| (v - m) * (v - m)).sum::<f64>() / values.len() as f64).sqrt()
}

static JSON_NULL: serde_json::Value = serde_json::Value::Null;

/// Typed column from JSON cells: int64, then float64, else string.
fn json_column(name: String, cells: &[&serde_json::Value]) -> Column {
    let values: Vec<Value> = cells
        .iter()
        .map(|c| match c {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => Value::Int(v),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::Bool(b) => Value::Bool(*b),
            other => Value::Str(other.to_string()),
        })
        .collect();
    let dtype = if values.iter().all(|v| matches!(v, Value::Int(_) | Value::Null)) {
        DType::Int
    } else if values.iter().all(|v| matches!(v, Value::Int(_) | Value::Float(_) | Value::Null)) {
        DType::Float
    } else {
        DType::Str
    };
    let values = values
        .into_iter()
        .map(|v| v.cast(dtype).unwrap_or(Value::Null))
        .collect();
    Column::new(name, dtype, values)
}

fn results_frame(candidates: &[Params], scores: &[Vec<f64>], means: &[f64]) -> Result<Frame> {
    let mut columns = vec![Column::new(
        "params",
        DType::Str,
        candidates
            .iter()
            .map(|p| serde_json::to_string(p).map(Value::Str))
            .collect::<std::result::Result<Vec<_>, _>>()?,
    )];

    let keys: Vec<&String> = candidates.first().map(|p| p.keys().collect()).unwrap_or_default();
    for key in keys {
        let cells: Vec<&serde_json::Value> = candidates
            .iter()
            .map(|p| p.get(key).unwrap_or(&JSON_NULL))
            .collect();
        columns.push(json_column(format!("param_{}", key), &cells));
    }

    let n_splits = scores.first().map(|s| s.len()).unwrap_or(0);
    for split in 0..n_splits {
        let values: Vec<f64> = scores.iter().map(|s| s[split]).collect();
        columns.push(Column::floats(format!("split{}_test_score", split), &values));
    }
    columns.push(Column::floats("mean_test_score", means));
    let stds: Vec<f64> = scores.iter().map(|s| std(s)).collect();
    columns.push(Column::floats("std_test_score", &stds));

    // Rank 1 is best; equal means share the smallest rank.
    let ranks: Vec<i64> = means
        .iter()
        .map(|m| 1 + means.iter().filter(|other| *other > m).count() as i64)
        .collect();
    columns.push(Column::ints("rank_test_score", &ranks));
    Frame::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;
    use crate::models::BaselineModel;
    use crate::schemas::MERCHANT_NAME;
    use crate::splitters::{TestSize, TrainTestSplitter};

    #[test]
    fn candidates_follow_sorted_keys_last_fastest() {
        let mut grid = ParamGrid::new();
        grid.insert("b".into(), vec![serde_json::json!(1), serde_json::json!(2)]);
        grid.insert("a".into(), vec![serde_json::json!("x"), serde_json::json!("y")]);
        let searcher = GridCVSearcher { param_grid: grid, n_jobs: 1 };
        let order: Vec<(String, i64)> = searcher
            .candidates()
            .iter()
            .map(|p| (p["a"].as_str().unwrap().to_string(), p["b"].as_i64().unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![("x".into(), 1), ("x".into(), 2), ("y".into(), 1), ("y".into(), 2)]
        );
    }

    #[test]
    fn equal_scores_pick_the_first_candidate() {
        let merchants: Vec<Option<String>> = (0..8).map(|i| Some(format!("M{}", i % 2))).collect();
        let inputs = Frame::new(vec![Column::strings(MERCHANT_NAME, &merchants)]).unwrap();
        let targets: Vec<String> = (0..8).map(|i| format!("C{}", i % 2)).collect();

        let mut grid = ParamGrid::new();
        grid.insert(
            "fallback_label".into(),
            vec![serde_json::json!("first"), serde_json::json!("second")],
        );
        let searcher = GridCVSearcher { param_grid: grid, n_jobs: 2 };
        let cv = SplitterKind::TrainTestSplitter(TrainTestSplitter {
            test_size: TestSize::Count(4),
            ..TrainTestSplitter::default()
        });
        let out = searcher
            .search(
                &ModelKind::BaselineModel(BaselineModel::default()),
                &ScoringMetric::default(),
                &inputs,
                &targets,
                &cv,
            )
            .unwrap();
        assert_eq!(out.best_params["fallback_label"], serde_json::json!("first"));
        assert!((out.best_score - 1.0).abs() < 1e-12);
        assert_eq!(out.results.nrows(), 2);
        assert_eq!(
            out.results.get("rank_test_score").unwrap().values,
            vec![Value::Int(1), Value::Int(1)]
        );
        assert!(out.results.column("split0_test_score").is_some());
    }
}
