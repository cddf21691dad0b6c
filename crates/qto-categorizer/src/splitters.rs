//! Train/test index splitters.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Row positions of one train/test partition.
pub type Split = (Vec<usize>, Vec<usize>);

/// Lazy sequence of splits.
pub type Splits = Box<dyn Iterator<Item = Split> + Send>;

pub trait Splitter {
    fn split(&self, inputs: &Frame, targets: &[String], groups: Option<&[String]>) -> Result<Splits>;

    fn get_n_splits(&self, inputs: &Frame, targets: &[String], groups: Option<&[String]>) -> usize;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum SplitterKind {
    TrainTestSplitter(TrainTestSplitter),
}

impl Default for SplitterKind {
    fn default() -> Self {
        SplitterKind::TrainTestSplitter(TrainTestSplitter::default())
    }
}

impl Splitter for SplitterKind {
    fn split(&self, inputs: &Frame, targets: &[String], groups: Option<&[String]>) -> Result<Splits> {
        match self {
            SplitterKind::TrainTestSplitter(s) => s.split(inputs, targets, groups),
        }
    }

    fn get_n_splits(&self, inputs: &Frame, targets: &[String], groups: Option<&[String]>) -> usize {
        match self {
            SplitterKind::TrainTestSplitter(s) => s.get_n_splits(inputs, targets, groups),
        }
    }
}

/// Absolute row count or a fraction of the rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum TestSize {
    Count(usize),
    Fraction(f64),
}

impl TestSize {
    fn rows(&self, n: usize) -> Result<usize> {
        let n_test = match *self {
            TestSize::Count(c) => c,
            TestSize::Fraction(f) if f > 0.0 && f < 1.0 => (f * n as f64).ceil() as usize,
            TestSize::Fraction(f) => {
                return Err(Error::config(format!("test_size={} should be in the (0, 1) range", f)));
            }
        };
        if n_test == 0 || n_test >= n {
            return Err(Error::value(format!(
                "With n_samples={} and test_size={:?}, one of the resulting sets would be empty",
                n, self
            )));
        }
        Ok(n_test)
    }
}

/// Single shuffled (optionally stratified) holdout split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct TrainTestSplitter {
    pub test_size: TestSize,
    pub random_state: u64,
    pub shuffle: bool,
    pub stratify: bool,
}

impl Default for TrainTestSplitter {
    fn default() -> Self {
        Self {
            test_size: TestSize::Fraction(0.2),
            random_state: 42,
            shuffle: true,
            stratify: true,
        }
    }
}

impl TrainTestSplitter {
    fn holdout(&self, targets: &[String]) -> Result<Split> {
        let n = targets.len();
        let n_test = self.test_size.rows(n)?;
        let mut rng = StdRng::seed_from_u64(self.random_state);

        if !self.shuffle {
            if self.stratify {
                return Err(Error::config("Stratified train/test split is not implemented for shuffle=false"));
            }
            let n_train = n - n_test;
            return Ok(((0..n_train).collect(), (n_train..n).collect()));
        }

        if !self.stratify {
            let mut perm: Vec<usize> = (0..n).collect();
            perm.shuffle(&mut rng);
            let test = perm[..n_test].to_vec();
            let train = perm[n_test..].to_vec();
            return Ok((train, test));
        }

        let mut classes: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, t) in targets.iter().enumerate() {
            classes.entry(t.as_str()).or_default().push(i);
        }
        if let Some((label, rows)) = classes.iter().find(|(_, rows)| rows.len() < 2) {
            return Err(Error::value(format!(
                "The least populated class '{}' has only {} member, which is too few. \
                 The minimum number of members in any class cannot be less than 2.",
                label,
                rows.len()
            )));
        }
        if n_test < classes.len() || n - n_test < classes.len() {
            return Err(Error::value(format!(
                "Both the train and test sets need at least {} rows (one per class), got test={} train={}",
                classes.len(),
                n_test,
                n - n_test
            )));
        }

        let counts: Vec<usize> = classes.values().map(|rows| rows.len()).collect();
        let allocation = approximate_mode(&counts, n_test);

        let mut train = Vec::with_capacity(n - n_test);
        let mut test = Vec::with_capacity(n_test);
        for (rows, take) in classes.into_values().zip(allocation) {
            let mut rows = rows;
            rows.shuffle(&mut rng);
            test.extend_from_slice(&rows[..take]);
            train.extend_from_slice(&rows[take..]);
        }
        train.shuffle(&mut rng);
        test.shuffle(&mut rng);
        Ok((train, test))
    }
}

/// Split `draws` across classes proportionally to `counts`; leftovers go to
/// the largest remainders, first class on ties.
fn approximate_mode(counts: &[usize], draws: usize) -> Vec<usize> {
    let total: usize = counts.iter().sum();
    let exact: Vec<f64> = counts
        .iter()
        .map(|&c| draws as f64 * c as f64 / total as f64)
        .collect();
    let mut alloc: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();
    let mut leftover = draws - alloc.iter().sum::<usize>();
    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });
    for &i in order.iter().cycle() {
        if leftover == 0 {
            break;
        }
        if alloc[i] < counts[i] {
            alloc[i] += 1;
            leftover -= 1;
        }
    }
    alloc
}

impl Splitter for TrainTestSplitter {
    fn split(&self, inputs: &Frame, targets: &[String], _groups: Option<&[String]>) -> Result<Splits> {
        if inputs.nrows() != targets.len() {
            return Err(Error::value(format!(
                "Found {} input rows but {} targets",
                inputs.nrows(),
                targets.len()
            )));
        }
        let split = self.holdout(targets)?;
        log::debug!(
            "[TrainTestSplitter] train={} test={} (seed {})",
            split.0.len(),
            split.1.len(),
            self.random_state
        );
        Ok(Box::new(std::iter::once(split)))
    }

    fn get_n_splits(&self, _inputs: &Frame, _targets: &[String], _groups: Option<&[String]>) -> usize {
        1
    }
}
