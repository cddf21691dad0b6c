//! Feature encoders used by the pipeline model.
//!
//! Provides a per-column standard `Scaler`, a `LabelEncoder` for targets, a
//! `OneHotEncoder` that ignores unknown categories, plus thin wrappers over
//! linfa for TF-IDF (`TextVectorizer`) and a seeded `TruncatedSvd`. Rows are
//! samples; every fitted encoder serializes with serde so a fitted pipeline
//! can be persisted as JSON.

use std::collections::BTreeSet;

use linfa_linalg::lobpcg::TruncatedSvd as LobpcgSvd;
use linfa_linalg::Order;
use linfa_preprocessing::tf_idf_vectorization::{FittedTfIdfVectorizer, TfIdfVectorizer};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Simple standard scaler (per-column mean/std).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Scaler {
    /// Minimum stddev to avoid division by zero when transforming.
    const MIN_STD: f32 = 1e-6;
}

/// Fit a `Scaler` from an `Array2<f32>` where rows are samples and
/// columns are features.
pub fn fit_scaler(x: &Array2<f32>) -> Result<Scaler> {
    let (nrows, ncols) = x.dim();
    if nrows == 0 || ncols == 0 {
        return Err(Error::value("fit_scaler requires a non-empty matrix"));
    }

    let nrows_f = nrows as f32;
    let mean: Vec<f32> = x.sum_axis(Axis(0)).iter().map(|s| s / nrows_f).collect();

    let mut var = vec![0.0f32; ncols];
    for row in x.rows() {
        for (c, v) in row.iter().enumerate() {
            let d = v - mean[c];
            var[c] += d * d;
        }
    }
    let std = var
        .into_iter()
        .map(|v| (v / nrows_f).sqrt().max(Scaler::MIN_STD))
        .collect();

    Ok(Scaler { mean, std })
}

/// Transform all rows using the provided `Scaler` and return a new `Array2<f32>`.
pub fn transform_all(x: &Array2<f32>, sc: &Scaler) -> Result<Array2<f32>> {
    if x.ncols() != sc.mean.len() {
        return Err(Error::value(format!(
            "Scaler was fitted on {} columns, got {}",
            sc.mean.len(),
            x.ncols()
        )));
    }
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = (*v - sc.mean[c]) / sc.std[c];
        }
    }
    Ok(out)
}

/// Encode string labels as contiguous integers (sorted class order).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit(labels: &[String]) -> Self {
        let classes: BTreeSet<&String> = labels.iter().collect();
        Self {
            classes: classes.into_iter().cloned().collect(),
        }
    }

    pub fn transform(&self, labels: &[String]) -> Result<Vec<usize>> {
        labels
            .iter()
            .map(|l| {
                self.classes
                    .binary_search(l)
                    .map_err(|_| Error::value(format!("y contains previously unseen label: {}", l)))
            })
            .collect()
    }

    pub fn inverse_transform(&self, codes: &[usize]) -> Result<Vec<String>> {
        codes
            .iter()
            .map(|&c| {
                self.classes
                    .get(c)
                    .cloned()
                    .ok_or_else(|| Error::value(format!("Label code {} is out of range", c)))
            })
            .collect()
    }
}

/// One-hot encoder; unknown or missing categories encode as all zeros.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OneHotEncoder {
    pub categories: Vec<String>,
}

impl OneHotEncoder {
    pub fn fit(values: &[Option<String>]) -> Self {
        let categories: BTreeSet<&String> = values.iter().flatten().collect();
        Self {
            categories: categories.into_iter().cloned().collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.categories.len()
    }

    pub fn transform(&self, values: &[Option<String>]) -> Array2<f32> {
        let mut out = Array2::zeros((values.len(), self.width()));
        for (r, v) in values.iter().enumerate() {
            if let Some(Ok(c)) = v.as_ref().map(|s| self.categories.binary_search(s)) {
                out[[r, c]] = 1.0;
            }
        }
        out
    }
}

/// TF-IDF features of a text column over a capped vocabulary.
///
/// Fitting is delegated to `linfa-preprocessing`; the `max_features` terms
/// with the highest document frequency are kept (ties by term), and output
/// columns follow term order so the features do not depend on hash order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TextVectorizer {
    fitted: FittedTfIdfVectorizer,
    /// Columns of `fitted` kept, in term order.
    columns: Vec<usize>,
}

fn documents(docs: &[Option<String>]) -> Array1<String> {
    docs.iter().map(|d| d.clone().unwrap_or_default()).collect()
}

impl TextVectorizer {
    pub fn fit(docs: &[Option<String>], max_features: usize) -> Result<Self> {
        let texts = documents(docs);
        let fitted = TfIdfVectorizer::default()
            .fit(&texts)
            .map_err(|e| Error::value(format!("Could not fit the TF-IDF vectorizer: {}", e)))?;
        let vocabulary = fitted.vocabulary();
        let weights = fitted
            .transform(&texts)
            .to_dense();

        let mut ranked: Vec<(usize, usize)> = weights
            .columns()
            .into_iter()
            .enumerate()
            .map(|(c, col)| (c, col.iter().filter(|&&w| w > 0.0).count()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| vocabulary[a.0].cmp(&vocabulary[b.0])));
        ranked.truncate(max_features);
        let mut columns: Vec<usize> = ranked.into_iter().map(|(c, _)| c).collect();
        columns.sort_by(|&a, &b| vocabulary[a].cmp(&vocabulary[b]));
        Ok(Self { fitted, columns })
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Kept terms, in output column order.
    pub fn terms(&self) -> Vec<&str> {
        let vocabulary = self.fitted.vocabulary();
        self.columns.iter().map(|&c| vocabulary[c].as_str()).collect()
    }

    pub fn transform(&self, docs: &[Option<String>]) -> Result<Array2<f64>> {
        let weights = self
            .fitted
            .transform(&documents(docs))
            .to_dense();
        Ok(weights.select(Axis(1), &self.columns))
    }
}

/// Truncated SVD projection fitted with `linfa-linalg` (LOBPCG, seeded).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TruncatedSvd {
    /// Right singular vectors, `n_features x n_components`.
    pub components: Array2<f32>,
}

impl TruncatedSvd {
    /// Fit on `x`; `n_components` is clamped to the smaller side of `x`.
    pub fn fit(x: &Array2<f64>, n_components: usize, seed: u64) -> Result<Self> {
        let n_features = x.ncols();
        let k = n_components.min(n_features).min(x.nrows());
        if k == 0 {
            return Ok(Self {
                components: Array2::zeros((n_features, 0)),
            });
        }
        let rng = StdRng::seed_from_u64(seed);
        let decomposition = LobpcgSvd::new_with_rng(x.to_owned(), Order::Largest, rng)
            .decompose(k)
            .map_err(|e| Error::value(format!("Truncated SVD did not converge: {}", e)))?;
        let (_, _, vt) = decomposition.values_vectors();
        let components = vt.t().mapv(|v| v as f32);
        if components.nrows() != n_features {
            return Err(Error::value(format!(
                "Truncated SVD returned {} loadings for {} features",
                components.nrows(),
                n_features
            )));
        }
        Ok(Self { components })
    }

    pub fn width(&self) -> usize {
        self.components.ncols()
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f32> {
        x.mapv(|v| v as f32).dot(&self.components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn scaler_centers_columns() {
        let x = array![[1.0f32, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0]];
        let sc = fit_scaler(&x).unwrap();
        assert!((sc.mean[0] - 2.5).abs() < 1e-5);
        assert!((sc.mean[1] - 25.0).abs() < 1e-5);
        let t = transform_all(&x, &sc).unwrap();
        let col_mean = t.column(0).sum() / 4.0;
        assert!(col_mean.abs() < 1e-5, "column mean after transform should be ~0, got {}", col_mean);
    }

    #[test]
    fn scaler_rejects_empty_matrix() {
        let x = Array2::<f32>::zeros((0, 1));
        assert!(fit_scaler(&x).is_err());
    }

    #[test]
    fn label_encoder_sorts_classes() {
        let labels: Vec<String> = ["b", "a", "c", "a"].iter().map(|s| s.to_string()).collect();
        let le = LabelEncoder::fit(&labels);
        assert_eq!(le.classes, vec!["a", "b", "c"]);
        let codes = le.transform(&labels).unwrap();
        assert_eq!(codes, vec![1, 0, 2, 0]);
        assert_eq!(le.inverse_transform(&codes).unwrap(), labels);
        assert!(le.transform(&["z".to_string()]).is_err());
    }

    #[test]
    fn one_hot_ignores_unknown_categories() {
        let fit = vec![Some("CARD".to_string()), Some("TRANSFER".to_string())];
        let enc = OneHotEncoder::fit(&fit);
        let out = enc.transform(&[Some("CARD".to_string()), Some("CHEQUE".to_string()), None]);
        assert_eq!(out.row(0).to_vec(), vec![1.0, 0.0]);
        assert_eq!(out.row(1).to_vec(), vec![0.0, 0.0]);
        assert_eq!(out.row(2).to_vec(), vec![0.0, 0.0]);
    }

    fn docs(texts: &[&str]) -> Vec<Option<String>> {
        texts.iter().map(|t| Some(t.to_string())).collect()
    }

    #[test]
    fn tfidf_keeps_the_most_frequent_terms_in_term_order() {
        let docs = docs(&["coffee shop", "coffee beans", "train ticket", "train pass"]);
        let tfidf = TextVectorizer::fit(&docs, 2).unwrap();
        assert_eq!(tfidf.terms(), vec!["coffee", "train"]);
        let x = tfidf.transform(&docs).unwrap();
        assert_eq!(x.dim(), (4, 2));
        assert!(x[[0, 0]] > 0.0 && x[[0, 1]] == 0.0);
        assert!(x[[2, 0]] == 0.0 && x[[2, 1]] > 0.0);
    }

    #[test]
    fn tfidf_ignores_unknown_and_missing_text() {
        let tfidf = TextVectorizer::fit(&docs(&["coffee shop", "train ticket"]), 10).unwrap();
        let x = tfidf.transform(&[Some("bakery".to_string()), None]).unwrap();
        assert_eq!(x.dim(), (2, tfidf.width()));
        assert!(x.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn tfidf_columns_do_not_depend_on_fit_order() {
        let a = TextVectorizer::fit(&docs(&["rent flat", "gym club", "rent garage"]), 3).unwrap();
        let b = TextVectorizer::fit(&docs(&["rent garage", "gym club", "rent flat"]), 3).unwrap();
        assert_eq!(a.terms(), b.terms());
        assert_eq!(a.terms(), vec!["club", "flat", "rent"]);
    }

    #[test]
    fn svd_is_seeded_and_clamped() {
        let x = array![[1.0f64, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 3.0], [1.0, 1.0, 1.0]];
        let a = TruncatedSvd::fit(&x, 5, 42).unwrap();
        let b = TruncatedSvd::fit(&x, 5, 42).unwrap();
        assert_eq!(a.width(), 3);
        assert_eq!(a, b);
        assert_eq!(a.transform(&x).dim(), (4, 3));
    }

    #[test]
    fn svd_recovers_dominant_direction() {
        let x = array![[3.0f64, 0.0], [4.0, 0.1], [5.0, 0.0]];
        let svd = TruncatedSvd::fit(&x, 1, 0).unwrap();
        let first = svd.components.column(0);
        assert!(first[0].abs() > 0.99, "components: {:?}", svd.components);
    }

    #[test]
    fn svd_of_an_empty_vocabulary_has_no_components() {
        let x = Array2::<f64>::zeros((3, 0));
        let svd = TruncatedSvd::fit(&x, 4, 0).unwrap();
        assert_eq!(svd.width(), 0);
        assert_eq!(svd.transform(&x).dim(), (3, 0));
    }
}
