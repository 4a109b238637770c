use serde::{Deserialize, Serialize};

use crate::adapters::DataPoint;
use crate::errors::{OracleError, OracleResult};

/// Aggregation output for one task tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedValue {
    pub value: f64,
    /// Confidence in [0, 1], derived from variance, source weights and
    /// source count.
    pub confidence: f64,
    pub num_sources: usize,
}

/// Reputation-weighted aggregator with z-score outlier rejection.
pub struct Aggregator {
    outlier_threshold: f64,
}

impl Aggregator {
    pub fn new(outlier_threshold: f64) -> Self {
        Self { outlier_threshold }
    }

    /// Aggregate accepted data points using reputation-weighted averaging.
    ///
    /// Weights parallel the data points and come from source reputation.
    pub fn aggregate(
        &self,
        data_points: &[DataPoint],
        weights: &[f64],
    ) -> OracleResult<AggregatedValue> {
        if data_points.is_empty() || data_points.len() != weights.len() {
            return Err(OracleError::Validation(
                "Invalid data points or weights".to_string(),
            ));
        }

        let values: Vec<f64> = data_points
            .iter()
            .map(|p| p.value.as_f64().unwrap_or(0.0))
            .collect();

        let (clean_values, clean_weights) = self.remove_outliers(&values, weights);
        if clean_values.is_empty() {
            return Err(OracleError::Validation(
                "No valid data points after outlier removal".to_string(),
            ));
        }

        let weight_sum: f64 = clean_weights.iter().sum();
        if weight_sum <= 0.0 {
            return Err(OracleError::Validation(
                "Aggregation weights sum to zero".to_string(),
            ));
        }

        let weighted_sum: f64 = clean_values
            .iter()
            .zip(clean_weights.iter())
            .map(|(v, w)| v * w)
            .sum();

        Ok(AggregatedValue {
            value: weighted_sum / weight_sum,
            confidence: self.confidence(&clean_values, &clean_weights),
            num_sources: clean_values.len(),
        })
    }

    /// Remove statistical outliers using the modified z-score
    /// (median / MAD). Fewer than two points skip the filter entirely; a
    /// zero MAD keeps every point.
    fn remove_outliers(&self, values: &[f64], weights: &[f64]) -> (Vec<f64>, Vec<f64>) {
        if values.len() < 2 {
            return (values.to_vec(), weights.to_vec());
        }

        let med = median(values);
        let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
        let mad = median(&deviations);

        if mad == 0.0 {
            return (values.to_vec(), weights.to_vec());
        }

        values
            .iter()
            .zip(weights.iter())
            .filter(|(v, _)| 0.6745 * (**v - med).abs() / mad < self.outlier_threshold)
            .map(|(v, w)| (*v, *w))
            .unzip()
    }

    /// Confidence increases with more sources and higher weights, and
    /// decreases with variance across the surviving values.
    fn confidence(&self, values: &[f64], weights: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }

        let variance = if values.len() > 1 {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
        } else {
            0.0
        };

        let avg_weight = weights.iter().sum::<f64>() / weights.len() as f64;
        let confidence = (1.0 / (1.0 + variance)) * avg_weight * (values.len() as f64 / 5.0).min(1.0);
        confidence.min(1.0)
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
