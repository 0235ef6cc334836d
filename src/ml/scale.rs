//! Column standardization.

use crate::ml::MlError;

/// Per-column z-standardization (population deviation). Columns with zero
/// variance map to 0.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self, MlError> {
        let Some(first) = rows.first() else {
            return Err(MlError::InsufficientData { needed: 1, have: 0 });
        };
        let width = first.len();
        if rows.iter().any(|r| r.len() != width) {
            return Err(MlError::ModelFit("ragged feature matrix".into()));
        }
        if rows.iter().flatten().any(|v| !v.is_finite()) {
            return Err(MlError::ModelFit("feature matrix contains non-finite values".into()));
        }

        let n = rows.len() as f64;
        let mut means = vec![0.0; width];
        for row in rows {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut stds = vec![0.0; width];
        for row in rows {
            for ((s, v), m) in stds.iter_mut().zip(row).zip(&means) {
                *s += (v - m).powi(2) / n;
            }
        }
        for s in &mut stds {
            *s = s.sqrt();
        }
        Ok(Self { means, stds })
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter()
            .map(|row| {
                row.iter()
                    .zip(self.means.iter().zip(&self.stds))
                    .map(|(v, (m, s))| if *s > 1e-12 { (v - m) / s } else { 0.0 })
                    .collect()
            })
            .collect()
    }

    /// True when every column has zero variance.
    pub fn is_degenerate(&self) -> bool {
        self.stds.iter().all(|s| *s <= 1e-12)
    }
}

/// Fit and transform in one step.
pub fn standardize(rows: &[Vec<f64>]) -> Result<(StandardScaler, Vec<Vec<f64>>), MlError> {
    let scaler = StandardScaler::fit(rows)?;
    let scaled = scaler.transform(rows);
    Ok((scaler, scaled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_columns_map_to_zero() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let (scaler, scaled) = standardize(&rows).unwrap();
        assert_eq!(scaled, vec![vec![-1.0, 0.0], vec![1.0, 0.0]]);
        assert!(!scaler.is_degenerate());
    }

    #[test]
    fn rejects_nan() {
        let rows = vec![vec![1.0], vec![f64::NAN]];
        assert!(matches!(StandardScaler::fit(&rows), Err(MlError::ModelFit(_))));
    }

    #[test]
    fn all_constant_is_degenerate() {
        let rows = vec![vec![2.0, 2.0]; 4];
        assert!(StandardScaler::fit(&rows).unwrap().is_degenerate());
    }
}
