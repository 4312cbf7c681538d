// Matrix Expansion
// Expands matrix axes into concrete job instances with a mixed-radix counter

use crate::error::{ServiceError, ServiceResult};
use crate::spec::models::MatrixAxis;
use crate::utils::env_key;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use std::collections::HashSet;

/// One concrete point in the matrix cross-product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    /// Position in expansion order
    pub index: usize,
    /// Display name, e.g. `integration (3.10.x, macos-latest)`
    pub name: String,
    /// Axis name to chosen value, in axis declaration order
    pub values: IndexMap<String, String>,
}

impl JobInstance {
    pub fn value(&self, axis: &str) -> Option<&str> {
        self.values.get(axis).map(String::as_str)
    }

    /// `MATRIX_<AXIS>` variables exported to every step
    pub fn env_vars(&self) -> IndexMap<String, String> {
        self.values
            .iter()
            .map(|(axis, value)| (format!("MATRIX_{}", env_key(axis)), value.clone()))
            .collect()
    }
}

/// Matrix expander for run specs
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand axes into a lazy, ordered sequence of job instances.
    ///
    /// Order is lexicographic over axis declaration order, then value order:
    /// the last axis varies fastest. No axes yield a single instance.
    pub fn expand<'a>(run_name: &'a str, axes: &'a [MatrixAxis]) -> ServiceResult<MatrixIter<'a>> {
        validate_axes(axes)?;
        let total = Self::count(axes)?;
        Ok(MatrixIter {
            run_name,
            axes,
            digits: vec![0; axes.len()],
            next_index: 0,
            total,
        })
    }

    /// Expand and collect every instance
    pub fn expand_all(run_name: &str, axes: &[MatrixAxis]) -> ServiceResult<Vec<JobInstance>> {
        Ok(Self::expand(run_name, axes)?.collect())
    }

    /// Number of instances the axes produce
    pub fn count(axes: &[MatrixAxis]) -> ServiceResult<usize> {
        axes.iter().try_fold(1usize, |acc, axis| {
            acc.checked_mul(axis.values.len()).ok_or_else(|| {
                ServiceError::configuration("matrix has too many combinations")
            })
        })
    }
}

/// Reject axes that cannot form a well-defined cross-product
pub fn validate_axes(axes: &[MatrixAxis]) -> ServiceResult<()> {
    let mut names = HashSet::new();
    for axis in axes {
        if axis.name.trim().is_empty() {
            return Err(ServiceError::configuration("matrix axis has an empty name"));
        }
        if !names.insert(axis.name.as_str()) {
            return Err(ServiceError::configuration(format!(
                "matrix axis '{}' is declared more than once",
                axis.name
            )));
        }
        if axis.values.is_empty() {
            return Err(ServiceError::configuration(format!(
                "matrix axis '{}' has no values",
                axis.name
            )));
        }
        let mut seen = HashSet::new();
        for value in &axis.values {
            if !seen.insert(value.as_str()) {
                return Err(ServiceError::configuration(format!(
                    "matrix axis '{}' lists value '{}' more than once",
                    axis.name, value
                )));
            }
        }
    }
    Ok(())
}

/// Lazy iterator over the matrix cross-product.
///
/// Holds one index per axis and increments them like an odometer, so memory
/// stays proportional to the number of axes rather than the product size.
#[derive(Debug, Clone)]
pub struct MatrixIter<'a> {
    run_name: &'a str,
    axes: &'a [MatrixAxis],
    digits: Vec<usize>,
    next_index: usize,
    total: usize,
}

impl MatrixIter<'_> {
    fn current(&self) -> JobInstance {
        let values: IndexMap<String, String> = self
            .axes
            .iter()
            .zip(&self.digits)
            .map(|(axis, &digit)| (axis.name.clone(), axis.values[digit].clone()))
            .collect();

        let name = if values.is_empty() {
            self.run_name.to_string()
        } else {
            let joined: Vec<&str> = values.values().map(String::as_str).collect();
            format!("{} ({})", self.run_name, joined.join(", "))
        };

        JobInstance {
            index: self.next_index,
            name,
            values,
        }
    }

    fn advance(&mut self) {
        for position in (0..self.digits.len()).rev() {
            self.digits[position] += 1;
            if self.digits[position] < self.axes[position].values.len() {
                return;
            }
            self.digits[position] = 0;
        }
    }
}

impl Iterator for MatrixIter<'_> {
    type Item = JobInstance;

    fn next(&mut self) -> Option<JobInstance> {
        if self.next_index >= self.total {
            return None;
        }
        let instance = self.current();
        self.next_index += 1;
        self.advance();
        Some(instance)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next_index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for MatrixIter<'_> {}

/// Builder for creating matrix axes programmatically
#[derive(Debug, Default)]
pub struct MatrixBuilder {
    axes: Vec<MatrixAxis>,
}

impl MatrixBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an axis with the given values
    pub fn axis<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.axes.push(MatrixAxis::new(name, values));
        self
    }

    pub fn build(self) -> Vec<MatrixAxis> {
        self.axes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_matrix() -> Vec<MatrixAxis> {
        MatrixBuilder::new()
            .axis(
                "python-version",
                ["3.9.x", "3.10.x", "3.11.x", "3.12.x", "3.13.x"],
            )
            .axis("os", ["macos-latest"])
            .build()
    }

    #[test]
    fn test_observed_matrix_yields_five_instances() {
        let axes = python_matrix();
        let instances = MatrixExpander::expand_all("integration", &axes).unwrap();

        assert_eq!(instances.len(), 5);
        let versions: Vec<_> = instances
            .iter()
            .map(|i| i.value("python-version").unwrap())
            .collect();
        assert_eq!(versions, vec!["3.9.x", "3.10.x", "3.11.x", "3.12.x", "3.13.x"]);
        assert!(instances.iter().all(|i| i.value("os") == Some("macos-latest")));
        assert_eq!(instances[1].name, "integration (3.10.x, macos-latest)");
    }

    #[test]
    fn test_product_size_and_uniqueness() {
        let axes = MatrixBuilder::new()
            .axis("a", ["1", "2", "3"])
            .axis("b", ["x", "y"])
            .axis("c", ["p", "q", "r", "s"])
            .build();

        let instances = MatrixExpander::expand_all("run", &axes).unwrap();
        assert_eq!(instances.len(), 3 * 2 * 4);

        let unique: HashSet<Vec<String>> = instances
            .iter()
            .map(|i| i.values.values().cloned().collect())
            .collect();
        assert_eq!(unique.len(), instances.len());

        for (position, instance) in instances.iter().enumerate() {
            assert_eq!(instance.index, position);
        }
    }

    #[test]
    fn test_lexicographic_order() {
        let axes = MatrixBuilder::new()
            .axis("a", ["1", "2"])
            .axis("b", ["x", "y"])
            .build();
        let order: Vec<String> = MatrixExpander::expand("run", &axes)
            .unwrap()
            .map(|i| format!("{}{}", i.values["a"], i.values["b"]))
            .collect();
        assert_eq!(order, vec!["1x", "1y", "2x", "2y"]);
    }

    #[test]
    fn test_expansion_is_idempotent() {
        let axes = python_matrix();
        let first = MatrixExpander::expand_all("run", &axes).unwrap();
        let second = MatrixExpander::expand_all("run", &axes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_axes_yields_single_instance() {
        let instances = MatrixExpander::expand_all("solo", &[]).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "solo");
        assert!(instances[0].values.is_empty());
    }

    #[test]
    fn test_exact_size() {
        let axes = python_matrix();
        let mut iter = MatrixExpander::expand("run", &axes).unwrap();
        assert_eq!(iter.len(), 5);
        iter.next();
        assert_eq!(iter.len(), 4);
    }

    #[test]
    fn test_empty_axis_rejected() {
        let axes = vec![MatrixAxis::new("os", Vec::<String>::new())];
        let err = MatrixExpander::expand("run", &axes).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("'os' has no values"));
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let axes = MatrixBuilder::new()
            .axis("os", ["linux"])
            .axis("os", ["macos"])
            .build();
        let err = MatrixExpander::expand("run", &axes).unwrap_err();
        assert!(err.to_string().contains("declared more than once"));
    }

    #[test]
    fn test_duplicate_value_rejected() {
        let axes = MatrixBuilder::new().axis("os", ["linux", "linux"]).build();
        let err = MatrixExpander::expand("run", &axes).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_env_vars() {
        let axes = python_matrix();
        let first = MatrixExpander::expand("run", &axes).unwrap().next().unwrap();
        let env = first.env_vars();
        assert_eq!(env.get("MATRIX_PYTHON_VERSION"), Some(&"3.9.x".to_string()));
        assert_eq!(env.get("MATRIX_OS"), Some(&"macos-latest".to_string()));
    }
}
