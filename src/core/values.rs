//! Named variable container.
//!
//! [`Values`] is the estimate handed to and returned by every optimizer in the crate. It maps
//! a variable name to its current value, stored as a Euclidean vector. Iteration order is
//! the lexicographic order of the names, which also fixes the column order of the Jacobian.

use std::collections::BTreeMap;

use faer::MatRef;
use nalgebra::DVector;

use crate::core::{CoreError, CoreResult};

/// Ordered map from variable name to value.
///
/// # Example
///
/// ```
/// use gnc_solver::core::values::Values;
/// use nalgebra::dvector;
///
/// let mut values = Values::new();
/// values.insert("x1", dvector![3.0, 3.0]);
/// assert_eq!(values.len(), 1);
/// assert_eq!(values.dim("x1"), Some(2));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    entries: BTreeMap<String, DVector<f64>>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a variable, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: DVector<f64>) -> Option<DVector<f64>> {
        self.entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&DVector<f64>> {
        self.entries.get(key)
    }

    /// Value of `key`, or a [`CoreError::Variable`] naming the missing key.
    pub fn try_get(&self, key: &str) -> CoreResult<&DVector<f64>> {
        self.entries
            .get(key)
            .ok_or_else(|| CoreError::Variable(format!("Missing value for key '{key}'")).log())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn dim(&self, key: &str) -> Option<usize> {
        self.entries.get(key).map(|v| v.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DVector<f64>)> {
        self.entries.iter()
    }

    /// Squared L2 norm of all values stacked together.
    pub fn norm_squared(&self) -> f64 {
        self.entries.values().map(|v| v.norm_squared()).sum()
    }

    /// Add a stacked step to the variables listed in `order`.
    ///
    /// `step` holds one block per key, in the order given, each block as long as the
    /// variable. Keys absent from the container are skipped. Returns the step norm.
    pub fn retract(&mut self, step: MatRef<'_, f64>, order: &[String]) -> f64 {
        let mut offset = 0;
        for key in order {
            if let Some(value) = self.entries.get_mut(key) {
                for i in 0..value.len() {
                    value[i] += step[(offset + i, 0)];
                }
                offset += value.len();
            }
        }
        step.norm_l2()
    }

    /// Element-wise comparison with an absolute tolerance.
    pub fn equals(&self, other: &Values, tol: f64) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(key, value)| {
                other.entries.get(key).is_some_and(|o| {
                    o.len() == value.len()
                        && value.iter().zip(o.iter()).all(|(a, b)| (a - b).abs() <= tol)
                })
            })
    }
}

impl FromIterator<(String, DVector<f64>)> for Values {
    fn from_iter<T: IntoIterator<Item = (String, DVector<f64>)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
