//! Cluster composition constraints
//!
//! Constraints are set by an administrator next to the cluster definition
//! and checked on every tick before any operator runs.

use serde::{Deserialize, Serialize};

use crate::{Cluster, Error};

/// Allowed shape of a cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Constraints {
    /// Exact number of control plane nodes
    pub control_plane_count: usize,
    /// Minimum number of worker nodes
    #[serde(default)]
    pub minimum_workers: usize,
    /// Maximum number of worker nodes; 0 means unbounded
    #[serde(default)]
    pub maximum_workers: usize,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            control_plane_count: 1,
            minimum_workers: 0,
            maximum_workers: 0,
        }
    }
}

impl Constraints {
    /// Validate the constraints themselves
    pub fn validate(&self) -> Result<(), Error> {
        if self.control_plane_count == 0 {
            return Err(Error::validation(
                "control_plane_count must be greater than zero",
            ));
        }
        if self.maximum_workers != 0 && self.maximum_workers < self.minimum_workers {
            return Err(Error::validation(
                "maximum_workers must not be less than minimum_workers",
            ));
        }
        Ok(())
    }

    /// Check a cluster's composition against the constraints
    pub fn check(&self, cluster: &Cluster) -> Result<(), Error> {
        let control_planes = cluster.control_plane_nodes().count();
        let workers = cluster.worker_nodes().count();

        if control_planes != self.control_plane_count {
            return Err(Error::validation_for(
                &cluster.name,
                format!(
                    "number of control planes is not {} (got {})",
                    self.control_plane_count, control_planes
                ),
            ));
        }
        if workers < self.minimum_workers {
            return Err(Error::validation_for(
                &cluster.name,
                format!(
                    "not enough workers: need at least {} (got {})",
                    self.minimum_workers, workers
                ),
            ));
        }
        if self.maximum_workers != 0 && workers > self.maximum_workers {
            return Err(Error::validation_for(
                &cluster.name,
                format!(
                    "maximum workers exceeded: at most {} (got {})",
                    self.maximum_workers, workers
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::cluster;

    #[test]
    fn exact_control_plane_and_minimum_workers() {
        let c = Constraints {
            control_plane_count: 3,
            minimum_workers: 1,
            maximum_workers: 0,
        };
        c.check(&cluster(3, 2)).unwrap();
    }

    #[test]
    fn maximum_workers_exceeded() {
        let c = Constraints {
            control_plane_count: 3,
            minimum_workers: 0,
            maximum_workers: 1,
        };
        let err = c.check(&cluster(3, 2)).unwrap_err();
        assert!(err.to_string().contains("maximum workers exceeded"));
    }

    #[test]
    fn control_plane_count_must_match_exactly() {
        let c = Constraints {
            control_plane_count: 3,
            ..Default::default()
        };
        assert!(c.check(&cluster(1, 0)).is_err());
        assert!(c.check(&cluster(5, 0)).is_err());
        c.check(&cluster(3, 0)).unwrap();
    }

    #[test]
    fn zero_maximum_is_unbounded() {
        let c = Constraints {
            control_plane_count: 1,
            minimum_workers: 0,
            maximum_workers: 0,
        };
        c.check(&cluster(1, 40)).unwrap();
    }

    #[test]
    fn check_agrees_with_definition_over_a_grid() {
        for cp in 1..4 {
            for workers in 0..5 {
                let c = cluster(cp, workers);
                c.validate().unwrap();
                for min in 0..4 {
                    for max in 0..4 {
                        let constraints = Constraints {
                            control_plane_count: 2,
                            minimum_workers: min,
                            maximum_workers: max,
                        };
                        let expected =
                            cp == 2 && workers >= min && (max == 0 || workers <= max);
                        assert_eq!(
                            constraints.check(&c).is_ok(),
                            expected,
                            "cp={cp} workers={workers} min={min} max={max}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn inverted_bounds_are_invalid() {
        let c = Constraints {
            control_plane_count: 1,
            minimum_workers: 3,
            maximum_workers: 2,
        };
        assert!(c.validate().is_err());
        assert!(Constraints::default().validate().is_ok());
    }
}
