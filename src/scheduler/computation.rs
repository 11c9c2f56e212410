use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::DiscoroError;
use crate::message::Location;

pub const MSG_TIMEOUT: Duration = Duration::from_secs(10);
pub const MIN_PULSE_INTERVAL: Duration = MSG_TIMEOUT;
pub const MAX_PULSE_INTERVAL: Duration = Duration::from_secs(10 * MSG_TIMEOUT.as_secs());

/// A computation waiting for, or holding, the scheduler's single active
/// slot. Built from a client's `schedule` request; promoted to active by
/// `await`.
#[derive(Debug, Clone)]
pub struct Computation {
    pub auth: String,
    pub name: String,
    pub xfer_files: Vec<String>,
    pub depends: Vec<String>,
    pub allowed_nodes: Option<HashSet<String>>,
    pub pulse_interval: Duration,
    pub zombie_period: Option<Duration>,
    pub client_secret: Option<String>,
    pub client_pulse_location: Option<Location>,
    pub dest_dir: PathBuf,
    pub created_at: Instant,
}

impl Computation {
    pub fn new(
        name: String,
        xfer_files: Vec<String>,
        depends: Vec<String>,
        allowed_nodes: Option<Vec<String>>,
        pulse_interval: Option<u64>,
        client_secret: Option<String>,
        staging_root: &std::path::Path,
    ) -> Result<Self, DiscoroError> {
        let auth = Uuid::new_v4().simple().to_string();
        let pulse_interval = match pulse_interval {
            Some(secs) => {
                let requested = Duration::from_secs(secs);
                if requested < MIN_PULSE_INTERVAL || requested > MAX_PULSE_INTERVAL {
                    MIN_PULSE_INTERVAL
                } else {
                    requested
                }
            }
            None => MIN_PULSE_INTERVAL,
        };

        let mut seen = HashSet::new();
        for file in &xfer_files {
            if !seen.insert(file.clone()) {
                return Err(DiscoroError::Validation(format!(
                    "duplicate xfer_file path: {file}"
                )));
            }
        }

        Ok(Self {
            auth: auth.clone(),
            name,
            xfer_files,
            depends,
            allowed_nodes: allowed_nodes.map(|v| v.into_iter().collect()),
            pulse_interval,
            zombie_period: None,
            client_secret,
            client_pulse_location: None,
            dest_dir: staging_root.join(&auth),
            created_at: Instant::now(),
        })
    }

    /// Applies the scheduler-wide `zombie_period` floor, enforcing
    /// `zombie_period >= MaxPulseInterval` when set.
    pub fn apply_zombie_period(&mut self, zombie_period: Option<Duration>) -> Result<(), DiscoroError> {
        if let Some(period) = zombie_period
            && period < MAX_PULSE_INTERVAL
        {
            return Err(DiscoroError::Validation(format!(
                "zombie_period must be >= {}s",
                MAX_PULSE_INTERVAL.as_secs()
            )));
        }
        self.zombie_period = zombie_period;
        Ok(())
    }

    pub fn node_allowed(&self, node_name: &str) -> bool {
        match &self.allowed_nodes {
            Some(set) => set.contains(node_name),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn staging() -> PathBuf {
        Path::new("/tmp/discoro-staging").to_path_buf()
    }

    #[test]
    fn out_of_range_pulse_interval_falls_back_to_minimum() {
        let comp = Computation::new(
            "job".to_string(),
            vec![],
            vec![],
            None,
            Some(1),
            None,
            &staging(),
        )
        .unwrap();
        assert_eq!(comp.pulse_interval, MIN_PULSE_INTERVAL);
    }

    #[test]
    fn duplicate_xfer_files_are_rejected() {
        let result = Computation::new(
            "job".to_string(),
            vec!["a.txt".to_string(), "a.txt".to_string()],
            vec![],
            None,
            None,
            None,
            &staging(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn zombie_period_below_max_pulse_interval_is_rejected() {
        let mut comp = Computation::new("job".to_string(), vec![], vec![], None, None, None, &staging()).unwrap();
        let err = comp.apply_zombie_period(Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, DiscoroError::Validation(_)));
    }

    #[test]
    fn node_allowed_defaults_to_true_when_unrestricted() {
        let comp = Computation::new("job".to_string(), vec![], vec![], None, None, None, &staging()).unwrap();
        assert!(comp.node_allowed("anything"));
    }

    #[test]
    fn node_allowed_respects_allowlist() {
        let comp = Computation::new(
            "job".to_string(),
            vec![],
            vec![],
            Some(vec!["10.0.0.1".to_string()]),
            None,
            None,
            &staging(),
        )
        .unwrap();
        assert!(comp.node_allowed("10.0.0.1"));
        assert!(!comp.node_allowed("10.0.0.2"));
    }
}
