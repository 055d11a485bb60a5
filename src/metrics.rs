//! Monitoring metrics.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use log::info;
use rpki::repository::tal::TalInfo;


//------------ Metrics -------------------------------------------------------

/// The metrics collected during a validation run.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Time when these metrics have been collected.
    time: DateTime<Utc>,

    /// Per-TAL metrics.
    pub tals: Vec<TalMetrics>,
}

impl Metrics {
    /// Creates a new, empty metrics collection.
    pub fn new() -> Self {
        Metrics {
            time: Utc::now(),
            tals: Vec::new(),
        }
    }

    /// Returns the time the metrics were created.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Logs a summary of the run.
    ///
    /// This is logged after every run, whether the run succeeded or not,
    /// so operators always get the full picture.
    pub fn log(&self) {
        info!("Summary:");
        for tal in &self.tals {
            info!(
                "{}: {} valid ROAs, {} valid router certificates, \
                 {} invalid objects.",
                tal.tal.name(), tal.valid_roas, tal.valid_router_certs,
                tal.invalid_certs + tal.invalid_manifests
                    + tal.invalid_roas + tal.invalid_gbrs,
            )
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<Self> for Metrics {
    fn as_ref(&self) -> &Self {
        self
    }
}


//------------ TalMetrics ----------------------------------------------------

/// The metrics collected while processing data from one TAL.
#[derive(Clone, Debug)]
pub struct TalMetrics {
    /// The TAL.
    pub tal: Arc<TalInfo>,

    /// Number of valid manifests.
    pub valid_manifests: u32,

    /// Number of invalid manifests.
    pub invalid_manifests: u32,

    /// Number of publication points without a usable manifest.
    pub missing_manifests: u32,

    /// Number of valid CA certificates.
    pub valid_ca_certs: u32,

    /// Number of valid BGPsec router certificates.
    pub valid_router_certs: u32,

    /// Number of invalid certificates of any kind.
    pub invalid_certs: u32,

    /// Number of valid ROAs.
    pub valid_roas: u32,

    /// Number of invalid ROAs.
    pub invalid_roas: u32,

    /// Number of valid ghostbuster records.
    pub valid_gbrs: u32,

    /// Number of invalid ghostbuster records.
    pub invalid_gbrs: u32,

    /// Number of objects of unknown type.
    pub others: u32,

    /// Number of VRPs contributed to the data set.
    pub vrps: u32,

    /// Number of VRPs that were already contributed by someone else.
    pub duplicate_vrps: u32,

    /// Number of router keys contributed to the data set.
    pub router_keys: u32,
}

impl TalMetrics {
    /// Creates new metrics for the TAL with the given info.
    pub fn new(tal: Arc<TalInfo>) -> Self {
        TalMetrics {
            tal,
            valid_manifests: 0,
            invalid_manifests: 0,
            missing_manifests: 0,
            valid_ca_certs: 0,
            valid_router_certs: 0,
            invalid_certs: 0,
            valid_roas: 0,
            invalid_roas: 0,
            valid_gbrs: 0,
            invalid_gbrs: 0,
            others: 0,
            vrps: 0,
            duplicate_vrps: 0,
            router_keys: 0,
        }
    }
}
