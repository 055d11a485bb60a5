//! Payload data sets derived from validation runs.
//!
//! This module contains the types to collect the data produced by a
//! validation run, complete snapshots of this data, diffs between
//! consecutive versions of such snapshots, and the shared history of
//! snapshots and diffs that RTR clients are served from.

use std::{cmp, fmt, ops};
use std::cmp::Ordering;
use std::collections::hash_map;
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::TryFrom;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_queue::SegQueue;
use log::warn;
use rpki::repository::cert::{Cert, ResourceCert};
use rpki::repository::crypto::keys::KeyIdentifier;
use rpki::repository::resources::AsId;
use rpki::repository::roa::{
    FriendlyRoaIpAddress, RouteOriginAttestation
};
use rpki::repository::tal::TalInfo;
use rpki::repository::x509::{Time, Validity};
use rpki::rtr::payload::{Action, Ipv4Prefix, Ipv6Prefix, Payload, Timing};
use rpki::rtr::server::VrpSource;
use rpki::rtr::state::{Serial, State};
use rpki::uri;
use crate::config::Config;
use crate::engine::{CaCert, ProcessPubPoint, ProcessRun};
use crate::error::Failed;
use crate::metrics::Metrics;
use crate::tal::{Tal, TalUri};


//------------ Configuration -------------------------------------------------

/// The length of the subject public key info of a router key.
///
/// RFC 8608 only allows ECDSA P-256 keys which have a fixed DER encoding
/// of exactly this many bytes.
pub const ROUTER_KEY_SPKI_LEN: usize = 91;


//============ Part One. During Validation ===================================
//
// The following types are used during a validation run to collect the
// valid published data.


//------------ ValidationReport ----------------------------------------------

/// The result of a validation run.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// The data from all the valid publication points.
    ///
    /// When a publication point has been successfully validated, it pushes
    /// its data to this queue. Pushing is commutative, so the undefined
    /// ordering between the TAL threads doesn’t matter.
    pub_points: SegQueue<PubPoint>,
}

impl ValidationReport {
    /// Creates a new, empty validation report.
    pub fn new() -> Self {
        Default::default()
    }
}

impl<'a> ProcessRun for &'a ValidationReport {
    type PubPoint = PubPointProcessor<'a>;

    fn process_ta(
        &self,
        tal: &Tal, _uri: &TalUri, cert: &CaCert,
        tal_index: usize,
    ) -> Result<Option<Self::PubPoint>, Failed> {
        Ok(Some(
            PubPointProcessor {
                report: self,
                pub_point: PubPoint::new_ta(cert, tal_index),
                validity: cert.combined_validity(),
                tal: tal.info().clone(),
            }
        ))
    }
}


//------------ PubPointProcessor ---------------------------------------------

/// Collects all the data for a single publication point.
///
/// This type is used during validation of a publication point. It collects
/// all the published data and eventually contributes it to the validation
/// report.
#[derive(Clone, Debug)]
pub struct PubPointProcessor<'a> {
    /// The validation report payload is contributed to.
    report: &'a ValidationReport,

    /// The data being collected.
    pub_point: PubPoint,

    /// The (combined) validity of the CA certificate.
    validity: Validity,

    /// The TAL the publication point is derived from.
    tal: Arc<TalInfo>,
}

impl<'a> ProcessPubPoint for PubPointProcessor<'a> {
    fn update_refresh(&mut self, not_after: Time) {
        self.pub_point.update_refresh(not_after);
    }

    fn process_ca(
        &mut self, _uri: &uri::Rsync, cert: &CaCert,
    ) -> Result<Option<Self>, Failed> {
        Ok(Some(
            PubPointProcessor {
                report: self.report,
                pub_point: PubPoint::new_ca(&self.pub_point, cert),
                validity: cert.combined_validity(),
                tal: self.tal.clone(),
            }
        ))
    }

    fn process_roa(
        &mut self,
        _uri: &uri::Rsync,
        cert: ResourceCert,
        route: RouteOriginAttestation
    ) -> Result<(), Failed> {
        self.pub_point.update_refresh(cert.validity().not_after());
        self.pub_point.add_roa(
            route, Arc::new(ObjectInfo::from_roa_cert(&cert, self.validity))
        );
        Ok(())
    }

    fn process_router_key(
        &mut self,
        uri: &uri::Rsync,
        cert: &Cert,
        ski: KeyIdentifier,
        as_id: AsId,
        key_info: Bytes,
    ) -> Result<(), Failed> {
        self.pub_point.update_refresh(cert.validity().not_after());
        let info = Arc::new(ObjectInfo {
            tal: self.tal.clone(),
            uri: Some(uri.clone()),
            validity: cert.validity().trim(self.validity),
        });
        self.pub_point.router_keys.push(
            (RouterKey::new(ski, as_id, key_info), info)
        );
        Ok(())
    }

    fn commit(self) {
        if !self.pub_point.is_empty() {
            self.report.pub_points.push(self.pub_point);
        }
    }

    fn cancel(self, cert: &CaCert) {
        warn!(
            "All data published by CA for {} disregarded.",
            cert.ca_repository()
        );
    }
}


//------------ PubPoint ------------------------------------------------------

/// The raw data published by a single publication point.
#[derive(Clone, Debug)]
struct PubPoint {
    /// The list of valid route origins and their source information.
    origins: Vec<(RouteOrigin, Arc<ObjectInfo>)>,

    /// The list of valid router keys and their source information.
    router_keys: Vec<(RouterKey, Arc<ObjectInfo>)>,

    /// The time when the publication point needs to be refreshed.
    refresh: Time,

    /// The index of the TAL for this data in the metrics.
    tal_index: usize,
}

impl PubPoint {
    /// Creates a new publication point for a trust anchor CA.
    fn new_ta(cert: &CaCert, tal_index: usize) -> Self {
        PubPoint {
            origins: Vec::new(),
            router_keys: Vec::new(),
            refresh: cert.cert().validity().not_after(),
            tal_index,
        }
    }

    /// Creates a new publication point for a regular CA.
    fn new_ca(parent: &PubPoint, cert: &CaCert) -> Self {
        PubPoint {
            origins: Vec::new(),
            router_keys: Vec::new(),
            refresh: cmp::min(
                parent.refresh, cert.cert().validity().not_after()
            ),
            tal_index: parent.tal_index,
        }
    }

    /// Returns whether nothing is published via this point.
    fn is_empty(&self) -> bool {
        self.origins.is_empty() && self.router_keys.is_empty()
    }

    /// Updates the refresh time to be no later than the given time.
    fn update_refresh(&mut self, refresh: Time) {
        self.refresh = cmp::min(self.refresh, refresh)
    }

    /// Adds the content of a ROA to the origins.
    fn add_roa(
        &mut self,
        roa: RouteOriginAttestation,
        info: Arc<ObjectInfo>,
    ) {
        self.origins.extend(roa.iter().map(|prefix| {
            (RouteOrigin::from_roa(roa.as_id(), prefix), info.clone())
        }));
    }
}


//============ Part Two. After Validation ====================================


//------------ SharedHistory -------------------------------------------------

/// A shareable history of the validated payload.
///
/// This is the type the update daemon publishes into and the RTR server
/// reads from. The daemon is the only writer.
#[derive(Clone, Debug)]
pub struct SharedHistory(Arc<RwLock<PayloadHistory>>);

impl SharedHistory {
    /// Creates a new shared history from the configuration.
    pub fn from_config(config: &Config) -> Self {
        SharedHistory(Arc::new(RwLock::new(
            PayloadHistory::from_config(config)
        )))
    }

    /// Provides read access to the underlying history.
    pub fn read(&self) -> impl ops::Deref<Target = PayloadHistory> + '_ {
        self.0.read().expect("Payload history lock poisoned")
    }

    /// Provides write access to the underlying history.
    ///
    /// This is private because all updating happens through dedicated
    /// methods.
    fn write(&self) -> impl ops::DerefMut<Target = PayloadHistory> + '_ {
        self.0.write().expect("Payload history lock poisoned")
    }

    /// Updates the history with the result of a validation run.
    ///
    /// Turns the report into a new snapshot. If there is no snapshot yet,
    /// installs the new one as the initial data set. Otherwise computes the
    /// delta to the current snapshot. An empty delta leaves the published
    /// data untouched and the new set is dropped. Anything else swaps in
    /// the new snapshot and appends the delta to the history, all under a
    /// single write lock so readers never see a partial update.
    pub fn update(
        &self,
        report: ValidationReport,
        metrics: &mut Metrics,
    ) -> UpdateOutcome {
        let snapshot = SnapshotBuilder::from_report(report, metrics);

        let mut history = self.write();
        let current = match history.current {
            Some(ref current) => current.clone(),
            None => {
                history.current = Some(snapshot.into_snapshot().into());
                return UpdateOutcome::Initial
            }
        };

        let delta = PayloadDelta::construct(
            &current.to_builder(), &snapshot, history.serial().add(1)
        );
        match delta {
            Some(delta) => {
                history.current = Some(snapshot.into_snapshot().into());
                history.push_delta(delta);
                UpdateOutcome::Changed
            }
            None => UpdateOutcome::Unchanged
        }
    }

    /// Marks the beginning of an update cycle.
    pub fn mark_update_start(&self) {
        self.write().last_update_start = Utc::now();
    }

    /// Marks the end of an update cycle.
    pub fn mark_update_done(&self) {
        let mut locked = self.write();
        let now = Utc::now();
        locked.last_update_done = Some(now);
        locked.last_update_duration = Some(
            now.signed_duration_since(locked.last_update_start)
                .to_std().unwrap_or_else(|_| Duration::from_secs(0))
        );
        locked.next_update_start = SystemTime::now() + locked.refresh;
    }
}


//--- VrpSource

impl VrpSource for SharedHistory {
    type FullIter = SnapshotVrpIter;
    type DiffIter = DeltaVrpIter;

    fn ready(&self) -> bool {
        self.read().is_active()
    }

    fn notify(&self) -> State {
        let read = self.read();
        State::from_parts(read.rtr_session(), read.serial())
    }

    fn full(&self) -> (State, Self::FullIter) {
        let read = self.read();
        (
            State::from_parts(read.rtr_session(), read.serial()),
            SnapshotVrpIter::new(read.current.clone().unwrap_or_default())
        )
    }

    fn diff(&self, state: State) -> Option<(State, Self::DiffIter)> {
        let read = self.read();
        if read.rtr_session() != state.session() {
            return None
        }
        read.delta_since(state.serial()).map(|delta| {
            (
                State::from_parts(read.rtr_session(), read.serial()),
                DeltaVrpIter::new(delta)
            )
        })
    }

    fn timing(&self) -> Timing {
        let read = self.read();
        let mut res = read.timing;
        res.refresh = u32::try_from(
            read.update_wait().as_secs()
        ).unwrap_or(u32::MAX);
        res
    }
}


//------------ UpdateOutcome -------------------------------------------------

/// What happened when the history was given a new data set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// There was no previous data set; this one became the initial one.
    Initial,

    /// The new data set differed and has been published with a delta.
    Changed,

    /// The new data set was identical and has been dropped.
    Unchanged,
}


//------------ PayloadHistory ------------------------------------------------

/// The history of the validated payload.
#[derive(Clone, Debug)]
pub struct PayloadHistory {
    /// The current full set of payload data.
    current: Option<Arc<PayloadSnapshot>>,

    /// A queue with a number of deltas.
    ///
    /// The newest delta is at the front of the queue. This delta also
    /// provides the current serial number.
    deltas: VecDeque<Arc<PayloadDelta>>,

    /// The session ID.
    session: u64,

    /// The number of deltas to keep.
    keep: usize,

    /// The time to wait between updates.
    refresh: Duration,

    /// The instant when we started an update the last time.
    last_update_start: DateTime<Utc>,

    /// The instant we successfully finished an update the last time.
    last_update_done: Option<DateTime<Utc>>,

    /// The duration of the last successful update run.
    last_update_duration: Option<Duration>,

    /// The instant when we are scheduled to start the next update.
    next_update_start: SystemTime,

    /// Default RTR timing.
    timing: Timing,
}

impl PayloadHistory {
    /// Creates a new history from the configuration.
    pub fn from_config(config: &Config) -> Self {
        PayloadHistory {
            current: None,
            deltas: VecDeque::with_capacity(config.history_size),
            session: {
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .expect("system time before Unix epoch")
                    .as_secs()
            },
            keep: config.history_size,
            refresh: config.validation_interval,
            last_update_start: Utc::now(),
            last_update_done: None,
            last_update_duration: None,
            next_update_start:
                SystemTime::now() + config.validation_interval,
            timing: Timing {
                refresh: config.validation_interval.as_secs() as u32,
                .. Timing::default()
            },
        }
    }

    /// Pushes a new delta to the history.
    fn push_delta(&mut self, delta: PayloadDelta) {
        if self.deltas.len() == self.keep {
            let _ = self.deltas.pop_back();
        }
        self.deltas.push_front(Arc::new(delta))
    }

    /// Returns whether the history is already active.
    ///
    /// The history becomes active once the first validation has finished.
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Returns a shareable reference to the current payload snapshot.
    ///
    /// If the history isn’t active yet, returns `None`.
    pub fn current(&self) -> Option<Arc<PayloadSnapshot>> {
        self.current.clone()
    }

    /// Returns the duration until the next refresh should start.
    pub fn refresh_wait(&self) -> Duration {
        self.next_update_start
        .duration_since(SystemTime::now())
        .unwrap_or_else(|_| Duration::from_secs(0))
    }

    /// Returns the duration until a new set of data will likely be
    /// available.
    ///
    /// Because the update duration can vary widely, this is a guess at
    /// best.
    pub fn update_wait(&self) -> Duration {
        let start = match self.last_update_duration {
            Some(duration) => self.next_update_start + duration + duration,
            None => self.next_update_start + self.refresh
        };
        start.duration_since(SystemTime::now()).unwrap_or(self.refresh)
    }

    /// Returns a delta from the given serial number to the current set.
    ///
    /// The serial is what the caller has last seen. The method produces a
    /// delta from that version to the current version if it can. If it
    /// can’t, this is either because it doesn’t have enough history data or
    /// because the serial is actually in the future.
    ///
    /// The method returns an arc’d delta so it can return the delta from
    /// the previous version which is the most likely scenario for RTR.
    pub fn delta_since(&self, serial: Serial) -> Option<Arc<PayloadDelta>> {
        // First, handle all special cases that won’t result in us iterating
        // over the list of deltas.
        if let Some(delta) = self.deltas.front() {
            if delta.serial() < serial {
                // If they give us a future serial, we refuse to play.
                return None
            }
            else if delta.serial() == serial {
                // They already have the current version: empty delta.
                return Some(Arc::new(PayloadDelta::empty(serial)))
            }
            else if delta.serial() == serial.add(1) {
                // They are just one behind. Give them a clone of the delta.
                return Some(delta.clone())
            }
        }
        else {
            // We don’t have deltas yet, so we are on serial 0, too.
            if serial == 0 {
                return Some(Arc::new(PayloadDelta::empty(serial)))
            }
            else {
                return None
            }
        };

        // The oldest delta we keep determines how far back we can serve.
        // Its target serial has to be at most one past the caller’s.
        let oldest = match self.deltas.back() {
            Some(delta) => delta.serial(),
            None => return None, // can’t happen, front() was Some above
        };
        if oldest.partial_cmp(&serial.add(1))
            == Some(cmp::Ordering::Greater)
        {
            return None
        }

        // Merge all deltas that are newer than what the caller has,
        // oldest first.
        Some(DeltaMerger::from_iter(
            self.deltas.iter().rev().filter(|delta| {
                delta.serial().partial_cmp(&serial)
                    == Some(cmp::Ordering::Greater)
            })
        ).into_delta())
    }

    /// Returns the serial number of the current data set.
    pub fn serial(&self) -> Serial {
        self.deltas.front().map(|delta| {
            delta.serial()
        }).unwrap_or_else(|| 0.into())
    }

    /// Returns the session ID.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Returns the RTR version of the session ID.
    ///
    /// This is the last 16 bits of the full session ID.
    pub fn rtr_session(&self) -> u16 {
        self.session as u16
    }

    /// Returns the time the last update was started.
    pub fn last_update_start(&self) -> DateTime<Utc> {
        self.last_update_start
    }

    /// Returns the time the last update has concluded.
    pub fn last_update_done(&self) -> Option<DateTime<Utc>> {
        self.last_update_done
    }
}


//------------ PayloadSnapshot -----------------------------------------------

/// The complete set of validated payload data.
#[derive(Clone, Debug, Default)]
pub struct PayloadSnapshot {
    /// A list of route origins.
    ///
    /// This list contains an ordered sequence of unique origins.
    origins: Vec<(RouteOrigin, PayloadInfo)>,

    /// A list of router keys.
    ///
    /// This list contains an ordered sequence of unique keys.
    router_keys: Vec<(RouterKey, PayloadInfo)>,

    /// The time when this snapshot needs to be refreshed at the latest.
    refresh: Option<Time>,
}

impl PayloadSnapshot {
    /// Creates a new, empty snapshot.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a new snapshot from a validation report.
    ///
    /// The function takes all the data from `report`, removes duplicates,
    /// and orders the result. It updates `metrics` along the way.
    pub fn from_report(
        report: ValidationReport,
        metrics: &mut Metrics,
    ) -> Self {
        SnapshotBuilder::from_report(report, metrics).into_snapshot()
    }

    /// Returns a slice of all the route origins.
    pub fn origins(&self) -> &[(RouteOrigin, PayloadInfo)] {
        &self.origins
    }

    /// Returns a slice of all the router keys.
    pub fn router_keys(&self) -> &[(RouterKey, PayloadInfo)] {
        &self.router_keys
    }

    /// Returns when this snapshot should be refreshed at the latest.
    pub fn refresh(&self) -> Option<Time> {
        self.refresh
    }

    /// Creates a snapshot from its parts for testing.
    #[cfg(test)]
    pub(crate) fn from_parts(
        origins: Vec<(RouteOrigin, PayloadInfo)>,
        router_keys: Vec<(RouterKey, PayloadInfo)>,
    ) -> Self {
        PayloadSnapshot { origins, router_keys, refresh: None }
    }

    /// Returns a snapshot builder based on this snapshot.
    fn to_builder(&self) -> SnapshotBuilder {
        SnapshotBuilder {
            origins: self.origins.iter().cloned().collect(),
            router_keys: self.router_keys.iter().cloned().collect(),
            refresh: self.refresh
        }
    }
}


//--- AsRef

impl AsRef<PayloadSnapshot> for PayloadSnapshot {
    fn as_ref(&self) -> &Self {
        self
    }
}


//----------- SnapshotVrpIter ------------------------------------------------

/// An iterator over the VRPs of a shared snapshot.
#[derive(Clone, Debug)]
pub struct SnapshotVrpIter {
    /// The shared snapshot.
    snapshot: Arc<PayloadSnapshot>,

    /// The position of the next item within the origins of the snapshot.
    pos: usize,
}

impl SnapshotVrpIter {
    /// Creates a new iterator from a shared snapshot.
    fn new(snapshot: Arc<PayloadSnapshot>) -> Self {
        SnapshotVrpIter {
            snapshot,
            pos: 0
        }
    }
}

impl Iterator for SnapshotVrpIter {
    type Item = Payload;

    fn next(&mut self) -> Option<Self::Item> {
        let res = self.snapshot.origins.get(self.pos)?;
        self.pos += 1;
        Some(res.0.to_payload())
    }
}


//------------ SnapshotBuilder -----------------------------------------------

/// The representation of a snapshot during history updates.
#[derive(Clone, Debug, Default)]
struct SnapshotBuilder {
    /// A set of route origins.
    origins: HashMap<RouteOrigin, PayloadInfo>,

    /// A set of router keys.
    router_keys: HashMap<RouterKey, PayloadInfo>,

    /// The time when this snapshot needs to be refreshed at the latest.
    refresh: Option<Time>,
}

impl SnapshotBuilder {
    /// Creates a new snapshot builder from a report.
    ///
    /// The function takes all the data from `report` and removes any
    /// duplicates. Inserting an origin or key that is already present
    /// merely adds its source information, so the result is independent of
    /// the order in which publication points arrive. The `metrics` are
    /// updated along the way.
    fn from_report(
        report: ValidationReport,
        metrics: &mut Metrics,
    ) -> Self {
        let mut res = Self::default();

        while let Some(pub_point) = report.pub_points.pop() {
            res.update_refresh(pub_point.refresh);
            let tal = &mut metrics.tals[pub_point.tal_index];

            for (origin, info) in pub_point.origins {
                match res.origins.entry(origin) {
                    hash_map::Entry::Vacant(entry) => {
                        entry.insert(info.into());
                        tal.vrps += 1;
                    }
                    hash_map::Entry::Occupied(mut entry) => {
                        entry.get_mut().add_published(info);
                        tal.duplicate_vrps += 1;
                    }
                }
            }

            for (key, info) in pub_point.router_keys {
                match res.router_keys.entry(key) {
                    hash_map::Entry::Vacant(entry) => {
                        entry.insert(info.into());
                        tal.router_keys += 1;
                    }
                    hash_map::Entry::Occupied(mut entry) => {
                        entry.get_mut().add_published(info);
                    }
                }
            }
        }

        res
    }

    /// Updates the refresh time.
    fn update_refresh(&mut self, refresh: Time) {
        self.refresh = match self.refresh {
            Some(old) => Some(cmp::min(old, refresh)),
            None => Some(refresh)
        }
    }

    /// Converts the builder into a snapshot.
    fn into_snapshot(self) -> PayloadSnapshot {
        let mut origins: Vec<_> = self.origins.into_iter().collect();
        origins.sort_by(|left, right| left.0.cmp(&right.0));
        let mut router_keys: Vec<_> = self.router_keys.into_iter().collect();
        router_keys.sort_by(|left, right| left.0.cmp(&right.0));
        PayloadSnapshot {
            origins,
            router_keys,
            refresh: self.refresh
        }
    }
}


//------------ PayloadDelta --------------------------------------------------

/// The changes between two payload snapshots.
#[derive(Clone, Debug)]
pub struct PayloadDelta {
    /// The target serial number of this delta.
    ///
    /// This is the serial number of the payload history that this delta
    /// will be resulting in when applied.
    serial: Serial,

    /// Route origins announced by this delta.
    ///
    /// The vec is ordered.
    announced_origins: Vec<RouteOrigin>,

    /// Route origins withdrawn by this delta.
    ///
    /// The vec is ordered.
    withdrawn_origins: Vec<RouteOrigin>,

    /// Router keys announced by this delta.
    announced_router_keys: Vec<RouterKey>,

    /// Router keys withdrawn by this delta.
    withdrawn_router_keys: Vec<RouterKey>,
}

impl PayloadDelta {
    /// Constructs a new delta between two snapshots.
    ///
    /// Returns `None` if the old and new snapshot are, in fact, identical.
    fn construct(
        current: &SnapshotBuilder, next: &SnapshotBuilder, serial: Serial
    ) -> Option<Self> {
        let mut res = PayloadDelta {
            serial,
            announced_origins: added_keys(&next.origins, &current.origins),
            withdrawn_origins: added_keys(&current.origins, &next.origins),
            announced_router_keys: added_keys(
                &next.router_keys, &current.router_keys
            ),
            withdrawn_router_keys: added_keys(
                &current.router_keys, &next.router_keys
            ),
        };
        if res.is_empty() {
            return None
        }
        res.announced_origins.sort();
        res.withdrawn_origins.sort();
        res.announced_router_keys.sort();
        res.withdrawn_router_keys.sort();
        Some(res)
    }

    /// Creates an empty delta with the given target serial number.
    pub fn empty(serial: Serial) -> Self {
        PayloadDelta {
            serial,
            announced_origins: Vec::new(),
            withdrawn_origins: Vec::new(),
            announced_router_keys: Vec::new(),
            withdrawn_router_keys: Vec::new(),
        }
    }

    /// Returns whether this is an empty delta.
    pub fn is_empty(&self) -> bool {
        self.announced_origins.is_empty()
        && self.withdrawn_origins.is_empty()
        && self.announced_router_keys.is_empty()
        && self.withdrawn_router_keys.is_empty()
    }

    /// Returns the target serial number of the delta.
    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Returns a slice of the announced route origins.
    pub fn announced_origins(&self) -> &[RouteOrigin] {
        &self.announced_origins
    }

    /// Returns a slice of the withdrawn route origins.
    pub fn withdrawn_origins(&self) -> &[RouteOrigin] {
        &self.withdrawn_origins
    }

    /// Returns a slice of the announced router keys.
    pub fn announced_router_keys(&self) -> &[RouterKey] {
        &self.announced_router_keys
    }

    /// Returns a slice of the withdrawn router keys.
    pub fn withdrawn_router_keys(&self) -> &[RouterKey] {
        &self.withdrawn_router_keys
    }
}


//------------ DeltaVrpIter --------------------------------------------------

/// An iterator over the changed VRPs of a shared delta.
#[derive(Clone, Debug)]
pub struct DeltaVrpIter {
    /// The shared delta we are iterating over.
    delta: Arc<PayloadDelta>,

    /// The index of the next item to be returned.
    ///
    /// If it is `Ok(some)` we are in announcements, if it is `Err(some)`
    /// we are in withdrawals.
    pos: Result<usize, usize>,
}

impl DeltaVrpIter {
    /// Creates a new iterator from a shared delta.
    fn new(delta: Arc<PayloadDelta>) -> Self {
        DeltaVrpIter {
            delta,
            pos: Ok(0)
        }
    }
}

impl Iterator for DeltaVrpIter {
    type Item = (Action, Payload);

    fn next(&mut self) -> Option<Self::Item> {
        match self.pos {
            Ok(pos) => {
                match self.delta.announced_origins.get(pos) {
                    Some(res) => {
                        self.pos = Ok(pos + 1);
                        Some((Action::Announce, res.to_payload()))
                    }
                    None => {
                        self.pos = Err(0);
                        self.next()
                    }
                }
            }
            Err(pos) => {
                match self.delta.withdrawn_origins.get(pos) {
                    Some(res) => {
                        self.pos = Err(pos + 1);
                        Some((Action::Withdraw, res.to_payload()))
                    }
                    None => None
                }
            }
        }
    }
}


//------------ DeltaMerger ---------------------------------------------------

/// Allows merging a sequence of deltas into a combined delta.
#[derive(Clone, Debug, Default)]
struct DeltaMerger {
    /// The target serial number of the combined delta.
    serial: Serial,

    /// The set of announced route origins.
    announced_origins: HashSet<RouteOrigin>,

    /// The set of withdrawn route origins.
    withdrawn_origins: HashSet<RouteOrigin>,

    /// The set of announced router keys.
    announced_router_keys: HashSet<RouterKey>,

    /// The set of withdrawn router keys.
    withdrawn_router_keys: HashSet<RouterKey>,
}

impl DeltaMerger {
    /// Creates a merger from an iterator of deltas.
    fn from_iter<'a>(
        mut iter: impl Iterator<Item = &'a Arc<PayloadDelta>>
    ) -> Self {
        let mut res = match iter.next() {
            Some(delta) => Self::new(delta),
            None => return Self::default()
        };

        for delta in iter {
            res.merge(delta)
        }

        res
    }

    /// Creates a new merger from an initial delta.
    fn new(delta: &PayloadDelta) -> Self {
        DeltaMerger {
            serial: delta.serial,
            announced_origins:
                delta.announced_origins.iter().cloned().collect(),
            withdrawn_origins:
                delta.withdrawn_origins.iter().cloned().collect(),
            announced_router_keys:
                delta.announced_router_keys.iter().cloned().collect(),
            withdrawn_router_keys:
                delta.withdrawn_router_keys.iter().cloned().collect(),
        }
    }

    /// Merges a subsequent delta.
    ///
    /// After, the serial number will be that of `delta`. Payload announced
    /// by `delta` is added to the merger’s announce set unless it is in
    /// the withdraw set, in which case it is removed from there. Withdrawn
    /// payload is removed from the announce set if present or added to the
    /// withdraw set otherwise.
    fn merge(&mut self, delta: &PayloadDelta) {
        self.serial = delta.serial;
        for origin in &delta.announced_origins {
            if !self.withdrawn_origins.remove(origin) {
                self.announced_origins.insert(*origin);
            }
        }
        for origin in &delta.withdrawn_origins {
            if !self.announced_origins.remove(origin) {
                self.withdrawn_origins.insert(*origin);
            }
        }
        for key in &delta.announced_router_keys {
            if !self.withdrawn_router_keys.remove(key) {
                self.announced_router_keys.insert(key.clone());
            }
        }
        for key in &delta.withdrawn_router_keys {
            if !self.announced_router_keys.remove(key) {
                self.withdrawn_router_keys.insert(key.clone());
            }
        }
    }

    /// Converts the merger into a delta.
    fn into_delta(self) -> Arc<PayloadDelta> {
        let mut res = PayloadDelta {
            serial: self.serial,
            announced_origins: self.announced_origins.into_iter().collect(),
            withdrawn_origins: self.withdrawn_origins.into_iter().collect(),
            announced_router_keys:
                self.announced_router_keys.into_iter().collect(),
            withdrawn_router_keys:
                self.withdrawn_router_keys.into_iter().collect(),
        };
        res.announced_origins.sort();
        res.withdrawn_origins.sort();
        res.announced_router_keys.sort();
        res.withdrawn_router_keys.sort();
        Arc::new(res)
    }
}


//------------ RouteOrigin ---------------------------------------------------

/// A validated route origin authorization.
///
/// This is what RFC 6811 calls a ‘Validated ROA Payload.’ It consists of
/// an IP address prefix, a maximum length, and the origin AS number.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RouteOrigin {
    /// The origin AS number.
    as_id: AsId,

    /// The IP address prefix.
    prefix: AddressPrefix,

    /// The maximum authorized prefix length of a route.
    max_length: u8,
}

impl RouteOrigin {
    /// Creates a new route origin from its components.
    pub fn new(
        as_id: AsId,
        prefix: AddressPrefix,
        max_length: u8,
    ) -> Self {
        RouteOrigin { as_id, prefix, max_length }
    }

    /// Creates a new route origin from information from a ROA.
    fn from_roa(as_id: AsId, prefix: FriendlyRoaIpAddress) -> Self {
        Self::new(as_id, prefix.into(), prefix.max_length())
    }

    /// Returns the AS number authorized to originate a route.
    pub fn as_id(self) -> AsId {
        self.as_id
    }

    /// Returns the prefix of this authorization.
    pub fn prefix(self) -> AddressPrefix {
        self.prefix
    }

    /// Returns the address part of the prefix of this authorization.
    pub fn address(self) -> IpAddr {
        self.prefix.address()
    }

    /// Returns the minimum prefix length of this authorization.
    pub fn address_length(self) -> u8 {
        self.prefix.address_length()
    }

    /// Returns the maximum prefix length of this authorization.
    pub fn max_length(self) -> u8 {
        self.max_length
    }

    /// Returns an RTR payload value for this route origin.
    pub fn to_payload(self) -> Payload {
        match self.address() {
            IpAddr::V4(addr) => {
                Payload::V4(Ipv4Prefix {
                    prefix: addr,
                    prefix_len: self.address_length(),
                    max_len: self.max_length(),
                    asn: self.as_id().into(),
                })
            }
            IpAddr::V6(addr) => {
                Payload::V6(Ipv6Prefix {
                    prefix: addr,
                    prefix_len: self.address_length(),
                    max_len: self.max_length(),
                    asn: self.as_id().into(),
                })
            }
        }
    }
}


//--- PartialOrd and Ord

impl PartialOrd for RouteOrigin {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RouteOrigin {
    fn cmp(&self, other: &Self) -> Ordering {
        // The sort order attempts to avoid races in consumers that don’t
        // apply changes atomically. It keeps more specifics first and the
        // same prefixes together.
        match self.max_length.cmp(&other.max_length) {
            Ordering::Less => return Ordering::Greater,
            Ordering::Greater => return Ordering::Less,
            Ordering::Equal => { }
        }
        match self.prefix.cmp(&other.prefix) {
            Ordering::Less => return Ordering::Less,
            Ordering::Greater => return Ordering::Greater,
            Ordering::Equal => { }
        }
        self.as_id.cmp(&other.as_id)
    }
}


//------------ RouterKey -----------------------------------------------------

/// A validated BGPsec router key.
///
/// This binds a router’s public key, identified by its subject key
/// identifier, to the AS it may sign BGPsec path segments for.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RouterKey {
    /// The subject key identifier of the key. Always 20 bytes.
    key_identifier: KeyIdentifier,

    /// The AS the key is bound to.
    as_id: AsId,

    /// The DER-encoded subject public key info of the key.
    ///
    /// The profile only allows ECDSA P-256 keys, so this is always
    /// [`ROUTER_KEY_SPKI_LEN`] bytes.
    key_info: Bytes,
}

impl RouterKey {
    /// Creates a new router key from its components.
    pub fn new(
        key_identifier: KeyIdentifier,
        as_id: AsId,
        key_info: Bytes,
    ) -> Self {
        RouterKey { key_identifier, as_id, key_info }
    }

    /// Returns the subject key identifier of the key.
    pub fn key_identifier(&self) -> KeyIdentifier {
        self.key_identifier
    }

    /// Returns the AS the key is bound to.
    pub fn as_id(&self) -> AsId {
        self.as_id
    }

    /// Returns the DER-encoded subject public key info.
    pub fn key_info(&self) -> &Bytes {
        &self.key_info
    }
}


//--- PartialOrd and Ord

impl PartialOrd for RouterKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RouterKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.as_id.cmp(&other.as_id) {
            Ordering::Equal => { }
            other => return other
        }
        match self.key_identifier.as_ref().cmp(
            other.key_identifier.as_ref()
        ) {
            Ordering::Equal => { }
            other => return other
        }
        self.key_info.cmp(&other.key_info)
    }
}


//------------ AddressPrefix -------------------------------------------------

/// An IP address prefix: an IP address and a prefix length.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AddressPrefix {
    addr: IpAddr,
    len: u8,
}

impl AddressPrefix {
    /// Creates a new prefix from an address and a length.
    pub fn new(addr: IpAddr, len: u8) -> Self {
        AddressPrefix{addr, len}
    }

    /// Returns whether the prefix is for an IPv4 address.
    pub fn is_v4(self) -> bool {
        self.addr.is_ipv4()
    }

    /// Returns the IP address part of a prefix.
    pub fn address(self) -> IpAddr {
        self.addr
    }

    /// Returns the length part of a prefix.
    pub fn address_length(self) -> u8 {
        self.len
    }

    /// Returns whether the prefix `self` covers the prefix `other`.
    pub fn covers(self, other: Self) -> bool {
        match (self.addr, other.addr) {
            (IpAddr::V4(left), IpAddr::V4(right)) => {
                if self.len > 31 && other.len > 31 {
                    left == right
                }
                else if self.len > other.len {
                    false
                }
                else {
                    let left = u32::from(left)
                             & !(u32::MAX >> self.len);
                    let right = u32::from(right)
                              & !(u32::MAX >> self.len);
                    left == right
                }
            }
            (IpAddr::V6(left), IpAddr::V6(right)) => {
                if self.len > 127 && other.len > 127 {
                    left == right
                }
                else if self.len > other.len {
                    false
                }
                else {
                    let left = u128::from(left)
                             & !(u128::MAX >> self.len);
                    let right = u128::from(right)
                              & !(u128::MAX >> self.len);
                    left == right
                }
            }
            _ => false
        }
    }
}


//--- From

impl From<FriendlyRoaIpAddress> for AddressPrefix {
    fn from(addr: FriendlyRoaIpAddress) -> Self {
        AddressPrefix {
            addr: addr.address(),
            len: addr.address_length(),
        }
    }
}

impl fmt::Display for AddressPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}


//============ Part Three. Payload Source Information ========================


//------------ PayloadInfo ---------------------------------------------------

/// Information about all the sources of a payload element.
///
/// A single VRP may be attested by multiple ROAs, so this is a list. The
/// first element is the one whose information we use when output formats
/// need a single source.
#[derive(Clone, Debug)]
pub struct PayloadInfo {
    /// The head of the list.
    head: Arc<ObjectInfo>,

    /// The tail of the list.
    tail: Option<Box<PayloadInfo>>,
}

impl PayloadInfo {
    /// Adds another source of the payload element.
    fn add_published(&mut self, info: Arc<ObjectInfo>) {
        self.tail = Some(Box::new(PayloadInfo {
            head: info,
            tail: self.tail.take()
        }));
    }

    /// Returns the name of the first TAL.
    pub fn tal_name(&self) -> &str {
        self.head.tal.name()
    }

    /// Returns the URI of the first object if available.
    pub fn uri(&self) -> Option<&uri::Rsync> {
        self.head.uri.as_ref()
    }

    /// Returns the validity of the first object.
    pub fn validity(&self) -> Validity {
        self.head.validity
    }
}

impl From<Arc<ObjectInfo>> for PayloadInfo {
    fn from(src: Arc<ObjectInfo>) -> Self {
        PayloadInfo { head: src, tail: None }
    }
}


//------------ ObjectInfo ----------------------------------------------------

/// Information about the signed object a payload element came from.
#[derive(Clone, Debug)]
pub struct ObjectInfo {
    /// The TAL the object is derived from.
    pub tal: Arc<TalInfo>,

    /// The rsync URI identifying the object.
    pub uri: Option<uri::Rsync>,

    /// The validity of the object.
    pub validity: Validity,
}

impl ObjectInfo {
    /// Creates a new object info from the EE certificate of a ROA.
    fn from_roa_cert(cert: &ResourceCert, ca_validity: Validity) -> Self {
        ObjectInfo {
            tal: cert.tal().clone(),
            uri: cert.signed_object().cloned().map(|mut uri| {
                uri.unshare(); uri
            }),
            validity: cert.validity().trim(ca_validity),
        }
    }
}


//============ Part Four. The Attic ==========================================

/// Returns the keys in `new` that are not in `old` as a vec.
fn added_keys<K: Clone + std::hash::Hash + Eq, V>(
    new: &HashMap<K, V>, old: &HashMap<K, V>
) -> Vec<K> {
    new.keys().filter(|key| !old.contains_key(key)).cloned().collect()
}


//============ Appendix One. The Tests =======================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::metrics::TalMetrics;

    fn make_pfx(s: &str, l: u8) -> AddressPrefix {
        AddressPrefix::new(s.parse().unwrap(), l)
    }

    fn origin(asn: u32, prefix: &str, len: u8, max_len: u8) -> RouteOrigin {
        RouteOrigin::new(asn.into(), make_pfx(prefix, len), max_len)
    }

    fn builder(origins: &[RouteOrigin]) -> SnapshotBuilder {
        let mut res = SnapshotBuilder::default();
        for item in origins {
            res.origins.insert(
                *item,
                PayloadInfo::from(Arc::new(ObjectInfo {
                    tal: TalInfo::from_name("test".into()).into_arc(),
                    uri: None,
                    validity: Validity::new(Time::now(), Time::now()),
                }))
            );
        }
        res
    }

    fn apply(
        delta: &PayloadDelta, origins: &[RouteOrigin]
    ) -> HashSet<RouteOrigin> {
        let mut res: HashSet<_> = origins.iter().cloned().collect();
        for item in delta.announced_origins() {
            assert!(res.insert(*item));
        }
        for item in delta.withdrawn_origins() {
            assert!(res.remove(item));
        }
        res
    }

    #[test]
    fn should_find_covered_prefixes_v4() {
        let outer = make_pfx("192.0.2.0", 24);
        let host_roa = make_pfx("192.0.2.0", 32);
        let sibling = make_pfx("192.0.3.0", 24);
        let inner_low = make_pfx("192.0.2.0", 26);
        let inner_hi = make_pfx("192.0.2.192", 26);
        let supernet = make_pfx("192.0.0.0", 16);

        assert!(!outer.covers(sibling));
        assert!(outer.covers(inner_low));
        assert!(outer.covers(inner_hi));
        assert!(!host_roa.covers(outer));
        assert!(!outer.covers(supernet));
    }

    #[test]
    fn should_find_covered_prefixes_v6() {
        let outer = make_pfx("2001:db8::", 32);
        let host_roa = make_pfx("2001:db8::", 128);
        let sibling = make_pfx("2001:db9::", 32);
        let inner_low = make_pfx("2001:db8::", 48);
        let inner_hi = make_pfx("2001:db8:ffff::", 48);
        let supernet = make_pfx("2001::", 16);

        assert!(!outer.covers(sibling));
        assert!(outer.covers(inner_low));
        assert!(outer.covers(inner_hi));
        assert!(!host_roa.covers(outer));
        assert!(!outer.covers(supernet));
    }

    #[test]
    fn equal_builders_produce_no_delta() {
        let origins = [
            origin(64500, "192.0.2.0", 24, 24),
            origin(64501, "2001:db8::", 32, 48),
        ];
        assert!(
            PayloadDelta::construct(
                &builder(&origins), &builder(&origins), 1.into()
            ).is_none()
        );
    }

    #[test]
    fn delta_announces_and_withdraws() {
        // Cycle one produces {v1, v2}, cycle two {v2, v3}. The delta has
        // to announce v3 and withdraw v1.
        let v1 = origin(64500, "192.0.2.0", 24, 24);
        let v2 = origin(64501, "198.51.100.0", 24, 28);
        let v3 = origin(64502, "203.0.113.0", 24, 24);
        let delta = PayloadDelta::construct(
            &builder(&[v1, v2]), &builder(&[v2, v3]), 5.into()
        ).unwrap();
        assert_eq!(delta.serial(), Serial::from(5));
        assert_eq!(delta.announced_origins(), &[v3]);
        assert_eq!(delta.withdrawn_origins(), &[v1]);
    }

    #[test]
    fn delta_applied_to_old_gives_new() {
        let old = [
            origin(64500, "192.0.2.0", 24, 24),
            origin(64501, "198.51.100.0", 24, 28),
            origin(64502, "2001:db8::", 32, 48),
        ];
        let new = [
            origin(64501, "198.51.100.0", 24, 28),
            origin(64502, "2001:db8::", 32, 64),
            origin(64503, "203.0.113.0", 24, 24),
        ];
        let delta = PayloadDelta::construct(
            &builder(&old), &builder(&new), 2.into()
        ).unwrap();
        let applied = apply(&delta, &old);
        let want: HashSet<_> = new.iter().cloned().collect();
        assert_eq!(applied, want);
    }

    #[test]
    fn merged_deltas_collapse_transients() {
        let v1 = origin(64500, "192.0.2.0", 24, 24);
        let v2 = origin(64501, "198.51.100.0", 24, 28);
        let mut merger = DeltaMerger::new(&PayloadDelta {
            serial: 2.into(),
            announced_origins: vec![v1],
            withdrawn_origins: vec![v2],
            announced_router_keys: Vec::new(),
            withdrawn_router_keys: Vec::new(),
        });
        // The next delta withdraws v1 again and re-announces v2: nothing
        // is left.
        merger.merge(&PayloadDelta {
            serial: 3.into(),
            announced_origins: vec![v2],
            withdrawn_origins: vec![v1],
            announced_router_keys: Vec::new(),
            withdrawn_router_keys: Vec::new(),
        });
        let delta = merger.into_delta();
        assert_eq!(delta.serial(), Serial::from(3));
        assert!(delta.is_empty());
    }

    #[test]
    fn history_serves_deltas_by_serial() {
        let mut history = PayloadHistory::from_config(
            &Config::test_config(std::path::Path::new("/tmp"))
        );
        let v1 = origin(64500, "192.0.2.0", 24, 24);
        let v2 = origin(64501, "198.51.100.0", 24, 28);
        history.push_delta(PayloadDelta {
            serial: 1.into(),
            announced_origins: vec![v1],
            withdrawn_origins: Vec::new(),
            announced_router_keys: Vec::new(),
            withdrawn_router_keys: Vec::new(),
        });
        history.push_delta(PayloadDelta {
            serial: 2.into(),
            announced_origins: vec![v2],
            withdrawn_origins: Vec::new(),
            announced_router_keys: Vec::new(),
            withdrawn_router_keys: Vec::new(),
        });
        assert_eq!(history.serial(), Serial::from(2));

        // Up to date: empty delta.
        let delta = history.delta_since(2.into()).unwrap();
        assert!(delta.is_empty());

        // One behind: the latest delta as is.
        let delta = history.delta_since(1.into()).unwrap();
        assert_eq!(delta.announced_origins(), &[v2]);

        // Two behind: both deltas merged.
        let delta = history.delta_since(0.into()).unwrap();
        assert_eq!(delta.announced_origins().len(), 2);

        // From the future: nothing.
        assert!(history.delta_since(3.into()).is_none());
    }

    fn point_with(
        origins: &[RouteOrigin], tal_index: usize
    ) -> PubPoint {
        let info = Arc::new(ObjectInfo {
            tal: TalInfo::from_name("test".into()).into_arc(),
            uri: None,
            validity: Validity::new(Time::now(), Time::now()),
        });
        PubPoint {
            origins: origins.iter().map(|item| {
                (*item, info.clone())
            }).collect(),
            router_keys: Vec::new(),
            refresh: Time::now(),
            tal_index,
        }
    }

    fn test_metrics() -> Metrics {
        let mut metrics = Metrics::new();
        metrics.tals.push(
            TalMetrics::new(TalInfo::from_name("test".into()).into_arc())
        );
        metrics
    }

    #[test]
    fn snapshot_deduplicates_origins() {
        let v1 = origin(64500, "192.0.2.0", 24, 24);
        let report = ValidationReport::new();
        report.pub_points.push(point_with(&[v1], 0));
        report.pub_points.push(point_with(&[v1], 0));
        let mut metrics = test_metrics();
        let snapshot = SnapshotBuilder::from_report(
            report, &mut metrics
        ).into_snapshot();
        assert_eq!(snapshot.origins().len(), 1);
        assert_eq!(metrics.tals[0].vrps, 1);
        assert_eq!(metrics.tals[0].duplicate_vrps, 1);
    }

    #[test]
    fn snapshot_origins_are_ordered() {
        let origins = [
            origin(64502, "203.0.113.0", 24, 24),
            origin(64500, "192.0.2.0", 24, 28),
            origin(64501, "198.51.100.0", 24, 24),
        ];
        let report = ValidationReport::new();
        report.pub_points.push(point_with(&origins, 0));
        let snapshot = SnapshotBuilder::from_report(
            report, &mut test_metrics()
        ).into_snapshot();
        let listed: Vec<_> = snapshot.origins().iter().map(|item| {
            item.0
        }).collect();
        let mut want = origins.to_vec();
        want.sort();
        assert_eq!(listed, want);
    }

    #[test]
    fn history_update_outcomes() {
        let config = Config::test_config(std::path::Path::new("/tmp"));
        let history = SharedHistory::from_config(&config);
        let v1 = origin(64500, "192.0.2.0", 24, 24);

        // First run installs the initial snapshot with a null delta.
        let report = ValidationReport::new();
        report.pub_points.push(point_with(&[v1], 0));
        let outcome = history.update(report, &mut test_metrics());
        assert_eq!(outcome, UpdateOutcome::Initial);
        assert_eq!(history.read().serial(), Serial::from(0));
        assert!(history.read().is_active());

        // A run with the same data changes nothing.
        let report = ValidationReport::new();
        report.pub_points.push(point_with(&[v1], 0));
        let outcome = history.update(report, &mut test_metrics());
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        assert_eq!(history.read().serial(), Serial::from(0));

        // A run with different data bumps the serial and keeps a delta.
        let v2 = origin(64501, "198.51.100.0", 24, 28);
        let report = ValidationReport::new();
        report.pub_points.push(point_with(&[v1, v2], 0));
        let outcome = history.update(report, &mut test_metrics());
        assert_eq!(outcome, UpdateOutcome::Changed);
        assert_eq!(history.read().serial(), Serial::from(1));
        let delta = history.read().delta_since(0.into()).unwrap();
        assert_eq!(delta.announced_origins(), &[v2]);
    }
}
