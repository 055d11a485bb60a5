//! Updating and processing of RPKI data.
//!
//! This module provides the types implementing validation of RPKI data
//! from a set of trust anchor locators into some output data.
//!
//! Validation is configured through [`Engine`] so that the configuration
//! can be used for multiple validation runs. Individual runs are managed
//! through [`Run`], which can be obtained via the engine’s
//! [`start`][Engine::start] method and drives the actual validation with
//! its [`process`][Run::process] method.
//!
//! For each trust anchor locator, a run spawns one worker thread. The
//! worker bootstraps the trust anchor certificate from the locator’s URIs
//! and then walks the tree of certificates depth first: subordinate CAs
//! discovered at a publication point are pushed onto a stack owned by the
//! worker and popped off again once the point has been dealt with.
//!
//! Runs are generic over what should be done with the validated data. The
//! trait [`ProcessRun`] represents a full validation run with the
//! accompanying trait [`ProcessPubPoint`] dealing with individual
//! publication points.

use std::{fs, io, str};
use std::path::PathBuf;
use std::sync::Arc;
use bytes::Bytes;
use crossbeam_utils::thread;
use log::{debug, error, warn};
use rpki::repository::cert::{Cert, KeyUsage, ResourceCert};
use rpki::repository::crl::Crl;
use rpki::repository::crypto::keys::KeyIdentifier;
use rpki::repository::manifest::{Manifest, ManifestContent, ManifestHash};
use rpki::repository::resources::AsId;
use rpki::repository::roa::{Roa, RouteOriginAttestation};
use rpki::repository::sigobj::SignedObject;
use rpki::repository::x509::{Time, Validity, ValidationError};
use rpki::uri;
use crate::config::Config;
use crate::error::Failed;
use crate::fetch;
use crate::fetch::Collector;
use crate::metrics::{Metrics, TalMetrics};
use crate::payload::{ValidationReport, ROUTER_KEY_SPKI_LEN};
use crate::tal::{Tal, TalUri};


//------------ Configuration -------------------------------------------------

/// The minimum number of manifest entries that triggers CRL serial caching.
///
/// The value has been determined experimentally with the RPKI repository at
/// a certain state so may or may not be a good one, really.
const CRL_CACHE_LIMIT: usize = 50;


//------------ Engine --------------------------------------------------------

/// The mechanism to update and process RPKI data.
///
/// When created, the set of TALs is loaded and kept around. It will only
/// be refreshed explicitly through the [`reload_tals`][Self::reload_tals]
/// method.
///
/// A run is started via the [`start`][Self::start] method, providing a
/// processor that handles valid data. For route origin and router key
/// validation, a shortcut is available through
/// [`process_payload`][Self::process_payload].
#[derive(Debug)]
pub struct Engine {
    /// The directory to load TALs from.
    tal_dir: PathBuf,

    /// The list of our TALs.
    tals: Vec<Tal>,

    /// The collector to load updated data with.
    collector: Collector,

    /// Should we be strict when decoding data?
    strict: bool,

    /// Should the TAL URIs be shuffled before each run?
    shuffle_uris: bool,
}

impl Engine {
    /// Initializes the engine without creating a value.
    ///
    /// This ensures that the working directories are present.
    pub fn init(config: &Config) -> Result<(), Failed> {
        Collector::init(config)
    }

    /// Creates a new engine.
    ///
    /// Takes all necessary information from `config`. Loads the initial
    /// set of TALs and errors out if that fails.
    pub fn new(config: &Config) -> Result<Self, Failed> {
        let mut res = Engine {
            tal_dir: config.tal_dir.clone(),
            tals: Vec::new(),
            collector: Collector::new(config)?,
            strict: config.strict,
            shuffle_uris: config.shuffle_tal_uris,
        };
        res.reload_tals()?;
        Ok(res)
    }

    /// Reloads the set of TALs.
    ///
    /// Assumes that all regular files with an extension of `tal` in the
    /// TAL directory are TAL files and tries to load and decode them.
    /// Fails if that fails for at least one of those files.
    ///
    /// It is not considered an error if there are no TAL files at all.
    /// However, a warning will be logged in this case.
    pub fn reload_tals(&mut self) -> Result<(), Failed> {
        let mut res = Vec::new();
        let dir = match fs::read_dir(&self.tal_dir) {
            Ok(dir) => dir,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    error!(
                        "Missing TAL directory {}.",
                        self.tal_dir.display()
                    );
                }
                else {
                    error!("Failed to open TAL directory: {}.", err);
                }
                return Err(Failed)
            }
        };
        for entry in dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    error!(
                        "Failed to iterate over TAL directory: {}", err
                    );
                    return Err(Failed)
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue
            }

            let path = entry.path();
            if path.extension().map(|ext| ext != "tal").unwrap_or(true) {
                continue
            }

            match Tal::load(&path) {
                Ok(tal) => res.push(tal),
                Err(err) => {
                    error!(
                        "Failed to load TAL {}: {}", path.display(), err
                    );
                    return Err(Failed)
                }
            }
        }
        if res.is_empty() {
            warn!("No TALs found in TAL directory. Starting anyway.");
        }
        self.tals = res;
        Ok(())
    }

    /// Starts a validation run.
    ///
    /// During the run, `processor` will be responsible for dealing with
    /// valid data. It must implement the [`ProcessRun`] trait.
    pub fn start<P: ProcessRun>(
        &self, processor: P
    ) -> Run<P> {
        Run::new(self, self.collector.start(), processor)
    }

    /// Performs a validation run collecting the published payload.
    ///
    /// Returns the validation report and the run’s metrics. If the run
    /// fails, the report is discarded and an error is returned instead.
    pub fn process_payload(
        &self
    ) -> Result<(ValidationReport, Metrics), Failed> {
        let report = ValidationReport::new();
        let mut run = self.start(&report);
        run.process()?;
        let metrics = run.done();
        Ok((report, metrics))
    }
}


//------------ Run -----------------------------------------------------------

/// A single validation run.
///
/// The runner is generic over the processor of valid data which must
/// implement the [`ProcessRun`] trait. The actual run is triggered by the
/// [`process`][Self::process] method. Upon completion, metrics of the run
/// can be extracted through [`done`][Self::done].
pub struct Run<'a, P> {
    /// A reference to the engine.
    engine: &'a Engine,

    /// The runner for the collector.
    collector: fetch::Run<'a>,

    /// The processor for valid data.
    processor: P,

    /// The metrics collected during the run.
    metrics: Metrics,
}

impl<'a, P> Run<'a, P> {
    /// Creates a new runner from all the parts.
    fn new(
        engine: &'a Engine,
        collector: fetch::Run<'a>,
        processor: P,
    ) -> Self {
        Run {
            engine, collector, processor,
            metrics: Metrics::new(),
        }
    }

    /// Finishes the validation run and returns the metrics.
    pub fn done(self) -> Metrics {
        self.metrics
    }
}

impl<'a, P: ProcessRun> Run<'a, P> {
    /// Performs the validation run.
    ///
    /// One worker thread is spawned per TAL. All threads are joined even
    /// if some of them fail. If any of them does fail, the entire run
    /// counts as failed and the caller must discard all data it may have
    /// received through its processor: a partial data set would cause
    /// spurious withdrawals at downstream routers, which is worse than a
    /// stale one.
    pub fn process(&mut self) -> Result<(), Failed> {
        // If we don’t have any TALs, we ain’t got nothing to do.
        if self.engine.tals.is_empty() {
            return Ok(())
        }

        let collected = thread::scope(|scope| {
            let handles: Vec<_> = self.engine.tals.iter().enumerate().map(
                |(index, tal)| {
                    let run = &*self;
                    scope.spawn(move |_| {
                        let mut metrics = TalMetrics::new(tal.info().clone());
                        let res = run.process_tal_task(
                            tal, index, &mut metrics
                        );
                        (res, metrics)
                    })
                }
            ).collect();

            let mut first_err = None;
            let mut panicked = false;
            let mut tal_metrics = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok((res, metrics)) => {
                        tal_metrics.push(metrics);
                        if res.is_err() && first_err.is_none() {
                            first_err = Some(Failed);
                        }
                    }
                    Err(_) => panicked = true,
                }
            }
            (first_err, panicked, tal_metrics)
        });

        let (first_err, panicked, tal_metrics) = match collected {
            Ok(some) => some,
            Err(_) => {
                error!(
                    "Validation failed after a worker thread has panicked. \
                     This is most assuredly a bug."
                );
                return Err(Failed)
            }
        };

        self.metrics.tals = tal_metrics;

        // The summary is logged on the error path, too.
        self.metrics.log();

        if panicked {
            error!(
                "Validation failed after a worker thread has panicked. \
                 This is most assuredly a bug."
            );
            return Err(Failed)
        }
        if let Some(err) = first_err {
            warn!(
                "Validation of at least one TAL failed. \
                 Discarding the results of this run."
            );
            return Err(err)
        }

        self.collector.prune_unvisited();
        Ok(())
    }

    /// Processes a single TAL.
    ///
    /// Tries the TAL’s URIs in order until one of them yields a completed
    /// walk of the trust anchor’s tree.
    fn process_tal_task(
        &self, tal: &Tal, tal_index: usize, metrics: &mut TalMetrics,
    ) -> Result<(), Failed> {
        let mut shuffled;
        let tal = if self.engine.shuffle_uris {
            shuffled = tal.clone();
            shuffled.shuffle_uris(&mut rand::thread_rng());
            &shuffled
        }
        else {
            tal
        };
        for uri in tal.uris() {
            match self.process_tal_uri(tal, tal_index, uri, metrics)? {
                UriOutcome::Handled => return Ok(()),
                UriOutcome::TryNext => continue,
            }
        }
        error!(
            "None of the URIs of TAL {} yielded a successful walk.",
            tal.name()
        );
        Err(Failed)
    }

    /// Tries to perform the whole walk from a single TAL URI.
    ///
    /// Returns `Ok(UriOutcome::TryNext)` on a soft error: the connection
    /// to the URI failed, or the retrieved certificate’s public key did
    /// not match the TAL’s. Everything else is a hard error that rejects
    /// the whole TAL. (This is the classification demanded by RFC 8630:
    /// the URIs are ordered alternatives for the same trust anchor, so a
    /// key mismatch just means we are talking to the wrong copy.)
    fn process_tal_uri(
        &self,
        tal: &Tal,
        tal_index: usize,
        uri: &TalUri,
        metrics: &mut TalMetrics,
    ) -> Result<UriOutcome, Failed> {
        let bytes = match self.collector.load_ta(uri) {
            Some(bytes) => bytes,
            None => {
                warn!("Trust anchor {} could not be fetched.", uri);
                return Ok(UriOutcome::TryNext)
            }
        };
        if !uri.is_cer_file() {
            error!(
                "TAL {} does not point to a certificate: {}",
                tal.name(), uri
            );
            return Err(Failed)
        }

        let mut walk = TalWalk::new(tal, tal_index, metrics);
        debug!("Processing TAL URI {}.", uri);
        if self.process_ta_cert(&mut walk, uri, bytes).is_err() {
            return walk.outcome()
        }

        // The root validated successfully. From here on the tree counts
        // as handled even if subordinate certificates fail: each deferred
        // CA is an isolated subtree.
        while let Some(deferred) = walk.stack.pop() {
            let _ = self.process_deferred(&mut walk, deferred);
        }
        Ok(UriOutcome::Handled)
    }

    /// Processes the trust anchor certificate itself.
    fn process_ta_cert(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        uri: &TalUri,
        bytes: Bytes,
    ) -> Result<(), Failed> {
        let cert = match Cert::decode(bytes) {
            Ok(cert) => cert,
            Err(_) => {
                warn!("Trust anchor {}: failed to decode.", uri);
                return Err(Failed)
            }
        };
        if cert.subject_public_key_info() != walk.tal.key_info() {
            walk.key_state = KeyState::Invalid;
            warn!("Trust anchor {}: key doesn’t match TAL.", uri);
            return Err(Failed)
        }
        walk.key_state = KeyState::Valid;
        let cert = match cert.validate_ta(
            walk.tal.info().clone(), self.engine.strict
        ) {
            Ok(cert) => cert,
            Err(_) => {
                walk.metrics.invalid_certs += 1;
                warn!("Trust anchor {}: doesn’t validate.", uri);
                return Err(Failed)
            }
        };
        let cert = CaCert::root(cert, uri.clone(), walk.tal_index)?;
        debug!("Found valid trust anchor {}. Processing.", uri);

        match self.processor.process_ta(
            walk.tal, uri, &cert, walk.tal_index
        )? {
            Some(processor) => {
                self.process_pub_point(walk, &cert, processor)
            }
            None => {
                debug!("Skipping trust anchor {}.", uri);
                Ok(())
            }
        }
    }

    /// Processes a subordinate CA popped off the traversal stack.
    fn process_deferred(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        deferred: DeferredCa<P::PubPoint>,
    ) -> Result<(), Failed> {
        // The parent publication point travels with the deferred entry so
        // it stays alive until all its subordinate CAs have been visited.
        let DeferredCa { rpp: _rpp, cert, processor } = deferred;
        self.process_pub_point(walk, &cert, processor)
    }

    /// Processes the publication point of a validated CA certificate.
    ///
    /// Fetches the point’s repository directory and validates the
    /// manifest. If the manifest checks out, every object listed on it is
    /// processed; failing objects only lose themselves. A manifest that
    /// doesn’t check out loses the whole point: none of the objects can
    /// be trusted. The certificate itself remains valid either way, so
    /// this only returns an error if the repository cannot be fetched at
    /// all or the processor asks to abort.
    fn process_pub_point(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        cert: &Arc<CaCert>,
        processor: P::PubPoint,
    ) -> Result<(), Failed> {
        let rpp = match self.collector.fetch_repository(cert.ca_repository())
        {
            Some(path) => {
                Arc::new(Rpp::new(cert.ca_repository().clone(), path))
            }
            None => {
                warn!(
                    "Publication point {} could not be fetched.",
                    cert.ca_repository()
                );
                processor.cancel(cert);
                return Err(Failed)
            }
        };

        let manifest = match self.validate_manifest(walk, cert, &rpp) {
            Some(manifest) => manifest,
            None => {
                // Diagnostics have been logged. No object of this point
                // can be used but the certificate itself stays valid.
                processor.cancel(cert);
                return Ok(())
            }
        };

        let mut processor = processor;
        for item in manifest.content.iter() {
            let (file, hash) = item.into_pair();
            let hash = ManifestHash::new(
                hash, manifest.content.file_hash_alg()
            );
            self.process_object(
                walk, cert, &rpp, &manifest, &mut processor, &file, hash
            )?;
        }

        processor.commit();
        Ok(())
    }

    /// Validates the manifest and CRL of a publication point.
    ///
    /// Returns `None` with all diagnostics logged if the point has no
    /// usable manifest.
    fn validate_manifest(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        cert: &CaCert,
        rpp: &Rpp,
    ) -> Option<ValidPointManifest> {
        let bytes = match rpp.load(cert.rpki_manifest()) {
            Some(bytes) => bytes,
            None => {
                warn!("{}: failed to load.", cert.rpki_manifest());
                walk.metrics.missing_manifests += 1;
                return None
            }
        };
        let manifest = match Manifest::decode(bytes, self.engine.strict) {
            Ok(manifest) => manifest,
            Err(_) => {
                warn!("{}: failed to decode.", cert.rpki_manifest());
                walk.metrics.invalid_manifests += 1;
                return None
            }
        };
        let (ee_cert, content) = match manifest.validate(
            cert.cert(), self.engine.strict
        ) {
            Ok(some) => some,
            Err(_) => {
                warn!("{}: failed to validate.", cert.rpki_manifest());
                walk.metrics.invalid_manifests += 1;
                return None
            }
        };
        if content.is_stale() {
            warn!("{}: stale manifest.", cert.rpki_manifest());
        }

        let (crl_uri, crl) = match self.validate_crl(
            &ee_cert, &content, cert, rpp
        ) {
            Some(some) => some,
            None => {
                walk.metrics.invalid_manifests += 1;
                return None
            }
        };

        walk.metrics.valid_manifests += 1;
        Some(ValidPointManifest { content, crl_uri, crl })
    }

    /// Checks the CRL of a publication point.
    ///
    /// Checks that there is exactly one CRL on the manifest, that it
    /// matches the CRL mentioned in the manifest’s EE certificate, that it
    /// matches its manifest hash, that it is a valid CRL for the CA, and
    /// that it does not revoke the manifest’s EE certificate.
    ///
    /// If all that is true, returns the CRL URI and the decoded CRL.
    fn validate_crl(
        &self,
        ee_cert: &ResourceCert,
        manifest: &ManifestContent,
        cert: &CaCert,
        rpp: &Rpp,
    ) -> Option<(uri::Rsync, Crl)> {
        let crl_uri = match ee_cert.crl_uri() {
            // RFC 6481: MUST end in .crl.
            Some(some) if some.ends_with(".crl") => some.clone(),
            _ => {
                warn!("{}: invalid CRL URI.", cert.rpki_manifest());
                return None
            }
        };
        let crl_name = match crl_uri.relative_to(cert.ca_repository()) {
            Some(name) => name,
            None => {
                warn!(
                    "{}: CRL URI outside repository directory.",
                    cert.rpki_manifest()
                );
                return None
            }
        };

        // Go over the manifest and try to find an entry matching crl_name.
        let mut crl_bytes = None;
        for item in manifest.iter() {
            let (file, hash) = item.into_pair();
            if file == crl_name {
                let bytes = match rpp.load(&crl_uri) {
                    Some(bytes) => bytes,
                    None => {
                        warn!("{}: failed to load.", crl_uri);
                        return None
                    }
                };
                let hash = ManifestHash::new(
                    hash, manifest.file_hash_alg()
                );
                if hash.verify(&bytes).is_err() {
                    warn!("{}: file has wrong manifest hash.", crl_uri);
                    return None
                }
                crl_bytes = Some(bytes);
            }
            else if file.ends_with(b".crl") {
                warn!(
                    "{}: manifest contains unexpected CRLs.",
                    cert.rpki_manifest()
                );
                return None
            }
        }
        let crl_bytes = match crl_bytes {
            Some(some) => some,
            None => {
                warn!(
                    "{}: CRL not listed on manifest.", cert.rpki_manifest()
                );
                return None
            }
        };

        // Decode and validate the CRL.
        let mut crl = match Crl::decode(crl_bytes) {
            Ok(crl) => crl,
            Err(_) => {
                warn!("{}: failed to decode.", crl_uri);
                return None
            }
        };
        if crl.validate(cert.cert().subject_public_key_info()).is_err() {
            warn!("{}: failed to validate.", crl_uri);
            return None
        }
        if crl.is_stale() {
            warn!("{}: stale CRL.", crl_uri);
        }

        // Turn on serial caching before looking for the first serial.
        if manifest.len() > CRL_CACHE_LIMIT {
            crl.cache_serials()
        }

        // Finally: has the manifest’s own certificate been revoked?
        if crl.contains(ee_cert.serial_number()) {
            warn!(
                "{}: certificate has been revoked.", cert.rpki_manifest()
            );
            return None
        }

        Some((crl_uri, crl))
    }

    /// Processes a single object listed on a manifest.
    ///
    /// Objects have isolated fates: whatever is wrong with one of them is
    /// logged and the point continues with the next entry. Only an error
    /// from the processor aborts the whole point.
    #[allow(clippy::too_many_arguments)]
    fn process_object(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        cert: &Arc<CaCert>,
        rpp: &Arc<Rpp>,
        manifest: &ValidPointManifest,
        processor: &mut P::PubPoint,
        file: &[u8],
        hash: ManifestHash,
    ) -> Result<(), Failed> {
        let file = match str_from_ascii(file) {
            Some(file) => file,
            None => {
                warn!(
                    "{}: illegal file name '{}' in manifest.",
                    cert.rpki_manifest(),
                    String::from_utf8_lossy(file)
                );
                return Ok(())
            }
        };
        let uri = match cert.ca_repository().join(file.as_ref()) {
            Ok(uri) => uri,
            Err(_) => {
                warn!(
                    "{}: illegal file name '{}' in manifest.",
                    cert.rpki_manifest(), file
                );
                return Ok(())
            }
        };
        let bytes = match rpp.load(&uri) {
            Some(bytes) => bytes,
            None => {
                warn!("{}: failed to load.", uri);
                return Ok(())
            }
        };
        if hash.verify(&bytes).is_err() {
            warn!("{}: file has wrong manifest hash.", uri);
            return Ok(())
        }

        if uri.ends_with(".cer") {
            self.process_cer(walk, cert, rpp, manifest, processor, uri, bytes)
        }
        else if uri.ends_with(".roa") {
            self.process_roa(walk, cert, manifest, processor, uri, bytes)
        }
        else if uri.ends_with(".crl") {
            if uri != manifest.crl_uri {
                warn!("{}: stray CRL.", uri);
            }
            Ok(())
        }
        else if uri.ends_with(".gbr") {
            self.process_gbr(walk, cert, manifest, processor, uri, bytes)
        }
        else {
            walk.metrics.others += 1;
            warn!("{}: unknown object type.", uri);
            Ok(())
        }
    }

    /// Processes a certificate object.
    #[allow(clippy::too_many_arguments)]
    fn process_cer(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        cert: &Arc<CaCert>,
        rpp: &Arc<Rpp>,
        manifest: &ValidPointManifest,
        processor: &mut P::PubPoint,
        uri: uri::Rsync,
        bytes: Bytes,
    ) -> Result<(), Failed> {
        let child = match Cert::decode(bytes) {
            Ok(child) => child,
            Err(_) => {
                warn!("{}: failed to decode.", uri);
                walk.metrics.invalid_certs += 1;
                return Ok(())
            }
        };

        if child.key_usage() == KeyUsage::Ca {
            self.process_ca_cer(
                walk, cert, rpp, manifest, processor, uri, child
            )
        }
        else {
            self.process_router_cer(
                walk, cert, manifest, processor, uri, child
            )
        }
    }

    /// Processes a subordinate CA certificate.
    ///
    /// If the certificate is valid, it is handed to the processor and, if
    /// that wants to see its content, pushed onto the traversal stack.
    #[allow(clippy::too_many_arguments)]
    fn process_ca_cer(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        cert: &Arc<CaCert>,
        rpp: &Arc<Rpp>,
        manifest: &ValidPointManifest,
        processor: &mut P::PubPoint,
        uri: uri::Rsync,
        child: Cert,
    ) -> Result<(), Failed> {
        if cert.check_loop(&child).is_err() {
            warn!("{}: certificate loop detected.", uri);
            walk.metrics.invalid_certs += 1;
            return Ok(())
        }
        if self.check_crl(manifest, &uri, &child).is_err() {
            walk.metrics.invalid_certs += 1;
            return Ok(())
        }
        let child = match child.validate_ca(cert.cert(), self.engine.strict) {
            Ok(child) => child,
            Err(_) => {
                warn!("{}: CA certificate failed to validate.", uri);
                walk.metrics.invalid_certs += 1;
                return Ok(())
            }
        };
        let child = CaCert::chain(cert, uri.clone(), child)?;

        walk.metrics.valid_ca_certs += 1;

        let mut child_processor = match processor.process_ca(&uri, &child)? {
            Some(processor) => processor,
            None => return Ok(())
        };
        child_processor.update_refresh(child.cert().validity().not_after());

        walk.stack.push(DeferredCa {
            rpp: rpp.clone(),
            cert: child,
            processor: child_processor,
        });
        Ok(())
    }

    /// Processes a BGPsec router certificate.
    ///
    /// Emits one router key per AS number the certificate holds resources
    /// for.
    fn process_router_cer(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        cert: &Arc<CaCert>,
        manifest: &ValidPointManifest,
        processor: &mut P::PubPoint,
        uri: uri::Rsync,
        child: Cert,
    ) -> Result<(), Failed> {
        if child.validate_router(cert.cert(), self.engine.strict).is_err() {
            warn!("{}: router certificate failed to validate.", uri);
            walk.metrics.invalid_certs += 1;
            return Ok(())
        }
        if self.check_crl(manifest, &uri, &child).is_err() {
            walk.metrics.invalid_certs += 1;
            return Ok(())
        }

        let key_info = child.subject_public_key_info().to_info_bytes();
        if key_info.len() != ROUTER_KEY_SPKI_LEN {
            warn!("{}: router certificate with non-P-256 key.", uri);
            walk.metrics.invalid_certs += 1;
            return Ok(())
        }
        let ski = child.subject_key_identifier();
        let blocks = match child.as_resources().to_blocks() {
            Ok(blocks) => blocks,
            Err(_) => {
                warn!("{}: router certificate with inherited ASes.", uri);
                walk.metrics.invalid_certs += 1;
                return Ok(())
            }
        };

        walk.metrics.valid_router_certs += 1;
        for block in blocks.iter() {
            for asn in u32::from(block.min())..=u32::from(block.max()) {
                processor.process_router_key(
                    &uri, &child, ski, asn.into(), key_info.clone()
                )?;
            }
        }
        Ok(())
    }

    /// Processes a ROA object.
    fn process_roa(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        cert: &Arc<CaCert>,
        manifest: &ValidPointManifest,
        processor: &mut P::PubPoint,
        uri: uri::Rsync,
        bytes: Bytes,
    ) -> Result<(), Failed> {
        let roa = match Roa::decode(bytes, self.engine.strict) {
            Ok(roa) => roa,
            Err(_) => {
                warn!("{}: failed to decode.", uri);
                walk.metrics.invalid_roas += 1;
                return Ok(())
            }
        };
        match roa.process(
            cert.cert(),
            self.engine.strict,
            |ee_cert| self.check_crl(manifest, &uri, ee_cert)
        ) {
            Ok((ee_cert, route)) => {
                walk.metrics.valid_roas += 1;
                processor.process_roa(&uri, ee_cert, route)?
            }
            Err(_) => {
                walk.metrics.invalid_roas += 1;
                warn!("{}: validation failed.", uri)
            }
        }
        Ok(())
    }

    /// Processes a ghostbusters record.
    ///
    /// Only the signature is verified; the content is advisory.
    fn process_gbr(
        &self,
        walk: &mut TalWalk<P::PubPoint>,
        cert: &Arc<CaCert>,
        manifest: &ValidPointManifest,
        processor: &mut P::PubPoint,
        uri: uri::Rsync,
        bytes: Bytes,
    ) -> Result<(), Failed> {
        let obj = match SignedObject::decode(bytes, self.engine.strict) {
            Ok(obj) => obj,
            Err(_) => {
                warn!("{}: failed to decode.", uri);
                walk.metrics.invalid_gbrs += 1;
                return Ok(())
            }
        };
        match obj.process(
            cert.cert(),
            self.engine.strict,
            |ee_cert| self.check_crl(manifest, &uri, ee_cert)
        ) {
            Ok((ee_cert, content)) => {
                walk.metrics.valid_gbrs += 1;
                processor.process_gbr(&uri, ee_cert, content)?
            }
            Err(_) => {
                walk.metrics.invalid_gbrs += 1;
                warn!("{}: validation failed.", uri)
            }
        }
        Ok(())
    }

    /// Checks whether a certificate has been revoked.
    ///
    /// Also checks that the certificate agrees with the publication
    /// point’s CRL choice.
    fn check_crl(
        &self,
        manifest: &ValidPointManifest,
        uri: &uri::Rsync,
        cert: &Cert,
    ) -> Result<(), ValidationError> {
        let crl_uri = match cert.crl_uri() {
            Some(some) => some,
            None => {
                warn!("{}: certificate has no CRL URI.", uri);
                return Err(ValidationError)
            }
        };

        if *crl_uri != manifest.crl_uri {
            warn!("{}: certificate's CRL differs from manifest's.", uri);
            return Err(ValidationError)
        }

        if manifest.crl.contains(cert.serial_number()) {
            warn!("{}: certificate has been revoked.", uri);
            return Err(ValidationError)
        }

        Ok(())
    }
}


//------------ TalWalk -------------------------------------------------------

/// The state of walking the tree below one TAL URI.
///
/// Every URI attempt gets a fresh value so the key state observed from a
/// failed earlier URI cannot leak into the next attempt.
struct TalWalk<'a, P> {
    /// The TAL being processed.
    tal: &'a Tal,

    /// The index of the TAL in the metrics.
    tal_index: usize,

    /// What do we know about the trust anchor’s key so far?
    key_state: KeyState,

    /// The subordinate CAs waiting to be visited.
    stack: DeferStack<DeferredCa<P>>,

    /// The metrics for this TAL.
    metrics: &'a mut TalMetrics,
}

impl<'a, P> TalWalk<'a, P> {
    /// Creates a new walk state.
    fn new(
        tal: &'a Tal, tal_index: usize, metrics: &'a mut TalMetrics
    ) -> Self {
        TalWalk {
            tal,
            tal_index,
            key_state: KeyState::Untested,
            stack: DeferStack::new(),
            metrics,
        }
    }

    /// Converts the key state after a failed root walk into the outcome.
    fn outcome(&self) -> Result<UriOutcome, Failed> {
        self.key_state.outcome()
    }
}


//------------ KeyState ------------------------------------------------------

/// What we know about the public key of a trust anchor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum KeyState {
    /// The root certificate’s key hasn’t been compared with the TAL yet.
    Untested,

    /// The root certificate’s key matched the TAL’s.
    Valid,

    /// The root certificate’s key did not match the TAL’s.
    Invalid,
}

impl KeyState {
    /// Classifies a failed root walk.
    ///
    /// A key mismatch is a soft error since the TAL’s URIs are ordered
    /// alternatives. A failure while the key matched rejects the TAL. So
    /// does a failure before the key could be compared at all: that is an
    /// infrastructure problem, not a trust mismatch.
    fn outcome(self) -> Result<UriOutcome, Failed> {
        match self {
            KeyState::Invalid => Ok(UriOutcome::TryNext),
            KeyState::Valid | KeyState::Untested => Err(Failed),
        }
    }
}


//------------ UriOutcome ----------------------------------------------------

/// The result of trying one URI of a TAL.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum UriOutcome {
    /// The URI produced a completed walk. The TAL is done.
    Handled,

    /// The URI failed softly. The next URI should be tried.
    TryNext,
}


//------------ DeferStack ----------------------------------------------------

/// A stack of items whose processing has been deferred.
///
/// This is a plain LIFO: the most recently discovered subordinate CA is
/// validated next, which makes the traversal depth first. That keeps the
/// live working set proportional to the depth of the tree rather than its
/// width and keeps failures naturally contained: when a subtree fails,
/// only its own descendants are affected.
#[derive(Clone, Debug)]
struct DeferStack<T> {
    items: Vec<T>,
}

impl<T> DeferStack<T> {
    /// Creates a new, empty stack.
    fn new() -> Self {
        DeferStack { items: Vec::new() }
    }

    /// Pushes an item onto the stack.
    fn push(&mut self, item: T) {
        self.items.push(item)
    }

    /// Pops the most recently pushed item off the stack.
    ///
    /// Ownership of the item transfers to the caller.
    fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }
}


//------------ DeferredCa ----------------------------------------------------

/// A subordinate CA waiting on the traversal stack.
struct DeferredCa<P> {
    /// The publication point the CA was discovered at.
    ///
    /// Keeping a reference here pins the parent’s publication point for
    /// as long as any of its children are still waiting.
    rpp: Arc<Rpp>,

    /// The validated CA certificate. Also keeps the certificate path to
    /// the trust anchor alive through its parent links.
    cert: Arc<CaCert>,

    /// The processor for data published by this CA.
    processor: P,
}


//------------ Rpp -----------------------------------------------------------

/// The files of a repository publication point in the local cache.
#[derive(Clone, Debug)]
pub struct Rpp {
    /// The caRepository URI the point was fetched from.
    ca_repository: uri::Rsync,

    /// The local directory holding the point’s files.
    path: PathBuf,
}

impl Rpp {
    /// Creates a new publication point.
    fn new(ca_repository: uri::Rsync, path: PathBuf) -> Self {
        Rpp { ca_repository, path }
    }

    /// Loads the object with the given URI from the point.
    ///
    /// Returns `None` if the URI doesn’t point into this publication
    /// point or the file cannot be read.
    fn load(&self, uri: &uri::Rsync) -> Option<Bytes> {
        let relative = uri.relative_to(&self.ca_repository)?;
        let file = str_from_ascii(relative.as_ref())?;
        let mut path = self.path.clone();
        for item in file.split('/').filter(|item| !item.is_empty()) {
            path.push(item)
        }
        fs::read(path).ok().map(Into::into)
    }
}


//------------ ValidPointManifest --------------------------------------------

/// All the information from a validated manifest.
#[derive(Clone, Debug)]
struct ValidPointManifest {
    /// The payload of the manifest.
    content: ManifestContent,

    /// The CRL distribution point URI of the manifest.
    crl_uri: uri::Rsync,

    /// The CRL.
    crl: Crl,
}


//------------ CaCert --------------------------------------------------------

/// A CA certificate plus references to all its parents.
#[derive(Clone, Debug)]
pub struct CaCert {
    /// The resource certificate of this CA.
    cert: ResourceCert,

    /// The certificate’s location.
    uri: TalUri,

    /// The CA repository URI of the certificate.
    ca_repository: uri::Rsync,

    /// The manifest URI of the certificate.
    rpki_manifest: uri::Rsync,

    /// The parent CA.
    ///
    /// This will be `None` for a trust anchor certificate.
    parent: Option<Arc<CaCert>>,

    /// The index of the TAL in the metrics.
    tal: usize,

    /// The combined validity of the certificate.
    ///
    /// This is derived from the validity of all the parents and the
    /// certificate itself.
    combined_validity: Validity,
}

impl CaCert {
    /// Creates a new CA cert for a trust anchor.
    pub fn root(
        cert: ResourceCert, uri: TalUri, tal: usize
    ) -> Result<Arc<Self>, Failed> {
        Self::new(cert, uri, None, tal)
    }

    /// Creates a new CA cert for an issued CA.
    pub fn chain(
        issuer: &Arc<Self>,
        uri: uri::Rsync,
        cert: ResourceCert
    ) -> Result<Arc<Self>, Failed> {
        Self::new(cert, TalUri::Rsync(uri), Some(issuer.clone()), issuer.tal)
    }

    /// Creates a new CA cert from its various parts.
    fn new(
        cert: ResourceCert,
        uri: TalUri,
        parent: Option<Arc<Self>>,
        tal: usize,
    ) -> Result<Arc<Self>, Failed> {
        let combined_validity = match parent.as_ref() {
            Some(ca) => cert.validity().trim(ca.combined_validity()),
            None => cert.validity()
        };
        let ca_repository = match cert.ca_repository() {
            Some(uri) => uri.clone(),
            None => {
                // This is actually checked during certificate validation,
                // so this should never happen.
                error!(
                    "CA cert {} has no repository URI. \
                     Why has it not been rejected yet?",
                    uri
                );
                return Err(Failed)
            }
        };
        let rpki_manifest = match cert.rpki_manifest() {
            Some(uri) => uri.clone(),
            None => {
                // This is actually checked during certificate validation,
                // so this should never happen.
                error!(
                    "CA cert {} has no manifest URI. \
                     Why has it not been rejected yet?",
                    uri
                );
                return Err(Failed)
            }
        };
        Ok(Arc::new(CaCert {
            cert, uri, ca_repository, rpki_manifest, parent, tal,
            combined_validity,
        }))
    }

    /// Checks whether a child certificate has appeared in the chain
    /// already.
    pub fn check_loop(&self, cert: &Cert) -> Result<(), Failed> {
        self._check_loop(cert.subject_key_identifier())
    }

    /// The actual recursive loop test.
    ///
    /// We are comparing certificates by comparing their subject key
    /// identifiers.
    fn _check_loop(&self, key_id: KeyIdentifier) -> Result<(), Failed> {
        if self.cert.subject_key_identifier() == key_id {
            Err(Failed)
        }
        else if let Some(ref parent) = self.parent {
            parent._check_loop(key_id)
        }
        else {
            Ok(())
        }
    }

    /// Returns a reference to the resource certificate.
    pub fn cert(&self) -> &ResourceCert {
        &self.cert
    }

    /// Returns a reference to the certificate’s location.
    pub fn uri(&self) -> &TalUri {
        &self.uri
    }

    /// Returns a reference to the caRepository URI of the certificate.
    pub fn ca_repository(&self) -> &uri::Rsync {
        &self.ca_repository
    }

    /// Returns a reference to the rpkiManifest URI of the certificate.
    pub fn rpki_manifest(&self) -> &uri::Rsync {
        &self.rpki_manifest
    }

    /// Returns the index of the certificate’s TAL in the metrics.
    pub fn tal_index(&self) -> usize {
        self.tal
    }

    /// Returns the combined validity of the whole chain.
    pub fn combined_validity(&self) -> Validity {
        self.combined_validity
    }
}


//------------ ProcessRun ----------------------------------------------------

/// A type that can process the valid data from a validation run.
pub trait ProcessRun: Send + Sync {
    /// The type processing the data of a single publication point.
    type PubPoint: ProcessPubPoint;

    /// Processes the given trust anchor.
    ///
    /// If the method wants the content of this trust anchor to be
    /// validated and processed, it returns a processor for it as some
    /// success value. If it rather wishes to skip this trust anchor, it
    /// returns `Ok(None)`. If it wishes to abort processing, it returns
    /// an error.
    fn process_ta(
        &self, tal: &Tal, uri: &TalUri, cert: &CaCert, tal_index: usize,
    ) -> Result<Option<Self::PubPoint>, Failed>;
}


//------------ ProcessPubPoint -----------------------------------------------

/// A type that can process the valid data of a single publication point.
pub trait ProcessPubPoint: Sized + Send + Sync {
    /// Updates the refresh time for the data of this publication point.
    fn update_refresh(&mut self, not_after: Time) {
        let _ = not_after;
    }

    /// Processes the certificate of a validated subordinate CA.
    ///
    /// The method can choose how to proceed. If it chooses to process the
    /// CA, it returns `Ok(Some(value))` with a new processor to be used
    /// for this CA. If it wishes to skip this CA, it returns `Ok(None)`.
    /// And if it wishes to abort processing, it returns an error.
    fn process_ca(
        &mut self, uri: &uri::Rsync, cert: &CaCert,
    ) -> Result<Option<Self>, Failed>;

    /// Processes the content of a validated ROA.
    ///
    /// The method is given the URI, the EE certificate, and the content of
    /// the ROA. If it returns an error, the entire publication point is
    /// aborted.
    fn process_roa(
        &mut self,
        uri: &uri::Rsync,
        cert: ResourceCert,
        route: RouteOriginAttestation
    ) -> Result<(), Failed> {
        let _ = (uri, cert, route);
        Ok(())
    }

    /// Processes a single router key from a validated router certificate.
    ///
    /// The method is called once for every AS number the certificate
    /// holds resources for.
    fn process_router_key(
        &mut self,
        uri: &uri::Rsync,
        cert: &Cert,
        ski: KeyIdentifier,
        as_id: AsId,
        key_info: Bytes,
    ) -> Result<(), Failed> {
        let _ = (uri, cert, ski, as_id, key_info);
        Ok(())
    }

    /// Processes the content of a validated ghostbusters record.
    fn process_gbr(
        &mut self,
        uri: &uri::Rsync,
        cert: ResourceCert,
        content: Bytes
    ) -> Result<(), Failed> {
        let _ = (uri, cert, content);
        Ok(())
    }

    /// Completes processing of the publication point.
    ///
    /// The method is called when all objects of the point have been
    /// processed successfully or have been actively ignored.
    fn commit(self);

    /// Completes processing of a publication point that failed.
    ///
    /// The default implementation does nothing at all.
    fn cancel(self, cert: &CaCert) {
        let _ = cert;
    }
}


//------------ Helper Functions ----------------------------------------------

/// Returns the string slice for a bytes slice of ASCII characters.
fn str_from_ascii(slice: &[u8]) -> Option<&str> {
    if slice.is_ascii() {
        str::from_utf8(slice).ok()
    }
    else {
        None
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use crate::config::Config;

    const KEY_INFO: &str =
        "MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEAQIDBAUGBwgJCgsMDQ4PEBESExQV\n\
         FhcYGRobHB0eHyAhIiMkJSYnKCkqKywtLi8wMTIzNDU2Nzg5Ojs8PT4/QA==\n";

    #[test]
    fn defer_stack_is_lifo() {
        let mut stack = DeferStack::new();
        stack.push(1u32);
        stack.push(2);
        stack.push(3);
        assert_eq!(stack.pop(), Some(3));
        stack.push(4);
        assert_eq!(stack.pop(), Some(4));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn key_state_classifies_failures() {
        // A key mismatch is soft: try the next URI.
        assert!(matches!(
            KeyState::Invalid.outcome(), Ok(UriOutcome::TryNext)
        ));
        // Failure after a matching key rejects the TAL.
        assert!(KeyState::Valid.outcome().is_err());
        // So does failure before the key could be tested.
        assert!(KeyState::Untested.outcome().is_err());
    }

    #[test]
    fn ascii_file_names() {
        assert_eq!(str_from_ascii(b"rpki.roa"), Some("rpki.roa"));
        assert_eq!(str_from_ascii(b"\xc3\xa4.roa"), None);
    }

    #[test]
    fn reload_tals_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let tal_dir = dir.path().join("tals");
        fs::create_dir_all(&tal_dir).unwrap();
        let mut file = fs::File::create(tal_dir.join("good.tal")).unwrap();
        write!(
            file, "rsync://example.com/ta/root.cer\n\n{}", KEY_INFO
        ).unwrap();
        drop(file);
        // Files with other extensions are skipped.
        fs::File::create(tal_dir.join("notes.txt")).unwrap();

        let config = Config::test_config(dir.path());
        let engine = Engine::new(&config).unwrap();
        assert_eq!(engine.tals.len(), 1);
        assert_eq!(engine.tals[0].name(), "good");
    }

    #[test]
    fn reload_tals_rejects_broken_tal() {
        let dir = tempfile::tempdir().unwrap();
        let tal_dir = dir.path().join("tals");
        fs::create_dir_all(&tal_dir).unwrap();
        let mut file = fs::File::create(tal_dir.join("bad.tal")).unwrap();
        write!(file, "ftp://example.com/ta/root.cer\n\nAAAA\n").unwrap();
        drop(file);

        let config = Config::test_config(dir.path());
        assert!(Engine::new(&config).is_err());
    }
}
