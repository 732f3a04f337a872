//! # learner-recover - Learner Zone Failover Toolkit
//!
//! Disaster-recovery tooling for a PD/TiKV cluster whose primary zone replicates into one or
//! more learner (backup) zones. Two long-lived responsibilities live in this crate:
//!
//! - **Recovery-info collection**: every interval, observe the primary zone's store IDs, the
//!   coordinator's cluster ID and allocator checkpoint, and per-learner replication lag, and
//!   merge the observation into a durable JSON snapshot that never regresses.
//! - **Failover orchestration**: given the snapshot, stage the unsafe-recovery tool, stop and
//!   repair the learner stores, rebuild PD with the recovered identity, wait until it serves,
//!   and scale the learners back in as a working cluster.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              LEARNER RECOVER                                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  collect:  PD API + PROMETHEUS → COLLECTOR → MERGER → SNAPSHOT STORE (JSON)  │
//! │  recover:  SNAPSHOT + TOPOLOGY → PLAN → ORCHESTRATOR → ssh / scp / tiup      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports grouped by concern.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::process::Command;
use tokio::signal;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Identifiers, Networking
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Args, Parser, Subcommand, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Ports, API paths, metric names and timing defaults shared by the collector
// and the orchestrator.
// ============================================================================

/// Tool version - follows semantic versioning
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const TOOL_NAME: &str = "learner-recover";
pub const TOOL_FULL_NAME: &str = "Learner Zone Recovery Toolkit";

// ----------------------------------------------------------------------------
// Topology Defaults
// ----------------------------------------------------------------------------

/// PD client port when a `pd_servers` entry omits `client_port`
pub const DEFAULT_PD_CLIENT_PORT: u16 = 2379;

/// Prometheus port when a `monitoring_servers` entry omits `port`
pub const DEFAULT_PROMETHEUS_PORT: u16 = 9090;

/// TiKV service port, also part of the systemd unit name
pub const DEFAULT_TIKV_PORT: u16 = 20160;

/// TiKV status port, the `instance` label on TiKV metrics
pub const DEFAULT_TIKV_STATUS_PORT: u16 = 20180;

pub const DEFAULT_SSH_USER: &str = "tidb";
pub const DEFAULT_SSH_PORT: u16 = 22;

// ----------------------------------------------------------------------------
// Coordinator & Metrics Protocol
// ----------------------------------------------------------------------------

/// Bias added to the observed allocator checkpoint. A rebuilt PD must start
/// allocating strictly above anything handed out before the disaster.
pub const ALLOC_ID_OFFSET: u64 = 1 << 32;

/// Literal prefix of the `type` label on `pd_cluster_metadata`
pub const CLUSTER_ID_TYPE_PREFIX: &str = "cluster";

pub const PD_STORES_PATH: &str = "/pd/api/v1/stores";
pub const PD_REPLICATE_CONFIG_PATH: &str = "/pd/api/v1/config/replicate";
pub const PROMETHEUS_QUERY_PATH: &str = "/api/v1/query";

pub const CLUSTER_METADATA_METRIC: &str = "pd_cluster_metadata";
pub const ALLOC_ID_METRIC: &str = "pd_cluster_id";
pub const RPO_QUERY: &str = "sum(tikv_resolved_ts_min_resolved_ts_gap_seconds) by (instance)";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default delay between two collection rounds (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default bound on a single metrics/API query (seconds)
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 5;

/// Default pause between two readiness probes (milliseconds)
pub const DEFAULT_PROBE_RETRY_INTERVAL_MS: u64 = 1000;

/// Default bound on a single readiness probe (seconds)
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "LEARNER_RECOVER_";

pub const DEFAULT_TIUP_PATH: &str = "tiup";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Label sets and matching, the recovery snapshot, its merge rules and the
// pre-flight validation the orchestrator depends on.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Label Sets
// ----------------------------------------------------------------------------

/// A set of labels keyed by label name, e.g. `{zone: "east", host: "h1"}`.
///
/// Backed by a `BTreeMap` so iteration (and therefore display and
/// serialization) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Create an empty label set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a label, returning the previous value for the key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Get a label value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Display for LabelSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

/// Parses the CLI selector form `zone=east,host=h1`.
impl FromStr for LabelSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut labels = LabelSet::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ConfigError::invalid_value("labels", format!("'{}' is not a key=value pair", pair))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::invalid_value(
                    "labels",
                    format!("'{}' has an empty label key", pair),
                ));
            }
            if labels.insert(key, value.trim()).is_some() {
                return Err(ConfigError::invalid_value(
                    "labels",
                    format!("label '{}' is given more than once", key),
                ));
            }
        }
        Ok(labels)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Label Matching
// ----------------------------------------------------------------------------

/// How a required label set is compared against a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every required pair must be present in the candidate; extra candidate
    /// labels are ignored.
    #[default]
    Subset,
    /// The candidate must carry exactly the required pairs.
    Exact,
}

impl Display for MatchMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Subset => write!(f, "subset"),
            MatchMode::Exact => write!(f, "exact"),
        }
    }
}

/// Selects stores and topology nodes by label.
///
/// An empty requirement matches every candidate in `Subset` mode. Callers
/// that build requirements from operator input reject empty sets up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelMatcher {
    mode: MatchMode,
}

impl LabelMatcher {
    pub const fn new(mode: MatchMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Does `candidate` satisfy `required` under this matcher's mode.
    pub fn matches(&self, required: &LabelSet, candidate: &LabelSet) -> bool {
        match self.mode {
            MatchMode::Subset => labels_match(required, candidate),
            MatchMode::Exact => required == candidate,
        }
    }
}

/// Subset match: true iff every key of `required` is present in `candidate`
/// with an equal value. Only the left-hand keys are checked.
pub fn labels_match(required: &LabelSet, candidate: &LabelSet) -> bool {
    required
        .iter()
        .all(|(key, value)| candidate.get(key) == Some(value))
}

// ----------------------------------------------------------------------------
// 3.3 Recovery Snapshot
// ----------------------------------------------------------------------------

/// One replication-lag observation for a learner store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpoSample {
    /// Store status address (`host:status_port`)
    #[serde(alias = "instance")]
    pub node: String,
    /// Lag in seconds, kept verbatim as Prometheus reported it
    pub value: String,
}

impl RpoSample {
    pub fn new(node: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            value: value.into(),
        }
    }

    /// Lag in seconds, if the reported value is numeric
    pub fn lag_seconds(&self) -> Option<f64> {
        self.value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

/// The fields of a recovery snapshot, named as they appear on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SnapshotField {
    StoreIds,
    ClusterId,
    AllocId,
    Rpos,
}

impl SnapshotField {
    pub const ALL: [SnapshotField; 4] = [
        SnapshotField::StoreIds,
        SnapshotField::ClusterId,
        SnapshotField::AllocId,
        SnapshotField::Rpos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotField::StoreIds => "storeIds",
            SnapshotField::ClusterId => "clusterId",
            SnapshotField::AllocId => "allocId",
            SnapshotField::Rpos => "rpos",
        }
    }
}

impl Display for SnapshotField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn join_fields(fields: &[SnapshotField]) -> String {
    fields
        .iter()
        .map(SnapshotField::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Best known recovery state, each field as of its most recent successful
/// observation. Fields are observed independently and may be stale relative
/// to each other.
///
/// Serialized as `{"storeIds": [...], "clusterId": "...", "allocId": N, "rpos": [...]}`.
/// Absent fields are omitted; unknown keys are ignored on read. The older
/// `storeIDs` / `clusterID` / `allocID` spellings are accepted as well.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    #[serde(default, alias = "storeIDs", skip_serializing_if = "Option::is_none")]
    pub store_ids: Option<BTreeSet<u64>>,

    #[serde(default, alias = "clusterID", skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    #[serde(default, alias = "allocID", skip_serializing_if = "Option::is_none")]
    pub alloc_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpos: Option<Vec<RpoSample>>,
}

impl RecoverySnapshot {
    /// Treat the placeholder values older writers used for "unknown"
    /// (empty strings and lists, a zero allocator) as absent.
    pub fn normalized(mut self) -> Self {
        if self.store_ids.as_ref().map_or(false, BTreeSet::is_empty) {
            self.store_ids = None;
        }
        if self.cluster_id.as_deref().map_or(false, str::is_empty) {
            self.cluster_id = None;
        }
        if self.alloc_id == Some(0) {
            self.alloc_id = None;
        }
        if self.rpos.as_ref().map_or(false, Vec::is_empty) {
            self.rpos = None;
        }
        self
    }

    /// The learner with the largest numeric lag.
    pub fn worst_rpo(&self) -> Option<(&RpoSample, f64)> {
        self.rpos
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|sample| sample.lag_seconds().map(|lag| (sample, lag)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Fields currently holding a value.
    pub fn present_fields(&self) -> Vec<SnapshotField> {
        SnapshotField::ALL
            .into_iter()
            .filter(|field| match field {
                SnapshotField::StoreIds => self.store_ids.is_some(),
                SnapshotField::ClusterId => self.cluster_id.is_some(),
                SnapshotField::AllocId => self.alloc_id.is_some(),
                SnapshotField::Rpos => self.rpos.is_some(),
            })
            .collect()
    }
}

/// What a single collection round managed to observe. Any field may be
/// absent, because its query failed, timed out or returned nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialSnapshot {
    pub store_ids: Option<BTreeSet<u64>>,
    pub cluster_id: Option<String>,
    pub alloc_id: Option<u64>,
    pub rpos: Option<Vec<RpoSample>>,
}

impl PartialSnapshot {
    pub fn is_empty(&self) -> bool {
        self.observed_fields().is_empty()
    }

    /// Fields carrying a value the merger will accept.
    pub fn observed_fields(&self) -> Vec<SnapshotField> {
        SnapshotField::ALL
            .into_iter()
            .filter(|field| match field {
                SnapshotField::StoreIds => is_informative(&self.store_ids, |s| !s.is_empty()),
                SnapshotField::ClusterId => is_informative(&self.cluster_id, |s| !s.is_empty()),
                SnapshotField::AllocId => self.alloc_id.is_some(),
                SnapshotField::Rpos => is_informative(&self.rpos, |r| !r.is_empty()),
            })
            .collect()
    }
}

impl From<RecoverySnapshot> for PartialSnapshot {
    fn from(snapshot: RecoverySnapshot) -> Self {
        Self {
            store_ids: snapshot.store_ids,
            cluster_id: snapshot.cluster_id,
            alloc_id: snapshot.alloc_id,
            rpos: snapshot.rpos,
        }
    }
}

fn is_informative<T>(value: &Option<T>, non_empty: impl Fn(&T) -> bool) -> bool {
    value.as_ref().map_or(false, non_empty)
}

// ----------------------------------------------------------------------------
// 3.4 Snapshot Merger
// ----------------------------------------------------------------------------

/// Folds a round's observation into the previous snapshot.
///
/// Per field: a present, non-empty observation replaces the previous value;
/// anything else carries the previous value forward. An empty RPO list or an
/// empty store set is a failed observation, not "nothing to report".
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotMerger;

impl SnapshotMerger {
    pub fn merge(previous: &RecoverySnapshot, observed: &PartialSnapshot) -> RecoverySnapshot {
        RecoverySnapshot {
            store_ids: keep_latest(&previous.store_ids, &observed.store_ids, |s| !s.is_empty()),
            cluster_id: keep_latest(&previous.cluster_id, &observed.cluster_id, |s| !s.is_empty()),
            alloc_id: keep_latest(&previous.alloc_id, &observed.alloc_id, |_| true),
            rpos: keep_latest(&previous.rpos, &observed.rpos, |r| !r.is_empty()),
        }
    }

    /// Fields whose value differs between two snapshots.
    pub fn changed_fields(before: &RecoverySnapshot, after: &RecoverySnapshot) -> Vec<SnapshotField> {
        SnapshotField::ALL
            .into_iter()
            .filter(|field| match field {
                SnapshotField::StoreIds => before.store_ids != after.store_ids,
                SnapshotField::ClusterId => before.cluster_id != after.cluster_id,
                SnapshotField::AllocId => before.alloc_id != after.alloc_id,
                SnapshotField::Rpos => before.rpos != after.rpos,
            })
            .collect()
    }
}

fn keep_latest<T: Clone>(
    previous: &Option<T>,
    observed: &Option<T>,
    non_empty: impl Fn(&T) -> bool,
) -> Option<T> {
    match observed {
        Some(value) if non_empty(value) => Some(value.clone()),
        _ => previous.clone(),
    }
}

// ----------------------------------------------------------------------------
// 3.5 Snapshot Validation
// ----------------------------------------------------------------------------

/// A snapshot carrying everything the failover needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSnapshot {
    pub store_ids: BTreeSet<u64>,
    pub cluster_id: String,
    pub alloc_id: u64,
    /// Advisory only
    pub rpos: Vec<RpoSample>,
}

impl ValidatedSnapshot {
    /// The failed-store list as `tikv-ctl -s` expects it, ascending.
    pub fn failed_stores_arg(&self) -> String {
        self.store_ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Pre-flight check run before any remote side effect. Requires non-empty
/// `storeIds`, non-empty `clusterId` and a defined `allocId`; every missing
/// field is named in the error.
pub fn validate_snapshot(snapshot: &RecoverySnapshot) -> Result<ValidatedSnapshot, SnapshotError> {
    let mut missing = Vec::new();

    let store_ids = snapshot.store_ids.clone().filter(|s| !s.is_empty());
    if store_ids.is_none() {
        missing.push(SnapshotField::StoreIds);
    }
    let cluster_id = snapshot.cluster_id.clone().filter(|s| !s.is_empty());
    if cluster_id.is_none() {
        missing.push(SnapshotField::ClusterId);
    }
    if snapshot.alloc_id.is_none() {
        missing.push(SnapshotField::AllocId);
    }

    match (store_ids, cluster_id, snapshot.alloc_id) {
        (Some(store_ids), Some(cluster_id), Some(alloc_id)) => Ok(ValidatedSnapshot {
            store_ids,
            cluster_id,
            alloc_id,
            rpos: snapshot.rpos.clone().unwrap_or_default(),
        }),
        _ => Err(SnapshotError::Incomplete { missing }),
    }
}

// ----------------------------------------------------------------------------
// 3.6 Cluster Topology
// ----------------------------------------------------------------------------

/// The subset of a tiup topology file this tool reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub global: GlobalOptions,
    #[serde(default)]
    pub pd_servers: Vec<PdServer>,
    #[serde(default)]
    pub monitoring_servers: Vec<MonitoringServer>,
    #[serde(default)]
    pub tikv_servers: Vec<TikvServer>,
}

/// `global` section: remote-exec user and port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalOptions {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            ssh_port: default_ssh_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdServer {
    pub host: String,
    #[serde(default = "default_pd_client_port")]
    pub client_port: u16,
}

impl PdServer {
    /// `host:client_port`, also the `instance` label on PD metrics
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringServer {
    pub host: String,
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
}

impl MonitoringServer {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TikvServer {
    pub host: String,
    #[serde(default = "default_tikv_port")]
    pub port: u16,
    #[serde(default = "default_tikv_status_port")]
    pub status_port: u16,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub deploy_dir: Option<String>,
    #[serde(default)]
    pub config: TikvServerConfig,
}

impl TikvServer {
    /// Labels declared for this store, from either `server.labels` spelling.
    pub fn labels(&self) -> &LabelSet {
        if self.config.dotted_labels.is_empty() {
            &self.config.server.labels
        } else {
            &self.config.dotted_labels
        }
    }

    /// `host:status_port`, the `instance` label on TiKV metrics
    pub fn status_address(&self) -> String {
        format!("{}:{}", self.host, self.status_port)
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Data directory, relative paths resolved against `deploy_dir`.
    pub fn resolved_data_dir(&self) -> Option<String> {
        let dir = self.data_dir.as_deref().filter(|d| !d.is_empty())?;
        match self.deploy_dir.as_deref() {
            Some(deploy) if !dir.starts_with('/') => {
                Some(format!("{}/{}", deploy.trim_end_matches('/'), dir))
            }
            _ => Some(dir.to_string()),
        }
    }
}

/// Per-store `config` block; only the labels are of interest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TikvServerConfig {
    #[serde(rename = "server.labels", default)]
    pub dotted_labels: LabelSet,
    #[serde(default)]
    pub server: TikvServerSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TikvServerSection {
    #[serde(default)]
    pub labels: LabelSet,
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.into()
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_pd_client_port() -> u16 {
    DEFAULT_PD_CLIENT_PORT
}

fn default_prometheus_port() -> u16 {
    DEFAULT_PROMETHEUS_PORT
}

fn default_tikv_port() -> u16 {
    DEFAULT_TIKV_PORT
}

fn default_tikv_status_port() -> u16 {
    DEFAULT_TIKV_STATUS_PORT
}

impl Topology {
    /// Load a topology YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TopologyError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(TopologyError::NotFound {
                path: path.to_path_buf(),
            });
        }

        Figment::from(Yaml::file(path))
            .extract()
            .map_err(|e| TopologyError::Parse {
                source_name: path.display().to_string(),
                message: e.to_string(),
            })
    }

    /// Parse a topology from a YAML string (for testing)
    pub fn from_yaml_str(yaml: &str) -> Result<Self, TopologyError> {
        Figment::from(Yaml::string(yaml))
            .extract()
            .map_err(|e| TopologyError::Parse {
                source_name: "<inline>".into(),
                message: e.to_string(),
            })
    }

    /// The PD every request is addressed to: the first one listed.
    pub fn first_pd(&self) -> Result<&PdServer, TopologyError> {
        self.pd_servers.first().ok_or(TopologyError::NoPdServers)
    }

    pub fn first_monitor(&self) -> Result<&MonitoringServer, TopologyError> {
        self.monitoring_servers
            .first()
            .ok_or(TopologyError::NoMonitoringServers)
    }

    /// TiKV servers whose declared labels satisfy `required`.
    pub fn tikv_matching<'a>(
        &'a self,
        required: &'a LabelSet,
        matcher: &'a LabelMatcher,
    ) -> impl Iterator<Item = &'a TikvServer> + 'a {
        self.tikv_servers
            .iter()
            .filter(move |server| matcher.matches(required, server.labels()))
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Comprehensive error types using thiserror:
// - Each error variant has a descriptive message
// - Errors carry the endpoint, path or phase they concern
// - RecoverError is the crate-level error every operation funnels into
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Error
// ----------------------------------------------------------------------------

/// Top-level error type for the recovery toolkit.
#[derive(Error, Debug)]
pub enum RecoverError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Remote operation error: {0}")]
    Remote(#[from] RemoteError),

    /// A fatal failure, attributed to the phase it aborted.
    #[error("Phase '{phase}' failed: {source}")]
    Phase {
        phase: Phase,
        source: Box<RecoverError>,
    },

    #[error("Coordinator at {endpoint} did not become ready within {waited:?}")]
    ReadinessTimeout { endpoint: String, waited: Duration },

    #[error("Recovery cancelled during phase '{phase}'")]
    Cancelled { phase: Phase },

    #[error("Logging initialization failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RecoverError {
    /// Attribute this error to `phase` unless it already names one.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            RecoverError::Phase { .. } | RecoverError::Cancelled { .. } => self,
            other => RecoverError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The phase this error aborted, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            RecoverError::Phase { phase, .. } | RecoverError::Cancelled { phase } => Some(*phase),
            _ => None,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            RecoverError::Config(_) => "config",
            RecoverError::Topology(_) => "topology",
            RecoverError::Metrics(_) => "metrics",
            RecoverError::Snapshot(_) => "snapshot",
            RecoverError::Remote(_) => "remote",
            RecoverError::Phase { .. } => "phase",
            RecoverError::ReadinessTimeout { .. } => "readiness",
            RecoverError::Cancelled { .. } => "cancelled",
            RecoverError::Logging(_) => "logging",
            RecoverError::Io(_) => "io",
        }
    }

    /// Check if the error is recoverable by simply retrying later
    pub fn is_recoverable(&self) -> bool {
        match self {
            RecoverError::Metrics(_) | RecoverError::ReadinessTimeout { .. } => true,
            RecoverError::Phase { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }
}

/// Result type alias for toolkit operations
pub type RecoverResult<T> = Result<T, RecoverError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Topology Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone)]
pub enum TopologyError {
    #[error("Topology file not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to parse topology {source_name}: {message}")]
    Parse { source_name: String, message: String },

    #[error("Topology has no pd_servers")]
    NoPdServers,

    #[error("Topology has no monitoring_servers")]
    NoMonitoringServers,

    #[error("No TiKV nodes match labels {{{labels}}}")]
    NoMatchingStores { labels: String },

    #[error("TiKV node {address} has no data_dir")]
    MissingDataDir { address: String },
}

// ----------------------------------------------------------------------------
// 4.4 Metrics & Coordinator API Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone)]
pub enum MetricsError {
    #[error("Request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("Request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("{endpoint} answered HTTP {status}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("Unexpected response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("Query '{query}' failed: {message}")]
    QueryFailed { query: String, message: String },
}

impl MetricsError {
    pub fn from_reqwest(endpoint: impl Into<String>, err: reqwest::Error) -> Self {
        let endpoint = endpoint.into();
        if err.is_timeout() {
            MetricsError::Timeout { endpoint }
        } else if let Some(status) = err.status() {
            MetricsError::HttpStatus {
                endpoint,
                status: status.as_u16(),
            }
        } else {
            MetricsError::Transport {
                endpoint,
                message: err.to_string(),
            }
        }
    }

    pub fn decode(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        MetricsError::Decode {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

pub type MetricsResult<T> = Result<T, MetricsError>;

// ----------------------------------------------------------------------------
// 4.5 Snapshot Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to read recovery snapshot {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to write recovery snapshot {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("Recovery snapshot {} is not valid JSON: {message}", .path.display())]
    Decode { path: PathBuf, message: String },

    #[error("Failed to encode recovery snapshot: {0}")]
    Encode(String),

    #[error("Recovery snapshot is incomplete, missing: {}", join_fields(.missing))]
    Incomplete { missing: Vec<SnapshotField> },
}

impl SnapshotError {
    /// Missing fields, for `Incomplete`
    pub fn missing_fields(&self) -> &[SnapshotField] {
        match self {
            SnapshotError::Incomplete { missing } => missing,
            _ => &[],
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Remote Execution Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to launch '{program}': {source}")]
    Spawn { program: String, source: io::Error },

    #[error("Command '{command}' exited with {}: {output}", display_status(.status))]
    Failed {
        command: String,
        status: Option<i32>,
        output: String,
    },
}

fn display_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".into(),
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration with figment:
// - YAML configuration file
// - Environment variable overrides (LEARNER_RECOVER_ prefix, `__` nesting)
// - CLI flag overrides (collector only)
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include file/line information
    #[serde(default)]
    pub source_location: bool,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            source_location: false,
            colors: true,
        }
    }
}

impl LoggingConfig {
    /// Apply global `--log-level` / `--log-format` flags.
    pub fn with_overrides(mut self, level: Option<&str>, format: Option<&str>) -> Self {
        if let Some(level) = level {
            self.level = level.to_string();
        }
        if let Some(format) = format {
            self.format = format.to_string();
        }
        self
    }
}

// ----------------------------------------------------------------------------
// 5.2 Collector Configuration
// ----------------------------------------------------------------------------

/// Settings for the recovery-info collector (`collect`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CollectorConfig {
    /// Topology file of the running cluster
    #[serde(default)]
    pub topology: PathBuf,

    /// Labels identifying the primary zone's stores
    #[serde(default)]
    pub master_labels: LabelSet,

    /// Labels identifying the learner stores
    #[serde(default)]
    pub backup_labels: LabelSet,

    /// Where the snapshot is persisted
    #[serde(default)]
    pub save: PathBuf,

    /// Delay between rounds
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Bound on each query within a round
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Number of rounds, unbounded when unset
    #[serde(default)]
    pub repeat: Option<u64>,

    #[serde(default)]
    pub label_match: MatchMode,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS)
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            topology: PathBuf::new(),
            master_labels: LabelSet::new(),
            backup_labels: LabelSet::new(),
            save: PathBuf::new(),
            interval: default_poll_interval(),
            timeout: default_query_timeout(),
            repeat: None,
            label_match: MatchMode::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Build the collector configuration from defaults, an optional YAML
    /// file, the environment and finally the CLI flags.
    pub fn load(args: &CollectArgs) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CollectorConfig::default()));

        if let Some(path) = args.config.as_deref() {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Yaml::file(path));
        }

        let mut config: CollectorConfig = figment
            .merge(env_provider())
            .merge(Serialized::defaults(args.clone()))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        // Selectors given on the command line replace the file's, figment would union them.
        if let Some(labels) = &args.master_labels {
            config.master_labels = labels.clone();
        }
        if let Some(labels) = &args.backup_labels {
            config.backup_labels = labels.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.as_os_str().is_empty() {
            return Err(ConfigError::missing_field("topology"));
        }
        if self.save.as_os_str().is_empty() {
            return Err(ConfigError::missing_field("save"));
        }
        if self.master_labels.is_empty() {
            return Err(ConfigError::invalid_value(
                "master-labels",
                "must name at least one label, an empty selector matches every store",
            ));
        }
        if self.backup_labels.is_empty() {
            return Err(ConfigError::invalid_value(
                "backup-labels",
                "must name at least one label, an empty selector matches every store",
            ));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::invalid_value("interval", "must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid_value("timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Config keys whose children are label names rather than settings.
const LABEL_MAP_KEYS: [&str; 3] = ["master-labels", "backup-labels", "zone-labels"];

/// `LEARNER_RECOVER_MASTER_LABELS__ZONE=east` sets `master-labels.zone`.
fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX)
        .split("__")
        .map(|key| env_key_to_config_path(key.as_str()).into())
}

/// Kebab-case setting names, keeping label names below a label map verbatim.
fn env_key_to_config_path(key: &str) -> String {
    let mut path = Vec::new();
    let mut in_labels = false;
    for segment in key.split('.') {
        if in_labels {
            path.push(segment.to_string());
            continue;
        }
        let setting = segment.replace('_', "-");
        in_labels = LABEL_MAP_KEYS.contains(&setting.as_str());
        path.push(setting);
    }
    path.join(".")
}

// ----------------------------------------------------------------------------
// 5.3 Recover Configuration
// ----------------------------------------------------------------------------

/// How phase-local failures are treated where tolerating them is a choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Staging, identity injection and restart failures abort the run
    #[default]
    Strict,
    /// Every tolerable failure is logged and recorded, and the run continues
    Permissive,
}

impl FailurePolicy {
    pub fn is_strict(&self) -> bool {
        matches!(self, FailurePolicy::Strict)
    }
}

/// A local binary and where it lands on each learner host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTransfer {
    pub src: PathBuf,
    pub dest: String,
}

/// Coordinator readiness polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReadinessConfig {
    /// Overall deadline, none waits until cancelled
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    #[serde(default = "default_probe_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,
}

fn default_probe_retry_interval() -> Duration {
    Duration::from_millis(DEFAULT_PROBE_RETRY_INTERVAL_MS)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS)
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            retry_interval: default_probe_retry_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// Settings for the failover orchestrator (`recover`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecoverConfig {
    pub cluster_name: String,
    pub cluster_version: String,

    /// Topology of the pre-disaster cluster, used to find learner stores
    pub old_topology: PathBuf,
    /// Topology the coordinator is redeployed from
    pub new_topology: PathBuf,
    /// Topology handed to the final scale-out
    pub join_topology: PathBuf,

    pub recover_info_file: PathBuf,

    /// Shorthand for `zone-labels: {zone: <name>}`
    #[serde(default)]
    pub recover_zone: Option<String>,

    #[serde(default)]
    pub zone_labels: LabelSet,

    pub tikv_ctl: ToolTransfer,
    pub pd_recover_path: PathBuf,

    #[serde(default = "default_tiup_path")]
    pub tiup_path: PathBuf,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub label_match: MatchMode,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_tiup_path() -> PathBuf {
    PathBuf::from(DEFAULT_TIUP_PATH)
}

impl RecoverConfig {
    /// Load configuration from a YAML file plus environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: RecoverConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(env_provider())
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse from a YAML string (for testing)
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: RecoverConfig = Figment::from(Yaml::string(yaml))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("cluster-name", self.cluster_name.as_str()),
            ("cluster-version", self.cluster_version.as_str()),
            ("tikv-ctl.dest", self.tikv_ctl.dest.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::missing_field(field));
            }
        }
        for (field, path) in [
            ("old-topology", &self.old_topology),
            ("new-topology", &self.new_topology),
            ("join-topology", &self.join_topology),
            ("recover-info-file", &self.recover_info_file),
            ("tikv-ctl.src", &self.tikv_ctl.src),
            ("pd-recover-path", &self.pd_recover_path),
            ("tiup-path", &self.tiup_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::missing_field(field));
            }
        }
        self.target_labels()?;
        if self.readiness.timeout.map_or(false, |t| t.is_zero()) {
            return Err(ConfigError::invalid_value(
                "readiness.timeout",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }

    /// Labels selecting the learner stores to recover.
    pub fn target_labels(&self) -> Result<LabelSet, ConfigError> {
        if !self.zone_labels.is_empty() {
            return Ok(self.zone_labels.clone());
        }
        match self.recover_zone.as_deref().map(str::trim) {
            Some(zone) if !zone.is_empty() => Ok(LabelSet::new().with("zone", zone)),
            _ => Err(ConfigError::missing_field("zone-labels or recover-zone")),
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING INITIALIZATION
// ============================================================================

/// Initialize the tracing subscriber based on configuration
pub fn init_logging(config: &LoggingConfig) -> RecoverResult<()> {
    let directive = match config.level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_target(true),
            )
            .try_init(),
        "compact" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
    };

    result.map_err(|e| RecoverError::Logging(e.to_string()))
}

// ============================================================================
// SECTION 7: METRICS & COORDINATOR CLIENTS
// ============================================================================
// HTTP access to the two read-only sources of recovery info:
// - PD store listing (`/pd/api/v1/stores`) for the primary zone's store IDs
// - Prometheus instant queries for cluster identity, allocator and lag
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Metrics Source Trait
// ----------------------------------------------------------------------------

/// Where a collection round reads its observations from.
///
/// `Ok(None)` means the source answered but had nothing to report.
#[async_trait]
pub trait MetricsSource: Send + Sync + Debug {
    /// IDs of stores whose labels satisfy `required`
    async fn store_ids(&self, required: &LabelSet) -> MetricsResult<Option<BTreeSet<u64>>>;

    /// Cluster ID from the coordinator's metadata metric
    async fn cluster_id(&self) -> MetricsResult<Option<String>>;

    /// Allocator checkpoint, already biased by [`ALLOC_ID_OFFSET`]
    async fn alloc_id(&self) -> MetricsResult<Option<u64>>;

    /// Replication lag for the given `host:status_port` instances
    async fn rpo_samples(&self, instances: &[String]) -> MetricsResult<Option<Vec<RpoSample>>>;
}

// ----------------------------------------------------------------------------
// 7.2 Wire Types
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StoresResponse {
    #[serde(default)]
    stores: Option<Vec<StoreEntry>>,
}

#[derive(Debug, Deserialize)]
struct StoreEntry {
    store: StoreMeta,
}

#[derive(Debug, Deserialize)]
struct StoreMeta {
    id: u64,
    #[serde(default)]
    labels: Option<Vec<StoreLabel>>,
}

#[derive(Debug, Deserialize)]
struct StoreLabel {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromData {
    #[serde(default)]
    result_type: String,
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Clone, Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// `[unix_ts, "value"]`
    value: (f64, String),
}

/// Parse a sample value as an integer, tolerating Prometheus' float
/// rendering (`"1.2e+03"`).
fn parse_sample_u64(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    raw.parse::<u64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0 && *v <= u64::MAX as f64)
            .map(|v| v as u64)
    })
}

// ----------------------------------------------------------------------------
// 7.3 HTTP Metrics Client
// ----------------------------------------------------------------------------

/// Reads recovery info from the coordinator API and Prometheus.
#[derive(Debug, Clone)]
pub struct MetricsClient {
    client: HttpClient,
    pd_address: String,
    prometheus_address: String,
    matcher: LabelMatcher,
}

impl MetricsClient {
    /// `pd_address` and `prometheus_address` are `host:port`.
    pub fn new(
        pd_address: impl Into<String>,
        prometheus_address: impl Into<String>,
        timeout: Duration,
        matcher: LabelMatcher,
    ) -> Self {
        let client = HttpClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .unwrap_or_default();

        Self {
            client,
            pd_address: pd_address.into(),
            prometheus_address: prometheus_address.into(),
            matcher,
        }
    }

    /// Client for the first PD and first monitoring server of a topology
    pub fn from_topology(topology: &Topology, timeout: Duration, matcher: LabelMatcher) -> RecoverResult<Self> {
        let pd = topology.first_pd()?;
        let monitor = topology.first_monitor()?;
        Ok(Self::new(pd.address(), monitor.address(), timeout, matcher))
    }

    pub fn pd_address(&self) -> &str {
        &self.pd_address
    }

    pub fn prometheus_address(&self) -> &str {
        &self.prometheus_address
    }

    /// Run an instant query and return the vector result.
    async fn instant_query(&self, query: &str) -> MetricsResult<Vec<PromSeries>> {
        let url = format!("http://{}{}", self.prometheus_address, PROMETHEUS_QUERY_PATH);

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| MetricsError::from_reqwest(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::HttpStatus {
                endpoint: url,
                status: status.as_u16(),
            });
        }

        let body: PromResponse = response
            .json()
            .await
            .map_err(|e| MetricsError::decode(&url, e.to_string()))?;

        if body.status != "success" {
            return Err(MetricsError::QueryFailed {
                query: query.to_string(),
                message: body.error.unwrap_or_else(|| body.status.clone()),
            });
        }

        let data = body.data.unwrap_or(PromData {
            result_type: String::new(),
            result: Vec::new(),
        });

        debug!(
            target: "learner_recover::metrics",
            query = %query,
            result_type = %data.result_type,
            series = data.result.len(),
            "Prometheus query answered"
        );

        Ok(data.result)
    }

    fn pd_instance_selector(&self, metric: &str) -> String {
        format!("{}{{instance=\"{}\"}}", metric, self.pd_address)
    }
}

#[async_trait]
impl MetricsSource for MetricsClient {
    async fn store_ids(&self, required: &LabelSet) -> MetricsResult<Option<BTreeSet<u64>>> {
        let url = format!("http://{}{}", self.pd_address, PD_STORES_PATH);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MetricsError::from_reqwest(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::HttpStatus {
                endpoint: url,
                status: status.as_u16(),
            });
        }

        let body: StoresResponse = response
            .json()
            .await
            .map_err(|e| MetricsError::decode(&url, e.to_string()))?;

        let ids: BTreeSet<u64> = body
            .stores
            .unwrap_or_default()
            .into_iter()
            .filter(|entry| {
                let labels: LabelSet = entry
                    .store
                    .labels
                    .iter()
                    .flatten()
                    .map(|l| (l.key.as_str(), l.value.as_str()))
                    .collect();
                self.matcher.matches(required, &labels)
            })
            .map(|entry| entry.store.id)
            .collect();

        Ok(Some(ids).filter(|ids| !ids.is_empty()))
    }

    async fn cluster_id(&self) -> MetricsResult<Option<String>> {
        let query = self.pd_instance_selector(CLUSTER_METADATA_METRIC);
        let series = self.instant_query(&query).await?;

        let Some(last) = series.last() else {
            return Ok(None);
        };

        let kind = last
            .metric
            .get("type")
            .ok_or_else(|| MetricsError::decode(&query, "series has no 'type' label"))?;

        let cluster_id = kind.strip_prefix(CLUSTER_ID_TYPE_PREFIX).ok_or_else(|| {
            MetricsError::decode(
                &query,
                format!("'type' label '{}' lacks the '{}' prefix", kind, CLUSTER_ID_TYPE_PREFIX),
            )
        })?;

        Ok(Some(cluster_id.to_string()).filter(|id| !id.is_empty()))
    }

    async fn alloc_id(&self) -> MetricsResult<Option<u64>> {
        let query = self.pd_instance_selector(ALLOC_ID_METRIC);
        let series = self.instant_query(&query).await?;

        let Some(last) = series.last() else {
            return Ok(None);
        };

        let raw = &last.value.1;
        let checkpoint = parse_sample_u64(raw)
            .ok_or_else(|| MetricsError::decode(&query, format!("'{}' is not an allocator value", raw)))?;

        checkpoint
            .checked_add(ALLOC_ID_OFFSET)
            .map(Some)
            .ok_or_else(|| MetricsError::decode(&query, format!("allocator value {} overflows", checkpoint)))
    }

    async fn rpo_samples(&self, instances: &[String]) -> MetricsResult<Option<Vec<RpoSample>>> {
        let series = self.instant_query(RPO_QUERY).await?;

        let samples: Vec<RpoSample> = series
            .into_iter()
            .filter_map(|s| {
                let instance = s.metric.get("instance")?;
                instances
                    .iter()
                    .any(|wanted| wanted == instance)
                    .then(|| RpoSample::new(instance.clone(), s.value.1.clone()))
            })
            .collect();

        Ok(Some(samples).filter(|s| !s.is_empty()))
    }
}

// ----------------------------------------------------------------------------
// 7.4 Coordinator Readiness Probe
// ----------------------------------------------------------------------------

/// Answers whether a coordinator is serving requests.
#[async_trait]
pub trait ReadinessProbe: Send + Sync + Debug {
    /// `Ok(())` once `endpoint` (`host:port`) serves its config API
    async fn probe(&self, endpoint: &str) -> MetricsResult<()>;
}

/// Probes `/pd/api/v1/config/replicate`.
#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    client: HttpClient,
}

impl HttpReadinessProbe {
    pub fn new(probe_timeout: Duration) -> Self {
        let client = HttpClient::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn probe(&self, endpoint: &str) -> MetricsResult<()> {
        let url = format!("http://{}{}", endpoint, PD_REPLICATE_CONFIG_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MetricsError::from_reqwest(&url, e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(MetricsError::HttpStatus {
                endpoint: url,
                status: response.status().as_u16(),
            })
        }
    }
}

/// Reports every coordinator as ready; used for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeReady;

#[async_trait]
impl ReadinessProbe for AssumeReady {
    async fn probe(&self, _endpoint: &str) -> MetricsResult<()> {
        Ok(())
    }
}

// ============================================================================
// SECTION 8: RECOVERY-INFO COLLECTION
// ============================================================================
// One collection round queries all four sources concurrently, each under
// its own timeout. Failures never abort the round: they downgrade to an
// absent field and a warning.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Collector
// ----------------------------------------------------------------------------

/// What a round asks the sources about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionTargets {
    /// Selector for the primary zone's stores
    pub master_labels: LabelSet,
    /// `host:status_port` of every learner store
    pub backup_instances: Vec<String>,
}

impl CollectionTargets {
    /// Resolve learner instances from the topology's `backup_labels` selection.
    pub fn from_topology(
        topology: &Topology,
        master_labels: LabelSet,
        backup_labels: &LabelSet,
        matcher: &LabelMatcher,
    ) -> Self {
        let backup_instances = topology
            .tikv_matching(backup_labels, matcher)
            .map(TikvServer::status_address)
            .collect();
        Self {
            master_labels,
            backup_instances,
        }
    }
}

#[derive(Debug)]
pub struct RecoverySnapshotCollector {
    source: Arc<dyn MetricsSource>,
    targets: CollectionTargets,
    query_timeout: Duration,
}

impl RecoverySnapshotCollector {
    pub fn new(source: Arc<dyn MetricsSource>, targets: CollectionTargets, query_timeout: Duration) -> Self {
        Self {
            source,
            targets,
            query_timeout,
        }
    }

    pub fn targets(&self) -> &CollectionTargets {
        &self.targets
    }

    /// Observe all four fields concurrently. Never fails.
    pub async fn collect_round(&self) -> PartialSnapshot {
        let (store_ids, cluster_id, alloc_id, rpos) = tokio::join!(
            self.observe(
                SnapshotField::StoreIds,
                self.source.store_ids(&self.targets.master_labels)
            ),
            self.observe(SnapshotField::ClusterId, self.source.cluster_id()),
            self.observe(SnapshotField::AllocId, self.source.alloc_id()),
            self.observe(
                SnapshotField::Rpos,
                self.source.rpo_samples(&self.targets.backup_instances)
            ),
        );

        PartialSnapshot {
            store_ids,
            cluster_id,
            alloc_id,
            rpos,
        }
    }

    async fn observe<T, F>(&self, field: SnapshotField, query: F) -> Option<T>
    where
        F: Future<Output = MetricsResult<Option<T>>>,
    {
        match timeout(self.query_timeout, query).await {
            Ok(Ok(Some(value))) => Some(value),
            Ok(Ok(None)) => {
                warn!(
                    target: "learner_recover::collector",
                    field = %field,
                    "Query returned no data, keeping previous value"
                );
                None
            }
            Ok(Err(e)) => {
                warn!(
                    target: "learner_recover::collector",
                    field = %field,
                    error = %e,
                    "Query failed, keeping previous value"
                );
                None
            }
            Err(_) => {
                warn!(
                    target: "learner_recover::collector",
                    field = %field,
                    timeout_ms = self.query_timeout.as_millis() as u64,
                    "Query timed out, keeping previous value"
                );
                None
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Snapshot Store
// ----------------------------------------------------------------------------

/// Durable JSON home of the recovery snapshot.
///
/// Saves go through a sibling temp file that is synced and renamed over the
/// target, so a reader never sees a partially written snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub fn load(&self) -> Result<Option<RecoverySnapshot>, SnapshotError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let snapshot: RecoverySnapshot =
            serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Decode {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        Ok(Some(snapshot.normalized()))
    }

    /// Atomically replace the stored snapshot. Placeholder values are
    /// written as absent, so `load` returns exactly `snapshot.normalized()`.
    pub fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), SnapshotError> {
        let snapshot = snapshot.clone().normalized();
        let data = serde_json::to_vec_pretty(&snapshot).map_err(|e| SnapshotError::Encode(e.to_string()))?;
        let write_err = |source: io::Error| SnapshotError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.parent_dir() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp).map_err(write_err)?;
            file.write_all(&data).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(write_err(e));
        }

        // The file is already in place, a failed directory sync only weakens durability.
        if let Some(parent) = self.parent_dir() {
            if let Err(e) = sync_dir(parent) {
                warn!(
                    target: "learner_recover::store",
                    dir = %parent.display(),
                    error = %e,
                    "Failed to sync snapshot directory, the rename may not survive a crash"
                );
            }
        }

        Ok(())
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "recover-info.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Persist a rename by syncing the containing directory.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// ----------------------------------------------------------------------------
// 8.3 Updater Loop
// ----------------------------------------------------------------------------

/// Outcome of one collection round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub round: u64,
    pub observed: Vec<SnapshotField>,
    pub updated: Vec<SnapshotField>,
    pub persisted: bool,
    pub finished_at: DateTime<Utc>,
}

/// Drives collection rounds and keeps the snapshot file current.
#[derive(Debug)]
pub struct RecoveryInfoUpdater {
    collector: RecoverySnapshotCollector,
    store: SnapshotStore,
    state: RecoverySnapshot,
    interval: Duration,
    repeat: Option<u64>,
    rounds: u64,
}

impl RecoveryInfoUpdater {
    /// `repeat` of `None` (or `Some(0)`) runs until cancelled.
    pub fn new(
        collector: RecoverySnapshotCollector,
        store: SnapshotStore,
        interval: Duration,
        repeat: Option<u64>,
    ) -> Self {
        Self {
            collector,
            store,
            state: RecoverySnapshot::default(),
            interval,
            repeat: repeat.filter(|n| *n > 0),
            rounds: 0,
        }
    }

    /// Seed in-memory state from the snapshot file, if any.
    pub fn init(&mut self) -> Result<(), SnapshotError> {
        match self.store.load()? {
            Some(snapshot) => {
                info!(
                    target: "learner_recover::updater",
                    path = %self.store.path().display(),
                    fields = %join_fields(&snapshot.present_fields()),
                    "Resuming from existing recovery snapshot"
                );
                self.state = snapshot;
            }
            None => {
                warn!(
                    target: "learner_recover::updater",
                    path = %self.store.path().display(),
                    "No recovery snapshot found, starting empty"
                );
                self.state = RecoverySnapshot::default();
            }
        }
        Ok(())
    }

    pub fn state(&self) -> &RecoverySnapshot {
        &self.state
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Collect, merge and persist once.
    ///
    /// A failed save leaves the in-memory state ahead of the file; the next
    /// round writes the whole state again.
    pub async fn run_round(&mut self) -> RoundReport {
        let observed = self.collector.collect_round().await;
        let merged = SnapshotMerger::merge(&self.state, &observed);
        let updated = SnapshotMerger::changed_fields(&self.state, &merged);
        self.state = merged;
        self.rounds += 1;

        let persisted = match self.store.save(&self.state) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    target: "learner_recover::updater",
                    round = self.rounds,
                    error = %e,
                    "Failed to persist recovery snapshot, will retry next round"
                );
                false
            }
        };

        let report = RoundReport {
            round: self.rounds,
            observed: observed.observed_fields(),
            updated,
            persisted,
            finished_at: Utc::now(),
        };

        info!(
            target: "learner_recover::updater",
            round = report.round,
            observed = %join_fields(&report.observed),
            updated = %join_fields(&report.updated),
            persisted = report.persisted,
            "Collection round complete"
        );

        report
    }

    /// Run rounds until the repeat budget is spent or `shutdown` fires.
    /// A round in progress always completes before the loop exits.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            target: "learner_recover::updater",
            interval_ms = self.interval.as_millis() as u64,
            repeat = ?self.repeat,
            save = %self.store.path().display(),
            "Starting recovery-info collection"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.run_round().await;

            if self.repeat.map_or(false, |limit| self.rounds >= limit) {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        info!(
            target: "learner_recover::updater",
            rounds = self.rounds,
            "Recovery-info collection stopped"
        );
    }
}

// ============================================================================
// SECTION 9: REMOTE EXECUTION
// ============================================================================
// Every side effect of a failover is an external command: scp/ssh to the
// learner hosts, tiup and pd-recover locally. Commands are plain values so
// the orchestrator can be driven by a recording runner in dry runs and tests.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Command Model
// ----------------------------------------------------------------------------

/// A program and its arguments, never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Remote-exec identity for one cluster: `user@host` over `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub port: u16,
}

impl SshTarget {
    pub fn from_global(global: &GlobalOptions) -> Self {
        Self {
            user: global.user.clone(),
            port: global.ssh_port,
        }
    }

    /// Run `remote` on `host`
    pub fn exec(&self, host: &str, remote: CommandSpec) -> CommandSpec {
        CommandSpec::new("ssh")
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, host))
            .arg(remote.program)
            .args(remote.args)
    }

    /// Copy a local file to `dest` on `host`
    pub fn copy_to(&self, host: &str, src: &Path, dest: &str) -> CommandSpec {
        CommandSpec::new("scp")
            .arg("-P")
            .arg(self.port.to_string())
            .arg(src.display().to_string())
            .arg(format!("{}@{}:{}", self.user, host, dest))
    }
}

// ----------------------------------------------------------------------------
// 9.2 Command Runners
// ----------------------------------------------------------------------------

#[async_trait]
pub trait CommandRunner: Send + Sync + Debug {
    /// Run to completion. A non-zero exit is an error carrying the output.
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RemoteError>;
}

/// Spawns real processes. Children are killed if the run is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RemoteError> {
        debug!(target: "learner_recover::exec", command = %command, "Executing");

        let output = Command::new(&command.program)
            .args(&command.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if output.status.success() {
            Ok(result)
        } else {
            let detail = if result.stderr.trim().is_empty() {
                result.stdout.trim()
            } else {
                result.stderr.trim()
            };
            Err(RemoteError::Failed {
                command: command.to_string(),
                status: result.status,
                output: detail.to_string(),
            })
        }
    }
}

/// Logs and records commands instead of running them.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    issued: Mutex<Vec<CommandSpec>>,
}

impl DryRunRunner {
    pub fn issued(&self) -> Vec<CommandSpec> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RemoteError> {
        info!(target: "learner_recover::exec", command = %command, "Dry run, not executing");
        self.issued.lock().push(command.clone());
        Ok(CommandOutput {
            status: Some(0),
            ..CommandOutput::default()
        })
    }
}

// ============================================================================
// SECTION 10: FAILOVER ORCHESTRATION
// ============================================================================
// The failover is a fixed sequence of phases:
//
//   Idle → Preparing → Stopped → Recovered → CoordinatorRebuilt
//        → ReplicationReady → LearnersJoined
//
// Per-node phases fan out to every learner and join before the next phase
// starts. Whether a failure aborts the run depends on the phase and the
// configured FailurePolicy; every tolerated failure lands in the report.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Phases & Reports
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Preparing,
    Stopped,
    Recovered,
    CoordinatorRebuilt,
    ReplicationReady,
    LearnersJoined,
}

impl Phase {
    /// Phases in execution order
    pub const SEQUENCE: [Phase; 6] = [
        Phase::Preparing,
        Phase::Stopped,
        Phase::Recovered,
        Phase::CoordinatorRebuilt,
        Phase::ReplicationReady,
        Phase::LearnersJoined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Stopped => "stopped",
            Phase::Recovered => "recovered",
            Phase::CoordinatorRebuilt => "coordinator-rebuilt",
            Phase::ReplicationReady => "replication-ready",
            Phase::LearnersJoined => "learners-joined",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tolerated failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Learner `host:port`, or the step name for cluster-wide steps
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub failures: Vec<StepFailure>,
    pub duration: Duration,
}

impl PhaseReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    fn record(&mut self, target: impl Into<String>, error: &dyn Display) {
        self.failures.push(StepFailure {
            target: target.into(),
            error: error.to_string(),
        });
    }
}

/// Phase that stopped a run and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedPhase {
    pub phase: Phase,
    pub error: String,
}

/// Outcome of a failover run, complete or not.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub run_id: Uuid,
    pub phases: Vec<PhaseReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when a phase aborted the run
    pub aborted: Option<AbortedPhase>,
}

impl RecoveryReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            phases: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            aborted: None,
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn completed_phases(&self) -> Vec<Phase> {
        self.phases.iter().map(|p| p.phase).collect()
    }

    /// Every tolerated failure across all phases
    pub fn failures(&self) -> impl Iterator<Item = (Phase, &StepFailure)> {
        self.phases
            .iter()
            .flat_map(|p| p.failures.iter().map(move |f| (p.phase, f)))
    }

    pub fn is_clean(&self) -> bool {
        self.aborted.is_none() && self.failures().next().is_none()
    }

    /// Nodes or steps that failed anywhere in the run, in phase order
    pub fn failed_targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::new();
        for (_, failure) in self.failures() {
            if !targets.contains(&failure.target.as_str()) {
                targets.push(failure.target.as_str());
            }
        }
        targets
    }

    pub fn log_summary(&self) {
        for (phase, failure) in self.failures() {
            warn!(
                target: "learner_recover::orchestrator",
                run_id = %self.run_id,
                phase = %phase,
                target_node = %failure.target,
                error = %failure.error,
                "Tolerated failure"
            );
        }
        match &self.aborted {
            Some(aborted) => error!(
                target: "learner_recover::orchestrator",
                run_id = %self.run_id,
                phases = self.phases.len(),
                failures = self.failures().count(),
                failed_targets = ?self.failed_targets(),
                aborted_in = %aborted.phase,
                error = %aborted.error,
                "Recovery aborted"
            ),
            None => info!(
                target: "learner_recover::orchestrator",
                run_id = %self.run_id,
                phases = self.phases.len(),
                failures = self.failures().count(),
                failed_targets = ?self.failed_targets(),
                "Recovery finished"
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// 10.2 Recovery Plan
// ----------------------------------------------------------------------------

/// A learner store the failover operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupNode {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
}

impl BackupNode {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// systemd unit managing this store
    pub fn service_name(&self) -> String {
        format!("tikv-{}.service", self.port)
    }
}

/// Everything a failover run needs, resolved before any side effect.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub cluster_name: String,
    pub cluster_version: String,
    pub ssh: SshTarget,
    pub nodes: Vec<BackupNode>,
    pub snapshot: ValidatedSnapshot,
    /// `host:client_port` of the first PD in the new topology
    pub coordinator: String,
    pub new_topology: PathBuf,
    pub join_topology: PathBuf,
    pub tikv_ctl: ToolTransfer,
    pub pd_recover_path: PathBuf,
    pub tiup_path: PathBuf,
    pub policy: FailurePolicy,
    pub readiness: ReadinessConfig,
}

impl RecoveryPlan {
    /// Load the snapshot and topologies named in `config`. The snapshot is
    /// validated first so an incomplete one fails before anything else.
    pub fn from_config(config: &RecoverConfig) -> RecoverResult<Self> {
        let store = SnapshotStore::new(&config.recover_info_file);
        let snapshot = store.load()?.ok_or_else(|| SnapshotError::Read {
            path: config.recover_info_file.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no recovery snapshot has been written"),
        })?;
        let snapshot = validate_snapshot(&snapshot)?;

        let old_topology = Topology::load(&config.old_topology)?;
        let new_topology = Topology::load(&config.new_topology)?;

        Self::build(config, &old_topology, &new_topology, snapshot)
    }

    pub fn build(
        config: &RecoverConfig,
        old_topology: &Topology,
        new_topology: &Topology,
        snapshot: ValidatedSnapshot,
    ) -> RecoverResult<Self> {
        let labels = config.target_labels()?;
        let matcher = LabelMatcher::new(config.label_match);

        let nodes = old_topology
            .tikv_matching(&labels, &matcher)
            .map(|server| {
                let data_dir = server.resolved_data_dir().ok_or_else(|| TopologyError::MissingDataDir {
                    address: server.address(),
                })?;
                Ok(BackupNode {
                    host: server.host.clone(),
                    port: server.port,
                    data_dir,
                })
            })
            .collect::<Result<Vec<_>, TopologyError>>()?;

        if nodes.is_empty() {
            return Err(TopologyError::NoMatchingStores {
                labels: labels.to_string(),
            }
            .into());
        }

        let coordinator = new_topology.first_pd()?.address();

        Ok(Self {
            cluster_name: config.cluster_name.clone(),
            cluster_version: config.cluster_version.clone(),
            ssh: SshTarget::from_global(&old_topology.global),
            nodes,
            snapshot,
            coordinator,
            new_topology: config.new_topology.clone(),
            join_topology: config.join_topology.clone(),
            tikv_ctl: config.tikv_ctl.clone(),
            pd_recover_path: config.pd_recover_path.clone(),
            tiup_path: config.tiup_path.clone(),
            policy: config.failure_policy,
            readiness: config.readiness.clone(),
        })
    }

    // Commands, in the order the phases issue them.

    pub fn stage_tool_command(&self, node: &BackupNode) -> CommandSpec {
        self.ssh.copy_to(&node.host, &self.tikv_ctl.src, &self.tikv_ctl.dest)
    }

    pub fn stop_command(&self, node: &BackupNode) -> CommandSpec {
        self.ssh.exec(
            &node.host,
            CommandSpec::new("sudo").args(["systemctl", "stop", node.service_name().as_str()]),
        )
    }

    pub fn unsafe_recover_command(&self, node: &BackupNode) -> CommandSpec {
        self.ssh.exec(
            &node.host,
            CommandSpec::new(self.tikv_ctl.dest.as_str())
                .arg("--data-dir")
                .arg(node.data_dir.as_str())
                .args(["unsafe-recover", "remove-fail-stores", "-s"])
                .arg(self.snapshot.failed_stores_arg())
                .args(["--all-regions", "--promote-learner"]),
        )
    }

    fn tiup_cluster(&self, action: &str) -> CommandSpec {
        CommandSpec::new(self.tiup_path.display().to_string())
            .args(["cluster", action, "-y"])
            .arg(self.cluster_name.as_str())
    }

    pub fn deploy_command(&self) -> CommandSpec {
        self.tiup_cluster("deploy")
            .arg(self.cluster_version.as_str())
            .arg(self.new_topology.display().to_string())
    }

    pub fn start_command(&self) -> CommandSpec {
        self.tiup_cluster("start")
    }

    pub fn inject_identity_command(&self) -> CommandSpec {
        CommandSpec::new(self.pd_recover_path.display().to_string())
            .arg("-endpoints")
            .arg(format!("http://{}", self.coordinator))
            .arg("-cluster-id")
            .arg(self.snapshot.cluster_id.as_str())
            .arg("-alloc-id")
            .arg(self.snapshot.alloc_id.to_string())
    }

    pub fn restart_command(&self) -> CommandSpec {
        self.tiup_cluster("restart")
    }

    pub fn scale_out_command(&self) -> CommandSpec {
        self.tiup_cluster("scale-out")
            .arg(self.join_topology.display().to_string())
    }
}

// ----------------------------------------------------------------------------
// 10.3 Orchestrator
// ----------------------------------------------------------------------------

struct NodeOutcome {
    node: String,
    result: Result<CommandOutput, RemoteError>,
}

/// Runs a [`RecoveryPlan`] phase by phase.
#[derive(Debug)]
pub struct RecoveryOrchestrator {
    plan: RecoveryPlan,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ReadinessProbe>,
    cancel: CancellationToken,
    phase: Phase,
    report: Option<RecoveryReport>,
}

impl RecoveryOrchestrator {
    pub fn new(plan: RecoveryPlan, runner: Arc<dyn CommandRunner>, probe: Arc<dyn ReadinessProbe>) -> Self {
        Self {
            plan,
            runner,
            probe,
            cancel: CancellationToken::new(),
            phase: Phase::Idle,
            report: None,
        }
    }

    /// Abort the run (between steps, or while waiting) when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Last phase that completed
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn plan(&self) -> &RecoveryPlan {
        &self.plan
    }

    /// Report of the last run, kept when a phase aborted it too.
    pub fn report(&self) -> Option<&RecoveryReport> {
        self.report.as_ref()
    }

    /// Execute every phase in order.
    pub async fn run(&mut self) -> RecoverResult<RecoveryReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "recovery",
            run_id = %run_id,
            cluster = %self.plan.cluster_name
        );
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&mut self, run_id: Uuid) -> RecoverResult<RecoveryReport> {
        let mut report = RecoveryReport::new(run_id);
        let result = self.execute_phases(&mut report).await;
        report.finished_at = Some(Utc::now());

        if let Err(e) = &result {
            report.aborted = Some(AbortedPhase {
                phase: e.phase().unwrap_or(self.phase),
                error: e.to_string(),
            });
        }
        self.report = Some(report.clone());
        result.map(|()| report)
    }

    async fn execute_phases(&mut self, report: &mut RecoveryReport) -> RecoverResult<()> {
        info!(
            target: "learner_recover::orchestrator",
            nodes = self.plan.nodes.len(),
            failed_stores = %self.plan.snapshot.failed_stores_arg(),
            coordinator = %self.plan.coordinator,
            policy = ?self.plan.policy,
            "Starting learner failover"
        );

        for phase in Phase::SEQUENCE {
            if self.cancel.is_cancelled() {
                return Err(RecoverError::Cancelled { phase });
            }

            info!(target: "learner_recover::orchestrator", phase = %phase, "Entering phase");
            let started = Instant::now();

            let mut phase_report = self.run_phase(phase).await.map_err(|e| {
                error!(
                    target: "learner_recover::orchestrator",
                    phase = %phase,
                    error = %e,
                    "Phase failed, aborting"
                );
                e.in_phase(phase)
            })?;

            phase_report.duration = started.elapsed();
            self.phase = phase;
            report.phases.push(phase_report);
        }

        Ok(())
    }

    async fn run_phase(&self, phase: Phase) -> RecoverResult<PhaseReport> {
        match phase {
            Phase::Idle => Ok(PhaseReport::new(Phase::Idle)),
            Phase::Preparing => self.prepare().await,
            Phase::Stopped => self.stop_stores().await,
            Phase::Recovered => self.remove_failed_stores().await,
            Phase::CoordinatorRebuilt => self.rebuild_coordinator().await,
            Phase::ReplicationReady => self.wait_until_ready().await,
            Phase::LearnersJoined => self.join_learners().await,
        }
    }

    /// Run one command per node concurrently and wait for all of them.
    async fn fan_out<F>(&self, phase: Phase, build: F) -> RecoverResult<Vec<NodeOutcome>>
    where
        F: Fn(&BackupNode) -> CommandSpec,
    {
        let runs = self.plan.nodes.iter().map(|node| {
            let command = build(node);
            let runner = Arc::clone(&self.runner);
            let address = node.address();
            async move {
                let result = runner.run(&command).await;
                NodeOutcome { node: address, result }
            }
        });

        tokio::select! {
            outcomes = join_all(runs) => Ok(outcomes),
            _ = self.cancel.cancelled() => Err(RecoverError::Cancelled { phase }),
        }
    }

    async fn run_step(&self, phase: Phase, command: &CommandSpec) -> RecoverResult<Result<CommandOutput, RemoteError>> {
        tokio::select! {
            result = self.runner.run(command) => Ok(result),
            _ = self.cancel.cancelled() => Err(RecoverError::Cancelled { phase }),
        }
    }

    /// Stage tikv-ctl on every learner. A node without the tool cannot be
    /// repaired, so strict runs stop here.
    async fn prepare(&self) -> RecoverResult<PhaseReport> {
        let phase = Phase::Preparing;
        let mut report = PhaseReport::new(phase);
        let mut first_error = None;

        for outcome in self.fan_out(phase, |node| self.plan.stage_tool_command(node)).await? {
            match outcome.result {
                Ok(_) => debug!(
                    target: "learner_recover::orchestrator",
                    node = %outcome.node,
                    "Recovery tool staged"
                ),
                Err(e) => {
                    warn!(
                        target: "learner_recover::orchestrator",
                        node = %outcome.node,
                        error = %e,
                        "Failed to stage recovery tool"
                    );
                    report.record(outcome.node, &e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if self.plan.policy.is_strict() => Err(e.into()),
            _ => Ok(report),
        }
    }

    /// Stop every learner store. Best effort: a store that is already down
    /// is the common case.
    async fn stop_stores(&self) -> RecoverResult<PhaseReport> {
        let phase = Phase::Stopped;
        let mut report = PhaseReport::new(phase);

        for outcome in self.fan_out(phase, |node| self.plan.stop_command(node)).await? {
            if let Err(e) = outcome.result {
                warn!(
                    target: "learner_recover::orchestrator",
                    node = %outcome.node,
                    error = %e,
                    "Failed to stop store, continuing"
                );
                report.record(outcome.node, &e);
            }
        }

        Ok(report)
    }

    /// Remove the failed stores from every learner's region metadata and
    /// promote learner peers to voters.
    async fn remove_failed_stores(&self) -> RecoverResult<PhaseReport> {
        let phase = Phase::Recovered;
        let mut report = PhaseReport::new(phase);

        for outcome in self
            .fan_out(phase, |node| self.plan.unsafe_recover_command(node))
            .await?
        {
            match outcome.result {
                Ok(_) => info!(
                    target: "learner_recover::orchestrator",
                    node = %outcome.node,
                    "Failed stores removed"
                ),
                Err(e) => {
                    warn!(
                        target: "learner_recover::orchestrator",
                        node = %outcome.node,
                        error = %e,
                        "Unsafe recover failed on node"
                    );
                    report.record(outcome.node, &e);
                }
            }
        }

        Ok(report)
    }

    /// Redeploy PD from the new topology, inject the recovered identity
    /// and restart it.
    async fn rebuild_coordinator(&self) -> RecoverResult<PhaseReport> {
        let phase = Phase::CoordinatorRebuilt;
        let mut report = PhaseReport::new(phase);

        // Deploy and start may complain about components that already
        // exist. Later steps surface a coordinator that really is missing.
        for (step, command) in [
            ("deploy", self.plan.deploy_command()),
            ("start", self.plan.start_command()),
        ] {
            if let Err(e) = self.run_step(phase, &command).await? {
                warn!(
                    target: "learner_recover::orchestrator",
                    step,
                    error = %e,
                    "Coordinator step failed, continuing"
                );
                report.record(step, &e);
            }
        }

        for (step, command) in [
            ("inject-identity", self.plan.inject_identity_command()),
            ("restart", self.plan.restart_command()),
        ] {
            match self.run_step(phase, &command).await? {
                Ok(_) => info!(target: "learner_recover::orchestrator", step, "Coordinator step complete"),
                Err(e) if self.plan.policy.is_strict() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        target: "learner_recover::orchestrator",
                        step,
                        error = %e,
                        "Coordinator step failed, continuing under permissive policy"
                    );
                    report.record(step, &e);
                }
            }
        }

        Ok(report)
    }

    /// Poll the coordinator until it serves, the deadline passes, or the
    /// run is cancelled.
    async fn wait_until_ready(&self) -> RecoverResult<PhaseReport> {
        let phase = Phase::ReplicationReady;
        let endpoint = self.plan.coordinator.as_str();
        let readiness = &self.plan.readiness;
        let started = Instant::now();
        let mut attempts: u64 = 0;

        info!(
            target: "learner_recover::orchestrator",
            endpoint,
            timeout = ?readiness.timeout,
            "Waiting for coordinator to serve"
        );

        loop {
            attempts += 1;

            let attempt = timeout(readiness.probe_timeout, self.probe.probe(endpoint));
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RecoverError::Cancelled { phase }),
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(Ok(())) => {
                    info!(
                        target: "learner_recover::orchestrator",
                        endpoint,
                        attempts,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Coordinator is serving"
                    );
                    return Ok(PhaseReport::new(phase));
                }
                Ok(Err(e)) => debug!(
                    target: "learner_recover::orchestrator",
                    attempts,
                    error = %e,
                    "Coordinator not ready"
                ),
                Err(_) => debug!(
                    target: "learner_recover::orchestrator",
                    attempts,
                    "Readiness probe timed out"
                ),
            }

            if let Some(limit) = readiness.timeout {
                if started.elapsed() >= limit {
                    return Err(RecoverError::ReadinessTimeout {
                        endpoint: endpoint.to_string(),
                        waited: started.elapsed(),
                    });
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RecoverError::Cancelled { phase }),
                _ = sleep(readiness.retry_interval) => {}
            }
        }
    }

    /// Scale the repaired learners into the rebuilt cluster. Any failure
    /// here leaves the cluster unusable and aborts the run.
    async fn join_learners(&self) -> RecoverResult<PhaseReport> {
        let phase = Phase::LearnersJoined;
        self.run_step(phase, &self.plan.scale_out_command()).await??;
        info!(target: "learner_recover::orchestrator", "Learners joined the rebuilt cluster");
        Ok(PhaseReport::new(phase))
    }
}

// ============================================================================
// SECTION 11: CLI & MAIN ENTRY POINT
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Command Line Interface
// ----------------------------------------------------------------------------

/// Learner-zone disaster recovery for PD/TiKV clusters
#[derive(Parser, Debug)]
#[command(
    name = "learner-recover",
    author = "AIOps Team",
    version,
    about = "Recovery-info collection and learner-zone failover for PD/TiKV",
    long_about = "Collects the primary zone's store IDs, cluster identity, allocator checkpoint \
                  and learner replication lag into a durable snapshot, and uses that snapshot \
                  to fail over to the learner zone when the primary is lost."
)]
pub struct Cli {
    /// Override the configured log level
    #[arg(short = 'l', long, global = true)]
    pub log_level: Option<String>,

    /// Override the configured log format (json, pretty, compact)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Keep the recovery snapshot current
    Collect(CollectArgs),

    /// Fail over to the learner zone
    Recover {
        /// Recover configuration file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Log the commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Show a recovery snapshot and whether it is complete
    Inspect {
        /// Snapshot file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show version information
    Version,
}

/// `collect` flags. Every flag overrides the configuration file and the
/// environment.
#[derive(Args, Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CollectArgs {
    /// Collector configuration file (YAML)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Topology file of the running cluster
    #[arg(short = 't', long = "topo", visible_alias = "topology")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<PathBuf>,

    /// Primary-zone selector, e.g. `zone=east`
    #[arg(short = 'm', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_labels: Option<LabelSet>,

    /// Learner selector, e.g. `zone=west`
    #[arg(short = 'b', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_labels: Option<LabelSet>,

    /// Snapshot file to maintain
    #[arg(short = 's', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save: Option<PathBuf>,

    /// Delay between rounds, e.g. `1s`
    #[arg(short = 'i', long, value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,

    /// Bound on each query, e.g. `5s`
    #[arg(long, value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Stop after this many rounds
    #[arg(short = 'r', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u64>,

    /// Label matching mode
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_match: Option<MatchMode>,
}

// ----------------------------------------------------------------------------
// 11.2 Command Handlers
// ----------------------------------------------------------------------------

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(target: "learner_recover", error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(target: "learner_recover", error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!(target: "learner_recover", "Received Ctrl+C, shutting down"),
            _ = terminate => info!(target: "learner_recover", "Received SIGTERM, shutting down"),
        }

        token.cancel();
    });
}

async fn handle_collect(args: CollectArgs, cli_level: Option<&str>, cli_format: Option<&str>) -> AnyhowResult<()> {
    let config = CollectorConfig::load(&args).context("Failed to load collector configuration")?;
    init_logging(&config.logging.clone().with_overrides(cli_level, cli_format))?;

    let topology = Topology::load(&config.topology)?;
    let matcher = LabelMatcher::new(config.label_match);
    let client = MetricsClient::from_topology(&topology, config.timeout, matcher)?;

    let targets = CollectionTargets::from_topology(
        &topology,
        config.master_labels.clone(),
        &config.backup_labels,
        &matcher,
    );
    if targets.backup_instances.is_empty() {
        warn!(
            target: "learner_recover",
            labels = %config.backup_labels,
            "No TiKV nodes match the backup labels, replication lag will not be collected"
        );
    }

    info!(
        target: "learner_recover",
        pd = %client.pd_address(),
        prometheus = %client.prometheus_address(),
        master_labels = %config.master_labels,
        backup_instances = targets.backup_instances.len(),
        "Collector configured"
    );

    let collector = RecoverySnapshotCollector::new(Arc::new(client), targets, config.timeout);
    let mut updater = RecoveryInfoUpdater::new(
        collector,
        SnapshotStore::new(&config.save),
        config.interval,
        config.repeat,
    );
    updater.init()?;

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());
    updater.run(shutdown).await;

    Ok(())
}

async fn handle_recover(
    path: &Path,
    dry_run: bool,
    cli_level: Option<&str>,
    cli_format: Option<&str>,
) -> AnyhowResult<()> {
    let config = RecoverConfig::load(path).context("Failed to load recover configuration")?;
    init_logging(&config.logging.clone().with_overrides(cli_level, cli_format))?;

    let plan = RecoveryPlan::from_config(&config)?;

    let (runner, probe): (Arc<dyn CommandRunner>, Arc<dyn ReadinessProbe>) = if dry_run {
        (Arc::new(DryRunRunner::default()), Arc::new(AssumeReady))
    } else {
        (
            Arc::new(ProcessRunner),
            Arc::new(HttpReadinessProbe::new(plan.readiness.probe_timeout)),
        )
    };

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let mut orchestrator = RecoveryOrchestrator::new(plan, runner, probe).with_cancellation(cancel);
    let result = orchestrator.run().await;
    if let Some(report) = orchestrator.report() {
        report.log_summary();
    }
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(
                target: "learner_recover",
                category = e.category(),
                last_completed = %orchestrator.phase(),
                error = %e,
                "Recover command failed"
            );
            Err(e.into())
        }
    }
}

fn handle_inspect(path: &Path) -> AnyhowResult<()> {
    let store = SnapshotStore::new(path);
    let snapshot = store
        .load()?
        .with_context(|| format!("No recovery snapshot at {}", path.display()))?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!();

    match validate_snapshot(&snapshot) {
        Ok(valid) => println!(
            "✅ Snapshot is complete: {} failed store(s), cluster {}, alloc id {}",
            valid.store_ids.len(),
            valid.cluster_id,
            valid.alloc_id
        ),
        Err(e) => println!("❌ {}", e),
    }

    match snapshot.worst_rpo() {
        Some((sample, lag)) => println!("   Worst replication lag: {:.3}s on {}", lag, sample.node),
        None => println!("   No replication lag recorded"),
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", TOOL_FULL_NAME, TOOL_VERSION);
    println!("Binary: {}", TOOL_NAME);
    println!("Components:");
    println!("  - Recovery-info collector (PD API + Prometheus)");
    println!("  - Learner failover orchestrator (ssh / scp / tiup)");
}

// ----------------------------------------------------------------------------
// 11.3 Main Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();
    let level = cli.log_level.as_deref();
    let format = cli.log_format.as_deref();

    match cli.command {
        Commands::Collect(args) => handle_collect(args, level, format).await,
        Commands::Recover { config, dry_run } => handle_recover(&config, dry_run, level, format).await,
        Commands::Inspect { file } => handle_inspect(&file),
        Commands::Version => {
            handle_version();
            Ok(())
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().copied().collect()
    }

    fn full_snapshot() -> RecoverySnapshot {
        RecoverySnapshot {
            store_ids: Some(BTreeSet::from([1, 2])),
            cluster_id: Some("X".into()),
            alloc_id: Some(100),
            rpos: Some(vec![RpoSample::new("10.0.2.21:20180", "0.5")]),
        }
    }

    // ------------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------------

    #[test]
    fn test_subset_match_ignores_extra_candidate_labels() {
        let required = labels(&[("zone", "east")]);
        let candidate = labels(&[("zone", "east"), ("host", "h1")]);
        assert!(labels_match(&required, &candidate));
        assert!(!labels_match(&candidate, &required));
    }

    #[test]
    fn test_subset_match_requires_equal_values() {
        let required = labels(&[("zone", "east")]);
        assert!(!labels_match(&required, &labels(&[("zone", "west")])));
        assert!(!labels_match(&required, &LabelSet::new()));
    }

    #[test]
    fn test_empty_requirement_matches_everything() {
        assert!(labels_match(&LabelSet::new(), &labels(&[("zone", "east")])));
        assert!(labels_match(&LabelSet::new(), &LabelSet::new()));
    }

    #[test]
    fn test_exact_matcher_rejects_extra_labels() {
        let matcher = LabelMatcher::new(MatchMode::Exact);
        let required = labels(&[("zone", "east")]);
        assert!(matcher.matches(&required, &labels(&[("zone", "east")])));
        assert!(!matcher.matches(&required, &labels(&[("zone", "east"), ("host", "h1")])));
    }

    #[test_case("zone=east", 1 ; "single pair")]
    #[test_case("zone=east,host=h1", 2 ; "two pairs")]
    #[test_case(" zone = east , host=h1 ,", 2 ; "whitespace and trailing comma")]
    #[test_case("", 0 ; "empty selector")]
    fn test_label_selector_parses(input: &str, expected_len: usize) {
        let parsed: LabelSet = input.parse().unwrap();
        assert_eq!(parsed.len(), expected_len);
    }

    #[test_case("zone" ; "missing equals sign")]
    #[test_case("=east" ; "empty key")]
    #[test_case("zone=east,zone=west" ; "duplicate key")]
    fn test_label_selector_rejects(input: &str) {
        assert!(matches!(
            input.parse::<LabelSet>(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_label_set_display_is_sorted() {
        let set = labels(&[("zone", "east"), ("host", "h1")]);
        assert_eq!(set.to_string(), "host=h1,zone=east");
        assert_eq!(set.to_string().parse::<LabelSet>().unwrap(), set);
    }

    // ------------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------------

    #[test]
    fn test_merge_keeps_previous_values_for_unobserved_fields() {
        let observed = PartialSnapshot {
            cluster_id: Some("Y".into()),
            ..Default::default()
        };

        let merged = SnapshotMerger::merge(&full_snapshot(), &observed);

        assert_eq!(
            merged,
            RecoverySnapshot {
                cluster_id: Some("Y".into()),
                ..full_snapshot()
            }
        );
        assert_eq!(
            SnapshotMerger::changed_fields(&full_snapshot(), &merged),
            vec![SnapshotField::ClusterId]
        );
    }

    #[test]
    fn test_merge_treats_empty_observations_as_failures() {
        let observed = PartialSnapshot {
            store_ids: Some(BTreeSet::new()),
            cluster_id: Some(String::new()),
            alloc_id: None,
            rpos: Some(Vec::new()),
        };

        assert!(observed.is_empty());
        assert_eq!(SnapshotMerger::merge(&full_snapshot(), &observed), full_snapshot());
    }

    #[test]
    fn test_merge_replaces_every_observed_field() {
        let observed = PartialSnapshot {
            store_ids: Some(BTreeSet::from([3])),
            cluster_id: Some("Z".into()),
            alloc_id: Some(200),
            rpos: Some(vec![RpoSample::new("10.0.2.22:20180", "1.5")]),
        };

        let merged = SnapshotMerger::merge(&full_snapshot(), &observed);

        assert_eq!(merged.store_ids, Some(BTreeSet::from([3])));
        assert_eq!(merged.alloc_id, Some(200));
        assert_eq!(
            SnapshotMerger::changed_fields(&full_snapshot(), &merged),
            SnapshotField::ALL.to_vec()
        );
    }

    #[test]
    fn test_merge_scenario_only_rpos_observed() {
        let previous = RecoverySnapshot {
            store_ids: Some(BTreeSet::from([1, 2])),
            cluster_id: Some("abc".into()),
            alloc_id: Some(5_000_000_000),
            rpos: Some(Vec::new()),
        };
        let observed = PartialSnapshot {
            rpos: Some(vec![RpoSample::new("10.0.0.1:20180", "3.2")]),
            ..Default::default()
        };

        let merged = SnapshotMerger::merge(&previous, &observed);

        assert_eq!(
            merged,
            RecoverySnapshot {
                store_ids: Some(BTreeSet::from([1, 2])),
                cluster_id: Some("abc".into()),
                alloc_id: Some(5_000_000_000),
                rpos: Some(vec![RpoSample::new("10.0.0.1:20180", "3.2")]),
            }
        );
    }

    #[test]
    fn test_merge_into_empty_snapshot() {
        let observed = PartialSnapshot {
            alloc_id: Some(7),
            ..Default::default()
        };
        let merged = SnapshotMerger::merge(&RecoverySnapshot::default(), &observed);
        assert_eq!(merged.present_fields(), vec![SnapshotField::AllocId]);
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    #[test]
    fn test_validate_complete_snapshot() {
        let valid = validate_snapshot(&full_snapshot()).unwrap();
        assert_eq!(valid.failed_stores_arg(), "1,2");
        assert_eq!(valid.cluster_id, "X");
        assert_eq!(valid.alloc_id, 100);
    }

    #[test]
    fn test_validate_ignores_missing_rpos() {
        let snapshot = RecoverySnapshot {
            rpos: None,
            ..full_snapshot()
        };
        assert!(validate_snapshot(&snapshot).unwrap().rpos.is_empty());
    }

    #[test_case(RecoverySnapshot::default(), vec![SnapshotField::StoreIds, SnapshotField::ClusterId, SnapshotField::AllocId] ; "empty snapshot")]
    #[test_case(RecoverySnapshot { store_ids: Some(BTreeSet::new()), ..full_snapshot() }, vec![SnapshotField::StoreIds] ; "empty store set")]
    #[test_case(RecoverySnapshot { cluster_id: None, ..full_snapshot() }, vec![SnapshotField::ClusterId] ; "no cluster id")]
    #[test_case(RecoverySnapshot { cluster_id: Some(String::new()), alloc_id: None, ..full_snapshot() }, vec![SnapshotField::ClusterId, SnapshotField::AllocId] ; "blank cluster id and no alloc id")]
    fn test_validate_names_every_missing_field(snapshot: RecoverySnapshot, expected: Vec<SnapshotField>) {
        let err = validate_snapshot(&snapshot).unwrap_err();
        assert_eq!(err.missing_fields(), expected.as_slice());
        for field in &expected {
            assert!(err.to_string().contains(field.as_str()));
        }
    }

    // ------------------------------------------------------------------------
    // Snapshot serialization
    // ------------------------------------------------------------------------

    #[test]
    fn test_snapshot_json_omits_absent_fields() {
        let snapshot = RecoverySnapshot {
            alloc_id: Some(4294967396),
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"allocId":4294967396}"#);

        let back: RecoverySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_snapshot_accepts_legacy_keys_and_unknown_fields() {
        let json = r#"{
            "storeIDs": [4, 1],
            "clusterID": "6982930532178542421",
            "allocID": 4294968296,
            "rpos": [{"instance": "10.0.2.21:20180", "value": "0.25"}],
            "collectedBy": "somebody"
        }"#;

        let snapshot: RecoverySnapshot = serde_json::from_str(json).unwrap();

        assert_eq!(snapshot.store_ids, Some(BTreeSet::from([1, 4])));
        assert_eq!(snapshot.cluster_id.as_deref(), Some("6982930532178542421"));
        assert_eq!(snapshot.rpos.unwrap()[0].node, "10.0.2.21:20180");
    }

    #[test]
    fn test_normalized_drops_placeholder_values() {
        let snapshot = RecoverySnapshot {
            store_ids: Some(BTreeSet::new()),
            cluster_id: Some(String::new()),
            alloc_id: Some(0),
            rpos: Some(Vec::new()),
        };
        assert_eq!(snapshot.normalized(), RecoverySnapshot::default());
    }

    #[test]
    fn test_worst_rpo_picks_largest_numeric_lag() {
        let snapshot = RecoverySnapshot {
            rpos: Some(vec![
                RpoSample::new("a:20180", "0.5"),
                RpoSample::new("b:20180", "NaN"),
                RpoSample::new("c:20180", "12.25"),
                RpoSample::new("d:20180", "bogus"),
            ]),
            ..Default::default()
        };

        let (sample, lag) = snapshot.worst_rpo().unwrap();
        assert_eq!(sample.node, "c:20180");
        assert_eq!(lag, 12.25);
        assert!(RecoverySnapshot::default().worst_rpo().is_none());
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    fn arb_labels(min: usize) -> impl Strategy<Value = LabelSet> {
        proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", min..5)
            .prop_map(|map| map.into_iter().collect::<LabelSet>())
    }

    fn arb_snapshot() -> impl Strategy<Value = RecoverySnapshot> {
        let rpos = proptest::collection::vec(("[a-z0-9.]{1,10}:[0-9]{4,5}", "[0-9]{1,3}\\.[0-9]{1,2}"), 0..4)
            .prop_map(|pairs| {
                pairs
                    .into_iter()
                    .map(|(node, value)| RpoSample { node, value })
                    .collect::<Vec<_>>()
            });

        (
            proptest::option::of(proptest::collection::btree_set(any::<u64>(), 0..6)),
            proptest::option::of("[a-z0-9]{0,10}"),
            proptest::option::of(any::<u64>()),
            proptest::option::of(rpos),
        )
            .prop_map(|(store_ids, cluster_id, alloc_id, rpos)| RecoverySnapshot {
                store_ids,
                cluster_id,
                alloc_id,
                rpos,
            })
    }

    proptest! {
        #[test]
        fn prop_subset_match_holds_for_supersets(required in arb_labels(0), extra in arb_labels(0)) {
            let mut candidate = extra;
            for (key, value) in required.iter() {
                candidate.insert(key, value);
            }
            prop_assert!(labels_match(&required, &candidate));
        }

        #[test]
        fn prop_missing_required_key_never_matches(required in arb_labels(1)) {
            let candidate: LabelSet = required.iter().skip(1).collect();
            prop_assert!(!labels_match(&required, &candidate));
        }

        #[test]
        fn prop_store_round_trip_is_exact(snapshot in arb_snapshot()) {
            let dir = tempfile::tempdir().unwrap();
            let store = SnapshotStore::new(dir.path().join("recover-info.json"));
            let expected = snapshot.clone().normalized();

            store.save(&snapshot).unwrap();
            prop_assert_eq!(store.load().unwrap(), Some(expected.clone()));

            store.save(&expected).unwrap();
            prop_assert_eq!(store.load().unwrap(), Some(expected));
        }

        #[test]
        fn prop_merge_is_idempotent(previous in arb_snapshot(), observed in arb_snapshot()) {
            let observed = PartialSnapshot::from(observed);
            let once = SnapshotMerger::merge(&previous, &observed);
            let twice = SnapshotMerger::merge(&once, &observed);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_never_forgets_a_field(previous in arb_snapshot(), observed in arb_snapshot()) {
            let merged = SnapshotMerger::merge(&previous, &PartialSnapshot::from(observed));
            for field in previous.present_fields() {
                prop_assert!(merged.present_fields().contains(&field));
            }
        }

        #[test]
        fn prop_merge_takes_informative_observations(previous in arb_snapshot(), observed in arb_snapshot()) {
            let observed = PartialSnapshot::from(observed);
            let merged = SnapshotMerger::merge(&previous, &observed);
            for field in observed.observed_fields() {
                match field {
                    SnapshotField::StoreIds => prop_assert_eq!(&merged.store_ids, &observed.store_ids),
                    SnapshotField::ClusterId => prop_assert_eq!(&merged.cluster_id, &observed.cluster_id),
                    SnapshotField::AllocId => prop_assert_eq!(merged.alloc_id, observed.alloc_id),
                    SnapshotField::Rpos => prop_assert_eq!(&merged.rpos, &observed.rpos),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    #[test]
    fn test_in_phase_wraps_once() {
        let err = RecoverError::from(TopologyError::NoPdServers).in_phase(Phase::Preparing);
        assert_eq!(err.phase(), Some(Phase::Preparing));
        assert_eq!(err.category(), "phase");

        let rewrapped = err.in_phase(Phase::Stopped);
        assert_eq!(rewrapped.phase(), Some(Phase::Preparing));

        let cancelled = RecoverError::Cancelled {
            phase: Phase::ReplicationReady,
        }
        .in_phase(Phase::LearnersJoined);
        assert!(matches!(cancelled, RecoverError::Cancelled { phase: Phase::ReplicationReady }));
    }

    #[test]
    fn test_remote_failure_message_includes_status_and_output() {
        let err = RemoteError::Failed {
            command: "tiup cluster start -y dr".into(),
            status: Some(2),
            output: "component missing".into(),
        };
        let message = err.to_string();
        assert!(message.contains("status 2"));
        assert!(message.contains("component missing"));
    }
}



#[cfg(test)]
mod orchestrator_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type EventLog = Arc<Mutex<Vec<String>>>;

    #[derive(Debug, Default)]
    struct RecordingRunner {
        log: EventLog,
        fail_when: Vec<String>,
    }

    impl RecordingRunner {
        fn new(log: &EventLog, fail_when: &[&str]) -> Self {
            Self {
                log: Arc::clone(log),
                fail_when: fail_when.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RemoteError> {
            let line = command.to_string();
            self.log.lock().push(line.clone());
            if self.fail_when.iter().any(|p| line.contains(p.as_str())) {
                return Err(RemoteError::Failed {
                    command: line,
                    status: Some(1),
                    output: "simulated failure".into(),
                });
            }
            Ok(CommandOutput::default())
        }
    }

    #[derive(Debug)]
    struct CountingProbe {
        log: EventLog,
        failures_left: AtomicUsize,
    }

    impl CountingProbe {
        fn ready_after(log: &EventLog, failures: usize) -> Self {
            Self {
                log: Arc::clone(log),
                failures_left: AtomicUsize::new(failures),
            }
        }

        fn never_ready(log: &EventLog) -> Self {
            Self::ready_after(log, usize::MAX)
        }
    }

    #[async_trait]
    impl ReadinessProbe for CountingProbe {
        async fn probe(&self, endpoint: &str) -> MetricsResult<()> {
            self.log.lock().push(format!("probe {}", endpoint));
            let left = self.failures_left.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.failures_left.store(left - 1, Ordering::SeqCst);
            Err(MetricsError::Transport {
                endpoint: endpoint.to_string(),
                message: "connection refused".into(),
            })
        }
    }

    fn plan(policy: FailurePolicy) -> RecoveryPlan {
        RecoveryPlan {
            cluster_name: "dr-cluster".into(),
            cluster_version: "v6.1.0".into(),
            ssh: SshTarget {
                user: "tidb".into(),
                port: 22,
            },
            nodes: vec![
                BackupNode {
                    host: "10.0.2.21".into(),
                    port: 20160,
                    data_dir: "/data/tikv-20160".into(),
                },
                BackupNode {
                    host: "10.0.2.22".into(),
                    port: 20161,
                    data_dir: "/data/tikv-20161".into(),
                },
            ],
            snapshot: ValidatedSnapshot {
                store_ids: BTreeSet::from([7, 1, 2]),
                cluster_id: "7000000000000000001".into(),
                alloc_id: 5000 + ALLOC_ID_OFFSET,
                rpos: Vec::new(),
            },
            coordinator: "10.0.3.1:2379".into(),
            new_topology: PathBuf::from("/etc/dr/new.yaml"),
            join_topology: PathBuf::from("/etc/dr/join.yaml"),
            tikv_ctl: ToolTransfer {
                src: PathBuf::from("/opt/bin/tikv-ctl"),
                dest: "/home/tidb/tikv-ctl".into(),
            },
            pd_recover_path: PathBuf::from("/opt/bin/pd-recover"),
            tiup_path: PathBuf::from("tiup"),
            policy,
            readiness: ReadinessConfig {
                timeout: Some(Duration::from_secs(5)),
                retry_interval: Duration::from_millis(5),
                probe_timeout: Duration::from_millis(200),
            },
        }
    }

    fn orchestrator(plan: RecoveryPlan, runner: RecordingRunner, probe: CountingProbe) -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(plan, Arc::new(runner), Arc::new(probe))
    }

    fn first(log: &[String], needle: &str) -> usize {
        log.iter()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("'{}' never issued", needle))
    }

    fn last(log: &[String], needle: &str) -> usize {
        log.iter()
            .rposition(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("'{}' never issued", needle))
    }

    fn count(log: &[String], needle: &str) -> usize {
        log.iter().filter(|line| line.contains(needle)).count()
    }

    // ------------------------------------------------------------------------
    // Command lines
    // ------------------------------------------------------------------------

    #[test]
    fn test_remote_command_lines() {
        let plan = plan(FailurePolicy::Strict);
        let node = &plan.nodes[0];

        assert_eq!(
            plan.stage_tool_command(node).to_string(),
            "scp -P 22 /opt/bin/tikv-ctl tidb@10.0.2.21:/home/tidb/tikv-ctl"
        );
        assert_eq!(
            plan.stop_command(node).to_string(),
            "ssh -p 22 tidb@10.0.2.21 sudo systemctl stop tikv-20160.service"
        );
        assert_eq!(
            plan.unsafe_recover_command(node).to_string(),
            "ssh -p 22 tidb@10.0.2.21 /home/tidb/tikv-ctl --data-dir /data/tikv-20160 \
             unsafe-recover remove-fail-stores -s 1,2,7 --all-regions --promote-learner"
        );
    }

    #[test]
    fn test_coordinator_command_lines() {
        let plan = plan(FailurePolicy::Strict);

        assert_eq!(
            plan.deploy_command().to_string(),
            "tiup cluster deploy -y dr-cluster v6.1.0 /etc/dr/new.yaml"
        );
        assert_eq!(
            plan.inject_identity_command().to_string(),
            "/opt/bin/pd-recover -endpoints http://10.0.3.1:2379 \
             -cluster-id 7000000000000000001 -alloc-id 4294972296"
        );
        assert_eq!(
            plan.scale_out_command().to_string(),
            "tiup cluster scale-out -y dr-cluster /etc/dr/join.yaml"
        );
    }

    // ------------------------------------------------------------------------
    // Phase ordering
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_full_run_respects_phase_barriers() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Strict),
            RecordingRunner::new(&log, &[]),
            CountingProbe::ready_after(&log, 2),
        );

        let report = orchestrator.run().await.unwrap();
        let log = log.lock().clone();

        assert_eq!(report.completed_phases(), Phase::SEQUENCE.to_vec());
        assert!(report.is_clean());
        assert_eq!(orchestrator.phase(), Phase::LearnersJoined);

        assert_eq!(count(&log, "scp "), 2);
        assert!(last(&log, "scp ") < first(&log, "systemctl stop"));
        assert!(last(&log, "systemctl stop") < first(&log, "unsafe-recover"));
        assert!(last(&log, "unsafe-recover") < first(&log, "cluster deploy"));
        assert!(first(&log, "cluster deploy") < first(&log, "cluster start"));
        assert!(first(&log, "cluster start") < first(&log, "pd-recover"));
        assert!(first(&log, "pd-recover") < first(&log, "cluster restart"));
        assert!(first(&log, "cluster restart") < first(&log, "probe 10.0.3.1:2379"));
        assert_eq!(count(&log, "probe "), 3);
        assert_eq!(last(&log, "cluster scale-out"), log.len() - 1);
        assert!(last(&log, "probe ") < first(&log, "cluster scale-out"));
    }

    #[tokio::test]
    async fn test_dry_run_issues_every_command_without_effects() {
        let runner = Arc::new(DryRunRunner::default());
        let mut orchestrator =
            RecoveryOrchestrator::new(plan(FailurePolicy::Strict), runner.clone(), Arc::new(AssumeReady));

        orchestrator.run().await.unwrap();

        let issued = runner.issued();
        assert_eq!(issued.len(), 2 + 2 + 2 + 4 + 1);
        assert_eq!(issued[0].program, "scp");
        assert_eq!(issued.last().map(|c| c.args[1].as_str()), Some("scale-out"));
    }

    // ------------------------------------------------------------------------
    // Failure policies
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_strict_prepare_failure_aborts_before_stopping() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Strict),
            RecordingRunner::new(&log, &["tidb@10.0.2.22:"]),
            CountingProbe::ready_after(&log, 0),
        );

        let err = orchestrator.run().await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Preparing));
        assert_eq!(orchestrator.phase(), Phase::Idle);
        assert_eq!(count(&log.lock(), "systemctl"), 0);
    }

    #[tokio::test]
    async fn test_permissive_prepare_failure_is_recorded() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Permissive),
            RecordingRunner::new(&log, &["tidb@10.0.2.22:"]),
            CountingProbe::ready_after(&log, 0),
        );

        let report = orchestrator.run().await.unwrap();

        let preparing = report.phase(Phase::Preparing).unwrap();
        assert_eq!(preparing.failures.len(), 1);
        assert_eq!(preparing.failures[0].target, "10.0.2.22:20161");
        assert_eq!(count(&log.lock(), "cluster scale-out"), 1);
    }

    #[tokio::test]
    async fn test_stop_is_best_effort_under_strict_policy() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Strict),
            RecordingRunner::new(&log, &["tikv-20161.service"]),
            CountingProbe::ready_after(&log, 0),
        );

        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.phase(Phase::Stopped).unwrap().failures.len(), 1);
        assert_eq!(count(&log.lock(), "unsafe-recover"), 2);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_unsafe_recover_failure_is_tolerated() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Strict),
            RecordingRunner::new(&log, &["--data-dir /data/tikv-20160"]),
            CountingProbe::ready_after(&log, 0),
        );

        let report = orchestrator.run().await.unwrap();
        let recovered = report.phase(Phase::Recovered).unwrap();
        assert_eq!(recovered.failures[0].target, "10.0.2.21:20160");
    }

    #[tokio::test]
    async fn test_deploy_failure_is_tolerated_under_strict_policy() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Strict),
            RecordingRunner::new(&log, &["cluster deploy"]),
            CountingProbe::ready_after(&log, 0),
        );

        let report = orchestrator.run().await.unwrap();
        let rebuilt = report.phase(Phase::CoordinatorRebuilt).unwrap();
        assert_eq!(rebuilt.failures.len(), 1);
        assert_eq!(rebuilt.failures[0].target, "deploy");
    }

    #[tokio::test]
    async fn test_strict_identity_injection_failure_aborts() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Strict),
            RecordingRunner::new(&log, &["pd-recover"]),
            CountingProbe::ready_after(&log, 0),
        );

        let err = orchestrator.run().await.unwrap_err();
        let log = log.lock().clone();

        assert_eq!(err.phase(), Some(Phase::CoordinatorRebuilt));
        assert_eq!(orchestrator.phase(), Phase::Recovered);
        assert_eq!(count(&log, "cluster restart"), 0);
        assert_eq!(count(&log, "probe "), 0);
    }

    #[tokio::test]
    async fn test_aborted_run_keeps_earlier_node_failures() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Strict),
            RecordingRunner::new(&log, &["stop tikv-20161", "pd-recover"]),
            CountingProbe::ready_after(&log, 0),
        );

        let err = orchestrator.run().await.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::CoordinatorRebuilt));

        let report = orchestrator.report().expect("report kept after abort");
        assert_eq!(
            report.aborted.as_ref().map(|a| a.phase),
            Some(Phase::CoordinatorRebuilt)
        );
        let stopped = report.phase(Phase::Stopped).unwrap();
        assert_eq!(stopped.failures.len(), 1);
        assert_eq!(stopped.failures[0].target, "10.0.2.22:20161");
        assert_eq!(report.failed_targets(), vec!["10.0.2.22:20161"]);
        assert!(!report.is_clean());
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_permissive_identity_injection_failure_continues() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Permissive),
            RecordingRunner::new(&log, &["pd-recover"]),
            CountingProbe::ready_after(&log, 0),
        );

        let report = orchestrator.run().await.unwrap();
        let rebuilt = report.phase(Phase::CoordinatorRebuilt).unwrap();
        assert_eq!(rebuilt.failures[0].target, "inject-identity");
        assert_eq!(count(&log.lock(), "cluster restart"), 1);
    }

    #[tokio::test]
    async fn test_scale_out_failure_is_always_fatal() {
        let log = EventLog::default();
        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Permissive),
            RecordingRunner::new(&log, &["scale-out"]),
            CountingProbe::ready_after(&log, 0),
        );

        let err = orchestrator.run().await.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::LearnersJoined));
        assert_eq!(orchestrator.phase(), Phase::ReplicationReady);
    }

    // ------------------------------------------------------------------------
    // Readiness wait
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_readiness_timeout_aborts_before_scale_out() {
        let log = EventLog::default();
        let mut plan = plan(FailurePolicy::Strict);
        plan.readiness.timeout = Some(Duration::from_millis(50));

        let mut orchestrator = orchestrator(
            plan,
            RecordingRunner::new(&log, &[]),
            CountingProbe::never_ready(&log),
        );

        let err = orchestrator.run().await.unwrap_err();

        match err {
            RecoverError::Phase { phase, source } => {
                assert_eq!(phase, Phase::ReplicationReady);
                assert!(matches!(*source, RecoverError::ReadinessTimeout { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(orchestrator.phase(), Phase::CoordinatorRebuilt);
        assert_eq!(count(&log.lock(), "scale-out"), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_readiness_wait() {
        let log = EventLog::default();
        let mut plan = plan(FailurePolicy::Strict);
        plan.readiness.timeout = None;

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut orchestrator = orchestrator(
            plan,
            RecordingRunner::new(&log, &[]),
            CountingProbe::never_ready(&log),
        )
        .with_cancellation(token);

        let err = timeout(Duration::from_secs(5), orchestrator.run())
            .await
            .expect("cancellation should end the wait")
            .unwrap_err();

        assert!(matches!(
            err,
            RecoverError::Cancelled {
                phase: Phase::ReplicationReady
            }
        ));
        assert!(count(&log.lock(), "probe ") >= 1);
        assert_eq!(count(&log.lock(), "scale-out"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let log = EventLog::default();
        let token = CancellationToken::new();
        token.cancel();

        let mut orchestrator = orchestrator(
            plan(FailurePolicy::Strict),
            RecordingRunner::new(&log, &[]),
            CountingProbe::ready_after(&log, 0),
        )
        .with_cancellation(token);

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, RecoverError::Cancelled { phase: Phase::Preparing }));
        assert!(log.lock().is_empty());
    }

    // ------------------------------------------------------------------------
    // Process runner
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_process_runner_captures_failure_output() {
        let command = CommandSpec::new("sh").args(["-c", "echo progress; echo broken >&2; exit 3"]);
        let err = ProcessRunner.run(&command).await.unwrap_err();

        match err {
            RemoteError::Failed { status, output, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(output, "broken");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_process_runner_reports_missing_program() {
        let command = CommandSpec::new("/nonexistent/learner-recover-missing-tool");
        let err = ProcessRunner.run(&command).await.unwrap_err();
        assert!(matches!(err, RemoteError::Spawn { .. }));
    }

    #[test]
    fn test_dry_run_runner_records_commands() {
        let runner = DryRunRunner::default();
        let command = CommandSpec::new("tiup").args(["cluster", "start", "-y", "dr-cluster"]);

        let output = tokio_test::block_on(runner.run(&command)).unwrap();

        assert_eq!(output.status, Some(0));
        assert_eq!(runner.issued(), vec![command]);
    }
}
