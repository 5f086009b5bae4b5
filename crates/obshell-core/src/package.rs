// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upgrade packages stored in the cluster store.
//!
//! A payload is split into [`CHUNK_SIZE`] rows under one header row that
//! carries its manifest and the embedded upgrade dependency YAML. The YAML
//! lists, per build, the builds it can be upgraded to and whether its binary
//! must be installed on the way; [`upgrade_route`] walks it.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::error::{Error, ErrorKind, Result};
use crate::persistence::{ClusterStore, NewPackage, PackageRecord};

/// Payload chunk size.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// A dotted build version with an optional numeric release, e.g.
/// `4.2.1.0-100000102023092807`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildVersion {
    parts: Vec<u32>,
    release: Option<u64>,
}

impl BuildVersion {
    /// The same build without its release.
    pub fn without_release(&self) -> Self {
        Self {
            parts: self.parts.clone(),
            release: None,
        }
    }

    /// Whether `self` names `other`, ignoring the release when either side
    /// has none.
    pub fn matches(&self, other: &BuildVersion) -> bool {
        self.parts == other.parts
            && match (self.release, other.release) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl FromStr for BuildVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (version, release) = match s.split_once('-') {
            Some((v, r)) => (v, Some(r)),
            None => (s, None),
        };
        let parts = version
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::illegal_argument(format!("invalid version {}", s)))?;
        if parts.is_empty() {
            return Err(Error::illegal_argument(format!("invalid version {}", s)));
        }
        // `100.el7` carries the distribution after the release number
        let release = match release {
            Some(r) => Some(
                r.split('.')
                    .next()
                    .unwrap_or_default()
                    .parse::<u64>()
                    .map_err(|_| Error::illegal_argument(format!("invalid release in {}", s)))?,
            ),
            None => None,
        };
        Ok(Self { parts, release })
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.parts.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))?;
        if let Some(release) = self.release {
            write!(f, "-{}", release)?;
        }
        Ok(())
    }
}

impl PartialOrd for BuildVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BuildVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.parts.len().max(other.parts.len());
        let pad = |v: &[u32]| (0..width).map(|i| v.get(i).copied().unwrap_or(0)).collect::<Vec<_>>();
        pad(&self.parts)
            .cmp(&pad(&other.parts))
            .then_with(|| match (self.release, other.release) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => Ordering::Equal,
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RequireFromBinary {
    #[serde(default)]
    value: bool,
    #[serde(default)]
    when_come_from: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DepEntry {
    version: String,
    #[serde(default)]
    can_be_upgraded_to: Vec<String>,
    #[serde(default)]
    require_from_binary: RequireFromBinary,
    #[serde(default)]
    deprecated: bool,
}

/// One build on an upgrade route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStep {
    /// Build version as written in the dependency file.
    pub version: String,
    /// Whether this build's binary must be installed on the way.
    pub require_from_binary: bool,
}

/// Shortest route from `current` to `target` over the dependency YAML,
/// `current` first and `target` last.
pub fn upgrade_route(current: &str, target: &str, dep_yaml: &str) -> Result<Vec<RouteStep>> {
    let from: BuildVersion = current.parse()?;
    let to: BuildVersion = target.parse()?;
    if to < from {
        return Err(Error::with_args(ErrorKind::AgentUpgradeToLower, [current, target]));
    }

    let entries: Vec<DepEntry> = serde_yaml::from_str(dep_yaml)
        .map_err(|e| Error::illegal_argument(format!("invalid upgrade dependency file: {}", e)))?;
    let mut versions = Vec::with_capacity(entries.len());
    for entry in &entries {
        versions.push(entry.version.parse::<BuildVersion>()?);
    }
    let index_of = |v: &BuildVersion| versions.iter().position(|known| known.matches(v));
    let not_found = || Error::with_args(ErrorKind::AgentPackageNotFound, [target]);

    let start = index_of(&from).ok_or_else(not_found)?;
    let goal = index_of(&to).ok_or_else(not_found)?;

    let mut previous: HashMap<usize, usize> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(at) = queue.pop_front() {
        if at == goal {
            break;
        }
        for next in &entries[at].can_be_upgraded_to {
            let Some(next) = index_of(&next.parse()?) else {
                continue;
            };
            if next != start && !previous.contains_key(&next) && !entries[next].deprecated {
                previous.insert(next, at);
                queue.push_back(next);
            }
        }
    }
    if start != goal && !previous.contains_key(&goal) {
        return Err(not_found());
    }

    let mut path = vec![goal];
    while let Some(&at) = previous.get(path.last().unwrap_or(&start)) {
        path.push(at);
    }
    path.reverse();

    let mut route = Vec::with_capacity(path.len());
    for (i, &at) in path.iter().enumerate() {
        let entry = &entries[at];
        let rule = &entry.require_from_binary;
        let required = rule.value
            && (rule.when_come_from.is_empty()
                || path[..i].iter().any(|&before| {
                    rule.when_come_from
                        .iter()
                        .any(|from| from.parse::<BuildVersion>().is_ok_and(|f| f.matches(&versions[before])))
                }));
        route.push(RouteStep {
            version: entry.version.clone(),
            require_from_binary: required || i + 1 == path.len(),
        });
    }
    Ok(route)
}

/// Manifest sent alongside an uploaded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    /// Package name, e.g. `oceanbase`.
    pub name: String,
    /// Build version.
    pub version: String,
    /// Release with distribution suffix.
    pub release_distribution: String,
    /// Distribution.
    pub distribution: String,
    /// Architecture.
    pub architecture: String,
    /// Expected hex SHA-256 of the payload.
    pub sha256: String,
    /// Embedded dependency YAML, empty when the package is not
    /// upgrade-eligible.
    #[serde(default)]
    pub upgrade_dep_yaml: String,
}

/// Stored package as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Id.
    pub id: i64,
    /// Name.
    pub name: String,
    /// Build version.
    pub version: String,
    /// Release with distribution suffix.
    pub release_distribution: String,
    /// Distribution.
    pub distribution: String,
    /// Architecture.
    pub architecture: String,
    /// Payload size.
    pub size: i64,
    /// Hex SHA-256.
    pub sha256: String,
    /// Whether a dependency file is embedded.
    pub upgrade_eligible: bool,
    /// Upload time.
    pub created_at: DateTime<Utc>,
}

impl From<PackageRecord> for PackageInfo {
    fn from(record: PackageRecord) -> Self {
        Self {
            upgrade_eligible: !record.upgrade_dep_yaml.is_empty(),
            id: record.id,
            name: record.name,
            version: record.version,
            release_distribution: record.release_distribution,
            distribution: record.distribution,
            architecture: record.architecture,
            size: record.size,
            sha256: record.sha256,
            created_at: record.created_at,
        }
    }
}

fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Package operations over the cluster store.
#[derive(Clone)]
pub struct PackageService {
    cluster: Arc<dyn ClusterStore>,
}

impl fmt::Debug for PackageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageService").finish_non_exhaustive()
    }
}

impl PackageService {
    /// Service over `cluster`.
    pub fn new(cluster: Arc<dyn ClusterStore>) -> Self {
        Self { cluster }
    }

    /// Verify and store a payload.
    #[instrument(skip_all, fields(name = %manifest.name, version = %manifest.version, size = payload.len()))]
    pub async fn upload(&self, manifest: PackageManifest, payload: &[u8]) -> Result<PackageInfo> {
        let actual = sha256_hex(payload);
        if !actual.eq_ignore_ascii_case(&manifest.sha256) {
            return Err(Error::with_args(ErrorKind::SecurityFileSha256Mismatch, [manifest.sha256, actual]));
        }
        manifest.version.parse::<BuildVersion>()?;
        if !manifest.upgrade_dep_yaml.is_empty() {
            serde_yaml::from_str::<Vec<DepEntry>>(&manifest.upgrade_dep_yaml)
                .map_err(|e| Error::illegal_argument(format!("invalid upgrade dependency file: {}", e)))?;
        }

        let chunks: Vec<Vec<u8>> = payload.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        let id = self
            .cluster
            .insert_package(
                &NewPackage {
                    name: manifest.name,
                    version: manifest.version,
                    release_distribution: manifest.release_distribution,
                    distribution: manifest.distribution,
                    architecture: manifest.architecture,
                    size: payload.len() as i64,
                    sha256: actual,
                    upgrade_dep_yaml: manifest.upgrade_dep_yaml,
                },
                &chunks,
            )
            .await?;
        info!(package_id = id, chunks = chunks.len(), "Package stored");
        self.info(id).await
    }

    async fn record(&self, id: i64) -> Result<PackageRecord> {
        self.cluster
            .get_package(id)
            .await?
            .ok_or_else(|| Error::with_args(ErrorKind::CommonNotFound, [format!("package {}", id)]))
    }

    /// Header of one package.
    pub async fn info(&self, id: i64) -> Result<PackageInfo> {
        Ok(self.record(id).await?.into())
    }

    /// All stored packages.
    pub async fn list(&self) -> Result<Vec<PackageInfo>> {
        Ok(self
            .cluster
            .list_packages()
            .await?
            .into_iter()
            .map(PackageInfo::from)
            .collect())
    }

    /// Reassemble a payload and check it against its header.
    pub async fn fetch(&self, id: i64) -> Result<Vec<u8>> {
        let record = self.record(id).await?;
        let chunks = self.cluster.load_package_chunks(id).await?;
        if chunks.len() != record.chunk_count as usize {
            return Err(Error::unexpected(format!(
                "package {} has {} chunks, expected {}",
                id,
                chunks.len(),
                record.chunk_count
            )));
        }
        let payload = chunks.concat();
        let actual = sha256_hex(&payload);
        if actual != record.sha256 {
            return Err(Error::with_args(ErrorKind::SecurityFileSha256Mismatch, [record.sha256, actual]));
        }
        Ok(payload)
    }

    /// Newest stored package of `version` for a platform.
    pub async fn find(&self, version: &str, distribution: &str, architecture: &str) -> Result<Option<PackageRecord>> {
        let wanted: BuildVersion = version.parse()?;
        Ok(self
            .cluster
            .list_packages()
            .await?
            .into_iter()
            .filter(|p| p.distribution == distribution && p.architecture == architecture)
            .filter(|p| {
                package_build(p).is_some_and(|b| wanted.matches(&b))
            })
            .max_by_key(|p| p.created_at))
    }

    /// Route from `current` to `target` using the dependency file of the
    /// target package, with every build that must be installed on the way
    /// backed by a stored package.
    #[instrument(skip(self))]
    pub async fn plan_upgrade(
        &self,
        current: &str,
        target: &str,
        distribution: &str,
        architecture: &str,
    ) -> Result<Vec<(RouteStep, PackageRecord)>> {
        let package = self
            .find(target, distribution, architecture)
            .await?
            .ok_or_else(|| Error::with_args(ErrorKind::AgentPackageNotFound, [target]))?;
        if package.upgrade_dep_yaml.is_empty() {
            return Err(Error::with_args(ErrorKind::UpgradeDepYmlMissing, [package.name]));
        }
        let route = upgrade_route(current, target, &package.upgrade_dep_yaml)?;

        let mut planned = Vec::new();
        for step in route.into_iter().skip(1).filter(|s| s.require_from_binary) {
            let found = self
                .find(&step.version, distribution, architecture)
                .await?
                .ok_or_else(|| Error::with_args(ErrorKind::AgentPackageNotFound, [&step.version]))?;
            planned.push((step, found));
        }
        Ok(planned)
    }
}

fn package_build(package: &PackageRecord) -> Option<BuildVersion> {
    let release = package.release_distribution.split('.').next().unwrap_or_default();
    format!("{}-{}", package.version, release)
        .parse()
        .or_else(|_| package.version.parse())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;

    const DEP_YAML: &str = r#"
- version: 4.2.1.0-100
  can_be_upgraded_to:
    - 4.2.2.0-200
- version: 4.2.2.0-200
  can_be_upgraded_to:
    - 4.3.0.0-300
  require_from_binary:
    value: true
    when_come_from: [4.2.1.0-100]
- version: 4.3.0.0-300
  can_be_upgraded_to: []
- version: 4.4.0.0-400
  can_be_upgraded_to: []
"#;

    #[test]
    fn test_version_ordering() {
        let a: BuildVersion = "4.2.1.0-100".parse().unwrap();
        let b: BuildVersion = "4.2.10.0-50".parse().unwrap();
        let c: BuildVersion = "4.2.1-100.el7".parse().unwrap();
        assert!(a < b);
        assert_eq!(a.cmp(&c), Ordering::Equal);
        assert!(a.matches(&"4.2.1.0".parse().unwrap()));
        assert!("4.x".parse::<BuildVersion>().is_err());
    }

    #[test]
    fn test_route_through_required_binary() {
        let route = upgrade_route("4.2.1.0-100", "4.3.0.0-300", DEP_YAML).unwrap();
        let versions: Vec<_> = route.iter().map(|s| s.version.as_str()).collect();
        assert_eq!(versions, vec!["4.2.1.0-100", "4.2.2.0-200", "4.3.0.0-300"]);
        assert!(route[1].require_from_binary);
        assert!(route[2].require_from_binary);

        // coming from 4.2.2 directly does not need its binary again
        let route = upgrade_route("4.2.2.0-200", "4.3.0.0-300", DEP_YAML).unwrap();
        assert!(!route[0].require_from_binary);
    }

    #[test]
    fn test_route_errors() {
        let err = upgrade_route("4.3.0.0-300", "4.2.1.0-100", DEP_YAML).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentUpgradeToLower);

        // listed but unreachable
        let err = upgrade_route("4.2.1.0-100", "4.4.0.0-400", DEP_YAML).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentPackageNotFound);
        assert_eq!(err.args(), ["4.4.0.0-400"]);
    }

    fn manifest(version: &str, release: &str, payload: &[u8], dep_yaml: &str) -> PackageManifest {
        PackageManifest {
            name: "oceanbase".to_string(),
            version: version.to_string(),
            release_distribution: format!("{}.el7", release),
            distribution: "el7".to_string(),
            architecture: "x86_64".to_string(),
            sha256: sha256_hex(payload),
            upgrade_dep_yaml: dep_yaml.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upload_and_reassemble_across_chunks() {
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let service = PackageService::new(store);
        let payload: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();

        let info = service
            .upload(manifest("4.3.0.0", "300", &payload, ""), &payload)
            .await
            .unwrap();
        assert_eq!(info.size, payload.len() as i64);
        assert!(!info.upgrade_eligible);
        assert_eq!(service.fetch(info.id).await.unwrap(), payload);

        let mut bad = manifest("4.3.0.0", "300", &payload, "");
        bad.sha256 = sha256_hex(b"other");
        let err = service.upload(bad, &payload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityFileSha256Mismatch);
    }

    #[tokio::test]
    async fn test_plan_upgrade_requires_intermediate_package() {
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let service = PackageService::new(store);
        let target = b"target".to_vec();
        service
            .upload(manifest("4.3.0.0", "300", &target, DEP_YAML), &target)
            .await
            .unwrap();

        let err = service
            .plan_upgrade("4.2.1.0-100", "4.3.0.0-300", "el7", "x86_64")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentPackageNotFound);
        assert_eq!(err.args(), ["4.2.2.0-200"]);

        let middle = b"middle".to_vec();
        service
            .upload(manifest("4.2.2.0", "200", &middle, ""), &middle)
            .await
            .unwrap();
        let plan = service
            .plan_upgrade("4.2.1.0-100", "4.3.0.0-300", "el7", "x86_64")
            .await
            .unwrap();
        let versions: Vec<_> = plan.iter().map(|(s, p)| (s.version.as_str(), p.version.as_str())).collect();
        assert_eq!(versions, vec![("4.2.2.0-200", "4.2.2.0"), ("4.3.0.0-300", "4.3.0.0")]);
    }
}
