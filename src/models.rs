//! Data models for package lookups.
//!
//! Three groups live here: the validated lookup key, the raw upstream
//! insight as the insights service sends it (protobuf-JSON, camelCase), and
//! the flat record handed to the browser (snake_case).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::InsightError;

/// Package registry families the insights service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    Npm,
    Pypi,
    Maven,
    Cargo,
    Nuget,
    Go,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 6] = [
        Ecosystem::Npm,
        Ecosystem::Pypi,
        Ecosystem::Maven,
        Ecosystem::Cargo,
        Ecosystem::Nuget,
        Ecosystem::Go,
    ];

    /// Canonical lower-case name used in URLs, cache keys and responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::Pypi => "pypi",
            Ecosystem::Maven => "maven",
            Ecosystem::Cargo => "cargo",
            Ecosystem::Nuget => "nuget",
            Ecosystem::Go => "go",
        }
    }

    /// Enum value name on the insights service wire.
    pub fn upstream_name(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "ECOSYSTEM_NPM",
            Ecosystem::Pypi => "ECOSYSTEM_PYPI",
            Ecosystem::Maven => "ECOSYSTEM_MAVEN",
            Ecosystem::Cargo => "ECOSYSTEM_CARGO",
            Ecosystem::Nuget => "ECOSYSTEM_NUGET",
            Ecosystem::Go => "ECOSYSTEM_GO",
        }
    }
}

impl FromStr for Ecosystem {
    type Err = InsightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ecosystem::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| InsightError::UnsupportedEcosystem(s.to_string()))
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one package version. Built per request, never persisted
/// beyond the cache key derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: String,
}

impl LookupKey {
    /// Validates raw request parameters.
    ///
    /// Blank parameters win over an unknown ecosystem, matching the order in
    /// which a caller would have to fix them.
    pub fn new(ecosystem: &str, name: &str, version: &str) -> Result<Self, InsightError> {
        let (ecosystem, name, version) = (ecosystem.trim(), name.trim(), version.trim());
        if ecosystem.is_empty() || name.is_empty() || version.is_empty() {
            return Err(InsightError::MissingParameters);
        }

        Ok(Self {
            ecosystem: ecosystem.parse()?,
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// `ecosystem/name@version`, used in logs and error messages.
    pub fn identity(&self) -> String {
        format!("{}/{}@{}", self.ecosystem, self.name, self.version)
    }

    pub fn cache_key(&self) -> String {
        format!("package:{}:{}:{}", self.ecosystem, self.name, self.version)
    }
}

// ---------------------------------------------------------------------------
// Raw upstream shapes
// ---------------------------------------------------------------------------

/// Envelope of a `GetPackageVersionInsight` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightResponse {
    pub insight: Option<RawInsight>,
}

/// Unmodified insight substructure. Every field is optional upstream.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawInsight {
    pub vulnerabilities: Option<Vec<RawVulnerability>>,
    pub project_insights: Option<Vec<RawProjectInsight>>,
    pub licenses: Option<RawLicenseList>,
    pub available_versions: Option<Vec<RawAvailableVersion>>,
    pub package_published_at: Option<String>,
}

impl RawInsight {
    /// True when the payload carries nothing usable. The insights service
    /// answers unknown packages this way instead of with `not_found`.
    pub fn is_empty(&self) -> bool {
        fn blank<T>(v: &Option<Vec<T>>) -> bool {
            v.as_ref().is_none_or(|v| v.is_empty())
        }

        blank(&self.vulnerabilities)
            && blank(&self.project_insights)
            && blank(&self.available_versions)
            && self
                .licenses
                .as_ref()
                .is_none_or(|l| blank(&l.licenses))
            && self
                .package_published_at
                .as_deref()
                .is_none_or(str::is_empty)
    }
}

/// Identifiers arrive either bare or wrapped as `{"value": ..}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawIdentifier {
    Plain(String),
    Wrapped { value: String },
}

impl RawIdentifier {
    pub fn into_string(self) -> String {
        match self {
            RawIdentifier::Plain(s) | RawIdentifier::Wrapped { value: s } => s,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawVulnerability {
    pub id: Option<RawIdentifier>,
    pub summary: Option<String>,
    pub details: Option<String>,
    pub aliases: Option<Vec<RawIdentifier>>,
    /// Older schema: a flat severity string such as `"LOW"`.
    pub severity: Option<String>,
    /// Newer schema: structured entries carrying a `RISK_*` enum.
    pub severities: Option<Vec<RawSeverity>>,
    #[serde(alias = "published_at")]
    pub published_at: Option<String>,
    #[serde(alias = "modified_at")]
    pub modified_at: Option<String>,
    #[serde(alias = "fixed_version")]
    pub fixed_version: Option<String>,
}

/// Only the risk level is read; CVSS vectors are ignored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawSeverity {
    pub risk: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawProjectInsight {
    pub project: Option<RawProject>,
    pub scorecard: Option<RawScorecard>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawProject {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawScorecard {
    pub score: Option<f64>,
    pub checks: Option<Vec<RawScorecardCheck>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawScorecardCheck {
    pub name: Option<String>,
    pub score: Option<RawScore>,
    pub reason: Option<String>,
    pub details: Option<Vec<String>>,
}

/// Check scores are either a number or `{"score": n}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawScore {
    Number(f64),
    Nested { score: Option<f64> },
}

impl RawScore {
    pub fn value(&self) -> f64 {
        match self {
            RawScore::Number(n) => *n,
            RawScore::Nested { score } => score.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawLicenseList {
    pub licenses: Option<Vec<RawLicense>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawLicense {
    #[serde(alias = "licenseId", alias = "spdx_id")]
    pub spdx_id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawAvailableVersion {
    pub version: Option<String>,
    pub published_at: Option<String>,
    pub default_version: Option<bool>,
}

// ---------------------------------------------------------------------------
// Normalized record
// ---------------------------------------------------------------------------

/// Flat record returned to the browser and stored in the cache.
///
/// Every field is always present; missing upstream data degrades to empty
/// strings and empty lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizedPackageData {
    pub ecosystem: String,
    pub name: String,
    pub version: String,
    pub vulnerabilities: Vec<Vulnerability>,
    pub scorecard: Scorecard,
    pub licenses: Vec<License>,
    pub available_versions: Vec<AvailableVersion>,
    pub metadata: Metadata,
    pub stats: PackageStats,
    /// Always present; empty until malware analysis is wired up.
    #[serde(default)]
    pub malysis: Malysis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Vulnerability {
    pub id: String,
    pub summary: String,
    pub details: String,
    /// Display severity, e.g. `"Critical"` or `"LOW"`.
    pub severity: String,
    pub aliases: Vec<String>,
    pub published_at: String,
    pub modified_at: String,
    pub fixed_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Scorecard {
    /// OpenSSF score, 0 to 10.
    pub score: f64,
    pub checks: Vec<ScorecardCheck>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScorecardCheck {
    pub name: String,
    pub score: f64,
    pub reason: String,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct License {
    pub spdx_id: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AvailableVersion {
    pub version: String,
    pub published_at: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub analyzed_at: String,
    pub source_url: String,
    /// Not supplied by the insights service; always empty.
    pub sha256: String,
}

/// Headline numbers for the dashboard's stat cards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackageStats {
    pub vulnerability_count: usize,
    pub scorecard_score: f64,
    pub primary_license: String,
}

/// Malicious-package analysis result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Malysis {
    pub analysis: MalysisAnalysis,
    pub signals: Vec<MalysisSignal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MalysisAnalysis {
    pub is_malicious: bool,
    pub confidence: String,
    pub summary: String,
    pub details: String,
    pub verification_record: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MalysisSignal {
    #[serde(rename = "type")]
    pub signal_type: String,
    pub severity: String,
    pub description: String,
    pub file_path: String,
}
