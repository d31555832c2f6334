//! Per-load evaluation report exposed by `BlockLoader::get_diagnostics`.

use crate::resources::{LocalModuleEntry, ModuleType};
use crate::sandbox::DependencyReport;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockLoaderDiagnostics {
    pub bundle_url: String,
    pub evaluated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity_sha256: Option<String>,
    pub required_dependencies: Vec<String>,
    pub blocked_dependencies: Vec<String>,
    pub allowed_dependencies: Vec<String>,
    pub local_modules: Vec<LocalModuleDiagnostics>,
}

impl BlockLoaderDiagnostics {
    pub(crate) fn new<'a>(
        bundle_url: String,
        integrity_sha256: Option<String>,
        report: &DependencyReport,
        allowed_dependencies: Vec<String>,
        modules: impl Iterator<Item = &'a LocalModuleEntry>,
    ) -> Self {
        Self {
            bundle_url,
            evaluated_at: Utc::now(),
            integrity_sha256,
            required_dependencies: report.required.clone(),
            blocked_dependencies: report.blocked.clone(),
            allowed_dependencies,
            local_modules: modules.map(LocalModuleDiagnostics::from).collect(),
        }
    }

    pub fn local_module(&self, logical_name: &str) -> Option<&LocalModuleDiagnostics> {
        self.local_modules.iter().find(|m| m.logical_name == logical_name)
    }

    pub fn to_json(&self) -> Result<String, crate::BlockLoaderError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModuleDiagnostics {
    pub logical_name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity_sha256: Option<String>,
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exports: Option<Vec<String>>,
}

impl From<&LocalModuleEntry> for LocalModuleDiagnostics {
    fn from(entry: &LocalModuleEntry) -> Self {
        Self {
            logical_name: entry.logical_name.clone(),
            url: entry.url.clone(),
            module_type: entry.module_type,
            integrity_sha256: entry.integrity_sha256.clone(),
            executed: entry.executed,
            exports: entry.exports.clone(),
        }
    }
}
