//! JSON configuration bundles used to author data sources and sync
//! configurations without the web UI.
//!
//! ```json
//! {
//!   "data_sources": [
//!     { "id": "crm", "name": "CRM", "db_type": "postgresql",
//!       "host": "db.internal", "database": "crm",
//!       "username": "reader", "password": "..." }
//!   ],
//!   "sync_configs": [
//!     { "id": "crm-nightly", "name": "CRM nightly", "data_source_id": "crm",
//!       "schedule": { "type": "daily" }, "sync_mode": "incremental",
//!       "output_path": "./output", "output_file_name": "crm.jsonl",
//!       "tables": [
//!         { "id": "t-users", "source_table": "users",
//!           "incremental_column": "updated_at",
//!           "columns": [
//!             { "id": "c-id", "source_column": "id", "is_primary_key": true },
//!             { "id": "c-email", "source_column": "email", "masking_type": "hash" }
//!           ] }
//!       ] }
//!   ]
//! }
//! ```

use crate::models::{DataSource, SyncConfig, SyncMode, TableConfig};
use crate::{Result, SentinelError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A sync configuration with its tables nested inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundledSyncConfig {
    #[serde(flatten)]
    pub config: SyncConfig,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// A set of configuration entities imported together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigBundle {
    #[serde(default)]
    pub data_sources: Vec<DataSource>,
    #[serde(default)]
    pub sync_configs: Vec<BundledSyncConfig>,
}

/// Counts of imported entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub data_sources: usize,
    pub sync_configs: usize,
    pub tables: usize,
    pub columns: usize,
}

impl ConfigBundle {
    /// Parses, normalizes, and validates a bundle.
    ///
    /// # Errors
    /// Returns a serialization error for malformed JSON and a configuration
    /// error for bundles that violate the model's invariants.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut bundle: Self = serde_json::from_str(text)
            .map_err(|e| SentinelError::serialization("Failed to parse configuration bundle", e))?;
        bundle.normalize();
        bundle.validate()?;
        Ok(bundle)
    }

    /// Fills in parent identifiers omitted from nested entries.
    pub fn normalize(&mut self) {
        for bundled in &mut self.sync_configs {
            for table in &mut bundled.tables {
                table.sync_config_id.clone_from(&bundled.config.id);
                for column in &mut table.columns {
                    column.table_config_id.clone_from(&table.id);
                }
            }
        }
    }

    /// Checks references, schedules, and incremental watermark columns.
    ///
    /// Data sources referenced but not contained in the bundle are checked
    /// by the store at import time.
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for source in &self.data_sources {
            if !ids.insert(("data_source", source.id.as_str())) {
                return Err(SentinelError::configuration(format!(
                    "Duplicate data source id '{}'",
                    source.id
                )));
            }
        }

        for bundled in &self.sync_configs {
            let config = &bundled.config;
            if !ids.insert(("sync_config", config.id.as_str())) {
                return Err(SentinelError::configuration(format!(
                    "Duplicate sync configuration id '{}'",
                    config.id
                )));
            }
            crate::scheduler::resolve_recurrence(&config.schedule)?;

            for table in &bundled.tables {
                if !ids.insert(("table", table.id.as_str())) {
                    return Err(SentinelError::configuration(format!(
                        "Duplicate table configuration id '{}'",
                        table.id
                    )));
                }
                if config.sync_mode == SyncMode::Incremental
                    && table.is_active
                    && table.incremental_column.is_none()
                {
                    return Err(SentinelError::configuration(format!(
                        "Table '{}' of incremental configuration '{}' has no watermark column",
                        table.qualified_name(),
                        config.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Data source ids referenced by sync configurations but not defined here.
    pub fn external_sources(&self) -> Vec<&str> {
        let defined: HashSet<&str> = self.data_sources.iter().map(|s| s.id.as_str()).collect();
        let mut missing: Vec<&str> = self
            .sync_configs
            .iter()
            .map(|b| b.config.data_source_id.as_str())
            .filter(|id| !defined.contains(id))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    /// Entity counts.
    pub fn summary(&self) -> ImportSummary {
        let tables = self.sync_configs.iter().flat_map(|b| &b.tables);
        ImportSummary {
            data_sources: self.data_sources.len(),
            sync_configs: self.sync_configs.len(),
            tables: tables.clone().count(),
            columns: tables.map(|t| t.columns.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MaskingType, Schedule};

    const BUNDLE: &str = r#"{
        "data_sources": [
            { "id": "crm", "name": "CRM", "db_type": "postgresql",
              "host": "db.internal", "database": "crm",
              "username": "reader", "password": "pw" }
        ],
        "sync_configs": [
            { "id": "crm-nightly", "name": "CRM nightly", "data_source_id": "crm",
              "schedule": { "type": "cron", "expression": "30 2 * * 1-5" },
              "sync_mode": "incremental",
              "output_path": "./output", "output_file_name": "crm.jsonl",
              "tables": [
                { "id": "t-users", "source_table": "users",
                  "incremental_column": "updated_at",
                  "columns": [
                    { "id": "c-id", "source_column": "id", "is_primary_key": true },
                    { "id": "c-email", "source_column": "email", "masking_type": "hash" }
                  ] }
              ] }
        ]
    }"#;

    #[test]
    fn test_bundle_parses_and_normalizes() -> Result<()> {
        let bundle = ConfigBundle::from_json(BUNDLE)?;
        let config = &bundle.sync_configs[0];
        assert_eq!(
            config.config.schedule,
            Schedule::Cron {
                expression: "30 2 * * 1-5".to_string()
            }
        );
        let table = &config.tables[0];
        assert_eq!(table.sync_config_id, "crm-nightly");
        assert_eq!(table.columns[1].table_config_id, "t-users");
        assert_eq!(table.columns[1].masking_type, MaskingType::Hash);
        assert_eq!(bundle.data_sources[0].password.as_deref(), Some("pw"));
        assert_eq!(
            bundle.summary(),
            ImportSummary {
                data_sources: 1,
                sync_configs: 1,
                tables: 1,
                columns: 2
            }
        );
        assert!(bundle.external_sources().is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let text = BUNDLE.replace("30 2 * * 1-5", "every tuesday");
        assert!(ConfigBundle::from_json(&text).is_err());
    }

    #[test]
    fn test_incremental_table_requires_watermark() {
        let text = BUNDLE.replace(r#""incremental_column": "updated_at","#, "");
        let err = ConfigBundle::from_json(&text).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_external_sources_listed() -> Result<()> {
        let text = BUNDLE.replace(r#""data_source_id": "crm""#, r#""data_source_id": "erp""#);
        let bundle = ConfigBundle::from_json(&text)?;
        assert_eq!(bundle.external_sources(), vec!["erp"]);
        Ok(())
    }
}
