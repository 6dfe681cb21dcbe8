//! Field metadata probing
//!
//! Deployments differ in which optional fields exist on an entity (a
//! customer reference code, a localisation-specific tax id...). Mappings
//! mark such fields as probed; [`FieldProbe`] asks the server once per
//! entity and remembers the answer for the rest of the job.

use std::collections::{HashMap, HashSet};

use log::debug;

use super::client::ErpApi;
use super::error::RpcError;
use super::session::Session;

/// Per-job cache of `fields_get` results
#[derive(Debug, Default)]
pub struct FieldProbe {
    fields: HashMap<String, HashSet<String>>,
}

impl FieldProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache without a server round trip
    pub fn insert(&mut self, entity: &str, fields: impl IntoIterator<Item = String>) {
        self.fields
            .entry(entity.to_string())
            .or_default()
            .extend(fields);
    }

    /// Whether `entity` exposes `field`, asking the server on first use
    pub async fn has_field<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        entity: &str,
        field: &str,
    ) -> Result<bool, RpcError> {
        if !self.fields.contains_key(entity) {
            let names = session.fields_get(entity).await?;
            debug!("Probed {} fields on {}", names.len(), entity);
            self.insert(entity, names);
        }
        Ok(self
            .fields
            .get(entity)
            .is_some_and(|names| names.contains(field)))
    }

    /// Cached answer, if the entity was probed already
    pub fn known(&self, entity: &str, field: &str) -> Option<bool> {
        self.fields.get(entity).map(|names| names.contains(field))
    }
}
