//! ZFS user-property verbs: `pool.dataset.{set,get,get_all,inherit,clear}
//! _user_prop` and property-based search. spec.md §4.1, §4.2.

use std::collections::HashMap;

use super::client::Client;
use super::error::ApplianceError;

impl Client {
    pub async fn property_set(&self, dataset: &str, key: &str, value: &str) -> Result<(), ApplianceError> {
        self.call("pool.dataset.set_user_prop", (dataset, key, value)).await
    }

    pub async fn property_set_all(&self, dataset: &str, props: &HashMap<String, String>) -> Result<(), ApplianceError> {
        for (k, v) in props {
            self.property_set(dataset, k, v).await?;
        }
        Ok(())
    }

    pub async fn property_get(&self, dataset: &str, key: &str) -> Result<Option<String>, ApplianceError> {
        match self.call::<_, String>("pool.dataset.get_user_prop", (dataset, key)).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn property_get_all(&self, dataset: &str) -> Result<HashMap<String, String>, ApplianceError> {
        self.call("pool.dataset.get_user_props", (dataset,)).await
    }

    pub async fn property_inherit(&self, dataset: &str, key: &str) -> Result<(), ApplianceError> {
        self.call("pool.dataset.inherit_user_prop", (dataset, key)).await
    }

    pub async fn property_clear(&self, dataset: &str, keys: &[&str]) -> Result<(), ApplianceError> {
        for key in keys {
            self.property_inherit(dataset, key).await?;
        }
        Ok(())
    }

    /// Property-search fallback for legacy volume IDs (spec.md §4.3.2,
    /// §9 "ID schemes").
    pub async fn find_by_property(&self, key: &str, value: &str) -> Result<Vec<String>, ApplianceError> {
        self.call("pool.dataset.query_by_user_prop", (key, value)).await
    }

    pub async fn find_by_csi_name(&self, csi_volume_name: &str) -> Result<Vec<String>, ApplianceError> {
        self.find_by_property("csi:csi_volume_name", csi_volume_name).await
    }
}
