pub mod azure;

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The two record types this service manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Create-or-update access to the record sets of a DNS zone.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn create_or_update_record_set(
        &self,
        resource_group: &str,
        zone: &str,
        name: &str,
        record_type: RecordType,
        record_set: &RecordSet,
    ) -> Result<RecordSet>;
}

// Azure DNS record set resource (api-version 2018-05-01)

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSet {
    #[allow(dead_code)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[allow(dead_code)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource type, e.g. `Microsoft.Network/dnszones/A`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[allow(dead_code)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub properties: RecordSetProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSetProperties {
    #[serde(rename = "TTL", default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(rename = "ARecords", default, skip_serializing_if = "Option::is_none")]
    pub a_records: Option<Vec<ARecord>>,
    #[serde(rename = "AAAARecords", default, skip_serializing_if = "Option::is_none")]
    pub aaaa_records: Option<Vec<AaaaRecord>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ARecord {
    pub ipv4_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AaaaRecord {
    pub ipv6_address: String,
}

impl RecordSet {
    /// Record type named by the last segment of the resource type.
    pub fn record_type_name(&self) -> Option<&str> {
        let resource_type = self.resource_type.as_deref()?;
        let name = match resource_type.rfind('/') {
            Some(idx) => &resource_type[idx + 1..],
            None => resource_type,
        };
        (!name.is_empty()).then_some(name)
    }

    /// The single address of the given type, if exactly one is present.
    pub fn single_address(&self, record_type: &str) -> Option<&str> {
        match record_type {
            "A" => single(self.properties.a_records.as_deref()).map(|r| r.ipv4_address.as_str()),
            "AAAA" => {
                single(self.properties.aaaa_records.as_deref()).map(|r| r.ipv6_address.as_str())
            }
            _ => None,
        }
    }
}

fn single<T>(records: Option<&[T]>) -> Option<&T> {
    match records? {
        [only] => Some(only),
        _ => None,
    }
}
