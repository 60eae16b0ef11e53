use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use log::{error, info, warn};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ip;
use crate::provider::{ARecord, AaaaRecord, DnsClient, RecordSet, RecordSetProperties, RecordType};

/// TTL applied to every record set this service writes.
pub const RECORD_TTL: u32 = 3600;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// One inbound update as received from the transport.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub name: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub user_agent: Option<String>,
    pub connection_id: Option<String>,
    pub remote_ip: Option<String>,
}

/// Diagnostic metadata stored on each record set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub ua: Option<String>,
    pub id: Option<String>,
    pub ip: Option<String>,
    pub ts: String,
}

impl RecordMetadata {
    fn into_map(self) -> BTreeMap<String, String> {
        [("ua", self.ua), ("id", self.id), ("ip", self.ip), ("ts", Some(self.ts))]
            .into_iter()
            .filter_map(|(key, value)| Some((key.to_string(), value?)))
            .collect()
    }
}

/// Desired state of one record set: a single address plus metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSetDraft {
    pub ttl: u32,
    pub address: IpAddr,
    pub metadata: RecordMetadata,
}

impl RecordSetDraft {
    pub fn new(address: IpAddr, request: &UpdateRequest, now: OffsetDateTime) -> Self {
        let ts = now
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());

        Self {
            ttl: RECORD_TTL,
            address,
            metadata: RecordMetadata {
                ua: request.user_agent.clone(),
                id: request.connection_id.clone(),
                ip: request.remote_ip.clone(),
                ts,
            },
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self.address {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::Aaaa,
        }
    }

    pub fn into_record_set(self) -> RecordSet {
        let mut properties = RecordSetProperties {
            ttl: Some(self.ttl),
            metadata: Some(self.metadata.into_map()),
            ..Default::default()
        };
        match self.address {
            IpAddr::V4(v4) => {
                properties.a_records = Some(vec![ARecord {
                    ipv4_address: v4.to_string(),
                }])
            }
            IpAddr::V6(v6) => {
                properties.aaaa_records = Some(vec![AaaaRecord {
                    ipv6_address: v6.to_string(),
                }])
            }
        }

        RecordSet {
            properties,
            ..Default::default()
        }
    }
}

/// Terminal state of one create-or-update call.
#[derive(Debug)]
pub enum SyncOutcome {
    Succeeded {
        record_type: Option<String>,
        fqdn: Option<String>,
        address: Option<String>,
    },
    Failed(anyhow::Error),
    Cancelled,
}

impl SyncOutcome {
    fn from_result(result: Result<RecordSet>) -> Self {
        match result {
            Ok(set) => {
                let record_type = set.record_type_name().map(str::to_string);
                let address = record_type
                    .as_deref()
                    .and_then(|t| set.single_address(t))
                    .map(str::to_string);
                SyncOutcome::Succeeded {
                    record_type,
                    fqdn: set.properties.fqdn,
                    address,
                }
            }
            Err(e) => SyncOutcome::Failed(e),
        }
    }

    fn log(&self, requested: RecordType, name: &str) {
        match self {
            SyncOutcome::Succeeded {
                record_type,
                fqdn,
                address: Some(address),
            } => {
                info!(
                    target: "sync",
                    "Successfully synchronized {} record set {}: {}",
                    record_type.as_deref().unwrap_or(requested.as_str()),
                    fqdn.as_deref().unwrap_or(name),
                    address
                );
            }
            SyncOutcome::Succeeded {
                record_type,
                fqdn,
                address: None,
            } => {
                warn!(
                    target: "sync",
                    "Synchronized {} record set {} but the result has no single address",
                    record_type.as_deref().unwrap_or("<unknown>"),
                    fqdn.as_deref().unwrap_or(name)
                );
            }
            SyncOutcome::Failed(e) => {
                error!(
                    target: "sync",
                    "Failed to synchronize {} record set {}: {:#}",
                    requested, name, e
                );
            }
            SyncOutcome::Cancelled => {
                warn!(
                    target: "sync",
                    "{} record set synchronization for {} was cancelled",
                    requested, name
                );
            }
        }
    }
}

/// Pushes validated client addresses into the zone as A/AAAA record sets.
#[derive(Clone)]
pub struct Synchronizer {
    client: Arc<dyn DnsClient>,
    resource_group: Arc<str>,
    zone: Arc<str>,
}

impl Synchronizer {
    pub fn new(
        client: Arc<dyn DnsClient>,
        resource_group: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        let resource_group: String = resource_group.into();
        let zone: String = zone.into();
        Self {
            client,
            resource_group: Arc::from(resource_group),
            zone: Arc::from(zone),
        }
    }

    /// Upserts one record set per valid address family and waits for every
    /// dispatched call to finish. Each outcome is logged as it completes.
    ///
    /// Calls run as independent tasks, so they still finish (and log) if the
    /// caller stops waiting; `cancel` is how the caller aborts them.
    pub async fn synchronize(
        &self,
        request: &UpdateRequest,
        cancel: &CancellationToken,
    ) -> Vec<SyncOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut drafts = Vec::with_capacity(2);

        match ip::parse_ipv4(request.ipv4.as_deref()) {
            Ok(Some(v4)) => drafts.push(RecordSetDraft::new(v4.into(), request, now)),
            Ok(None) => {}
            Err(e) => warn!(target: "sync", "{}", e),
        }
        match ip::parse_ipv6(request.ipv6.as_deref()) {
            Ok(Some(v6)) => drafts.push(RecordSetDraft::new(v6.into(), request, now)),
            Ok(None) => {}
            Err(e) => warn!(target: "sync", "{}", e),
        }

        if drafts.is_empty() {
            return Vec::new();
        }

        let tasks: Vec<_> = drafts
            .into_iter()
            .map(|draft| self.dispatch(&request.name, draft, cancel.child_token()))
            .collect();

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(target: "sync", "Synchronization task failed: {}", e);
                    SyncOutcome::Failed(anyhow!("synchronization task failed: {}", e))
                }
            })
            .collect()
    }

    fn dispatch(
        &self,
        name: &str,
        draft: RecordSetDraft,
        cancel: CancellationToken,
    ) -> JoinHandle<SyncOutcome> {
        let client = Arc::clone(&self.client);
        let resource_group = Arc::clone(&self.resource_group);
        let zone = Arc::clone(&self.zone);
        let name = name.to_string();

        tokio::spawn(async move {
            let record_type = draft.record_type();
            let record_set = draft.into_record_set();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => SyncOutcome::Cancelled,
                result = client.create_or_update_record_set(
                    &resource_group,
                    &zone,
                    &name,
                    record_type,
                    &record_set,
                ) => SyncOutcome::from_result(result),
            };

            outcome.log(record_type, &name);
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use log::Level;
    use std::sync::{Mutex, Once};
    use std::thread::ThreadId;
    use time::format_description::well_known::Rfc3339;
    use time::UtcOffset;
    use tokio::sync::Notify;

    /// Records `sync` events per thread; a current-thread test runtime keeps
    /// spawned dispatches on the test's own thread.
    struct CapturingLogger;

    static LOGGER: CapturingLogger = CapturingLogger;
    static EVENTS: Mutex<Vec<(ThreadId, Level, String)>> = Mutex::new(Vec::new());

    impl log::Log for CapturingLogger {
        fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
            metadata.target() == "sync"
        }

        fn log(&self, record: &log::Record<'_>) {
            if self.enabled(record.metadata()) {
                EVENTS.lock().unwrap().push((
                    std::thread::current().id(),
                    record.level(),
                    record.args().to_string(),
                ));
            }
        }

        fn flush(&self) {}
    }

    fn capture_events() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            let _ = log::set_logger(&LOGGER);
            log::set_max_level(log::LevelFilter::Trace);
        });
    }

    fn events(level: Level) -> Vec<String> {
        let thread = std::thread::current().id();
        EVENTS
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, l, _)| *t == thread && *l == level)
            .map(|(_, _, message)| message.clone())
            .collect()
    }

    #[derive(Debug, Clone)]
    struct Call {
        resource_group: String,
        zone: String,
        name: String,
        record_type: RecordType,
        record_set: RecordSet,
    }

    #[derive(Default)]
    struct FakeDns {
        calls: Mutex<Vec<Call>>,
        fail: Option<RecordType>,
        hang: bool,
        panic: bool,
        drop_records: bool,
        started: Notify,
    }

    impl FakeDns {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DnsClient for FakeDns {
        async fn create_or_update_record_set(
            &self,
            resource_group: &str,
            zone: &str,
            name: &str,
            record_type: RecordType,
            record_set: &RecordSet,
        ) -> Result<RecordSet> {
            self.calls.lock().unwrap().push(Call {
                resource_group: resource_group.to_string(),
                zone: zone.to_string(),
                name: name.to_string(),
                record_type,
                record_set: record_set.clone(),
            });
            self.started.notify_one();

            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.panic {
                panic!("backend client bug");
            }
            if self.fail == Some(record_type) {
                anyhow::bail!("zone {} is locked", zone);
            }

            let mut result = record_set.clone();
            result.resource_type = Some(format!("Microsoft.Network/dnszones/{}", record_type));
            result.properties.fqdn = Some(format!("{}.{}.", name, zone));
            if self.drop_records {
                result.properties.a_records = None;
                result.properties.aaaa_records = None;
            }
            Ok(result)
        }
    }

    fn synchronizer(dns: &Arc<FakeDns>) -> Synchronizer {
        Synchronizer::new(dns.clone(), "dns-rg", "example.com")
    }

    fn request(ipv4: &str, ipv6: &str) -> UpdateRequest {
        UpdateRequest {
            name: "home".into(),
            ipv4: Some(ipv4.into()),
            ipv6: Some(ipv6.into()),
            user_agent: Some("curl/8.4.0".into()),
            connection_id: Some("0HN1D2E3F4G5H".into()),
            remote_ip: Some("198.51.100.7".into()),
        }
    }

    fn without_timestamp(mut set: RecordSet) -> RecordSet {
        if let Some(metadata) = set.properties.metadata.as_mut() {
            metadata.remove("ts");
        }
        set
    }

    #[tokio::test]
    async fn no_addresses_means_no_calls() {
        let dns = Arc::new(FakeDns::default());
        let sync = synchronizer(&dns);

        let outcomes = sync
            .synchronize(&UpdateRequest::default(), &CancellationToken::new())
            .await;
        assert!(outcomes.is_empty());

        let outcomes = sync
            .synchronize(&request("", "  "), &CancellationToken::new())
            .await;
        assert!(outcomes.is_empty());
        assert!(dns.calls().is_empty());
    }

    #[tokio::test]
    async fn ipv4_only_dispatches_single_a_record() {
        let dns = Arc::new(FakeDns::default());

        let outcomes = synchronizer(&dns)
            .synchronize(&request("203.0.113.5", ""), &CancellationToken::new())
            .await;

        let calls = dns.calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.resource_group, "dns-rg");
        assert_eq!(call.zone, "example.com");
        assert_eq!(call.name, "home");
        assert_eq!(call.record_type, RecordType::A);

        let props = &call.record_set.properties;
        assert_eq!(props.ttl, Some(RECORD_TTL));
        assert_eq!(
            props.a_records,
            Some(vec![ARecord { ipv4_address: "203.0.113.5".into() }])
        );
        assert!(props.aaaa_records.is_none());

        let metadata = props.metadata.as_ref().unwrap();
        assert_eq!(metadata["ua"], "curl/8.4.0");
        assert_eq!(metadata["id"], "0HN1D2E3F4G5H");
        assert_eq!(metadata["ip"], "198.51.100.7");
        let ts = time::OffsetDateTime::parse(&metadata["ts"], &Rfc3339).unwrap();
        assert_eq!(ts.offset(), UtcOffset::UTC);

        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            SyncOutcome::Succeeded { record_type, fqdn, address } => {
                assert_eq!(record_type.as_deref(), Some("A"));
                assert_eq!(fqdn.as_deref(), Some("home.example.com."));
                assert_eq!(address.as_deref(), Some("203.0.113.5"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_ipv4_does_not_block_ipv6() {
        capture_events();
        let dns = Arc::new(FakeDns::default());

        let outcomes = synchronizer(&dns)
            .synchronize(&request("not-an-ip", "::1"), &CancellationToken::new())
            .await;

        let calls = dns.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].record_type, RecordType::Aaaa);
        assert_eq!(
            calls[0].record_set.properties.aaaa_records,
            Some(vec![AaaaRecord { ipv6_address: "::1".into() }])
        );
        assert!(matches!(
            &outcomes[..],
            [SyncOutcome::Succeeded { address: Some(a), .. }] if a == "::1"
        ));
        assert_eq!(events(Level::Warn), vec!["not-an-ip is not a valid IPv4".to_string()]);
        assert_eq!(events(Level::Info).len(), 1);
    }

    #[tokio::test]
    async fn both_families_get_separate_drafts() {
        let dns = Arc::new(FakeDns::default());

        let outcomes = synchronizer(&dns)
            .synchronize(&request(" 203.0.113.5 ", "2001:db8::5"), &CancellationToken::new())
            .await;

        let mut types: Vec<_> = dns.calls().iter().map(|c| c.record_type).collect();
        types.sort_by_key(|t| t.as_str());
        assert_eq!(types, vec![RecordType::A, RecordType::Aaaa]);

        for call in dns.calls() {
            let props = &call.record_set.properties;
            let addresses = props.a_records.as_ref().map_or(0, Vec::len)
                + props.aaaa_records.as_ref().map_or(0, Vec::len);
            assert_eq!(addresses, 1);
        }
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn repeated_updates_send_equal_drafts() {
        let dns = Arc::new(FakeDns::default());
        let sync = synchronizer(&dns);
        let req = request("203.0.113.5", "");

        sync.synchronize(&req, &CancellationToken::new()).await;
        sync.synchronize(&req, &CancellationToken::new()).await;

        let calls = dns.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            without_timestamp(calls[0].record_set.clone()),
            without_timestamp(calls[1].record_set.clone())
        );
    }

    #[tokio::test]
    async fn backend_failure_is_reported_once() {
        capture_events();
        let dns = Arc::new(FakeDns {
            fail: Some(RecordType::A),
            ..Default::default()
        });

        let outcomes = synchronizer(&dns)
            .synchronize(&request("203.0.113.5", "::1"), &CancellationToken::new())
            .await;

        assert_eq!(dns.calls().len(), 2);
        let failures: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                SyncOutcome::Failed(e) => Some(e.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec!["zone example.com is locked".to_string()]);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, SyncOutcome::Succeeded { record_type: Some(t), .. } if t == "AAAA")));
        assert!(!outcomes.iter().any(|o| matches!(o, SyncOutcome::Cancelled)));

        let errors = events(Level::Error);
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("A record set home"));
        assert!(errors[0].contains("zone example.com is locked"));
        assert_eq!(events(Level::Info).len(), 1);
        assert!(events(Level::Warn).is_empty());
    }

    #[tokio::test]
    async fn panicking_dispatch_is_logged_once_as_failure() {
        capture_events();
        let dns = Arc::new(FakeDns {
            panic: true,
            ..Default::default()
        });

        let outcomes = synchronizer(&dns)
            .synchronize(&request("203.0.113.5", ""), &CancellationToken::new())
            .await;

        assert!(matches!(&outcomes[..], [SyncOutcome::Failed(_)]));
        assert_eq!(events(Level::Error).len(), 1);
        assert!(events(Level::Warn).is_empty());
    }

    #[tokio::test]
    async fn cancellation_while_in_flight_is_reported_once() {
        capture_events();
        let dns = Arc::new(FakeDns {
            hang: true,
            ..Default::default()
        });
        let sync = synchronizer(&dns);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.synchronize(&request("203.0.113.5", ""), &cancel).await })
        };
        dns.started.notified().await;
        cancel.cancel();

        let outcomes = task.await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], SyncOutcome::Cancelled));
        assert_eq!(dns.calls().len(), 1);

        let warnings = events(Level::Warn);
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(warnings[0].contains("was cancelled"));
        assert!(events(Level::Error).is_empty());
    }

    #[tokio::test]
    async fn already_cancelled_request_skips_backend() {
        let dns = Arc::new(FakeDns::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = synchronizer(&dns)
            .synchronize(&request("203.0.113.5", "::1"), &cancel)
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(o, SyncOutcome::Cancelled)));
        assert!(dns.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_address_in_result_is_degraded_success() {
        let dns = Arc::new(FakeDns {
            drop_records: true,
            ..Default::default()
        });

        let outcomes = synchronizer(&dns)
            .synchronize(&request("", "::1"), &CancellationToken::new())
            .await;

        assert!(matches!(
            &outcomes[..],
            [SyncOutcome::Succeeded { record_type: Some(t), address: None, .. }] if t == "AAAA"
        ));
    }

    #[test]
    fn metadata_omits_absent_values() {
        let request = UpdateRequest {
            user_agent: Some("router".into()),
            ..Default::default()
        };
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let draft = RecordSetDraft::new("192.0.2.1".parse().unwrap(), &request, now);

        assert_eq!(draft.metadata.ts, "2023-11-14T22:13:20Z");
        let metadata = draft.into_record_set().properties.metadata.unwrap();
        assert_eq!(metadata.keys().collect::<Vec<_>>(), vec!["ts", "ua"]);
    }
}
