use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use replica_metrics::{register, Recorder};

/// Metrics for blob replication
#[derive(Debug, Clone)]
pub struct Metrics {
    links_seen: Counter,
    links_queued: Counter,
    links_ignored: Family<IgnoredLabels, Counter>,

    queries: Family<ResultLabels, Counter>,
    query_blobs_found: Counter,
    query_blobs_not_found: Counter,

    downloads: Family<ResultLabels, Counter>,
    downloads_active: Gauge,

    scheduler_rejections: Family<JobLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IgnoredLabels {
    reason: &'static str,
}

/// Why the link monitor did not queue a link.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum IgnoreReason {
    NotBlob,
    Owned,
    Stale,
    LookupFailed,
}

impl IgnoreReason {
    fn as_str(self) -> &'static str {
        match self {
            IgnoreReason::NotBlob => "not_blob",
            IgnoreReason::Owned => "owned",
            IgnoreReason::Stale => "stale",
            IgnoreReason::LookupFailed => "lookup_failed",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: &'static str,
}

impl From<&'static str> for ResultLabels {
    fn from(result: &'static str) -> Self {
        Self { result }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct JobLabels {
    job: &'static str,
}

impl Metrics {
    /// Register and construct Metrics
    pub fn register(registry: &mut Registry) -> Self {
        let sub_registry = registry.sub_registry_with_prefix("replication");

        register!(
            links_seen,
            "Number of links observed on the feed",
            Counter::default(),
            sub_registry
        );
        register!(
            links_queued,
            "Number of links queued on the want-list",
            Counter::default(),
            sub_registry
        );
        register!(
            links_ignored,
            "Number of links not queued, by reason",
            Family::<IgnoredLabels, Counter>::default(),
            sub_registry
        );

        register!(
            queries,
            "Number of has queries sent to peers, by result",
            Family::<ResultLabels, Counter>::default(),
            sub_registry
        );
        register!(
            query_blobs_found,
            "Number of blobs a peer reported to have",
            Counter::default(),
            sub_registry
        );
        register!(
            query_blobs_not_found,
            "Number of blobs a peer reported not to have",
            Counter::default(),
            sub_registry
        );

        register!(
            downloads,
            "Number of downloads, by result",
            Family::<ResultLabels, Counter>::default(),
            sub_registry
        );
        register!(
            downloads_active,
            "Number of downloads currently transferring",
            Gauge::default(),
            sub_registry
        );

        register!(
            scheduler_rejections,
            "Number of job triggers dropped because the job was at capacity",
            Family::<JobLabels, Counter>::default(),
            sub_registry
        );

        Self {
            links_seen,
            links_queued,
            links_ignored,
            queries,
            query_blobs_found,
            query_blobs_not_found,
            downloads,
            downloads_active,
            scheduler_rejections,
        }
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    Seen,
    Queued,
    Ignored(IgnoreReason),
}

impl Recorder<LinkEvent> for Metrics {
    fn record(&self, event: &LinkEvent) {
        match event {
            LinkEvent::Seen => self.links_seen.inc(),
            LinkEvent::Queued => self.links_queued.inc(),
            LinkEvent::Ignored(reason) => self
                .links_ignored
                .get_or_create(&IgnoredLabels {
                    reason: reason.as_str(),
                })
                .inc(),
        };
    }
}

#[derive(Debug)]
pub enum QueryEvent {
    Answered { found: u64, not_found: u64 },
    Failed,
}

impl Recorder<QueryEvent> for Metrics {
    fn record(&self, event: &QueryEvent) {
        match event {
            QueryEvent::Answered { found, not_found } => {
                self.queries.get_or_create(&"ok".into()).inc();
                self.query_blobs_found.inc_by(*found);
                self.query_blobs_not_found.inc_by(*not_found);
            }
            QueryEvent::Failed => {
                self.queries.get_or_create(&"error".into()).inc();
            }
        }
    }
}

#[derive(Debug)]
pub enum DownloadEvent {
    Started,
    Succeeded,
    Failed,
}

impl Recorder<DownloadEvent> for Metrics {
    fn record(&self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Started => {
                self.downloads.get_or_create(&"started".into()).inc();
                self.downloads_active.inc();
            }
            DownloadEvent::Succeeded => {
                self.downloads.get_or_create(&"succeeded".into()).inc();
                self.downloads_active.dec();
            }
            DownloadEvent::Failed => {
                self.downloads.get_or_create(&"failed".into()).inc();
                self.downloads_active.dec();
            }
        };
    }
}

#[derive(Debug)]
pub struct SchedulerRejected {
    pub job: &'static str,
}

impl Recorder<SchedulerRejected> for Metrics {
    fn record(&self, event: &SchedulerRejected) {
        self.scheduler_rejections
            .get_or_create(&JobLabels { job: event.job })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use prometheus_client::encoding::text::encode;

    #[test]
    fn events_are_encoded() {
        let mut registry = Registry::default();
        let metrics = Metrics::register(&mut registry);
        metrics.record(&LinkEvent::Seen);
        metrics.record(&LinkEvent::Seen);
        metrics.record(&LinkEvent::Queued);
        metrics.record(&LinkEvent::Ignored(IgnoreReason::Stale));
        metrics.record(&LinkEvent::Ignored(IgnoreReason::NotBlob));
        metrics.record(&QueryEvent::Answered {
            found: 2,
            not_found: 3,
        });
        metrics.record(&QueryEvent::Failed);
        metrics.record(&DownloadEvent::Started);
        metrics.record(&DownloadEvent::Started);
        metrics.record(&DownloadEvent::Started);
        metrics.record(&DownloadEvent::Succeeded);
        metrics.record(&DownloadEvent::Failed);
        metrics.record(&SchedulerRejected { job: "download" });

        let mut text = String::new();
        encode(&mut text, &registry).unwrap();
        for line in [
            "replication_links_seen_total 2",
            "replication_links_queued_total 1",
            "replication_links_ignored_total{reason=\"stale\"} 1",
            "replication_links_ignored_total{reason=\"not_blob\"} 1",
            "replication_queries_total{result=\"ok\"} 1",
            "replication_queries_total{result=\"error\"} 1",
            "replication_query_blobs_found_total 2",
            "replication_query_blobs_not_found_total 3",
            "replication_downloads_total{result=\"started\"} 3",
            "replication_downloads_total{result=\"succeeded\"} 1",
            "replication_downloads_total{result=\"failed\"} 1",
            // Every finished download gives its slot back.
            "replication_downloads_active 1",
            "replication_scheduler_rejections_total{job=\"download\"} 1",
        ] {
            assert!(text.contains(line), "missing {line} in:\n{text}");
        }
    }
}
