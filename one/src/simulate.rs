//! Replicate blobs from simulated peers using the real engine and in memory collaborators.
use std::{fmt, future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use rand::{rngs::StdRng, seq::index, Rng, RngCore, SeedableRng};
use replica_core::{BlobId, PeerId};
use replica_metrics::MetricsHandle;
use replica_replication::{
    memory::{MemoryBlobStore, MemoryFeed, MemoryPeer},
    Config, Metrics, PeerRegistry, Replicator,
};
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info, warn};

use crate::{handle_signals, SimulateOpts};

/// Shape of a simulated swarm.
#[derive(Debug, Clone)]
struct Scenario {
    peers: usize,
    blobs: usize,
    blob_size: usize,
    replicas: usize,
    late_blobs: usize,
    stale_percent: u32,
    flaky_peers: usize,
    connect_interval: Duration,
    timeout: Duration,
    seed: u64,
}

impl From<&SimulateOpts> for Scenario {
    fn from(opts: &SimulateOpts) -> Self {
        Self {
            peers: opts.peers,
            blobs: opts.blobs,
            blob_size: opts.blob_size,
            replicas: opts.replicas,
            late_blobs: opts.late_blobs,
            stale_percent: opts.stale_percent.min(100),
            flaky_peers: opts.flaky_peers,
            connect_interval: Duration::from_millis(opts.connect_interval_ms),
            timeout: Duration::from_secs(opts.timeout_secs),
            seed: opts.seed.unwrap_or_else(rand::random),
        }
    }
}

/// Outcome of a simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Report {
    /// Links to blobs published on the feed.
    linked: usize,
    /// Links published by messages too old to be followed.
    stale: usize,
    /// Followed links to blobs only flaky peers hold.
    unreachable: usize,
    /// Blobs that should end up stored.
    expected: usize,
    /// Blobs that did end up stored.
    replicated: usize,
    /// Blobs still on the want-list at the end.
    still_wanted: usize,
    elapsed: Duration,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "linked {} blobs, {} stale, {} unreachable",
            self.linked, self.stale, self.unreachable
        )?;
        write!(
            f,
            "replicated {} of {} reachable blobs in {:?}, {} still wanted",
            self.replicated, self.expected, self.elapsed, self.still_wanted
        )
    }
}

pub(crate) async fn run(opts: SimulateOpts) -> Result<()> {
    let config = opts.replication.config();
    let scenario = Scenario::from(&opts);
    info!(
        seed = scenario.seed,
        peers = scenario.peers,
        blobs = scenario.blobs,
        "starting simulation"
    );
    let metrics = MetricsHandle::register(Metrics::register);

    let (tx, rx) = oneshot::channel();
    let signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;
    let handle = signals.handle();
    debug!("starting signal handler task");
    let signals_handle = tokio::spawn(handle_signals(signals, tx));

    let report = simulate(&scenario, &config, metrics, async {
        // A dropped sender means no signal will come.
        if rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    })
    .await;

    handle.close();
    signals_handle.await?;
    debug!("signal handler stopped");

    let report = report?;
    println!("{report}");
    if opts.print_metrics {
        print!("{}", String::from_utf8_lossy(&MetricsHandle::encode()));
    }
    if report.replicated < report.expected {
        bail!(
            "{} reachable blobs were not replicated",
            report.expected - report.replicated
        );
    }
    Ok(())
}

async fn simulate(
    scenario: &Scenario,
    config: &Config,
    metrics: Metrics,
    shutdown: impl Future<Output = ()>,
) -> Result<Report> {
    let mut rng = StdRng::seed_from_u64(scenario.seed);
    let registry = PeerRegistry::new(config.event_buffer);
    let store = Arc::new(MemoryBlobStore::new());
    let feed = Arc::new(MemoryFeed::new());
    let replicator = Replicator::start(
        config,
        registry.clone(),
        store.clone(),
        feed.clone(),
        metrics,
    );

    let peers: Vec<(PeerId, Arc<MemoryPeer>)> = (0..scenario.peers)
        .map(|i| {
            (
                PeerId::new(format!("@peer-{i}.ed25519")),
                Arc::new(MemoryPeer::new()),
            )
        })
        .collect();
    let flaky = scenario.flaky_peers.min(peers.len());
    for (id, peer) in &peers[..flaky] {
        debug!(peer = %id, "peer transfers will fail");
        peer.fail_transfers(true);
    }

    let mut report = Report::default();
    let now = chrono::Utc::now().timestamp_millis();
    // Keep clear of the boundary, time passes before the links are checked.
    let max_age = i64::try_from(config.max_link_age.as_millis())?.max(4);
    for _ in 0..scenario.blobs {
        let data = random_blob(&mut rng, scenario.blob_size);
        let id = BlobId::for_bytes(&data);
        let holders = index::sample(&mut rng, peers.len(), scenario.replicas.min(peers.len()));
        let mut reachable = false;
        for holder in holders.iter() {
            peers[holder].1.acquire(data.clone());
            reachable |= holder >= flaky;
        }

        report.linked += 1;
        let age = if rng.gen_range(0..100) < scenario.stale_percent {
            report.stale += 1;
            max_age + rng.gen_range(max_age / 2..max_age)
        } else {
            if reachable {
                report.expected += 1;
            } else {
                report.unreachable += 1;
            }
            rng.gen_range(0..max_age / 2)
        };
        // Some messages claim to come from the future.
        let timestamp = if rng.gen_bool(0.1) { now + age } else { now - age };
        feed.publish(id.to_string(), timestamp);
        // Messages also link to other messages, those are not followed.
        if rng.gen_bool(0.2) {
            feed.publish(format!("%reply-{}", rng.next_u64()), now);
        }
    }

    let mut late = Vec::with_capacity(scenario.late_blobs);
    for _ in 0..scenario.late_blobs {
        let data = random_blob(&mut rng, scenario.blob_size);
        feed.publish(BlobId::for_bytes(&data).to_string(), now);
        report.linked += 1;
        if flaky < peers.len() {
            report.expected += 1;
        } else {
            report.unreachable += 1;
        }
        late.push(data);
    }

    let started = Instant::now();
    for (id, peer) in &peers {
        registry.connect(id.clone(), peer.clone());
        tokio::time::sleep(scenario.connect_interval).await;
    }
    // Late blobs reach a healthy peer after it connected, so it announces them.
    if flaky < peers.len() {
        for data in late {
            let holder = rng.gen_range(flaky..peers.len());
            peers[holder].1.acquire(data);
        }
    }

    let expected = report.expected;
    let replicated = async {
        while store.len() < expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::select! {
        _ = replicated => info!(expected, "replicated every reachable blob"),
        _ = tokio::time::sleep(scenario.timeout) => warn!(
            expected,
            replicated = store.len(),
            "timed out"
        ),
        _ = shutdown => info!("interrupted"),
    }

    report.replicated = store.len();
    report.still_wanted = replicator.want_list().len();
    report.elapsed = started.elapsed();
    replicator.shutdown().await?;
    Ok(report)
}

fn random_blob(rng: &mut StdRng, size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size.max(1)];
    rng.fill_bytes(&mut data);
    data
}
