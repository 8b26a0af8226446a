//! Local host discovery stage.
//!
//! Nodes on the same host find each other through a shared directory. Each
//! node writes the addresses it listens on to
//! `<path>/<network id>/<public key>.toml` and rewrites the file before its
//! lease runs out. Every node reads the files of the others whose lease is
//! still valid, registers a path to each announced key and routes envelopes
//! for those keys straight to the first announced address.
//!
//! With watching enabled the directory's modification time is polled every
//! five seconds and a change triggers a rescan; otherwise the directory is
//! rescanned on every refresh of the own file.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use skein_core::config::NodeConfig;
use skein_core::{
    Address, Completer, Event, Handler, HandlerContext, HandlerMask, HandlerResult, Message,
    PathId, WeakHandlerContext,
};
use skein_crypto::IdentityPublicKey;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Path id under which peers found on this host are registered.
pub const LOCAL_HOST_DISCOVERY_PATH: PathId = "local-host-discovery";

const FILE_SUFFIX: &str = ".toml";
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Contents of a node's file in the shared directory.
#[derive(Debug, Serialize, Deserialize)]
struct PeerFile {
    addresses: Vec<SocketAddr>,
}

/// Discovery of nodes running on the same host.
pub struct LocalHostDiscovery {
    state: Arc<State>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    directory: PathBuf,
    own_file: PathBuf,
    own_key: IdentityPublicKey,
    lease_time: Duration,
    refresh_interval: Duration,
    watch_enabled: bool,
    routes: DashMap<IdentityPublicKey, SocketAddr>,
}

impl LocalHostDiscovery {
    /// Create the stage for the node owning `own_key`.
    #[must_use]
    pub fn new(config: &NodeConfig, own_key: IdentityPublicKey) -> Self {
        let local = &config.local_host_discovery;
        let directory = local.path.join(config.network_id.to_string());
        let own_file = directory.join(format!("{}{FILE_SUFFIX}", own_key.to_hex()));
        Self {
            state: Arc::new(State {
                directory,
                own_file,
                own_key,
                lease_time: local.lease_time(),
                refresh_interval: local.refresh_interval(),
                watch_enabled: local.watch_enabled,
                routes: DashMap::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Address envelopes for `key` are sent to.
    #[must_use]
    pub fn route(&self, key: &IdentityPublicKey) -> Option<SocketAddr> {
        self.state.routes.get(key).map(|address| *address)
    }

    /// Number of peers found on this host.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.state.routes.len()
    }

    /// File this node announces itself in.
    #[must_use]
    pub fn own_file(&self) -> &Path {
        &self.state.own_file
    }

    /// Whether discovery is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|task| !task.is_finished())
    }

    fn start(&self, ctx: &HandlerContext, listen: SocketAddr) {
        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }
        let addresses = advertised_addresses(listen);
        debug!(
            directory = %self.state.directory.display(),
            ?addresses,
            "starting local host discovery"
        );
        *task = Some(ctx.executors().spawn_independent(run(
            self.state.clone(),
            ctx.downgrade(),
            addresses,
        )));
    }

    fn stop(&self) {
        let Some(task) = lock(&self.task).take() else {
            return;
        };
        debug!("stopping local host discovery");
        task.abort();
        match std::fs::remove_file(&self.state.own_file) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => debug!(file = %self.state.own_file.display(), "unable to delete: {err}"),
        }
    }
}

impl Drop for LocalHostDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Handler for LocalHostDiscovery {
    fn mask(&self) -> HandlerMask {
        HandlerMask::EVENT | HandlerMask::WRITE
    }

    fn on_removed(&self, ctx: &HandlerContext) -> HandlerResult {
        self.stop();
        self.state.clear_routes(ctx);
        Ok(())
    }

    fn on_event(&self, ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        match &event {
            Event::NodeUp {
                address: Some(address),
            } => self.start(ctx, *address),
            Event::NodeUp { address: None } => {
                debug!("no listen address known, not announcing on this host");
            }
            Event::NodeDown | Event::NodeUnrecoverableError { .. } => {
                self.stop();
                self.state.clear_routes(ctx);
            }
            _ => {}
        }
        ctx.pass_event(event, done);
        Ok(())
    }

    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        let routed = match (&recipient, &msg) {
            (Address::Peer(key), Message::Envelope(_)) => self.route(key),
            _ => None,
        };
        match routed {
            Some(address) => {
                trace!(%recipient, %address, "using local host route");
                ctx.pass_outbound(Address::Socket(address), msg, done);
            }
            None => ctx.pass_outbound(recipient, msg, done),
        }
        Ok(())
    }
}

impl State {
    async fn post(&self, addresses: &[SocketAddr]) {
        let contents = match toml::to_string(&PeerFile {
            addresses: addresses.to_vec(),
        }) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("unable to encode peer information: {err}");
                return;
            }
        };
        // Readers never see a half written file: write aside, then rename.
        let staging = self.own_file.with_extension("tmp");
        let written = async {
            fs::write(&staging, contents).await?;
            fs::rename(&staging, &self.own_file).await
        }
        .await;
        match written {
            Ok(()) => trace!(file = %self.own_file.display(), ?addresses, "posted own addresses"),
            Err(err) => warn!(
                file = %self.own_file.display(),
                "unable to write peer information: {err}"
            ),
        }
    }

    fn update_routes(&self, ctx: &HandlerContext, found: HashMap<IdentityPublicKey, SocketAddr>) {
        let outdated: Vec<IdentityPublicKey> = self
            .routes
            .iter()
            .filter(|entry| !found.contains_key(entry.key()))
            .map(|entry| *entry.key())
            .collect();
        for key in outdated {
            debug!(peer = %key, "announcement on this host expired, removing peer");
            self.routes.remove(&key);
            ctx.peers().remove_path(&key, LOCAL_HOST_DISCOVERY_PATH);
        }
        for (key, address) in found {
            if self.routes.insert(key, address).is_none() {
                debug!(peer = %key, %address, "peer found on this host");
                ctx.peers().add_path(key, LOCAL_HOST_DISCOVERY_PATH);
            }
        }
    }

    fn clear_routes(&self, ctx: &HandlerContext) {
        let keys: Vec<IdentityPublicKey> = self.routes.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            ctx.peers().remove_path(&key, LOCAL_HOST_DISCOVERY_PATH);
        }
        self.routes.clear();
    }
}

/// Keep the own file fresh and the routes in sync with the directory until
/// aborted or the pipeline is gone.
async fn run(state: Arc<State>, ctx: WeakHandlerContext, addresses: Vec<SocketAddr>) {
    if let Err(err) = fs::create_dir_all(&state.directory).await {
        warn!(
            directory = %state.directory.display(),
            "discovery directory could not be created: {err}"
        );
        return;
    }
    let mut refresh = time::interval(state.refresh_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watch = time::interval(WATCH_POLL_INTERVAL);
    watch.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_change = None;

    loop {
        let rescan = tokio::select! {
            _ = refresh.tick() => {
                state.post(&addresses).await;
                !state.watch_enabled
            }
            _ = watch.tick(), if state.watch_enabled => {
                let changed = directory_modified(&state.directory).await;
                let rescan = changed.is_none() || changed != last_change;
                last_change = changed;
                rescan
            }
        };
        if !rescan {
            continue;
        }

        let found = match scan_directory(&state.directory, &state.own_key, state.lease_time).await {
            Ok(found) => found,
            Err(err) => {
                warn!(directory = %state.directory.display(), "scan failed: {err}");
                continue;
            }
        };
        let Some(ctx) = ctx.upgrade() else {
            debug!("pipeline gone, local host discovery ends");
            return;
        };
        let task_state = state.clone();
        let executors = ctx.executors().clone();
        executors.spawn_dependent(async move { task_state.update_routes(&ctx, found) });
    }
}

async fn directory_modified(directory: &Path) -> Option<SystemTime> {
    fs::metadata(directory).await.and_then(|meta| meta.modified()).ok()
}

/// Addresses other nodes on this host reach a node listening on `listen`
/// at. A wildcard listen address is announced as loopback.
#[must_use]
pub fn advertised_addresses(listen: SocketAddr) -> Vec<SocketAddr> {
    let ip = match listen.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    vec![SocketAddr::new(ip, listen.port())]
}

/// Peers announced in `directory` whose lease has not run out, each with
/// the first address it announced.
///
/// The own file and files that are not named `<public key>.toml` are
/// ignored. Unreadable or malformed files are logged and skipped.
///
/// # Errors
///
/// Fails if `directory` cannot be listed.
pub async fn scan_directory(
    directory: &Path,
    own_key: &IdentityPublicKey,
    lease_time: Duration,
) -> io::Result<HashMap<IdentityPublicKey, SocketAddr>> {
    let oldest = SystemTime::now()
        .checked_sub(lease_time)
        .unwrap_or(UNIX_EPOCH);
    let mut found = HashMap::new();
    let mut entries = fs::read_dir(directory).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(key) = file_name
            .to_str()
            .and_then(|name| name.strip_suffix(FILE_SUFFIX))
            .and_then(|hex| hex.parse::<IdentityPublicKey>().ok())
        else {
            continue;
        };
        if key == *own_key {
            continue;
        }
        let path = entry.path();
        match read_peer_file(&path, oldest).await {
            Ok(Some(address)) => {
                trace!(peer = %key, %address, file = %path.display(), "found announcement");
                found.insert(key, address);
            }
            Ok(None) => {}
            Err(err) => warn!(file = %path.display(), "unable to read peer information: {err}"),
        }
    }
    Ok(found)
}

async fn read_peer_file(path: &Path, oldest: SystemTime) -> io::Result<Option<SocketAddr>> {
    let modified = fs::metadata(path).await?.modified()?;
    if modified < oldest {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).await?;
    let file: PeerFile = toml::from_str(&contents)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(file.addresses.first().copied())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use skein_core::{EventSink, Executors, Identity, Pipeline, RemoteEnvelope, Services};
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// Records where outbound envelopes went.
    #[derive(Default)]
    struct Network {
        sent: StdMutex<Vec<Address>>,
    }

    impl Handler for Network {
        fn mask(&self) -> HandlerMask {
            HandlerMask::WRITE
        }

        fn on_outbound(
            &self,
            _ctx: &HandlerContext,
            recipient: Address,
            _msg: Message,
            done: Completer,
        ) -> HandlerResult {
            self.sent.lock().unwrap().push(recipient);
            done.complete();
            Ok(())
        }
    }

    struct Harness {
        me: Identity,
        pipeline: Pipeline,
        discovery: Arc<LocalHostDiscovery>,
        network: Arc<Network>,
    }

    fn config(dir: &TempDir) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.local_host_discovery.enabled = true;
        config.local_host_discovery.path = dir.path().to_path_buf();
        config
    }

    impl Harness {
        fn new(config: NodeConfig) -> Self {
            let me = Identity::generate(0);
            let sink: EventSink = Arc::new(|_| {});
            let discovery = Arc::new(LocalHostDiscovery::new(&config, me.public_key()));
            let pipeline = Pipeline::new(Services::new(
                Arc::new(config),
                Arc::new(me.clone()),
                Executors::current().unwrap(),
                sink,
            ));
            let network = Arc::new(Network::default());
            pipeline.add_last("network", network.clone()).unwrap();
            pipeline
                .add_last(LOCAL_HOST_DISCOVERY_PATH, discovery.clone())
                .unwrap();
            Self {
                me,
                pipeline,
                discovery,
                network,
            }
        }
    }

    fn announce(directory: &Path, key: &IdentityPublicKey, addresses: &[&str]) -> PathBuf {
        std::fs::create_dir_all(directory).unwrap();
        let file = directory.join(format!("{}.toml", key.to_hex()));
        let addresses: Vec<SocketAddr> = addresses.iter().map(|a| a.parse().unwrap()).collect();
        std::fs::write(&file, toml::to_string(&PeerFile { addresses }).unwrap()).unwrap();
        file
    }

    async fn eventually(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn test_wildcard_is_announced_as_loopback() {
        assert_eq!(
            advertised_addresses("0.0.0.0:4000".parse().unwrap()),
            ["127.0.0.1:4000".parse().unwrap()]
        );
        assert_eq!(
            advertised_addresses("[::]:4000".parse().unwrap()),
            ["[::1]:4000".parse().unwrap()]
        );
        assert_eq!(
            advertised_addresses("192.0.2.7:4000".parse().unwrap()),
            ["192.0.2.7:4000".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_scan_filters_directory() {
        let dir = TempDir::new().unwrap();
        let own = Identity::generate(0).public_key();
        let (peer, stale) = (
            Identity::generate(0).public_key(),
            Identity::generate(0).public_key(),
        );
        announce(dir.path(), &peer, &["192.0.2.1:1", "192.0.2.2:2"]);
        announce(dir.path(), &own, &["127.0.0.1:9"]);
        let stale_file = announce(dir.path(), &stale, &["192.0.2.3:3"]);
        std::fs::File::options()
            .write(true)
            .open(&stale_file)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();
        std::fs::write(dir.path().join("notes.toml"), "addresses = []").unwrap();
        std::fs::write(dir.path().join(format!("{}.txt", peer.to_hex())), "").unwrap();
        let broken = Identity::generate(0).public_key();
        std::fs::write(dir.path().join(format!("{}.toml", broken.to_hex())), "not toml [").unwrap();

        let found = scan_directory(dir.path(), &own, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(found, HashMap::from([(peer, "192.0.2.1:1".parse().unwrap())]));
    }

    #[tokio::test]
    async fn test_announces_discovers_and_routes() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(config(&dir));
        let peer = Identity::generate(0).public_key();
        announce(&dir.path().join("0"), &peer, &["127.0.0.1:5000"]);

        harness
            .pipeline
            .process_event(Event::NodeUp {
                address: Some("0.0.0.0:4000".parse().unwrap()),
            })
            .await
            .unwrap();
        let peers = harness.pipeline.services().peers().clone();
        eventually(|| peers.has_path(&peer)).await;
        assert!(harness.discovery.is_running());
        assert_eq!(
            peers.paths(&peer),
            [LOCAL_HOST_DISCOVERY_PATH].into()
        );

        let own_file = harness.discovery.own_file().to_path_buf();
        eventually(|| own_file.exists()).await;
        let posted: PeerFile = toml::from_str(&std::fs::read_to_string(&own_file).unwrap()).unwrap();
        assert_eq!(posted.addresses, ["127.0.0.1:4000".parse::<SocketAddr>().unwrap()]);

        let envelope = RemoteEnvelope::discovery(&harness.me, 0, peer, 0).unwrap();
        harness
            .pipeline
            .process_outbound(Address::Peer(peer), Message::Envelope(envelope))
            .await
            .unwrap();
        assert_eq!(
            *harness.network.sent.lock().unwrap(),
            [Address::Socket("127.0.0.1:5000".parse().unwrap())]
        );

        harness.pipeline.process_event(Event::NodeDown).await.unwrap();
        assert!(!harness.discovery.is_running());
        assert!(!own_file.exists());
        assert!(!peers.has_path(&peer));
        assert_eq!(harness.discovery.route_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_peers_pass_through() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(config(&dir));
        let peer = Identity::generate(0).public_key();
        let envelope = RemoteEnvelope::discovery(&harness.me, 0, peer, 0).unwrap();

        harness
            .pipeline
            .process_outbound(Address::Peer(peer), Message::Envelope(envelope))
            .await
            .unwrap();
        assert_eq!(*harness.network.sent.lock().unwrap(), [Address::Peer(peer)]);
    }

    #[tokio::test]
    async fn test_expired_announcement_removes_peer() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.local_host_discovery.watch_enabled = false;
        config.local_host_discovery.lease_time_ms = 1_000;
        let harness = Harness::new(config);
        let peer = Identity::generate(0).public_key();
        announce(&dir.path().join("0"), &peer, &["127.0.0.1:5000"]);

        harness
            .pipeline
            .process_event(Event::NodeUp {
                address: Some("127.0.0.1:4000".parse().unwrap()),
            })
            .await
            .unwrap();
        let peers = harness.pipeline.services().peers().clone();
        eventually(|| peers.has_path(&peer)).await;

        // Never refreshed: gone after the lease and the next one second refresh.
        eventually(|| !peers.has_path(&peer)).await;
        assert!(harness.discovery.route(&peer).is_none());
        harness.pipeline.process_event(Event::NodeDown).await.unwrap();
    }
}
