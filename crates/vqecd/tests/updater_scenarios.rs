//! End-to-end update scenarios against scripted VCDS servers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vqec_common::{
    checksum_bytes, write_index_checksum, ChecksumIndex, ConfigKind, ConfigLoader, LiveSystem,
    ResourceVersion, ServerAddr, SharedSystem, SysConfig,
};
use vqecd::updater::testing::{connector_factory, MockConnector, MockLog, MockResolver, Reply};
use vqecd::updater::{ResultCode, ServiceState};
use vqecd::{Updater, UpdaterDeps, UpdaterError};

const NETWORK_CFG: &str = "fec_enable = false\njitter_buffer_ms = 350\n";

fn lineup(names: &[&str]) -> String {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            format!(
                "v=0\r\ns={}\r\nc=IN IP4 239.1.1.{}/255\r\nm=video 50000 RTP/AVP 96\r\n",
                name,
                i + 1
            )
        })
        .collect()
}

fn index_body(attr: Option<&str>, chan: Option<&str>) -> String {
    let mut body = String::from("vcds 3.8.0\n");
    if let Some(attr) = attr {
        body.push_str(&format!("vqec-network-cfg {}\n", checksum_bytes(attr.as_bytes())));
    }
    if let Some(chan) = chan {
        body.push_str(&format!("vqe-channels {}\n", checksum_bytes(chan.as_bytes())));
    }
    body
}

struct Harness {
    dir: TempDir,
    config: SysConfig,
    system: SharedSystem,
    loader: Arc<ConfigLoader>,
    connector: MockConnector,
    log: MockLog,
    updater: Updater,
}

struct Options {
    channel_file: bool,
    interval: u64,
    window: u64,
    resolver: MockResolver,
    seed: Vec<(&'static str, String)>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            channel_file: true,
            interval: 0,
            window: 1,
            resolver: MockResolver::with(vec![ServerAddr::new("vcds1.example.net", 554)]),
            seed: Vec::new(),
        }
    }
}

fn path_str(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

fn harness(options: Options) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let lineup_path = if options.channel_file {
        path_str(root.join("lineup.sdp"))
    } else {
        String::new()
    };
    let startup = format!(
        "domain_name = \"example.net\"\n\
         client_identity = \"stb-1\"\n\
         network_cfg_pathname = {:?}\n\
         channel_lineup_pathname = {:?}\n\
         index_cfg_pathname = {:?}\n\
         update_window_secs = {}\n\
         update_interval_secs = {}\n",
        path_str(root.join("network.toml")),
        lineup_path,
        path_str(root.join("index.json")),
        options.window,
        options.interval,
    );
    let startup_path = root.join("vqec.toml");
    fs::write(&startup_path, startup).unwrap();

    for (name, content) in &options.seed {
        fs::write(root.join(name), content).unwrap();
    }

    let loader = Arc::new(ConfigLoader::new(Some(startup_path)));
    let config = loader.read_merged_config().unwrap();
    let system = LiveSystem::new(config.clone()).into_shared();

    let connector = MockConnector::new();
    let log = connector.log();
    let deps = UpdaterDeps::new(Arc::clone(&system), Arc::clone(&loader))
        .with_resolver(Arc::new(options.resolver))
        .with_connector(connector_factory(connector.clone()));
    let mut updater = Updater::new(deps);
    updater.init(&config).unwrap();

    Harness {
        dir,
        config,
        system,
        loader,
        connector,
        log,
        updater,
    }
}

fn seed_consistent(dir: &Path, network: &str, channels: &str) {
    let index = dir.join("index.json");
    write_index_checksum(
        &index,
        ConfigKind::Network,
        &ResourceVersion::of_bytes(network.as_bytes()),
    )
    .unwrap();
    write_index_checksum(
        &index,
        ConfigKind::Channel,
        &ResourceVersion::of_bytes(channels.as_bytes()),
    )
    .unwrap();
}

#[test]
fn test_fresh_client_fetches_both_resources() {
    let channels = lineup(&["News", "Sports"]);
    let mut h = harness(Options::default());
    h.connector
        .reply_for("vqec-index", Reply::ok(index_body(Some(NETWORK_CFG), Some(&channels))));
    h.connector.reply_for("vqec-network-cfg", Reply::ok(NETWORK_CFG));
    h.connector.reply_for("vqe-channels", Reply::ok(channels.clone()));

    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.index, ResultCode::Ok);
    assert_eq!(outcome.attr, ResultCode::Ok);
    assert_eq!(outcome.chan, ResultCode::Ok);
    assert_eq!(
        h.log.describes(),
        vec![
            "vqec-index/stb-1".to_string(),
            "vqec-network-cfg/stb-1".to_string(),
            "vqe-channels/stb-1".to_string(),
        ]
    );

    let root = h.dir.path();
    assert_eq!(fs::read_to_string(root.join("network.toml")).unwrap(), NETWORK_CFG);
    assert_eq!(fs::read_to_string(root.join("lineup.sdp")).unwrap(), channels);
    let index = ChecksumIndex::load(&root.join("index.json")).unwrap();
    assert_eq!(index.network.as_str(), checksum_bytes(NETWORK_CFG.as_bytes()));
    assert_eq!(index.channel.as_str(), checksum_bytes(channels.as_bytes()));

    let live = h.system.read().unwrap();
    assert!(!live.config().fec_enable);
    assert_eq!(live.config().jitter_buffer_ms, 350);
    assert_eq!(live.channels().channels().len(), 2);
    drop(live);

    let status = h.updater.status();
    assert_eq!(status.state, ServiceState::Initialized);
    assert_eq!(status.last_index_request.vcds_version.as_deref(), Some("3.8.0"));
    assert_eq!(status.total_index_attempts, 1);
    assert_eq!(status.attr.total_update_attempts, 1);
    assert!(status.chan.last_commit_time.is_some());
}

#[test]
fn test_matching_checksums_are_unnecessary() {
    let channels = lineup(&["News"]);
    let mut h = harness(Options {
        seed: vec![
            ("network.toml", NETWORK_CFG.to_string()),
            ("lineup.sdp", channels.clone()),
        ],
        ..Options::default()
    });
    seed_consistent(h.dir.path(), NETWORK_CFG, &channels);
    h.connector
        .reply_for("vqec-index", Reply::ok(index_body(Some(NETWORK_CFG), Some(&channels))));

    for _ in 0..2 {
        let outcome = h.updater.startup_update().unwrap();
        assert_eq!(outcome.attr, ResultCode::Unnecessary);
        assert_eq!(outcome.chan, ResultCode::Unnecessary);
    }
    // Only index requests went out
    assert!(h.log.describes().iter().all(|p| p.starts_with("vqec-index")));
    assert_eq!(h.log.describes().len(), 2);

    let ctx = h.updater.context().unwrap();
    assert_eq!(ctx.attr().total_update_attempts, 2);
    assert_eq!(ctx.attr().total_update_failures, 0);
}

#[test]
fn test_resource_missing_from_index_is_erased() {
    let channels = lineup(&["News"]);
    let mut h = harness(Options {
        seed: vec![
            ("network.toml", NETWORK_CFG.to_string()),
            ("lineup.sdp", channels.clone()),
        ],
        ..Options::default()
    });
    seed_consistent(h.dir.path(), NETWORK_CFG, &channels);
    h.connector
        .reply_for("vqec-index", Reply::ok(index_body(None, Some(&channels))));

    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.attr, ResultCode::Ok);
    assert_eq!(outcome.chan, ResultCode::Unnecessary);
    assert!(!h.dir.path().join("network.toml").exists());
    assert!(!h
        .log
        .describes()
        .iter()
        .any(|p| p.starts_with("vqec-network-cfg")));

    let ctx = h.updater.context().unwrap();
    assert_eq!(ctx.attr().local_version, ResourceVersion::NotAvailable);
    let index = ChecksumIndex::load(&h.dir.path().join("index.json")).unwrap();
    assert_eq!(index.network, ResourceVersion::NotAvailable);
}

#[test]
fn test_erase_lineup_without_cache_file() {
    let channels = lineup(&["News", "Movies"]);
    let mut h = harness(Options {
        channel_file: false,
        ..Options::default()
    });
    h.connector
        .reply_for("vqec-index", Reply::ok(index_body(None, Some(&channels))));
    h.connector.reply_for("vqe-channels", Reply::ok(channels.clone()));

    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.chan, ResultCode::Ok);
    assert_eq!(h.system.read().unwrap().channels().channels().len(), 2);

    h.connector
        .reply_for("vqec-index", Reply::ok(index_body(None, None)));
    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.chan, ResultCode::Ok);
    assert!(h.system.read().unwrap().channels().channels().is_empty());
    assert_eq!(
        h.updater.context().unwrap().chan().local_version,
        ResourceVersion::NotAvailable
    );
}

#[test]
fn test_legacy_server_fallback() {
    let channels = lineup(&["News"]);
    let mut h = harness(Options {
        seed: vec![("network.toml", NETWORK_CFG.to_string())],
        ..Options::default()
    });
    h.connector.reply_for("vqec-index", Reply::status(404, None));
    h.connector.reply_for("vqe-channels", Reply::ok(channels.clone()));

    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.index, ResultCode::OldVersion);
    assert_eq!(outcome.attr, ResultCode::Ok);
    assert_eq!(outcome.chan, ResultCode::Ok);
    assert!(!h.dir.path().join("network.toml").exists());

    // The lineup is fetched again on every pass, without identity
    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.attr, ResultCode::Unnecessary);
    assert_eq!(outcome.chan, ResultCode::Ok);
    let lineup_requests: Vec<String> = h
        .log
        .describes()
        .into_iter()
        .filter(|p| p.starts_with("vqe-channels"))
        .collect();
    assert_eq!(lineup_requests, vec!["vqe-channels".to_string(); 2]);

    let status = h.updater.status();
    assert_eq!(status.total_index_failures, 2);
    assert_eq!(status.chan.total_update_failures, 0);
}

#[test]
fn test_index_failure_skips_resources() {
    let mut h = harness(Options {
        resolver: MockResolver::failing(),
        ..Options::default()
    });
    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.index, ResultCode::ListError);
    assert_eq!(outcome.attr, ResultCode::NotAttempted);
    assert_eq!(outcome.chan, ResultCode::NotAttempted);
    assert!(h.log.connects().is_empty());

    let status = h.updater.status();
    assert_eq!(status.attr.last_update_result, ResultCode::NotAttempted);
    assert_eq!(status.attr.total_update_attempts, 0);
    assert_eq!(status.total_index_failures, 1);
}

#[test]
fn test_rejected_lineup_is_commit_error() {
    let bad = "v=0\r\ns=Broken\r\n";
    let mut h = harness(Options::default());
    h.connector
        .reply_for("vqec-index", Reply::ok(index_body(None, Some(bad))));
    h.connector.reply_for("vqe-channels", Reply::ok(bad));

    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.chan, ResultCode::CommitError);
    assert!(!h.dir.path().join("lineup.sdp").exists());
    let ctx = h.updater.context().unwrap();
    assert_eq!(ctx.chan().total_update_failures, 1);
    assert_eq!(ctx.chan().local_version, ResourceVersion::NotAvailable);
}

#[test]
fn test_init_twice_keeps_state() {
    let channels = lineup(&["News"]);
    let mut h = harness(Options::default());
    h.connector
        .reply_for("vqec-index", Reply::ok(index_body(None, Some(&channels))));
    h.connector.reply_for("vqe-channels", Reply::ok(channels));
    h.updater.startup_update().unwrap();
    let before = h.updater.status();

    assert!(matches!(
        h.updater.init(&h.config),
        Err(UpdaterError::AlreadyInitialized)
    ));
    assert_eq!(h.updater.status(), before);
    assert_eq!(h.updater.context().unwrap().chan().total_update_attempts, 1);
}

#[test]
fn test_corrupted_lineup_is_flagged() {
    let channels = lineup(&["News"]);
    let mut h = harness(Options {
        resolver: MockResolver::failing(),
        seed: vec![("lineup.sdp", "v=0\r\ns=tampered\r\n".to_string())],
        ..Options::default()
    });
    write_index_checksum(
        &h.dir.path().join("index.json"),
        ConfigKind::Channel,
        &ResourceVersion::of_bytes(channels.as_bytes()),
    )
    .unwrap();

    assert!(h.loader.read_cached_lineup(&h.config).is_none());
    h.updater.startup_update().unwrap();
    assert_eq!(h.updater.status().chan.version, ResourceVersion::Corrupted);
}

#[test]
fn test_tampered_network_cfg_refetched_at_startup() {
    let recorded = format!(
        "{{\"network\": \"{}\"}}",
        checksum_bytes(NETWORK_CFG.as_bytes())
    );
    let mut h = harness(Options {
        seed: vec![
            ("network.toml", "fec_enable = true\n".to_string()),
            ("index.json", recorded),
        ],
        ..Options::default()
    });
    assert_eq!(h.updater.status().attr.version, ResourceVersion::Corrupted);

    h.connector
        .reply_for("vqec-index", Reply::ok(index_body(Some(NETWORK_CFG), None)));
    h.connector.reply_for("vqec-network-cfg", Reply::ok(NETWORK_CFG));
    let outcome = h.updater.startup_update().unwrap();
    assert_eq!(outcome.attr, ResultCode::Ok);
    assert_eq!(
        fs::read_to_string(h.dir.path().join("network.toml")).unwrap(),
        NETWORK_CFG
    );
    assert_eq!(
        h.updater.status().attr.version.as_str(),
        checksum_bytes(NETWORK_CFG.as_bytes())
    );
}

#[test]
fn test_unforced_update_ignored_while_polling() {
    let mut h = harness(Options {
        interval: 600,
        window: 1,
        resolver: MockResolver::failing(),
        ..Options::default()
    });
    h.updater.start().unwrap();
    assert_eq!(h.updater.status().state, ServiceState::Running);
    let scheduled = h.updater.status().seconds_until_next_update.unwrap();
    assert!(scheduled >= 590);

    h.updater.update(false);
    thread::sleep(Duration::from_millis(1500));
    let status = h.updater.status();
    assert_eq!(status.total_index_attempts, 0);
    assert!(status.seconds_until_next_update.unwrap() >= 590);

    // A forced update draws from the one-second window and runs at once
    h.updater.update(true);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = h.updater.status();
        if (status.total_index_attempts == 1 && !status.in_progress) || Instant::now() > deadline {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    let status = h.updater.status();
    assert_eq!(status.total_index_attempts, 1);
    assert!(status.seconds_until_next_update.unwrap() >= 590);

    h.updater.deinit();
    let deadline = Instant::now() + Duration::from_secs(3);
    while h.updater.state() != ServiceState::Uninitialized && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(h.updater.state(), ServiceState::Uninitialized);
}
