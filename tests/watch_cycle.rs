use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp_vector_search::config;
use mcp_vector_search::embed::HashedBowEmbedder;
use mcp_vector_search::system::System;
use mcp_vector_search::watch;

/// Poll until `check` passes or the deadline expires. Debounce plus OS
/// watcher latency makes exact timing assertions pointless.
fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("timed out waiting for: {what}");
}

/// Create → modify → delete cycle against a live watcher.
#[test]
fn watch_keeps_the_index_consistent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        "model = \"bow\"\nwatch = true\n\n[[sources]]\npath = \"{}/*.md\"\n",
        dir.path().display()
    );
    let cfg = config::parse(&toml).expect("config");
    let system = Arc::new(System::new(cfg, Box::new(HashedBowEmbedder::new())));
    system.ingest_all();

    let handle = watch::start(Arc::clone(&system)).expect("watcher starts");
    let no_filters: BTreeMap<String, String> = BTreeMap::new();

    // Create: the file becomes searchable after the debounce interval.
    let file = dir.path().join("a.md");
    std::fs::write(&file, "alpha").unwrap();
    wait_for("created file to be indexed", || {
        let hits = system.search("alpha", 1, &no_filters).expect("search");
        hits.first().map(|h| h.text == "alpha").unwrap_or(false)
    });

    // Modify: no stale "alpha" row may remain once the update lands.
    std::fs::write(&file, "beta").unwrap();
    wait_for("modified file to replace its rows", || {
        let hits = system.search("alpha beta", 10, &no_filters).expect("search");
        hits.len() == 1 && hits[0].text == "beta"
    });

    // Delete: all rows for the file id disappear.
    std::fs::remove_file(&file).unwrap();
    wait_for("deleted file to leave the index", || {
        system.search("beta", 10, &no_filters).expect("search").is_empty()
    });

    let watch_stats = system
        .resource_json("ingestion://watch-stats")
        .expect("watch stats");
    let entry = &watch_stats["sources"][0];
    assert_eq!(entry["watching"], true);
    assert!(entry["events_seen"].as_u64().expect("events") >= 1);

    handle.stop();

    // Stopped watcher: new events are ignored.
    std::fs::write(dir.path().join("late.md"), "late content").unwrap();
    std::thread::sleep(Duration::from_millis(1200));
    assert!(system
        .search("late content", 10, &no_filters)
        .expect("search")
        .is_empty());
}
