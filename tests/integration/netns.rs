//! `meshd` in network namespaces, talking over a veth pair.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

/// The two namespace names used throughout tests.
pub const NS_A: &str = "mesh-a";
pub const NS_B: &str = "mesh-b";
pub const VETH_A: &str = "veth-a";
pub const VETH_B: &str = "veth-b";

const API_PORT: u16 = 9101;

/// Daemon tests share the namespaces; run them one at a time.
static DAEMON_LOCK: Mutex<()> = Mutex::new(());

/// Run a command inside a network namespace.
/// Returns stdout as a String on success, error on non-zero exit.
pub fn netns_exec(ns: &str, args: &[&str]) -> Result<String> {
    let output = Command::new("ip")
        .args(["netns", "exec", ns])
        .args(args)
        .output()
        .with_context(|| format!("failed to run: ip netns exec {ns} {args:?}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        bail!(
            "command failed in {ns}: {args:?}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    }
}

/// Check whether the netns environment is up.
pub fn netns_available() -> bool {
    Command::new("ip")
        .args(["netns", "exec", NS_A, "ip", "link", "show"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn meshd_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/meshd")
}

fn skip_unless_ready() -> bool {
    if !netns_available() {
        eprintln!("SKIP: netns not available, run sudo ./scripts/netns-up.sh first");
        return false;
    }
    if !meshd_binary().exists() {
        eprintln!("SKIP: meshd not built, run cargo build -p meshd first");
        return false;
    }
    true
}

/// Start `meshd` on `iface` inside `ns` with the simulated radio.
fn spawn_daemon(ns: &str, iface: &str) -> Result<Child> {
    let config = std::env::temp_dir().join(format!("meshd-{ns}.toml"));
    let binary = meshd_binary();
    Command::new("ip")
        .args(["netns", "exec", ns])
        .arg(&binary)
        .arg(iface)
        .env("MESH_CONFIG", &config)
        .env("MESH_WIFI__PLATFORM", "simulated")
        .env("MESH_NODE__DISPLAY_NAME", ns)
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to start meshd in {ns}"))
}

fn api_get(ns: &str, path: &str) -> Result<serde_json::Value> {
    let url = format!("http://127.0.0.1:{API_PORT}/api{path}");
    let body = netns_exec(ns, &["curl", "-sf", &url])?;
    serde_json::from_str(&body).with_context(|| format!("bad JSON from {url}: {body}"))
}

fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        sleep(Duration::from_millis(250));
    }
    bail!("condition not met within {timeout:?}")
}

/// Verify the namespace environment is set up and interfaces are live.
#[test]
fn test_namespaces_exist() {
    if !netns_available() {
        eprintln!("SKIP: netns not available");
        return;
    }

    let out_a = netns_exec(NS_A, &["ip", "link", "show", VETH_A])
        .expect("veth-a should exist in mesh-a");
    assert!(out_a.contains(VETH_A));
    let out_b = netns_exec(NS_B, &["ip", "link", "show", VETH_B])
        .expect("veth-b should exist in mesh-b");
    assert!(out_b.contains(VETH_B));
}

/// Two daemons discover each other as one-hop neighbours.
#[test]
fn test_daemons_discover_each_other() {
    if !skip_unless_ready() {
        return;
    }
    let _lock = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let mut node_a = spawn_daemon(NS_A, VETH_A).unwrap();
    let mut node_b = spawn_daemon(NS_B, VETH_B).unwrap();

    let result = (|| -> Result<()> {
        wait_for(Duration::from_secs(10), || api_get(NS_A, "/state").is_ok())?;
        wait_for(Duration::from_secs(10), || api_get(NS_B, "/state").is_ok())?;

        let b_addr = api_get(NS_B, "/state")?["addr"]
            .as_str()
            .context("state.addr")?
            .to_string();

        wait_for(Duration::from_secs(15), || {
            api_get(NS_A, "/nodes")
                .map(|v| v["nodes"].as_object().is_some_and(|n| n.contains_key(&b_addr)))
                .unwrap_or(false)
        })?;

        let nodes = api_get(NS_A, "/nodes")?;
        let entry = nodes["nodes"]
            .get(&b_addr)
            .context("B missing from A's route table")?;
        assert_eq!(entry["hop_count"], 1);
        assert_eq!(entry["last_hop"], b_addr.as_str());
        Ok(())
    })();

    node_a.kill().ok();
    node_b.kill().ok();
    result.unwrap();
}
