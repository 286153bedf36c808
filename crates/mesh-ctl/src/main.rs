//! mesh-ctl: command-line interface for the mesh node daemon.

use anyhow::{Context, Result};

mod cmd;

use cmd::{status, wifi};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: mesh-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status            Show node identity, WiFi roles and routes");
    println!("  nodes             List nodes reachable over the mesh");
    println!("  link              Print the connect link for our hotspot");
    println!("  hotspot on|off    Start or stop the hotspot");
    println!("  connect <link>    Join the hotspot a connect link describes");
    println!("  disconnect        Drop the station connection");
    println!("  probe             Check STA/AP concurrency support");
    println!("  shutdown          Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => status::cmd_status(port).await,
        ["nodes"] => status::cmd_nodes(port).await,
        ["link"] => status::cmd_link(port).await,
        ["shutdown"] => status::cmd_shutdown(port).await,
        ["hotspot", "on"] => wifi::cmd_hotspot(port, true).await,
        ["hotspot", "off"] => wifi::cmd_hotspot(port, false).await,
        ["connect", link] => wifi::cmd_connect(port, link).await,
        ["disconnect"] => wifi::cmd_disconnect(port).await,
        ["probe"] => wifi::cmd_probe(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
