//! Hotspot, station and concurrency commands.

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;

use super::http::{base_url, post_json, post_json_body};

#[derive(Deserialize)]
struct HotspotResponse {
    enabled: bool,
    link: Option<String>,
}

#[derive(Deserialize)]
struct ConnectResponse {
    connected: String,
    ssid: String,
}

#[derive(Deserialize)]
struct DisconnectResponse {
    status: String,
}

#[derive(Deserialize)]
struct ProbeResponse {
    concurrency: String,
}

pub async fn cmd_hotspot(port: u16, enabled: bool) -> Result<()> {
    let resp: HotspotResponse = post_json_body(
        &format!("{}/hotspot", base_url(port)),
        &json!({ "enabled": enabled }),
    )
    .await?;

    if resp.enabled {
        println!("Hotspot on.");
        if let Some(link) = resp.link {
            println!("  link: {}", link);
        }
    } else {
        println!("Hotspot off.");
    }
    Ok(())
}

pub async fn cmd_connect(port: u16, link: &str) -> Result<()> {
    let resp: ConnectResponse = post_json_body(
        &format!("{}/connect", base_url(port)),
        &json!({ "link": link }),
    )
    .await?;
    println!("Connected to {} via {}", resp.connected, resp.ssid);
    Ok(())
}

pub async fn cmd_disconnect(port: u16) -> Result<()> {
    let resp: DisconnectResponse =
        post_json(&format!("{}/station/disconnect", base_url(port))).await?;
    println!("Station {}", resp.status.to_lowercase());
    Ok(())
}

pub async fn cmd_probe(port: u16) -> Result<()> {
    let resp: ProbeResponse = post_json(&format!("{}/concurrency/probe", base_url(port))).await?;
    println!("STA/AP concurrency: {}", resp.concurrency);
    Ok(())
}
