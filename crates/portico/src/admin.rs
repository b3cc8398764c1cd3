//! Admin CLI command handlers.
//!
//! These use `PorticoClient` against a running daemon's admin listener.

use std::path::Path;

use crate::client::PorticoClient;

// ── Status ──────────────────────────────────────────────────────────

pub fn status(endpoint: &str, json: bool) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let status = client.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let str_at = |pointer: &str| {
        status
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string()
    };
    println!("Portico v{}", str_at("/version"));
    println!("  Domain:    {}", str_at("/canonical_domain"));
    if let Some(secs) = status.get("uptime_secs").and_then(|v| v.as_u64()) {
        println!("  Uptime:    {secs}s");
    }
    println!("  Pairing:   {}", str_at("/pairing/phase"));
    println!("  Root CA:   {}", str_at("/ca/root_fingerprint"));
    println!("  Expires:   {}", str_at("/ca/root_expires_at"));
    if let Some(caps) = status.get("capabilities").and_then(|v| v.as_array()) {
        for cap in caps {
            let name = cap.get("name").and_then(|v| v.as_str()).unwrap_or("?");
            let summary = cap.get("summary").and_then(|v| v.as_str()).unwrap_or("");
            let healthy = cap.get("healthy").and_then(|v| v.as_bool()).unwrap_or(false);
            let marker = if healthy { "+" } else { "-" };
            println!("  [{marker}] {name}:  {summary}");
            if let Some(warnings) = cap.get("warnings").and_then(|v| v.as_array()) {
                for warning in warnings.iter().filter_map(|w| w.as_str()) {
                    println!("        ! {warning}");
                }
            }
        }
    }
    Ok(())
}

// ── Pairing ─────────────────────────────────────────────────────────

pub fn pair(endpoint: &str, json: bool) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let start = client.pair_start()?;
    if json {
        println!(
            "{}",
            serde_json::json!({ "uri": start.uri, "payload": start.payload })
        );
    } else {
        println!("{}", start.qr);
        println!("Scan with the Portico app, or enter:");
        println!("  {}", start.uri);
        println!();
        println!("Then approve the request with `portico pending` and `portico approve <id>`.");
    }
    Ok(())
}

pub fn pair_cancel(endpoint: &str, json: bool) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let cancelled = client.pair_cancel()?;
    if json {
        println!("{}", serde_json::json!({ "cancelled": cancelled }));
    } else if cancelled {
        println!("Pairing cancelled.");
    } else {
        println!("Not discoverable.");
    }
    Ok(())
}

pub fn pending(endpoint: &str, json: bool) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let pending = client.pending()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
    } else if pending.is_empty() {
        println!("No pairing requests awaiting approval.");
    } else {
        println!("{:<14} {:<32} {:<25}", "SESSION", "CLIENT", "EXPIRES");
        for p in &pending {
            println!(
                "{:<14} {:<32} {:<25}",
                p.session_id,
                p.client_name,
                p.expires_at.to_rfc3339()
            );
        }
    }
    Ok(())
}

pub fn approve(endpoint: &str, session_id: &str, json: bool) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let outcome = client.approve(session_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        let name = outcome
            .pointer("/device/name")
            .and_then(|v| v.as_str())
            .unwrap_or("device");
        let id = outcome
            .pointer("/device/id")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        println!("Paired {name} ({id})");
    }
    Ok(())
}

pub fn reject(endpoint: &str, session_id: &str, json: bool) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let outcome = client.reject(session_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("Rejected pairing request {session_id}");
    }
    Ok(())
}

// ── Devices ─────────────────────────────────────────────────────────

pub fn devices(endpoint: &str, json: bool) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let devices = client.devices()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No paired devices.");
    } else {
        println!(
            "{:<30} {:<24} {:<10} {:<25}",
            "ID", "NAME", "STATE", "LAST SEEN"
        );
        for d in &devices {
            let state = if d.is_revoked { "revoked" } else { "active" };
            let last_seen = d
                .last_seen_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!("{:<30} {:<24} {:<10} {:<25}", d.id, d.name, state, last_seen);
        }
    }
    Ok(())
}

pub fn revoke(endpoint: &str, device_id: &str, json: bool) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let device = client.revoke(device_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&device)?);
    } else {
        println!("Revoked {} ({})", device.name, device.id);
    }
    Ok(())
}

// ── CA ──────────────────────────────────────────────────────────────

pub fn ca_export(endpoint: &str, out: Option<&Path>) -> anyhow::Result<()> {
    let client = PorticoClient::new(endpoint);
    let pem = client.root_pem()?;
    match out {
        Some(path) => {
            std::fs::write(path, &pem)?;
            eprintln!("Root certificate written to {}", path.display());
        }
        None => print!("{pem}"),
    }
    Ok(())
}
