use anyhow::{bail, Context, Result};
use std::io::Read;

use crate::rpc::{error_reply, list_methods, ControlPlane, Method};
use crate::watchdog::sites::{normalize_content, site_line_for_domain};
use crate::watchdog::{group_by_region, Whitelist};
use crate::{PeerCommands, RpcCommands, SiteCommands};

/// `vpn-watchdog run`: one pass, printing the narration.
pub async fn handle_run(
    plane: &ControlPlane,
    dry_run: bool,
    scheduled: bool,
    json: bool,
) -> Result<()> {
    let result = if scheduled {
        match plane.coordinator() {
            Ok(coordinator) => coordinator.run_scheduled().await,
            Err(e) if !plane.config().enabled => {
                tracing::debug!("{e:#}");
                println!("watchdog disabled");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    } else {
        plane.run_now(dry_run).await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !result.output.is_empty() {
        println!("{}", result.output);
    }
    match result.error {
        Some(err) if !result.ok => bail!(err),
        _ => Ok(()),
    }
}

/// `vpn-watchdog status`
pub fn handle_status(plane: &ControlPlane, json: bool) -> Result<()> {
    let status = plane.get_status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    let on_off = |b: bool| if b { "enabled" } else { "disabled" };
    println!("  {:<16} {}", "watchdog", on_off(status.enabled));
    println!(
        "  {:<16} {} ({})",
        "cron",
        on_off(status.cron_enabled),
        status.schedule
    );
    println!("  {:<16} {}", "polling iface", status.polling_iface);
    println!("  {:<16} {}", "sites file", status.sites_file);
    println!("  {:<16} {}", "log", status.log_path);
    println!("  {:<16} {}", "binary", status.script_path);
    Ok(())
}

/// `vpn-watchdog log [--lines N]`
pub async fn handle_log(plane: &ControlPlane, lines: Option<usize>) -> Result<()> {
    let reply = plane.get_log(lines).await?;
    if reply.lines.is_empty() {
        println!("(log {} is empty)", reply.path);
    } else {
        println!("{}", reply.lines);
    }
    Ok(())
}

/// `vpn-watchdog peers <subcommand>`
pub async fn handle_peers_command(plane: &ControlPlane, command: PeerCommands) -> Result<()> {
    match command {
        PeerCommands::List => list_peers(plane).await,
        PeerCommands::Allow { ids } => save_whitelist(plane, &ids).await,
        PeerCommands::AllowAll => save_whitelist(plane, &[]).await,
    }
}

async fn list_peers(plane: &ControlPlane) -> Result<()> {
    let reply = plane.get_peers().await?;
    if reply.peers.is_empty() {
        println!("No peers configured.");
        return Ok(());
    }
    let whitelist: &Whitelist = &reply.whitelist;
    if whitelist.is_unrestricted() {
        println!("Whitelist: all peers allowed");
    } else {
        println!("Whitelist: {}", whitelist.ids().join(", "));
    }
    println!();

    for group in group_by_region(&reply.peers) {
        println!(
            "{}",
            console::style(group.region.as_deref().unwrap_or("(no region)")).bold()
        );
        for peer in &group.peers {
            let mark = if whitelist.allows(&peer.id) {
                console::style("\u{2713}").green().bold()
            } else {
                console::style("\u{2717}").red().bold()
            };
            println!(
                "  {mark} {:<20} {:<28} {}",
                peer.id, peer.endpoint, peer.description
            );
        }
    }
    Ok(())
}

async fn save_whitelist(plane: &ControlPlane, ids: &[String]) -> Result<()> {
    let ack = plane.set_peer_whitelist(ids).await;
    if let Some(err) = ack.error {
        bail!(err);
    }
    if ids.is_empty() {
        println!("Whitelist cleared: all peers allowed.");
    } else {
        println!("Whitelist saved ({} peer(s)).", ids.len());
    }
    Ok(())
}

/// `vpn-watchdog sites <subcommand>`
pub async fn handle_sites_command(plane: &ControlPlane, command: SiteCommands) -> Result<()> {
    match command {
        SiteCommands::Show => {
            let reply = plane.get_sites().await?;
            print!("{}", reply.content);
            Ok(())
        }
        SiteCommands::Set { file } => {
            let content = if file.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?
            };
            write_sites(plane, &content).await
        }
        SiteCommands::Add { domains } => {
            let mut content = normalize_content(&plane.get_sites().await?.content);
            for domain in &domains {
                content.push_str(&site_line_for_domain(domain));
                content.push('\n');
            }
            write_sites(plane, &content).await
        }
    }
}

async fn write_sites(plane: &ControlPlane, content: &str) -> Result<()> {
    let ack = plane.set_sites(content).await;
    if let Some(err) = ack.error {
        bail!(err);
    }
    println!(
        "  {} Site list saved to {}",
        console::style("\u{2713}").green().bold(),
        plane.config().sites_file.display()
    );
    Ok(())
}

/// `vpn-watchdog apply-cron`
pub async fn handle_apply_cron(plane: &ControlPlane) -> Result<()> {
    let ack = plane.apply_cron().await;
    if let Some(err) = ack.error {
        bail!(err);
    }
    if plane.config().cron_enabled {
        println!("Cron schedule applied.");
    } else {
        println!("Cron disabled: watchdog entry removed.");
    }
    Ok(())
}

/// `vpn-watchdog rpc list|call`: the rpcd exec protocol.
///
/// `call` reads its JSON arguments from stdin and always prints a JSON
/// object, even on failure.
pub async fn handle_rpc_command(plane: &ControlPlane, command: RpcCommands) -> Result<()> {
    match command {
        RpcCommands::List => {
            println!("{}", list_methods());
        }
        RpcCommands::Call { method } => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            let reply = match dispatch(plane, &method, &input).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(%method, "rpc call failed: {e:#}");
                    error_reply(&e)
                }
            };
            println!("{reply}");
        }
    }
    Ok(())
}

async fn dispatch(plane: &ControlPlane, method: &str, input: &str) -> Result<serde_json::Value> {
    let method: Method = method.parse()?;
    let args = if input.trim().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(input).context("arguments are not valid JSON")?
    };
    plane.call(method, args).await
}
