//! Plugin and channel listing.

use anyhow::Result;
use canflash::transport::{list_channels, list_plugins};
use console::style;

/// List plugins compiled into this build.
pub(crate) fn cmd_list_plugins(json: bool) -> Result<()> {
    let plugins = list_plugins();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&plugins).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("CAN plugins").bold().underlined());
    for plugin in plugins {
        eprintln!("  {} {}", style("•").green(), style(plugin).cyan());
    }
    Ok(())
}

/// List channels of `plugin`.
pub(crate) fn cmd_list_channels(plugin: &str, json: bool) -> Result<()> {
    let channels = list_channels(plugin)?;

    if json {
        let value = serde_json::json!({
            "plugin": plugin,
            "channels": channels,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style(format!("Channels on {plugin}")).bold().underlined()
    );
    if channels.is_empty() {
        eprintln!("  {}", style("No channels found").dim());
    } else {
        for channel in &channels {
            eprintln!("  {} {}", style("•").green(), style(channel).cyan());
        }
    }
    Ok(())
}
