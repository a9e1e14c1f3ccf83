//! Control Console
//!
//! Line-oriented stand-in for the status bar UI. Reads commands from
//! stdin and prints results; status changes are printed as they happen.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tunnels_vpn::{RegionId, StatusEvent, VpnController, VpnError, WhitelistSource};

const HELP: &str = "\
commands:
  connect | disconnect | status | wake
  list                         whitelist entries
  add <domain> | remove <domain>
  toggle <confirmed|user> <domain> <on|off>
  region [code] | regions
  require-vpn <on|off>
  quit";

/// A parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    Status,
    Wake,
    List,
    Add(String),
    Remove(String),
    Toggle(WhitelistSource, String, bool),
    Region(Option<RegionId>),
    Regions,
    RequireVpn(bool),
    Help,
    Quit,
}

impl std::str::FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["connect"] => Command::Connect,
            ["disconnect"] => Command::Disconnect,
            ["status"] => Command::Status,
            ["wake"] => Command::Wake,
            ["list"] => Command::List,
            ["add", domain] => Command::Add(domain.to_string()),
            ["remove", domain] => Command::Remove(domain.to_string()),
            ["toggle", source, domain, state] => {
                Command::Toggle(parse_source(source)?, domain.to_string(), parse_switch(state)?)
            }
            ["region"] => Command::Region(None),
            ["region", code] => Command::Region(Some(code.parse().map_err(|e| format!("{}", e))?)),
            ["regions"] => Command::Regions,
            ["require-vpn", state] => Command::RequireVpn(parse_switch(state)?),
            ["help"] | ["?"] => Command::Help,
            ["quit"] | ["exit"] => Command::Quit,
            _ => return Err(format!("unknown command {:?}, try help", line.trim())),
        };
        Ok(command)
    }
}

fn parse_source(word: &str) -> Result<WhitelistSource, String> {
    match word {
        "confirmed" => Ok(WhitelistSource::Confirmed),
        "user" => Ok(WhitelistSource::User),
        other => Err(format!("unknown list {:?}", other)),
    }
}

fn parse_switch(word: &str) -> Result<bool, String> {
    match word {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        other => Err(format!("expected on/off, got {:?}", other)),
    }
}

pub fn format_status(event: &StatusEvent) -> String {
    format!(
        "tunnel {} | proxy {} | wanted {}",
        event.tunnel,
        if event.proxy_active { "on" } else { "off" },
        event.desired
    )
}

/// Run one command. Returns false when the console should exit.
async fn execute(vpn: &VpnController, command: Command) -> Result<bool, VpnError> {
    match command {
        Command::Connect => vpn.connect().await?,
        Command::Disconnect => vpn.disconnect().await?,
        Command::Status => println!("{}", format_status(&vpn.status())),
        Command::Wake => vpn.wake(),
        Command::List => {
            for entry in vpn.whitelist()?.entries() {
                let mark = if entry.enabled { "x" } else { " " };
                println!("[{}] {:<9} {}", mark, entry.source, entry.domain);
            }
        }
        Command::Add(domain) => {
            let compiled = vpn.add_whitelist_domain(&domain).await?;
            println!("{} domains bypass the tunnel", compiled.domains.len());
        }
        Command::Remove(domain) => {
            let compiled = vpn.remove_whitelist_domain(&domain).await?;
            println!("{} domains bypass the tunnel", compiled.domains.len());
        }
        Command::Toggle(source, domain, enabled) => {
            vpn.toggle_whitelist_domain(source, &domain, enabled).await?;
        }
        Command::Region(None) => {
            let region = vpn.region().await?;
            println!("{} ({})", region.name(), region.server_address(vpn.config()));
        }
        Command::Region(Some(region)) => vpn.set_region(region).await?,
        Command::Regions => {
            for region in RegionId::all() {
                println!("{:<13} {}", region.code(), region.name());
            }
        }
        Command::RequireVpn(enabled) => vpn.set_force_vpn_on(enabled).await?,
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

/// Read and run commands until `quit` or end of input
pub async fn run(vpn: &VpnController) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = vpn.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => match execute(vpn, command).await {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => println!("error: {}", e),
                    },
                    Err(e) => println!("{}", e),
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                println!("{}", format_status(&status.borrow_and_update()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnels_vpn::{DesiredState, TunnelStatus};

    #[test]
    fn test_parse_commands() {
        assert_eq!("connect".parse::<Command>(), Ok(Command::Connect));
        assert_eq!("  add example.com ".parse::<Command>(), Ok(Command::Add("example.com".into())));
        assert_eq!(
            "toggle confirmed netflix.com off".parse::<Command>(),
            Ok(Command::Toggle(WhitelistSource::Confirmed, "netflix.com".into(), false))
        );
        assert_eq!(
            "region eu-london".parse::<Command>(),
            Ok(Command::Region(Some(RegionId::EuLondon)))
        );
        assert_eq!("require-vpn on".parse::<Command>(), Ok(Command::RequireVpn(true)));
        assert_eq!("exit".parse::<Command>(), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!("toggle both x on".parse::<Command>().is_err());
        assert!("region atlantis".parse::<Command>().is_err());
        assert!("require-vpn maybe".parse::<Command>().is_err());
        assert!("fly".parse::<Command>().is_err());
    }

    #[test]
    fn test_format_status() {
        let event = StatusEvent {
            tunnel: TunnelStatus::Connected,
            proxy_active: true,
            desired: DesiredState::Connected,
        };
        assert_eq!(format_status(&event), "tunnel connected | proxy on | wanted connected");
    }
}
