//! Line-oriented parser for the INI-style configuration dialect.

use rudder_rules::parse_rule_line;

use crate::{Config, ConfigError, GroupDef, ProxyDef, ProxyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    General,
    Proxy,
    ProxyGroup,
    Rule,
    Unknown,
}

/// Parse a configuration document from text.
///
/// Blank lines and `#`/`;` comments are skipped. Sections other than the
/// four recognized ones are ignored wholesale. `[Rule]` lines keep their
/// declared order.
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let mut section = Section::Unknown;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            section = match name.trim() {
                "General" => Section::General,
                "Proxy" => Section::Proxy,
                "Proxy Group" => Section::ProxyGroup,
                "Rule" => Section::Rule,
                _ => Section::Unknown,
            };
            continue;
        }

        match section {
            Section::General => parse_general_line(&mut config, line)?,
            Section::Proxy => parse_proxy_line(&mut config, line)?,
            Section::ProxyGroup => parse_group_line(&mut config, line)?,
            Section::Rule => config.rules.push(parse_rule_line(line)?),
            Section::Unknown => {}
        }
    }

    Ok(config)
}

fn split_entry(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

fn parse_general_line(config: &mut Config, line: &str) -> Result<(), ConfigError> {
    let Some((key, value)) = split_entry(line) else {
        return Err(ConfigError::General(format!("expected key = value: {line}")));
    };
    match key {
        "port" => {
            config.general.port = value
                .parse()
                .map_err(|_| ConfigError::General(format!("invalid port '{value}'")))?;
        }
        "socks-port" => {
            config.general.socks_port = value
                .parse()
                .map_err(|_| ConfigError::General(format!("invalid socks-port '{value}'")))?;
        }
        "external-controller" => {
            config.general.external_controller = Some(value.to_string());
        }
        // Unrecognized keys are tolerated for forward compatibility.
        _ => {}
    }
    Ok(())
}

fn parse_proxy_line(config: &mut Config, line: &str) -> Result<(), ConfigError> {
    let Some((name, value)) = split_entry(line) else {
        // A bare line in [Proxy] has no kind to dispatch on; skip it like an
        // unknown kind.
        return Ok(());
    };
    let fields: Vec<&str> = value.split(',').map(str::trim).collect();

    match fields.first().copied() {
        Some("ss") => {
            if fields.len() != 5 {
                return Err(ConfigError::Proxy {
                    name: name.to_string(),
                    reason: format!(
                        "ss needs server, port, cipher, password ({} fields given)",
                        fields.len() - 1
                    ),
                });
            }
            let port: u16 = fields[2].parse().map_err(|_| ConfigError::Proxy {
                name: name.to_string(),
                reason: format!("invalid port '{}'", fields[2]),
            })?;
            config.proxies.push(ProxyDef {
                name: name.to_string(),
                kind: ProxyKind::Shadowsocks {
                    server: fields[1].to_string(),
                    port,
                    cipher: fields[3].to_string(),
                    password: fields[4].to_string(),
                },
            });
        }
        // Unknown proxy kinds are ignored.
        _ => {}
    }
    Ok(())
}

fn parse_group_line(config: &mut Config, line: &str) -> Result<(), ConfigError> {
    let Some((name, value)) = split_entry(line) else {
        return Ok(());
    };
    let fields: Vec<&str> = value.split(',').map(str::trim).collect();

    match fields.first().copied() {
        Some("url-test") => {
            // url-test, member..., probeURL, intervalSeconds
            if fields.len() < 4 {
                return Err(ConfigError::Group {
                    name: name.to_string(),
                    reason: "url-test needs members, a probe URL and an interval".to_string(),
                });
            }
            let interval_secs: u64 =
                fields[fields.len() - 1]
                    .parse()
                    .map_err(|_| ConfigError::Group {
                        name: name.to_string(),
                        reason: format!("invalid interval '{}'", fields[fields.len() - 1]),
                    })?;
            let probe_url = fields[fields.len() - 2].to_string();
            let members = fields[1..fields.len() - 2]
                .iter()
                .map(|s| s.to_string())
                .collect();
            config.groups.push(GroupDef {
                name: name.to_string(),
                members,
                probe_url,
                interval_secs,
            });
        }
        // Unknown group kinds are ignored.
        _ => {}
    }
    Ok(())
}
