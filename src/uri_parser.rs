use std::collections::HashSet;

use percent_encoding::percent_decode_str;
use serde_yaml::Value as YamlValue;

use crate::base64_util::decode_lenient_utf8;
use crate::model::ServerNode;

/// Parses a subscription body into ordered `ServerNode`s. Tries, in order,
/// the plain URI list, the base64-wrapped URI list, then YAML `proxies:`,
/// stopping at the first non-empty result.
pub struct UriParser;

impl UriParser {
    pub fn parse(body: &str) -> Vec<ServerNode> {
        let plain = parse_plain_uri_list(body);
        if !plain.is_empty() {
            return dedup_by_lowercase_name(plain);
        }

        if let Some(decoded) = decode_lenient_utf8(body.trim()) {
            let from_b64 = parse_plain_uri_list(&decoded);
            if !from_b64.is_empty() {
                return dedup_by_lowercase_name(from_b64);
            }
        }

        let from_yaml = parse_yaml_proxies(body);
        dedup_by_lowercase_name(from_yaml)
    }
}

fn parse_plain_uri_list(body: &str) -> Vec<ServerNode> {
    body.lines()
        .map(str::trim)
        .filter(|line| line.contains("://"))
        .map(parse_uri_line)
        .collect()
}

fn parse_uri_line(line: &str) -> ServerNode {
    let parsed = url::Url::parse(line).ok();

    let host = parsed.as_ref().and_then(|u| u.host_str()).unwrap_or("").to_string();
    let fragment = parsed
        .as_ref()
        .and_then(|u| u.fragment())
        .filter(|f| !f.is_empty())
        .map(|f| percent_decode_str(f).decode_utf8_lossy().into_owned());

    let name = fragment.unwrap_or_else(|| if host.is_empty() { line.to_string() } else { host.clone() });
    let id = if host.is_empty() {
        name.clone()
    } else {
        format!("{name}-{host}")
    };

    ServerNode {
        id,
        name,
        address: host,
        country: None,
        ping: None,
        uri: line.to_string(),
    }
}

/// YAML `proxies:` sequence of mappings; each mapping's `name` becomes a
/// `ServerNode.name` with an empty `uri` — Connect rejects these rather
/// than synthesizing one.
fn parse_yaml_proxies(body: &str) -> Vec<ServerNode> {
    let root: YamlValue = match serde_yaml::from_str(body) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let proxies = match root.get("proxies").and_then(YamlValue::as_sequence) {
        Some(seq) => seq,
        None => return Vec::new(),
    };

    proxies
        .iter()
        .filter_map(|entry| {
            let name = entry.get("name")?.as_str()?.to_string();
            Some(ServerNode {
                id: name.clone(),
                name,
                address: String::new(),
                country: None,
                ping: None,
                uri: String::new(),
            })
        })
        .collect()
}

fn dedup_by_lowercase_name(nodes: Vec<ServerNode>) -> Vec<ServerNode> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|n| seen.insert(n.name.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;

    #[test]
    fn parses_plain_uri_list() {
        let body = "vless://abc-uuid@1.2.3.4:443?security=tls&sni=ex.com#Tokyo\nss://YWVzLTEyOC1nY206cGFzc3c=@5.6.7.8:8388#Osaka";
        let nodes = UriParser::parse(body);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "Tokyo");
        assert_eq!(nodes[0].address, "1.2.3.4");
        assert_eq!(nodes[1].name, "Osaka");
        assert_eq!(nodes[1].address, "5.6.7.8");
        assert!(nodes.iter().all(|n| !n.uri.is_empty()));
    }

    #[test]
    fn parses_base64_wrapped_uri_list() {
        let raw = "vless://abc-uuid@1.2.3.4:443?security=tls&sni=ex.com#Tokyo\nss://YWVzLTEyOC1nY206cGFzc3c=@5.6.7.8:8388#Osaka";
        let encoded = STANDARD.encode(raw);
        let nodes = UriParser::parse(&encoded);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "Tokyo");
    }

    #[test]
    fn parses_url_safe_base64_without_padding() {
        let raw = "trojan://pw@host.example:443#Node1";
        let encoded = URL_SAFE_NO_PAD.encode(raw);
        let nodes = UriParser::parse(&encoded);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "Node1");
    }

    #[test]
    fn parses_yaml_proxies_with_empty_uri() {
        let yaml = "proxies:\n  - name: YamlNode\n    type: vmess\n    server: example.com\n    port: 443\n";
        let nodes = UriParser::parse(yaml);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "YamlNode");
        assert!(nodes[0].uri.is_empty());
    }

    #[test]
    fn dedups_by_lowercase_name() {
        let body = "vless://u@1.1.1.1:443#Node\nvless://u@2.2.2.2:443#node";
        let nodes = UriParser::parse(body);
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn empty_body_yields_empty_list() {
        assert!(UriParser::parse("").is_empty());
        assert!(UriParser::parse("not a uri list at all").is_empty());
    }
}
