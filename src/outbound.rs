use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use serde_json::{json, Map, Value};
use url::Url;

use crate::base64_util::decode_lenient_utf8;
use crate::error::{CoreError, Result};

/// REALITY TLS-camouflage parameters: a public key and short id presented
/// by the server, letting the client mimic a legitimate TLS handshake to
/// a decoy site.
#[derive(Debug, Clone)]
pub struct TlsReality {
    pub public_key: String,
    pub short_id: String,
}

/// uTLS ClientHello fingerprint, e.g. "chrome" or "firefox".
#[derive(Debug, Clone)]
pub struct TlsUtls {
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub enabled: bool,
    pub server_name: String,
    pub reality: Option<TlsReality>,
    pub utls: Option<TlsUtls>,
}

impl TlsConfig {
    fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("enabled".into(), json!(self.enabled));
        map.insert("server_name".into(), json!(self.server_name));
        if let Some(reality) = &self.reality {
            map.insert(
                "reality".into(),
                json!({ "public_key": reality.public_key, "short_id": reality.short_id }),
            );
        }
        if let Some(utls) = &self.utls {
            map.insert("utls".into(), json!({ "fingerprint": utls.fingerprint }));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub enum Transport {
    Ws { path: Option<String>, host_header: Option<String> },
    Grpc { service_name: Option<String> },
}

impl Transport {
    fn to_json(&self) -> Value {
        match self {
            Transport::Ws { path, host_header } => {
                let mut map = Map::new();
                map.insert("type".into(), json!("ws"));
                if let Some(p) = path {
                    map.insert("path".into(), json!(p));
                }
                if let Some(h) = host_header {
                    map.insert("headers".into(), json!({ "Host": h }));
                }
                Value::Object(map)
            }
            Transport::Grpc { service_name } => {
                let mut map = Map::new();
                map.insert("type".into(), json!("grpc"));
                if let Some(s) = service_name {
                    map.insert("service_name".into(), json!(s));
                }
                Value::Object(map)
            }
        }
    }
}

/// Renders a parsed proxy descriptor to the engine's outbound JSON. One
/// variant per scheme gives compile-time coverage of each scheme's
/// required fields, rather than a stringly-typed nested map.
pub trait ToOutbound {
    fn to_outbound_json(&self) -> Value;
}

#[derive(Debug, Clone)]
pub struct VlessOutbound {
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub flow: Option<String>,
    pub alpn: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
    pub transport: Option<Transport>,
}

impl ToOutbound for VlessOutbound {
    fn to_outbound_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".into(), json!("vless"));
        map.insert("server".into(), json!(self.server));
        map.insert("server_port".into(), json!(self.server_port));
        map.insert("uuid".into(), json!(self.uuid));
        if let Some(flow) = &self.flow {
            map.insert("flow".into(), json!(flow));
        }
        if let Some(alpn) = &self.alpn {
            map.insert("alpn".into(), json!(alpn));
        }
        if let Some(tls) = &self.tls {
            map.insert("tls".into(), tls.to_json());
        }
        if let Some(transport) = &self.transport {
            map.insert("transport".into(), transport.to_json());
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub struct VmessOutbound {
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub alter_id: u32,
    pub tls: Option<TlsConfig>,
    pub transport: Option<Transport>,
}

impl ToOutbound for VmessOutbound {
    fn to_outbound_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".into(), json!("vmess"));
        map.insert("server".into(), json!(self.server));
        map.insert("server_port".into(), json!(self.server_port));
        map.insert("uuid".into(), json!(self.uuid));
        map.insert("security".into(), json!("auto"));
        map.insert("alter_id".into(), json!(self.alter_id));
        if let Some(tls) = &self.tls {
            map.insert("tls".into(), tls.to_json());
        }
        if let Some(transport) = &self.transport {
            map.insert("transport".into(), transport.to_json());
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub struct TrojanOutbound {
    pub server: String,
    pub server_port: u16,
    pub password: String,
    pub alpn: Option<Vec<String>>,
    pub tls: TlsConfig,
    pub transport: Option<Transport>,
}

impl ToOutbound for TrojanOutbound {
    fn to_outbound_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".into(), json!("trojan"));
        map.insert("server".into(), json!(self.server));
        map.insert("server_port".into(), json!(self.server_port));
        map.insert("password".into(), json!(self.password));
        if let Some(alpn) = &self.alpn {
            map.insert("alpn".into(), json!(alpn));
        }
        map.insert("tls".into(), self.tls.to_json());
        if let Some(transport) = &self.transport {
            map.insert("transport".into(), transport.to_json());
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub struct ShadowsocksOutbound {
    pub server: String,
    pub server_port: u16,
    pub method: String,
    pub password: String,
}

impl ToOutbound for ShadowsocksOutbound {
    fn to_outbound_json(&self) -> Value {
        json!({
            "type": "shadowsocks",
            "method": self.method,
            "password": self.password,
            "server": self.server,
            "server_port": self.server_port,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Vless(VlessOutbound),
    Vmess(VmessOutbound),
    Trojan(TrojanOutbound),
    Shadowsocks(ShadowsocksOutbound),
}

impl ToOutbound for Outbound {
    fn to_outbound_json(&self) -> Value {
        match self {
            Outbound::Vless(v) => v.to_outbound_json(),
            Outbound::Vmess(v) => v.to_outbound_json(),
            Outbound::Trojan(v) => v.to_outbound_json(),
            Outbound::Shadowsocks(v) => v.to_outbound_json(),
        }
    }
}

/// Translates a `ServerNode.uri` into an `Outbound`.
pub struct OutboundBuilder;

impl OutboundBuilder {
    pub fn build(uri: &str) -> Result<Outbound> {
        let scheme = uri.split("://").next().unwrap_or("").to_lowercase();
        match scheme.as_str() {
            "vless" => build_vless(uri).map(Outbound::Vless),
            "vmess" => build_vmess(uri).map(Outbound::Vmess),
            "trojan" => build_trojan(uri).map(Outbound::Trojan),
            "ss" => build_shadowsocks(uri).map(Outbound::Shadowsocks),
            other => Err(CoreError::UnsupportedScheme(other.to_string())),
        }
    }
}

fn parse_url(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| match e {
        url::ParseError::InvalidPort => CoreError::InvalidPort(uri.to_string()),
        other => CoreError::MissingCredential(format!("malformed URI: {other}")),
    })
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

fn transport_from_params(params: &HashMap<String, String>) -> Option<Transport> {
    let kind = params.get("type").map(|s| s.to_lowercase()).unwrap_or_default();
    match kind.as_str() {
        "ws" | "websocket" => Some(Transport::Ws {
            path: params.get("path").cloned(),
            host_header: params.get("host").cloned(),
        }),
        "grpc" => Some(Transport::Grpc {
            service_name: params
                .get("serviceName")
                .or_else(|| params.get("service_name"))
                .cloned(),
        }),
        _ => None,
    }
}

fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

fn build_vless(uri: &str) -> Result<VlessOutbound> {
    let url = parse_url(uri)?;
    let uuid = decode_userinfo(url.username());
    if uuid.is_empty() {
        return Err(CoreError::MissingCredential("uuid".into()));
    }
    let host = url.host_str().unwrap_or("").to_string();
    let port = url.port().unwrap_or(443);
    let params = query_map(&url);

    let security = params.get("security").map(|s| s.to_lowercase()).unwrap_or_default();
    let server_name = params.get("sni").cloned().unwrap_or_else(|| host.clone());

    let tls = match security.as_str() {
        "tls" => Some(TlsConfig { enabled: true, server_name, reality: None, utls: None }),
        "reality" => {
            let pbk = params
                .get("pbk")
                .cloned()
                .ok_or_else(|| CoreError::MissingCredential("pbk".into()))?;
            let sid = params
                .get("sid")
                .cloned()
                .ok_or_else(|| CoreError::MissingCredential("sid".into()))?;
            let fingerprint = params.get("fp").cloned().unwrap_or_else(|| "chrome".to_string());
            Some(TlsConfig {
                enabled: true,
                server_name,
                reality: Some(TlsReality { public_key: pbk, short_id: sid }),
                utls: Some(TlsUtls { fingerprint }),
            })
        }
        _ => None,
    };

    Ok(VlessOutbound {
        server: host,
        server_port: port,
        uuid,
        flow: params.get("flow").cloned(),
        alpn: params.get("alpn").map(|s| s.split(',').map(str::to_string).collect()),
        tls,
        transport: transport_from_params(&params),
    })
}

fn build_vmess(uri: &str) -> Result<VmessOutbound> {
    let payload = uri
        .splitn(2, "://")
        .nth(1)
        .ok_or_else(|| CoreError::MissingCredential("vmess payload".into()))?;
    let payload = payload.split('#').next().unwrap_or(payload);

    let decoded = decode_lenient_utf8(payload)
        .ok_or_else(|| CoreError::MissingCredential("vmess payload is not valid base64".into()))?;
    let json: Value = serde_json::from_str(&decoded)?;

    let add = json
        .get("add")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::MissingCredential("add".into()))?
        .to_string();
    let id = json
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::MissingCredential("id".into()))?
        .to_string();
    let port = value_as_u16(json.get("port")).ok_or_else(|| CoreError::InvalidPort(uri.to_string()))?;
    let alter_id = value_as_u32(json.get("aid")).unwrap_or(0);

    let host = json.get("host").and_then(Value::as_str).map(str::to_string);
    let sni = json.get("sni").and_then(Value::as_str).map(str::to_string);
    let tls = if json.get("tls").and_then(Value::as_str) == Some("tls") {
        let server_name = sni.or_else(|| host.clone()).unwrap_or_else(|| add.clone());
        Some(TlsConfig { enabled: true, server_name, reality: None, utls: None })
    } else {
        None
    };

    let net = json.get("net").and_then(Value::as_str).unwrap_or("").to_lowercase();
    let path = json.get("path").and_then(Value::as_str).map(str::to_string);
    let transport = match net.as_str() {
        "ws" | "websocket" => Some(Transport::Ws { path, host_header: host }),
        "grpc" => Some(Transport::Grpc { service_name: path }),
        _ => None,
    };

    Ok(VmessOutbound { server: add, server_port: port, uuid: id, alter_id, tls, transport })
}

fn build_trojan(uri: &str) -> Result<TrojanOutbound> {
    let url = parse_url(uri)?;
    let password = decode_userinfo(url.username());
    if password.is_empty() {
        return Err(CoreError::MissingCredential("password".into()));
    }
    let host = url.host_str().unwrap_or("").to_string();
    let port = url.port().unwrap_or(443);
    let params = query_map(&url);
    let server_name = params.get("sni").cloned().unwrap_or_else(|| host.clone());

    Ok(TrojanOutbound {
        server: host,
        server_port: port,
        password,
        alpn: params.get("alpn").map(|s| s.split(',').map(str::to_string).collect()),
        tls: TlsConfig { enabled: true, server_name, reality: None, utls: None },
        transport: transport_from_params(&params),
    })
}

fn build_shadowsocks(uri: &str) -> Result<ShadowsocksOutbound> {
    let url = parse_url(uri)?;
    let host = url.host_str().unwrap_or("").to_string();
    let port = url.port().unwrap_or(8388);

    let (method, password) = if let Some(pw) = url.password() {
        (decode_userinfo(url.username()), decode_userinfo(pw))
    } else {
        let decoded = decode_lenient_utf8(url.username())
            .ok_or_else(|| CoreError::MissingCredential("method:password".into()))?;
        let mut parts = decoded.splitn(2, ':');
        let method = parts.next().unwrap_or("").to_string();
        let password = parts.next().unwrap_or("").to_string();
        (method, password)
    };

    if method.is_empty() || password.is_empty() {
        return Err(CoreError::MissingCredential("method/password".into()));
    }

    Ok(ShadowsocksOutbound { server: host, server_port: port, method, password })
}

fn value_as_u16(v: Option<&Value>) -> Option<u16> {
    match v {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_u32(v: Option<&Value>) -> Option<u32> {
    match v {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vless_reality_ws_matches_spec_example() {
        let uri = "vless://UUID@h:443?security=reality&pbk=KEY&sid=SID&fp=firefox&sni=x.com&type=ws&path=/p&host=w.com";
        let outbound = OutboundBuilder::build(uri).unwrap();
        let json = outbound.to_outbound_json();
        assert_eq!(json["type"], "vless");
        assert_eq!(json["server"], "h");
        assert_eq!(json["server_port"], 443);
        assert_eq!(json["uuid"], "UUID");
        assert_eq!(json["tls"]["enabled"], true);
        assert_eq!(json["tls"]["server_name"], "x.com");
        assert_eq!(json["tls"]["reality"]["public_key"], "KEY");
        assert_eq!(json["tls"]["reality"]["short_id"], "SID");
        assert_eq!(json["tls"]["utls"]["fingerprint"], "firefox");
        assert_eq!(json["transport"]["type"], "ws");
        assert_eq!(json["transport"]["path"], "/p");
        assert_eq!(json["transport"]["headers"]["Host"], "w.com");
    }

    #[test]
    fn vless_missing_uuid_is_missing_credential() {
        let err = OutboundBuilder::build("vless://@host:443").unwrap_err();
        assert!(matches!(err, CoreError::MissingCredential(_)));
    }

    #[test]
    fn trojan_defaults_port_and_enables_tls() {
        let outbound = OutboundBuilder::build("trojan://secret@example.com").unwrap();
        let json = outbound.to_outbound_json();
        assert_eq!(json["type"], "trojan");
        assert_eq!(json["server_port"], 443);
        assert_eq!(json["tls"]["enabled"], true);
        assert_eq!(json["tls"]["server_name"], "example.com");
    }

    #[test]
    fn shadowsocks_plain_userinfo() {
        let outbound = OutboundBuilder::build("ss://aes-256-gcm:hunter2@5.6.7.8:8388").unwrap();
        let json = outbound.to_outbound_json();
        assert_eq!(json["type"], "shadowsocks");
        assert_eq!(json["method"], "aes-256-gcm");
        assert_eq!(json["password"], "hunter2");
        assert_eq!(json["server_port"], 8388);
    }

    #[test]
    fn shadowsocks_base64_userinfo() {
        let outbound =
            OutboundBuilder::build("ss://YWVzLTEyOC1nY206cGFzc3c=@5.6.7.8:8388#Osaka").unwrap();
        let json = outbound.to_outbound_json();
        assert_eq!(json["method"], "aes-128-gcm");
        assert_eq!(json["password"], "passw");
    }

    #[test]
    fn vmess_requires_add_id_port() {
        let bad = base64::engine::general_purpose::STANDARD.encode(r#"{"add":"h"}"#);
        use base64::Engine;
        let err = OutboundBuilder::build(&format!("vmess://{bad}")).unwrap_err();
        assert!(matches!(err, CoreError::MissingCredential(_)));
    }

    #[test]
    fn vmess_builds_tls_and_ws_transport() {
        use base64::Engine;
        let payload = serde_json::json!({
            "add": "v.example.com", "port": 443, "id": "uuid-1", "aid": "2",
            "net": "ws", "host": "w.example.com", "path": "/ws", "tls": "tls", "sni": "sni.example.com"
        })
        .to_string();
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
        let outbound = OutboundBuilder::build(&format!("vmess://{encoded}")).unwrap();
        let json = outbound.to_outbound_json();
        assert_eq!(json["type"], "vmess");
        assert_eq!(json["server"], "v.example.com");
        assert_eq!(json["alter_id"], 2);
        assert_eq!(json["tls"]["server_name"], "sni.example.com");
        assert_eq!(json["transport"]["type"], "ws");
        assert_eq!(json["transport"]["headers"]["Host"], "w.example.com");
    }

    #[test]
    fn unsupported_scheme_errors() {
        let err = OutboundBuilder::build("http://example.com").unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedScheme(_)));
    }
}
