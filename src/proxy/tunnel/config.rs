//! Tunnel configuration artifact generation
//!
//! Each probe gets its own config: one local SOCKS inbound on the leased
//! loopback port and one VLESS outbound towards the endpoint under test.

use crate::proxy::models::{EndpointDescriptor, SecurityMode, TransportType};
use crate::proxy::tunnel::TunnelError;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Fingerprint used for reality handshakes that do not name one
const DEFAULT_REALITY_FINGERPRINT: &str = "chrome";

pub const INBOUND_TAG: &str = "probe-in";
pub const OUTBOUND_TAG: &str = "probe-out";

/// Build the full tunnel configuration for one probe
pub fn build_config(descriptor: &EndpointDescriptor, listen_port: u16) -> Result<Value, TunnelError> {
    Ok(json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "tag": INBOUND_TAG,
            "listen": "127.0.0.1",
            "port": listen_port,
            "protocol": "socks",
            "settings": {
                "auth": "noauth",
                "udp": false
            }
        }],
        "outbounds": [build_outbound(descriptor)?]
    }))
}

fn build_outbound(descriptor: &EndpointDescriptor) -> Result<Value, TunnelError> {
    let mut user = Map::new();
    user.insert("id".into(), json!(descriptor.credential_id));
    user.insert("encryption".into(), json!("none"));
    if let Some(flow) = &descriptor.params.flow {
        user.insert("flow".into(), json!(flow));
    }

    Ok(json!({
        "tag": OUTBOUND_TAG,
        "protocol": "vless",
        "settings": {
            "vnext": [{
                "address": descriptor.host,
                "port": descriptor.port,
                "users": [Value::Object(user)]
            }]
        },
        "streamSettings": build_stream_settings(descriptor)?
    }))
}

fn build_stream_settings(descriptor: &EndpointDescriptor) -> Result<Value, TunnelError> {
    let params = &descriptor.params;
    let mut stream = Map::new();
    stream.insert("network".into(), json!(descriptor.transport.to_string()));
    stream.insert("security".into(), json!(descriptor.security.to_string()));

    match descriptor.security {
        SecurityMode::None => {}
        SecurityMode::Tls => {
            let mut tls = Map::new();
            tls.insert("serverName".into(), json!(params.sni));
            tls.insert("allowInsecure".into(), json!(false));
            if let Some(fp) = &params.fingerprint {
                tls.insert("fingerprint".into(), json!(fp));
            }
            if let Some(alpn) = &params.alpn {
                let protocols: Vec<&str> = alpn.split(',').map(str::trim).collect();
                tls.insert("alpn".into(), json!(protocols));
            }
            stream.insert("tlsSettings".into(), Value::Object(tls));
        }
        SecurityMode::Reality => {
            let public_key = params.public_key.as_deref().ok_or_else(|| {
                TunnelError::InvalidDescriptor("reality descriptor without public key".to_string())
            })?;
            stream.insert(
                "realitySettings".into(),
                json!({
                    "show": false,
                    "serverName": params.sni,
                    "publicKey": public_key,
                    "shortId": params.short_id.as_deref().unwrap_or(""),
                    "fingerprint": params.fingerprint.as_deref().unwrap_or(DEFAULT_REALITY_FINGERPRINT),
                    "spiderX": params.spider_x.as_deref().unwrap_or("/")
                }),
            );
        }
    }

    let path = params.path.as_deref().unwrap_or("/");
    let host = params.host_header.as_deref().unwrap_or(&params.sni);
    match descriptor.transport {
        TransportType::Tcp => {}
        TransportType::WebSocket => {
            stream.insert(
                "wsSettings".into(),
                json!({ "path": path, "headers": { "Host": host } }),
            );
        }
        TransportType::Grpc => {
            stream.insert(
                "grpcSettings".into(),
                json!({ "serviceName": params.service_name.as_deref().unwrap_or("") }),
            );
        }
        TransportType::H2 => {
            stream.insert(
                "httpSettings".into(),
                json!({ "path": path, "host": [host] }),
            );
        }
        TransportType::HttpUpgrade => {
            stream.insert(
                "httpupgradeSettings".into(),
                json!({ "path": path, "host": host }),
            );
        }
    }

    Ok(Value::Object(stream))
}

/// Write `config` to a uniquely named file under `dir`
pub fn write_artifact(dir: &Path, config: &Value) -> Result<PathBuf, TunnelError> {
    let path = dir.join(format!("tunnel-{}.json", Uuid::new_v4()));
    let bytes = serde_json::to_vec_pretty(config)
        .map_err(|e| TunnelError::ConfigWrite(e.to_string()))?;
    std::fs::write(&path, bytes).map_err(|e| TunnelError::ConfigWrite(e.to_string()))?;
    Ok(path)
}
