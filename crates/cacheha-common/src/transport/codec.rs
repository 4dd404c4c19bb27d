//! Memcached text protocol encoding and decoding.
//!
//! Client-side helpers build request bytes and interpret single reply lines;
//! server-side helpers parse command lines and render `VALUE` blocks. Line
//! arguments may carry a trailing `\r\n`, which is ignored.

use std::str::FromStr;

use crate::protocol::error::{CacheError, Result};
use crate::protocol::WireItem;

/// Maximum key length accepted by memcached.
pub const MAX_KEY_LENGTH: usize = 250;

/// Checks that `key` can be sent over the text protocol.
///
/// # Errors
///
/// Returns [`CacheError::MalformedKey`] for empty keys, keys longer than
/// [`MAX_KEY_LENGTH`] bytes, and keys containing spaces or control bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::MalformedKey);
    }
    if key.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(CacheError::MalformedKey);
    }
    Ok(())
}

/// Storage commands the client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Set,
    Add,
}

impl StoreCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreCommand::Set => "set",
            StoreCommand::Add => "add",
        }
    }
}

/// Header line of a `VALUE` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHeader {
    pub key: String,
    pub flags: u32,
    pub bytes: usize,
}

/// A parsed request line, as seen by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        keys: Vec<String>,
    },
    Store {
        command: StoreCommand,
        key: String,
        flags: u32,
        expiration: u32,
        bytes: usize,
        noreply: bool,
    },
    Delete {
        key: String,
        noreply: bool,
    },
    Touch {
        key: String,
        expiration: i32,
        noreply: bool,
    },
    ConfigGet {
        name: String,
    },
    Version,
    Quit,
}

/// Stateless memcached text codec.
pub struct MemcacheCodec;

impl MemcacheCodec {
    pub fn encode_get(key: &str) -> Vec<u8> {
        format!("get {}\r\n", key).into_bytes()
    }

    /// Encodes a `set`/`add` request including the data block.
    pub fn encode_store(command: StoreCommand, item: &WireItem) -> Vec<u8> {
        let mut buf = format!(
            "{} {} {} {} {}\r\n",
            command.as_str(),
            item.key,
            item.flags,
            item.expiration,
            item.value.len()
        )
        .into_bytes();
        buf.extend_from_slice(&item.value);
        buf.extend_from_slice(b"\r\n");
        buf
    }

    pub fn encode_delete(key: &str) -> Vec<u8> {
        format!("delete {}\r\n", key).into_bytes()
    }

    pub fn encode_touch(key: &str, seconds: i32) -> Vec<u8> {
        format!("touch {} {}\r\n", key, seconds).into_bytes()
    }

    pub fn encode_config_get(name: &str) -> Vec<u8> {
        format!("config get {}\r\n", name).into_bytes()
    }

    /// Interprets the reply to `set` or `add`.
    pub fn decode_store_reply(line: &[u8]) -> Result<()> {
        match trim_line(line) {
            b"STORED" => Ok(()),
            b"NOT_STORED" => Err(CacheError::NotStored),
            b"EXISTS" => Err(CacheError::CasConflict),
            b"NOT_FOUND" => Err(CacheError::CacheMiss),
            other => Err(error_reply(other)),
        }
    }

    pub fn decode_delete_reply(line: &[u8]) -> Result<()> {
        match trim_line(line) {
            b"DELETED" => Ok(()),
            b"NOT_FOUND" => Err(CacheError::CacheMiss),
            other => Err(error_reply(other)),
        }
    }

    pub fn decode_touch_reply(line: &[u8]) -> Result<()> {
        match trim_line(line) {
            b"TOUCHED" => Ok(()),
            b"NOT_FOUND" => Err(CacheError::CacheMiss),
            other => Err(error_reply(other)),
        }
    }

    /// Parses a line of a `get` reply.
    ///
    /// Returns `None` on the terminating `END`.
    pub fn decode_value_header(line: &[u8]) -> Result<Option<ValueHeader>> {
        let line = trim_line(line);
        if line == b"END" {
            return Ok(None);
        }
        let text = as_text(line)?;
        let mut fields = text.split(' ');
        if fields.next() != Some("VALUE") {
            return Err(error_reply(line));
        }
        let key = fields
            .next()
            .ok_or_else(|| CacheError::Protocol(format!("malformed VALUE line: {}", text)))?
            .to_string();
        let flags = parse_field(fields.next(), text)?;
        let bytes = parse_field(fields.next(), text)?;
        Ok(Some(ValueHeader { key, flags, bytes }))
    }

    /// Parses the header of a `config get` reply, returning the data length.
    ///
    /// Returns `None` on a bare `END` (no such config key).
    pub fn decode_config_header(line: &[u8]) -> Result<Option<usize>> {
        let line = trim_line(line);
        if line == b"END" {
            return Ok(None);
        }
        let text = as_text(line)?;
        let fields: Vec<&str> = text.split(' ').collect();
        match fields.as_slice() {
            ["CONFIG", _name, _flags, bytes] => bytes
                .parse()
                .map(Some)
                .map_err(|_| CacheError::Protocol(format!("malformed CONFIG line: {}", text))),
            _ => Err(error_reply(line)),
        }
    }

    /// Parses the payload of `config get cluster` into `host:port` endpoints.
    ///
    /// The payload is a version line followed by a space separated list of
    /// `hostname|ip|port` triples. The hostname is preferred; the ip is used
    /// when no hostname is published.
    pub fn decode_cluster_config(data: &[u8]) -> Result<Vec<String>> {
        let text = as_text(data)?;
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let version = lines
            .next()
            .ok_or_else(|| CacheError::Protocol("empty cluster config".to_string()))?;
        version
            .parse::<u64>()
            .map_err(|_| CacheError::Protocol(format!("invalid cluster config version: {}", version)))?;

        let Some(nodes) = lines.next() else {
            return Ok(Vec::new());
        };

        nodes
            .split_whitespace()
            .map(|entry| {
                let parts: Vec<&str> = entry.split('|').collect();
                match parts.as_slice() {
                    [host, ip, port] => {
                        let port: u16 = port
                            .parse()
                            .map_err(|_| CacheError::Protocol(format!("invalid port in {}", entry)))?;
                        let addr = if host.is_empty() { ip } else { host };
                        if addr.is_empty() {
                            return Err(CacheError::Protocol(format!("no address in {}", entry)));
                        }
                        Ok(format!("{}:{}", addr, port))
                    }
                    _ => Err(CacheError::Protocol(format!("malformed cluster node: {}", entry))),
                }
            })
            .collect()
    }

    /// Renders a cluster config reply for the given `host:port` endpoints.
    pub fn encode_cluster_config(version: u64, endpoints: &[String]) -> Vec<u8> {
        let nodes: Vec<String> = endpoints
            .iter()
            .map(|endpoint| match endpoint.rsplit_once(':') {
                Some((host, port)) => format!("{}|{}|{}", host, host, port),
                None => format!("{}|{}|11211", endpoint, endpoint),
            })
            .collect();
        let data = format!("{}\n{}\n", version, nodes.join(" "));

        let mut buf = format!("CONFIG cluster 0 {}\r\n", data.len()).into_bytes();
        buf.extend_from_slice(data.as_bytes());
        buf.extend_from_slice(b"\r\nEND\r\n");
        buf
    }

    /// Renders one `VALUE` block (without the terminating `END`).
    pub fn encode_value(item: &WireItem) -> Vec<u8> {
        let mut buf = format!("VALUE {} {} {}\r\n", item.key, item.flags, item.value.len()).into_bytes();
        buf.extend_from_slice(&item.value);
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Parses a request line received by a server.
    pub fn decode_command(line: &[u8]) -> Result<Command> {
        let text = as_text(trim_line(line))?;
        let fields: Vec<&str> = text.split(' ').filter(|f| !f.is_empty()).collect();

        match fields.as_slice() {
            ["get", keys @ ..] | ["gets", keys @ ..] if !keys.is_empty() => Ok(Command::Get {
                keys: keys.iter().map(|k| k.to_string()).collect(),
            }),
            [verb @ ("set" | "add"), key, flags, expiration, bytes, rest @ ..] => {
                let command = if *verb == "set" { StoreCommand::Set } else { StoreCommand::Add };
                Ok(Command::Store {
                    command,
                    key: key.to_string(),
                    flags: parse_field(Some(*flags), text)?,
                    expiration: parse_field(Some(*expiration), text)?,
                    bytes: parse_field(Some(*bytes), text)?,
                    noreply: rest.first() == Some(&"noreply"),
                })
            }
            ["delete", key, rest @ ..] => Ok(Command::Delete {
                key: key.to_string(),
                noreply: rest.last() == Some(&"noreply"),
            }),
            ["touch", key, expiration, rest @ ..] => Ok(Command::Touch {
                key: key.to_string(),
                expiration: parse_field(Some(*expiration), text)?,
                noreply: rest.first() == Some(&"noreply"),
            }),
            ["config", "get", name] => Ok(Command::ConfigGet { name: name.to_string() }),
            ["version"] => Ok(Command::Version),
            ["quit"] => Ok(Command::Quit),
            _ => Err(CacheError::Protocol(format!("unknown command: {}", text))),
        }
    }
}

/// Strips a trailing `\r\n` (or bare `\n`).
pub fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn as_text(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line).map_err(|_| CacheError::Protocol("reply is not valid UTF-8".to_string()))
}

fn parse_field<T: FromStr>(field: Option<&str>, line: &str) -> Result<T> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| CacheError::Protocol(format!("malformed line: {}", line)))
}

/// Maps a server error reply (or anything unexpected) to an error.
fn error_reply(line: &[u8]) -> CacheError {
    let text = String::from_utf8_lossy(line);
    if text == "ERROR" {
        CacheError::Protocol("server rejected command".to_string())
    } else if let Some(msg) = text.strip_prefix("CLIENT_ERROR ") {
        CacheError::Protocol(format!("client error: {}", msg))
    } else if let Some(msg) = text.strip_prefix("SERVER_ERROR ") {
        CacheError::Protocol(format!("server error: {}", msg))
    } else {
        CacheError::Protocol(format!("unexpected reply: {}", text))
    }
}
