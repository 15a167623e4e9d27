use std::net::Ipv4Addr;

use crate::crypto::Cipher;
use crate::data::CompressionFraming;
use crate::error::{Error, Result};

/// Prefix of the server push message.
pub const PUSH_REPLY_PREFIX: &str = "PUSH_REPLY";

/// Route pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub network: Ipv4Addr,
    /// Destination mask
    pub mask: Ipv4Addr,
    /// Explicit gateway, if any
    pub gateway: Option<Ipv4Addr>,
}

/// Options the server pushed in `PUSH_REPLY`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReply {
    /// Raw options, in order
    pub options: Vec<String>,
    /// `peer-id`
    pub peer_id: Option<u32>,
    /// Negotiated `cipher`
    pub cipher: Option<Cipher>,
    /// `ping` seconds
    pub ping: Option<u64>,
    /// `ping-restart` seconds
    pub ping_restart: Option<u64>,
    /// `comp-lzo` / `compress` framing
    pub compression: Option<CompressionFraming>,
    /// `ifconfig` address and netmask
    pub ifconfig: Option<(Ipv4Addr, Ipv4Addr)>,
    /// `route-gateway`
    pub route_gateway: Option<Ipv4Addr>,
    /// `route` entries
    pub routes: Vec<Route>,
    /// `dhcp-option DNS` servers
    pub dns_servers: Vec<String>,
    /// `redirect-gateway` present
    pub redirect_gateway: bool,
}

impl PushReply {
    /// Whether `message` is a push reply.
    pub fn matches(message: &str) -> bool {
        message.starts_with(PUSH_REPLY_PREFIX)
    }

    /// Parse `PUSH_REPLY,opt,opt,...`.
    pub fn parse(message: &str) -> Result<Self> {
        let body = message
            .strip_prefix(PUSH_REPLY_PREFIX)
            .ok_or_else(|| Error::control(format!("not a push reply: {}", message)))?;

        let mut reply = PushReply::default();
        for option in body.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            reply.apply(option)?;
            reply.options.push(option.to_string());
        }
        Ok(reply)
    }

    fn apply(&mut self, option: &str) -> Result<()> {
        let mut words = option.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(());
        };
        let args: Vec<&str> = words.collect();
        match (name, args.as_slice()) {
            ("peer-id", [id]) => self.peer_id = Some(parse_number(option, id)?),
            ("cipher", [cipher]) => self.cipher = Some(cipher.parse()?),
            ("ping", [secs]) => self.ping = Some(parse_number(option, secs)?),
            ("ping-restart", [secs]) => self.ping_restart = Some(parse_number(option, secs)?),
            ("comp-lzo", _) => self.compression = Some(CompressionFraming::CompLzo),
            ("compress", []) => self.compression = Some(CompressionFraming::Compress),
            ("compress", ["stub-v2"]) => self.compression = Some(CompressionFraming::CompressV2),
            ("compress", ["stub"]) => self.compression = Some(CompressionFraming::Compress),
            ("ifconfig", [address, mask]) => {
                self.ifconfig = Some((parse_address(option, address)?, parse_address(option, mask)?));
            }
            ("route-gateway", [gateway]) => self.route_gateway = Some(parse_address(option, gateway)?),
            ("route", [network, rest @ ..]) => {
                let mask = match rest.first() {
                    Some(mask) => parse_address(option, mask)?,
                    None => Ipv4Addr::BROADCAST,
                };
                let gateway = match rest.get(1) {
                    Some(&"vpn_gateway") | None => None,
                    Some(gateway) => Some(parse_address(option, gateway)?),
                };
                self.routes.push(Route {
                    network: parse_address(option, network)?,
                    mask,
                    gateway,
                });
            }
            ("dhcp-option", ["DNS", server]) => self.dns_servers.push(server.to_string()),
            ("redirect-gateway", _) => self.redirect_gateway = true,
            _ => {}
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(option: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::control(format!("invalid pushed option '{}'", option)))
}

fn parse_address(option: &str, value: &str) -> Result<Ipv4Addr> {
    parse_number(option, value)
}
