use super::ipv4;
use super::scramble;

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashSet;
use std::error::Error;
use std::fs::File;
use std::io;
use std::io::BufReader;

// CONFIGURATION
//
// The immutable run configuration the engine consumes: interface MTU, the
// dense per-destination-port aggressivity table, the address lists that
// exempt flows from mangling, single-plugin test mode, and the debug
// level. The struct is built programmatically or loaded from a JSON spec
// file.
//
//   Config - runtime configuration view
//   Config::from_file(path) - parse and validate a JSON spec
//   PACKET_DEBUG - debug level at which plugin contract errors are fatal

// At this debug level a plugin contract violation aborts the process
// instead of dropping the offending packet (plugin authoring mode).
pub const PACKET_DEBUG: u8 = 6;

pub struct Config {
    pub mtu: u32,
    pub portconf: Vec<u16>,
    pub blacklist: Option<HashSet<ipv4::Address>>,
    pub whitelist: Option<HashSet<ipv4::Address>>,
    pub only_plugin: Option<String>,
    pub debug_level: u8,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mtu: 1500,
            portconf: vec![0; 65536],
            blacklist: None,
            whitelist: None,
            only_plugin: None,
            debug_level: 0,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Config, Box<dyn Error>> {
        let file = File::open(path)?;
        let spec: ConfSpec = serde_json::from_reader(BufReader::new(file))?;
        realize_spec(spec)
    }

    pub fn aggressivity(&self, dport: u16) -> u16 {
        self.portconf[dport as usize]
    }
}

// This is the on-disk configuration format

#[derive(Serialize, Deserialize)]
struct ConfSpec {
    mtu: u32,
    #[serde(default)]
    debug_level: u8,
    #[serde(default)]
    only_plugin: Option<String>,
    #[serde(default)]
    blacklist: Vec<String>,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    port_rules: Vec<PortRule>,
}

#[derive(Serialize, Deserialize)]
struct PortRule {
    port_min: u16,
    port_max: u16,
    aggressivity: Vec<String>,
}

fn invalid(msg: String) -> Box<dyn Error> {
    Box::new(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn parse_addrs(list: &[String]) -> Result<HashSet<ipv4::Address>, Box<dyn Error>> {
    let mut set = HashSet::new();
    for s in list {
        match s.parse::<std::net::Ipv4Addr>() {
            Ok(addr) => { set.insert(u32::from(addr)); }
            Err(_) => return Err(invalid(format!("bad IPv4 address: {}", s))),
        }
    }
    Ok(set)
}

fn realize_spec(spec: ConfSpec) -> Result<Config, Box<dyn Error>> {
    if spec.mtu < 68 {
        return Err(invalid(format!("mtu {} below the IPv4 minimum", spec.mtu)));
    }
    if !spec.blacklist.is_empty() && !spec.whitelist.is_empty() {
        return Err(invalid("blacklist and whitelist are mutually exclusive".to_string()));
    }
    let mut conf = Config {
        mtu: spec.mtu,
        debug_level: spec.debug_level,
        only_plugin: spec.only_plugin,
        ..Config::default()
    };
    if !spec.blacklist.is_empty() {
        conf.blacklist = Some(parse_addrs(&spec.blacklist)?);
    }
    if !spec.whitelist.is_empty() {
        conf.whitelist = Some(parse_addrs(&spec.whitelist)?);
    }
    for rule in &spec.port_rules {
        if rule.port_min > rule.port_max {
            return Err(invalid(format!("port range {}..{} is inverted",
                                       rule.port_min, rule.port_max)));
        }
        let keywords = rule.aggressivity.join(",");
        let mask = match scramble::parse_aggressivity_list(&keywords) {
            Some(mask) => mask,
            None => return Err(invalid(format!("bad aggressivity in [{}]", keywords))),
        };
        for port in rule.port_min..=rule.port_max {
            conf.portconf[port as usize] |= mask;
        }
    }
    Ok(conf)
}

#[cfg(test)]
mod selftest {
    use super::*;

    fn realize(json: &str) -> Result<Config, Box<dyn Error>> {
        realize_spec(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn spec_roundtrip() {
        let conf = realize(r#"{
            "mtu": 1500,
            "debug_level": 2,
            "blacklist": ["8.8.8.8", "1.1.1.1"],
            "port_rules": [
                {"port_min": 80, "port_max": 81, "aggressivity": ["COMMON", "PACKETS10PEEK"]},
                {"port_min": 443, "port_max": 443, "aggressivity": ["HEAVY"]}
            ]
        }"#).unwrap();
        assert_eq!(conf.mtu, 1500);
        assert_eq!(conf.debug_level, 2);
        assert!(conf.blacklist.as_ref().unwrap().contains(&ipv4::pton("8.8.8.8")));
        assert!(conf.whitelist.is_none());
        assert_eq!(conf.aggressivity(80),
                   scramble::AGG_COMMON | scramble::AGG_PACKETS10PEEK);
        assert_eq!(conf.aggressivity(81),
                   scramble::AGG_COMMON | scramble::AGG_PACKETS10PEEK);
        assert_eq!(conf.aggressivity(443), scramble::AGG_HEAVY);
        assert_eq!(conf.aggressivity(8080), 0);
    }

    #[test]
    fn spec_rejects() {
        assert!(realize(r#"{"mtu": 20}"#).is_err());
        assert!(realize(r#"{"mtu": 1500,
            "blacklist": ["8.8.8.8"], "whitelist": ["1.1.1.1"]}"#).is_err());
        assert!(realize(r#"{"mtu": 1500,
            "blacklist": ["not-an-address"]}"#).is_err());
        assert!(realize(r#"{"mtu": 1500,
            "port_rules": [{"port_min": 90, "port_max": 80, "aggressivity": ["RARE"]}]}"#).is_err());
        assert!(realize(r#"{"mtu": 1500,
            "port_rules": [{"port_min": 80, "port_max": 80, "aggressivity": ["SOMETIMES"]}]}"#).is_err());
    }
}
