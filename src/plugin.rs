use super::conf::Config;
use super::packet::{Judge, Packet};
use super::scramble;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use regex::Regex;
use std::error::Error;
use std::fs;
use std::io;

// PLUGIN POOL
//
// Mangling plugins produce the decoy packets injected around real
// traffic. A plugin is an implementation of the Plugin trait registered
// in a compiled-in registry; the pool resolves the user's enabler list
// against that registry, validates each implementation, and keeps the
// accepted set in enabler order.
//
//   Plugin - the contract a mangling plugin implements
//   Constructor, Registry - compiled-in name -> constructor table
//   PluginTrack - an accepted plugin + its granted scrambles
//   PluginPool::load(&Config, enabler_text, registry) - build the pool
//   PluginPool::load_file(&Config, path, registry) - same, from a file
//   random_damage(rng, usable) -> Judge - helper for plugin authors
//
// Enabler lines have the form `name,SCRAMBLE[,SCRAMBLE...]`; `#` starts a
// comment. With Config.only_plugin set the enabler is ignored, the one
// named plugin is loaded, and its frequency is forced to ALWAYS.

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub trait Plugin {
    // Must equal ENGINE_VERSION; the contract is not stable across versions.
    fn version(&self) -> &'static str;
    fn plugin_name(&self) -> &'static str;
    fn hack_name(&self) -> &'static str;
    // Scramble classes this plugin knows how to produce packets for.
    fn supported_scrambles(&self) -> u8;
    // Aggressivity mask consulted when the user's port table is silent.
    fn frequency(&self) -> u16;
    // Ask for the original packet to be dropped after injection.
    fn remove_orig(&self) -> bool { false }
    // Called once at load time with the scrambles the enabler granted.
    fn init(&mut self, enabled_scrambles: u8) -> bool;
    // Does this packet interest the plugin at all?
    fn condition(&self, pkt: &Packet, avail: u8) -> bool;
    // Produce decoys. Every returned packet must have judge, choosable
    // scramble, proto, position and chain assigned.
    fn create_hack(&mut self, pkt: &Packet, avail: u8, rng: &mut StdRng) -> Vec<Packet>;
}

pub type Constructor = fn() -> Box<dyn Plugin>;
pub type Registry<'a> = &'a [(&'a str, Constructor)];

pub struct PluginTrack {
    pub plugin: Box<dyn Plugin>,
    pub enabled_scrambles: u8,
    force_always: bool,
}

impl PluginTrack {
    pub fn frequency(&self) -> u16 {
        if self.force_always { scramble::AGG_ALWAYS } else { self.plugin.frequency() }
    }
}

pub struct PluginPool {
    tracks: Vec<PluginTrack>,
    enabled_union: u8,
}

static ENABLER_LINE: Lazy<Regex> = Lazy::new
    (|| Regex::new(r"^\s*([\w.-]+)\s*,\s*(\S.*)$").unwrap());

fn invalid(msg: String) -> Box<dyn Error> {
    Box::new(io::Error::new(io::ErrorKind::InvalidData, msg))
}

impl PluginPool {

    pub fn load(conf: &Config, enabler: &str, registry: Registry)
                -> Result<PluginPool, Box<dyn Error>> {
        let mut pool = PluginPool { tracks: Vec::new(), enabled_union: 0 };
        match &conf.only_plugin {
            Some(spec) => {
                let (name, scrambles) = parse_entry(spec)
                    .ok_or_else(|| invalid(format!("bad only-plugin spec: {}", spec)))?;
                pool.import(&name, scrambles, true, registry)?;
            }
            None => {
                for (lineno, line) in enabler.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') { continue; }
                    let (name, scrambles) = parse_entry(line).ok_or_else(
                        || invalid(format!("enabler line {}: [{}]", lineno + 1, line)))?;
                    pool.import(&name, scrambles, false, registry)?;
                }
            }
        }
        if pool.tracks.is_empty() {
            return Err(invalid("loaded correctly 0 plugins".to_string()));
        }
        log::debug!("loaded correctly {} plugins", pool.tracks.len());
        Ok(pool)
    }

    pub fn load_file(conf: &Config, path: &str, registry: Registry)
                     -> Result<PluginPool, Box<dyn Error>> {
        PluginPool::load(conf, &fs::read_to_string(path)?, registry)
    }

    fn import(&mut self, name: &str, enabled: u8, force_always: bool,
              registry: Registry) -> Result<(), Box<dyn Error>> {
        let ctor = registry.iter().find(|&&(n, _)| n == name)
            .map(|&(_, ctor)| ctor)
            .ok_or_else(|| invalid(format!("no such plugin: {}", name)))?;
        let mut plugin = ctor();
        if plugin.version() != ENGINE_VERSION {
            return Err(invalid(format!("plugin {} speaks version {}, engine is {}",
                                       name, plugin.version(), ENGINE_VERSION)));
        }
        if plugin.plugin_name().is_empty() {
            return Err(invalid(format!("plugin {} reports an empty name", name)));
        }
        let supported = plugin.supported_scrambles();
        if supported == 0 || supported & enabled == 0 {
            log::warn!("skipping {}: grants [{}] do not meet supported [{}]",
                       name, scramble::scramble_names(enabled),
                       scramble::scramble_names(supported));
            return Ok(());
        }
        if !plugin.init(enabled) {
            log::warn!("skipping {}: init refused grants [{}]",
                       name, scramble::scramble_names(enabled));
            return Ok(());
        }
        log::debug!("import of {}: [{}] accepted", name, scramble::scramble_names(enabled));
        self.enabled_union |= supported & enabled;
        self.tracks.push(PluginTrack { plugin, enabled_scrambles: enabled, force_always });
        Ok(())
    }

    pub fn len(&self) -> usize { self.tracks.len() }

    // Union of every accepted plugin's granted-and-supported scrambles.
    pub fn enabled_union(&self) -> u8 { self.enabled_union }

    pub fn tracks(&self) -> &[PluginTrack] { &self.tracks }

    pub fn track_mut(&mut self, i: usize) -> &mut PluginTrack { &mut self.tracks[i] }
}

fn parse_entry(line: &str) -> Option<(String, u8)> {
    let cap = ENABLER_LINE.captures(line)?;
    let scrambles = scramble::parse_scramble_list(&cap[2]);
    if scrambles == 0 { return None; }
    Some((cap[1].to_string(), scrambles))
}

// Pick uniformly among the damaging judges a scramble mask allows. The
// neutral INNOCENT class is deliberately not offered: a decoy the peer
// accepts would poison the real stream, so only a plugin that forges
// genuinely harmless packets may assign it explicitly.
pub fn random_damage(rng: &mut StdRng, usable: u8) -> Judge {
    let mut candidates = Vec::with_capacity(3);
    if usable & scramble::SCRAMBLE_TTL != 0 { candidates.push(Judge::Prescription); }
    if usable & scramble::SCRAMBLE_MALFORMED != 0 { candidates.push(Judge::Malformed); }
    if usable & scramble::SCRAMBLE_CHECKSUM != 0 { candidates.push(Judge::Guilty); }
    *candidates.choose(rng).unwrap_or(&Judge::Guilty)
}
