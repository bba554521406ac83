use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("invalid address entry: {0}")]
    InvalidAddress(String),
    #[error("duplicate address entry: {0}")]
    Duplicate(String),
    #[error("{0} cannot be on both the whitelist and the blacklist")]
    MutualExclusivity(String),
    #[error("no such address entry: {0}")]
    NotFound(String),
}

/// Addresses a Run may and may not scan.
///
/// Entries are single IPs (`10.0.0.5`) or CIDR networks (`10.0.0.0/24`), kept in insertion
/// order. The two lists never share an entry.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    blacklist: Vec<String>,
}

impl Target {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a target from whitelist entries, validating each one.
    pub fn with_whitelist<I, S>(entries: I) -> Result<Self, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut target = Self::new();
        for e in entries {
            target.add_to_whitelist(e.as_ref())?;
        }
        Ok(target)
    }

    pub fn whitelist(&self) -> &[String] {
        &self.whitelist
    }

    pub fn blacklist(&self) -> &[String] {
        &self.blacklist
    }

    pub fn add_to_whitelist(&mut self, entry: &str) -> Result<(), TargetError> {
        let entry = normalize_entry(entry)?;
        if self.whitelist.contains(&entry) {
            return Err(TargetError::Duplicate(entry));
        }
        if self.blacklist.contains(&entry) {
            return Err(TargetError::MutualExclusivity(entry));
        }
        self.whitelist.push(entry);
        Ok(())
    }

    pub fn remove_from_whitelist(&mut self, entry: &str) -> Result<(), TargetError> {
        remove_entry(&mut self.whitelist, entry)
    }

    pub fn add_to_blacklist(&mut self, entry: &str) -> Result<(), TargetError> {
        let entry = normalize_entry(entry)?;
        if self.blacklist.contains(&entry) {
            return Err(TargetError::Duplicate(entry));
        }
        if self.whitelist.contains(&entry) {
            return Err(TargetError::MutualExclusivity(entry));
        }
        self.blacklist.push(entry);
        Ok(())
    }

    pub fn remove_from_blacklist(&mut self, entry: &str) -> Result<(), TargetError> {
        remove_entry(&mut self.blacklist, entry)
    }
}

/// Parse an entry as an IP or CIDR and return its canonical text form.
pub fn normalize_entry(raw: &str) -> Result<String, TargetError> {
    let s = raw.trim();
    if s.contains('/') {
        s.parse::<IpNet>()
            .map(|n| n.to_string())
            .map_err(|_| TargetError::InvalidAddress(raw.to_string()))
    } else {
        s.parse::<IpAddr>()
            .map(|ip| ip.to_string())
            .map_err(|_| TargetError::InvalidAddress(raw.to_string()))
    }
}

fn remove_entry(list: &mut Vec<String>, raw: &str) -> Result<(), TargetError> {
    let entry = normalize_entry(raw).unwrap_or_else(|_| raw.trim().to_string());
    match list.iter().position(|e| *e == entry) {
        Some(idx) => {
            list.remove(idx);
            Ok(())
        }
        None => Err(TargetError::NotFound(raw.to_string())),
    }
}
