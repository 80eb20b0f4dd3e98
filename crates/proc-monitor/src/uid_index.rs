//! uid → process-name index rebuilt from the package manifest.

use std::collections::HashMap;
use std::io::BufRead;

use nix::unistd::Uid;
use trace_common::parsing::manifest;

use crate::config::HideList;

/// Application uids repeat per platform user every `USER_UID_RANGE`; the
/// index is keyed by the remainder.
const USER_UID_RANGE: u32 = 100_000;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UidIndex {
    map: HashMap<u32, Vec<String>>,
}

impl UidIndex {
    /// Rebuild the whole index from a manifest stream. The new map replaces
    /// the old one only once the stream is exhausted, so a lookup never
    /// observes a half-built state. Lines that fail to parse are skipped;
    /// a manifest mid-rewrite just yields a sparse index until the next
    /// close-after-write triggers another rebuild.
    pub fn rebuild<R: BufRead>(&mut self, reader: R, hide_list: &HideList) {
        let mut map: HashMap<u32, Vec<String>> = HashMap::new();
        for line in reader.lines() {
            // unreadable lines are skipped just like unparsable ones
            let Ok(line) = line else { continue };
            let Some(tag) = manifest::parse_package_tag(&line) else {
                continue;
            };
            let Some(name) = tag.name else { continue };
            let processes: Vec<&String> = hide_list
                .iter()
                .filter(|entry| entry.package == name)
                .map(|entry| &entry.process)
                .collect();
            if processes.is_empty() {
                continue;
            }
            for uid in [tag.user_id, tag.shared_user_id].into_iter().flatten() {
                map.entry(uid % USER_UID_RANGE)
                    .or_default()
                    .extend(processes.iter().map(|process| process.to_string()));
            }
        }
        self.map = map;
    }

    /// Hide-list process names bound to this uid, if any.
    pub fn processes(&self, uid: Uid) -> &[String] {
        self.map
            .get(&(uid.as_raw() % USER_UID_RANGE))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
